//! Ordered registry of chain definitions.

use crate::chain::ChainDefinition;
use crate::context::Request;
use crate::transport::CandidateSource;
use std::collections::HashSet;
use std::sync::Arc;

/// Chains in registration order, offered to every request.
///
/// Registration order is the candidate order. Chains can be excluded by name,
/// which removes them from every candidate sequence without touching the order
/// of the rest.
///
/// # Example
///
/// ```
/// use relay_core::{CandidateSource, ChainDefinition, ChainRegistry, Request, Bytes};
///
/// let registry = ChainRegistry::new()
///     .register(ChainDefinition::new("static"))
///     .register(ChainDefinition::new("api"))
///     .register(ChainDefinition::new("legacy"))
///     .exclude("legacy");
///
/// let names: Vec<_> = registry
///     .candidates(&Request::new(Bytes::new()))
///     .iter()
///     .map(|chain| chain.name().to_string())
///     .collect();
/// assert_eq!(names, ["static", "api"]);
/// ```
#[derive(Debug, Clone, Default)]
pub struct ChainRegistry {
    chains: Vec<Arc<ChainDefinition>>,
    excluded: HashSet<String>,
}

impl ChainRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chain to the candidate order
    #[must_use]
    pub fn register(mut self, chain: ChainDefinition) -> Self {
        self.chains.push(Arc::new(chain));
        self
    }

    /// Append an already shared chain
    #[must_use]
    pub fn register_arc(mut self, chain: Arc<ChainDefinition>) -> Self {
        self.chains.push(chain);
        self
    }

    /// Exclude the chain with this name from candidate sequences
    #[must_use]
    pub fn exclude(mut self, name: impl Into<String>) -> Self {
        self.excluded.insert(name.into());
        self
    }

    /// Whether a chain with this name is excluded
    #[must_use]
    pub fn is_excluded(&self, name: &str) -> bool {
        self.excluded.contains(name)
    }

    /// Active chains in candidate order
    pub fn active(&self) -> impl Iterator<Item = &Arc<ChainDefinition>> {
        self.chains
            .iter()
            .filter(|chain| !self.excluded.contains(chain.name()))
    }

    /// Number of active chains
    #[must_use]
    pub fn len(&self) -> usize {
        self.active().count()
    }

    /// Whether no chain is active
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.active().next().is_none()
    }

    /// One line per registered chain, for startup logging
    #[must_use]
    pub fn describe(&self) -> Vec<String> {
        self.chains
            .iter()
            .enumerate()
            .map(|(position, chain)| {
                let stages: Vec<_> = chain.stages().iter().map(|item| item.display_name()).collect();
                let marker = if self.excluded.contains(chain.name()) {
                    " (excluded)"
                } else {
                    ""
                };
                format!(
                    "{position}: {name} [{stages}]{marker}",
                    name = chain.name(),
                    stages = stages.join(", ")
                )
            })
            .collect()
    }

    /// Log the registered chains at info level
    pub fn log_summary(&self) {
        tracing::info!(chains = self.len(), "Chain registry ready");
        for line in self.describe() {
            tracing::info!("  {line}");
        }
    }
}

impl CandidateSource for ChainRegistry {
    fn candidates(&self, _request: &Request) -> Vec<Arc<ChainDefinition>> {
        self.active().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::{StageOutcome, from_fn};
    use bytes::Bytes;

    #[test]
    fn test_registration_order_is_candidate_order() {
        let registry = ChainRegistry::new()
            .register(ChainDefinition::new("first"))
            .register(ChainDefinition::new("second"))
            .register(ChainDefinition::new("third"));

        let names: Vec<_> = registry
            .candidates(&Request::new(Bytes::new()))
            .iter()
            .map(|chain| chain.name().to_string())
            .collect();
        assert_eq!(names, ["first", "second", "third"]);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_exclusion_keeps_remaining_order() {
        let registry = ChainRegistry::new()
            .register(ChainDefinition::new("a"))
            .register(ChainDefinition::new("b"))
            .register(ChainDefinition::new("c"))
            .exclude("b");

        let names: Vec<_> = registry.active().map(|chain| chain.name()).collect();
        assert_eq!(names, ["a", "c"]);
        assert!(registry.is_excluded("b"));
    }

    #[test]
    fn test_describe_lists_stages_and_exclusions() {
        let registry = ChainRegistry::new()
            .register(
                ChainDefinition::new("health")
                    .stage(from_fn("check", |_| Ok(StageOutcome::next())))
                    .stage(from_fn("ok", |_| Ok(StageOutcome::next()))),
            )
            .register(ChainDefinition::new("old"))
            .exclude("old");

        let lines = registry.describe();
        assert_eq!(lines, ["0: health [check, ok]", "1: old [] (excluded)"]);
    }

    #[test]
    fn test_empty_registry() {
        let registry = ChainRegistry::new().register(ChainDefinition::new("only")).exclude("only");
        assert!(registry.is_empty());
        assert!(registry.candidates(&Request::new(Bytes::new())).is_empty());
    }
}
