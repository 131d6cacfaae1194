//! The instantiation collaborator.
//!
//! Resolves a [`TypeRef`] into a live stage. [`StageRegistry`] is a plain
//! factory table; hosting applications with their own dependency container
//! implement [`Instantiate`] on top of it instead.

use crate::chain::TypeRef;
use crate::stage::Stage;
use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised while resolving a type reference.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InstantiateError {
    /// No factory is registered for the type
    #[error("no factory registered for `{type_name}`")]
    UnknownType {
        /// Name of the requested type
        type_name: &'static str,
    },

    /// The factory ran but could not build the instance
    #[error("factory for `{type_name}` failed: {reason}")]
    FactoryFailed {
        /// Name of the requested type
        type_name: &'static str,
        /// Why construction failed
        reason: String,
    },
}

/// Object construction collaborator: `instantiate(typeRef) -> instance`.
pub trait Instantiate: Send + Sync {
    /// Construct an instance of the referenced stage type.
    ///
    /// # Errors
    ///
    /// Returns [`InstantiateError`] when the type is unknown or construction fails.
    fn instantiate(&self, type_ref: &TypeRef) -> Result<Arc<dyn Stage>, InstantiateError>;
}

type Factory = Box<dyn Fn() -> Result<Arc<dyn Stage>, String> + Send + Sync>;

/// Factory table keyed by stage type.
///
/// # Example
///
/// ```
/// use relay_core::{Instantiate, StageRegistry, TypeRef, StageContext, StageFuture, StageOutcome, Stage};
///
/// #[derive(Default)]
/// struct Ping;
///
/// impl Stage for Ping {
///     fn execute<'a>(&'a self, _ctx: &'a mut StageContext) -> StageFuture<'a> {
///         Box::pin(async { Ok(StageOutcome::next()) })
///     }
/// }
///
/// let registry = StageRegistry::new().with::<Ping>();
/// assert!(registry.instantiate(&TypeRef::of::<Ping>()).is_ok());
/// ```
#[derive(Default)]
pub struct StageRegistry {
    factories: HashMap<TypeId, Factory>,
}

impl StageRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`StageRegistry::register`]
    #[must_use]
    pub fn with<T: Stage + Default + 'static>(mut self) -> Self {
        self.register::<T>();
        self
    }

    /// Register `T` constructed through `Default`; a new instance per resolution
    pub fn register<T: Stage + Default + 'static>(&mut self) -> &mut Self {
        self.register_with(T::default)
    }

    /// Register `T` with a custom factory
    pub fn register_with<T, F>(&mut self, factory: F) -> &mut Self
    where
        T: Stage + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.factories.insert(
            TypeId::of::<T>(),
            Box::new(move || Ok(Arc::new(factory()) as Arc<dyn Stage>)),
        );
        self
    }

    /// Register `T` with a factory that may fail
    pub fn register_fallible<T, F>(&mut self, factory: F) -> &mut Self
    where
        T: Stage + 'static,
        F: Fn() -> Result<T, String> + Send + Sync + 'static,
    {
        self.factories.insert(
            TypeId::of::<T>(),
            Box::new(move || factory().map(|stage| Arc::new(stage) as Arc<dyn Stage>)),
        );
        self
    }

    /// Whether a factory for `T` is registered
    #[must_use]
    pub fn contains<T: 'static>(&self) -> bool {
        self.factories.contains_key(&TypeId::of::<T>())
    }

    /// Number of registered factories
    #[must_use]
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// Whether the registry is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl Instantiate for StageRegistry {
    fn instantiate(&self, type_ref: &TypeRef) -> Result<Arc<dyn Stage>, InstantiateError> {
        let factory = self
            .factories
            .get(&type_ref.id())
            .ok_or(InstantiateError::UnknownType {
                type_name: type_ref.name(),
            })?;

        factory().map_err(|reason| InstantiateError::FactoryFailed {
            type_name: type_ref.name(),
            reason,
        })
    }
}

impl fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageRegistry")
            .field("factories", &self.factories.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::StageContext;
    use crate::stage::{StageFuture, StageOutcome};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(usize);

    impl Stage for Counter {
        fn execute<'a>(&'a self, _ctx: &'a mut StageContext) -> StageFuture<'a> {
            Box::pin(async { Ok(StageOutcome::next()) })
        }
    }

    #[test]
    fn test_factory_runs_per_resolution() -> Result<(), InstantiateError> {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = StageRegistry::new();
        let counter = Arc::clone(&calls);
        registry.register_with(move || Counter(counter.fetch_add(1, Ordering::SeqCst)));

        registry.instantiate(&TypeRef::of::<Counter>())?;
        registry.instantiate(&TypeRef::of::<Counter>())?;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(registry.contains::<Counter>());
        assert_eq!(registry.len(), 1);
        Ok(())
    }

    #[test]
    fn test_fallible_factory_reports_reason() {
        let mut registry = StageRegistry::new();
        registry.register_fallible::<Counter, _>(|| Err("database unavailable".to_string()));

        let result = registry.instantiate(&TypeRef::of::<Counter>());
        match result {
            Err(InstantiateError::FactoryFailed { reason, .. }) => {
                assert_eq!(reason, "database unavailable");
            },
            Err(other) => unreachable!("unexpected error {other}"),
            Ok(_) => unreachable!("factory should fail"),
        }
    }
}
