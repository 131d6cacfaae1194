//! The single final result of running a request through the runner.

use crate::chain::ChainDefinition;
use crate::error::DispatchError;
use crate::response::Response;
use std::sync::Arc;

/// Terminal outcome of a chains-runner execution.
///
/// Produced exactly once per request. Rejections are never terminal; they only
/// move the runner on to the next candidate.
#[derive(Debug)]
pub enum TerminalOutcome {
    /// A chain completed without rejecting
    Delivered {
        /// The chain that handled the request
        chain: Arc<ChainDefinition>,
        /// Merged response accumulator of that chain
        response: Response,
    },

    /// Every candidate rejected (or there were none)
    NoMatch,

    /// A stage failed, or the client went away before any chain accepted
    Failed(DispatchError),
}

impl TerminalOutcome {
    /// Short label for logs and metrics
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Delivered { .. } => "delivered",
            Self::NoMatch => "no_match",
            Self::Failed(DispatchError::Cancelled) => "cancelled",
            Self::Failed(_) => "failed",
        }
    }

    /// Whether a chain accepted the request
    #[must_use]
    pub const fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }

    /// Name of the delivering chain
    #[must_use]
    pub fn chain_name(&self) -> Option<&str> {
        match self {
            Self::Delivered { chain, .. } => Some(chain.name()),
            Self::NoMatch | Self::Failed(_) => None,
        }
    }
}
