//! Dispatch-level errors.
//!
//! A [`DispatchError`] ends candidate iteration for a request. Everything
//! except [`DispatchError::Fatal`] and [`DispatchError::Cancelled`] is
//! eligible for one round of error recovery.

use crate::instantiate::InstantiateError;
use std::sync::Arc;
use thiserror::Error;

/// Errors that terminate a dispatch.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// The client connection closed before a chain accepted the request
    #[error("dispatch cancelled: client connection closed")]
    Cancelled,

    /// A stage raised an uncaught error
    #[error("stage `{stage}` of chain `{chain}` failed: {source}")]
    Stage {
        /// Chain that was running
        chain: Arc<str>,
        /// Stage that failed
        stage: String,
        /// Underlying error
        #[source]
        source: anyhow::Error,
    },

    /// A stage panicked while running
    #[error("stage `{stage}` of chain `{chain}` panicked: {message}")]
    Panicked {
        /// Chain that was running
        chain: Arc<str>,
        /// Stage that panicked
        stage: String,
        /// Panic payload, when it was a string
        message: String,
    },

    /// A stage listed by type could not be constructed
    #[error("chain `{chain}` could not instantiate a stage: {source}")]
    Instantiate {
        /// Chain that was running
        chain: Arc<str>,
        /// Underlying instantiation failure
        #[source]
        source: InstantiateError,
    },

    /// An application hook failed while shaping the response
    #[error("response decoration failed: {0}")]
    Decorate(#[source] anyhow::Error),

    /// The lifecycle ended without signalling completion (its task was aborted)
    #[error("dispatch interrupted before completion was signalled")]
    Interrupted,

    /// Unrecoverable failure; skips recovery and reaches the host
    #[error("fatal failure in stage `{stage}` of chain `{chain}`: {message}")]
    Fatal {
        /// Chain that was running
        chain: Arc<str>,
        /// Stage that raised it
        stage: String,
        /// Description of the failure
        message: String,
    },
}

impl DispatchError {
    /// Whether the error bypasses recovery and must reach the host
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. })
    }

    /// Whether error recovery may run for this error
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Fatal { .. } | Self::Cancelled | Self::Interrupted)
    }

    /// Chain that raised the error, if one was running
    #[must_use]
    pub fn chain(&self) -> Option<&str> {
        match self {
            Self::Stage { chain, .. }
            | Self::Panicked { chain, .. }
            | Self::Instantiate { chain, .. }
            | Self::Fatal { chain, .. } => Some(&**chain),
            Self::Cancelled | Self::Decorate(_) | Self::Interrupted => None,
        }
    }

    /// Short label for logs and metrics
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::Stage { .. } => "stage",
            Self::Panicked { .. } => "panicked",
            Self::Instantiate { .. } => "instantiate",
            Self::Decorate(_) => "decorate",
            Self::Interrupted => "interrupted",
            Self::Fatal { .. } => "fatal",
        }
    }
}
