//! Stage observation hooks.
//!
//! The chain executor reports every stage attempt to a [`StageObserver`],
//! once before the stage runs and once after it produced its outcome. Hosts
//! use this to mark which handler is active, for diagnostics.

use relay_core::RequestId;

/// Where a stage attempt happens.
#[derive(Debug, Clone, Copy)]
pub struct StagePosition<'a> {
    /// Request being dispatched
    pub request_id: RequestId,
    /// Chain the stage belongs to
    pub chain: &'a str,
    /// Zero-based position of the stage in its chain
    pub index: usize,
    /// Stage name
    pub stage: &'a str,
}

/// Receives before/after notifications for every stage attempt.
///
/// Both methods default to no-ops.
pub trait StageObserver: Send + Sync {
    /// The stage is about to run
    fn before_stage(&self, _position: &StagePosition<'_>) {}

    /// The stage finished; `outcome` is `reject`, `continue`, `respond`,
    /// `error`, or `panicked`
    fn after_stage(&self, _position: &StagePosition<'_>, _outcome: &'static str) {}
}

/// Logs stage progress through `tracing`.
///
/// In debug mode progress is logged at `info`, otherwise at `trace`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver {
    debug: bool,
}

impl TracingObserver {
    /// Create an observer; `debug` raises stage logging to `info`
    #[must_use]
    pub const fn new(debug: bool) -> Self {
        Self { debug }
    }
}

impl StageObserver for TracingObserver {
    fn before_stage(&self, position: &StagePosition<'_>) {
        if self.debug {
            tracing::info!(
                chain = position.chain,
                stage = position.stage,
                index = position.index,
                "Running stage"
            );
        } else {
            tracing::trace!(
                chain = position.chain,
                stage = position.stage,
                index = position.index,
                "Running stage"
            );
        }
    }

    fn after_stage(&self, position: &StagePosition<'_>, outcome: &'static str) {
        if self.debug {
            tracing::info!(
                chain = position.chain,
                stage = position.stage,
                index = position.index,
                outcome,
                "Stage finished"
            );
        } else {
            tracing::trace!(
                chain = position.chain,
                stage = position.stage,
                index = position.index,
                outcome,
                "Stage finished"
            );
        }
    }
}
