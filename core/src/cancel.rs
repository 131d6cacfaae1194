//! Cooperative cancellation tied to the client connection.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Write-once-true flag set when the client connection closes.
///
/// Written by the transport's close notifier, read by the runner between
/// chains. Cancellation is advisory: a stage that is already running is never
/// interrupted.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag {
    cancelled: Arc<AtomicBool>,
}

impl CancellationFlag {
    /// Create a flag that is not yet cancelled
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the request as cancelled.
    ///
    /// Returns `true` if this call flipped the flag, `false` if it was already set.
    pub fn cancel(&self) -> bool {
        !self.cancelled.swap(true, Ordering::AcqRel)
    }

    /// Whether the request has been cancelled
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_is_write_once() {
        let flag = CancellationFlag::new();
        assert!(!flag.is_cancelled());

        assert!(flag.cancel());
        assert!(!flag.cancel());
        assert!(flag.is_cancelled());
    }

    #[test]
    fn test_clones_observe_cancellation() {
        let flag = CancellationFlag::new();
        let observer = flag.clone();
        flag.cancel();
        assert!(observer.is_cancelled());
    }
}
