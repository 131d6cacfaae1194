//! One-shot completion signalling.
//!
//! The lifecycle controller holds a [`CompletionGate`]; the caller (typically
//! the transport read loop) holds the matching [`Completion`]. The gate fires
//! at most once: an atomic compare-and-set decides which signal wins, every
//! later signal is ignored.

use crate::dispatcher::Disposition;
use relay_core::DispatchError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::error::Elapsed;

/// Final result of one dispatched request.
pub type DispatchResult = Result<Disposition, DispatchError>;

/// Create a connected gate and completion pair.
#[must_use]
pub fn channel() -> (CompletionGate, Completion) {
    let (sender, receiver) = oneshot::channel();
    let gate = CompletionGate {
        inner: Arc::new(GateInner {
            fired: AtomicBool::new(false),
            sender: Mutex::new(Some(sender)),
        }),
    };
    (gate, Completion { receiver })
}

struct GateInner {
    fired: AtomicBool,
    sender: Mutex<Option<oneshot::Sender<DispatchResult>>>,
}

/// Signalling side; cloneable, fires exactly once.
#[derive(Clone)]
pub struct CompletionGate {
    inner: Arc<GateInner>,
}

impl CompletionGate {
    /// Signal completion.
    ///
    /// Returns `true` if this call fired the gate, `false` if it had already
    /// fired. A receiver that was dropped does not make the signal fail.
    pub fn signal(&self, result: DispatchResult) -> bool {
        if self
            .inner
            .fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::trace!("Completion already signalled, ignoring");
            return false;
        }

        let sender = self
            .inner
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sender) = sender {
            let _ = sender.send(result);
        }
        true
    }

    /// Whether the gate has fired
    #[must_use]
    pub fn is_signalled(&self) -> bool {
        self.inner.fired.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for CompletionGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionGate")
            .field("signalled", &self.is_signalled())
            .finish()
    }
}

/// Waiting side of the completion gate.
#[derive(Debug)]
pub struct Completion {
    receiver: oneshot::Receiver<DispatchResult>,
}

impl Completion {
    /// Wait for the request to be fully handled.
    ///
    /// # Errors
    ///
    /// Returns the dispatch error the lifecycle ended with, or
    /// [`DispatchError::Interrupted`] if the gate was dropped unsignalled.
    pub async fn wait(self) -> DispatchResult {
        self.receiver
            .await
            .unwrap_or(Err(DispatchError::Interrupted))
    }

    /// Wait with a deadline.
    ///
    /// # Errors
    ///
    /// Returns [`Elapsed`] if the request is not done within `timeout`.
    pub async fn wait_timeout(self, timeout: Duration) -> Result<DispatchResult, Elapsed> {
        tokio::time::timeout(timeout, self.wait()).await
    }

    /// Block the current thread until the request is fully handled.
    ///
    /// For callers outside the async runtime.
    ///
    /// # Errors
    ///
    /// Same as [`Completion::wait`].
    ///
    /// # Panics
    ///
    /// Panics if called from within an asynchronous execution context.
    pub fn blocking_wait(self) -> DispatchResult {
        self.receiver
            .blocking_recv()
            .unwrap_or(Err(DispatchError::Interrupted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;
    use tokio_test::{assert_pending, assert_ready};

    #[test]
    fn test_only_first_signal_wins() {
        let (gate, completion) = channel();
        let other = gate.clone();

        assert!(gate.signal(Ok(Disposition::Sent { status: StatusCode::OK })));
        assert!(!other.signal(Ok(Disposition::Abandoned)));
        assert!(other.is_signalled());

        let result = completion.blocking_wait();
        assert!(matches!(result, Ok(Disposition::Sent { status }) if status == StatusCode::OK));
    }

    #[test]
    fn test_wait_pends_until_signalled() {
        let (gate, completion) = channel();
        let mut wait = tokio_test::task::spawn(completion.wait());

        assert_pending!(wait.poll());
        gate.signal(Ok(Disposition::Abandoned));
        assert!(wait.is_woken());
        let result = assert_ready!(wait.poll());
        assert!(matches!(result, Ok(Disposition::Abandoned)));
    }

    #[tokio::test]
    async fn test_dropped_gate_interrupts_waiter() {
        let (gate, completion) = channel();
        drop(gate);

        let result = completion.wait().await;
        assert!(matches!(result, Err(DispatchError::Interrupted)));
    }

    #[tokio::test]
    async fn test_signal_after_receiver_dropped_still_counts() {
        let (gate, completion) = channel();
        drop(completion);
        assert!(gate.signal(Ok(Disposition::Abandoned)));
        assert!(!gate.signal(Ok(Disposition::Abandoned)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_timeout_elapses() {
        let (_gate, completion) = channel();
        let result = completion.wait_timeout(Duration::from_secs(1)).await;
        assert!(result.is_err());
    }
}
