//! Tokio-backed [`Timer`].

use relay_core::{Cancellable, Timer, TimerHandle};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;

/// Schedules tasks on the current tokio runtime.
///
/// Must be used from within a runtime context. Cancelling a task that has not
/// fired yet aborts it and drops the task without running it.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioTimer;

impl TokioTimer {
    /// Create a timer
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

struct ScheduledTask(AbortHandle);

impl Cancellable for ScheduledTask {
    fn cancel(&self) {
        self.0.abort();
    }
}

impl Timer for TokioTimer {
    fn schedule(&self, delay: Duration, task: Box<dyn FnOnce() + Send>) -> TimerHandle {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task();
        });
        TimerHandle::new(Arc::new(ScheduledTask(handle.abort_handle())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_task_runs_after_delay() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let _handle = TokioTimer::new().schedule(
            Duration::from_millis(250),
            Box::new(move || flag.store(true, Ordering::SeqCst)),
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!ran.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_task_never_runs() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let handle = TokioTimer::new().schedule(
            Duration::from_millis(250),
            Box::new(move || flag.store(true, Ordering::SeqCst)),
        );

        handle.cancel();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!ran.load(Ordering::SeqCst));
    }
}
