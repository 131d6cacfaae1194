//! The chain selector: tries candidates in order until one accepts.
//!
//! # Policy
//!
//! - First non-rejecting chain wins, whatever comes after it
//! - A rejection discards that chain's state and moves to the next candidate
//! - An error stops iteration immediately; it never falls through
//! - Cancellation is checked before every candidate, never mid-chain

use crate::chain::{ChainExecutor, ChainInstance, ChainResult, RequestScope};
use relay_core::{CancellationFlag, ChainDefinition, DispatchError, TerminalOutcome};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::Instrument;

/// Runs a candidate sequence to its terminal outcome.
#[derive(Debug, Clone)]
pub struct ChainsRunner {
    executor: ChainExecutor,
}

impl ChainsRunner {
    /// Create a runner around a chain executor
    #[must_use]
    pub const fn new(executor: ChainExecutor) -> Self {
        Self { executor }
    }

    /// The executor used for every candidate
    #[must_use]
    pub const fn executor(&self) -> &ChainExecutor {
        &self.executor
    }

    /// Run the candidates in order and produce the terminal outcome.
    ///
    /// Candidates run strictly one after another: candidate K+1 starts only
    /// after candidate K produced its final stage outcome.
    pub async fn run(
        &self,
        candidates: &[Arc<ChainDefinition>],
        scope: &RequestScope,
        cancellation: &CancellationFlag,
    ) -> TerminalOutcome {
        let mut remaining = candidates.iter();

        loop {
            if cancellation.is_cancelled() {
                tracing::debug!("Connection closed, not trying further candidates");
                return TerminalOutcome::Failed(DispatchError::Cancelled);
            }

            let Some(candidate) = remaining.next() else {
                tracing::debug!(candidates = candidates.len(), "Every candidate rejected");
                return TerminalOutcome::NoMatch;
            };

            let mut instance = ChainInstance::new(Arc::clone(candidate), scope);
            match self.executor.run(&mut instance).await {
                Ok(ChainResult::Rejected) => {
                    tracing::debug!(chain = candidate.name(), "Chain rejected request");
                },
                Ok(ChainResult::Completed(response)) => {
                    tracing::debug!(
                        chain = candidate.name(),
                        status = ?response.status(),
                        "Chain accepted request"
                    );
                    return TerminalOutcome::Delivered {
                        chain: Arc::clone(candidate),
                        response,
                    };
                },
                Err(error) => {
                    tracing::debug!(chain = candidate.name(), %error, "Chain failed");
                    return TerminalOutcome::Failed(error);
                },
            }
        }
    }

    /// Run on a spawned task and hand the outcome to `callback`.
    ///
    /// The callback is invoked exactly once, inside the request span. If the
    /// task is aborted before finishing the callback is dropped uncalled.
    pub fn submit<F>(
        &self,
        candidates: Vec<Arc<ChainDefinition>>,
        scope: RequestScope,
        cancellation: CancellationFlag,
        callback: F,
    ) -> JoinHandle<()>
    where
        F: FnOnce(TerminalOutcome) + Send + 'static,
    {
        let runner = self.clone();
        let span = scope.span().clone();
        tokio::spawn(
            async move {
                let outcome = runner.run(&candidates, &scope, &cancellation).await;
                callback(outcome);
            }
            .instrument(span),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::TracingObserver;
    use bytes::Bytes;
    use http::StatusCode;
    use relay_core::stage::from_fn;
    use relay_core::{Request, RequestId, ResourceScope, StageError, StageOutcome, StageRegistry};
    use std::sync::Mutex;
    use tracing::Span;

    fn runner() -> ChainsRunner {
        ChainsRunner::new(ChainExecutor::new(
            Arc::new(StageRegistry::new()),
            Arc::new(TracingObserver::default()),
        ))
    }

    fn scope() -> RequestScope {
        RequestScope::new(
            RequestId::new(),
            Arc::new(Request::new(Bytes::new())),
            ResourceScope::new(),
            Span::none(),
        )
    }

    fn rejecting(name: &str) -> Arc<ChainDefinition> {
        Arc::new(ChainDefinition::new(name).stage(from_fn("reject", |_| Ok(StageOutcome::Reject))))
    }

    fn responding(name: &str, status: StatusCode) -> Arc<ChainDefinition> {
        Arc::new(
            ChainDefinition::new(name)
                .stage(from_fn("respond", move |_| Ok(StageOutcome::status(status)))),
        )
    }

    #[tokio::test]
    async fn test_first_accepting_candidate_wins() {
        let candidates = vec![
            rejecting("a"),
            responding("b", StatusCode::OK),
            responding("c", StatusCode::CREATED),
        ];

        let outcome = runner().run(&candidates, &scope(), &CancellationFlag::new()).await;

        assert_eq!(outcome.chain_name(), Some("b"));
        match outcome {
            TerminalOutcome::Delivered { response, .. } => {
                assert_eq!(response.status(), Some(StatusCode::OK));
            },
            other => unreachable!("expected delivery, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_empty_sequence_is_no_match() {
        let outcome = runner().run(&[], &scope(), &CancellationFlag::new()).await;
        assert!(matches!(outcome, TerminalOutcome::NoMatch));
    }

    #[tokio::test]
    async fn test_error_does_not_fall_through() {
        let candidates = vec![
            Arc::new(ChainDefinition::new("broken").stage(from_fn("fail", |_| {
                Err(StageError::failed(anyhow::anyhow!("database down")))
            }))),
            responding("never", StatusCode::OK),
        ];

        let outcome = runner().run(&candidates, &scope(), &CancellationFlag::new()).await;
        assert!(matches!(outcome, TerminalOutcome::Failed(DispatchError::Stage { .. })));
    }

    #[tokio::test]
    async fn test_cancelled_before_start_runs_nothing() {
        let ran = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&ran);
        let candidates = vec![Arc::new(ChainDefinition::new("tracked").stage(from_fn(
            "mark",
            move |_| {
                if let Ok(mut ran) = flag.lock() {
                    *ran = true;
                }
                Ok(StageOutcome::status(StatusCode::OK))
            },
        )))];

        let cancellation = CancellationFlag::new();
        cancellation.cancel();
        let outcome = runner().run(&candidates, &scope(), &cancellation).await;

        assert!(matches!(outcome, TerminalOutcome::Failed(DispatchError::Cancelled)));
        assert!(!*ran.lock().unwrap_or_else(std::sync::PoisonError::into_inner));
    }

    #[tokio::test]
    async fn test_cancellation_between_candidates() {
        let cancellation = CancellationFlag::new();
        let trigger = cancellation.clone();
        let candidates = vec![
            Arc::new(ChainDefinition::new("closes").stage(from_fn("reject", move |_| {
                trigger.cancel();
                Ok(StageOutcome::Reject)
            }))),
            responding("too-late", StatusCode::OK),
        ];

        let outcome = runner().run(&candidates, &scope(), &cancellation).await;
        assert!(matches!(outcome, TerminalOutcome::Failed(DispatchError::Cancelled)));
    }

    #[tokio::test]
    async fn test_submit_invokes_callback_once() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let handle = runner().submit(
            vec![responding("only", StatusCode::ACCEPTED)],
            scope(),
            CancellationFlag::new(),
            move |outcome| {
                let _ = tx.send(outcome.label());
            },
        );

        assert!(handle.await.is_ok());
        assert_eq!(rx.await.ok(), Some("delivered"));
    }
}
