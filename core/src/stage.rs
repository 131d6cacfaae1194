//! The stage abstraction: one unit of work inside a chain.
//!
//! A stage inspects the request, may write to the chain's context and response
//! accumulator, may register resources, and then decides how the chain goes on:
//!
//! - [`StageOutcome::Reject`]: this chain does not handle the request
//! - [`StageOutcome::Continue`]: run the next stage with extra context
//! - [`StageOutcome::Respond`]: stop here; the chain produced its response
//!
//! Stages may finish synchronously (return a ready future) or suspend by
//! awaiting. While a stage is suspended no other stage of its chain runs.

use crate::context::{Context, StageContext};
use crate::response::Response;
use http::StatusCode;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Future returned by [`Stage::execute`].
pub type StageFuture<'a> =
    Pin<Box<dyn Future<Output = Result<StageOutcome, StageError>> + Send + 'a>>;

/// One unit of chain logic.
///
/// # Dyn Compatibility
///
/// `execute` returns a boxed future instead of being an `async fn` so that
/// stages can be stored as `Arc<dyn Stage>` inside chain definitions.
///
/// # Example
///
/// ```
/// use relay_core::{Stage, StageContext, StageFuture, StageOutcome, Response, StatusCode};
///
/// struct Teapot;
///
/// impl Stage for Teapot {
///     fn execute<'a>(&'a self, _ctx: &'a mut StageContext) -> StageFuture<'a> {
///         Box::pin(async {
///             Ok(StageOutcome::respond(Response::with_status(StatusCode::IM_A_TEAPOT)))
///         })
///     }
/// }
/// ```
pub trait Stage: Send + Sync {
    /// Name used in logs and observer callbacks
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Run the stage against the chain's context.
    ///
    /// # Errors
    ///
    /// - [`StageError::Response`] stops the chain with that status, like `Respond`
    /// - [`StageError::Failed`] aborts dispatch and enters error recovery
    /// - [`StageError::Fatal`] aborts dispatch without recovery
    fn execute<'a>(&'a self, ctx: &'a mut StageContext) -> StageFuture<'a>;
}

/// How a stage wants its chain to proceed.
#[derive(Debug)]
pub enum StageOutcome {
    /// This chain is not a match; discard its state and try the next candidate
    Reject,

    /// Proceed to the next stage with additional context
    Continue(Context),

    /// Stop the chain successfully; the delta is merged into the accumulator
    Respond(Response),
}

impl StageOutcome {
    /// Continue without adding context
    #[must_use]
    pub fn next() -> Self {
        Self::Continue(Context::new())
    }

    /// Continue, handing a single value to later stages
    #[must_use]
    pub fn next_with<T: Clone + Send + Sync + 'static>(value: T) -> Self {
        let mut delta = Context::new();
        delta.insert(value);
        Self::Continue(delta)
    }

    /// Respond with the given response delta
    #[must_use]
    pub const fn respond(response: Response) -> Self {
        Self::Respond(response)
    }

    /// Respond with only a status
    #[must_use]
    pub fn status(status: StatusCode) -> Self {
        Self::Respond(Response::with_status(status))
    }

    /// Whether this outcome rejects the chain
    #[must_use]
    pub const fn is_reject(&self) -> bool {
        matches!(self, Self::Reject)
    }

    /// Short label for logs and metrics
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Reject => "reject",
            Self::Continue(_) => "continue",
            Self::Respond(_) => "respond",
        }
    }
}

/// Failures a stage can raise.
#[derive(Error, Debug)]
pub enum StageError {
    /// Application error meant to shape the response.
    ///
    /// Short-circuits the chain exactly like `Respond` and never enters error
    /// recovery.
    #[error("{status}: {message}")]
    Response {
        /// Status to respond with
        status: StatusCode,
        /// Message written to the response body
        message: String,
    },

    /// Uncaught error; aborts candidate iteration and enters error recovery
    #[error(transparent)]
    Failed(#[from] anyhow::Error),

    /// Unrecoverable condition; propagated to the hosting process, never recovered
    #[error("fatal: {0}")]
    Fatal(String),
}

impl StageError {
    /// Application error with a status and message
    #[must_use]
    pub fn respond(status: StatusCode, message: impl Into<String>) -> Self {
        Self::Response {
            status,
            message: message.into(),
        }
    }

    /// Uncaught error from anything convertible into `anyhow::Error`
    #[must_use]
    pub fn failed<E>(error: E) -> Self
    where
        E: Into<anyhow::Error>,
    {
        Self::Failed(error.into())
    }

    /// Fatal, process-level failure
    #[must_use]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }
}

/// Create a stage from a synchronous closure.
///
/// # Example
///
/// ```
/// use relay_core::{StageOutcome, stage::from_fn};
///
/// let only_get = from_fn("only-get", |ctx| {
///     if ctx.request().method() == http::Method::GET {
///         Ok(StageOutcome::next())
///     } else {
///         Ok(StageOutcome::Reject)
///     }
/// });
/// ```
pub fn from_fn<F>(name: impl Into<String>, f: F) -> FnStage<F>
where
    F: Fn(&mut StageContext) -> Result<StageOutcome, StageError> + Send + Sync,
{
    FnStage {
        name: name.into(),
        f,
    }
}

/// Stage backed by a synchronous closure. Created by [`from_fn`].
pub struct FnStage<F> {
    name: String,
    f: F,
}

impl<F> Stage for FnStage<F>
where
    F: Fn(&mut StageContext) -> Result<StageOutcome, StageError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    /// The closure runs when the future is first polled, not when it is created.
    fn execute<'a>(&'a self, ctx: &'a mut StageContext) -> StageFuture<'a> {
        Box::pin(async move { (self.f)(ctx) })
    }
}

impl<F> fmt::Debug for FnStage<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnStage").field("name", &self.name).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Request, RequestId};
    use crate::resource::ResourceScope;
    use bytes::Bytes;
    use futures::future;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn context() -> StageContext {
        StageContext::new(
            RequestId::new(),
            Arc::new(Request::new(Bytes::new())),
            Arc::from("test"),
            ResourceScope::new(),
        )
    }

    #[tokio::test]
    #[allow(clippy::panic)] // Test code can panic
    async fn test_fn_stage_runs_closure() -> Result<(), StageError> {
        let stage = from_fn("mark", |ctx| {
            ctx.response_mut().set_status(StatusCode::OK);
            Ok(StageOutcome::next_with(7_u8))
        });

        let mut ctx = context();
        let outcome = stage.execute(&mut ctx).await?;

        assert_eq!(stage.name(), "mark");
        assert_eq!(outcome.label(), "continue");
        assert_eq!(ctx.response().status(), Some(StatusCode::OK));
        match outcome {
            StageOutcome::Continue(delta) => assert_eq!(delta.get::<u8>(), Some(&7)),
            other => panic!("unexpected outcome {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn test_fn_stage_is_lazy() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let stage = from_fn("lazy", move |_| {
            flag.store(true, Ordering::SeqCst);
            Ok(StageOutcome::next())
        });

        let mut ctx = context();
        let pending = stage.execute(&mut ctx);
        assert!(!ran.load(Ordering::SeqCst));

        drop(pending);
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_default_name_is_type_name() {
        struct Named;
        impl Stage for Named {
            fn execute<'a>(&'a self, _ctx: &'a mut StageContext) -> StageFuture<'a> {
                Box::pin(future::ready(Ok(StageOutcome::Reject)))
            }
        }
        assert!(Named.name().ends_with("Named"));
    }

    #[test]
    fn test_stage_error_display() {
        let err = StageError::respond(StatusCode::FORBIDDEN, "no access");
        assert_eq!(err.to_string(), "403 Forbidden: no access");

        let err = StageError::failed(anyhow::anyhow!("boom"));
        assert_eq!(err.to_string(), "boom");

        let err = StageError::fatal("out of memory");
        assert_eq!(err.to_string(), "fatal: out of memory");
    }
}
