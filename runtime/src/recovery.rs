//! The default error chain used while recovering from uncaught errors.
//!
//! Recovery runs an ordinary [`ChainDefinition`]. The error that triggered it
//! is visible to that chain's stages as a [`CaughtError`] context value.

use http::StatusCode;
use http::header::CONTENT_TYPE;
use relay_core::{
    ChainDefinition, DispatchError, HeaderValue, Response, Stage, StageContext, StageFuture,
    StageOutcome,
};
use std::fmt;
use std::sync::Arc;

/// Name of the default error chain.
pub const ERROR_CHAIN_NAME: &str = "error";

/// The uncaught error being recovered from.
#[derive(Debug, Clone)]
pub struct CaughtError(Arc<DispatchError>);

impl CaughtError {
    /// Wrap the error that entered recovery
    #[must_use]
    pub const fn new(error: Arc<DispatchError>) -> Self {
        Self(error)
    }

    /// The underlying error
    #[must_use]
    pub fn error(&self) -> &DispatchError {
        &self.0
    }
}

impl fmt::Display for CaughtError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Answers every caught error with `500 Internal Server Error`.
///
/// With details exposed the body is the error text, as `text/plain`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorResponder {
    expose_details: bool,
}

impl ErrorResponder {
    /// Create the responder
    #[must_use]
    pub const fn new(expose_details: bool) -> Self {
        Self { expose_details }
    }
}

impl Stage for ErrorResponder {
    fn name(&self) -> &str {
        "error-responder"
    }

    fn execute<'a>(&'a self, ctx: &'a mut StageContext) -> StageFuture<'a> {
        let mut response = Response::with_status(StatusCode::INTERNAL_SERVER_ERROR);
        let caught = ctx
            .get::<CaughtError>()
            .filter(|_| self.expose_details);
        if let Some(caught) = caught {
            response.insert_header(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; charset=utf-8"),
            );
            response.set_body(caught.to_string());
        }
        Box::pin(futures::future::ready(Ok(StageOutcome::respond(response))))
    }
}

/// The one-stage error chain used unless the host designates another one.
#[must_use]
pub fn default_error_chain(expose_details: bool) -> ChainDefinition {
    ChainDefinition::new(ERROR_CHAIN_NAME).stage(ErrorResponder::new(expose_details))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use relay_core::{Request, RequestId, ResourceScope, StageError};

    fn context_with(error: DispatchError) -> StageContext {
        let mut ctx = StageContext::new(
            RequestId::new(),
            Arc::new(Request::new(Bytes::new())),
            Arc::from(ERROR_CHAIN_NAME),
            ResourceScope::new(),
        );
        ctx.insert(CaughtError::new(Arc::new(error)));
        ctx
    }

    fn stage_failure() -> DispatchError {
        DispatchError::Stage {
            chain: Arc::from("orders"),
            stage: "load".to_string(),
            source: anyhow::anyhow!("connection refused"),
        }
    }

    #[tokio::test]
    async fn test_hides_details_by_default() -> Result<(), StageError> {
        let mut ctx = context_with(stage_failure());
        let outcome = ErrorResponder::new(false).execute(&mut ctx).await?;

        match outcome {
            StageOutcome::Respond(response) => {
                assert_eq!(response.status(), Some(StatusCode::INTERNAL_SERVER_ERROR));
                assert!(response.body().is_none());
            },
            other => unreachable!("expected a response, got {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_exposes_error_text() -> Result<(), StageError> {
        let mut ctx = context_with(stage_failure());
        let outcome = ErrorResponder::new(true).execute(&mut ctx).await?;

        match outcome {
            StageOutcome::Respond(response) => {
                let body = response.body().map(|b| String::from_utf8_lossy(b).into_owned());
                assert_eq!(
                    body.as_deref(),
                    Some("stage `load` of chain `orders` failed: connection refused")
                );
                assert_eq!(
                    response.headers().get(CONTENT_TYPE),
                    Some(&HeaderValue::from_static("text/plain; charset=utf-8"))
                );
            },
            other => unreachable!("expected a response, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn test_default_chain_shape() {
        let chain = default_error_chain(false);
        assert_eq!(chain.name(), ERROR_CHAIN_NAME);
        assert_eq!(chain.len(), 1);
    }
}
