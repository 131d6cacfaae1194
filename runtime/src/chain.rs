//! Chain instances and the chain executor.
//!
//! A [`ChainInstance`] is created for every (request, candidate) pair. It owns
//! that chain's context map and response accumulator, so nothing a rejected
//! chain wrote can reach the next candidate.
//!
//! [`ChainExecutor`] drives an instance stage by stage:
//!
//! 1. Resolve the stage (type references go through the instantiator)
//! 2. Fire `before_stage`
//! 3. Run the stage, catching panics
//! 4. Fire `after_stage`
//! 5. Stop on `Reject`/`Respond`/error, merge the delta on `Continue`

use crate::metrics::DispatchMetrics;
use crate::observer::{StageObserver, StagePosition};
use futures::FutureExt;
use relay_core::{
    ChainDefinition, Context, DispatchError, Instantiate, Request, RequestId, ResourceScope,
    Response, Stage, StageContext, StageError, StageFuture, StageOutcome,
};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::Span;

/// The request-scoped context shared by every chain of one request.
///
/// Re-entered by every continuation of the request: chain runs, delayed
/// sends, and error recovery all run inside `span`.
#[derive(Debug, Clone)]
pub struct RequestScope {
    id: RequestId,
    request: Arc<Request>,
    resources: ResourceScope,
    span: Span,
    contribution: Context,
}

impl RequestScope {
    /// Create the scope for one request
    #[must_use]
    pub fn new(id: RequestId, request: Arc<Request>, resources: ResourceScope, span: Span) -> Self {
        Self {
            id,
            request,
            resources,
            span,
            contribution: Context::new(),
        }
    }

    /// Add a value every chain of this request sees on its first run
    #[must_use]
    pub fn with_value<T: Clone + Send + Sync + 'static>(mut self, value: T) -> Self {
        self.contribution.insert(value);
        self
    }

    /// Request correlation id
    #[must_use]
    pub const fn id(&self) -> RequestId {
        self.id
    }

    /// The inbound request
    #[must_use]
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// The request's resource scope
    #[must_use]
    pub const fn resources(&self) -> &ResourceScope {
        &self.resources
    }

    /// The request span
    #[must_use]
    pub const fn span(&self) -> &Span {
        &self.span
    }
}

/// One candidate chain running for one request.
#[derive(Debug)]
pub struct ChainInstance {
    definition: Arc<ChainDefinition>,
    ctx: StageContext,
    contribution: Option<Context>,
    position: usize,
}

impl ChainInstance {
    /// Create a fresh instance; nothing runs until it is executed
    #[must_use]
    pub fn new(definition: Arc<ChainDefinition>, scope: &RequestScope) -> Self {
        let ctx = StageContext::new(
            scope.id,
            Arc::clone(&scope.request),
            definition.name_arc(),
            scope.resources.clone(),
        );
        Self {
            definition,
            ctx,
            contribution: Some(scope.contribution.clone()),
            position: 0,
        }
    }

    /// The chain being run
    #[must_use]
    pub const fn definition(&self) -> &Arc<ChainDefinition> {
        &self.definition
    }

    /// The instance's stage context
    #[must_use]
    pub const fn context(&self) -> &StageContext {
        &self.ctx
    }

    /// Whether the request-scoped contribution has not been injected yet
    #[must_use]
    pub const fn is_first_run(&self) -> bool {
        self.contribution.is_some()
    }

    /// Number of stages that already produced an outcome
    #[must_use]
    pub const fn stages_run(&self) -> usize {
        self.position
    }

    /// Inject the request-scoped values on the first run only
    fn enter(&mut self) {
        if let Some(contribution) = self.contribution.take() {
            let request_id = self.ctx.request_id();
            let resources = self.ctx.resources().clone();
            self.ctx.insert(request_id);
            self.ctx.insert(resources);
            self.ctx.extend(contribution);
        }
    }
}

/// How a chain ended when it did not fail.
#[derive(Debug)]
pub enum ChainResult {
    /// A stage rejected; the instance's state is discarded
    Rejected,
    /// The chain finished with this accumulated response
    Completed(Response),
}

/// Drives chain instances stage by stage.
#[derive(Clone)]
pub struct ChainExecutor {
    instantiator: Arc<dyn Instantiate>,
    observer: Arc<dyn StageObserver>,
}

impl ChainExecutor {
    /// Create an executor
    #[must_use]
    pub fn new(instantiator: Arc<dyn Instantiate>, observer: Arc<dyn StageObserver>) -> Self {
        Self {
            instantiator,
            observer,
        }
    }

    /// Run the instance from its current position until it stops.
    ///
    /// Running an instance that already stopped completes immediately with
    /// its (possibly empty) accumulator; no stage is ever run twice.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::Instantiate`] if a type reference cannot be resolved
    /// - [`DispatchError::Stage`] for uncaught stage errors
    /// - [`DispatchError::Panicked`] if a stage panicked
    /// - [`DispatchError::Fatal`] for fatal stage errors
    pub async fn run(&self, instance: &mut ChainInstance) -> Result<ChainResult, DispatchError> {
        instance.enter();
        let definition = Arc::clone(&instance.definition);
        Span::current().record("chain", definition.name());

        while instance.position < definition.len() {
            let index = instance.position;
            let stage = definition.stages()[index]
                .resolve(self.instantiator.as_ref())
                .map_err(|source| DispatchError::Instantiate {
                    chain: definition.name_arc(),
                    source,
                })?;

            let position = StagePosition {
                request_id: instance.ctx.request_id(),
                chain: definition.name(),
                index,
                stage: stage.name(),
            };

            instance.ctx.set_stage_index(index);
            self.observer.before_stage(&position);
            // A stage can panic while building its future or while it is polled.
            let result = match start_stage(stage.as_ref(), &mut instance.ctx) {
                Ok(future) => AssertUnwindSafe(future).catch_unwind().await,
                Err(payload) => Err(payload),
            };
            instance.position += 1;
            DispatchMetrics::record_stage();

            let outcome = match result {
                Ok(outcome) => outcome,
                Err(payload) => {
                    self.observer.after_stage(&position, "panicked");
                    return Err(DispatchError::Panicked {
                        chain: definition.name_arc(),
                        stage: stage.name().to_string(),
                        message: panic_message(payload.as_ref()),
                    });
                },
            };

            match outcome {
                Ok(StageOutcome::Reject) => {
                    self.observer.after_stage(&position, "reject");
                    DispatchMetrics::record_rejection();
                    return Ok(ChainResult::Rejected);
                },
                Ok(StageOutcome::Continue(delta)) => {
                    self.observer.after_stage(&position, "continue");
                    instance.ctx.extend(delta);
                },
                Ok(StageOutcome::Respond(delta)) => {
                    self.observer.after_stage(&position, "respond");
                    instance.ctx.response_mut().merge(delta);
                    instance.position = definition.len();
                    return Ok(ChainResult::Completed(instance.ctx.take_response()));
                },
                Err(StageError::Response { status, message }) => {
                    self.observer.after_stage(&position, "respond");
                    tracing::debug!(%status, %message, "Stage answered with an application error");
                    let response = instance.ctx.response_mut();
                    response.set_status(status);
                    if !message.is_empty() {
                        response.insert_header(
                            http::header::CONTENT_TYPE,
                            http::HeaderValue::from_static("text/plain; charset=utf-8"),
                        );
                        response.set_body(message);
                    }
                    instance.position = definition.len();
                    return Ok(ChainResult::Completed(instance.ctx.take_response()));
                },
                Err(StageError::Failed(source)) => {
                    self.observer.after_stage(&position, "error");
                    return Err(DispatchError::Stage {
                        chain: definition.name_arc(),
                        stage: stage.name().to_string(),
                        source,
                    });
                },
                Err(StageError::Fatal(message)) => {
                    self.observer.after_stage(&position, "error");
                    return Err(DispatchError::Fatal {
                        chain: definition.name_arc(),
                        stage: stage.name().to_string(),
                        message,
                    });
                },
            }
        }

        Ok(ChainResult::Completed(instance.ctx.take_response()))
    }
}

impl std::fmt::Debug for ChainExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainExecutor").finish_non_exhaustive()
    }
}

/// Build the stage's future, catching a panic raised before it is returned.
fn start_stage<'a>(
    stage: &'a dyn Stage,
    ctx: &'a mut StageContext,
) -> std::thread::Result<StageFuture<'a>> {
    // Moving the borrow into a `FnOnce` closure lets the future keep it.
    let call = AssertUnwindSafe((stage, ctx));
    std::panic::catch_unwind(move || {
        let AssertUnwindSafe((stage, ctx)) = { call };
        stage.execute(ctx)
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| (*message).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}
