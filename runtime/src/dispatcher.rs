//! The request lifecycle controller.
//!
//! One lifecycle runs per request:
//!
//! ```text
//! Dispatching ──Delivered──▶ Sending ────┐
//!      │                                 │
//!      ├──NoMatch──────────▶ NoResponse ─┼──▶ Completed
//!      │                                 │
//!      └──Failed───────────▶ Recovering ─┘
//! ```
//!
//! `Completed` releases the request's resource scope and then signals the
//! completion gate, each exactly once, whichever state led there. Resources
//! are released only after the response was handed to the transport (or
//! abandoned), so stages' resources stay valid while the response is built.
//!
//! # Error Recovery
//!
//! Uncaught errors run the designated error chain once. If that fails too
//! (error, rejection, no response, failed assembly) a fixed-status response is
//! written directly when the connection is still open. Fatal errors skip
//! recovery and are returned to the host.

use crate::chain::{ChainExecutor, ChainInstance, ChainResult, RequestScope};
use crate::completion::{self, Completion, DispatchResult};
use crate::config::DispatcherConfig;
use crate::hooks::{ApplicationHooks, DefaultHooks};
use crate::metrics::DispatchMetrics;
use crate::observer::{StageObserver, TracingObserver};
use crate::recovery::{CaughtError, default_error_chain};
use crate::runner::ChainsRunner;
use crate::timer::TokioTimer;
use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderValue, StatusCode};
use relay_core::{
    CancellationFlag, CandidateSource, ChainDefinition, Connection, DispatchError, Instantiate,
    Request, RequestId, ResourceScope, Response, StageRegistry, TerminalOutcome, Timer,
};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::Instrument;

/// How a request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The accepting chain's response was written immediately
    Sent {
        /// Status written
        status: StatusCode,
    },

    /// The accepting chain's response was written after its delay
    Scheduled {
        /// Status written
        status: StatusCode,
        /// Delay the send waited for
        delay: Duration,
    },

    /// No chain produced a response; the default not-found response was written
    NotFound {
        /// Status written
        status: StatusCode,
    },

    /// An uncaught error was answered by the error chain
    Recovered {
        /// Status written
        status: StatusCode,
    },

    /// Error recovery failed; the fixed fallback status was written directly
    Fallback {
        /// Status written
        status: StatusCode,
    },

    /// Nothing was written: the connection closed first
    Abandoned,
}

impl Disposition {
    /// Status written to the connection, if any
    #[must_use]
    pub const fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Sent { status }
            | Self::Scheduled { status, .. }
            | Self::NotFound { status }
            | Self::Recovered { status }
            | Self::Fallback { status } => Some(*status),
            Self::Abandoned => None,
        }
    }

    /// Short label for logs and metrics
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Sent { .. } => "sent",
            Self::Scheduled { .. } => "scheduled",
            Self::NotFound { .. } => "not_found",
            Self::Recovered { .. } => "recovered",
            Self::Fallback { .. } => "fallback",
            Self::Abandoned => "abandoned",
        }
    }
}

/// States of the request lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// The runner is trying candidates
    Dispatching,
    /// A chain accepted; its response is being assembled and sent
    Sending,
    /// No chain produced a response
    NoResponse,
    /// An uncaught error is being answered by the error chain
    Recovering,
    /// Resources released, completion signalled
    Completed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Dispatching => "dispatching",
            Self::Sending => "sending",
            Self::NoResponse => "no_response",
            Self::Recovering => "recovering",
            Self::Completed => "completed",
        };
        f.write_str(name)
    }
}

struct DispatcherInner {
    candidates: Arc<dyn CandidateSource>,
    runner: ChainsRunner,
    timer: Arc<dyn Timer>,
    hooks: Arc<dyn ApplicationHooks>,
    error_chain: Arc<ChainDefinition>,
    config: DispatcherConfig,
}

/// Dispatches requests through their candidate chains.
///
/// Cheap to clone; clones share collaborators and configuration.
///
/// # Example
///
/// ```ignore
/// let dispatcher = Dispatcher::builder(registry)
///     .config(DispatcherConfig::from_env())
///     .build();
///
/// let completion = dispatcher.dispatch(request, connection);
/// let disposition = completion.wait().await?;
/// ```
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    /// Start building a dispatcher around a candidate source
    #[must_use]
    pub fn builder(candidates: impl CandidateSource + 'static) -> DispatcherBuilder {
        DispatcherBuilder::new(Arc::new(candidates))
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    /// The designated error chain
    #[must_use]
    pub fn error_chain(&self) -> &Arc<ChainDefinition> {
        &self.inner.error_chain
    }

    /// Dispatch on a spawned task and return the one-shot completion gate.
    ///
    /// Must be called from within a tokio runtime.
    pub fn dispatch(&self, request: Request, connection: Arc<dyn Connection>) -> Completion {
        let (gate, completion) = completion::channel();
        let dispatcher = self.clone();
        tokio::spawn(async move {
            let result = dispatcher.handle(request, connection).await;
            gate.signal(result);
        });
        completion
    }

    /// Drive the whole lifecycle of one request inline.
    ///
    /// A [`RequestId`] found in the request extensions is used as the
    /// correlation id; otherwise a fresh one is generated.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Fatal`] when a stage raised a fatal error.
    /// Every other failure is answered through error recovery.
    pub async fn handle(&self, request: Request, connection: Arc<dyn Connection>) -> DispatchResult {
        let request_id = request
            .extensions()
            .get::<RequestId>()
            .copied()
            .unwrap_or_default();
        let span = tracing::info_span!(
            "dispatch",
            request_id = %request_id,
            chain = tracing::field::Empty
        );
        let scope = RequestScope::new(
            request_id,
            Arc::new(request),
            ResourceScope::new(),
            span.clone(),
        );

        RequestLifecycle::new(&self.inner, scope, connection)
            .run()
            .instrument(span)
            .await
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("error_chain", &self.inner.error_chain.name())
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

/// Assembles a [`Dispatcher`]; every collaborator except the candidate source
/// has a default.
pub struct DispatcherBuilder {
    candidates: Arc<dyn CandidateSource>,
    instantiator: Option<Arc<dyn Instantiate>>,
    timer: Option<Arc<dyn Timer>>,
    hooks: Option<Arc<dyn ApplicationHooks>>,
    error_chain: Option<Arc<ChainDefinition>>,
    observer: Option<Arc<dyn StageObserver>>,
    config: DispatcherConfig,
}

impl DispatcherBuilder {
    fn new(candidates: Arc<dyn CandidateSource>) -> Self {
        Self {
            candidates,
            instantiator: None,
            timer: None,
            hooks: None,
            error_chain: None,
            observer: None,
            config: DispatcherConfig::default(),
        }
    }

    /// Instantiation collaborator for stages listed by type (default: empty [`StageRegistry`])
    #[must_use]
    pub fn instantiator(mut self, instantiator: impl Instantiate + 'static) -> Self {
        self.instantiator = Some(Arc::new(instantiator));
        self
    }

    /// Timer for delayed sends (default: [`TokioTimer`])
    #[must_use]
    pub fn timer(mut self, timer: impl Timer + 'static) -> Self {
        self.timer = Some(Arc::new(timer));
        self
    }

    /// Application hooks (default: [`DefaultHooks`])
    #[must_use]
    pub fn hooks(mut self, hooks: impl ApplicationHooks + 'static) -> Self {
        self.hooks = Some(Arc::new(hooks));
        self
    }

    /// Designated error chain (default: a one-stage chain answering 500)
    #[must_use]
    pub fn error_chain(mut self, chain: ChainDefinition) -> Self {
        self.error_chain = Some(Arc::new(chain));
        self
    }

    /// Stage observer (default: [`TracingObserver`])
    #[must_use]
    pub fn observer(mut self, observer: impl StageObserver + 'static) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }

    /// Configuration (default: [`DispatcherConfig::default`])
    #[must_use]
    pub const fn config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the dispatcher
    #[must_use]
    pub fn build(self) -> Dispatcher {
        let config = self.config;
        let instantiator = self
            .instantiator
            .unwrap_or_else(|| Arc::new(StageRegistry::new()));
        let observer = self
            .observer
            .unwrap_or_else(|| Arc::new(TracingObserver::new(config.debug)));
        let error_chain = self
            .error_chain
            .unwrap_or_else(|| Arc::new(default_error_chain(config.shows_error_details())));

        Dispatcher {
            inner: Arc::new(DispatcherInner {
                candidates: self.candidates,
                runner: ChainsRunner::new(ChainExecutor::new(instantiator, observer)),
                timer: self.timer.unwrap_or_else(|| Arc::new(TokioTimer::new())),
                hooks: self.hooks.unwrap_or_else(|| Arc::new(DefaultHooks)),
                error_chain,
                config,
            }),
        }
    }
}

/// Closes the resource scope if the lifecycle ends without completing.
struct ReleaseGuard(ResourceScope);

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        let released = self.0.close();
        if released > 0 {
            tracing::warn!(released, "Lifecycle ended early, released request resources");
        }
    }
}

/// Per-request state machine.
struct RequestLifecycle<'d> {
    dispatcher: &'d DispatcherInner,
    scope: RequestScope,
    connection: Arc<dyn Connection>,
    cancellation: CancellationFlag,
    state: LifecycleState,
    started: Instant,
}

impl<'d> RequestLifecycle<'d> {
    fn new(
        dispatcher: &'d DispatcherInner,
        scope: RequestScope,
        connection: Arc<dyn Connection>,
    ) -> Self {
        Self {
            dispatcher,
            scope,
            connection,
            cancellation: CancellationFlag::new(),
            state: LifecycleState::Dispatching,
            started: Instant::now(),
        }
    }

    fn transition(&mut self, next: LifecycleState) {
        tracing::debug!(from = %self.state, to = %next, "Lifecycle transition");
        self.state = next;
    }

    async fn run(mut self) -> DispatchResult {
        DispatchMetrics::record_request();
        let _release = ReleaseGuard(self.scope.resources().clone());

        // Stays registered until the connection closes, one per request on a
        // keep-alive connection. It only holds the flag and is a no-op once
        // the request has finished.
        let flag = self.cancellation.clone();
        self.connection.on_close(Box::new(move || {
            if flag.cancel() {
                tracing::debug!("Connection closed, request cancelled");
            }
        }));

        let candidates = self.dispatcher.candidates.candidates(self.scope.request());
        tracing::trace!(candidates = candidates.len(), "Dispatching request");
        let outcome = self
            .dispatcher
            .runner
            .run(&candidates, &self.scope, &self.cancellation)
            .await;

        let result = match outcome {
            TerminalOutcome::Delivered { chain, response } => {
                self.transition(LifecycleState::Sending);
                match self.send(&chain, response).await {
                    Ok(disposition) => Ok(disposition),
                    Err(error) => self.recover(error).await,
                }
            },
            TerminalOutcome::NoMatch => {
                self.transition(LifecycleState::NoResponse);
                Ok(self.not_found())
            },
            TerminalOutcome::Failed(DispatchError::Cancelled) => {
                tracing::debug!("Request cancelled before any chain accepted it");
                Ok(Disposition::Abandoned)
            },
            TerminalOutcome::Failed(error) => self.recover(error).await,
        };

        self.complete(result)
    }

    fn complete(&mut self, result: DispatchResult) -> DispatchResult {
        self.transition(LifecycleState::Completed);
        let released = self.scope.resources().close();
        let elapsed = self.started.elapsed();

        match &result {
            Ok(disposition) => {
                DispatchMetrics::record_outcome(disposition.label(), elapsed);
                if self.dispatcher.config.debug {
                    tracing::info!(
                        disposition = disposition.label(),
                        status = ?disposition.status(),
                        released,
                        elapsed_ms = elapsed.as_millis(),
                        "Request completed"
                    );
                } else {
                    tracing::debug!(
                        disposition = disposition.label(),
                        status = ?disposition.status(),
                        released,
                        "Request completed"
                    );
                }
            },
            Err(error) => {
                DispatchMetrics::record_outcome("fatal", elapsed);
                tracing::error!(%error, released, "Request ended with a fatal error");
            },
        }
        result
    }

    async fn send(&mut self, chain: &ChainDefinition, response: Response) -> DispatchResult {
        if !response.is_sendable() {
            tracing::debug!(
                chain = chain.name(),
                modified = response.is_modified(),
                "Accepting chain produced no response"
            );
            self.transition(LifecycleState::NoResponse);
            return Ok(self.not_found());
        }
        self.deliver(chain, &response).await
    }

    /// Assembly path shared by `Sending` and `Recovering`.
    async fn deliver(&self, chain: &ChainDefinition, response: &Response) -> DispatchResult {
        let Some(mut assembled) = response.to_http() else {
            return Ok(self.not_found());
        };
        if !self.connection.is_open() {
            return Ok(self.abandon());
        }

        let request_id = self.scope.id();
        let hooks = &self.dispatcher.hooks;
        hooks.on_before_send(request_id, assembled.status(), self.scope.request());
        hooks
            .decorate(request_id, self.scope.request(), &mut assembled)
            .map_err(DispatchError::Decorate)?;
        chain.apply_decorators(assembled.headers_mut());

        match response.delay().filter(|delay| !delay.is_zero()) {
            Some(delay) => Ok(self.send_later(assembled, delay).await),
            None => Ok(self.write(assembled)),
        }
    }

    async fn send_later(&self, response: http::Response<Bytes>, delay: Duration) -> Disposition {
        let (fire, fired) = oneshot::channel::<()>();
        let handle = self.dispatcher.timer.schedule(
            delay,
            Box::new(move || {
                let _ = fire.send(());
            }),
        );
        // Never deregistered; cancelling a fired timer does nothing.
        let cancel = handle.clone();
        self.connection.on_close(Box::new(move || cancel.cancel()));
        tracing::debug!(delay_ms = delay.as_millis(), "Response send scheduled");

        if fired.await.is_err() {
            DispatchMetrics::record_send_cancelled();
            tracing::debug!("Connection closed before the delayed send, send cancelled");
            return Disposition::Abandoned;
        }

        match self.write(response) {
            Disposition::Sent { status } => Disposition::Scheduled { status, delay },
            other => other,
        }
    }

    /// Write with the respond hooks around it; the write is not awaited.
    fn write(&self, response: http::Response<Bytes>) -> Disposition {
        if !self.connection.is_open() {
            return self.abandon();
        }
        let status = response.status();
        let request_id = self.scope.id();

        self.dispatcher.hooks.on_before_respond(request_id, status);
        self.hand_off(response);
        self.dispatcher.hooks.on_after_respond(request_id, status);
        Disposition::Sent { status }
    }

    fn hand_off(&self, response: http::Response<Bytes>) {
        let status = response.status();
        let pending = self.connection.write(response);
        tokio::spawn(
            async move {
                if let Err(error) = pending.await {
                    tracing::warn!(%error, %status, "Response write failed");
                }
            }
            .instrument(self.scope.span().clone()),
        );
        tracing::debug!(%status, "Response handed to transport");
    }

    fn abandon(&self) -> Disposition {
        DispatchMetrics::record_send_abandoned();
        tracing::debug!("Connection already closed, response not sent");
        Disposition::Abandoned
    }

    fn not_found(&self) -> Disposition {
        if !self.connection.is_open() {
            return self.abandon();
        }
        let status = self.dispatcher.config.not_found_status_code();
        let response = self
            .dispatcher
            .hooks
            .not_found(self.scope.id(), self.scope.request(), status);

        match self.write(response) {
            Disposition::Sent { status } => Disposition::NotFound { status },
            other => other,
        }
    }

    async fn recover(&mut self, error: DispatchError) -> DispatchResult {
        self.transition(LifecycleState::Recovering);
        self.dispatcher.hooks.on_error(self.scope.id(), &error);

        if error.is_fatal() {
            DispatchMetrics::record_recovery("fatal");
            tracing::error!(%error, "Fatal error, skipping recovery");
            return Err(error);
        }
        tracing::warn!(%error, "Dispatch failed, running error chain");

        let caught = Arc::new(error);
        let scope = self
            .scope
            .clone()
            .with_value(CaughtError::new(Arc::clone(&caught)));
        let error_chain = Arc::clone(&self.dispatcher.error_chain);
        let mut instance = ChainInstance::new(Arc::clone(&error_chain), &scope);

        let failure = match self.dispatcher.runner.executor().run(&mut instance).await {
            Ok(ChainResult::Completed(response)) if response.is_sendable() => {
                match self.deliver(&error_chain, &response).await {
                    Ok(Disposition::Sent { status } | Disposition::Scheduled { status, .. }) => {
                        DispatchMetrics::record_recovery("recovered");
                        tracing::debug!(%status, "Error chain answered the request");
                        return Ok(Disposition::Recovered { status });
                    },
                    Ok(other) => {
                        DispatchMetrics::record_recovery("recovered");
                        return Ok(other);
                    },
                    Err(secondary) => secondary.to_string(),
                }
            },
            Ok(ChainResult::Completed(_)) => "error chain produced no response".to_string(),
            Ok(ChainResult::Rejected) => "error chain rejected the request".to_string(),
            Err(secondary) if secondary.is_fatal() => {
                DispatchMetrics::record_recovery("fatal");
                self.dispatcher.hooks.on_error(self.scope.id(), &secondary);
                tracing::error!(error = %secondary, "Fatal error while recovering");
                return Err(secondary);
            },
            Err(secondary) => secondary.to_string(),
        };

        Ok(self.fallback(&caught, &failure))
    }

    /// Last resort: fixed status written straight to the connection.
    fn fallback(&self, error: &DispatchError, failure: &str) -> Disposition {
        DispatchMetrics::record_recovery("failed");
        tracing::error!(%error, failure, "Error recovery failed, writing fallback response");

        if !self.connection.is_open() {
            return self.abandon();
        }

        let status = self.dispatcher.config.fallback_status_code();
        let body = if self.dispatcher.config.shows_error_details() {
            format!("{error}\n\nerror recovery failed: {failure}\n")
        } else {
            status
                .canonical_reason()
                .unwrap_or("Internal Server Error")
                .to_string()
        };
        let mut response = http::Response::new(Bytes::from(body));
        *response.status_mut() = status;
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );

        self.hand_off(response);
        Disposition::Fallback { status }
    }
}
