//! Recorders for stage progress and hook calls.

use bytes::Bytes;
use http::{HeaderName, HeaderValue, StatusCode};
use relay_core::{DispatchError, Request, RequestId};
use relay_runtime::{ApplicationHooks, StageObserver, StagePosition};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A finished stage attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedStage {
    /// Chain name
    pub chain: String,
    /// Position in the chain
    pub index: usize,
    /// Stage name
    pub stage: String,
    /// Outcome label reported by the executor
    pub outcome: &'static str,
}

#[derive(Default)]
struct ObserverLog {
    started: Vec<(String, usize)>,
    finished: Vec<ObservedStage>,
}

/// Observer that keeps every stage attempt. Clones share the log.
#[derive(Clone, Default)]
pub struct RecordingObserver {
    log: Arc<Mutex<ObserverLog>>,
}

impl RecordingObserver {
    /// Empty recorder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Finished stage attempts in order
    #[must_use]
    pub fn finished(&self) -> Vec<ObservedStage> {
        lock(&self.log).finished.clone()
    }

    /// `(chain, index)` of every stage that started, in order
    #[must_use]
    pub fn started(&self) -> Vec<(String, usize)> {
        lock(&self.log).started.clone()
    }

    /// Names of the chains that ran at least one stage, in first-run order
    #[must_use]
    pub fn chains_run(&self) -> Vec<String> {
        let log = lock(&self.log);
        let mut chains: Vec<String> = Vec::new();
        for (chain, _) in &log.started {
            if !chains.contains(chain) {
                chains.push(chain.clone());
            }
        }
        chains
    }
}

impl std::fmt::Debug for RecordingObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingObserver")
            .field("finished", &lock(&self.log).finished.len())
            .finish_non_exhaustive()
    }
}

impl StageObserver for RecordingObserver {
    fn before_stage(&self, position: &StagePosition<'_>) {
        lock(&self.log)
            .started
            .push((position.chain.to_string(), position.index));
    }

    fn after_stage(&self, position: &StagePosition<'_>, outcome: &'static str) {
        lock(&self.log).finished.push(ObservedStage {
            chain: position.chain.to_string(),
            index: position.index,
            stage: position.stage.to_string(),
            outcome,
        });
    }
}

/// One hook invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookEvent {
    /// `on_before_send`
    BeforeSend(StatusCode),
    /// `decorate`
    Decorate(StatusCode),
    /// `on_before_respond`
    BeforeRespond(StatusCode),
    /// `on_after_respond`
    AfterRespond(StatusCode),
    /// `on_error`, with the error label
    Error(&'static str),
    /// `not_found`
    NotFound(StatusCode),
}

/// Hooks that log every call. Clones share the log.
///
/// Optionally adds a header while decorating, or fails the decoration.
#[derive(Clone, Default)]
pub struct RecordingHooks {
    events: Arc<Mutex<Vec<HookEvent>>>,
    header: Option<(HeaderName, HeaderValue)>,
    fail_decorate: bool,
}

impl RecordingHooks {
    /// Hooks that only record
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `name: value` into every decorated response
    #[must_use]
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.header = Some((name, value));
        self
    }

    /// Make every decoration fail
    #[must_use]
    pub const fn failing_decorate(mut self) -> Self {
        self.fail_decorate = true;
        self
    }

    /// Every hook call so far
    #[must_use]
    pub fn events(&self) -> Vec<HookEvent> {
        lock(&self.events).clone()
    }

    fn push(&self, event: HookEvent) {
        lock(&self.events).push(event);
    }
}

impl std::fmt::Debug for RecordingHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingHooks")
            .field("events", &lock(&self.events).len())
            .field("fail_decorate", &self.fail_decorate)
            .finish_non_exhaustive()
    }
}

impl ApplicationHooks for RecordingHooks {
    fn on_before_send(&self, _request_id: RequestId, status: StatusCode, _request: &Request) {
        self.push(HookEvent::BeforeSend(status));
    }

    fn decorate(
        &self,
        _request_id: RequestId,
        _request: &Request,
        response: &mut http::Response<Bytes>,
    ) -> anyhow::Result<()> {
        self.push(HookEvent::Decorate(response.status()));
        if self.fail_decorate {
            anyhow::bail!("decoration refused");
        }
        if let Some((name, value)) = &self.header {
            response.headers_mut().insert(name.clone(), value.clone());
        }
        Ok(())
    }

    fn on_before_respond(&self, _request_id: RequestId, status: StatusCode) {
        self.push(HookEvent::BeforeRespond(status));
    }

    fn on_after_respond(&self, _request_id: RequestId, status: StatusCode) {
        self.push(HookEvent::AfterRespond(status));
    }

    fn on_error(&self, _request_id: RequestId, error: &DispatchError) {
        self.push(HookEvent::Error(error.label()));
    }

    fn not_found(
        &self,
        _request_id: RequestId,
        _request: &Request,
        status: StatusCode,
    ) -> http::Response<Bytes> {
        self.push(HookEvent::NotFound(status));
        let mut response = http::Response::new(Bytes::from_static(b"no route"));
        *response.status_mut() = status;
        response
    }
}
