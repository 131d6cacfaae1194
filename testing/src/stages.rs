//! Stages for assembling test chains.

use crate::properties::StageBehavior;
use http::StatusCode;
use relay_core::stage::from_fn;
use relay_core::{
    ChainDefinition, Response, Stage, StageContext, StageError, StageFuture, StageOutcome,
};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Always rejects.
pub fn reject() -> impl Stage {
    from_fn("reject", |_| Ok(StageOutcome::Reject))
}

/// Always continues without adding context.
pub fn pass() -> impl Stage {
    from_fn("pass", |_| Ok(StageOutcome::next()))
}

/// Always responds with `status`.
pub fn respond(status: StatusCode) -> impl Stage {
    from_fn("respond", move |_| Ok(StageOutcome::status(status)))
}

/// Responds with `status` and a text body.
pub fn respond_text(status: StatusCode, body: &'static str) -> impl Stage {
    from_fn("respond-text", move |_| {
        Ok(StageOutcome::respond(
            Response::with_status(status).with_body(body),
        ))
    })
}

/// Responds with `status` after `delay`, sent by the lifecycle's timer.
pub fn respond_later(status: StatusCode, delay: Duration) -> impl Stage {
    from_fn("respond-later", move |_| {
        Ok(StageOutcome::respond(
            Response::with_status(status).with_delay(delay),
        ))
    })
}

/// Fails with an uncaught error carrying `message`.
pub fn fail(message: &'static str) -> impl Stage {
    from_fn("fail", move |_| Err(StageError::failed(anyhow::anyhow!(message))))
}

/// Fails with a fatal error carrying `message`.
pub fn fatal(message: &'static str) -> impl Stage {
    from_fn("fatal", move |_| Err(StageError::fatal(message)))
}

/// Panics with `message`.
#[allow(clippy::panic)] // Test code can panic
pub fn panicking(message: &'static str) -> impl Stage {
    from_fn("panicking", move |_| panic!("{message}"))
}

/// Log shared by [`Recording`] stages.
pub type StageLog = Arc<Mutex<Vec<String>>>;

/// A fresh, empty stage log.
#[must_use]
pub fn stage_log() -> StageLog {
    Arc::new(Mutex::new(Vec::new()))
}

/// Snapshot of a stage log.
#[must_use]
pub fn entries(log: &StageLog) -> Vec<String> {
    log.lock().unwrap_or_else(PoisonError::into_inner).clone()
}

/// Appends its label to a shared log, then behaves like the wrapped stage.
pub struct Recording<S> {
    label: String,
    log: StageLog,
    inner: S,
}

impl<S: Stage> Recording<S> {
    /// Wrap `inner`, logging `label` each time it runs
    pub fn new(label: impl Into<String>, log: &StageLog, inner: S) -> Self {
        Self {
            label: label.into(),
            log: Arc::clone(log),
            inner,
        }
    }
}

impl<S: Stage> Stage for Recording<S> {
    fn name(&self) -> &str {
        &self.label
    }

    fn execute<'a>(&'a self, ctx: &'a mut StageContext) -> StageFuture<'a> {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(self.label.clone());
        self.inner.execute(ctx)
    }
}

/// Sleeps on the tokio clock before producing its outcome.
pub struct Sleeping<S> {
    delay: Duration,
    inner: S,
}

impl<S: Stage> Sleeping<S> {
    /// Run `inner` after sleeping for `delay`
    pub const fn new(delay: Duration, inner: S) -> Self {
        Self { delay, inner }
    }
}

impl<S: Stage> Stage for Sleeping<S> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn execute<'a>(&'a self, ctx: &'a mut StageContext) -> StageFuture<'a> {
        Box::pin(async move {
            tokio::time::sleep(self.delay).await;
            self.inner.execute(ctx).await
        })
    }
}

/// Build a chain named `name` whose stages follow `behaviors`, each stage
/// logging `"<name>:<index>"` to `log` when it runs.
pub fn chain_from_behaviors(
    name: &str,
    behaviors: &[StageBehavior],
    log: &StageLog,
) -> ChainDefinition {
    behaviors
        .iter()
        .enumerate()
        .fold(ChainDefinition::new(name), |chain, (index, behavior)| {
            let label = format!("{name}:{index}");
            match *behavior {
                StageBehavior::Reject => chain.stage(Recording::new(label, log, reject())),
                StageBehavior::Continue => chain.stage(Recording::new(label, log, pass())),
                StageBehavior::Respond(code) => {
                    let status = StatusCode::from_u16(code).unwrap_or(StatusCode::OK);
                    chain.stage(Recording::new(label, log, respond(status)))
                },
                StageBehavior::Fail => chain.stage(Recording::new(label, log, fail("generated failure"))),
            }
        })
}
