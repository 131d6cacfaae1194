//! Collaborators the dispatch core consumes from its host.
//!
//! The core never touches sockets, clocks, or route tables directly. The host
//! supplies:
//!
//! - a [`Connection`] per request (open check, write, close notification)
//! - a [`Timer`] for delayed sends
//! - a [`CandidateSource`] that turns a request into its ordered candidate chains

use crate::chain::ChainDefinition;
use crate::context::Request;
use bytes::Bytes;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors reported by a write handle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The connection closed before the write finished
    #[error("connection closed")]
    Closed,

    /// The transport failed to write
    #[error("transport I/O error: {0}")]
    Io(String),
}

/// Completion of one write. Dropping it does not cancel the write.
pub type WriteHandle = Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send>>;

/// One client connection, as seen by the lifecycle controller.
///
/// # Dyn Compatibility
///
/// Used as `Arc<dyn Connection>`; `write` returns a boxed future.
pub trait Connection: Send + Sync {
    /// Whether the client is still connected
    fn is_open(&self) -> bool;

    /// Hand a response to the transport
    fn write(&self, response: http::Response<Bytes>) -> WriteHandle;

    /// Register a callback fired once when the connection closes.
    ///
    /// Implementations call it immediately if the connection is already closed.
    /// There is no deregistration: callbacks are kept until the connection
    /// closes, so a keep-alive connection holds one per dispatched request.
    fn on_close(&self, callback: Box<dyn FnOnce() + Send>);
}

/// Something scheduled that can still be called off.
pub trait Cancellable: Send + Sync {
    /// Cancel the task if it has not run yet; no-op otherwise
    fn cancel(&self);
}

/// Cloneable handle to a scheduled task.
#[derive(Clone)]
pub struct TimerHandle(Arc<dyn Cancellable>);

impl TimerHandle {
    /// Wrap a cancellable task
    pub fn new(task: Arc<dyn Cancellable>) -> Self {
        Self(task)
    }

    /// Cancel the scheduled task
    pub fn cancel(&self) {
        self.0.cancel();
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle").finish_non_exhaustive()
    }
}

/// Schedules deferred work.
pub trait Timer: Send + Sync {
    /// Run `task` once after `delay` unless cancelled first
    fn schedule(&self, delay: Duration, task: Box<dyn FnOnce() + Send>) -> TimerHandle;
}

/// Produces the ordered candidate chains for a request (route matching).
///
/// The returned order is the tie-break: the first chain that does not reject
/// handles the request.
pub trait CandidateSource: Send + Sync {
    /// Candidate chains for `request`, in the order they must be tried
    fn candidates(&self, request: &Request) -> Vec<Arc<ChainDefinition>>;
}

impl CandidateSource for Vec<Arc<ChainDefinition>> {
    fn candidates(&self, _request: &Request) -> Vec<Arc<ChainDefinition>> {
        self.clone()
    }
}

impl<F> CandidateSource for F
where
    F: Fn(&Request) -> Vec<Arc<ChainDefinition>> + Send + Sync,
{
    fn candidates(&self, request: &Request) -> Vec<Arc<ChainDefinition>> {
        self(request)
    }
}
