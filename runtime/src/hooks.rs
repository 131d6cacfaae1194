//! Application hooks around response delivery.
//!
//! Hooks fire in this order for every response the dispatcher sends:
//!
//! 1. `on_before_send` once the final status is known
//! 2. `decorate` on the assembled transport response (chain decorators run after)
//! 3. `on_before_respond` right before the physical write, after any delay
//! 4. `on_after_respond` once the write was issued
//!
//! `on_error` sees every uncaught error, including fatal ones, before
//! recovery starts. `not_found` builds the response used when every
//! candidate rejects.

use bytes::Bytes;
use http::StatusCode;
use relay_core::{DispatchError, Request, RequestId};

/// Hosting-application callbacks. Every method has a no-op default.
pub trait ApplicationHooks: Send + Sync {
    /// A response with `status` is about to be assembled
    fn on_before_send(&self, _request_id: RequestId, _status: StatusCode, _request: &Request) {}

    /// Adjust the assembled response before it is written.
    ///
    /// # Errors
    ///
    /// A failure aborts the send and enters error recovery.
    fn decorate(
        &self,
        _request_id: RequestId,
        _request: &Request,
        _response: &mut http::Response<Bytes>,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// The response is about to be written
    fn on_before_respond(&self, _request_id: RequestId, _status: StatusCode) {}

    /// The response was handed to the transport
    fn on_after_respond(&self, _request_id: RequestId, _status: StatusCode) {}

    /// An uncaught error ended candidate iteration
    fn on_error(&self, _request_id: RequestId, _error: &DispatchError) {}

    /// Build the response for a request no chain accepted
    fn not_found(
        &self,
        _request_id: RequestId,
        _request: &Request,
        status: StatusCode,
    ) -> http::Response<Bytes> {
        let mut response = http::Response::new(Bytes::new());
        *response.status_mut() = status;
        response
    }
}

/// Hooks that do nothing beyond the defaults.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultHooks;

impl ApplicationHooks for DefaultHooks {}
