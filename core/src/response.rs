//! The response accumulator.
//!
//! Stages of one chain each contribute partial response state; the pieces are
//! folded together in stage order with [`Response::merge`]. Nothing is sent
//! until the accumulator is both modified and carries a status.

use bytes::Bytes;
use http::header::IntoHeaderName;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use std::time::Duration;

/// Mutable, mergeable builder of the eventual response.
///
/// # Invariants
///
/// - Header keys are unique; the last write wins
/// - `modified` turns true on the first write and never turns back
/// - A response is sendable only if modified and a status is set
#[derive(Debug, Clone, Default)]
pub struct Response {
    status: Option<StatusCode>,
    headers: HeaderMap,
    body: Option<Bytes>,
    delay: Option<Duration>,
    modified: bool,
}

impl Response {
    /// Create an empty, unmodified accumulator
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an accumulator carrying only a status
    #[must_use]
    pub fn with_status(status: StatusCode) -> Self {
        let mut response = Self::new();
        response.set_status(status);
        response
    }

    /// Builder form of [`Response::insert_header`]
    #[must_use]
    pub fn with_header<K: IntoHeaderName>(mut self, name: K, value: HeaderValue) -> Self {
        self.insert_header(name, value);
        self
    }

    /// Builder form of [`Response::set_body`]
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.set_body(body);
        self
    }

    /// Builder form of [`Response::set_delay`]
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.set_delay(delay);
        self
    }

    /// Set the status code
    pub fn set_status(&mut self, status: StatusCode) -> &mut Self {
        self.status = Some(status);
        self.modified = true;
        self
    }

    /// Insert a header, replacing any previous value for that name
    pub fn insert_header<K: IntoHeaderName>(&mut self, name: K, value: HeaderValue) -> &mut Self {
        self.headers.insert(name, value);
        self.modified = true;
        self
    }

    /// Set the body payload
    pub fn set_body(&mut self, body: impl Into<Bytes>) -> &mut Self {
        self.body = Some(body.into());
        self.modified = true;
        self
    }

    /// Defer the physical send by `delay`
    pub fn set_delay(&mut self, delay: Duration) -> &mut Self {
        self.delay = Some(delay);
        self.modified = true;
        self
    }

    /// Status code, if any stage set one
    #[must_use]
    pub const fn status(&self) -> Option<StatusCode> {
        self.status
    }

    /// Accumulated headers
    #[must_use]
    pub const fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Body payload, if any
    #[must_use]
    pub const fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    /// Send delay, if any
    #[must_use]
    pub const fn delay(&self) -> Option<Duration> {
        self.delay
    }

    /// Whether any stage has written to this accumulator
    #[must_use]
    pub const fn is_modified(&self) -> bool {
        self.modified
    }

    /// Whether this response may be handed to the transport
    #[must_use]
    pub const fn is_sendable(&self) -> bool {
        self.modified && self.status.is_some()
    }

    /// Fold a later contribution into this one.
    ///
    /// Everything set in `other` overrides `self`; headers are unioned with
    /// `other` winning per key. Folding stage contributions one by one gives
    /// the same result as merging them pairwise in any grouping, as long as
    /// stage order is kept.
    pub fn merge(&mut self, other: Response) {
        let Response {
            status,
            headers,
            body,
            delay,
            modified,
        } = other;

        if status.is_some() {
            self.status = status;
        }

        // `into_iter` yields `None` names for extra values of the previous key
        let mut current: Option<HeaderName> = None;
        for (name, value) in headers {
            match name {
                Some(name) => {
                    self.headers.insert(name.clone(), value);
                    current = Some(name);
                },
                None => {
                    if let Some(name) = &current {
                        self.headers.append(name.clone(), value);
                    }
                },
            }
        }

        if body.is_some() {
            self.body = body;
        }
        if delay.is_some() {
            self.delay = delay;
        }
        self.modified |= modified;
    }

    /// Assemble the transport-level response.
    ///
    /// Returns `None` when no status was set.
    #[must_use]
    pub fn to_http(&self) -> Option<http::Response<Bytes>> {
        let status = self.status?;
        let mut response = http::Response::new(self.body.clone().unwrap_or_default());
        *response.status_mut() = status;
        *response.headers_mut() = self.headers.clone();
        Some(response)
    }
}
