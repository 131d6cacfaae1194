//! Request identity and the per-chain stage context.
//!
//! A [`StageContext`] is created once per chain instance. Everything a stage
//! writes into it (context values, response state) is visible to the later
//! stages of the *same* chain and discarded if that chain rejects.

use crate::resource::ResourceScope;
use crate::response::Response;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// The inbound request as seen by stages: opaque payload plus headers.
pub type Request = http::Request<Bytes>;

/// Typed context map threaded through the stages of a chain.
///
/// `StageOutcome::Continue` carries a delta of this type; later values
/// replace earlier values of the same type.
pub type Context = http::Extensions;

/// Opaque correlation id, stable for the life of one inbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Generate a fresh random request id
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID (e.g. one propagated by an upstream proxy)
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// The underlying UUID
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Everything a stage can see and touch while it runs.
///
/// Owned by exactly one chain instance; never shared across chains or requests.
#[derive(Debug)]
pub struct StageContext {
    request_id: RequestId,
    request: Arc<Request>,
    chain: Arc<str>,
    stage_index: usize,
    context: Context,
    response: Response,
    resources: ResourceScope,
}

impl StageContext {
    /// Create a context for one chain instance
    #[must_use]
    pub fn new(
        request_id: RequestId,
        request: Arc<Request>,
        chain: Arc<str>,
        resources: ResourceScope,
    ) -> Self {
        Self {
            request_id,
            request,
            chain,
            stage_index: 0,
            context: Context::new(),
            response: Response::new(),
            resources,
        }
    }

    /// Correlation id of the request being dispatched
    #[must_use]
    pub const fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// The inbound request
    #[must_use]
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Shared handle to the inbound request, for stages that hand it to spawned work
    #[must_use]
    pub fn request_arc(&self) -> Arc<Request> {
        Arc::clone(&self.request)
    }

    /// Name of the chain this context belongs to
    #[must_use]
    pub fn chain_name(&self) -> &str {
        &self.chain
    }

    /// Position of the stage currently running (zero based)
    #[must_use]
    pub const fn stage_index(&self) -> usize {
        self.stage_index
    }

    /// Move the context to the given stage position.
    ///
    /// Called by the chain executor before each stage runs.
    pub fn set_stage_index(&mut self, index: usize) {
        self.stage_index = index;
    }

    /// Look up a context value by type
    #[must_use]
    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.context.get::<T>()
    }

    /// Insert a context value, returning the previous value of that type
    pub fn insert<T: Clone + Send + Sync + 'static>(&mut self, value: T) -> Option<T> {
        self.context.insert(value)
    }

    /// Merge a `Continue` delta; values in `delta` win on conflict
    pub fn extend(&mut self, delta: Context) {
        self.context.extend(delta);
    }

    /// The full context map
    #[must_use]
    pub const fn context(&self) -> &Context {
        &self.context
    }

    /// The chain's response accumulator
    #[must_use]
    pub const fn response(&self) -> &Response {
        &self.response
    }

    /// Mutable access to the chain's response accumulator
    pub fn response_mut(&mut self) -> &mut Response {
        &mut self.response
    }

    /// Take the accumulated response, leaving an empty one behind
    pub fn take_response(&mut self) -> Response {
        std::mem::take(&mut self.response)
    }

    /// The request's resource scope
    #[must_use]
    pub const fn resources(&self) -> &ResourceScope {
        &self.resources
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> StageContext {
        StageContext::new(
            RequestId::new(),
            Arc::new(Request::new(Bytes::new())),
            Arc::from("test"),
            ResourceScope::new(),
        )
    }

    #[test]
    fn test_request_ids_are_unique() {
        assert_ne!(RequestId::new(), RequestId::new());
    }

    #[test]
    fn test_request_id_display_matches_uuid() {
        let uuid = Uuid::new_v4();
        let id = RequestId::from_uuid(uuid);
        assert_eq!(id.to_string(), uuid.to_string());
        assert_eq!(id.as_uuid(), &uuid);
    }

    #[test]
    fn test_extend_overrides_existing_values() {
        #[derive(Clone, Debug, PartialEq)]
        struct User(&'static str);

        let mut ctx = context();
        ctx.insert(User("anonymous"));
        ctx.insert(42_u32);

        let mut delta = Context::new();
        delta.insert(User("alice"));
        ctx.extend(delta);

        assert_eq!(ctx.get::<User>(), Some(&User("alice")));
        assert_eq!(ctx.get::<u32>(), Some(&42));
    }

    #[test]
    fn test_take_response_leaves_empty_accumulator() {
        let mut ctx = context();
        ctx.response_mut().set_status(http::StatusCode::CREATED);

        let taken = ctx.take_response();
        assert_eq!(taken.status(), Some(http::StatusCode::CREATED));
        assert!(!ctx.response().is_modified());
    }
}
