//! # Relay Testing
//!
//! Testing utilities and helpers for the Relay request-dispatch core.
//!
//! This crate provides:
//! - Mock implementations of the host collaborators ([`MockConnection`], [`ManualTimer`])
//! - Ready-made stages for building test chains
//! - Recorders for stage progress and application hooks
//! - A Given-When-Then harness for whole dispatches ([`DispatchTest`])
//! - Property-based testing strategies
//!
//! ## Example
//!
//! ```ignore
//! use relay_testing::{DispatchTest, stages};
//!
//! #[tokio::test]
//! async fn test_health_check() {
//!     DispatchTest::new()
//!         .given_chain(ChainDefinition::new("health").stage(stages::respond(StatusCode::OK)))
//!         .when_request(get("/health"))
//!         .then_disposition(|d| assert_eq!(d.status(), Some(StatusCode::OK)))
//!         .run()
//!         .await;
//! }
//! ```

/// Mock implementations of host collaborators
pub mod mocks;

/// Stages for assembling test chains
pub mod stages;

/// Recorders for stage progress and hook calls
pub mod recording;


pub use dispatch_test::DispatchTest;
pub use mocks::{ManualTimer, MockConnection, WrittenResponse};
pub use recording::{HookEvent, ObservedStage, RecordingHooks, RecordingObserver};

use bytes::Bytes;
use relay_core::Request;

/// Build a request with an empty body.
///
/// # Panics
///
/// Panics if `uri` is not a valid URI.
#[allow(clippy::expect_used)] // Test helper
#[must_use]
pub fn request(method: http::Method, uri: &str) -> Request {
    http::Request::builder()
        .method(method)
        .uri(uri)
        .body(Bytes::new())
        .expect("valid test request")
}

/// Build a `GET` request with an empty body.
#[must_use]
pub fn get(uri: &str) -> Request {
    request(http::Method::GET, uri)
}

/// Install a `tracing` subscriber writing to the test output.
///
/// Honors `RUST_LOG`; safe to call from every test.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Property-based testing strategies
pub mod properties {
    use proptest::prelude::*;

    /// What a generated stage does when run.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum StageBehavior {
        /// Rejects the request
        Reject,
        /// Continues to the next stage
        Continue,
        /// Responds with the given status code
        Respond(u16),
        /// Fails with an uncaught error
        Fail,
    }

    /// Strategy producing one stage behavior, weighted toward `Continue`.
    pub fn stage_behavior() -> impl Strategy<Value = StageBehavior> {
        prop_oneof![
            2 => Just(StageBehavior::Reject),
            4 => Just(StageBehavior::Continue),
            2 => (200u16..600).prop_map(StageBehavior::Respond),
            1 => Just(StageBehavior::Fail),
        ]
    }

    /// Strategy producing candidate sequences: up to `max_chains` chains of
    /// up to `max_stages` stages each.
    pub fn candidate_behaviors(
        max_chains: usize,
        max_stages: usize,
    ) -> impl Strategy<Value = Vec<Vec<StageBehavior>>> {
        prop::collection::vec(
            prop::collection::vec(stage_behavior(), 0..=max_stages),
            0..=max_chains,
        )
    }
}
