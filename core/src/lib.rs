//! # Relay Core
//!
//! Core traits and types for the Relay request-dispatch core.
//!
//! This crate describes *what* a request dispatch looks like; the runtime crate
//! decides *how* it is driven. Nothing in here spawns tasks or touches a clock.
//!
//! ## Core Concepts
//!
//! - **Stage**: One unit of chain logic; decides reject / continue / respond
//! - **Chain Definition**: Ordered sequence of stages bound to one candidate handler
//! - **Candidate Sequence**: Ordered list of chain definitions to try for a request
//! - **Response Accumulator**: Mergeable builder of the eventual response
//! - **Resource Scope**: Request-scoped cleanup registry with exactly-once release
//! - **Terminal Outcome**: The single final result of running a request through the runner
//!
//! ## Architecture Principles
//!
//! - First non-rejecting chain wins; rejection is recoverable, errors are terminal
//! - Per-request context is threaded explicitly, never held in globals
//! - Collaborators (transport, timer, instantiation, route matching) are traits
//!
//! ## Example
//!
//! ```
//! use relay_core::{ChainDefinition, StageOutcome, stage::from_fn};
//! use http::StatusCode;
//!
//! let hello = ChainDefinition::new("hello")
//!     .stage(from_fn("match-path", |ctx| {
//!         if ctx.request().uri().path() == "/hello" {
//!             Ok(StageOutcome::next())
//!         } else {
//!             Ok(StageOutcome::Reject)
//!         }
//!     }))
//!     .stage(from_fn("respond", |_ctx| Ok(StageOutcome::status(StatusCode::OK))));
//!
//! assert_eq!(hello.len(), 2);
//! ```

pub mod cancel;
pub mod chain;
pub mod context;
pub mod error;
pub mod instantiate;
pub mod outcome;
pub mod registry;
pub mod resource;
pub mod response;
pub mod stage;
pub mod transport;

// Re-export commonly used types
pub use bytes::Bytes;
pub use http::{HeaderMap, HeaderValue, StatusCode};
pub use smallvec::{SmallVec, smallvec};

pub use cancel::CancellationFlag;
pub use chain::{ChainDefinition, Item, StageItem, TypeRef};
pub use context::{Context, Request, RequestId, StageContext};
pub use error::DispatchError;
pub use instantiate::{Instantiate, InstantiateError, StageRegistry};
pub use outcome::TerminalOutcome;
pub use registry::ChainRegistry;
pub use resource::{Resource, ResourceScope};
pub use response::Response;
pub use stage::{Stage, StageError, StageFuture, StageOutcome};
pub use transport::{
    CandidateSource, Cancellable, Connection, Timer, TimerHandle, TransportError, WriteHandle,
};
