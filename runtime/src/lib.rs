//! # Relay Runtime
//!
//! Runtime for the Relay request-dispatch core.
//!
//! This crate drives requests through the chains defined with `relay-core`
//! and owns everything that happens around a request: cancellation on
//! connection close, delayed sends, error recovery, resource release and
//! completion signalling.
//!
//! ## Core Components
//!
//! - **Chain executor**: runs one chain instance stage by stage
//! - **Chains runner**: tries candidate chains in order until one accepts
//! - **Dispatcher**: the per-request lifecycle controller
//! - **Completion**: one-shot signal the transport waits on
//!
//! ## Example
//!
//! ```ignore
//! use relay_core::{ChainDefinition, ChainRegistry, StageOutcome, StatusCode};
//! use relay_core::stage::from_fn;
//! use relay_runtime::Dispatcher;
//!
//! let chains = ChainRegistry::new().register(
//!     ChainDefinition::new("health")
//!         .stage(from_fn("ok", |_| Ok(StageOutcome::status(StatusCode::OK)))),
//! );
//!
//! let dispatcher = Dispatcher::builder(chains).build();
//! let disposition = dispatcher.dispatch(request, connection).wait().await?;
//! ```

/// Chain instances and the stage-by-stage executor
pub mod chain;

/// One-shot completion signalling
pub mod completion;

/// Dispatcher configuration
pub mod config;

/// Request lifecycle controller
pub mod dispatcher;

/// Hosting-application hooks
pub mod hooks;

/// Prometheus metrics for dispatch
pub mod metrics;

/// Per-stage observation
pub mod observer;

/// Error recovery chain
pub mod recovery;

/// Candidate chain selection
pub mod runner;

/// Tokio-backed timer
pub mod timer;

pub use chain::{ChainExecutor, ChainInstance, ChainResult, RequestScope};
pub use completion::{Completion, CompletionGate, DispatchResult};
pub use config::DispatcherConfig;
pub use dispatcher::{Dispatcher, DispatcherBuilder, Disposition, LifecycleState};
pub use hooks::{ApplicationHooks, DefaultHooks};
pub use crate::metrics::{DispatchMetrics, MetricsError, MetricsExporter, register_metrics};
pub use observer::{StageObserver, StagePosition, TracingObserver};
pub use recovery::{CaughtError, ERROR_CHAIN_NAME, ErrorResponder, default_error_chain};
pub use runner::ChainsRunner;
pub use timer::TokioTimer;
