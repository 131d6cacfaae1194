//! Prometheus metrics for the dispatch core.
//!
//! Covers request outcomes, chain rejections, stage executions, error
//! recovery, and delayed sends.
//!
//! # Example
//!
//! ```rust,no_run
//! use relay_runtime::metrics::MetricsExporter;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut exporter = MetricsExporter::new();
//! exporter.install()?;
//!
//! // Later, from a scrape handler:
//! let body = exporter.render().unwrap_or_default();
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Installs the Prometheus recorder and renders the scrape payload.
#[derive(Default)]
pub struct MetricsExporter {
    handle: Option<PrometheusHandle>,
}

impl MetricsExporter {
    /// Create an exporter; nothing is installed until [`MetricsExporter::install`]
    #[must_use]
    pub const fn new() -> Self {
        Self { handle: None }
    }

    /// Describe the dispatch metrics and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// If a recorder is already installed (e.g., by another test), this logs a
    /// warning and succeeds without a render handle.
    pub fn install(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!("Dispatch metrics recorder installed");
                Ok(())
            },
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            },
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this exporter did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!("dispatch.requests.total", "Total number of requests dispatched");
    describe_counter!(
        "dispatch.outcome.total",
        "Requests by final disposition (sent, scheduled, not_found, recovered, fallback, abandoned, fatal)"
    );
    describe_counter!(
        "dispatch.chains.rejected.total",
        "Total number of candidate chains that rejected a request"
    );
    describe_counter!(
        "dispatch.stages.executed.total",
        "Total number of stage attempts"
    );
    describe_counter!(
        "dispatch.recovery.total",
        "Error recovery attempts by result (recovered, failed, fatal)"
    );
    describe_counter!(
        "dispatch.sends.cancelled.total",
        "Delayed sends cancelled because the connection closed"
    );
    describe_counter!(
        "dispatch.sends.abandoned.total",
        "Sends skipped because the connection was already closed"
    );
    describe_histogram!(
        "dispatch.request.duration_seconds",
        "Time from dispatch start to completion"
    );
}

/// Dispatch metrics recorder.
pub struct DispatchMetrics;

impl DispatchMetrics {
    /// Record a request entering the dispatcher.
    pub fn record_request() {
        counter!("dispatch.requests.total").increment(1);
    }

    /// Record how a request ended and how long it took.
    pub fn record_outcome(outcome: &'static str, duration: Duration) {
        counter!("dispatch.outcome.total", "outcome" => outcome).increment(1);
        histogram!("dispatch.request.duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a chain rejection.
    pub fn record_rejection() {
        counter!("dispatch.chains.rejected.total").increment(1);
    }

    /// Record a stage attempt.
    pub fn record_stage() {
        counter!("dispatch.stages.executed.total").increment(1);
    }

    /// Record an error recovery attempt.
    pub fn record_recovery(result: &'static str) {
        counter!("dispatch.recovery.total", "result" => result).increment(1);
    }

    /// Record a delayed send cancelled by connection close.
    pub fn record_send_cancelled() {
        counter!("dispatch.sends.cancelled.total").increment(1);
    }

    /// Record a send skipped because the connection was closed.
    pub fn record_send_abandoned() {
        counter!("dispatch.sends.abandoned.total").increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exporter_creation() {
        let exporter = MetricsExporter::new();
        assert!(exporter.handle().is_none());
        assert!(exporter.render().is_none());
    }

    #[test]
    fn test_exporter_install_and_render() {
        let mut exporter = MetricsExporter::new();
        let result = exporter.install();
        assert!(result.is_ok());

        DispatchMetrics::record_request();
        DispatchMetrics::record_stage();
        DispatchMetrics::record_rejection();
        DispatchMetrics::record_recovery("recovered");
        DispatchMetrics::record_outcome("sent", Duration::from_millis(3));

        // The handle is None if another test already installed the recorder;
        // metrics are still recorded globally in that case
        if let Some(rendered) = exporter.render() {
            assert!(rendered.contains("dispatch_requests_total"));
            assert!(rendered.contains("dispatch_stages_executed_total"));
            assert!(rendered.contains("dispatch_request_duration_seconds"));
        }
    }
}
