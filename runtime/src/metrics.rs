//! Prometheus metrics for the reservation engine.
//!
//! Metric names are constants so that the manager, the storage adapters and
//! the tests agree on them. Recording is a no-op until a recorder is
//! installed, which is what [`MetricsRecorder::install`] does.
//!
//! # Example
//!
//! ```rust,no_run
//! use condo_runtime::metrics::MetricsRecorder;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let recorder = MetricsRecorder::install()?;
//! // ... run operations ...
//! println!("{}", recorder.render());
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_histogram, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use thiserror::Error;

// Re-export metrics macros for use in other crates
pub use metrics::{counter, gauge, histogram};

/// Admission attempts, labelled by `outcome`.
pub const ADMISSIONS: &str = "condo_admissions_total";
/// Reservation transitions, labelled by `action` and `outcome`.
pub const TRANSITIONS: &str = "condo_transitions_total";
/// Key custody operations, labelled by `kind` and `outcome`.
pub const KEY_MOVEMENTS: &str = "condo_key_movements_total";
/// Evaluation submissions and responses, labelled by `outcome`.
pub const EVALUATIONS: &str = "condo_evaluations_total";
/// Storage guard rejections, labelled by `guard`.
pub const STORAGE_GUARDS: &str = "condo_storage_guard_rejections_total";
/// Manager operation latency, labelled by `operation`.
pub const OPERATION_DURATION: &str = "condo_operation_duration_seconds";
/// Effects executed after a successful write.
pub const EFFECTS_EXECUTED: &str = "condo_effects_executed_total";

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

/// Installed Prometheus recorder.
pub struct MetricsRecorder {
    handle: PrometheusHandle,
}

impl MetricsRecorder {
    /// Install the Prometheus recorder globally and register descriptions.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Build`] if the exporter configuration is
    /// rejected, or [`MetricsError::Install`] if a recorder is already installed.
    pub fn install() -> Result<Self, MetricsError> {
        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .install_recorder()
            .map_err(|e| MetricsError::Install(e.to_string()))?;

        register_metrics();
        tracing::info!("metrics recorder installed");

        Ok(Self { handle })
    }

    /// Render current metrics in Prometheus text format.
    #[must_use]
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

impl std::fmt::Debug for MetricsRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRecorder").finish_non_exhaustive()
    }
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(ADMISSIONS, "Reservation admission attempts by outcome");
    describe_counter!(
        TRANSITIONS,
        "Reservation state transitions by action and outcome"
    );
    describe_counter!(KEY_MOVEMENTS, "Key custody operations by kind and outcome");
    describe_counter!(EVALUATIONS, "Evaluation submissions and responses by outcome");
    describe_counter!(
        STORAGE_GUARDS,
        "Writes refused by a storage-level guard after passing in-process validation"
    );
    describe_counter!(EFFECTS_EXECUTED, "Effects executed after successful writes");
    describe_histogram!(
        OPERATION_DURATION,
        Unit::Seconds,
        "Time taken by manager operations"
    );
}
