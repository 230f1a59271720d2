use thiserror::Error;

/// Label set attached to a metric observation
pub type Labels<'a> = &'a [(&'a str, &'a str)];

#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("Metrics backend unavailable: {0}")]
    Unavailable(String),

    #[error("Metrics rejected: {0}")]
    Rejected(String),
}

/// Optional sink for engine metrics.
///
/// Errors are reported back to the engine, which logs and drops them.
pub trait MetricsSink: Send + Sync {
    fn increment_counter(&self, name: &str, labels: Labels<'_>) -> Result<(), MetricsError>;

    fn record_histogram(&self, name: &str, value_ms: f64, labels: Labels<'_>) -> Result<(), MetricsError>;
}

pub const VERSIONS_CREATED: &str = "workflow_versions_created";
pub const ROLLBACKS: &str = "workflow_rollbacks";
pub const EXECUTIONS_STARTED: &str = "workflow_executions_started";
pub const EXECUTIONS_COMPLETED: &str = "workflow_executions_completed";
pub const EXECUTIONS_FAILED: &str = "workflow_executions_failed";
pub const EXECUTIONS_CANCELLED: &str = "workflow_executions_cancelled";
pub const EXECUTION_DURATION_MS: &str = "workflow_execution_duration_ms";
pub const STEP_DURATION_MS: &str = "workflow_step_duration_ms";
pub const PARALLEL_GROUP_SIZE: &str = "workflow_parallel_group_size";
