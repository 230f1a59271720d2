//! Core abstractions for the workflow engine
//!
//! Definition model, versions, templates, execution state, error types and
//! the capability traits (step executors, condition predicates, metrics
//! sinks) that the runtime crate is built against.

mod error;
pub mod events;
mod execution;
pub mod metrics;
mod step;
mod template;
mod value;
mod version;
mod workflow;

pub use error::{ExecutionFailure, FlowError, ResourceKind, StepError};
pub use events::*;
pub use execution::{
    ExecutionContext, ExecutionStatistics, ExecutionStatus, StepOutcome, StepRecord,
};
pub use metrics::{MetricsError, MetricsSink};
pub use step::{ConditionPredicate, StepContext, StepExecutor};
pub use template::{ParameterType, ParameterValidation, TemplateParameter, WorkflowTemplate};
pub use value::Value;
pub use version::WorkflowVersion;
pub use workflow::{
    ConditionalBranch, ParallelGroup, RetryPolicy, StepId, StepType, WorkflowDefinition,
    WorkflowId, WorkflowStep,
};

/// Result type for flow operations
pub type Result<T> = std::result::Result<T, FlowError>;
