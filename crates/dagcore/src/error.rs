use crate::StepId;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Kind of resource a lookup failed for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Workflow,
    Version,
    Template,
    Execution,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::Workflow => "Workflow",
            ResourceKind::Version => "Version",
            ResourceKind::Template => "Template",
            ResourceKind::Execution => "Execution",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: ResourceKind, id: String },

    #[error("Cyclic dependency detected among steps: {}", .steps.join(", "))]
    CyclicDependency { steps: Vec<StepId> },

    #[error("Step '{step_id}' failed: {source}")]
    StepExecution {
        step_id: StepId,
        #[source]
        source: StepError,
    },

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl FlowError {
    pub fn validation(message: impl Into<String>) -> Self {
        FlowError::Validation(message.into())
    }

    pub fn not_found(kind: ResourceKind, id: impl Into<String>) -> Self {
        FlowError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, FlowError::NotFound { .. })
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, FlowError::Validation(_))
    }
}

/// Errors raised by step executors
#[derive(Error, Debug)]
pub enum StepError {
    #[error("Missing required input: {0}")]
    MissingInput(String),

    #[error("Invalid input type for '{field}': expected {expected}, got {actual}")]
    InvalidInputType {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("No executor registered for target: {0}")]
    UnknownTarget(String),

    #[error("No predicate registered for condition: {0}")]
    UnknownCondition(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Timeout after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Cancelled")]
    Cancelled,

    #[error(transparent)]
    External(Box<dyn std::error::Error + Send + Sync>),
}

impl StepError {
    /// Wrap an arbitrary error raised inside an executor, keeping it as the source
    pub fn external<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        StepError::External(Box::new(err))
    }
}

/// Serializable summary of why an execution ended in `failed`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionFailure {
    CyclicDependency { steps: Vec<StepId> },
    StepExecution { step_id: StepId, message: String },
    Internal { message: String },
}

impl From<&FlowError> for ExecutionFailure {
    fn from(err: &FlowError) -> Self {
        match err {
            FlowError::CyclicDependency { steps } => ExecutionFailure::CyclicDependency {
                steps: steps.clone(),
            },
            FlowError::StepExecution { step_id, source } => ExecutionFailure::StepExecution {
                step_id: step_id.clone(),
                message: source.to_string(),
            },
            other => ExecutionFailure::Internal {
                message: other.to_string(),
            },
        }
    }
}

impl fmt::Display for ExecutionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionFailure::CyclicDependency { steps } => {
                write!(f, "cyclic or unsatisfiable dependencies among: {}", steps.join(", "))
            }
            ExecutionFailure::StepExecution { step_id, message } => {
                write!(f, "step '{}' failed: {}", step_id, message)
            }
            ExecutionFailure::Internal { message } => f.write_str(message),
        }
    }
}
