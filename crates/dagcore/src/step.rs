use crate::{EventEmitter, ExecutionId, StepError, StepId, StepType, Value, WorkflowId};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

/// Capability that performs the actual work of a step.
///
/// Implementations live outside the engine (model calls, HTTP calls,
/// platform actions) and are injected when the engine is built.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn invoke(&self, ctx: StepContext) -> Result<Value, StepError>;
}

/// Execution context passed to each step executor
#[derive(Clone)]
pub struct StepContext {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub step_id: StepId,
    pub step_type: StepType,
    pub target: Option<String>,

    /// Declared inputs; `None` marks a name that resolved to nothing
    pub inputs: HashMap<String, Option<Value>>,

    /// Advisory only, the scheduler never enforces it
    pub timeout_ms: Option<u64>,

    /// 1-based attempt number
    pub attempt: u32,

    pub events: EventEmitter,

    /// Cancelled when the execution is cancelled or the engine shuts down
    pub cancellation: CancellationToken,
}

impl StepContext {
    /// Resolved input value, if present
    pub fn input(&self, name: &str) -> Option<&Value> {
        self.inputs.get(name).and_then(|v| v.as_ref())
    }

    /// Get required input or return error
    pub fn require_input(&self, name: &str) -> Result<&Value, StepError> {
        self.input(name)
            .ok_or_else(|| StepError::MissingInput(name.to_string()))
    }

    /// Required input that must be a string
    pub fn require_str(&self, name: &str) -> Result<&str, StepError> {
        let value = self.require_input(name)?;
        value.as_str().ok_or_else(|| StepError::InvalidInputType {
            field: name.to_string(),
            expected: "string".to_string(),
            actual: value.type_name().to_string(),
        })
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Return `Cancelled` if the execution has been cancelled
    pub fn check_cancelled(&self) -> Result<(), StepError> {
        if self.is_cancelled() {
            Err(StepError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Predicate deciding whether a gated step runs.
///
/// Must be free of side effects; it may be evaluated more than once.
pub trait ConditionPredicate: Send + Sync {
    fn evaluate(&self, variables: &HashMap<String, Value>, step_results: &HashMap<String, Value>) -> bool;
}

impl<F> ConditionPredicate for F
where
    F: Fn(&HashMap<String, Value>, &HashMap<String, Value>) -> bool + Send + Sync,
{
    fn evaluate(&self, variables: &HashMap<String, Value>, step_results: &HashMap<String, Value>) -> bool {
        self(variables, step_results)
    }
}
