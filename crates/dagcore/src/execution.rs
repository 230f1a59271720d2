use crate::{ExecutionFailure, ExecutionId, StepId, Value, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Completed,
    Skipped,
    Failed,
}

/// One finished step, in completion order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step_id: StepId,
    pub outcome: StepOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub attempts: u32,
}

/// Run-time state of one workflow execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub version: u32,
    pub variables: HashMap<String, Value>,
    /// Output name -> value
    pub step_results: HashMap<String, Value>,
    pub status: ExecutionStatus,
    pub current_step: Option<StepId>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub error: Option<ExecutionFailure>,
    #[serde(default)]
    pub history: Vec<StepRecord>,
}

impl ExecutionContext {
    /// Seed variables from definition defaults; caller inputs win.
    pub fn new(
        workflow_id: impl Into<WorkflowId>,
        version: u32,
        defaults: &HashMap<String, Value>,
        inputs: HashMap<String, Value>,
    ) -> Self {
        let mut variables = defaults.clone();
        variables.extend(inputs);

        Self {
            execution_id: ExecutionId::new_v4(),
            workflow_id: workflow_id.into(),
            version,
            variables,
            step_results: HashMap::new(),
            status: ExecutionStatus::Pending,
            current_step: None,
            start_time: Utc::now(),
            end_time: None,
            error: None,
            history: Vec::new(),
        }
    }

    /// Variables first, then step results
    pub fn resolve(&self, name: &str) -> Option<&Value> {
        self.variables
            .get(name)
            .or_else(|| self.step_results.get(name))
    }

    pub fn record(&self, step_id: &str) -> Option<&StepRecord> {
        self.history.iter().find(|r| r.step_id == step_id)
    }

    /// Position of a step in completion order
    pub fn completion_index(&self, step_id: &str) -> Option<usize> {
        self.history.iter().position(|r| r.step_id == step_id)
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.end_time
            .map(|end| (end - self.start_time).num_milliseconds())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionStatistics {
    pub total_workflows: usize,
    pub total_versions: usize,
    pub total_templates: usize,
    pub active_executions: usize,
    pub total_executions: u64,
}
