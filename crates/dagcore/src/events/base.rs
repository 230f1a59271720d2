use crate::{ExecutionStatus, StepId, StepType, Value, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

pub type ExecutionId = Uuid;

/// Events emitted during workflow execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ExecutionEvent {
    ExecutionStarted {
        execution_id: ExecutionId,
        workflow_id: WorkflowId,
        version: u32,
        timestamp: DateTime<Utc>,
    },
    ParallelGroupStarted {
        execution_id: ExecutionId,
        group: String,
        steps: Vec<StepId>,
        timestamp: DateTime<Utc>,
    },
    StepStarted {
        execution_id: ExecutionId,
        step_id: StepId,
        step_type: StepType,
        timestamp: DateTime<Utc>,
    },
    StepCompleted {
        execution_id: ExecutionId,
        step_id: StepId,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    StepSkipped {
        execution_id: ExecutionId,
        step_id: StepId,
        timestamp: DateTime<Utc>,
    },
    StepFailed {
        execution_id: ExecutionId,
        step_id: StepId,
        error: String,
        timestamp: DateTime<Utc>,
    },
    StepEvent {
        execution_id: ExecutionId,
        step_id: StepId,
        event: StepEvent,
        timestamp: DateTime<Utc>,
    },
    ExecutionFinished {
        execution_id: ExecutionId,
        status: ExecutionStatus,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
}

impl ExecutionEvent {
    /// Execution this event belongs to
    pub fn execution_id(&self) -> ExecutionId {
        match self {
            ExecutionEvent::ExecutionStarted { execution_id, .. }
            | ExecutionEvent::ParallelGroupStarted { execution_id, .. }
            | ExecutionEvent::StepStarted { execution_id, .. }
            | ExecutionEvent::StepCompleted { execution_id, .. }
            | ExecutionEvent::StepSkipped { execution_id, .. }
            | ExecutionEvent::StepFailed { execution_id, .. }
            | ExecutionEvent::StepEvent { execution_id, .. }
            | ExecutionEvent::ExecutionFinished { execution_id, .. } => *execution_id,
        }
    }
}

/// Events reported by a step executor while it runs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum StepEvent {
    Info { message: String },
    Warning { message: String },
    Progress { percent: f64, message: Option<String> },
    Data { output: String, value: Value },
}

/// Event emitter handed to executors through their step context
#[derive(Clone)]
pub struct EventEmitter {
    execution_id: ExecutionId,
    step_id: StepId,
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventEmitter {
    /// Emitter bound to one step of one execution
    pub fn new(
        execution_id: ExecutionId,
        step_id: StepId,
        sender: broadcast::Sender<ExecutionEvent>,
    ) -> Self {
        Self {
            execution_id,
            step_id,
            sender,
        }
    }

    /// Emit a step event, wrapped with this emitter's execution and step ids
    pub fn emit(&self, event: StepEvent) {
        // No subscribers is not an error.
        let _ = self.sender.send(ExecutionEvent::StepEvent {
            execution_id: self.execution_id,
            step_id: self.step_id.clone(),
            event,
            timestamp: Utc::now(),
        });
    }

    /// Emit info message
    pub fn info(&self, message: impl Into<String>) {
        self.emit(StepEvent::Info {
            message: message.into(),
        });
    }

    /// Emit warning message
    pub fn warn(&self, message: impl Into<String>) {
        self.emit(StepEvent::Warning {
            message: message.into(),
        });
    }

    /// Emit progress update; `percent` is in 0..=100
    pub fn progress(&self, percent: f64, message: Option<String>) {
        self.emit(StepEvent::Progress { percent, message });
    }

    /// Stream a partial value for one of the step's outputs
    pub fn data(&self, output: impl Into<String>, value: Value) {
        self.emit(StepEvent::Data {
            output: output.into(),
            value,
        });
    }
}

/// Process-wide broadcast of execution events
pub struct EventBus {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    /// `capacity` must be non-zero
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Receiver for every event emitted after this call
    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }

    /// Broadcast an event; dropped silently when nobody listens
    pub fn emit(&self, event: ExecutionEvent) {
        let _ = self.sender.send(event);
    }

    /// Emitter an executor uses to report on `step_id`
    pub fn create_emitter(&self, execution_id: ExecutionId, step_id: StepId) -> EventEmitter {
        EventEmitter::new(execution_id, step_id, self.sender.clone())
    }
}
