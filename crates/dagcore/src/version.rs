use crate::{WorkflowDefinition, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Immutable, numbered snapshot of a workflow definition.
///
/// Only `is_active` ever changes after creation, and only through the
/// version store's activate/rollback paths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowVersion {
    pub version: u32,
    pub workflow_id: WorkflowId,
    pub definition: WorkflowDefinition,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default)]
    pub changelog: Option<String>,
    pub is_active: bool,
}
