use async_trait::async_trait;
use chrono::Utc;
use dagcore::{FlowError, ResourceKind, WorkflowDefinition, WorkflowId, WorkflowVersion};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Storage for numbered workflow versions.
///
/// Implementations must keep at most one active version per workflow id and
/// leave no partial state behind when an operation fails.
#[async_trait]
pub trait VersionStore: Send + Sync {
    /// Validate and append a new version, making it the active one
    async fn create_version(
        &self,
        workflow_id: &str,
        definition: WorkflowDefinition,
        changelog: Option<String>,
        created_by: Option<String>,
    ) -> Result<WorkflowVersion, FlowError>;

    /// `None` selects the active version
    async fn get_version(
        &self,
        workflow_id: &str,
        version: Option<u32>,
    ) -> Result<Option<WorkflowVersion>, FlowError>;

    /// Move the active pointer back to `target_version`
    async fn rollback(
        &self,
        workflow_id: &str,
        target_version: u32,
        reason: Option<&str>,
    ) -> Result<WorkflowVersion, FlowError>;

    /// All versions in creation order
    async fn list_versions(&self, workflow_id: &str) -> Result<Vec<WorkflowVersion>, FlowError>;

    async fn workflow_count(&self) -> usize;

    async fn version_count(&self) -> usize;

    async fn clear(&self);
}

/// Process-local version store
#[derive(Default)]
pub struct InMemoryVersionStore {
    versions: RwLock<HashMap<WorkflowId, Vec<WorkflowVersion>>>,
}

impl InMemoryVersionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VersionStore for InMemoryVersionStore {
    async fn create_version(
        &self,
        workflow_id: &str,
        mut definition: WorkflowDefinition,
        changelog: Option<String>,
        created_by: Option<String>,
    ) -> Result<WorkflowVersion, FlowError> {
        definition.validate()?;
        if definition.id.is_empty() {
            definition.id = workflow_id.to_string();
        }

        let mut versions = self.versions.write().await;
        let history = versions.entry(workflow_id.to_string()).or_default();

        let version_number = history.len() as u32 + 1;
        for existing in history.iter_mut() {
            existing.is_active = false;
        }

        let version = WorkflowVersion {
            version: version_number,
            workflow_id: workflow_id.to_string(),
            definition,
            created_at: Utc::now(),
            created_by,
            changelog,
            is_active: true,
        };
        history.push(version.clone());

        tracing::info!("Created workflow version: {} v{}", workflow_id, version_number);

        Ok(version)
    }

    async fn get_version(
        &self,
        workflow_id: &str,
        version: Option<u32>,
    ) -> Result<Option<WorkflowVersion>, FlowError> {
        let versions = self.versions.read().await;
        let found = versions.get(workflow_id).and_then(|history| match version {
            Some(number) => history.iter().find(|v| v.version == number),
            None => history.iter().find(|v| v.is_active),
        });
        Ok(found.cloned())
    }

    async fn rollback(
        &self,
        workflow_id: &str,
        target_version: u32,
        reason: Option<&str>,
    ) -> Result<WorkflowVersion, FlowError> {
        let mut versions = self.versions.write().await;
        let history = versions
            .get_mut(workflow_id)
            .ok_or_else(|| FlowError::not_found(ResourceKind::Workflow, workflow_id))?;

        if !history.iter().any(|v| v.version == target_version) {
            return Err(FlowError::not_found(
                ResourceKind::Version,
                format!("{} v{}", workflow_id, target_version),
            ));
        }

        let mut restored = None;
        for version in history.iter_mut() {
            version.is_active = version.version == target_version;
            if version.is_active {
                restored = Some(version.clone());
            }
        }

        tracing::info!(
            "Rolled back workflow {} to v{} (reason: {})",
            workflow_id,
            target_version,
            reason.unwrap_or("none given")
        );

        restored.ok_or_else(|| {
            FlowError::not_found(ResourceKind::Version, format!("{} v{}", workflow_id, target_version))
        })
    }

    async fn list_versions(&self, workflow_id: &str) -> Result<Vec<WorkflowVersion>, FlowError> {
        let versions = self.versions.read().await;
        Ok(versions.get(workflow_id).cloned().unwrap_or_default())
    }

    async fn workflow_count(&self) -> usize {
        self.versions.read().await.len()
    }

    async fn version_count(&self) -> usize {
        self.versions.read().await.values().map(Vec::len).sum()
    }

    async fn clear(&self) {
        self.versions.write().await.clear();
    }
}
