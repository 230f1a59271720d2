use crate::config::EngineConfig;
use crate::executions::ExecutionRegistry;
use crate::metrics::Metrics;
use crate::registry::ConditionRegistry;
use crate::scheduler::{DagScheduler, RunOutcome, SharedContext};
use crate::templates::TemplateRegistry;
use crate::versions::{InMemoryVersionStore, VersionStore};
use chrono::Utc;
use dagcore::metrics::{
    EXECUTIONS_CANCELLED, EXECUTIONS_COMPLETED, EXECUTIONS_FAILED, EXECUTIONS_STARTED,
    EXECUTION_DURATION_MS, ROLLBACKS, VERSIONS_CREATED,
};
use dagcore::{
    EventBus, ExecutionContext, ExecutionEvent, ExecutionFailure, ExecutionId, ExecutionStatistics,
    ExecutionStatus, FlowError, MetricsSink, ResourceKind, StepExecutor, Value, WorkflowDefinition,
    WorkflowTemplate, WorkflowVersion,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Facade over versions, templates, executions and the scheduler
#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    versions: Arc<dyn VersionStore>,
    templates: TemplateRegistry,
    executions: ExecutionRegistry,
    scheduler: DagScheduler,
    event_bus: Arc<EventBus>,
    metrics: Metrics,
    config: EngineConfig,
}

/// Builder for [`WorkflowEngine`]; only the step executor is mandatory
pub struct EngineBuilder {
    executor: Arc<dyn StepExecutor>,
    config: EngineConfig,
    conditions: ConditionRegistry,
    metrics: Option<Arc<dyn MetricsSink>>,
    version_store: Option<Arc<dyn VersionStore>>,
}

impl EngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn conditions(mut self, conditions: ConditionRegistry) -> Self {
        self.conditions = conditions;
        self
    }

    pub fn metrics(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(sink);
        self
    }

    pub fn version_store(mut self, store: Arc<dyn VersionStore>) -> Self {
        self.version_store = Some(store);
        self
    }

    pub fn build(self) -> Result<WorkflowEngine, FlowError> {
        self.config.validate()?;

        let versions = self
            .version_store
            .unwrap_or_else(|| Arc::new(InMemoryVersionStore::new()));
        let event_bus = Arc::new(EventBus::new(self.config.event_buffer_size));
        let metrics = Metrics::new(self.metrics);
        let scheduler = DagScheduler::new(
            self.executor,
            self.conditions,
            event_bus.clone(),
            metrics.clone(),
            self.config.clone(),
        );

        Ok(WorkflowEngine {
            inner: Arc::new(EngineInner {
                templates: TemplateRegistry::new(versions.clone()),
                versions,
                executions: ExecutionRegistry::new(),
                scheduler,
                event_bus,
                metrics,
                config: self.config,
            }),
        })
    }
}

/// A workflow execution running on its own task
pub struct ExecutionHandle {
    pub execution_id: ExecutionId,
    handle: JoinHandle<ExecutionContext>,
}

impl ExecutionHandle {
    /// Wait for the execution to reach a terminal status
    pub async fn wait(self) -> Result<ExecutionContext, FlowError> {
        self.handle
            .await
            .map_err(|e| FlowError::Execution(format!("execution task failed: {}", e)))
    }
}

impl WorkflowEngine {
    pub fn builder(executor: Arc<dyn StepExecutor>) -> EngineBuilder {
        EngineBuilder {
            executor,
            config: EngineConfig::default(),
            conditions: ConditionRegistry::new(),
            metrics: None,
            version_store: None,
        }
    }

    /// Engine with default configuration, no conditions and no metrics
    pub fn new(executor: Arc<dyn StepExecutor>) -> Result<Self, FlowError> {
        Self::builder(executor).build()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    // Versions

    pub async fn create_version(
        &self,
        workflow_id: &str,
        definition: WorkflowDefinition,
        changelog: Option<String>,
        created_by: Option<String>,
    ) -> Result<WorkflowVersion, FlowError> {
        let version = self
            .inner
            .versions
            .create_version(workflow_id, definition, changelog, created_by)
            .await?;
        self.inner
            .metrics
            .increment(VERSIONS_CREATED, &[("workflow_id", workflow_id)]);
        Ok(version)
    }

    /// `None` selects the active version
    pub async fn get_version(
        &self,
        workflow_id: &str,
        version: Option<u32>,
    ) -> Result<Option<WorkflowVersion>, FlowError> {
        self.inner.versions.get_version(workflow_id, version).await
    }

    pub async fn rollback(
        &self,
        workflow_id: &str,
        target_version: u32,
        reason: Option<&str>,
    ) -> Result<WorkflowVersion, FlowError> {
        let version = self
            .inner
            .versions
            .rollback(workflow_id, target_version, reason)
            .await?;
        self.inner
            .metrics
            .increment(ROLLBACKS, &[("workflow_id", workflow_id)]);
        Ok(version)
    }

    pub async fn list_versions(&self, workflow_id: &str) -> Result<Vec<WorkflowVersion>, FlowError> {
        self.inner.versions.list_versions(workflow_id).await
    }

    // Templates

    pub async fn register_template(&self, template: WorkflowTemplate) {
        self.inner.templates.register_template(template).await;
    }

    pub async fn get_template(&self, template_id: &str) -> Option<WorkflowTemplate> {
        self.inner.templates.get_template(template_id).await
    }

    pub async fn list_templates(&self, category: Option<&str>) -> Vec<WorkflowTemplate> {
        self.inner.templates.list_templates(category).await
    }

    /// Create a new active version from a template
    pub async fn instantiate(
        &self,
        template_id: &str,
        parameters: HashMap<String, Value>,
        workflow_id: Option<&str>,
    ) -> Result<WorkflowVersion, FlowError> {
        let version = self
            .inner
            .templates
            .instantiate(template_id, parameters, workflow_id)
            .await?;
        self.inner
            .metrics
            .increment(VERSIONS_CREATED, &[("workflow_id", version.workflow_id.as_str())]);
        Ok(version)
    }

    // Executions

    /// Run a workflow version to completion.
    ///
    /// Only an unknown workflow or version is returned as an error; step
    /// failures and cycles come back as a `failed` context.
    pub async fn execute_workflow(
        &self,
        workflow_id: &str,
        inputs: HashMap<String, Value>,
        version: Option<u32>,
    ) -> Result<ExecutionContext, FlowError> {
        let (definition, context, cancel) = self.start(workflow_id, inputs, version).await?;
        Ok(self.inner.drive(definition, context, cancel).await)
    }

    /// Register an execution and run it on a background task
    pub async fn spawn_workflow(
        &self,
        workflow_id: &str,
        inputs: HashMap<String, Value>,
        version: Option<u32>,
    ) -> Result<ExecutionHandle, FlowError> {
        let (definition, context, cancel) = self.start(workflow_id, inputs, version).await?;
        let execution_id = context.read().await.execution_id;

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move { inner.drive(definition, context, cancel).await });

        Ok(ExecutionHandle {
            execution_id,
            handle,
        })
    }

    /// Snapshot of an execution that is still registered
    pub async fn get_execution_status(&self, execution_id: ExecutionId) -> Option<ExecutionContext> {
        self.inner.executions.status(execution_id).await
    }

    /// Cooperatively cancel a running execution.
    ///
    /// Returns `false` if the execution had already left `running`.
    pub async fn cancel_execution(&self, execution_id: ExecutionId) -> Result<bool, FlowError> {
        self.inner.executions.cancel(execution_id).await
    }

    pub async fn get_statistics(&self) -> ExecutionStatistics {
        ExecutionStatistics {
            total_workflows: self.inner.versions.workflow_count().await,
            total_versions: self.inner.versions.version_count().await,
            total_templates: self.inner.templates.count().await,
            active_executions: self.inner.executions.active_count().await,
            total_executions: self.inner.executions.total(),
        }
    }

    /// Cancel running executions and drop all versions, templates and executions
    pub async fn shutdown(&self) {
        let cancelled = self.inner.executions.shutdown().await;
        self.inner.versions.clear().await;
        self.inner.templates.clear().await;
        tracing::info!("Workflow engine shut down ({} executions cancelled)", cancelled);
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.inner.event_bus.subscribe()
    }

    async fn start(
        &self,
        workflow_id: &str,
        inputs: HashMap<String, Value>,
        version: Option<u32>,
    ) -> Result<(WorkflowDefinition, SharedContext, CancellationToken), FlowError> {
        let resolved = match self.inner.versions.get_version(workflow_id, version).await? {
            Some(resolved) => resolved,
            None => return Err(self.missing_version(workflow_id, version).await),
        };

        let context = ExecutionContext::new(
            workflow_id,
            resolved.version,
            &resolved.definition.variables,
            inputs,
        );
        let execution_id = context.execution_id;
        let (context, cancel) = self.inner.executions.register(context).await;

        tracing::info!(
            "Starting execution {} of {} v{}",
            execution_id,
            workflow_id,
            resolved.version
        );
        self.inner
            .metrics
            .increment(EXECUTIONS_STARTED, &[("workflow_id", workflow_id)]);
        self.inner.event_bus.emit(ExecutionEvent::ExecutionStarted {
            execution_id,
            workflow_id: workflow_id.to_string(),
            version: resolved.version,
            timestamp: Utc::now(),
        });

        Ok((resolved.definition, context, cancel))
    }

    async fn missing_version(&self, workflow_id: &str, version: Option<u32>) -> FlowError {
        let known = match self.inner.versions.list_versions(workflow_id).await {
            Ok(versions) => !versions.is_empty(),
            Err(_) => false,
        };

        match version {
            Some(number) if known => {
                FlowError::not_found(ResourceKind::Version, format!("{} v{}", workflow_id, number))
            }
            _ => FlowError::not_found(ResourceKind::Workflow, workflow_id),
        }
    }
}

impl EngineInner {
    async fn drive(
        &self,
        definition: WorkflowDefinition,
        context: SharedContext,
        cancel: CancellationToken,
    ) -> ExecutionContext {
        let outcome = self.scheduler.run(&definition, &context, &cancel).await;
        self.finalize(&context, outcome).await
    }

    /// Settle the final status, report it and evict the execution
    async fn finalize(
        &self,
        context: &SharedContext,
        outcome: Result<RunOutcome, FlowError>,
    ) -> ExecutionContext {
        let snapshot = {
            let mut ctx = context.write().await;

            // A cancel that landed mid-run already set the terminal status.
            if ctx.status == ExecutionStatus::Running {
                match &outcome {
                    Ok(RunOutcome::Completed) => ctx.status = ExecutionStatus::Completed,
                    Ok(RunOutcome::Cancelled) => ctx.status = ExecutionStatus::Cancelled,
                    Err(e) => {
                        ctx.status = ExecutionStatus::Failed;
                        ctx.error = Some(ExecutionFailure::from(e));
                    }
                }
            }
            if ctx.end_time.is_none() {
                ctx.end_time = Some(Utc::now());
            }
            ctx.clone()
        };

        let duration_ms = snapshot.duration_ms().unwrap_or(0).max(0) as u64;
        let labels = [
            ("workflow_id", snapshot.workflow_id.as_str()),
            ("status", snapshot.status.as_str()),
        ];

        match snapshot.status {
            ExecutionStatus::Completed => {
                tracing::info!(
                    "Execution {} of {} completed in {}ms",
                    snapshot.execution_id,
                    snapshot.workflow_id,
                    duration_ms
                );
                self.metrics.increment(EXECUTIONS_COMPLETED, &labels[..1]);
            }
            ExecutionStatus::Failed => {
                tracing::error!(
                    "Execution {} of {} failed: {}",
                    snapshot.execution_id,
                    snapshot.workflow_id,
                    snapshot
                        .error
                        .as_ref()
                        .map(ToString::to_string)
                        .unwrap_or_default()
                );
                self.metrics.increment(EXECUTIONS_FAILED, &labels[..1]);
            }
            _ => {
                tracing::info!("Execution {} of {} cancelled", snapshot.execution_id, snapshot.workflow_id);
                self.metrics.increment(EXECUTIONS_CANCELLED, &labels[..1]);
            }
        }
        self.metrics
            .observe(EXECUTION_DURATION_MS, duration_ms as f64, &labels);

        self.event_bus.emit(ExecutionEvent::ExecutionFinished {
            execution_id: snapshot.execution_id,
            status: snapshot.status,
            duration_ms,
            timestamp: Utc::now(),
        });

        self.executions.evict(snapshot.execution_id).await;
        snapshot
    }
}
