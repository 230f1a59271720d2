use crate::config::EngineConfig;
use crate::graph::StepGraph;
use crate::metrics::Metrics;
use crate::registry::ConditionRegistry;
use chrono::{DateTime, Utc};
use dagcore::metrics::{PARALLEL_GROUP_SIZE, STEP_DURATION_MS};
use dagcore::{
    EventBus, ExecutionContext, ExecutionEvent, ExecutionId, FlowError, ParallelGroup, StepContext,
    StepError, StepExecutor, StepId, StepOutcome, StepRecord, StepType, Value, WorkflowDefinition,
    WorkflowStep,
};
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Execution context shared between the scheduler and the execution registry
pub type SharedContext = Arc<RwLock<ExecutionContext>>;

/// How a scheduler run ended when it did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepRun {
    Done,
    Skipped,
    Cancelled,
}

/// Per-run borrowed state
struct RunScope<'a> {
    definition: &'a WorkflowDefinition,
    steps: HashMap<&'a str, &'a WorkflowStep>,
    context: &'a SharedContext,
    cancel: &'a CancellationToken,
    execution_id: ExecutionId,
    workflow_id: String,
}

/// Drives one workflow definition to a terminal state
pub struct DagScheduler {
    executor: Arc<dyn StepExecutor>,
    conditions: ConditionRegistry,
    events: Arc<EventBus>,
    metrics: Metrics,
    config: EngineConfig,
}

impl DagScheduler {
    pub fn new(
        executor: Arc<dyn StepExecutor>,
        conditions: ConditionRegistry,
        events: Arc<EventBus>,
        metrics: Metrics,
        config: EngineConfig,
    ) -> Self {
        Self {
            executor,
            conditions,
            events,
            metrics,
            config,
        }
    }

    /// Run parallel groups in declaration order, then every remaining step
    /// once its dependencies have executed.
    ///
    /// Results accumulate in `context` as they are produced and stay there
    /// when the run fails. Status and end time are left to the caller.
    pub async fn run(
        &self,
        definition: &WorkflowDefinition,
        context: &SharedContext,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, FlowError> {
        let graph = StepGraph::build(definition)?;
        let (execution_id, workflow_id) = {
            let ctx = context.read().await;
            (ctx.execution_id, ctx.workflow_id.clone())
        };

        let run = RunScope {
            definition,
            steps: definition.steps.iter().map(|s| (s.id.as_str(), s)).collect(),
            context,
            cancel,
            execution_id,
            workflow_id,
        };

        let mut executed: HashSet<StepId> = HashSet::new();

        for (index, group) in definition.parallel_groups.iter().enumerate() {
            if cancel.is_cancelled() {
                return Ok(RunOutcome::Cancelled);
            }
            if self.run_group(&run, index, group).await? == StepRun::Cancelled {
                return Ok(RunOutcome::Cancelled);
            }
            executed.extend(group.steps.iter().cloned());
        }

        let mut queue = graph.ready_queue(definition.steps.iter().map(|s| &s.id), &executed);

        while let Some(step_id) = queue.pop() {
            if cancel.is_cancelled() {
                return Ok(RunOutcome::Cancelled);
            }

            let step = run.steps.get(step_id.as_str()).copied().ok_or_else(|| {
                FlowError::Execution(format!("step '{}' vanished from its definition", step_id))
            })?;

            if self.run_step(&run, step).await? == StepRun::Cancelled {
                return Ok(RunOutcome::Cancelled);
            }

            executed.insert(step_id.clone());
            queue.complete(&step_id, &graph);
        }

        let stuck = queue.stuck();
        if !stuck.is_empty() {
            tracing::error!(
                "Execution {} cannot make progress, stuck steps: {}",
                execution_id,
                stuck.join(", ")
            );
            return Err(FlowError::CyclicDependency { steps: stuck });
        }

        Ok(RunOutcome::Completed)
    }

    /// Fan out all group members, then join; the first failure fails the run
    async fn run_group(
        &self,
        run: &RunScope<'_>,
        index: usize,
        group: &ParallelGroup,
    ) -> Result<StepRun, FlowError> {
        let label = group.label(index);
        let members: Vec<&WorkflowStep> = group
            .steps
            .iter()
            .filter_map(|id| run.steps.get(id.as_str()).copied())
            .collect();

        tracing::debug!("Running parallel group {} with {} steps", label, members.len());

        self.metrics.observe(
            PARALLEL_GROUP_SIZE,
            members.len() as f64,
            &[("workflow_id", run.workflow_id.as_str())],
        );
        self.events.emit(ExecutionEvent::ParallelGroupStarted {
            execution_id: run.execution_id,
            group: label,
            steps: group.steps.clone(),
            timestamp: Utc::now(),
        });

        let limit = self.config.group_concurrency(members.len());
        let pending: Vec<BoxFuture<'_, Result<StepRun, FlowError>>> = members
            .into_iter()
            .map(|step| self.run_step(run, step).boxed())
            .collect();
        let results: Vec<Result<StepRun, FlowError>> =
            stream::iter(pending).buffer_unordered(limit).collect().await;

        let mut cancelled = false;
        for result in results {
            if result? == StepRun::Cancelled {
                cancelled = true;
            }
        }

        Ok(if cancelled { StepRun::Cancelled } else { StepRun::Done })
    }

    async fn run_step(&self, run: &RunScope<'_>, step: &WorkflowStep) -> Result<StepRun, FlowError> {
        let started_at = Utc::now();
        let timer = Instant::now();

        // Markers only delimit groups; there is no work behind them.
        if step.step_type == StepType::ParallelMarker {
            self.finish(run, step, StepOutcome::Completed, started_at, 0, None).await;
            return Ok(StepRun::Done);
        }

        let gate = {
            let ctx = run.context.read().await;
            self.should_run(run.definition, step, &ctx)
        };
        let should_run = match gate {
            Ok(should_run) => should_run,
            Err(source) => return Err(self.fail(run, step, started_at, 0, source).await),
        };

        if !should_run {
            tracing::debug!("Skipping step {}: condition not met", step.id);
            self.finish(run, step, StepOutcome::Skipped, started_at, 0, None).await;
            self.events.emit(ExecutionEvent::StepSkipped {
                execution_id: run.execution_id,
                step_id: step.id.clone(),
                timestamp: Utc::now(),
            });
            return Ok(StepRun::Skipped);
        }

        let inputs = {
            let mut ctx = run.context.write().await;
            ctx.current_step = Some(step.id.clone());
            gather_inputs(step, &ctx)
        };

        tracing::debug!("Executing step {} ({})", step.id, step.step_type);
        self.events.emit(ExecutionEvent::StepStarted {
            execution_id: run.execution_id,
            step_id: step.id.clone(),
            step_type: step.step_type,
            timestamp: Utc::now(),
        });

        let (result, attempts) = match step.step_type {
            StepType::Condition => (self.evaluate_condition_step(run, step).await, 1),
            _ => self.invoke_with_retry(run, step, inputs).await,
        };

        let duration_ms = timer.elapsed().as_millis() as u64;

        match result {
            Ok(value) => {
                self.finish(run, step, StepOutcome::Completed, started_at, attempts, Some(value))
                    .await;
                self.metrics.observe(
                    STEP_DURATION_MS,
                    duration_ms as f64,
                    &[
                        ("workflow_id", run.workflow_id.as_str()),
                        ("step_id", step.id.as_str()),
                        ("outcome", "completed"),
                    ],
                );
                self.events.emit(ExecutionEvent::StepCompleted {
                    execution_id: run.execution_id,
                    step_id: step.id.clone(),
                    duration_ms,
                    timestamp: Utc::now(),
                });
                tracing::debug!("Step {} completed in {}ms", step.id, duration_ms);
                Ok(StepRun::Done)
            }
            Err(StepError::Cancelled) if run.cancel.is_cancelled() => {
                tracing::info!("Step {} stopped by cancellation", step.id);
                Ok(StepRun::Cancelled)
            }
            Err(source) => {
                self.metrics.observe(
                    STEP_DURATION_MS,
                    duration_ms as f64,
                    &[
                        ("workflow_id", run.workflow_id.as_str()),
                        ("step_id", step.id.as_str()),
                        ("outcome", "failed"),
                    ],
                );
                Err(self.fail(run, step, started_at, attempts, source).await)
            }
        }
    }

    /// Branch gates first, then the step's own condition
    fn should_run(
        &self,
        definition: &WorkflowDefinition,
        step: &WorkflowStep,
        ctx: &ExecutionContext,
    ) -> Result<bool, StepError> {
        for branch in &definition.branches {
            let on_true = branch.when_true.contains(&step.id);
            let on_false = branch.when_false.contains(&step.id);
            if !on_true && !on_false {
                continue;
            }

            let holds = self
                .conditions
                .evaluate(&branch.condition, &ctx.variables, &ctx.step_results)?;
            if (on_true && !holds) || (on_false && holds) {
                return Ok(false);
            }
        }

        // A condition step's predicate is its work, not its gate.
        match (&step.condition, step.step_type) {
            (Some(name), t) if t != StepType::Condition => {
                self.conditions.evaluate(name, &ctx.variables, &ctx.step_results)
            }
            _ => Ok(true),
        }
    }

    async fn evaluate_condition_step(
        &self,
        run: &RunScope<'_>,
        step: &WorkflowStep,
    ) -> Result<Value, StepError> {
        let name = step
            .condition
            .as_deref()
            .ok_or_else(|| StepError::UnknownCondition(format!("<none> (step '{}')", step.id)))?;

        let ctx = run.context.read().await;
        self.conditions
            .evaluate(name, &ctx.variables, &ctx.step_results)
            .map(Value::Bool)
    }

    /// Invoke the executor, retrying retryable steps per the definition's policy
    async fn invoke_with_retry(
        &self,
        run: &RunScope<'_>,
        step: &WorkflowStep,
        inputs: HashMap<String, Option<Value>>,
    ) -> (Result<Value, StepError>, u32) {
        let policy = if step.retryable {
            run.definition.retry_policy.as_ref()
        } else {
            None
        };
        let max_attempts = policy.map_or(1, |p| p.max_attempts.max(1));
        let mut attempt = 1;

        loop {
            let ctx = StepContext {
                execution_id: run.execution_id,
                workflow_id: run.workflow_id.clone(),
                step_id: step.id.clone(),
                step_type: step.step_type,
                target: step.target.clone(),
                inputs: inputs.clone(),
                timeout_ms: step.timeout_ms.or(run.definition.timeout_ms),
                attempt,
                events: self.events.create_emitter(run.execution_id, step.id.clone()),
                cancellation: run.cancel.clone(),
            };

            // A panicking executor fails the step instead of the execution task.
            let executor = self.executor.clone();
            let result = match tokio::spawn(async move { executor.invoke(ctx).await }).await {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!("Executor for step {} did not finish: {}", step.id, e);
                    Err(StepError::ExecutionFailed(format!("executor task failed: {}", e)))
                }
            };

            match (result, policy) {
                (Err(err), Some(policy))
                    if attempt < max_attempts
                        && !run.cancel.is_cancelled()
                        && !matches!(err, StepError::Cancelled) =>
                {
                    let delay = policy.delay_after(attempt);
                    tracing::warn!(
                        "Step {} failed on attempt {}/{}: {}; retrying in {:?}",
                        step.id,
                        attempt,
                        max_attempts,
                        err,
                        delay
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = run.cancel.cancelled() => return (Err(StepError::Cancelled), attempt),
                    }
                    attempt += 1;
                }
                (result, _) => return (result, attempt),
            }
        }
    }

    /// Record a finished step and store its declared outputs
    async fn finish(
        &self,
        run: &RunScope<'_>,
        step: &WorkflowStep,
        outcome: StepOutcome,
        started_at: DateTime<Utc>,
        attempts: u32,
        result: Option<Value>,
    ) {
        let mut ctx = run.context.write().await;
        if let Some(value) = result {
            store_outputs(step, value, &mut ctx);
        }
        ctx.history.push(StepRecord {
            step_id: step.id.clone(),
            outcome,
            started_at,
            finished_at: Utc::now(),
            attempts,
        });
    }

    async fn fail(
        &self,
        run: &RunScope<'_>,
        step: &WorkflowStep,
        started_at: DateTime<Utc>,
        attempts: u32,
        source: StepError,
    ) -> FlowError {
        tracing::error!("Step {} failed: {}", step.id, source);

        self.finish(run, step, StepOutcome::Failed, started_at, attempts, None).await;
        self.events.emit(ExecutionEvent::StepFailed {
            execution_id: run.execution_id,
            step_id: step.id.clone(),
            error: source.to_string(),
            timestamp: Utc::now(),
        });

        FlowError::StepExecution {
            step_id: step.id.clone(),
            source,
        }
    }
}

/// Resolve each declared input from variables, then step results
fn gather_inputs(step: &WorkflowStep, ctx: &ExecutionContext) -> HashMap<String, Option<Value>> {
    step.inputs
        .iter()
        .map(|name| (name.clone(), ctx.resolve(name).cloned()))
        .collect()
}

/// One declared output takes the raw result; several pick keys from a map result
fn store_outputs(step: &WorkflowStep, result: Value, ctx: &mut ExecutionContext) {
    match step.outputs.as_slice() {
        [] => {}
        [single] => {
            ctx.step_results.insert(single.clone(), result);
        }
        declared => match result {
            Value::Object(mut map) => {
                for key in declared {
                    if let Some(value) = map.remove(key) {
                        ctx.step_results.insert(key.clone(), value);
                    }
                }
            }
            other => tracing::warn!(
                "Step {} declares {} outputs but returned {}, nothing stored",
                step.id,
                declared.len(),
                other.type_name()
            ),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn context() -> ExecutionContext {
        ExecutionContext::new("wf", 1, &HashMap::new(), HashMap::new())
    }

    #[test]
    fn single_output_stores_raw_result() {
        let step = WorkflowStep::task("s", "t").with_outputs(["draft"]);
        let mut ctx = context();
        store_outputs(&step, Value::from("text"), &mut ctx);
        assert_eq!(ctx.step_results["draft"].as_str(), Some("text"));
    }

    #[test]
    fn multiple_outputs_copy_declared_keys_only() {
        let step = WorkflowStep::task("s", "t").with_outputs(["title", "body", "missing"]);
        let mut map = HashMap::new();
        map.insert("title".to_string(), Value::from("T"));
        map.insert("body".to_string(), Value::from("B"));
        map.insert("extra".to_string(), Value::from("X"));

        let mut ctx = context();
        store_outputs(&step, Value::Object(map), &mut ctx);

        assert_eq!(ctx.step_results.len(), 2);
        assert_eq!(ctx.step_results["title"].as_str(), Some("T"));
        assert!(!ctx.step_results.contains_key("extra"));
        assert!(!ctx.step_results.contains_key("missing"));
    }

    #[test]
    fn multiple_outputs_ignore_non_map_results() {
        let step = WorkflowStep::task("s", "t").with_outputs(["a", "b"]);
        let mut ctx = context();
        store_outputs(&step, Value::from("scalar"), &mut ctx);
        assert!(ctx.step_results.is_empty());
    }

    #[test]
    fn inputs_fall_back_to_results_and_mark_absent() {
        let step = WorkflowStep::task("s", "t").with_inputs(["topic", "draft", "ghost"]);
        let mut ctx = context();
        ctx.variables.insert("topic".to_string(), Value::from("rust"));
        ctx.step_results.insert("draft".to_string(), Value::from("text"));

        let inputs = gather_inputs(&step, &ctx);
        assert_eq!(inputs["topic"], Some(Value::from("rust")));
        assert_eq!(inputs["draft"], Some(Value::from("text")));
        assert_eq!(inputs["ghost"], None);
    }
}
