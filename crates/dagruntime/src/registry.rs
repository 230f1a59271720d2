use async_trait::async_trait;
use dagcore::{ConditionPredicate, StepContext, StepError, StepExecutor, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Resolves a step's `target` to a registered executor
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn StepExecutor>>,
    fallback: Option<Arc<dyn StepExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
            fallback: None,
        }
    }

    /// Executor for steps whose target is missing or unregistered
    pub fn with_fallback(mut self, executor: Arc<dyn StepExecutor>) -> Self {
        self.fallback = Some(executor);
        self
    }

    /// Register an executor under a target name, replacing any previous one
    pub fn register(&mut self, target: impl Into<String>, executor: Arc<dyn StepExecutor>) {
        let target = target.into();
        tracing::info!("Registering step executor: {}", target);
        self.executors.insert(target, executor);
    }

    pub fn with(mut self, target: impl Into<String>, executor: Arc<dyn StepExecutor>) -> Self {
        self.register(target, executor);
        self
    }

    pub fn contains(&self, target: &str) -> bool {
        self.executors.contains_key(target)
    }

    /// All registered target names, sorted
    pub fn list_targets(&self) -> Vec<String> {
        let mut targets: Vec<String> = self.executors.keys().cloned().collect();
        targets.sort();
        targets
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StepExecutor for ExecutorRegistry {
    async fn invoke(&self, ctx: StepContext) -> Result<Value, StepError> {
        let executor = match ctx.target.as_deref() {
            Some(target) => self.executors.get(target).or(self.fallback.as_ref()).ok_or_else(|| {
                StepError::UnknownTarget(target.to_string())
            })?,
            None => self.fallback.as_ref().ok_or_else(|| {
                StepError::UnknownTarget(format!("<none> (step '{}')", ctx.step_id))
            })?,
        };

        executor.invoke(ctx).await
    }
}

/// Named condition predicates referenced by step conditions and branches
#[derive(Clone, Default)]
pub struct ConditionRegistry {
    predicates: HashMap<String, Arc<dyn ConditionPredicate>>,
}

impl ConditionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, predicate: impl ConditionPredicate + 'static) {
        self.predicates.insert(name.into(), Arc::new(predicate));
    }

    pub fn with(mut self, name: impl Into<String>, predicate: impl ConditionPredicate + 'static) -> Self {
        self.register(name, predicate);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ConditionPredicate>> {
        self.predicates.get(name).cloned()
    }

    /// Evaluate a named predicate, failing for unknown names
    pub fn evaluate(
        &self,
        name: &str,
        variables: &HashMap<String, Value>,
        step_results: &HashMap<String, Value>,
    ) -> Result<bool, StepError> {
        let predicate = self
            .get(name)
            .ok_or_else(|| StepError::UnknownCondition(name.to_string()))?;
        Ok(predicate.evaluate(variables, step_results))
    }
}
