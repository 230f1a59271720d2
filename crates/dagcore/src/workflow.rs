use crate::{FlowError, Value};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

pub type WorkflowId = String;
pub type StepId = String;

/// Complete workflow definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    #[serde(default)]
    pub id: WorkflowId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub steps: Vec<WorkflowStep>,
    /// Default variables, overridden by caller inputs at execution time
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    /// Groups run in declaration order before the dependency pass
    #[serde(default)]
    pub parallel_groups: Vec<ParallelGroup>,
    #[serde(default)]
    pub branches: Vec<ConditionalBranch>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            steps: Vec::new(),
            variables: HashMap::new(),
            parallel_groups: Vec::new(),
            branches: Vec::new(),
            timeout_ms: None,
            retry_policy: None,
        }
    }

    pub fn with_step(mut self, step: WorkflowStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    pub fn with_parallel_group<I, S>(mut self, steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<StepId>,
    {
        self.parallel_groups.push(ParallelGroup {
            name: None,
            steps: steps.into_iter().map(Into::into).collect(),
        });
        self
    }

    pub fn with_branch(mut self, branch: ConditionalBranch) -> Self {
        self.branches.push(branch);
        self
    }

    pub fn with_retry(mut self, max_attempts: u32, delay_ms: u64) -> Self {
        self.retry_policy = Some(RetryPolicy {
            max_attempts,
            delay_ms,
            backoff_multiplier: 2.0,
        });
        self
    }

    pub fn find_step(&self, id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Check structural integrity: unique step ids and no dangling references.
    ///
    /// Parallel groups run before the dependency pass, so a group member may
    /// only depend on steps that ran in an earlier group.
    pub fn validate(&self) -> Result<(), FlowError> {
        let mut ids: HashSet<&str> = HashSet::new();
        for step in &self.steps {
            if step.id.is_empty() {
                return Err(FlowError::validation("step id must not be empty"));
            }
            if !ids.insert(step.id.as_str()) {
                return Err(FlowError::validation(format!("duplicate step id '{}'", step.id)));
            }
        }

        for step in &self.steps {
            for dep in &step.dependencies {
                if !ids.contains(dep.as_str()) {
                    return Err(FlowError::validation(format!(
                        "step '{}' depends on unknown step '{}'",
                        step.id, dep
                    )));
                }
            }
        }

        let mut grouped: HashSet<&str> = HashSet::new();
        for (idx, group) in self.parallel_groups.iter().enumerate() {
            let label = group.label(idx);
            for member in &group.steps {
                if !ids.contains(member.as_str()) {
                    return Err(FlowError::validation(format!(
                        "parallel group '{}' references unknown step '{}'",
                        label, member
                    )));
                }
            }
            for member in &group.steps {
                if let Some(step) = self.find_step(member) {
                    if let Some(dep) = step.dependencies.iter().find(|d| !grouped.contains(d.as_str())) {
                        return Err(FlowError::validation(format!(
                            "parallel group '{}' member '{}' depends on '{}', which does not run in an earlier group",
                            label, member, dep
                        )));
                    }
                }
            }
            for member in &group.steps {
                if !grouped.insert(member.as_str()) {
                    return Err(FlowError::validation(format!(
                        "step '{}' appears in more than one parallel group",
                        member
                    )));
                }
            }
        }

        for branch in &self.branches {
            for target in branch.when_true.iter().chain(branch.when_false.iter()) {
                if !ids.contains(target.as_str()) {
                    return Err(FlowError::validation(format!(
                        "branch on condition '{}' references unknown step '{}'",
                        branch.condition, target
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Kind of work a step performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepType {
    #[default]
    Task,
    Transform,
    Condition,
    ParallelMarker,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::Task => "task",
            StepType::Transform => "transform",
            StepType::Condition => "condition",
            StepType::ParallelMarker => "parallel-marker",
        }
    }
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Step specification in a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: StepId,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub step_type: StepType,
    /// Executor name, resolved by the injected step executor
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<StepId>,
    /// Name of a registered condition predicate
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub retryable: bool,
}

impl WorkflowStep {
    pub fn new(id: impl Into<String>, step_type: StepType) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            step_type,
            target: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            dependencies: Vec::new(),
            condition: None,
            timeout_ms: None,
            retryable: false,
        }
    }

    pub fn task(id: impl Into<String>, target: impl Into<String>) -> Self {
        let mut step = Self::new(id, StepType::Task);
        step.target = Some(target.into());
        step
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_inputs<I, S>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs = inputs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_outputs<I, S>(mut self, outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs = outputs.into_iter().map(Into::into).collect();
        self
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<StepId>,
    {
        self.dependencies.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }
}

/// Steps executed concurrently before the dependency pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelGroup {
    #[serde(default)]
    pub name: Option<String>,
    pub steps: Vec<StepId>,
}

impl ParallelGroup {
    pub fn label(&self, index: usize) -> String {
        self.name.clone().unwrap_or_else(|| format!("#{}", index))
    }
}

/// Gates steps on a named predicate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionalBranch {
    pub condition: String,
    #[serde(default)]
    pub when_true: Vec<StepId>,
    #[serde(default)]
    pub when_false: Vec<StepId>,
}

impl ConditionalBranch {
    pub fn new(condition: impl Into<String>) -> Self {
        Self {
            condition: condition.into(),
            when_true: Vec::new(),
            when_false: Vec::new(),
        }
    }

    pub fn when_true<I, S>(mut self, steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<StepId>,
    {
        self.when_true.extend(steps.into_iter().map(Into::into));
        self
    }

    pub fn when_false<I, S>(mut self, steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<StepId>,
    {
        self.when_false.extend(steps.into_iter().map(Into::into));
        self
    }
}

/// Retry policy for retryable steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt` (1-based)
    pub fn delay_after(&self, attempt: u32) -> std::time::Duration {
        let factor = self.backoff_multiplier.max(1.0).powi(attempt.saturating_sub(1) as i32);
        std::time::Duration::from_millis((self.delay_ms as f64 * factor) as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_ms: 1000,
            backoff_multiplier: 2.0,
        }
    }
}
