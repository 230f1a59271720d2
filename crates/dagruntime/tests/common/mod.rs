// Shared helpers for the engine integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use dagcore::metrics::Labels;
use dagruntime::{
    ConditionRegistry, ExecutorRegistry, MetricsError, MetricsSink, StepContext, StepError,
    StepExecutor, Value, WorkflowEngine,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Barrier, Notify};

/// Ordered log of "start:<step>" / "end:<step>" entries
#[derive(Default)]
pub struct Journal(Mutex<Vec<String>>);

impl Journal {
    pub fn push(&self, entry: String) {
        self.0.lock().unwrap().push(entry);
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries().iter().position(|e| e == entry)
    }

    pub fn started(&self, step_id: &str) -> bool {
        self.position(&format!("start:{}", step_id)).is_some()
    }
}

/// Returns "<step>-result", or the value of its first input when it has one
pub struct Echo {
    pub journal: Arc<Journal>,
}

#[async_trait]
impl StepExecutor for Echo {
    async fn invoke(&self, ctx: StepContext) -> Result<Value, StepError> {
        self.journal.push(format!("start:{}", ctx.step_id));
        ctx.events.info(format!("echo {}", ctx.step_id));

        let mut names: Vec<&String> = ctx.inputs.keys().collect();
        names.sort();
        let result = match names.first().and_then(|name| ctx.input(name)) {
            Some(value) => value.clone(),
            None => Value::from(format!("{}-result", ctx.step_id)),
        };

        self.journal.push(format!("end:{}", ctx.step_id));
        Ok(result)
    }
}

/// Always fails
pub struct Fail;

#[async_trait]
impl StepExecutor for Fail {
    async fn invoke(&self, ctx: StepContext) -> Result<Value, StepError> {
        Err(StepError::ExecutionFailed(format!("{} exploded", ctx.step_id)))
    }
}

/// Fails the first `failures` attempts, then succeeds
pub struct Flaky {
    pub failures: u32,
    pub calls: Arc<Mutex<Vec<u32>>>,
}

#[async_trait]
impl StepExecutor for Flaky {
    async fn invoke(&self, ctx: StepContext) -> Result<Value, StepError> {
        self.calls.lock().unwrap().push(ctx.attempt);
        if ctx.attempt <= self.failures {
            return Err(StepError::ExecutionFailed(format!("attempt {} failed", ctx.attempt)));
        }
        Ok(Value::from(format!("succeeded on attempt {}", ctx.attempt)))
    }
}

/// Waits at a shared barrier, so it only finishes when its peers run concurrently
pub struct Rendezvous {
    pub barrier: Arc<Barrier>,
    pub journal: Arc<Journal>,
}

#[async_trait]
impl StepExecutor for Rendezvous {
    async fn invoke(&self, ctx: StepContext) -> Result<Value, StepError> {
        self.journal.push(format!("start:{}", ctx.step_id));
        tokio::time::timeout(Duration::from_secs(5), self.barrier.wait())
            .await
            .map_err(|_| StepError::Timeout { ms: 5000 })?;
        self.journal.push(format!("end:{}", ctx.step_id));
        Ok(Value::from(format!("{}-result", ctx.step_id)))
    }
}

/// Blocks until the execution is cancelled
pub struct Blocking {
    pub started: Arc<Notify>,
}

#[async_trait]
impl StepExecutor for Blocking {
    async fn invoke(&self, ctx: StepContext) -> Result<Value, StepError> {
        self.started.notify_one();
        tokio::select! {
            _ = ctx.cancellation.cancelled() => Err(StepError::Cancelled),
            _ = tokio::time::sleep(Duration::from_secs(30)) => Ok(Value::Null),
        }
    }
}

/// Returns a map with `title`, `body` and `extra` keys
pub struct Split;

#[async_trait]
impl StepExecutor for Split {
    async fn invoke(&self, _ctx: StepContext) -> Result<Value, StepError> {
        let mut map = HashMap::new();
        map.insert("title".to_string(), Value::from("Title"));
        map.insert("body".to_string(), Value::from("Body"));
        map.insert("extra".to_string(), Value::from("ignored"));
        Ok(Value::Object(map))
    }
}

/// Writes a report on its `topic` input, streaming progress and the outline
pub struct Report;

#[async_trait]
impl StepExecutor for Report {
    async fn invoke(&self, ctx: StepContext) -> Result<Value, StepError> {
        let topic = ctx.require_str("topic")?;
        ctx.events.progress(0.0, Some(format!("outlining {}", topic)));

        let outline = Value::from(format!("outline of {}", topic));
        ctx.events.data("outline", outline.clone());
        ctx.events.progress(100.0, None);

        Ok(Value::from(format!("report on {} ({})", topic, outline)))
    }
}

/// Panics instead of returning
pub struct Panicking;

#[async_trait]
impl StepExecutor for Panicking {
    async fn invoke(&self, ctx: StepContext) -> Result<Value, StepError> {
        panic!("{} lost its mind", ctx.step_id);
    }
}

/// Metrics sink that rejects everything
pub struct BrokenSink;

impl MetricsSink for BrokenSink {
    fn increment_counter(&self, name: &str, _labels: Labels<'_>) -> Result<(), MetricsError> {
        Err(MetricsError::Unavailable(format!("cannot record {}", name)))
    }

    fn record_histogram(
        &self,
        name: &str,
        _value_ms: f64,
        _labels: Labels<'_>,
    ) -> Result<(), MetricsError> {
        Err(MetricsError::Unavailable(format!("cannot record {}", name)))
    }
}

pub struct Harness {
    pub journal: Arc<Journal>,
    pub barrier: Arc<Barrier>,
    pub started: Arc<Notify>,
    pub flaky_calls: Arc<Mutex<Vec<u32>>>,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            journal: Arc::new(Journal::default()),
            barrier: Arc::new(Barrier::new(2)),
            started: Arc::new(Notify::new()),
            flaky_calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Targets: echo (also the fallback), fail, flaky, rendezvous, blocking, split,
    /// report, panic
    pub fn executors(&self) -> ExecutorRegistry {
        ExecutorRegistry::new()
            .with(
                "echo",
                Arc::new(Echo {
                    journal: self.journal.clone(),
                }),
            )
            .with("fail", Arc::new(Fail))
            .with(
                "flaky",
                Arc::new(Flaky {
                    failures: 2,
                    calls: self.flaky_calls.clone(),
                }),
            )
            .with(
                "rendezvous",
                Arc::new(Rendezvous {
                    barrier: self.barrier.clone(),
                    journal: self.journal.clone(),
                }),
            )
            .with(
                "blocking",
                Arc::new(Blocking {
                    started: self.started.clone(),
                }),
            )
            .with("split", Arc::new(Split))
            .with("report", Arc::new(Report))
            .with("panic", Arc::new(Panicking))
            .with_fallback(Arc::new(Echo {
                journal: self.journal.clone(),
            }))
    }

    pub fn engine(&self) -> WorkflowEngine {
        self.engine_with(ConditionRegistry::new())
    }

    pub fn engine_with(&self, conditions: ConditionRegistry) -> WorkflowEngine {
        WorkflowEngine::builder(Arc::new(self.executors()))
            .conditions(conditions)
            .build()
            .unwrap()
    }
}

pub fn params<const N: usize>(pairs: [(&str, Value); N]) -> HashMap<String, Value> {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

/// Condition registry with `always`, `never` and `is_urgent` (variable `urgent` is true)
pub fn conditions() -> ConditionRegistry {
    ConditionRegistry::new()
        .with(
            "always",
            |_: &HashMap<String, Value>, _: &HashMap<String, Value>| true,
        )
        .with(
            "never",
            |_: &HashMap<String, Value>, _: &HashMap<String, Value>| false,
        )
        .with(
            "is_urgent",
            |vars: &HashMap<String, Value>, _: &HashMap<String, Value>| {
                vars.get("urgent").and_then(Value::as_bool).unwrap_or(false)
            },
        )
}
