//! Runtime for versioned DAG workflows
//!
//! Version store, template registry, execution registry and the DAG
//! scheduler, tied together by [`WorkflowEngine`].

pub mod config;
pub mod engine;
pub mod executions;
pub mod graph;
pub mod metrics;
pub mod registry;
pub mod scheduler;
pub mod telemetry;
pub mod templates;
pub mod versions;

pub use config::EngineConfig;
pub use engine::{EngineBuilder, ExecutionHandle, WorkflowEngine};
pub use executions::ExecutionRegistry;
pub use graph::StepGraph;
pub use metrics::{InMemoryMetrics, Metrics};
pub use registry::{ConditionRegistry, ExecutorRegistry};
pub use scheduler::{DagScheduler, RunOutcome, SharedContext};
pub use telemetry::init_tracing;
pub use templates::TemplateRegistry;
pub use versions::{InMemoryVersionStore, VersionStore};

pub use dagcore::*;
