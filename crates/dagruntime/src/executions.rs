use crate::scheduler::SharedContext;
use chrono::Utc;
use dagcore::{ExecutionContext, ExecutionId, ExecutionStatus, FlowError, ResourceKind};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

struct LiveExecution {
    context: SharedContext,
    cancel: CancellationToken,
}

/// Executions currently in flight.
///
/// Lock order is always the map first, then an execution's context.
#[derive(Default)]
pub struct ExecutionRegistry {
    live: RwLock<HashMap<ExecutionId, LiveExecution>>,
    total: AtomicU64,
}

impl ExecutionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the context running and track it until evicted
    pub async fn register(&self, mut context: ExecutionContext) -> (SharedContext, CancellationToken) {
        context.status = ExecutionStatus::Running;
        let execution_id = context.execution_id;
        let shared = Arc::new(RwLock::new(context));
        let cancel = CancellationToken::new();

        self.live.write().await.insert(
            execution_id,
            LiveExecution {
                context: shared.clone(),
                cancel: cancel.clone(),
            },
        );
        self.total.fetch_add(1, Ordering::Relaxed);

        (shared, cancel)
    }

    /// Snapshot of a live execution
    pub async fn status(&self, execution_id: ExecutionId) -> Option<ExecutionContext> {
        let context = {
            let live = self.live.read().await;
            live.get(&execution_id)?.context.clone()
        };
        let snapshot = context.read().await.clone();
        Some(snapshot)
    }

    /// Flip a running execution to cancelled and trip its token.
    ///
    /// Returns `false` when the execution exists but is no longer running.
    pub async fn cancel(&self, execution_id: ExecutionId) -> Result<bool, FlowError> {
        let live = self.live.read().await;
        let entry = live
            .get(&execution_id)
            .ok_or_else(|| FlowError::not_found(ResourceKind::Execution, execution_id.to_string()))?;

        let mut ctx = entry.context.write().await;
        if ctx.status != ExecutionStatus::Running {
            return Ok(false);
        }

        ctx.status = ExecutionStatus::Cancelled;
        ctx.end_time = Some(Utc::now());
        entry.cancel.cancel();

        tracing::info!("Cancelled execution {}", execution_id);
        Ok(true)
    }

    pub async fn evict(&self, execution_id: ExecutionId) {
        self.live.write().await.remove(&execution_id);
    }

    pub async fn active_count(&self) -> usize {
        self.live.read().await.len()
    }

    /// Executions registered since construction or the last shutdown
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Force-cancel every running execution and forget all of them.
    ///
    /// Returns how many executions were cancelled.
    pub async fn shutdown(&self) -> usize {
        let mut live = self.live.write().await;
        let mut cancelled = 0;

        for (execution_id, entry) in live.drain() {
            let mut ctx = entry.context.write().await;
            if ctx.status == ExecutionStatus::Running {
                ctx.status = ExecutionStatus::Cancelled;
                ctx.end_time = Some(Utc::now());
                cancelled += 1;
                tracing::warn!("Execution {} cancelled by shutdown", execution_id);
            }
            entry.cancel.cancel();
        }

        self.total.store(0, Ordering::Relaxed);
        cancelled
    }
}
