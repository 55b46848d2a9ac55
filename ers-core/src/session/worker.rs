use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

use crate::task::{TaskStatus, WorkflowRequest};

use super::controller::{SessionController, TaskReport};
use super::error::WorkflowError;

pub const INTERRUPTED_MESSAGE: &str = "interrupted before completion";

/// A running task whose heartbeat is older than this belongs to a process
/// that is gone.
pub const STALE_AFTER: Duration = Duration::from_secs(60);

pub type TaskResult = (Uuid, Result<TaskReport, WorkflowError>);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub interrupted: Vec<Uuid>,
    pub dispatched: Vec<Uuid>,
}

/// Executes queued tasks on the runtime, one tokio task per workflow.
/// Concurrency is left to the caller.
pub struct TaskDispatcher {
    controller: Arc<SessionController>,
    tasks: JoinSet<TaskResult>,
}

impl TaskDispatcher {
    pub fn new(controller: Arc<SessionController>) -> Self {
        Self {
            controller,
            tasks: JoinSet::new(),
        }
    }

    pub fn controller(&self) -> &Arc<SessionController> {
        &self.controller
    }

    /// Queues the request and starts it right away. The id is returned
    /// before the workflow makes any progress.
    pub fn submit(&mut self, request: WorkflowRequest) -> Result<Uuid, WorkflowError> {
        let task_id = self.controller.enqueue(request)?;
        self.dispatch(task_id);
        Ok(task_id)
    }

    pub fn dispatch(&mut self, task_id: Uuid) {
        let controller = Arc::clone(&self.controller);
        self.tasks
            .spawn(async move { (task_id, controller.execute(task_id).await) });
    }

    /// Fails tasks a dead process left `running`, then dispatches
    /// everything still queued. Running tasks with a fresh heartbeat belong
    /// to a live process and are left alone.
    pub fn recover(&mut self) -> Result<RecoveryReport, WorkflowError> {
        let now = self.controller.now();
        let stale_before = now - chrono::Duration::seconds(STALE_AFTER.as_secs() as i64);
        let interrupted = self
            .controller
            .registry()
            .fail_interrupted(INTERRUPTED_MESSAGE, stale_before, now)?;
        for task_id in &interrupted {
            warn!(%task_id, "task was interrupted before completion");
        }
        let dispatched = self.dispatch_pending()?;
        Ok(RecoveryReport {
            interrupted,
            dispatched,
        })
    }

    pub fn dispatch_pending(&mut self) -> Result<Vec<Uuid>, WorkflowError> {
        let queued = self
            .controller
            .registry()
            .list(Some(TaskStatus::Queued))?;
        let ids: Vec<Uuid> = queued.iter().map(|task| task.task_id).collect();
        for task_id in &ids {
            self.dispatch(*task_id);
        }
        if !ids.is_empty() {
            info!(count = ids.len(), "dispatched queued tasks");
        }
        Ok(ids)
    }

    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    pub async fn join_next(&mut self) -> Option<TaskResult> {
        loop {
            match self.tasks.join_next().await? {
                Ok(result) => return Some(result),
                Err(err) => warn!(error = %err, "workflow task aborted"),
            }
        }
    }

    /// Waits for every dispatched task.
    pub async fn drain(&mut self) -> Vec<TaskResult> {
        let mut results = Vec::with_capacity(self.tasks.len());
        while let Some(result) = self.join_next().await {
            results.push(result);
        }
        results
    }
}
