use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

use super::models::TaskStatus;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to open task registry {path}: {source}")]
    Open {
        source: rusqlite::Error,
        path: PathBuf,
    },
    #[error("failed to execute statement on task registry: {0}")]
    Execute(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("task registry path not configured")]
    MissingStore,
    #[error("task registry lock poisoned")]
    LockPoisoned,
    #[error("invalid task status: {0}")]
    InvalidStatus(String),
    #[error("corrupt task record: {0}")]
    Corrupt(String),
    #[error("task not found: {0}")]
    NotFound(Uuid),
    #[error("task {task_id} is already {status} and can no longer change")]
    Terminal { task_id: Uuid, status: TaskStatus },
    #[error("task {task_id} cannot move from {from} to {to}")]
    InvalidTransition {
        task_id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    },
    #[error("task {task_id} is {status}; its result is not available yet")]
    NotReady { task_id: Uuid, status: TaskStatus },
    #[error("task {0} completed without a retained export")]
    NoArtifact(Uuid),
    #[error("task {task_id} is still {status} and cannot be purged")]
    NotTerminal { task_id: Uuid, status: TaskStatus },
}

pub type RegistryResult<T> = Result<T, RegistryError>;
