use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::RegistryError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowKind {
    Current,
    Previous,
    Select,
}

impl WorkflowKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowKind::Current => "current",
            WorkflowKind::Previous => "previous",
            WorkflowKind::Select => "select",
        }
    }
}

impl fmt::Display for WorkflowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowKind {
    type Err = RegistryError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "current" => Ok(WorkflowKind::Current),
            "previous" => Ok(WorkflowKind::Previous),
            "select" => Ok(WorkflowKind::Select),
            other => Err(RegistryError::Corrupt(format!("unknown workflow `{other}`"))),
        }
    }
}

/// A workflow invocation as received from a caller, before validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRequest {
    pub workflow: WorkflowKind,
    #[serde(default)]
    pub sinks: Vec<String>,
    #[serde(default)]
    pub month: Option<u32>,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub delta: bool,
    #[serde(default)]
    pub keep: bool,
}

impl WorkflowRequest {
    pub fn new(workflow: WorkflowKind) -> Self {
        Self {
            workflow,
            sinks: Vec::new(),
            month: None,
            year: None,
            delta: false,
            keep: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// `queued -> running -> {completed | failed}`; a queued task may also
    /// fail without ever running.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Queued, TaskStatus::Running)
                | (TaskStatus::Queued, TaskStatus::Failed)
                | (TaskStatus::Running, TaskStatus::Completed)
                | (TaskStatus::Running, TaskStatus::Failed)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = RegistryError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "queued" => Ok(TaskStatus::Queued),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(RegistryError::InvalidStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Task {
    pub task_id: Uuid,
    pub request: WorkflowRequest,
    pub status: TaskStatus,
    pub error: Option<String>,
    pub artifact_path: Option<PathBuf>,
    pub has_artifact: bool,
    /// Registry handle that moved the task to `running`.
    pub owner: Option<String>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn result_available(&self) -> bool {
        self.status == TaskStatus::Completed && self.has_artifact
    }

    pub fn status_record(&self) -> TaskStatusRecord {
        let status = match (&self.status, &self.error) {
            (TaskStatus::Failed, Some(message)) => format!("failed: {message}"),
            (status, _) => status.as_str().to_string(),
        };
        TaskStatusRecord {
            task_id: self.task_id.to_string(),
            status,
            result_available: self.result_available(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Partial update; only `Some` fields overwrite the stored row.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub error: Option<String>,
    pub artifact_path: Option<PathBuf>,
    pub artifact: Option<Vec<u8>>,
}

impl TaskUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: Some(TaskStatus::Failed),
            error: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.error.is_none()
            && self.artifact_path.is_none()
            && self.artifact.is_none()
    }
}

/// Caller-facing view of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatusRecord {
    pub task_id: String,
    pub status: String,
    pub result_available: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkOutcomeStatus {
    Written,
    Failed,
}

impl SinkOutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SinkOutcomeStatus::Written => "written",
            SinkOutcomeStatus::Failed => "failed",
        }
    }
}

impl FromStr for SinkOutcomeStatus {
    type Err = RegistryError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "written" => Ok(SinkOutcomeStatus::Written),
            "failed" => Ok(SinkOutcomeStatus::Failed),
            other => Err(RegistryError::InvalidStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkOutcome {
    pub sink: String,
    pub status: SinkOutcomeStatus,
    pub readings_written: usize,
    pub watermark: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl SinkOutcome {
    pub fn written(sink: &str, readings_written: usize, watermark: Option<DateTime<Utc>>) -> Self {
        Self {
            sink: sink.to_string(),
            status: SinkOutcomeStatus::Written,
            readings_written,
            watermark,
            error: None,
        }
    }

    pub fn failed(sink: &str, watermark: Option<DateTime<Utc>>, error: impl Into<String>) -> Self {
        Self {
            sink: sink.to_string(),
            status: SinkOutcomeStatus::Failed,
            readings_written: 0,
            watermark,
            error: Some(error.into()),
        }
    }
}
