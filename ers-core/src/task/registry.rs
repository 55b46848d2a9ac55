use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Value;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use tracing::{debug, info};
use uuid::Uuid;

use crate::sqlite::{configure_connection, BUSY_TIMEOUT};

use super::error::{RegistryError, RegistryResult};
use super::models::{
    SinkOutcome, Task, TaskStatus, TaskUpdate, WorkflowKind, WorkflowRequest,
};

const TASKS_SCHEMA: &str = include_str!("../../../sql/tasks.sql");

const TASK_COLUMNS: &str = "task_id, workflow, sinks, month, year, delta, keep, status, error, \
     artifact_path, artifact IS NOT NULL AS has_artifact, owner, heartbeat_at, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct TaskRegistryBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for TaskRegistryBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl TaskRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> RegistryResult<TaskRegistry> {
        let path = self.path.ok_or(RegistryError::MissingStore)?;
        let mut flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };
        if !self.read_only && self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
        }
        let open_err = |source| RegistryError::Open {
            source,
            path: path.clone(),
        };
        let conn = Connection::open_with_flags(&path, flags).map_err(open_err)?;
        if self.read_only {
            conn.busy_timeout(BUSY_TIMEOUT).map_err(open_err)?;
        } else {
            configure_connection(&conn).map_err(open_err)?;
        }
        Ok(TaskRegistry {
            path,
            owner: format!("{}-{}", std::process::id(), Uuid::new_v4().simple()),
            conn: Mutex::new(conn),
        })
    }
}

/// Durable task store shared by every task in the process. All access goes
/// through one connection behind a mutex, so each operation is a single
/// critical section.
///
/// Each handle has an owner tag. Tasks it moves to `running` carry that tag
/// and a heartbeat, so other processes sharing the file can tell a live task
/// from one whose process is gone.
#[derive(Debug)]
pub struct TaskRegistry {
    path: PathBuf,
    owner: String,
    conn: Mutex<Connection>,
}

impl TaskRegistry {
    pub fn builder() -> TaskRegistryBuilder {
        TaskRegistryBuilder::new()
    }

    pub fn open(path: impl AsRef<Path>) -> RegistryResult<Self> {
        let registry = TaskRegistryBuilder::new().path(path).build()?;
        registry.initialize()?;
        Ok(registry)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    fn lock(&self) -> RegistryResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| RegistryError::LockPoisoned)
    }

    pub fn initialize(&self) -> RegistryResult<()> {
        let conn = self.lock()?;
        conn.execute_batch(TASKS_SCHEMA)?;
        Ok(())
    }

    /// Inserts a new task row with the given initial status.
    pub fn create(
        &self,
        task_id: Uuid,
        request: &WorkflowRequest,
        status: TaskStatus,
        now: DateTime<Utc>,
    ) -> RegistryResult<Task> {
        if status.is_terminal() {
            return Err(RegistryError::InvalidStatus(status.to_string()));
        }
        let sinks = serde_json::to_string(&request.sinks)
            .map_err(|err| RegistryError::Corrupt(err.to_string()))?;
        let stamp = format_timestamp(now);
        let (owner, heartbeat) = match status {
            TaskStatus::Running => (Some(self.owner.as_str()), Some(stamp.as_str())),
            _ => (None, None),
        };
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO tasks (
                task_id, workflow, sinks, month, year, delta, keep, status, owner, heartbeat_at,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
            params![
                task_id.to_string(),
                request.workflow.as_str(),
                sinks,
                request.month,
                request.year,
                request.delta,
                request.keep,
                status.as_str(),
                owner,
                heartbeat,
                stamp,
            ],
        )?;
        debug!(task_id = %task_id, status = %status, "task created");
        fetch_task(&conn, task_id)?.ok_or(RegistryError::NotFound(task_id))
    }

    /// Applies the non-null fields of `update`. Terminal tasks are immutable
    /// and status changes must follow the lifecycle.
    pub fn update(
        &self,
        task_id: Uuid,
        update: &TaskUpdate,
        now: DateTime<Utc>,
    ) -> RegistryResult<Task> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let current = current_status(&tx, task_id)?;
        if current.is_terminal() {
            return Err(RegistryError::Terminal {
                task_id,
                status: current,
            });
        }
        if let Some(next) = update.status {
            if !current.can_transition_to(next) {
                return Err(RegistryError::InvalidTransition {
                    task_id,
                    from: current,
                    to: next,
                });
            }
        }

        let mut assignments = vec!["updated_at = ?"];
        let mut values = vec![Value::Text(format_timestamp(now))];
        if let Some(status) = update.status {
            assignments.push("status = ?");
            values.push(Value::Text(status.as_str().to_string()));
        }
        if let Some(error) = &update.error {
            assignments.push("error = ?");
            values.push(Value::Text(error.clone()));
        }
        if let Some(path) = &update.artifact_path {
            assignments.push("artifact_path = ?");
            values.push(Value::Text(path.to_string_lossy().to_string()));
        }
        if let Some(bytes) = &update.artifact {
            assignments.push("artifact = ?");
            values.push(Value::Blob(bytes.clone()));
        }
        values.push(Value::Text(task_id.to_string()));
        let sql = format!(
            "UPDATE tasks SET {} WHERE task_id = ?",
            assignments.join(", ")
        );
        tx.execute(&sql, rusqlite::params_from_iter(values.iter()))?;
        let task = fetch_task(&tx, task_id)?.ok_or(RegistryError::NotFound(task_id))?;
        tx.commit()?;
        debug!(task_id = %task_id, status = %task.status, "task updated");
        Ok(task)
    }

    /// Atomically moves a queued task to running under this handle's owner
    /// tag. Returns `false` when the task was not queued, e.g. because
    /// another worker claimed it.
    pub fn claim(&self, task_id: Uuid, now: DateTime<Utc>) -> RegistryResult<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE tasks SET status = 'running', owner = ?1, heartbeat_at = ?2, updated_at = ?2
             WHERE task_id = ?3 AND status = 'queued'",
            params![&self.owner, format_timestamp(now), task_id.to_string()],
        )?;
        if changed == 0 && fetch_task(&conn, task_id)?.is_none() {
            return Err(RegistryError::NotFound(task_id));
        }
        Ok(changed == 1)
    }

    /// Refreshes the heartbeat of a running task this handle owns. Returns
    /// `false` once the task is no longer running under this owner.
    pub fn heartbeat(&self, task_id: Uuid, now: DateTime<Utc>) -> RegistryResult<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE tasks SET heartbeat_at = ?1
             WHERE task_id = ?2 AND status = 'running' AND owner = ?3",
            params![format_timestamp(now), task_id.to_string(), &self.owner],
        )?;
        Ok(changed == 1)
    }

    pub fn get(&self, task_id: Uuid) -> RegistryResult<Task> {
        let conn = self.lock()?;
        fetch_task(&conn, task_id)?.ok_or(RegistryError::NotFound(task_id))
    }

    pub fn list(&self, status: Option<TaskStatus>) -> RegistryResult<Vec<Task>> {
        let conn = self.lock()?;
        let mut query = format!("SELECT {TASK_COLUMNS} FROM tasks");
        let mut values: Vec<Value> = Vec::new();
        if let Some(status) = status {
            query.push_str(" WHERE status = ?");
            values.push(Value::Text(status.as_str().to_string()));
        }
        query.push_str(" ORDER BY created_at ASC, task_id ASC");
        let mut stmt = conn.prepare(&query)?;
        let mut rows = stmt.query(rusqlite::params_from_iter(values.iter()))?;
        let mut tasks = Vec::new();
        while let Some(row) = rows.next()? {
            tasks.push(task_from_row(row)?);
        }
        Ok(tasks)
    }

    pub fn record_sink_outcome(
        &self,
        task_id: Uuid,
        outcome: &SinkOutcome,
        now: DateTime<Utc>,
    ) -> RegistryResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO task_sinks (
                task_id, sink, status, readings_written, watermark, error, recorded_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(task_id, sink) DO UPDATE SET
                status = excluded.status,
                readings_written = excluded.readings_written,
                watermark = excluded.watermark,
                error = excluded.error,
                recorded_at = excluded.recorded_at",
            params![
                task_id.to_string(),
                &outcome.sink,
                outcome.status.as_str(),
                outcome.readings_written as i64,
                outcome.watermark.map(format_timestamp),
                &outcome.error,
                format_timestamp(now),
            ],
        )?;
        Ok(())
    }

    pub fn sink_outcomes(&self, task_id: Uuid) -> RegistryResult<Vec<SinkOutcome>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT sink, status, readings_written, watermark, error
             FROM task_sinks WHERE task_id = ?1 ORDER BY sink ASC",
        )?;
        let mut rows = stmt.query(params![task_id.to_string()])?;
        let mut outcomes = Vec::new();
        while let Some(row) = rows.next()? {
            let watermark: Option<String> = row.get("watermark")?;
            outcomes.push(SinkOutcome {
                sink: row.get("sink")?,
                status: row.get::<_, String>("status")?.parse()?,
                readings_written: row.get::<_, i64>("readings_written")?.max(0) as usize,
                watermark: watermark.as_deref().map(parse_timestamp).transpose()?,
                error: row.get("error")?,
            });
        }
        Ok(outcomes)
    }

    /// Kept export bytes of a completed task.
    pub fn artifact(&self, task_id: Uuid) -> RegistryResult<Vec<u8>> {
        let conn = self.lock()?;
        let row: Option<(String, Option<Vec<u8>>)> = conn
            .query_row(
                "SELECT status, artifact FROM tasks WHERE task_id = ?1",
                params![task_id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (status, artifact) = row.ok_or(RegistryError::NotFound(task_id))?;
        let status: TaskStatus = status.parse()?;
        if status != TaskStatus::Completed {
            return Err(RegistryError::NotReady { task_id, status });
        }
        artifact.ok_or(RegistryError::NoArtifact(task_id))
    }

    pub fn purge(&self, task_id: Uuid) -> RegistryResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let status = current_status(&tx, task_id)?;
        if !status.is_terminal() {
            return Err(RegistryError::NotTerminal { task_id, status });
        }
        tx.execute(
            "DELETE FROM tasks WHERE task_id = ?1",
            params![task_id.to_string()],
        )?;
        tx.commit()?;
        info!(task_id = %task_id, "task purged");
        Ok(())
    }

    /// Deletes terminal tasks last updated before `cutoff`.
    pub fn purge_finished_before(&self, cutoff: DateTime<Utc>) -> RegistryResult<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let stamp = format_timestamp(cutoff);
        let removed = tx.execute(
            "DELETE FROM tasks WHERE status IN ('completed', 'failed') AND updated_at < ?1",
            params![stamp],
        )?;
        tx.commit()?;
        if removed > 0 {
            info!(removed, cutoff = %stamp, "purged finished tasks");
        }
        Ok(removed)
    }

    /// Fails tasks left `running` by a process that is gone: rows owned by
    /// another handle whose heartbeat is older than `stale_before`. Tasks of
    /// this handle are never touched.
    pub fn fail_interrupted(
        &self,
        message: &str,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> RegistryResult<Vec<Uuid>> {
        const STALE: &str = "status = 'running'
             AND (owner IS NULL OR owner <> ?1)
             AND (heartbeat_at IS NULL OR heartbeat_at < ?2)";
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let cutoff = format_timestamp(stale_before);
        let ids = {
            let mut stmt = tx.prepare(&format!("SELECT task_id FROM tasks WHERE {STALE}"))?;
            let mut rows = stmt.query(params![&self.owner, &cutoff])?;
            let mut ids = Vec::new();
            while let Some(row) = rows.next()? {
                ids.push(parse_uuid(&row.get::<_, String>(0)?)?);
            }
            ids
        };
        tx.execute(
            &format!("UPDATE tasks SET status = 'failed', error = ?3, updated_at = ?4 WHERE {STALE}"),
            params![&self.owner, &cutoff, message, format_timestamp(now)],
        )?;
        tx.commit()?;
        Ok(ids)
    }
}

fn current_status(conn: &Connection, task_id: Uuid) -> RegistryResult<TaskStatus> {
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM tasks WHERE task_id = ?1",
            params![task_id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    status.ok_or(RegistryError::NotFound(task_id))?.parse()
}

fn fetch_task(conn: &Connection, task_id: Uuid) -> RegistryResult<Option<Task>> {
    let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE task_id = ?1");
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params![task_id.to_string()])?;
    match rows.next()? {
        Some(row) => Ok(Some(task_from_row(row)?)),
        None => Ok(None),
    }
}

fn task_from_row(row: &Row<'_>) -> RegistryResult<Task> {
    let sinks: String = row.get("sinks")?;
    let sinks: Vec<String> =
        serde_json::from_str(&sinks).map_err(|err| RegistryError::Corrupt(err.to_string()))?;
    let workflow: WorkflowKind = row.get::<_, String>("workflow")?.parse()?;
    Ok(Task {
        task_id: parse_uuid(&row.get::<_, String>("task_id")?)?,
        request: WorkflowRequest {
            workflow,
            sinks,
            month: row.get("month")?,
            year: row.get("year")?,
            delta: row.get("delta")?,
            keep: row.get("keep")?,
        },
        status: row.get::<_, String>("status")?.parse()?,
        error: row.get("error")?,
        artifact_path: row.get::<_, Option<String>>("artifact_path")?.map(PathBuf::from),
        has_artifact: row.get("has_artifact")?,
        owner: row.get("owner")?,
        heartbeat_at: row
            .get::<_, Option<String>>("heartbeat_at")?
            .as_deref()
            .map(parse_timestamp)
            .transpose()?,
        created_at: parse_timestamp(&row.get::<_, String>("created_at")?)?,
        updated_at: parse_timestamp(&row.get::<_, String>("updated_at")?)?,
    })
}

fn parse_uuid(value: &str) -> RegistryResult<Uuid> {
    Uuid::parse_str(value).map_err(|err| RegistryError::Corrupt(format!("task id {value}: {err}")))
}

/// Fixed-width RFC 3339 so stored timestamps sort lexically.
fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(value: &str) -> RegistryResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| RegistryError::Corrupt(format!("timestamp {value}: {err}")))
}
