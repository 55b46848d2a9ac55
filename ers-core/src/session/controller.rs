use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::browser::PortalSessionFactory;
use crate::config::{ErsConfig, ResolvedPaths};
use crate::navigation::{DiagnosticSnapshot, NavState, NavigationPlan, Navigator, NavigatorSettings};
use crate::readings::{reconcile, ExportParser, ParseError, Reading};
use crate::sink::{Sink, SinkError, SinkRegistry, SinkResult};
use crate::task::{
    SinkOutcome, TaskRegistry, TaskStatus, TaskStatusRecord, TaskUpdate, WorkflowRequest,
};

use super::error::{SinkFailures, WorkflowError};
use super::request::{validate_request, ValidatedRequest, ValidationError};
use super::workspace::Workspace;

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// How often a running task refreshes its registry heartbeat.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// What one task run produced.
#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub task_id: Uuid,
    pub status: TaskStatus,
    pub error: Option<String>,
    pub artifact_path: Option<PathBuf>,
    pub readings: usize,
    pub sinks: Vec<SinkOutcome>,
    pub transitions: Vec<NavState>,
    pub diagnostics: Option<DiagnosticSnapshot>,
}

impl TaskReport {
    fn new(task_id: Uuid) -> Self {
        Self {
            task_id,
            status: TaskStatus::Running,
            error: None,
            artifact_path: None,
            readings: 0,
            sinks: Vec::new(),
            transitions: Vec::new(),
            diagnostics: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == TaskStatus::Completed
    }
}

/// Runs workflow requests end to end: browser session, navigation,
/// parsing, sink writes, retention and registry bookkeeping.
pub struct SessionController {
    navigator: Navigator,
    meter_id: String,
    paths: ResolvedPaths,
    sessions: Arc<dyn PortalSessionFactory>,
    parser: Arc<dyn ExportParser>,
    sinks: SinkRegistry,
    registry: Arc<TaskRegistry>,
    clock: Clock,
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("meter_id", &self.meter_id)
            .field("paths", &self.paths)
            .field("sinks", &self.sinks)
            .field("registry", &self.registry.path())
            .finish()
    }
}

impl SessionController {
    pub fn new(
        config: &ErsConfig,
        sessions: Arc<dyn PortalSessionFactory>,
        parser: Arc<dyn ExportParser>,
        sinks: SinkRegistry,
        registry: Arc<TaskRegistry>,
    ) -> Result<Self, WorkflowError> {
        let settings = NavigatorSettings::from_config(config)?;
        Ok(Self {
            navigator: Navigator::new(settings),
            meter_id: config.portal.meter_id.clone(),
            paths: config.resolved_paths(),
            sessions,
            parser,
            sinks,
            registry,
            clock: Arc::new(Utc::now),
        })
    }

    pub fn with_clock<F>(mut self, clock: F) -> Self
    where
        F: Fn() -> DateTime<Utc> + Send + Sync + 'static,
    {
        self.clock = Arc::new(clock);
        self
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn sinks(&self) -> &SinkRegistry {
        &self.sinks
    }

    /// Current time as seen by this controller's clock.
    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    pub fn validate(&self, request: &WorkflowRequest) -> Result<ValidatedRequest, ValidationError> {
        validate_request(request, &self.sinks, self.now())
    }

    /// Synchronous invocation: the task is recorded as `running` and driven
    /// to a terminal state before returning.
    pub async fn run(&self, request: WorkflowRequest) -> Result<TaskReport, WorkflowError> {
        let validated = self.validate(&request)?;
        let task_id = Uuid::new_v4();
        self.registry
            .create(task_id, &request, TaskStatus::Running, self.now())?;
        info!(%task_id, workflow = %request.workflow, period = %validated.target, "task started");
        self.drive(task_id, &validated).await
    }

    /// Asynchronous invocation: records a `queued` task for a worker to
    /// pick up and returns its id immediately.
    pub fn enqueue(&self, request: WorkflowRequest) -> Result<Uuid, WorkflowError> {
        self.validate(&request)?;
        let task_id = Uuid::new_v4();
        self.registry
            .create(task_id, &request, TaskStatus::Queued, self.now())?;
        info!(%task_id, workflow = %request.workflow, "task queued");
        Ok(task_id)
    }

    /// Claims a queued task and drives it. The request is re-validated
    /// against the clock at execution time.
    pub async fn execute(&self, task_id: Uuid) -> Result<TaskReport, WorkflowError> {
        if !self.registry.claim(task_id, self.now())? {
            let task = self.registry.get(task_id)?;
            return Err(crate::task::RegistryError::InvalidTransition {
                task_id,
                from: task.status,
                to: TaskStatus::Running,
            }
            .into());
        }
        let task = self.registry.get(task_id)?;
        match self.validate(&task.request) {
            Ok(validated) => {
                info!(%task_id, workflow = %task.request.workflow, period = %validated.target, "task claimed");
                self.drive(task_id, &validated).await
            }
            Err(err) => {
                let report = TaskReport::new(task_id);
                self.finish(report, Err(err.into()), None)
            }
        }
    }

    pub fn status(&self, task_id: Uuid) -> Result<TaskStatusRecord, WorkflowError> {
        Ok(self.registry.get(task_id)?.status_record())
    }

    /// Kept export bytes; only available once the task completed.
    pub fn artifact(&self, task_id: Uuid) -> Result<Vec<u8>, WorkflowError> {
        Ok(self.registry.artifact(task_id)?)
    }

    async fn drive(
        &self,
        task_id: Uuid,
        request: &ValidatedRequest,
    ) -> Result<TaskReport, WorkflowError> {
        let _heartbeat = Heartbeat::start(
            Arc::clone(&self.registry),
            Arc::clone(&self.clock),
            task_id,
        );
        let mut report = TaskReport::new(task_id);
        let workspace = match Workspace::create(&self.paths.workspace_dir, task_id).await {
            Ok(workspace) => workspace,
            Err(err) => return self.finish(report, Err(err.into()), None),
        };

        let result = self.process(&workspace, request, &mut report).await;
        let (result, artifact) = match report.artifact_path.take() {
            None => {
                workspace.abandon().await;
                (result, None)
            }
            Some(export) if !request.keep => {
                workspace.discard(&export).await;
                (result, None)
            }
            Some(export) => match self.retain(workspace, &export).await {
                Ok(kept) => (result, Some(kept)),
                Err(err) => (result.and(Err(err)), None),
            },
        };
        self.finish(report, result, artifact)
    }

    async fn retain(
        &self,
        workspace: Workspace,
        export: &Path,
    ) -> Result<(PathBuf, Vec<u8>), WorkflowError> {
        let kept = workspace.retain(export, &self.paths.output_dir).await?;
        let bytes = tokio::fs::read(&kept).await?;
        Ok((kept, bytes))
    }

    fn finish(
        &self,
        mut report: TaskReport,
        result: Result<(), WorkflowError>,
        artifact: Option<(PathBuf, Vec<u8>)>,
    ) -> Result<TaskReport, WorkflowError> {
        let task_id = report.task_id;
        let mut update = match &result {
            Ok(()) => TaskUpdate::status(TaskStatus::Completed),
            Err(err) => TaskUpdate::failed(err.task_message()),
        };
        if let Some((path, bytes)) = artifact {
            report.artifact_path = Some(path.clone());
            update.artifact_path = Some(path);
            update.artifact = Some(bytes);
        }
        self.registry.update(task_id, &update, self.now())?;

        match result {
            Ok(()) => {
                report.status = TaskStatus::Completed;
                info!(%task_id, readings = report.readings, "task completed");
            }
            Err(err) => {
                let message = err.task_message();
                warn!(%task_id, kind = %err.kind(), error = %err, "task failed");
                report.status = TaskStatus::Failed;
                report.error = Some(message);
            }
        }
        Ok(report)
    }

    /// Navigation, parsing and sink writes. Sets `report.artifact_path` to
    /// the downloaded export as soon as one exists.
    async fn process(
        &self,
        workspace: &Workspace,
        request: &ValidatedRequest,
        report: &mut TaskReport,
    ) -> Result<(), WorkflowError> {
        let task_id = report.task_id;
        let mut session = self.sessions.open(workspace.dir()).await?;
        let plan = NavigationPlan {
            task_id,
            target: request.target,
            current: request.current,
            download_dir: workspace.dir().to_path_buf(),
        };
        let navigation = self.navigator.run(session.as_mut(), &plan).await;
        if let Err(err) = session.close().await {
            warn!(%task_id, error = %err, "failed to close browser session");
        }

        let outcome = match navigation {
            Ok(outcome) => outcome,
            Err(failure) => {
                report.transitions = failure.transitions;
                report.diagnostics = Some(failure.diagnostics);
                return Err(failure.error.into());
            }
        };
        report.transitions = outcome.transitions;
        report.artifact_path = Some(outcome.export_path.clone());

        let readings = self.parse_export(&outcome.export_path).await?;
        report.readings = readings.len();
        info!(%task_id, readings = readings.len(), meter = %self.meter_id, "export parsed");

        self.write_sinks(task_id, request, &readings, report).await
    }

    async fn parse_export(&self, path: &Path) -> Result<Vec<Reading>, WorkflowError> {
        let parser = Arc::clone(&self.parser);
        let path = path.to_path_buf();
        let meter_id = self.meter_id.clone();
        tokio::task::spawn_blocking(move || parser.parse(&path, &meter_id))
            .await
            .map_err(|err| ParseError::Join(err.to_string()))?
            .map_err(WorkflowError::from)
    }

    /// Attempts every requested sink and records each outcome; fails with
    /// all sink errors once the loop is done.
    async fn write_sinks(
        &self,
        task_id: Uuid,
        request: &ValidatedRequest,
        readings: &[Reading],
        report: &mut TaskReport,
    ) -> Result<(), WorkflowError> {
        let mut failures = Vec::new();
        for name in &request.sinks {
            let (outcome, failure) = match self.sinks.create(name) {
                Some(sink) => self.sync_sink(name, sink, readings, request.delta).await,
                None => {
                    let err = SinkError::connection(name, "sink is not registered");
                    (SinkOutcome::failed(name, None, err.to_string()), Some(err))
                }
            };
            self.registry
                .record_sink_outcome(task_id, &outcome, self.now())?;
            match failure {
                Some(err) => {
                    warn!(%task_id, sink = %name, error = %err, "sink failed");
                    failures.push(err);
                }
                None => {
                    info!(%task_id, sink = %name, written = outcome.readings_written, "sink updated");
                }
            }
            report.sinks.push(outcome);
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(WorkflowError::Sinks(SinkFailures(failures)))
        }
    }

    async fn sync_sink(
        &self,
        name: &str,
        mut sink: Box<dyn Sink>,
        readings: &[Reading],
        delta: bool,
    ) -> (SinkOutcome, Option<SinkError>) {
        if let Err(err) = sink.connect().await {
            return (SinkOutcome::failed(name, None, err.to_string()), Some(err));
        }
        let mut watermark = None;
        let result = write_readings(sink.as_mut(), readings, &self.meter_id, delta, &mut watermark).await;
        if let Err(err) = sink.close().await {
            warn!(sink = %name, error = %err, "failed to close sink");
        }
        match result {
            Ok(written) => (SinkOutcome::written(name, written, watermark), None),
            Err(err) => (SinkOutcome::failed(name, watermark, err.to_string()), Some(err)),
        }
    }
}

/// Keeps the task's heartbeat fresh until dropped.
struct Heartbeat(tokio::task::JoinHandle<()>);

impl Heartbeat {
    fn start(registry: Arc<TaskRegistry>, clock: Clock, task_id: Uuid) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match registry.heartbeat(task_id, clock()) {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(err) => warn!(%task_id, error = %err, "failed to refresh task heartbeat"),
                }
            }
        });
        Self(handle)
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn write_readings(
    sink: &mut dyn Sink,
    readings: &[Reading],
    meter_id: &str,
    delta: bool,
    watermark: &mut Option<DateTime<Utc>>,
) -> SinkResult<usize> {
    if !delta {
        return sink.write(readings, meter_id).await;
    }
    let last = sink.last_written(meter_id).await?;
    *watermark = Some(last);
    let fresh = reconcile(readings, &last);
    if fresh.is_empty() {
        return Ok(0);
    }
    sink.write(&fresh, meter_id).await
}
