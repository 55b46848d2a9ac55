use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::{ArgGroup, Args, CommandFactory, Parser, Subcommand, ValueEnum};
use rusqlite::{Connection, OpenFlags};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use ers_core::browser::BrowserLauncher;
use ers_core::readings::XlsxExportParser;
use ers_core::session::{RecoveryReport, SessionController, TaskDispatcher, TaskReport};
use ers_core::sink::SinkRegistry;
use ers_core::task::{TaskRegistry, TaskStatus, TaskStatusRecord, WorkflowKind, WorkflowRequest};
use ers_core::{load_config, ErsConfig};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] ers_core::ConfigError),
    #[error("registry error: {0}")]
    Registry(#[from] ers_core::RegistryError),
    #[error("{0}")]
    Workflow(#[from] ers_core::WorkflowError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("task {task_id} failed: {message}")]
    TaskFailed { task_id: Uuid, message: String },
    #[error("{0}")]
    CheckFailed(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "E-REDES consumption readings control interface", long_about = None)]
pub struct Cli {
    /// Path to ers.toml
    #[arg(long, default_value = "configs/ers.toml")]
    pub config: PathBuf,
    /// Alternative path for the task registry database
    #[arg(long)]
    pub registry_db: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Runs a workflow and waits for its outcome
    Run(WorkflowArgs),
    /// Queues a workflow and prints its task id
    Enqueue(WorkflowArgs),
    /// Recovers interrupted tasks and executes queued ones
    Worker(WorkerArgs),
    /// Shows the status of a task
    Status(TaskArgs),
    /// Writes the kept export of a completed task
    Fetch(FetchArgs),
    /// Removes finished tasks from the registry
    Purge(PurgeArgs),
    /// Checks configuration, directories and the registry
    Check,
    /// Prints shell completions
    Completions(CompletionsArgs),
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum WorkflowArg {
    Current,
    Previous,
    Select,
}

impl From<WorkflowArg> for WorkflowKind {
    fn from(value: WorkflowArg) -> Self {
        match value {
            WorkflowArg::Current => WorkflowKind::Current,
            WorkflowArg::Previous => WorkflowKind::Previous,
            WorkflowArg::Select => WorkflowKind::Select,
        }
    }
}

#[derive(Args, Debug)]
pub struct WorkflowArgs {
    /// Which period to export
    #[arg(value_enum)]
    pub workflow: WorkflowArg,
    /// Sink to write into (repeatable)
    #[arg(long = "sink")]
    pub sinks: Vec<String>,
    /// Month for `select` (1-12)
    #[arg(long)]
    pub month: Option<u32>,
    /// Year for `select`
    #[arg(long)]
    pub year: Option<i32>,
    /// Only write readings newer than each sink's watermark
    #[arg(long, default_value_t = false)]
    pub delta: bool,
    /// Keep the exported workbook after the run
    #[arg(long, default_value_t = false)]
    pub keep: bool,
}

impl WorkflowArgs {
    fn to_request(&self) -> WorkflowRequest {
        WorkflowRequest {
            workflow: self.workflow.into(),
            sinks: self.sinks.clone(),
            month: self.month,
            year: self.year,
            delta: self.delta,
            keep: self.keep,
        }
    }
}

#[derive(Args, Debug)]
pub struct WorkerArgs {
    /// Drain the queue once and exit
    #[arg(long, default_value_t = false)]
    pub once: bool,
    /// Seconds between queue polls
    #[arg(long, default_value_t = 30)]
    pub interval: u64,
}

#[derive(Args, Debug)]
pub struct TaskArgs {
    pub task_id: Uuid,
}

#[derive(Args, Debug)]
pub struct FetchArgs {
    pub task_id: Uuid,
    /// Destination file
    #[arg(long)]
    pub output: PathBuf,
}

#[derive(Args, Debug)]
#[command(group(ArgGroup::new("target").required(true).args(["task_id", "older_than_days"])))]
pub struct PurgeArgs {
    /// Single finished task to remove
    pub task_id: Option<Uuid>,
    /// Remove every finished task last updated more than N days ago
    #[arg(long)]
    pub older_than_days: Option<i64>,
}

#[derive(Args, Debug)]
pub struct CompletionsArgs {
    #[arg(value_enum)]
    pub shell: clap_complete::Shell,
}

pub async fn run(cli: Cli) -> Result<()> {
    if let Commands::Completions(args) = &cli.command {
        let mut command = Cli::command();
        clap_complete::generate(args.shell, &mut command, "ersctl", &mut io::stdout());
        return Ok(());
    }

    let context = AppContext::new(&cli)?;
    match &cli.command {
        Commands::Run(args) => {
            let controller = context.controller()?;
            let report = controller.run(args.to_request()).await?;
            render(&report, cli.format)?;
            if let Some(message) = report.error.clone().filter(|_| !report.succeeded()) {
                return Err(AppError::TaskFailed {
                    task_id: report.task_id,
                    message,
                });
            }
        }
        Commands::Enqueue(args) => {
            let controller = context.controller()?;
            let task_id = controller.enqueue(args.to_request())?;
            render(&Enqueued { task_id }, cli.format)?;
        }
        Commands::Worker(args) => {
            let summary = context.worker(args).await?;
            render(&summary, cli.format)?;
        }
        Commands::Status(args) => {
            let record = context.registry.get(args.task_id)?.status_record();
            render(&record, cli.format)?;
        }
        Commands::Fetch(args) => {
            let fetched = context.fetch(args)?;
            render(&fetched, cli.format)?;
        }
        Commands::Purge(args) => {
            let purged = context.purge(args)?;
            render(&purged, cli.format)?;
        }
        Commands::Check => {
            let report = context.health_check();
            render(&report, cli.format)?;
            if report
                .iter()
                .any(|entry| matches!(entry.status, CheckStatus::Error))
            {
                return Err(AppError::CheckFailed(
                    "one or more checks failed".to_string(),
                ));
            }
        }
        Commands::Completions(_) => {}
    }

    Ok(())
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
struct AppContext {
    config: ErsConfig,
    config_path: PathBuf,
    registry_path: PathBuf,
    registry: Arc<TaskRegistry>,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let config_path = cli.config.clone();
        let config = load_config(&config_path)?;
        let registry_path = cli
            .registry_db
            .clone()
            .unwrap_or_else(|| config.resolved_paths().registry_db);
        let registry = Arc::new(TaskRegistry::open(&registry_path)?);
        Ok(Self {
            config,
            config_path,
            registry_path,
            registry,
        })
    }

    fn controller(&self) -> Result<Arc<SessionController>> {
        let launcher = BrowserLauncher::new(
            self.config.browser.clone(),
            Duration::from_millis(self.config.portal.poll_interval_ms),
        );
        let controller = SessionController::new(
            &self.config,
            Arc::new(launcher),
            Arc::new(XlsxExportParser::new()),
            SinkRegistry::from_config(&self.config),
            Arc::clone(&self.registry),
        )?;
        Ok(Arc::new(controller))
    }

    async fn worker(&self, args: &WorkerArgs) -> Result<WorkerSummary> {
        let mut dispatcher = TaskDispatcher::new(self.controller()?);
        let recovery = dispatcher.recover()?;
        let mut summary = WorkerSummary::from_recovery(&recovery);
        info!(
            interrupted = recovery.interrupted.len(),
            dispatched = recovery.dispatched.len(),
            "worker started"
        );

        loop {
            for (task_id, result) in dispatcher.drain().await {
                match result {
                    Ok(report) => summary.record(&report),
                    Err(err) => {
                        warn!(%task_id, error = %err, "task could not be executed");
                        summary.errors.push(format!("{task_id}: {err}"));
                    }
                }
            }
            if args.once {
                break;
            }
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("worker stopping");
                    break;
                }
                _ = tokio::time::sleep(Duration::from_secs(args.interval)) => {}
            }
            dispatcher.dispatch_pending()?;
        }
        Ok(summary)
    }

    fn fetch(&self, args: &FetchArgs) -> Result<Fetched> {
        let bytes = self.registry.artifact(args.task_id)?;
        if let Some(parent) = args.output.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(&args.output, &bytes)?;
        Ok(Fetched {
            task_id: args.task_id,
            output: args.output.clone(),
            bytes: bytes.len(),
        })
    }

    fn purge(&self, args: &PurgeArgs) -> Result<Purged> {
        let removed = match (args.task_id, args.older_than_days) {
            (Some(task_id), _) => {
                self.registry.purge(task_id)?;
                1
            }
            (None, Some(days)) => {
                let cutoff = Utc::now() - chrono::Duration::days(days);
                self.registry.purge_finished_before(cutoff)?
            }
            (None, None) => 0,
        };
        Ok(Purged { removed })
    }

    fn health_check(&self) -> Vec<HealthEntry> {
        let paths = self.config.resolved_paths();
        let mut results = vec![
            self.check_path("ers.toml", &self.config_path),
            self.check_database("registry", &self.registry_path),
            self.check_directory("workspace_dir", &paths.workspace_dir),
            self.check_directory("output_dir", &paths.output_dir),
            self.check_directory("diagnostics_dir", &paths.diagnostics_dir),
        ];

        if self.config.portal.password.is_empty() {
            results.push(HealthEntry::warn(
                "portal.password",
                format!("empty; set {}", ers_core::config::PASSWORD_ENV),
            ));
        } else {
            results.push(HealthEntry::ok("portal.password", "set"));
        }

        if let Some(executable) = &self.config.browser.executable_path {
            results.push(self.check_path("chromium", Path::new(executable)));
        }

        let sinks = SinkRegistry::from_config(&self.config).names();
        if sinks.is_empty() {
            results.push(HealthEntry::warn("sinks", "no sink configured"));
        } else {
            results.push(HealthEntry::ok("sinks", sinks.join(", ")));
        }
        results
    }

    fn check_path(&self, name: &str, path: &Path) -> HealthEntry {
        if path.exists() {
            HealthEntry::ok(name, format!("{}", path.display()))
        } else {
            HealthEntry::error(name, format!("{path} missing", path = path.display()))
        }
    }

    fn check_directory(&self, name: &str, path: &Path) -> HealthEntry {
        match fs::metadata(path) {
            Ok(meta) if meta.is_dir() => HealthEntry::ok(name, format!("{}", path.display())),
            Ok(_) => HealthEntry::warn(
                name,
                format!("{path} is not a directory", path = path.display()),
            ),
            Err(_) => HealthEntry::warn(
                name,
                format!("{path} not found; created on first run", path = path.display()),
            ),
        }
    }

    fn check_database(&self, name: &str, path: &Path) -> HealthEntry {
        match Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY) {
            Ok(conn) => {
                let pragma: rusqlite::Result<String> =
                    conn.query_row("PRAGMA integrity_check;", [], |row| row.get(0));
                match pragma {
                    Ok(result) if result.to_lowercase() == "ok" => {
                        HealthEntry::ok(name, "integrity ok".to_string())
                    }
                    Ok(result) => HealthEntry::warn(name, format!("integrity_check: {result}")),
                    Err(err) => HealthEntry::warn(name, format!("error: {err}")),
                }
            }
            Err(err) => HealthEntry::error(name, format!("cannot open: {err}")),
        }
    }
}

impl DisplayFallback for TaskReport {
    fn display(&self) -> String {
        let mut lines = vec![format!("task {} {}", self.task_id, self.status)];
        if let Some(error) = &self.error {
            lines.push(format!("error: {error}"));
        }
        lines.push(format!("readings: {}", self.readings));
        for outcome in &self.sinks {
            let detail = outcome
                .error
                .clone()
                .unwrap_or_else(|| format!("{} written", outcome.readings_written));
            lines.push(format!("sink {}: {}", outcome.sink, detail));
        }
        if let Some(path) = &self.artifact_path {
            lines.push(format!("export: {}", path.display()));
        }
        if let Some(snapshot) = &self.diagnostics {
            for path in snapshot.screenshot.iter().chain(snapshot.page_source.iter()) {
                lines.push(format!("diagnostic: {}", path.display()));
            }
        }
        lines.join("\n")
    }
}

impl DisplayFallback for TaskStatusRecord {
    fn display(&self) -> String {
        format!(
            "{task_id} {status} (result available: {available}, updated {updated})",
            task_id = self.task_id,
            status = self.status,
            available = self.result_available,
            updated = self.updated_at.to_rfc3339(),
        )
    }
}

#[derive(Debug, Serialize)]
pub struct Enqueued {
    pub task_id: Uuid,
}

impl DisplayFallback for Enqueued {
    fn display(&self) -> String {
        self.task_id.to_string()
    }
}

#[derive(Debug, Default, Serialize)]
pub struct WorkerSummary {
    pub interrupted: Vec<Uuid>,
    pub completed: Vec<Uuid>,
    pub failed: Vec<Uuid>,
    pub errors: Vec<String>,
}

impl WorkerSummary {
    fn from_recovery(recovery: &RecoveryReport) -> Self {
        Self {
            interrupted: recovery.interrupted.clone(),
            ..Self::default()
        }
    }

    fn record(&mut self, report: &TaskReport) {
        match report.status {
            TaskStatus::Completed => self.completed.push(report.task_id),
            _ => self.failed.push(report.task_id),
        }
    }
}

impl DisplayFallback for WorkerSummary {
    fn display(&self) -> String {
        let mut lines = vec![format!(
            "completed: {} | failed: {} | interrupted: {}",
            self.completed.len(),
            self.failed.len(),
            self.interrupted.len()
        )];
        lines.extend(self.errors.iter().map(|error| format!("error: {error}")));
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct Fetched {
    pub task_id: Uuid,
    pub output: PathBuf,
    pub bytes: usize,
}

impl DisplayFallback for Fetched {
    fn display(&self) -> String {
        format!("{} bytes written to {}", self.bytes, self.output.display())
    }
}

#[derive(Debug, Serialize)]
pub struct Purged {
    pub removed: usize,
}

impl DisplayFallback for Purged {
    fn display(&self) -> String {
        format!("{} task(s) removed", self.removed)
    }
}

#[derive(Debug, Serialize)]
pub struct HealthEntry {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

#[derive(Debug, Serialize)]
pub enum CheckStatus {
    #[serde(rename = "ok")]
    Ok,
    #[serde(rename = "warn")]
    Warn,
    #[serde(rename = "error")]
    Error,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CheckStatus::Ok => "OK",
            CheckStatus::Warn => "WARN",
            CheckStatus::Error => "ERROR",
        };
        write!(f, "{}", label)
    }
}

impl HealthEntry {
    fn ok(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Ok,
            detail: detail.into(),
        }
    }

    fn warn(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Warn,
            detail: detail.into(),
        }
    }

    fn error(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Error,
            detail: detail.into(),
        }
    }
}

impl DisplayFallback for Vec<HealthEntry> {
    fn display(&self) -> String {
        self.iter()
            .map(|entry| format!("[{}] {}: {}", entry.status, entry.name, entry.detail))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ers_core::task::TaskUpdate;
    use tempfile::TempDir;

    fn prepare_test_context() -> (TempDir, Cli) {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        let config = format!(
            r#"
            [portal]
            username = "123456789"
            password = "secret"
            meter_id = "PT0002000000000000AB"

            [paths]
            base_dir = "{root}"

            [sinks.duckdb]
            path = "readings.duckdb"
            "#,
            root = root.display()
        );
        let config_path = root.join("ers.toml");
        fs::write(&config_path, config).unwrap();
        let cli = Cli {
            config: config_path,
            registry_db: None,
            format: OutputFormat::Json,
            command: Commands::Check,
        };
        (temp, cli)
    }

    #[test]
    fn cli_parses_workflow_arguments() {
        let cli = Cli::try_parse_from([
            "ersctl", "--format", "json", "run", "select", "--month", "3", "--year", "2023",
            "--sink", "influxdb", "--sink", "duckdb", "--delta",
        ])
        .unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run command");
        };
        let request = args.to_request();
        assert_eq!(request.workflow, WorkflowKind::Select);
        assert_eq!(request.month, Some(3));
        assert_eq!(request.year, Some(2023));
        assert_eq!(request.sinks, vec!["influxdb", "duckdb"]);
        assert!(request.delta);
        assert!(!request.keep);
    }

    #[test]
    fn purge_requires_a_target() {
        assert!(Cli::try_parse_from(["ersctl", "purge"]).is_err());
        assert!(Cli::try_parse_from(["ersctl", "purge", "--older-than-days", "30"]).is_ok());
    }

    #[test]
    fn health_check_reports_registry_and_sinks() {
        let (_temp, cli) = prepare_test_context();
        let context = AppContext::new(&cli).unwrap();
        let report = context.health_check();
        let registry = report.iter().find(|entry| entry.name == "registry").unwrap();
        assert!(matches!(registry.status, CheckStatus::Ok));
        let sinks = report.iter().find(|entry| entry.name == "sinks").unwrap();
        assert_eq!(sinks.detail, "duckdb");
    }

    #[test]
    fn fetch_and_purge_completed_task() {
        let (temp, cli) = prepare_test_context();
        let context = AppContext::new(&cli).unwrap();
        let task_id = Uuid::new_v4();
        let now = Utc::now();
        context
            .registry
            .create(
                task_id,
                &WorkflowRequest::new(WorkflowKind::Current),
                TaskStatus::Running,
                now,
            )
            .unwrap();
        context
            .registry
            .update(
                task_id,
                &TaskUpdate {
                    status: Some(TaskStatus::Completed),
                    artifact: Some(b"xlsx".to_vec()),
                    ..TaskUpdate::default()
                },
                now,
            )
            .unwrap();

        let output = temp.path().join("exports/readings.xlsx");
        let fetched = context
            .fetch(&FetchArgs {
                task_id,
                output: output.clone(),
            })
            .unwrap();
        assert_eq!(fetched.bytes, 4);
        assert_eq!(fs::read(&output).unwrap(), b"xlsx");

        let purged = context
            .purge(&PurgeArgs {
                task_id: Some(task_id),
                older_than_days: None,
            })
            .unwrap();
        assert_eq!(purged.removed, 1);
        assert!(context.registry.get(task_id).is_err());
    }
}
