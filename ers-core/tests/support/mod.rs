#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;

use ers_core::browser::{BrowserResult, Locator, PortalSession, PortalSessionFactory};
use ers_core::readings::{sentinel_epoch, ExportParser, ParseResult, Reading};
use ers_core::sink::{Sink, SinkError, SinkRegistry, SinkResult};
use ers_core::{parse_config, ErsConfig, SessionController, TaskRegistry};

pub const METER: &str = "PT0002000000000000AB";

pub fn utc(year: i32, month: u32, day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, hour, minute, 0).unwrap()
}

/// Fixed "now" used by every controller in the tests.
pub fn today() -> DateTime<Utc> {
    utc(2024, 5, 10, 12, 0)
}

pub fn test_config(base: &Path) -> ErsConfig {
    parse_config(&format!(
        r#"
        [portal]
        username = "123456789"
        password = "secret"
        meter_id = "{METER}"
        step_timeout_seconds = 1
        download_timeout_seconds = 1
        poll_interval_ms = 1
        month_locale = "pt_PT"

        [paths]
        base_dir = "{base}"
        workspace_dir = "tmp"
        output_dir = "output"
        diagnostics_dir = "diagnostics"
        registry_db = "ers.db"
        "#,
        base = base.display()
    ))
    .unwrap()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginOutcome {
    Succeed,
    InvalidCredentials,
    Challenge,
}

/// How the fake portal behaves.
#[derive(Debug, Clone)]
pub struct PortalScript {
    pub login: LoginOutcome,
    pub target_year: i32,
    /// Back clicks after which the target year shows up; `None` never.
    pub year_visible_after: Option<u32>,
    pub previous_year_enabled: bool,
    pub month_enabled: bool,
    pub download: bool,
    /// Extra file the browser leaves next to the export.
    pub stray_file: Option<&'static str>,
}

impl Default for PortalScript {
    fn default() -> Self {
        Self {
            login: LoginOutcome::Succeed,
            target_year: 2024,
            year_visible_after: Some(0),
            previous_year_enabled: true,
            month_enabled: true,
            download: true,
            stray_file: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct SessionLog {
    pub opened: usize,
    pub closed: usize,
    pub visited: Vec<String>,
    pub clicks: Vec<String>,
    pub fills: Vec<(String, String)>,
}

impl SessionLog {
    pub fn clicks_on(&self, locator: &str) -> usize {
        self.clicks.iter().filter(|click| click.as_str() == locator).count()
    }
}

pub const PREVIOUS_YEAR: &str = "button[title*='Ano anterior']";
pub const PERIOD_PICKER: &str = "nz-range-picker";
const AUTH_MARKER: &str = ".card__myplaces .card-text";
const LOGIN_ERROR: &str = "app-sign-in nz-alert span";
const SUBMIT: &str = "button >> text*=Entrar";
const EXPORT: &str = "strong >> text*=Exportar excel";
const CHALLENGE: &str = "iframe[src*='captcha'], .g-recaptcha, #challenge-form, #px-captcha";

pub struct FakePortal {
    script: PortalScript,
    log: Arc<Mutex<SessionLog>>,
    download_dir: PathBuf,
    submitted: bool,
    back_clicks: u32,
    exported: Option<PathBuf>,
}

impl FakePortal {
    fn year_visible(&self) -> bool {
        self.script
            .year_visible_after
            .map(|after| self.back_clicks >= after)
            .unwrap_or(false)
    }

    fn is_month(locator: &Locator) -> bool {
        matches!(locator, Locator::Text { scope: None, text, exact: true } if text.chars().all(|ch| ch.is_alphabetic()))
    }
}

#[async_trait]
impl PortalSession for FakePortal {
    async fn goto(&mut self, url: &str) -> BrowserResult<()> {
        self.log.lock().unwrap().visited.push(url.to_string());
        Ok(())
    }

    async fn is_visible(&mut self, locator: &Locator) -> BrowserResult<bool> {
        let key = locator.to_string();
        Ok(match key.as_str() {
            AUTH_MARKER => self.submitted && self.script.login == LoginOutcome::Succeed,
            CHALLENGE => self.submitted && self.script.login == LoginOutcome::Challenge,
            LOGIN_ERROR => self.submitted && self.script.login == LoginOutcome::InvalidCredentials,
            _ if *locator == Locator::text(self.script.target_year.to_string(), true) => {
                self.year_visible()
            }
            _ => true,
        })
    }

    async fn is_enabled(&mut self, locator: &Locator) -> BrowserResult<bool> {
        let key = locator.to_string();
        Ok(if key == PREVIOUS_YEAR {
            self.script.previous_year_enabled
        } else if Self::is_month(locator) {
            self.script.month_enabled
        } else {
            true
        })
    }

    async fn text_of(&mut self, locator: &Locator) -> BrowserResult<Option<String>> {
        if locator.to_string() == LOGIN_ERROR
            && self.submitted
            && self.script.login == LoginOutcome::InvalidCredentials
        {
            return Ok(Some("Dados inválidos".to_string()));
        }
        Ok(None)
    }

    async fn click(&mut self, locator: &Locator) -> BrowserResult<()> {
        let key = locator.to_string();
        self.log.lock().unwrap().clicks.push(key.clone());
        match key.as_str() {
            SUBMIT => self.submitted = true,
            PREVIOUS_YEAR => self.back_clicks += 1,
            EXPORT if self.script.download => {
                let path = self.download_dir.join("Consumos.xlsx");
                std::fs::write(&path, b"exported workbook")?;
                if let Some(name) = self.script.stray_file {
                    std::fs::write(self.download_dir.join(name), b"")?;
                }
                self.exported = Some(path);
            }
            _ => {}
        }
        Ok(())
    }

    async fn fill(&mut self, locator: &Locator, value: &str) -> BrowserResult<()> {
        self.log
            .lock()
            .unwrap()
            .fills
            .push((locator.to_string(), value.to_string()));
        Ok(())
    }

    async fn screenshot(&mut self) -> BrowserResult<Vec<u8>> {
        Ok(b"\x89PNG".to_vec())
    }

    async fn page_source(&mut self) -> BrowserResult<String> {
        Ok("<html><body>portal</body></html>".to_string())
    }

    async fn wait_for_download(&mut self, _timeout: Duration) -> BrowserResult<Option<PathBuf>> {
        Ok(self.exported.clone())
    }

    async fn close(&mut self) -> BrowserResult<()> {
        self.log.lock().unwrap().closed += 1;
        Ok(())
    }
}

#[derive(Clone)]
pub struct FakePortalFactory {
    pub script: PortalScript,
    pub log: Arc<Mutex<SessionLog>>,
}

impl FakePortalFactory {
    pub fn new(script: PortalScript) -> Self {
        Self {
            script,
            log: Arc::new(Mutex::new(SessionLog::default())),
        }
    }
}

#[async_trait]
impl PortalSessionFactory for FakePortalFactory {
    async fn open(&self, download_dir: &Path) -> BrowserResult<Box<dyn PortalSession>> {
        self.log.lock().unwrap().opened += 1;
        Ok(Box::new(FakePortal {
            script: self.script.clone(),
            log: Arc::clone(&self.log),
            download_dir: download_dir.to_path_buf(),
            submitted: false,
            back_clicks: 0,
            exported: None,
        }))
    }
}

/// Returns the same readings for every export.
pub struct StaticParser {
    readings: Vec<Reading>,
}

impl StaticParser {
    pub fn new(readings: Vec<Reading>) -> Self {
        Self { readings }
    }
}

impl ExportParser for StaticParser {
    fn parse(&self, path: &Path, _meter_id: &str) -> ParseResult<Vec<Reading>> {
        assert!(path.is_file(), "export should exist when parsed");
        Ok(self.readings.clone())
    }
}

/// In-memory sink. `last_written` reports the newest stored timestamp, or
/// `watermark` when set.
#[derive(Clone, Default)]
pub struct MemorySink {
    pub stored: Arc<Mutex<Vec<Reading>>>,
    pub batches: Arc<Mutex<Vec<Vec<Reading>>>>,
    pub watermark: Option<DateTime<Utc>>,
    pub fail_connect: bool,
    pub fail_write: bool,
}

#[async_trait]
impl Sink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn connect(&mut self) -> SinkResult<()> {
        if self.fail_connect {
            return Err(SinkError::connection("memory", "connection refused"));
        }
        Ok(())
    }

    async fn write(&mut self, readings: &[Reading], _meter_id: &str) -> SinkResult<usize> {
        if self.fail_write {
            return Err(SinkError::write("memory", "rejected"));
        }
        self.batches.lock().unwrap().push(readings.to_vec());
        self.stored.lock().unwrap().extend_from_slice(readings);
        Ok(readings.len())
    }

    async fn last_written(&mut self, meter_id: &str) -> SinkResult<DateTime<Utc>> {
        if let Some(watermark) = self.watermark {
            return Ok(watermark);
        }
        Ok(self
            .stored
            .lock()
            .unwrap()
            .iter()
            .filter(|reading| reading.meter_id == meter_id)
            .map(|reading| reading.timestamp)
            .max()
            .unwrap_or_else(sentinel_epoch))
    }

    async fn close(&mut self) -> SinkResult<()> {
        Ok(())
    }
}

pub fn register_memory(registry: &mut SinkRegistry, name: &str, sink: &MemorySink) {
    let sink = sink.clone();
    registry.register(name, move || -> Box<dyn Sink> { Box::new(sink.clone()) });
}

pub fn half_hourly(start: DateTime<Utc>, count: usize) -> Vec<Reading> {
    (0..count)
        .map(|index| {
            Reading::new(
                start + chrono::Duration::minutes(30 * index as i64),
                0.25 + index as f64 * 0.01,
                METER,
            )
        })
        .collect()
}

pub struct Harness {
    pub dir: TempDir,
    pub config: ErsConfig,
    pub factory: FakePortalFactory,
    pub registry: Arc<TaskRegistry>,
    pub controller: Arc<SessionController>,
}

impl Harness {
    pub fn new(script: PortalScript, readings: Vec<Reading>, sinks: SinkRegistry) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let factory = FakePortalFactory::new(script);
        let registry =
            Arc::new(TaskRegistry::open(config.resolved_paths().registry_db).unwrap());
        let controller = SessionController::new(
            &config,
            Arc::new(factory.clone()),
            Arc::new(StaticParser::new(readings)),
            sinks,
            Arc::clone(&registry),
        )
        .unwrap()
        .with_clock(today);
        Self {
            dir,
            config,
            factory,
            registry,
            controller: Arc::new(controller),
        }
    }

    pub fn log(&self) -> std::sync::MutexGuard<'_, SessionLog> {
        self.factory.log.lock().unwrap()
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.dir.path().join(relative)
    }
}
