use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use tokio::fs;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::browser::{wait_until_visible, Locator, PortalSession};
use crate::config::{ErsConfig, SelectorSection};
use crate::error::{ConfigError, Result as ConfigResult};

use super::diagnostics::{capture, DiagnosticSnapshot};
use super::error::PortalError;
use super::period::{year_steps, MonthLabels, Period};
use super::state::NavState;

const METER_PLACEHOLDER: &str = "{meter}";
const YEAR_PLACEHOLDER: &str = "{year}";
const MONTH_PLACEHOLDER: &str = "{month}";

/// Parsed portal locators. Templated entries are rendered per run.
#[derive(Debug, Clone)]
pub struct PortalLocators {
    pub login_entry: Locator,
    pub username_input: Locator,
    pub password_input: Locator,
    pub submit_button: Locator,
    pub login_error: Locator,
    pub security_challenge: Locator,
    pub authenticated_marker: Locator,
    pub consumption_card: Locator,
    pub meter_list: Locator,
    pub period_picker: Locator,
    pub previous_year_button: Locator,
    pub export_button: Locator,
    meter_item: String,
    year_label: String,
    month_cell: String,
}

impl PortalLocators {
    pub fn from_section(section: &SelectorSection) -> ConfigResult<Self> {
        let locators = Self {
            login_entry: parse_locator("login_entry", &section.login_entry)?,
            username_input: parse_locator("username_input", &section.username_input)?,
            password_input: parse_locator("password_input", &section.password_input)?,
            submit_button: parse_locator("submit_button", &section.submit_button)?,
            login_error: parse_locator("login_error", &section.login_error)?,
            security_challenge: parse_locator("security_challenge", &section.security_challenge)?,
            authenticated_marker: parse_locator(
                "authenticated_marker",
                &section.authenticated_marker,
            )?,
            consumption_card: parse_locator("consumption_card", &section.consumption_card)?,
            meter_list: parse_locator("meter_list", &section.meter_list)?,
            period_picker: parse_locator("period_picker", &section.period_picker)?,
            previous_year_button: parse_locator(
                "previous_year_button",
                &section.previous_year_button,
            )?,
            export_button: parse_locator("export_button", &section.export_button)?,
            meter_item: section.meter_item.clone(),
            year_label: section.year_label.clone(),
            month_cell: section.month_cell.clone(),
        };
        parse_locator("meter_item", &locators.meter_item.replace(METER_PLACEHOLDER, "x"))?;
        parse_locator("year_label", &locators.year_label.replace(YEAR_PLACEHOLDER, "2000"))?;
        parse_locator("month_cell", &locators.month_cell.replace(MONTH_PLACEHOLDER, "jan"))?;
        Ok(locators)
    }

    pub fn meter_item(&self, meter_id: &str) -> Result<Locator, PortalError> {
        render(&self.meter_item, METER_PLACEHOLDER, meter_id, NavState::LocatingMeter)
    }

    pub fn year_label(&self, year: i32) -> Result<Locator, PortalError> {
        render(
            &self.year_label,
            YEAR_PLACEHOLDER,
            &year.to_string(),
            NavState::SelectingPeriod,
        )
    }

    pub fn month_cell(&self, label: &str) -> Result<Locator, PortalError> {
        render(&self.month_cell, MONTH_PLACEHOLDER, label, NavState::SelectingPeriod)
    }
}

fn parse_locator(key: &str, raw: &str) -> ConfigResult<Locator> {
    Locator::parse(raw).map_err(|err| ConfigError::Invalid {
        key: format!("portal.selectors.{key}"),
        reason: err.to_string(),
    })
}

fn render(template: &str, placeholder: &str, value: &str, step: NavState) -> Result<Locator, PortalError> {
    Locator::parse(&template.replace(placeholder, value))
        .map_err(|err| PortalError::navigation(step, err.to_string()))
}

#[derive(Debug, Clone)]
pub struct NavigatorSettings {
    pub login_url: String,
    pub username: String,
    pub password: String,
    pub meter_id: String,
    pub locators: PortalLocators,
    pub login_error_pattern: Regex,
    pub month_labels: MonthLabels,
    pub step_timeout: Duration,
    pub download_timeout: Duration,
    pub poll_interval: Duration,
    pub diagnostics_dir: PathBuf,
}

impl NavigatorSettings {
    pub fn from_config(config: &ErsConfig) -> ConfigResult<Self> {
        let portal = &config.portal;
        let login_error_pattern =
            Regex::new(&portal.selectors.login_error_pattern).map_err(|err| {
                ConfigError::Invalid {
                    key: "portal.selectors.login_error_pattern".into(),
                    reason: err.to_string(),
                }
            })?;
        Ok(Self {
            login_url: portal.login_url.clone(),
            username: portal.username.clone(),
            password: portal.password.clone(),
            meter_id: portal.meter_id.clone(),
            locators: PortalLocators::from_section(&portal.selectors)?,
            login_error_pattern,
            month_labels: MonthLabels::resolve(portal.month_locale.as_deref()),
            step_timeout: Duration::from_secs(portal.step_timeout_seconds),
            download_timeout: Duration::from_secs(portal.download_timeout_seconds),
            poll_interval: Duration::from_millis(portal.poll_interval_ms),
            diagnostics_dir: config.resolved_paths().diagnostics_dir,
        })
    }
}

/// Inputs of one navigation run.
#[derive(Debug, Clone)]
pub struct NavigationPlan {
    pub task_id: Uuid,
    pub target: Period,
    /// Month the portal treats as current; selection is skipped when it
    /// equals `target`.
    pub current: Period,
    pub download_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct NavigationOutcome {
    pub export_path: PathBuf,
    pub transitions: Vec<NavState>,
}

#[derive(Debug)]
pub struct NavigationFailure {
    pub error: PortalError,
    pub state: NavState,
    pub diagnostics: DiagnosticSnapshot,
    pub transitions: Vec<NavState>,
}

/// Drives one portal session from login to a completed export.
#[derive(Debug, Clone)]
pub struct Navigator {
    settings: NavigatorSettings,
}

impl Navigator {
    pub fn new(settings: NavigatorSettings) -> Self {
        Self { settings }
    }

    pub async fn run(
        &self,
        session: &mut dyn PortalSession,
        plan: &NavigationPlan,
    ) -> Result<NavigationOutcome, NavigationFailure> {
        let mut state = NavState::Start;
        let mut transitions = vec![state];
        let mut downloaded: Option<PathBuf> = None;

        while !state.is_terminal() {
            match self.step(session, plan, state, &mut downloaded).await {
                Ok(next) => {
                    debug_assert!(state.can_advance_to(next), "{state} -> {next}");
                    info!(task_id = %plan.task_id, from = %state, to = %next, "navigation advanced");
                    transitions.push(next);
                    state = next;
                }
                Err(error) => {
                    warn!(task_id = %plan.task_id, step = %state, error = %error, "navigation failed");
                    let diagnostics =
                        capture(session, &self.settings.diagnostics_dir, &plan.task_id, state)
                            .await;
                    transitions.push(NavState::Failed);
                    return Err(NavigationFailure {
                        error,
                        state,
                        diagnostics,
                        transitions,
                    });
                }
            }
        }

        match downloaded {
            Some(export_path) => Ok(NavigationOutcome {
                export_path,
                transitions,
            }),
            None => Err(NavigationFailure {
                error: PortalError::Download("navigation finished without an export".into()),
                state,
                diagnostics: DiagnosticSnapshot {
                    step: state,
                    screenshot: None,
                    page_source: None,
                },
                transitions,
            }),
        }
    }

    async fn step(
        &self,
        session: &mut dyn PortalSession,
        plan: &NavigationPlan,
        state: NavState,
        downloaded: &mut Option<PathBuf>,
    ) -> Result<NavState, PortalError> {
        let locators = &self.settings.locators;
        match state {
            NavState::Start => {
                session
                    .goto(&self.settings.login_url)
                    .await
                    .map_err(PortalError::browser(state))?;
                Ok(NavState::Authenticating)
            }
            NavState::Authenticating => {
                self.authenticate(session).await?;
                Ok(NavState::Authenticated)
            }
            NavState::Authenticated => {
                if session
                    .is_visible(&locators.security_challenge)
                    .await
                    .map_err(PortalError::browser(state))?
                {
                    return Err(PortalError::SecurityChallenge { step: state });
                }
                self.click_when_visible(session, state, &locators.authenticated_marker)
                    .await?;
                Ok(NavState::LocatingMeter)
            }
            NavState::LocatingMeter => {
                self.click_when_visible(session, state, &locators.consumption_card)
                    .await?;
                self.click_when_visible(session, state, &locators.meter_list)
                    .await?;
                let meter = locators.meter_item(&self.settings.meter_id)?;
                self.click_when_visible(session, state, &meter).await?;
                Ok(NavState::MeterLocated)
            }
            NavState::MeterLocated => {
                if plan.target == plan.current {
                    debug!(task_id = %plan.task_id, period = %plan.target, "target is the current period");
                    Ok(NavState::ExportTriggered)
                } else {
                    Ok(NavState::SelectingPeriod)
                }
            }
            NavState::SelectingPeriod => {
                self.select_period(session, plan).await?;
                Ok(NavState::ExportTriggered)
            }
            NavState::ExportTriggered => {
                self.click_when_visible(session, state, &locators.export_button)
                    .await?;
                let file = session
                    .wait_for_download(self.settings.download_timeout)
                    .await
                    .map_err(PortalError::browser(state))?
                    .ok_or_else(|| {
                        PortalError::Download(format!(
                            "no completed download within {}s",
                            self.settings.download_timeout.as_secs()
                        ))
                    })?;
                *downloaded = Some(file);
                Ok(NavState::DownloadComplete)
            }
            NavState::DownloadComplete => {
                let source = downloaded
                    .take()
                    .ok_or_else(|| PortalError::Download("download path was lost".into()))?;
                let target = plan.download_dir.join(plan.target.export_file_name(&plan.task_id));
                finalize_download(&source, &target).await?;
                *downloaded = Some(target);
                Ok(NavState::Done)
            }
            NavState::Done | NavState::Failed => Ok(state),
        }
    }

    async fn authenticate(&self, session: &mut dyn PortalSession) -> Result<(), PortalError> {
        let state = NavState::Authenticating;
        let locators = &self.settings.locators;
        self.click_when_visible(session, state, &locators.login_entry)
            .await?;
        self.require_visible(session, state, &locators.username_input)
            .await?;
        session
            .fill(&locators.username_input, &self.settings.username)
            .await
            .map_err(PortalError::browser(state))?;
        session
            .fill(&locators.password_input, &self.settings.password)
            .await
            .map_err(PortalError::browser(state))?;
        session
            .click(&locators.submit_button)
            .await
            .map_err(PortalError::browser(state))?;

        let deadline = Instant::now() + self.settings.step_timeout;
        loop {
            if session
                .is_visible(&locators.authenticated_marker)
                .await
                .map_err(PortalError::browser(state))?
            {
                return Ok(());
            }
            if let Some(message) = session
                .text_of(&locators.login_error)
                .await
                .map_err(PortalError::browser(state))?
            {
                if self.settings.login_error_pattern.is_match(&message) {
                    return Err(PortalError::Authentication(message.trim().to_string()));
                }
            }
            if session
                .is_visible(&locators.security_challenge)
                .await
                .map_err(PortalError::browser(state))?
            {
                return Err(PortalError::SecurityChallenge { step: state });
            }
            if Instant::now() >= deadline {
                return Err(PortalError::navigation(
                    state,
                    format!(
                        "no response to login within {}s",
                        self.settings.step_timeout.as_secs()
                    ),
                ));
            }
            sleep(self.settings.poll_interval).await;
        }
    }

    async fn select_period(
        &self,
        session: &mut dyn PortalSession,
        plan: &NavigationPlan,
    ) -> Result<(), PortalError> {
        let state = NavState::SelectingPeriod;
        let locators = &self.settings.locators;
        let target = plan.target;

        self.click_when_visible(session, state, &locators.period_picker)
            .await?;
        self.require_visible(session, state, &locators.previous_year_button)
            .await?;

        let year = locators.year_label(target.year)?;
        let bound = year_steps(plan.current, target);
        let mut clicks = 0u32;
        loop {
            if session
                .is_visible(&year)
                .await
                .map_err(PortalError::browser(state))?
            {
                break;
            }
            if clicks >= bound {
                return Err(PortalError::PeriodUnavailable(format!(
                    "year {} not reachable after {clicks} steps back",
                    target.year
                )));
            }
            if !session
                .is_enabled(&locators.previous_year_button)
                .await
                .map_err(PortalError::browser(state))?
            {
                return Err(PortalError::PeriodUnavailable(format!(
                    "year {} not available: previous year control is disabled",
                    target.year
                )));
            }
            session
                .click(&locators.previous_year_button)
                .await
                .map_err(PortalError::browser(state))?;
            clicks += 1;
            sleep(self.settings.poll_interval).await;
        }
        debug!(task_id = %plan.task_id, year = target.year, clicks, "year reached");

        let label = self
            .settings
            .month_labels
            .label(target.month)
            .ok_or_else(|| PortalError::PeriodUnavailable(format!("invalid month {}", target.month)))?;
        let month = locators.month_cell(label)?;
        self.require_visible(session, state, &month).await?;
        if !session
            .is_enabled(&month)
            .await
            .map_err(PortalError::browser(state))?
        {
            return Err(PortalError::PeriodUnavailable(format!(
                "month {target} not available"
            )));
        }
        session
            .click(&month)
            .await
            .map_err(PortalError::browser(state))?;
        Ok(())
    }

    async fn require_visible(
        &self,
        session: &mut dyn PortalSession,
        state: NavState,
        locator: &Locator,
    ) -> Result<(), PortalError> {
        let visible = wait_until_visible(
            session,
            locator,
            self.settings.step_timeout,
            self.settings.poll_interval,
        )
        .await
        .map_err(PortalError::browser(state))?;
        if visible {
            Ok(())
        } else {
            Err(PortalError::navigation(
                state,
                format!(
                    "{locator} not visible within {}s",
                    self.settings.step_timeout.as_secs()
                ),
            ))
        }
    }

    async fn click_when_visible(
        &self,
        session: &mut dyn PortalSession,
        state: NavState,
        locator: &Locator,
    ) -> Result<(), PortalError> {
        self.require_visible(session, state, locator).await?;
        session
            .click(locator)
            .await
            .map_err(PortalError::browser(state))
    }
}

async fn finalize_download(source: &Path, target: &Path) -> Result<(), PortalError> {
    if source != target {
        fs::rename(source, target).await.map_err(|err| {
            PortalError::Download(format!(
                "cannot move {} to {}: {err}",
                source.display(),
                target.display()
            ))
        })?;
    }
    match fs::metadata(target).await {
        Ok(meta) if meta.is_file() => Ok(()),
        Ok(_) => Err(PortalError::Download(format!(
            "{} is not a file",
            target.display()
        ))),
        Err(err) => Err(PortalError::Download(format!(
            "{} missing after download: {err}",
            target.display()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;

    const CONFIG: &str = r#"
        [portal]
        username = "user@example.com"
        password = "secret"
        meter_id = "PT0002000000000000AB"
    "#;

    #[test]
    fn settings_parse_default_selectors() {
        let config = parse_config(CONFIG).unwrap();
        let settings = NavigatorSettings::from_config(&config).unwrap();
        assert_eq!(settings.locators.username_input, Locator::css("#username"));
        assert_eq!(
            settings.locators.meter_item("PT0002000000000000AB").unwrap(),
            Locator::text("PT0002000000000000AB", false)
        );
        assert_eq!(
            settings.locators.year_label(2023).unwrap(),
            Locator::text("2023", true)
        );
        assert!(settings.login_error_pattern.is_match("Dados inválidos"));
        assert_eq!(settings.step_timeout, Duration::from_secs(30));
    }

    #[test]
    fn rejects_malformed_selector() {
        let raw = format!("{CONFIG}\n[portal.selectors]\nmonth_cell = \"div >> span\"\n");
        let config = parse_config(&raw).unwrap();
        let err = NavigatorSettings::from_config(&config).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "portal.selectors.month_cell"));
    }

    #[tokio::test]
    async fn finalize_download_renames_into_place() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("Consumos.xlsx");
        std::fs::write(&source, b"data").unwrap();
        let target = dir.path().join("2023_3_abcd1234_readings.xlsx");
        finalize_download(&source, &target).await.unwrap();
        assert!(target.is_file());
        assert!(!source.exists());
    }

    #[tokio::test]
    async fn finalize_download_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = finalize_download(&dir.path().join("gone.xlsx"), &dir.path().join("t.xlsx"))
            .await
            .unwrap_err();
        assert!(matches!(err, PortalError::Download(_)));
    }
}
