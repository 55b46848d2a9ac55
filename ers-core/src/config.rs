use std::fmt;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

pub const PASSWORD_ENV: &str = "ERS_PORTAL_PASSWORD";
pub const INFLUX_TOKEN_ENV: &str = "ERS_INFLUXDB_TOKEN";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ErsConfig {
    pub portal: PortalConfig,
    #[serde(default)]
    pub browser: BrowserConfig,
    #[serde(default)]
    pub paths: PathsSection,
    #[serde(default)]
    pub sinks: SinksSection,
}

impl ErsConfig {
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.paths.base_dir).join(path)
        }
    }

    /// Paths section with every entry resolved against `base_dir`.
    pub fn resolved_paths(&self) -> ResolvedPaths {
        ResolvedPaths {
            workspace_dir: self.resolve_path(&self.paths.workspace_dir),
            output_dir: self.resolve_path(&self.paths.output_dir),
            diagnostics_dir: self.resolve_path(&self.paths.diagnostics_dir),
            registry_db: self.resolve_path(&self.paths.registry_db),
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(password) = std::env::var(PASSWORD_ENV) {
            if !password.is_empty() {
                self.portal.password = password;
            }
        }
        if let Some(influx) = self.sinks.influxdb.as_mut() {
            if let Ok(token) = std::env::var(INFLUX_TOKEN_ENV) {
                if !token.is_empty() {
                    influx.token = token;
                }
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.portal.username.trim().is_empty() {
            return Err(invalid("portal.username", "must not be empty"));
        }
        if self.portal.meter_id.trim().is_empty() {
            return Err(invalid("portal.meter_id", "must not be empty"));
        }
        if self.portal.step_timeout_seconds == 0 {
            return Err(invalid("portal.step_timeout_seconds", "must be positive"));
        }
        if self.portal.download_timeout_seconds == 0 {
            return Err(invalid("portal.download_timeout_seconds", "must be positive"));
        }
        regex::Regex::new(&self.portal.selectors.login_error_pattern)
            .map_err(|err| invalid("portal.selectors.login_error_pattern", &err.to_string()))?;
        url::Url::parse(&self.portal.login_url)
            .map_err(|err| invalid("portal.login_url", &err.to_string()))?;
        if let Some(influx) = &self.sinks.influxdb {
            url::Url::parse(&influx.host)
                .map_err(|err| invalid("sinks.influxdb.host", &err.to_string()))?;
        }
        Ok(())
    }
}

fn invalid(key: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

#[derive(Clone, Deserialize)]
pub struct PortalConfig {
    pub username: String,
    #[serde(default)]
    pub password: String,
    pub meter_id: String,
    #[serde(default = "default_login_url")]
    pub login_url: String,
    #[serde(default = "default_step_timeout")]
    pub step_timeout_seconds: u64,
    #[serde(default = "default_download_timeout")]
    pub download_timeout_seconds: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Locale used for month labels in the period picker; falls back to the
    /// process locale environment when unset.
    #[serde(default)]
    pub month_locale: Option<String>,
    #[serde(default)]
    pub selectors: SelectorSection,
}

impl fmt::Debug for PortalConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortalConfig")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("meter_id", &self.meter_id)
            .field("login_url", &self.login_url)
            .field("step_timeout_seconds", &self.step_timeout_seconds)
            .field("download_timeout_seconds", &self.download_timeout_seconds)
            .field("poll_interval_ms", &self.poll_interval_ms)
            .field("month_locale", &self.month_locale)
            .field("selectors", &self.selectors)
            .finish()
    }
}

fn default_login_url() -> String {
    "https://balcaodigital.e-redes.pt/login".to_string()
}

fn default_step_timeout() -> u64 {
    30
}

fn default_download_timeout() -> u64 {
    30
}

fn default_poll_interval() -> u64 {
    250
}

/// UI locators for the portal. Plain values are CSS selectors; `text=` and
/// `text*=` prefixes match on visible text (exact / contains), optionally
/// scoped with `css >> text=...`. `{meter}`, `{year}` and `{month}` are
/// substituted before use.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SelectorSection {
    pub login_entry: String,
    pub username_input: String,
    pub password_input: String,
    pub submit_button: String,
    pub login_error: String,
    pub login_error_pattern: String,
    pub security_challenge: String,
    pub authenticated_marker: String,
    pub consumption_card: String,
    pub meter_list: String,
    pub meter_item: String,
    pub period_picker: String,
    pub previous_year_button: String,
    pub year_label: String,
    pub month_cell: String,
    pub export_button: String,
}

impl Default for SelectorSection {
    fn default() -> Self {
        Self {
            login_entry: ".ant-typography > .item > .highlights".to_string(),
            username_input: "#username".to_string(),
            password_input: "#labelPassword".to_string(),
            submit_button: "button >> text*=Entrar".to_string(),
            login_error: "app-sign-in nz-alert span".to_string(),
            login_error_pattern: "(?i)dados inv[áa]lidos".to_string(),
            security_challenge:
                "iframe[src*='captcha'], .g-recaptcha, #challenge-form, #px-captcha".to_string(),
            authenticated_marker: ".card__myplaces .card-text".to_string(),
            consumption_card: ".card:nth-child(3) .highlights".to_string(),
            meter_list: ".card:nth-child(1) > .item__title".to_string(),
            meter_item: "text*={meter}".to_string(),
            period_picker: "nz-range-picker".to_string(),
            previous_year_button: "button[title*='Ano anterior']".to_string(),
            year_label: "text={year}".to_string(),
            month_cell: "text={month}".to_string(),
            export_button: "strong >> text*=Exportar excel".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    pub executable_path: Option<String>,
    pub headless: bool,
    pub sandbox: bool,
    pub disable_gpu: bool,
    pub user_agent: Option<String>,
    pub lang: Option<String>,
    pub window_size: [u32; 2],
    pub request_timeout_seconds: Option<u64>,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            executable_path: None,
            headless: true,
            sandbox: false,
            disable_gpu: true,
            user_agent: None,
            lang: Some("pt-PT".to_string()),
            window_size: [1920, 1080],
            request_timeout_seconds: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsSection {
    pub base_dir: String,
    pub workspace_dir: String,
    pub output_dir: String,
    pub diagnostics_dir: String,
    pub registry_db: String,
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            base_dir: ".".to_string(),
            workspace_dir: "tmp".to_string(),
            output_dir: "output".to_string(),
            diagnostics_dir: ".".to_string(),
            registry_db: "ers.db".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub workspace_dir: PathBuf,
    pub output_dir: PathBuf,
    pub diagnostics_dir: PathBuf,
    pub registry_db: PathBuf,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SinksSection {
    pub influxdb: Option<InfluxSection>,
    pub duckdb: Option<DuckDbSection>,
}

#[derive(Clone, Deserialize)]
pub struct InfluxSection {
    #[serde(default = "default_influx_host")]
    pub host: String,
    #[serde(default = "default_influx_port")]
    pub port: u16,
    pub org: String,
    pub bucket: String,
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_measurement")]
    pub measurement: String,
    #[serde(default = "default_influx_timeout")]
    pub timeout_seconds: u64,
}

impl fmt::Debug for InfluxSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InfluxSection")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("org", &self.org)
            .field("bucket", &self.bucket)
            .field("token", &"<redacted>")
            .field("measurement", &self.measurement)
            .field("timeout_seconds", &self.timeout_seconds)
            .finish()
    }
}

fn default_influx_host() -> String {
    "http://localhost".to_string()
}

fn default_influx_port() -> u16 {
    8086
}

fn default_measurement() -> String {
    "kW".to_string()
}

fn default_influx_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct DuckDbSection {
    pub path: String,
    #[serde(default = "default_duckdb_table")]
    pub table: String,
}

fn default_duckdb_table() -> String {
    "readings".to_string()
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<ErsConfig> {
    let mut config: ErsConfig = load_toml(path)?;
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

pub fn parse_config(content: &str) -> Result<ErsConfig> {
    let config: ErsConfig = toml::from_str(content).map_err(|source| ConfigError::Parse {
        source,
        path: PathBuf::from("<inline>"),
    })?;
    config.validate()?;
    Ok(config)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
