use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::time::{sleep, Instant};

use super::error::{BrowserError, BrowserResult};

const TEXT_EXACT: &str = "text=";
const TEXT_CONTAINS: &str = "text*=";
const SCOPE_SEPARATOR: &str = ">>";

/// A UI element reference. Text matching ignores case, surrounding
/// whitespace and a trailing period, so `Jan.` matches `jan`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Locator {
    Css {
        selector: String,
    },
    Text {
        scope: Option<String>,
        text: String,
        exact: bool,
    },
}

impl Locator {
    pub fn css(selector: impl Into<String>) -> Self {
        Locator::Css {
            selector: selector.into(),
        }
    }

    pub fn text(text: impl Into<String>, exact: bool) -> Self {
        Locator::Text {
            scope: None,
            text: text.into(),
            exact,
        }
    }

    pub fn parse(raw: &str) -> BrowserResult<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(BrowserError::Locator(raw.to_string()));
        }
        let (scope, body) = match raw.split_once(SCOPE_SEPARATOR) {
            Some((scope, body)) => {
                let scope = scope.trim();
                if scope.is_empty() {
                    return Err(BrowserError::Locator(raw.to_string()));
                }
                (Some(scope.to_string()), body.trim())
            }
            None => (None, raw),
        };
        let text_part = if let Some(text) = body.strip_prefix(TEXT_CONTAINS) {
            Some((text, false))
        } else {
            body.strip_prefix(TEXT_EXACT).map(|text| (text, true))
        };
        match (scope, text_part) {
            (scope, Some((text, exact))) => {
                if text.trim().is_empty() {
                    return Err(BrowserError::Locator(raw.to_string()));
                }
                Ok(Locator::Text {
                    scope,
                    text: text.trim().to_string(),
                    exact,
                })
            }
            (None, None) => Ok(Locator::css(body)),
            (Some(_), None) => Err(BrowserError::Locator(raw.to_string())),
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locator::Css { selector } => f.write_str(selector),
            Locator::Text { scope, text, exact } => {
                if let Some(scope) = scope {
                    write!(f, "{scope} {SCOPE_SEPARATOR} ")?;
                }
                let prefix = if *exact { TEXT_EXACT } else { TEXT_CONTAINS };
                write!(f, "{prefix}{text}")
            }
        }
    }
}

/// One isolated browser session driven by the navigator.
#[async_trait]
pub trait PortalSession: Send {
    async fn goto(&mut self, url: &str) -> BrowserResult<()>;
    async fn is_visible(&mut self, locator: &Locator) -> BrowserResult<bool>;
    async fn is_enabled(&mut self, locator: &Locator) -> BrowserResult<bool>;
    async fn text_of(&mut self, locator: &Locator) -> BrowserResult<Option<String>>;
    async fn click(&mut self, locator: &Locator) -> BrowserResult<()>;
    async fn fill(&mut self, locator: &Locator, value: &str) -> BrowserResult<()>;
    async fn screenshot(&mut self) -> BrowserResult<Vec<u8>>;
    async fn page_source(&mut self) -> BrowserResult<String>;
    /// Waits for the download directory to hold a completed file.
    async fn wait_for_download(&mut self, timeout: Duration) -> BrowserResult<Option<PathBuf>>;
    async fn close(&mut self) -> BrowserResult<()>;
}

#[async_trait]
pub trait PortalSessionFactory: Send + Sync {
    async fn open(&self, download_dir: &Path) -> BrowserResult<Box<dyn PortalSession>>;
}

/// Polls until the locator becomes visible. Returns `false` on timeout.
pub async fn wait_until_visible(
    session: &mut dyn PortalSession,
    locator: &Locator,
    timeout: Duration,
    poll: Duration,
) -> BrowserResult<bool> {
    let deadline = Instant::now() + timeout;
    loop {
        if session.is_visible(locator).await? {
            return Ok(true);
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        sleep(poll).await;
    }
}
