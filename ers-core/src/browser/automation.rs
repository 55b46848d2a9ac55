use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig as ChromiumConfig};
use chromiumoxide::cdp::browser_protocol::browser::{
    SetDownloadBehaviorBehavior, SetDownloadBehaviorParams,
};
use chromiumoxide::cdp::browser_protocol::page::NavigateParams;
use chromiumoxide::cdp::browser_protocol::target::CreateTargetParams;
use chromiumoxide::handler::viewport::Viewport as ChromiumViewport;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::BrowserConfig;

use super::download::poll_for_download;
use super::error::{BrowserError, BrowserResult};
use super::session::{Locator, PortalSession, PortalSessionFactory};

const TARGET_ATTRIBUTE: &str = "data-ers-target";

/// Launches one Chromium instance per portal session, each with its own
/// throwaway profile and download directory.
#[derive(Debug, Clone)]
pub struct BrowserLauncher {
    config: Arc<BrowserConfig>,
    poll_interval: Duration,
}

impl BrowserLauncher {
    pub fn new(config: BrowserConfig, poll_interval: Duration) -> Self {
        Self {
            config: Arc::new(config),
            poll_interval,
        }
    }

    pub async fn launch(&self, download_dir: &Path) -> BrowserResult<ChromiumSession> {
        let profile = tempfile::Builder::new().prefix("ers-profile-").tempdir()?;
        let chromium_config = self.build_chromium_config(profile.path())?;
        info!(
            profile = %profile.path().display(),
            downloads = %download_dir.display(),
            headless = self.config.headless,
            "Launching Chromium instance"
        );

        let (browser, mut handler) = Browser::launch(chromium_config)
            .await
            .map_err(|err| BrowserError::Launch(err.to_string()))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(error = %err, "Chromium handler reported error");
                }
            }
        });

        let download_path = std::path::absolute(download_dir)?;
        let behavior = SetDownloadBehaviorParams::builder()
            .behavior(SetDownloadBehaviorBehavior::Allow)
            .download_path(download_path.to_string_lossy().to_string())
            .build()
            .map_err(BrowserError::Configuration)?;
        browser.execute(behavior).await?;

        let page = browser
            .new_page(CreateTargetParams::new("about:blank"))
            .await?;

        Ok(ChromiumSession {
            browser,
            page,
            handler_task: Some(handler_task),
            _profile: profile,
            download_dir: download_path,
            poll_interval: self.poll_interval,
        })
    }

    fn build_chromium_config(&self, profile_dir: &Path) -> BrowserResult<ChromiumConfig> {
        let [width, height] = self.config.window_size;
        let mut builder = ChromiumConfig::builder()
            .user_data_dir(profile_dir)
            .viewport(ChromiumViewport {
                width,
                height,
                device_scale_factor: None,
                emulating_mobile: false,
                is_landscape: width >= height,
                has_touch: false,
            });

        if let Some(executable) = &self.config.executable_path {
            builder = builder.chrome_executable(executable);
        }
        if !self.config.headless {
            builder = builder.with_head();
        }
        if !self.config.sandbox {
            builder = builder.no_sandbox();
        }
        if let Some(timeout) = self.config.request_timeout_seconds {
            builder = builder.request_timeout(Duration::from_secs(timeout));
        }

        let mut args = vec![format!("--window-size={width},{height}")];
        if self.config.disable_gpu {
            args.push("--disable-gpu".into());
        }
        if let Some(user_agent) = &self.config.user_agent {
            args.push(format!("--user-agent={user_agent}"));
        }
        if let Some(lang) = &self.config.lang {
            args.push(format!("--lang={lang}"));
        }
        args.push("--no-first-run".into());
        args.push("--password-store=basic".into());

        builder = builder.args(args);

        builder.build().map_err(BrowserError::Configuration)
    }
}

#[async_trait]
impl PortalSessionFactory for BrowserLauncher {
    async fn open(&self, download_dir: &Path) -> BrowserResult<Box<dyn PortalSession>> {
        let session = self.launch(download_dir).await?;
        Ok(Box::new(session))
    }
}

#[derive(Debug)]
pub struct ChromiumSession {
    browser: Browser,
    page: Page,
    handler_task: Option<JoinHandle<()>>,
    _profile: TempDir,
    download_dir: PathBuf,
    poll_interval: Duration,
}

#[derive(Debug, Serialize)]
struct ProbeSpec<'a> {
    css: Option<&'a str>,
    text: Option<&'a str>,
    exact: bool,
}

#[derive(Debug, Default, Deserialize)]
struct ProbeResult {
    found: bool,
    visible: bool,
    enabled: bool,
    text: Option<String>,
}

impl ChromiumSession {
    /// Resolves the locator in the page and tags the match with
    /// `data-ers-target` so it can be fetched as an element handle.
    async fn probe(&self, locator: &Locator) -> BrowserResult<ProbeResult> {
        let spec = match locator {
            Locator::Css { selector } => ProbeSpec {
                css: Some(selector),
                text: None,
                exact: true,
            },
            Locator::Text { scope, text, exact } => ProbeSpec {
                css: scope.as_deref(),
                text: Some(text),
                exact: *exact,
            },
        };
        let spec = serde_json::to_string(&spec)
            .map_err(|err| BrowserError::Script(format!("failed to encode locator: {err}")))?;
        let script = PROBE_SCRIPT
            .replace("__SPEC__", &spec)
            .replace("__MARKER__", TARGET_ATTRIBUTE);
        self.page
            .evaluate(script.as_str())
            .await
            .map_err(|err| BrowserError::Script(format!("failed to probe {locator}: {err}")))?
            .into_value()
            .map_err(|err| BrowserError::Script(format!("failed to decode probe result: {err}")))
    }

    async fn element(&self, locator: &Locator) -> BrowserResult<chromiumoxide::Element> {
        let probe = self.probe(locator).await?;
        if !probe.found {
            return Err(BrowserError::ElementNotFound(locator.to_string()));
        }
        let selector = format!("[{TARGET_ATTRIBUTE}='1']");
        self.page
            .find_element(selector.as_str())
            .await
            .map_err(|_| BrowserError::ElementNotFound(locator.to_string()))
    }

    async fn shutdown(&mut self) -> BrowserResult<()> {
        info!(downloads = %self.download_dir.display(), "Shutting down Chromium instance");
        if let Err(err) = self.browser.close().await {
            warn!(error = %err, "Failed to close browser gracefully");
        }
        if let Some(handle) = self.handler_task.take() {
            if let Err(err) = handle.await {
                warn!(error = %err, "Browser handler join error");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PortalSession for ChromiumSession {
    async fn goto(&mut self, url: &str) -> BrowserResult<()> {
        let params = NavigateParams::builder()
            .url(url)
            .build()
            .map_err(BrowserError::Configuration)?;
        self.page.goto(params).await?;
        self.page.wait_for_navigation().await?;
        Ok(())
    }

    async fn is_visible(&mut self, locator: &Locator) -> BrowserResult<bool> {
        let probe = self.probe(locator).await?;
        Ok(probe.found && probe.visible)
    }

    async fn is_enabled(&mut self, locator: &Locator) -> BrowserResult<bool> {
        let probe = self.probe(locator).await?;
        Ok(probe.found && probe.enabled)
    }

    async fn text_of(&mut self, locator: &Locator) -> BrowserResult<Option<String>> {
        let probe = self.probe(locator).await?;
        Ok(if probe.found { probe.text } else { None })
    }

    async fn click(&mut self, locator: &Locator) -> BrowserResult<()> {
        let element = self.element(locator).await?;
        element.scroll_into_view().await?;
        element.click().await?;
        Ok(())
    }

    async fn fill(&mut self, locator: &Locator, value: &str) -> BrowserResult<()> {
        let element = self.element(locator).await?;
        element
            .call_js_fn("function() { this.value = ''; }", false)
            .await?;
        element.click().await?;
        element.type_str(value).await?;
        Ok(())
    }

    async fn screenshot(&mut self) -> BrowserResult<Vec<u8>> {
        let params = ScreenshotParams::builder().full_page(true).build();
        Ok(self.page.screenshot(params).await?)
    }

    async fn page_source(&mut self) -> BrowserResult<String> {
        Ok(self.page.content().await?)
    }

    async fn wait_for_download(&mut self, timeout: Duration) -> BrowserResult<Option<PathBuf>> {
        Ok(poll_for_download(&self.download_dir, timeout, self.poll_interval).await?)
    }

    async fn close(&mut self) -> BrowserResult<()> {
        self.shutdown().await
    }
}

impl Drop for ChromiumSession {
    fn drop(&mut self) {
        if let Some(handle) = &self.handler_task {
            if !handle.is_finished() {
                warn!(
                    downloads = %self.download_dir.display(),
                    "ChromiumSession dropped without explicit close"
                );
            }
        }
    }
}

const PROBE_SCRIPT: &str = r#"
(() => {
    const spec = __SPEC__;
    const marker = '__MARKER__';
    document.querySelectorAll('[' + marker + ']').forEach(node => node.removeAttribute(marker));
    const norm = (value) => String(value || '').trim().toLowerCase().replace(/\.$/, '');
    const textOf = (node) => (node.innerText || node.textContent || '').trim();
    const wanted = spec.text === null ? null : norm(spec.text);
    const matches = (node) => {
        const text = norm(textOf(node));
        return spec.exact ? text === wanted : text.includes(wanted);
    };
    let found = null;
    if (wanted === null) {
        found = document.querySelector(spec.css);
    } else {
        const roots = spec.css ? Array.from(document.querySelectorAll(spec.css)) : [document.body];
        for (const root of roots) {
            const hits = [root, ...root.querySelectorAll('*')].filter(matches);
            const leaf = hits.find(node => !hits.some(other => other !== node && node.contains(other)));
            if (leaf) {
                found = leaf;
                break;
            }
        }
    }
    if (!found) {
        return { found: false, visible: false, enabled: false, text: null };
    }
    found.setAttribute(marker, '1');
    const style = window.getComputedStyle(found);
    const rect = found.getBoundingClientRect();
    const visible = style.visibility !== 'hidden' && style.display !== 'none'
        && rect.width > 0 && rect.height > 0;
    const enabled = !found.disabled
        && !found.closest('[disabled], [aria-disabled="true"], .ant-picker-cell-disabled');
    return { found: true, visible, enabled, text: textOf(found) };
})()
"#;
