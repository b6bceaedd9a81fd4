use async_trait::async_trait;
use headless_chrome::protocol::cdp::{Emulation, Page};
use headless_chrome::{Browser, LaunchOptions, Tab};
use std::ffi::OsStr;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::RendererSettings;
use crate::error::RenderError;
use crate::models::Location;
use crate::stealth;

const RESULTS_CONTAINER: &str = "#search";

// headless_chrome tears the process down after this long without CDP traffic.
const BROWSER_IDLE_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Produces the rendered HTML of a results page.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, keyword: &str, location: &Location) -> Result<String, RenderError>;

    /// Release the browser process. Safe to call more than once.
    async fn shutdown(&self);
}

/// Starts and probes a browser process. Both calls block and are run on the
/// blocking pool.
pub trait BrowserLauncher: Send + Sync + 'static {
    type Browser: Send + Sync + 'static;

    fn launch(&self) -> anyhow::Result<Self::Browser>;

    fn is_alive(&self, browser: &Self::Browser) -> bool;
}

/// Launches headless Chrome with the stealth flags.
pub struct ChromeLauncher {
    settings: RendererSettings,
}

impl ChromeLauncher {
    pub fn new(settings: RendererSettings) -> Self {
        Self { settings }
    }
}

impl BrowserLauncher for ChromeLauncher {
    type Browser = Browser;

    fn launch(&self) -> anyhow::Result<Browser> {
        let settings = &self.settings;
        let mut args: Vec<&OsStr> = stealth::STEALTH_ARGS.iter().map(OsStr::new).collect();
        let ua_arg = format!("--user-agent={}", settings.user_agent);
        args.push(OsStr::new(&ua_arg));

        if let Some(path) = &settings.chrome_path {
            info!("Using Chrome executable at {}", path.display());
        }

        Browser::new(LaunchOptions {
            headless: settings.headless,
            sandbox: false,
            window_size: Some(settings.viewport),
            path: settings.chrome_path.clone(),
            idle_browser_timeout: BROWSER_IDLE_TIMEOUT,
            args,
            ..Default::default()
        })
    }

    fn is_alive(&self, browser: &Browser) -> bool {
        browser.get_version().is_ok()
    }
}

/// One browser shared by every render, launched on first use.
///
/// Concurrent first callers wait on the same mutex, so only one launch
/// happens and everyone sees its outcome. A failed launch leaves the slot
/// empty and the next call tries again. A browser that stops answering the
/// health probe is replaced.
pub struct SharedBrowser<L: BrowserLauncher> {
    launcher: Arc<L>,
    slot: Mutex<Option<Arc<L::Browser>>>,
}

impl<L: BrowserLauncher> SharedBrowser<L> {
    pub fn new(launcher: L) -> Self {
        Self {
            launcher: Arc::new(launcher),
            slot: Mutex::new(None),
        }
    }

    pub async fn get(&self) -> Result<Arc<L::Browser>, RenderError> {
        let mut slot = self.slot.lock().await;

        if let Some(browser) = slot.as_ref() {
            let launcher = self.launcher.clone();
            let probe = browser.clone();
            let alive = tokio::task::spawn_blocking(move || launcher.is_alive(&probe))
                .await
                .unwrap_or(false);
            if alive {
                return Ok(browser.clone());
            }
            warn!("⚠️ Browser health check failed, relaunching");
            *slot = None;
        }

        info!("🚀 Launching headless Chrome...");
        let launcher = self.launcher.clone();
        let browser = tokio::task::spawn_blocking(move || launcher.launch())
            .await
            .map_err(|e| RenderError::Task(e.to_string()))?
            .map_err(|e| RenderError::BrowserUnavailable(e.to_string()))?;

        let browser = Arc::new(browser);
        *slot = Some(browser.clone());
        info!("✅ Headless Chrome ready");
        Ok(browser)
    }

    /// Forget the current browser so the next `get` launches a fresh one.
    pub async fn discard(&self) -> Option<Arc<L::Browser>> {
        self.slot.lock().await.take()
    }
}

/// Renderer backed by one shared headless Chrome process.
pub struct ChromeRenderer {
    settings: RendererSettings,
    browser: SharedBrowser<ChromeLauncher>,
}

impl ChromeRenderer {
    pub fn new(settings: RendererSettings) -> Self {
        Self {
            browser: SharedBrowser::new(ChromeLauncher::new(settings.clone())),
            settings,
        }
    }
}

#[async_trait]
impl Renderer for ChromeRenderer {
    async fn render(&self, keyword: &str, location: &Location) -> Result<String, RenderError> {
        let browser = self.browser.get().await?;

        let settings = self.settings.clone();
        let keyword = keyword.to_string();
        let location = location.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            render_page(&browser, &settings, &keyword, &location)
        })
        .await
        .map_err(|e| RenderError::Task(e.to_string()))?;

        if let Err(RenderError::BrowserUnavailable(reason)) = &outcome {
            warn!("⚠️ Dropping shared browser after failure: {}", reason);
            self.browser.discard().await;
        }
        outcome
    }

    async fn shutdown(&self) {
        if let Some(browser) = self.browser.discard().await {
            info!("Closing headless Chrome");
            // Dropping the last handle kills the process.
            let _ = tokio::task::spawn_blocking(move || drop(browser)).await;
        }
    }
}

/// A tab that can be closed; lets `TabGuard` work over test doubles.
pub trait CloseTab {
    fn close_tab(&self) -> anyhow::Result<()>;
}

impl CloseTab for Tab {
    fn close_tab(&self) -> anyhow::Result<()> {
        self.close(false).map(|_| ())
    }
}

/// Closes its tab when dropped, whichever way the render exits.
struct TabGuard<T: CloseTab = Tab>(Arc<T>);

impl<T: CloseTab> Deref for TabGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T: CloseTab> Drop for TabGuard<T> {
    fn drop(&mut self) {
        if let Err(e) = self.0.close_tab() {
            debug!("Tab close failed: {}", e);
        }
    }
}

fn render_page(
    browser: &Browser,
    settings: &RendererSettings,
    keyword: &str,
    location: &Location,
) -> Result<String, RenderError> {
    let tab = TabGuard(
        browser
            .new_tab()
            .map_err(|e| RenderError::BrowserUnavailable(e.to_string()))?,
    );
    tab.set_default_timeout(settings.navigation_timeout);

    let page_err = |e: anyhow::Error| classify(e, "page", settings.navigation_timeout);

    tab.set_user_agent(&settings.user_agent, Some("en-US,en;q=0.9"), Some("Win32"))
        .map_err(page_err)?;

    tab.enable_debugger().map_err(page_err)?;
    inject_script(&tab, stealth::STEALTH_SCRIPT.to_string()).map_err(page_err)?;
    if let Some((lat, lng)) = location.coordinates() {
        tab.call_method(Emulation::SetGeolocationOverride {
            latitude: Some(lat),
            longitude: Some(lng),
            accuracy: Some(stealth::GEOLOCATION_ACCURACY_M),
            altitude: None,
            altitude_accuracy: None,
            heading: None,
            speed: None,
        })
        .map_err(page_err)?;
        // The override only answers once geolocation permission is granted.
        inject_script(&tab, stealth::geolocation_script(lat, lng)).map_err(page_err)?;
    }

    let url = build_search_url(keyword, location, settings.results_per_page);
    info!("🔎 Navigating to: {}", url);

    let nav_err = |e: anyhow::Error| classify(e, "navigation", settings.navigation_timeout);
    tab.navigate_to(&url).map_err(nav_err)?;
    tab.wait_until_navigated().map_err(nav_err)?;

    if let Err(e) = tab.wait_for_element_with_custom_timeout(RESULTS_CONTAINER, settings.results_timeout) {
        debug!("Results container wait failed: {}", e);
        let content = tab.get_content().unwrap_or_default();
        return Err(match stealth::challenge_marker(&content) {
            Some(marker) => RenderError::Blocked {
                marker: marker.to_string(),
            },
            None => RenderError::Timeout {
                stage: "results",
                timeout: settings.results_timeout,
            },
        });
    }

    let html = tab.get_content().map_err(page_err)?;
    debug!("Got content. Length: {}", html.len());
    Ok(html)
}

fn inject_script(tab: &Tab, source: String) -> anyhow::Result<()> {
    tab.call_method(Page::AddScriptToEvaluateOnNewDocument {
        source,
        world_name: None,
        include_command_line_api: None,
        run_immediately: None,
    })?;
    Ok(())
}

/// headless_chrome reports everything as `anyhow::Error`; sort by message.
fn classify(e: anyhow::Error, stage: &'static str, timeout: Duration) -> RenderError {
    let msg = e.to_string();
    if is_timeout_message(&msg) {
        RenderError::Timeout { stage, timeout }
    } else if is_dead_browser_message(&msg) {
        RenderError::BrowserUnavailable(msg)
    } else {
        RenderError::Navigation(msg)
    }
}

fn is_timeout_message(msg: &str) -> bool {
    let lowered = msg.to_lowercase();
    lowered.contains("timeout") || lowered.contains("timed out") || lowered.contains("never came")
}

fn is_dead_browser_message(msg: &str) -> bool {
    msg.contains("connection is closed") || msg.contains("No such process")
}

/// Google search URL for a keyword, optionally qualified by a "near" location.
pub fn build_search_url(keyword: &str, location: &Location, results_per_page: u32) -> String {
    let mut url = format!(
        "https://www.google.com/search?q={}&hl=en",
        urlencoding::encode(keyword)
    );
    if let Some(name) = location.display_name() {
        url.push_str("&near=");
        url.push_str(&urlencoding::encode(name));
    }
    url.push_str(&format!("&num={}", results_per_page));
    url
}
