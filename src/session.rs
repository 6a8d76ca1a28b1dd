//! Context-per-render browser sessions over a blocking driver.
//!
//! One browser process is launched when the renderer is built and lives
//! until `shutdown`. Each `render` call opens a fresh isolated session
//! (cookies, storage and emulation settings are private to it), drives a
//! single page inside it and closes the session on every exit path.
//!
//! The driver itself is abstracted by [`SessionBackend`]; with the `cdp`
//! feature [`crate::cdp::CdpBackend`] drives Chrome through `headless_chrome`.

use crate::{
    conclude, CookieParam, Error, PageCapture, RenderOptions, RenderResult, RenderStats, Renderer,
    RendererConfig, Result, StatsSnapshot, Viewport, WaitUntil,
};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::{Duration, Instant};

/// Rendering engine families a session driver can launch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrowserEngine {
    Chromium,
    Firefox,
    Webkit,
}

impl BrowserEngine {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrowserEngine::Chromium => "chromium",
            BrowserEngine::Firefox => "firefox",
            BrowserEngine::Webkit => "webkit",
        }
    }
}

impl fmt::Display for BrowserEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BrowserEngine {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "chromium" => Ok(BrowserEngine::Chromium),
            "firefox" => Ok(BrowserEngine::Firefox),
            "webkit" => Ok(BrowserEngine::Webkit),
            other => Err(Error::Configuration(format!("Unsupported browser type: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ColorScheme {
    #[default]
    Light,
    Dark,
    NoPreference,
}

impl ColorScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColorScheme::Light => "light",
            ColorScheme::Dark => "dark",
            ColorScheme::NoPreference => "no-preference",
        }
    }
}

/// Options for the one-time browser launch
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchOptions {
    pub engine: BrowserEngine,
    pub headless: bool,
    /// Launch timeout
    pub timeout: Duration,
    pub proxy: Option<String>,
    /// Persistent profile directory
    pub user_data_dir: Option<PathBuf>,
    pub executable_path: Option<PathBuf>,
    pub ignore_https_errors: bool,
    pub window: Viewport,
}

/// Emulation settings for one isolated session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    pub viewport: Viewport,
    pub device_scale_factor: f64,
    pub color_scheme: Option<ColorScheme>,
    pub locale: Option<String>,
    pub timezone_id: Option<String>,
    pub user_agent: Option<String>,
}

/// Main-document response as reported by the driver
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NavigationResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
}

/// A blocking browser driver holding one long-lived browser process.
pub trait SessionBackend: Sized {
    type Session<'a>: BrowserSession
    where
        Self: 'a;

    /// Label used in error messages
    const NAME: &'static str;

    /// Start the driver and launch the browser.
    fn launch(options: &LaunchOptions) -> Result<Self>;

    /// Open an isolated session inside the running browser.
    fn new_session(&self, options: &SessionOptions) -> Result<Self::Session<'_>>;

    fn close_browser(&mut self) -> Result<()>;

    /// Stop the driver subsystem after the browser is gone.
    fn stop(&mut self) -> Result<()>;
}

/// An isolated browsing context, scoped to one render call
pub trait BrowserSession {
    type Page: SessionPage;

    fn add_cookies(&mut self, cookies: &[CookieParam]) -> Result<()>;

    fn new_page(&mut self) -> Result<Self::Page>;

    fn close(self) -> Result<()>;
}

/// A page inside a session
pub trait SessionPage {
    fn set_extra_headers(&self, headers: &HashMap<String, String>) -> Result<()>;

    /// Applies to navigation and to every other wait on this page.
    fn set_default_timeout(&self, timeout: Duration);

    /// Navigate and wait for `wait_until`. `None` when the engine did not
    /// expose a main-document response.
    fn goto(&self, url: &str, wait_until: WaitUntil, timeout: Duration)
        -> Result<Option<NavigationResponse>>;

    fn wait_for_timeout(&self, duration: Duration) {
        std::thread::sleep(duration);
    }

    fn wait_for_selector(&self, selector: &str, timeout: Duration) -> Result<()>;

    fn evaluate(&self, script: &str) -> Result<serde_json::Value>;

    fn content(&self) -> Result<String>;

    fn url(&self) -> String;

    fn screenshot(&self) -> Result<Vec<u8>>;
}

/// Configuration for [`SessionRenderer`]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// `chromium`, `firefox` or `webkit`; checked before anything launches
    pub browser_type: String,
    pub headless: bool,
    pub renderer: RendererConfig,
    pub proxy: Option<String>,
    pub user_data_dir: Option<PathBuf>,
    pub screenshot: bool,
    pub window: Viewport,
    pub browser_path: Option<PathBuf>,
    pub device_scale_factor: f64,
    pub color_scheme: Option<ColorScheme>,
    pub locale: Option<String>,
    pub timezone_id: Option<String>,
    pub user_agent: Option<String>,
    pub ignore_https_errors: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            browser_type: "chromium".to_string(),
            headless: true,
            renderer: RendererConfig::default(),
            proxy: None,
            user_data_dir: None,
            screenshot: false,
            window: Viewport::default(),
            browser_path: None,
            device_scale_factor: 1.0,
            color_scheme: Some(ColorScheme::Light),
            locale: None,
            timezone_id: None,
            user_agent: None,
            ignore_https_errors: false,
        }
    }
}

impl SessionConfig {
    fn launch_options(&self, engine: BrowserEngine) -> LaunchOptions {
        LaunchOptions {
            engine,
            headless: self.headless,
            timeout: self.renderer.timeout,
            proxy: self.proxy.clone(),
            user_data_dir: self.user_data_dir.clone(),
            executable_path: self.browser_path.clone(),
            ignore_https_errors: self.ignore_https_errors,
            window: self.window,
        }
    }
}

/// Renderer with one long-lived browser and one session per call
pub struct SessionRenderer<B: SessionBackend> {
    backend: Option<B>,
    engine: BrowserEngine,
    config: SessionConfig,
    stats: RenderStats,
}

impl<B: SessionBackend> SessionRenderer<B> {
    /// Validate the engine name, then launch the browser.
    pub fn new(config: SessionConfig) -> Result<Self> {
        config.renderer.validate()?;
        let engine: BrowserEngine = config.browser_type.parse()?;

        debug!("Launching {} browser", engine);
        let backend = B::launch(&config.launch_options(engine)).map_err(|e| {
            error!("Failed to launch {} browser: {}", engine, e);
            e
        })?;
        info!("Launched {} browser", engine);

        Ok(Self {
            backend: Some(backend),
            engine,
            config,
            stats: RenderStats::new(),
        })
    }

    pub fn engine(&self) -> BrowserEngine {
        self.engine
    }

    /// Call-level overrides take precedence over the configured defaults.
    fn session_options(&self, options: &RenderOptions) -> SessionOptions {
        SessionOptions {
            viewport: options.viewport_or(self.config.window),
            device_scale_factor: self.config.device_scale_factor,
            color_scheme: self.config.color_scheme,
            locale: self.config.locale.clone(),
            timezone_id: self.config.timezone_id.clone(),
            user_agent: options
                .user_agent_or(self.config.user_agent.as_deref())
                .map(str::to_string),
        }
    }

    fn render_in_session(&self, backend: &B, url: &str, options: &RenderOptions) -> Result<PageCapture> {
        let mut session = backend.new_session(&self.session_options(options))?;
        let outcome = self.drive(&mut session, url, options);
        if let Err(e) = session.close() {
            warn!("Error closing browser context: {}", e);
        }
        outcome
    }

    fn drive(&self, session: &mut B::Session<'_>, url: &str, options: &RenderOptions) -> Result<PageCapture> {
        if !options.cookies.is_empty() {
            session.add_cookies(&options.cookies)?;
        }

        let page = session.new_page()?;

        if !options.headers.is_empty() {
            page.set_extra_headers(&options.headers)?;
        }

        let timeout = options.render_timeout_or(&self.config.renderer);
        page.set_default_timeout(timeout);

        debug!("Loading URL: {}", url);
        let response = page.goto(url, options.wait_until, timeout)?;

        if let Some(wait) = options.wait_time.filter(|d| !d.is_zero()) {
            page.wait_for_timeout(wait);
        }

        if let Some(selector) = &options.wait_for_selector {
            page.wait_for_selector(selector, timeout)?;
        }

        if let Some(script) = &options.script {
            page.evaluate(script)?;
        }

        let html = page.content()?;
        let final_url = page.url();
        let response = response.unwrap_or_default();

        let screenshot = if self.config.screenshot {
            Some(page.screenshot()?)
        } else {
            None
        };

        Ok(PageCapture {
            html,
            status_code: response.status,
            headers: response.headers,
            url: final_url,
            screenshot,
        })
    }
}

impl<B: SessionBackend> Renderer for SessionRenderer<B> {
    fn name(&self) -> &'static str {
        B::NAME
    }

    fn render(&self, url: &str, options: &RenderOptions) -> RenderResult {
        let started = Instant::now();
        let outcome = match &self.backend {
            Some(backend) => self.render_in_session(backend, url, options),
            None => Err(Error::Configuration("renderer has been shut down".into())),
        };
        conclude(&self.stats, started, B::NAME, url, outcome)
    }

    fn shutdown(&mut self) {
        let Some(mut backend) = self.backend.take() else {
            return;
        };
        info!(
            "Shutting down {} renderer. Stats: {}",
            self.engine,
            self.stats.snapshot()
        );
        if let Err(e) = backend.close_browser() {
            error!("Error closing browser: {}", e);
        }
        if let Err(e) = backend.stop() {
            error!("Error stopping driver: {}", e);
        }
    }

    fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

impl<B: SessionBackend> Drop for SessionRenderer<B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
