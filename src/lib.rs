//! crawlrender
//!
//! JavaScript rendering backends for web crawlers. Every backend sits behind
//! the same [`Renderer`] contract: construct it once (this launches or
//! checks the engine), call [`Renderer::render`] any number of times, then
//! call [`Renderer::shutdown`].
//!
//! # Backends
//!
//! - **Splash** (`splash` feature, default): a remote headless-browser HTTP
//!   service driven by a Lua script, one round trip per render
//! - **Session** (always built, `cdp` feature for the Chrome backend): one
//!   long-lived browser, an isolated context per render
//! - **Devtools** (always built, `devtools` feature for the chromiumoxide
//!   backend): async CDP driver run on an owned or borrowed tokio runtime
//! - **WebDriver** (`webdriver` feature, default): W3C WebDriver protocol
//!   against chromedriver, geckodriver or msedgedriver
//!
//! # Failure model
//!
//! Constructors return `Err` for configuration problems. `render` never
//! does: navigation errors, timeouts and transport failures come back as a
//! [`RenderResult`] whose `error` is set.
//!
//! # Example
//!
//! ```no_run
//! use crawlrender::{Renderer, RenderOptions};
//! use crawlrender::splash::{SplashConfig, SplashRenderer};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut renderer = SplashRenderer::new(SplashConfig::default())?;
//! let result = renderer.render("https://example.com", &RenderOptions::default());
//! match &result.error {
//!     None => println!("{} bytes, status {}", result.html.len(), result.status_code),
//!     Some(e) => eprintln!("render failed: {}", e),
//! }
//! renderer.shutdown();
//! # Ok(())
//! # }
//! ```

use log::{debug, error};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

pub mod error;
pub use error::{Error, ErrorKind, Result};

pub mod stats;
pub use stats::{RenderStats, StatsSnapshot};

pub mod settings;
pub mod backend;

#[cfg(feature = "splash")]
pub mod splash;

// Context-per-render browser sessions; the Chrome backend lives in `cdp`
pub mod session;

#[cfg(feature = "cdp")]
pub mod cdp;

// Async CDP driver with its own event loop
pub mod devtools;

#[cfg(feature = "webdriver")]
pub mod webdriver;

// Worker-thread facade for async callers
pub mod async_api;
pub use async_api::AsyncRenderer;

pub mod detect;
pub mod extract;
pub mod user_agent;

/// Timeouts shared by every backend.
///
/// `resource_timeout` is advisory: only backends that can bound individual
/// sub-resource fetches (Splash) enforce it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    /// Connection / launch timeout
    pub timeout: Duration,
    /// Upper bound for a whole render operation
    pub render_timeout: Duration,
    /// Upper bound for each sub-resource fetch
    pub resource_timeout: Duration,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            render_timeout: Duration::from_secs(60),
            resource_timeout: Duration::from_secs(30),
        }
    }
}

impl RendererConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("timeout", self.timeout),
            ("render_timeout", self.render_timeout),
            ("resource_timeout", self.resource_timeout),
        ] {
            if value.is_zero() {
                return Err(Error::Configuration(format!("{} must be positive", name)));
            }
        }
        Ok(())
    }
}

/// Viewport dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1024,
            height: 768,
        }
    }
}

/// When a navigation is considered finished.
///
/// Backends translate this into their own wait primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitUntil {
    #[default]
    Load,
    DomContentLoaded,
    NetworkIdle,
}

impl WaitUntil {
    pub fn as_str(&self) -> &'static str {
        match self {
            WaitUntil::Load => "load",
            WaitUntil::DomContentLoaded => "domcontentloaded",
            WaitUntil::NetworkIdle => "networkidle",
        }
    }
}

/// Unknown values fall back to `Load`.
impl From<&str> for WaitUntil {
    fn from(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "domcontentloaded" => WaitUntil::DomContentLoaded,
            "networkidle" => WaitUntil::NetworkIdle,
            _ => WaitUntil::Load,
        }
    }
}

/// A cookie to seed before navigation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CookieParam {
    pub name: String,
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secure: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_only: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub same_site: Option<String>,
    /// Expiry as seconds since the Unix epoch
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires: Option<u64>,
}

impl CookieParam {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            ..Default::default()
        }
    }

    /// `Network.CookieParam` JSON for the DevTools protocol.
    ///
    /// Cookies without a url or domain are scoped to `page_url`.
    pub(crate) fn cdp_params(&self, page_url: &str) -> serde_json::Value {
        let mut params = serde_json::json!({ "name": self.name, "value": self.value });
        match (&self.url, &self.domain) {
            (None, None) => params["url"] = page_url.into(),
            (url, domain) => {
                if let Some(url) = url {
                    params["url"] = url.as_str().into();
                }
                if let Some(domain) = domain {
                    params["domain"] = domain.as_str().into();
                }
            }
        }
        if let Some(path) = &self.path {
            params["path"] = path.as_str().into();
        }
        if let Some(secure) = self.secure {
            params["secure"] = secure.into();
        }
        if let Some(http_only) = self.http_only {
            params["httpOnly"] = http_only.into();
        }
        let same_site = self.same_site.as_deref().map(str::to_ascii_lowercase);
        match same_site.as_deref() {
            Some("strict") => params["sameSite"] = "Strict".into(),
            Some("lax") => params["sameSite"] = "Lax".into(),
            Some("none") => params["sameSite"] = "None".into(),
            _ => {}
        }
        if let Some(expires) = self.expires {
            params["expires"] = (expires as f64).into();
        }
        params
    }
}

/// Per-call render parameters.
///
/// Overrides here apply to one call only; adapters never copy them into
/// their own state.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderOptions {
    /// Unconditional pause after navigation completes
    pub wait_time: Option<Duration>,
    pub wait_for_selector: Option<String>,
    pub wait_until: WaitUntil,
    /// Extra request headers, merged over adapter defaults
    pub headers: HashMap<String, String>,
    pub cookies: Vec<CookieParam>,
    pub user_agent: Option<String>,
    pub viewport_width: Option<u32>,
    pub viewport_height: Option<u32>,
    /// Overrides the adapter's `render_timeout` for this call
    pub timeout: Option<Duration>,
    /// Script evaluated after load, where the backend supports it
    pub script: Option<String>,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            wait_time: Some(Duration::from_secs(2)),
            wait_for_selector: None,
            wait_until: WaitUntil::Load,
            headers: HashMap::new(),
            cookies: Vec::new(),
            user_agent: None,
            viewport_width: None,
            viewport_height: None,
            timeout: None,
            script: None,
        }
    }
}

impl RenderOptions {
    /// Viewport for this call, falling back to `default` per dimension
    pub fn viewport_or(&self, default: Viewport) -> Viewport {
        Viewport {
            width: self.viewport_width.unwrap_or(default.width),
            height: self.viewport_height.unwrap_or(default.height),
        }
    }

    pub fn has_viewport_override(&self) -> bool {
        self.viewport_width.is_some() || self.viewport_height.is_some()
    }

    pub fn render_timeout_or(&self, config: &RendererConfig) -> Duration {
        self.timeout.unwrap_or(config.render_timeout)
    }

    /// Call-level user agent first, then the adapter default
    pub fn user_agent_or<'a>(&'a self, default: Option<&'a str>) -> Option<&'a str> {
        self.user_agent.as_deref().or(default)
    }
}

/// Outcome of one render attempt.
///
/// `error` is `Some` exactly when the attempt failed, in which case `html`
/// is empty and `url` is the requested URL.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RenderResult {
    pub html: String,
    /// Main navigation status; 0 when unknown or on failure
    pub status_code: u16,
    pub headers: HashMap<String, String>,
    /// Final URL after redirects
    pub url: String,
    /// Wall-clock time of the attempt; serialized as fractional seconds
    #[serde(serialize_with = "stats::serialize_secs")]
    pub time: Duration,
    #[serde(skip)]
    pub screenshot: Option<Vec<u8>>,
    /// Request log reported by the Splash service
    #[serde(skip_serializing_if = "Option::is_none")]
    pub har: Option<serde_json::Value>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
}

impl RenderResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub(crate) fn success(capture: PageCapture, time: Duration) -> Self {
        Self {
            html: capture.html,
            status_code: capture.status_code,
            headers: capture.headers,
            url: capture.url,
            time,
            screenshot: capture.screenshot,
            har: None,
            error: None,
            error_kind: None,
        }
    }

    pub(crate) fn failure(url: &str, time: Duration, message: String, kind: ErrorKind) -> Self {
        Self {
            html: String::new(),
            status_code: 0,
            headers: HashMap::new(),
            url: url.to_string(),
            time,
            screenshot: None,
            har: None,
            error: Some(message),
            error_kind: Some(kind),
        }
    }
}

/// What a backend captured from a page before it was released.
#[derive(Debug, Clone, Default)]
pub(crate) struct PageCapture {
    pub html: String,
    pub status_code: u16,
    pub headers: HashMap<String, String>,
    pub url: String,
    pub screenshot: Option<Vec<u8>>,
}

/// Turn a backend outcome into a result, recording stats exactly once.
pub(crate) fn conclude(
    stats: &RenderStats,
    started: Instant,
    backend: &str,
    url: &str,
    outcome: Result<PageCapture>,
) -> RenderResult {
    let outcome = outcome.and_then(|capture| {
        if capture.html.is_empty() {
            Err(Error::Navigation("engine returned an empty document".into()))
        } else {
            Ok(capture)
        }
    });

    match outcome {
        Ok(capture) => {
            let time = stats.record(started, true);
            debug!("Rendered {} in {:.2}s", url, time.as_secs_f64());
            RenderResult::success(capture, time)
        }
        Err(err) => {
            let time = stats.record(started, false);
            let message = err.render_message(backend, url);
            error!("{}", message);
            RenderResult::failure(url, time, message, err.kind())
        }
    }
}

/// Uniform contract over all rendering backends.
pub trait Renderer {
    /// Short backend name used in logs and error messages
    fn name(&self) -> &'static str;

    /// Render `url` and capture the resulting document.
    ///
    /// Never fails: backend errors are reported through `RenderResult::error`.
    fn render(&self, url: &str, options: &RenderOptions) -> RenderResult;

    /// Release the engine handle. Safe to call more than once.
    fn shutdown(&mut self);

    fn stats(&self) -> StatsSnapshot;
}

impl<R: Renderer + ?Sized> Renderer for Box<R> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn render(&self, url: &str, options: &RenderOptions) -> RenderResult {
        (**self).render(url, options)
    }

    fn shutdown(&mut self) {
        (**self).shutdown()
    }

    fn stats(&self) -> StatsSnapshot {
        (**self).stats()
    }
}
