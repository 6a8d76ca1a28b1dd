//! Backend selection from crawler settings.
//!
//! | key                   | meaning                                        | default          |
//! |-----------------------|------------------------------------------------|------------------|
//! | `DEFAULT_JS_RENDERER` | `splash`, `cdp`, `devtools` or `webdriver`     | `splash`         |
//! | `JS_RENDER_TIMEOUT`   | render timeout in seconds                      | 60               |
//! | `SPLASH_URL`          | Splash base URL                                | `localhost:8050` |
//! | `JS_RENDER_BROWSER`   | engine for `cdp` / `webdriver`                 | per backend      |
//! | `JS_RENDER_HEADLESS`  | run the browser headless                       | `true`           |
//! | `JS_RENDER_PROXY`     | proxy URL handed to the browser                | none             |
//! | `JS_RENDER_SCREENSHOT`| capture a PNG with every render                | `false`          |
//! | `WEBDRIVER_URL`       | running driver to connect to                   | per browser      |
//! | `WEBDRIVER_PATH`      | driver binary to spawn instead                 | none             |
//!
//! Driver-library names from other crawlers (`playwright`, `puppeteer`,
//! `selenium`) are accepted as aliases.

use crate::settings::Settings;
use crate::{Error, Renderer, RendererConfig, Result};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Splash,
    Cdp,
    Devtools,
    WebDriver,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Splash => "splash",
            BackendKind::Cdp => "cdp",
            BackendKind::Devtools => "devtools",
            BackendKind::WebDriver => "webdriver",
        }
    }

    /// Whether this build carries the backend
    pub fn is_enabled(&self) -> bool {
        match self {
            BackendKind::Splash => cfg!(feature = "splash"),
            BackendKind::Cdp => cfg!(feature = "cdp"),
            BackendKind::Devtools => cfg!(feature = "devtools"),
            BackendKind::WebDriver => cfg!(feature = "webdriver"),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "splash" => Ok(BackendKind::Splash),
            "cdp" | "playwright" => Ok(BackendKind::Cdp),
            "devtools" | "puppeteer" => Ok(BackendKind::Devtools),
            "webdriver" | "selenium" => Ok(BackendKind::WebDriver),
            other => Err(Error::Configuration(format!("Unknown JS renderer: {}", other))),
        }
    }
}

/// Shared timeouts, with `JS_RENDER_TIMEOUT` applied.
pub fn renderer_config(settings: &dyn Settings) -> Result<RendererConfig> {
    let defaults = RendererConfig::default();
    let secs = settings.get_f64("JS_RENDER_TIMEOUT", defaults.render_timeout.as_secs_f64());
    let render_timeout = Duration::try_from_secs_f64(secs)
        .map_err(|e| Error::Configuration(format!("Invalid JS_RENDER_TIMEOUT {}: {}", secs, e)))?;
    let config = RendererConfig {
        render_timeout,
        ..defaults
    };
    config.validate()?;
    Ok(config)
}

/// Build the renderer named by `DEFAULT_JS_RENDERER`.
///
/// This launches or pings the engine, so it fails for an unreachable
/// service, a missing browser, or a backend left out of this build.
pub fn from_settings(settings: &dyn Settings) -> Result<Box<dyn Renderer + Send>> {
    let kind: BackendKind = settings.get_str_or("DEFAULT_JS_RENDERER", "splash").parse()?;
    build(kind, settings)
}

/// Build a specific backend, reading its options from `settings`.
pub fn build(kind: BackendKind, settings: &dyn Settings) -> Result<Box<dyn Renderer + Send>> {
    if !kind.is_enabled() {
        return Err(Error::Configuration(format!(
            "renderer `{}` requires the `{}` cargo feature",
            kind, kind
        )));
    }
    let renderer = renderer_config(settings)?;
    match kind {
        BackendKind::Splash => splash(settings, renderer),
        BackendKind::Cdp => cdp(settings, renderer),
        BackendKind::Devtools => devtools(settings, renderer),
        BackendKind::WebDriver => webdriver(settings, renderer),
    }
}

#[cfg(feature = "splash")]
fn splash(settings: &dyn Settings, renderer: RendererConfig) -> Result<Box<dyn Renderer + Send>> {
    use crate::splash::{SplashConfig, SplashRenderer};

    let defaults = SplashConfig::default();
    let config = SplashConfig {
        splash_url: settings.get_str_or("SPLASH_URL", &defaults.splash_url),
        screenshot: settings.get_bool("JS_RENDER_SCREENSHOT", false),
        renderer,
        ..defaults
    };
    Ok(Box::new(SplashRenderer::new(config)?))
}

#[cfg(feature = "cdp")]
fn cdp(settings: &dyn Settings, renderer: RendererConfig) -> Result<Box<dyn Renderer + Send>> {
    use crate::cdp::CdpBackend;
    use crate::session::{SessionConfig, SessionRenderer};

    let config = SessionConfig {
        browser_type: settings.get_str_or("JS_RENDER_BROWSER", "chromium"),
        headless: settings.get_bool("JS_RENDER_HEADLESS", true),
        proxy: settings.get_str("JS_RENDER_PROXY"),
        screenshot: settings.get_bool("JS_RENDER_SCREENSHOT", false),
        renderer,
        ..Default::default()
    };
    Ok(Box::new(SessionRenderer::<CdpBackend>::new(config)?))
}

#[cfg(feature = "devtools")]
fn devtools(settings: &dyn Settings, renderer: RendererConfig) -> Result<Box<dyn Renderer + Send>> {
    use crate::devtools::{ChromiumBrowser, DevtoolsConfig, DevtoolsRenderer};

    let config = DevtoolsConfig {
        headless: settings.get_bool("JS_RENDER_HEADLESS", true),
        proxy: settings.get_str("JS_RENDER_PROXY"),
        screenshot: settings.get_bool("JS_RENDER_SCREENSHOT", false),
        renderer,
        ..Default::default()
    };
    Ok(Box::new(DevtoolsRenderer::<ChromiumBrowser>::new(config)?))
}

#[cfg(feature = "webdriver")]
fn webdriver(settings: &dyn Settings, renderer: RendererConfig) -> Result<Box<dyn Renderer + Send>> {
    use crate::webdriver::{WebDriverConfig, WebDriverRenderer};

    let config = WebDriverConfig {
        browser_type: settings.get_str_or("JS_RENDER_BROWSER", "chrome"),
        headless: settings.get_bool("JS_RENDER_HEADLESS", true),
        proxy: settings.get_str("JS_RENDER_PROXY"),
        driver_url: settings.get_str("WEBDRIVER_URL"),
        driver_path: settings.get_str("WEBDRIVER_PATH").map(Into::into),
        screenshot: settings.get_bool("JS_RENDER_SCREENSHOT", false),
        renderer,
        ..Default::default()
    };
    Ok(Box::new(WebDriverRenderer::new(config)?))
}

#[cfg(not(feature = "splash"))]
fn splash(_: &dyn Settings, _: RendererConfig) -> Result<Box<dyn Renderer + Send>> {
    Err(Error::Configuration("splash support is not compiled in".into()))
}

#[cfg(not(feature = "cdp"))]
fn cdp(_: &dyn Settings, _: RendererConfig) -> Result<Box<dyn Renderer + Send>> {
    Err(Error::Configuration("cdp support is not compiled in".into()))
}

#[cfg(not(feature = "devtools"))]
fn devtools(_: &dyn Settings, _: RendererConfig) -> Result<Box<dyn Renderer + Send>> {
    Err(Error::Configuration("devtools support is not compiled in".into()))
}

#[cfg(not(feature = "webdriver"))]
fn webdriver(_: &dyn Settings, _: RendererConfig) -> Result<Box<dyn Renderer + Send>> {
    Err(Error::Configuration("webdriver support is not compiled in".into()))
}
