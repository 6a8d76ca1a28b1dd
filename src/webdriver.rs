//! Rendering through the W3C WebDriver protocol.
//!
//! Talks HTTP to chromedriver, geckodriver or msedgedriver. The driver is
//! either already running (`driver_url`) or spawned by the renderer from
//! `driver_path`. There is a single long-lived browser session; per-call
//! overrides (window size, user agent, headers, page-load timeout, cookies)
//! are applied before the load and reverted after it on every path.

use crate::{
    conclude, CookieParam, Error, PageCapture, RenderOptions, RenderResult, RenderStats, Renderer,
    RendererConfig, Result, StatsSnapshot, Viewport, WaitUntil,
};
use base64::Engine as Base64Engine;
use log::{debug, error, info, warn};
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::Method;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::str::FromStr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const BACKEND: &str = "WebDriver";

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Extra delay after `complete` standing in for network idle
const NETWORK_SETTLE: Duration = Duration::from_secs(1);

/// Browser families with a WebDriver implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverBrowser {
    Chrome,
    Firefox,
    Edge,
}

impl DriverBrowser {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverBrowser::Chrome => "chrome",
            DriverBrowser::Firefox => "firefox",
            DriverBrowser::Edge => "edge",
        }
    }

    /// Port the stock driver binary listens on
    pub fn default_port(&self) -> u16 {
        match self {
            DriverBrowser::Chrome | DriverBrowser::Edge => 9515,
            DriverBrowser::Firefox => 4444,
        }
    }

    pub fn default_driver_url(&self) -> String {
        format!("http://localhost:{}", self.default_port())
    }

    /// Vendor prefix of the driver's CDP passthrough endpoint
    fn cdp_vendor(&self) -> Option<&'static str> {
        match self {
            DriverBrowser::Chrome => Some("goog"),
            DriverBrowser::Edge => Some("ms"),
            DriverBrowser::Firefox => None,
        }
    }

    /// `alwaysMatch` capabilities for a new session
    pub fn capabilities(&self, config: &WebDriverConfig) -> Value {
        let binary = config
            .browser_binary
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned());

        match self {
            DriverBrowser::Chrome | DriverBrowser::Edge => {
                let (name, key) = match self {
                    DriverBrowser::Chrome => ("chrome", "goog:chromeOptions"),
                    _ => ("MicrosoftEdge", "ms:edgeOptions"),
                };
                let mut options = Map::new();
                options.insert("args".into(), json!(chromium_args(*self, config)));
                if let Some(binary) = binary {
                    options.insert("binary".into(), json!(binary));
                }
                json!({ "browserName": name, key: options })
            }
            DriverBrowser::Firefox => {
                let mut args = Vec::new();
                if config.headless {
                    args.push("-headless".to_string());
                }
                if let Some(dir) = &config.user_data_dir {
                    args.push("-profile".to_string());
                    args.push(dir.to_string_lossy().into_owned());
                }
                args.extend(config.browser_arguments.iter().cloned());

                let mut prefs = Map::new();
                if let Some(ua) = &config.user_agent {
                    prefs.insert("general.useragent.override".into(), json!(ua));
                }
                if let Some(proxy) = &config.proxy {
                    prefs.extend(firefox_proxy_prefs(proxy));
                }

                let mut options = Map::new();
                options.insert("args".into(), json!(args));
                options.insert("prefs".into(), Value::Object(prefs));
                if let Some(binary) = binary {
                    options.insert("binary".into(), json!(binary));
                }
                json!({ "browserName": "firefox", "moz:firefoxOptions": options })
            }
        }
    }
}

impl fmt::Display for DriverBrowser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DriverBrowser {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "chrome" => Ok(DriverBrowser::Chrome),
            "firefox" => Ok(DriverBrowser::Firefox),
            "edge" => Ok(DriverBrowser::Edge),
            other => Err(Error::Configuration(format!("Unsupported browser type: {}", other))),
        }
    }
}

fn chromium_args(browser: DriverBrowser, config: &WebDriverConfig) -> Vec<String> {
    let mut args = Vec::new();
    if config.headless {
        args.push(match browser {
            DriverBrowser::Chrome => "--headless=new".to_string(),
            _ => "--headless".to_string(),
        });
    }
    args.push(format!(
        "--window-size={},{}",
        config.window.width, config.window.height
    ));
    args.push("--no-sandbox".to_string());
    args.push("--disable-dev-shm-usage".to_string());
    if browser == DriverBrowser::Chrome {
        args.push("--disable-gpu".to_string());
    }
    if let Some(ua) = &config.user_agent {
        args.push(format!("--user-agent={}", ua));
    }
    if let Some(proxy) = &config.proxy {
        args.push(format!("--proxy-server={}", proxy));
    }
    if let Some(dir) = &config.user_data_dir {
        args.push(format!("--user-data-dir={}", dir.display()));
    }
    args.extend(config.browser_arguments.iter().cloned());
    args
}

/// Firefox has no proxy flag; split the proxy URL into manual-proxy prefs.
fn firefox_proxy_prefs(proxy: &str) -> Map<String, Value> {
    let mut prefs = Map::new();
    let parsed = match url::Url::parse(proxy) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!("Ignoring unparseable proxy {}: {}", proxy, e);
            return prefs;
        }
    };
    let Some(host) = parsed.host_str() else {
        warn!("Ignoring proxy without host: {}", proxy);
        return prefs;
    };

    let scheme = parsed.scheme();
    let kinds: &[&str] = match scheme {
        "http" => &["http", "ssl"],
        "https" => &["ssl"],
        s if s.starts_with("socks") => &["socks"],
        other => {
            warn!("Unsupported proxy scheme for firefox: {}", other);
            return prefs;
        }
    };

    prefs.insert("network.proxy.type".into(), json!(1));
    for kind in kinds {
        prefs.insert(format!("network.proxy.{}", kind), json!(host));
        if let Some(port) = parsed.port_or_known_default() {
            prefs.insert(format!("network.proxy.{}_port", kind), json!(port));
        }
    }
    match scheme {
        "socks4" => {
            prefs.insert("network.proxy.socks_version".into(), json!(4));
        }
        "socks" | "socks5" | "socks5h" => {
            prefs.insert("network.proxy.socks_version".into(), json!(5));
        }
        _ => {}
    }
    prefs
}

fn webdriver_cookie(cookie: &CookieParam) -> Value {
    let mut c = json!({ "name": cookie.name, "value": cookie.value });
    if let Some(path) = &cookie.path {
        c["path"] = json!(path);
    }
    if let Some(domain) = &cookie.domain {
        c["domain"] = json!(domain);
    }
    if let Some(secure) = cookie.secure {
        c["secure"] = json!(secure);
    }
    if let Some(http_only) = cookie.http_only {
        c["httpOnly"] = json!(http_only);
    }
    if let Some(expiry) = cookie.expires {
        c["expiry"] = json!(expiry);
    }
    if let Some(same_site) = &cookie.same_site {
        let normalized = match same_site.to_ascii_lowercase().as_str() {
            "strict" => Some("Strict"),
            "lax" => Some("Lax"),
            "none" => Some("None"),
            _ => None,
        };
        if let Some(s) = normalized {
            c["sameSite"] = json!(s);
        }
    }
    c
}

/// Configuration for [`WebDriverRenderer`]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebDriverConfig {
    /// `chrome`, `firefox` or `edge`; checked before anything is spawned
    pub browser_type: String,
    pub headless: bool,
    pub renderer: RendererConfig,
    pub proxy: Option<String>,
    pub user_data_dir: Option<PathBuf>,
    pub screenshot: bool,
    pub window: Viewport,
    pub browser_binary: Option<PathBuf>,
    /// Driver binary to spawn; when unset `driver_url` must point at a running driver
    pub driver_path: Option<PathBuf>,
    /// Port for a spawned driver, defaults to the browser's stock port
    pub driver_port: Option<u16>,
    pub driver_url: Option<String>,
    pub user_agent: Option<String>,
    pub browser_arguments: Vec<String>,
}

impl Default for WebDriverConfig {
    fn default() -> Self {
        Self {
            browser_type: "chrome".to_string(),
            headless: true,
            renderer: RendererConfig::default(),
            proxy: None,
            user_data_dir: None,
            screenshot: false,
            window: Viewport::default(),
            browser_binary: None,
            driver_path: None,
            driver_port: None,
            driver_url: None,
            user_agent: None,
            browser_arguments: Vec::new(),
        }
    }
}

/// A failed driver request, before it is mapped into [`Error`]
#[derive(Debug)]
enum Failure {
    Transport(reqwest::Error),
    /// W3C error payload: `{"value": {"error", "message"}}`
    Protocol { status: u16, code: String, message: String },
}

impl Failure {
    fn is_code(&self, expected: &str) -> bool {
        matches!(self, Failure::Protocol { code, .. } if code == expected)
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Transport(e) => write!(f, "{}", e),
            Failure::Protocol { status, code, message } => {
                write!(f, "{} (HTTP {}): {}", code, status, message)
            }
        }
    }
}

impl From<Failure> for Error {
    fn from(failure: Failure) -> Self {
        match failure {
            Failure::Transport(e) if e.is_timeout() => Error::Timeout(e.to_string()),
            Failure::Transport(e) => Error::Transport(e.to_string()),
            f @ Failure::Protocol { .. } if f.is_code("timeout") || f.is_code("script timeout") => {
                Error::Timeout(f.to_string())
            }
            f => Error::Navigation(f.to_string()),
        }
    }
}

fn send(request: RequestBuilder) -> std::result::Result<Value, Failure> {
    let response = request.send().map_err(Failure::Transport)?;
    let status = response.status();
    let body: Value = response.json().unwrap_or(Value::Null);
    let value = body.get("value").cloned().unwrap_or(Value::Null);
    if status.is_success() {
        return Ok(value);
    }
    Err(Failure::Protocol {
        status: status.as_u16(),
        code: value["error"].as_str().unwrap_or("unknown error").to_string(),
        message: value["message"].as_str().unwrap_or_default().to_string(),
    })
}

/// One WebDriver session on one driver
struct Session {
    http: Client,
    base: String,
    id: String,
    /// Added to per-call bounds so the driver reports its own timeouts first
    slack: Duration,
}

impl Session {
    fn create(http: Client, base: &str, capabilities: Value, slack: Duration) -> std::result::Result<Self, Failure> {
        let body = json!({ "capabilities": { "alwaysMatch": capabilities } });
        let value = send(http.post(format!("{}/session", base)).json(&body))?;
        let id = value["sessionId"].as_str().unwrap_or_default().to_string();
        if id.is_empty() {
            return Err(Failure::Protocol {
                status: 200,
                code: "session not created".into(),
                message: "driver response carried no sessionId".into(),
            });
        }
        Ok(Self {
            http,
            base: base.to_string(),
            id,
            slack,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/session/{}{}", self.base, self.id, path)
    }

    fn call(&self, method: Method, path: &str, body: Option<Value>) -> std::result::Result<Value, Failure> {
        let mut request = self.http.request(method.clone(), self.endpoint(path));
        if let Some(body) = body {
            request = request.json(&body);
        } else if method == Method::POST {
            request = request.json(&json!({}));
        }
        send(request)
    }

    fn set_page_load_timeout(&self, timeout: Duration) -> Result<()> {
        let body = json!({ "pageLoad": timeout.as_millis() as u64, "script": timeout.as_millis() as u64 });
        self.call(Method::POST, "/timeouts", Some(body))?;
        Ok(())
    }

    fn set_window_size(&self, viewport: Viewport) -> Result<()> {
        let body = json!({ "width": viewport.width, "height": viewport.height });
        self.call(Method::POST, "/window/rect", Some(body))?;
        Ok(())
    }

    fn navigate(&self, url: &str, timeout: Duration) -> Result<()> {
        let request = self
            .http
            .post(self.endpoint("/url"))
            .timeout(timeout + self.slack)
            .json(&json!({ "url": url }));
        send(request)?;
        Ok(())
    }

    fn execute(&self, script: &str) -> Result<Value> {
        let body = json!({ "script": script, "args": [] });
        Ok(self.call(Method::POST, "/execute/sync", Some(body))?)
    }

    /// `Ok(false)` while the selector has no match.
    fn has_element(&self, selector: &str) -> Result<bool> {
        let body = json!({ "using": "css selector", "value": selector });
        match self.call(Method::POST, "/element", Some(body)) {
            Ok(_) => Ok(true),
            Err(f) if f.is_code("no such element") => Ok(false),
            Err(f) => Err(f.into()),
        }
    }

    fn source(&self) -> Result<String> {
        let value = self.call(Method::GET, "/source", None)?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    fn current_url(&self) -> Result<String> {
        let value = self.call(Method::GET, "/url", None)?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    fn screenshot(&self) -> Result<Vec<u8>> {
        let value = self.call(Method::GET, "/screenshot", None)?;
        base64::engine::general_purpose::STANDARD
            .decode(value.as_str().unwrap_or_default())
            .map_err(|e| Error::Navigation(format!("Undecodable screenshot: {}", e)))
    }

    fn add_cookie(&self, cookie: &CookieParam) -> Result<()> {
        self.call(Method::POST, "/cookie", Some(json!({ "cookie": webdriver_cookie(cookie) })))?;
        Ok(())
    }

    fn delete_cookie(&self, name: &str) -> Result<()> {
        let name: String = url::form_urlencoded::byte_serialize(name.as_bytes()).collect();
        self.call(Method::DELETE, &format!("/cookie/{}", name), None)?;
        Ok(())
    }

    /// Chromium-family DevTools passthrough
    fn cdp(&self, vendor: &str, cmd: &str, params: Value) -> Result<Value> {
        let body = json!({ "cmd": cmd, "params": params });
        Ok(self.call(Method::POST, &format!("/{}/cdp/execute", vendor), Some(body))?)
    }

    fn delete(&self) -> Result<()> {
        send(self.http.delete(self.endpoint("")))?;
        Ok(())
    }

    fn close_window(&self) -> Result<()> {
        self.call(Method::DELETE, "/window", None)?;
        Ok(())
    }
}

/// A driver binary started by the renderer
struct DriverProcess {
    child: Child,
}

impl DriverProcess {
    fn spawn(path: &Path, port: u16) -> Result<Self> {
        let child = Command::new(path)
            .arg(format!("--port={}", port))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                Error::Configuration(format!("Failed to start driver {}: {}", path.display(), e))
            })?;
        debug!("Started driver {} on port {}", path.display(), port);
        Ok(Self { child })
    }

    fn kill(mut self) {
        if let Err(e) = self.child.kill() {
            warn!("Failed to stop driver process: {}", e);
        }
        if let Err(e) = self.child.wait() {
            warn!("Failed to reap driver process: {}", e);
        }
    }
}

/// Poll `GET /status` until the driver reports ready.
fn wait_for_driver(http: &Client, base: &str, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Ok(value) = send(http.get(format!("{}/status", base))) {
            if value["ready"].as_bool().unwrap_or(true) {
                return Ok(());
            }
        }
        if Instant::now() >= deadline {
            return Err(Error::Configuration(format!(
                "WebDriver at {} not ready after {:?}",
                base, timeout
            )));
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// A cookie added for one call, with the document it was added on
#[derive(Debug)]
struct PlacedCookie {
    name: String,
    page_url: String,
    domain: Option<String>,
    path: Option<String>,
}

impl PlacedCookie {
    /// A document on the cookie's own host and path
    fn home(&self) -> Option<String> {
        let page = url::Url::parse(&self.page_url).ok()?;
        let home = page.join(self.path.as_deref().unwrap_or("/")).ok()?;
        Some(home.into())
    }
}

/// What a render call changed on the shared session
#[derive(Debug, Default)]
struct Overrides {
    window: bool,
    page_load_timeout: bool,
    /// User agent in effect before the override
    user_agent: Option<String>,
    headers: bool,
    cookies: Vec<PlacedCookie>,
}

fn host_of(url: &str) -> Option<String> {
    url::Url::parse(url).ok()?.host_str().map(str::to_ascii_lowercase)
}

/// Renderer over a single long-lived WebDriver session
pub struct WebDriverRenderer {
    browser: DriverBrowser,
    config: WebDriverConfig,
    session: Option<Session>,
    driver: Option<DriverProcess>,
    /// The session is shared state; renders run one at a time
    render_lock: Mutex<()>,
    stats: RenderStats,
}

impl WebDriverRenderer {
    pub fn new(config: WebDriverConfig) -> Result<Self> {
        config.renderer.validate()?;
        let browser: DriverBrowser = config.browser_type.parse()?;

        let slack = config.renderer.timeout;
        let http = Client::builder()
            .connect_timeout(config.renderer.timeout)
            .timeout(config.renderer.render_timeout + slack)
            .build()
            .map_err(|e| Error::Configuration(format!("Failed to build HTTP client: {}", e)))?;

        let (base, driver) = match &config.driver_path {
            Some(path) => {
                let port = config.driver_port.unwrap_or_else(|| browser.default_port());
                let driver = DriverProcess::spawn(path, port)?;
                let base = format!("http://127.0.0.1:{}", port);
                if let Err(e) = wait_for_driver(&http, &base, config.renderer.timeout) {
                    driver.kill();
                    return Err(e);
                }
                (base, Some(driver))
            }
            None => {
                let base = config
                    .driver_url
                    .clone()
                    .unwrap_or_else(|| browser.default_driver_url());
                (base.trim_end_matches('/').to_string(), None)
            }
        };

        let session = match Session::create(http, &base, browser.capabilities(&config), slack) {
            Ok(session) => session,
            Err(e) => {
                error!("Failed to create {} WebDriver session: {}", browser, e);
                if let Some(driver) = driver {
                    driver.kill();
                }
                return Err(Error::Configuration(format!(
                    "Failed to create {} WebDriver session: {}",
                    browser, e
                )));
            }
        };

        let mut renderer = Self {
            browser,
            config,
            session: Some(session),
            driver,
            render_lock: Mutex::new(()),
            stats: RenderStats::new(),
        };
        if let Err(e) = renderer.prepare_session() {
            renderer.shutdown();
            return Err(Error::Configuration(format!(
                "Failed to configure {} WebDriver session: {}",
                browser, e
            )));
        }
        info!("Created {} WebDriver session", browser);
        Ok(renderer)
    }

    pub fn browser(&self) -> DriverBrowser {
        self.browser
    }

    fn prepare_session(&self) -> Result<()> {
        let Some(session) = &self.session else {
            return Ok(());
        };
        session.set_page_load_timeout(self.config.renderer.render_timeout)?;
        // Chromium takes its window size from launch flags
        if self.browser == DriverBrowser::Firefox {
            session.set_window_size(self.config.window)?;
        }
        Ok(())
    }

    fn render_with_overrides(&self, session: &Session, url: &str, options: &RenderOptions) -> Result<PageCapture> {
        let mut applied = Overrides::default();
        let outcome = self
            .apply_overrides(session, options, &mut applied)
            .and_then(|()| self.load(session, url, options, &mut applied));
        self.revert(session, applied);
        outcome
    }

    fn apply_overrides(&self, session: &Session, options: &RenderOptions, applied: &mut Overrides) -> Result<()> {
        if options.has_viewport_override() {
            session.set_window_size(options.viewport_or(self.config.window))?;
            applied.window = true;
        }

        if let Some(timeout) = options.timeout {
            session.set_page_load_timeout(timeout)?;
            applied.page_load_timeout = true;
        }

        let Some(vendor) = self.browser.cdp_vendor() else {
            if options.user_agent.is_some() || !options.headers.is_empty() {
                warn!(
                    "{} driver cannot override user agent or headers per call; ignoring",
                    self.browser
                );
            }
            return Ok(());
        };

        if let Some(ua) = &options.user_agent {
            let current = session.execute("return navigator.userAgent")?;
            let current = current.as_str().unwrap_or_default().to_string();
            session.cdp(vendor, "Network.setUserAgentOverride", json!({ "userAgent": ua }))?;
            applied.user_agent = Some(current);
        }

        if !options.headers.is_empty() {
            session.cdp(vendor, "Network.enable", json!({}))?;
            session.cdp(
                vendor,
                "Network.setExtraHTTPHeaders",
                json!({ "headers": options.headers }),
            )?;
            applied.headers = true;
        }
        Ok(())
    }

    fn load(&self, session: &Session, url: &str, options: &RenderOptions, applied: &mut Overrides) -> Result<PageCapture> {
        let timeout = options.render_timeout_or(&self.config.renderer);

        if !options.cookies.is_empty() {
            // Cookies can only be added for the current document's domain
            session.navigate(url, timeout)?;
            let page_url = session.current_url().unwrap_or_else(|_| url.to_string());
            for cookie in &options.cookies {
                session.add_cookie(cookie)?;
                applied.cookies.push(PlacedCookie {
                    name: cookie.name.clone(),
                    page_url: page_url.clone(),
                    domain: cookie.domain.clone(),
                    path: cookie.path.clone(),
                });
            }
        }

        debug!("Loading URL: {}", url);
        session.navigate(url, timeout)?;
        self.wait_for_ready_state(session, options.wait_until, timeout)?;

        if let Some(wait) = options.wait_time.filter(|d| !d.is_zero()) {
            std::thread::sleep(wait);
        }

        if let Some(selector) = &options.wait_for_selector {
            self.wait_for_selector(session, selector, timeout)?;
        }

        if let Some(script) = &options.script {
            session.execute(script)?;
        }

        let html = session.source()?;
        let final_url = session.current_url()?;
        let screenshot = if self.config.screenshot {
            Some(session.screenshot()?)
        } else {
            None
        };

        Ok(PageCapture {
            html,
            // WebDriver exposes no response status; a completed load is reported as 200
            status_code: 200,
            headers: HashMap::new(),
            url: final_url,
            screenshot,
        })
    }

    fn wait_for_ready_state(&self, session: &Session, wait_until: WaitUntil, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let state = session.execute("return document.readyState")?;
            let state = state.as_str().unwrap_or_default();
            let ready = match wait_until {
                WaitUntil::DomContentLoaded => state != "loading",
                WaitUntil::Load | WaitUntil::NetworkIdle => state == "complete",
            };
            if ready {
                break;
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout(format!(
                    "document.readyState still {:?} after {} ms",
                    state,
                    timeout.as_millis()
                )));
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        if wait_until == WaitUntil::NetworkIdle {
            std::thread::sleep(NETWORK_SETTLE);
        }
        Ok(())
    }

    fn wait_for_selector(&self, session: &Session, selector: &str, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if session.has_element(selector)? {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout(format!(
                    "waiting for selector `{}` failed: timeout {} ms exceeded",
                    selector,
                    timeout.as_millis()
                )));
            }
            std::thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }

    /// Delete per-call cookies on the site they were added for, wherever
    /// the page ended up after redirects.
    fn remove_cookies(&self, session: &Session, cookies: &[PlacedCookie]) {
        if let Some(vendor) = self.browser.cdp_vendor() {
            for cookie in cookies {
                let mut params = json!({ "name": cookie.name, "url": cookie.page_url });
                if let Some(domain) = &cookie.domain {
                    params["domain"] = domain.as_str().into();
                }
                if let Err(e) = session.cdp(vendor, "Network.deleteCookies", params) {
                    warn!("Failed to remove cookie {}: {}", cookie.name, e);
                }
            }
            return;
        }

        // Plain WebDriver only reaches cookies of the current document
        let mut here = session.current_url().ok().as_deref().and_then(host_of);
        for cookie in cookies {
            let target = host_of(&cookie.page_url);
            if here != target {
                let Some(home) = cookie.home() else {
                    warn!("Cannot locate cookie {} set on {}", cookie.name, cookie.page_url);
                    continue;
                };
                if let Err(e) = session.navigate(&home, self.config.renderer.render_timeout) {
                    warn!("Failed to return to {} to remove cookies: {}", home, e);
                    continue;
                }
                here = session.current_url().ok().as_deref().and_then(host_of);
            }
            if let Err(e) = session.delete_cookie(&cookie.name) {
                warn!("Failed to remove cookie {}: {}", cookie.name, e);
            }
        }
    }

    /// Undo everything `apply_overrides` and `load` changed. Failures are
    /// logged and do not affect the render result.
    fn revert(&self, session: &Session, applied: Overrides) {
        if !applied.cookies.is_empty() {
            self.remove_cookies(session, &applied.cookies);
        }
        if let Some(vendor) = self.browser.cdp_vendor() {
            if let Some(ua) = applied.user_agent {
                if let Err(e) = session.cdp(vendor, "Network.setUserAgentOverride", json!({ "userAgent": ua })) {
                    warn!("Failed to restore user agent: {}", e);
                }
            }
            if applied.headers {
                if let Err(e) = session.cdp(vendor, "Network.setExtraHTTPHeaders", json!({ "headers": {} })) {
                    warn!("Failed to clear extra headers: {}", e);
                }
            }
        }
        if applied.page_load_timeout {
            if let Err(e) = session.set_page_load_timeout(self.config.renderer.render_timeout) {
                warn!("Failed to restore page load timeout: {}", e);
            }
        }
        if applied.window {
            if let Err(e) = session.set_window_size(self.config.window) {
                warn!("Failed to restore window size: {}", e);
            }
        }
    }
}

impl Renderer for WebDriverRenderer {
    fn name(&self) -> &'static str {
        BACKEND
    }

    fn render(&self, url: &str, options: &RenderOptions) -> RenderResult {
        let started = Instant::now();
        let _guard = self.render_lock.lock().unwrap_or_else(|e| e.into_inner());
        let outcome = match &self.session {
            Some(session) => self.render_with_overrides(session, url, options),
            None => Err(Error::Configuration("renderer has been shut down".into())),
        };
        conclude(&self.stats, started, BACKEND, url, outcome)
    }

    fn shutdown(&mut self) {
        let session = self.session.take();
        let driver = self.driver.take();
        if session.is_none() && driver.is_none() {
            return;
        }
        info!(
            "Shutting down {} WebDriver renderer. Stats: {}",
            self.browser,
            self.stats.snapshot()
        );
        if let Some(session) = session {
            if let Err(e) = session.delete() {
                error!("Error shutting down WebDriver: {}", e);
                if let Err(e) = session.close_window() {
                    debug!("Forced window close failed: {}", e);
                }
            }
        }
        if let Some(driver) = driver {
            driver.kill();
        }
    }

    fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

impl Drop for WebDriverRenderer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
