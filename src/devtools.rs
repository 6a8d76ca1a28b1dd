//! Async single-engine renderer that drives its own event loop.
//!
//! The browser driver is async ([`DevtoolsBrowser`] / [`DevtoolsPage`]) but
//! [`Renderer::render`] is blocking, so every call is driven to completion on
//! an [`EventLoop`]. The loop is either created and owned by the renderer or
//! borrowed from a tokio runtime that is already running; only an owned loop
//! is shut down with the renderer.
//!
//! With the `devtools` feature, [`ChromiumBrowser`] drives Chrome through
//! `chromiumoxide`.

use crate::session::NavigationResponse;
use crate::{
    conclude, CookieParam, Error, PageCapture, RenderOptions, RenderResult, RenderStats, Renderer,
    RendererConfig, Result, StatsSnapshot, Viewport, WaitUntil,
};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use serde::Deserialize;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::runtime::{Handle, Runtime, RuntimeFlavor};

/// Grace period for an owned runtime's remaining tasks
const RUNTIME_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Page-readiness events understood by the devtools driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitCondition {
    Load,
    DomContentLoaded,
    /// No network connections for at least 500 ms
    NetworkIdle0,
}

impl WaitCondition {
    pub fn for_wait_until(wait_until: WaitUntil) -> Vec<WaitCondition> {
        match wait_until {
            WaitUntil::Load => vec![WaitCondition::Load],
            WaitUntil::DomContentLoaded => vec![WaitCondition::DomContentLoaded],
            WaitUntil::NetworkIdle => vec![WaitCondition::NetworkIdle0],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WaitCondition::Load => "load",
            WaitCondition::DomContentLoaded => "domcontentloaded",
            WaitCondition::NetworkIdle0 => "networkidle0",
        }
    }
}

/// Where async render work is executed
pub enum EventLoop {
    /// Runtime created by and shut down with the renderer
    Owned(Runtime),
    /// Runtime owned by the caller; left running on shutdown
    Borrowed(Handle),
}

impl EventLoop {
    pub fn owned() -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("crawlrender-devtools")
            .build()
            .map_err(|e| Error::Configuration(format!("Failed to create event loop: {}", e)))?;
        Ok(EventLoop::Owned(runtime))
    }

    /// Render calls block the calling worker via `block_in_place`, which a
    /// current-thread runtime cannot do.
    pub fn borrowed(handle: Handle) -> Result<Self> {
        if handle.runtime_flavor() == RuntimeFlavor::CurrentThread {
            return Err(Error::Configuration(
                "a borrowed event loop must be a multi-threaded tokio runtime".into(),
            ));
        }
        Ok(EventLoop::Borrowed(handle))
    }

    /// Borrow the running runtime if there is one, otherwise create one.
    pub fn current_or_owned() -> Result<Self> {
        match Handle::try_current() {
            Ok(handle) => Self::borrowed(handle),
            Err(_) => Self::owned(),
        }
    }

    pub fn is_owned(&self) -> bool {
        matches!(self, EventLoop::Owned(_))
    }

    /// Whether [`block_on`](Self::block_on) may be called from this thread.
    ///
    /// Blocking is impossible from inside a current-thread runtime.
    pub fn can_block(&self) -> bool {
        match Handle::try_current() {
            Ok(current) => current.runtime_flavor() != RuntimeFlavor::CurrentThread,
            Err(_) => true,
        }
    }

    /// Drive `future` to completion from synchronous code.
    ///
    /// Panics when [`can_block`](Self::can_block) is false.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        match self {
            EventLoop::Owned(runtime) if Handle::try_current().is_ok() => {
                tokio::task::block_in_place(|| runtime.block_on(future))
            }
            EventLoop::Owned(runtime) => runtime.block_on(future),
            EventLoop::Borrowed(handle) => tokio::task::block_in_place(|| handle.block_on(future)),
        }
    }

    /// Close an owned runtime. Borrowed runtimes are never touched.
    fn close(self) {
        match self {
            EventLoop::Owned(runtime) => {
                if Handle::try_current().is_ok() {
                    runtime.shutdown_background();
                } else {
                    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_GRACE);
                }
            }
            EventLoop::Borrowed(_) => debug!("Leaving borrowed event loop running"),
        }
    }
}

/// An async browser handle. One instance per renderer.
#[async_trait]
pub trait DevtoolsBrowser: Send + Sync + Sized {
    type Page: DevtoolsPage;

    /// Label used in error messages
    const NAME: &'static str;

    async fn launch(config: &DevtoolsConfig) -> Result<Self>;

    async fn new_page(&self) -> Result<Self::Page>;

    async fn close(&mut self) -> Result<()>;
}

/// A page opened for a single render
#[async_trait]
pub trait DevtoolsPage: Send + Sync + Sized {
    async fn set_viewport(&self, viewport: Viewport) -> Result<()>;

    async fn set_user_agent(&self, user_agent: &str) -> Result<()>;

    async fn set_extra_headers(&self, headers: &HashMap<String, String>) -> Result<()>;

    /// Cookies without a url or domain are scoped to `url`.
    async fn set_cookies(&self, cookies: &[CookieParam], url: &str) -> Result<()>;

    /// Navigate and wait for every condition in `wait`. Unbounded; the
    /// renderer applies the timeout.
    async fn goto(&self, url: &str, wait: &[WaitCondition]) -> Result<Option<NavigationResponse>>;

    /// Resolve once `selector` matches. Unbounded; the renderer applies the
    /// timeout.
    async fn wait_for_selector(&self, selector: &str) -> Result<()>;

    async fn evaluate(&self, script: &str) -> Result<serde_json::Value>;

    async fn content(&self) -> Result<String>;

    async fn url(&self) -> Result<String>;

    async fn screenshot(&self) -> Result<Vec<u8>>;

    async fn close(self) -> Result<()>;
}

/// Configuration for [`DevtoolsRenderer`]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DevtoolsConfig {
    pub headless: bool,
    pub renderer: RendererConfig,
    pub proxy: Option<String>,
    pub user_data_dir: Option<PathBuf>,
    pub screenshot: bool,
    pub window: Viewport,
    /// Extra launch flags, appended after the defaults
    pub browser_args: Vec<String>,
    pub executable_path: Option<PathBuf>,
    pub user_agent: Option<String>,
    pub ignore_https_errors: bool,
}

impl Default for DevtoolsConfig {
    fn default() -> Self {
        Self {
            headless: true,
            renderer: RendererConfig::default(),
            proxy: None,
            user_data_dir: None,
            screenshot: false,
            window: Viewport::default(),
            browser_args: Vec::new(),
            executable_path: None,
            user_agent: None,
            ignore_https_errors: true,
        }
    }
}

impl DevtoolsConfig {
    /// Upper bound for a single protocol command.
    ///
    /// Navigation is one command, so this must not be shorter than
    /// `render_timeout`; the renderer applies the per-call bound itself.
    pub fn command_timeout(&self) -> Duration {
        self.renderer.timeout.max(self.renderer.render_timeout)
    }

    /// Command-line flags passed to the browser
    pub fn launch_args(&self) -> Vec<String> {
        let mut args = vec![
            "--no-sandbox".to_string(),
            "--disable-dev-shm-usage".to_string(),
        ];
        if self.ignore_https_errors {
            args.push("--ignore-certificate-errors".to_string());
        }
        if let Some(proxy) = &self.proxy {
            args.push(format!("--proxy-server={}", proxy));
        }
        args.extend(self.browser_args.iter().cloned());
        args
    }
}

/// Renderer over an async browser, blocking on its [`EventLoop`]
pub struct DevtoolsRenderer<B: DevtoolsBrowser> {
    browser: Option<B>,
    event_loop: Option<EventLoop>,
    config: DevtoolsConfig,
    stats: RenderStats,
}

impl<B: DevtoolsBrowser> DevtoolsRenderer<B> {
    /// Launch on the running runtime if there is one, otherwise on a new
    /// owned runtime.
    pub fn new(config: DevtoolsConfig) -> Result<Self> {
        Self::with_event_loop(config, EventLoop::current_or_owned()?)
    }

    pub fn with_event_loop(config: DevtoolsConfig, event_loop: EventLoop) -> Result<Self> {
        config.renderer.validate()?;
        if !event_loop.can_block() {
            event_loop.close();
            return Err(Error::Configuration(
                "cannot drive the browser from inside a current-thread runtime".into(),
            ));
        }

        let launch_timeout = config.renderer.timeout;
        let launched = event_loop.block_on(async {
            tokio::time::timeout(launch_timeout, B::launch(&config)).await
        });
        let browser = match launched {
            Ok(Ok(browser)) => browser,
            Ok(Err(e)) => {
                error!("Failed to launch browser: {}", e);
                event_loop.close();
                return Err(e);
            }
            Err(_) => {
                event_loop.close();
                return Err(Error::Configuration(format!(
                    "Browser launch timed out after {:?}",
                    launch_timeout
                )));
            }
        };
        info!("Launched {} browser", B::NAME);

        Ok(Self {
            browser: Some(browser),
            event_loop: Some(event_loop),
            config,
            stats: RenderStats::new(),
        })
    }

    pub fn owns_event_loop(&self) -> bool {
        self.event_loop.as_ref().is_some_and(EventLoop::is_owned)
    }

    async fn render_async(&self, browser: &B, url: &str, options: &RenderOptions) -> Result<PageCapture> {
        let page = browser.new_page().await?;
        let outcome = self.drive(&page, url, options).await;
        if let Err(e) = page.close().await {
            warn!("Error closing page: {}", e);
        }
        outcome
    }

    async fn drive(&self, page: &B::Page, url: &str, options: &RenderOptions) -> Result<PageCapture> {
        page.set_viewport(options.viewport_or(self.config.window)).await?;

        if let Some(ua) = options.user_agent_or(self.config.user_agent.as_deref()) {
            page.set_user_agent(ua).await?;
        }
        if !options.headers.is_empty() {
            page.set_extra_headers(&options.headers).await?;
        }
        if !options.cookies.is_empty() {
            page.set_cookies(&options.cookies, url).await?;
        }

        let timeout = options.render_timeout_or(&self.config.renderer);
        let wait = WaitCondition::for_wait_until(options.wait_until);

        debug!("Loading URL: {}", url);
        let response = tokio::time::timeout(timeout, page.goto(url, &wait))
            .await
            .map_err(|_| {
                Error::Timeout(format!("Navigation timeout of {} ms exceeded", timeout.as_millis()))
            })??;

        if let Some(wait_time) = options.wait_time.filter(|d| !d.is_zero()) {
            tokio::time::sleep(wait_time).await;
        }

        if let Some(selector) = &options.wait_for_selector {
            tokio::time::timeout(timeout, page.wait_for_selector(selector))
                .await
                .map_err(|_| {
                    Error::Timeout(format!(
                        "waiting for selector `{}` failed: timeout {} ms exceeded",
                        selector,
                        timeout.as_millis()
                    ))
                })??;
        }

        if let Some(script) = &options.script {
            page.evaluate(script).await?;
        }

        let html = page.content().await?;
        let final_url = page.url().await?;
        let response = response.unwrap_or_default();

        let screenshot = if self.config.screenshot {
            Some(page.screenshot().await?)
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

impl<B: DevtoolsBrowser> Renderer for DevtoolsRenderer<B> {
    fn name(&self) -> &'static str {
        B::NAME
    }

    fn render(&self, url: &str, options: &RenderOptions) -> RenderResult {
        let started = Instant::now();
        let outcome = match (&self.browser, &self.event_loop) {
            (Some(_), Some(event_loop)) if !event_loop.can_block() => Err(Error::Configuration(
                "render called from inside a current-thread runtime".into(),
            )),
            (Some(browser), Some(event_loop)) => event_loop.block_on(self.render_async(browser, url, options)),
            _ => Err(Error::Configuration("renderer has been shut down".into())),
        };
        conclude(&self.stats, started, B::NAME, url, outcome)
    }

    fn shutdown(&mut self) {
        let Some(mut browser) = self.browser.take() else {
            return;
        };
        info!(
            "Shutting down {} renderer. Stats: {}",
            B::NAME,
            self.stats.snapshot()
        );
        match &self.event_loop {
            Some(event_loop) if event_loop.can_block() => {
                if let Err(e) = event_loop.block_on(browser.close()) {
                    error!("Error closing browser: {}", e);
                }
            }
            Some(_) => warn!("Inside a current-thread runtime; dropping the browser without closing it"),
            None => {}
        }
        drop(browser);
        if let Some(event_loop) = self.event_loop.take() {
            event_loop.close();
        }
    }

    fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

impl<B: DevtoolsBrowser> Drop for DevtoolsRenderer<B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(feature = "devtools")]
pub use chromium::{ChromiumBrowser, ChromiumPage};

#[cfg(feature = "devtools")]
mod chromium {
    use super::*;
    use chromiumoxide::browser::{Browser, BrowserConfig};
    use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
    use chromiumoxide::cdp::browser_protocol::network::{
        CookieParam as NetworkCookie, Headers, SetExtraHttpHeadersParams, SetUserAgentOverrideParams,
    };
    use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
    use chromiumoxide::error::CdpError;
    use chromiumoxide::page::ScreenshotParams;
    use chromiumoxide::Page;
    use futures::StreamExt;
    use tokio::task::JoinHandle;

    const SELECTOR_POLL: Duration = Duration::from_millis(100);

    const NAVIGATION_STATUS_JS: &str = r#"(() => {
        const nav = performance.getEntriesByType('navigation')[0];
        return nav && nav.responseStatus ? nav.responseStatus : 0;
    })()"#;

    /// Resolves once the resource count has been stable for 500 ms.
    const NETWORK_IDLE_JS: &str = r#"(async () => {
        const idleMs = 500;
        const interval = 100;
        let last = performance.getEntriesByType('resource').length;
        let stable = 0;
        while (stable < idleMs) {
            await new Promise(r => setTimeout(r, interval));
            const current = performance.getEntriesByType('resource').length;
            if (document.readyState === 'complete' && current === last) {
                stable += interval;
            } else {
                stable = 0;
            }
            last = current;
        }
        return true;
    })()"#;

    const DOM_READY_JS: &str = r#"(async () => {
        while (document.readyState === 'loading') {
            await new Promise(r => setTimeout(r, 50));
        }
        return true;
    })()"#;

    fn classify(step: &str, err: CdpError) -> Error {
        match err {
            CdpError::Timeout => Error::Timeout(step.to_string()),
            other => Error::Navigation(format!("{}: {}", step, other)),
        }
    }

    /// Chrome launched and driven by `chromiumoxide`
    pub struct ChromiumBrowser {
        browser: Browser,
        handler: JoinHandle<()>,
    }

    #[async_trait]
    impl DevtoolsBrowser for ChromiumBrowser {
        type Page = ChromiumPage;

        const NAME: &'static str = "Devtools";

        async fn launch(config: &DevtoolsConfig) -> Result<Self> {
            let mut builder = BrowserConfig::builder()
                .window_size(config.window.width, config.window.height)
                .request_timeout(config.command_timeout())
                .args(config.launch_args());
            if !config.headless {
                builder = builder.with_head();
            }
            if let Some(dir) = &config.user_data_dir {
                builder = builder.user_data_dir(dir);
            }
            if let Some(path) = &config.executable_path {
                builder = builder.chrome_executable(path);
            }
            let browser_config = builder.build().map_err(Error::Configuration)?;

            let (browser, mut handler) = Browser::launch(browser_config)
                .await
                .map_err(|e| Error::Configuration(format!("Failed to launch browser: {}", e)))?;

            let handler = tokio::spawn(async move {
                while let Some(event) = handler.next().await {
                    if let Err(e) = event {
                        debug!("chromiumoxide handler event error: {}", e);
                    }
                }
            });

            Ok(Self { browser, handler })
        }

        async fn new_page(&self) -> Result<ChromiumPage> {
            let page = self
                .browser
                .new_page("about:blank")
                .await
                .map_err(|e| classify("Failed to open page", e))?;
            Ok(ChromiumPage { page })
        }

        async fn close(&mut self) -> Result<()> {
            let closed = self
                .browser
                .close()
                .await
                .map(|_| ())
                .map_err(|e| classify("Failed to close browser", e));
            if let Err(e) = self.browser.wait().await {
                warn!("Error waiting for browser exit: {}", e);
            }
            self.handler.abort();
            closed
        }
    }

    pub struct ChromiumPage {
        page: Page,
    }

    #[async_trait]
    impl DevtoolsPage for ChromiumPage {
        async fn set_viewport(&self, viewport: Viewport) -> Result<()> {
            let params = SetDeviceMetricsOverrideParams::new(
                viewport.width as i64,
                viewport.height as i64,
                1.0,
                false,
            );
            self.page
                .execute(params)
                .await
                .map(|_| ())
                .map_err(|e| classify("Failed to set viewport", e))
        }

        async fn set_user_agent(&self, user_agent: &str) -> Result<()> {
            self.page
                .execute(SetUserAgentOverrideParams::new(user_agent))
                .await
                .map(|_| ())
                .map_err(|e| classify("Failed to set user agent", e))
        }

        async fn set_extra_headers(&self, headers: &HashMap<String, String>) -> Result<()> {
            let headers = serde_json::to_value(headers)
                .map_err(|e| Error::Navigation(format!("Invalid headers: {}", e)))?;
            self.page
                .execute(SetExtraHttpHeadersParams::new(Headers::new(headers)))
                .await
                .map(|_| ())
                .map_err(|e| classify("Failed to set headers", e))
        }

        async fn set_cookies(&self, cookies: &[CookieParam], url: &str) -> Result<()> {
            let params = cookies
                .iter()
                .map(|c| {
                    serde_json::from_value::<NetworkCookie>(c.cdp_params(url))
                        .map_err(|e| Error::Navigation(format!("Invalid cookie {}: {}", c.name, e)))
                })
                .collect::<Result<Vec<_>>>()?;
            self.page
                .set_cookies(params)
                .await
                .map(|_| ())
                .map_err(|e| classify("Failed to set cookies", e))
        }

        async fn goto(&self, url: &str, wait: &[WaitCondition]) -> Result<Option<NavigationResponse>> {
            self.page
                .goto(url)
                .await
                .map_err(|e| classify("Navigation failed", e))?;

            for condition in wait {
                let script = match condition {
                    // `goto` already waited for the load event
                    WaitCondition::Load => continue,
                    WaitCondition::DomContentLoaded => DOM_READY_JS,
                    WaitCondition::NetworkIdle0 => NETWORK_IDLE_JS,
                };
                self.page
                    .evaluate(script)
                    .await
                    .map_err(|e| classify(&format!("Waiting for {}", condition.as_str()), e))?;
            }

            let status = self
                .page
                .evaluate(NAVIGATION_STATUS_JS)
                .await
                .ok()
                .and_then(|r| r.value().and_then(|v| v.as_u64()))
                .filter(|s| *s > 0 && *s <= u16::MAX as u64);

            Ok(status.map(|s| NavigationResponse {
                status: s as u16,
                headers: HashMap::new(),
            }))
        }

        async fn wait_for_selector(&self, selector: &str) -> Result<()> {
            loop {
                if self.page.find_element(selector).await.is_ok() {
                    return Ok(());
                }
                tokio::time::sleep(SELECTOR_POLL).await;
            }
        }

        async fn evaluate(&self, script: &str) -> Result<serde_json::Value> {
            let result = self
                .page
                .evaluate(script)
                .await
                .map_err(|e| classify("Evaluation failed", e))?;
            Ok(result.value().cloned().unwrap_or(serde_json::Value::Null))
        }

        async fn content(&self) -> Result<String> {
            self.page
                .content()
                .await
                .map_err(|e| classify("Failed to read page content", e))
        }

        async fn url(&self) -> Result<String> {
            let url = self
                .page
                .url()
                .await
                .map_err(|e| classify("Failed to read page url", e))?;
            Ok(url.unwrap_or_default())
        }

        async fn screenshot(&self) -> Result<Vec<u8>> {
            let params = ScreenshotParams::builder()
                .format(CaptureScreenshotFormat::Png)
                .full_page(true)
                .build();
            self.page
                .screenshot(params)
                .await
                .map_err(|e| classify("Screenshot failed", e))
        }

        async fn close(self) -> Result<()> {
            self.page
                .close()
                .await
                .map_err(|e| classify("Failed to close page", e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_vocabulary() {
        assert_eq!(
            WaitCondition::for_wait_until(WaitUntil::NetworkIdle),
            vec![WaitCondition::NetworkIdle0]
        );
        assert_eq!(
            WaitCondition::for_wait_until(WaitUntil::DomContentLoaded),
            vec![WaitCondition::DomContentLoaded]
        );
        assert_eq!(WaitCondition::for_wait_until(WaitUntil::Load), vec![WaitCondition::Load]);
        assert_eq!(WaitCondition::NetworkIdle0.as_str(), "networkidle0");
    }

    #[test]
    fn launch_args_include_defaults_and_extras() {
        let config = DevtoolsConfig {
            proxy: Some("http://proxy:3128".into()),
            browser_args: vec!["--lang=de".into()],
            ..Default::default()
        };
        let args = config.launch_args();
        assert_eq!(args[0], "--no-sandbox");
        assert_eq!(args[1], "--disable-dev-shm-usage");
        assert!(args.contains(&"--proxy-server=http://proxy:3128".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("--lang=de"));
    }

    #[test]
    fn command_timeout_covers_navigation() {
        let mut config = DevtoolsConfig::default();
        assert_eq!(config.command_timeout(), Duration::from_secs(60));
        config.renderer.render_timeout = Duration::from_secs(10);
        assert_eq!(config.command_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn owned_loop_outside_runtime() {
        let event_loop = EventLoop::current_or_owned().unwrap();
        assert!(event_loop.is_owned());
        assert_eq!(event_loop.block_on(async { 1 + 1 }), 2);
        event_loop.close();
    }

    #[test]
    fn current_thread_runtime_cannot_be_borrowed() {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let err = EventLoop::borrowed(rt.handle().clone()).err().unwrap();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn running_runtime_is_borrowed() {
        let event_loop = EventLoop::current_or_owned().unwrap();
        assert!(!event_loop.is_owned());
        assert_eq!(event_loop.block_on(async { "ok" }), "ok");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn owned_loop_blocks_inside_runtime() {
        let event_loop = EventLoop::owned().unwrap();
        assert!(event_loop.can_block());
        assert_eq!(event_loop.block_on(async { 3 }), 3);
        event_loop.close();
    }

    #[tokio::test(flavor = "current_thread")]
    async fn current_thread_context_cannot_block() {
        let event_loop = EventLoop::owned().unwrap();
        assert!(!event_loop.can_block());
        event_loop.close();
    }
}
