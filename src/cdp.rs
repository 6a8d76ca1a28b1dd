//! Chrome DevTools Protocol session backend (uses the `headless_chrome` crate)
//!
//! One Chrome process per [`CdpBackend`]; each session is a separate browser
//! context so cookies and storage never cross render calls.

use crate::session::{
    BrowserEngine, BrowserSession, LaunchOptions, NavigationResponse, SessionBackend, SessionOptions,
    SessionPage,
};
use crate::{CookieParam, Error, Result, WaitUntil};
use headless_chrome::browser::context::Context;
use headless_chrome::browser::tab::Tab;
use headless_chrome::protocol::cdp::{Emulation, Network, Page, Target};
use headless_chrome::Browser;
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Extra settle time after load for `networkidle`
const NETWORK_SETTLE: Duration = Duration::from_millis(500);

/// Keep the DevTools connection open between sparse renders
const IDLE_BROWSER_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Main document status from the Navigation Timing API; 0 when unsupported.
const NAVIGATION_STATUS_JS: &str = r#"
(function() {
    const nav = performance.getEntriesByType('navigation')[0];
    return nav && nav.responseStatus ? nav.responseStatus : 0;
})()
"#;

/// Map a `headless_chrome` failure into the crate error set.
fn classify(step: &str, err: anyhow::Error) -> Error {
    let text = err.to_string();
    let lower = text.to_ascii_lowercase();
    if lower.contains("timed out") || lower.contains("timeout") || lower.contains("never came") {
        Error::Timeout(format!("{}: {}", step, text))
    } else {
        Error::Navigation(format!("{}: {}", step, text))
    }
}

/// Build a protocol command from its JSON form; missing optional fields stay unset.
fn protocol<T: DeserializeOwned>(params: Value) -> Result<T> {
    serde_json::from_value(params)
        .map_err(|e| Error::Navigation(format!("Invalid protocol parameters: {}", e)))
}

fn network_cookie(cookie: &CookieParam, page_url: &str) -> Result<Network::CookieParam> {
    protocol(cookie.cdp_params(page_url))
}

/// Headless Chrome driven over CDP
pub struct CdpBackend {
    browser: Option<Browser>,
}

impl SessionBackend for CdpBackend {
    type Session<'a> = CdpSession<'a>;

    const NAME: &'static str = "CDP";

    fn launch(options: &LaunchOptions) -> Result<Self> {
        if options.engine != BrowserEngine::Chromium {
            return Err(Error::Configuration(format!(
                "CDP backend can only drive chromium, not {}",
                options.engine
            )));
        }

        let launch_options = headless_chrome::LaunchOptions::default_builder()
            .headless(options.headless)
            .window_size(Some((options.window.width, options.window.height)))
            .path(options.executable_path.clone())
            .proxy_server(options.proxy.as_deref())
            .user_data_dir(options.user_data_dir.clone())
            .ignore_certificate_errors(options.ignore_https_errors)
            .idle_browser_timeout(IDLE_BROWSER_TIMEOUT)
            .build()
            .map_err(|e| Error::Configuration(format!("Failed to build launch options: {}", e)))?;

        let browser = Browser::new(launch_options)
            .map_err(|e| Error::Configuration(format!("Failed to launch browser: {}", e)))?;

        Ok(Self {
            browser: Some(browser),
        })
    }

    fn new_session(&self, options: &SessionOptions) -> Result<CdpSession<'_>> {
        let browser = self
            .browser
            .as_ref()
            .ok_or_else(|| Error::Configuration("browser is closed".into()))?;
        let context = browser
            .new_context()
            .map_err(|e| classify("Failed to create browser context", e))?;
        Ok(CdpSession {
            browser,
            context,
            options: options.clone(),
            cookies: Vec::new(),
            tabs: Vec::new(),
        })
    }

    fn close_browser(&mut self) -> Result<()> {
        if let Some(browser) = self.browser.take() {
            debug!("Closing Chrome (version {:?})", browser.get_version().map(|v| v.product).ok());
            // Dropping the handle terminates the child process
            drop(browser);
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        // headless_chrome owns its transport thread inside `Browser`
        Ok(())
    }
}

/// One browser context and the tabs opened in it
pub struct CdpSession<'a> {
    browser: &'a Browser,
    context: Context<'a>,
    options: SessionOptions,
    cookies: Vec<CookieParam>,
    tabs: Vec<Arc<Tab>>,
}

impl CdpSession<'_> {
    fn emulate(&self, tab: &Tab) -> Result<()> {
        let o = &self.options;
        let metrics: Emulation::SetDeviceMetricsOverride = protocol(json!({
            "width": o.viewport.width,
            "height": o.viewport.height,
            "deviceScaleFactor": o.device_scale_factor,
            "mobile": false,
        }))?;
        tab.call_method(metrics)
            .map_err(|e| classify("Failed to set viewport", e))?;

        if let Some(ua) = &o.user_agent {
            tab.set_user_agent(ua, o.locale.as_deref(), None)
                .map_err(|e| classify("Failed to set user agent", e))?;
        }
        if let Some(locale) = &o.locale {
            let cmd: Emulation::SetLocaleOverride = protocol(json!({ "locale": locale }))?;
            tab.call_method(cmd)
                .map_err(|e| classify("Failed to set locale", e))?;
        }
        if let Some(tz) = &o.timezone_id {
            let cmd: Emulation::SetTimezoneOverride = protocol(json!({ "timezoneId": tz }))?;
            tab.call_method(cmd)
                .map_err(|e| classify("Failed to set timezone", e))?;
        }
        if let Some(scheme) = o.color_scheme {
            let cmd: Emulation::SetEmulatedMedia = protocol(json!({
                "features": [{ "name": "prefers-color-scheme", "value": scheme.as_str() }],
            }))?;
            tab.call_method(cmd)
                .map_err(|e| classify("Failed to set color scheme", e))?;
        }
        Ok(())
    }
}

impl BrowserSession for CdpSession<'_> {
    type Page = CdpPage;

    fn add_cookies(&mut self, cookies: &[CookieParam]) -> Result<()> {
        self.cookies.extend_from_slice(cookies);
        Ok(())
    }

    fn new_page(&mut self) -> Result<CdpPage> {
        let tab = self
            .context
            .new_tab()
            .map_err(|e| classify("Failed to create tab", e))?;
        self.tabs.push(tab.clone());
        self.emulate(&tab)?;
        Ok(CdpPage {
            tab,
            pending_cookies: Mutex::new(std::mem::take(&mut self.cookies)),
        })
    }

    fn close(self) -> Result<()> {
        for tab in &self.tabs {
            if let Err(e) = tab.close(false) {
                warn!("Failed to close tab: {}", e);
            }
        }
        let dispose = Target::DisposeBrowserContext {
            browser_context_id: self.context.get_id().to_string(),
        };
        self.browser
            .call_method(dispose)
            .map_err(|e| classify("Failed to dispose browser context", e))?;
        Ok(())
    }
}

/// A tab inside a [`CdpSession`]
pub struct CdpPage {
    tab: Arc<Tab>,
    /// Seeded on the first navigation, once the target URL is known
    pending_cookies: Mutex<Vec<CookieParam>>,
}

impl CdpPage {
    fn seed_cookies(&self, url: &str) -> Result<()> {
        let cookies = std::mem::take(&mut *self.pending_cookies.lock().unwrap_or_else(|e| e.into_inner()));
        if cookies.is_empty() {
            return Ok(());
        }
        let params = cookies
            .iter()
            .map(|c| network_cookie(c, url))
            .collect::<Result<Vec<_>>>()?;
        self.tab
            .set_cookies(params)
            .map_err(|e| classify("Failed to set cookies", e))
    }
}

impl SessionPage for CdpPage {
    fn set_extra_headers(&self, headers: &HashMap<String, String>) -> Result<()> {
        let headers: HashMap<&str, &str> = headers
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        self.tab
            .set_extra_http_headers(headers)
            .map_err(|e| classify("Failed to set headers", e))
    }

    fn set_default_timeout(&self, timeout: Duration) {
        self.tab.set_default_timeout(timeout);
    }

    fn goto(&self, url: &str, wait_until: WaitUntil, timeout: Duration) -> Result<Option<NavigationResponse>> {
        self.seed_cookies(url)?;
        self.tab.set_default_timeout(timeout);

        self.tab
            .navigate_to(url)
            .map_err(|e| classify("Navigation failed", e))?;
        self.tab
            .wait_until_navigated()
            .map_err(|e| classify("Wait for navigation failed", e))?;

        if wait_until == WaitUntil::NetworkIdle {
            std::thread::sleep(NETWORK_SETTLE);
        }

        let status = self
            .tab
            .evaluate(NAVIGATION_STATUS_JS, false)
            .ok()
            .and_then(|obj| obj.value)
            .and_then(|v| v.as_u64())
            .filter(|s| *s > 0 && *s <= u16::MAX as u64);

        Ok(status.map(|s| NavigationResponse {
            status: s as u16,
            headers: HashMap::new(),
        }))
    }

    fn wait_for_selector(&self, selector: &str, timeout: Duration) -> Result<()> {
        self.tab
            .wait_for_element_with_custom_timeout(selector, timeout)
            .map(|_| ())
            .map_err(|e| classify(&format!("Waiting for selector {}", selector), e))
    }

    fn evaluate(&self, script: &str) -> Result<Value> {
        let result = self
            .tab
            .evaluate(script, true)
            .map_err(|e| classify("Evaluation failed", e))?;
        Ok(result.value.unwrap_or(Value::Null))
    }

    fn content(&self) -> Result<String> {
        self.tab
            .get_content()
            .map_err(|e| classify("Failed to read page content", e))
    }

    fn url(&self) -> String {
        self.tab.get_url()
    }

    fn screenshot(&self) -> Result<Vec<u8>> {
        self.tab
            .capture_screenshot(Page::CaptureScreenshotFormatOption::Png, None, None, true)
            .map_err(|e| classify("Screenshot failed", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{SessionConfig, SessionRenderer};
    use crate::{RenderOptions, Renderer};

    #[test]
    fn cookies_convert_to_protocol_params() {
        let cookie = CookieParam {
            same_site: Some("Strict".into()),
            ..CookieParam::new("sid", "abc")
        };
        let param = network_cookie(&cookie, "https://example.com/").unwrap();
        let v = serde_json::to_value(&param).unwrap();
        assert_eq!(v["url"], "https://example.com/");
        assert_eq!(v["name"], "sid");
        assert_eq!(v["sameSite"], "Strict");
    }

    #[test]
    fn timeouts_are_classified() {
        let e = classify("Waiting for selector #x", anyhow::anyhow!("The event waited for never came"));
        assert!(e.is_timeout());
        let e = classify("Navigation failed", anyhow::anyhow!("net::ERR_NAME_NOT_RESOLVED"));
        assert!(matches!(e, Error::Navigation(_)));
    }

    #[test]
    fn non_chromium_engine_is_rejected() {
        let config = SessionConfig {
            browser_type: "firefox".into(),
            ..Default::default()
        };
        let err = SessionRenderer::<CdpBackend>::new(config).err().unwrap();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    #[ignore] // Requires Chrome
    fn test_cdp_render() {
        let mut renderer = SessionRenderer::<CdpBackend>::new(SessionConfig::default()).unwrap();
        let result = renderer.render("https://example.com", &RenderOptions::default());
        assert!(result.is_success(), "{:?}", result.error);
        assert!(result.html.contains("Example Domain"));
        renderer.shutdown();
        renderer.shutdown();
    }
}
