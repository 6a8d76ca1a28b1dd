//! Remote rendering through a Splash HTTP service.
//!
//! The whole browse-and-extract sequence runs server side as a Lua script, so
//! one `render` call is one `POST /execute`. The service owns page lifecycle;
//! this adapter only holds a blocking HTTP client and has nothing to release
//! on shutdown.

use crate::{
    conclude, Error, PageCapture, RenderOptions, RenderResult, RenderStats, Renderer,
    RendererConfig, Result, StatsSnapshot,
};
use base64::Engine as Base64Engine;
use log::{error, info, warn};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;

const BACKEND: &str = "Splash";

/// Lua script used when no custom script is configured
pub const DEFAULT_LUA_SCRIPT: &str = r#"
function main(splash, args)
    splash:set_user_agent(args.user_agent or "crawlrender/0.1 (+splash)")

    if args.headers then
        splash:set_custom_headers(args.headers)
    end

    if args.cookies then
        splash:init_cookies(args.cookies)
    end

    splash.resource_timeout = args.resource_timeout
    splash.har_reset()
    splash:set_viewport_size(args.width or 1024, args.height or 768)

    local ok, reason = splash:go(args.url)
    if not ok then
        return {
            error = reason,
            status_code = 0,
            html = "",
            url = args.url
        }
    end

    if args.wait_until == "networkidle" then
        splash:wait_for_resume(args.render_timeout)
    else
        splash:wait(args.wait_time or 2.0)
    end

    if args.wait_for_selector then
        splash:wait_for_element(args.wait_for_selector, args.render_timeout)
    end

    local html = splash:html()
    local har = splash.har()
    local last_response = splash:get_last_response()

    local screenshot = nil
    if args.screenshot then
        screenshot = splash:png()
    end

    return {
        html = html,
        har = har,
        status_code = last_response.status,
        headers = last_response.headers,
        url = splash:url(),
        screenshot = screenshot
    }
end
"#;

/// Configuration for [`SplashRenderer`]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SplashConfig {
    /// Base URL of the Splash service
    pub splash_url: String,
    pub renderer: RendererConfig,
    /// Custom Lua script; the built-in one is used when `None`
    pub lua_source: Option<String>,
    pub screenshot: bool,
    pub screenshot_width: u32,
    pub screenshot_height: u32,
    /// Headers sent with every render, call-level headers win
    pub headers: HashMap<String, String>,
}

impl Default for SplashConfig {
    fn default() -> Self {
        Self {
            splash_url: "http://localhost:8050".to_string(),
            renderer: RendererConfig::default(),
            lua_source: None,
            screenshot: false,
            screenshot_width: 1024,
            screenshot_height: 768,
            headers: HashMap::new(),
        }
    }
}

/// Body of `POST /execute`. `None` fields are left out of the JSON.
#[derive(Debug, Serialize)]
struct ExecuteArgs<'a> {
    url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    wait_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    wait_for_selector: Option<&'a str>,
    wait_until: &'static str,
    headers: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cookies: Option<&'a [crate::CookieParam]>,
    render_timeout: f64,
    resource_timeout: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_agent: Option<&'a str>,
    width: u32,
    height: u32,
    screenshot: bool,
    lua_source: &'a str,
}

#[derive(Debug, Default, Deserialize)]
struct ExecuteResponse {
    #[serde(default)]
    html: Option<String>,
    #[serde(default)]
    har: Option<serde_json::Value>,
    #[serde(default)]
    status_code: Option<u16>,
    #[serde(default)]
    headers: Option<serde_json::Value>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    screenshot: Option<String>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

/// Renderer backed by a running Splash instance
pub struct SplashRenderer {
    client: Client,
    config: SplashConfig,
    lua_source: String,
    stats: RenderStats,
}

impl SplashRenderer {
    /// Build the client and check `GET /_ping`.
    ///
    /// Fails when the service is unreachable or does not answer `200 ok`.
    pub fn new(config: SplashConfig) -> Result<Self> {
        config.renderer.validate()?;

        let client = Client::builder()
            .timeout(config.renderer.timeout)
            .build()
            .map_err(|e| Error::Configuration(format!("Failed to build HTTP client: {}", e)))?;

        let lua_source = config
            .lua_source
            .clone()
            .unwrap_or_else(|| DEFAULT_LUA_SCRIPT.to_string());

        let renderer = Self {
            client,
            config,
            lua_source,
            stats: RenderStats::new(),
        };
        renderer.check_connectivity()?;
        Ok(renderer)
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.splash_url.trim_end_matches('/'), path)
    }

    fn check_connectivity(&self) -> Result<()> {
        let url = self.endpoint("/_ping");
        let response = self.client.get(&url).send().map_err(|e| {
            error!("Failed to connect to Splash at {}: {}", self.config.splash_url, e);
            Error::Configuration(format!("Could not connect to Splash: {}", e))
        })?;

        let status = response.status().as_u16();
        let body = response.text().unwrap_or_default();
        if status != 200 || body != "ok" {
            return Err(Error::Configuration(format!(
                "Splash returned unexpected response (HTTP {}): {}",
                status, body
            )));
        }

        info!("Successfully connected to Splash at {}", self.config.splash_url);
        Ok(())
    }

    fn build_args<'a>(&'a self, url: &'a str, options: &'a RenderOptions) -> ExecuteArgs<'a> {
        let mut headers = self.config.headers.clone();
        headers.extend(options.headers.iter().map(|(k, v)| (k.clone(), v.clone())));

        ExecuteArgs {
            url,
            wait_time: options.wait_time.map(|d| d.as_secs_f64()),
            wait_for_selector: options.wait_for_selector.as_deref(),
            wait_until: options.wait_until.as_str(),
            headers,
            cookies: if options.cookies.is_empty() {
                None
            } else {
                Some(options.cookies.as_slice())
            },
            render_timeout: options.render_timeout_or(&self.config.renderer).as_secs_f64(),
            resource_timeout: self.config.renderer.resource_timeout.as_secs_f64(),
            user_agent: options.user_agent.as_deref(),
            width: options.viewport_width.unwrap_or(self.config.screenshot_width),
            height: options.viewport_height.unwrap_or(self.config.screenshot_height),
            screenshot: self.config.screenshot,
            lua_source: &self.lua_source,
        }
    }

    fn fail(&self, started: Instant, url: &str, err: Error, status_code: u16) -> RenderResult {
        let mut result = conclude(&self.stats, started, BACKEND, url, Err(err));
        result.status_code = status_code;
        result
    }
}

/// Splash reports headers either as an object or as `[{name, value}]`.
fn parse_headers(value: Option<serde_json::Value>) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    match value {
        Some(serde_json::Value::Object(map)) => {
            for (k, v) in map {
                let v = v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string());
                headers.insert(k, v);
            }
        }
        Some(serde_json::Value::Array(items)) => {
            for item in items {
                if let (Some(name), Some(value)) = (
                    item.get("name").and_then(|n| n.as_str()),
                    item.get("value").and_then(|v| v.as_str()),
                ) {
                    headers.insert(name.to_string(), value.to_string());
                }
            }
        }
        _ => {}
    }
    headers
}

fn error_text(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null | serde_json::Value::Bool(false) => None,
        serde_json::Value::String(s) if s.is_empty() => None,
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

impl Renderer for SplashRenderer {
    fn name(&self) -> &'static str {
        BACKEND
    }

    fn render(&self, url: &str, options: &RenderOptions) -> RenderResult {
        let started = Instant::now();
        let args = self.build_args(url, options);

        let response = match self.client.post(self.endpoint("/execute")).json(&args).send() {
            Ok(r) => r,
            Err(e) => return self.fail(started, url, Error::Transport(e.to_string()), 0),
        };

        let status = response.status().as_u16();
        if status != 200 {
            let body = response.text().unwrap_or_default();
            let err = Error::Http { status, body };
            return self.fail(started, url, err, status);
        }

        let payload: ExecuteResponse = match response.json() {
            Ok(p) => p,
            Err(e) => {
                let err = if e.is_timeout() {
                    Error::Transport(e.to_string())
                } else {
                    Error::Navigation(format!("invalid Splash response: {}", e))
                };
                return self.fail(started, url, err, 0);
            }
        };

        if let Some(reason) = payload.error.as_ref().and_then(error_text) {
            // Keep what the script reported about the failed navigation.
            let mut result = self.fail(started, url, Error::Navigation(reason), 0);
            result.status_code = payload.status_code.unwrap_or(0);
            if let Some(final_url) = payload.url {
                result.url = final_url;
            }
            return result;
        }

        let screenshot = if self.config.screenshot {
            payload.screenshot.as_deref().and_then(|b64| {
                base64::engine::general_purpose::STANDARD
                    .decode(b64)
                    .map_err(|e| warn!("Discarding undecodable Splash screenshot: {}", e))
                    .ok()
            })
        } else {
            None
        };

        let capture = PageCapture {
            html: payload.html.unwrap_or_default(),
            status_code: payload.status_code.unwrap_or(200),
            headers: parse_headers(payload.headers),
            url: payload.url.unwrap_or_else(|| url.to_string()),
            screenshot,
        };

        let mut result = conclude(&self.stats, started, BACKEND, url, Ok(capture));
        if result.is_success() {
            result.har = payload.har;
        }
        result
    }

    fn shutdown(&mut self) {
        info!("Shutting down Splash renderer. Stats: {}", self.stats.snapshot());
    }

    fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CookieParam, WaitUntil};
    use std::time::Duration;

    #[test]
    fn headers_accept_both_shapes() {
        let obj = serde_json::json!({"Content-Type": "text/html", "X-Num": 5});
        let h = parse_headers(Some(obj));
        assert_eq!(h.get("Content-Type").map(String::as_str), Some("text/html"));
        assert_eq!(h.get("X-Num").map(String::as_str), Some("5"));

        let list = serde_json::json!([{"name": "Server", "value": "nginx"}, {"bogus": 1}]);
        let h = parse_headers(Some(list));
        assert_eq!(h.len(), 1);
        assert_eq!(h["Server"], "nginx");

        assert!(parse_headers(None).is_empty());
    }

    #[test]
    fn empty_error_values_are_not_errors() {
        assert_eq!(error_text(&serde_json::Value::Null), None);
        assert_eq!(error_text(&serde_json::json!("")), None);
        assert_eq!(error_text(&serde_json::json!(false)), None);
        assert_eq!(error_text(&serde_json::json!("network5")).as_deref(), Some("network5"));
    }

    #[test]
    fn execute_args_omit_absent_values() {
        let args = ExecuteArgs {
            url: "https://example.com",
            wait_time: None,
            wait_for_selector: None,
            wait_until: WaitUntil::Load.as_str(),
            headers: HashMap::new(),
            cookies: None,
            render_timeout: 60.0,
            resource_timeout: 30.0,
            user_agent: None,
            width: 1024,
            height: 768,
            screenshot: false,
            lua_source: DEFAULT_LUA_SCRIPT,
        };
        let v = serde_json::to_value(&args).unwrap();
        let obj = v.as_object().unwrap();
        assert!(!obj.contains_key("wait_time"));
        assert!(!obj.contains_key("cookies"));
        assert!(!obj.contains_key("user_agent"));
        assert!(!obj.contains_key("wait_for_selector"));
        assert_eq!(obj["width"], 1024);
        assert_eq!(obj["wait_until"], "load");
        assert!(obj["lua_source"].as_str().unwrap().contains("function main"));
    }

    #[test]
    fn cookies_serialize_without_empty_fields() {
        let cookies = vec![CookieParam::new("session", "abc")];
        let args = ExecuteArgs {
            url: "https://example.com",
            wait_time: Some(Duration::from_millis(1500).as_secs_f64()),
            wait_for_selector: Some("#main"),
            wait_until: WaitUntil::NetworkIdle.as_str(),
            headers: HashMap::new(),
            cookies: Some(cookies.as_slice()),
            render_timeout: 10.0,
            resource_timeout: 5.0,
            user_agent: Some("bot/1.0"),
            width: 800,
            height: 600,
            screenshot: true,
            lua_source: "function main(splash) end",
        };
        let v = serde_json::to_value(&args).unwrap();
        assert_eq!(v["cookies"][0], serde_json::json!({"name": "session", "value": "abc"}));
        assert_eq!(v["wait_time"], 1.5);
        assert_eq!(v["wait_until"], "networkidle");
    }
}
