//! SessionRenderer against an in-memory driver

use crawlrender::session::{
    BrowserEngine, BrowserSession, LaunchOptions, NavigationResponse, SessionBackend, SessionConfig,
    SessionOptions, SessionPage, SessionRenderer,
};
use crawlrender::{CookieParam, Error, ErrorKind, RenderOptions, Renderer, Result, WaitUntil};
use std::cell::RefCell;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Default)]
struct Calls {
    launches: Vec<BrowserEngine>,
    sessions: Vec<SessionOptions>,
    sessions_closed: usize,
    browser_closed: usize,
    stopped: usize,
    goto_timeouts: Vec<Duration>,
}

thread_local! {
    // Each test drives its renderer from its own thread
    static CALLS: RefCell<Calls> = RefCell::new(Calls::default());
}

fn calls<T>(f: impl FnOnce(&mut Calls) -> T) -> T {
    CALLS.with(|p| f(&mut p.borrow_mut()))
}

fn reset() {
    calls(|p| *p = Calls::default());
}

struct FakeBackend;

impl SessionBackend for FakeBackend {
    type Session<'a> = FakeSession<'a>;

    const NAME: &'static str = "Fake";

    fn launch(options: &LaunchOptions) -> Result<Self> {
        calls(|p| p.launches.push(options.engine));
        Ok(FakeBackend)
    }

    fn new_session(&self, options: &SessionOptions) -> Result<FakeSession<'_>> {
        calls(|p| p.sessions.push(options.clone()));
        Ok(FakeSession {
            _browser: self,
            options: options.clone(),
            cookies: Vec::new(),
        })
    }

    fn close_browser(&mut self) -> Result<()> {
        calls(|p| p.browser_closed += 1);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        calls(|p| p.stopped += 1);
        Ok(())
    }
}

struct FakeSession<'a> {
    _browser: &'a FakeBackend,
    options: SessionOptions,
    cookies: Vec<String>,
}

impl BrowserSession for FakeSession<'_> {
    type Page = FakePage;

    fn add_cookies(&mut self, cookies: &[CookieParam]) -> Result<()> {
        self.cookies.extend(cookies.iter().map(|c| c.name.clone()));
        Ok(())
    }

    fn new_page(&mut self) -> Result<FakePage> {
        Ok(FakePage {
            options: self.options.clone(),
            cookies: self.cookies.clone(),
            headers: RefCell::new(HashMap::new()),
            url: RefCell::new(String::new()),
        })
    }

    fn close(self) -> Result<()> {
        calls(|p| p.sessions_closed += 1);
        Ok(())
    }
}

struct FakePage {
    options: SessionOptions,
    cookies: Vec<String>,
    headers: RefCell<HashMap<String, String>>,
    url: RefCell<String>,
}

impl SessionPage for FakePage {
    fn set_extra_headers(&self, headers: &HashMap<String, String>) -> Result<()> {
        self.headers.borrow_mut().extend(headers.clone());
        Ok(())
    }

    fn set_default_timeout(&self, _timeout: Duration) {}

    fn goto(&self, url: &str, _wait_until: WaitUntil, timeout: Duration) -> Result<Option<NavigationResponse>> {
        calls(|p| p.goto_timeouts.push(timeout));
        if url.contains("unreachable") {
            return Err(Error::Navigation("net::ERR_NAME_NOT_RESOLVED".into()));
        }
        *self.url.borrow_mut() = format!("{}#landed", url);
        if url.contains("nostatus") {
            return Ok(None);
        }
        let mut headers = HashMap::new();
        headers.insert("content-type".to_string(), "text/html".to_string());
        Ok(Some(NavigationResponse { status: 203, headers }))
    }

    fn wait_for_selector(&self, selector: &str, timeout: Duration) -> Result<()> {
        if selector == "#present" {
            Ok(())
        } else {
            Err(Error::Timeout(format!("selector {} not found within {:?}", selector, timeout)))
        }
    }

    fn evaluate(&self, _script: &str) -> Result<serde_json::Value> {
        Ok(serde_json::Value::Null)
    }

    fn content(&self) -> Result<String> {
        Ok(format!(
            "<html><body ua=\"{}\" w=\"{}\" cookies=\"{}\" headers=\"{}\"></body></html>",
            self.options.user_agent.as_deref().unwrap_or("default"),
            self.options.viewport.width,
            self.cookies.join(","),
            self.headers.borrow().len(),
        ))
    }

    fn url(&self) -> String {
        self.url.borrow().clone()
    }

    fn screenshot(&self) -> Result<Vec<u8>> {
        Ok(vec![0x89, b'P', b'N', b'G'])
    }
}

fn renderer() -> SessionRenderer<FakeBackend> {
    reset();
    SessionRenderer::new(SessionConfig::default()).unwrap()
}

fn quick() -> RenderOptions {
    RenderOptions {
        wait_time: None,
        ..Default::default()
    }
}

#[test]
fn captures_page_and_navigation_response() {
    let renderer = renderer();
    let result = renderer.render("https://example.com/", &quick());
    assert!(result.is_success(), "{:?}", result.error);
    assert_eq!(result.status_code, 203);
    assert_eq!(result.url, "https://example.com/#landed");
    assert_eq!(result.headers.get("content-type").map(String::as_str), Some("text/html"));
    assert!(result.screenshot.is_none());

    let unknown = renderer.render("https://example.com/nostatus", &quick());
    assert!(unknown.is_success());
    assert_eq!(unknown.status_code, 0);
}

#[test]
fn invalid_engine_never_launches() {
    reset();
    let err = SessionRenderer::<FakeBackend>::new(SessionConfig {
        browser_type: "unsupported-engine".into(),
        ..Default::default()
    })
    .err()
    .unwrap();
    assert!(matches!(err, Error::Configuration(_)));
    assert!(calls(|p| p.launches.is_empty()));
}

#[test]
fn session_is_closed_on_every_path() {
    let renderer = renderer();

    assert!(renderer.render("https://example.com/", &quick()).is_success());

    let failed = renderer.render("https://unreachable.invalid/", &quick());
    assert_eq!(failed.error_kind, Some(ErrorKind::Navigation));
    assert!(failed
        .error
        .unwrap()
        .starts_with("Fake error rendering URL https://unreachable.invalid/"));

    let missing = RenderOptions {
        wait_for_selector: Some("#absent".into()),
        ..quick()
    };
    let timed_out = renderer.render("https://example.com/", &missing);
    assert_eq!(timed_out.error_kind, Some(ErrorKind::Timeout));
    assert!(timed_out.html.is_empty());

    assert_eq!(calls(|p| p.sessions_closed), 3);
    let stats = renderer.stats();
    assert_eq!(stats.pages_rendered, 3);
    assert_eq!(stats.successful_renders, 1);
    assert_eq!(stats.render_errors, 2);
}

#[test]
fn per_call_overrides_do_not_leak() {
    let renderer = renderer();

    let custom = RenderOptions {
        user_agent: Some("custom/1.0".into()),
        viewport_width: Some(375),
        cookies: vec![CookieParam::new("sid", "abc")],
        headers: HashMap::from([("X-Trace".to_string(), "1".to_string())]),
        timeout: Some(Duration::from_secs(5)),
        ..quick()
    };
    let first = renderer.render("https://example.com/", &custom);
    assert!(first.html.contains("ua=\"custom/1.0\""));
    assert!(first.html.contains("w=\"375\""));
    assert!(first.html.contains("cookies=\"sid\""));
    assert!(first.html.contains("headers=\"1\""));

    let second = renderer.render("https://example.com/", &quick());
    assert!(second.html.contains("ua=\"default\""));
    assert!(second.html.contains("w=\"1024\""));
    assert!(second.html.contains("cookies=\"\""));
    assert!(second.html.contains("headers=\"0\""));

    calls(|p| {
        assert_eq!(p.goto_timeouts, vec![Duration::from_secs(5), Duration::from_secs(60)]);
        assert_eq!(p.sessions.len(), 2);
        assert_eq!(p.sessions[1].viewport.height, 768);
    });
}

#[test]
fn screenshot_when_configured() {
    let renderer = SessionRenderer::<FakeBackend>::new(SessionConfig {
        screenshot: true,
        ..Default::default()
    })
    .unwrap();
    let result = renderer.render("https://example.com/", &quick());
    assert_eq!(result.screenshot.as_deref(), Some(&[0x89, b'P', b'N', b'G'][..]));
}

#[test]
fn shutdown_is_idempotent() {
    let mut renderer = renderer();
    renderer.shutdown();
    renderer.shutdown();

    let after = renderer.render("https://example.com/", &quick());
    assert_eq!(after.error_kind, Some(ErrorKind::Configuration));
    assert!(after.error.unwrap().contains("shut down"));

    drop(renderer);
    calls(|p| {
        assert_eq!(p.browser_closed, 1);
        assert_eq!(p.stopped, 1);
        assert_eq!(p.launches, vec![BrowserEngine::Chromium]);
    });
}
