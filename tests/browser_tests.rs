//! Real-browser smoke tests; need a local Chrome.
//!
//! Run with `cargo test --features cdp,devtools -- --ignored`.

#![cfg(any(feature = "cdp", feature = "devtools"))]

mod common;

use common::{FakeServer, Reply};
use crawlrender::{RenderOptions, Renderer};
use std::time::Duration;

const PAGE: &str = r#"<!doctype html>
<html><head><title>fixture</title></head>
<body>
<div id="static">static</div>
<script>
  setTimeout(function () {
    var el = document.createElement('p');
    el.id = 'late';
    el.textContent = navigator.userAgent;
    document.body.appendChild(el);
  }, 300);
</script>
</body></html>"#;

fn page_server() -> FakeServer {
    FakeServer::start(|_| Reply::html(PAGE))
}

fn waiting_for_late() -> RenderOptions {
    RenderOptions {
        wait_time: None,
        wait_for_selector: Some("#late".into()),
        timeout: Some(Duration::from_secs(20)),
        ..Default::default()
    }
}

#[cfg(feature = "cdp")]
#[test]
#[ignore = "needs a local Chrome"]
fn cdp_renders_script_output() {
    use crawlrender::cdp::CdpBackend;
    use crawlrender::session::{SessionConfig, SessionRenderer};

    let server = page_server();
    let mut renderer = SessionRenderer::<CdpBackend>::new(SessionConfig::default()).unwrap();

    let custom = RenderOptions {
        user_agent: Some("crawlrender-test/1.0".into()),
        ..waiting_for_late()
    };
    let result = renderer.render(&format!("{}/", server.base), &custom);
    assert!(result.is_success(), "{:?}", result.error);
    assert!(result.html.contains("id=\"late\""));
    assert!(result.html.contains("crawlrender-test/1.0"));

    let plain = renderer.render(&format!("{}/", server.base), &waiting_for_late());
    assert!(plain.is_success(), "{:?}", plain.error);
    assert!(!plain.html.contains("crawlrender-test/1.0"));

    renderer.shutdown();
    renderer.shutdown();
}

#[cfg(feature = "devtools")]
#[test]
#[ignore = "needs a local Chrome"]
fn devtools_renders_script_output() {
    use crawlrender::devtools::{ChromiumBrowser, DevtoolsConfig, DevtoolsRenderer};

    let server = page_server();
    let mut renderer = DevtoolsRenderer::<ChromiumBrowser>::new(DevtoolsConfig::default()).unwrap();
    assert!(renderer.owns_event_loop());

    let result = renderer.render(&format!("{}/", server.base), &waiting_for_late());
    assert!(result.is_success(), "{:?}", result.error);
    assert!(result.html.contains("id=\"late\""));
    assert_eq!(result.status_code, 200);

    let missing = RenderOptions {
        wait_for_selector: Some("#never".into()),
        timeout: Some(Duration::from_secs(2)),
        ..waiting_for_late()
    };
    let timed_out = renderer.render(&format!("{}/", server.base), &missing);
    assert!(timed_out.error.unwrap().starts_with("Timeout rendering URL"));

    renderer.shutdown();
}
