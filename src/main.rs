use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use crawlrender::backend::{self, BackendKind};
use crawlrender::extract::Extractor;
use crawlrender::settings::{MapSettings, Settings};
use crawlrender::user_agent::{CrawlRequest, MemoryStats, Request, UserAgentMiddleware};
use crawlrender::{Error, RenderOptions, Renderer, WaitUntil};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "crawlrender")]
#[command(author, version, about = "Render JavaScript pages through a crawler rendering backend")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Render one URL and print the result as JSON
    Render {
        url: String,

        /// Rendering backend (defaults to DEFAULT_JS_RENDERER, then splash)
        #[clap(short, long, value_enum)]
        backend: Option<Backend>,

        /// JSON file with crawler settings
        #[clap(long)]
        settings: Option<PathBuf>,

        #[clap(long)]
        splash_url: Option<String>,

        /// Browser engine for the cdp and webdriver backends
        #[clap(long)]
        browser: Option<String>,

        #[clap(long)]
        webdriver_url: Option<String>,

        /// Show the browser window
        #[clap(long)]
        headful: bool,

        #[clap(long, value_enum, default_value_t = WaitArg::Load)]
        wait_until: WaitArg,

        /// Seconds to pause after the page loaded
        #[clap(long, default_value_t = 2.0)]
        wait_time: f64,

        /// CSS selector that must appear before the page is captured
        #[clap(long)]
        selector: Option<String>,

        /// Render timeout in seconds
        #[clap(long)]
        timeout: Option<f64>,

        #[clap(long)]
        user_agent: Option<String>,

        /// Write a PNG screenshot to this path
        #[clap(long)]
        screenshot: Option<PathBuf>,

        /// Extract a field from the rendered page, as `name=css selector`
        #[clap(long = "extract", value_parser = parse_field)]
        fields: Vec<(String, String)>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Backend {
    Splash,
    Cdp,
    Devtools,
    Webdriver,
}

impl From<Backend> for BackendKind {
    fn from(b: Backend) -> Self {
        match b {
            Backend::Splash => BackendKind::Splash,
            Backend::Cdp => BackendKind::Cdp,
            Backend::Devtools => BackendKind::Devtools,
            Backend::Webdriver => BackendKind::WebDriver,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum WaitArg {
    Load,
    Domcontentloaded,
    Networkidle,
}

impl From<WaitArg> for WaitUntil {
    fn from(w: WaitArg) -> Self {
        match w {
            WaitArg::Load => WaitUntil::Load,
            WaitArg::Domcontentloaded => WaitUntil::DomContentLoaded,
            WaitArg::Networkidle => WaitUntil::NetworkIdle,
        }
    }
}

fn parse_field(s: &str) -> std::result::Result<(String, String), String> {
    match s.split_once('=') {
        Some((name, selector)) if !name.is_empty() && !selector.is_empty() => {
            Ok((name.to_string(), selector.to_string()))
        }
        _ => Err(format!("expected name=selector, got `{}`", s)),
    }
}

/// Pick an agent the way the crawl middleware would for this URL.
fn rotated_user_agent(settings: &MapSettings, url: &str) -> Result<Option<String>> {
    let mut middleware = match UserAgentMiddleware::from_settings(settings) {
        Ok(m) => m,
        Err(Error::NotConfigured(_)) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut stats = MemoryStats::new();
    middleware.crawl_started(&mut stats);
    let mut request = Request::new(url);
    middleware.process_request(&mut request, &mut stats);
    Ok(request.header("User-Agent").map(str::to_string))
}

fn seconds(value: f64, what: &str) -> Result<Duration> {
    Duration::try_from_secs_f64(value).with_context(|| format!("invalid {}: {}", what, value))
}

fn load_settings(path: Option<&PathBuf>) -> Result<MapSettings> {
    match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading settings {}", path.display()))?;
            Ok(MapSettings::from_json_str(&text)?)
        }
        None => Ok(MapSettings::new()),
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            process::exit(2);
        }
    }
}

/// Returns whether the render succeeded.
fn run(cli: Cli) -> Result<bool> {
    let Commands::Render {
        url,
        backend,
        settings,
        splash_url,
        browser,
        webdriver_url,
        headful,
        wait_until,
        wait_time,
        selector,
        timeout,
        user_agent,
        screenshot,
        fields,
    } = cli.command;

    let mut settings = load_settings(settings.as_ref())?;
    if let Some(v) = splash_url {
        settings.set("SPLASH_URL", v);
    }
    if let Some(v) = browser {
        settings.set("JS_RENDER_BROWSER", v);
    }
    if let Some(v) = webdriver_url {
        settings.set("WEBDRIVER_URL", v);
    }
    if let Some(v) = timeout {
        settings.set("JS_RENDER_TIMEOUT", v);
    }
    if headful {
        settings.set("JS_RENDER_HEADLESS", false);
    }
    if screenshot.is_some() {
        settings.set("JS_RENDER_SCREENSHOT", true);
    }

    let kind: BackendKind = match backend {
        Some(b) => b.into(),
        None => settings.get_str_or("DEFAULT_JS_RENDERER", "splash").parse()?,
    };
    let user_agent = match user_agent {
        Some(ua) => Some(ua),
        None => rotated_user_agent(&settings, &url)?,
    };

    let mut renderer = backend::build(kind, &settings)?;

    let options = RenderOptions {
        wait_time: Some(seconds(wait_time, "wait time")?).filter(|d| !d.is_zero()),
        wait_for_selector: selector,
        wait_until: wait_until.into(),
        user_agent,
        timeout: timeout.map(|t| seconds(t, "timeout")).transpose()?,
        ..Default::default()
    };

    let result = renderer.render(&url, &options);
    let stats = renderer.stats();
    renderer.shutdown();

    if let (Some(path), Some(png)) = (&screenshot, &result.screenshot) {
        std::fs::write(path, png).with_context(|| format!("writing screenshot {}", path.display()))?;
    }

    let mut output = serde_json::to_value(&result)?;
    if !fields.is_empty() && result.is_success() {
        let selectors: BTreeMap<String, String> = fields.into_iter().collect();
        let extracted = Extractor::new().extract_with_selectors(&result.html, &selectors, &HashMap::new());
        output["fields"] = serde_json::to_value(extracted)?;
    }
    println!("{}", serde_json::to_string_pretty(&output)?);
    eprintln!("{}", serde_json::to_string(&stats)?);
    Ok(result.is_success())
}
