//! Decide whether a plainly fetched page needs a JavaScript renderer.
//!
//! [`JsDetector`] looks at the raw HTML of a response; [`JsDomains`] remembers
//! which domains turned out to need rendering so later requests skip the
//! plain fetch. The registry is persisted as a JSON list of domains in the
//! file named by the `JS_DOMAINS_FILE` setting.

use crate::settings::Settings;
use crate::user_agent::domain_of;
use crate::{Error, Result};
use log::{debug, info, warn};
use regex::Regex;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};

/// Setting naming the JSON file the registry is loaded from and saved to
pub const JS_DOMAINS_FILE: &str = "JS_DOMAINS_FILE";

/// Detections on one domain before it is marked as requiring JS
pub const DETECTIONS_TO_MARK: u32 = 2;

/// Failed renders on one domain before rendering is switched off for it
pub const ERRORS_TO_UNMARK: u32 = 3;

/// Bodies shorter than this count as empty
const EMPTY_BODY_CHARS: usize = 200;

const MANY_SCRIPTS: usize = 5;
const SCRIPT_RATIO: f64 = 0.5;

/// Framework and loader fingerprints, matched against lowercased HTML
const JS_SIGNATURES: &[&str] = &[
    // Angular
    "ng-app", "ng-controller", "ng-view", "angular.module", "ng-bind",
    // React
    "reactroot", "react-root", "_reactrootcontainer", "react.", "_reactdom",
    // Vue
    "vue", "[v-", "v-if=", "v-for=", "v-bind", "vuejs",
    "ember", "backbone", "knockout",
    "single page application",
    "require.js", "requirejs", "systemjs", "webpack",
    "document.getelementbyid", "document.getelementsby", "window.location",
    "window.onload", "onreadystatechange", "domcontentloaded",
    "jquery", "fetch(", "axios.", "ajax", "xhr",
];

/// Head tags that, next to an empty body, point at client-side rendering
const EMPTY_BODY_HEAD_TAGS: &[&str] = &[
    "link rel=\"canonical\"",
    "meta name=\"description\"",
    "meta property=\"og:",
    "meta name=\"twitter:",
    "script src=",
];

const LOADER_PATTERNS: &[&str] = &[
    r#"<div[^>]*id=["']app["'][^>]*></div>"#,
    r#"<div[^>]*id=["']root["'][^>]*></div>"#,
    r#"<div[^>]*class=["']loading["'][^>]*>"#,
    r#"window\.onload\s*="#,
    r#"document\.addeventlistener\(["']domcontentloaded["']"#,
];

/// The rule that flagged a page
#[derive(Debug, Clone, PartialEq)]
pub enum JsSignal {
    /// Nearly empty body while the head carries page metadata
    EmptyBody { head_tag: &'static str },
    ManyScripts(usize),
    Signature(&'static str),
    LoaderPattern(&'static str),
    /// Inline script text makes up most of the document
    ScriptHeavy(f64),
    FewContentDivs { content_divs: usize, scripts: usize },
}

impl fmt::Display for JsSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JsSignal::EmptyBody { head_tag } => write!(f, "empty body with {} in head", head_tag),
            JsSignal::ManyScripts(n) => write!(f, "many script tags ({})", n),
            JsSignal::Signature(s) => write!(f, "signature '{}'", s),
            JsSignal::LoaderPattern(p) => write!(f, "loader pattern '{}'", p),
            JsSignal::ScriptHeavy(ratio) => write!(f, "script/content ratio {:.2}", ratio),
            JsSignal::FewContentDivs { content_divs, scripts } => {
                write!(f, "{} content divs with {} scripts", content_divs, scripts)
            }
        }
    }
}

/// Heuristic check for pages that only fill in their content with JavaScript
pub struct JsDetector {
    body: Regex,
    head: Regex,
    script: Regex,
    content_div: Regex,
    loaders: Vec<(&'static str, Regex)>,
}

/// Trimmed contents of the first capture group
fn section<'t>(re: &Regex, text: &'t str) -> Option<&'t str> {
    re.captures(text).and_then(|c| c.get(1)).map(|m| m.as_str().trim())
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| Error::Configuration(format!("invalid pattern {}: {}", pattern, e)))
}

impl JsDetector {
    pub fn new() -> Result<Self> {
        let loaders = LOADER_PATTERNS
            .iter()
            .map(|p| Ok((*p, compile(&format!("(?i){}", p))?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            body: compile(r"(?is)<body[^>]*>(.*?)</body>")?,
            head: compile(r"(?is)<head[^>]*>(.*?)</head>")?,
            script: compile(r"(?is)<script[^>]*>(.*?)</script>")?,
            content_div: compile(r#"(?i)<div[^>]*class=["'][^"']*content[^"']*["']"#)?,
            loaders,
        })
    }

    pub fn needs_js_rendering(&self, html: &str) -> bool {
        match self.signal(html) {
            Some(signal) => {
                debug!("Detected JS rendering need: {}", signal);
                true
            }
            None => false,
        }
    }

    /// The first rule that flags `html`, checked in a fixed order.
    pub fn signal(&self, html: &str) -> Option<JsSignal> {
        let text = html.to_lowercase();

        if let (Some(body), Some(head)) = (section(&self.body, &text), section(&self.head, &text)) {
            if body.len() < EMPTY_BODY_CHARS {
                if let Some(tag) = EMPTY_BODY_HEAD_TAGS.iter().copied().find(|t| head.contains(t)) {
                    return Some(JsSignal::EmptyBody { head_tag: tag });
                }
            }
        }

        let scripts = text.matches("<script").count();
        if scripts > MANY_SCRIPTS {
            return Some(JsSignal::ManyScripts(scripts));
        }

        if let Some(sig) = JS_SIGNATURES.iter().copied().find(|s| text.contains(s)) {
            return Some(JsSignal::Signature(sig));
        }

        if let Some(pattern) = self.loaders.iter().find(|(_, re)| re.is_match(&text)).map(|(p, _)| *p) {
            return Some(JsSignal::LoaderPattern(pattern));
        }

        if !text.is_empty() {
            let script_chars: usize = self
                .script
                .captures_iter(&text)
                .filter_map(|c| c.get(1))
                .map(|m| m.as_str().len())
                .sum();
            let ratio = script_chars as f64 / text.len() as f64;
            if script_chars > 0 && ratio > SCRIPT_RATIO {
                return Some(JsSignal::ScriptHeavy(ratio));
            }
        }

        let content_divs = self.content_div.find_iter(&text).count();
        if content_divs < 2 && scripts > 3 {
            return Some(JsSignal::FewContentDivs { content_divs, scripts });
        }

        None
    }
}

/// Domains known to need JavaScript rendering, with the counters that put
/// them there.
#[derive(Debug, Default)]
pub struct JsDomains {
    required: BTreeSet<String>,
    detections: HashMap<String, u32>,
    render_errors: HashMap<String, u32>,
    path: Option<PathBuf>,
}

impl JsDomains {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the registry from `path`. A missing file is an empty registry.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut domains = Self {
            path: Some(path.clone()),
            ..Self::default()
        };
        if !path.exists() {
            return Ok(domains);
        }
        let text = std::fs::read_to_string(&path)
            .map_err(|e| Error::Configuration(format!("reading {}: {}", path.display(), e)))?;
        let list: Vec<String> = serde_json::from_str(&text)
            .map_err(|e| Error::Configuration(format!("parsing {}: {}", path.display(), e)))?;
        domains.required = list.into_iter().collect();
        info!("Loaded {} JS domains from {}", domains.required.len(), path.display());
        Ok(domains)
    }

    /// Registry backed by `JS_DOMAINS_FILE`, or an in-memory one when unset.
    /// An unreadable file is logged and treated as empty.
    pub fn from_settings(settings: &dyn Settings) -> Self {
        let Some(path) = settings.get_str(JS_DOMAINS_FILE).filter(|p| !p.is_empty()) else {
            return Self::new();
        };
        Self::load(&path).unwrap_or_else(|e| {
            warn!("Error loading JS domains: {}", e);
            Self {
                path: Some(PathBuf::from(path)),
                ..Self::default()
            }
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Write the registry to its file; a no-op without one.
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Configuration(format!("creating {}: {}", parent.display(), e)))?;
        }
        let list: Vec<&String> = self.required.iter().collect();
        let json = serde_json::to_string(&list)
            .map_err(|e| Error::Configuration(format!("encoding JS domains: {}", e)))?;
        std::fs::write(path, json)
            .map_err(|e| Error::Configuration(format!("writing {}: {}", path.display(), e)))
    }

    pub fn js_required(&self, domain: &str) -> bool {
        self.required.contains(domain)
    }

    pub fn force_js_render(&mut self, domain: &str) {
        if self.required.insert(domain.to_string()) {
            info!("Forcing JS rendering for domain: {}", domain);
        }
    }

    /// Count one page on `domain` that needed rendering. Returns true when
    /// this detection marked the domain.
    pub fn record_detection(&mut self, domain: &str) -> bool {
        let count = self.detections.entry(domain.to_string()).or_insert(0);
        *count += 1;
        if *count >= DETECTIONS_TO_MARK && self.required.insert(domain.to_string()) {
            info!("Domain {} consistently requires JS rendering", domain);
            return true;
        }
        false
    }

    /// Count one failed render on `domain`. Returns true when rendering was
    /// switched off for it.
    pub fn record_render_error(&mut self, domain: &str) -> bool {
        let count = self.render_errors.entry(domain.to_string()).or_insert(0);
        *count += 1;
        if *count >= ERRORS_TO_UNMARK && self.required.remove(domain) {
            warn!("Too many rendering errors for {}, disabling JS rendering", domain);
            return true;
        }
        false
    }

    /// Whether a request to `url` should go straight to a renderer
    pub fn should_render(&self, url: &str) -> bool {
        domain_of(url).is_some_and(|d| self.js_required(&d))
    }

    /// Inspect a plainly fetched page and record the outcome for its domain.
    /// Returns whether the page needs rendering.
    pub fn observe(&mut self, detector: &JsDetector, url: &str, html: &str) -> bool {
        if !detector.needs_js_rendering(html) {
            return false;
        }
        if let Some(domain) = domain_of(url) {
            self.record_detection(&domain);
        }
        true
    }

    pub fn domains(&self) -> impl Iterator<Item = &str> {
        self.required.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.required.len()
    }

    pub fn is_empty(&self) -> bool {
        self.required.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::MapSettings;

    fn detector() -> JsDetector {
        JsDetector::new().unwrap()
    }

    fn prose(words: usize) -> String {
        "lorem ipsum dolor sit amet ".repeat(words)
    }

    fn temp_file(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("crawlrender-{}-{}", std::process::id(), name))
            .join("js_domains.json")
    }

    #[test]
    fn static_article_needs_no_rendering() {
        let html = format!(
            "<html><head><title>t</title></head><body><div class=\"content\">{}</div>\
             <div class=\"content\">{}</div></body></html>",
            prose(20),
            prose(20)
        );
        assert_eq!(detector().signal(&html), None);
        assert!(!detector().needs_js_rendering(&html));
    }

    #[test]
    fn empty_body_with_metadata_head() {
        let html = r#"<html><head><meta name="description" content="shop"></head><body><div></div></body></html>"#;
        assert_eq!(
            detector().signal(html),
            Some(JsSignal::EmptyBody {
                head_tag: "meta name=\"description\""
            })
        );
    }

    #[test]
    fn many_script_tags() {
        let html = format!("<html><body>{}{}</body></html>", prose(10), "<script>1</script>".repeat(6));
        assert_eq!(detector().signal(&html), Some(JsSignal::ManyScripts(6)));
    }

    #[test]
    fn framework_signature_is_case_insensitive() {
        let html = format!("<html><body><div ng-app=\"shop\">{}</div></body></html>", prose(10));
        assert_eq!(detector().signal(&html), Some(JsSignal::Signature("ng-app")));

        let html = format!("<html><body>{}<script>document.getElementById('x')</script></body></html>", prose(10));
        assert_eq!(detector().signal(&html), Some(JsSignal::Signature("document.getelementbyid")));
    }

    #[test]
    fn loader_placeholder() {
        let html = format!("<html><body><p>{}</p><div id=\"app\"></div></body></html>", prose(10));
        assert!(matches!(detector().signal(&html), Some(JsSignal::LoaderPattern(p)) if p.contains("app")));
    }

    #[test]
    fn script_heavy_document() {
        let html = format!("<html><body><p>hi</p><script>{}</script></body></html>", "var a = 1;".repeat(50));
        assert!(matches!(detector().signal(&html), Some(JsSignal::ScriptHeavy(r)) if r > 0.5));
    }

    #[test]
    fn scripts_without_content_divs() {
        let html = format!(
            "<html><body><div class=\"content\">{}</div>{}</body></html>",
            prose(20),
            "<script>1</script>".repeat(4)
        );
        assert_eq!(
            detector().signal(&html),
            Some(JsSignal::FewContentDivs {
                content_divs: 1,
                scripts: 4
            })
        );
    }

    #[test]
    fn domains_are_marked_after_repeated_detections() {
        let detector = detector();
        let mut domains = JsDomains::new();
        let spa = "<html><head><meta property=\"og:title\" content=\"x\"></head><body></body></html>";

        assert!(domains.observe(&detector, "https://spa.example.com/a", spa));
        assert!(!domains.should_render("https://spa.example.com/b"));
        assert!(domains.observe(&detector, "https://spa.example.com/c", spa));
        assert!(domains.should_render("https://spa.example.com/b"));
        assert!(!domains.should_render("https://other.example.com/"));
    }

    #[test]
    fn repeated_render_errors_unmark_a_domain() {
        let mut domains = JsDomains::new();
        domains.force_js_render("flaky.example.com");
        assert!(!domains.record_render_error("flaky.example.com"));
        assert!(!domains.record_render_error("flaky.example.com"));
        assert!(domains.record_render_error("flaky.example.com"));
        assert!(!domains.js_required("flaky.example.com"));
    }

    #[test]
    fn registry_round_trips_through_its_file() {
        let path = temp_file("registry");
        let _ = std::fs::remove_dir_all(path.parent().unwrap());

        let settings = {
            let mut s = MapSettings::new();
            s.set(JS_DOMAINS_FILE, path.to_string_lossy().to_string());
            s
        };
        let mut domains = JsDomains::from_settings(&settings);
        assert!(domains.is_empty());
        domains.force_js_render("b.example.com");
        domains.force_js_render("a.example.com:8080");
        domains.save().unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, r#"["a.example.com:8080","b.example.com"]"#);

        let reloaded = JsDomains::from_settings(&settings);
        assert_eq!(reloaded.domains().collect::<Vec<_>>(), vec!["a.example.com:8080", "b.example.com"]);
        assert!(reloaded.should_render("http://a.example.com:8080/x"));

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn corrupt_registry_file_starts_empty() {
        let path = temp_file("corrupt");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "not json").unwrap();

        assert!(matches!(JsDomains::load(&path), Err(Error::Configuration(_))));
        let mut settings = MapSettings::new();
        settings.set(JS_DOMAINS_FILE, path.to_string_lossy().to_string());
        let domains = JsDomains::from_settings(&settings);
        assert!(domains.is_empty());
        assert_eq!(domains.path(), Some(path.as_path()));

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn no_file_setting_keeps_registry_in_memory() {
        let mut domains = JsDomains::from_settings(&MapSettings::new());
        domains.force_js_render("example.com");
        assert!(domains.path().is_none());
        assert!(domains.save().is_ok());
    }
}
