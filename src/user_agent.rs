//! User-agent rotation for outgoing crawl requests.
//!
//! The middleware picks a `User-Agent` per request, per host or once per
//! crawl, and fills in the browser-like headers a real navigation would
//! send. Rendered requests pick up the chosen agent through
//! [`RenderOptions::user_agent`](crate::RenderOptions).

use crate::settings::Settings;
use crate::{Error, Result};
use log::{debug, info};
use rand::seq::SliceRandom;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

/// Stats key holding the number of requests that received an agent
pub const REQUESTS_WITH_UA: &str = "user_agent/requests_with_ua";
/// Stats key holding the agent chosen for a `per_crawl` run
pub const CRAWL_USER_AGENT: &str = "user_agent/crawl_user_agent";

/// Headers applied when the request does not already carry them
const DEFAULT_HEADERS: &[(&str, &str)] = &[
    ("Accept", "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8"),
    ("Accept-Language", "en-US,en;q=0.9"),
    ("Accept-Encoding", "gzip, deflate, br"),
    ("Connection", "keep-alive"),
    ("Upgrade-Insecure-Requests", "1"),
    ("Sec-Fetch-Dest", "document"),
    ("Sec-Fetch-Mode", "navigate"),
    ("Sec-Fetch-Site", "none"),
    ("Sec-Fetch-User", "?1"),
];

/// How often a new agent is drawn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RotationPolicy {
    PerRequest,
    #[default]
    PerDomain,
    PerCrawl,
}

impl RotationPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RotationPolicy::PerRequest => "per_request",
            RotationPolicy::PerDomain => "per_domain",
            RotationPolicy::PerCrawl => "per_crawl",
        }
    }
}

impl fmt::Display for RotationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RotationPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "per_request" => Ok(RotationPolicy::PerRequest),
            "per_domain" => Ok(RotationPolicy::PerDomain),
            "per_crawl" => Ok(RotationPolicy::PerCrawl),
            other => Err(Error::Configuration(format!(
                "Unknown user agent rotation policy: {}",
                other
            ))),
        }
    }
}

/// The parts of an outgoing request the middleware touches.
///
/// Header names compare case-insensitively.
pub trait CrawlRequest {
    fn url(&self) -> &str;
    fn header(&self, name: &str) -> Option<&str>;
    /// Replace any existing value for `name`
    fn set_header(&mut self, name: &str, value: &str);
    /// Make sure the request carries a (possibly empty) cookie jar
    fn ensure_cookie_jar(&mut self);
}

/// A plain outgoing request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Request {
    pub url: String,
    pub headers: HashMap<String, String>,
    pub cookies: Option<HashMap<String, String>>,
}

impl Request {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    fn header_key(&self, name: &str) -> Option<&String> {
        self.headers.keys().find(|k| k.eq_ignore_ascii_case(name))
    }
}

impl CrawlRequest for Request {
    fn url(&self) -> &str {
        &self.url
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.header_key(name)
            .and_then(|k| self.headers.get(k))
            .map(String::as_str)
    }

    fn set_header(&mut self, name: &str, value: &str) {
        if let Some(existing) = self.header_key(name).cloned() {
            self.headers.remove(&existing);
        }
        self.headers.insert(name.to_string(), value.to_string());
    }

    fn ensure_cookie_jar(&mut self) {
        self.cookies.get_or_insert_with(HashMap::new);
    }
}

/// Crawl-wide counters the middleware reports into
pub trait StatsSink {
    fn set_value(&mut self, key: &str, value: Value);
    fn inc_value(&mut self, key: &str);
}

/// A [`StatsSink`] kept in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryStats {
    values: HashMap<String, Value>,
}

impl MemoryStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_value(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }
}

impl StatsSink for MemoryStats {
    fn set_value(&mut self, key: &str, value: Value) {
        self.values.insert(key.to_string(), value);
    }

    fn inc_value(&mut self, key: &str) {
        let next = self.values.get(key).and_then(Value::as_u64).unwrap_or(0) + 1;
        self.values.insert(key.to_string(), next.into());
    }
}

/// Crawl lifecycle events the middleware listens for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrawlSignal {
    CrawlStarted,
    CrawlFinished,
}

/// Counters kept by the middleware itself
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RotationSummary {
    pub user_agents_used: usize,
    pub domains_with_custom_ua: usize,
    pub requests_with_ua: u64,
}

pub struct UserAgentMiddleware {
    user_agents: Vec<String>,
    policy: RotationPolicy,
    default_user_agent: Option<String>,
    domain_agents: HashMap<String, String>,
    crawl_agent: Option<String>,
    used: HashSet<String>,
    requests_with_ua: u64,
}

impl UserAgentMiddleware {
    pub fn new(user_agents: Vec<String>, policy: RotationPolicy, default_user_agent: Option<String>) -> Self {
        info!(
            "UserAgentMiddleware initialized with {} user agents (policy: {})",
            user_agents.len(),
            policy
        );
        Self {
            user_agents,
            policy,
            default_user_agent,
            domain_agents: HashMap::new(),
            crawl_agent: None,
            used: HashSet::new(),
            requests_with_ua: 0,
        }
    }

    /// Build from crawler settings.
    ///
    /// [`Error::NotConfigured`] when rotation is switched off or no agents
    /// are configured; callers leave the middleware out in that case.
    pub fn from_settings(settings: &dyn Settings) -> Result<Self> {
        if !settings.get_bool("ROTATE_USER_AGENT", true) {
            return Err(Error::NotConfigured(
                "UserAgentMiddleware is disabled (ROTATE_USER_AGENT=false)".into(),
            ));
        }
        let user_agents = settings.get_list("USER_AGENTS");
        if user_agents.is_empty() {
            return Err(Error::NotConfigured("USER_AGENTS setting is empty".into()));
        }
        let policy = settings
            .get_str("USER_AGENT_ROTATION_POLICY")
            .map(|p| p.parse::<RotationPolicy>())
            .transpose()?
            .unwrap_or_default();
        Ok(Self::new(
            user_agents,
            policy,
            settings.get_str("DEFAULT_USER_AGENT"),
        ))
    }

    pub fn policy(&self) -> RotationPolicy {
        self.policy
    }

    pub fn handle_signal(&mut self, signal: CrawlSignal, stats: &mut dyn StatsSink) {
        match signal {
            CrawlSignal::CrawlStarted => self.crawl_started(stats),
            CrawlSignal::CrawlFinished => self.crawl_finished(),
        }
    }

    pub fn crawl_started(&mut self, stats: &mut dyn StatsSink) {
        stats.set_value(REQUESTS_WITH_UA, 0.into());
        if self.policy == RotationPolicy::PerCrawl {
            if let Some(agent) = self.pick() {
                info!("Selected user agent for crawl: {}", agent);
                stats.set_value(CRAWL_USER_AGENT, agent.as_str().into());
                self.crawl_agent = Some(agent);
            }
        }
    }

    pub fn crawl_finished(&self) {
        let summary = self.summary();
        info!(
            "UserAgentMiddleware used {} different user agents for {} domains",
            summary.user_agents_used, summary.domains_with_custom_ua
        );
    }

    pub fn summary(&self) -> RotationSummary {
        RotationSummary {
            user_agents_used: self.used.len(),
            domains_with_custom_ua: self.domain_agents.len(),
            requests_with_ua: self.requests_with_ua,
        }
    }

    /// Apply the agent and default headers to an outgoing request.
    ///
    /// The agent always replaces whatever the request carried; the other
    /// headers only fill gaps.
    pub fn process_request(&mut self, request: &mut dyn CrawlRequest, stats: &mut dyn StatsSink) {
        if let Some(agent) = self.agent_for(request.url()) {
            request.set_header("User-Agent", &agent);
            self.requests_with_ua += 1;
            stats.inc_value(REQUESTS_WITH_UA);
            debug!("Applied User-Agent: {} for {}", agent, request.url());
            self.used.insert(agent);
        }

        for (name, value) in DEFAULT_HEADERS {
            if request.header(name).is_none() {
                request.set_header(name, value);
            }
        }
        request.ensure_cookie_jar();
    }

    fn pick(&self) -> Option<String> {
        self.user_agents.choose(&mut rand::thread_rng()).cloned()
    }

    fn agent_for(&mut self, url: &str) -> Option<String> {
        if self.user_agents.is_empty() {
            return self.default_user_agent.clone();
        }
        match self.policy {
            RotationPolicy::PerRequest => self.pick(),
            RotationPolicy::PerDomain => match domain_of(url) {
                Some(domain) => {
                    if let Some(agent) = self.domain_agents.get(&domain) {
                        return Some(agent.clone());
                    }
                    let agent = self.pick()?;
                    self.domain_agents.insert(domain, agent.clone());
                    Some(agent)
                }
                None => self.pick(),
            },
            RotationPolicy::PerCrawl => {
                if self.crawl_agent.is_none() {
                    self.crawl_agent = self.pick();
                }
                self.crawl_agent.clone()
            }
        }
    }
}

/// `host[:port]` of a URL, `None` when it has no host
pub(crate) fn domain_of(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    Some(match parsed.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::MapSettings;

    fn agents() -> Vec<String> {
        (1..=5).map(|i| format!("agent-{}", i)).collect()
    }

    #[test]
    fn from_settings_disabled_or_empty() {
        let mut settings = MapSettings::new();
        let err = UserAgentMiddleware::from_settings(&settings).err().unwrap();
        assert!(matches!(err, Error::NotConfigured(_)));

        settings.set("USER_AGENTS", serde_json::json!(["a", "b"]));
        settings.set("ROTATE_USER_AGENT", false);
        let err = UserAgentMiddleware::from_settings(&settings).err().unwrap();
        assert!(matches!(err, Error::NotConfigured(_)));

        settings.set("ROTATE_USER_AGENT", true);
        let mw = UserAgentMiddleware::from_settings(&settings).unwrap();
        assert_eq!(mw.policy(), RotationPolicy::PerDomain);
    }

    #[test]
    fn unknown_policy_is_rejected() {
        let mut settings = MapSettings::new();
        settings
            .set("USER_AGENTS", "a,b")
            .set("USER_AGENT_ROTATION_POLICY", "per_moon");
        let err = UserAgentMiddleware::from_settings(&settings).err().unwrap();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn per_domain_is_sticky() {
        let mut mw = UserAgentMiddleware::new(agents(), RotationPolicy::PerDomain, None);
        let mut stats = MemoryStats::new();
        mw.crawl_started(&mut stats);

        let mut first = Request::new("https://example.com/a");
        mw.process_request(&mut first, &mut stats);
        for path in ["/b", "/c?q=1", "/d#x"] {
            let mut req = Request::new(format!("https://example.com{}", path));
            mw.process_request(&mut req, &mut stats);
            assert_eq!(req.header("user-agent"), first.header("User-Agent"));
        }
        let mut other = Request::new("https://example.org/");
        mw.process_request(&mut other, &mut stats);

        let summary = mw.summary();
        assert_eq!(summary.domains_with_custom_ua, 2);
        assert_eq!(summary.requests_with_ua, 5);
        assert_eq!(stats.get_value(REQUESTS_WITH_UA), Some(&Value::from(5u64)));
    }

    #[test]
    fn per_crawl_uses_one_agent() {
        let mut mw = UserAgentMiddleware::new(agents(), RotationPolicy::PerCrawl, None);
        let mut stats = MemoryStats::new();
        mw.handle_signal(CrawlSignal::CrawlStarted, &mut stats);
        let chosen = stats.get_value(CRAWL_USER_AGENT).and_then(Value::as_str).unwrap().to_string();

        for url in ["https://a.com/", "https://b.com/", "not a url"] {
            let mut req = Request::new(url);
            mw.process_request(&mut req, &mut stats);
            assert_eq!(req.header("User-Agent"), Some(chosen.as_str()));
        }
        assert_eq!(mw.summary().user_agents_used, 1);
        mw.handle_signal(CrawlSignal::CrawlFinished, &mut stats);
    }

    #[test]
    fn per_request_draws_from_the_list() {
        let list = agents();
        let mut mw = UserAgentMiddleware::new(list.clone(), RotationPolicy::PerRequest, None);
        let mut stats = MemoryStats::new();
        for _ in 0..20 {
            let mut req = Request::new("https://example.com/");
            mw.process_request(&mut req, &mut stats);
            let ua = req.header("User-Agent").unwrap().to_string();
            assert!(list.contains(&ua));
        }
    }

    #[test]
    fn default_headers_fill_gaps_only() {
        let mut mw = UserAgentMiddleware::new(agents(), RotationPolicy::PerRequest, None);
        let mut stats = MemoryStats::new();
        let mut req = Request::new("https://example.com/");
        req.set_header("accept-language", "de-DE");
        req.set_header("User-Agent", "custom/1.0");
        mw.process_request(&mut req, &mut stats);

        assert_eq!(req.header("Accept-Language"), Some("de-DE"));
        assert_ne!(req.header("User-Agent"), Some("custom/1.0"));
        assert_eq!(req.header("Sec-Fetch-User"), Some("?1"));
        assert_eq!(req.headers.len(), DEFAULT_HEADERS.len() + 1);
        assert_eq!(req.cookies, Some(HashMap::new()));
    }

    #[test]
    fn empty_list_falls_back_to_default_agent() {
        let mut mw = UserAgentMiddleware::new(Vec::new(), RotationPolicy::PerDomain, Some("fallback/1".into()));
        let mut stats = MemoryStats::new();
        let mut req = Request::new("https://example.com/");
        mw.process_request(&mut req, &mut stats);
        assert_eq!(req.header("User-Agent"), Some("fallback/1"));

        let mut none = UserAgentMiddleware::new(Vec::new(), RotationPolicy::PerDomain, None);
        let mut req = Request::new("https://example.com/");
        none.process_request(&mut req, &mut stats);
        assert_eq!(req.header("User-Agent"), None);
        assert_eq!(none.summary().requests_with_ua, 0);
    }

    #[test]
    fn domain_includes_port() {
        assert_eq!(domain_of("http://localhost:8050/x").as_deref(), Some("localhost:8050"));
        assert_eq!(domain_of("https://Example.com/").as_deref(), Some("example.com"));
        assert_eq!(domain_of("data:text/html,hi"), None);
    }
}
