//! Compliance gate in front of every dispatch.
//!
//! robots.txt directives are fetched once per host and cached; concurrent
//! first lookups for a host share a single fetch. Crawl delays are enforced
//! with one async lock per host so requests to the same host queue in arrival
//! order while other hosts proceed.

mod dns;
mod robots;

pub use dns::{
    BrowserProxySettings, DnsLeak, DnsLeakAuditor, LeakKind, LeakReport, LeakSeverity,
    NetworkProfile, SECURE_DNS_SERVERS, WebRtcConfig, parse_resolv_conf,
};
pub use robots::{RobotsDirectives, RobotsGroup};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use http::HeaderValue;
use http::header::USER_AGENT;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use url::Url;

use crate::config::duration_ms;
use crate::dispatch::{ProxyRequest, ProxyTransport};

/// What to assume when robots.txt cannot be retrieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    Open,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ComplianceConfig {
    pub respect_robots: bool,
    pub user_agent: String,
    #[serde(with = "duration_ms")]
    pub fetch_timeout: Duration,
    pub failure_policy: FailurePolicy,
    /// Refetch directives older than this. Unset keeps them for the engine lifetime.
    #[serde(with = "duration_ms::option")]
    pub cache_ttl: Option<Duration>,
}

impl Default for ComplianceConfig {
    fn default() -> Self {
        Self {
            respect_robots: true,
            user_agent: "ProxyEthica/1.0".to_string(),
            fetch_timeout: Duration::from_secs(5),
            failure_policy: FailurePolicy::Open,
            cache_ttl: None,
        }
    }
}

struct CacheEntry {
    directives: OnceCell<Arc<RobotsDirectives>>,
    created: Instant,
}

impl CacheEntry {
    fn new() -> Self {
        Self {
            directives: OnceCell::new(),
            created: Instant::now(),
        }
    }
}

type DelaySlot = Arc<tokio::sync::Mutex<Option<tokio::time::Instant>>>;

pub struct CompliancePolicy {
    config: ComplianceConfig,
    transport: Arc<dyn ProxyTransport>,
    cache: Mutex<HashMap<String, Arc<CacheEntry>>>,
    delays: Mutex<HashMap<String, DelaySlot>>,
}

impl CompliancePolicy {
    pub fn new(config: ComplianceConfig, transport: Arc<dyn ProxyTransport>) -> Self {
        Self {
            config,
            transport,
            cache: Mutex::new(HashMap::new()),
            delays: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ComplianceConfig {
        &self.config
    }

    /// Directives for the host of `url`, fetching them on first use.
    pub async fn fetch(&self, url: &Url) -> Arc<RobotsDirectives> {
        let host = url.host_str().unwrap_or_default().to_string();
        let entry = {
            let mut cache = self.cache.lock().expect("robots cache lock poisoned");
            match cache.get(&host) {
                Some(entry) if !self.is_stale(entry) => entry.clone(),
                _ => {
                    let entry = Arc::new(CacheEntry::new());
                    cache.insert(host.clone(), entry.clone());
                    entry
                }
            }
        };

        entry
            .directives
            .get_or_init(|| async { Arc::new(self.download(url).await) })
            .await
            .clone()
    }

    fn is_stale(&self, entry: &CacheEntry) -> bool {
        self.config
            .cache_ttl
            .is_some_and(|ttl| entry.directives.initialized() && entry.created.elapsed() >= ttl)
    }

    async fn download(&self, url: &Url) -> RobotsDirectives {
        let fallback = || match self.config.failure_policy {
            FailurePolicy::Open => RobotsDirectives::allow_all(),
            FailurePolicy::Closed => RobotsDirectives::deny_all(),
        };

        let robots_url = match robots_url(url) {
            Some(robots_url) => robots_url,
            None => return fallback(),
        };

        let mut request = ProxyRequest::get(robots_url.clone()).with_timeout(self.config.fetch_timeout);
        if let Ok(value) = HeaderValue::from_str(&self.config.user_agent) {
            request = request.with_header(USER_AGENT, value);
        }

        let outcome =
            tokio::time::timeout(self.config.fetch_timeout, self.transport.send(None, &request)).await;
        match outcome {
            Ok(Ok(response)) if (200..300).contains(&response.status) => {
                let body = String::from_utf8_lossy(&response.body);
                log::debug!("fetched {robots_url} ({} bytes)", response.body.len());
                RobotsDirectives::parse(&body)
            }
            Ok(Ok(response)) => {
                log::debug!("{robots_url} returned {}", response.status);
                fallback()
            }
            Ok(Err(err)) => {
                log::warn!("failed to fetch {robots_url}: {err}");
                fallback()
            }
            Err(_) => {
                log::warn!("timed out fetching {robots_url}");
                fallback()
            }
        }
    }

    pub async fn is_allowed(&self, url: &Url) -> bool {
        if !self.config.respect_robots {
            return true;
        }
        let directives = self.fetch(url).await;
        let path = match url.query() {
            Some(query) => format!("{}?{query}", url.path()),
            None => url.path().to_string(),
        };
        let allowed = directives.is_allowed(&self.config.user_agent, &path);
        if !allowed {
            log::info!("robots.txt disallows {}", url.as_str());
        }
        allowed
    }

    /// Cached crawl delay for `host`; `None` until its directives are fetched.
    pub fn crawl_delay(&self, host: &str) -> Option<Duration> {
        let entry = self
            .cache
            .lock()
            .expect("robots cache lock poisoned")
            .get(host)
            .cloned()?;
        entry
            .directives
            .get()
            .and_then(|directives| directives.crawl_delay(&self.config.user_agent))
    }

    /// Wait until `host` may be contacted again, then claim the slot.
    /// Returns how long the caller waited.
    pub async fn wait_for_delay(&self, host: &str) -> Duration {
        let Some(delay) = self.crawl_delay(host).filter(|d| !d.is_zero()) else {
            return Duration::ZERO;
        };
        let slot = {
            let mut delays = self.delays.lock().expect("crawl delay lock poisoned");
            delays
                .entry(host.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(None)))
                .clone()
        };

        let mut last = slot.lock().await;
        let mut waited = Duration::ZERO;
        if let Some(previous) = *last {
            let ready = previous + delay;
            let now = tokio::time::Instant::now();
            if ready > now {
                waited = ready - now;
                log::debug!("waiting {}ms for crawl delay on {host}", waited.as_millis());
                tokio::time::sleep_until(ready).await;
            }
        }
        *last = Some(tokio::time::Instant::now());
        waited
    }

    /// Drop cached directives so the next lookup refetches.
    pub fn clear_cache(&self) {
        self.cache.lock().expect("robots cache lock poisoned").clear();
    }
}

fn robots_url(url: &Url) -> Option<Url> {
    let host = url.host_str()?;
    let raw = match url.port() {
        Some(port) => format!("{}://{host}:{port}/robots.txt", url.scheme()),
        None => format!("{}://{host}/robots.txt", url.scheme()),
    };
    Url::parse(&raw).ok()
}
