//! Proxy endpoint registry.
//!
//! Owns the endpoint table and its status machine:
//!
//! ```text
//! available --lease--> active --release--> available
//!     \                   |
//!      +--- health fail --+--> degraded --recover--> available | active
//!      +--- allowance 0 ------> exhausted (until deregistered)
//! ```
//!
//! Selection and activation happen in one critical section, so an endpoint
//! is never leased to two callers at once.

mod health;

pub use health::HealthTarget;

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use url::Url;

use super::events::{EngineEvent, EventDispatcher, ProxySelectedEvent, ProxyStatusEvent};
use super::quality::{PerformanceSnapshot, QualityScorer};
use crate::config::duration_ms;
use crate::dispatch::{ProxyRoute, ProxyTransport};

/// Pools larger than this rotate randomly; smaller pools walk registration order.
const RANDOM_ROTATION_MIN_POOL: usize = 3;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("invalid endpoint: {0}")]
    Validation(String),
    #[error("unknown endpoint {0}")]
    NotFound(String),
    #[error("no endpoint available: {0}")]
    Exhausted(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Socks5,
}

impl Protocol {
    /// URL scheme used to reach the proxy. Remote DNS only applies to SOCKS.
    pub fn scheme(&self, remote_dns: bool) -> &'static str {
        match (self, remote_dns) {
            (Protocol::Http, _) => "http",
            (Protocol::Socks5, false) => "socks5",
            (Protocol::Socks5, true) => "socks5h",
        }
    }

    pub fn from_scheme(scheme: &str) -> Result<Self, RegistryError> {
        match scheme.to_ascii_lowercase().as_str() {
            "http" => Ok(Protocol::Http),
            "socks5" | "socks5h" => Ok(Protocol::Socks5),
            "https" => Err(RegistryError::Validation(
                "https proxies are not supported, use http or socks5".into(),
            )),
            other => Err(RegistryError::Validation(format!(
                "unsupported proxy scheme '{other}'"
            ))),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme(false))
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &crate::masking::MASK)
            .field("password", &crate::masking::MASK)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointStatus {
    Available,
    Active,
    Degraded,
    Exhausted,
}

impl EndpointStatus {
    /// Whether traffic may keep flowing through an endpoint in this state.
    pub fn is_usable(self) -> bool {
        matches!(self, EndpointStatus::Available | EndpointStatus::Active)
    }
}

impl fmt::Display for EndpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EndpointStatus::Available => "available",
            EndpointStatus::Active => "active",
            EndpointStatus::Degraded => "degraded",
            EndpointStatus::Exhausted => "exhausted",
        };
        f.write_str(name)
    }
}

/// Registration input, deserializable from configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointSpec {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: Protocol,
    #[serde(default)]
    pub credentials: Option<Credentials>,
    #[serde(default)]
    pub region: Option<String>,
    /// Total allowance in megabytes; `None` is unlimited.
    #[serde(default)]
    pub bandwidth_limit_mb: Option<f64>,
    #[serde(default)]
    pub health_path: Option<String>,
    #[serde(default, with = "duration_ms::option")]
    pub health_timeout: Option<Duration>,
}

fn default_protocol() -> Protocol {
    Protocol::Http
}

impl EndpointSpec {
    pub fn new(host: impl Into<String>, port: u16, protocol: Protocol) -> Self {
        Self {
            host: host.into(),
            port,
            protocol,
            credentials: None,
            region: None,
            bandwidth_limit_mb: None,
            health_path: None,
            health_timeout: None,
        }
    }

    /// Parse `scheme://[user:pass@]host:port`.
    pub fn from_url(raw: &str) -> Result<Self, RegistryError> {
        let url = Url::parse(raw).map_err(|err| {
            RegistryError::Validation(format!(
                "{}: {err}",
                crate::masking::mask_credentials(raw)
            ))
        })?;
        let protocol = Protocol::from_scheme(url.scheme())?;
        let host = url
            .host_str()
            .ok_or_else(|| RegistryError::Validation("proxy URL has no host".into()))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = url
            .port()
            .ok_or_else(|| RegistryError::Validation(format!("proxy URL for {host} has no port")))?;

        let mut spec = Self::new(host, port, protocol);
        if !url.username().is_empty() {
            spec.credentials = Some(Credentials {
                username: url.username().to_string(),
                password: url.password().unwrap_or_default().to_string(),
            });
        }
        Ok(spec)
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(Credentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    pub fn with_bandwidth_limit(mut self, mb: f64) -> Self {
        self.bandwidth_limit_mb = Some(mb);
        self
    }

    pub fn id(&self) -> String {
        endpoint_id(&self.host, self.port)
    }

    fn validate(&self) -> Result<(), RegistryError> {
        if self.host.is_empty() || self.host.chars().any(char::is_whitespace) {
            return Err(RegistryError::Validation(format!(
                "host '{}' must be non-empty without whitespace",
                self.host
            )));
        }
        if self.port == 0 {
            return Err(RegistryError::Validation(format!("{}: port must be non-zero", self.host)));
        }
        if let Some(limit) = self.bandwidth_limit_mb
            && !(limit > 0.0)
        {
            return Err(RegistryError::Validation(format!(
                "{}: bandwidth limit must be positive",
                self.id()
            )));
        }
        Ok(())
    }
}

fn endpoint_id(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProxyEndpoint {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
    #[serde(skip)]
    pub credentials: Option<Credentials>,
    pub region: Option<String>,
    pub status: EndpointStatus,
    /// Held by a session or an in-flight call.
    pub leased: bool,
    pub performance: PerformanceSnapshot,
    pub bandwidth_remaining_mb: Option<f64>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub health_path: String,
    #[serde(with = "duration_ms")]
    pub health_timeout: Duration,
    pub registered_at: DateTime<Utc>,
}

impl ProxyEndpoint {
    /// Proxy URL with credentials, for the transport only.
    pub fn proxy_url(&self, protocol: Protocol, remote_dns: bool) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        match &self.credentials {
            Some(creds) => format!(
                "{}://{}:{}@{}:{}",
                protocol.scheme(remote_dns),
                creds.username,
                creds.password,
                host,
                self.port
            ),
            None => format!("{}://{}:{}", protocol.scheme(remote_dns), host, self.port),
        }
    }

    pub fn masked_url(&self) -> String {
        crate::masking::mask_credentials(&self.proxy_url(self.protocol, false))
    }

    /// Route through this endpoint, optionally forcing another protocol.
    pub fn route(&self, protocol: Option<Protocol>, remote_dns: bool) -> ProxyRoute {
        let protocol = protocol.unwrap_or(self.protocol);
        ProxyRoute {
            endpoint_id: self.id.clone(),
            proxy_url: self.proxy_url(protocol, remote_dns),
            protocol,
        }
    }

    pub fn health_url(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        format!("http://{}:{}{}", host, self.port, self.health_path)
    }
}

/// Filters applied by [`ProxyRegistry::select_best`] and [`ProxyRegistry::rotate`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionRequirements {
    pub region: Option<String>,
    /// Region tried when nothing in `region` qualifies.
    pub fallback_region: Option<String>,
    pub protocol: Option<Protocol>,
    pub min_success_rate: Option<f64>,
    pub max_avg_latency_ms: Option<f64>,
}

impl SelectionRequirements {
    pub fn in_region(region: impl Into<String>) -> Self {
        Self {
            region: Some(region.into()),
            ..Default::default()
        }
    }

    fn accepts(&self, endpoint: &ProxyEndpoint) -> bool {
        if let Some(protocol) = self.protocol
            && endpoint.protocol != protocol
        {
            return false;
        }
        if let Some(min) = self.min_success_rate
            && endpoint.performance.success_rate < min
        {
            return false;
        }
        if let Some(max) = self.max_avg_latency_ms
            && endpoint.performance.total_requests > 0
            && endpoint.performance.avg_latency_ms > max
        {
            return false;
        }
        true
    }
}

fn region_matches(endpoint: &ProxyEndpoint, region: &str) -> bool {
    endpoint
        .region
        .as_deref()
        .is_some_and(|r| r.eq_ignore_ascii_case(region))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    #[serde(with = "duration_ms")]
    pub health_interval: Duration,
    #[serde(with = "duration_ms")]
    pub default_health_timeout: Duration,
    pub default_health_path: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            health_interval: Duration::from_secs(30),
            default_health_timeout: Duration::from_secs(5),
            default_health_path: "/health".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolReport {
    pub total: usize,
    pub available: usize,
    pub active: usize,
    pub degraded: usize,
    pub exhausted: usize,
    pub endpoints: Vec<ProxyEndpoint>,
}

/// A freshly leased endpoint whose `proxy.selected` event is still owed.
///
/// Callers that lease while holding their own lock send the event with
/// [`ProxyRegistry::announce`] once that lock is released.
#[derive(Debug, Clone)]
#[must_use]
pub struct PendingSelection {
    pub endpoint: ProxyEndpoint,
    pub score: f64,
}

/// Authoritative endpoint table.
pub struct ProxyRegistry {
    name: String,
    config: RegistryConfig,
    scorer: Arc<QualityScorer>,
    transport: Arc<dyn ProxyTransport>,
    events: Arc<EventDispatcher>,
    // Registration order is the deterministic rotation order.
    endpoints: Mutex<Vec<ProxyEndpoint>>,
}

impl fmt::Debug for ProxyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyRegistry")
            .field("name", &self.name)
            .field("endpoints", &self.len())
            .finish()
    }
}

impl ProxyRegistry {
    pub fn new(
        name: impl Into<String>,
        config: RegistryConfig,
        scorer: Arc<QualityScorer>,
        transport: Arc<dyn ProxyTransport>,
        events: Arc<EventDispatcher>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            scorer,
            transport,
            events,
            endpoints: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn scorer(&self) -> &Arc<QualityScorer> {
        &self.scorer
    }

    pub fn len(&self) -> usize {
        self.endpoints.lock().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: &str) -> Option<ProxyEndpoint> {
        let table = self.endpoints.lock().expect("registry lock poisoned");
        table.iter().find(|e| e.id == id).cloned()
    }

    fn build(&self, spec: EndpointSpec) -> ProxyEndpoint {
        let id = spec.id();
        ProxyEndpoint {
            id,
            host: spec.host,
            port: spec.port,
            protocol: spec.protocol,
            credentials: spec.credentials,
            region: spec.region,
            status: EndpointStatus::Available,
            leased: false,
            performance: PerformanceSnapshot::default(),
            bandwidth_remaining_mb: spec.bandwidth_limit_mb,
            last_used_at: None,
            health_path: spec
                .health_path
                .unwrap_or_else(|| self.config.default_health_path.clone()),
            health_timeout: spec
                .health_timeout
                .unwrap_or(self.config.default_health_timeout),
            registered_at: Utc::now(),
        }
    }

    pub fn register(&self, spec: EndpointSpec) -> Result<String, RegistryError> {
        spec.validate()?;
        let endpoint = self.build(spec);
        let id = endpoint.id.clone();
        let mut table = self.endpoints.lock().expect("registry lock poisoned");
        if table.iter().any(|e| e.id == id) {
            return Err(RegistryError::Validation(format!("duplicate endpoint {id}")));
        }
        log::debug!("[{}] registered {}", self.name, endpoint.masked_url());
        table.push(endpoint);
        Ok(id)
    }

    /// Register a batch. Any invalid entry rejects the whole batch; duplicates
    /// are skipped. Returns the number of endpoints added.
    pub fn load_pool<I>(&self, specs: I) -> Result<usize, RegistryError>
    where
        I: IntoIterator<Item = EndpointSpec>,
    {
        let specs: Vec<EndpointSpec> = specs.into_iter().collect();
        for spec in &specs {
            spec.validate()?;
        }

        let mut table = self.endpoints.lock().expect("registry lock poisoned");
        let mut added = 0;
        for spec in specs {
            let id = spec.id();
            if table.iter().any(|e| e.id == id) {
                log::warn!("[{}] skipping duplicate endpoint {id}", self.name);
                continue;
            }
            table.push(self.build(spec));
            added += 1;
        }
        Ok(added)
    }

    pub fn deregister(&self, id: &str) -> Result<ProxyEndpoint, RegistryError> {
        let removed = {
            let mut table = self.endpoints.lock().expect("registry lock poisoned");
            let index = table
                .iter()
                .position(|e| e.id == id)
                .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
            table.remove(index)
        };
        self.scorer.forget(id);
        log::debug!("[{}] deregistered {}", self.name, removed.masked_url());
        Ok(removed)
    }

    fn candidates(table: &[ProxyEndpoint], requirements: &SelectionRequirements, exclude: Option<&str>) -> Vec<usize> {
        let eligible = |e: &ProxyEndpoint| {
            e.status == EndpointStatus::Available
                && !e.leased
                && Some(e.id.as_str()) != exclude
                && requirements.accepts(e)
        };

        let in_region = |region: Option<&str>| -> Vec<usize> {
            table
                .iter()
                .enumerate()
                .filter(|(_, e)| eligible(e) && region.is_none_or(|r| region_matches(e, r)))
                .map(|(idx, _)| idx)
                .collect()
        };

        let primary = in_region(requirements.region.as_deref());
        if primary.is_empty()
            && let Some(fallback) = requirements.fallback_region.as_deref()
        {
            return in_region(Some(fallback));
        }
        primary
    }

    fn lease(endpoint: &mut ProxyEndpoint) {
        endpoint.status = EndpointStatus::Active;
        endpoint.leased = true;
        endpoint.last_used_at = Some(Utc::now());
    }

    fn unlease(endpoint: &mut ProxyEndpoint) {
        endpoint.leased = false;
        if endpoint.status == EndpointStatus::Active {
            endpoint.status = EndpointStatus::Available;
        }
    }

    /// Pick the best available endpoint and lease it.
    pub fn select_best(&self, requirements: &SelectionRequirements) -> Result<ProxyEndpoint, RegistryError> {
        let selection = self.lease_best(requirements)?;
        self.announce(&selection);
        Ok(selection.endpoint)
    }

    /// Like [`select_best`](Self::select_best) without emitting the event.
    pub fn lease_best(&self, requirements: &SelectionRequirements) -> Result<PendingSelection, RegistryError> {
        let mut table = self.endpoints.lock().expect("registry lock poisoned");
        let mut candidates = Self::candidates(&table, requirements, None);
        if candidates.is_empty() {
            return Err(self.no_candidate(&table, requirements));
        }

        let healthy: Vec<usize> = candidates
            .iter()
            .copied()
            .filter(|&idx| !self.scorer.has_degraded(&table[idx].id))
            .collect();
        if !healthy.is_empty() {
            candidates = healthy;
        }

        let mut scored: Vec<(usize, f64)> = candidates
            .into_iter()
            .map(|idx| (idx, self.scorer.score(&table[idx].id)))
            .collect();
        scored.sort_by(|(a, sa), (b, sb)| {
            sb.partial_cmp(sa)
                .unwrap_or(Ordering::Equal)
                .then_with(|| table[*a].last_used_at.cmp(&table[*b].last_used_at))
        });

        let (index, score) = scored[0];
        Self::lease(&mut table[index]);
        Ok(PendingSelection {
            endpoint: table[index].clone(),
            score,
        })
    }

    pub fn announce(&self, selection: &PendingSelection) {
        self.events.dispatch(EngineEvent::ProxySelected(ProxySelectedEvent {
            endpoint_id: selection.endpoint.id.clone(),
            score: selection.score,
            region: selection.endpoint.region.clone(),
            timestamp: Utc::now(),
        }));
    }

    fn no_candidate(&self, table: &[ProxyEndpoint], requirements: &SelectionRequirements) -> RegistryError {
        if table.is_empty() {
            return RegistryError::Exhausted(format!("pool '{}' is empty", self.name));
        }
        match requirements.region.as_deref() {
            Some(region) => RegistryError::Exhausted(format!(
                "no endpoint in region {region} in pool '{}'",
                self.name
            )),
            None => RegistryError::Exhausted(format!(
                "all endpoints in pool '{}' are leased, degraded or exhausted",
                self.name
            )),
        }
    }

    /// Swap `current` for another endpoint. The old lease is released in the
    /// same critical section; when no replacement exists the caller keeps it.
    pub fn rotate(&self, current: &str, requirements: &SelectionRequirements) -> Result<ProxyEndpoint, RegistryError> {
        let mut table = self.endpoints.lock().expect("registry lock poisoned");
        let candidates = Self::candidates(&table, requirements, Some(current));
        if candidates.is_empty() {
            return Err(RegistryError::Exhausted(format!(
                "no replacement for {current} in pool '{}'",
                self.name
            )));
        }

        let next = if table.len() >= RANDOM_ROTATION_MIN_POOL {
            *candidates
                .choose(&mut rand::thread_rng())
                .unwrap_or(&candidates[0])
        } else {
            let position = table.iter().position(|e| e.id == current).unwrap_or(0);
            let len = table.len();
            (1..=len)
                .map(|step| (position + step) % len)
                .find(|idx| candidates.contains(idx))
                .unwrap_or(candidates[0])
        };

        Self::lease(&mut table[next]);
        if let Some(old) = table.iter_mut().find(|e| e.id == current) {
            Self::unlease(old);
        }
        Ok(table[next].clone())
    }

    /// Return a lease. Degraded and exhausted endpoints keep their status.
    pub fn release(&self, id: &str) {
        let mut table = self.endpoints.lock().expect("registry lock poisoned");
        if let Some(endpoint) = table.iter_mut().find(|e| e.id == id) {
            Self::unlease(endpoint);
        }
    }

    pub fn mark_exhausted(&self, id: &str) -> Result<(), RegistryError> {
        {
            let mut table = self.endpoints.lock().expect("registry lock poisoned");
            let endpoint = table
                .iter_mut()
                .find(|e| e.id == id)
                .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
            endpoint.status = EndpointStatus::Exhausted;
            endpoint.bandwidth_remaining_mb = Some(endpoint.bandwidth_remaining_mb.unwrap_or(0.0).min(0.0));
        }
        self.events.dispatch(EngineEvent::ProxyExhausted(ProxyStatusEvent {
            endpoint_id: id.to_string(),
            healthy: false,
            status: EndpointStatus::Exhausted.to_string(),
            timestamp: Utc::now(),
        }));
        Ok(())
    }

    /// Decrement the allowance, returning what is left (`None` = unlimited).
    pub fn consume_bandwidth(&self, id: &str, mb: f64) -> Result<Option<f64>, RegistryError> {
        let mut table = self.endpoints.lock().expect("registry lock poisoned");
        let endpoint = table
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        if let Some(remaining) = endpoint.bandwidth_remaining_mb.as_mut() {
            *remaining -= mb;
        }
        Ok(endpoint.bandwidth_remaining_mb)
    }

    pub fn update_performance(&self, id: &str, performance: PerformanceSnapshot) {
        let mut table = self.endpoints.lock().expect("registry lock poisoned");
        if let Some(endpoint) = table.iter_mut().find(|e| e.id == id) {
            endpoint.performance = performance;
        }
    }

    pub fn report(&self) -> PoolReport {
        let table = self.endpoints.lock().expect("registry lock poisoned");
        let count = |status: EndpointStatus| table.iter().filter(|e| e.status == status).count();
        PoolReport {
            total: table.len(),
            available: count(EndpointStatus::Available),
            active: count(EndpointStatus::Active),
            degraded: count(EndpointStatus::Degraded),
            exhausted: count(EndpointStatus::Exhausted),
            endpoints: table.clone(),
        }
    }

    /// Check every non-exhausted endpoint concurrently and update statuses.
    pub async fn health_check(&self) -> HashMap<String, bool> {
        let targets: Vec<HealthTarget> = {
            let table = self.endpoints.lock().expect("registry lock poisoned");
            table
                .iter()
                .filter(|e| e.status != EndpointStatus::Exhausted)
                .map(HealthTarget::for_endpoint)
                .collect()
        };

        let results = health::check_all(self.transport.as_ref(), &targets).await;

        let mut changes = Vec::new();
        {
            let mut table = self.endpoints.lock().expect("registry lock poisoned");
            for (id, healthy) in &results {
                let Some(endpoint) = table.iter_mut().find(|e| &e.id == id) else {
                    continue;
                };
                let healthy = *healthy;
                let next = match (endpoint.status, healthy) {
                    (EndpointStatus::Exhausted, _) => continue,
                    (EndpointStatus::Degraded, true) if endpoint.leased => EndpointStatus::Active,
                    (EndpointStatus::Degraded, true) => EndpointStatus::Available,
                    (_, false) => EndpointStatus::Degraded,
                    (status, true) => status,
                };
                if next != endpoint.status {
                    endpoint.status = next;
                    changes.push((id.clone(), healthy, next));
                }
            }
        }

        for (endpoint_id, healthy, status) in changes {
            self.events.dispatch(EngineEvent::ProxyHealth(ProxyStatusEvent {
                endpoint_id,
                healthy,
                status: status.to_string(),
                timestamp: Utc::now(),
            }));
        }
        results.into_iter().collect()
    }

    /// Run [`health_check`](Self::health_check) every `health_interval` until cancelled.
    pub fn spawn_health_loop(
        self: &Arc<Self>,
        token: tokio_util::sync::CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        let interval = self.config.health_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick fires immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        log::debug!("[{}] health loop cancelled", registry.name);
                        break;
                    }
                    _ = ticker.tick() => {
                        let results = registry.health_check().await;
                        let failing = results.values().filter(|ok| !**ok).count();
                        log::debug!("[{}] health round: {} checked, {failing} failing", registry.name, results.len());
                    }
                }
            }
        })
    }
}
