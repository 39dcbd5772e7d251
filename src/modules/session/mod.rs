//! Session management.
//!
//! A session binds one subject to one endpoint for a bounded time. The table
//! is the only owner of session state; every mutation takes the table lock,
//! checks expiry first and verifies the binding it is about to change, so a
//! sweep or close racing an in-flight dispatch never releases an endpoint that
//! was already re-leased to someone else.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

use super::bandwidth::bytes_to_mb;
use super::events::{EngineEvent, EventDispatcher, ProxyRotatedEvent, SessionEvent};
use super::registry::{
    PendingSelection, ProxyEndpoint, ProxyRegistry, RegistryError, SelectionRequirements,
};
use crate::config::duration_ms;

/// Longest TTL accepted in configuration.
pub const MAX_SESSION_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("consent has not been granted")]
    ConsentRequired,
    #[error("subject {subject} already holds {limit} sessions")]
    Quota { subject: String, limit: usize },
    #[error("session {0} not found or expired")]
    NotFound(String),
    #[error("invalid session request: {0}")]
    Validation(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    #[serde(with = "duration_ms")]
    pub ttl: Duration,
    pub max_sessions_per_subject: usize,
    #[serde(with = "duration_ms")]
    pub sweep_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(1800),
            max_sessions_per_subject: 5,
            sweep_interval: Duration::from_secs(300),
        }
    }
}

/// Options for [`SessionManager::create_session`].
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub consent_granted: bool,
    pub session_id: Option<String>,
    pub ttl: Option<Duration>,
    /// Pinned sessions keep their creation-time expiry; activity never extends it.
    pub pinned: bool,
    pub requirements: SelectionRequirements,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl SessionOptions {
    pub fn with_consent() -> Self {
        Self {
            consent_granted: true,
            ..Default::default()
        }
    }

    pub fn session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn pinned(mut self) -> Self {
        self.pinned = true;
        self
    }

    pub fn requirements(mut self, requirements: SelectionRequirements) -> Self {
        self.requirements = requirements;
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionBandwidth {
    pub sent_bytes: u64,
    pub received_bytes: u64,
}

impl SessionBandwidth {
    pub fn sent_mb(&self) -> f64 {
        bytes_to_mb(self.sent_bytes)
    }

    pub fn received_mb(&self) -> f64 {
        bytes_to_mb(self.received_bytes)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub session_id: String,
    pub subject_id: String,
    /// Bound endpoint id; `None` after eviction until the next dispatch rebinds.
    pub proxy_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(with = "duration_ms")]
    pub ttl: Duration,
    pub pinned: bool,
    pub request_count: u64,
    pub bandwidth: SessionBandwidth,
    pub metadata: HashMap<String, serde_json::Value>,
    pub requirements: SelectionRequirements,
}

impl Session {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    fn mark_activity(&mut self, extend: bool) {
        let now = Utc::now();
        self.last_activity_at = now;
        if extend && !self.pinned {
            self.expires_at = expiry_after(now, self.ttl);
        }
    }
}

/// `now + ttl`, saturating at the latest representable instant.
fn expiry_after(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

type CloseHook = Box<dyn Fn(&str) + Send + Sync>;

enum Bound {
    Kept(ProxyEndpoint),
    Rebound(PendingSelection),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub created: u64,
    pub expired: u64,
    pub closed: u64,
    pub active: usize,
}

#[derive(Debug, Default)]
struct SessionTable {
    sessions: HashMap<String, Session>,
    stats: SessionStats,
}

pub struct SessionManager {
    config: SessionConfig,
    registry: Arc<ProxyRegistry>,
    events: Arc<EventDispatcher>,
    table: Mutex<SessionTable>,
    close_hooks: Vec<CloseHook>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl SessionManager {
    pub fn new(config: SessionConfig, registry: Arc<ProxyRegistry>, events: Arc<EventDispatcher>) -> Self {
        Self {
            config,
            registry,
            events,
            table: Mutex::new(SessionTable::default()),
            close_hooks: Vec::new(),
        }
    }

    /// Run `hook` with the id of every session that leaves the table, however
    /// it leaves: close, lazy or swept expiry, or shutdown. Hooks run after
    /// the table lock is released.
    pub fn on_close(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.close_hooks.push(Box::new(hook));
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn create_session(&self, subject_id: &str, options: SessionOptions) -> Result<Session, SessionError> {
        if !options.consent_granted {
            return Err(SessionError::ConsentRequired);
        }
        if subject_id.trim().is_empty() {
            return Err(SessionError::Validation("subject id must not be empty".into()));
        }

        let requested_id = options.session_id.clone();
        let (session, expired, selection) = {
            let mut table = self.table.lock().expect("session lock poisoned");
            let expired = self.expire_locked(&mut table, |s| {
                s.subject_id == subject_id || requested_id.as_deref() == Some(s.session_id.as_str())
            });

            let live = table
                .sessions
                .values()
                .filter(|s| s.subject_id == subject_id)
                .count();
            if live >= self.config.max_sessions_per_subject {
                drop(table);
                self.emit_closed(expired);
                return Err(SessionError::Quota {
                    subject: subject_id.to_string(),
                    limit: self.config.max_sessions_per_subject,
                });
            }

            let session_id = options
                .session_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            if table.sessions.contains_key(&session_id) {
                drop(table);
                self.emit_closed(expired);
                return Err(SessionError::Validation(format!("session id {session_id} already exists")));
            }

            let selection = match self.registry.lease_best(&options.requirements) {
                Ok(selection) => selection,
                Err(err) => {
                    drop(table);
                    self.emit_closed(expired);
                    return Err(err.into());
                }
            };

            let now = Utc::now();
            let ttl = options.ttl.unwrap_or(self.config.ttl);
            let session = Session {
                session_id: session_id.clone(),
                subject_id: subject_id.to_string(),
                proxy_ref: Some(selection.endpoint.id.clone()),
                created_at: now,
                last_activity_at: now,
                expires_at: expiry_after(now, ttl),
                ttl,
                pinned: options.pinned,
                request_count: 0,
                bandwidth: SessionBandwidth::default(),
                metadata: options.metadata,
                requirements: options.requirements,
            };
            table.sessions.insert(session_id, session.clone());
            table.stats.created += 1;
            table.stats.active = table.sessions.len();
            (session, expired, selection)
        };

        self.emit_closed(expired);
        self.registry.announce(&selection);
        self.events.dispatch(EngineEvent::SessionCreated(SessionEvent {
            session_id: session.session_id.clone(),
            subject_id: session.subject_id.clone(),
            endpoint_id: session.proxy_ref.clone(),
            reason: "created".into(),
            timestamp: Utc::now(),
        }));
        Ok(session)
    }

    /// Live session snapshot. Dead sessions are closed on sight.
    pub fn get_session(&self, session_id: &str) -> Option<Session> {
        self.with_live(session_id, |session| Ok(session.clone())).ok()
    }

    pub fn touch(&self, session_id: &str, extend: bool) -> Result<Session, SessionError> {
        self.with_live(session_id, |session| {
            session.mark_activity(extend);
            Ok(session.clone())
        })
    }

    /// Count a completed request against the session. Counts as activity and
    /// extends the expiry unless pinned.
    pub fn record_request(&self, session_id: &str, bytes_sent: u64, bytes_received: u64) -> Result<(), SessionError> {
        self.with_live(session_id, |session| {
            session.request_count += 1;
            session.bandwidth.sent_bytes += bytes_sent;
            session.bandwidth.received_bytes += bytes_received;
            session.mark_activity(true);
            Ok(())
        })
    }

    pub fn update_metadata(
        &self,
        session_id: &str,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Result<Session, SessionError> {
        self.with_live(session_id, |session| {
            session.metadata.extend(metadata);
            session.mark_activity(false);
            Ok(session.clone())
        })
    }

    /// Move the session to a different endpoint. `request_count` is kept.
    pub fn rotate(&self, session_id: &str) -> Result<ProxyEndpoint, SessionError> {
        let (from, endpoint, selection) = self.with_live(session_id, |session| {
            let (endpoint, selection) = match session.proxy_ref.as_deref() {
                Some(current) => (self.registry.rotate(current, &session.requirements)?, None),
                None => {
                    let selection = self.registry.lease_best(&session.requirements)?;
                    (selection.endpoint.clone(), Some(selection))
                }
            };
            let from = session.proxy_ref.replace(endpoint.id.clone());
            session.mark_activity(false);
            Ok((from, endpoint, selection))
        })?;

        if let Some(selection) = selection {
            self.registry.announce(&selection);
        }
        self.events.dispatch(EngineEvent::ProxyRotated(ProxyRotatedEvent {
            session_id: Some(session_id.to_string()),
            from: from.unwrap_or_else(|| "-".into()),
            to: endpoint.id.clone(),
            timestamp: Utc::now(),
        }));
        Ok(endpoint)
    }

    /// The bound endpoint, rebinding when the session is unbound or its
    /// endpoint was degraded, exhausted or removed.
    pub fn ensure_bound(&self, session_id: &str) -> Result<ProxyEndpoint, SessionError> {
        let selection = self.with_live(session_id, |session| {
            if let Some(current) = session.proxy_ref.take() {
                match self.registry.get(&current) {
                    Some(endpoint) if endpoint.status.is_usable() => {
                        session.proxy_ref = Some(current);
                        return Ok(Bound::Kept(endpoint));
                    }
                    Some(endpoint) => {
                        log::info!("session {} leaves {} endpoint {current}", session.session_id, endpoint.status);
                        self.registry.release(&current);
                    }
                    None => {}
                }
            }
            let selection = self.registry.lease_best(&session.requirements)?;
            session.proxy_ref = Some(selection.endpoint.id.clone());
            Ok(Bound::Rebound(selection))
        })?;

        match selection {
            Bound::Kept(endpoint) => Ok(endpoint),
            Bound::Rebound(selection) => {
                self.registry.announce(&selection);
                Ok(selection.endpoint)
            }
        }
    }

    pub fn bound_endpoint(&self, session_id: &str) -> Option<String> {
        self.get_session(session_id).and_then(|s| s.proxy_ref)
    }

    /// Drop the binding if it still points at `endpoint_id`, releasing the
    /// endpoint. Returns `false` when the session moved on or is gone.
    pub fn release_binding(&self, session_id: &str, endpoint_id: &str) -> bool {
        let mut table = self.table.lock().expect("session lock poisoned");
        let Some(session) = table.sessions.get_mut(session_id) else {
            return false;
        };
        if session.proxy_ref.as_deref() != Some(endpoint_id) {
            return false;
        }
        session.proxy_ref = None;
        self.registry.release(endpoint_id);
        true
    }

    /// Unbind every session using `endpoint_id`; they rebind on next use.
    pub fn evict_endpoint(&self, endpoint_id: &str) -> Vec<String> {
        let mut table = self.table.lock().expect("session lock poisoned");
        let mut evicted = Vec::new();
        for session in table.sessions.values_mut() {
            if session.proxy_ref.as_deref() == Some(endpoint_id) {
                session.proxy_ref = None;
                evicted.push(session.session_id.clone());
            }
        }
        if !evicted.is_empty() {
            self.registry.release(endpoint_id);
            log::info!("evicted {} session(s) from {endpoint_id}", evicted.len());
        }
        evicted
    }

    /// Close a session and release its endpoint. `false` if it was already gone.
    pub fn close_session(&self, session_id: &str, reason: &str) -> bool {
        let closed = {
            let mut table = self.table.lock().expect("session lock poisoned");
            self.remove_locked(&mut table, session_id, reason)
        };
        match closed {
            Some(event) => {
                self.emit_closed(vec![event]);
                true
            }
            None => false,
        }
    }

    /// Close every session past its expiry. Returns the closed ids.
    pub fn sweep_expired(&self) -> Vec<String> {
        let expired = {
            let mut table = self.table.lock().expect("session lock poisoned");
            self.expire_locked(&mut table, |_| true)
        };
        let ids = expired.iter().map(|(_, e)| e.session_id.clone()).collect();
        self.emit_closed(expired);
        ids
    }

    pub fn subject_sessions(&self, subject_id: &str) -> Vec<Session> {
        let now = Utc::now();
        let table = self.table.lock().expect("session lock poisoned");
        table
            .sessions
            .values()
            .filter(|s| s.subject_id == subject_id && !s.is_expired_at(now))
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> SessionStats {
        let table = self.table.lock().expect("session lock poisoned");
        SessionStats {
            active: table.sessions.len(),
            ..table.stats
        }
    }

    /// Close all sessions with reason `shutdown`.
    pub fn shutdown(&self) -> usize {
        let closed: Vec<(bool, SessionEvent)> = {
            let mut table = self.table.lock().expect("session lock poisoned");
            let ids: Vec<String> = table.sessions.keys().cloned().collect();
            ids.iter()
                .filter_map(|id| self.remove_locked(&mut table, id, "shutdown"))
                .collect()
        };
        let count = closed.len();
        self.emit_closed(closed);
        count
    }

    /// Run [`sweep_expired`](Self::sweep_expired) every `sweep_interval` until
    /// cancelled.
    pub fn spawn_sweep_loop(
        self: &Arc<Self>,
        token: tokio_util::sync::CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        let interval = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        log::debug!("session sweep loop cancelled");
                        break;
                    }
                    _ = ticker.tick() => {
                        let closed = manager.sweep_expired();
                        if !closed.is_empty() {
                            log::debug!("swept {} expired session(s)", closed.len());
                        }
                    }
                }
            }
        })
    }

    /// Run `op` against a live session, closing it first if it is dead.
    fn with_live<T>(
        &self,
        session_id: &str,
        op: impl FnOnce(&mut Session) -> Result<T, SessionError>,
    ) -> Result<T, SessionError> {
        let now = Utc::now();
        let mut table = self.table.lock().expect("session lock poisoned");
        let expired = match table.sessions.get(session_id) {
            None => return Err(SessionError::NotFound(session_id.to_string())),
            Some(session) => session.is_expired_at(now),
        };
        if expired {
            let event = self.remove_locked(&mut table, session_id, "expired");
            drop(table);
            self.emit_closed(event.into_iter().collect());
            return Err(SessionError::NotFound(session_id.to_string()));
        }
        let session = table
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        op(session)
    }

    fn expire_locked(
        &self,
        table: &mut SessionTable,
        filter: impl Fn(&Session) -> bool,
    ) -> Vec<(bool, SessionEvent)> {
        let now = Utc::now();
        let dead: Vec<String> = table
            .sessions
            .values()
            .filter(|s| filter(s) && s.is_expired_at(now))
            .map(|s| s.session_id.clone())
            .collect();
        dead.iter()
            .filter_map(|id| self.remove_locked(table, id, "expired"))
            .collect()
    }

    /// Remove a session and release its endpoint. The flag marks expiry.
    fn remove_locked(&self, table: &mut SessionTable, session_id: &str, reason: &str) -> Option<(bool, SessionEvent)> {
        let session = table.sessions.remove(session_id)?;
        if let Some(endpoint_id) = session.proxy_ref.as_deref() {
            self.registry.release(endpoint_id);
        }
        let expired = reason == "expired";
        if expired {
            table.stats.expired += 1;
        } else {
            table.stats.closed += 1;
        }
        table.stats.active = table.sessions.len();
        Some((
            expired,
            SessionEvent {
                session_id: session.session_id,
                subject_id: session.subject_id,
                endpoint_id: session.proxy_ref,
                reason: reason.to_string(),
                timestamp: Utc::now(),
            },
        ))
    }

    fn emit_closed(&self, closed: Vec<(bool, SessionEvent)>) {
        for (expired, event) in closed {
            for hook in &self.close_hooks {
                hook(&event.session_id);
            }
            if expired {
                self.events.dispatch(EngineEvent::SessionExpired(event));
            } else {
                self.events.dispatch(EngineEvent::SessionClosed(event));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{ProxyRequest, ProxyRoute, ProxyTransport, TransportError, TransportResponse};
    use crate::modules::events::EventHandler;
    use crate::modules::quality::QualityScorer;
    use crate::modules::registry::{EndpointSpec, EndpointStatus, Protocol, RegistryConfig};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::OnceLock;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    #[derive(Default)]
    struct Reachability {
        down: Mutex<HashSet<String>>,
    }

    #[async_trait]
    impl ProxyTransport for Reachability {
        async fn send(
            &self,
            _route: Option<&ProxyRoute>,
            request: &ProxyRequest,
        ) -> Result<TransportResponse, TransportError> {
            let target = format!("{}:{}", request.host(), request.url.port().unwrap_or(80));
            if self.down.lock().unwrap().contains(&target) {
                return Err(TransportError::ConnectionRefused(target));
            }
            Ok(TransportResponse {
                status: 200,
                headers: Default::default(),
                body: Default::default(),
                url: request.url.clone(),
                bytes_sent: 0,
                bytes_received: 0,
            })
        }
    }

    fn build(
        pool: usize,
        config: SessionConfig,
        events: EventDispatcher,
        transport: Arc<Reachability>,
    ) -> (SessionManager, Arc<ProxyRegistry>) {
        let events = Arc::new(events);
        let registry = Arc::new(ProxyRegistry::new(
            "primary",
            RegistryConfig::default(),
            Arc::new(QualityScorer::default()),
            transport,
            events.clone(),
        ));
        for i in 1..=pool {
            registry
                .register(EndpointSpec::new(format!("10.0.0.{i}"), 8080, Protocol::Http))
                .unwrap();
        }
        (SessionManager::new(config, registry.clone(), events), registry)
    }

    fn manager(pool: usize, config: SessionConfig) -> (SessionManager, Arc<ProxyRegistry>) {
        build(pool, config, EventDispatcher::new(), Arc::default())
    }

    /// Reads session stats from inside every event it sees.
    #[derive(Default)]
    struct StatsReader {
        manager: OnceLock<Arc<SessionManager>>,
        seen: AtomicUsize,
    }

    impl EventHandler for StatsReader {
        fn handle(&self, _event: &EngineEvent) {
            if let Some(manager) = self.manager.get() {
                manager.stats();
                self.seen.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[test]
    fn requires_consent() {
        let (manager, _) = manager(1, SessionConfig::default());
        let err = manager.create_session("device-1", SessionOptions::default()).unwrap_err();
        assert!(matches!(err, SessionError::ConsentRequired));
    }

    #[test]
    fn enforces_per_subject_quota() {
        let (manager, _) = manager(10, SessionConfig {
            max_sessions_per_subject: 2,
            ..Default::default()
        });
        manager.create_session("a", SessionOptions::with_consent()).unwrap();
        manager.create_session("a", SessionOptions::with_consent()).unwrap();
        let err = manager.create_session("a", SessionOptions::with_consent()).unwrap_err();
        assert!(matches!(err, SessionError::Quota { limit: 2, .. }));
        manager.create_session("b", SessionOptions::with_consent()).unwrap();
        assert_eq!(manager.subject_sessions("a").len(), 2);
    }

    #[test]
    fn rejects_duplicate_session_ids() {
        let (manager, _) = manager(2, SessionConfig::default());
        manager
            .create_session("a", SessionOptions::with_consent().session_id("fixed"))
            .unwrap();
        let err = manager
            .create_session("b", SessionOptions::with_consent().session_id("fixed"))
            .unwrap_err();
        assert!(matches!(err, SessionError::Validation(_)));
    }

    #[test]
    fn close_is_idempotent_and_releases() {
        let (manager, registry) = manager(1, SessionConfig::default());
        let session = manager.create_session("a", SessionOptions::with_consent()).unwrap();
        let endpoint = session.proxy_ref.clone().unwrap();
        assert_eq!(registry.get(&endpoint).unwrap().status, EndpointStatus::Active);

        assert!(manager.close_session(&session.session_id, "user-closed"));
        assert!(!manager.close_session(&session.session_id, "user-closed"));
        assert_eq!(registry.get(&endpoint).unwrap().status, EndpointStatus::Available);
        assert_eq!(manager.stats().closed, 1);
    }

    #[test]
    fn rotation_keeps_request_count() {
        let (manager, _) = manager(3, SessionConfig::default());
        let session = manager.create_session("a", SessionOptions::with_consent()).unwrap();
        manager.record_request(&session.session_id, 100, 200).unwrap();
        let before = session.proxy_ref.clone().unwrap();
        let endpoint = manager.rotate(&session.session_id).unwrap();
        assert_ne!(endpoint.id, before);

        let after = manager.get_session(&session.session_id).unwrap();
        assert_eq!(after.request_count, 1);
        assert_eq!(after.proxy_ref.as_deref(), Some(endpoint.id.as_str()));
        assert_eq!(after.bandwidth.received_bytes, 200);
    }

    #[test]
    fn lazy_expiry_hides_dead_sessions() {
        let (manager, registry) = manager(1, SessionConfig::default());
        let session = manager
            .create_session("a", SessionOptions::with_consent().ttl(Duration::from_millis(20)))
            .unwrap();
        std::thread::sleep(Duration::from_millis(40));
        assert!(manager.get_session(&session.session_id).is_none());
        assert!(matches!(
            manager.touch(&session.session_id, true),
            Err(SessionError::NotFound(_))
        ));
        assert_eq!(manager.stats().expired, 1);
        assert_eq!(
            registry.get(session.proxy_ref.as_deref().unwrap()).unwrap().status,
            EndpointStatus::Available
        );
    }

    #[test]
    fn touch_extends_unless_pinned() {
        let (manager, _) = manager(2, SessionConfig::default());
        let regular = manager.create_session("a", SessionOptions::with_consent()).unwrap();
        let pinned = manager
            .create_session("a", SessionOptions::with_consent().pinned())
            .unwrap();
        std::thread::sleep(Duration::from_millis(5));

        let touched = manager.touch(&regular.session_id, true).unwrap();
        assert!(touched.expires_at > regular.expires_at);
        assert_eq!(touched.expires_at, expiry_after(touched.last_activity_at, touched.ttl));

        let touched = manager.touch(&pinned.session_id, true).unwrap();
        assert_eq!(touched.expires_at, pinned.expires_at);
    }

    #[test]
    fn eviction_unbinds_and_rebinds_lazily() {
        let (manager, registry) = manager(2, SessionConfig::default());
        let session = manager.create_session("a", SessionOptions::with_consent()).unwrap();
        let endpoint = session.proxy_ref.clone().unwrap();
        registry.mark_exhausted(&endpoint).unwrap();
        assert_eq!(manager.evict_endpoint(&endpoint), vec![session.session_id.clone()]);
        assert!(manager.bound_endpoint(&session.session_id).is_none());

        let rebound = manager.ensure_bound(&session.session_id).unwrap();
        assert_ne!(rebound.id, endpoint);
    }

    #[test]
    fn release_binding_checks_current_binding() {
        let (manager, _) = manager(2, SessionConfig::default());
        let session = manager.create_session("a", SessionOptions::with_consent()).unwrap();
        assert!(!manager.release_binding(&session.session_id, "10.9.9.9:1"));
        let bound = session.proxy_ref.unwrap();
        assert!(manager.release_binding(&session.session_id, &bound));
        assert!(manager.bound_endpoint(&session.session_id).is_none());
    }

    #[test]
    fn shutdown_closes_everything() {
        let (manager, registry) = manager(3, SessionConfig::default());
        for subject in ["a", "b", "c"] {
            manager.create_session(subject, SessionOptions::with_consent()).unwrap();
        }
        assert_eq!(manager.shutdown(), 3);
        assert_eq!(manager.stats().active, 0);
        assert_eq!(registry.report().available, 3);
    }

    #[test]
    fn unbounded_ttl_saturates_expiry() {
        let (manager, _) = manager(1, SessionConfig::default());
        let session = manager
            .create_session("a", SessionOptions::with_consent().ttl(Duration::MAX))
            .unwrap();
        assert_eq!(session.expires_at, DateTime::<Utc>::MAX_UTC);

        let touched = manager.touch(&session.session_id, true).unwrap();
        assert_eq!(touched.expires_at, DateTime::<Utc>::MAX_UTC);
        manager.record_request(&session.session_id, 10, 10).unwrap();
        assert_eq!(manager.stats().active, 1);
        assert!(manager.sweep_expired().is_empty());
    }

    #[test]
    fn close_hooks_see_every_removal() {
        let closed = Arc::new(Mutex::new(Vec::new()));
        let seen = closed.clone();
        let (manager, _) = manager(3, SessionConfig::default());
        let manager = manager.on_close(move |id| seen.lock().unwrap().push(id.to_string()));

        manager
            .create_session("a", SessionOptions::with_consent().session_id("lazy").ttl(Duration::from_millis(20)))
            .unwrap();
        manager
            .create_session("b", SessionOptions::with_consent().session_id("reused").ttl(Duration::from_millis(20)))
            .unwrap();
        manager
            .create_session("c", SessionOptions::with_consent().session_id("closed"))
            .unwrap();
        std::thread::sleep(Duration::from_millis(40));

        assert!(manager.get_session("lazy").is_none());
        manager
            .create_session("d", SessionOptions::with_consent().session_id("reused"))
            .unwrap();
        assert!(manager.close_session("closed", "done"));
        assert_eq!(manager.shutdown(), 1);

        let closed = closed.lock().unwrap();
        assert_eq!(*closed, vec!["lazy", "reused", "closed", "reused"]);
    }

    #[tokio::test]
    async fn degraded_binding_is_replaced() {
        let transport = Arc::new(Reachability::default());
        let (manager, registry) = build(2, SessionConfig::default(), EventDispatcher::new(), transport.clone());
        let session = manager.create_session("a", SessionOptions::with_consent()).unwrap();
        let bound = session.proxy_ref.clone().unwrap();
        transport.down.lock().unwrap().insert(bound.clone());

        registry.health_check().await;
        assert_eq!(registry.get(&bound).unwrap().status, EndpointStatus::Degraded);

        let rebound = manager.ensure_bound(&session.session_id).unwrap();
        assert_ne!(rebound.id, bound);
        assert_eq!(manager.bound_endpoint(&session.session_id), Some(rebound.id.clone()));
        assert!(!registry.get(&bound).unwrap().leased);
    }

    #[test]
    fn handlers_may_query_the_manager() {
        let reader = Arc::new(StatsReader::default());
        let mut events = EventDispatcher::new();
        events.register_handler(reader.clone());
        let (manager, registry) = build(3, SessionConfig {
            max_sessions_per_subject: 1,
            ..Default::default()
        }, events, Arc::default());
        let manager = Arc::new(manager);
        reader.manager.set(manager.clone()).ok();

        let (done, finished) = mpsc::channel();
        let worker = manager.clone();
        std::thread::spawn(move || {
            let session = worker
                .create_session("a", SessionOptions::with_consent().ttl(Duration::from_millis(20)))
                .unwrap();
            let bound = session.proxy_ref.clone().unwrap();
            registry.mark_exhausted(&bound).unwrap();
            worker.evict_endpoint(&bound);
            worker.ensure_bound(&session.session_id).unwrap();
            worker.rotate(&session.session_id).unwrap();
            std::thread::sleep(Duration::from_millis(40));
            worker.create_session("a", SessionOptions::with_consent()).unwrap();
            worker.shutdown();
            done.send(()).unwrap();
        });

        finished
            .recv_timeout(Duration::from_secs(3))
            .expect("event handler deadlocked against the session table");
        assert!(reader.seen.load(Ordering::SeqCst) >= 6);
    }
}
