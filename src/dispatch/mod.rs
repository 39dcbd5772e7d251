//! Request dispatch through the proxy pool.
//!
//! [`RequestDispatcher`] runs the pre-flight checks (session, quota, robots,
//! crawl delay, request rate), executes the request through the bound endpoint and feeds
//! the outcome back into the ledger, the registry and the scorer. Retryable
//! failures rotate to another endpoint and back off exponentially; connection
//! failures that survive the retry budget fall back to other protocols and
//! finally to the fallback pool.

mod retry;
mod throttle;
mod transport;

pub use retry::{Failure, RetryPolicy};
pub use throttle::RequestThrottle;
pub use transport::{
    ProxyRequest, ProxyRoute, ProxyTransport, ReqwestTransport, TransportError, TransportResponse,
};

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use http::HeaderMap;
use tokio_util::sync::CancellationToken;

use crate::config::DispatchConfig;
use crate::engine::{EngineError, EngineResult};
use crate::masking::{mask_credentials, mask_sensitive};
use crate::modules::bandwidth::{BandwidthLedger, bytes_to_mb, mb_to_bytes};
use crate::modules::compliance::CompliancePolicy;
use crate::modules::events::{
    EngineEvent, EventDispatcher, ProxyRotatedEvent, RequestCompletedEvent, RequestFailedEvent,
    RetryEvent,
};
use crate::modules::quality::{ErrorClass, QualityScorer};
use crate::modules::registry::{
    Protocol, ProxyEndpoint, ProxyRegistry, RegistryError, SelectionRequirements,
};
use crate::modules::session::{SessionError, SessionManager};

/// Response handed back to the caller.
#[derive(Debug, Clone)]
pub struct DispatchResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Bytes sent plus bytes received for the successful attempt.
    pub bytes_transferred: u64,
    pub endpoint_id: String,
    /// Attempts made across retries and fallbacks, including the last one.
    pub attempts: u32,
}

impl DispatchResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Ephemeral lease for session-less calls; released when dropped.
struct LeaseGuard {
    registry: Arc<ProxyRegistry>,
    endpoint_id: String,
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.registry.release(&self.endpoint_id);
    }
}

/// Who owns the endpoint a call runs through.
enum Binding {
    Session(String),
    Lease(LeaseGuard),
}

struct Delivered {
    response: TransportResponse,
    endpoint: ProxyEndpoint,
    latency: Duration,
}

/// Why an attempt loop gave up.
enum Abandoned {
    /// The retry budget ran out, or the failure was not retryable.
    Failed {
        failure: Failure,
        last_response: Option<TransportResponse>,
    },
    /// Something other than the upstream: no endpoint, session gone.
    Engine(EngineError),
}

impl Abandoned {
    /// Connection-level failures and empty pools are worth a fallback; a
    /// status answer means the proxy itself worked.
    fn warrants_fallback(&self) -> bool {
        match self {
            Abandoned::Failed {
                failure: Failure::Transport(err),
                ..
            } => err.is_retryable(),
            Abandoned::Failed { .. } => false,
            Abandoned::Engine(err) => matches!(err, EngineError::Exhaustion(_)),
        }
    }
}

pub struct RequestDispatcher {
    config: DispatchConfig,
    retry: RetryPolicy,
    remote_dns: bool,
    transport: Arc<dyn ProxyTransport>,
    registry: Arc<ProxyRegistry>,
    fallback: Option<Arc<ProxyRegistry>>,
    scorer: Arc<QualityScorer>,
    sessions: Arc<SessionManager>,
    ledger: Arc<BandwidthLedger>,
    compliance: Arc<CompliancePolicy>,
    events: Arc<EventDispatcher>,
    throttle: Option<RequestThrottle>,
}

impl RequestDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: DispatchConfig,
        retry: RetryPolicy,
        remote_dns: bool,
        transport: Arc<dyn ProxyTransport>,
        registry: Arc<ProxyRegistry>,
        fallback: Option<Arc<ProxyRegistry>>,
        sessions: Arc<SessionManager>,
        ledger: Arc<BandwidthLedger>,
        compliance: Arc<CompliancePolicy>,
        events: Arc<EventDispatcher>,
    ) -> Self {
        let scorer = Arc::clone(registry.scorer());
        let throttle = config
            .max_requests_per_window
            .map(|max| RequestThrottle::new(max, config.rate_window));
        Self {
            config,
            retry,
            remote_dns,
            transport,
            registry,
            fallback,
            scorer,
            sessions,
            ledger,
            compliance,
            events,
            throttle,
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn throttle(&self) -> Option<&RequestThrottle> {
        self.throttle.as_ref()
    }

    /// Dispatch `request`, optionally within a session. Cancelling `token`
    /// aborts the in-flight attempt, releases the endpoint and records no
    /// quality sample.
    pub async fn dispatch(
        &self,
        session_id: Option<&str>,
        request: ProxyRequest,
        token: &CancellationToken,
    ) -> EngineResult<DispatchResponse> {
        let attempts = AtomicU32::new(0);
        let request = match request.timeout {
            Some(_) => request,
            None => request.with_timeout(self.config.request_timeout),
        };

        tokio::select! {
            biased;
            _ = token.cancelled() => {
                if let Some(session_id) = session_id
                    && let Some(endpoint_id) = self.sessions.bound_endpoint(session_id)
                {
                    self.sessions.release_binding(session_id, &endpoint_id);
                }
                let attempts = attempts.load(Ordering::SeqCst);
                log::debug!("dispatch to {} cancelled after {attempts} attempt(s)", request.host());
                Err(EngineError::Cancelled { attempts })
            }
            result = self.run(session_id, &request, &attempts) => result,
        }
    }

    async fn run(
        &self,
        session_id: Option<&str>,
        request: &ProxyRequest,
        attempts: &AtomicU32,
    ) -> EngineResult<DispatchResponse> {
        let host = request.host().to_string();
        self.preflight(session_id, request).await?;

        let primary = match session_id {
            Some(id) => Ok(Binding::Session(id.to_string())),
            None => self
                .registry
                .select_best(&SelectionRequirements::default())
                .map(|endpoint| {
                    Binding::Lease(LeaseGuard {
                        registry: Arc::clone(&self.registry),
                        endpoint_id: endpoint.id,
                    })
                })
                .map_err(EngineError::from),
        };

        let mut abandoned = match primary {
            Ok(mut binding) => match self.primary_attempts(session_id, &mut binding, request, attempts).await {
                Ok(response) => return Ok(response),
                Err(abandoned) => abandoned,
            },
            Err(err) => Abandoned::Engine(err),
        };

        if abandoned.warrants_fallback()
            && let Some(fallback) = &self.fallback
        {
            let requirements = self.requirements_for(session_id);
            match fallback.select_best(&requirements) {
                Ok(endpoint) => {
                    log::info!("[{}] serving {host} from fallback pool", fallback.name());
                    let mut lease = Binding::Lease(LeaseGuard {
                        registry: Arc::clone(fallback),
                        endpoint_id: endpoint.id,
                    });
                    match self.attempt_loop(&mut lease, None, request, attempts).await {
                        Ok(delivered) => return Ok(self.complete(session_id, &lease, delivered, attempts)),
                        Err(next) => abandoned = next,
                    }
                }
                Err(err) => log::warn!("fallback pool unavailable: {err}"),
            }
        }

        Err(self.fail(&host, abandoned, attempts))
    }

    /// The attempt loop on the primary pool, then once per alternate protocol.
    async fn primary_attempts(
        &self,
        session_id: Option<&str>,
        binding: &mut Binding,
        request: &ProxyRequest,
        attempts: &AtomicU32,
    ) -> Result<DispatchResponse, Abandoned> {
        let mut abandoned = match self.attempt_loop(binding, None, request, attempts).await {
            Ok(delivered) => return Ok(self.complete(session_id, binding, delivered, attempts)),
            Err(abandoned) => abandoned,
        };
        if !self.config.protocol_fallback {
            return Err(abandoned);
        }

        for (protocol, variant) in protocol_variants(request) {
            if !abandoned.warrants_fallback() {
                break;
            }
            log::info!(
                "retrying {} via {}",
                request.host(),
                protocol.map(|p| p.to_string()).unwrap_or_else(|| variant.url.scheme().to_string())
            );
            match self.attempt_loop(binding, protocol, &variant, attempts).await {
                Ok(delivered) => return Ok(self.complete(session_id, binding, delivered, attempts)),
                Err(next) => abandoned = next,
            }
        }
        Err(abandoned)
    }

    async fn preflight(&self, session_id: Option<&str>, request: &ProxyRequest) -> EngineResult<()> {
        if let Some(id) = session_id
            && self.sessions.get_session(id).is_none()
        {
            return Err(EngineError::SessionNotFound(id.to_string()));
        }

        let limits = self.ledger.check_limits(session_id);
        if self.ledger.config().enforce_limits && limits.exceeded {
            let (scope, figure) = match limits.session.filter(|s| s.usage_mb >= s.limit_mb) {
                Some(figure) => ("session", figure),
                None => ("daily", limits.daily),
            };
            return Err(EngineError::Quota(format!(
                "{scope} limit reached: {} of {} bytes used",
                mb_to_bytes(figure.usage_mb),
                mb_to_bytes(figure.limit_mb)
            )));
        }

        if !self.compliance.is_allowed(&request.url).await {
            return Err(EngineError::Policy {
                url: mask_credentials(request.url.as_str()),
                reason: "disallowed by robots.txt".into(),
            });
        }

        self.compliance.wait_for_delay(request.host()).await;
        if let Some(throttle) = &self.throttle {
            throttle.acquire().await;
        }
        Ok(())
    }

    fn requirements_for(&self, session_id: Option<&str>) -> SelectionRequirements {
        session_id
            .and_then(|id| self.sessions.get_session(id))
            .map(|session| session.requirements)
            .unwrap_or_default()
    }

    /// Endpoint the next attempt should use.
    fn current(&self, binding: &mut Binding) -> EngineResult<ProxyEndpoint> {
        match binding {
            Binding::Session(id) => Ok(self.sessions.ensure_bound(id)?),
            Binding::Lease(lease) => match lease.registry.get(&lease.endpoint_id) {
                Some(endpoint) if endpoint.status.is_usable() => Ok(endpoint),
                _ => {
                    let replacement = lease.registry.select_best(&SelectionRequirements::default())?;
                    lease.registry.release(&lease.endpoint_id);
                    lease.endpoint_id = replacement.id.clone();
                    Ok(replacement)
                }
            },
        }
    }

    fn rotate(&self, binding: &mut Binding) -> Result<ProxyEndpoint, EngineError> {
        match binding {
            Binding::Session(id) => Ok(self.sessions.rotate(id)?),
            Binding::Lease(lease) => {
                let next = lease
                    .registry
                    .rotate(&lease.endpoint_id, &SelectionRequirements::default())?;
                let from = std::mem::replace(&mut lease.endpoint_id, next.id.clone());
                self.events.dispatch(EngineEvent::ProxyRotated(ProxyRotatedEvent {
                    session_id: None,
                    from,
                    to: next.id.clone(),
                    timestamp: Utc::now(),
                }));
                Ok(next)
            }
        }
    }

    async fn attempt_loop(
        &self,
        binding: &mut Binding,
        protocol: Option<Protocol>,
        request: &ProxyRequest,
        attempts: &AtomicU32,
    ) -> Result<Delivered, Abandoned> {
        let host = request.host().to_string();
        let mut attempt: u32 = 0;

        loop {
            let endpoint = self.current(binding).map_err(Abandoned::Engine)?;
            let route = endpoint.route(protocol, self.remote_dns);
            attempts.fetch_add(1, Ordering::SeqCst);
            log::debug!("{} {} via {route}", request.method, mask_credentials(request.url.as_str()));

            let started = Instant::now();
            let result = self.transport.send(Some(&route), request).await;
            let latency = started.elapsed();

            let (failure, last_response) = match result {
                Ok(response) if !self.retry.is_retryable_status(response.status) => {
                    return Ok(Delivered {
                        response,
                        endpoint,
                        latency,
                    });
                }
                Ok(response) => (Failure::Status(response.status), Some(response)),
                Err(err) => (Failure::Transport(err), None),
            };

            let class = match &failure {
                Failure::Status(status) => ErrorClass::Status(*status),
                Failure::Transport(err) => err.error_class(),
            };
            self.scorer.record_failure(&endpoint.id, class);
            if let Some(performance) = self.scorer.performance(&endpoint.id) {
                self.owner(binding).update_performance(&endpoint.id, performance);
            }

            let reason = mask_sensitive(&failure.describe());
            let Some(limit) = self.retry.limit_for(&failure) else {
                log::warn!("{host} via {}: {reason} (not retryable)", endpoint.id);
                return Err(Abandoned::Failed {
                    failure,
                    last_response,
                });
            };
            if attempt >= limit {
                log::warn!("{host}: giving up after {} retries ({reason})", attempt);
                return Err(Abandoned::Failed {
                    failure,
                    last_response,
                });
            }

            // With nothing to rotate to, the retry stays on the current endpoint.
            if let Err(err) = self.rotate(binding) {
                log::debug!("no rotation for {host}: {err}");
            }

            let delay = self.retry.backoff(attempt);
            attempt += 1;
            self.events.dispatch(EngineEvent::RequestRetry(RetryEvent {
                host: host.clone(),
                endpoint_id: endpoint.id.clone(),
                attempt,
                reason,
                scheduled_after: delay,
                timestamp: Utc::now(),
            }));
            tokio::time::sleep(delay).await;
        }
    }

    fn owner<'a>(&'a self, binding: &'a Binding) -> &'a ProxyRegistry {
        match binding {
            Binding::Session(_) => &self.registry,
            Binding::Lease(lease) => &lease.registry,
        }
    }

    fn complete(
        &self,
        session_id: Option<&str>,
        binding: &Binding,
        delivered: Delivered,
        attempts: &AtomicU32,
    ) -> DispatchResponse {
        let Delivered {
            response,
            endpoint,
            latency,
        } = delivered;
        let registry = self.owner(binding);
        let sent = response.bytes_sent;
        let received = response.bytes_received;
        let total = sent + received;

        self.ledger.track_sent(session_id, sent);
        self.ledger.track_received(session_id, received);
        self.ledger.track_endpoint(&endpoint.id, total);

        match registry.consume_bandwidth(&endpoint.id, bytes_to_mb(total)) {
            Ok(Some(remaining)) if remaining <= 0.0 => self.exhaust(registry, &endpoint.id),
            Ok(_) => {}
            Err(RegistryError::NotFound(_)) => {
                log::debug!("{} was deregistered mid-request", endpoint.id);
            }
            Err(err) => log::warn!("bandwidth accounting failed for {}: {err}", endpoint.id),
        }

        self.scorer.record_success(&endpoint.id, latency.as_secs_f64() * 1000.0);
        if let Some(performance) = self.scorer.performance(&endpoint.id) {
            registry.update_performance(&endpoint.id, performance);
        }

        if let Some(id) = session_id {
            match self.sessions.record_request(id, sent, received) {
                Ok(()) => {}
                Err(SessionError::NotFound(_)) => {
                    log::debug!("session {id} closed while its request was in flight");
                }
                Err(err) => log::warn!("session accounting failed for {id}: {err}"),
            }
        }

        let attempts = attempts.load(Ordering::SeqCst);
        self.events.dispatch(EngineEvent::RequestCompleted(RequestCompletedEvent {
            host: response.url.host_str().unwrap_or_default().to_string(),
            endpoint_id: endpoint.id.clone(),
            status: response.status,
            latency,
            bytes_sent: sent,
            bytes_received: received,
            attempts,
            timestamp: Utc::now(),
        }));

        if let (Some(id), Binding::Session(_)) = (session_id, binding)
            && self.scorer.has_degraded(&endpoint.id)
        {
            log::info!("{} is degrading, rotating session {id}", endpoint.id);
            if let Err(err) = self.sessions.rotate(id) {
                log::debug!("preemptive rotation for {id} skipped: {err}");
            }
        }

        DispatchResponse {
            status: response.status,
            headers: response.headers,
            body: response.body,
            bytes_transferred: total,
            endpoint_id: endpoint.id,
            attempts,
        }
    }

    fn exhaust(&self, registry: &ProxyRegistry, endpoint_id: &str) {
        log::warn!("[{}] {endpoint_id} used up its bandwidth allowance", registry.name());
        if let Err(err) = registry.mark_exhausted(endpoint_id) {
            log::warn!("failed to mark {endpoint_id} exhausted: {err}");
            return;
        }
        if std::ptr::eq(registry, self.registry.as_ref()) {
            self.sessions.evict_endpoint(endpoint_id);
        }
    }

    fn fail(&self, host: &str, abandoned: Abandoned, attempts: &AtomicU32) -> EngineError {
        let attempts = attempts.load(Ordering::SeqCst);
        let error = match abandoned {
            Abandoned::Engine(err) => err,
            Abandoned::Failed {
                failure: Failure::Transport(TransportError::InvalidProxy(message)),
                ..
            } => EngineError::Validation(mask_sensitive(&message)),
            Abandoned::Failed {
                failure,
                last_response,
            } => EngineError::TransientNetwork {
                attempts,
                status: last_response.as_ref().map(|r| r.status),
                message: mask_sensitive(&failure.describe()),
                last_response: last_response.map(Box::new),
            },
        };

        self.events.dispatch(EngineEvent::RequestFailed(RequestFailedEvent {
            host: host.to_string(),
            error: mask_sensitive(&error.to_string()),
            attempts,
            timestamp: Utc::now(),
        }));
        error
    }
}

/// Alternate ways to reach the target: the other URL scheme, then a SOCKS
/// route through the same endpoint.
fn protocol_variants(request: &ProxyRequest) -> Vec<(Option<Protocol>, ProxyRequest)> {
    let scheme = request.url.scheme();
    let mut variants = Vec::new();
    for candidate in ["https", "http", "socks5"] {
        if candidate == scheme {
            continue;
        }
        if candidate == "socks5" {
            variants.push((Some(Protocol::Socks5), request.clone()));
            continue;
        }
        let mut variant = request.clone();
        if variant.url.set_scheme(candidate).is_ok() {
            variants.push((None, variant));
        }
    }
    variants
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    #[test]
    fn variants_skip_the_original_scheme() {
        let request = ProxyRequest::get(Url::parse("https://example.com/a").unwrap());
        let variants = protocol_variants(&request);
        assert_eq!(variants.len(), 2);
        assert_eq!(variants[0].0, None);
        assert_eq!(variants[0].1.url.as_str(), "http://example.com/a");
        assert_eq!(variants[1].0, Some(Protocol::Socks5));
        assert_eq!(variants[1].1.url.scheme(), "https");
    }

    #[test]
    fn only_connection_failures_fall_back() {
        let status = Abandoned::Failed {
            failure: Failure::Status(503),
            last_response: None,
        };
        assert!(!status.warrants_fallback());

        let refused = Abandoned::Failed {
            failure: Failure::Transport(TransportError::ConnectionRefused("x".into())),
            last_response: None,
        };
        assert!(refused.warrants_fallback());

        let empty = Abandoned::Engine(EngineError::Exhaustion("empty".into()));
        assert!(empty.warrants_fallback());
        assert!(!Abandoned::Engine(EngineError::SessionNotFound("s".into())).warrants_fallback());
    }
}
