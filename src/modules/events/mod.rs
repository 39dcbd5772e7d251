//! Engine telemetry events.
//!
//! Components publish structured events (`proxy.selected`, `proxy.rotated`,
//! `bandwidth.thresholdCrossed`, `session.expired`, ...) to an
//! [`EventDispatcher`]. Handlers are fire-and-forget: the engine never waits
//! for an acknowledgement. All string payloads are already credential-masked.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use super::metrics::MetricsCollector;

#[derive(Debug, Clone)]
pub struct ProxySelectedEvent {
    pub endpoint_id: String,
    pub score: f64,
    pub region: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ProxyRotatedEvent {
    pub session_id: Option<String>,
    pub from: String,
    pub to: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ProxyStatusEvent {
    pub endpoint_id: String,
    pub healthy: bool,
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

/// Which ledger tally an alert refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimitScope {
    Daily,
    Session,
}

impl std::fmt::Display for LimitScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LimitScope::Daily => write!(f, "daily"),
            LimitScope::Session => write!(f, "session"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BandwidthAlertEvent {
    pub scope: LimitScope,
    pub session_id: Option<String>,
    pub usage_mb: f64,
    pub limit_mb: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub session_id: String,
    pub subject_id: String,
    pub endpoint_id: Option<String>,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RetryEvent {
    pub host: String,
    pub endpoint_id: String,
    pub attempt: u32,
    pub reason: String,
    pub scheduled_after: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RequestCompletedEvent {
    pub host: String,
    pub endpoint_id: String,
    pub status: u16,
    pub latency: Duration,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub attempts: u32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RequestFailedEvent {
    pub host: String,
    pub error: String,
    pub attempts: u32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum EngineEvent {
    ProxySelected(ProxySelectedEvent),
    ProxyRotated(ProxyRotatedEvent),
    ProxyExhausted(ProxyStatusEvent),
    ProxyHealth(ProxyStatusEvent),
    BandwidthThresholdCrossed(BandwidthAlertEvent),
    BandwidthLimitExceeded(BandwidthAlertEvent),
    SessionCreated(SessionEvent),
    SessionExpired(SessionEvent),
    SessionClosed(SessionEvent),
    RequestRetry(RetryEvent),
    RequestCompleted(RequestCompletedEvent),
    RequestFailed(RequestFailedEvent),
}

impl EngineEvent {
    /// Stable dotted name used by external collectors.
    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::ProxySelected(_) => "proxy.selected",
            EngineEvent::ProxyRotated(_) => "proxy.rotated",
            EngineEvent::ProxyExhausted(_) => "proxy.exhausted",
            EngineEvent::ProxyHealth(_) => "proxy.health",
            EngineEvent::BandwidthThresholdCrossed(_) => "bandwidth.thresholdCrossed",
            EngineEvent::BandwidthLimitExceeded(_) => "bandwidth.limitExceeded",
            EngineEvent::SessionCreated(_) => "session.created",
            EngineEvent::SessionExpired(_) => "session.expired",
            EngineEvent::SessionClosed(_) => "session.closed",
            EngineEvent::RequestRetry(_) => "request.retry",
            EngineEvent::RequestCompleted(_) => "request.completed",
            EngineEvent::RequestFailed(_) => "request.failed",
        }
    }
}

/// Trait implemented by event handlers.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &EngineEvent);
}

/// Dispatcher that broadcasts events to registered handlers.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    pub fn register_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn dispatch(&self, event: EngineEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

/// Logs events using the `log` crate.
#[derive(Debug)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &EngineEvent) {
        match event {
            EngineEvent::ProxySelected(selected) => {
                log::debug!(
                    "{} {} score={:.3}",
                    event.name(),
                    selected.endpoint_id,
                    selected.score
                );
            }
            EngineEvent::ProxyRotated(rotated) => {
                log::info!("{} {} -> {}", event.name(), rotated.from, rotated.to);
            }
            EngineEvent::ProxyExhausted(status) | EngineEvent::ProxyHealth(status) => {
                log::info!("{} {} -> {}", event.name(), status.endpoint_id, status.status);
            }
            EngineEvent::BandwidthThresholdCrossed(alert)
            | EngineEvent::BandwidthLimitExceeded(alert) => {
                log::warn!(
                    "{} {} usage {:.2}MB of {:.2}MB",
                    event.name(),
                    alert.scope,
                    alert.usage_mb,
                    alert.limit_mb
                );
            }
            EngineEvent::SessionCreated(session)
            | EngineEvent::SessionExpired(session)
            | EngineEvent::SessionClosed(session) => {
                log::debug!("{} {} ({})", event.name(), session.session_id, session.reason);
            }
            EngineEvent::RequestRetry(retry) => {
                log::info!(
                    "retry {} via {} attempt {} after {:.2}s: {}",
                    retry.host,
                    retry.endpoint_id,
                    retry.attempt,
                    retry.scheduled_after.as_secs_f64(),
                    retry.reason
                );
            }
            EngineEvent::RequestCompleted(done) => {
                log::debug!(
                    "<- {} via {} -> {} ({:.2}s, {} attempts)",
                    done.host,
                    done.endpoint_id,
                    done.status,
                    done.latency.as_secs_f64(),
                    done.attempts
                );
            }
            EngineEvent::RequestFailed(failed) => {
                log::warn!("request to {} failed after {} attempts: {}", failed.host, failed.attempts, failed.error);
            }
        }
    }
}

/// Metrics handler that feeds the metrics collector.
#[derive(Clone, Debug)]
pub struct MetricsHandler {
    metrics: MetricsCollector,
}

impl MetricsHandler {
    pub fn new(metrics: MetricsCollector) -> Self {
        Self { metrics }
    }
}

impl EventHandler for MetricsHandler {
    fn handle(&self, event: &EngineEvent) {
        match event {
            EngineEvent::RequestCompleted(done) => {
                self.metrics.record_response(
                    &done.host,
                    done.status,
                    done.latency,
                    done.bytes_sent + done.bytes_received,
                );
            }
            EngineEvent::RequestFailed(failed) => {
                self.metrics.record_error(&failed.host);
            }
            EngineEvent::RequestRetry(retry) => {
                self.metrics.record_retry(&retry.host);
            }
            _ => {}
        }
    }
}

/// Forwards events to `tokio::sync::broadcast` subscribers.
///
/// Lagging or absent receivers never block the engine.
#[derive(Debug, Clone)]
pub struct ChannelHandler {
    sender: broadcast::Sender<EngineEvent>,
}

impl ChannelHandler {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }
}

impl EventHandler for ChannelHandler {
    fn handle(&self, event: &EngineEvent) {
        let _ = self.sender.send(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingHandler(std::sync::Mutex<usize>);

    impl EventHandler for CountingHandler {
        fn handle(&self, _event: &EngineEvent) {
            *self.0.lock().unwrap() += 1;
        }
    }

    fn failed() -> EngineEvent {
        EngineEvent::RequestFailed(RequestFailedEvent {
            host: "example.com".into(),
            error: "timeout".into(),
            attempts: 1,
            timestamp: Utc::now(),
        })
    }

    #[test]
    fn dispatches_to_handlers() {
        let mut dispatcher = EventDispatcher::new();
        let counter = Arc::new(CountingHandler(std::sync::Mutex::new(0)));
        dispatcher.register_handler(counter.clone());
        dispatcher.dispatch(failed());
        assert_eq!(*counter.0.lock().unwrap(), 1);
    }

    #[test]
    fn names_follow_dotted_convention() {
        assert_eq!(failed().name(), "request.failed");
        let alert = EngineEvent::BandwidthThresholdCrossed(BandwidthAlertEvent {
            scope: LimitScope::Daily,
            session_id: None,
            usage_mb: 400.0,
            limit_mb: 500.0,
            timestamp: Utc::now(),
        });
        assert_eq!(alert.name(), "bandwidth.thresholdCrossed");
    }

    #[tokio::test]
    async fn channel_handler_broadcasts() {
        let handler = ChannelHandler::new(8);
        let mut rx = handler.subscribe();
        handler.handle(&failed());
        let received = rx.recv().await.unwrap();
        assert_eq!(received.name(), "request.failed");
    }

    #[test]
    fn channel_handler_without_subscribers_is_silent() {
        let handler = ChannelHandler::new(1);
        handler.handle(&failed());
        handler.handle(&failed());
    }
}
