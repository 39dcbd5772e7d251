//! Bandwidth metering.
//!
//! Counts bytes per session, per endpoint and per UTC day. Limits are soft:
//! the ledger reports a [`LimitStatus`] and raises `bandwidth.*` alerts, and
//! the dispatcher decides whether to refuse work. Counters are integral bytes
//! so day totals are exact; megabytes use the 1024² divisor.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::events::{BandwidthAlertEvent, EngineEvent, EventDispatcher, LimitScope};
use crate::config::duration_ms;

pub const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

pub fn bytes_to_mb(bytes: u64) -> f64 {
    bytes as f64 / BYTES_PER_MB
}

pub fn mb_to_bytes(mb: f64) -> u64 {
    (mb.max(0.0) * BYTES_PER_MB).round() as u64
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BandwidthConfig {
    pub daily_limit_mb: f64,
    pub session_limit_mb: f64,
    /// Fraction of a limit at which `bandwidth.thresholdCrossed` fires.
    pub alert_threshold: f64,
    /// Refuse dispatches once a limit is exceeded.
    pub enforce_limits: bool,
    /// Span of traffic [`BandwidthLedger::throughput`] averages over.
    #[serde(with = "duration_ms")]
    pub throughput_window: Duration,
}

impl Default for BandwidthConfig {
    fn default() -> Self {
        Self {
            daily_limit_mb: 500.0,
            session_limit_mb: 100.0,
            alert_threshold: 0.8,
            enforce_limits: true,
            throughput_window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct UsageFigure {
    pub usage_mb: f64,
    pub limit_mb: f64,
    pub percent: f64,
}

impl UsageFigure {
    fn new(bytes: u64, limit_mb: f64) -> Self {
        let usage_mb = bytes_to_mb(bytes);
        Self {
            usage_mb,
            limit_mb,
            percent: usage_mb / limit_mb * 100.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LimitStatus {
    pub exceeded: bool,
    pub threshold_crossed: bool,
    pub daily: UsageFigure,
    pub session: Option<UsageFigure>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SessionUsage {
    pub sent_mb: f64,
    pub received_mb: f64,
    pub total_mb: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BandwidthRecord {
    pub date: NaiveDate,
    pub sent_mb: f64,
    pub received_mb: f64,
    pub total_mb: f64,
    pub per_session: HashMap<String, SessionUsage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Throughput {
    pub bytes_per_second: f64,
    /// Bytes tracked inside the window.
    pub window_bytes: u64,
    pub observed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default)]
struct ByteTally {
    sent: u64,
    received: u64,
}

impl ByteTally {
    fn total(&self) -> u64 {
        self.sent + self.received
    }

    fn usage(&self) -> SessionUsage {
        SessionUsage {
            sent_mb: bytes_to_mb(self.sent),
            received_mb: bytes_to_mb(self.received),
            total_mb: bytes_to_mb(self.total()),
        }
    }

    fn add(&mut self, direction: Direction, bytes: u64) {
        match direction {
            Direction::Sent => self.sent += bytes,
            Direction::Received => self.received += bytes,
        }
    }
}

#[derive(Debug, Default)]
struct DayTally {
    bytes: ByteTally,
    per_session: HashMap<String, ByteTally>,
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Sent,
    Received,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum AlertLevel {
    Threshold,
    Exceeded,
}

/// Identifies one crossing: daily alerts key on the date, session alerts on the id.
type AlertKey = (LimitScope, AlertLevel, String);

#[derive(Debug, Default)]
struct LedgerState {
    days: BTreeMap<NaiveDate, DayTally>,
    sessions: HashMap<String, ByteTally>,
    endpoints: HashMap<String, u64>,
    fired: HashSet<AlertKey>,
    samples: VecDeque<(Instant, u64)>,
    last_observed: Option<DateTime<Utc>>,
}

impl LedgerState {
    fn prune_samples(&mut self, now: Instant, window: Duration) {
        while let Some(&(at, _)) = self.samples.front() {
            if now.duration_since(at) <= window {
                break;
            }
            self.samples.pop_front();
        }
    }
}

/// Thread-safe bandwidth ledger.
#[derive(Debug)]
pub struct BandwidthLedger {
    config: BandwidthConfig,
    events: Arc<EventDispatcher>,
    state: Mutex<LedgerState>,
}

impl BandwidthLedger {
    pub fn new(config: BandwidthConfig, events: Arc<EventDispatcher>) -> Self {
        Self {
            config,
            events,
            state: Mutex::new(LedgerState::default()),
        }
    }

    pub fn config(&self) -> &BandwidthConfig {
        &self.config
    }

    pub fn track_sent(&self, session_id: Option<&str>, bytes: u64) -> LimitStatus {
        self.track(session_id, bytes, Direction::Sent)
    }

    pub fn track_received(&self, session_id: Option<&str>, bytes: u64) -> LimitStatus {
        self.track(session_id, bytes, Direction::Received)
    }

    fn track(&self, session_id: Option<&str>, bytes: u64, direction: Direction) -> LimitStatus {
        let today = Utc::now().date_naive();
        let (status, alerts) = {
            let mut state = self.state.lock().expect("bandwidth lock poisoned");

            let now = Instant::now();
            state.prune_samples(now, self.config.throughput_window);
            state.samples.push_back((now, bytes));
            state.last_observed = Some(Utc::now());

            let day = state.days.entry(today).or_default();
            day.bytes.add(direction, bytes);
            if let Some(id) = session_id {
                day.per_session
                    .entry(id.to_string())
                    .or_default()
                    .add(direction, bytes);
                state
                    .sessions
                    .entry(id.to_string())
                    .or_default()
                    .add(direction, bytes);
            }

            let status = self.status_locked(&state, today, session_id);
            let alerts = self.pending_alerts(&mut state, today, session_id);
            (status, alerts)
        };

        for alert in alerts {
            self.events.dispatch(alert);
        }
        status
    }

    /// Attribute bytes to the endpoint that carried them.
    pub fn track_endpoint(&self, endpoint_id: &str, bytes: u64) {
        let mut state = self.state.lock().expect("bandwidth lock poisoned");
        *state.endpoints.entry(endpoint_id.to_string()).or_default() += bytes;
    }

    pub fn check_limits(&self, session_id: Option<&str>) -> LimitStatus {
        let state = self.state.lock().expect("bandwidth lock poisoned");
        self.status_locked(&state, Utc::now().date_naive(), session_id)
    }

    fn status_locked(
        &self,
        state: &LedgerState,
        today: NaiveDate,
        session_id: Option<&str>,
    ) -> LimitStatus {
        let daily_bytes = state.days.get(&today).map(|d| d.bytes.total()).unwrap_or(0);
        let daily = UsageFigure::new(daily_bytes, self.config.daily_limit_mb);
        let session = session_id
            .and_then(|id| state.sessions.get(id))
            .map(|tally| UsageFigure::new(tally.total(), self.config.session_limit_mb));

        let threshold = self.config.alert_threshold;
        let mut exceeded = daily.usage_mb >= daily.limit_mb;
        let mut threshold_crossed = daily.usage_mb >= daily.limit_mb * threshold;
        if let Some(figure) = session {
            exceeded |= figure.usage_mb >= figure.limit_mb;
            threshold_crossed |= figure.usage_mb >= figure.limit_mb * threshold;
        }

        LimitStatus {
            exceeded,
            threshold_crossed,
            daily,
            session,
        }
    }

    fn pending_alerts(
        &self,
        state: &mut LedgerState,
        today: NaiveDate,
        session_id: Option<&str>,
    ) -> Vec<EngineEvent> {
        let mut alerts = Vec::new();
        let daily_bytes = state.days.get(&today).map(|d| d.bytes.total()).unwrap_or(0);
        self.check_crossing(
            &mut state.fired,
            &mut alerts,
            LimitScope::Daily,
            today.to_string(),
            None,
            daily_bytes,
            self.config.daily_limit_mb,
        );

        if let Some(id) = session_id {
            let session_bytes = state.sessions.get(id).map(ByteTally::total).unwrap_or(0);
            self.check_crossing(
                &mut state.fired,
                &mut alerts,
                LimitScope::Session,
                id.to_string(),
                Some(id),
                session_bytes,
                self.config.session_limit_mb,
            );
        }
        alerts
    }

    #[allow(clippy::too_many_arguments)]
    fn check_crossing(
        &self,
        fired: &mut HashSet<AlertKey>,
        alerts: &mut Vec<EngineEvent>,
        scope: LimitScope,
        key: String,
        session_id: Option<&str>,
        bytes: u64,
        limit_mb: f64,
    ) {
        let usage_mb = bytes_to_mb(bytes);
        let event = |usage_mb: f64| BandwidthAlertEvent {
            scope,
            session_id: session_id.map(str::to_string),
            usage_mb,
            limit_mb,
            timestamp: Utc::now(),
        };

        if usage_mb >= limit_mb {
            // A jump straight past the limit reports only the exceeded level.
            fired.insert((scope, AlertLevel::Threshold, key.clone()));
            if fired.insert((scope, AlertLevel::Exceeded, key)) {
                alerts.push(EngineEvent::BandwidthLimitExceeded(event(usage_mb)));
            }
        } else if usage_mb >= limit_mb * self.config.alert_threshold
            && fired.insert((scope, AlertLevel::Threshold, key))
        {
            alerts.push(EngineEvent::BandwidthThresholdCrossed(event(usage_mb)));
        }
    }

    pub fn session_usage(&self, session_id: &str) -> Option<SessionUsage> {
        let state = self.state.lock().expect("bandwidth lock poisoned");
        state.sessions.get(session_id).map(ByteTally::usage)
    }

    pub fn daily_record(&self, date: NaiveDate) -> Option<BandwidthRecord> {
        let state = self.state.lock().expect("bandwidth lock poisoned");
        state.days.get(&date).map(|day| {
            let usage = day.bytes.usage();
            BandwidthRecord {
                date,
                sent_mb: usage.sent_mb,
                received_mb: usage.received_mb,
                total_mb: usage.total_mb,
                per_session: day
                    .per_session
                    .iter()
                    .map(|(id, tally)| (id.clone(), tally.usage()))
                    .collect(),
            }
        })
    }

    pub fn today(&self) -> Option<BandwidthRecord> {
        self.daily_record(Utc::now().date_naive())
    }

    pub fn endpoint_usage(&self, endpoint_id: &str) -> f64 {
        let state = self.state.lock().expect("bandwidth lock poisoned");
        bytes_to_mb(state.endpoints.get(endpoint_id).copied().unwrap_or(0))
    }

    /// Bytes tracked within `throughput_window`, divided by the time since
    /// the oldest of them. Spans under one second count as one second.
    pub fn throughput(&self) -> Throughput {
        let mut state = self.state.lock().expect("bandwidth lock poisoned");
        let now = Instant::now();
        state.prune_samples(now, self.config.throughput_window);
        let window_bytes: u64 = state.samples.iter().map(|&(_, bytes)| bytes).sum();
        let span = state
            .samples
            .front()
            .map(|&(oldest, _)| now.duration_since(oldest))
            .unwrap_or_default()
            .max(Duration::from_secs(1));
        Throughput {
            bytes_per_second: window_bytes as f64 / span.as_secs_f64(),
            window_bytes,
            observed_at: state.last_observed,
        }
    }

    /// Drop the session tally; day totals keep the bytes.
    pub fn clear_session(&self, session_id: &str) {
        let mut state = self.state.lock().expect("bandwidth lock poisoned");
        state.sessions.remove(session_id);
        for day in state.days.values_mut() {
            day.per_session.remove(session_id);
        }
        state
            .fired
            .retain(|(scope, _, key)| !(*scope == LimitScope::Session && key == session_id));
    }

    pub fn reset(&self) {
        let mut state = self.state.lock().expect("bandwidth lock poisoned");
        *state = LedgerState::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::events::EventHandler;

    #[derive(Default)]
    struct AlertLog(Mutex<Vec<(String, LimitScope)>>);

    impl EventHandler for AlertLog {
        fn handle(&self, event: &EngineEvent) {
            match event {
                EngineEvent::BandwidthThresholdCrossed(alert)
                | EngineEvent::BandwidthLimitExceeded(alert) => {
                    self.0
                        .lock()
                        .unwrap()
                        .push((event.name().to_string(), alert.scope));
                }
                _ => {}
            }
        }
    }

    fn ledger(config: BandwidthConfig) -> (BandwidthLedger, Arc<AlertLog>) {
        let log = Arc::new(AlertLog::default());
        let mut events = EventDispatcher::new();
        events.register_handler(log.clone());
        (BandwidthLedger::new(config, Arc::new(events)), log)
    }

    #[test]
    fn totals_are_exact() {
        let (ledger, _) = ledger(BandwidthConfig::default());
        for i in 0..1000u64 {
            ledger.track_sent(Some("s1"), 1 + i * 7);
            ledger.track_received(Some("s1"), 3 + i * 11);
        }
        let today = ledger.today().unwrap();
        assert_eq!(today.total_mb, today.sent_mb + today.received_mb);
        let session = ledger.session_usage("s1").unwrap();
        assert_eq!(session.total_mb, session.sent_mb + session.received_mb);
        assert_eq!(today.per_session["s1"], session);
    }

    #[test]
    fn threshold_then_limit_fire_once_each() {
        let (ledger, log) = ledger(BandwidthConfig {
            session_limit_mb: 10_000.0,
            ..Default::default()
        });
        let first = ledger.track_received(Some("s1"), mb_to_bytes(450.0));
        assert!(first.threshold_crossed);
        assert!(!first.exceeded);
        ledger.track_received(Some("s1"), mb_to_bytes(10.0));
        let last = ledger.track_received(Some("s1"), mb_to_bytes(60.0));
        assert!(last.exceeded);
        ledger.track_received(Some("s1"), mb_to_bytes(1.0));

        let fired = log.0.lock().unwrap().clone();
        assert_eq!(
            fired,
            vec![
                ("bandwidth.thresholdCrossed".to_string(), LimitScope::Daily),
                ("bandwidth.limitExceeded".to_string(), LimitScope::Daily),
            ]
        );
    }

    #[test]
    fn session_scope_alerts_independently() {
        let (ledger, log) = ledger(BandwidthConfig::default());
        let status = ledger.track_sent(Some("s1"), mb_to_bytes(100.0));
        assert!(status.exceeded);
        assert_eq!(status.session.unwrap().percent, 100.0);
        ledger.track_sent(Some("s2"), mb_to_bytes(1.0));
        let fired = log.0.lock().unwrap().clone();
        assert_eq!(
            fired,
            vec![("bandwidth.limitExceeded".to_string(), LimitScope::Session)]
        );
        assert!(!ledger.check_limits(Some("s2")).exceeded);
    }

    #[test]
    fn throughput_averages_over_the_window() {
        let (ledger, _) = ledger(BandwidthConfig::default());
        assert_eq!(ledger.throughput().bytes_per_second, 0.0);
        assert!(ledger.throughput().observed_at.is_none());

        for _ in 0..3 {
            ledger.track_received(None, 1000);
            std::thread::sleep(Duration::from_millis(500));
        }
        let rate = ledger.throughput();
        assert_eq!(rate.window_bytes, 3000);
        assert!(
            (1500.0..=4000.0).contains(&rate.bytes_per_second),
            "rate {}",
            rate.bytes_per_second
        );
        assert!(rate.observed_at.is_some());
    }

    #[test]
    fn throughput_forgets_old_traffic() {
        let (ledger, _) = ledger(BandwidthConfig {
            throughput_window: Duration::from_millis(50),
            ..Default::default()
        });
        ledger.track_sent(Some("s1"), 5000);
        std::thread::sleep(Duration::from_millis(80));
        ledger.track_sent(Some("s1"), 100);
        let rate = ledger.throughput();
        assert_eq!(rate.window_bytes, 100);
        assert!(rate.bytes_per_second <= 100.0);
    }

    #[test]
    fn clearing_a_session_keeps_day_totals() {
        let (ledger, _) = ledger(BandwidthConfig::default());
        ledger.track_sent(Some("s1"), mb_to_bytes(2.0));
        ledger.track_endpoint("10.0.0.1:8080", mb_to_bytes(2.0));
        ledger.clear_session("s1");
        assert!(ledger.session_usage("s1").is_none());
        assert_eq!(ledger.today().unwrap().total_mb, 2.0);
        assert_eq!(ledger.endpoint_usage("10.0.0.1:8080"), 2.0);

        ledger.reset();
        assert!(ledger.today().is_none());
        assert_eq!(ledger.endpoint_usage("10.0.0.1:8080"), 0.0);
    }
}
