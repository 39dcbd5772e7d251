//! Dispatch metrics.
//!
//! Aggregates request outcomes per target host: counts, retries, transferred
//! bytes and latency average/p95 over a bounded window.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Aggregated metrics across all hosts.
#[derive(Debug, Clone)]
pub struct GlobalStats {
    pub started_at: DateTime<Utc>,
    pub total_requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub retries: u64,
    pub bytes_transferred: u64,
    pub average_latency: Option<Duration>,
}

impl Default for GlobalStats {
    fn default() -> Self {
        Self {
            started_at: Utc::now(),
            total_requests: 0,
            successes: 0,
            failures: 0,
            retries: 0,
            bytes_transferred: 0,
            average_latency: None,
        }
    }
}

/// Host-scoped metrics snapshot.
#[derive(Debug, Clone)]
pub struct HostStats {
    pub host: String,
    pub total_requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub retries: u64,
    pub bytes_transferred: u64,
    pub average_latency: Option<Duration>,
    pub p95_latency: Option<Duration>,
    pub last_status: Option<u16>,
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub global: GlobalStats,
    pub hosts: Vec<HostStats>,
}

#[derive(Debug, Default)]
struct HostAccumulator {
    total_requests: u64,
    successes: u64,
    failures: u64,
    retries: u64,
    bytes_transferred: u64,
    latencies: VecDeque<Duration>,
    last_status: Option<u16>,
}

impl HostAccumulator {
    fn latency_stats(&self) -> (Option<Duration>, Option<Duration>) {
        if self.latencies.is_empty() {
            return (None, None);
        }
        let mut samples: Vec<_> = self.latencies.iter().copied().collect();
        samples.sort_unstable();
        let avg = samples.iter().map(Duration::as_secs_f64).sum::<f64>() / samples.len() as f64;
        let p95_index = ((samples.len() as f64 * 0.95).ceil() as usize).saturating_sub(1);
        (Some(Duration::from_secs_f64(avg)), Some(samples[p95_index]))
    }

    fn snapshot(&self, host: &str) -> HostStats {
        let (average_latency, p95_latency) = self.latency_stats();
        HostStats {
            host: host.to_string(),
            total_requests: self.total_requests,
            successes: self.successes,
            failures: self.failures,
            retries: self.retries,
            bytes_transferred: self.bytes_transferred,
            average_latency,
            p95_latency,
            last_status: self.last_status,
        }
    }
}

#[derive(Debug)]
struct MetricsState {
    global: GlobalStats,
    window: usize,
    hosts: HashMap<String, HostAccumulator>,
}

impl MetricsState {
    fn host_mut(&mut self, host: &str) -> &mut HostAccumulator {
        self.hosts.entry(host.to_string()).or_default()
    }
}

/// Thread-safe metrics collector shared with the event pipeline.
#[derive(Clone, Debug)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsState>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::with_window(128)
    }

    pub fn with_window(window: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsState {
                global: GlobalStats::default(),
                window: window.max(16),
                hosts: HashMap::new(),
            })),
        }
    }

    /// Record a completed dispatch; statuses below 400 count as successes.
    pub fn record_response(&self, host: &str, status: u16, latency: Duration, bytes: u64) {
        let mut guard = self.inner.lock().expect("metrics lock poisoned");
        let success = status < 400;
        guard.global.total_requests += 1;
        guard.global.bytes_transferred += bytes;
        if success {
            guard.global.successes += 1;
        } else {
            guard.global.failures += 1;
        }
        guard.global.average_latency = Some(match guard.global.average_latency {
            Some(avg) => Duration::from_secs_f64(avg.as_secs_f64() * 0.9 + latency.as_secs_f64() * 0.1),
            None => latency,
        });

        let window = guard.window;
        let acc = guard.host_mut(host);
        acc.total_requests += 1;
        acc.bytes_transferred += bytes;
        acc.last_status = Some(status);
        if success {
            acc.successes += 1;
        } else {
            acc.failures += 1;
        }
        if acc.latencies.len() == window {
            acc.latencies.pop_front();
        }
        acc.latencies.push_back(latency);
    }

    pub fn record_error(&self, host: &str) {
        let mut guard = self.inner.lock().expect("metrics lock poisoned");
        guard.global.total_requests += 1;
        guard.global.failures += 1;
        let acc = guard.host_mut(host);
        acc.total_requests += 1;
        acc.failures += 1;
    }

    pub fn record_retry(&self, host: &str) {
        let mut guard = self.inner.lock().expect("metrics lock poisoned");
        guard.global.retries += 1;
        guard.host_mut(host).retries += 1;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let guard = self.inner.lock().expect("metrics lock poisoned");
        let mut hosts: Vec<HostStats> = guard
            .hosts
            .iter()
            .map(|(host, acc)| acc.snapshot(host))
            .collect();
        hosts.sort_by(|a, b| a.host.cmp(&b.host));
        MetricsSnapshot {
            global: guard.global.clone(),
            hosts,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
