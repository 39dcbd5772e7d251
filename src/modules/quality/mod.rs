//! Rolling quality scoring for proxy endpoints.
//!
//! Keeps a bounded window of outcomes and latencies per endpoint, blends
//! success rate and speed into a `[0, 1]` score, and flags endpoints whose
//! recent success rate is sliding below their lifetime average.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

/// Score returned for endpoints that have never been measured.
pub const NEUTRAL_SCORE: f64 = 0.5;

/// Latency assumed when an endpoint has no successful samples yet.
const DEFAULT_LATENCY_MS: f64 = 1000.0;

const SUCCESS_WEIGHT: f64 = 0.7;
const SPEED_WEIGHT: f64 = 0.3;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    /// Samples kept per endpoint.
    pub window: usize,
    /// Samples compared against the lifetime rate for degradation.
    pub recent_window: usize,
    /// Lifetime samples required before degradation can be reported.
    pub min_samples: u64,
    pub degradation_threshold: f64,
    pub max_expected_latency_ms: f64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            window: 100,
            recent_window: 10,
            min_samples: 10,
            degradation_threshold: 0.2,
            max_expected_latency_ms: 5000.0,
        }
    }
}

/// Failure classes recorded against an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorClass {
    Status(u16),
    ConnectionReset,
    ConnectionRefused,
    TimedOut,
    Other,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::Status(code) => write!(f, "status_{code}"),
            ErrorClass::ConnectionReset => write!(f, "ECONNRESET"),
            ErrorClass::ConnectionRefused => write!(f, "ECONNREFUSED"),
            ErrorClass::TimedOut => write!(f, "ETIMEDOUT"),
            ErrorClass::Other => write!(f, "other"),
        }
    }
}

/// Performance figures derived from the rolling window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSnapshot {
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    pub total_requests: u64,
}

impl Default for PerformanceSnapshot {
    fn default() -> Self {
        Self {
            success_rate: 1.0,
            avg_latency_ms: 0.0,
            total_requests: 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    success: bool,
    latency_ms: Option<f64>,
}

#[derive(Debug)]
struct EndpointQuality {
    samples: VecDeque<Sample>,
    lifetime_successes: u64,
    lifetime_total: u64,
    errors: HashMap<ErrorClass, u64>,
}

impl EndpointQuality {
    fn new(window: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(window),
            lifetime_successes: 0,
            lifetime_total: 0,
            errors: HashMap::new(),
        }
    }

    fn push(&mut self, sample: Sample, window: usize) {
        if self.samples.len() == window {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        self.lifetime_total += 1;
        if sample.success {
            self.lifetime_successes += 1;
        }
    }

    fn window_success_rate(&self) -> f64 {
        if self.samples.is_empty() {
            return 1.0;
        }
        let successes = self.samples.iter().filter(|s| s.success).count();
        successes as f64 / self.samples.len() as f64
    }

    fn recent_success_rate(&self, recent: usize) -> f64 {
        let take = recent.min(self.samples.len());
        if take == 0 {
            return 1.0;
        }
        let successes = self
            .samples
            .iter()
            .rev()
            .take(take)
            .filter(|s| s.success)
            .count();
        successes as f64 / take as f64
    }

    fn lifetime_success_rate(&self) -> f64 {
        if self.lifetime_total == 0 {
            return 1.0;
        }
        self.lifetime_successes as f64 / self.lifetime_total as f64
    }

    fn avg_latency_ms(&self) -> Option<f64> {
        let latencies: Vec<f64> = self.samples.iter().filter_map(|s| s.latency_ms).collect();
        if latencies.is_empty() {
            return None;
        }
        Some(latencies.iter().sum::<f64>() / latencies.len() as f64)
    }
}

/// Thread-safe per-endpoint quality tracker.
#[derive(Debug)]
pub struct QualityScorer {
    config: QualityConfig,
    endpoints: RwLock<HashMap<String, EndpointQuality>>,
}

impl QualityScorer {
    pub fn new(config: QualityConfig) -> Self {
        Self {
            config: QualityConfig {
                window: config.window.max(1),
                recent_window: config.recent_window.max(1),
                ..config
            },
            endpoints: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &QualityConfig {
        &self.config
    }

    pub fn record_success(&self, id: &str, latency_ms: f64) {
        let window = self.config.window;
        let mut guard = self.endpoints.write().expect("quality lock poisoned");
        guard
            .entry(id.to_string())
            .or_insert_with(|| EndpointQuality::new(window))
            .push(
                Sample {
                    success: true,
                    latency_ms: Some(latency_ms.max(0.0)),
                },
                window,
            );
    }

    pub fn record_failure(&self, id: &str, error: ErrorClass) {
        let window = self.config.window;
        let mut guard = self.endpoints.write().expect("quality lock poisoned");
        let entry = guard
            .entry(id.to_string())
            .or_insert_with(|| EndpointQuality::new(window));
        entry.push(
            Sample {
                success: false,
                latency_ms: None,
            },
            window,
        );
        *entry.errors.entry(error).or_default() += 1;
    }

    /// Selection score in `[0, 1]`.
    pub fn score(&self, id: &str) -> f64 {
        let guard = self.endpoints.read().expect("quality lock poisoned");
        match guard.get(id) {
            Some(quality) => self.blend(quality),
            None => NEUTRAL_SCORE,
        }
    }

    fn blend(&self, quality: &EndpointQuality) -> f64 {
        let success_rate = quality.window_success_rate();
        let latency = quality.avg_latency_ms().unwrap_or(DEFAULT_LATENCY_MS);
        let max_expected = self.config.max_expected_latency_ms.max(1.0);
        let speed = (1.0 - latency / max_expected).max(0.0);
        (SUCCESS_WEIGHT * success_rate + SPEED_WEIGHT * speed).clamp(0.0, 1.0)
    }

    /// True when the recent success rate dropped more than the configured
    /// threshold below the lifetime rate.
    pub fn has_degraded(&self, id: &str) -> bool {
        let guard = self.endpoints.read().expect("quality lock poisoned");
        let Some(quality) = guard.get(id) else {
            return false;
        };
        if quality.lifetime_total < self.config.min_samples {
            return false;
        }
        let recent = quality.recent_success_rate(self.config.recent_window);
        quality.lifetime_success_rate() - recent > self.config.degradation_threshold
    }

    pub fn performance(&self, id: &str) -> Option<PerformanceSnapshot> {
        let guard = self.endpoints.read().expect("quality lock poisoned");
        guard.get(id).map(|quality| PerformanceSnapshot {
            success_rate: quality.window_success_rate(),
            avg_latency_ms: quality.avg_latency_ms().unwrap_or(0.0),
            total_requests: quality.lifetime_total,
        })
    }

    pub fn error_counts(&self, id: &str) -> HashMap<ErrorClass, u64> {
        let guard = self.endpoints.read().expect("quality lock poisoned");
        guard
            .get(id)
            .map(|quality| quality.errors.clone())
            .unwrap_or_default()
    }

    pub fn all_scores(&self) -> HashMap<String, f64> {
        let guard = self.endpoints.read().expect("quality lock poisoned");
        guard
            .iter()
            .map(|(id, quality)| (id.clone(), self.blend(quality)))
            .collect()
    }

    /// Measured endpoints whose score is at least `threshold`.
    pub fn quality_endpoints(&self, threshold: f64) -> Vec<String> {
        let mut ids: Vec<String> = self
            .all_scores()
            .into_iter()
            .filter(|(_, score)| *score >= threshold)
            .map(|(id, _)| id)
            .collect();
        ids.sort();
        ids
    }

    pub fn forget(&self, id: &str) {
        self.endpoints
            .write()
            .expect("quality lock poisoned")
            .remove(id);
    }
}

impl Default for QualityScorer {
    fn default() -> Self {
        Self::new(QualityConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn unknown_endpoint_is_neutral() {
        let scorer = QualityScorer::default();
        assert_eq!(scorer.score("10.0.0.1:8080"), NEUTRAL_SCORE);
        assert!(!scorer.has_degraded("10.0.0.1:8080"));
    }

    #[test]
    fn blends_success_and_speed() {
        let scorer = QualityScorer::default();
        for _ in 0..4 {
            scorer.record_success("a:1", 1000.0);
        }
        // 0.7 * 1.0 + 0.3 * (1 - 1000/5000)
        assert!((scorer.score("a:1") - 0.94).abs() < 1e-9);

        scorer.record_failure("b:1", ErrorClass::TimedOut);
        // no latency samples -> 1000ms assumed
        assert!((scorer.score("b:1") - 0.24).abs() < 1e-9);
    }

    #[test]
    fn score_stays_in_unit_interval() {
        let scorer = QualityScorer::default();
        let mut rng = rand::thread_rng();
        for _ in 0..1000 {
            if rng.r#gen::<bool>() {
                scorer.record_success("x:1", rng.gen_range(0.0..20_000.0));
            } else {
                scorer.record_failure("x:1", ErrorClass::Status(503));
            }
            let score = scorer.score("x:1");
            assert!((0.0..=1.0).contains(&score), "score {score} out of range");
        }
    }

    #[test]
    fn window_is_bounded() {
        let scorer = QualityScorer::new(QualityConfig {
            window: 5,
            ..Default::default()
        });
        for _ in 0..5 {
            scorer.record_failure("w:1", ErrorClass::ConnectionReset);
        }
        for _ in 0..5 {
            scorer.record_success("w:1", 100.0);
        }
        let perf = scorer.performance("w:1").unwrap();
        assert_eq!(perf.success_rate, 1.0);
        assert_eq!(perf.total_requests, 10);
        assert_eq!(
            scorer.error_counts("w:1").get(&ErrorClass::ConnectionReset),
            Some(&5)
        );
    }

    #[test]
    fn needs_minimum_samples_before_flagging() {
        let scorer = QualityScorer::default();
        for _ in 0..9 {
            scorer.record_failure("n:1", ErrorClass::Other);
        }
        assert!(!scorer.has_degraded("n:1"));
    }

    #[test]
    fn detects_sliding_quality() {
        let scorer = QualityScorer::default();
        for _ in 0..40 {
            scorer.record_success("s:1", 200.0);
        }
        assert!(!scorer.has_degraded("s:1"));
        for _ in 0..5 {
            scorer.record_failure("s:1", ErrorClass::Status(502));
        }
        // lifetime 40/45 ~ 0.89, recent 5/10 = 0.5
        assert!(scorer.has_degraded("s:1"));
    }

    #[test]
    fn lists_quality_endpoints() {
        let scorer = QualityScorer::default();
        scorer.record_success("good:1", 100.0);
        scorer.record_failure("bad:1", ErrorClass::Status(500));
        assert_eq!(scorer.quality_endpoints(0.7), vec!["good:1".to_string()]);
        scorer.forget("good:1");
        assert!(scorer.quality_endpoints(0.7).is_empty());
    }
}
