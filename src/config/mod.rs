//! Engine configuration.
//!
//! Every component carries its own config struct with defaults; [`EngineConfig`]
//! aggregates them and is loadable from JSON. Durations travel as integer
//! milliseconds on the wire.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::dispatch::RetryPolicy;
use crate::modules::bandwidth::BandwidthConfig;
use crate::modules::compliance::{ComplianceConfig, NetworkProfile};
use crate::modules::quality::QualityConfig;
use crate::modules::registry::{EndpointSpec, RegistryConfig};
use crate::modules::session::{MAX_SESSION_TTL, SessionConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Dispatcher behaviour that is not part of the retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Retry through alternate protocols once the primary attempt loop fails.
    pub protocol_fallback: bool,
    #[serde(with = "duration_ms")]
    pub request_timeout: Duration,
    /// Engine-wide cap on dispatches per `rate_window`; `None` disables it.
    /// Callers over the cap wait in arrival order.
    pub max_requests_per_window: Option<usize>,
    #[serde(with = "duration_ms")]
    pub rate_window: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            protocol_fallback: true,
            request_timeout: Duration::from_secs(30),
            max_requests_per_window: None,
            rate_window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub proxies: Vec<EndpointSpec>,
    pub fallback_proxies: Vec<EndpointSpec>,
    pub registry: RegistryConfig,
    pub quality: QualityConfig,
    pub session: SessionConfig,
    pub bandwidth: BandwidthConfig,
    pub compliance: ComplianceConfig,
    pub retry: RetryPolicy,
    pub dispatch: DispatchConfig,
    pub network: NetworkProfile,
    /// Refuse to build when the network profile leaks instead of fixing it.
    pub strict_network_audit: bool,
    pub enable_metrics: bool,
    pub event_channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            proxies: Vec::new(),
            fallback_proxies: Vec::new(),
            registry: RegistryConfig::default(),
            quality: QualityConfig::default(),
            session: SessionConfig::default(),
            bandwidth: BandwidthConfig::default(),
            compliance: ComplianceConfig::default(),
            retry: RetryPolicy::default(),
            dispatch: DispatchConfig::default(),
            network: NetworkProfile::default(),
            strict_network_audit: false,
            enable_metrics: true,
            event_channel_capacity: 256,
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn to_json_string(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Reject values no component can operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let bw = &self.bandwidth;
        if !(bw.daily_limit_mb > 0.0) || !(bw.session_limit_mb > 0.0) {
            return Err(invalid("bandwidth limits must be positive"));
        }
        if !(bw.alert_threshold > 0.0 && bw.alert_threshold <= 1.0) {
            return Err(invalid("bandwidth.alert_threshold must be in (0, 1]"));
        }
        if bw.throughput_window.is_zero() {
            return Err(invalid("bandwidth.throughput_window must be non-zero"));
        }

        let quality = &self.quality;
        if quality.window == 0 || quality.recent_window == 0 {
            return Err(invalid("quality windows must be non-zero"));
        }
        if !(quality.max_expected_latency_ms > 0.0) {
            return Err(invalid("quality.max_expected_latency_ms must be positive"));
        }
        if !(0.0..=1.0).contains(&quality.degradation_threshold) {
            return Err(invalid("quality.degradation_threshold must be in [0, 1]"));
        }

        let session = &self.session;
        if session.ttl.is_zero() {
            return Err(invalid("session.ttl must be non-zero"));
        }
        if session.ttl > MAX_SESSION_TTL {
            return Err(invalid("session.ttl must not exceed 365 days"));
        }
        if session.max_sessions_per_subject == 0 {
            return Err(invalid("session.max_sessions_per_subject must be at least 1"));
        }
        if session.sweep_interval.is_zero() || self.registry.health_interval.is_zero() {
            return Err(invalid("background intervals must be non-zero"));
        }

        let retry = &self.retry;
        if retry.base_delay > retry.max_delay {
            return Err(invalid("retry.base_delay exceeds retry.max_delay"));
        }

        if self.compliance.user_agent.trim().is_empty() {
            return Err(invalid("compliance.user_agent must not be empty"));
        }
        if self.dispatch.request_timeout.is_zero() {
            return Err(invalid("dispatch.request_timeout must be non-zero"));
        }
        if self.dispatch.max_requests_per_window == Some(0) || self.dispatch.rate_window.is_zero() {
            return Err(invalid("dispatch rate limit needs at least one request per non-zero window"));
        }
        Ok(())
    }
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::Invalid(message.to_string())
}

/// Serde adapter storing a [`Duration`] as whole milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S: Serializer>(
            value: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(duration) => serializer.serialize_some(&(duration.as_millis() as u64)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
        }
    }
}
