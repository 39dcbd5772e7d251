//! Engine components
//!
//! Registry, scoring, bandwidth, sessions and compliance, plus the events and
//! metrics they report through. Each component owns its state behind its own
//! lock and is wired together by the engine.

pub mod bandwidth;
pub mod compliance;
pub mod events;
pub mod metrics;
pub mod quality;
pub mod registry;
pub mod session;

// Re-export commonly used types
pub use bandwidth::{BandwidthConfig, BandwidthLedger, BandwidthRecord, LimitStatus, SessionUsage, Throughput};
pub use compliance::{
    ComplianceConfig, CompliancePolicy, DnsLeakAuditor, FailurePolicy, LeakReport, NetworkProfile,
    RobotsDirectives,
};
pub use events::{
    BandwidthAlertEvent, ChannelHandler, EngineEvent, EventDispatcher, EventHandler, LimitScope,
    LoggingHandler, MetricsHandler, ProxyRotatedEvent, ProxySelectedEvent, ProxyStatusEvent,
    RequestCompletedEvent, RequestFailedEvent, RetryEvent, SessionEvent,
};
pub use metrics::{GlobalStats, HostStats, MetricsCollector, MetricsSnapshot};
pub use quality::{ErrorClass, PerformanceSnapshot, QualityConfig, QualityScorer};
pub use registry::{
    Credentials, EndpointSpec, EndpointStatus, HealthTarget, PendingSelection, PoolReport, Protocol,
    ProxyEndpoint, ProxyRegistry, RegistryConfig, RegistryError, SelectionRequirements,
};
pub use session::{
    MAX_SESSION_TTL, Session, SessionConfig, SessionError, SessionManager, SessionOptions, SessionStats,
};
