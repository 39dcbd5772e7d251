//! Engine orchestration.
//!
//! [`ProxyEngine`] owns the registry, scorer, ledger, session table and
//! compliance policy, wires them to one event dispatcher and exposes the
//! caller-facing API. Nothing here is global: build as many engines as you
//! need.

use std::sync::{Arc, Mutex};

use http::Method;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use thiserror::Error;
use url::Url;

use crate::config::{ConfigError, EngineConfig};
use crate::dispatch::{
	DispatchResponse, ProxyRequest, ProxyTransport, ReqwestTransport, RequestDispatcher,
	TransportError, TransportResponse,
};
use crate::masking::mask_sensitive;
use crate::modules::bandwidth::BandwidthLedger;
use crate::modules::compliance::{CompliancePolicy, DnsLeakAuditor, LeakReport, NetworkProfile};
use crate::modules::events::{
	ChannelHandler, EngineEvent, EventDispatcher, EventHandler, LoggingHandler, MetricsHandler,
};
use crate::modules::metrics::{MetricsCollector, MetricsSnapshot};
use crate::modules::quality::QualityScorer;
use crate::modules::registry::{EndpointSpec, PoolReport, ProxyEndpoint, ProxyRegistry, RegistryError};
use crate::modules::session::{Session, SessionError, SessionManager, SessionOptions};

/// Result alias used across the engine.
pub type EngineResult<T> = Result<T, EngineError>;

/// Caller-facing error. Messages never carry proxy credentials.
#[derive(Debug, Error)]
pub enum EngineError {
	#[error("validation failed: {0}")]
	Validation(String),
	#[error("request to {url} refused: {reason}")]
	Policy { url: String, reason: String },
	#[error("quota exceeded: {0}")]
	Quota(String),
	#[error("request failed after {attempts} attempt(s): {message}")]
	TransientNetwork {
		attempts: u32,
		status: Option<u16>,
		message: String,
		last_response: Option<Box<TransportResponse>>,
	},
	#[error("proxy pool exhausted: {0}")]
	Exhaustion(String),
	#[error("request cancelled after {attempts} attempt(s)")]
	Cancelled { attempts: u32 },
	#[error("session {0} not found or expired")]
	SessionNotFound(String),
	#[error("consent has not been granted")]
	ConsentRequired,
	#[error("configuration error: {0}")]
	Config(#[from] ConfigError),
	#[error("url parse error: {0}")]
	InvalidUrl(#[from] url::ParseError),
}

/// Coarse classification of [`EngineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
	Validation,
	Policy,
	Quota,
	TransientNetwork,
	Exhaustion,
	Cancelled,
	SessionNotFound,
	ConsentRequired,
	Config,
}

impl EngineError {
	pub fn kind(&self) -> ErrorKind {
		match self {
			EngineError::Validation(_) | EngineError::InvalidUrl(_) => ErrorKind::Validation,
			EngineError::Policy { .. } => ErrorKind::Policy,
			EngineError::Quota(_) => ErrorKind::Quota,
			EngineError::TransientNetwork { .. } => ErrorKind::TransientNetwork,
			EngineError::Exhaustion(_) => ErrorKind::Exhaustion,
			EngineError::Cancelled { .. } => ErrorKind::Cancelled,
			EngineError::SessionNotFound(_) => ErrorKind::SessionNotFound,
			EngineError::ConsentRequired => ErrorKind::ConsentRequired,
			EngineError::Config(_) => ErrorKind::Config,
		}
	}

	/// Only transient network failures are worth retrying by the caller.
	pub fn is_retryable(&self) -> bool {
		self.kind() == ErrorKind::TransientNetwork
	}

	/// Last upstream response for exhausted retries, if there was one.
	pub fn last_response(&self) -> Option<&TransportResponse> {
		match self {
			EngineError::TransientNetwork { last_response, .. } => last_response.as_deref(),
			_ => None,
		}
	}
}

impl From<RegistryError> for EngineError {
	fn from(err: RegistryError) -> Self {
		match err {
			RegistryError::Validation(message) => EngineError::Validation(message),
			RegistryError::NotFound(id) => EngineError::Validation(format!("unknown endpoint {id}")),
			RegistryError::Exhausted(message) => EngineError::Exhaustion(message),
		}
	}
}

impl From<SessionError> for EngineError {
	fn from(err: SessionError) -> Self {
		match err {
			SessionError::ConsentRequired => EngineError::ConsentRequired,
			SessionError::Quota { .. } => EngineError::Quota(err.to_string()),
			SessionError::NotFound(id) => EngineError::SessionNotFound(id),
			SessionError::Validation(message) => EngineError::Validation(message),
			SessionError::Registry(err) => err.into(),
		}
	}
}

impl From<TransportError> for EngineError {
	fn from(err: TransportError) -> Self {
		match err {
			TransportError::InvalidProxy(message) => EngineError::Validation(mask_sensitive(&message)),
			other => EngineError::TransientNetwork {
				attempts: 1,
				status: None,
				message: mask_sensitive(&other.to_string()),
				last_response: None,
			},
		}
	}
}

/// Fluent builder for [`ProxyEngine`].
pub struct ProxyEngineBuilder {
	config: EngineConfig,
	transport: Option<Arc<dyn ProxyTransport>>,
	handlers: Vec<Arc<dyn EventHandler>>,
}

impl ProxyEngineBuilder {
	pub fn new() -> Self {
		Self {
			config: EngineConfig::default(),
			transport: None,
			handlers: Vec::new(),
		}
	}

	pub fn with_config(mut self, config: EngineConfig) -> Self {
		self.config = config;
		self
	}

	/// Replace the reqwest transport, e.g. with an in-memory one in tests.
	pub fn with_transport(mut self, transport: Arc<dyn ProxyTransport>) -> Self {
		self.transport = Some(transport);
		self
	}

	pub fn with_proxies<I>(mut self, proxies: I) -> Self
	where
		I: IntoIterator<Item = EndpointSpec>,
	{
		self.config.proxies = proxies.into_iter().collect();
		self
	}

	pub fn with_fallback_proxies<I>(mut self, proxies: I) -> Self
	where
		I: IntoIterator<Item = EndpointSpec>,
	{
		self.config.fallback_proxies = proxies.into_iter().collect();
		self
	}

	pub fn with_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
		self.handlers.push(handler);
		self
	}

	pub fn disable_metrics(mut self) -> Self {
		self.config.enable_metrics = false;
		self
	}

	pub fn build(self) -> EngineResult<ProxyEngine> {
		ProxyEngine::with_parts(self.config, self.transport, self.handlers)
	}
}

impl Default for ProxyEngineBuilder {
	fn default() -> Self {
		Self::new()
	}
}

struct Background {
	token: CancellationToken,
	tasks: Vec<JoinHandle<()>>,
}

/// The proxy pool and rotation engine.
pub struct ProxyEngine {
	config: EngineConfig,
	network: NetworkProfile,
	leak_report: LeakReport,
	registry: Arc<ProxyRegistry>,
	fallback: Option<Arc<ProxyRegistry>>,
	sessions: Arc<SessionManager>,
	ledger: Arc<BandwidthLedger>,
	compliance: Arc<CompliancePolicy>,
	dispatcher: RequestDispatcher,
	metrics: Option<MetricsCollector>,
	channel: ChannelHandler,
	background: Mutex<Option<Background>>,
}

impl ProxyEngine {
	/// Obtain a builder to customise the engine instance.
	pub fn builder() -> ProxyEngineBuilder {
		ProxyEngineBuilder::new()
	}

	/// Build an engine from configuration with the reqwest transport.
	pub fn from_config(config: EngineConfig) -> EngineResult<Self> {
		Self::with_parts(config, None, Vec::new())
	}

	fn with_parts(
		config: EngineConfig,
		transport: Option<Arc<dyn ProxyTransport>>,
		handlers: Vec<Arc<dyn EventHandler>>,
	) -> EngineResult<Self> {
		config.validate()?;

		let auditor = DnsLeakAuditor::new();
		let leak_report = auditor.generate_leak_report(&config.network);
		let network = if leak_report.has_leaks {
			if config.strict_network_audit {
				return Err(ConfigError::Invalid(format!(
					"network profile leaks: {}",
					leak_report.summary()
				))
				.into());
			}
			log::warn!("network profile leaks ({}), using corrected profile", leak_report.summary());
			auditor.fix_leaks(&config.network)
		} else {
			config.network.clone()
		};

		if config.proxies.is_empty() {
			return Err(EngineError::Validation("primary proxy pool is empty".into()));
		}

		let transport: Arc<dyn ProxyTransport> = match transport {
			Some(transport) => transport,
			None => Arc::new(ReqwestTransport::new(config.dispatch.request_timeout)),
		};

		let metrics = config.enable_metrics.then(MetricsCollector::new);
		let channel = ChannelHandler::new(config.event_channel_capacity);

		let mut events = EventDispatcher::new();
		events.register_handler(Arc::new(LoggingHandler));
		if let Some(ref collector) = metrics {
			events.register_handler(Arc::new(MetricsHandler::new(collector.clone())));
		}
		events.register_handler(Arc::new(channel.clone()));
		for handler in handlers {
			events.register_handler(handler);
		}
		let events = Arc::new(events);

		let scorer = Arc::new(QualityScorer::new(config.quality.clone()));
		let registry = Arc::new(ProxyRegistry::new(
			"primary",
			config.registry.clone(),
			scorer.clone(),
			transport.clone(),
			events.clone(),
		));
		registry.load_pool(config.proxies.iter().cloned())?;

		let fallback = if config.fallback_proxies.is_empty() {
			None
		} else {
			let fallback = Arc::new(ProxyRegistry::new(
				"fallback",
				config.registry.clone(),
				scorer.clone(),
				transport.clone(),
				events.clone(),
			));
			fallback.load_pool(config.fallback_proxies.iter().cloned())?;
			Some(fallback)
		};

		let ledger = Arc::new(BandwidthLedger::new(config.bandwidth.clone(), events.clone()));
		let closed_ledger = Arc::clone(&ledger);
		let sessions = Arc::new(
			SessionManager::new(config.session.clone(), registry.clone(), events.clone())
				.on_close(move |session_id| closed_ledger.clear_session(session_id)),
		);
		let compliance = Arc::new(CompliancePolicy::new(config.compliance.clone(), transport.clone()));

		let dispatcher = RequestDispatcher::new(
			config.dispatch.clone(),
			config.retry.clone(),
			network.remote_dns(),
			transport,
			registry.clone(),
			fallback.clone(),
			sessions.clone(),
			ledger.clone(),
			compliance.clone(),
			events,
		);

		log::info!(
			"proxy engine ready: {} primary, {} fallback endpoint(s)",
			registry.len(),
			fallback.as_ref().map(|f| f.len()).unwrap_or(0)
		);

		Ok(Self {
			config,
			network,
			leak_report,
			registry,
			fallback,
			sessions,
			ledger,
			compliance,
			dispatcher,
			metrics,
			channel,
			background: Mutex::new(None),
		})
	}

	/// Perform a session-less HTTP GET.
	pub async fn get(&self, url: &str) -> EngineResult<DispatchResponse> {
		let url = Url::parse(url)?;
		self.dispatch(None, ProxyRequest::new(Method::GET, url)).await
	}

	/// Dispatch a request, optionally within a session.
	pub async fn dispatch(&self, session_id: Option<&str>, request: ProxyRequest) -> EngineResult<DispatchResponse> {
		self.dispatcher
			.dispatch(session_id, request, &CancellationToken::new())
			.await
	}

	/// Like [`dispatch`](Self::dispatch), aborting when `token` is cancelled.
	pub async fn dispatch_with_cancellation(
		&self,
		session_id: Option<&str>,
		request: ProxyRequest,
		token: &CancellationToken,
	) -> EngineResult<DispatchResponse> {
		self.dispatcher.dispatch(session_id, request, token).await
	}

	pub fn create_session(&self, subject_id: &str, options: SessionOptions) -> EngineResult<Session> {
		Ok(self.sessions.create_session(subject_id, options)?)
	}

	/// Close a session and drop its bandwidth tally. Day totals are kept.
	pub fn close_session(&self, session_id: &str) -> bool {
		self.sessions.close_session(session_id, "closed")
	}

	pub fn get_session(&self, session_id: &str) -> Option<Session> {
		self.sessions.get_session(session_id)
	}

	/// Record activity and extend the expiry (unless pinned).
	pub fn touch_session(&self, session_id: &str) -> EngineResult<Session> {
		Ok(self.sessions.touch(session_id, true)?)
	}

	pub fn rotate_session(&self, session_id: &str) -> EngineResult<ProxyEndpoint> {
		Ok(self.sessions.rotate(session_id)?)
	}

	pub fn register_endpoint(&self, spec: EndpointSpec) -> EngineResult<String> {
		Ok(self.registry.register(spec)?)
	}

	/// Remove an endpoint; sessions bound to it rebind on their next request.
	pub fn deregister_endpoint(&self, endpoint_id: &str) -> EngineResult<ProxyEndpoint> {
		self.sessions.evict_endpoint(endpoint_id);
		Ok(self.registry.deregister(endpoint_id)?)
	}

	pub fn load_pool<I>(&self, specs: I) -> EngineResult<usize>
	where
		I: IntoIterator<Item = EndpointSpec>,
	{
		Ok(self.registry.load_pool(specs)?)
	}

	/// Receive every engine event. Slow receivers lag rather than block.
	pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
		self.channel.subscribe()
	}

	/// Snapshot of collected metrics, `None` when metrics are disabled.
	pub fn metrics(&self) -> Option<MetricsSnapshot> {
		self.metrics.as_ref().map(|m| m.snapshot())
	}

	pub fn report(&self) -> PoolReport {
		self.registry.report()
	}

	pub fn fallback_report(&self) -> Option<PoolReport> {
		self.fallback.as_ref().map(|f| f.report())
	}

	pub fn config(&self) -> &EngineConfig {
		&self.config
	}

	/// Profile requests are routed with, after leak fixes.
	pub fn network_profile(&self) -> &NetworkProfile {
		&self.network
	}

	/// Audit of the configured profile, taken at construction.
	pub fn leak_report(&self) -> &LeakReport {
		&self.leak_report
	}

	pub fn registry(&self) -> &Arc<ProxyRegistry> {
		&self.registry
	}

	pub fn sessions(&self) -> &Arc<SessionManager> {
		&self.sessions
	}

	pub fn bandwidth(&self) -> &Arc<BandwidthLedger> {
		&self.ledger
	}

	pub fn compliance(&self) -> &Arc<CompliancePolicy> {
		&self.compliance
	}

	/// Start the health and session sweep loops. Calling it twice is a no-op.
	/// Must be called from within a tokio runtime.
	pub fn start_background_tasks(&self) {
		let mut background = self.background.lock().expect("background lock poisoned");
		if background.is_some() {
			return;
		}

		let token = CancellationToken::new();
		let mut tasks = vec![self.registry.spawn_health_loop(token.child_token())];
		if let Some(fallback) = &self.fallback {
			tasks.push(fallback.spawn_health_loop(token.child_token()));
		}

		tasks.push(self.sessions.spawn_sweep_loop(token.child_token()));

		log::debug!("started {} background task(s)", tasks.len());
		*background = Some(Background { token, tasks });
	}

	/// Stop background loops and close every session. Returns how many
	/// sessions were closed.
	pub async fn shutdown(&self) -> usize {
		let background = self.background.lock().expect("background lock poisoned").take();
		if let Some(Background { token, tasks }) = background {
			token.cancel();
			for task in tasks {
				if let Err(err) = task.await {
					log::warn!("background task ended abnormally: {err}");
				}
			}
		}

		let closed = self.sessions.shutdown();
		log::info!("proxy engine shut down, {closed} session(s) closed");
		closed
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn error_kinds_and_retryability() {
		let transient = EngineError::TransientNetwork {
			attempts: 4,
			status: Some(500),
			message: "status 500".into(),
			last_response: None,
		};
		assert_eq!(transient.kind(), ErrorKind::TransientNetwork);
		assert!(transient.is_retryable());
		assert!(!EngineError::Quota("x".into()).is_retryable());
		assert!(!EngineError::Cancelled { attempts: 1 }.is_retryable());
	}

	#[test]
	fn module_errors_convert() {
		let err: EngineError = RegistryError::Exhausted("empty".into()).into();
		assert_eq!(err.kind(), ErrorKind::Exhaustion);

		let err: EngineError = SessionError::NotFound("abc".into()).into();
		assert!(matches!(err, EngineError::SessionNotFound(ref id) if id == "abc"));

		let err: EngineError = SessionError::Registry(RegistryError::Exhausted("none".into())).into();
		assert_eq!(err.kind(), ErrorKind::Exhaustion);

		let err: EngineError = TransportError::InvalidProxy("http://u:p@h:1".into()).into();
		assert_eq!(err.kind(), ErrorKind::Validation);
		assert!(!err.to_string().contains("u:p@"));

		let err: EngineError = TransportError::ConnectionReset("reset".into()).into();
		assert!(err.is_retryable());
	}

	#[test]
	fn empty_pool_is_rejected() {
		let err = ProxyEngine::builder().build().err().expect("empty pool must fail");
		assert_eq!(err.kind(), ErrorKind::Validation);
	}

	#[test]
	fn strict_audit_rejects_leaky_profile() {
		let mut config = EngineConfig::default();
		config.proxies = vec![EndpointSpec::from_url("http://10.0.0.1:8080").unwrap()];
		config.network.bypass_proxy = true;
		config.strict_network_audit = true;
		let err = ProxyEngine::builder().with_config(config).build().err().expect("leaky profile must fail");
		assert_eq!(err.kind(), ErrorKind::Config);
	}
}
