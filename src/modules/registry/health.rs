//! Endpoint health checks.
//!
//! A check is a direct GET to `http://host:port{health_path}`; any 2xx within
//! the endpoint timeout counts as healthy. Checks run concurrently and never
//! touch the registry table.

use std::time::{Duration, Instant};

use url::Url;

use super::ProxyEndpoint;
use crate::dispatch::{ProxyRequest, ProxyTransport};

#[derive(Debug, Clone)]
pub struct HealthTarget {
    pub endpoint_id: String,
    pub url: String,
    pub timeout: Duration,
}

impl HealthTarget {
    pub fn for_endpoint(endpoint: &ProxyEndpoint) -> Self {
        Self {
            endpoint_id: endpoint.id.clone(),
            url: endpoint.health_url(),
            timeout: endpoint.health_timeout,
        }
    }

    async fn run(&self, transport: &dyn ProxyTransport) -> bool {
        let url = match Url::parse(&self.url) {
            Ok(url) => url,
            Err(err) => {
                log::warn!("health check for {} has invalid url: {err}", self.endpoint_id);
                return false;
            }
        };

        let request = ProxyRequest::get(url).with_timeout(self.timeout);
        let started = Instant::now();
        let outcome = tokio::time::timeout(self.timeout, transport.send(None, &request)).await;
        match outcome {
            Ok(Ok(response)) if (200..300).contains(&response.status) => {
                log::debug!(
                    "health check {} ok in {}ms",
                    self.endpoint_id,
                    started.elapsed().as_millis()
                );
                true
            }
            Ok(Ok(response)) => {
                log::debug!("health check {} returned {}", self.endpoint_id, response.status);
                false
            }
            Ok(Err(err)) => {
                log::debug!("health check {} failed: {err}", self.endpoint_id);
                false
            }
            Err(_) => {
                log::debug!("health check {} timed out", self.endpoint_id);
                false
            }
        }
    }
}

/// Check all targets in parallel, returning `(endpoint_id, healthy)` pairs.
pub(crate) async fn check_all(
    transport: &dyn ProxyTransport,
    targets: &[HealthTarget],
) -> Vec<(String, bool)> {
    let futures: Vec<_> = targets
        .iter()
        .map(|target| async move { (target.endpoint_id.clone(), target.run(transport).await) })
        .collect();

    futures_util::future::join_all(futures).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{ProxyRoute, TransportError, TransportResponse};
    use async_trait::async_trait;

    struct SlowTransport;

    #[async_trait]
    impl ProxyTransport for SlowTransport {
        async fn send(
            &self,
            _route: Option<&ProxyRoute>,
            request: &ProxyRequest,
        ) -> Result<TransportResponse, TransportError> {
            if request.host() == "10.0.0.2" {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            let status = if request.host() == "10.0.0.3" { 503 } else { 204 };
            Ok(TransportResponse {
                status,
                headers: Default::default(),
                body: Default::default(),
                url: request.url.clone(),
                bytes_sent: 0,
                bytes_received: 0,
            })
        }
    }

    fn target(host: &str) -> HealthTarget {
        HealthTarget {
            endpoint_id: format!("{host}:8080"),
            url: format!("http://{host}:8080/health"),
            timeout: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn checks_classify_status_and_timeouts() {
        let targets = vec![target("10.0.0.1"), target("10.0.0.2"), target("10.0.0.3")];
        let results = check_all(&SlowTransport, &targets).await;
        assert_eq!(
            results,
            vec![
                ("10.0.0.1:8080".to_string(), true),
                ("10.0.0.2:8080".to_string(), false),
                ("10.0.0.3:8080".to_string(), false),
            ]
        );
    }
}
