//! Health prober — one liveness check per call.
//!
//! `HttpProber` resolves a `(service, role)` pair to a configured endpoint
//! and issues a single HTTP GET. It classifies the outcome as healthy,
//! unhealthy status, timeout, or unreachable, and reports the latency.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::debug;

use canary_state::{GroupRole, HealthStatus};

use crate::error::ProbeError;

/// Identifies one instance group of a service.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupRef {
    pub service: String,
    pub role: GroupRole,
}

impl GroupRef {
    pub fn new(service: &str, role: GroupRole) -> Self {
        Self {
            service: service.to_string(),
            role,
        }
    }
}

impl std::fmt::Display for GroupRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.service, self.role)
    }
}

/// Result of a single probe.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthResult {
    pub status: HealthStatus,
    pub latency: Duration,
    pub error: Option<ProbeError>,
}

impl HealthResult {
    pub fn healthy(latency: Duration) -> Self {
        Self {
            status: HealthStatus::Healthy,
            latency,
            error: None,
        }
    }

    pub fn unhealthy(latency: Duration, error: ProbeError) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            latency,
            error: Some(error),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Polls a single liveness check for an instance group.
///
/// Implementations must not retry internally and must return within
/// roughly `timeout`.
#[async_trait]
pub trait HealthProber: Send + Sync {
    async fn probe(&self, group: &GroupRef, timeout: Duration) -> HealthResult;
}

/// Network addresses of a service's stable and canary groups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupEndpoints {
    /// `host:port` of the stable group.
    pub stable_address: String,
    /// `host:port` of the canary group.
    pub canary_address: String,
    /// HTTP path of the liveness endpoint (e.g. "/health").
    pub health_path: String,
}

impl GroupEndpoints {
    pub fn address(&self, role: GroupRole) -> &str {
        match role {
            GroupRole::Stable => &self.stable_address,
            GroupRole::Canary => &self.canary_address,
        }
    }
}

/// HTTP/1 liveness prober.
#[derive(Debug, Default, Clone)]
pub struct HttpProber {
    endpoints: HashMap<String, GroupEndpoints>,
}

impl HttpProber {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the endpoints of a service.
    pub fn with_service(mut self, service: &str, endpoints: GroupEndpoints) -> Self {
        self.endpoints.insert(service.to_string(), endpoints);
        self
    }
}

#[async_trait]
impl HealthProber for HttpProber {
    async fn probe(&self, group: &GroupRef, timeout: Duration) -> HealthResult {
        match self.endpoints.get(&group.service) {
            Some(ep) => http_probe(ep.address(group.role), &ep.health_path, timeout).await,
            None => HealthResult::unhealthy(
                Duration::ZERO,
                ProbeError::UnknownTarget(group.to_string()),
            ),
        }
    }
}

/// Perform an HTTP health probe against `address` + `path`.
///
/// Healthy only on a 2xx response within `timeout`.
pub async fn http_probe(address: &str, path: &str, timeout: Duration) -> HealthResult {
    let uri = format!("http://{address}{path}");
    let started = Instant::now();

    let result = tokio::time::timeout(timeout, async {
        let stream = tokio::net::TcpStream::connect(address)
            .await
            .map_err(|e| ProbeError::Unreachable(e.to_string()))?;

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| ProbeError::Unreachable(e.to_string()))?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = http::Request::builder()
            .method("GET")
            .uri(&uri)
            .header("host", address)
            .header("user-agent", "canary-health/0.1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
            .map_err(|e| ProbeError::Request(e.to_string()))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| ProbeError::Unreachable(e.to_string()))?;

        if resp.status().is_success() {
            Ok::<(), ProbeError>(())
        } else {
            Err(ProbeError::Status(resp.status().as_u16()))
        }
    })
    .await;

    let latency = started.elapsed();
    match result {
        Ok(Ok(())) => HealthResult::healthy(latency),
        Ok(Err(err)) => {
            debug!(error = %err, %uri, "health probe failed");
            HealthResult::unhealthy(latency, err)
        }
        Err(_) => {
            debug!(%uri, "health probe timed out");
            HealthResult::unhealthy(latency, ProbeError::Timeout(timeout))
        }
    }
}
