//! Health checking
//!
//! `GET /honeycomb/health` reports the gateway's view of the service
//! catalog: `200 {"status":"ok"}` when the Docker daemon answers and the
//! poller has a snapshot, `200 {"status":"degraded"}` when the daemon
//! answers but the snapshot is missing, and `503` when the catalog is
//! unreachable.

use std::sync::Arc;

use bollard::Docker;
use hyper::{Response, StatusCode};
use serde::Serialize;
use tracing::debug;

use crate::catalog::CatalogLocator;
use crate::proxy::{full_body, ProxyBody};

/// Path served by the health handler.
pub const HEALTH_PATH: &str = "/honeycomb/health";

/// Health report payload.
#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub details: HealthDetails,
}

#[derive(Debug, Serialize)]
pub struct HealthDetails {
    /// Whether the Docker daemon answered the ping
    pub catalog_reachable: bool,
    /// Whether the poller holds a usable snapshot
    pub snapshot_loaded: bool,
    /// Routes in the current snapshot
    pub routes: usize,
}

impl HealthReport {
    pub fn http_status(&self) -> StatusCode {
        if self.details.catalog_reachable {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// Checks the Docker daemon and the catalog snapshot.
pub struct HealthChecker {
    docker: Docker,
    catalog: Arc<CatalogLocator>,
}

impl HealthChecker {
    pub fn new(docker: Docker, catalog: Arc<CatalogLocator>) -> Self {
        Self { docker, catalog }
    }

    pub async fn check(&self) -> HealthReport {
        let catalog_reachable = match self.docker.ping().await {
            Ok(_) => true,
            Err(e) => {
                debug!("docker ping failed: {}", e);
                false
            }
        };

        let snapshot_loaded = self.catalog.is_available();
        let status = if catalog_reachable && snapshot_loaded {
            "ok"
        } else {
            "degraded"
        };

        HealthReport {
            status,
            details: HealthDetails {
                catalog_reachable,
                snapshot_loaded,
                routes: self.catalog.route_count(),
            },
        }
    }

    /// Run the check and render the JSON response.
    pub async fn respond(&self) -> Response<ProxyBody> {
        let report = self.check().await;
        let body = serde_json::to_string(&report)
            .unwrap_or_else(|_| r#"{"status":"degraded"}"#.to_string());

        Response::builder()
            .status(report.http_status())
            .header("content-type", "application/json")
            .body(full_body(body))
            .unwrap_or_else(|_| Response::new(full_body("{}")))
    }
}
