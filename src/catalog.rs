//! Docker Swarm service catalog
//!
//! A background poller inspects the services visible to the Docker daemon
//! and extracts routing declarations from their labels:
//!
//! - `honeycomb.match.N` — a host-name pattern the service wants to receive
//! - `honeycomb.port.N` — the target port for that pattern
//! - `honeycomb.tls.N` — optional; a truthy value marks the upstream as TLS,
//!   the special value `insecure` marks it TLS without verification
//!
//! The unindexed forms (`honeycomb.match` / `honeycomb.port`) work too; the
//! `.N` suffix only pairs a pattern with its port when a service declares
//! several.
//!
//! The poller maintains an immutable snapshot behind an [`ArcSwap`]; lookups
//! read it without taking a lock. Poll failures never fail a lookup — the
//! previous snapshot keeps serving and the poller retries with exponential
//! backoff (base 1 s, cap 30 s).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use bollard::Docker;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::backend::{best_match, Endpoint, Locator, TlsFlag};
use crate::cache::CacheLocator;
use crate::config::is_truthy;
use crate::matcher::Matcher;
use crate::name::ServerName;

/// Label namespace consumed by the poller.
const MATCH_LABEL: &str = "honeycomb.match";
const PORT_LABEL: &str = "honeycomb.port";
const TLS_LABEL: &str = "honeycomb.tls";

/// Base delay after the first poll failure.
const BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Ceiling for the failure backoff.
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Connect to the Docker daemon using the standard environment.
pub fn connect_docker() -> anyhow::Result<Docker> {
    let docker = match std::env::var("DOCKER_HOST") {
        Ok(host) if host.starts_with("http") || host.starts_with("tcp") => {
            Docker::connect_with_http_defaults()?
        }
        _ => Docker::connect_with_local_defaults()?,
    };
    Ok(docker)
}

#[derive(Default)]
struct Snapshot {
    routes: Vec<(Matcher, Endpoint)>,
}

/// Locator view over the most recent catalog snapshot.
pub struct CatalogLocator {
    snapshot: ArcSwap<Snapshot>,
    available: AtomicBool,
}

impl CatalogLocator {
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(Snapshot::default()),
            available: AtomicBool::new(false),
        }
    }

    /// Whether the last poll succeeded.
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    /// Number of routes in the current snapshot.
    pub fn route_count(&self) -> usize {
        self.snapshot.load().routes.len()
    }

    fn publish(&self, routes: Vec<(Matcher, Endpoint)>) -> bool {
        let old = self.snapshot.load();
        let changed = old.routes.len() != routes.len()
            || old
                .routes
                .iter()
                .zip(routes.iter())
                .any(|((om, oe), (nm, ne))| om.pattern() != nm.pattern() || oe != ne);
        self.snapshot.store(Arc::new(Snapshot { routes }));
        self.available.store(true, Ordering::Relaxed);
        changed
    }
}

impl Default for CatalogLocator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Locator for CatalogLocator {
    async fn locate(&self, name: &ServerName) -> Option<Endpoint> {
        let snapshot = self.snapshot.load();
        best_match(&snapshot.routes, name)
    }
}

/// Background task that keeps a [`CatalogLocator`] snapshot current.
pub struct CatalogPoller {
    docker: Docker,
    locator: Arc<CatalogLocator>,
    cache: Option<Arc<CacheLocator>>,
    interval: Duration,
    shutdown_tx: Option<mpsc::Sender<()>>,
}

impl CatalogPoller {
    pub fn new(docker: Docker, locator: Arc<CatalogLocator>, interval: Duration) -> Self {
        Self {
            docker,
            locator,
            cache: None,
            interval,
            shutdown_tx: None,
        }
    }

    /// Clear this cache whenever the snapshot changes, so stale routes do
    /// not linger for a full TTL after a redeploy.
    pub fn invalidating(mut self, cache: Arc<CacheLocator>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Spawn the poll loop. Returns immediately; stop with [`Self::stop`].
    pub fn start(&mut self) {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx);

        let docker = self.docker.clone();
        let locator = self.locator.clone();
        let cache = self.cache.clone();
        let interval = self.interval;

        tokio::spawn(async move {
            let mut failures: u32 = 0;
            loop {
                match poll_once(&docker).await {
                    Ok(routes) => {
                        if failures > 0 {
                            info!("catalog poll recovered after {} failures", failures);
                        }
                        failures = 0;
                        let count = routes.len();
                        if locator.publish(routes) {
                            debug!(routes = count, "catalog snapshot updated");
                            if let Some(cache) = &cache {
                                cache.clear();
                            }
                        }
                    }
                    Err(e) => {
                        failures = failures.saturating_add(1);
                        warn!(
                            failures,
                            "catalog poll failed, serving previous snapshot: {}", e
                        );
                    }
                }

                let delay = if failures == 0 {
                    interval
                } else {
                    backoff_delay(failures)
                };

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown_rx.recv() => {
                        info!("catalog poller shutting down");
                        break;
                    }
                }
            }
        });
    }

    /// Signal the poll loop to stop.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
    }
}

fn backoff_delay(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(5);
    (BACKOFF_BASE * 2u32.pow(exp)).min(BACKOFF_CAP)
}

async fn poll_once(docker: &Docker) -> anyhow::Result<Vec<(Matcher, Endpoint)>> {
    let services = docker
        .list_services(None::<bollard::service::ListServicesOptions<String>>)
        .await?;

    let mut routes = Vec::new();
    for service in &services {
        let Some(spec) = &service.spec else { continue };
        let Some(service_name) = &spec.name else { continue };
        let Some(labels) = &spec.labels else { continue };

        routes.extend(routes_from_labels(service_name, labels));
    }

    // Services arrive in daemon order; sort so that snapshot comparison and
    // tie-breaking stay deterministic across polls.
    routes.sort_by(|(am, ae), (bm, be)| {
        am.pattern()
            .cmp(bm.pattern())
            .then_with(|| ae.address.cmp(&be.address))
    });

    Ok(routes)
}

/// Extract `(pattern, endpoint)` pairs from one service's label set.
fn routes_from_labels(
    service_name: &str,
    labels: &HashMap<String, String>,
) -> Vec<(Matcher, Endpoint)> {
    let mut keys: Vec<&String> = labels.keys().collect();
    keys.sort();

    let mut routes = Vec::new();
    for key in keys {
        let Some(suffix) = key.strip_prefix(MATCH_LABEL) else {
            continue;
        };
        // Accept "honeycomb.match" and "honeycomb.match.N", nothing else.
        if !suffix.is_empty() && !suffix.starts_with('.') {
            continue;
        }

        let pattern = &labels[key];
        let matcher = match Matcher::compile(pattern) {
            Ok(m) => m,
            Err(e) => {
                warn!(
                    service = service_name,
                    label = key.as_str(),
                    "ignoring unparseable pattern {:?}: {}",
                    pattern,
                    e
                );
                continue;
            }
        };

        let Some(port) = labels.get(&format!("{}{}", PORT_LABEL, suffix)) else {
            warn!(
                service = service_name,
                label = key.as_str(),
                "pattern {:?} has no matching port label, skipping",
                pattern
            );
            continue;
        };

        let tls = match labels.get(&format!("{}{}", TLS_LABEL, suffix)) {
            Some(value) if value.eq_ignore_ascii_case("insecure") => TlsFlag::SkipVerify,
            Some(value) if is_truthy(value) => TlsFlag::Secure,
            _ => TlsFlag::Plain,
        };

        let endpoint = Endpoint::new(
            format!("docker service {}", service_name),
            format!("{}:{}", service_name, port),
            tls,
        );
        routes.push((matcher, endpoint));
    }

    routes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_routes_from_indexed_labels() {
        let labels = labels(&[
            ("honeycomb.match.0", "*.example.com"),
            ("honeycomb.port.0", "8080"),
            ("honeycomb.match.1", "api.example.org"),
            ("honeycomb.port.1", "9090"),
            ("honeycomb.tls.1", "true"),
        ]);

        let routes = routes_from_labels("web", &labels);
        assert_eq!(routes.len(), 2);

        let first = &routes[0];
        assert_eq!(first.0.pattern(), "*.example.com");
        assert_eq!(first.1.address, "web:8080");
        assert_eq!(first.1.tls, TlsFlag::Plain);

        let second = &routes[1];
        assert_eq!(second.1.address, "web:9090");
        assert_eq!(second.1.tls, TlsFlag::Secure);
    }

    #[test]
    fn test_routes_from_unindexed_labels() {
        let labels = labels(&[("honeycomb.match", "app.example.com"), ("honeycomb.port", "3000")]);
        let routes = routes_from_labels("app", &labels);
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].1.address, "app:3000");
    }

    #[test]
    fn test_insecure_tls_label() {
        let labels = labels(&[
            ("honeycomb.match.0", "legacy.example.com"),
            ("honeycomb.port.0", "443"),
            ("honeycomb.tls.0", "insecure"),
        ]);
        let routes = routes_from_labels("legacy", &labels);
        assert_eq!(routes[0].1.tls, TlsFlag::SkipVerify);
    }

    #[test]
    fn test_missing_port_is_skipped() {
        let labels = labels(&[("honeycomb.match.0", "a.example.com")]);
        assert!(routes_from_labels("broken", &labels).is_empty());
    }

    #[test]
    fn test_bad_pattern_is_skipped() {
        let labels = labels(&[
            ("honeycomb.match.0", "not..valid"),
            ("honeycomb.port.0", "80"),
            ("honeycomb.match.1", "ok.example.com"),
            ("honeycomb.port.1", "80"),
        ]);
        let routes = routes_from_labels("partial", &labels);
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].0.pattern(), "ok.example.com");
    }

    #[test]
    fn test_unrelated_labels_ignored() {
        let labels = labels(&[
            ("honeycomb.matchstick", "nope"),
            ("com.example.other", "x"),
        ]);
        assert!(routes_from_labels("noise", &labels).is_empty());
    }

    #[test]
    fn test_backoff_delay_caps_at_thirty_seconds() {
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(2));
        assert_eq!(backoff_delay(3), Duration::from_secs(4));
        assert_eq!(backoff_delay(6), Duration::from_secs(30));
        assert_eq!(backoff_delay(60), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_empty_snapshot_returns_not_found() {
        let locator = CatalogLocator::new();
        assert!(!locator.is_available());
        assert!(locator
            .locate(&ServerName::parse("api.example.com"))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_published_snapshot_serves_lookups() {
        let locator = CatalogLocator::new();
        let routes = vec![(
            Matcher::compile("*.example.com").unwrap(),
            Endpoint::new("svc", "svc:8080", TlsFlag::Plain),
        )];

        assert!(locator.publish(routes));
        assert!(locator.is_available());
        assert_eq!(locator.route_count(), 1);

        let hit = locator
            .locate(&ServerName::parse("api.example.com"))
            .await
            .unwrap();
        assert_eq!(hit.address, "svc:8080");
    }

    #[tokio::test]
    async fn test_publish_reports_changes() {
        let locator = CatalogLocator::new();
        let route = |addr: &str| {
            vec![(
                Matcher::compile("*.example.com").unwrap(),
                Endpoint::new("svc", addr, TlsFlag::Plain),
            )]
        };

        assert!(locator.publish(route("svc:8080")));
        assert!(!locator.publish(route("svc:8080")), "identical snapshot");
        assert!(locator.publish(route("svc:9090")), "changed endpoint");
        assert!(locator.publish(Vec::new()), "emptied snapshot");
    }
}
