//! Caching locator
//!
//! Wraps an inner locator and remembers its answers, including "not found".
//! Negative entries expire on a much shorter clock than positive ones so a
//! service that appears in the catalog becomes reachable quickly, while
//! steady-state lookups stay cheap.
//!
//! Concurrent lookups of the same key are collapsed onto a single inner call
//! (single-flight): the first caller takes a per-key guard and performs the
//! lookup, everyone else queues on the guard and then reads the fresh entry.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};
use tracing::debug;

use crate::backend::{Endpoint, Locator};
use crate::name::ServerName;

/// Default lifetime of a positive cache entry.
pub const DEFAULT_POSITIVE_TTL: Duration = Duration::from_secs(5 * 60);

/// Default lifetime of a negative cache entry.
pub const DEFAULT_NEGATIVE_TTL: Duration = Duration::from_secs(30);

struct CachedResult {
    endpoint: Option<Endpoint>,
    expires: Instant,
}

/// Locator cache with per-entry TTL and per-key single-flight.
pub struct CacheLocator {
    inner: Arc<dyn Locator>,
    entries: DashMap<String, CachedResult>,
    in_flight: DashMap<String, Arc<Mutex<()>>>,
    positive_ttl: Duration,
    negative_ttl: Duration,
}

impl CacheLocator {
    pub fn new(inner: Arc<dyn Locator>) -> Self {
        Self::with_ttls(inner, DEFAULT_POSITIVE_TTL, DEFAULT_NEGATIVE_TTL)
    }

    pub fn with_ttls(
        inner: Arc<dyn Locator>,
        positive_ttl: Duration,
        negative_ttl: Duration,
    ) -> Self {
        Self {
            inner,
            entries: DashMap::new(),
            in_flight: DashMap::new(),
            positive_ttl,
            negative_ttl,
        }
    }

    fn load_fresh(&self, key: &str) -> Option<Option<Endpoint>> {
        let entry = self.entries.get(key)?;
        if entry.expires <= Instant::now() {
            return None;
        }
        Some(entry.endpoint.clone())
    }

    fn store(&self, key: &str, endpoint: Option<Endpoint>) {
        let ttl = if endpoint.is_some() {
            self.positive_ttl
        } else {
            self.negative_ttl
        };
        self.entries.insert(
            key.to_string(),
            CachedResult {
                endpoint,
                expires: Instant::now() + ttl,
            },
        );
    }

    /// Drop all cached entries.
    pub fn clear(&self) {
        self.entries.clear();
    }
}

#[async_trait]
impl Locator for CacheLocator {
    async fn locate(&self, name: &ServerName) -> Option<Endpoint> {
        let key = name.punycode.as_str();

        if let Some(cached) = self.load_fresh(key) {
            return cached;
        }

        // The guard map is keyed like the entry map and bounded the same way,
        // by the number of unique names seen.
        let guard = self
            .in_flight
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _flight = guard.lock().await;

        // Whoever held the guard before us may have refreshed the entry.
        if let Some(cached) = self.load_fresh(key) {
            return cached;
        }

        let result = self.inner.locate(name).await;
        debug!(
            name = %name,
            found = result.is_some(),
            "locator cache miss resolved"
        );
        self.store(key, result.clone());
        result
    }
}
