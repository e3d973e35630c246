//! Back-end endpoints and the locator chain
//!
//! A [`Locator`] resolves a server name to an [`Endpoint`]. Locators compose:
//! the static locator answers from a fixed table, the catalog locator answers
//! from the service-discovery snapshot, the aggregate walks an ordered list
//! of children, and the caching locator (see [`crate::cache`]) sits in front
//! of all of them.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{GatewayError, Result};
use crate::matcher::{MatchScore, Matcher};
use crate::name::ServerName;

/// How to speak to an upstream endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsFlag {
    /// Plain-text HTTP / WebSocket
    Plain,
    /// TLS with certificate verification against the root-CA pool
    Secure,
    /// TLS without certificate verification
    SkipVerify,
}

/// A back-end HTTP(S) server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Human readable description, not necessarily unique
    pub description: String,
    /// Network address including the port number or name
    pub address: String,
    /// Whether the back-end expects TLS, and if so whether to verify it
    pub tls: TlsFlag,
}

impl Endpoint {
    pub fn new(description: impl Into<String>, address: impl Into<String>, tls: TlsFlag) -> Self {
        Self {
            description: description.into(),
            address: address.into(),
            tls,
        }
    }

    /// Whether the `https`/`wss` scheme family applies.
    pub fn is_tls(&self) -> bool {
        !matches!(self.tls, TlsFlag::Plain)
    }

    /// URL scheme used to connect to this endpoint.
    pub fn scheme(&self, websocket: bool) -> &'static str {
        match (websocket, self.is_tls()) {
            (false, false) => "http",
            (false, true) => "https",
            (true, false) => "ws",
            (true, true) => "wss",
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.address, self.description)
    }
}

/// Resolves server names to back-end endpoints.
///
/// `None` means "not found"; locator-internal failures are never surfaced
/// here — implementations log and fall back to whatever they can serve.
#[async_trait]
pub trait Locator: Send + Sync {
    async fn locate(&self, name: &ServerName) -> Option<Endpoint>;
}

/// Pick the best-scoring route from a pattern table.
///
/// Ties resolve to the earliest registration.
pub fn best_match<'a>(
    routes: impl IntoIterator<Item = &'a (Matcher, Endpoint)>,
    name: &ServerName,
) -> Option<Endpoint> {
    let mut best: Option<(&Endpoint, MatchScore)> = None;
    for (matcher, endpoint) in routes {
        let score = matcher.match_score(name);
        if score == 0 {
            continue;
        }
        match best {
            Some((_, leader)) if leader >= score => {}
            _ => best = Some((endpoint, score)),
        }
    }
    best.map(|(endpoint, _)| endpoint.clone())
}

/// A fixed table of `(pattern, endpoint)` routes.
pub struct StaticLocator {
    routes: Vec<(Matcher, Endpoint)>,
}

impl StaticLocator {
    pub fn new(routes: Vec<(Matcher, Endpoint)>) -> Self {
        Self { routes }
    }

    /// Parse the `DEFAULT_ENDPOINTS` environment value.
    ///
    /// Whitespace-separated entries of the form `pattern=address[,insecure]`.
    /// Static endpoints are assumed to speak TLS; the `insecure` flag keeps
    /// the TLS scheme but skips upstream certificate verification.
    pub fn from_env_value(value: &str) -> Result<StaticLocator> {
        let mut routes = Vec::new();

        for entry in value.split_whitespace() {
            let (pattern, target) = entry.split_once('=').ok_or_else(|| {
                GatewayError::Config(format!(
                    "malformed endpoint mapping {:?}, expected pattern=address[,insecure]",
                    entry
                ))
            })?;

            let matcher = Matcher::compile(pattern)?;

            let mut parts = target.split(',');
            let address = parts.next().unwrap_or_default();
            if address.is_empty() {
                return Err(GatewayError::Config(format!(
                    "endpoint mapping {:?} has an empty address",
                    entry
                )));
            }

            let mut tls = TlsFlag::Secure;
            for flag in parts {
                match flag {
                    "insecure" => tls = TlsFlag::SkipVerify,
                    other => {
                        return Err(GatewayError::Config(format!(
                            "unknown endpoint flag {:?} in {:?}",
                            other, entry
                        )));
                    }
                }
            }

            let endpoint = Endpoint::new(
                format!("static route for {}", pattern),
                address.to_string(),
                tls,
            );
            routes.push((matcher, endpoint));
        }

        Ok(StaticLocator { routes })
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[async_trait]
impl Locator for StaticLocator {
    async fn locate(&self, name: &ServerName) -> Option<Endpoint> {
        best_match(&self.routes, name)
    }
}

/// Walks child locators in order; the first hit wins.
pub struct AggregateLocator {
    children: Vec<Arc<dyn Locator>>,
}

impl AggregateLocator {
    pub fn new(children: Vec<Arc<dyn Locator>>) -> Self {
        Self { children }
    }
}

#[async_trait]
impl Locator for AggregateLocator {
    async fn locate(&self, name: &ServerName) -> Option<Endpoint> {
        for child in &self.children {
            if let Some(endpoint) = child.locate(name).await {
                return Some(endpoint);
            }
        }
        None
    }
}
