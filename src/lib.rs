// Crate-level lint configuration
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::similar_names)]
#![allow(clippy::single_char_pattern)]
#![allow(clippy::redundant_closure_for_method_calls)]
#![allow(clippy::len_without_is_empty)]

//! honeycomb - TLS-terminating reverse proxy for container fleets
//!
//! A gateway that:
//! - Terminates HTTPS and secure-WebSocket traffic, selecting a certificate
//!   per SNI from disk, from an ACME authority, or by synthesising one
//! - Resolves host names to back-end endpoints discovered from Docker Swarm
//!   service labels, with a static table and a single-flight cache in front
//! - Forwards HTTP and WebSocket traffic, rewriting forwarded-for headers
//!   and hijacking upgraded connections
//! - Recovers the true client address from PROXY protocol v1 preambles

pub mod acme;
pub mod adhoc;
pub mod backend;
pub mod cache;
pub mod catalog;
pub mod cert;
pub mod config;
pub mod error;
pub mod health;
pub mod http_listener;
pub mod matcher;
pub mod name;
pub mod proxy;
pub mod proxy_protocol;
pub mod tls;
pub mod websocket;

// Re-export commonly used types
pub use backend::{AggregateLocator, Endpoint, Locator, StaticLocator, TlsFlag};
pub use cache::CacheLocator;
pub use catalog::{CatalogLocator, CatalogPoller};
pub use cert::{CertificateEntry, CertificateOrigin, CertificateProvider, ProviderChain};
pub use config::{Args, GatewayConfig};
pub use error::{GatewayError, Result};
pub use http_listener::GatewayState;
pub use matcher::{MatchScore, Matcher};
pub use name::ServerName;
pub use proxy::HttpProxy;
pub use websocket::WebSocketProxy;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
