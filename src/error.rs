//! Error types for the gateway

use thiserror::Error;

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Gateway error kinds
///
/// Each variant maps to a distinct propagation policy: invalid server names
/// during SNI fall back to the default certificate, locator misses become
/// HTTP 503, upstream failures become HTTP 502, and configuration or fatal
/// errors abort startup.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// The input could not be parsed as a DNS server name
    #[error("invalid server name {name:?}: {reason}")]
    InvalidServerName { name: String, reason: String },

    /// No back-end endpoint is registered for the requested name
    #[error("no endpoint found for {0}")]
    NotFound(String),

    /// The service catalog could not be reached
    #[error("catalog unavailable: {0}")]
    CatalogUnavailable(String),

    /// A certificate provider failed to produce a certificate
    #[error("certificate unavailable for {name}: {reason}")]
    CertificateUnavailable { name: String, reason: String },

    /// Connecting to the resolved upstream failed
    #[error("upstream dial failed for {address}: {reason}")]
    UpstreamDial { address: String, reason: String },

    /// The upstream spoke the protocol incorrectly
    #[error("upstream protocol error: {0}")]
    UpstreamProtocol(String),

    /// The client spoke the protocol incorrectly
    #[error("client protocol error: {0}")]
    ClientProtocol(String),

    /// Configuration error detected at startup
    #[error("configuration error: {0}")]
    Config(String),

    /// Unrecoverable error
    #[error("fatal: {0}")]
    Fatal(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// Whether the error should abort the process rather than the request.
    pub fn is_fatal(&self) -> bool {
        matches!(self, GatewayError::Config(_) | GatewayError::Fatal(_))
    }
}
