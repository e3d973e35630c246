//! Configuration
//!
//! All configuration values are externalized — every option is both a CLI
//! flag and an environment variable, with the environment being the primary
//! interface in container deployments.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::acme::{AcmeConfig, LETS_ENCRYPT_PRODUCTION};
use crate::backend::StaticLocator;
use crate::error::{GatewayError, Result};
use crate::matcher::Matcher;

/// honeycomb - TLS-terminating reverse proxy for container fleets
#[derive(Parser, Debug, Clone)]
#[command(name = "honeycomb")]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Secure (HTTPS/WSS) listen port
    #[arg(long, env = "PORT", default_value_t = 8443)]
    pub port: u16,

    /// Insecure listen port (serves only the HTTPS redirect)
    #[arg(long, env = "INSECURE_PORT", default_value_t = 8080)]
    pub insecure_port: u16,

    /// Directory holding server.crt, server.key, issuer.crt, issuer.key and
    /// per-domain certificate pairs
    #[arg(long, env = "CERTIFICATE_PATH", default_value = "/etc/honeycomb/certificates")]
    pub certificate_path: PathBuf,

    /// ACME account email; enables the ACME provider together with
    /// --acme-domains
    #[arg(long, env = "ACME_EMAIL")]
    pub acme_email: Option<String>,

    /// Comma/space separated host patterns the ACME account may issue for
    #[arg(long, env = "ACME_DOMAINS")]
    pub acme_domains: Option<String>,

    /// Directory for the ACME account and issued certificates
    #[arg(long, env = "ACME_CACHE_PATH")]
    pub acme_cache_path: Option<PathBuf>,

    /// ACME directory URL
    #[arg(long, env = "ACME_URL", default_value = LETS_ENCRYPT_PRODUCTION)]
    pub acme_url: String,

    /// Colon-separated PEM bundle paths for the upstream root-CA pool
    #[arg(long, env = "CA_PATH", default_value = "/etc/ssl/certs/ca-certificates.crt")]
    pub ca_path: String,

    /// Unwrap the PROXY protocol v1 header on every accepted connection
    #[arg(long, env = "PROXY_PROTOCOL")]
    pub proxy_protocol: Option<String>,

    /// Static endpoint mappings, whitespace separated
    /// (pattern=address[,insecure])
    #[arg(long, env = "DEFAULT_ENDPOINTS")]
    pub default_endpoints: Option<String>,

    /// Seconds between service-catalog polls
    #[arg(long, env = "CATALOG_POLL_INTERVAL", default_value_t = 30)]
    pub catalog_poll_interval: u64,

    /// Seconds to wait for in-flight requests on shutdown
    #[arg(long, env = "SHUTDOWN_GRACE", default_value_t = 30)]
    pub shutdown_grace: u64,

    /// Validity of ad-hoc synthesised certificates, in hours
    #[arg(long, env = "ADHOC_TTL_HOURS", default_value_t = 48)]
    pub adhoc_ttl_hours: u32,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Enable JSON log format
    #[arg(long, env = "JSON_LOGS")]
    pub json_logs: bool,

    /// Validate configuration and exit
    #[arg(long)]
    pub validate: bool,
}

/// Truthy parsing for flag-style environment values.
pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Validated gateway configuration derived from [`Args`].
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub port: u16,
    pub insecure_port: u16,
    pub certificate_path: PathBuf,
    pub acme: Option<AcmeConfig>,
    pub ca_bundles: Vec<PathBuf>,
    pub proxy_protocol: bool,
    pub default_endpoints: Option<String>,
    pub catalog_poll_interval: Duration,
    pub shutdown_grace: Duration,
    pub adhoc_ttl_hours: u32,
}

impl GatewayConfig {
    pub fn from_args(args: &Args) -> Result<GatewayConfig> {
        let acme = match (&args.acme_email, &args.acme_domains) {
            (Some(email), Some(domains)) => {
                let allowed = parse_patterns(domains)?;
                if allowed.is_empty() {
                    None
                } else {
                    Some(AcmeConfig {
                        directory_url: args.acme_url.clone(),
                        email: email.clone(),
                        allowed,
                        cache_path: args
                            .acme_cache_path
                            .clone()
                            .unwrap_or_else(|| args.certificate_path.join("acme")),
                    })
                }
            }
            _ => None,
        };

        let ca_bundles = args
            .ca_path
            .split(':')
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
            .collect();

        let config = GatewayConfig {
            port: args.port,
            insecure_port: args.insecure_port,
            certificate_path: args.certificate_path.clone(),
            acme,
            ca_bundles,
            proxy_protocol: args
                .proxy_protocol
                .as_deref()
                .map(is_truthy)
                .unwrap_or(false),
            default_endpoints: args.default_endpoints.clone(),
            catalog_poll_interval: Duration::from_secs(args.catalog_poll_interval),
            shutdown_grace: Duration::from_secs(args.shutdown_grace),
            adhoc_ttl_hours: args.adhoc_ttl_hours,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.port == self.insecure_port {
            return Err(GatewayError::Config(format!(
                "secure and insecure ports must differ (both {})",
                self.port
            )));
        }
        if self.catalog_poll_interval.is_zero() {
            return Err(GatewayError::Config(
                "catalog poll interval must be non-zero".to_string(),
            ));
        }
        if self.adhoc_ttl_hours == 0 {
            return Err(GatewayError::Config(
                "ad-hoc certificate TTL must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Build the static locator from `DEFAULT_ENDPOINTS`.
    pub fn static_locator(&self) -> Result<StaticLocator> {
        match &self.default_endpoints {
            Some(value) => StaticLocator::from_env_value(value),
            None => Ok(StaticLocator::new(Vec::new())),
        }
    }
}

/// Parse a comma/space separated pattern list.
fn parse_patterns(value: &str) -> Result<Vec<Matcher>> {
    value
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|p| !p.is_empty())
        .map(Matcher::compile)
        .collect()
}
