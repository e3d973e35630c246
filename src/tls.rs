//! TLS configuration
//!
//! Builds the server-side rustls configuration per handshake: the SNI from
//! the ClientHello is run through the certificate-provider chain, and the
//! winning certificate is wrapped in a [`ServerConfig`] with the gateway's
//! protocol floor (TLS 1.2), ALPN order (`h2`, then `http/1.1`), and curve
//! preferences. Client-side configurations for talking to upstreams are
//! built here too, sharing one root-CA pool.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName as PkiServerName, UnixTime};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use tracing::{debug, info, warn};

use crate::cert::{CertificateEntry, CertificateOrigin, ProviderChain};
use crate::name::ServerName;

/// Crypto provider restricted to the gateway's curve preferences:
/// X25519 plus the NIST P-256 and P-384 curves.
pub fn crypto_provider() -> Arc<CryptoProvider> {
    let mut provider = rustls::crypto::ring::default_provider();
    provider.kx_groups = vec![
        rustls::crypto::ring::kx_group::X25519,
        rustls::crypto::ring::kx_group::SECP256R1,
        rustls::crypto::ring::kx_group::SECP384R1,
    ];
    Arc::new(provider)
}

/// Protocol floor: TLS 1.2 and 1.3 only.
const PROTOCOL_VERSIONS: &[&rustls::SupportedProtocolVersion] =
    &[&rustls::version::TLS12, &rustls::version::TLS13];

/// Resolver that always serves one pre-selected certificate.
///
/// SNI-based selection happens before the rustls handshake is configured
/// (see [`TlsState::config_for_sni`]), so by the time rustls asks for a
/// certificate the answer is already fixed.
#[derive(Debug)]
struct SingleCertResolver(Arc<CertifiedKey>);

impl ResolvesServerCert for SingleCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.0.clone())
    }
}

/// Per-SNI TLS configuration factory.
pub struct TlsState {
    provider: Arc<CryptoProvider>,
    default_config: Arc<ServerConfig>,
    default_entry: CertificateEntry,
    chain: ProviderChain,
}

impl TlsState {
    pub fn new(default_entry: CertificateEntry, chain: ProviderChain) -> anyhow::Result<TlsState> {
        let provider = crypto_provider();
        let default_config =
            build_server_config(&provider, default_entry.certified_key.clone())?;
        Ok(TlsState {
            provider,
            default_config,
            default_entry,
            chain,
        })
    }

    /// The configuration served when no SNI is present or nothing better is
    /// available.
    pub fn default_config(&self) -> Arc<ServerConfig> {
        self.default_config.clone()
    }

    /// The always-present default certificate.
    pub fn default_entry(&self) -> &CertificateEntry {
        &self.default_entry
    }

    /// Select a server configuration for the handshake's SNI.
    ///
    /// Invalid or missing SNI falls back to the default certificate rather
    /// than aborting the handshake, as does a chain-wide miss.
    pub async fn config_for_sni(&self, sni: Option<&str>) -> Arc<ServerConfig> {
        let Some(sni) = sni else {
            return self.default_config();
        };

        let name = match ServerName::try_parse(sni) {
            Ok(name) => name,
            Err(e) => {
                debug!("unparseable SNI, serving default certificate: {}", e);
                return self.default_config();
            }
        };

        let Some(entry) = self.chain.get_certificate(&name).await else {
            debug!(name = %name, "no provider offered a certificate, serving default");
            return self.default_config();
        };

        match build_server_config(&self.provider, entry.certified_key) {
            Ok(config) => config,
            Err(e) => {
                warn!(name = %name, "failed to assemble TLS config, serving default: {}", e);
                self.default_config()
            }
        }
    }
}

fn build_server_config(
    provider: &Arc<CryptoProvider>,
    certified_key: Arc<CertifiedKey>,
) -> anyhow::Result<Arc<ServerConfig>> {
    let mut config = ServerConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(PROTOCOL_VERSIONS)
        .map_err(|e| anyhow::anyhow!("failed to set protocol versions: {}", e))?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(SingleCertResolver(certified_key)));

    // HTTP/2 preferred, HTTP/1.1 offered
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

/// Load the default certificate: `server.crt` + `server.key`, with
/// `issuer.crt` appended to the served chain.
pub fn load_default_certificate(base_path: &Path) -> anyhow::Result<CertificateEntry> {
    let mut chain = crate::cert::load_certificates(&base_path.join("server.crt"))?;
    let key = crate::cert::load_private_key(&base_path.join("server.key"))?;

    match crate::cert::load_certificates(&base_path.join("issuer.crt")) {
        Ok(issuer_chain) => chain.extend(issuer_chain),
        Err(e) => debug!("no issuer chain appended to default certificate: {}", e),
    }

    CertificateEntry::from_der(chain, key, CertificateOrigin::Default)
}

/// Assemble the root-CA pool from the configured PEM bundle paths.
///
/// Missing files are tolerated; unreadable files are fatal. When no bundle
/// contributes anything, the system's native roots are used instead.
pub fn root_ca_pool(paths: &[PathBuf]) -> anyhow::Result<RootCertStore> {
    let mut store = RootCertStore::empty();

    for path in paths {
        let pem = match std::fs::read(path) {
            Ok(pem) => pem,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = ?path, "CA bundle not present, skipping");
                continue;
            }
            Err(e) => {
                return Err(anyhow::anyhow!("failed to read CA bundle {:?}: {}", path, e));
            }
        };

        let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut pem.as_slice())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| anyhow::anyhow!("failed to parse CA bundle {:?}: {}", path, e))?;

        let before = store.len();
        let (_added, _skipped) = store.add_parsable_certificates(certs);
        info!(
            "loaded {} certificate(s) from CA bundle at {:?}",
            store.len() - before,
            path
        );
    }

    if store.is_empty() {
        let native = rustls_native_certs::load_native_certs();
        for cert in native.certs {
            let _ = store.add(cert);
        }
        info!("loaded {} system root certificate(s)", store.len());
    }

    Ok(store)
}

/// Client configuration for dialling upstream endpoints.
///
/// With `verify` disabled the same root pool is kept but certificate
/// verification is skipped — used for endpoints marked TLS-but-unverifiable.
pub fn upstream_client_config(roots: &RootCertStore, verify: bool) -> anyhow::Result<ClientConfig> {
    let provider = crypto_provider();

    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(PROTOCOL_VERSIONS)
        .map_err(|e| anyhow::anyhow!("failed to set protocol versions: {}", e))?;

    let config = if verify {
        builder
            .with_root_certificates(roots.clone())
            .with_no_client_auth()
    } else {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerification(provider)))
            .with_no_client_auth()
    };

    Ok(config)
}

/// Verifier that accepts any upstream certificate but still validates
/// handshake signatures.
#[derive(Debug)]
struct NoVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &PkiServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
