//! Ad-hoc certificate synthesis
//!
//! The last provider in the chain: given a preconfigured issuer certificate
//! and key, it signs a fresh leaf for whatever SNI the handshake presents.
//! All leaves share one server private key, so a synthesised certificate is
//! a pure CPU operation with no key generation on the hot path.
//!
//! Synthesised certificates are kept in an unbounded keyed cache for the
//! life of the process and reused while they remain valid.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, KeyPair, SerialNumber,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tracing::debug;

use crate::cert::{
    load_certificates, load_private_key, provider_error, CertificateEntry, CertificateOrigin,
    CertificateProvider,
};
use crate::error::Result;
use crate::name::ServerName;

/// Default leaf validity.
pub const DEFAULT_TTL_HOURS: u32 = 48;

/// Clock-skew allowance on the leaf's not-before.
const NOT_BEFORE_SKEW: time::Duration = time::Duration::minutes(5);

/// Signs leaves with a fixed issuer over a shared server key.
pub struct AdhocGenerator {
    issuer_certificate: rcgen::Certificate,
    issuer_key: KeyPair,
    /// The on-disk issuer certificate, appended to every served chain
    issuer_der: CertificateDer<'static>,
    server_key: KeyPair,
    server_key_der: PrivateKeyDer<'static>,
    ttl: time::Duration,
}

impl AdhocGenerator {
    /// Build a generator from PEM files: the issuer pair and the server key
    /// shared by all synthesised leaves.
    pub fn from_files(
        issuer_cert_path: &Path,
        issuer_key_path: &Path,
        server_key_path: &Path,
        ttl_hours: u32,
    ) -> anyhow::Result<AdhocGenerator> {
        let issuer_pem = std::fs::read_to_string(issuer_cert_path).map_err(|e| {
            anyhow::anyhow!("failed to read issuer certificate {:?}: {}", issuer_cert_path, e)
        })?;
        let issuer_key_pem = std::fs::read_to_string(issuer_key_path)
            .map_err(|e| anyhow::anyhow!("failed to read issuer key {:?}: {}", issuer_key_path, e))?;
        let server_key_pem = std::fs::read_to_string(server_key_path)
            .map_err(|e| anyhow::anyhow!("failed to read server key {:?}: {}", server_key_path, e))?;

        let issuer_key = KeyPair::from_pem(&issuer_key_pem)
            .map_err(|e| anyhow::anyhow!("failed to parse issuer key: {}", e))?;

        // Reconstruct a signing certificate from the issuer PEM. The signed
        // leaves chain to the on-disk issuer because subject and key match.
        let issuer_params = CertificateParams::from_ca_cert_pem(&issuer_pem)
            .map_err(|e| anyhow::anyhow!("failed to parse issuer certificate: {}", e))?;
        let issuer_certificate = issuer_params
            .self_signed(&issuer_key)
            .map_err(|e| anyhow::anyhow!("failed to rebuild issuer certificate: {}", e))?;

        let issuer_der = load_certificates(issuer_cert_path)?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("issuer file {:?} holds no certificate", issuer_cert_path))?;

        let server_key = KeyPair::from_pem(&server_key_pem)
            .map_err(|e| anyhow::anyhow!("failed to parse server key: {}", e))?;
        let server_key_der = load_private_key(server_key_path)?;

        Ok(AdhocGenerator {
            issuer_certificate,
            issuer_key,
            issuer_der,
            server_key,
            server_key_der,
            ttl: time::Duration::hours(i64::from(ttl_hours)),
        })
    }

    /// Synthesise a leaf certificate for `server_name`.
    pub fn generate(&self, server_name: &ServerName) -> anyhow::Result<CertificateEntry> {
        let mut params = CertificateParams::new(vec![server_name.punycode.clone()])
            .map_err(|e| anyhow::anyhow!("invalid subject name {}: {}", server_name, e))?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, server_name.punycode.clone());
        params.distinguished_name = dn;
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let now = time::OffsetDateTime::now_utc();
        params.not_before = now - NOT_BEFORE_SKEW;
        params.not_after = now + self.ttl;
        params.serial_number = Some(SerialNumber::from(
            rand::random::<u64>().to_be_bytes().to_vec(),
        ));

        let leaf = params
            .signed_by(&self.server_key, &self.issuer_certificate, &self.issuer_key)
            .map_err(|e| anyhow::anyhow!("failed to sign leaf for {}: {}", server_name, e))?;

        let chain = vec![leaf.der().clone(), self.issuer_der.clone()];
        CertificateEntry::from_der(chain, self.server_key_der.clone_key(), CertificateOrigin::Adhoc)
    }
}

/// Certificate provider that always succeeds by synthesising a leaf.
pub struct AdhocProvider {
    generator: AdhocGenerator,
    cache: DashMap<String, CertificateEntry>,
}

impl AdhocProvider {
    pub fn new(generator: AdhocGenerator) -> Self {
        Self {
            generator,
            cache: DashMap::new(),
        }
    }

    /// Number of cached synthesised certificates.
    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}

#[async_trait]
impl CertificateProvider for AdhocProvider {
    fn name(&self) -> &'static str {
        "adhoc"
    }

    async fn get_certificate(
        &self,
        server_name: &ServerName,
    ) -> Result<Option<CertificateEntry>> {
        let key = server_name.punycode.clone();

        if let Some(entry) = self.cache.get(&key) {
            if !entry.is_expired() {
                return Ok(Some(entry.clone()));
            }
        }

        debug!(name = %server_name, "synthesising ad-hoc certificate");
        let entry = self
            .generator
            .generate(server_name)
            .map_err(|e| provider_error(server_name, e))?;
        self.cache.insert(key, entry.clone());
        Ok(Some(entry))
    }
}
