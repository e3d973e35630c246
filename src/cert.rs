//! Certificates: entry type, provider chain, and the file-based provider
//!
//! A [`CertificateProvider`] answers "give me a certificate for this SNI".
//! Providers are composed into an ordered [`ProviderChain`]: the first
//! provider that returns an entry wins, a provider error is logged and the
//! next one is tried, and only when every provider misses does the TLS layer
//! fall back to the default certificate.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use rustls_pemfile::{certs, pkcs8_private_keys, rsa_private_keys};
use tracing::{debug, info, warn};

use crate::error::{GatewayError, Result};
use crate::matcher::Matcher;
use crate::name::ServerName;

/// File names reserved for the default certificate and the ad-hoc issuer.
const RESERVED_STEMS: [&str; 2] = ["server", "issuer"];

/// Where a certificate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateOrigin {
    File,
    Acme,
    Adhoc,
    Default,
}

/// A certificate ready for use in a TLS handshake.
#[derive(Clone)]
pub struct CertificateEntry {
    /// Leaf + chain + signing key, pre-parsed for rustls
    pub certified_key: Arc<CertifiedKey>,
    /// Leaf expiry, when the leaf parses
    pub not_after: Option<DateTime<Utc>>,
    /// Leaf issuer distinguished name, when the leaf parses
    pub issuer: Option<String>,
    pub origin: CertificateOrigin,
}

impl CertificateEntry {
    /// Build an entry from DER certificate chain and private key.
    pub fn from_der(
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
        origin: CertificateOrigin,
    ) -> anyhow::Result<CertificateEntry> {
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
            .map_err(|e| anyhow::anyhow!("unsupported private key type: {}", e))?;

        let (not_after, issuer) = match chain.first() {
            Some(leaf) => leaf_metadata(leaf),
            None => (None, None),
        };

        Ok(CertificateEntry {
            certified_key: Arc::new(CertifiedKey::new(chain, signing_key)),
            not_after,
            issuer,
            origin,
        })
    }

    /// Load an entry from a PEM certificate file and key file pair.
    pub fn from_files(
        cert_path: &Path,
        key_path: &Path,
        origin: CertificateOrigin,
    ) -> anyhow::Result<CertificateEntry> {
        let chain = load_certificates(cert_path)?;
        let key = load_private_key(key_path)?;
        Self::from_der(chain, key, origin)
    }

    /// Whether the leaf has expired.
    pub fn is_expired(&self) -> bool {
        match self.not_after {
            Some(not_after) => not_after <= Utc::now(),
            None => false,
        }
    }
}

/// Extract expiry and issuer from a DER-encoded leaf certificate.
fn leaf_metadata(leaf: &CertificateDer<'_>) -> (Option<DateTime<Utc>>, Option<String>) {
    use x509_parser::prelude::*;

    match X509Certificate::from_der(leaf.as_ref()) {
        Ok((_, cert)) => {
            let not_after = DateTime::from_timestamp(cert.validity().not_after.timestamp(), 0);
            let issuer = Some(cert.issuer().to_string());
            (not_after, issuer)
        }
        Err(e) => {
            warn!("failed to parse leaf certificate: {}", e);
            (None, None)
        }
    }
}

/// Load certificates from a PEM file.
pub fn load_certificates(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| anyhow::anyhow!("failed to open certificate file {:?}: {}", path, e))?;
    let mut reader = BufReader::new(file);

    let certs: Vec<CertificateDer<'static>> = certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("failed to parse certificates in {:?}: {}", path, e))?;

    if certs.is_empty() {
        return Err(anyhow::anyhow!("no certificates found in {:?}", path));
    }

    Ok(certs)
}

/// Load a private key from a PEM file. PKCS#8 is tried first, then RSA.
pub fn load_private_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| anyhow::anyhow!("failed to open private key file {:?}: {}", path, e))?;
    let mut reader = BufReader::new(file);

    let pkcs8_keys: Vec<_> = pkcs8_private_keys(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("failed to parse PKCS#8 keys in {:?}: {}", path, e))?;

    if !pkcs8_keys.is_empty() {
        return Ok(PrivateKeyDer::Pkcs8(pkcs8_keys.into_iter().next().unwrap()));
    }

    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    let rsa_keys: Vec<_> = rsa_private_keys(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("failed to parse RSA keys in {:?}: {}", path, e))?;

    if !rsa_keys.is_empty() {
        return Ok(PrivateKeyDer::Pkcs1(rsa_keys.into_iter().next().unwrap()));
    }

    Err(anyhow::anyhow!("no private key found in {:?}", path))
}

/// Supplies certificates for server names.
#[async_trait]
pub trait CertificateProvider: Send + Sync {
    /// Short provider name for logs.
    fn name(&self) -> &'static str;

    /// Produce a certificate for `server_name`, or `None` if this provider
    /// has nothing to offer for it.
    async fn get_certificate(&self, server_name: &ServerName)
        -> Result<Option<CertificateEntry>>;
}

/// Ordered list of providers; first hit wins, errors skip to the next.
pub struct ProviderChain {
    providers: Vec<Arc<dyn CertificateProvider>>,
}

impl ProviderChain {
    pub fn new(providers: Vec<Arc<dyn CertificateProvider>>) -> Self {
        Self { providers }
    }

    /// Walk the chain. `None` means every provider declined; the caller is
    /// expected to fall back to the default certificate.
    pub async fn get_certificate(&self, server_name: &ServerName) -> Option<CertificateEntry> {
        for provider in &self.providers {
            match provider.get_certificate(server_name).await {
                Ok(Some(entry)) => {
                    debug!(
                        provider = provider.name(),
                        name = %server_name,
                        "certificate resolved"
                    );
                    return Some(entry);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        provider = provider.name(),
                        name = %server_name,
                        "certificate provider failed: {}",
                        e
                    );
                }
            }
        }
        None
    }
}

struct FileCertificate {
    matcher: Matcher,
    entry: CertificateEntry,
}

/// Serves certificates from `name.crt` + `name.key` pairs in a directory.
///
/// Each file stem is compiled as a host pattern (`_` doubles as the wildcard
/// label), and lookups return the best-scoring pattern. The directory is
/// rescanned at startup and whenever the watcher reports a change; loaded
/// certificates stay in memory between scans.
pub struct FileProvider {
    base_path: PathBuf,
    index: Arc<RwLock<Vec<FileCertificate>>>,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl FileProvider {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            index: Arc::new(RwLock::new(Vec::new())),
            watcher: Mutex::new(None),
        }
    }

    /// Rescan the certificate directory. Returns the number of indexed
    /// certificates. A missing directory indexes nothing.
    pub fn reload(&self) -> anyhow::Result<usize> {
        let loaded = Self::scan(&self.base_path)?;
        let count = loaded.len();
        *self.index.write() = loaded;
        debug!(path = ?self.base_path, count, "certificate directory scanned");
        Ok(count)
    }

    fn scan(base_path: &Path) -> anyhow::Result<Vec<FileCertificate>> {
        let mut loaded = Vec::new();

        let entries = match std::fs::read_dir(base_path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(loaded),
            Err(e) => {
                return Err(anyhow::anyhow!(
                    "failed to read certificate directory {:?}: {}",
                    base_path,
                    e
                ))
            }
        };

        for dir_entry in entries {
            let path = dir_entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("crt") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if RESERVED_STEMS.contains(&stem) {
                continue;
            }

            let key_path = path.with_extension("key");
            if !key_path.exists() {
                warn!(cert = ?path, "certificate has no matching .key file, skipping");
                continue;
            }

            let matcher = match Matcher::compile(stem) {
                Ok(m) => m,
                Err(e) => {
                    warn!(cert = ?path, "file name is not a valid pattern: {}", e);
                    continue;
                }
            };

            match CertificateEntry::from_files(&path, &key_path, CertificateOrigin::File) {
                Ok(entry) => loaded.push(FileCertificate { matcher, entry }),
                Err(e) => warn!(cert = ?path, "failed to load certificate: {}", e),
            }
        }

        Ok(loaded)
    }

    /// Watch the certificate directory and rescan on changes.
    pub fn start_watching(&self) -> anyhow::Result<()> {
        let base_path = self.base_path.clone();
        let index = Arc::clone(&self.index);

        let mut watcher =
            notify::recommended_watcher(move |res: std::result::Result<Event, notify::Error>| {
                match res {
                    Ok(event) => {
                        if event.kind.is_modify() || event.kind.is_create() || event.kind.is_remove()
                        {
                            debug!("certificate directory change detected: {:?}", event);
                            match Self::scan(&base_path) {
                                Ok(loaded) => {
                                    info!(
                                        count = loaded.len(),
                                        "certificates reloaded from {:?}", base_path
                                    );
                                    *index.write() = loaded;
                                }
                                Err(e) => warn!("certificate reload failed: {}", e),
                            }
                        }
                    }
                    Err(e) => warn!("certificate directory watch error: {}", e),
                }
            })?;

        watcher.watch(&self.base_path, RecursiveMode::NonRecursive)?;
        *self.watcher.lock() = Some(watcher);
        info!(path = ?self.base_path, "watching certificate directory");
        Ok(())
    }

    /// Number of certificates currently indexed.
    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.read().is_empty()
    }
}

#[async_trait]
impl CertificateProvider for FileProvider {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn get_certificate(
        &self,
        server_name: &ServerName,
    ) -> Result<Option<CertificateEntry>> {
        let index = self.index.read();

        let mut best: Option<(&FileCertificate, u128)> = None;
        for candidate in index.iter() {
            let score = candidate.matcher.match_score(server_name);
            if score == 0 {
                continue;
            }
            match best {
                Some((_, leader)) if leader >= score => {}
                _ => best = Some((candidate, score)),
            }
        }

        Ok(best.map(|(candidate, _)| candidate.entry.clone()))
    }
}

/// Provider errors carry enough context to pick the next provider.
pub fn provider_error(name: &ServerName, reason: impl std::fmt::Display) -> GatewayError {
    GatewayError::CertificateUnavailable {
        name: name.unicode.clone(),
        reason: reason.to_string(),
    }
}
