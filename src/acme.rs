//! ACME (Automated Certificate Management Environment) provider
//!
//! Certificate provider backed by an RFC 8555 CA via HTTP-01 challenges.
//! Works with Let's Encrypt (production and staging) or any compatible
//! directory.
//!
//! The provider activates only when an account email and at least one
//! allowed-host pattern are configured. On lookup the allow-list is
//! consulted first; a name nobody vouched for is simply "not found" so the
//! chain can fall through to the ad-hoc provider. Allowed names are served
//! from memory, then from the on-disk cache, and only then issued — with the
//! handshake parked while the order completes. Issued certificates are
//! renewed when less than 30 days of validity remain, both on demand and
//! from a periodic background sweep. Concurrent requests for the same name
//! coalesce onto one issuance.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, Order, OrderStatus,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::cert::{provider_error, CertificateEntry, CertificateOrigin, CertificateProvider};
use crate::error::Result;
use crate::matcher::Matcher;
use crate::name::ServerName;

/// Let's Encrypt production directory.
pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Renew when fewer than this many days of validity remain.
const RENEWAL_DAYS: i64 = 30;

/// Background sweep interval.
const SWEEP_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);

/// How long a pending HTTP-01 challenge stays answerable.
const CHALLENGE_TTL: Duration = Duration::from_secs(300);

/// Pause between CA polls.
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Give up on a single validation or order transition after this long.
const POLL_DEADLINE: Duration = Duration::from_secs(90);

/// ACME configuration
#[derive(Debug, Clone)]
pub struct AcmeConfig {
    /// Directory URL of the CA
    pub directory_url: String,
    /// Account contact email
    pub email: String,
    /// Host patterns this account is allowed to request certificates for
    pub allowed: Vec<Matcher>,
    /// Directory for the account file and issued certificates
    pub cache_path: PathBuf,
}

/// Stored ACME account wrapper (for metadata)
#[derive(Debug, Clone, Deserialize, Serialize)]
struct StoredAccountWrapper {
    /// Directory URL this account was created with
    directory_url: String,
    /// Contact email
    email: String,
    /// Created timestamp
    created: String,
    /// The actual opaque credentials (serialized by instant-acme)
    credentials: serde_json::Value,
}

/// Pending HTTP-01 challenge
#[derive(Debug, Clone)]
struct PendingChallenge {
    /// Key authorization (token.thumbprint)
    key_authorization: String,
    /// Expiration time
    expires: SystemTime,
}

/// ACME account, certificate cache, and issuance machinery.
pub struct AcmeManager {
    config: AcmeConfig,
    /// Pending HTTP-01 challenges, keyed by token
    pending_challenges: Arc<RwLock<HashMap<String, PendingChallenge>>>,
    /// Issued certificates held in memory
    certificates: DashMap<String, CertificateEntry>,
    /// Per-domain issuance guards (single-flight)
    in_flight: DashMap<String, Arc<Mutex<()>>>,
    /// Shutdown signal for the renewal sweep
    sweep_shutdown: parking_lot::Mutex<Option<mpsc::Sender<()>>>,
}

impl AcmeManager {
    pub fn new(config: AcmeConfig) -> Arc<AcmeManager> {
        Arc::new(AcmeManager {
            config,
            pending_challenges: Arc::new(RwLock::new(HashMap::new())),
            certificates: DashMap::new(),
            in_flight: DashMap::new(),
            sweep_shutdown: parking_lot::Mutex::new(None),
        })
    }

    /// Answer a pending HTTP-01 challenge, if `token` is one of ours.
    ///
    /// The insecure listener serves this at
    /// `/.well-known/acme-challenge/{token}`.
    pub fn challenge_response(&self, token: &str) -> Option<String> {
        let challenges = self.pending_challenges.read();
        challenges
            .get(token)
            .filter(|c| c.expires > SystemTime::now())
            .map(|c| c.key_authorization.clone())
    }

    /// Whether `name` is covered by the allow-list.
    pub fn is_allowed(&self, name: &ServerName) -> bool {
        self.config.allowed.iter().any(|m| m.matches(name))
    }

    fn cert_paths(&self, domain: &str) -> (PathBuf, PathBuf) {
        (
            self.config.cache_path.join(format!("{}.crt", domain)),
            self.config.cache_path.join(format!("{}.key", domain)),
        )
    }

    fn needs_renewal(entry: &CertificateEntry) -> bool {
        match entry.not_after {
            Some(not_after) => (not_after - Utc::now()).num_days() < RENEWAL_DAYS,
            None => true,
        }
    }

    /// Fetch a certificate for `name`, from memory, disk, or the CA.
    pub async fn certificate_for(&self, name: &ServerName) -> anyhow::Result<CertificateEntry> {
        let domain = name.punycode.clone();

        if let Some(entry) = self.certificates.get(&domain) {
            if !Self::needs_renewal(&entry) {
                return Ok(entry.clone());
            }
        }

        let guard = self
            .in_flight
            .entry(domain.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _flight = guard.lock().await;

        // A coalesced caller may have finished the work while we waited.
        if let Some(entry) = self.certificates.get(&domain) {
            if !Self::needs_renewal(&entry) {
                return Ok(entry.clone());
            }
        }

        // Disk cache from a previous run
        let (cert_path, key_path) = self.cert_paths(&domain);
        let existing = if cert_path.exists() && key_path.exists() {
            match CertificateEntry::from_files(&cert_path, &key_path, CertificateOrigin::Acme) {
                Ok(entry) => {
                    if !Self::needs_renewal(&entry) {
                        debug!(domain, "serving ACME certificate from disk cache");
                        self.certificates.insert(domain.clone(), entry.clone());
                        return Ok(entry);
                    }
                    Some(entry)
                }
                Err(e) => {
                    warn!(domain, "cached ACME certificate unreadable: {}", e);
                    None
                }
            }
        } else {
            None
        };

        info!(domain, directory = %self.config.directory_url, "requesting ACME certificate");
        match self.issue(&domain).await {
            Ok(entry) => {
                self.certificates.insert(domain, entry.clone());
                Ok(entry)
            }
            Err(e) => {
                // A near-expiry certificate still beats no certificate.
                if let Some(entry) = existing.filter(|entry| !entry.is_expired()) {
                    warn!(
                        domain,
                        "ACME renewal failed, serving previous certificate: {}", e
                    );
                    self.certificates.insert(domain, entry.clone());
                    return Ok(entry);
                }
                Err(e)
            }
        }
    }

    /// Run one order through the CA and persist the result.
    async fn issue(&self, domain: &str) -> anyhow::Result<CertificateEntry> {
        use rcgen::{CertificateParams, DistinguishedName, KeyPair};

        let account = self.get_or_create_account().await?;

        let mut order = account
            .new_order(&NewOrder {
                identifiers: &[Identifier::Dns(domain.to_string())],
            })
            .await?;

        // The order names exactly one identifier, so it carries exactly one
        // authorization.
        let authorization = order
            .authorizations()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("order for {} carries no authorization", domain))?;

        match authorization.status {
            AuthorizationStatus::Valid => {
                debug!(domain, "authorization already valid, skipping challenge");
            }
            AuthorizationStatus::Pending => {
                let challenge = authorization
                    .challenges
                    .iter()
                    .find(|c| c.r#type == ChallengeType::Http01)
                    .ok_or_else(|| {
                        anyhow::anyhow!("no HTTP-01 challenge offered for {}", domain)
                    })?;

                let key_authorization = order.key_authorization(challenge);
                let token = challenge.token.clone();

                {
                    let mut challenges = self.pending_challenges.write();
                    challenges.insert(
                        token.clone(),
                        PendingChallenge {
                            key_authorization: key_authorization.as_str().to_string(),
                            expires: SystemTime::now() + CHALLENGE_TTL,
                        },
                    );
                }

                debug!(
                    domain,
                    token, "HTTP-01 challenge staged at /.well-known/acme-challenge/"
                );

                order.set_challenge_ready(&challenge.url).await?;

                let validated = await_validation(&mut order, domain).await;
                self.pending_challenges.write().remove(&token);
                validated?;

                info!(domain, "HTTP-01 challenge validated");
            }
            status => {
                return Err(anyhow::anyhow!(
                    "unexpected authorization status for {}: {:?}",
                    domain,
                    status
                ));
            }
        }

        await_order_status(&mut order, domain, OrderStatus::Ready).await?;

        // Finalize with a fresh key pair and CSR
        let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)?;
        let mut params = CertificateParams::new(vec![domain.to_string()])?;
        params.distinguished_name = DistinguishedName::new();
        let csr = params.serialize_request(&key_pair)?;
        order.finalize(csr.der()).await?;

        await_order_status(&mut order, domain, OrderStatus::Valid).await?;
        let cert_chain = order
            .certificate()
            .await?
            .ok_or_else(|| anyhow::anyhow!("no certificate returned for {}", domain))?;

        let key_pem = key_pair.serialize_pem();
        self.persist(domain, &cert_chain, &key_pem)?;

        let (cert_path, key_path) = self.cert_paths(domain);
        let entry = CertificateEntry::from_files(&cert_path, &key_path, CertificateOrigin::Acme)?;
        info!(domain, "ACME certificate obtained");
        Ok(entry)
    }

    fn persist(&self, domain: &str, cert_chain: &str, key_pem: &str) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.config.cache_path)?;

        let (cert_path, key_path) = self.cert_paths(domain);
        std::fs::write(&cert_path, cert_chain)?;
        std::fs::write(&key_path, key_pem)?;

        // Key files are secrets
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600))?;
        }

        Ok(())
    }

    /// Get existing ACME account or create a new one.
    async fn get_or_create_account(&self) -> anyhow::Result<Account> {
        let account_path = self.config.cache_path.join("account.json");

        if account_path.exists() {
            if let Ok(content) = std::fs::read_to_string(&account_path) {
                if let Ok(stored) = serde_json::from_str::<StoredAccountWrapper>(&content) {
                    if stored.directory_url == self.config.directory_url {
                        debug!("loading existing ACME account from {:?}", account_path);
                        let credentials: AccountCredentials =
                            serde_json::from_value(stored.credentials)?;
                        return Ok(Account::from_credentials(credentials).await?);
                    }
                    warn!(
                        "existing ACME account is for {}, creating a new one",
                        stored.directory_url
                    );
                }
            }
        }

        info!("creating new ACME account with {}", self.config.directory_url);
        let contact = format!("mailto:{}", self.config.email);
        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &[contact.as_str()],
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            &self.config.directory_url,
            None,
        )
        .await?;

        let stored = StoredAccountWrapper {
            directory_url: self.config.directory_url.clone(),
            email: self.config.email.clone(),
            created: Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            credentials: serde_json::to_value(&credentials)?,
        };

        std::fs::create_dir_all(&self.config.cache_path)?;
        std::fs::write(&account_path, serde_json::to_string_pretty(&stored)?)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&account_path, std::fs::Permissions::from_mode(0o600))?;
        }

        Ok(account)
    }

    /// Spawn the periodic renewal sweep over certificates held in memory.
    pub fn start_renewal_sweep(self: &Arc<Self>) {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        *self.sweep_shutdown.lock() = Some(shutdown_tx);

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.tick().await; // first tick fires immediately
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown_rx.recv() => {
                        info!("ACME renewal sweep shutting down");
                        break;
                    }
                }

                let due: Vec<String> = manager
                    .certificates
                    .iter()
                    .filter(|entry| Self::needs_renewal(entry.value()))
                    .map(|entry| entry.key().clone())
                    .collect();

                for domain in due {
                    let name = match ServerName::try_parse(&domain) {
                        Ok(name) => name,
                        Err(_) => continue,
                    };
                    info!(domain, "renewing ACME certificate");
                    if let Err(e) = manager.certificate_for(&name).await {
                        error!(domain, "scheduled renewal failed: {}", e);
                    }
                }

                // Expired challenges are useless to the CA by now
                let now = SystemTime::now();
                manager
                    .pending_challenges
                    .write()
                    .retain(|_, c| c.expires > now);
            }
        });

        info!(
            directory = %self.config.directory_url,
            "ACME renewal sweep started"
        );
    }

    /// Stop the renewal sweep.
    pub async fn stop_renewal_sweep(&self) {
        let tx = self.sweep_shutdown.lock().take();
        if let Some(tx) = tx {
            let _ = tx.send(()).await;
        }
    }
}

/// Poll the order's single authorization until the CA settles it.
async fn await_validation(order: &mut Order, domain: &str) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + POLL_DEADLINE;

    loop {
        tokio::time::sleep(POLL_INTERVAL).await;
        order.refresh().await?;

        let status = order
            .authorizations()
            .await?
            .into_iter()
            .next()
            .map(|authz| authz.status);

        match status {
            Some(AuthorizationStatus::Valid) => return Ok(()),
            Some(AuthorizationStatus::Invalid) => {
                return Err(anyhow::anyhow!(
                    "the CA rejected the HTTP-01 challenge for {}",
                    domain
                ));
            }
            _ => {}
        }

        if tokio::time::Instant::now() >= deadline {
            return Err(anyhow::anyhow!(
                "challenge validation timed out for {}",
                domain
            ));
        }
    }
}

/// Refresh the order until it reaches `target`. An invalidated order or an
/// expired deadline is an error.
async fn await_order_status(
    order: &mut Order,
    domain: &str,
    target: OrderStatus,
) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + POLL_DEADLINE;

    loop {
        let status = order.state().status;
        if status == target {
            return Ok(());
        }
        if status == OrderStatus::Invalid {
            return Err(anyhow::anyhow!("order for {} was invalidated by the CA", domain));
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(anyhow::anyhow!(
                "order for {} did not reach {:?} in time",
                domain,
                target
            ));
        }

        tokio::time::sleep(POLL_INTERVAL).await;
        order.refresh().await?;
    }
}

/// Certificate provider face of the [`AcmeManager`].
pub struct AcmeProvider {
    manager: Arc<AcmeManager>,
}

impl AcmeProvider {
    pub fn new(manager: Arc<AcmeManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl CertificateProvider for AcmeProvider {
    fn name(&self) -> &'static str {
        "acme"
    }

    async fn get_certificate(
        &self,
        server_name: &ServerName,
    ) -> Result<Option<CertificateEntry>> {
        if !self.manager.is_allowed(server_name) {
            return Ok(None);
        }

        match self.manager.certificate_for(server_name).await {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => Err(provider_error(server_name, e)),
        }
    }
}
