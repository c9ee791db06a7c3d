//! ACME certificate issuance
//!
//! Uses instant-acme for the protocol and HTTP-01 for domain validation.
//! Certificates are issued lazily for whatever hostname the client asked for,
//! once the host policy has approved it, then cached in memory and on disk.

use super::pem::{self, PemError};
use crate::defaults::{ACME_CALL_TIMEOUT, ACME_ORDER_TIMEOUT, ACME_RENEWAL_WINDOW};
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, OrderStatus, RetryPolicy,
};
use parking_lot::{Mutex, RwLock};
use rustls::sign::CertifiedKey;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::{OnceCell, OwnedMutexGuard, watch};
use warden_core::{AuthorizationDenied, DomainSpec, HostPolicy, normalize_host};

pub const CHALLENGE_PATH_PREFIX: &str = "/.well-known/acme-challenge/";

const CREDENTIALS_FILENAME: &str = "credentials.json";
const ACCOUNT_FILENAME: &str = "account.json";
const CHAIN_FILENAME: &str = "fullchain.pem";
const KEY_FILENAME: &str = "privkey.pem";

/// Errors that can occur during ACME operations
#[derive(Debug, Error)]
pub enum AcmeError {
    #[error(transparent)]
    Denied(#[from] AuthorizationDenied),

    #[error("Invalid hostname for ACME issuance: {0}")]
    InvalidHost(String),

    #[error("Challenge failed: {0}")]
    ChallengeFailed(String),

    #[error("Order not ready: {0}")]
    OrderNotReady(String),

    #[error("HTTP-01 challenge not available")]
    NoHttp01Challenge,

    #[error("Timed out {0}")]
    Timeout(&'static str),

    #[error("Invalid account data: {0}")]
    Account(String),

    #[error("ACME error: {0}")]
    Acme(#[from] instant_acme::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Certificate error: {0}")]
    Pem(#[from] PemError),
}

/// ACME configuration
#[derive(Debug, Clone)]
pub struct AcmeConfig {
    pub directory_url: String,
    /// Contact email for the ACME account
    pub email: String,
    /// Account credentials and per-host certificates live here
    pub cache_dir: PathBuf,
    /// Bound on every individual request to the ACME server
    pub call_timeout: Duration,
    /// Bound on polling an order until it is ready or issued
    pub order_timeout: Duration,
    /// Renew certificates expiring within this window
    pub renewal_window: Duration,
}

impl AcmeConfig {
    pub fn new(directory_url: impl Into<String>, email: impl Into<String>, cache_dir: PathBuf) -> Self {
        Self {
            directory_url: directory_url.into(),
            email: email.into(),
            cache_dir,
            call_timeout: ACME_CALL_TIMEOUT,
            order_timeout: ACME_ORDER_TIMEOUT,
            renewal_window: ACME_RENEWAL_WINDOW,
        }
    }
}

/// Saved next to the credentials so a changed directory gets a fresh account.
#[derive(Debug, Serialize, Deserialize)]
struct AccountInfo {
    directory: String,
    email: String,
    id: String,
    created_timestamp: u64,
}

/// HTTP-01 challenge tokens storage
/// Maps token -> key_authorization
pub type ChallengeTokens = Arc<RwLock<HashMap<String, String>>>;

#[derive(Clone)]
struct CachedCert {
    key: Arc<CertifiedKey>,
    not_after: SystemTime,
}

impl CachedCert {
    fn is_usable(&self) -> bool {
        SystemTime::now() < self.not_after
    }
}

/// Issues and caches certificates for the hosts one domain spec authorizes.
pub struct AcmeManager {
    config: AcmeConfig,
    policy: HostPolicy,
    challenge_tokens: ChallengeTokens,
    account: OnceCell<Account>,
    certs: RwLock<HashMap<String, CachedCert>>,
    /// One issuance at a time per host
    gates: Gates,
}

type Gates = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

/// Exclusive issuance rights for one host.
///
/// Dropping the lease unlocks the gate and removes it from the map unless
/// another task is already holding or waiting on it.
struct GateLease<'a> {
    gates: &'a Gates,
    host: String,
    gate: Arc<tokio::sync::Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for GateLease<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut gates = self.gates.lock();
        // Clones are only taken under this lock: one for the map, one for us.
        if Arc::strong_count(&self.gate) == 2 {
            gates.remove(&self.host);
        }
    }
}

impl AcmeManager {
    pub fn new(config: AcmeConfig, policy: HostPolicy) -> Self {
        Self {
            config,
            policy,
            challenge_tokens: Arc::new(RwLock::new(HashMap::new())),
            account: OnceCell::new(),
            certs: RwLock::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &AcmeConfig {
        &self.config
    }

    pub fn policy(&self) -> &HostPolicy {
        &self.policy
    }

    /// Get shared challenge tokens for HTTP-01 validation
    pub fn challenge_tokens(&self) -> ChallengeTokens {
        self.challenge_tokens.clone()
    }

    /// Get challenge response for HTTP-01 validation
    pub fn get_challenge_response(&self, token: &str) -> Option<String> {
        self.challenge_tokens.read().get(token).cloned()
    }

    /// Load the ACME account, registering one if needed.
    pub async fn init(&self) -> Result<(), AcmeError> {
        self.account().await.map(|_| ())
    }

    /// Certificate for `host`, from memory, disk or a fresh order.
    pub async fn resolve(&self, host: &str) -> Result<Arc<CertifiedKey>, AcmeError> {
        let host = normalize_host(host);
        self.policy.check(&host)?;
        if !is_plain_hostname(&host) {
            return Err(AcmeError::InvalidHost(host));
        }

        if let Some(key) = self.cached(&host) {
            return Ok(key);
        }

        let _gate = self.lock_gate(&host).await;
        if let Some(key) = self.cached(&host) {
            return Ok(key);
        }

        if let Some(cert) = self.load_from_disk(&host, Duration::ZERO) {
            let key = cert.key.clone();
            self.certs.write().insert(host, cert);
            return Ok(key);
        }

        let cert = self.issue(&host).await?;
        let key = cert.key.clone();
        self.certs.write().insert(host, cert);
        Ok(key)
    }

    /// Reissue every cached certificate that is inside the renewal window.
    ///
    /// A failed renewal leaves the current certificate in place.
    pub async fn check_renewals(&self) -> Vec<(String, Result<(), AcmeError>)> {
        let mut results = Vec::new();

        for host in self.cached_hosts() {
            if self.load_from_disk(&host, self.config.renewal_window).is_some() {
                continue;
            }
            if !self.policy.is_allowed(&host) {
                tracing::debug!(host = %host, "Skipping renewal for host no longer authorized");
                continue;
            }

            tracing::info!(host = %host, "Certificate needs renewal");
            let _gate = self.lock_gate(&host).await;
            let result = match self.issue(&host).await {
                Ok(cert) => {
                    self.certs.write().insert(host.clone(), cert);
                    Ok(())
                }
                Err(e) => {
                    tracing::warn!(host = %host, error = %e, "Certificate renewal failed");
                    Err(e)
                }
            };
            results.push((host, result));
        }

        results
    }

    fn cached(&self, host: &str) -> Option<Arc<CertifiedKey>> {
        self.certs
            .read()
            .get(host)
            .filter(|cert| cert.is_usable())
            .map(|cert| cert.key.clone())
    }

    /// Hold the issuance gate for `host` until the returned lease drops.
    async fn lock_gate(&self, host: &str) -> GateLease<'_> {
        let gate = self
            .gates
            .lock()
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let guard = gate.clone().lock_owned().await;
        GateLease {
            gates: &self.gates,
            host: host.to_string(),
            gate,
            guard: Some(guard),
        }
    }

    fn host_dir(&self, host: &str) -> PathBuf {
        self.config.cache_dir.join(host)
    }

    /// Hosts with a certificate in the disk cache.
    fn cached_hosts(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.config.cache_dir) else {
            return Vec::new();
        };
        let mut hosts: Vec<String> = entries
            .flatten()
            .filter(|entry| entry.path().join(CHAIN_FILENAME).is_file())
            .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
            .collect();
        hosts.sort();
        hosts
    }

    /// Cached certificate for `host` that stays valid for at least `margin`.
    fn load_from_disk(&self, host: &str, margin: Duration) -> Option<CachedCert> {
        let dir = self.host_dir(host);
        let chain_pem = std::fs::read(dir.join(CHAIN_FILENAME)).ok()?;
        if !pem::valid_for(&chain_pem, margin) {
            return None;
        }
        let not_after = pem::cert_not_after(&chain_pem)?;
        let key_pem = std::fs::read(dir.join(KEY_FILENAME)).ok()?;

        match pem::certified_key_from_pem(&chain_pem, &key_pem) {
            Ok(key) => Some(CachedCert {
                key: Arc::new(key),
                not_after,
            }),
            Err(e) => {
                tracing::warn!(host = %host, error = %e, "Ignoring unreadable cached certificate");
                None
            }
        }
    }

    async fn account(&self) -> Result<&Account, AcmeError> {
        self.account
            .get_or_try_init(|| self.load_or_create_account())
            .await
    }

    async fn load_or_create_account(&self) -> Result<Account, AcmeError> {
        std::fs::create_dir_all(&self.config.cache_dir)?;
        let credentials_path = self.config.cache_dir.join(CREDENTIALS_FILENAME);
        let account_path = self.config.cache_dir.join(ACCOUNT_FILENAME);

        if credentials_path.exists() {
            match self.load_account(&credentials_path, &account_path).await {
                Ok(Some(account)) => {
                    tracing::info!(id = %account.id(), "Loaded existing ACME account");
                    return Ok(account);
                }
                Ok(None) => {
                    tracing::info!(
                        directory = %self.config.directory_url,
                        "ACME directory changed, registering a new account"
                    );
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to load ACME account, will create new");
                }
            }
        }

        let contact = format!("mailto:{}", self.config.email);
        let new_account = NewAccount {
            contact: &[contact.as_str()],
            terms_of_service_agreed: true,
            only_return_existing: false,
        };
        let (account, credentials) = with_timeout(
            self.config.call_timeout,
            "registering ACME account",
            Account::builder()?.create(&new_account, self.config.directory_url.clone(), None),
        )
        .await?;

        let credentials_json = serde_json::to_string_pretty(&credentials)
            .map_err(|e| AcmeError::Account(e.to_string()))?;
        write_private(&credentials_path, credentials_json.as_bytes())?;

        let info = AccountInfo {
            directory: self.config.directory_url.clone(),
            email: self.config.email.clone(),
            id: account.id().to_string(),
            created_timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
        };
        let info_json =
            serde_json::to_string_pretty(&info).map_err(|e| AcmeError::Account(e.to_string()))?;
        std::fs::write(&account_path, info_json)?;

        tracing::info!(
            directory = %self.config.directory_url,
            id = %account.id(),
            "Created new ACME account"
        );
        Ok(account)
    }

    /// `None` when the saved account belongs to another directory.
    async fn load_account(
        &self,
        credentials_path: &Path,
        account_path: &Path,
    ) -> Result<Option<Account>, AcmeError> {
        if let Ok(contents) = std::fs::read_to_string(account_path) {
            let info: AccountInfo =
                serde_json::from_str(&contents).map_err(|e| AcmeError::Account(e.to_string()))?;
            if info.directory != self.config.directory_url {
                return Ok(None);
            }
        }

        let contents = std::fs::read_to_string(credentials_path)?;
        let credentials: AccountCredentials =
            serde_json::from_str(&contents).map_err(|e| AcmeError::Account(e.to_string()))?;

        let account = with_timeout(
            self.config.call_timeout,
            "loading ACME account",
            Account::builder()?.from_credentials(credentials),
        )
        .await?;
        Ok(Some(account))
    }

    /// Run an HTTP-01 order for `host` and persist the result.
    async fn issue(&self, host: &str) -> Result<CachedCert, AcmeError> {
        let account = self.account().await?;
        let limit = self.config.call_timeout;

        tracing::info!(host = %host, "Requesting certificate via ACME");

        let identifiers = [Identifier::Dns(host.to_string())];
        let mut order = with_timeout(
            limit,
            "creating ACME order",
            account.new_order(&NewOrder::new(&identifiers)),
        )
        .await?;

        // Tokens published for this order only; removed again on every exit path.
        let mut published = PublishedTokens::new(self.challenge_tokens.clone());

        let mut authorizations = order.authorizations();
        while let Some(auth) = tokio::time::timeout(limit, authorizations.next())
            .await
            .map_err(|_| AcmeError::Timeout("fetching ACME authorizations"))?
        {
            let mut auth = auth?;
            match auth.status {
                AuthorizationStatus::Pending => {
                    let mut challenge = auth
                        .challenge(ChallengeType::Http01)
                        .ok_or(AcmeError::NoHttp01Challenge)?;

                    let key_auth = challenge.key_authorization();
                    let token = challenge.token.clone();
                    published.insert(token.clone(), key_auth.as_str().to_string());

                    tracing::info!(
                        host = %host,
                        token = %token,
                        "HTTP-01 challenge ready"
                    );

                    with_timeout(limit, "marking challenge ready", challenge.set_ready()).await?;
                }
                AuthorizationStatus::Valid => {
                    tracing::debug!(host = %host, "Authorization already valid");
                }
                status => {
                    return Err(AcmeError::ChallengeFailed(format!(
                        "Unexpected authorization status: {:?}",
                        status
                    )));
                }
            }
        }

        let retry_policy = RetryPolicy::new().timeout(self.config.order_timeout);
        let polling_limit = self.config.order_timeout + limit;

        let status = with_timeout(
            polling_limit,
            "waiting for ACME order",
            order.poll_ready(&retry_policy),
        )
        .await?;
        match status {
            OrderStatus::Ready => {
                tracing::info!(host = %host, "Order ready, finalizing");
            }
            OrderStatus::Invalid => {
                return Err(AcmeError::ChallengeFailed("Order became invalid".to_string()));
            }
            status => {
                return Err(AcmeError::OrderNotReady(format!("{:?}", status)));
            }
        }
        drop(published);

        // Finalize generates the CSR and returns the private key as PEM
        let private_key_pem = with_timeout(limit, "finalizing ACME order", order.finalize()).await?;
        let cert_chain = with_timeout(
            polling_limit,
            "downloading certificate",
            order.poll_certificate(&retry_policy),
        )
        .await?;

        let key = pem::certified_key_from_pem(cert_chain.as_bytes(), private_key_pem.as_bytes())?;
        let not_after = pem::cert_not_after(cert_chain.as_bytes())
            .ok_or_else(|| PemError::Invalid("issued certificate has no expiry".to_string()))?;

        let dir = self.host_dir(host);
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join(CHAIN_FILENAME), &cert_chain)?;
        write_private(&dir.join(KEY_FILENAME), private_key_pem.as_bytes())?;

        tracing::info!(
            host = %host,
            path = %dir.display(),
            "Certificate issued successfully"
        );

        Ok(CachedCert {
            key: Arc::new(key),
            not_after,
        })
    }
}

/// Challenge tokens owned by one issuance.
struct PublishedTokens {
    tokens: ChallengeTokens,
    owned: Vec<String>,
}

impl PublishedTokens {
    fn new(tokens: ChallengeTokens) -> Self {
        Self {
            tokens,
            owned: Vec::new(),
        }
    }

    fn insert(&mut self, token: String, key_authorization: String) {
        self.tokens.write().insert(token.clone(), key_authorization);
        self.owned.push(token);
    }
}

impl Drop for PublishedTokens {
    fn drop(&mut self) {
        let mut tokens = self.tokens.write();
        for token in &self.owned {
            tokens.remove(token);
        }
    }
}

async fn with_timeout<T, F>(limit: Duration, what: &'static str, fut: F) -> Result<T, AcmeError>
where
    F: Future<Output = Result<T, instant_acme::Error>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| AcmeError::Timeout(what))?
        .map_err(AcmeError::from)
}

fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, contents)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

/// Hostnames that are safe to use as a cache directory name.
fn is_plain_hostname(host: &str) -> bool {
    !host.is_empty()
        && !host.starts_with('.')
        && !host.contains("..")
        && host
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'.')
}

/// Periodically renew certificates until `shutdown` flips to true.
pub async fn renewal_task(
    manager: Arc<AcmeManager>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let results = manager.check_renewals().await;
                let failed = results.iter().filter(|(_, r)| r.is_err()).count();
                if !results.is_empty() {
                    tracing::info!(
                        renewed = results.len() - failed,
                        failed,
                        "Certificate renewal pass finished"
                    );
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

/// HTTP-01 challenge handler for the plaintext listener
#[derive(Clone)]
pub struct ChallengeHandler {
    tokens: ChallengeTokens,
}

impl ChallengeHandler {
    pub fn new(tokens: ChallengeTokens) -> Self {
        Self { tokens }
    }

    /// Check if a request is for ACME challenge
    pub fn is_challenge_request(&self, path: &str) -> bool {
        path.starts_with(CHALLENGE_PATH_PREFIX)
    }

    /// Get response for ACME challenge
    pub fn handle_challenge(&self, path: &str) -> Option<String> {
        let token = path.strip_prefix(CHALLENGE_PATH_PREFIX)?;
        self.tokens.read().get(token).cloned()
    }
}

/// ACME managers keyed by domain spec, one per domain for the process lifetime.
#[derive(Default)]
pub struct AcmeRegistry {
    managers: Mutex<HashMap<String, Arc<AcmeManager>>>,
}

impl AcmeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The manager for `domain`, created with `config` on first request.
    ///
    /// Keyed by the normalized form, so spellings that authorize the same
    /// hosts share one manager.
    pub fn get_or_create(&self, domain: &DomainSpec, config: AcmeConfig) -> Arc<AcmeManager> {
        let key = domain
            .wildcard_pattern()
            .unwrap_or_else(|| domain.base_domain().to_string());
        self.managers
            .lock()
            .entry(key)
            .or_insert_with(|| {
                tracing::debug!(domain = %domain, "Creating ACME manager");
                Arc::new(AcmeManager::new(config, HostPolicy::new(domain)))
            })
            .clone()
    }

    pub fn len(&self) -> usize {
        self.managers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
