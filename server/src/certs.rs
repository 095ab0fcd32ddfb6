//! §4.J Certificate Manager — on-demand ACME HTTP-01 issuance, cached on
//! disk under `<data_dir>/certs/<host>/`, gated on the Domain Registry so
//! a host not currently mapped is never issued a certificate (the ACME
//! gate design note). Falls back to a self-signed certificate when ACME
//! is disabled or an issuance attempt fails, so `:443` keeps working in
//! development.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use instant_acme::{Account, AuthorizationStatus, ChallengeType, NewAccount, NewOrder, OrderStatus};
use rcgen::generate_simple_self_signed;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

use crate::domain::DomainRegistry;

#[derive(Debug, thiserror::Error)]
pub enum CertError {
    #[error("host {0} is not in the domain registry; refusing to issue")]
    HostNotRegistered(String),
    #[error("acme error: {0}")]
    Acme(#[from] instant_acme::Error),
    #[error("self-signed fallback failed: {0}")]
    SelfSigned(#[from] rcgen::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone)]
pub struct CertifiedKey {
    pub cert_pem: String,
    pub key_pem: String,
}

/// In-memory storage for pending HTTP-01 challenge tokens, consulted by
/// the `/.well-known/acme-challenge/:token` route that must be composed
/// *before* the plain-HTTP vhost router on `:80` (§4.J).
#[derive(Default, Clone)]
pub struct ChallengeStore {
    tokens: Arc<RwLock<HashMap<String, String>>>,
}

impl ChallengeStore {
    pub async fn put(&self, token: String, key_auth: String) {
        self.tokens.write().await.insert(token, key_auth);
    }

    pub async fn take_response(&self, token: &str) -> Option<String> {
        self.tokens.read().await.get(token).cloned()
    }

    pub async fn remove(&self, token: &str) {
        self.tokens.write().await.remove(token);
    }
}

pub struct CertManager {
    cache_dir: PathBuf,
    domains: Arc<DomainRegistry>,
    acme_email: Option<String>,
    acme_disabled: bool,
    challenges: ChallengeStore,
    account: Mutex<Option<Account>>,
    memo: RwLock<HashMap<String, CertifiedKey>>,
}

impl CertManager {
    pub fn new(
        data_dir: &std::path::Path,
        domains: Arc<DomainRegistry>,
        acme_email: Option<String>,
        acme_disabled: bool,
        challenges: ChallengeStore,
    ) -> Self {
        let cache_dir = data_dir.join("certs");
        if let Err(e) = std::fs::create_dir_all(&cache_dir) {
            warn!("failed to create cert cache dir: {e}");
        }
        CertManager {
            cache_dir,
            domains,
            acme_email,
            acme_disabled,
            challenges,
            account: Mutex::new(None),
            memo: RwLock::new(HashMap::new()),
        }
    }

    fn host_dir(&self, host: &str) -> PathBuf {
        self.cache_dir.join(host)
    }

    /// Returns a certificate for `host`, issuing or loading-from-cache as
    /// needed. Refuses hosts absent from the Domain Registry (the ACME
    /// gate) before doing any network I/O.
    pub async fn get_or_issue(&self, host: &str) -> Result<CertifiedKey, CertError> {
        if !self.domains.exists(host) {
            return Err(CertError::HostNotRegistered(host.to_string()));
        }

        if let Some(ck) = self.memo.read().await.get(host).cloned() {
            return Ok(ck);
        }

        if let Some(ck) = self.load_cached(host) {
            self.memo.write().await.insert(host.to_string(), ck.clone());
            return Ok(ck);
        }

        let ck = if self.acme_disabled {
            self.self_signed(host)?
        } else {
            match self.issue_acme(host).await {
                Ok(ck) => ck,
                Err(e) => {
                    error!("ACME issuance failed for {host}, falling back to self-signed: {e}");
                    self.self_signed(host)?
                }
            }
        };

        self.store_cached(host, &ck)?;
        self.memo.write().await.insert(host.to_string(), ck.clone());
        Ok(ck)
    }

    fn load_cached(&self, host: &str) -> Option<CertifiedKey> {
        let dir = self.host_dir(host);
        let cert_pem = std::fs::read_to_string(dir.join("cert.pem")).ok()?;
        let key_pem = std::fs::read_to_string(dir.join("key.pem")).ok()?;
        Some(CertifiedKey { cert_pem, key_pem })
    }

    fn store_cached(&self, host: &str, ck: &CertifiedKey) -> Result<(), CertError> {
        let dir = self.host_dir(host);
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join("cert.pem"), &ck.cert_pem)?;
        std::fs::write(dir.join("key.pem"), &ck.key_pem)?;
        Ok(())
    }

    pub(crate) fn self_signed(&self, host: &str) -> Result<CertifiedKey, CertError> {
        let cert = generate_simple_self_signed(vec![host.to_string()])?;
        Ok(CertifiedKey {
            cert_pem: cert.cert.pem(),
            key_pem: cert.signing_key.serialize_pem(),
        })
    }

    async fn acme_account(&self) -> Result<Account, CertError> {
        let mut guard = self.account.lock().await;
        if let Some(acct) = guard.as_ref() {
            return Ok(acct.clone());
        }
        let (account, _creds) = Account::create(
            &NewAccount {
                contact: &self
                    .acme_email
                    .as_deref()
                    .map(|e| vec![format!("mailto:{e}")])
                    .unwrap_or_default()
                    .iter()
                    .map(String::as_str)
                    .collect::<Vec<_>>(),
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            instant_acme::LetsEncrypt::Production.url(),
            None,
        )
        .await?;
        *guard = Some(account.clone());
        Ok(account)
    }

    async fn issue_acme(&self, host: &str) -> Result<CertifiedKey, CertError> {
        let account = self.acme_account().await?;
        let mut order = account
            .new_order(&NewOrder::new(&[instant_acme::Identifier::Dns(
                host.to_string(),
            )]))
            .await?;

        let authorizations = order.authorizations().await?;
        for authz in &authorizations {
            if authz.status == AuthorizationStatus::Valid {
                continue;
            }
            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Http01)
                .expect("HTTP-01 challenge must be offered");

            let key_auth = order.key_authorization(challenge).as_str().to_string();
            self.challenges
                .put(challenge.token.clone(), key_auth)
                .await;

            order.set_challenge_ready(&challenge.url).await?;
        }

        // Poll until the order leaves the `pending`/`ready` states.
        let mut tries = 0;
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(2)).await;
            let state = order.refresh().await?;
            if matches!(state.status, OrderStatus::Ready | OrderStatus::Valid) {
                break;
            }
            tries += 1;
            if tries > 30 {
                return Err(CertError::Acme(instant_acme::Error::Timeout));
            }
        }

        for authz in &authorizations {
            if let Some(challenge) = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Http01)
            {
                self.challenges.remove(&challenge.token).await;
            }
        }

        let key_pair = instant_acme::KeyPair::generate()?;
        let csr = order.finalize_csr(&key_pair).await?;
        let cert_chain = order.poll_certificate(&csr).await?;
        info!("issued ACME certificate for {host}");

        Ok(CertifiedKey {
            cert_pem: cert_chain,
            key_pem: key_pair.serialize_pem(),
        })
    }
}

fn to_rustls_certified_key(ck: &CertifiedKey) -> Option<rustls::sign::CertifiedKey> {
    let cert_chain: Vec<_> = rustls_pemfile::certs(&mut ck.cert_pem.as_bytes())
        .filter_map(Result::ok)
        .collect();
    let key_der = rustls_pemfile::private_key(&mut ck.key_pem.as_bytes())
        .ok()
        .flatten()?;
    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key_der).ok()?;
    Some(rustls::sign::CertifiedKey::new(cert_chain, signing_key))
}

/// Resolves a per-SNI certificate at TLS handshake time. Cache misses are
/// served a process-wide default self-signed certificate for the current
/// handshake while a background task issues the real one for next time —
/// resolver callbacks are synchronous, so the first connection to a brand
/// new host can't block on an ACME round trip.
type CertCache = Arc<dashmap::DashMap<String, Arc<rustls::sign::CertifiedKey>>>;

pub struct DynamicCertResolver {
    manager: Arc<CertManager>,
    cache: CertCache,
    default_key: Arc<rustls::sign::CertifiedKey>,
}

impl DynamicCertResolver {
    pub fn new(manager: Arc<CertManager>) -> Self {
        let default_ck = manager
            .self_signed("tunnelcow.invalid")
            .expect("default self-signed cert generation must succeed");
        let default_key = Arc::new(
            to_rustls_certified_key(&default_ck).expect("default cert must parse as rustls cert"),
        );
        DynamicCertResolver {
            manager,
            cache: Arc::new(dashmap::DashMap::new()),
            default_key,
        }
    }

    fn kick_off_issuance(&self, host: String) {
        let manager = self.manager.clone();
        let cache = self.cache.clone();
        tokio::spawn(async move {
            match manager.get_or_issue(&host).await {
                Ok(ck) => {
                    if let Some(rustls_ck) = to_rustls_certified_key(&ck) {
                        cache.insert(host, Arc::new(rustls_ck));
                    }
                }
                Err(e) => warn!("background certificate issuance for {host} failed: {e}"),
            }
        });
    }
}

impl std::fmt::Debug for DynamicCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicCertResolver").finish()
    }
}

impl rustls::server::ResolvesServerCert for DynamicCertResolver {
    fn resolve(
        &self,
        client_hello: rustls::server::ClientHello,
    ) -> Option<Arc<rustls::sign::CertifiedKey>> {
        let host = client_hello.server_name()?.to_string();
        if let Some(ck) = self.cache.get(&host) {
            return Some(ck.clone());
        }
        self.kick_off_issuance(host);
        Some(self.default_key.clone())
    }
}
