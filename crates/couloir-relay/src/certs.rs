//! On-demand certificates: one PEM pair per hostname cached on disk, a
//! single ACME account reused across orders, and HTTP-01 challenges served
//! from a plain listener on port 80.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path as UrlPath, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use dashmap::DashMap;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, LetsEncrypt,
    NewAccount, NewOrder, OrderStatus,
};
use tokio::sync::{Mutex, OnceCell};
use tokio_util::sync::CancellationToken;
use tokio_rustls::rustls::crypto::aws_lc_rs::sign::any_supported_type;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::server::{ClientHello, ResolvesServerCert};
use tokio_rustls::rustls::sign::CertifiedKey;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use couloir_core::error::{CouloirError, Result};

use crate::registry::Registry;

const CERT_FILE: &str = "cert.pem";
const KEY_FILE: &str = "key.pem";
const ACCOUNT_FILE: &str = "account.json";

pub struct CertStore {
    dir: PathBuf,
    contact: Option<String>,
    shutdown: CancellationToken,
    cache: DashMap<String, Arc<CertifiedKey>>,
    /// Per-hostname order locks: concurrent ensure() calls for one host
    /// coalesce into a single ACME order.
    orders: DashMap<String, Arc<Mutex<()>>>,
    /// HTTP-01 token → key authorization, served on port 80.
    challenges: DashMap<String, String>,
    account: OnceCell<Account>,
}

impl fmt::Debug for CertStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertStore")
            .field("dir", &self.dir)
            .field("cached", &self.cache.len())
            .finish()
    }
}

impl CertStore {
    pub fn new(
        dir: PathBuf,
        contact: Option<String>,
        shutdown: CancellationToken,
    ) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&dir)?;
        Ok(Arc::new(Self {
            dir,
            contact,
            shutdown,
            cache: DashMap::new(),
            orders: DashMap::new(),
            challenges: DashMap::new(),
            account: OnceCell::new(),
        }))
    }

    /// Cached certificate for `host`, if one has been issued or loaded.
    pub fn get(&self, host: &str) -> Option<Arc<CertifiedKey>> {
        self.cache.get(host).map(|entry| entry.clone())
    }

    pub fn challenge_body(&self, token: &str) -> Option<String> {
        self.challenges.get(token).map(|entry| entry.clone())
    }

    /// Make sure a certificate for `host` exists: cache, then disk, then a
    /// fresh ACME order. At most one order per hostname runs at a time;
    /// callers that arrive during an order wait for its result.
    pub async fn ensure(self: &Arc<Self>, host: &str) -> Result<Arc<CertifiedKey>> {
        if let Some(key) = self.get(host) {
            return Ok(key);
        }
        let lock = self
            .orders
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Issued while we waited for the lock.
        if let Some(key) = self.get(host) {
            return Ok(key);
        }
        if let Some(key) = self.load_from_disk(host)? {
            debug!(host = %host, "certificate loaded from disk");
            self.cache.insert(host.to_string(), key.clone());
            return Ok(key);
        }

        let key = self.order(host).await?;
        self.cache.insert(host.to_string(), key.clone());
        Ok(key)
    }

    /// Fire-and-forget ensure(), for warm-up and the open path. The task
    /// dies with the relay: a shutdown drops any in-flight order.
    pub fn spawn_ensure(self: &Arc<Self>, host: String) {
        let store = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                result = store.ensure(&host) => match result {
                    Ok(_) => info!(host = %host, "certificate ready"),
                    Err(e) => warn!(host = %host, error = %e, "certificate acquisition failed"),
                },
                _ = store.shutdown.cancelled() => {}
            }
        });
    }

    fn host_dir(&self, host: &str) -> PathBuf {
        self.dir.join(host)
    }

    fn load_from_disk(&self, host: &str) -> Result<Option<Arc<CertifiedKey>>> {
        let dir = self.host_dir(host);
        let cert_path = dir.join(CERT_FILE);
        let key_path = dir.join(KEY_FILE);
        if !cert_path.exists() || !key_path.exists() {
            return Ok(None);
        }
        let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(std::fs::File::open(
            &cert_path,
        )?))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| CouloirError::Cert(format!("unreadable certificate for {host}: {e}")))?;
        let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(std::fs::File::open(
            &key_path,
        )?))
        .map_err(|e| CouloirError::Cert(format!("unreadable private key for {host}: {e}")))?
        .ok_or_else(|| CouloirError::Cert(format!("no private key in {}", key_path.display())))?;
        Ok(Some(Arc::new(certified_key(certs, key)?)))
    }

    fn persist(&self, host: &str, key_pem: &str, chain_pem: &str) -> Result<()> {
        let dir = self.host_dir(host);
        std::fs::create_dir_all(&dir)?;
        write_atomic(&dir.join(KEY_FILE), key_pem.as_bytes())?;
        write_atomic(&dir.join(CERT_FILE), chain_pem.as_bytes())?;
        Ok(())
    }

    /// The single ACME account, created on first use and persisted so later
    /// relay runs (and every hostname) reuse it.
    async fn account(&self) -> Result<&Account> {
        self.account
            .get_or_try_init(|| async {
                let path = self.dir.join(ACCOUNT_FILE);
                if path.exists() {
                    let raw = tokio::fs::read(&path).await?;
                    let credentials: AccountCredentials = serde_json::from_slice(&raw)
                        .map_err(|e| {
                            CouloirError::Cert(format!("corrupt ACME account credentials: {e}"))
                        })?;
                    return Account::from_credentials(credentials).await.map_err(acme_err);
                }
                let contact = self.contact.as_ref().map(|email| format!("mailto:{email}"));
                let contacts: Vec<&str> = contact.iter().map(String::as_str).collect();
                let (account, credentials) = Account::create(
                    &NewAccount {
                        contact: &contacts,
                        terms_of_service_agreed: true,
                        only_return_existing: false,
                    },
                    LetsEncrypt::Production.url(),
                    None,
                )
                .await
                .map_err(acme_err)?;
                let raw = serde_json::to_vec(&credentials)
                    .map_err(|e| CouloirError::Cert(format!("unencodable credentials: {e}")))?;
                write_atomic(&path, &raw)?;
                info!("ACME account created");
                Ok(account)
            })
            .await
    }

    /// Run one HTTP-01 order for `host` and persist the resulting PEM pair.
    async fn order(&self, host: &str) -> Result<Arc<CertifiedKey>> {
        info!(host = %host, "requesting certificate");
        let account = self.account().await?;
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &[Identifier::Dns(host.to_string())],
            })
            .await
            .map_err(acme_err)?;

        let authorizations = order.authorizations().await.map_err(acme_err)?;
        let mut tokens = Vec::new();
        for authz in &authorizations {
            match authz.status {
                AuthorizationStatus::Pending => {}
                AuthorizationStatus::Valid => continue,
                status => {
                    return Err(CouloirError::Cert(format!(
                        "authorization for {host} is {status:?}"
                    )))
                }
            }
            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Http01)
                .ok_or_else(|| {
                    CouloirError::Cert(format!("no HTTP-01 challenge offered for {host}"))
                })?;
            let key_auth = order.key_authorization(challenge);
            self.challenges
                .insert(challenge.token.clone(), key_auth.as_str().to_string());
            tokens.push(challenge.token.clone());
            order.set_challenge_ready(&challenge.url).await.map_err(acme_err)?;
        }

        let outcome = self.poll_order(&mut order, host).await;
        for token in &tokens {
            self.challenges.remove(token);
        }
        outcome?;

        let mut params = rcgen::CertificateParams::new(vec![host.to_string()])
            .map_err(|e| CouloirError::Cert(e.to_string()))?;
        params.distinguished_name = rcgen::DistinguishedName::new();
        let key_pair = rcgen::KeyPair::generate().map_err(|e| CouloirError::Cert(e.to_string()))?;
        let csr = params
            .serialize_request(&key_pair)
            .map_err(|e| CouloirError::Cert(e.to_string()))?;
        order.finalize(csr.der()).await.map_err(acme_err)?;

        let chain_pem = loop {
            match order.certificate().await.map_err(acme_err)? {
                Some(pem) => break pem,
                None => tokio::time::sleep(Duration::from_secs(1)).await,
            }
        };

        self.persist(host, &key_pair.serialize_pem(), &chain_pem)?;
        info!(host = %host, "certificate issued");
        self.load_from_disk(host)?
            .ok_or_else(|| CouloirError::Cert(format!("certificate for {host} missing after issuance")))
    }

    async fn poll_order(&self, order: &mut instant_acme::Order, host: &str) -> Result<()> {
        let mut delay = Duration::from_millis(500);
        for _ in 0..16 {
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(Duration::from_secs(8));
            let state = order.refresh().await.map_err(acme_err)?;
            match state.status {
                OrderStatus::Ready | OrderStatus::Valid => return Ok(()),
                OrderStatus::Invalid => {
                    return Err(CouloirError::Cert(format!("order for {host} was rejected")))
                }
                _ => {}
            }
        }
        Err(CouloirError::Cert(format!(
            "order for {host} did not become ready in time"
        )))
    }
}

/// SNI resolver over the store. A miss starts issuance in the background
/// and fails the current handshake; the client's retry is served from the
/// cache. Only the relay domain and registered couloirs are eligible, so
/// arbitrary SNI names cannot trigger orders.
pub struct SniResolver {
    pub store: Arc<CertStore>,
    pub registry: Arc<Registry>,
}

impl fmt::Debug for SniResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SniResolver").finish()
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let host = client_hello.server_name()?.to_ascii_lowercase();
        if let Some(key) = self.store.get(&host) {
            return Some(key);
        }
        if host == self.registry.domain() || self.registry.contains_host(&host) {
            debug!(host = %host, "no certificate cached for SNI, starting issuance");
            self.store.spawn_ensure(host);
        } else {
            debug!(host = %host, "SNI for unknown host");
        }
        None
    }
}

/// The port-80 router: HTTP-01 challenges only, everything else 404s.
pub fn challenge_router(store: Arc<CertStore>) -> Router {
    Router::new()
        .route("/.well-known/acme-challenge/{token}", get(serve_challenge))
        .fallback(|| async { StatusCode::NOT_FOUND })
        .layer(TraceLayer::new_for_http())
        .with_state(store)
}

async fn serve_challenge(
    State(store): State<Arc<CertStore>>,
    UrlPath(token): UrlPath<String>,
) -> std::result::Result<String, StatusCode> {
    store.challenge_body(&token).ok_or(StatusCode::NOT_FOUND)
}

/// write-temp, fsync, rename: readers never observe a partial file.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    {
        use std::io::Write;
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn certified_key(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<CertifiedKey> {
    let signing = any_supported_type(&key)
        .map_err(|e| CouloirError::Cert(format!("unsupported private key: {e}")))?;
    Ok(CertifiedKey::new(certs, signing))
}

fn acme_err(e: instant_acme::Error) -> CouloirError {
    CouloirError::Cert(e.to_string())
}
