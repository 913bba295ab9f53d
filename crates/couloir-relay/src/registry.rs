use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use parking_lot::Mutex;
use rand::RngCore;
use subtle::ConstantTimeEq;
use tokio::sync::oneshot;
use tracing::{debug, info};

use couloir_core::error::{CouloirError, Result};
use couloir_core::protocol::OpenPayload;

use crate::RelayStream;

/// A client whose request head has been parsed and who is waiting for an
/// exposer socket.
pub struct PendingClient {
    pub id: u64,
    pub stream: RelayStream,
    pub preface: Vec<u8>,
}

impl std::fmt::Debug for PendingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingClient")
            .field("id", &self.id)
            .field("preface", &self.preface)
            .finish()
    }
}

/// An idle exposer socket, represented as a handoff slot. The socket itself
/// stays with its connection task, which waits on the other end of the
/// channel and can therefore notice the peer hanging up while idle.
struct ExposerSlot {
    id: u64,
    handoff: oneshot::Sender<PendingClient>,
}

struct Couloir {
    key: String,
    exposers: VecDeque<ExposerSlot>,
    pending: VecDeque<PendingClient>,
    active_pairs: usize,
    created_at: Instant,
}

impl Couloir {
    fn new(key: String) -> Self {
        Self {
            key,
            exposers: VecDeque::new(),
            pending: VecDeque::new(),
            active_pairs: 0,
            created_at: Instant::now(),
        }
    }
}

struct Inner {
    by_host: HashMap<String, Couloir>,
    by_key: HashMap<String, String>,
    counter: u64,
}

#[derive(Debug)]
pub struct Opened {
    pub host: String,
    pub key: String,
}

/// Process-wide couloir registry. The mutex is the serialization point for
/// every couloir mutation and every pairing decision; splicing happens
/// outside it, in the connection tasks.
pub struct Registry {
    domain: String,
    password: Option<String>,
    inner: Mutex<Inner>,
}

impl Registry {
    pub fn new(domain: String, password: Option<String>) -> Self {
        Self {
            domain,
            password,
            inner: Mutex::new(Inner {
                by_host: HashMap::new(),
                by_key: HashMap::new(),
                counter: 0,
            }),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn contains_host(&self, host: &str) -> bool {
        self.inner.lock().by_host.contains_key(host)
    }

    /// Open a new couloir: validate the password, settle on a host name,
    /// register it under a fresh key.
    pub fn open(&self, payload: &OpenPayload) -> Result<Opened> {
        self.check_password(payload.password.as_deref())?;
        let mut inner = self.inner.lock();
        let suffix = format!(".{}", self.domain);

        let host = match payload.host.as_deref() {
            Some(requested) if requested.ends_with(&suffix) => {
                let label = &requested[..requested.len() - suffix.len()];
                let valid = !label.is_empty()
                    && label
                        .bytes()
                        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-');
                if !valid {
                    return Err(CouloirError::InvalidHost(requested.to_string()));
                }
                if inner.by_host.contains_key(requested) {
                    return Err(CouloirError::HostTaken(requested.to_string()));
                }
                requested.to_string()
            }
            // Absent or not under our domain: synthesize a default name.
            // The counter is monotonic for the life of the process, so
            // default names are never reused after a couloir closes.
            _ => loop {
                inner.counter += 1;
                let name = if inner.counter == 1 {
                    format!("couloir{suffix}")
                } else {
                    format!("couloir{}{suffix}", inner.counter)
                };
                if !inner.by_host.contains_key(&name) {
                    break name;
                }
            },
        };

        let key = fresh_key();
        inner.by_key.insert(key.clone(), host.clone());
        inner.by_host.insert(host.clone(), Couloir::new(key.clone()));
        info!(host = %host, "couloir opened");
        Ok(Opened { host, key })
    }

    /// Resolve a key back to its host.
    pub fn join(&self, key: &str) -> Result<String> {
        self.inner
            .lock()
            .by_key
            .get(key)
            .cloned()
            .ok_or(CouloirError::UnknownKey)
    }

    /// Register an idle exposer slot and pair immediately if clients wait.
    /// Returns the slot id, used to deregister on disconnect.
    pub fn add_exposer(&self, host: &str, id: u64, handoff: oneshot::Sender<PendingClient>) {
        let mut inner = self.inner.lock();
        if let Some(couloir) = inner.by_host.get_mut(host) {
            couloir.exposers.push_back(ExposerSlot { id, handoff });
            Self::pair(host, couloir);
        }
        // A missing couloir means it was torn down after the join was
        // acknowledged; dropping the slot makes the connection task bail.
    }

    /// Evict an exposer slot. Returns false when the slot was already
    /// claimed by pairing, in which case a client is in flight on the
    /// handoff channel. Runs the teardown check.
    pub fn remove_exposer(&self, host: &str, id: u64) -> bool {
        let mut inner = self.inner.lock();
        let removed = match inner.by_host.get_mut(host) {
            Some(couloir) => {
                let before = couloir.exposers.len();
                couloir.exposers.retain(|slot| slot.id != id);
                couloir.exposers.len() != before
            }
            None => return false,
        };
        Self::teardown_if_empty(&mut inner, host);
        removed
    }

    /// Route a client to its couloir. Gives the client back when no couloir
    /// is registered under `host`, so the caller can answer 404.
    pub fn route_client(
        &self,
        host: &str,
        client: PendingClient,
    ) -> std::result::Result<(), PendingClient> {
        let mut inner = self.inner.lock();
        match inner.by_host.get_mut(host) {
            Some(couloir) => {
                couloir.pending.push_back(client);
                Self::pair(host, couloir);
                Ok(())
            }
            None => Err(client),
        }
    }

    /// Put a client whose exposer died before streaming back at the head of
    /// the queue. The client's preface is still buffered and its stream
    /// untouched, so the next exposer serves it as if nothing happened.
    pub fn requeue_client(&self, host: &str, client: PendingClient) {
        let mut inner = self.inner.lock();
        if let Some(couloir) = inner.by_host.get_mut(host) {
            couloir.pending.push_front(client);
            Self::pair(host, couloir);
        }
        // Couloir gone: dropping the client closes its socket.
    }

    /// A bound pair finished (either side closed). Runs the teardown check.
    pub fn pair_finished(&self, host: &str) {
        let mut inner = self.inner.lock();
        if let Some(couloir) = inner.by_host.get_mut(host) {
            couloir.active_pairs = couloir.active_pairs.saturating_sub(1);
        }
        Self::teardown_if_empty(&mut inner, host);
    }

    /// Pair waiting clients with idle exposers, FIFO on both sides. A slot
    /// whose connection task is gone is discarded and the client retried
    /// against the next one.
    fn pair(host: &str, couloir: &mut Couloir) {
        while !couloir.exposers.is_empty() && !couloir.pending.is_empty() {
            let Some(slot) = couloir.exposers.pop_front() else {
                break;
            };
            let Some(client) = couloir.pending.pop_front() else {
                couloir.exposers.push_front(slot);
                break;
            };
            match slot.handoff.send(client) {
                Ok(()) => {
                    couloir.active_pairs += 1;
                    debug!(host = %host, "paired client with exposer");
                }
                Err(client) => {
                    couloir.pending.push_front(client);
                }
            }
        }
    }

    /// Delete the couloir once nothing references it: no idle exposers, no
    /// waiting clients, no bound pairs.
    fn teardown_if_empty(inner: &mut Inner, host: &str) {
        let empty = inner
            .by_host
            .get(host)
            .map(|c| c.exposers.is_empty() && c.pending.is_empty() && c.active_pairs == 0)
            .unwrap_or(false);
        if empty {
            if let Some(couloir) = inner.by_host.remove(host) {
                inner.by_key.remove(&couloir.key);
                info!(
                    host = %host,
                    lived_secs = couloir.created_at.elapsed().as_secs(),
                    "couloir closed"
                );
            }
        }
    }

    fn check_password(&self, given: Option<&str>) -> Result<()> {
        let Some(expected) = &self.password else {
            return Ok(());
        };
        let given = given.unwrap_or_default();
        let matches: bool = given.as_bytes().ct_eq(expected.as_bytes()).into();
        if matches {
            Ok(())
        } else {
            Err(CouloirError::AuthFailed)
        }
    }
}

/// 24 random bytes, hex-encoded.
fn fresh_key() -> String {
    let mut bytes = [0u8; 24];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
