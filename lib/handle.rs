//! Server-side handle registry with lease-based lifecycle.
//!
//! Every open handle is registered here with a lease; any access refreshes
//! it. A background reaper closes handles whose lease has lapsed. Removal
//! from the table is the linearisation point for closing: whichever path
//! removes a record (get-on-expired, renew-on-expired, close, reaper, or
//! stop) performs the plugin close after releasing the table lock, so the
//! plugin sees at most one close per handle and no lock is ever held
//! across a plugin call.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{VfsError, VfsResult};
use crate::plugin::PluginHandle;
use crate::types::OpenFlag;

/// Opaque server-issued handle identifier, unique for the server lifetime.
pub type HandleId = u64;

/// Tunables for the handle manager. Zero values fall back to the defaults.
#[derive(Debug, Clone, Copy)]
pub struct HandleConfig {
    /// Lease applied when a caller requests none. Default 60 s.
    pub default_lease: Duration,
    /// Upper bound any lease is clamped to. Default 5 min.
    pub max_lease: Duration,
    /// Concurrent handle cap. Default 10 000.
    pub max_handles: usize,
    /// Reaper tick interval. Default 10 s.
    pub reap_interval: Duration,
}

impl Default for HandleConfig {
    fn default() -> Self {
        Self {
            default_lease: Duration::from_secs(60),
            max_lease: Duration::from_secs(300),
            max_handles: 10_000,
            reap_interval: Duration::from_secs(10),
        }
    }
}

impl HandleConfig {
    fn normalized(mut self) -> Self {
        let d = Self::default();
        if self.default_lease.is_zero() {
            self.default_lease = d.default_lease;
        }
        if self.max_lease.is_zero() {
            self.max_lease = d.max_lease;
        }
        if self.max_handles == 0 {
            self.max_handles = d.max_handles;
        }
        if self.reap_interval.is_zero() {
            self.reap_interval = d.reap_interval;
        }
        self
    }
}

struct HandleEntry {
    handle: Arc<dyn PluginHandle>,
    path: String,
    flags: OpenFlag,
    lease: Duration,
    expires_at: Instant,
    created_at: SystemTime,
    last_access: Instant,
}

/// What a lease-checking lookup decided while the table lock was held.
/// The expired handle is carried out so its close runs outside the lock.
enum Outcome {
    Missing,
    Expired(Arc<dyn PluginHandle>),
    Live(Arc<dyn PluginHandle>),
    Renewed(Instant),
}

/// Read-only snapshot of a registered handle.
#[derive(Debug, Clone)]
pub struct HandleInfo {
    pub id: HandleId,
    pub path: String,
    pub flags: OpenFlag,
    pub lease: Duration,
    pub expires_at: Instant,
    pub created_at: SystemTime,
    pub last_access: Instant,
}

/// Registry of open handles with lease, capacity cap, and reaper.
pub struct HandleManager {
    table: Mutex<FxHashMap<HandleId, HandleEntry>>,
    config: HandleConfig,
    next_id: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
    reaper: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl HandleManager {
    /// Create a manager and start its reaper. Must be called on a tokio
    /// runtime.
    #[must_use]
    pub fn new(config: HandleConfig) -> Arc<Self> {
        let config = config.normalized();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mgr = Arc::new(Self {
            table: Mutex::new(FxHashMap::default()),
            config,
            next_id: AtomicU64::new(1),
            shutdown_tx,
            reaper: Mutex::new(None),
        });
        let task = tokio::spawn(Self::reap_loop(Arc::clone(&mgr), shutdown_rx));
        *mgr.reaper.lock().expect("reaper slot poisoned") = Some(task);
        mgr
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> HandleConfig {
        self.config
    }

    fn clamp_lease(&self, requested: Duration, fallback: Duration) -> Duration {
        let lease = if requested.is_zero() {
            fallback
        } else {
            requested
        };
        lease.min(self.config.max_lease)
    }

    /// Register a plugin handle, returning its id and lease expiry.
    ///
    /// Fails with capacity-exceeded at the cap, leaving the table
    /// unchanged. A requested lease of zero means the default lease;
    /// oversized leases are clamped.
    pub fn register(
        &self,
        handle: Arc<dyn PluginHandle>,
        path: &str,
        flags: OpenFlag,
        lease: Duration,
    ) -> VfsResult<(HandleId, Instant)> {
        let lease = self.clamp_lease(lease, self.config.default_lease);
        let now = Instant::now();
        let expires_at = now + lease;

        let mut table = self.table.lock().expect("handle table lock poisoned");
        if table.len() >= self.config.max_handles {
            return Err(VfsError::capacity_exceeded(format!(
                "handle table at capacity ({})",
                self.config.max_handles
            )));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        table.insert(
            id,
            HandleEntry {
                handle,
                path: path.to_owned(),
                flags,
                lease,
                expires_at,
                created_at: SystemTime::now(),
                last_access: now,
            },
        );
        drop(table);

        debug!(id, path, ?lease, "registered handle");
        Ok((id, expires_at))
    }

    /// Fetch the plugin handle for `id`, refreshing its lease.
    ///
    /// An expired entry is removed and closed as a side effect; the
    /// caller sees not-found, the same as for an unknown id.
    pub async fn get(&self, id: HandleId) -> VfsResult<Arc<dyn PluginHandle>> {
        let now = Instant::now();
        let outcome = {
            let mut table = self.table.lock().expect("handle table lock poisoned");
            let expired = table.get(&id).map(|e| now > e.expires_at);
            match expired {
                None => Outcome::Missing,
                Some(true) => {
                    let entry = table.remove(&id).expect("entry vanished under lock");
                    Outcome::Expired(entry.handle)
                }
                Some(false) => {
                    let entry = table.get_mut(&id).expect("entry vanished under lock");
                    entry.last_access = now;
                    entry.expires_at = now + entry.lease;
                    Outcome::Live(Arc::clone(&entry.handle))
                }
            }
        };

        match outcome {
            Outcome::Missing => Err(VfsError::not_found(format!("handle {id}"))),
            Outcome::Live(handle) => Ok(handle),
            Outcome::Expired(expired) => {
                Self::close_quietly(id, &expired).await;
                Err(VfsError::not_found(format!("handle {id}")))
            }
            Outcome::Renewed(_) => unreachable!("get never yields Renewed"),
        }
    }

    /// Extend the lease of `id`. Zero keeps the record's current lease
    /// duration; oversized leases are clamped.
    pub async fn renew(&self, id: HandleId, lease: Duration) -> VfsResult<Instant> {
        let now = Instant::now();
        let outcome = {
            let mut table = self.table.lock().expect("handle table lock poisoned");
            let expired = table.get(&id).map(|e| now > e.expires_at);
            match expired {
                None => Outcome::Missing,
                Some(true) => {
                    let entry = table.remove(&id).expect("entry vanished under lock");
                    Outcome::Expired(entry.handle)
                }
                Some(false) => {
                    let entry = table.get_mut(&id).expect("entry vanished under lock");
                    let lease = self.clamp_lease(lease, entry.lease);
                    entry.lease = lease;
                    entry.last_access = now;
                    entry.expires_at = now + lease;
                    Outcome::Renewed(entry.expires_at)
                }
            }
        };

        match outcome {
            Outcome::Missing => Err(VfsError::not_found(format!("handle {id}"))),
            Outcome::Renewed(expires_at) => {
                debug!(id, "renewed handle");
                Ok(expires_at)
            }
            Outcome::Expired(expired) => {
                Self::close_quietly(id, &expired).await;
                Err(VfsError::not_found(format!("handle {id}")))
            }
            Outcome::Live(_) => unreachable!("renew never yields Live"),
        }
    }

    /// Close and remove `id`. The plugin close runs exactly once even if
    /// two closers race; the loser sees not-found.
    pub async fn close(&self, id: HandleId) -> VfsResult<()> {
        let removed = {
            let mut table = self.table.lock().expect("handle table lock poisoned");
            table.remove(&id)
        };
        match removed {
            None => Err(VfsError::not_found(format!("handle {id}"))),
            Some(entry) => {
                debug!(id, path = %entry.path, "closed handle");
                entry.handle.close().await
            }
        }
    }

    /// Snapshot a record without refreshing its lease.
    pub fn info(&self, id: HandleId) -> VfsResult<HandleInfo> {
        let table = self.table.lock().expect("handle table lock poisoned");
        let entry = table
            .get(&id)
            .ok_or_else(|| VfsError::not_found(format!("handle {id}")))?;
        if Instant::now() > entry.expires_at {
            return Err(VfsError::not_found(format!("handle {id}")));
        }
        Ok(Self::snapshot(id, entry))
    }

    /// Snapshot all unexpired records. A record may expire during
    /// enumeration; callers treat the result as advisory.
    #[must_use]
    pub fn list(&self) -> Vec<HandleInfo> {
        let now = Instant::now();
        let table = self.table.lock().expect("handle table lock poisoned");
        table
            .iter()
            .filter(|(_, e)| now <= e.expires_at)
            .map(|(id, e)| Self::snapshot(*id, e))
            .collect()
    }

    /// Number of registered handles, expired stragglers included.
    #[must_use]
    pub fn count(&self) -> usize {
        self.table.lock().expect("handle table lock poisoned").len()
    }

    fn snapshot(id: HandleId, entry: &HandleEntry) -> HandleInfo {
        HandleInfo {
            id,
            path: entry.path.clone(),
            flags: entry.flags,
            lease: entry.lease,
            expires_at: entry.expires_at,
            created_at: entry.created_at,
            last_access: entry.last_access,
        }
    }

    async fn close_quietly(id: HandleId, handle: &Arc<dyn PluginHandle>) {
        if let Err(e) = handle.close().await {
            warn!(id, error = %e, "plugin close failed");
        }
    }

    /// Remove every expired record and close it outside the lock.
    async fn reap(&self) {
        let now = Instant::now();
        let expired: Vec<(HandleId, HandleEntry)> = {
            let mut table = self.table.lock().expect("handle table lock poisoned");
            let ids: Vec<HandleId> = table
                .iter()
                .filter(|(_, e)| now > e.expires_at)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| table.remove(&id).map(|e| (id, e)))
                .collect()
        };

        if expired.is_empty() {
            return;
        }
        let reaped = expired.len();
        for (id, entry) in expired {
            Self::close_quietly(id, &entry.handle).await;
        }
        debug!(reaped, remaining = self.count(), "reaped expired handles");
    }

    async fn reap_loop(mgr: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(mgr.config.reap_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => mgr.reap().await,
                _ = shutdown_rx.changed() => return,
            }
        }
    }

    /// Stop the reaper, then close every remaining handle. Close errors
    /// are logged and do not abort the sweep.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let task = self.reaper.lock().expect("reaper slot poisoned").take();
        if let Some(task) = task {
            let _ = task.await;
        }

        let drained: Vec<(HandleId, HandleEntry)> = {
            let mut table = self.table.lock().expect("handle table lock poisoned");
            table.drain().collect()
        };
        let closed = drained.len();
        for (id, entry) in drained {
            Self::close_quietly(id, &entry.handle).await;
        }
        info!(closed, "handle manager stopped");
    }
}

impl std::fmt::Debug for HandleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleManager")
            .field("handles", &self.count())
            .field("config", &self.config)
            .finish()
    }
}
