//! Distributed resource locks
//!
//! A lease covers one or more resource ids and is granted by a quorum of lock
//! replicas (`N/2 + 1`). Each replica sets every key with the lease token in
//! one atomic script, so a replica grants all keys or none.
//!
//! After the lease is granted the deletion registry is checked: a writer that
//! queued behind a deleter must not resurrect what was just removed.

use futures::future::join_all;
use parking_lot::Mutex;
use rand::RngExt;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::deletions::DeletionRegistry;
use crate::config::ConcurrencyConfig;
use crate::models::generate_token;
use crate::store::LockStore;
use crate::{Error, KeyBuilder, Result, StoreContext};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockOptions {
    /// Renew the lease in the background until unlocked
    pub auto_extend: bool,
    /// Additional attempts after the first one
    pub retry_count: u32,
    pub retry_delay: Duration,
    pub retry_jitter: Duration,
    /// Lease duration; the lease self-expires after this unless extended
    pub max_ttl: Duration,
    pub extension_threshold: Duration,
}

impl LockOptions {
    #[must_use]
    pub const fn from_config(config: &ConcurrencyConfig) -> Self {
        Self {
            auto_extend: true,
            retry_count: config.retry_count,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            retry_jitter: Duration::from_millis(config.retry_jitter_ms),
            max_ttl: Duration::from_millis(config.max_ttl_ms),
            extension_threshold: Duration::from_millis(config.extension_threshold_ms),
        }
    }

    #[must_use]
    pub const fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    #[must_use]
    pub const fn with_auto_extend(mut self, auto_extend: bool) -> Self {
        self.auto_extend = auto_extend;
        self
    }

    /// Clock drift allowance subtracted from the lease validity
    fn drift(&self) -> Duration {
        self.max_ttl / 100 + Duration::from_millis(2)
    }

    fn retry_wait(&self) -> Duration {
        let jitter = u64::try_from(self.retry_jitter.as_millis()).unwrap_or(0);
        let delay = u64::try_from(self.retry_delay.as_millis()).unwrap_or(0);
        if jitter == 0 {
            return self.retry_delay;
        }
        let offset = rand::rng().random_range(0..=jitter * 2);
        Duration::from_millis((delay + offset).saturating_sub(jitter))
    }
}

impl Default for LockOptions {
    fn default() -> Self {
        Self::from_config(&ConcurrencyConfig::default())
    }
}

/// State shared between a [`Lock`] and its renewal task
struct Lease {
    stores: Vec<Arc<dyn LockStore>>,
    keys: Vec<String>,
    token: String,
    max_ttl: Duration,
    drift: Duration,
    expires_at: Mutex<Instant>,
}

impl Lease {
    fn quorum(&self) -> usize {
        self.stores.len() / 2 + 1
    }

    fn remaining(&self) -> Duration {
        self.expires_at.lock().saturating_duration_since(Instant::now())
    }

    async fn extend(&self) -> Result<()> {
        let start = Instant::now();
        let results = join_all(
            self.stores
                .iter()
                .map(|store| store.extend(&self.keys, &self.token, self.max_ttl)),
        )
        .await;
        let extended = results.iter().filter(|r| matches!(r, Ok(true))).count();
        let validity = self.max_ttl.checked_sub(start.elapsed() + self.drift);

        match validity {
            Some(validity) if extended >= self.quorum() && !validity.is_zero() => {
                *self.expires_at.lock() = start + validity;
                debug!(lock_keys = ?self.keys, extended, "Lock extended");
                Ok(())
            }
            _ => Err(Error::LeaseLost {
                resources: self.keys.clone(),
            }),
        }
    }

    /// Best-effort release on every connected replica
    async fn release(&self) {
        let ready: Vec<_> = self.stores.iter().filter(|s| s.is_ready()).collect();
        if ready.is_empty() {
            debug!(lock_keys = ?self.keys, "No lock store ready, leaving lease to expire");
            return;
        }
        let results = join_all(ready.iter().map(|store| store.release(&self.keys, &self.token))).await;
        for (store, result) in ready.iter().zip(results) {
            if let Err(e) = result {
                warn!(
                    lock_keys = ?self.keys,
                    store = %store.name(),
                    error = %e,
                    "Failed to unlock resource"
                );
            }
        }
    }

    /// Delay before the next renewal: `expiry - 2 * threshold`, or half of
    /// what is left when that is already due
    fn next_renewal(&self, threshold: Duration) -> Duration {
        let remaining = self.remaining();
        let wait = remaining.saturating_sub(threshold * 2);
        if wait.is_zero() {
            remaining / 2
        } else {
            wait
        }
    }
}

/// A held lease. Release it with [`Lock::unlock`]; dropping it releases in a
/// spawned task.
pub struct Lock {
    lease: Arc<Lease>,
    resources: Vec<String>,
    cancel: CancellationToken,
    renewal: Option<JoinHandle<()>>,
    released: bool,
}

impl std::fmt::Debug for Lock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lock")
            .field("resources", &self.resources)
            .field("auto_extend", &self.renewal.is_some())
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl Lock {
    /// Requested resource ids, sorted and deduplicated
    #[must_use]
    pub fn resources(&self) -> &[String] {
        &self.resources
    }

    /// Store keys covered by the lease
    #[must_use]
    pub fn keys(&self) -> &[String] {
        &self.lease.keys
    }

    /// Time until the lease lapses unless extended
    #[must_use]
    pub fn expires_in(&self) -> Duration {
        self.lease.remaining()
    }

    /// Renew the lease by `max_ttl`; fails when the lease was lost
    pub async fn extend(&self) -> Result<()> {
        self.lease.extend().await
    }

    /// Stop renewal, then release. Failures are logged, never returned.
    pub async fn unlock(mut self) {
        self.released = true;
        self.cancel.cancel();
        if let Some(renewal) = self.renewal.take() {
            let _ = renewal.await;
        }
        self.lease.release().await;
        debug!(lock_keys = ?self.lease.keys, "Lock released");
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.cancel.cancel();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let lease = Arc::clone(&self.lease);
            handle.spawn(async move {
                lease.release().await;
            });
        } else {
            warn!(lock_keys = ?self.lease.keys, "Lock dropped outside a runtime, leaving it to expire");
        }
    }
}

#[derive(Clone)]
pub struct LockManager {
    stores: Vec<Arc<dyn LockStore>>,
    deletions: DeletionRegistry,
    keys: KeyBuilder,
    defaults: LockOptions,
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("replicas", &self.stores.len())
            .field("defaults", &self.defaults)
            .finish_non_exhaustive()
    }
}

impl LockManager {
    #[must_use]
    pub fn new(ctx: &StoreContext) -> Self {
        Self {
            stores: ctx.lock_stores().to_vec(),
            deletions: DeletionRegistry::new(ctx),
            keys: ctx.keys().clone(),
            defaults: LockOptions::from_config(&ctx.config().concurrency),
        }
    }

    /// Options built from the concurrency configuration
    #[must_use]
    pub fn default_options(&self) -> LockOptions {
        self.defaults.clone()
    }

    /// Acquire with the configured defaults
    pub async fn lock<S: AsRef<str>>(&self, resource_ids: &[S]) -> Result<Lock> {
        self.acquire(resource_ids, self.default_options()).await
    }

    /// Acquire one lease covering every resource id
    ///
    /// Returns `LockTimeout` when retries run out and `AlreadyDeleted` when a
    /// requested id was deleted within the deletion window; in both cases
    /// nothing stays locked.
    pub async fn acquire<S: AsRef<str>>(&self, resource_ids: &[S], opts: LockOptions) -> Result<Lock> {
        let resources: Vec<String> = resource_ids
            .iter()
            .map(|id| id.as_ref().to_string())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if resources.is_empty() {
            return Err(Error::InvalidInput("no resource to lock".to_string()));
        }
        if self.stores.is_empty() {
            return Err(Error::Configuration("no lock store configured".to_string()));
        }
        let keys: Vec<String> = resources.iter().map(|id| self.keys.lock(id)).collect();

        let lease = Arc::new(self.obtain(&keys, &opts).await?);

        let deleted = match self.deletions.deleted_among(&resources).await {
            Ok(deleted) => deleted,
            Err(e) => {
                lease.release().await;
                return Err(e);
            }
        };
        if !deleted.is_empty() {
            lease.release().await;
            debug!(ids = ?deleted, "Lock aborted, resources deleted meanwhile");
            return Err(Error::AlreadyDeleted { ids: deleted });
        }

        let cancel = CancellationToken::new();
        let renewal = opts.auto_extend.then(|| {
            spawn_renewal(Arc::clone(&lease), opts.extension_threshold, cancel.clone())
        });

        Ok(Lock {
            lease,
            resources,
            cancel,
            renewal,
            released: false,
        })
    }

    /// Run `operation` while holding the lease, releasing it afterwards
    pub async fn with_lock<S, F, Fut, T>(&self, resource_ids: &[S], opts: LockOptions, operation: F) -> Result<T>
    where
        S: AsRef<str>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let lock = self.acquire(resource_ids, opts).await?;
        let result = operation().await;
        lock.unlock().await;
        result
    }

    async fn obtain(&self, keys: &[String], opts: &LockOptions) -> Result<Lease> {
        let quorum = self.stores.len() / 2 + 1;
        let attempts = opts.retry_count.saturating_add(1);

        for attempt in 1..=attempts {
            let token = generate_token();
            let start = Instant::now();
            let results = join_all(
                self.stores
                    .iter()
                    .map(|store| store.try_acquire(keys, &token, opts.max_ttl)),
            )
            .await;

            let mut granted = 0;
            for (store, result) in self.stores.iter().zip(&results) {
                match result {
                    Ok(true) => granted += 1,
                    Ok(false) => {}
                    Err(e) => debug!(store = %store.name(), error = %e, "Lock store unavailable"),
                }
            }

            let validity = opts.max_ttl.checked_sub(start.elapsed() + opts.drift());
            let lease = Lease {
                stores: self.stores.clone(),
                keys: keys.to_vec(),
                token,
                max_ttl: opts.max_ttl,
                drift: opts.drift(),
                expires_at: Mutex::new(start),
            };

            match validity {
                Some(validity) if granted >= quorum && !validity.is_zero() => {
                    *lease.expires_at.lock() = start + validity;
                    debug!(lock_keys = ?keys, attempt, granted, "Lock acquired");
                    return Ok(lease);
                }
                _ => {
                    if granted > 0 {
                        lease.release().await;
                    }
                    if attempt < attempts {
                        tokio::time::sleep(opts.retry_wait()).await;
                    }
                }
            }
        }

        debug!(lock_keys = ?keys, attempts, "Lock acquisition timed out");
        Err(Error::LockTimeout {
            resources: keys.to_vec(),
            attempts,
        })
    }
}

fn spawn_renewal(lease: Arc<Lease>, threshold: Duration, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let wait = lease.next_renewal(threshold);
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(wait) => {}
            }
            if let Err(e) = lease.extend().await {
                warn!(lock_keys = ?lease.keys, error = %e, "Failed to extend resource");
                break;
            }
        }
    })
}
