//! etcd companion crate for `tollgate`.
//!
//! Bring your own `etcd_client::Client`. [`EtcdStateBackend`] keeps bucket state as JSON under a
//! prefix and [`EtcdLock`] serialises deciders across processes with etcd's lease-bound `lock`.

use async_trait::async_trait;
use etcd_client::{Compare, CompareOp, LockOptions, PutOptions, Txn, TxnOp};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tollgate::{
    BucketState, LimitContext, Lock, LockError, LockGuard, Snapshot, StateBackend, StoreError,
};

/// Lease TTL used by [`EtcdLock`] unless overridden.
pub const DEFAULT_LOCK_LEASE_TTL: Duration = Duration::from_secs(10);

fn normalize_prefix(prefix: impl Into<String>) -> Result<String, String> {
    let p: String = prefix.into();

    // Normalize: trim whitespace and strip trailing slashes
    let p = p.trim().trim_end_matches('/').to_string();

    if p.is_empty() {
        return Err("prefix cannot be empty".to_string());
    }
    if p.chars().any(|c| c.is_control()) {
        return Err("prefix cannot contain control characters".to_string());
    }
    Ok(p)
}

/// Whole seconds for an etcd lease, rounded up, never below one.
fn lease_seconds(ttl: Duration) -> i64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    i64::try_from(secs.max(1)).unwrap_or(i64::MAX)
}

/// Lease attached to one stored key, with the TTL it was granted for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CachedLease {
    id: i64,
    seconds: i64,
}

/// Leases this backend has attached to keys, so each key reuses one lease instead of
/// granting a new one per write.
#[derive(Debug, Default)]
struct LeaseCache {
    leases: Mutex<HashMap<String, CachedLease>>,
}

impl LeaseCache {
    fn entries(&self) -> MutexGuard<'_, HashMap<String, CachedLease>> {
        self.leases.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Lease to reuse for `key`, if one was granted for the same TTL.
    fn reusable(&self, key: &str, seconds: i64) -> Option<i64> {
        self.entries().get(key).filter(|lease| lease.seconds == seconds).map(|lease| lease.id)
    }

    fn remember(&self, key: &str, lease: CachedLease) {
        self.entries().insert(key.to_string(), lease);
    }

    /// Drop `key`'s entry if it still refers to lease `id`.
    fn forget(&self, key: &str, id: i64) {
        let mut entries = self.entries();
        if entries.get(key).is_some_and(|lease| lease.id == id) {
            entries.remove(key);
        }
    }
}

/// Bucket state stored in etcd.
///
/// Each bucket lives at `<prefix>/<identity>` as JSON, attached to a lease of the state TTL so
/// abandoned buckets disappear on their own. A key keeps one lease across writes; every write
/// refreshes it with a single keep-alive, and a new lease is granted only when the old one has
/// expired or the TTL changed. The revision handed to the bucket is the key's `mod_revision`;
/// conditional writes are a txn comparing it.
#[derive(Clone)]
pub struct EtcdStateBackend {
    prefix: String,
    client: etcd_client::Client,
    leases: Arc<LeaseCache>,
}

impl std::fmt::Debug for EtcdStateBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtcdStateBackend")
            .field("prefix", &self.prefix)
            .field("client", &"<etcd_client::Client>")
            .finish()
    }
}

impl EtcdStateBackend {
    /// Create a backend over an existing client; keys will be `prefix/<identity>`.
    ///
    /// # Errors
    /// Returns `Err` if the prefix is empty or contains control characters.
    pub fn new(prefix: impl Into<String>, client: etcd_client::Client) -> Result<Self, String> {
        Ok(Self { prefix: normalize_prefix(prefix)?, client, leases: Arc::default() })
    }

    /// Key under which `identity` is stored.
    pub fn key_for(&self, identity: &str) -> String {
        format!("{}/{}", self.prefix, identity)
    }

    /// A live lease of `seconds` for `key`: the cached one refreshed to its full TTL, or a
    /// freshly granted one.
    async fn lease_for(
        &self,
        client: &mut etcd_client::Client,
        key: &str,
        seconds: i64,
    ) -> Result<i64, StoreError> {
        if let Some(id) = self.leases.reusable(key, seconds) {
            let (mut keeper, mut responses) =
                client.lease_keep_alive(id).await.map_err(StoreError::unavailable)?;
            keeper.keep_alive().await.map_err(StoreError::unavailable)?;
            match responses.message().await.map_err(StoreError::unavailable)? {
                Some(resp) if resp.ttl() > 0 => return Ok(id),
                _ => {
                    tracing::debug!(target: "tollgate::etcd", key, lease = id, "cached lease expired");
                    self.leases.forget(key, id);
                }
            }
        }

        let id = client.lease_grant(seconds, None).await.map_err(StoreError::unavailable)?.id();
        self.leases.remember(key, CachedLease { id, seconds });
        Ok(id)
    }
}

#[async_trait]
impl StateBackend for EtcdStateBackend {
    async fn get(&self, identity: &str) -> Result<Option<Snapshot>, StoreError> {
        let mut client = self.client.clone();
        let resp = client.get(self.key_for(identity), None).await.map_err(StoreError::unavailable)?;
        let Some(kv) = resp.kvs().first() else {
            return Ok(None);
        };
        let state: BucketState = serde_json::from_slice(kv.value())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let revision = u64::try_from(kv.mod_revision())
            .map_err(|_| StoreError::Corrupt(format!("negative revision {}", kv.mod_revision())))?;
        Ok(Some(Snapshot { state, revision }))
    }

    async fn set(
        &self,
        identity: &str,
        state: &BucketState,
        ttl: Duration,
        expected: Option<u64>,
    ) -> Result<bool, StoreError> {
        let key = self.key_for(identity);
        let value =
            serde_json::to_vec(state).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let mut client = self.client.clone();

        // Failed or lost writes keep the lease cached: the next write for the key reuses it,
        // and revoking it could delete a write whose response was lost.
        let lease = self.lease_for(&mut client, &key, lease_seconds(ttl)).await?;
        let put = PutOptions::new().with_lease(lease);

        let Some(expected) = expected else {
            client.put(key, value, Some(put)).await.map_err(StoreError::unavailable)?;
            return Ok(true);
        };

        // An absent key compares as mod_revision 0.
        let expected = i64::try_from(expected)
            .map_err(|_| StoreError::Corrupt(format!("revision {expected} out of range")))?;
        let txn = Txn::new()
            .when(vec![Compare::mod_revision(key.clone(), CompareOp::Equal, expected)])
            .and_then(vec![TxnOp::put(key.clone(), value, Some(put))]);
        let resp = client.txn(txn).await.map_err(StoreError::unavailable)?;
        if !resp.succeeded() {
            tracing::debug!(target: "tollgate::etcd", key = %key, "conditional write lost the race");
        }
        Ok(resp.succeeded())
    }
}

/// Distributed lock on etcd's `lock` RPC.
///
/// Every acquisition grants a fresh lease and locks `<prefix>/<identity>` with it. Release
/// unlocks and revokes the lease; if the holder dies, the lease TTL frees the lock. Critical
/// sections longer than the lease TTL lose exclusivity.
#[derive(Clone)]
pub struct EtcdLock {
    prefix: String,
    client: etcd_client::Client,
    lease_ttl: Duration,
}

impl std::fmt::Debug for EtcdLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtcdLock")
            .field("prefix", &self.prefix)
            .field("lease_ttl", &self.lease_ttl)
            .field("client", &"<etcd_client::Client>")
            .finish()
    }
}

impl EtcdLock {
    /// Create a lock over an existing client; lock names will be `prefix/<identity>`.
    ///
    /// # Errors
    /// Returns `Err` if the prefix is empty or contains control characters.
    pub fn new(prefix: impl Into<String>, client: etcd_client::Client) -> Result<Self, String> {
        Ok(Self { prefix: normalize_prefix(prefix)?, client, lease_ttl: DEFAULT_LOCK_LEASE_TTL })
    }

    /// Override the lease TTL (rounded up to whole seconds, minimum one).
    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    /// Lease TTL granted per acquisition.
    pub fn lease_ttl(&self) -> Duration {
        self.lease_ttl
    }
}

async fn revoke(mut client: etcd_client::Client, lease: i64) {
    if let Err(e) = client.lease_revoke(lease).await {
        tracing::warn!(target: "tollgate::etcd", lease, error = %e, "failed to revoke lock lease");
    }
}

async fn unlock(mut client: etcd_client::Client, key: Vec<u8>, lease: i64) {
    if let Err(e) = client.unlock(key).await {
        tracing::warn!(target: "tollgate::lock", lease, error = %e, "failed to unlock etcd lock");
    }
    revoke(client, lease).await;
}

#[async_trait]
impl Lock for EtcdLock {
    async fn acquire(&self, ctx: &LimitContext, identity: &str) -> Result<LockGuard, LockError> {
        ctx.check()?;
        let mut client = self.client.clone();

        let lease = ctx
            .run(client.lease_grant(lease_seconds(self.lease_ttl), None))
            .await?
            .map_err(LockError::backend)?
            .id();

        let name = format!("{}/{}", self.prefix, identity);
        let locked =
            ctx.run(client.lock(name.clone(), Some(LockOptions::new().with_lease(lease)))).await;
        match locked {
            Ok(Ok(resp)) => {
                tracing::trace!(target: "tollgate::lock", name = %name, lease, "etcd lock acquired");
                Ok(LockGuard::remote(unlock(self.client.clone(), resp.key().to_vec(), lease)))
            }
            Ok(Err(e)) => {
                revoke(client, lease).await;
                Err(LockError::backend(e))
            }
            Err(reason) => {
                // The server may still grant the lock; revoking the lease drops it either way.
                revoke(client, lease).await;
                Err(LockError::Cancelled(reason))
            }
        }
    }
}
