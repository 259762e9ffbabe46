//! Read-through snapshot cache over the remote store.
//!
//! Holds the last fetched `{lock, quota, membership}` per account with a
//! fetch timestamp. No independent authority and no write-ahead buffering:
//! writes go straight to the store, and callers update the cache entry
//! proactively on success so the next read is consistent without a round
//! trip.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::account::Membership;
use crate::error::Result;
use crate::ids::Email;
use crate::quota::Quota;
use crate::session::LockState;
use crate::store::RemoteStore;

/// Last-known-good view of one account.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub lock: LockState,
    pub quota: Quota,
    pub membership: Membership,
    /// Preset currently activated by schedule, as of the last reconcile.
    pub active_preset: Option<Uuid>,
    pub fetched_at: DateTime<Utc>,
    /// Set when a read degraded to cached data after the store was
    /// unreachable.
    pub stale: bool,
}

struct Applied {
    snapshot: Snapshot,
    /// Issue time of the request that produced this snapshot. Responses
    /// are applied last-write-wins by this timestamp, not by completion
    /// order, so a slow stale fetch cannot overwrite a fresh one.
    issued_at: DateTime<Utc>,
}

pub struct SnapshotCache {
    store: Arc<dyn RemoteStore>,
    entries: Mutex<HashMap<Email, Applied>>,
}

impl SnapshotCache {
    pub fn new(store: Arc<dyn RemoteStore>) -> Self {
        Self {
            store,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Return the cached snapshot, or fetch one.
    ///
    /// With `force_refresh` false an existing entry is served as-is.
    /// A fetch that fails with a retryable error is retried once; if that
    /// also fails, the cached entry (when present) is served flagged
    /// stale. Reads with no cached entry propagate the error. Writes must
    /// never use this fallback.
    pub async fn get(&self, account: &Email, force_refresh: bool) -> Result<Snapshot> {
        if !force_refresh {
            if let Some(entry) = self.entries.lock().await.get(account) {
                debug!(account = %account, "serving cached snapshot");
                return Ok(entry.snapshot.clone());
            }
        }

        let issued_at = Utc::now();
        match self.fetch_with_retry(account, issued_at).await {
            Ok(snapshot) => {
                self.apply(account, issued_at, snapshot.clone()).await;
                Ok(snapshot)
            }
            Err(e) if e.is_retryable() => {
                let entries = self.entries.lock().await;
                if let Some(entry) = entries.get(account) {
                    warn!(account = %account, error = %e, "store unreachable, serving stale snapshot");
                    let mut snapshot = entry.snapshot.clone();
                    snapshot.stale = true;
                    return Ok(snapshot);
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    async fn fetch_with_retry(&self, account: &Email, issued_at: DateTime<Utc>) -> Result<Snapshot> {
        match self.fetch(account, issued_at).await {
            Err(e) if e.is_retryable() => {
                debug!(account = %account, error = %e, "status fetch failed, retrying once");
                self.fetch(account, issued_at).await
            }
            other => other,
        }
    }

    async fn fetch(&self, account: &Email, issued_at: DateTime<Utc>) -> Result<Snapshot> {
        let row = self.store.status_fetch(account).await?;

        // Quota refill settles before anything downstream looks at the
        // lock state; a just-refilled quota affects whether a tapout is
        // offered, never the other way around.
        let mut quota = row.quota;
        quota.settle(issued_at);

        Ok(Snapshot {
            lock: row.lock,
            quota,
            membership: row.membership,
            active_preset: None,
            fetched_at: issued_at,
            stale: false,
        })
    }

    /// Apply a fetched snapshot, unless a newer request's result is
    /// already in place. Returns whether the snapshot was applied.
    pub async fn apply(&self, account: &Email, issued_at: DateTime<Utc>, snapshot: Snapshot) -> bool {
        let mut entries = self.entries.lock().await;
        if let Some(current) = entries.get(account) {
            if current.issued_at > issued_at {
                debug!(account = %account, "discarding out-of-order snapshot");
                return false;
            }
        }
        entries.insert(account.clone(), Applied { snapshot, issued_at });
        true
    }

    /// Proactive update after a successful write to the store.
    pub async fn put_local(&self, account: &Email, snapshot: Snapshot) {
        self.apply(account, Utc::now(), snapshot).await;
    }

    pub async fn invalidate(&self, account: &Email) {
        self.entries.lock().await.remove(account);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::Duration;

    fn email() -> Email {
        Email::parse("alice@example.com").unwrap()
    }

    async fn seeded_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.seed_account(&email()).await;
        store
    }

    fn snapshot(fetched_at: DateTime<Utc>) -> Snapshot {
        Snapshot {
            lock: LockState::Unlocked,
            quota: Quota::full(),
            membership: Membership::Paid,
            active_preset: None,
            fetched_at,
            stale: false,
        }
    }

    #[tokio::test]
    async fn get_fetches_then_serves_cached() {
        let store = seeded_store().await;
        let cache = SnapshotCache::new(store.clone());

        let first = cache.get(&email(), false).await.unwrap();
        assert!(!first.stale);
        assert_eq!(store.status_fetch_count().await, 1);

        // Second read without force hits the cache.
        cache.get(&email(), false).await.unwrap();
        assert_eq!(store.status_fetch_count().await, 1);

        // Forced read goes back to the store.
        cache.get(&email(), true).await.unwrap();
        assert_eq!(store.status_fetch_count().await, 2);
    }

    #[tokio::test]
    async fn out_of_order_response_is_discarded() {
        let store = seeded_store().await;
        let cache = SnapshotCache::new(store);

        let t1 = Utc::now();
        let t2 = t1 + Duration::seconds(5);

        // The t2 response lands first; the older t1 response must not
        // overwrite it even though it completes later.
        let mut fresh = snapshot(t2);
        fresh.quota.consume(t2).unwrap();
        assert!(cache.apply(&email(), t2, fresh.clone()).await);
        assert!(!cache.apply(&email(), t1, snapshot(t1)).await);

        let seen = cache.get(&email(), false).await.unwrap();
        assert_eq!(seen.quota.remaining(), fresh.quota.remaining());
    }

    #[tokio::test]
    async fn unreachable_store_degrades_to_stale_snapshot() {
        let store = seeded_store().await;
        let cache = SnapshotCache::new(store.clone());

        cache.get(&email(), false).await.unwrap();

        store.set_offline(true).await;
        let degraded = cache.get(&email(), true).await.unwrap();
        assert!(degraded.stale);
    }

    #[tokio::test]
    async fn unreachable_store_with_no_cache_fails() {
        let store = seeded_store().await;
        let cache = SnapshotCache::new(store.clone());

        store.set_offline(true).await;
        let err = cache.get(&email(), false).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn failed_fetch_is_retried_once() {
        let store = seeded_store().await;
        let cache = SnapshotCache::new(store.clone());

        // First attempt fails, the bounded retry succeeds.
        store.fail_next_status_fetch().await;
        let got = cache.get(&email(), false).await.unwrap();
        assert!(!got.stale);
        assert_eq!(store.status_fetch_count().await, 2);
    }

    #[tokio::test]
    async fn fetch_settles_due_refills() {
        let store = seeded_store().await;
        let now = Utc::now();
        let due = Quota::from_parts(1, Some(now - Duration::days(1))).unwrap();
        store.set_quota(&email(), due).await;

        let cache = SnapshotCache::new(store);
        let snap = cache.get(&email(), false).await.unwrap();
        assert_eq!(snap.quota.remaining(), 2);
    }
}
