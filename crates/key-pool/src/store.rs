//! Shared key/value store abstraction
//!
//! The retired-credential set and the usage counters are shared by every
//! request and, in multi-instance deployments, by every gateway process. The
//! pool and ledger never hold that state themselves; they talk to a
//! `SharedStore` injected at construction.
//!
//! `MemoryStore` serves single-instance deployments and tests. `RedisStore`
//! (see `redis_store`) is the multi-instance backend.
//!
//! Uses `Pin<Box<dyn Future>>` return types so the store can be shared as
//! `Arc<dyn SharedStore>`.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::debug;

use crate::error::Result;

/// Boxed future returned by store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Operations the pool and ledger need from the shared store.
///
/// Every operation is atomic with respect to its key. There are no
/// multi-key operations and no cross-key locking.
pub trait SharedStore: Send + Sync {
    /// Current value of a counter, or `None` if absent or expired.
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<u64>>;

    /// Overwrite a counter with a fresh expiry.
    fn set_with_expiry<'a>(&'a self, key: &'a str, value: u64, ttl: Duration)
    -> StoreFuture<'a, ()>;

    /// Add `delta` to a counter and return the new total.
    ///
    /// If the counter is absent it is created with value `delta` and expiry
    /// `ttl`. If present, its absolute expiry is left untouched.
    fn incr_preserving_ttl<'a>(
        &'a self,
        key: &'a str,
        delta: u64,
        ttl: Duration,
    ) -> StoreFuture<'a, u64>;

    /// Remaining lifetime of a counter, or `None` if absent.
    fn ttl<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<Duration>>;

    /// Add a member to a set. Returns true if it was not already present.
    fn set_add<'a>(&'a self, set: &'a str, member: &'a str) -> StoreFuture<'a, bool>;

    /// Remove a member from a set. Returns true if it was present.
    fn set_remove<'a>(&'a self, set: &'a str, member: &'a str) -> StoreFuture<'a, bool>;

    /// Whether `member` belongs to `set`.
    fn set_contains<'a>(&'a self, set: &'a str, member: &'a str) -> StoreFuture<'a, bool>;

    /// All members of a set (empty if the set does not exist).
    fn set_members<'a>(&'a self, set: &'a str) -> StoreFuture<'a, HashSet<String>>;
}

#[derive(Debug, Clone, Copy)]
struct Counter {
    value: u64,
    expires_at: Instant,
}

impl Counter {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// In-process store. Expired counters are dropped lazily on access and
/// periodically by the sweeper task.
#[derive(Debug, Default)]
pub struct MemoryStore {
    counters: Mutex<HashMap<String, Counter>>,
    sets: RwLock<HashMap<String, HashSet<String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired counter. Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut counters = self.counters.lock().await;
        let before = counters.len();
        counters.retain(|_, c| c.is_live(now));
        before - counters.len()
    }

    /// Spawn a background task that purges expired counters every `interval`.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = store.purge_expired().await;
                if removed > 0 {
                    debug!(removed, "purged expired usage counters");
                }
            }
        })
    }
}

impl SharedStore for MemoryStore {
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<u64>> {
        Box::pin(async move {
            let now = Instant::now();
            let mut counters = self.counters.lock().await;
            match counters.get(key) {
                Some(c) if c.is_live(now) => Ok(Some(c.value)),
                Some(_) => {
                    counters.remove(key);
                    Ok(None)
                }
                None => Ok(None),
            }
        })
    }

    fn set_with_expiry<'a>(
        &'a self,
        key: &'a str,
        value: u64,
        ttl: Duration,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let expires_at = Instant::now() + ttl;
            self.counters
                .lock()
                .await
                .insert(key.to_string(), Counter { value, expires_at });
            Ok(())
        })
    }

    fn incr_preserving_ttl<'a>(
        &'a self,
        key: &'a str,
        delta: u64,
        ttl: Duration,
    ) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            let now = Instant::now();
            let mut counters = self.counters.lock().await;
            match counters.get_mut(key) {
                Some(c) if c.is_live(now) => {
                    c.value = c.value.saturating_add(delta);
                    Ok(c.value)
                }
                _ => {
                    counters.insert(
                        key.to_string(),
                        Counter {
                            value: delta,
                            expires_at: now + ttl,
                        },
                    );
                    Ok(delta)
                }
            }
        })
    }

    fn ttl<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<Duration>> {
        Box::pin(async move {
            let now = Instant::now();
            let counters = self.counters.lock().await;
            Ok(counters
                .get(key)
                .filter(|c| c.is_live(now))
                .map(|c| c.expires_at.saturating_duration_since(now)))
        })
    }

    fn set_add<'a>(&'a self, set: &'a str, member: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let mut sets = self.sets.write().await;
            Ok(sets
                .entry(set.to_string())
                .or_default()
                .insert(member.to_string()))
        })
    }

    fn set_remove<'a>(&'a self, set: &'a str, member: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let mut sets = self.sets.write().await;
            Ok(sets.get_mut(set).is_some_and(|s| s.remove(member)))
        })
    }

    fn set_contains<'a>(&'a self, set: &'a str, member: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let sets = self.sets.read().await;
            Ok(sets.get(set).is_some_and(|s| s.contains(member)))
        })
    }

    fn set_members<'a>(&'a self, set: &'a str) -> StoreFuture<'a, HashSet<String>> {
        Box::pin(async move {
            let sets = self.sets.read().await;
            Ok(sets.get(set).cloned().unwrap_or_default())
        })
    }
}
