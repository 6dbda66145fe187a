//! Redis-backed shared store for multi-instance deployments
//!
//! Counters are plain Redis integers with a millisecond expiry. The
//! increment-preserving-TTL operation runs as a Lua script so the
//! read-TTL / add / write-back sequence cannot interleave with another
//! instance's update of the same key. `INCRBY` keeps an existing expiry, so
//! the script only sets one when the key is new.

use std::collections::HashSet;
use std::time::Duration;

use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::info;

use crate::error::Result;
use crate::store::{SharedStore, StoreFuture};

/// KEYS[1] = counter, ARGV[1] = delta, ARGV[2] = window in milliseconds.
const INCR_PRESERVING_TTL: &str = r#"
local ttl = redis.call('PTTL', KEYS[1])
if ttl == -2 then
    redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
    return tonumber(ARGV[1])
end
local total = redis.call('INCRBY', KEYS[1], ARGV[1])
if ttl == -1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return total
"#;

/// Shared store backed by a Redis server.
///
/// `ConnectionManager` reconnects transparently and is cheap to clone, so
/// each operation clones it rather than holding a lock.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    incr_script: redis::Script,
}

impl RedisStore {
    /// Connect to the Redis server at `url` (e.g. `redis://:password@redis:6379/0`).
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!("connected to redis shared store");
        Ok(Self {
            conn,
            incr_script: redis::Script::new(INCR_PRESERVING_TTL),
        })
    }
}

fn millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

impl SharedStore for RedisStore {
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<u64>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let value: Option<u64> = conn.get(key).await?;
            Ok(value)
        })
    }

    fn set_with_expiry<'a>(
        &'a self,
        key: &'a str,
        value: u64,
        ttl: Duration,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let _: () = redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("PX")
                .arg(millis(ttl))
                .query_async(&mut conn)
                .await?;
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
            let mut conn = self.conn.clone();
            let total: u64 = self
                .incr_script
                .key(key)
                .arg(delta)
                .arg(millis(ttl))
                .invoke_async(&mut conn)
                .await?;
            Ok(total)
        })
    }

    fn ttl<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<Duration>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let ms: i64 = conn.pttl(key).await?;
            // -2: no such key, -1: key without expiry
            Ok(u64::try_from(ms).ok().map(Duration::from_millis))
        })
    }

    fn set_add<'a>(&'a self, set: &'a str, member: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let added: i64 = conn.sadd(set, member).await?;
            Ok(added > 0)
        })
    }

    fn set_remove<'a>(&'a self, set: &'a str, member: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let removed: i64 = conn.srem(set, member).await?;
            Ok(removed > 0)
        })
    }

    fn set_contains<'a>(&'a self, set: &'a str, member: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let present: bool = conn.sismember(set, member).await?;
            Ok(present)
        })
    }

    fn set_members<'a>(&'a self, set: &'a str) -> StoreFuture<'a, HashSet<String>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let members: HashSet<String> = conn.smembers(set).await?;
            Ok(members)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    /// Store for the server named by `REDIS_URL`; the Redis tests are
    /// skipped when it is unset.
    async fn redis_store() -> Option<RedisStore> {
        let Ok(url) = std::env::var("REDIS_URL") else {
            eprintln!("REDIS_URL not set, skipping redis store test");
            return None;
        };
        Some(RedisStore::connect(&url).await.unwrap())
    }

    fn unique_key(name: &str) -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        format!("key-pool-test:{name}:{}:{nanos}", std::process::id())
    }

    async fn delete(store: &RedisStore, key: &str) {
        let mut conn = store.conn.clone();
        let _: i64 = conn.del(key).await.unwrap();
    }

    #[test]
    fn millis_rounds_up_to_one() {
        assert_eq!(millis(Duration::ZERO), 1);
        assert_eq!(millis(Duration::from_secs(2)), 2000);
    }

    #[tokio::test]
    async fn incr_adds_and_keeps_the_first_expiry() {
        let Some(store) = redis_store().await else {
            return;
        };
        let key = unique_key("preserve");
        let window = Duration::from_secs(60);

        assert_eq!(store.incr_preserving_ttl(&key, 3, window).await.unwrap(), 3);
        let first_ttl = store.ttl(&key).await.unwrap().unwrap();
        assert!(first_ttl <= window);

        // a longer window on the second call must not extend the expiry
        let total = store
            .incr_preserving_ttl(&key, 5, Duration::from_secs(600))
            .await
            .unwrap();
        assert_eq!(total, 8);
        assert_eq!(store.get(&key).await.unwrap(), Some(8));
        let second_ttl = store.ttl(&key).await.unwrap().unwrap();
        assert!(second_ttl <= first_ttl, "{second_ttl:?} > {first_ttl:?}");

        delete(&store, &key).await;
    }

    #[tokio::test]
    async fn incr_after_expiry_starts_a_full_window() {
        let Some(store) = redis_store().await else {
            return;
        };
        let key = unique_key("recreate");

        store
            .incr_preserving_ttl(&key, 5, Duration::from_millis(100))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(store.get(&key).await.unwrap(), None);
        assert_eq!(store.ttl(&key).await.unwrap(), None);

        let window = Duration::from_secs(60);
        assert_eq!(store.incr_preserving_ttl(&key, 2, window).await.unwrap(), 2);
        let ttl = store.ttl(&key).await.unwrap().unwrap();
        assert!(ttl > Duration::from_secs(59) && ttl <= window, "{ttl:?}");

        delete(&store, &key).await;
    }

    #[tokio::test]
    async fn incr_gives_a_persistent_key_an_expiry() {
        let Some(store) = redis_store().await else {
            return;
        };
        let key = unique_key("persistent");
        let mut conn = store.conn.clone();
        let _: () = conn.set(&key, 7u64).await.unwrap();
        assert_eq!(store.ttl(&key).await.unwrap(), None);

        let window = Duration::from_secs(60);
        assert_eq!(store.incr_preserving_ttl(&key, 1, window).await.unwrap(), 8);
        let ttl = store.ttl(&key).await.unwrap().unwrap();
        assert!(ttl > Duration::from_secs(59) && ttl <= window, "{ttl:?}");

        delete(&store, &key).await;
    }

    #[tokio::test]
    async fn retired_set_round_trips_through_redis() {
        let Some(store) = redis_store().await else {
            return;
        };
        let set = unique_key("retired");

        assert!(store.set_add(&set, "abc").await.unwrap());
        assert!(!store.set_add(&set, "abc").await.unwrap());
        assert!(store.set_contains(&set, "abc").await.unwrap());
        assert_eq!(
            store.set_members(&set).await.unwrap(),
            HashSet::from(["abc".to_string()])
        );
        assert!(store.set_remove(&set, "abc").await.unwrap());
        assert!(!store.set_contains(&set, "abc").await.unwrap());

        delete(&store, &set).await;
    }
}
