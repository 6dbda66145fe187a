//! Per-request credential selection
//!
//! A live pinned credential always wins for its pin key. Otherwise selection
//! is round-robin over the live set, using an `AtomicUsize` cursor shared by
//! all requests. The live set is re-read from the shared store on every call,
//! so a retirement made by the previous attempt is already excluded.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::debug;

use crate::credential::ApiKey;
use crate::error::{Error, Result};
use crate::pool::CredentialPool;
use crate::routing::RoutingContext;

/// Picks one live credential per attempt.
pub struct CredentialSelector {
    pool: Arc<CredentialPool>,
    next_index: AtomicUsize,
}

impl CredentialSelector {
    pub fn new(pool: Arc<CredentialPool>) -> Self {
        Self {
            pool,
            next_index: AtomicUsize::new(0),
        }
    }

    pub fn pool(&self) -> &Arc<CredentialPool> {
        &self.pool
    }

    /// Select a credential for `ctx`.
    ///
    /// Returns `NoLiveCredential` when the pinned credential (if any) and every
    /// base credential are retired.
    pub async fn select_for(&self, ctx: &RoutingContext) -> Result<ApiKey> {
        if let Some(pinned) = ctx.pin_key.as_deref().and_then(|p| self.pool.pinned_for(p)) {
            if self.pool.is_live(pinned).await? {
                debug!(credential_id = pinned.id(), "using pinned credential");
                return Ok(pinned.clone());
            }
            debug!(
                credential_id = pinned.id(),
                "pinned credential retired, falling back to shared pool"
            );
        }

        let live = self.pool.live_set().await?;
        if live.is_empty() {
            return Err(Error::NoLiveCredential);
        }
        let idx = self.next_index.fetch_add(1, Ordering::Relaxed) % live.len();
        Ok(live[idx].clone())
    }

    /// Maximum attempts for one request: the base pool size, plus one when a
    /// pinned credential is configured for this context.
    pub fn attempt_budget(&self, ctx: &RoutingContext) -> usize {
        let pinned = ctx
            .pin_key
            .as_deref()
            .and_then(|p| self.pool.pinned_for(p))
            .is_some();
        self.pool.base_len() + usize::from(pinned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::LogAlerter;
    use crate::pool::DEFAULT_RETIRED_SET;
    use crate::routing::{ModelKind, QueryType};
    use crate::store::MemoryStore;
    use std::collections::{HashMap, HashSet};

    fn ctx(pin_key: Option<&str>) -> RoutingContext {
        RoutingContext {
            device_id: "dev-1".into(),
            app_name: "app".into(),
            model: ModelKind::Gpt35Turbo,
            query_type: QueryType::Chat,
            pin_key: pin_key.map(String::from),
        }
    }

    fn selector(keys: &[&str], pinned: &[(&str, &str)]) -> CredentialSelector {
        let pinned = pinned
            .iter()
            .map(|(pin, key)| (pin.to_string(), ApiKey::new(*key)))
            .collect::<HashMap<_, _>>();
        let pool = CredentialPool::new(
            keys.iter().map(|k| ApiKey::new(*k)).collect(),
            pinned,
            DEFAULT_RETIRED_SET,
            Arc::new(MemoryStore::new()),
            Arc::new(LogAlerter),
        );
        CredentialSelector::new(Arc::new(pool))
    }

    #[tokio::test]
    async fn round_robin_cycles_through_live_keys() {
        let s = selector(&["a", "b"], &[]);
        let c = ctx(None);
        let s1 = s.select_for(&c).await.unwrap();
        let s2 = s.select_for(&c).await.unwrap();
        let s3 = s.select_for(&c).await.unwrap();
        assert_eq!(s1, ApiKey::new("a"));
        assert_eq!(s2, ApiKey::new("b"));
        assert_eq!(s3, ApiKey::new("a"));
    }

    #[tokio::test]
    async fn retired_key_is_never_selected() {
        let s = selector(&["a", "b", "c"], &[]);
        let b = ApiKey::new("b");
        s.pool().retire(&b).await.unwrap();

        let c = ctx(None);
        let mut seen = HashSet::new();
        for _ in 0..12 {
            seen.insert(s.select_for(&c).await.unwrap());
        }
        assert!(!seen.contains(&b));
        assert_eq!(seen.len(), 2);
    }

    #[tokio::test]
    async fn live_pinned_key_always_wins() {
        let s = selector(&["a", "b"], &[("bandl-X", "dedicated")]);
        let c = ctx(Some("bandl-X"));
        for _ in 0..5 {
            assert_eq!(s.select_for(&c).await.unwrap(), ApiKey::new("dedicated"));
        }
    }

    #[tokio::test]
    async fn unknown_pin_key_uses_shared_pool() {
        let s = selector(&["a"], &[("bandl-X", "dedicated")]);
        let c = ctx(Some("bandl-Y"));
        assert_eq!(s.select_for(&c).await.unwrap(), ApiKey::new("a"));
        assert_eq!(s.attempt_budget(&c), 1);
    }

    #[tokio::test]
    async fn retired_pin_falls_back_to_live_set() {
        // K1 is both a base key and pinned to bandl-X.
        let s = selector(&["K1", "K2"], &[("bandl-X", "K1")]);
        let c = ctx(Some("bandl-X"));
        assert_eq!(s.attempt_budget(&c), 3);

        let first = s.select_for(&c).await.unwrap();
        assert_eq!(first, ApiKey::new("K1"));
        s.pool().retire(&first).await.unwrap();

        let second = s.select_for(&c).await.unwrap();
        assert_eq!(second, ApiKey::new("K2"));
    }

    #[tokio::test]
    async fn all_retired_is_no_live_credential() {
        let s = selector(&["a", "b"], &[]);
        s.pool().retire(&ApiKey::new("a")).await.unwrap();
        s.pool().retire(&ApiKey::new("b")).await.unwrap();

        let err = s.select_for(&ctx(None)).await.unwrap_err();
        assert!(matches!(err, Error::NoLiveCredential));
    }

    #[tokio::test]
    async fn budget_counts_base_keys() {
        let s = selector(&["a", "b", "c"], &[]);
        assert_eq!(s.attempt_budget(&ctx(None)), 3);
    }
}
