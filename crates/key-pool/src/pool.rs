//! Credential pool: configured upstream keys and the shared retired set
//!
//! The pool holds the immutable base key list and the pin map. Which keys are
//! retired is not held here: the retired set lives in the shared store, keyed
//! by credential fingerprint, so a retirement by any gateway instance is seen
//! by every later selection on every instance.
//!
//! Transitions:
//! - live → retired (upstream 401, via `retire`)
//! - retired → live (operator only, via `reinstate`)
//!
//! Exhaustion (no live credential left) alerts once per outage. The latch
//! clears when a live credential is seen again.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info, warn};

use crate::alert::{self, Alerter};
use crate::credential::ApiKey;
use crate::error::Result;
use crate::store::SharedStore;

/// Default name of the retired set in the shared store.
pub const DEFAULT_RETIRED_SET: &str = "expired_api_key_set";

/// Upstream credential pool backed by a shared retired set.
pub struct CredentialPool {
    keys: Vec<ApiKey>,
    pinned: HashMap<String, ApiKey>,
    retired_set: String,
    store: Arc<dyn SharedStore>,
    alerter: Arc<dyn Alerter>,
    exhaustion_alerted: AtomicBool,
}

impl CredentialPool {
    /// Build a pool from the configured base keys and pin map.
    ///
    /// Duplicate base keys are collapsed, keeping first-seen order. A pinned
    /// key may also appear in the base list.
    pub fn new(
        keys: Vec<ApiKey>,
        pinned: HashMap<String, ApiKey>,
        retired_set: impl Into<String>,
        store: Arc<dyn SharedStore>,
        alerter: Arc<dyn Alerter>,
    ) -> Self {
        let mut seen = HashSet::new();
        let keys: Vec<ApiKey> = keys
            .into_iter()
            .filter(|k| seen.insert(k.id().to_string()))
            .collect();
        info!(
            keys = keys.len(),
            pinned = pinned.len(),
            "credential pool initialized"
        );
        Self {
            keys,
            pinned,
            retired_set: retired_set.into(),
            store,
            alerter,
            exhaustion_alerted: AtomicBool::new(false),
        }
    }

    /// Number of distinct base credentials.
    pub fn base_len(&self) -> usize {
        self.keys.len()
    }

    /// Base credentials in configured order.
    pub fn keys(&self) -> &[ApiKey] {
        &self.keys
    }

    /// Dedicated credential for a pin key, if one is configured.
    pub fn pinned_for(&self, pin_key: &str) -> Option<&ApiKey> {
        self.pinned.get(pin_key)
    }

    pub fn pinned(&self) -> &HashMap<String, ApiKey> {
        &self.pinned
    }

    /// Whether `key` is absent from the retired set.
    pub async fn is_live(&self, key: &ApiKey) -> Result<bool> {
        let retired = self.store.set_contains(&self.retired_set, key.id()).await?;
        Ok(!retired)
    }

    /// Base credentials minus the retired set, in configured order.
    pub async fn live_set(&self) -> Result<Vec<ApiKey>> {
        let retired = self.store.set_members(&self.retired_set).await?;
        let live: Vec<ApiKey> = self
            .keys
            .iter()
            .filter(|k| !retired.contains(k.id()))
            .cloned()
            .collect();
        if !live.is_empty() {
            self.exhaustion_alerted.store(false, Ordering::Release);
        }
        Ok(live)
    }

    /// Fingerprints currently in the retired set.
    pub async fn retired_ids(&self) -> Result<HashSet<String>> {
        self.store.set_members(&self.retired_set).await
    }

    /// Mark `key` unusable for every instance.
    ///
    /// Idempotent. The first retirement of a key raises an operator alert on a
    /// detached task; repeats are silent. Returns true if this call retired it.
    pub async fn retire(&self, key: &ApiKey) -> Result<bool> {
        let newly_retired = self.store.set_add(&self.retired_set, key.id()).await?;
        if newly_retired {
            warn!(credential_id = key.id(), "upstream credential retired");
            metrics::counter!("gateway_credentials_retired_total").increment(1);
            self.alert(format!(
                "Upstream API key {} was rejected and has been retired",
                key.masked()
            ));
        }
        Ok(newly_retired)
    }

    /// Remove a fingerprint from the retired set. Returns true if it was retired.
    pub async fn reinstate(&self, credential_id: &str) -> Result<bool> {
        let removed = self
            .store
            .set_remove(&self.retired_set, credential_id)
            .await?;
        if removed {
            info!(credential_id, "upstream credential reinstated");
            self.exhaustion_alerted.store(false, Ordering::Release);
        }
        Ok(removed)
    }

    /// Whether `credential_id` names a configured base or pinned credential.
    pub fn knows(&self, credential_id: &str) -> bool {
        self.keys.iter().any(|k| k.id() == credential_id)
            || self.pinned.values().any(|k| k.id() == credential_id)
    }

    /// Raise a free-text operator alert without waiting for delivery.
    fn alert(&self, message: String) {
        alert::fire_and_forget(Arc::clone(&self.alerter), message);
    }

    /// Alert that every credential is retired.
    ///
    /// Only the first call of an outage alerts. Returns true if it did.
    pub fn alert_exhausted(&self) -> bool {
        if self.exhaustion_alerted.swap(true, Ordering::AcqRel) {
            debug!("credential exhaustion already alerted");
            return false;
        }
        self.alert(
            "All upstream API keys are exhausted; completion requests are failing with 503".into(),
        );
        true
    }

    /// Pool health summary for the health endpoint.
    ///
    /// All base keys live → healthy, some → degraded, none → unhealthy.
    pub async fn health(&self) -> Result<serde_json::Value> {
        let retired = self.store.set_members(&self.retired_set).await?;
        let credentials: Vec<serde_json::Value> = self
            .keys
            .iter()
            .map(|k| {
                let status = if retired.contains(k.id()) {
                    "retired"
                } else {
                    "live"
                };
                serde_json::json!({ "id": k.id(), "status": status })
            })
            .collect();

        let total = self.keys.len();
        let live = self
            .keys
            .iter()
            .filter(|k| !retired.contains(k.id()))
            .count();
        let status = if live == total && total > 0 {
            "healthy"
        } else if live > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        Ok(serde_json::json!({
            "status": status,
            "credentials_total": total,
            "credentials_live": live,
            "credentials_retired": total - live,
            "credentials": credentials
        }))
    }
}
