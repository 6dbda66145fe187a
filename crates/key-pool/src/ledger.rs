//! Per-(app, device, model) token ledger with fixed expiring windows
//!
//! A counter is created with the full window on first use. Later increments
//! keep its absolute expiry, so a window never slides forward under load.
//! Once the counter expires the next usage starts a fresh window.
//!
//! Admission compares the usage recorded *before* the current request against
//! the ceiling, so the request that crosses the ceiling is still served and
//! only the one after it is rejected.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::routing::{QuotaClass, UsageKey};
use crate::store::SharedStore;

/// Token ceilings per quota class for one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaLimits {
    pub standard: u64,
    pub premium: u64,
}

impl QuotaLimits {
    pub fn ceiling(&self, class: QuotaClass) -> u64 {
        match class {
            QuotaClass::Standard => self.standard,
            QuotaClass::Premium => self.premium,
        }
    }
}

/// Usage ledger over the shared store.
pub struct UsageLedger {
    store: Arc<dyn SharedStore>,
    window: Duration,
    limits: QuotaLimits,
}

impl UsageLedger {
    pub fn new(store: Arc<dyn SharedStore>, window: Duration, limits: QuotaLimits) -> Self {
        Self {
            store,
            window,
            limits,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn limits(&self) -> QuotaLimits {
        self.limits
    }

    /// Tokens recorded in the current window, or `None` if no window is open.
    pub async fn current_usage(&self, key: &UsageKey) -> Result<Option<u64>> {
        self.store.get(&key.storage_key()).await
    }

    /// Reject if usage so far strictly exceeds the class ceiling.
    pub async fn admission_check(&self, key: &UsageKey, class: QuotaClass) -> Result<()> {
        let Some(used) = self.current_usage(key).await? else {
            return Ok(());
        };
        let ceiling = self.limits.ceiling(class);
        if used > ceiling {
            info!(
                device_id = %key.device_id,
                app_name = %key.app_name,
                model = %key.model,
                used,
                ceiling,
                "quota exceeded, rejecting request"
            );
            metrics::counter!("gateway_quota_rejections_total", "class" => class.as_str())
                .increment(1);
            return Err(Error::QuotaExceeded {
                class,
                used,
                ceiling,
            });
        }
        Ok(())
    }

    /// Add `tokens` to the key's counter and return the new total.
    pub async fn record_usage(&self, key: &UsageKey, tokens: u64) -> Result<u64> {
        let total = self
            .store
            .incr_preserving_ttl(&key.storage_key(), tokens, self.window)
            .await?;
        debug!(
            device_id = %key.device_id,
            app_name = %key.app_name,
            model = %key.model,
            tokens,
            total,
            "usage recorded"
        );
        Ok(total)
    }

    /// Time left in the key's current window, or `None` if no window is open.
    pub async fn remaining_window(&self, key: &UsageKey) -> Result<Option<Duration>> {
        self.store.ttl(&key.storage_key()).await
    }

    /// Operator override: set the count and open a fresh full window.
    pub async fn override_usage(&self, key: &UsageKey, tokens: u64) -> Result<()> {
        self.store
            .set_with_expiry(&key.storage_key(), tokens, self.window)
            .await?;
        info!(
            device_id = %key.device_id,
            app_name = %key.app_name,
            model = %key.model,
            tokens,
            "usage overridden by operator"
        );
        Ok(())
    }
}
