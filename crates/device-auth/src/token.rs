//! Rolling hash token derivation and verification
//!
//! `token = hex(SHA256(device_id || secret || window_label))` where
//! `window_label` is the current time in the configured UTC offset, truncated
//! to the configured granularity. Day granularity formats as `%Y-%m-%d`, which
//! is what deployed clients compute.

use chrono::{DateTime, FixedOffset, TimeDelta, Utc};
use common::Secret;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{Error, Result};

/// Width of one token window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Minute,
    Hour,
    #[default]
    Day,
}

impl Granularity {
    fn step(self) -> TimeDelta {
        match self {
            Granularity::Minute => TimeDelta::minutes(1),
            Granularity::Hour => TimeDelta::hours(1),
            Granularity::Day => TimeDelta::days(1),
        }
    }

    fn format(self) -> &'static str {
        match self {
            Granularity::Minute => "%Y-%m-%d %H:%M",
            Granularity::Hour => "%Y-%m-%d %H",
            Granularity::Day => "%Y-%m-%d",
        }
    }
}

/// Verifies caller-presented rolling hash tokens.
#[derive(Debug, Clone)]
pub struct RollingTokenVerifier {
    secret: Secret<String>,
    granularity: Granularity,
    skew_windows: u32,
    offset: FixedOffset,
}

impl RollingTokenVerifier {
    /// Build a verifier. `utc_offset_hours` selects the timezone in which
    /// window labels are computed (clients and gateway must agree).
    pub fn new(
        secret: Secret<String>,
        granularity: Granularity,
        skew_windows: u32,
        utc_offset_hours: i32,
    ) -> Result<Self> {
        let offset = FixedOffset::east_opt(utc_offset_hours * 3600)
            .ok_or(Error::InvalidOffset(utc_offset_hours))?;
        Ok(Self {
            secret,
            granularity,
            skew_windows,
            offset,
        })
    }

    /// Label of the window containing `at`.
    pub fn window_label(&self, at: DateTime<Utc>) -> String {
        at.with_timezone(&self.offset)
            .format(self.granularity.format())
            .to_string()
    }

    /// Token a device is expected to present at time `at`.
    pub fn expected_token(&self, device_id: &str, at: DateTime<Utc>) -> String {
        let mut hasher = Sha256::new();
        hasher.update(device_id.as_bytes());
        hasher.update(self.secret.expose().as_bytes());
        hasher.update(self.window_label(at).as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Verify `presented` for `device_id` against the current time.
    pub fn verify(&self, device_id: &str, presented: &str) -> Result<()> {
        self.verify_at(device_id, presented, Utc::now())
    }

    /// Verify `presented` against the window containing `now` and up to
    /// `skew_windows` windows on either side.
    pub fn verify_at(&self, device_id: &str, presented: &str, now: DateTime<Utc>) -> Result<()> {
        let presented = presented.trim();
        let presented = presented.strip_prefix("Bearer ").unwrap_or(presented).trim();
        if presented.is_empty() {
            return Err(Error::MissingToken);
        }
        let presented = presented.to_ascii_lowercase();

        let step = self.granularity.step();
        let skew = i32::try_from(self.skew_windows).unwrap_or(i32::MAX);
        for shift in -skew..=skew {
            let at = now + step * shift;
            if constant_time_eq(
                presented.as_bytes(),
                self.expected_token(device_id, at).as_bytes(),
            ) {
                return Ok(());
            }
        }

        debug!(device_id, "device token did not match any window");
        Err(Error::InvalidToken {
            device_id: device_id.to_string(),
        })
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
