//! Upstream API key with a stable, loggable identifier

use std::fmt;
use std::hash::{Hash, Hasher};

use common::Secret;
use sha2::{Digest, Sha256};

/// An upstream API key.
///
/// The key itself is only reachable through `expose()`. Everything else
/// (logs, metrics, the retired set, admin responses) uses `id()`, the first
/// 16 hex characters of the key's SHA-256.
#[derive(Clone)]
pub struct ApiKey {
    id: String,
    secret: Secret<String>,
}

impl ApiKey {
    pub fn new(value: impl Into<String>) -> Self {
        let value = value.into();
        let id = fingerprint(&value);
        Self {
            id,
            secret: Secret::new(value),
        }
    }

    /// Fingerprint identifying this key in the shared store and in logs.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn expose(&self) -> &str {
        self.secret.expose()
    }

    /// Short human-readable form for operator alerts: `sk-...wxyz`.
    pub fn masked(&self) -> String {
        let chars: Vec<char> = self.secret.expose().chars().collect();
        if chars.len() <= 8 {
            return "****".to_string();
        }
        let prefix: String = chars[..3].iter().collect();
        let suffix: String = chars[chars.len() - 4..].iter().collect();
        format!("{prefix}...{suffix}")
    }
}

fn fingerprint(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    hex::encode(&digest[..8])
}

impl PartialEq for ApiKey {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ApiKey {}

impl Hash for ApiKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ApiKey").field(&self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_is_stable_hex_fingerprint() {
        let a = ApiKey::new("sk-live-abcdefghijklmnop");
        let b = ApiKey::new("sk-live-abcdefghijklmnop");
        assert_eq!(a.id(), b.id());
        assert_eq!(a.id().len(), 16);
        assert!(a.id().chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(a, b);
    }

    #[test]
    fn distinct_keys_have_distinct_ids() {
        assert_ne!(ApiKey::new("sk-one").id(), ApiKey::new("sk-two").id());
    }

    #[test]
    fn debug_never_contains_secret() {
        let key = ApiKey::new("sk-live-abcdefghijklmnop");
        let debug = format!("{key:?}");
        assert!(!debug.contains("abcdefghijklmnop"), "got: {debug}");
        assert!(debug.contains(key.id()));
    }

    #[test]
    fn masked_keeps_prefix_and_suffix() {
        let key = ApiKey::new("sk-live-abcdefghijklmnop");
        assert_eq!(key.masked(), "sk-...mnop");
        assert_eq!(ApiKey::new("short").masked(), "****");
    }

    #[test]
    fn expose_returns_raw_value() {
        assert_eq!(ApiKey::new("sk-raw").expose(), "sk-raw");
    }
}
