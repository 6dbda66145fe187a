//! Secret wrapper for sensitive values
//!
//! Upstream API keys, the device-token shared secret and the Telegram bot
//! token all travel through `Secret` so they never show up in Debug output
//! or structured logs.

use std::fmt;
use std::path::Path;
use zeroize::Zeroize;

use crate::error::{Error, Result};

/// Sensitive value - redacted in Debug/Display/logs
pub struct Secret<T: Zeroize>(T);

impl<T: Zeroize> Secret<T> {
    /// Create a new secret value
    pub fn new(value: T) -> Self {
        Self(value)
    }

    /// Expose the inner value (use sparingly)
    pub fn expose(&self) -> &T {
        &self.0
    }
}

impl Secret<String> {
    /// Resolve a string secret from an env var, falling back to a file.
    ///
    /// The env var wins when set and non-empty. A configured file that cannot
    /// be read is an error; a file holding only whitespace yields `None`.
    pub fn resolve(env_var: &str, file: Option<&Path>) -> Result<Option<Self>> {
        if let Ok(value) = std::env::var(env_var) {
            let value = value.trim().to_owned();
            if !value.is_empty() {
                return Ok(Some(Self::new(value)));
            }
        }
        let Some(path) = file else {
            return Ok(None);
        };
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read secret file {}: {e}", path.display()))
        })?;
        let value = contents.trim().to_owned();
        if value.is_empty() {
            Ok(None)
        } else {
            Ok(Some(Self::new(value)))
        }
    }
}

impl From<String> for Secret<String> {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl<T: Zeroize> fmt::Debug for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> fmt::Display for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> Drop for Secret<T> {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl<T: Zeroize + Clone> Clone for Secret<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_redacts_debug() {
        let secret = Secret::new(String::from("sk-upstream-key"));
        let debug = format!("{:?}", secret);
        assert_eq!(debug, "[REDACTED]");
        assert!(!debug.contains("sk-upstream-key"));
    }

    #[test]
    fn test_secret_redacts_display() {
        let secret: Secret<String> = String::from("sk-upstream-key").into();
        assert_eq!(secret.to_string(), "[REDACTED]");
    }

    #[test]
    fn test_secret_exposes_value() {
        let secret = Secret::new(String::from("sk-upstream-key"));
        assert_eq!(secret.expose(), "sk-upstream-key");
    }

    #[test]
    fn resolve_reads_trimmed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret");
        std::fs::write(&path, "  shared-secret\n").unwrap();

        let secret = Secret::resolve("COMMON_TEST_UNSET_SECRET_VAR", Some(&path))
            .unwrap()
            .unwrap();
        assert_eq!(secret.expose(), "shared-secret");
    }

    #[test]
    fn resolve_whitespace_file_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret");
        std::fs::write(&path, " \n ").unwrap();

        let secret = Secret::resolve("COMMON_TEST_UNSET_SECRET_VAR", Some(&path)).unwrap();
        assert!(secret.is_none());
    }

    #[test]
    fn resolve_missing_file_is_config_error() {
        let err = Secret::resolve(
            "COMMON_TEST_UNSET_SECRET_VAR",
            Some(Path::new("/nonexistent/secret")),
        )
        .unwrap_err();
        assert!(err.to_string().starts_with("Configuration error:"), "got: {err}");
    }

    #[test]
    fn resolve_without_sources_yields_none() {
        let secret = Secret::resolve("COMMON_TEST_UNSET_SECRET_VAR", None).unwrap();
        assert!(secret.is_none());
    }
}
