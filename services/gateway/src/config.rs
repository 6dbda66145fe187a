//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Upstream keys may live in the TOML, but `UPSTREAM_API_KEYS` replaces the
//! list when set. The device-token secret and the Telegram bot token are only
//! read from env vars or secret files, never from the TOML itself.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use common::Secret;
use device_auth::Granularity;
use key_pool::{ApiKey, DEFAULT_RETIRED_SET, QuotaLimits};
use serde::Deserialize;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub quota: QuotaConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
    #[serde(default)]
    pub stats: StatsConfig,
}

/// Listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// Separate listener for the admin API. Admin routes are not served when unset.
    #[serde(default)]
    pub admin_addr: Option<SocketAddr>,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Upstream completion API and its credentials
#[derive(Debug, Deserialize)]
pub struct UpstreamConfig {
    pub base_url: String,
    #[serde(default, rename = "api_keys")]
    raw_api_keys: Vec<String>,
    #[serde(default, rename = "pinned")]
    raw_pinned: HashMap<String, String>,
    /// Base credentials, resolved from `UPSTREAM_API_KEYS` or `api_keys`.
    #[serde(skip)]
    pub api_keys: Vec<ApiKey>,
    /// Pin key (`bandl-id` header value) to dedicated credential.
    #[serde(skip)]
    pub pinned: HashMap<String, ApiKey>,
}

/// Usage window and per-class ceilings
#[derive(Debug, Deserialize)]
pub struct QuotaConfig {
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    pub standard_limit: u64,
    pub premium_limit: u64,
}

impl QuotaConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn limits(&self) -> QuotaLimits {
        QuotaLimits {
            standard: self.standard_limit,
            premium: self.premium_limit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Redis,
}

/// Shared store holding the retired set and usage counters
#[derive(Debug, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default, rename = "redis_url")]
    raw_redis_url: Option<String>,
    /// Resolved from `REDIS_URL` or `redis_url`. May carry a password.
    #[serde(skip)]
    pub redis_url: Option<Secret<String>>,
    #[serde(default = "default_retired_set")]
    pub retired_set: String,
    /// Interval of the expired-counter sweep for the memory backend.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            raw_redis_url: None,
            redis_url: None,
            retired_set: default_retired_set(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

/// Device token verification
#[derive(Debug, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub granularity: Granularity,
    #[serde(default = "default_skew_windows")]
    pub skew_windows: u32,
    #[serde(default)]
    pub utc_offset_hours: i32,
    /// Path to a file containing the shared secret (alternative to DEVICE_AUTH_SECRET)
    #[serde(default)]
    pub secret_file: Option<PathBuf>,
    #[serde(skip)]
    pub secret: Option<Secret<String>>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            granularity: Granularity::default(),
            skew_windows: default_skew_windows(),
            utc_offset_hours: 0,
            secret_file: None,
            secret: None,
        }
    }
}

/// Operator alerts via Telegram. Without a chat id and bot token, alerts go to the log.
#[derive(Debug, Deserialize)]
pub struct AlertsConfig {
    #[serde(default)]
    pub chat_id: Option<String>,
    #[serde(default)]
    pub bot_token_file: Option<PathBuf>,
    #[serde(default = "default_telegram_api")]
    pub api_base: String,
    #[serde(skip)]
    pub bot_token: Option<Secret<String>>,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            chat_id: None,
            bot_token_file: None,
            api_base: default_telegram_api(),
            bot_token: None,
        }
    }
}

/// Usage statistics sink
#[derive(Debug, Default, Deserialize)]
pub struct StatsConfig {
    /// Append-only JSON-lines file. Records go to the log when unset.
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub record_incoming: bool,
}

fn default_max_connections() -> usize {
    1000
}

fn default_window_secs() -> u64 {
    86_400
}

fn default_retired_set() -> String {
    DEFAULT_RETIRED_SET.to_string()
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

fn default_skew_windows() -> u32 {
    1
}

fn default_telegram_api() -> String {
    "https://api.telegram.org".to_string()
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if !config.upstream.base_url.starts_with("http://")
            && !config.upstream.base_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "base_url must start with http:// or https://, got: {}",
                config.upstream.base_url
            )));
        }

        if config.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        if config.quota.window_secs == 0 {
            return Err(common::Error::Config(
                "window_secs must be greater than 0".into(),
            ));
        }
        if config.quota.standard_limit == 0 || config.quota.premium_limit == 0 {
            return Err(common::Error::Config(
                "standard_limit and premium_limit must be greater than 0".into(),
            ));
        }

        // Upstream keys: env var replaces the configured list
        let raw_keys = std::mem::take(&mut config.upstream.raw_api_keys);
        let keys: Vec<String> = match std::env::var("UPSTREAM_API_KEYS") {
            Ok(list) if !list.trim().is_empty() => list.split(',').map(str::to_owned).collect(),
            _ => raw_keys,
        };
        config.upstream.api_keys = keys
            .into_iter()
            .map(|k| k.trim().to_owned())
            .filter(|k| !k.is_empty())
            .map(ApiKey::new)
            .collect();
        if config.upstream.api_keys.is_empty() {
            return Err(common::Error::MissingSecret("UPSTREAM_API_KEYS"));
        }
        config.upstream.pinned = std::mem::take(&mut config.upstream.raw_pinned)
            .into_iter()
            .map(|(pin, key)| (pin, ApiKey::new(key.trim())))
            .collect();

        // Redis URL: env var takes precedence over file
        let raw_redis_url = config.store.raw_redis_url.take();
        config.store.redis_url = match std::env::var("REDIS_URL") {
            Ok(url) if !url.trim().is_empty() => Some(Secret::new(url.trim().to_owned())),
            _ => raw_redis_url.map(Secret::new),
        };
        if config.store.backend == StoreBackend::Redis && config.store.redis_url.is_none() {
            return Err(common::Error::MissingSecret("REDIS_URL"));
        }
        if config.store.sweep_interval_secs == 0 {
            return Err(common::Error::Config(
                "sweep_interval_secs must be greater than 0".into(),
            ));
        }

        config.auth.secret =
            Secret::resolve("DEVICE_AUTH_SECRET", config.auth.secret_file.as_deref())?;
        if config.auth.enabled && config.auth.secret.is_none() {
            return Err(common::Error::MissingSecret("DEVICE_AUTH_SECRET"));
        }

        config.alerts.bot_token =
            Secret::resolve("TELEGRAM_BOT_TOKEN", config.alerts.bot_token_file.as_deref())?;

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("completion-gateway.toml")
    }
}
