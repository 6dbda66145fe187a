//! Per-request routing context and the closed sets it is built from
//!
//! Query types and models arrive as strings in request headers. They are
//! parsed once into enums so every downstream decision (endpoint, quota
//! ceiling, tokenizer) is an exhaustive match.

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use crate::error::Error;
use crate::tokens::BpeTokenizer;

static GPT35_TURBO_TOKENIZER: LazyLock<BpeTokenizer> =
    LazyLock::new(|| BpeTokenizer::for_model(ModelKind::Gpt35Turbo.as_str()));
static GPT4_TOKENIZER: LazyLock<BpeTokenizer> =
    LazyLock::new(|| BpeTokenizer::for_model(ModelKind::Gpt4.as_str()));

/// Kind of upstream call a client is making.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryType {
    Chat,
    Moderation,
    Generation,
}

impl QueryType {
    pub fn as_str(self) -> &'static str {
        match self {
            QueryType::Chat => "chat",
            QueryType::Moderation => "moderation",
            QueryType::Generation => "generation",
        }
    }

    /// Upstream path for this query type, relative to the configured base URL.
    pub fn endpoint_path(self) -> &'static str {
        match self {
            QueryType::Chat => "/v1/chat/completions",
            QueryType::Moderation => "/v1/moderations",
            QueryType::Generation => "/v1/images/generations",
        }
    }
}

impl FromStr for QueryType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "chat" => Ok(QueryType::Chat),
            "moderation" => Ok(QueryType::Moderation),
            "generation" => Ok(QueryType::Generation),
            other => Err(Error::Unknown {
                kind: "query type",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tier that selects which token ceiling applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuotaClass {
    Standard,
    Premium,
}

impl QuotaClass {
    pub fn as_str(self) -> &'static str {
        match self {
            QuotaClass::Standard => "standard",
            QuotaClass::Premium => "premium",
        }
    }

    /// Human label used in rejection messages.
    pub fn label(self) -> &'static str {
        match self {
            QuotaClass::Standard => "GPT-3.5",
            QuotaClass::Premium => "GPT-4",
        }
    }

    /// Machine-readable error code, distinct per tier.
    pub fn error_code(self) -> &'static str {
        match self {
            QuotaClass::Standard => "standard_quota_exceeded",
            QuotaClass::Premium => "premium_quota_exceeded",
        }
    }
}

/// Upstream model a client is allowed to request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelKind {
    Gpt35Turbo,
    Gpt4,
}

impl ModelKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ModelKind::Gpt35Turbo => "gpt-3.5-turbo",
            ModelKind::Gpt4 => "gpt-4",
        }
    }

    pub fn quota_class(self) -> QuotaClass {
        match self {
            ModelKind::Gpt35Turbo => QuotaClass::Standard,
            ModelKind::Gpt4 => QuotaClass::Premium,
        }
    }

    /// This model's BPE tokenizer, loaded on first use.
    pub fn tokenizer(self) -> &'static BpeTokenizer {
        match self {
            ModelKind::Gpt35Turbo => &GPT35_TURBO_TOKENIZER,
            ModelKind::Gpt4 => &GPT4_TOKENIZER,
        }
    }
}

impl FromStr for ModelKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gpt-3.5-turbo" | "gpt-3.5" => Ok(ModelKind::Gpt35Turbo),
            "gpt-4" => Ok(ModelKind::Gpt4),
            other => Err(Error::Unknown {
                kind: "model",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ledger key: one token counter per (app, device, model).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UsageKey {
    pub app_name: String,
    pub device_id: String,
    pub model: ModelKind,
}

impl UsageKey {
    pub fn new(app_name: impl Into<String>, device_id: impl Into<String>, model: ModelKind) -> Self {
        Self {
            app_name: app_name.into(),
            device_id: device_id.into(),
            model,
        }
    }

    /// Key under which the counter lives in the shared store.
    ///
    /// `:` separates the parts, so `%` and `:` inside a part are
    /// percent-encoded to keep distinct keys from sharing a counter.
    pub fn storage_key(&self) -> String {
        format!(
            "usage:{}:{}:{}",
            escape_part(&self.app_name),
            escape_part(&self.device_id),
            self.model
        )
    }
}

fn escape_part(part: &str) -> Cow<'_, str> {
    if part.contains([':', '%']) {
        Cow::Owned(part.replace('%', "%25").replace(':', "%3A"))
    } else {
        Cow::Borrowed(part)
    }
}

/// Everything the core needs to know about one inbound request.
#[derive(Debug, Clone)]
pub struct RoutingContext {
    pub device_id: String,
    pub app_name: String,
    pub model: ModelKind,
    pub query_type: QueryType,
    pub pin_key: Option<String>,
}

impl RoutingContext {
    pub fn usage_key(&self) -> UsageKey {
        UsageKey::new(self.app_name.clone(), self.device_id.clone(), self.model)
    }
}
