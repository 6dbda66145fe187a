//! Upstream API-key rotation and quota enforcement
//!
//! Sits between request admission and upstream dispatch. Every inbound
//! request is checked against the usage ledger, then handed a live upstream
//! credential by the selector. Credentials rejected by upstream are retired
//! in the shared store so every gateway instance stops using them.
//!
//! Credential lifecycle:
//! 1. Keys are configured at startup, optionally pinned to a routing key
//! 2. Selector returns the pinned key if it is live, else a round-robin pick
//!    from the live set (base keys minus the retired set)
//! 3. Upstream returns 401 → `CredentialPool::retire()` adds the key's
//!    fingerprint to the retired set and fires an operator alert
//! 4. Retired keys stay retired until an operator reinstates them
//!
//! Usage accounting:
//! - `UsageLedger::admission_check()` compares the count recorded so far
//!   against the model's quota class ceiling
//! - `UsageLedger::record_usage()` adds tokens after the response completes,
//!   keeping the window's absolute expiry

pub mod alert;
pub mod classify;
pub mod credential;
pub mod error;
pub mod ledger;
pub mod pool;
pub mod redis_store;
pub mod routing;
pub mod selector;
pub mod store;
pub mod tokens;

pub use alert::{Alerter, LogAlerter, fire_and_forget};
pub use classify::{UpstreamOutcome, classify_status};
pub use credential::ApiKey;
pub use error::{Error, Result};
pub use ledger::{QuotaLimits, UsageLedger};
pub use pool::{CredentialPool, DEFAULT_RETIRED_SET};
pub use redis_store::RedisStore;
pub use routing::{ModelKind, QueryType, QuotaClass, RoutingContext, UsageKey};
pub use selector::CredentialSelector;
pub use store::{MemoryStore, SharedStore, StoreFuture};
pub use tokens::{
    BpeTokenizer, HeuristicTokenizer, StreamTokenCounter, Tokenizer, count_words, total_tokens_from_body,
};
