//! Device authentication for the completion gateway
//!
//! Client devices never hold an upstream API key. Instead each request
//! carries a rolling hash token derived from the device identifier, a shared
//! secret baked into the client application, and the current time truncated
//! to a configurable window. The gateway recomputes the token for the current
//! window and its neighbours to tolerate clock skew.
//!
//! Verification flow:
//! 1. Client computes `sha256(device_id + secret + window_label)` as hex
//! 2. Client sends it in the `authorization` header (optionally `Bearer `-prefixed)
//! 3. `RollingTokenVerifier::verify()` accepts the token if any window within
//!    `skew_windows` of now produces the same digest

pub mod error;
pub mod token;

pub use error::{Error, Result};
pub use token::{Granularity, RollingTokenVerifier};
