//! Common types for the completion gateway workspace

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
