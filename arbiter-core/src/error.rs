//! Arbiter error abstractions.

use thiserror::Error;

/// Application error variants.
#[derive(Debug, Error, PartialEq)]
pub enum AppError {
    /// A resource quantity could not be parsed.
    #[error("invalid quantity {0:?}: {1}")]
    InvalidQuantity(String, &'static str),
    /// The given input was invalid.
    #[error("validation error: {0}")]
    InvalidInput(String),
    /// The named allocation policy is not known to this build.
    #[error("unknown allocation policy {0:?}")]
    UnknownPolicy(String),
}
