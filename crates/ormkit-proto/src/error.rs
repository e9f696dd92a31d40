//! Protocol error types.

use thiserror::Error;

/// Errors raised while building or encoding keys, rows, and values.
#[derive(Debug, Error)]
pub enum Error {
    /// A value cannot take part in a primary key (null or floating point).
    #[error("invalid key component: {0}")]
    InvalidKey(String),

    /// Encoding failed.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Decoding failed.
    #[error("decoding error: {0}")]
    Decoding(String),
}
