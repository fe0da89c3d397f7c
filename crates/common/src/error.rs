//! Common error types shared across crates.

use thiserror::Error;

/// Top-level keyset error type.
///
/// Every failure raised while loading keysets or running a primitive ends up
/// here; callers are expected to propagate it unchanged.
#[derive(Debug, Error)]
pub enum KeysetError {
    /// Configuration is missing, inconsistent, or names an unknown keyset.
    #[error("{0}")]
    ImproperlyConfigured(String),

    /// Keyset material could not be parsed or is internally inconsistent.
    #[error("malformed keyset: {0}")]
    Malformed(String),

    /// The keyset holds keys of a different primitive family than requested.
    #[error("keyset of type `{type_url}` does not support {expected}")]
    UnsupportedPrimitive {
        /// Human-readable name of the requested primitive.
        expected: &'static str,
        /// Type URL of the offending key.
        type_url: String,
    },

    /// Encryption or decryption failed, including authentication failures.
    #[error("crypto failure: {0}")]
    Crypto(String),

    /// A keyset or key record does not exist in the backing store.
    #[error("{0}")]
    NotFound(String),

    /// Reading or writing keyset material failed.
    #[error("io error: {0}")]
    Io(String),
}

impl KeysetError {
    /// Short machine-readable code for the error variant.
    pub fn code(&self) -> &'static str {
        match self {
            KeysetError::ImproperlyConfigured(_) => "improperly_configured",
            KeysetError::Malformed(_) => "malformed_keyset",
            KeysetError::UnsupportedPrimitive { .. } => "unsupported_primitive",
            KeysetError::Crypto(_) => "crypto_failure",
            KeysetError::NotFound(_) => "not_found",
            KeysetError::Io(_) => "io_error",
        }
    }
}

impl From<std::io::Error> for KeysetError {
    fn from(e: std::io::Error) -> Self {
        KeysetError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for KeysetError {
    fn from(e: serde_json::Error) -> Self {
        KeysetError::Malformed(e.to_string())
    }
}
