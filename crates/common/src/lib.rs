//! Keyset wire types, key templates, and errors shared across `sealfield` crates.

pub mod error;
pub mod protocol;
pub mod templates;

pub use error::KeysetError;
pub use protocol::{EncryptedKeyset, Key, KeyData, KeyStatus, Keyset, KeysetInfo, OutputPrefixType};
pub use templates::{KeyTemplate, PrimitiveFamily};
