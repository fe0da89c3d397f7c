//! `fields`: transparent field-level encryption for stored model fields.
//!
//! Layers, bottom-up:
//! 1. [`crypto`]: per-key AES-GCM-SIV ciphers and the [`Aead`] /
//!    [`DeterministicAead`] traits.
//! 2. [`keyset`]: keysets with a primary key, key prefixes and rotation.
//! 3. [`store`]: keysets kept as records in a keyset store.
//! 4. [`config`] and [`manager`]: named keysets, loaded once and cached.
//! 5. [`field`]: the encrypted fields a storage layer calls into.

pub mod config;
pub mod crypto;
pub mod field;
pub mod keyset;
pub mod manager;
pub mod store;

pub use common::{KeyTemplate, KeysetError};
pub use config::{FieldsConfig, KeysetConfig, StoreConfig, DEFAULT_KEYSET};
pub use crypto::{Aead, DeterministicAead};
pub use field::{
    AadCallback, Condition, DeterministicEncryptedCharField, DeterministicEncryptedEmailField,
    DeterministicEncryptedField, DeterministicEncryptedIntegerField, DeterministicEncryptedTextField,
    DeterministicEncryptedUuidField, EncryptedBigIntegerField, EncryptedBinaryField,
    EncryptedBooleanField, EncryptedCharField, EncryptedDateField, EncryptedDateTimeField,
    EncryptedEmailField, EncryptedField, EncryptedFloatField, EncryptedIntegerField,
    EncryptedJsonField, EncryptedTextField, EncryptedUrlField, EncryptedUuidField, FieldError,
    FieldKind, FieldMeta, FieldOptions, Lookup,
};
pub use keyset::{KeysetAead, KeysetDeterministicAead, KeysetHandle};
pub use manager::KeysetManager;
pub use store::{DatabaseKeyset, JsonFileKeysetStore, KeysetStore, MemoryKeysetStore};
