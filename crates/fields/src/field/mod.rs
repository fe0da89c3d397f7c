//! Encrypted model fields.
//!
//! A field sits between a model attribute and its database column:
//!
//! ```text
//! value ── FieldKind::to_bytes ── encrypt(aad) ──► column (BinaryField)
//! value ◄─ FieldKind::from_bytes ◄─ decrypt(aad) ── column
//! ```
//!
//! [`EncryptedField`] uses randomised AEAD and supports only `isnull` lookups.
//! [`DeterministicEncryptedField`] produces equal ciphertext for equal values
//! and so also supports `exact` and `in`.

pub mod kinds;
pub mod lookup;

pub use kinds::FieldKind;
pub use lookup::{Condition, Lookup};

use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, OnceLock};

use common::KeysetError;
use thiserror::Error;
use tracing::trace;

use crate::config::DEFAULT_KEYSET;
use crate::crypto::{Aead, DeterministicAead};
use crate::keyset::{KeysetAead, KeysetDeterministicAead};
use crate::manager::KeysetManager;

/// Errors raised by encrypted fields.
#[derive(Debug, Error)]
pub enum FieldError {
    /// Field options or keyset configuration are invalid.
    #[error("{0}")]
    ImproperlyConfigured(String),

    /// Loading the keyset or encrypting / decrypting failed.
    #[error(transparent)]
    Keyset(KeysetError),

    #[error("{0}")]
    UnsupportedLookup(String),

    /// The value does not pass the field's validators.
    #[error("{0}")]
    Validation(String),

    /// Decrypted bytes do not convert back to the field's value type.
    #[error("{0}")]
    Decode(String),

    /// `None` written to a non-null field.
    #[error("{0}")]
    NullValue(String),
}

impl From<KeysetError> for FieldError {
    fn from(e: KeysetError) -> Self {
        match e {
            KeysetError::ImproperlyConfigured(msg) => FieldError::ImproperlyConfigured(msg),
            other => FieldError::Keyset(other),
        }
    }
}

/// Computes the associated data bound to every ciphertext of a field.
pub type AadCallback = Arc<dyn Fn(&FieldMeta) -> Vec<u8> + Send + Sync>;

/// Identity of a field, handed to the AAD callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMeta {
    pub model: String,
    pub name: String,
    /// Class-style type name, e.g. `EncryptedCharField`.
    pub field_type: String,
}

/// Per-field options.
#[derive(Clone)]
pub struct FieldOptions {
    pub keyset: String,
    pub aad_callback: Option<AadCallback>,
    pub null: bool,
    pub max_length: Option<usize>,
    pub primary_key: bool,
    pub db_index: bool,
    pub unique: bool,
}

impl Default for FieldOptions {
    fn default() -> Self {
        Self {
            keyset: DEFAULT_KEYSET.to_owned(),
            aad_callback: None,
            null: false,
            max_length: None,
            primary_key: false,
            db_index: false,
            unique: false,
        }
    }
}

impl fmt::Debug for FieldOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldOptions")
            .field("keyset", &self.keyset)
            .field("aad_callback", &self.aad_callback.as_ref().map(|_| "<fn>"))
            .field("null", &self.null)
            .field("max_length", &self.max_length)
            .field("primary_key", &self.primary_key)
            .field("db_index", &self.db_index)
            .field("unique", &self.unique)
            .finish()
    }
}

impl FieldOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keyset(mut self, keyset: impl Into<String>) -> Self {
        self.keyset = keyset.into();
        self
    }

    pub fn aad_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&FieldMeta) -> Vec<u8> + Send + Sync + 'static,
    {
        self.aad_callback = Some(Arc::new(callback));
        self
    }

    pub fn null(mut self, null: bool) -> Self {
        self.null = null;
        self
    }

    pub fn max_length(mut self, max_length: usize) -> Self {
        self.max_length = Some(max_length);
        self
    }

    pub fn primary_key(mut self, primary_key: bool) -> Self {
        self.primary_key = primary_key;
        self
    }

    pub fn db_index(mut self, db_index: bool) -> Self {
        self.db_index = db_index;
        self
    }

    pub fn unique(mut self, unique: bool) -> Self {
        self.unique = unique;
        self
    }

    fn set_properties(&self) -> impl Iterator<Item = &'static str> + '_ {
        [
            ("primary_key", self.primary_key),
            ("db_index", self.db_index),
            ("unique", self.unique),
        ]
        .into_iter()
        .filter_map(|(name, set)| set.then_some(name))
    }
}

/// State shared by both field flavours.
#[derive(Debug)]
struct FieldCore {
    manager: KeysetManager,
    meta: FieldMeta,
    options: FieldOptions,
}

impl FieldCore {
    fn new<K: FieldKind>(
        manager: &KeysetManager,
        model: &str,
        name: &str,
        mut options: FieldOptions,
        type_prefix: &str,
        unsupported: &[&str],
    ) -> Result<Self, FieldError> {
        let field_type = format!("{type_prefix}{}", K::NAME);

        if let Some(prop) = options.set_properties().find(|p| unsupported.contains(p)) {
            return Err(FieldError::ImproperlyConfigured(format!(
                "Field `{field_type}` does not support property `{prop}`"
            )));
        }

        manager.config().keyset(&options.keyset)?;

        if options.max_length.is_none() {
            options.max_length = K::default_max_length();
        }
        K::check_options(&options)?;

        Ok(Self {
            manager: manager.clone(),
            meta: FieldMeta {
                model: model.to_owned(),
                name: name.to_owned(),
                field_type,
            },
            options,
        })
    }

    fn aad(&self) -> Vec<u8> {
        self.options
            .aad_callback
            .as_ref()
            .map(|cb| cb(&self.meta))
            .unwrap_or_default()
    }

    fn null_check(&self) -> Result<Option<Vec<u8>>, FieldError> {
        if self.options.null {
            Ok(None)
        } else {
            Err(FieldError::NullValue(format!(
                "NOT NULL constraint failed: {}.{}",
                self.meta.model, self.meta.name
            )))
        }
    }

    fn unsupported_lookup(&self, lookup: &str) -> FieldError {
        FieldError::UnsupportedLookup(format!(
            "{} `{lookup}` does not support lookups",
            self.meta.field_type
        ))
    }
}

/// A field encrypted with randomised AEAD.
pub struct EncryptedField<K: FieldKind> {
    core: FieldCore,
    primitive: OnceLock<Arc<KeysetAead>>,
    _kind: PhantomData<fn() -> K>,
}

impl<K: FieldKind> fmt::Debug for EncryptedField<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptedField")
            .field("meta", &self.core.meta)
            .field("options", &self.core.options)
            .finish_non_exhaustive()
    }
}

impl<K: FieldKind> EncryptedField<K> {
    const UNSUPPORTED: &'static [&'static str] = &["primary_key", "db_index", "unique"];

    /// Declare a field on `model`.
    ///
    /// # Errors
    ///
    /// Returns [`FieldError::ImproperlyConfigured`] if an unsupported property
    /// is set, the keyset is not configured, or the kind rejects the options.
    pub fn new(
        manager: &KeysetManager,
        model: &str,
        name: &str,
        options: FieldOptions,
    ) -> Result<Self, FieldError> {
        Ok(Self {
            core: FieldCore::new::<K>(manager, model, name, options, "Encrypted", Self::UNSUPPORTED)?,
            primitive: OnceLock::new(),
            _kind: PhantomData,
        })
    }

    pub fn meta(&self) -> &FieldMeta {
        &self.core.meta
    }

    pub fn options(&self) -> &FieldOptions {
        &self.core.options
    }

    /// Column type in the database.
    pub fn internal_type(&self) -> &'static str {
        "BinaryField"
    }

    /// Native value type of the field.
    pub fn value_type(&self) -> &'static str {
        K::VALUE_TYPE
    }

    pub fn validate(&self, value: &K::Value) -> Result<(), FieldError> {
        K::validate(value, &self.core.options)
    }

    /// Encrypt a value for storage.
    pub fn get_db_prep_save(&self, value: Option<&K::Value>) -> Result<Option<Vec<u8>>, FieldError> {
        let Some(value) = value else {
            return self.core.null_check();
        };
        let plaintext = K::to_bytes(value)?;
        let ciphertext = self.primitive()?.encrypt(&plaintext, &self.core.aad())?;
        trace!(field = %self.core.meta.name, len = ciphertext.len(), "value encrypted");
        Ok(Some(ciphertext))
    }

    /// Decrypt a stored value.
    pub fn from_db_value(&self, stored: Option<&[u8]>) -> Result<Option<K::Value>, FieldError> {
        let Some(stored) = stored else {
            return Ok(None);
        };
        let plaintext = self.primitive()?.decrypt(stored, &self.core.aad())?;
        K::from_bytes(&plaintext).map(Some)
    }

    /// Only `isnull` can be evaluated on randomised ciphertext.
    pub fn lookup(&self, lookup: Lookup<K::Value>) -> Result<Condition, FieldError> {
        match lookup {
            Lookup::IsNull(is_null) => Ok(Condition::IsNull(is_null)),
            other => Err(self.core.unsupported_lookup(other.name())),
        }
    }

    fn primitive(&self) -> Result<Arc<KeysetAead>, FieldError> {
        if let Some(p) = self.primitive.get() {
            return Ok(p.clone());
        }
        let loaded = self.core.manager.aead(&self.core.options.keyset)?;
        Ok(self.primitive.get_or_init(|| loaded).clone())
    }
}

/// A field encrypted with deterministic AEAD, searchable by equality.
pub struct DeterministicEncryptedField<K: FieldKind> {
    core: FieldCore,
    primitive: OnceLock<Arc<KeysetDeterministicAead>>,
    _kind: PhantomData<fn() -> K>,
}

impl<K: FieldKind> fmt::Debug for DeterministicEncryptedField<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeterministicEncryptedField")
            .field("meta", &self.core.meta)
            .field("options", &self.core.options)
            .finish_non_exhaustive()
    }
}

impl<K: FieldKind> DeterministicEncryptedField<K> {
    const UNSUPPORTED: &'static [&'static str] = &["primary_key"];

    /// Declare a field on `model`. `unique` and `db_index` are allowed.
    pub fn new(
        manager: &KeysetManager,
        model: &str,
        name: &str,
        options: FieldOptions,
    ) -> Result<Self, FieldError> {
        Ok(Self {
            core: FieldCore::new::<K>(
                manager,
                model,
                name,
                options,
                "DeterministicEncrypted",
                Self::UNSUPPORTED,
            )?,
            primitive: OnceLock::new(),
            _kind: PhantomData,
        })
    }

    pub fn meta(&self) -> &FieldMeta {
        &self.core.meta
    }

    pub fn options(&self) -> &FieldOptions {
        &self.core.options
    }

    pub fn internal_type(&self) -> &'static str {
        "BinaryField"
    }

    pub fn value_type(&self) -> &'static str {
        K::VALUE_TYPE
    }

    pub fn validate(&self, value: &K::Value) -> Result<(), FieldError> {
        K::validate(value, &self.core.options)
    }

    pub fn get_db_prep_save(&self, value: Option<&K::Value>) -> Result<Option<Vec<u8>>, FieldError> {
        let Some(value) = value else {
            return self.core.null_check();
        };
        let plaintext = K::to_bytes(value)?;
        Ok(Some(
            self.primitive()?
                .encrypt_deterministically(&plaintext, &self.core.aad())?,
        ))
    }

    pub fn from_db_value(&self, stored: Option<&[u8]>) -> Result<Option<K::Value>, FieldError> {
        let Some(stored) = stored else {
            return Ok(None);
        };
        let plaintext = self
            .primitive()?
            .decrypt_deterministically(stored, &self.core.aad())?;
        K::from_bytes(&plaintext).map(Some)
    }

    /// Ciphertexts of `value` under every enabled key.
    ///
    /// Rows written before a key rotation carry the old key's ciphertext, so an
    /// equality match has to consider all of them.
    pub fn exact_lookup_values(&self, value: &K::Value) -> Result<Vec<Vec<u8>>, FieldError> {
        let plaintext = K::to_bytes(value)?;
        Ok(self
            .primitive()?
            .encrypt_with_all_keys(&plaintext, &self.core.aad())?)
    }

    /// Supports `exact`, `in` and `isnull`.
    pub fn lookup(&self, lookup: Lookup<K::Value>) -> Result<Condition, FieldError> {
        match lookup {
            Lookup::IsNull(is_null) => Ok(Condition::IsNull(is_null)),
            Lookup::Exact(value) => Ok(Condition::In(self.exact_lookup_values(&value)?)),
            Lookup::In(values) => {
                let mut candidates: Vec<Vec<u8>> = Vec::new();
                for value in &values {
                    for ct in self.exact_lookup_values(value)? {
                        if !candidates.contains(&ct) {
                            candidates.push(ct);
                        }
                    }
                }
                Ok(Condition::In(candidates))
            }
            other => Err(self.core.unsupported_lookup(other.name())),
        }
    }

    fn primitive(&self) -> Result<Arc<KeysetDeterministicAead>, FieldError> {
        if let Some(p) = self.primitive.get() {
            return Ok(p.clone());
        }
        let loaded = self
            .core
            .manager
            .deterministic_aead(&self.core.options.keyset)?;
        Ok(self.primitive.get_or_init(|| loaded).clone())
    }
}

pub type EncryptedTextField = EncryptedField<kinds::Text>;
pub type EncryptedCharField = EncryptedField<kinds::Char>;
pub type EncryptedEmailField = EncryptedField<kinds::Email>;
pub type EncryptedUrlField = EncryptedField<kinds::Url>;
pub type EncryptedIntegerField = EncryptedField<kinds::Integer>;
pub type EncryptedBigIntegerField = EncryptedField<kinds::BigInteger>;
pub type EncryptedBooleanField = EncryptedField<kinds::Boolean>;
pub type EncryptedFloatField = EncryptedField<kinds::Float>;
pub type EncryptedDateField = EncryptedField<kinds::Date>;
pub type EncryptedDateTimeField = EncryptedField<kinds::DateTime>;
pub type EncryptedUuidField = EncryptedField<kinds::Uuid>;
pub type EncryptedJsonField = EncryptedField<kinds::Json>;
pub type EncryptedBinaryField = EncryptedField<kinds::Binary>;

pub type DeterministicEncryptedTextField = DeterministicEncryptedField<kinds::Text>;
pub type DeterministicEncryptedCharField = DeterministicEncryptedField<kinds::Char>;
pub type DeterministicEncryptedEmailField = DeterministicEncryptedField<kinds::Email>;
pub type DeterministicEncryptedIntegerField = DeterministicEncryptedField<kinds::Integer>;
pub type DeterministicEncryptedUuidField = DeterministicEncryptedField<kinds::Uuid>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FieldsConfig, KeysetConfig};
    use crate::keyset::KeysetHandle;
    use common::KeyTemplate;

    struct Fixture {
        _dir: tempfile::TempDir,
        manager: KeysetManager,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut config = FieldsConfig::new();
        for (name, template) in [("default", "AES256_GCM_SIV"), ("deterministic", "AES256_SIV")] {
            let t = KeyTemplate::from_name(template).unwrap();
            let path = dir.path().join(format!("{name}.json"));
            std::fs::write(&path, KeysetHandle::generate(&t).write_cleartext().unwrap()).unwrap();
            config = config.with_keyset(name, KeysetConfig::cleartext_file(path));
        }
        Fixture {
            manager: KeysetManager::new(config),
            _dir: dir,
        }
    }

    fn daead_opts() -> FieldOptions {
        FieldOptions::new().keyset("deterministic")
    }

    #[test]
    fn rejects_unsupported_properties() {
        let f = fixture();
        for opts in [
            FieldOptions::new().primary_key(true),
            FieldOptions::new().db_index(true),
            FieldOptions::new().unique(true),
        ] {
            let err = EncryptedTextField::new(&f.manager, "Model", "value", opts).unwrap_err();
            assert!(
                err.to_string().starts_with("Field `EncryptedTextField` does not support property"),
                "{err}"
            );
        }
    }

    #[test]
    fn deterministic_allows_unique_and_index() {
        let f = fixture();
        let opts = daead_opts().unique(true).db_index(true);
        assert!(DeterministicEncryptedTextField::new(&f.manager, "Model", "value", opts).is_ok());
        let err = DeterministicEncryptedTextField::new(
            &f.manager,
            "Model",
            "value",
            daead_opts().primary_key(true),
        )
        .unwrap_err();
        assert!(matches!(err, FieldError::ImproperlyConfigured(_)));
    }

    #[test]
    fn unknown_keyset() {
        let f = fixture();
        let err = EncryptedTextField::new(&f.manager, "Model", "value", FieldOptions::new().keyset("nope"))
            .unwrap_err();
        assert_eq!(err.to_string(), "Could not find configuration for keyset `nope`");
    }

    #[test]
    fn field_type_names() {
        let f = fixture();
        let a = EncryptedCharField::new(&f.manager, "M", "c", FieldOptions::new().max_length(5)).unwrap();
        assert_eq!(a.meta().field_type, "EncryptedCharField");
        assert_eq!(a.internal_type(), "BinaryField");
        assert_eq!(a.value_type(), "String");
        let d = DeterministicEncryptedEmailField::new(&f.manager, "M", "e", daead_opts()).unwrap();
        assert_eq!(d.meta().field_type, "DeterministicEncryptedEmailField");
        assert_eq!(d.options().max_length, Some(254));
    }

    #[test]
    fn none_handling() {
        let f = fixture();
        let nullable =
            EncryptedTextField::new(&f.manager, "M", "t", FieldOptions::new().null(true)).unwrap();
        assert_eq!(nullable.get_db_prep_save(None).unwrap(), None);
        assert_eq!(nullable.from_db_value(None).unwrap(), None);

        let required = EncryptedTextField::new(&f.manager, "M", "t", FieldOptions::new()).unwrap();
        assert!(matches!(required.get_db_prep_save(None), Err(FieldError::NullValue(_))));
    }

    #[test]
    fn aad_callback_receives_meta() {
        let f = fixture();
        let opts = FieldOptions::new().aad_callback(|m: &FieldMeta| {
            format!("{}.{}", m.model, m.name).into_bytes()
        });
        let field = EncryptedTextField::new(&f.manager, "Customer", "notes", opts).unwrap();
        let ct = field.get_db_prep_save(Some(&"hi".to_string())).unwrap().unwrap();

        // Same keyset, different binding: the value does not decrypt.
        let other = EncryptedTextField::new(
            &f.manager,
            "Customer",
            "notes",
            FieldOptions::new().aad_callback(|_: &FieldMeta| b"elsewhere".to_vec()),
        )
        .unwrap();
        assert!(matches!(other.from_db_value(Some(ct.as_slice())), Err(FieldError::Keyset(KeysetError::Crypto(_)))));
        assert_eq!(field.from_db_value(Some(ct.as_slice())).unwrap().as_deref(), Some("hi"));
    }

    #[test]
    fn randomised_rejects_exact() {
        let f = fixture();
        let field = EncryptedTextField::new(&f.manager, "M", "value", FieldOptions::new()).unwrap();
        let err = field.lookup(Lookup::Exact("a".into())).unwrap_err();
        assert_eq!(err.to_string(), "EncryptedTextField `exact` does not support lookups");
        assert_eq!(field.lookup(Lookup::IsNull(true)).unwrap(), Condition::IsNull(true));
    }

    #[test]
    fn deterministic_lookups() {
        let f = fixture();
        let field = DeterministicEncryptedTextField::new(&f.manager, "M", "value", daead_opts()).unwrap();
        let stored = field.get_db_prep_save(Some(&"a".to_string())).unwrap().unwrap();

        let exact = field.lookup(Lookup::Exact("a".into())).unwrap();
        assert!(exact.matches(Some(stored.as_slice())));
        let any = field.lookup(Lookup::In(vec!["b".into(), "a".into(), "a".into()])).unwrap();
        match &any {
            Condition::In(c) => assert_eq!(c.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
        assert!(any.matches(Some(stored.as_slice())));

        let err = field.lookup(Lookup::Contains("a".into())).unwrap_err();
        assert_eq!(
            err.to_string(),
            "DeterministicEncryptedTextField `contains` does not support lookups"
        );
    }

    #[test]
    fn wrong_family_surfaces_on_use() {
        let f = fixture();
        let field = DeterministicEncryptedTextField::new(&f.manager, "M", "value", FieldOptions::new()).unwrap();
        assert!(matches!(
            field.get_db_prep_save(Some(&"x".to_string())),
            Err(FieldError::Keyset(KeysetError::UnsupportedPrimitive { .. }))
        ));
    }
}
