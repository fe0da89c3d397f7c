//! Named key templates understood by the key-management tool and the
//! database keyset layer.

use crate::error::KeysetError;
use crate::protocol::OutputPrefixType;

/// Type URL of AES-GCM-SIV keys (randomised AEAD).
pub const AES_GCM_SIV_TYPE_URL: &str = "sealfield.AesGcmSivKey";

/// Type URL of SIV keys (deterministic AEAD over AES-256-GCM-SIV + HMAC-SHA256).
pub const AES_SIV_TYPE_URL: &str = "sealfield.AesSivKey";

/// The primitive family a key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveFamily {
    /// Randomised authenticated encryption.
    Aead,
    /// Deterministic authenticated encryption.
    DeterministicAead,
}

impl PrimitiveFamily {
    /// Family of the given type URL, if known.
    pub fn of_type_url(type_url: &str) -> Option<Self> {
        match type_url {
            AES_GCM_SIV_TYPE_URL => Some(PrimitiveFamily::Aead),
            AES_SIV_TYPE_URL => Some(PrimitiveFamily::DeterministicAead),
            _ => None,
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            PrimitiveFamily::Aead => "AEAD",
            PrimitiveFamily::DeterministicAead => "deterministic AEAD",
        }
    }
}

/// Parameters for generating a new key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyTemplate {
    pub name: &'static str,
    pub type_url: &'static str,
    pub key_size: usize,
    pub output_prefix_type: OutputPrefixType,
    pub family: PrimitiveFamily,
}

const TEMPLATES: &[KeyTemplate] = &[
    KeyTemplate {
        name: "AES128_GCM_SIV",
        type_url: AES_GCM_SIV_TYPE_URL,
        key_size: 16,
        output_prefix_type: OutputPrefixType::Tink,
        family: PrimitiveFamily::Aead,
    },
    KeyTemplate {
        name: "AES256_GCM_SIV",
        type_url: AES_GCM_SIV_TYPE_URL,
        key_size: 32,
        output_prefix_type: OutputPrefixType::Tink,
        family: PrimitiveFamily::Aead,
    },
    KeyTemplate {
        name: "AES256_GCM_SIV_RAW",
        type_url: AES_GCM_SIV_TYPE_URL,
        key_size: 32,
        output_prefix_type: OutputPrefixType::Raw,
        family: PrimitiveFamily::Aead,
    },
    KeyTemplate {
        name: "AES256_SIV",
        type_url: AES_SIV_TYPE_URL,
        key_size: 64,
        output_prefix_type: OutputPrefixType::Tink,
        family: PrimitiveFamily::DeterministicAead,
    },
];

impl KeyTemplate {
    /// Look up a template by name.
    ///
    /// # Errors
    ///
    /// Returns [`KeysetError::ImproperlyConfigured`] for unknown names.
    pub fn from_name(name: &str) -> Result<Self, KeysetError> {
        TEMPLATES
            .iter()
            .find(|t| t.name == name)
            .copied()
            .ok_or_else(|| KeysetError::ImproperlyConfigured(format!("unknown key template `{name}`")))
    }

    /// Every known template, in display order.
    pub fn all() -> &'static [KeyTemplate] {
        TEMPLATES
    }

    pub fn family(&self) -> PrimitiveFamily {
        self.family
    }
}
