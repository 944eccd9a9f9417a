//! Cryptography for the Synheart Privacy Engine.
//!
//! This module contains:
//! - Key derivation for an unlocked session
//! - Local vault encryption, keyed by data class
//! - Authenticated cloud sync envelopes

pub mod envelope;
pub mod keys;
pub mod vault;

// Re-export commonly used types
pub use envelope::{CloudEnvelope, IntegrityError, SealError, SyncCodec, IV_LEN};
pub use keys::{InitError, KeyManager, KeySet, KEY_LEN};
pub use vault::{DecryptError, EncryptError, LocalCiphertext, LocalVault};

/// Serde support for byte blobs as base64 strings.
pub(crate) mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
