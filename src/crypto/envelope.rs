//! Authenticated envelopes for cloud sync.
//!
//! ```text
//! iv         = 16 random bytes, fresh per seal
//! ciphertext = AES-256-GCM(cloud_key, iv, json(record))
//! mac_key    = HKDF-SHA256(cloud_key, info = "synheart/cloud-envelope/mac/v1")
//! auth_tag   = HMAC-SHA256(mac_key, ciphertext || iv)
//! ```
//!
//! `open` verifies `auth_tag` in constant time before the cipher is touched.
//! The remote store only ever sees the three base64 strings.

use super::keys::{KeySet, KEY_LEN};
use crate::session::{KeysNotInitialized, SharedSession};
use crate::transparency::SharedTransparencyLog;
use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroizing;

/// IV length in bytes (128 bits).
pub const IV_LEN: usize = 16;

const MAC_INFO: &[u8] = b"synheart/cloud-envelope/mac/v1";

/// AES-256-GCM with a 128-bit nonce.
type CloudCipher = AesGcm<Aes256, U16>;
type HmacSha256 = Hmac<Sha256>;

/// What the cloud stores: enough to verify and decrypt with the cloud key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudEnvelope {
    pub ciphertext: String,
    pub iv: String,
    pub auth_tag: String,
}

/// Errors while sealing an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SealError {
    KeysNotInitialized,
    Serialization(String),
    Cipher,
}

impl std::fmt::Display for SealError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SealError::KeysNotInitialized => write!(f, "{KeysNotInitialized}"),
            SealError::Serialization(e) => write!(f, "Record serialization failed: {e}"),
            SealError::Cipher => write!(f, "Envelope encryption failed"),
        }
    }
}

impl std::error::Error for SealError {}

impl From<KeysNotInitialized> for SealError {
    fn from(_: KeysNotInitialized) -> Self {
        SealError::KeysNotInitialized
    }
}

/// Errors while opening an envelope. All of them fail closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityError {
    /// Called before the session was unlocked
    KeysNotInitialized,
    /// A field is not valid base64, or the IV has the wrong length
    Malformed(String),
    /// The authentication tag does not match `(ciphertext, iv)`
    TagMismatch,
    /// Decryption failed after the tag verified; indicates an internal bug
    InvariantViolation,
}

impl std::fmt::Display for IntegrityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IntegrityError::KeysNotInitialized => write!(f, "{KeysNotInitialized}"),
            IntegrityError::Malformed(e) => write!(f, "Malformed envelope: {e}"),
            IntegrityError::TagMismatch => write!(f, "Envelope authentication tag mismatch"),
            IntegrityError::InvariantViolation => {
                write!(f, "Envelope decryption failed after tag verification")
            }
        }
    }
}

impl std::error::Error for IntegrityError {}

impl From<KeysNotInitialized> for IntegrityError {
    fn from(_: KeysNotInitialized) -> Self {
        IntegrityError::KeysNotInitialized
    }
}

/// HKDF subkey for envelope tags. `None` if the expansion is rejected.
fn mac_key(keys: &KeySet) -> Option<Zeroizing<[u8; KEY_LEN]>> {
    let hk = Hkdf::<Sha256>::new(None, keys.cloud().as_bytes());
    let mut okm = Zeroizing::new([0u8; KEY_LEN]);
    hk.expand(MAC_INFO, &mut okm[..]).ok()?;
    Some(okm)
}

/// HMAC over `ciphertext || iv`. `None` if no MAC key could be derived.
fn tag_mac(keys: &KeySet, ciphertext: &[u8], iv: &[u8]) -> Option<HmacSha256> {
    let key = mac_key(keys)?;
    let mut mac = <HmacSha256 as Mac>::new_from_slice(&key[..]).ok()?;
    mac.update(ciphertext);
    mac.update(iv);
    Some(mac)
}

/// Seal a record with the session's cloud key.
pub fn seal_with<R: Serialize>(keys: &KeySet, record: &R) -> Result<CloudEnvelope, SealError> {
    let plaintext = Zeroizing::new(
        serde_json::to_vec(record).map_err(|e| SealError::Serialization(e.to_string()))?,
    );

    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);

    let cipher = CloudCipher::new(keys.cloud().as_bytes().into());
    let ciphertext = cipher
        .encrypt(Nonce::<U16>::from_slice(&iv), plaintext.as_slice())
        .map_err(|_| SealError::Cipher)?;

    let tag = tag_mac(keys, &ciphertext, &iv)
        .ok_or(SealError::Cipher)?
        .finalize()
        .into_bytes();

    Ok(CloudEnvelope {
        ciphertext: STANDARD.encode(&ciphertext),
        iv: STANDARD.encode(iv),
        auth_tag: STANDARD.encode(tag),
    })
}

/// Verify and open an envelope with the session's cloud key.
pub fn open_with<R: DeserializeOwned>(
    keys: &KeySet,
    envelope: &CloudEnvelope,
) -> Result<R, IntegrityError> {
    let decode = |field: &str, value: &str| {
        STANDARD
            .decode(value)
            .map_err(|e| IntegrityError::Malformed(format!("{field}: {e}")))
    };
    let ciphertext = decode("ciphertext", &envelope.ciphertext)?;
    let iv = decode("iv", &envelope.iv)?;
    let tag = decode("authTag", &envelope.auth_tag)?;

    tag_mac(keys, &ciphertext, &iv)
        .ok_or(IntegrityError::InvariantViolation)?
        .verify_slice(&tag)
        .map_err(|_| IntegrityError::TagMismatch)?;

    if iv.len() != IV_LEN {
        return Err(IntegrityError::Malformed(format!(
            "iv must be {IV_LEN} bytes, got {}",
            iv.len()
        )));
    }

    let cipher = CloudCipher::new(keys.cloud().as_bytes().into());
    let plaintext = cipher
        .decrypt(Nonce::<U16>::from_slice(&iv), ciphertext.as_slice())
        .map(Zeroizing::new)
        .map_err(|_| {
            tracing::error!("Envelope passed tag check but failed decryption");
            IntegrityError::InvariantViolation
        })?;

    serde_json::from_slice(&plaintext).map_err(|e| IntegrityError::Malformed(e.to_string()))
}

/// Session-bound sync codec.
#[derive(Debug, Clone)]
pub struct SyncCodec {
    session: SharedSession,
    log: SharedTransparencyLog,
}

impl SyncCodec {
    pub fn new(session: SharedSession, log: SharedTransparencyLog) -> Self {
        Self { session, log }
    }

    pub fn seal<R: Serialize>(&self, record: &R) -> Result<CloudEnvelope, SealError> {
        let envelope = self.session.with_keys(|keys| seal_with(keys, record))??;
        self.log.record_sealed();
        Ok(envelope)
    }

    pub fn open<R: DeserializeOwned>(&self, envelope: &CloudEnvelope) -> Result<R, IntegrityError> {
        let result = self
            .session
            .with_keys(|keys| open_with::<R>(keys, envelope))?;
        if let Err(ref e) = result {
            self.log.record_rejected();
            tracing::warn!(error = %e, "Rejected cloud envelope");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::tests::test_manager;
    use crate::records::JournalEntry;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn keys() -> KeySet {
        test_manager().initialize("p@ss1234", "acct-1").unwrap()
    }

    fn flip_bit(encoded: &str, bit: usize) -> String {
        let mut bytes = STANDARD.decode(encoded).unwrap();
        let bit = bit % (bytes.len() * 8);
        bytes[bit / 8] ^= 1 << (bit % 8);
        STANDARD.encode(bytes)
    }

    #[test]
    fn test_seal_open_round_trip() {
        let keys = keys();
        let record = JournalEntry::new("today was good");

        let envelope = seal_with(&keys, &record).unwrap();
        let opened: JournalEntry = open_with(&keys, &envelope).unwrap();
        assert_eq!(opened, record);
    }

    #[test]
    fn test_mac_key_is_derived_not_reused() {
        let keys = keys();
        let mac = mac_key(&keys).unwrap();
        assert_ne!(&mac[..], &keys.cloud().as_bytes()[..]);
        assert!(mac.iter().any(|b| *b != 0));
        assert_eq!(&mac[..], &mac_key(&keys).unwrap()[..]);
    }

    #[test]
    fn test_envelope_fields_are_camel_case() {
        let envelope = seal_with(&keys(), &JournalEntry::new("x")).unwrap();
        let json = serde_json::to_value(&envelope).unwrap();

        assert!(json.get("authTag").is_some());
        assert!(json.get("iv").is_some());
        assert!(json.get("ciphertext").is_some());
        assert_eq!(STANDARD.decode(&envelope.iv).unwrap().len(), IV_LEN);
    }

    #[test]
    fn test_wrong_cloud_key_is_tag_mismatch() {
        let manager = test_manager();
        let ours = manager.initialize("p@ss1234", "acct-1").unwrap();
        let rotated = manager.initialize_at("p@ss1234", "acct-1", 1).unwrap();

        let envelope = seal_with(&ours, &JournalEntry::new("x")).unwrap();
        assert_eq!(
            open_with::<JournalEntry>(&rotated, &envelope).unwrap_err(),
            IntegrityError::TagMismatch
        );
    }

    #[test]
    fn test_forged_tag_is_rejected() {
        let keys = keys();
        let mut envelope = seal_with(&keys, &JournalEntry::new("x")).unwrap();
        envelope.auth_tag = STANDARD.encode([0u8; 32]);

        assert_eq!(
            open_with::<JournalEntry>(&keys, &envelope).unwrap_err(),
            IntegrityError::TagMismatch
        );
    }

    #[test]
    fn test_invalid_base64_is_malformed() {
        let keys = keys();
        let mut envelope = seal_with(&keys, &JournalEntry::new("x")).unwrap();
        envelope.iv = "not base64!".to_string();

        assert!(matches!(
            open_with::<JournalEntry>(&keys, &envelope),
            Err(IntegrityError::Malformed(_))
        ));
    }

    #[test]
    fn test_iv_unique_across_many_seals() {
        let keys = keys();
        let record = JournalEntry::new("same");
        let mut seen = HashSet::new();

        for _ in 0..10_000 {
            let envelope = seal_with(&keys, &record).unwrap();
            assert!(seen.insert(envelope.iv), "IV repeated");
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_single_bit_flip_in_ciphertext_is_rejected(text in ".{0,64}", bit in any::<usize>()) {
            let keys = keys();
            let mut envelope = seal_with(&keys, &JournalEntry::new(text)).unwrap();
            envelope.ciphertext = flip_bit(&envelope.ciphertext, bit);

            prop_assert_eq!(
                open_with::<JournalEntry>(&keys, &envelope).unwrap_err(),
                IntegrityError::TagMismatch
            );
        }

        #[test]
        fn prop_single_bit_flip_in_iv_is_rejected(bit in any::<usize>()) {
            let keys = keys();
            let mut envelope = seal_with(&keys, &JournalEntry::new("today was good")).unwrap();
            envelope.iv = flip_bit(&envelope.iv, bit);

            prop_assert_eq!(
                open_with::<JournalEntry>(&keys, &envelope).unwrap_err(),
                IntegrityError::TagMismatch
            );
        }
    }
}
