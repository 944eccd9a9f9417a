//! On-device encryption of typed records.
//!
//! Records are serialized to JSON and sealed with AES-256-GCM. Journal
//! entries use the journal key, every other class uses the master key. The
//! data class is bound as associated data, so a blob relabelled to another
//! class fails authentication instead of decrypting under the wrong schema.
//!
//! Blob layout: `nonce (12 bytes) || ciphertext || tag (16 bytes)`.

use super::keys::{KeySet, SymmetricKey};
use crate::records::{DataClass, Record, VaultRecord};
use crate::session::{KeysNotInitialized, SharedSession};
use crate::transparency::SharedTransparencyLog;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// An encrypted record plus the class needed to pick its key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalCiphertext {
    pub data_class: DataClass,
    #[serde(with = "super::base64_bytes")]
    pub blob: Vec<u8>,
}

/// Local encryption errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncryptError {
    /// Called before the session was unlocked
    KeysNotInitialized,
    /// The record could not be serialized
    Serialization(String),
    /// The cipher refused the input
    Cipher,
}

impl std::fmt::Display for EncryptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncryptError::KeysNotInitialized => write!(f, "{KeysNotInitialized}"),
            EncryptError::Serialization(e) => write!(f, "Record serialization failed: {e}"),
            EncryptError::Cipher => write!(f, "Encryption failed"),
        }
    }
}

impl std::error::Error for EncryptError {}

impl From<KeysNotInitialized> for EncryptError {
    fn from(_: KeysNotInitialized) -> Self {
        EncryptError::KeysNotInitialized
    }
}

/// Local decryption errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecryptError {
    /// Called before the session was unlocked
    KeysNotInitialized,
    /// Tampered ciphertext, or ciphertext sealed under a different key
    AuthenticationFailed,
    /// The ciphertext's class differs from the requested record type
    ClassMismatch {
        expected: DataClass,
        found: DataClass,
    },
    /// Authenticated plaintext did not match the record schema
    Malformed(String),
}

impl std::fmt::Display for DecryptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecryptError::KeysNotInitialized => write!(f, "{KeysNotInitialized}"),
            DecryptError::AuthenticationFailed => {
                write!(f, "Ciphertext failed authentication")
            }
            DecryptError::ClassMismatch { expected, found } => {
                write!(f, "Expected a {expected} record, found {found}")
            }
            DecryptError::Malformed(e) => write!(f, "Decrypted record is malformed: {e}"),
        }
    }
}

impl std::error::Error for DecryptError {}

impl From<KeysNotInitialized> for DecryptError {
    fn from(_: KeysNotInitialized) -> Self {
        DecryptError::KeysNotInitialized
    }
}

/// Key used for a data class.
fn key_for(keys: &KeySet, class: DataClass) -> &SymmetricKey {
    match class {
        DataClass::Journal => keys.journal(),
        DataClass::CheckIn | DataClass::Settings => keys.master(),
    }
}

/// Encrypt raw plaintext under the key for `class`.
pub fn encrypt_bytes(
    keys: &KeySet,
    class: DataClass,
    plaintext: &[u8],
) -> Result<LocalCiphertext, EncryptError> {
    let cipher = Aes256Gcm::new(key_for(keys, class).as_bytes().into());
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let sealed = cipher
        .encrypt(
            &nonce,
            Payload {
                msg: plaintext,
                aad: class.as_str().as_bytes(),
            },
        )
        .map_err(|_| EncryptError::Cipher)?;

    let mut blob = Vec::with_capacity(NONCE_LEN + sealed.len());
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&sealed);

    Ok(LocalCiphertext {
        data_class: class,
        blob,
    })
}

/// Decrypt a ciphertext with the key its class selects.
pub fn decrypt_bytes(
    keys: &KeySet,
    ciphertext: &LocalCiphertext,
) -> Result<Zeroizing<Vec<u8>>, DecryptError> {
    open_with_key(
        key_for(keys, ciphertext.data_class),
        ciphertext.data_class,
        &ciphertext.blob,
    )
}

fn open_with_key(
    key: &SymmetricKey,
    class: DataClass,
    blob: &[u8],
) -> Result<Zeroizing<Vec<u8>>, DecryptError> {
    if blob.len() < NONCE_LEN + TAG_LEN {
        return Err(DecryptError::AuthenticationFailed);
    }
    let (nonce, sealed) = blob.split_at(NONCE_LEN);

    let cipher = Aes256Gcm::new(key.as_bytes().into());
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: sealed,
                aad: class.as_str().as_bytes(),
            },
        )
        .map(Zeroizing::new)
        .map_err(|_| DecryptError::AuthenticationFailed)
}

/// Serialize and encrypt a typed record.
pub fn encrypt_record<R: Record>(keys: &KeySet, record: &R) -> Result<LocalCiphertext, EncryptError> {
    let plaintext = Zeroizing::new(
        serde_json::to_vec(record).map_err(|e| EncryptError::Serialization(e.to_string()))?,
    );
    encrypt_bytes(keys, R::CLASS, &plaintext)
}

/// Decrypt and parse a typed record.
pub fn decrypt_record<R: Record>(
    keys: &KeySet,
    ciphertext: &LocalCiphertext,
) -> Result<R, DecryptError> {
    if ciphertext.data_class != R::CLASS {
        return Err(DecryptError::ClassMismatch {
            expected: R::CLASS,
            found: ciphertext.data_class,
        });
    }
    let plaintext = decrypt_bytes(keys, ciphertext)?;
    serde_json::from_slice(&plaintext).map_err(|e| DecryptError::Malformed(e.to_string()))
}

/// Decrypt any record, using its class tag to pick the schema.
pub fn decrypt_any(keys: &KeySet, ciphertext: &LocalCiphertext) -> Result<VaultRecord, DecryptError> {
    let plaintext = decrypt_bytes(keys, ciphertext)?;
    VaultRecord::from_plaintext(ciphertext.data_class, &plaintext)
        .map_err(|e| DecryptError::Malformed(e.to_string()))
}

/// Session-bound vault: encrypts and decrypts with the session's current keys.
#[derive(Debug, Clone)]
pub struct LocalVault {
    session: SharedSession,
    log: SharedTransparencyLog,
}

impl LocalVault {
    pub fn new(session: SharedSession, log: SharedTransparencyLog) -> Self {
        Self { session, log }
    }

    pub fn encrypt<R: Record>(&self, record: &R) -> Result<LocalCiphertext, EncryptError> {
        let ciphertext = self.session.with_keys(|keys| encrypt_record(keys, record))??;
        self.log.record_encrypted();
        Ok(ciphertext)
    }

    pub fn decrypt<R: Record>(&self, ciphertext: &LocalCiphertext) -> Result<R, DecryptError> {
        let result = self
            .session
            .with_keys(|keys| decrypt_record::<R>(keys, ciphertext))?;
        self.note_decrypt(ciphertext.data_class, &result);
        result
    }

    pub fn decrypt_any(&self, ciphertext: &LocalCiphertext) -> Result<VaultRecord, DecryptError> {
        let result = self
            .session
            .with_keys(|keys| decrypt_any(keys, ciphertext))?;
        self.note_decrypt(ciphertext.data_class, &result);
        result
    }

    fn note_decrypt<T>(&self, class: DataClass, result: &Result<T, DecryptError>) {
        match result {
            Ok(_) => self.log.record_decrypted(),
            Err(DecryptError::AuthenticationFailed) => {
                self.log.record_rejected();
                tracing::warn!(data_class = %class, "Local ciphertext failed authentication");
            }
            Err(e) => tracing::warn!(data_class = %class, error = %e, "Local decrypt failed"),
        }
    }
}
