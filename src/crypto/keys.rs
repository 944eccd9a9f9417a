//! Key derivation for an unlocked session.
//!
//! Three keys are derived from the user's secret with PBKDF2-HMAC-SHA256,
//! each under its own password/salt domain:
//!
//! ```text
//! master  = PBKDF2(secret,                          account_id)
//! journal = PBKDF2(secret || 0 || "journal-context", account_id)
//! cloud   = PBKDF2(secret || 0 || "cloud-context",   account_id || 0 || generation)
//! ```
//!
//! The cloud key carries a rotation generation so it can be replaced without
//! touching the keys that protect the local vault. No key can be computed
//! from another without the secret.

use crate::config::KdfConfig;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Length in bytes of every derived key (256 bits).
pub const KEY_LEN: usize = 32;

const JOURNAL_CONTEXT: &[u8] = b"journal-context";
const CLOUD_CONTEXT: &[u8] = b"cloud-context";

/// A single 256-bit symmetric key, zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; KEY_LEN]);

impl SymmetricKey {
    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SymmetricKey(<redacted>)")
    }
}

/// The three independent keys of one unlocked session.
///
/// Not `Clone`: the session owns exactly one copy, and dropping it wipes
/// the key bytes.
pub struct KeySet {
    master: SymmetricKey,
    journal: SymmetricKey,
    cloud: SymmetricKey,
    cloud_generation: u64,
}

impl KeySet {
    pub(crate) fn master(&self) -> &SymmetricKey {
        &self.master
    }

    pub(crate) fn journal(&self) -> &SymmetricKey {
        &self.journal
    }

    pub(crate) fn cloud(&self) -> &SymmetricKey {
        &self.cloud
    }

    /// Rotation generation the current cloud key was derived with.
    pub fn cloud_generation(&self) -> u64 {
        self.cloud_generation
    }
}

impl std::fmt::Debug for KeySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeySet")
            .field("cloud_generation", &self.cloud_generation)
            .finish_non_exhaustive()
    }
}

/// Key derivation errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitError {
    /// The secret was empty
    EmptySecret,
    /// Rotation was attempted with a secret that does not own this key set
    SecretMismatch,
}

impl std::fmt::Display for InitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InitError::EmptySecret => write!(f, "Secret must not be empty"),
            InitError::SecretMismatch => write!(f, "Secret does not match the unlocked session"),
        }
    }
}

impl std::error::Error for InitError {}

/// Derives session keys from a user secret.
#[derive(Debug, Clone)]
pub struct KeyManager {
    iterations: u32,
}

impl KeyManager {
    /// Create a key manager with the given KDF parameters.
    pub fn new(config: &KdfConfig) -> Self {
        if config.iterations < crate::config::DEFAULT_KDF_ITERATIONS {
            tracing::warn!(
                iterations = config.iterations,
                "KDF iteration count is below the production minimum"
            );
        }
        Self {
            iterations: config.iterations,
        }
    }

    /// Derive a fresh key set at cloud generation 0.
    pub fn initialize(&self, secret: &str, account_id: &str) -> Result<KeySet, InitError> {
        self.initialize_at(secret, account_id, 0)
    }

    /// Derive a key set whose cloud key uses the given rotation generation.
    pub fn initialize_at(
        &self,
        secret: &str,
        account_id: &str,
        cloud_generation: u64,
    ) -> Result<KeySet, InitError> {
        if secret.is_empty() {
            return Err(InitError::EmptySecret);
        }

        let keys = KeySet {
            master: self.derive(secret.as_bytes(), account_id.as_bytes()),
            journal: self.derive(&contextual(secret, JOURNAL_CONTEXT), account_id.as_bytes()),
            cloud: self.derive_cloud(secret, account_id, cloud_generation),
            cloud_generation,
        };

        tracing::debug!(cloud_generation, "Derived session key set");
        Ok(keys)
    }

    /// Replace only the cloud key, leaving the vault keys untouched.
    ///
    /// The secret is checked against the master key before anything changes.
    pub fn rotate_cloud_key(
        &self,
        keys: &mut KeySet,
        secret: &str,
        account_id: &str,
        new_generation: u64,
    ) -> Result<(), InitError> {
        if secret.is_empty() {
            return Err(InitError::EmptySecret);
        }

        let check = self.derive(secret.as_bytes(), account_id.as_bytes());
        if !bool::from(check.as_bytes().ct_eq(keys.master.as_bytes())) {
            return Err(InitError::SecretMismatch);
        }

        keys.cloud = self.derive_cloud(secret, account_id, new_generation);
        keys.cloud_generation = new_generation;

        tracing::info!(cloud_generation = new_generation, "Rotated cloud key");
        Ok(())
    }

    fn derive_cloud(&self, secret: &str, account_id: &str, generation: u64) -> SymmetricKey {
        let mut salt = Vec::with_capacity(account_id.len() + 9);
        salt.extend_from_slice(account_id.as_bytes());
        salt.push(0);
        salt.extend_from_slice(&generation.to_be_bytes());

        self.derive(&contextual(secret, CLOUD_CONTEXT), &salt)
    }

    fn derive(&self, password: &[u8], salt: &[u8]) -> SymmetricKey {
        let mut out = [0u8; KEY_LEN];
        pbkdf2::pbkdf2_hmac::<Sha256>(password, salt, self.iterations, &mut out);
        let key = SymmetricKey(out);
        out.zeroize();
        key
    }
}

/// `secret || 0x00 || context`, wiped when dropped.
fn contextual(secret: &str, context: &[u8]) -> Zeroizing<Vec<u8>> {
    let mut buf = Zeroizing::new(Vec::with_capacity(secret.len() + 1 + context.len()));
    buf.extend_from_slice(secret.as_bytes());
    buf.push(0);
    buf.extend_from_slice(context);
    buf
}
