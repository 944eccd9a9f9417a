//! The unlocked-session object.
//!
//! A [`Session`] owns the only copy of the account's [`KeySet`]. Readers
//! (encrypt, decrypt, seal, open) share the lock; unlock, lock and rotation
//! take it exclusively.

use crate::config::KdfConfig;
use crate::crypto::{InitError, KeyManager, KeySet};
use parking_lot::RwLock;
use std::sync::Arc;

/// Returned when key material is needed but the session is locked.
///
/// This signals a sequencing bug in the host application, not a user error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeysNotInitialized;

impl std::fmt::Display for KeysNotInitialized {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Session keys are not initialized (session is locked)")
    }
}

impl std::error::Error for KeysNotInitialized {}

/// One account's session.
#[derive(Debug)]
pub struct Session {
    account_id: String,
    key_manager: KeyManager,
    keys: RwLock<Option<KeySet>>,
}

/// Thread-safe shared session.
pub type SharedSession = Arc<Session>;

impl Session {
    /// Create a locked session for an account.
    pub fn new(account_id: impl Into<String>, kdf: &KdfConfig) -> Self {
        Self {
            account_id: account_id.into(),
            key_manager: KeyManager::new(kdf),
            keys: RwLock::new(None),
        }
    }

    /// Create a locked session wrapped for sharing.
    pub fn shared(account_id: impl Into<String>, kdf: &KdfConfig) -> SharedSession {
        Arc::new(Self::new(account_id, kdf))
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    /// Derive the key set from the secret and hold it for this session.
    ///
    /// Derivation runs before the write lock is taken.
    pub fn unlock(&self, secret: &str) -> Result<(), InitError> {
        let keys = self.key_manager.initialize(secret, &self.account_id)?;
        *self.keys.write() = Some(keys);
        tracing::info!(account = %self.account_id, "Session unlocked");
        Ok(())
    }

    /// Unlock with a cloud key at a specific rotation generation.
    pub fn unlock_at(&self, secret: &str, cloud_generation: u64) -> Result<(), InitError> {
        let keys = self
            .key_manager
            .initialize_at(secret, &self.account_id, cloud_generation)?;
        *self.keys.write() = Some(keys);
        tracing::info!(account = %self.account_id, cloud_generation, "Session unlocked");
        Ok(())
    }

    /// Drop the key set. Key bytes are zeroized as they are dropped.
    pub fn lock(&self) {
        if self.keys.write().take().is_some() {
            tracing::info!(account = %self.account_id, "Session locked");
        }
    }

    pub fn is_unlocked(&self) -> bool {
        self.keys.read().is_some()
    }

    /// Rotate the cloud key to a new generation.
    pub fn rotate_cloud_key(&self, secret: &str, new_generation: u64) -> Result<(), RotateError> {
        let mut guard = self.keys.write();
        let keys = guard.as_mut().ok_or(RotateError::Locked(KeysNotInitialized))?;
        self.key_manager
            .rotate_cloud_key(keys, secret, &self.account_id, new_generation)
            .map_err(RotateError::Init)
    }

    /// Run `f` with shared access to the key set.
    pub fn with_keys<T>(&self, f: impl FnOnce(&KeySet) -> T) -> Result<T, KeysNotInitialized> {
        let guard = self.keys.read();
        guard.as_ref().map(f).ok_or(KeysNotInitialized)
    }
}

/// Cloud key rotation errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotateError {
    Locked(KeysNotInitialized),
    Init(InitError),
}

impl std::fmt::Display for RotateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RotateError::Locked(e) => write!(f, "{e}"),
            RotateError::Init(e) => write!(f, "Key rotation failed: {e}"),
        }
    }
}

impl std::error::Error for RotateError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn kdf() -> KdfConfig {
        KdfConfig { iterations: 64 }
    }

    #[test]
    fn test_locked_session_has_no_keys() {
        let session = Session::new("acct-1", &kdf());
        assert!(!session.is_unlocked());
        assert_eq!(session.with_keys(|_| ()), Err(KeysNotInitialized));
    }

    #[test]
    fn test_unlock_and_lock() {
        let session = Session::new("acct-1", &kdf());
        session.unlock("p@ss1234").unwrap();
        assert!(session.is_unlocked());
        assert_eq!(session.with_keys(|k| k.cloud_generation()), Ok(0));

        session.lock();
        assert!(!session.is_unlocked());
    }

    #[test]
    fn test_unlock_empty_secret_stays_locked() {
        let session = Session::new("acct-1", &kdf());
        assert_eq!(session.unlock(""), Err(InitError::EmptySecret));
        assert!(!session.is_unlocked());
    }

    #[test]
    fn test_rotate_requires_unlocked_session() {
        let session = Session::new("acct-1", &kdf());
        assert_eq!(
            session.rotate_cloud_key("p@ss1234", 1),
            Err(RotateError::Locked(KeysNotInitialized))
        );

        session.unlock("p@ss1234").unwrap();
        session.rotate_cloud_key("p@ss1234", 1).unwrap();
        assert_eq!(session.with_keys(|k| k.cloud_generation()), Ok(1));
    }

    #[test]
    fn test_concurrent_readers() {
        let session = Session::shared("acct-1", &kdf());
        session.unlock("p@ss1234").unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let session = Arc::clone(&session);
                std::thread::spawn(move || session.with_keys(|k| k.cloud_generation()))
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), Ok(0));
        }
    }
}
