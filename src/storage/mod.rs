//! Storage collaborators.
//!
//! The engine persists only opaque shapes: [`LocalCiphertext`] on the
//! device and [`CloudEnvelope`] remotely. Stores return them unmodified and
//! never see keys or plaintext.

pub mod file;
pub mod memory;

use crate::crypto::{CloudEnvelope, LocalCiphertext};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use file::FileLocalStore;
pub use memory::{MemoryLocalStore, MemoryRemoteStore};

/// Identifier of a stored record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    /// A fresh random id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// A fixed, well-known id (e.g. the consent record).
    pub fn fixed(name: &str) -> Self {
        Self(name.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the id is safe to use as a file name.
    pub fn is_safe(&self) -> bool {
        !self.0.is_empty()
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Local filesystem failure
    Io(String),
    /// Stored data could not be parsed
    Corrupt(String),
    /// Network failure or timeout; worth retrying
    Unavailable(String),
    /// The remote rejected the request; retrying will not help
    Rejected { status: u16, message: String },
    /// Id is not usable by this store
    InvalidId(String),
}

impl StoreError {
    /// Whether a retry could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Unavailable(_) => true,
            StoreError::Rejected { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Io(e) => write!(f, "Storage IO error: {e}"),
            StoreError::Corrupt(e) => write!(f, "Stored data is corrupt: {e}"),
            StoreError::Unavailable(e) => write!(f, "Remote unavailable: {e}"),
            StoreError::Rejected { status, message } => {
                write!(f, "Remote rejected request ({status}): {message}")
            }
            StoreError::InvalidId(id) => write!(f, "Invalid record id: {id:?}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// On-device store for encrypted records.
pub trait LocalStore: Send + Sync {
    /// Insert or overwrite a record.
    fn put(&self, id: &RecordId, ciphertext: &LocalCiphertext) -> Result<(), StoreError>;

    fn get(&self, id: &RecordId) -> Result<Option<LocalCiphertext>, StoreError>;

    /// All records, ordered by id.
    fn list(&self) -> Result<Vec<(RecordId, LocalCiphertext)>, StoreError>;

    /// Remove one record. Returns whether it existed.
    fn remove(&self, id: &RecordId) -> Result<bool, StoreError>;

    /// Irreversibly erase every record. Returns how many were erased.
    fn erase_all(&self) -> Result<usize, StoreError>;
}

/// Remote store for cloud envelopes, partitioned by account.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn upload(
        &self,
        account_id: &str,
        id: &RecordId,
        envelope: &CloudEnvelope,
    ) -> Result<(), StoreError>;

    async fn download(
        &self,
        account_id: &str,
        id: &RecordId,
    ) -> Result<Option<CloudEnvelope>, StoreError>;

    async fn list(&self, account_id: &str) -> Result<Vec<RecordId>, StoreError>;

    /// Delete every envelope for the account. Returns how many were deleted.
    async fn delete_all(&self, account_id: &str) -> Result<usize, StoreError>;
}
