//! In-memory stores, used by tests and as an offline remote.

use super::{LocalStore, RecordId, RemoteStore, StoreError};
use crate::crypto::{CloudEnvelope, LocalCiphertext};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Local store backed by a map.
#[derive(Debug, Default)]
pub struct MemoryLocalStore {
    records: Mutex<BTreeMap<RecordId, LocalCiphertext>>,
    erase_fails: AtomicBool,
}

impl MemoryLocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Make the next `erase_all` stop with [`StoreError::Io`] after one record.
    pub fn fail_next_erase(&self) {
        self.erase_fails.store(true, Ordering::SeqCst);
    }
}

impl LocalStore for MemoryLocalStore {
    fn put(&self, id: &RecordId, ciphertext: &LocalCiphertext) -> Result<(), StoreError> {
        self.records.lock().insert(id.clone(), ciphertext.clone());
        Ok(())
    }

    fn get(&self, id: &RecordId) -> Result<Option<LocalCiphertext>, StoreError> {
        Ok(self.records.lock().get(id).cloned())
    }

    fn list(&self) -> Result<Vec<(RecordId, LocalCiphertext)>, StoreError> {
        Ok(self
            .records
            .lock()
            .iter()
            .map(|(id, ct)| (id.clone(), ct.clone()))
            .collect())
    }

    fn remove(&self, id: &RecordId) -> Result<bool, StoreError> {
        Ok(self.records.lock().remove(id).is_some())
    }

    fn erase_all(&self) -> Result<usize, StoreError> {
        let mut records = self.records.lock();
        if self.erase_fails.swap(false, Ordering::SeqCst) {
            records.pop_first();
            return Err(StoreError::Io("injected erase failure".to_string()));
        }
        let count = records.len();
        records.clear();
        Ok(count)
    }
}

/// Remote store backed by a map, with injectable transient failures.
#[derive(Debug, Default)]
pub struct MemoryRemoteStore {
    accounts: Mutex<HashMap<String, BTreeMap<RecordId, CloudEnvelope>>>,
    failures_remaining: AtomicU32,
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` calls fail with [`StoreError::Unavailable`].
    pub fn fail_next(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// Number of envelopes held for an account.
    pub fn count(&self, account_id: &str) -> usize {
        self.accounts
            .lock()
            .get(account_id)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }

    fn check_failure(&self) -> Result<(), StoreError> {
        let injected = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            Err(StoreError::Unavailable("injected failure".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn upload(
        &self,
        account_id: &str,
        id: &RecordId,
        envelope: &CloudEnvelope,
    ) -> Result<(), StoreError> {
        self.check_failure()?;
        self.accounts
            .lock()
            .entry(account_id.to_string())
            .or_default()
            .insert(id.clone(), envelope.clone());
        Ok(())
    }

    async fn download(
        &self,
        account_id: &str,
        id: &RecordId,
    ) -> Result<Option<CloudEnvelope>, StoreError> {
        self.check_failure()?;
        Ok(self
            .accounts
            .lock()
            .get(account_id)
            .and_then(|envelopes| envelopes.get(id).cloned()))
    }

    async fn list(&self, account_id: &str) -> Result<Vec<RecordId>, StoreError> {
        self.check_failure()?;
        Ok(self
            .accounts
            .lock()
            .get(account_id)
            .map(|envelopes| envelopes.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete_all(&self, account_id: &str) -> Result<usize, StoreError> {
        self.check_failure()?;
        Ok(self
            .accounts
            .lock()
            .remove(account_id)
            .map(|envelopes| envelopes.len())
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::DataClass;

    fn envelope() -> CloudEnvelope {
        CloudEnvelope {
            ciphertext: "Y3Q=".into(),
            iv: "aXY=".into(),
            auth_tag: "dGFn".into(),
        }
    }

    #[test]
    fn test_local_put_get_erase() {
        let store = MemoryLocalStore::new();
        let id = RecordId::generate();
        let ct = LocalCiphertext {
            data_class: DataClass::Journal,
            blob: vec![1, 2, 3],
        };

        store.put(&id, &ct).unwrap();
        assert_eq!(store.get(&id).unwrap(), Some(ct));
        assert_eq!(store.erase_all().unwrap(), 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_remote_is_partitioned_by_account() {
        let store = MemoryRemoteStore::new();
        store
            .upload("acct-1", &RecordId::from("a"), &envelope())
            .await
            .unwrap();
        store
            .upload("acct-2", &RecordId::from("b"), &envelope())
            .await
            .unwrap();

        assert_eq!(store.delete_all("acct-1").await.unwrap(), 1);
        assert_eq!(store.count("acct-1"), 0);
        assert_eq!(store.count("acct-2"), 1);
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let store = MemoryRemoteStore::new();
        store.fail_next(2);

        assert!(store.list("acct-1").await.is_err());
        assert!(store.list("acct-1").await.is_err());
        assert!(store.list("acct-1").await.is_ok());
    }
}
