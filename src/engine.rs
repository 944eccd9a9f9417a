//! One account's privacy engine: session, vault, sync and lifecycle wired
//! over the same collaborators.

use crate::config::Config;
use crate::consent::{ConsentError, ConsentManager, ConsentRecord};
use crate::crypto::{DecryptError, EncryptError, InitError, LocalVault, SyncCodec};
use crate::lifecycle::LifecycleManager;
use crate::privacy::{
    AggregationServer, ContributionOutcome, LocalInsight, PrivacyAggregator, PrivacyError,
};
use crate::records::Record;
use crate::retry::{RemoteEffect, RetryPolicy};
use crate::session::{Session, SharedSession};
use crate::storage::{LocalStore, RecordId, RemoteStore, StoreError};
use crate::sync::{CloudSync, SyncError};
use crate::transparency::SharedTransparencyLog;
use std::sync::Arc;

/// External collaborators the engine runs against.
#[derive(Clone)]
pub struct Collaborators {
    pub local: Arc<dyn LocalStore>,
    pub remote: Arc<dyn RemoteStore>,
    pub server: Arc<dyn AggregationServer>,
}

/// Engine errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    Init(InitError),
    Consent(ConsentError),
    Encrypt(EncryptError),
    Decrypt(DecryptError),
    Store(StoreError),
    Sync(SyncError),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Init(e) => write!(f, "{e}"),
            EngineError::Consent(e) => write!(f, "{e}"),
            EngineError::Encrypt(e) => write!(f, "{e}"),
            EngineError::Decrypt(e) => write!(f, "{e}"),
            EngineError::Store(e) => write!(f, "{e}"),
            EngineError::Sync(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<InitError> for EngineError {
    fn from(e: InitError) -> Self {
        EngineError::Init(e)
    }
}

impl From<ConsentError> for EngineError {
    fn from(e: ConsentError) -> Self {
        EngineError::Consent(e)
    }
}

impl From<EncryptError> for EngineError {
    fn from(e: EncryptError) -> Self {
        EngineError::Encrypt(e)
    }
}

impl From<DecryptError> for EngineError {
    fn from(e: DecryptError) -> Self {
        EngineError::Decrypt(e)
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        EngineError::Store(e)
    }
}

/// A record saved locally, and what happened to its cloud copy.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub struct StoredRecord {
    pub id: RecordId,
    pub remote: RemoteEffect,
}

/// Everything one account needs, built around a single session.
pub struct PrivacyEngine {
    session: SharedSession,
    vault: LocalVault,
    local: Arc<dyn LocalStore>,
    consent: Arc<ConsentManager>,
    sync: CloudSync,
    aggregator: PrivacyAggregator,
    lifecycle: LifecycleManager,
    log: SharedTransparencyLog,
}

impl PrivacyEngine {
    /// Build a locked engine for `account_id`.
    pub fn new(
        config: &Config,
        account_id: &str,
        collaborators: Collaborators,
        log: SharedTransparencyLog,
    ) -> Self {
        let Collaborators {
            local,
            remote,
            server,
        } = collaborators;
        let retry = RetryPolicy::from(&config.retry);
        let session = Session::shared(account_id, &config.kdf);
        let vault = LocalVault::new(session.clone(), log.clone());
        let codec = SyncCodec::new(session.clone(), log.clone());

        let consent = Arc::new(ConsentManager::new(
            account_id,
            vault.clone(),
            local.clone(),
            remote.clone(),
            retry.clone(),
            log.clone(),
        ));
        let sync = CloudSync::new(
            account_id,
            codec,
            remote,
            consent.clone(),
            retry.clone(),
        );
        let aggregator =
            PrivacyAggregator::new(config.privacy.clone(), server, retry, log.clone());
        let lifecycle = LifecycleManager::new(
            account_id,
            session.clone(),
            vault.clone(),
            local.clone(),
            consent.clone(),
            log.clone(),
        );

        Self {
            session,
            vault,
            local,
            consent,
            sync,
            aggregator,
            lifecycle,
            log,
        }
    }

    /// Derive keys from the secret and restore the stored consent.
    pub fn unlock(&self, secret: &str) -> Result<ConsentRecord, EngineError> {
        self.session.unlock(secret)?;
        match self.consent.load() {
            Ok(consent) => Ok(consent),
            Err(e) => {
                // A wrong secret shows up here as an authentication failure
                self.session.lock();
                Err(e.into())
            }
        }
    }

    pub fn lock(&self) {
        self.session.lock();
    }

    pub fn session(&self) -> &SharedSession {
        &self.session
    }

    pub fn vault(&self) -> &LocalVault {
        &self.vault
    }

    pub fn consent(&self) -> &ConsentManager {
        &self.consent
    }

    pub fn sync(&self) -> &CloudSync {
        &self.sync
    }

    pub fn aggregator(&self) -> &PrivacyAggregator {
        &self.aggregator
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    pub fn transparency(&self) -> &SharedTransparencyLog {
        &self.log
    }

    /// Encrypt and store a record under a fresh id, then push it to the
    /// cloud if sync is enabled.
    ///
    /// Both ciphertexts are produced before anything is written, so an error
    /// means nothing was stored.
    pub async fn store_record<R: Record>(&self, record: &R) -> Result<StoredRecord, EngineError> {
        self.store_record_as(RecordId::generate(), record).await
    }

    /// Like [`PrivacyEngine::store_record`], under a caller-chosen id.
    pub async fn store_record_as<R: Record>(
        &self,
        id: RecordId,
        record: &R,
    ) -> Result<StoredRecord, EngineError> {
        let ciphertext = self.vault.encrypt(record)?;
        let envelope = self
            .sync
            .seal_for_upload(&id, record)
            .map_err(EngineError::Sync)?;
        self.local.put(&id, &ciphertext)?;

        let remote = match envelope {
            Some(envelope) => match self.sync.upload(&id, &envelope).await {
                Ok(()) => RemoteEffect::Applied(1),
                Err(e) => {
                    tracing::warn!(record = %id, error = %e, "Stored locally; cloud upload pending");
                    RemoteEffect::Pending(e)
                }
            },
            None => RemoteEffect::NotRequired,
        };
        Ok(StoredRecord { id, remote })
    }

    /// Load and decrypt a record. `None` if no record has this id.
    pub fn load_record<R: Record>(&self, id: &RecordId) -> Result<Option<R>, EngineError> {
        match self.local.get(id)? {
            Some(ciphertext) => Ok(Some(self.vault.decrypt(&ciphertext)?)),
            None => Ok(None),
        }
    }

    /// Contribute insights under the consent currently in force.
    pub async fn contribute(
        &self,
        insights: &[LocalInsight],
    ) -> Result<ContributionOutcome, PrivacyError> {
        let consent = self.consent.current();
        self.aggregator.contribute(insights, &consent).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KdfConfig;
    use crate::crypto::LocalCiphertext;
    use crate::privacy::{Confidence, InsightType, MemoryAggregationServer};
    use crate::records::{CheckIn, JournalEntry};
    use crate::storage::{MemoryLocalStore, MemoryRemoteStore};
    use crate::transparency::create_shared_log;

    struct Fixture {
        engine: PrivacyEngine,
        remote: Arc<MemoryRemoteStore>,
        server: Arc<MemoryAggregationServer>,
        local: Arc<MemoryLocalStore>,
    }

    fn fixture() -> Fixture {
        let config = Config {
            kdf: KdfConfig { iterations: 64 },
            ..Config::default()
        };
        let local = Arc::new(MemoryLocalStore::new());
        let remote = Arc::new(MemoryRemoteStore::new());
        let server = Arc::new(MemoryAggregationServer::new());
        let engine = PrivacyEngine::new(
            &config,
            "acct-1",
            Collaborators {
                local: local.clone(),
                remote: remote.clone(),
                server: server.clone(),
            },
            create_shared_log(),
        );
        Fixture {
            engine,
            remote,
            server,
            local,
        }
    }

    #[tokio::test]
    async fn test_store_and_load_journal() {
        let f = fixture();
        f.engine.unlock("p@ss1234").unwrap();

        let entry = JournalEntry::new("today was good");
        let stored = f.engine.store_record(&entry).await.unwrap();
        assert_eq!(stored.remote, RemoteEffect::NotRequired);
        assert_eq!(f.remote.count("acct-1"), 0);

        let loaded: Option<JournalEntry> = f.engine.load_record(&stored.id).unwrap();
        assert_eq!(loaded, Some(entry));
    }

    #[tokio::test]
    async fn test_store_uploads_when_sync_enabled() {
        let f = fixture();
        f.engine.unlock("p@ss1234").unwrap();
        let _ = f
            .engine
            .consent()
            .update(ConsentRecord {
                cloud_sync: true,
                ..ConsentRecord::default()
            })
            .await
            .unwrap();

        let stored = f.engine.store_record(&CheckIn::new(3, 4)).await.unwrap();
        assert_eq!(stored.remote, RemoteEffect::Applied(1));

        let pulled: Option<CheckIn> = f.engine.sync().pull(&stored.id).await.unwrap();
        assert_eq!(pulled.map(|c| c.mood), Some(3));
    }

    #[tokio::test]
    async fn test_upload_failure_keeps_local_copy() {
        let f = fixture();
        f.engine.unlock("p@ss1234").unwrap();
        let _ = f
            .engine
            .consent()
            .update(ConsentRecord {
                cloud_sync: true,
                ..ConsentRecord::default()
            })
            .await
            .unwrap();
        f.remote.fail_next(10);

        let stored = f.engine.store_record(&JournalEntry::new("offline")).await.unwrap();
        assert!(stored.remote.is_pending());
        assert!(f
            .engine
            .load_record::<JournalEntry>(&stored.id)
            .unwrap()
            .is_some());
    }

    /// Local store that locks the session once armed, right after a write.
    #[derive(Default)]
    struct LockAfterPut {
        inner: MemoryLocalStore,
        session: parking_lot::Mutex<Option<SharedSession>>,
    }

    impl LocalStore for LockAfterPut {
        fn put(&self, id: &RecordId, ciphertext: &LocalCiphertext) -> Result<(), StoreError> {
            self.inner.put(id, ciphertext)?;
            if let Some(session) = self.session.lock().as_ref() {
                session.lock();
            }
            Ok(())
        }

        fn get(&self, id: &RecordId) -> Result<Option<LocalCiphertext>, StoreError> {
            self.inner.get(id)
        }

        fn list(&self) -> Result<Vec<(RecordId, LocalCiphertext)>, StoreError> {
            self.inner.list()
        }

        fn remove(&self, id: &RecordId) -> Result<bool, StoreError> {
            self.inner.remove(id)
        }

        fn erase_all(&self) -> Result<usize, StoreError> {
            self.inner.erase_all()
        }
    }

    #[tokio::test]
    async fn test_lock_during_store_does_not_strand_local_copy() {
        let local = Arc::new(LockAfterPut::default());
        let remote = Arc::new(MemoryRemoteStore::new());
        let engine = PrivacyEngine::new(
            &Config {
                kdf: KdfConfig { iterations: 64 },
                ..Config::default()
            },
            "acct-1",
            Collaborators {
                local: local.clone(),
                remote: remote.clone(),
                server: Arc::new(MemoryAggregationServer::new()),
            },
            create_shared_log(),
        );
        engine.unlock("p@ss1234").unwrap();
        let _ = engine
            .consent()
            .update(ConsentRecord {
                cloud_sync: true,
                ..ConsentRecord::default()
            })
            .await
            .unwrap();
        *local.session.lock() = Some(engine.session().clone());

        let stored = engine.store_record(&JournalEntry::new("late lock")).await.unwrap();
        assert_eq!(stored.remote, RemoteEffect::Applied(1));
        assert!(!engine.session().is_unlocked());
        assert!(local.inner.get(&stored.id).unwrap().is_some());
        assert_eq!(remote.count("acct-1"), 1);
    }

    #[tokio::test]
    async fn test_locked_session_stores_nothing() {
        let f = fixture();
        f.engine.unlock("p@ss1234").unwrap();
        f.engine.lock();

        let err = f.engine.store_record(&CheckIn::new(3, 3)).await.unwrap_err();
        assert_eq!(err, EngineError::Encrypt(EncryptError::KeysNotInitialized));
        assert!(f.local.is_empty());
    }

    #[tokio::test]
    async fn test_unlock_restores_consent() {
        let f = fixture();
        f.engine.unlock("p@ss1234").unwrap();
        let consent = ConsentRecord {
            anonymous_aggregation: true,
            ..ConsentRecord::default()
        };
        let _ = f.engine.consent().update(consent.clone()).await.unwrap();
        f.engine.lock();

        assert_eq!(f.engine.unlock("p@ss1234").unwrap(), consent);
    }

    #[tokio::test]
    async fn test_wrong_secret_is_rejected_once_data_exists() {
        let f = fixture();
        f.engine.unlock("p@ss1234").unwrap();
        let _ = f
            .engine
            .consent()
            .update(ConsentRecord {
                share_with_coach: true,
                ..ConsentRecord::default()
            })
            .await
            .unwrap();
        f.engine.lock();

        let err = f.engine.unlock("wrong").unwrap_err();
        assert_eq!(
            err,
            EngineError::Consent(ConsentError::Decrypt(DecryptError::AuthenticationFailed))
        );
        assert!(!f.engine.session().is_unlocked());
        assert_eq!(f.local.len(), 1);
    }

    #[tokio::test]
    async fn test_contribute_follows_current_consent() {
        let f = fixture();
        f.engine.unlock("p@ss1234").unwrap();
        let insight = LocalInsight::new(
            InsightType::Correlation,
            "sleep_hours",
            "mood",
            0.4,
            Confidence::Medium,
        );

        assert_eq!(
            f.engine.contribute(&[insight.clone()]).await.unwrap(),
            ContributionOutcome::Skipped
        );

        let _ = f
            .engine
            .consent()
            .update(ConsentRecord {
                anonymous_aggregation: true,
                ..ConsentRecord::default()
            })
            .await
            .unwrap();
        assert_eq!(
            f.engine.contribute(&[insight]).await.unwrap(),
            ContributionOutcome::Submitted(1)
        );
        assert_eq!(f.server.received().len(), 1);
    }
}
