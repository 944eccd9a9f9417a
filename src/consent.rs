//! User consent and its cascading effects.
//!
//! The consent record is stored encrypted under the master key like any
//! other settings record. Revoking `cloud_sync` deletes every remote
//! envelope for the account. The purge is queued in the local store before
//! it is attempted, so a failed or interrupted purge survives restarts
//! until [`ConsentManager::retry_pending`] confirms it.

use crate::crypto::{DecryptError, EncryptError, LocalVault};
use crate::retry::{RemoteEffect, RetryPolicy};
use crate::storage::{LocalStore, RecordId, RemoteStore, StoreError};
use crate::transparency::SharedTransparencyLog;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Well-known id of the consent record in the local store.
pub const CONSENT_RECORD_ID: &str = "consent";

/// Well-known id of the queued remote purge in the local store.
pub const PENDING_PURGE_RECORD_ID: &str = "pending-remote-purge";

/// The user's consent flags. Everything is off until the user opts in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ConsentRecord {
    pub collect_device_data: bool,
    pub cloud_sync: bool,
    pub anonymous_aggregation: bool,
    pub share_with_coach: bool,
}

/// A remote purge that has been requested but not yet confirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PendingPurge {
    pub queued_at: DateTime<Utc>,
}

/// Result of a consent update.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub struct ConsentUpdate {
    /// Whether the record differed from the current one
    pub changed: bool,
    /// Status of the remote purge, if one was triggered
    pub remote: RemoteEffect,
}

/// Consent errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsentError {
    Encrypt(EncryptError),
    Decrypt(DecryptError),
    Store(StoreError),
}

impl std::fmt::Display for ConsentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConsentError::Encrypt(e) => write!(f, "Could not encrypt consent: {e}"),
            ConsentError::Decrypt(e) => write!(f, "Could not decrypt consent: {e}"),
            ConsentError::Store(e) => write!(f, "Could not persist consent: {e}"),
        }
    }
}

impl std::error::Error for ConsentError {}

/// Holds the current consent and applies changes to it.
pub struct ConsentManager {
    account_id: String,
    vault: LocalVault,
    local: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteStore>,
    retry: RetryPolicy,
    log: SharedTransparencyLog,
    current: RwLock<ConsentRecord>,
    pending_remote_purge: AtomicBool,
    update_gate: tokio::sync::Mutex<()>,
}

impl ConsentManager {
    pub fn new(
        account_id: impl Into<String>,
        vault: LocalVault,
        local: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteStore>,
        retry: RetryPolicy,
        log: SharedTransparencyLog,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            vault,
            local,
            remote,
            retry,
            log,
            current: RwLock::new(ConsentRecord::default()),
            pending_remote_purge: AtomicBool::new(false),
            update_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Restore the persisted consent and purge queue, or the opt-in
    /// default on first run.
    pub fn load(&self) -> Result<ConsentRecord, ConsentError> {
        let id = RecordId::fixed(CONSENT_RECORD_ID);
        let record = match self.local.get(&id).map_err(ConsentError::Store)? {
            Some(ciphertext) => self
                .vault
                .decrypt::<ConsentRecord>(&ciphertext)
                .map_err(ConsentError::Decrypt)?,
            None => ConsentRecord::default(),
        };

        let queued = match self
            .local
            .get(&RecordId::fixed(PENDING_PURGE_RECORD_ID))
            .map_err(ConsentError::Store)?
        {
            Some(ciphertext) => {
                let pending = self
                    .vault
                    .decrypt::<PendingPurge>(&ciphertext)
                    .map_err(ConsentError::Decrypt)?;
                tracing::info!(queued_at = %pending.queued_at, "Remote purge still pending");
                true
            }
            None => false,
        };

        *self.current.write() = record.clone();
        self.pending_remote_purge.store(queued, Ordering::SeqCst);
        Ok(record)
    }

    /// The consent currently in force.
    pub fn current(&self) -> ConsentRecord {
        self.current.read().clone()
    }

    /// Whether a cloud purge is still waiting to be confirmed.
    pub fn has_pending_remote_purge(&self) -> bool {
        self.pending_remote_purge.load(Ordering::SeqCst)
    }

    /// Persist new consent and apply the effects of any revocation.
    ///
    /// Applying the consent already in force does nothing. If the returned
    /// future is dropped mid-purge, the new consent and the queued purge are
    /// already persisted.
    pub async fn update(&self, new_consent: ConsentRecord) -> Result<ConsentUpdate, ConsentError> {
        let _gate = self.update_gate.lock().await;

        let previous = self.current();
        if previous == new_consent {
            return Ok(ConsentUpdate {
                changed: false,
                remote: RemoteEffect::NotRequired,
            });
        }

        let ciphertext = self
            .vault
            .encrypt(&new_consent)
            .map_err(ConsentError::Encrypt)?;
        self.local
            .put(&RecordId::fixed(CONSENT_RECORD_ID), &ciphertext)
            .map_err(ConsentError::Store)?;
        *self.current.write() = new_consent.clone();

        if previous.anonymous_aggregation && !new_consent.anonymous_aggregation {
            tracing::info!("Anonymous aggregation revoked");
        }

        if !previous.cloud_sync && new_consent.cloud_sync && self.has_pending_remote_purge() {
            tracing::info!("Cloud sync re-enabled; dropping queued remote purge");
            self.clear_remote_purge();
        }

        let remote = if previous.cloud_sync && !new_consent.cloud_sync {
            tracing::info!("Cloud sync revoked; deleting remote copies");
            self.queue_remote_purge();
            self.purge_remote().await
        } else {
            RemoteEffect::NotRequired
        };

        Ok(ConsentUpdate {
            changed: true,
            remote,
        })
    }

    /// Re-attempt a queued remote purge.
    pub async fn retry_pending(&self) -> RemoteEffect {
        let _gate = self.update_gate.lock().await;
        if !self.has_pending_remote_purge() {
            return RemoteEffect::NotRequired;
        }
        if self.current().cloud_sync {
            tracing::info!("Cloud sync is enabled; dropping stale remote purge");
            self.clear_remote_purge();
            return RemoteEffect::NotRequired;
        }
        self.purge_remote().await
    }

    /// Forget the cached consent, e.g. after everything was deleted.
    ///
    /// A queued remote purge is kept.
    pub(crate) fn reset(&self) {
        *self.current.write() = ConsentRecord::default();
    }

    /// Queue a remote purge, persisting it while the session is unlocked.
    ///
    /// The in-memory flag is set even if the marker cannot be stored.
    pub(crate) fn queue_remote_purge(&self) {
        self.pending_remote_purge.store(true, Ordering::SeqCst);

        let marker = PendingPurge {
            queued_at: Utc::now(),
        };
        let stored = self
            .vault
            .encrypt(&marker)
            .map_err(ConsentError::Encrypt)
            .and_then(|ciphertext| {
                self.local
                    .put(&RecordId::fixed(PENDING_PURGE_RECORD_ID), &ciphertext)
                    .map_err(ConsentError::Store)
            });
        if let Err(e) = stored {
            tracing::warn!(error = %e, "Remote purge queued in memory only");
        }
    }

    fn clear_remote_purge(&self) {
        self.pending_remote_purge.store(false, Ordering::SeqCst);
        if let Err(e) = self.local.remove(&RecordId::fixed(PENDING_PURGE_RECORD_ID)) {
            tracing::warn!(error = %e, "Could not remove purge marker");
        }
    }

    /// Delete every remote envelope and clear the queue once confirmed.
    pub(crate) async fn purge_remote(&self) -> RemoteEffect {
        let result = self
            .retry
            .run("purge remote envelopes", || {
                self.remote.delete_all(&self.account_id)
            })
            .await;

        match &result {
            Ok(count) => {
                self.clear_remote_purge();
                self.log.record_remote_purged(*count as u64);
                tracing::info!(count, "Remote envelopes deleted");
            }
            Err(e) => tracing::warn!(error = %e, "Remote purge pending"),
        }
        result.into()
    }
}
