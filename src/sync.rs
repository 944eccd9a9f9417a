//! Cloud sync of sealed records.
//!
//! Only envelopes ever leave the device. Nothing is uploaded unless the
//! user has consented to cloud sync.

use crate::consent::ConsentManager;
use crate::crypto::{CloudEnvelope, IntegrityError, SealError, SyncCodec};
use crate::retry::{RemoteEffect, RetryError, RetryPolicy};
use crate::storage::{RecordId, RemoteStore};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

/// Sync errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    Seal(SealError),
    Integrity(IntegrityError),
    Remote(RetryError),
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::Seal(e) => write!(f, "Could not seal record: {e}"),
            SyncError::Integrity(e) => write!(f, "Rejected cloud envelope: {e}"),
            SyncError::Remote(e) => write!(f, "Cloud store unavailable: {e}"),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<SealError> for SyncError {
    fn from(e: SealError) -> Self {
        SyncError::Seal(e)
    }
}

impl From<IntegrityError> for SyncError {
    fn from(e: IntegrityError) -> Self {
        SyncError::Integrity(e)
    }
}

impl From<RetryError> for SyncError {
    fn from(e: RetryError) -> Self {
        SyncError::Remote(e)
    }
}

/// Pushes and pulls sealed records for one account.
pub struct CloudSync {
    account_id: String,
    codec: SyncCodec,
    remote: Arc<dyn RemoteStore>,
    consent: Arc<ConsentManager>,
    retry: RetryPolicy,
}

impl CloudSync {
    pub fn new(
        account_id: impl Into<String>,
        codec: SyncCodec,
        remote: Arc<dyn RemoteStore>,
        consent: Arc<ConsentManager>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            codec,
            remote,
            consent,
            retry,
        }
    }

    /// Seal and upload a record.
    ///
    /// Returns [`RemoteEffect::NotRequired`] without sealing anything when
    /// cloud sync is not consented to.
    pub async fn push<R: Serialize>(
        &self,
        id: &RecordId,
        record: &R,
    ) -> Result<RemoteEffect, SyncError> {
        match self.seal_for_upload(id, record)? {
            Some(envelope) => {
                self.upload(id, &envelope).await?;
                Ok(RemoteEffect::Applied(1))
            }
            None => Ok(RemoteEffect::NotRequired),
        }
    }

    /// Seal a record for upload. `None` when cloud sync is not consented to.
    pub fn seal_for_upload<R: Serialize>(
        &self,
        id: &RecordId,
        record: &R,
    ) -> Result<Option<CloudEnvelope>, SyncError> {
        if !self.consent.current().cloud_sync {
            tracing::debug!(record = %id, "Cloud sync disabled; not uploading");
            return Ok(None);
        }
        Ok(Some(self.codec.seal(record)?))
    }

    /// Upload an envelope that is already sealed.
    pub async fn upload(&self, id: &RecordId, envelope: &CloudEnvelope) -> Result<(), RetryError> {
        self.retry
            .run("upload envelope", || {
                self.remote.upload(&self.account_id, id, envelope)
            })
            .await?;
        tracing::debug!(record = %id, "Envelope uploaded");
        Ok(())
    }

    /// Download and open a record. `None` if the store does not have it.
    pub async fn pull<R: DeserializeOwned>(&self, id: &RecordId) -> Result<Option<R>, SyncError> {
        let envelope = self
            .retry
            .run("download envelope", || {
                self.remote.download(&self.account_id, id)
            })
            .await?;

        match envelope {
            Some(envelope) => Ok(Some(self.codec.open(&envelope)?)),
            None => Ok(None),
        }
    }

    /// Ids of every envelope held remotely for this account.
    pub async fn remote_ids(&self) -> Result<Vec<RecordId>, SyncError> {
        Ok(self
            .retry
            .run("list envelopes", || self.remote.list(&self.account_id))
            .await?)
    }
}
