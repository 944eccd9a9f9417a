//! HTTP client for the Synheart cloud.
//!
//! Implements both remote collaborators over one authenticated client: the
//! envelope store and the aggregation server. The cloud only ever receives
//! sealed envelopes and allow-listed contributions.

use crate::crypto::CloudEnvelope;
use crate::privacy::{AggregationServer, CohortProfile, InsightContribution, ServerAggregate};
use crate::storage::{RecordId, RemoteStore, StoreError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Environment variable holding the cloud base URL.
pub const CLOUD_URL_ENV: &str = "SYNHEART_CLOUD_URL";
/// Environment variable holding the bearer token.
pub const CLOUD_TOKEN_ENV: &str = "SYNHEART_CLOUD_TOKEN";

/// Cloud endpoint configuration.
#[derive(Debug, Clone)]
pub struct CloudConfig {
    /// Base URL, without a trailing slash
    pub base_url: String,
    /// Bearer authentication token
    pub token: String,
}

impl CloudConfig {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    /// Read the endpoint from `SYNHEART_CLOUD_URL` and `SYNHEART_CLOUD_TOKEN`.
    pub fn from_env() -> Result<Self, StoreError> {
        let base_url = std::env::var(CLOUD_URL_ENV)
            .map_err(|_| StoreError::Unavailable(format!("{CLOUD_URL_ENV} is not set")))?;
        let token = std::env::var(CLOUD_TOKEN_ENV)
            .map_err(|_| StoreError::Unavailable(format!("{CLOUD_TOKEN_ENV} is not set")))?;
        Ok(Self::new(base_url, token))
    }

    /// All envelopes for an account.
    pub fn envelopes_url(&self, account_id: &str) -> String {
        format!("{}/v1/accounts/{}/envelopes", self.base_url, account_id)
    }

    /// One envelope.
    pub fn envelope_url(&self, account_id: &str, id: &RecordId) -> String {
        format!("{}/{}", self.envelopes_url(account_id), id)
    }

    pub fn contributions_url(&self) -> String {
        format!("{}/v1/insights/contributions", self.base_url)
    }

    pub fn aggregates_url(&self) -> String {
        format!("{}/v1/insights/aggregates", self.base_url)
    }
}

#[derive(Serialize)]
struct ContributionBatch<'a> {
    contributions: &'a [InsightContribution],
}

#[derive(Deserialize)]
struct DeleteResponse {
    deleted: usize,
}

#[derive(Deserialize)]
struct ListResponse {
    ids: Vec<RecordId>,
}

/// Cloud client implementing [`RemoteStore`] and [`AggregationServer`].
pub struct CloudClient {
    config: CloudConfig,
    client: reqwest::Client,
}

impl CloudClient {
    /// Create a client. `timeout` bounds each HTTP request.
    pub fn new(config: CloudConfig, timeout: Duration) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StoreError::Unavailable(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &CloudConfig {
        &self.config
    }

    fn checked_id(id: &RecordId) -> Result<(), StoreError> {
        if id.is_safe() {
            Ok(())
        } else {
            Err(StoreError::InvalidId(id.to_string()))
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, StoreError> {
        let response = request
            .bearer_auth(&self.config.token)
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        Err(StoreError::Rejected {
            status: status.as_u16(),
            message,
        })
    }

    async fn json<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T, StoreError> {
        response
            .json()
            .await
            .map_err(|e| StoreError::Corrupt(e.to_string()))
    }
}

#[async_trait]
impl RemoteStore for CloudClient {
    async fn upload(
        &self,
        account_id: &str,
        id: &RecordId,
        envelope: &CloudEnvelope,
    ) -> Result<(), StoreError> {
        Self::checked_id(id)?;
        self.send(
            self.client
                .put(self.config.envelope_url(account_id, id))
                .json(envelope),
        )
        .await?;
        Ok(())
    }

    async fn download(
        &self,
        account_id: &str,
        id: &RecordId,
    ) -> Result<Option<CloudEnvelope>, StoreError> {
        Self::checked_id(id)?;
        match self
            .send(self.client.get(self.config.envelope_url(account_id, id)))
            .await
        {
            Ok(response) => Ok(Some(Self::json(response).await?)),
            Err(StoreError::Rejected { status: 404, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list(&self, account_id: &str) -> Result<Vec<RecordId>, StoreError> {
        let response = self
            .send(self.client.get(self.config.envelopes_url(account_id)))
            .await?;
        let list: ListResponse = Self::json(response).await?;
        Ok(list.ids)
    }

    async fn delete_all(&self, account_id: &str) -> Result<usize, StoreError> {
        let response = self
            .send(self.client.delete(self.config.envelopes_url(account_id)))
            .await?;
        let deleted: DeleteResponse = Self::json(response).await?;
        Ok(deleted.deleted)
    }
}

#[async_trait]
impl AggregationServer for CloudClient {
    async fn submit(&self, contributions: &[InsightContribution]) -> Result<(), StoreError> {
        self.send(
            self.client
                .post(self.config.contributions_url())
                .json(&ContributionBatch { contributions }),
        )
        .await?;
        Ok(())
    }

    async fn fetch(&self, profile: &CohortProfile) -> Result<Vec<ServerAggregate>, StoreError> {
        let response = self
            .send(self.client.post(self.config.aggregates_url()).json(profile))
            .await?;
        Self::json(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cloud_config_urls() {
        let config = CloudConfig::new("https://cloud.example/", "test-token");
        assert_eq!(config.base_url, "https://cloud.example");
        assert_eq!(
            config.envelopes_url("acct-1"),
            "https://cloud.example/v1/accounts/acct-1/envelopes"
        );
        assert_eq!(
            config.envelope_url("acct-1", &RecordId::fixed("j1")),
            "https://cloud.example/v1/accounts/acct-1/envelopes/j1"
        );
        assert_eq!(
            config.aggregates_url(),
            "https://cloud.example/v1/insights/aggregates"
        );
    }

    #[tokio::test]
    async fn test_unsafe_ids_never_reach_the_network() {
        let client = CloudClient::new(
            CloudConfig::new("http://127.0.0.1:9", "t"),
            Duration::from_millis(50),
        )
        .unwrap();
        let err = client
            .download("acct-1", &RecordId::from("../secrets"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidId(_)));
    }

    #[tokio::test]
    async fn test_unreachable_cloud_is_transient() {
        let client = CloudClient::new(
            CloudConfig::new("http://127.0.0.1:9", "t"),
            Duration::from_millis(200),
        )
        .unwrap();
        let err = client.list("acct-1").await.unwrap_err();
        assert!(err.is_transient());
    }
}
