//! Aggregation-server collaborator.

use super::aggregator::{CohortProfile, InsightContribution, ServerAggregate};
use crate::storage::StoreError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

/// The population-insight service.
///
/// `submit` receives only allow-listed contributions. `fetch` may return
/// anything; the aggregator filters it before display.
#[async_trait]
pub trait AggregationServer: Send + Sync {
    async fn submit(&self, contributions: &[InsightContribution]) -> Result<(), StoreError>;

    async fn fetch(&self, profile: &CohortProfile) -> Result<Vec<ServerAggregate>, StoreError>;
}

/// In-process aggregation server that records what it receives.
#[derive(Debug, Default)]
pub struct MemoryAggregationServer {
    received: Mutex<Vec<serde_json::Value>>,
    aggregates: Mutex<Vec<ServerAggregate>>,
    failures_remaining: AtomicU32,
}

impl MemoryAggregationServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Aggregates returned by every `fetch`.
    pub fn with_aggregates(aggregates: Vec<ServerAggregate>) -> Self {
        Self {
            aggregates: Mutex::new(aggregates),
            ..Self::default()
        }
    }

    /// Every contribution received, as the JSON that went over the wire.
    pub fn received(&self) -> Vec<serde_json::Value> {
        self.received.lock().clone()
    }

    /// Make the next `count` calls fail with [`StoreError::Unavailable`].
    pub fn fail_next(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::SeqCst);
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
impl AggregationServer for MemoryAggregationServer {
    async fn submit(&self, contributions: &[InsightContribution]) -> Result<(), StoreError> {
        self.check_failure()?;
        let encoded = contributions
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StoreError::Rejected {
                status: 400,
                message: e.to_string(),
            })?;
        self.received.lock().extend(encoded);
        Ok(())
    }

    async fn fetch(&self, _profile: &CohortProfile) -> Result<Vec<ServerAggregate>, StoreError> {
        self.check_failure()?;
        Ok(self.aggregates.lock().clone())
    }
}
