//! Differential privacy and k-anonymity for population insights.

pub mod aggregator;
pub mod noise;
pub mod server;

// Re-export commonly used types
pub use aggregator::{
    parse_sample_size, AggregateInsight, CohortProfile, Confidence, ContributionOutcome,
    InsightContribution, InsightType, LocalInsight, PrivacyAggregator, PrivacyError,
    ServerAggregate, CONTRIBUTION_FIELDS,
};
pub use noise::{laplace_noise, LaplaceMechanism, NoiseError, SensitiveField};
pub use server::{AggregationServer, MemoryAggregationServer};
