//! Anonymous population insights.
//!
//! Outbound, a user's local insights become [`InsightContribution`]s: an
//! allow-list of five fields with Laplace noise on `impact`. Inbound, server
//! aggregates describing fewer than `k_anonymity_floor` people are dropped
//! before anything can display them.

use super::noise::{LaplaceMechanism, NoiseError, SensitiveField};
use super::server::AggregationServer;
use crate::config::PrivacyConfig;
use crate::consent::ConsentRecord;
use crate::retry::{RetryError, RetryPolicy};
use crate::transparency::SharedTransparencyLog;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// The only keys an outbound contribution may carry.
pub const CONTRIBUTION_FIELDS: [&str; 5] =
    ["type", "sourceMetric", "targetMetric", "impact", "confidence"];

const MAX_METRIC_LEN: usize = 64;

/// Kind of local insight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightType {
    Correlation,
    Trend,
    Pattern,
}

/// Coarse confidence bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

/// An insight computed on-device. May carry identifying fields that must
/// never leave the device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalInsight {
    #[serde(rename = "type")]
    pub insight_type: InsightType,
    pub source_metric: String,
    pub target_metric: String,
    pub impact: f64,
    pub confidence: Confidence,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl LocalInsight {
    pub fn new(
        insight_type: InsightType,
        source_metric: impl Into<String>,
        target_metric: impl Into<String>,
        impact: f64,
        confidence: Confidence,
    ) -> Self {
        Self {
            insight_type,
            source_metric: source_metric.into(),
            target_metric: target_metric.into(),
            impact,
            confidence,
            user_id: None,
            device_id: None,
            timestamp: None,
            note: None,
        }
    }
}

/// What is sent to the aggregation server. Nothing else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct InsightContribution {
    #[serde(rename = "type")]
    pub insight_type: InsightType,
    pub source_metric: String,
    pub target_metric: String,
    pub impact: f64,
    pub confidence: Confidence,
}

/// Cohort description used to request aggregates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CohortProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age_band: Option<String>,
    #[serde(default)]
    pub goals: Vec<String>,
}

/// An aggregate as the server sends it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerAggregate {
    pub title: String,
    pub description: String,
    /// Human-readable cohort size, e.g. "1,247 users"
    pub sample_size: String,
    pub confidence: Confidence,
}

/// An aggregate that passed the cohort floor.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateInsight {
    pub title: String,
    pub description: String,
    pub sample_size: u64,
    pub confidence: Confidence,
}

/// Result of a contribution request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContributionOutcome {
    /// Consent is off; nothing was sent
    Skipped,
    /// This many contributions were accepted by the server
    Submitted(usize),
}

/// Aggregator errors.
#[derive(Debug, Clone, PartialEq)]
pub enum PrivacyError {
    /// The insight cannot be turned into a contribution
    InvalidInsight(String),
    /// Noise parameters are unusable
    Noise(NoiseError),
    /// The server could not be reached or refused the request
    Transport(RetryError),
}

impl std::fmt::Display for PrivacyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PrivacyError::InvalidInsight(e) => write!(f, "Invalid insight: {e}"),
            PrivacyError::Noise(e) => write!(f, "Noise configuration error: {e}"),
            PrivacyError::Transport(e) => write!(f, "Aggregation server error: {e}"),
        }
    }
}

impl std::error::Error for PrivacyError {}

impl From<NoiseError> for PrivacyError {
    fn from(e: NoiseError) -> Self {
        PrivacyError::Noise(e)
    }
}

/// Parse a cohort size like `"1,247 users"`.
///
/// The leading token must be plain digits or digits in well-formed groups
/// of three (`"1,247"`). Anything else (`"~1k"`, `"1.2 million"`, `"10,00"`,
/// `""`) or a trailing word containing digits yields `None`.
pub fn parse_sample_size(raw: &str) -> Option<u64> {
    let mut words = raw.split_whitespace();
    let token = words.next()?;
    if words.any(|word| word.chars().any(|c| c.is_ascii_digit())) {
        return None;
    }

    let mut groups = token.split(',');
    let first = groups.next()?;
    let all_digits = |g: &str| !g.is_empty() && g.chars().all(|c| c.is_ascii_digit());
    if !all_digits(first) {
        return None;
    }

    let mut digits = first.to_string();
    let mut grouped = false;
    for group in groups {
        if group.len() != 3 || !all_digits(group) {
            return None;
        }
        grouped = true;
        digits.push_str(group);
    }
    if grouped && first.len() > 3 {
        return None;
    }
    digits.parse().ok()
}

fn valid_metric(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_METRIC_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Turns local insights into private contributions and gates aggregates.
pub struct PrivacyAggregator {
    config: PrivacyConfig,
    server: Arc<dyn AggregationServer>,
    retry: RetryPolicy,
    log: SharedTransparencyLog,
}

impl PrivacyAggregator {
    pub fn new(
        config: PrivacyConfig,
        server: Arc<dyn AggregationServer>,
        retry: RetryPolicy,
        log: SharedTransparencyLog,
    ) -> Self {
        Self {
            config,
            server,
            retry,
            log,
        }
    }

    /// The noised field definition for `impact` under a type's budget.
    pub fn impact_field(&self, insight_type: InsightType) -> Result<SensitiveField, NoiseError> {
        let mechanism = LaplaceMechanism::new(
            self.config.impact_sensitivity,
            self.config.epsilon_for(insight_type),
        )?;
        SensitiveField::new("impact", self.config.impact_bounds, mechanism)
    }

    /// Build a contribution from a typed local insight.
    pub fn prepare_contribution(
        &self,
        insight: &LocalInsight,
    ) -> Result<InsightContribution, PrivacyError> {
        let value = serde_json::to_value(insight)
            .map_err(|e| PrivacyError::InvalidInsight(e.to_string()))?;
        self.prepare_contribution_value(&value, &mut rand::thread_rng())
    }

    /// Build a contribution from an insight of any shape.
    ///
    /// Only [`CONTRIBUTION_FIELDS`] are copied out of the input; every other
    /// key is dropped before parsing.
    pub fn prepare_contribution_value<R: Rng + ?Sized>(
        &self,
        insight: &serde_json::Value,
        rng: &mut R,
    ) -> Result<InsightContribution, PrivacyError> {
        let object = insight
            .as_object()
            .ok_or_else(|| PrivacyError::InvalidInsight("expected a JSON object".into()))?;

        let allowed: serde_json::Map<String, serde_json::Value> = CONTRIBUTION_FIELDS
            .iter()
            .filter_map(|key| object.get(*key).map(|v| (key.to_string(), v.clone())))
            .collect();

        let mut contribution: InsightContribution =
            serde_json::from_value(serde_json::Value::Object(allowed))
                .map_err(|e| PrivacyError::InvalidInsight(e.to_string()))?;

        for metric in [&contribution.source_metric, &contribution.target_metric] {
            if !valid_metric(metric) {
                return Err(PrivacyError::InvalidInsight(format!(
                    "metric name {metric:?} is not an identifier"
                )));
            }
        }

        let field = self.impact_field(contribution.insight_type)?;
        contribution.impact = field.privatize(contribution.impact, rng);

        Ok(contribution)
    }

    /// Send contributions for the given insights, if consent allows.
    ///
    /// With `anonymous_aggregation` off this returns `Skipped` without any
    /// network activity. Insights that cannot be converted are dropped.
    pub async fn contribute(
        &self,
        insights: &[LocalInsight],
        consent: &ConsentRecord,
    ) -> Result<ContributionOutcome, PrivacyError> {
        if !consent.anonymous_aggregation {
            self.log.record_contributions_skipped();
            tracing::debug!("Anonymous aggregation disabled; contribution skipped");
            return Ok(ContributionOutcome::Skipped);
        }

        let contributions: Vec<InsightContribution> = insights
            .iter()
            .filter_map(|insight| match self.prepare_contribution(insight) {
                Ok(c) => Some(c),
                Err(e) => {
                    tracing::warn!(error = %e, "Dropping insight from contribution");
                    None
                }
            })
            .collect();

        if contributions.is_empty() {
            return Ok(ContributionOutcome::Submitted(0));
        }

        self.retry
            .run("submit contributions", || self.server.submit(&contributions))
            .await
            .map_err(PrivacyError::Transport)?;

        self.log
            .record_contributions_sent(contributions.len() as u64);
        tracing::info!(count = contributions.len(), "Submitted anonymous contributions");
        Ok(ContributionOutcome::Submitted(contributions.len()))
    }

    /// Fetch aggregates for a cohort, keeping only those above the floor.
    pub async fn fetch_aggregate(
        &self,
        profile: &CohortProfile,
    ) -> Result<Vec<AggregateInsight>, PrivacyError> {
        let raw = self
            .retry
            .run("fetch aggregates", || self.server.fetch(profile))
            .await
            .map_err(PrivacyError::Transport)?;

        Ok(self.filter_aggregates(raw))
    }

    /// Apply the k-anonymity floor to server aggregates.
    pub fn filter_aggregates(&self, raw: Vec<ServerAggregate>) -> Vec<AggregateInsight> {
        let floor = self.config.k_anonymity_floor;
        let total = raw.len();

        let accepted: Vec<AggregateInsight> = raw
            .into_iter()
            .filter_map(|aggregate| match parse_sample_size(&aggregate.sample_size) {
                Some(n) if n >= floor => Some(AggregateInsight {
                    title: aggregate.title,
                    description: aggregate.description,
                    sample_size: n,
                    confidence: aggregate.confidence,
                }),
                parsed => {
                    tracing::warn!(
                        sample_size = ?parsed,
                        floor,
                        "Withholding aggregate below the cohort floor"
                    );
                    None
                }
            })
            .collect();

        let rejected = total - accepted.len();
        self.log
            .record_aggregates(accepted.len() as u64, rejected as u64);
        accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::privacy::server::MemoryAggregationServer;
    use crate::transparency::create_shared_log;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use serde_json::json;

    fn aggregator_with(server: Arc<MemoryAggregationServer>) -> PrivacyAggregator {
        PrivacyAggregator::new(
            PrivacyConfig::default(),
            server,
            RetryPolicy::immediate(3),
            create_shared_log(),
        )
    }

    fn aggregate(title: &str, sample_size: &str) -> ServerAggregate {
        ServerAggregate {
            title: title.to_string(),
            description: "People like you".to_string(),
            sample_size: sample_size.to_string(),
            confidence: Confidence::Medium,
        }
    }

    fn consent(anonymous_aggregation: bool) -> ConsentRecord {
        ConsentRecord {
            anonymous_aggregation,
            ..ConsentRecord::default()
        }
    }

    #[test]
    fn test_parse_sample_size() {
        assert_eq!(parse_sample_size("1,247 users"), Some(1247));
        assert_eq!(parse_sample_size("842 users"), Some(842));
        assert_eq!(parse_sample_size("1000"), Some(1000));
        assert_eq!(parse_sample_size("~1k users"), None);
        assert_eq!(parse_sample_size("1.5 million"), None);
        assert_eq!(parse_sample_size(""), None);
    }

    #[test]
    fn test_malformed_groupings_are_rejected() {
        assert_eq!(parse_sample_size("12,345,678 users"), Some(12_345_678));
        for raw in [
            "1,0,0,0 users",
            ",,,1000 users",
            "10,00 users",
            "1000, users",
            "1000,000 users",
            "1,00a users",
            "842 users 2000",
        ] {
            assert_eq!(parse_sample_size(raw), None, "{raw:?} should not parse");
        }
    }

    #[tokio::test]
    async fn test_malformed_sample_size_is_never_shown() {
        let server = Arc::new(MemoryAggregationServer::with_aggregates(vec![aggregate(
            "Odd", "1,0,0,0 users",
        )]));
        let aggregator = aggregator_with(server);

        let shown = aggregator
            .fetch_aggregate(&CohortProfile::default())
            .await
            .unwrap();
        assert!(shown.is_empty());
    }

    #[test]
    fn test_extraneous_fields_are_dropped() {
        let aggregator = aggregator_with(Arc::new(MemoryAggregationServer::new()));
        let mut rng = StdRng::seed_from_u64(3);

        let shapes = [
            json!({
                "type": "correlation", "sourceMetric": "sleep_hours",
                "targetMetric": "mood", "impact": 0.3, "confidence": "high",
                "userId": "u-123", "timestamp": "2024-01-01T00:00:00Z", "deviceId": "d-9"
            }),
            json!({
                "deviceId": "d-9", "type": "trend", "sourceMetric": "steps",
                "targetMetric": "energy", "impact": -0.5, "confidence": "low",
                "note": "felt awful after the argument with Sam", "extra": {"nested": true}
            }),
        ];

        for shape in &shapes {
            let contribution = aggregator
                .prepare_contribution_value(shape, &mut rng)
                .unwrap();
            let out = serde_json::to_value(&contribution).unwrap();
            let keys: Vec<&str> = out.as_object().unwrap().keys().map(String::as_str).collect();

            assert_eq!(keys.len(), CONTRIBUTION_FIELDS.len());
            for key in keys {
                assert!(CONTRIBUTION_FIELDS.contains(&key), "unexpected key {key}");
            }
        }
    }

    #[test]
    fn test_missing_required_field_is_invalid() {
        let aggregator = aggregator_with(Arc::new(MemoryAggregationServer::new()));
        let mut rng = StdRng::seed_from_u64(3);

        let result = aggregator.prepare_contribution_value(
            &json!({"type": "trend", "sourceMetric": "steps", "impact": 0.1, "confidence": "low"}),
            &mut rng,
        );
        assert!(matches!(result, Err(PrivacyError::InvalidInsight(_))));
    }

    #[test]
    fn test_free_text_metric_is_rejected() {
        let aggregator = aggregator_with(Arc::new(MemoryAggregationServer::new()));
        let insight = LocalInsight::new(
            InsightType::Correlation,
            "talked to my therapist",
            "mood",
            0.2,
            Confidence::Low,
        );
        assert!(matches!(
            aggregator.prepare_contribution(&insight),
            Err(PrivacyError::InvalidInsight(_))
        ));
    }

    #[test]
    fn test_impact_is_noised() {
        let aggregator = aggregator_with(Arc::new(MemoryAggregationServer::new()));
        let insight = LocalInsight::new(
            InsightType::Correlation,
            "sleep_hours",
            "mood",
            0.3,
            Confidence::High,
        );

        let impacts: Vec<f64> = (0..20)
            .map(|_| aggregator.prepare_contribution(&insight).unwrap().impact)
            .collect();
        assert!(impacts.iter().any(|i| (*i - 0.3).abs() > 1e-9));
    }

    #[test]
    fn test_k_anonymity_gating() {
        let aggregator = aggregator_with(Arc::new(MemoryAggregationServer::new()));

        let shown = aggregator.filter_aggregates(vec![
            aggregate("Small cohort", "842 users"),
            aggregate("Large cohort", "1,500 users"),
        ]);

        assert_eq!(shown.len(), 1);
        assert_eq!(shown[0].title, "Large cohort");
        assert_eq!(shown[0].sample_size, 1500);
    }

    #[test]
    fn test_unparseable_sample_size_is_withheld() {
        let aggregator = aggregator_with(Arc::new(MemoryAggregationServer::new()));
        let shown = aggregator.filter_aggregates(vec![aggregate("Vague", "many users")]);
        assert!(shown.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_aggregate_applies_floor() {
        let server = Arc::new(MemoryAggregationServer::with_aggregates(vec![
            aggregate("Small", "842 users"),
            aggregate("Large", "1,500 users"),
        ]));
        let aggregator = aggregator_with(server);

        let shown = aggregator
            .fetch_aggregate(&CohortProfile::default())
            .await
            .unwrap();
        assert_eq!(shown.len(), 1);
        assert_eq!(shown[0].title, "Large");
    }

    #[tokio::test]
    async fn test_contribute_without_consent_sends_nothing() {
        let server = Arc::new(MemoryAggregationServer::new());
        let aggregator = aggregator_with(server.clone());
        let insight =
            LocalInsight::new(InsightType::Trend, "steps", "energy", 0.2, Confidence::Low);

        let outcome = aggregator
            .contribute(&[insight], &consent(false))
            .await
            .unwrap();

        assert_eq!(outcome, ContributionOutcome::Skipped);
        assert!(server.received().is_empty());
    }

    #[tokio::test]
    async fn test_contribute_with_consent_sends_allow_listed_json() {
        let server = Arc::new(MemoryAggregationServer::new());
        let aggregator = aggregator_with(server.clone());
        let mut insight =
            LocalInsight::new(InsightType::Trend, "steps", "energy", 0.2, Confidence::Low);
        insight.user_id = Some("u-1".into());
        insight.timestamp = Some(Utc::now());

        let outcome = aggregator
            .contribute(&[insight], &consent(true))
            .await
            .unwrap();

        assert_eq!(outcome, ContributionOutcome::Submitted(1));
        let received = server.received();
        assert_eq!(received.len(), 1);
        assert!(received[0].get("userId").is_none());
        assert!(received[0].get("timestamp").is_none());
    }

    #[tokio::test]
    async fn test_contribute_retries_transient_failures() {
        let server = Arc::new(MemoryAggregationServer::new());
        server.fail_next(2);
        let aggregator = aggregator_with(server.clone());
        let insight =
            LocalInsight::new(InsightType::Pattern, "steps", "mood", 0.1, Confidence::Low);

        let outcome = aggregator
            .contribute(&[insight], &consent(true))
            .await
            .unwrap();
        assert_eq!(outcome, ContributionOutcome::Submitted(1));
    }

    #[tokio::test]
    async fn test_contribute_reports_exhausted_retries() {
        let server = Arc::new(MemoryAggregationServer::new());
        server.fail_next(10);
        let aggregator = aggregator_with(server.clone());
        let insight =
            LocalInsight::new(InsightType::Pattern, "steps", "mood", 0.1, Confidence::Low);

        let result = aggregator.contribute(&[insight], &consent(true)).await;
        assert!(matches!(
            result,
            Err(PrivacyError::Transport(RetryError::Exhausted { attempts: 3, .. }))
        ));
        assert!(server.received().is_empty());
    }
}
