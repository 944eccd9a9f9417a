//! Configuration for the Synheart Privacy Engine.

use crate::privacy::InsightType;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Production PBKDF2 iteration count.
pub const DEFAULT_KDF_ITERATIONS: u32 = 100_000;

/// Minimum cohort size for an aggregate to be shown.
pub const DEFAULT_K_ANONYMITY_FLOOR: u64 = 1000;

/// Main configuration for the privacy engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Key derivation parameters
    pub kdf: KdfConfig,

    /// Differential privacy and k-anonymity parameters
    pub privacy: PrivacyConfig,

    /// Retry policy for remote effects
    pub retry: RetryConfig,

    /// Path for exported bundles
    pub export_path: PathBuf,

    /// Path for the encrypted vault and transparency log
    pub data_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("synheart-privacy-engine");

        Self {
            kdf: KdfConfig::default(),
            privacy: PrivacyConfig::default(),
            retry: RetryConfig::default(),
            export_path: data_dir.join("exports"),
            data_path: data_dir,
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from an explicit path, falling back to defaults.
    pub fn load_from(path: &std::path::Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let content =
                std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
            let config: Config = serde_json::from_str(&content)
                .map_err(|e| ConfigError::ParseError(e.to_string()))?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        let config_path = Self::config_path();

        // Ensure parent directory exists
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::IoError(e.to_string()))?;
        }

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(&config_path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("synheart-privacy-engine")
            .join("config.json")
    }

    /// Ensure all required directories exist.
    pub fn ensure_directories(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.export_path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;
        std::fs::create_dir_all(&self.data_path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;
        Ok(())
    }

    /// Directory holding one encrypted file per local record.
    pub fn vault_path(&self) -> PathBuf {
        self.data_path.join("vault")
    }

    /// Path of the persisted transparency counters.
    pub fn transparency_path(&self) -> PathBuf {
        self.data_path.join("transparency.json")
    }

    /// Reject values that would break a privacy guarantee outright.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.kdf.iterations == 0 {
            return Err(ConfigError::Invalid("kdf.iterations must be > 0".into()));
        }
        if !(self.privacy.impact_sensitivity > 0.0) {
            return Err(ConfigError::Invalid(
                "privacy.impact_sensitivity must be > 0".into(),
            ));
        }
        if !(self.privacy.default_epsilon > 0.0)
            || self.privacy.epsilon_by_type.values().any(|e| !(*e > 0.0))
        {
            return Err(ConfigError::Invalid("privacy epsilon must be > 0".into()));
        }
        if self.privacy.impact_bounds.0 >= self.privacy.impact_bounds.1 {
            return Err(ConfigError::Invalid(
                "privacy.impact_bounds must be an increasing range".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be > 0".into()));
        }
        Ok(())
    }
}

/// Key derivation parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KdfConfig {
    /// PBKDF2-HMAC-SHA256 iteration count
    pub iterations: u32,
}

impl Default for KdfConfig {
    fn default() -> Self {
        Self {
            iterations: DEFAULT_KDF_ITERATIONS,
        }
    }
}

/// Parameters for contribution noise and aggregate gating.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrivacyConfig {
    /// Smallest cohort an aggregate may describe
    pub k_anonymity_floor: u64,
    /// Laplace sensitivity of the `impact` field
    pub impact_sensitivity: f64,
    /// Bounds the true `impact` is clamped to before noise is added
    pub impact_bounds: (f64, f64),
    /// Privacy budget used when a type has no override
    pub default_epsilon: f64,
    /// Per-insight-type privacy budget
    #[serde(default)]
    pub epsilon_by_type: HashMap<InsightType, f64>,
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        Self {
            k_anonymity_floor: DEFAULT_K_ANONYMITY_FLOOR,
            impact_sensitivity: 1.0,
            impact_bounds: (-1.0, 1.0),
            default_epsilon: 1.0,
            epsilon_by_type: HashMap::new(),
        }
    }
}

impl PrivacyConfig {
    /// Privacy budget for one contribution of the given type.
    pub fn epsilon_for(&self, insight_type: InsightType) -> f64 {
        self.epsilon_by_type
            .get(&insight_type)
            .copied()
            .unwrap_or(self.default_epsilon)
    }
}

/// Retry policy for network-facing effects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first
    pub max_attempts: u32,
    /// Delay before the first retry
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,
    /// Upper bound on any single backoff
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
    /// Timeout applied to each attempt
    #[serde(with = "duration_millis")]
    pub attempt_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            attempt_timeout: Duration::from_secs(10),
        }
    }
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    IoError(String),
    ParseError(String),
    SerializeError(String),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "IO error: {e}"),
            ConfigError::ParseError(e) => write!(f, "Parse error: {e}"),
            ConfigError::SerializeError(e) => write!(f, "Serialize error: {e}"),
            ConfigError::Invalid(e) => write!(f, "Invalid configuration: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Serde support for Duration as milliseconds.
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.kdf.iterations, 100_000);
        assert_eq!(config.privacy.k_anonymity_floor, 1000);
        assert_eq!(config.privacy.impact_sensitivity, 1.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_epsilon_override() {
        let mut privacy = PrivacyConfig::default();
        privacy.epsilon_by_type.insert(InsightType::Trend, 0.5);

        assert_eq!(privacy.epsilon_for(InsightType::Trend), 0.5);
        assert_eq!(privacy.epsilon_for(InsightType::Correlation), 1.0);
    }

    #[test]
    fn test_config_json_roundtrip_keeps_overrides() {
        let mut config = Config::default();
        config.privacy.k_anonymity_floor = 5;
        config.privacy.epsilon_by_type.insert(InsightType::Pattern, 0.25);
        config.retry.base_delay = Duration::from_millis(1);

        let json = serde_json::to_string(&config).unwrap();
        let parsed: Config = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.privacy.k_anonymity_floor, 5);
        assert_eq!(parsed.privacy.epsilon_for(InsightType::Pattern), 0.25);
        assert_eq!(parsed.retry.base_delay, Duration::from_millis(1));
    }

    #[test]
    fn test_validate_rejects_nonpositive_epsilon() {
        let mut config = Config::default();
        config.privacy.default_epsilon = 0.0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_load_from_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config.kdf.iterations, DEFAULT_KDF_ITERATIONS);
    }
}
