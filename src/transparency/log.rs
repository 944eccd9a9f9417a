//! Privacy-preserving transparency log.
//!
//! Counts every protective action the engine takes. Only counters are kept:
//! no record ids, contents, or key material ever reach this log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Transparency counters for the current session.
#[derive(Debug)]
pub struct TransparencyLog {
    /// Records encrypted into the local vault
    records_encrypted: AtomicU64,
    /// Records decrypted from the local vault
    records_decrypted: AtomicU64,
    /// Envelopes sealed for cloud sync
    envelopes_sealed: AtomicU64,
    /// Ciphertexts or envelopes that failed authentication
    integrity_rejections: AtomicU64,
    /// Anonymized contributions sent to the aggregation server
    contributions_sent: AtomicU64,
    /// Contribution batches skipped because consent was off
    contributions_skipped: AtomicU64,
    /// Aggregates shown to the user
    aggregates_accepted: AtomicU64,
    /// Aggregates withheld for falling below the cohort floor
    aggregates_rejected: AtomicU64,
    /// Remote copies deleted
    remote_purges: AtomicU64,
    /// Session start time
    session_start: DateTime<Utc>,
    /// Path for persisting stats
    persist_path: Option<PathBuf>,
}

impl TransparencyLog {
    /// Create a new transparency log.
    pub fn new() -> Self {
        Self {
            records_encrypted: AtomicU64::new(0),
            records_decrypted: AtomicU64::new(0),
            envelopes_sealed: AtomicU64::new(0),
            integrity_rejections: AtomicU64::new(0),
            contributions_sent: AtomicU64::new(0),
            contributions_skipped: AtomicU64::new(0),
            aggregates_accepted: AtomicU64::new(0),
            aggregates_rejected: AtomicU64::new(0),
            remote_purges: AtomicU64::new(0),
            session_start: Utc::now(),
            persist_path: None,
        }
    }

    /// Create a transparency log with persistence.
    pub fn with_persistence(path: PathBuf) -> Self {
        let mut log = Self::new();
        log.persist_path = Some(path);

        // Try to load existing stats
        if let Err(e) = log.load() {
            tracing::warn!("Could not load previous transparency stats: {e}");
        }

        log
    }

    pub fn record_encrypted(&self) {
        self.records_encrypted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decrypted(&self) {
        self.records_decrypted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sealed(&self) {
        self.envelopes_sealed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a ciphertext or envelope that failed closed.
    pub fn record_rejected(&self) {
        self.integrity_rejections.fetch_add(1, Ordering::Relaxed);
    }

    /// Record contributions sent in one batch.
    pub fn record_contributions_sent(&self, count: u64) {
        self.contributions_sent.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_contributions_skipped(&self) {
        self.contributions_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_aggregates(&self, accepted: u64, rejected: u64) {
        self.aggregates_accepted
            .fetch_add(accepted, Ordering::Relaxed);
        self.aggregates_rejected
            .fetch_add(rejected, Ordering::Relaxed);
    }

    /// Record remote envelopes deleted.
    pub fn record_remote_purged(&self, count: u64) {
        self.remote_purges.fetch_add(count, Ordering::Relaxed);
    }

    /// Get the current statistics.
    pub fn stats(&self) -> TransparencyStats {
        TransparencyStats {
            records_encrypted: self.records_encrypted.load(Ordering::Relaxed),
            records_decrypted: self.records_decrypted.load(Ordering::Relaxed),
            envelopes_sealed: self.envelopes_sealed.load(Ordering::Relaxed),
            integrity_rejections: self.integrity_rejections.load(Ordering::Relaxed),
            contributions_sent: self.contributions_sent.load(Ordering::Relaxed),
            contributions_skipped: self.contributions_skipped.load(Ordering::Relaxed),
            aggregates_accepted: self.aggregates_accepted.load(Ordering::Relaxed),
            aggregates_rejected: self.aggregates_rejected.load(Ordering::Relaxed),
            remote_purges: self.remote_purges.load(Ordering::Relaxed),
            session_start: self.session_start,
            session_duration_secs: (Utc::now() - self.session_start).num_seconds().max(0) as u64,
        }
    }

    /// Get a summary string for display.
    pub fn summary(&self) -> String {
        let stats = self.stats();
        format!(
            "Privacy Activity:\n\
             - Records encrypted: {}\n\
             - Records decrypted: {}\n\
             - Envelopes sealed for sync: {}\n\
             - Integrity rejections: {}\n\
             - Anonymous contributions sent: {}\n\
             - Contribution batches skipped (no consent): {}\n\
             - Aggregates shown: {}\n\
             - Aggregates withheld (cohort too small): {}\n\
             - Remote copies deleted: {}\n\
             \n\
             Privacy Guarantee:\n\
             - Plaintext never leaves this device\n\
             - Contributions carry no identifiers and are noised\n\
             - Aggregates from small cohorts are never shown",
            stats.records_encrypted,
            stats.records_decrypted,
            stats.envelopes_sealed,
            stats.integrity_rejections,
            stats.contributions_sent,
            stats.contributions_skipped,
            stats.aggregates_accepted,
            stats.aggregates_rejected,
            stats.remote_purges,
        )
    }

    /// Save stats to disk.
    pub fn save(&self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            // Ensure parent directory exists
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let stats = self.stats();
            let persisted = PersistedStats {
                records_encrypted: stats.records_encrypted,
                records_decrypted: stats.records_decrypted,
                envelopes_sealed: stats.envelopes_sealed,
                integrity_rejections: stats.integrity_rejections,
                contributions_sent: stats.contributions_sent,
                contributions_skipped: stats.contributions_skipped,
                aggregates_accepted: stats.aggregates_accepted,
                aggregates_rejected: stats.aggregates_rejected,
                remote_purges: stats.remote_purges,
                last_updated: Utc::now(),
            };

            let json = serde_json::to_string_pretty(&persisted).map_err(std::io::Error::other)?;

            std::fs::write(path, json)?;
        }
        Ok(())
    }

    /// Load stats from disk.
    fn load(&mut self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if path.exists() {
                let content = std::fs::read_to_string(path)?;
                let p: PersistedStats =
                    serde_json::from_str(&content).map_err(std::io::Error::other)?;

                self.records_encrypted
                    .store(p.records_encrypted, Ordering::Relaxed);
                self.records_decrypted
                    .store(p.records_decrypted, Ordering::Relaxed);
                self.envelopes_sealed
                    .store(p.envelopes_sealed, Ordering::Relaxed);
                self.integrity_rejections
                    .store(p.integrity_rejections, Ordering::Relaxed);
                self.contributions_sent
                    .store(p.contributions_sent, Ordering::Relaxed);
                self.contributions_skipped
                    .store(p.contributions_skipped, Ordering::Relaxed);
                self.aggregates_accepted
                    .store(p.aggregates_accepted, Ordering::Relaxed);
                self.aggregates_rejected
                    .store(p.aggregates_rejected, Ordering::Relaxed);
                self.remote_purges.store(p.remote_purges, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    /// Reset all counters and remove the persisted copy.
    pub fn reset(&self) -> Result<(), std::io::Error> {
        for counter in [
            &self.records_encrypted,
            &self.records_decrypted,
            &self.envelopes_sealed,
            &self.integrity_rejections,
            &self.contributions_sent,
            &self.contributions_skipped,
            &self.aggregates_accepted,
            &self.aggregates_rejected,
            &self.remote_purges,
        ] {
            counter.store(0, Ordering::Relaxed);
        }

        if let Some(ref path) = self.persist_path {
            if path.exists() {
                std::fs::remove_file(path)?;
            }
        }
        Ok(())
    }
}

impl Default for TransparencyLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of transparency statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransparencyStats {
    pub records_encrypted: u64,
    pub records_decrypted: u64,
    pub envelopes_sealed: u64,
    pub integrity_rejections: u64,
    pub contributions_sent: u64,
    pub contributions_skipped: u64,
    pub aggregates_accepted: u64,
    pub aggregates_rejected: u64,
    pub remote_purges: u64,
    pub session_start: DateTime<Utc>,
    pub session_duration_secs: u64,
}

/// Stats format for persistence.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedStats {
    records_encrypted: u64,
    records_decrypted: u64,
    envelopes_sealed: u64,
    integrity_rejections: u64,
    contributions_sent: u64,
    contributions_skipped: u64,
    aggregates_accepted: u64,
    aggregates_rejected: u64,
    remote_purges: u64,
    last_updated: DateTime<Utc>,
}

/// Thread-safe shared transparency log.
pub type SharedTransparencyLog = Arc<TransparencyLog>;

/// Create a new shared transparency log.
pub fn create_shared_log() -> SharedTransparencyLog {
    Arc::new(TransparencyLog::new())
}

/// Create a new shared transparency log with persistence.
pub fn create_shared_log_with_persistence(path: PathBuf) -> SharedTransparencyLog {
    Arc::new(TransparencyLog::with_persistence(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transparency_log_counting() {
        let log = TransparencyLog::new();

        log.record_encrypted();
        log.record_encrypted();
        log.record_sealed();
        log.record_aggregates(2, 3);

        let stats = log.stats();
        assert_eq!(stats.records_encrypted, 2);
        assert_eq!(stats.envelopes_sealed, 1);
        assert_eq!(stats.aggregates_accepted, 2);
        assert_eq!(stats.aggregates_rejected, 3);
    }

    #[test]
    fn test_transparency_log_reset() {
        let log = TransparencyLog::new();

        log.record_contributions_sent(10);
        log.record_remote_purged(4);
        log.reset().unwrap();

        let stats = log.stats();
        assert_eq!(stats.contributions_sent, 0);
        assert_eq!(stats.remote_purges, 0);
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transparency.json");

        let log = TransparencyLog::with_persistence(path.clone());
        log.record_encrypted();
        log.record_rejected();
        log.save().unwrap();

        let reloaded = TransparencyLog::with_persistence(path.clone());
        assert_eq!(reloaded.stats().records_encrypted, 1);
        assert_eq!(reloaded.stats().integrity_rejections, 1);

        reloaded.reset().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_summary_format() {
        let log = TransparencyLog::new();
        let summary = log.summary();

        assert!(summary.contains("Records encrypted"));
        assert!(summary.contains("Aggregates withheld"));
        assert!(summary.contains("Privacy Guarantee"));
    }
}
