//! Synheart Privacy Engine - Local-first protection for personal wellness data.
//!
//! This library keeps check-ins, journal entries and settings encrypted on
//! the device, syncs only authenticated ciphertext to the cloud, and shares
//! population insights only through differential privacy and k-anonymity.
//!
//! # Privacy Guarantees
//!
//! - **Encrypted at rest**: Every stored record is AES-256-GCM encrypted under a key derived from the user's secret
//! - **Zero-knowledge sync**: The cloud stores envelopes it has no key for
//! - **Noised contributions**: Only five allow-listed fields leave the device, with Laplace noise on `impact`
//! - **Cohort floor**: Aggregates describing fewer than 1000 people are never shown
//! - **Consent first**: Nothing is synced or contributed until the user opts in
//! - **Transparency**: Every protective action is counted and auditable
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                   Synheart Privacy Engine                     │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐   ┌─────────────┐   ┌─────────────┐         │
//! │  │   Session   │──▶│ LocalVault  │──▶│ LocalStore  │         │
//! │  │  (KeySet)   │   │ (per class) │   │ (on device) │         │
//! │  └─────────────┘   └─────────────┘   └─────────────┘         │
//! │         │                                                    │
//! │         ▼                                                    │
//! │  ┌─────────────┐   ┌─────────────┐   ┌─────────────┐         │
//! │  │  SyncCodec  │──▶│  CloudSync  │──▶│ RemoteStore │         │
//! │  │ (envelopes) │   │  (consent)  │   │   (cloud)   │         │
//! │  └─────────────┘   └─────────────┘   └─────────────┘         │
//! │                                                              │
//! │  ┌─────────────┐   ┌─────────────┐   ┌─────────────┐         │
//! │  │   Consent   │   │ Aggregator  │   │  Lifecycle  │         │
//! │  │   Manager   │   │ (DP + k-an) │   │(export/del) │         │
//! │  └─────────────┘   └─────────────┘   └─────────────┘         │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use synheart_privacy_engine::{
//!     engine::{Collaborators, PrivacyEngine},
//!     privacy::MemoryAggregationServer,
//!     records::JournalEntry,
//!     storage::{MemoryLocalStore, MemoryRemoteStore},
//!     transparency::create_shared_log,
//!     Config,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = PrivacyEngine::new(
//!     &Config::default(),
//!     "acct-1",
//!     Collaborators {
//!         local: Arc::new(MemoryLocalStore::new()),
//!         remote: Arc::new(MemoryRemoteStore::new()),
//!         server: Arc::new(MemoryAggregationServer::new()),
//!     },
//!     create_shared_log(),
//! );
//!
//! engine.unlock("p@ss1234")?;
//! let stored = engine.store_record(&JournalEntry::new("today was good")).await?;
//! let entry: Option<JournalEntry> = engine.load_record(&stored.id)?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod consent;
pub mod crypto;
pub mod engine;
pub mod lifecycle;
pub mod privacy;
pub mod records;
pub mod retry;
pub mod session;
pub mod storage;
pub mod sync;
pub mod transparency;

#[cfg(feature = "cloud")]
pub mod cloud;

// Re-export key types at crate root for convenience
pub use config::Config;
pub use consent::{ConsentManager, ConsentRecord, ConsentUpdate};
pub use crypto::{CloudEnvelope, KeyManager, KeySet, LocalCiphertext, LocalVault, SyncCodec};
pub use engine::{Collaborators, EngineError, PrivacyEngine};
pub use lifecycle::{
    DeletionReport, ExportFormat, LifecycleManager, REQUIRED_CONFIRMATION_PHRASE,
};
pub use privacy::{AggregateInsight, InsightContribution, LocalInsight, PrivacyAggregator};
pub use records::{CheckIn, DataClass, JournalEntry, Record};
pub use retry::{RemoteEffect, RetryPolicy};
pub use session::{Session, SharedSession};
pub use transparency::{SharedTransparencyLog, TransparencyLog, TransparencyStats};

// Cloud re-exports (when enabled)
#[cfg(feature = "cloud")]
pub use cloud::{CloudClient, CloudConfig};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Privacy declaration that can be displayed to users.
pub const PRIVACY_DECLARATION: &str = r#"
╔══════════════════════════════════════════════════════════════════╗
║          SYNHEART PRIVACY ENGINE - PRIVACY DECLARATION           ║
╠══════════════════════════════════════════════════════════════════╣
║                                                                  ║
║  Your check-ins and journal stay on this device, encrypted.      ║
║                                                                  ║
║  ✓ WHAT WE DO:                                                   ║
║    • Encrypt every record with a key only your secret unlocks    ║
║    • Sync to the cloud only if you opt in, and only ciphertext   ║
║    • Share insights only if you opt in, with noise added         ║
║    • Show group insights only for groups of 1000+ people         ║
║                                                                  ║
║  ✗ WHAT WE NEVER DO:                                             ║
║    • Send your journal or check-ins in readable form             ║
║    • Send your user id, device id or timestamps with insights    ║
║    • Keep your secret or keys anywhere but memory                ║
║                                                                  ║
║  Export everything anytime with:                                 ║
║    synheart-privacy export --format json                         ║
║                                                                  ║
║  Delete everything with:                                         ║
║    synheart-privacy delete --confirm "DELETE ALL MY DATA"        ║
║                                                                  ║
╚══════════════════════════════════════════════════════════════════╝
"#;
