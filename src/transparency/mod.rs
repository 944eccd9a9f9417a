//! Transparency module for the Synheart Privacy Engine.
//!
//! This module tracks what the engine has done with the user's data,
//! as counts only, so users can audit it without exposing any content.

pub mod log;

// Re-export commonly used types
pub use log::{
    create_shared_log, create_shared_log_with_persistence, SharedTransparencyLog, TransparencyLog,
    TransparencyStats,
};
