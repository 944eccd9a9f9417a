//! Typed wellness records and their data classes.
//!
//! Every record that crosses the vault boundary has a fixed schema and a
//! fixed [`DataClass`], which decides the key it is encrypted under.

use crate::consent::{ConsentRecord, PendingPurge};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Class of a stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataClass {
    CheckIn,
    Journal,
    Settings,
}

impl DataClass {
    /// All classes, in export order.
    pub const ALL: [DataClass; 3] = [DataClass::CheckIn, DataClass::Journal, DataClass::Settings];

    /// Stable label, also bound into ciphertexts as associated data.
    pub fn as_str(&self) -> &'static str {
        match self {
            DataClass::CheckIn => "check_in",
            DataClass::Journal => "journal",
            DataClass::Settings => "settings",
        }
    }
}

impl std::fmt::Display for DataClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A record type with a fixed schema and data class.
pub trait Record: Serialize + DeserializeOwned {
    const CLASS: DataClass;
}

/// A daily wellness check-in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckIn {
    /// Self-reported mood (1-5)
    pub mood: u8,
    /// Self-reported energy (1-5)
    pub energy: u8,
    /// Hours slept the previous night
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sleep_hours: Option<f32>,
    /// Free-form tags, e.g. "workout"
    #[serde(default)]
    pub tags: Vec<String>,
    pub recorded_at: DateTime<Utc>,
}

impl CheckIn {
    pub fn new(mood: u8, energy: u8) -> Self {
        Self {
            mood: mood.clamp(1, 5),
            energy: energy.clamp(1, 5),
            sleep_hours: None,
            tags: Vec::new(),
            recorded_at: Utc::now(),
        }
    }
}

impl Record for CheckIn {
    const CLASS: DataClass = DataClass::CheckIn;
}

/// A private journal entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JournalEntry {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub written_at: Option<DateTime<Utc>>,
}

impl JournalEntry {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            written_at: None,
        }
    }
}

impl Record for JournalEntry {
    const CLASS: DataClass = DataClass::Journal;
}

impl Record for ConsentRecord {
    const CLASS: DataClass = DataClass::Settings;
}

impl Record for PendingPurge {
    const CLASS: DataClass = DataClass::Settings;
}

/// Any settings-class record. The strict schemas tell them apart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingsRecord {
    Consent(ConsentRecord),
    PendingPurge(PendingPurge),
}

/// Any decrypted record, tagged by class.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "data_class", content = "record", rename_all = "snake_case")]
pub enum VaultRecord {
    CheckIn(CheckIn),
    Journal(JournalEntry),
    Settings(SettingsRecord),
}

impl VaultRecord {
    pub fn data_class(&self) -> DataClass {
        match self {
            VaultRecord::CheckIn(_) => DataClass::CheckIn,
            VaultRecord::Journal(_) => DataClass::Journal,
            VaultRecord::Settings(_) => DataClass::Settings,
        }
    }

    /// Parse a plaintext of the given class into its schema.
    pub(crate) fn from_plaintext(
        class: DataClass,
        plaintext: &[u8],
    ) -> Result<Self, serde_json::Error> {
        Ok(match class {
            DataClass::CheckIn => VaultRecord::CheckIn(serde_json::from_slice(plaintext)?),
            DataClass::Journal => VaultRecord::Journal(serde_json::from_slice(plaintext)?),
            DataClass::Settings => VaultRecord::Settings(serde_json::from_slice(plaintext)?),
        })
    }

    /// The record body as a JSON value, without the class tag.
    pub fn body(&self) -> serde_json::Value {
        let value = match self {
            VaultRecord::CheckIn(r) => serde_json::to_value(r),
            VaultRecord::Journal(r) => serde_json::to_value(r),
            VaultRecord::Settings(r) => serde_json::to_value(r),
        };
        value.unwrap_or(serde_json::Value::Null)
    }
}
