//! Data portability and the right to erasure.

use crate::consent::ConsentManager;
use crate::crypto::{DecryptError, LocalVault};
use crate::records::DataClass;
use crate::retry::RemoteEffect;
use crate::session::{KeysNotInitialized, SharedSession};
use crate::storage::{LocalStore, RecordId, StoreError};
use crate::transparency::SharedTransparencyLog;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::fmt::Write as _;
use std::sync::Arc;

/// The phrase `delete_everything` requires, exactly as written.
pub const REQUIRED_CONFIRMATION_PHRASE: &str = "DELETE ALL MY DATA";

/// Export serializations. All of them carry the same fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    /// One JSON document
    Json,
    /// One JSON object per field, one per line
    JsonLines,
    /// `record_id,data_class,field,value` rows
    Csv,
    /// Plain-text report for reading or printing
    Document,
}

impl ExportFormat {
    /// File extension for this format.
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::JsonLines => "jsonl",
            ExportFormat::Csv => "csv",
            ExportFormat::Document => "txt",
        }
    }
}

impl std::str::FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "jsonl" | "json-lines" | "jsonlines" => Ok(ExportFormat::JsonLines),
            "csv" => Ok(ExportFormat::Csv),
            "document" | "doc" | "text" | "txt" => Ok(ExportFormat::Document),
            other => Err(format!("Unknown export format: {other}")),
        }
    }
}

/// The confirmation phrase did not match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationError {
    Mismatch,
}

impl std::fmt::Display for ConfirmationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Confirmation phrase does not match; type \"{REQUIRED_CONFIRMATION_PHRASE}\" exactly"
        )
    }
}

impl std::error::Error for ConfirmationError {}

/// Lifecycle errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    Confirmation(ConfirmationError),
    KeysNotInitialized,
    /// A stored record could not be decrypted; nothing was exported
    Decrypt { record: RecordId, error: DecryptError },
    Store(StoreError),
    Serialization(String),
}

impl std::fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleError::Confirmation(e) => write!(f, "{e}"),
            LifecycleError::KeysNotInitialized => write!(f, "{KeysNotInitialized}"),
            LifecycleError::Decrypt { record, error } => {
                write!(f, "Could not decrypt record {record}: {error}")
            }
            LifecycleError::Store(e) => write!(f, "Storage error: {e}"),
            LifecycleError::Serialization(e) => write!(f, "Export serialization failed: {e}"),
        }
    }
}

impl std::error::Error for LifecycleError {}

impl From<ConfirmationError> for LifecycleError {
    fn from(e: ConfirmationError) -> Self {
        LifecycleError::Confirmation(e)
    }
}

impl From<StoreError> for LifecycleError {
    fn from(e: StoreError) -> Self {
        LifecycleError::Store(e)
    }
}

/// Outcome of `delete_everything`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub struct DeletionReport {
    pub local_records_erased: usize,
    /// Set if some local records could not be erased
    pub local_error: Option<StoreError>,
    pub remote: RemoteEffect,
}

impl DeletionReport {
    /// Whether local and remote data are both confirmed gone.
    pub fn is_complete(&self) -> bool {
        self.local_error.is_none() && !self.remote.is_pending()
    }
}

/// One exported field of one record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportRow {
    pub record_id: RecordId,
    pub data_class: DataClass,
    pub field: String,
    pub value: Value,
}

impl ExportRow {
    /// The value as plain text: strings unquoted, everything else as JSON.
    fn value_text(&self) -> String {
        match &self.value {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

#[derive(Serialize)]
struct JsonBundle<'a> {
    account_id: &'a str,
    exported_at: DateTime<Utc>,
    record_count: usize,
    records: Vec<JsonRecord<'a>>,
}

#[derive(Serialize)]
struct JsonRecord<'a> {
    record_id: &'a RecordId,
    data_class: DataClass,
    fields: serde_json::Map<String, Value>,
}

/// Export and deletion over the local and remote stores.
pub struct LifecycleManager {
    account_id: String,
    session: SharedSession,
    vault: LocalVault,
    local: Arc<dyn LocalStore>,
    consent: Arc<ConsentManager>,
    log: SharedTransparencyLog,
}

impl LifecycleManager {
    pub fn new(
        account_id: impl Into<String>,
        session: SharedSession,
        vault: LocalVault,
        local: Arc<dyn LocalStore>,
        consent: Arc<ConsentManager>,
        log: SharedTransparencyLog,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            session,
            vault,
            local,
            consent,
            log,
        }
    }

    /// Decrypt every local record and flatten it into one row per field.
    ///
    /// Fails closed: one undecryptable record aborts the whole export.
    pub fn export_rows(&self) -> Result<Vec<ExportRow>, LifecycleError> {
        if !self.session.is_unlocked() {
            return Err(LifecycleError::KeysNotInitialized);
        }

        let mut rows = Vec::new();
        for (id, ciphertext) in self.local.list()? {
            let record = self
                .vault
                .decrypt_any(&ciphertext)
                .map_err(|error| match error {
                    DecryptError::KeysNotInitialized => LifecycleError::KeysNotInitialized,
                    error => LifecycleError::Decrypt {
                        record: id.clone(),
                        error,
                    },
                })?;

            let class = record.data_class();
            match record.body() {
                Value::Object(fields) => {
                    rows.extend(fields.into_iter().map(|(field, value)| ExportRow {
                        record_id: id.clone(),
                        data_class: class,
                        field,
                        value,
                    }))
                }
                value => rows.push(ExportRow {
                    record_id: id.clone(),
                    data_class: class,
                    field: "value".to_string(),
                    value,
                }),
            }
        }
        Ok(rows)
    }

    /// Export every local record in the chosen format.
    pub fn export_all(&self, format: ExportFormat) -> Result<String, LifecycleError> {
        let rows = self.export_rows()?;
        let output = match format {
            ExportFormat::Json => self.render_json(&rows)?,
            ExportFormat::JsonLines => render_json_lines(&rows)?,
            ExportFormat::Csv => render_csv(&rows),
            ExportFormat::Document => self.render_document(&rows),
        };
        tracing::info!(?format, fields = rows.len(), "Exported local data");
        Ok(output)
    }

    /// Erase all local and remote data and lock the session.
    ///
    /// Once the phrase matches, local erasure, the session lock and the
    /// remote purge are all attempted even if an earlier step fails. The
    /// purge is queued on the consent manager and the session locked before
    /// anything is awaited, so dropping the future leaves no live keys and
    /// no forgotten remote copies.
    pub async fn delete_everything(
        &self,
        confirmation_phrase: &str,
    ) -> Result<DeletionReport, LifecycleError> {
        if confirmation_phrase != REQUIRED_CONFIRMATION_PHRASE {
            tracing::info!("Deletion not confirmed");
            return Err(ConfirmationError::Mismatch.into());
        }

        let (local_records_erased, local_error) = match self.local.erase_all() {
            Ok(count) => {
                tracing::info!(count, "Local records erased");
                (count, None)
            }
            Err(e) => {
                tracing::error!(error = %e, "Local erasure incomplete");
                (0, Some(e))
            }
        };

        self.consent.queue_remote_purge();
        self.session.lock();
        self.consent.reset();
        if let Err(e) = self.log.reset() {
            tracing::warn!(error = %e, "Could not remove persisted transparency stats");
        }

        let remote = self.consent.purge_remote().await;
        if let RemoteEffect::Pending(e) = &remote {
            tracing::warn!(error = %e, "Remote deletion pending");
        }

        Ok(DeletionReport {
            local_records_erased,
            local_error,
            remote,
        })
    }

    fn render_json(&self, rows: &[ExportRow]) -> Result<String, LifecycleError> {
        let mut records: Vec<JsonRecord<'_>> = Vec::new();
        for row in rows {
            match records.last_mut() {
                Some(last) if last.record_id == &row.record_id => {
                    last.fields.insert(row.field.clone(), row.value.clone());
                }
                _ => {
                    let mut fields = serde_json::Map::new();
                    fields.insert(row.field.clone(), row.value.clone());
                    records.push(JsonRecord {
                        record_id: &row.record_id,
                        data_class: row.data_class,
                        fields,
                    });
                }
            }
        }

        let bundle = JsonBundle {
            account_id: &self.account_id,
            exported_at: Utc::now(),
            record_count: records.len(),
            records,
        };
        serde_json::to_string_pretty(&bundle)
            .map_err(|e| LifecycleError::Serialization(e.to_string()))
    }

    fn render_document(&self, rows: &[ExportRow]) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Synheart Data Export");
        let _ = writeln!(out, "====================");
        let _ = writeln!(out, "Account:  {}", self.account_id);
        let _ = writeln!(out, "Exported: {}", Utc::now().to_rfc3339());

        let mut current: Option<&RecordId> = None;
        for row in rows {
            if current != Some(&row.record_id) {
                let _ = writeln!(out);
                let _ = writeln!(out, "[{}] {}", row.data_class, row.record_id);
                current = Some(&row.record_id);
            }
            let _ = writeln!(out, "  {}: {}", row.field, row.value_text());
        }

        if rows.is_empty() {
            let _ = writeln!(out);
            let _ = writeln!(out, "No records stored.");
        }
        out
    }
}

fn render_json_lines(rows: &[ExportRow]) -> Result<String, LifecycleError> {
    let mut out = String::new();
    for row in rows {
        let line =
            serde_json::to_string(row).map_err(|e| LifecycleError::Serialization(e.to_string()))?;
        out.push_str(&line);
        out.push('\n');
    }
    Ok(out)
}

fn render_csv(rows: &[ExportRow]) -> String {
    let mut out = String::from("record_id,data_class,field,value\n");
    for row in rows {
        let _ = writeln!(
            out,
            "{},{},{},{}",
            csv_escape(row.record_id.as_str()),
            row.data_class,
            csv_escape(&row.field),
            csv_escape(&row.value_text())
        );
    }
    out
}

fn csv_escape(field: &str) -> String {
    if field.contains(|c| matches!(c, ',' | '"' | '\n' | '\r')) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}
