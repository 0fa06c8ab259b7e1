//! Raw records as they leave a source, before resolution
//!
//! A [`RawRecord`] carries everything the resolver needs and nothing it has
//! to re-fetch: file rows keep their header-mapped fields, registry rows keep
//! the typed API payload. Lines the source could not parse still flow through
//! the pipeline as [`RawRecord::Malformed`] so they end up in the failed-item
//! store instead of silently vanishing.

use crate::registry::RegistryEstablishment;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// One CSV row, keyed by the file's header names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub fields: HashMap<String, String>,
    /// 1-based data line (header excluded).
    pub line: u64,
    /// Byte offset of the row start, for resume cursors.
    pub byte_offset: u64,
}

impl FileRecord {
    /// Field lookup that treats missing and empty the same way.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }
}

/// A record pulled from a source, not yet resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RawRecord {
    File(FileRecord),
    Registry(RegistryEstablishment),
    /// A row the source could not decode. Kept so it can be persisted
    /// as a failed item with its position and the parser's message.
    Malformed { line: u64, error: String },
}

impl RawRecord {
    /// Human-oriented position of the record within its source.
    pub fn position(&self) -> String {
        match self {
            Self::File(r) => format!("line {}", r.line),
            Self::Registry(e) => format!("registry {}", e.establishment_id),
            Self::Malformed { line, .. } => format!("line {line}"),
        }
    }
}

/// Why a record could not be imported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The source could not decode the row at all.
    MalformedLine,
    /// No registry identifier and not enough data to mint a provisional one.
    MissingName,
    /// Registry payload without the mandatory identifier pair.
    MissingNaturalKey,
    /// A field exceeded the configured size ceiling.
    OversizedField,
    /// The registry refused the search expression before any call was made.
    QueryRejected,
    /// Transient registry failures outlasted the retry budget.
    RetriesExhausted,
    /// The batch write rejected this record even after the batch-level retry.
    WriteFailed,
}

impl std::str::FromStr for FailureReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "malformed_line" => Ok(Self::MalformedLine),
            "missing_name" => Ok(Self::MissingName),
            "missing_natural_key" => Ok(Self::MissingNaturalKey),
            "oversized_field" => Ok(Self::OversizedField),
            "query_rejected" => Ok(Self::QueryRejected),
            "retries_exhausted" => Ok(Self::RetriesExhausted),
            "write_failed" => Ok(Self::WriteFailed),
            other => Err(format!("unknown failure reason {other:?}")),
        }
    }
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MalformedLine => "malformed_line",
            Self::MissingName => "missing_name",
            Self::MissingNaturalKey => "missing_natural_key",
            Self::OversizedField => "oversized_field",
            Self::QueryRejected => "query_rejected",
            Self::RetriesExhausted => "retries_exhausted",
            Self::WriteFailed => "write_failed",
        }
    }
}

/// A record that failed import, persisted for later replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedItem {
    pub id: Uuid,
    pub source_id: String,
    pub reason: FailureReason,
    /// The raw record, serialized so `retry-failed` can re-run it.
    pub payload: serde_json::Value,
    pub detail: Option<String>,
    pub retry_count: i32,
    pub resolved: bool,
    pub created_at: DateTime<Utc>,
}

impl FailedItem {
    pub fn new(source_id: &str, reason: FailureReason, raw: &RawRecord) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_id: source_id.to_string(),
            reason,
            payload: serde_json::to_value(raw).unwrap_or(serde_json::Value::Null),
            detail: None,
            retry_count: 0,
            resolved: false,
            created_at: Utc::now(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}
