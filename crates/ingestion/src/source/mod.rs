//! Record sources feeding the import pipeline
//!
//! A source hides where records come from (a CSV export on disk, the
//! paginated registry API) behind one pull interface. Sources also expose a
//! resume cursor: the pipeline persists it with each committed batch and
//! hands it back through [`RecordSource::seek`] on the next run.

mod file;
mod registry;

pub use file::FileSource;
pub use registry::RegistrySource;

use crate::record::RawRecord;
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Opaque resume position within a source.
///
/// Cursors are serialized into the checkpoint table, so the variants are
/// tagged and additive only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceCursor {
    /// Fresh source, nothing consumed yet.
    Start,
    /// File sources: byte offset of the next unread row.
    ByteOffset { offset: u64 },
    /// Paginated API sources: the server-issued continuation token plus a
    /// monotonic record count for progress comparison.
    Page {
        next_cursor: Option<String>,
        records_seen: u64,
    },
}

impl SourceCursor {
    /// Monotonic position used to order two cursors of the same source.
    pub fn position(&self) -> u64 {
        match self {
            Self::Start => 0,
            Self::ByteOffset { offset } => *offset,
            Self::Page { records_seen, .. } => *records_seen,
        }
    }
}

/// A pull-based stream of raw records with resume support.
#[async_trait]
pub trait RecordSource: Send {
    /// Stable identifier, also the checkpoint key (`file:<path>`,
    /// `registry:<query>`).
    fn source_id(&self) -> &str;

    /// Next record, or `None` once the source is exhausted. Undecodable
    /// rows are returned as [`RawRecord::Malformed`], not errors; `Err`
    /// means the source itself broke (I/O failure, retry budget spent).
    async fn next(&mut self) -> Result<Option<RawRecord>>;

    /// Cursor pointing just past the last record handed out.
    fn cursor(&self) -> SourceCursor;

    /// Position the source at a previously saved cursor.
    async fn seek(&mut self, cursor: &SourceCursor) -> Result<()>;
}
