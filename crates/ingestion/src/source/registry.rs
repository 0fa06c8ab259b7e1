//! Page-buffered source over the registry search API
//!
//! Fetches one page at a time, filters it down to active establishments
//! and hands records out individually. The cursor carries the server's
//! continuation token, so a resumed run re-enters exactly where the last
//! committed batch left off.

use crate::record::RawRecord;
use crate::registry::{RegistryClient, SearchQuery};
use crate::source::{RecordSource, SourceCursor};
use crate::{IngestionError, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

pub const DEFAULT_PAGE_SIZE: u32 = 200;

pub struct RegistrySource {
    client: Arc<RegistryClient>,
    query: SearchQuery,
    page_size: u32,
    source_id: String,
    buffer: VecDeque<crate::registry::RegistryEstablishment>,
    /// Token that fetched the page currently in the buffer.
    page_cursor: Option<String>,
    /// Token for the page after the buffered one; `None` after the first
    /// fetch means the result set is exhausted.
    next_cursor: Option<String>,
    started: bool,
    records_seen: u64,
}

impl RegistrySource {
    pub fn new(client: Arc<RegistryClient>, query: SearchQuery) -> Result<Self> {
        query.validate()?;
        let source_id = format!("registry:{}", query.to_expression());
        Ok(Self {
            client,
            query,
            page_size: DEFAULT_PAGE_SIZE,
            source_id,
            buffer: VecDeque::new(),
            page_cursor: None,
            next_cursor: None,
            started: false,
            records_seen: 0,
        })
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    async fn refill(&mut self) -> Result<()> {
        self.page_cursor = self.next_cursor.clone();
        let page = self
            .client
            .fetch_page(&self.query, self.next_cursor.as_deref(), self.page_size)
            .await?;

        let fetched = page.establishments.len();
        // Inactive establishments are skipped here rather than resolved
        // and rejected later; they are expected, not failures.
        let buffered = self.buffer.len();
        self.buffer.extend(page.establishments.into_iter().filter(|e| e.active));
        let kept = self.buffer.len() - buffered;

        debug!(fetched, kept, has_next = page.next_cursor.is_some(), "registry page buffered");

        self.next_cursor = page.next_cursor;
        self.started = true;
        Ok(())
    }

    fn exhausted(&self) -> bool {
        self.started && self.next_cursor.is_none()
    }
}

#[async_trait]
impl RecordSource for RegistrySource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn next(&mut self) -> Result<Option<RawRecord>> {
        while self.buffer.is_empty() {
            if self.exhausted() {
                return Ok(None);
            }
            self.refill().await?;
        }

        self.records_seen += 1;
        Ok(self.buffer.pop_front().map(RawRecord::Registry))
    }

    /// While the buffered page is partially consumed, the cursor points at
    /// the token that fetched it: a resume refetches that page and relies
    /// on the conflict-tolerant writes to absorb the overlap.
    fn cursor(&self) -> SourceCursor {
        if !self.started {
            return SourceCursor::Start;
        }
        let token = if self.buffer.is_empty() {
            self.next_cursor.clone()
        } else {
            self.page_cursor.clone()
        };
        if token.is_none() && !self.buffer.is_empty() {
            // First page still being consumed.
            return SourceCursor::Start;
        }
        SourceCursor::Page {
            next_cursor: token,
            records_seen: self.records_seen,
        }
    }

    async fn seek(&mut self, cursor: &SourceCursor) -> Result<()> {
        match cursor {
            SourceCursor::Start => Ok(()),
            SourceCursor::Page {
                next_cursor,
                records_seen,
            } => {
                // A saved cursor always points at an unfetched page; a
                // `None` token in a checkpoint means the run had finished.
                self.next_cursor = next_cursor.clone();
                self.records_seen = *records_seen;
                self.started = next_cursor.is_none() && *records_seen > 0;
                debug!(records_seen, "resumed registry source");
                Ok(())
            }
            other => Err(IngestionError::Source(format!(
                "cursor {other:?} does not belong to a registry source"
            ))),
        }
    }
}
