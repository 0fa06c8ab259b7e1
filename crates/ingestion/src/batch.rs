//! Batch accumulation and commit coordination
//!
//! One coordinator instance owns all writes for a run. Worker tasks hand
//! it resolved records; it groups them into batches, applies each batch in
//! a single transaction, and only then advances the checkpoint. A batch
//! that fails its one retry is salvaged record by record so a single
//! poisoned row costs one failed item, not the whole batch.

use crate::checkpoint::{Checkpoint, CheckpointManager};
use crate::metrics::MetricsCollector;
use crate::record::{FailedItem, FailureReason};
use crate::reference::ReferenceCache;
use crate::repository::Repository;
use crate::resolver::{CategorySelection, CompanyOp, CompanyRecord, ResolvedRecord};
use crate::source::SourceCursor;
use crate::Result;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A provisional-to-real key swap plus the record that triggered it.
#[derive(Debug, Clone)]
pub struct KeyReplacement {
    pub provisional_id: String,
    pub company: CompanyRecord,
}

/// A fully resolved listing row.
#[derive(Debug, Clone)]
pub struct ListingWrite {
    pub registry_id: String,
    pub city_id: Uuid,
    pub category_id: Uuid,
}

/// Everything one transaction applies.
#[derive(Debug, Clone, Default)]
pub struct BatchWrite {
    pub creates: Vec<CompanyRecord>,
    pub updates: Vec<CompanyRecord>,
    pub replacements: Vec<KeyReplacement>,
    pub listings: Vec<ListingWrite>,
    pub overwrite: bool,
}

impl BatchWrite {
    pub fn is_empty(&self) -> bool {
        self.creates.is_empty()
            && self.updates.is_empty()
            && self.replacements.is_empty()
            && self.listings.is_empty()
    }
}

/// What the transaction reported back.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchReport {
    pub companies_inserted: u64,
    pub companies_updated: u64,
    pub create_conflicts: u64,
    pub replacements_applied: u64,
    pub replacement_conflicts: u64,
    pub listings_inserted: u64,
    pub listing_conflicts: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CoordinatorStats {
    pub processed: u64,
    pub created: u64,
    pub updated: u64,
    pub listings: u64,
    pub conflicts: u64,
    pub failed: u64,
}

pub struct BatchCoordinator {
    repository: Arc<dyn Repository>,
    cache: Arc<ReferenceCache>,
    metrics: Arc<MetricsCollector>,
    checkpoints: CheckpointManager,
    source_id: String,
    batch_size: usize,
    overwrite: bool,
    buffer: Vec<ResolvedRecord>,
    failed: Vec<FailedItem>,
    /// Worker tasks finish out of order, so cursors arrive out of order
    /// too. The checkpoint only ever advances over the contiguous prefix
    /// of record sequence numbers seen so far; records past a gap may be
    /// committed ahead of the cursor and are simply replayed on resume.
    received: BTreeMap<u64, SourceCursor>,
    next_contiguous: u64,
    safe_cursor: SourceCursor,
    stats: CoordinatorStats,
    baseline: CoordinatorStats,
}

impl BatchCoordinator {
    pub fn new(
        repository: Arc<dyn Repository>,
        cache: Arc<ReferenceCache>,
        metrics: Arc<MetricsCollector>,
        source_id: &str,
        batch_size: usize,
        overwrite: bool,
    ) -> Self {
        let checkpoints = CheckpointManager::new(repository.clone(), source_id);
        Self {
            repository,
            cache,
            metrics,
            checkpoints,
            source_id: source_id.to_string(),
            batch_size: batch_size.max(1),
            overwrite,
            buffer: Vec::new(),
            failed: Vec::new(),
            received: BTreeMap::new(),
            next_contiguous: 1,
            safe_cursor: SourceCursor::Start,
            stats: CoordinatorStats::default(),
            baseline: CoordinatorStats::default(),
        }
    }

    /// Carry totals over from the checkpoint a resumed run starts at.
    pub fn set_baseline(&mut self, checkpoint: &Checkpoint) {
        self.baseline = CoordinatorStats {
            processed: checkpoint.processed,
            created: checkpoint.created,
            updated: checkpoint.updated,
            failed: checkpoint.failed,
            ..Default::default()
        };
        self.safe_cursor = checkpoint.cursor.clone();
    }

    pub fn stats(&self) -> CoordinatorStats {
        self.stats
    }

    fn track_cursor(&mut self, seq: u64, cursor: SourceCursor) {
        self.received.insert(seq, cursor);
        while let Some(cursor) = self.received.remove(&self.next_contiguous) {
            self.safe_cursor = cursor;
            self.next_contiguous += 1;
        }
    }

    /// Buffer a resolved record; commits when the batch is full. `seq` is
    /// the record's read order starting at 1, `cursor` points just past
    /// it in the source.
    pub async fn accept(
        &mut self,
        seq: u64,
        record: ResolvedRecord,
        cursor: SourceCursor,
    ) -> Result<()> {
        self.stats.processed += 1;
        self.track_cursor(seq, cursor);
        self.buffer.push(record);
        if self.buffer.len() >= self.batch_size {
            self.commit().await?;
        }
        Ok(())
    }

    /// Buffer a record that never resolved. Written out with the next
    /// commit so the checkpoint covers it too.
    pub async fn accept_failed(
        &mut self,
        seq: u64,
        item: FailedItem,
        cursor: SourceCursor,
    ) -> Result<()> {
        self.stats.processed += 1;
        self.stats.failed += 1;
        self.track_cursor(seq, cursor);
        self.metrics
            .record(&format!("skip_{}", item.reason.as_str()))
            .await;
        self.failed.push(item);
        if self.failed.len() >= self.batch_size {
            self.commit().await?;
        }
        Ok(())
    }

    /// Commit whatever is buffered. Called once after the source drains
    /// and on deadline stops.
    pub async fn flush(&mut self) -> Result<()> {
        self.commit().await
    }

    async fn commit(&mut self) -> Result<()> {
        if self.buffer.is_empty() && self.failed.is_empty() {
            return Ok(());
        }

        let records = std::mem::take(&mut self.buffer);
        let write = self.build_write(&records).await?;

        if !write.is_empty() {
            // Only records that actually landed may enter the imported
            // set; a salvage casualty marked here would turn its next
            // occurrence into an update against a row that does not exist.
            let report = match self.apply_with_retry(&write).await {
                Ok(report) => {
                    for record in &records {
                        self.cache.mark_imported(&record.company.registry_id);
                    }
                    report
                }
                Err(e) => {
                    error!(error = %e, batch = records.len(), "batch failed twice, salvaging record by record");
                    self.salvage(&records).await?
                }
            };

            self.stats.created += report.companies_inserted;
            self.stats.updated += report.companies_updated + report.replacements_applied;
            self.stats.listings += report.listings_inserted;
            self.stats.conflicts += report.create_conflicts
                + report.replacement_conflicts
                + report.listing_conflicts;

            if report.replacements_applied > 0 {
                self.metrics
                    .add("provisional_replaced", report.replacements_applied as f64)
                    .await;
            }

            debug!(
                inserted = report.companies_inserted,
                updated = report.companies_updated,
                listings = report.listings_inserted,
                "batch committed"
            );
        }

        // Failure logging must never mask import progress.
        let failed = std::mem::take(&mut self.failed);
        if !failed.is_empty() {
            if let Err(e) = self.repository.record_failed_items(&failed).await {
                warn!(count = failed.len(), error = %e, "could not persist failed items");
            }
        }

        self.save_checkpoint().await
    }

    async fn build_write(&self, records: &[ResolvedRecord]) -> Result<BatchWrite> {
        let mut write = BatchWrite {
            overwrite: self.overwrite,
            ..Default::default()
        };

        for record in records {
            match &record.op {
                CompanyOp::Create => write.creates.push(record.company.clone()),
                CompanyOp::Update => write.updates.push(record.company.clone()),
                CompanyOp::ReplaceProvisional { provisional_id } => {
                    write.replacements.push(KeyReplacement {
                        provisional_id: provisional_id.clone(),
                        company: record.company.clone(),
                    })
                }
            }

            if let Some(listing) = &record.listing {
                let category_id = match &listing.category {
                    CategorySelection::Resolved(id) => *id,
                    CategorySelection::NeedsFallback(code) => {
                        self.fallback_category(code).await?
                    }
                };
                write.listings.push(ListingWrite {
                    registry_id: listing.registry_id.clone(),
                    city_id: listing.city_id,
                    category_id,
                });
            }
        }

        Ok(write)
    }

    /// Mint-or-reuse a fallback category. The cache check catches codes
    /// minted earlier in this run.
    async fn fallback_category(&self, code: &str) -> Result<Uuid> {
        if let Some(existing) = self.cache.find_category(code) {
            return Ok(existing.id);
        }
        let minted = self.repository.create_fallback_category(code).await?;
        info!(activity_code = code, "minted fallback category");
        self.metrics.record("category_fallback_created").await;
        let id = minted.id;
        self.cache.insert_category(minted);
        Ok(id)
    }

    async fn apply_with_retry(&self, write: &BatchWrite) -> Result<BatchReport> {
        match self.repository.apply_batch(write).await {
            Ok(report) => Ok(report),
            Err(first) if first.is_retryable() => {
                warn!(error = %first, "batch write failed, retrying once");
                self.metrics.record("batch_retry").await;
                self.repository.apply_batch(write).await
            }
            Err(first) => Err(first),
        }
    }

    /// Apply records one at a time; whatever still fails becomes a failed
    /// item and the run moves on.
    async fn salvage(&mut self, records: &[ResolvedRecord]) -> Result<BatchReport> {
        let mut total = BatchReport::default();
        for record in records {
            let single = self.build_write(std::slice::from_ref(record)).await?;
            match self.repository.apply_batch(&single).await {
                Ok(report) => {
                    self.cache.mark_imported(&record.company.registry_id);
                    total.companies_inserted += report.companies_inserted;
                    total.companies_updated += report.companies_updated;
                    total.create_conflicts += report.create_conflicts;
                    total.replacements_applied += report.replacements_applied;
                    total.replacement_conflicts += report.replacement_conflicts;
                    total.listings_inserted += report.listings_inserted;
                    total.listing_conflicts += report.listing_conflicts;
                }
                Err(e) => {
                    self.stats.failed += 1;
                    self.metrics.record("skip_write_failed").await;
                    self.failed.push(FailedItem {
                        id: Uuid::new_v4(),
                        source_id: self.source_id.clone(),
                        reason: FailureReason::WriteFailed,
                        payload: serde_json::to_value(&record.company)
                            .unwrap_or(serde_json::Value::Null),
                        detail: Some(e.to_string()),
                        retry_count: 0,
                        resolved: false,
                        created_at: Utc::now(),
                    });
                }
            }
        }
        Ok(total)
    }

    async fn save_checkpoint(&mut self) -> Result<()> {
        let checkpoint = Checkpoint {
            source_id: self.source_id.clone(),
            cursor: self.safe_cursor.clone(),
            processed: self.baseline.processed + self.stats.processed,
            created: self.baseline.created + self.stats.created,
            updated: self.baseline.updated + self.stats.updated,
            failed: self.baseline.failed + self.stats.failed,
            updated_at: Utc::now(),
        };
        self.checkpoints.save(&checkpoint).await
    }
}
