//! Import pipeline orchestration
//!
//! One reader task pulls raw records from the source and numbers them; a
//! small pool of workers runs the pure resolver; a single coordinator
//! task owns every write, so batch commits and checkpoints are fully
//! serialized. Channels are bounded end to end, which keeps memory flat
//! no matter how large the source is.

use crate::batch::{BatchCoordinator, BatchWrite, KeyReplacement, ListingWrite};
use crate::metrics::{MetricsCollector, RunSummary};
use crate::record::{FailedItem, FailureReason, RawRecord};
use crate::reference::ReferenceCache;
use crate::registry::RegistryClient;
use crate::repository::Repository;
use crate::resolver::{
    CategorySelection, CompanyOp, Resolution, ResolvedRecord, Resolver, UnmappedCategoryPolicy,
};
use crate::source::{RecordSource, SourceCursor};
use crate::{IngestionError, Result};
use annuaire_core::PipelineConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{info, warn};

/// Similarity floor for adopting a registry match during failed-item
/// replay.
const MIN_MATCH_SCORE: f64 = 0.8;

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub batch_size: usize,
    pub workers: usize,
    pub channel_capacity: usize,
    /// Stop after this many records; mainly for smoke runs.
    pub max_records: Option<u64>,
    /// Graceful stop once elapsed; the run checkpoints and reports
    /// `completed: false`.
    pub deadline: Option<Duration>,
    pub resume: bool,
    pub overwrite: bool,
    pub unmapped_category: UnmappedCategoryPolicy,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            batch_size: 1_000,
            workers: 4,
            channel_capacity: 4_000,
            max_records: None,
            deadline: None,
            resume: false,
            overwrite: false,
            unmapped_category: UnmappedCategoryPolicy::Drop,
        }
    }
}

impl PipelineOptions {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            workers: config.workers,
            channel_capacity: config.channel_capacity,
            ..Default::default()
        }
    }
}

struct WorkItem {
    seq: u64,
    raw: RawRecord,
    cursor: SourceCursor,
}

enum Outcome {
    Resolved(Box<ResolvedRecord>),
    Failed(FailedItem),
}

struct WorkerReply {
    seq: u64,
    cursor: SourceCursor,
    outcome: Outcome,
}

pub struct ImportPipeline {
    repository: Arc<dyn Repository>,
    metrics: Arc<MetricsCollector>,
    options: PipelineOptions,
}

impl ImportPipeline {
    pub fn new(
        repository: Arc<dyn Repository>,
        metrics: Arc<MetricsCollector>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            repository,
            metrics,
            options,
        }
    }

    async fn load_cache(&self) -> Result<Arc<ReferenceCache>> {
        let cache = Arc::new(ReferenceCache::new(
            self.repository.load_cities().await?,
            self.repository.load_categories().await?,
            self.repository.load_imported_ids().await?,
            self.repository.load_provisional_companies().await?,
        ));
        info!(
            cities = cache.city_count(),
            categories = cache.category_count(),
            imported = cache.imported_count(),
            "reference data loaded"
        );
        Ok(cache)
    }

    /// Run a full import from `source`. Returns a summary in every
    /// completion mode; a hard failure still flushes the committed work
    /// and logs the partial summary before surfacing the error.
    pub async fn run(&self, mut source: Box<dyn RecordSource>) -> Result<RunSummary> {
        let started = Instant::now();
        let source_id = source.source_id().to_string();
        let cache = self.load_cache().await?;

        let mut coordinator = BatchCoordinator::new(
            self.repository.clone(),
            cache.clone(),
            self.metrics.clone(),
            &source_id,
            self.options.batch_size,
            self.options.overwrite,
        );

        if self.options.resume {
            if let Some(checkpoint) = self.repository.load_checkpoint(&source_id).await? {
                info!(
                    source = %source_id,
                    processed = checkpoint.processed,
                    "resuming from checkpoint"
                );
                source.seek(&checkpoint.cursor).await?;
                coordinator.set_baseline(&checkpoint);
            }
        }

        let (raw_tx, raw_rx) = mpsc::channel::<WorkItem>(self.options.channel_capacity);
        let (reply_tx, mut reply_rx) =
            mpsc::channel::<WorkerReply>(self.options.channel_capacity);
        let raw_rx = Arc::new(Mutex::new(raw_rx));

        let mut workers = Vec::with_capacity(self.options.workers);
        for _ in 0..self.options.workers {
            let raw_rx = raw_rx.clone();
            let reply_tx = reply_tx.clone();
            let resolver = Resolver::new(cache.clone(), self.options.unmapped_category);
            let metrics = self.metrics.clone();
            let source_id = source_id.clone();

            workers.push(tokio::spawn(async move {
                loop {
                    let item = { raw_rx.lock().await.recv().await };
                    let Some(item) = item else { break };

                    let outcome = match resolver.resolve(&item.raw) {
                        Resolution::Resolved(record) => {
                            let flags = record.flags;
                            if flags.place_not_found {
                                metrics.record("place_not_found").await;
                            }
                            if flags.category_not_found {
                                metrics.record("category_not_found").await;
                            }
                            if flags.category_fallback {
                                metrics.record("category_fallback").await;
                            }
                            if flags.provisional_id_minted {
                                metrics.record("provisional_id_minted").await;
                            }
                            Outcome::Resolved(record)
                        }
                        Resolution::Skipped { reason, detail } => Outcome::Failed(
                            FailedItem::new(&source_id, reason, &item.raw).with_detail(detail),
                        ),
                    };

                    let reply = WorkerReply {
                        seq: item.seq,
                        cursor: item.cursor,
                        outcome,
                    };
                    if reply_tx.send(reply).await.is_err() {
                        break;
                    }
                }
            }));
        }
        drop(reply_tx);

        let stop_at = self.options.deadline.map(|d| started + d);
        let max_records = self.options.max_records;
        let reader = tokio::spawn(async move {
            let mut seq = 0u64;
            let completed = loop {
                if let Some(limit) = max_records {
                    if seq >= limit {
                        info!(limit, "record cap reached");
                        break false;
                    }
                }

                let next = tokio::select! {
                    biased;
                    _ = sleep_until_opt(stop_at) => {
                        info!("deadline reached, stopping reads");
                        break false;
                    }
                    next = source.next() => next,
                };

                match next {
                    Ok(Some(raw)) => {
                        seq += 1;
                        let item = WorkItem {
                            seq,
                            raw,
                            cursor: source.cursor(),
                        };
                        if raw_tx.send(item).await.is_err() {
                            // Coordinator side went away; it carries the error.
                            break false;
                        }
                    }
                    Ok(None) => break true,
                    Err(e) => return Err(e),
                }
            };
            Ok(completed)
        });

        let mut coordination_error = None;
        let mut deadline_stop = false;
        loop {
            // The deadline also closes the intake here: records already
            // buffered in the channels are left for the resumed run
            // instead of starting fresh batches past the stop time.
            let reply = tokio::select! {
                biased;
                _ = sleep_until_opt(stop_at) => {
                    info!("deadline reached, closing batch intake");
                    deadline_stop = true;
                    break;
                }
                reply = reply_rx.recv() => match reply {
                    Some(reply) => reply,
                    None => break,
                },
            };
            let result = match reply.outcome {
                Outcome::Resolved(record) => {
                    coordinator.accept(reply.seq, *record, reply.cursor).await
                }
                Outcome::Failed(item) => {
                    coordinator.accept_failed(reply.seq, item, reply.cursor).await
                }
            };
            if let Err(e) = result {
                coordination_error = Some(e);
                break;
            }
        }

        if coordination_error.is_some() || deadline_stop {
            reader.abort();
        }
        // Reject further replies so draining workers exit promptly.
        reply_rx.close();

        let flush_result = coordinator.flush().await;
        let reader_result = match reader.await {
            Ok(r) => r,
            Err(e) if e.is_cancelled() => Ok(false),
            Err(e) => Err(IngestionError::Source(format!("reader task failed: {e}"))),
        };
        for worker in workers {
            let _ = worker.await;
        }

        self.metrics.flush().await;

        let stats = coordinator.stats();
        let completed = matches!(&reader_result, Ok(true)) && !deadline_stop;
        let summary = RunSummary {
            source_id,
            processed: stats.processed,
            created: stats.created,
            updated: stats.updated,
            listings: stats.listings,
            conflicts: stats.conflicts,
            failed: stats.failed,
            completed,
            duration: started.elapsed(),
            counters: self.metrics.counters(),
        };

        if let Some(e) = coordination_error {
            warn!(summary = %summary, "run aborted; committed progress is checkpointed");
            return Err(e);
        }
        if let Err(e) = &reader_result {
            warn!(error = %e, summary = %summary, "source failed; committed progress is checkpointed");
        }
        flush_result?;
        reader_result?;

        info!(
            processed = summary.processed,
            created = summary.created,
            updated = summary.updated,
            failed = summary.failed,
            completed = summary.completed,
            "import finished"
        );
        Ok(summary)
    }

    /// Replay stored failed items. Items that resolve are written and
    /// marked resolved; the rest get their retry count bumped. A registry
    /// client, when provided, is used to find real identifiers for
    /// records that failed for lack of one.
    pub async fn retry_failed(
        &self,
        registry: Option<Arc<RegistryClient>>,
        limit: i64,
        max_retries: i32,
    ) -> Result<RunSummary> {
        let started = Instant::now();
        let cache = self.load_cache().await?;
        let resolver = Resolver::new(cache.clone(), self.options.unmapped_category);
        let items = self.repository.load_failed_items(limit, max_retries).await?;
        info!(count = items.len(), "replaying failed items");

        let mut processed = 0u64;
        let mut created = 0u64;
        let mut updated = 0u64;
        let mut listings = 0u64;
        let mut conflicts = 0u64;
        let mut still_failed = 0u64;

        for item in items {
            processed += 1;

            let Ok(mut raw) = serde_json::from_value::<RawRecord>(item.payload.clone()) else {
                self.repository.bump_failed_item_retry(item.id).await?;
                still_failed += 1;
                continue;
            };

            if item.reason == FailureReason::MalformedLine {
                // Nothing to re-parse; these clear only via purge.
                self.repository.bump_failed_item_retry(item.id).await?;
                still_failed += 1;
                continue;
            }

            if let Some(client) = &registry {
                self.backfill_registry_id(client, &mut raw).await;
            }

            match resolver.resolve(&raw) {
                Resolution::Resolved(record) => {
                    let write = self.single_write(&cache, &record).await?;
                    match self.repository.apply_batch(&write).await {
                        Ok(report) => {
                            created += report.companies_inserted;
                            updated += report.companies_updated + report.replacements_applied;
                            listings += report.listings_inserted;
                            conflicts += report.create_conflicts + report.listing_conflicts;
                            cache.mark_imported(&record.company.registry_id);
                            self.repository.mark_failed_item_resolved(item.id).await?;
                            self.metrics.record("failed_item_recovered").await;
                        }
                        Err(e) => {
                            warn!(id = %item.id, error = %e, "failed item still not importable");
                            self.repository.bump_failed_item_retry(item.id).await?;
                            still_failed += 1;
                        }
                    }
                }
                Resolution::Skipped { detail, .. } => {
                    warn!(id = %item.id, detail = %detail, "failed item still unresolvable");
                    self.repository.bump_failed_item_retry(item.id).await?;
                    still_failed += 1;
                }
            }
        }

        self.metrics.flush().await;
        Ok(RunSummary {
            source_id: "retry-failed".into(),
            processed,
            created,
            updated,
            listings,
            conflicts,
            failed: still_failed,
            completed: true,
            duration: started.elapsed(),
            counters: self.metrics.counters(),
        })
    }

    /// For file rows that lack a registry id, ask the registry for a
    /// confident match and patch the row in place. Lookup failures leave
    /// the record as it was; the provisional-id path still applies.
    async fn backfill_registry_id(&self, client: &RegistryClient, raw: &mut RawRecord) {
        let RawRecord::File(record) = raw else { return };
        if record.get("registry_id").is_some() {
            return;
        }
        let (Some(name), Some(postal)) = (record.get("name"), record.get("postal_code")) else {
            return;
        };

        match client.match_company(name, postal, MIN_MATCH_SCORE).await {
            Ok(Some(hit)) => {
                info!(name, registry_id = %hit.registry_id, score = hit.score, "registry match adopted");
                self.metrics.record("registry_match_adopted").await;
                record
                    .fields
                    .insert("registry_id".into(), hit.registry_id);
                if record.get("establishment_id").is_none() {
                    record
                        .fields
                        .insert("establishment_id".into(), hit.establishment_id);
                }
            }
            Ok(None) => {
                self.metrics.record("registry_match_missed").await;
            }
            Err(e) => {
                warn!(name, error = %e, "registry lookup failed during replay");
            }
        }
    }

    async fn single_write(
        &self,
        cache: &Arc<ReferenceCache>,
        record: &ResolvedRecord,
    ) -> Result<BatchWrite> {
        let mut write = BatchWrite {
            overwrite: self.options.overwrite,
            ..Default::default()
        };
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
                    if let Some(existing) = cache.find_category(code) {
                        existing.id
                    } else {
                        let minted = self.repository.create_fallback_category(code).await?;
                        let id = minted.id;
                        cache.insert_category(minted);
                        id
                    }
                }
            };
            write.listings.push(ListingWrite {
                registry_id: listing.registry_id.clone(),
                city_id: listing.city_id,
                category_id,
            });
        }
        Ok(write)
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
