//! End-to-end pipeline tests over an in-memory repository.

use annuaire_ingestion::batch::{BatchCoordinator, BatchReport, BatchWrite};
use annuaire_ingestion::checkpoint::Checkpoint;
use annuaire_ingestion::metrics::{MetricSample, MetricsCollector};
use annuaire_ingestion::pipeline::{ImportPipeline, PipelineOptions};
use annuaire_ingestion::record::{FailedItem, FailureReason, FileRecord, RawRecord};
use annuaire_ingestion::reference::{CategoryRef, CityRef, ProvisionalCompany, ReferenceCache};
use annuaire_ingestion::repository::Repository;
use annuaire_ingestion::resolver::{
    CompanyOp, CompanyRecord, ResolutionFlags, ResolvedRecord, UnmappedCategoryPolicy,
};
use annuaire_ingestion::source::{FileSource, SourceCursor};
use annuaire_ingestion::{IngestionError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

#[derive(Default)]
struct State {
    cities: Vec<CityRef>,
    categories: Vec<CategoryRef>,
    companies: HashMap<String, CompanyRecord>,
    listings: HashSet<(String, Uuid, Uuid)>,
    failed: Vec<FailedItem>,
    checkpoints: HashMap<String, Checkpoint>,
    metrics: Vec<MetricSample>,
    /// Remaining write failures to inject, per registry id.
    failing_writes: HashMap<String, u32>,
}

/// Emulates the conflict-tolerant Postgres semantics in memory.
#[derive(Default)]
struct MockRepository {
    state: Mutex<State>,
}

impl MockRepository {
    fn with_reference(cities: Vec<CityRef>, categories: Vec<CategoryRef>) -> Self {
        let repo = Self::default();
        {
            let mut state = repo.state.lock().unwrap();
            state.cities = cities;
            state.categories = categories;
        }
        repo
    }

    fn company(&self, registry_id: &str) -> Option<CompanyRecord> {
        self.state
            .lock()
            .unwrap()
            .companies
            .get(registry_id)
            .cloned()
    }

    fn company_count(&self) -> usize {
        self.state.lock().unwrap().companies.len()
    }

    fn listing_count(&self) -> usize {
        self.state.lock().unwrap().listings.len()
    }

    fn failed_reasons(&self) -> Vec<FailureReason> {
        self.state
            .lock()
            .unwrap()
            .failed
            .iter()
            .map(|f| f.reason)
            .collect()
    }

    fn fail_writes_for(&self, registry_id: &str, times: u32) {
        self.state
            .lock()
            .unwrap()
            .failing_writes
            .insert(registry_id.to_string(), times);
    }

    fn checkpoint(&self, source_id: &str) -> Option<Checkpoint> {
        self.state
            .lock()
            .unwrap()
            .checkpoints
            .get(source_id)
            .cloned()
    }
}

fn merge_missing(existing: &mut CompanyRecord, incoming: &CompanyRecord) {
    fn fill(slot: &mut Option<String>, value: &Option<String>) {
        if slot.as_deref().map_or(true, |v| v.is_empty()) {
            if let Some(v) = value {
                *slot = Some(v.clone());
            }
        }
    }
    fill(&mut existing.establishment_id, &incoming.establishment_id);
    fill(&mut existing.trade_name, &incoming.trade_name);
    fill(&mut existing.address, &incoming.address);
    fill(&mut existing.postal_code, &incoming.postal_code);
    fill(&mut existing.city_name, &incoming.city_name);
    fill(&mut existing.activity_code, &incoming.activity_code);
    fill(&mut existing.activity_label, &incoming.activity_label);
    fill(&mut existing.phone, &incoming.phone);
    fill(&mut existing.email, &incoming.email);
    fill(&mut existing.website, &incoming.website);
}

fn merge_overwrite(existing: &mut CompanyRecord, incoming: &CompanyRecord) {
    fn replace(slot: &mut Option<String>, value: &Option<String>) {
        if value.is_some() {
            *slot = value.clone();
        }
    }
    replace(&mut existing.establishment_id, &incoming.establishment_id);
    replace(&mut existing.trade_name, &incoming.trade_name);
    replace(&mut existing.address, &incoming.address);
    replace(&mut existing.postal_code, &incoming.postal_code);
    replace(&mut existing.city_name, &incoming.city_name);
    replace(&mut existing.activity_code, &incoming.activity_code);
    replace(&mut existing.activity_label, &incoming.activity_label);
    replace(&mut existing.phone, &incoming.phone);
    replace(&mut existing.email, &incoming.email);
    replace(&mut existing.website, &incoming.website);
    if !incoming.name.is_empty() {
        existing.name = incoming.name.clone();
    }
}

#[async_trait]
impl Repository for MockRepository {
    async fn load_cities(&self) -> Result<Vec<CityRef>> {
        Ok(self.state.lock().unwrap().cities.clone())
    }

    async fn load_categories(&self) -> Result<Vec<CategoryRef>> {
        Ok(self.state.lock().unwrap().categories.clone())
    }

    async fn load_imported_ids(&self) -> Result<Vec<String>> {
        Ok(self.state.lock().unwrap().companies.keys().cloned().collect())
    }

    async fn load_provisional_companies(&self) -> Result<Vec<ProvisionalCompany>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .companies
            .values()
            .filter(|c| c.is_provisional)
            .map(|c| ProvisionalCompany {
                registry_id: c.registry_id.clone(),
                name: c.name.clone(),
                postal_code: c.postal_code.clone(),
            })
            .collect())
    }

    async fn create_fallback_category(&self, activity_code: &str) -> Result<CategoryRef> {
        let mut state = self.state.lock().unwrap();
        if let Some(existing) = state
            .categories
            .iter()
            .find(|c| c.activity_code == activity_code)
        {
            return Ok(existing.clone());
        }
        let category = CategoryRef {
            id: Uuid::new_v4(),
            activity_code: activity_code.to_string(),
            label: activity_code.to_string(),
            parent_group: None,
            fallback: true,
        };
        state.categories.push(category.clone());
        Ok(category)
    }

    async fn apply_batch(&self, batch: &BatchWrite) -> Result<BatchReport> {
        let mut state = self.state.lock().unwrap();

        let touched: Vec<String> = batch
            .creates
            .iter()
            .chain(batch.updates.iter())
            .map(|c| c.registry_id.clone())
            .chain(
                batch
                    .replacements
                    .iter()
                    .map(|r| r.company.registry_id.clone()),
            )
            .collect();
        for id in touched {
            if let Some(remaining) = state.failing_writes.get_mut(&id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(IngestionError::Source(format!(
                        "injected write failure for {id}"
                    )));
                }
            }
        }

        let mut report = BatchReport::default();

        for replacement in &batch.replacements {
            let real_id = &replacement.company.registry_id;
            let swappable = !state.companies.contains_key(real_id)
                && state
                    .companies
                    .get(&replacement.provisional_id)
                    .is_some_and(|c| c.is_provisional);
            if swappable {
                let mut company = state
                    .companies
                    .remove(&replacement.provisional_id)
                    .unwrap();
                company.registry_id = real_id.clone();
                company.is_provisional = false;
                merge_missing(&mut company, &replacement.company);
                state.companies.insert(real_id.clone(), company);
                report.replacements_applied += 1;
            } else {
                report.replacement_conflicts += 1;
                if let Some(existing) = state.companies.get_mut(real_id) {
                    merge_missing(existing, &replacement.company);
                } else {
                    state
                        .companies
                        .insert(real_id.clone(), replacement.company.clone());
                    report.companies_inserted += 1;
                }
            }
        }

        for company in &batch.creates {
            if state.companies.contains_key(&company.registry_id) {
                report.create_conflicts += 1;
            } else {
                state
                    .companies
                    .insert(company.registry_id.clone(), company.clone());
                report.companies_inserted += 1;
            }
        }

        for company in &batch.updates {
            if let Some(existing) = state.companies.get_mut(&company.registry_id) {
                if batch.overwrite {
                    merge_overwrite(existing, company);
                } else {
                    merge_missing(existing, company);
                }
                report.companies_updated += 1;
            }
        }

        for listing in &batch.listings {
            let key = (
                listing.registry_id.clone(),
                listing.city_id,
                listing.category_id,
            );
            if state.listings.insert(key) {
                report.listings_inserted += 1;
            } else {
                report.listing_conflicts += 1;
            }
        }

        Ok(report)
    }

    async fn record_failed_items(&self, items: &[FailedItem]) -> Result<()> {
        self.state.lock().unwrap().failed.extend(items.iter().cloned());
        Ok(())
    }

    async fn load_failed_items(&self, limit: i64, max_retries: i32) -> Result<Vec<FailedItem>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .failed
            .iter()
            .filter(|f| !f.resolved && f.retry_count < max_retries)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn mark_failed_item_resolved(&self, id: Uuid) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(item) = state.failed.iter_mut().find(|f| f.id == id) {
            item.resolved = true;
        }
        Ok(())
    }

    async fn bump_failed_item_retry(&self, id: Uuid) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(item) = state.failed.iter_mut().find(|f| f.id == id) {
            item.retry_count += 1;
        }
        Ok(())
    }

    async fn purge_failed_items(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        let before = state.failed.len();
        state.failed.retain(|f| f.created_at >= older_than);
        Ok((before - state.failed.len()) as u64)
    }

    async fn load_checkpoint(&self, source_id: &str) -> Result<Option<Checkpoint>> {
        Ok(self.state.lock().unwrap().checkpoints.get(source_id).cloned())
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .checkpoints
            .insert(checkpoint.source_id.clone(), checkpoint.clone());
        Ok(())
    }

    async fn append_metrics(&self, samples: &[MetricSample]) -> Result<()> {
        self.state.lock().unwrap().metrics.extend(samples.iter().cloned());
        Ok(())
    }
}

fn lyon() -> CityRef {
    CityRef {
        id: Uuid::new_v4(),
        name: "Lyon".into(),
        postal_code: "69003".into(),
        department: "69".into(),
        population: Some(522_250),
    }
}

fn bakery_category() -> CategoryRef {
    CategoryRef {
        id: Uuid::new_v4(),
        activity_code: "10.71C".into(),
        label: "Boulangerie".into(),
        parent_group: Some("Alimentation".into()),
        fallback: false,
    }
}

fn write_csv(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

fn pipeline(repo: Arc<MockRepository>, options: PipelineOptions) -> ImportPipeline {
    ImportPipeline::new(repo, Arc::new(MetricsCollector::new(100)), options)
}

#[tokio::test]
async fn file_import_creates_companies_listings_and_failures() {
    let repo = Arc::new(MockRepository::with_reference(
        vec![lyon()],
        vec![bakery_category()],
    ));
    let file = write_csv(
        "registry_id,name,postal_code,city,activity_code\n\
         111111111,Boulangerie Dupont,69003,Lyon,10.71C\n\
         222222222,Garage Martin,69003,Lyon,10.71C\n\
         333333333,,69003,Lyon,10.71C\n\
         ,Sans Papiers,69003,Lyon,10.71C\n",
    );

    let options = PipelineOptions {
        batch_size: 2,
        workers: 2,
        ..Default::default()
    };
    let source = FileSource::open(file.path()).unwrap();
    let summary = pipeline(repo.clone(), options)
        .run(Box::new(source))
        .await
        .unwrap();

    assert!(summary.completed);
    assert_eq!(summary.processed, 4);
    assert_eq!(summary.created, 3);
    assert_eq!(summary.failed, 1);
    assert_eq!(repo.company_count(), 3);
    assert_eq!(repo.listing_count(), 3);
    assert_eq!(repo.failed_reasons(), vec![FailureReason::MissingName]);

    // The keyless row got a provisional id in the reserved space.
    let provisional = {
        let state = repo.state.lock().unwrap();
        state
            .companies
            .values()
            .find(|c| c.name == "Sans Papiers")
            .cloned()
            .unwrap()
    };
    assert!(provisional.is_provisional);
    assert!(provisional.registry_id.starts_with('9'));
    assert_eq!(provisional.registry_id.len(), 9);

    assert!(repo
        .checkpoint(&format!("file:{}", file.path().display()))
        .is_some());
}

#[tokio::test]
async fn fill_missing_update_preserves_populated_fields() {
    let repo = Arc::new(MockRepository::with_reference(
        vec![lyon()],
        vec![bakery_category()],
    ));
    {
        let mut state = repo.state.lock().unwrap();
        state.companies.insert(
            "111111111".into(),
            CompanyRecord {
                registry_id: "111111111".into(),
                is_provisional: false,
                establishment_id: None,
                name: "Boulangerie Dupont".into(),
                trade_name: None,
                address: None,
                postal_code: Some("69003".into()),
                city_name: Some("Lyon".into()),
                activity_code: None,
                activity_label: None,
                phone: Some("04 72 00 00 00".into()),
                email: None,
                website: None,
            },
        );
    }

    let file = write_csv(
        "registry_id,name,postal_code,city,phone,email\n\
         111111111,Autre Nom,69003,Lyon,09 99 99 99 99,contact@dupont.fr\n",
    );
    let source = FileSource::open(file.path()).unwrap();
    let summary = pipeline(repo.clone(), PipelineOptions::default())
        .run(Box::new(source))
        .await
        .unwrap();

    assert_eq!(summary.updated, 1);
    let company = repo.company("111111111").unwrap();
    // Populated fields survive, gaps are filled.
    assert_eq!(company.phone.as_deref(), Some("04 72 00 00 00"));
    assert_eq!(company.email.as_deref(), Some("contact@dupont.fr"));
    assert_eq!(company.name, "Boulangerie Dupont");
}

#[tokio::test]
async fn overwrite_update_lets_incoming_values_win() {
    let repo = Arc::new(MockRepository::with_reference(
        vec![lyon()],
        vec![bakery_category()],
    ));
    {
        let mut state = repo.state.lock().unwrap();
        state.companies.insert(
            "111111111".into(),
            CompanyRecord {
                registry_id: "111111111".into(),
                is_provisional: false,
                establishment_id: None,
                name: "Boulangerie Dupont".into(),
                trade_name: None,
                address: None,
                postal_code: Some("69003".into()),
                city_name: Some("Lyon".into()),
                activity_code: None,
                activity_label: None,
                phone: Some("04 72 00 00 00".into()),
                email: None,
                website: None,
            },
        );
    }

    let file = write_csv(
        "registry_id,name,postal_code,city,phone\n\
         111111111,Boulangerie Dupont,69003,Lyon,09 99 99 99 99\n",
    );
    let options = PipelineOptions {
        overwrite: true,
        ..Default::default()
    };
    let source = FileSource::open(file.path()).unwrap();
    pipeline(repo.clone(), options)
        .run(Box::new(source))
        .await
        .unwrap();

    let company = repo.company("111111111").unwrap();
    assert_eq!(company.phone.as_deref(), Some("09 99 99 99 99"));
}

#[tokio::test]
async fn unmapped_category_drop_vs_fallback() {
    let file_content = "registry_id,name,postal_code,city,activity_code\n\
                        111111111,Atelier Web,69003,Lyon,62.01Z\n";

    // Drop: company imported, no listing.
    let repo = Arc::new(MockRepository::with_reference(
        vec![lyon()],
        vec![bakery_category()],
    ));
    let file = write_csv(file_content);
    let source = FileSource::open(file.path()).unwrap();
    let summary = pipeline(repo.clone(), PipelineOptions::default())
        .run(Box::new(source))
        .await
        .unwrap();
    assert_eq!(repo.company_count(), 1);
    assert_eq!(repo.listing_count(), 0);
    assert_eq!(summary.counters.get("category_not_found"), Some(&1));

    // Fallback: a category is minted and the listing lands.
    let repo = Arc::new(MockRepository::with_reference(
        vec![lyon()],
        vec![bakery_category()],
    ));
    let file = write_csv(file_content);
    let options = PipelineOptions {
        unmapped_category: UnmappedCategoryPolicy::Fallback,
        ..Default::default()
    };
    let source = FileSource::open(file.path()).unwrap();
    let summary = pipeline(repo.clone(), options)
        .run(Box::new(source))
        .await
        .unwrap();
    assert_eq!(repo.listing_count(), 1);
    assert_eq!(summary.counters.get("category_fallback"), Some(&1));
    let state = repo.state.lock().unwrap();
    let minted = state
        .categories
        .iter()
        .find(|c| c.activity_code == "62.01Z")
        .unwrap();
    assert!(minted.fallback);
}

#[tokio::test]
async fn interrupted_run_resumes_without_duplicates() {
    let repo = Arc::new(MockRepository::with_reference(
        vec![lyon()],
        vec![bakery_category()],
    ));
    let file = write_csv(
        "registry_id,name,postal_code,city,activity_code\n\
         111111111,Premier,69003,Lyon,10.71C\n\
         222222222,Deuxieme,69003,Lyon,10.71C\n\
         333333333,Troisieme,69003,Lyon,10.71C\n\
         444444444,Quatrieme,69003,Lyon,10.71C\n",
    );

    let first = PipelineOptions {
        max_records: Some(2),
        ..Default::default()
    };
    let source = FileSource::open(file.path()).unwrap();
    let summary = pipeline(repo.clone(), first)
        .run(Box::new(source))
        .await
        .unwrap();
    assert!(!summary.completed);
    assert_eq!(summary.processed, 2);
    assert_eq!(repo.company_count(), 2);

    let second = PipelineOptions {
        resume: true,
        ..Default::default()
    };
    let source = FileSource::open(file.path()).unwrap();
    let summary = pipeline(repo.clone(), second)
        .run(Box::new(source))
        .await
        .unwrap();
    assert!(summary.completed);
    assert_eq!(summary.processed, 2);
    assert_eq!(repo.company_count(), 4);
    assert_eq!(summary.conflicts, 0);

    let checkpoint = repo
        .checkpoint(&format!("file:{}", file.path().display()))
        .unwrap();
    assert_eq!(checkpoint.processed, 4);
    assert_eq!(checkpoint.created, 4);
}

#[tokio::test]
async fn real_key_replaces_provisional_company() {
    let repo = Arc::new(MockRepository::with_reference(
        vec![lyon()],
        vec![bakery_category()],
    ));

    // First pass: keyless record mints a provisional company.
    let file = write_csv(
        "registry_id,name,postal_code,city\n\
         ,Chez Momo,69003,Lyon\n",
    );
    let source = FileSource::open(file.path()).unwrap();
    pipeline(repo.clone(), PipelineOptions::default())
        .run(Box::new(source))
        .await
        .unwrap();
    assert_eq!(repo.company_count(), 1);
    let provisional_id = {
        let state = repo.state.lock().unwrap();
        let company = state.companies.values().next().unwrap();
        assert!(company.is_provisional);
        company.registry_id.clone()
    };
    assert!(provisional_id.starts_with('9'));

    // Second pass: the same business arrives with its real identifier.
    let file = write_csv(
        "registry_id,name,postal_code,city,phone\n\
         123456789,Chez Momo,69003,Lyon,04 78 00 00 00\n",
    );
    let source = FileSource::open(file.path()).unwrap();
    let summary = pipeline(repo.clone(), PipelineOptions::default())
        .run(Box::new(source))
        .await
        .unwrap();

    assert_eq!(summary.updated, 1);
    assert_eq!(repo.company_count(), 1);
    assert!(repo.company(&provisional_id).is_none());
    let company = repo.company("123456789").unwrap();
    assert!(!company.is_provisional);
    assert_eq!(company.phone.as_deref(), Some("04 78 00 00 00"));
}

fn create_record(registry_id: &str, name: &str) -> ResolvedRecord {
    ResolvedRecord {
        company: CompanyRecord {
            registry_id: registry_id.into(),
            is_provisional: false,
            establishment_id: None,
            name: name.into(),
            trade_name: None,
            address: None,
            postal_code: Some("69003".into()),
            city_name: Some("Lyon".into()),
            activity_code: None,
            activity_label: None,
            phone: None,
            email: None,
            website: None,
        },
        op: CompanyOp::Create,
        listing: None,
        flags: ResolutionFlags::default(),
    }
}

#[tokio::test]
async fn salvage_casualty_is_not_treated_as_imported() {
    let repo = Arc::new(MockRepository::with_reference(
        vec![lyon()],
        vec![bakery_category()],
    ));
    // One failure for the whole-batch attempt, one for the salvage pass.
    repo.fail_writes_for("555555555", 2);

    let cache = Arc::new(ReferenceCache::new(
        repo.load_cities().await.unwrap(),
        repo.load_categories().await.unwrap(),
        vec![],
        vec![],
    ));
    let mut coordinator = BatchCoordinator::new(
        repo.clone(),
        cache.clone(),
        Arc::new(MetricsCollector::new(100)),
        "file:dump.csv",
        2,
        false,
    );

    coordinator
        .accept(
            1,
            create_record("555555555", "Maison Fragile"),
            SourceCursor::ByteOffset { offset: 40 },
        )
        .await
        .unwrap();
    coordinator
        .accept(
            2,
            create_record("111111111", "Maison Solide"),
            SourceCursor::ByteOffset { offset: 80 },
        )
        .await
        .unwrap();

    // The survivor landed and is known; the casualty is neither written
    // nor remembered as imported.
    assert!(repo.company("111111111").is_some());
    assert!(repo.company("555555555").is_none());
    assert!(cache.is_imported("111111111"));
    assert!(!cache.is_imported("555555555"));
    assert_eq!(repo.failed_reasons(), vec![FailureReason::WriteFailed]);

    // When the same business shows up again it must be created, not
    // turned into an update against a row that never landed.
    coordinator
        .accept(
            3,
            create_record("555555555", "Maison Fragile"),
            SourceCursor::ByteOffset { offset: 120 },
        )
        .await
        .unwrap();
    coordinator.flush().await.unwrap();

    assert!(repo.company("555555555").is_some());
    let stats = coordinator.stats();
    assert_eq!(stats.created, 2);
    assert_eq!(stats.failed, 1);
}

#[tokio::test]
async fn deadline_stop_reports_incomplete_and_resume_finishes() {
    let repo = Arc::new(MockRepository::with_reference(
        vec![lyon()],
        vec![bakery_category()],
    ));
    let file = write_csv(
        "registry_id,name,postal_code,city,activity_code\n\
         111111111,Premier,69003,Lyon,10.71C\n\
         222222222,Deuxieme,69003,Lyon,10.71C\n\
         333333333,Troisieme,69003,Lyon,10.71C\n",
    );

    // An already expired deadline: nothing buffered may start a batch.
    let options = PipelineOptions {
        deadline: Some(Duration::ZERO),
        ..Default::default()
    };
    let source = FileSource::open(file.path()).unwrap();
    let summary = pipeline(repo.clone(), options)
        .run(Box::new(source))
        .await
        .unwrap();
    assert!(!summary.completed);
    assert_eq!(summary.processed, 0);
    assert_eq!(repo.company_count(), 0);

    let resume = PipelineOptions {
        resume: true,
        ..Default::default()
    };
    let source = FileSource::open(file.path()).unwrap();
    let summary = pipeline(repo.clone(), resume)
        .run(Box::new(source))
        .await
        .unwrap();
    assert!(summary.completed);
    assert_eq!(repo.company_count(), 3);
}

#[tokio::test]
async fn retry_failed_replays_recoverable_items() {
    let repo = Arc::new(MockRepository::with_reference(
        vec![lyon()],
        vec![bakery_category()],
    ));

    let mut fields = HashMap::new();
    fields.insert("registry_id".to_string(), "111111111".to_string());
    fields.insert("name".to_string(), "Boulangerie Dupont".to_string());
    fields.insert("postal_code".to_string(), "69003".to_string());
    fields.insert("city".to_string(), "Lyon".to_string());
    fields.insert("activity_code".to_string(), "10.71C".to_string());
    let raw = RawRecord::File(FileRecord {
        fields,
        line: 7,
        byte_offset: 0,
    });
    let recoverable = FailedItem::new("file:dump.csv", FailureReason::RetriesExhausted, &raw);

    let hopeless = FailedItem::new(
        "file:dump.csv",
        FailureReason::MalformedLine,
        &RawRecord::Malformed {
            line: 9,
            error: "unequal field count".into(),
        },
    );

    repo.record_failed_items(&[recoverable.clone(), hopeless.clone()])
        .await
        .unwrap();

    let summary = pipeline(repo.clone(), PipelineOptions::default())
        .retry_failed(None, 100, 3)
        .await
        .unwrap();

    assert_eq!(summary.processed, 2);
    assert_eq!(summary.created, 1);
    assert_eq!(summary.failed, 1);
    assert!(repo.company("111111111").is_some());
    assert_eq!(repo.listing_count(), 1);

    let state = repo.state.lock().unwrap();
    let replayed = state.failed.iter().find(|f| f.id == recoverable.id).unwrap();
    assert!(replayed.resolved);
    let stuck = state.failed.iter().find(|f| f.id == hopeless.id).unwrap();
    assert!(!stuck.resolved);
    assert_eq!(stuck.retry_count, 1);
}
