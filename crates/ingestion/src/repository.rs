//! Persistence layer for the import pipeline
//!
//! The [`Repository`] trait is the seam the pipeline is tested through;
//! [`PostgresRepository`] is the production implementation. The whole of a
//! batch goes through one transaction in [`Repository::apply_batch`], so a
//! batch either lands completely or not at all and the checkpoint written
//! afterwards can never describe a half-applied batch.

use crate::batch::{BatchReport, BatchWrite, ListingWrite};
use crate::checkpoint::Checkpoint;
use crate::metrics::{MetricSample, MetricsSink};
use crate::record::{FailedItem, FailureReason};
use crate::reference::{CategoryRef, CityRef, ProvisionalCompany};
use crate::resolver::CompanyRecord;
use crate::Result;
use annuaire_core::DatabaseConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Keeps every bulk statement well under the Postgres bind limit
/// (13 columns x 1000 rows).
const INSERT_CHUNK: usize = 1_000;

#[async_trait]
pub trait Repository: Send + Sync {
    async fn load_cities(&self) -> Result<Vec<CityRef>>;
    async fn load_categories(&self) -> Result<Vec<CategoryRef>>;
    async fn load_imported_ids(&self) -> Result<Vec<String>>;
    async fn load_provisional_companies(&self) -> Result<Vec<ProvisionalCompany>>;

    /// Mint (or fetch, when a concurrent run won the race) a fallback
    /// category for an unmapped activity code.
    async fn create_fallback_category(&self, activity_code: &str) -> Result<CategoryRef>;

    /// Apply one batch atomically.
    async fn apply_batch(&self, batch: &BatchWrite) -> Result<BatchReport>;

    async fn record_failed_items(&self, items: &[FailedItem]) -> Result<()>;
    async fn load_failed_items(&self, limit: i64, max_retries: i32) -> Result<Vec<FailedItem>>;
    async fn mark_failed_item_resolved(&self, id: Uuid) -> Result<()>;
    async fn bump_failed_item_retry(&self, id: Uuid) -> Result<()>;
    async fn purge_failed_items(&self, older_than: DateTime<Utc>) -> Result<u64>;

    async fn load_checkpoint(&self, source_id: &str) -> Result<Option<Checkpoint>>;
    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()>;

    async fn append_metrics(&self, samples: &[MetricSample]) -> Result<()>;
}

/// Adapter so the metrics collector can flush through any repository.
pub struct RepositoryMetricsSink(pub Arc<dyn Repository>);

#[async_trait]
impl MetricsSink for RepositoryMetricsSink {
    async fn append_metrics(&self, samples: &[MetricSample]) -> Result<()> {
        self.0.append_metrics(samples).await
    }
}

pub struct PostgresRepository {
    pool: PgPool,
}

impl PostgresRepository {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.connect_timeout)
            .connect(&config.url)
            .await?;
        info!(max_connections = config.max_connections, "database pool ready");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert_companies(
        tx: &mut Transaction<'_, Postgres>,
        companies: &[&CompanyRecord],
    ) -> Result<u64> {
        let mut inserted = 0u64;
        for chunk in companies.chunks(INSERT_CHUNK) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO companies (registry_id, is_provisional, establishment_id, name, \
                 trade_name, address, postal_code, city_name, activity_code, activity_label, \
                 phone, email, website) ",
            );
            qb.push_values(chunk, |mut b, c| {
                b.push_bind(&c.registry_id)
                    .push_bind(c.is_provisional)
                    .push_bind(&c.establishment_id)
                    .push_bind(&c.name)
                    .push_bind(&c.trade_name)
                    .push_bind(&c.address)
                    .push_bind(&c.postal_code)
                    .push_bind(&c.city_name)
                    .push_bind(&c.activity_code)
                    .push_bind(&c.activity_label)
                    .push_bind(&c.phone)
                    .push_bind(&c.email)
                    .push_bind(&c.website);
            });
            qb.push(" ON CONFLICT (registry_id) DO NOTHING");
            inserted += qb.build().execute(&mut **tx).await?.rows_affected();
        }
        Ok(inserted)
    }

    /// Fill-missing update: existing non-empty fields win. With
    /// `overwrite`, incoming non-null fields win instead.
    async fn update_company(
        tx: &mut Transaction<'_, Postgres>,
        company: &CompanyRecord,
        overwrite: bool,
    ) -> Result<u64> {
        let sql = if overwrite {
            "UPDATE companies SET \
               establishment_id = COALESCE($2, establishment_id), \
               name = COALESCE(NULLIF($3, ''), name), \
               trade_name = COALESCE($4, trade_name), \
               address = COALESCE($5, address), \
               postal_code = COALESCE($6, postal_code), \
               city_name = COALESCE($7, city_name), \
               activity_code = COALESCE($8, activity_code), \
               activity_label = COALESCE($9, activity_label), \
               phone = COALESCE($10, phone), \
               email = COALESCE($11, email), \
               website = COALESCE($12, website), \
               updated_at = NOW() \
             WHERE registry_id = $1"
        } else {
            "UPDATE companies SET \
               establishment_id = COALESCE(NULLIF(establishment_id, ''), $2), \
               name = COALESCE(NULLIF(name, ''), $3), \
               trade_name = COALESCE(NULLIF(trade_name, ''), $4), \
               address = COALESCE(NULLIF(address, ''), $5), \
               postal_code = COALESCE(NULLIF(postal_code, ''), $6), \
               city_name = COALESCE(NULLIF(city_name, ''), $7), \
               activity_code = COALESCE(NULLIF(activity_code, ''), $8), \
               activity_label = COALESCE(NULLIF(activity_label, ''), $9), \
               phone = COALESCE(NULLIF(phone, ''), $10), \
               email = COALESCE(NULLIF(email, ''), $11), \
               website = COALESCE(NULLIF(website, ''), $12), \
               updated_at = NOW() \
             WHERE registry_id = $1"
        };

        let result = sqlx::query(sql)
            .bind(&company.registry_id)
            .bind(&company.establishment_id)
            .bind(&company.name)
            .bind(&company.trade_name)
            .bind(&company.address)
            .bind(&company.postal_code)
            .bind(&company.city_name)
            .bind(&company.activity_code)
            .bind(&company.activity_label)
            .bind(&company.phone)
            .bind(&company.email)
            .bind(&company.website)
            .execute(&mut **tx)
            .await?;
        Ok(result.rows_affected())
    }

    async fn insert_listings(
        tx: &mut Transaction<'_, Postgres>,
        listings: &[ListingWrite],
    ) -> Result<u64> {
        let mut inserted = 0u64;
        for chunk in listings.chunks(INSERT_CHUNK) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO listings (company_registry_id, city_id, category_id) ",
            );
            qb.push_values(chunk, |mut b, l| {
                b.push_bind(&l.registry_id)
                    .push_bind(l.city_id)
                    .push_bind(l.category_id);
            });
            qb.push(" ON CONFLICT (company_registry_id, city_id, category_id) DO NOTHING");
            inserted += qb.build().execute(&mut **tx).await?.rows_affected();
        }
        Ok(inserted)
    }
}

#[async_trait]
impl Repository for PostgresRepository {
    async fn load_cities(&self) -> Result<Vec<CityRef>> {
        let rows =
            sqlx::query("SELECT id, name, postal_code, department, population FROM cities")
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter()
            .map(|row| {
                Ok(CityRef {
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                    postal_code: row.try_get("postal_code")?,
                    department: row.try_get("department")?,
                    population: row.try_get("population")?,
                })
            })
            .collect()
    }

    async fn load_categories(&self) -> Result<Vec<CategoryRef>> {
        let rows = sqlx::query(
            "SELECT id, activity_code, label, parent_group, fallback FROM categories",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                Ok(CategoryRef {
                    id: row.try_get("id")?,
                    activity_code: row.try_get("activity_code")?,
                    label: row.try_get("label")?,
                    parent_group: row.try_get("parent_group")?,
                    fallback: row.try_get("fallback")?,
                })
            })
            .collect()
    }

    async fn load_imported_ids(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT registry_id FROM companies")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| Ok(row.try_get("registry_id")?))
            .collect()
    }

    async fn load_provisional_companies(&self) -> Result<Vec<ProvisionalCompany>> {
        let rows = sqlx::query(
            "SELECT registry_id, name, postal_code FROM companies WHERE is_provisional",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                Ok(ProvisionalCompany {
                    registry_id: row.try_get("registry_id")?,
                    name: row.try_get("name")?,
                    postal_code: row.try_get("postal_code")?,
                })
            })
            .collect()
    }

    async fn create_fallback_category(&self, activity_code: &str) -> Result<CategoryRef> {
        // The no-op DO UPDATE makes RETURNING yield the existing row when
        // another run minted the same code first.
        let row = sqlx::query(
            "INSERT INTO categories (id, activity_code, label, fallback) \
             VALUES ($1, $2, $2, TRUE) \
             ON CONFLICT (activity_code) DO UPDATE SET activity_code = EXCLUDED.activity_code \
             RETURNING id, activity_code, label, parent_group, fallback",
        )
        .bind(Uuid::new_v4())
        .bind(activity_code)
        .fetch_one(&self.pool)
        .await?;

        debug!(activity_code, "fallback category ready");
        Ok(CategoryRef {
            id: row.try_get("id")?,
            activity_code: row.try_get("activity_code")?,
            label: row.try_get("label")?,
            parent_group: row.try_get("parent_group")?,
            fallback: row.try_get("fallback")?,
        })
    }

    async fn apply_batch(&self, batch: &BatchWrite) -> Result<BatchReport> {
        let mut report = BatchReport::default();
        let mut tx = self.pool.begin().await?;

        // Key replacements first, so a successful swap turns the matching
        // create into a harmless conflict instead of a duplicate row.
        for replacement in &batch.replacements {
            let swapped = sqlx::query(
                "UPDATE companies SET registry_id = $1, is_provisional = FALSE, updated_at = NOW() \
                 WHERE registry_id = $2 AND is_provisional \
                   AND NOT EXISTS (SELECT 1 FROM companies WHERE registry_id = $1)",
            )
            .bind(&replacement.company.registry_id)
            .bind(&replacement.provisional_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if swapped == 1 {
                report.replacements_applied += 1;
                // The incoming record usually carries fresher data than
                // the placeholder ever had.
                Self::update_company(&mut tx, &replacement.company, batch.overwrite).await?;
            } else {
                report.replacement_conflicts += 1;
                let inserted =
                    Self::insert_companies(&mut tx, &[&replacement.company]).await?;
                if inserted == 0 {
                    // First committed record under the real id wins; fill
                    // the gaps it left.
                    Self::update_company(&mut tx, &replacement.company, false).await?;
                }
            }
        }

        if !batch.creates.is_empty() {
            let refs: Vec<&CompanyRecord> = batch.creates.iter().collect();
            let inserted = Self::insert_companies(&mut tx, &refs).await?;
            report.companies_inserted = inserted;
            report.create_conflicts = batch.creates.len() as u64 - inserted;
        }

        for company in &batch.updates {
            report.companies_updated +=
                Self::update_company(&mut tx, company, batch.overwrite).await?;
        }

        if !batch.listings.is_empty() {
            let inserted = Self::insert_listings(&mut tx, &batch.listings).await?;
            report.listings_inserted = inserted;
            report.listing_conflicts = batch.listings.len() as u64 - inserted;
        }

        tx.commit().await?;
        Ok(report)
    }

    async fn record_failed_items(&self, items: &[FailedItem]) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for item in items {
            sqlx::query(
                "INSERT INTO failed_items (id, source_id, reason, payload, detail, retry_count, resolved, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
                 ON CONFLICT (id) DO NOTHING",
            )
            .bind(item.id)
            .bind(&item.source_id)
            .bind(item.reason.as_str())
            .bind(&item.payload)
            .bind(&item.detail)
            .bind(item.retry_count)
            .bind(item.resolved)
            .bind(item.created_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        debug!(count = items.len(), "failed items recorded");
        Ok(())
    }

    async fn load_failed_items(&self, limit: i64, max_retries: i32) -> Result<Vec<FailedItem>> {
        let rows = sqlx::query(
            "SELECT id, source_id, reason, payload, detail, retry_count, resolved, created_at \
             FROM failed_items \
             WHERE NOT resolved AND retry_count < $1 \
             ORDER BY created_at \
             LIMIT $2",
        )
        .bind(max_retries)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            let reason_raw: String = row.try_get("reason")?;
            let reason = FailureReason::from_str(&reason_raw).unwrap_or_else(|_| {
                warn!(reason = %reason_raw, "unknown failure reason in store");
                FailureReason::MalformedLine
            });
            items.push(FailedItem {
                id: row.try_get("id")?,
                source_id: row.try_get("source_id")?,
                reason,
                payload: row.try_get("payload")?,
                detail: row.try_get("detail")?,
                retry_count: row.try_get("retry_count")?,
                resolved: row.try_get("resolved")?,
                created_at: row.try_get("created_at")?,
            });
        }
        Ok(items)
    }

    async fn mark_failed_item_resolved(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE failed_items SET resolved = TRUE WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn bump_failed_item_retry(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE failed_items SET retry_count = retry_count + 1 WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn purge_failed_items(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let purged = sqlx::query("DELETE FROM failed_items WHERE created_at < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await?
            .rows_affected();
        info!(purged, cutoff = %older_than, "failed items purged");
        Ok(purged)
    }

    async fn load_checkpoint(&self, source_id: &str) -> Result<Option<Checkpoint>> {
        let row = sqlx::query(
            "SELECT source_id, cursor, processed, created, updated, failed, updated_at \
             FROM import_checkpoints WHERE source_id = $1",
        )
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let cursor: serde_json::Value = row.try_get("cursor")?;
        Ok(Some(Checkpoint {
            source_id: row.try_get("source_id")?,
            cursor: serde_json::from_value(cursor)?,
            processed: row.try_get::<i64, _>("processed")? as u64,
            created: row.try_get::<i64, _>("created")? as u64,
            updated: row.try_get::<i64, _>("updated")? as u64,
            failed: row.try_get::<i64, _>("failed")? as u64,
            updated_at: row.try_get("updated_at")?,
        }))
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        sqlx::query(
            "INSERT INTO import_checkpoints (source_id, cursor, processed, created, updated, failed, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (source_id) DO UPDATE SET \
               cursor = EXCLUDED.cursor, \
               processed = EXCLUDED.processed, \
               created = EXCLUDED.created, \
               updated = EXCLUDED.updated, \
               failed = EXCLUDED.failed, \
               updated_at = EXCLUDED.updated_at",
        )
        .bind(&checkpoint.source_id)
        .bind(serde_json::to_value(&checkpoint.cursor)?)
        .bind(checkpoint.processed as i64)
        .bind(checkpoint.created as i64)
        .bind(checkpoint.updated as i64)
        .bind(checkpoint.failed as i64)
        .bind(checkpoint.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_metrics(&self, samples: &[MetricSample]) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new("INSERT INTO metric_samples (name, value, recorded_at) ");
        qb.push_values(samples, |mut b, s| {
            b.push_bind(&s.name).push_bind(s.value).push_bind(s.recorded_at);
        });
        qb.build().execute(&self.pool).await?;
        Ok(())
    }
}
