//! Annuaire Bulk Import Pipeline
//!
//! This crate ingests business records from bulk CSV exports and from the
//! national business-registry API, resolves them against reference data
//! (cities, activity categories) and writes them to PostgreSQL in
//! conflict-tolerant batches with resumable checkpoints.

pub mod batch;
pub mod checkpoint;
pub mod metrics;
pub mod pipeline;
pub mod rate_limit;
pub mod record;
pub mod reference;
pub mod registry;
pub mod repository;
pub mod resolver;
pub mod source;

// Re-export main types
pub use batch::{BatchCoordinator, BatchReport, BatchWrite, KeyReplacement};
pub use checkpoint::{Checkpoint, CheckpointManager};
pub use metrics::{MetricSample, MetricsCollector, MetricsSink, RunSummary};
pub use pipeline::{ImportPipeline, PipelineOptions};
pub use rate_limit::ApiRateLimiter;
pub use record::{FailedItem, FailureReason, FileRecord, RawRecord};
pub use reference::{CategoryRef, CityRef, ProvisionalCompany, ReferenceCache};
pub use registry::{
    CompanyMatch, RegistryClient, RegistryEstablishment, RegistryPage, SearchQuery,
};
pub use repository::{PostgresRepository, Repository};
pub use resolver::{
    CategorySelection, CompanyOp, CompanyRecord, ListingCandidate, Resolution, ResolvedRecord,
    Resolver, UnmappedCategoryPolicy,
};
pub use source::{FileSource, RecordSource, RegistrySource, SourceCursor};

/// Common error type for the import pipeline
#[derive(Debug, thiserror::Error)]
pub enum IngestionError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("registry query rejected: {0}")]
    QueryRejected(String),

    #[error("registry returned {status} for {url}")]
    RegistryStatus { status: u16, url: String },

    #[error("source error: {0}")]
    Source(String),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error(transparent)]
    Core(#[from] annuaire_core::CoreError),
}

impl IngestionError {
    /// Transient failures worth another attempt. Query rejections and
    /// 4xx registry statuses are deterministic and excluded.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::Database(sqlx::Error::PoolTimedOut) => true,
            Self::Database(sqlx::Error::Io(_)) => true,
            Self::RegistryStatus { status, .. } => *status >= 500,
            Self::Core(e) => e.is_retryable(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, IngestionError>;
pub type Error = IngestionError;
