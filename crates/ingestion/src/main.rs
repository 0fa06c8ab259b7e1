//! annuaire-ingest: bulk import CLI for the business directory
//!
//! Exit code 0 covers every run that finished, including runs with failed
//! items (those are persisted for `retry-failed`); only setup errors and
//! hard mid-run failures exit non-zero.

use annuaire_core::{ConfigLoader, DatabaseConfig, PipelineConfig, RegistryApiConfig};
use annuaire_ingestion::pipeline::{ImportPipeline, PipelineOptions};
use annuaire_ingestion::registry::{RegistryClient, SearchQuery};
use annuaire_ingestion::repository::{PostgresRepository, Repository, RepositoryMetricsSink};
use annuaire_ingestion::resolver::UnmappedCategoryPolicy;
use annuaire_ingestion::source::{FileSource, RecordSource, RegistrySource};
use annuaire_ingestion::MetricsCollector;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

#[derive(Parser)]
#[command(name = "annuaire-ingest", version, about = "Bulk import for the annuaire directory")]
struct Cli {
    /// Emit JSON logs instead of the human format.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct ImportFlags {
    /// Records per transaction.
    #[arg(long)]
    batch_size: Option<usize>,

    /// Resolver worker tasks.
    #[arg(long)]
    workers: Option<usize>,

    /// Resume from the source's last checkpoint.
    #[arg(long)]
    resume: bool,

    /// Let incoming values overwrite populated fields on updates.
    #[arg(long)]
    overwrite: bool,

    /// Stop after this many records.
    #[arg(long)]
    max_records: Option<u64>,

    /// Stop gracefully after this many seconds, checkpointing progress.
    #[arg(long)]
    deadline_secs: Option<u64>,

    /// What to do with unmapped activity codes: drop | fallback.
    #[arg(long, default_value = "drop")]
    unmapped_category: UnmappedCategoryPolicy,
}

#[derive(Subcommand)]
enum Command {
    /// Import companies from a CSV export.
    File {
        path: PathBuf,

        /// Demote rows with any field larger than this many bytes.
        #[arg(long)]
        max_field_bytes: Option<usize>,

        #[command(flatten)]
        flags: ImportFlags,
    },

    /// Import active establishments from the registry API.
    Registry {
        /// Department code to import, e.g. 75 or 2A.
        #[arg(long)]
        department: String,

        /// Restrict to activity codes with this prefix.
        #[arg(long)]
        activity_prefix: Option<String>,

        /// Establishments per API page.
        #[arg(long)]
        page_size: Option<u32>,

        /// Override the API request quota for this run.
        #[arg(long)]
        quota: Option<u32>,

        /// Window the quota applies to, in seconds.
        #[arg(long)]
        quota_window_secs: Option<u64>,

        #[command(flatten)]
        flags: ImportFlags,
    },

    /// Replay stored failed items.
    RetryFailed {
        /// Maximum items to replay.
        #[arg(long, default_value_t = 500)]
        limit: i64,

        /// Skip items already retried this many times.
        #[arg(long, default_value_t = 3)]
        max_retries: i32,

        /// Do not query the registry for missing identifiers.
        #[arg(long)]
        no_lookup: bool,
    },

    /// Delete failed items older than the retention window.
    PurgeFailed {
        #[arg(long, default_value_t = 30)]
        older_than_days: i64,
    },
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn options_from(flags: &ImportFlags, config: &PipelineConfig) -> PipelineOptions {
    let mut options = PipelineOptions::from_config(config);
    if let Some(batch_size) = flags.batch_size {
        options.batch_size = batch_size.max(1);
        options.channel_capacity = options.batch_size * 4;
    }
    if let Some(workers) = flags.workers {
        options.workers = workers.max(1);
    }
    options.resume = flags.resume;
    options.overwrite = flags.overwrite;
    options.max_records = flags.max_records;
    options.deadline = flags.deadline_secs.map(Duration::from_secs);
    options.unmapped_category = flags.unmapped_category;
    options
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let db_config = DatabaseConfig::from_env()?;
    db_config.validate()?;
    let pipeline_config = PipelineConfig::from_env()?;
    pipeline_config.validate()?;

    let repository: Arc<dyn Repository> =
        Arc::new(PostgresRepository::connect(&db_config).await?);
    let metrics = Arc::new(MetricsCollector::with_sink(
        pipeline_config.metrics_buffer,
        Arc::new(RepositoryMetricsSink(repository.clone())),
    ));

    match cli.command {
        Command::File {
            path,
            max_field_bytes,
            flags,
        } => {
            let options = options_from(&flags, &pipeline_config);
            let source: Box<dyn RecordSource> = match max_field_bytes {
                Some(limit) => Box::new(FileSource::open_with_limit(&path, limit)?),
                None => Box::new(FileSource::open(&path)?),
            };
            let pipeline = ImportPipeline::new(repository, metrics, options);
            let summary = pipeline.run(source).await?;
            print!("{summary}");
        }

        Command::Registry {
            department,
            activity_prefix,
            page_size,
            quota,
            quota_window_secs,
            flags,
        } => {
            let mut registry_config = RegistryApiConfig::from_env()?;
            if let Some(quota) = quota {
                registry_config.quota = quota;
            }
            if let Some(secs) = quota_window_secs {
                registry_config.quota_window = Duration::from_secs(secs);
            }
            registry_config.validate()?;
            let options = options_from(&flags, &pipeline_config);

            let client = Arc::new(
                RegistryClient::new(&registry_config)?.with_metrics(metrics.clone()),
            );
            let mut query = SearchQuery::department(&department);
            query.activity_prefix = activity_prefix;

            let mut source = RegistrySource::new(client, query)?;
            if let Some(page_size) = page_size {
                source = source.with_page_size(page_size);
            }

            let pipeline = ImportPipeline::new(repository, metrics, options);
            let summary = pipeline.run(Box::new(source)).await?;
            print!("{summary}");
        }

        Command::RetryFailed {
            limit,
            max_retries,
            no_lookup,
        } => {
            let client = if no_lookup {
                None
            } else {
                let registry_config = RegistryApiConfig::from_env()?;
                registry_config.validate()?;
                Some(Arc::new(
                    RegistryClient::new(&registry_config)?.with_metrics(metrics.clone()),
                ))
            };

            let pipeline =
                ImportPipeline::new(repository, metrics, PipelineOptions::default());
            let summary = pipeline.retry_failed(client, limit, max_retries).await?;
            print!("{summary}");
        }

        Command::PurgeFailed { older_than_days } => {
            let cutoff = chrono::Utc::now() - chrono::Duration::days(older_than_days);
            let purged = repository.purge_failed_items(cutoff).await?;
            println!("purged {purged} failed items older than {older_than_days} days");
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    if let Err(e) = run(cli).await {
        error!(error = %e, "annuaire-ingest failed");
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
