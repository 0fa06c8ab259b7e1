//! In-run import metrics with bounded memory
//!
//! Counters accumulate for the end-of-run summary while individual samples
//! buffer up to a fixed capacity; a full buffer flushes to the sink (the
//! metrics table in practice). A failed flush drops the drained samples and
//! logs a warning: observability must never abort an import.

use annuaire_core::{retry_with_backoff, RetryPolicy};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::warn;

/// One counter increment with its timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSample {
    pub name: String,
    pub value: f64,
    pub recorded_at: DateTime<Utc>,
}

/// Durable destination for drained samples.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn append_metrics(&self, samples: &[MetricSample]) -> crate::Result<()>;
}

#[derive(Default)]
struct Inner {
    counters: BTreeMap<String, u64>,
    buffer: Vec<MetricSample>,
}

pub struct MetricsCollector {
    capacity: usize,
    sink: Option<Arc<dyn MetricsSink>>,
    inner: Mutex<Inner>,
}

impl MetricsCollector {
    /// Collector without a sink: counters only, samples discarded on
    /// overflow. Used by tests and the dry paths.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            sink: None,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn with_sink(capacity: usize, sink: Arc<dyn MetricsSink>) -> Self {
        Self {
            capacity: capacity.max(1),
            sink: Some(sink),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub async fn record(&self, name: &str) {
        self.add(name, 1.0).await;
    }

    pub async fn add(&self, name: &str, value: f64) {
        let drained = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            *inner.counters.entry(name.to_string()).or_insert(0) += value.max(0.0) as u64;
            inner.buffer.push(MetricSample {
                name: name.to_string(),
                value,
                recorded_at: Utc::now(),
            });
            if inner.buffer.len() >= self.capacity {
                Some(std::mem::take(&mut inner.buffer))
            } else {
                None
            }
        };

        if let Some(batch) = drained {
            self.flush_batch(batch).await;
        }
    }

    /// Drain whatever is buffered. Called once at end of run.
    pub async fn flush(&self) {
        let batch = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut inner.buffer)
        };
        if !batch.is_empty() {
            self.flush_batch(batch).await;
        }
    }

    async fn flush_batch(&self, batch: Vec<MetricSample>) {
        let Some(sink) = &self.sink else {
            return;
        };

        let result = retry_with_backoff(
            || async { sink.append_metrics(&batch).await },
            RetryPolicy::gentle(),
            |e: &crate::IngestionError| e.is_retryable(),
        )
        .await;

        if let Err(e) = result {
            warn!(samples = batch.len(), error = %e, "metrics flush failed, samples dropped");
        }
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .counters
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    pub fn counters(&self) -> BTreeMap<String, u64> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .counters
            .clone()
    }
}

/// End-of-run statistics, printed to the operator and logged.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub source_id: String,
    pub processed: u64,
    pub created: u64,
    pub updated: u64,
    pub listings: u64,
    pub conflicts: u64,
    pub failed: u64,
    /// False when the run stopped at its deadline with input remaining.
    pub completed: bool,
    pub duration: Duration,
    pub counters: BTreeMap<String, u64>,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "import of {} {} in {:.1}s",
            self.source_id,
            if self.completed { "completed" } else { "stopped at deadline" },
            self.duration.as_secs_f64()
        )?;
        writeln!(f, "  processed  {}", self.processed)?;
        writeln!(f, "  created    {}", self.created)?;
        writeln!(f, "  updated    {}", self.updated)?;
        writeln!(f, "  listings   {}", self.listings)?;
        writeln!(f, "  conflicts  {}", self.conflicts)?;
        writeln!(f, "  failed     {}", self.failed)?;
        for (name, count) in &self.counters {
            writeln!(f, "  {name}: {count}")?;
        }
        Ok(())
    }
}
