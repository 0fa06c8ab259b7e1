//! Resumable import checkpoints
//!
//! A checkpoint records how far a source has been durably committed. It is
//! written strictly after the batch transaction it describes, so a crash
//! between the two replays the batch rather than losing it; the
//! conflict-tolerant writes make the replay harmless.

use crate::repository::Repository;
use crate::source::SourceCursor;
use crate::{IngestionError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub source_id: String,
    pub cursor: SourceCursor,
    pub processed: u64,
    pub created: u64,
    pub updated: u64,
    pub failed: u64,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn start(source_id: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            cursor: SourceCursor::Start,
            processed: 0,
            created: 0,
            updated: 0,
            failed: 0,
            updated_at: Utc::now(),
        }
    }
}

/// Loads and persists the checkpoint for one source, refusing to move it
/// backwards.
pub struct CheckpointManager {
    repository: Arc<dyn Repository>,
    source_id: String,
    last_position: u64,
}

impl CheckpointManager {
    pub fn new(repository: Arc<dyn Repository>, source_id: &str) -> Self {
        Self {
            repository,
            source_id: source_id.to_string(),
            last_position: 0,
        }
    }

    pub async fn load(&mut self) -> Result<Option<Checkpoint>> {
        let checkpoint = self.repository.load_checkpoint(&self.source_id).await?;
        if let Some(cp) = &checkpoint {
            self.last_position = cp.cursor.position();
            debug!(
                source = %self.source_id,
                position = self.last_position,
                processed = cp.processed,
                "checkpoint loaded"
            );
        }
        Ok(checkpoint)
    }

    /// Persist progress. Rejects cursors that would move the resume point
    /// backwards; that only happens on a logic error upstream.
    pub async fn save(&mut self, checkpoint: &Checkpoint) -> Result<()> {
        if checkpoint.source_id != self.source_id {
            return Err(IngestionError::Checkpoint(format!(
                "checkpoint for {} saved through manager of {}",
                checkpoint.source_id, self.source_id
            )));
        }

        let position = checkpoint.cursor.position();
        if position < self.last_position {
            warn!(
                position,
                last = self.last_position,
                "refusing to move checkpoint backwards"
            );
            return Ok(());
        }

        self.repository.save_checkpoint(checkpoint).await?;
        self.last_position = position;
        Ok(())
    }
}
