use crate::state_machine::ChunkStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Independently executable unit of work within one step of an instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkChunk {
    pub chunk_id: Uuid,
    pub instance_id: Uuid,
    pub step_index: usize,
    pub step_id: String,
    pub payload: Value,
    pub status: ChunkStatus,
    pub records_processed: u64,
    pub error_message: Option<String>,
    /// Payloads this chunk handed to the next step
    pub emitted: Vec<Value>,
    pub create_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub enqueued_at: Option<DateTime<Utc>>,
}

impl WorkChunk {
    pub fn new(instance_id: Uuid, step_index: usize, step_id: impl Into<String>, payload: Value) -> Self {
        Self {
            chunk_id: Uuid::new_v4(),
            instance_id,
            step_index,
            step_id: step_id.into(),
            payload,
            status: ChunkStatus::Pending,
            records_processed: 0,
            error_message: None,
            emitted: Vec::new(),
            create_time: Utc::now(),
            start_time: None,
            end_time: None,
            enqueued_at: None,
        }
    }

    pub fn notification(&self) -> ChunkWorkNotification {
        ChunkWorkNotification {
            instance_id: self.instance_id,
            chunk_id: self.chunk_id,
            step_index: self.step_index,
        }
    }
}

/// Queue message pointing a worker at a persisted chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkWorkNotification {
    pub instance_id: Uuid,
    pub chunk_id: Uuid,
    pub step_index: usize,
}

/// Aggregate view over an instance's chunks, computed on one snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkTally {
    pub pending: usize,
    pub in_progress: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub records_processed: u64,
}

impl ChunkTally {
    pub fn from_chunks<'a>(chunks: impl IntoIterator<Item = &'a WorkChunk>) -> Self {
        chunks.into_iter().fold(Self::default(), |mut tally, chunk| {
            match chunk.status {
                ChunkStatus::Pending => tally.pending += 1,
                ChunkStatus::InProgress => tally.in_progress += 1,
                ChunkStatus::Success => {
                    tally.succeeded += 1;
                    tally.records_processed += chunk.records_processed;
                }
                ChunkStatus::Failed => tally.failed += 1,
            }
            tally
        })
    }

    pub fn open(&self) -> usize {
        self.pending + self.in_progress
    }

    pub fn total(&self) -> usize {
        self.open() + self.succeeded + self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tally_counts_statuses_and_records() {
        let instance_id = Uuid::new_v4();
        let mut chunks: Vec<WorkChunk> = (0..5)
            .map(|i| WorkChunk::new(instance_id, 0, "step", json!(i)))
            .collect();
        chunks[0].status = ChunkStatus::Success;
        chunks[0].records_processed = 7;
        chunks[1].status = ChunkStatus::Success;
        chunks[1].records_processed = 3;
        chunks[2].status = ChunkStatus::Failed;
        chunks[3].status = ChunkStatus::InProgress;

        let tally = ChunkTally::from_chunks(&chunks);
        assert_eq!(tally.succeeded, 2);
        assert_eq!(tally.failed, 1);
        assert_eq!(tally.in_progress, 1);
        assert_eq!(tally.pending, 1);
        assert_eq!(tally.records_processed, 10);
        assert_eq!(tally.open(), 2);
        assert_eq!(tally.total(), 5);
    }
}
