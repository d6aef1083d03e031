pub mod chunk_queue;

pub use chunk_queue::{ChunkQueue, ChunkQueueStats};
