//! # Chunk Queue
//!
//! Multi-producer, multi-consumer queue of [`ChunkWorkNotification`]s shared by
//! the step sequencer (producer), the cleaner (re-enqueue of orphaned chunks)
//! and the worker pool (consumers).
//!
//! Delivery is at-least-once: the same chunk may be delivered twice when the
//! cleaner re-enqueues it. Workers claim chunks with a compare-and-update in
//! the store, so duplicates are skipped there. Consumers must not assume FIFO
//! completion order.

use crate::error::{BatchError, BatchResult};
use crate::models::ChunkWorkNotification;
use crossbeam::queue::SegQueue;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChunkQueueStats {
    pub depth: usize,
    pub enqueued_total: u64,
    pub dequeued_total: u64,
}

#[derive(Debug, Default)]
pub struct ChunkQueue {
    items: SegQueue<ChunkWorkNotification>,
    notify: Notify,
    closed: AtomicBool,
    enqueued_total: AtomicU64,
    dequeued_total: AtomicU64,
}

impl ChunkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, notification: ChunkWorkNotification) -> BatchResult<()> {
        if self.is_closed() {
            return Err(BatchError::Internal("Chunk queue is closed".to_string()));
        }
        self.items.push(notification);
        self.enqueued_total.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_one();
        Ok(())
    }

    pub fn enqueue_all(
        &self,
        notifications: impl IntoIterator<Item = ChunkWorkNotification>,
    ) -> BatchResult<usize> {
        let mut count = 0;
        for notification in notifications {
            self.enqueue(notification)?;
            count += 1;
        }
        Ok(count)
    }

    pub fn try_dequeue(&self) -> Option<ChunkWorkNotification> {
        let item = self.items.pop();
        if item.is_some() {
            self.dequeued_total.fetch_add(1, Ordering::Relaxed);
        }
        item
    }

    /// Wait up to `wait` for a notification; `None` on timeout or once closed and empty
    pub async fn dequeue_timeout(&self, wait: Duration) -> Option<ChunkWorkNotification> {
        loop {
            if let Some(item) = self.try_dequeue() {
                return Some(item);
            }
            if self.is_closed() {
                return None;
            }
            if tokio::time::timeout(wait, self.notify.notified()).await.is_err() {
                return self.try_dequeue();
            }
        }
    }

    /// Stop accepting work and wake every waiting consumer
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn stats(&self) -> ChunkQueueStats {
        ChunkQueueStats {
            depth: self.len(),
            enqueued_total: self.enqueued_total.load(Ordering::Relaxed),
            dequeued_total: self.dequeued_total.load(Ordering::Relaxed),
        }
    }
}
