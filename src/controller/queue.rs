//! Pending-change queue feeding the task controller.
//!
//! Multi-producer (git watcher), single-consumer (controller) FIFO. Duplicate
//! paths are allowed and meaningful — each occurrence represents a distinct
//! revision trigger, so the queue never deduplicates.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::Mutex;

#[derive(Debug)]
pub struct PendingQueue {
    queue: Mutex<VecDeque<String>>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Append a changed file. Never blocks the producer beyond the lock.
    pub async fn enqueue(&self, file: impl Into<String>) {
        self.queue.lock().await.push_back(file.into());
    }

    /// Remove and return the oldest change, or `None` when empty.
    /// Non-blocking — the controller must never stall on an empty queue.
    pub async fn try_dequeue(&self) -> Option<String> {
        self.queue.lock().await.pop_front()
    }

    /// Whether any pending change exists for `file`. Snapshot only: the
    /// answer can go stale as soon as the lock is released, so callers that
    /// need check-and-consume use [`take_first`](Self::take_first) instead.
    pub async fn contains(&self, file: &str) -> bool {
        self.queue.lock().await.iter().any(|f| f == file)
    }

    /// Remove the oldest pending change for `file`, if one exists.
    /// Check and consume happen under one lock, so the admission pass cannot
    /// dequeue the same occurrence concurrently.
    pub async fn take_first(&self, file: &str) -> bool {
        let mut queue = self.queue.lock().await;
        if let Some(pos) = queue.iter().position(|f| f == file) {
            queue.remove(pos);
            true
        } else {
            false
        }
    }

    /// Current queue depth.
    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Returns `true` if the queue is empty.
    pub async fn is_empty(&self) -> bool {
        self.queue.lock().await.is_empty()
    }
}

impl Default for PendingQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe wrapper shared between the watcher and the controller.
pub type SharedPendingQueue = Arc<PendingQueue>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fifo_order_preserved() {
        let queue = PendingQueue::new();
        queue.enqueue("a").await;
        queue.enqueue("b").await;
        queue.enqueue("c").await;

        assert_eq!(queue.try_dequeue().await.as_deref(), Some("a"));
        assert_eq!(queue.try_dequeue().await.as_deref(), Some("b"));
        assert_eq!(queue.try_dequeue().await.as_deref(), Some("c"));
        assert_eq!(queue.try_dequeue().await, None);
    }

    #[tokio::test]
    async fn duplicates_are_kept() {
        let queue = PendingQueue::new();
        queue.enqueue("x").await;
        queue.enqueue("x").await;

        assert_eq!(queue.len().await, 2);
        assert_eq!(queue.try_dequeue().await.as_deref(), Some("x"));
        assert!(queue.contains("x").await);
    }

    #[tokio::test]
    async fn take_first_removes_oldest_occurrence_only() {
        let queue = PendingQueue::new();
        queue.enqueue("a").await;
        queue.enqueue("b").await;
        queue.enqueue("a").await;

        assert!(queue.take_first("a").await);
        assert_eq!(queue.len().await, 2);
        // "b" is now at the head; the second "a" survives.
        assert_eq!(queue.try_dequeue().await.as_deref(), Some("b"));
        assert_eq!(queue.try_dequeue().await.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn take_first_on_missing_file() {
        let queue = PendingQueue::new();
        queue.enqueue("a").await;

        assert!(!queue.take_first("b").await);
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn empty_queue_does_not_block() {
        let queue = PendingQueue::new();
        assert!(queue.is_empty().await);
        assert_eq!(queue.try_dequeue().await, None);
    }
}
