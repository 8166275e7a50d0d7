// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Time- and capacity-bounded inbox queue.
//!
//! The replicator accumulates work into a [`Batcher`] and drains it to its
//! processor in batches, bounded by item count and by how long the oldest
//! pending item has been waiting:
//!
//! ```text
//! queue() ──▶ buffer ──▶ take() when len ≥ capacity
//!                │              or delay elapsed since first item
//!                └──▶ flush deadline observable via time_until_flush()
//! ```
//!
//! The batcher itself never blocks and owns no task: the replicator's
//! driver loop sleeps on [`Batcher::time_until_flush`] and calls
//! [`Batcher::take`] when [`Batcher::should_flush`] turns true (or
//! unconditionally on `stop()`). Because a single driver task owns the
//! batcher and awaits the processor before the next take, processor
//! invocations are serialized and items enqueued mid-processing land in a
//! fresh buffer.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Debounced FIFO buffer with a size and an age trigger.
#[derive(Debug)]
pub struct Batcher<T> {
    capacity: usize,
    delay: Duration,
    buffer: VecDeque<T>,
    /// When the oldest currently-pending item was queued.
    first_queued_at: Option<Instant>,
}

impl<T> Batcher<T> {
    /// Create a batcher flushing at `capacity` items or `delay` after the
    /// first pending item, whichever comes first.
    pub fn new(capacity: usize, delay: Duration) -> Self {
        Self {
            capacity,
            delay,
            buffer: VecDeque::new(),
            first_queued_at: None,
        }
    }

    /// Append one item, preserving enqueue order.
    pub fn queue(&mut self, item: T) {
        if self.first_queued_at.is_none() {
            self.first_queued_at = Some(Instant::now());
        }
        self.buffer.push_back(item);
    }

    /// Append many items.
    pub fn queue_all(&mut self, items: impl IntoIterator<Item = T>) {
        for item in items {
            self.queue(item);
        }
    }

    /// Pending item count, observable without flushing.
    pub fn count(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Whether either flush trigger has fired.
    pub fn should_flush(&self) -> bool {
        if self.buffer.len() >= self.capacity {
            return true;
        }
        match self.first_queued_at {
            Some(at) => at.elapsed() >= self.delay,
            None => false,
        }
    }

    /// Time until the age trigger fires, `None` when the buffer is empty.
    /// Zero when a flush is already due.
    pub fn time_until_flush(&self) -> Option<Duration> {
        if self.buffer.is_empty() {
            return None;
        }
        if self.buffer.len() >= self.capacity {
            return Some(Duration::ZERO);
        }
        let at = self.first_queued_at?;
        Some(self.delay.saturating_sub(at.elapsed()))
    }

    /// Snapshot and clear the buffer, resetting the age timer. Items are
    /// returned in enqueue order.
    pub fn take(&mut self) -> Vec<T> {
        self.first_queued_at = None;
        self.buffer.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_preserves_order() {
        let mut batcher = Batcher::new(10, Duration::from_millis(500));
        batcher.queue(1);
        batcher.queue_all([2, 3, 4]);
        assert_eq!(batcher.count(), 4);
        assert_eq!(batcher.take(), vec![1, 2, 3, 4]);
        assert!(batcher.is_empty());
    }

    #[test]
    fn test_capacity_triggers_flush() {
        let mut batcher = Batcher::new(3, Duration::from_secs(3600));
        batcher.queue(1);
        batcher.queue(2);
        assert!(!batcher.should_flush());
        batcher.queue(3);
        assert!(batcher.should_flush());
        assert_eq!(batcher.time_until_flush(), Some(Duration::ZERO));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_triggers_flush() {
        let mut batcher = Batcher::new(100, Duration::from_millis(500));
        batcher.queue("item");
        assert!(!batcher.should_flush());

        tokio::time::advance(Duration::from_millis(499)).await;
        assert!(!batcher.should_flush());

        tokio::time::advance(Duration::from_millis(2)).await;
        assert!(batcher.should_flush());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_measured_from_first_item() {
        let mut batcher = Batcher::new(100, Duration::from_millis(500));
        batcher.queue(1);
        tokio::time::advance(Duration::from_millis(400)).await;
        // A second item does not push the deadline out.
        batcher.queue(2);
        tokio::time::advance(Duration::from_millis(101)).await;
        assert!(batcher.should_flush());
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_resets_timer() {
        let mut batcher = Batcher::new(100, Duration::from_millis(500));
        batcher.queue(1);
        tokio::time::advance(Duration::from_millis(600)).await;
        assert_eq!(batcher.take(), vec![1]);

        // Fresh buffer, fresh timer.
        assert_eq!(batcher.time_until_flush(), None);
        batcher.queue(2);
        assert!(!batcher.should_flush());
        let remaining = batcher.time_until_flush().unwrap();
        assert!(remaining > Duration::from_millis(400));
    }

    #[test]
    fn test_empty_batcher_never_flushes() {
        let batcher: Batcher<u8> = Batcher::new(1, Duration::ZERO);
        assert!(!batcher.should_flush());
        assert_eq!(batcher.time_until_flush(), None);
    }
}
