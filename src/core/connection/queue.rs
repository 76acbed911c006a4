//! Bounded FIFO of text waiting for a ready connection.

use std::collections::VecDeque;

use tracing::warn;

/// Outbound texts held while the connection is not open.
///
/// When full, the oldest entry is dropped to make room.
#[derive(Debug)]
pub struct PendingText {
    items: VecDeque<String>,
    capacity: usize,
    dropped: u64,
}

impl PendingText {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
            dropped: 0,
        }
    }

    /// Append to the tail. Returns the entry evicted to make room, if any.
    pub fn push(&mut self, text: String) -> Option<String> {
        self.items.push_back(text);
        self.evict()
    }

    /// Put texts that failed to send back at the head, preserving their order.
    pub fn requeue_front(&mut self, texts: Vec<String>) {
        for text in texts.into_iter().rev() {
            self.items.push_front(text);
        }
        while self.evict().is_some() {}
    }

    /// Take every queued text in FIFO order.
    pub fn drain(&mut self) -> Vec<String> {
        self.items.drain(..).collect()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Total entries evicted since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn evict(&mut self) -> Option<String> {
        if self.items.len() <= self.capacity {
            return None;
        }
        let evicted = self.items.pop_front()?;
        self.dropped += 1;
        warn!(
            capacity = self.capacity,
            "Pending text queue full, dropping oldest entry"
        );
        Some(evicted)
    }
}
