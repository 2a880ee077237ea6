//! Bounded FIFO buffer for messages that could not be published.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::envelope::EventEnvelope;

/// Default buffer capacity.
pub const DEFAULT_BUFFER_CAPACITY: usize = 1000;

/// A message waiting for the broker.
#[derive(Debug, Clone)]
pub struct BufferedEntry {
    pub routing_key: String,
    pub envelope: Arc<EventEnvelope>,
}

impl BufferedEntry {
    pub fn new(routing_key: impl Into<String>, envelope: Arc<EventEnvelope>) -> Self {
        Self {
            routing_key: routing_key.into(),
            envelope,
        }
    }
}

/// FIFO buffer with a hard capacity.
///
/// When full, new entries are refused (handed back to the caller) rather than
/// evicting older ones, so replay preserves the earliest messages.
#[derive(Debug)]
pub struct PublishBuffer {
    entries: VecDeque<BufferedEntry>,
    capacity: usize,
}

impl PublishBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity,
        }
    }

    /// Append an entry. Returns the entry back if the buffer is full.
    pub fn push(&mut self, entry: BufferedEntry) -> Result<(), BufferedEntry> {
        if self.entries.len() >= self.capacity {
            return Err(entry);
        }
        self.entries.push_back(entry);
        Ok(())
    }

    /// Oldest entry, without removing it.
    pub fn front(&self) -> Option<&BufferedEntry> {
        self.entries.front()
    }

    pub fn pop_front(&mut self) -> Option<BufferedEntry> {
        self.entries.pop_front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Routing keys in replay order.
    pub fn routing_keys(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.routing_key.clone()).collect()
    }
}

impl Default for PublishBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(key: &str) -> BufferedEntry {
        BufferedEntry::new(key, Arc::new(EventEnvelope::new(key, json!({}))))
    }

    #[test]
    fn test_push_grows_by_one_until_full() {
        let mut buffer = PublishBuffer::new(3);
        for (i, key) in ["a", "b", "c"].iter().enumerate() {
            assert!(buffer.push(entry(key)).is_ok());
            assert_eq!(buffer.len(), i + 1);
        }
        assert!(buffer.is_full());

        let refused = buffer.push(entry("d")).unwrap_err();
        assert_eq!(refused.routing_key, "d");
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.routing_keys(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_fifo_order() {
        let mut buffer = PublishBuffer::new(10);
        buffer.push(entry("first")).unwrap();
        buffer.push(entry("second")).unwrap();

        assert_eq!(buffer.front().unwrap().routing_key, "first");
        assert_eq!(buffer.pop_front().unwrap().routing_key, "first");
        assert_eq!(buffer.pop_front().unwrap().routing_key, "second");
        assert!(buffer.pop_front().is_none());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_zero_capacity_refuses_everything() {
        let mut buffer = PublishBuffer::new(0);
        assert!(buffer.push(entry("a")).is_err());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_default_capacity() {
        assert_eq!(PublishBuffer::default().capacity(), DEFAULT_BUFFER_CAPACITY);
    }
}
