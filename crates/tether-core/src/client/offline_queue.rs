//! Outbound requests held while the link is down.

use crate::protocol::RequestEnvelope;
use std::collections::VecDeque;

/// FIFO buffer of request envelopes issued while disconnected.
///
/// Entries are replayed exactly once on the next connect and then discarded.
/// An entry whose request timed out while queued is removed with
/// [`OfflineQueue::discard`] and never reaches the server.
#[derive(Debug, Default)]
pub struct OfflineQueue {
    entries: VecDeque<RequestEnvelope>,
}

impl OfflineQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, envelope: RequestEnvelope) {
        self.entries.push_back(envelope);
    }

    /// Take every queued envelope in submission order, leaving the queue empty.
    pub fn drain(&mut self) -> Vec<RequestEnvelope> {
        self.entries.drain(..).collect()
    }

    /// Put envelopes back at the front, keeping their order.
    ///
    /// Used when the link drops again part-way through a replay.
    pub fn requeue_front(&mut self, envelopes: impl IntoIterator<Item = RequestEnvelope>) {
        let mut rest = std::mem::take(&mut self.entries);
        self.entries.extend(envelopes);
        self.entries.append(&mut rest);
    }

    /// Remove the envelopes with the given ids. Returns how many were removed.
    pub fn discard(&mut self, ids: &[String]) -> usize {
        let before = self.entries.len();
        self.entries.retain(|envelope| !ids.contains(&envelope.id));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(id: &str) -> RequestEnvelope {
        RequestEnvelope {
            id: id.to_string(),
            method: "insert".to_string(),
            params: vec![],
            collection: None,
            timestamp: 0,
        }
    }

    fn ids(envelopes: &[RequestEnvelope]) -> Vec<&str> {
        envelopes.iter().map(|e| e.id.as_str()).collect()
    }

    #[test]
    fn test_drain_preserves_submission_order() {
        let mut queue = OfflineQueue::new();
        for id in ["a", "b", "c"] {
            queue.push(envelope(id));
        }

        let drained = queue.drain();
        assert_eq!(ids(&drained), vec!["a", "b", "c"]);
        assert!(queue.is_empty());
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn test_requeue_front_keeps_unsent_ahead_of_new() {
        let mut queue = OfflineQueue::new();
        queue.push(envelope("late"));
        queue.requeue_front(vec![envelope("a"), envelope("b")]);

        assert_eq!(queue.len(), 3);
        assert_eq!(ids(&queue.drain()), vec!["a", "b", "late"]);
    }

    #[test]
    fn test_discard_removes_only_named_ids() {
        let mut queue = OfflineQueue::new();
        for id in ["a", "b", "c"] {
            queue.push(envelope(id));
        }

        assert_eq!(queue.discard(&["b".to_string(), "zzz".to_string()]), 1);
        assert_eq!(ids(&queue.drain()), vec!["a", "c"]);
    }
}
