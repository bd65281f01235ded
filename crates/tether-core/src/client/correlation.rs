//! Pending-request table and chunk reassembly.
//!
//! The table is the single source of truth for "is this id still awaited".
//! Each entry resolves through exactly one of three paths: its deadline
//! passes, its terminal response arrives, or every chunk of its stream has
//! arrived. The first path removes the entry, so later events for the same id
//! find nothing and are dropped.
//!
//! Deadlines are explicit values. A chunk moves its request's deadline to
//! `now + timeout`, so a stream that keeps making progress never expires while
//! a stalled one expires one timeout after its last chunk.

use crate::protocol::{ChunkEnvelope, ResponseEnvelope};
use crate::{Result, TetherError};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Where a request's outcome is delivered.
pub type Completion = oneshot::Sender<Result<Value>>;

#[derive(Debug)]
struct PendingRequest {
    completion: Completion,
    timeout: Duration,
    deadline: Instant,
    chunks: BTreeMap<u32, Vec<Value>>,
    received_chunks: u32,
    total_chunks: Option<u32>,
}

impl PendingRequest {
    fn is_fully_assembled(&self) -> bool {
        match self.total_chunks {
            Some(total) => {
                total > 0
                    && self.chunks.len() as u32 == total
                    && self.chunks.keys().next_back() == Some(&(total - 1))
            }
            None => false,
        }
    }
}

/// Outstanding requests keyed by correlation id.
#[derive(Debug, Default)]
pub struct CorrelationTable {
    pending: HashMap<String, PendingRequest>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start awaiting `id`. Its deadline is `now + timeout`.
    ///
    /// Returns `false` (and drops `completion`) if `id` is already pending.
    pub fn register(
        &mut self,
        id: impl Into<String>,
        completion: Completion,
        timeout: Duration,
        now: Instant,
    ) -> bool {
        let id = id.into();
        if self.pending.contains_key(&id) {
            warn!("Refusing to register duplicate request id {}", id);
            return false;
        }
        self.pending.insert(
            id,
            PendingRequest {
                completion,
                timeout,
                deadline: now + timeout,
                chunks: BTreeMap::new(),
                received_chunks: 0,
                total_chunks: None,
            },
        );
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn deadline_of(&self, id: &str) -> Option<Instant> {
        self.pending.get(id).map(|p| p.deadline)
    }

    /// Chunks received so far for `id`.
    pub fn received_chunks(&self, id: &str) -> Option<u32> {
        self.pending.get(id).map(|p| p.received_chunks)
    }

    /// Earliest deadline across all pending requests.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    /// Handle a terminal response. Returns `true` if it resolved a request.
    pub fn on_response(&mut self, response: ResponseEnvelope) -> bool {
        let Some(pending) = self.pending.remove(&response.id) else {
            debug!("Ignoring response for unknown or settled request {}", response.id);
            return false;
        };

        let outcome = match response.error {
            Some(err) => Err(TetherError::from_wire(err)),
            None if pending.chunks.is_empty() => Ok(response.result),
            // With chunks present the result is only the stream-complete marker.
            None => assemble(&response.id, pending.chunks, pending.total_chunks),
        };

        let _ = pending.completion.send(outcome);
        true
    }

    /// Handle one chunk. Returns `true` if the chunk completed its stream.
    pub fn on_chunk(&mut self, chunk: ChunkEnvelope, now: Instant) -> bool {
        let Some(pending) = self.pending.get_mut(&chunk.id) else {
            debug!(
                "Ignoring chunk {} for unknown or settled request {}",
                chunk.index, chunk.id
            );
            return false;
        };

        if chunk.index >= chunk.total_chunks {
            warn!(
                "Dropping chunk {} of request {}: index outside totalChunks {}",
                chunk.index, chunk.id, chunk.total_chunks
            );
            return false;
        }

        if pending.chunks.insert(chunk.index, chunk.chunk).is_none() {
            pending.received_chunks += 1;
        }
        pending.total_chunks = Some(chunk.total_chunks);
        pending.deadline = now + pending.timeout;

        if !pending.is_fully_assembled() {
            return false;
        }

        let Some(pending) = self.pending.remove(&chunk.id) else {
            return false;
        };
        let outcome = assemble(&chunk.id, pending.chunks, pending.total_chunks);
        let _ = pending.completion.send(outcome);
        true
    }

    /// Fail every request whose deadline is at or before `now`.
    ///
    /// Returns the expired ids.
    pub fn expire(&mut self, now: Instant) -> Vec<String> {
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            if let Some(pending) = self.pending.remove(id) {
                debug!("Request {} timed out after {:?}", id, pending.timeout);
                let _ = pending.completion.send(Err(TetherError::RequestTimeout {
                    id: id.clone(),
                    timeout: pending.timeout,
                }));
            }
        }
        expired
    }
}

/// Concatenate chunks by ascending index; indices must cover `0..total`.
fn assemble(id: &str, chunks: BTreeMap<u32, Vec<Value>>, total: Option<u32>) -> Result<Value> {
    let expected = total.unwrap_or_else(|| chunks.keys().next_back().map_or(0, |max| max + 1));
    let missing: Vec<u32> = (0..expected).filter(|i| !chunks.contains_key(i)).collect();
    if !missing.is_empty() {
        return Err(TetherError::StreamIncomplete {
            id: id.to_string(),
            missing,
        });
    }

    let items: Vec<Value> = chunks.into_values().flatten().collect();
    Ok(Value::Array(items))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::WireError;
    use serde_json::json;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn register(table: &mut CorrelationTable, id: &str, now: Instant) -> oneshot::Receiver<Result<Value>> {
        let (tx, rx) = oneshot::channel();
        assert!(table.register(id, tx, TIMEOUT, now));
        rx
    }

    fn chunk(id: &str, index: u32, total: u32, items: Vec<Value>) -> ChunkEnvelope {
        ChunkEnvelope {
            id: id.to_string(),
            chunk: items,
            index,
            total_chunks: total,
        }
    }

    fn stream_complete(id: &str, count: usize) -> ResponseEnvelope {
        ResponseEnvelope::success(id, json!({"streamed": true, "count": count}), 3)
    }

    #[test]
    fn test_plain_response_resolves_with_result() {
        let now = Instant::now();
        let mut table = CorrelationTable::new();
        let mut rx = register(&mut table, "a", now);

        let result = json!({"nested": [1, "two", null]});
        assert!(table.on_response(ResponseEnvelope::success("a", result.clone(), 1)));

        assert_eq!(rx.try_recv().unwrap().unwrap(), result);
        assert!(table.is_empty());
    }

    #[test]
    fn test_error_response_maps_kind() {
        let now = Instant::now();
        let mut table = CorrelationTable::new();
        let mut rx = register(&mut table, "a", now);

        table.on_response(ResponseEnvelope::failure(
            "a",
            WireError {
                name: "MethodNotFound".into(),
                message: "MethodNotFound: frobnicate".into(),
            },
            0,
        ));

        match rx.try_recv().unwrap() {
            Err(TetherError::MethodNotFound { method }) => assert_eq!(method, "frobnicate"),
            other => panic!("Expected MethodNotFound, got: {:?}", other),
        }
    }

    #[test]
    fn test_chunks_in_any_order_assemble_ascending() {
        let orders: [[u32; 4]; 4] = [[0, 1, 2, 3], [3, 2, 1, 0], [2, 0, 3, 1], [1, 3, 0, 2]];
        for order in orders {
            let now = Instant::now();
            let mut table = CorrelationTable::new();
            let mut rx = register(&mut table, "s", now);

            for (step, index) in order.iter().enumerate() {
                let items = vec![json!(index * 10), json!(index * 10 + 1)];
                let completed = table.on_chunk(chunk("s", *index, 4, items), now);
                assert_eq!(completed, step == 3, "order {:?}", order);
            }

            let expected: Vec<Value> = (0..4u32)
                .flat_map(|i| vec![json!(i * 10), json!(i * 10 + 1)])
                .collect();
            assert_eq!(rx.try_recv().unwrap().unwrap(), Value::Array(expected));

            // The terminal response after full assembly is a no-op.
            assert!(!table.on_response(stream_complete("s", 8)));
        }
    }

    #[test]
    fn test_terminal_response_with_gap_is_stream_incomplete() {
        let now = Instant::now();
        let mut table = CorrelationTable::new();
        let mut rx = register(&mut table, "s", now);

        table.on_chunk(chunk("s", 0, 3, vec![json!(1)]), now);
        table.on_chunk(chunk("s", 2, 3, vec![json!(3)]), now);
        table.on_response(stream_complete("s", 3));

        match rx.try_recv().unwrap() {
            Err(TetherError::StreamIncomplete { id, missing }) => {
                assert_eq!(id, "s");
                assert_eq!(missing, vec![1]);
            }
            other => panic!("Expected StreamIncomplete, got: {:?}", other),
        }
    }

    #[test]
    fn test_terminal_error_wins_over_chunks() {
        let now = Instant::now();
        let mut table = CorrelationTable::new();
        let mut rx = register(&mut table, "s", now);

        table.on_chunk(chunk("s", 0, 2, vec![json!(1)]), now);
        table.on_response(ResponseEnvelope::failure(
            "s",
            WireError {
                name: "ServerError".into(),
                message: "engine exploded".into(),
            },
            9,
        ));

        assert!(matches!(rx.try_recv().unwrap(), Err(TetherError::Server { .. })));
    }

    #[test]
    fn test_duplicate_chunk_index_does_not_double_count() {
        let now = Instant::now();
        let mut table = CorrelationTable::new();
        let _rx = register(&mut table, "s", now);

        table.on_chunk(chunk("s", 0, 3, vec![json!("old")]), now);
        table.on_chunk(chunk("s", 0, 3, vec![json!("new")]), now);

        assert_eq!(table.received_chunks("s"), Some(1));
    }

    #[test]
    fn test_out_of_range_chunk_is_dropped() {
        let now = Instant::now();
        let mut table = CorrelationTable::new();
        let _rx = register(&mut table, "s", now);

        assert!(!table.on_chunk(chunk("s", 5, 2, vec![json!(1)]), now));
        assert_eq!(table.received_chunks("s"), Some(0));
        assert_eq!(table.deadline_of("s"), Some(now + TIMEOUT));
    }

    #[test]
    fn test_chunk_pushes_deadline_forward() {
        let start = Instant::now();
        let mut table = CorrelationTable::new();
        let mut rx = register(&mut table, "s", start);
        assert_eq!(table.deadline_of("s"), Some(start + TIMEOUT));

        // Progress every 4s keeps a 5s-timeout stream alive well past 5s.
        let mut now = start;
        for index in 0..3 {
            now += Duration::from_secs(4);
            assert!(table.expire(now).is_empty());
            table.on_chunk(chunk("s", index, 10, vec![json!(index)]), now);
            assert_eq!(table.deadline_of("s"), Some(now + TIMEOUT));
        }

        // Then it stalls for one full timeout.
        let expired = table.expire(now + TIMEOUT);
        assert_eq!(expired, vec!["s".to_string()]);
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(TetherError::RequestTimeout { .. })
        ));
    }

    #[test]
    fn test_events_after_timeout_are_no_ops() {
        let now = Instant::now();
        let mut table = CorrelationTable::new();
        let mut rx = register(&mut table, "a", now);

        assert_eq!(table.expire(now + TIMEOUT).len(), 1);
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(TetherError::RequestTimeout { .. })
        ));

        assert!(!table.on_chunk(chunk("a", 0, 1, vec![json!(1)]), now));
        assert!(!table.on_response(ResponseEnvelope::success("a", json!(1), 0)));
        assert!(!table.contains("a"));
        assert!(table.expire(now + TIMEOUT * 2).is_empty());
    }

    #[test]
    fn test_next_deadline_is_minimum() {
        let now = Instant::now();
        let mut table = CorrelationTable::new();
        assert_eq!(table.next_deadline(), None);

        let (tx, _rx1) = oneshot::channel();
        table.register("long", tx, Duration::from_secs(60), now);
        let (tx, _rx2) = oneshot::channel();
        table.register("short", tx, Duration::from_secs(1), now);

        assert_eq!(table.next_deadline(), Some(now + Duration::from_secs(1)));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let now = Instant::now();
        let mut table = CorrelationTable::new();
        let _rx = register(&mut table, "a", now);

        let (tx, mut rx2) = oneshot::channel();
        assert!(!table.register("a", tx, TIMEOUT, now));
        assert!(rx2.try_recv().is_err());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_dropped_caller_does_not_panic() {
        let now = Instant::now();
        let mut table = CorrelationTable::new();
        drop(register(&mut table, "a", now));
        assert!(table.on_response(ResponseEnvelope::success("a", json!(1), 0)));
    }
}
