// In-memory event bus
//
// Full consumer-group semantics without a backing store: per-group
// cursors, per-consumer pending lists, bulk acknowledgment, cap-based
// eviction. Used by tests and local development.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use crate::{BusError, BusMessage, EventBus, MessageId, StartPosition, DEFAULT_STREAM_MAXLEN};

#[derive(Default)]
struct GroupState {
    /// Sequence number of the next entry to deliver.
    cursor: u64,
    /// Delivered but unacknowledged entries, keyed by sequence number,
    /// valued by the consumer they were delivered to.
    pending: HashMap<u64, String>,
}

#[derive(Default)]
struct StreamState {
    entries: Vec<(u64, Arc<Vec<u8>>)>,
    next_seq: u64,
    groups: HashMap<String, GroupState>,
}

/// In-memory [`EventBus`] implementation.
pub struct InMemoryEventBus {
    streams: Mutex<HashMap<String, StreamState>>,
    maxlen: usize,
    appended: Notify,
    failing: std::sync::atomic::AtomicBool,
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new(DEFAULT_STREAM_MAXLEN)
    }
}

impl InMemoryEventBus {
    pub fn new(maxlen: usize) -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
            maxlen,
            appended: Notify::new(),
            failing: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// When set, every operation fails with `Unavailable` until cleared.
    pub fn set_failing(&self, failing: bool) {
        self.failing
            .store(failing, std::sync::atomic::Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), BusError> {
        if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
            Err(BusError::Unavailable("bus offline".to_string()))
        } else {
            Ok(())
        }
    }

    /// Number of entries currently retained in a stream.
    pub async fn len(&self, stream: &str) -> usize {
        let streams = self.streams.lock().await;
        streams.get(stream).map_or(0, |s| s.entries.len())
    }

    pub async fn is_empty(&self, stream: &str) -> bool {
        self.len(stream).await == 0
    }

    /// Number of delivered-but-unacknowledged entries for a group.
    pub async fn pending_count(&self, stream: &str, group: &str) -> usize {
        let streams = self.streams.lock().await;
        streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map_or(0, |g| g.pending.len())
    }

    /// Snapshot of every payload currently retained in a stream, in order.
    pub async fn payloads(&self, stream: &str) -> Vec<Vec<u8>> {
        let streams = self.streams.lock().await;
        streams.get(stream).map_or_else(Vec::new, |s| {
            s.entries.iter().map(|(_, p)| p.as_ref().clone()).collect()
        })
    }

    fn parse_id(id: &str) -> Result<u64, BusError> {
        id.parse()
            .map_err(|_| BusError::Unavailable(format!("malformed message id {id:?}")))
    }

    fn collect_for_group(
        state: &mut StreamState,
        group: &str,
        consumer: &str,
        max_count: usize,
    ) -> Vec<BusMessage> {
        let Some(group_state) = state.groups.get_mut(group) else {
            return Vec::new();
        };
        let mut delivered = Vec::new();
        for (seq, payload) in &state.entries {
            if *seq < group_state.cursor {
                continue;
            }
            if delivered.len() >= max_count {
                break;
            }
            group_state.pending.insert(*seq, consumer.to_string());
            group_state.cursor = *seq + 1;
            delivered.push(BusMessage {
                id: seq.to_string(),
                payload: payload.as_ref().clone(),
            });
        }
        delivered
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn append(&self, stream: &str, payload: &[u8]) -> Result<MessageId, BusError> {
        self.check_available()?;
        let mut streams = self.streams.lock().await;
        let state = streams.entry(stream.to_string()).or_default();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.push((seq, Arc::new(payload.to_vec())));

        while state.entries.len() > self.maxlen {
            let (evicted, _) = state.entries.remove(0);
            for (group, group_state) in &state.groups {
                if group_state.pending.contains_key(&evicted) {
                    tracing::error!(
                        stream,
                        group,
                        message_id = evicted,
                        "stream cap evicted a pending entry: data lost"
                    );
                }
            }
        }

        drop(streams);
        self.appended.notify_waiters();
        Ok(seq.to_string())
    }

    async fn read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        max_count: usize,
        block_for: Duration,
    ) -> Result<Vec<BusMessage>, BusError> {
        self.check_available()?;
        {
            let mut streams = self.streams.lock().await;
            if let Some(state) = streams.get_mut(stream) {
                let delivered = Self::collect_for_group(state, group, consumer, max_count);
                if !delivered.is_empty() {
                    return Ok(delivered);
                }
            }
        }

        if block_for.is_zero() {
            return Ok(Vec::new());
        }

        // One bounded wait for an append, then a second look.
        let _ = tokio::time::timeout(block_for, self.appended.notified()).await;

        let mut streams = self.streams.lock().await;
        Ok(streams
            .get_mut(stream)
            .map(|state| Self::collect_for_group(state, group, consumer, max_count))
            .unwrap_or_default())
    }

    async fn read_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        max_count: usize,
    ) -> Result<Vec<BusMessage>, BusError> {
        let mut streams = self.streams.lock().await;
        let Some(state) = streams.get_mut(stream) else {
            return Ok(Vec::new());
        };
        let Some(group_state) = state.groups.get_mut(group) else {
            return Ok(Vec::new());
        };

        let mut seqs: Vec<u64> = group_state
            .pending
            .iter()
            .filter(|(_, owner)| owner.as_str() == consumer)
            .map(|(seq, _)| *seq)
            .collect();
        seqs.sort_unstable();
        seqs.truncate(max_count);

        let mut delivered = Vec::new();
        for seq in seqs {
            match state.entries.iter().find(|(s, _)| *s == seq) {
                Some((_, payload)) => delivered.push(BusMessage {
                    id: seq.to_string(),
                    payload: payload.as_ref().clone(),
                }),
                None => {
                    tracing::error!(
                        stream,
                        group,
                        message_id = seq,
                        "pending entry no longer in stream: data lost"
                    );
                    group_state.pending.remove(&seq);
                }
            }
        }
        Ok(delivered)
    }

    async fn acknowledge(
        &self,
        stream: &str,
        group: &str,
        ids: &[MessageId],
    ) -> Result<(), BusError> {
        let mut streams = self.streams.lock().await;
        if let Some(group_state) = streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
        {
            for id in ids {
                group_state.pending.remove(&Self::parse_id(id)?);
            }
        }
        Ok(())
    }

    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: StartPosition,
    ) -> Result<(), BusError> {
        let mut streams = self.streams.lock().await;
        let state = streams.entry(stream.to_string()).or_default();
        if state.groups.contains_key(group) {
            return Ok(());
        }
        let cursor = match start {
            StartPosition::FromOldest => 0,
            StartPosition::NewOnly => state.next_seq,
        };
        state.groups.insert(
            group.to_string(),
            GroupState {
                cursor,
                pending: HashMap::new(),
            },
        );
        Ok(())
    }
}
