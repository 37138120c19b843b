//! In-memory implementation of the [`StreamBus`] trait.
//!
//! Faithful to the store semantics the fabric relies on: append-only log per
//! stream, per-group cursor, and a pending-entry list so unacknowledged
//! entries are redelivered to their consumer before any new entry.

use crate::{StreamBus, StreamEntry, StreamResult};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Clone)]
struct LogEntry {
    id: String,
    seq: u64,
    fields: HashMap<String, String>,
}

#[derive(Debug, Default)]
struct GroupState {
    /// Index into the stream log of the next never-delivered entry.
    cursor: usize,
    /// Delivered-but-unacked entries: seq -> (entry id, consumer name).
    pending: BTreeMap<u64, (String, String)>,
}

#[derive(Debug, Default)]
struct StreamState {
    log: Vec<LogEntry>,
    groups: HashMap<String, GroupState>,
}

#[derive(Default)]
struct Inner {
    streams: HashMap<String, StreamState>,
    seq: u64,
}

/// Dev/test stream store with real consumer-group and PEL behavior.
#[derive(Clone, Default)]
pub struct InMemoryStreamBus {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
}

impl InMemoryStreamBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total entries ever appended to a stream (test inspection helper).
    pub fn stream_len(&self, stream: &str) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.streams.get(stream).map(|s| s.log.len()).unwrap_or(0)
    }

    /// Entries currently pending (delivered, unacked) for a group.
    pub fn pending_count(&self, stream: &str, group: &str) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pending.len())
            .unwrap_or(0)
    }

    fn try_read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Vec<StreamEntry> {
        let mut inner = self.inner.lock().unwrap();
        let Some(state) = inner.streams.get_mut(stream) else {
            return Vec::new();
        };
        let group_state = state.groups.entry(group.to_string()).or_default();

        // Redeliver this consumer's pending entries first, oldest first.
        let pending_seqs: Vec<u64> = group_state
            .pending
            .iter()
            .filter(|(_, (_, owner))| owner == consumer)
            .take(count)
            .map(|(seq, _)| *seq)
            .collect();
        if !pending_seqs.is_empty() {
            return pending_seqs
                .into_iter()
                .filter_map(|seq| {
                    state
                        .log
                        .iter()
                        .find(|e| e.seq == seq)
                        .map(|e| StreamEntry {
                            id: e.id.clone(),
                            fields: e.fields.clone(),
                        })
                })
                .collect();
        }

        // Then hand out new entries, advancing the group cursor.
        let mut out = Vec::new();
        while out.len() < count && group_state.cursor < state.log.len() {
            let entry = &state.log[group_state.cursor];
            group_state.cursor += 1;
            group_state
                .pending
                .insert(entry.seq, (entry.id.clone(), consumer.to_string()));
            out.push(StreamEntry {
                id: entry.id.clone(),
                fields: entry.fields.clone(),
            });
        }
        out
    }
}

#[async_trait]
impl StreamBus for InMemoryStreamBus {
    async fn publish(&self, stream: &str, fields: &[(String, String)]) -> StreamResult<String> {
        let id = {
            let mut inner = self.inner.lock().unwrap();
            inner.seq += 1;
            let seq = inner.seq;
            let id = format!("{seq}-0");
            let state = inner.streams.entry(stream.to_string()).or_default();
            state.log.push(LogEntry {
                id: id.clone(),
                seq,
                fields: fields.iter().cloned().collect(),
            });
            id
        };
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> StreamResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let state = inner.streams.entry(stream.to_string()).or_default();
        state.groups.entry(group.to_string()).or_default();
        Ok(())
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> StreamResult<Vec<StreamEntry>> {
        let entries = self.try_read(stream, group, consumer, count);
        if !entries.is_empty() {
            return Ok(entries);
        }
        // Nothing available: wait for a publish up to the poll timeout.
        let _ = tokio::time::timeout(block, self.notify.notified()).await;
        Ok(self.try_read(stream, group, consumer, count))
    }

    async fn ack(&self, stream: &str, group: &str, entry_id: &str) -> StreamResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(group_state) = inner
            .streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
        {
            group_state.pending.retain(|_, (id, _)| id != entry_id);
        }
        Ok(())
    }
}
