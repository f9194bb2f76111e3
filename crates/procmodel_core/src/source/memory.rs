//! In-process partitioned command log.
//!
//! # Responsibility
//! - Provide the log contract without an external broker, for tests and
//!   single-node deployments.
//!
//! # Invariants
//! - Partition choice is a pure function of the key (FNV-1a modulo partition count).
//! - A new reader starts at its group's committed offsets, so anything fetched
//!   but never committed is delivered again.
//! - After `close`, pending and future fetches return `None`.

use super::log::{CommandLog, LogError, LogReader, LogRecord, LogResult, RecordPosition};
use async_trait::async_trait;
use log::debug;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0100_0000_01b3;

#[derive(Debug, Clone)]
struct StoredRecord {
    key: Vec<u8>,
    value: Vec<u8>,
}

#[derive(Default)]
struct LogState {
    topics: HashMap<String, Vec<Vec<StoredRecord>>>,
    /// Next offset to consume, per (group, topic) and partition.
    committed: HashMap<(String, String), Vec<i64>>,
    closed: bool,
}

struct Shared {
    partitions: usize,
    state: Mutex<LogState>,
    appended: Notify,
}

impl Shared {
    fn lock(&self) -> LogResult<MutexGuard<'_, LogState>> {
        self.state.lock().map_err(|_| LogError::LockPoisoned)
    }
}

impl LogState {
    fn topic_mut(&mut self, topic: &str, partitions: usize) -> &mut Vec<Vec<StoredRecord>> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); partitions])
    }
}

/// Cloneable handle to one in-memory log; clones share state.
#[derive(Clone)]
pub struct MemoryCommandLog {
    shared: Arc<Shared>,
}

impl MemoryCommandLog {
    /// Creates a log whose topics have `partitions` partitions (at least one).
    pub fn new(partitions: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                partitions: partitions.max(1),
                state: Mutex::new(LogState::default()),
                appended: Notify::new(),
            }),
        }
    }

    pub fn partition_count(&self) -> usize {
        self.shared.partitions
    }

    /// Partition a record with `key` is routed to.
    pub fn partition_for(&self, key: &[u8]) -> i32 {
        let hash = key.iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
            (hash ^ u64::from(*byte)).wrapping_mul(FNV_PRIME)
        });
        let partitions = self.shared.partitions as u64;
        i32::try_from(hash % partitions).unwrap_or(0)
    }

    /// Total records stored for `topic` across partitions.
    pub fn len(&self, topic: &str) -> usize {
        self.shared
            .lock()
            .map(|state| {
                state
                    .topics
                    .get(topic)
                    .map(|partitions| partitions.iter().map(Vec::len).sum())
                    .unwrap_or(0)
            })
            .unwrap_or(0)
    }

    pub fn is_empty(&self, topic: &str) -> bool {
        self.len(topic) == 0
    }

    /// Next offset `group_id` will consume on `partition`, if it ever committed.
    pub fn committed_offset(&self, group_id: &str, topic: &str, partition: i32) -> Option<i64> {
        let state = self.shared.lock().ok()?;
        let offsets = state
            .committed
            .get(&(group_id.to_string(), topic.to_string()))?;
        let offset = *offsets.get(usize::try_from(partition).ok()?)?;
        (offset > 0).then_some(offset)
    }
}

#[async_trait]
impl CommandLog for MemoryCommandLog {
    async fn append(&self, topic: &str, key: &[u8], value: &[u8]) -> LogResult<RecordPosition> {
        let partition = self.partition_for(key);
        let position = {
            let mut state = self.shared.lock()?;
            if state.closed {
                return Err(LogError::Closed);
            }
            let partitions = state.topic_mut(topic, self.shared.partitions);
            let slot = usize::try_from(partition)
                .ok()
                .and_then(|index| partitions.get_mut(index))
                .ok_or_else(|| LogError::UnknownPartition {
                    topic: topic.to_string(),
                    partition,
                })?;
            slot.push(StoredRecord {
                key: key.to_vec(),
                value: value.to_vec(),
            });
            RecordPosition {
                partition,
                offset: i64::try_from(slot.len() - 1).unwrap_or(i64::MAX),
            }
        };
        self.shared.appended.notify_waiters();
        Ok(position)
    }

    async fn subscribe(&self, group_id: &str, topic: &str) -> LogResult<Box<dyn LogReader>> {
        let mut state = self.shared.lock()?;
        if state.closed {
            return Err(LogError::Closed);
        }
        state.topic_mut(topic, self.shared.partitions);
        let positions = state
            .committed
            .entry((group_id.to_string(), topic.to_string()))
            .or_insert_with(|| vec![0; self.shared.partitions])
            .clone();
        debug!(
            "event=log_subscribe module=source status=ok backend=memory topic={} group={}",
            topic, group_id
        );
        Ok(Box::new(MemoryLogReader {
            shared: Arc::clone(&self.shared),
            group_id: group_id.to_string(),
            topic: topic.to_string(),
            positions,
            next_partition: 0,
        }))
    }

    async fn close(&self) -> LogResult<()> {
        self.shared.lock()?.closed = true;
        self.shared.appended.notify_waiters();
        Ok(())
    }
}

struct MemoryLogReader {
    shared: Arc<Shared>,
    group_id: String,
    topic: String,
    positions: Vec<i64>,
    next_partition: usize,
}

impl MemoryLogReader {
    /// Takes the next unread record, visiting partitions round-robin.
    fn poll_record(&mut self, state: &LogState) -> Option<LogRecord> {
        let partitions = state.topics.get(&self.topic)?;
        let count = partitions.len();
        for step in 0..count {
            let index = (self.next_partition + step) % count;
            let position = self.positions.get(index).copied().unwrap_or(0);
            let Some(stored) = usize::try_from(position)
                .ok()
                .and_then(|offset| partitions[index].get(offset))
            else {
                continue;
            };
            if let Some(slot) = self.positions.get_mut(index) {
                *slot = position + 1;
            }
            self.next_partition = (index + 1) % count;
            return Some(LogRecord {
                topic: self.topic.clone(),
                partition: i32::try_from(index).unwrap_or(0),
                offset: position,
                key: stored.key.clone(),
                value: stored.value.clone(),
            });
        }
        None
    }
}

#[async_trait]
impl LogReader for MemoryLogReader {
    async fn fetch(&mut self) -> LogResult<Option<LogRecord>> {
        let shared = Arc::clone(&self.shared);
        loop {
            let notified = shared.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = shared.lock()?;
                if state.closed {
                    return Ok(None);
                }
                if let Some(record) = self.poll_record(&state) {
                    return Ok(Some(record));
                }
            }
            notified.await;
        }
    }

    async fn commit(&mut self, record: &LogRecord) -> LogResult<()> {
        let mut state = self.shared.lock()?;
        let partitions = self.shared.partitions;
        let offsets = state
            .committed
            .entry((self.group_id.clone(), self.topic.clone()))
            .or_insert_with(|| vec![0; partitions]);
        let slot = usize::try_from(record.partition)
            .ok()
            .and_then(|index| offsets.get_mut(index))
            .ok_or_else(|| LogError::UnknownPartition {
                topic: record.topic.clone(),
                partition: record.partition,
            })?;
        *slot = (*slot).max(record.offset + 1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const TOPIC: &str = "processmodel";

    #[test]
    fn same_key_always_maps_to_same_partition() {
        let log = MemoryCommandLog::new(8);
        let first = log.partition_for(b"process-1");
        for _ in 0..10 {
            assert_eq!(log.partition_for(b"process-1"), first);
        }
        assert!((0..8).contains(&first));
    }

    #[tokio::test]
    async fn per_key_records_are_fetched_in_append_order() {
        let log = MemoryCommandLog::new(4);
        for value in ["a", "b", "c"] {
            log.append(TOPIC, b"p1", value.as_bytes()).await.unwrap();
        }
        log.append(TOPIC, b"p2", b"x").await.unwrap();

        let mut reader = log.subscribe("group", TOPIC).await.unwrap();
        let mut p1_values = Vec::new();
        for _ in 0..4 {
            let record = reader.fetch().await.unwrap().unwrap();
            if record.key == b"p1" {
                p1_values.push(record.value);
            }
        }
        assert_eq!(p1_values, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[tokio::test]
    async fn uncommitted_records_are_redelivered() {
        let log = MemoryCommandLog::new(1);
        log.append(TOPIC, b"p1", b"first").await.unwrap();
        log.append(TOPIC, b"p1", b"second").await.unwrap();

        let mut reader = log.subscribe("group", TOPIC).await.unwrap();
        let first = reader.fetch().await.unwrap().unwrap();
        reader.commit(&first).await.unwrap();
        let second = reader.fetch().await.unwrap().unwrap();
        assert_eq!(second.value, b"second");
        drop(reader);

        let mut reader = log.subscribe("group", TOPIC).await.unwrap();
        let again = reader.fetch().await.unwrap().unwrap();
        assert_eq!(again.value, b"second");
        assert_eq!(log.committed_offset("group", TOPIC, 0), Some(1));
    }

    #[tokio::test]
    async fn pending_fetch_wakes_on_append_and_close() {
        let log = MemoryCommandLog::new(2);
        let mut reader = log.subscribe("group", TOPIC).await.unwrap();
        let writer = log.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            writer.append(TOPIC, b"p1", b"late").await.unwrap();
        });
        let record = tokio::time::timeout(Duration::from_secs(2), reader.fetch())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(record.value, b"late");

        log.close().await.unwrap();
        assert!(reader.fetch().await.unwrap().is_none());
        assert!(matches!(
            log.append(TOPIC, b"p1", b"x").await,
            Err(LogError::Closed)
        ));
    }
}
