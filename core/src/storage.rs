//! In-process partitioned log implementing [`BrokerClient`].
//!
//! Backs the integration tests and the `lookout` binary's snapshot mode.
//! Supports simple fault injection: an unreachable broker, partition readers
//! that fail or stall after a number of records, and a per-record read delay.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::debug;

use crate::broker::{BrokerClient, RawRecord, ReaderHandle, RecordStream};
use crate::error::{ErrorCode, FetchError};
use crate::protocol::{Offset, PartitionId, PartitionWatermark, TopicName};
use crate::Result;

#[derive(Debug, Default)]
struct PartitionData {
    /// Offset of `records[0]`, or of the next record when empty
    low: Offset,
    records: Vec<RawRecord>,
}

impl PartitionData {
    fn high(&self) -> Offset {
        self.low + self.records.len() as Offset
    }
}

/// Decrements the active reader count when a reader stream is dropped
struct ActiveReader(Arc<AtomicU64>);

impl Drop for ActiveReader {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy)]
enum Fault {
    FailAfter { records: usize, code: ErrorCode },
    StallAfter { records: usize },
}

/// Handle bookkeeping, exposed for resource assertions in tests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReaderStats {
    pub acquired: u64,
    pub released: u64,
    pub opened: u64,
    /// Reader streams not yet dropped
    pub active: u64,
    pub watermark_requests: u64,
}

#[derive(Debug, Default)]
pub struct InMemoryLog {
    topics: DashMap<TopicName, Vec<RwLock<PartitionData>>>,
    faults: DashMap<(TopicName, PartitionId), Fault>,
    live_handles: DashMap<u64, ()>,
    unavailable: AtomicBool,
    read_delay: Mutex<Duration>,
    next_handle: AtomicU64,
    acquired: AtomicU64,
    released: AtomicU64,
    opened: AtomicU64,
    active: Arc<AtomicU64>,
    watermark_requests: AtomicU64,
}

impl InMemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create `partitions` empty partitions; existing topics are left untouched
    pub fn create_topic(&self, topic: &str, partitions: usize) {
        self.topics.entry(topic.to_string()).or_insert_with(|| {
            (0..partitions)
                .map(|_| RwLock::new(PartitionData::default()))
                .collect()
        });
    }

    /// Append a record stamped with the current wall clock
    pub fn append(
        &self,
        topic: &str,
        partition: PartitionId,
        key: Option<Bytes>,
        payload: Bytes,
    ) -> Result<Offset> {
        let timestamp = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default();
        self.append_with_timestamp(topic, partition, key, payload, timestamp)
    }

    pub fn append_with_timestamp(
        &self,
        topic: &str,
        partition: PartitionId,
        key: Option<Bytes>,
        payload: Bytes,
        timestamp: i64,
    ) -> Result<Offset> {
        self.with_partition(topic, partition, |data| {
            let offset = data.high();
            data.records.push(RawRecord {
                offset,
                timestamp,
                key,
                payload,
            });
            offset
        })
    }

    /// Drop every record below `offset`, as retention would
    pub fn truncate_before(
        &self,
        topic: &str,
        partition: PartitionId,
        offset: Offset,
    ) -> Result<()> {
        self.with_partition(topic, partition, |data| {
            let offset = offset.clamp(data.low, data.high());
            let drop_count = (offset - data.low) as usize;
            data.records.drain(..drop_count);
            data.low = offset;
        })
    }

    /// Readers of this partition yield `records` records, then fail with `code`
    pub fn fail_partition(
        &self,
        topic: &str,
        partition: PartitionId,
        records: usize,
        code: ErrorCode,
    ) {
        self.faults
            .insert((topic.to_string(), partition), Fault::FailAfter { records, code });
    }

    /// Readers of this partition yield `records` records, then never again
    pub fn stall_partition(&self, topic: &str, partition: PartitionId, records: usize) {
        self.faults
            .insert((topic.to_string(), partition), Fault::StallAfter { records });
    }

    pub fn clear_faults(&self) {
        self.faults.clear();
    }

    /// Make metadata requests and handle acquisition fail
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Delay applied before every record a reader yields
    pub fn set_read_delay(&self, delay: Duration) {
        *self.read_delay.lock() = delay;
    }

    pub fn reader_stats(&self) -> ReaderStats {
        ReaderStats {
            acquired: self.acquired.load(Ordering::SeqCst),
            released: self.released.load(Ordering::SeqCst),
            opened: self.opened.load(Ordering::SeqCst),
            active: self.active.load(Ordering::SeqCst),
            watermark_requests: self.watermark_requests.load(Ordering::SeqCst),
        }
    }

    pub fn from_snapshot(snapshot: &LogSnapshot) -> Result<Self> {
        let log = Self::new();
        for topic in &snapshot.topics {
            log.create_topic(&topic.name, topic.partitions.len());
            for (id, partition) in topic.partitions.iter().enumerate() {
                let id = id as PartitionId;
                log.with_partition(&topic.name, id, |data| data.low = partition.low_watermark)?;
                for record in &partition.records {
                    let key = record.key.clone().map(Bytes::from);
                    let payload = Bytes::from(record.value.clone());
                    match record.timestamp {
                        Some(ts) => log.append_with_timestamp(&topic.name, id, key, payload, ts)?,
                        None => log.append(&topic.name, id, key, payload)?,
                    };
                }
            }
        }
        Ok(log)
    }

    fn with_partition<T>(
        &self,
        topic: &str,
        partition: PartitionId,
        f: impl FnOnce(&mut PartitionData) -> T,
    ) -> Result<T> {
        let partitions = self
            .topics
            .get(topic)
            .ok_or_else(|| FetchError::topic_not_found(topic))?;
        let data = usize::try_from(partition)
            .ok()
            .and_then(|idx| partitions.get(idx))
            .ok_or_else(|| FetchError::InvalidPartition {
                topic: topic.to_string(),
                partition,
                partition_count: partitions.len(),
            })?;
        let mut data = data.write();
        Ok(f(&mut data))
    }

    fn check_available(&self, topic: &str) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            let err = ErrorCode::BrokerNotAvailable.into_fetch_error(topic, None);
            return Err(err.unwrap_or_else(|| FetchError::broker_unavailable(topic)));
        }
        Ok(())
    }

    fn unknown_topic(topic: &str) -> FetchError {
        ErrorCode::UnknownTopicOrPartition
            .into_fetch_error(topic, None)
            .unwrap_or_else(|| FetchError::topic_not_found(topic))
    }
}

#[async_trait]
impl BrokerClient for InMemoryLog {
    async fn list_partitions(&self, topic: &str) -> Result<Vec<PartitionId>> {
        self.check_available(topic)?;
        let partitions = self.topics.get(topic).ok_or_else(|| Self::unknown_topic(topic))?;
        Ok((0..partitions.len() as PartitionId).collect())
    }

    async fn watermarks(
        &self,
        topic: &str,
        partitions: &[PartitionId],
    ) -> Result<HashMap<PartitionId, PartitionWatermark>> {
        self.watermark_requests.fetch_add(1, Ordering::SeqCst);
        self.check_available(topic)?;
        let data = self.topics.get(topic).ok_or_else(|| Self::unknown_topic(topic))?;

        let marks = partitions
            .iter()
            .filter_map(|id| {
                let partition = data.get(usize::try_from(*id).ok()?)?.read();
                Some((
                    *id,
                    PartitionWatermark {
                        partition_id: *id,
                        low: partition.low,
                        high: partition.high(),
                    },
                ))
            })
            .collect();
        Ok(marks)
    }

    async fn acquire_reader(&self) -> Result<ReaderHandle> {
        self.check_available("")?;
        let id = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.live_handles.insert(id, ());
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(ReaderHandle::new(id))
    }

    fn release_reader(&self, handle: &ReaderHandle) -> Result<()> {
        if self.live_handles.remove(&handle.id()).is_none() {
            return Err(FetchError::broker_unavailable(format!(
                "reader handle {} released twice or never acquired",
                handle.id()
            )));
        }
        self.released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn open_reader(
        &self,
        handle: &ReaderHandle,
        topic: &str,
        partition: PartitionId,
        from_offset: Offset,
    ) -> Result<RecordStream> {
        if !self.live_handles.contains_key(&handle.id()) {
            return Err(FetchError::read_failure(
                partition,
                format!("reader handle {} is closed", handle.id()),
            ));
        }

        let records: Vec<RawRecord> = self.with_partition(topic, partition, |data| {
            let skip = (from_offset.max(data.low) - data.low) as usize;
            data.records.iter().skip(skip).cloned().collect()
        })?;
        self.opened.fetch_add(1, Ordering::SeqCst);
        debug!(topic, partition, from_offset, available = records.len(), "Opened reader");

        let fault = self.faults.get(&(topic.to_string(), partition)).map(|f| *f);
        let stream: RecordStream = match fault {
            None => stream::iter(records.into_iter().map(Ok)).boxed(),
            Some(Fault::FailAfter { records: limit, code }) => {
                let err = code
                    .into_fetch_error(topic, Some(partition))
                    .unwrap_or_else(|| FetchError::read_failure(partition, "injected failure"));
                stream::iter(records.into_iter().take(limit).map(Ok))
                    .chain(stream::once(async move { Err(err) }))
                    .boxed()
            }
            Some(Fault::StallAfter { records: limit }) => {
                stream::iter(records.into_iter().take(limit).map(Ok))
                    .chain(stream::pending())
                    .boxed()
            }
        };

        self.active.fetch_add(1, Ordering::SeqCst);
        let active = ActiveReader(Arc::clone(&self.active));
        let stream = stream
            .map(move |item| {
                let _active = &active;
                item
            })
            .boxed();

        let delay = *self.read_delay.lock();
        if delay.is_zero() {
            return Ok(stream);
        }
        Ok(stream
            .then(move |item| async move {
                tokio::time::sleep(delay).await;
                item
            })
            .boxed())
    }
}

/// JSON representation of a log, loaded by the binary
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogSnapshot {
    pub topics: Vec<TopicSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicSnapshot {
    pub name: String,
    pub partitions: Vec<PartitionSnapshot>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionSnapshot {
    /// Offset of the first record
    #[serde(default)]
    pub low_watermark: Offset,
    #[serde(default)]
    pub records: Vec<RecordSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordSnapshot {
    #[serde(default)]
    pub key: Option<String>,
    pub value: String,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_log() -> InMemoryLog {
        let log = InMemoryLog::new();
        log.create_topic("orders", 2);
        for i in 0..5 {
            log.append("orders", 0, None, Bytes::from(format!("m{}", i)))
                .unwrap();
        }
        log
    }

    #[tokio::test]
    async fn test_watermarks_follow_appends_and_retention() {
        let log = sample_log();
        log.truncate_before("orders", 0, 2).unwrap();

        let marks = log.watermarks("orders", &[0, 1]).await.unwrap();
        assert_eq!(marks[&0].low, 2);
        assert_eq!(marks[&0].high, 5);
        assert!(marks[&1].is_empty());
    }

    #[tokio::test]
    async fn test_unknown_topic() {
        let log = sample_log();
        assert_eq!(
            log.list_partitions("missing").await.unwrap_err(),
            FetchError::topic_not_found("missing")
        );
    }

    #[tokio::test]
    async fn test_unavailable_broker() {
        let log = sample_log();
        log.set_unavailable(true);
        assert!(log.list_partitions("orders").await.unwrap_err().is_retryable());
        assert!(log.acquire_reader().await.is_err());
    }

    #[tokio::test]
    async fn test_reader_positions_and_double_release() {
        let log = sample_log();
        let handle = log.acquire_reader().await.unwrap();

        let stream = log.open_reader(&handle, "orders", 0, 3).await.unwrap();
        assert_eq!(log.reader_stats().active, 1);
        let offsets: Vec<Offset> = stream.map(|r| r.unwrap().offset).collect().await;
        assert_eq!(offsets, vec![3, 4]);
        assert_eq!(log.reader_stats().active, 0);

        log.release_reader(&handle).unwrap();
        assert!(log.release_reader(&handle).is_err());
        assert!(log.open_reader(&handle, "orders", 0, 0).await.is_err());
        assert_eq!(log.reader_stats().released, 1);
    }

    #[test]
    fn test_from_snapshot() {
        let snapshot: LogSnapshot = serde_json::from_str(
            r#"{
                "topics": [{
                    "name": "audit",
                    "partitions": [
                        { "lowWatermark": 40, "records": [
                            { "key": "a", "value": "x", "timestamp": 1 },
                            { "value": "y" }
                        ] },
                        {}
                    ]
                }]
            }"#,
        )
        .unwrap();

        let log = InMemoryLog::from_snapshot(&snapshot).unwrap();
        let partitions = log.topics.get("audit").unwrap();
        assert_eq!(partitions.len(), 2);
        let first = partitions[0].read();
        assert_eq!(first.low, 40);
        assert_eq!(first.high(), 42);
        assert_eq!(first.records[0].key, Some(Bytes::from_static(b"a")));
    }
}
