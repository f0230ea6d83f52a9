//! The broker capability the engine consumes.
//!
//! Connection pooling, request framing and retries live behind
//! [`BrokerClient`]; the engine only asks for partitions, watermarks and
//! positioned record streams.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::fmt;

use crate::protocol::{Offset, PartitionId, PartitionWatermark};
use crate::Result;

/// A record as handed out by a broker reader
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub offset: Offset,
    pub timestamp: i64,
    pub key: Option<Bytes>,
    pub payload: Bytes,
}

/// Lazy, finite sequence of records from one partition.
///
/// Not restartable once exhausted or dropped.
pub type RecordStream = BoxStream<'static, Result<RawRecord>>;

/// Request-scoped reader state.
///
/// A handle carries per-partition read positions, so it is deliberately not
/// `Clone`: one request acquires one handle and shares it read-only with the
/// fetchers it spawns.
pub struct ReaderHandle {
    id: u64,
}

impl ReaderHandle {
    pub fn new(id: u64) -> Self {
        Self { id }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl fmt::Debug for ReaderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReaderHandle#{}", self.id)
    }
}

#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Partition IDs of `topic`; fails with `TopicNotFound` for unknown topics
    async fn list_partitions(&self, topic: &str) -> Result<Vec<PartitionId>>;

    /// Low and high watermark for each requested partition
    async fn watermarks(
        &self,
        topic: &str,
        partitions: &[PartitionId],
    ) -> Result<HashMap<PartitionId, PartitionWatermark>>;

    /// Create a fresh reader handle from the shared connection pool
    async fn acquire_reader(&self) -> Result<ReaderHandle>;

    /// Return a handle. Called exactly once per acquired handle.
    fn release_reader(&self, handle: &ReaderHandle) -> Result<()>;

    /// Open a reader positioned at `from_offset`
    async fn open_reader(
        &self,
        handle: &ReaderHandle,
        topic: &str,
        partition: PartitionId,
        from_offset: Offset,
    ) -> Result<RecordStream>;
}
