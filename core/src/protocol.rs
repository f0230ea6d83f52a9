//! Request, record and outcome types exchanged with the fetch engine.
//!
//! All of these live for a single request only.

use bytes::Bytes;
use serde::{Serialize, Serializer};
use std::time::Duration;

use crate::error::FetchError;
use crate::Result;

pub type TopicName = String;
pub type PartitionId = i32;
pub type Offset = i64;

/// Wire value selecting every partition of a topic
pub const ALL_PARTITIONS: PartitionId = -1;
/// Wire value for "start at the newest messages"
pub const NEWEST_OFFSET: Offset = -1;
/// Wire value for "start at the oldest retained message"
pub const OLDEST_OFFSET: Offset = -2;

/// Which partitions of a topic to read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionSelector {
    All,
    Partition(PartitionId),
}

/// Where each partition window starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    Newest,
    Oldest,
    Explicit(Offset),
}

/// A bounded fetch over one topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    topic: TopicName,
    partition_selector: PartitionSelector,
    start_position: StartPosition,
    message_budget: u16,
}

impl FetchRequest {
    pub fn new<T: Into<TopicName>>(
        topic: T,
        partition_selector: PartitionSelector,
        start_position: StartPosition,
        message_budget: u16,
    ) -> Self {
        Self {
            topic: topic.into(),
            partition_selector,
            start_position,
            message_budget,
        }
    }

    /// Decode the legacy query encoding: partition `-1` means all partitions,
    /// start offset `-1` means newest and `-2` means oldest.
    pub fn from_wire<T: Into<TopicName>>(
        topic: T,
        partition_id: i32,
        start_offset: i64,
        message_count: u16,
    ) -> Result<Self> {
        let topic = topic.into();
        if topic.is_empty() {
            return Err(FetchError::invalid_request("topic name must not be empty"));
        }

        let partition_selector = match partition_id {
            ALL_PARTITIONS => PartitionSelector::All,
            id if id >= 0 => PartitionSelector::Partition(id),
            id => {
                return Err(FetchError::invalid_request(format!(
                    "partition id {} is neither -1 nor a partition index",
                    id
                )))
            }
        };

        let start_position = match start_offset {
            NEWEST_OFFSET => StartPosition::Newest,
            OLDEST_OFFSET => StartPosition::Oldest,
            offset if offset >= 0 => StartPosition::Explicit(offset),
            offset => {
                return Err(FetchError::invalid_request(format!(
                    "start offset {} is not -1 (newest), -2 (oldest) or an offset",
                    offset
                )))
            }
        };

        Ok(Self::new(
            topic,
            partition_selector,
            start_position,
            message_count,
        ))
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_selector(&self) -> PartitionSelector {
        self.partition_selector
    }

    pub fn start_position(&self) -> StartPosition {
        self.start_position
    }

    /// Upper bound on records returned across all partitions
    pub fn message_budget(&self) -> u16 {
        self.message_budget
    }
}

/// Oldest and one-past-newest offset of a partition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionWatermark {
    pub partition_id: PartitionId,
    pub low: Offset,
    pub high: Offset,
}

impl PartitionWatermark {
    /// Returns `None` when `low > high`.
    pub fn new(partition_id: PartitionId, low: Offset, high: Offset) -> Option<Self> {
        (low <= high).then_some(Self {
            partition_id,
            low,
            high,
        })
    }

    /// Number of retrievable records
    pub fn record_count(&self) -> i64 {
        self.high - self.low
    }

    pub fn is_empty(&self) -> bool {
        self.high == self.low
    }
}

/// Half-open offset range `[start_offset, end_offset)` assigned to one fetcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchWindow {
    pub partition_id: PartitionId,
    pub start_offset: Offset,
    pub end_offset: Offset,
}

impl FetchWindow {
    pub fn len(&self) -> i64 {
        self.end_offset - self.start_offset
    }

    pub fn is_empty(&self) -> bool {
        self.end_offset <= self.start_offset
    }

    pub fn contains(&self, offset: Offset) -> bool {
        offset >= self.start_offset && offset < self.end_offset
    }

    /// Last offset the window includes
    pub fn last_offset(&self) -> Option<Offset> {
        (!self.is_empty()).then(|| self.end_offset - 1)
    }
}

/// A single retrieved record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordEnvelope {
    #[serde(rename = "partitionID")]
    pub partition_id: PartitionId,
    pub offset: Offset,
    pub timestamp: i64,
    #[serde(serialize_with = "serialize_opt_bytes")]
    pub key: Option<Bytes>,
    #[serde(rename = "value", serialize_with = "serialize_bytes")]
    pub payload: Bytes,
    #[serde(rename = "size")]
    pub payload_size: usize,
}

/// A partition reader that failed after it was started
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionFailure {
    #[serde(rename = "partitionID")]
    pub partition_id: PartitionId,
    pub message: String,
}

impl From<&PartitionFailure> for FetchError {
    fn from(failure: &PartitionFailure) -> Self {
        FetchError::read_failure(failure.partition_id, failure.message.clone())
    }
}

/// Result of one `fetch_messages` call.
///
/// `records` are in arrival order: records of one partition appear in
/// increasing offset order, but partitions interleave in whatever order
/// their fetchers produced data. Enable `sort_by_offset` in the engine
/// configuration to get a `(partition, offset)` ordering instead.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchOutcome {
    #[serde(rename = "elapsedMs", serialize_with = "serialize_elapsed_ms")]
    pub elapsed: Duration,
    #[serde(rename = "fetchedMessages")]
    pub fetched_count: usize,
    #[serde(rename = "isCancelled")]
    pub was_cancelled: bool,
    #[serde(rename = "messages")]
    pub records: Vec<RecordEnvelope>,
    pub partition_errors: Vec<PartitionFailure>,
}

impl FetchOutcome {
    pub(crate) fn empty(elapsed: Duration) -> Self {
        Self {
            elapsed,
            fetched_count: 0,
            was_cancelled: false,
            records: Vec::new(),
            partition_errors: Vec::new(),
        }
    }
}

fn serialize_elapsed_ms<S: Serializer>(
    elapsed: &Duration,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_f64(elapsed.as_micros() as f64 / 1000.0)
}

fn serialize_bytes<S: Serializer>(
    bytes: &Bytes,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(bytes))
}

fn serialize_opt_bytes<S: Serializer>(
    bytes: &Option<Bytes>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match bytes {
        Some(bytes) => serialize_bytes(bytes, serializer),
        None => serializer.serialize_none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_wire_decodes_sentinels() {
        let req = FetchRequest::from_wire("orders", -1, -1, 50).unwrap();
        assert_eq!(req.partition_selector(), PartitionSelector::All);
        assert_eq!(req.start_position(), StartPosition::Newest);
        assert_eq!(req.message_budget(), 50);

        let req = FetchRequest::from_wire("orders", 2, -2, 10).unwrap();
        assert_eq!(req.partition_selector(), PartitionSelector::Partition(2));
        assert_eq!(req.start_position(), StartPosition::Oldest);

        let req = FetchRequest::from_wire("orders", 0, 1234, 10).unwrap();
        assert_eq!(req.start_position(), StartPosition::Explicit(1234));
    }

    #[test]
    fn test_from_wire_rejects_bad_values() {
        assert!(matches!(
            FetchRequest::from_wire("orders", -3, -1, 10),
            Err(FetchError::InvalidRequest { .. })
        ));
        assert!(matches!(
            FetchRequest::from_wire("orders", -1, -7, 10),
            Err(FetchError::InvalidRequest { .. })
        ));
        assert!(FetchRequest::from_wire("", -1, -1, 10).is_err());
    }

    #[test]
    fn test_watermark_invariant() {
        assert!(PartitionWatermark::new(0, 10, 5).is_none());
        let mark = PartitionWatermark::new(0, 5, 5).unwrap();
        assert!(mark.is_empty());
        assert_eq!(PartitionWatermark::new(1, 0, 100).unwrap().record_count(), 100);
    }

    #[test]
    fn test_window_bounds() {
        let window = FetchWindow {
            partition_id: 0,
            start_offset: 0,
            end_offset: 10,
        };
        assert_eq!(window.len(), 10);
        assert!(window.contains(9));
        assert!(!window.contains(10));
        assert_eq!(window.last_offset(), Some(9));
    }

    #[test]
    fn test_outcome_json_envelope() {
        let outcome = FetchOutcome {
            elapsed: Duration::from_millis(12),
            fetched_count: 1,
            was_cancelled: false,
            records: vec![RecordEnvelope {
                partition_id: 3,
                offset: 42,
                timestamp: 1_600_000_000_000,
                key: Some(Bytes::from_static(b"user-1")),
                payload: Bytes::from_static(b"{\"a\":1}"),
                payload_size: 7,
            }],
            partition_errors: Vec::new(),
        };

        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["elapsedMs"], 12.0);
        assert_eq!(json["fetchedMessages"], 1);
        assert_eq!(json["isCancelled"], false);
        assert_eq!(json["messages"][0]["partitionID"], 3);
        assert_eq!(json["messages"][0]["key"], "user-1");
        assert_eq!(json["messages"][0]["size"], 7);
        assert!(json["partitionErrors"].as_array().unwrap().is_empty());
    }
}
