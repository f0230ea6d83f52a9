//! Error types for the lookout fetch engine

use crate::protocol::PartitionId;

/// Main error type for fetch operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// Broker could not be reached while resolving metadata or opening a reader
    #[error("Broker unavailable: {message}")]
    BrokerUnavailable { message: String },

    /// Topic does not exist
    #[error("Topic '{topic}' does not exist")]
    TopicNotFound { topic: String },

    /// Requested partition is outside the topic's partition range
    #[error("Partition {partition} does not exist for topic '{topic}' ({partition_count} partitions)")]
    InvalidPartition {
        topic: String,
        partition: PartitionId,
        partition_count: usize,
    },

    /// A single partition reader failed mid-fetch
    #[error("Reading partition {partition} failed: {message}")]
    PartitionReadFailure {
        partition: PartitionId,
        message: String,
    },

    /// Malformed request parameters
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    /// Invalid engine configuration
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },
}

impl FetchError {
    /// Create a new broker unavailable error
    pub fn broker_unavailable<S: Into<String>>(message: S) -> Self {
        Self::BrokerUnavailable {
            message: message.into(),
        }
    }

    /// Create a new topic not found error
    pub fn topic_not_found<S: Into<String>>(topic: S) -> Self {
        Self::TopicNotFound {
            topic: topic.into(),
        }
    }

    /// Create a new partition read failure
    pub fn read_failure<S: Into<String>>(partition: PartitionId, message: S) -> Self {
        Self::PartitionReadFailure {
            partition,
            message: message.into(),
        }
    }

    /// Create a new invalid request error
    pub fn invalid_request<S: Into<String>>(message: S) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Create a new invalid config error
    pub fn invalid_config<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BrokerUnavailable { .. })
    }

    /// Check if this error was caused by the caller's input
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidPartition { .. } | Self::InvalidRequest { .. }
        )
    }

    /// HTTP status a transport layer should answer with
    pub fn status_code(&self) -> u16 {
        match self {
            Self::TopicNotFound { .. } => 404,
            Self::InvalidPartition { .. } | Self::InvalidRequest { .. } => 400,
            Self::BrokerUnavailable { .. }
            | Self::PartitionReadFailure { .. }
            | Self::InvalidConfig { .. } => 500,
        }
    }

    /// Message that is safe to show to an end user.
    ///
    /// Server-side failures hide their cause, which should be logged instead.
    pub fn public_message(&self) -> String {
        match self {
            Self::BrokerUnavailable { .. } => "Could not reach the Kafka cluster".to_string(),
            Self::PartitionReadFailure { .. } | Self::InvalidConfig { .. } => {
                "Could not list messages".to_string()
            }
            other => other.to_string(),
        }
    }
}

/// Broker-side error codes as carried by the Kafka wire protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// No error
    None = 0,
    /// Unknown server error
    Unknown = -1,
    /// Offset out of range
    OffsetOutOfRange = 1,
    /// Unknown topic or partition
    UnknownTopicOrPartition = 3,
    /// Leader not available
    LeaderNotAvailable = 5,
    /// Not leader for partition
    NotLeaderForPartition = 6,
    /// Request timed out
    RequestTimedOut = 7,
    /// Broker not available
    BrokerNotAvailable = 8,
}

impl ErrorCode {
    /// Convert a broker error code into a fetch error.
    ///
    /// `topic` names the topic the failing request addressed; `partition` is
    /// set when the failure belongs to a single partition reader. Returns
    /// `None` for [`ErrorCode::None`].
    pub fn into_fetch_error(
        self,
        topic: &str,
        partition: Option<PartitionId>,
    ) -> Option<FetchError> {
        let err = match (self, partition) {
            (ErrorCode::None, _) => return None,
            (ErrorCode::UnknownTopicOrPartition, None) => FetchError::topic_not_found(topic),
            (ErrorCode::LeaderNotAvailable, None)
            | (ErrorCode::NotLeaderForPartition, None)
            | (ErrorCode::RequestTimedOut, None)
            | (ErrorCode::BrokerNotAvailable, None)
            | (ErrorCode::Unknown, None)
            | (ErrorCode::OffsetOutOfRange, None) => {
                FetchError::broker_unavailable(format!("{:?} for topic '{}'", self, topic))
            }
            (code, Some(partition)) => {
                FetchError::read_failure(partition, format!("{:?} for topic '{}'", code, topic))
            }
        };
        Some(err)
    }
}

impl From<i16> for ErrorCode {
    fn from(code: i16) -> Self {
        match code {
            0 => ErrorCode::None,
            1 => ErrorCode::OffsetOutOfRange,
            3 => ErrorCode::UnknownTopicOrPartition,
            5 => ErrorCode::LeaderNotAvailable,
            6 => ErrorCode::NotLeaderForPartition,
            7 => ErrorCode::RequestTimedOut,
            8 => ErrorCode::BrokerNotAvailable,
            _ => ErrorCode::Unknown,
        }
    }
}
