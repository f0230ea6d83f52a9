//! # Lookout
//!
//! A bounded, cancellable fetch engine for partitioned logs such as Kafka
//! topics. Given a topic, a partition selector, a start position and a
//! message budget, it reads every selected partition concurrently and merges
//! the results into a single snapshot.
//!
//! ## Architecture Overview
//!
//! - [`watermark`] - resolves low/high watermarks per partition
//! - [`planner`] - turns the request into per-partition offset windows
//! - [`fetcher`] - one worker per partition window
//! - [`coordinator`] - starts the workers and merges their output
//! - [`consumer`] - request-scoped reader handles
//! - [`broker`] - the broker capability the engine runs against
//! - [`storage`] - an in-process broker used by tests and the CLI
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use lookout::*;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let log = Arc::new(InMemoryLog::new());
//!     log.create_topic("orders", 3);
//!
//!     let coordinator = FetchCoordinator::new(log, EngineConfig::default())?;
//!     let request = FetchRequest::new(
//!         "orders",
//!         PartitionSelector::All,
//!         StartPosition::Newest,
//!         50,
//!     );
//!
//!     let outcome = coordinator
//!         .fetch_messages(&request, &CancellationToken::new())
//!         .await?;
//!     println!("fetched {} messages", outcome.fetched_count);
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod config;
pub mod consumer;
pub mod coordinator;
pub mod error;
pub mod fetcher;
pub mod metrics;
pub mod planner;
pub mod protocol;
pub mod storage;
pub mod watermark;

pub use broker::{BrokerClient, RawRecord, ReaderHandle, RecordStream};
pub use config::{EngineConfig, EngineConfigBuilder};
pub use consumer::{ConsumerFactory, ReaderLease};
pub use coordinator::{deadline_token, FetchCoordinator, Termination};
pub use error::{ErrorCode, FetchError};
pub use metrics::{FetchMetrics, MetricsSnapshot};
pub use protocol::{
    FetchOutcome, FetchRequest, FetchWindow, Offset, PartitionFailure, PartitionId,
    PartitionSelector, PartitionWatermark, RecordEnvelope, StartPosition,
};
pub use storage::{InMemoryLog, LogSnapshot, ReaderStats};
pub use watermark::WatermarkResolver;

/// Engine result type
pub type Result<T> = std::result::Result<T, FetchError>;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
