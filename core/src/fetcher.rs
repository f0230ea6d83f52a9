//! Per-partition fetch worker

use futures::{FutureExt, StreamExt};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info_span, Instrument};

use crate::broker::{BrokerClient, RawRecord, ReaderHandle};
use crate::error::FetchError;
use crate::protocol::{FetchWindow, PartitionFailure, PartitionId, RecordEnvelope};
use crate::Result;

/// Sending halves of the coordinator's three channels
#[derive(Clone)]
pub struct WorkerChannels {
    pub records: mpsc::Sender<RecordEnvelope>,
    pub errors: mpsc::Sender<PartitionFailure>,
    pub done: mpsc::Sender<PartitionId>,
}

/// Why a fetcher reached `Done`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetcherExit {
    /// The window was read to its end or the reader ran dry
    Exhausted,
    /// The reader failed; an error signal was sent
    Failed,
    /// The request was cancelled or the coordinator stopped listening
    Cancelled,
}

/// Reads one partition window and streams it to the coordinator
pub struct PartitionFetcher {
    client: Arc<dyn BrokerClient>,
    handle: Arc<ReaderHandle>,
    topic: Arc<str>,
    window: FetchWindow,
    channels: WorkerChannels,
    cancel: CancellationToken,
}

impl PartitionFetcher {
    pub fn new(
        client: Arc<dyn BrokerClient>,
        handle: Arc<ReaderHandle>,
        topic: Arc<str>,
        window: FetchWindow,
        channels: WorkerChannels,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            handle,
            topic,
            window,
            channels,
            cancel,
        }
    }

    /// Run to completion.
    ///
    /// Sends at most one error signal and always exactly one completion
    /// signal, after the last record it emits. A panicking reader is
    /// reported as a failure of this partition.
    pub async fn run(self) -> FetcherExit {
        let span = info_span!(
            "partition_fetcher",
            topic = %self.topic,
            partition_id = self.window.partition_id
        );

        async move {
            let partition_id = self.window.partition_id;
            let read = AssertUnwindSafe(self.read_window()).catch_unwind().await;
            let result = read.unwrap_or_else(|panic| {
                Err(FetchError::read_failure(
                    partition_id,
                    format!("reader panicked: {}", panic_message(panic.as_ref())),
                ))
            });

            let exit = match result {
                Ok(exit) => exit,
                Err(e) => {
                    error!(error = %e, "Partition consumer failed");
                    let failure = PartitionFailure {
                        partition_id,
                        message: e.to_string(),
                    };
                    // coordinator gone means nobody is waiting for the error
                    let _ = self.channels.errors.send(failure).await;
                    FetcherExit::Failed
                }
            };

            let _ = self.channels.done.send(partition_id).await;
            debug!(?exit, "Partition consumer done");
            exit
        }
        .instrument(span)
        .await
    }

    async fn read_window(&self) -> Result<FetcherExit> {
        let window = self.window;
        if window.is_empty() {
            return Ok(FetcherExit::Exhausted);
        }

        let opened = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(FetcherExit::Cancelled),
            opened = self.client.open_reader(
                &self.handle,
                &self.topic,
                window.partition_id,
                window.start_offset,
            ) => opened,
        };
        let mut stream = opened.map_err(|e| self.as_read_failure(e))?;

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(FetcherExit::Cancelled),
                next = stream.next() => next,
            };

            let record = match next {
                None => return Ok(FetcherExit::Exhausted),
                Some(Err(e)) => return Err(self.as_read_failure(e)),
                Some(Ok(record)) => record,
            };

            if record.offset < window.start_offset {
                continue;
            }
            if !window.contains(record.offset) {
                return Ok(FetcherExit::Exhausted);
            }

            let is_last = record.offset + 1 >= window.end_offset;
            let envelope = self.envelope(record);

            let sent = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(FetcherExit::Cancelled),
                sent = self.channels.records.send(envelope) => sent,
            };
            if sent.is_err() {
                return Ok(FetcherExit::Cancelled);
            }

            if is_last {
                return Ok(FetcherExit::Exhausted);
            }
        }
    }

    fn envelope(&self, record: RawRecord) -> RecordEnvelope {
        RecordEnvelope {
            partition_id: self.window.partition_id,
            offset: record.offset,
            timestamp: record.timestamp,
            payload_size: record.payload.len(),
            key: record.key,
            payload: record.payload,
        }
    }

    fn as_read_failure(&self, e: FetchError) -> FetchError {
        match e {
            FetchError::PartitionReadFailure { .. } => e,
            other => FetchError::read_failure(self.window.partition_id, other.to_string()),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::storage::InMemoryLog;
    use bytes::Bytes;
    use std::time::Duration;

    struct Harness {
        records: mpsc::Receiver<RecordEnvelope>,
        errors: mpsc::Receiver<PartitionFailure>,
        done: mpsc::Receiver<PartitionId>,
        channels: WorkerChannels,
    }

    fn harness(capacity: usize) -> Harness {
        let (records_tx, records) = mpsc::channel(capacity);
        let (errors_tx, errors) = mpsc::channel(1);
        let (done_tx, done) = mpsc::channel(1);
        Harness {
            records,
            errors,
            done,
            channels: WorkerChannels {
                records: records_tx,
                errors: errors_tx,
                done: done_tx,
            },
        }
    }

    fn log_with(count: usize) -> Arc<InMemoryLog> {
        let log = Arc::new(InMemoryLog::new());
        log.create_topic("events", 1);
        for i in 0..count {
            log.append("events", 0, None, Bytes::from(format!("event-{}", i)))
                .unwrap();
        }
        log
    }

    fn window(start_offset: i64, end_offset: i64) -> FetchWindow {
        FetchWindow {
            partition_id: 0,
            start_offset,
            end_offset,
        }
    }

    #[tokio::test]
    async fn test_reads_exactly_the_window() {
        let log = log_with(20);
        let mut h = harness(32);
        let fetcher = PartitionFetcher::new(
            log.clone(),
            Arc::new(ReaderHandle::new(1)),
            Arc::from("events"),
            window(5, 12),
            h.channels.clone(),
            CancellationToken::new(),
        );

        assert_eq!(fetcher.run().await, FetcherExit::Exhausted);
        drop(h.channels);

        let mut offsets = Vec::new();
        while let Some(record) = h.records.recv().await {
            assert_eq!(record.payload_size, record.payload.len());
            offsets.push(record.offset);
        }
        assert_eq!(offsets, (5..12).collect::<Vec<_>>());
        assert_eq!(h.done.recv().await, Some(0));
        assert!(h.errors.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_read_error_sends_error_then_done() {
        let log = log_with(20);
        log.fail_partition("events", 0, 3, ErrorCode::NotLeaderForPartition);
        let mut h = harness(32);
        let fetcher = PartitionFetcher::new(
            log.clone(),
            Arc::new(ReaderHandle::new(1)),
            Arc::from("events"),
            window(0, 10),
            h.channels.clone(),
            CancellationToken::new(),
        );

        assert_eq!(fetcher.run().await, FetcherExit::Failed);
        drop(h.channels);

        let mut count = 0;
        while h.records.recv().await.is_some() {
            count += 1;
        }
        assert_eq!(count, 3);
        let failure = h.errors.recv().await.unwrap();
        assert_eq!(failure.partition_id, 0);
        assert!(h.errors.recv().await.is_none());
        assert_eq!(h.done.recv().await, Some(0));
    }

    #[tokio::test]
    async fn test_cancel_stops_without_error() {
        let log = log_with(20);
        log.stall_partition("events", 0, 2);
        let mut h = harness(32);
        let cancel = CancellationToken::new();
        let fetcher = PartitionFetcher::new(
            log.clone(),
            Arc::new(ReaderHandle::new(1)),
            Arc::from("events"),
            window(0, 10),
            h.channels.clone(),
            cancel.clone(),
        );

        let task = tokio::spawn(fetcher.run());
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        assert_eq!(task.await.unwrap(), FetcherExit::Cancelled);
        drop(h.channels);
        assert_eq!(h.done.recv().await, Some(0));
        assert!(h.errors.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_stops_at_last_offset_without_reading_past() {
        let log = log_with(10);
        // the reader would block forever after offset 4
        log.stall_partition("events", 0, 5);
        let mut h = harness(32);
        let fetcher = PartitionFetcher::new(
            log.clone(),
            Arc::new(ReaderHandle::new(1)),
            Arc::from("events"),
            window(0, 5),
            h.channels.clone(),
            CancellationToken::new(),
        );

        let exit = tokio::time::timeout(Duration::from_secs(5), fetcher.run())
            .await
            .unwrap();
        assert_eq!(exit, FetcherExit::Exhausted);
        assert_eq!(h.done.recv().await, Some(0));
        let mut count = 0;
        while h.records.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(count, 5);
    }
}
