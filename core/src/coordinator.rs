//! Fan-out/fan-in orchestration of a bounded fetch.
//!
//! The coordinator starts one [`PartitionFetcher`] per planned window and
//! merges their output with a polling loop that checks its inputs in a fixed
//! order on every tick:
//!
//! 1. cancellation,
//! 2. buffered records (drained until empty or the budget is reached),
//! 3. "all workers were already done last tick",
//! 4. completion signals.
//!
//! A worker that vanishes without signalling (its task was aborted) still
//! counts as done once every sender of the completion channel is gone.
//!
//! An unordered `select!` over the three channels could declare completion
//! while records are still buffered, or keep collecting after cancellation,
//! so each input is polled without blocking and the loop sleeps for
//! [`EngineConfig::poll_interval`] between ticks.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::BrokerClient;
use crate::config::EngineConfig;
use crate::consumer::ConsumerFactory;
use crate::fetcher::{FetcherExit, PartitionFetcher, WorkerChannels};
use crate::metrics::{FetchMetrics, Timer};
use crate::planner;
use crate::protocol::{FetchOutcome, FetchRequest, PartitionFailure, PartitionId, RecordEnvelope};
use crate::watermark::WatermarkResolver;
use crate::Result;

/// How long stopped workers get to wind down before they are aborted
const WORKER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Returns a child of `parent` that also fires once `timeout` elapses.
///
/// This is the only timeout mechanism: deadlines are expressed as
/// cancellation.
pub fn deadline_token(parent: &CancellationToken, timeout: Duration) -> CancellationToken {
    let token = parent.child_token();
    let timer = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(timeout) => timer.cancel(),
            _ = timer.cancelled() => {}
        }
    });
    token
}

/// Why the collection loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Cancelled,
    BudgetReached,
    SourcesExhausted,
}

enum Step {
    Continue,
    Finished(Termination),
}

/// Receiving side of the worker channels plus the loop's bookkeeping
struct Collector {
    budget: usize,
    started_workers: usize,
    completed_workers: usize,
    all_workers_done: bool,
    records: Vec<RecordEnvelope>,
    failures: Vec<PartitionFailure>,
    records_rx: mpsc::Receiver<RecordEnvelope>,
    errors_rx: mpsc::Receiver<PartitionFailure>,
    done_rx: mpsc::Receiver<PartitionId>,
}

impl Collector {
    fn new(
        budget: usize,
        started_workers: usize,
        records_rx: mpsc::Receiver<RecordEnvelope>,
        errors_rx: mpsc::Receiver<PartitionFailure>,
        done_rx: mpsc::Receiver<PartitionId>,
    ) -> Self {
        Self {
            budget,
            started_workers,
            completed_workers: 0,
            all_workers_done: false,
            records: Vec::with_capacity(budget),
            failures: Vec::new(),
            records_rx,
            errors_rx,
            done_rx,
        }
    }

    /// One non-blocking pass over all inputs, in priority order
    fn poll_once(&mut self, cancel: &CancellationToken) -> Step {
        if cancel.is_cancelled() {
            return Step::Finished(Termination::Cancelled);
        }

        loop {
            match self.records_rx.try_recv() {
                Ok(record) => {
                    self.records.push(record);
                    if self.records.len() >= self.budget {
                        return Step::Finished(Termination::BudgetReached);
                    }
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }

        self.drain_failures();

        // done was observed on an earlier tick and the drain above found
        // nothing more, so no record can still arrive
        if self.all_workers_done {
            return Step::Finished(Termination::SourcesExhausted);
        }

        loop {
            match self.done_rx.try_recv() {
                Ok(partition_id) => {
                    self.completed_workers += 1;
                    debug!(
                        partition_id,
                        completed_workers = self.completed_workers,
                        started_workers = self.started_workers,
                        "Partition consumer reported done"
                    );
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if self.completed_workers < self.started_workers {
                        warn!(
                            completed_workers = self.completed_workers,
                            started_workers = self.started_workers,
                            "Partition consumers exited without reporting done"
                        );
                        self.completed_workers = self.started_workers;
                    }
                    break;
                }
            }
        }
        if self.completed_workers >= self.started_workers {
            self.all_workers_done = true;
        }

        Step::Continue
    }

    fn drain_failures(&mut self) {
        while let Ok(failure) = self.errors_rx.try_recv() {
            self.failures.push(failure);
        }
    }

    async fn run(&mut self, cancel: &CancellationToken, interval: Duration) -> Termination {
        loop {
            match self.poll_once(cancel) {
                Step::Finished(termination) => return termination,
                Step::Continue => tokio::time::sleep(interval).await,
            }
        }
    }
}

/// Runs bounded multi-partition fetches against a [`BrokerClient`]
pub struct FetchCoordinator {
    client: Arc<dyn BrokerClient>,
    consumers: ConsumerFactory,
    watermarks: WatermarkResolver,
    config: EngineConfig,
    metrics: Arc<FetchMetrics>,
}

impl FetchCoordinator {
    pub fn new(client: Arc<dyn BrokerClient>, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            consumers: ConsumerFactory::new(Arc::clone(&client)),
            watermarks: WatermarkResolver::new(Arc::clone(&client)),
            client,
            config,
            metrics: Arc::new(FetchMetrics::default()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<FetchMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Fetch up to `request.message_budget()` records.
    ///
    /// Failures before any fetcher starts abort the request. Once fetchers
    /// run, cancellation yields a partial outcome with `was_cancelled` set and
    /// reader failures are reported in `partition_errors` (or fail the
    /// request when `fail_on_partition_error` is configured).
    pub async fn fetch_messages(
        &self,
        request: &FetchRequest,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome> {
        let timer = Timer::start();
        let result = self.fetch_inner(request, cancel, timer).await;
        match &result {
            Ok(outcome) => {
                let bytes: usize = outcome.records.iter().map(|r| r.payload_size).sum();
                self.metrics.record_fetch(
                    outcome.fetched_count as u64,
                    bytes as u64,
                    outcome.elapsed,
                    outcome.was_cancelled,
                );
            }
            Err(e) => {
                warn!(topic = request.topic(), error = %e, "Listing messages failed");
                self.metrics.record_failed_request();
            }
        }
        result
    }

    /// Like [`fetch_messages`](Self::fetch_messages), cancelled after the
    /// configured request timeout
    pub async fn fetch_messages_with_timeout(
        &self,
        request: &FetchRequest,
    ) -> Result<FetchOutcome> {
        let root = CancellationToken::new();
        let deadline = deadline_token(&root, self.config.request_timeout());
        let result = self.fetch_messages(request, &deadline).await;
        root.cancel();
        result
    }

    async fn fetch_inner(
        &self,
        request: &FetchRequest,
        cancel: &CancellationToken,
        timer: Timer,
    ) -> Result<FetchOutcome> {
        let topic = request.topic();

        // dropped on every return below, releasing the handle
        let lease = self.consumers.acquire().await?;

        let available = self.client.list_partitions(topic).await?;
        let partitions =
            planner::resolve_partitions(topic, request.partition_selector(), &available)?;
        let marks = self.watermarks.resolve(topic, &partitions).await?;
        let plan = planner::plan(
            request.start_position(),
            request.message_budget(),
            &partitions,
            &marks,
        );

        if !plan.skipped.is_empty() {
            debug!(topic, skipped = ?plan.skipped, "Skipping partitions without messages");
        }
        if plan.windows.is_empty() {
            return Ok(FetchOutcome::empty(timer.elapsed()));
        }

        let started_workers = plan.windows.len();
        let (records_tx, records_rx) = mpsc::channel(plan.capacity().max(1));
        let (errors_tx, errors_rx) = mpsc::channel(started_workers);
        let (done_tx, done_rx) = mpsc::channel(started_workers);
        let channels = WorkerChannels {
            records: records_tx,
            errors: errors_tx,
            done: done_tx,
        };

        // fires on loop exit or when this future is dropped, stopping workers
        // that are still reading
        let workers = cancel.child_token();
        let _stop_workers = workers.clone().drop_guard();

        let topic_name: Arc<str> = Arc::from(topic);
        let mut tasks = JoinSet::new();
        for window in &plan.windows {
            let fetcher = PartitionFetcher::new(
                Arc::clone(&self.client),
                lease.handle(),
                Arc::clone(&topic_name),
                *window,
                channels.clone(),
                workers.clone(),
            );
            tasks.spawn(fetcher.run());
        }
        drop(channels);
        self.metrics.record_workers_started(started_workers as u64);
        debug!(
            topic,
            started_workers,
            per_partition_count = plan.per_partition_count,
            "Started partition consumers"
        );

        let mut collector = Collector::new(
            usize::from(request.message_budget()),
            started_workers,
            records_rx,
            errors_rx,
            done_rx,
        );
        let termination = collector.run(cancel, self.config.poll_interval()).await;
        workers.cancel();
        // workers still hold the reader handle, so they must be gone
        // before the lease is released
        join_workers(topic, &mut tasks).await;
        collector.drain_failures();

        if termination == Termination::Cancelled {
            warn!(
                topic,
                completed_workers = collector.completed_workers,
                started_workers,
                fetched_messages = collector.records.len(),
                "Request was cancelled while waiting for messages from workers (probably timeout)"
            );
        }

        if !collector.failures.is_empty() {
            self.metrics
                .record_partition_failures(collector.failures.len() as u64);
            if self.config.fail_on_partition_error {
                return Err((&collector.failures[0]).into());
            }
        }

        let mut records = std::mem::take(&mut collector.records);
        if self.config.sort_by_offset {
            records.sort_by_key(|r| (r.partition_id, r.offset));
        }

        info!(
            topic,
            fetched_messages = records.len(),
            ?termination,
            "Listed messages"
        );

        Ok(FetchOutcome {
            elapsed: timer.elapsed(),
            fetched_count: records.len(),
            was_cancelled: termination == Termination::Cancelled,
            records,
            partition_errors: std::mem::take(&mut collector.failures),
        })
    }
}

/// Wait for stopped workers, aborting any that outlive the shutdown timeout
async fn join_workers(topic: &str, tasks: &mut JoinSet<FetcherExit>) {
    let mut exhausted = 0usize;
    let mut failed = 0usize;
    let mut cancelled = 0usize;

    let joined = tokio::time::timeout(WORKER_SHUTDOWN_TIMEOUT, async {
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(FetcherExit::Exhausted) => exhausted += 1,
                Ok(FetcherExit::Failed) => failed += 1,
                Ok(FetcherExit::Cancelled) => cancelled += 1,
                Err(e) => warn!(topic, error = %e, "Partition consumer task did not finish"),
            }
        }
    })
    .await;

    if joined.is_err() {
        warn!(
            topic,
            remaining = tasks.len(),
            "Aborting partition consumers that ignored cancellation"
        );
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    debug!(topic, exhausted, failed, cancelled, "Partition consumers stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn envelope(partition_id: PartitionId, offset: i64) -> RecordEnvelope {
        RecordEnvelope {
            partition_id,
            offset,
            timestamp: 0,
            key: None,
            payload: Bytes::from_static(b"v"),
            payload_size: 1,
        }
    }

    struct Senders {
        records: mpsc::Sender<RecordEnvelope>,
        errors: mpsc::Sender<PartitionFailure>,
        done: mpsc::Sender<PartitionId>,
    }

    fn collector(budget: usize, workers: usize) -> (Collector, Senders) {
        let (records, records_rx) = mpsc::channel(64);
        let (errors, errors_rx) = mpsc::channel(8);
        let (done, done_rx) = mpsc::channel(8);
        (
            Collector::new(budget, workers, records_rx, errors_rx, done_rx),
            Senders {
                records,
                errors,
                done,
            },
        )
    }

    #[test]
    fn test_cancellation_wins_over_buffered_records() {
        let (mut c, tx) = collector(10, 1);
        tx.records.try_send(envelope(0, 0)).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(matches!(
            c.poll_once(&cancel),
            Step::Finished(Termination::Cancelled)
        ));
        assert!(c.records.is_empty());
    }

    #[test]
    fn test_budget_stops_drain() {
        let (mut c, tx) = collector(3, 1);
        for offset in 0..5 {
            tx.records.try_send(envelope(0, offset)).unwrap();
        }

        assert!(matches!(
            c.poll_once(&CancellationToken::new()),
            Step::Finished(Termination::BudgetReached)
        ));
        assert_eq!(c.records.len(), 3);
    }

    #[test]
    fn test_done_needs_one_more_drain() {
        let (mut c, tx) = collector(10, 2);
        let cancel = CancellationToken::new();
        tx.records.try_send(envelope(0, 0)).unwrap();
        tx.done.try_send(0).unwrap();
        tx.done.try_send(1).unwrap();

        // first tick drains the record and sees both workers done
        assert!(matches!(c.poll_once(&cancel), Step::Continue));
        assert!(c.all_workers_done);

        // a record racing in after the done signal is still collected
        tx.records.try_send(envelope(1, 7)).unwrap();
        assert!(matches!(
            c.poll_once(&cancel),
            Step::Finished(Termination::SourcesExhausted)
        ));
        assert_eq!(c.records.len(), 2);
    }

    #[test]
    fn test_failures_are_collected() {
        let (mut c, tx) = collector(10, 1);
        tx.errors
            .try_send(PartitionFailure {
                partition_id: 0,
                message: "broken".to_string(),
            })
            .unwrap();
        tx.done.try_send(0).unwrap();

        let cancel = CancellationToken::new();
        assert!(matches!(c.poll_once(&cancel), Step::Continue));
        assert!(matches!(
            c.poll_once(&cancel),
            Step::Finished(Termination::SourcesExhausted)
        ));
        assert_eq!(c.failures.len(), 1);
    }

    #[test]
    fn test_vanished_workers_count_as_done() {
        let (mut c, tx) = collector(10, 2);
        let cancel = CancellationToken::new();
        tx.records.try_send(envelope(0, 0)).unwrap();
        tx.done.try_send(0).unwrap();
        // the second worker goes away without a done signal
        drop(tx);

        assert!(matches!(c.poll_once(&cancel), Step::Continue));
        assert!(c.all_workers_done);
        assert_eq!(c.completed_workers, 2);
        assert!(matches!(
            c.poll_once(&cancel),
            Step::Finished(Termination::SourcesExhausted)
        ));
        assert_eq!(c.records.len(), 1);
    }

    #[tokio::test]
    async fn test_deadline_token_fires() {
        let root = CancellationToken::new();
        let token = deadline_token(&root, Duration::from_millis(20));
        assert!(!token.is_cancelled());
        tokio::time::timeout(Duration::from_secs(5), token.cancelled())
            .await
            .unwrap();
        assert!(!root.is_cancelled());
    }

    #[tokio::test]
    async fn test_deadline_token_follows_parent() {
        let root = CancellationToken::new();
        let token = deadline_token(&root, Duration::from_secs(3600));
        root.cancel();
        assert!(token.is_cancelled());
    }
}
