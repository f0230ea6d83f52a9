use anyhow::Context;
use clap::Parser;
use lookout::{
    deadline_token, EngineConfig, FetchCoordinator, FetchRequest, InMemoryLog, LogSnapshot,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "lookout")]
#[command(about = "Fetch a bounded snapshot of messages from a partitioned log")]
struct Args {
    /// JSON log snapshot to read from
    #[arg(long)]
    snapshot: PathBuf,

    #[arg(short, long)]
    topic: String,

    /// Partition to read, -1 for all partitions
    #[arg(short, long, default_value = "-1", allow_negative_numbers = true)]
    partition: i32,

    /// Start offset, -1 for newest and -2 for oldest messages
    #[arg(short, long, default_value = "-1", allow_negative_numbers = true)]
    start_offset: i64,

    /// Maximum number of messages across all partitions
    #[arg(short, long, default_value = "50")]
    count: u16,

    /// Cancel the request after this many milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Sort messages by partition and offset instead of arrival order
    #[arg(long)]
    sort: bool,

    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(parse_log_level(&args.log_level))
        .with_writer(std::io::stderr)
        .init();

    let mut config = EngineConfig::from_env().context("loading LOOKOUT_* configuration")?;
    if let Some(timeout_ms) = args.timeout_ms {
        config.request_timeout_ms = timeout_ms;
    }
    config.sort_by_offset |= args.sort;

    let raw = std::fs::read_to_string(&args.snapshot)
        .with_context(|| format!("reading snapshot {}", args.snapshot.display()))?;
    let snapshot: LogSnapshot = serde_json::from_str(&raw)
        .with_context(|| format!("parsing snapshot {}", args.snapshot.display()))?;
    let log = Arc::new(InMemoryLog::from_snapshot(&snapshot)?);
    info!(topics = snapshot.topics.len(), "Loaded log snapshot");

    let request =
        FetchRequest::from_wire(args.topic, args.partition, args.start_offset, args.count)?;
    let coordinator = FetchCoordinator::new(log, config)?;

    let root = CancellationToken::new();
    let cancel = deadline_token(&root, coordinator.config().request_timeout());
    let interrupt = root.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("Received Ctrl+C, cancelling request");
            interrupt.cancel();
        }
    });

    let outcome = coordinator.fetch_messages(&request, &cancel).await;
    root.cancel();

    match outcome {
        Ok(outcome) => {
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            let stats = coordinator.metrics().snapshot();
            let latency = Duration::from_micros(stats.average_fetch_latency_us as u64);
            info!(
                records = stats.records_fetched,
                bytes = stats.bytes_fetched,
                latency_ms = latency.as_millis() as u64,
                "Done"
            );
            Ok(())
        }
        Err(e) => {
            warn!(status = e.status_code(), "{}", e.public_message());
            Err(e.into())
        }
    }
}

fn parse_log_level(level: &str) -> tracing::Level {
    match level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => {
            eprintln!("Invalid log level '{}', defaulting to 'info'", level);
            tracing::Level::INFO
        }
    }
}
