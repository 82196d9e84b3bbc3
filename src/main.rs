use clap::{Parser, Subcommand};
use logfan::config::load_config;
use logfan::engine::Engine;
use logfan::events::{drain_to_tracing, EventBus};
use logfan::transport::worker::RemoteWorker;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "logfan")]
#[command(about = "Distributed log analysis engine", long_about = None)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Chunk the given log files or directories, dispatch the batches to
    /// local executors and connected workers, and print the final report.
    Coordinator {
        /// Log files or directories to analyze
        sources: Vec<PathBuf>,

        /// Run without a network listener (local executors only)
        #[arg(long)]
        local_only: bool,
    },
    /// Connect to the configured coordinator and process work units until
    /// the run completes.
    Worker,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "logfan=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config_path = cli
        .config
        .unwrap_or_else(|| PathBuf::from("logfan.yml"));
    let config = load_config(&config_path)?;

    // Ctrl-C cancels the run; in-flight units finish or time out, then
    // the partial report is finalized.
    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Cancellation requested, finishing in-flight work");
            signal_token.cancel();
        }
    });

    match cli.command {
        Commands::Coordinator { sources, local_only } => {
            let (events, events_rx) = EventBus::new();
            let drain = tokio::spawn(drain_to_tracing(events_rx));

            let engine = Engine::new(config, events, cancel);
            let summary = engine.run(&sources, !local_only).await?;

            // Report first; the event drain finishes while the user already
            // has the output.
            println!("{}", serde_json::to_string_pretty(&summary.report.to_serializable())?);
            info!(
                total_batches = summary.total_batches,
                succeeded = summary.succeeded_batches,
                failed = summary.failed_batches,
                skipped_files = summary.skipped_files.len(),
                skipped_entries = summary.skipped_entries,
                elapsed = %humantime_display(summary.elapsed),
                cancelled = summary.cancelled,
                "Run complete"
            );

            drop(engine);
            let _ = drain.await;
        }
        Commands::Worker => {
            let worker = RemoteWorker::from_config(&config, cancel);
            info!(worker = %worker.worker_id(), "Starting worker");
            worker.run().await?;
        }
    }

    Ok(())
}

fn humantime_display(elapsed: std::time::Duration) -> String {
    format!("{:.2}s", elapsed.as_secs_f64())
}
