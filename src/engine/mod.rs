use crate::aggregator::{Aggregator, Report};
use crate::analyzer::Thresholds;
use crate::chunker::{BatchIdGen, Chunker};
use crate::config::{Config, ConfigError};
use crate::events::{EngineEvent, EventBus};
use crate::pool::LocalPool;
use crate::registry::{UnitCounts, WorkUnitRegistry};
use crate::transport::server::{run_server, ServerContext};
use crate::transport::TransportError;
use crate::validate::{ExtensionValidator, FormatValidator};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("no analyzable source files found")]
    NoSources,
}

/// User-visible outcome of a run: the merged report plus run accounting.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub report: Report,
    pub total_batches: u64,
    pub succeeded_batches: u64,
    pub failed_batches: u64,
    pub skipped_files: Vec<SkippedFile>,
    /// Entries dropped by the skip decode-error policy during chunking.
    pub skipped_entries: u64,
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedFile {
    pub path: PathBuf,
    pub reason: String,
}

/// One run's worth of engine state. No process-wide singletons: the
/// registry, aggregator and event bus live here and are handed to every
/// task by Arc.
pub struct Engine {
    config: Config,
    registry: Arc<WorkUnitRegistry>,
    aggregator: Arc<Aggregator>,
    events: EventBus,
    cancel: CancellationToken,
    thresholds: Thresholds,
}

impl Engine {
    pub fn new(config: Config, events: EventBus, cancel: CancellationToken) -> Self {
        let registry = Arc::new(WorkUnitRegistry::new(config.retry.max_attempts));
        Self {
            config,
            registry,
            aggregator: Arc::new(Aggregator::new()),
            events,
            cancel,
            thresholds: Thresholds::default(),
        }
    }

    pub fn registry(&self) -> &Arc<WorkUnitRegistry> {
        &self.registry
    }

    /// Point-in-time progress: unit counts plus a report snapshot.
    pub fn progress(&self) -> (UnitCounts, Report) {
        (self.registry.counts(), self.aggregator.snapshot())
    }

    /// Run the whole pipeline: chunk and admit the sources, execute them
    /// on the local pool (and remote workers when serving), and block
    /// until the registry drains or the run is cancelled.
    pub async fn run(&self, sources: &[PathBuf], serve_remote: bool) -> Result<RunSummary, EngineError> {
        let start = Instant::now();
        let mut skipped = Vec::new();

        let skipped_entries = self.admit_sources(sources, &mut skipped)?;
        let total_batches = self.registry.counts().total() as u64;
        info!(
            total_batches,
            skipped_files = skipped.len(),
            skipped_entries,
            "Sources chunked and admitted"
        );

        // Run-scoped stop signal: cancelled by us at drain, or transitively
        // by the caller's token.
        let run_token = self.cancel.child_token();

        let server_handle = if serve_remote {
            let listener = TcpListener::bind(self.config.network.listen_addr()).await?;
            let ctx = Arc::new(ServerContext::new(
                Arc::clone(&self.registry),
                Arc::clone(&self.aggregator),
                self.events.clone(),
                self.config.network.timeout,
                self.config.network.max_connections,
                run_token.clone(),
            ));
            Some(tokio::spawn(run_server(listener, ctx)))
        } else {
            None
        };

        let pool = LocalPool {
            max_workers: self.config.system.max_workers,
            poll_interval: self.config.retry.poll_interval,
            max_idle_interval: self.config.retry.max_idle_interval,
            thresholds: self.thresholds,
        };
        let pool_handles = pool.spawn(
            Arc::clone(&self.registry),
            Arc::clone(&self.aggregator),
            self.events.clone(),
            run_token.clone(),
        );

        let reaper_handle = tokio::spawn(run_reaper(
            Arc::clone(&self.registry),
            self.events.clone(),
            self.config.network.timeout,
            run_token.clone(),
        ));

        self.wait_for_drain().await;
        let cancelled = self.cancel.is_cancelled();
        run_token.cancel();

        for handle in pool_handles {
            let _ = handle.await;
        }
        let _ = reaper_handle.await;
        if let Some(handle) = server_handle {
            let _ = handle.await;
        }

        let mut failed = self.registry.failed_units();
        if cancelled {
            for unit_id in self.registry.unfinished_units() {
                failed.push((unit_id, "run cancelled".to_string()));
            }
        }
        let failed_batches = failed.len() as u64;
        let report = self.aggregator.finalize(total_batches, failed);

        self.events.emit(EngineEvent::RunFinalized {
            total_batches,
            succeeded: report.succeeded_batches(),
            failed: failed_batches,
        });

        Ok(RunSummary {
            succeeded_batches: report.succeeded_batches(),
            failed_batches,
            total_batches,
            skipped_files: skipped,
            skipped_entries,
            elapsed: start.elapsed(),
            cancelled,
            report,
        })
    }

    /// Expand sources, validate each file, chunk the valid ones and admit
    /// every batch. Invalid or unreadable files are skipped and reported,
    /// never fatal to the run. Returns the number of entries the skip
    /// decode-error policy dropped.
    fn admit_sources(
        &self,
        sources: &[PathBuf],
        skipped: &mut Vec<SkippedFile>,
    ) -> Result<u64, EngineError> {
        let validator = ExtensionValidator::new(&self.config.system.supported_formats);
        let ids = BatchIdGen::new();
        let mut admitted_any = false;
        let mut skipped_entries = 0u64;

        for path in expand_sources(sources, skipped) {
            if !validator.is_valid_format(&path) {
                self.skip_file(skipped, &path, "failed format validation");
                continue;
            }

            let mut chunker = match Chunker::open(
                &path,
                self.config.system.chunk_size,
                self.config.system.on_decode_error,
                ids.clone(),
            ) {
                Ok(chunker) => chunker,
                Err(e) => {
                    self.skip_file(skipped, &path, &e.to_string());
                    continue;
                }
            };

            for result in chunker.by_ref() {
                match result {
                    Ok(batch) => {
                        self.registry.admit(batch);
                        admitted_any = true;
                    }
                    Err(e) => {
                        // Abort policy: already-admitted batches from this
                        // file stay in the run; the rest of the file is lost.
                        self.skip_file(skipped, &path, &e.to_string());
                        break;
                    }
                }
            }
            skipped_entries += chunker.skipped_entries;
        }

        if !admitted_any {
            return Err(EngineError::NoSources);
        }
        Ok(skipped_entries)
    }

    fn skip_file(&self, skipped: &mut Vec<SkippedFile>, path: &Path, reason: &str) {
        warn!(path = %path.display(), reason = %reason, "Skipping source file");
        self.events.emit(EngineEvent::FileSkipped {
            path: path.display().to_string(),
            reason: reason.to_string(),
        });
        skipped.push(SkippedFile {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        });
    }

    /// Block until no unit is Pending or Dispatched. Under cancellation,
    /// stop as soon as nothing is in flight (pending units are abandoned;
    /// in-flight ones complete or get reaped).
    async fn wait_for_drain(&self) {
        let mut poll = interval(Duration::from_millis(50));
        loop {
            poll.tick().await;
            let counts = self.registry.counts();
            if counts.is_drained() {
                return;
            }
            if self.cancel.is_cancelled() && counts.dispatched == 0 {
                return;
            }
        }
    }
}

/// Periodically requeue dispatched units whose worker has gone silent
/// past the network timeout, so a crashed worker cannot stall the run.
async fn run_reaper(
    registry: Arc<WorkUnitRegistry>,
    events: EventBus,
    timeout: Duration,
    cancel: CancellationToken,
) {
    let mut tick = interval((timeout / 2).max(Duration::from_millis(50)));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tick.tick() => {
                for (unit_id, worker, outcome) in registry.reap_stale(timeout) {
                    if let crate::registry::FailOutcome::Stale = outcome {
                        continue;
                    }
                    let requeued = matches!(outcome, crate::registry::FailOutcome::Requeued { .. });
                    warn!(unit_id, worker = %worker, requeued, "Reaped stale dispatch");
                    events.emit(EngineEvent::UnitFailed {
                        unit_id,
                        worker,
                        reason: "dispatch timed out".to_string(),
                        requeued,
                    });
                }
            }
        }
    }
}

/// Files pass through unchanged; directories expand to their sorted file
/// entries. Missing paths are recorded as skipped.
fn expand_sources(sources: &[PathBuf], skipped: &mut Vec<SkippedFile>) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for source in sources {
        if source.is_file() {
            files.push(source.clone());
        } else if source.is_dir() {
            match std::fs::read_dir(source) {
                Ok(entries) => {
                    let mut dir_files: Vec<PathBuf> = entries
                        .filter_map(|e| e.ok())
                        .map(|e| e.path())
                        .filter(|p| p.is_file())
                        .collect();
                    dir_files.sort();
                    files.extend(dir_files);
                }
                Err(e) => skipped.push(SkippedFile {
                    path: source.clone(),
                    reason: format!("unreadable directory: {e}"),
                }),
            }
        } else {
            skipped.push(SkippedFile {
                path: source.clone(),
                reason: "no such file or directory".to_string(),
            });
        }
    }
    files
}
