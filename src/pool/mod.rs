use crate::aggregator::Aggregator;
use crate::analyzer::{analyze, Thresholds};
use crate::events::{EngineEvent, EventBus};
use crate::registry::{DoneOutcome, FailOutcome, WorkUnitRegistry};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Bounded local executor pool: exactly `max_workers` tasks pulling from
/// the same registry contract remote workers use, so local and remote
/// execution are interchangeable. Spawn only after every batch has been
/// admitted; an executor exits when the registry drains.
pub struct LocalPool {
    pub max_workers: usize,
    pub poll_interval: Duration,
    pub max_idle_interval: Duration,
    pub thresholds: Thresholds,
}

impl LocalPool {
    pub fn spawn(
        &self,
        registry: Arc<WorkUnitRegistry>,
        aggregator: Arc<Aggregator>,
        events: EventBus,
        cancel: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        (0..self.max_workers)
            .map(|i| {
                let executor = Executor {
                    worker_id: format!("local-{i}"),
                    registry: Arc::clone(&registry),
                    aggregator: Arc::clone(&aggregator),
                    events: events.clone(),
                    cancel: cancel.clone(),
                    poll_interval: self.poll_interval,
                    max_idle_interval: self.max_idle_interval,
                    thresholds: self.thresholds,
                };
                tokio::spawn(executor.run())
            })
            .collect()
    }
}

struct Executor {
    worker_id: String,
    registry: Arc<WorkUnitRegistry>,
    aggregator: Arc<Aggregator>,
    events: EventBus,
    cancel: CancellationToken,
    poll_interval: Duration,
    max_idle_interval: Duration,
    thresholds: Thresholds,
}

impl Executor {
    async fn run(self) {
        let mut idle_backoff = self.poll_interval;

        loop {
            if self.cancel.is_cancelled() {
                debug!(worker = %self.worker_id, "Local executor cancelled");
                return;
            }

            let Some(assignment) = self.registry.claim_next(&self.worker_id) else {
                if self.registry.counts().is_drained() {
                    debug!(worker = %self.worker_id, "Registry drained, executor exiting");
                    return;
                }
                sleep(jittered(idle_backoff)).await;
                idle_backoff = (idle_backoff * 2).min(self.max_idle_interval);
                continue;
            };
            idle_backoff = self.poll_interval;

            self.events.emit(EngineEvent::UnitDispatched {
                unit_id: assignment.unit_id,
                worker: self.worker_id.clone(),
                attempt: assignment.attempt,
            });

            let thresholds = self.thresholds;
            let batch = Arc::clone(&assignment.batch);
            match tokio::task::spawn_blocking(move || analyze(&batch, thresholds)).await {
                Ok(result) => {
                    if self.registry.mark_done(assignment.unit_id, &self.worker_id)
                        == DoneOutcome::Accepted
                    {
                        self.aggregator.fold(&result);
                        self.events.emit(EngineEvent::UnitDone {
                            unit_id: assignment.unit_id,
                            worker: self.worker_id.clone(),
                        });
                    }
                }
                Err(e) => {
                    let reason = format!("analysis task panicked: {e}");
                    let outcome =
                        self.registry
                            .mark_failed(assignment.unit_id, &self.worker_id, &reason);
                    if outcome != FailOutcome::Stale {
                        self.events.emit(EngineEvent::UnitFailed {
                            unit_id: assignment.unit_id,
                            worker: self.worker_id.clone(),
                            reason,
                            requeued: matches!(outcome, FailOutcome::Requeued { .. }),
                        });
                    }
                }
            }
        }
    }
}

fn jittered(base: Duration) -> Duration {
    let jitter_ms = base.as_millis() as u64 / 4;
    if jitter_ms == 0 {
        return base;
    }
    base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::{Batch, LogEntry, LogFormat};
    use std::path::PathBuf;

    fn make_batch(id: u64, lines: &[&str]) -> Batch {
        let source = PathBuf::from("/logs/pool.log");
        Batch {
            id,
            source: source.clone(),
            format: LogFormat::Text,
            csv_header: None,
            entries: lines
                .iter()
                .enumerate()
                .map(|(i, raw)| LogEntry {
                    raw: raw.to_string(),
                    format: LogFormat::Text,
                    source: source.clone(),
                    ordinal: i as u64,
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn pool_drains_all_admitted_batches() {
        let registry = Arc::new(WorkUnitRegistry::new(3));
        let aggregator = Arc::new(Aggregator::new());
        let (events, _rx) = EventBus::new();

        for id in 0..8 {
            registry.admit(make_batch(id, &["2024-01-15 10:00:00 | INFO | ok"]));
        }

        let pool = LocalPool {
            max_workers: 3,
            poll_interval: Duration::from_millis(10),
            max_idle_interval: Duration::from_millis(50),
            thresholds: Thresholds::default(),
        };
        let handles = pool.spawn(
            Arc::clone(&registry),
            Arc::clone(&aggregator),
            events,
            CancellationToken::new(),
        );
        for handle in handles {
            handle.await.unwrap();
        }

        let counts = registry.counts();
        assert_eq!(counts.done, 8);
        assert!(counts.is_drained());

        let report = aggregator.snapshot();
        assert_eq!(report.total_entries, 8);
        assert_eq!(report.folded_batches.len(), 8);
    }

    #[tokio::test]
    async fn cancelled_pool_stops_claiming() {
        let registry = Arc::new(WorkUnitRegistry::new(3));
        let aggregator = Arc::new(Aggregator::new());
        let (events, _rx) = EventBus::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        for id in 0..4 {
            registry.admit(make_batch(id, &["2024-01-15 10:00:00 | INFO | ok"]));
        }

        let pool = LocalPool {
            max_workers: 2,
            poll_interval: Duration::from_millis(10),
            max_idle_interval: Duration::from_millis(50),
            thresholds: Thresholds::default(),
        };
        for handle in pool.spawn(registry.clone(), aggregator, events, cancel) {
            handle.await.unwrap();
        }

        assert_eq!(registry.counts().pending, 4);
    }
}
