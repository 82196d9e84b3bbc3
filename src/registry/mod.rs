use crate::chunker::Batch;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub type UnitId = u64;
pub type WorkerId = String;

/// Scheduling state of one work unit. The wrapped batch is immutable;
/// these transitions are the only mutable part of a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitState {
    Pending,
    Dispatched { worker: WorkerId, since: Instant },
    Done,
    Failed,
}

#[derive(Debug, Clone)]
pub struct WorkUnit {
    pub batch: Arc<Batch>,
    pub state: UnitState,
    /// Number of dispatches so far.
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// A unit claimed for execution.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub unit_id: UnitId,
    pub attempt: u32,
    pub batch: Arc<Batch>,
}

/// Outcome of reporting a completed unit.
#[derive(Debug, PartialEq, Eq)]
pub enum DoneOutcome {
    /// First completion; the result should be folded into the report.
    Accepted,
    /// The unit was reaped and reassigned, or already finished. Idempotent no-op.
    Stale,
}

/// Outcome of reporting a failed attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum FailOutcome {
    /// Requeued as Pending for another attempt.
    Requeued { attempt: u32 },
    /// Attempts exhausted; the unit is a permanent gap in the report.
    Exhausted,
    /// The unit was not dispatched to this worker anymore.
    Stale,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnitCounts {
    pub pending: usize,
    pub dispatched: usize,
    pub done: usize,
    pub failed: usize,
}

impl UnitCounts {
    pub fn total(&self) -> usize {
        self.pending + self.dispatched + self.done + self.failed
    }

    /// True once no unit can make further progress.
    pub fn is_drained(&self) -> bool {
        self.pending == 0 && self.dispatched == 0
    }
}

/// Single source of truth for work unit state. Every transition goes
/// through the one internal lock, so two dispatches can never claim the
/// same Pending unit.
pub struct WorkUnitRegistry {
    units: Mutex<BTreeMap<UnitId, WorkUnit>>,
    max_attempts: u32,
}

impl WorkUnitRegistry {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            units: Mutex::new(BTreeMap::new()),
            max_attempts,
        }
    }

    /// Admit a batch as a Pending unit. The batch ID is the unit ID.
    pub fn admit(&self, batch: Batch) -> UnitId {
        let id = batch.id;
        let mut units = self.units.lock().unwrap();
        units.insert(
            id,
            WorkUnit {
                batch: Arc::new(batch),
                state: UnitState::Pending,
                attempts: 0,
                last_error: None,
            },
        );
        id
    }

    /// Atomically claim the oldest Pending unit (FIFO by batch ID) for a
    /// worker, transitioning it to Dispatched.
    pub fn claim_next(&self, worker: &str) -> Option<Assignment> {
        let mut units = self.units.lock().unwrap();
        let (id, unit) = units
            .iter_mut()
            .find(|(_, unit)| unit.state == UnitState::Pending)?;

        unit.attempts += 1;
        unit.state = UnitState::Dispatched {
            worker: worker.to_string(),
            since: Instant::now(),
        };

        Some(Assignment {
            unit_id: *id,
            attempt: unit.attempts,
            batch: Arc::clone(&unit.batch),
        })
    }

    /// Record a successful result. Only the worker currently holding the
    /// dispatch is accepted; late submissions from reaped attempts are
    /// idempotent no-ops.
    pub fn mark_done(&self, unit_id: UnitId, worker: &str) -> DoneOutcome {
        let mut units = self.units.lock().unwrap();
        let Some(unit) = units.get_mut(&unit_id) else {
            return DoneOutcome::Stale;
        };
        match &unit.state {
            UnitState::Dispatched { worker: holder, .. } if holder == worker => {
                unit.state = UnitState::Done;
                unit.last_error = None;
                DoneOutcome::Accepted
            }
            _ => DoneOutcome::Stale,
        }
    }

    /// Record a failed attempt. Requeues until attempts reach the maximum,
    /// then the unit becomes a terminal Failed.
    pub fn mark_failed(&self, unit_id: UnitId, worker: &str, reason: &str) -> FailOutcome {
        let mut units = self.units.lock().unwrap();
        let Some(unit) = units.get_mut(&unit_id) else {
            return FailOutcome::Stale;
        };
        match &unit.state {
            UnitState::Dispatched { worker: holder, .. } if holder == worker => {
                unit.last_error = Some(reason.to_string());
                if unit.attempts >= self.max_attempts {
                    unit.state = UnitState::Failed;
                    FailOutcome::Exhausted
                } else {
                    unit.state = UnitState::Pending;
                    FailOutcome::Requeued {
                        attempt: unit.attempts,
                    }
                }
            }
            _ => FailOutcome::Stale,
        }
    }

    /// Treat Dispatched units older than the timeout as failed attempts,
    /// reclaiming them from crashed or hung workers.
    pub fn reap_stale(&self, timeout: Duration) -> Vec<(UnitId, WorkerId, FailOutcome)> {
        let stale: Vec<(UnitId, WorkerId)> = {
            let units = self.units.lock().unwrap();
            units
                .iter()
                .filter_map(|(id, unit)| match &unit.state {
                    UnitState::Dispatched { worker, since } if since.elapsed() >= timeout => {
                        Some((*id, worker.clone()))
                    }
                    _ => None,
                })
                .collect()
        };

        stale
            .into_iter()
            .map(|(id, worker)| {
                let outcome = self.mark_failed(id, &worker, "dispatch timed out");
                (id, worker, outcome)
            })
            .collect()
    }

    /// Requeue everything a disconnected worker still holds.
    pub fn release_worker(&self, worker: &str) -> Vec<(UnitId, FailOutcome)> {
        let held: Vec<UnitId> = {
            let units = self.units.lock().unwrap();
            units
                .iter()
                .filter_map(|(id, unit)| match &unit.state {
                    UnitState::Dispatched { worker: holder, .. } if holder == worker => Some(*id),
                    _ => None,
                })
                .collect()
        };

        held.into_iter()
            .map(|id| (id, self.mark_failed(id, worker, "worker disconnected")))
            .collect()
    }

    pub fn counts(&self) -> UnitCounts {
        let units = self.units.lock().unwrap();
        let mut counts = UnitCounts::default();
        for unit in units.values() {
            match unit.state {
                UnitState::Pending => counts.pending += 1,
                UnitState::Dispatched { .. } => counts.dispatched += 1,
                UnitState::Done => counts.done += 1,
                UnitState::Failed => counts.failed += 1,
            }
        }
        counts
    }

    pub fn attempts(&self, unit_id: UnitId) -> Option<u32> {
        let units = self.units.lock().unwrap();
        units.get(&unit_id).map(|unit| unit.attempts)
    }

    /// Terminal failures with their last recorded reason, for the final
    /// report's gap accounting.
    pub fn failed_units(&self) -> Vec<(UnitId, String)> {
        let units = self.units.lock().unwrap();
        units
            .iter()
            .filter(|(_, unit)| unit.state == UnitState::Failed)
            .map(|(id, unit)| {
                (
                    *id,
                    unit.last_error.clone().unwrap_or_else(|| "unknown".to_string()),
                )
            })
            .collect()
    }

    /// Unfinished units (used when a cancelled run finalizes early).
    pub fn unfinished_units(&self) -> Vec<UnitId> {
        let units = self.units.lock().unwrap();
        units
            .iter()
            .filter(|(_, unit)| {
                matches!(unit.state, UnitState::Pending | UnitState::Dispatched { .. })
            })
            .map(|(id, _)| *id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::LogFormat;
    use std::path::PathBuf;

    fn make_batch(id: u64) -> Batch {
        Batch {
            id,
            source: PathBuf::from("/logs/a.log"),
            format: LogFormat::Text,
            csv_header: None,
            entries: Vec::new(),
        }
    }

    fn registry_with(ids: &[u64], max_attempts: u32) -> WorkUnitRegistry {
        let registry = WorkUnitRegistry::new(max_attempts);
        for &id in ids {
            registry.admit(make_batch(id));
        }
        registry
    }

    #[test]
    fn claims_are_fifo_by_batch_id() {
        let registry = registry_with(&[3, 1, 2], 3);
        assert_eq!(registry.claim_next("w1").unwrap().unit_id, 1);
        assert_eq!(registry.claim_next("w1").unwrap().unit_id, 2);
        assert_eq!(registry.claim_next("w1").unwrap().unit_id, 3);
        assert!(registry.claim_next("w1").is_none());
    }

    #[test]
    fn done_accepts_only_the_current_holder_once() {
        let registry = registry_with(&[1], 3);
        let assignment = registry.claim_next("w1").unwrap();

        assert_eq!(registry.mark_done(assignment.unit_id, "w2"), DoneOutcome::Stale);
        assert_eq!(registry.mark_done(assignment.unit_id, "w1"), DoneOutcome::Accepted);
        // A duplicate completion is a no-op.
        assert_eq!(registry.mark_done(assignment.unit_id, "w1"), DoneOutcome::Stale);
        assert_eq!(registry.counts().done, 1);
    }

    #[test]
    fn failure_requeues_until_attempts_exhausted() {
        let registry = registry_with(&[1], 3);

        for attempt in 1..3u32 {
            let assignment = registry.claim_next("w1").unwrap();
            assert_eq!(assignment.attempt, attempt);
            assert_eq!(
                registry.mark_failed(1, "w1", "analysis failed"),
                FailOutcome::Requeued { attempt }
            );
        }

        let assignment = registry.claim_next("w1").unwrap();
        assert_eq!(assignment.attempt, 3);
        assert_eq!(registry.mark_failed(1, "w1", "analysis failed"), FailOutcome::Exhausted);

        assert!(registry.claim_next("w1").is_none());
        let counts = registry.counts();
        assert_eq!(counts.failed, 1);
        assert!(counts.is_drained());
        assert_eq!(registry.failed_units(), vec![(1, "analysis failed".to_string())]);
    }

    #[test]
    fn reap_requeues_stale_dispatches() {
        let registry = registry_with(&[1, 2], 3);
        registry.claim_next("w1").unwrap();

        // Zero timeout treats every dispatched unit as stale.
        let reaped = registry.reap_stale(Duration::ZERO);
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].0, 1);
        assert_eq!(reaped[0].2, FailOutcome::Requeued { attempt: 1 });

        // The reaped unit is claimable again, before unit 2 has been touched.
        let assignment = registry.claim_next("w2").unwrap();
        assert_eq!(assignment.unit_id, 1);
        assert_eq!(assignment.attempt, 2);

        // A late submission from the reaped holder is rejected.
        assert_eq!(registry.mark_done(1, "w1"), DoneOutcome::Stale);
        assert_eq!(registry.mark_done(1, "w2"), DoneOutcome::Accepted);
    }

    #[test]
    fn release_worker_requeues_all_holdings() {
        let registry = registry_with(&[1, 2, 3], 3);
        registry.claim_next("w1").unwrap();
        registry.claim_next("w2").unwrap();

        let released = registry.release_worker("w1");
        assert_eq!(released, vec![(1, FailOutcome::Requeued { attempt: 1 })]);

        let counts = registry.counts();
        assert_eq!(counts.pending, 2);
        assert_eq!(counts.dispatched, 1);
    }

    #[test]
    fn fresh_dispatch_is_not_reaped() {
        let registry = registry_with(&[1], 3);
        registry.claim_next("w1").unwrap();
        assert!(registry.reap_stale(Duration::from_secs(60)).is_empty());
    }
}
