use crate::analyzer::BatchResult;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

/// The running merged aggregate. All maps are keyed deterministically so
/// the final report is identical under any arrival order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub total_entries: u64,
    pub malformed_entries: u64,
    pub level_counts: BTreeMap<String, u64>,
    pub source_counts: BTreeMap<String, u64>,
    pub hour_buckets: BTreeMap<String, u64>,
    pub anomalies: BTreeSet<String>,
    /// Batch IDs whose result has been folded in.
    pub folded_batches: BTreeSet<u64>,
    /// Permanently failed batch IDs with the last failure reason.
    pub failed_batches: BTreeMap<u64, String>,
    pub expected_batches: u64,
    pub finalized: bool,
}

impl Report {
    pub fn succeeded_batches(&self) -> u64 {
        self.folded_batches.len() as u64
    }

    /// Serializable form for downstream writing.
    pub fn to_serializable(&self) -> serde_json::Value {
        serde_json::json!({
            "total_entries": self.total_entries,
            "malformed_entries": self.malformed_entries,
            "level_counts": self.level_counts,
            "source_counts": self.source_counts,
            "hour_buckets": self.hour_buckets,
            "anomalies": self.anomalies,
            "batches": {
                "expected": self.expected_batches,
                "succeeded": self.succeeded_batches(),
                "failed": self.failed_batches,
            },
            "finalized": self.finalized,
        })
    }
}

/// Folds batch results into the report. The fold is associative and
/// commutative (sums and key-set unions), so retries and reordering never
/// change the outcome; the folded-batch set prevents double counting.
#[derive(Debug, Default)]
pub struct Aggregator {
    report: Mutex<Report>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one result in. Returns false if this batch ID was already
    /// folded (late duplicate from a retried unit).
    pub fn fold(&self, result: &BatchResult) -> bool {
        let mut report = self.report.lock().unwrap();
        if !report.folded_batches.insert(result.batch_id) {
            return false;
        }

        report.total_entries += result.entries_scanned;
        report.malformed_entries += result.malformed_entries;
        for (level, count) in &result.level_counts {
            *report.level_counts.entry(level.clone()).or_insert(0) += count;
        }
        for (source, count) in &result.source_counts {
            *report.source_counts.entry(source.clone()).or_insert(0) += count;
        }
        for (bucket, count) in &result.hour_buckets {
            *report.hour_buckets.entry(bucket.clone()).or_insert(0) += count;
        }
        report.anomalies.extend(result.anomalies.iter().cloned());
        true
    }

    /// Consistent point-in-time copy for progress polling.
    pub fn snapshot(&self) -> Report {
        self.report.lock().unwrap().clone()
    }

    /// Record the run's shape once the registry has drained: how many
    /// batches were expected and which are permanent gaps.
    pub fn finalize(&self, expected_batches: u64, failed: Vec<(u64, String)>) -> Report {
        let mut report = self.report.lock().unwrap();
        report.expected_batches = expected_batches;
        for (id, reason) in failed {
            report.failed_batches.insert(id, reason);
        }
        report.finalized = true;
        report.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn make_result(batch_id: u64, entries: u64, errors: u64) -> BatchResult {
        let mut level_counts = BTreeMap::new();
        level_counts.insert("INFO".to_string(), entries - errors);
        level_counts.insert("ERROR".to_string(), errors);
        let mut source_counts = BTreeMap::new();
        source_counts.insert("/logs/a.log".to_string(), entries);
        BatchResult {
            batch_id,
            entries_scanned: entries,
            malformed_entries: 0,
            level_counts,
            source_counts,
            hour_buckets: BTreeMap::new(),
            anomalies: Vec::new(),
        }
    }

    #[test]
    fn fold_rejects_duplicate_batch_ids() {
        let aggregator = Aggregator::new();
        let result = make_result(1, 100, 5);

        assert!(aggregator.fold(&result));
        assert!(!aggregator.fold(&result));

        let report = aggregator.snapshot();
        assert_eq!(report.total_entries, 100);
        assert_eq!(report.level_counts["ERROR"], 5);
    }

    #[test]
    fn fold_is_commutative_over_arrival_order() {
        let results: Vec<BatchResult> =
            (0..6).map(|i| make_result(i, 10 * (i + 1), i)).collect();

        let forward = Aggregator::new();
        for result in &results {
            forward.fold(result);
        }

        let reverse = Aggregator::new();
        for result in results.iter().rev() {
            reverse.fold(result);
        }

        assert_eq!(forward.snapshot(), reverse.snapshot());
    }

    #[test]
    fn finalize_records_gaps_and_expected_count() {
        let aggregator = Aggregator::new();
        aggregator.fold(&make_result(0, 10, 0));
        aggregator.fold(&make_result(2, 10, 0));

        let report = aggregator.finalize(3, vec![(1, "dispatch timed out".to_string())]);
        assert!(report.finalized);
        assert_eq!(report.expected_batches, 3);
        assert_eq!(report.succeeded_batches(), 2);
        assert_eq!(report.failed_batches[&1], "dispatch timed out");

        let serialized = report.to_serializable();
        assert_eq!(serialized["batches"]["expected"], 3);
        assert_eq!(serialized["batches"]["succeeded"], 2);
    }
}
