use crate::chunker::{Batch, LogEntry, LogFormat};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

const VALID_LEVELS: [&str; 5] = ["DEBUG", "INFO", "WARNING", "ERROR", "CRITICAL"];

/// Why a single entry could not be analyzed. Recorded in the batch result
/// as a malformed-entry tally; never aborts the batch.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("entry is not a JSON object")]
    NotAnObject,

    #[error("missing log level field")]
    MissingLevel,

    #[error("invalid log level '{0}'")]
    InvalidLevel(String),

    #[error("malformed record: {0}")]
    MalformedRecord(String),
}

/// Tunable anomaly-detection limits.
#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
    /// Batch flagged when ERROR+CRITICAL entries reach this fraction.
    pub error_ratio: f64,
    /// Batch flagged when malformed entries reach this fraction.
    pub malformed_ratio: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            error_ratio: 0.5,
            malformed_ratio: 0.25,
        }
    }
}

/// Per-batch analysis output, keyed by batch ID. Produced once per
/// successful attempt, folded exactly once into the report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub batch_id: u64,
    pub entries_scanned: u64,
    pub malformed_entries: u64,
    /// Log level -> entry count.
    pub level_counts: BTreeMap<String, u64>,
    /// Source file path -> entry count.
    pub source_counts: BTreeMap<String, u64>,
    /// Hour bucket ("2024-01-15T10") -> entry count.
    pub hour_buckets: BTreeMap<String, u64>,
    pub anomalies: Vec<String>,
}

struct ParsedEntry {
    level: String,
    timestamp: Option<DateTime<Utc>>,
}

/// Analyze one batch. Pure: a function of batch content and the static
/// thresholds, no shared state across concurrent invocations.
pub fn analyze(batch: &Batch, thresholds: Thresholds) -> BatchResult {
    let mut result = BatchResult {
        batch_id: batch.id,
        entries_scanned: 0,
        malformed_entries: 0,
        level_counts: BTreeMap::new(),
        source_counts: BTreeMap::new(),
        hour_buckets: BTreeMap::new(),
        anomalies: Vec::new(),
    };

    let mut severe = 0u64;
    for entry in &batch.entries {
        result.entries_scanned += 1;
        *result
            .source_counts
            .entry(entry.source.display().to_string())
            .or_insert(0) += 1;

        match parse_entry(entry, batch.csv_header.as_deref()) {
            Ok(parsed) => {
                if matches!(parsed.level.as_str(), "ERROR" | "CRITICAL") {
                    severe += 1;
                }
                *result.level_counts.entry(parsed.level).or_insert(0) += 1;
                if let Some(ts) = parsed.timestamp {
                    let bucket = ts.format("%Y-%m-%dT%H").to_string();
                    *result.hour_buckets.entry(bucket).or_insert(0) += 1;
                }
            }
            Err(e) => {
                result.malformed_entries += 1;
                tracing::trace!(
                    batch_id = batch.id,
                    ordinal = entry.ordinal,
                    error = %e,
                    "Malformed entry"
                );
            }
        }
    }

    let scanned = result.entries_scanned as f64;
    if scanned > 0.0 {
        let parsed = result.entries_scanned - result.malformed_entries;
        if parsed > 0 && severe as f64 / parsed as f64 >= thresholds.error_ratio {
            result.anomalies.push(format!(
                "batch {}: {} of {} parsed entries are ERROR/CRITICAL",
                batch.id, severe, parsed
            ));
        }
        if result.malformed_entries as f64 / scanned >= thresholds.malformed_ratio {
            result.anomalies.push(format!(
                "batch {}: {} of {} entries are malformed",
                batch.id, result.malformed_entries, result.entries_scanned
            ));
        }
    }

    result
}

fn parse_entry(entry: &LogEntry, csv_header: Option<&[String]>) -> Result<ParsedEntry, AnalysisError> {
    match entry.format {
        LogFormat::Json => parse_json_entry(&entry.raw),
        LogFormat::Csv => parse_csv_entry(&entry.raw, csv_header),
        LogFormat::Text => parse_text_entry(&entry.raw),
    }
}

fn parse_json_entry(raw: &str) -> Result<ParsedEntry, AnalysisError> {
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| AnalysisError::MalformedRecord(e.to_string()))?;
    let object = value.as_object().ok_or(AnalysisError::NotAnObject)?;

    let level = object
        .get("log_level")
        .or_else(|| object.get("level"))
        .and_then(|v| v.as_str())
        .ok_or(AnalysisError::MissingLevel)?;
    let level = normalize_level(level)?;

    let timestamp = object
        .get("timestamp")
        .and_then(|v| v.as_str())
        .and_then(parse_timestamp);

    Ok(ParsedEntry { level, timestamp })
}

fn parse_csv_entry(raw: &str, header: Option<&[String]>) -> Result<ParsedEntry, AnalysisError> {
    let header = header.ok_or_else(|| AnalysisError::MalformedRecord("missing CSV header".into()))?;

    // Re-parse through the csv crate so quoted fields stay intact.
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(raw.as_bytes());
    let record = reader
        .records()
        .next()
        .ok_or_else(|| AnalysisError::MalformedRecord("empty CSV record".into()))?
        .map_err(|e| AnalysisError::MalformedRecord(e.to_string()))?;

    let field = |name: &str| {
        header
            .iter()
            .position(|h| h == name)
            .and_then(|i| record.get(i))
    };

    let level = field("log_level")
        .or_else(|| field("level"))
        .ok_or(AnalysisError::MissingLevel)?;
    let level = normalize_level(level)?;

    let timestamp = field("timestamp").and_then(parse_timestamp);

    Ok(ParsedEntry { level, timestamp })
}

/// Pipe-delimited plaintext: `timestamp | LEVEL | message [| ...]`.
fn parse_text_entry(raw: &str) -> Result<ParsedEntry, AnalysisError> {
    let parts: Vec<&str> = raw.split('|').collect();
    if parts.len() < 3 {
        return Err(AnalysisError::MalformedRecord(format!(
            "expected at least 3 pipe-separated parts, got {}",
            parts.len()
        )));
    }

    let level = normalize_level(parts[1].trim())?;
    let timestamp = parse_timestamp(parts[0].trim());

    Ok(ParsedEntry { level, timestamp })
}

fn normalize_level(level: &str) -> Result<String, AnalysisError> {
    let upper = level.trim().to_ascii_uppercase();
    if upper.is_empty() {
        return Err(AnalysisError::MissingLevel);
    }
    if VALID_LEVELS.contains(&upper.as_str()) {
        Ok(upper)
    } else {
        Err(AnalysisError::InvalidLevel(level.to_string()))
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    None
}
