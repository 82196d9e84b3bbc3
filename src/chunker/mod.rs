use crate::config::DecodeErrorPolicy;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceReadError {
    #[error("io error reading '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("decode error in '{path}' at entry {ordinal}: {detail}")]
    Decode {
        path: PathBuf,
        ordinal: u64,
        detail: String,
    },

    #[error("unsupported file format for '{0}'")]
    UnsupportedFormat(PathBuf),
}

/// Closed set of log formats the engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Csv,
    Text,
}

impl LogFormat {
    /// Determine the format from the file extension, as the validator does.
    pub fn from_path(path: &Path) -> Option<LogFormat> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "json" => Some(LogFormat::Json),
            "csv" => Some(LogFormat::Csv),
            "txt" | "log" => Some(LogFormat::Text),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogFormat::Json => "json",
            LogFormat::Csv => "csv",
            LogFormat::Text => "txt",
        }
    }
}

/// One record from a source file. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub raw: String,
    pub format: LogFormat,
    pub source: PathBuf,
    /// Position of this record within its source file (0-based).
    pub ordinal: u64,
}

/// An ordered, size-capped group of entries from one file. Never mutated
/// after creation; owned by the work unit registry once admitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: u64,
    pub source: PathBuf,
    pub format: LogFormat,
    /// CSV column names, so entries stay self-describing off the header row.
    pub csv_header: Option<Vec<String>>,
    pub entries: Vec<LogEntry>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Run-wide monotonic batch ID source. Batch IDs double as the FIFO
/// dispatch order, so each file's batches must be drawn in file order.
#[derive(Debug, Default, Clone)]
pub struct BatchIdGen {
    next: Arc<AtomicU64>,
}

impl BatchIdGen {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

enum Records {
    /// Whole-file JSON array, drained element by element.
    JsonArray(std::vec::IntoIter<serde_json::Value>),
    /// Line-oriented reading (NDJSON and plaintext).
    Lines(std::io::Lines<BufReader<File>>),
    /// CSV records behind the header row.
    Csv(csv::StringRecordsIntoIter<File>),
}

/// Lazily splits one log file into consecutive batches of at most
/// `chunk_size` entries. Restartable: each `Chunker::open` re-scans from
/// the start of the file; no cursor state survives between chunkers.
pub struct Chunker {
    path: PathBuf,
    format: LogFormat,
    chunk_size: usize,
    policy: DecodeErrorPolicy,
    ids: BatchIdGen,
    csv_header: Option<Vec<String>>,
    records: Records,
    next_ordinal: u64,
    /// Entries skipped under the skip policy, surfaced to the caller.
    pub skipped_entries: u64,
    finished: bool,
}

impl Chunker {
    pub fn open(
        path: &Path,
        chunk_size: usize,
        policy: DecodeErrorPolicy,
        ids: BatchIdGen,
    ) -> Result<Self, SourceReadError> {
        let format =
            LogFormat::from_path(path).ok_or_else(|| SourceReadError::UnsupportedFormat(path.to_path_buf()))?;

        let io_err = |source| SourceReadError::Io {
            path: path.to_path_buf(),
            source,
        };

        let mut csv_header = None;
        let records = match format {
            LogFormat::Json => {
                let mut file = File::open(path).map_err(io_err)?;
                if sniff_json_array(&mut file).map_err(io_err)? {
                    let mut text = String::new();
                    file.read_to_string(&mut text).map_err(io_err)?;
                    let values: Vec<serde_json::Value> =
                        serde_json::from_str(&text).map_err(|e| SourceReadError::Decode {
                            path: path.to_path_buf(),
                            ordinal: 0,
                            detail: format!("invalid JSON array: {e}"),
                        })?;
                    Records::JsonArray(values.into_iter())
                } else {
                    Records::Lines(BufReader::new(file).lines())
                }
            }
            LogFormat::Csv => {
                let mut reader = csv::ReaderBuilder::new()
                    .has_headers(true)
                    .flexible(true)
                    .from_path(path)
                    .map_err(|e| SourceReadError::Decode {
                        path: path.to_path_buf(),
                        ordinal: 0,
                        detail: e.to_string(),
                    })?;
                csv_header = Some(
                    reader
                        .headers()
                        .map_err(|e| SourceReadError::Decode {
                            path: path.to_path_buf(),
                            ordinal: 0,
                            detail: format!("unreadable CSV header: {e}"),
                        })?
                        .iter()
                        .map(str::to_string)
                        .collect(),
                );
                Records::Csv(reader.into_records())
            }
            LogFormat::Text => {
                let file = File::open(path).map_err(io_err)?;
                Records::Lines(BufReader::new(file).lines())
            }
        };

        Ok(Self {
            path: path.to_path_buf(),
            format,
            chunk_size,
            policy,
            ids,
            csv_header,
            records,
            next_ordinal: 0,
            skipped_entries: 0,
            finished: false,
        })
    }

    pub fn format(&self) -> LogFormat {
        self.format
    }

    /// Pull the next record, applying the decode-error policy.
    /// Ok(None) means end of file.
    fn next_entry(&mut self) -> Result<Option<LogEntry>, SourceReadError> {
        loop {
            let raw = match &mut self.records {
                Records::JsonArray(values) => match values.next() {
                    Some(value) => Some(value.to_string()),
                    None => None,
                },
                Records::Lines(lines) => match lines.next() {
                    Some(Ok(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match self.format {
                            // NDJSON: every line must parse as JSON.
                            LogFormat::Json => match serde_json::from_str::<serde_json::Value>(&line) {
                                Ok(_) => Some(line),
                                Err(e) => {
                                    if let Some(err) = self.on_decode_error(format!("invalid JSON line: {e}")) {
                                        return Err(err);
                                    }
                                    continue;
                                }
                            },
                            _ => Some(line),
                        }
                    }
                    Some(Err(e)) => {
                        return Err(SourceReadError::Io {
                            path: self.path.clone(),
                            source: e,
                        })
                    }
                    None => None,
                },
                Records::Csv(records) => match records.next() {
                    Some(Ok(record)) => Some(record.iter().collect::<Vec<_>>().join(",")),
                    Some(Err(e)) => {
                        if let Some(err) = self.on_decode_error(format!("invalid CSV record: {e}")) {
                            return Err(err);
                        }
                        continue;
                    }
                    None => None,
                },
            };

            let Some(raw) = raw else {
                return Ok(None);
            };

            let ordinal = self.next_ordinal;
            self.next_ordinal += 1;
            return Ok(Some(LogEntry {
                raw,
                format: self.format,
                source: self.path.clone(),
                ordinal,
            }));
        }
    }

    /// Skip policy swallows the entry; abort policy turns it into an error.
    fn on_decode_error(&mut self, detail: String) -> Option<SourceReadError> {
        match self.policy {
            DecodeErrorPolicy::Skip => {
                self.skipped_entries += 1;
                self.next_ordinal += 1;
                tracing::debug!(path = %self.path.display(), detail = %detail, "Skipping undecodable entry");
                None
            }
            DecodeErrorPolicy::Abort => Some(SourceReadError::Decode {
                path: self.path.clone(),
                ordinal: self.next_ordinal,
                detail,
            }),
        }
    }
}

impl Iterator for Chunker {
    type Item = Result<Batch, SourceReadError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        let mut entries = Vec::with_capacity(self.chunk_size.min(1024));
        while entries.len() < self.chunk_size {
            match self.next_entry() {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => {
                    self.finished = true;
                    break;
                }
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e));
                }
            }
        }

        if entries.is_empty() {
            return None;
        }

        Some(Ok(Batch {
            id: self.ids.next_id(),
            source: self.path.clone(),
            format: self.format,
            csv_header: self.csv_header.clone(),
            entries,
        }))
    }
}

/// Peek at the first non-whitespace byte to distinguish a whole-file JSON
/// array from NDJSON, then rewind.
fn sniff_json_array(file: &mut File) -> Result<bool, std::io::Error> {
    let mut reader = BufReader::new(&mut *file);
    let mut is_array = false;
    loop {
        let buf = reader.fill_buf()?;
        if buf.is_empty() {
            break;
        }
        match buf.iter().position(|b| !b.is_ascii_whitespace()) {
            Some(pos) => {
                is_array = buf[pos] == b'[';
                break;
            }
            None => {
                let len = buf.len();
                reader.consume(len);
            }
        }
    }
    drop(reader);
    file.seek(SeekFrom::Start(0))?;
    Ok(is_array)
}
