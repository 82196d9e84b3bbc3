use crate::chunker::LogFormat;
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// External collaborator consulted before a file is admitted for chunking.
/// An invalid file is skipped and reported, never fatal to the run.
pub trait FormatValidator: Send + Sync {
    fn is_valid_format(&self, path: &Path) -> bool;
}

/// Default validator: the extension must map to a supported format and the
/// first line must look like that format.
pub struct ExtensionValidator {
    supported: HashSet<String>,
}

impl ExtensionValidator {
    pub fn new(supported_formats: &[String]) -> Self {
        Self {
            supported: supported_formats.iter().map(|s| s.to_ascii_lowercase()).collect(),
        }
    }
}

impl FormatValidator for ExtensionValidator {
    fn is_valid_format(&self, path: &Path) -> bool {
        let Some(format) = LogFormat::from_path(path) else {
            return false;
        };
        if !self.supported.contains(format.as_str())
            // "log" files share the txt format but may be listed separately.
            && !(format == LogFormat::Text && self.supported.contains("log"))
        {
            return false;
        }

        let Ok(file) = File::open(path) else {
            return false;
        };
        let mut first_line = String::new();
        if BufReader::new(file).read_line(&mut first_line).is_err() {
            return false;
        }

        match format {
            LogFormat::Json => {
                let head = first_line.trim_start();
                head.starts_with('[') || head.starts_with('{')
            }
            // A CSV file needs at least a header row.
            LogFormat::Csv => !first_line.trim().is_empty(),
            LogFormat::Text => true,
        }
    }
}
