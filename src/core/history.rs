use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::core::resolver::{MoveError, Relocation, move_file};

pub const HISTORY_FILE_NAME: &str = ".history.jsonl";

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("IO error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("No history records to restore")]
    Empty,

    #[error("Invalid history index {index}; valid range is 0..={last}")]
    InvalidIndex { index: usize, last: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveRecord {
    pub from: PathBuf,
    pub to: PathBuf,
}

/// One resolved group: the file left in place and where its duplicates went.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub timestamp: String,
    pub retained: PathBuf,
    pub moves: Vec<MoveRecord>,
}

impl HistoryRecord {
    pub fn new(retained: &Path, relocations: &[Relocation]) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            retained: retained.to_path_buf(),
            moves: relocations
                .iter()
                .map(|r| MoveRecord {
                    from: r.from.clone(),
                    to: r.to.clone(),
                })
                .collect(),
        }
    }
}

/// A record as it was read, with its original journal line.
#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub record: HistoryRecord,
    line: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreSelection {
    Latest,
    Record(usize),
    All,
}

#[derive(Debug, Default)]
pub struct RestoreSummary {
    pub records: usize,
    pub restored: Vec<MoveRecord>,
    pub skipped: Vec<(MoveRecord, MoveError)>,
}

/// Append-only relocation journal kept next to the quarantined files.
#[derive(Debug, Clone)]
pub struct History {
    path: PathBuf,
}

impl History {
    pub fn new(quarantine_dir: &Path) -> Self {
        Self {
            path: quarantine_dir.join(HISTORY_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &HistoryRecord) -> Result<(), HistoryError> {
        let line = serde_json::to_string(record)?;
        let mut out = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| self.io_error(source))?;
        writeln!(out, "{line}").map_err(|source| self.io_error(source))
    }

    /// Readable records in journal order. A missing journal is an empty history.
    pub fn load(&self) -> Result<Vec<StoredRecord>, HistoryError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(self.io_error(source)),
        };

        let mut records = Vec::new();
        for (i, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<HistoryRecord>(line) {
                Ok(record) => records.push(StoredRecord {
                    record,
                    line: line.to_string(),
                }),
                Err(e) => log::warn!("Skipping malformed history entry {}: {}", i, e),
            }
        }
        Ok(records)
    }

    /// Move files back to where they were found and drop the restored records from the
    /// journal. Files that cannot be moved back are skipped and reported.
    pub fn restore(&self, selection: RestoreSelection) -> Result<RestoreSummary, HistoryError> {
        let stored = self.load()?;
        if stored.is_empty() {
            return Err(HistoryError::Empty);
        }

        let last = stored.len() - 1;
        let selected: Vec<usize> = match selection {
            RestoreSelection::All => (0..stored.len()).collect(),
            RestoreSelection::Latest => vec![last],
            RestoreSelection::Record(index) if index <= last => vec![index],
            RestoreSelection::Record(index) => {
                return Err(HistoryError::InvalidIndex { index, last });
            }
        };

        let mut summary = RestoreSummary {
            records: selected.len(),
            ..RestoreSummary::default()
        };
        for &i in &selected {
            for entry in &stored[i].record.moves {
                match move_file(&entry.to, &entry.from) {
                    Ok(()) => {
                        log::info!("Restored {} → {}", entry.to.display(), entry.from.display());
                        summary.restored.push(entry.clone());
                    }
                    Err(e) => {
                        log::warn!("Skipping restore of {}: {}", entry.to.display(), e);
                        summary.skipped.push((entry.clone(), e));
                    }
                }
            }
        }

        let remaining: Vec<&str> = stored
            .iter()
            .enumerate()
            .filter(|(i, _)| !selected.contains(i))
            .map(|(_, s)| s.line.as_str())
            .collect();
        let content = if remaining.is_empty() {
            String::new()
        } else {
            remaining.join("\n") + "\n"
        };
        fs::write(&self.path, content).map_err(|source| self.io_error(source))?;

        Ok(summary)
    }

    fn io_error(&self, source: std::io::Error) -> HistoryError {
        HistoryError::Io {
            path: self.path.clone(),
            source,
        }
    }
}
