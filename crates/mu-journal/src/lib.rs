// SPDX-License-Identifier: MIT OR Apache-2.0
//! mu-journal
#![deny(unsafe_code)]
//!
//! Append-only JSONL persistence for the control plane. [`JsonlJournal`] is
//! the file primitive (one JSON object per line, fsync'd appends, linear
//! replay); [`CommandJournal`] layers the command lifecycle validator and the
//! mutating-domain-event index on top of it.
//!
//! A single writer owns each journal; callers serialize `append*` through the
//! owning store's API and read via snapshots rebuilt on load.

pub mod command_journal;

pub use command_journal::{
    CommandJournal, CommandJournalEntry, CommandJournalError, DomainEvent,
};

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors from journal I/O and decoding.
#[derive(Debug, Error)]
pub enum JournalError {
    /// Filesystem failure.
    #[error("journal io error at {path}: {source}")]
    Io {
        /// Journal path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A row failed to serialize.
    #[error("journal encode error: {0}")]
    Encode(#[source] serde_json::Error),

    /// A stored line failed to parse during replay.
    #[error("journal corrupt at {path}:{line}: {source}")]
    Corrupt {
        /// Journal path.
        path: PathBuf,
        /// 1-indexed line number.
        line: usize,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },
}

/// An append-only JSONL file.
///
/// Rows are written as single-line JSON followed by `\n` and fsync'd before
/// `append` returns. Loading replays every line in order; blank lines are
/// skipped, anything unparsable is a hard error.
#[derive(Debug)]
pub struct JsonlJournal {
    path: PathBuf,
}

impl JsonlJournal {
    /// Create a handle for the journal at `path`. The file is created lazily
    /// on first append.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The journal's path on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one row and fsync.
    pub fn append<T: Serialize>(&mut self, row: &T) -> Result<(), JournalError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| JournalError::Io {
                path: self.path.clone(),
                source,
            })?;
        }
        let mut line = serde_json::to_string(row).map_err(JournalError::Encode)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| JournalError::Io {
                path: self.path.clone(),
                source,
            })?;
        file.write_all(line.as_bytes())
            .and_then(|()| file.sync_data())
            .map_err(|source| JournalError::Io {
                path: self.path.clone(),
                source,
            })
    }

    /// Replay every row in journal order. A missing file is an empty journal.
    pub fn load<T: DeserializeOwned>(&self) -> Result<Vec<T>, JournalError> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(JournalError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        let reader = BufReader::new(file);
        let mut rows = Vec::new();
        for (idx, line) in reader.lines().enumerate() {
            let line = line.map_err(|source| JournalError::Io {
                path: self.path.clone(),
                source,
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let row = serde_json::from_str(&line).map_err(|source| JournalError::Corrupt {
                path: self.path.clone(),
                line: idx + 1,
                source,
            })?;
            rows.push(row);
        }
        Ok(rows)
    }
}
