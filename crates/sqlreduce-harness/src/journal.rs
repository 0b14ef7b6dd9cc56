//! Durable crash journal shared between the harness and its worker.
//!
//! The worker appends one JSON record per line and syncs after each one,
//! so whatever it wrote before dying is readable by the parent. Replay
//! folds the records into the retained sequence and the verdict.
//!
//! Record order for a run over `n` statements:
//!
//! ```text
//! started            (header; the verdict is "crash" until overwritten)
//! pending i sql      (before statement i runs)
//! dropped i          (statement i ran, was harmless, is not retained)
//! ... repeated ...
//! fault signature    (statement i faulted; it stays retained)
//!   or
//! cleared            (all statements ran without a fault)
//! ```

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sqlreduce_error::{ReduceError, Result};
use tracing::{debug, warn};

use crate::classifier::FaultSignature;
use crate::script::Statement;

/// Journal file name inside the work directory.
pub const CRASH_JOURNAL_FILE: &str = "crash_journal.jsonl";

pub const JOURNAL_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum JournalRecord {
    Started {
        schema_version: u32,
        statement_count: usize,
    },
    Pending {
        position: usize,
        sql: Statement,
    },
    Dropped {
        position: usize,
    },
    Fault {
        signature: FaultSignature,
    },
    Cleared,
}

/// Append-only writer side.
#[derive(Debug)]
pub struct CrashJournal {
    path: PathBuf,
    file: File,
}

impl CrashJournal {
    /// Create a fresh journal at `path`, replacing any previous one, and
    /// write the header.
    pub fn create(path: &Path, statement_count: usize) -> Result<Self> {
        remove_journal(path)?;
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|err| ReduceError::journal(path, format!("create failed: {err}")))?;
        let mut journal = Self {
            path: path.to_path_buf(),
            file,
        };
        journal.append(&JournalRecord::Started {
            schema_version: JOURNAL_SCHEMA_VERSION,
            statement_count,
        })?;
        Ok(journal)
    }

    /// Append one record and make it durable before returning.
    pub fn append(&mut self, record: &JournalRecord) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        self.file
            .write_all(line.as_bytes())
            .and_then(|()| self.file.sync_data())
            .map_err(|err| ReduceError::journal(&self.path, format!("append failed: {err}")))
    }
}

/// Delete a journal left over from an earlier trial. Missing is fine.
pub fn remove_journal(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(ReduceError::journal(path, format!("remove failed: {err}"))),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetainedStatement {
    /// 1-based position in the sequence the worker was given.
    pub position: usize,
    pub sql: Statement,
}

/// What replay recovered from a journal that recorded a fault or a death.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashReport {
    /// Retained statements in original order, the faulting one last.
    pub retained: Vec<RetainedStatement>,
    /// Recorded signature, or the crash placeholder when the worker died
    /// without reaching a verdict.
    pub signature: FaultSignature,
    pub worker_died: bool,
}

/// What a journal says about the run that wrote it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalVerdict {
    /// No journal, or no complete header: the sequence never started.
    Unwritten,
    /// Every statement ran without a fault.
    Cleared,
    Faulted(CrashReport),
}

/// Fold a journal into a [`JournalVerdict`].
///
/// A torn final line (the worker died mid-write) is ignored; corruption
/// anywhere else is an error.
pub fn replay_journal(path: &Path) -> Result<JournalVerdict> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            warn!(path = %path.display(), "worker left no journal");
            return Ok(JournalVerdict::Unwritten);
        }
        Err(err) => return Err(ReduceError::journal(path, format!("read failed: {err}"))),
    };

    let lines: Vec<&str> = text.lines().filter(|line| !line.trim().is_empty()).collect();
    let mut records = Vec::with_capacity(lines.len());
    for (index, line) in lines.iter().enumerate() {
        match serde_json::from_str::<JournalRecord>(line) {
            Ok(record) => records.push(record),
            Err(err) if index + 1 == lines.len() => {
                warn!(path = %path.display(), error = %err, "ignoring torn final journal line");
            }
            Err(err) => {
                return Err(ReduceError::journal(
                    path,
                    format!("line {} is corrupt: {err}", index + 1),
                ));
            }
        }
    }

    let mut records = records.into_iter();
    match records.next() {
        Some(JournalRecord::Started { schema_version, .. })
            if schema_version == JOURNAL_SCHEMA_VERSION => {}
        Some(JournalRecord::Started { schema_version, .. }) => {
            return Err(ReduceError::journal(
                path,
                format!("unsupported schema version {schema_version}"),
            ));
        }
        // Nothing durable was written: the worker died before its header.
        None => {
            warn!(path = %path.display(), "journal has no complete header");
            return Ok(JournalVerdict::Unwritten);
        }
        Some(_) => return Err(ReduceError::journal(path, "missing header record")),
    }

    let mut retained = BTreeMap::new();
    let mut verdict = None;
    for record in records {
        match record {
            JournalRecord::Pending { position, sql } => {
                retained.insert(position, sql);
            }
            JournalRecord::Dropped { position } => {
                retained.remove(&position);
            }
            JournalRecord::Fault { signature } => verdict = Some(Some(signature)),
            JournalRecord::Cleared => verdict = Some(None),
            JournalRecord::Started { .. } => {
                return Err(ReduceError::journal(path, "duplicate header record"));
            }
        }
    }

    let retained: Vec<RetainedStatement> = retained
        .into_iter()
        .map(|(position, sql)| RetainedStatement { position, sql })
        .collect();

    let verdict = match verdict {
        Some(None) => JournalVerdict::Cleared,
        Some(Some(signature)) => JournalVerdict::Faulted(CrashReport {
            retained,
            signature,
            worker_died: false,
        }),
        None => JournalVerdict::Faulted(CrashReport {
            retained,
            signature: FaultSignature::crash_placeholder(),
            worker_died: true,
        }),
    };
    debug!(
        path = %path.display(),
        faulted = matches!(verdict, JournalVerdict::Faulted(_)),
        "crash journal replayed"
    );
    Ok(verdict)
}
