//! Append-only switch intent log.
//!
//! One JSON record per line: `begin_prepare` when a switch starts,
//! `commit` or `abort` when it resolves. On restart, an unresolved
//! `begin_prepare` tail means the process died mid-switch and the engine
//! must force the ABORT merge without advancing the epoch.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ApexError, Result};
use crate::runtime::message::{Epoch, Topology};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "intent", rename_all = "snake_case")]
pub enum IntentRecord {
    BeginPrepare {
        target: Topology,
        epoch: Epoch,
        at: DateTime<Utc>,
    },
    Commit {
        new_epoch: Epoch,
        at: DateTime<Utc>,
    },
    Abort {
        reason: String,
        moved: usize,
        dropped_queue_full: usize,
        at: DateTime<Utc>,
    },
}

pub struct IntentLog {
    path: PathBuf,
    file: File,
}

impl IntentLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, file })
    }

    pub fn append(&mut self, record: &IntentRecord) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        self.file.write_all(line.as_bytes())?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Read every record in order. Truncated or corrupt lines are an error;
    /// the log is the recovery source of truth.
    pub fn read_all(&self) -> Result<Vec<IntentRecord>> {
        let file = File::open(&self.path)?;
        let reader = BufReader::new(file);
        let mut records = Vec::new();
        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: IntentRecord = serde_json::from_str(&line)
                .map_err(|e| ApexError::IntentLogCorrupted(format!("line {}: {}", idx + 1, e)))?;
            records.push(record);
        }
        Ok(records)
    }

    /// The tail record, if any. A `BeginPrepare` tail indicates an
    /// interrupted switch.
    pub fn last(&self) -> Result<Option<IntentRecord>> {
        Ok(self.read_all()?.into_iter().last())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn begin(target: Topology, epoch: Epoch) -> IntentRecord {
        IntentRecord::BeginPrepare {
            target,
            epoch,
            at: Utc::now(),
        }
    }

    #[test]
    fn test_append_and_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = IntentLog::open(dir.path().join("switch.intent")).unwrap();

        log.append(&begin(Topology::Chain, 1)).unwrap();
        log.append(&IntentRecord::Commit {
            new_epoch: 2,
            at: Utc::now(),
        })
        .unwrap();

        let records = log.read_all().unwrap();
        assert_eq!(records.len(), 2);
        assert!(matches!(records[0], IntentRecord::BeginPrepare { epoch: 1, .. }));
        assert!(matches!(records[1], IntentRecord::Commit { new_epoch: 2, .. }));
    }

    #[test]
    fn test_unresolved_prepare_is_the_tail() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = IntentLog::open(dir.path().join("switch.intent")).unwrap();

        log.append(&begin(Topology::Flat, 3)).unwrap();
        let last = log.last().unwrap().unwrap();
        assert!(matches!(last, IntentRecord::BeginPrepare { target: Topology::Flat, .. }));
    }

    #[test]
    fn test_corrupt_line_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("switch.intent");
        std::fs::write(&path, "not json\n").unwrap();

        let log = IntentLog::open(&path).unwrap();
        assert!(matches!(
            log.read_all(),
            Err(ApexError::IntentLogCorrupted(_))
        ));
    }

    #[test]
    fn test_empty_log_has_no_tail() {
        let dir = tempfile::tempdir().unwrap();
        let log = IntentLog::open(dir.path().join("switch.intent")).unwrap();
        assert_eq!(log.last().unwrap(), None);
    }
}
