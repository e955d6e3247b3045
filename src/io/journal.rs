//! Write-through ledger journal
//!
//! Every ledger mutation is appended here before it is applied in memory.
//! Records are written in JSONL format (one JSON object per line) to the
//! file specified in config. A failed append aborts the mutation.
//!
//! The file is opened in append mode and each record goes out as one
//! `write_all` of a whole line, so concurrent appends never share a lock.

use crate::domain::{Charge, Facility, Session, Spot};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Journal append failure
#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal io: {0}")]
    Io(#[from] std::io::Error),
    #[error("journal encode: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("journal unavailable: {0}")]
    Unavailable(String),
}

/// One persisted ledger mutation
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum JournalRecord<'a> {
    FacilityRegistered { facility: &'a Facility },
    SpotAdded { spot: &'a Spot },
    SessionOpened { session: &'a Session },
    /// Closed session and its charge, persisted as one unit
    SessionClosed { session: &'a Session, charge: &'a Charge },
    ChargeSettled { charge: &'a Charge },
}

impl JournalRecord<'_> {
    pub fn as_str(&self) -> &'static str {
        match self {
            JournalRecord::FacilityRegistered { .. } => "facility_registered",
            JournalRecord::SpotAdded { .. } => "spot_added",
            JournalRecord::SessionOpened { .. } => "session_opened",
            JournalRecord::SessionClosed { .. } => "session_closed",
            JournalRecord::ChargeSettled { .. } => "charge_settled",
        }
    }
}

#[derive(Serialize)]
struct Line<'a> {
    ts: DateTime<Utc>,
    #[serde(flatten)]
    record: &'a JournalRecord<'a>,
}

/// Durable sink for ledger mutations
pub trait Journal: Send + Sync {
    fn append(&self, record: &JournalRecord<'_>) -> Result<(), JournalError>;
}

/// Journal that keeps nothing (in-memory deployments and tests)
#[derive(Debug, Default, Clone, Copy)]
pub struct NullJournal;

impl Journal for NullJournal {
    fn append(&self, _record: &JournalRecord<'_>) -> Result<(), JournalError> {
        Ok(())
    }
}

/// Append-only JSONL journal file
pub struct JsonlJournal {
    file_path: PathBuf,
    file: RwLock<Option<Arc<File>>>,
}

impl JsonlJournal {
    pub fn new<P: AsRef<Path>>(file_path: P) -> Self {
        let file_path = file_path.as_ref().to_path_buf();
        info!(file_path = %file_path.display(), "journal_initialized");
        Self { file_path, file: RwLock::new(None) }
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    fn open(&self) -> std::io::Result<File> {
        // Create parent directories if they don't exist
        if let Some(parent) = self.file_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        OpenOptions::new().create(true).append(true).open(&self.file_path)
    }

    /// Shared handle to the open file, opening it on first use
    fn handle(&self) -> Result<Arc<File>, JournalError> {
        let existing = self.file.read().clone();
        if let Some(file) = existing {
            return Ok(file);
        }
        let mut guard = self.file.write();
        if let Some(file) = guard.as_ref() {
            return Ok(file.clone());
        }
        let file = Arc::new(self.open()?);
        *guard = Some(file.clone());
        Ok(file)
    }

    /// Forget a handle that failed so the next append reopens the file
    fn discard(&self, failed: &Arc<File>) {
        let mut guard = self.file.write();
        if guard.as_ref().is_some_and(|current| Arc::ptr_eq(current, failed)) {
            *guard = None;
        }
    }
}

impl Journal for JsonlJournal {
    fn append(&self, record: &JournalRecord<'_>) -> Result<(), JournalError> {
        let mut line = serde_json::to_string(&Line { ts: Utc::now(), record })?;
        line.push('\n');

        let file = self.handle()?;
        if let Err(e) = (&*file).write_all(line.as_bytes()) {
            self.discard(&file);
            return Err(e.into());
        }

        debug!(record = record.as_str(), bytes = %line.len(), "journal_written");
        Ok(())
    }
}
