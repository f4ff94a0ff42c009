//! Durable record of an in-flight reward cycle.
//!
//! A cycle's allocation is written to the journal before the first transfer
//! and every entry's progress is recorded as it happens. If the process stops
//! mid-cycle, the next cycle resumes from the journal instead of taking a new
//! snapshot:
//!
//! - [EntryState::Confirmed] entries are settled in the score store without
//!   paying again, and [EntryState::Settled] entries are left alone,
//! - [EntryState::Pending] and [EntryState::Failed] entries are retried,
//! - [EntryState::Submitted] entries may or may not have landed on the
//!   ledger, and [EntryState::Settling] entries may or may not have been
//!   settled in the score store. Neither is retried nor settled.
//!
//! When a cycle finishes, its in-doubt entries are moved to
//! [JournalRecord::held]. Held players are left out of every later cycle
//! until an operator has checked the ledger and released them.

use std::{
    fmt::Debug,
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
};

use serde::{Deserialize, Serialize};

use crate::{
    allocation::AllocationEntry, ledger::TxHash, player::Address,
    units::TokenAmount,
};

#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("journal I/O failed")]
    Io(#[from] io::Error),
    #[error("journal is not valid JSON")]
    Format(#[from] serde_json::Error),
}

/// Progress of one entry of a journaled cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum EntryState {
    Pending,
    Submitted,
    /// Paid; `None` for zero-amount entries.
    Confirmed(Option<TxHash>),
    /// Paid, and the score store is being updated.
    Settling,
    /// Paid and the score store updated.
    Settled,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub entry: AllocationEntry,
    pub state: EntryState,
}

/// Everything needed to resume a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalRecord {
    pub cycle_id: u64,
    pub pool: TokenAmount,
    /// Entries of the unfinished cycle. Empty once the cycle is closed.
    pub entries: Vec<JournalEntry>,
    /// In-doubt entries of finished cycles, waiting for an operator.
    #[serde(default)]
    pub held: Vec<JournalEntry>,
}

impl JournalRecord {
    /// Creates a record in which every entry is still pending.
    pub fn new(
        cycle_id: u64,
        pool: TokenAmount,
        entries: &[AllocationEntry],
    ) -> Self {
        JournalRecord {
            cycle_id,
            pool,
            entries: entries
                .iter()
                .map(|&entry| JournalEntry {
                    entry,
                    state: EntryState::Pending,
                })
                .collect(),
            held: vec![],
        }
    }

    /// True while the cycle has not been closed.
    pub fn is_open(&self) -> bool {
        !self.entries.is_empty()
    }

    /// Updates the state of `address`'s entry. Returns false if there is no
    /// such entry.
    pub fn mark(&mut self, address: &Address, state: EntryState) -> bool {
        match self.entries.iter_mut().find(|e| &e.entry.address == address) {
            Some(e) => {
                e.state = state;
                true
            }
            None => false,
        }
    }

    fn with_state<F>(&self, pred: F) -> Vec<AllocationEntry>
    where
        F: Fn(&EntryState) -> bool,
    {
        self.entries
            .iter()
            .filter(|e| pred(&e.state))
            .map(|e| e.entry)
            .collect()
    }

    /// Entries confirmed on the ledger but not yet settled in the score
    /// store, with their transaction hashes.
    pub fn confirmed(&self) -> Vec<(AllocationEntry, Option<TxHash>)> {
        self.entries
            .iter()
            .filter_map(|e| match e.state {
                EntryState::Confirmed(tx) => Some((e.entry, tx)),
                _ => None,
            })
            .collect()
    }

    /// Sum of all rewards in the record.
    pub fn total(&self) -> TokenAmount {
        self.entries.iter().map(|e| e.entry.reward).sum()
    }

    /// Entries never sent, or sent and known to have failed.
    pub fn retry_set(&self) -> Vec<AllocationEntry> {
        self.with_state(|s| {
            matches!(s, EntryState::Pending | EntryState::Failed(_))
        })
    }

    /// Entries submitted without a known outcome.
    pub fn in_doubt(&self) -> Vec<AllocationEntry> {
        self.with_state(|s| *s == EntryState::Submitted)
    }

    /// Paid entries whose score may or may not have been settled.
    pub fn settling(&self) -> Vec<AllocationEntry> {
        self.with_state(|s| *s == EntryState::Settling)
    }

    /// Ends the cycle: in-doubt and settling entries move to
    /// [JournalRecord::held] and every other entry is dropped.
    pub fn close(&mut self) {
        let entries = std::mem::take(&mut self.entries);
        self.held.extend(entries.into_iter().filter(|e| {
            matches!(e.state, EntryState::Submitted | EntryState::Settling)
        }));
    }

    /// True if there is nothing left to record.
    pub fn is_finished(&self) -> bool {
        self.entries.is_empty() && self.held.is_empty()
    }

    /// Removes and returns the held entry of `address`.
    pub fn release(&mut self, address: &Address) -> Option<JournalEntry> {
        let i = self.held.iter().position(|e| &e.entry.address == address)?;

        Some(self.held.remove(i))
    }
}

/// Storage for at most one [JournalRecord].
pub trait CycleJournal: Debug + Send + Sync {
    /// Returns the unfinished cycle, if any.
    fn load(&self) -> Result<Option<JournalRecord>, JournalError>;

    /// Durably replaces the stored record with `record`.
    fn store(&self, record: &JournalRecord) -> Result<(), JournalError>;

    /// Removes the stored record, marking the cycle finished.
    fn clear(&self) -> Result<(), JournalError>;
}

/// A journal kept in memory. Held entries carry over between cycles of one
/// process, but a process stopped mid-cycle needs an operator to reconcile
/// the ledger's transaction history with the score store by hand.
#[derive(Debug, Default)]
pub struct MemoryJournal {
    record: Mutex<Option<JournalRecord>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<JournalRecord>> {
        self.record.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl CycleJournal for MemoryJournal {
    fn load(&self) -> Result<Option<JournalRecord>, JournalError> {
        Ok(self.lock().clone())
    }

    fn store(&self, record: &JournalRecord) -> Result<(), JournalError> {
        *self.lock() = Some(record.clone());

        Ok(())
    }

    fn clear(&self) -> Result<(), JournalError> {
        *self.lock() = None;

        Ok(())
    }
}

/// A journal kept as a JSON file. Writes go to a sibling temporary file which
/// is then renamed over the journal.
#[derive(Debug, Clone)]
pub struct FileJournal {
    path: PathBuf,
}

impl FileJournal {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        FileJournal { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_owned();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl CycleJournal for FileJournal {
    fn load(&self) -> Result<Option<JournalRecord>, JournalError> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn store(&self, record: &JournalRecord) -> Result<(), JournalError> {
        let tmp = self.temp_path();
        let bytes = serde_json::to_vec_pretty(record)?;

        let mut file = fs::File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, &self.path)?;

        Ok(())
    }

    fn clear(&self) -> Result<(), JournalError> {
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}
