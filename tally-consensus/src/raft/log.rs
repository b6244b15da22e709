use serde::{Deserialize, Serialize};
use tally_common::types::{LogIndex, Term};
use thiserror::Error;

use super::command::Command;

/// A single log entry in the Raft log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: LogIndex,  // 1-based position in the log
    pub term: Term,       // Term number when entry was received by leader
    pub command: Command, // Opaque payload for the state machine
}

impl LogEntry {
    pub fn new(index: LogIndex, term: Term, command: Command) -> Self {
        Self {
            index,
            term,
            command,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LogError {
    #[error("index {index} is out of range (last index {last_index})")]
    OutOfRange { index: LogIndex, last_index: LogIndex },

    #[error("entry index {index} does not follow last index {last_index}")]
    NonContiguous { index: LogIndex, last_index: LogIndex },
}

/// The append-only, gap-free entry sequence of one Raft node.
///
/// Entries are never reordered and only a suffix is ever removed. Whether a
/// suffix may be removed (it must not contain committed entries) is decided by
/// the node, which owns the commit index.
#[derive(Debug, Default, Clone)]
pub struct RaftLog {
    entries: Vec<LogEntry>,
}

impl RaftLog {
    /// Create an empty Raft log
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a log from persisted entries, checking they are contiguous from 1
    pub fn from_entries(entries: Vec<LogEntry>) -> Result<Self, LogError> {
        let mut log = Self::new();
        log.append(entries)?;
        Ok(log)
    }

    /// Append entries; each one must sit exactly at `last_index() + 1`
    pub fn append(&mut self, entries: impl IntoIterator<Item = LogEntry>) -> Result<(), LogError> {
        for entry in entries {
            let last_index = self.last_index();
            if entry.index != last_index + 1 {
                return Err(LogError::NonContiguous {
                    index: entry.index,
                    last_index,
                });
            }
            self.entries.push(entry);
        }
        Ok(())
    }

    /// Get a specific log entry by Raft log index (not array index)
    pub fn entry_at(&self, index: LogIndex) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get((index - 1) as usize)
    }

    /// Term of the entry at `index`; index 0 is the empty prefix with term 0
    pub fn term_at(&self, index: LogIndex) -> Result<Term, LogError> {
        if index == 0 {
            return Ok(0);
        }
        self.entry_at(index)
            .map(|e| e.term)
            .ok_or(LogError::OutOfRange {
                index,
                last_index: self.last_index(),
            })
    }

    /// Returns the last log index, or 0 if the log is empty
    pub fn last_index(&self) -> LogIndex {
        self.entries.len() as LogIndex
    }

    /// Returns the term of the last entry, or 0 if empty
    pub fn last_term(&self) -> Term {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    /// Remove every entry at or after `index`, returning what was removed
    pub fn truncate_suffix_from(&mut self, index: LogIndex) -> Result<Vec<LogEntry>, LogError> {
        let last_index = self.last_index();
        if index == 0 || index > last_index + 1 {
            return Err(LogError::OutOfRange { index, last_index });
        }
        Ok(self.entries.split_off((index - 1) as usize))
    }

    /// Clone up to `max` entries starting at `index`
    pub fn entries_from(&self, index: LogIndex, max: usize) -> Vec<LogEntry> {
        if index == 0 || index > self.last_index() {
            return Vec::new();
        }
        self.entries[(index - 1) as usize..]
            .iter()
            .take(max)
            .cloned()
            .collect()
    }

    /// First index of the run of `term` entries that contains `index`
    pub fn first_index_of_term(&self, term: Term, index: LogIndex) -> LogIndex {
        let mut first = index;
        while first > 1 && self.term_at(first - 1) == Ok(term) {
            first -= 1;
        }
        first
    }

    /// Last index holding an entry of `term`, if any
    pub fn last_index_of_term(&self, term: Term) -> Option<LogIndex> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.term == term)
            .map(|e| e.index)
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
