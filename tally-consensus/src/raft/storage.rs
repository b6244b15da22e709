use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tally_common::types::{LogIndex, NodeId, Term};

use super::error::RaftError;
use super::log::LogEntry;

/// Term and vote: must be durable before any reply that depends on them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
}

/// Everything a node needs to rejoin the cluster after a restart.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentState {
    pub hard_state: HardState,
    pub entries: Vec<LogEntry>,
}

/// Defines the behavior for any durable storage backend.
pub trait Storage: Send {
    fn save_hard_state(&mut self, state: &HardState) -> Result<(), RaftError>;
    fn append_entries(&mut self, entries: &[LogEntry]) -> Result<(), RaftError>;
    /// Drop every persisted entry at or after `index`
    fn truncate_from(&mut self, index: LogIndex) -> Result<(), RaftError>;
    fn load(&self) -> Result<PersistentState, RaftError>;
}

fn truncate_entries(entries: &mut Vec<LogEntry>, index: LogIndex) {
    entries.retain(|e| e.index < index);
}

/// Keeps state in memory. Clones share the same state, which lets tests
/// inspect what a node persisted or restart a node from it.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    state: Arc<Mutex<PersistentState>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage pre-populated with `state`
    pub fn with_state(state: PersistentState) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn snapshot(&self) -> PersistentState {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Storage for MemoryStorage {
    fn save_hard_state(&mut self, state: &HardState) -> Result<(), RaftError> {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        guard.hard_state = state.clone();
        Ok(())
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> Result<(), RaftError> {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        guard.entries.extend_from_slice(entries);
        Ok(())
    }

    fn truncate_from(&mut self, index: LogIndex) -> Result<(), RaftError> {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        truncate_entries(&mut guard.entries, index);
        Ok(())
    }

    fn load(&self) -> Result<PersistentState, RaftError> {
        Ok(self.snapshot())
    }
}

/// Saves the whole persistent state as one binary file.
///
/// Every mutation rewrites the image through a temporary file and a rename,
/// so a crash leaves either the old or the new image on disk.
pub struct FileStorage {
    pub path: PathBuf,
    state: PersistentState,
}

impl FileStorage {
    /// Open (or create) storage at `path`, loading any existing image
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, RaftError> {
        let path = path.into();
        let state = if path.exists() {
            let mut file = File::open(&path)?;
            let mut bytes = Vec::new();
            file.read_to_end(&mut bytes)?;
            bincode::deserialize(&bytes)?
        } else {
            PersistentState::default()
        };
        Ok(Self { path, state })
    }

    fn flush(&self) -> Result<(), RaftError> {
        let encoded = bincode::serialize(&self.state)?;
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&encoded)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl Storage for FileStorage {
    fn save_hard_state(&mut self, state: &HardState) -> Result<(), RaftError> {
        self.state.hard_state = state.clone();
        self.flush()
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> Result<(), RaftError> {
        self.state.entries.extend_from_slice(entries);
        self.flush()
    }

    fn truncate_from(&mut self, index: LogIndex) -> Result<(), RaftError> {
        truncate_entries(&mut self.state.entries, index);
        self.flush()
    }

    fn load(&self) -> Result<PersistentState, RaftError> {
        Ok(self.state.clone())
    }
}
