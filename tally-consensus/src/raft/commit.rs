//! Commit tracking: quorum match on the leader, leader-driven commit on
//! followers, and hand-off of newly committed entries to the apply loop.

use tally_common::types::LogIndex;
use tracing::{debug, warn};

use super::apply::ApplyTask;
use super::error::RaftError;
use super::node::{RaftNode, COMMIT_INDEX, ENTRIES_COMMITTED};
use super::state::Role;

impl RaftNode {
    /// Check if a log index is safely replicated on a majority and commit it.
    ///
    /// Only entries from the current term are committed by counting replicas;
    /// earlier entries become committed indirectly once one of ours is.
    pub(super) fn advance_commit_index(&mut self) -> Result<(), RaftError> {
        if self.state.role != Role::Leader {
            return Ok(());
        }

        let mut match_indexes: Vec<LogIndex> = self.progress.values().map(|p| p.match_index).collect();
        match_indexes.push(self.log.last_index()); // include leader's own index
        match_indexes.sort_by(|a, b| b.cmp(a)); // descending

        let Some(&candidate) = match_indexes.get(self.quorum() - 1) else {
            return Ok(());
        };
        if candidate <= self.state.commit_index {
            return Ok(());
        }
        if self.log.term_at(candidate)? != self.state.current_term {
            debug!(node = %self.state.id, index = candidate, "quorum reached on entry from an earlier term");
            return Ok(());
        }
        self.commit_to(candidate)
    }

    /// Raise the commit index to `index` (never lowers it) and hand the newly
    /// committed entries to the apply loop.
    pub(super) fn commit_to(&mut self, index: LogIndex) -> Result<(), RaftError> {
        if index <= self.state.commit_index {
            return Ok(());
        }
        let previous = self.state.commit_index;
        self.state.commit_index = index;
        for _ in previous..index {
            self.metrics.inc_counter(ENTRIES_COMMITTED);
        }
        self.metrics.observe_gauge(COMMIT_INDEX, index as f64);
        debug!(node = %self.state.id, commit_index = index, "commit index advanced");

        self.apply_committed()
    }

    /// Send every committed but not yet dispatched entry to the apply loop, in
    /// index order. `last_applied` tracks what has been handed over.
    fn apply_committed(&mut self) -> Result<(), RaftError> {
        while self.state.last_applied < self.state.commit_index {
            let index = self.state.last_applied + 1;
            let Some(entry) = self.log.entry_at(index).cloned() else {
                warn!(node = %self.state.id, index, "committed entry missing from log");
                break;
            };
            let pending = self.pending.remove(&index);
            self.apply_tx
                .send(ApplyTask { entry, pending })
                .map_err(|_| RaftError::Shutdown)?;
            self.state.last_applied = index;
        }
        Ok(())
    }
}
