//! Log replication: the leader's AppendEntries fan-out and the follower's
//! consistency check, plus rollback of `next_index` on rejection.

use tally_common::types::{LogIndex, NodeId, Term};
use tracing::{debug, error, trace, warn};

use super::error::RaftError;
use super::log::RaftLog;
use super::message::{AppendEntriesRequest, AppendEntriesResponse, ConflictHint};
use super::node::RaftNode;
use super::state::Role;

/// What the leader knows about one follower's log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerProgress {
    pub next_index: LogIndex,  // Next entry to send
    pub match_index: LogIndex, // Highest entry known to be replicated
}

impl PeerProgress {
    pub fn new(next_index: LogIndex) -> Self {
        Self {
            next_index,
            match_index: 0,
        }
    }
}

/// Where to resume replication after a follower rejected at `progress.next_index`.
///
/// The result always lies in `match_index + 1 ..= next_index - 1` (or stays at
/// `next_index` when that range is empty), so a rejection can never move the
/// leader backwards past an entry the follower already acknowledged.
pub(super) fn rollback_target(log: &RaftLog, progress: PeerProgress, hint: Option<ConflictHint>) -> LogIndex {
    let PeerProgress {
        next_index,
        match_index,
    } = progress;
    let target = match hint {
        None => next_index.saturating_sub(1),
        Some(ConflictHint {
            conflict_term: None,
            conflict_index,
        }) => conflict_index,
        Some(ConflictHint {
            conflict_term: Some(term),
            conflict_index,
        }) => match log.last_index_of_term(term) {
            // skip the follower's whole run of `term` unless we share it
            Some(last) => last + 1,
            None => conflict_index,
        },
    };
    target
        .min(next_index.saturating_sub(1))
        .max(match_index + 1)
        .max(1)
}

impl RaftNode {
    /// Called on every heartbeat tick; only a leader sends anything
    pub fn handle_heartbeat_tick(&mut self) {
        if self.state.role != Role::Leader {
            return;
        }
        trace!(node = %self.state.id, term = self.state.current_term, "heartbeat");
        self.broadcast_append_entries();
    }

    /// Send every peer the entries it is missing, or an empty heartbeat
    pub(super) fn broadcast_append_entries(&self) {
        for peer in &self.peers {
            self.send_append_entries(peer);
        }
    }

    pub(super) fn send_append_entries(&self, peer: &NodeId) {
        let Some(progress) = self.progress.get(peer) else {
            return;
        };

        let prev_log_index = progress.next_index - 1;
        let prev_log_term = match self.log.term_at(prev_log_index) {
            Ok(term) => term,
            Err(err) => {
                warn!(node = %self.state.id, peer = %peer, error = %err, "next index beyond log");
                return;
            }
        };
        let entries = self
            .log
            .entries_from(progress.next_index, self.config.max_append_entries);

        trace!(
            node = %self.state.id,
            peer = %peer,
            prev_log_index,
            entries = entries.len(),
            "sending append entries"
        );
        self.send(
            peer,
            AppendEntriesRequest {
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: self.state.commit_index,
            },
        );
    }

    /// Handles AppendEntries RPC as a follower
    pub(super) fn handle_append_request(
        &mut self,
        sender: NodeId,
        term: Term,
        request: AppendEntriesRequest,
    ) -> Result<(), RaftError> {
        // 1. Reject if term is older
        if term < self.state.current_term {
            debug!(node = %self.state.id, leader = %sender, term, "rejecting append from stale leader");
            self.send(&sender, AppendEntriesResponse::rejected(None));
            return Ok(());
        }

        // 2. A valid leader for this term exists: follow it
        self.become_follower(term, Some(sender.clone()))?;

        // 3. Validate previous entry consistency
        let last_index = self.log.last_index();
        if request.prev_log_index > last_index {
            let hint = ConflictHint {
                conflict_term: None,
                conflict_index: last_index + 1,
            };
            self.send(&sender, AppendEntriesResponse::rejected(Some(hint)));
            return Ok(());
        }
        let local_term = self.log.term_at(request.prev_log_index)?;
        if local_term != request.prev_log_term {
            let hint = ConflictHint {
                conflict_term: Some(local_term),
                conflict_index: self.log.first_index_of_term(local_term, request.prev_log_index),
            };
            debug!(
                node = %self.state.id,
                prev_log_index = request.prev_log_index,
                prev_log_term = request.prev_log_term,
                local_term,
                "log mismatch"
            );
            self.send(&sender, AppendEntriesResponse::rejected(Some(hint)));
            return Ok(());
        }

        let contiguous = request
            .entries
            .iter()
            .zip(request.prev_log_index + 1..)
            .all(|(entry, index)| entry.index == index);
        if !contiguous {
            warn!(node = %self.state.id, leader = %sender, "append request with non-contiguous entries");
            self.send(&sender, AppendEntriesResponse::rejected(None));
            return Ok(());
        }

        // 4. Skip entries we already hold, truncate at the first conflict
        let match_index = request.prev_log_index + request.entries.len() as LogIndex;
        let mut new_entries = request.entries;
        let mut skip = 0;
        for entry in &new_entries {
            match self.log.entry_at(entry.index) {
                Some(existing) if existing.term == entry.term => skip += 1,
                Some(_) => {
                    if entry.index <= self.state.commit_index {
                        error!(
                            node = %self.state.id,
                            index = entry.index,
                            commit_index = self.state.commit_index,
                            "refusing to overwrite committed entry"
                        );
                        self.send(&sender, AppendEntriesResponse::rejected(None));
                        return Ok(());
                    }
                    self.storage.truncate_from(entry.index)?;
                    let removed = self.log.truncate_suffix_from(entry.index)?;
                    self.fail_pending_from(entry.index);
                    debug!(node = %self.state.id, from = entry.index, removed = removed.len(), "truncated conflicting entries");
                    break;
                }
                None => break,
            }
        }
        new_entries.drain(..skip);

        if !new_entries.is_empty() {
            self.storage.append_entries(&new_entries)?;
            self.log.append(new_entries)?;
        }

        // 5. Update commit index
        self.commit_to(request.leader_commit.min(match_index))?;

        self.send(&sender, AppendEntriesResponse::accepted(match_index));
        Ok(())
    }

    /// Called when follower responds to an AppendEntries RPC
    pub(super) fn handle_append_response(
        &mut self,
        sender: NodeId,
        term: Term,
        response: AppendEntriesResponse,
    ) -> Result<(), RaftError> {
        if term > self.state.current_term {
            return self.become_follower(term, None);
        }
        if self.state.role != Role::Leader || term < self.state.current_term {
            return Ok(());
        }

        let last_index = self.log.last_index();
        let Some(progress) = self.progress.get_mut(&sender) else {
            warn!(node = %self.state.id, peer = %sender, "append response from unknown peer");
            return Ok(());
        };

        if response.success {
            let acked = response.match_index.min(last_index);
            progress.match_index = progress.match_index.max(acked);
            progress.next_index = progress.match_index + 1;
            let caught_up = progress.next_index > last_index;

            self.advance_commit_index()?;
            if !caught_up {
                self.send_append_entries(&sender);
            }
        } else {
            // retried on the next heartbeat
            let next_index = rollback_target(&self.log, *progress, response.conflict);
            debug!(
                node = %self.state.id,
                peer = %sender,
                from = progress.next_index,
                to = next_index,
                "follower rejected append, rolling back"
            );
            progress.next_index = next_index;
        }
        Ok(())
    }
}
