use serde::{Deserialize, Serialize};
use std::fmt;
use tally_common::types::{LogIndex, NodeId, Term};

use super::storage::HardState;

/// Possible roles a Raft node can assume
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum Role {
    #[default]
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Follower => "follower",
            Role::Candidate => "candidate",
            Role::Leader => "leader",
        };
        f.write_str(name)
    }
}

/// Term, vote and role bookkeeping for one server.
///
/// `current_term` never decreases, `last_applied <= commit_index`, and
/// `commit_index` never exceeds the last log index.
#[derive(Debug, Clone)]
pub struct ServerState {
    pub id: NodeId,                // This node's unique ID
    pub current_term: Term,        // Last term node has seen
    pub voted_for: Option<NodeId>, // ID of candidate voted for in current term
    pub role: Role,                // Current role
    pub commit_index: LogIndex,    // Highest index known committed
    pub last_applied: LogIndex,    // Highest index handed to the apply loop
    pub leader_id: Option<NodeId>, // Best known leader for the current term
}

impl ServerState {
    /// Create the state of a fresh node (always a Follower)
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            current_term: 0,
            voted_for: None,
            role: Role::Follower,
            commit_index: 0,
            last_applied: 0,
            leader_id: None,
        }
    }

    /// The part of the state that must survive a restart
    pub fn hard_state(&self) -> HardState {
        HardState {
            current_term: self.current_term,
            voted_for: self.voted_for.clone(),
        }
    }

    /// Promote to candidate: increment term and vote for self
    pub fn become_candidate(&mut self) {
        self.current_term += 1;
        self.voted_for = Some(self.id.clone());
        self.role = Role::Candidate;
        self.leader_id = None;
    }

    /// Promote to leader: used when election is won
    pub fn become_leader(&mut self) {
        self.role = Role::Leader;
        self.leader_id = Some(self.id.clone());
    }

    /// Fall back to follower at `term`; returns true if the term advanced.
    ///
    /// A newer term clears the vote and the known leader.
    pub fn become_follower(&mut self, term: Term, leader_id: Option<NodeId>) -> bool {
        debug_assert!(term >= self.current_term, "term must never go backwards");
        let term_changed = term > self.current_term;
        if term_changed {
            self.current_term = term;
            self.voted_for = None;
            self.leader_id = None;
        }
        self.role = Role::Follower;
        if leader_id.is_some() {
            self.leader_id = leader_id;
        }
        term_changed
    }
}
