use serde::{Deserialize, Serialize};
use std::fmt;
use tally_common::types::{LogIndex, NodeId, RequestId, Term};

use super::command::Command;
use super::log::LogEntry;

/// Every message between servers (and from clients) carries the sender and
/// its current term; the payload carries only its own fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub sender_id: NodeId,
    pub term: Term,
    pub payload: Payload,
}

impl Message {
    pub fn new(sender_id: impl Into<NodeId>, term: Term, payload: impl Into<Payload>) -> Self {
        Self {
            sender_id: sender_id.into(),
            term,
            payload: payload.into(),
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    VoteRequest(VoteRequest),
    VoteResponse(VoteResponse),
    AppendRequest(AppendEntriesRequest),
    AppendResponse(AppendEntriesResponse),
    CommandRequest(CommandRequest),
    CommandResponse(CommandResponse),
}

impl Payload {
    pub fn kind(&self) -> MessageKind {
        match self {
            Payload::VoteRequest(_) => MessageKind::VoteRequest,
            Payload::VoteResponse(_) => MessageKind::VoteResponse,
            Payload::AppendRequest(_) => MessageKind::AppendRequest,
            Payload::AppendResponse(_) => MessageKind::AppendResponse,
            Payload::CommandRequest(_) => MessageKind::CommandRequest,
            Payload::CommandResponse(_) => MessageKind::CommandResponse,
        }
    }
}

/// Stable, transport-neutral identifiers for each payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    VoteRequest,
    VoteResponse,
    AppendRequest,
    AppendResponse,
    CommandRequest,
    CommandResponse,
}

impl MessageKind {
    pub const ALL: [MessageKind; 6] = [
        MessageKind::VoteRequest,
        MessageKind::VoteResponse,
        MessageKind::AppendRequest,
        MessageKind::AppendResponse,
        MessageKind::CommandRequest,
        MessageKind::CommandResponse,
    ];

    pub fn identifier(&self) -> &'static str {
        match self {
            MessageKind::VoteRequest => "VoteRequest",
            MessageKind::VoteResponse => "VoteResponse",
            MessageKind::AppendRequest => "AppendRequest",
            MessageKind::AppendResponse => "AppendResponse",
            MessageKind::CommandRequest => "CommandRequest",
            MessageKind::CommandResponse => "CommandResponse",
        }
    }

    pub fn from_identifier(identifier: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.identifier() == identifier)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.identifier())
    }
}

/// RequestVote RPC: Candidate → Peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    pub candidate_id: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

/// Response to RequestVote
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteResponse {
    pub vote_granted: bool,
}

/// Sent by leader to replicate log entries or as heartbeat
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub prev_log_index: LogIndex, // Index of log entry before new ones
    pub prev_log_term: Term,      // Term of that entry
    pub entries: Vec<LogEntry>,   // New log entries to store (empty = heartbeat)
    pub leader_commit: LogIndex,  // Leader's commit index
}

/// Where a follower's log diverges, so the leader can skip a whole term
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictHint {
    pub conflict_term: Option<Term>, // None when the follower's log is too short
    pub conflict_index: LogIndex,
}

/// Response from follower to AppendEntries RPC
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub success: bool,                    // True if follower appended entries
    pub match_index: LogIndex,            // Last index known to match on success
    pub conflict: Option<ConflictHint>,   // Rollback hint on mismatch
}

impl AppendEntriesResponse {
    pub fn accepted(match_index: LogIndex) -> Self {
        Self {
            success: true,
            match_index,
            conflict: None,
        }
    }

    pub fn rejected(conflict: Option<ConflictHint>) -> Self {
        Self {
            success: false,
            match_index: 0,
            conflict,
        }
    }
}

/// A client command addressed to (what the client thinks is) the leader
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub command: Command,
    pub request_id: Option<RequestId>, // None means no response is wanted
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub request_id: RequestId,
    pub entry_index: Option<LogIndex>, // Present iff the command was accepted
}

/// Immediate outcome of submitting a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandResult {
    Accepted { index: LogIndex },
    Rejected,
    NotLeader { leader_id: Option<NodeId> },
}

impl CommandResult {
    pub fn index(&self) -> Option<LogIndex> {
        match self {
            CommandResult::Accepted { index } => Some(*index),
            _ => None,
        }
    }
}

macro_rules! impl_into_payload {
    ($($ty:ident => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Payload {
                fn from(body: $ty) -> Self {
                    Payload::$variant(body)
                }
            }
        )*
    };
}

impl_into_payload! {
    VoteRequest => VoteRequest,
    VoteResponse => VoteResponse,
    AppendEntriesRequest => AppendRequest,
    AppendEntriesResponse => AppendResponse,
    CommandRequest => CommandRequest,
    CommandResponse => CommandResponse,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_identifiers_are_stable() {
        for kind in MessageKind::ALL {
            assert_eq!(MessageKind::from_identifier(kind.identifier()), Some(kind));
        }
        assert_eq!(MessageKind::from_identifier("InstallSnapshot"), None);
    }

    #[test]
    fn test_message_wraps_payload() {
        let message = Message::new("n1", 3, VoteResponse { vote_granted: true });
        assert_eq!(message.kind(), MessageKind::VoteResponse);
        assert_eq!(message.sender_id, "n1");
        assert_eq!(message.term, 3);
    }

    #[test]
    fn test_command_result_index() {
        assert_eq!(CommandResult::Accepted { index: 4 }.index(), Some(4));
        assert_eq!(CommandResult::Rejected.index(), None);
        assert_eq!(CommandResult::NotLeader { leader_id: None }.index(), None);
    }
}
