use tally_common::error::TallyError;
use tally_common::types::{LogIndex, NodeId};
use thiserror::Error;

use super::log::LogError;

/// Errors that cross the consensus core boundary.
///
/// Stale terms and log mismatches are normal consensus events and are handled
/// by step-down or `next_index` rollback; they never show up here.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RaftError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("unknown message kind `{0}`")]
    UnknownMessageKind(String),

    #[error("no state machine registered for command `{0}`")]
    UnknownCommand(String),

    #[error("not the leader (known leader: {leader_id:?})")]
    NotLeader { leader_id: Option<NodeId> },

    #[error("leadership lost before entry {index} was committed")]
    LeadershipLost { index: LogIndex },

    #[error("entry {index} was replaced by a newer leader")]
    Rejected { index: LogIndex },

    #[error("log error: {0}")]
    Log(#[from] LogError),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("server is shut down")]
    Shutdown,
}

impl From<bincode::Error> for RaftError {
    fn from(err: bincode::Error) -> Self {
        RaftError::Codec(err.to_string())
    }
}

impl From<std::io::Error> for RaftError {
    fn from(err: std::io::Error) -> Self {
        RaftError::Storage(err.to_string())
    }
}

impl From<RaftError> for TallyError {
    fn from(err: RaftError) -> Self {
        match err {
            RaftError::Configuration(msg) => TallyError::Config(msg),
            RaftError::Codec(msg) => TallyError::Codec(msg),
            other => TallyError::Consensus(other.to_string()),
        }
    }
}
