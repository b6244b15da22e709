//! Raft consensus core for a single, fixed-membership group.
//!
//! The [`raft::node::RaftNode`] holds all consensus state and is driven
//! synchronously by timers and inbound messages; [`raft::server::RaftServer`]
//! wraps it in a tokio event loop with a separate apply task.

pub mod raft;

pub use raft::command::{Command, TypedCommand};
pub use raft::config::RaftConfig;
pub use raft::encoding::{BincodeEncoder, EncodedObject, Encoder, MessageRegistry};
pub use raft::error::RaftError;
pub use raft::message::{CommandResult, Message, MessageKind, Payload};
pub use raft::server::{AppliedReceiver, RaftMetrics, RaftServer, RaftServerBuilder, ServerHandle};
pub use raft::state::Role;
pub use raft::state_machine::{KeyValueStore, KvCommand, StateMachine, StateMachineRegistry};
pub use raft::storage::{FileStorage, MemoryStorage, Storage};
pub use raft::transport::{LocalNetwork, Transport};
