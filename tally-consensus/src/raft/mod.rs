// Log, server state and messages first; the node is split by concern below.
pub mod apply;
pub mod command;
pub mod commit;
pub mod config;
pub mod dispatch;
pub mod election;
pub mod encoding;
pub mod error;
pub mod log;
pub mod message;
pub mod node;
pub mod replication;
pub mod server;
pub mod state;
pub mod state_machine;
pub mod storage;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;
