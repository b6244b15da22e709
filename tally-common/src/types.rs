pub type NodeId = String;
pub type Term = u64;
pub type LogIndex = u64;
pub type RequestId = u64;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
    pub node_id: NodeId,
}

/// Static membership and timing for one raft group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub nodes: Vec<NodeAddress>,
    #[serde(default = "default_election_timeout_min_ms")]
    pub election_timeout_min_ms: u64,
    #[serde(default = "default_election_timeout_max_ms")]
    pub election_timeout_max_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_max_append_entries")]
    pub max_append_entries: usize,
    /// Directory for durable raft state; in-memory storage when absent
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_election_timeout_min_ms() -> u64 {
    150
}

fn default_election_timeout_max_ms() -> u64 {
    300
}

fn default_heartbeat_interval_ms() -> u64 {
    50
}

fn default_max_append_entries() -> usize {
    64
}

fn default_log_level() -> String {
    "info".to_string()
}

impl ClusterConfig {
    /// Every member id, in configuration order
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|n| n.node_id.clone()).collect()
    }

    /// Every member id except `id`
    pub fn peers_of(&self, id: &str) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| n.node_id != id)
            .map(|n| n.node_id.clone())
            .collect()
    }
}
