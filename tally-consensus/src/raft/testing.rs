//! Deterministic harness: nodes wired through a recording transport, with
//! timers fired and messages delivered by hand.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tally_common::types::{LogIndex, NodeId, Term};
use tokio::sync::mpsc;

use super::apply::{ApplyReceiver, ApplyTask};
use super::command::Command;
use super::config::RaftConfig;
use super::log::LogEntry;
use super::message::Message;
use super::node::RaftNode;
use super::state::Role;
use super::storage::{HardState, MemoryStorage, PersistentState};
use super::transport::Transport;

#[derive(Default)]
pub(crate) struct RecordingTransport {
    sent: Mutex<Vec<(NodeId, Message)>>,
}

impl RecordingTransport {
    pub(crate) fn take(&self) -> Vec<(NodeId, Message)> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }
}

impl Transport for RecordingTransport {
    fn send(&self, to: &NodeId, message: Message) {
        self.sent.lock().unwrap().push((to.clone(), message));
    }
}

pub(crate) struct TestNode {
    pub node: RaftNode,
    pub transport: Arc<RecordingTransport>,
    pub storage: MemoryStorage,
    pub applied: ApplyReceiver,
}

impl TestNode {
    /// Everything handed to the apply loop so far
    pub(crate) fn drain_applied(&mut self) -> Vec<ApplyTask> {
        let mut tasks = Vec::new();
        while let Ok(task) = self.applied.try_recv() {
            tasks.push(task);
        }
        tasks
    }
}

pub(crate) fn test_config() -> RaftConfig {
    RaftConfig::default()
        .with_heartbeat_interval(Duration::from_millis(50))
        .with_election_timeout(Duration::from_millis(150), Duration::from_millis(300))
}

pub(crate) fn command(value: &str) -> Command {
    Command::new("test", value.as_bytes().to_vec())
}

pub(crate) fn entry(index: LogIndex, term: Term) -> LogEntry {
    LogEntry::new(index, term, command(&format!("{index}@{term}")))
}

pub(crate) fn test_node(id: &str, peers: &[&str]) -> TestNode {
    test_node_with_log(id, peers, 0, Vec::new())
}

pub(crate) fn test_node_with_log(id: &str, peers: &[&str], term: Term, entries: Vec<LogEntry>) -> TestNode {
    let storage = MemoryStorage::with_state(PersistentState {
        hard_state: HardState {
            current_term: term,
            voted_for: None,
        },
        entries,
    });
    let transport = Arc::new(RecordingTransport::default());
    let (apply_tx, applied) = mpsc::unbounded_channel();
    let node = RaftNode::new(
        id.to_string(),
        peers.iter().map(|p| p.to_string()).collect(),
        test_config(),
        Box::new(storage.clone()),
        transport.clone(),
        apply_tx,
    )
    .unwrap();
    TestNode {
        node,
        transport,
        storage,
        applied,
    }
}

/// A set of nodes exchanging messages only when told to.
pub(crate) struct TestCluster {
    pub nodes: BTreeMap<NodeId, TestNode>,
    isolated: HashSet<NodeId>,
}

impl TestCluster {
    pub(crate) fn new(ids: &[&str]) -> Self {
        let nodes = ids
            .iter()
            .map(|id| {
                let peers: Vec<&str> = ids.iter().copied().filter(|p| p != id).collect();
                (id.to_string(), test_node(id, &peers))
            })
            .collect();
        Self::from_nodes(nodes)
    }

    pub(crate) fn from_nodes(nodes: BTreeMap<NodeId, TestNode>) -> Self {
        Self {
            nodes,
            isolated: HashSet::new(),
        }
    }

    pub(crate) fn node(&self, id: &str) -> &RaftNode {
        &self.nodes[id].node
    }

    pub(crate) fn node_mut(&mut self, id: &str) -> &mut RaftNode {
        &mut self.nodes.get_mut(id).unwrap().node
    }

    pub(crate) fn test_node_mut(&mut self, id: &str) -> &mut TestNode {
        self.nodes.get_mut(id).unwrap()
    }

    pub(crate) fn fire_election_timeout(&mut self, id: &str) {
        let node = self.node_mut(id);
        let epoch = node.election_epoch();
        node.handle_election_timeout(epoch).unwrap();
    }

    pub(crate) fn heartbeat(&mut self, id: &str) {
        self.node_mut(id).handle_heartbeat_tick();
    }

    pub(crate) fn isolate(&mut self, id: &str) {
        self.isolated.insert(id.to_string());
    }

    pub(crate) fn heal(&mut self, id: &str) {
        self.isolated.remove(id);
    }

    /// Messages sent so far by `id`, removed from its outbox
    pub(crate) fn take_outbox(&mut self, id: &str) -> Vec<(NodeId, Message)> {
        self.nodes[id].transport.take()
    }

    /// Deliver one message by hand
    pub(crate) fn deliver(&mut self, to: &str, message: Message) {
        self.node_mut(to).invoke(message).unwrap();
    }

    /// Deliver messages until every outbox is empty
    pub(crate) fn deliver_all(&mut self) {
        loop {
            let mut batch = Vec::new();
            for test_node in self.nodes.values() {
                batch.extend(test_node.transport.take());
            }
            if batch.is_empty() {
                return;
            }
            for (to, message) in batch {
                if self.isolated.contains(&to) || self.isolated.contains(&message.sender_id) {
                    continue;
                }
                if let Some(target) = self.nodes.get_mut(&to) {
                    target.node.invoke(message).unwrap();
                }
            }
        }
    }

    pub(crate) fn leaders(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|(_, n)| n.node.role() == Role::Leader)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Elect `id` by firing its timer and delivering the resulting traffic
    pub(crate) fn elect(&mut self, id: &str) {
        self.fire_election_timeout(id);
        self.deliver_all();
        assert_eq!(self.node(id).role(), Role::Leader, "{id} failed to win the election");
    }
}
