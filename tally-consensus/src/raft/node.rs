use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use tally_common::metrics::{MetricsCollector, NoopMetrics};
use tally_common::types::{LogIndex, NodeId, RequestId, Term};
use tokio::sync::oneshot;
use tracing::{debug, info};

use super::apply::ApplySender;
use super::config::RaftConfig;
use super::error::RaftError;
use super::log::RaftLog;
use super::message::{Message, Payload};
use super::replication::PeerProgress;
use super::state::{Role, ServerState};
use super::storage::Storage;
use super::transport::Transport;

pub(crate) const ELECTION_TIMEOUTS: &str = "raft.election_timeouts";
pub(crate) const ELECTIONS_STARTED: &str = "raft.elections_started";
pub(crate) const LEADER_ELECTED: &str = "raft.leader_elected";
pub(crate) const STEP_DOWNS: &str = "raft.step_downs";
pub(crate) const ENTRIES_COMMITTED: &str = "raft.entries_committed";
pub(crate) const COMMIT_INDEX: &str = "raft.commit_index";

/// Receives the final outcome of a submitted command: the applied index, or
/// why it will never be applied.
pub type Listener = oneshot::Sender<Result<LogIndex, RaftError>>;

/// A client command waiting for its log entry to be applied
#[derive(Debug)]
pub struct PendingRequest {
    pub index: LogIndex,
    pub term: Term,
    pub request_id: Option<RequestId>,
    listener: Option<Listener>,
}

impl PendingRequest {
    pub fn new(index: LogIndex, term: Term, request_id: Option<RequestId>, listener: Option<Listener>) -> Self {
        Self {
            index,
            term,
            request_id,
            listener,
        }
    }

    pub fn resolve(self, result: Result<LogIndex, RaftError>) {
        if let Some(listener) = self.listener {
            // the client may have stopped waiting
            let _ = listener.send(result);
        }
    }
}

/// Identifies one arming of the election timer. A timer that fires with a
/// stale epoch is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerEpoch {
    pub term: Term,
    pub generation: u64,
}

/// A Raft node: owns its state and log and participates in consensus.
///
/// Every method takes `&mut self`, so whoever owns the node (the server's
/// event loop) is the single serialization point for timers and messages.
/// Outbound messages go through the [`Transport`] without waiting; committed
/// entries are handed to the apply loop through a channel.
pub struct RaftNode {
    pub(super) state: ServerState,
    pub(super) log: RaftLog,
    pub(super) peers: Vec<NodeId>,
    pub(super) config: RaftConfig,
    pub(super) storage: Box<dyn Storage>,
    pub(super) transport: Arc<dyn Transport>,
    pub(super) metrics: Arc<dyn MetricsCollector>,
    pub(super) apply_tx: ApplySender,
    pub(super) known_commands: HashSet<String>,

    pub(super) votes_received: HashSet<NodeId>,
    pub(super) progress: HashMap<NodeId, PeerProgress>, // Leader only
    pub(super) pending: BTreeMap<LogIndex, PendingRequest>,

    pub(super) election_deadline: Option<Instant>, // None while leading
    pub(super) timer_generation: u64,
}

impl RaftNode {
    /// Create a node, restoring term, vote and log from `storage`
    pub fn new(
        id: NodeId,
        peers: Vec<NodeId>,
        config: RaftConfig,
        storage: Box<dyn Storage>,
        transport: Arc<dyn Transport>,
        apply_tx: ApplySender,
    ) -> Result<Self, RaftError> {
        config.validate()?;
        let persisted = storage.load()?;

        let mut state = ServerState::new(id);
        state.current_term = persisted.hard_state.current_term;
        state.voted_for = persisted.hard_state.voted_for;
        let log = RaftLog::from_entries(persisted.entries)?;
        let peers: Vec<NodeId> = peers.into_iter().filter(|p| *p != state.id).collect();

        let mut node = Self {
            state,
            log,
            peers,
            config,
            storage,
            transport,
            metrics: Arc::new(NoopMetrics),
            apply_tx,
            known_commands: HashSet::new(),
            votes_received: HashSet::new(),
            progress: HashMap::new(),
            pending: BTreeMap::new(),
            election_deadline: None,
            timer_generation: 0,
        };
        node.reset_election_timer();

        info!(
            node = %node.state.id,
            term = node.state.current_term,
            last_index = node.log.last_index(),
            peers = node.peers.len(),
            "raft node initialised"
        );
        Ok(node)
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsCollector>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Restrict accepted commands to these identifiers (default: accept all)
    pub fn with_known_commands(mut self, identifiers: impl IntoIterator<Item = String>) -> Self {
        self.known_commands = identifiers.into_iter().collect();
        self
    }

    pub fn id(&self) -> &NodeId {
        &self.state.id
    }

    pub fn role(&self) -> Role {
        self.state.role
    }

    pub fn current_term(&self) -> Term {
        self.state.current_term
    }

    pub fn voted_for(&self) -> Option<&NodeId> {
        self.state.voted_for.as_ref()
    }

    pub fn leader_id(&self) -> Option<&NodeId> {
        self.state.leader_id.as_ref()
    }

    pub fn commit_index(&self) -> LogIndex {
        self.state.commit_index
    }

    pub fn last_applied(&self) -> LogIndex {
        self.state.last_applied
    }

    pub fn log(&self) -> &RaftLog {
        &self.log
    }

    pub fn peers(&self) -> &[NodeId] {
        &self.peers
    }

    pub fn progress(&self, peer: &str) -> Option<PeerProgress> {
        self.progress.get(peer).copied()
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// When the election timer fires next, or `None` if it is disarmed
    pub fn election_deadline(&self) -> Option<Instant> {
        self.election_deadline
    }

    pub fn election_epoch(&self) -> TimerEpoch {
        TimerEpoch {
            term: self.state.current_term,
            generation: self.timer_generation,
        }
    }

    /// Number of servers (including self) that make a majority
    pub(super) fn quorum(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    /// Re-arm the election timer with a fresh random timeout. Bumps the
    /// generation so any previously armed timer becomes a no-op.
    pub(super) fn reset_election_timer(&mut self) {
        self.election_deadline = Some(Instant::now() + self.config.random_election_timeout());
        self.timer_generation += 1;
    }

    /// Disarm the election timer. Any timer armed so far becomes a no-op.
    pub(super) fn cancel_election_timer(&mut self) {
        self.election_deadline = None;
        self.timer_generation += 1;
    }

    pub(super) fn persist_hard_state(&mut self) -> Result<(), RaftError> {
        let hard_state = self.state.hard_state();
        self.storage.save_hard_state(&hard_state)
    }

    pub(super) fn send(&self, to: &NodeId, payload: impl Into<Payload>) {
        let message = Message::new(self.state.id.clone(), self.state.current_term, payload);
        self.transport.send(to, message);
    }

    pub(super) fn broadcast(&self, payload: impl Into<Payload>) {
        let payload = payload.into();
        for peer in &self.peers {
            self.send(peer, payload.clone());
        }
    }

    /// Become (or stay) a follower at `term`, optionally recording who leads.
    ///
    /// Leaving leadership discards all peer progress and fails every pending
    /// request, so no client is left waiting on an entry this node can no
    /// longer commit.
    pub(super) fn become_follower(&mut self, term: Term, leader_id: Option<NodeId>) -> Result<(), RaftError> {
        let previous_role = self.state.role;
        let term_changed = self.state.become_follower(term, leader_id);
        if term_changed {
            self.persist_hard_state()?;
        }

        self.votes_received.clear();
        if previous_role == Role::Leader {
            self.progress.clear();
            self.fail_pending(|index| RaftError::LeadershipLost { index });
            self.metrics.inc_counter(STEP_DOWNS);
        }
        if previous_role != Role::Follower || term_changed {
            info!(
                node = %self.state.id,
                term = self.state.current_term,
                from = %previous_role,
                leader = ?self.state.leader_id,
                "became follower"
            );
        }
        self.reset_election_timer();
        Ok(())
    }

    pub(super) fn fail_pending(&mut self, error: impl Fn(LogIndex) -> RaftError) {
        for (index, pending) in std::mem::take(&mut self.pending) {
            pending.resolve(Err(error(index)));
        }
    }

    /// Fail pending requests whose entries at or after `index` were removed
    pub(super) fn fail_pending_from(&mut self, index: LogIndex) {
        for (index, pending) in self.pending.split_off(&index) {
            pending.resolve(Err(RaftError::Rejected { index }));
        }
    }

    /// Stop participating: drop leader bookkeeping and fail pending requests.
    pub fn shutdown(&mut self) {
        self.progress.clear();
        self.votes_received.clear();
        let pending = self.pending.len();
        self.fail_pending(|_| RaftError::Shutdown);
        debug!(node = %self.state.id, pending, "raft node shut down");
    }
}
