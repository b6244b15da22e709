//! Election coordinator: timer-driven candidacy, vote granting and counting.

use tally_common::types::{LogIndex, NodeId, Term};
use tracing::{debug, info, trace};

use super::error::RaftError;
use super::message::{VoteRequest, VoteResponse};
use super::node::{RaftNode, TimerEpoch, ELECTIONS_STARTED, ELECTION_TIMEOUTS, LEADER_ELECTED};
use super::replication::PeerProgress;
use super::state::Role;

impl RaftNode {
    /// Called when the election timer armed at `epoch` fires.
    ///
    /// A timer armed before the latest reset (heartbeat, granted vote, role
    /// change) carries a stale epoch and does nothing; so does any timer on a
    /// leader.
    pub fn handle_election_timeout(&mut self, epoch: TimerEpoch) -> Result<(), RaftError> {
        self.metrics.inc_counter(ELECTION_TIMEOUTS);
        if epoch != self.election_epoch() {
            trace!(node = %self.state.id, ?epoch, "ignoring stale election timer");
            return Ok(());
        }
        if self.state.role == Role::Leader {
            return Ok(());
        }
        self.start_election()
    }

    /// Starts an election: Follower/Candidate → Candidate with a new term
    fn start_election(&mut self) -> Result<(), RaftError> {
        self.state.become_candidate();
        self.persist_hard_state()?;
        self.votes_received.clear();
        self.votes_received.insert(self.state.id.clone());
        self.reset_election_timer();
        self.metrics.inc_counter(ELECTIONS_STARTED);

        info!(
            node = %self.state.id,
            term = self.state.current_term,
            last_index = self.log.last_index(),
            "starting election"
        );

        // a single-member cluster wins on its own vote
        if self.votes_received.len() >= self.quorum() {
            self.become_leader();
            return Ok(());
        }

        self.broadcast(VoteRequest {
            candidate_id: self.state.id.clone(),
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        });
        Ok(())
    }

    /// True if a log ending at (`last_index`, `last_term`) is at least as up
    /// to date as ours
    pub(super) fn is_log_up_to_date(&self, last_index: LogIndex, last_term: Term) -> bool {
        let our_term = self.log.last_term();
        last_term > our_term || (last_term == our_term && last_index >= self.log.last_index())
    }

    pub(super) fn handle_vote_request(
        &mut self,
        sender: NodeId,
        term: Term,
        request: VoteRequest,
    ) -> Result<(), RaftError> {
        // 1. Reject if term is older
        if term < self.state.current_term {
            debug!(node = %self.state.id, candidate = %request.candidate_id, term, "rejecting vote for stale term");
            self.send(&sender, VoteResponse { vote_granted: false });
            return Ok(());
        }

        // 2. Adopt a newer term (clears our vote) before deciding
        if term > self.state.current_term {
            self.become_follower(term, None)?;
        }

        // 3. One vote per term, and only for a log at least as up to date as ours
        let can_vote = match &self.state.voted_for {
            None => true,
            Some(voted_for) => *voted_for == request.candidate_id,
        };
        let vote_granted =
            can_vote && self.is_log_up_to_date(request.last_log_index, request.last_log_term);

        if vote_granted {
            self.state.voted_for = Some(request.candidate_id.clone());
            // the vote must be durable before the candidate can count it
            self.persist_hard_state()?;
            self.reset_election_timer();
        }

        debug!(
            node = %self.state.id,
            candidate = %request.candidate_id,
            term = self.state.current_term,
            vote_granted,
            "handled vote request"
        );
        self.send(&sender, VoteResponse { vote_granted });
        Ok(())
    }

    /// Handles a vote response
    pub(super) fn handle_vote_response(
        &mut self,
        sender: NodeId,
        term: Term,
        response: VoteResponse,
    ) -> Result<(), RaftError> {
        if term > self.state.current_term {
            return self.become_follower(term, None);
        }

        if self.state.role != Role::Candidate || term < self.state.current_term {
            trace!(node = %self.state.id, from = %sender, term, "ignoring stale vote response");
            return Ok(());
        }

        if response.vote_granted {
            self.votes_received.insert(sender);
            if self.votes_received.len() >= self.quorum() {
                self.become_leader();
            }
        }
        Ok(())
    }

    /// Transition to leader role: fresh progress for every peer, then an
    /// immediate round of heartbeats to assert leadership. A leader runs no
    /// election timer until it steps down.
    fn become_leader(&mut self) {
        self.state.become_leader();
        self.votes_received.clear();
        self.cancel_election_timer();

        let next_index = self.log.last_index() + 1;
        self.progress = self
            .peers
            .iter()
            .map(|peer| (peer.clone(), PeerProgress::new(next_index)))
            .collect();

        self.metrics.inc_counter(LEADER_ELECTED);
        info!(node = %self.state.id, term = self.state.current_term, "became leader");

        self.broadcast_append_entries();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::message::{Message, Payload};
    use crate::raft::testing::{entry, test_node, test_node_with_log, TestCluster};
    use std::collections::BTreeMap;

    fn vote_request(candidate: &str, term: Term, last_log_index: LogIndex, last_log_term: Term) -> Message {
        Message::new(
            candidate,
            term,
            VoteRequest {
                candidate_id: candidate.into(),
                last_log_index,
                last_log_term,
            },
        )
    }

    fn granted(sent: &[(NodeId, Message)]) -> Vec<bool> {
        sent.iter()
            .filter_map(|(_, m)| match &m.payload {
                Payload::VoteResponse(r) => Some(r.vote_granted),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_three_nodes_elect_exactly_one_leader() {
        let mut cluster = TestCluster::new(&["n1", "n2", "n3"]);
        cluster.fire_election_timeout("n1");
        cluster.deliver_all();

        assert_eq!(cluster.leaders(), vec!["n1".to_string()]);
        for id in ["n2", "n3"] {
            let node = cluster.node(id);
            assert_eq!(node.role(), Role::Follower);
            assert_eq!(node.current_term(), 1);
            assert_eq!(node.leader_id(), Some(&"n1".to_string()));
        }
        assert_eq!(cluster.node("n1").current_term(), 1);
        assert_eq!(cluster.node("n1").progress("n2").unwrap().next_index, 1);
    }

    #[test]
    fn test_competing_candidates_yield_one_leader_per_term() {
        let mut cluster = TestCluster::new(&["n1", "n2", "n3"]);
        cluster.fire_election_timeout("n1");
        cluster.fire_election_timeout("n2");
        cluster.deliver_all();

        let leaders = cluster.leaders();
        assert_eq!(leaders.len(), 1);
        let term = cluster.node(&leaders[0]).current_term();
        assert_eq!(term, 1);
    }

    #[test]
    fn test_split_vote_restarts_with_new_term() {
        let mut cluster = TestCluster::new(&["n1", "n2", "n3"]);
        cluster.isolate("n3");
        cluster.fire_election_timeout("n1");
        cluster.fire_election_timeout("n2");
        cluster.deliver_all();

        // each voted for itself and refused the other
        assert!(cluster.leaders().is_empty());
        assert_eq!(cluster.node("n1").role(), Role::Candidate);

        cluster.heal("n3");
        cluster.fire_election_timeout("n1");
        assert_eq!(cluster.node("n1").current_term(), 2);
        cluster.deliver_all();

        assert_eq!(cluster.leaders(), vec!["n1".to_string()]);
        assert_eq!(cluster.node("n2").current_term(), 2);
    }

    #[test]
    fn test_vote_granted_to_more_up_to_date_candidate() {
        let log: Vec<_> = (1..=8).map(|i| entry(i, 4)).collect();
        let mut follower = test_node_with_log("f", &["c"], 4, log);

        follower.node.invoke(vote_request("c", 5, 10, 4)).unwrap();

        assert_eq!(granted(&follower.transport.take()), vec![true]);
        assert_eq!(follower.node.voted_for(), Some(&"c".to_string()));
        assert_eq!(follower.node.current_term(), 5);
        // durable before the reply went out
        let persisted = follower.storage.snapshot().hard_state;
        assert_eq!(persisted.current_term, 5);
        assert_eq!(persisted.voted_for, Some("c".to_string()));
    }

    #[test]
    fn test_vote_denied_to_shorter_log_with_same_term() {
        let log: Vec<_> = (1..=12).map(|i| entry(i, 4)).collect();
        let mut follower = test_node_with_log("f", &["c"], 4, log);

        follower.node.invoke(vote_request("c", 5, 10, 4)).unwrap();

        assert_eq!(granted(&follower.transport.take()), vec![false]);
        assert_eq!(follower.node.voted_for(), None);
        // the newer term is still adopted
        assert_eq!(follower.node.current_term(), 5);
    }

    #[test]
    fn test_vote_denied_for_stale_term() {
        let mut follower = test_node_with_log("f", &["c"], 3, Vec::new());
        follower.node.invoke(vote_request("c", 2, 0, 0)).unwrap();

        let sent = follower.transport.take();
        assert_eq!(granted(&sent), vec![false]);
        assert_eq!(sent[0].1.term, 3);
    }

    #[test]
    fn test_only_one_vote_per_term() {
        let mut follower = test_node("f", &["a", "b"]);
        follower.node.invoke(vote_request("a", 1, 0, 0)).unwrap();
        follower.node.invoke(vote_request("b", 1, 0, 0)).unwrap();
        // a repeated request from the same candidate is granted again
        follower.node.invoke(vote_request("a", 1, 0, 0)).unwrap();

        assert_eq!(granted(&follower.transport.take()), vec![true, false, true]);
    }

    #[test]
    fn test_stale_timer_is_a_no_op() {
        let mut cluster = TestCluster::new(&["n1", "n2", "n3"]);
        let armed = cluster.node("n2").election_epoch();

        cluster.elect("n1");
        cluster.heartbeat("n1");
        cluster.deliver_all();

        // the heartbeat reset n2's timer, so the old arming must not fire
        cluster.node_mut("n2").handle_election_timeout(armed).unwrap();
        assert_eq!(cluster.node("n2").role(), Role::Follower);
        assert_eq!(cluster.node("n2").current_term(), 1);
        assert!(cluster.take_outbox("n2").is_empty());
    }

    #[test]
    fn test_leader_ignores_election_timer() {
        let mut cluster = TestCluster::new(&["n1", "n2", "n3"]);
        cluster.elect("n1");

        cluster.fire_election_timeout("n1");
        assert_eq!(cluster.node("n1").role(), Role::Leader);
        assert_eq!(cluster.node("n1").current_term(), 1);
    }

    #[test]
    fn test_becoming_leader_disarms_election_timer() {
        let mut cluster = TestCluster::new(&["n1", "n2", "n3"]);
        cluster.fire_election_timeout("n1");
        let candidacy = cluster.node("n1").election_epoch();
        assert!(cluster.node("n1").election_deadline().is_some());
        cluster.deliver_all();

        let leader = cluster.node("n1");
        assert_eq!(leader.role(), Role::Leader);
        assert_eq!(leader.election_deadline(), None);
        assert_ne!(leader.election_epoch(), candidacy);

        // the timer armed during candidacy cannot fire once leading
        cluster.node_mut("n1").handle_election_timeout(candidacy).unwrap();
        assert_eq!(cluster.node("n1").role(), Role::Leader);
        assert_eq!(cluster.node("n1").current_term(), 1);
    }

    #[test]
    fn test_step_down_rearms_election_timer() {
        let mut cluster = TestCluster::new(&["n1", "n2", "n3"]);
        cluster.elect("n1");
        assert_eq!(cluster.node("n1").election_deadline(), None);

        cluster.deliver("n1", vote_request("n3", 7, 0, 0));
        assert_eq!(cluster.node("n1").role(), Role::Follower);
        assert!(cluster.node("n1").election_deadline().is_some());
    }

    #[test]
    fn test_higher_term_vote_request_demotes_leader() {
        let mut cluster = TestCluster::new(&["n1", "n2", "n3"]);
        cluster.elect("n1");

        cluster.deliver("n1", vote_request("n3", 7, 0, 0));
        let leader = cluster.node("n1");
        assert_eq!(leader.role(), Role::Follower);
        assert_eq!(leader.current_term(), 7);
        assert!(leader.progress("n2").is_none());
    }

    #[test]
    fn test_candidate_steps_down_on_higher_term_response() {
        let mut cluster = TestCluster::new(&["n1", "n2", "n3"]);
        cluster.fire_election_timeout("n1");
        cluster.take_outbox("n1");

        cluster.deliver("n1", Message::new("n2", 4, VoteResponse { vote_granted: false }));
        assert_eq!(cluster.node("n1").role(), Role::Follower);
        assert_eq!(cluster.node("n1").current_term(), 4);
    }

    #[test]
    fn test_single_node_elects_itself() {
        let mut nodes = BTreeMap::new();
        nodes.insert("solo".to_string(), test_node("solo", &[]));
        let mut cluster = TestCluster::from_nodes(nodes);

        cluster.fire_election_timeout("solo");
        assert_eq!(cluster.leaders(), vec!["solo".to_string()]);
        assert!(cluster.take_outbox("solo").is_empty());
    }
}
