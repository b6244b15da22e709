//! Message dispatch and the client command path.

use tally_common::types::{NodeId, RequestId};
use tracing::{debug, warn};

use super::command::Command;
use super::error::RaftError;
use super::log::LogEntry;
use super::message::{CommandRequest, CommandResponse, CommandResult, Message, Payload};
use super::node::{Listener, PendingRequest, RaftNode};
use super::state::Role;

impl RaftNode {
    /// Route one inbound message to its handler.
    ///
    /// Term rules (step down on a newer term, reject a stale one) are applied
    /// by the server-to-server handlers. Client commands are not part of the
    /// term protocol and are routed as-is.
    pub fn invoke(&mut self, message: Message) -> Result<(), RaftError> {
        let Message {
            sender_id,
            term,
            payload,
        } = message;
        match payload {
            Payload::VoteRequest(request) => self.handle_vote_request(sender_id, term, request),
            Payload::VoteResponse(response) => self.handle_vote_response(sender_id, term, response),
            Payload::AppendRequest(request) => self.handle_append_request(sender_id, term, request),
            Payload::AppendResponse(response) => self.handle_append_response(sender_id, term, response),
            Payload::CommandRequest(request) => self.handle_command_request(sender_id, request),
            Payload::CommandResponse(response) => {
                debug!(node = %self.state.id, from = %sender_id, request_id = response.request_id, "ignoring command response");
                Ok(())
            }
        }
    }

    fn handle_command_request(&mut self, sender: NodeId, request: CommandRequest) -> Result<(), RaftError> {
        let CommandRequest {
            command,
            request_id,
        } = request;
        let result = self.submit(command, request_id, None)?;
        if let Some(request_id) = request_id {
            self.send(
                &sender,
                CommandResponse {
                    request_id,
                    entry_index: result.index(),
                },
            );
        }
        Ok(())
    }

    /// Submit a client command.
    ///
    /// On the leader the command is appended to the log (durably) and
    /// replicated; `listener`, if given, later receives the applied index or
    /// the reason the entry will never be applied. Elsewhere the command is
    /// refused immediately and the listener gets the same refusal.
    pub fn submit(
        &mut self,
        command: Command,
        request_id: Option<RequestId>,
        listener: Option<Listener>,
    ) -> Result<CommandResult, RaftError> {
        if self.state.role != Role::Leader {
            let leader_id = self.state.leader_id.clone();
            debug!(node = %self.state.id, leader = ?leader_id, "refusing command: not leader");
            if let Some(listener) = listener {
                let _ = listener.send(Err(RaftError::NotLeader {
                    leader_id: leader_id.clone(),
                }));
            }
            return Ok(CommandResult::NotLeader { leader_id });
        }

        if !self.known_commands.is_empty() && !self.known_commands.contains(command.identifier()) {
            warn!(node = %self.state.id, command = %command.identifier(), "refusing unregistered command");
            if let Some(listener) = listener {
                let _ = listener.send(Err(RaftError::UnknownCommand(command.identifier().to_string())));
            }
            return Ok(CommandResult::Rejected);
        }

        let index = self.log.last_index() + 1;
        let term = self.state.current_term;
        let entry = LogEntry::new(index, term, command);

        // durable before it can be replicated
        self.storage.append_entries(std::slice::from_ref(&entry))?;
        self.log.append([entry])?;
        self.pending
            .insert(index, PendingRequest::new(index, term, request_id, listener));

        debug!(node = %self.state.id, index, term, "appended new command");

        self.broadcast_append_entries();
        // a single-member cluster commits on its own
        self.advance_commit_index()?;
        Ok(CommandResult::Accepted { index })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::message::{AppendEntriesResponse, VoteRequest};
    use crate::raft::testing::{command, test_node, TestCluster};
    use std::collections::BTreeMap;
    use tokio::sync::oneshot;

    fn responses(sent: Vec<(NodeId, Message)>) -> Vec<(NodeId, CommandResponse)> {
        sent.into_iter()
            .filter_map(|(to, m)| match m.payload {
                Payload::CommandResponse(r) => Some((to, r)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_submit_to_follower_without_known_leader() {
        let mut follower = test_node("n2", &["n1", "n3"]);
        let (tx, mut rx) = oneshot::channel();

        let result = follower.node.submit(command("x"), None, Some(tx)).unwrap();
        assert_eq!(result, CommandResult::NotLeader { leader_id: None });
        assert_eq!(rx.try_recv().unwrap(), Err(RaftError::NotLeader { leader_id: None }));
        assert!(follower.node.log().is_empty());
    }

    #[test]
    fn test_submit_to_follower_names_leader() {
        let mut cluster = TestCluster::new(&["n1", "n2", "n3"]);
        cluster.elect("n1");

        let result = cluster.node_mut("n2").submit(command("x"), None, None).unwrap();
        assert_eq!(
            result,
            CommandResult::NotLeader {
                leader_id: Some("n1".into())
            }
        );
    }

    #[test]
    fn test_submit_on_leader_appends_and_replicates() {
        let mut cluster = TestCluster::new(&["n1", "n2", "n3"]);
        cluster.elect("n1");

        let result = cluster.node_mut("n1").submit(command("x"), Some(9), None).unwrap();
        assert_eq!(result, CommandResult::Accepted { index: 1 });
        assert_eq!(cluster.node("n1").pending_requests(), 1);
        assert_eq!(cluster.test_node_mut("n1").storage.snapshot().entries.len(), 1);

        let outbox = cluster.take_outbox("n1");
        assert!(outbox.iter().all(|(_, m)| match &m.payload {
            Payload::AppendRequest(r) => r.entries.len() == 1,
            _ => false,
        }));
    }

    #[test]
    fn test_unregistered_command_is_rejected() {
        let mut n1 = test_node("n1", &["n2", "n3"]);
        n1.node = n1.node.with_known_commands(["kv".to_string()]);
        let mut nodes = BTreeMap::new();
        nodes.insert("n1".to_string(), n1);
        nodes.insert("n2".to_string(), test_node("n2", &["n1", "n3"]));
        nodes.insert("n3".to_string(), test_node("n3", &["n1", "n2"]));
        let mut cluster = TestCluster::from_nodes(nodes);
        cluster.elect("n1");

        let (tx, mut rx) = oneshot::channel();
        let result = cluster.node_mut("n1").submit(command("x"), None, Some(tx)).unwrap();
        assert_eq!(result, CommandResult::Rejected);
        assert_eq!(rx.try_recv().unwrap(), Err(RaftError::UnknownCommand("test".into())));
        assert!(cluster.node("n1").log().is_empty());
    }

    #[test]
    fn test_single_node_commits_on_submit() {
        let mut nodes = BTreeMap::new();
        nodes.insert("solo".to_string(), test_node("solo", &[]));
        let mut cluster = TestCluster::from_nodes(nodes);
        cluster.elect("solo");

        cluster.node_mut("solo").submit(command("x"), None, None).unwrap();
        assert_eq!(cluster.node("solo").commit_index(), 1);
        let applied = cluster.test_node_mut("solo").drain_applied();
        assert_eq!(applied.len(), 1);
        assert!(applied[0].pending.is_some());
    }

    #[test]
    fn test_command_request_gets_response() {
        let mut cluster = TestCluster::new(&["n1", "n2", "n3"]);
        cluster.elect("n1");

        let request = CommandRequest {
            command: command("x"),
            request_id: Some(42),
        };
        cluster.deliver("n1", Message::new("client", 0, request.clone()));
        cluster.deliver("n2", Message::new("client", 0, request));

        let from_leader = responses(cluster.take_outbox("n1"));
        assert_eq!(
            from_leader,
            vec![(
                "client".to_string(),
                CommandResponse {
                    request_id: 42,
                    entry_index: Some(1)
                }
            )]
        );
        let from_follower = responses(cluster.take_outbox("n2"));
        assert_eq!(from_follower[0].1.entry_index, None);
        // client traffic carries no term authority
        assert_eq!(cluster.node("n1").role(), Role::Leader);
    }

    #[test]
    fn test_fire_and_forget_request_has_no_response() {
        let mut cluster = TestCluster::new(&["n1", "n2", "n3"]);
        cluster.elect("n1");

        let request = CommandRequest {
            command: command("x"),
            request_id: None,
        };
        cluster.deliver("n1", Message::new("client", 0, request));
        assert!(responses(cluster.take_outbox("n1")).is_empty());
        assert_eq!(cluster.node("n1").log().len(), 1);
    }

    #[test]
    fn test_step_down_fails_pending_with_leadership_lost() {
        let mut cluster = TestCluster::new(&["n1", "n2", "n3"]);
        cluster.elect("n1");
        cluster.isolate("n2");
        cluster.isolate("n3");

        let mut listeners = Vec::new();
        for value in ["a", "b", "c", "d", "e", "f", "g"] {
            let (tx, rx) = oneshot::channel();
            cluster.node_mut("n1").submit(command(value), None, Some(tx)).unwrap();
            listeners.push(rx);
        }
        cluster.deliver_all();
        assert_eq!(cluster.node("n1").pending_requests(), 7);

        // a newer term shows up
        let vote = VoteRequest {
            candidate_id: "n3".into(),
            last_log_index: 0,
            last_log_term: 0,
        };
        cluster.deliver("n1", Message::new("n3", 5, vote));

        assert_eq!(cluster.node("n1").role(), Role::Follower);
        assert_eq!(cluster.node("n1").pending_requests(), 0);
        let mut last = listeners.pop().unwrap();
        assert_eq!(last.try_recv().unwrap(), Err(RaftError::LeadershipLost { index: 7 }));
        for mut rx in listeners {
            assert!(matches!(rx.try_recv().unwrap(), Err(RaftError::LeadershipLost { .. })));
        }
    }

    #[test]
    fn test_higher_term_append_response_steps_leader_down() {
        let mut cluster = TestCluster::new(&["n1", "n2", "n3"]);
        cluster.elect("n1");
        let (tx, mut rx) = oneshot::channel();
        cluster.node_mut("n1").submit(command("a"), None, Some(tx)).unwrap();

        cluster.deliver("n1", Message::new("n2", 9, AppendEntriesResponse::rejected(None)));
        assert_eq!(cluster.node("n1").current_term(), 9);
        assert_eq!(rx.try_recv().unwrap(), Err(RaftError::LeadershipLost { index: 1 }));
    }

    #[test]
    fn test_committed_pending_request_travels_with_entry() {
        let mut cluster = TestCluster::new(&["n1", "n2", "n3"]);
        cluster.elect("n1");
        let (tx, _rx) = oneshot::channel();
        cluster.node_mut("n1").submit(command("a"), Some(3), Some(tx)).unwrap();
        cluster.deliver_all();

        let applied = cluster.test_node_mut("n1").drain_applied();
        let pending = applied[0].pending.as_ref().unwrap();
        assert_eq!(pending.index, 1);
        assert_eq!(pending.request_id, Some(3));
        assert_eq!(cluster.node("n1").pending_requests(), 0);
    }
}
