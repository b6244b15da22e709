//! Tokio runtime around a [`RaftNode`].
//!
//! One event-loop task owns the node and serializes everything that touches
//! it: inbound messages, client requests, the heartbeat ticker and the
//! election deadline. Committed entries are applied on a separate blocking
//! task. Callers talk to the loop through a cloneable [`ServerHandle`].

use std::sync::Arc;

use tally_common::metrics::{MetricsCollector, NoopMetrics};
use tally_common::types::{LogIndex, NodeId, Term};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::apply::{ApplyLoop, ApplyReceiver};
use super::command::Command;
use super::config::RaftConfig;
use super::encoding::{BincodeEncoder, EncodedObject, Encoder};
use super::error::RaftError;
use super::message::{CommandResult, Message};
use super::node::{Listener, RaftNode};
use super::state::Role;
use super::state_machine::StateMachineRegistry;
use super::storage::{MemoryStorage, Storage};
use super::transport::Transport;

/// Point-in-time view of a server, published after every event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaftMetrics {
    pub id: NodeId,
    pub term: Term,
    pub role: Role,
    pub leader: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
}

impl RaftMetrics {
    fn observe(node: &RaftNode, last_applied: LogIndex) -> Self {
        Self {
            id: node.id().clone(),
            term: node.current_term(),
            role: node.role(),
            leader: node.leader_id().cloned(),
            commit_index: node.commit_index(),
            last_applied,
        }
    }
}

type SubmitReply = oneshot::Sender<Result<CommandResult, RaftError>>;
pub type AppliedReceiver = oneshot::Receiver<Result<LogIndex, RaftError>>;

enum Request {
    Invoke(Message),
    Submit {
        command: Command,
        listener: Option<Listener>,
        reply: SubmitReply,
    },
    Shutdown,
}

pub struct RaftServerBuilder {
    id: NodeId,
    peers: Vec<NodeId>,
    registry: StateMachineRegistry,
    config: RaftConfig,
    storage: Option<Box<dyn Storage>>,
    encoder: Option<Arc<dyn Encoder>>,
    metrics: Arc<dyn MetricsCollector>,
}

impl RaftServerBuilder {
    pub fn config(mut self, config: RaftConfig) -> Self {
        self.config = config;
        self
    }

    /// Durable backend (default: in-memory)
    pub fn storage(mut self, storage: Box<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Decoder for inbound traffic (default: [`BincodeEncoder`] for all kinds)
    pub fn encoder(mut self, encoder: Arc<dyn Encoder>) -> Self {
        self.encoder = Some(encoder);
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsCollector>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Assemble the server. `transport` carries outbound messages; `inbound`
    /// yields the encoded messages addressed to this server.
    pub fn build(
        self,
        transport: Arc<dyn Transport>,
        inbound: mpsc::UnboundedReceiver<EncodedObject>,
    ) -> Result<RaftServer, RaftError> {
        let storage = self
            .storage
            .unwrap_or_else(|| Box::new(MemoryStorage::new()));
        let encoder = self
            .encoder
            .unwrap_or_else(|| Arc::new(BincodeEncoder::default()));
        let known_commands: Vec<String> = self.registry.identifiers().map(String::from).collect();

        let (apply_tx, apply_rx) = mpsc::unbounded_channel();
        let node = RaftNode::new(
            self.id.clone(),
            self.peers,
            self.config.clone(),
            storage,
            transport,
            apply_tx,
        )?
        .with_metrics(self.metrics.clone())
        .with_known_commands(known_commands);

        let (apply_loop, applied_rx) = ApplyLoop::new(self.id, self.registry);
        let apply_loop = apply_loop.with_metrics(self.metrics);

        Ok(RaftServer {
            node,
            config: self.config,
            encoder,
            inbound,
            apply_loop,
            apply_rx,
            applied_rx,
        })
    }
}

/// A configured server that has not started yet
pub struct RaftServer {
    node: RaftNode,
    config: RaftConfig,
    encoder: Arc<dyn Encoder>,
    inbound: mpsc::UnboundedReceiver<EncodedObject>,
    apply_loop: ApplyLoop,
    apply_rx: ApplyReceiver,
    applied_rx: watch::Receiver<LogIndex>,
}

impl RaftServer {
    pub fn builder(id: impl Into<NodeId>, peers: Vec<NodeId>, registry: StateMachineRegistry) -> RaftServerBuilder {
        RaftServerBuilder {
            id: id.into(),
            peers,
            registry,
            config: RaftConfig::default(),
            storage: None,
            encoder: None,
            metrics: Arc::new(NoopMetrics),
        }
    }

    /// Spawn the apply task and the event loop. Must be called from within a
    /// tokio runtime.
    pub fn start(self) -> ServerHandle {
        let RaftServer {
            node,
            config,
            encoder,
            inbound,
            apply_loop,
            apply_rx,
            applied_rx,
        } = self;

        let id = node.id().clone();
        let apply_task = tokio::task::spawn_blocking(move || apply_loop.run(apply_rx));

        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (metrics_tx, metrics_rx) = watch::channel(RaftMetrics::observe(&node, *applied_rx.borrow()));

        let event_loop = EventLoop {
            node,
            config,
            encoder: encoder.clone(),
            inbound,
            requests: requests_rx,
            applied: applied_rx.clone(),
            metrics: metrics_tx,
        };
        tokio::spawn(event_loop.run(apply_task));
        info!(node = %id, "raft server started");

        ServerHandle {
            id,
            requests: requests_tx,
            metrics: metrics_rx,
            applied: applied_rx,
            encoder,
        }
    }
}

struct EventLoop {
    node: RaftNode,
    config: RaftConfig,
    encoder: Arc<dyn Encoder>,
    inbound: mpsc::UnboundedReceiver<EncodedObject>,
    requests: mpsc::UnboundedReceiver<Request>,
    applied: watch::Receiver<LogIndex>,
    metrics: watch::Sender<RaftMetrics>,
}

impl EventLoop {
    /// Main server loop
    async fn run(mut self, apply_task: JoinHandle<Result<(), RaftError>>) {
        let mut heartbeat = interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            // the deadline moves whenever the node resets its timer
            let epoch = self.node.election_epoch();
            let deadline = self.node.election_deadline().map(Instant::from_std);

            let result = tokio::select! {
                request = self.requests.recv() => match request {
                    Some(Request::Invoke(message)) => self.node.invoke(message),
                    Some(Request::Submit { command, listener, reply }) => {
                        let result = self.node.submit(command, None, listener);
                        let _ = reply.send(result.clone());
                        result.map(|_| ())
                    }
                    // every handle dropped counts as a shutdown request
                    Some(Request::Shutdown) | None => break,
                },
                Some(encoded) = self.inbound.recv() => match self.encoder.decode(&encoded) {
                    Ok(message) => self.node.invoke(message),
                    Err(err) => {
                        warn!(node = %self.node.id(), identifier = %encoded.identifier(), error = %err, "dropping undecodable message");
                        Ok(())
                    }
                },
                _ = heartbeat.tick() => {
                    self.node.handle_heartbeat_tick();
                    Ok(())
                }
                _ = election_timer(deadline) => self.node.handle_election_timeout(epoch),
                changed = self.applied.changed() => match changed {
                    Ok(()) => Ok(()),
                    // the apply loop only exits on its own after a failed entry
                    Err(_) => {
                        error!(node = %self.node.id(), "apply loop stopped, raft server stopping");
                        break;
                    }
                },
            };

            if let Err(err) = result {
                error!(node = %self.node.id(), error = %err, "raft server stopping on fatal error");
                break;
            }
            self.publish_metrics();
        }

        self.node.shutdown();
        self.publish_metrics();
        let id = self.node.id().clone();
        // closes the apply channel; the apply loop drains what it has and exits
        drop(self.node);
        match apply_task.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!(node = %id, error = %err, "apply loop failed"),
            Err(err) => error!(node = %id, error = %err, "apply task panicked"),
        }
        info!(node = %id, "raft server stopped");
    }

    fn publish_metrics(&self) {
        let current = RaftMetrics::observe(&self.node, *self.applied.borrow());
        self.metrics.send_if_modified(|metrics| {
            if *metrics == current {
                return false;
            }
            *metrics = current;
            true
        });
    }
}

/// Completes at `deadline`, or never while the timer is disarmed
async fn election_timer(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Cloneable handle to a running server
#[derive(Clone)]
pub struct ServerHandle {
    id: NodeId,
    requests: mpsc::UnboundedSender<Request>,
    metrics: watch::Receiver<RaftMetrics>,
    applied: watch::Receiver<LogIndex>,
    encoder: Arc<dyn Encoder>,
}

impl ServerHandle {
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// Best known leader
    pub fn leader(&self) -> Option<NodeId> {
        self.metrics.borrow().leader.clone()
    }

    pub fn encoder(&self) -> Arc<dyn Encoder> {
        self.encoder.clone()
    }

    pub fn metrics(&self) -> watch::Receiver<RaftMetrics> {
        self.metrics.clone()
    }

    /// Hand a decoded message to the event loop
    pub fn invoke(&self, message: Message) -> Result<(), RaftError> {
        self.requests
            .send(Request::Invoke(message))
            .map_err(|_| RaftError::Shutdown)
    }

    /// Decode and hand over a message received in encoded form
    pub fn invoke_encoded(&self, encoded: &EncodedObject) -> Result<(), RaftError> {
        let message = self.encoder.decode(encoded)?;
        self.invoke(message)
    }

    /// Submit a command and return the immediate outcome
    pub async fn submit(&self, command: Command) -> Result<CommandResult, RaftError> {
        self.send_submit(command, None).await
    }

    /// Submit a command; the receiver resolves once the entry is applied, or
    /// with the reason it never will be.
    pub async fn submit_with_listener(&self, command: Command) -> Result<(CommandResult, AppliedReceiver), RaftError> {
        let (listener, applied) = oneshot::channel();
        let result = self.send_submit(command, Some(listener)).await?;
        Ok((result, applied))
    }

    /// Submit a command and wait until it has been applied on this server
    pub async fn submit_and_wait(&self, command: Command) -> Result<LogIndex, RaftError> {
        let (result, applied) = self.submit_with_listener(command).await?;
        debug!(node = %self.id, ?result, "waiting for command to apply");
        applied.await.map_err(|_| RaftError::Shutdown)?
    }

    /// Wait until this server has applied at least `index`
    pub async fn wait_for_applied(&self, index: LogIndex) -> Result<(), RaftError> {
        let mut applied = self.applied.clone();
        while *applied.borrow_and_update() < index {
            applied.changed().await.map_err(|_| RaftError::Shutdown)?;
        }
        Ok(())
    }

    /// Stop the server and wait for the event loop to finish. Pending
    /// requests fail with [`RaftError::Shutdown`].
    pub async fn shutdown(&self) {
        let _ = self.requests.send(Request::Shutdown);
        self.requests.closed().await;
    }

    async fn send_submit(
        &self,
        command: Command,
        listener: Option<Listener>,
    ) -> Result<CommandResult, RaftError> {
        let (reply, result) = oneshot::channel();
        self.requests
            .send(Request::Submit {
                command,
                listener,
                reply,
            })
            .map_err(|_| RaftError::Shutdown)?;
        result.await.map_err(|_| RaftError::Shutdown)?
    }
}
