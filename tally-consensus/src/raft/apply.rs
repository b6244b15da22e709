//! The apply loop: the single, sequential consumer of committed entries.
//!
//! The node hands every newly committed entry over in index order, together
//! with the pending client request for that index (if any). The loop runs on
//! its own blocking task so a slow state machine never stalls RPC handling.

use std::sync::Arc;

use tally_common::metrics::{MetricsCollector, NoopMetrics};
use tally_common::types::{LogIndex, NodeId};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

use super::error::RaftError;
use super::log::{LogEntry, LogError};
use super::node::PendingRequest;
use super::state_machine::StateMachineRegistry;

pub type ApplySender = mpsc::UnboundedSender<ApplyTask>;
pub type ApplyReceiver = mpsc::UnboundedReceiver<ApplyTask>;

pub(crate) const ENTRIES_APPLIED: &str = "raft.entries_applied";

/// One committed entry on its way to the state machine
#[derive(Debug)]
pub struct ApplyTask {
    pub entry: LogEntry,
    pub pending: Option<PendingRequest>,
}

pub struct ApplyLoop {
    id: NodeId,
    registry: StateMachineRegistry,
    last_applied: LogIndex,
    applied_tx: watch::Sender<LogIndex>,
    metrics: Arc<dyn MetricsCollector>,
}

impl ApplyLoop {
    /// Returns the loop and a receiver that tracks the last applied index
    pub fn new(id: NodeId, registry: StateMachineRegistry) -> (Self, watch::Receiver<LogIndex>) {
        let (applied_tx, applied_rx) = watch::channel(0);
        let apply_loop = Self {
            id,
            registry,
            last_applied: 0,
            applied_tx,
            metrics: Arc::new(NoopMetrics),
        };
        (apply_loop, applied_rx)
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsCollector>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    /// Apply one entry. Entries must arrive exactly in index order; an
    /// unknown command is fatal for the loop.
    pub fn apply(&mut self, task: ApplyTask) -> Result<(), RaftError> {
        let ApplyTask { entry, pending } = task;
        let index = entry.index;

        if index != self.last_applied + 1 {
            let err = RaftError::Log(LogError::NonContiguous {
                index,
                last_index: self.last_applied,
            });
            error!(node = %self.id, index, last_applied = self.last_applied, "apply loop received entry out of order");
            if let Some(pending) = pending {
                pending.resolve(Err(err.clone()));
            }
            return Err(err);
        }

        if let Err(err) = self.registry.apply(&entry.command) {
            error!(node = %self.id, index, error = %err, "failed to apply committed entry");
            if let Some(pending) = pending {
                pending.resolve(Err(err.clone()));
            }
            return Err(err);
        }

        self.last_applied = index;
        self.applied_tx.send_replace(index);
        self.metrics.inc_counter(ENTRIES_APPLIED);
        debug!(node = %self.id, index, term = entry.term, "applied entry");

        if let Some(pending) = pending {
            // the slot may have been re-used by a later leader's entry
            if pending.term == entry.term {
                pending.resolve(Ok(index));
            } else {
                pending.resolve(Err(RaftError::Rejected { index }));
            }
        }
        Ok(())
    }

    /// Drain `tasks` until the node side hangs up or an entry fails to apply.
    /// Blocks the current thread; run it on a blocking task.
    pub fn run(mut self, mut tasks: ApplyReceiver) -> Result<(), RaftError> {
        while let Some(task) = tasks.blocking_recv() {
            self.apply(task)?;
        }
        info!(node = %self.id, last_applied = self.last_applied, "apply loop stopped");
        Ok(())
    }
}
