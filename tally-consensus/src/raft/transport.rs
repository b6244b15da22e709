use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use tally_common::types::NodeId;
use tokio::sync::mpsc;
use tracing::{trace, warn};

use super::encoding::{EncodedObject, Encoder};
use super::message::Message;

/// Outbound delivery of messages, addressed by node id.
///
/// `send` is fire-and-forget: it must never block the caller and gives no
/// delivery guarantee. Every path that waits on a reply has its own retry
/// (heartbeats, fresh elections).
pub trait Transport: Send + Sync {
    fn send(&self, to: &NodeId, message: Message);
}

/// In-process network: encodes every message and drops it into the target's
/// inbound channel. Members can be cut off to simulate partitions.
pub struct LocalNetwork {
    encoder: Arc<dyn Encoder>,
    routes: RwLock<HashMap<NodeId, mpsc::UnboundedSender<EncodedObject>>>,
    disconnected: RwLock<HashSet<NodeId>>,
}

impl LocalNetwork {
    pub fn new(encoder: Arc<dyn Encoder>) -> Arc<Self> {
        Arc::new(Self {
            encoder,
            routes: RwLock::new(HashMap::new()),
            disconnected: RwLock::new(HashSet::new()),
        })
    }

    /// Attach `id` (a server or a client) and return its inbound channel
    pub fn register(&self, id: &str) -> mpsc::UnboundedReceiver<EncodedObject> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_string(), tx);
        rx
    }

    /// Drop all traffic to and from `id`
    pub fn disconnect(&self, id: &str) {
        self.disconnected
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_string());
    }

    pub fn reconnect(&self, id: &str) {
        self.disconnected
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }

    pub fn is_connected(&self, id: &str) -> bool {
        !self
            .disconnected
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(id)
    }

    pub fn encoder(&self) -> Arc<dyn Encoder> {
        self.encoder.clone()
    }
}

impl Transport for LocalNetwork {
    fn send(&self, to: &NodeId, message: Message) {
        if !self.is_connected(to) || !self.is_connected(&message.sender_id) {
            trace!(from = %message.sender_id, to = %to, kind = %message.kind(), "dropping message across partition");
            return;
        }

        let encoded = match self.encoder.encode(&message) {
            Ok(encoded) => encoded,
            Err(err) => {
                warn!(from = %message.sender_id, to = %to, error = %err, "failed to encode message");
                return;
            }
        };

        let routes = self.routes.read().unwrap_or_else(PoisonError::into_inner);
        match routes.get(to) {
            Some(route) => {
                // a closed route means the target shut down; nothing to retry
                let _ = route.send(encoded);
            }
            None => trace!(to = %to, "no route to node"),
        }
    }
}
