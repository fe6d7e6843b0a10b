//! Node-to-node message delivery.
//!
//! Senders hand an [`Envelope`] to a [`Transport`]; the transport encodes it and
//! appends the frame to the destination node's inbox, where the node's service
//! thread decodes and dispatches it (see [`crate::service`]). Frames from one
//! sender to one receiver arrive in send order.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::message::Envelope;
use crate::queue::MessageQueue;
use crate::{Error, NodeId, Result};

/// An encoded [`Envelope`].
pub type Frame = Vec<u8>;

pub trait Transport: Send + Sync {
    /// Number of nodes reachable through this transport.
    fn nodes(&self) -> usize;

    /// Deliver `envelope` to `to`. Never blocks on the receiver.
    fn send(&self, to: NodeId, envelope: &Envelope) -> Result<usize>;
}

/// In-process full mesh: one inbox per node.
pub struct MeshTransport {
    inboxes: Vec<Arc<MessageQueue<Frame>>>,
    sent_bytes: Vec<AtomicU64>,
}

impl MeshTransport {
    pub fn new(nodes: usize) -> Self {
        Self {
            inboxes: (0..nodes).map(|_| Arc::new(MessageQueue::new())).collect(),
            sent_bytes: (0..nodes).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    /// Inbound frame queue of `node`, drained by that node's service thread.
    pub fn inbox(&self, node: NodeId) -> Result<Arc<MessageQueue<Frame>>> {
        self.inboxes
            .get(node)
            .cloned()
            .ok_or(Error::UnknownNode(node))
    }

    /// Encoded bytes delivered to `node` so far.
    pub fn bytes_to(&self, node: NodeId) -> u64 {
        self.sent_bytes
            .get(node)
            .map_or(0, |b| b.load(Ordering::Relaxed))
    }
}

impl Transport for MeshTransport {
    fn nodes(&self) -> usize {
        self.inboxes.len()
    }

    fn send(&self, to: NodeId, envelope: &Envelope) -> Result<usize> {
        let inbox = self.inboxes.get(to).ok_or(Error::UnknownNode(to))?;
        let frame = envelope.encode()?;
        let len = frame.len();
        // The inbox lock serializes concurrent writers to one peer.
        inbox.push(frame);
        self.sent_bytes[to].fetch_add(len as u64, Ordering::Relaxed);
        Ok(len)
    }
}
