//! Per-node message service.
//!
//! Each node owns a [`StreamRegistry`] mapping stream ids to the endpoints of
//! the current run, and one service thread that drains the node's inbox and
//! hands every decoded [`Envelope`] to the endpoint it names. Dispatch never
//! blocks, so a slow joiner can't stall delivery to its neighbours.
//!
//! Node 0 additionally coordinates the skew-set agreement used by the
//! ld-sketch distribution: every node reports its locally skewed keys, and
//! once all have reported the intersection is broadcast back.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info};

use crate::exchange::InStream;
use crate::fetch::BdStream;
use crate::message::Envelope;
use crate::queue::{MessageQueue, OneShot};
use crate::transport::{Frame, Transport};
use crate::{Error, NodeId, Result, StreamId};

/// Node that intersects sketch reports.
pub const SKETCH_COORDINATOR: NodeId = 0;

/// A globally agreed skew key set.
pub type SkewSet = Arc<HashSet<String>>;

#[derive(Default)]
pub struct StreamRegistry {
    inputs: RwLock<HashMap<StreamId, Arc<InStream>>>,
    fetches: RwLock<HashMap<StreamId, Arc<BdStream>>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_input(&self, stream: Arc<InStream>) {
        self.inputs.write().insert(stream.id(), stream);
    }

    pub fn register_fetch(&self, stream: Arc<BdStream>) {
        self.fetches.write().insert(stream.id(), stream);
    }

    pub fn input(&self, id: StreamId) -> Result<Arc<InStream>> {
        self.inputs
            .read()
            .get(&id)
            .cloned()
            .ok_or(Error::UnknownStream(id))
    }

    pub fn fetch(&self, id: StreamId) -> Result<Arc<BdStream>> {
        self.fetches
            .read()
            .get(&id)
            .cloned()
            .ok_or(Error::UnknownStream(id))
    }

    /// Drop every endpoint of the finished run.
    pub fn clear(&self) {
        self.inputs.write().clear();
        self.fetches.write().clear();
    }

    pub fn len(&self) -> usize {
        self.inputs.read().len() + self.fetches.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Running intersection of sketch reports.
pub struct SketchIntersection {
    nodes: usize,
    state: Mutex<SketchState>,
}

#[derive(Default)]
struct SketchState {
    keys: Option<HashSet<String>>,
    reported: HashSet<NodeId>,
}

impl SketchIntersection {
    pub fn new(nodes: usize) -> Self {
        Self {
            nodes,
            state: Mutex::new(SketchState::default()),
        }
    }

    /// Fold in `from`'s keys. Returns the final set once every node has
    /// reported; a repeated report from the same node is ignored.
    pub fn report(&self, from: NodeId, keys: Vec<String>) -> Option<Vec<String>> {
        let mut state = self.state.lock();
        if !state.reported.insert(from) {
            return None;
        }
        let incoming: HashSet<String> = keys.into_iter().collect();
        state.keys = Some(match state.keys.take() {
            None => incoming,
            Some(running) => running.intersection(&incoming).cloned().collect(),
        });

        if state.reported.len() < self.nodes {
            return None;
        }
        let mut keys: Vec<String> = state.keys.iter().flatten().cloned().collect();
        keys.sort_unstable();
        Some(keys)
    }
}

pub enum Control {
    Continue,
    Stop,
}

pub struct NodeService {
    node: NodeId,
    registry: Arc<StreamRegistry>,
    transport: Arc<dyn Transport>,
    sketch: SketchIntersection,
    sketch_result: Arc<OneShot<SkewSet>>,
}

impl NodeService {
    pub fn new(node: NodeId, registry: Arc<StreamRegistry>, transport: Arc<dyn Transport>) -> Self {
        let nodes = transport.nodes();
        Self {
            node,
            registry,
            transport,
            sketch: SketchIntersection::new(nodes),
            sketch_result: Arc::new(OneShot::new()),
        }
    }

    pub fn registry(&self) -> &Arc<StreamRegistry> {
        &self.registry
    }

    /// Where this node's ld-sketch reader waits for the agreed skew set.
    pub fn sketch_result(&self) -> Arc<OneShot<SkewSet>> {
        Arc::clone(&self.sketch_result)
    }

    /// Decode one frame and route it.
    pub fn dispatch(&self, frame: &[u8]) -> Result<Control> {
        match Envelope::decode(frame)? {
            Envelope::Data(msg) => {
                self.registry.input(msg.stream_id)?.deliver(msg, frame.len());
            }
            Envelope::Fetch(msg) => {
                self.registry
                    .fetch(msg.stream_id)?
                    .receive(msg, frame.len())?;
            }
            Envelope::SketchReport { from, keys } => {
                if self.node != SKETCH_COORDINATOR {
                    return Err(Error::Protocol(format!(
                        "sketch report from node {from} sent to node {}",
                        self.node
                    )));
                }
                debug!(node = self.node, from, keys = keys.len(), "sketch report");
                if let Some(keys) = self.sketch.report(from, keys) {
                    info!(global_skews = keys.len(), "sketch intersection complete");
                    let result = Envelope::SketchResult { keys };
                    for node in 0..self.transport.nodes() {
                        self.transport.send(node, &result)?;
                    }
                }
            }
            Envelope::SketchResult { keys } => {
                self.sketch_result.set(Arc::new(keys.into_iter().collect()));
            }
            Envelope::Shutdown => return Ok(Control::Stop),
        }
        Ok(Control::Continue)
    }

    /// Serve `inbox` until a shutdown arrives.
    ///
    /// A frame that can't be dispatched means the plan and the registry
    /// disagree; the process is aborted.
    pub fn run(&self, inbox: &MessageQueue<Frame>) {
        debug!(node = self.node, "service started");
        loop {
            let frame = inbox.get();
            match self.dispatch(&frame) {
                Ok(Control::Continue) => {}
                Ok(Control::Stop) => break,
                Err(err) => {
                    error!(node = self.node, error = %err, "fatal dispatch failure");
                    std::process::abort();
                }
            }
        }
        debug!(node = self.node, "service stopped");
    }
}
