//! Wire messages exchanged between nodes, encoded with bincode.

use serde::{Deserialize, Serialize};

use crate::{Batch, NodeId, Result, StreamId};

/// One-way partition traffic: rows, skew-key notices, or the end marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataMessage {
    pub stream_id: StreamId,
    pub batch: Option<Batch>,
    pub skew_keys: Vec<String>,
}

impl DataMessage {
    pub fn batch(stream_id: StreamId, batch: Batch) -> Self {
        Self {
            stream_id,
            batch: Some(batch),
            skew_keys: Vec::new(),
        }
    }

    pub fn skew_key(stream_id: StreamId, key: String) -> Self {
        Self {
            stream_id,
            batch: None,
            skew_keys: vec![key],
        }
    }

    pub fn end(stream_id: StreamId) -> Self {
        Self::batch(stream_id, Batch::empty())
    }

    /// No rows and no notices: the sender's partition is exhausted.
    pub fn is_end(&self) -> bool {
        self.skew_keys.is_empty() && self.batch.as_ref().is_none_or(Batch::is_empty)
    }
}

/// Traffic on a bidirectional fetch stream. Any combination of fields may be set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchMessage {
    pub stream_id: StreamId,
    /// Keys the sender wants served.
    pub need_keys: Vec<String>,
    /// Rows the sender serves; each tuple carries its key.
    pub batch: Option<Batch>,
    /// Keys the sender has finished serving.
    pub done_keys: Vec<String>,
    pub close: bool,
}

impl FetchMessage {
    pub fn need(stream_id: StreamId, key: String) -> Self {
        Self {
            stream_id,
            need_keys: vec![key],
            ..Default::default()
        }
    }

    pub fn rows(stream_id: StreamId, batch: Batch) -> Self {
        Self {
            stream_id,
            batch: Some(batch),
            ..Default::default()
        }
    }

    pub fn done(stream_id: StreamId, key: String) -> Self {
        Self {
            stream_id,
            done_keys: vec![key],
            ..Default::default()
        }
    }

    pub fn close(stream_id: StreamId) -> Self {
        Self {
            stream_id,
            close: true,
            ..Default::default()
        }
    }
}

/// Everything a node can receive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Envelope {
    Data(DataMessage),
    Fetch(FetchMessage),
    /// Locally sampled skew keys of `from`, sent to the sketch coordinator.
    SketchReport { from: NodeId, keys: Vec<String> },
    /// The agreed global skew set, broadcast by the coordinator.
    SketchResult { keys: Vec<String> },
    /// Stop the receiving node's service loop.
    Shutdown,
}

impl Envelope {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(frame: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(frame)?)
    }
}
