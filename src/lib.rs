//! Distributed equi-join with skew handling.
//!
//! A small (build) table and a large (probe) table are partitioned across a
//! fixed set of nodes. Every node runs one [`reader::TableReader`] per table
//! and one [`joiner::HashJoiner`]. Readers classify rows as skewed or not with
//! a [`histogram::SkewHistogram`] and route them through a [`router::Router`];
//! joiners build an index from the small table, probe it with the big table and
//! pull whatever build rows they are missing from peers over
//! [`fetch::BdStream`]s.
//!
//! ```text
//!  partition file ──► TableReader ──► Output ──► (local | transport) ──► Input ──► HashJoiner
//!                        │                                                  │
//!                  SkewHistogram                                  BdStream fetch/serve
//! ```
use std::hash::{DefaultHasher, Hash, Hasher};

use serde::{Deserialize, Serialize};

pub mod balance;
pub mod cluster;
pub mod config;
pub mod error;
pub mod exchange;
pub mod fetch;
pub mod histogram;
pub mod joiner;
pub mod logging;
pub mod message;
pub mod plan;
pub mod queue;
pub mod reader;
pub mod router;
pub mod service;
pub mod storage;
pub mod transport;

pub use error::{Error, Result};

/// Maximum number of tuples carried by one batch on any stream.
pub const BATCH_SIZE: usize = 1024;

/// Index of a compute node, `0..nodes`.
pub type NodeId = usize;

/// Plan-wide stream identifier. Both ends of a stream share it.
pub type StreamId = u32;

/// One `(key, value)` record. Duplicates are legal and each one joins separately.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tuple {
    pub key: String,
    pub value: String,
}

impl Tuple {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// An ordered run of at most [`BATCH_SIZE`] tuples.
///
/// An empty batch is the end-of-partition marker on every stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    tuples: Vec<Tuple>,
}

impl Batch {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            tuples: Vec::with_capacity(capacity),
        }
    }

    pub fn from_tuples(tuples: Vec<Tuple>) -> Self {
        debug_assert!(tuples.len() <= BATCH_SIZE);
        Self { tuples }
    }

    pub fn push(&mut self, tuple: Tuple) {
        debug_assert!(self.tuples.len() < BATCH_SIZE);
        self.tuples.push(tuple);
    }

    pub fn is_empty(&self) -> bool {
        self.tuples.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.tuples.len() >= BATCH_SIZE
    }

    pub fn len(&self) -> usize {
        self.tuples.len()
    }

    pub fn tuples(&self) -> &[Tuple] {
        &self.tuples
    }

    /// Moves the buffered tuples out, leaving an empty batch behind.
    pub fn take(&mut self) -> Batch {
        std::mem::take(self)
    }

    pub fn into_tuples(self) -> Vec<Tuple> {
        self.tuples
    }
}

impl IntoIterator for Batch {
    type Item = Tuple;
    type IntoIter = std::vec::IntoIter<Tuple>;

    fn into_iter(self) -> Self::IntoIter {
        self.tuples.into_iter()
    }
}

/// Hash used for every placement decision.
///
/// Must agree across all nodes of a run, so it is keyed with the fixed
/// SipHash keys of [`DefaultHasher::new`].
#[inline]
pub fn hash_key(key: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

/// Home node of `key` among `nodes` nodes.
#[inline]
pub fn home_node(key: &str, nodes: usize) -> NodeId {
    debug_assert!(nodes > 0);
    (hash_key(key) % nodes as u64) as NodeId
}
