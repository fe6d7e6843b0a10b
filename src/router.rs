//! Tuple placement.
//!
//! A [`Router`] answers two questions for a tuple: which destinations receive
//! the row (`distribute`) and which destinations must be told that the key is
//! skewed (`notify`). Destinations are indices into the owning output's stream
//! list, which is ordered by node id.

use std::collections::HashMap;

use crate::balance::{BalanceRouter, NodeStatistic};
use crate::config::SkewConfig;
use crate::{NodeId, Tuple, home_node};

#[derive(Debug, Clone)]
pub enum Router {
    /// Home node only.
    Hash { nodes: usize },
    /// Every node.
    Mirror { nodes: usize },
    /// Per-key round robin over all nodes; everyone but the home is notified.
    Average {
        nodes: usize,
        next: HashMap<String, NodeId>,
    },
    /// Stay on `local`; tell `local` unless it already is the home node.
    KeepLocal { local: NodeId, nodes: usize },
    /// Stay on `local`; tell every node.
    KeepLocalNotifyAll { local: NodeId, nodes: usize },
    /// A fixed destination set; tell every node.
    FixedMirror { targets: Vec<NodeId>, nodes: usize },
    /// No data movement; tell every node.
    NotifyOnly { nodes: usize },
    Balance(BalanceRouter),
}

impl Router {
    pub fn hash(nodes: usize) -> Self {
        Router::Hash { nodes }
    }

    pub fn mirror(nodes: usize) -> Self {
        Router::Mirror { nodes }
    }

    pub fn average(nodes: usize) -> Self {
        Router::Average {
            nodes,
            next: HashMap::new(),
        }
    }

    pub fn keep_local(local: NodeId, nodes: usize) -> Self {
        Router::KeepLocal { local, nodes }
    }

    pub fn keep_local_notify_all(local: NodeId, nodes: usize) -> Self {
        Router::KeepLocalNotifyAll { local, nodes }
    }

    pub fn fixed_mirror(targets: Vec<NodeId>, nodes: usize) -> Self {
        Router::FixedMirror { targets, nodes }
    }

    pub fn notify_only(nodes: usize) -> Self {
        Router::NotifyOnly { nodes }
    }

    pub fn balance(nodes: usize, config: &SkewConfig) -> Self {
        Router::Balance(BalanceRouter::new(nodes, config))
    }

    /// Destinations that receive `tuple`.
    ///
    /// `stats` is the send table of the output the tuple leaves through; only
    /// the balance router reads it.
    pub fn distribute(&mut self, tuple: &Tuple, stats: &NodeStatistic) -> Vec<NodeId> {
        match self {
            Router::Hash { nodes } => vec![home_node(&tuple.key, *nodes)],
            Router::Mirror { nodes } => (0..*nodes).collect(),
            Router::Average { nodes, next } => {
                let slot = next.entry(tuple.key.clone()).or_insert(0);
                let id = *slot;
                *slot = (id + 1) % *nodes;
                vec![id]
            }
            Router::KeepLocal { local, .. } | Router::KeepLocalNotifyAll { local, .. } => {
                vec![*local]
            }
            Router::FixedMirror { targets, .. } => targets.clone(),
            Router::NotifyOnly { .. } => Vec::new(),
            Router::Balance(router) => router.distribute(tuple, stats),
        }
    }

    /// Destinations that must learn `tuple.key` is skewed.
    pub fn notify(&mut self, tuple: &Tuple) -> Vec<NodeId> {
        match self {
            Router::Hash { .. } | Router::Mirror { .. } => Vec::new(),
            Router::Average { nodes, .. } => {
                let home = home_node(&tuple.key, *nodes);
                (0..*nodes).filter(|&n| n != home).collect()
            }
            Router::KeepLocal { local, nodes } => {
                if home_node(&tuple.key, *nodes) == *local {
                    Vec::new()
                } else {
                    vec![*local]
                }
            }
            Router::KeepLocalNotifyAll { nodes, .. }
            | Router::FixedMirror { nodes, .. }
            | Router::NotifyOnly { nodes } => (0..*nodes).collect(),
            Router::Balance(router) => router.notify(tuple),
        }
    }
}
