//! Load-aware routing for skewed keys.
//!
//! [`NodeStatistic`] counts how many skewed tuples one output has sent to each
//! node. Every skewed key gets a [`SkewKeyRouteState`] that starts on the key's
//! home node and migrates to the least loaded of its candidate nodes when the
//! home becomes the hottest node. Candidates are derived by hashing
//! `"<key> <seq>"`, so every node grows the same candidate list for a key
//! without coordination.

use std::collections::HashMap;

use crate::config::SkewConfig;
use crate::{NodeId, Tuple, hash_key, home_node};

// ============================================================================
// NodeStatistic
// ============================================================================

/// Per-destination send counters with an incrementally maintained min/max.
#[derive(Debug, Clone)]
pub struct NodeStatistic {
    sent: Vec<u64>,
    max: u64,
    min: u64,
    /// Number of nodes whose count equals `min`.
    min_count: usize,
}

impl NodeStatistic {
    pub fn new(nodes: usize) -> Self {
        Self {
            sent: vec![0; nodes],
            max: 0,
            min: 0,
            min_count: nodes,
        }
    }

    pub fn len(&self) -> usize {
        self.sent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sent.is_empty()
    }

    pub fn get(&self, id: NodeId) -> u64 {
        self.sent[id]
    }

    pub fn max(&self) -> u64 {
        self.max
    }

    pub fn min(&self) -> u64 {
        self.min
    }

    pub fn increment(&mut self, id: NodeId) {
        let old = self.sent[id];
        self.sent[id] += 1;

        if old == self.min {
            self.min_count -= 1;
            if self.min_count == 0 {
                // The minimum bucket emptied: every node is now above the old
                // minimum and `id` sits at the smallest possible new one.
                self.min = old + 1;
                self.min_count = self.sent.iter().filter(|&&c| c == self.min).count();
            }
        }
        self.max = self.max.max(self.sent[id]);
        debug_assert!(self.max >= self.min);
    }

    /// Imbalance `(max - min) / max` as it would be after one more send to `id`.
    pub fn projected_balance(&self, id: NodeId) -> f64 {
        let count = self.sent[id];
        let max = self.max.max(count + 1);
        let mut min = self.min;
        if count == self.min && self.min_count == 1 {
            min += 1;
        }
        (max - min) as f64 / max as f64
    }
}

// ============================================================================
// SkewKeyRouteState
// ============================================================================

/// Routing state of one skewed key.
#[derive(Debug, Clone)]
pub struct SkewKeyRouteState {
    key: String,
    nodes: usize,
    send_id: NodeId,
    /// Nodes allowed to receive this key, in discovery order. Never shrinks.
    candidates: Vec<NodeId>,
    /// Candidates added since the last [`Self::take_notifies`].
    notifies: Vec<NodeId>,
    send_counts: Vec<u64>,
    sends: u64,
    update_frequency: u64,
    expand_done: bool,
}

impl SkewKeyRouteState {
    pub fn new(key: &str, nodes: usize, update_frequency: u64) -> Self {
        let home = home_node(key, nodes);
        Self {
            key: key.to_string(),
            nodes,
            send_id: home,
            candidates: vec![home],
            notifies: Vec::new(),
            send_counts: vec![0; nodes],
            sends: 0,
            update_frequency: update_frequency.max(1),
            expand_done: nodes == 1,
        }
    }

    pub fn current(&self) -> NodeId {
        self.send_id
    }

    pub fn candidates(&self) -> &[NodeId] {
        &self.candidates
    }

    pub fn is_fully_expanded(&self) -> bool {
        self.expand_done
    }

    /// Destination of the next tuple of this key.
    ///
    /// Every `update_frequency` sends the key re-points to whichever node it
    /// has used least so far.
    pub fn next_send_id(&mut self) -> NodeId {
        let id = self.send_id;
        self.send_counts[id] += 1;
        self.sends += 1;

        if self.sends % self.update_frequency == 0 {
            let mut least = self.send_counts[self.send_id];
            for (node, &count) in self.send_counts.iter().enumerate() {
                if count != 0 && count < least {
                    self.send_id = node;
                    least = count;
                }
            }
        }
        id
    }

    /// Move to the least loaded candidate, growing the candidate list until
    /// one is strictly less loaded than the current node or all nodes are in.
    pub fn rebalance(&mut self, stats: &NodeStatistic) {
        loop {
            let mut best = self.candidates[0];
            for &node in &self.candidates[1..] {
                if stats.get(node) < stats.get(best) {
                    best = node;
                }
            }
            if stats.get(best) < stats.get(self.send_id) {
                self.send_id = best;
                return;
            }
            if self.expand_done {
                return;
            }
            self.expand();
        }
    }

    fn expand(&mut self) {
        debug_assert!(self.candidates.len() < self.nodes);
        let mut used = vec![false; self.nodes];
        for &node in &self.candidates {
            used[node] = true;
        }

        let mut seq = self.candidates.len();
        let node = loop {
            let node = (hash_key(&format!("{} {seq}", self.key)) % self.nodes as u64) as NodeId;
            if !used[node] {
                break node;
            }
            seq += 1;
        };

        self.candidates.push(node);
        self.notifies.push(node);
        self.expand_done = self.candidates.len() == self.nodes;
    }

    /// Drain the candidates added since the previous call.
    pub fn take_notifies(&mut self) -> Vec<NodeId> {
        std::mem::take(&mut self.notifies)
    }
}

// ============================================================================
// BalanceRouter
// ============================================================================

#[derive(Debug, Clone)]
pub struct BalanceRouter {
    nodes: usize,
    balance_factor: f64,
    frequency_ratio: f64,
    update_frequency: u64,
    keys: HashMap<String, SkewKeyRouteState>,
}

impl BalanceRouter {
    pub fn new(nodes: usize, config: &SkewConfig) -> Self {
        Self {
            nodes,
            balance_factor: config.balance_factor,
            frequency_ratio: config.frequency_threshold,
            update_frequency: config.update_frequency,
            keys: HashMap::new(),
        }
    }

    fn state(&mut self, key: &str) -> &mut SkewKeyRouteState {
        let (nodes, update_frequency) = (self.nodes, self.update_frequency);
        self.keys
            .entry(key.to_string())
            .or_insert_with(|| SkewKeyRouteState::new(key, nodes, update_frequency))
    }

    pub fn distribute(&mut self, tuple: &Tuple, stats: &NodeStatistic) -> Vec<NodeId> {
        let min_load = 1.0 / self.frequency_ratio;
        let factor = self.balance_factor;

        let state = self.state(&tuple.key);
        let mut id = state.next_send_id();
        if stats.get(id) as f64 > min_load
            && stats.get(id) == stats.max()
            && stats.projected_balance(id) > factor
        {
            state.rebalance(stats);
            id = state.next_send_id();
        }
        vec![id]
    }

    pub fn notify(&mut self, tuple: &Tuple) -> Vec<NodeId> {
        self.state(&tuple.key).take_notifies()
    }

    pub fn route_state(&self, key: &str) -> Option<&SkewKeyRouteState> {
        self.keys.get(key)
    }

    pub fn tracked_keys(&self) -> usize {
        self.keys.len()
    }
}
