//! Cluster-wide execution plan.
//!
//! The gateway turns an [`Algorithm`] and a node count into one [`NodePlan`]
//! per node. Stream ids are assigned in a fixed order so both ends of every
//! stream agree without talking to each other:
//!
//! 1. small-table reader outputs, `for src in nodes, for dst in nodes`;
//! 2. big-table reader outputs, same order;
//! 3. fetch streams: for each node `i`, its local stream, then one shared id
//!    per pair `(i, j)` with `j > i`;
//! 4. flow-join only: a second set of fetch streams, same order.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::storage::{DataLayout, Table};
use crate::{Error, NodeId, Result, StreamId};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum Algorithm {
    /// Hash partition both tables.
    #[default]
    Base,
    /// Partial network redistribution: spread skewed big rows round robin.
    Pnr,
    /// Partial redistribution, partial duplication: keep skewed big rows local.
    Prpd,
    /// Balanced network redistribution: load-aware placement of skewed rows.
    Bnr,
    /// Symmetric skew handling over a rows x cols node grid.
    FlowJoin,
}

impl Algorithm {
    pub const ALL: [Algorithm; 5] = [
        Algorithm::Base,
        Algorithm::Pnr,
        Algorithm::Prpd,
        Algorithm::Bnr,
        Algorithm::FlowJoin,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Algorithm::Base => "base",
            Algorithm::Pnr => "pnr",
            Algorithm::Prpd => "prpd",
            Algorithm::Bnr => "bnr",
            Algorithm::FlowJoin => "flow-join",
        }
    }

    /// Reader strategies for the small and big table.
    pub fn distributions(self, ld_sketch: bool) -> (Distribution, Distribution) {
        match self {
            Algorithm::Base => (Distribution::Hash, Distribution::Hash),
            Algorithm::Pnr => (Distribution::Hash, Distribution::Average),
            Algorithm::Prpd => (Distribution::Hash, Distribution::KeepLocal),
            Algorithm::Bnr if ld_sketch => (Distribution::Hash, Distribution::LdSketch),
            Algorithm::Bnr => (Distribution::Hash, Distribution::Balance),
            Algorithm::FlowJoin => (Distribution::FlowSmall, Distribution::FlowBig),
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How a table reader places its rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Distribution {
    /// Every row to its home node.
    Hash,
    /// Skewed rows stay local, the home node is told.
    KeepLocal,
    /// Skewed rows round robin over all nodes.
    Average,
    /// Skewed rows through the balance router.
    Balance,
    /// Agree on a global skew set first, then route like `Balance`.
    LdSketch,
    /// Skewed rows stay local and every node is told.
    FlowSmall,
    /// Four-way split on big-table and small-table skew.
    FlowBig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamKind {
    /// Both ends live on the same node.
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub id: StreamId,
    pub kind: StreamKind,
    /// The node at the other end.
    pub node: NodeId,
}

impl StreamInfo {
    fn between(id: StreamId, here: NodeId, there: NodeId) -> Self {
        let kind = if here == there {
            StreamKind::Local
        } else {
            StreamKind::Remote
        };
        Self {
            id,
            kind,
            node: there,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaderPlan {
    pub table: Table,
    pub partition: PathBuf,
    pub distribution: Distribution,
    /// Indexed by destination node.
    pub outputs: Vec<StreamInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinerPlan {
    pub algorithm: Algorithm,
    /// Indexed by source node.
    pub small_inputs: Vec<StreamInfo>,
    pub big_inputs: Vec<StreamInfo>,
    /// Fetch streams serving the small table, indexed by peer node.
    pub small_fetch: Vec<StreamInfo>,
    /// Flow-join only: fetch streams serving intersecting big rows.
    pub big_fetch: Vec<StreamInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodePlan {
    pub node: NodeId,
    pub nodes: usize,
    pub grid: GridPartition,
    pub small_reader: ReaderPlan,
    pub big_reader: ReaderPlan,
    pub joiner: JoinerPlan,
}

// ============================================================================
// Grid partition
// ============================================================================

/// `n` nodes laid out row-major on a `rows x cols` grid.
///
/// `rows` is the largest divisor of `n` not above `sqrt(n)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridPartition {
    pub n: usize,
    pub rows: usize,
    pub cols: usize,
}

impl GridPartition {
    pub fn new(n: usize) -> Result<Self> {
        if n == 0 {
            return Err(Error::Plan("grid needs at least one node".into()));
        }
        let mut rows = n.isqrt();
        while n % rows != 0 {
            rows -= 1;
        }
        let grid = Self {
            n,
            rows,
            cols: n / rows,
        };
        if grid.rows * grid.cols != n {
            return Err(Error::Plan(format!("bad grid factorization for {n}")));
        }
        Ok(grid)
    }

    /// Nodes sharing `node`'s grid row.
    pub fn row_members(&self, node: NodeId) -> Vec<NodeId> {
        debug_assert!(node < self.n);
        let start = (node / self.cols) * self.cols;
        (start..start + self.cols).collect()
    }

    /// Nodes sharing `node`'s grid column.
    pub fn col_members(&self, node: NodeId) -> Vec<NodeId> {
        debug_assert!(node < self.n);
        (node % self.cols..self.n).step_by(self.cols).collect()
    }
}

// ============================================================================
// Plan generation
// ============================================================================

/// Build every node's plan.
pub fn generate(
    algorithm: Algorithm,
    layout: &DataLayout,
    nodes: usize,
    ld_sketch: bool,
) -> Result<Vec<NodePlan>> {
    if nodes == 0 {
        return Err(Error::Plan("cluster has no nodes".into()));
    }
    let grid = GridPartition::new(nodes)?;
    let (small_dist, big_dist) = algorithm.distributions(ld_sketch);
    let mut next_id: StreamId = 0;

    let mut small_outputs = vec![Vec::new(); nodes];
    let mut small_inputs = vec![Vec::new(); nodes];
    assign_exchange(&mut next_id, &mut small_outputs, &mut small_inputs);

    let mut big_outputs = vec![Vec::new(); nodes];
    let mut big_inputs = vec![Vec::new(); nodes];
    assign_exchange(&mut next_id, &mut big_outputs, &mut big_inputs);

    let small_fetch = assign_fetch(&mut next_id, nodes);
    let big_fetch = if algorithm == Algorithm::FlowJoin {
        assign_fetch(&mut next_id, nodes)
    } else {
        vec![Vec::new(); nodes]
    };

    tracing::debug!(
        %algorithm,
        nodes,
        streams = next_id,
        rows = grid.rows,
        cols = grid.cols,
        "generated plan"
    );

    let plans = small_outputs
        .into_iter()
        .zip(small_inputs)
        .zip(big_outputs.into_iter().zip(big_inputs))
        .zip(small_fetch.into_iter().zip(big_fetch))
        .enumerate()
        .map(
            |(node, (((small_out, small_in), (big_out, big_in)), (small_fetch, big_fetch)))| {
                NodePlan {
                    node,
                    nodes,
                    grid,
                    small_reader: ReaderPlan {
                        table: Table::Small,
                        partition: layout.partition_path(node, Table::Small),
                        distribution: small_dist,
                        outputs: small_out,
                    },
                    big_reader: ReaderPlan {
                        table: Table::Big,
                        partition: layout.partition_path(node, Table::Big),
                        distribution: big_dist,
                        outputs: big_out,
                    },
                    joiner: JoinerPlan {
                        algorithm,
                        small_inputs: small_in,
                        big_inputs: big_in,
                        small_fetch,
                        big_fetch,
                    },
                }
            },
        )
        .collect();
    Ok(plans)
}

/// One stream per (source, destination) pair.
fn assign_exchange(
    next_id: &mut StreamId,
    outputs: &mut [Vec<StreamInfo>],
    inputs: &mut [Vec<StreamInfo>],
) {
    let nodes = outputs.len();
    for src in 0..nodes {
        for dst in 0..nodes {
            let id = *next_id;
            *next_id += 1;
            outputs[src].push(StreamInfo::between(id, src, dst));
            inputs[dst].push(StreamInfo::between(id, dst, src));
        }
    }
}

/// One stream per unordered node pair plus one local stream per node,
/// indexed by peer.
fn assign_fetch(next_id: &mut StreamId, nodes: usize) -> Vec<Vec<StreamInfo>> {
    let mut slots: Vec<Vec<Option<StreamInfo>>> = vec![vec![None; nodes]; nodes];
    for i in 0..nodes {
        slots[i][i] = Some(StreamInfo::between(*next_id, i, i));
        *next_id += 1;
        for j in i + 1..nodes {
            let id = *next_id;
            *next_id += 1;
            slots[i][j] = Some(StreamInfo::between(id, i, j));
            slots[j][i] = Some(StreamInfo::between(id, j, i));
        }
    }
    slots
        .into_iter()
        .map(|row| row.into_iter().flatten().collect())
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};

    use super::*;
    use crate::config::DataConfig;

    fn layout(nodes: usize) -> DataLayout {
        DataLayout::new(&DataConfig::default(), nodes)
    }

    #[test]
    fn grid_factorization() {
        for (n, rows, cols) in [(4, 2, 2), (6, 2, 3), (8, 2, 4), (9, 3, 3), (12, 3, 4)] {
            let grid = GridPartition::new(n).unwrap();
            assert_eq!((grid.rows, grid.cols), (rows, cols), "n = {n}");
            assert_eq!(grid.rows * grid.cols, n);
            let largest = (1..=n).filter(|d| n % d == 0 && d * d <= n).max().unwrap();
            assert_eq!(grid.rows, largest);
        }
        assert_eq!(GridPartition::new(7).unwrap().rows, 1);
        assert!(GridPartition::new(0).is_err());
    }

    #[test]
    fn every_node_in_one_row_and_one_column() {
        let grid = GridPartition::new(6).unwrap();
        assert_eq!(grid.row_members(4), vec![3, 4, 5]);
        assert_eq!(grid.col_members(4), vec![1, 4]);
        for node in 0..6 {
            assert!(grid.row_members(node).contains(&node));
            assert!(grid.col_members(node).contains(&node));
            // A row and a column meet in exactly one node.
            for other in 0..6 {
                let row: HashSet<_> = grid.row_members(node).into_iter().collect();
                let meet = grid
                    .col_members(other)
                    .into_iter()
                    .filter(|n| row.contains(n))
                    .count();
                assert_eq!(meet, 1);
            }
        }
    }

    #[test]
    fn exchange_streams_pair_up() {
        let plans = generate(Algorithm::Pnr, &layout(3), 3, false).unwrap();
        for plan in &plans {
            for (dst, out) in plan.small_reader.outputs.iter().enumerate() {
                assert_eq!(out.node, dst);
                let input = plans[dst].joiner.small_inputs[plan.node];
                assert_eq!(input.id, out.id);
                assert_eq!(input.node, plan.node);
                assert_eq!(input.kind, out.kind);
                assert_eq!(out.kind == StreamKind::Local, dst == plan.node);
            }
            assert_eq!(plan.big_reader.distribution, Distribution::Average);
        }
        // Small outputs come first.
        assert_eq!(plans[0].small_reader.outputs[0].id, 0);
        assert_eq!(plans[0].big_reader.outputs[0].id, 9);
    }

    #[test]
    fn fetch_streams_shared_per_pair() {
        let plans = generate(Algorithm::FlowJoin, &layout(4), 4, false).unwrap();
        let mut ids = HashMap::new();
        for plan in &plans {
            assert_eq!(plan.joiner.small_fetch.len(), 4);
            assert_eq!(plan.joiner.big_fetch.len(), 4);
            for set in [&plan.joiner.small_fetch, &plan.joiner.big_fetch] {
                for (peer, info) in set.iter().enumerate() {
                    assert_eq!(info.node, peer);
                    assert_eq!(info.kind == StreamKind::Local, peer == plan.node);
                    let key = (plan.node.min(peer), plan.node.max(peer), info.id);
                    *ids.entry(key).or_insert(0) += 1;
                }
            }
        }
        // Remote ids show up at both ends, local ids once.
        for ((a, b, _), count) in ids {
            assert_eq!(count, if a == b { 1 } else { 2 });
        }

        let base = generate(Algorithm::Base, &layout(4), 4, false).unwrap();
        assert!(base[0].joiner.big_fetch.is_empty());
    }

    #[test]
    fn router_pairs_per_algorithm() {
        assert_eq!(
            Algorithm::Bnr.distributions(true),
            (Distribution::Hash, Distribution::LdSketch)
        );
        assert_eq!(
            Algorithm::Prpd.distributions(false),
            (Distribution::Hash, Distribution::KeepLocal)
        );
        assert_eq!(
            Algorithm::FlowJoin.distributions(true),
            (Distribution::FlowSmall, Distribution::FlowBig)
        );
    }

    #[test]
    fn algorithm_names() {
        use clap::ValueEnum;
        for alg in Algorithm::ALL {
            let parsed = Algorithm::from_str(alg.name(), false).unwrap();
            assert_eq!(parsed, alg);
        }
    }
}
