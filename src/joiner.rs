//! Per-node hash join.
//!
//! A [`HashJoiner`] walks through a fixed sequence of phases:
//!
//! 1. `Building`: drain the small-table input into a [`BuildIndex`] and make
//!    it servable on every fetch stream.
//! 2. `Probing1`: drain the big-table input, counting matches against the
//!    index. Skew notices name keys whose build rows live elsewhere; those are
//!    fetched from the key's home node and the probing rows are tallied.
//! 3. `Fetching`/`Probing2`: wait for the outstanding fetches and credit the
//!    tallied rows with the fetched matches.
//! 4. `Probing3`, flow-join only: keys skewed on both sides are joined over
//!    the node grid, small rows along the grid row and big rows along the
//!    grid column.
//!
//! Matches are only counted, never materialized.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::exchange::Input;
use crate::fetch::{BdStream, BuildIndex};
use crate::plan::{Algorithm, GridPartition, NodePlan, StreamInfo};
use crate::queue::OneShot;
use crate::reader::FlowLink;
use crate::service::StreamRegistry;
use crate::transport::Transport;
use crate::{NodeId, Result, Tuple, home_node};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinPhase {
    Building,
    Probing1,
    Fetching,
    Probing2,
    Probing3,
    Done,
}

impl fmt::Display for JoinPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JoinPhase::Building => "building",
            JoinPhase::Probing1 => "probing-1",
            JoinPhase::Fetching => "fetching",
            JoinPhase::Probing2 => "probing-2",
            JoinPhase::Probing3 => "probing-3",
            JoinPhase::Done => "done",
        };
        f.write_str(name)
    }
}

/// What one node reports back to the gateway.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NodeStats {
    pub result_count: u64,
    /// Encoded bytes received over the partition exchange.
    pub network_phase1: u64,
    /// Encoded bytes received over fetch streams.
    pub network_phase2: u64,
}

/// Big rows waiting on a fetched key.
#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    rows: u64,
    /// Matches already counted against the local index.
    local_matches: u64,
}

pub struct HashJoiner {
    node: NodeId,
    nodes: usize,
    algorithm: Algorithm,
    grid: GridPartition,
    phase: JoinPhase,
    small_input: Input,
    big_input: Input,
    /// Indexed by peer node.
    small_fetch: Vec<Arc<BdStream>>,
    /// Indexed by peer node; empty unless flow-join.
    big_fetch: Vec<Arc<BdStream>>,
    flow: Option<FlowLink>,
}

impl HashJoiner {
    pub fn new(plan: &NodePlan, transport: &Arc<dyn Transport>) -> Self {
        let fetch_streams = |infos: &[StreamInfo]| -> Vec<Arc<BdStream>> {
            infos
                .iter()
                .map(|info| {
                    Arc::new(BdStream::new(
                        info.id,
                        info.kind,
                        info.node,
                        Arc::clone(transport),
                    ))
                })
                .collect()
        };
        let joiner = &plan.joiner;
        let flow = (joiner.algorithm == Algorithm::FlowJoin).then(|| FlowLink {
            small_skews: Arc::new(OneShot::new()),
            intersect: Arc::new(Mutex::new(BuildIndex::new())),
        });

        Self {
            node: plan.node,
            nodes: plan.nodes,
            algorithm: joiner.algorithm,
            grid: plan.grid,
            phase: JoinPhase::Building,
            small_input: Input::new(&joiner.small_inputs),
            big_input: Input::new(&joiner.big_inputs),
            small_fetch: fetch_streams(&joiner.small_fetch),
            big_fetch: fetch_streams(&joiner.big_fetch),
            flow,
        }
    }

    /// Make every inbound endpoint of this joiner reachable by stream id.
    pub fn register(&self, registry: &StreamRegistry) {
        for stream in self
            .small_input
            .streams()
            .iter()
            .chain(self.big_input.streams())
        {
            registry.register_input(Arc::clone(stream));
        }
        for stream in self.small_fetch.iter().chain(&self.big_fetch) {
            registry.register_fetch(Arc::clone(stream));
        }
    }

    /// Handles the flow-join big reader needs. `None` for other algorithms.
    pub fn flow_link(&self) -> Option<FlowLink> {
        self.flow.clone()
    }

    pub fn phase(&self) -> JoinPhase {
        self.phase
    }

    fn enter(&mut self, phase: JoinPhase) {
        debug!(node = self.node, from = %self.phase, to = %phase, "join phase");
        self.phase = phase;
    }

    pub fn run(mut self) -> Result<NodeStats> {
        info!(node = self.node, algorithm = %self.algorithm, "join started");

        let (index, small_skews) = self.build()?;
        self.enter(JoinPhase::Probing1);
        let mut result = 0;
        let (tallies, intersecting) = self.probe(&index, small_skews.as_ref(), &mut result)?;

        self.enter(JoinPhase::Fetching);
        for stream in &self.small_fetch {
            stream.fetch_done();
        }
        self.enter(JoinPhase::Probing2);
        result += self.merge_fetched(&tallies);

        if let Some(link) = self.flow.clone() {
            let buffered = Arc::new(std::mem::take(&mut *link.intersect.lock()));
            for stream in &self.big_fetch {
                stream.attach(Arc::clone(&buffered))?;
            }
            self.enter(JoinPhase::Probing3);
            result += self.join_intersecting(&intersecting)?;
        }

        self.enter(JoinPhase::Done);
        for stream in self.small_fetch.iter().chain(&self.big_fetch) {
            stream.close()?;
        }

        let stats = NodeStats {
            result_count: result,
            network_phase1: self.small_input.received_bytes() + self.big_input.received_bytes(),
            network_phase2: self
                .small_fetch
                .iter()
                .chain(&self.big_fetch)
                .map(|s| s.received_bytes())
                .sum(),
        };
        info!(
            node = self.node,
            results = stats.result_count,
            phase1_bytes = stats.network_phase1,
            phase2_bytes = stats.network_phase2,
            "join finished"
        );
        Ok(stats)
    }

    /// Drain the small table. Returns the index and, for flow-join, every
    /// small-table skew key announced anywhere in the cluster.
    fn build(&mut self) -> Result<(Arc<BuildIndex>, Option<HashSet<String>>)> {
        let mut index = BuildIndex::new();
        let mut skews = HashSet::new();
        let mut rows = 0usize;
        loop {
            let (keys, batch) = self.small_input.next();
            skews.extend(keys);
            if batch.is_empty() {
                break;
            }
            rows += batch.len();
            for tuple in batch {
                index.entry(tuple.key.clone()).or_default().push(tuple);
            }
        }
        debug!(
            node = self.node,
            rows,
            keys = index.len(),
            small_skews = skews.len(),
            "build finished"
        );

        let small_skews = match &self.flow {
            Some(link) => {
                link.small_skews.set(Arc::new(skews.clone()));
                Some(skews)
            }
            None => None,
        };

        let index = Arc::new(index);
        for stream in &self.small_fetch {
            stream.attach(Arc::clone(&index))?;
        }
        Ok((index, small_skews))
    }

    /// Drain the big table.
    ///
    /// Returns the per-key tallies of rows whose key is being fetched and, for
    /// flow-join, the keys skewed on both sides.
    fn probe(
        &mut self,
        index: &BuildIndex,
        small_skews: Option<&HashSet<String>>,
        result: &mut u64,
    ) -> Result<(HashMap<String, Tally>, BTreeSet<String>)> {
        let mut tallies: HashMap<String, Tally> = HashMap::new();
        let mut intersecting = BTreeSet::new();
        let mut rows = 0usize;
        loop {
            let (keys, batch) = self.big_input.next();
            for key in keys {
                if small_skews.is_some_and(|s| s.contains(&key)) {
                    intersecting.insert(key);
                    continue;
                }
                let home = home_node(&key, self.nodes);
                if home != self.node && !tallies.contains_key(&key) {
                    self.small_fetch[home].fetch_key(&key)?;
                    tallies.insert(key, Tally::default());
                }
            }
            if batch.is_empty() {
                break;
            }
            rows += batch.len();
            for tuple in batch.tuples() {
                let matches = local_matches(index, tuple);
                *result += matches;
                if let Some(tally) = tallies.get_mut(&tuple.key) {
                    tally.rows += 1;
                    tally.local_matches += matches;
                }
            }
        }
        debug!(
            node = self.node,
            rows,
            fetching = tallies.len(),
            intersecting = intersecting.len(),
            matches = *result,
            "probe finished"
        );
        Ok((tallies, intersecting))
    }

    /// Matches contributed by fetched build rows, net of those already
    /// counted locally.
    fn merge_fetched(&self, tallies: &HashMap<String, Tally>) -> u64 {
        let mut added = 0u64;
        let mut fetched_keys = 0usize;
        for stream in &self.small_fetch {
            while let Some((key, rows)) = stream.collect() {
                fetched_keys += 1;
                if let Some(tally) = tallies.get(&key) {
                    added += tally.rows * rows.len() as u64 - tally.local_matches;
                }
            }
        }
        debug!(node = self.node, fetched_keys, matches = added, "fetched rows merged");
        added
    }

    /// Cross product of the grid-row small rows and grid-column big rows of
    /// every intersecting key.
    fn join_intersecting(&self, keys: &BTreeSet<String>) -> Result<u64> {
        let row = self.grid.row_members(self.node);
        let col = self.grid.col_members(self.node);
        for key in keys {
            for &peer in &row {
                self.small_fetch[peer].fetch_key(key)?;
            }
            for &peer in &col {
                self.big_fetch[peer].fetch_key(key)?;
            }
        }

        let mut small: HashMap<String, u64> = HashMap::new();
        let mut big: HashMap<String, u64> = HashMap::new();
        for (streams, counts) in [(&self.small_fetch, &mut small), (&self.big_fetch, &mut big)] {
            for stream in streams {
                stream.fetch_done();
                while let Some((key, rows)) = stream.collect() {
                    *counts.entry(key).or_default() += rows.len() as u64;
                }
            }
        }

        let matches: u64 = keys
            .iter()
            .map(|k| small.get(k).copied().unwrap_or(0) * big.get(k).copied().unwrap_or(0))
            .sum();
        debug!(
            node = self.node,
            keys = keys.len(),
            grid_row = ?row,
            grid_col = ?col,
            matches,
            "intersecting keys joined"
        );
        Ok(matches)
    }
}

fn local_matches(index: &BuildIndex, tuple: &Tuple) -> u64 {
    index.get(&tuple.key).map_or(0, |rows| rows.len() as u64)
}
