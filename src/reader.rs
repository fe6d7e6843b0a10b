//! Table readers.
//!
//! A [`TableReader`] loads one partition file and pushes every row through
//! its node's [`Output`], choosing per row between a skew router and a plain
//! hash router according to its [`Distribution`].

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::SkewConfig;
use crate::exchange::Output;
use crate::fetch::BuildIndex;
use crate::histogram::SkewHistogram;
use crate::message::Envelope;
use crate::plan::{Distribution, ReaderPlan};
use crate::queue::OneShot;
use crate::router::Router;
use crate::service::{SKETCH_COORDINATOR, SkewSet};
use crate::storage::{self, Table};
use crate::transport::Transport;
use crate::{Error, NodeId, Result, Tuple};

/// What the flow-join big-table reader shares with its node's joiner.
#[derive(Clone)]
pub struct FlowLink {
    /// Small-table skew keys, published by the joiner after its build phase.
    pub small_skews: Arc<OneShot<SkewSet>>,
    /// Rows of intersecting skew keys, served later over the big fetch streams.
    pub intersect: Arc<Mutex<BuildIndex>>,
}

/// Counters reported when a reader finishes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReaderStats {
    pub rows: u64,
    pub skewed: u64,
}

pub struct TableReader {
    node: NodeId,
    table: Table,
    partition: PathBuf,
    distribution: Distribution,
    skew: SkewConfig,
    output: Output,
    transport: Arc<dyn Transport>,
    flow: Option<FlowLink>,
    sketch_result: Option<Arc<OneShot<SkewSet>>>,
}

impl TableReader {
    pub fn new(
        node: NodeId,
        plan: &ReaderPlan,
        skew: &SkewConfig,
        output: Output,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            node,
            table: plan.table,
            partition: plan.partition.clone(),
            distribution: plan.distribution,
            skew: skew.clone(),
            output,
            transport,
            flow: None,
            sketch_result: None,
        }
    }

    /// Required for [`Distribution::FlowBig`].
    pub fn with_flow_link(mut self, link: FlowLink) -> Self {
        self.flow = Some(link);
        self
    }

    /// Required for [`Distribution::LdSketch`].
    pub fn with_sketch_result(mut self, result: Arc<OneShot<SkewSet>>) -> Self {
        self.sketch_result = Some(result);
        self
    }

    pub fn table(&self) -> Table {
        self.table
    }

    /// Read the partition and route every row.
    ///
    /// End markers go out even when reading fails, so downstream joiners
    /// always terminate.
    pub fn run(mut self) -> Result<ReaderStats> {
        info!(
            node = self.node,
            table = self.table.file_name(),
            distribution = ?self.distribution,
            "reader started"
        );
        let result = self.route();
        let finished = self.output.finish();
        let stats = result?;
        finished?;
        info!(
            node = self.node,
            table = self.table.file_name(),
            rows = stats.rows,
            skewed = stats.skewed,
            "reader finished"
        );
        Ok(stats)
    }

    fn route(&mut self) -> Result<ReaderStats> {
        let rows = match storage::read_partition(&self.partition) {
            Ok(rows) => rows,
            Err(err) => {
                // Peers would otherwise wait for this node's report forever.
                if self.distribution == Distribution::LdSketch {
                    self.report_sketch(Vec::new())?;
                }
                return Err(err);
            }
        };
        let nodes = self.output.nodes();

        match self.distribution {
            Distribution::Hash => {
                let mut hash = Router::hash(nodes);
                for tuple in &rows {
                    self.output.send(tuple, &mut hash, false)?;
                }
                Ok(ReaderStats {
                    rows: rows.len() as u64,
                    skewed: 0,
                })
            }
            Distribution::KeepLocal => {
                self.route_sampled(&rows, Router::keep_local(self.node, nodes))
            }
            Distribution::Average => self.route_sampled(&rows, Router::average(nodes)),
            Distribution::Balance => {
                self.route_sampled(&rows, Router::balance(nodes, &self.skew))
            }
            Distribution::FlowSmall => {
                self.route_sampled(&rows, Router::keep_local_notify_all(self.node, nodes))
            }
            Distribution::LdSketch => self.route_ld_sketch(rows),
            Distribution::FlowBig => self.route_flow_big(&rows),
        }
    }

    /// Skewed rows through `skew_router`, the rest by hash.
    fn route_sampled(&mut self, rows: &[Tuple], mut skew_router: Router) -> Result<ReaderStats> {
        let mut histogram = SkewHistogram::for_partition(&self.skew, &self.partition)?;
        let mut hash = Router::hash(self.output.nodes());
        let mut skewed = 0;
        for tuple in rows {
            if histogram.sample(&tuple.key) {
                skewed += 1;
                self.output.send(tuple, &mut skew_router, true)?;
            } else {
                self.output.send(tuple, &mut hash, false)?;
            }
        }
        Ok(ReaderStats {
            rows: rows.len() as u64,
            skewed,
        })
    }

    /// Agree on a global skew set with every other node, then re-read the
    /// partition and balance the rows of that set.
    fn route_ld_sketch(&mut self, rows: Vec<Tuple>) -> Result<ReaderStats> {
        let local = match self.local_skews(&rows) {
            Ok(keys) => keys,
            Err(err) => {
                self.report_sketch(Vec::new())?;
                return Err(err);
            }
        };
        debug!(node = self.node, local_skews = local.len(), "reporting local skew keys");
        self.report_sketch(local)?;

        let global = self
            .sketch_result
            .as_ref()
            .ok_or_else(|| Error::Plan("ld-sketch reader without sketch result".into()))?
            .wait();
        debug!(node = self.node, global_skews = global.len(), "received global skew keys");
        drop(rows);

        let rows = storage::read_partition(&self.partition)?;
        let nodes = self.output.nodes();
        let mut balance = Router::balance(nodes, &self.skew);
        let mut hash = Router::hash(nodes);
        let mut skewed = 0;
        for tuple in &rows {
            if global.contains(&tuple.key) {
                skewed += 1;
                self.output.send(tuple, &mut balance, true)?;
            } else {
                self.output.send(tuple, &mut hash, false)?;
            }
        }
        Ok(ReaderStats {
            rows: rows.len() as u64,
            skewed,
        })
    }

    /// Distinct keys the histogram flags over the whole partition.
    fn local_skews(&self, rows: &[Tuple]) -> Result<Vec<String>> {
        let mut histogram = SkewHistogram::for_partition(&self.skew, &self.partition)?;
        let keys: HashSet<&str> = rows
            .iter()
            .filter(|t| histogram.sample(&t.key))
            .map(|t| t.key.as_str())
            .collect();
        Ok(keys.into_iter().map(str::to_string).collect())
    }

    fn report_sketch(&self, keys: Vec<String>) -> Result<()> {
        let report = Envelope::SketchReport {
            from: self.node,
            keys,
        };
        self.transport.send(SKETCH_COORDINATOR, &report)?;
        Ok(())
    }

    /// Flow-join big table. Split on (big-table skew, small-table skew):
    ///
    /// | big skew | small skew | action |
    /// |---|---|---|
    /// | yes | yes | announce everywhere, keep for the grid phase |
    /// | yes | no  | keep local, announce everywhere |
    /// | no  | yes | mirror to every node |
    /// | no  | no  | hash |
    fn route_flow_big(&mut self, rows: &[Tuple]) -> Result<ReaderStats> {
        let link = self
            .flow
            .clone()
            .ok_or_else(|| Error::Plan("flow-join big reader without joiner link".into()))?;
        let small_skews = link.small_skews.wait();
        debug!(node = self.node, small_skews = small_skews.len(), "received small-table skews");

        let nodes = self.output.nodes();
        let mut histogram = SkewHistogram::for_partition(&self.skew, &self.partition)?;
        let mut notify_only = Router::notify_only(nodes);
        let mut keep_local = Router::keep_local_notify_all(self.node, nodes);
        let mut mirror = Router::mirror(nodes);
        let mut hash = Router::hash(nodes);
        let mut skewed = 0;

        for tuple in rows {
            let in_small = small_skews.contains(&tuple.key);
            if histogram.sample(&tuple.key) {
                skewed += 1;
                if in_small {
                    self.output.send(tuple, &mut notify_only, true)?;
                    link.intersect
                        .lock()
                        .entry(tuple.key.clone())
                        .or_default()
                        .push(tuple.clone());
                } else {
                    self.output.send(tuple, &mut keep_local, true)?;
                }
            } else if in_small {
                self.output.send(tuple, &mut mirror, false)?;
            } else {
                self.output.send(tuple, &mut hash, false)?;
            }
        }
        Ok(ReaderStats {
            rows: rows.len() as u64,
            skewed,
        })
    }
}
