//! In-process cluster runner.
//!
//! [`Cluster`] plays the gateway: it checks the dataset, generates one plan
//! per node, wires every node to a shared [`MeshTransport`] and runs each
//! node's service, readers and joiner on their own threads. Every endpoint is
//! registered before the first reader starts, so no frame can reach a stream
//! that doesn't exist yet.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, ScopedJoinHandle};
use std::time::{Duration, Instant};

use tracing::{error, info};

use crate::config::Config;
use crate::exchange::{OutStream, Output};
use crate::joiner::{HashJoiner, NodeStats};
use crate::message::Envelope;
use crate::plan::{self, Algorithm, Distribution, NodePlan, ReaderPlan, StreamKind};
use crate::reader::TableReader;
use crate::service::{NodeService, StreamRegistry};
use crate::storage::DataLayout;
use crate::transport::{MeshTransport, Transport};
use crate::{Error, Result};

/// Aggregate of one run over every node.
#[derive(Debug, Clone)]
pub struct ClusterStats {
    pub algorithm: Algorithm,
    pub nodes: Vec<NodeStats>,
    pub elapsed: Duration,
}

impl ClusterStats {
    pub fn result_count(&self) -> u64 {
        self.nodes.iter().map(|n| n.result_count).sum()
    }

    pub fn network_phase1(&self) -> u64 {
        self.nodes.iter().map(|n| n.network_phase1).sum()
    }

    pub fn network_phase2(&self) -> u64 {
        self.nodes.iter().map(|n| n.network_phase2).sum()
    }

    pub fn network(&self) -> u64 {
        self.network_phase1() + self.network_phase2()
    }

    /// Millions of result rows per second.
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.result_count() as f64 / 1_000_000.0 / secs
    }
}

pub struct Cluster<'a> {
    config: &'a Config,
    layout: DataLayout,
}

impl<'a> Cluster<'a> {
    pub fn new(config: &'a Config) -> Self {
        let layout = DataLayout::new(&config.data, config.node_count());
        Self { config, layout }
    }

    pub fn layout(&self) -> &DataLayout {
        &self.layout
    }

    /// Missing partition files, each logged.
    pub fn check(&self) -> Vec<PathBuf> {
        self.layout.check()
    }

    /// Run `algorithm` to completion on every node.
    pub fn run(&self, algorithm: Algorithm) -> Result<ClusterStats> {
        let missing = self.check();
        if !missing.is_empty() {
            return Err(Error::MissingPartitions(missing.len()));
        }

        let nodes = self.layout.nodes();
        let plans = plan::generate(algorithm, &self.layout, nodes, self.config.skew.ld_sketch)?;
        let mesh = Arc::new(MeshTransport::new(nodes));
        let transport: Arc<dyn Transport> = mesh.clone();

        let registries: Vec<Arc<StreamRegistry>> =
            (0..nodes).map(|_| Arc::new(StreamRegistry::new())).collect();
        let mut joiners = Vec::with_capacity(nodes);
        for plan in &plans {
            let joiner = HashJoiner::new(plan, &transport);
            joiner.register(&registries[plan.node]);
            joiners.push(joiner);
        }

        let mut services = Vec::with_capacity(nodes);
        let mut readers = Vec::with_capacity(nodes * 2);
        for (plan, joiner) in plans.iter().zip(&joiners) {
            let service = NodeService::new(
                plan.node,
                Arc::clone(&registries[plan.node]),
                Arc::clone(&transport),
            );
            readers.extend(self.readers(plan, &registries[plan.node], &transport, &service, joiner)?);
            services.push((service, mesh.inbox(plan.node)?));
        }
        info!(%algorithm, nodes, "all nodes wired, starting processors");

        let start = Instant::now();
        let (read, joined) = thread::scope(|s| {
            for (service, inbox) in &services {
                s.spawn(move || service.run(inbox));
            }
            let readers: Vec<_> = readers
                .into_iter()
                .map(|reader| s.spawn(move || reader.run()))
                .collect();
            let joiners: Vec<_> = joiners
                .into_iter()
                .map(|joiner| s.spawn(move || joiner.run()))
                .collect();

            let read: Vec<_> = readers.into_iter().map(join_worker).collect();
            let joined: Vec<_> = joiners.into_iter().map(join_worker).collect();
            for node in 0..nodes {
                if let Err(err) = transport.send(node, &Envelope::Shutdown) {
                    error!(node, error = %err, "failed to stop node service");
                }
            }
            (read, joined)
        });
        let elapsed = start.elapsed();
        for registry in &registries {
            registry.clear();
        }

        for outcome in read {
            outcome?;
        }
        let stats = ClusterStats {
            algorithm,
            nodes: joined.into_iter().collect::<Result<_>>()?,
            elapsed,
        };
        let network = stats.network();
        info!(
            %algorithm,
            results = stats.result_count(),
            shuffle_bytes = stats.network_phase1(),
            fetch_bytes = stats.network_phase2(),
            network_bytes = network,
            network_kb = %format!("{:.2}", network as f64 / 1024.0),
            network_mb = %format!("{:.2}", network as f64 / (1024.0 * 1024.0)),
            seconds = %format!("{:.3}", elapsed.as_secs_f64()),
            throughput_m_per_s = %format!("{:.2}", stats.throughput()),
            "distributed hash join finished"
        );
        Ok(stats)
    }

    /// Small and big reader of `plan`'s node, with outputs resolved against
    /// the already registered inputs.
    fn readers(
        &self,
        plan: &NodePlan,
        registry: &StreamRegistry,
        transport: &Arc<dyn Transport>,
        service: &NodeService,
        joiner: &HashJoiner,
    ) -> Result<[TableReader; 2]> {
        let build = |reader_plan: &ReaderPlan| -> Result<TableReader> {
            let streams = reader_plan
                .outputs
                .iter()
                .map(|info| match info.kind {
                    StreamKind::Local => Ok(OutStream::local(registry.input(info.id)?)),
                    StreamKind::Remote => Ok(OutStream::remote(
                        info.id,
                        info.node,
                        Arc::clone(transport),
                    )),
                })
                .collect::<Result<Vec<_>>>()?;
            let reader = TableReader::new(
                plan.node,
                reader_plan,
                &self.config.skew,
                Output::new(streams),
                Arc::clone(transport),
            );
            Ok(match reader_plan.distribution {
                Distribution::FlowBig => {
                    let link = joiner.flow_link().ok_or_else(|| {
                        Error::Plan("flow-join reader on a non flow-join node".into())
                    })?;
                    reader.with_flow_link(link)
                }
                Distribution::LdSketch => reader.with_sketch_result(service.sketch_result()),
                _ => reader,
            })
        };
        Ok([build(&plan.small_reader)?, build(&plan.big_reader)?])
    }
}

fn join_worker<T>(handle: ScopedJoinHandle<'_, Result<T>>) -> Result<T> {
    handle
        .join()
        .unwrap_or_else(|panic| std::panic::resume_unwind(panic))
}
