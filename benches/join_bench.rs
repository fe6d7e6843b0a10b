//! Skew-handling benchmarks.
//!
//! Measures:
//!   - Histogram sampling throughput for static and dynamic detection
//!   - Router placement cost (hash, round robin, adaptive balance)
//!   - Build/probe throughput of the join index under varying selectivity
//!   - End-to-end in-process cluster runs for every algorithm
//!
//! Workloads are seeded with ChaCha8 so runs are comparable. A skewed stream
//! draws `skew` of its keys from ten hot keys, the rest uniformly.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use std::collections::HashMap;
use std::hint::black_box;
use std::time::Duration;

use skewjoin::Tuple;
use skewjoin::balance::NodeStatistic;
use skewjoin::cluster::Cluster;
use skewjoin::config::{Config, SkewConfig};
use skewjoin::fetch::BuildIndex;
use skewjoin::histogram::SkewHistogram;
use skewjoin::plan::Algorithm;
use skewjoin::router::Router;
use skewjoin::storage;

// How long to record measurements for.
const MEASURE_DURATION_SECS: u64 = 10;

const HOT_KEYS: u32 = 10;

struct SkewedWorkload {
    tuples: Vec<Tuple>,
    label: String,
}

impl SkewedWorkload {
    /// - `count`: number of tuples
    /// - `distinct`: size of the uniform key space
    /// - `skew`: fraction of tuples carrying one of the hot keys
    fn generate(count: usize, distinct: u32, skew: f64, seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let hot = (count as f64 * skew) as usize;

        let mut tuples = Vec::with_capacity(count);
        for i in 0..count {
            let key = if i < hot {
                // Hot key `h` gets a share proportional to `h + 1`.
                let h = rng.random_range(0..HOT_KEYS * (HOT_KEYS + 1) / 2);
                let mut acc = 0;
                let mut pick = 0;
                for k in 0..HOT_KEYS {
                    acc += k + 1;
                    if h < acc {
                        pick = k;
                        break;
                    }
                }
                format!("hot{pick}")
            } else {
                rng.random_range(0..distinct).to_string()
            };
            tuples.push(Tuple::new(key, i.to_string()));
        }
        tuples.shuffle(&mut rng);

        Self {
            tuples,
            label: format!("n={count}/distinct={distinct}/skew={skew}"),
        }
    }

    fn static_skews(&self) -> HashMap<String, u64> {
        let mut skews = HashMap::new();
        for t in &self.tuples {
            if t.key.starts_with("hot") {
                *skews.entry(t.key.clone()).or_default() += 1;
            }
        }
        skews
    }
}

fn bench_histogram(c: &mut Criterion) {
    let mut group = c.benchmark_group("histogram_sample");
    group.measurement_time(Duration::from_secs(MEASURE_DURATION_SECS));

    for &skew in &[0.0, 0.2, 0.5, 0.8] {
        let workload = SkewedWorkload::generate(200_000, 1_000_000, skew, 42);
        group.throughput(Throughput::Elements(workload.tuples.len() as u64));

        for &capacity in &[32, 100, 1_000] {
            group.bench_with_input(
                BenchmarkId::new(format!("dynamic/cap={capacity}"), &workload.label),
                &workload.tuples,
                |b, tuples| {
                    b.iter(|| {
                        let mut histogram = SkewHistogram::dynamic(capacity, 0.01);
                        tuples
                            .iter()
                            .filter(|t| histogram.sample(black_box(&t.key)))
                            .count()
                    })
                },
            );
        }

        let skews = workload.static_skews();
        group.bench_with_input(
            BenchmarkId::new("static", &workload.label),
            &workload.tuples,
            |b, tuples| {
                b.iter(|| {
                    let mut histogram = SkewHistogram::from_static(skews.clone());
                    tuples
                        .iter()
                        .filter(|t| histogram.sample(black_box(&t.key)))
                        .count()
                })
            },
        );
    }

    group.finish();
}

fn route_all(router: &mut Router, tuples: &[Tuple], nodes: usize) -> u64 {
    let mut stats = NodeStatistic::new(nodes);
    let mut sent = 0u64;
    for t in tuples {
        for node in router.distribute(t, &stats) {
            stats.increment(node);
            sent += 1;
        }
        sent += router.notify(t).len() as u64;
    }
    sent
}

fn bench_routers(c: &mut Criterion) {
    let mut group = c.benchmark_group("router_distribute");
    group.measurement_time(Duration::from_secs(MEASURE_DURATION_SECS));

    // Only hot keys: every tuple takes the skew path.
    let workload = SkewedWorkload::generate(200_000, 1, 1.0, 7);
    group.throughput(Throughput::Elements(workload.tuples.len() as u64));
    let skew = SkewConfig {
        update_frequency: 256,
        ..SkewConfig::default()
    };

    for &nodes in &[4usize, 16, 64] {
        group.bench_with_input(BenchmarkId::new("hash", nodes), &workload.tuples, |b, tuples| {
            b.iter(|| route_all(&mut Router::hash(nodes), black_box(tuples), nodes))
        });
        group.bench_with_input(
            BenchmarkId::new("average", nodes),
            &workload.tuples,
            |b, tuples| b.iter(|| route_all(&mut Router::average(nodes), black_box(tuples), nodes)),
        );
        group.bench_with_input(
            BenchmarkId::new("balance", nodes),
            &workload.tuples,
            |b, tuples| {
                b.iter(|| route_all(&mut Router::balance(nodes, &skew), black_box(tuples), nodes))
            },
        );
    }

    group.finish();
}

fn build_index(tuples: &[Tuple]) -> BuildIndex {
    let mut index = BuildIndex::with_capacity(tuples.len());
    for t in tuples {
        index.entry(t.key.clone()).or_default().push(t.clone());
    }
    index
}

fn probe(index: &BuildIndex, tuples: &[Tuple]) -> u64 {
    tuples
        .iter()
        .map(|t| index.get(&t.key).map_or(0, |rows| rows.len() as u64))
        .sum()
}

fn bench_build_probe(c: &mut Criterion) {
    let mut group = c.benchmark_group("build_probe");
    group.measurement_time(Duration::from_secs(MEASURE_DURATION_SECS));

    let build = SkewedWorkload::generate(100_000, 100_000, 0.1, 1);
    group.throughput(Throughput::Elements(build.tuples.len() as u64));
    group.bench_with_input(BenchmarkId::new("build", &build.label), &build.tuples, |b, t| {
        b.iter(|| build_index(black_box(t)))
    });

    let index = build_index(&build.tuples);
    // A wider key space on the probe side lowers the hit rate.
    for &distinct in &[100_000u32, 1_000_000, 10_000_000] {
        let workload = SkewedWorkload::generate(1_000_000, distinct, 0.1, 2);
        group.throughput(Throughput::Elements(workload.tuples.len() as u64));
        group.bench_with_input(
            BenchmarkId::new("probe", &workload.label),
            &workload.tuples,
            |b, t| b.iter(|| probe(&index, black_box(t))),
        );
    }

    group.finish();
}

fn bench_cluster(c: &mut Criterion) {
    let mut group = c.benchmark_group("cluster_run");
    group.measurement_time(Duration::from_secs(MEASURE_DURATION_SECS));
    group.sample_size(10);

    let dir = tempfile::tempdir().expect("temp dir");
    let mut config = Config::for_nodes(4);
    config.data.dir = dir.path().to_path_buf();
    config.data.small_table_size = 20_000;
    config.data.big_table_size = 60_000;
    config.data.small_skew_degree = 0.3;
    config.data.big_skew_degree = 0.5;
    storage::generate(&config.data, 4).expect("dataset");
    group.throughput(Throughput::Elements(
        (config.data.small_table_size + config.data.big_table_size) as u64,
    ));

    for algorithm in Algorithm::ALL {
        group.bench_with_input(
            BenchmarkId::new("algorithm", algorithm),
            &config,
            |b, config| {
                b.iter(|| {
                    Cluster::new(config)
                        .run(algorithm)
                        .expect("join")
                        .result_count()
                })
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_histogram,
    bench_routers,
    bench_build_probe,
    bench_cluster,
);
criterion_main!(benches);
