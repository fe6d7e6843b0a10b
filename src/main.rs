use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::info;

use skewjoin::cluster::Cluster;
use skewjoin::config::Config;
use skewjoin::plan::Algorithm;
use skewjoin::{logging, storage};

#[derive(Debug, Parser)]
#[command(name = "skewjoin", about = "Skew-aware distributed equi-join")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Join the configured dataset on an in-process cluster.
    Run {
        #[arg(short, long)]
        config: PathBuf,

        /// Overrides `join.algorithm`.
        #[arg(short, long, value_enum)]
        algorithm: Option<Algorithm>,

        /// Suffix of the log file when `log.file` is set.
        #[arg(long, default_value = "gateway")]
        node_log: String,
    },
    /// Write a synthetic dataset for the configured cluster.
    Generate {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Verify every partition file exists.
    Check {
        #[arg(short, long)]
        config: PathBuf,
    },
}

fn load(path: &Path, node_tag: &str) -> Result<Config> {
    let config = Config::load(path)
        .with_context(|| format!("failed to load config {}", path.display()))?;
    logging::init(&config.log, node_tag);
    Ok(config)
}

fn main() -> Result<()> {
    match Cli::parse().command {
        Command::Run {
            config,
            algorithm,
            node_log,
        } => {
            let config = load(&config, &node_log)?;
            let algorithm = algorithm.unwrap_or(config.join.algorithm);
            let stats = Cluster::new(&config)
                .run(algorithm)
                .with_context(|| format!("{algorithm} join failed"))?;
            println!(
                "{algorithm}: {} results, {} shuffle bytes, {} fetch bytes, {:.3} s, {:.2} M/s",
                stats.result_count(),
                stats.network_phase1(),
                stats.network_phase2(),
                stats.elapsed.as_secs_f64(),
                stats.throughput(),
            );
        }
        Command::Generate { config } => {
            let config = load(&config, "generate")?;
            let layout = storage::generate(&config.data, config.node_count())
                .context("failed to generate dataset")?;
            info!(root = %layout.root().display(), "dataset ready");
        }
        Command::Check { config } => {
            let config = load(&config, "check")?;
            let missing = Cluster::new(&config).check();
            if !missing.is_empty() {
                bail!("{} partition files are missing", missing.len());
            }
            println!("all partition files present");
        }
    }
    Ok(())
}
