//! Partition files on local disk.
//!
//! Layout: `<dir>/<nodes>_<small>_<sdeg>_<big>_<bdeg>/<node>/{small,big}`, one
//! record per line as `key,value` or `key value`. A partition may have a
//! `<partition>.skew` side file of `key,count` lines for static skew mode.

use std::collections::HashMap;
use std::fs;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::DataConfig;
use crate::{Error, Result, Tuple};

/// Keys made hot by the generator.
pub const HOT_KEYS: std::ops::Range<u32> = 222_320..222_330;

/// Upper bound of uniformly drawn keys and values.
const KEY_SPACE: u32 = 10_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Table {
    Small,
    Big,
}

impl Table {
    pub fn file_name(self) -> &'static str {
        match self {
            Table::Small => "small",
            Table::Big => "big",
        }
    }
}

/// Read every record of a partition file in order.
pub fn read_partition(path: &Path) -> Result<Vec<Tuple>> {
    let file = fs::File::open(path).map_err(|e| Error::io(path, e))?;
    let mut tuples = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| Error::io(path, e))?;
        if line.is_empty() {
            continue;
        }
        let split = line.find(',').or_else(|| line.find(' '));
        let Some(at) = split else {
            return Err(Error::MalformedRecord {
                path: path.to_path_buf(),
                line: idx + 1,
            });
        };
        tuples.push(Tuple::new(&line[..at], &line[at + 1..]));
    }
    Ok(tuples)
}

pub fn skew_path(partition: &Path) -> PathBuf {
    let mut name = partition.as_os_str().to_owned();
    name.push(".skew");
    PathBuf::from(name)
}

/// Read a `key,count` skew side file.
pub fn read_skew_file(path: &Path) -> Result<HashMap<String, u64>> {
    let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    let mut skews = HashMap::new();
    for (idx, line) in text.lines().enumerate() {
        if line.is_empty() {
            continue;
        }
        let malformed = || Error::MalformedRecord {
            path: path.to_path_buf(),
            line: idx + 1,
        };
        let (key, count) = line.split_once(',').ok_or_else(malformed)?;
        let count = count.trim().parse().map_err(|_| malformed())?;
        skews.insert(key.to_string(), count);
    }
    Ok(skews)
}

/// Where a dataset lives for a given shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLayout {
    root: PathBuf,
    nodes: usize,
}

impl DataLayout {
    pub fn new(config: &DataConfig, nodes: usize) -> Self {
        let name = format!(
            "{}_{}_{}_{}_{}",
            nodes,
            config.small_table_size,
            format_degree(config.small_skew_degree),
            config.big_table_size,
            format_degree(config.big_skew_degree),
        );
        Self {
            root: config.dir.join(name),
            nodes,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn nodes(&self) -> usize {
        self.nodes
    }

    pub fn partition_path(&self, node: usize, table: Table) -> PathBuf {
        self.root.join(node.to_string()).join(table.file_name())
    }

    /// Pre-flight check. Logs and returns every missing partition file.
    pub fn check(&self) -> Vec<PathBuf> {
        let mut missing = Vec::new();
        for node in 0..self.nodes {
            for table in [Table::Small, Table::Big] {
                let path = self.partition_path(node, table);
                if !path.is_file() {
                    warn!(path = %path.display(), "partition file does not exist");
                    missing.push(path);
                }
            }
        }
        if !missing.is_empty() {
            warn!(missing = missing.len(), "file check failed, data files are incomplete");
        }
        missing
    }
}

/// `0.5` -> `"0.5"`: six decimals with trailing zeros removed.
fn format_degree(degree: f64) -> String {
    format!("{degree:.6}").trim_end_matches('0').to_string()
}

/// Write a synthetic dataset for `nodes` nodes and return its layout.
pub fn generate(config: &DataConfig, nodes: usize) -> Result<DataLayout> {
    let layout = DataLayout::new(config, nodes);
    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);

    for (table, size, degree) in [
        (Table::Small, config.small_table_size, config.small_skew_degree),
        (Table::Big, config.big_table_size, config.big_skew_degree),
    ] {
        let rows = synthesize(&mut rng, size, degree)?;
        info!(table = table.file_name(), rows = rows.len(), "generated data");
        write_partitions(&layout, table, &rows)?;
    }
    Ok(layout)
}

/// Uniform rows with `degree` of them rewritten onto [`HOT_KEYS`], the i-th
/// hot key taking an `(i + 1) / 55` share.
fn synthesize(rng: &mut ChaCha8Rng, size: usize, degree: f64) -> Result<Vec<Tuple>> {
    if size == 0 {
        return Err(Error::EmptyDataset);
    }
    let mut rows: Vec<Tuple> = (0..size)
        .map(|_| {
            Tuple::new(
                rng.random_range(0..=KEY_SPACE).to_string(),
                rng.random_range(0..=KEY_SPACE).to_string(),
            )
        })
        .collect();

    let skew_size = (size as f64 * degree) as usize;
    let mut at = 0;
    for (i, key) in HOT_KEYS.enumerate() {
        let share = ((skew_size as f64 * (i + 1) as f64 / 55.0) as usize).min(size - at);
        let key = key.to_string();
        for row in &mut rows[at..at + share] {
            row.key.clone_from(&key);
        }
        at += share;
    }
    Ok(rows)
}

/// Deal `rows` round robin to the nodes, each with its `.skew` side file.
fn write_partitions(layout: &DataLayout, table: Table, rows: &[Tuple]) -> Result<()> {
    let nodes = layout.nodes();
    for node in 0..nodes {
        let path = layout.partition_path(node, table);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;
        }

        let file = fs::File::create(&path).map_err(|e| Error::io(&path, e))?;
        let mut out = BufWriter::new(file);
        let mut hot: HashMap<&str, u64> = HashMap::new();
        let mut count = 0usize;
        for row in rows.iter().skip(node).step_by(nodes) {
            writeln!(out, "{} {}", row.key, row.value).map_err(|e| Error::io(&path, e))?;
            if row
                .key
                .parse::<u32>()
                .is_ok_and(|k| HOT_KEYS.contains(&k))
            {
                *hot.entry(row.key.as_str()).or_default() += 1;
            }
            count += 1;
        }
        out.flush().map_err(|e| Error::io(&path, e))?;

        let skew = skew_path(&path);
        let mut side = String::new();
        let mut hot: Vec<_> = hot.into_iter().collect();
        hot.sort_unstable();
        for (key, n) in hot {
            side.push_str(&format!("{key},{n}\n"));
        }
        fs::write(&skew, side).map_err(|e| Error::io(&skew, e))?;

        info!(path = %path.display(), rows = count, "wrote partition");
    }
    Ok(())
}
