//! Typed run configuration.
//!
//! Loaded once from TOML and validated up front, then passed by reference to
//! every component that needs a knob.
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::plan::Algorithm;
use crate::{Error, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub join: JoinConfig,
    #[serde(default)]
    pub skew: SkewConfig,
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    /// Listen address of every node; the node count is the length.
    pub nodes: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JoinConfig {
    #[serde(default)]
    pub algorithm: Algorithm,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SkewConfig {
    pub histogram_capacity: usize,
    pub frequency_threshold: f64,
    pub dynamic_detect: bool,
    pub balance_factor: f64,
    pub update_frequency: u64,
    pub ld_sketch: bool,
}

impl Default for SkewConfig {
    fn default() -> Self {
        Self {
            histogram_capacity: 100,
            frequency_threshold: 0.01,
            dynamic_detect: true,
            balance_factor: 0.1,
            update_frequency: 1000,
            ld_sketch: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DataConfig {
    pub dir: PathBuf,
    pub small_table_size: usize,
    pub big_table_size: usize,
    pub small_skew_degree: f64,
    pub big_skew_degree: f64,
    pub seed: u64,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("resource"),
            small_table_size: 1_000_000,
            big_table_size: 3_000_000,
            small_skew_degree: 0.5,
            big_skew_degree: 0.5,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    pub level: String,
    /// Per-node log file prefix; stderr when unset.
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(text).map_err(|e| Error::Config(e.message().to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Config for `nodes` in-process nodes with default knobs.
    pub fn for_nodes(nodes: usize) -> Self {
        Self {
            cluster: ClusterConfig {
                nodes: (0..nodes).map(|i| format!("127.0.0.1:{}", 50051 + i)).collect(),
            },
            join: JoinConfig::default(),
            skew: SkewConfig::default(),
            data: DataConfig::default(),
            log: LogConfig::default(),
        }
    }

    pub fn node_count(&self) -> usize {
        self.cluster.nodes.len()
    }

    pub fn validate(&self) -> Result<()> {
        if self.cluster.nodes.is_empty() {
            return Err(Error::Config("cluster.nodes must not be empty".into()));
        }
        self.skew.validate()?;
        let data = &self.data;
        for (name, degree) in [
            ("small_skew_degree", data.small_skew_degree),
            ("big_skew_degree", data.big_skew_degree),
        ] {
            if !(0.0..1.0).contains(&degree) {
                return Err(Error::Config(format!("data.{name} must be in [0, 1)")));
            }
        }
        Ok(())
    }
}

impl SkewConfig {
    pub fn validate(&self) -> Result<()> {
        if self.histogram_capacity == 0 {
            return Err(Error::Config("skew.histogram_capacity must be positive".into()));
        }
        if !(self.frequency_threshold > 0.0 && self.frequency_threshold <= 1.0) {
            return Err(Error::Config(
                "skew.frequency_threshold must be in (0, 1]".into(),
            ));
        }
        if !(self.balance_factor >= 0.0 && self.balance_factor < 1.0) {
            return Err(Error::Config("skew.balance_factor must be in [0, 1)".into()));
        }
        if self.update_frequency == 0 {
            return Err(Error::Config("skew.update_frequency must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_file() {
        let config = Config::from_toml_str(
            r#"
            [cluster]
            nodes = ["10.0.0.1:50051", "10.0.0.2:50051", "10.0.0.3:50051"]

            [join]
            algorithm = "flow-join"

            [skew]
            histogram_capacity = 64
            frequency_threshold = 0.05
            dynamic_detect = false
            balance_factor = 0.2
            update_frequency = 10
            ld_sketch = true

            [data]
            dir = "/tmp/data"
            small_table_size = 10
            big_table_size = 30
            small_skew_degree = 0.3
            big_skew_degree = 0.6

            [log]
            level = "debug"
            file = "logs/skewjoin"
            "#,
        )
        .unwrap();

        assert_eq!(config.node_count(), 3);
        assert_eq!(config.join.algorithm, Algorithm::FlowJoin);
        assert_eq!(config.skew.histogram_capacity, 64);
        assert!(!config.skew.dynamic_detect);
        assert!(config.skew.ld_sketch);
        assert_eq!(config.data.big_table_size, 30);
        assert_eq!(config.log.file, Some(PathBuf::from("logs/skewjoin")));
    }

    #[test]
    fn defaults_fill_missing_sections() {
        let config = Config::from_toml_str("[cluster]\nnodes = [\"a:1\"]\n").unwrap();
        assert_eq!(config.join.algorithm, Algorithm::Base);
        assert_eq!(config.skew.histogram_capacity, 100);
        assert!(config.skew.dynamic_detect);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn rejects_bad_values() {
        assert!(Config::from_toml_str("[cluster]\nnodes = []\n").is_err());
        assert!(
            Config::from_toml_str(
                "[cluster]\nnodes = [\"a:1\"]\n[skew]\nfrequency_threshold = 0.0\n"
            )
            .is_err()
        );
        assert!(
            Config::from_toml_str("[cluster]\nnodes = [\"a:1\"]\n[skew]\nhistogram_capacity = 0\n")
                .is_err()
        );
        assert!(Config::from_toml_str("[cluster]\nnodes = [\"a:1\"]\n[bogus]\n").is_err());
    }

    #[test]
    fn missing_cluster_is_an_error() {
        let err = Config::from_toml_str("[skew]\ndynamic_detect = true\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
