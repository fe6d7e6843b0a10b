//! Process-wide tracing setup.
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;

static INIT: OnceLock<()> = OnceLock::new();

/// Installs the global subscriber once. `RUST_LOG` overrides `config.level`.
///
/// With `config.file` set the output goes to `<file>_<node_tag>`, one file per
/// node process; otherwise to stderr.
pub fn init(config: &LogConfig, node_tag: &str) {
    INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));

        if let Some(prefix) = &config.file {
            let path = node_log_path(prefix, node_tag);
            match open_log_file(&path) {
                Ok(file) => {
                    let _ = tracing_subscriber::fmt()
                        .with_env_filter(filter)
                        .with_writer(Mutex::new(file))
                        .with_ansi(false)
                        .with_thread_ids(true)
                        .try_init();
                    return;
                }
                Err(err) => {
                    eprintln!(
                        "failed to open log file {}: {err}, fallback to stderr",
                        path.display()
                    );
                }
            }
        }

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_thread_ids(true)
            .try_init();
    });
}

fn node_log_path(prefix: &Path, node_tag: &str) -> PathBuf {
    let mut name = prefix.as_os_str().to_owned();
    name.push("_");
    name.push(node_tag);
    PathBuf::from(name)
}

fn open_log_file(path: &Path) -> std::io::Result<fs::File> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_tag_is_appended() {
        let path = node_log_path(Path::new("logs/skewjoin"), "node0");
        assert_eq!(path, PathBuf::from("logs/skewjoin_node0"));
    }
}
