use std::path::PathBuf;

use crate::{NodeId, StreamId};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("malformed record in {path} at line {line}")]
    MalformedRecord { path: PathBuf, line: usize },

    #[error("{0} partition files are missing")]
    MissingPartitions(usize),

    #[error("generated dataset is empty")]
    EmptyDataset,

    #[error("no stream registered with id {0}")]
    UnknownStream(StreamId),

    #[error("no node with id {0}")]
    UnknownNode(NodeId),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("invalid plan: {0}")]
    Plan(String),
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}
