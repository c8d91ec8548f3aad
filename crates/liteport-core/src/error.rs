//! Error taxonomy for the conversion stages.
//!
//! Each stage of the pipeline has its own error type so that callers can tell
//! a missing checkpoint from an unsupported operator without string matching.
//! [`PipelineError`] unifies them for code that runs the whole sequence.

use std::path::PathBuf;

use crate::Encoding;

/// Structural problems found while validating an architecture.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("architecture has no layers")]
    Empty,

    #[error("duplicate layer name `{0}`")]
    DuplicateLayer(String),

    #[error("layer `{layer}` references unknown or later layer `{inbound}`")]
    UnknownInbound { layer: String, inbound: String },

    #[error("layer `{layer}` expects {expected} inbound layer(s), found {found}")]
    Arity {
        layer: String,
        expected: String,
        found: usize,
    },

    #[error("graph {role} `{name}` is not a layer")]
    UnknownEndpoint { role: &'static str, name: String },

    #[error("layer `{layer}`: {detail}")]
    Shape { layer: String, detail: String },

    #[error("layer `{layer}` uses custom operation `{function}` which is not registered")]
    UnresolvedOperation { layer: String, function: String },

    #[error("layer `{layer}` has invalid configuration: {reason}")]
    InvalidConfig { layer: String, reason: String },

    #[error("layer `{layer}` is missing weight `{weight}`")]
    MissingWeight { layer: String, weight: String },

    #[error("weight `{name}` has shape {found:?}, expected {expected:?}")]
    WeightShape {
        name: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("weight `{name}` has dtype {found}, expected f32")]
    WeightDType { name: String, found: &'static str },
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("model file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("failed to read {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{} is corrupt: {reason}", .path.display())]
    Corrupt { path: PathBuf, reason: String },

    #[error("{} is a {found} file, expected {expected}", .path.display())]
    WrongEncoding {
        path: PathBuf,
        expected: Encoding,
        found: Encoding,
    },

    #[error("{}: layer `{layer}` uses unregistered custom operation `{function}`", .path.display())]
    UnresolvedOperation {
        path: PathBuf,
        layer: String,
        function: String,
    },

    #[error("{} contains an invalid model", .path.display())]
    Invalid {
        path: PathBuf,
        #[source]
        source: GraphError,
    },
}

impl LoadError {
    /// Attach a path to a graph validation failure, lifting unresolved custom
    /// operations into their own variant.
    pub fn from_graph(path: impl Into<PathBuf>, err: GraphError) -> Self {
        let path = path.into();
        match err {
            GraphError::UnresolvedOperation { layer, function } => {
                LoadError::UnresolvedOperation {
                    path,
                    layer,
                    function,
                }
            }
            source => LoadError::Invalid { path, source },
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("failed to encode {what}: {reason}")]
    Encode { what: &'static str, reason: String },

    #[error("failed to write {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("refusing to overwrite existing output {}", .0.display())]
    OutputExists(PathBuf),
}

#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("failed to read conversion input")]
    Input(#[from] LoadError),

    #[error("converter only accepts {expected} files, {} is {found}", .path.display())]
    UnexpectedEncoding {
        path: PathBuf,
        expected: Encoding,
        found: Encoding,
    },

    #[error("layer `{layer}` uses custom operation `{function}` which is not registered")]
    UnresolvedOperation { layer: String, function: String },

    #[error("layer `{layer}`: unsupported operation {detail}")]
    UnsupportedOperation { layer: String, detail: String },

    #[error("graph cannot be lowered")]
    InvalidGraph(#[source] GraphError),
}

impl From<GraphError> for ConversionError {
    fn from(err: GraphError) -> Self {
        match err {
            GraphError::UnresolvedOperation { layer, function } => {
                ConversionError::UnresolvedOperation { layer, function }
            }
            other => ConversionError::InvalidGraph(other),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CleanupError {
    #[error("intermediate file {} disappeared before cleanup", .0.display())]
    Missing(PathBuf),

    #[error("failed to remove intermediate file {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("{0}")]
    InvalidConfig(String),

    #[error("load failed")]
    Load(#[from] LoadError),

    #[error("write failed")]
    Write(#[from] WriteError),

    #[error("conversion failed")]
    Conversion(#[from] ConversionError),

    #[error("cleanup failed")]
    Cleanup(#[from] CleanupError),
}
