//! Error types shared across the pipeline.

use std::path::PathBuf;

use thiserror::Error;

use crate::task::TaskStatus;

#[derive(Debug, Error)]
#[error("invalid state transition: cannot transition from {from} to {to}")]
pub struct TransitionError {
    pub from: TaskStatus,
    pub to: TaskStatus,
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("media file '{0}' not found")]
    Missing(PathBuf),

    #[error("probe tool failed to start: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("probe tool exited with {code:?}: {stderr}")]
    ToolFailed { code: Option<i32>, stderr: String },

    #[error("probe output has no structured payload")]
    NoPayload,

    #[error("probe output is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("probe output lists no video stream")]
    NoVideoStream,
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("failed to read manifest '{path}': {source}")]
    Manifest {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to create output directory '{path}': {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("input '{0}' is neither a file nor a directory")]
    Input(PathBuf),

    #[error("directory walk aborted: {0}")]
    Walk(String),
}

#[derive(Debug, Error)]
pub enum ReceiptError {
    #[error("tool output carries no <{0}> block")]
    Missing(&'static str),

    #[error("receipt is not valid XML: {0}")]
    Xml(#[from] quick_xml::de::DeError),

    #[error("match response is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}
