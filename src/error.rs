//! Crate-level error type and `Result` alias.
//!
//! Remote failures, lifecycle refusals and local addressing failures each get
//! their own variant so callers can print a message and pick an exit code
//! without string matching.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("could not reach server at {url}: {source}")]
    ServerUnavailable {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("server rejected the workflow: {reason}")]
    WorkflowRejected { reason: String },

    #[error("inputs not set: {}", names.join(", "))]
    InputsNotSet { names: Vec<String> },

    #[error("cannot read input file '{}': {source}", path.display())]
    UnreadableInput {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("index {index:?} is out of range for port '{port}' (list has {len} elements)")]
    IndexOutOfRange {
        port: String,
        index: Vec<usize>,
        len: usize,
    },

    #[error("index {index:?} is deeper than port '{port}' (depth {depth})")]
    IndexTooDeep {
        port: String,
        index: Vec<usize>,
        depth: usize,
    },

    #[error("malformed coordinate '{spec}': expected NAME[:I1,I2,...]")]
    MalformedCoordinate { spec: String },

    #[error("could not find run '{id}'")]
    RunNotFound { id: String },

    #[error("run has no output port named '{name}'")]
    NoSuchPort { name: String },

    #[error("access denied to {url}")]
    AccessDenied { url: String },

    #[error("unexpected response from {url}: HTTP {status}: {body}")]
    UnexpectedResponse {
        url: String,
        status: u16,
        body: String,
    },

    #[error("malformed response from {url}: {detail}")]
    MalformedResponse { url: String, detail: String },

    #[error("port value is an error: {message}")]
    ErrorValue { message: String },

    #[error("invalid argument: {arg}={value}")]
    InvalidArgument { arg: &'static str, value: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Errors that leave the remote run deleted by the driver.
    pub fn is_lifecycle_abort(&self) -> bool {
        matches!(
            self,
            Error::InputsNotSet { .. } | Error::UnreadableInput { .. }
        )
    }
}
