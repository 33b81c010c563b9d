use std::path::PathBuf;

use reqwest::{Method, StatusCode};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{method} {path}: request failed: {source}")]
    Http {
        method: Method,
        path: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{method} {path} returned {status}: {body}")]
    Status {
        method: Method,
        path: String,
        status: StatusCode,
        body: String,
    },
    #[error("failed to decode response of {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid index pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("{failed} of {attempted} force-merge requests failed")]
    Maintenance { failed: usize, attempted: usize },
    #[error("{failed} of {attempted} indices were not fully replicated")]
    Replication { failed: usize, attempted: usize },
    #[error("replication verification found {0} mismatches")]
    VerificationFailed(u64),
}

impl Error {
    /// HTTP status of a non-2xx response, if this error is one.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Error::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
