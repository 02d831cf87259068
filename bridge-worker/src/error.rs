use std::path::PathBuf;

use bridge_common::dlq::DlqError;
use thiserror::Error;

/// The source text could not be turned into records.
#[derive(Error, Debug, PartialEq)]
pub enum DecodeError {
    #[error("malformed xml at byte {position}: {message}")]
    Malformed { position: u64, message: String },
    #[error("malformed xml: unclosed element <{0}>")]
    Unclosed(String),
}

/// A source file was detected but could not be handed over as a batch.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("failed to read {path}: {error}")]
    Io {
        path: PathBuf,
        error: std::io::Error,
    },
    #[error("{path} is {size} bytes, above the {limit} bytes limit")]
    TooLarge { path: PathBuf, size: u64, limit: u64 },
    #[error("{path} kept changing after {checks} stability checks")]
    Unstable { path: PathBuf, checks: u32 },
    #[error("failed to decode {path}: {error}")]
    Decode { path: PathBuf, error: DecodeError },
    #[error("invalid file pattern {pattern}: {message}")]
    Pattern { pattern: String, message: String },
}

/// Failures of a single submission call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SubmitError {
    #[error("event management API responded with status {status}")]
    Status { status: u16, body: String },
    #[error("event management API request failed ({code}): {message}")]
    Connection { code: String, message: String },
    #[error("event management API request could not be built: {0}")]
    Build(String),
}

/// Failures of one delivery attempt, as seen by the retry engine.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeliveryError {
    #[error("circuit breaker open")]
    CircuitOpen,
    #[error(transparent)]
    Submit(#[from] SubmitError),
}

impl DeliveryError {
    /// HTTP status of the response that caused this error, if there was one.
    pub fn status(&self) -> Option<u16> {
        match self {
            DeliveryError::Submit(SubmitError::Status { status, .. }) => Some(*status),
            _ => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("changing {} requires a restart", .0.join(", "))]
    RequiresRestart(Vec<String>),
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("failed to read configuration: {0}")]
    Env(#[from] envconfig::Error),
    #[error("failed to read configuration overrides from {path}: {error}")]
    Overrides {
        path: PathBuf,
        error: std::io::Error,
    },
}

/// Enumeration of errors that stop the worker.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("dead letter store error: {0}")]
    DeadLetter(#[from] DlqError),
    #[error("source error: {0}")]
    Source(#[from] SourceError),
    #[error("failed to build the submission client: {0}")]
    Client(String),
    #[error("failed to open the audit log: {0}")]
    Audit(#[from] std::io::Error),
    #[error("failed to start metrics server: {0}")]
    Metrics(String),
}
