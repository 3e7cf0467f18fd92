use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Conditions callers are expected to match on. Everything else travels as
/// `anyhow::Error` with context attached.
#[derive(Debug, Error)]
pub enum BackupError {
    #[error("credential error: {0}")]
    Credential(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} did not finish within {timeout:?}")]
    Timeout { program: String, timeout: Duration },

    #[error("could not delete remote object {id}; remaining deletions were not attempted")]
    BulkDelete { id: String },

    #[error("no remote object matches '{0}'")]
    NotFound(String),
}

/// Result of a step that reports failure as a value instead of an error,
/// so the caller can still run its cleanup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Done(PathBuf),
    Failed(String),
}

impl Outcome {
    pub fn failed(reason: impl Into<String>) -> Self {
        Outcome::Failed(reason.into())
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Outcome::Done(_))
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            Outcome::Done(path) => Some(path),
            Outcome::Failed(_) => None,
        }
    }

    /// Turns a failure into an `anyhow` error tagged with the step name.
    pub fn into_result(self, step: &str) -> anyhow::Result<PathBuf> {
        match self {
            Outcome::Done(path) => Ok(path),
            Outcome::Failed(reason) => Err(anyhow::anyhow!("{} failed: {}", step, reason)),
        }
    }
}
