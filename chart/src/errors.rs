use std::path::PathBuf;

/// Errors related to loading, rendering and scanning charts.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unable to load chart from {path}: {reason}")]
    Load { path: PathBuf, reason: String },

    #[error("invalid values: {0}")]
    Values(String),

    /// A sub-chart weight that doesn't decode to a non-negative integer.
    #[error("computing weight value for sub-chart \"{name}\": {reason}")]
    Weight { name: String, reason: String },

    #[error("rendering chart {chart} failed ({status}): {stderr}")]
    Render {
        chart: String,
        status: String,
        stderr: String,
        stdout: String,
    },

    #[error("unable to run {bin}: {source}")]
    Spawn {
        bin: PathBuf,
        source: std::io::Error,
    },

    #[error("unable to scan {path}: {source}")]
    Scan {
        path: PathBuf,
        source: std::io::Error,
    },

    /// All errors of the render tasks that failed.
    #[error("{} render task(s) failed: {}", .0.len(), join_errors(.0))]
    Tasks(Vec<Error>),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<tokio::task::JoinError> for Error {
    fn from(value: tokio::task::JoinError) -> Self {
        Error::Io(std::io::Error::other(value))
    }
}
