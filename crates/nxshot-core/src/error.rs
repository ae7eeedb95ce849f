use thiserror::Error;

use crate::capture::Rejection;
use crate::container::EncodeError;
use crate::orchestrator::RunState;

/// Fatal errors of an archive-creation run.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// The user dismissed the destination picker, or cancelled the run.
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Failed to scan sources: {0:#}")]
    Scan(anyhow::Error),

    #[error("No valid captures found ({rejected} file(s) rejected)")]
    NoCaptures { rejected: usize },

    #[error("Failed to load capture ID table: {0}")]
    LookupTable(#[from] TableError),

    #[error("Failed to read {filename}: {source}")]
    Read {
        filename: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write archive: {0}")]
    Sink(#[source] std::io::Error),

    #[error("Failed to encode {path}: {source}")]
    Encode {
        path: String,
        #[source]
        source: EncodeError,
    },

    #[error(transparent)]
    Transition(#[from] InvalidTransition),
}

/// Failure of the capture-ID table load.
#[derive(Debug, Clone, Error)]
pub enum TableError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("malformed table: {0}")]
    Malformed(String),
}

/// A state change the run state machine does not allow.
#[derive(Debug, Clone, Error)]
#[error("cannot move from {from} to {to}")]
pub struct InvalidTransition {
    pub from: &'static str,
    pub to: &'static str,
}

impl InvalidTransition {
    pub(crate) fn new(from: &RunState, to: &RunState) -> Self {
        Self {
            from: from.name(),
            to: to.name(),
        }
    }
}

/// A source file excluded before the pipeline starts.
#[derive(Debug, Clone)]
pub struct RejectedFile {
    pub filename: String,
    pub reason: Rejection,
}
