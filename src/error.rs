//! Typed failures produced by the library.
//!
//! Every external call (yt-dlp, the Bilibili API, the filesystem) is turned
//! into one of these values before it reaches the controller, which forwards
//! them to the presentation layer as text.

use thiserror::Error;

use crate::text::strip_control;

/// The extraction tool failed or returned something unusable.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{0}")]
    Failed(String),
    #[error("could not parse extractor output: {0}")]
    InvalidOutput(#[from] serde_json::Error),
}

/// Outcome of a single blocking transfer that did not succeed.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The progress hook observed a cancellation request and the transfer was
    /// torn down.
    #[error("download cancelled")]
    Cancelled,
    #[error("{0}")]
    Failed(String),
}

/// Returned by a progress hook to abort the transfer that invoked it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cancellation requested")]
pub struct Cancelled;

impl From<Cancelled> for TransferError {
    fn from(_: Cancelled) -> Self {
        TransferError::Cancelled
    }
}

/// Failure of the lightweight platform API probe. Never fatal to resolution.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("not a probe-able URL: {0}")]
    Unsupported(String),
    #[error("http request failed: {0}")]
    Http(String),
    #[error("api returned code {code}: {message}")]
    Api { code: i64, message: String },
    #[error("invalid api response: {0}")]
    InvalidResponse(String),
}

/// Analysis could not produce usable metadata. The message is always free of
/// terminal control sequences.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ResolutionError {
    message: String,
}

impl ResolutionError {
    pub fn new(message: impl AsRef<str>) -> Self {
        let cleaned = strip_control(message.as_ref());
        let message = if cleaned.is_empty() {
            "unknown extraction error".to_owned()
        } else {
            cleaned
        };
        Self { message }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<ExtractError> for ResolutionError {
    fn from(err: ExtractError) -> Self {
        ResolutionError::new(err.to_string())
    }
}

/// A download selection could not be built.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectionError {
    #[error("no items selected for download")]
    Empty,
    #[error("playlist entry {0} does not exist")]
    UnknownEntry(usize),
    #[error("format {0} is not in the analyzed list")]
    UnknownFormat(String),
}

/// The controller refused a request in its current state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControllerError {
    #[error("a task is already running")]
    Busy,
    #[error("nothing to select: {0}")]
    NotAwaitingSelection(&'static str),
    #[error("no earlier download to retry")]
    NothingToRetry,
    #[error(transparent)]
    Selection(#[from] SelectionError),
    #[error("failed to start background task: {0}")]
    Spawn(String),
}
