use thiserror::Error;

/// Failure of a single pipeline stage.
///
/// The orchestrator records the rendered message in the episode's error map;
/// variants exist so stage code can match or propagate with `?`.
#[derive(Debug, Error)]
pub enum StageError {
    /// A required upstream artifact (file or field) is missing. This is a
    /// configuration/ordering bug rather than a transient external failure.
    #[error("missing upstream artifact: {0}")]
    Precondition(String),

    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Wav(#[from] hound::Error),

    #[error("{0}")]
    Http(#[from] reqwest::Error),

    /// External subprocess (ffmpeg, ffprobe, rsync) exited non-zero.
    #[error("{tool} failed: {detail}")]
    Tool { tool: String, detail: String },

    /// Remote REST service returned a non-success status.
    #[error("{service} returned {status}: {detail}")]
    Api {
        service: String,
        status: u16,
        detail: String,
    },

    #[error("{0}")]
    Other(String),
}

impl From<String> for StageError {
    fn from(s: String) -> Self {
        StageError::Other(s)
    }
}

impl From<&str> for StageError {
    fn from(s: &str) -> Self {
        StageError::Other(s.to_string())
    }
}

/// Orchestrator-level failure, distinct from the failure of any one stage.
///
/// Stage failures are handled inside the run loop and surface through the
/// episode's status and error map; these are the cases where the run itself
/// could not proceed.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("episode state is not valid JSON: {0}")]
    State(#[from] serde_json::Error),

    #[error("source path does not exist: {0}")]
    SourceMissing(String),

    #[error("no runnable stages in request")]
    EmptyRequest,

    /// Nothing is ready and nothing is running, but requested work remains.
    /// Cannot happen with the static graph, but is reported rather than hung.
    #[error("dependency deadlock: stages {0:?} can never become ready")]
    Deadlock(Vec<String>),
}
