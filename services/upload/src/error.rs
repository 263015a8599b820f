use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the upload pipeline.
///
/// Every variant aborts the remaining stages of a run. None of them are
/// retried automatically.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Bad identifier, unsupported content type, oversized or malformed input
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Caller is not the owner of the target video
    #[error("User {user_id} is not allowed to modify video {video_id}")]
    Authorization { user_id: Uuid, video_id: Uuid },

    /// Target video record does not exist
    #[error("Video {0} not found")]
    NotFound(Uuid),

    /// External tool failure or unusable classification result
    #[error("Media processing failed: {0}")]
    Processing(String),

    /// Scratch file or object storage I/O failure
    #[error("Storage failure: {0}")]
    Storage(String),

    /// Metadata record update failure
    #[error("Metadata persistence failed: {0}")]
    Persistence(String),
}

impl PipelineError {
    /// Stable category label used in logs, metrics and API error codes
    pub fn category(&self) -> &'static str {
        match self {
            PipelineError::Validation(_) => "validation",
            PipelineError::Authorization { .. } => "authorization",
            PipelineError::NotFound(_) => "not_found",
            PipelineError::Processing(_) => "processing",
            PipelineError::Storage(_) => "storage",
            PipelineError::Persistence(_) => "persistence",
        }
    }

    pub(crate) fn storage(context: &str, err: impl std::fmt::Display) -> Self {
        PipelineError::Storage(format!("{context}: {err}"))
    }

    pub(crate) fn processing(context: &str, err: impl std::fmt::Display) -> Self {
        PipelineError::Processing(format!("{context}: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
