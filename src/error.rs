//! Typed failures of the extraction pipeline.
//!
//! Each variant carries a scope: some fail a whole request, some fail one
//! file inside a batch, and [`PipelineError::Persistence`] is only ever
//! logged. The HTTP layer maps variants to status codes in `server.rs`.

use crate::llm::ModelError;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Caller supplied something unusable. Request-fatal.
    #[error("{0}")]
    InvalidInput(String),

    /// The file's mime type is neither a PDF nor an image. The file is skipped.
    #[error("unsupported mime type '{0}'")]
    UnsupportedMime(String),

    /// The PDF could not be parsed, split, or re-rendered. File-fatal.
    #[error("pdf error: {0}")]
    Pdf(String),

    /// The model answered with something that does not fit the expected shape.
    #[error("malformed model response: {0}")]
    MalformedResponse(String),

    /// The model or embedding provider failed at the transport or API level.
    #[error(transparent)]
    Model(#[from] ModelError),

    /// A configured capability is switched off (`provider = "disabled"`).
    #[error("{0} is disabled")]
    Disabled(&'static str),

    /// Blob or template storage failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// A source URL could not be downloaded. File-fatal.
    #[error("failed to fetch {url}: {message}")]
    Fetch { url: String, message: String },

    /// Snapshot or conversation persistence failed.
    #[error("persistence error: {0}")]
    Persistence(String),
}

impl PipelineError {
    pub fn invalid(message: impl Into<String>) -> Self {
        PipelineError::InvalidInput(message.into())
    }

    pub fn storage(err: anyhow::Error) -> Self {
        PipelineError::Storage(format!("{:#}", err))
    }

    pub fn persistence(err: anyhow::Error) -> Self {
        PipelineError::Persistence(format!("{:#}", err))
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
