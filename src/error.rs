//! Error types for the insights pipeline.
//!
//! Every external collaborator reports failures through [`PipelineError`] so
//! the orchestrator can decide which ones end the run.

use thiserror::Error;

/// Result type alias using the pipeline's error type.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Failures a pipeline run can end with.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// The analytics store could not be reached or the query failed.
    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    /// Summary generation failed for one client.
    #[error("Generation failed for client '{client}': {message}")]
    Generation { client: String, message: String },

    /// The insight batch could not be appended.
    #[error("Sink unavailable: {0}")]
    SinkUnavailable(String),

    /// Missing or invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl PipelineError {
    /// Create a source error
    pub fn source(msg: impl Into<String>) -> Self {
        Self::SourceUnavailable(msg.into())
    }

    /// Create a generation error for a client
    pub fn generation(client: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Generation {
            client: client.into(),
            message: msg.into(),
        }
    }

    /// Create a sink error
    pub fn sink(msg: impl Into<String>) -> Self {
        Self::SinkUnavailable(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Process exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::Config(_) => 1,
            PipelineError::SourceUnavailable(_) => 3,
            PipelineError::Generation { .. } => 4,
            PipelineError::SinkUnavailable(_) => 5,
        }
    }
}
