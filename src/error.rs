use thiserror::Error;

/// Result type for window pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors that can occur while assembling or running a pipeline
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// No stages in pipeline
    #[error("Cannot start pipeline with no stages")]
    NoStages,

    /// A stage or sink referred to a node the builder does not know
    #[error("Unknown pipeline node: {0}")]
    UnknownNode(String),

    /// A stage's transformation failed; the stage set EOF on its output
    #[error("Stage '{stage}' failed: {message}")]
    StageFailed { stage: String, message: String },

    /// The pipeline was aborted while a stage was waiting
    #[error("Pipeline aborted")]
    Aborted,

    /// A blocking wait exceeded the configured timeout
    #[error("Stage '{stage}' timed out waiting on its buffer")]
    Timeout { stage: String },

    /// Registration or resize attempted after streaming began
    #[error("Buffer protocol violation: {0}")]
    ProtocolViolation(String),

    /// A window did not have the length its buffer expects
    #[error("Stage '{stage}' produced a window of {actual} samples, expected {expected}")]
    WindowSizeMismatch {
        stage: String,
        expected: usize,
        actual: usize,
    },

    /// Thread spawn or join error
    #[error("Thread error: {0}")]
    ThreadError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl PipelineError {
    /// Wrap a payload failure so it names the stage it came from
    pub fn stage(stage: impl Into<String>, message: impl std::fmt::Display) -> Self {
        PipelineError::StageFailed {
            stage: stage.into(),
            message: message.to_string(),
        }
    }
}
