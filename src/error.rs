use thiserror::Error;

#[derive(Debug, Error)]
pub enum CohortIqError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("SQL generation timed out after {attempts} polls ({elapsed_ms}ms)")]
    GenerationTimeout { attempts: usize, elapsed_ms: u64 },

    #[error("SQL generation failed: {0}")]
    GenerationFailed(String),

    #[error("SQL generation was cancelled")]
    GenerationCancelled,

    #[error("Generated SQL failed validation: {0}")]
    Validation(String),

    #[error("Collaborator error: {0}")]
    Collaborator(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CohortIqError>;
