use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unknown owner or empty owner id")]
    MissingOwner,

    #[error("Store error: {0}")]
    StoreError(String),

    #[error("Reasoning service error: {0}")]
    ReasoningFailed(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[cfg(feature = "gemini")]
    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, ReconcileError>;
