//! Error types for the execution engine
//!
//! Errors are split by where they originate. `RuntimeError` covers the
//! container runtime underneath the pool; `SandpitError` is what the public
//! API returns. Validation and resource-exhaustion failures are kept as
//! distinct variants so callers can tell "fix your request" apart from
//! "try again later".

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum SandpitError {
    #[error("Validation failed: {0}")]
    Validation(String),
    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),
    #[error("Failed to acquire an instance within {0:?}")]
    AcquireTimeout(Duration),
    #[error("Job queue is full")]
    QueueFull,
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Container runtime error: {0}")]
    Runtime(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SandpitError {
    /// Resource exhaustion is transient; the caller should retry later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SandpitError::AcquireTimeout(_) | SandpitError::QueueFull)
    }

    pub fn validation<M: Into<String>>(msg: M) -> Self {
        SandpitError::Validation(msg.into())
    }

    pub fn internal<M: Into<String>>(msg: M) -> Self {
        SandpitError::Internal(msg.into())
    }
}

impl From<std::io::Error> for SandpitError {
    fn from(err: std::io::Error) -> Self {
        SandpitError::Io(err.to_string())
    }
}

impl From<RuntimeError> for SandpitError {
    fn from(err: RuntimeError) -> Self {
        SandpitError::Runtime(err.to_string())
    }
}

impl From<zip::result::ZipError> for SandpitError {
    fn from(err: zip::result::ZipError) -> Self {
        SandpitError::Validation(format!("Invalid project archive: {}", err))
    }
}

// Specific error for the container runtime
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Bollard (Docker client) error: {0}")]
    BollardError(#[from] bollard::errors::Error),
    #[error("Instance not found: {0}")]
    NotFound(String),
    #[error("I/O error during runtime operation: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Runtime operation failed: {0}")]
    Failed(String),
}
