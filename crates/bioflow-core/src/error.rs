//! Error types for BioFlow.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("dependency error: {0}")]
    Dependency(String),

    #[error("resource error: {0}")]
    Resource(String),

    #[error("container error for image '{image}': {message}")]
    Container { image: String, message: String },

    #[error("failed to spawn process: {0}")]
    Spawn(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
