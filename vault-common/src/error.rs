//! Errors returned by the control surface.

use thiserror::Error;

/// Service-level error with an HTTP status mapping.
#[derive(Error, Debug)]
pub enum Error {
    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation rejected because of current state (e.g. a cycle already running)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Persistence error
    #[error("Storage error: {0}")]
    Storage(String),
}

impl Error {
    /// Get HTTP status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::Conflict(_) => 409,
            Self::Storage(_) => 500,
        }
    }
}
