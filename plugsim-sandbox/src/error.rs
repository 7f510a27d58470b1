//! Error types for the isolation boundary.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BoundaryError {
    #[error("untrusted component '{component}': {reason}")]
    UntrustedComponent { component: String, reason: String },

    #[error("isolation boundary '{0}' has been disposed")]
    Disposed(String),

    #[error("marshaling error: {0}")]
    Marshal(#[from] serde_json::Error),

    #[error("permission denied: component '{component}' lacks '{permission}'")]
    PermissionDenied {
        component: String,
        permission: String,
    },

    /// The worker process could not be started or its channel broke.
    #[error("worker for boundary '{boundary}' failed: {reason}")]
    Worker { boundary: String, reason: String },

    /// The worker died before reporting a result (signal, abort, resource limit).
    #[error("worker running '{component}' terminated: {status}")]
    WorkerTerminated { component: String, status: String },

    /// The entry point itself failed. Carries the original error untouched.
    #[error(transparent)]
    Handler(anyhow::Error),
}

impl BoundaryError {
    /// Consumes the error, returning the entry point's own failure if that is what this is.
    pub fn into_handler_error(self) -> Result<anyhow::Error, BoundaryError> {
        match self {
            BoundaryError::Handler(e) => Ok(e),
            other => Err(other),
        }
    }
}

/// Raised in place of a panic that escaped an entry point.
#[derive(Debug, Error)]
#[error("handler '{component}' panicked: {message}")]
pub struct HandlerPanic {
    pub component: String,
    pub message: String,
}

/// An error raised by code running in a worker process.
///
/// Only the rendered message and its cause chain survive the process
/// boundary; `Display` is the original error's own message.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct HandlerFault {
    pub component: String,
    pub message: String,
    /// Messages of the causes below `message`, outermost first.
    pub causes: Vec<String>,
}
