//! Error types for registration and dispatch.

use plugsim_sandbox::BoundaryError;
use plugsim_types::Operation;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PluginError {
    #[error(
        "unknown plugin '{type_name}': provide explicit step configs or make sure its steps are registered on the platform"
    )]
    UnknownHandler { type_name: String },

    #[error(
        "an {operation} plugin step was registered for a specific entity ('{entity}'), which can only be registered on any entity"
    )]
    ScopeViolation { operation: Operation, entity: String },

    /// Wording mirrors the platform's own message.
    #[error(
        "This workflow job was canceled because the workflow that started it included an infinite loop. Correct the workflow logic and try again."
    )]
    InfiniteLoop { depth: u32 },

    #[error("invalid step configuration for '{step}': {reason}")]
    InvalidStepConfig { step: String, reason: String },

    #[error(transparent)]
    Boundary(BoundaryError),

    /// A handler failed. Carries the handler's original error.
    #[error(transparent)]
    Handler(anyhow::Error),
}

impl PluginError {
    /// Strips the boundary's invocation wrapper off a failed run.
    ///
    /// A handler error that is itself a `PluginError` (a nested dispatch
    /// failing inside the handler) or a `BoundaryError` (a denied demand) is
    /// re-raised as that error; anything else stays the handler's own error.
    pub(crate) fn from_invocation(err: BoundaryError) -> Self {
        let inner = match err.into_handler_error() {
            Ok(inner) => inner,
            Err(boundary) => return PluginError::Boundary(boundary),
        };
        match inner.downcast::<PluginError>() {
            Ok(plugin) => plugin,
            Err(inner) => match inner.downcast::<BoundaryError>() {
                Ok(boundary) => PluginError::Boundary(boundary),
                Err(inner) => PluginError::Handler(inner),
            },
        }
    }

    /// The handler's original error, if this is a handler failure.
    pub fn handler_error(&self) -> Option<&anyhow::Error> {
        match self {
            PluginError::Handler(e) => Some(e),
            _ => None,
        }
    }
}

impl From<BoundaryError> for PluginError {
    fn from(err: BoundaryError) -> Self {
        PluginError::Boundary(err)
    }
}
