//! Core type definitions for plugsim.
//!
//! This crate defines the plain data the plugin dispatch engine works with:
//! - Record identifiers (UUID, with the platform's "empty" id)
//! - Records, references, dispatch targets and column sets
//! - Step descriptors (subscription, deployment, images) and their enums
//! - Entity metadata and the `MetadataLookup` capability
//! - Step metadata fetched from the platform for plugins without explicit configs
//!
//! Nothing here executes extension code; see `plugsim-host` and
//! `plugsim-sandbox` for that.

mod ids;
mod metadata;
mod record;
mod step;

pub use ids::RecordId;
pub use metadata::{EntityMetadata, MetaPlugin, MetadataCatalog, MetadataLookup};
pub use record::{ColumnSet, Record, RecordReference, Target};
pub use step::{
    Deployment, ExecutionMode, ImageType, IsolationMode, Operation, Stage, StepConfig,
    StepDeployment, StepImage, StepSubscription,
};

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unknown execution stage code: {0}")]
    UnknownStage(i32),

    #[error("unknown {kind} code: {code}")]
    UnknownCode { kind: &'static str, code: i32 },
}
