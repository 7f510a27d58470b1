//! Plugin dispatch for plugsim.
//!
//! Registers plugin steps (from code or from platform step metadata), and
//! for each pipeline event runs the matching steps in execution order,
//! each inside its isolation boundary with its own execution context.
//!
//! The record engine that raises events is not part of this crate. It calls
//! [`PluginManager::dispatch`] once per stage and implements
//! [`OrganizationService`] so handlers can issue nested requests.

mod config;
mod context;
mod error;
mod event;
mod manager;
mod plugin;
mod registry;
mod service;
mod trigger;

pub use config::{HostConfig, PluginSettings};
pub use context::{ExecutionContext, MAX_DEPTH};
pub use error::PluginError;
pub use event::PluginEvent;
pub use manager::PluginManager;
pub use plugin::{FnPlugin, Plugin, PluginBuilder, PluginModule, StepHandler};
pub use registry::{PluginRegistries, RegistrationScope, StepRegistry};
pub use service::{LocalPluginContext, NoService, OrganizationService};
pub use trigger::PluginTrigger;
