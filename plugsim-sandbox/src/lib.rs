//! Isolation boundary for plugin code.
//!
//! Runs extension entry points inside a disposable domain with a restricted
//! permission profile. Sandboxed domains fork a worker process per
//! invocation and confine it with kernel resource limits. Components
//! identified by a verified Ed25519 signature may be granted full trust
//! (test assertion libraries, reporting helpers).
//!
//! Teardown is the only cleanup guarantee: disposing a boundary discards all
//! state accumulated inside it, and the handle refuses further work.

mod boundary;
mod error;
mod identity;
mod permissions;
mod policy;
mod worker;

pub use boundary::{DomainKind, DomainScope, IsolationBoundary};
pub use error::{BoundaryError, HandlerFault, HandlerPanic};
pub use identity::{
    ComponentIdentity, Ed25519Verifier, IdentityVerifier, KeyPair, SigningKey, StrongName,
};
pub use permissions::{Permission, PermissionSet, PermissionTier};
pub use policy::{ResourceLimits, SandboxPolicy};
