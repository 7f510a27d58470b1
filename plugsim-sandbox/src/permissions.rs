//! Capability-based permission model for isolation boundaries.
//!
//! Three tiers:
//! - Baseline: the low-trust profile every sandbox starts with (execute,
//!   serialize results across the boundary, restricted member access)
//! - Elevated: broader runtime introspection and process environment
//! - Unrestricted: native code, filesystem and network

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Individual permission extension code may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Permission {
    // Baseline
    Execution,
    SerializationFormatter,
    RestrictedMemberAccess,

    // Elevated
    MemberAccess,
    Environment,
    ThreadControl,

    // Unrestricted
    UnmanagedCode,
    FileIo,
    Network,
}

impl Permission {
    pub const ALL: [Permission; 9] = [
        Permission::Execution,
        Permission::SerializationFormatter,
        Permission::RestrictedMemberAccess,
        Permission::MemberAccess,
        Permission::Environment,
        Permission::ThreadControl,
        Permission::UnmanagedCode,
        Permission::FileIo,
        Permission::Network,
    ];

    /// Returns the tier for this permission.
    pub fn tier(&self) -> PermissionTier {
        match self {
            Self::Execution | Self::SerializationFormatter | Self::RestrictedMemberAccess => {
                PermissionTier::Baseline
            }
            Self::MemberAccess | Self::Environment | Self::ThreadControl => {
                PermissionTier::Elevated
            }
            Self::UnmanagedCode | Self::FileIo | Self::Network => PermissionTier::Unrestricted,
        }
    }

    /// Returns the name used in configuration files and error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Execution => "execution",
            Self::SerializationFormatter => "serialization-formatter",
            Self::RestrictedMemberAccess => "restricted-member-access",
            Self::MemberAccess => "member-access",
            Self::Environment => "environment",
            Self::ThreadControl => "thread-control",
            Self::UnmanagedCode => "unmanaged-code",
            Self::FileIo => "file-io",
            Self::Network => "network",
        }
    }
}

/// Permission tier classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PermissionTier {
    Baseline,
    Elevated,
    Unrestricted,
}

/// Set of permissions granted inside a boundary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSet {
    granted: HashSet<Permission>,
}

impl PermissionSet {
    /// Nothing granted.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The minimal profile: execution, cross-boundary serialization, restricted member access.
    pub fn low_trust() -> Self {
        Self::from_permissions(
            Permission::ALL
                .into_iter()
                .filter(|p| p.tier() == PermissionTier::Baseline),
        )
    }

    /// Every permission granted (for host-side, non-isolated steps and testing).
    pub fn full_trust() -> Self {
        Self::from_permissions(Permission::ALL)
    }

    pub fn from_permissions(permissions: impl IntoIterator<Item = Permission>) -> Self {
        Self {
            granted: permissions.into_iter().collect(),
        }
    }

    pub fn is_granted(&self, permission: Permission) -> bool {
        self.granted.contains(&permission)
    }

    /// Returns all granted permissions.
    pub fn granted_permissions(&self) -> &HashSet<Permission> {
        &self.granted
    }
}
