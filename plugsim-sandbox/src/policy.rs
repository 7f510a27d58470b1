//! Sandbox policy: which permissions a sandbox grants, whose signatures are
//! accepted for full trust, and the resource ceilings of its worker
//! processes. Parsed from the `[sandbox]` section of the host configuration.

use crate::identity::Ed25519Verifier;
use crate::permissions::{Permission, PermissionSet};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SandboxPolicy {
    /// Permissions granted to sandboxed code. `None` means the low-trust profile.
    #[serde(default)]
    pub permissions: Option<Vec<Permission>>,
    /// Hex Ed25519 public keys accepted for trusted components. Empty accepts any valid signature.
    #[serde(default)]
    pub allowed_signing_keys: Vec<String>,
    #[serde(default)]
    pub limits: ResourceLimits,
}

/// Kernel-enforced ceilings for one worker process. Unset means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ResourceLimits {
    /// CPU time per invocation. The worker is killed once it is used up.
    #[serde(default)]
    pub cpu_seconds: Option<u64>,
    /// Address space ceiling; allocations beyond it fail inside the worker.
    #[serde(default)]
    pub max_memory_bytes: Option<u64>,
}

impl SandboxPolicy {
    pub fn profile(&self) -> PermissionSet {
        match &self.permissions {
            Some(list) => PermissionSet::from_permissions(list.iter().copied()),
            None => PermissionSet::low_trust(),
        }
    }

    pub fn verifier(&self) -> Ed25519Verifier {
        Ed25519Verifier::with_allowed_keys(&self.allowed_signing_keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_is_low_trust() {
        let policy = SandboxPolicy::default();
        assert_eq!(policy.profile(), PermissionSet::low_trust());
        assert_eq!(policy.limits, ResourceLimits::default());
    }

    #[test]
    fn explicit_permissions_replace_profile() {
        let policy: SandboxPolicy = serde_json::from_str(
            r#"{"permissions": ["execution", "network"], "allowed-signing-keys": ["ab"]}"#,
        )
        .unwrap();
        let profile = policy.profile();
        assert!(profile.is_granted(Permission::Execution));
        assert!(profile.is_granted(Permission::Network));
        assert!(!profile.is_granted(Permission::SerializationFormatter));
        assert_eq!(policy.allowed_signing_keys, vec!["ab".to_string()]);
    }

    #[test]
    fn limits_are_read_from_kebab_case_keys() {
        let policy: SandboxPolicy =
            serde_json::from_str(r#"{"limits": {"cpu-seconds": 2, "max-memory-bytes": 1048576}}"#)
                .unwrap();
        assert_eq!(policy.limits.cpu_seconds, Some(2));
        assert_eq!(policy.limits.max_memory_bytes, Some(1_048_576));
    }
}
