//! Host configuration, read from `plugsim.toml`.
//!
//! ```toml
//! [plugins]
//! permanent-enabled = true
//!
//! [sandbox]
//! permissions = ["execution", "serialization-formatter"]
//! allowed-signing-keys = ["<hex ed25519 public key>"]
//!
//! [sandbox.limits]
//! cpu-seconds = 5
//! max-memory-bytes = 268435456
//! ```
//!
//! A missing file means defaults. A file that cannot be read or parsed is
//! logged and also falls back to defaults.

use plugsim_sandbox::SandboxPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HostConfig {
    #[serde(default)]
    pub plugins: PluginSettings,
    #[serde(default)]
    pub sandbox: SandboxPolicy,
    /// Where this config was read from, if anywhere.
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PluginSettings {
    #[serde(default = "enabled")]
    pub permanent_enabled: bool,
}

impl Default for PluginSettings {
    fn default() -> Self {
        Self {
            permanent_enabled: true,
        }
    }
}

fn enabled() -> bool {
    true
}

impl HostConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    pub fn load_from(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            info!("No host config found at {:?}, using defaults", path);
            return Self::default();
        }

        match std::fs::read_to_string(path) {
            Ok(contents) => match Self::from_toml_str(&contents) {
                Ok(mut config) => {
                    info!("Loaded host config from {:?}", path);
                    config.source = Some(path.to_path_buf());
                    config
                }
                Err(e) => {
                    warn!(
                        "Failed to parse host config {:?}: {}. Falling back to defaults.",
                        path, e
                    );
                    Self::default()
                }
            },
            Err(e) => {
                warn!("Failed to read host config {:?}: {}", path, e);
                Self::default()
            }
        }
    }
}
