use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::external::ExternalsConfig;
use crate::ids::VmKind;
use crate::netdev::NicBinding;
use crate::sizes::VmSizes;

/// Default VLAB working directory, next to `fab.yaml`.
pub const VLAB_DIR: &str = "vlab";
/// Persisted VLAB config, regenerated on every compile.
pub const VLAB_CONFIG_FILE: &str = "vlab/config.yaml";
/// Ed25519 private key; the public half is injected into control-node and
/// switch-user authorized keys on load. Key generation is external.
pub const VLAB_SSH_KEY_FILE: &str = "vlab/sshkey";
/// Registry defaults file.
pub const REGISTRY_CONFIG_FILE: &str = ".registry.yaml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Persisted VLAB description consumed by the external runner alongside the
/// compiled VM descriptors.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct VlabConfig {
    pub sizes: VmSizes,
    pub vms: BTreeMap<String, VmEntry>,
    #[serde(default, skip_serializing_if = "externals_is_empty")]
    pub externals: ExternalsConfig,
}

fn externals_is_empty(externals: &ExternalsConfig) -> bool {
    externals.vrfs.is_empty() && externals.attachments.is_empty()
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct VmEntry {
    #[serde(rename = "type")]
    pub kind: VmKind,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub nics: BTreeMap<String, NicBinding>,
}

impl VlabConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&content)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// `{repo, prefix}` the artifact references resolve against.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct RegistryConfig {
    pub repo: String,
    pub prefix: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            repo: "ghcr.io".to_string(),
            prefix: "githedgehog".to_string(),
        }
    }
}

impl RegistryConfig {
    /// Load the registry file, falling back to the defaults when absent.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&content)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        std::fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netdev::NicBinding;

    #[test]
    fn test_vlab_config_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.yaml");

        let mut config = VlabConfig::default();
        let mut nics = BTreeMap::new();
        nics.insert("enp2s0".to_string(), NicBinding::Usernet);
        nics.insert(
            "enp2s1".to_string(),
            NicBinding::Direct {
                peer: "leaf-01/E1/5".to_string(),
            },
        );
        config.vms.insert(
            "server-01".to_string(),
            VmEntry {
                kind: VmKind::Server,
                nics,
            },
        );

        config.save(&path).expect("save");
        let loaded = VlabConfig::load(&path).expect("load");
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_registry_defaults_when_absent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(".registry.yaml");

        let registry = RegistryConfig::load_or_default(&path).expect("defaults");
        assert_eq!(registry.repo, "ghcr.io");
        assert_eq!(registry.prefix, "githedgehog");

        let custom = RegistryConfig {
            repo: "registry.local".to_string(),
            prefix: "lab".to_string(),
        };
        custom.save(&path).expect("save");
        let loaded = RegistryConfig::load_or_default(&path).expect("load");
        assert_eq!(loaded, custom);
    }
}
