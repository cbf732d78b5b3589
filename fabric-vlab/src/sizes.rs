use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

use crate::ids::VmKind;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VmSize {
    pub cpu: u32,
    pub ram_mb: u32,
    pub disk_gb: u32,
}

impl VmSize {
    pub const fn new(cpu: u32, ram_mb: u32, disk_gb: u32) -> Self {
        Self {
            cpu,
            ram_mb,
            disk_gb,
        }
    }
}

/// Per-type VM sizing, defaults merged with user overrides.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct VmSizes {
    pub control: VmSize,
    pub switch: VmSize,
    pub server: VmSize,
    pub gateway: VmSize,
    pub external: VmSize,
}

lazy_static! {
    static ref DEFAULT_SIZES: VmSizes = VmSizes {
        control: VmSize::new(6, 6144, 100),
        switch: VmSize::new(4, 5120, 50),
        server: VmSize::new(2, 768, 10),
        gateway: VmSize::new(8, 6144, 100),
        external: VmSize::new(2, 1024, 10),
    };
}

impl Default for VmSizes {
    fn default() -> Self {
        *DEFAULT_SIZES
    }
}

/// Per-type overrides; unset entries keep the defaults.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VmSizeOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control: Option<VmSize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub switch: Option<VmSize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<VmSize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<VmSize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<VmSize>,
}

impl VmSizes {
    pub fn with_overrides(overrides: &VmSizeOverrides) -> Self {
        let mut sizes = Self::default();
        if let Some(control) = overrides.control {
            sizes.control = control;
        }
        if let Some(switch) = overrides.switch {
            sizes.switch = switch;
        }
        if let Some(server) = overrides.server {
            sizes.server = server;
        }
        if let Some(gateway) = overrides.gateway {
            sizes.gateway = gateway;
        }
        if let Some(external) = overrides.external {
            sizes.external = external;
        }
        sizes
    }

    pub fn for_kind(&self, kind: VmKind) -> VmSize {
        match kind {
            VmKind::Control => self.control,
            VmKind::Switch => self.switch,
            VmKind::Server => self.server,
            VmKind::Gateway => self.gateway,
            VmKind::External => self.external,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_merge_with_defaults() {
        let sizes = VmSizes::with_overrides(&VmSizeOverrides {
            server: Some(VmSize::new(4, 4096, 20)),
            ..Default::default()
        });
        assert_eq!(sizes.server, VmSize::new(4, 4096, 20));
        assert_eq!(sizes.control, VmSizes::default().control);
        assert_eq!(sizes.for_kind(VmKind::Server), sizes.server);
    }
}
