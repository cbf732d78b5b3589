use std::collections::BTreeMap;

use lazy_static::lazy_static;

use crate::ports::{nic_id, PortError, BREAKOUT_PORT_MIN, BREAKOUT_PORT_STEP, PORT_ID_MAX};

/// Profile tag every virtual switch carries.
pub const VS_PROFILE: &str = "vs";

/// A breakout mode: which lane offsets of the port it occupies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakoutMode {
    pub offsets: Vec<u8>,
}

/// Port naming and breakout capabilities of a switch model.
#[derive(Debug, Clone)]
pub struct SwitchProfile {
    pub name: &'static str,
    pub default_breakout: &'static str,
    pub breakout_modes: BTreeMap<&'static str, BreakoutMode>,
}

lazy_static! {
    static ref VS: SwitchProfile = SwitchProfile {
        name: VS_PROFILE,
        default_breakout: "1x100G",
        breakout_modes: BTreeMap::from([
            ("1x100G", BreakoutMode { offsets: vec![0] }),
            ("1x40G", BreakoutMode { offsets: vec![0] }),
            ("4x25G", BreakoutMode { offsets: vec![0, 1, 2, 3] }),
            ("4x10G", BreakoutMode { offsets: vec![0, 1, 2, 3] }),
        ]),
    };
}

impl SwitchProfile {
    pub fn get(name: &str) -> Option<&'static SwitchProfile> {
        (name == VS_PROFILE).then(|| &*VS)
    }

    /// NOS interface name of a front-panel port, e.g. `E1/3 -> Ethernet2`.
    pub fn nos_port(&self, port: &str) -> Result<String, PortError> {
        if !port.starts_with("E1/") {
            return Err(PortError::InvalidNicId(port.to_string()));
        }
        let id = nic_id(port)?;
        Ok(format!("Ethernet{}", id - 1))
    }

    /// Breakout-capable port names, `E1/49..E1/76` step 4.
    pub fn breakout_ports(&self) -> Vec<String> {
        (BREAKOUT_PORT_MIN..=PORT_ID_MAX)
            .step_by(BREAKOUT_PORT_STEP as usize)
            .map(|id| format!("E1/{}", id))
            .collect()
    }

    pub fn is_breakout_port(&self, port: &str) -> bool {
        match nic_id(port) {
            Ok(id) => {
                id >= BREAKOUT_PORT_MIN
                    && id <= PORT_ID_MAX
                    && (id - BREAKOUT_PORT_MIN) % BREAKOUT_PORT_STEP == 0
            }
            Err(_) => false,
        }
    }

    /// First non-default mode occupying a single lane, used by the breakout
    /// round-trip check.
    pub fn single_lane_alternative(&self) -> Option<&'static str> {
        self.breakout_modes
            .iter()
            .find(|(name, mode)| **name != self.default_breakout && mode.offsets.len() == 1)
            .map(|(name, _)| *name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vs_profile_lookup() {
        assert!(SwitchProfile::get("vs").is_some());
        assert!(SwitchProfile::get("ds5000").is_none());
    }

    #[test]
    fn test_nos_port_mapping() {
        let profile = SwitchProfile::get("vs").expect("vs profile");
        assert_eq!(profile.nos_port("E1/1").expect("map"), "Ethernet0");
        assert_eq!(profile.nos_port("E1/48").expect("map"), "Ethernet47");
        assert!(profile.nos_port("M1").is_err());
        assert!(profile.nos_port("enp2s1").is_err());
    }

    #[test]
    fn test_breakout_ports() {
        let profile = SwitchProfile::get("vs").expect("vs profile");
        let ports = profile.breakout_ports();
        assert_eq!(ports.first().map(String::as_str), Some("E1/49"));
        assert_eq!(ports.last().map(String::as_str), Some("E1/73"));
        assert_eq!(ports.len(), 7);

        assert!(profile.is_breakout_port("E1/53"));
        assert!(!profile.is_breakout_port("E1/50"));
        assert!(!profile.is_breakout_port("E1/1"));
    }

    #[test]
    fn test_single_lane_alternative() {
        let profile = SwitchProfile::get("vs").expect("vs profile");
        let mode = profile.single_lane_alternative().expect("alternative");
        assert_ne!(mode, profile.default_breakout);
        assert_eq!(profile.breakout_modes[mode].offsets.len(), 1);
    }
}
