use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// UDP port of NIC 0 on VM 0; each VM owns a 100-port window.
pub const DIRECT_PORT_BASE: u32 = 22100;
/// SSH forward port of VM 0.
pub const SSH_PORT_BASE: u32 = 22000;
/// Two PCI bridges with 32 slots each.
pub const MAX_VM_NICS: u32 = 64;
const PCI_BRIDGE_SLOTS: u32 = 32;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum IdError {
    #[error("NIC index {nic} on VM {vm} out of range, max {max} NICs per VM")]
    NicOutOfRange { vm: u32, nic: u32, max: u32 },

    #[error("direct port for VM {vm} NIC {nic} does not fit a UDP port")]
    PortOverflow { vm: u32, nic: u32 },
}

/// VM type, in identity-assignment order.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum VmKind {
    Control,
    Switch,
    Server,
    Gateway,
    External,
}

/// Stable name -> VM-ID assignment: ordered by VM type first, then
/// lexicographically by name. Recomputed on every compile; the mapping
/// depends only on the sorted input, never on insertion order.
#[derive(Debug, Clone, Default)]
pub struct VmIds {
    ids: BTreeMap<String, u32>,
}

impl VmIds {
    pub fn assign(vms: impl IntoIterator<Item = (VmKind, String)>) -> Self {
        let mut vms: Vec<(VmKind, String)> = vms.into_iter().collect();
        vms.sort();
        let ids = vms
            .into_iter()
            .enumerate()
            .map(|(id, (_, name))| (name, id as u32))
            .collect();
        Self { ids }
    }

    pub fn get(&self, name: &str) -> Option<u32> {
        self.ids.get(name).copied()
    }

    /// `(name, id)` pairs in ascending ID order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, u32)> {
        let mut pairs: Vec<(&str, u32)> =
            self.ids.iter().map(|(name, id)| (name.as_str(), *id)).collect();
        pairs.sort_by_key(|(_, id)| *id);
        pairs.into_iter()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// NIC MAC, unique across the 2^16 (vm, nic) space.
pub fn mac(vm: u32, nic: u32) -> String {
    format!("0c:20:12:fe:{:02x}:{:02x}", vm & 0xff, nic & 0xff)
}

/// Deterministic VM UUID.
pub fn uuid(vm: u32) -> String {
    format!("77924ab4-a93b-41d4-928e-{:012}", vm)
}

/// UDP port carrying a direct NIC-to-NIC transport.
pub fn direct_port(vm: u32, nic: u32) -> Result<u16, IdError> {
    let port = DIRECT_PORT_BASE + 100 * vm + nic;
    u16::try_from(port).map_err(|_| IdError::PortOverflow { vm, nic })
}

/// Host port forwarding to the VM's SSH daemon over usernet.
pub fn ssh_port(vm: u32) -> Result<u16, IdError> {
    u16::try_from(SSH_PORT_BASE + vm).map_err(|_| IdError::PortOverflow { vm, nic: 0 })
}

/// PCI placement of a NIC: `(bridge, slot)`.
pub fn pci_slot(vm: u32, nic: u32) -> Result<(u32, u32), IdError> {
    if nic >= MAX_VM_NICS {
        return Err(IdError::NicOutOfRange {
            vm,
            nic,
            max: MAX_VM_NICS,
        });
    }
    Ok((nic / PCI_BRIDGE_SLOTS, nic % PCI_BRIDGE_SLOTS))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vm_ids_ordered_by_kind_then_name() {
        let ids = VmIds::assign([
            (VmKind::Server, "server-02".to_string()),
            (VmKind::External, "external".to_string()),
            (VmKind::Switch, "spine-01".to_string()),
            (VmKind::Control, "control-1".to_string()),
            (VmKind::Switch, "leaf-01".to_string()),
            (VmKind::Server, "server-01".to_string()),
            (VmKind::Gateway, "gateway-1".to_string()),
        ]);

        assert_eq!(ids.get("control-1"), Some(0));
        assert_eq!(ids.get("leaf-01"), Some(1));
        assert_eq!(ids.get("spine-01"), Some(2));
        assert_eq!(ids.get("server-01"), Some(3));
        assert_eq!(ids.get("server-02"), Some(4));
        assert_eq!(ids.get("gateway-1"), Some(5));
        assert_eq!(ids.get("external"), Some(6));
        assert_eq!(ids.get("missing"), None);
    }

    #[test]
    fn test_assignment_independent_of_input_order() {
        let forward = VmIds::assign([
            (VmKind::Server, "server-01".to_string()),
            (VmKind::Server, "server-02".to_string()),
        ]);
        let reversed = VmIds::assign([
            (VmKind::Server, "server-02".to_string()),
            (VmKind::Server, "server-01".to_string()),
        ]);
        assert_eq!(forward.get("server-01"), reversed.get("server-01"));
        assert_eq!(forward.get("server-02"), reversed.get("server-02"));
    }

    #[test]
    fn test_mac_collision_freedom() {
        let mut seen = std::collections::HashSet::new();
        for vm in 0..=255 {
            for nic in 0..MAX_VM_NICS {
                assert!(seen.insert(mac(vm, nic)), "collision at vm={} nic={}", vm, nic);
            }
        }
    }

    #[test]
    fn test_port_formulas() {
        assert_eq!(direct_port(0, 0), Ok(22100));
        assert_eq!(direct_port(3, 7), Ok(22100 + 300 + 7));
        assert_eq!(ssh_port(0), Ok(22000));
        assert_eq!(ssh_port(12), Ok(22012));
        assert!(direct_port(500, 0).is_err());
    }

    #[test]
    fn test_pci_layout() {
        assert_eq!(pci_slot(0, 0), Ok((0, 0)));
        assert_eq!(pci_slot(0, 31), Ok((0, 31)));
        assert_eq!(pci_slot(0, 32), Ok((1, 0)));
        assert_eq!(pci_slot(0, 63), Ok((1, 31)));
        assert_eq!(
            pci_slot(2, 64),
            Err(IdError::NicOutOfRange {
                vm: 2,
                nic: 64,
                max: 64
            })
        );
    }

    #[test]
    fn test_uuid_template() {
        assert_eq!(uuid(7), "77924ab4-a93b-41d4-928e-000000000007");
    }
}
