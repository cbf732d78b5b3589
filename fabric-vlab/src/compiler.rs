use std::collections::BTreeMap;

use fabric_types::connection::Port;
use fabric_types::fab::FabConfig;
use fabric_wiring::ports::PortError;
use fabric_wiring::{nic_id, WiringGraph};
use log::debug;
use serde::Serialize;
use thiserror::Error;

use crate::config::{VlabConfig, VmEntry};
use crate::external::{ExternalVrf, ExternalsConfig, NicAttachment, FABRIC_ASN, VRF_TABLE_BASE};
use crate::ids::{self, IdError, VmIds, VmKind};
use crate::netdev::{compile_nic, NetdevParams, NicBinding, NicDescriptor};
use crate::sizes::{VmSize, VmSizeOverrides, VmSizes};

/// All virtual externals share one VM.
pub const EXTERNAL_VM_NAME: &str = "external";

#[derive(Error, Debug)]
pub enum CompileError {
    #[error("duplicate VM name {name}")]
    DuplicateVm { name: String },

    #[error("link endpoint references unknown device {device}")]
    UnknownDevice { device: String },

    #[error("VM {vm} has a direct binding to unknown VM {peer}")]
    UnknownPeer { vm: String, peer: String },

    #[error("invalid NIC binding {binding:?}")]
    InvalidBinding { binding: String },

    #[error("node {node} has no management interface")]
    MissingManagement { node: String },

    #[error("control node {node} cannot be hardware")]
    HardwareControl { node: String },

    #[error("{device}/{port} faces hardware but has no PCI passthrough annotation")]
    PassthroughMissingPci { device: String, port: String },

    #[error("VM {vm} has two NICs with index {nic}")]
    DuplicateNicIndex { vm: String, nic: u32 },

    #[error("NIC {nic} mixes tagged and untagged external sessions")]
    MixedTagging { nic: String },

    #[error("NIC {nic} has more than one untagged external session")]
    MultipleUntagged { nic: String },

    #[error(transparent)]
    Id(#[from] IdError),

    #[error(transparent)]
    Port(#[from] PortError),
}

/// Run options of a compile.
#[derive(Debug, Clone, Copy, Default)]
pub struct VlabOpts {
    /// Append `restrict=yes` to control-VM usernets.
    pub controls_restricted: bool,
    /// Hand existing VM state to the runner untouched.
    pub no_create: bool,
    /// Ask the runner to discard and recreate VM state.
    pub re_create: bool,
    pub sizes: VmSizeOverrides,
}

/// One VM the external runner should launch.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct VmDescriptor {
    pub id: u32,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: VmKind,
    pub uuid: String,
    pub size: VmSize,
    /// Positional NIC descriptors, padded with noop bindings so indices
    /// stay stable.
    pub nics: Vec<NicDescriptor>,
}

#[derive(Clone, Debug, Default)]
pub struct Vlab {
    pub vms: Vec<VmDescriptor>,
    pub config: VlabConfig,
}

impl Vlab {
    pub fn vm(&self, name: &str) -> Option<&VmDescriptor> {
        self.vms.iter().find(|vm| vm.name == name)
    }
}

/// Compiles validated wiring plus the node inventory into VM descriptors.
/// The wiring is read-only here; the name -> VM-ID mapping is recomputed on
/// every compile.
pub struct VlabCompiler<'a> {
    wiring: &'a WiringGraph,
    fab: &'a FabConfig,
    opts: VlabOpts,
}

impl<'a> VlabCompiler<'a> {
    pub fn compile(
        wiring: &'a WiringGraph,
        fab: &'a FabConfig,
        opts: VlabOpts,
    ) -> Result<Vlab, CompileError> {
        let compiler = VlabCompiler { wiring, fab, opts };
        let mut vms = compiler.enumerate()?;
        let nic_by_conn = compiler.walk_connections(&mut vms)?;
        let externals = compiler.external_template(&nic_by_conn)?;
        compiler.emit(vms, externals)
    }

    // --- Pass 1: entity enumeration ---

    fn enumerate(&self) -> Result<BTreeMap<String, VmEntry>, CompileError> {
        let mut vms: BTreeMap<String, VmEntry> = BTreeMap::new();

        let mut insert = |vms: &mut BTreeMap<String, VmEntry>,
                          name: &str,
                          entry: VmEntry|
         -> Result<(), CompileError> {
            if vms.insert(name.to_string(), entry).is_some() {
                return Err(CompileError::DuplicateVm {
                    name: name.to_string(),
                });
            }
            Ok(())
        };

        for control in &self.fab.controls {
            if control.is_hardware() {
                return Err(CompileError::HardwareControl {
                    node: control.name.clone(),
                });
            }
            if control.mgmt_iface.is_empty() {
                return Err(CompileError::MissingManagement {
                    node: control.name.clone(),
                });
            }
            let mut nics = BTreeMap::new();
            nics.insert(control.external_iface.clone(), NicBinding::Usernet);
            let mgmt = match control.mgmt_passthrough() {
                Some(pci) => NicBinding::Passthrough { pci },
                None => NicBinding::Management,
            };
            nics.insert(control.mgmt_iface.clone(), mgmt);
            insert(
                &mut vms,
                &control.name,
                VmEntry {
                    kind: VmKind::Control,
                    nics,
                },
            )?;
        }

        for switch in &self.wiring.switches {
            if switch.meta.is_hardware() {
                continue;
            }
            let mut nics = BTreeMap::new();
            nics.insert("M1".to_string(), NicBinding::Management);
            insert(
                &mut vms,
                switch.name(),
                VmEntry {
                    kind: VmKind::Switch,
                    nics,
                },
            )?;
        }

        for server in &self.wiring.servers {
            if server.meta.is_hardware() {
                continue;
            }
            let mut nics = BTreeMap::new();
            nics.insert("enp2s0".to_string(), NicBinding::Usernet);
            insert(
                &mut vms,
                server.name(),
                VmEntry {
                    kind: VmKind::Server,
                    nics,
                },
            )?;
        }

        for gateway in &self.wiring.gateways {
            if gateway.meta.is_hardware() {
                continue;
            }
            if self.fab.gateway_node().is_none() {
                debug!("gateway {} not in inventory, compiling anyway", gateway.name());
            }
            let mut nics = BTreeMap::new();
            nics.insert("enp2s0".to_string(), NicBinding::Management);
            insert(
                &mut vms,
                gateway.name(),
                VmEntry {
                    kind: VmKind::Gateway,
                    nics,
                },
            )?;
        }

        if self.wiring.externals.iter().any(|e| !e.meta.is_hardware()) {
            let mut nics = BTreeMap::new();
            nics.insert("enp2s0".to_string(), NicBinding::Usernet);
            insert(
                &mut vms,
                EXTERNAL_VM_NAME,
                VmEntry {
                    kind: VmKind::External,
                    nics,
                },
            )?;
        }

        Ok(vms)
    }

    // --- Pass 2: connection walk ---

    /// Cross-wire NICs for every link whose endpoints are both virtual,
    /// substitute passthrough bindings where one endpoint is hardware, and
    /// attach external-connection NICs to the shared external VM.
    /// Returns connection name -> external-VM NIC for the template pass.
    fn walk_connections(
        &self,
        vms: &mut BTreeMap<String, VmEntry>,
    ) -> Result<BTreeMap<String, String>, CompileError> {
        let mut nic_by_conn = BTreeMap::new();
        let mut ext_nic_seq: u32 = 1;

        for conn in &self.wiring.connections {
            if let Some(external) = &conn.external {
                if !vms.contains_key(EXTERNAL_VM_NAME) {
                    continue;
                }
                let switch_hw = self
                    .wiring
                    .switch(&external.port.device)
                    .map(|s| s.meta.is_hardware())
                    .unwrap_or(true);
                if switch_hw {
                    // The cabling to a hardware leaf is physical; nothing
                    // to wire on the shared external VM.
                    continue;
                }
                let nic_name = format!("enp2s{}", ext_nic_seq);
                ext_nic_seq += 1;
                let vm_port = Port::new(EXTERNAL_VM_NAME, &nic_name);
                self.wire(vms, &external.port, &vm_port)?;
                nic_by_conn.insert(conn.meta.name.clone(), nic_name);
                continue;
            }

            for link in conn.links() {
                self.wire(vms, &link.from, &link.to)?;
            }
        }
        Ok(nic_by_conn)
    }

    fn device_is_hardware(&self, device: &str) -> Result<bool, CompileError> {
        if device == EXTERNAL_VM_NAME {
            return Ok(false);
        }
        if let Some(switch) = self.wiring.switch(device) {
            return Ok(switch.meta.is_hardware());
        }
        if let Some(server) = self.wiring.server(device) {
            return Ok(server.meta.is_hardware());
        }
        if let Some(gateway) = self.wiring.gateways.iter().find(|g| g.name() == device) {
            return Ok(gateway.meta.is_hardware());
        }
        Err(CompileError::UnknownDevice {
            device: device.to_string(),
        })
    }

    fn passthrough_pci(&self, device: &str, port: &str) -> Option<String> {
        let meta = self
            .wiring
            .switch(device)
            .map(|s| &s.meta)
            .or_else(|| self.wiring.server(device).map(|s| &s.meta))
            .or_else(|| {
                self.wiring
                    .gateways
                    .iter()
                    .find(|g| g.name() == device)
                    .map(|g| &g.meta)
            })?;
        meta.passthrough_links().remove(port)
    }

    fn wire(
        &self,
        vms: &mut BTreeMap<String, VmEntry>,
        from: &Port,
        to: &Port,
    ) -> Result<(), CompileError> {
        let from_hw = self.device_is_hardware(&from.device)?;
        let to_hw = self.device_is_hardware(&to.device)?;

        match (from_hw, to_hw) {
            (false, false) => {
                self.bind(vms, from, NicBinding::Direct { peer: to.to_string() })?;
                self.bind(vms, to, NicBinding::Direct { peer: from.to_string() })?;
            }
            (false, true) => {
                let pci = self.passthrough_pci(&from.device, &from.port).ok_or_else(|| {
                    CompileError::PassthroughMissingPci {
                        device: from.device.clone(),
                        port: from.port.clone(),
                    }
                })?;
                self.bind(vms, from, NicBinding::Passthrough { pci })?;
            }
            (true, false) => {
                let pci = self.passthrough_pci(&to.device, &to.port).ok_or_else(|| {
                    CompileError::PassthroughMissingPci {
                        device: to.device.clone(),
                        port: to.port.clone(),
                    }
                })?;
                self.bind(vms, to, NicBinding::Passthrough { pci })?;
            }
            (true, true) => {}
        }
        Ok(())
    }

    fn bind(
        &self,
        vms: &mut BTreeMap<String, VmEntry>,
        port: &Port,
        binding: NicBinding,
    ) -> Result<(), CompileError> {
        let entry = vms
            .get_mut(&port.device)
            .ok_or_else(|| CompileError::UnknownDevice {
                device: port.device.clone(),
            })?;
        entry.nics.insert(port.port.clone(), binding);
        Ok(())
    }

    // --- External VM template ---

    fn external_template(
        &self,
        nic_by_conn: &BTreeMap<String, String>,
    ) -> Result<ExternalsConfig, CompileError> {
        let mut config = ExternalsConfig::default();

        for (index, external) in self
            .wiring
            .externals
            .iter()
            .filter(|e| !e.meta.is_hardware())
            .enumerate()
        {
            let asn = external
                .effective_asn()
                .or_else(|| {
                    self.wiring
                        .external_attachments
                        .iter()
                        .find(|a| a.external == external.name())
                        .map(|a| a.neighbor.asn)
                })
                .unwrap_or(FABRIC_ASN);
            config.vrfs.insert(
                external.name().to_string(),
                ExternalVrf {
                    table_id: VRF_TABLE_BASE + index as u32,
                    asn,
                    inbound_community: external.outbound_community.clone(),
                    outbound_community: external.inbound_community.clone(),
                },
            );
        }

        for attachment in &self.wiring.external_attachments {
            let Some(nic) = nic_by_conn.get(&attachment.connection) else {
                continue;
            };
            if !config.vrfs.contains_key(&attachment.external) {
                continue;
            }
            let (switch_addr, prefix_len) = attachment
                .switch_ip
                .split_once('/')
                .unwrap_or((attachment.switch_ip.as_str(), "24"));
            config
                .attachments
                .entry(nic.clone())
                .or_default()
                .push(NicAttachment {
                    prefix: format!("{}/{}", attachment.neighbor.ip, prefix_len),
                    neighbor_ip: switch_addr.to_string(),
                    neighbor_asn: FABRIC_ASN,
                    vlan: attachment.vlan,
                    vrf: attachment.external.clone(),
                });
        }

        config.check_tagging()?;
        Ok(config)
    }

    // --- Passes 3..5: descriptor emission ---

    fn emit(
        &self,
        vms: BTreeMap<String, VmEntry>,
        externals: ExternalsConfig,
    ) -> Result<Vlab, CompileError> {
        let ids = VmIds::assign(vms.iter().map(|(name, entry)| (entry.kind, name.clone())));
        let sizes = VmSizes::with_overrides(&self.opts.sizes);

        let first_control: Option<&str> = ids
            .iter()
            .find(|(name, _)| vms.get(*name).map(|e| e.kind) == Some(VmKind::Control))
            .map(|(name, _)| name);
        let first_control = first_control.map(str::to_string);

        let mut descriptors = Vec::new();
        let mut tap: u32 = 0;

        for (name, vm_id) in ids.iter() {
            let entry = match vms.get(name) {
                Some(entry) => entry,
                None => continue,
            };

            let mut indexed: BTreeMap<u32, (&str, &NicBinding)> = BTreeMap::new();
            for (nic_name, binding) in &entry.nics {
                let index = nic_id(nic_name)? as u32;
                if indexed.insert(index, (nic_name.as_str(), binding)).is_some() {
                    return Err(CompileError::DuplicateNicIndex {
                        vm: name.to_string(),
                        nic: index,
                    });
                }
            }

            let boot_mac = self
                .wiring
                .switch(name)
                .filter(|s| !s.boot_mac.is_empty())
                .map(|s| s.boot_mac.clone());

            let mut nics = Vec::new();
            if let Some(max_index) = indexed.keys().max().copied() {
                for index in 0..=max_index {
                    let (binding, is_management_port) = match indexed.get(&index) {
                        Some((_, binding)) => (*binding, matches!(binding, NicBinding::Management)),
                        None => (&NicBinding::Noop, false),
                    };

                    let peer_port = match binding {
                        NicBinding::Direct { peer } => Some(self.peer_port(&ids, name, peer)?),
                        _ => None,
                    };

                    let params = NetdevParams {
                        vm: vm_id,
                        nic: index,
                        api_forwards: matches!(binding, NicBinding::Usernet)
                            && first_control.as_deref() == Some(name),
                        restricted: self.opts.controls_restricted
                            && entry.kind == VmKind::Control,
                        tap,
                        mac_override: if is_management_port && entry.kind == VmKind::Switch {
                            boot_mac.clone()
                        } else {
                            None
                        },
                    };
                    if is_management_port {
                        tap += 1;
                    }
                    nics.push(compile_nic(binding, peer_port, &params)?);
                }
            }

            descriptors.push(VmDescriptor {
                id: vm_id,
                name: name.to_string(),
                kind: entry.kind,
                uuid: ids::uuid(vm_id),
                size: sizes.for_kind(entry.kind),
                nics,
            });
        }

        Ok(Vlab {
            vms: descriptors,
            config: VlabConfig {
                sizes,
                vms,
                externals,
            },
        })
    }

    fn peer_port(&self, ids: &VmIds, vm: &str, peer: &str) -> Result<u16, CompileError> {
        let (device, nic_name) = peer.split_once('/').ok_or_else(|| {
            CompileError::InvalidBinding {
                binding: format!("direct:{}", peer),
            }
        })?;
        let peer_vm = ids.get(device).ok_or_else(|| CompileError::UnknownPeer {
            vm: vm.to_string(),
            peer: peer.to_string(),
        })?;
        let peer_nic = nic_id(nic_name)? as u32;
        Ok(ids::direct_port(peer_vm, peer_nic)?)
    }
}
