use std::fmt;

use serde::{de::Visitor, Deserialize, Serialize, Serializer};

use crate::ids::{self, IdError};
use crate::CompileError;

/// Transport binding of one NIC, persisted in the VLAB config as a short
/// string form and compiled to the runner's netdev/device pair.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NicBinding {
    /// Socket to its own port; keeps positional NIC indices stable.
    Noop,
    /// UDP socket cross-wired to `<vm>/<nic>` of another VM.
    Direct { peer: String },
    /// Host-visible user-mode network with an SSH forward.
    Usernet,
    /// Tap bridged into the host-side management network.
    Management,
    /// Host PCI device handed into the VM.
    Passthrough { pci: String },
}

impl NicBinding {
    pub fn encode(&self) -> String {
        match self {
            NicBinding::Noop => "noop".to_string(),
            NicBinding::Direct { peer } => format!("direct:{}", peer),
            NicBinding::Usernet => "usernet".to_string(),
            NicBinding::Management => "management".to_string(),
            NicBinding::Passthrough { pci } => format!("passthrough:{}", pci),
        }
    }

    pub fn parse(value: &str) -> Result<Self, CompileError> {
        if let Some(peer) = value.strip_prefix("direct:") {
            if peer.split('/').count() < 2 {
                return Err(CompileError::InvalidBinding {
                    binding: value.to_string(),
                });
            }
            return Ok(NicBinding::Direct {
                peer: peer.to_string(),
            });
        }
        if let Some(pci) = value.strip_prefix("passthrough:") {
            if pci.is_empty() {
                return Err(CompileError::InvalidBinding {
                    binding: value.to_string(),
                });
            }
            return Ok(NicBinding::Passthrough {
                pci: pci.to_string(),
            });
        }
        match value {
            "noop" => Ok(NicBinding::Noop),
            "usernet" => Ok(NicBinding::Usernet),
            "management" => Ok(NicBinding::Management),
            _ => Err(CompileError::InvalidBinding {
                binding: value.to_string(),
            }),
        }
    }
}

impl fmt::Display for NicBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl Serialize for NicBinding {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.encode())
    }
}

impl<'de> Deserialize<'de> for NicBinding {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_str(BindingVisitor)
    }
}

struct BindingVisitor;

impl<'de> Visitor<'de> for BindingVisitor {
    type Value = NicBinding;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(
            formatter,
            "a NIC binding such as \"usernet\", \"direct:<vm>/<nic>\" or \"passthrough:<pci>\""
        )
    }

    fn visit_str<E>(self, s: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        NicBinding::parse(s).map_err(serde::de::Error::custom)
    }
}

/// The two-part launch descriptor of one NIC, wire-exact for the external
/// runner. Passthrough NICs have an empty netdev part.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct NicDescriptor {
    pub netdev: String,
    pub device: String,
}

/// API ports forwarded from the host on the first control VM only.
pub const CONTROL_API_PORTS: [u16; 2] = [6443, 31000];

pub(crate) struct NetdevParams {
    pub vm: u32,
    pub nic: u32,
    /// Forward the control-plane API ports on this usernet.
    pub api_forwards: bool,
    /// Append `restrict=yes` to usernet netdevs.
    pub restricted: bool,
    /// Tap index for management netdevs.
    pub tap: u32,
    /// Overrides the identity-space MAC on the emitted device, used for
    /// switch boot MACs.
    pub mac_override: Option<String>,
}

pub(crate) fn compile_nic(
    binding: &NicBinding,
    peer_port: Option<u16>,
    params: &NetdevParams,
) -> Result<NicDescriptor, IdError> {
    let own_port = ids::direct_port(params.vm, params.nic)?;
    let (bus, addr) = ids::pci_slot(params.vm, params.nic)?;
    let mac = params
        .mac_override
        .clone()
        .unwrap_or_else(|| ids::mac(params.vm, params.nic));
    let device = format!(
        "-device e1000,netdev=eth{:02},mac={},bus=pcibr{},addr=0x{:x}",
        params.nic, mac, bus, addr
    );

    let descriptor = match binding {
        NicBinding::Noop => NicDescriptor {
            netdev: format!(
                "-netdev socket,udp=127.0.0.1:{},id=eth{:02}",
                own_port, params.nic
            ),
            device,
        },
        NicBinding::Direct { .. } => {
            // The peer port is resolved by the compiler before this point.
            let peer = peer_port.unwrap_or(own_port);
            NicDescriptor {
                netdev: format!(
                    "-netdev socket,udp=127.0.0.1:{},localaddr=127.0.0.1:{},id=eth{:02}",
                    peer, own_port, params.nic
                ),
                device,
            }
        }
        NicBinding::Usernet => {
            let ssh = ids::ssh_port(params.vm)?;
            let mut opts = format!(
                "-netdev user,hostfwd=tcp:0.0.0.0:{}-:22,net=172.31.{}.0/24,dhcpstart=172.31.{}.10",
                ssh, params.vm, params.vm
            );
            if params.api_forwards {
                for port in CONTROL_API_PORTS {
                    opts.push_str(&format!(",hostfwd=tcp:0.0.0.0:{}-:{}", port, port));
                }
            }
            if params.restricted {
                opts.push_str(",restrict=yes");
            }
            opts.push_str(&format!(",id=eth{:02}", params.nic));
            NicDescriptor {
                netdev: opts,
                device,
            }
        }
        NicBinding::Management => NicDescriptor {
            netdev: format!(
                "-netdev tap,ifname=hhtap{},script=no,downscript=no,id=eth{:02}",
                params.tap, params.nic
            ),
            device,
        },
        NicBinding::Passthrough { pci } => NicDescriptor {
            netdev: String::new(),
            device: format!("-device vfio-pci,host={}", pci),
        },
    };
    Ok(descriptor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binding_string_roundtrip() {
        for (text, binding) in [
            ("noop", NicBinding::Noop),
            ("usernet", NicBinding::Usernet),
            ("management", NicBinding::Management),
            (
                "direct:leaf-01/E1/3",
                NicBinding::Direct {
                    peer: "leaf-01/E1/3".to_string(),
                },
            ),
            (
                "passthrough:0000:2b:00.0",
                NicBinding::Passthrough {
                    pci: "0000:2b:00.0".to_string(),
                },
            ),
        ] {
            assert_eq!(NicBinding::parse(text).expect("parse"), binding);
            assert_eq!(binding.encode(), text);
        }

        assert!(NicBinding::parse("direct:leaf-01").is_err());
        assert!(NicBinding::parse("passthrough:").is_err());
        assert!(NicBinding::parse("bridge").is_err());
    }

    fn params(vm: u32, nic: u32) -> NetdevParams {
        NetdevParams {
            vm,
            nic,
            api_forwards: false,
            restricted: false,
            tap: 0,
            mac_override: None,
        }
    }

    #[test]
    fn test_noop_descriptor() {
        let nic = compile_nic(&NicBinding::Noop, None, &params(2, 5)).expect("compile");
        assert_eq!(nic.netdev, "-netdev socket,udp=127.0.0.1:22305,id=eth05");
        assert_eq!(
            nic.device,
            "-device e1000,netdev=eth05,mac=0c:20:12:fe:02:05,bus=pcibr0,addr=0x5"
        );
    }

    #[test]
    fn test_direct_descriptor_carries_both_ports() {
        let binding = NicBinding::Direct {
            peer: "leaf-01/E1/1".to_string(),
        };
        let nic = compile_nic(&binding, Some(22201), &params(3, 4)).expect("compile");
        assert_eq!(
            nic.netdev,
            "-netdev socket,udp=127.0.0.1:22201,localaddr=127.0.0.1:22404,id=eth04"
        );
    }

    #[test]
    fn test_usernet_descriptor() {
        let mut p = params(1, 0);
        let nic = compile_nic(&NicBinding::Usernet, None, &p).expect("compile");
        assert_eq!(
            nic.netdev,
            "-netdev user,hostfwd=tcp:0.0.0.0:22001-:22,net=172.31.1.0/24,dhcpstart=172.31.1.10,id=eth00"
        );

        p.api_forwards = true;
        p.restricted = true;
        let nic = compile_nic(&NicBinding::Usernet, None, &p).expect("compile");
        assert!(nic.netdev.contains("hostfwd=tcp:0.0.0.0:6443-:6443"));
        assert!(nic.netdev.contains("hostfwd=tcp:0.0.0.0:31000-:31000"));
        assert!(nic.netdev.ends_with(",restrict=yes,id=eth00"));
    }

    #[test]
    fn test_management_descriptor_uses_tap_index() {
        let mut p = params(0, 0);
        p.tap = 3;
        let nic = compile_nic(&NicBinding::Management, None, &p).expect("compile");
        assert_eq!(
            nic.netdev,
            "-netdev tap,ifname=hhtap3,script=no,downscript=no,id=eth00"
        );
    }

    #[test]
    fn test_management_descriptor_boot_mac_override() {
        let mut p = params(4, 0);
        p.mac_override = Some("0c:20:12:ff:02:00".to_string());
        let nic = compile_nic(&NicBinding::Management, None, &p).expect("compile");
        assert!(nic.device.contains("mac=0c:20:12:ff:02:00"));
    }

    #[test]
    fn test_passthrough_descriptor_has_no_netdev() {
        let binding = NicBinding::Passthrough {
            pci: "0000:2b:00.0".to_string(),
        };
        let nic = compile_nic(&binding, None, &params(0, 1)).expect("compile");
        assert!(nic.netdev.is_empty());
        assert_eq!(nic.device, "-device vfio-pci,host=0000:2b:00.0");
    }

    #[test]
    fn test_nic_index_bounded() {
        let err = compile_nic(&NicBinding::Noop, None, &params(0, 64)).expect_err("over limit");
        assert!(matches!(err, IdError::NicOutOfRange { nic: 64, .. }));
    }
}
