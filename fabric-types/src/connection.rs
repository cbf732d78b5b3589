use std::fmt;

use serde::{de::Visitor, Deserialize, Serialize, Serializer};

use crate::meta::Meta;
use crate::store::Object;

/// One side of a link, e.g. `leaf-01/E1/3` or `server-02/enp2s1`.
///
/// Serialized as `<device>/<port>`; the device name never contains a slash,
/// so everything after the first one is the port name.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Port {
    pub device: String,
    pub port: String,
}

impl Port {
    pub fn new(device: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            port: port.into(),
        }
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device, self.port)
    }
}

impl TryFrom<&str> for Port {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value.split_once('/') {
            Some((device, port)) if !device.is_empty() && !port.is_empty() => Ok(Port {
                device: device.to_string(),
                port: port.to_string(),
            }),
            _ => Err(format!("invalid port {:?}, expected <device>/<port>", value)),
        }
    }
}

impl Serialize for Port {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Port {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_str(PortVisitor)
    }
}

struct PortVisitor;

impl<'de> Visitor<'de> for PortVisitor {
    type Value = Port;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(formatter, "a port formatted as \"<device>/<port>\", e.g. \"leaf-01/E1/3\"")
    }

    fn visit_str<E>(self, s: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        Port::try_from(s).map_err(serde::de::Error::custom)
    }
}

/// A single wire between two ports.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Link {
    pub from: Port,
    pub to: Port,
}

impl Link {
    pub fn new(from: Port, to: Port) -> Self {
        Self { from, to }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct FabricConn {
    pub links: Vec<Link>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct MeshConn {
    pub links: Vec<Link>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct GatewayConn {
    pub links: Vec<Link>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct MclagConn {
    pub links: Vec<Link>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct EslagConn {
    pub links: Vec<Link>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct BundledConn {
    pub links: Vec<Link>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct UnbundledConn {
    pub link: Link,
}

/// Session + peer links between the two leaves of an MCLAG pair.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct MclagDomainConn {
    pub session_links: Vec<Link>,
    pub peer_links: Vec<Link>,
}

/// Self-pair loops on a single leaf, used as a side-channel for VPC traffic.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct VpcLoopbackConn {
    pub links: Vec<Link>,
}

/// A leaf port facing a BGP peer outside the fabric.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ExternalConn {
    pub port: Port,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionKind {
    Fabric,
    Mesh,
    Gateway,
    Mclag,
    Eslag,
    Bundled,
    Unbundled,
    MclagDomain,
    VpcLoopback,
    External,
}

impl ConnectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionKind::Fabric => "fabric",
            ConnectionKind::Mesh => "mesh",
            ConnectionKind::Gateway => "gateway",
            ConnectionKind::Mclag => "mclag",
            ConnectionKind::Eslag => "eslag",
            ConnectionKind::Bundled => "bundled",
            ConnectionKind::Unbundled => "unbundled",
            ConnectionKind::MclagDomain => "mclag-domain",
            ConnectionKind::VpcLoopback => "vpc-loopback",
            ConnectionKind::External => "external",
        }
    }
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tagged connection record. Exactly one kind field may be populated;
/// the wiring validator rejects zero- and multi-kind records.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Connection {
    pub meta: Meta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fabric: Option<FabricConn>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mesh: Option<MeshConn>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewayConn>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mclag: Option<MclagConn>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eslag: Option<EslagConn>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundled: Option<BundledConn>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unbundled: Option<UnbundledConn>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mclag_domain: Option<MclagDomainConn>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vpc_loopback: Option<VpcLoopbackConn>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<ExternalConn>,
}

impl Connection {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            meta: Meta::named(name),
            ..Default::default()
        }
    }

    /// Number of populated kind fields. Well-formed connections have exactly one.
    pub fn kind_count(&self) -> usize {
        [
            self.fabric.is_some(),
            self.mesh.is_some(),
            self.gateway.is_some(),
            self.mclag.is_some(),
            self.eslag.is_some(),
            self.bundled.is_some(),
            self.unbundled.is_some(),
            self.mclag_domain.is_some(),
            self.vpc_loopback.is_some(),
            self.external.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count()
    }

    pub fn kind(&self) -> Option<ConnectionKind> {
        if self.fabric.is_some() {
            Some(ConnectionKind::Fabric)
        } else if self.mesh.is_some() {
            Some(ConnectionKind::Mesh)
        } else if self.gateway.is_some() {
            Some(ConnectionKind::Gateway)
        } else if self.mclag.is_some() {
            Some(ConnectionKind::Mclag)
        } else if self.eslag.is_some() {
            Some(ConnectionKind::Eslag)
        } else if self.bundled.is_some() {
            Some(ConnectionKind::Bundled)
        } else if self.unbundled.is_some() {
            Some(ConnectionKind::Unbundled)
        } else if self.mclag_domain.is_some() {
            Some(ConnectionKind::MclagDomain)
        } else if self.vpc_loopback.is_some() {
            Some(ConnectionKind::VpcLoopback)
        } else if self.external.is_some() {
            Some(ConnectionKind::External)
        } else {
            None
        }
    }

    /// All links of this connection, session and peer links included.
    pub fn links(&self) -> Vec<&Link> {
        let mut links = Vec::new();
        if let Some(c) = &self.fabric {
            links.extend(c.links.iter());
        }
        if let Some(c) = &self.mesh {
            links.extend(c.links.iter());
        }
        if let Some(c) = &self.gateway {
            links.extend(c.links.iter());
        }
        if let Some(c) = &self.mclag {
            links.extend(c.links.iter());
        }
        if let Some(c) = &self.eslag {
            links.extend(c.links.iter());
        }
        if let Some(c) = &self.bundled {
            links.extend(c.links.iter());
        }
        if let Some(c) = &self.unbundled {
            links.push(&c.link);
        }
        if let Some(c) = &self.mclag_domain {
            links.extend(c.session_links.iter());
            links.extend(c.peer_links.iter());
        }
        if let Some(c) = &self.vpc_loopback {
            links.extend(c.links.iter());
        }
        links
    }

    /// Every endpoint port of this connection, external ports included.
    pub fn ports(&self) -> Vec<&Port> {
        let mut ports = Vec::new();
        for link in self.links() {
            ports.push(&link.from);
            ports.push(&link.to);
        }
        if let Some(c) = &self.external {
            ports.push(&c.port);
        }
        ports
    }

    /// Names of all devices touched by this connection.
    pub fn devices(&self) -> Vec<&str> {
        let mut devices: Vec<&str> = self.ports().into_iter().map(|p| p.device.as_str()).collect();
        devices.sort_unstable();
        devices.dedup();
        devices
    }
}

impl Object for Connection {
    const KIND: &'static str = "connections";

    fn meta(&self) -> &Meta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut Meta {
        &mut self.meta
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_roundtrip() {
        let port = Port::try_from("leaf-01/E1/3").expect("parse");
        assert_eq!(port.device, "leaf-01");
        assert_eq!(port.port, "E1/3");
        assert_eq!(port.to_string(), "leaf-01/E1/3");

        assert!(Port::try_from("leaf-01").is_err());
        assert!(Port::try_from("/E1/3").is_err());
        assert!(Port::try_from("leaf-01/").is_err());
    }

    #[test]
    fn test_port_serde_as_string() {
        let port = Port::new("server-01", "enp2s1");
        let yaml = serde_json::to_string(&port).expect("serialize");
        assert_eq!(yaml, "\"server-01/enp2s1\"");
        let back: Port = serde_json::from_str(&yaml).expect("deserialize");
        assert_eq!(back, port);
    }

    #[test]
    fn test_kind_exactly_one() {
        let mut conn = Connection::named("leaf-01--mclag-domain--leaf-02");
        assert_eq!(conn.kind_count(), 0);
        assert_eq!(conn.kind(), None);

        conn.mclag_domain = Some(MclagDomainConn::default());
        assert_eq!(conn.kind_count(), 1);
        assert_eq!(conn.kind(), Some(ConnectionKind::MclagDomain));

        conn.fabric = Some(FabricConn::default());
        assert_eq!(conn.kind_count(), 2);
    }

    #[test]
    fn test_links_and_ports_cover_mclag_domain() {
        let mut conn = Connection::named("leaf-01--mclag-domain--leaf-02");
        conn.mclag_domain = Some(MclagDomainConn {
            session_links: vec![Link::new(
                Port::new("leaf-01", "E1/1"),
                Port::new("leaf-02", "E1/1"),
            )],
            peer_links: vec![Link::new(
                Port::new("leaf-01", "E1/2"),
                Port::new("leaf-02", "E1/2"),
            )],
        });

        assert_eq!(conn.links().len(), 2);
        assert_eq!(conn.ports().len(), 4);
        assert_eq!(conn.devices(), vec!["leaf-01", "leaf-02"]);
    }
}
