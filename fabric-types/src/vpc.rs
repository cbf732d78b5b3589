use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::meta::Meta;
use crate::store::Object;

/// A tenant L2/L3 routing domain with VLAN-carrying subnets.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Vpc {
    pub meta: Meta,
    pub subnets: BTreeMap<String, VpcSubnet>,
    /// Groups of subnet names allowed to talk despite isolation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permits: Vec<Vec<String>>,
}

impl Vpc {
    pub fn name(&self) -> &str {
        &self.meta.name
    }

    /// Subnets with DHCP enabled, in name order.
    pub fn dhcp_subnets(&self) -> impl Iterator<Item = (&String, &VpcSubnet)> {
        self.subnets.iter().filter(|(_, s)| s.dhcp.enable)
    }
}

impl Object for Vpc {
    const KIND: &'static str = "vpcs";

    fn meta(&self) -> &Meta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut Meta {
        &mut self.meta
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct VpcSubnet {
    pub cidr: String,
    pub gateway: String,
    pub vlan: u16,
    #[serde(default)]
    pub dhcp: DhcpConfig,
    #[serde(default)]
    pub isolated: bool,
    #[serde(default)]
    pub restricted: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct DhcpConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<DhcpRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<DhcpOptions>,
    /// Static leases, MAC -> IP.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub static_leases: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DhcpRange {
    pub start: String,
    pub end: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct DhcpOptions {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns_servers: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub time_servers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface_mtu: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_time_seconds: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub advertised_routes: Vec<AdvertisedRoute>,
    #[serde(default)]
    pub disable_default_route: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct AdvertisedRoute {
    pub destination: String,
    pub gateway: String,
}

/// Attaches a VPC subnet (`<vpc>/<subnet>`) to a server-facing connection.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct VpcAttachment {
    pub meta: Meta,
    pub subnet: String,
    pub connection: String,
}

impl VpcAttachment {
    /// The `<vpc>` part of the subnet reference.
    pub fn vpc_name(&self) -> &str {
        self.subnet.split('/').next().unwrap_or(&self.subnet)
    }

    /// The `<subnet>` part of the subnet reference.
    pub fn subnet_name(&self) -> &str {
        self.subnet.split('/').nth(1).unwrap_or("")
    }
}

impl Object for VpcAttachment {
    const KIND: &'static str = "vpcattachments";

    fn meta(&self) -> &Meta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut Meta {
        &mut self.meta
    }
}

/// Attaches an External to an external-facing connection with the BGP
/// session parameters the leaf peers with.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ExternalAttachment {
    pub meta: Meta,
    pub external: String,
    pub connection: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan: Option<u16>,
    pub neighbor: BgpNeighbor,
    pub switch_ip: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct BgpNeighbor {
    pub asn: u32,
    pub ip: String,
}

impl Object for ExternalAttachment {
    const KIND: &'static str = "externalattachments";

    fn meta(&self) -> &Meta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut Meta {
        &mut self.meta
    }
}

/// Subnet-level permit list between two VPCs.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct VpcPeering {
    pub meta: Meta,
    pub permit: Vec<VpcPeeringEntry>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct VpcPeeringEntry {
    pub vpc: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subnets: Vec<String>,
}

impl Object for VpcPeering {
    const KIND: &'static str = "vpcpeerings";

    fn meta(&self) -> &Meta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut Meta {
        &mut self.meta
    }
}

/// Peering through a gateway, carrying NAT exposure per VPC.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct GatewayPeering {
    pub meta: Meta,
    /// VPC name -> what that VPC exposes to the other side.
    pub peerings: BTreeMap<String, PeeringEntry>,
    /// Gateway group serving this peering, if pinned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_group: Option<String>,
}

impl Object for GatewayPeering {
    const KIND: &'static str = "gatewaypeerings";

    fn meta(&self) -> &Meta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut Meta {
        &mut self.meta
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct PeeringEntry {
    pub expose: Vec<PeeringExpose>,
}

/// One exposure: the IPs a VPC offers and the NAT pool they appear as.
/// An empty `as` list means the exposure is not translated; a single-host
/// pool masquerades the whole exposure.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct PeeringExpose {
    pub ips: Vec<PeeringIps>,
    #[serde(default, rename = "as", skip_serializing_if = "Vec::is_empty")]
    pub nat: Vec<PeeringAs>,
    /// Port forwards punched through a masqueraded exposure.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortForward>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct PortForward {
    pub protocol: String,
    pub from: u16,
    pub to: u16,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct PeeringIps {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cidr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vpc_subnet: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct PeeringAs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cidr: Option<String>,
}

/// Named set of gateways with failover priorities.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct GatewayGroup {
    pub meta: Meta,
    pub members: Vec<GatewayGroupMember>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct GatewayGroupMember {
    pub gateway: String,
    pub priority: u32,
}

impl Object for GatewayGroup {
    const KIND: &'static str = "gatewaygroups";

    fn meta(&self) -> &Meta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut Meta {
        &mut self.meta
    }
}

/// Server-side view of one DHCP-enabled VPC subnet, named `<vpc>--<subnet>`.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct DhcpSubnet {
    pub meta: Meta,
    #[serde(default)]
    pub status: DhcpSubnetStatus,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct DhcpSubnetStatus {
    /// Current allocations, MAC -> IP.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub allocated: BTreeMap<String, String>,
}

impl Object for DhcpSubnet {
    const KIND: &'static str = "dhcpsubnets";

    fn meta(&self) -> &Meta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut Meta {
        &mut self.meta
    }
}
