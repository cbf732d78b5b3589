use serde::{Deserialize, Serialize};

use crate::meta::Meta;
use crate::store::Object;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SwitchRole {
    Spine,
    ServerLeaf,
}

impl SwitchRole {
    pub fn is_leaf(&self) -> bool {
        matches!(self, SwitchRole::ServerLeaf)
    }

    pub fn is_spine(&self) -> bool {
        matches!(self, SwitchRole::Spine)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RedundancyKind {
    Mclag,
    Eslag,
}

/// Redundancy group membership of a leaf. Spines never carry one.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Redundancy {
    pub group: String,
    pub kind: RedundancyKind,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Switch {
    pub meta: Meta,
    pub role: SwitchRole,
    pub profile: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redundancy: Option<Redundancy>,
    /// MAC the virtual switch boots from, assigned at synthesis time.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub boot_mac: String,
    /// Breakout mode per breakout-capable port, e.g. `E1/55 -> "4x25G"`.
    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub port_breakouts: std::collections::BTreeMap<String, String>,
    /// RoCE lossless-queue configuration toggle.
    #[serde(default)]
    pub roce: bool,
}

impl Switch {
    pub fn name(&self) -> &str {
        &self.meta.name
    }
}

impl Object for Switch {
    const KIND: &'static str = "switches";

    fn meta(&self) -> &Meta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut Meta {
        &mut self.meta
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Server {
    pub meta: Meta,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl Server {
    pub fn name(&self) -> &str {
        &self.meta.name
    }
}

impl Object for Server {
    const KIND: &'static str = "servers";

    fn meta(&self) -> &Meta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut Meta {
        &mut self.meta
    }
}

/// A node bridging VPC traffic to externals. At most one per deployment.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Gateway {
    pub meta: Meta,
    /// Uplink interface names, `enp2s1..enp2s<k>`.
    pub uplinks: Vec<String>,
}

impl Gateway {
    pub fn name(&self) -> &str {
        &self.meta.name
    }
}

impl Object for Gateway {
    const KIND: &'static str = "gateways";

    fn meta(&self) -> &Meta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut Meta {
        &mut self.meta
    }
}

/// A BGP peer outside the fabric, attached through a leaf.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct External {
    pub meta: Meta,
    pub ipv4_namespace: String,
    pub inbound_community: String,
    pub outbound_community: String,
    /// Explicit ASN; inferred from attachments when absent, and
    /// overridable by the `asn.hhfab.githedgehog.com` annotation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asn: Option<u32>,
}

impl External {
    pub fn name(&self) -> &str {
        &self.meta.name
    }

    pub fn effective_asn(&self) -> Option<u32> {
        self.meta.asn_override().or(self.asn)
    }
}

impl Object for External {
    const KIND: &'static str = "externals";

    fn meta(&self) -> &Meta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut Meta {
        &mut self.meta
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct VlanNamespace {
    pub meta: Meta,
    /// Inclusive VLAN ranges available to VPC subnets.
    pub ranges: Vec<VlanRange>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct VlanRange {
    pub from: u16,
    pub to: u16,
}

impl Object for VlanNamespace {
    const KIND: &'static str = "vlannamespaces";

    fn meta(&self) -> &Meta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut Meta {
        &mut self.meta
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Ipv4Namespace {
    pub meta: Meta,
    /// CIDRs the namespace hands out VPC subnets from.
    pub subnets: Vec<String>,
}

impl Object for Ipv4Namespace {
    const KIND: &'static str = "ipv4namespaces";

    fn meta(&self) -> &Meta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut Meta {
        &mut self.meta
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct SwitchGroup {
    pub meta: Meta,
}

impl Object for SwitchGroup {
    const KIND: &'static str = "switchgroups";

    fn meta(&self) -> &Meta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut Meta {
        &mut self.meta
    }
}
