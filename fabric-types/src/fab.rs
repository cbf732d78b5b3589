use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Inventory and control-plane settings loaded from `fab.yaml`. This is the
/// source of truth for which nodes exist before any wiring is synthesized.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct FabConfig {
    #[serde(default)]
    pub controls: Vec<ControlNode>,
    #[serde(default)]
    pub nodes: Vec<FabNode>,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl FabConfig {
    /// The single gateway node, if the inventory declares one.
    pub fn gateway_node(&self) -> Option<&FabNode> {
        self.nodes
            .iter()
            .find(|n| n.roles.contains(&NodeRole::Gateway))
    }

    pub fn gateway_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| n.roles.contains(&NodeRole::Gateway))
            .count()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ControlNode {
    pub name: String,
    /// Interface facing the host (usernet in the VLAB).
    #[serde(default = "default_external_iface")]
    pub external_iface: String,
    /// Interface facing the fabric management network.
    #[serde(default = "default_mgmt_iface")]
    pub mgmt_iface: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ControlNode {
    pub fn is_hardware(&self) -> bool {
        crate::meta::annotations_mark_hardware(&self.annotations)
    }

    /// PCI passthrough for the management interface, if annotated.
    pub fn mgmt_passthrough(&self) -> Option<String> {
        crate::meta::annotations_passthrough_links(&self.annotations)
            .remove(&self.mgmt_iface)
    }
}

fn default_external_iface() -> String {
    "enp2s0".to_string()
}

fn default_mgmt_iface() -> String {
    "enp2s1".to_string()
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct FabNode {
    pub name: String,
    #[serde(default)]
    pub roles: Vec<NodeRole>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum NodeRole {
    Gateway,
}

/// Log/metric push targets the observability tests probe.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub loki_targets: BTreeMap<String, PushTarget>,
    #[serde(default)]
    pub prometheus_targets: BTreeMap<String, PushTarget>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct PushTarget {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basic_auth: Option<BasicAuth>,
    /// Extra labels stamped onto pushed data; the `env` label scopes
    /// freshness queries.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl PushTarget {
    pub fn env_label(&self) -> Option<&str> {
        self.labels.get("env").map(String::as_str)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}
