use fabric_types::fab::FabConfig;
use serde::{Deserialize, Serialize};

use crate::validate::ValidationError;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum FabricMode {
    #[default]
    SpineLeaf,
    CollapsedCore,
}

/// High-level parametric intent the wiring synthesizer expands into a graph.
/// Zero counts mean "use the defaults" unless `no_switches` is set.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct TopologyIntent {
    #[serde(default)]
    pub fabric_mode: FabricMode,
    /// Build only the control/gateway nodes, no switch topology at all.
    #[serde(default)]
    pub no_switches: bool,

    #[serde(default)]
    pub spines: u32,
    /// Links between every spine-leaf pair.
    #[serde(default)]
    pub fabric_links: u32,
    /// Links between every leaf pair; mutually exclusive with fabric links.
    #[serde(default)]
    pub mesh_links: u32,

    #[serde(default)]
    pub mclag_leafs: u32,
    #[serde(default)]
    pub mclag_session_links: u32,
    #[serde(default)]
    pub mclag_peer_links: u32,
    /// ESLAG group sizes as a comma list, e.g. `"2,4,2"`.
    #[serde(default)]
    pub eslag_leaf_groups: String,
    #[serde(default)]
    pub orphan_leafs: u32,

    /// Servers per member leaf of each MCLAG pair.
    #[serde(default)]
    pub mclag_servers: u32,
    /// Servers per member leaf of each ESLAG group.
    #[serde(default)]
    pub eslag_servers: u32,
    /// Servers per leaf group, single link to the group's first leaf.
    #[serde(default)]
    pub unbundled_servers: u32,
    /// Servers per leaf group, bundled links to the group's second leaf.
    #[serde(default)]
    pub bundled_servers: u32,

    #[serde(default)]
    pub gateway_uplinks: u32,

    #[serde(default)]
    pub externals: u32,
    /// External connections landing on MCLAG leaves.
    #[serde(default)]
    pub mclag_external_conns: u32,
    /// External connections landing on ESLAG leaves.
    #[serde(default)]
    pub eslag_external_conns: u32,
    /// External connections landing on orphan leaves.
    #[serde(default)]
    pub orphan_external_conns: u32,

    /// Self-pair loopback links per leaf.
    #[serde(default)]
    pub vpc_loopbacks: u32,
}

impl TopologyIntent {
    /// Parsed ESLAG group sizes; sizes are validated in [`resolve`].
    pub fn eslag_groups(&self) -> Result<Vec<u32>, ValidationError> {
        if self.eslag_leaf_groups.is_empty() {
            return Ok(Vec::new());
        }
        self.eslag_leaf_groups
            .split(',')
            .map(|part| {
                part.trim().parse().map_err(|_| {
                    ValidationError::Intent(format!(
                        "invalid ESLAG leaf groups {:?}: {:?} is not a number",
                        self.eslag_leaf_groups, part
                    ))
                })
            })
            .collect()
    }

    fn topology_is_empty(&self) -> bool {
        self.spines == 0
            && self.fabric_links == 0
            && self.mclag_leafs == 0
            && self.eslag_leaf_groups.is_empty()
            && self.orphan_leafs == 0
    }

    /// Apply default resolution and check every intent-level constraint.
    /// Returns the fully resolved intent the builder runs from.
    pub fn resolve(&self, fab: &FabConfig) -> Result<TopologyIntent, ValidationError> {
        let mut intent = self.clone();

        if intent.no_switches {
            if !intent.topology_is_empty() || intent.mesh_links > 0 {
                return Err(ValidationError::Intent(
                    "switch counts are not allowed with no-switches".to_string(),
                ));
            }
            if intent.gateway_uplinks > 0 {
                return Err(ValidationError::Intent(
                    "gateway uplinks are not allowed with no-switches".to_string(),
                ));
            }
            return Ok(intent);
        }

        if intent.mesh_links > 0 && intent.fabric_links > 0 {
            return Err(ValidationError::Intent(
                "mesh links and fabric links are mutually exclusive".to_string(),
            ));
        }

        match intent.fabric_mode {
            FabricMode::SpineLeaf => {
                if intent.topology_is_empty() {
                    intent.mclag_leafs = 2;
                    intent.eslag_leaf_groups = "2".to_string();
                    intent.orphan_leafs = 1;
                    if intent.mesh_links == 0 {
                        intent.spines = 2;
                        intent.fabric_links = 2;
                    }
                    if intent.mclag_servers == 0
                        && intent.eslag_servers == 0
                        && intent.unbundled_servers == 0
                        && intent.bundled_servers == 0
                    {
                        intent.mclag_servers = 1;
                        intent.eslag_servers = 1;
                        intent.unbundled_servers = 1;
                        intent.bundled_servers = 1;
                    }
                    if intent.vpc_loopbacks == 0 {
                        intent.vpc_loopbacks = 2;
                    }
                }
                if intent.mesh_links > 0 && intent.spines > 0 {
                    return Err(ValidationError::Intent(
                        "spines are not allowed with mesh links".to_string(),
                    ));
                }
            }
            FabricMode::CollapsedCore => {
                if intent.spines > 0 {
                    return Err(ValidationError::Intent(
                        "spines are not supported for collapsed core fabric mode".to_string(),
                    ));
                }
                if intent.fabric_links > 0 {
                    return Err(ValidationError::Intent(
                        "fabric links are not supported for collapsed core fabric mode".to_string(),
                    ));
                }
                if !intent.eslag_leaf_groups.is_empty() {
                    return Err(ValidationError::Intent(
                        "ESLAG is not supported for collapsed core fabric mode".to_string(),
                    ));
                }
                if intent.orphan_leafs > 0 {
                    return Err(ValidationError::Intent(
                        "orphan leafs are not supported for collapsed core fabric mode".to_string(),
                    ));
                }
                if intent.mclag_leafs == 0 {
                    intent.mclag_leafs = 2;
                }
                if intent.mclag_leafs != 2 {
                    return Err(ValidationError::Intent(
                        "MCLAG leafs count must be 2 for collapsed core fabric mode".to_string(),
                    ));
                }
            }
        }

        if intent.mclag_leafs % 2 != 0 {
            return Err(ValidationError::Intent(format!(
                "MCLAG leafs count must be even, got {}",
                intent.mclag_leafs
            )));
        }
        if intent.mclag_leafs > 0 {
            if intent.mclag_session_links == 0 {
                intent.mclag_session_links = 2;
            }
            if intent.mclag_peer_links == 0 {
                intent.mclag_peer_links = 2;
            }
        }

        let eslag_groups = intent.eslag_groups()?;
        for size in &eslag_groups {
            if !(2..=4).contains(size) {
                return Err(ValidationError::Intent(format!(
                    "ESLAG leaf group size must be between 2 and 4, got {}",
                    size
                )));
            }
        }

        let mclag_leaf_count = intent.mclag_leafs;
        let eslag_leaf_count: u32 = eslag_groups.iter().sum();
        let total_leafs = mclag_leaf_count + eslag_leaf_count + intent.orphan_leafs;

        if intent.externals > 0 {
            if intent.mclag_external_conns > mclag_leaf_count {
                return Err(ValidationError::Intent(format!(
                    "external connections on MCLAG leaves ({}) exceed MCLAG leaf count ({})",
                    intent.mclag_external_conns, mclag_leaf_count
                )));
            }
            if intent.eslag_external_conns > eslag_leaf_count {
                return Err(ValidationError::Intent(format!(
                    "external connections on ESLAG leaves ({}) exceed ESLAG leaf count ({})",
                    intent.eslag_external_conns, eslag_leaf_count
                )));
            }
            if intent.orphan_external_conns > intent.orphan_leafs {
                return Err(ValidationError::Intent(format!(
                    "external connections on orphan leaves ({}) exceed orphan leaf count ({})",
                    intent.orphan_external_conns, intent.orphan_leafs
                )));
            }
        }

        if intent.gateway_uplinks > 0 {
            match fab.gateway_count() {
                0 => {
                    return Err(ValidationError::Intent(
                        "gateway uplinks requested but no inventory node has the gateway role"
                            .to_string(),
                    ))
                }
                1 => {}
                n => {
                    return Err(ValidationError::Intent(format!(
                        "at most one gateway node is allowed, inventory has {}",
                        n
                    )))
                }
            }
            if intent.fabric_mode != FabricMode::SpineLeaf {
                return Err(ValidationError::Intent(
                    "gateway is only supported for spine-leaf fabric mode".to_string(),
                ));
            }
            if intent.mesh_links == 0 && intent.gateway_uplinks > intent.spines {
                return Err(ValidationError::Intent(format!(
                    "gateway uplinks ({}) exceed spine count ({})",
                    intent.gateway_uplinks, intent.spines
                )));
            }
            if intent.mesh_links > 0 && intent.gateway_uplinks > total_leafs {
                return Err(ValidationError::Intent(format!(
                    "gateway uplinks ({}) exceed leaf count ({})",
                    intent.gateway_uplinks, total_leafs
                )));
            }
        } else if fab.gateway_count() > 1 {
            return Err(ValidationError::Intent(format!(
                "at most one gateway node is allowed, inventory has {}",
                fab.gateway_count()
            )));
        }

        Ok(intent)
    }
}
