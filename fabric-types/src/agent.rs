use serde::{Deserialize, Serialize};

use crate::meta::Meta;
use crate::store::Object;

/// Per-switch control agent object. Tests flip `spec.disabled` to freeze a
/// switch before perturbing its ports and re-enable it on revert.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Agent {
    pub meta: Meta,
    #[serde(default)]
    pub spec: AgentSpec,
    #[serde(default)]
    pub status: AgentStatus,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct AgentSpec {
    #[serde(default)]
    pub disabled: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct AgentStatus {
    /// Generation of the last spec the agent applied to the switch.
    #[serde(default)]
    pub last_applied_generation: i64,
    #[serde(default)]
    pub state: AgentState,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct AgentState {
    /// Whether the NOS currently has RoCE queue config applied.
    #[serde(default)]
    pub roce: bool,
}

impl Agent {
    pub fn name(&self) -> &str {
        &self.meta.name
    }
}

impl Object for Agent {
    const KIND: &'static str = "agents";

    fn meta(&self) -> &Meta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut Meta {
        &mut self.meta
    }
}
