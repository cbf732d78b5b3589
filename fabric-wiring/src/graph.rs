use fabric_types::connection::{Connection, ConnectionKind};
use fabric_types::wiring::{
    External, Gateway, Ipv4Namespace, Server, Switch, SwitchGroup, VlanNamespace,
};
use fabric_types::vpc::ExternalAttachment;

/// The typed wiring graph. Produced once by the synthesizer, then persisted;
/// after persistence the object store becomes the source of truth and the
/// graph is treated read-only by the VLAB compiler.
#[derive(Debug, Clone, Default)]
pub struct WiringGraph {
    pub vlan_namespaces: Vec<VlanNamespace>,
    pub ipv4_namespaces: Vec<Ipv4Namespace>,
    pub switch_groups: Vec<SwitchGroup>,
    pub switches: Vec<Switch>,
    pub servers: Vec<Server>,
    pub gateways: Vec<Gateway>,
    pub externals: Vec<External>,
    pub connections: Vec<Connection>,
    pub external_attachments: Vec<ExternalAttachment>,
}

impl WiringGraph {
    pub fn switch(&self, name: &str) -> Option<&Switch> {
        self.switches.iter().find(|s| s.name() == name)
    }

    pub fn server(&self, name: &str) -> Option<&Server> {
        self.servers.iter().find(|s| s.name() == name)
    }

    /// Spines in creation order.
    pub fn spines(&self) -> impl Iterator<Item = &Switch> {
        self.switches.iter().filter(|s| s.role.is_spine())
    }

    /// Leaves in creation order.
    pub fn leaves(&self) -> impl Iterator<Item = &Switch> {
        self.switches.iter().filter(|s| s.role.is_leaf())
    }

    pub fn connections_of(&self, kind: ConnectionKind) -> impl Iterator<Item = &Connection> {
        self.connections.iter().filter(move |c| c.kind() == Some(kind))
    }

    /// Every device that can terminate a link, by name.
    pub fn device_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        names.extend(self.switches.iter().map(|s| s.name()));
        names.extend(self.servers.iter().map(|s| s.name()));
        names.extend(self.gateways.iter().map(|g| g.name()));
        names.extend(self.externals.iter().map(|e| e.name()));
        names
    }
}
