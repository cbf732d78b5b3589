use std::collections::BTreeMap;

use fabric_types::connection::{
    BundledConn, Connection, EslagConn, ExternalConn, FabricConn, GatewayConn, Link, MclagConn,
    MclagDomainConn, MeshConn, Port, UnbundledConn, VpcLoopbackConn,
};
use fabric_types::fab::FabConfig;
use fabric_types::meta::{device_label, Meta, LABEL_CONNECTION_TYPE, LABEL_VALUE_TRUE};
use fabric_types::vpc::{BgpNeighbor, ExternalAttachment};
use fabric_types::wiring::{
    External, Gateway, Ipv4Namespace, Redundancy, RedundancyKind, Server, Switch, SwitchGroup,
    SwitchRole, VlanNamespace, VlanRange,
};
use log::{debug, warn};

use crate::graph::WiringGraph;
use crate::intent::{FabricMode, TopologyIntent};
use crate::ports::{ServerNicAllocator, SwitchPortAllocator};
use crate::profile::VS_PROFILE;
use crate::validate::{validate, ValidationError};

/// Default VLAN namespace handed to VPC subnets.
pub const DEFAULT_VLAN_RANGE: (u16, u16) = (1000, 2999);
/// Default IPv4 namespace VPC subnets are carved from.
pub const DEFAULT_IPV4_SUBNET: &str = "10.0.0.0/16";
/// Boot MAC template, the byte is an independent switch-creation counter.
pub const BOOT_MAC_TEMPLATE: &str = "0c:20:12:ff:%02x:00";
/// First VLAN handed to external attachments.
const EXTERNAL_VLAN_BASE: u16 = 10;
const EXTERNAL_VLAN_STEP: u16 = 10;
/// ASN of the first external; each further external increments by one.
const EXTERNAL_ASN_BASE: u32 = 64102;
/// Fabric-side ASN used in inbound community strings.
const FABRIC_COMMUNITY_ASN: u32 = 65102;
const EXTERNAL_RULE_BASE: u32 = 100;
const EXTERNAL_RULE_STEP: u32 = 100;

/// Expands a [`TopologyIntent`] into a validated [`WiringGraph`].
///
/// Construction order is deterministic: namespaces, MCLAG pairs (leaves,
/// domain, servers), ESLAG groups, orphan leaves, spines with fabric links
/// (or the leaf mesh), gateway uplinks, externals, and finally VPC loopbacks.
pub struct WiringBuilder {
    intent: TopologyIntent,
    graph: WiringGraph,
    switch_ports: BTreeMap<String, SwitchPortAllocator>,
    server_nics: BTreeMap<String, ServerNicAllocator>,
    switch_seq: u32,
    leaf_seq: u32,
    server_seq: u32,
    mclag_leafs: Vec<String>,
    eslag_leafs: Vec<String>,
    orphan_leafs: Vec<String>,
}

impl WiringBuilder {
    pub fn build(intent: &TopologyIntent, fab: &FabConfig) -> Result<WiringGraph, ValidationError> {
        let intent = intent.resolve(fab)?;
        let mut builder = WiringBuilder {
            intent,
            graph: WiringGraph::default(),
            switch_ports: BTreeMap::new(),
            server_nics: BTreeMap::new(),
            switch_seq: 0,
            leaf_seq: 0,
            server_seq: 0,
            mclag_leafs: Vec::new(),
            eslag_leafs: Vec::new(),
            orphan_leafs: Vec::new(),
        };

        builder.namespaces();
        if !builder.intent.no_switches {
            builder.mclag_pairs()?;
            builder.eslag_groups()?;
            builder.orphans()?;
            builder.spines_and_fabric()?;
            builder.mesh()?;
            builder.gateway(fab)?;
            builder.externals()?;
            builder.vpc_loopbacks()?;
        }

        validate(&builder.graph)?;
        Ok(builder.graph)
    }

    fn namespaces(&mut self) {
        self.graph.vlan_namespaces.push(VlanNamespace {
            meta: Meta::named("default"),
            ranges: vec![VlanRange {
                from: DEFAULT_VLAN_RANGE.0,
                to: DEFAULT_VLAN_RANGE.1,
            }],
        });
        self.graph.ipv4_namespaces.push(Ipv4Namespace {
            meta: Meta::named("default"),
            subnets: vec![DEFAULT_IPV4_SUBNET.to_string()],
        });
        self.graph.switch_groups.push(SwitchGroup {
            meta: Meta::named("default"),
        });
    }

    // --- Devices ---

    fn create_switch(
        &mut self,
        role: SwitchRole,
        redundancy: Option<Redundancy>,
        description: String,
    ) -> Result<String, ValidationError> {
        if self.switch_seq > 0xff {
            return Err(ValidationError::Intent(
                "too many switches for the boot MAC space".to_string(),
            ));
        }
        let name = match role {
            SwitchRole::Spine => format!("spine-{:02}", self.graph.spines().count() + 1),
            SwitchRole::ServerLeaf => {
                self.leaf_seq += 1;
                format!("leaf-{:02}", self.leaf_seq)
            }
        };
        let boot_mac = format!("0c:20:12:ff:{:02x}:00", self.switch_seq);
        self.switch_seq += 1;

        debug!("creating switch {} ({:?})", name, role);
        self.graph.switches.push(Switch {
            meta: Meta::named(&name),
            role,
            profile: VS_PROFILE.to_string(),
            description,
            groups: vec!["default".to_string()],
            redundancy,
            boot_mac,
            port_breakouts: BTreeMap::new(),
            roce: false,
        });
        self.switch_ports
            .insert(name.clone(), SwitchPortAllocator::new(&name));
        Ok(name)
    }

    fn create_server(&mut self, description: String) -> String {
        self.server_seq += 1;
        let name = format!("server-{:02}", self.server_seq);
        self.graph.servers.push(Server {
            meta: Meta::named(&name),
            description,
        });
        self.server_nics
            .insert(name.clone(), ServerNicAllocator::new(&name));
        name
    }

    fn switch_port(&mut self, switch: &str) -> Result<Port, ValidationError> {
        self.switch_ports
            .get_mut(switch)
            .ok_or_else(|| ValidationError::Intent(format!("unknown switch {}", switch)))?
            .next()
            .map_err(ValidationError::from)
    }

    fn server_nic(&mut self, server: &str) -> Result<Port, ValidationError> {
        self.server_nics
            .get_mut(server)
            .ok_or_else(|| ValidationError::Intent(format!("unknown server {}", server)))?
            .next()
            .map_err(ValidationError::from)
    }

    fn add_connection(&mut self, mut conn: Connection) {
        if let Some(kind) = conn.kind() {
            conn.meta
                .labels
                .insert(LABEL_CONNECTION_TYPE.to_string(), kind.as_str().to_string());
        }
        let devices: Vec<String> = conn.devices().into_iter().map(str::to_string).collect();
        for device in devices {
            conn.meta
                .labels
                .insert(device_label(&device), LABEL_VALUE_TRUE.to_string());
        }
        self.graph.connections.push(conn);
    }

    // --- Leaf groups ---

    fn mclag_pairs(&mut self) -> Result<(), ValidationError> {
        for pair in 0..self.intent.mclag_leafs / 2 {
            let group = format!("mclag-{}", pair + 1);
            let redundancy = Redundancy {
                group: group.clone(),
                kind: RedundancyKind::Mclag,
            };
            let first = self.create_switch(
                SwitchRole::ServerLeaf,
                Some(redundancy.clone()),
                format!("MCLAG {}", group),
            )?;
            let second = self.create_switch(
                SwitchRole::ServerLeaf,
                Some(redundancy),
                format!("MCLAG {}", group),
            )?;
            self.mclag_leafs.push(first.clone());
            self.mclag_leafs.push(second.clone());

            let mut domain = MclagDomainConn::default();
            for _ in 0..self.intent.mclag_session_links {
                domain
                    .session_links
                    .push(Link::new(self.switch_port(&first)?, self.switch_port(&second)?));
            }
            for _ in 0..self.intent.mclag_peer_links {
                domain
                    .peer_links
                    .push(Link::new(self.switch_port(&first)?, self.switch_port(&second)?));
            }
            let mut conn = Connection::named(format!("{}--mclag-domain--{}", first, second));
            conn.mclag_domain = Some(domain);
            self.add_connection(conn);

            for _ in 0..self.intent.mclag_servers * 2 {
                let server = self.create_server(format!("MCLAG {} {}", first, second));
                let links = vec![
                    Link::new(self.server_nic(&server)?, self.switch_port(&first)?),
                    Link::new(self.server_nic(&server)?, self.switch_port(&second)?),
                ];
                let mut conn =
                    Connection::named(format!("{}--mclag--{}--{}", server, first, second));
                conn.mclag = Some(MclagConn { links });
                self.add_connection(conn);
            }
            self.attach_plain_servers(&first, &second)?;
        }
        Ok(())
    }

    fn eslag_groups(&mut self) -> Result<(), ValidationError> {
        let groups = self.intent.eslag_groups()?;
        for (idx, size) in groups.into_iter().enumerate() {
            let group = format!("eslag-{}", idx + 1);
            let mut leafs = Vec::new();
            for _ in 0..size {
                let leaf = self.create_switch(
                    SwitchRole::ServerLeaf,
                    Some(Redundancy {
                        group: group.clone(),
                        kind: RedundancyKind::Eslag,
                    }),
                    format!("ESLAG {}", group),
                )?;
                self.eslag_leafs.push(leaf.clone());
                leafs.push(leaf);
            }

            for _ in 0..self.intent.eslag_servers * size {
                let server = self.create_server(format!("ESLAG {}", leafs.join(" ")));
                let mut links = Vec::new();
                for leaf in &leafs {
                    links.push(Link::new(self.server_nic(&server)?, self.switch_port(leaf)?));
                }
                let mut conn =
                    Connection::named(format!("{}--eslag--{}", server, leafs.join("--")));
                conn.eslag = Some(EslagConn { links });
                self.add_connection(conn);
            }
            let (first, second) = (leafs[0].clone(), leafs[1].clone());
            self.attach_plain_servers(&first, &second)?;
        }
        Ok(())
    }

    fn orphans(&mut self) -> Result<(), ValidationError> {
        for _ in 0..self.intent.orphan_leafs {
            let leaf = self.create_switch(SwitchRole::ServerLeaf, None, "orphan".to_string())?;
            self.orphan_leafs.push(leaf.clone());
            self.attach_plain_servers(&leaf, &leaf)?;
        }
        Ok(())
    }

    /// Unbundled servers land on `first`, bundled servers on `second`;
    /// for an orphan leaf both are the same switch.
    fn attach_plain_servers(&mut self, first: &str, second: &str) -> Result<(), ValidationError> {
        for _ in 0..self.intent.unbundled_servers {
            let server = self.create_server(format!("Unbundled {}", first));
            let link = Link::new(self.server_nic(&server)?, self.switch_port(first)?);
            let mut conn = Connection::named(format!("{}--unbundled--{}", server, first));
            conn.unbundled = Some(UnbundledConn { link });
            self.add_connection(conn);
        }
        for _ in 0..self.intent.bundled_servers {
            let server = self.create_server(format!("Bundled {}", second));
            let links = vec![
                Link::new(self.server_nic(&server)?, self.switch_port(second)?),
                Link::new(self.server_nic(&server)?, self.switch_port(second)?),
            ];
            let mut conn = Connection::named(format!("{}--bundled--{}", server, second));
            conn.bundled = Some(BundledConn { links });
            self.add_connection(conn);
        }
        Ok(())
    }

    // --- Underlay ---

    fn spines_and_fabric(&mut self) -> Result<(), ValidationError> {
        let leafs: Vec<String> = self.graph.leaves().map(|l| l.name().to_string()).collect();
        for _ in 0..self.intent.spines {
            let spine = self.create_switch(SwitchRole::Spine, None, "spine".to_string())?;
            for leaf in &leafs {
                let mut links = Vec::new();
                for _ in 0..self.intent.fabric_links {
                    links.push(Link::new(self.switch_port(&spine)?, self.switch_port(leaf)?));
                }
                let mut conn = Connection::named(format!("{}--fabric--{}", spine, leaf));
                conn.fabric = Some(FabricConn { links });
                self.add_connection(conn);
            }
        }
        Ok(())
    }

    fn mesh(&mut self) -> Result<(), ValidationError> {
        if self.intent.mesh_links == 0 {
            return Ok(());
        }
        let leafs: Vec<String> = self.graph.leaves().map(|l| l.name().to_string()).collect();
        for i in 0..leafs.len() {
            for j in (i + 1)..leafs.len() {
                let mut links = Vec::new();
                for _ in 0..self.intent.mesh_links {
                    links.push(Link::new(
                        self.switch_port(&leafs[i])?,
                        self.switch_port(&leafs[j])?,
                    ));
                }
                let mut conn = Connection::named(format!("{}--mesh--{}", leafs[i], leafs[j]));
                conn.mesh = Some(MeshConn { links });
                self.add_connection(conn);
            }
        }
        Ok(())
    }

    fn gateway(&mut self, fab: &FabConfig) -> Result<(), ValidationError> {
        if self.intent.gateway_uplinks == 0 {
            return Ok(());
        }
        let node = fab.gateway_node().ok_or_else(|| {
            ValidationError::Intent("gateway uplinks requested without a gateway node".to_string())
        })?;
        let name = node.name.clone();
        let uplinks: Vec<String> = (1..=self.intent.gateway_uplinks)
            .map(|i| format!("enp2s{}", i))
            .collect();
        self.graph.gateways.push(Gateway {
            meta: Meta::named(&name),
            uplinks: uplinks.clone(),
        });

        // First k spines in fabric mode, first k leaves in mesh mode,
        // in creation order.
        let peers: Vec<String> = if self.intent.mesh_links > 0 {
            self.graph.leaves().map(|l| l.name().to_string()).collect()
        } else {
            self.graph.spines().map(|s| s.name().to_string()).collect()
        };
        for (idx, uplink) in uplinks.iter().enumerate() {
            let peer = peers[idx].clone();
            let link = Link::new(self.switch_port(&peer)?, Port::new(&name, uplink));
            let mut conn = Connection::named(format!("{}--gateway--{}", peer, name));
            conn.gateway = Some(GatewayConn { links: vec![link] });
            self.add_connection(conn);
        }
        Ok(())
    }

    // --- Externals ---

    fn externals(&mut self) -> Result<(), ValidationError> {
        if self.intent.externals == 0 {
            return Ok(());
        }
        if self.intent.externals > 1 {
            warn!("multiple externals on virtual switches, expect reduced BGP isolation");
        }

        let mut externals = Vec::new();
        for idx in 0..self.intent.externals {
            let name = format!("external-{:02}", idx + 1);
            let asn = EXTERNAL_ASN_BASE + idx;
            let rule = EXTERNAL_RULE_BASE + idx * EXTERNAL_RULE_STEP;
            self.graph.externals.push(External {
                meta: Meta::named(&name),
                ipv4_namespace: "default".to_string(),
                inbound_community: format!("{}:{}", FABRIC_COMMUNITY_ASN, rule),
                outbound_community: format!("{}:{}", asn, rule),
                asn: Some(asn),
            });
            externals.push(name);
        }

        let class_conns = [
            (self.mclag_leafs.clone(), self.intent.mclag_external_conns),
            (self.eslag_leafs.clone(), self.intent.eslag_external_conns),
            (self.orphan_leafs.clone(), self.intent.orphan_external_conns),
        ];

        let mut vlan = EXTERNAL_VLAN_BASE;
        let mut subnet_octet: u32 = 0;
        for (leafs, count) in class_conns {
            for leaf in leafs.iter().take(count as usize) {
                let port = self.switch_port(leaf)?;
                let conn_name = format!("{}--external", leaf);
                let mut conn = Connection::named(&conn_name);
                conn.external = Some(ExternalConn { port });
                self.add_connection(conn);

                for external in &externals {
                    let asn = self
                        .graph
                        .externals
                        .iter()
                        .find(|e| e.name() == external)
                        .and_then(|e| e.asn)
                        .unwrap_or(EXTERNAL_ASN_BASE);
                    self.graph.external_attachments.push(ExternalAttachment {
                        meta: Meta::named(format!("{}--{}", conn_name, external)),
                        external: external.clone(),
                        connection: conn_name.clone(),
                        vlan: Some(vlan),
                        neighbor: BgpNeighbor {
                            asn,
                            ip: format!("172.30.{}.1", subnet_octet),
                        },
                        switch_ip: format!("172.30.{}.0/31", subnet_octet),
                    });
                    vlan += EXTERNAL_VLAN_STEP;
                    subnet_octet += 1;
                }
            }
        }
        Ok(())
    }

    fn vpc_loopbacks(&mut self) -> Result<(), ValidationError> {
        if self.intent.vpc_loopbacks == 0 {
            return Ok(());
        }
        let leafs: Vec<String> = self.graph.leaves().map(|l| l.name().to_string()).collect();
        for leaf in leafs {
            let mut links = Vec::new();
            for _ in 0..self.intent.vpc_loopbacks {
                links.push(Link::new(self.switch_port(&leaf)?, self.switch_port(&leaf)?));
            }
            let mut conn = Connection::named(format!("{}--vpc-loopback", leaf));
            conn.vpc_loopback = Some(VpcLoopbackConn { links });
            self.add_connection(conn);
        }
        Ok(())
    }
}
