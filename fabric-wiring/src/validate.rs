use std::collections::{BTreeMap, BTreeSet};

use fabric_types::connection::ConnectionKind;
use fabric_types::wiring::RedundancyKind;
use thiserror::Error;

use crate::graph::WiringGraph;
use crate::ports::PortError;
use crate::profile::SwitchProfile;

/// A topology invariant was violated. Each variant names the offending
/// entity; none of these are retryable.
#[derive(Error, Debug)]
pub enum ValidationError {
    /// Intent-level constraint, before any entity exists.
    #[error("{0}")]
    Intent(String),

    #[error(transparent)]
    Port(#[from] PortError),

    #[error("port {port} used by both {first} and {second}")]
    DuplicatePort {
        port: String,
        first: String,
        second: String,
    },

    #[error("connection {connection} references unknown device {device}")]
    UnknownDevice { connection: String, device: String },

    #[error("connection {connection} has {count} kinds set, want exactly 1")]
    ConnectionKinds { connection: String, count: usize },

    #[error("fabric and mesh connections cannot coexist in one topology")]
    FabricMeshMix,

    #[error("switch {switch} appears in {domains} MCLAG domains, want exactly 1")]
    MclagMembership { switch: String, domains: usize },

    #[error("MCLAG group {group} has {size} members, want exactly 2")]
    MclagGroupSize { group: String, size: usize },

    #[error("ESLAG group {group} has {size} members, want 2..4")]
    EslagGroupSize { group: String, size: usize },

    #[error("spine {switch} must not carry redundancy")]
    SpineRedundancy { switch: String },

    #[error("switch {switch} has unknown profile {profile:?}")]
    UnknownProfile { switch: String, profile: String },

    #[error("virtual switch {switch} has no boot MAC")]
    MissingBootMac { switch: String },

    #[error("PCI address {pci} declared on both {first} and {second}")]
    DuplicatePassthrough {
        pci: String,
        first: String,
        second: String,
    },

    #[error("duplicate device name {name}")]
    DuplicateDevice { name: String },
}

/// Check every graph invariant. Run after synthesis and again on load.
pub fn validate(graph: &WiringGraph) -> Result<(), ValidationError> {
    unique_devices(graph)?;
    connection_shapes(graph)?;
    unique_ports(graph)?;
    redundancy_groups(graph)?;
    switch_profiles(graph)?;
    unique_passthrough(graph)?;
    Ok(())
}

fn unique_devices(graph: &WiringGraph) -> Result<(), ValidationError> {
    let mut seen = BTreeSet::new();
    for name in graph.device_names() {
        if !seen.insert(name.to_string()) {
            return Err(ValidationError::DuplicateDevice {
                name: name.to_string(),
            });
        }
    }
    Ok(())
}

fn connection_shapes(graph: &WiringGraph) -> Result<(), ValidationError> {
    let devices: BTreeSet<&str> = graph.device_names().into_iter().collect();
    let mut has_fabric = false;
    let mut has_mesh = false;

    for conn in &graph.connections {
        let count = conn.kind_count();
        if count != 1 {
            return Err(ValidationError::ConnectionKinds {
                connection: conn.meta.name.clone(),
                count,
            });
        }
        match conn.kind() {
            Some(ConnectionKind::Fabric) => has_fabric = true,
            Some(ConnectionKind::Mesh) => has_mesh = true,
            _ => {}
        }
        for device in conn.devices() {
            // External connections name the external in metadata, not as a
            // port device, so every port device must resolve.
            if !devices.contains(device) {
                return Err(ValidationError::UnknownDevice {
                    connection: conn.meta.name.clone(),
                    device: device.to_string(),
                });
            }
        }
    }

    if has_fabric && has_mesh {
        return Err(ValidationError::FabricMeshMix);
    }
    Ok(())
}

fn unique_ports(graph: &WiringGraph) -> Result<(), ValidationError> {
    let mut seen: BTreeMap<String, String> = BTreeMap::new();
    for conn in &graph.connections {
        for port in conn.ports() {
            let key = port.to_string();
            if let Some(first) = seen.get(&key) {
                return Err(ValidationError::DuplicatePort {
                    port: key,
                    first: first.clone(),
                    second: conn.meta.name.clone(),
                });
            }
            seen.insert(key, conn.meta.name.clone());
        }
    }
    Ok(())
}

fn redundancy_groups(graph: &WiringGraph) -> Result<(), ValidationError> {
    let mut group_sizes: BTreeMap<&str, (RedundancyKind, usize)> = BTreeMap::new();

    for switch in &graph.switches {
        let Some(redundancy) = &switch.redundancy else {
            continue;
        };
        if switch.role.is_spine() {
            return Err(ValidationError::SpineRedundancy {
                switch: switch.name().to_string(),
            });
        }
        let entry = group_sizes
            .entry(redundancy.group.as_str())
            .or_insert((redundancy.kind, 0));
        entry.1 += 1;
    }

    for (group, (kind, size)) in &group_sizes {
        match kind {
            RedundancyKind::Mclag => {
                if *size != 2 {
                    return Err(ValidationError::MclagGroupSize {
                        group: group.to_string(),
                        size: *size,
                    });
                }
            }
            RedundancyKind::Eslag => {
                if !(2..=4).contains(size) {
                    return Err(ValidationError::EslagGroupSize {
                        group: group.to_string(),
                        size: *size,
                    });
                }
            }
        }
    }

    // Every MCLAG leaf sits in exactly one MCLAG domain connection.
    for switch in &graph.switches {
        let Some(redundancy) = &switch.redundancy else {
            continue;
        };
        if redundancy.kind != RedundancyKind::Mclag {
            continue;
        }
        let domains = graph
            .connections_of(ConnectionKind::MclagDomain)
            .filter(|c| c.devices().contains(&switch.name()))
            .count();
        if domains != 1 {
            return Err(ValidationError::MclagMembership {
                switch: switch.name().to_string(),
                domains,
            });
        }
    }
    Ok(())
}

fn switch_profiles(graph: &WiringGraph) -> Result<(), ValidationError> {
    for switch in &graph.switches {
        if SwitchProfile::get(&switch.profile).is_none() {
            return Err(ValidationError::UnknownProfile {
                switch: switch.name().to_string(),
                profile: switch.profile.clone(),
            });
        }
        if !switch.meta.is_hardware() && switch.boot_mac.is_empty() {
            return Err(ValidationError::MissingBootMac {
                switch: switch.name().to_string(),
            });
        }
    }
    Ok(())
}

fn unique_passthrough(graph: &WiringGraph) -> Result<(), ValidationError> {
    let mut seen: BTreeMap<String, String> = BTreeMap::new();
    let metas = graph
        .switches
        .iter()
        .map(|s| (&s.meta, s.name()))
        .chain(graph.servers.iter().map(|s| (&s.meta, s.name())))
        .chain(graph.gateways.iter().map(|g| (&g.meta, g.name())));

    for (meta, device) in metas {
        for pci in meta.passthrough_links().into_values() {
            if let Some(first) = seen.get(&pci) {
                return Err(ValidationError::DuplicatePassthrough {
                    pci,
                    first: first.clone(),
                    second: device.to_string(),
                });
            }
            seen.insert(pci, device.to_string());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::WiringBuilder;
    use crate::intent::TopologyIntent;
    use fabric_types::connection::{Connection, Link, Port, UnbundledConn};
    use fabric_types::fab::FabConfig;
    use fabric_types::meta::Meta;
    use fabric_types::wiring::{Redundancy, Server};

    fn default_graph() -> WiringGraph {
        WiringBuilder::build(&TopologyIntent::default(), &FabConfig::default()).expect("build")
    }

    #[test]
    fn test_default_topology_validates() {
        validate(&default_graph()).expect("valid");
    }

    #[test]
    fn test_duplicate_port_detected() {
        let mut graph = default_graph();
        let taken = graph.connections[0].ports()[0].clone();
        graph.servers.push(Server {
            meta: Meta::named("server-99"),
            description: String::new(),
        });
        let mut conn = Connection::named("server-99--unbundled--dup");
        conn.unbundled = Some(UnbundledConn {
            link: Link::new(Port::new("server-99", "enp2s1"), taken),
        });
        graph.connections.push(conn);

        let err = validate(&graph).expect_err("duplicate port");
        assert!(matches!(err, ValidationError::DuplicatePort { .. }));
    }

    #[test]
    fn test_zero_kind_connection_rejected() {
        let mut graph = default_graph();
        graph.connections.push(Connection::named("empty"));
        let err = validate(&graph).expect_err("zero kinds");
        assert!(matches!(
            err,
            ValidationError::ConnectionKinds { count: 0, .. }
        ));
    }

    #[test]
    fn test_unknown_device_rejected() {
        let mut graph = default_graph();
        let mut conn = Connection::named("ghost--unbundled--leaf-01");
        conn.unbundled = Some(UnbundledConn {
            link: Link::new(Port::new("ghost", "enp2s1"), Port::new("leaf-01", "E1/40")),
        });
        graph.connections.push(conn);
        let err = validate(&graph).expect_err("unknown device");
        assert!(matches!(err, ValidationError::UnknownDevice { .. }));
    }

    #[test]
    fn test_spine_redundancy_rejected() {
        let mut graph = default_graph();
        let spine_name = graph.spines().next().expect("spine").name().to_string();
        for switch in &mut graph.switches {
            if switch.name() == spine_name {
                switch.redundancy = Some(Redundancy {
                    group: "mclag-9".to_string(),
                    kind: RedundancyKind::Mclag,
                });
            }
        }
        let err = validate(&graph).expect_err("spine redundancy");
        assert!(matches!(err, ValidationError::SpineRedundancy { .. }));
    }

    #[test]
    fn test_missing_boot_mac_rejected() {
        let mut graph = default_graph();
        graph.switches[0].boot_mac = String::new();
        let err = validate(&graph).expect_err("no boot mac");
        assert!(matches!(err, ValidationError::MissingBootMac { .. }));
    }

    #[test]
    fn test_duplicate_passthrough_rejected() {
        let mut graph = default_graph();
        for name in ["server-01", "server-02"] {
            let server = graph
                .servers
                .iter_mut()
                .find(|s| s.name() == name)
                .expect("server");
            server.meta.annotations.insert(
                "link.hhfab.githedgehog.com/enp2s1".to_string(),
                "pci@0000:01:00.0".to_string(),
            );
        }
        let err = validate(&graph).expect_err("duplicate pci");
        assert!(matches!(err, ValidationError::DuplicatePassthrough { .. }));
    }

    #[test]
    fn test_duplicate_device_rejected() {
        let mut graph = default_graph();
        graph.servers.push(Server {
            meta: Meta::named("leaf-01"),
            description: String::new(),
        });
        let err = validate(&graph).expect_err("duplicate device");
        assert!(matches!(err, ValidationError::DuplicateDevice { .. }));
    }

    #[test]
    fn test_mclag_membership_requires_domain() {
        let mut graph = default_graph();
        graph
            .connections
            .retain(|c| c.kind() != Some(fabric_types::connection::ConnectionKind::MclagDomain));
        let err = validate(&graph).expect_err("missing domain");
        assert!(matches!(err, ValidationError::MclagMembership { domains: 0, .. }));
    }

    #[test]
    fn test_mesh_with_fabric_rejected() {
        let mut graph = default_graph();
        let mut conn = Connection::named("leaf-01--mesh--leaf-02");
        conn.mesh = Some(fabric_types::connection::MeshConn {
            links: vec![Link::new(
                Port::new("leaf-01", "E1/45"),
                Port::new("leaf-02", "E1/45"),
            )],
        });
        graph.connections.push(conn);
        let err = validate(&graph).expect_err("mixed underlay");
        assert!(matches!(err, ValidationError::FabricMeshMix));
    }

    #[test]
    fn test_validation_error_names_entity() {
        let mut graph = default_graph();
        graph.switches[0].boot_mac = String::new();
        let name = graph.switches[0].name().to_string();
        let err = validate(&graph).expect_err("no boot mac");
        assert!(err.to_string().contains(&name));
    }
}
