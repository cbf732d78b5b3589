use fabric_types::connection::Connection;
use fabric_types::store::Object;
use fabric_types::vpc::ExternalAttachment;
use fabric_types::wiring::{
    External, Gateway, Ipv4Namespace, Server, Switch, SwitchGroup, VlanNamespace,
};
use serde::Serialize;
use thiserror::Error;

use crate::graph::WiringGraph;
use crate::validate::{validate, ValidationError};

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("document {index} has no kind")]
    MissingKind { index: usize },

    #[error("document {index} has unknown kind {kind:?}")]
    UnknownKind { index: usize, kind: String },

    /// The loaded graph failed re-validation.
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Serialize the graph as a multi-document YAML stream. Every document is
/// the object itself with a `kind` key injected, so the stream is
/// self-describing and order-insensitive on load.
pub fn to_yaml(graph: &WiringGraph) -> Result<String, PersistError> {
    let mut out = String::new();
    append_docs(&mut out, &graph.vlan_namespaces, VlanNamespace::KIND)?;
    append_docs(&mut out, &graph.ipv4_namespaces, Ipv4Namespace::KIND)?;
    append_docs(&mut out, &graph.switch_groups, SwitchGroup::KIND)?;
    append_docs(&mut out, &graph.switches, Switch::KIND)?;
    append_docs(&mut out, &graph.servers, Server::KIND)?;
    append_docs(&mut out, &graph.gateways, Gateway::KIND)?;
    append_docs(&mut out, &graph.externals, External::KIND)?;
    append_docs(&mut out, &graph.connections, Connection::KIND)?;
    append_docs(&mut out, &graph.external_attachments, ExternalAttachment::KIND)?;
    Ok(out)
}

fn append_docs<T: Serialize>(
    out: &mut String,
    objects: &[T],
    kind: &str,
) -> Result<(), PersistError> {
    for object in objects {
        let mut value = serde_yaml::to_value(object)?;
        if let serde_yaml::Value::Mapping(mapping) = &mut value {
            mapping.insert(
                serde_yaml::Value::String("kind".to_string()),
                serde_yaml::Value::String(kind.to_string()),
            );
        }
        out.push_str("---\n");
        out.push_str(&serde_yaml::to_string(&value)?);
    }
    Ok(())
}

/// Parse a multi-document YAML stream back into a graph and re-validate it.
pub fn from_yaml(input: &str) -> Result<WiringGraph, PersistError> {
    let mut graph = WiringGraph::default();

    for (index, document) in input.split("---\n").enumerate() {
        if document.trim().is_empty() {
            continue;
        }
        let mut value: serde_yaml::Value = serde_yaml::from_str(document)?;
        let kind = match &mut value {
            serde_yaml::Value::Mapping(mapping) => mapping
                .remove(&serde_yaml::Value::String("kind".to_string()))
                .and_then(|k| k.as_str().map(str::to_string)),
            _ => None,
        }
        .ok_or(PersistError::MissingKind { index })?;

        match kind.as_str() {
            VlanNamespace::KIND => graph.vlan_namespaces.push(serde_yaml::from_value(value)?),
            Ipv4Namespace::KIND => graph.ipv4_namespaces.push(serde_yaml::from_value(value)?),
            SwitchGroup::KIND => graph.switch_groups.push(serde_yaml::from_value(value)?),
            Switch::KIND => graph.switches.push(serde_yaml::from_value(value)?),
            Server::KIND => graph.servers.push(serde_yaml::from_value(value)?),
            Gateway::KIND => graph.gateways.push(serde_yaml::from_value(value)?),
            External::KIND => graph.externals.push(serde_yaml::from_value(value)?),
            Connection::KIND => graph.connections.push(serde_yaml::from_value(value)?),
            ExternalAttachment::KIND => {
                graph.external_attachments.push(serde_yaml::from_value(value)?)
            }
            _ => return Err(PersistError::UnknownKind { index, kind }),
        }
    }

    validate(&graph)?;
    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::WiringBuilder;
    use crate::intent::TopologyIntent;
    use fabric_types::fab::FabConfig;

    #[test]
    fn test_yaml_roundtrip_preserves_topology() {
        let graph =
            WiringBuilder::build(&TopologyIntent::default(), &FabConfig::default()).expect("build");
        let yaml = to_yaml(&graph).expect("serialize");
        let loaded = from_yaml(&yaml).expect("load");

        assert_eq!(loaded.switches.len(), graph.switches.len());
        assert_eq!(loaded.servers.len(), graph.servers.len());
        assert_eq!(loaded.connections.len(), graph.connections.len());
        assert_eq!(loaded.switches[0], graph.switches[0]);
        assert_eq!(loaded.connections[0], graph.connections[0]);
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let err = from_yaml("---\nkind: gadgets\nmeta:\n  name: g1\n").expect_err("unknown kind");
        assert!(matches!(err, PersistError::UnknownKind { .. }));
    }

    #[test]
    fn test_missing_kind_rejected() {
        let err = from_yaml("---\nmeta:\n  name: g1\n").expect_err("missing kind");
        assert!(matches!(err, PersistError::MissingKind { .. }));
    }

    #[test]
    fn test_loaded_graph_is_revalidated() {
        let graph =
            WiringBuilder::build(&TopologyIntent::default(), &FabConfig::default()).expect("build");
        let yaml = to_yaml(&graph).expect("serialize");
        // Concatenating the stream with itself duplicates every device.
        let corrupted = format!("{}{}", yaml, yaml);
        let err = from_yaml(&corrupted).expect_err("invalid after corruption");
        assert!(matches!(err, PersistError::Validation(_)));
    }
}
