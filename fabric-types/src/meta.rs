use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Annotation marking an object as physical hardware (no VM projection).
pub const ANNOTATION_HW_TYPE: &str = "type.hhfab.githedgehog.com";
/// Value of [`ANNOTATION_HW_TYPE`] for hardware objects.
pub const HW_TYPE_VALUE: &str = "hw";
/// Prefix of per-port PCI passthrough annotations. The part after the slash
/// is the port name with slashes encoded as underscores.
pub const ANNOTATION_LINK_PREFIX: &str = "link.hhfab.githedgehog.com/";
/// Value prefix of passthrough annotations, followed by the PCI address.
pub const PCI_VALUE_PREFIX: &str = "pci@";
/// Annotation overriding an External's ASN.
pub const ANNOTATION_ASN: &str = "asn.hhfab.githedgehog.com";

/// Label carrying a connection's kind, set by the wiring synthesizer.
pub const LABEL_CONNECTION_TYPE: &str = "fabric.githedgehog.com/connection-type";

/// Per-device connection membership label, e.g.
/// `fabric.githedgehog.com/device.leaf-01 = "true"`.
pub fn device_label(device: &str) -> String {
    format!("fabric.githedgehog.com/device.{}", device)
}

pub const LABEL_VALUE_TRUE: &str = "true";

/// Metadata shared by every stored object. References between objects are
/// always by name, never by pointer.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct Meta {
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Version stamped by the object store, absent before first create.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<u64>,
}

impl Meta {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn is_hardware(&self) -> bool {
        annotations_mark_hardware(&self.annotations)
    }

    /// PCI passthrough declarations: port name -> PCI address.
    ///
    /// Underscores in the annotation key decode to slashes, so
    /// `link.hhfab.githedgehog.com/E1_1 = "pci@0000:01:00.0"` declares a
    /// binding for port `E1/1`.
    pub fn passthrough_links(&self) -> BTreeMap<String, String> {
        annotations_passthrough_links(&self.annotations)
    }

    pub fn asn_override(&self) -> Option<u32> {
        self.annotations
            .get(ANNOTATION_ASN)
            .and_then(|v| v.parse().ok())
    }
}

/// Annotation helpers shared with inventory nodes, which carry annotation
/// maps without full object metadata.
pub fn annotations_mark_hardware(annotations: &BTreeMap<String, String>) -> bool {
    annotations
        .get(ANNOTATION_HW_TYPE)
        .map(|v| v == HW_TYPE_VALUE)
        .unwrap_or(false)
}

pub fn annotations_passthrough_links(
    annotations: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut links = BTreeMap::new();
    for (key, value) in annotations {
        if let Some(port) = key.strip_prefix(ANNOTATION_LINK_PREFIX) {
            if let Some(pci) = value.strip_prefix(PCI_VALUE_PREFIX) {
                links.insert(port.replace('_', "/"), pci.to_string());
            }
        }
    }
    links
}

/// Equality-based label selector. An empty selector matches everything.
#[derive(Clone, Debug, Default)]
pub struct LabelSelector {
    required: BTreeMap<String, String>,
}

impl LabelSelector {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.required.insert(key.into(), value.into());
        self
    }

    pub fn connection_type(kind: &str) -> Self {
        Self::all().with(LABEL_CONNECTION_TYPE, kind)
    }

    pub fn device(device: &str) -> Self {
        Self::all().with(device_label(device), LABEL_VALUE_TRUE)
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.required
            .iter()
            .all(|(k, v)| labels.get(k).map(|have| have == v).unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passthrough_links_decode_underscores() {
        let mut meta = Meta::named("leaf-01");
        meta.annotations.insert(
            "link.hhfab.githedgehog.com/E1_7".to_string(),
            "pci@0000:2b:00.0".to_string(),
        );
        meta.annotations
            .insert("unrelated".to_string(), "pci@nope".to_string());

        let links = meta.passthrough_links();
        assert_eq!(links.len(), 1);
        assert_eq!(links.get("E1/7").map(String::as_str), Some("0000:2b:00.0"));
    }

    #[test]
    fn test_hardware_annotation() {
        let mut meta = Meta::named("server-05");
        assert!(!meta.is_hardware());
        meta.annotations
            .insert(ANNOTATION_HW_TYPE.to_string(), HW_TYPE_VALUE.to_string());
        assert!(meta.is_hardware());
    }

    #[test]
    fn test_selector_matches() {
        let meta = Meta::named("conn")
            .with_label(LABEL_CONNECTION_TYPE, "mclag")
            .with_label(device_label("leaf-01"), LABEL_VALUE_TRUE);

        assert!(LabelSelector::all().matches(&meta.labels));
        assert!(LabelSelector::connection_type("mclag").matches(&meta.labels));
        assert!(LabelSelector::connection_type("mclag")
            .with(device_label("leaf-01"), LABEL_VALUE_TRUE)
            .matches(&meta.labels));
        assert!(!LabelSelector::connection_type("eslag").matches(&meta.labels));
        assert!(!LabelSelector::device("leaf-02").matches(&meta.labels));
    }
}
