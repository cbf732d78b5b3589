use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::meta::{LabelSelector, Meta};

/// A typed object the store can hold.
pub trait Object: Clone + Send + Sync + Serialize + DeserializeOwned {
    /// Stable lowercase plural kind, doubling as the store collection name.
    const KIND: &'static str;

    fn meta(&self) -> &Meta;
    fn meta_mut(&mut self) -> &mut Meta;

    fn name(&self) -> &str {
        &self.meta().name
    }
}

/// Object-store failures surfaced to callers. `NotFound`, `AlreadyExists`
/// and `Conflict` are stable sentinels callers branch on.
#[derive(Error, Debug)]
pub enum StoreError {
    /// No object with that kind/name.
    #[error("{kind}/{name} not found")]
    NotFound { kind: String, name: String },

    /// Create of an object that already exists.
    #[error("{kind}/{name} already exists")]
    AlreadyExists { kind: String, name: String },

    /// Update raced with a concurrent writer; re-fetch and re-apply.
    #[error("{kind}/{name} version conflict: have {have}, want {want}")]
    Conflict {
        kind: String,
        name: String,
        have: u64,
        want: u64,
    },

    /// Object payload did not (de)serialize.
    #[error("codec error for {kind}: {source}")]
    Codec {
        kind: String,
        #[source]
        source: serde_json::Error,
    },

    /// Transport or backend failure.
    #[error("store error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists { .. })
    }
}

/// Capability set of the control-plane object store. Objects travel as JSON
/// values carrying their [`Meta`] (including `resource_version`); typed
/// access sits on top of this in the client facade.
///
/// Reconciliation of stored objects into switch state is another system's
/// responsibility; this trait only covers CRUD with label selection.
#[async_trait]
pub trait StoreClient: Send + Sync {
    async fn get(&self, kind: &str, name: &str) -> Result<Value, StoreError>;

    async fn list(&self, kind: &str, selector: &LabelSelector) -> Result<Vec<Value>, StoreError>;

    /// Create the object; errors with `AlreadyExists` on name collision.
    /// Returns the stored value with its first `resource_version`.
    async fn create(&self, kind: &str, object: Value) -> Result<Value, StoreError>;

    /// Update the object; the carried `resource_version` must match the
    /// stored one or the call fails with `Conflict`.
    async fn update(&self, kind: &str, object: Value) -> Result<Value, StoreError>;

    async fn delete(&self, kind: &str, name: &str) -> Result<(), StoreError>;
}

/// Name of a JSON-encoded object, from its `meta.name`.
pub fn value_name(object: &Value) -> Option<&str> {
    object.get("meta")?.get("name")?.as_str()
}

/// Labels of a JSON-encoded object.
pub fn value_labels(object: &Value) -> std::collections::BTreeMap<String, String> {
    object
        .get("meta")
        .and_then(|m| m.get("labels"))
        .and_then(|l| l.as_object())
        .map(|l| {
            l.iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

/// `meta.resource_version` of a JSON-encoded object, 0 when unset.
pub fn value_version(object: &Value) -> u64 {
    object
        .get("meta")
        .and_then(|m| m.get("resource_version"))
        .and_then(Value::as_u64)
        .unwrap_or(0)
}

/// Stamp a new `meta.resource_version` onto a JSON-encoded object.
pub fn set_value_version(object: &mut Value, version: u64) {
    if let Some(meta) = object.get_mut("meta").and_then(Value::as_object_mut) {
        meta.insert("resource_version".to_string(), Value::from(version));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wiring::Server;

    #[test]
    fn test_value_helpers() {
        let server = Server {
            meta: Meta::named("server-01").with_label("role", "test"),
            description: String::new(),
        };
        let mut value = serde_json::to_value(&server).expect("encode");

        assert_eq!(value_name(&value), Some("server-01"));
        assert_eq!(value_labels(&value).get("role").map(String::as_str), Some("test"));
        assert_eq!(value_version(&value), 0);

        set_value_version(&mut value, 7);
        assert_eq!(value_version(&value), 7);

        let back: Server = serde_json::from_value(value).expect("decode");
        assert_eq!(back.meta.resource_version, Some(7));
    }

    #[test]
    fn test_sentinel_predicates() {
        let err = StoreError::NotFound {
            kind: "vpcs".to_string(),
            name: "vpc-01".to_string(),
        };
        assert!(err.is_not_found());
        assert!(!err.is_conflict());

        let err = StoreError::Conflict {
            kind: "agents".to_string(),
            name: "leaf-01".to_string(),
            have: 3,
            want: 2,
        };
        assert!(err.is_conflict());
    }
}
