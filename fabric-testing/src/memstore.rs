use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use fabric_types::meta::LabelSelector;
use fabric_types::store::{
    set_value_version, value_labels, value_name, value_version, StoreClient, StoreError,
};
use serde_json::Value;
use tokio::sync::Mutex;

/// Versioned in-memory object store. Used by harness tests and as a
/// dry-run backend; behaves like the real store for conflict semantics.
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<(String, String), Value>>,
    version_seq: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_version(&self) -> u64 {
        self.version_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn name_of(kind: &str, object: &Value) -> Result<String, StoreError> {
        value_name(object)
            .map(str::to_string)
            .ok_or_else(|| StoreError::Backend(format!("{} object has no meta.name", kind)))
    }
}

#[async_trait]
impl StoreClient for MemoryStore {
    async fn get(&self, kind: &str, name: &str) -> Result<Value, StoreError> {
        let objects = self.objects.lock().await;
        objects
            .get(&(kind.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: kind.to_string(),
                name: name.to_string(),
            })
    }

    async fn list(&self, kind: &str, selector: &LabelSelector) -> Result<Vec<Value>, StoreError> {
        let objects = self.objects.lock().await;
        Ok(objects
            .iter()
            .filter(|((k, _), _)| k == kind)
            .filter(|(_, value)| selector.matches(&value_labels(value)))
            .map(|(_, value)| value.clone())
            .collect())
    }

    async fn create(&self, kind: &str, mut object: Value) -> Result<Value, StoreError> {
        let name = Self::name_of(kind, &object)?;
        let mut objects = self.objects.lock().await;
        let key = (kind.to_string(), name.clone());
        if objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                kind: kind.to_string(),
                name,
            });
        }
        set_value_version(&mut object, self.next_version());
        objects.insert(key, object.clone());
        Ok(object)
    }

    async fn update(&self, kind: &str, mut object: Value) -> Result<Value, StoreError> {
        let name = Self::name_of(kind, &object)?;
        let mut objects = self.objects.lock().await;
        let key = (kind.to_string(), name.clone());
        let current = objects.get(&key).ok_or_else(|| StoreError::NotFound {
            kind: kind.to_string(),
            name: name.clone(),
        })?;

        let have = value_version(current);
        let want = value_version(&object);
        if have != want {
            return Err(StoreError::Conflict {
                kind: kind.to_string(),
                name,
                have,
                want,
            });
        }

        set_value_version(&mut object, self.next_version());
        objects.insert(key, object.clone());
        Ok(object)
    }

    async fn delete(&self, kind: &str, name: &str) -> Result<(), StoreError> {
        let mut objects = self.objects.lock().await;
        objects
            .remove(&(kind.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound {
                kind: kind.to_string(),
                name: name.to_string(),
            })
    }
}
