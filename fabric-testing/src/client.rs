use std::sync::Arc;

use fabric_types::agent::Agent;
use fabric_types::connection::{Connection, ConnectionKind};
use fabric_types::meta::{LabelSelector, LABEL_CONNECTION_TYPE};
use fabric_types::store::{Object, StoreClient, StoreError};
use fabric_types::vpc::{
    ExternalAttachment, GatewayGroup, GatewayPeering, Vpc, VpcAttachment,
};
use fabric_types::wiring::{External, Gateway, Switch};
use log::debug;

/// Bounded re-fetch/re-apply attempts on version conflict.
pub const UPDATE_RETRIES: usize = 5;

/// Thin typed wrapper over the object store used by the test harness.
/// All reads re-fetch; nothing is cached between calls.
#[derive(Clone)]
pub struct Fabric {
    store: Arc<dyn StoreClient>,
}

impl Fabric {
    pub fn new(store: Arc<dyn StoreClient>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn StoreClient> {
        &self.store
    }

    fn encode<T: Object>(object: &T) -> Result<serde_json::Value, StoreError> {
        serde_json::to_value(object).map_err(|source| StoreError::Codec {
            kind: T::KIND.to_string(),
            source,
        })
    }

    fn decode<T: Object>(value: serde_json::Value) -> Result<T, StoreError> {
        serde_json::from_value(value).map_err(|source| StoreError::Codec {
            kind: T::KIND.to_string(),
            source,
        })
    }

    pub async fn get<T: Object>(&self, name: &str) -> Result<T, StoreError> {
        let value = self.store.get(T::KIND, name).await?;
        Self::decode(value)
    }

    pub async fn list<T: Object>(&self, selector: &LabelSelector) -> Result<Vec<T>, StoreError> {
        let values = self.store.list(T::KIND, selector).await?;
        values.into_iter().map(Self::decode).collect()
    }

    pub async fn create<T: Object>(&self, object: &T) -> Result<T, StoreError> {
        let value = self.store.create(T::KIND, Self::encode(object)?).await?;
        Self::decode(value)
    }

    pub async fn update<T: Object>(&self, object: &T) -> Result<T, StoreError> {
        let value = self.store.update(T::KIND, Self::encode(object)?).await?;
        Self::decode(value)
    }

    pub async fn delete<T: Object>(&self, name: &str) -> Result<(), StoreError> {
        self.store.delete(T::KIND, name).await
    }

    /// Re-fetch, mutate, update; on version conflict retry with a fresh
    /// fetch, bounded by [`UPDATE_RETRIES`].
    pub async fn update_with<T, F>(&self, name: &str, mut mutate: F) -> Result<T, StoreError>
    where
        T: Object,
        F: FnMut(&mut T),
    {
        let mut attempt = 0;
        loop {
            let mut object: T = self.get(name).await?;
            mutate(&mut object);
            match self.update(&object).await {
                Ok(updated) => return Ok(updated),
                Err(err) if err.is_conflict() && attempt + 1 < UPDATE_RETRIES => {
                    attempt += 1;
                    debug!(
                        "update conflict on {}/{}, retry {}/{}",
                        T::KIND,
                        name,
                        attempt,
                        UPDATE_RETRIES
                    );
                }
                Err(err) => return Err(err),
            }
        }
    }

    // --- Typed listings used all over the harness ---

    pub async fn switches(&self) -> Result<Vec<Switch>, StoreError> {
        self.list(&LabelSelector::all()).await
    }

    pub async fn agents(&self) -> Result<Vec<Agent>, StoreError> {
        self.list(&LabelSelector::all()).await
    }

    pub async fn gateways(&self) -> Result<Vec<Gateway>, StoreError> {
        self.list(&LabelSelector::all()).await
    }

    pub async fn externals(&self) -> Result<Vec<External>, StoreError> {
        self.list(&LabelSelector::all()).await
    }

    pub async fn vpcs(&self) -> Result<Vec<Vpc>, StoreError> {
        self.list(&LabelSelector::all()).await
    }

    pub async fn vpc_attachments(&self) -> Result<Vec<VpcAttachment>, StoreError> {
        self.list(&LabelSelector::all()).await
    }

    pub async fn external_attachments(&self) -> Result<Vec<ExternalAttachment>, StoreError> {
        self.list(&LabelSelector::all()).await
    }

    pub async fn gateway_groups(&self) -> Result<Vec<GatewayGroup>, StoreError> {
        self.list(&LabelSelector::all()).await
    }

    pub async fn gateway_peerings(&self) -> Result<Vec<GatewayPeering>, StoreError> {
        self.list(&LabelSelector::all()).await
    }

    pub async fn connections(&self) -> Result<Vec<Connection>, StoreError> {
        self.list(&LabelSelector::all()).await
    }

    pub async fn connections_of(
        &self,
        kind: ConnectionKind,
    ) -> Result<Vec<Connection>, StoreError> {
        self.list(&LabelSelector::all().with(LABEL_CONNECTION_TYPE, kind.as_str()))
            .await
    }

    /// Connections of one kind touching one device.
    pub async fn device_connections_of(
        &self,
        device: &str,
        kind: ConnectionKind,
    ) -> Result<Vec<Connection>, StoreError> {
        self.list(
            &LabelSelector::device(device).with(LABEL_CONNECTION_TYPE, kind.as_str()),
        )
        .await
    }
}

/// Seed a store from a synthesized wiring graph: every graph object plus
/// one enabled agent per switch.
pub async fn seed_wiring(
    fabric: &Fabric,
    graph: &fabric_wiring::WiringGraph,
) -> Result<(), StoreError> {
    for object in &graph.vlan_namespaces {
        fabric.create(object).await?;
    }
    for object in &graph.ipv4_namespaces {
        fabric.create(object).await?;
    }
    for object in &graph.switch_groups {
        fabric.create(object).await?;
    }
    for object in &graph.switches {
        fabric.create(object).await?;
        fabric
            .create(&Agent {
                meta: fabric_types::meta::Meta::named(object.name()),
                ..Default::default()
            })
            .await?;
    }
    for object in &graph.servers {
        fabric.create(object).await?;
    }
    for object in &graph.gateways {
        fabric.create(object).await?;
    }
    for object in &graph.externals {
        fabric.create(object).await?;
    }
    for object in &graph.connections {
        fabric.create(object).await?;
    }
    for object in &graph.external_attachments {
        fabric.create(object).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memstore::MemoryStore;
    use fabric_types::fab::FabConfig;
    use fabric_types::meta::Meta;
    use fabric_wiring::{TopologyIntent, WiringBuilder};

    async fn seeded() -> Fabric {
        let graph =
            WiringBuilder::build(&TopologyIntent::default(), &FabConfig::default()).expect("build");
        let fabric = Fabric::new(Arc::new(MemoryStore::new()));
        seed_wiring(&fabric, &graph).await.expect("seed");
        fabric
    }

    #[tokio::test]
    async fn test_typed_roundtrip() {
        let fabric = seeded().await;
        let switch: Switch = fabric.get("leaf-01").await.expect("get leaf");
        assert_eq!(switch.name(), "leaf-01");
        assert!(switch.meta.resource_version.is_some());
    }

    #[tokio::test]
    async fn test_connection_listing_by_label() {
        let fabric = seeded().await;
        let mclags = fabric
            .connections_of(ConnectionKind::Mclag)
            .await
            .expect("list");
        assert_eq!(mclags.len(), 2);

        let leaf_fabric = fabric
            .device_connections_of("leaf-01", ConnectionKind::Fabric)
            .await
            .expect("list");
        assert_eq!(leaf_fabric.len(), 2); // one per spine
    }

    #[tokio::test]
    async fn test_update_with_retries_conflicts() {
        let fabric = seeded().await;

        // Stale-write once by hand to bump the version, then update_with
        // must still succeed by re-fetching.
        let agent: Agent = fabric.get("leaf-01").await.expect("agent");
        fabric.update(&agent).await.expect("bump version");

        let updated = fabric
            .update_with::<Agent, _>("leaf-01", |agent| agent.spec.disabled = true)
            .await
            .expect("update with retry");
        assert!(updated.spec.disabled);
    }

    #[tokio::test]
    async fn test_update_missing_is_not_found() {
        let fabric = Fabric::new(Arc::new(MemoryStore::new()));
        let err = fabric
            .update(&Agent {
                meta: Meta::named("ghost"),
                ..Default::default()
            })
            .await
            .expect_err("missing");
        assert!(err.is_not_found());
    }
}
