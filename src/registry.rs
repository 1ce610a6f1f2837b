// Process-wide cluster registry: indexed cluster records plus enqueue hooks

use parking_lot::RwLock;
use std::sync::Arc;

use crate::controller::WorkQueue;
use crate::models::cluster::Cluster;
use crate::store::{retry_on_conflict, Backoff, Result, SharedStore, StoreError};

pub const BY_DRIVER_INDEX: &str = "clusterByDriver";

#[derive(Clone)]
pub struct ClusterRegistry {
    store: SharedStore<Cluster>,
    queues: Arc<RwLock<Vec<WorkQueue>>>,
}

impl ClusterRegistry {
    pub fn new(store: SharedStore<Cluster>) -> Self {
        store.add_index(
            BY_DRIVER_INDEX,
            Arc::new(|c: &Cluster| vec![c.status.driver.clone()]),
        );
        Self {
            store,
            queues: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn store(&self) -> &SharedStore<Cluster> {
        &self.store
    }

    /// Registers a controller queue to receive `enqueue` calls.
    pub fn register_queue(&self, queue: WorkQueue) {
        self.queues.write().push(queue);
    }

    pub async fn get(&self, name: &str) -> Result<Cluster> {
        if name.is_empty() {
            return Err(StoreError::not_found::<Cluster>(""));
        }
        self.store.get("", name).await
    }

    pub async fn list(&self) -> Result<Vec<Cluster>> {
        self.store.list(None).await
    }

    pub async fn list_by_driver(&self, driver: &str) -> Result<Vec<Cluster>> {
        self.store.by_index(BY_DRIVER_INDEX, driver).await
    }

    pub async fn update(&self, cluster: Cluster) -> Result<Cluster> {
        self.store.update(cluster).await
    }

    /// Read-modify-write against the latest version, retrying on conflict.
    pub async fn mutate<F>(&self, name: &str, mutate: F) -> Result<Cluster>
    where
        F: Fn(&mut Cluster) + Send + Sync,
    {
        let store = &self.store;
        let mutate = &mutate;
        retry_on_conflict(Backoff::conflict(), || async move {
            let mut cluster = store.get("", name).await?;
            mutate(&mut cluster);
            store.update(cluster).await
        })
        .await
    }

    pub async fn delete(&self, name: &str) -> Result<()> {
        self.store.delete_if_exists("", name).await
    }

    pub fn enqueue(&self, name: &str) {
        for queue in self.queues.read().iter() {
            queue.add(name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::cluster::{driver, ClusterSpec};
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn lookups_by_driver_and_empty_name() {
        let store: SharedStore<Cluster> = Arc::new(MemoryStore::new());
        let registry = ClusterRegistry::new(store.clone());
        let mut local = Cluster::new("local", ClusterSpec::default());
        local.status.driver = driver::LOCAL.into();
        store.create(local).await.unwrap();
        store
            .create(Cluster::new("c-1", ClusterSpec::default()))
            .await
            .unwrap();

        assert_eq!(registry.list_by_driver(driver::LOCAL).await.unwrap().len(), 1);
        assert!(registry.get("").await.unwrap_err().is_not_found());

        let updated = registry
            .mutate("c-1", |c| c.status.api_endpoint = "https://1.2.3.4".into())
            .await
            .unwrap();
        assert_eq!(updated.status.api_endpoint, "https://1.2.3.4");
    }

    #[tokio::test]
    async fn enqueue_reaches_registered_queues() {
        let store: SharedStore<Cluster> = Arc::new(MemoryStore::new());
        let registry = ClusterRegistry::new(store);
        let queue = WorkQueue::new();
        registry.register_queue(queue.clone());
        registry.enqueue("c-1");
        assert_eq!(queue.get().await.as_deref(), Some("c-1"));
    }
}
