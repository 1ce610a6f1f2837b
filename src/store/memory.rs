// In-process indexed store

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::{IndexFn, Record, Result, Store, StoreError, WatchEvent};
use crate::models::meta::object_key;

pub struct MemoryStore<R: Record> {
    inner: RwLock<Inner<R>>,
    events: broadcast::Sender<WatchEvent>,
}

struct Inner<R> {
    records: BTreeMap<String, R>,
    indexers: HashMap<String, IndexFn<R>>,
    // index name -> index value -> record keys
    indices: HashMap<String, HashMap<String, BTreeSet<String>>>,
    version: u64,
}

impl<R: Record> Inner<R> {
    fn index(&mut self, key: &str, record: &R) {
        for (name, indexer) in &self.indexers {
            let index = self.indices.entry(name.clone()).or_default();
            for value in indexer(record) {
                index.entry(value).or_default().insert(key.to_string());
            }
        }
    }

    fn unindex(&mut self, key: &str, record: &R) {
        for (name, indexer) in &self.indexers {
            if let Some(index) = self.indices.get_mut(name) {
                for value in indexer(record) {
                    if let Some(keys) = index.get_mut(&value) {
                        keys.remove(key);
                        if keys.is_empty() {
                            index.remove(&value);
                        }
                    }
                }
            }
        }
    }
}

impl<R: Record> MemoryStore<R> {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            inner: RwLock::new(Inner {
                records: BTreeMap::new(),
                indexers: HashMap::new(),
                indices: HashMap::new(),
                version: 0,
            }),
            events,
        }
    }

    fn notify(&self, event: WatchEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }
}

impl<R: Record> Default for MemoryStore<R> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<R: Record> Store<R> for MemoryStore<R> {
    async fn get(&self, namespace: &str, name: &str) -> Result<R> {
        let key = object_key(namespace, name);
        self.inner
            .read()
            .records
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::not_found::<R>(key))
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Vec<R>> {
        let inner = self.inner.read();
        Ok(inner
            .records
            .values()
            .filter(|r| namespace.map_or(true, |ns| r.meta().namespace == ns))
            .cloned()
            .collect())
    }

    async fn create(&self, mut record: R) -> Result<R> {
        let key = record.key();
        {
            let mut inner = self.inner.write();
            if inner.records.contains_key(&key) {
                return Err(StoreError::AlreadyExists {
                    kind: R::KIND,
                    key,
                });
            }
            inner.version += 1;
            let meta = record.meta_mut();
            meta.resource_version = inner.version;
            if meta.uid.is_empty() {
                meta.uid = Uuid::new_v4().to_string();
            }
            inner.index(&key, &record);
            inner.records.insert(key.clone(), record.clone());
        }
        self.notify(WatchEvent::Applied(key));
        Ok(record)
    }

    async fn update(&self, mut record: R) -> Result<R> {
        let key = record.key();
        {
            let mut inner = self.inner.write();
            let existing = inner
                .records
                .get(&key)
                .cloned()
                .ok_or_else(|| StoreError::not_found::<R>(key.clone()))?;
            if existing.meta().resource_version != record.meta().resource_version {
                return Err(StoreError::Conflict {
                    kind: R::KIND,
                    key,
                });
            }
            inner.version += 1;
            let meta = record.meta_mut();
            meta.resource_version = inner.version;
            meta.uid = existing.meta().uid.clone();
            meta.creation_timestamp = existing.meta().creation_timestamp;
            inner.unindex(&key, &existing);
            inner.index(&key, &record);
            inner.records.insert(key.clone(), record.clone());
        }
        self.notify(WatchEvent::Applied(key));
        Ok(record)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        let key = object_key(namespace, name);
        {
            let mut inner = self.inner.write();
            let existing = inner
                .records
                .remove(&key)
                .ok_or_else(|| StoreError::not_found::<R>(key.clone()))?;
            inner.unindex(&key, &existing);
        }
        self.notify(WatchEvent::Deleted(key));
        Ok(())
    }

    async fn by_index(&self, index: &str, value: &str) -> Result<Vec<R>> {
        let inner = self.inner.read();
        if !inner.indexers.contains_key(index) {
            return Err(StoreError::UnknownIndex(index.to_string()));
        }
        let keys = match inner.indices.get(index).and_then(|idx| idx.get(value)) {
            Some(keys) => keys,
            None => return Ok(Vec::new()),
        };
        Ok(keys
            .iter()
            .filter_map(|k| inner.records.get(k).cloned())
            .collect())
    }

    fn add_index(&self, name: &str, index: IndexFn<R>) {
        let mut inner = self.inner.write();
        inner.indexers.insert(name.to_string(), index.clone());
        let mut built: HashMap<String, BTreeSet<String>> = HashMap::new();
        for (key, record) in &inner.records {
            for value in index(record) {
                built.entry(value).or_default().insert(key.clone());
            }
        }
        inner.indices.insert(name.to_string(), built);
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }
}
