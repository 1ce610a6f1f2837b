// Postgres-backed store: one JSONB row per record

use async_trait::async_trait;
use parking_lot::RwLock;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::marker::PhantomData;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::{IndexFn, Record, Result, Store, StoreError, WatchEvent};
use crate::models::meta::object_key;

/// Records of one kind in the shared `records` table.
///
/// Index lookups evaluate the registered index functions over the kind's rows;
/// watch events only cover writes made through this process.
pub struct PgStore<R: Record> {
    pool: PgPool,
    indexers: RwLock<HashMap<String, IndexFn<R>>>,
    events: broadcast::Sender<WatchEvent>,
    _marker: PhantomData<fn() -> R>,
}

impl<R: Record> PgStore<R> {
    pub fn new(pool: PgPool) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            pool,
            indexers: RwLock::new(HashMap::new()),
            events,
            _marker: PhantomData,
        }
    }

    fn decode(body: serde_json::Value, resource_version: i64) -> Result<R> {
        let mut record: R = serde_json::from_value(body)?;
        record.meta_mut().resource_version = resource_version as u64;
        Ok(record)
    }

    fn notify(&self, event: WatchEvent) {
        let _ = self.events.send(event);
    }

    async fn exists(&self, namespace: &str, name: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM records WHERE kind = $1 AND namespace = $2 AND name = $3")
            .bind(R::KIND)
            .bind(namespace)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }
}

#[async_trait]
impl<R: Record> Store<R> for PgStore<R> {
    async fn get(&self, namespace: &str, name: &str) -> Result<R> {
        let row = sqlx::query(
            "SELECT body, resource_version FROM records WHERE kind = $1 AND namespace = $2 AND name = $3",
        )
        .bind(R::KIND)
        .bind(namespace)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::not_found::<R>(object_key(namespace, name)))?;

        Self::decode(row.try_get("body")?, row.try_get("resource_version")?)
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Vec<R>> {
        let rows = sqlx::query(
            r#"
            SELECT body, resource_version FROM records
            WHERE kind = $1 AND ($2::TEXT IS NULL OR namespace = $2)
            ORDER BY namespace, name
            "#,
        )
        .bind(R::KIND)
        .bind(namespace)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| Self::decode(row.try_get("body")?, row.try_get("resource_version")?))
            .collect()
    }

    async fn create(&self, mut record: R) -> Result<R> {
        if record.meta().uid.is_empty() {
            record.meta_mut().uid = Uuid::new_v4().to_string();
        }
        let key = record.key();
        let body = serde_json::to_value(&record)?;
        let meta = record.meta();

        let row = sqlx::query(
            r#"
            INSERT INTO records (kind, namespace, name, resource_version, body)
            VALUES ($1, $2, $3, nextval('record_versions'), $4)
            ON CONFLICT (kind, namespace, name) DO NOTHING
            RETURNING resource_version
            "#,
        )
        .bind(R::KIND)
        .bind(&meta.namespace)
        .bind(&meta.name)
        .bind(body)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::AlreadyExists {
            kind: R::KIND,
            key: key.clone(),
        })?;

        let version: i64 = row.try_get("resource_version")?;
        record.meta_mut().resource_version = version as u64;
        self.notify(WatchEvent::Applied(key));
        Ok(record)
    }

    async fn update(&self, mut record: R) -> Result<R> {
        let key = record.key();
        let body = serde_json::to_value(&record)?;
        let meta = record.meta().clone();

        let row = sqlx::query(
            r#"
            UPDATE records
            SET body = $5, resource_version = nextval('record_versions'), updated_at = now()
            WHERE kind = $1 AND namespace = $2 AND name = $3 AND resource_version = $4
            RETURNING resource_version
            "#,
        )
        .bind(R::KIND)
        .bind(&meta.namespace)
        .bind(&meta.name)
        .bind(meta.resource_version as i64)
        .bind(body)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let version: i64 = row.try_get("resource_version")?;
                record.meta_mut().resource_version = version as u64;
                self.notify(WatchEvent::Applied(key));
                Ok(record)
            }
            None if self.exists(&meta.namespace, &meta.name).await? => Err(StoreError::Conflict {
                kind: R::KIND,
                key,
            }),
            None => Err(StoreError::not_found::<R>(key)),
        }
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM records WHERE kind = $1 AND namespace = $2 AND name = $3")
            .bind(R::KIND)
            .bind(namespace)
            .bind(name)
            .execute(&self.pool)
            .await?;

        let key = object_key(namespace, name);
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found::<R>(key));
        }
        self.notify(WatchEvent::Deleted(key));
        Ok(())
    }

    async fn by_index(&self, index: &str, value: &str) -> Result<Vec<R>> {
        let indexer = self
            .indexers
            .read()
            .get(index)
            .cloned()
            .ok_or_else(|| StoreError::UnknownIndex(index.to_string()))?;

        let records = self.list(None).await?;
        Ok(records
            .into_iter()
            .filter(|r| indexer(r).iter().any(|v| v == value))
            .collect())
    }

    fn add_index(&self, name: &str, index: IndexFn<R>) {
        self.indexers.write().insert(name.to_string(), index);
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }
}
