// Record storage contract shared by every component

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use sqlx::PgPool;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::models::{auth, catalog, cluster, rbac, ObjectMeta, Setting};

pub mod memory;
pub mod postgres;
pub mod retry;

pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use retry::{retry_on_conflict, Backoff, Retryable};

pub trait Record: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: &'static str;

    fn meta(&self) -> &ObjectMeta;
    fn meta_mut(&mut self) -> &mut ObjectMeta;

    fn key(&self) -> String {
        self.meta().key()
    }
}

#[macro_export]
macro_rules! impl_record {
    ($ty:ty, $kind:expr) => {
        impl $crate::store::Record for $ty {
            const KIND: &'static str = $kind;

            fn meta(&self) -> &$crate::models::ObjectMeta {
                &self.metadata
            }

            fn meta_mut(&mut self) -> &mut $crate::models::ObjectMeta {
                &mut self.metadata
            }
        }
    };
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} \"{key}\" not found")]
    NotFound { kind: &'static str, key: String },

    #[error("{kind} \"{key}\" already exists")]
    AlreadyExists { kind: &'static str, key: String },

    #[error("the object {kind} \"{key}\" has been modified; please apply your changes to the latest version and try again")]
    Conflict { kind: &'static str, key: String },

    #[error("index {0} does not exist")]
    UnknownIndex(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn not_found<R: Record>(key: impl Into<String>) -> Self {
        StoreError::NotFound {
            kind: R::KIND,
            key: key.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Change notification carrying the record's workqueue key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Applied(String),
    Deleted(String),
}

impl WatchEvent {
    pub fn key(&self) -> &str {
        match self {
            WatchEvent::Applied(key) | WatchEvent::Deleted(key) => key,
        }
    }
}

/// Secondary index function: the index values a record is filed under.
pub type IndexFn<R> = Arc<dyn Fn(&R) -> Vec<String> + Send + Sync>;

#[async_trait]
pub trait Store<R: Record>: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<R>;

    /// All records, or only those in `namespace` when given.
    async fn list(&self, namespace: Option<&str>) -> Result<Vec<R>>;

    async fn create(&self, record: R) -> Result<R>;

    /// Compare-and-swap on `resource_version`; a stale version is a `Conflict`.
    async fn update(&self, record: R) -> Result<R>;

    async fn delete(&self, namespace: &str, name: &str) -> Result<()>;

    async fn by_index(&self, index: &str, value: &str) -> Result<Vec<R>>;

    fn add_index(&self, name: &str, index: IndexFn<R>);

    fn watch(&self) -> broadcast::Receiver<WatchEvent>;

    async fn get_opt(&self, namespace: &str, name: &str) -> Result<Option<R>> {
        match self.get(namespace, name).await {
            Ok(record) => Ok(Some(record)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Creates the record, or overwrites the existing one when it already exists.
    async fn create_or_update(&self, record: R) -> Result<R> {
        match self.create(record.clone()).await {
            Err(e) if e.is_already_exists() => {
                let meta = record.meta();
                let existing = self.get(&meta.namespace, &meta.name).await?;
                let mut record = record;
                record.meta_mut().resource_version = existing.meta().resource_version;
                record.meta_mut().uid = existing.meta().uid.clone();
                self.update(record).await
            }
            other => other,
        }
    }

    async fn delete_if_exists(&self, namespace: &str, name: &str) -> Result<()> {
        match self.delete(namespace, name).await {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }

    /// Records in `namespace` (or everywhere) carrying every label in `selector`.
    async fn list_labeled(
        &self,
        namespace: Option<&str>,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<R>> {
        let records = self.list(namespace).await?;
        Ok(records
            .into_iter()
            .filter(|r| {
                selector
                    .iter()
                    .all(|(k, v)| r.meta().labels.get(k) == Some(v))
            })
            .collect())
    }
}

pub type SharedStore<R> = Arc<dyn Store<R>>;

/// One store per record kind, all on the same backend.
#[derive(Clone)]
pub struct Stores {
    pub settings: SharedStore<Setting>,
    pub clusters: SharedStore<cluster::Cluster>,
    pub nodes: SharedStore<cluster::Node>,
    pub etcd_backups: SharedStore<cluster::EtcdBackup>,
    pub kontainer_drivers: SharedStore<cluster::KontainerDriver>,
    pub registration_tokens: SharedStore<cluster::ClusterRegistrationToken>,
    pub tokens: SharedStore<auth::Token>,
    pub users: SharedStore<auth::User>,
    pub user_attributes: SharedStore<auth::UserAttribute>,
    pub global_role_bindings: SharedStore<auth::GlobalRoleBinding>,
    pub auth_configs: SharedStore<auth::AuthConfig>,
    pub catalogs: SharedStore<catalog::Catalog>,
    pub templates: SharedStore<catalog::Template>,
    pub template_versions: SharedStore<catalog::TemplateVersion>,
    pub role_templates: SharedStore<rbac::RoleTemplate>,
    pub global_roles: SharedStore<rbac::GlobalRole>,
    pub crtbs: SharedStore<rbac::ClusterRoleTemplateBinding>,
    pub prtbs: SharedStore<rbac::ProjectRoleTemplateBinding>,
    pub projects: SharedStore<rbac::Project>,
}

impl Stores {
    pub fn memory() -> Self {
        fn mem<R: Record>() -> SharedStore<R> {
            Arc::new(MemoryStore::<R>::new())
        }
        Self {
            settings: mem(),
            clusters: mem(),
            nodes: mem(),
            etcd_backups: mem(),
            kontainer_drivers: mem(),
            registration_tokens: mem(),
            tokens: mem(),
            users: mem(),
            user_attributes: mem(),
            global_role_bindings: mem(),
            auth_configs: mem(),
            catalogs: mem(),
            templates: mem(),
            template_versions: mem(),
            role_templates: mem(),
            global_roles: mem(),
            crtbs: mem(),
            prtbs: mem(),
            projects: mem(),
        }
    }

    pub fn postgres(pool: PgPool) -> Self {
        fn store<R: Record>(pool: PgPool) -> SharedStore<R> {
            Arc::new(PgStore::<R>::new(pool))
        }
        Self {
            settings: store(pool.clone()),
            clusters: store(pool.clone()),
            nodes: store(pool.clone()),
            etcd_backups: store(pool.clone()),
            kontainer_drivers: store(pool.clone()),
            registration_tokens: store(pool.clone()),
            tokens: store(pool.clone()),
            users: store(pool.clone()),
            user_attributes: store(pool.clone()),
            global_role_bindings: store(pool.clone()),
            auth_configs: store(pool.clone()),
            catalogs: store(pool.clone()),
            templates: store(pool.clone()),
            template_versions: store(pool.clone()),
            role_templates: store(pool.clone()),
            global_roles: store(pool.clone()),
            crtbs: store(pool.clone()),
            prtbs: store(pool.clone()),
            projects: store(pool.clone()),
        }
    }
}
