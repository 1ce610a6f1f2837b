// Runtime-mutable settings backed by `Setting` records

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::{ObjectMeta, Setting};
use crate::store::{retry_on_conflict, Backoff, Result, SharedStore, WatchEvent};

pub const SERVER_URL: &str = "server-url";
pub const AGENT_IMAGE: &str = "agent-image";
pub const AUTH_IMAGE: &str = "auth-image";
pub const CA_CERTS: &str = "ca-certs";
pub const KUBERNETES_VERSION: &str = "k8s-version";
pub const SYSTEM_DEFAULT_REGISTRY: &str = "system-default-registry";
pub const RKE_METADATA_CONFIG: &str = "rke-metadata-config";
pub const INSTALL_UUID: &str = "install-uuid";
pub const SYSTEM_CATALOG_URL: &str = "system-catalog-url";
pub const LIBRARY_CATALOG_URL: &str = "library-catalog-url";

const DEFAULTS: &[(&str, &str)] = &[
    (SERVER_URL, ""),
    (AGENT_IMAGE, "corral/agent:v0.1.0"),
    (AUTH_IMAGE, "corral/kube-api-auth:v0.1.0"),
    (CA_CERTS, ""),
    (KUBERNETES_VERSION, "v1.27.6-rancher1-1"),
    (SYSTEM_DEFAULT_REGISTRY, ""),
    (
        RKE_METADATA_CONFIG,
        r#"{"refresh-interval-minutes":"1440","url":"https://releases.rancher.com/kontainer-driver-metadata/release-v2.7/data.json"}"#,
    ),
    (SYSTEM_CATALOG_URL, "https://git.rancher.io/system-charts"),
    (LIBRARY_CATALOG_URL, "https://git.rancher.io/charts"),
];

/// Cached view of the settings records. Reads never touch the store.
#[derive(Clone)]
pub struct Settings {
    store: SharedStore<Setting>,
    cache: Arc<RwLock<HashMap<String, String>>>,
}

impl Settings {
    pub fn new(store: SharedStore<Setting>) -> Self {
        let cache = DEFAULTS
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Self {
            store,
            cache: Arc::new(RwLock::new(cache)),
        }
    }

    /// Creates missing settings with their defaults, applies configured values,
    /// and loads everything into the cache.
    pub async fn seed(&self, overrides: &BTreeMap<String, String>) -> Result<()> {
        for (name, default) in DEFAULTS {
            let existing = self.store.get_opt("", name).await?;
            match existing {
                Some(mut setting) if setting.default != *default => {
                    setting.default = default.to_string();
                    self.store.update(setting).await?;
                }
                Some(_) => {}
                None => {
                    self.store
                        .create(Setting {
                            metadata: ObjectMeta::named(*name),
                            value: String::new(),
                            default: default.to_string(),
                        })
                        .await?;
                }
            }
        }
        for (name, value) in overrides {
            self.set(name, value).await?;
        }
        self.reload().await
    }

    pub async fn reload(&self) -> Result<()> {
        let settings = self.store.list(None).await?;
        let mut cache = self.cache.write();
        for setting in settings {
            cache.insert(setting.metadata.name.clone(), setting.effective().to_string());
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> String {
        self.cache.read().get(name).cloned().unwrap_or_default()
    }

    pub async fn set(&self, name: &str, value: &str) -> Result<()> {
        let store = &self.store;
        retry_on_conflict(Backoff::conflict(), || async move {
            match store.get_opt("", name).await? {
                Some(mut setting) => {
                    setting.value = value.to_string();
                    store.update(setting).await
                }
                None => {
                    store
                        .create(Setting {
                            metadata: ObjectMeta::named(name),
                            value: value.to_string(),
                            default: String::new(),
                        })
                        .await
                }
            }
        })
        .await?;
        self.cache.write().insert(name.to_string(), value.to_string());
        Ok(())
    }

    /// The installation id, generated on first call and persisted.
    pub async fn install_uuid(&self) -> Result<String> {
        let current = self.get(INSTALL_UUID);
        if !current.is_empty() {
            return Ok(current);
        }
        if let Some(setting) = self.store.get_opt("", INSTALL_UUID).await? {
            if !setting.effective().is_empty() {
                let id = setting.effective().to_string();
                self.cache.write().insert(INSTALL_UUID.to_string(), id.clone());
                return Ok(id);
            }
        }
        let id = Uuid::new_v4().to_string();
        self.set(INSTALL_UUID, &id).await?;
        info!(install_uuid = %id, "generated install uuid");
        Ok(id)
    }

    /// Keeps the cache in step with writes made through the store.
    pub fn spawn_watch(&self) {
        let settings = self.clone();
        let mut events = self.store.watch();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if let WatchEvent::Applied(_) = event {
                    if let Err(e) = settings.reload().await {
                        warn!("failed to reload settings: {}", e);
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn seed_applies_overrides_and_defaults() {
        let settings = Settings::new(Arc::new(MemoryStore::new()));
        let mut overrides = BTreeMap::new();
        overrides.insert(SERVER_URL.to_string(), "https://corral.example.com".to_string());
        settings.seed(&overrides).await.unwrap();

        assert_eq!(settings.get(SERVER_URL), "https://corral.example.com");
        assert_eq!(settings.get(AGENT_IMAGE), "corral/agent:v0.1.0");
        assert_eq!(settings.get("unknown"), "");
    }

    #[tokio::test]
    async fn install_uuid_is_stable() {
        let store: SharedStore<Setting> = Arc::new(MemoryStore::new());
        let first = Settings::new(store.clone()).install_uuid().await.unwrap();
        let second = Settings::new(store).install_uuid().await.unwrap();
        assert_eq!(first, second);
        assert!(!first.is_empty());
    }
}
