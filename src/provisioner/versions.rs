use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::ProvisionError;
use crate::models::cluster::{ClusterSpec, RkeConfig, SystemImages};

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const FALLBACK_FILE: &str = "rke/data/data.json";

/// The `rke-metadata-config` setting value.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct MetadataSource {
    #[serde(default)]
    pub url: String,
    #[serde(default, rename = "refresh-interval-minutes")]
    pub refresh_interval_minutes: String,
}

impl MetadataSource {
    pub fn parse(setting: &str) -> Result<Self, ProvisionError> {
        serde_json::from_str(setting)
            .map_err(|e| ProvisionError::Metadata(format!("error parsing metadata config {}: {}", setting, e)))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct VersionMetadata {
    #[serde(default, rename = "K8sVersionRKESystemImages")]
    pub system_images: BTreeMap<String, SystemImages>,
}

/// Kubernetes version to system-image mapping, refreshed from the metadata URL
/// with a bundled file as fallback.
#[derive(Clone)]
pub struct VersionCatalog {
    metadata: Arc<RwLock<VersionMetadata>>,
    fallback: PathBuf,
    http: reqwest::Client,
}

impl VersionCatalog {
    pub fn new(metadata_dir: &Path) -> Result<Self, ProvisionError> {
        let http = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .map_err(|e| ProvisionError::Metadata(e.to_string()))?;
        Ok(Self {
            metadata: Arc::new(RwLock::new(VersionMetadata::default())),
            fallback: metadata_dir.join(FALLBACK_FILE),
            http,
        })
    }

    pub fn with_metadata(metadata: VersionMetadata) -> Self {
        Self {
            metadata: Arc::new(RwLock::new(metadata)),
            fallback: PathBuf::new(),
            http: reqwest::Client::new(),
        }
    }

    /// Loads metadata from the configured URL; when unreachable, from the
    /// fallback file.
    pub async fn refresh(&self, source: &MetadataSource) -> Result<(), ProvisionError> {
        let fetched = if source.url.is_empty() {
            Err(ProvisionError::Metadata("no metadata url configured".to_string()))
        } else {
            self.fetch(&source.url).await
        };
        let metadata = match fetched {
            Ok(metadata) => {
                info!(url = %source.url, "driverMetadata: refreshed data from upstream");
                metadata
            }
            Err(e) => {
                warn!("driverMetadata: {}; loading {}", e, self.fallback.display());
                let data = tokio::fs::read(&self.fallback).await.map_err(|e| {
                    ProvisionError::Metadata(format!("failed to read {}: {}", self.fallback.display(), e))
                })?;
                serde_json::from_slice(&data)
                    .map_err(|e| ProvisionError::Metadata(format!("invalid metadata file: {}", e)))?
            }
        };
        *self.metadata.write() = metadata;
        Ok(())
    }

    async fn fetch(&self, url: &str) -> Result<VersionMetadata, ProvisionError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| ProvisionError::Metadata(format!("failed to refresh data from upstream {}: {}", url, e)))?;
        response
            .json()
            .await
            .map_err(|e| ProvisionError::Metadata(format!("invalid metadata from {}: {}", url, e)))
    }

    pub fn versions(&self) -> Vec<String> {
        self.metadata.read().system_images.keys().cloned().collect()
    }

    /// System images for `version`, each prefixed with `registry` when set.
    pub fn system_images(&self, version: &str, registry: &str) -> Result<SystemImages, ProvisionError> {
        let images = self
            .metadata
            .read()
            .system_images
            .get(version)
            .cloned()
            .ok_or_else(|| ProvisionError::Metadata(format!("failed to find system images for version {}", version)))?;
        if registry.is_empty() {
            return Ok(images);
        }
        Ok(images
            .into_iter()
            .map(|(k, v)| (k, format!("{}/{}", registry.trim_end_matches('/'), v)))
            .collect())
    }
}

/// Fills an empty desired version from the applied spec, else from the
/// process-wide default.
pub fn set_version(spec: &mut ClusterSpec, applied: Option<&ClusterSpec>, default_version: &str) {
    let Some(rke) = spec.rancher_kubernetes_engine_config.as_mut() else {
        return;
    };
    if !rke.kubernetes_version.is_empty() {
        return;
    }
    let applied_version = applied
        .and_then(|a| a.rancher_kubernetes_engine_config.as_ref())
        .map(|a| a.kubernetes_version.as_str())
        .unwrap_or("");
    rke.kubernetes_version = if applied_version.is_empty() {
        default_version.to_string()
    } else {
        applied_version.to_string()
    };
}

/// Registry prefixed to system images: the first private registry of the
/// config, else the system default.
pub fn private_registry<'a>(config: &'a RkeConfig, system_default: &'a str) -> &'a str {
    config
        .private_registries
        .first()
        .map(|r| r.url.as_str())
        .unwrap_or(system_default)
}
