// Cluster provisioning state machine: pending -> provisioning -> provisioned -> updating/restoring -> removed

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::controller::{Action, ErrorClass, Reconciler};
use crate::models::cluster::{
    condition, driver as driver_name, Cluster, ClusterSpec, EtcdBackup, Flag, KontainerDriver, Node, RkeConfig,
};
use crate::models::meta::split_key;
use crate::registry::ClusterRegistry;
use crate::settings::{Settings, KUBERNETES_VERSION, SYSTEM_DEFAULT_REGISTRY};
use crate::store::{SharedStore, StoreError};

pub mod backoff;
pub mod driver;
pub mod external;
pub mod nodes;
pub mod versions;

pub use backoff::FailureBackoff;
pub use driver::{ClusterInfo, DriverError, EngineDriver, EngineRequest, EngineService};
pub use external::{ExternalDriver, KontainerDriverController};
pub use versions::VersionCatalog;

use driver::{censor_generic_config, clean_rke, driver_options, DRIVER_NAME_FIELD, IMPORT_DRIVER_NAME, RKE_DRIVER_NAME};

const REMOVE_ATTEMPTS: u32 = 4;
const SAVE_ATTEMPTS: u32 = 20;
const WAITING_MESSAGE: &str = "Waiting for API to be available";

#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Not ready yet; the cluster is re-enqueued without being reported.
    #[error("{message}")]
    Forget {
        reason: String,
        message: String,
        requeue_after: Option<Duration>,
    },

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Metadata(String),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ProvisionError {
    pub fn forget(reason: &str, message: impl Into<String>) -> Self {
        ProvisionError::Forget {
            reason: reason.to_string(),
            message: message.into(),
            requeue_after: None,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            ProvisionError::Forget { reason, .. } => Some(reason),
            _ => None,
        }
    }
}

impl ErrorClass for ProvisionError {
    fn is_forget(&self) -> bool {
        matches!(self, ProvisionError::Forget { .. })
    }

    fn requeue_after(&self) -> Option<Duration> {
        match self {
            ProvisionError::Forget { requeue_after, .. } => *requeue_after,
            _ => None,
        }
    }
}

type Result<T> = std::result::Result<T, ProvisionError>;

/// Which engine call converges the spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dispatch {
    Create,
    Restore,
    Update,
}

pub struct Provisioner {
    clusters: ClusterRegistry,
    nodes: SharedStore<Node>,
    backups: SharedStore<EtcdBackup>,
    kontainer_drivers: SharedStore<KontainerDriver>,
    settings: Settings,
    versions: VersionCatalog,
    engines: EngineService,
    backoff: FailureBackoff,
}

impl Provisioner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        clusters: ClusterRegistry,
        nodes: SharedStore<Node>,
        backups: SharedStore<EtcdBackup>,
        kontainer_drivers: SharedStore<KontainerDriver>,
        settings: Settings,
        versions: VersionCatalog,
        engines: EngineService,
        backoff: FailureBackoff,
    ) -> Self {
        Self {
            clusters,
            nodes,
            backups,
            kontainer_drivers,
            settings,
            versions,
            engines,
            backoff,
        }
    }

    /// Node changes re-enqueue the owning cluster.
    pub fn machine_changed(&self, node_key: &str) {
        let (cluster, _) = split_key(node_key);
        if !cluster.is_empty() {
            self.clusters.enqueue(cluster);
        }
    }

    async fn create(&self, mut cluster: Cluster) -> Result<Action> {
        let before = cluster.status.conditions.clone();
        let conditions = &mut cluster.status.conditions;
        conditions.create_unknown_if_not_exists(condition::PENDING);
        conditions.create_unknown_if_not_exists(condition::PROVISIONED);
        conditions.create_unknown_if_not_exists(condition::WAITING);
        if conditions.message(condition::WAITING).is_empty() {
            conditions.set_message(condition::WAITING, WAITING_MESSAGE);
        }
        if cluster.status.conditions != before {
            cluster = self.clusters.update(cluster).await?;
        }

        let cluster = self.pending(cluster).await?;
        self.with_condition(condition::PROVISIONED, cluster, true).await
    }

    async fn updated(&self, mut cluster: Cluster) -> Result<Action> {
        let default_version = self.settings.get(KUBERNETES_VERSION);
        versions::set_version(&mut cluster.spec, cluster.status.applied_spec.as_ref(), &default_version);
        self.with_condition(condition::UPDATED, cluster, false).await
    }

    /// Runs a provisioning pass, reflecting real failures on `cond`. Forget
    /// errors leave conditions untouched.
    async fn with_condition(&self, cond: &'static str, cluster: Cluster, create: bool) -> Result<Action> {
        let name = cluster.name().to_string();
        match self.reconcile_cluster(cluster, create).await {
            Ok(action) => {
                if create {
                    self.clusters
                        .mutate(&name, |c| {
                            let conditions = &mut c.status.conditions;
                            conditions.set_true(condition::PROVISIONED);
                            conditions.clear(condition::PROVISIONED);
                            conditions.set_true(condition::PENDING);
                        })
                        .await?;
                }
                Ok(action)
            }
            Err(e) if e.is_forget() => Err(e),
            Err(e) => {
                let message = e.to_string();
                self.clusters
                    .mutate(&name, |c| c.status.conditions.fail(cond, "Error", message.clone()))
                    .await?;
                Err(e)
            }
        }
    }

    async fn pending(&self, mut cluster: Cluster) -> Result<Cluster> {
        if cluster.is_passthrough() {
            return Ok(cluster);
        }

        let driver = self.validate_driver(&mut cluster).await?;
        if driver.is_empty() {
            return Err(ProvisionError::forget(
                "Pending",
                "waiting for full cluster configuration",
            ));
        }

        if driver != cluster.status.driver {
            info!(cluster = %cluster.name(), driver = %driver, "cluster driver selected");
            if driver == driver_name::RKE && cluster.spec.rancher_kubernetes_engine_config.is_none() {
                cluster.spec.rancher_kubernetes_engine_config = Some(RkeConfig::default());
            }
            cluster.status.driver = driver;
            return Ok(self.clusters.update(cluster).await?);
        }
        Ok(cluster)
    }

    /// The driver the spec asks for, or empty when it cannot be decided yet.
    /// Legacy hosted-engine configs are moved into the generic config.
    async fn spec_driver(&self, spec: &mut ClusterSpec) -> Result<String> {
        if spec.generic_engine_config.is_none() {
            let legacy = [
                (spec.amazon_elastic_container_service_config.take(), driver_name::AMAZON_EKS),
                (spec.azure_kubernetes_service_config.take(), driver_name::AZURE_AKS),
                (spec.google_kubernetes_engine_config.take(), driver_name::GOOGLE_GKE),
            ];
            for (config, name) in legacy {
                if let Some(serde_json::Value::Object(mut config)) = config {
                    config.insert(DRIVER_NAME_FIELD.to_string(), name.into());
                    spec.generic_engine_config = Some(config);
                }
            }
        }

        let mut kontainer_driver = None;
        if let Some(config) = &spec.generic_engine_config {
            let name = config
                .get(DRIVER_NAME_FIELD)
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            kontainer_driver = Some(self.kontainer_drivers.get("", name).await?);
        }

        if spec.rancher_kubernetes_engine_config.is_some() {
            return Ok(driver_name::RKE.to_string());
        }
        if let Some(record) = kontainer_driver {
            return Ok(record.status.display_name);
        }
        if spec.imported_config.is_some() {
            return Ok(driver_name::IMPORTED.to_string());
        }
        Ok(String::new())
    }

    /// The driver is write-once: a different driver than the recorded one is refused.
    async fn validate_driver(&self, cluster: &mut Cluster) -> Result<String> {
        let old = cluster.status.driver.clone();
        if old == driver_name::IMPORTED {
            return Ok(old);
        }

        let new = self.spec_driver(&mut cluster.spec).await?;
        if old.is_empty() {
            return Ok(new);
        }
        if new.is_empty() {
            return Err(ProvisionError::forget("Pending", "waiting for nodes"));
        }
        if old != new {
            return Err(ProvisionError::Validation(format!(
                "driver change from {} to {} not allowed",
                old, new
            )));
        }
        Ok(new)
    }

    async fn reconcile_cluster(&self, mut cluster: Cluster, create: bool) -> Result<Action> {
        if cluster.is_passthrough() {
            return Ok(Action::done());
        }
        let name = cluster.name().to_string();

        if name != "local"
            && !cluster.status.conditions.is_true(condition::SERVICE_ACCOUNT_MIGRATED)
            && cluster.status.conditions.is_true(condition::PROVISIONED)
        {
            cluster = self.migrate_service_account(cluster).await?;
        }

        let Some(spec) = self.effective_spec(&mut cluster).await? else {
            debug!(cluster = %name, "cluster spec already applied");
            return Ok(Action::done());
        };

        if cluster.status.failed_spec.as_ref() == Some(&spec) {
            if let Some(delay) = self.backoff.remaining(&name, Instant::now()) {
                return Err(ProvisionError::Forget {
                    reason: String::new(),
                    message: format!("backing off failure, delay: {:?}", delay),
                    requeue_after: Some(delay),
                });
            }
        }

        let rke = spec.rancher_kubernetes_engine_config.as_ref();
        let dispatch = if create {
            Dispatch::Create
        } else if rke.and_then(|r| r.restore.as_ref()).map_or(false, |r| r.restore) {
            Dispatch::Restore
        } else {
            Dispatch::Update
        };

        info!(cluster = %name, "Provisioning cluster");
        let result = match dispatch {
            Dispatch::Create => {
                info!(cluster = %name, "Creating cluster");
                match self.driver_create(&cluster, &spec).await {
                    Err(ProvisionError::Driver(DriverError::AlreadyExists)) => {
                        info!(cluster = %name, "Create done, Updating cluster");
                        self.driver_update(&cluster, &spec).await
                    }
                    other => other,
                }
            }
            Dispatch::Restore => {
                info!(cluster = %name, "Restoring cluster from backup");
                self.restore_cluster_backup(&cluster, &spec).await
            }
            Dispatch::Update => {
                if rke.map_or(false, |r| r.rotate_certificates.is_some()) {
                    info!(cluster = %name, "Rotating certificates for cluster");
                } else {
                    info!(cluster = %name, "Updating cluster");
                }
                self.driver_update(&cluster, &spec).await
            }
        };

        let info = match result {
            Ok(info) => {
                self.backoff.delete(&name);
                info
            }
            Err(ProvisionError::Driver(e)) => return self.record_failure(&name, spec, e).await,
            Err(e) => return Err(e),
        };

        self.clear_failed_spec(&name).await?;
        self.driver_remove_legacy_service_account(&spec).await?;
        self.save_applied(&name, &spec, info).await?;
        info!(cluster = %name, "Provisioned cluster");
        Ok(Action::done())
    }

    /// Engine failures are kept on the record and retried after the backoff
    /// window instead of surfacing to the queue.
    async fn record_failure(&self, name: &str, spec: ClusterSpec, err: DriverError) -> Result<Action> {
        warn!(cluster = %name, "cluster provisioning failed: {}", err);
        self.backoff.next(name, Instant::now());
        let message = err.to_string();
        self.clusters
            .mutate(name, |c| {
                c.status.failed_spec = Some(spec.clone());
                c.status.conditions.set_message(condition::PROVISIONED, message.clone());
            })
            .await?;
        Ok(Action::requeue(self.backoff.get(name)))
    }

    async fn clear_failed_spec(&self, name: &str) -> Result<()> {
        let current = self.clusters.get(name).await?;
        if current.status.failed_spec.is_some() {
            self.clusters.mutate(name, |c| c.status.failed_spec = None).await?;
        }
        Ok(())
    }

    async fn save_applied(&self, name: &str, spec: &ClusterSpec, info: ClusterInfo) -> Result<()> {
        let applied = self.censor(spec.clone()).await?;
        let mut last_err = None;
        for attempt in 0..SAVE_ATTEMPTS {
            let mut cluster = self.clusters.get(name).await?;
            cluster.status.set_applied_spec(applied.clone());
            cluster.status.api_endpoint = info.api_endpoint.clone();
            cluster.status.service_account_token = info.service_account_token.clone();
            cluster.status.ca_cert = info.ca_cert.clone();
            cluster.status.conditions.set_true(condition::SERVICE_ACCOUNT_MIGRATED);
            reset_one_shot_flags(&mut cluster);
            match self.clusters.update(cluster).await {
                Ok(_) => return Ok(()),
                Err(e) => {
                    warn!(cluster = %name, attempt, "failed to update cluster: {}", e);
                    last_err = Some(e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
        Err(last_err
            .map(ProvisionError::from)
            .unwrap_or_else(|| ProvisionError::Validation("failed to update cluster".to_string())))
    }

    async fn migrate_service_account(&self, mut cluster: Cluster) -> Result<Cluster> {
        let driver = self.validate_driver(&mut cluster).await?;
        let spec = self.config_for(&cluster.spec, &driver, cluster.name(), true).await?.0;
        let req = self.request(cluster.name(), &spec).await?;
        let engine = self.engine(&spec).await?;
        let token = self
            .engines
            .call("generateServiceAccount", |ctx| engine.generate_service_account(ctx, &req))
            .await?;
        cluster.status.service_account_token = token;
        cluster.status.conditions.set_true(condition::SERVICE_ACCOUNT_MIGRATED);
        let cluster = self.clusters.update(cluster).await?;
        self.driver_remove_legacy_service_account(&spec).await?;
        info!(cluster = %cluster.name(), "service account migrated");
        Ok(cluster)
    }

    /// The spec to converge, or `None` when it matches the applied spec.
    async fn effective_spec(&self, cluster: &mut Cluster) -> Result<Option<ClusterSpec>> {
        let driver = self.validate_driver(cluster).await?;
        let name = cluster.name().to_string();
        let applied = cluster.status.applied_spec.clone().unwrap_or_default();
        let (_, old_config) = self.config_for(&applied, &driver, &name, false).await?;

        let censored = self.censor(cluster.spec.clone()).await?;
        let (_, new_config) = self.config_for(&censored, &driver, &name, true).await?;
        if old_config == new_config {
            return Ok(None);
        }

        let (spec, _) = self.config_for(&cluster.spec, &driver, &name, true).await?;
        Ok(Some(spec))
    }

    /// The spec with RKE nodes and system images resolved, plus the config
    /// value compared against the applied one.
    async fn config_for(
        &self,
        spec: &ClusterSpec,
        driver: &str,
        cluster_name: &str,
        reconcile_rke: bool,
    ) -> Result<(ClusterSpec, serde_json::Value)> {
        let mut spec = spec.clone();
        if driver == driver_name::RKE && reconcile_rke {
            let machines = self.nodes.list(Some(cluster_name)).await?;
            let node_list = nodes::reconcile_rke_nodes(&machines)?;
            let system_default = self.settings.get(SYSTEM_DEFAULT_REGISTRY);
            let rke = spec.rancher_kubernetes_engine_config.get_or_insert_with(RkeConfig::default);
            let registry = versions::private_registry(rke, &system_default).to_string();
            rke.system_images = self.versions.system_images(&rke.kubernetes_version, &registry)?;
            rke.nodes = node_list;
        }

        let config = if let Some(generic) = &spec.generic_engine_config {
            serde_json::Value::Object(generic.clone())
        } else if let Some(rke) = &spec.rancher_kubernetes_engine_config {
            serde_json::to_value(rke).map_err(StoreError::from)?
        } else {
            serde_json::Value::Object(Default::default())
        };
        Ok((spec, config))
    }

    async fn kontainer_driver_for(&self, spec: &ClusterSpec) -> Result<KontainerDriver> {
        let name = if let Some(config) = &spec.generic_engine_config {
            config
                .get(DRIVER_NAME_FIELD)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        } else if spec.rancher_kubernetes_engine_config.is_some() {
            RKE_DRIVER_NAME.to_string()
        } else if spec.imported_config.is_some() {
            IMPORT_DRIVER_NAME.to_string()
        } else {
            return Err(ProvisionError::Validation(format!(
                "no kontainer driver for cluster {}",
                spec.display_name
            )));
        };
        Ok(self.kontainer_drivers.get("", &name).await?)
    }

    async fn flags_for(&self, spec: &ClusterSpec) -> Result<Vec<Flag>> {
        if spec.generic_engine_config.is_none() {
            return Ok(Vec::new());
        }
        match self.kontainer_driver_for(spec).await {
            Ok(record) => Ok(match record.spec.driver {
                crate::models::cluster::Driver::External { flags, .. } => flags,
                crate::models::cluster::Driver::Builtin { .. } => Vec::new(),
            }),
            Err(ProvisionError::Store(e)) if e.is_not_found() => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    async fn censor(&self, spec: ClusterSpec) -> Result<ClusterSpec> {
        let flags = self.flags_for(&spec).await?;
        Ok(censor_generic_config(spec, &flags))
    }

    async fn engine(&self, spec: &ClusterSpec) -> Result<std::sync::Arc<dyn EngineDriver>> {
        let record = self.kontainer_driver_for(spec).await?;
        Ok(self.engines.engine_for(&record)?)
    }

    async fn request(&self, name: &str, spec: &ClusterSpec) -> Result<EngineRequest> {
        let spec = clean_rke(spec);
        let flags = self.flags_for(&spec).await?;
        Ok(EngineRequest {
            name: name.to_string(),
            options: driver_options(&spec, &flags),
            spec,
        })
    }

    async fn driver_create(&self, cluster: &Cluster, spec: &ClusterSpec) -> Result<ClusterInfo> {
        let engine = self.engine(spec).await?;
        let req = self.request(cluster.name(), spec).await?;
        Ok(self.engines.call("create", |ctx| engine.create(ctx, &req)).await?)
    }

    async fn driver_update(&self, cluster: &Cluster, spec: &ClusterSpec) -> Result<ClusterInfo> {
        let cleaned = clean_rke(spec);
        let applied = cluster.status.applied_spec.as_ref().map(clean_rke).unwrap_or_default();
        if cleaned.rancher_kubernetes_engine_config.is_some()
            && !cluster.status.api_endpoint.is_empty()
            && !cluster.status.service_account_token.is_empty()
            && applied.rancher_kubernetes_engine_config == cleaned.rancher_kubernetes_engine_config
        {
            return Ok(ClusterInfo {
                api_endpoint: cluster.status.api_endpoint.clone(),
                service_account_token: cluster.status.service_account_token.clone(),
                ca_cert: cluster.status.ca_cert.clone(),
            });
        }

        let engine = self.engine(spec).await?;
        let req = self.request(cluster.name(), spec).await?;
        Ok(self.engines.call("update", |ctx| engine.update(ctx, &req)).await?)
    }

    async fn restore_cluster_backup(&self, cluster: &Cluster, spec: &ClusterSpec) -> Result<ClusterInfo> {
        let snapshot_name = spec
            .rancher_kubernetes_engine_config
            .as_ref()
            .and_then(|r| r.restore.as_ref())
            .map(|r| r.snapshot_name.as_str())
            .unwrap_or_default();
        let snapshot = match snapshot_name.split_once(':') {
            Some((_, snapshot)) => snapshot,
            None => {
                return Err(ProvisionError::Validation(format!(
                    "invalid snapshot name {}",
                    snapshot_name
                )))
            }
        };
        let backup = self.backups.get(cluster.name(), snapshot).await?;
        if backup.spec.cluster_id != cluster.name() {
            return Err(ProvisionError::Validation(format!(
                "snapshot [{}] is not a backup of cluster [{}]",
                backup.metadata.name,
                cluster.name()
            )));
        }

        let engine = self.engine(spec).await?;
        let req = self.request(cluster.name(), spec).await?;
        Ok(self
            .engines
            .call("etcdRestore", |ctx| engine.etcd_restore(ctx, &req, snapshot))
            .await?)
    }

    async fn driver_remove_legacy_service_account(&self, spec: &ClusterSpec) -> Result<()> {
        let engine = self.engine(spec).await?;
        let req = self.request("", spec).await?;
        Ok(self
            .engines
            .call("removeLegacyServiceAccount", |ctx| engine.remove_legacy_service_account(ctx, &req))
            .await?)
    }

    async fn driver_remove(&self, cluster: &Cluster) -> Result<()> {
        let record = match self.kontainer_driver_for(&cluster.spec).await {
            Ok(record) => record,
            Err(ProvisionError::Store(e)) if e.is_not_found() => {
                warn!(cluster = %cluster.name(), "Could not find kontainer driver for cluster removal: {}", e);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let engine = self.engines.engine_for(&record)?;
        let req = self.request(cluster.name(), &cluster.spec).await?;
        Ok(self.engines.call("remove", |ctx| engine.remove(ctx, &req)).await?)
    }

    /// Tears the cluster down through its engine and returns the re-read record.
    pub async fn remove(&self, cluster: Cluster) -> Result<Option<Cluster>> {
        info!(cluster = %cluster.name(), "Deleting cluster");
        if cluster.is_passthrough() || cluster.status.driver.is_empty() {
            return Ok(Some(cluster));
        }

        for attempt in 0..REMOVE_ATTEMPTS {
            match self.driver_remove(&cluster).await {
                Ok(()) => break,
                Err(e) if attempt + 1 == REMOVE_ATTEMPTS => {
                    return Err(ProvisionError::Validation(format!(
                        "failed to remove the cluster [{}]: {}",
                        cluster.name(),
                        e
                    )));
                }
                Err(e) => {
                    debug!(cluster = %cluster.name(), attempt, "remove failed: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
        info!(cluster = %cluster.name(), "Deleted cluster");
        Ok(self.clusters.store().get_opt("", cluster.name()).await?)
    }
}

fn reset_one_shot_flags(cluster: &mut Cluster) {
    if let Some(rke) = cluster.spec.rancher_kubernetes_engine_config.as_mut() {
        rke.rotate_certificates = None;
        rke.restore = None;
        if let Some(applied) = cluster
            .status
            .applied_spec
            .as_mut()
            .and_then(|s| s.rancher_kubernetes_engine_config.as_mut())
        {
            applied.rotate_certificates = None;
            applied.restore = None;
        }
    }
}

#[async_trait]
impl Reconciler for Provisioner {
    type Error = ProvisionError;

    fn name(&self) -> &'static str {
        "cluster-provisioner-controller"
    }

    async fn reconcile(&self, key: &str) -> Result<Action> {
        let (_, name) = split_key(key);
        let Some(cluster) = self.clusters.store().get_opt("", name).await? else {
            self.backoff.delete(name);
            return Ok(Action::done());
        };

        if cluster.metadata.deletion_timestamp.is_some() {
            self.remove(cluster).await?;
            self.clusters.delete(name).await?;
            self.backoff.delete(name);
            return Ok(Action::done());
        }

        if cluster.status.applied_spec.is_none() {
            self.create(cluster).await
        } else {
            self.updated(cluster).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::cluster::{
        node_condition, node_role, Driver, EtcdBackupSpec, KontainerDriverSpec, KontainerDriverStatus, NodeSpec,
        RestoreConfig, RkeConfigNode, SystemImages,
    };
    use crate::models::{ObjectMeta, Setting};
    use crate::store::MemoryStore;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;
    use versions::VersionMetadata;

    #[derive(Default)]
    struct FakeEngine {
        calls: Mutex<Vec<String>>,
        fail_update: Mutex<Option<String>>,
        create_exists: bool,
        fail_remove: bool,
    }

    impl FakeEngine {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        fn record(&self, op: &str) {
            self.calls.lock().push(op.to_string());
        }

        fn info() -> ClusterInfo {
            ClusterInfo {
                api_endpoint: "https://10.0.0.1:6443".into(),
                service_account_token: "sa-token".into(),
                ca_cert: "Y2E=".into(),
            }
        }
    }

    #[async_trait]
    impl EngineDriver for FakeEngine {
        async fn create(&self, _ctx: CancellationToken, _req: &EngineRequest) -> std::result::Result<ClusterInfo, DriverError> {
            self.record("create");
            if self.create_exists {
                return Err(DriverError::AlreadyExists);
            }
            Ok(Self::info())
        }

        async fn update(&self, _ctx: CancellationToken, _req: &EngineRequest) -> std::result::Result<ClusterInfo, DriverError> {
            self.record("update");
            match self.fail_update.lock().clone() {
                Some(msg) => Err(DriverError::Failed(msg)),
                None => Ok(Self::info()),
            }
        }

        async fn remove(&self, _ctx: CancellationToken, _req: &EngineRequest) -> std::result::Result<(), DriverError> {
            self.record("remove");
            if self.fail_remove {
                return Err(DriverError::Failed("engine unavailable".into()));
            }
            Ok(())
        }

        async fn etcd_restore(
            &self,
            _ctx: CancellationToken,
            _req: &EngineRequest,
            snapshot: &str,
        ) -> std::result::Result<ClusterInfo, DriverError> {
            self.record(&format!("restore:{}", snapshot));
            Ok(Self::info())
        }

        async fn generate_service_account(&self, _ctx: CancellationToken, _req: &EngineRequest) -> std::result::Result<String, DriverError> {
            self.record("generateServiceAccount");
            Ok("new-sa-token".into())
        }

        async fn remove_legacy_service_account(&self, _ctx: CancellationToken, _req: &EngineRequest) -> std::result::Result<(), DriverError> {
            Ok(())
        }
    }

    struct Harness {
        provisioner: Provisioner,
        clusters: SharedStore<Cluster>,
        nodes: SharedStore<Node>,
        backups: SharedStore<EtcdBackup>,
        engine: Arc<FakeEngine>,
    }

    async fn harness(engine: FakeEngine) -> Harness {
        let clusters: SharedStore<Cluster> = Arc::new(MemoryStore::new());
        let nodes: SharedStore<Node> = Arc::new(MemoryStore::new());
        let backups: SharedStore<EtcdBackup> = Arc::new(MemoryStore::new());
        let drivers: SharedStore<KontainerDriver> = Arc::new(MemoryStore::new());
        let settings_store: SharedStore<Setting> = Arc::new(MemoryStore::new());
        let settings = Settings::new(settings_store);
        settings.set(KUBERNETES_VERSION, "v1.25.2").await.unwrap();

        for (name, id) in [
            (RKE_DRIVER_NAME, RKE_DRIVER_NAME),
            (driver_name::GOOGLE_GKE, driver_name::GOOGLE_GKE),
        ] {
            drivers
                .create(KontainerDriver {
                    metadata: ObjectMeta::named(name),
                    spec: KontainerDriverSpec {
                        driver: Driver::Builtin { id: id.into() },
                        active: true,
                        ui_url: String::new(),
                    },
                    status: KontainerDriverStatus {
                        display_name: name.into(),
                        ..Default::default()
                    },
                })
                .await
                .unwrap();
        }

        let mut metadata = VersionMetadata::default();
        for version in ["v1.24.9", "v1.25.2"] {
            let mut images = SystemImages::new();
            images.insert("kubernetes".into(), format!("rancher/hyperkube:{}", version));
            metadata.system_images.insert(version.into(), images);
        }

        let engine = Arc::new(engine);
        let engines = EngineService::new(Duration::from_secs(60), CancellationToken::new());
        engines.register(RKE_DRIVER_NAME, engine.clone());
        engines.register(driver_name::GOOGLE_GKE, engine.clone());

        let provisioner = Provisioner::new(
            ClusterRegistry::new(clusters.clone()),
            nodes.clone(),
            backups.clone(),
            drivers,
            settings,
            VersionCatalog::with_metadata(metadata),
            engines,
            FailureBackoff::new(Duration::from_secs(30), Duration::from_secs(600)),
        );
        Harness {
            provisioner,
            clusters,
            nodes,
            backups,
            engine,
        }
    }

    fn rke_cluster(name: &str, version: &str) -> Cluster {
        Cluster::new(
            name,
            ClusterSpec {
                display_name: name.into(),
                rancher_kubernetes_engine_config: Some(RkeConfig {
                    kubernetes_version: version.into(),
                    ..Default::default()
                }),
                ..Default::default()
            },
        )
    }

    async fn add_node(nodes: &SharedStore<Node>, cluster: &str, name: &str, roles: &[&str]) {
        let mut node = Node {
            metadata: ObjectMeta::namespaced(cluster, name),
            spec: NodeSpec {
                etcd: roles.contains(&node_role::ETCD),
                control_plane: roles.contains(&node_role::CONTROL_PLANE),
                worker: roles.contains(&node_role::WORKER),
                requested_hostname: name.into(),
                ..Default::default()
            },
            ..Default::default()
        };
        node.status.node_config = Some(RkeConfigNode {
            address: "10.0.0.10".into(),
            role: roles.iter().map(|r| r.to_string()).collect(),
            ..Default::default()
        });
        node.status.conditions.set_true(node_condition::PROVISIONED);
        nodes.create(node).await.unwrap();
    }

    #[tokio::test]
    async fn worker_only_cluster_is_forgotten() {
        let h = harness(FakeEngine::default()).await;
        h.clusters.create(rke_cluster("c-1", "v1.25.2")).await.unwrap();
        add_node(&h.nodes, "c-1", "w-1", &[node_role::WORKER]).await;
        add_node(&h.nodes, "c-1", "w-2", &[node_role::WORKER]).await;

        let err = h.provisioner.reconcile("c-1").await.unwrap_err();
        assert!(err.is_forget());
        assert_eq!(err.reason(), Some("Provisioning"));
        let after_first = h.clusters.get("", "c-1").await.unwrap();

        let err = h.provisioner.reconcile("c-1").await.unwrap_err();
        assert_eq!(err.reason(), Some("Provisioning"));
        let after_second = h.clusters.get("", "c-1").await.unwrap();
        assert_eq!(after_first.status.conditions, after_second.status.conditions);
        assert!(!after_second.status.conditions.is_false(condition::PROVISIONED));
        assert!(h.engine.calls().is_empty());
    }

    #[tokio::test]
    async fn provisions_once_and_skips_unchanged_spec() {
        let h = harness(FakeEngine::default()).await;
        h.clusters.create(rke_cluster("c-1", "v1.25.2")).await.unwrap();
        add_node(&h.nodes, "c-1", "cp", &[node_role::ETCD, node_role::CONTROL_PLANE]).await;
        add_node(&h.nodes, "c-1", "w", &[node_role::WORKER]).await;

        h.provisioner.reconcile("c-1").await.unwrap();
        let cluster = h.clusters.get("", "c-1").await.unwrap();
        assert_eq!(cluster.status.driver, driver_name::RKE);
        assert!(cluster.status.conditions.is_true(condition::PROVISIONED));
        assert!(cluster.status.conditions.is_true(condition::PENDING));
        assert_eq!(cluster.status.api_endpoint, "https://10.0.0.1:6443");
        let applied = cluster.status.applied_spec.unwrap();
        let applied_rke = applied.rancher_kubernetes_engine_config.unwrap();
        assert_eq!(applied_rke.nodes.len(), 2);
        assert_eq!(applied_rke.system_images["kubernetes"], "rancher/hyperkube:v1.25.2");
        assert_eq!(h.engine.calls(), vec!["create"]);

        h.provisioner.reconcile("c-1").await.unwrap();
        h.provisioner.reconcile("c-1").await.unwrap();
        assert_eq!(h.engine.calls(), vec!["create"]);
    }

    #[tokio::test]
    async fn empty_version_inherits_applied_spec() {
        let h = harness(FakeEngine::default()).await;
        h.clusters.create(rke_cluster("c-1", "v1.24.9")).await.unwrap();
        add_node(&h.nodes, "c-1", "cp", &[node_role::ETCD, node_role::CONTROL_PLANE]).await;
        h.provisioner.reconcile("c-1").await.unwrap();

        let mut cluster = h.clusters.get("", "c-1").await.unwrap();
        if let Some(rke) = cluster.spec.rancher_kubernetes_engine_config.as_mut() {
            rke.kubernetes_version.clear();
        }
        h.clusters.update(cluster).await.unwrap();

        h.provisioner.reconcile("c-1").await.unwrap();
        let cluster = h.clusters.get("", "c-1").await.unwrap();
        let applied = cluster.status.applied_spec.unwrap().rancher_kubernetes_engine_config.unwrap();
        assert_eq!(applied.kubernetes_version, "v1.24.9");
        assert_eq!(h.engine.calls(), vec!["create"]);
    }

    #[tokio::test]
    async fn driver_change_is_refused() {
        let h = harness(FakeEngine::default()).await;
        let mut cluster = rke_cluster("c-1", "v1.25.2");
        cluster.status.driver = driver_name::GOOGLE_GKE.into();
        cluster.status.set_applied_spec(ClusterSpec::default());
        h.clusters.create(cluster).await.unwrap();

        let err = h.provisioner.reconcile("c-1").await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "driver change from googlekubernetesengine to rke not allowed"
        );
        let cluster = h.clusters.get("", "c-1").await.unwrap();
        assert_eq!(cluster.status.driver, driver_name::GOOGLE_GKE);
        assert!(h.engine.calls().is_empty());
    }

    #[tokio::test]
    async fn existing_cluster_falls_through_to_update() {
        let h = harness(FakeEngine {
            create_exists: true,
            ..Default::default()
        })
        .await;
        h.clusters.create(rke_cluster("c-1", "v1.25.2")).await.unwrap();
        add_node(&h.nodes, "c-1", "cp", &[node_role::ETCD, node_role::CONTROL_PLANE]).await;

        h.provisioner.reconcile("c-1").await.unwrap();
        assert_eq!(h.engine.calls(), vec!["create", "update"]);
        assert!(h
            .clusters
            .get("", "c-1")
            .await
            .unwrap()
            .status
            .conditions
            .is_true(condition::PROVISIONED));
    }

    #[tokio::test]
    async fn failed_spec_backs_off() {
        let h = harness(FakeEngine::default()).await;
        h.clusters.create(rke_cluster("c-1", "v1.25.2")).await.unwrap();
        add_node(&h.nodes, "c-1", "cp", &[node_role::ETCD, node_role::CONTROL_PLANE]).await;
        h.provisioner.reconcile("c-1").await.unwrap();

        *h.engine.fail_update.lock() = Some("etcd unhealthy".into());
        ClusterRegistry::new(h.clusters.clone())
            .mutate("c-1", |c| {
                if let Some(rke) = c.spec.rancher_kubernetes_engine_config.as_mut() {
                    rke.kubernetes_version = "v1.24.9".into();
                }
            })
            .await
            .unwrap();
        let action = h.provisioner.reconcile("c-1").await.unwrap();
        assert_eq!(action.requeue_after(), Some(Duration::from_secs(30)));
        let cluster = h.clusters.get("", "c-1").await.unwrap();
        assert!(cluster.status.failed_spec.is_some());

        let err = h.provisioner.reconcile("c-1").await.unwrap_err();
        assert!(err.is_forget());
        assert!(err.requeue_after().is_some());
        assert_eq!(h.engine.calls(), vec!["create", "update"]);
    }

    #[tokio::test]
    async fn restore_requires_matching_backup() {
        let h = harness(FakeEngine::default()).await;
        h.clusters.create(rke_cluster("c-1", "v1.25.2")).await.unwrap();
        add_node(&h.nodes, "c-1", "cp", &[node_role::ETCD, node_role::CONTROL_PLANE]).await;
        h.provisioner.reconcile("c-1").await.unwrap();

        h.backups
            .create(EtcdBackup {
                metadata: ObjectMeta::namespaced("c-1", "b-1"),
                spec: EtcdBackupSpec {
                    cluster_id: "c-other".into(),
                    ..Default::default()
                },
                ..Default::default()
            })
            .await
            .unwrap();
        h.backups
            .create(EtcdBackup {
                metadata: ObjectMeta::namespaced("c-1", "b-2"),
                spec: EtcdBackupSpec {
                    cluster_id: "c-1".into(),
                    ..Default::default()
                },
                ..Default::default()
            })
            .await
            .unwrap();

        let request_restore = |snapshot: &str| {
            let snapshot = snapshot.to_string();
            move |c: &mut Cluster| {
                if let Some(rke) = c.spec.rancher_kubernetes_engine_config.as_mut() {
                    rke.restore = Some(RestoreConfig {
                        restore: true,
                        snapshot_name: snapshot.clone(),
                    });
                }
            }
        };
        let registry = ClusterRegistry::new(h.clusters.clone());
        registry.mutate("c-1", request_restore("c-1:b-1")).await.unwrap();
        let err = h.provisioner.reconcile("c-1").await.unwrap_err();
        assert_eq!(err.to_string(), "snapshot [b-1] is not a backup of cluster [c-1]");

        registry.mutate("c-1", request_restore("c-1:b-2")).await.unwrap();
        h.provisioner.reconcile("c-1").await.unwrap();
        assert_eq!(h.engine.calls(), vec!["create", "restore:b-2"]);
        let cluster = h.clusters.get("", "c-1").await.unwrap();
        assert!(cluster.spec.rancher_kubernetes_engine_config.unwrap().restore.is_none());
    }

    #[tokio::test]
    async fn legacy_hosted_config_migrates_to_generic() {
        let h = harness(FakeEngine::default()).await;
        let mut cluster = Cluster::new("c-gke", ClusterSpec::default());
        cluster.spec.google_kubernetes_engine_config = Some(serde_json::json!({"zone": "us-central1-a"}));
        h.clusters.create(cluster).await.unwrap();

        h.provisioner.reconcile("c-gke").await.unwrap();
        let cluster = h.clusters.get("", "c-gke").await.unwrap();
        assert_eq!(cluster.status.driver, driver_name::GOOGLE_GKE);
        let applied = cluster.status.applied_spec.unwrap();
        assert_eq!(
            applied.generic_engine_config.unwrap()[DRIVER_NAME_FIELD],
            driver_name::GOOGLE_GKE
        );
        assert_eq!(h.engine.calls(), vec!["create"]);
    }

    #[tokio::test(start_paused = true)]
    async fn remove_retries_then_fails() {
        let h = harness(FakeEngine {
            fail_remove: true,
            ..Default::default()
        })
        .await;
        let mut cluster = rke_cluster("c-1", "v1.25.2");
        cluster.status.driver = driver_name::RKE.into();
        let err = h.provisioner.remove(cluster).await.unwrap_err();
        assert!(err.to_string().starts_with("failed to remove the cluster [c-1]"));
        assert_eq!(h.engine.calls().len(), 4);

        let mut imported = Cluster::new("c-imp", ClusterSpec::default());
        imported.status.driver = driver_name::IMPORTED.into();
        assert!(h.provisioner.remove(imported).await.unwrap().is_some());
        assert_eq!(h.engine.calls().len(), 4);
    }
}
