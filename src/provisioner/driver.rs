use async_trait::async_trait;
use metrics::counter;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::external::ExternalDriver;
use super::nodes::without_worker_only;
use crate::models::cluster::{ClusterSpec, Driver, Flag, FlagKind, GenericEngineConfig, KontainerDriver};

pub const DRIVER_NAME_FIELD: &str = "driverName";
pub const RKE_DRIVER_NAME: &str = "rancherkubernetesengine";
pub const IMPORT_DRIVER_NAME: &str = "import";
pub const RKE_CONFIG_OPTION: &str = "rkeConfig";

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("cluster already exists")]
    AlreadyExists,

    #[error("no engine registered for driver {0}")]
    NotRegistered(String),

    #[error("driver call timed out after {0:?}")]
    Timeout(Duration),

    #[error("driver call cancelled")]
    Cancelled,

    #[error("{0}")]
    Failed(String),
}

/// Connection details reported by an engine after create, update, or restore.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterInfo {
    #[serde(default)]
    pub api_endpoint: String,
    #[serde(default)]
    pub service_account_token: String,
    #[serde(default)]
    pub ca_cert: String,
}

/// Engine configuration flattened into typed option maps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverOptions {
    #[serde(default)]
    pub string_options: BTreeMap<String, String>,
    #[serde(default)]
    pub int_options: BTreeMap<String, i64>,
    #[serde(default)]
    pub bool_options: BTreeMap<String, bool>,
    #[serde(default)]
    pub string_slice_options: BTreeMap<String, Vec<String>>,
}

/// Everything an engine needs for one call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineRequest {
    pub name: String,
    #[serde(skip)]
    pub spec: ClusterSpec,
    pub options: DriverOptions,
}

#[async_trait]
pub trait EngineDriver: Send + Sync {
    async fn create(&self, ctx: CancellationToken, req: &EngineRequest) -> Result<ClusterInfo, DriverError>;

    async fn update(&self, ctx: CancellationToken, req: &EngineRequest) -> Result<ClusterInfo, DriverError>;

    async fn remove(&self, ctx: CancellationToken, req: &EngineRequest) -> Result<(), DriverError>;

    async fn etcd_restore(
        &self,
        ctx: CancellationToken,
        req: &EngineRequest,
        snapshot: &str,
    ) -> Result<ClusterInfo, DriverError>;

    async fn generate_service_account(&self, ctx: CancellationToken, req: &EngineRequest) -> Result<String, DriverError>;

    async fn remove_legacy_service_account(&self, ctx: CancellationToken, req: &EngineRequest) -> Result<(), DriverError>;
}

/// Dispatches engine calls to builtin engines or external driver binaries,
/// each under a deadline and the process shutdown token.
#[derive(Clone)]
pub struct EngineService {
    builtin: Arc<RwLock<HashMap<String, Arc<dyn EngineDriver>>>>,
    timeout: Duration,
    shutdown: CancellationToken,
}

impl EngineService {
    pub fn new(timeout: Duration, shutdown: CancellationToken) -> Self {
        Self {
            builtin: Arc::new(RwLock::new(HashMap::new())),
            timeout,
            shutdown,
        }
    }

    pub fn register(&self, id: &str, engine: Arc<dyn EngineDriver>) {
        self.builtin.write().insert(id.to_string(), engine);
    }

    pub fn engine_for(&self, driver: &KontainerDriver) -> Result<Arc<dyn EngineDriver>, DriverError> {
        match &driver.spec.driver {
            Driver::Builtin { id } => self
                .builtin
                .read()
                .get(id)
                .cloned()
                .ok_or_else(|| DriverError::NotRegistered(id.clone())),
            Driver::External { .. } => {
                if driver.status.executable_path.is_empty() {
                    return Err(DriverError::NotRegistered(driver.metadata.name.clone()));
                }
                Ok(Arc::new(ExternalDriver::new(&driver.status.executable_path)))
            }
        }
    }

    /// Runs one engine call with a child cancellation token and the deadline.
    pub async fn call<T, F, Fut>(&self, op: &'static str, f: F) -> Result<T, DriverError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, DriverError>>,
    {
        counter!("provisioner_driver_calls_total", "op" => op).increment(1);
        let ctx = self.shutdown.child_token();
        let fut = f(ctx.clone());
        let result = tokio::select! {
            _ = ctx.cancelled() => Err(DriverError::Cancelled),
            r = tokio::time::timeout(self.timeout, fut) => match r {
                Ok(r) => r,
                Err(_) => Err(DriverError::Timeout(self.timeout)),
            },
        };
        ctx.cancel();
        result
    }
}

/// Driver options for a spec: the RKE config as one serialized option, or
/// the generic config flattened using the driver's declared flags.
pub fn driver_options(spec: &ClusterSpec, flags: &[Flag]) -> DriverOptions {
    let mut options = DriverOptions::default();
    if let Some(config) = &spec.generic_engine_config {
        flatten_into(&mut options, config, flags);
    } else if let Some(rke) = &spec.rancher_kubernetes_engine_config {
        let encoded = serde_json::to_string(rke).unwrap_or_default();
        options.string_options.insert(RKE_CONFIG_OPTION.to_string(), encoded);
    }
    options
}

fn flatten_into(options: &mut DriverOptions, config: &Map<String, Value>, flags: &[Flag]) {
    for (key, value) in config {
        if let Value::Object(nested) = value {
            if key == "labels" {
                let labels = nested
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, value_string(v)))
                    .collect();
                options.string_slice_options.insert(key.clone(), labels);
            } else {
                flatten_into(options, nested, flags);
            }
            continue;
        }

        let declared = flags.iter().find(|f| f.name == *key).map(|f| f.kind);
        let kind = declared.unwrap_or(match value {
            Value::Number(_) => FlagKind::Int,
            Value::Bool(_) => FlagKind::Bool,
            Value::Array(_) => FlagKind::StringSlice,
            _ => FlagKind::String,
        });
        match kind {
            FlagKind::Int => {
                let n = value
                    .as_i64()
                    .or_else(|| value.as_f64().map(|f| f as i64))
                    .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
                    .unwrap_or_default();
                options.int_options.insert(key.clone(), n);
            }
            FlagKind::Bool => {
                let b = value
                    .as_bool()
                    .or_else(|| value.as_str().map(|s| s.eq_ignore_ascii_case("true")))
                    .unwrap_or_default();
                options.bool_options.insert(key.clone(), b);
            }
            FlagKind::StringSlice => {
                let items = match value {
                    Value::Array(items) => items.iter().map(value_string).collect(),
                    Value::Null => Vec::new(),
                    other => vec![value_string(other)],
                };
                options.string_slice_options.insert(key.clone(), items);
            }
            FlagKind::String | FlagKind::Password => {
                options.string_options.insert(key.clone(), value_string(value));
            }
        }
    }
}

fn value_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Removes password-typed fields from the generic engine config. A config
/// without a driver name cannot be censored and is dropped entirely.
pub fn censor_generic_config(mut spec: ClusterSpec, flags: &[Flag]) -> ClusterSpec {
    let Some(config) = spec.generic_engine_config.take() else {
        return spec;
    };
    if !config.get(DRIVER_NAME_FIELD).map_or(false, Value::is_string) {
        warn!(
            "cluster {} has a generic engine config but no driver type field; removing the entire config",
            spec.display_name
        );
        return spec;
    }
    let censored: GenericEngineConfig = config
        .into_iter()
        .filter(|(key, _)| {
            !flags
                .iter()
                .any(|f| f.name == *key && f.kind == FlagKind::Password)
        })
        .collect();
    spec.generic_engine_config = Some(censored);
    spec
}

/// The spec handed to engines: worker-only nodes removed from RKE configs.
pub fn clean_rke(spec: &ClusterSpec) -> ClusterSpec {
    let mut spec = spec.clone();
    if let Some(rke) = spec.rancher_kubernetes_engine_config.as_mut() {
        rke.nodes = without_worker_only(&rke.nodes);
    }
    spec
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::cluster::{KontainerDriverSpec, KontainerDriverStatus, RkeConfig, RkeConfigNode};
    use crate::models::ObjectMeta;
    use serde_json::json;

    fn flag(name: &str, kind: FlagKind) -> Flag {
        Flag {
            name: name.into(),
            kind,
            default: None,
            usage: String::new(),
        }
    }

    fn generic(config: Value) -> ClusterSpec {
        ClusterSpec {
            generic_engine_config: config.as_object().cloned(),
            ..Default::default()
        }
    }

    #[test]
    fn generic_config_is_flattened_by_kind() {
        let spec = generic(json!({
            "driverName": "example",
            "nodeCount": 3,
            "enableAlpha": true,
            "zones": ["a", "b"],
            "diskSize": "50",
            "labels": {"team": "infra"},
            "network": {"subnet": "10.0.0.0/16"}
        }));
        let options = driver_options(&spec, &[flag("diskSize", FlagKind::Int)]);
        assert_eq!(options.int_options["nodeCount"], 3);
        assert_eq!(options.int_options["diskSize"], 50);
        assert!(options.bool_options["enableAlpha"]);
        assert_eq!(options.string_slice_options["zones"], vec!["a", "b"]);
        assert_eq!(options.string_slice_options["labels"], vec!["team=infra"]);
        assert_eq!(options.string_options["subnet"], "10.0.0.0/16");
        assert_eq!(options.string_options["driverName"], "example");
    }

    #[test]
    fn password_fields_are_censored() {
        let spec = generic(json!({"driverName": "example", "secretKey": "s3cr3t", "region": "eu"}));
        let censored = censor_generic_config(spec, &[flag("secretKey", FlagKind::Password)]);
        let config = censored.generic_engine_config.unwrap();
        assert!(config.get("secretKey").is_none());
        assert_eq!(config["region"], "eu");

        let nameless = censor_generic_config(generic(json!({"secretKey": "s3cr3t"})), &[]);
        assert!(nameless.generic_engine_config.is_none());
    }

    #[test]
    fn worker_only_nodes_are_not_sent() {
        let spec = ClusterSpec {
            rancher_kubernetes_engine_config: Some(RkeConfig {
                nodes: vec![
                    RkeConfigNode {
                        node_name: "w".into(),
                        role: vec!["worker".into()],
                        ..Default::default()
                    },
                    RkeConfigNode {
                        node_name: "all".into(),
                        role: vec!["etcd".into(), "worker".into()],
                        ..Default::default()
                    },
                ],
                ..Default::default()
            }),
            ..Default::default()
        };
        let cleaned = clean_rke(&spec);
        let nodes = &cleaned.rancher_kubernetes_engine_config.unwrap().nodes;
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].node_name, "all");
        assert!(driver_options(&spec, &[]).string_options.contains_key(RKE_CONFIG_OPTION));
    }

    struct Slow;

    #[async_trait]
    impl EngineDriver for Slow {
        async fn create(&self, ctx: CancellationToken, _req: &EngineRequest) -> Result<ClusterInfo, DriverError> {
            ctx.cancelled().await;
            Err(DriverError::Cancelled)
        }
        async fn update(&self, _ctx: CancellationToken, _req: &EngineRequest) -> Result<ClusterInfo, DriverError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(ClusterInfo::default())
        }
        async fn remove(&self, _ctx: CancellationToken, _req: &EngineRequest) -> Result<(), DriverError> {
            Ok(())
        }
        async fn etcd_restore(
            &self,
            _ctx: CancellationToken,
            _req: &EngineRequest,
            _snapshot: &str,
        ) -> Result<ClusterInfo, DriverError> {
            Ok(ClusterInfo::default())
        }
        async fn generate_service_account(&self, _ctx: CancellationToken, _req: &EngineRequest) -> Result<String, DriverError> {
            Ok(String::new())
        }
        async fn remove_legacy_service_account(&self, _ctx: CancellationToken, _req: &EngineRequest) -> Result<(), DriverError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn calls_are_bounded_by_deadline_and_shutdown() {
        let shutdown = CancellationToken::new();
        let service = EngineService::new(Duration::from_secs(60), shutdown.clone());
        service.register("slow", Arc::new(Slow));
        let record = KontainerDriver {
            metadata: ObjectMeta::named("slow"),
            spec: KontainerDriverSpec {
                driver: Driver::Builtin { id: "slow".into() },
                active: true,
                ui_url: String::new(),
            },
            status: KontainerDriverStatus::default(),
        };
        let engine = service.engine_for(&record).unwrap();
        let req = EngineRequest {
            name: "c-1".into(),
            spec: ClusterSpec::default(),
            options: DriverOptions::default(),
        };

        let timed_out = service.call("update", |ctx| engine.update(ctx, &req)).await;
        assert!(matches!(timed_out, Err(DriverError::Timeout(_))));

        shutdown.cancel();
        let cancelled = service.call("create", |ctx| engine.create(ctx, &req)).await;
        assert!(matches!(cancelled, Err(DriverError::Cancelled)));

        let missing = KontainerDriver {
            spec: KontainerDriverSpec {
                driver: Driver::Builtin { id: "nope".into() },
                active: true,
                ui_url: String::new(),
            },
            ..record
        };
        assert!(service.engine_for(&missing).is_err());
    }
}
