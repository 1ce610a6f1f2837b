// Cluster, node, and engine-driver records

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use super::meta::{Conditions, ObjectMeta};

pub mod condition {
    pub const PENDING: &str = "Pending";
    pub const PROVISIONED: &str = "Provisioned";
    pub const UPDATED: &str = "Updated";
    pub const WAITING: &str = "Waiting";
    pub const SERVICE_ACCOUNT_MIGRATED: &str = "ServiceAccountMigrated";
    pub const AGENT_DEPLOYED: &str = "AgentDeployed";
    pub const READY: &str = "Ready";
}

/// Values stored in `ClusterStatus::driver`.
pub mod driver {
    pub const RKE: &str = "rke";
    pub const IMPORTED: &str = "imported";
    pub const LOCAL: &str = "local";
    pub const AMAZON_EKS: &str = "amazonelasticcontainerservice";
    pub const AZURE_AKS: &str = "azurekubernetesservice";
    pub const GOOGLE_GKE: &str = "googlekubernetesengine";
}

pub type GenericEngineConfig = Map<String, Value>;
pub type SystemImages = BTreeMap<String, String>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: ClusterSpec,
    #[serde(default)]
    pub status: ClusterStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    #[serde(default)]
    pub display_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Set on the cluster hosting the management plane itself.
    #[serde(default)]
    pub internal: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rancher_kubernetes_engine_config: Option<RkeConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generic_engine_config: Option<GenericEngineConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imported_config: Option<ImportedConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amazon_elastic_container_service_config: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azure_kubernetes_service_config: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub google_kubernetes_engine_config: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportedConfig {
    #[serde(default)]
    pub kube_config: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RkeConfig {
    #[serde(default)]
    pub kubernetes_version: String,
    #[serde(default)]
    pub nodes: Vec<RkeConfigNode>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub system_images: SystemImages,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub private_registries: Vec<PrivateRegistry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore: Option<RestoreConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotate_certificates: Option<RotateCertificates>,
    /// Remaining engine options passed through to the driver untouched.
    #[serde(flatten)]
    pub options: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RkeConfigNode {
    #[serde(default)]
    pub node_name: String,
    #[serde(default)]
    pub address: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub internal_address: String,
    #[serde(default)]
    pub port: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub role: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hostname_override: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ssh_key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub docker_socket: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl RkeConfigNode {
    pub fn has_role(&self, role: &str) -> bool {
        self.role.iter().any(|r| r == role)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivateRegistry {
    pub url: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub is_default: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreConfig {
    #[serde(default)]
    pub restore: bool,
    #[serde(default)]
    pub snapshot_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RotateCertificates {
    #[serde(default)]
    pub ca_certificates: bool,
    #[serde(default)]
    pub services: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    #[serde(default)]
    pub driver: String,
    #[serde(default)]
    pub conditions: Conditions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_spec: Option<ClusterSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_spec: Option<ClusterSpec>,
    #[serde(default)]
    pub api_endpoint: String,
    #[serde(default)]
    pub service_account_token: String,
    /// Base64 encoded PEM bundle.
    #[serde(default)]
    pub ca_cert: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<VersionInfo>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub agent_image: String,
}

impl ClusterStatus {
    /// Stores the converged spec; a cluster with an applied spec is provisioned.
    pub fn set_applied_spec(&mut self, spec: ClusterSpec) {
        self.applied_spec = Some(spec);
        self.conditions.set_true(condition::PROVISIONED);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    pub git_version: String,
}

impl Cluster {
    pub fn new(name: &str, spec: ClusterSpec) -> Self {
        Self {
            metadata: ObjectMeta::named(name),
            spec,
            status: ClusterStatus::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn is_passthrough(&self) -> bool {
        self.status.driver == driver::LOCAL || self.status.driver == driver::IMPORTED
    }
}

pub mod node_role {
    pub const ETCD: &str = "etcd";
    pub const CONTROL_PLANE: &str = "controlplane";
    pub const WORKER: &str = "worker";
}

pub mod node_condition {
    pub const PROVISIONED: &str = "Provisioned";
    pub const REGISTERED: &str = "Registered";
    pub const CONFIG_SAVED: &str = "ConfigSaved";
    pub const READY: &str = "Ready";
}

/// A machine belonging to a cluster. The namespace is the owning cluster's name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: NodeSpec,
    #[serde(default)]
    pub status: NodeStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSpec {
    #[serde(default)]
    pub etcd: bool,
    #[serde(default)]
    pub control_plane: bool,
    #[serde(default)]
    pub worker: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_template_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_config: Option<CustomConfig>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub requested_hostname: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomConfig {
    pub address: String,
    #[serde(default)]
    pub internal_address: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub ssh_key: String,
    #[serde(default)]
    pub docker_socket: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    #[serde(default)]
    pub conditions: Conditions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_config: Option<RkeConfigNode>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub node_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub internal_ip: String,
    #[serde(default)]
    pub ready: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub os: String,
}

impl Node {
    pub fn cluster_name(&self) -> &str {
        &self.metadata.namespace
    }

    pub fn is_windows(&self) -> bool {
        self.status.os.eq_ignore_ascii_case("windows")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EtcdBackup {
    pub metadata: ObjectMeta,
    pub spec: EtcdBackupSpec,
    #[serde(default)]
    pub status: EtcdBackupStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EtcdBackupSpec {
    pub cluster_id: String,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub manual: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EtcdBackupStatus {
    #[serde(default)]
    pub conditions: Conditions,
}

/// Engine driver registration: a compiled-in driver or a downloadable binary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Driver {
    Builtin {
        id: String,
    },
    External {
        url: String,
        #[serde(default)]
        checksum: String,
        #[serde(default)]
        flags: Vec<Flag>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FlagKind {
    String,
    Int,
    Bool,
    StringSlice,
    Password,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flag {
    pub name: String,
    pub kind: FlagKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default)]
    pub usage: String,
}

pub mod kontainer_condition {
    pub const DOWNLOADED: &str = "Downloaded";
    pub const INSTALLED: &str = "Installed";
    pub const ACTIVE: &str = "Active";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KontainerDriver {
    pub metadata: ObjectMeta,
    pub spec: KontainerDriverSpec,
    #[serde(default)]
    pub status: KontainerDriverStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KontainerDriverSpec {
    pub driver: Driver,
    #[serde(default)]
    pub active: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ui_url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KontainerDriverStatus {
    #[serde(default)]
    pub display_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub actual_url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub executable_path: String,
    #[serde(default)]
    pub conditions: Conditions,
}

impl KontainerDriver {
    pub fn is_builtin(&self) -> bool {
        matches!(self.spec.driver, Driver::Builtin { .. })
    }

    /// Schema name of the engine config carried in `genericEngineConfig`.
    pub fn config_schema_name(&self) -> String {
        let suffix = if self.is_builtin() { "Config" } else { "EngineConfig" };
        format!("{}{}", self.status.display_name, suffix).to_lowercase()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRegistrationToken {
    pub metadata: ObjectMeta,
    pub spec: ClusterRegistrationTokenSpec,
    #[serde(default)]
    pub status: ClusterRegistrationTokenStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRegistrationTokenSpec {
    pub cluster_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRegistrationTokenStatus {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub insecure_command: String,
    #[serde(default)]
    pub node_command: String,
    #[serde(default)]
    pub windows_node_command: String,
    #[serde(default)]
    pub manifest_url: String,
}
