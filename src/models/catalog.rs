use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use super::meta::{Conditions, ObjectMeta};

pub const KIND_HELM_GIT: &str = "helm:git";
pub const KIND_HELM_HTTP: &str = "helm:http";

pub mod condition {
    pub const REFRESHED: &str = "Refreshed";
    pub const UPGRADED: &str = "Upgraded";
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Catalog {
    pub metadata: ObjectMeta,
    pub spec: CatalogSpec,
    #[serde(default)]
    pub status: CatalogStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogSpec {
    pub url: String,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// `helm:git`, `helm:http`, or empty to detect.
    #[serde(default)]
    pub catalog_kind: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub scope: CatalogScope,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CatalogScope {
    #[default]
    Global,
    #[serde(rename_all = "camelCase")]
    Cluster { cluster_id: String },
    /// `project_id` has the form `<cluster>:<project>`.
    #[serde(rename_all = "camelCase")]
    Project { project_id: String },
}

/// chart name -> (version -> content digest)
pub type HelmVersionCommits = BTreeMap<String, BTreeMap<String, String>>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogStatus {
    #[serde(default)]
    pub commit: String,
    #[serde(default)]
    pub helm_version_commits: HelmVersionCommits,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_refresh_timestamp: Option<String>,
    #[serde(default)]
    pub conditions: Conditions,
}

impl Catalog {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    pub metadata: ObjectMeta,
    pub spec: TemplateSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateSpec {
    #[serde(default)]
    pub display_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub catalog_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster_catalog_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub project_catalog_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub project_id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub default_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub project_url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub icon: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub icon_filename: String,
    #[serde(default)]
    pub folder_name: String,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub versions: Vec<TemplateVersionSummary>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateVersionSummary {
    pub version: String,
    #[serde(default)]
    pub external_id: String,
    #[serde(default)]
    pub digest: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub upgrade_version_links: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateVersion {
    pub metadata: ObjectMeta,
    pub spec: TemplateVersionSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateVersionSpec {
    pub version: String,
    #[serde(default)]
    pub external_id: String,
    #[serde(default)]
    pub digest: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub rancher_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub required_namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kube_version: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub upgrade_version_links: BTreeMap<String, String>,
    #[serde(default)]
    pub files: BTreeMap<String, String>,
    #[serde(default)]
    pub questions: Vec<Question>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub readme: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub app_readme: String,
}

/// A chart input prompt from `questions.yaml`; unknown keys are preserved.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Question {
    pub variable: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub label: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, rename = "type", skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub default: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}
