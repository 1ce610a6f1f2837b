use serde::{Deserialize, Serialize};

use super::meta::ObjectMeta;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRule {
    #[serde(default)]
    pub verbs: Vec<String>,
    #[serde(default)]
    pub api_groups: Vec<String>,
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_names: Vec<String>,
}

impl PolicyRule {
    pub fn new(verbs: &[&str], api_groups: &[&str], resources: &[&str]) -> Self {
        let owned = |v: &[&str]| v.iter().map(|s| s.to_string()).collect();
        Self {
            verbs: owned(verbs),
            api_groups: owned(api_groups),
            resources: owned(resources),
            resource_names: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleTemplate {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub display_name: String,
    /// `cluster` or `project`.
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
    /// Parent templates whose rules this one inherits.
    #[serde(default)]
    pub role_template_names: Vec<String>,
    #[serde(default)]
    pub builtin: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalRole {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
    #[serde(default)]
    pub new_user_default: bool,
}

/// Binding of a subject to a role template in a cluster. Namespace is the cluster name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRoleTemplateBinding {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub user_principal_name: String,
    #[serde(default)]
    pub group_name: String,
    #[serde(default)]
    pub group_principal_name: String,
    pub role_template_name: String,
    pub cluster_name: String,
}

/// Binding of a subject to a role template in a project. Namespace is the project name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectRoleTemplateBinding {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub user_principal_name: String,
    #[serde(default)]
    pub group_name: String,
    #[serde(default)]
    pub group_principal_name: String,
    #[serde(default)]
    pub service_account: String,
    pub role_template_name: String,
    /// `<cluster>:<project>`
    pub project_name: String,
}

/// A project groups namespaces of one cluster. Namespace is the cluster name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub display_name: String,
    pub cluster_name: String,
    #[serde(default)]
    pub namespaces: Vec<String>,
}
