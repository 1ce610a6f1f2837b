// Persisted record types

pub mod auth;
pub mod catalog;
pub mod cluster;
pub mod meta;
pub mod rbac;

use serde::{Deserialize, Serialize};

pub use meta::{Condition, ConditionStatus, Conditions, ObjectMeta};

/// Runtime setting such as `server-url` or `ca-certs`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Setting {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub default: String,
}

impl Setting {
    pub fn effective(&self) -> &str {
        if self.value.is_empty() {
            &self.default
        } else {
            &self.value
        }
    }
}

crate::impl_record!(Setting, "setting");
crate::impl_record!(cluster::Cluster, "cluster");
crate::impl_record!(cluster::Node, "node");
crate::impl_record!(cluster::EtcdBackup, "etcdbackup");
crate::impl_record!(cluster::KontainerDriver, "kontainerdriver");
crate::impl_record!(cluster::ClusterRegistrationToken, "clusterregistrationtoken");
crate::impl_record!(auth::Token, "token");
crate::impl_record!(auth::User, "user");
crate::impl_record!(auth::UserAttribute, "userattribute");
crate::impl_record!(auth::GlobalRoleBinding, "globalrolebinding");
crate::impl_record!(auth::AuthConfig, "authconfig");
crate::impl_record!(catalog::Catalog, "catalog");
crate::impl_record!(catalog::Template, "template");
crate::impl_record!(catalog::TemplateVersion, "templateversion");
crate::impl_record!(rbac::RoleTemplate, "roletemplate");
crate::impl_record!(rbac::GlobalRole, "globalrole");
crate::impl_record!(rbac::ClusterRoleTemplateBinding, "clusterroletemplatebinding");
crate::impl_record!(rbac::ProjectRoleTemplateBinding, "projectroletemplatebinding");
crate::impl_record!(rbac::Project, "project");
