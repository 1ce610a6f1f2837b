// Projection of role template bindings onto Kubernetes RBAC objects

use k8s_openapi::api::rbac::v1::{
    ClusterRole, ClusterRoleBinding, PolicyRule as KubePolicyRule, Role, RoleBinding, RoleRef, Subject,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta as KubeMeta, OwnerReference};
use kube::ResourceExt;
use metrics::counter;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::auth::users::UserManager;
use crate::auth::{generate_name, AuthError};
use crate::controller::ErrorClass;
use crate::models::auth::User;
use crate::models::cluster::Cluster;
use crate::models::rbac::{ClusterRoleTemplateBinding, Project, ProjectRoleTemplateBinding};
use crate::models::ObjectMeta;
use crate::store::{retry_on_conflict, Backoff, Record, Retryable, SharedStore, StoreError, Stores};

pub mod crtb;
pub mod index;
pub mod prtb;
pub mod roles;
pub mod target;

pub use crtb::CrtbHandler;
pub use prtb::PrtbHandler;
pub use roles::RoleResolver;
pub use target::{KubeTarget, Labels, MemoryTarget, RbacTarget};

use index::{crb_by_role_and_subject, rb_by_owner, role_subject_key};

pub const MEMBERSHIP_BINDING_OWNER: &str = "membership-binding-owner";
pub const CRTB_IN_PROJECT_BINDING_OWNER: &str = "crtb-in-project-binding-owner";
pub const PRTB_IN_CLUSTER_BINDING_OWNER: &str = "prtb-in-cluster-binding-owner";
pub const RTB_LABEL_UPDATED: &str = "auth.management.cattle.io/rtb-label-updated";
pub const RTB_CRB_RB_LABELS_UPDATED: &str = "auth.management.cattle.io/crb-rb-labels-updated";
pub const PRINCIPAL_DISPLAY_NAME_ANNOTATION: &str = "auth.cattle.io/principal-display-name";

const OWNER_VALUES: &[&str] = &[MEMBERSHIP_BINDING_OWNER, PRTB_IN_CLUSTER_BINDING_OWNER];
const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";
const MANAGEMENT_API_VERSION: &str = "management.cattle.io/v3";

#[derive(Debug, Error)]
pub enum RbacError {
    #[error("Binding {0} has no subject")]
    NoSubject(String),

    #[error("service account {0} is not of the form <namespace>:<name>")]
    InvalidServiceAccount(String),

    #[error("cannot create binding because cluster {0} was not found")]
    ClusterNotFound(String),

    #[error("project {0} not found")]
    ProjectNotFound(String),

    #[error("invalid project name {0}, expected <cluster>:<project>")]
    InvalidProject(String),

    #[error("role template {0} not found")]
    RoleTemplateNotFound(String),

    #[error("user {0} not found")]
    UserNotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("conflict updating {0}")]
    Conflict(String),

    #[error("failed to relabel bindings: {}", .0.join("; "))]
    Relabel(Vec<String>),

    #[error(transparent)]
    Kube(#[from] kube::Error),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, RbacError>;

impl Retryable for RbacError {
    fn is_conflict(&self) -> bool {
        match self {
            RbacError::Conflict(_) => true,
            RbacError::Store(e) => e.is_conflict(),
            _ => false,
        }
    }
}

impl ErrorClass for RbacError {
    fn is_forget(&self) -> bool {
        false
    }
}

/// Label key identifying a binding record on the objects projected from it.
pub fn binding_label_key(meta: &ObjectMeta) -> String {
    format!("{}_{}", meta.namespace, meta.name)
}

/// Identity fields shared by cluster and project role template bindings.
pub trait RoleTemplateBinding: Record {
    const OWNER_KIND: &'static str;

    fn user_name(&self) -> &str;
    fn user_principal_name(&self) -> &str;
    fn group_name(&self) -> &str;
    fn group_principal_name(&self) -> &str;
    fn role_template_name(&self) -> &str;

    fn service_account(&self) -> &str {
        ""
    }

    fn set_user_name(&mut self, name: String);
    fn set_user_principal_name(&mut self, name: String);

    fn has_subject(&self) -> bool {
        !(self.user_name().is_empty()
            && self.group_principal_name().is_empty()
            && self.group_name().is_empty()
            && self.service_account().is_empty())
    }
}

impl RoleTemplateBinding for ClusterRoleTemplateBinding {
    const OWNER_KIND: &'static str = "ClusterRoleTemplateBinding";

    fn user_name(&self) -> &str {
        &self.user_name
    }
    fn user_principal_name(&self) -> &str {
        &self.user_principal_name
    }
    fn group_name(&self) -> &str {
        &self.group_name
    }
    fn group_principal_name(&self) -> &str {
        &self.group_principal_name
    }
    fn role_template_name(&self) -> &str {
        &self.role_template_name
    }
    fn set_user_name(&mut self, name: String) {
        self.user_name = name;
    }
    fn set_user_principal_name(&mut self, name: String) {
        self.user_principal_name = name;
    }
}

impl RoleTemplateBinding for ProjectRoleTemplateBinding {
    const OWNER_KIND: &'static str = "ProjectRoleTemplateBinding";

    fn user_name(&self) -> &str {
        &self.user_name
    }
    fn user_principal_name(&self) -> &str {
        &self.user_principal_name
    }
    fn group_name(&self) -> &str {
        &self.group_name
    }
    fn group_principal_name(&self) -> &str {
        &self.group_principal_name
    }
    fn role_template_name(&self) -> &str {
        &self.role_template_name
    }
    fn service_account(&self) -> &str {
        &self.service_account
    }
    fn set_user_name(&mut self, name: String) {
        self.user_name = name;
    }
    fn set_user_principal_name(&mut self, name: String) {
        self.user_principal_name = name;
    }
}

/// The RBAC subject a binding grants to.
pub fn build_subject<B: RoleTemplateBinding>(binding: &B) -> Result<Subject> {
    let subject = |kind: &str, name: &str| Subject {
        kind: kind.to_string(),
        name: name.to_string(),
        api_group: (kind != "ServiceAccount").then(|| RBAC_API_GROUP.to_string()),
        namespace: None,
    };
    if !binding.user_name().is_empty() {
        return Ok(subject("User", binding.user_name()));
    }
    if !binding.group_principal_name().is_empty() {
        return Ok(subject("Group", binding.group_principal_name()));
    }
    if !binding.group_name().is_empty() {
        return Ok(subject("Group", binding.group_name()));
    }
    if !binding.service_account().is_empty() {
        let account = binding.service_account();
        return match account.split_once(':') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() => Ok(Subject {
                namespace: Some(ns.to_string()),
                ..subject("ServiceAccount", name)
            }),
            _ => Err(RbacError::InvalidServiceAccount(account.to_string())),
        };
    }
    Err(RbacError::NoSubject(binding.meta().name.clone()))
}

/// Shared projection machinery for cluster and project bindings.
pub struct RbacManager {
    target: Arc<dyn RbacTarget>,
    roles: RoleResolver,
    user_manager: UserManager,
    users: SharedStore<User>,
    clusters: SharedStore<Cluster>,
    projects: SharedStore<Project>,
}

impl RbacManager {
    pub fn new(stores: &Stores, target: Arc<dyn RbacTarget>) -> Self {
        Self {
            target,
            roles: RoleResolver::new(stores.role_templates.clone()),
            user_manager: UserManager::new(stores),
            users: stores.users.clone(),
            clusters: stores.clusters.clone(),
            projects: stores.projects.clone(),
        }
    }

    pub fn target(&self) -> &Arc<dyn RbacTarget> {
        &self.target
    }

    /// Fills in the missing half of a user subject. Returns the binding and
    /// whether it changed.
    pub async fn reconcile_subject<B: RoleTemplateBinding>(&self, mut binding: B) -> Result<(B, bool)> {
        if !binding.group_name().is_empty()
            || !binding.group_principal_name().is_empty()
            || !binding.service_account().is_empty()
            || (!binding.user_principal_name().is_empty() && !binding.user_name().is_empty())
        {
            return Ok((binding, false));
        }

        if !binding.user_principal_name().is_empty() {
            let display_name = binding
                .meta()
                .annotation(PRINCIPAL_DISPLAY_NAME_ANNOTATION)
                .unwrap_or_default()
                .to_string();
            let principal = binding.user_principal_name().to_string();
            let user = self.user_manager.ensure_user(&principal, &display_name).await?;
            binding.set_user_name(user.metadata.name);
            return Ok((binding, true));
        }

        if !binding.user_name().is_empty() {
            let user = self
                .users
                .get_opt("", binding.user_name())
                .await?
                .ok_or_else(|| RbacError::UserNotFound(binding.user_name().to_string()))?;
            let principal = user
                .principal_ids
                .iter()
                .find(|p| p.ends_with(binding.user_name()))
                .cloned();
            return Ok(match principal {
                Some(principal) => {
                    binding.set_user_principal_name(principal);
                    (binding, true)
                }
                None => (binding, false),
            });
        }

        Err(RbacError::NoSubject(binding.meta().name.clone()))
    }

    pub async fn cluster(&self, name: &str) -> Result<Cluster> {
        self.clusters
            .get_opt("", name)
            .await?
            .ok_or_else(|| RbacError::ClusterNotFound(name.to_string()))
    }

    /// Resolves a `<cluster>:<project>` reference.
    pub async fn project(&self, project_name: &str) -> Result<Project> {
        let Some((cluster, project)) = project_name.split_once(':') else {
            return Err(RbacError::InvalidProject(project_name.to_string()));
        };
        self.projects
            .get_opt(cluster, project)
            .await?
            .ok_or_else(|| RbacError::ProjectNotFound(project_name.to_string()))
    }

    pub async fn projects_of(&self, cluster: &str) -> Result<Vec<Project>> {
        Ok(self.projects.list(Some(cluster)).await?)
    }

    pub async fn is_owner_role(&self, role_template: &str) -> Result<bool> {
        self.roles.is_owner_role(role_template).await
    }

    /// Binds `subject` to the membership role `role_name`, sharing an existing
    /// binding of the same role and subject, and releases this binding's
    /// claim on any other membership role.
    pub async fn ensure_membership_binding(
        &self,
        role_name: &str,
        rule: KubePolicyRule,
        binding_key: &str,
        owner_value: &str,
        subject: &Subject,
    ) -> Result<()> {
        self.target
            .apply_cluster_role(&ClusterRole {
                metadata: KubeMeta {
                    name: Some(role_name.to_string()),
                    ..Default::default()
                },
                rules: Some(vec![rule]),
                ..Default::default()
            })
            .await?;

        let wanted = role_subject_key(role_name, subject);
        let existing = self
            .target
            .list_cluster_role_bindings(&Labels::new())
            .await?
            .into_iter()
            .find(|crb| crb_by_role_and_subject(crb).contains(&wanted));

        match existing {
            Some(crb) if crb.labels().get(binding_key).map(String::as_str) == Some(owner_value) => {}
            Some(crb) => {
                let name = crb.name_any();
                debug!(crb = %name, binding = binding_key, "claiming existing cluster role binding");
                self.relabel_cluster_role_binding(&name, |labels| {
                    labels.insert(binding_key.to_string(), owner_value.to_string());
                })
                .await?;
            }
            None => {
                let crb = ClusterRoleBinding {
                    metadata: KubeMeta {
                        name: Some(generate_name("clusterrolebinding-")),
                        labels: Some([(binding_key.to_string(), owner_value.to_string())].into()),
                        ..Default::default()
                    },
                    role_ref: RoleRef {
                        api_group: RBAC_API_GROUP.to_string(),
                        kind: "ClusterRole".to_string(),
                        name: role_name.to_string(),
                    },
                    subjects: Some(vec![subject.clone()]),
                };
                info!(role = role_name, subject = %subject.name, binding = binding_key, "creating cluster role binding");
                self.target.create_cluster_role_binding(&crb).await?;
                counter!("rbac_bindings_projected_total", "kind" => "clusterrolebinding").increment(1);
            }
        }

        self.release_membership_bindings(binding_key, owner_value, Some(role_name))
            .await?;
        Ok(())
    }

    /// Drops this binding's label from membership bindings other than
    /// `keep_role`, deleting those no binding claims any more.
    pub async fn release_membership_bindings(
        &self,
        binding_key: &str,
        owner_value: &str,
        keep_role: Option<&str>,
    ) -> Result<usize> {
        let selector: Labels = [(binding_key.to_string(), owner_value.to_string())].into();
        let mut released = 0;
        for crb in self.target.list_cluster_role_bindings(&selector).await? {
            if keep_role == Some(crb.role_ref.name.as_str()) {
                continue;
            }
            let name = crb.name_any();
            let mut remaining = crb.labels().clone();
            remaining.remove(binding_key);
            if remaining.values().any(|v| OWNER_VALUES.contains(&v.as_str())) {
                self.relabel_cluster_role_binding(&name, |labels| {
                    labels.remove(binding_key);
                })
                .await?;
            } else {
                info!(crb = %name, binding = binding_key, "deleting cluster role binding");
                self.target.delete_cluster_role_binding(&name).await?;
            }
            released += 1;
        }
        Ok(released)
    }

    async fn relabel_cluster_role_binding<F>(&self, name: &str, edit: F) -> Result<()>
    where
        F: Fn(&mut Labels) + Send + Sync,
    {
        let target = &self.target;
        let edit = &edit;
        retry_on_conflict(Backoff::conflict(), || async move {
            let Some(mut crb) = target.get_cluster_role_binding(name).await? else {
                return Ok(());
            };
            edit(crb.labels_mut());
            target.replace_cluster_role_binding(&crb).await?;
            Ok(())
        })
        .await
    }

    pub async fn relabel_role_binding<F>(&self, namespace: &str, name: &str, edit: F) -> Result<()>
    where
        F: Fn(&mut Labels) + Send + Sync,
    {
        let target = &self.target;
        let edit = &edit;
        retry_on_conflict(Backoff::conflict(), || async move {
            let Some(mut rb) = target.get_role_binding(namespace, name).await? else {
                return Ok(());
            };
            edit(rb.labels_mut());
            target.replace_role_binding(&rb).await?;
            Ok(())
        })
        .await
    }

    /// Grants the part of the binding's role template that touches `resources`
    /// inside `namespace`. A template with no such rules leaves nothing behind.
    pub async fn grant_management_plane<B: RoleTemplateBinding>(
        &self,
        binding: &B,
        namespace: &str,
        resources: &[(&str, &str)],
        owner_value: &str,
        subject: &Subject,
    ) -> Result<()> {
        let role_template = binding.role_template_name();
        let rules = roles::management_plane_rules(&self.roles.rules(role_template).await?, resources);
        let rb_name = management_binding_name(binding.meta(), role_template);

        if rules.is_empty() {
            return self.target.delete_role_binding(namespace, &rb_name).await;
        }

        self.target
            .apply_role(&Role {
                metadata: KubeMeta {
                    name: Some(role_template.to_string()),
                    namespace: Some(namespace.to_string()),
                    ..Default::default()
                },
                rules: Some(rules.iter().map(roles::to_kube_rule).collect()),
            })
            .await?;

        let meta = binding.meta();
        let rb = RoleBinding {
            metadata: KubeMeta {
                name: Some(rb_name.clone()),
                namespace: Some(namespace.to_string()),
                labels: Some([(binding_label_key(meta), owner_value.to_string())].into()),
                owner_references: (!meta.uid.is_empty()).then(|| {
                    vec![OwnerReference {
                        api_version: MANAGEMENT_API_VERSION.to_string(),
                        kind: B::OWNER_KIND.to_string(),
                        name: meta.name.clone(),
                        uid: meta.uid.clone(),
                        ..Default::default()
                    }]
                }),
                ..Default::default()
            },
            role_ref: RoleRef {
                api_group: RBAC_API_GROUP.to_string(),
                kind: "Role".to_string(),
                name: role_template.to_string(),
            },
            subjects: Some(vec![subject.clone()]),
        };
        self.ensure_role_binding(rb).await
    }

    async fn ensure_role_binding(&self, rb: RoleBinding) -> Result<()> {
        let namespace = rb.namespace().unwrap_or_default();
        let name = rb.name_any();
        if let Some(existing) = self.target.get_role_binding(&namespace, &name).await? {
            if existing.role_ref == rb.role_ref && existing.subjects == rb.subjects && existing.labels() == rb.labels() {
                return Ok(());
            }
            // roleRef is immutable once created.
            self.target.delete_role_binding(&namespace, &name).await?;
        }
        debug!(namespace = %namespace, rb = %name, "creating role binding");
        match self.target.create_role_binding(&rb).await {
            Err(RbacError::AlreadyExists(_)) => {
                self.target.replace_role_binding(&rb).await?;
            }
            other => {
                other?;
                counter!("rbac_bindings_projected_total", "kind" => "rolebinding").increment(1);
            }
        }
        Ok(())
    }

    /// Deletes the role bindings in `namespace` labeled for `binding_key`, or
    /// owned by `owner_uid`.
    pub async fn remove_role_bindings(
        &self,
        namespace: Option<&str>,
        binding_key: &str,
        owner_value: &str,
        owner_uid: Option<&str>,
    ) -> Result<usize> {
        let candidates = match owner_uid {
            Some(_) => self.target.list_role_bindings(namespace, &Labels::new()).await?,
            None => {
                let selector: Labels = [(binding_key.to_string(), owner_value.to_string())].into();
                self.target.list_role_bindings(namespace, &selector).await?
            }
        };

        let mut removed = 0;
        for rb in candidates {
            let labeled = rb.labels().get(binding_key).map(String::as_str) == Some(owner_value);
            let owned = owner_uid.map_or(false, |uid| rb_by_owner(&rb).iter().any(|o| o == uid));
            if !(labeled || owned) {
                continue;
            }
            let rb_namespace = rb.namespace().unwrap_or_default();
            info!(namespace = %rb_namespace, rb = %rb.name_any(), binding = binding_key, "deleting role binding");
            self.target.delete_role_binding(&rb_namespace, &rb.name_any()).await?;
            removed += 1;
        }
        if removed > 0 {
            counter!("rbac_bindings_removed_total").increment(removed as u64);
        }
        Ok(removed)
    }

    /// Re-keys objects labeled with a binding's UID onto its `ns_name` key.
    pub async fn migrate_uid_labels(&self, meta: &ObjectMeta, crb_value: &str, rb_value: &str) -> Result<()> {
        if meta.uid.is_empty() {
            return Ok(());
        }
        let binding_key = binding_label_key(meta);
        let mut failures = Vec::new();

        let selector: Labels = [(meta.uid.clone(), crb_value.to_string())].into();
        for crb in self.target.list_cluster_role_bindings(&selector).await? {
            if crb.labels().contains_key(&binding_key) {
                continue;
            }
            let result = self
                .relabel_cluster_role_binding(&crb.name_any(), |labels| {
                    labels.insert(binding_key.clone(), crb_value.to_string());
                    labels.insert(RTB_LABEL_UPDATED.to_string(), "true".to_string());
                })
                .await;
            if let Err(e) = result {
                failures.push(format!("clusterrolebinding {}: {}", crb.name_any(), e));
            }
        }

        let selector: Labels = [(meta.uid.clone(), rb_value.to_string())].into();
        for rb in self.target.list_role_bindings(None, &selector).await? {
            if rb.labels().contains_key(&binding_key) {
                continue;
            }
            let namespace = rb.namespace().unwrap_or_default();
            let result = self
                .relabel_role_binding(&namespace, &rb.name_any(), |labels| {
                    labels.insert(binding_key.clone(), rb_value.to_string());
                    labels.insert(RTB_LABEL_UPDATED.to_string(), "true".to_string());
                })
                .await;
            if let Err(e) = result {
                failures.push(format!("rolebinding {}/{}: {}", namespace, rb.name_any(), e));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(RbacError::Relabel(failures))
        }
    }
}

/// Name of the role binding granting a binding's template in a namespace.
pub fn management_binding_name(meta: &ObjectMeta, role_template: &str) -> String {
    format!("{}-{}-{}", meta.namespace, meta.name, role_template).to_lowercase()
}
