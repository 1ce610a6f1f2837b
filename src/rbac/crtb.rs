// Cluster role template bindings

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

use super::roles::{membership_rule, CLUSTER_MANAGEMENT_PLANE_RESOURCES, PROJECT_MANAGEMENT_PLANE_RESOURCES};
use super::{
    binding_label_key, build_subject, RbacError, RbacManager, Result, RoleTemplateBinding,
    CRTB_IN_PROJECT_BINDING_OWNER, MEMBERSHIP_BINDING_OWNER, RTB_CRB_RB_LABELS_UPDATED,
};
use crate::controller::{Action, Reconciler, WorkQueue};
use crate::models::meta::split_key;
use crate::models::rbac::{ClusterRoleTemplateBinding, Project};
use crate::models::ObjectMeta;
use crate::store::{retry_on_conflict, Backoff, SharedStore};

/// Projects a cluster binding into a `<cluster>-clusterowner` or
/// `<cluster>-clustermember` membership binding plus namespace grants.
pub struct CrtbHandler {
    mgr: Arc<RbacManager>,
    crtbs: SharedStore<ClusterRoleTemplateBinding>,
}

impl CrtbHandler {
    pub fn new(mgr: Arc<RbacManager>, crtbs: SharedStore<ClusterRoleTemplateBinding>) -> Self {
        Self { mgr, crtbs }
    }

    async fn reconcile_subject(&self, binding: ClusterRoleTemplateBinding) -> Result<ClusterRoleTemplateBinding> {
        let (binding, changed) = self.mgr.reconcile_subject(binding).await?;
        if !changed {
            return Ok(binding);
        }
        Ok(self.crtbs.update(binding).await?)
    }

    async fn reconcile_labels(&self, binding: ClusterRoleTemplateBinding) -> Result<ClusterRoleTemplateBinding> {
        if binding.metadata.label(RTB_CRB_RB_LABELS_UPDATED) == Some("true") {
            return Ok(binding);
        }
        self.mgr
            .migrate_uid_labels(&binding.metadata, MEMBERSHIP_BINDING_OWNER, CRTB_IN_PROJECT_BINDING_OWNER)
            .await?;

        let store = &self.crtbs;
        let (ns, name) = (binding.metadata.namespace.as_str(), binding.metadata.name.as_str());
        let updated = retry_on_conflict(Backoff::conflict(), || async move {
            let mut current = store.get(ns, name).await?;
            current
                .metadata
                .labels
                .insert(RTB_CRB_RB_LABELS_UPDATED.to_string(), "true".to_string());
            store.update(current).await
        })
        .await?;
        Ok(updated)
    }

    async fn reconcile_bindings(&self, binding: &ClusterRoleTemplateBinding) -> Result<()> {
        if !binding.has_subject() {
            return Ok(());
        }

        let cluster = self.mgr.cluster(&binding.cluster_name).await?;
        let owner = self.mgr.is_owner_role(&binding.role_template_name).await?;
        let role_name = if owner {
            format!("{}-clusterowner", cluster.metadata.name)
        } else {
            format!("{}-clustermember", cluster.metadata.name)
        }
        .to_lowercase();

        let subject = build_subject(binding)?;
        let key = binding_label_key(&binding.metadata);
        self.mgr
            .ensure_membership_binding(
                &role_name,
                membership_rule("clusters", &cluster.metadata.name, owner),
                &key,
                MEMBERSHIP_BINDING_OWNER,
                &subject,
            )
            .await?;

        self.mgr
            .grant_management_plane(
                binding,
                &binding.metadata.namespace,
                CLUSTER_MANAGEMENT_PLANE_RESOURCES,
                MEMBERSHIP_BINDING_OWNER,
                &subject,
            )
            .await?;

        for project in self.mgr.projects_of(&binding.metadata.namespace).await? {
            self.mgr
                .grant_management_plane(
                    binding,
                    &project.metadata.name,
                    PROJECT_MANAGEMENT_PLANE_RESOURCES,
                    CRTB_IN_PROJECT_BINDING_OWNER,
                    &subject,
                )
                .await?;
        }
        Ok(())
    }

    /// Deletes everything labeled for the binding `namespace/name`.
    pub async fn remove(&self, namespace: &str, name: &str, uid: Option<&str>) -> Result<()> {
        let key = binding_label_key(&ObjectMeta::namespaced(namespace, name));
        self.mgr
            .release_membership_bindings(&key, MEMBERSHIP_BINDING_OWNER, None)
            .await?;
        self.mgr
            .remove_role_bindings(Some(namespace), &key, MEMBERSHIP_BINDING_OWNER, uid)
            .await?;
        for project in self.mgr.projects_of(namespace).await? {
            self.mgr
                .remove_role_bindings(Some(&project.metadata.name), &key, CRTB_IN_PROJECT_BINDING_OWNER, None)
                .await?;
        }
        info!(binding = %key, "removed cluster role template binding projections");
        Ok(())
    }
}

#[async_trait]
impl Reconciler for CrtbHandler {
    type Error = RbacError;

    fn name(&self) -> &'static str {
        "mgmt-auth-crtb-controller"
    }

    async fn reconcile(&self, key: &str) -> Result<Action> {
        let (ns, name) = split_key(key);
        let Some(binding) = self.crtbs.get_opt(ns, name).await? else {
            self.remove(ns, name, None).await?;
            return Ok(Action::done());
        };

        if binding.metadata.deletion_timestamp.is_some() {
            self.remove(ns, name, Some(&binding.metadata.uid)).await?;
            self.crtbs.delete_if_exists(ns, name).await?;
            return Ok(Action::done());
        }

        let binding = self.reconcile_subject(binding).await?;
        let binding = self.reconcile_labels(binding).await?;
        self.reconcile_bindings(&binding).await?;
        Ok(Action::done())
    }
}

/// Re-enqueues a cluster's bindings whenever one of its projects changes, so
/// new project namespaces receive their grants.
pub fn enqueue_on_project_change(
    queue: &WorkQueue,
    crtbs: SharedStore<ClusterRoleTemplateBinding>,
    projects: &SharedStore<Project>,
) {
    let mut events = projects.watch();
    let queue = queue.clone();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let (cluster, _) = split_key(event.key());
                    match crtbs.list(Some(cluster)).await {
                        Ok(bindings) => bindings.iter().for_each(|b| queue.add(b.metadata.key())),
                        Err(e) => warn!(cluster, error = %e, "listing cluster bindings for project change"),
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "project watch lagged; waiting for resync");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
