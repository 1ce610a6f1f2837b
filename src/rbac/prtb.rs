// Project role template bindings

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use super::roles::{membership_rule, PROJECT_MANAGEMENT_PLANE_RESOURCES};
use super::{
    binding_label_key, build_subject, RbacError, RbacManager, Result, RoleTemplateBinding, MEMBERSHIP_BINDING_OWNER,
    PRTB_IN_CLUSTER_BINDING_OWNER, RTB_CRB_RB_LABELS_UPDATED,
};
use crate::controller::{Action, Reconciler};
use crate::models::meta::split_key;
use crate::models::rbac::ProjectRoleTemplateBinding;
use crate::models::ObjectMeta;
use crate::store::{retry_on_conflict, Backoff, SharedStore};

/// Projects a project binding into `<project>-projectowner` or
/// `<project>-projectmember`, read access to the owning cluster, and the
/// template's grants in the project namespace.
pub struct PrtbHandler {
    mgr: Arc<RbacManager>,
    prtbs: SharedStore<ProjectRoleTemplateBinding>,
}

impl PrtbHandler {
    pub fn new(mgr: Arc<RbacManager>, prtbs: SharedStore<ProjectRoleTemplateBinding>) -> Self {
        Self { mgr, prtbs }
    }

    async fn reconcile_labels(&self, binding: ProjectRoleTemplateBinding) -> Result<ProjectRoleTemplateBinding> {
        if binding.metadata.label(RTB_CRB_RB_LABELS_UPDATED) == Some("true") {
            return Ok(binding);
        }
        self.mgr
            .migrate_uid_labels(&binding.metadata, MEMBERSHIP_BINDING_OWNER, MEMBERSHIP_BINDING_OWNER)
            .await?;

        let store = &self.prtbs;
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

    async fn reconcile_bindings(&self, binding: &ProjectRoleTemplateBinding) -> Result<()> {
        if !binding.has_subject() {
            return Ok(());
        }

        let project = self.mgr.project(&binding.project_name).await?;
        let cluster = self.mgr.cluster(&project.cluster_name).await?;
        let owner = self.mgr.is_owner_role(&binding.role_template_name).await?;
        let project_role = if owner {
            format!("{}-projectowner", project.metadata.name)
        } else {
            format!("{}-projectmember", project.metadata.name)
        }
        .to_lowercase();

        let subject = build_subject(binding)?;
        let key = binding_label_key(&binding.metadata);
        self.mgr
            .ensure_membership_binding(
                &project_role,
                membership_rule("projects", &project.metadata.name, owner),
                &key,
                MEMBERSHIP_BINDING_OWNER,
                &subject,
            )
            .await?;

        let cluster_role = format!("{}-clustermember", cluster.metadata.name).to_lowercase();
        self.mgr
            .ensure_membership_binding(
                &cluster_role,
                membership_rule("clusters", &cluster.metadata.name, false),
                &key,
                PRTB_IN_CLUSTER_BINDING_OWNER,
                &subject,
            )
            .await?;

        self.mgr
            .grant_management_plane(
                binding,
                &binding.metadata.namespace,
                PROJECT_MANAGEMENT_PLANE_RESOURCES,
                MEMBERSHIP_BINDING_OWNER,
                &subject,
            )
            .await
    }

    pub async fn remove(&self, namespace: &str, name: &str, uid: Option<&str>) -> Result<()> {
        let key = binding_label_key(&ObjectMeta::namespaced(namespace, name));
        self.mgr
            .release_membership_bindings(&key, MEMBERSHIP_BINDING_OWNER, None)
            .await?;
        self.mgr
            .release_membership_bindings(&key, PRTB_IN_CLUSTER_BINDING_OWNER, None)
            .await?;
        self.mgr
            .remove_role_bindings(Some(namespace), &key, MEMBERSHIP_BINDING_OWNER, uid)
            .await?;
        info!(binding = %key, "removed project role template binding projections");
        Ok(())
    }
}

#[async_trait]
impl Reconciler for PrtbHandler {
    type Error = RbacError;

    fn name(&self) -> &'static str {
        "mgmt-auth-prtb-controller"
    }

    async fn reconcile(&self, key: &str) -> Result<Action> {
        let (ns, name) = split_key(key);
        let Some(binding) = self.prtbs.get_opt(ns, name).await? else {
            self.remove(ns, name, None).await?;
            return Ok(Action::done());
        };

        if binding.metadata.deletion_timestamp.is_some() {
            self.remove(ns, name, Some(&binding.metadata.uid)).await?;
            self.prtbs.delete_if_exists(ns, name).await?;
            return Ok(Action::done());
        }

        let (binding, changed) = self.mgr.reconcile_subject(binding).await?;
        let binding = if changed { self.prtbs.update(binding).await? } else { binding };
        let binding = self.reconcile_labels(binding).await?;
        self.reconcile_bindings(&binding).await?;
        Ok(Action::done())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::cluster::Cluster;
    use crate::models::rbac::{PolicyRule, Project, RoleTemplate};
    use crate::rbac::target::{Labels, MemoryTarget, RbacTarget};
    use crate::store::Stores;
    use kube::ResourceExt;

    async fn setup() -> (Stores, Arc<MemoryTarget>, PrtbHandler) {
        let stores = Stores::memory();
        stores
            .clusters
            .create(Cluster {
                metadata: ObjectMeta::named("c-1"),
                ..Default::default()
            })
            .await
            .unwrap();
        stores
            .projects
            .create(Project {
                metadata: ObjectMeta::namespaced("c-1", "p-1"),
                cluster_name: "c-1".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        for (name, inherits) in [("project-owner", vec![]), ("team-lead", vec!["project-owner".to_string()])] {
            stores
                .role_templates
                .create(RoleTemplate {
                    metadata: ObjectMeta::named(name),
                    context: "project".to_string(),
                    rules: vec![PolicyRule::new(&["*"], &["management.cattle.io"], &["projectcatalogs"])],
                    role_template_names: inherits,
                    ..Default::default()
                })
                .await
                .unwrap();
        }
        let target = Arc::new(MemoryTarget::new());
        let mgr = Arc::new(RbacManager::new(&stores, target.clone()));
        let handler = PrtbHandler::new(mgr, stores.prtbs.clone());
        (stores, target, handler)
    }

    fn service_account_prtb(name: &str, role: &str) -> ProjectRoleTemplateBinding {
        ProjectRoleTemplateBinding {
            metadata: ObjectMeta::namespaced("p-1", name),
            service_account: "ci:deployer".to_string(),
            role_template_name: role.to_string(),
            project_name: "c-1:p-1".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn project_binding_grants_project_and_cluster_membership() {
        let (stores, target, handler) = setup().await;
        stores.prtbs.create(service_account_prtb("prtb-1", "team-lead")).await.unwrap();
        handler.reconcile("p-1/prtb-1").await.unwrap();

        let mut roles: Vec<(String, String)> = target
            .list_cluster_role_bindings(&Labels::new())
            .await
            .unwrap()
            .iter()
            .map(|crb| (crb.role_ref.name.clone(), crb.labels()["p-1_prtb-1"].clone()))
            .collect();
        roles.sort();
        assert_eq!(
            roles,
            vec![
                ("c-1-clustermember".to_string(), PRTB_IN_CLUSTER_BINDING_OWNER.to_string()),
                ("p-1-projectowner".to_string(), MEMBERSHIP_BINDING_OWNER.to_string()),
            ]
        );

        let rbs = target.list_role_bindings(Some("p-1"), &Labels::new()).await.unwrap();
        assert_eq!(rbs.len(), 1);
        let subject = &rbs[0].subjects.as_ref().unwrap()[0];
        assert_eq!(subject.kind, "ServiceAccount");
        assert_eq!(subject.namespace.as_deref(), Some("ci"));
    }

    #[tokio::test]
    async fn removal_clears_both_membership_levels() {
        let (stores, target, handler) = setup().await;
        stores.prtbs.create(service_account_prtb("prtb-1", "project-owner")).await.unwrap();
        handler.reconcile("p-1/prtb-1").await.unwrap();

        stores.prtbs.delete("p-1", "prtb-1").await.unwrap();
        handler.reconcile("p-1/prtb-1").await.unwrap();

        assert!(target.list_cluster_role_bindings(&Labels::new()).await.unwrap().is_empty());
        assert!(target.list_role_bindings(None, &Labels::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_project_reference_fails() {
        let (stores, _, handler) = setup().await;
        let mut binding = service_account_prtb("prtb-2", "project-owner");
        binding.project_name = "p-1".to_string();
        stores.prtbs.create(binding).await.unwrap();
        let err = handler.reconcile("p-1/prtb-2").await.unwrap_err();
        assert!(matches!(err, RbacError::InvalidProject(_)));
    }
}
