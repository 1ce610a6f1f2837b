// Kubernetes RBAC objects written by the projector

use async_trait::async_trait;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::{Api, Client, Resource, ResourceExt};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use super::{RbacError, Result};

pub type Labels = BTreeMap<String, String>;

/// Where role bindings land. Deletes tolerate missing objects; `replace`
/// fails with `Conflict` on a stale resource version.
#[async_trait]
pub trait RbacTarget: Send + Sync {
    async fn get_cluster_role_binding(&self, name: &str) -> Result<Option<ClusterRoleBinding>>;

    async fn list_cluster_role_bindings(&self, selector: &Labels) -> Result<Vec<ClusterRoleBinding>>;

    async fn create_cluster_role_binding(&self, crb: &ClusterRoleBinding) -> Result<ClusterRoleBinding>;

    async fn replace_cluster_role_binding(&self, crb: &ClusterRoleBinding) -> Result<ClusterRoleBinding>;

    async fn delete_cluster_role_binding(&self, name: &str) -> Result<()>;

    async fn get_role_binding(&self, namespace: &str, name: &str) -> Result<Option<RoleBinding>>;

    /// Role bindings in `namespace`, or in every namespace.
    async fn list_role_bindings(&self, namespace: Option<&str>, selector: &Labels) -> Result<Vec<RoleBinding>>;

    async fn create_role_binding(&self, rb: &RoleBinding) -> Result<RoleBinding>;

    async fn replace_role_binding(&self, rb: &RoleBinding) -> Result<RoleBinding>;

    async fn delete_role_binding(&self, namespace: &str, name: &str) -> Result<()>;

    /// Creates the role, or overwrites its rules.
    async fn apply_cluster_role(&self, role: &ClusterRole) -> Result<()>;

    async fn apply_role(&self, role: &Role) -> Result<()>;
}

pub fn label_selector(selector: &Labels) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

pub fn matches_labels<K: Resource>(obj: &K, selector: &Labels) -> bool {
    let labels = obj.labels();
    selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}

fn kube_error(e: kube::Error, what: &str) -> RbacError {
    match e {
        kube::Error::Api(ref response) if response.code == 409 && response.reason == "AlreadyExists" => {
            RbacError::AlreadyExists(what.to_string())
        }
        kube::Error::Api(ref response) if response.code == 409 => RbacError::Conflict(what.to_string()),
        kube::Error::Api(ref response) if response.code == 404 => RbacError::NotFound(what.to_string()),
        other => RbacError::Kube(other),
    }
}

fn tolerate_missing(result: std::result::Result<(), kube::Error>, what: &str) -> Result<()> {
    match result {
        Err(e) => match kube_error(e, what) {
            RbacError::NotFound(_) => Ok(()),
            other => Err(other),
        },
        Ok(()) => Ok(()),
    }
}

/// RBAC objects of a live cluster.
#[derive(Clone)]
pub struct KubeTarget {
    client: Client,
}

impl KubeTarget {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn try_default() -> Result<Self> {
        Ok(Self::new(Client::try_default().await?))
    }

    fn namespaced<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl RbacTarget for KubeTarget {
    async fn get_cluster_role_binding(&self, name: &str) -> Result<Option<ClusterRoleBinding>> {
        let api: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn list_cluster_role_bindings(&self, selector: &Labels) -> Result<Vec<ClusterRoleBinding>> {
        let api: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        let params = ListParams::default().labels(&label_selector(selector));
        Ok(api.list(&params).await?.items)
    }

    async fn create_cluster_role_binding(&self, crb: &ClusterRoleBinding) -> Result<ClusterRoleBinding> {
        let api: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        api.create(&PostParams::default(), crb)
            .await
            .map_err(|e| kube_error(e, &crb.name_any()))
    }

    async fn replace_cluster_role_binding(&self, crb: &ClusterRoleBinding) -> Result<ClusterRoleBinding> {
        let api: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        let name = crb.name_any();
        api.replace(&name, &PostParams::default(), crb)
            .await
            .map_err(|e| kube_error(e, &name))
    }

    async fn delete_cluster_role_binding(&self, name: &str) -> Result<()> {
        let api: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        let result = api.delete(name, &DeleteParams::default()).await.map(|_| ());
        tolerate_missing(result, name)
    }

    async fn get_role_binding(&self, namespace: &str, name: &str) -> Result<Option<RoleBinding>> {
        let api: Api<RoleBinding> = self.namespaced(namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list_role_bindings(&self, namespace: Option<&str>, selector: &Labels) -> Result<Vec<RoleBinding>> {
        let api: Api<RoleBinding> = match namespace {
            Some(ns) => self.namespaced(ns),
            None => Api::all(self.client.clone()),
        };
        let params = ListParams::default().labels(&label_selector(selector));
        Ok(api.list(&params).await?.items)
    }

    async fn create_role_binding(&self, rb: &RoleBinding) -> Result<RoleBinding> {
        let api: Api<RoleBinding> = self.namespaced(&rb.namespace().unwrap_or_default());
        api.create(&PostParams::default(), rb)
            .await
            .map_err(|e| kube_error(e, &rb.name_any()))
    }

    async fn replace_role_binding(&self, rb: &RoleBinding) -> Result<RoleBinding> {
        let api: Api<RoleBinding> = self.namespaced(&rb.namespace().unwrap_or_default());
        let name = rb.name_any();
        api.replace(&name, &PostParams::default(), rb)
            .await
            .map_err(|e| kube_error(e, &name))
    }

    async fn delete_role_binding(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<RoleBinding> = self.namespaced(namespace);
        let result = api.delete(name, &DeleteParams::default()).await.map(|_| ());
        tolerate_missing(result, name)
    }

    async fn apply_cluster_role(&self, role: &ClusterRole) -> Result<()> {
        let api: Api<ClusterRole> = Api::all(self.client.clone());
        let name = role.name_any();
        match api.get_opt(&name).await? {
            Some(mut existing) => {
                if existing.rules == role.rules {
                    return Ok(());
                }
                existing.rules = role.rules.clone();
                api.replace(&name, &PostParams::default(), &existing)
                    .await
                    .map_err(|e| kube_error(e, &name))?;
            }
            None => {
                api.create(&PostParams::default(), role)
                    .await
                    .map_err(|e| kube_error(e, &name))?;
            }
        }
        Ok(())
    }

    async fn apply_role(&self, role: &Role) -> Result<()> {
        let api: Api<Role> = self.namespaced(&role.namespace().unwrap_or_default());
        let name = role.name_any();
        match api.get_opt(&name).await? {
            Some(mut existing) => {
                if existing.rules == role.rules {
                    return Ok(());
                }
                existing.rules = role.rules.clone();
                api.replace(&name, &PostParams::default(), &existing)
                    .await
                    .map_err(|e| kube_error(e, &name))?;
            }
            None => {
                api.create(&PostParams::default(), role)
                    .await
                    .map_err(|e| kube_error(e, &name))?;
            }
        }
        Ok(())
    }
}

struct Objects<K> {
    items: Mutex<BTreeMap<(String, String), K>>,
    version: AtomicU64,
}

impl<K: Resource + Clone> Objects<K> {
    fn new() -> Self {
        Self {
            items: Mutex::new(BTreeMap::new()),
            version: AtomicU64::new(0),
        }
    }

    fn key(obj: &K) -> (String, String) {
        (obj.namespace().unwrap_or_default(), obj.name_any())
    }

    fn next_version(&self) -> Option<String> {
        Some((self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string())
    }

    fn get(&self, namespace: &str, name: &str) -> Option<K> {
        self.items
            .lock()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    fn list(&self, namespace: Option<&str>, selector: &Labels) -> Vec<K> {
        self.items
            .lock()
            .iter()
            .filter(|((ns, _), _)| namespace.map_or(true, |want| want == ns))
            .filter(|(_, obj)| matches_labels(*obj, selector))
            .map(|(_, obj)| obj.clone())
            .collect()
    }

    fn create(&self, obj: &K) -> Result<K> {
        let key = Self::key(obj);
        let mut items = self.items.lock();
        if items.contains_key(&key) {
            return Err(RbacError::AlreadyExists(key.1));
        }
        let mut obj = obj.clone();
        obj.meta_mut().resource_version = self.next_version();
        items.insert(key, obj.clone());
        Ok(obj)
    }

    fn replace(&self, obj: &K) -> Result<K> {
        let key = Self::key(obj);
        let mut items = self.items.lock();
        let Some(current) = items.get(&key) else {
            return Err(RbacError::NotFound(key.1));
        };
        if obj.resource_version().is_some() && obj.resource_version() != current.resource_version() {
            return Err(RbacError::Conflict(key.1));
        }
        let mut obj = obj.clone();
        obj.meta_mut().resource_version = self.next_version();
        items.insert(key, obj.clone());
        Ok(obj)
    }

    fn upsert(&self, obj: &K) {
        let mut obj = obj.clone();
        obj.meta_mut().resource_version = self.next_version();
        self.items.lock().insert(Self::key(&obj), obj);
    }

    fn delete(&self, namespace: &str, name: &str) {
        self.items.lock().remove(&(namespace.to_string(), name.to_string()));
    }
}

/// Process-local RBAC objects, for single-node runs without a cluster API.
pub struct MemoryTarget {
    cluster_role_bindings: Objects<ClusterRoleBinding>,
    role_bindings: Objects<RoleBinding>,
    cluster_roles: Objects<ClusterRole>,
    roles: Objects<Role>,
}

impl Default for MemoryTarget {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTarget {
    pub fn new() -> Self {
        Self {
            cluster_role_bindings: Objects::new(),
            role_bindings: Objects::new(),
            cluster_roles: Objects::new(),
            roles: Objects::new(),
        }
    }

    pub fn cluster_role(&self, name: &str) -> Option<ClusterRole> {
        self.cluster_roles.get("", name)
    }

    pub fn role(&self, namespace: &str, name: &str) -> Option<Role> {
        self.roles.get(namespace, name)
    }
}

#[async_trait]
impl RbacTarget for MemoryTarget {
    async fn get_cluster_role_binding(&self, name: &str) -> Result<Option<ClusterRoleBinding>> {
        Ok(self.cluster_role_bindings.get("", name))
    }

    async fn list_cluster_role_bindings(&self, selector: &Labels) -> Result<Vec<ClusterRoleBinding>> {
        Ok(self.cluster_role_bindings.list(None, selector))
    }

    async fn create_cluster_role_binding(&self, crb: &ClusterRoleBinding) -> Result<ClusterRoleBinding> {
        self.cluster_role_bindings.create(crb)
    }

    async fn replace_cluster_role_binding(&self, crb: &ClusterRoleBinding) -> Result<ClusterRoleBinding> {
        self.cluster_role_bindings.replace(crb)
    }

    async fn delete_cluster_role_binding(&self, name: &str) -> Result<()> {
        self.cluster_role_bindings.delete("", name);
        Ok(())
    }

    async fn get_role_binding(&self, namespace: &str, name: &str) -> Result<Option<RoleBinding>> {
        Ok(self.role_bindings.get(namespace, name))
    }

    async fn list_role_bindings(&self, namespace: Option<&str>, selector: &Labels) -> Result<Vec<RoleBinding>> {
        Ok(self.role_bindings.list(namespace, selector))
    }

    async fn create_role_binding(&self, rb: &RoleBinding) -> Result<RoleBinding> {
        self.role_bindings.create(rb)
    }

    async fn replace_role_binding(&self, rb: &RoleBinding) -> Result<RoleBinding> {
        self.role_bindings.replace(rb)
    }

    async fn delete_role_binding(&self, namespace: &str, name: &str) -> Result<()> {
        self.role_bindings.delete(namespace, name);
        Ok(())
    }

    async fn apply_cluster_role(&self, role: &ClusterRole) -> Result<()> {
        self.cluster_roles.upsert(role);
        Ok(())
    }

    async fn apply_role(&self, role: &Role) -> Result<()> {
        self.roles.upsert(role);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn crb(name: &str, labels: &[(&str, &str)]) -> ClusterRoleBinding {
        ClusterRoleBinding {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn selector_is_comma_joined() {
        let selector: Labels = [("a", "1"), ("b", "2")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        assert_eq!(label_selector(&selector), "a=1,b=2");
    }

    #[tokio::test]
    async fn stale_replace_conflicts() {
        let target = MemoryTarget::new();
        let created = target.create_cluster_role_binding(&crb("one", &[])).await.unwrap();
        let fresh = target.replace_cluster_role_binding(&created).await.unwrap();
        assert_ne!(fresh.resource_version(), created.resource_version());

        let err = target.replace_cluster_role_binding(&created).await.unwrap_err();
        assert!(matches!(err, RbacError::Conflict(_)));
        assert!(matches!(
            target.create_cluster_role_binding(&crb("one", &[])).await.unwrap_err(),
            RbacError::AlreadyExists(_)
        ));
    }

    #[tokio::test]
    async fn list_filters_on_every_label() {
        let target = MemoryTarget::new();
        target.create_cluster_role_binding(&crb("a", &[("k", "v"), ("x", "y")])).await.unwrap();
        target.create_cluster_role_binding(&crb("b", &[("k", "v")])).await.unwrap();

        let selector: Labels = [("k".to_string(), "v".to_string()), ("x".to_string(), "y".to_string())].into();
        let found = target.list_cluster_role_bindings(&selector).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name_any(), "a");

        target.delete_cluster_role_binding("missing").await.unwrap();
    }
}
