// Role template resolution: inheritance, ownership and management-plane rules

use k8s_openapi::api::rbac::v1::PolicyRule as KubePolicyRule;
use std::collections::HashSet;

use super::{RbacError, Result};
use crate::models::rbac::{PolicyRule, RoleTemplate};
use crate::store::SharedStore;

pub const CLUSTER_OWNER: &str = "cluster-owner";
pub const PROJECT_OWNER: &str = "project-owner";

/// Management-plane resources scoped to a cluster, by API group.
pub const CLUSTER_MANAGEMENT_PLANE_RESOURCES: &[(&str, &str)] = &[
    ("catalogtemplates", "management.cattle.io"),
    ("catalogtemplateversions", "management.cattle.io"),
    ("clustercatalogs", "management.cattle.io"),
    ("clusterregistrationtokens", "management.cattle.io"),
    ("clusterroletemplatebindings", "management.cattle.io"),
    ("etcdbackups", "management.cattle.io"),
    ("nodes", "management.cattle.io"),
    ("nodepools", "management.cattle.io"),
    ("projects", "management.cattle.io"),
];

/// Management-plane resources scoped to a project.
pub const PROJECT_MANAGEMENT_PLANE_RESOURCES: &[(&str, &str)] = &[
    ("apps", "project.cattle.io"),
    ("apprevisions", "project.cattle.io"),
    ("projectcatalogs", "management.cattle.io"),
    ("projectroletemplatebindings", "management.cattle.io"),
    ("catalogtemplates", "management.cattle.io"),
    ("catalogtemplateversions", "management.cattle.io"),
];

#[derive(Clone)]
pub struct RoleResolver {
    role_templates: SharedStore<RoleTemplate>,
}

impl RoleResolver {
    pub fn new(role_templates: SharedStore<RoleTemplate>) -> Self {
        Self { role_templates }
    }

    async fn get(&self, name: &str) -> Result<RoleTemplate> {
        self.role_templates
            .get_opt("", name)
            .await?
            .ok_or_else(|| RbacError::RoleTemplateNotFound(name.to_string()))
    }

    /// Whether `name` is, or inherits from, an owner template.
    pub async fn is_owner_role(&self, name: &str) -> Result<bool> {
        let mut visited = HashSet::new();
        let mut pending = vec![name.to_string()];
        while let Some(current) = pending.pop() {
            if !visited.insert(current.clone()) {
                continue;
            }
            if current == CLUSTER_OWNER || current == PROJECT_OWNER {
                return Ok(true);
            }
            let template = self.get(&current).await?;
            pending.extend(template.role_template_names);
        }
        Ok(false)
    }

    /// Rules of `name` and of every template it inherits from.
    pub async fn rules(&self, name: &str) -> Result<Vec<PolicyRule>> {
        let mut visited = HashSet::new();
        let mut pending = vec![name.to_string()];
        let mut rules = Vec::new();
        while let Some(current) = pending.pop() {
            if !visited.insert(current.clone()) {
                continue;
            }
            let template = self.get(&current).await?;
            rules.extend(template.rules);
            pending.extend(template.role_template_names);
        }
        Ok(rules)
    }
}

/// The parts of `rules` that touch `resources`, one rule per matched resource.
pub fn management_plane_rules(rules: &[PolicyRule], resources: &[(&str, &str)]) -> Vec<PolicyRule> {
    let mut granted: Vec<PolicyRule> = Vec::new();
    for rule in rules {
        for (resource, group) in resources {
            let group_matches = rule.api_groups.iter().any(|g| g == "*" || g == group);
            let resource_matches = rule.resources.iter().any(|r| r == "*" || r == resource);
            if !(group_matches && resource_matches) {
                continue;
            }
            let candidate = PolicyRule {
                verbs: rule.verbs.clone(),
                api_groups: vec![group.to_string()],
                resources: vec![resource.to_string()],
                resource_names: rule.resource_names.clone(),
            };
            if !granted.contains(&candidate) {
                granted.push(candidate);
            }
        }
    }
    granted
}

pub fn to_kube_rule(rule: &PolicyRule) -> KubePolicyRule {
    KubePolicyRule {
        verbs: rule.verbs.clone(),
        api_groups: Some(rule.api_groups.clone()),
        resources: Some(rule.resources.clone()),
        resource_names: (!rule.resource_names.is_empty()).then(|| rule.resource_names.clone()),
        non_resource_urls: None,
    }
}

/// Rule letting members read, or owners manage, one named record.
pub fn membership_rule(resource: &str, name: &str, owner: bool) -> KubePolicyRule {
    let verbs = if owner { vec!["*".to_string()] } else { vec!["get".to_string()] };
    KubePolicyRule {
        verbs,
        api_groups: Some(vec!["management.cattle.io".to_string()]),
        resources: Some(vec![resource.to_string()]),
        resource_names: Some(vec![name.to_string()]),
        non_resource_urls: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ObjectMeta;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    fn template(name: &str, inherits: &[&str], rules: Vec<PolicyRule>) -> RoleTemplate {
        RoleTemplate {
            metadata: ObjectMeta::named(name),
            context: "cluster".to_string(),
            rules,
            role_template_names: inherits.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    async fn resolver(templates: Vec<RoleTemplate>) -> RoleResolver {
        let store: SharedStore<RoleTemplate> = Arc::new(MemoryStore::new());
        for t in templates {
            store.create(t).await.unwrap();
        }
        RoleResolver::new(store)
    }

    #[tokio::test]
    async fn ownership_follows_inheritance_through_cycles() {
        let resolver = resolver(vec![
            template(CLUSTER_OWNER, &[], vec![]),
            template("cloned-owner", &["middle"], vec![]),
            template("middle", &["cloned-owner", CLUSTER_OWNER], vec![]),
            template("loop-a", &["loop-b"], vec![]),
            template("loop-b", &["loop-a"], vec![]),
        ])
        .await;

        assert!(resolver.is_owner_role("cloned-owner").await.unwrap());
        assert!(!resolver.is_owner_role("loop-a").await.unwrap());
        assert!(matches!(
            resolver.is_owner_role("missing").await.unwrap_err(),
            RbacError::RoleTemplateNotFound(_)
        ));
    }

    #[tokio::test]
    async fn inherited_rules_are_gathered_once() {
        let resolver = resolver(vec![
            template("nodes-view", &[], vec![PolicyRule::new(&["get"], &["management.cattle.io"], &["nodes"])]),
            template("member", &["nodes-view", "nodes-view"], vec![PolicyRule::new(&["list"], &["*"], &["projects"])]),
        ])
        .await;
        let rules = resolver.rules("member").await.unwrap();
        assert_eq!(rules.len(), 2);
    }

    #[test]
    fn wildcards_expand_to_the_resource_set() {
        let rules = vec![
            PolicyRule::new(&["*"], &["management.cattle.io"], &["*"]),
            PolicyRule::new(&["get"], &[""], &["pods"]),
        ];
        let granted = management_plane_rules(&rules, PROJECT_MANAGEMENT_PLANE_RESOURCES);
        let resources: Vec<&str> = granted.iter().map(|r| r.resources[0].as_str()).collect();
        assert_eq!(
            resources,
            vec!["projectcatalogs", "projectroletemplatebindings", "catalogtemplates", "catalogtemplateversions"]
        );
    }
}
