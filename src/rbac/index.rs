use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, RoleBinding, Subject};
use kube::Resource;

pub const RB_BY_OWNER_INDEX: &str = "auth.management.cattle.io/rb-by-owner";
pub const RB_BY_ROLE_AND_SUBJECT_INDEX: &str = "auth.management.cattle.io/crb-by-role-and-subject";

/// UIDs of the records owning a role binding.
pub fn rb_by_owner(rb: &RoleBinding) -> Vec<String> {
    rb.meta()
        .owner_references
        .iter()
        .flatten()
        .map(|o| o.uid.clone())
        .collect()
}

pub fn role_subject_key(role_name: &str, subject: &Subject) -> String {
    format!("{}.{}.{}", role_name, subject.kind, subject.name)
}

fn role_subject_keys(role_name: &str, subjects: Option<&Vec<Subject>>) -> Vec<String> {
    subjects
        .into_iter()
        .flatten()
        .map(|s| role_subject_key(role_name, s))
        .collect()
}

pub fn crb_by_role_and_subject(crb: &ClusterRoleBinding) -> Vec<String> {
    role_subject_keys(&crb.role_ref.name, crb.subjects.as_ref())
}

pub fn rb_by_role_and_subject(rb: &RoleBinding) -> Vec<String> {
    role_subject_keys(&rb.role_ref.name, rb.subjects.as_ref())
}
