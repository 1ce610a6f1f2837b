use crate::models::cluster::{node_condition, node_role, Node, RkeConfigNode};

use super::ProvisionError;

const PROVISIONING: &str = "Provisioning";

/// Builds the RKE node list from the machines of one cluster.
///
/// Machines being deleted or without roles are skipped. Control-plane and etcd
/// machines still provisioning, or a cluster lacking a provisioned etcd and
/// control-plane machine, yield a `Forget` error.
pub fn reconcile_rke_nodes(machines: &[Node]) -> Result<Vec<RkeConfigNode>, ProvisionError> {
    let mut etcd = false;
    let mut controlplane = false;
    let mut nodes = Vec::new();

    for machine in machines {
        if machine.metadata.deletion_timestamp.is_some() {
            continue;
        }

        let conditions = &machine.status.conditions;
        let unknown = conditions.get(node_condition::PROVISIONED).is_none()
            || conditions.is_unknown(node_condition::PROVISIONED);
        if unknown && (machine.spec.etcd || machine.spec.control_plane) {
            return Err(ProvisionError::forget(
                PROVISIONING,
                format!(
                    "waiting for {} to finish provisioning",
                    machine.spec.requested_hostname
                ),
            ));
        }

        let Some(config) = &machine.status.node_config else {
            continue;
        };
        if config.role.is_empty() || !conditions.is_true(node_condition::PROVISIONED) {
            continue;
        }

        etcd |= config.has_role(node_role::ETCD);
        controlplane |= config.has_role(node_role::CONTROL_PLANE);

        let mut node = config.clone();
        if node.user.is_empty() {
            node.user = "root".to_string();
        }
        if node.port.is_empty() {
            node.port = "22".to_string();
        }
        if node.node_name.is_empty() {
            node.node_name = format!("{}:{}", machine.metadata.namespace, machine.metadata.name);
        }
        nodes.push(node);
    }

    if !etcd || !controlplane {
        return Err(ProvisionError::forget(
            PROVISIONING,
            "waiting for etcd and controlplane nodes to be registered",
        ));
    }

    nodes.sort_by(|a, b| a.node_name.cmp(&b.node_name));
    Ok(nodes)
}

/// Drops worker-only nodes from the list handed to the engine.
pub fn without_worker_only(nodes: &[RkeConfigNode]) -> Vec<RkeConfigNode> {
    nodes
        .iter()
        .filter(|n| !(n.role.len() == 1 && n.role[0] == node_role::WORKER))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::ErrorClass;
    use crate::models::cluster::NodeSpec;
    use crate::models::ObjectMeta;

    fn machine(name: &str, roles: &[&str], provisioned: bool) -> Node {
        let mut node = Node {
            metadata: ObjectMeta::namespaced("c-1", name),
            spec: NodeSpec {
                etcd: roles.contains(&node_role::ETCD),
                control_plane: roles.contains(&node_role::CONTROL_PLANE),
                worker: roles.contains(&node_role::WORKER),
                requested_hostname: name.to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        node.status.node_config = Some(RkeConfigNode {
            address: format!("10.0.0.{}", name.len()),
            role: roles.iter().map(|r| r.to_string()).collect(),
            ..Default::default()
        });
        if provisioned {
            node.status.conditions.set_true(node_condition::PROVISIONED);
        } else {
            node.status.conditions.set_unknown(node_condition::PROVISIONED);
        }
        node
    }

    #[test]
    fn worker_only_cluster_waits() {
        let machines = vec![
            machine("w-1", &[node_role::WORKER], true),
            machine("w-2", &[node_role::WORKER], true),
        ];
        let err = reconcile_rke_nodes(&machines).unwrap_err();
        assert!(err.is_forget());
        assert_eq!(err.reason(), Some("Provisioning"));
    }

    #[test]
    fn unprovisioned_control_plane_waits() {
        let machines = vec![
            machine("cp", &[node_role::ETCD, node_role::CONTROL_PLANE], false),
            machine("w-1", &[node_role::WORKER], false),
        ];
        let err = reconcile_rke_nodes(&machines).unwrap_err();
        assert_eq!(err.to_string(), "waiting for cp to finish provisioning");
    }

    #[test]
    fn nodes_are_defaulted_and_sorted() {
        let mut deleted = machine("a-gone", &[node_role::ETCD], true);
        deleted.metadata.deletion_timestamp = Some(chrono::Utc::now());
        let machines = vec![
            machine("m-worker", &[node_role::WORKER], true),
            machine("m-cp", &[node_role::ETCD, node_role::CONTROL_PLANE], true),
            deleted,
        ];
        let nodes = reconcile_rke_nodes(&machines).unwrap();
        let names: Vec<&str> = nodes.iter().map(|n| n.node_name.as_str()).collect();
        assert_eq!(names, vec!["c-1:m-cp", "c-1:m-worker"]);
        assert_eq!(nodes[0].user, "root");
        assert_eq!(nodes[0].port, "22");

        let filtered = without_worker_only(&nodes);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].node_name, "c-1:m-cp");
    }
}
