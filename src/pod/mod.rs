pub mod context;
pub mod hash;
pub mod model;
pub mod roll;
pub mod watcher;

use k8s_openapi::api::core::v1 as corev1;

use crate::labels::{
    CLUSTER_NAME_LABEL, DOMAIN_UID_LABEL, SERVER_NAME_LABEL, TO_BE_ROLLED_LABEL,
};

/// Identity of one server instance: the key of every per-server map. The
/// administrative server carries no cluster.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ServerIdentity {
    pub domain_uid: String,
    pub cluster: Option<String>,
    pub server: String,
}

impl ServerIdentity {
    pub fn new(domain_uid: &str, cluster: Option<&str>, server: &str) -> ServerIdentity {
        ServerIdentity {
            domain_uid: domain_uid.to_string(),
            cluster: cluster.map(str::to_string),
            server: server.to_string(),
        }
    }

    /// Pod name for this server, legal as a DNS-1123 label.
    pub fn pod_name(&self) -> String {
        format!("{}-{}", self.domain_uid, self.server)
            .to_ascii_lowercase()
            .replace('_', "-")
    }
}

/// True when the pod is Running with a Ready=True condition.
pub fn is_ready(pod: &corev1::Pod) -> bool {
    let status = match &pod.status {
        Some(status) => status,
        None => return false,
    };
    if status.phase.as_deref() != Some("Running") {
        return false;
    }
    status
        .conditions
        .iter()
        .flatten()
        .any(|c| c.type_ == "Ready" && c.status == "True")
}

pub fn is_failed(pod: &corev1::Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .map(|phase| phase == "Failed")
        .unwrap_or(false)
}

/// A deletion timestamp means the pod is on its way out; the kernel waits
/// for the removal instead of acting on it.
pub fn is_deleting(pod: &corev1::Pod) -> bool {
    pod.metadata.deletion_timestamp.is_some()
}

/// The roll coordinator owns any pod carrying the roll label; nothing else
/// recomputes its decision.
pub fn is_marked_for_roll(pod: &corev1::Pod) -> bool {
    pod.metadata
        .labels
        .as_ref()
        .map(|l| l.contains_key(TO_BE_ROLLED_LABEL))
        .unwrap_or(false)
}

pub fn pod_name(pod: &corev1::Pod) -> &str {
    pod.metadata.name.as_deref().unwrap_or("")
}

pub fn server_name(pod: &corev1::Pod) -> Option<&str> {
    pod_label(pod, SERVER_NAME_LABEL)
}

pub fn cluster_name(pod: &corev1::Pod) -> Option<&str> {
    pod_label(pod, CLUSTER_NAME_LABEL)
}

pub fn domain_uid(pod: &corev1::Pod) -> Option<&str> {
    pod_label(pod, DOMAIN_UID_LABEL)
}

fn pod_label<'a>(pod: &'a corev1::Pod, label: &str) -> Option<&'a str> {
    pod.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(label))
        .map(String::as_str)
}

pub fn domain_selector(domain_uid: &str) -> String {
    format!("{}={}", DOMAIN_UID_LABEL, domain_uid)
}

pub fn cluster_selector(domain_uid: &str, cluster: &str) -> String {
    format!(
        "{}={},{}={}",
        DOMAIN_UID_LABEL, domain_uid, CLUSTER_NAME_LABEL, cluster
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod_with_phase(phase: &str, ready: Option<&str>) -> corev1::Pod {
        corev1::Pod {
            status: Some(corev1::PodStatus {
                phase: Some(phase.to_string()),
                conditions: ready.map(|status| {
                    vec![corev1::PodCondition {
                        type_: "Ready".to_string(),
                        status: status.to_string(),
                        ..corev1::PodCondition::default()
                    }]
                }),
                ..corev1::PodStatus::default()
            }),
            ..corev1::Pod::default()
        }
    }

    #[test]
    fn ready_requires_running_phase_and_ready_condition() {
        assert!(is_ready(&pod_with_phase("Running", Some("True"))));
        assert!(!is_ready(&pod_with_phase("Running", Some("False"))));
        assert!(!is_ready(&pod_with_phase("Pending", Some("True"))));
        assert!(!is_ready(&pod_with_phase("Running", None)));
    }

    #[test]
    fn failed_phase_is_detected() {
        assert!(is_failed(&pod_with_phase("Failed", None)));
        assert!(!is_failed(&pod_with_phase("Running", None)));
    }

    #[test]
    fn pod_names_are_dns_safe() {
        let identity = ServerIdentity::new("uid1", Some("cluster-1"), "Managed_Server1");
        assert_eq!(identity.pod_name(), "uid1-managed-server1");
    }
}
