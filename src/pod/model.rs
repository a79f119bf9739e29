use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;

use crate::kernel::packet::Packet;
use crate::labels::{
    CLUSTER_NAME_LABEL, DOMAIN_UID_LABEL, INTROSPECT_VERSION_ANNOTATION, OPERATOR_VERSION_LABEL,
    POD_HASH_ANNOTATION, SERVER_NAME_LABEL,
};
use crate::pod::hash::pod_hash;
use crate::pod::ServerIdentity;
use crate::snapshot::{DomainSnapshot, ServerTopology};
use crate::tuning::Tuning;

/// Env var carrying the operator's internal certificate into the admin
/// server pod. Lives outside the content hash: rotating the certificate
/// must never roll the pod.
pub const INTERNAL_OPERATOR_CERT_ENV: &str = "INTERNAL_OPERATOR_CERT";

const WEBLOGIC_CONTAINER_NAME: &str = "weblogic-server";
const START_SERVER_COMMAND: &str = "/weblogic-operator/scripts/startServer.sh";
const SCRIPTS_VOLUME_NAME: &str = "weblogic-scripts";
const SCRIPTS_CONFIGMAP_NAME: &str = "weblogic-operator-scripts";
const SCRIPTS_MOUNT_PATH: &str = "/weblogic-operator/scripts";

/// A desired pod together with the content hash of its hashed fields. The
/// pod itself already carries the full non-hashed overlay and is ready to
/// POST.
#[derive(Clone)]
pub struct DesiredPod {
    pub pod: corev1::Pod,
    pub hash: String,
}

/// Yields the desired pod for one server. The kernel consumes this seam;
/// the standard implementation below is the production translation.
pub trait PodModelBuilder: Send + Sync {
    fn desired_pod(
        &self,
        packet: &Packet,
        identity: &ServerIdentity,
        scan: &ServerTopology,
    ) -> DesiredPod;
}

pub struct StandardPodModels {
    tuning: Arc<Tuning>,
    operator_version: String,
    operator_cert: Option<String>,
}

impl StandardPodModels {
    pub fn new(
        tuning: Arc<Tuning>,
        operator_version: &str,
        operator_cert: Option<String>,
    ) -> StandardPodModels {
        StandardPodModels {
            tuning,
            operator_version: operator_version.to_string(),
            operator_cert,
        }
    }
}

impl PodModelBuilder for StandardPodModels {
    fn desired_pod(
        &self,
        packet: &Packet,
        identity: &ServerIdentity,
        scan: &ServerTopology,
    ) -> DesiredPod {
        let pod = build_hashed_pod(&packet.domain, identity, scan, &packet.env_overrides);
        let hash = pod_hash(&pod);
        let pod = self.with_non_hashed_elements(pod, &packet.domain, identity, &hash);
        DesiredPod { pod, hash }
    }
}

impl StandardPodModels {
    /// Stamps the fields that never participate in the hash: ownership,
    /// the hash annotation itself, the introspect version the pod was
    /// built against, the user's pod labels and annotations, the operator
    /// version, probe timings from tuning, and the internal certificate
    /// for the admin server. Changes here patch the live pod in place;
    /// they never roll it.
    fn with_non_hashed_elements(
        &self,
        mut pod: corev1::Pod,
        domain: &DomainSnapshot,
        identity: &ServerIdentity,
        hash: &str,
    ) -> corev1::Pod {
        let server_spec = domain.server_spec(identity.cluster.as_deref());

        pod.metadata.owner_references = Some(vec![domain_owner_reference(domain)]);
        let annotations = pod.metadata.annotations.get_or_insert_with(BTreeMap::new);
        for (key, value) in &server_spec.annotations {
            annotations.insert(key.clone(), value.clone());
        }
        annotations.insert(POD_HASH_ANNOTATION.to_string(), hash.to_string());
        if let Some(version) = &domain.introspect_version {
            annotations.insert(INTROSPECT_VERSION_ANNOTATION.to_string(), version.clone());
        }
        let labels = pod.metadata.labels.get_or_insert_with(BTreeMap::new);
        for (key, value) in &server_spec.labels {
            labels.entry(key.clone()).or_insert_with(|| value.clone());
        }
        labels.insert(
            OPERATOR_VERSION_LABEL.to_string(),
            self.operator_version.clone(),
        );

        if let Some(spec) = pod.spec.as_mut() {
            if let Some(container) = spec
                .containers
                .iter_mut()
                .find(|c| c.name == WEBLOGIC_CONTAINER_NAME)
            {
                if let Some(probe) = container.readiness_probe.as_mut() {
                    probe.initial_delay_seconds =
                        Some(self.tuning.readiness_probe_initial_delay_seconds);
                    probe.period_seconds = Some(self.tuning.readiness_probe_period_seconds);
                    probe.timeout_seconds = Some(self.tuning.readiness_probe_timeout_seconds);
                }
                if let Some(probe) = container.liveness_probe.as_mut() {
                    probe.initial_delay_seconds =
                        Some(self.tuning.liveness_probe_initial_delay_seconds);
                    probe.period_seconds = Some(self.tuning.liveness_probe_period_seconds);
                    probe.timeout_seconds = Some(self.tuning.liveness_probe_timeout_seconds);
                }
                if identity.cluster.is_none() {
                    if let Some(cert) = &self.operator_cert {
                        container
                            .env
                            .get_or_insert_with(Vec::new)
                            .push(corev1::EnvVar {
                                name: INTERNAL_OPERATOR_CERT_ENV.to_string(),
                                value: Some(cert.clone()),
                                ..corev1::EnvVar::default()
                            });
                    }
                }
            }
        }

        pod
    }
}

/// Builds the hashed portion of the pod: everything whose change forces a
/// roll. Only the identity labels participate; user labels and
/// annotations ride in the overlay.
fn build_hashed_pod(
    domain: &DomainSnapshot,
    identity: &ServerIdentity,
    scan: &ServerTopology,
    env_overrides: &[corev1::EnvVar],
) -> corev1::Pod {
    let server_spec = domain.server_spec(identity.cluster.as_deref());

    let mut labels = BTreeMap::new();
    labels.insert(DOMAIN_UID_LABEL.to_string(), domain.domain_uid.clone());
    labels.insert(SERVER_NAME_LABEL.to_string(), identity.server.clone());
    if let Some(cluster) = &identity.cluster {
        labels.insert(CLUSTER_NAME_LABEL.to_string(), cluster.clone());
    }

    let mut env = server_spec.env.clone();
    for var in env_overrides {
        env.retain(|e| e.name != var.name);
        env.push(var.clone());
    }
    env.push(corev1::EnvVar {
        name: "DOMAIN_UID".to_string(),
        value: Some(domain.domain_uid.clone()),
        ..corev1::EnvVar::default()
    });
    env.push(corev1::EnvVar {
        name: "SERVER_NAME".to_string(),
        value: Some(identity.server.clone()),
        ..corev1::EnvVar::default()
    });
    env.push(corev1::EnvVar {
        name: "ADMIN_PORT".to_string(),
        value: Some(scan.admin_port.unwrap_or(scan.listen_port).to_string()),
        ..corev1::EnvVar::default()
    });

    let container = corev1::Container {
        name: WEBLOGIC_CONTAINER_NAME.to_string(),
        image: Some(domain.image.clone()),
        image_pull_policy: Some(domain.image_pull_policy.clone()),
        command: Some(vec![START_SERVER_COMMAND.to_string()]),
        ports: Some(vec![corev1::ContainerPort {
            container_port: scan.listen_port,
            name: Some("default".to_string()),
            protocol: Some("TCP".to_string()),
            ..corev1::ContainerPort::default()
        }]),
        env: Some(env),
        resources: resource_requirements(server_spec),
        readiness_probe: Some(corev1::Probe {
            http_get: Some(corev1::HTTPGetAction {
                path: Some("/weblogic/ready".to_string()),
                port: k8s_openapi::apimachinery::pkg::util::intstr::IntOrString::Int(
                    scan.listen_port,
                ),
                ..corev1::HTTPGetAction::default()
            }),
            ..corev1::Probe::default()
        }),
        liveness_probe: Some(corev1::Probe {
            exec: Some(corev1::ExecAction {
                command: Some(vec![format!("{SCRIPTS_MOUNT_PATH}/livenessProbe.sh")]),
            }),
            ..corev1::Probe::default()
        }),
        volume_mounts: Some(vec![corev1::VolumeMount {
            name: SCRIPTS_VOLUME_NAME.to_string(),
            mount_path: SCRIPTS_MOUNT_PATH.to_string(),
            read_only: Some(true),
            ..corev1::VolumeMount::default()
        }]),
        ..corev1::Container::default()
    };

    corev1::Pod {
        metadata: metav1::ObjectMeta {
            name: Some(identity.pod_name()),
            namespace: Some(domain.namespace.clone()),
            labels: Some(labels),
            ..metav1::ObjectMeta::default()
        },
        spec: Some(corev1::PodSpec {
            containers: vec![container],
            volumes: Some(vec![corev1::Volume {
                name: SCRIPTS_VOLUME_NAME.to_string(),
                config_map: Some(corev1::ConfigMapVolumeSource {
                    name: Some(SCRIPTS_CONFIGMAP_NAME.to_string()),
                    default_mode: Some(0o555),
                    ..corev1::ConfigMapVolumeSource::default()
                }),
                ..corev1::Volume::default()
            }]),
            ..corev1::PodSpec::default()
        }),
        status: None,
    }
}

fn resource_requirements(
    server_spec: &crate::snapshot::ServerSpec,
) -> Option<corev1::ResourceRequirements> {
    if server_spec.resource_requests.is_empty() && server_spec.resource_limits.is_empty() {
        return None;
    }
    let quantities = |map: &BTreeMap<String, String>| {
        if map.is_empty() {
            None
        } else {
            Some(
                map.iter()
                    .map(|(k, v)| (k.clone(), Quantity(v.clone())))
                    .collect::<BTreeMap<_, _>>(),
            )
        }
    };
    Some(corev1::ResourceRequirements {
        requests: quantities(&server_spec.resource_requests),
        limits: quantities(&server_spec.resource_limits),
    })
}

fn domain_owner_reference(domain: &DomainSnapshot) -> metav1::OwnerReference {
    metav1::OwnerReference {
        api_version: "weblogic.oracle/v9".to_string(),
        kind: "Domain".to_string(),
        name: domain.resource_name.clone(),
        uid: domain.resource_uid.clone(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::packet::Packet;
    use crate::snapshot::ServerTopology;

    fn admin_scan() -> ServerTopology {
        ServerTopology {
            name: "admin-server".to_string(),
            listen_port: 7001,
            admin_port: None,
        }
    }

    #[tokio::test]
    async fn desired_pod_carries_identity_labels_and_hash_annotation() {
        let packet = Packet::for_tests();
        let identity = ServerIdentity::new(&packet.domain.domain_uid, None, "admin-server");
        let desired =
            packet
                .components
                .pod_models
                .desired_pod(&packet, &identity, &admin_scan());

        let labels = desired.pod.metadata.labels.as_ref().unwrap();
        assert_eq!(labels.get(DOMAIN_UID_LABEL).unwrap(), "uid1");
        assert_eq!(labels.get(SERVER_NAME_LABEL).unwrap(), "admin-server");
        assert!(!labels.contains_key(CLUSTER_NAME_LABEL));

        let annotations = desired.pod.metadata.annotations.as_ref().unwrap();
        assert_eq!(annotations.get(POD_HASH_ANNOTATION).unwrap(), &desired.hash);
        assert!(desired.pod.metadata.owner_references.is_some());
    }

    #[tokio::test]
    async fn overlay_does_not_disturb_the_hash() {
        let packet = Packet::for_tests();
        let identity = ServerIdentity::new(&packet.domain.domain_uid, None, "admin-server");
        let desired =
            packet
                .components
                .pod_models
                .desired_pod(&packet, &identity, &admin_scan());

        // Recomputing the hash over the fully overlaid pod must reproduce
        // the annotation value.
        assert_eq!(pod_hash(&desired.pod), desired.hash);
    }

    #[tokio::test]
    async fn probe_timings_come_from_tuning() {
        let packet = Packet::for_tests();
        let identity = ServerIdentity::new(&packet.domain.domain_uid, None, "admin-server");
        let desired =
            packet
                .components
                .pod_models
                .desired_pod(&packet, &identity, &admin_scan());

        let container = &desired.pod.spec.as_ref().unwrap().containers[0];
        let readiness = container.readiness_probe.as_ref().unwrap();
        assert_eq!(readiness.initial_delay_seconds, Some(30));
        assert_eq!(readiness.period_seconds, Some(5));
    }
}
