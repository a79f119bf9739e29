use k8s_openapi::api::core::v1 as corev1;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::labels::{CLUSTER_NAME_LABEL, DOMAIN_UID_LABEL, SERVER_NAME_LABEL};
use crate::pod::model::INTERNAL_OPERATOR_CERT_ENV;

/// Hex SHA-256 over the canonical encoding of the pod's hashed fields.
/// Stored in the pod-hash annotation; two pods with equal hashes are
/// structurally current with respect to each other.
pub fn pod_hash(pod: &corev1::Pod) -> String {
    let canonical = canonicalize(pod);
    let encoded = serde_json::to_vec(&canonical).unwrap_or_default();
    let digest = Sha256::digest(&encoded);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Reduces a pod to the fields that participate in its identity.
/// Server-defaulted fields, the operator's own bookkeeping labels and the
/// non-hashed overlay (owner refs, probe timings, operator cert) are
/// dropped, so a hash recomputed from a live pod matches the hash of the
/// desired model it was created from. serde_json keeps object keys
/// sorted, which makes the encoding stable under map-key reordering.
pub fn canonicalize(pod: &corev1::Pod) -> Value {
    let mut value = serde_json::to_value(pod).unwrap_or(Value::Null);

    if let Some(root) = value.as_object_mut() {
        root.remove("status");

        if let Some(metadata) = root.get_mut("metadata").and_then(Value::as_object_mut) {
            for server_owned in [
                "creationTimestamp",
                "deletionTimestamp",
                "deletionGracePeriodSeconds",
                "finalizers",
                "generateName",
                "generation",
                "managedFields",
                "ownerReferences",
                "resourceVersion",
                "selfLink",
                "uid",
            ] {
                metadata.remove(server_owned);
            }
            // Only the identity labels participate in the hash; user
            // labels, the roll marker and the version stamp are overlay.
            // Annotations never participate (the hash itself lives there).
            if let Some(labels) = metadata.get_mut("labels").and_then(Value::as_object_mut) {
                labels.retain(|key, _| {
                    key == DOMAIN_UID_LABEL || key == SERVER_NAME_LABEL || key == CLUSTER_NAME_LABEL
                });
            }
            metadata.remove("annotations");
        }

        if let Some(spec) = root.get_mut("spec").and_then(Value::as_object_mut) {
            for server_owned in [
                "nodeName",
                "serviceAccount",
                "serviceAccountName",
                "schedulerName",
                "priority",
                "enableServiceLinks",
                "dnsPolicy",
            ] {
                spec.remove(server_owned);
            }
            if let Some(containers) = spec.get_mut("containers").and_then(Value::as_array_mut) {
                for container in containers.iter_mut().filter_map(Value::as_object_mut) {
                    strip_probe_timings(container, "readinessProbe");
                    strip_probe_timings(container, "livenessProbe");
                    if let Some(env) = container.get_mut("env").and_then(Value::as_array_mut) {
                        env.retain(|var| {
                            var.get("name").and_then(Value::as_str)
                                != Some(INTERNAL_OPERATOR_CERT_ENV)
                        });
                    }
                }
            }
        }
    }

    value
}

fn strip_probe_timings(container: &mut serde_json::Map<String, Value>, name: &str) {
    let emptied = match container.get_mut(name).and_then(Value::as_object_mut) {
        Some(probe) => {
            for timing in [
                "initialDelaySeconds",
                "periodSeconds",
                "timeoutSeconds",
                "successThreshold",
                "failureThreshold",
            ] {
                probe.remove(timing);
            }
            probe.is_empty()
        }
        None => false,
    };
    // A probe that carried only timings is indistinguishable from no probe.
    if emptied {
        container.remove(name);
    }
}
