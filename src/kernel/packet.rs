use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use k8s_openapi::api::core::v1 as corev1;

use crate::k8s::KubernetesApi;
use crate::kernel::engine::Engine;
use crate::kernel::step::StepRef;
use crate::pod::model::PodModelBuilder;
use crate::pod::watcher::PodAwaiter;
use crate::snapshot::{DomainSnapshot, DomainTopology, Introspector, TopologyCache};
use crate::tuning::Tuning;

/// The context bag carried through every step of one fiber. Steps mutate
/// it in sequence; it is never shared between fibers except through an
/// explicit [`Packet::copy`], taken when a deferred roll is enqueued.
#[derive(Clone)]
pub struct Packet {
    /// The snapshot this fiber reconciles, fixed for its whole lifetime.
    pub domain: Arc<DomainSnapshot>,
    /// Set once introspection has produced the domain configuration.
    pub topology: Option<Arc<DomainTopology>>,
    /// Cluster the currently running pod step belongs to.
    pub cluster_name: Option<String>,
    /// True while the domain home must be re-introspected before the
    /// admin server may be replaced. Set at submission when the declared
    /// introspect version has moved past the cached introspection;
    /// cleared once the introspector has actually run.
    pub introspection_requested: bool,
    /// Environment entries contributed by introspection, appended after
    /// the per-server variables.
    pub env_overrides: Vec<corev1::EnvVar>,
    /// Managed servers awaiting replacement, drained by the roll
    /// coordinator. Shared by packet copies so deferred work and the
    /// drain point see one map; guarded by its own lock.
    pub servers_to_roll: Arc<Mutex<BTreeMap<String, RollRequest>>>,
    pub components: Components,
}

/// A deferred replacement of one managed server: the cycle chain to run
/// and the packet state captured when the decision was made.
pub struct RollRequest {
    pub cluster: Option<String>,
    pub step: StepRef,
    pub packet: Packet,
}

/// Handles to the collaborating services, injected at construction and
/// passed through the packet instead of living in process-wide globals.
#[derive(Clone)]
pub struct Components {
    pub api: Arc<dyn KubernetesApi>,
    pub awaiter: Arc<PodAwaiter>,
    pub pod_models: Arc<dyn PodModelBuilder>,
    pub introspector: Arc<dyn Introspector>,
    pub topology_cache: TopologyCache,
    pub engine: Engine,
    pub tuning: Arc<Tuning>,
    pub operator_version: String,
}

impl Packet {
    pub fn new(domain: Arc<DomainSnapshot>, components: Components) -> Packet {
        Packet {
            domain,
            topology: None,
            cluster_name: None,
            introspection_requested: false,
            env_overrides: Vec::new(),
            servers_to_roll: Arc::new(Mutex::new(BTreeMap::new())),
            components,
        }
    }

    /// Snapshot of this packet for a deferred sub-workflow.
    pub fn copy(&self) -> Packet {
        self.clone()
    }

    pub fn topology(&self) -> Arc<DomainTopology> {
        self.topology
            .clone()
            .expect("topology is established before any pod step runs")
    }

    /// Registers a managed server for deferred replacement. Keyed by
    /// server name; re-registration replaces the previous request.
    pub fn defer_roll(&self, server: &str, request: RollRequest) {
        self.servers_to_roll
            .lock()
            .unwrap()
            .insert(server.to_string(), request);
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::k8s::ApiFailure;
    use crate::pod::model::StandardPodModels;
    use crate::snapshot::{ServerSpec, SpecDerivedTopology};
    use async_trait::async_trait;

    struct NullKubernetes;

    #[async_trait]
    impl KubernetesApi for NullKubernetes {
        async fn read_pod(
            &self,
            _namespace: &str,
            _name: &str,
        ) -> Result<Option<corev1::Pod>, ApiFailure> {
            Ok(None)
        }

        async fn create_pod(
            &self,
            _namespace: &str,
            pod: &corev1::Pod,
        ) -> Result<corev1::Pod, ApiFailure> {
            Ok(pod.clone())
        }

        async fn patch_pod(
            &self,
            _namespace: &str,
            _name: &str,
            _patch: &json_patch::Patch,
        ) -> Result<corev1::Pod, ApiFailure> {
            Ok(corev1::Pod::default())
        }

        async fn delete_pod(
            &self,
            _namespace: &str,
            _name: &str,
            _grace_period_seconds: i64,
        ) -> Result<(), ApiFailure> {
            Ok(())
        }

        async fn list_pods(
            &self,
            _namespace: &str,
            _label_selector: &str,
        ) -> Result<Vec<corev1::Pod>, ApiFailure> {
            Ok(Vec::new())
        }

        async fn replace_domain_status(
            &self,
            _namespace: &str,
            _name: &str,
            _status: &crate::domain::DomainStatus,
        ) -> Result<(), ApiFailure> {
            Ok(())
        }
    }

    pub(crate) fn test_snapshot() -> DomainSnapshot {
        DomainSnapshot {
            domain_uid: "uid1".to_string(),
            namespace: "weblogic".to_string(),
            resource_name: "sample".to_string(),
            resource_uid: "6b9c".to_string(),
            generation: 1,
            image: "store/weblogic:12.2.1.4".to_string(),
            image_pull_policy: "IfNotPresent".to_string(),
            introspect_version: None,
            admin_server: ServerSpec::default(),
            clusters: Vec::new(),
        }
    }

    impl Packet {
        pub(crate) fn for_tests() -> Packet {
            let tuning = Arc::new(Tuning::default());
            let api: Arc<dyn KubernetesApi> = Arc::new(NullKubernetes);
            let components = Components {
                api: api.clone(),
                awaiter: Arc::new(PodAwaiter::new(api, "weblogic")),
                pod_models: Arc::new(StandardPodModels::new(tuning.clone(), "0.1.0", None)),
                introspector: Arc::new(SpecDerivedTopology),
                topology_cache: TopologyCache::default(),
                engine: Engine::new(2),
                tuning,
                operator_version: "0.1.0".to_string(),
            };
            Packet::new(Arc::new(test_snapshot()), components)
        }
    }
}
