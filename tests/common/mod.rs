//! In-memory Kubernetes API used by the scenario tests. Pods live in a
//! map; lifecycle transitions (readiness, deletion) are pushed into the
//! pod awaiter the same way the real watch stream would.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1 as corev1;

use weblogic_operator::domain::DomainStatus;
use weblogic_operator::k8s::{ApiFailure, KubernetesApi};
use weblogic_operator::kernel::engine::Engine;
use weblogic_operator::pod::model::StandardPodModels;
use weblogic_operator::pod::watcher::{PodAwaiter, PodWatchEvent};
use weblogic_operator::pod::{is_ready, pod_name};
use weblogic_operator::error::OperatorError;
use weblogic_operator::reconciler::DomainReconciler;
use weblogic_operator::snapshot::{
    ClusterSnapshot, DomainSnapshot, DomainTopology, Introspector, ServerSpec,
    SpecDerivedTopology,
};
use weblogic_operator::tuning::Tuning;

pub const NAMESPACE: &str = "weblogic";
pub const DOMAIN_UID: &str = "uid1";

#[derive(Default)]
pub struct FakeKubernetes {
    pods: Mutex<HashMap<String, corev1::Pod>>,
    awaiter: Mutex<Option<Arc<PodAwaiter>>>,
    statuses: Mutex<Vec<DomainStatus>>,

    /// Newly created pods become Ready shortly after creation.
    pub auto_ready: AtomicBool,
    /// Deletions remove the pod and deliver a Deleted watch event. Turned
    /// off to simulate a dropped watch stream.
    pub deliver_delete_events: AtomicBool,
    /// Deletions only mark the pod as terminating; the test finishes the
    /// job by hand.
    pub graceful_delete: AtomicBool,
    /// Next patch attempt answers 409.
    pub fail_next_patch: AtomicBool,

    read_latency: Mutex<Duration>,

    pub creates: Mutex<Vec<corev1::Pod>>,
    pub deletes: Mutex<Vec<String>>,
    pub patches: Mutex<Vec<(String, json_patch::Patch)>>,

    /// Pod names whose availability is being audited, with the running
    /// maximum of simultaneously absent-or-unready members.
    watched: Mutex<HashSet<String>>,
    pub max_concurrent_unready: AtomicUsize,

    self_ref: Mutex<Option<Weak<FakeKubernetes>>>,
}

impl FakeKubernetes {
    pub fn new() -> Arc<FakeKubernetes> {
        let fake = Arc::new(FakeKubernetes::default());
        fake.auto_ready.store(true, Ordering::SeqCst);
        fake.deliver_delete_events.store(true, Ordering::SeqCst);
        *fake.self_ref.lock().unwrap() = Some(Arc::downgrade(&fake));
        fake
    }

    pub fn attach_awaiter(&self, awaiter: Arc<PodAwaiter>) {
        *self.awaiter.lock().unwrap() = Some(awaiter);
    }

    pub fn set_read_latency(&self, latency: Duration) {
        *self.read_latency.lock().unwrap() = latency;
    }

    /// Starts auditing the named pods and resets the unready high-water
    /// mark.
    pub fn begin_watching(&self, names: impl IntoIterator<Item = String>) {
        *self.watched.lock().unwrap() = names.into_iter().collect();
        self.max_concurrent_unready.store(0, Ordering::SeqCst);
        self.update_unready_gauge();
    }

    pub fn clear_recorders(&self) {
        self.creates.lock().unwrap().clear();
        self.deletes.lock().unwrap().clear();
        self.patches.lock().unwrap().clear();
    }

    pub fn pod(&self, name: &str) -> Option<corev1::Pod> {
        self.pods.lock().unwrap().get(name).cloned()
    }

    pub fn pod_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pods.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn pod_image(&self, name: &str) -> Option<String> {
        self.pod(name)?
            .spec?
            .containers
            .first()?
            .image
            .clone()
    }

    /// Removes the pod without delivering any watch event, as if the
    /// deletion happened while the stream was down.
    pub fn remove_pod_silently(&self, name: &str) {
        self.pods.lock().unwrap().remove(name);
        self.update_unready_gauge();
    }

    /// Hands the current pod list to the awaiter as a re-list, the way a
    /// reconnecting watch does.
    pub fn deliver_relist(&self) {
        let pods: Vec<corev1::Pod> = self.pods.lock().unwrap().values().cloned().collect();
        if let Some(awaiter) = self.awaiter.lock().unwrap().clone() {
            awaiter.on_event(PodWatchEvent::Relisted(pods));
        }
    }

    fn emit(&self, event: PodWatchEvent) {
        if let Some(awaiter) = self.awaiter.lock().unwrap().clone() {
            awaiter.on_event(event);
        }
    }

    fn update_unready_gauge(&self) {
        let watched = self.watched.lock().unwrap();
        if watched.is_empty() {
            return;
        }
        let pods = self.pods.lock().unwrap();
        let unready = watched
            .iter()
            .filter(|name| pods.get(*name).map(|p| !is_ready(p)).unwrap_or(true))
            .count();
        self.max_concurrent_unready
            .fetch_max(unready, Ordering::SeqCst);
    }

    fn mark_ready(self: &Arc<Self>, name: &str) {
        let updated = {
            let mut pods = self.pods.lock().unwrap();
            match pods.get_mut(name) {
                Some(pod) if pod.metadata.deletion_timestamp.is_none() => {
                    pod.status = Some(corev1::PodStatus {
                        phase: Some("Running".to_string()),
                        conditions: Some(vec![corev1::PodCondition {
                            type_: "Ready".to_string(),
                            status: "True".to_string(),
                            ..corev1::PodCondition::default()
                        }]),
                        ..corev1::PodStatus::default()
                    });
                    Some(pod.clone())
                }
                _ => None,
            }
        };
        if let Some(pod) = updated {
            self.update_unready_gauge();
            self.emit(PodWatchEvent::Applied(pod));
        }
    }
}

#[async_trait]
impl KubernetesApi for FakeKubernetes {
    async fn read_pod(
        &self,
        _namespace: &str,
        name: &str,
    ) -> Result<Option<corev1::Pod>, ApiFailure> {
        let latency = *self.read_latency.lock().unwrap();
        if latency > Duration::ZERO {
            tokio::time::sleep(latency).await;
        }
        Ok(self.pods.lock().unwrap().get(name).cloned())
    }

    async fn create_pod(
        &self,
        _namespace: &str,
        pod: &corev1::Pod,
    ) -> Result<corev1::Pod, ApiFailure> {
        let name = pod_name(pod).to_string();
        {
            let mut pods = self.pods.lock().unwrap();
            if pods.contains_key(&name) {
                return Err(ApiFailure::AlreadyExists);
            }
            let mut stored = pod.clone();
            stored.status = Some(corev1::PodStatus {
                phase: Some("Pending".to_string()),
                ..corev1::PodStatus::default()
            });
            pods.insert(name.clone(), stored);
        }
        self.creates.lock().unwrap().push(pod.clone());
        self.update_unready_gauge();

        if self.auto_ready.load(Ordering::SeqCst) {
            let fake = self.strong_self();
            let ready_name = name;
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                fake.mark_ready(&ready_name);
            });
        }
        Ok(pod.clone())
    }

    async fn patch_pod(
        &self,
        _namespace: &str,
        name: &str,
        patch: &json_patch::Patch,
    ) -> Result<corev1::Pod, ApiFailure> {
        self.patches
            .lock()
            .unwrap()
            .push((name.to_string(), patch.clone()));
        if self.fail_next_patch.swap(false, Ordering::SeqCst) {
            return Err(ApiFailure::Conflict);
        }
        let mut pods = self.pods.lock().unwrap();
        let pod = pods.get_mut(name).ok_or(ApiFailure::NotFound)?;
        let mut doc = serde_json::to_value(&*pod)
            .map_err(|e| ApiFailure::Invalid(e.to_string()))?;
        json_patch::patch(&mut doc, patch).map_err(|e| ApiFailure::Invalid(e.to_string()))?;
        *pod = serde_json::from_value(doc).map_err(|e| ApiFailure::Invalid(e.to_string()))?;
        Ok(pod.clone())
    }

    async fn delete_pod(
        &self,
        _namespace: &str,
        name: &str,
        _grace_period_seconds: i64,
    ) -> Result<(), ApiFailure> {
        self.deletes.lock().unwrap().push(name.to_string());

        if self.graceful_delete.load(Ordering::SeqCst) {
            let mut pods = self.pods.lock().unwrap();
            if let Some(pod) = pods.get_mut(name) {
                pod.metadata.deletion_timestamp =
                    Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
                        k8s_openapi::chrono::Utc::now(),
                    ));
            }
            return Ok(());
        }

        let removed = self.pods.lock().unwrap().remove(name);
        self.update_unready_gauge();
        if let Some(pod) = removed {
            if self.deliver_delete_events.load(Ordering::SeqCst) {
                self.emit(PodWatchEvent::Deleted(pod));
            }
        }
        Ok(())
    }

    async fn list_pods(
        &self,
        _namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<corev1::Pod>, ApiFailure> {
        let selectors: Vec<(&str, Option<&str>)> = label_selector
            .split(',')
            .filter(|s| !s.is_empty())
            .map(|s| match s.split_once('=') {
                Some((k, v)) => (k, Some(v)),
                None => (s, None),
            })
            .collect();
        let pods = self.pods.lock().unwrap();
        Ok(pods
            .values()
            .filter(|pod| {
                let empty = BTreeMap::new();
                let labels = pod.metadata.labels.as_ref().unwrap_or(&empty);
                selectors.iter().all(|(key, value)| match value {
                    Some(v) => labels.get(*key).map(String::as_str) == Some(*v),
                    None => labels.contains_key(*key),
                })
            })
            .cloned()
            .collect())
    }

    async fn replace_domain_status(
        &self,
        _namespace: &str,
        _name: &str,
        status: &DomainStatus,
    ) -> Result<(), ApiFailure> {
        self.statuses.lock().unwrap().push(status.clone());
        Ok(())
    }
}

impl FakeKubernetes {
    fn strong_self(&self) -> Arc<FakeKubernetes> {
        self.self_ref
            .lock()
            .unwrap()
            .as_ref()
            .and_then(Weak::upgrade)
            .expect("fake constructed through FakeKubernetes::new")
    }
}

pub fn fast_tuning() -> Tuning {
    Tuning {
        readiness_wait_seconds: 10,
        deletion_wait_seconds: 10,
        roll_cycle_seconds: 20,
        unavailable_recheck_seconds: 1,
        api_retry_base_millis: 5,
        api_retry_max_millis: 20,
        ..Tuning::default()
    }
}

/// Counts introspector runs on top of the spec-derived topology, so tests
/// can tell a cache hit from an actual re-introspection.
#[derive(Default)]
pub struct CountingIntrospector {
    pub runs: AtomicUsize,
}

#[async_trait]
impl Introspector for CountingIntrospector {
    async fn introspect(
        &self,
        snapshot: &DomainSnapshot,
    ) -> Result<DomainTopology, OperatorError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        SpecDerivedTopology.introspect(snapshot).await
    }
}

/// A reconciler over the fake, with the namespace awaiter wired back into
/// it so pod transitions surface as watch events.
pub fn harness(fake: &Arc<FakeKubernetes>) -> Arc<DomainReconciler> {
    harness_with_introspector(fake, Arc::new(SpecDerivedTopology))
}

pub fn harness_with_introspector(
    fake: &Arc<FakeKubernetes>,
    introspector: Arc<dyn Introspector>,
) -> Arc<DomainReconciler> {
    let tuning = Arc::new(fast_tuning());
    let engine = Engine::new(2);
    let reconciler = DomainReconciler::new(
        engine,
        fake.clone(),
        introspector,
        Arc::new(StandardPodModels::new(tuning.clone(), "0.1.0-test", None)),
        tuning,
        "0.1.0-test",
        None,
    );
    fake.attach_awaiter(reconciler.awaiter(NAMESPACE));
    reconciler
}

pub fn snapshot(image: &str, generation: i64, clusters: &[(&str, i32, i32, i32)]) -> DomainSnapshot {
    DomainSnapshot {
        domain_uid: DOMAIN_UID.to_string(),
        namespace: NAMESPACE.to_string(),
        resource_name: "sample".to_string(),
        resource_uid: "6b9c".to_string(),
        generation,
        image: image.to_string(),
        image_pull_policy: "IfNotPresent".to_string(),
        introspect_version: None,
        admin_server: ServerSpec::default(),
        clusters: clusters
            .iter()
            .map(|(name, replicas, max_unavailable, size)| ClusterSnapshot {
                name: name.to_string(),
                replicas: *replicas,
                max_unavailable: *max_unavailable,
                size: Some(*size),
                server_template: ServerSpec::default(),
            })
            .collect(),
    }
}
