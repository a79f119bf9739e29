use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use kube::Client;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use crate::domain::{ConditionType, DomainCondition, DomainStatus};
use crate::error::OperatorError;
use crate::k8s::retry::with_transient_retries;
use crate::k8s::KubernetesApi;
use crate::kernel::engine::Engine;
use crate::kernel::fiber::{CompletionCallback, FiberOutcome};
use crate::kernel::gate::FiberGate;
use crate::kernel::packet::{Components, Packet};
use crate::kernel::step::{NextAction, Step, StepRef};
use crate::pod::context::{AdminPodStep, ManagedPodStep, WaitReadyStep};
use crate::pod::model::PodModelBuilder;
use crate::pod::roll::RollStep;
use crate::pod::watcher::PodAwaiter;
use crate::pod::{domain_selector, server_name};
use crate::snapshot::{DomainSnapshot, Introspector, ServerTopology, TopologyCache};
use crate::tuning::Tuning;

/// Upstream facade of the reconciliation kernel. One instance serves every
/// domain the operator manages; per-domain serialization is the gate's
/// business.
pub struct DomainReconciler {
    engine: Engine,
    gate: FiberGate,
    api: Arc<dyn KubernetesApi>,
    introspector: Arc<dyn Introspector>,
    pod_models: Arc<dyn PodModelBuilder>,
    tuning: Arc<Tuning>,
    operator_version: String,
    /// Client for namespace watch streams; absent under test, where
    /// events are injected directly into the awaiters.
    watch_client: Option<Client>,
    awaiters: Mutex<HashMap<String, Arc<PodAwaiter>>>,
    /// Introspection results from earlier fibers; a submission whose
    /// introspect version moved past its cache entry carries the
    /// re-introspection request into its packet.
    topology_cache: TopologyCache,
    /// Generations whose validation failed; resubmissions are dropped
    /// until the generation moves.
    failed_generations: Arc<Mutex<HashMap<String, i64>>>,
}

impl DomainReconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: Engine,
        api: Arc<dyn KubernetesApi>,
        introspector: Arc<dyn Introspector>,
        pod_models: Arc<dyn PodModelBuilder>,
        tuning: Arc<Tuning>,
        operator_version: &str,
        watch_client: Option<Client>,
    ) -> Arc<DomainReconciler> {
        Arc::new(DomainReconciler {
            gate: FiberGate::new(engine.clone()),
            engine,
            api,
            introspector,
            pod_models,
            tuning,
            operator_version: operator_version.to_string(),
            watch_client,
            awaiters: Mutex::new(HashMap::new()),
            topology_cache: TopologyCache::default(),
            failed_generations: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// The pod awaiter serving one namespace, created (and its watch
    /// stream started) on first use.
    pub fn awaiter(&self, namespace: &str) -> Arc<PodAwaiter> {
        let mut awaiters = self.awaiters.lock().unwrap();
        if let Some(awaiter) = awaiters.get(namespace) {
            return awaiter.clone();
        }
        let awaiter = Arc::new(PodAwaiter::new(self.api.clone(), namespace));
        if let Some(client) = &self.watch_client {
            awaiter.spawn_watch(client.clone());
        }
        awaiters.insert(namespace.to_string(), awaiter.clone());
        awaiter
    }

    /// Submits a reconciliation; any in-flight fiber for the same domain
    /// is cancelled so the freshest intent wins. The receiver resolves
    /// with the fiber's terminal outcome.
    pub fn submit(
        &self,
        snapshot: DomainSnapshot,
    ) -> oneshot::Receiver<Result<(), OperatorError>> {
        self.submit_gated(snapshot, true)
    }

    /// Submits only when no fiber currently owns the domain; used by the
    /// periodic relist tick so it never stomps live work.
    pub fn submit_if_idle(
        &self,
        snapshot: DomainSnapshot,
    ) -> oneshot::Receiver<Result<(), OperatorError>> {
        self.submit_gated(snapshot, false)
    }

    fn submit_gated(
        &self,
        snapshot: DomainSnapshot,
        always: bool,
    ) -> oneshot::Receiver<Result<(), OperatorError>> {
        let (tx, rx) = oneshot::channel();
        let key = gate_key(&snapshot.namespace, &snapshot.domain_uid);

        {
            let failed = self.failed_generations.lock().unwrap();
            if failed.get(&key) == Some(&snapshot.generation) {
                let _ = tx.send(Err(OperatorError::Validation(format!(
                    "generation {} of domain {} already failed validation",
                    snapshot.generation, snapshot.domain_uid
                ))));
                return rx;
            }
        }

        let components = Components {
            api: self.api.clone(),
            awaiter: self.awaiter(&snapshot.namespace),
            pod_models: self.pod_models.clone(),
            introspector: self.introspector.clone(),
            topology_cache: self.topology_cache.clone(),
            engine: self.engine.clone(),
            tuning: self.tuning.clone(),
            operator_version: self.operator_version.clone(),
        };
        let snapshot = Arc::new(snapshot);
        let mut packet = Packet::new(snapshot.clone(), components);
        // Reuse the last introspection where it is still current; a moved
        // introspect version marks the domain for re-introspection, taken
        // lazily on the admin server's replace path.
        if let Some((cached_version, topology)) = self.topology_cache.lookup(&key) {
            packet.introspection_requested = cached_version != snapshot.introspect_version;
            packet.topology = Some(topology);
        }
        let callback = self.completion_callback(snapshot, key.clone(), tx);

        if always {
            self.gate.start(&key, make_right_steps(), packet, callback);
        } else if self
            .gate
            .start_if_no_current(&key, make_right_steps(), packet, callback)
            .is_none()
        {
            // The channel sender was consumed by the refused callback;
            // nothing was started and the receiver reports closure.
        }
        rx
    }

    /// Terminal bookkeeping: write the Domain status conditions, remember
    /// validation failures, resolve the submitter's future. Cancellation
    /// stays silent; the replacement fiber is the recovery.
    fn completion_callback(
        &self,
        snapshot: Arc<DomainSnapshot>,
        key: String,
        tx: oneshot::Sender<Result<(), OperatorError>>,
    ) -> CompletionCallback {
        let api = self.api.clone();
        let engine = self.engine.clone();
        let tuning = self.tuning.clone();
        let failed_generations = self.failed_generations.clone();

        Box::new(move |_packet, outcome| {
            let result = match outcome {
                FiberOutcome::Completed => Ok(()),
                FiberOutcome::Failed(e) => Err(e),
            };

            match &result {
                Ok(()) => {
                    info!(domain = %snapshot.domain_uid, "domain reconciled");
                    failed_generations.lock().unwrap().remove(&key);
                }
                Err(e) if e.is_cancellation() => {}
                Err(e) => {
                    error!(domain = %snapshot.domain_uid, error = %e, "reconciliation failed");
                    if e.is_validation() {
                        failed_generations
                            .lock()
                            .unwrap()
                            .insert(key.clone(), snapshot.generation);
                    }
                }
            }

            if let Some(status) = status_for(&snapshot, &result) {
                let api = api.clone();
                let snapshot = snapshot.clone();
                engine.schedule(Duration::ZERO, async move {
                    let written = with_transient_retries(&tuning, "replace domain status", || {
                        api.replace_domain_status(
                            &snapshot.namespace,
                            &snapshot.resource_name,
                            &status,
                        )
                    })
                    .await;
                    if let Err(e) = written {
                        warn!(domain = %snapshot.domain_uid, error = %e, "could not write domain status");
                    }
                });
            }

            let _ = tx.send(result);
        })
    }

    /// Key → fiber state, for operators of the operator.
    pub fn status_snapshot(&self) -> HashMap<String, &'static str> {
        self.gate.current_fibers()
    }

    /// Cancels the fiber of a deleted domain; pods follow through owner
    /// references.
    pub fn cancel_domain(&self, namespace: &str, domain_uid: &str) {
        let key = gate_key(namespace, domain_uid);
        for handle in self.gate.handles() {
            if handle.key() == key {
                handle.cancel();
            }
        }
    }

    /// Cancels every fiber and waits for them to drain, up to `grace`.
    pub async fn shutdown(&self, grace: Duration) {
        let handles = self.gate.handles();
        for handle in &handles {
            handle.cancel();
        }
        let deadline = tokio::time::Instant::now() + grace;
        for handle in handles {
            while !handle.is_finished() {
                if tokio::time::Instant::now() >= deadline {
                    warn!(fiber = handle.id(), key = handle.key(), "fiber did not drain before shutdown deadline");
                    break;
                }
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        }
    }
}

fn gate_key(namespace: &str, domain_uid: &str) -> String {
    format!("{namespace}/{domain_uid}")
}

fn status_for(snapshot: &DomainSnapshot, result: &Result<(), OperatorError>) -> Option<DomainStatus> {
    let mut status = DomainStatus {
        observed_generation: Some(snapshot.generation),
        ..DomainStatus::default()
    };
    match result {
        Ok(()) => {
            status.upsert_condition(DomainCondition {
                type_: ConditionType::Completed,
                status: "True".to_string(),
                reason: None,
                message: None,
            });
            status.upsert_condition(DomainCondition {
                type_: ConditionType::Available,
                status: "True".to_string(),
                reason: None,
                message: None,
            });
            Some(status)
        }
        Err(e) if e.is_cancellation() => None,
        Err(e) => {
            status.message = Some(e.to_string());
            status.upsert_condition(DomainCondition {
                type_: ConditionType::Failed,
                status: "True".to_string(),
                reason: Some(condition_reason(e).to_string()),
                message: Some(e.to_string()),
            });
            Some(status)
        }
    }
}

fn condition_reason(error: &OperatorError) -> &'static str {
    match error {
        OperatorError::Api(_) => "KubernetesApi",
        OperatorError::TimeoutExceeded(_) => "Timeout",
        OperatorError::Cancelled => "Cancelled",
        OperatorError::Validation(_) => "Invalid",
        OperatorError::Introspection(_) => "Introspection",
        OperatorError::Internal(_) => "Internal",
    }
}

/// The make-right workflow: establish topology, verify the admin pod,
/// verify every desired managed pod, drain the roll queue, then hold the
/// fiber until the fleet is ready.
pub(crate) fn make_right_steps() -> StepRef {
    introspection_chain(false)
}

/// The same workflow entered from the admin rebuild trigger: the head
/// introspection runs unconditionally instead of reusing the cache.
pub(crate) fn reintrospection_steps() -> StepRef {
    introspection_chain(true)
}

fn introspection_chain(force_introspection: bool) -> StepRef {
    let await_ready = AwaitServersReadyStep::new(None);
    let roll = RollStep::new(Some(await_ready));
    let managed = ManagedServersStep::new(Some(roll));
    let admin = AdminPodStep::new(Some(managed));
    IntrospectionStep::new(force_introspection, Some(admin))
}

/// Establishes the domain topology and validates the snapshot against it.
/// Topology carried over from the cache is reused as-is (any pending
/// re-introspection request rides along for the admin replace path);
/// `force` runs the introspector regardless and settles that request.
struct IntrospectionStep {
    force: bool,
    next: Option<StepRef>,
}

impl IntrospectionStep {
    fn new(force: bool, next: Option<StepRef>) -> StepRef {
        Arc::new(IntrospectionStep { force, next })
    }
}

#[async_trait]
impl Step for IntrospectionStep {
    fn name(&self) -> &'static str {
        "Introspection"
    }

    fn successor(&self) -> Option<StepRef> {
        self.next.clone()
    }

    async fn apply(&self, packet: &mut Packet) -> NextAction {
        if !self.force {
            if let Some(topology) = packet.topology.clone() {
                if let Err(e) = packet.domain.validate_against(&topology) {
                    return NextAction::Fail(e);
                }
                return NextAction::Advance;
            }
        }

        let topology = match packet
            .components
            .introspector
            .introspect(&packet.domain)
            .await
        {
            Ok(topology) => topology,
            Err(e) => return NextAction::Fail(e),
        };
        if let Err(e) = packet.domain.validate_against(&topology) {
            return NextAction::Fail(e);
        }
        info!(domain = %packet.domain.domain_uid, "topology established");
        let topology = Arc::new(topology);
        packet.components.topology_cache.store(
            &gate_key(&packet.domain.namespace, &packet.domain.domain_uid),
            packet.domain.introspect_version.clone(),
            topology.clone(),
        );
        packet.topology = Some(topology);
        packet.introspection_requested = false;
        NextAction::Advance
    }
}

/// Expands to one managed-pod step per desired server, plus teardown of
/// pods whose servers are no longer desired.
struct ManagedServersStep {
    next: Option<StepRef>,
}

impl ManagedServersStep {
    fn new(next: Option<StepRef>) -> StepRef {
        Arc::new(ManagedServersStep { next })
    }
}

#[async_trait]
impl Step for ManagedServersStep {
    fn name(&self) -> &'static str {
        "ManagedServers"
    }

    fn successor(&self) -> Option<StepRef> {
        self.next.clone()
    }

    async fn apply(&self, packet: &mut Packet) -> NextAction {
        let desired = desired_managed_servers(packet);

        // Teardown first so freed capacity is available to the upscale.
        let mut chain = self.next.clone();
        for (cluster, scan) in desired.iter().rev() {
            chain = Some(ManagedPodStep::new(cluster, scan.clone(), chain));
        }
        chain = match excess_server_teardown(packet, &desired, chain.clone()).await {
            Ok(teardown) => teardown,
            Err(e) => return NextAction::Fail(e),
        };

        match chain {
            Some(head) => NextAction::Invoke(head),
            None => NextAction::Advance,
        }
    }
}

/// Desired managed servers: for each cluster, the first `replicas`
/// members in ascending name order.
fn desired_managed_servers(packet: &Packet) -> Vec<(String, ServerTopology)> {
    let topology = packet.topology();
    let mut desired = Vec::new();
    for cluster in &packet.domain.clusters {
        let members = match topology.cluster(&cluster.name) {
            Some(c) => c,
            None => continue,
        };
        let mut servers = members.servers.clone();
        servers.sort_by(|a, b| a.name.cmp(&b.name));
        for scan in servers.into_iter().take(cluster.replicas.max(0) as usize) {
            desired.push((cluster.name.clone(), scan));
        }
    }
    desired
}

/// Builds delete chains for live pods whose servers fell out of the
/// desired set (scale-down or removed clusters).
async fn excess_server_teardown(
    packet: &Packet,
    desired: &[(String, ServerTopology)],
    next: Option<StepRef>,
) -> Result<Option<StepRef>, OperatorError> {
    let topology = packet.topology();
    let api = packet.components.api.clone();
    let tuning = packet.components.tuning.clone();
    let selector = domain_selector(&packet.domain.domain_uid);
    let pods = with_transient_retries(&tuning, "list domain pods", || {
        api.list_pods(&packet.domain.namespace, &selector)
    })
    .await
    .map_err(OperatorError::from)?;

    let mut chain = next;
    let mut excess: Vec<(Option<String>, String)> = pods
        .iter()
        .filter_map(|pod| {
            let server = server_name(pod)?;
            if server == topology.admin_server.name {
                return None;
            }
            if desired.iter().any(|(_, scan)| scan.name == server) {
                return None;
            }
            Some((
                crate::pod::cluster_name(pod).map(str::to_string),
                server.to_string(),
            ))
        })
        .collect();
    excess.sort();

    for (cluster, server) in excess.into_iter().rev() {
        info!(server = %server, "server is no longer desired, shutting its pod down");
        let scan = ServerTopology {
            name: server,
            listen_port: 0,
            admin_port: None,
        };
        chain = Some(teardown_chain(cluster, scan, chain));
    }
    Ok(chain)
}

fn teardown_chain(
    cluster: Option<String>,
    scan: ServerTopology,
    next: Option<StepRef>,
) -> StepRef {
    use crate::pod::context::{DeletePodStep, WaitDeletedStep};
    let wait = WaitDeletedStep::new(cluster.clone(), scan.clone(), next);
    DeletePodStep::new(cluster, scan, Some(wait))
}

/// Holds the fiber until the admin server and every desired managed
/// server report Ready.
struct AwaitServersReadyStep {
    next: Option<StepRef>,
}

impl AwaitServersReadyStep {
    fn new(next: Option<StepRef>) -> StepRef {
        Arc::new(AwaitServersReadyStep { next })
    }
}

#[async_trait]
impl Step for AwaitServersReadyStep {
    fn name(&self) -> &'static str {
        "AwaitServersReady"
    }

    fn successor(&self) -> Option<StepRef> {
        self.next.clone()
    }

    async fn apply(&self, packet: &mut Packet) -> NextAction {
        let topology = packet.topology();
        let mut chain = self.next.clone();
        for (cluster, scan) in desired_managed_servers(packet).into_iter().rev() {
            chain = Some(WaitReadyStep::new(Some(cluster), scan, chain));
        }
        chain = Some(WaitReadyStep::new(
            None,
            topology.admin_server.clone(),
            chain,
        ));
        NextAction::Invoke(chain.expect("admin wait step was linked"))
    }
}
