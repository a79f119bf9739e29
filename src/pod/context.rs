use std::sync::Arc;

use async_trait::async_trait;
use json_patch::{AddOperation, Patch, PatchOperation, ReplaceOperation};
use k8s_openapi::api::core::v1 as corev1;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::k8s::retry::with_transient_retries;
use crate::k8s::ApiFailure;
use crate::kernel::packet::{Packet, RollRequest};
use crate::kernel::step::{NextAction, Step, StepRef, SuspendDeadline};
use crate::labels::{INTROSPECT_VERSION_ANNOTATION, POD_HASH_ANNOTATION, TO_BE_ROLLED_LABEL};
use crate::pod::model::DesiredPod;
use crate::pod::{is_deleting, is_failed, is_marked_for_roll, is_ready, ServerIdentity};
use crate::snapshot::{DomainSnapshot, ServerTopology};

/// Per-step, per-fiber working state for one server's pod: identity, the
/// desired model and its content hash. Everything longer-lived stays in
/// the packet.
#[derive(Clone)]
pub(crate) struct PodStepContext {
    identity: ServerIdentity,
    scan: ServerTopology,
    namespace: String,
    pod_name: String,
    desired: DesiredPod,
}

impl PodStepContext {
    fn new(packet: &Packet, cluster: Option<&str>, scan: &ServerTopology) -> PodStepContext {
        let identity = ServerIdentity::new(&packet.domain.domain_uid, cluster, &scan.name);
        let desired = packet
            .components
            .pod_models
            .desired_pod(packet, &identity, scan);
        PodStepContext {
            pod_name: identity.pod_name(),
            identity,
            scan: scan.clone(),
            namespace: packet.domain.namespace.clone(),
            desired,
        }
    }

    fn cluster(&self) -> Option<&str> {
        self.identity.cluster.as_deref()
    }
}

/// Verifies the administrative server pod against its desired model.
pub struct AdminPodStep {
    next: Option<StepRef>,
}

impl AdminPodStep {
    pub fn new(next: Option<StepRef>) -> StepRef {
        Arc::new(AdminPodStep { next })
    }
}

#[async_trait]
impl Step for AdminPodStep {
    fn name(&self) -> &'static str {
        "AdminPod"
    }

    fn successor(&self) -> Option<StepRef> {
        self.next.clone()
    }

    async fn apply(&self, packet: &mut Packet) -> NextAction {
        packet.cluster_name = None;
        let scan = packet.topology().admin_server.clone();
        verify_pod(packet, None, &scan, self.next.clone()).await
    }
}

/// Verifies one managed server pod against its desired model.
pub struct ManagedPodStep {
    cluster: String,
    scan: ServerTopology,
    next: Option<StepRef>,
}

impl ManagedPodStep {
    pub fn new(cluster: &str, scan: ServerTopology, next: Option<StepRef>) -> StepRef {
        Arc::new(ManagedPodStep {
            cluster: cluster.to_string(),
            scan,
            next,
        })
    }
}

#[async_trait]
impl Step for ManagedPodStep {
    fn name(&self) -> &'static str {
        "ManagedPod"
    }

    fn successor(&self) -> Option<StepRef> {
        self.next.clone()
    }

    async fn apply(&self, packet: &mut Packet) -> NextAction {
        packet.cluster_name = Some(self.cluster.clone());
        verify_pod(packet, Some(&self.cluster), &self.scan, self.next.clone()).await
    }
}

/// Re-entry vehicle: any branch that must start over from the READ phase
/// constructs a fresh one of these, forward-linked to the original
/// successor.
pub(crate) struct VerifyPodStep {
    cluster: Option<String>,
    scan: ServerTopology,
    next: Option<StepRef>,
}

impl VerifyPodStep {
    pub(crate) fn new(
        cluster: Option<String>,
        scan: ServerTopology,
        next: Option<StepRef>,
    ) -> StepRef {
        Arc::new(VerifyPodStep {
            cluster,
            scan,
            next,
        })
    }
}

#[async_trait]
impl Step for VerifyPodStep {
    fn name(&self) -> &'static str {
        "VerifyPod"
    }

    fn successor(&self) -> Option<StepRef> {
        self.next.clone()
    }

    async fn apply(&self, packet: &mut Packet) -> NextAction {
        packet.cluster_name = self.cluster.clone();
        verify_pod(packet, self.cluster.as_deref(), &self.scan, self.next.clone()).await
    }
}

/// The pod lifecycle decision procedure: READ, then CREATE, PATCH, ROLL
/// or nothing.
async fn verify_pod(
    packet: &mut Packet,
    cluster: Option<&str>,
    scan: &ServerTopology,
    next: Option<StepRef>,
) -> NextAction {
    let ctx = PodStepContext::new(packet, cluster, scan);
    let api = packet.components.api.clone();
    let tuning = packet.components.tuning.clone();

    let live = match with_transient_retries(&tuning, "read pod", || {
        api.read_pod(&ctx.namespace, &ctx.pod_name)
    })
    .await
    {
        Ok(live) => live,
        Err(e) => return NextAction::Fail(e.into()),
    };

    let live = match live {
        None => return NextAction::Invoke(CreatePodStep::new(ctx, next)),
        Some(live) => live,
    };

    if is_deleting(&live) {
        // Someone is already tearing this pod down; wait it out, then
        // start over from READ.
        let awaiter = packet.components.awaiter.clone();
        let pod_name = ctx.pod_name.clone();
        let resume = VerifyPodStep::new(
            cluster.map(str::to_string),
            scan.clone(),
            next,
        );
        return NextAction::suspend(
            resume,
            SuspendDeadline::new(
                tuning.deletion_wait(),
                format!("deletion of pod {pod_name}"),
            ),
            move |handle| {
                awaiter.wait_for_deleted(&pod_name, move || handle.resume());
            },
        );
    }

    if ctx.cluster().is_some() && is_marked_for_roll(&live) {
        // The roll coordinator owns this pod; re-register the deferred
        // cycle without recomputing the decision.
        defer_roll(packet, &ctx);
        return NextAction::Advance;
    }

    if is_failed(&live) {
        warn!(pod = %ctx.pod_name, "pod is in Failed phase, replacing it");
        return replace_pod(packet, ctx, &live, next).await;
    }

    let live_hash = live
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(POD_HASH_ANNOTATION));
    if live_hash == Some(&ctx.desired.hash) {
        // An admin pod built against an older introspect version must be
        // rebuilt even when nothing else about it changed; the version
        // stamp is owned by the rebuild flow, never by the patch flow.
        if ctx.cluster().is_none() && introspection_stale(&live, &packet.domain) {
            info!(pod = %ctx.pod_name, "introspect version moved, rebuilding admin server pod");
            return replace_pod(packet, ctx, &live, next).await;
        }
        match non_hashed_patch(&live, &ctx.desired.pod) {
            None => {
                debug!(pod = %ctx.pod_name, "pod exists and is current");
                NextAction::Advance
            }
            Some(patch) => NextAction::Invoke(PatchPodStep::new(ctx, patch, next)),
        }
    } else {
        replace_pod(packet, ctx, &live, next).await
    }
}

/// True when the live pod was built against a different introspect
/// version than the snapshot declares.
fn introspection_stale(live: &corev1::Pod, domain: &DomainSnapshot) -> bool {
    match &domain.introspect_version {
        None => false,
        Some(version) => {
            live.metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(INTROSPECT_VERSION_ANNOTATION))
                != Some(version)
        }
    }
}

/// ROLL: immediate for the admin server, deferred to the roll coordinator
/// for a clustered server.
async fn replace_pod(
    packet: &mut Packet,
    ctx: PodStepContext,
    live: &corev1::Pod,
    next: Option<StepRef>,
) -> NextAction {
    if ctx.cluster().is_none() {
        if packet.introspection_requested {
            info!(
                pod = %ctx.pod_name,
                "admin server needs replacement, rerunning introspection first"
            );
            return NextAction::Invoke(RerunIntrospectionStep::new());
        }
        info!(pod = %ctx.pod_name, "replacing admin server pod");
        return NextAction::Invoke(cycle_chain(
            ctx.cluster().map(str::to_string),
            ctx.scan.clone(),
            next,
        ));
    }

    if !is_marked_for_roll(live) {
        label_pod_for_roll(packet, &ctx, live).await;
    }
    defer_roll(packet, &ctx);
    // Control is surrendered; the coordinator drives this server from
    // here.
    NextAction::Advance
}

/// Marks the pod as scheduled for replacement. A failure to label is
/// logged and the roll proceeds: the deferred cycle is already registered,
/// and the worst case of a missing label is one redundant recomputation on
/// the next pass.
async fn label_pod_for_roll(packet: &Packet, ctx: &PodStepContext, live: &corev1::Pod) {
    let ops = if live.metadata.labels.is_some() {
        vec![PatchOperation::Add(AddOperation {
            path: format!("/metadata/labels/{}", escape_pointer(TO_BE_ROLLED_LABEL)),
            value: Value::String("true".to_string()),
        })]
    } else {
        vec![PatchOperation::Add(AddOperation {
            path: "/metadata/labels".to_string(),
            value: serde_json::json!({ TO_BE_ROLLED_LABEL: "true" }),
        })]
    };
    if let Err(e) = packet
        .components
        .api
        .patch_pod(&ctx.namespace, &ctx.pod_name, &Patch(ops))
        .await
    {
        warn!(pod = %ctx.pod_name, error = %e, "could not label pod for roll, proceeding");
    }
}

fn defer_roll(packet: &Packet, ctx: &PodStepContext) {
    let request = RollRequest {
        cluster: ctx.cluster().map(str::to_string),
        step: cycle_chain(ctx.cluster().map(str::to_string), ctx.scan.clone(), None),
        packet: packet.copy(),
    };
    packet.defer_roll(&ctx.identity.server, request);
    info!(
        pod = %ctx.pod_name,
        cluster = ctx.cluster().unwrap_or(""),
        "pod scheduled for rolling replacement"
    );
}

/// delete → await deletion → re-verify (which creates) → await ready.
pub(crate) fn cycle_chain(
    cluster: Option<String>,
    scan: ServerTopology,
    next: Option<StepRef>,
) -> StepRef {
    let wait_ready: StepRef = Arc::new(WaitReadyStep {
        cluster: cluster.clone(),
        scan: scan.clone(),
        next,
    });
    let verify = VerifyPodStep::new(cluster.clone(), scan.clone(), Some(wait_ready));
    let wait_deleted: StepRef = Arc::new(WaitDeletedStep {
        cluster: cluster.clone(),
        scan: scan.clone(),
        next: Some(verify),
    });
    Arc::new(DeletePodStep {
        cluster,
        scan,
        next: Some(wait_deleted),
    })
}

/// CREATE: POST the desired pod.
pub(crate) struct CreatePodStep {
    ctx: PodStepContext,
    next: Option<StepRef>,
}

impl CreatePodStep {
    fn new(ctx: PodStepContext, next: Option<StepRef>) -> StepRef {
        Arc::new(CreatePodStep { ctx, next })
    }
}

#[async_trait]
impl Step for CreatePodStep {
    fn name(&self) -> &'static str {
        "CreatePod"
    }

    fn successor(&self) -> Option<StepRef> {
        self.next.clone()
    }

    async fn apply(&self, packet: &mut Packet) -> NextAction {
        let api = packet.components.api.clone();
        let tuning = packet.components.tuning.clone();
        let created = with_transient_retries(&tuning, "create pod", || {
            api.create_pod(&self.ctx.namespace, &self.ctx.desired.pod)
        })
        .await;

        match created {
            Ok(_) => {
                info!(pod = %self.ctx.pod_name, "created server pod");
                NextAction::Advance
            }
            Err(ApiFailure::AlreadyExists) => NextAction::Invoke(VerifyPodStep::new(
                self.ctx.cluster().map(str::to_string),
                self.ctx.scan.clone(),
                self.next.clone(),
            )),
            Err(e) => NextAction::Fail(e.into()),
        }
    }
}

/// PATCH: bring the non-hashed overlay in line, changed paths only.
pub(crate) struct PatchPodStep {
    ctx: PodStepContext,
    patch: Patch,
    next: Option<StepRef>,
}

impl PatchPodStep {
    fn new(ctx: PodStepContext, patch: Patch, next: Option<StepRef>) -> StepRef {
        Arc::new(PatchPodStep { ctx, patch, next })
    }
}

#[async_trait]
impl Step for PatchPodStep {
    fn name(&self) -> &'static str {
        "PatchPod"
    }

    fn successor(&self) -> Option<StepRef> {
        self.next.clone()
    }

    async fn apply(&self, packet: &mut Packet) -> NextAction {
        let api = packet.components.api.clone();
        let tuning = packet.components.tuning.clone();
        let patched = with_transient_retries(&tuning, "patch pod", || {
            api.patch_pod(&self.ctx.namespace, &self.ctx.pod_name, &self.patch)
        })
        .await;

        match patched {
            Ok(_) => {
                info!(pod = %self.ctx.pod_name, "patched server pod");
                NextAction::Advance
            }
            // The pod vanished under us; create it instead.
            Err(ApiFailure::NotFound) => {
                NextAction::Invoke(CreatePodStep::new(self.ctx.clone(), self.next.clone()))
            }
            // A concurrent writer won; start over from READ.
            Err(ApiFailure::Conflict) => NextAction::Invoke(VerifyPodStep::new(
                self.ctx.cluster().map(str::to_string),
                self.ctx.scan.clone(),
                self.next.clone(),
            )),
            Err(e) => NextAction::Fail(e.into()),
        }
    }
}

/// Deletes the server pod with the configured shutdown grace.
pub(crate) struct DeletePodStep {
    cluster: Option<String>,
    scan: ServerTopology,
    next: Option<StepRef>,
}

impl DeletePodStep {
    pub(crate) fn new(
        cluster: Option<String>,
        scan: ServerTopology,
        next: Option<StepRef>,
    ) -> StepRef {
        Arc::new(DeletePodStep {
            cluster,
            scan,
            next,
        })
    }
}

#[async_trait]
impl Step for DeletePodStep {
    fn name(&self) -> &'static str {
        "DeletePod"
    }

    fn successor(&self) -> Option<StepRef> {
        self.next.clone()
    }

    async fn apply(&self, packet: &mut Packet) -> NextAction {
        let identity = ServerIdentity::new(
            &packet.domain.domain_uid,
            self.cluster.as_deref(),
            &self.scan.name,
        );
        let pod_name = identity.pod_name();
        let grace = packet
            .domain
            .server_spec(self.cluster.as_deref())
            .delete_grace_period_seconds();

        info!(pod = %pod_name, grace_period_seconds = grace, "deleting server pod");
        // Deliberately a single attempt: deletion is confirmed (and
        // re-issued if needed) by the wait step that follows.
        match packet
            .components
            .api
            .delete_pod(&packet.domain.namespace, &pod_name, grace)
            .await
        {
            Ok(()) => NextAction::Advance,
            Err(e) => NextAction::Fail(e.into()),
        }
    }
}

/// Parks until the pod is observed gone, re-issuing the delete if the pod
/// is still live without a deletion timestamp.
pub(crate) struct WaitDeletedStep {
    cluster: Option<String>,
    scan: ServerTopology,
    next: Option<StepRef>,
}

impl WaitDeletedStep {
    pub(crate) fn new(
        cluster: Option<String>,
        scan: ServerTopology,
        next: Option<StepRef>,
    ) -> StepRef {
        Arc::new(WaitDeletedStep {
            cluster,
            scan,
            next,
        })
    }
}

#[async_trait]
impl Step for WaitDeletedStep {
    fn name(&self) -> &'static str {
        "WaitPodDeleted"
    }

    fn successor(&self) -> Option<StepRef> {
        self.next.clone()
    }

    async fn apply(&self, packet: &mut Packet) -> NextAction {
        let identity = ServerIdentity::new(
            &packet.domain.domain_uid,
            self.cluster.as_deref(),
            &self.scan.name,
        );
        let pod_name = identity.pod_name();
        let api = packet.components.api.clone();
        let tuning = packet.components.tuning.clone();

        let live = match with_transient_retries(&tuning, "read pod", || {
            api.read_pod(&packet.domain.namespace, &pod_name)
        })
        .await
        {
            Ok(live) => live,
            Err(e) => return NextAction::Fail(e.into()),
        };

        match live {
            None => NextAction::Advance,
            Some(pod) if !is_deleting(&pod) => NextAction::Invoke(DeletePodStep::new(
                self.cluster.clone(),
                self.scan.clone(),
                self.next.clone(),
            )),
            Some(_) => {
                let awaiter = packet.components.awaiter.clone();
                let waited = pod_name.clone();
                let resume: StepRef = Arc::new(WaitDeletedStep {
                    cluster: self.cluster.clone(),
                    scan: self.scan.clone(),
                    next: self.next.clone(),
                });
                NextAction::suspend(
                    resume,
                    SuspendDeadline::new(
                        tuning.deletion_wait(),
                        format!("deletion of pod {pod_name}"),
                    ),
                    move |handle| {
                        awaiter.wait_for_deleted(&waited, move || handle.resume());
                    },
                )
            }
        }
    }
}

/// Parks until the pod reports Ready. A Failed phase re-enters the
/// decision procedure, which replaces the pod.
pub(crate) struct WaitReadyStep {
    cluster: Option<String>,
    scan: ServerTopology,
    next: Option<StepRef>,
}

impl WaitReadyStep {
    pub(crate) fn new(
        cluster: Option<String>,
        scan: ServerTopology,
        next: Option<StepRef>,
    ) -> StepRef {
        Arc::new(WaitReadyStep {
            cluster,
            scan,
            next,
        })
    }
}

#[async_trait]
impl Step for WaitReadyStep {
    fn name(&self) -> &'static str {
        "WaitPodReady"
    }

    fn successor(&self) -> Option<StepRef> {
        self.next.clone()
    }

    async fn apply(&self, packet: &mut Packet) -> NextAction {
        let identity = ServerIdentity::new(
            &packet.domain.domain_uid,
            self.cluster.as_deref(),
            &self.scan.name,
        );
        let pod_name = identity.pod_name();
        let api = packet.components.api.clone();
        let tuning = packet.components.tuning.clone();

        let live = match with_transient_retries(&tuning, "read pod", || {
            api.read_pod(&packet.domain.namespace, &pod_name)
        })
        .await
        {
            Ok(live) => live,
            Err(e) => return NextAction::Fail(e.into()),
        };

        match live {
            Some(pod) if is_ready(&pod) => {
                debug!(pod = %pod_name, "pod is ready");
                NextAction::Advance
            }
            Some(pod) if is_failed(&pod) => {
                warn!(pod = %pod_name, "pod failed while waiting for readiness");
                NextAction::Invoke(VerifyPodStep::new(
                    self.cluster.clone(),
                    self.scan.clone(),
                    self.next.clone(),
                ))
            }
            // Vanished while we were waiting; re-enter the decision
            // procedure, which recreates it.
            None => NextAction::Invoke(VerifyPodStep::new(
                self.cluster.clone(),
                self.scan.clone(),
                self.next.clone(),
            )),
            Some(_) => {
                let awaiter = packet.components.awaiter.clone();
                let waited = pod_name.clone();
                let resume: StepRef = Arc::new(WaitReadyStep {
                    cluster: self.cluster.clone(),
                    scan: self.scan.clone(),
                    next: self.next.clone(),
                });
                NextAction::suspend(
                    resume,
                    SuspendDeadline::new(
                        tuning.readiness_wait(),
                        format!("readiness of pod {pod_name}"),
                    ),
                    move |handle| {
                        awaiter.wait_for_ready(&waited, move || handle.resume());
                    },
                )
            }
        }
    }
}

/// Admin-server rebuild trigger: the declared introspect version has
/// moved, so the domain home must be introspected again before the admin
/// pod may be replaced. Abandons the rest of this fiber's pod work and
/// starts the workflow over with a forced introspection at its head.
pub(crate) struct RerunIntrospectionStep;

impl RerunIntrospectionStep {
    fn new() -> StepRef {
        Arc::new(RerunIntrospectionStep)
    }
}

#[async_trait]
impl Step for RerunIntrospectionStep {
    fn name(&self) -> &'static str {
        "RerunIntrospection"
    }

    fn successor(&self) -> Option<StepRef> {
        None
    }

    async fn apply(&self, _packet: &mut Packet) -> NextAction {
        NextAction::Invoke(crate::reconciler::reintrospection_steps())
    }
}

/// JSON-Pointer escaping for label and annotation keys (RFC 6901).
pub(crate) fn escape_pointer(key: &str) -> String {
    key.replace('~', "~0").replace('/', "~1")
}

/// Diffs the non-hashed overlay of a live pod against the desired model:
/// labels, annotations, owner references and probe timings. Returns the
/// JSON-Patch with only the changed paths, or nothing when the overlay is
/// current. Extra live-only labels (such as the roll marker) are left
/// alone.
pub(crate) fn non_hashed_patch(live: &corev1::Pod, desired: &corev1::Pod) -> Option<Patch> {
    let mut ops: Vec<PatchOperation> = Vec::new();

    diff_string_map(
        &mut ops,
        "/metadata/labels",
        live.metadata.labels.as_ref(),
        desired.metadata.labels.as_ref(),
        &[],
    );
    // The introspect version stamp only moves when a pod is rebuilt
    // through the introspection flow; patching it would fake currency.
    diff_string_map(
        &mut ops,
        "/metadata/annotations",
        live.metadata.annotations.as_ref(),
        desired.metadata.annotations.as_ref(),
        &[INTROSPECT_VERSION_ANNOTATION],
    );

    if desired.metadata.owner_references.is_some()
        && live.metadata.owner_references != desired.metadata.owner_references
    {
        let value = serde_json::to_value(desired.metadata.owner_references.as_ref().unwrap())
            .unwrap_or(Value::Null);
        ops.push(if live.metadata.owner_references.is_some() {
            PatchOperation::Replace(ReplaceOperation {
                path: "/metadata/ownerReferences".to_string(),
                value,
            })
        } else {
            PatchOperation::Add(AddOperation {
                path: "/metadata/ownerReferences".to_string(),
                value,
            })
        });
    }

    diff_probe_timings(&mut ops, live, desired);

    if ops.is_empty() {
        None
    } else {
        Some(Patch(ops))
    }
}

fn diff_string_map(
    ops: &mut Vec<PatchOperation>,
    base_path: &str,
    live: Option<&std::collections::BTreeMap<String, String>>,
    desired: Option<&std::collections::BTreeMap<String, String>>,
    skipped_keys: &[&str],
) {
    let desired = match desired {
        Some(desired) if !desired.is_empty() => desired,
        _ => return,
    };
    let live = match live {
        Some(live) => live,
        None => {
            let kept: std::collections::BTreeMap<&String, &String> = desired
                .iter()
                .filter(|(key, _)| !skipped_keys.contains(&key.as_str()))
                .collect();
            ops.push(PatchOperation::Add(AddOperation {
                path: base_path.to_string(),
                value: serde_json::to_value(kept).unwrap_or(Value::Null),
            }));
            return;
        }
    };
    for (key, value) in desired {
        if skipped_keys.contains(&key.as_str()) {
            continue;
        }
        match live.get(key) {
            Some(current) if current == value => {}
            Some(_) => ops.push(PatchOperation::Replace(ReplaceOperation {
                path: format!("{base_path}/{}", escape_pointer(key)),
                value: Value::String(value.clone()),
            })),
            None => ops.push(PatchOperation::Add(AddOperation {
                path: format!("{base_path}/{}", escape_pointer(key)),
                value: Value::String(value.clone()),
            })),
        }
    }
}

fn diff_probe_timings(ops: &mut Vec<PatchOperation>, live: &corev1::Pod, desired: &corev1::Pod) {
    let (live_containers, desired_containers) = match (
        live.spec.as_ref().map(|s| &s.containers),
        desired.spec.as_ref().map(|s| &s.containers),
    ) {
        (Some(live), Some(desired)) => (live, desired),
        _ => return,
    };

    for desired_container in desired_containers {
        let live_index = match live_containers
            .iter()
            .position(|c| c.name == desired_container.name)
        {
            Some(index) => index,
            None => continue,
        };
        let live_container = &live_containers[live_index];

        for (probe_field, live_probe, desired_probe) in [
            (
                "readinessProbe",
                live_container.readiness_probe.as_ref(),
                desired_container.readiness_probe.as_ref(),
            ),
            (
                "livenessProbe",
                live_container.liveness_probe.as_ref(),
                desired_container.liveness_probe.as_ref(),
            ),
        ] {
            let desired_probe = match desired_probe {
                Some(p) => p,
                None => continue,
            };
            for (timing_field, live_value, desired_value) in [
                (
                    "initialDelaySeconds",
                    live_probe.and_then(|p| p.initial_delay_seconds),
                    desired_probe.initial_delay_seconds,
                ),
                (
                    "periodSeconds",
                    live_probe.and_then(|p| p.period_seconds),
                    desired_probe.period_seconds,
                ),
                (
                    "timeoutSeconds",
                    live_probe.and_then(|p| p.timeout_seconds),
                    desired_probe.timeout_seconds,
                ),
            ] {
                let desired_value = match desired_value {
                    Some(v) => v,
                    None => continue,
                };
                if live_value == Some(desired_value) {
                    continue;
                }
                let path = format!(
                    "/spec/containers/{live_index}/{probe_field}/{timing_field}"
                );
                ops.push(if live_value.is_some() {
                    PatchOperation::Replace(ReplaceOperation {
                        path,
                        value: Value::from(desired_value),
                    })
                } else {
                    PatchOperation::Add(AddOperation {
                        path,
                        value: Value::from(desired_value),
                    })
                });
            }
        }
    }
}
