use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{info, warn};

use crate::k8s::retry::with_transient_retries;
use crate::kernel::fiber::FiberOutcome;
use crate::kernel::packet::{Packet, RollRequest};
use crate::kernel::step::{NextAction, Step, StepRef, SuspendDeadline};
use crate::pod::{cluster_selector, is_marked_for_roll, is_ready};

/// Drains the servers-to-roll map and cycles the flagged servers one at a
/// time, cluster by cluster, in ascending server-name order. The
/// label-then-defer scheme means every server needing replacement is known
/// before the first deletion happens, so ordering and concurrency are
/// explicit rather than race-dependent.
pub struct RollStep {
    next: Option<StepRef>,
}

impl RollStep {
    pub fn new(next: Option<StepRef>) -> StepRef {
        Arc::new(RollStep { next })
    }
}

#[async_trait]
impl Step for RollStep {
    fn name(&self) -> &'static str {
        "Roll"
    }

    fn successor(&self) -> Option<StepRef> {
        self.next.clone()
    }

    async fn apply(&self, packet: &mut Packet) -> NextAction {
        let drained: BTreeMap<String, RollRequest> =
            std::mem::take(&mut *packet.servers_to_roll.lock().unwrap());
        if drained.is_empty() {
            return NextAction::Advance;
        }
        info!(servers = drained.len(), "rolling flagged servers");

        // Group per cluster; BTreeMap ordering gives deterministic
        // cluster order and ascending server order within each.
        let mut by_cluster: BTreeMap<Option<String>, Vec<(String, RollRequest)>> = BTreeMap::new();
        for (server, request) in drained {
            by_cluster
                .entry(request.cluster.clone())
                .or_default()
                .push((server, request));
        }

        let mut chain = self.next.clone();
        for (_cluster, mut servers) in by_cluster.into_iter().rev() {
            servers.sort_by(|a, b| a.0.cmp(&b.0));
            for (server, request) in servers.into_iter().rev() {
                chain = Some(Arc::new(CycleServerStep {
                    server,
                    request,
                    next: chain,
                }) as StepRef);
            }
        }
        NextAction::Invoke(chain.expect("at least one cycle step was linked"))
    }
}

/// Replaces one flagged server: waits for the cluster's unavailability
/// budget, then runs the deferred cycle chain as a child fiber and gates
/// on its completion.
struct CycleServerStep {
    server: String,
    request: RollRequest,
    next: Option<StepRef>,
}

impl CycleServerStep {
    fn renewed(&self) -> StepRef {
        Arc::new(CycleServerStep {
            server: self.server.clone(),
            request: RollRequest {
                cluster: self.request.cluster.clone(),
                step: self.request.step.clone(),
                packet: self.request.packet.copy(),
            },
            next: self.next.clone(),
        })
    }
}

#[async_trait]
impl Step for CycleServerStep {
    fn name(&self) -> &'static str {
        "CycleServer"
    }

    fn successor(&self) -> Option<StepRef> {
        self.next.clone()
    }

    async fn apply(&self, packet: &mut Packet) -> NextAction {
        let tuning = packet.components.tuning.clone();

        if let Some(cluster) = &self.request.cluster {
            let max_unavailable = packet
                .domain
                .cluster(cluster)
                .map(|c| c.max_unavailable)
                .unwrap_or(1)
                .max(1) as usize;
            let api = packet.components.api.clone();
            let selector = cluster_selector(&packet.domain.domain_uid, cluster);
            let pods = match with_transient_retries(&tuning, "list cluster pods", || {
                api.list_pods(&packet.domain.namespace, &selector)
            })
            .await
            {
                Ok(pods) => pods,
                Err(e) => return NextAction::Fail(e.into()),
            };

            // Members that are down for reasons of their own consume the
            // budget; the flagged ones are the coordinator's to spend.
            let unavailable = pods
                .iter()
                .filter(|p| !is_ready(p) && !is_marked_for_roll(p))
                .count();
            if unavailable >= max_unavailable {
                warn!(
                    cluster = %cluster,
                    unavailable,
                    max_unavailable,
                    "cluster at its unavailability budget, delaying roll"
                );
                return NextAction::Delay {
                    step: self.renewed(),
                    delay: tuning.unavailable_recheck(),
                };
            }
        }

        info!(server = %self.server, "cycling server");
        let engine = packet.components.engine.clone();
        let child = engine.create_fiber(&format!(
            "{}/{}/roll/{}",
            packet.domain.namespace, packet.domain.domain_uid, self.server
        ));
        let outcome: Arc<Mutex<Option<FiberOutcome>>> = Arc::new(Mutex::new(None));

        let collect: StepRef = Arc::new(CollectCycleOutcomeStep {
            server: self.server.clone(),
            outcome: outcome.clone(),
            next: self.next.clone(),
        });

        let request_step = self.request.step.clone();
        let request_packet = self.request.packet.copy();
        let server = self.server.clone();
        NextAction::suspend(
            collect,
            SuspendDeadline::new(
                tuning.roll_cycle_wait(),
                format!("replacement of server {server}"),
            ),
            move |handle| {
                let slot = outcome.clone();
                let resume = handle.clone();
                let child_handle = engine.submit(
                    child,
                    request_step,
                    request_packet,
                    Box::new(move |_packet, result| {
                        *slot.lock().unwrap() = Some(result);
                        resume.resume();
                    }),
                );
                // A dying parent takes the cycle down with it.
                handle.fiber().on_exit(move || child_handle.cancel());
            },
        )
    }
}

/// Runs after the child fiber wakes the coordinator: success moves on to
/// the next flagged server, failure aborts the roll.
struct CollectCycleOutcomeStep {
    server: String,
    outcome: Arc<Mutex<Option<FiberOutcome>>>,
    next: Option<StepRef>,
}

#[async_trait]
impl Step for CollectCycleOutcomeStep {
    fn name(&self) -> &'static str {
        "CollectCycleOutcome"
    }

    fn successor(&self) -> Option<StepRef> {
        self.next.clone()
    }

    async fn apply(&self, packet: &mut Packet) -> NextAction {
        let taken = self.outcome.lock().unwrap().take();
        match taken {
            Some(FiberOutcome::Completed) => {
                info!(server = %self.server, "server replaced and ready");
                NextAction::Advance
            }
            Some(FiberOutcome::Failed(e)) => {
                warn!(server = %self.server, error = %e, "server replacement failed, aborting roll");
                NextAction::Fail(e)
            }
            // A stale wakeup; the cycle fiber is still running and its
            // completion callback holds our resume handle.
            None => {
                let tuning = packet.components.tuning.clone();
                let resume: StepRef = Arc::new(CollectCycleOutcomeStep {
                    server: self.server.clone(),
                    outcome: self.outcome.clone(),
                    next: self.next.clone(),
                });
                NextAction::suspend(
                    resume,
                    SuspendDeadline::new(
                        tuning.roll_cycle_wait(),
                        format!("replacement of server {}", self.server),
                    ),
                    |_handle| {},
                )
            }
        }
    }
}
