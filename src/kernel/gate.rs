use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::debug;

use crate::kernel::engine::Engine;
use crate::kernel::fiber::{CompletionCallback, FiberHandle, ResumeHandle};
use crate::kernel::packet::Packet;
use crate::kernel::step::{NextAction, Step, StepRef, Suspension};

/// Allows at most one running fiber per key. Rather than queue later
/// arrivals, the gate cancels the earlier fiber: a later submission always
/// completes or corrects whatever work was in flight, so the freshest
/// intent wins.
pub struct FiberGate {
    engine: Engine,
    gate: Arc<Mutex<HashMap<String, FiberHandle>>>,
    /// Sentinel expectation standing for "no current fiber"; never started
    /// and never installed in the map.
    placeholder: FiberHandle,
}

enum Expectation<'a> {
    Any,
    Matches(&'a FiberHandle),
}

impl FiberGate {
    pub fn new(engine: Engine) -> FiberGate {
        let placeholder = engine.create_fiber("placeholder").handle();
        FiberGate {
            engine,
            gate: Arc::new(Mutex::new(HashMap::new())),
            placeholder,
        }
    }

    /// Fiber status by key, for observability.
    pub fn current_fibers(&self) -> HashMap<String, &'static str> {
        self.gate
            .lock()
            .unwrap()
            .iter()
            .map(|(k, f)| (k.clone(), f.status()))
            .collect()
    }

    pub fn handles(&self) -> Vec<FiberHandle> {
        self.gate.lock().unwrap().values().cloned().collect()
    }

    /// Starts a fiber, cancelling any in-flight fiber with the same key.
    pub fn start(
        &self,
        key: &str,
        entry: StepRef,
        packet: Packet,
        callback: CompletionCallback,
    ) -> FiberHandle {
        self.start_gated(key, Expectation::Any, entry, packet, callback)
            .expect("unconditional start always installs a fiber")
    }

    /// Starts a fiber only when no fiber currently owns the key.
    pub fn start_if_no_current(
        &self,
        key: &str,
        entry: StepRef,
        packet: Packet,
        callback: CompletionCallback,
    ) -> Option<FiberHandle> {
        let placeholder = self.placeholder.clone();
        self.start_gated(key, Expectation::Matches(&placeholder), entry, packet, callback)
    }

    /// Starts a fiber only when the key's current fiber is `expected`,
    /// atomically replacing it.
    pub fn start_if_last_matches(
        &self,
        key: &str,
        expected: &FiberHandle,
        entry: StepRef,
        packet: Packet,
        callback: CompletionCallback,
    ) -> Option<FiberHandle> {
        self.start_gated(key, Expectation::Matches(expected), entry, packet, callback)
    }

    fn start_gated(
        &self,
        key: &str,
        expectation: Expectation<'_>,
        entry: StepRef,
        packet: Packet,
        callback: CompletionCallback,
    ) -> Option<FiberHandle> {
        let fiber = self.engine.create_fiber(key);
        let handle = fiber.handle();

        let displaced = {
            let mut gate = self.gate.lock().unwrap();
            match expectation {
                Expectation::Any => gate.insert(key.to_string(), handle.clone()),
                Expectation::Matches(expected) if expected.id() == self.placeholder.id() => {
                    if gate.contains_key(key) {
                        return None;
                    }
                    gate.insert(key.to_string(), handle.clone());
                    None
                }
                Expectation::Matches(expected) => match gate.get(key) {
                    Some(current) if current.id() == expected.id() => {
                        gate.insert(key.to_string(), handle.clone())
                    }
                    _ => return None,
                },
            }
        };

        if let Some(old) = displaced {
            debug!(key, old = old.id(), new = handle.id(), "displacing in-flight fiber");
            handle.set_predecessor(old);
        }

        // The new chain first waits out the fiber it displaced, so its own
        // steps only ever observe settled remote state.
        let first: StepRef = Arc::new(WaitForOldFiberStep {
            slot: handle.predecessor_slot(),
            next: Some(entry),
        });

        let gate = self.gate.clone();
        let gate_key = key.to_string();
        let own_id = handle.id();
        let wrapped: CompletionCallback = Box::new(move |packet, outcome| {
            // Only clear the entry if it still points at this fiber; a
            // late-completing cancelled fiber must not evict its successor.
            {
                let mut gate = gate.lock().unwrap();
                if gate.get(&gate_key).map(FiberHandle::id) == Some(own_id) {
                    gate.remove(&gate_key);
                }
            }
            callback(packet, outcome);
        });

        self.engine.submit(fiber, first, packet, wrapped);
        Some(handle)
    }
}

/// First step of every gated chain: cancel the displaced fiber and park
/// until its exit callback fires. When the displaced fiber was itself
/// still waiting on an even older fiber, that predecessor is adopted and
/// waited out as well.
struct WaitForOldFiberStep {
    slot: Arc<Mutex<Option<FiberHandle>>>,
    next: Option<StepRef>,
}

#[async_trait]
impl Step for WaitForOldFiberStep {
    fn name(&self) -> &'static str {
        "WaitForOldFiber"
    }

    fn successor(&self) -> Option<StepRef> {
        self.next.clone()
    }

    async fn apply(&self, _packet: &mut Packet) -> NextAction {
        let old = self.slot.lock().unwrap().take();
        let old = match old {
            None => return NextAction::Advance,
            Some(old) => old,
        };

        let slot = self.slot.clone();
        let resume: StepRef = Arc::new(WaitForOldFiberStep {
            slot: self.slot.clone(),
            next: self.next.clone(),
        });

        // If this fiber is itself displaced mid-wait, the pending fiber
        // goes back into the slot so the successor inherits the wait.
        let abandoned_slot = self.slot.clone();
        let abandoned_old = old.clone();

        NextAction::Suspend(Suspension {
            register: Box::new(move |handle: ResumeHandle| {
                let adopted = old.clone();
                old.cancel_and_exit_callback(move || {
                    if let Some(older) = adopted.take_unsettled_predecessor() {
                        *slot.lock().unwrap() = Some(older);
                    }
                    handle.resume();
                });
            }),
            resume,
            deadline: None,
            on_abandon: Some(Box::new(move || {
                *abandoned_slot.lock().unwrap() = Some(abandoned_old);
            })),
        })
    }
}
