use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use tokio::sync::Notify;
use tokio::time::sleep;
use tracing::{debug, error};

use crate::error::OperatorError;
use crate::kernel::packet::Packet;
use crate::kernel::step::{NextAction, StepRef};

/// Terminal result of a fiber. Cancellation is reported as a failure with
/// [`OperatorError::Cancelled`]; callers that pre-empted the fiber treat
/// it as silent.
pub enum FiberOutcome {
    Completed,
    Failed(OperatorError),
}

pub type CompletionCallback = Box<dyn FnOnce(Packet, FiberOutcome) + Send + 'static>;

/// A cooperative execution of one step chain. The fiber owns its packet,
/// runs steps strictly in sequence, and observes cancellation only at step
/// boundaries: remote API calls are non-atomic, and tearing one down
/// mid-flight risks orphaned resources.
pub struct Fiber {
    shared: Arc<FiberShared>,
}

pub(crate) struct FiberShared {
    id: u64,
    key: String,
    cancelled: AtomicBool,
    wake: Notify,
    state: Mutex<&'static str>,
    exit: Mutex<ExitCallbacks>,
    /// The fiber this one displaced in a gate, still unsettled. A
    /// successor adopts it if this fiber dies before the wait completes.
    predecessor: Arc<Mutex<Option<FiberHandle>>>,
}

struct ExitCallbacks {
    finished: bool,
    callbacks: Vec<Box<dyn FnOnce() + Send>>,
}

/// Shared, clonable reference to a fiber: cancellation, resumption and
/// exit notification. Handles stay valid after the fiber terminates.
#[derive(Clone)]
pub struct FiberHandle {
    shared: Arc<FiberShared>,
}

impl Fiber {
    pub(crate) fn new(id: u64, key: &str) -> Fiber {
        Fiber {
            shared: Arc::new(FiberShared {
                id,
                key: key.to_string(),
                cancelled: AtomicBool::new(false),
                wake: Notify::new(),
                state: Mutex::new("created"),
                exit: Mutex::new(ExitCallbacks {
                    finished: false,
                    callbacks: Vec::new(),
                }),
                predecessor: Arc::new(Mutex::new(None)),
            }),
        }
    }

    pub fn handle(&self) -> FiberHandle {
        FiberHandle {
            shared: self.shared.clone(),
        }
    }

    /// The fiber event loop. Runs on an engine worker; a suspended fiber
    /// holds no worker.
    pub(crate) async fn run(self, entry: StepRef, mut packet: Packet, callback: CompletionCallback) {
        let shared = self.shared;
        let mut current: Option<StepRef> = Some(entry);
        *shared.state.lock().unwrap() = "running";

        let outcome = loop {
            if shared.cancelled.load(Ordering::SeqCst) {
                break FiberOutcome::Failed(OperatorError::Cancelled);
            }
            let step = match current.take() {
                Some(step) => step,
                None => break FiberOutcome::Completed,
            };
            debug!(fiber = shared.id, key = %shared.key, step = step.name(), "applying step");

            let applied = std::panic::AssertUnwindSafe(step.apply(&mut packet))
                .catch_unwind()
                .await;
            let action = match applied {
                Ok(action) => action,
                Err(panic) => {
                    error!(
                        fiber = shared.id,
                        key = %shared.key,
                        step = step.name(),
                        "step panicked: {}",
                        panic_message(&panic)
                    );
                    break FiberOutcome::Failed(OperatorError::Internal(format!(
                        "step {} panicked: {}",
                        step.name(),
                        panic_message(&panic)
                    )));
                }
            };

            match action {
                NextAction::Advance => current = step.successor(),
                NextAction::Invoke(next) => current = Some(next),
                NextAction::Terminate => break FiberOutcome::Completed,
                NextAction::Fail(err) => break FiberOutcome::Failed(err),
                NextAction::Delay { step, delay } => {
                    *shared.state.lock().unwrap() = "suspended";
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = shared.wake.notified() => {}
                    }
                    *shared.state.lock().unwrap() = "running";
                    current = Some(step);
                }
                NextAction::Suspend(suspension) => {
                    *shared.state.lock().unwrap() = "suspended";
                    (suspension.register)(ResumeHandle {
                        shared: shared.clone(),
                    });
                    let resumed = match suspension.deadline {
                        Some(ref deadline) => {
                            tokio::select! {
                                _ = shared.wake.notified() => true,
                                _ = sleep(deadline.after) => false,
                            }
                        }
                        None => {
                            shared.wake.notified().await;
                            true
                        }
                    };
                    *shared.state.lock().unwrap() = "running";
                    if !resumed || shared.cancelled.load(Ordering::SeqCst) {
                        if let Some(abandon) = suspension.on_abandon {
                            abandon();
                        }
                    }
                    if !resumed {
                        let waiting_for = suspension
                            .deadline
                            .map(|d| d.waiting_for)
                            .unwrap_or_default();
                        break FiberOutcome::Failed(OperatorError::TimeoutExceeded(waiting_for));
                    }
                    current = Some(suspension.resume);
                }
            }
        };

        *shared.state.lock().unwrap() = match &outcome {
            FiberOutcome::Completed => "completed",
            FiberOutcome::Failed(e) if e.is_cancellation() => "cancelled",
            FiberOutcome::Failed(_) => "failed",
        };
        debug!(fiber = shared.id, key = %shared.key, state = *shared.state.lock().unwrap(), "fiber finished");

        // Exactly one terminal callback, then the exit callbacks; late
        // registrations run inline from on_exit.
        callback(packet, outcome);
        let callbacks = {
            let mut exit = shared.exit.lock().unwrap();
            exit.finished = true;
            std::mem::take(&mut exit.callbacks)
        };
        for cb in callbacks {
            cb();
        }
    }
}

impl FiberHandle {
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn key(&self) -> &str {
        &self.shared.key
    }

    pub fn status(&self) -> &'static str {
        *self.shared.state.lock().unwrap()
    }

    pub fn is_finished(&self) -> bool {
        self.shared.exit.lock().unwrap().finished
    }

    /// Requests cooperative cancellation. A running fiber stops at its
    /// next step boundary; a suspended fiber is woken immediately.
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::SeqCst);
        self.shared.wake.notify_one();
    }

    /// Cancels the fiber and runs `callback` once it has fully exited.
    /// When the fiber has already terminated the callback runs inline.
    pub fn cancel_and_exit_callback(&self, callback: impl FnOnce() + Send + 'static) {
        self.cancel();
        self.on_exit(callback);
    }

    pub fn on_exit(&self, callback: impl FnOnce() + Send + 'static) {
        let immediate = {
            let mut exit = self.shared.exit.lock().unwrap();
            if exit.finished {
                true
            } else {
                exit.callbacks.push(Box::new(callback));
                return;
            }
        };
        if immediate {
            callback();
        }
    }

    pub(crate) fn predecessor_slot(&self) -> Arc<Mutex<Option<FiberHandle>>> {
        self.shared.predecessor.clone()
    }

    pub(crate) fn set_predecessor(&self, old: FiberHandle) {
        *self.shared.predecessor.lock().unwrap() = Some(old);
    }

    /// The displaced fiber this one was still waiting on when it died, if
    /// any. Consumed by the successor's wait step.
    pub(crate) fn take_unsettled_predecessor(&self) -> Option<FiberHandle> {
        self.shared.predecessor.lock().unwrap().take()
    }
}

/// Wakes a suspended fiber. Resuming more than once, or after a timeout,
/// is harmless: the resumed step re-reads state and decides again.
#[derive(Clone)]
pub struct ResumeHandle {
    shared: Arc<FiberShared>,
}

impl ResumeHandle {
    pub fn resume(&self) {
        self.shared.wake.notify_one();
    }

    pub fn fiber(&self) -> FiberHandle {
        FiberHandle {
            shared: self.shared.clone(),
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
