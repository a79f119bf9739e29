use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::OperatorError;
use crate::kernel::fiber::ResumeHandle;
use crate::kernel::packet::Packet;

pub type StepRef = Arc<dyn Step>;

/// One unit of a reconciliation workflow. Steps are linked into chains at
/// construction time through their successor pointer and must hold no
/// mutable per-fiber state; everything mutable travels in the packet.
#[async_trait]
pub trait Step: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Chain successor, linked at construction. `NextAction::Advance`
    /// continues here.
    fn successor(&self) -> Option<StepRef>;

    async fn apply(&self, packet: &mut Packet) -> NextAction;
}

/// Directive returned by a step; the fiber loop interprets it. Step
/// boundaries are the only legal cancellation points, so a step that
/// needs to wait hands control back with `Suspend` or `Delay` instead of
/// blocking inline.
pub enum NextAction {
    /// Continue with the chain successor.
    Advance,
    /// Continue with the named step instead of the successor. Re-entering
    /// earlier logic always goes through a freshly constructed step that
    /// is forward-linked; chains stay acyclic.
    Invoke(StepRef),
    /// Park the fiber until an external event resumes it.
    Suspend(Suspension),
    /// Re-run the given step after a delay on the engine timer.
    Delay { step: StepRef, delay: Duration },
    /// Normal completion of the fiber.
    Terminate,
    /// Propagate to the fiber's failure callback.
    Fail(OperatorError),
}

/// A parked continuation. `register` receives a resume handle and hooks it
/// to whatever event ends the wait; `resume` is the step the fiber runs
/// once woken. The deadline fires the fiber's failure callback with
/// `TimeoutExceeded` if nothing resumes it in time.
pub struct Suspension {
    pub register: Box<dyn FnOnce(ResumeHandle) + Send>,
    pub resume: StepRef,
    pub deadline: Option<SuspendDeadline>,
    /// Runs when the wait ends without a resume (cancellation or
    /// deadline), before the fiber's terminal callbacks. Lets a wait step
    /// hand its pending obligation to whoever comes next.
    pub on_abandon: Option<Box<dyn FnOnce() + Send>>,
}

pub struct SuspendDeadline {
    pub after: Duration,
    pub waiting_for: String,
}

impl NextAction {
    pub fn suspend(
        resume: StepRef,
        deadline: Option<SuspendDeadline>,
        register: impl FnOnce(ResumeHandle) + Send + 'static,
    ) -> NextAction {
        NextAction::Suspend(Suspension {
            register: Box::new(register),
            resume,
            deadline,
            on_abandon: None,
        })
    }
}

impl SuspendDeadline {
    pub fn new(after: Duration, waiting_for: impl Into<String>) -> Option<SuspendDeadline> {
        Some(SuspendDeadline {
            after,
            waiting_for: waiting_for.into(),
        })
    }
}
