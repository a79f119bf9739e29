use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};

use crate::kernel::fiber::{CompletionCallback, Fiber, FiberHandle};
use crate::kernel::packet::Packet;
use crate::kernel::step::StepRef;

/// Hosts fibers on the runtime's worker pool and provides the timers the
/// step directives rely on. Cheap to clone; all clones share one pool.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    handle: tokio::runtime::Handle,
    workers: usize,
    fiber_seq: AtomicU64,
}

impl Engine {
    /// Must be called from within the runtime whose workers will host the
    /// fibers.
    pub fn new(workers: usize) -> Engine {
        Engine {
            inner: Arc::new(EngineInner {
                handle: tokio::runtime::Handle::current(),
                workers,
                fiber_seq: AtomicU64::new(1),
            }),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.inner.workers
    }

    /// Allocates an unstarted fiber. The identifier is unique per engine
    /// and is how gates compare fibers.
    pub fn create_fiber(&self, key: &str) -> Fiber {
        Fiber::new(self.inner.fiber_seq.fetch_add(1, Ordering::SeqCst), key)
    }

    /// Starts the fiber on the pool. The handle outlives the execution.
    pub fn submit(
        &self,
        fiber: Fiber,
        entry: StepRef,
        packet: Packet,
        callback: CompletionCallback,
    ) -> FiberHandle {
        let handle = fiber.handle();
        self.inner.handle.spawn(fiber.run(entry, packet, callback));
        handle
    }

    pub fn schedule<F>(&self, delay: Duration, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.handle.spawn(async move {
            sleep(delay).await;
            task.await;
        })
    }

    pub fn schedule_at_fixed_rate<F, Fut>(
        &self,
        initial_delay: Duration,
        period: Duration,
        mut task: F,
    ) -> JoinHandle<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        self.inner.handle.spawn(async move {
            sleep(initial_delay).await;
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick of an interval completes immediately.
            ticker.tick().await;
            loop {
                task().await;
                ticker.tick().await;
            }
        })
    }
}
