//! Jobs, the per-worker FIFO that carries them, and liveness flags.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::timer::{TimerCallback, TimerHandle};
use crate::worker::WorkerContext;

/// Owner side of a liveness flag.
///
/// Deferred work (jobs, timers, HTTP completions) holds a [`Liveness`] token
/// and is discarded once the guard is revoked or dropped.
#[derive(Debug)]
pub struct LivenessGuard(Arc<AtomicBool>);

impl LivenessGuard {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    /// Hand out a weak token observing this guard.
    pub fn token(&self) -> Liveness {
        Liveness(Arc::downgrade(&self.0))
    }

    /// Mark the owner dead. Idempotent.
    pub fn revoke(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub fn is_alive(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

impl Default for LivenessGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LivenessGuard {
    fn drop(&mut self) {
        self.revoke();
    }
}

/// Weak observer of a [`LivenessGuard`].
#[derive(Debug, Clone)]
pub struct Liveness(Weak<AtomicBool>);

impl Liveness {
    /// True while the guard exists and has not been revoked.
    pub fn is_alive(&self) -> bool {
        self.0
            .upgrade()
            .is_some_and(|flag| flag.load(Ordering::Acquire))
    }

    /// True when this token was issued by `guard`.
    pub fn belongs_to(&self, guard: &LivenessGuard) -> bool {
        std::ptr::eq(self.0.as_ptr(), Arc::as_ptr(&guard.0))
    }
}

type Task = Box<dyn FnOnce(&mut WorkerContext) + Send>;

/// A unit of work executed once on the worker that owns its routing key.
pub struct Job {
    task: Task,
    owner: Option<Liveness>,
}

impl Job {
    pub fn new<F>(task: F) -> Self
    where
        F: FnOnce(&mut WorkerContext) + Send + 'static,
    {
        Self {
            task: Box::new(task),
            owner: None,
        }
    }

    /// A job that is skipped when `owner` is no longer alive.
    pub fn owned<F>(owner: Liveness, task: F) -> Self
    where
        F: FnOnce(&mut WorkerContext) + Send + 'static,
    {
        Self {
            task: Box::new(task),
            owner: Some(owner),
        }
    }

    pub fn is_stale(&self) -> bool {
        self.owner.as_ref().is_some_and(|owner| !owner.is_alive())
    }

    pub(crate) fn run(self, cx: &mut WorkerContext) {
        (self.task)(cx);
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job").field("owner", &self.owner).finish()
    }
}

/// Everything a worker receives through its queue. Timer requests travel
/// through the same FIFO as jobs so a cancel never overtakes its schedule.
pub(crate) enum WorkItem {
    Run(Job),
    Schedule {
        handle: TimerHandle,
        deadline: Instant,
        repeat: Option<Duration>,
        owner: Option<Liveness>,
        callback: TimerCallback,
    },
    Cancel(TimerHandle),
}

/// Sending half of one worker's FIFO. Cloneable and usable from any thread.
#[derive(Clone)]
pub(crate) struct JobQueue {
    tx: mpsc::UnboundedSender<WorkItem>,
}

impl JobQueue {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<WorkItem>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Returns `false` when the worker has gone away.
    pub(crate) fn post(&self, item: WorkItem) -> bool {
        self.tx.send(item).is_ok()
    }
}
