//! The single-threaded worker loop.
//!
//! Each worker is one OS thread hosting a current-thread Tokio runtime. The
//! loop sleeps until a work item arrives, the earliest timer is due, or a
//! shutdown is signalled; it then drains every queued item in FIFO order and
//! fires every due timer.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, trace, warn};

use crate::ShutdownMode;
use crate::error::Result;
use crate::job::{Liveness, WorkItem};
use crate::pool::{RoutingKey, WorkerPool};
use crate::session::ProtocolSession;
use crate::timer::{TimerCallback, TimerHandle, TimerQueue};

const IDLE_SLEEP: Duration = Duration::from_secs(3153600000);

/// Worker-local state handed to every job and timer callback.
///
/// Everything reachable from here belongs to exactly one worker thread.
pub struct WorkerContext {
    index: usize,
    pool: WorkerPool,
    timers: TimerQueue,
    sessions: HashMap<RoutingKey, Box<dyn ProtocolSession>>,
}

impl WorkerContext {
    pub(crate) fn new(index: usize, pool: WorkerPool) -> Self {
        Self {
            index,
            pool,
            timers: TimerQueue::new(),
            sessions: HashMap::new(),
        }
    }

    /// Index of the worker running this context.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Handle to the pool this worker belongs to.
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Schedule a one-shot timer on this worker without a queue round-trip.
    pub fn schedule_local(
        &mut self,
        delay: Duration,
        owner: Option<Liveness>,
        callback: TimerCallback,
    ) -> TimerHandle {
        let handle = self.pool.next_timer_handle();
        // One-shot timers cannot fail validation.
        let _ = self
            .timers
            .schedule(handle, Instant::now() + delay, None, owner, callback);
        handle
    }

    /// Schedule a repeating timer on this worker.
    pub fn schedule_local_repeating(
        &mut self,
        interval: Duration,
        owner: Option<Liveness>,
        callback: TimerCallback,
    ) -> Result<TimerHandle> {
        let handle = self.pool.next_timer_handle();
        self.timers.schedule(
            handle,
            Instant::now() + interval,
            Some(interval),
            owner,
            callback,
        )
    }

    pub fn cancel_local(&mut self, handle: TimerHandle) -> bool {
        self.timers.cancel(handle)
    }

    pub fn has_timer(&self, handle: TimerHandle) -> bool {
        self.timers.contains(handle)
    }

    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn has_session(&self, key: RoutingKey) -> bool {
        self.sessions.contains_key(&key)
    }

    /// Install a session, closing any previous session under the same key.
    pub fn insert_session(&mut self, session: Box<dyn ProtocolSession>) {
        let key = session.key();
        if let Some(mut previous) = self.sessions.remove(&key) {
            warn!(worker = self.index, key, "replacing live session");
            previous.handle_close(self);
        }
        self.sessions.insert(key, session);
    }

    /// Remove a session without notifying it.
    pub fn take_session(&mut self, key: RoutingKey) -> Option<Box<dyn ProtocolSession>> {
        self.sessions.remove(&key)
    }

    /// Run `f` against the session under `key`.
    ///
    /// The session is taken out of the slot for the duration of the call so
    /// it can borrow the context mutably; it is put back unless it closed.
    pub fn with_session<R>(
        &mut self,
        key: RoutingKey,
        f: impl FnOnce(&mut dyn ProtocolSession, &mut WorkerContext) -> R,
    ) -> Option<R> {
        let mut session = self.sessions.remove(&key)?;
        let out = f(session.as_mut(), self);
        if !session.is_closed() && !self.sessions.contains_key(&key) {
            self.sessions.insert(key, session);
        }
        Some(out)
    }

    /// Like [`with_session`](Self::with_session), downcast to `S`.
    ///
    /// Returns `None` when no session of type `S` lives under `key`.
    pub fn with_session_as<S, R>(
        &mut self,
        key: RoutingKey,
        f: impl FnOnce(&mut S, &mut WorkerContext) -> R,
    ) -> Option<R>
    where
        S: ProtocolSession,
    {
        self.with_session(key, |session, cx| {
            let any: &mut dyn Any = session.as_any_mut();
            any.downcast_mut::<S>().map(|typed| f(typed, cx))
        })
        .flatten()
    }

    fn close_all_sessions(&mut self) {
        let keys: Vec<RoutingKey> = self.sessions.keys().copied().collect();
        for key in keys {
            if let Some(mut session) = self.sessions.remove(&key) {
                session.handle_close(self);
            }
        }
    }
}

impl std::fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerContext")
            .field("index", &self.index)
            .field("timers", &self.timers)
            .field("sessions", &self.sessions.len())
            .finish()
    }
}

/// One worker: its receiving queue, its shutdown signal and its state.
pub(crate) struct Worker {
    cx: WorkerContext,
    jobs: mpsc::UnboundedReceiver<WorkItem>,
    shutdown: watch::Receiver<Option<ShutdownMode>>,
}

impl Worker {
    pub(crate) fn new(
        cx: WorkerContext,
        jobs: mpsc::UnboundedReceiver<WorkItem>,
        shutdown: watch::Receiver<Option<ShutdownMode>>,
    ) -> Self {
        Self { cx, jobs, shutdown }
    }

    /// Thread entry point.
    pub(crate) fn run(self) {
        let index = self.cx.index;
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
        {
            Ok(runtime) => runtime,
            Err(err) => {
                error!(worker = index, %err, "failed to build worker runtime");
                return;
            }
        };
        runtime.block_on(self.event_loop());
        debug!(worker = index, "worker exited");
    }

    async fn event_loop(mut self) {
        let sleep = tokio::time::sleep(IDLE_SLEEP);
        tokio::pin!(sleep);

        loop {
            let wake_at = self
                .cx
                .timers
                .next_deadline()
                .unwrap_or_else(|| Instant::now() + IDLE_SLEEP);
            sleep
                .as_mut()
                .reset(tokio::time::Instant::from_std(wake_at));

            tokio::select! {
                biased;
                changed = self.shutdown.changed() => {
                    let mode = match changed {
                        Ok(()) => *self.shutdown.borrow_and_update(),
                        Err(_) => Some(ShutdownMode::Immediate),
                    };
                    match mode {
                        Some(ShutdownMode::Graceful) => {
                            self.drain_jobs();
                            self.cx.close_all_sessions();
                            return;
                        }
                        Some(ShutdownMode::Immediate) => {
                            self.cx.close_all_sessions();
                            return;
                        }
                        None => continue,
                    }
                }
                item = self.jobs.recv() => {
                    let Some(item) = item else { return };
                    self.handle(item);
                    self.drain_jobs();
                }
                () = &mut sleep => {}
            }

            self.fire_due_timers();
        }
    }

    fn drain_jobs(&mut self) {
        while let Ok(item) = self.jobs.try_recv() {
            self.handle(item);
        }
    }

    fn handle(&mut self, item: WorkItem) {
        match item {
            WorkItem::Run(job) => {
                if job.is_stale() {
                    trace!(worker = self.cx.index, "dropping job of a dead owner");
                    return;
                }
                let cx = &mut self.cx;
                isolate(cx.index, "job", || job.run(cx));
            }
            WorkItem::Schedule {
                handle,
                deadline,
                repeat,
                owner,
                callback,
            } => {
                if let Err(err) = self
                    .cx
                    .timers
                    .schedule(handle, deadline, repeat, owner, callback)
                {
                    warn!(worker = self.cx.index, %err, "dropping timer request");
                }
            }
            WorkItem::Cancel(handle) => {
                if !self.cx.timers.cancel(handle) {
                    trace!(worker = self.cx.index, timer = handle.as_raw(), "cancel of a fired timer");
                }
            }
        }
    }

    fn fire_due_timers(&mut self) {
        let now = Instant::now();
        while let Some(mut entry) = self.cx.timers.pop_next_due(now) {
            if entry.is_live() {
                let cx = &mut self.cx;
                isolate(cx.index, "timer", || entry.fire(cx));
            }
            if entry.is_repeating() {
                self.cx.timers.rearm(entry, Instant::now());
            }
        }
    }
}

/// Run one invocation, logging and discarding a panic.
fn isolate(worker: usize, what: &str, f: impl FnOnce()) {
    if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(f)) {
        error!(worker, what, reason = panic_message(&*panic), "invocation panicked");
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg
    } else {
        "unknown panic"
    }
}
