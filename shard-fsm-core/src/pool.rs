//! Sharded worker pool.
//!
//! Every routing key maps to worker `key % N`. Work for one entity therefore
//! always runs on the same thread, in post order, without any locking.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::ShutdownMode;
use crate::config::PoolConfig;
use crate::error::{PoolError, Result};
use crate::job::{Job, JobQueue, Liveness, WorkItem};
use crate::session::ProtocolSession;
use crate::timer::TimerHandle;
use crate::worker::{Worker, WorkerContext};

/// Stable identifier of an entity (connection, session) used for routing.
pub type RoutingKey = u64;

const CREATED: u8 = 0;
const RUNNING: u8 = 1;
const STOPPED: u8 = 2;

struct PoolInner {
    name: String,
    queues: Vec<JobQueue>,
    // Receivers parked here between `new()` and `start()`.
    parked: Mutex<Vec<mpsc::UnboundedReceiver<WorkItem>>>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    shutdown_tx: watch::Sender<Option<ShutdownMode>>,
    default_shutdown: ShutdownMode,
    state: AtomicU8,
    next_timer: AtomicU64,
}

/// Handle to a pool of single-threaded workers.
///
/// Cloning is cheap; every clone addresses the same workers. Construct one
/// pool at startup and pass it to whatever needs scheduling.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Create a pool with `thread_count` workers. Nothing runs until
    /// [`start`](Self::start); work posted before that is queued.
    pub fn new(name: impl Into<String>, thread_count: usize) -> Result<Self> {
        Self::with_shutdown(name.into(), thread_count, ShutdownMode::Graceful)
    }

    pub fn from_config(config: &PoolConfig) -> Result<Self> {
        Self::with_shutdown(config.name.clone(), config.threads, config.shutdown)
    }

    fn with_shutdown(name: String, thread_count: usize, shutdown: ShutdownMode) -> Result<Self> {
        if thread_count == 0 {
            return Err(PoolError::NoThreads(name));
        }
        let (queues, receivers): (Vec<_>, Vec<_>) =
            (0..thread_count).map(|_| JobQueue::new()).unzip();
        let (shutdown_tx, _) = watch::channel(None);

        Ok(Self {
            inner: Arc::new(PoolInner {
                name,
                queues,
                parked: Mutex::new(receivers),
                threads: Mutex::new(Vec::with_capacity(thread_count)),
                shutdown_tx,
                default_shutdown: shutdown,
                state: AtomicU8::new(CREATED),
                next_timer: AtomicU64::new(1),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn thread_count(&self) -> usize {
        self.inner.queues.len()
    }

    /// Worker index owning `key`. Pure function of the key and the pool size.
    pub fn worker_index(&self, key: RoutingKey) -> usize {
        (key % self.inner.queues.len() as u64) as usize
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == RUNNING
    }

    /// Launch one thread per worker, named `{name}-{index}`.
    pub fn start(&self) -> Result<()> {
        if self
            .inner
            .state
            .compare_exchange(CREATED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(PoolError::AlreadyStarted(self.inner.name.clone()));
        }

        let receivers = std::mem::take(&mut *self.inner.parked.lock());
        let mut threads = self.inner.threads.lock();
        for (index, jobs) in receivers.into_iter().enumerate() {
            let worker = Worker::new(
                WorkerContext::new(index, self.clone()),
                jobs,
                self.inner.shutdown_tx.subscribe(),
            );
            let spawned = thread::Builder::new()
                .name(format!("{}-{}", self.inner.name, index))
                .spawn(move || worker.run());
            match spawned {
                Ok(handle) => threads.push(handle),
                Err(err) => {
                    drop(threads);
                    self.stop_with(ShutdownMode::Immediate);
                    return Err(PoolError::Spawn(err));
                }
            }
        }
        info!(pool = %self.inner.name, threads = self.thread_count(), "worker pool started");
        Ok(())
    }

    /// Signal every worker to exit using the configured shutdown mode
    /// (graceful by default: queued work is drained first).
    pub fn stop(&self) {
        self.stop_with(self.inner.default_shutdown);
    }

    /// Signal every worker to exit, dropping queued work.
    pub fn stop_immediate(&self) {
        self.stop_with(ShutdownMode::Immediate);
    }

    fn stop_with(&self, mode: ShutdownMode) {
        let previous = self.inner.state.swap(STOPPED, Ordering::AcqRel);
        if previous == STOPPED {
            return;
        }
        info!(pool = %self.inner.name, ?mode, "worker pool stopping");
        self.inner.shutdown_tx.send_replace(Some(mode));
        // Workers that never started still own parked receivers.
        self.inner.parked.lock().clear();
    }

    /// Join every worker thread. Call after [`stop`](Self::stop).
    ///
    /// Must not be called from a worker thread.
    pub fn wait_stop(&self) -> Result<()> {
        let threads = std::mem::take(&mut *self.inner.threads.lock());
        let mut result = Ok(());
        for handle in threads {
            let name = handle.thread().name().unwrap_or_default().to_string();
            if handle.join().is_err() {
                warn!(pool = %self.inner.name, thread = %name, "worker thread panicked");
                result = Err(PoolError::WorkerPanicked(name));
            }
        }
        debug!(pool = %self.inner.name, "worker pool joined");
        result
    }

    fn post(&self, key: RoutingKey, item: WorkItem) -> Result<()> {
        if self.inner.state.load(Ordering::Acquire) == STOPPED {
            return Err(PoolError::Stopped(self.inner.name.clone()));
        }
        let queue = &self.inner.queues[self.worker_index(key)];
        if queue.post(item) {
            Ok(())
        } else {
            Err(PoolError::Stopped(self.inner.name.clone()))
        }
    }

    /// Run `job` on the worker owning `key`.
    pub fn process<F>(&self, key: RoutingKey, job: F) -> Result<()>
    where
        F: FnOnce(&mut WorkerContext) + Send + 'static,
    {
        self.post(key, WorkItem::Run(Job::new(job)))
    }

    /// Run `job` on the worker owning `key` unless `owner` dies first.
    pub fn process_owned<F>(&self, key: RoutingKey, owner: Liveness, job: F) -> Result<()>
    where
        F: FnOnce(&mut WorkerContext) + Send + 'static,
    {
        self.post(key, WorkItem::Run(Job::owned(owner, job)))
    }

    /// Post a prebuilt [`Job`].
    pub fn post_job(&self, key: RoutingKey, job: Job) -> Result<()> {
        self.post(key, WorkItem::Run(job))
    }

    /// Fire `callback` once on the worker owning `key` after `delay`.
    pub fn add_timer<F>(&self, key: RoutingKey, delay: Duration, callback: F) -> Result<TimerHandle>
    where
        F: FnMut(&mut WorkerContext) + Send + 'static,
    {
        self.schedule(key, delay, None, None, Box::new(callback))
    }

    /// Fire `callback` every `interval` on the worker owning `key`.
    ///
    /// A zero interval is rejected.
    pub fn add_repeating_timer<F>(
        &self,
        key: RoutingKey,
        interval: Duration,
        callback: F,
    ) -> Result<TimerHandle>
    where
        F: FnMut(&mut WorkerContext) + Send + 'static,
    {
        if interval.is_zero() {
            return Err(PoolError::InvalidInterval);
        }
        self.schedule(key, interval, Some(interval), None, Box::new(callback))
    }

    /// Like [`add_timer`](Self::add_timer), skipped once `owner` dies.
    pub fn add_owned_timer<F>(
        &self,
        key: RoutingKey,
        delay: Duration,
        owner: Liveness,
        callback: F,
    ) -> Result<TimerHandle>
    where
        F: FnMut(&mut WorkerContext) + Send + 'static,
    {
        self.schedule(key, delay, None, Some(owner), Box::new(callback))
    }

    fn schedule(
        &self,
        key: RoutingKey,
        delay: Duration,
        repeat: Option<Duration>,
        owner: Option<Liveness>,
        callback: crate::timer::TimerCallback,
    ) -> Result<TimerHandle> {
        let handle = self.next_timer_handle();
        self.post(
            key,
            WorkItem::Schedule {
                handle,
                deadline: Instant::now() + delay,
                repeat,
                owner,
                callback,
            },
        )?;
        Ok(handle)
    }

    /// Cancel a timer. The request travels through the owning worker's FIFO,
    /// so it takes effect before any later fire of that timer.
    pub fn cancel_timer(&self, key: RoutingKey, handle: TimerHandle) -> Result<()> {
        self.post(key, WorkItem::Cancel(handle))
    }

    pub(crate) fn next_timer_handle(&self) -> TimerHandle {
        TimerHandle::from_raw(self.inner.next_timer.fetch_add(1, Ordering::Relaxed))
    }

    /// Install `session` on the worker owning its key.
    pub fn open_session(&self, session: Box<dyn ProtocolSession>) -> Result<()> {
        let key = session.key();
        self.process(key, move |cx| cx.insert_session(session))
    }

    /// Deliver transport bytes to the session under `key`.
    pub fn deliver_input(&self, key: RoutingKey, bytes: Vec<u8>) -> Result<()> {
        self.process(key, move |cx| {
            if cx
                .with_session(key, |session, cx| session.handle_input(cx, &bytes))
                .is_none()
            {
                debug!(key, "input for unknown session dropped");
            }
        })
    }

    /// Notify the session under `key` that its connection closed.
    pub fn deliver_close(&self, key: RoutingKey) -> Result<()> {
        self.process(key, move |cx| {
            if let Some(mut session) = cx.take_session(key) {
                session.handle_close(cx);
            }
        })
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.inner.name)
            .field("threads", &self.inner.queues.len())
            .field("state", &self.inner.state.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc as std_mpsc;

    use super::*;

    fn started(name: &str, threads: usize) -> WorkerPool {
        let pool = WorkerPool::new(name, threads).unwrap();
        pool.start().unwrap();
        pool
    }

    fn shutdown(pool: &WorkerPool) {
        pool.stop();
        pool.wait_stop().unwrap();
    }

    #[test]
    fn zero_threads_is_rejected() {
        assert!(matches!(
            WorkerPool::new("empty", 0),
            Err(PoolError::NoThreads(_))
        ));
    }

    #[test]
    fn routing_is_key_mod_n() {
        let pool = WorkerPool::new("route", 4).unwrap();
        for key in 0..64u64 {
            assert_eq!(pool.worker_index(key), (key % 4) as usize);
        }
    }

    #[test]
    fn jobs_run_on_the_owning_worker() {
        let pool = started("owner", 3);
        let (tx, rx) = std_mpsc::channel();
        for key in 0..30u64 {
            let tx = tx.clone();
            pool.process(key, move |cx| {
                let thread = thread::current().name().unwrap_or_default().to_string();
                tx.send((key, cx.index(), thread)).unwrap();
            })
            .unwrap();
        }
        for _ in 0..30 {
            let (key, index, thread) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(index, (key % 3) as usize);
            assert_eq!(thread, format!("owner-{index}"));
        }
        shutdown(&pool);
    }

    #[test]
    fn jobs_posted_before_start_run_after_start() {
        let pool = WorkerPool::new("early", 2).unwrap();
        let (tx, rx) = std_mpsc::channel();
        pool.process(1, move |_| tx.send(()).unwrap()).unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        pool.start().unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        shutdown(&pool);
    }

    #[test]
    fn start_twice_fails() {
        let pool = started("twice", 1);
        assert!(matches!(pool.start(), Err(PoolError::AlreadyStarted(_))));
        shutdown(&pool);
    }

    #[test]
    fn stopped_pool_rejects_work() {
        let pool = started("closed", 1);
        shutdown(&pool);
        assert!(matches!(
            pool.process(0, |_| {}),
            Err(PoolError::Stopped(_))
        ));
    }

    #[test]
    fn graceful_stop_drains_queued_jobs() {
        let pool = WorkerPool::new("drain", 1).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let ran = Arc::clone(&ran);
            pool.process(0, move |_| {
                ran.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.start().unwrap();
        shutdown(&pool);
        assert_eq!(ran.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn panicking_job_does_not_kill_the_worker() {
        let pool = started("panic", 1);
        let (tx, rx) = std_mpsc::channel();
        pool.process(0, |_| panic!("boom")).unwrap();
        pool.process(0, move |_| tx.send(()).unwrap()).unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        shutdown(&pool);
    }

    #[test]
    fn dead_owner_skips_job() {
        let pool = started("owned", 1);
        let guard = crate::LivenessGuard::new();
        let token = guard.token();
        drop(guard);
        let (tx, rx) = std_mpsc::channel();
        let skipped_tx = tx.clone();
        pool.process_owned(0, token, move |_| skipped_tx.send("stale").unwrap())
            .unwrap();
        pool.process(0, move |_| tx.send("fresh").unwrap()).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "fresh");
        shutdown(&pool);
    }

    #[test]
    fn timer_fires_after_delay() {
        let pool = started("timer", 2);
        let (tx, rx) = std_mpsc::channel();
        let posted = Instant::now();
        pool.add_timer(5, Duration::from_millis(30), move |cx| {
            tx.send((Instant::now(), cx.index())).unwrap();
        })
        .unwrap();
        let (fired, index) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(fired.duration_since(posted) >= Duration::from_millis(30));
        assert_eq!(index, 1);
        shutdown(&pool);
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let pool = started("cancel", 1);
        let (tx, rx) = std_mpsc::channel();
        let cancelled_tx = tx.clone();
        let handle = pool
            .add_timer(0, Duration::from_millis(20), move |_| {
                cancelled_tx.send("cancelled").unwrap();
            })
            .unwrap();
        pool.cancel_timer(0, handle).unwrap();
        pool.add_timer(0, Duration::from_millis(60), move |_| {
            tx.send("kept").unwrap();
        })
        .unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "kept");
        assert!(rx.try_recv().is_err());
        shutdown(&pool);
    }

    #[test]
    fn repeating_timer_fires_until_cancelled() {
        let pool = started("repeat", 1);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let handle = pool
            .add_repeating_timer(0, Duration::from_millis(5), move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        thread::sleep(Duration::from_millis(60));
        pool.cancel_timer(0, handle).unwrap();

        let (tx, rx) = std_mpsc::channel();
        pool.process(0, move |_| tx.send(()).unwrap()).unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let after_cancel = fired.load(Ordering::SeqCst);
        assert!(after_cancel >= 2);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(fired.load(Ordering::SeqCst), after_cancel);
        shutdown(&pool);
    }

    #[test]
    fn zero_interval_is_rejected_synchronously() {
        let pool = WorkerPool::new("zero", 1).unwrap();
        assert!(matches!(
            pool.add_repeating_timer(0, Duration::ZERO, |_| {}),
            Err(PoolError::InvalidInterval)
        ));
    }

    #[test]
    fn timer_handles_are_unique() {
        let pool = WorkerPool::new("handles", 2).unwrap();
        let handles: HashSet<_> = (0..100)
            .map(|key| pool.add_timer(key, Duration::from_secs(60), |_| {}).unwrap())
            .collect();
        assert_eq!(handles.len(), 100);
    }
}
