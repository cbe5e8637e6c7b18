//! Protocol sessions and the FSM session that drives them.

use std::any::Any;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tracing::{debug, error, trace};

use crate::error::Result;
use crate::fsm::{FiniteStateMachine, Machine};
use crate::job::{Liveness, LivenessGuard};
use crate::pool::{RoutingKey, WorkerPool};
use crate::timer::TimerHandle;
use crate::worker::{WorkerContext, panic_message};

/// A stateful object bound to one connection or exchange.
///
/// Sessions live in their worker's slot table and are only ever touched on
/// that worker.
pub trait ProtocolSession: Send + 'static {
    fn key(&self) -> RoutingKey;

    /// Bytes arrived on the session's connection.
    fn handle_input(&mut self, cx: &mut WorkerContext, bytes: &[u8]);

    /// The connection closed. The session must release its resources.
    fn handle_close(&mut self, cx: &mut WorkerContext);

    fn is_closed(&self) -> bool;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// What a single [`FsmSession::dispatch`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome<S> {
    /// The action ran and the session moved.
    Moved { from: S, to: S },
    /// The action ran and kept the current state.
    Held(S),
    /// No transition is defined for the event in the current state.
    Unhandled,
    /// The action returned an error; the state is unchanged.
    Failed,
    /// The session is closed; the event was discarded.
    Stale,
}

/// A session driven by the shared transition table of `M`.
pub struct FsmSession<M: Machine> {
    key: RoutingKey,
    state: M::State,
    machine: M,
    table: Arc<FiniteStateMachine<M>>,
    guard: LivenessGuard,
    state_tx: watch::Sender<M::State>,
    timers: Vec<TimerHandle>,
    state_timer: Option<TimerHandle>,
    epoch: u64,
    closed: bool,
}

impl<M: Machine> FsmSession<M> {
    pub fn new(key: RoutingKey, machine: M, table: Arc<FiniteStateMachine<M>>) -> Self {
        let state = table.initial();
        let (state_tx, _) = watch::channel(state);
        Self {
            key,
            state,
            machine,
            table,
            guard: LivenessGuard::new(),
            state_tx,
            timers: Vec::new(),
            state_timer: None,
            epoch: 0,
            closed: false,
        }
    }

    /// Install a new session on its worker and return a handle to it.
    pub fn spawn(
        pool: &WorkerPool,
        key: RoutingKey,
        machine: M,
        table: Arc<FiniteStateMachine<M>>,
    ) -> Result<SessionHandle<M>> {
        let session = Self::new(key, machine, table);
        let handle = session.handle(pool.clone());
        pool.open_session(Box::new(session))?;
        Ok(handle)
    }

    /// Handle for posting events to this session from any thread.
    pub fn handle(&self, pool: WorkerPool) -> SessionHandle<M> {
        SessionHandle {
            pool,
            key: self.key,
            liveness: self.guard.token(),
            state_rx: Some(self.state_tx.subscribe()),
            _machine: PhantomData,
        }
    }

    pub fn state(&self) -> M::State {
        self.state
    }

    pub fn machine(&self) -> &M {
        &self.machine
    }

    pub fn machine_mut(&mut self) -> &mut M {
        &mut self.machine
    }

    pub fn liveness(&self) -> Liveness {
        self.guard.token()
    }

    /// Feed one event through the table.
    ///
    /// Must run on the session's worker. Actions never re-enter this method;
    /// follow-up events are re-posted through [`SessionContext::post`].
    pub fn dispatch(
        &mut self,
        cx: &mut WorkerContext,
        event: M::Event,
        payload: M::Payload,
    ) -> DispatchOutcome<M::State> {
        if self.closed {
            trace!(key = self.key, ?event, "event for closed session discarded");
            return DispatchOutcome::Stale;
        }
        let from = self.state;
        let Some(entry) = self.table.lookup(from, event).copied() else {
            debug!(key = self.key, state = ?from, ?event, "no transition defined, ignoring");
            return DispatchOutcome::Unhandled;
        };

        let mut scx = SessionContext {
            key: self.key,
            state: from,
            event,
            worker: cx,
            liveness: self.guard.token(),
            timers: &mut self.timers,
            _machine: PhantomData,
        };
        let machine = &mut self.machine;
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            (entry.action)(machine, &mut scx, payload)
        }));

        match result {
            Err(panic) => {
                let reason = panic_message(&*panic);
                error!(key = self.key, state = ?from, ?event, reason, "action panicked");
                DispatchOutcome::Failed
            }
            Ok(Ok(transition)) => match transition.resolve(entry.next) {
                Some(to) => {
                    self.enter(cx, to, entry.timeout);
                    DispatchOutcome::Moved { from, to }
                }
                None => DispatchOutcome::Held(from),
            },
            Ok(Err(err)) => {
                error!(key = self.key, state = ?from, ?event, %err, "action failed");
                DispatchOutcome::Failed
            }
        }
    }

    fn enter(&mut self, cx: &mut WorkerContext, to: M::State, timeout: Option<Duration>) {
        if let Some(timer) = self.state_timer.take() {
            cx.cancel_local(timer);
        }
        debug!(key = self.key, from = ?self.state, ?to, "transition");
        self.state = to;
        self.epoch += 1;

        // Observers of a terminal state must already see the session dead.
        if self.table.is_terminal(to) {
            self.close(cx);
            self.state_tx.send_replace(to);
            return;
        }
        self.state_tx.send_replace(to);
        if let (Some(after), Some(event)) = (timeout, self.table.timeout_event()) {
            self.state_timer = Some(self.arm_state_timeout(cx, after, event));
        }
    }

    fn arm_state_timeout(
        &mut self,
        cx: &mut WorkerContext,
        after: Duration,
        event: M::Event,
    ) -> TimerHandle {
        let key = self.key;
        let epoch = self.epoch;
        let liveness = self.guard.token();
        let owner = liveness.clone();
        cx.schedule_local(
            after,
            Some(owner),
            Box::new(move |cx| {
                cx.with_session_as::<FsmSession<M>, _>(key, |session, cx| {
                    if liveness.belongs_to(&session.guard) && session.epoch == epoch {
                        debug!(key, state = ?session.state, "state timeout expired");
                        session.state_timer = None;
                        session.dispatch(cx, event, M::Payload::default());
                    }
                });
            }),
        )
    }

    fn close(&mut self, cx: &mut WorkerContext) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.guard.revoke();
        if let Some(timer) = self.state_timer.take() {
            cx.cancel_local(timer);
        }
        for timer in self.timers.drain(..) {
            cx.cancel_local(timer);
        }
        debug!(key = self.key, state = ?self.state, "session closed");
    }
}

impl<M: Machine> ProtocolSession for FsmSession<M> {
    fn key(&self) -> RoutingKey {
        self.key
    }

    fn handle_input(&mut self, cx: &mut WorkerContext, bytes: &[u8]) {
        match M::on_input(bytes) {
            Some((event, payload)) => {
                self.dispatch(cx, event, payload);
            }
            None => trace!(key = self.key, len = bytes.len(), "input ignored"),
        }
    }

    fn handle_close(&mut self, cx: &mut WorkerContext) {
        if self.closed {
            return;
        }
        let close_state = self.table.close_state();
        if let Some(state) = close_state {
            self.state = state;
        }
        self.close(cx);
        if let Some(state) = close_state {
            self.state_tx.send_replace(state);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// What an action can see and do while it runs.
pub struct SessionContext<'a, M: Machine> {
    key: RoutingKey,
    state: M::State,
    event: M::Event,
    worker: &'a mut WorkerContext,
    liveness: Liveness,
    timers: &'a mut Vec<TimerHandle>,
    _machine: PhantomData<fn() -> M>,
}

impl<M: Machine> SessionContext<'_, M> {
    pub fn key(&self) -> RoutingKey {
        self.key
    }

    /// State the action was dispatched in.
    pub fn state(&self) -> M::State {
        self.state
    }

    /// Event being handled.
    pub fn event(&self) -> M::Event {
        self.event
    }

    pub fn worker_index(&self) -> usize {
        self.worker.index()
    }

    pub fn pool(&self) -> &WorkerPool {
        self.worker.pool()
    }

    pub fn liveness(&self) -> Liveness {
        self.liveness.clone()
    }

    /// Handle for re-entering this session from another thread, e.g. from
    /// an HTTP completion.
    pub fn handle(&self) -> SessionHandle<M> {
        SessionHandle {
            pool: self.worker.pool().clone(),
            key: self.key,
            liveness: self.liveness.clone(),
            state_rx: None,
            _machine: PhantomData,
        }
    }

    /// Queue `event` behind everything already posted to this worker.
    pub fn post(&self, event: M::Event, payload: M::Payload) -> Result<()> {
        post_event::<M>(self.worker.pool(), self.key, &self.liveness, event, payload)
    }

    /// Dispatch `event` after `delay`. The timer belongs to the session and
    /// is cancelled when it closes.
    pub fn post_after(&mut self, delay: Duration, event: M::Event, payload: M::Payload) -> TimerHandle {
        let key = self.key;
        let liveness = self.liveness.clone();
        let owner = liveness.clone();
        let mut payload = Some(payload);
        let handle = self.worker.schedule_local(
            delay,
            Some(owner),
            Box::new(move |cx| {
                let Some(payload) = payload.take() else {
                    return;
                };
                cx.with_session_as::<FsmSession<M>, _>(key, |session, cx| {
                    if liveness.belongs_to(&session.guard) {
                        session.dispatch(cx, event, payload);
                    }
                });
            }),
        );
        let worker = &*self.worker;
        self.timers.retain(|timer| worker.has_timer(*timer));
        self.timers.push(handle);
        handle
    }

    /// Cancel a timer created with [`post_after`](Self::post_after).
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        self.timers.retain(|timer| *timer != handle);
        self.worker.cancel_local(handle)
    }
}

fn post_event<M: Machine>(
    pool: &WorkerPool,
    key: RoutingKey,
    liveness: &Liveness,
    event: M::Event,
    payload: M::Payload,
) -> Result<()> {
    let owner = liveness.clone();
    let liveness = liveness.clone();
    pool.process_owned(key, owner, move |cx| {
        let delivered = cx.with_session_as::<FsmSession<M>, _>(key, |session, cx| {
            if liveness.belongs_to(&session.guard) {
                session.dispatch(cx, event, payload);
                true
            } else {
                false
            }
        });
        if delivered != Some(true) {
            trace!(key, ?event, "stale event discarded");
        }
    })
}

/// Thread-safe handle to a running [`FsmSession`].
pub struct SessionHandle<M: Machine> {
    pool: WorkerPool,
    key: RoutingKey,
    liveness: Liveness,
    state_rx: Option<watch::Receiver<M::State>>,
    _machine: PhantomData<fn() -> M>,
}

impl<M: Machine> Clone for SessionHandle<M> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            key: self.key,
            liveness: self.liveness.clone(),
            state_rx: self.state_rx.clone(),
            _machine: PhantomData,
        }
    }
}

impl<M: Machine> std::fmt::Debug for SessionHandle<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("key", &self.key)
            .field("alive", &self.liveness.is_alive())
            .finish()
    }
}

impl<M: Machine> SessionHandle<M> {
    pub fn key(&self) -> RoutingKey {
        self.key
    }

    /// False once the session has closed.
    pub fn is_alive(&self) -> bool {
        self.liveness.is_alive()
    }

    /// Post an event to the session's worker. Events reaching a closed
    /// session are discarded there.
    pub fn dispatch(&self, event: M::Event, payload: M::Payload) -> Result<()> {
        post_event::<M>(&self.pool, self.key, &self.liveness, event, payload)
    }

    /// Run `f` against the machine fields on the session's worker.
    pub fn query<R, F>(&self, f: F) -> Result<oneshot::Receiver<R>>
    where
        R: Send + 'static,
        F: FnOnce(&M, M::State) -> R + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.with_machine(move |machine, state| {
            let _ = tx.send(f(machine, state));
        })?;
        Ok(rx)
    }

    /// Mutate the machine fields on the session's worker.
    pub fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut M) + Send + 'static,
    {
        self.with_machine(move |machine, _| f(machine))
    }

    fn with_machine<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut M, M::State) + Send + 'static,
    {
        let key = self.key;
        let liveness = self.liveness.clone();
        self.pool.process_owned(key, self.liveness.clone(), move |cx| {
            cx.with_session_as::<FsmSession<M>, _>(key, |session, _| {
                if liveness.belongs_to(&session.guard) {
                    let state = session.state;
                    f(&mut session.machine, state);
                }
            });
        })
    }

    /// Ask the session's connection to close.
    pub fn close(&self) -> Result<()> {
        let key = self.key;
        let liveness = self.liveness.clone();
        self.pool.process_owned(key, self.liveness.clone(), move |cx| {
            let owned = cx
                .with_session_as::<FsmSession<M>, _>(key, |session, _| {
                    liveness.belongs_to(&session.guard)
                })
                .unwrap_or(false);
            if owned {
                if let Some(mut session) = cx.take_session(key) {
                    session.handle_close(cx);
                }
            }
        })
    }

    /// Last state published by the session.
    ///
    /// Handles created from inside an action do not observe state and
    /// return `None`.
    pub fn current_state(&self) -> Option<M::State> {
        self.state_rx.as_ref().map(|rx| *rx.borrow())
    }

    /// Wait until the session reaches `target`.
    pub async fn wait_for_state(&self, target: M::State) -> std::result::Result<(), WaitError> {
        let mut rx = self.state_rx.clone().ok_or(WaitError::Detached)?;
        while *rx.borrow_and_update() != target {
            rx.changed().await.map_err(|_| WaitError::Closed)?;
        }
        Ok(())
    }
}

/// Why [`SessionHandle::wait_for_state`] gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    #[error("session closed before reaching the state")]
    Closed,
    #[error("handle does not observe state")]
    Detached,
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc as std_mpsc;

    use super::*;
    use crate::error::FsmError;
    use crate::fsm::{ActionResult, FsmBuilder, FsmId, Transition};

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Door {
        Closed,
        Opening,
        Open,
        Jammed,
        Gone,
    }

    impl FsmId for Door {
        const COUNT: usize = 5;
        fn index(self) -> usize {
            self as usize
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Cmd {
        Open,
        Done,
        Kick,
        Expired,
        Wait,
    }

    impl FsmId for Cmd {
        const COUNT: usize = 5;
        fn index(self) -> usize {
            self as usize
        }
    }

    #[derive(Default)]
    struct DoorMachine {
        log: Vec<&'static str>,
    }

    impl Machine for DoorMachine {
        type State = Door;
        type Event = Cmd;
        type Payload = u32;
        type Error = String;

        fn transition_table() -> std::result::Result<FiniteStateMachine<Self>, FsmError> {
            let mut builder = FsmBuilder::new(Door::Closed);
            builder
                .define(Door::Closed, Cmd::Open, open, Door::Opening)?
                .define(Door::Opening, Cmd::Done, done, Door::Open)?
                .define(Door::Opening, Cmd::Wait, wait, Door::Open)?
                .define(Door::Open, Cmd::Kick, kick, Door::Jammed)?
                .define_with_timeout(Door::Jammed, Cmd::Open, open, Door::Opening, Duration::from_millis(20))?
                .define(Door::Opening, Cmd::Expired, expired, Door::Jammed)?
                .terminal(Door::Gone)?
                .on_close(Door::Gone)?
                .timeout_event(Cmd::Expired)?;
            builder.build()
        }

        fn on_input(bytes: &[u8]) -> Option<(Cmd, u32)> {
            (bytes == b"open").then_some((Cmd::Open, 0))
        }
    }

    fn open(m: &mut DoorMachine, _: &mut SessionContext<'_, DoorMachine>, _: u32) -> ActionResult<DoorMachine> {
        m.log.push("open");
        Ok(Transition::Next)
    }

    fn done(m: &mut DoorMachine, _: &mut SessionContext<'_, DoorMachine>, _: u32) -> ActionResult<DoorMachine> {
        m.log.push("done");
        Ok(Transition::Next)
    }

    fn wait(m: &mut DoorMachine, cx: &mut SessionContext<'_, DoorMachine>, attempts: u32) -> ActionResult<DoorMachine> {
        m.log.push("wait");
        if attempts == 0 {
            return Err("no attempts left".to_string());
        }
        cx.post(Cmd::Done, 0).map_err(|e| e.to_string())?;
        Ok(Transition::Hold)
    }

    fn kick(m: &mut DoorMachine, _: &mut SessionContext<'_, DoorMachine>, force: u32) -> ActionResult<DoorMachine> {
        m.log.push("kick");
        if force == 99 {
            panic!("door fell off");
        }
        if force > 10 {
            Ok(Transition::to(Door::Gone))
        } else {
            Ok(Transition::Next)
        }
    }

    fn expired(m: &mut DoorMachine, _: &mut SessionContext<'_, DoorMachine>, _: u32) -> ActionResult<DoorMachine> {
        m.log.push("expired");
        Ok(Transition::Next)
    }

    fn pool(name: &str) -> WorkerPool {
        let pool = WorkerPool::new(name, 2).unwrap();
        pool.start().unwrap();
        pool
    }

    fn spawn(pool: &WorkerPool, key: RoutingKey) -> SessionHandle<DoorMachine> {
        let table = Arc::new(DoorMachine::transition_table().unwrap());
        FsmSession::spawn(pool, key, DoorMachine::default(), table).unwrap()
    }

    /// Run `f` on the worker owning `key` and wait for its answer.
    fn on_worker<R: Send + 'static>(
        pool: &WorkerPool,
        key: RoutingKey,
        f: impl FnOnce(&mut WorkerContext) -> R + Send + 'static,
    ) -> R {
        let (tx, rx) = std_mpsc::channel();
        pool.process(key, move |cx| tx.send(f(cx)).unwrap()).unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap()
    }

    fn dispatch(pool: &WorkerPool, key: RoutingKey, event: Cmd, payload: u32) -> DispatchOutcome<Door> {
        on_worker(pool, key, move |cx| {
            cx.with_session_as::<FsmSession<DoorMachine>, _>(key, |s, cx| s.dispatch(cx, event, payload))
                .unwrap_or(DispatchOutcome::Stale)
        })
    }

    fn log(handle: &SessionHandle<DoorMachine>) -> Vec<&'static str> {
        handle
            .query(|m, _| m.log.clone())
            .unwrap()
            .blocking_recv()
            .unwrap()
    }

    fn finish(pool: WorkerPool) {
        pool.stop();
        pool.wait_stop().unwrap();
    }

    #[test]
    fn dispatch_follows_the_table() {
        let pool = pool("door-walk");
        let handle = spawn(&pool, 4);
        assert_eq!(
            dispatch(&pool, 4, Cmd::Open, 0),
            DispatchOutcome::Moved { from: Door::Closed, to: Door::Opening }
        );
        assert_eq!(
            dispatch(&pool, 4, Cmd::Done, 0),
            DispatchOutcome::Moved { from: Door::Opening, to: Door::Open }
        );
        assert_eq!(handle.current_state(), Some(Door::Open));
        assert_eq!(log(&handle), vec!["open", "done"]);
        finish(pool);
    }

    #[test]
    fn undefined_event_is_a_no_op() {
        let pool = pool("door-unhandled");
        let handle = spawn(&pool, 1);
        assert_eq!(dispatch(&pool, 1, Cmd::Kick, 0), DispatchOutcome::Unhandled);
        assert_eq!(handle.current_state(), Some(Door::Closed));
        assert!(log(&handle).is_empty());
        finish(pool);
    }

    #[test]
    fn failing_action_keeps_state() {
        let pool = pool("door-fail");
        let handle = spawn(&pool, 2);
        dispatch(&pool, 2, Cmd::Open, 0);
        assert_eq!(dispatch(&pool, 2, Cmd::Wait, 0), DispatchOutcome::Failed);
        assert_eq!(handle.current_state(), Some(Door::Opening));
        finish(pool);
    }

    #[test]
    fn hold_then_reposted_event_moves_on() {
        let pool = pool("door-hold");
        let handle = spawn(&pool, 3);
        dispatch(&pool, 3, Cmd::Open, 0);
        assert_eq!(dispatch(&pool, 3, Cmd::Wait, 1), DispatchOutcome::Held(Door::Opening));
        // Done was posted by the action, ahead of the query.
        assert_eq!(log(&handle), vec!["open", "wait", "done"]);
        assert_eq!(handle.current_state(), Some(Door::Open));
        finish(pool);
    }

    #[test]
    fn action_override_into_terminal_closes_session() {
        let pool = pool("door-terminal");
        let handle = spawn(&pool, 5);
        dispatch(&pool, 5, Cmd::Open, 0);
        dispatch(&pool, 5, Cmd::Done, 0);
        assert_eq!(
            dispatch(&pool, 5, Cmd::Kick, 11),
            DispatchOutcome::Moved { from: Door::Open, to: Door::Gone }
        );
        assert!(!handle.is_alive());
        assert!(!on_worker(&pool, 5, |cx| cx.has_session(5)));
        assert_eq!(dispatch(&pool, 5, Cmd::Open, 0), DispatchOutcome::Stale);
        finish(pool);
    }

    #[test]
    fn panicking_action_keeps_the_session() {
        let pool = pool("door-panic");
        let handle = spawn(&pool, 12);
        dispatch(&pool, 12, Cmd::Open, 0);
        dispatch(&pool, 12, Cmd::Done, 0);
        assert_eq!(dispatch(&pool, 12, Cmd::Kick, 99), DispatchOutcome::Failed);
        assert!(on_worker(&pool, 12, |cx| cx.has_session(12)));
        assert!(handle.is_alive());
        assert_eq!(handle.current_state(), Some(Door::Open));
        assert_eq!(
            dispatch(&pool, 12, Cmd::Kick, 0),
            DispatchOutcome::Moved { from: Door::Open, to: Door::Jammed }
        );
        finish(pool);
    }

    #[test]
    fn closed_state_is_published_after_liveness_ends() {
        let pool = pool("door-close-order");
        let handle = spawn(&pool, 13);
        let watcher = handle.clone();
        let seen = std::thread::spawn(move || {
            loop {
                if watcher.current_state() == Some(Door::Gone) {
                    return watcher.is_alive();
                }
                std::thread::yield_now();
            }
        });
        pool.deliver_close(13).unwrap();
        assert!(!seen.join().unwrap());
        finish(pool);
    }

    #[test]
    fn state_timeout_dispatches_timeout_event() {
        let pool = pool("door-timeout");
        let handle = spawn(&pool, 6);
        dispatch(&pool, 6, Cmd::Open, 0);
        dispatch(&pool, 6, Cmd::Done, 0);
        dispatch(&pool, 6, Cmd::Kick, 0);
        // Jammed --Open--> Opening arms a 20ms timeout back to Jammed.
        dispatch(&pool, 6, Cmd::Open, 0);
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(handle.current_state(), Some(Door::Jammed));
        assert_eq!(log(&handle), vec!["open", "done", "kick", "open", "expired"]);
        finish(pool);
    }

    #[test]
    fn leaving_state_cancels_its_timeout() {
        let pool = pool("door-timeout-cancel");
        let handle = spawn(&pool, 8);
        dispatch(&pool, 8, Cmd::Open, 0);
        dispatch(&pool, 8, Cmd::Done, 0);
        dispatch(&pool, 8, Cmd::Kick, 0);
        dispatch(&pool, 8, Cmd::Open, 0);
        dispatch(&pool, 8, Cmd::Done, 0);
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(handle.current_state(), Some(Door::Open));
        assert_eq!(on_worker(&pool, 8, |cx| cx.pending_timers()), 0);
        finish(pool);
    }

    #[test]
    fn close_moves_to_close_state_and_discards_later_events() {
        let pool = pool("door-close");
        let handle = spawn(&pool, 7);
        pool.deliver_close(7).unwrap();
        handle.dispatch(Cmd::Open, 0).unwrap();
        assert!(!on_worker(&pool, 7, |cx| cx.has_session(7)));
        assert_eq!(handle.current_state(), Some(Door::Gone));
        assert!(!handle.is_alive());
        finish(pool);
    }

    #[test]
    fn input_is_translated_into_events() {
        let pool = pool("door-input");
        let handle = spawn(&pool, 9);
        pool.deliver_input(9, b"noise".to_vec()).unwrap();
        pool.deliver_input(9, b"open".to_vec()).unwrap();
        assert_eq!(log(&handle), vec!["open"]);
        assert_eq!(handle.current_state(), Some(Door::Opening));
        finish(pool);
    }

    #[test]
    fn stale_handle_does_not_reach_new_session_under_same_key() {
        let pool = pool("door-reuse");
        let old = spawn(&pool, 10);
        let fresh = spawn(&pool, 10);
        old.dispatch(Cmd::Open, 0).unwrap();
        assert!(log(&fresh).is_empty());
        assert_eq!(fresh.current_state(), Some(Door::Closed));
        assert!(!old.is_alive());
        finish(pool);
    }
}
