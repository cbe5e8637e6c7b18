//! Core runtime types for shard-fsm.
//!
//! A [`WorkerPool`] owns a fixed set of single-threaded workers. Work for a
//! routing key always lands on worker `key % thread_count`, so everything
//! attached to a key (its session, its timers) is touched by one thread only
//! and needs no locking.

pub mod config;
pub mod error;
pub mod fsm;
pub mod job;
pub mod pool;
pub mod session;
pub mod timer;
pub mod transport;
pub mod worker;

pub use config::PoolConfig;
pub use error::{ConfigError, FsmError, HttpError, PoolError};
pub use fsm::{
    Action, ActionResult, FiniteStateMachine, FsmBuilder, FsmId, Machine, Transition,
    TransitionEntry,
};
pub use job::{Job, Liveness, LivenessGuard};
pub use pool::{RoutingKey, WorkerPool};
pub use session::{
    DispatchOutcome, FsmSession, ProtocolSession, SessionContext, SessionHandle, WaitError,
};
pub use timer::{TimerCallback, TimerHandle};
pub use transport::{
    BackgroundHttp, ConnectionGate, HttpClient, HttpCompletion, HttpExecutor, HttpRequest,
    HttpResponse, Method, SessionFactory,
};
pub use worker::WorkerContext;

/// Shutdown mode for graceful or immediate termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownMode {
    /// Graceful shutdown: run every job already queued, then close the
    /// sessions.
    #[default]
    Graceful,
    /// Immediate shutdown: close the sessions without running queued jobs.
    Immediate,
}
