//! Error types for the worker pool and the transition table.

use thiserror::Error;

/// Errors raised by [`WorkerPool`](crate::WorkerPool) and its timers.
#[derive(Debug, Error)]
pub enum PoolError {
    /// A pool was constructed with zero worker threads.
    #[error("worker pool `{0}` needs at least one thread")]
    NoThreads(String),
    /// `start()` was called on a pool that already runs.
    #[error("worker pool `{0}` is already started")]
    AlreadyStarted(String),
    /// The pool no longer accepts work.
    #[error("worker pool `{0}` is stopped")]
    Stopped(String),
    /// A repeating timer was requested with a zero interval.
    #[error("repeat interval must be greater than zero")]
    InvalidInterval,
    /// The OS refused to spawn a worker thread.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
    /// A worker thread ended by panicking outside any job.
    #[error("worker thread `{0}` panicked")]
    WorkerPanicked(String),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, PoolError>;

/// Errors raised while building a transition table.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FsmError {
    /// The same `(state, event)` pair was defined twice.
    #[error("transition ({state}, {event}) is already defined")]
    DuplicateTransition { state: String, event: String },
    /// An identifier reported an index outside `0..COUNT`.
    #[error("identifier {name} has index {index}, expected < {count}")]
    IndexOutOfRange {
        name: String,
        index: usize,
        count: usize,
    },
}

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    /// Failed to parse the configuration JSON.
    #[error("failed to parse config JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors surfaced to an HTTP completion.
#[derive(Debug, Error)]
pub enum HttpError {
    /// The request never produced a response.
    #[error("transport error: {0}")]
    Transport(String),
    /// The response body was not what the caller expected.
    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),
    /// The request body could not be encoded.
    #[error("failed to encode request: {0}")]
    Encode(String),
    /// The executor shut down before the request ran.
    #[error("http executor is shut down")]
    ShutDown,
}
