//! OAuth-authorized synchronisation of session files with cloud storage.
//!
//! [`CloudSync`] is an ordinary [`Machine`](crate::Machine) declared with
//! `#[fsm]`. Requests go out through an [`HttpClient`](crate::HttpClient)
//! and their completions come back to the session as `HttpSuccess` or
//! `HttpFailed` events, always on the session's own worker.

pub mod api;
pub mod config;
mod machine;

pub use api::OAuthTokens;
pub use config::SyncConfig;
pub use machine::{
    CloudSync, PendingOps, SyncError, SyncEvent, SyncFactory, SyncPayload, SyncState, spawn_sync,
    sync_table,
};
