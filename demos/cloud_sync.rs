//! Authorize against the storage provider and upload one session file.
//!
//! ```text
//! SHARD_FSM_SYNC_CLIENT_ID=... RUST_LOG=info cargo run --example cloud_sync -- [sync.json]
//! ```
//!
//! Open the printed consent URL; the provider redirects the browser to the
//! local listener, whose request line carries the authorization code.

use std::io::{Read, Write};
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use shard_fsm::cloud_sync::{CloudSync, SyncConfig, SyncEvent, SyncPayload, SyncState, spawn_sync};
use shard_fsm::{
    BackgroundHttp, HttpError, HttpExecutor, HttpRequest, HttpResponse, PoolConfig, SessionHandle,
    WorkerPool,
};
use tracing::{error, info};

const SESSION_KEY: u64 = 1;

struct BlockingExecutor(reqwest::blocking::Client);

impl HttpExecutor for BlockingExecutor {
    fn execute(&self, request: &HttpRequest) -> Result<HttpResponse, HttpError> {
        let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
            .map_err(|e| HttpError::Transport(e.to_string()))?;
        let mut builder = self.0.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        let response = builder
            .body(request.body.clone())
            .send()
            .map_err(|e| HttpError::Transport(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .map_err(|e| HttpError::Transport(e.to_string()))?;
        Ok(HttpResponse::new(status, body.to_vec()))
    }
}

fn wait_until<F>(handle: &SessionHandle<CloudSync>, check: F) -> bool
where
    F: Fn(&CloudSync, SyncState) -> bool + Copy + Send + 'static,
{
    for _ in 0..600 {
        match handle.query(check) {
            Ok(rx) => {
                if rx.blocking_recv().unwrap_or(false) {
                    return true;
                }
            }
            Err(_) => return false,
        }
        thread::sleep(Duration::from_millis(100));
    }
    false
}

/// Accept one redirect and hand its bytes to the sync session.
fn receive_redirect(listener: &TcpListener, pool: &WorkerPool) -> std::io::Result<()> {
    let (mut stream, peer) = listener.accept()?;
    info!(%peer, "redirect received");
    let mut buf = [0u8; 4096];
    let n = stream.read(&mut buf)?;
    if let Err(err) = pool.deliver_input(SESSION_KEY, buf[..n].to_vec()) {
        error!(%err, "could not deliver redirect");
    }
    stream.write_all(
        b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nConnection: close\r\n\r\nYou can close this window.\r\n",
    )
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    use tracing_subscriber::prelude::*;

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let sync_config = Arc::new(SyncConfig::load(config_path.as_deref())?);
    let pool = WorkerPool::from_config(&PoolConfig::load(None)?)?;
    pool.start()?;

    let http = Arc::new(BackgroundHttp::spawn(
        "sync-http",
        BlockingExecutor(reqwest::blocking::Client::new()),
    )?);

    let mut sync = CloudSync::new(sync_config.clone(), http.clone());
    sync.queue_upload(
        "demo.session",
        format!("created by {}\n", env!("CARGO_PKG_NAME")),
    );
    let handle = spawn_sync(&pool, SESSION_KEY, sync)?;

    handle.dispatch(SyncEvent::AuthorizeEvt, SyncPayload::None)?;
    wait_until(&handle, |_, s| s == SyncState::GetAuthCode);
    let consent = handle
        .query(|m, _| m.consent_url().map(str::to_string))?
        .blocking_recv()?;
    println!("Open this URL to authorize:\n\n  {}\n", consent.unwrap_or_default());

    let bind = sync_config
        .redirect_uri
        .trim_start_matches("http://")
        .trim_end_matches('/')
        .to_string();
    let listener = TcpListener::bind(&bind)?;
    info!(%bind, "waiting for the consent redirect");
    receive_redirect(&listener, &pool)?;

    if !wait_until(&handle, |m, s| s == SyncState::Idle && m.tokens().is_some()) {
        error!("authorization did not complete");
    } else {
        handle.dispatch(SyncEvent::CreateSessionFolderEvt, SyncPayload::None)?;
        let done = wait_until(&handle, |m, s| {
            s == SyncState::Idle && (m.pending().is_empty() || m.last_error().is_some())
        });
        let (pending, last_error) = handle
            .query(|m, _| (m.pending(), m.last_error().map(str::to_string)))?
            .blocking_recv()?;
        info!(done, ?pending, ?last_error, "sync finished");
    }

    handle.close()?;
    pool.stop();
    pool.wait_stop()?;
    http.shutdown();
    Ok(())
}
