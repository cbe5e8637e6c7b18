//! Collaborators that feed sessions: connection events and HTTP.
//!
//! Neither collaborator touches session state. Connection events are routed
//! through the pool; HTTP completions run on the executor thread and must
//! post back to the owning worker, typically through a
//! [`SessionHandle`](crate::SessionHandle).

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, trace, warn};

use crate::error::{HttpError, Result};
use crate::pool::{RoutingKey, WorkerPool};
use crate::session::ProtocolSession;

/// Creates the session for a newly established connection.
pub trait SessionFactory: Send + Sync + 'static {
    fn on_connection_established(&self, key: RoutingKey) -> Box<dyn ProtocolSession>;
}

impl<F> SessionFactory for F
where
    F: Fn(RoutingKey) -> Box<dyn ProtocolSession> + Send + Sync + 'static,
{
    fn on_connection_established(&self, key: RoutingKey) -> Box<dyn ProtocolSession> {
        self(key)
    }
}

/// Entry point for a transport: turns connection events into pool work.
#[derive(Clone)]
pub struct ConnectionGate {
    pool: WorkerPool,
    factory: Arc<dyn SessionFactory>,
}

impl ConnectionGate {
    pub fn new(pool: WorkerPool, factory: impl SessionFactory) -> Self {
        Self {
            pool,
            factory: Arc::new(factory),
        }
    }

    /// A connection identified by `key` was established.
    pub fn accept(&self, key: RoutingKey) -> Result<()> {
        trace!(key, "connection established");
        self.pool
            .open_session(self.factory.on_connection_established(key))
    }

    /// Bytes arrived on `key`.
    pub fn input(&self, key: RoutingKey, bytes: impl Into<Vec<u8>>) -> Result<()> {
        self.pool.deliver_input(key, bytes.into())
    }

    /// The connection on `key` closed.
    pub fn close(&self, key: RoutingKey) -> Result<()> {
        trace!(key, "connection closed");
        self.pool.deliver_close(key)
    }
}

impl fmt::Debug for ConnectionGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionGate")
            .field("pool", &self.pool.name())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::Post, url)
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn bearer(self, token: &str) -> Self {
        self.header("Authorization", format!("Bearer {token}"))
    }

    #[must_use]
    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Serialize `value` as the JSON body.
    pub fn json<T: Serialize + ?Sized>(self, value: &T) -> std::result::Result<Self, HttpError> {
        let body = serde_json::to_vec(value).map_err(|e| HttpError::Encode(e.to_string()))?;
        Ok(self.header("Content-Type", "application/json").body(body))
    }

    /// Case-insensitive header lookup.
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json<T: DeserializeOwned>(&self) -> std::result::Result<T, HttpError> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Callback receiving the outcome of a request.
pub type HttpCompletion = Box<dyn FnOnce(std::result::Result<HttpResponse, HttpError>) + Send>;

/// Asynchronous HTTP collaborator.
///
/// `async_request` returns immediately; the completion runs later on some
/// other thread.
pub trait HttpClient: Send + Sync + 'static {
    fn async_request(&self, request: HttpRequest, completion: HttpCompletion);
}

/// Blocking request executor wrapped by [`BackgroundHttp`].
pub trait HttpExecutor: Send + Sync + 'static {
    fn execute(&self, request: &HttpRequest) -> std::result::Result<HttpResponse, HttpError>;
}

impl<F> HttpExecutor for F
where
    F: Fn(&HttpRequest) -> std::result::Result<HttpResponse, HttpError> + Send + Sync + 'static,
{
    fn execute(&self, request: &HttpRequest) -> std::result::Result<HttpResponse, HttpError> {
        self(request)
    }
}

struct Pending {
    request: HttpRequest,
    completion: HttpCompletion,
}

#[derive(Default)]
struct Queue {
    items: VecDeque<Pending>,
    closed: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    ready: Condvar,
}

/// [`HttpClient`] running a blocking executor on a dedicated thread.
///
/// Requests are executed one at a time in submission order. Requests still
/// queued at shutdown complete with [`HttpError::ShutDown`].
pub struct BackgroundHttp {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl BackgroundHttp {
    pub fn spawn(name: impl Into<String>, executor: impl HttpExecutor) -> Result<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue::default()),
            ready: Condvar::new(),
        });
        let name = name.into();
        let thread = thread::Builder::new().name(name.clone()).spawn({
            let shared = shared.clone();
            move || run_executor(&name, &shared, &executor)
        })?;
        Ok(Self {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Number of requests waiting to run.
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().items.len()
    }

    /// Stop accepting requests and join the executor thread.
    pub fn shutdown(&self) {
        self.shared.queue.lock().closed = true;
        self.shared.ready.notify_all();
        if let Some(thread) = self.thread.lock().take()
            && thread.join().is_err()
        {
            warn!("http executor thread panicked");
        }
    }
}

impl HttpClient for BackgroundHttp {
    fn async_request(&self, request: HttpRequest, completion: HttpCompletion) {
        let mut queue = self.shared.queue.lock();
        if queue.closed {
            drop(queue);
            completion(Err(HttpError::ShutDown));
            return;
        }
        queue.items.push_back(Pending {
            request,
            completion,
        });
        drop(queue);
        self.shared.ready.notify_one();
    }
}

impl Drop for BackgroundHttp {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_executor(name: &str, shared: &Shared, executor: &dyn HttpExecutor) {
    loop {
        let next = {
            let mut queue = shared.queue.lock();
            while queue.items.is_empty() && !queue.closed {
                shared.ready.wait(&mut queue);
            }
            if queue.closed {
                let abandoned: Vec<Pending> = queue.items.drain(..).collect();
                drop(queue);
                if !abandoned.is_empty() {
                    debug!(executor = name, count = abandoned.len(), "abandoning queued requests");
                }
                for pending in abandoned {
                    (pending.completion)(Err(HttpError::ShutDown));
                }
                return;
            }
            queue.items.pop_front()
        };
        let Some(Pending {
            request,
            completion,
        }) = next
        else {
            continue;
        };
        trace!(executor = name, method = %request.method, url = %request.url, "executing request");
        let outcome = executor.execute(&request);
        if let Err(err) = &outcome {
            debug!(executor = name, url = %request.url, %err, "request failed");
        }
        completion(outcome);
    }
}

#[cfg(test)]
mod tests {
    use std::any::Any;
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;
    use crate::worker::WorkerContext;

    struct Echo {
        key: RoutingKey,
        seen: Arc<Mutex<Vec<String>>>,
        closed: bool,
    }

    impl ProtocolSession for Echo {
        fn key(&self) -> RoutingKey {
            self.key
        }

        fn handle_input(&mut self, cx: &mut WorkerContext, bytes: &[u8]) {
            self.seen.lock().push(format!(
                "{}@{}:{}",
                self.key,
                cx.index(),
                String::from_utf8_lossy(bytes)
            ));
        }

        fn handle_close(&mut self, _cx: &mut WorkerContext) {
            self.seen.lock().push(format!("{} closed", self.key));
            self.closed = true;
        }

        fn is_closed(&self) -> bool {
            self.closed
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    #[test]
    fn gate_routes_connection_events_to_sessions() {
        let pool = WorkerPool::new("gate", 2).unwrap();
        pool.start().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let gate = ConnectionGate::new(pool.clone(), {
            let seen = seen.clone();
            move |key: RoutingKey| -> Box<dyn ProtocolSession> {
                Box::new(Echo {
                    key,
                    seen: seen.clone(),
                    closed: false,
                })
            }
        });

        gate.accept(3).unwrap();
        gate.input(3, "hello").unwrap();
        gate.input(7, "nobody").unwrap();
        gate.close(3).unwrap();
        gate.input(3, "late").unwrap();

        pool.stop();
        pool.wait_stop().unwrap();
        assert_eq!(*seen.lock(), vec!["3@1:hello".to_string(), "3 closed".to_string()]);
    }

    #[test]
    fn request_builder_sets_headers_and_json_body() {
        let request = HttpRequest::post("https://example.test/files")
            .bearer("tok")
            .json(&serde_json::json!({"name": "sessions"}))
            .unwrap();
        assert_eq!(request.method, Method::Post);
        assert_eq!(request.header_value("authorization"), Some("Bearer tok"));
        assert_eq!(request.header_value("content-type"), Some("application/json"));
        assert_eq!(request.body, br#"{"name":"sessions"}"#);
    }

    #[test]
    fn response_helpers() {
        let ok = HttpResponse::new(201, r#"{"id":"f1"}"#);
        assert!(ok.is_success());
        let value: serde_json::Value = ok.json().unwrap();
        assert_eq!(value["id"], "f1");
        let bad = HttpResponse::new(404, "not json");
        assert!(!bad.is_success());
        assert!(matches!(bad.json::<serde_json::Value>(), Err(HttpError::Decode(_))));
        assert_eq!(bad.text(), "not json");
    }

    #[test]
    fn background_http_completes_in_order_off_thread() {
        let http = BackgroundHttp::spawn("http-test", |req: &HttpRequest| {
            Ok::<_, HttpError>(HttpResponse::new(200, req.url.clone()))
        })
        .unwrap();
        let (tx, rx) = mpsc::channel();
        for i in 0..3 {
            let tx = tx.clone();
            http.async_request(
                HttpRequest::get(format!("/{i}")),
                Box::new(move |res| {
                    let thread = thread::current().name().map(str::to_string);
                    tx.send((res.unwrap().text(), thread)).unwrap();
                }),
            );
        }
        for i in 0..3 {
            let (body, thread) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(body, format!("/{i}"));
            assert_eq!(thread.as_deref(), Some("http-test"));
        }
    }

    #[test]
    fn transport_errors_reach_the_completion() {
        let http = BackgroundHttp::spawn("http-fail", |_: &HttpRequest| {
            Err::<HttpResponse, _>(HttpError::Transport("connection refused".into()))
        })
        .unwrap();
        let (tx, rx) = mpsc::channel();
        http.async_request(
            HttpRequest::get("/"),
            Box::new(move |res| tx.send(res.err().map(|e| e.to_string())).unwrap()),
        );
        let err = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(err.as_deref(), Some("transport error: connection refused"));
    }

    #[test]
    fn requests_after_shutdown_fail_fast() {
        let http = BackgroundHttp::spawn("http-closed", |_: &HttpRequest| {
            Ok::<_, HttpError>(HttpResponse::new(200, ""))
        })
        .unwrap();
        http.shutdown();
        let (tx, rx) = mpsc::channel();
        http.async_request(
            HttpRequest::get("/"),
            Box::new(move |res| tx.send(matches!(res, Err(HttpError::ShutDown))).unwrap()),
        );
        assert!(rx.recv().unwrap());
        assert_eq!(http.queued(), 0);
    }
}
