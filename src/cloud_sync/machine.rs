//! The cloud-sync session machine.
//!
//! One run (`CreateSessionFolderEvt`) locates or creates the remote session
//! folder, lists it, then loops through `CheckAction` until the upload,
//! download, delete and rename sets are drained. Items leave their set only
//! when their own request succeeds; a run that gives up keeps them for the
//! next one.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, OnceLock};

use tracing::{debug, info, trace, warn};

use super::api::{self, FileList, OAuthTokens, RemoteFile, TokenResponse};
use super::config::SyncConfig;
use crate::{
    ActionResult, FiniteStateMachine, FsmError, FsmId, FsmSession, HttpClient, HttpError,
    HttpRequest, HttpResponse, Machine, PoolError, ProtocolSession, RoutingKey, SessionContext,
    SessionFactory, SessionHandle, Transition, WorkerPool, fsm,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FsmId)]
pub enum SyncState {
    Idle,
    RefreshToken,
    GetAuthCode,
    GetAccessToken,
    NeedsReauth,
    GetSessionFolder,
    CreateSessionFolder,
    GetExistSessionsId,
    CheckAction,
    UploadSession,
    UploadDone,
    DownloadSession,
    DownloadDone,
    DeleteSession,
    DeleteDone,
    RenameSession,
    RenameDone,
    Retry,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FsmId)]
pub enum SyncEvent {
    NetworkInput,
    Next,
    HttpSuccess,
    HttpFailed,
    Retry,
    Timeout,
    AuthorizeEvt,
    RefreshEvt,
    CreateSessionFolderEvt,
    UploadEvt,
    DownloadEvt,
    DeleteEvt,
    RenameEvt,
}

/// Data travelling with a [`SyncEvent`].
#[derive(Debug, Default)]
pub enum SyncPayload {
    #[default]
    None,
    /// Bytes from the redirect connection.
    Input(Vec<u8>),
    /// A 2xx answer to request number `request`.
    Response { request: u64, response: HttpResponse },
    /// A transport error or non-2xx answer to request number `request`.
    Failure { request: u64, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("no session folder known")]
    NoSessionFolder,
    #[error("`{0}` is not listed remotely")]
    NotListed(String),
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Table(#[from] FsmError),
}

/// Snapshot of the operations still to be synchronised.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingOps {
    pub uploads: Vec<String>,
    pub downloads: Vec<String>,
    pub deletes: Vec<String>,
    pub renames: Vec<(String, String)>,
}

impl PendingOps {
    pub fn is_empty(&self) -> bool {
        self.uploads.is_empty()
            && self.downloads.is_empty()
            && self.deletes.is_empty()
            && self.renames.is_empty()
    }
}

enum Outcome {
    Success(HttpResponse),
    Failure(String),
    Stale,
}

/// Session fields of a cloud-sync exchange.
pub struct CloudSync {
    config: Arc<SyncConfig>,
    http: Arc<dyn HttpClient>,
    tokens: Option<OAuthTokens>,
    consent_url: Option<String>,
    folder_id: Option<String>,
    // name -> remote id; `None` until the folder has been listed this run.
    remote: Option<BTreeMap<String, String>>,
    uploads: BTreeMap<String, Vec<u8>>,
    downloads: BTreeSet<String>,
    deletes: BTreeSet<String>,
    renames: BTreeMap<String, String>,
    downloaded: BTreeMap<String, Vec<u8>>,
    current: Option<String>,
    request_seq: u64,
    awaiting: Option<u64>,
    retries: u32,
    last_error: Option<String>,
}

impl CloudSync {
    pub fn new(config: Arc<SyncConfig>, http: Arc<dyn HttpClient>) -> Self {
        Self {
            config,
            http,
            tokens: None,
            consent_url: None,
            folder_id: None,
            remote: None,
            uploads: BTreeMap::new(),
            downloads: BTreeSet::new(),
            deletes: BTreeSet::new(),
            renames: BTreeMap::new(),
            downloaded: BTreeMap::new(),
            current: None,
            request_seq: 0,
            awaiting: None,
            retries: 0,
            last_error: None,
        }
    }

    #[must_use]
    pub fn with_tokens(mut self, tokens: OAuthTokens) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub fn queue_upload(&mut self, name: impl Into<String>, data: impl Into<Vec<u8>>) {
        self.uploads.insert(name.into(), data.into());
    }

    pub fn queue_download(&mut self, name: impl Into<String>) {
        self.downloads.insert(name.into());
    }

    pub fn queue_delete(&mut self, name: impl Into<String>) {
        self.deletes.insert(name.into());
    }

    pub fn queue_rename(&mut self, from: impl Into<String>, to: impl Into<String>) {
        self.renames.insert(from.into(), to.into());
    }

    pub fn pending(&self) -> PendingOps {
        PendingOps {
            uploads: self.uploads.keys().cloned().collect(),
            downloads: self.downloads.iter().cloned().collect(),
            deletes: self.deletes.iter().cloned().collect(),
            renames: self
                .renames
                .iter()
                .map(|(from, to)| (from.clone(), to.clone()))
                .collect(),
        }
    }

    pub fn tokens(&self) -> Option<&OAuthTokens> {
        self.tokens.as_ref()
    }

    /// Consent page emitted by the last `AuthorizeEvt`.
    pub fn consent_url(&self) -> Option<&str> {
        self.consent_url.as_deref()
    }

    pub fn folder_id(&self) -> Option<&str> {
        self.folder_id.as_deref()
    }

    /// Remote sessions by name, as of the last listing.
    pub fn remote_files(&self) -> Option<&BTreeMap<String, String>> {
        self.remote.as_ref()
    }

    pub fn downloaded(&self, name: &str) -> Option<&[u8]> {
        self.downloaded.get(name).map(Vec::as_slice)
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    fn access_token(&self) -> Option<String> {
        self.tokens.as_ref().map(|t| t.access_token.clone())
    }

    fn session_folder(&self) -> Result<String, SyncError> {
        self.folder_id.clone().ok_or(SyncError::NoSessionFolder)
    }

    fn remote_id(&self, name: &str) -> Result<String, SyncError> {
        self.remote
            .as_ref()
            .and_then(|remote| remote.get(name).cloned())
            .ok_or_else(|| SyncError::NotListed(name.to_string()))
    }

    /// Issue `request`; its completion comes back as `HttpSuccess` or
    /// `HttpFailed` tagged with a fresh request number.
    fn send(&mut self, cx: &SessionContext<'_, Self>, request: HttpRequest) {
        self.request_seq += 1;
        let id = self.request_seq;
        self.awaiting = Some(id);
        debug!(key = cx.key(), request = id, method = %request.method, url = %request.url, "sending request");

        let handle = cx.handle();
        self.http.async_request(
            request,
            Box::new(move |outcome| {
                let (event, payload) = match outcome {
                    Ok(response) if response.is_success() => (
                        SyncEvent::HttpSuccess,
                        SyncPayload::Response {
                            request: id,
                            response,
                        },
                    ),
                    Ok(response) => (
                        SyncEvent::HttpFailed,
                        SyncPayload::Failure {
                            request: id,
                            reason: format!("HTTP {}: {}", response.status, response.text()),
                        },
                    ),
                    Err(err) => (
                        SyncEvent::HttpFailed,
                        SyncPayload::Failure {
                            request: id,
                            reason: err.to_string(),
                        },
                    ),
                };
                if let Err(err) = handle.dispatch(event, payload) {
                    debug!(request = id, %err, "completion dropped");
                }
            }),
        );
    }

    /// Match a completion against the request this session waits for.
    /// Timeouts carry no payload and count as a failure of that request.
    fn outcome(&mut self, key: RoutingKey, payload: SyncPayload) -> Outcome {
        match payload {
            SyncPayload::Response { request, response } if self.awaiting == Some(request) => {
                self.awaiting = None;
                Outcome::Success(response)
            }
            SyncPayload::Failure { request, reason } if self.awaiting == Some(request) => {
                self.awaiting = None;
                Outcome::Failure(reason)
            }
            SyncPayload::Response { request, .. } | SyncPayload::Failure { request, .. } => {
                trace!(key, request, "stale completion ignored");
                Outcome::Stale
            }
            SyncPayload::None => {
                self.awaiting = None;
                Outcome::Failure("request timed out".to_string())
            }
            SyncPayload::Input(_) => Outcome::Stale,
        }
    }

    /// A queued item could not be turned into a request.
    ///
    /// An unlisted item is dropped and the `CheckAction` loop moves on to the
    /// next one. Anything else ends the run with every item kept.
    fn skip_unsendable(
        &mut self,
        cx: &SessionContext<'_, Self>,
        err: SyncError,
    ) -> ActionResult<Self> {
        match err {
            SyncError::NotListed(name) => {
                warn!(key = cx.key(), file = %name, event = ?cx.event(), "not present remotely, skipped");
                self.downloads.remove(&name);
                self.deletes.remove(&name);
                self.renames.remove(&name);
                cx.post(SyncEvent::Next, SyncPayload::None)?;
                Ok(Transition::Hold)
            }
            other => {
                warn!(key = cx.key(), event = ?cx.event(), err = %other, "sync run ended, pending items kept");
                self.last_error = Some(other.to_string());
                Ok(Transition::to(SyncState::Idle))
            }
        }
    }

    /// Forget queued items that cannot be acted on remotely.
    fn drop_unreachable(&mut self, key: RoutingKey) {
        let Some(remote) = &self.remote else { return };
        self.downloads.retain(|name| {
            let listed = remote.contains_key(name);
            if !listed {
                warn!(key, file = %name, "download skipped, not present remotely");
            }
            listed
        });
        self.deletes.retain(|name| {
            let listed = remote.contains_key(name);
            if !listed {
                debug!(key, file = %name, "delete skipped, already absent");
            }
            listed
        });
        self.renames.retain(|from, _| {
            let listed = remote.contains_key(from);
            if !listed {
                warn!(key, file = %from, "rename skipped, not present remotely");
            }
            listed
        });
    }
}

#[fsm(initial = Idle, terminal(Closed), close = Closed, timeout_event = Timeout)]
impl CloudSync {
    type State = SyncState;
    type Event = SyncEvent;
    type Payload = SyncPayload;
    type Error = SyncError;

    #[on_input]
    fn network_input(bytes: &[u8]) -> Option<(SyncEvent, SyncPayload)> {
        Some((SyncEvent::NetworkInput, SyncPayload::Input(bytes.to_vec())))
    }

    #[on(state = Idle, event = AuthorizeEvt, next = GetAuthCode)]
    #[on(state = NeedsReauth, event = AuthorizeEvt, next = GetAuthCode)]
    fn begin_authorization(
        &mut self,
        cx: &mut SessionContext<'_, Self>,
        _: SyncPayload,
    ) -> ActionResult<Self> {
        let url = api::authorization_url(&self.config);
        info!(key = cx.key(), %url, "waiting for authorization");
        self.consent_url = Some(url);
        Ok(Transition::Next)
    }

    #[on(state = GetAuthCode, event = NetworkInput, next = GetAccessToken)]
    #[state_timeout(duration = "30s")]
    fn receive_auth_code(
        &mut self,
        cx: &mut SessionContext<'_, Self>,
        payload: SyncPayload,
    ) -> ActionResult<Self> {
        let SyncPayload::Input(bytes) = payload else {
            return Ok(Transition::Hold);
        };
        let Some(code) = api::extract_auth_code(&bytes) else {
            debug!(key = cx.key(), "input without authorization code");
            return Ok(Transition::Hold);
        };
        let request = api::exchange_code(&self.config, &code);
        self.send(cx, request);
        Ok(Transition::Next)
    }

    #[on(state = GetAccessToken, event = HttpSuccess, next = Idle)]
    #[on(state = RefreshToken, event = HttpSuccess, next = Idle)]
    fn store_tokens(
        &mut self,
        cx: &mut SessionContext<'_, Self>,
        payload: SyncPayload,
    ) -> ActionResult<Self> {
        let Outcome::Success(response) = self.outcome(cx.key(), payload) else {
            return Ok(Transition::Hold);
        };
        let issued: TokenResponse = api::parse(&response)?;
        self.tokens = Some(issued.into_tokens(self.tokens.as_ref()));
        self.last_error = None;
        info!(key = cx.key(), "tokens stored");
        Ok(Transition::Next)
    }

    #[on(state = GetAccessToken, event = HttpFailed, next = NeedsReauth)]
    #[on(state = RefreshToken, event = HttpFailed, next = NeedsReauth)]
    #[on(state = GetAccessToken, event = Timeout, next = NeedsReauth)]
    #[on(state = RefreshToken, event = Timeout, next = NeedsReauth)]
    fn require_reauth(
        &mut self,
        cx: &mut SessionContext<'_, Self>,
        payload: SyncPayload,
    ) -> ActionResult<Self> {
        let Outcome::Failure(reason) = self.outcome(cx.key(), payload) else {
            return Ok(Transition::Hold);
        };
        warn!(key = cx.key(), state = ?cx.state(), %reason, "token request failed, re-authorization required");
        self.tokens = None;
        self.last_error = Some(reason);
        Ok(Transition::Next)
    }

    #[on(state = Idle, event = RefreshEvt, next = RefreshToken)]
    #[state_timeout(duration = "30s")]
    fn refresh_token(
        &mut self,
        cx: &mut SessionContext<'_, Self>,
        _: SyncPayload,
    ) -> ActionResult<Self> {
        let Some(refresh) = self.tokens.as_ref().and_then(|t| t.refresh_token.clone()) else {
            warn!(key = cx.key(), "no refresh token, re-authorization required");
            return Ok(Transition::to(SyncState::NeedsReauth));
        };
        let request = api::refresh_token(&self.config, &refresh);
        self.send(cx, request);
        Ok(Transition::Next)
    }

    #[on(state = Idle, event = CreateSessionFolderEvt, next = GetSessionFolder)]
    #[state_timeout(duration = "30s")]
    fn request_session_folder(
        &mut self,
        cx: &mut SessionContext<'_, Self>,
        _: SyncPayload,
    ) -> ActionResult<Self> {
        let Some(token) = self.access_token() else {
            warn!(key = cx.key(), "sync requested without tokens");
            return Ok(Transition::to(SyncState::NeedsReauth));
        };
        self.retries = 0;
        self.folder_id = None;
        self.remote = None;
        let request = api::find_folder(&self.config, &token);
        self.send(cx, request);
        Ok(Transition::Next)
    }

    #[on(state = GetSessionFolder, event = HttpSuccess, next = GetExistSessionsId)]
    #[state_timeout(duration = "30s")]
    fn on_session_folder(
        &mut self,
        cx: &mut SessionContext<'_, Self>,
        payload: SyncPayload,
    ) -> ActionResult<Self> {
        let Outcome::Success(response) = self.outcome(cx.key(), payload) else {
            return Ok(Transition::Hold);
        };
        let Some(token) = self.access_token() else {
            return Ok(Transition::to(SyncState::NeedsReauth));
        };
        let found: FileList = api::parse(&response)?;
        match found.files.into_iter().next() {
            Some(folder) => {
                debug!(key = cx.key(), folder = %folder.id, "session folder found");
                let request = api::list_sessions(&self.config, &token, &folder.id);
                self.folder_id = Some(folder.id);
                self.send(cx, request);
                Ok(Transition::Next)
            }
            None => {
                info!(key = cx.key(), folder = %self.config.folder_name, "creating session folder");
                let request = api::create_folder(&self.config, &token)?;
                self.send(cx, request);
                Ok(Transition::to(SyncState::CreateSessionFolder))
            }
        }
    }

    #[on(state = CreateSessionFolder, event = HttpSuccess, next = GetExistSessionsId)]
    #[state_timeout(duration = "30s")]
    fn on_folder_created(
        &mut self,
        cx: &mut SessionContext<'_, Self>,
        payload: SyncPayload,
    ) -> ActionResult<Self> {
        let Outcome::Success(response) = self.outcome(cx.key(), payload) else {
            return Ok(Transition::Hold);
        };
        let Some(token) = self.access_token() else {
            return Ok(Transition::to(SyncState::NeedsReauth));
        };
        let folder: RemoteFile = api::parse(&response)?;
        let request = api::list_sessions(&self.config, &token, &folder.id);
        self.folder_id = Some(folder.id);
        self.send(cx, request);
        Ok(Transition::Next)
    }

    #[on(state = GetExistSessionsId, event = HttpSuccess, next = CheckAction)]
    fn on_existing_sessions(
        &mut self,
        cx: &mut SessionContext<'_, Self>,
        payload: SyncPayload,
    ) -> ActionResult<Self> {
        let Outcome::Success(response) = self.outcome(cx.key(), payload) else {
            return Ok(Transition::Hold);
        };
        let listed: FileList = api::parse(&response)?;
        let remote: BTreeMap<String, String> = listed
            .files
            .into_iter()
            .map(|file| (file.name, file.id))
            .collect();
        debug!(key = cx.key(), count = remote.len(), "remote sessions listed");
        self.remote = Some(remote);
        cx.post(SyncEvent::Next, SyncPayload::None)?;
        Ok(Transition::Next)
    }

    #[on(state = CheckAction, event = Next, next = Idle)]
    fn check_action(
        &mut self,
        cx: &mut SessionContext<'_, Self>,
        _: SyncPayload,
    ) -> ActionResult<Self> {
        self.drop_unreachable(cx.key());
        let next = if !self.uploads.is_empty() {
            Some(SyncEvent::UploadEvt)
        } else if !self.downloads.is_empty() {
            Some(SyncEvent::DownloadEvt)
        } else if !self.deletes.is_empty() {
            Some(SyncEvent::DeleteEvt)
        } else if !self.renames.is_empty() {
            Some(SyncEvent::RenameEvt)
        } else {
            None
        };
        match next {
            Some(event) => {
                cx.post(event, SyncPayload::None)?;
                Ok(Transition::Hold)
            }
            None => {
                info!(key = cx.key(), "sync complete");
                Ok(Transition::Next)
            }
        }
    }

    #[on(state = CheckAction, event = UploadEvt, next = UploadSession)]
    #[state_timeout(duration = "30s")]
    fn start_upload(
        &mut self,
        cx: &mut SessionContext<'_, Self>,
        _: SyncPayload,
    ) -> ActionResult<Self> {
        if self.uploads.is_empty() {
            return Ok(Transition::Hold);
        }
        let Some(token) = self.access_token() else {
            return Ok(Transition::to(SyncState::NeedsReauth));
        };
        let folder = match self.session_folder() {
            Ok(folder) => folder,
            Err(err) => return self.skip_unsendable(cx, err),
        };
        let Some((name, data)) = self.uploads.first_key_value() else {
            return Ok(Transition::Hold);
        };
        let existing = self.remote.as_ref().and_then(|remote| remote.get(name));
        let request = api::upload(
            &self.config,
            &token,
            &folder,
            name,
            data,
            existing.map(String::as_str),
        );
        self.current = Some(name.clone());
        self.send(cx, request);
        Ok(Transition::Next)
    }

    #[on(state = UploadSession, event = HttpSuccess, next = UploadDone)]
    fn finish_upload(
        &mut self,
        cx: &mut SessionContext<'_, Self>,
        payload: SyncPayload,
    ) -> ActionResult<Self> {
        let Outcome::Success(response) = self.outcome(cx.key(), payload) else {
            return Ok(Transition::Hold);
        };
        if let Some(name) = self.current.take() {
            if let (Ok(file), Some(remote)) = (api::parse::<RemoteFile>(&response), &mut self.remote) {
                remote.insert(name.clone(), file.id);
            }
            self.uploads.remove(&name);
            info!(key = cx.key(), file = %name, "uploaded");
        }
        self.retries = 0;
        cx.post(SyncEvent::Next, SyncPayload::None)?;
        Ok(Transition::Next)
    }

    #[on(state = CheckAction, event = DownloadEvt, next = DownloadSession)]
    #[state_timeout(duration = "30s")]
    fn start_download(
        &mut self,
        cx: &mut SessionContext<'_, Self>,
        _: SyncPayload,
    ) -> ActionResult<Self> {
        let Some(name) = self.downloads.first().cloned() else {
            return Ok(Transition::Hold);
        };
        let Some(token) = self.access_token() else {
            return Ok(Transition::to(SyncState::NeedsReauth));
        };
        let id = match self.remote_id(&name) {
            Ok(id) => id,
            Err(err) => return self.skip_unsendable(cx, err),
        };
        let request = api::download(&self.config, &token, &id);
        self.current = Some(name);
        self.send(cx, request);
        Ok(Transition::Next)
    }

    #[on(state = DownloadSession, event = HttpSuccess, next = DownloadDone)]
    fn finish_download(
        &mut self,
        cx: &mut SessionContext<'_, Self>,
        payload: SyncPayload,
    ) -> ActionResult<Self> {
        let Outcome::Success(response) = self.outcome(cx.key(), payload) else {
            return Ok(Transition::Hold);
        };
        if let Some(name) = self.current.take() {
            self.downloads.remove(&name);
            info!(key = cx.key(), file = %name, bytes = response.body.len(), "downloaded");
            self.downloaded.insert(name, response.body);
        }
        self.retries = 0;
        cx.post(SyncEvent::Next, SyncPayload::None)?;
        Ok(Transition::Next)
    }

    #[on(state = CheckAction, event = DeleteEvt, next = DeleteSession)]
    #[state_timeout(duration = "30s")]
    fn start_delete(
        &mut self,
        cx: &mut SessionContext<'_, Self>,
        _: SyncPayload,
    ) -> ActionResult<Self> {
        let Some(name) = self.deletes.first().cloned() else {
            return Ok(Transition::Hold);
        };
        let Some(token) = self.access_token() else {
            return Ok(Transition::to(SyncState::NeedsReauth));
        };
        let id = match self.remote_id(&name) {
            Ok(id) => id,
            Err(err) => return self.skip_unsendable(cx, err),
        };
        let request = api::delete(&self.config, &token, &id);
        self.current = Some(name);
        self.send(cx, request);
        Ok(Transition::Next)
    }

    #[on(state = DeleteSession, event = HttpSuccess, next = DeleteDone)]
    fn finish_delete(
        &mut self,
        cx: &mut SessionContext<'_, Self>,
        payload: SyncPayload,
    ) -> ActionResult<Self> {
        let Outcome::Success(_) = self.outcome(cx.key(), payload) else {
            return Ok(Transition::Hold);
        };
        if let Some(name) = self.current.take() {
            if let Some(remote) = &mut self.remote {
                remote.remove(&name);
            }
            self.deletes.remove(&name);
            info!(key = cx.key(), file = %name, "deleted");
        }
        self.retries = 0;
        cx.post(SyncEvent::Next, SyncPayload::None)?;
        Ok(Transition::Next)
    }

    #[on(state = CheckAction, event = RenameEvt, next = RenameSession)]
    #[state_timeout(duration = "30s")]
    fn start_rename(
        &mut self,
        cx: &mut SessionContext<'_, Self>,
        _: SyncPayload,
    ) -> ActionResult<Self> {
        let Some((from, to)) = self
            .renames
            .first_key_value()
            .map(|(from, to)| (from.clone(), to.clone()))
        else {
            return Ok(Transition::Hold);
        };
        let Some(token) = self.access_token() else {
            return Ok(Transition::to(SyncState::NeedsReauth));
        };
        let request = match self
            .remote_id(&from)
            .and_then(|id| api::rename(&self.config, &token, &id, &to).map_err(SyncError::from))
        {
            Ok(request) => request,
            Err(err) => return self.skip_unsendable(cx, err),
        };
        self.current = Some(from);
        self.send(cx, request);
        Ok(Transition::Next)
    }

    #[on(state = RenameSession, event = HttpSuccess, next = RenameDone)]
    fn finish_rename(
        &mut self,
        cx: &mut SessionContext<'_, Self>,
        payload: SyncPayload,
    ) -> ActionResult<Self> {
        let Outcome::Success(_) = self.outcome(cx.key(), payload) else {
            return Ok(Transition::Hold);
        };
        if let Some(from) = self.current.take()
            && let Some(to) = self.renames.remove(&from)
        {
            if let Some(remote) = &mut self.remote
                && let Some(id) = remote.remove(&from)
            {
                remote.insert(to.clone(), id);
            }
            info!(key = cx.key(), %from, %to, "renamed");
        }
        self.retries = 0;
        cx.post(SyncEvent::Next, SyncPayload::None)?;
        Ok(Transition::Next)
    }

    #[on(state = UploadDone, event = Next, next = CheckAction)]
    #[on(state = DownloadDone, event = Next, next = CheckAction)]
    #[on(state = DeleteDone, event = Next, next = CheckAction)]
    #[on(state = RenameDone, event = Next, next = CheckAction)]
    fn resume_check(
        &mut self,
        cx: &mut SessionContext<'_, Self>,
        _: SyncPayload,
    ) -> ActionResult<Self> {
        cx.post(SyncEvent::Next, SyncPayload::None)?;
        Ok(Transition::Next)
    }

    #[on(state = GetSessionFolder, event = HttpFailed, next = Retry)]
    #[on(state = CreateSessionFolder, event = HttpFailed, next = Retry)]
    #[on(state = GetExistSessionsId, event = HttpFailed, next = Retry)]
    #[on(state = UploadSession, event = HttpFailed, next = Retry)]
    #[on(state = DownloadSession, event = HttpFailed, next = Retry)]
    #[on(state = DeleteSession, event = HttpFailed, next = Retry)]
    #[on(state = RenameSession, event = HttpFailed, next = Retry)]
    #[on(state = GetSessionFolder, event = Timeout, next = Retry)]
    #[on(state = CreateSessionFolder, event = Timeout, next = Retry)]
    #[on(state = GetExistSessionsId, event = Timeout, next = Retry)]
    #[on(state = UploadSession, event = Timeout, next = Retry)]
    #[on(state = DownloadSession, event = Timeout, next = Retry)]
    #[on(state = DeleteSession, event = Timeout, next = Retry)]
    #[on(state = RenameSession, event = Timeout, next = Retry)]
    fn schedule_retry(
        &mut self,
        cx: &mut SessionContext<'_, Self>,
        payload: SyncPayload,
    ) -> ActionResult<Self> {
        let Outcome::Failure(reason) = self.outcome(cx.key(), payload) else {
            return Ok(Transition::Hold);
        };
        self.current = None;
        if self.retries >= self.config.max_retries {
            warn!(key = cx.key(), state = ?cx.state(), %reason, retries = self.retries, "giving up, pending items kept");
            self.last_error = Some(reason);
            self.retries = 0;
            return Ok(Transition::to(SyncState::Idle));
        }
        self.retries += 1;
        let delay = self.config.backoff(self.retries);
        warn!(key = cx.key(), state = ?cx.state(), %reason, attempt = self.retries, ?delay, "request failed, retrying");
        self.last_error = Some(reason);
        cx.post_after(delay, SyncEvent::Retry, SyncPayload::None);
        Ok(Transition::Next)
    }

    #[on(state = Retry, event = Retry, next = CheckAction)]
    #[state_timeout(duration = "30s")]
    fn resume_after_retry(
        &mut self,
        cx: &mut SessionContext<'_, Self>,
        _: SyncPayload,
    ) -> ActionResult<Self> {
        let Some(token) = self.access_token() else {
            return Ok(Transition::to(SyncState::NeedsReauth));
        };
        match (self.folder_id.clone(), self.remote.is_some()) {
            (None, _) => {
                let request = api::find_folder(&self.config, &token);
                self.send(cx, request);
                Ok(Transition::to(SyncState::GetSessionFolder))
            }
            (Some(folder), false) => {
                let request = api::list_sessions(&self.config, &token, &folder);
                self.send(cx, request);
                Ok(Transition::to(SyncState::GetExistSessionsId))
            }
            (Some(_), true) => {
                cx.post(SyncEvent::Next, SyncPayload::None)?;
                Ok(Transition::Next)
            }
        }
    }
}

static TABLE: OnceLock<Arc<FiniteStateMachine<CloudSync>>> = OnceLock::new();

/// The shared cloud-sync transition table, built on first use.
pub fn sync_table() -> Result<Arc<FiniteStateMachine<CloudSync>>, FsmError> {
    if let Some(table) = TABLE.get() {
        return Ok(table.clone());
    }
    let table = Arc::new(CloudSync::transition_table()?);
    Ok(TABLE.get_or_init(|| table).clone())
}

/// Install a cloud-sync session on the worker owning `key`.
pub fn spawn_sync(
    pool: &WorkerPool,
    key: RoutingKey,
    machine: CloudSync,
) -> Result<SessionHandle<CloudSync>, SyncError> {
    Ok(FsmSession::spawn(pool, key, machine, sync_table()?)?)
}

/// Creates a fresh cloud-sync session for every accepted connection.
#[derive(Clone)]
pub struct SyncFactory {
    config: Arc<SyncConfig>,
    http: Arc<dyn HttpClient>,
    table: Arc<FiniteStateMachine<CloudSync>>,
}

impl SyncFactory {
    pub fn new(config: Arc<SyncConfig>, http: Arc<dyn HttpClient>) -> Result<Self, SyncError> {
        Ok(Self {
            config,
            http,
            table: sync_table()?,
        })
    }
}

impl SessionFactory for SyncFactory {
    fn on_connection_established(&self, key: RoutingKey) -> Box<dyn ProtocolSession> {
        let machine = CloudSync::new(self.config.clone(), self.http.clone());
        Box::new(FsmSession::new(key, machine, self.table.clone()))
    }
}
