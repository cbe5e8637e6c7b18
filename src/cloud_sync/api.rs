//! Requests and responses of the OAuth and storage endpoints.

use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::config::SyncConfig;
use crate::{HttpError, HttpRequest, HttpResponse, Method};

const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
const BOUNDARY: &str = "shard_fsm_session_boundary";

/// Access and refresh tokens held by a sync session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
}

/// Token endpoint response body.
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

impl TokenResponse {
    /// Merge into tokens, keeping the old refresh token when the endpoint
    /// did not issue a new one.
    pub fn into_tokens(self, previous: Option<&OAuthTokens>) -> OAuthTokens {
        OAuthTokens {
            access_token: self.access_token,
            refresh_token: self
                .refresh_token
                .or_else(|| previous.and_then(|t| t.refresh_token.clone())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteFile {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct FileList {
    #[serde(default)]
    pub files: Vec<RemoteFile>,
}

pub fn parse<T: DeserializeOwned>(response: &HttpResponse) -> Result<T, HttpError> {
    response.json()
}

fn urlencoded(s: &str) -> String {
    utf8_percent_encode(s, NON_ALPHANUMERIC).to_string()
}

fn form(pairs: &[(&str, &str)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{k}={}", urlencoded(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Consent page URL the user opens to authorize the client.
pub fn authorization_url(config: &SyncConfig) -> String {
    format!(
        "{}?response_type=code&access_type=offline&client_id={}&redirect_uri={}&scope={}",
        config.auth_url,
        urlencoded(&config.client_id),
        urlencoded(&config.redirect_uri),
        urlencoded(&config.scopes.join(" ")),
    )
}

/// Extract `code` from the redirect request line, e.g.
/// `GET /?code=4/abc&scope=... HTTP/1.1`.
pub fn extract_auth_code(input: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(input);
    let query = text.split_once('?')?.1;
    let query = query.split_whitespace().next().unwrap_or(query);
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == "code")
        .map(|(_, v)| {
            percent_encoding::percent_decode_str(v)
                .decode_utf8_lossy()
                .into_owned()
        })
        .filter(|code| !code.is_empty())
}

fn token_request<'a>(config: &'a SyncConfig, mut pairs: Vec<(&'a str, &'a str)>) -> HttpRequest {
    pairs.push(("client_id", &config.client_id));
    if let Some(secret) = &config.client_secret {
        pairs.push(("client_secret", secret));
    }
    HttpRequest::post(&config.token_url)
        .header("Content-Type", "application/x-www-form-urlencoded")
        .body(form(&pairs))
}

pub fn exchange_code(config: &SyncConfig, code: &str) -> HttpRequest {
    token_request(
        config,
        vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", &config.redirect_uri),
        ],
    )
}

pub fn refresh_token(config: &SyncConfig, refresh_token: &str) -> HttpRequest {
    token_request(
        config,
        vec![("grant_type", "refresh_token"), ("refresh_token", refresh_token)],
    )
}

fn query(config: &SyncConfig, q: &str) -> String {
    format!(
        "{}/files?q={}&fields={}",
        config.api_url,
        urlencoded(q),
        urlencoded("files(id,name)"),
    )
}

fn escape(name: &str) -> String {
    name.replace('\\', "\\\\").replace('\'', "\\'")
}

pub fn find_folder(config: &SyncConfig, token: &str) -> HttpRequest {
    let q = format!(
        "name = '{}' and mimeType = '{FOLDER_MIME}' and trashed = false",
        escape(&config.folder_name)
    );
    HttpRequest::get(query(config, &q)).bearer(token)
}

pub fn create_folder(config: &SyncConfig, token: &str) -> Result<HttpRequest, HttpError> {
    HttpRequest::post(format!("{}/files", config.api_url))
        .bearer(token)
        .json(&serde_json::json!({
            "name": config.folder_name,
            "mimeType": FOLDER_MIME,
        }))
}

pub fn list_sessions(config: &SyncConfig, token: &str, folder_id: &str) -> HttpRequest {
    let q = format!("'{}' in parents and trashed = false", escape(folder_id));
    HttpRequest::get(query(config, &q)).bearer(token)
}

/// Upload `data` as `name`: a multipart create, or a media update when the
/// file already exists remotely.
pub fn upload(
    config: &SyncConfig,
    token: &str,
    folder_id: &str,
    name: &str,
    data: &[u8],
    existing: Option<&str>,
) -> HttpRequest {
    if let Some(id) = existing {
        return HttpRequest::new(
            Method::Patch,
            format!("{}/files/{}?uploadType=media", config.upload_url, urlencoded(id)),
        )
        .bearer(token)
        .header("Content-Type", "application/octet-stream")
        .body(data);
    }

    let metadata = serde_json::json!({ "name": name, "parents": [folder_id] });
    let mut body = Vec::with_capacity(data.len() + 256);
    body.extend_from_slice(
        format!(
            "--{BOUNDARY}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{metadata}\r\n\
             --{BOUNDARY}\r\nContent-Type: application/octet-stream\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

    HttpRequest::post(format!("{}/files?uploadType=multipart", config.upload_url))
        .bearer(token)
        .header("Content-Type", format!("multipart/related; boundary={BOUNDARY}"))
        .body(body)
}

pub fn download(config: &SyncConfig, token: &str, id: &str) -> HttpRequest {
    HttpRequest::get(format!("{}/files/{}?alt=media", config.api_url, urlencoded(id))).bearer(token)
}

pub fn delete(config: &SyncConfig, token: &str, id: &str) -> HttpRequest {
    HttpRequest::new(
        Method::Delete,
        format!("{}/files/{}", config.api_url, urlencoded(id)),
    )
    .bearer(token)
}

pub fn rename(
    config: &SyncConfig,
    token: &str,
    id: &str,
    new_name: &str,
) -> Result<HttpRequest, HttpError> {
    HttpRequest::new(
        Method::Patch,
        format!("{}/files/{}", config.api_url, urlencoded(id)),
    )
    .bearer(token)
    .json(&serde_json::json!({ "name": new_name }))
}
