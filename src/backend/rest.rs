//! Client for the hosted backend-as-a-service.
//!
//! Rows live behind a PostgREST-style table endpoint (`/rest/v1/<table>`),
//! images behind the storage object API (`/storage/v1/object/<bucket>/…`) and
//! sessions are issued by the password-grant auth API (`/auth/v1/…`).

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use std::fs;
use std::path::PathBuf;
use std::time::Duration as StdDuration;
use tracing::{debug, info, warn};

use super::{AuthProvider, ItemStore, ObjectStorage, RemoteError, SignUpOutcome, UploadOptions};
use crate::config::RemoteConfig;
use crate::session::{AuthEventKind, Session, SessionHub, Subscription, User};
use crate::todo::image::path_from_public_url;
use crate::todo::{ImageRef, ItemId, NewTodo, TodoItem, TodoPatch};

/// Characters left unescaped inside one object-key segment
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

#[derive(Debug, Clone)]
pub struct RestSettings {
    pub url: String,
    pub anon_key: String,
    pub table: String,
    pub bucket: String,
    pub timeout: StdDuration,
}

impl From<&RemoteConfig> for RestSettings {
    fn from(config: &RemoteConfig) -> Self {
        Self {
            url: config.url.trim().trim_end_matches('/').to_string(),
            anon_key: config.anon_key.trim().to_string(),
            table: config.table.clone(),
            bucket: config.bucket.clone(),
            timeout: StdDuration::from_secs(config.timeout_secs),
        }
    }
}

/// Row shape returned by the table endpoint
#[derive(Debug, Deserialize)]
struct TodoRow {
    id: i64,
    user_id: String,
    text: String,
    #[serde(default)]
    completed: bool,
    #[serde(default)]
    image_url: Option<String>,
    #[serde(default)]
    image_path: Option<String>,
    created_at: DateTime<Utc>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
}

impl From<TodoRow> for TodoItem {
    fn from(row: TodoRow) -> Self {
        let image = row.image_url.map(|url| ImageRef {
            url,
            path: row.image_path,
        });
        TodoItem {
            id: ItemId(row.id),
            user_id: row.user_id,
            text: row.text,
            completed: row.completed,
            image,
            created_at: row.created_at,
            updated_at: row.updated_at.unwrap_or(row.created_at),
        }
    }
}

fn patch_body(patch: &TodoPatch, now: DateTime<Utc>) -> Value {
    let mut body = Map::new();
    if let Some(text) = &patch.text {
        body.insert("text".to_string(), json!(text));
    }
    if let Some(completed) = patch.completed {
        body.insert("completed".to_string(), json!(completed));
    }
    if let Some(image) = &patch.image {
        let (url, path) = match image {
            Some(image) => (json!(image.url), json!(image.path)),
            None => (Value::Null, Value::Null),
        };
        body.insert("image_url".to_string(), url);
        body.insert("image_path".to_string(), path);
    }
    body.insert("updated_at".to_string(), json!(now.to_rfc3339()));
    Value::Object(body)
}

/// Token grant response of the auth API
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    expires_at: Option<i64>,
    user: User,
}

impl TokenResponse {
    fn into_session(self, now: DateTime<Utc>) -> Session {
        let expires_at = self
            .expires_at
            .and_then(|ts| DateTime::from_timestamp(ts, 0))
            .or_else(|| self.expires_in.map(|secs| now + Duration::seconds(secs)));
        Session {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at,
            user: self.user,
        }
    }
}

/// Error payloads differ between the table, storage and auth APIs
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    code: Option<Value>,
}

impl ErrorBody {
    fn message(&self) -> Option<String> {
        self.message
            .clone()
            .or_else(|| self.msg.clone())
            .or_else(|| self.error_description.clone())
            .or_else(|| self.error.clone())
    }

    fn code(&self) -> Option<String> {
        match &self.code {
            Some(Value::String(code)) if !code.is_empty() => Some(code.clone()),
            Some(Value::Number(code)) => Some(code.to_string()),
            _ => None,
        }
    }
}

fn error_from_status(status: StatusCode, body: &str) -> RemoteError {
    let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
    let message = parsed
        .message()
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("request failed").to_string());

    let duplicate = parsed.error.as_deref() == Some("Duplicate");
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RemoteError::unauthorized(message),
        StatusCode::NOT_FOUND => RemoteError::not_found(message),
        StatusCode::CONFLICT => RemoteError::conflict(message),
        _ if duplicate => RemoteError::conflict(message),
        _ => match parsed.code() {
            Some(code) => RemoteError::new(code, message, status.is_server_error()),
            None => RemoteError::http(status.as_u16(), message),
        },
    }
}

fn network_error(e: reqwest::Error) -> RemoteError {
    if e.is_decode() {
        RemoteError::invalid_response(e.to_string())
    } else {
        RemoteError::network(e.to_string())
    }
}

fn load_session(path: &PathBuf) -> Option<Session> {
    let content = fs::read_to_string(path).ok()?;
    match serde_json::from_str(&content) {
        Ok(session) => Some(session),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring unreadable session file");
            None
        }
    }
}

pub struct RestBackend {
    http: reqwest::Client,
    settings: RestSettings,
    hub: SessionHub,
    session_file: Option<PathBuf>,
}

impl RestBackend {
    /// `session_file` keeps the session between runs; `None` keeps it in memory only
    pub fn new(settings: RestSettings, session_file: Option<PathBuf>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(settings.timeout)
            .user_agent(concat!("to-cloud/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;

        let initial = session_file.as_ref().and_then(load_session);
        if let Some(session) = &initial {
            debug!(user = %session.user.id, "restored persisted session");
        }

        Ok(Self {
            http,
            settings,
            hub: SessionHub::new(initial),
            session_file,
        })
    }

    fn table_url(&self) -> String {
        format!("{}/rest/v1/{}", self.settings.url, self.settings.table)
    }

    fn auth_url(&self, endpoint: &str) -> String {
        format!("{}/auth/v1/{endpoint}", self.settings.url)
    }

    fn object_url(&self, path: &str) -> String {
        format!(
            "{}/storage/v1/object/{}/{}",
            self.settings.url,
            self.settings.bucket,
            encode_object_path(path)
        )
    }

    fn bearer(&self) -> String {
        self.hub
            .current()
            .map(|session| session.access_token)
            .unwrap_or_else(|| self.settings.anon_key.clone())
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.http
            .request(method, url)
            .header("apikey", &self.settings.anon_key)
            .bearer_auth(self.bearer())
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, RemoteError> {
        let response = request.send().await.map_err(network_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let error = error_from_status(status, &body);
        debug!(status = status.as_u16(), code = %error.code, "request rejected");
        Err(error)
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, RemoteError> {
        self.send(request)
            .await?
            .json::<T>()
            .await
            .map_err(|e| RemoteError::invalid_response(e.to_string()))
    }

    fn persist_session(&self, session: Option<&Session>) {
        let Some(path) = &self.session_file else {
            return;
        };

        let result = match session {
            Some(session) => serde_json::to_string_pretty(session)
                .map_err(anyhow::Error::from)
                .and_then(|content| {
                    if let Some(parent) = path.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    fs::write(path, content).map_err(anyhow::Error::from)
                }),
            None if path.exists() => fs::remove_file(path).map_err(anyhow::Error::from),
            None => Ok(()),
        };

        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "failed to persist session");
        }
    }

    fn set_session(&self, kind: AuthEventKind, session: Option<Session>) {
        self.persist_session(session.as_ref());
        self.hub.publish(kind, session);
    }

    async fn refresh(&self, refresh_token: &str) -> Result<Session, RemoteError> {
        let response: TokenResponse = self
            .send_json(
                self.http
                    .post(self.auth_url("token"))
                    .query(&[("grant_type", "refresh_token")])
                    .header("apikey", &self.settings.anon_key)
                    .json(&json!({ "refresh_token": refresh_token })),
            )
            .await?;
        Ok(response.into_session(Utc::now()))
    }
}

fn encode_object_path(path: &str) -> String {
    path.split('/')
        .map(|segment| utf8_percent_encode(segment, PATH_SEGMENT).to_string())
        .collect::<Vec<_>>()
        .join("/")
}

#[async_trait]
impl AuthProvider for RestBackend {
    async fn current_session(&self) -> Result<Option<Session>, RemoteError> {
        let Some(session) = self.hub.current() else {
            return Ok(None);
        };
        if !session.is_expired_at(Utc::now() + Duration::seconds(30)) {
            return Ok(Some(session));
        }

        let Some(refresh_token) = session.refresh_token.as_deref() else {
            info!("session expired without refresh token, signing out");
            self.set_session(AuthEventKind::SignedOut, None);
            return Ok(None);
        };

        match self.refresh(refresh_token).await {
            Ok(fresh) => {
                debug!(user = %fresh.user.id, "session refreshed");
                self.set_session(AuthEventKind::TokenRefreshed, Some(fresh.clone()));
                Ok(Some(fresh))
            }
            Err(e) if e.code == "UNAUTHORIZED" || e.code.starts_with("HTTP_4") => {
                warn!(error = %e, "refresh rejected, signing out");
                self.set_session(AuthEventKind::SignedOut, None);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn subscribe(&self) -> Subscription {
        self.hub.subscribe()
    }

    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session, RemoteError> {
        let response: TokenResponse = self
            .send_json(
                self.http
                    .post(self.auth_url("token"))
                    .query(&[("grant_type", "password")])
                    .header("apikey", &self.settings.anon_key)
                    .json(&json!({ "email": email, "password": password })),
            )
            .await?;

        let session = response.into_session(Utc::now());
        info!(user = %session.user.id, "signed in");
        self.set_session(AuthEventKind::SignedIn, Some(session.clone()));
        Ok(session)
    }

    async fn sign_up(&self, email: &str, password: &str) -> Result<SignUpOutcome, RemoteError> {
        let body: Value = self
            .send_json(
                self.http
                    .post(self.auth_url("signup"))
                    .header("apikey", &self.settings.anon_key)
                    .json(&json!({ "email": email, "password": password })),
            )
            .await?;

        if body.get("access_token").is_none() {
            info!("sign-up accepted, confirmation email sent");
            return Ok(SignUpOutcome::ConfirmationSent);
        }

        let response: TokenResponse =
            serde_json::from_value(body).map_err(|e| RemoteError::invalid_response(e.to_string()))?;
        let session = response.into_session(Utc::now());
        self.set_session(AuthEventKind::SignedIn, Some(session.clone()));
        Ok(SignUpOutcome::SignedIn(session))
    }

    async fn request_password_reset(&self, email: &str) -> Result<(), RemoteError> {
        self.send(
            self.http
                .post(self.auth_url("recover"))
                .header("apikey", &self.settings.anon_key)
                .json(&json!({ "email": email })),
        )
        .await?;
        Ok(())
    }

    async fn sign_out(&self) -> Result<(), RemoteError> {
        let result = match self.hub.current() {
            Some(_) => self
                .send(self.request(Method::POST, &self.auth_url("logout")))
                .await
                .map(|_| ()),
            None => Ok(()),
        };

        // The local session is dropped even when the server already forgot it
        self.set_session(AuthEventKind::SignedOut, None);
        match result {
            Err(e) if e.code != "UNAUTHORIZED" && !e.is_not_found() => Err(e),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl ItemStore for RestBackend {
    async fn list(&self, owner: &str) -> Result<Vec<TodoItem>, RemoteError> {
        let owner_filter = format!("eq.{owner}");
        let rows: Vec<TodoRow> = self
            .send_json(self.request(Method::GET, &self.table_url()).query(&[
                ("select", "*"),
                ("user_id", owner_filter.as_str()),
                ("order", "created_at.desc"),
            ]))
            .await?;
        Ok(rows.into_iter().map(TodoItem::from).collect())
    }

    async fn insert(&self, new: NewTodo) -> Result<TodoItem, RemoteError> {
        let mut rows: Vec<TodoRow> = self
            .send_json(
                self.request(Method::POST, &self.table_url())
                    .header("Prefer", "return=representation")
                    .json(&[new]),
            )
            .await?;

        if rows.is_empty() {
            return Err(RemoteError::invalid_response("Insert returned no row"));
        }
        Ok(rows.remove(0).into())
    }

    async fn update(&self, id: ItemId, patch: TodoPatch) -> Result<(), RemoteError> {
        let id_filter = format!("eq.{id}");
        let rows: Vec<Value> = self
            .send_json(
                self.request(Method::PATCH, &self.table_url())
                    .query(&[("id", id_filter.as_str())])
                    .header("Prefer", "return=representation")
                    .json(&patch_body(&patch, Utc::now())),
            )
            .await?;

        if rows.is_empty() {
            return Err(RemoteError::not_found(format!("Todo {id} not found")));
        }
        Ok(())
    }

    async fn delete(&self, id: ItemId) -> Result<(), RemoteError> {
        let id_filter = format!("eq.{id}");
        let rows: Vec<Value> = self
            .send_json(
                self.request(Method::DELETE, &self.table_url())
                    .query(&[("id", id_filter.as_str())])
                    .header("Prefer", "return=representation"),
            )
            .await?;

        if rows.is_empty() {
            return Err(RemoteError::not_found(format!("Todo {id} not found")));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStorage for RestBackend {
    async fn upload(&self, path: &str, bytes: Vec<u8>, options: UploadOptions) -> Result<(), RemoteError> {
        let size = bytes.len();
        self.send(
            self.request(Method::POST, &self.object_url(path))
                .header("Content-Type", options.content_type)
                .header("x-upsert", if options.overwrite { "true" } else { "false" })
                .header("cache-control", "max-age=3600")
                .body(bytes),
        )
        .await?;
        debug!(path, size, "object uploaded");
        Ok(())
    }

    fn public_url(&self, path: &str) -> String {
        format!(
            "{}/storage/v1/object/public/{}/{}",
            self.settings.url,
            self.settings.bucket,
            encode_object_path(path)
        )
    }

    fn path_for_url(&self, url: &str) -> Option<String> {
        path_from_public_url(url, &self.settings.bucket)
    }

    async fn delete(&self, path: &str) -> Result<(), RemoteError> {
        let url = format!("{}/storage/v1/object/{}", self.settings.url, self.settings.bucket);
        let removed: Vec<Value> = self
            .send_json(
                self.request(Method::DELETE, &url)
                    .json(&json!({ "prefixes": [path] })),
            )
            .await?;

        if removed.is_empty() {
            return Err(RemoteError::not_found(format!("Object {path} not found")));
        }
        Ok(())
    }
}
