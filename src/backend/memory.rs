//! In-process backend with fault injection.
//!
//! Every call is counted per [`Op`]; a failure queued with
//! [`MemoryBackend::fail_next`] is returned by the next call of that kind,
//! and [`MemoryBackend::pause_next`] holds the next call until released.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use uuid::Uuid;

use super::{AuthProvider, ItemStore, ObjectStorage, RemoteError, SignUpOutcome, UploadOptions};
use crate::session::{AuthEventKind, Session, SessionHub, Subscription, User};
use crate::todo::{ItemId, NewTodo, TodoItem, TodoPatch};

const URL_PREFIX: &str = "memory://todo-images/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    CurrentSession,
    SignIn,
    SignUp,
    ResetPassword,
    SignOut,
    List,
    Insert,
    Update,
    Delete,
    Upload,
    DeleteObject,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

struct Account {
    user: User,
    password: String,
}

#[derive(Default)]
struct MemoryState {
    next_id: i64,
    last_created: Option<DateTime<Utc>>,
    items: Vec<TodoItem>,
    objects: HashMap<String, StoredObject>,
    accounts: HashMap<String, Account>,
    failures: HashMap<Op, VecDeque<RemoteError>>,
    pauses: HashMap<Op, Arc<Notify>>,
    calls: HashMap<Op, usize>,
    reset_requests: Vec<String>,
}

impl MemoryState {
    /// Creation timestamps strictly increase so newest-first ordering is stable
    fn next_created_at(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let created = match self.last_created {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        };
        self.last_created = Some(created);
        created
    }
}

#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    hub: SessionHub,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend with one account that is already signed in
    pub fn signed_in(email: &str) -> Self {
        let backend = Self::new();
        let user = backend.add_account(email, "password");
        backend.hub.publish(AuthEventKind::SignedIn, Some(Self::issue_session(user)));
        backend
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn issue_session(user: User) -> Session {
        Session {
            access_token: Uuid::new_v4().to_string(),
            refresh_token: Some(Uuid::new_v4().to_string()),
            expires_at: Some(Utc::now() + Duration::hours(1)),
            user,
        }
    }

    pub fn add_account(&self, email: &str, password: &str) -> User {
        let user = User {
            id: Uuid::new_v4().to_string(),
            email: Some(email.to_string()),
        };
        self.lock().accounts.insert(
            email.to_lowercase(),
            Account {
                user: user.clone(),
                password: password.to_string(),
            },
        );
        user
    }

    pub fn session(&self) -> Option<Session> {
        self.hub.current()
    }

    /// Insert a row directly, bypassing counters and injected failures
    pub fn seed(&self, user_id: &str, text: &str) -> TodoItem {
        let mut state = self.lock();
        state.next_id += 1;
        let created = state.next_created_at();
        let item = TodoItem {
            id: ItemId(state.next_id),
            user_id: user_id.to_string(),
            text: text.to_string(),
            completed: false,
            image: None,
            created_at: created,
            updated_at: created,
        };
        state.items.push(item.clone());
        item
    }

    pub fn seed_object(&self, path: &str, bytes: Vec<u8>) {
        self.lock().objects.insert(
            path.to_string(),
            StoredObject {
                bytes,
                content_type: "application/octet-stream".to_string(),
            },
        );
    }

    pub fn fail_next(&self, op: Op, error: RemoteError) {
        self.lock().failures.entry(op).or_default().push_back(error);
    }

    /// Hold the next call of `op` until `notify_one` is called on the returned handle
    pub fn pause_next(&self, op: Op) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        self.lock().pauses.insert(op, notify.clone());
        notify
    }

    pub fn calls(&self, op: Op) -> usize {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn rows(&self) -> Vec<TodoItem> {
        self.lock().items.clone()
    }

    pub fn row(&self, id: ItemId) -> Option<TodoItem> {
        self.lock().items.iter().find(|item| item.id == id).cloned()
    }

    pub fn object(&self, path: &str) -> Option<StoredObject> {
        self.lock().objects.get(path).cloned()
    }

    pub fn object_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.lock().objects.keys().cloned().collect();
        paths.sort();
        paths
    }

    pub fn reset_requests(&self) -> Vec<String> {
        self.lock().reset_requests.clone()
    }

    async fn enter(&self, op: Op) -> Result<(), RemoteError> {
        let pause = {
            let mut state = self.lock();
            *state.calls.entry(op).or_insert(0) += 1;
            state.pauses.remove(&op)
        };

        if let Some(pause) = pause {
            pause.notified().await;
        }

        match self.lock().failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl AuthProvider for MemoryBackend {
    async fn current_session(&self) -> Result<Option<Session>, RemoteError> {
        self.enter(Op::CurrentSession).await?;
        Ok(self.hub.current())
    }

    fn subscribe(&self) -> Subscription {
        self.hub.subscribe()
    }

    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session, RemoteError> {
        self.enter(Op::SignIn).await?;

        let user = {
            let state = self.lock();
            match state.accounts.get(&email.to_lowercase()) {
                Some(account) if account.password == password => account.user.clone(),
                _ => return Err(RemoteError::unauthorized("Invalid login credentials")),
            }
        };

        let session = Self::issue_session(user);
        self.hub.publish(AuthEventKind::SignedIn, Some(session.clone()));
        Ok(session)
    }

    async fn sign_up(&self, email: &str, password: &str) -> Result<SignUpOutcome, RemoteError> {
        self.enter(Op::SignUp).await?;

        if self.lock().accounts.contains_key(&email.to_lowercase()) {
            return Err(RemoteError::conflict("User already registered"));
        }

        let user = self.add_account(email, password);
        let session = Self::issue_session(user);
        self.hub.publish(AuthEventKind::SignedIn, Some(session.clone()));
        Ok(SignUpOutcome::SignedIn(session))
    }

    async fn request_password_reset(&self, email: &str) -> Result<(), RemoteError> {
        self.enter(Op::ResetPassword).await?;
        self.lock().reset_requests.push(email.to_lowercase());
        Ok(())
    }

    async fn sign_out(&self) -> Result<(), RemoteError> {
        self.enter(Op::SignOut).await?;
        self.hub.publish(AuthEventKind::SignedOut, None);
        Ok(())
    }
}

#[async_trait]
impl ItemStore for MemoryBackend {
    async fn list(&self, owner: &str) -> Result<Vec<TodoItem>, RemoteError> {
        self.enter(Op::List).await?;

        let mut items: Vec<TodoItem> = self
            .lock()
            .items
            .iter()
            .filter(|item| item.user_id == owner)
            .cloned()
            .collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(items)
    }

    async fn insert(&self, new: NewTodo) -> Result<TodoItem, RemoteError> {
        self.enter(Op::Insert).await?;

        let mut state = self.lock();
        state.next_id += 1;
        let created = state.next_created_at();
        let item = TodoItem {
            id: ItemId(state.next_id),
            user_id: new.user_id,
            text: new.text,
            completed: new.completed,
            image: None,
            created_at: created,
            updated_at: created,
        };
        state.items.push(item.clone());
        Ok(item)
    }

    async fn update(&self, id: ItemId, patch: TodoPatch) -> Result<(), RemoteError> {
        self.enter(Op::Update).await?;

        let mut state = self.lock();
        let item = state
            .items
            .iter_mut()
            .find(|item| item.id == id)
            .ok_or_else(|| RemoteError::not_found(format!("Todo {id} not found")))?;
        patch.apply_to(item, Utc::now());
        Ok(())
    }

    async fn delete(&self, id: ItemId) -> Result<(), RemoteError> {
        self.enter(Op::Delete).await?;

        let mut state = self.lock();
        let before = state.items.len();
        state.items.retain(|item| item.id != id);
        if state.items.len() == before {
            return Err(RemoteError::not_found(format!("Todo {id} not found")));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStorage for MemoryBackend {
    async fn upload(&self, path: &str, bytes: Vec<u8>, options: UploadOptions) -> Result<(), RemoteError> {
        self.enter(Op::Upload).await?;

        let mut state = self.lock();
        if !options.overwrite && state.objects.contains_key(path) {
            return Err(RemoteError::conflict(format!("Object {path} already exists")));
        }
        state.objects.insert(
            path.to_string(),
            StoredObject {
                bytes,
                content_type: options.content_type,
            },
        );
        Ok(())
    }

    fn public_url(&self, path: &str) -> String {
        format!("{URL_PREFIX}{path}")
    }

    fn path_for_url(&self, url: &str) -> Option<String> {
        url.strip_prefix(URL_PREFIX)
            .filter(|path| !path.is_empty())
            .map(str::to_string)
    }

    async fn delete(&self, path: &str) -> Result<(), RemoteError> {
        self.enter(Op::DeleteObject).await?;

        match self.lock().objects.remove(path) {
            Some(_) => Ok(()),
            None => Err(RemoteError::not_found(format!("Object {path} not found"))),
        }
    }
}
