//! Contracts of the external collaborators: authentication, the item store
//! and object storage. The controller only ever talks to these traits.

pub mod error;
pub mod local;
pub mod memory;
pub mod rest;

use async_trait::async_trait;
use std::sync::Arc;

use crate::session::{Session, Subscription};
use crate::todo::{ItemId, NewTodo, TodoItem, TodoPatch};

pub use error::{IntoRemoteError, RemoteError};

/// Result of a sign-up request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignUpOutcome {
    SignedIn(Session),
    /// The provider sent a confirmation email; no session yet
    ConfirmationSent,
}

#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn current_session(&self) -> Result<Option<Session>, RemoteError>;

    /// Register for session-changed events. The first event is always `InitialSession`.
    fn subscribe(&self) -> Subscription;

    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session, RemoteError>;

    async fn sign_up(&self, email: &str, password: &str) -> Result<SignUpOutcome, RemoteError>;

    async fn request_password_reset(&self, email: &str) -> Result<(), RemoteError>;

    async fn sign_out(&self) -> Result<(), RemoteError>;
}

#[async_trait]
pub trait ItemStore: Send + Sync {
    /// All items owned by `owner`, newest first. Empty when there are none.
    async fn list(&self, owner: &str) -> Result<Vec<TodoItem>, RemoteError>;

    /// Insert and return the stored row with its assigned id and timestamps
    async fn insert(&self, new: NewTodo) -> Result<TodoItem, RemoteError>;

    async fn update(&self, id: ItemId, patch: TodoPatch) -> Result<(), RemoteError>;

    async fn delete(&self, id: ItemId) -> Result<(), RemoteError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOptions {
    pub content_type: String,
    pub overwrite: bool,
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn upload(&self, path: &str, bytes: Vec<u8>, options: UploadOptions) -> Result<(), RemoteError>;

    /// Publicly readable reference to the object at `path`
    fn public_url(&self, path: &str) -> String;

    /// Inverse of [`ObjectStorage::public_url`]; `None` for URLs this storage did not produce
    fn path_for_url(&self, url: &str) -> Option<String>;

    async fn delete(&self, path: &str) -> Result<(), RemoteError>;
}

/// The three collaborators a controller needs
#[derive(Clone)]
pub struct Backends {
    pub auth: Arc<dyn AuthProvider>,
    pub store: Arc<dyn ItemStore>,
    pub storage: Arc<dyn ObjectStorage>,
}

impl Backends {
    pub fn new(
        auth: Arc<dyn AuthProvider>,
        store: Arc<dyn ItemStore>,
        storage: Arc<dyn ObjectStorage>,
    ) -> Self {
        Self { auth, store, storage }
    }

    /// Use one value that implements all three contracts
    pub fn from_shared<T>(backend: Arc<T>) -> Self
    where
        T: AuthProvider + ItemStore + ObjectStorage + 'static,
    {
        Self {
            auth: backend.clone(),
            store: backend.clone(),
            storage: backend,
        }
    }
}
