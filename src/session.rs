//! Session-change notifications.
//!
//! Listeners register explicitly with [`SessionHub::subscribe`] and are
//! removed again when their [`Subscription`] is dropped or unsubscribed.
//! A new subscriber first receives an `InitialSession` event carrying the
//! session known at that moment.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub user: User,
}

impl Session {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires| expires <= now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthEventKind {
    InitialSession,
    SignedIn,
    SignedOut,
    TokenRefreshed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthEvent {
    pub kind: AuthEventKind,
    pub session: Option<Session>,
}

impl AuthEvent {
    pub fn user(&self) -> Option<&User> {
        self.session.as_ref().map(|session| &session.user)
    }
}

#[derive(Default)]
struct HubInner {
    next_id: u64,
    current: Option<Session>,
    listeners: HashMap<u64, mpsc::UnboundedSender<AuthEvent>>,
}

fn lock(inner: &Mutex<HubInner>) -> MutexGuard<'_, HubInner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Holds the current session and the registered listeners
#[derive(Clone, Default)]
pub struct SessionHub {
    inner: Arc<Mutex<HubInner>>,
}

impl SessionHub {
    pub fn new(initial: Option<Session>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HubInner {
                current: initial,
                ..Default::default()
            })),
        }
    }

    pub fn current(&self) -> Option<Session> {
        lock(&self.inner).current.clone()
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = lock(&self.inner);

        let id = inner.next_id;
        inner.next_id += 1;

        let _ = tx.send(AuthEvent {
            kind: AuthEventKind::InitialSession,
            session: inner.current.clone(),
        });
        inner.listeners.insert(id, tx);
        debug!(subscription = id, listeners = inner.listeners.len(), "session listener registered");

        Subscription {
            id,
            receiver: rx,
            hub: Arc::downgrade(&self.inner),
        }
    }

    /// Record the new session and notify every listener
    pub fn publish(&self, kind: AuthEventKind, session: Option<Session>) {
        let mut inner = lock(&self.inner);
        inner.current = session.clone();

        let event = AuthEvent { kind, session };
        inner
            .listeners
            .retain(|_, listener| listener.send(event.clone()).is_ok());
        debug!(?kind, listeners = inner.listeners.len(), "session event published");
    }

    #[cfg(test)]
    pub fn listener_count(&self) -> usize {
        lock(&self.inner).listeners.len()
    }
}

/// Registration handle. Dropping it deregisters the listener.
pub struct Subscription {
    id: u64,
    receiver: mpsc::UnboundedReceiver<AuthEvent>,
    hub: Weak<Mutex<HubInner>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the next event. `None` once the hub is gone.
    pub async fn next(&mut self) -> Option<AuthEvent> {
        self.receiver.recv().await
    }

    /// Next already-delivered event, without waiting
    pub fn try_next(&mut self) -> Option<AuthEvent> {
        self.receiver.try_recv().ok()
    }

    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.hub.upgrade() {
            lock(&inner).listeners.remove(&self.id);
            debug!(subscription = self.id, "session listener removed");
        }
    }
}
