//! Todo list controller.
//!
//! Keeps the local list consistent with the remote store by applying every
//! mutation locally first and reverting it when the remote call fails.
//! Local state sits behind a `std::sync::Mutex` that is only held between
//! suspension points, so independent mutations on different items can be
//! in flight at the same time. A second mutation of an item that is still
//! in flight is rejected with [`Rejection::Busy`].

mod account;
mod image;
mod outcome;

pub use outcome::{Created, EditSession, ImageState, Mutation, Rejection};

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::backend::{Backends, RemoteError};
use crate::config::Config;
use crate::notice::{self, Action, Notice};
use crate::session::{AuthEvent, AuthEventKind, Subscription, User};
use crate::todo::{ImageUpload, ItemId, NewTodo, TodoItem, TodoList, TodoPatch};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerSettings {
    pub max_image_bytes: u64,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            max_image_bytes: 5 * 1024 * 1024,
        }
    }
}

impl From<&Config> for ControllerSettings {
    fn from(config: &Config) -> Self {
        Self {
            max_image_bytes: config.images.max_bytes,
        }
    }
}

struct ControllerState {
    list: TodoList,
    loading: bool,
    authenticated: Option<bool>,
    principal: Option<User>,
    /// Owner whose items are currently in `list`
    loaded_for: Option<String>,
    editing: Option<EditSession>,
    in_flight: HashSet<ItemId>,
    uploading: HashSet<ItemId>,
    notices: Vec<Notice>,
}

impl Default for ControllerState {
    fn default() -> Self {
        Self {
            list: TodoList::new(),
            loading: true,
            authenticated: None,
            principal: None,
            loaded_for: None,
            editing: None,
            in_flight: HashSet::new(),
            uploading: HashSet::new(),
            notices: Vec::new(),
        }
    }
}

/// Marks an item as having a mutation in flight until dropped
struct ItemGuard<'a> {
    controller: &'a TodoController,
    id: ItemId,
}

impl Drop for ItemGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.controller.lock();
        state.in_flight.remove(&self.id);
        state.uploading.remove(&self.id);
    }
}

pub struct TodoController {
    backends: Backends,
    settings: ControllerSettings,
    state: Mutex<ControllerState>,
    mounted: AtomicBool,
    subscription: tokio::sync::Mutex<Option<Subscription>>,
    unmounted: Notify,
}

impl TodoController {
    pub fn new(backends: Backends, settings: ControllerSettings) -> Self {
        Self {
            backends,
            settings,
            state: Mutex::new(ControllerState::default()),
            mounted: AtomicBool::new(false),
            subscription: tokio::sync::Mutex::new(None),
            unmounted: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Session lifecycle
    // ------------------------------------------------------------------

    /// Register for session changes, check the current session and load the
    /// list when someone is signed in
    pub async fn mount(&self) {
        self.mounted.store(true, Ordering::SeqCst);
        let mut subscription = self.backends.auth.subscribe();
        debug!(listener = subscription.id(), "subscribed to session changes");

        let checked = self.backends.auth.current_session().await;

        // Events queued so far describe the session we just checked
        while subscription.try_next().is_some() {}
        *self.subscription.lock().await = Some(subscription);

        match checked {
            Ok(session) => {
                self.handle_auth_event(AuthEvent {
                    kind: AuthEventKind::InitialSession,
                    session,
                })
                .await;
            }
            Err(e) => {
                error!(error = %e, "session check failed");
                if self.is_mounted() {
                    let mut state = self.lock();
                    state.authenticated = Some(false);
                    state.loading = false;
                }
            }
        }
    }

    /// Deregister from session changes; results that arrive later are ignored
    pub async fn unmount(&self) {
        self.mounted.store(false, Ordering::SeqCst);
        self.unmounted.notify_waiters();
        if let Some(subscription) = self.subscription.lock().await.take() {
            debug!(listener = subscription.id(), "unsubscribed from session changes");
            subscription.unsubscribe();
        }
    }

    /// Handle every session event that is already queued. Returns how many were handled.
    pub async fn pump_session_events(&self) -> usize {
        let events: Vec<AuthEvent> = {
            let mut guard = self.subscription.lock().await;
            match guard.as_mut() {
                Some(subscription) => std::iter::from_fn(|| subscription.try_next()).collect(),
                None => Vec::new(),
            }
        };

        let count = events.len();
        for event in events {
            self.handle_auth_event(event).await;
        }
        count
    }

    /// Follow session changes until [`TodoController::unmount`] is called.
    /// The subscription is owned by this loop while it runs.
    pub async fn watch_session(&self) {
        let Some(mut subscription) = self.subscription.lock().await.take() else {
            return;
        };

        loop {
            let mut unmounted = std::pin::pin!(self.unmounted.notified());
            unmounted.as_mut().enable();
            if !self.is_mounted() {
                break;
            }

            let event = tokio::select! {
                event = subscription.next() => event,
                _ = &mut unmounted => None,
            };

            match event {
                Some(event) => self.handle_auth_event(event).await,
                None => break,
            }
        }

        debug!(listener = subscription.id(), "stopped watching session changes");
    }

    pub async fn handle_auth_event(&self, event: AuthEvent) {
        if !self.is_mounted() {
            debug!(kind = ?event.kind, "ignoring session event after unmount");
            return;
        }

        let Some(user) = event.user().cloned() else {
            let mut state = self.lock();
            state.authenticated = Some(false);
            state.principal = None;
            state.loaded_for = None;
            state.editing = None;
            state.list.clear();
            state.loading = false;
            info!(kind = ?event.kind, "signed out");
            return;
        };

        let needs_load = {
            let mut state = self.lock();
            state.authenticated = Some(true);
            state.principal = Some(user.clone());
            let loaded = state.loaded_for.as_deref() == Some(user.id.as_str());
            match event.kind {
                AuthEventKind::InitialSession | AuthEventKind::SignedIn => !loaded,
                AuthEventKind::TokenRefreshed | AuthEventKind::SignedOut => false,
            }
        };

        if needs_load {
            // Failures are logged by list()
            let _ = self.list().await;
        }
    }

    // ------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------

    /// Fetch the principal's items, newest first
    pub async fn list(&self) -> Result<usize, RemoteError> {
        let owner = {
            let mut state = self.lock();
            match state.principal.as_ref().map(|user| user.id.clone()) {
                Some(owner) => {
                    state.loading = true;
                    owner
                }
                None => {
                    state.list.clear();
                    state.loading = false;
                    return Ok(0);
                }
            }
        };

        let result = self.backends.store.list(&owner).await;

        if !self.is_mounted() {
            debug!("discarding list result after unmount");
            return result.map(|items| items.len());
        }

        let mut state = self.lock();
        if state.principal.as_ref().map(|user| user.id.as_str()) != Some(owner.as_str()) {
            debug!(owner = %owner, "discarding list result for previous principal");
            return result.map(|items| items.len());
        }

        state.loading = false;
        match result {
            Ok(items) => {
                let count = items.len();
                state.list.replace_all(items);
                state.loaded_for = Some(owner);
                info!(count, "todos loaded");
                Ok(count)
            }
            Err(e) => {
                error!(error = %e, "failed to load todos");
                state.list.clear();
                Err(e)
            }
        }
    }

    pub async fn create(&self, text: &str, image: Option<ImageUpload>) -> Mutation<Created> {
        let text = text.trim();
        if text.is_empty() {
            return Mutation::Rejected(Rejection::EmptyText);
        }
        if let Some(upload) = &image
            && let Err(rejection) = self.validate_upload(upload)
        {
            return Mutation::Rejected(rejection);
        }

        let user = match self.backends.auth.current_session().await {
            Ok(Some(session)) => session.user,
            Ok(None) => return Mutation::Rejected(Rejection::NotSignedIn),
            Err(e) => return self.roll_back(Action::Add, e),
        };

        let mut item = match self.backends.store.insert(NewTodo::new(&user.id, text)).await {
            Ok(item) => item,
            Err(e) => return self.roll_back(Action::Add, e),
        };
        info!(id = %item.id, "todo created");
        self.lock().list.prepend(item.clone());

        let Some(upload) = image else {
            return Mutation::Applied(Created {
                item,
                image_error: None,
            });
        };

        let Some(guard) = self.claim(item.id) else {
            let e = RemoteError::conflict(format!("todo {} is busy", item.id));
            self.notify(Notice::partial_create(text, &e));
            return Mutation::Applied(Created {
                item,
                image_error: Some(e),
            });
        };

        let image_error = match self.attach_with_guard(&guard, &user.id, upload).await {
            Ok(image) => {
                item.image = Some(image);
                None
            }
            Err(e) => {
                warn!(id = %item.id, error = %e, "todo created without its image");
                self.notify(Notice::partial_create(text, &e));
                Some(e)
            }
        };
        drop(guard);

        Mutation::Applied(Created { item, image_error })
    }

    /// Flip `completed` locally, then confirm remotely. Returns the new value.
    pub async fn toggle_complete(&self, id: ItemId) -> Mutation<bool> {
        let _guard = match self.begin(id) {
            Ok(guard) => guard,
            Err(rejection) => return Mutation::Rejected(rejection),
        };

        let completed = {
            let mut state = self.lock();
            let Some(current) = state.list.get(id).map(|item| item.completed) else {
                return Mutation::Rejected(Rejection::NotFound(id));
            };
            state.list.set_completed(id, !current);
            !current
        };

        match self.backends.store.update(id, TodoPatch::completed(completed)).await {
            Ok(()) => {
                debug!(id = %id, completed, "todo toggled");
                Mutation::Applied(completed)
            }
            Err(e) => {
                self.lock().list.set_completed(id, !completed);
                self.roll_back(Action::Update, e)
            }
        }
    }

    pub fn begin_edit(&self, id: ItemId) -> Result<(), Rejection> {
        let mut state = self.lock();
        let Some(text) = state.list.get(id).map(|item| item.text.clone()) else {
            return Err(Rejection::NotFound(id));
        };
        state.editing = Some(EditSession { id, text });
        Ok(())
    }

    pub fn set_edit_text(&self, text: &str) -> Result<(), Rejection> {
        let mut state = self.lock();
        let Some(session) = state.editing.as_mut() else {
            return Err(Rejection::NoEditInProgress);
        };
        session.text = text.to_string();
        Ok(())
    }

    pub fn cancel_edit(&self) -> Option<EditSession> {
        self.lock().editing.take()
    }

    /// Rename the item being edited. The edit session survives a rejection.
    pub async fn rename(&self, id: ItemId, new_text: &str) -> Mutation<String> {
        if self.lock().editing.as_ref().map(|session| session.id) != Some(id) {
            return Mutation::Rejected(Rejection::NoEditInProgress);
        }
        let text = new_text.trim().to_string();
        if text.is_empty() {
            return Mutation::Rejected(Rejection::EmptyText);
        }

        let _guard = match self.begin(id) {
            Ok(guard) => guard,
            Err(rejection) => return Mutation::Rejected(rejection),
        };

        let previous = {
            let mut state = self.lock();
            let Some(previous) = state.list.set_text(id, text.clone()) else {
                return Mutation::Rejected(Rejection::NotFound(id));
            };
            state.editing = None;
            previous
        };

        match self.backends.store.update(id, TodoPatch::text(text.clone())).await {
            Ok(()) => {
                info!(id = %id, "todo renamed");
                Mutation::Applied(text)
            }
            Err(e) => {
                {
                    let mut state = self.lock();
                    state.list.set_text(id, previous);
                    if state.editing.is_none() {
                        state.editing = Some(EditSession { id, text });
                    }
                }
                self.roll_back(Action::Rename, e)
            }
        }
    }

    pub async fn save_edit(&self) -> Mutation<String> {
        match self.editing() {
            Some(session) => self.rename(session.id, &session.text).await,
            None => Mutation::Rejected(Rejection::NoEditInProgress),
        }
    }

    /// Remove an item. An attached image is detached first on a best-effort basis.
    pub async fn delete(&self, id: ItemId) -> Mutation {
        let _guard = match self.begin(id) {
            Ok(guard) => guard,
            Err(rejection) => return Mutation::Rejected(rejection),
        };

        let image = self.lock().list.get(id).and_then(|item| item.image.clone());
        if let Some(image) = image {
            match self.resolve_image_path(&image) {
                Some(path) => {
                    if let Err(e) = self.detach_with_path(id, &path).await {
                        warn!(id = %id, error = %e, "image detach failed, deleting todo anyway");
                    }
                }
                None => {
                    warn!(id = %id, url = %image.url, "unrecognized image reference, object left in storage");
                }
            }
        }

        let snapshot = {
            let mut state = self.lock();
            let snapshot = state.list.snapshot();
            state.list.remove(id);
            snapshot
        };

        match self.backends.store.delete(id).await {
            Ok(()) => {
                let mut state = self.lock();
                if state.editing.as_ref().is_some_and(|session| session.id == id) {
                    state.editing = None;
                }
                info!(id = %id, "todo deleted");
                Mutation::Applied(())
            }
            Err(e) => {
                self.lock().list.restore_from(snapshot, id);
                self.roll_back(Action::Delete, e)
            }
        }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn items(&self) -> Vec<TodoItem> {
        self.lock().list.items().to_vec()
    }

    pub fn item(&self, id: ItemId) -> Option<TodoItem> {
        self.lock().list.get(id).cloned()
    }

    pub fn completed_count(&self) -> usize {
        self.lock().list.completed_count()
    }

    pub fn is_loading(&self) -> bool {
        self.lock().loading
    }

    /// `None` until the first session check has finished
    pub fn is_authenticated(&self) -> Option<bool> {
        self.lock().authenticated
    }

    pub fn principal(&self) -> Option<User> {
        self.lock().principal.clone()
    }

    pub fn editing(&self) -> Option<EditSession> {
        self.lock().editing.clone()
    }

    pub fn image_state(&self, id: ItemId) -> Option<ImageState> {
        let state = self.lock();
        let item = state.list.get(id)?;
        Some(if state.uploading.contains(&id) {
            ImageState::Uploading
        } else if item.has_image() {
            ImageState::HasImage
        } else {
            ImageState::NoImage
        })
    }

    pub fn is_busy(&self, id: ItemId) -> bool {
        self.lock().in_flight.contains(&id)
    }

    pub fn take_notices(&self) -> Vec<Notice> {
        std::mem::take(&mut self.lock().notices)
    }

    /// Placeholder text for an empty list once loading has finished
    pub fn empty_hint(&self) -> Option<&'static str> {
        let state = self.lock();
        if state.loading || !state.list.is_empty() {
            return None;
        }
        Some(notice::empty_list_hint(state.authenticated == Some(true)))
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn begin(&self, id: ItemId) -> Result<ItemGuard<'_>, Rejection> {
        let mut state = self.lock();
        if state.list.get(id).is_none() {
            return Err(Rejection::NotFound(id));
        }
        if !state.in_flight.insert(id) {
            debug!(id = %id, "mutation rejected, item busy");
            return Err(Rejection::Busy(id));
        }
        Ok(ItemGuard { controller: self, id })
    }

    fn claim(&self, id: ItemId) -> Option<ItemGuard<'_>> {
        let claimed = self.lock().in_flight.insert(id);
        claimed.then(|| ItemGuard { controller: self, id })
    }

    fn validate_upload(&self, upload: &ImageUpload) -> Result<(), Rejection> {
        let size = upload.size();
        if size == 0 {
            return Err(Rejection::EmptyImage);
        }
        let limit = self.settings.max_image_bytes;
        if size > limit {
            return Err(Rejection::ImageTooLarge { size, limit });
        }
        Ok(())
    }

    fn notify(&self, notice: Notice) {
        self.lock().notices.push(notice);
    }

    fn roll_back<T>(&self, action: Action, error: RemoteError) -> Mutation<T> {
        error!(action = %action, error = %error, "remote call failed");
        self.notify(Notice::action_failed(action, &error));
        Mutation::RolledBack(error)
    }
}
