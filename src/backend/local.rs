//! Offline backend: rows in SQLite, images in a directory, one built-in principal.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, params, params_from_iter, types::Value};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

use super::{
    AuthProvider, IntoRemoteError, ItemStore, ObjectStorage, RemoteError, SignUpOutcome, UploadOptions,
};
use crate::session::{Session, SessionHub, Subscription, User};
use crate::todo::{ImageRef, ItemId, NewTodo, TodoItem, TodoPatch};

pub const LOCAL_USER_ID: &str = "local";

/// Parse an RFC3339 timestamp string into a DateTime<Utc>
fn parse_rfc3339(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Raw data extracted from a database row before conversion to TodoItem
struct TodoRowData {
    id: i64,
    user_id: String,
    text: String,
    completed: i32,
    image_url: Option<String>,
    image_path: Option<String>,
    created_at_str: String,
    updated_at_str: String,
}

impl TodoRowData {
    const COLUMNS: &'static str =
        "id, user_id, text, completed, image_url, image_path, created_at, updated_at";

    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            text: row.get(2)?,
            completed: row.get(3)?,
            image_url: row.get(4)?,
            image_path: row.get(5)?,
            created_at_str: row.get(6)?,
            updated_at_str: row.get(7)?,
        })
    }

    fn into_todo_item(self) -> TodoItem {
        let created_at = parse_rfc3339(&self.created_at_str).unwrap_or_default();
        let updated_at = parse_rfc3339(&self.updated_at_str).unwrap_or(created_at);
        let image = self.image_url.map(|url| ImageRef {
            url,
            path: self.image_path,
        });

        TodoItem {
            id: ItemId(self.id),
            user_id: self.user_id,
            text: self.text,
            completed: self.completed != 0,
            image,
            created_at,
            updated_at,
        }
    }
}

/// Item store backed by a single SQLite file
pub struct SqliteItemStore {
    conn: Mutex<Connection>,
}

impl SqliteItemStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {path:?}"))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        init_database(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn init_database(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS todos (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id TEXT NOT NULL,
            text TEXT NOT NULL CHECK (length(trim(text)) > 0),
            completed INTEGER NOT NULL DEFAULT 0,
            image_url TEXT,
            image_path TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    // Databases created before image paths were stored
    conn.execute("ALTER TABLE todos ADD COLUMN image_path TEXT", [])
        .ok();

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_todos_user_created ON todos(user_id, created_at)",
        [],
    )?;

    Ok(())
}

#[async_trait]
impl ItemStore for SqliteItemStore {
    async fn list(&self, owner: &str) -> Result<Vec<TodoItem>, RemoteError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM todos WHERE user_id = ?1 ORDER BY created_at DESC, id DESC",
                TodoRowData::COLUMNS
            ))
            .into_database_error()?;

        let rows = stmt
            .query_map(params![owner], TodoRowData::from_row)
            .into_database_error()?;

        let mut items = Vec::new();
        for row in rows {
            items.push(row.into_database_error()?.into_todo_item());
        }
        Ok(items)
    }

    async fn insert(&self, new: NewTodo) -> Result<TodoItem, RemoteError> {
        let now = format_timestamp(Utc::now());
        let conn = self.conn();

        conn.execute(
            "INSERT INTO todos (user_id, text, completed, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![new.user_id, new.text, new.completed as i32, now],
        )
        .into_database_error()?;

        let id = conn.last_insert_rowid();
        debug!(id, "todo row inserted");

        conn.query_row(
            &format!("SELECT {} FROM todos WHERE id = ?1", TodoRowData::COLUMNS),
            params![id],
            TodoRowData::from_row,
        )
        .map(TodoRowData::into_todo_item)
        .into_database_error()
    }

    async fn update(&self, id: ItemId, patch: TodoPatch) -> Result<(), RemoteError> {
        let mut assignments = vec!["updated_at = ?".to_string()];
        let mut values = vec![Value::Text(format_timestamp(Utc::now()))];

        if let Some(text) = patch.text {
            assignments.push("text = ?".to_string());
            values.push(Value::Text(text));
        }
        if let Some(completed) = patch.completed {
            assignments.push("completed = ?".to_string());
            values.push(Value::Integer(completed as i64));
        }
        if let Some(image) = patch.image {
            assignments.push("image_url = ?".to_string());
            assignments.push("image_path = ?".to_string());
            match image {
                Some(image) => {
                    values.push(Value::Text(image.url));
                    values.push(image.path.map(Value::Text).unwrap_or(Value::Null));
                }
                None => {
                    values.push(Value::Null);
                    values.push(Value::Null);
                }
            }
        }
        values.push(Value::Integer(id.0));

        let sql = format!("UPDATE todos SET {} WHERE id = ?", assignments.join(", "));
        let changed = self
            .conn()
            .execute(&sql, params_from_iter(values))
            .into_database_error()?;

        if changed == 0 {
            return Err(RemoteError::not_found(format!("Todo {id} not found")));
        }
        Ok(())
    }

    async fn delete(&self, id: ItemId) -> Result<(), RemoteError> {
        let changed = self
            .conn()
            .execute("DELETE FROM todos WHERE id = ?1", params![id.0])
            .into_database_error()?;

        if changed == 0 {
            return Err(RemoteError::not_found(format!("Todo {id} not found")));
        }
        Ok(())
    }
}

/// Object storage rooted at a local directory
pub struct DirectoryStorage {
    root: PathBuf,
}

impl DirectoryStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn url_prefix(&self) -> String {
        format!("file://{}/", self.root.display())
    }

    /// Resolve a relative object key, refusing anything that escapes the root
    fn resolve(&self, path: &str) -> Result<PathBuf, RemoteError> {
        let relative = Path::new(path);
        let valid = !path.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !valid {
            return Err(RemoteError::storage(format!("Invalid object path: {path}")));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStorage for DirectoryStorage {
    async fn upload(&self, path: &str, bytes: Vec<u8>, options: UploadOptions) -> Result<(), RemoteError> {
        let target = self.resolve(path)?;
        let size = bytes.len();

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await.into_storage_error()?;
        }

        if options.overwrite {
            tokio::fs::write(&target, bytes).await.into_storage_error()?;
        } else {
            let mut file = tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&target)
                .await
                .map_err(|e| match e.kind() {
                    ErrorKind::AlreadyExists => {
                        RemoteError::conflict(format!("Object {path} already exists"))
                    }
                    _ => RemoteError::storage(e.to_string()),
                })?;
            tokio::io::AsyncWriteExt::write_all(&mut file, &bytes)
                .await
                .into_storage_error()?;
        }

        debug!(path, size, "object stored");
        Ok(())
    }

    fn public_url(&self, path: &str) -> String {
        format!("{}{path}", self.url_prefix())
    }

    fn path_for_url(&self, url: &str) -> Option<String> {
        let path = url.strip_prefix(&self.url_prefix())?;
        self.resolve(path).ok().map(|_| path.to_string())
    }

    async fn delete(&self, path: &str) -> Result<(), RemoteError> {
        let target = self.resolve(path)?;
        tokio::fs::remove_file(&target).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => RemoteError::not_found(format!("Object {path} not found")),
            _ => RemoteError::storage(e.to_string()),
        })
    }
}

/// The offline backend has exactly one principal and is always signed in
pub struct LocalAuth {
    hub: SessionHub,
}

impl LocalAuth {
    pub fn new() -> Self {
        let user = User {
            id: LOCAL_USER_ID.to_string(),
            email: std::env::var("USER").ok().map(|name| format!("{name}@localhost")),
        };
        let session = Session {
            access_token: LOCAL_USER_ID.to_string(),
            refresh_token: None,
            expires_at: None,
            user,
        };
        Self {
            hub: SessionHub::new(Some(session)),
        }
    }

    fn unsupported(action: &str) -> RemoteError {
        RemoteError::unsupported(format!(
            "{action} is not available with the local backend; switch to backend = \"remote\""
        ))
    }
}

impl Default for LocalAuth {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuthProvider for LocalAuth {
    async fn current_session(&self) -> Result<Option<Session>, RemoteError> {
        Ok(self.hub.current())
    }

    fn subscribe(&self) -> Subscription {
        self.hub.subscribe()
    }

    async fn sign_in_with_password(&self, _email: &str, _password: &str) -> Result<Session, RemoteError> {
        Err(Self::unsupported("Sign in"))
    }

    async fn sign_up(&self, _email: &str, _password: &str) -> Result<SignUpOutcome, RemoteError> {
        Err(Self::unsupported("Sign up"))
    }

    async fn request_password_reset(&self, _email: &str) -> Result<(), RemoteError> {
        Err(Self::unsupported("Password reset"))
    }

    async fn sign_out(&self) -> Result<(), RemoteError> {
        Err(Self::unsupported("Sign out"))
    }
}

/// Open the offline backend under `data_dir`
pub fn open_local(data_dir: &Path) -> Result<(LocalAuth, SqliteItemStore, DirectoryStorage)> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("Failed to create data directory {data_dir:?}"))?;

    let db_path = data_dir.join("todos.db");
    let store = SqliteItemStore::open(&db_path)?;
    let storage = DirectoryStorage::new(data_dir.join("objects"));
    info!(db = %db_path.display(), "local backend ready");

    Ok((LocalAuth::new(), store, storage))
}
