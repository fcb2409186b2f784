use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use chrono::{Duration, SecondsFormat, Utc};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use to_cloud::backend::rest::{RestBackend, RestSettings};
use to_cloud::backend::{AuthProvider, Backends, ItemStore, ObjectStorage, UploadOptions};
use to_cloud::config::RemoteConfig;
use to_cloud::controller::{ControllerSettings, TodoController};
use to_cloud::session::{Session, User};
use to_cloud::todo::{ImageRef, ImageUpload, NewTodo, TodoPatch};

#[derive(Default)]
struct Mock {
    next_id: i64,
    rows: Vec<Value>,
    objects: HashMap<String, (String, Vec<u8>)>,
    refreshes: usize,
    logout_fails: bool,
}

type Shared = Arc<Mutex<Mock>>;

fn authorized(headers: &HeaderMap) -> bool {
    let has_key = headers.get("apikey").is_some_and(|key| key == "anon");
    let bearer = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("Bearer token-"));
    has_key && bearer
}

fn jwt_rejected() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "message": "JWT expired", "code": "PGRST301" })),
    )
        .into_response()
}

fn id_filter(query: &HashMap<String, String>) -> Option<i64> {
    query.get("id")?.strip_prefix("eq.")?.parse().ok()
}

async fn token(
    State(mock): State<Shared>,
    Query(query): Query<HashMap<String, String>>,
    Json(body): Json<Value>,
) -> Response {
    match query.get("grant_type").map(String::as_str) {
        Some("password") if body["password"] == "secret" => Json(json!({
            "access_token": "token-1",
            "refresh_token": "refresh-1",
            "expires_in": 3600,
            "token_type": "bearer",
            "user": { "id": "user-1", "email": body["email"], "role": "authenticated" }
        }))
        .into_response(),
        Some("refresh_token") if body["refresh_token"] == "refresh-old" => {
            mock.lock().unwrap().refreshes += 1;
            Json(json!({
                "access_token": "token-2",
                "refresh_token": "refresh-2",
                "expires_in": 3600,
                "user": { "id": "user-1", "email": "ada@example.com" }
            }))
            .into_response()
        }
        _ => (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": "invalid_grant",
                "error_description": "Invalid login credentials"
            })),
        )
            .into_response(),
    }
}

async fn list_rows(
    State(mock): State<Shared>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if !authorized(&headers) {
        return jwt_rejected();
    }
    assert_eq!(query.get("order").map(String::as_str), Some("created_at.desc"));

    let owner = query
        .get("user_id")
        .and_then(|filter| filter.strip_prefix("eq."))
        .unwrap_or_default()
        .to_string();
    let mut rows: Vec<Value> = mock
        .lock()
        .unwrap()
        .rows
        .iter()
        .filter(|row| row["user_id"] == owner.as_str())
        .cloned()
        .collect();
    rows.sort_by(|a, b| b["created_at"].as_str().cmp(&a["created_at"].as_str()));
    Json(rows).into_response()
}

async fn insert_rows(State(mock): State<Shared>, headers: HeaderMap, Json(rows): Json<Vec<Value>>) -> Response {
    if !authorized(&headers) {
        return jwt_rejected();
    }

    let mut mock = mock.lock().unwrap();
    let mut created = Vec::new();
    for mut row in rows {
        mock.next_id += 1;
        let at = (Utc::now() + Duration::milliseconds(mock.next_id)).to_rfc3339_opts(SecondsFormat::Micros, true);
        row["id"] = json!(mock.next_id);
        row["created_at"] = json!(at);
        row["updated_at"] = json!(at);
        row["image_url"] = Value::Null;
        row["image_path"] = Value::Null;
        mock.rows.push(row.clone());
        created.push(row);
    }
    (StatusCode::CREATED, Json(created)).into_response()
}

async fn update_rows(
    State(mock): State<Shared>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    Json(patch): Json<Value>,
) -> Response {
    if !authorized(&headers) {
        return jwt_rejected();
    }
    let Some(id) = id_filter(&query) else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    let mut mock = mock.lock().unwrap();
    let mut updated = Vec::new();
    for row in mock.rows.iter_mut().filter(|row| row["id"] == id) {
        if let (Some(target), Some(fields)) = (row.as_object_mut(), patch.as_object()) {
            for (key, value) in fields {
                target.insert(key.clone(), value.clone());
            }
        }
        updated.push(row.clone());
    }
    Json(updated).into_response()
}

async fn delete_rows(
    State(mock): State<Shared>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if !authorized(&headers) {
        return jwt_rejected();
    }
    let Some(id) = id_filter(&query) else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    let mut mock = mock.lock().unwrap();
    let (removed, kept): (Vec<Value>, Vec<Value>) = mock.rows.drain(..).partition(|row| row["id"] == id);
    mock.rows = kept;
    Json(removed).into_response()
}

async fn upload_object(
    State(mock): State<Shared>,
    Path(path): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !authorized(&headers) {
        return jwt_rejected();
    }
    let upsert = headers.get("x-upsert").and_then(|value| value.to_str().ok()) == Some("true");
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let mut mock = mock.lock().unwrap();
    if !upsert && mock.objects.contains_key(&path) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "statusCode": "409",
                "error": "Duplicate",
                "message": "The resource already exists"
            })),
        )
            .into_response();
    }
    mock.objects.insert(path.clone(), (content_type, body.to_vec()));
    Json(json!({ "Key": format!("todo-images/{path}") })).into_response()
}

async fn delete_objects(State(mock): State<Shared>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    if !authorized(&headers) {
        return jwt_rejected();
    }
    let prefixes: Vec<String> = body["prefixes"]
        .as_array()
        .map(|paths| paths.iter().filter_map(|p| p.as_str().map(String::from)).collect())
        .unwrap_or_default();

    let mut mock = mock.lock().unwrap();
    let removed: Vec<Value> = prefixes
        .into_iter()
        .filter(|path| mock.objects.remove(path).is_some())
        .map(|path| json!({ "name": path }))
        .collect();
    Json(removed).into_response()
}

async fn logout(State(mock): State<Shared>) -> Response {
    if mock.lock().unwrap().logout_fails {
        return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "msg": "upstream unavailable" }))).into_response();
    }
    StatusCode::NO_CONTENT.into_response()
}

async fn start() -> (Shared, String) {
    let mock: Shared = Arc::default();
    let app = Router::new()
        .route("/auth/v1/token", post(token))
        .route("/auth/v1/logout", post(logout))
        .route(
            "/rest/v1/todos",
            get(list_rows).post(insert_rows).patch(update_rows).delete(delete_rows),
        )
        .route("/storage/v1/object/todo-images", delete(delete_objects))
        .route("/storage/v1/object/todo-images/{*path}", post(upload_object))
        .with_state(mock.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (mock, format!("http://{addr}"))
}

fn settings(url: &str) -> RestSettings {
    RestSettings::from(&RemoteConfig {
        url: url.to_string(),
        anon_key: "anon".to_string(),
        ..RemoteConfig::default()
    })
}

async fn signed_in_client(url: &str) -> RestBackend {
    let client = RestBackend::new(settings(url), None).unwrap();
    client.sign_in_with_password("ada@example.com", "secret").await.unwrap();
    client
}

fn png_options() -> UploadOptions {
    UploadOptions {
        content_type: "image/png".to_string(),
        overwrite: false,
    }
}

#[tokio::test]
async fn sign_in_issues_session() {
    let (_mock, url) = start().await;
    let client = RestBackend::new(settings(&url), None).unwrap();
    assert_eq!(client.current_session().await.unwrap(), None);

    let session = client.sign_in_with_password("ada@example.com", "secret").await.unwrap();

    assert_eq!(session.access_token, "token-1");
    assert_eq!(session.user.id, "user-1");
    assert_eq!(session.user.email.as_deref(), Some("ada@example.com"));
    assert!(session.expires_at.unwrap() > Utc::now());
    assert_eq!(client.current_session().await.unwrap(), Some(session));
}

#[tokio::test]
async fn wrong_password_is_reported() {
    let (_mock, url) = start().await;
    let client = RestBackend::new(settings(&url), None).unwrap();

    let err = client.sign_in_with_password("ada@example.com", "nope").await.unwrap_err();

    assert_eq!(err.code, "HTTP_400");
    assert_eq!(err.message, "Invalid login credentials");
    assert_eq!(client.current_session().await.unwrap(), None);
}

#[tokio::test]
async fn table_requests_without_session_are_unauthorized() {
    let (_mock, url) = start().await;
    let client = RestBackend::new(settings(&url), None).unwrap();

    let err = client.list("user-1").await.unwrap_err();

    assert_eq!(err.code, "UNAUTHORIZED");
    assert_eq!(err.message, "JWT expired");
}

#[tokio::test]
async fn rows_roundtrip_through_table_api() {
    let (mock, url) = start().await;
    let client = signed_in_client(&url).await;

    let first = client.insert(NewTodo::new("user-1", "first")).await.unwrap();
    let second = client.insert(NewTodo::new("user-1", "second")).await.unwrap();
    mock.lock().unwrap().rows.push(json!({
        "id": 99, "user_id": "user-2", "text": "not mine", "completed": false,
        "created_at": "2025-01-01T00:00:00Z"
    }));

    let listed = client.list("user-1").await.unwrap();
    let texts: Vec<&str> = listed.iter().map(|item| item.text.as_str()).collect();
    assert_eq!(texts, vec!["second", "first"]);
    assert_eq!(listed[0].id, second.id);

    client.update(first.id, TodoPatch::completed(true)).await.unwrap();
    client
        .update(first.id, TodoPatch::image(Some(ImageRef::new("https://cdn/x.png", "user-1/x.png"))))
        .await
        .unwrap();
    let first_row = client
        .list("user-1")
        .await
        .unwrap()
        .into_iter()
        .find(|item| item.id == first.id)
        .unwrap();
    assert!(first_row.completed);
    assert_eq!(first_row.image.unwrap().path.as_deref(), Some("user-1/x.png"));

    ItemStore::delete(&client, second.id).await.unwrap();
    assert_eq!(client.list("user-1").await.unwrap().len(), 1);
    assert!(ItemStore::delete(&client, second.id).await.unwrap_err().is_not_found());
    assert!(
        client
            .update(second.id, TodoPatch::text("gone"))
            .await
            .unwrap_err()
            .is_not_found()
    );
}

#[tokio::test]
async fn objects_upload_resolve_and_delete() {
    let (mock, url) = start().await;
    let client = signed_in_client(&url).await;
    let path = "user-1/7-1700000000000-abcd1234.png";

    client.upload(path, b"png bytes".to_vec(), png_options()).await.unwrap();

    let (content_type, bytes) = mock.lock().unwrap().objects.get(path).cloned().unwrap();
    assert_eq!(content_type, "image/png");
    assert_eq!(bytes, b"png bytes".to_vec());

    let public = client.public_url(path);
    assert_eq!(public, format!("{url}/storage/v1/object/public/todo-images/{path}"));
    assert_eq!(client.path_for_url(&public).as_deref(), Some(path));
    assert_eq!(client.path_for_url("https://elsewhere.example/x.png"), None);

    let err = client.upload(path, b"again".to_vec(), png_options()).await.unwrap_err();
    assert_eq!(err.code, "CONFLICT");

    ObjectStorage::delete(&client, path).await.unwrap();
    assert!(mock.lock().unwrap().objects.is_empty());
    assert!(ObjectStorage::delete(&client, path).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn expired_session_is_refreshed_and_persisted() {
    let (mock, url) = start().await;
    let dir = tempfile::tempdir().unwrap();
    let session_path = dir.path().join("session.json");
    let stale = Session {
        access_token: "token-old".to_string(),
        refresh_token: Some("refresh-old".to_string()),
        expires_at: Some(Utc::now() - Duration::minutes(5)),
        user: User {
            id: "user-1".to_string(),
            email: Some("ada@example.com".to_string()),
        },
    };
    std::fs::write(&session_path, serde_json::to_string(&stale).unwrap()).unwrap();

    let client = RestBackend::new(settings(&url), Some(session_path.clone())).unwrap();
    let session = client.current_session().await.unwrap().unwrap();

    assert_eq!(session.access_token, "token-2");
    assert_eq!(mock.lock().unwrap().refreshes, 1);
    let persisted: Session = serde_json::from_str(&std::fs::read_to_string(&session_path).unwrap()).unwrap();
    assert_eq!(persisted, session);

    client.sign_out().await.unwrap();
    assert!(!session_path.exists());
    assert_eq!(client.current_session().await.unwrap(), None);
}

#[tokio::test]
async fn rejected_refresh_signs_out() {
    let (_mock, url) = start().await;
    let dir = tempfile::tempdir().unwrap();
    let session_path = dir.path().join("session.json");
    let stale = Session {
        access_token: "token-old".to_string(),
        refresh_token: Some("revoked".to_string()),
        expires_at: Some(Utc::now() - Duration::minutes(5)),
        user: User {
            id: "user-1".to_string(),
            email: None,
        },
    };
    std::fs::write(&session_path, serde_json::to_string(&stale).unwrap()).unwrap();

    let client = RestBackend::new(settings(&url), Some(session_path.clone())).unwrap();

    assert_eq!(client.current_session().await.unwrap(), None);
    assert!(!session_path.exists());
}

#[tokio::test]
async fn controller_runs_against_hosted_api() {
    let (mock, url) = start().await;
    let client = Arc::new(RestBackend::new(settings(&url), None).unwrap());
    let controller = TodoController::new(Backends::from_shared(client), ControllerSettings::default());
    controller.mount().await;
    assert_eq!(controller.is_authenticated(), Some(false));

    controller.sign_in("ada@example.com", "secret").await.unwrap();
    assert_eq!(controller.is_authenticated(), Some(true));
    assert!(controller.items().is_empty());

    let created = controller
        .create("with picture", Some(ImageUpload::new("pic.png", b"png".to_vec())))
        .await
        .applied()
        .unwrap();
    assert!(!created.is_partial());
    let image = created.item.image.clone().unwrap();
    let path = image.path.clone().unwrap();
    assert!(path.starts_with(&format!("user-1/{}-", created.item.id)));
    {
        let mock = mock.lock().unwrap();
        assert!(mock.objects.contains_key(&path));
        assert_eq!(mock.rows[0]["image_url"], json!(image.url));
        assert_eq!(mock.rows[0]["image_path"], json!(path));
    }

    assert!(controller.detach_image(created.item.id).await.is_applied());
    {
        let mock = mock.lock().unwrap();
        assert!(mock.objects.is_empty());
        assert_eq!(mock.rows[0]["image_url"], Value::Null);
    }

    assert!(controller.delete(created.item.id).await.is_applied());
    assert!(mock.lock().unwrap().rows.is_empty());
    assert!(controller.take_notices().iter().all(|notice| !notice.is_error()));
}

#[tokio::test]
async fn failed_logout_still_signs_controller_out() {
    let (mock, url) = start().await;
    let client = Arc::new(RestBackend::new(settings(&url), None).unwrap());
    let controller = TodoController::new(Backends::from_shared(client.clone()), ControllerSettings::default());
    controller.mount().await;
    controller.sign_in("ada@example.com", "secret").await.unwrap();
    controller.create("private", None).await.applied().unwrap();
    mock.lock().unwrap().logout_fails = true;

    let err = controller.sign_out().await.unwrap_err();

    assert_eq!(err.code, "HTTP_500");
    assert_eq!(client.current_session().await.unwrap(), None);
    assert_eq!(controller.is_authenticated(), Some(false));
    assert!(controller.principal().is_none());
    assert!(controller.items().is_empty());
    assert!(controller.take_notices().iter().any(|notice| notice.is_error()));
}
