//! JSON HTTP surface over the prediction pipeline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use spp_adapters::{ManualInput, SourceShape};
use spp_core::{SppError, StudentRecord, UserAction};
use spp_sync::{
    AppConfig, AuthenticatedSession, Authenticator, Pipeline, Reconciliation, SessionContext,
    StagedSummary,
};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "spp-web";
pub const SESSION_HEADER: &str = "x-session-token";

pub const DEFAULT_SESSION_IDLE: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_MAX_SESSIONS: usize = 256;

type SharedContext = Arc<Mutex<SessionContext>>;

struct SessionEntry {
    ctx: SharedContext,
    last_seen: Instant,
}

/// Live sessions. Entries idle for `idle_ttl` are dropped on the next login or
/// lookup; past `capacity` the least recently used entry is evicted.
struct SessionTable {
    entries: HashMap<Uuid, SessionEntry>,
    idle_ttl: Duration,
    capacity: usize,
}

impl SessionTable {
    fn new(idle_ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            idle_ttl,
            capacity: capacity.max(1),
        }
    }

    fn insert(&mut self, id: Uuid, ctx: SharedContext) {
        let now = Instant::now();
        let before = self.entries.len();
        let ttl = self.idle_ttl;
        self.entries.retain(|_, entry| now.duration_since(entry.last_seen) < ttl);
        let expired = before - self.entries.len();
        if expired > 0 {
            info!(expired, "dropped idle sessions");
        }
        while self.entries.len() >= self.capacity {
            let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_seen)
                .map(|(id, _)| *id)
            else {
                break;
            };
            self.entries.remove(&oldest);
            warn!(session = %oldest, "session table full; evicted least recently used session");
        }
        self.entries.insert(id, SessionEntry { ctx, last_seen: now });
    }

    fn touch(&mut self, id: &Uuid) -> Option<SharedContext> {
        let now = Instant::now();
        let entry = self.entries.get_mut(id)?;
        if now.duration_since(entry.last_seen) >= self.idle_ttl {
            self.entries.remove(id);
            return None;
        }
        entry.last_seen = now;
        Some(entry.ctx.clone())
    }

    fn remove(&mut self, id: &Uuid) -> bool {
        self.entries.remove(id).is_some()
    }
}

pub struct AppState {
    pipeline: Pipeline,
    auth: Authenticator,
    sessions: RwLock<SessionTable>,
}

impl AppState {
    pub fn new(pipeline: Pipeline, auth: Authenticator) -> Self {
        Self {
            pipeline,
            auth,
            sessions: RwLock::new(SessionTable::new(DEFAULT_SESSION_IDLE, DEFAULT_MAX_SESSIONS)),
        }
    }

    pub fn with_session_limits(self, idle_ttl: Duration, max_sessions: usize) -> Self {
        Self {
            sessions: RwLock::new(SessionTable::new(idle_ttl, max_sessions)),
            ..self
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.entries.len()
    }

    async fn context(&self, headers: &HeaderMap) -> Result<SharedContext, ApiError> {
        let token = headers
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or(ApiError::Unauthorized("missing session token"))?;
        let id = Uuid::parse_str(token.trim()).map_err(|_| ApiError::Unauthorized("malformed session token"))?;
        self.sessions
            .write()
            .await
            .touch(&id)
            .ok_or(ApiError::Unauthorized("unknown or expired session"))
    }

    async fn session(&self, headers: &HeaderMap) -> Result<AuthenticatedSession, ApiError> {
        let ctx = self.context(headers).await?;
        let session = ctx.lock().await.session().clone();
        Ok(session)
    }
}

#[derive(Debug)]
enum ApiError {
    Unauthorized(&'static str),
    Failed(SppError),
}

impl From<SppError> for ApiError {
    fn from(err: SppError) -> Self {
        Self::Failed(err)
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    action: &'static str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            Self::Unauthorized(reason) => (
                StatusCode::UNAUTHORIZED,
                ErrorBody {
                    error: reason.to_string(),
                    action: "log_in",
                },
            ),
            Self::Failed(err) => {
                let (status, action) = match err.action() {
                    UserAction::FixInput => (StatusCode::BAD_REQUEST, "fix_input"),
                    UserAction::TryAgainLater => (StatusCode::SERVICE_UNAVAILABLE, "try_again_later"),
                };
                if status.is_server_error() {
                    warn!(error = %err, "request failed");
                }
                (
                    status,
                    ErrorBody {
                        error: err.user_message(),
                        action,
                    },
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

#[derive(Debug, Serialize)]
struct LoginResponse {
    token: Uuid,
    username: String,
}

#[derive(Debug, Deserialize)]
struct ImportQuery {
    shape: String,
}

#[derive(Debug, Serialize)]
struct ImportResponse {
    staged: Option<StagedSummary>,
    added: usize,
    skipped: Vec<String>,
    records: Vec<StudentRecord>,
}

impl ImportResponse {
    fn new(staged: Option<StagedSummary>, outcome: Reconciliation) -> Self {
        Self {
            staged,
            added: outcome.added.len(),
            skipped: outcome.skipped.iter().map(|r| r.name().to_string()).collect(),
            records: outcome.added,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ActualRequest {
    value: f64,
}

pub fn app(state: AppState) -> Router {
    router(Arc::new(state))
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/login", post(login_handler))
        .route("/logout", post(logout_handler))
        .route("/predict", post(predict_handler))
        .route("/import", post(import_handler))
        .route("/import/retry", post(import_retry_handler))
        .route("/history", get(history_handler).delete(delete_all_handler))
        .route("/history/{name}", delete(delete_one_handler))
        .route("/history/{name}/actual", post(actual_handler))
        .route("/analysis", get(analysis_handler))
        .with_state(state)
}

/// Opens the configured store, brings its header up to date and serves.
pub async fn serve(config: &AppConfig) -> anyhow::Result<()> {
    let pipeline = Pipeline::from_config(config).await?;
    let status = pipeline.ensure_schema().await?;
    info!(?status, "store schema checked");
    let auth = Authenticator::from_yaml_file(&config.auth_file)?;
    info!(users = auth.user_count(), "credentials loaded");

    let listener = TcpListener::bind(("0.0.0.0", config.web_port)).await?;
    info!(port = config.web_port, "listening");
    let state = AppState::new(pipeline, auth)
        .with_session_limits(config.session_idle(), config.max_sessions);
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    serve(&AppConfig::from_env()?).await
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    let engine = state.pipeline.engine();
    Json(serde_json::json!({
        "status": "ok",
        "store": state.pipeline.store_backend(),
        "model": engine.model_name(),
        "model_version": engine.model_version(),
        "schema_version": state.pipeline.settings().schema_version,
    }))
    .into_response()
}

async fn login_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let session = state
        .auth
        .login(&request.username, &request.password)
        .ok_or(ApiError::Unauthorized("invalid username or password"))?;
    let response = LoginResponse {
        token: session.id(),
        username: session.username().to_string(),
    };
    state
        .sessions
        .write()
        .await
        .insert(session.id(), Arc::new(Mutex::new(SessionContext::new(session))));
    info!(user = %response.username, "logged in");
    Ok(Json(response))
}

async fn logout_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Result<StatusCode, ApiError> {
    let session = state.session(&headers).await?;
    if state.sessions.write().await.remove(&session.id()) {
        info!(user = session.username(), "logged out");
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn predict_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(input): Json<ManualInput>,
) -> Result<Response, ApiError> {
    let session = state.session(&headers).await?;
    let prediction = state.pipeline.predict_manual(&session, input).await?;
    Ok(Json(prediction).into_response())
}

/// Stages the upload in the caller's session, then writes it. A failed write
/// leaves the batch staged for `/import/retry`.
async fn import_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ImportQuery>,
    body: Bytes,
) -> Result<Json<ImportResponse>, ApiError> {
    let shape: SourceShape = query.shape.parse().map_err(SppError::InvalidInput)?;
    let ctx = state.context(&headers).await?;
    let mut ctx = ctx.lock().await;
    let staged = state.pipeline.stage_upload(&mut ctx, shape, &body)?;
    let outcome = state.pipeline.import_staged(&mut ctx).await?;
    Ok(Json(ImportResponse::new(Some(staged), outcome)))
}

async fn import_retry_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ImportResponse>, ApiError> {
    let ctx = state.context(&headers).await?;
    let mut ctx = ctx.lock().await;
    let outcome = state.pipeline.import_staged(&mut ctx).await?;
    Ok(Json(ImportResponse::new(None, outcome)))
}

async fn history_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<StudentRecord>>, ApiError> {
    state.session(&headers).await?;
    Ok(Json(state.pipeline.history().await?))
}

async fn delete_all_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let session = state.session(&headers).await?;
    let deleted = state.pipeline.delete_all(&session).await?;
    Ok(Json(serde_json::json!({ "deleted": deleted })).into_response())
}

async fn delete_one_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    let session = state.session(&headers).await?;
    let deleted = state.pipeline.delete_by_name(&session, &name).await?;
    Ok(Json(serde_json::json!({ "name": name, "deleted": deleted })).into_response())
}

async fn actual_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(name): Path<String>,
    Json(request): Json<ActualRequest>,
) -> Result<Response, ApiError> {
    let session = state.session(&headers).await?;
    let updated = state
        .pipeline
        .set_actual_performance(&session, &name, request.value)
        .await?;
    Ok(Json(serde_json::json!({ "name": name, "updated": updated })).into_response())
}

async fn analysis_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Result<Response, ApiError> {
    state.session(&headers).await?;
    Ok(Json(state.pipeline.analysis().await?).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use spp_adapters::Normalizer;
    use spp_model::PredictionEngine;
    use spp_storage::{ExportStore, MemoryStore};
    use spp_sync::PipelineSettings;
    use std::path::{Path as FsPath, PathBuf};
    use tower::ServiceExt;

    fn workspace_root() -> PathBuf {
        FsPath::new(env!("CARGO_MANIFEST_DIR")).join("../..")
    }

    async fn test_state(exports: &FsPath) -> AppState {
        let engine = PredictionEngine::load(workspace_root().join("models/performance_v1.json")).unwrap();
        let pipeline = Pipeline::new(
            Arc::new(MemoryStore::new()),
            engine,
            Normalizer::default(),
            PipelineSettings::default(),
            ExportStore::new(exports),
        )
        .unwrap();
        pipeline.ensure_schema().await.unwrap();
        let auth = Authenticator::from_yaml_file(workspace_root().join("config/auth.yaml")).unwrap();
        AppState::new(pipeline, auth)
    }

    async fn test_app(exports: &FsPath) -> Router {
        app(test_state(exports).await)
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let resp = app.clone().oneshot(request).await.unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json = if body.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&body).unwrap()
        };
        (status, json)
    }

    fn json_request(method: &str, uri: &str, token: Option<&str>, body: serde_json::Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            builder = builder.header(SESSION_HEADER, token);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn plain_request(method: &str, uri: &str, token: &str, body: Vec<u8>) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(SESSION_HEADER, token)
            .body(Body::from(body))
            .unwrap()
    }

    async fn login(app: &Router) -> String {
        let (status, body) = send(
            app,
            json_request(
                "POST",
                "/login",
                None,
                serde_json::json!({"username": "user3", "password": "password123"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        body["token"].as_str().unwrap().to_string()
    }

    fn manual_body(name: &str) -> serde_json::Value {
        serde_json::json!({
            "name": name,
            "gender": "Female",
            "age": 13,
            "grade": 7,
            "bullying_type": "verbal",
            "bullying": 3.0,
            "social_support": 3.0,
            "mental_health": 3.0
        })
    }

    #[tokio::test]
    async fn health_reports_model_and_store() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path()).await;
        let (status, body) = send(
            &app,
            Request::builder().uri("/health").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["store"], "memory");
        assert_eq!(body["schema_version"], "v1");
    }

    #[tokio::test]
    async fn writes_require_a_session() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path()).await;

        let (status, body) = send(&app, json_request("POST", "/predict", None, manual_body("Ayu"))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["action"], "log_in");

        let (status, _) = send(
            &app,
            json_request("POST", "/predict", Some(&Uuid::new_v4().to_string()), manual_body("Ayu")),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = send(
            &app,
            json_request(
                "POST",
                "/login",
                None,
                serde_json::json!({"username": "user3", "password": "wrong"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn predict_stores_once_and_rejects_bad_scores() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path()).await;
        let token = login(&app).await;

        let (status, body) = send(&app, json_request("POST", "/predict", Some(&token), manual_body("Ayu"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["stored"], true);
        assert_eq!(body["record"]["category"], "High");
        assert_eq!(body["record"]["sequence_no"], 1);

        let (_, again) = send(&app, json_request("POST", "/predict", Some(&token), manual_body("Ayu"))).await;
        assert_eq!(again["stored"], false);

        let mut bad = manual_body("Budi");
        bad["bullying"] = serde_json::json!(7.5);
        let (status, body) = send(&app, json_request("POST", "/predict", Some(&token), bad)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["action"], "fix_input");
    }

    #[tokio::test]
    async fn import_history_actual_and_delete_flow() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path()).await;
        let token = login(&app).await;
        let csv = std::fs::read(workspace_root().join("fixtures/raw_students.csv")).unwrap();

        let (status, body) = send(&app, plain_request("POST", "/import?shape=raw-csv", &token, csv.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["staged"]["rows"], 5);
        assert_eq!(body["added"], 4);
        assert_eq!(body["skipped"], serde_json::json!(["Ayu Lestari"]));

        let (_, body) = send(&app, plain_request("POST", "/import?shape=csv", &token, csv)).await;
        assert_eq!(body["added"], 0);

        let (status, history) = send(&app, plain_request("GET", "/history", &token, Vec::new())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(history.as_array().unwrap().len(), 4);

        let (status, body) = send(
            &app,
            json_request(
                "POST",
                "/history/Budi%20Santoso/actual",
                Some(&token),
                serde_json::json!({"value": 3.4}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["updated"], true);

        let (_, analysis) = send(&app, plain_request("GET", "/analysis", &token, Vec::new())).await;
        assert_eq!(analysis["total_records"], 4);
        assert!(!analysis["pending_actuals"]
            .as_array()
            .unwrap()
            .contains(&serde_json::json!("Budi Santoso")));

        let (_, body) = send(&app, plain_request("DELETE", "/history/Budi%20Santoso", &token, Vec::new())).await;
        assert_eq!(body["deleted"], 1);

        let (_, body) = send(&app, plain_request("DELETE", "/history", &token, Vec::new())).await;
        assert_eq!(body["deleted"], 3);
    }

    #[tokio::test]
    async fn bad_uploads_are_input_errors() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path()).await;
        let token = login(&app).await;

        let (status, body) = send(&app, plain_request("POST", "/import?shape=excel", &token, Vec::new())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["action"], "fix_input");

        let csv = std::fs::read(workspace_root().join("fixtures/raw_students.csv")).unwrap();
        let (status, _) = send(&app, plain_request("POST", "/import?shape=labeled", &token, csv)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app, plain_request("POST", "/import/retry", &token, Vec::new())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn logout_ends_the_session() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path()).await;
        let token = login(&app).await;

        let (status, _) = send(&app, plain_request("POST", "/logout", &token, Vec::new())).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(&app, plain_request("GET", "/history", &token, Vec::new())).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_and_logged_out_sessions_leave_the_table() {
        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(
            test_state(dir.path())
                .await
                .with_session_limits(Duration::from_secs(60), 8),
        );
        let app = router(state.clone());
        let first = login(&app).await;
        let second = login(&app).await;
        assert_eq!(state.session_count().await, 2);

        let (status, _) = send(&app, plain_request("POST", "/logout", &first, Vec::new())).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(state.session_count().await, 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        let (status, body) = send(&app, plain_request("GET", "/history", &second, Vec::new())).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["action"], "log_in");
        assert_eq!(state.session_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn activity_keeps_a_session_alive() {
        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(
            test_state(dir.path())
                .await
                .with_session_limits(Duration::from_secs(60), 8),
        );
        let app = router(state.clone());
        let token = login(&app).await;
        for _ in 0..3 {
            tokio::time::advance(Duration::from_secs(40)).await;
            let (status, _) = send(&app, plain_request("GET", "/history", &token, Vec::new())).await;
            assert_eq!(status, StatusCode::OK);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn full_table_evicts_least_recently_used() {
        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(
            test_state(dir.path())
                .await
                .with_session_limits(Duration::from_secs(600), 2),
        );
        let app = router(state.clone());
        let oldest = login(&app).await;
        tokio::time::advance(Duration::from_secs(1)).await;
        let middle = login(&app).await;
        tokio::time::advance(Duration::from_secs(1)).await;
        let newest = login(&app).await;
        assert_eq!(state.session_count().await, 2);

        let (status, _) = send(&app, plain_request("GET", "/history", &oldest, Vec::new())).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        for token in [&middle, &newest] {
            let (status, _) = send(&app, plain_request("GET", "/history", token, Vec::new())).await;
            assert_eq!(status, StatusCode::OK);
        }
    }

    #[test]
    fn store_failures_ask_to_try_again() {
        let resp = ApiError::from(SppError::store("append_rows", true, "timed out")).into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        let resp = ApiError::from(SppError::ConcurrentModification {
            expected_rows: 3,
            actual_rows: 4,
        })
        .into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
