//! In-memory development backend serving the REST surface the client uses.
//!
//! Status semantics match what the client relies on: 401 for a missing or
//! invalid bearer token, 403 for non-admins on `/api/admin/*`, 402 when an
//! organisation is at its plan's cluster limit. Error bodies are plain text.

pub mod analysis;
pub mod auth;
pub mod state;

use std::collections::HashMap;

use axum::{
    extract::{DefaultBodyLimit, Multipart, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;

use crate::models::PlanId;
use auth::{auth_middleware, create_jwt, hash_password, require_admin, verify_password, AuthUser};
pub use state::AppState;
use state::StoreError;

/// Largest accepted manifest upload.
pub const MAX_UPLOAD_BYTES: usize = 64 << 20;
const MIN_PASSWORD_LEN: usize = 8;
const MAX_ADMIN_LIMIT: usize = 1000;

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, self.message).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        let status = match e {
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            StoreError::Conflict(_) => StatusCode::CONFLICT,
            StoreError::PlanLimit => StatusCode::PAYMENT_REQUIRED,
        };
        Self::new(status, e.to_string())
    }
}

type ApiResult<T = Json<Value>> = Result<T, ApiError>;

/// Build the router over `state`.
pub fn create_router(state: AppState) -> Router {
    let admin_routes = Router::new()
        .route("/api/admin/users", get(list_users).patch(update_user))
        .route("/api/admin/orgs", get(list_orgs).patch(update_org))
        .route_layer(middleware::from_fn(require_admin));

    let app_routes = Router::new()
        .route("/api/app/me", get(me))
        .route("/api/app/clusters", get(list_clusters).post(create_cluster))
        .route("/api/app/scans", get(list_scans).post(upload_scan))
        .route("/api/app/scan/report", get(scan_report))
        .merge(admin_routes)
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .route("/api/health", get(health))
        .route("/api/auth/register", post(register))
        .route("/api/auth/login", post(login))
        .route("/api/analyze", post(analyze))
        .merge(app_routes)
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(state)
}

/// Serve until the listener fails.
pub async fn serve(listener: TcpListener, state: AppState) -> std::io::Result<()> {
    axum::serve(listener, create_router(state).into_make_service()).await
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterRequest {
    email: String,
    password: String,
    #[serde(default)]
    org_name: String,
}

#[derive(Deserialize)]
struct LoginRequest {
    email: String,
    password: String,
}

fn issue_token(state: &AppState, user: &state::UserRecord) -> ApiResult {
    let token = create_jwt(
        &user.id,
        &user.email,
        user.is_admin,
        &state.config.jwt_secret,
        state.config.token_ttl_secs,
    )
    .map_err(|e| ApiError::internal(format!("token: {e}")))?;
    Ok(Json(json!({ "token": token })))
}

async fn register(State(state): State<AppState>, Json(req): Json<RegisterRequest>) -> ApiResult {
    let email = req.email.trim().to_lowercase();
    if email.is_empty() || req.password.len() < MIN_PASSWORD_LEN {
        return Err(ApiError::bad_request("email required and password >= 8"));
    }
    let org_name = match req.org_name.trim() {
        "" => "My Organization",
        name => name,
    };
    let hash = hash_password(&req.password).map_err(|e| ApiError::internal(e.to_string()))?;
    let is_admin = state.config.admin_emails.contains(&email);
    let user = state.store.create_user(&email, hash, is_admin, org_name)?;
    tracing::info!(user_id = %user.id, is_admin, "user registered");
    issue_token(&state, &user)
}

async fn login(State(state): State<AppState>, Json(req): Json<LoginRequest>) -> ApiResult {
    let email = req.email.trim().to_lowercase();
    let user = state
        .store
        .user_by_email(&email)
        .filter(|u| verify_password(&req.password, &u.password_hash))
        .ok_or_else(|| ApiError::unauthorized("invalid credentials"))?;
    issue_token(&state, &user)
}

async fn me(State(state): State<AppState>, Extension(user): Extension<AuthUser>) -> ApiResult {
    let org = state.store.owner_org(&user.id)?;
    let sub = state.store.subscription(&org);
    Ok(Json(json!({ "userId": user.id, "org": org, "sub": sub })))
}

async fn list_clusters(State(state): State<AppState>, Extension(user): Extension<AuthUser>) -> ApiResult {
    let org = state.store.owner_org(&user.id)?;
    Ok(Json(json!({ "clusters": state.store.list_clusters(&org.id) })))
}

#[derive(Deserialize)]
struct CreateClusterRequest {
    #[serde(default)]
    name: String,
    #[serde(default)]
    notes: String,
}

async fn create_cluster(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<CreateClusterRequest>,
) -> ApiResult {
    let org = state.store.owner_org(&user.id)?;
    let name = req.name.trim();
    if name.is_empty() {
        return Err(ApiError::bad_request("name required"));
    }
    let cluster = state.store.create_cluster(&org, name, &req.notes)?;
    tracing::info!(cluster_id = %cluster.id, org_id = %org.id, "cluster created");
    Ok(Json(json!(cluster)))
}

#[derive(Deserialize)]
struct ScansQuery {
    #[serde(rename = "clusterId", default)]
    cluster_id: String,
}

async fn list_scans(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(q): Query<ScansQuery>,
) -> ApiResult {
    let org = state.store.owner_org(&user.id)?;
    let cluster_id = q.cluster_id.trim();
    if cluster_id.is_empty() {
        return Err(ApiError::bad_request("clusterId required"));
    }
    Ok(Json(json!({ "scans": state.store.list_scans(&org.id, cluster_id) })))
}

/// Text fields and the `rbac` file from a multipart body.
async fn read_upload(mut form: Multipart) -> Result<(HashMap<String, String>, Option<Vec<u8>>), ApiError> {
    let mut fields = HashMap::new();
    let mut file = None;
    while let Some(field) = form
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("failed to parse multipart: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        if name == "rbac" {
            let bytes = field.bytes().await.map_err(|_| ApiError::bad_request("read failed"))?;
            file = Some(bytes.to_vec());
        } else {
            let text = field.text().await.map_err(|_| ApiError::bad_request("read failed"))?;
            fields.insert(name, text);
        }
    }
    Ok((fields, file))
}

async fn upload_scan(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    form: Multipart,
) -> ApiResult {
    let org = state.store.owner_org(&user.id)?;
    let (fields, file) = read_upload(form).await?;
    let cluster_id = fields.get("clusterId").map(|s| s.trim()).unwrap_or_default();
    if cluster_id.is_empty() {
        return Err(ApiError::bad_request("clusterId required"));
    }
    let content = file.ok_or_else(|| ApiError::bad_request("file field 'rbac' required"))?;

    let result = analysis::analyze(&content).map_err(|e| ApiError::bad_request(format!("parse yaml failed: {e}")))?;
    let summary = result.summary();
    let scan = state
        .store
        .create_scan(&org.id, cluster_id, "upload", summary.clone(), result.report())?;
    tracing::info!(scan_id = %scan.id, %cluster_id, subjects = result.subjects.len(), "scan stored");
    Ok(Json(json!({ "scan": scan, "summary": summary })))
}

#[derive(Deserialize)]
struct ReportQuery {
    #[serde(rename = "scanId", default)]
    scan_id: String,
}

async fn scan_report(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(q): Query<ReportQuery>,
) -> ApiResult {
    let scan_id = q.scan_id.trim();
    if scan_id.is_empty() {
        return Err(ApiError::bad_request("scanId required"));
    }
    let org = state.store.owner_org(&user.id)?;
    let (summary, report) = state.store.scan_report(&org.id, scan_id)?;
    Ok(Json(json!({ "summary": summary, "report": report, "ts": chrono::Utc::now() })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeQuery {
    #[serde(default)]
    danger_only: bool,
    #[serde(default)]
    namespace: String,
}

/// Anonymous one-off analysis; nothing is stored.
async fn analyze(Query(q): Query<AnalyzeQuery>, form: Multipart) -> ApiResult {
    let (_, file) = read_upload(form).await?;
    let content = file.ok_or_else(|| ApiError::bad_request("file field 'rbac' required"))?;
    let result = analysis::analyze(&content)
        .map_err(|e| ApiError::bad_request(format!("parse yaml failed: {e}")))?
        .filtered(q.danger_only, &q.namespace);
    Ok(Json(result.report()))
}

#[derive(Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

impl LimitQuery {
    fn value(&self) -> usize {
        self.limit.unwrap_or(200).clamp(1, MAX_ADMIN_LIMIT)
    }
}

async fn list_users(State(state): State<AppState>, Query(q): Query<LimitQuery>) -> ApiResult {
    Ok(Json(json!({ "users": state.store.list_users(q.value()) })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateUserRequest {
    user_id: String,
    is_admin: bool,
}

async fn update_user(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    Json(req): Json<UpdateUserRequest>,
) -> ApiResult {
    if req.user_id == admin.id && !req.is_admin {
        return Err(ApiError::bad_request("cannot revoke admin from yourself"));
    }
    let user = state.store.set_admin(&req.user_id, req.is_admin)?;
    tracing::info!(by = %admin.email, target = %user.id, is_admin = user.is_admin, "admin flag changed");
    Ok(Json(json!(user)))
}

async fn list_orgs(State(state): State<AppState>, Query(q): Query<LimitQuery>) -> ApiResult {
    Ok(Json(json!({ "orgs": state.store.list_orgs(q.value()) })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateOrgRequest {
    org_id: String,
    plan_id: PlanId,
}

async fn update_org(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    Json(req): Json<UpdateOrgRequest>,
) -> ApiResult {
    let org = state.store.set_plan(&req.org_id, req.plan_id)?;
    tracing::info!(by = %admin.email, org_id = %org.id, plan = %org.plan_id, "plan changed");
    Ok(Json(json!(org)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use axum::{body::Body, http::Request};
    use tower::ServiceExt; // For .oneshot() testing

    const SECRET: &str = "router_test_secret";

    fn app() -> Router {
        create_router(AppState::new(ServerConfig {
            jwt_secret: SECRET.to_string(),
            admin_emails: vec!["root@x.io".to_string()],
            ..Default::default()
        }))
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, String) {
        let resp = app.clone().oneshot(req).await.expect("request");
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.expect("body");
        (status, String::from_utf8_lossy(&bytes).into_owned())
    }

    fn json_req(method: &str, uri: &str, token: Option<&str>, body: Value) -> Request<Body> {
        let mut b = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(t) = token {
            b = b.header("authorization", format!("Bearer {t}"));
        }
        b.body(Body::from(body.to_string())).unwrap()
    }

    fn get_req(uri: &str, token: Option<&str>) -> Request<Body> {
        let mut b = Request::builder().method("GET").uri(uri);
        if let Some(t) = token {
            b = b.header("authorization", format!("Bearer {t}"));
        }
        b.body(Body::empty()).unwrap()
    }

    fn multipart_req(uri: &str, token: Option<&str>, fields: &[(&str, &str)], file: &str) -> Request<Body> {
        let boundary = "rbacscan-test-boundary";
        let mut body = String::new();
        for (name, value) in fields {
            body.push_str(&format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            ));
        }
        body.push_str(&format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"rbac\"; filename=\"rbac.yaml\"\r\n\
             Content-Type: application/x-yaml\r\n\r\n{file}\r\n--{boundary}--\r\n"
        ));
        let mut b = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", format!("multipart/form-data; boundary={boundary}"));
        if let Some(t) = token {
            b = b.header("authorization", format!("Bearer {t}"));
        }
        b.body(Body::from(body)).unwrap()
    }

    async fn register(app: &Router, email: &str) -> String {
        let (status, body) = send(
            app,
            json_req(
                "POST",
                "/api/auth/register",
                None,
                json!({"email": email, "password": "password123", "orgName": "acme"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        serde_json::from_str::<Value>(&body).unwrap()["token"]
            .as_str()
            .unwrap()
            .to_string()
    }

    const MANIFEST: &str = "kind: ClusterRole\nmetadata: {name: view}\nrules:\n  - {apiGroups: [\"\"], resources: [services], verbs: [get]}\n---\nkind: ClusterRoleBinding\nmetadata: {name: v}\nsubjects: [{kind: User, name: alice}]\nroleRef: {kind: ClusterRole, name: view}\n";

    #[tokio::test]
    async fn health_and_auth_gate() {
        let app = app();
        assert_eq!(send(&app, get_req("/api/health", None)).await, (StatusCode::OK, "ok".into()));

        let (status, body) = send(&app, get_req("/api/app/clusters", None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body, "missing auth token");

        let (status, _) = send(&app, get_req("/api/app/clusters", Some("a.b.c"))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn login_rejects_bad_password_with_401() {
        let app = app();
        register(&app, "a@x.io").await;
        let (status, body) = send(
            &app,
            json_req("POST", "/api/auth/login", None, json!({"email": "A@x.io", "password": "nope"})),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body, "invalid credentials");

        let (status, _) = send(
            &app,
            json_req("POST", "/api/auth/login", None, json!({"email": "a@x.io", "password": "password123"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn plan_limit_is_402() {
        let app = app();
        let token = register(&app, "a@x.io").await;
        let create = |name: &str| json_req("POST", "/api/app/clusters", Some(token.as_str()), json!({"name": name, "notes": ""}));

        let (status, body) = send(&app, create("prod")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("\"Name\":\"prod\""));

        let (status, body) = send(&app, create("dev")).await;
        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
        assert_eq!(body, "plan limit reached (upgrade required)");
    }

    #[tokio::test]
    async fn admin_is_decided_by_user_record() {
        let app = app();
        let root = register(&app, "root@x.io").await;
        let plain = register(&app, "a@x.io").await;

        // forged claim, valid signature: record still says non-admin
        let claims = crate::credential::decode_claims(&plain).unwrap();
        let forged = create_jwt(&claims.sub, &claims.email, true, SECRET, 60).unwrap();
        let (status, body) = send(&app, get_req("/api/admin/users", Some(forged.as_str()))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body, "admin only");

        let (status, body) = send(&app, get_req("/api/admin/users?limit=1", Some(root.as_str()))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(serde_json::from_str::<Value>(&body).unwrap()["users"].as_array().unwrap().len(), 1);

        let (status, body) = send(
            &app,
            json_req("PATCH", "/api/admin/users", Some(root.as_str()), json!({"userId": claims.sub, "isAdmin": true})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("\"isAdmin\":true"));

        let (status, _) = send(&app, get_req("/api/admin/orgs", Some(plain.as_str()))).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn upload_then_report() {
        let app = app();
        let token = register(&app, "a@x.io").await;
        let (_, body) = send(
            &app,
            json_req("POST", "/api/app/clusters", Some(token.as_str()), json!({"name": "prod"})),
        )
        .await;
        let cluster_id = serde_json::from_str::<Value>(&body).unwrap()["ID"].as_str().unwrap().to_string();

        let (status, body) = send(
            &app,
            multipart_req("/api/app/scans", Some(token.as_str()), &[("clusterId", cluster_id.as_str())], MANIFEST),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        let uploaded: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(uploaded["summary"]["counts"]["subjects"], 1);
        let scan_id = uploaded["scan"]["ID"].as_str().unwrap().to_string();

        let (status, body) = send(
            &app,
            get_req(&format!("/api/app/scan/report?scanId={scan_id}"), Some(token.as_str())),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let report: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(report["report"]["subjects"][0]["subject"], "User:alice");

        let (status, _) = send(
            &app,
            multipart_req("/api/app/scans", Some(token.as_str()), &[("clusterId", "nope")], MANIFEST),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn analyze_is_anonymous_and_filters() {
        let app = app();
        let (status, body) = send(
            &app,
            multipart_req("/api/analyze?dangerOnly=true&namespace=", None, &[], MANIFEST),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        let report: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(report["subjects"].as_array().unwrap().len(), 0);

        let (_, body) = send(&app, multipart_req("/api/analyze", None, &[], MANIFEST)).await;
        let report: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(report["subjects"].as_array().unwrap().len(), 1);

        let (status, body) = send(&app, multipart_req("/api/analyze", None, &[], "kind: [oops")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.starts_with("parse yaml failed"));
    }
}
