use std::sync::Arc;

use axum::{
    extract::{Path, Query, Request, State},
    http::{HeaderMap, Method, StatusCode},
    middleware::{self, Next},
    response::Response,
    routing::{delete, get, post, put},
    Json, Router,
};
use rolesync_engine::{
    ChatRights, Operation, PassReport, PersonStatus, Registration, RoleUpdate, SweepReport,
    SyncEngine, TriggerReport,
};
use rolesync_shared::{ChatId, Decision, PersonId, RequestId, RoleId};
use rolesync_store::{
    Alert, AuditQuery, AuditRecord, AuditStats, Chat, NewChat, NewPerson, Role, Statistics,
};
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::ServerConfig;
use crate::error::ServerError;

#[derive(Clone)]
pub struct AppState {
    pub engine: SyncEngine,
    pub config: Arc<ServerConfig>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);

    let admin = Router::new()
        .route("/requests", post(register))
        .route("/requests/:id/decision", post(decide_request))
        .route("/persons/:id/role", post(reassign_role))
        .route("/persons/:id/terminate", post(terminate))
        .route("/persons/:id/reconcile", post(reconcile))
        .route("/persons/:id/status", get(person_status))
        .route("/persons/:id/plan", get(person_plan))
        .route("/roles", get(list_roles).post(create_role))
        .route("/roles/:id", delete(delete_role))
        .route("/roles/:id/chats", put(set_role_chats))
        .route("/chats", get(list_chats).post(register_chat))
        .route("/chats/refresh-rights", post(refresh_rights))
        .route("/sweep", post(sweep))
        .route("/audit", get(audit_list))
        .route("/audit/stats", get(audit_stats))
        .route("/alerts", get(alerts))
        .route("/stats", get(stats))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin));

    Router::new()
        .route("/health", get(health_check))
        .nest("/api", admin)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Deserialize)]
struct DecisionBody {
    outcome: Decision,
    role_id: Option<RoleId>,
}

#[derive(Deserialize)]
struct RoleBody {
    role_id: RoleId,
}

#[derive(Deserialize)]
struct NewRoleBody {
    name: String,
    description: Option<String>,
}

#[derive(Deserialize)]
struct RoleChatsBody {
    chat_ids: Vec<ChatId>,
}

#[derive(Deserialize, Default)]
struct ReconcileBody {
    #[serde(default)]
    verify: bool,
}

#[derive(Serialize)]
struct AuditPage {
    total: u64,
    records: Vec<AuditRecord>,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

fn verify_admin_token(headers: &HeaderMap, config: &ServerConfig) -> Result<(), ServerError> {
    let Some(ref expected) = config.admin_token else {
        return Err(ServerError::Forbidden(
            "Admin API is disabled (no ADMIN_TOKEN configured)".into(),
        ));
    };

    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let token = auth.strip_prefix("Bearer ").unwrap_or(auth);

    use subtle::ConstantTimeEq;
    let token_bytes = token.as_bytes();
    let expected_bytes = expected.as_bytes();
    if token_bytes.len() != expected_bytes.len()
        || token_bytes.ct_eq(expected_bytes).unwrap_u8() != 1
    {
        return Err(ServerError::Forbidden("Invalid admin token".into()));
    }

    Ok(())
}

async fn require_admin(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ServerError> {
    verify_admin_token(request.headers(), &state.config)?;
    Ok(next.run(request).await)
}

// ---------------------------------------------------------------------------
// Lifecycle triggers
// ---------------------------------------------------------------------------

async fn register(
    State(state): State<AppState>,
    Json(new): Json<NewPerson>,
) -> Result<(StatusCode, Json<Registration>), ServerError> {
    let registration = state.engine.register(new).await?;
    let status = if registration.created {
        info!(person = %registration.person.id, request = %registration.request.id, "Registration received");
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(registration)))
}

async fn decide_request(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<DecisionBody>,
) -> Result<Json<TriggerReport>, ServerError> {
    let report = state
        .engine
        .decide_request(RequestId(id), body.outcome, body.role_id)
        .await?;
    info!(request = id, outcome = ?body.outcome, "Request decided");
    Ok(Json(report))
}

async fn reassign_role(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<RoleBody>,
) -> Result<Json<TriggerReport>, ServerError> {
    let report = state
        .engine
        .reassign_role(PersonId(id), body.role_id)
        .await?;
    info!(person = id, role = %body.role_id, "Role reassigned");
    Ok(Json(report))
}

async fn terminate(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<TriggerReport>, ServerError> {
    let report = state.engine.terminate(PersonId(id)).await?;
    info!(person = id, "Termination requested");
    Ok(Json(report))
}

async fn reconcile(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    body: Option<Json<ReconcileBody>>,
) -> Result<Json<PassReport>, ServerError> {
    let Json(body) = body.unwrap_or_default();
    let report = state
        .engine
        .reconcile_person(PersonId(id), body.verify)
        .await?;
    Ok(Json(report))
}

// ---------------------------------------------------------------------------
// Roles and chats
// ---------------------------------------------------------------------------

async fn create_role(
    State(state): State<AppState>,
    Json(body): Json<NewRoleBody>,
) -> Result<(StatusCode, Json<Role>), ServerError> {
    let name = body.name.trim();
    if name.is_empty() {
        return Err(ServerError::BadRequest("Role name must not be empty".into()));
    }
    let role = state
        .engine
        .create_role(name, body.description.as_deref())
        .await?;
    info!(role = %role.id, name = %role.name, "Role created");
    Ok((StatusCode::CREATED, Json(role)))
}

async fn list_roles(State(state): State<AppState>) -> Result<Json<Vec<Role>>, ServerError> {
    Ok(Json(state.engine.list_roles().await?))
}

async fn set_role_chats(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<RoleChatsBody>,
) -> Result<Json<RoleUpdate>, ServerError> {
    let update = state
        .engine
        .set_role_chats(RoleId(id), &body.chat_ids)
        .await?;
    info!(role = id, chats = update.chats.len(), holders = update.passes.persons, "Role chats set");
    Ok(Json(update))
}

async fn delete_role(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<RoleUpdate>, ServerError> {
    let update = state.engine.delete_role(RoleId(id)).await?;
    info!(role = id, holders = update.passes.persons, "Role deleted");
    Ok(Json(update))
}

async fn register_chat(
    State(state): State<AppState>,
    Json(new): Json<NewChat>,
) -> Result<(StatusCode, Json<ChatRights>), ServerError> {
    let rights = state.engine.register_chat(new).await?;
    info!(chat = %rights.chat, external = %rights.external_id, "Chat registered");
    Ok((StatusCode::CREATED, Json(rights)))
}

async fn list_chats(State(state): State<AppState>) -> Result<Json<Vec<Chat>>, ServerError> {
    Ok(Json(state.engine.list_chats().await?))
}

// ---------------------------------------------------------------------------
// Queries and maintenance
// ---------------------------------------------------------------------------

async fn person_status(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<PersonStatus>, ServerError> {
    Ok(Json(state.engine.status(PersonId(id)).await?))
}

async fn person_plan(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Vec<Operation>>, ServerError> {
    Ok(Json(state.engine.plan(PersonId(id)).await?))
}

async fn refresh_rights(
    State(state): State<AppState>,
) -> Result<Json<Vec<ChatRights>>, ServerError> {
    Ok(Json(state.engine.refresh_chat_rights().await?))
}

async fn sweep(State(state): State<AppState>) -> Result<Json<SweepReport>, ServerError> {
    Ok(Json(state.engine.sweep().await?))
}

async fn audit_list(
    State(state): State<AppState>,
    Query(query): Query<AuditQuery>,
) -> Result<Json<AuditPage>, ServerError> {
    let db = state.engine.database().lock().await;
    let total = db.count_audit(&query)?;
    let records = db.list_audit(&query)?;
    Ok(Json(AuditPage { total, records }))
}

async fn audit_stats(State(state): State<AppState>) -> Result<Json<AuditStats>, ServerError> {
    let db = state.engine.database().lock().await;
    Ok(Json(db.audit_stats()?))
}

async fn alerts(State(state): State<AppState>) -> Result<Json<Vec<Alert>>, ServerError> {
    let db = state.engine.database().lock().await;
    Ok(Json(db.open_alerts()?))
}

async fn stats(State(state): State<AppState>) -> Result<Json<Statistics>, ServerError> {
    let db = state.engine.database().lock().await;
    Ok(Json(db.statistics()?))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}
