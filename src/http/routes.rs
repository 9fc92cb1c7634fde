//! HTTP route definitions

use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json},
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{error, warn};

use crate::app::AppState;
use crate::error::MatchError;
use crate::game::model::{Player, VoteResult};
use crate::lobby::FuelAction;
use crate::util::time::uptime_secs;
use crate::ws::handler::ws_handler;
use crate::ws::protocol::{
    CreateMatchResponse, EliminationEvent, FuelActionResponse, LobbyView, RoleView, VoteAck,
    VoteStart,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Build the application router
pub fn build_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/session", post(register_handler))
        .route("/session/:username", delete(logout_handler))
        .route("/match/create", post(create_match_handler))
        .route("/match/join", post(join_match_handler))
        .route("/match/start/:code", post(start_match_handler))
        .route("/match/:code", get(get_match_handler))
        .route("/match/:code/role", get(role_handler))
        .route("/match/:code/vote/result", get(vote_result_handler))
        .route("/match/:code/startVote", post(start_vote_handler))
        .route("/match/:code/vote", post(vote_handler))
        .route("/match/:code/eliminate", post(eliminate_handler))
        .route("/match/:code/fuel", post(fuel_handler));

    let cors = cors_layer(&state.config.client_origin);

    Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(ws_handler))
        .nest("/api", api_routes)
        .layer(CompressionLayer::new())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// `*` allows any origin without credentials; otherwise a comma-separated
/// allow-list with credentials
fn cors_layer(client_origin: &str) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);

    if client_origin.trim() == "*" {
        return cors.allow_origin(Any);
    }

    let allowed_origins: Vec<HeaderValue> = client_origin
        .split(',')
        .filter_map(|s| s.trim().parse::<HeaderValue>().ok())
        .collect();

    cors.allow_origin(allowed_origins).allow_credentials(true)
}

// ============================================================================
// Health endpoint
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    instance_id: String,
    running_matches: usize,
    scheduled_tasks: usize,
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: uptime_secs(),
        instance_id: state.config.instance_id.clone(),
        running_matches: state.engine.running_matches(),
        scheduled_tasks: state.scheduler.len(),
    })
}

// ============================================================================
// Session endpoints
// ============================================================================

#[derive(Deserialize)]
struct SessionRequest {
    username: String,
}

async fn register_handler(
    State(state): State<AppState>,
    Json(req): Json<SessionRequest>,
) -> Result<(StatusCode, Json<Player>), AppError> {
    let player = state.service.register(&req.username).await?;
    Ok((StatusCode::CREATED, Json(player)))
}

async fn logout_handler(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<StatusCode, AppError> {
    state.service.logout(&username).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Lobby endpoints
// ============================================================================

#[derive(Deserialize)]
struct CreateMatchRequest {
    host_name: String,
}

#[derive(Deserialize)]
struct JoinMatchRequest {
    code: String,
    username: String,
}

#[derive(Deserialize)]
struct HostQuery {
    host_name: String,
}

#[derive(Deserialize)]
struct UsernameQuery {
    username: String,
}

async fn create_match_handler(
    State(state): State<AppState>,
    Json(req): Json<CreateMatchRequest>,
) -> Result<Json<CreateMatchResponse>, AppError> {
    let lobby = state.service.create_match(&req.host_name).await?;
    Ok(Json(CreateMatchResponse { code: lobby.code }))
}

async fn join_match_handler(
    State(state): State<AppState>,
    Json(req): Json<JoinMatchRequest>,
) -> Result<Json<LobbyView>, AppError> {
    Ok(Json(state.service.join_match(&req.code, &req.username).await?))
}

async fn start_match_handler(
    State(state): State<AppState>,
    Path(code): Path<String>,
    Query(query): Query<HostQuery>,
) -> Result<Json<LobbyView>, AppError> {
    Ok(Json(state.service.start_match(&code, &query.host_name).await?))
}

async fn get_match_handler(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<LobbyView>, AppError> {
    Ok(Json(state.service.get_match(&code).await?))
}

async fn role_handler(
    State(state): State<AppState>,
    Path(code): Path<String>,
    Query(query): Query<UsernameQuery>,
) -> Result<Json<RoleView>, AppError> {
    Ok(Json(state.service.role(&code, &query.username).await?))
}

// ============================================================================
// Voting endpoints
// ============================================================================

#[derive(Deserialize)]
struct TargetRequest {
    username: String,
    target_id: i64,
}

async fn vote_result_handler(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<VoteResult>, AppError> {
    Ok(Json(state.service.last_vote_result(&code).await?))
}

async fn start_vote_handler(
    State(state): State<AppState>,
    Path(code): Path<String>,
    Query(query): Query<UsernameQuery>,
) -> Result<Json<VoteStart>, AppError> {
    let player = state.service.resolve_player(&query.username).await?;
    Ok(Json(state.votes.start_vote(&code, &player.username).await?))
}

async fn vote_handler(
    State(state): State<AppState>,
    Path(code): Path<String>,
    Json(req): Json<TargetRequest>,
) -> Result<Json<VoteAck>, AppError> {
    let player = state.service.resolve_player(&req.username).await?;
    let ack = state
        .votes
        .submit_ballot(&code, &player.username, req.target_id)
        .await?;
    Ok(Json(ack))
}

// ============================================================================
// Action endpoints
// ============================================================================

#[derive(Deserialize)]
struct FuelRequest {
    username: String,
    action: FuelAction,
    #[serde(default)]
    amount: Option<f64>,
}

async fn eliminate_handler(
    State(state): State<AppState>,
    Path(code): Path<String>,
    Json(req): Json<TargetRequest>,
) -> Result<Json<EliminationEvent>, AppError> {
    let player = state.service.resolve_player(&req.username).await?;
    let event = state
        .service
        .eliminate(&code, &player.username, req.target_id)
        .await?;
    Ok(Json(event))
}

async fn fuel_handler(
    State(state): State<AppState>,
    Path(code): Path<String>,
    Json(req): Json<FuelRequest>,
) -> Result<Json<FuelActionResponse>, AppError> {
    let player = state.service.resolve_player(&req.username).await?;
    let response = state
        .service
        .adjust_fuel(&code, &player.username, req.action, req.amount)
        .await?;
    Ok(Json(response))
}

// ============================================================================
// Error handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct AppError(#[from] MatchError);

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match &self.0 {
            MatchError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            MatchError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg.clone()),
            MatchError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            MatchError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            MatchError::Locked(msg) => (StatusCode::LOCKED, msg.clone()),
            MatchError::LockTimeout { code } => {
                warn!(code = %code, "Request gave up waiting for the match lock");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "The match is busy, try again".to_string(),
                )
            }
            MatchError::Store(e) => {
                error!(error = %e, "Store failure while serving request");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        let body = serde_json::json!({
            "error": message
        });

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::test_support::node;
    use crate::store::MemoryBackend;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::ServiceExt;

    async fn call(state: &AppState, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .unwrap();

        let response = build_router(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn health_reports_instance() {
        let state = node(Arc::new(MemoryBackend::new())).await;
        let (status, body) = call(&state, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["instance_id"], state.config.instance_id.as_str());
        assert_eq!(body["running_matches"], 0);
    }

    #[tokio::test]
    async fn duplicate_session_is_a_conflict() {
        let state = node(Arc::new(MemoryBackend::new())).await;
        let (status, body) = call(&state, Method::POST, "/api/session", Some(json!({ "username": "ana" }))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["username"], "ana");

        let (status, body) = call(&state, Method::POST, "/api/session", Some(json!({ "username": "ana" }))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].is_string());

        let (status, _) = call(&state, Method::DELETE, "/api/session/ana", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = call(&state, Method::DELETE, "/api/session/ana", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn lobby_flow_over_http() {
        let state = node(Arc::new(MemoryBackend::new())).await;
        for name in ["p1", "p2", "p3", "p4", "p5"] {
            let (status, _) = call(&state, Method::POST, "/api/session", Some(json!({ "username": name }))).await;
            assert_eq!(status, StatusCode::CREATED);
        }

        let (status, body) =
            call(&state, Method::POST, "/api/match/create", Some(json!({ "host_name": "p1" }))).await;
        assert_eq!(status, StatusCode::OK);
        let code = body["code"].as_str().unwrap().to_string();
        assert_eq!(code.len(), 6);

        for name in ["p2", "p3", "p4", "p5"] {
            let (status, _) = call(
                &state,
                Method::POST,
                "/api/match/join",
                Some(json!({ "code": code, "username": name })),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
        }

        let (status, _) = call(&state, Method::POST, &format!("/api/match/start/{}?host_name=p2", code), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = call(&state, Method::POST, &format!("/api/match/start/{}?host_name=p1", code), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "STARTED");

        let (status, body) = call(&state, Method::GET, &format!("/api/match/{}/role?username=p3", code), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["username"], "p3");

        let (status, _) = call(&state, Method::GET, &format!("/api/match/{}/vote/result", code), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        state.engine.stop_ticker(&code);
    }

    #[tokio::test]
    async fn unknown_codes() {
        let state = node(Arc::new(MemoryBackend::new())).await;
        let (status, _) = call(&state, Method::POST, "/api/session", Some(json!({ "username": "ana" }))).await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, _) = call(&state, Method::GET, "/api/match/ZZZZZZ", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(
            &state,
            Method::POST,
            "/api/match/join",
            Some(json!({ "code": "ZZZZZZ", "username": "ana" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            &state,
            Method::POST,
            "/api/match/ZZZZZZ/fuel",
            Some(json!({ "username": "nobody", "action": "fill" })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[test]
    fn wildcard_and_listed_origins_both_build() {
        let _ = cors_layer("*");
        let _ = cors_layer("http://localhost:5173, https://shipwreck.example");
    }
}
