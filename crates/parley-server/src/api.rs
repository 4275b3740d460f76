//! Admin HTTP API.
//!
//! `/health` and `/info` are open. Everything under `/admin` requires the
//! configured bearer token and is disabled entirely when none is set.

use std::net::IpAddr;
use std::sync::Arc;

use axum::{
    extract::State,
    http::HeaderMap,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tower_http::trace::TraceLayer;
use tracing::info;

use parley_shared::constants::PROTOCOL_VERSION;
use parley_shared::InstanceId;

use crate::context::{ServerContext, ServerStats};
use crate::error::ServerError;
use crate::rooms::SessionInfo;

pub type AppState = Arc<ServerContext>;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/info", get(server_info))
        .route("/admin/status", get(admin_status))
        .route("/admin/sessions", get(admin_sessions))
        .route("/admin/kick", post(admin_kick))
        .route(
            "/admin/blacklist",
            get(blacklist_list)
                .post(blacklist_add)
                .delete(blacklist_remove),
        )
        .route("/admin/shutdown", post(admin_shutdown))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct ServerInfoResponse {
    name: String,
    version: &'static str,
    protocol: &'static str,
    max_connections: usize,
    max_transfer_bytes: u64,
}

#[derive(Serialize)]
struct AdminStatusResponse {
    name: String,
    sessions: usize,
    rooms: usize,
    blacklisted: usize,
    shutting_down: bool,
    #[serde(flatten)]
    stats: ServerStats,
}

#[derive(Deserialize)]
struct KickRequest {
    instance_id: u64,
}

#[derive(Deserialize)]
struct AddressRequest {
    address: String,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn server_info(State(state): State<AppState>) -> Json<ServerInfoResponse> {
    Json(ServerInfoResponse {
        name: state.config.server_name.clone(),
        version: env!("CARGO_PKG_VERSION"),
        protocol: PROTOCOL_VERSION,
        max_connections: state.config.max_connections,
        max_transfer_bytes: state.config.max_transfer_bytes,
    })
}

fn verify_admin_token(headers: &HeaderMap, state: &ServerContext) -> Result<(), ServerError> {
    let Some(ref expected) = state.config.admin_token else {
        return Err(ServerError::Forbidden(
            "Admin API is disabled (no PARLEY_ADMIN_TOKEN configured)".into(),
        ));
    };

    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let token = auth.strip_prefix("Bearer ").unwrap_or(auth).as_bytes();

    let expected = expected.as_bytes();
    if token.len() != expected.len() || token.ct_eq(expected).unwrap_u8() != 1 {
        return Err(ServerError::Forbidden("Invalid admin token".into()));
    }
    Ok(())
}

async fn admin_status(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<AdminStatusResponse>, ServerError> {
    verify_admin_token(&headers, &state)?;

    Ok(Json(AdminStatusResponse {
        name: state.config.server_name.clone(),
        sessions: state.registry.session_count().await,
        rooms: state.registry.room_count().await,
        blacklisted: state.blacklist.len(),
        shutting_down: state.is_shutting_down(),
        stats: state.stats(),
    }))
}

async fn admin_sessions(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<Vec<SessionInfo>>, ServerError> {
    verify_admin_token(&headers, &state)?;
    Ok(Json(state.registry.list_sessions().await))
}

async fn admin_kick(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<KickRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    verify_admin_token(&headers, &state)?;

    let id = InstanceId(req.instance_id);
    if !state.kick(id).await {
        return Err(ServerError::NotFound(format!("no session {id}")));
    }
    info!(instance = %id, "Admin kicked session");
    Ok(Json(serde_json::json!({ "kicked": req.instance_id })))
}

fn parse_address(raw: &str) -> Result<IpAddr, ServerError> {
    raw.trim()
        .parse()
        .map_err(|_| ServerError::BadRequest(format!("invalid IP address: {raw}")))
}

async fn blacklist_list(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<Vec<String>>, ServerError> {
    verify_admin_token(&headers, &state)?;
    let addresses = state.blacklist.list().iter().map(IpAddr::to_string).collect();
    Ok(Json(addresses))
}

async fn blacklist_add(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<AddressRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    verify_admin_token(&headers, &state)?;

    let ip = parse_address(&req.address)?;
    let disconnected = state.blacklist_address(ip).await?;
    info!(%ip, disconnected, "Admin blacklisted address");
    Ok(Json(serde_json::json!({
        "blacklisted": ip.to_string(),
        "disconnected": disconnected,
    })))
}

async fn blacklist_remove(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<AddressRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    verify_admin_token(&headers, &state)?;

    let ip = parse_address(&req.address)?;
    if !state.unblacklist_address(ip).await? {
        return Err(ServerError::NotFound(format!("{ip} is not blacklisted")));
    }
    info!(%ip, "Admin removed address from blacklist");
    Ok(Json(serde_json::json!({ "removed": ip.to_string() })))
}

async fn admin_shutdown(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ServerError> {
    verify_admin_token(&headers, &state)?;

    info!("Admin requested shutdown");
    state.shutdown().await;
    Ok(Json(serde_json::json!({ "shutting_down": true })))
}

/// Serve the admin API until the context shuts down.
pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let mut shutdown = state.shutdown_signal();
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stopping| *stopping).await;
        })
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tempfile::TempDir;
    use tower::ServiceExt;

    use crate::config::ServerConfig;

    fn state(dir: &TempDir, token: Option<&str>) -> AppState {
        let config = ServerConfig {
            admin_token: token.map(str::to_string),
            credentials_path: dir.path().join("accounts.db"),
            blacklist_path: dir.path().join("blacklist.txt"),
            ..ServerConfig::default()
        };
        Arc::new(ServerContext::open(config).unwrap())
    }

    fn request(method: &str, uri: &str, token: Option<&str>, body: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn json(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_is_open() {
        let dir = TempDir::new().unwrap();
        let app = build_router(state(&dir, None));
        let response = app
            .oneshot(request("GET", "/health", None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_admin_disabled_without_token() {
        let dir = TempDir::new().unwrap();
        let app = build_router(state(&dir, None));
        let response = app
            .oneshot(request("GET", "/admin/status", Some("anything"), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_wrong_token_rejected() {
        let dir = TempDir::new().unwrap();
        let app = build_router(state(&dir, Some("s3cret")));
        let response = app
            .oneshot(request("GET", "/admin/status", Some("s3crex"), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_status_reports_counts() {
        let dir = TempDir::new().unwrap();
        let app = build_router(state(&dir, Some("s3cret")));
        let response = app
            .oneshot(request("GET", "/admin/status", Some("s3cret"), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json(response).await;
        assert_eq!(body["sessions"], 0);
        assert_eq!(body["rooms"], 1);
        assert_eq!(body["accepted"], 0);
    }

    #[tokio::test]
    async fn test_blacklist_roundtrip() {
        let dir = TempDir::new().unwrap();
        let state = state(&dir, Some("s3cret"));
        let app = build_router(state.clone());

        let added = app
            .clone()
            .oneshot(request(
                "POST",
                "/admin/blacklist",
                Some("s3cret"),
                Some(r#"{"address":"198.51.100.4"}"#),
            ))
            .await
            .unwrap();
        assert_eq!(added.status(), StatusCode::OK);
        assert!(state.is_blacklisted(&"198.51.100.4".parse().unwrap()));

        let listed = app
            .clone()
            .oneshot(request("GET", "/admin/blacklist", Some("s3cret"), None))
            .await
            .unwrap();
        assert_eq!(json(listed).await, serde_json::json!(["198.51.100.4"]));

        let removed = app
            .clone()
            .oneshot(request(
                "DELETE",
                "/admin/blacklist",
                Some("s3cret"),
                Some(r#"{"address":"198.51.100.4"}"#),
            ))
            .await
            .unwrap();
        assert_eq!(removed.status(), StatusCode::OK);

        let missing = app
            .oneshot(request(
                "DELETE",
                "/admin/blacklist",
                Some("s3cret"),
                Some(r#"{"address":"198.51.100.4"}"#),
            ))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_bad_address_rejected() {
        let dir = TempDir::new().unwrap();
        let app = build_router(state(&dir, Some("s3cret")));
        let response = app
            .oneshot(request(
                "POST",
                "/admin/blacklist",
                Some("s3cret"),
                Some(r#"{"address":"not-an-ip"}"#),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_kick_unknown_session() {
        let dir = TempDir::new().unwrap();
        let app = build_router(state(&dir, Some("s3cret")));
        let response = app
            .oneshot(request(
                "POST",
                "/admin/kick",
                Some("s3cret"),
                Some(r#"{"instance_id":42}"#),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_shutdown_sets_flag() {
        let dir = TempDir::new().unwrap();
        let state = state(&dir, Some("s3cret"));
        let app = build_router(state.clone());
        let response = app
            .oneshot(request("POST", "/admin/shutdown", Some("s3cret"), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(state.is_shutting_down());
    }
}
