//! Admin routes for inspecting and editing the visit ledger
//!
//! Every route requires `Authorization: Bearer <ADMIN_TOKEN>`. These bypass
//! the ban engine and never evaluate the threshold.

use crate::routes::AppState;
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use visitgate_core::{normalize_address, VisitRecord};

/// Build the admin router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/admin/ip/{ip}", get(get_ip))
        .route("/admin/banned", get(list_banned))
        .route("/admin/unban/{ip}", post(unban_ip))
        .route("/admin/ban/{ip}", post(ban_ip))
}

/// Validate admin token from the Authorization header
fn validate_admin(state: &AppState, headers: &HeaderMap) -> bool {
    let Some(admin_token) = state.config.admin_token.as_deref() else {
        return false;
    };

    headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(|t| t == admin_token)
        .unwrap_or(false)
}

fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, "Unauthorized").into_response()
}

fn storage_error(e: impl std::fmt::Display) -> Response {
    tracing::error!("Admin ledger operation failed: {}", e);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": "Internal server error" })),
    )
        .into_response()
}

#[derive(Serialize)]
struct IpStats {
    ip: String,
    stats: Option<VisitRecord>,
}

#[derive(Serialize)]
struct BannedList {
    count: usize,
    records: Vec<VisitRecord>,
}

#[derive(Serialize)]
struct ActionResult {
    success: bool,
    message: String,
}

async fn get_ip(State(state): State<AppState>, headers: HeaderMap, Path(ip): Path<String>) -> Response {
    if !validate_admin(&state, &headers) {
        return unauthorized();
    }

    let ip = normalize_address(&ip);
    match state.engine.store().find_by_address(&ip).await {
        Ok(stats) => Json(IpStats { ip, stats }).into_response(),
        Err(e) => storage_error(e),
    }
}

async fn list_banned(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if !validate_admin(&state, &headers) {
        return unauthorized();
    }

    match state.engine.store().list_banned().await {
        Ok(records) => Json(BannedList {
            count: records.len(),
            records,
        })
        .into_response(),
        Err(e) => storage_error(e),
    }
}

async fn unban_ip(State(state): State<AppState>, headers: HeaderMap, Path(ip): Path<String>) -> Response {
    set_banned(state, headers, ip, false).await
}

async fn ban_ip(State(state): State<AppState>, headers: HeaderMap, Path(ip): Path<String>) -> Response {
    set_banned(state, headers, ip, true).await
}

async fn set_banned(state: AppState, headers: HeaderMap, ip: String, banned: bool) -> Response {
    if !validate_admin(&state, &headers) {
        return unauthorized();
    }

    let ip = normalize_address(&ip);
    let action = if banned { "banned" } else { "unbanned" };

    match state.engine.store().set_banned(&ip, banned, Utc::now()).await {
        Ok(Some(_)) => {
            tracing::info!("Admin {} IP {}", action, ip);
            Json(ActionResult {
                success: true,
                message: format!("IP {} has been {}", ip, action),
            })
            .into_response()
        }
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ActionResult {
                success: false,
                message: format!("IP {} not found", ip),
            }),
        )
            .into_response(),
        Err(e) => storage_error(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::{router, test_state};
    use axum::{body::Body, http::Request};
    use std::sync::Arc;
    use tower::ServiceExt;
    use visitgate_core::{MemoryVisitStore, VisitStore};

    const TOKEN: &str = "test-admin-token";

    fn app(store: Arc<MemoryVisitStore>) -> Router {
        router().with_state(test_state("http://127.0.0.1:9", &[("ADMIN_TOKEN", TOKEN)], store))
    }

    fn request(method: &str, uri: &str, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("Authorization", format!("Bearer {}", token));
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_requires_token() {
        let store = Arc::new(MemoryVisitStore::new());

        let response = app(store.clone())
            .oneshot(request("GET", "/admin/banned", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app(store.clone())
            .oneshot(request("GET", "/admin/banned", Some("wrong")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_no_configured_token_rejects_everything() {
        let store = Arc::new(MemoryVisitStore::new());
        let app = router().with_state(test_state("http://127.0.0.1:9", &[], store));

        let response = app.oneshot(request("GET", "/admin/banned", Some(""))).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_ip_lookup() {
        let store = Arc::new(MemoryVisitStore::new());
        store.create_address("203.0.113.9", "Mozilla/5.0", Utc::now()).await.unwrap();

        let response = app(store.clone())
            .oneshot(request("GET", "/admin/ip/203.0.113.9", Some(TOKEN)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["ip"], "203.0.113.9");
        assert_eq!(body["stats"]["visit_count"], 1);

        let response = app(store)
            .oneshot(request("GET", "/admin/ip/198.51.100.1", Some(TOKEN)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(json_body(response).await["stats"].is_null());
    }

    #[tokio::test]
    async fn test_ban_unban_and_list() {
        let store = Arc::new(MemoryVisitStore::new());
        store.create_address("203.0.113.9", "Mozilla/5.0", Utc::now()).await.unwrap();

        let response = app(store.clone())
            .oneshot(request("POST", "/admin/ban/203.0.113.9", Some(TOKEN)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app(store.clone())
            .oneshot(request("GET", "/admin/banned", Some(TOKEN)))
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["records"][0]["address"], "203.0.113.9");

        let response = app(store.clone())
            .oneshot(request("POST", "/admin/unban/203.0.113.9", Some(TOKEN)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["success"], true);

        let record = store.find_by_address("203.0.113.9").await.unwrap().unwrap();
        assert!(!record.is_banned);
        assert!(record.banned_at.is_none());
        assert_eq!(record.visit_count, 1);
    }

    #[tokio::test]
    async fn test_unban_unknown_is_404() {
        let store = Arc::new(MemoryVisitStore::new());

        let response = app(store.clone())
            .oneshot(request("POST", "/admin/unban/192.0.2.44", Some(TOKEN)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(response).await["success"], false);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_path_address_is_normalised() {
        let store = Arc::new(MemoryVisitStore::new());
        store.create_address("192.0.2.7", "Mozilla/5.0", Utc::now()).await.unwrap();

        let response = app(store)
            .oneshot(request("GET", "/admin/ip/::ffff:192.0.2.7", Some(TOKEN)))
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body["ip"], "192.0.2.7");
        assert_eq!(body["stats"]["address"], "192.0.2.7");
    }
}
