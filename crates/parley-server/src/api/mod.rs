//! REST surface and router assembly.

pub mod chat;
pub mod directory;
pub mod groups;
pub mod media;
pub mod notifications;

use axum::{
    extract::{DefaultBodyLimit, State},
    http::Method,
    middleware,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::gateway;
use crate::rate_limit::rate_limit_middleware;
use crate::state::AppState;

/// Default page size for history and list endpoints.
pub(crate) const DEFAULT_PAGE_SIZE: u32 = 50;
pub(crate) const MAX_PAGE_SIZE: u32 = 200;

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    // headroom over the media ceiling for multipart framing
    let body_limit = state.config.max_media_size + 1024 * 1024;

    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(gateway::ws_handler))
        .nest("/api/users", directory::routes())
        .nest("/api/chat", chat::routes())
        .nest("/api/groups", groups::routes())
        .nest("/api/media", media::routes())
        .nest("/api/notifications", notifications::routes())
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    instance: String,
    version: &'static str,
    live_connections: usize,
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        instance: state.config.instance_name.clone(),
        version: env!("CARGO_PKG_VERSION"),
        live_connections: state.registry.connection_count().await,
    })
}

/// Clamp caller-supplied pagination to sane bounds. Pages are 1-based.
pub(crate) fn page_bounds(page: Option<u32>, page_size: Option<u32>) -> (u32, u32, u32) {
    let page = page.unwrap_or(1).max(1);
    let page_size = page_size
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);
    let offset = (page - 1) * page_size;
    (page, page_size, offset)
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_bounds() {
        assert_eq!(page_bounds(None, None), (1, DEFAULT_PAGE_SIZE, 0));
        assert_eq!(page_bounds(Some(0), Some(0)), (1, 1, 0));
        assert_eq!(page_bounds(Some(3), Some(20)), (3, 20, 40));
        assert_eq!(page_bounds(Some(1), Some(10_000)), (1, MAX_PAGE_SIZE, 0));
    }
}
