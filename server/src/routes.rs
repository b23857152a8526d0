use std::time::Instant;

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::{self, Next},
    response::Response,
    routing::get,
    Router,
};

use crate::state::AppState;
use crate::storage::routes as download;

/// One `access` event per request. Only the path is logged; the query
/// carries the download signature.
async fn access_log(State(state): State<AppState>, req: Request<Body>, next: Next) -> Response {
    if !state.access_log {
        return next.run(req).await;
    }

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let started = Instant::now();

    let resp = next.run(req).await;

    tracing::info!(
        target: "access",
        method = %method,
        path = %path,
        status = resp.status().as_u16(),
        duration_ms = started.elapsed().as_millis() as u64,
        "request"
    );
    resp
}

/// Build the full axum Router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let download_routes = Router::new()
        .route("/download/{hash}", get(download::download))
        .route("/download/", get(download::missing_hash))
        .route("/download", get(download::missing_hash));

    let health = Router::new().route("/health", get(health_check));

    Router::new()
        .merge(download_routes)
        .merge(health)
        .layer(middleware::from_fn_with_state(state.clone(), access_log))
        .with_state(state)
}

/// Basic health check endpoint
async fn health_check() -> &'static str {
    "ok"
}
