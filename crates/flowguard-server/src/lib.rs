pub mod error;
pub mod routes;
pub mod state;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use flowguard_core::pipeline::Pipeline;
use tower_http::cors::{Any, CorsLayer};

/// Build the axum Router with all API routes and middleware.
/// Used by `serve()` and available for integration testing.
pub fn build_router(pipeline: Arc<Pipeline>) -> Router {
    let app_state = state::AppState::new(pipeline);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Events (SSE)
        .route("/api/events", get(routes::events::sse_events))
        // Predictions
        .route("/api/predict/evaluate", post(routes::predict::evaluate))
        // Actions
        .route("/api/actions", get(routes::actions::list_actions))
        .route("/api/actions/pending", get(routes::actions::list_pending))
        .route("/api/actions/{id}", get(routes::actions::get_action))
        // Policies
        .route("/api/policies", get(routes::policies::get_policies))
        .route("/api/policies", post(routes::policies::update_policies))
        .layer(cors)
        .with_state(app_state)
}

/// Start the API server on the given port.
pub async fn serve(pipeline: Arc<Pipeline>, port: u16) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    serve_on(pipeline, listener).await
}

/// Start the API server on a pre-bound listener.
///
/// Accepts a `TcpListener` that was already bound so the caller can read the
/// actual port before starting (useful when `port = 0` and the OS picks a
/// free port).
pub async fn serve_on(
    pipeline: Arc<Pipeline>,
    listener: tokio::net::TcpListener,
) -> anyhow::Result<()> {
    let actual_port = listener.local_addr()?.port();
    let app = build_router(pipeline);

    tracing::info!("flowguard API listening on http://localhost:{actual_port}");

    axum::serve(listener, app).await?;
    Ok(())
}
