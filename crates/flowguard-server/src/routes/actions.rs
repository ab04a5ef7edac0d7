use axum::extract::{Path, Query, State};
use axum::Json;
use flowguard_core::FlowguardError;
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

#[derive(serde::Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_history_limit")]
    pub limit: usize,
    /// Restrict both lists to one device.
    pub device: Option<String>,
}

fn default_history_limit() -> usize {
    50
}

/// GET /api/actions — active entries plus recent terminal history.
pub async fn list_actions(
    State(app): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let pipeline = app.pipeline.clone();
    let result = tokio::task::spawn_blocking(move || {
        let mut active = pipeline.list_active()?;
        let mut history = pipeline.history(query.limit)?;
        if let Some(device) = &query.device {
            active.retain(|a| &a.device == device);
            history.retain(|a| &a.device == device);
        }
        Ok::<_, FlowguardError>(serde_json::json!({
            "active": active,
            "history": history,
        }))
    })
    .await
    .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;

    Ok(Json(result))
}

/// GET /api/actions/pending — active entries only, in claim order.
pub async fn list_pending(
    State(app): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let pipeline = app.pipeline.clone();
    let active = tokio::task::spawn_blocking(move || pipeline.list_active())
        .await
        .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;

    Ok(Json(serde_json::json!({ "active": active })))
}

/// GET /api/actions/:id — one entry, active or historical.
pub async fn get_action(
    State(app): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    let pipeline = app.pipeline.clone();
    let action = tokio::task::spawn_blocking(move || pipeline.get_action(id))
        .await
        .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??
        .ok_or(FlowguardError::ActionNotFound(id))?;

    Ok(Json(serde_json::to_value(&action)?))
}
