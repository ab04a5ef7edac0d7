use std::collections::HashMap;

use axum::extract::State;
use axum::Json;

use crate::error::AppError;
use crate::state::AppState;

/// GET /api/policies — the current policy set, version included.
pub async fn get_policies(
    State(app): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let policies = app.pipeline.get_policies();
    Ok(Json(serde_json::to_value(policies.as_ref())?))
}

/// POST /api/policies — partial threshold update, all-or-nothing.
///
/// Unknown keys and out-of-range values reject the whole request; the
/// current set stays untouched.
pub async fn update_policies(
    State(app): State<AppState>,
    Json(partial): Json<HashMap<String, f64>>,
) -> Result<Json<serde_json::Value>, AppError> {
    let updated = app.pipeline.update_policies(&partial)?;
    Ok(Json(serde_json::to_value(updated.as_ref())?))
}
