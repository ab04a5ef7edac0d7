use axum::extract::State;
use axum::Json;
use flowguard_core::prediction::Prediction;

use crate::error::AppError;
use crate::state::AppState;

/// POST /api/predict/evaluate — run a prediction through the policy engine
/// and enqueue whatever it triggers.
///
/// Returns the queue ids of all matched actions, including ones coalesced
/// into an already-pending entry.
pub async fn evaluate(
    State(app): State<AppState>,
    Json(prediction): Json<Prediction>,
) -> Result<Json<serde_json::Value>, AppError> {
    let pipeline = app.pipeline.clone();
    let device = prediction.device.clone();
    let ids = tokio::task::spawn_blocking(move || pipeline.evaluate_and_enqueue(prediction))
        .await
        .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;

    Ok(Json(serde_json::json!({
        "device": device,
        "queued": ids,
    })))
}
