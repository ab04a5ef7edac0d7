//! Inference-side interface.
//!
//! The model that scores telemetry lives outside this crate. The pipeline
//! only sees `Prediction` snapshots, either pushed in over the API or pulled
//! from something implementing `Predictor`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One scored telemetry snapshot for a single device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prediction {
    pub device: String,
    /// Congestion probability in `[0, 1]`.
    pub congestion_prob: f64,
    /// Hard classifier output (0 or 1).
    #[serde(default)]
    pub congestion_pred: u8,
    /// Whether the anomaly detector flagged this snapshot.
    #[serde(default)]
    pub anomaly: bool,
    /// Raw anomaly score, when the detector exposes one.
    #[serde(default)]
    pub anomaly_score: Option<f64>,
    /// Link utilization in `[0, 1]`.
    #[serde(default)]
    pub utilization: f64,
    #[serde(default)]
    pub latency_ms: f64,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

/// Source of predictions. Implemented by the inference service adapter;
/// fails with `DeviceNotFound` or `ModelUnavailable`.
pub trait Predictor: Send + Sync {
    fn get_prediction(&self, device: &str) -> Result<Prediction>;
}
