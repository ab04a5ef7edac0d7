//! Automation policies and the pure evaluator.
//!
//! A `PolicySet` is an immutable, versioned snapshot of the named numeric
//! thresholds. Updates never mutate in place: `apply` validates the whole
//! partial map and produces a new snapshot, which `PolicyHandle` swaps in
//! atomically. Readers either see the old set or the new one, never a mix.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::action::{ActionType, CandidateAction};
use crate::error::{FlowguardError, Result};
use crate::prediction::Prediction;

// ---------------------------------------------------------------------------
// PolicySet
// ---------------------------------------------------------------------------

/// Immutable snapshot of automation thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicySet {
    #[serde(default = "default_congestion_threshold")]
    pub congestion_threshold: f64,
    #[serde(default = "default_anomaly_threshold")]
    pub anomaly_threshold: f64,
    #[serde(default = "default_high_utilization_threshold")]
    pub high_utilization_threshold: f64,
    /// Milliseconds; must be positive.
    #[serde(default = "default_latency_threshold")]
    pub latency_threshold: f64,
    /// Bumped on every successful update; the initial set is version 1.
    #[serde(default = "default_version")]
    pub version: u64,
}

fn default_version() -> u64 {
    1
}

fn default_congestion_threshold() -> f64 {
    0.6
}

fn default_anomaly_threshold() -> f64 {
    0.7
}

fn default_high_utilization_threshold() -> f64 {
    0.85
}

fn default_latency_threshold() -> f64 {
    45.0
}

impl Default for PolicySet {
    fn default() -> Self {
        Self {
            congestion_threshold: default_congestion_threshold(),
            anomaly_threshold: default_anomaly_threshold(),
            high_utilization_threshold: default_high_utilization_threshold(),
            latency_threshold: default_latency_threshold(),
            version: default_version(),
        }
    }
}

impl PolicySet {
    /// Produce a new snapshot with the given keys changed.
    ///
    /// All-or-nothing: any unknown key or out-of-range value rejects the
    /// whole update and leaves the prior snapshot untouched.
    pub fn apply(&self, partial: &HashMap<String, f64>) -> Result<PolicySet> {
        let mut next = self.clone();
        for (key, &value) in partial {
            match key.as_str() {
                "congestion_threshold" => {
                    validate_probability(key, value)?;
                    next.congestion_threshold = value;
                }
                "anomaly_threshold" => {
                    validate_probability(key, value)?;
                    next.anomaly_threshold = value;
                }
                "high_utilization_threshold" => {
                    validate_probability(key, value)?;
                    next.high_utilization_threshold = value;
                }
                "latency_threshold" => {
                    if value <= 0.0 || !value.is_finite() {
                        return Err(FlowguardError::InvalidPolicyValue {
                            key: key.clone(),
                            value,
                            reason: "must be a positive number of milliseconds".into(),
                        });
                    }
                    next.latency_threshold = value;
                }
                _ => return Err(FlowguardError::InvalidPolicyKey(key.clone())),
            }
        }
        next.version = self.version + 1;
        Ok(next)
    }
}

fn validate_probability(key: &str, value: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&value) || !value.is_finite() {
        return Err(FlowguardError::InvalidPolicyValue {
            key: key.to_string(),
            value,
            reason: "must be within [0, 1]".into(),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// PolicyHandle
// ---------------------------------------------------------------------------

/// Single-writer, multi-reader holder of the current policy snapshot.
#[derive(Debug, Clone)]
pub struct PolicyHandle {
    inner: Arc<RwLock<Arc<PolicySet>>>,
}

impl PolicyHandle {
    pub fn new(set: PolicySet) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(set))),
        }
    }

    /// Cheap clone of the current snapshot.
    pub fn current(&self) -> Arc<PolicySet> {
        self.inner.read().expect("policy lock poisoned").clone()
    }

    /// Validate and atomically swap in a new snapshot; returns it on success.
    pub fn update(&self, partial: &HashMap<String, f64>) -> Result<Arc<PolicySet>> {
        let mut guard = self.inner.write().expect("policy lock poisoned");
        let next = Arc::new(guard.apply(partial)?);
        *guard = next.clone();
        Ok(next)
    }
}

impl Default for PolicyHandle {
    fn default() -> Self {
        Self::new(PolicySet::default())
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Map a prediction to zero-or-more candidate actions.
///
/// Pure and stateless: the rules are independent, so a single prediction can
/// fire several candidates at once.
pub fn evaluate(prediction: &Prediction, policies: &PolicySet) -> Vec<CandidateAction> {
    let mut candidates = Vec::new();
    let ts = prediction.timestamp;

    if prediction.congestion_prob > policies.congestion_threshold {
        let severity = if prediction.congestion_prob > 0.8 {
            "high"
        } else {
            "medium"
        };
        let mut params = Map::new();
        params.insert(
            "congestion_probability".into(),
            json_f64(prediction.congestion_prob),
        );
        params.insert("severity".into(), Value::String(severity.into()));
        candidates.push(CandidateAction::new(
            &prediction.device,
            ActionType::CongestionMitigation,
            params,
            ts,
        ));
    }

    if prediction.utilization > policies.high_utilization_threshold {
        let mut params = Map::new();
        params.insert("utilization".into(), json_f64(prediction.utilization));
        candidates.push(CandidateAction::new(
            &prediction.device,
            ActionType::BandwidthOptimization,
            params,
            ts,
        ));
    }

    if prediction.latency_ms > policies.latency_threshold {
        let mut params = Map::new();
        params.insert("latency_ms".into(), json_f64(prediction.latency_ms));
        candidates.push(CandidateAction::new(
            &prediction.device,
            ActionType::LatencyOptimization,
            params,
            ts,
        ));
    }

    if prediction.anomaly {
        let mut params = Map::new();
        if let Some(score) = prediction.anomaly_score {
            params.insert("anomaly_score".into(), json_f64(score));
        }
        candidates.push(CandidateAction::new(
            &prediction.device,
            ActionType::AnomalyInvestigation,
            params,
            ts,
        ));
    }

    candidates
}

fn json_f64(v: f64) -> Value {
    serde_json::Number::from_f64(v)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn prediction(device: &str) -> Prediction {
        Prediction {
            device: device.to_string(),
            congestion_prob: 0.0,
            congestion_pred: 0,
            anomaly: false,
            anomaly_score: None,
            utilization: 0.0,
            latency_ms: 0.0,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn defaults_match_shipped_model_metadata() {
        let p = PolicySet::default();
        assert_eq!(p.congestion_threshold, 0.6);
        assert_eq!(p.high_utilization_threshold, 0.85);
        assert_eq!(p.latency_threshold, 45.0);
        assert_eq!(p.version, 1);
    }

    #[test]
    fn congestion_above_threshold_fires_exactly_one_mitigation() {
        let policies = PolicySet::default();
        let mut pred = prediction("Router_A");
        pred.congestion_prob = 0.75;

        let candidates = evaluate(&pred, &policies);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].action_type, ActionType::CongestionMitigation);
        assert_eq!(candidates[0].parameters["severity"], "medium");
        assert_eq!(candidates[0].priority, 2);
    }

    #[test]
    fn congestion_at_or_below_threshold_fires_nothing() {
        let policies = PolicySet::default();
        let mut pred = prediction("Router_A");
        pred.congestion_prob = 0.6; // threshold is strict

        assert!(evaluate(&pred, &policies).is_empty());
    }

    #[test]
    fn severity_high_above_point_eight() {
        let policies = PolicySet::default();
        let mut pred = prediction("Router_A");
        pred.congestion_prob = 0.92;

        let candidates = evaluate(&pred, &policies);
        assert_eq!(candidates[0].parameters["severity"], "high");
    }

    #[test]
    fn independent_rules_can_all_fire() {
        let policies = PolicySet::default();
        let mut pred = prediction("Router_B");
        pred.congestion_prob = 0.9;
        pred.utilization = 0.95;
        pred.latency_ms = 80.0;
        pred.anomaly = true;
        pred.anomaly_score = Some(0.88);

        let candidates = evaluate(&pred, &policies);
        assert_eq!(candidates.len(), 4);
        let anomaly = candidates
            .iter()
            .find(|c| c.action_type == ActionType::AnomalyInvestigation)
            .unwrap();
        assert_eq!(anomaly.priority, 1);
        assert!(anomaly.parameters.contains_key("anomaly_score"));
    }

    #[test]
    fn anomaly_without_score_omits_parameter() {
        let policies = PolicySet::default();
        let mut pred = prediction("Router_C");
        pred.anomaly = true;

        let candidates = evaluate(&pred, &policies);
        assert_eq!(candidates.len(), 1);
        assert!(!candidates[0].parameters.contains_key("anomaly_score"));
    }

    #[test]
    fn apply_updates_single_field_and_bumps_version() {
        let base = PolicySet::default();
        let mut partial = HashMap::new();
        partial.insert("congestion_threshold".to_string(), 0.5);

        let next = base.apply(&partial).unwrap();
        assert_eq!(next.congestion_threshold, 0.5);
        assert_eq!(next.anomaly_threshold, base.anomaly_threshold);
        assert_eq!(next.high_utilization_threshold, base.high_utilization_threshold);
        assert_eq!(next.latency_threshold, base.latency_threshold);
        assert_eq!(next.version, 2);
    }

    #[test]
    fn apply_rejects_unknown_key() {
        let base = PolicySet::default();
        let mut partial = HashMap::new();
        partial.insert("bogus_threshold".to_string(), 0.5);

        let err = base.apply(&partial).unwrap_err();
        assert!(matches!(err, FlowguardError::InvalidPolicyKey(k) if k == "bogus_threshold"));
    }

    #[test]
    fn apply_rejects_out_of_range_probability() {
        let base = PolicySet::default();
        let mut partial = HashMap::new();
        partial.insert("congestion_threshold".to_string(), 1.5);

        assert!(matches!(
            base.apply(&partial),
            Err(FlowguardError::InvalidPolicyValue { .. })
        ));
    }

    #[test]
    fn apply_rejects_nonpositive_latency() {
        let base = PolicySet::default();
        let mut partial = HashMap::new();
        partial.insert("latency_threshold".to_string(), 0.0);

        assert!(matches!(
            base.apply(&partial),
            Err(FlowguardError::InvalidPolicyValue { .. })
        ));
    }

    #[test]
    fn apply_is_all_or_nothing() {
        let base = PolicySet::default();
        let mut partial = HashMap::new();
        partial.insert("congestion_threshold".to_string(), 0.4);
        partial.insert("nope".to_string(), 0.1);

        assert!(base.apply(&partial).is_err());
        // Prior snapshot untouched
        assert_eq!(base.congestion_threshold, 0.6);
    }

    #[test]
    fn handle_update_swaps_snapshot_atomically() {
        let handle = PolicyHandle::default();
        let before = handle.current();

        let mut partial = HashMap::new();
        partial.insert("congestion_threshold".to_string(), 0.5);
        let after = handle.update(&partial).unwrap();

        assert_eq!(before.congestion_threshold, 0.6);
        assert_eq!(after.congestion_threshold, 0.5);
        assert_eq!(handle.current().congestion_threshold, 0.5);
        assert_eq!(after.version, before.version + 1);
    }

    #[test]
    fn handle_failed_update_keeps_prior_snapshot() {
        let handle = PolicyHandle::default();
        let mut partial = HashMap::new();
        partial.insert("unknown".to_string(), 0.5);

        assert!(handle.update(&partial).is_err());
        assert_eq!(*handle.current(), PolicySet::default());
    }
}
