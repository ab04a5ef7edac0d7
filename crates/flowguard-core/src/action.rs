//! Action data model.
//!
//! A `CandidateAction` is what policy evaluation proposes; a `QueuedAction`
//! is a candidate that made it into the durable queue and carries lifecycle
//! state. The queue owns every status transition — the dispatcher only goes
//! through `claim_next` / `complete`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// ActionType
// ---------------------------------------------------------------------------

/// Kind of remediation dispatched to the automation system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    CongestionMitigation,
    BandwidthOptimization,
    LatencyOptimization,
    AnomalyInvestigation,
}

impl ActionType {
    /// Default priority; lower is more urgent.
    pub fn priority(self) -> u8 {
        match self {
            ActionType::AnomalyInvestigation => 1,
            ActionType::CongestionMitigation => 2,
            ActionType::BandwidthOptimization | ActionType::LatencyOptimization => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ActionType::CongestionMitigation => "congestion_mitigation",
            ActionType::BandwidthOptimization => "bandwidth_optimization",
            ActionType::LatencyOptimization => "latency_optimization",
            ActionType::AnomalyInvestigation => "anomaly_investigation",
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ActionStatus
// ---------------------------------------------------------------------------

/// Lifecycle state of a queued action.
///
/// Transitions: `Pending → InFlight → Succeeded | Failed`, with
/// `InFlight → Pending` on a retryable failure below the attempt cap and
/// `Pending → Expired` when the TTL sweep catches a stale entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionStatus {
    Pending,
    InFlight,
    Succeeded,
    Failed,
    Expired,
}

impl ActionStatus {
    /// Active entries hold the dedup slot and live in the claim ordering.
    pub fn is_active(self) -> bool {
        matches!(self, ActionStatus::Pending | ActionStatus::InFlight)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }
}

// ---------------------------------------------------------------------------
// CandidateAction
// ---------------------------------------------------------------------------

/// An action proposed by policy evaluation, not yet queued.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateAction {
    pub device: String,
    pub action_type: ActionType,
    pub parameters: Map<String, Value>,
    /// Lower = more urgent. Defaults from the action type.
    pub priority: u8,
    pub triggered_at: DateTime<Utc>,
}

impl CandidateAction {
    pub fn new(
        device: impl Into<String>,
        action_type: ActionType,
        parameters: Map<String, Value>,
        triggered_at: DateTime<Utc>,
    ) -> Self {
        Self {
            device: device.into(),
            action_type,
            parameters,
            priority: action_type.priority(),
            triggered_at,
        }
    }

    /// `(device, action_type)` pair preventing duplicate outstanding actions.
    pub fn dedup_key(&self) -> String {
        dedup_key(&self.device, self.action_type)
    }
}

/// Dedup key encoding shared by candidates and queued entries. The unit
/// separator cannot appear in device names coming off the telemetry feed.
pub fn dedup_key(device: &str, action_type: ActionType) -> String {
    format!("{device}\x1f{}", action_type.as_str())
}

// ---------------------------------------------------------------------------
// QueuedAction
// ---------------------------------------------------------------------------

/// A candidate action plus queue lifecycle state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedAction {
    pub id: Uuid,
    pub device: String,
    pub action_type: ActionType,
    pub parameters: Map<String, Value>,
    pub priority: u8,
    pub triggered_at: DateTime<Utc>,
    /// Claim-order tiebreaker after (priority, triggered_at).
    pub sequence: u64,
    pub status: ActionStatus,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Earliest instant this entry may be claimed (moves forward on retry backoff).
    pub next_eligible_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Executor-reported result payload for succeeded actions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl QueuedAction {
    pub fn from_candidate(candidate: CandidateAction, id: Uuid, sequence: u64) -> Self {
        let triggered_at = candidate.triggered_at;
        Self {
            id,
            device: candidate.device,
            action_type: candidate.action_type,
            parameters: candidate.parameters,
            priority: candidate.priority,
            triggered_at,
            sequence,
            status: ActionStatus::Pending,
            attempts: 0,
            last_error: None,
            next_eligible_at: triggered_at,
            claimed_at: None,
            completed_at: None,
            result: None,
        }
    }

    pub fn dedup_key(&self) -> String {
        dedup_key(&self.device, self.action_type)
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Dispatcher verdict reported back to the queue via `complete`.
#[derive(Debug, Clone)]
pub enum Outcome {
    Success(Value),
    /// Transient infrastructure failure — retried with backoff up to the
    /// attempt cap.
    Retryable(String),
    /// Semantic rejection from the executor — terminal immediately.
    Fatal(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_type_serializes_snake_case() {
        let json = serde_json::to_string(&ActionType::CongestionMitigation).unwrap();
        assert_eq!(json, "\"congestion_mitigation\"");
    }

    #[test]
    fn status_serializes_pascal_case() {
        // Downstream event consumers match on these exact strings.
        let json = serde_json::to_string(&ActionStatus::Succeeded).unwrap();
        assert_eq!(json, "\"Succeeded\"");
        let json = serde_json::to_string(&ActionStatus::InFlight).unwrap();
        assert_eq!(json, "\"InFlight\"");
    }

    #[test]
    fn default_priorities_rank_anomaly_first() {
        assert!(ActionType::AnomalyInvestigation.priority() < ActionType::CongestionMitigation.priority());
        assert!(ActionType::CongestionMitigation.priority() < ActionType::BandwidthOptimization.priority());
        assert_eq!(
            ActionType::BandwidthOptimization.priority(),
            ActionType::LatencyOptimization.priority()
        );
    }

    #[test]
    fn dedup_key_distinguishes_type_and_device() {
        let a = dedup_key("Router_A", ActionType::CongestionMitigation);
        let b = dedup_key("Router_A", ActionType::BandwidthOptimization);
        let c = dedup_key("Router_B", ActionType::CongestionMitigation);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn queued_action_starts_pending_and_eligible() {
        let now = Utc::now();
        let cand = CandidateAction::new(
            "Router_A",
            ActionType::CongestionMitigation,
            Map::new(),
            now,
        );
        let queued = QueuedAction::from_candidate(cand, Uuid::new_v4(), 7);
        assert_eq!(queued.status, ActionStatus::Pending);
        assert_eq!(queued.attempts, 0);
        assert_eq!(queued.next_eligible_at, now);
        assert_eq!(queued.sequence, 7);
    }
}
