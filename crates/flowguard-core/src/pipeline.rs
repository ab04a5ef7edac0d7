//! Glue between policy evaluation, the queue, and the event hub.
//!
//! The server and CLI talk to `Pipeline`; it owns no background tasks of
//! its own (the dispatcher is spawned separately against the same queue
//! and hub).

use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

use crate::action::QueuedAction;
use crate::broadcast::{BroadcastHub, Event, EventReceiver, EventType};
use crate::error::Result;
use crate::policy::{evaluate, PolicyHandle, PolicySet};
use crate::prediction::Prediction;
use crate::queue::ActionQueue;

pub struct Pipeline {
    queue: Arc<ActionQueue>,
    policies: PolicyHandle,
    hub: Arc<BroadcastHub>,
}

impl Pipeline {
    pub fn new(queue: Arc<ActionQueue>, policies: PolicyHandle, hub: Arc<BroadcastHub>) -> Self {
        Self {
            queue,
            policies,
            hub,
        }
    }

    pub fn queue(&self) -> &Arc<ActionQueue> {
        &self.queue
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    // -----------------------------------------------------------------------
    // Evaluation
    // -----------------------------------------------------------------------

    /// Run a prediction through the current policy set and enqueue whatever
    /// it triggers. Returns the queue ids of all matched actions, including
    /// ones coalesced into an existing entry.
    pub fn evaluate_and_enqueue(&self, prediction: Prediction) -> Result<Vec<Uuid>> {
        let data = serde_json::to_value(&prediction).unwrap_or(serde_json::Value::Null);
        self.hub.publish(Event::new(
            EventType::PredictionUpdate,
            Some(prediction.device.clone()),
            data,
        ));

        let policies = self.policies.current();
        let candidates = evaluate(&prediction, &policies);
        let mut ids = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let device = candidate.device.clone();
            let action_type = candidate.action_type;
            let (id, created) = self.queue.enqueue(candidate)?;
            ids.push(id);
            if created {
                tracing::info!(%id, %device, %action_type, "action enqueued");
                if let Some(action) = self.queue.get(id)? {
                    self.publish_action(&action);
                }
            } else {
                tracing::debug!(%id, %device, %action_type, "action coalesced");
            }
        }
        Ok(ids)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Pending and in-flight entries in claim order.
    pub fn list_active(&self) -> Result<Vec<QueuedAction>> {
        self.queue.list_active()
    }

    pub fn get_action(&self, id: Uuid) -> Result<Option<QueuedAction>> {
        self.queue.get(id)
    }

    /// Terminal entries, most recent first.
    pub fn history(&self, limit: usize) -> Result<Vec<QueuedAction>> {
        self.queue.history(limit)
    }

    // -----------------------------------------------------------------------
    // Policies
    // -----------------------------------------------------------------------

    pub fn get_policies(&self) -> Arc<PolicySet> {
        self.policies.current()
    }

    /// All-or-nothing partial update; the new set is broadcast on success.
    pub fn update_policies(&self, partial: &HashMap<String, f64>) -> Result<Arc<PolicySet>> {
        let updated = self.policies.update(partial)?;
        tracing::info!(version = updated.version, "policies updated");
        let data = serde_json::to_value(updated.as_ref()).unwrap_or(serde_json::Value::Null);
        self.hub
            .publish(Event::new(EventType::PolicyUpdate, None, data));
        Ok(updated)
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    pub fn subscribe(&self, device: Option<String>) -> EventReceiver {
        self.hub.subscribe(device)
    }

    pub fn unsubscribe(&self, id: Uuid) {
        self.hub.unsubscribe(id);
    }

    fn publish_action(&self, action: &QueuedAction) {
        let data = serde_json::to_value(action).unwrap_or(serde_json::Value::Null);
        self.hub.publish(Event::new(
            EventType::AutomationUpdate,
            Some(action.device.clone()),
            data,
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionStatus, ActionType};
    use crate::config::QueueConfig;
    use chrono::Utc;
    use tempfile::TempDir;

    fn test_pipeline() -> (TempDir, Pipeline) {
        let dir = TempDir::new().unwrap();
        let queue = Arc::new(
            ActionQueue::open(&dir.path().join("queue.db"), QueueConfig::default()).unwrap(),
        );
        let pipeline = Pipeline::new(
            queue,
            PolicyHandle::new(PolicySet::default()),
            Arc::new(BroadcastHub::new(64)),
        );
        (dir, pipeline)
    }

    fn congested(device: &str, prob: f64) -> Prediction {
        Prediction {
            device: device.into(),
            congestion_prob: prob,
            congestion_pred: 1,
            anomaly: false,
            anomaly_score: None,
            utilization: 0.4,
            latency_ms: 12.0,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn evaluation_enqueues_and_publishes() {
        let (_dir, pipeline) = test_pipeline();
        let mut rx = pipeline.subscribe(None);

        let ids = pipeline
            .evaluate_and_enqueue(congested("Router_A", 0.75))
            .unwrap();
        assert_eq!(ids.len(), 1);

        let prediction_event = rx.try_recv().unwrap();
        assert_eq!(prediction_event.event_type, EventType::PredictionUpdate);
        assert_eq!(prediction_event.device.as_deref(), Some("Router_A"));

        let action_event = rx.try_recv().unwrap();
        assert_eq!(action_event.event_type, EventType::AutomationUpdate);
        assert_eq!(action_event.data["status"], "Pending");
        assert_eq!(action_event.data["id"], ids[0].to_string());

        let active = pipeline.list_active().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].action_type, ActionType::CongestionMitigation);
        assert_eq!(active[0].status, ActionStatus::Pending);
    }

    #[test]
    fn duplicate_prediction_coalesces_without_second_update() {
        let (_dir, pipeline) = test_pipeline();
        let first = pipeline
            .evaluate_and_enqueue(congested("Router_A", 0.75))
            .unwrap();

        let mut rx = pipeline.subscribe(None);
        let second = pipeline
            .evaluate_and_enqueue(congested("Router_A", 0.9))
            .unwrap();
        assert_eq!(first, second);

        // Only the prediction broadcast; the coalesced action is silent.
        assert_eq!(
            rx.try_recv().unwrap().event_type,
            EventType::PredictionUpdate
        );
        assert!(rx.try_recv().is_none());
        assert_eq!(pipeline.list_active().unwrap().len(), 1);
    }

    #[test]
    fn quiet_prediction_enqueues_nothing() {
        let (_dir, pipeline) = test_pipeline();
        let ids = pipeline
            .evaluate_and_enqueue(congested("Router_B", 0.1))
            .unwrap();
        assert!(ids.is_empty());
        assert!(pipeline.list_active().unwrap().is_empty());
    }

    #[test]
    fn policy_update_broadcasts_new_set() {
        let (_dir, pipeline) = test_pipeline();
        let mut rx = pipeline.subscribe(None);

        let mut partial = HashMap::new();
        partial.insert("congestion_threshold".to_string(), 0.8);
        let updated = pipeline.update_policies(&partial).unwrap();
        assert_eq!(updated.congestion_threshold, 0.8);
        assert_eq!(updated.version, 2);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.event_type, EventType::PolicyUpdate);
        assert!(event.device.is_none());
        assert_eq!(event.data["congestion_threshold"], 0.8);

        // Raised threshold now suppresses the 0.75 prediction.
        let ids = pipeline
            .evaluate_and_enqueue(congested("Router_A", 0.75))
            .unwrap();
        assert!(ids.is_empty());
    }

    #[test]
    fn rejected_policy_update_changes_nothing() {
        let (_dir, pipeline) = test_pipeline();
        let mut rx = pipeline.subscribe(None);

        let mut partial = HashMap::new();
        partial.insert("congestion_threshold".to_string(), 1.5);
        assert!(pipeline.update_policies(&partial).is_err());
        assert_eq!(pipeline.get_policies().version, 1);
        assert!(rx.try_recv().is_none());
    }
}
