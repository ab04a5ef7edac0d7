//! End-to-end coverage: prediction in, executed action and broadcast out.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use flowguard_core::action::{ActionStatus, ActionType, Outcome, QueuedAction};
use flowguard_core::broadcast::{BroadcastHub, EventType};
use flowguard_core::config::{DispatcherConfig, QueueConfig};
use flowguard_core::dispatch::{ActionDispatcher, ActionExecutor};
use flowguard_core::pipeline::Pipeline;
use flowguard_core::policy::{PolicyHandle, PolicySet};
use flowguard_core::prediction::Prediction;
use flowguard_core::queue::ActionQueue;

struct OkExecutor;

impl ActionExecutor for OkExecutor {
    fn execute(
        &self,
        action: QueuedAction,
    ) -> impl std::future::Future<Output = Outcome> + Send {
        async move {
            Outcome::Success(json!({
                "message": format!("{} applied", action.action_type),
            }))
        }
    }
}

fn harness(dir: &tempfile::TempDir) -> (Arc<ActionQueue>, Arc<BroadcastHub>, Pipeline) {
    let queue = Arc::new(
        ActionQueue::open(&dir.path().join("queue.db"), QueueConfig::default()).unwrap(),
    );
    let hub = Arc::new(BroadcastHub::new(64));
    let pipeline = Pipeline::new(
        queue.clone(),
        PolicyHandle::new(PolicySet::default()),
        hub.clone(),
    );
    (queue, hub, pipeline)
}

fn congested_router_a() -> Prediction {
    Prediction {
        device: "Router_A".into(),
        congestion_prob: 0.75,
        congestion_pred: 1,
        anomaly: false,
        anomaly_score: None,
        utilization: 0.5,
        latency_ms: 20.0,
        timestamp: Utc::now(),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn prediction_to_succeeded_history() {
    let dir = tempfile::TempDir::new().unwrap();
    let (queue, hub, pipeline) = harness(&dir);
    let mut rx = pipeline.subscribe(None);

    let ids = pipeline.evaluate_and_enqueue(congested_router_a()).unwrap();
    assert_eq!(ids.len(), 1);
    let id = ids[0];

    let active = pipeline.list_active().unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].action_type, ActionType::CongestionMitigation);
    // 0.75 is above the threshold but not above the 0.8 severity cut.
    assert_eq!(active[0].parameters["severity"], "medium");

    let dispatcher = ActionDispatcher::spawn(
        queue.clone(),
        hub.clone(),
        Arc::new(OkExecutor),
        DispatcherConfig {
            workers: 2,
            poll_interval_ms: 10,
            ..DispatcherConfig::default()
        },
    );

    // The first terminal automation_update must report success.
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let event = rx.recv().await.unwrap();
            if event.event_type == EventType::AutomationUpdate
                && event.data["status"] != "Pending"
            {
                assert_eq!(event.data["status"], "Succeeded");
                assert_eq!(event.data["id"], id.to_string());
                break;
            }
        }
    })
    .await
    .unwrap();

    dispatcher.shutdown().await.unwrap();

    // And it was the only one.
    while let Some(event) = rx.try_recv() {
        assert!(
            event.event_type != EventType::AutomationUpdate || event.data["status"] == "Pending"
        );
    }

    assert!(pipeline.list_active().unwrap().is_empty());
    let history = pipeline.history(10).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, id);
    assert_eq!(history[0].status, ActionStatus::Succeeded);
    assert_eq!(
        history[0].result.as_ref().unwrap()["message"],
        "congestion_mitigation applied"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn policy_change_takes_effect_for_next_evaluation() {
    let dir = tempfile::TempDir::new().unwrap();
    let (_queue, _hub, pipeline) = harness(&dir);

    let mut partial = HashMap::new();
    partial.insert("congestion_threshold".to_string(), 0.9);
    pipeline.update_policies(&partial).unwrap();

    let ids = pipeline.evaluate_and_enqueue(congested_router_a()).unwrap();
    assert!(ids.is_empty());
}

#[test]
fn concurrent_claims_are_exclusive() {
    let dir = tempfile::TempDir::new().unwrap();
    let queue = Arc::new(
        ActionQueue::open(&dir.path().join("queue.db"), QueueConfig::default()).unwrap(),
    );

    // Three distinct dedup keys, eight racing claimers.
    for action_type in [
        ActionType::CongestionMitigation,
        ActionType::LatencyOptimization,
        ActionType::BandwidthOptimization,
    ] {
        queue
            .enqueue(flowguard_core::action::CandidateAction::new(
                "Router_A",
                action_type,
                serde_json::Map::new(),
                Utc::now(),
            ))
            .unwrap();
    }

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let queue = queue.clone();
            std::thread::spawn(move || queue.claim_next(Utc::now()).unwrap())
        })
        .collect();

    let claimed: Vec<QueuedAction> = handles
        .into_iter()
        .filter_map(|h| h.join().unwrap())
        .collect();

    // Every entry claimed exactly once, never twice.
    assert_eq!(claimed.len(), 3);
    let mut ids: Vec<_> = claimed.iter().map(|a| a.id).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 3);
    assert!(claimed.iter().all(|a| a.status == ActionStatus::InFlight));
}
