//! Background dispatcher: claims ready actions and executes them.
//!
//! A small bounded pool of workers pulls from the queue in priority order,
//! invokes the executor under a timeout, reports the verdict back through
//! `complete`, and publishes the resulting state transition to the hub.
//! Per-action failures never escape a worker; only queue invariant
//! violations are surfaced loudly, and even then the loop continues.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::action::{ActionStatus, Outcome, QueuedAction};
use crate::broadcast::{BroadcastHub, Event, EventType};
use crate::config::DispatcherConfig;
use crate::error::{FlowguardError, Result};
use crate::queue::ActionQueue;

// ---------------------------------------------------------------------------
// ActionExecutor
// ---------------------------------------------------------------------------

/// Boundary to the external automation system.
///
/// Implementations must respect cooperative cancellation: the dispatcher
/// bounds every call with a timeout and maps expiry to a retryable failure.
pub trait ActionExecutor: Send + Sync + 'static {
    fn execute(&self, action: QueuedAction) -> impl Future<Output = Outcome> + Send;
}

// ---------------------------------------------------------------------------
// ActionDispatcher
// ---------------------------------------------------------------------------

/// Handle to the running worker pool.
pub struct ActionDispatcher {
    shutdown_tx: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
    queue: Arc<ActionQueue>,
}

impl ActionDispatcher {
    /// Spawn the worker pool. Workers run until `shutdown` is called.
    pub fn spawn<E: ActionExecutor>(
        queue: Arc<ActionQueue>,
        hub: Arc<BroadcastHub>,
        executor: Arc<E>,
        config: DispatcherConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let workers = (0..config.workers.max(1))
            .map(|idx| {
                let queue = queue.clone();
                let hub = hub.clone();
                let executor = executor.clone();
                let config = config.clone();
                let shutdown = shutdown_rx.clone();
                tokio::spawn(worker_loop(idx, queue, hub, executor, config, shutdown))
            })
            .collect();
        Self {
            shutdown_tx,
            workers,
            queue,
        }
    }

    /// Stop the workers and release any in-flight claims back to Pending.
    ///
    /// Waits for workers to finish their current executor call (bounded by
    /// the executor timeout), then drains. Returns the number of released
    /// claims.
    pub async fn shutdown(self) -> Result<usize> {
        let _ = self.shutdown_tx.send(true);
        for worker in self.workers {
            let _ = worker.await;
        }
        let released = self.queue.release_inflight()?;
        if released > 0 {
            tracing::info!(released, "released in-flight claims on shutdown");
        }
        Ok(released)
    }
}

// ---------------------------------------------------------------------------
// Worker loop
// ---------------------------------------------------------------------------

async fn worker_loop<E: ActionExecutor>(
    idx: usize,
    queue: Arc<ActionQueue>,
    hub: Arc<BroadcastHub>,
    executor: Arc<E>,
    config: DispatcherConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let poll = Duration::from_millis(config.poll_interval_ms.max(1));
    let sweep_every = Duration::from_secs(config.sweep_interval_secs.max(1));
    let exec_timeout = Duration::from_secs(config.executor_timeout_secs.max(1));
    // Seed in the past so the first pass sweeps entries left over from a
    // previous run.
    let mut last_sweep = Instant::now() - sweep_every;

    tracing::debug!(worker = idx, "dispatcher worker started");
    loop {
        if *shutdown.borrow() {
            break;
        }

        // Worker 0 owns the sweep cadence; the others only claim.
        if idx == 0 && last_sweep.elapsed() >= sweep_every {
            sweep_once(&queue, &hub);
            last_sweep = Instant::now();
        }

        let now = Utc::now();
        match queue.claim_next(now) {
            Ok(Some(action)) => {
                execute_one(&queue, &hub, executor.as_ref(), action, exec_timeout).await;
            }
            Ok(None) => {
                let wait = idle_wait(&queue, poll);
                tokio::select! {
                    _ = shutdown.changed() => {}
                    _ = tokio::time::sleep(wait) => {}
                }
            }
            Err(e) => {
                tracing::error!(worker = idx, error = %e, "claim failed");
                tokio::select! {
                    _ = shutdown.changed() => {}
                    _ = tokio::time::sleep(poll) => {}
                }
            }
        }
    }
    tracing::debug!(worker = idx, "dispatcher worker stopped");
}

/// Sleep bound when nothing was claimable: the next poll tick or the
/// earliest `next_eligible_at`, whichever comes sooner.
fn idle_wait(queue: &ActionQueue, poll: Duration) -> Duration {
    let now = Utc::now();
    match queue.next_wake(now) {
        Ok(Some(at)) => {
            let until = (at - now).to_std().unwrap_or(Duration::ZERO);
            until.min(poll)
        }
        Ok(None) => poll,
        Err(e) => {
            tracing::warn!(error = %e, "next_wake query failed");
            poll
        }
    }
}

fn sweep_once(queue: &ActionQueue, hub: &BroadcastHub) {
    match queue.sweep(Utc::now()) {
        Ok(expired) => {
            for action in expired {
                tracing::info!(id = %action.id, device = %action.device, "action expired");
                publish_transition(hub, &action);
                hub.publish(Event::new(
                    EventType::SystemAlert,
                    Some(action.device.clone()),
                    serde_json::json!({
                        "alert_type": "action_expired",
                        "id": action.id.to_string(),
                        "action_type": action.action_type,
                    }),
                ));
            }
        }
        Err(e) => tracing::error!(error = %e, "sweep failed"),
    }
}

async fn execute_one<E: ActionExecutor>(
    queue: &ActionQueue,
    hub: &BroadcastHub,
    executor: &E,
    action: QueuedAction,
    exec_timeout: Duration,
) {
    let id = action.id;
    let device = action.device.clone();
    tracing::info!(
        %id,
        %device,
        action_type = %action.action_type,
        attempt = action.attempts + 1,
        "executing action"
    );

    let outcome = match tokio::time::timeout(exec_timeout, executor.execute(action)).await {
        Ok(outcome) => outcome,
        Err(_) => Outcome::Retryable(format!(
            "executor timed out after {}s",
            exec_timeout.as_secs()
        )),
    };

    match queue.complete(id, outcome) {
        Ok(updated) => {
            publish_transition(hub, &updated);
            match updated.status {
                ActionStatus::Succeeded => {
                    tracing::info!(%id, %device, "action succeeded");
                }
                ActionStatus::Pending => {
                    tracing::warn!(
                        %id,
                        %device,
                        attempts = updated.attempts,
                        error = updated.last_error.as_deref().unwrap_or(""),
                        "action failed, will retry"
                    );
                }
                _ => {
                    tracing::warn!(
                        %id,
                        %device,
                        error = updated.last_error.as_deref().unwrap_or(""),
                        "action failed terminally"
                    );
                    hub.publish(Event::new(
                        EventType::SystemAlert,
                        Some(device.clone()),
                        serde_json::json!({
                            "alert_type": "action_failed",
                            "id": id.to_string(),
                            "message": updated.last_error,
                        }),
                    ));
                }
            }
        }
        Err(FlowguardError::InvariantViolation(detail)) => {
            // Locking defect in claim bookkeeping. The queue has already
            // forced the entry to a safe terminal state; make noise and keep
            // the loop alive for everything else.
            tracing::error!(%id, %device, detail, "queue invariant violated");
            hub.publish(Event::new(
                EventType::SystemAlert,
                Some(device),
                serde_json::json!({
                    "alert_type": "invariant_violation",
                    "id": id.to_string(),
                    "message": detail,
                }),
            ));
        }
        Err(e) => {
            tracing::error!(%id, %device, error = %e, "failed to record action outcome");
        }
    }
}

/// One `automation_update` per state transition, whatever the outcome.
fn publish_transition(hub: &BroadcastHub, action: &QueuedAction) {
    let data = serde_json::to_value(action).unwrap_or(serde_json::Value::Null);
    hub.publish(Event::new(
        EventType::AutomationUpdate,
        Some(action.device.clone()),
        data,
    ));
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
