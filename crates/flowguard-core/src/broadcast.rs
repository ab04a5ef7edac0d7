//! In-process event fan-out.
//!
//! The hub delivers lifecycle events to a dynamic set of subscribers.
//! Publishing never blocks on a slow consumer: each subscription owns a
//! bounded buffer, overflow drops the oldest buffered event and bumps a
//! per-subscriber drop counter. Delivery is best-effort, not exactly-once.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    PredictionUpdate,
    AutomationUpdate,
    PolicyUpdate,
    SystemAlert,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::PredictionUpdate => "prediction_update",
            EventType::AutomationUpdate => "automation_update",
            EventType::PolicyUpdate => "policy_update",
            EventType::SystemAlert => "system_alert",
        }
    }
}

/// Wire-stable event payload: `{type, device, timestamp, data}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Tagging device, or `None` for global events.
    pub device: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
}

impl Event {
    pub fn new(event_type: EventType, device: Option<String>, data: Value) -> Self {
        Self {
            event_type,
            device,
            timestamp: Utc::now(),
            data,
        }
    }
}

// ---------------------------------------------------------------------------
// Subscriber plumbing
// ---------------------------------------------------------------------------

struct SubscriberState {
    /// Device filter; `None` receives everything.
    filter: Option<String>,
    buffer: Mutex<VecDeque<Event>>,
    notify: Notify,
    dropped: AtomicU64,
    /// Set while the buffer has overflowed and not yet drained empty;
    /// bounds the overload alert to one per episode.
    overloaded: AtomicBool,
    /// Set when the receiver is dropped or force-unsubscribed.
    closed: AtomicBool,
}

impl SubscriberState {
    fn matches(&self, event: &Event) -> bool {
        match (&self.filter, &event.device) {
            (None, _) => true,
            // Untagged events are global and reach everyone.
            (Some(_), None) => true,
            (Some(filter), Some(device)) => filter == device,
        }
    }
}

/// Receiving half of a subscription. Dropping it unsubscribes.
pub struct EventReceiver {
    id: Uuid,
    state: Arc<SubscriberState>,
}

impl EventReceiver {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Next buffered event; `None` once the subscription is closed and the
    /// buffer is drained.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            {
                let mut buffer = self.state.buffer.lock().expect("subscriber lock poisoned");
                if let Some(event) = buffer.pop_front() {
                    if buffer.is_empty() {
                        // Buffer drained: the overload episode (if any) ends.
                        self.state.overloaded.store(false, Ordering::Relaxed);
                    }
                    return Some(event);
                }
            }
            if self.state.closed.load(Ordering::Acquire) {
                return None;
            }
            self.state.notify.notified().await;
        }
    }

    /// Non-blocking variant of `recv`.
    pub fn try_recv(&mut self) -> Option<Event> {
        let mut buffer = self.state.buffer.lock().expect("subscriber lock poisoned");
        let event = buffer.pop_front();
        if buffer.is_empty() {
            self.state.overloaded.store(false, Ordering::Relaxed);
        }
        event
    }

    /// Events dropped on this subscription due to overflow.
    pub fn dropped(&self) -> u64 {
        self.state.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for EventReceiver {
    fn drop(&mut self) {
        self.state.closed.store(true, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// BroadcastHub
// ---------------------------------------------------------------------------

/// Fan-out hub for lifecycle events.
pub struct BroadcastHub {
    subscribers: Mutex<HashMap<Uuid, Arc<SubscriberState>>>,
    capacity: usize,
}

impl BroadcastHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Register a subscription, optionally filtered to one device.
    pub fn subscribe(&self, filter: Option<String>) -> EventReceiver {
        let id = Uuid::new_v4();
        let state = Arc::new(SubscriberState {
            filter,
            buffer: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            overloaded: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        self.subscribers
            .lock()
            .expect("hub lock poisoned")
            .insert(id, state.clone());
        tracing::debug!(subscription = %id, "subscriber added");
        EventReceiver { id, state }
    }

    /// Remove a subscription; idempotent.
    pub fn unsubscribe(&self, id: Uuid) {
        let removed = self
            .subscribers
            .lock()
            .expect("hub lock poisoned")
            .remove(&id);
        if let Some(state) = removed {
            state.closed.store(true, Ordering::Release);
            state.notify.notify_waiters();
            tracing::debug!(subscription = %id, "subscriber removed");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().expect("hub lock poisoned").len()
    }

    /// Deliver an event to every matching live subscription.
    ///
    /// Never blocks the publisher: per-subscriber buffers are bounded and
    /// overflow drops the oldest event. Closed subscriptions found along the
    /// way are reaped. Each overflow episode raises one
    /// `subscriber_overloaded` alert, delivered to everyone except the slow
    /// subscriber itself (its buffer is the problem being reported).
    pub fn publish(&self, event: Event) {
        let overloaded = self.fan_out(&event, None);
        for id in overloaded {
            tracing::warn!(subscription = %id, "subscriber overloaded, dropping oldest events");
            let alert = Event::new(
                EventType::SystemAlert,
                None,
                serde_json::json!({
                    "alert_type": "subscriber_overloaded",
                    "subscription_id": id.to_string(),
                }),
            );
            self.fan_out(&alert, Some(id));
        }
    }

    /// Single delivery pass; returns subscriptions that newly overflowed.
    fn fan_out(&self, event: &Event, skip: Option<Uuid>) -> Vec<Uuid> {
        let mut overloaded_subs: Vec<Uuid> = Vec::new();
        let targets: Vec<(Uuid, Arc<SubscriberState>)> = {
            let mut subs = self.subscribers.lock().expect("hub lock poisoned");
            subs.retain(|_, state| !state.closed.load(Ordering::Acquire));
            subs.iter().map(|(id, s)| (*id, s.clone())).collect()
        };

        for (id, state) in targets {
            if Some(id) == skip || !state.matches(event) {
                continue;
            }
            {
                let mut buffer = state.buffer.lock().expect("subscriber lock poisoned");
                buffer.push_back(event.clone());
                if buffer.len() > self.capacity {
                    buffer.pop_front();
                    state.dropped.fetch_add(1, Ordering::Relaxed);
                    if !state.overloaded.swap(true, Ordering::Relaxed) {
                        overloaded_subs.push(id);
                    }
                }
            }
            state.notify.notify_one();
        }
        overloaded_subs
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
