//! Process-wide event fan-out hub.
//!
//! Every subscriber gets its own bounded queue; publishing is best-effort and
//! never blocks. When a subscriber's queue is full the event is dropped for
//! that subscriber only; a slow SSE client must not wedge the scheduler.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use serde::Serialize;
use tokio::sync::mpsc;

/// Per-subscriber queue capacity.
pub const SUBSCRIBER_BUFFER: usize = 256;

/// Control-plane events published by the daemon itself. Agent runtime events
/// carry their own `type` discriminator and flow through `publish_json`
/// directly.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlEvent {
    Connected,
    TaskUpdate {
        team: String,
        task_id: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        status: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        assignee: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        current_stage: Option<String>,
    },
    TeamUpdate {
        #[serde(skip_serializing_if = "Option::is_none")]
        team: Option<String>,
    },
    NetworkUpdate,
    Message {
        team: String,
        from: String,
        to: String,
    },
}

impl ControlEvent {
    pub fn task_update(team: &str, task_id: i64) -> Self {
        Self::TaskUpdate {
            team: team.to_string(),
            task_id,
            status: None,
            assignee: None,
            current_stage: None,
        }
    }

    pub fn with_status(mut self, s: &str) -> Self {
        if let Self::TaskUpdate { status, .. } = &mut self {
            *status = Some(s.to_string());
        }
        self
    }

    pub fn with_assignee(mut self, a: &str) -> Self {
        if let Self::TaskUpdate { assignee, .. } = &mut self {
            *assignee = Some(a.to_string());
        }
        self
    }

    pub fn with_stage(mut self, stage: &str) -> Self {
        if let Self::TaskUpdate { current_stage, .. } = &mut self {
            *current_stage = Some(stage.to_string());
        }
        self
    }
}

/// A live subscription: drop-safe receiver plus the id used to unsubscribe.
pub struct Subscription {
    pub id: u64,
    pub rx: mpsc::Receiver<String>,
}

#[derive(Default)]
pub struct EventHub {
    next_id: AtomicU64,
    subs: RwLock<HashMap<u64, mpsc::Sender<String>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber. A `connected` event is queued synchronously so
    /// listeners can confirm the stream is live before anything else arrives.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let _ = tx.try_send(r#"{"type":"connected"}"#.to_string());
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);
        Subscription { id, rx }
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }

    /// Broadcast a serializable event to every subscriber. Full queues drop
    /// the event for that subscriber; closed queues are skipped (the SSE
    /// handler unsubscribes on disconnect).
    pub fn publish_json<T: Serialize>(&self, event: &T) {
        let payload = match serde_json::to_string(event) {
            Ok(p) => p,
            Err(_) => return,
        };
        let subs = self.subs.read().unwrap_or_else(|e| e.into_inner());
        for tx in subs.values() {
            let _ = tx.try_send(payload.clone());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subs.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connected_event_is_delivered_first() {
        let hub = EventHub::new();
        let mut sub = hub.subscribe();
        hub.publish_json(&ControlEvent::NetworkUpdate);

        let first = sub.rx.recv().await.unwrap();
        assert!(first.contains("\"connected\""));
        let second = sub.rx.recv().await.unwrap();
        assert!(second.contains("\"network_update\""));
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_without_blocking_publisher() {
        let hub = EventHub::new();
        let mut slow = hub.subscribe();
        let mut fast = hub.subscribe();

        // Saturate both queues well past capacity; publish must return
        // immediately every time.
        for i in 0..SUBSCRIBER_BUFFER + 50 {
            hub.publish_json(&ControlEvent::task_update("t", i as i64));
        }

        // The slow subscriber got exactly its buffer's worth (connected
        // included); the overflow was dropped for it.
        let mut received = 0;
        while slow.rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, SUBSCRIBER_BUFFER);

        // The other subscriber was unaffected by the first one's overflow.
        let first = fast.rx.recv().await.unwrap();
        assert!(first.contains("\"connected\""));
    }

    #[tokio::test]
    async fn test_dropped_subscriber_does_not_break_publish() {
        let hub = EventHub::new();
        let sub = hub.subscribe();
        drop(sub.rx);
        hub.publish_json(&ControlEvent::NetworkUpdate);

        hub.unsubscribe(sub.id);
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[test]
    fn test_task_update_serialization_omits_empty_fields() {
        let ev = ControlEvent::task_update("t1", 7).with_status("in_progress");
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("\"type\":\"task_update\""));
        assert!(json.contains("\"status\":\"in_progress\""));
        assert!(!json.contains("assignee"));
        assert!(!json.contains("current_stage"));
    }
}
