use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;
use uuid::Uuid;

const CHANNEL_CAPACITY: usize = 64;

/// Per-session push channel for timer syncs, warnings, and answer events.
/// Entirely optional: publishing to a session nobody listens to is a
/// no-op, and every read path can reconstruct state from the session row,
/// so HTTP-polling clients lose nothing.
pub struct RealtimeService {
    channels: Mutex<HashMap<Uuid, broadcast::Sender<JsonValue>>>,
}

impl RealtimeService {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self, session_id: Uuid) -> broadcast::Receiver<JsonValue> {
        let mut guard = self.channels.lock().expect("realtime mutex poisoned");
        guard
            .entry(session_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    pub fn publish(&self, session_id: Uuid, event: JsonValue) {
        let mut guard = self.channels.lock().expect("realtime mutex poisoned");
        if let Some(sender) = guard.get(&session_id) {
            if sender.receiver_count() == 0 {
                guard.remove(&session_id);
            } else if let Err(e) = sender.send(event) {
                tracing::debug!(%session_id, error = ?e, "realtime send failed");
            }
        }
    }

    pub fn drop_channel(&self, session_id: Uuid) {
        self.channels
            .lock()
            .expect("realtime mutex poisoned")
            .remove(&session_id);
    }
}

impl Default for RealtimeService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let svc = RealtimeService::new();
        let id = Uuid::new_v4();
        let mut rx = svc.subscribe(id);
        svc.publish(id, json!({"event": "time_warning", "seconds_left": 60}));
        let got = rx.recv().await.unwrap();
        assert_eq!(got["seconds_left"], 60);
    }

    #[test]
    fn publish_without_subscribers_is_a_noop() {
        let svc = RealtimeService::new();
        svc.publish(Uuid::new_v4(), json!({"event": "sync"}));
    }
}
