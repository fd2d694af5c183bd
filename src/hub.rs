use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::events::GameEvent;
use crate::registry::{GameRecord, MatchKey};

/// Outstanding frames a single websocket client may fall behind by before
/// it is dropped.
const CLIENT_QUEUE_CAP: usize = 64;

/// Everything mutating tracker state publishes one of these onto the bus;
/// the publisher worker turns them into websocket frames, snapshot writes
/// and archive handoffs.
#[derive(Debug)]
pub enum Notice {
    /// First confirmation of a match.
    GameNew(MatchKey),
    GameUpdate(MatchKey),
    /// The record left the registry; carries the final state for archival.
    GameRemoved(Box<GameRecord>),
    GameEvent {
        key: MatchKey,
        event: GameEvent,
    },
    /// The local watcher saw its gamelog shrink.
    GamelogReset,
    /// Poll tick: rewrite the snapshot even without a mutation.
    SnapshotDirty,
}

#[derive(Debug, Clone, Serialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
}

impl Frame {
    pub fn new(kind: &str, data: Value) -> Self {
        Self {
            kind: kind.to_owned(),
            data,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_owned())
    }
}

/// Fan-out point for websocket subscribers. Each client gets a bounded
/// queue; a slow or gone client is dropped rather than ever blocking the
/// publisher.
#[derive(Debug, Default)]
pub struct BroadcastHub {
    clients: DashMap<u64, mpsc::Sender<String>>,
    next_id: AtomicU64,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> (u64, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE_CAP);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.clients.insert(id, tx);
        (id, rx)
    }

    pub fn unsubscribe(&self, id: u64) {
        self.clients.remove(&id);
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn broadcast(&self, frame: &Frame) {
        if self.clients.is_empty() {
            return;
        }
        let payload = frame.to_json();
        let mut dropped = Vec::new();
        for entry in self.clients.iter() {
            if entry.value().try_send(payload.clone()).is_err() {
                dropped.push(*entry.key());
            }
        }
        for id in dropped {
            debug!(client = id, "dropping slow websocket client");
            self.clients.remove(&id);
        }
    }

    pub fn send_to(&self, id: u64, frame: &Frame) {
        if let Some(entry) = self.clients.get(&id) {
            let _ = entry.value().try_send(frame.to_json());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn frames_serialize_with_type_tag() {
        let frame = Frame::new("game_new", json!({"key": "203.0.113.7:5000"}));
        let text = frame.to_json();
        assert!(text.contains(r#""type":"game_new""#));
        assert!(text.contains("203.0.113.7:5000"));
    }

    #[test]
    fn broadcast_reaches_live_subscribers() {
        let hub = BroadcastHub::new();
        let (_id, mut rx) = hub.subscribe();
        hub.broadcast(&Frame::new("snapshot", json!({"games": []})));
        let received = rx.try_recv().expect("subscriber should see the frame");
        assert!(received.contains(r#""type":"snapshot""#));
    }

    #[test]
    fn slow_client_is_dropped_without_blocking() {
        let hub = BroadcastHub::new();
        let (_id, _rx) = hub.subscribe();
        for index in 0..(CLIENT_QUEUE_CAP + 10) {
            hub.broadcast(&Frame::new("game_update", json!({ "seq": index })));
        }
        assert_eq!(hub.client_count(), 0);
    }

    #[test]
    fn unsubscribe_removes_the_client() {
        let hub = BroadcastHub::new();
        let (id, _rx) = hub.subscribe();
        assert_eq!(hub.client_count(), 1);
        hub.unsubscribe(id);
        assert_eq!(hub.client_count(), 0);
    }
}
