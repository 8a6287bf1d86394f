//! Observer channel (spec §6 "Outbound"): a `tokio::sync::broadcast`
//! publication point for the final update record of each completed turn,
//! replacing the teacher's Tauri event-emission boundary (`app.emit`).

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::constraint::ConstraintRecord;
use crate::patch_ops::Patch;
use crate::time_model::Plan;

/// Published once per completed turn (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateRecord {
    pub thread_ts: String,
    pub channel_id: String,
    pub user_id: String,
    pub user_message: String,
    pub constraints: Vec<ConstraintRecord>,
    #[serde(default)]
    pub plan: Option<Plan>,
    pub actions: Vec<String>,
    #[serde(default)]
    pub patch_history: Vec<Patch>,
}

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast publisher/subscriber pair. Cloning `Observer` shares the same
/// underlying channel; every clone's subscribers receive every publication.
#[derive(Clone)]
pub struct Observer {
    sender: broadcast::Sender<UpdateRecord>,
}

impl Observer {
    pub fn new() -> Self {
        let (sender, _receiver) = broadcast::channel(CHANNEL_CAPACITY);
        Observer { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UpdateRecord> {
        self.sender.subscribe()
    }

    /// Best-effort publish: a record published with no subscribers is
    /// silently dropped, matching `tokio::sync::broadcast` semantics.
    pub fn publish(&self, record: UpdateRecord) {
        let _ = self.sender.send(record);
    }
}

impl Default for Observer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> UpdateRecord {
        UpdateRecord {
            thread_ts: "t1".into(),
            channel_id: "c1".into(),
            user_id: "u1".into(),
            user_message: "hello".into(),
            constraints: vec![],
            plan: None,
            actions: vec!["proceed".into()],
            patch_history: vec![],
        }
    }

    #[tokio::test]
    async fn subscriber_receives_published_record_exactly_once() {
        let observer = Observer::new();
        let mut receiver = observer.subscribe();
        observer.publish(sample_record());

        let received = receiver.recv().await.unwrap();
        assert_eq!(received.thread_ts, "t1");
        assert!(tokio::time::timeout(std::time::Duration::from_millis(20), receiver.recv()).await.is_err());
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_panic() {
        let observer = Observer::new();
        observer.publish(sample_record());
    }
}
