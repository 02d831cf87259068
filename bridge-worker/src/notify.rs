use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

use crate::alerts::Alert;
use crate::stats::StatisticsSnapshot;

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Success,
    Failed,
}

/// One delivered or dead-lettered event, as shown to observers.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecentEvent {
    pub event_id: Uuid,
    pub correlation_id: Uuid,
    pub title: String,
    pub severity: String,
    pub status: DeliveryStatus,
    pub source_file: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum PushMessage {
    Stats(StatisticsSnapshot),
    RecentEvent(RecentEvent),
    Alert(Alert),
    Error { message: String },
}

/// Best-effort fan-out to connected observers. Slow observers lag and lose messages, the
/// publisher never waits.
#[derive(Clone)]
pub struct Notifier {
    sender: broadcast::Sender<PushMessage>,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PushMessage> {
        self.sender.subscribe()
    }

    pub fn publish(&self, message: PushMessage) {
        if self.sender.send(message).is_err() {
            trace!("no observers connected, push message dropped");
        }
    }

    pub fn publish_error(&self, message: impl Into<String>) {
        self.publish(PushMessage::Error {
            message: message.into(),
        });
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(256)
    }
}
