//! Push messages from the background context to foreground views.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::candidate::Candidate;

/// Wire shape of a push message: `{candidates?, error?}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForegroundMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidates: Option<Vec<Candidate>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ForegroundMessage {
    pub fn candidates(candidates: Vec<Candidate>) -> Self {
        Self {
            candidates: Some(candidates),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            candidates: None,
            error: Some(message.into()),
        }
    }
}

/// Fan-out of push messages to every subscribed view.
///
/// Dropping a receiver deregisters it.
#[derive(Debug, Clone)]
pub struct MessageBus {
    tx: broadcast::Sender<ForegroundMessage>,
}

impl MessageBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Deliver to current subscribers; returns how many received it.
    pub fn publish(&self, message: ForegroundMessage) -> usize {
        let delivered = self.tx.send(message).unwrap_or(0);
        debug!("Bus: message delivered to {} subscribers", delivered);
        delivered
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ForegroundMessage> {
        self.tx.subscribe()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape_omits_absent_fields() {
        let c = Candidate::parse("0000003100010000000001").unwrap();
        let json = serde_json::to_string(&ForegroundMessage::candidates(vec![c])).unwrap();
        assert_eq!(json, r#"{"candidates":["0000003100010000000001"]}"#);

        let json = serde_json::to_string(&ForegroundMessage::error("boom")).unwrap();
        assert_eq!(json, r#"{"error":"boom"}"#);

        let empty: ForegroundMessage = serde_json::from_str("{}").unwrap();
        assert_eq!(empty, ForegroundMessage::default());
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = MessageBus::default();
        assert_eq!(bus.publish(ForegroundMessage::error("nobody")), 0);
    }

    #[tokio::test]
    async fn test_dropped_receiver_deregisters() {
        let bus = MessageBus::default();
        let mut rx = bus.subscribe();
        let other = bus.subscribe();
        drop(other);

        assert_eq!(bus.publish(ForegroundMessage::error("x")), 1);
        assert_eq!(rx.recv().await.unwrap(), ForegroundMessage::error("x"));
    }
}
