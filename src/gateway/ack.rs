// Delivery acknowledgments keyed by the client's correlation token

use crate::gateway::address;
use crate::gateway::fanout::{Payload, Publisher};
use crate::gateway::model::{CorrelationToken, UserId};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Sent,
    Failed,
}

/// Which ack address a send attempt reports to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckScope {
    Direct,
    Group,
}

/// Extra fields carried by attachment acknowledgments
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentReceipt {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<i64>,
    pub file_name: String,
    pub sender_id: UserId,
    pub receiver_id: i64,
    pub is_group: bool,
}

/// Acknowledgment wire shape
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Acknowledgment {
    pub correlation_token: CorrelationToken,
    pub outcome: Outcome,
    #[serde(flatten)]
    pub attachment: Option<AttachmentReceipt>,
}

/// Emits acknowledgments through the publish primitive
#[derive(Clone)]
pub struct Acknowledger {
    publisher: Arc<dyn Publisher>,
}

impl Acknowledger {
    pub fn new(publisher: Arc<dyn Publisher>) -> Self {
        Self { publisher }
    }

    /// Open an accepted send attempt.
    ///
    /// Call only after validation passed; the returned guard reports exactly once.
    pub fn begin(
        &self,
        sender: UserId,
        scope: AckScope,
        correlation_token: CorrelationToken,
    ) -> PendingAck {
        PendingAck {
            publisher: self.publisher.clone(),
            sender,
            scope,
            correlation_token,
            attachment: None,
            resolved: false,
        }
    }
}

/// An accepted send attempt awaiting its outcome.
///
/// Dropping it unresolved reports `failed`.
#[must_use = "a pending acknowledgment reports `failed` when dropped"]
pub struct PendingAck {
    publisher: Arc<dyn Publisher>,
    sender: UserId,
    scope: AckScope,
    correlation_token: CorrelationToken,
    attachment: Option<AttachmentReceipt>,
    resolved: bool,
}

impl PendingAck {
    /// Attach attachment details to whichever outcome is reported
    pub fn set_attachment(&mut self, receipt: AttachmentReceipt) {
        self.attachment = Some(receipt);
    }

    pub fn set_message_id(&mut self, id: i64) {
        if let Some(receipt) = self.attachment.as_mut() {
            receipt.message_id = Some(id);
        }
    }

    pub fn correlation_token(&self) -> &CorrelationToken {
        &self.correlation_token
    }

    pub fn sent(mut self) {
        self.emit(Outcome::Sent);
    }

    pub fn failed(mut self) {
        self.emit(Outcome::Failed);
    }

    fn destination(&self) -> String {
        match self.scope {
            AckScope::Direct => address::direct_ack(self.sender),
            AckScope::Group => address::group_ack(self.sender),
        }
    }

    fn emit(&mut self, outcome: Outcome) {
        if self.resolved {
            return;
        }
        self.resolved = true;

        let ack = Acknowledgment {
            correlation_token: std::mem::take(&mut self.correlation_token),
            outcome,
            attachment: self.attachment.take(),
        };

        let destination = self.destination();
        tracing::debug!(
            user_id = %self.sender,
            correlation_token = %ack.correlation_token,
            destination = %destination,
            ?outcome,
            "Acknowledging"
        );

        self.publisher.publish(&destination, Payload::json(&ack));
    }
}

impl Drop for PendingAck {
    fn drop(&mut self) {
        self.emit(Outcome::Failed);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Publisher that records every publish
    #[derive(Default)]
    pub(crate) struct RecordingPublisher {
        pub published: Mutex<Vec<(String, Payload)>>,
    }

    impl RecordingPublisher {
        pub fn to(&self, destination: &str) -> Vec<serde_json::Value> {
            self.published
                .lock()
                .unwrap()
                .iter()
                .filter(|(d, _)| d == destination)
                .map(|(_, p)| serde_json::from_str(&p.body).unwrap_or(serde_json::Value::Null))
                .collect()
        }

        pub fn count(&self) -> usize {
            self.published.lock().unwrap().len()
        }
    }

    impl Publisher for RecordingPublisher {
        fn publish(&self, destination: &str, payload: Payload) {
            self.published
                .lock()
                .unwrap()
                .push((destination.to_string(), payload));
        }
    }

    #[test]
    fn test_sent_ack_echoes_token() {
        let publisher = Arc::new(RecordingPublisher::default());
        let acks = Acknowledger::new(publisher.clone());

        acks.begin(UserId(1), AckScope::Direct, CorrelationToken::from(42)).sent();

        let received = publisher.to("/topic/user/1/queue/ack");
        assert_eq!(received, vec![serde_json::json!({"correlationToken": 42, "outcome": "sent"})]);
    }

    #[test]
    fn test_dropped_ack_reports_failed_once() {
        let publisher = Arc::new(RecordingPublisher::default());
        let acks = Acknowledger::new(publisher.clone());

        {
            let _pending = acks.begin(UserId(5), AckScope::Group, CorrelationToken::from("t-1"));
        }

        let received = publisher.to("/topic/group/5/ack");
        assert_eq!(received.len(), 1);
        assert_eq!(received[0]["outcome"], "failed");
        assert_eq!(received[0]["correlationToken"], "t-1");
        assert_eq!(publisher.count(), 1);
    }

    #[test]
    fn test_attachment_fields_are_flattened() {
        let publisher = Arc::new(RecordingPublisher::default());
        let acks = Acknowledger::new(publisher.clone());

        let mut pending = acks.begin(UserId(1), AckScope::Direct, CorrelationToken::from(7));
        pending.set_attachment(AttachmentReceipt {
            message_id: None,
            file_name: "cat.png".to_string(),
            sender_id: UserId(1),
            receiver_id: 2,
            is_group: false,
        });
        pending.set_message_id(11);
        pending.sent();

        let received = publisher.to("/topic/user/1/queue/ack");
        assert_eq!(received[0]["fileName"], "cat.png");
        assert_eq!(received[0]["messageId"], 11);
        assert_eq!(received[0]["isGroup"], false);
        assert_eq!(received[0]["outcome"], "sent");
    }
}
