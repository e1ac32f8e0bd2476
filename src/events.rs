//! Wire types for gateway webhook events
//!
//! The gateway posts a camelCase envelope whose `payload` shape depends on the
//! event kind. All four payload kinds share the message id / phone number /
//! SIM slot base; the kind-specific fields extend it.

use serde::{Deserialize, Serialize};

/// The four SMS lifecycle events produced by the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "sms:received")]
    Received,
    #[serde(rename = "sms:sent")]
    Sent,
    #[serde(rename = "sms:delivered")]
    Delivered,
    #[serde(rename = "sms:failed")]
    Failed,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [
        EventKind::Received,
        EventKind::Sent,
        EventKind::Delivered,
        EventKind::Failed,
    ];

    /// The short tag used in URL paths and dedup keys
    pub fn short(&self) -> &'static str {
        match self {
            EventKind::Received => "received",
            EventKind::Sent => "sent",
            EventKind::Delivered => "delivered",
            EventKind::Failed => "failed",
        }
    }

    /// The full wire name the gateway uses
    pub fn wire(&self) -> &'static str {
        match self {
            EventKind::Received => "sms:received",
            EventKind::Sent => "sms:sent",
            EventKind::Delivered => "sms:delivered",
            EventKind::Failed => "sms:failed",
        }
    }

    pub fn from_short(s: &str) -> Option<EventKind> {
        match s {
            "received" => Some(EventKind::Received),
            "sent" => Some(EventKind::Sent),
            "delivered" => Some(EventKind::Delivered),
            "failed" => Some(EventKind::Failed),
            _ => None,
        }
    }

    pub fn from_wire(s: &str) -> Option<EventKind> {
        match s {
            "sms:received" => Some(EventKind::Received),
            "sms:sent" => Some(EventKind::Sent),
            "sms:delivered" => Some(EventKind::Delivered),
            "sms:failed" => Some(EventKind::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.short())
    }
}

/// Top-level webhook envelope posted by the gateway
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEnvelope {
    pub id: String,
    pub webhook_id: String,
    pub device_id: String,
    pub event: EventKind,
    pub payload: serde_json::Value,
}

/// Fields shared by all four payload kinds
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmsPayloadBase {
    pub message_id: String,
    pub phone_number: String,
    #[serde(default)]
    pub sim_number: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceivedPayload {
    #[serde(flatten)]
    pub base: SmsPayloadBase,
    pub message: String,
    pub received_at: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SentPayload {
    #[serde(flatten)]
    pub base: SmsPayloadBase,
    pub sent_at: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveredPayload {
    #[serde(flatten)]
    pub base: SmsPayloadBase,
    pub delivered_at: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedPayload {
    #[serde(flatten)]
    pub base: SmsPayloadBase,
    pub failed_at: String,
    pub reason: String,
}

/// Kind-specific payload, parsed according to the ingress route
#[derive(Debug, Clone)]
pub enum EventPayload {
    Received(ReceivedPayload),
    Sent(SentPayload),
    Delivered(DeliveredPayload),
    Failed(FailedPayload),
}

impl EventPayload {
    pub fn parse(kind: EventKind, payload: &serde_json::Value) -> serde_json::Result<Self> {
        Ok(match kind {
            EventKind::Received => EventPayload::Received(serde_json::from_value(payload.clone())?),
            EventKind::Sent => EventPayload::Sent(serde_json::from_value(payload.clone())?),
            EventKind::Delivered => {
                EventPayload::Delivered(serde_json::from_value(payload.clone())?)
            }
            EventKind::Failed => EventPayload::Failed(serde_json::from_value(payload.clone())?),
        })
    }

    pub fn base(&self) -> &SmsPayloadBase {
        match self {
            EventPayload::Received(p) => &p.base,
            EventPayload::Sent(p) => &p.base,
            EventPayload::Delivered(p) => &p.base,
            EventPayload::Failed(p) => &p.base,
        }
    }
}

/// The set of event kinds a subscriber wants, in the registration wire shape
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventKinds {
    #[serde(rename = "sms_received", default)]
    pub received: bool,
    #[serde(rename = "sms_sent", default)]
    pub sent: bool,
    #[serde(rename = "sms_delivered", default)]
    pub delivered: bool,
    #[serde(rename = "sms_failed", default)]
    pub failed: bool,
}

impl EventKinds {
    pub fn accepts(&self, kind: EventKind) -> bool {
        match kind {
            EventKind::Received => self.received,
            EventKind::Sent => self.sent,
            EventKind::Delivered => self.delivered,
            EventKind::Failed => self.failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(event: &str, payload: serde_json::Value) -> serde_json::Value {
        serde_json::json!({
            "id": "evt-1",
            "webhookId": "wh-1",
            "deviceId": "dev-1",
            "event": event,
            "payload": payload,
        })
    }

    #[test]
    fn test_parse_received_envelope() {
        let value = envelope(
            "sms:received",
            serde_json::json!({
                "messageId": "msg123",
                "phoneNumber": "+15551234567",
                "simNumber": 1,
                "message": "hello",
                "receivedAt": "2023-01-01T00:00:00Z",
            }),
        );

        let env: WebhookEnvelope = serde_json::from_value(value).unwrap();
        assert_eq!(env.event, EventKind::Received);
        assert_eq!(env.webhook_id, "wh-1");

        let payload = EventPayload::parse(env.event, &env.payload).unwrap();
        assert_eq!(payload.base().message_id, "msg123");
        assert_eq!(payload.base().phone_number, "+15551234567");
        assert_eq!(payload.base().sim_number, Some(1));
        match payload {
            EventPayload::Received(p) => assert_eq!(p.message, "hello"),
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn test_parse_failed_envelope() {
        let value = envelope(
            "sms:failed",
            serde_json::json!({
                "messageId": "msg999",
                "phoneNumber": "+15551234567",
                "failedAt": "2023-01-01T00:00:00Z",
                "reason": "no signal",
            }),
        );

        let env: WebhookEnvelope = serde_json::from_value(value).unwrap();
        let payload = EventPayload::parse(env.event, &env.payload).unwrap();
        assert_eq!(payload.base().sim_number, None);
        match payload {
            EventPayload::Failed(p) => assert_eq!(p.reason, "no signal"),
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_event_name_rejected() {
        let value = envelope("sms:bogus", serde_json::json!({}));
        assert!(serde_json::from_value::<WebhookEnvelope>(value).is_err());
    }

    #[test]
    fn test_payload_missing_fields_rejected() {
        // a sent payload lacks receivedAt/message, so parsing it as received fails
        let payload = serde_json::json!({
            "messageId": "m1",
            "phoneNumber": "+15551234567",
            "sentAt": "2023-01-01T00:00:00Z",
        });
        assert!(EventPayload::parse(EventKind::Received, &payload).is_err());
        assert!(EventPayload::parse(EventKind::Sent, &payload).is_ok());
    }

    #[test]
    fn test_short_and_wire_names() {
        for kind in EventKind::ALL {
            assert_eq!(EventKind::from_short(kind.short()), Some(kind));
            assert_eq!(EventKind::from_wire(kind.wire()), Some(kind));
            assert!(kind.wire().ends_with(kind.short()));
        }
        assert_eq!(EventKind::from_short("bogus"), None);
        assert_eq!(EventKind::from_wire("received"), None);
    }

    #[test]
    fn test_event_kinds_accepts() {
        let kinds = EventKinds {
            received: true,
            delivered: true,
            ..Default::default()
        };
        assert!(kinds.accepts(EventKind::Received));
        assert!(!kinds.accepts(EventKind::Sent));
        assert!(kinds.accepts(EventKind::Delivered));
        assert!(!kinds.accepts(EventKind::Failed));
    }

    #[test]
    fn test_event_kinds_wire_shape() {
        let kinds: EventKinds = serde_json::from_value(serde_json::json!({
            "sms_received": true,
            "sms_failed": true,
        }))
        .unwrap();
        assert!(kinds.received);
        assert!(!kinds.sent);
        assert!(!kinds.delivered);
        assert!(kinds.failed);
    }
}
