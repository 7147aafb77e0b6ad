//! Developer harness — synthetic envelopes, envelope validation, and
//! webhook fixtures for exercising the pipeline without a live platform.

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Result, bail};
use chrono::Utc;
use serde::Serialize;
use serde_json::{Value, json};

use crate::envelope::{self, ChannelKind, IngressEnvelope};

// ── Envelope generator ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct TestEnvelopeParams {
    pub text: String,
    pub peer_id: Option<String>,
    pub conversation_id: Option<String>,
    pub is_group: bool,
    pub group_name: Option<String>,
}

static ENVELOPE_SEQ: AtomicU64 = AtomicU64::new(1);

/// Build a schema-valid ingress envelope with test defaults.
pub fn create_test_envelope(channel: ChannelKind, params: TestEnvelopeParams) -> IngressEnvelope {
    let seq = ENVELOPE_SEQ.fetch_add(1, Ordering::Relaxed);
    let group_name = if params.is_group {
        Some(
            params
                .group_name
                .unwrap_or_else(|| "Test Group".to_string()),
        )
    } else {
        None
    };

    IngressEnvelope {
        channel,
        platform_message_id: format!("test-{}-{seq}", Utc::now().timestamp_millis()),
        conversation_id: params
            .conversation_id
            .unwrap_or_else(|| format!("conv-{channel}-test")),
        peer_id: params
            .peer_id
            .unwrap_or_else(|| format!("peer-{channel}-001")),
        peer_display: Some("Test User".to_string()),
        text: params.text,
        is_group: params.is_group,
        group_name,
        timestamp: Utc::now(),
        thread_id: None,
        reply_to_message_id: None,
        mentions: None,
        media: None,
    }
}

// ── Envelope validator ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeType {
    Ingress,
    Egress,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Validation {
    pub valid: bool,
    pub envelope_type: EnvelopeType,
    pub errors: Vec<String>,
}

/// Classify and validate arbitrary JSON as an envelope.
///
/// The direction is inferred: data carrying any of `peerId`,
/// `platformMessageId` or `isGroup` is treated as ingress, everything
/// else as egress. (A heuristic — envelopes carry no direction tag on
/// the wire.)
pub fn validate_envelope(data: &Value) -> Validation {
    let looks_ingress = data.get("peerId").is_some()
        || data.get("platformMessageId").is_some()
        || data.get("isGroup").is_some();

    let (envelope_type, errors) = if looks_ingress {
        (EnvelopeType::Ingress, envelope::validate_ingress(data))
    } else {
        (EnvelopeType::Egress, envelope::validate_egress(data))
    };

    Validation {
        valid: errors.is_empty(),
        envelope_type,
        errors,
    }
}

// ── Webhook fixtures ────────────────────────────────────────────────────────

/// Synthesize a platform-flavored mock webhook payload.
pub fn generate_webhook_event(channel: ChannelKind, event_type: &str) -> Result<Value> {
    let now = Utc::now();
    match (channel, event_type) {
        (ChannelKind::Whatsapp, "message") => Ok(json!({
            "object": "whatsapp_business_account",
            "entry": [{
                "id": "1029384756",
                "changes": [{
                    "field": "messages",
                    "value": {
                        "messaging_product": "whatsapp",
                        "contacts": [{"profile": {"name": "Test User"}, "wa_id": "15551234567"}],
                        "messages": [{
                            "from": "15551234567",
                            "id": format!("wamid.test{}", now.timestamp_millis()),
                            "timestamp": now.timestamp().to_string(),
                            "type": "text",
                            "text": {"body": "Hello from the test harness"},
                        }],
                    },
                }],
            }],
        })),
        (ChannelKind::Whatsapp, "status") => Ok(json!({
            "object": "whatsapp_business_account",
            "entry": [{
                "changes": [{
                    "field": "messages",
                    "value": {
                        "statuses": [{
                            "id": format!("wamid.test{}", now.timestamp_millis()),
                            "status": "delivered",
                            "timestamp": now.timestamp().to_string(),
                            "recipient_id": "15551234567",
                        }],
                    },
                }],
            }],
        })),
        (ChannelKind::Signal, "message") => Ok(json!({
            "envelope": {
                "source": "+15551234567",
                "sourceDevice": 1,
                "timestamp": now.timestamp_millis(),
                "dataMessage": {
                    "timestamp": now.timestamp_millis(),
                    "message": "Hello from the test harness",
                    "groupInfo": null,
                },
            },
        })),
        (ChannelKind::Imessage, "message") => Ok(json!({
            "rowid": 51,
            "guid": format!("test-{}", now.timestamp_millis()),
            "text": "Hello from the test harness",
            "is_from_me": 0,
            "date": (now.timestamp() - 978_307_200) * 1_000_000_000,
            "chat_identifier": "+15551234567",
            "group_id": null,
            "display_name": null,
            "cache_has_attachments": 0,
        })),
        (_, event) => bail!("no {event} fixture for channel {channel}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_envelope_validates_as_ingress() {
        let envelope = create_test_envelope(
            ChannelKind::Whatsapp,
            TestEnvelopeParams {
                text: "hello".into(),
                ..Default::default()
            },
        );
        let value = serde_json::to_value(&envelope).unwrap();
        let validation = validate_envelope(&value);
        assert!(validation.valid, "{:?}", validation.errors);
        assert_eq!(validation.envelope_type, EnvelopeType::Ingress);
    }

    #[test]
    fn defaults_are_derived_from_channel() {
        let envelope = create_test_envelope(
            ChannelKind::Signal,
            TestEnvelopeParams {
                text: "x".into(),
                ..Default::default()
            },
        );
        assert_eq!(envelope.peer_id, "peer-signal-001");
        assert_eq!(envelope.conversation_id, "conv-signal-test");
        assert_eq!(envelope.peer_display.as_deref(), Some("Test User"));
        assert!(envelope.platform_message_id.starts_with("test-"));
    }

    #[test]
    fn group_name_defaults_only_for_groups() {
        let direct = create_test_envelope(
            ChannelKind::Imessage,
            TestEnvelopeParams {
                text: "x".into(),
                ..Default::default()
            },
        );
        assert!(direct.group_name.is_none());

        let group = create_test_envelope(
            ChannelKind::Imessage,
            TestEnvelopeParams {
                text: "x".into(),
                is_group: true,
                ..Default::default()
            },
        );
        assert_eq!(group.group_name.as_deref(), Some("Test Group"));
    }

    #[test]
    fn message_ids_are_unique() {
        let params = || TestEnvelopeParams {
            text: "x".into(),
            ..Default::default()
        };
        let a = create_test_envelope(ChannelKind::Imessage, params());
        let b = create_test_envelope(ChannelKind::Imessage, params());
        assert_ne!(a.platform_message_id, b.platform_message_id);
    }

    #[test]
    fn egress_classification_without_ingress_markers() {
        let validation = validate_envelope(&json!({
            "channel": "imessage",
            "conversationId": "+15551234567",
            "text": "hello",
        }));
        assert_eq!(validation.envelope_type, EnvelopeType::Egress);
        assert!(validation.valid);
    }

    #[test]
    fn webhook_fixtures_exist_per_channel() {
        assert!(generate_webhook_event(ChannelKind::Whatsapp, "message").is_ok());
        assert!(generate_webhook_event(ChannelKind::Whatsapp, "status").is_ok());
        assert!(generate_webhook_event(ChannelKind::Signal, "message").is_ok());
        assert!(generate_webhook_event(ChannelKind::Imessage, "message").is_ok());
        assert!(generate_webhook_event(ChannelKind::Signal, "bogus").is_err());
    }
}
