//! Generated envelopes must validate, for every channel and shape the
//! harness can produce.

use myndhyve_relay::envelope::{ChannelKind, validate_egress, validate_ingress};
use myndhyve_relay::harness::{EnvelopeType, TestEnvelopeParams, create_test_envelope, validate_envelope};
use serde_json::json;
use strum::IntoEnumIterator;

#[test]
fn every_channel_round_trips() {
    for channel in ChannelKind::iter() {
        let envelope = create_test_envelope(
            channel,
            TestEnvelopeParams {
                text: "hello".into(),
                ..Default::default()
            },
        );
        let value = serde_json::to_value(&envelope).unwrap();
        let validation = validate_envelope(&value);
        assert!(
            validation.valid,
            "{channel}: {:?}",
            validation.errors
        );
        assert_eq!(validation.envelope_type, EnvelopeType::Ingress);
    }
}

#[test]
fn group_variants_round_trip() {
    let envelope = create_test_envelope(
        ChannelKind::Whatsapp,
        TestEnvelopeParams {
            text: "hello".into(),
            is_group: true,
            group_name: Some("Family".into()),
            ..Default::default()
        },
    );
    let value = serde_json::to_value(&envelope).unwrap();
    assert_eq!(value["isGroup"], json!(true));
    assert_eq!(value["groupName"], json!("Family"));
    assert!(validate_envelope(&value).valid);
}

#[test]
fn ingress_parser_rejects_unknown_channel() {
    let errors = validate_ingress(&json!({
        "channel": "telegram",
        "platformMessageId": "m-1",
        "conversationId": "c-1",
        "peerId": "p-1",
        "isGroup": false,
        "timestamp": "2026-01-01T00:00:00Z",
        "text": "hi",
    }));
    assert!(errors.iter().any(|e| e.contains("unsupported value")));
}

#[test]
fn ingress_parser_rejects_bad_media_kind() {
    let errors = validate_ingress(&json!({
        "channel": "imessage",
        "platformMessageId": "m-1",
        "conversationId": "c-1",
        "peerId": "p-1",
        "isGroup": false,
        "timestamp": "2026-01-01T00:00:00Z",
        "text": "",
        "media": [{"kind": "hologram", "ref": "/x"}],
    }));
    assert!(errors.iter().any(|e| e.contains("unknown kind")));
}

#[test]
fn egress_with_media_only_is_valid() {
    let errors = validate_egress(&json!({
        "channel": "signal",
        "conversationId": "c-1",
        "text": "",
        "media": [{"kind": "image", "url": "https://cdn.example.com/a.png"}],
    }));
    assert!(errors.is_empty(), "{errors:?}");
}

#[test]
fn direction_heuristic_uses_ingress_markers() {
    // isGroup alone is enough to classify as ingress.
    let validation = validate_envelope(&json!({
        "channel": "imessage",
        "conversationId": "c-1",
        "text": "hi",
        "isGroup": false,
    }));
    assert_eq!(validation.envelope_type, EnvelopeType::Ingress);
    // ...and its missing required ingress fields then fail validation.
    assert!(!validation.valid);
}
