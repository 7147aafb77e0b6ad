//! Message envelopes crossing the agent/cloud boundary.
//!
//! Ingress envelopes travel platform → cloud, egress envelopes cloud →
//! platform. The serde types are the producers' side; [`validate_ingress`]
//! and [`validate_egress`] are a validating parser applied to raw JSON at
//! the boundaries (cloud requests, developer-tool inputs), so malformed
//! data is rejected with field-level messages instead of a serde error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{Display, EnumIter, EnumString};

// ── Channel tags ────────────────────────────────────────────────────────────

/// Closed set of platforms the agent can bridge.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ChannelKind {
    Whatsapp,
    Signal,
    Imessage,
}

// ── Media ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    Document,
    Sticker,
}

impl MediaKind {
    /// Derive a media kind from a MIME type. Anything unrecognised,
    /// including a missing MIME type, is a document.
    pub fn from_mime(mime: Option<&str>) -> Self {
        match mime {
            Some(m) if m.starts_with("image/") => MediaKind::Image,
            Some(m) if m.starts_with("video/") => MediaKind::Video,
            Some(m) if m.starts_with("audio/") => MediaKind::Audio,
            _ => MediaKind::Document,
        }
    }
}

/// Inbound attachment. `ref_` is a local path or handle on the source
/// platform — never a URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaItem {
    pub kind: MediaKind,
    #[serde(rename = "ref")]
    pub ref_: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// Outbound attachment: the cloud hands us a remote URL to deliver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EgressMedia {
    pub kind: String,
    pub url: String,
}

// ── Envelopes ───────────────────────────────────────────────────────────────

/// A message observed on a platform, normalized for the cloud.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngressEnvelope {
    pub channel: ChannelKind,
    pub platform_message_id: String,
    pub conversation_id: String,
    pub peer_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_display: Option<String>,
    pub text: String,
    pub is_group: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to_message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mentions: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media: Option<Vec<MediaItem>>,
}

/// A generated reply the cloud wants delivered on a platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EgressEnvelope {
    pub channel: ChannelKind,
    pub conversation_id: String,
    #[serde(default)]
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to_message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media: Option<Vec<EgressMedia>>,
}

// ── Outbound work ───────────────────────────────────────────────────────────

/// A unit claimed from the cloud's outbound queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundWork {
    pub work_id: String,
    pub envelope: EgressEnvelope,
    #[serde(default)]
    pub attempt: u32,
}

/// Result of a delivery attempt. Plugins never error out of `deliver` —
/// every failure is encoded here so the poller can ack it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform_message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub retryable: bool,
}

impl DeliveryResult {
    pub fn ok(platform_message_id: Option<String>) -> Self {
        Self {
            success: true,
            platform_message_id,
            error: None,
            retryable: false,
        }
    }

    pub fn failed(error: impl Into<String>, retryable: bool) -> Self {
        Self {
            success: false,
            platform_message_id: None,
            error: Some(error.into()),
            retryable,
        }
    }
}

// ── Validating parser ───────────────────────────────────────────────────────

const MEDIA_KINDS: &[&str] = &["image", "video", "audio", "document", "sticker"];

fn channel_is_valid(value: &Value) -> bool {
    value
        .as_str()
        .is_some_and(|s| matches!(s, "whatsapp" | "signal" | "imessage"))
}

fn non_empty_string(value: Option<&Value>) -> bool {
    value.and_then(Value::as_str).is_some_and(|s| !s.is_empty())
}

/// Check a raw JSON object against the ingress envelope constraints.
/// Returns one message per violated rule; empty means valid.
pub fn validate_ingress(data: &Value) -> Vec<String> {
    let mut errors = Vec::new();
    let Some(obj) = data.as_object() else {
        return vec!["envelope must be a JSON object".to_string()];
    };

    match obj.get("channel") {
        Some(c) if channel_is_valid(c) => {}
        Some(c) => errors.push(format!("channel: unsupported value {c}")),
        None => errors.push("channel: required".to_string()),
    }
    if !non_empty_string(obj.get("platformMessageId")) {
        errors.push("platformMessageId: required non-empty string".to_string());
    }
    if !non_empty_string(obj.get("conversationId")) {
        errors.push("conversationId: required non-empty string".to_string());
    }
    if !non_empty_string(obj.get("peerId")) {
        errors.push("peerId: required non-empty string".to_string());
    }
    if !obj.get("isGroup").is_some_and(Value::is_boolean) {
        errors.push("isGroup: required boolean".to_string());
    }
    match obj.get("timestamp").and_then(Value::as_str) {
        Some(ts) if DateTime::parse_from_rfc3339(ts).is_ok() => {}
        Some(ts) => errors.push(format!("timestamp: not an ISO-8601 instant: {ts}")),
        None => errors.push("timestamp: required".to_string()),
    }

    let media_count = validate_media(obj.get("media"), &mut errors);
    let has_text = non_empty_string(obj.get("text"));
    let text_present = obj.get("text").is_some_and(Value::is_string);
    if !text_present {
        errors.push("text: required string".to_string());
    } else if !has_text && media_count == 0 {
        errors.push("text: may be empty only when media is present".to_string());
    }

    errors
}

fn validate_media(media: Option<&Value>, errors: &mut Vec<String>) -> usize {
    let Some(media) = media else { return 0 };
    if media.is_null() {
        return 0;
    }
    let Some(items) = media.as_array() else {
        errors.push("media: must be an array".to_string());
        return 0;
    };
    for (i, item) in items.iter().enumerate() {
        match item.get("kind").and_then(Value::as_str) {
            Some(kind) if MEDIA_KINDS.contains(&kind) => {}
            Some(kind) => errors.push(format!("media[{i}].kind: unknown kind {kind}")),
            None => errors.push(format!("media[{i}].kind: required")),
        }
        if !non_empty_string(item.get("ref")) {
            errors.push(format!("media[{i}].ref: required non-empty string"));
        }
    }
    items.len()
}

/// Check a raw JSON object against the egress envelope constraints.
pub fn validate_egress(data: &Value) -> Vec<String> {
    let mut errors = Vec::new();
    let Some(obj) = data.as_object() else {
        return vec!["envelope must be a JSON object".to_string()];
    };

    match obj.get("channel") {
        Some(c) if channel_is_valid(c) => {}
        Some(c) => errors.push(format!("channel: unsupported value {c}")),
        None => errors.push("channel: required".to_string()),
    }
    if !non_empty_string(obj.get("conversationId")) {
        errors.push("conversationId: required non-empty string".to_string());
    }

    let media_count = match obj.get("media").filter(|m| !m.is_null()) {
        None => 0,
        Some(Value::Array(items)) => {
            for (i, item) in items.iter().enumerate() {
                if !non_empty_string(item.get("kind")) {
                    errors.push(format!("media[{i}].kind: required non-empty string"));
                }
                match item.get("url").and_then(Value::as_str) {
                    Some(u) if url::Url::parse(u).is_ok() => {}
                    Some(u) => errors.push(format!("media[{i}].url: not an absolute URL: {u}")),
                    None => errors.push(format!("media[{i}].url: required")),
                }
            }
            items.len()
        }
        Some(_) => {
            errors.push("media: must be an array".to_string());
            0
        }
    };

    let has_text = non_empty_string(obj.get("text"));
    if !has_text && media_count == 0 {
        errors.push("text: may be empty only when media is present".to_string());
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn mime_prefix_maps_to_kind() {
        assert_eq!(MediaKind::from_mime(Some("image/jpeg")), MediaKind::Image);
        assert_eq!(MediaKind::from_mime(Some("video/mp4")), MediaKind::Video);
        assert_eq!(MediaKind::from_mime(Some("audio/mp3")), MediaKind::Audio);
        assert_eq!(
            MediaKind::from_mime(Some("application/pdf")),
            MediaKind::Document
        );
        assert_eq!(MediaKind::from_mime(None), MediaKind::Document);
    }

    #[test]
    fn channel_kind_round_trips_as_lowercase() {
        assert_eq!(ChannelKind::Imessage.to_string(), "imessage");
        assert_eq!(
            serde_json::to_value(ChannelKind::Whatsapp).unwrap(),
            json!("whatsapp")
        );
        assert_eq!("signal".parse::<ChannelKind>().unwrap(), ChannelKind::Signal);
    }

    #[test]
    fn ingress_requires_core_fields() {
        let errors = validate_ingress(&json!({"channel": "imessage"}));
        assert!(errors.iter().any(|e| e.starts_with("platformMessageId")));
        assert!(errors.iter().any(|e| e.starts_with("conversationId")));
        assert!(errors.iter().any(|e| e.starts_with("peerId")));
        assert!(errors.iter().any(|e| e.starts_with("timestamp")));
    }

    #[test]
    fn ingress_empty_text_needs_media() {
        let base = json!({
            "channel": "imessage",
            "platformMessageId": "g-1",
            "conversationId": "+15551234567",
            "peerId": "+15551234567",
            "isGroup": false,
            "timestamp": "2026-01-01T00:00:00Z",
            "text": "",
        });
        let errors = validate_ingress(&base);
        assert_eq!(errors, vec!["text: may be empty only when media is present"]);

        let mut with_media = base.clone();
        with_media["media"] = json!([{"kind": "image", "ref": "/p.jpg"}]);
        assert!(validate_ingress(&with_media).is_empty());
    }

    #[test]
    fn egress_media_url_must_be_absolute() {
        let envelope = json!({
            "channel": "imessage",
            "conversationId": "chat999",
            "text": "",
            "media": [{"kind": "image", "url": "relative/path.jpg"}],
        });
        let errors = validate_egress(&envelope);
        assert!(errors.iter().any(|e| e.contains("not an absolute URL")));
    }

    #[test]
    fn egress_minimal_text_only_is_valid() {
        let envelope = json!({
            "channel": "imessage",
            "conversationId": "+15551234567",
            "text": "hello",
        });
        assert!(validate_egress(&envelope).is_empty());
    }

    #[test]
    fn ingress_serialization_is_camel_case() {
        let env = IngressEnvelope {
            channel: ChannelKind::Imessage,
            platform_message_id: "g-1".into(),
            conversation_id: "+15551234567".into(),
            peer_id: "+15551234567".into(),
            peer_display: None,
            text: "hi".into(),
            is_group: false,
            group_name: None,
            timestamp: Utc::now(),
            thread_id: None,
            reply_to_message_id: None,
            mentions: None,
            media: None,
        };
        let value = serde_json::to_value(&env).unwrap();
        assert!(value.get("platformMessageId").is_some());
        assert!(value.get("isGroup").is_some());
        // Optional absent fields are omitted, not null.
        assert!(value.get("groupName").is_none());
    }
}
