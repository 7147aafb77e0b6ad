//! Typed client for the cloud control plane.
//!
//! Every call is bounded by the configured timeout and carries bearer
//! auth — the device token for control calls, the end-user token for the
//! one-time registration. The client knows the device token's expiry and
//! refuses to make calls past it without touching the network.

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use std::time::Duration;

use crate::channel::ConnectionStatus;
use crate::config::RelayConfig;
use crate::envelope::{ChannelKind, DeliveryResult, IngressEnvelope, OutboundWork};
use crate::error::RelayError;

// ── Wire shapes ─────────────────────────────────────────────────────────────

/// Returned by `register`; the activation code is short-lived.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub relay_id: String,
    pub activation_code: String,
}

/// Returned by `activate`; single-use exchange of the activation code.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activation {
    pub device_token: String,
    pub token_expires_at: DateTime<Utc>,
    pub heartbeat_interval_seconds: u64,
    pub outbound_poll_interval_seconds: u64,
}

/// Agent-level status reported on each heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayStatus {
    Connected,
    Degraded,
    Offline,
}

impl From<ConnectionStatus> for RelayStatus {
    fn from(status: ConnectionStatus) -> Self {
        match status {
            ConnectionStatus::Connected => RelayStatus::Connected,
            ConnectionStatus::Disconnected => RelayStatus::Offline,
            ConnectionStatus::Connecting => RelayStatus::Degraded,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HeartbeatBody<'a> {
    status: RelayStatus,
    uptime_sec: u64,
    platform_status: &'a str,
}

#[derive(Debug, Deserialize)]
struct ClaimResponse {
    #[serde(default)]
    items: Vec<OutboundWork>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AckBody<'a> {
    work_id: &'a str,
    #[serde(flatten)]
    result: &'a DeliveryResult,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterBody<'a> {
    channel: ChannelKind,
    label: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ActivateBody<'a> {
    activation_code: &'a str,
    cli_version: &'a str,
    device_meta: DeviceMeta,
}

/// Host details sent with activation so the cloud can label the device.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceMeta {
    pub hostname: String,
    pub os: String,
    pub arch: String,
}

impl DeviceMeta {
    pub fn current() -> Self {
        Self {
            hostname: hostname_lossy(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        }
    }
}

fn hostname_lossy() -> String {
    sysinfo::System::host_name().unwrap_or_else(|| "unknown".to_string())
}

// ── Setup calls (end-user token) ────────────────────────────────────────────

fn http_client(timeout: Duration) -> Result<reqwest::Client, RelayError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| RelayError::Transient(format!("http client: {e}")))
}

/// Create a relay registration. The user's credential proves ownership.
pub async fn register(
    base_url: &str,
    timeout: Duration,
    channel: ChannelKind,
    label: &str,
    user_token: &str,
) -> Result<Registration, RelayError> {
    let http = http_client(timeout)?;
    let url = format!("{}/v1/relays", base_url.trim_end_matches('/'));
    let resp = http
        .post(&url)
        .bearer_auth(user_token)
        .json(&RegisterBody { channel, label })
        .send()
        .await
        .map_err(map_send_error)?;
    decode(resp).await
}

/// Exchange the activation code for a device token. Single-use.
pub async fn activate(
    base_url: &str,
    timeout: Duration,
    relay_id: &str,
    activation_code: &str,
    cli_version: &str,
) -> Result<Activation, RelayError> {
    let http = http_client(timeout)?;
    let url = format!(
        "{}/v1/relays/{}/activate",
        base_url.trim_end_matches('/'),
        relay_id
    );
    let resp = http
        .post(&url)
        .json(&ActivateBody {
            activation_code,
            cli_version,
            device_meta: DeviceMeta::current(),
        })
        .send()
        .await
        .map_err(map_send_error)?;
    decode(resp).await
}

// ── Control-plane client (device token) ─────────────────────────────────────

pub struct RelayClient {
    http: reqwest::Client,
    base_url: String,
    relay_id: String,
    device_token: String,
    token_expires_at: DateTime<Utc>,
}

impl RelayClient {
    pub fn new(base_url: &str, timeout: Duration, relay: &RelayConfig) -> Result<Self, RelayError> {
        Ok(Self {
            http: http_client(timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            relay_id: relay.relay_id.clone(),
            device_token: relay.device_token.clone(),
            token_expires_at: relay.token_expires_at,
        })
    }

    pub fn relay_id(&self) -> &str {
        &self.relay_id
    }

    fn endpoint(&self, suffix: &str) -> String {
        format!("{}/v1/relays/{}/{}", self.base_url, self.relay_id, suffix)
    }

    /// Local expiry gate — no call is attempted with a token known to be
    /// dead; reconnection cannot heal it.
    fn check_token(&self) -> Result<(), RelayError> {
        if self.token_expires_at <= Utc::now() {
            return Err(RelayError::DeviceTokenExpired);
        }
        Ok(())
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        suffix: &str,
        body: &B,
    ) -> Result<T, RelayError> {
        self.check_token()?;
        let resp = self
            .http
            .post(self.endpoint(suffix))
            .bearer_auth(&self.device_token)
            .json(body)
            .send()
            .await
            .map_err(map_send_error)?;
        decode(resp).await
    }

    /// Push agent status; the cloud uses this as the liveness signal.
    pub async fn heartbeat(
        &self,
        status: RelayStatus,
        uptime_sec: u64,
        platform_status: ConnectionStatus,
    ) -> Result<(), RelayError> {
        let _: serde_json::Value = self
            .post(
                "heartbeat",
                &HeartbeatBody {
                    status,
                    uptime_sec,
                    platform_status: platform_status.as_str(),
                },
            )
            .await?;
        Ok(())
    }

    /// Forward an inbound envelope. At-least-once from this side; the
    /// cloud dedupes on `platformMessageId`.
    pub async fn send_inbound(&self, envelope: &IngressEnvelope) -> Result<(), RelayError> {
        let _: serde_json::Value = self.post("inbound", envelope).await?;
        Ok(())
    }

    /// Claim up to `max` queued outbound work items.
    pub async fn claim_outbound(&self, max: u32) -> Result<Vec<OutboundWork>, RelayError> {
        let resp: ClaimResponse = self
            .post("outbound/claim", &serde_json::json!({ "max": max }))
            .await?;
        Ok(resp.items)
    }

    /// Complete a work item with the plugin's delivery result.
    pub async fn ack_outbound(
        &self,
        work_id: &str,
        result: &DeliveryResult,
    ) -> Result<(), RelayError> {
        let _: serde_json::Value = self
            .post("outbound/ack", &AckBody { work_id, result })
            .await?;
        Ok(())
    }
}

// ── Error mapping ───────────────────────────────────────────────────────────

fn map_send_error(err: reqwest::Error) -> RelayError {
    RelayError::Transient(format!("request failed: {err}"))
}

async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, RelayError> {
    let status = resp.status();
    if status == StatusCode::UNAUTHORIZED {
        return Err(RelayError::DeviceTokenExpired);
    }
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        return Err(RelayError::Transient(format!("cloud returned {status}")));
    }
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(RelayError::Protocol(format!(
            "cloud returned {status}: {body}"
        )));
    }
    resp.json()
        .await
        .map_err(|e| RelayError::Protocol(format!("undecodable response: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use wiremock::matchers::{bearer_token, body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn relay_config(expires_in_hours: i64) -> RelayConfig {
        RelayConfig {
            channel: ChannelKind::Imessage,
            relay_id: "rly_1".into(),
            device_token: "dev-tok".into(),
            token_expires_at: Utc::now() + ChronoDuration::hours(expires_in_hours),
            heartbeat_interval_secs: 30,
            outbound_poll_interval_secs: 5,
        }
    }

    fn client(server: &MockServer) -> RelayClient {
        RelayClient::new(&server.uri(), Duration::from_secs(5), &relay_config(1)).unwrap()
    }

    #[tokio::test]
    async fn expired_token_fails_locally() {
        // No mock mounted: a network attempt would error differently.
        let server = MockServer::start().await;
        let client =
            RelayClient::new(&server.uri(), Duration::from_secs(5), &relay_config(-1)).unwrap();
        let err = client
            .heartbeat(RelayStatus::Connected, 10, ConnectionStatus::Connected)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::DeviceTokenExpired));
    }

    #[tokio::test]
    async fn heartbeat_posts_bearer_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/relays/rly_1/heartbeat"))
            .and(bearer_token("dev-tok"))
            .and(body_partial_json(serde_json::json!({
                "status": "connected",
                "platformStatus": "connected",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        client(&server)
            .heartbeat(RelayStatus::Connected, 42, ConnectionStatus::Connected)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unauthorized_maps_to_token_expired() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        let err = client(&server).claim_outbound(10).await.unwrap_err();
        assert!(matches!(err, RelayError::DeviceTokenExpired));
    }

    #[tokio::test]
    async fn server_errors_are_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let err = client(&server).claim_outbound(10).await.unwrap_err();
        assert!(matches!(err, RelayError::Transient(_)));
    }

    #[tokio::test]
    async fn other_4xx_is_protocol_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(422).set_body_string("bad envelope"))
            .mount(&server)
            .await;
        let err = client(&server).claim_outbound(10).await.unwrap_err();
        assert!(matches!(err, RelayError::Protocol(_)));
    }

    #[tokio::test]
    async fn claim_decodes_work_items() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/relays/rly_1/outbound/claim"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [{
                    "workId": "w-1",
                    "attempt": 1,
                    "envelope": {
                        "channel": "imessage",
                        "conversationId": "+15551234567",
                        "text": "hello",
                    },
                }],
            })))
            .mount(&server)
            .await;

        let items = client(&server).claim_outbound(10).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].work_id, "w-1");
        assert_eq!(items[0].envelope.text, "hello");
    }

    #[test]
    fn platform_status_maps_to_relay_status() {
        assert_eq!(
            RelayStatus::from(ConnectionStatus::Connected),
            RelayStatus::Connected
        );
        assert_eq!(
            RelayStatus::from(ConnectionStatus::Disconnected),
            RelayStatus::Offline
        );
        assert_eq!(
            RelayStatus::from(ConnectionStatus::Connecting),
            RelayStatus::Degraded
        );
    }
}
