//! Periodic status push to the cloud.
//!
//! The first beat goes out immediately so the cloud marks the relay live
//! without waiting a full interval. A missed beat is logged and the loop
//! keeps going; only an expired device token aborts it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::channel::Channel;
use crate::error::RelayError;

use super::client::{RelayClient, RelayStatus};

pub async fn run_heartbeat_loop(
    client: Arc<RelayClient>,
    plugin: Arc<dyn Channel>,
    interval: Duration,
    started_at: Instant,
    cancel: CancellationToken,
) -> Result<(), RelayError> {
    loop {
        let platform_status = plugin.status();
        let status = RelayStatus::from(platform_status);
        let uptime_sec = started_at.elapsed().as_secs();

        match client.heartbeat(status, uptime_sec, platform_status).await {
            Ok(()) => debug!(?status, uptime_sec, "heartbeat sent"),
            Err(RelayError::DeviceTokenExpired) => return Err(RelayError::DeviceTokenExpired),
            Err(e) => warn!("heartbeat failed: {e}"),
        }

        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::DummyChannel;
    use crate::config::RelayConfig;
    use crate::envelope::ChannelKind;
    use chrono::{Duration as ChronoDuration, Utc};
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> Arc<RelayClient> {
        let relay = RelayConfig {
            channel: ChannelKind::Imessage,
            relay_id: "rly_1".into(),
            device_token: "dev-tok".into(),
            token_expires_at: Utc::now() + ChronoDuration::hours(1),
            heartbeat_interval_secs: 30,
            outbound_poll_interval_secs: 5,
        };
        Arc::new(RelayClient::new(&server.uri(), Duration::from_secs(5), &relay).unwrap())
    }

    #[tokio::test]
    async fn first_beat_is_immediate_and_reports_offline_platform() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/relays/rly_1/heartbeat"))
            .and(body_partial_json(serde_json::json!({
                "status": "offline",
                "platformStatus": "disconnected",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .expect(1..)
            .mount(&server)
            .await;

        let plugin = Arc::new(DummyChannel::new(ChannelKind::Imessage));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_heartbeat_loop(
            client_for(&server),
            plugin,
            Duration::from_secs(60),
            Instant::now(),
            cancel.clone(),
        ));

        // The first beat happens before any interval elapses.
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn transient_failure_does_not_abort() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .expect(2..)
            .mount(&server)
            .await;

        let plugin = Arc::new(DummyChannel::new(ChannelKind::Imessage));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_heartbeat_loop(
            client_for(&server),
            plugin,
            Duration::from_millis(50),
            Instant::now(),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(!handle.is_finished(), "loop must survive 5xx responses");
        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn token_expiry_aborts_loop() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let plugin = Arc::new(DummyChannel::new(ChannelKind::Imessage));
        let result = run_heartbeat_loop(
            client_for(&server),
            plugin,
            Duration::from_millis(50),
            Instant::now(),
            CancellationToken::new(),
        )
        .await;
        assert!(matches!(result, Err(RelayError::DeviceTokenExpired)));
    }
}
