//! Outbound poller — claims queued replies from the cloud, hands them to
//! the channel plugin, and acks the outcome.
//!
//! Deliveries within one tick are sequential: parallel sends could
//! reorder messages inside a conversation. Acks are best-effort; a failed
//! ack is logged and the server's redelivery policy takes over.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::Channel;
use crate::error::RelayError;

use super::client::RelayClient;

const CLAIM_BATCH: u32 = 10;

pub async fn run_outbound_loop(
    client: Arc<RelayClient>,
    plugin: Arc<dyn Channel>,
    interval: Duration,
    cancel: CancellationToken,
) -> Result<(), RelayError> {
    loop {
        run_tick(&client, plugin.as_ref()).await?;

        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

/// One claim/deliver/ack pass. Only an expired device token errors out.
async fn run_tick(client: &RelayClient, plugin: &dyn Channel) -> Result<(), RelayError> {
    let items = match client.claim_outbound(CLAIM_BATCH).await {
        Ok(items) => items,
        Err(RelayError::DeviceTokenExpired) => return Err(RelayError::DeviceTokenExpired),
        Err(e) => {
            warn!("outbound claim failed: {e}");
            return Ok(());
        }
    };

    if items.is_empty() {
        return Ok(());
    }
    debug!(count = items.len(), "claimed outbound work");

    for item in &items {
        // The cloud should only queue work for the connected channel; a
        // mismatched tag is terminal, not worth a redelivery.
        let result = if item.envelope.channel != plugin.kind() {
            crate::envelope::DeliveryResult::failed(
                format!(
                    "work item targets {} but {} is connected",
                    item.envelope.channel,
                    plugin.kind()
                ),
                false,
            )
        } else {
            plugin.deliver(&item.envelope).await
        };
        if result.success {
            info!(work_id = %item.work_id, "delivered outbound message");
        } else {
            warn!(
                work_id = %item.work_id,
                retryable = result.retryable,
                "outbound delivery failed: {}",
                result.error.as_deref().unwrap_or("unknown")
            );
        }

        match client.ack_outbound(&item.work_id, &result).await {
            Ok(()) => {}
            Err(RelayError::DeviceTokenExpired) => return Err(RelayError::DeviceTokenExpired),
            Err(e) => warn!(work_id = %item.work_id, "ack failed: {e}"),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Channel, DummyChannel, InboundHandler};
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

    fn claim_body(items: serde_json::Value) -> serde_json::Value {
        serde_json::json!({ "items": items })
    }

    async fn connect(plugin: &Arc<DummyChannel>) -> CancellationToken {
        let cancel = CancellationToken::new();
        let p = plugin.clone();
        let c = cancel.clone();
        let noop: InboundHandler = Arc::new(|_| Box::pin(async { Ok(()) }));
        tokio::spawn(async move { p.start(noop, c).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel
    }

    #[tokio::test]
    async fn claims_delivers_and_acks_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/relays/rly_1/outbound/claim"))
            .respond_with(ResponseTemplate::new(200).set_body_json(claim_body(
                serde_json::json!([{
                    "workId": "w-1",
                    "attempt": 1,
                    "envelope": {
                        "channel": "imessage",
                        "conversationId": "+15551234567",
                        "text": "hello",
                    },
                }]),
            )))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/relays/rly_1/outbound/ack"))
            .and(body_partial_json(serde_json::json!({
                "workId": "w-1",
                "success": true,
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let plugin = Arc::new(DummyChannel::new(ChannelKind::Imessage));
        let cancel = connect(&plugin).await;

        run_tick(client_for(&server).as_ref(), plugin.as_ref())
            .await
            .unwrap();

        let delivered = plugin.delivered().await;
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].text, "hello");
        cancel.cancel();
    }

    #[tokio::test]
    async fn disconnected_plugin_acks_retryable_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/relays/rly_1/outbound/claim"))
            .respond_with(ResponseTemplate::new(200).set_body_json(claim_body(
                serde_json::json!([{
                    "workId": "w-2",
                    "attempt": 1,
                    "envelope": {
                        "channel": "imessage",
                        "conversationId": "+15551234567",
                        "text": "hello",
                    },
                }]),
            )))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/relays/rly_1/outbound/ack"))
            .and(body_partial_json(serde_json::json!({
                "workId": "w-2",
                "success": false,
                "retryable": true,
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .expect(1)
            .mount(&server)
            .await;

        // Never started: plugin stays disconnected, delivery refused.
        let plugin = Arc::new(DummyChannel::new(ChannelKind::Imessage));
        run_tick(client_for(&server).as_ref(), plugin.as_ref())
            .await
            .unwrap();
        assert!(plugin.delivered().await.is_empty());
    }

    #[tokio::test]
    async fn transient_claim_error_is_swallowed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let plugin = Arc::new(DummyChannel::new(ChannelKind::Imessage));
        run_tick(client_for(&server).as_ref(), plugin.as_ref())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn token_expiry_on_claim_aborts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        let plugin = Arc::new(DummyChannel::new(ChannelKind::Imessage));
        let result = run_tick(client_for(&server).as_ref(), plugin.as_ref()).await;
        assert!(matches!(result, Err(RelayError::DeviceTokenExpired)));
    }
}
