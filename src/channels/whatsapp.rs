//! WhatsApp channel stub.
//!
//! WhatsApp pairing is phone-bound (QR handshake through the mobile app)
//! and ships in the companion build; this build carries the contract so
//! the registry, setup flow, and dev tooling treat the tag uniformly.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::channel::{Channel, ConnectionStatus, InboundHandler};
use crate::envelope::{ChannelKind, DeliveryResult, EgressEnvelope};
use crate::error::RelayError;

const UNSUPPORTED_REASON: &str =
    "WhatsApp pairing is not available in this build — use the companion app";

pub struct WhatsappChannel;

#[async_trait]
impl Channel for WhatsappChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Whatsapp
    }

    fn display_name(&self) -> &str {
        "WhatsApp"
    }

    fn is_supported(&self) -> bool {
        false
    }

    fn unsupported_reason(&self) -> Option<String> {
        Some(UNSUPPORTED_REASON.to_string())
    }

    async fn login(&self) -> Result<(), RelayError> {
        Err(RelayError::PlatformUnsupported(UNSUPPORTED_REASON.into()))
    }

    async fn is_authenticated(&self) -> bool {
        false
    }

    async fn start(
        &self,
        _on_inbound: InboundHandler,
        _cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        anyhow::bail!(UNSUPPORTED_REASON)
    }

    async fn deliver(&self, _egress: &EgressEnvelope) -> DeliveryResult {
        DeliveryResult::failed(UNSUPPORTED_REASON, false)
    }

    fn status(&self) -> ConnectionStatus {
        ConnectionStatus::Disconnected
    }

    async fn logout(&self) {}
}
