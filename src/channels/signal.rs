//! Signal channel stub.
//!
//! Signal requires linking as a secondary device through the phone app;
//! that transport lives in the companion build. The contract is carried
//! here so the tag stays first-class everywhere else.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::channel::{Channel, ConnectionStatus, InboundHandler};
use crate::envelope::{ChannelKind, DeliveryResult, EgressEnvelope};
use crate::error::RelayError;

const UNSUPPORTED_REASON: &str =
    "Signal device linking is not available in this build — use the companion app";

pub struct SignalChannel;

#[async_trait]
impl Channel for SignalChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Signal
    }

    fn display_name(&self) -> &str {
        "Signal"
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
