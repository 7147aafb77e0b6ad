//! Channel plugin contract and registry.
//!
//! Every platform adapter implements [`Channel`]; the supervisor only ever
//! talks to the trait, never to a concrete platform. The registry is a
//! plain map built once in `main()` and threaded through — no global state.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::envelope::{ChannelKind, DeliveryResult, EgressEnvelope, IngressEnvelope};
use crate::error::RelayError;

// ── Connection status ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
        }
    }
}

/// Lock-free status word, written by the plugin's own task and read by the
/// heartbeat task.
#[derive(Debug, Default)]
pub struct StatusCell(AtomicU8);

impl StatusCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(0))
    }

    pub fn set(&self, status: ConnectionStatus) {
        let word = match status {
            ConnectionStatus::Disconnected => 0,
            ConnectionStatus::Connecting => 1,
            ConnectionStatus::Connected => 2,
        };
        self.0.store(word, Ordering::Release);
    }

    pub fn get(&self) -> ConnectionStatus {
        match self.0.load(Ordering::Acquire) {
            1 => ConnectionStatus::Connecting,
            2 => ConnectionStatus::Connected,
            _ => ConnectionStatus::Disconnected,
        }
    }
}

// ── Plugin contract ─────────────────────────────────────────────────────────

/// Callback invoked once per accepted inbound message, in source order.
/// The adapter awaits each call before reading the next message.
pub type InboundHandler =
    Arc<dyn Fn(IngressEnvelope) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Capability set every platform adapter implements.
#[async_trait]
pub trait Channel: Send + Sync {
    /// The tag this plugin registers under.
    fn kind(&self) -> ChannelKind;

    /// Human-readable platform name.
    fn display_name(&self) -> &str;

    /// Whether the platform can run on this host at all.
    fn is_supported(&self) -> bool {
        true
    }

    /// Why `is_supported` is false, when it is.
    fn unsupported_reason(&self) -> Option<String> {
        None
    }

    /// Verify platform preconditions (pairing, database access, ...).
    async fn login(&self) -> Result<(), RelayError>;

    /// Pure observation — no side effects, no network I/O.
    async fn is_authenticated(&self) -> bool;

    /// Pump inbound messages until cancelled or a fatal platform error.
    ///
    /// Must set status to `Connecting` before precondition checks,
    /// `Connected` once pumping, and reset to `Disconnected` on any exit.
    /// Cancellation via `cancel` is clean termination, not an error.
    async fn start(&self, on_inbound: InboundHandler, cancel: CancellationToken)
    -> anyhow::Result<()>;

    /// Deliver an egress envelope. Never errors — all failures are encoded
    /// in the result. Must not touch the platform when not connected.
    async fn deliver(&self, egress: &EgressEnvelope) -> DeliveryResult;

    /// Current connection status.
    fn status(&self) -> ConnectionStatus;

    /// Idempotent teardown; cancels a running `start` and clears state.
    async fn logout(&self);
}

/// Standard refusal when `deliver` is called while not connected.
pub fn not_connected_result(kind: ChannelKind) -> DeliveryResult {
    DeliveryResult::failed(format!("{kind} channel is not connected"), true)
}

// ── Registry ────────────────────────────────────────────────────────────────

/// Map from channel tag to plugin. Writes happen at startup only; the
/// registry is shared read-only afterwards.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: HashMap<ChannelKind, Arc<dyn Channel>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin. Last write wins for the same tag.
    pub fn register(&mut self, channel: Arc<dyn Channel>) {
        self.channels.insert(channel.kind(), channel);
    }

    pub fn get(&self, kind: ChannelKind) -> Option<Arc<dyn Channel>> {
        self.channels.get(&kind).cloned()
    }

    pub fn all(&self) -> Vec<Arc<dyn Channel>> {
        self.channels.values().cloned().collect()
    }

    /// Plugins that can actually run on this host.
    pub fn supported(&self) -> Vec<Arc<dyn Channel>> {
        self.channels
            .values()
            .filter(|c| c.is_supported())
            .cloned()
            .collect()
    }
}

// ── Dummy plugin ────────────────────────────────────────────────────────────

/// In-memory channel for tests and demonstration. Connects immediately,
/// records deliveries, and pumps nothing.
pub struct DummyChannel {
    kind: ChannelKind,
    supported: bool,
    authenticated: bool,
    status: StatusCell,
    delivered: tokio::sync::Mutex<Vec<EgressEnvelope>>,
}

impl DummyChannel {
    pub fn new(kind: ChannelKind) -> Self {
        Self {
            kind,
            supported: true,
            authenticated: true,
            status: StatusCell::new(),
            delivered: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn unsupported(kind: ChannelKind) -> Self {
        Self {
            supported: false,
            ..Self::new(kind)
        }
    }

    /// Envelopes delivered so far.
    pub async fn delivered(&self) -> Vec<EgressEnvelope> {
        self.delivered.lock().await.clone()
    }
}

#[async_trait]
impl Channel for DummyChannel {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    fn display_name(&self) -> &str {
        "Dummy"
    }

    fn is_supported(&self) -> bool {
        self.supported
    }

    fn unsupported_reason(&self) -> Option<String> {
        (!self.supported).then(|| "dummy channel marked unsupported".to_string())
    }

    async fn login(&self) -> Result<(), RelayError> {
        if self.authenticated {
            Ok(())
        } else {
            Err(RelayError::PlatformNotAuthenticated("dummy".into()))
        }
    }

    async fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    async fn start(
        &self,
        _on_inbound: InboundHandler,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        self.status.set(ConnectionStatus::Connecting);
        self.status.set(ConnectionStatus::Connected);
        cancel.cancelled().await;
        self.status.set(ConnectionStatus::Disconnected);
        Ok(())
    }

    async fn deliver(&self, egress: &EgressEnvelope) -> DeliveryResult {
        if self.status.get() != ConnectionStatus::Connected {
            return not_connected_result(self.kind);
        }
        self.delivered.lock().await.push(egress.clone());
        DeliveryResult::ok(None)
    }

    fn status(&self) -> ConnectionStatus {
        self.status.get()
    }

    async fn logout(&self) {
        self.status.set(ConnectionStatus::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_last_write_wins() {
        let mut registry = ChannelRegistry::new();
        registry.register(Arc::new(DummyChannel::new(ChannelKind::Imessage)));
        registry.register(Arc::new(DummyChannel::unsupported(ChannelKind::Imessage)));
        let plugin = registry.get(ChannelKind::Imessage).unwrap();
        assert!(!plugin.is_supported());
        assert_eq!(registry.all().len(), 1);
    }

    #[test]
    fn supported_filter() {
        let mut registry = ChannelRegistry::new();
        registry.register(Arc::new(DummyChannel::new(ChannelKind::Imessage)));
        registry.register(Arc::new(DummyChannel::unsupported(ChannelKind::Whatsapp)));
        let supported = registry.supported();
        assert_eq!(supported.len(), 1);
        assert_eq!(supported[0].kind(), ChannelKind::Imessage);
    }

    #[test]
    fn status_cell_round_trip() {
        let cell = StatusCell::new();
        assert_eq!(cell.get(), ConnectionStatus::Disconnected);
        cell.set(ConnectionStatus::Connecting);
        assert_eq!(cell.get(), ConnectionStatus::Connecting);
        cell.set(ConnectionStatus::Connected);
        assert_eq!(cell.get().as_str(), "connected");
    }

    #[tokio::test]
    async fn dummy_refuses_delivery_when_disconnected() {
        let plugin = DummyChannel::new(ChannelKind::Imessage);
        let result = plugin
            .deliver(&EgressEnvelope {
                channel: ChannelKind::Imessage,
                conversation_id: "+15551234567".into(),
                text: "hello".into(),
                thread_id: None,
                reply_to_message_id: None,
                media: None,
            })
            .await;
        assert!(!result.success);
        assert!(result.retryable);
        assert!(result.error.unwrap().contains("not connected"));
    }
}
