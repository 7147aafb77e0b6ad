//! Platform adapters implementing the [`Channel`](crate::channel::Channel)
//! contract.

mod imessage;
mod signal;
mod whatsapp;

pub use imessage::{
    AttachmentRow, ChatDb, ImessageChannel, MessageRow, MessageSender, OsaScriptSender, SendError,
    apple_ns_to_utc, normalize_row, poll_once,
};
pub use signal::SignalChannel;
pub use whatsapp::WhatsappChannel;

use std::sync::Arc;

use crate::channel::ChannelRegistry;
use crate::config::Config;

/// Build the process-wide registry with every built-in adapter.
pub fn default_registry(config: &Config) -> ChannelRegistry {
    let mut registry = ChannelRegistry::new();
    registry.register(Arc::new(ImessageChannel::new(&config.imessage)));
    registry.register(Arc::new(WhatsappChannel));
    registry.register(Arc::new(SignalChannel));
    registry
}
