pub mod args;
pub mod auth;
pub mod backoff;
pub mod channel;
pub mod channels;
pub mod commands;
pub mod config;
pub mod daemon;
pub mod doctor;
pub mod envelope;
pub mod error;
pub mod harness;
pub mod logging;
pub mod relay;
pub mod sse;

// Re-export the plugin contract at the crate root for convenience
pub use channel::{Channel, ChannelRegistry, ConnectionStatus, InboundHandler};
pub use envelope::{ChannelKind, EgressEnvelope, IngressEnvelope};
