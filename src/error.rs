//! Error taxonomy for the relay runtime.
//!
//! Loop-owning code (heartbeat, outbound poller, supervisor) matches on
//! [`RelayError`] to decide between retrying a tick, backing off the whole
//! session, or exiting. Everything below that layer stays `anyhow`.

use thiserror::Error;

/// Errors with a semantic role in the relay control flow.
#[derive(Debug, Error)]
pub enum RelayError {
    /// No stored user credentials — run `myndhyve-relay relay setup`.
    #[error("not authenticated — no stored credentials")]
    NotAuthenticated,

    /// The cloud rejected the device token (or it expired locally).
    /// Reconnection cannot heal this; the user must re-run setup.
    #[error("device token expired — run `myndhyve-relay relay setup` again")]
    DeviceTokenExpired,

    /// The channel cannot run on this host (e.g. iMessage off macOS).
    #[error("platform unsupported: {0}")]
    PlatformUnsupported(String),

    /// The channel plugin's own preconditions failed; user action required.
    #[error("platform not authenticated: {0}")]
    PlatformNotAuthenticated(String),

    /// Relay not configured yet, or the config is unusable.
    #[error("relay not configured: {0}")]
    NotConfigured(String),

    /// Network-level failure, 5xx or 429 — retried by the owning loop.
    #[error("transient: {0}")]
    Transient(String),

    /// The cloud returned an unexpected shape or a non-401 4xx.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl RelayError {
    /// Whether the supervisor should stop retrying when it sees this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RelayError::DeviceTokenExpired
                | RelayError::NotAuthenticated
                | RelayError::NotConfigured(_)
                | RelayError::PlatformUnsupported(_)
        )
    }
}

/// User-visible failure triple printed by the CLI layer.
///
/// Human mode prints `code: message` plus the suggestion; `--json` emits
/// the same triple as a JSON object.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ErrorReport {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl ErrorReport {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            suggestion: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

impl From<&RelayError> for ErrorReport {
    fn from(err: &RelayError) -> Self {
        let code = match err {
            RelayError::NotAuthenticated => "NOT_AUTHENTICATED",
            RelayError::DeviceTokenExpired => "DEVICE_TOKEN_EXPIRED",
            RelayError::PlatformUnsupported(_) => "PLATFORM_UNSUPPORTED",
            RelayError::PlatformNotAuthenticated(_) => "PLATFORM_NOT_AUTHENTICATED",
            RelayError::NotConfigured(_) => "NOT_CONFIGURED",
            RelayError::Transient(_) => "TRANSIENT",
            RelayError::Protocol(_) => "PROTOCOL_ERROR",
        };
        let report = ErrorReport::new(code, err.to_string());
        match err {
            RelayError::DeviceTokenExpired | RelayError::NotAuthenticated => {
                report.with_suggestion("Run `myndhyve-relay relay setup` to re-pair this device.")
            }
            RelayError::NotConfigured(_) => {
                report.with_suggestion("Run `myndhyve-relay relay setup` first.")
            }
            _ => report,
        }
    }
}
