//! Typed configuration and credentials, stored under `~/.myndhyve-cli/`.
//!
//! The on-disk layout is shared with the companion CLI, so everything is
//! camelCase JSON. Files carrying secrets are written with owner-only
//! permissions.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::envelope::ChannelKind;

/// Directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".myndhyve-cli";

pub const CONFIG_FILE: &str = "config.json";
pub const CREDENTIALS_FILE: &str = "credentials.json";
pub const PID_FILE: &str = "daemon.pid";
pub const LOG_FILE: &str = "daemon.log";

/// Resolve the config directory: `$MYNDHYVE_CONFIG_DIR` override, else
/// `<home>/.myndhyve-cli`.
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("MYNDHYVE_CONFIG_DIR") {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    home.join(CONFIG_DIR_NAME)
}

// ── Config ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub cloud: CloudConfig,
    /// Present once `relay setup` has completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relay: Option<RelayConfig>,
    pub imessage: ImessageConfig,
    pub backoff: BackoffSettings,
    /// A session that stays up longer than this resets the reconnection
    /// attempt counter.
    pub stable_session_reset_secs: u64,
    /// Project context selected in the companion CLI; informational here.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_project: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cloud: CloudConfig::default(),
            relay: None,
            imessage: ImessageConfig::default(),
            backoff: BackoffSettings::default(),
            stable_session_reset_secs: 60,
            active_project: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CloudConfig {
    pub base_url: String,
    /// Timeout for control-plane calls, seconds.
    pub request_timeout_secs: u64,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            base_url: "https://relay.myndhyve.com".to_string(),
            request_timeout_secs: 15,
        }
    }
}

/// Registration and device identity persisted by `relay setup`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayConfig {
    pub channel: ChannelKind,
    pub relay_id: String,
    pub device_token: String,
    pub token_expires_at: DateTime<Utc>,
    pub heartbeat_interval_secs: u64,
    pub outbound_poll_interval_secs: u64,
}

impl RelayConfig {
    /// A token whose expiry is in the past is treated as absent.
    pub fn token_is_valid(&self) -> bool {
        self.token_expires_at > Utc::now()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImessageConfig {
    /// Override for the Messages database path (defaults to
    /// `~/Library/Messages/chat.db`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_path: Option<PathBuf>,
    pub poll_interval_ms: u64,
    /// Rows read per poll tick.
    pub batch_size: u32,
}

impl Default for ImessageConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            poll_interval_ms: 2000,
            batch_size: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackoffSettings {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub factor: f64,
    pub jitter: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            initial_ms: 1000,
            max_ms: 30_000,
            factor: 2.0,
            jitter: 0.2,
            max_attempts: Some(10),
        }
    }
}

impl From<&BackoffSettings> for crate::backoff::BackoffPolicy {
    fn from(settings: &BackoffSettings) -> Self {
        Self {
            initial: std::time::Duration::from_millis(settings.initial_ms),
            max: std::time::Duration::from_millis(settings.max_ms),
            factor: settings.factor,
            jitter: settings.jitter,
            max_attempts: settings.max_attempts,
        }
    }
}

impl Config {
    /// Load `config.json` from the given directory; a missing file yields
    /// the defaults.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid config at {}", path.display()))
    }

    /// Persist to `config.json` with owner-only permissions.
    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        let path = dir.join(CONFIG_FILE);
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        restrict_permissions(&path)?;
        Ok(())
    }

    /// The relay section, with an expired token treated as unconfigured.
    pub fn active_relay(&self) -> Option<&RelayConfig> {
        self.relay.as_ref().filter(|r| r.token_is_valid())
    }
}

// ── Credentials ─────────────────────────────────────────────────────────────

/// End-user auth credential persisted by the companion CLI's login flow.
/// This agent only reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub id_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

impl Credentials {
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

/// Read `credentials.json`; `Ok(None)` when the file does not exist.
pub fn load_credentials(dir: &Path) -> Result<Option<Credentials>> {
    let path = dir.join(CREDENTIALS_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let creds = serde_json::from_str(&content)
        .with_context(|| format!("Invalid credentials at {}", path.display()))?;
    Ok(Some(creds))
}

/// Chmod a file to 0600 on Unix; no-op elsewhere.
pub fn restrict_permissions(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms)
            .with_context(|| format!("Failed to chmod {}", path.display()))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}
