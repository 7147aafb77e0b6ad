//! Composable health checks behind `dev doctor`.
//!
//! Each check is an independent probe; one failing never prevents the
//! rest from running, and the ordering is stable so output diffs cleanly
//! between runs.

use std::path::Path;
use std::time::Duration;

use serde::Serialize;

use crate::config::{self, CONFIG_FILE, CREDENTIALS_FILE, Config};

/// Oldest binary version the cloud still accepts.
const MIN_SUPPORTED_VERSION: &str = "0.4.0";

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DoctorCheck {
    pub name: String,
    pub ok: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fix: Option<String>,
}

impl DoctorCheck {
    fn pass(name: &str, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ok: true,
            message: message.into(),
            fix: None,
        }
    }

    fn fail(name: &str, message: impl Into<String>, fix: Option<&str>) -> Self {
        Self {
            name: name.into(),
            ok: false,
            message: message.into(),
            fix: fix.map(String::from),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DoctorReport {
    pub version: String,
    pub checks: Vec<DoctorCheck>,
    pub passed: usize,
    pub failed: usize,
}

impl DoctorReport {
    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }
}

/// Run every check against the given config directory.
pub async fn run_doctor(config_dir: &Path, cloud_base_url: &str) -> DoctorReport {
    let checks = vec![
        check_version(),
        check_config_dir(config_dir),
        check_config_file(config_dir),
        check_auth(config_dir),
        check_credentials_file(config_dir),
        check_relay_configured(config_dir),
        check_project_context(config_dir),
        check_cloud_reachable(cloud_base_url).await,
    ];

    let passed = checks.iter().filter(|c| c.ok).count();
    let failed = checks.len() - passed;
    DoctorReport {
        version: VERSION.to_string(),
        checks,
        passed,
        failed,
    }
}

fn parse_version(v: &str) -> Option<(u64, u64, u64)> {
    let mut parts = v.split('.').map(|p| p.parse::<u64>().ok());
    Some((parts.next()??, parts.next()??, parts.next()??))
}

fn check_version() -> DoctorCheck {
    match (parse_version(VERSION), parse_version(MIN_SUPPORTED_VERSION)) {
        (Some(current), Some(min)) if current >= min => DoctorCheck::pass(
            "version",
            format!("{VERSION} (minimum supported: {MIN_SUPPORTED_VERSION})"),
        ),
        (Some(_), Some(_)) => DoctorCheck::fail(
            "version",
            format!("{VERSION} is older than the minimum supported {MIN_SUPPORTED_VERSION}"),
            Some("Update myndhyve-relay to the latest release."),
        ),
        _ => DoctorCheck::fail("version", format!("unparseable version {VERSION}"), None),
    }
}

fn check_config_dir(dir: &Path) -> DoctorCheck {
    if dir.is_dir() {
        DoctorCheck::pass("config-dir", dir.display().to_string())
    } else {
        DoctorCheck::fail(
            "config-dir",
            format!("{} does not exist", dir.display()),
            Some("Run `myndhyve-relay relay setup` to create it."),
        )
    }
}

fn check_config_file(dir: &Path) -> DoctorCheck {
    let path = dir.join(CONFIG_FILE);
    if !path.exists() {
        return DoctorCheck::pass("config", "no config.json — using defaults");
    }
    match Config::load(dir) {
        Ok(_) => DoctorCheck::pass("config", "config.json is valid"),
        Err(e) => DoctorCheck::fail(
            "config",
            format!("config.json is invalid: {e:#}"),
            Some("Fix or delete config.json and re-run setup."),
        ),
    }
}

fn check_auth(dir: &Path) -> DoctorCheck {
    if std::env::var("MYNDHYVE_ID_TOKEN").is_ok_and(|t| !t.is_empty()) {
        return DoctorCheck::pass("auth", "using token from MYNDHYVE_ID_TOKEN");
    }
    match config::load_credentials(dir) {
        Ok(Some(creds)) if !creds.is_expired() => {
            DoctorCheck::pass("auth", "stored credentials are valid")
        }
        Ok(Some(_)) => DoctorCheck::fail(
            "auth",
            "stored credentials are expired",
            Some("Log in again with the MyndHyve CLI."),
        ),
        Ok(None) => DoctorCheck::fail(
            "auth",
            "not logged in",
            Some("Log in with the MyndHyve CLI before setting up the relay."),
        ),
        Err(e) => DoctorCheck::fail("auth", format!("{e:#}"), None),
    }
}

fn check_credentials_file(dir: &Path) -> DoctorCheck {
    let path = dir.join(CREDENTIALS_FILE);
    if !path.exists() {
        return DoctorCheck::pass("credentials", "no credentials.json");
    }
    match config::load_credentials(dir) {
        Ok(Some(creds)) if !creds.is_expired() => {
            DoctorCheck::pass("credentials", "credentials.json is valid")
        }
        Ok(Some(_)) => DoctorCheck::fail(
            "credentials",
            "credentials.json holds an expired token",
            Some("Log in again with the MyndHyve CLI."),
        ),
        Ok(None) => DoctorCheck::pass("credentials", "no credentials.json"),
        Err(e) => DoctorCheck::fail(
            "credentials",
            format!("credentials.json is unreadable: {e:#}"),
            Some("Delete credentials.json and log in again."),
        ),
    }
}

fn check_relay_configured(dir: &Path) -> DoctorCheck {
    match Config::load(dir) {
        Ok(config) => match config.relay {
            Some(relay) if relay.token_is_valid() => DoctorCheck::pass(
                "relay",
                format!("configured for {} (relay {})", relay.channel, relay.relay_id),
            ),
            Some(_) => DoctorCheck::fail(
                "relay",
                "device token has expired",
                Some("Run `myndhyve-relay relay setup` again."),
            ),
            None => DoctorCheck::fail(
                "relay",
                "relay is not configured",
                Some("Run `myndhyve-relay relay setup`."),
            ),
        },
        Err(e) => DoctorCheck::fail("relay", format!("{e:#}"), None),
    }
}

fn check_project_context(dir: &Path) -> DoctorCheck {
    match Config::load(dir) {
        Ok(config) => match config.active_project {
            Some(project) => DoctorCheck::pass("project", format!("active project: {project}")),
            None => DoctorCheck::pass("project", "no active project (ok)"),
        },
        Err(_) => DoctorCheck::pass("project", "no active project (ok)"),
    }
}

/// Any HTTP status counts as reachable — only a network-level failure is
/// a fail.
async fn check_cloud_reachable(base_url: &str) -> DoctorCheck {
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
    {
        Ok(c) => c,
        Err(e) => return DoctorCheck::fail("cloud", format!("{e}"), None),
    };
    match client.head(base_url).send().await {
        Ok(resp) => DoctorCheck::pass(
            "cloud",
            format!("{} reachable ({})", base_url, resp.status()),
        ),
        Err(e) => DoctorCheck::fail(
            "cloud",
            format!("{base_url} unreachable: {e}"),
            Some("Check your network connection."),
        ),
    }
}
