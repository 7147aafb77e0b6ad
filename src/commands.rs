//! Command handlers behind the thin clap surface in `main.rs`.
//!
//! Every handler returns a process exit code following the shared
//! convention: 0 success, 1 general error, 2 usage error, 3 not-found,
//! 4 unauthorized, 130 interrupted.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use colored::Colorize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::args::CommonArgs;
use crate::auth::AuthSession;
use crate::channels;
use crate::config::{Config, RelayConfig};
use crate::daemon;
use crate::doctor;
use crate::envelope::ChannelKind;
use crate::error::{ErrorReport, RelayError};
use crate::harness::{self, TestEnvelopeParams};
use crate::relay;

pub const EXIT_OK: i32 = 0;
pub const EXIT_ERROR: i32 = 1;
pub const EXIT_USAGE: i32 = 2;
pub const EXIT_NOT_FOUND: i32 = 3;
pub const EXIT_UNAUTHORIZED: i32 = 4;
pub const EXIT_SIGINT: i32 = 130;

// ── Output helpers ──────────────────────────────────────────────────────────

fn print_error(report: &ErrorReport, common: &CommonArgs) {
    if common.json {
        println!("{}", serde_json::to_string(report).unwrap_or_default());
        return;
    }
    eprintln!("{} {}", report.code.red().bold(), report.message);
    if let Some(fix) = &report.suggestion {
        eprintln!("  {}", fix.dimmed());
    }
}

fn fail(report: ErrorReport, common: &CommonArgs, code: i32) -> i32 {
    print_error(&report, common);
    code
}

fn relay_error_exit(err: &RelayError) -> i32 {
    match err {
        RelayError::NotAuthenticated | RelayError::DeviceTokenExpired => EXIT_UNAUTHORIZED,
        _ => EXIT_ERROR,
    }
}

// ── relay setup ─────────────────────────────────────────────────────────────

/// Register this machine with the cloud and exchange the activation code
/// for a device token.
pub async fn relay_setup(common: &CommonArgs, channel: ChannelKind, label: Option<String>) -> i32 {
    let dir = common.config_dir();
    let mut config = match Config::load(&dir) {
        Ok(c) => c,
        Err(e) => {
            return fail(
                ErrorReport::new("CONFIG_INVALID", format!("{e:#}")),
                common,
                EXIT_ERROR,
            );
        }
    };

    let auth = AuthSession::new(dir.clone(), &config.cloud.base_url);
    let user_token = match auth.user_token().await {
        Ok(t) => t,
        Err(e) => return fail(ErrorReport::from(&e), common, relay_error_exit(&e)),
    };

    let timeout = Duration::from_secs(config.cloud.request_timeout_secs);
    let label = label
        .unwrap_or_else(|| sysinfo::System::host_name().unwrap_or_else(|| "my-machine".to_string()));

    let registration = match relay::register(
        &config.cloud.base_url,
        timeout,
        channel,
        &label,
        &user_token,
    )
    .await
    {
        Ok(r) => r,
        Err(RelayError::DeviceTokenExpired) => {
            // On the register call the bearer is the user token.
            let e = RelayError::NotAuthenticated;
            return fail(ErrorReport::from(&e), common, EXIT_UNAUTHORIZED);
        }
        Err(e) => return fail(ErrorReport::from(&e), common, relay_error_exit(&e)),
    };

    let activation = match relay::activate(
        &config.cloud.base_url,
        timeout,
        &registration.relay_id,
        &registration.activation_code,
        doctor::VERSION,
    )
    .await
    {
        Ok(a) => a,
        Err(e) => return fail(ErrorReport::from(&e), common, relay_error_exit(&e)),
    };

    config.relay = Some(RelayConfig {
        channel,
        relay_id: registration.relay_id.clone(),
        device_token: activation.device_token,
        token_expires_at: activation.token_expires_at,
        heartbeat_interval_secs: activation.heartbeat_interval_seconds,
        outbound_poll_interval_secs: activation.outbound_poll_interval_seconds,
    });
    if let Err(e) = config.save(&dir) {
        return fail(
            ErrorReport::new("CONFIG_WRITE", format!("{e:#}")),
            common,
            EXIT_ERROR,
        );
    }

    if common.json {
        println!(
            "{}",
            serde_json::json!({ "relayId": registration.relay_id, "channel": channel })
        );
    } else if !common.quiet {
        println!(
            "{} Relay {} registered for {}",
            "✓".green(),
            registration.relay_id.bold(),
            channel
        );
        println!("  Start it with: myndhyve-relay relay start --daemon");
    }
    EXIT_OK
}

// ── relay start ─────────────────────────────────────────────────────────────

/// `daemon_child` marks the re-executed `--foreground` child: it owns the
/// PID file written by `daemon::spawn` and must clear it on exit so a
/// fatal error does not leave a stale PID behind.
pub async fn relay_start(common: &CommonArgs, as_daemon: bool, daemon_child: bool) -> i32 {
    let dir = common.config_dir();

    if as_daemon {
        return match daemon::spawn(&dir, common.verbose) {
            Ok(pid) => {
                if !common.quiet {
                    println!("{} Relay daemon started (PID {pid})", "✓".green());
                    println!("  Logs: {}", daemon::log_path(&dir).display());
                }
                EXIT_OK
            }
            Err(e) => fail(
                ErrorReport::new("DAEMON_SPAWN", format!("{e:#}")),
                common,
                EXIT_ERROR,
            ),
        };
    }

    let config = match Config::load(&dir) {
        Ok(c) => c,
        Err(e) => {
            return fail(
                ErrorReport::new("CONFIG_INVALID", format!("{e:#}")),
                common,
                EXIT_ERROR,
            );
        }
    };
    let registry = channels::default_registry(&config);

    // Root cancellation: Ctrl+C and, on Unix, SIGTERM from `relay stop`.
    let cancel = CancellationToken::new();
    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        let interrupted = interrupted.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            interrupted.store(true, Ordering::SeqCst);
            cancel.cancel();
        });
    }
    #[cfg(unix)]
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            use tokio::signal::unix::{SignalKind, signal};
            if let Ok(mut sig) = signal(SignalKind::terminate()) {
                sig.recv().await;
                cancel.cancel();
            }
        });
    }

    if daemon_child {
        info!(pid = std::process::id(), "running as daemon child");
    }

    let code = match relay::run(&config, &registry, cancel).await {
        Ok(()) => {
            info!("relay stopped");
            if interrupted.load(Ordering::SeqCst) {
                EXIT_SIGINT
            } else {
                EXIT_OK
            }
        }
        Err(e) => fail(ErrorReport::from(&e), common, EXIT_ERROR),
    };

    if daemon_child {
        daemon::remove_pid(&dir);
    }
    code
}

// ── relay stop / status ─────────────────────────────────────────────────────

pub fn relay_stop(common: &CommonArgs) -> i32 {
    let dir = common.config_dir();
    match daemon::stop(&dir) {
        Ok(daemon::StopResult::Stopped { pid }) => {
            if !common.quiet {
                println!("{} Stopped relay daemon (PID {pid})", "✓".green());
            }
            EXIT_OK
        }
        Ok(daemon::StopResult::WasStale { pid }) => {
            if !common.quiet {
                println!("Removed stale PID file (process {pid} is gone)");
            }
            EXIT_OK
        }
        Ok(daemon::StopResult::WasNotRunning) => {
            if !common.quiet {
                println!("Relay daemon is not running");
            }
            EXIT_OK
        }
        Err(e) => fail(
            ErrorReport::new("DAEMON_STOP", format!("{e:#}")),
            common,
            EXIT_ERROR,
        ),
    }
}

pub fn relay_status(common: &CommonArgs) -> i32 {
    let dir = common.config_dir();
    let config = Config::load(&dir).unwrap_or_default();
    let pid = daemon::daemon_pid(&dir);

    if common.json {
        let status = serde_json::json!({
            "configured": config.relay.is_some(),
            "relayId": config.relay.as_ref().map(|r| r.relay_id.clone()),
            "channel": config.relay.as_ref().map(|r| r.channel),
            "tokenValid": config.relay.as_ref().map(|r| r.token_is_valid()),
            "daemonPid": pid,
        });
        println!("{status}");
        return EXIT_OK;
    }

    match &config.relay {
        Some(relay) => {
            println!("Relay:   {} ({})", relay.relay_id.bold(), relay.channel);
            if relay.token_is_valid() {
                println!("Token:   valid until {}", relay.token_expires_at);
            } else {
                println!("Token:   {}", "expired — run `relay setup`".red());
            }
        }
        None => println!("Relay:   {}", "not configured".yellow()),
    }
    match pid {
        Some(pid) => println!("Daemon:  {} (PID {pid})", "running".green()),
        None => println!("Daemon:  not running"),
    }
    EXIT_OK
}

// ── dev commands ────────────────────────────────────────────────────────────

pub async fn dev_doctor(common: &CommonArgs) -> i32 {
    let dir = common.config_dir();
    let config = Config::load(&dir).unwrap_or_default();
    let report = doctor::run_doctor(&dir, &config.cloud.base_url).await;

    if common.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).unwrap_or_default()
        );
    } else {
        println!("myndhyve-relay {}", report.version);
        for check in &report.checks {
            let mark = if check.ok { "✓".green() } else { "✗".red() };
            println!("{mark} {:12} {}", check.name, check.message);
            if let Some(fix) = &check.fix {
                println!("  {}", fix.dimmed());
            }
        }
        println!("{} passed, {} failed", report.passed, report.failed);
    }

    if report.all_passed() { EXIT_OK } else { EXIT_ERROR }
}

pub async fn dev_ping(common: &CommonArgs) -> i32 {
    let dir = common.config_dir();
    let config = Config::load(&dir).unwrap_or_default();
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
    {
        Ok(c) => c,
        Err(e) => return fail(ErrorReport::new("PING", e.to_string()), common, EXIT_ERROR),
    };
    match client.head(&config.cloud.base_url).send().await {
        Ok(resp) => {
            if !common.quiet {
                println!(
                    "{} {} ({})",
                    "✓".green(),
                    config.cloud.base_url,
                    resp.status()
                );
            }
            EXIT_OK
        }
        Err(e) => fail(
            ErrorReport::new("UNREACHABLE", format!("{}: {e}", config.cloud.base_url)),
            common,
            EXIT_ERROR,
        ),
    }
}

pub fn dev_envelope_create(
    common: &CommonArgs,
    channel: &str,
    text: String,
    peer_id: Option<String>,
    conversation_id: Option<String>,
    is_group: bool,
    group_name: Option<String>,
) -> i32 {
    let Ok(channel) = channel.parse::<ChannelKind>() else {
        return fail(
            ErrorReport::new("BAD_CHANNEL", format!("unknown channel: {channel}")),
            common,
            EXIT_USAGE,
        );
    };
    let envelope = harness::create_test_envelope(
        channel,
        TestEnvelopeParams {
            text,
            peer_id,
            conversation_id,
            is_group,
            group_name,
        },
    );
    println!(
        "{}",
        serde_json::to_string_pretty(&envelope).unwrap_or_default()
    );
    EXIT_OK
}

pub fn dev_envelope_validate(common: &CommonArgs, file: &Path) -> i32 {
    let content = match std::fs::read_to_string(file) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return fail(
                ErrorReport::new("NOT_FOUND", format!("{} does not exist", file.display())),
                common,
                EXIT_NOT_FOUND,
            );
        }
        Err(e) => {
            return fail(
                ErrorReport::new("READ_FAILED", e.to_string()),
                common,
                EXIT_ERROR,
            );
        }
    };
    let data: serde_json::Value = match serde_json::from_str(&content) {
        Ok(v) => v,
        Err(e) => {
            return fail(
                ErrorReport::new("INVALID_JSON", e.to_string()),
                common,
                EXIT_ERROR,
            );
        }
    };

    let validation = harness::validate_envelope(&data);
    if common.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&validation).unwrap_or_default()
        );
    } else if validation.valid {
        println!(
            "{} valid {:?} envelope",
            "✓".green(),
            validation.envelope_type
        );
    } else {
        println!("{} invalid envelope:", "✗".red());
        for error in &validation.errors {
            println!("  - {error}");
        }
    }
    if validation.valid { EXIT_OK } else { EXIT_ERROR }
}

pub fn dev_webhook_test(common: &CommonArgs, channel: &str, event_type: &str) -> i32 {
    let Ok(channel) = channel.parse::<ChannelKind>() else {
        return fail(
            ErrorReport::new("BAD_CHANNEL", format!("unknown channel: {channel}")),
            common,
            EXIT_USAGE,
        );
    };
    match harness::generate_webhook_event(channel, event_type) {
        Ok(payload) => {
            println!(
                "{}",
                serde_json::to_string_pretty(&payload).unwrap_or_default()
            );
            EXIT_OK
        }
        Err(e) => fail(
            ErrorReport::new("BAD_EVENT", e.to_string()),
            common,
            EXIT_USAGE,
        ),
    }
}
