//! Relay supervisor — runs the channel reader, heartbeat, and outbound
//! poller under one cancellation scope, reconnecting with backoff when a
//! session drops.
//!
//! The supervisor never branches on the channel tag: it talks to the
//! plugin through the [`Channel`](crate::channel::Channel) trait only.

mod client;
mod heartbeat;
mod outbound;

pub use client::{
    Activation, DeviceMeta, Registration, RelayClient, RelayStatus, activate, register,
};
pub use heartbeat::run_heartbeat_loop;
pub use outbound::run_outbound_loop;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backoff::BackoffPolicy;
use crate::channel::{Channel, ChannelRegistry, InboundHandler};
use crate::config::Config;
use crate::envelope::IngressEnvelope;
use crate::error::RelayError;

/// How a relay session ended.
enum SessionOutcome {
    /// Root cancellation — the agent is shutting down.
    Clean,
    /// Unrecoverable; the supervisor exits non-zero.
    Fatal(RelayError),
    /// Worth reconnecting after backoff.
    Dropped(String),
}

/// Run the relay until cancelled or a fatal error.
pub async fn run(
    config: &Config,
    registry: &ChannelRegistry,
    cancel: CancellationToken,
) -> Result<(), RelayError> {
    // Precondition checks, in the order a user can fix them.
    let relay_cfg = config
        .relay
        .as_ref()
        .ok_or_else(|| RelayError::NotConfigured("no relay in config.json".into()))?;
    if !relay_cfg.token_is_valid() {
        return Err(RelayError::DeviceTokenExpired);
    }
    let plugin = registry.get(relay_cfg.channel).ok_or_else(|| {
        RelayError::NotConfigured(format!("no plugin registered for {}", relay_cfg.channel))
    })?;
    if !plugin.is_supported() {
        return Err(RelayError::PlatformUnsupported(
            plugin
                .unsupported_reason()
                .unwrap_or_else(|| format!("{} is unavailable on this host", plugin.display_name())),
        ));
    }
    if !plugin.is_authenticated().await {
        return Err(RelayError::PlatformNotAuthenticated(format!(
            "{} is not signed in on this machine",
            plugin.display_name()
        )));
    }

    let client = Arc::new(RelayClient::new(
        &config.cloud.base_url,
        Duration::from_secs(config.cloud.request_timeout_secs),
        relay_cfg,
    )?);

    let heartbeat_interval = Duration::from_secs(relay_cfg.heartbeat_interval_secs.max(1));
    let poll_interval = Duration::from_secs(relay_cfg.outbound_poll_interval_secs.max(1));
    let policy = BackoffPolicy::from(&config.backoff);
    let stable_reset = Duration::from_secs(config.stable_session_reset_secs);
    let started_at = Instant::now();

    info!(
        relay_id = %client.relay_id(),
        channel = %relay_cfg.channel,
        "relay supervisor starting"
    );

    let mut attempt: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }

        let session_started = Instant::now();
        let outcome = run_session(
            client.clone(),
            plugin.clone(),
            heartbeat_interval,
            poll_interval,
            started_at,
            &cancel,
        )
        .await;

        match outcome {
            SessionOutcome::Clean => {
                info!("relay session ended cleanly");
                return Ok(());
            }
            SessionOutcome::Fatal(e) => {
                error!("relay session failed fatally: {e}");
                return Err(e);
            }
            SessionOutcome::Dropped(reason) => {
                warn!("relay session dropped: {reason}");
                attempt = next_attempt(attempt, session_started.elapsed(), stable_reset);
                if policy.max_attempts_reached(attempt) {
                    return Err(RelayError::Transient(format!(
                        "giving up after {attempt} reconnection attempts"
                    )));
                }
                let delay = policy.delay_for(attempt);
                info!(attempt, ?delay, "reconnecting after backoff");
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

/// One connected session: reader + heartbeat + poller sharing a child
/// scope. The first task to finish decides the outcome; the others are
/// cancelled and observed before returning.
async fn run_session(
    client: Arc<RelayClient>,
    plugin: Arc<dyn Channel>,
    heartbeat_interval: Duration,
    poll_interval: Duration,
    started_at: Instant,
    cancel: &CancellationToken,
) -> SessionOutcome {
    let scope = cancel.child_token();
    let token_expired = Arc::new(AtomicBool::new(false));
    let on_inbound = inbound_forwarder(client.clone(), token_expired.clone(), scope.clone());

    let mut reader = tokio::spawn({
        let plugin = plugin.clone();
        let scope = scope.clone();
        async move { plugin.start(on_inbound, scope).await }
    });
    let mut heartbeat = tokio::spawn(heartbeat::run_heartbeat_loop(
        client.clone(),
        plugin.clone(),
        heartbeat_interval,
        started_at,
        scope.clone(),
    ));
    let mut poller = tokio::spawn(outbound::run_outbound_loop(
        client.clone(),
        plugin.clone(),
        poll_interval,
        scope.clone(),
    ));

    let mut reader_result: Option<Result<(), String>> = None;
    let mut control_results: Vec<Result<(), RelayError>> = Vec::new();

    tokio::select! {
        r = &mut reader => {
            scope.cancel();
            reader_result = Some(flatten_reader(r));
            let (hb, out) = tokio::join!(&mut heartbeat, &mut poller);
            control_results.push(flatten_control(hb));
            control_results.push(flatten_control(out));
        }
        r = &mut heartbeat => {
            scope.cancel();
            control_results.push(flatten_control(r));
            let (rd, out) = tokio::join!(&mut reader, &mut poller);
            reader_result = Some(flatten_reader(rd));
            control_results.push(flatten_control(out));
        }
        r = &mut poller => {
            scope.cancel();
            control_results.push(flatten_control(r));
            let (rd, hb) = tokio::join!(&mut reader, &mut heartbeat);
            reader_result = Some(flatten_reader(rd));
            control_results.push(flatten_control(hb));
        }
    }

    // Token expiry trumps everything, wherever it surfaced.
    if token_expired.load(Ordering::SeqCst) {
        return SessionOutcome::Fatal(RelayError::DeviceTokenExpired);
    }
    let mut dropped_reason: Option<String> = None;
    for result in control_results {
        if let Err(e) = result {
            if e.is_fatal() {
                return SessionOutcome::Fatal(e);
            }
            dropped_reason.get_or_insert(e.to_string());
        }
    }

    if cancel.is_cancelled() {
        return SessionOutcome::Clean;
    }

    if let Some(Err(reason)) = reader_result {
        return SessionOutcome::Dropped(reason);
    }
    SessionOutcome::Dropped(dropped_reason.unwrap_or_else(|| "session ended unexpectedly".into()))
}

/// Forward each accepted inbound envelope to the cloud. Failures are
/// surfaced to the reader (which logs and keeps going) — except token
/// expiry, which tears the whole session down.
fn inbound_forwarder(
    client: Arc<RelayClient>,
    token_expired: Arc<AtomicBool>,
    scope: CancellationToken,
) -> InboundHandler {
    Arc::new(move |envelope: IngressEnvelope| {
        let client = client.clone();
        let token_expired = token_expired.clone();
        let scope = scope.clone();
        Box::pin(async move {
            match client.send_inbound(&envelope).await {
                Ok(()) => Ok(()),
                Err(RelayError::DeviceTokenExpired) => {
                    token_expired.store(true, Ordering::SeqCst);
                    scope.cancel();
                    Err(anyhow!("device token expired"))
                }
                Err(e) => Err(anyhow!("inbound forward failed: {e}")),
            }
        })
    })
}

fn flatten_reader(result: Result<anyhow::Result<()>, tokio::task::JoinError>) -> Result<(), String> {
    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(format!("{e:#}")),
        Err(e) => Err(format!("reader task panicked: {e}")),
    }
}

fn flatten_control(
    result: Result<Result<(), RelayError>, tokio::task::JoinError>,
) -> Result<(), RelayError> {
    match result {
        Ok(inner) => inner,
        Err(e) => Err(RelayError::Transient(format!("task panicked: {e}"))),
    }
}

/// Attempt counter for the next reconnection. A session that outlived the
/// stable threshold was healthy, so the ladder starts over at 1.
fn next_attempt(attempt: u32, session_duration: Duration, stable_reset: Duration) -> u32 {
    if session_duration > stable_reset {
        1
    } else {
        attempt + 1
    }
}
