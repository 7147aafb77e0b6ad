//! Daemon management — PID file, spawn, stop, status.
//!
//! `relay start --daemon` re-executes this binary as a detached background
//! process in foreground-relay mode, writes a PID file to
//! `<config_dir>/daemon.pid`, and redirects the child's output to
//! `<config_dir>/daemon.log`.
//!
//! `relay stop` reads that PID file and terminates the process, escalating
//! from a graceful signal to a hard kill after a timeout.
//!
//! Process probes use `sysinfo` so the same code runs on macOS, Linux and
//! Windows with no `cfg(unix)` gates.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use sysinfo::{Pid, Signal, System};

use crate::config::{self, LOG_FILE, PID_FILE};

const STOP_TIMEOUT: Duration = Duration::from_secs(5);
const STOP_POLL: Duration = Duration::from_millis(100);

// ── PID file helpers ────────────────────────────────────────────────────────

pub fn pid_path(config_dir: &Path) -> PathBuf {
    config_dir.join(PID_FILE)
}

pub fn log_path(config_dir: &Path) -> PathBuf {
    config_dir.join(LOG_FILE)
}

/// Write a PID to the PID file with owner-only permissions.
pub fn write_pid(config_dir: &Path, pid: u32) -> Result<()> {
    fs::create_dir_all(config_dir)?;
    let path = pid_path(config_dir);
    fs::write(&path, pid.to_string())
        .with_context(|| format!("Failed to write PID file {}", path.display()))?;
    config::restrict_permissions(&path)?;
    Ok(())
}

fn read_pid_file(config_dir: &Path) -> Option<u32> {
    fs::read_to_string(pid_path(config_dir))
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

pub fn remove_pid(config_dir: &Path) {
    let _ = fs::remove_file(pid_path(config_dir));
}

/// Check whether a process with the given PID is alive.
pub fn is_process_alive(pid: u32) -> bool {
    let mut sys = System::new();
    sys.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[Pid::from_u32(pid)]), true);
    sys.process(Pid::from_u32(pid)).is_some()
}

/// The daemon's PID, if one is running. A PID file whose process is gone
/// is removed on the way through.
pub fn daemon_pid(config_dir: &Path) -> Option<u32> {
    let pid = read_pid_file(config_dir)?;
    if is_process_alive(pid) {
        Some(pid)
    } else {
        remove_pid(config_dir);
        None
    }
}

// ── Spawn ───────────────────────────────────────────────────────────────────

/// Spawn the relay as a detached background process.
///
/// Fails if a daemon is already running. The child runs `relay start
/// --foreground` from the same executable, with stdout and stderr
/// appended to the rolling log file.
pub fn spawn(config_dir: &Path, verbose: bool) -> Result<u32> {
    if let Some(pid) = daemon_pid(config_dir) {
        anyhow::bail!("Relay daemon is already running (PID {pid})");
    }

    let exe = std::env::current_exe().context("Failed to resolve current executable")?;

    fs::create_dir_all(config_dir)?;
    let log = log_path(config_dir);
    let log_file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log)
        .with_context(|| format!("Failed to open daemon log at {}", log.display()))?;
    let log_stderr = log_file
        .try_clone()
        .context("Failed to clone log file handle")?;

    let mut cmd = Command::new(&exe);
    cmd.arg("relay")
        .arg("start")
        .arg("--foreground")
        .env("MYNDHYVE_CONFIG_DIR", config_dir)
        .stdin(std::process::Stdio::null())
        .stdout(log_file)
        .stderr(log_stderr);
    if verbose {
        cmd.arg("--verbose");
    }

    detach_child(&mut cmd);

    let child = cmd
        .spawn()
        .with_context(|| format!("Failed to spawn {}", exe.display()))?;
    let pid = child.id();
    write_pid(config_dir, pid)?;

    Ok(pid)
}

// ── Stop ────────────────────────────────────────────────────────────────────

#[derive(Debug, PartialEq, Eq)]
pub enum StopResult {
    /// A live process was terminated.
    Stopped { pid: u32 },
    /// The PID file was stale; nothing to kill.
    WasStale { pid: u32 },
    /// No PID file at all.
    WasNotRunning,
}

/// Stop the daemon: graceful signal, poll for exit, escalate to a hard
/// kill after the timeout, then clear the PID file.
pub fn stop(config_dir: &Path) -> Result<StopResult> {
    let Some(pid) = read_pid_file(config_dir) else {
        return Ok(StopResult::WasNotRunning);
    };
    if !is_process_alive(pid) {
        remove_pid(config_dir);
        return Ok(StopResult::WasStale { pid });
    }

    signal_process(pid, Signal::Term)?;
    let deadline = std::time::Instant::now() + STOP_TIMEOUT;
    while std::time::Instant::now() < deadline {
        std::thread::sleep(STOP_POLL);
        if !is_process_alive(pid) {
            remove_pid(config_dir);
            return Ok(StopResult::Stopped { pid });
        }
    }

    // Still alive after the grace period — force it.
    signal_process(pid, Signal::Kill)?;
    remove_pid(config_dir);
    Ok(StopResult::Stopped { pid })
}

/// Send a signal by PID using `sysinfo`. Falls back to a hard kill where
/// the platform has no equivalent (Windows has no SIGTERM).
fn signal_process(pid: u32, signal: Signal) -> Result<()> {
    let sysinfo_pid = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[sysinfo_pid]), true);
    let process = sys
        .process(sysinfo_pid)
        .with_context(|| format!("Process {pid} not found"))?;

    if !process.kill_with(signal).unwrap_or(false) {
        process.kill();
    }
    Ok(())
}

/// Configure a `Command` to detach the child from the parent session.
#[cfg(unix)]
fn detach_child(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    // New process group so the child survives the parent's terminal.
    cmd.process_group(0);
}

#[cfg(windows)]
fn detach_child(cmd: &mut Command) {
    use std::os::windows::process::CommandExt;
    // CREATE_NEW_PROCESS_GROUP (0x200) | DETACHED_PROCESS (0x08)
    cmd.creation_flags(0x0000_0208);
}

#[cfg(not(any(unix, windows)))]
fn detach_child(_cmd: &mut Command) {}
