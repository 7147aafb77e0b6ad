//! Daemon PID-file discipline, exercised without spawning real children:
//! the test process's own PID stands in for a live daemon.

use myndhyve_relay::daemon;

#[test]
fn spawn_refuses_when_daemon_is_alive() {
    let dir = tempfile::tempdir().unwrap();
    // Our own PID is definitely alive.
    daemon::write_pid(dir.path(), std::process::id()).unwrap();

    let err = daemon::spawn(dir.path(), false).unwrap_err();
    assert!(err.to_string().contains("already running"), "{err}");
    // The PID file still points at the original process.
    assert_eq!(daemon::daemon_pid(dir.path()), Some(std::process::id()));
}

#[test]
fn stale_pid_is_cleared_on_lookup() {
    let dir = tempfile::tempdir().unwrap();
    daemon::write_pid(dir.path(), u32::MAX - 7).unwrap();

    assert_eq!(daemon::daemon_pid(dir.path()), None);
    assert!(!daemon::pid_path(dir.path()).exists());
}

#[test]
fn stop_reports_not_running_without_pid_file() {
    let dir = tempfile::tempdir().unwrap();
    assert_eq!(
        daemon::stop(dir.path()).unwrap(),
        daemon::StopResult::WasNotRunning
    );
}

#[test]
fn stop_clears_stale_pid_without_killing_anything() {
    let dir = tempfile::tempdir().unwrap();
    daemon::write_pid(dir.path(), u32::MAX - 7).unwrap();
    assert_eq!(
        daemon::stop(dir.path()).unwrap(),
        daemon::StopResult::WasStale { pid: u32::MAX - 7 }
    );
    assert!(!daemon::pid_path(dir.path()).exists());
}

#[test]
fn paths_live_in_the_config_dir() {
    let dir = tempfile::tempdir().unwrap();
    assert_eq!(daemon::pid_path(dir.path()), dir.path().join("daemon.pid"));
    assert_eq!(daemon::log_path(dir.path()), dir.path().join("daemon.log"));
}
