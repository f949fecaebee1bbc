//! Drives the `wshub` binary's supervisor, attached and detached, with real
//! signals.

use std::fs;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

fn log_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("wshub-{name}-{}.log", std::process::id()))
}

fn start_foreground(count: &str, log: &PathBuf) -> Child {
    let _ = fs::remove_file(log);
    Command::new(env!("CARGO_BIN_EXE_wshub"))
        .args(["--log-file"])
        .arg(log)
        .args(["start", count, "--address", "127.0.0.1", "--foreground"])
        .env("RUST_LOG", "info")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap()
}

fn wait_with_deadline(child: &mut Child, limit: Duration) -> Option<ExitStatus> {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if let Some(status) = child.try_wait().unwrap() {
            return Some(status);
        }
        thread::sleep(Duration::from_millis(50));
    }
    None
}

/// Waits until the log mentions `needle` `times` times.
fn wait_for_log(log: &PathBuf, needle: &str, times: usize) -> String {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let contents = fs::read_to_string(log).unwrap_or_default();
        if contents.matches(needle).count() >= times || Instant::now() > deadline {
            return contents;
        }
        thread::sleep(Duration::from_millis(50));
    }
}

fn terminate(child: &Child, signal: libc::c_int) {
    signal_pid(child.id(), signal);
}

fn signal_pid(pid: u32, signal: libc::c_int) {
    // SAFETY: plain kill(2) on a pid this test started.
    let ret = unsafe { libc::kill(pid as libc::pid_t, signal) };
    assert_eq!(ret, 0);
}

/// Number after `prefix` on every log line containing `marker`.
fn numbers_after(contents: &str, marker: &str, prefix: &str) -> Vec<u32> {
    contents
        .lines()
        .filter(|line| line.contains(marker))
        .filter_map(|line| {
            let rest = &line[line.find(prefix)? + prefix.len()..];
            let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
            digits.parse().ok()
        })
        .collect()
}

/// `(state, ppid, session, tty_nr)` from `/proc/<pid>/stat`.
#[cfg(target_os = "linux")]
fn proc_stat(pid: u32) -> Option<(char, u32, u32, i64)> {
    let stat = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // The command name may contain spaces; fields resume after its ')'.
    let mut fields = stat[stat.rfind(')')? + 1..].split_whitespace();
    let state = fields.next()?.chars().next()?;
    let ppid = fields.next()?.parse().ok()?;
    let _pgrp = fields.next()?;
    let session = fields.next()?.parse().ok()?;
    let tty = fields.next()?.parse().ok()?;
    Some((state, ppid, session, tty))
}

#[cfg(target_os = "linux")]
fn is_running(pid: u32) -> bool {
    matches!(proc_stat(pid), Some((state, ..)) if state != 'Z')
}

#[cfg(target_os = "linux")]
fn wait_until_gone(pid: u32, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if !is_running(pid) {
            return true;
        }
        thread::sleep(Duration::from_millis(50));
    }
    false
}

#[test]
fn test_sigterm_reaps_every_worker_and_exits_zero() {
    // Arrange
    let log = log_path("sigterm");
    let mut supervisor = start_foreground("3", &log);
    let started = wait_for_log(&log, "listening on", 3);
    assert_eq!(started.matches("listening on").count(), 3, "{started}");

    // Act
    terminate(&supervisor, libc::SIGTERM);

    // Assert
    let status = wait_with_deadline(&mut supervisor, Duration::from_secs(10))
        .expect("supervisor did not exit");
    assert_eq!(status.code(), Some(0));
    let contents = fs::read_to_string(&log).unwrap();
    assert!(contents.contains("all servers stopped"), "{contents}");
    let _ = fs::remove_file(&log);
}

#[test]
fn test_sigint_stops_foreground_supervisor() {
    let log = log_path("sigint");
    let mut supervisor = start_foreground("1", &log);
    wait_for_log(&log, "listening on", 1);

    terminate(&supervisor, libc::SIGINT);

    let status = wait_with_deadline(&mut supervisor, Duration::from_secs(10))
        .expect("supervisor did not exit");
    assert_eq!(status.code(), Some(0));
    let _ = fs::remove_file(&log);
}

#[test]
fn test_zero_servers_fails_at_startup() {
    let status = Command::new(env!("CARGO_BIN_EXE_wshub"))
        .args(["start", "0", "--foreground"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .unwrap();

    assert!(!status.success());
}

#[cfg(target_os = "linux")]
#[test]
fn test_detached_supervisor_leaves_terminal_and_stops_on_sigterm() {
    // Arrange
    let log = log_path("detached");
    let _ = fs::remove_file(&log);
    let mut launcher = Command::new(env!("CARGO_BIN_EXE_wshub"))
        .args(["--log-file"])
        .arg(&log)
        .args(["start", "2", "--address", "127.0.0.1"])
        .env("RUST_LOG", "info")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    // Act: the launching process returns at once
    let status = wait_with_deadline(&mut launcher, Duration::from_secs(5))
        .expect("launcher did not return");
    assert_eq!(status.code(), Some(0));
    let started = wait_for_log(&log, "listening on", 2);
    assert_eq!(started.matches("listening on").count(), 2, "{started}");

    // Assert: the daemon has no terminal and is not our child
    let supervisor = *numbers_after(&started, "supervising", "pid=")
        .first()
        .unwrap_or_else(|| panic!("no supervisor pid in log:\n{started}"));
    let workers = numbers_after(&started, "started as pid", "started as pid ");
    assert_eq!(workers.len(), 2, "{started}");
    let (_, ppid, session, tty) = proc_stat(supervisor).expect("supervisor not running");
    assert_eq!(tty, 0, "supervisor still has a controlling terminal");
    assert_ne!(ppid, std::process::id());
    assert_ne!(session, supervisor, "supervisor can still acquire a terminal");
    assert_eq!(
        fs::read_link(format!("/proc/{supervisor}/cwd")).unwrap(),
        PathBuf::from("/")
    );

    // Act: stop it the documented way
    signal_pid(supervisor, libc::SIGTERM);

    // Assert
    let stopped = wait_for_log(&log, "all servers stopped", 1);
    assert!(stopped.contains("all servers stopped"), "{stopped}");
    assert!(wait_until_gone(supervisor, Duration::from_secs(10)));
    for worker in workers {
        assert!(!is_running(worker), "worker {worker} outlived the supervisor");
    }
    let _ = fs::remove_file(&log);
}
