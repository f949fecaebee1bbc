//! Thin, safe wrappers over the POSIX process and signal calls the
//! supervisor needs.
//!
//! Every function maps a `-1` return into [`std::io::Error::last_os_error`],
//! so callers can use `?` like with any other I/O.  The only state kept here
//! is the async-signal-safe termination flag written by the signal handler.

use std::fs::OpenOptions;
use std::io;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::domain::Pid;

/// Set by [`record_termination`] when a stop signal arrives.
static TERMINATE_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Which side of a `fork` the caller is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fork {
    Parent(Pid),
    Child,
}

/// How a reaped child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildExit {
    Code(i32),
    Signal(i32),
}

/// Result of one non-blocking `waitpid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reaped {
    Exited { pid: Pid, exit: ChildExit },
    /// Children exist but none has exited yet.
    NoneReady,
    /// The process has no children at all (`ECHILD`).
    NoChildren,
}

fn check(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// Forks the calling process.
///
/// Must only be called while the process is single-threaded.
pub fn fork() -> io::Result<Fork> {
    // SAFETY: the supervisor never spawns threads, so the child inherits a
    // consistent address space.
    let pid = check(unsafe { libc::fork() })?;
    Ok(if pid == 0 {
        Fork::Child
    } else {
        Fork::Parent(pid)
    })
}

/// Makes the caller a session leader with no controlling terminal.
pub fn create_session() -> io::Result<()> {
    // SAFETY: setsid has no memory-safety preconditions.
    check(unsafe { libc::setsid() })?;
    Ok(())
}

fn set_disposition(signal: libc::c_int, handler: libc::sighandler_t) -> io::Result<()> {
    // SAFETY: a zeroed sigaction is a valid "no flags, empty mask" value, and
    // `handler` is either SIG_IGN, SIG_DFL, or an `extern "C"` function that
    // only touches an atomic.
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handler;
        check(libc::sigemptyset(&mut action.sa_mask))?;
        check(libc::sigaction(signal, &action, std::ptr::null_mut()))?;
    }
    Ok(())
}

pub fn ignore_signal(signal: libc::c_int) -> io::Result<()> {
    set_disposition(signal, libc::SIG_IGN)
}

/// Restores the kernel's default action for `signal`.
pub fn default_signal(signal: libc::c_int) -> io::Result<()> {
    set_disposition(signal, libc::SIG_DFL)
}

extern "C" fn record_termination(_signal: libc::c_int) {
    TERMINATE_REQUESTED.store(true, Ordering::SeqCst);
}

/// Routes `signal` to the termination flag read by
/// [`take_termination_request`].
pub fn install_termination_handler(signal: libc::c_int) -> io::Result<()> {
    set_disposition(
        signal,
        record_termination as extern "C" fn(libc::c_int) as libc::sighandler_t,
    )
}

/// Returns `true` once per batch of stop signals received since the last call.
pub fn take_termination_request() -> bool {
    TERMINATE_REQUESTED.swap(false, Ordering::SeqCst)
}

pub fn send_signal(pid: Pid, signal: libc::c_int) -> io::Result<()> {
    // SAFETY: kill has no memory-safety preconditions.
    check(unsafe { libc::kill(pid, signal) })?;
    Ok(())
}

/// Collects one exited child without blocking.
///
/// # Errors
///
/// Any `waitpid` failure other than `ECHILD`, including `EINTR`.
pub fn reap_nonblocking() -> io::Result<Reaped> {
    let mut status: libc::c_int = 0;
    // SAFETY: `status` is a valid, writable c_int.
    let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
    match pid {
        -1 => {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ECHILD) {
                Ok(Reaped::NoChildren)
            } else {
                Err(err)
            }
        }
        0 => Ok(Reaped::NoneReady),
        pid => Ok(Reaped::Exited {
            pid,
            exit: decode_status(status),
        }),
    }
}

fn decode_status(status: libc::c_int) -> ChildExit {
    if libc::WIFSIGNALED(status) {
        ChildExit::Signal(libc::WTERMSIG(status))
    } else {
        ChildExit::Code(libc::WEXITSTATUS(status))
    }
}

/// Sets the file-creation mask to 0.
pub fn clear_file_mode_mask() {
    // SAFETY: umask cannot fail and has no preconditions.
    unsafe {
        libc::umask(0);
    }
}

/// Points stdin, stdout and stderr at `/dev/null`.
pub fn redirect_std_streams_to_null() -> io::Result<()> {
    let null = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")?;
    for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        // SAFETY: both descriptors are open for the duration of the call.
        check(unsafe { libc::dup2(null.as_raw_fd(), target) })?;
    }
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
