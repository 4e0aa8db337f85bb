//! Detaching from the controlling terminal.

use std::fs::OpenOptions;
use std::io;
use std::os::fd::AsRawFd;

use nix::unistd::{ForkResult, dup2, fork, setsid};

/// Fork into the background.
///
/// The parent exits immediately; the child starts a new session, moves to
/// `/` and points stdin, stdout and stderr at `/dev/null`. Must run before
/// any async runtime or helper thread exists.
#[allow(unsafe_code)]
pub fn daemonize() -> io::Result<()> {
    // SAFETY: called while the process is still single-threaded, before the
    // tokio runtime is built.
    match unsafe { fork() }? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    // New session, no controlling terminal
    setsid()?;

    std::env::set_current_dir("/")?;

    let null = OpenOptions::new().read(true).write(true).open("/dev/null")?;
    for fd in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        dup2(null.as_raw_fd(), fd)?;
    }
    Ok(())
}
