//! Single-instance detection and remote control through root window
//! properties.
//!
//! The running instance stores its pid in `_FADELOCK_RUNNING`. Other
//! invocations write a request word into `_FADELOCK_REQUEST`, which the
//! running instance sees as a property change.

use std::io;
use std::rc::Rc;

use tracing::{debug, warn};
use x11rb::connection::Connection;
use x11rb::protocol::xproto::{AtomEnum, ConnectionExt as _, PropMode, Window};
use x11rb::rust_connection::RustConnection;
use x11rb::wrapper::ConnectionExt as _;

use super::BackendError;
use super::x11::Atoms;

/// A command sent to the running instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    Lock,
    Quit,
}

impl Request {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lock => "lock",
            Self::Quit => "quit",
        }
    }

    pub fn parse(bytes: &[u8]) -> Option<Self> {
        match bytes.trim_ascii() {
            b"lock" => Some(Self::Lock),
            b"quit" => Some(Self::Quit),
            _ => None,
        }
    }
}

/// Pid of a live instance advertised on `root`, if any.
pub(super) fn running_pid(
    conn: &RustConnection,
    root: Window,
    atoms: &Atoms,
) -> Result<Option<u32>, BackendError> {
    let reply = conn
        .get_property(false, root, atoms._FADELOCK_RUNNING, AtomEnum::CARDINAL, 0, 1)?
        .reply()?;
    let pid = reply.value32().and_then(|mut values| values.next());

    match pid {
        Some(pid) if is_pid_alive(pid) => Ok(Some(pid)),
        Some(pid) => {
            debug!("Ignoring stale instance marker for pid {}", pid);
            Ok(None)
        }
        None => Ok(None),
    }
}

pub(super) fn send_request(
    conn: &RustConnection,
    root: Window,
    atoms: &Atoms,
    request: Request,
) -> Result<(), BackendError> {
    conn.change_property8(
        PropMode::REPLACE,
        root,
        atoms._FADELOCK_REQUEST,
        AtomEnum::STRING,
        request.as_str().as_bytes(),
    )?;
    conn.flush()?;
    Ok(())
}

/// Fetch and consume a pending request.
pub(super) fn take_request(
    conn: &RustConnection,
    root: Window,
    atoms: &Atoms,
) -> Result<Option<Request>, BackendError> {
    let reply = conn
        .get_property(true, root, atoms._FADELOCK_REQUEST, AtomEnum::STRING, 0, 16)?
        .reply()?;
    if reply.value.is_empty() {
        // Our own delete also produces a property notification
        return Ok(None);
    }

    let request = Request::parse(&reply.value);
    if request.is_none() {
        warn!(
            "Ignoring unknown request {:?}",
            String::from_utf8_lossy(&reply.value)
        );
    }
    Ok(request)
}

/// Marks this process as the running instance until dropped.
pub struct InstanceGuard {
    conn: Rc<RustConnection>,
    root: Window,
    atom: u32,
}

impl InstanceGuard {
    pub(super) fn claim(
        conn: Rc<RustConnection>,
        root: Window,
        atoms: &Atoms,
    ) -> Result<Self, BackendError> {
        let pid = std::process::id();
        conn.change_property32(
            PropMode::REPLACE,
            root,
            atoms._FADELOCK_RUNNING,
            AtomEnum::CARDINAL,
            &[pid],
        )?;
        conn.flush()?;
        debug!("Registered as running instance (pid {})", pid);

        Ok(Self {
            conn,
            root,
            atom: atoms._FADELOCK_RUNNING,
        })
    }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        let removed = self
            .conn
            .delete_property(self.root, self.atom)
            .map_err(BackendError::from)
            .and_then(|_| self.conn.flush().map_err(BackendError::from));
        if let Err(e) = removed {
            warn!("Failed to remove instance marker: {}", e);
        }
    }
}

/// Check whether a process exists, counting EPERM as alive.
#[allow(unsafe_code)]
fn is_pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    if pid == i32::try_from(std::process::id()).unwrap_or_default() {
        return false;
    }

    // SAFETY: signal 0 only checks for existence.
    let result = unsafe { libc::kill(pid, 0) };
    result == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}
