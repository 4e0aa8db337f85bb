//! User lookup, credential retrieval and privilege drop.
//!
//! The shadow database is usually readable only by root, so the binary may
//! be installed setuid root: the hash is read first, then every privilege is
//! given up before the display connection is touched.

use std::ffi::{CStr, CString};
use std::io;

use nix::unistd::{self, Gid, Uid};
use thiserror::Error;
use tracing::{debug, trace};

use crate::auth::{AuthError, Credential};

/// The user whose session is guarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
}

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("No passwd entry for uid {0}")]
    UnknownUser(u32),

    #[error("No password hash readable for {0} (is the binary setuid root?)")]
    NoCredential(String),

    #[error("Unusable password hash for {user}: {source}")]
    Credential {
        user: String,
        #[source]
        source: AuthError,
    },

    #[error("Failed to drop privileges: {0}")]
    Privileges(#[source] io::Error),

    #[error("Privileges were not dropped (effective uid {0})")]
    StillPrivileged(u32),
}

/// Resolve the real uid to a user.
pub fn current_user() -> Result<User, IdentityError> {
    let uid = Uid::current();
    let entry = unistd::User::from_uid(uid)
        .ok()
        .flatten()
        .ok_or(IdentityError::UnknownUser(uid.as_raw()))?;

    Ok(User {
        name: entry.name,
        uid: uid.as_raw(),
        gid: entry.gid.as_raw(),
    })
}

/// Read the user's password hash, from shadow when possible, then passwd.
pub fn lookup_credential(user: &User) -> Result<Credential, IdentityError> {
    let name = CString::new(user.name.as_str()).map_err(|_| IdentityError::UnknownUser(user.uid))?;

    let hash = shadow_hash(&name)
        .or_else(|| passwd_hash(&user.name))
        .filter(|hash| hash != "x")
        .ok_or_else(|| IdentityError::NoCredential(user.name.clone()))?;

    Credential::from_hash(hash).map_err(|source| IdentityError::Credential {
        user: user.name.clone(),
        source,
    })
}

#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
fn shadow_hash(name: &CStr) -> Option<String> {
    // SAFETY: getspnam returns null or a pointer to static storage that is
    // copied out before endspent releases it.
    unsafe {
        let entry = libc::getspnam(name.as_ptr());
        let hash = if entry.is_null() || (*entry).sp_pwdp.is_null() {
            trace!("No shadow entry available: {}", io::Error::last_os_error());
            None
        } else {
            Some(CStr::from_ptr((*entry).sp_pwdp).to_string_lossy().into_owned())
        };
        libc::endspent();
        hash
    }
}

#[cfg(not(target_os = "linux"))]
fn shadow_hash(_name: &CStr) -> Option<String> {
    None
}

fn passwd_hash(name: &str) -> Option<String> {
    let entry = unistd::User::from_name(name).ok().flatten()?;
    Some(entry.passwd.to_string_lossy().into_owned())
}

/// Permanently switch to the user's real uid and gid.
pub fn drop_privileges(user: &User) -> Result<(), IdentityError> {
    unistd::setgid(Gid::from_raw(user.gid)).map_err(|e| IdentityError::Privileges(e.into()))?;
    unistd::setuid(Uid::from_raw(user.uid)).map_err(|e| IdentityError::Privileges(e.into()))?;

    // Regaining root must now be impossible
    if user.uid != 0 && (Uid::effective().is_root() || unistd::setuid(Uid::from_raw(0)).is_ok()) {
        return Err(IdentityError::StillPrivileged(Uid::effective().as_raw()));
    }

    debug!("Running as {} (uid {}, gid {})", user.name, user.uid, user.gid);
    Ok(())
}
