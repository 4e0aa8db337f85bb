//! Password verification against the user's crypt(3) hash.

use std::fmt;

use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::trace;

/// The user's salted password hash, read once at startup.
///
/// Never printed: the `Debug` output is redacted.
#[derive(Clone)]
pub struct Credential {
    hash: String,
}

/// Errors from building a [`Credential`].
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AuthError {
    #[error("Password hash is empty")]
    Empty,

    #[error("Account is locked or has no password")]
    Disabled,

    #[error("Unsupported password hash scheme {0:?}")]
    UnsupportedScheme(String),
}

impl Credential {
    /// Wrap a crypt(3) hash string (`$6$salt$...`, `$1$...`, DES, ...).
    pub fn from_hash(hash: impl Into<String>) -> Result<Self, AuthError> {
        let hash = hash.into();
        if hash.is_empty() {
            return Err(AuthError::Empty);
        }
        if hash.starts_with('!') || hash.starts_with('*') || hash == "x" {
            return Err(AuthError::Disabled);
        }
        // A hash we cannot recompute would make every attempt fail
        if pwhash::unix::crypt("", &hash).is_err() {
            return Err(AuthError::UnsupportedScheme(scheme_of(&hash).to_string()));
        }
        Ok(Self { hash })
    }

    /// Check an attempt against the stored hash.
    ///
    /// The attempt is hashed with the stored salt and the two hashes are
    /// compared in constant time, so timing reveals nothing about where a
    /// wrong attempt first differs.
    pub fn verify(&self, attempt: &str) -> bool {
        let computed = match pwhash::unix::crypt(attempt, &self.hash) {
            Ok(computed) => computed,
            Err(e) => {
                trace!("Hashing attempt failed: {}", e);
                return false;
            }
        };
        constant_time_eq(computed.as_bytes(), self.hash.as_bytes())
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("hash", &"<redacted>")
            .finish()
    }
}

/// The `$id$` prefix of a modular crypt hash, or "des" for the legacy form.
fn scheme_of(hash: &str) -> &str {
    match hash.strip_prefix('$') {
        Some(rest) => rest.split('$').next().unwrap_or_default(),
        None => "des",
    }
}

/// Compare two byte strings without early exit on the first difference.
///
/// Only the lengths are compared in variable time; hash outputs of one
/// scheme always have the same length.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    bool::from(a.ct_eq(b))
}
