//! Keycode to keysym translation from the server's core keyboard mapping.

use x11rb::connection::Connection;
use x11rb::protocol::xproto::ConnectionExt as _;

use super::BackendError;
use crate::keysym;

/// Snapshot of the core keyboard mapping.
///
/// Only the first group is consulted, which is what a password prompt
/// needs: unshifted and shifted symbols with Caps Lock applied to letters.
#[derive(Debug, Clone)]
pub struct Keymap {
    min_keycode: u8,
    per_keycode: usize,
    keysyms: Vec<u32>,
}

impl Keymap {
    pub fn load(conn: &impl Connection) -> Result<Self, BackendError> {
        let setup = conn.setup();
        let min_keycode = setup.min_keycode;
        let count = setup.max_keycode - min_keycode + 1;

        let reply = conn.get_keyboard_mapping(min_keycode, count)?.reply()?;
        Ok(Self::from_parts(
            min_keycode,
            usize::from(reply.keysyms_per_keycode),
            reply.keysyms,
        ))
    }

    pub fn from_parts(min_keycode: u8, per_keycode: usize, keysyms: Vec<u32>) -> Self {
        Self {
            min_keycode,
            per_keycode,
            keysyms,
        }
    }

    /// Resolve a keycode under the given modifier state.
    pub fn keysym(&self, keycode: u8, shift: bool, caps_lock: bool) -> u32 {
        let (lower, upper) = self.columns(keycode);
        let letter = keysym::to_char(lower).is_some_and(char::is_alphabetic);

        if shift ^ (caps_lock && letter) {
            upper
        } else {
            lower
        }
    }

    /// First keycode producing `keysym` in any column.
    pub fn keycode_for(&self, keysym: u32) -> Option<u8> {
        if self.per_keycode == 0 {
            return None;
        }
        let row = self
            .keysyms
            .chunks(self.per_keycode)
            .position(|syms| syms.contains(&keysym))?;
        u8::try_from(row)
            .ok()
            .and_then(|row| self.min_keycode.checked_add(row))
    }

    fn columns(&self, keycode: u8) -> (u32, u32) {
        let Some(row) = keycode.checked_sub(self.min_keycode) else {
            return (0, 0);
        };
        let start = usize::from(row) * self.per_keycode;
        let syms = self
            .keysyms
            .get(start..start + self.per_keycode)
            .unwrap_or_default();

        let lower = syms.first().copied().unwrap_or(0);
        match syms.get(1).copied() {
            Some(upper) if upper != 0 => (lower, upper),
            _ => (lower, uppercase(lower)),
        }
    }
}

/// Shifted form of a single-column letter keysym.
fn uppercase(keysym: u32) -> u32 {
    let Some(c) = keysym::to_char(keysym) else {
        return keysym;
    };
    let mut upper = c.to_uppercase();
    match (upper.next(), upper.next()) {
        (Some(u), None) => keysym::from_char(u),
        _ => keysym,
    }
}
