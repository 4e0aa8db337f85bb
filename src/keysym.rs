//! Keysym classification for lock-screen input.
//!
//! Values follow the X11 keysym encoding (`keysymdef.h`).

pub const BACKSPACE: u32 = 0xff08;
pub const RETURN: u32 = 0xff0d;
pub const PAUSE: u32 = 0xff13;
pub const SCROLL_LOCK: u32 = 0xff14;
pub const ESCAPE: u32 = 0xff1b;
pub const PRINT: u32 = 0xff61;
pub const INSERT: u32 = 0xff63;
pub const MENU: u32 = 0xff67;
pub const BREAK: u32 = 0xff6b;
pub const F1: u32 = 0xffbe;
pub const F35: u32 = 0xffe0;

/// How the lock screen treats a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyClass {
    /// Submit the entry buffer.
    Enter,
    /// Clear the entry buffer.
    Escape,
    /// Remove the last character.
    Backspace,
    /// Function, keypad or modifier key; ignored entirely.
    Ignored,
    /// May produce text.
    Text,
}

/// Classify a keysym for the lock screen.
pub fn classify(keysym: u32) -> KeyClass {
    match keysym {
        RETURN => KeyClass::Enter,
        ESCAPE => KeyClass::Escape,
        BACKSPACE => KeyClass::Backspace,
        k if is_function_key(k)
            || is_keypad_key(k)
            || is_misc_function_key(k)
            || is_private_keypad_key(k)
            || is_modifier_key(k) =>
        {
            KeyClass::Ignored
        }
        _ => KeyClass::Text,
    }
}

fn is_function_key(k: u32) -> bool {
    (F1..=F35).contains(&k)
}

// Includes the PF1..PF4 keys.
fn is_keypad_key(k: u32) -> bool {
    (0xff80..=0xffbd).contains(&k)
}

fn is_misc_function_key(k: u32) -> bool {
    (0xff60..=0xff6b).contains(&k)
}

fn is_private_keypad_key(k: u32) -> bool {
    (0x1100_0000..=0x1100_ffff).contains(&k)
}

fn is_modifier_key(k: u32) -> bool {
    (0xffe1..=0xffee).contains(&k)
        || (0xfe01..=0xfe13).contains(&k)
        || k == 0xff7e // Mode_switch
        || k == 0xff7f // Num_Lock
}

/// Character produced by a keysym, for Latin-1 and Unicode keysyms.
pub fn to_char(keysym: u32) -> Option<char> {
    match keysym {
        0x20..=0x7e | 0xa0..=0xff => char::from_u32(keysym),
        0x0100_0100..=0x0110_ffff => char::from_u32(keysym - 0x0100_0000),
        _ => None,
    }
}

/// Keysym for a character, the inverse of [`to_char`].
pub fn from_char(c: char) -> u32 {
    match u32::from(c) {
        k @ (0x20..=0x7e | 0xa0..=0xff) => k,
        k => 0x0100_0000 + k,
    }
}

/// Look up a hotkey keysym by its X11 name (e.g. `Insert`, `Pause`, `F12`).
pub fn from_name(name: &str) -> Option<u32> {
    let keysym = match name {
        "Insert" => INSERT,
        "Pause" => PAUSE,
        "Scroll_Lock" => SCROLL_LOCK,
        "Print" => PRINT,
        "Menu" => MENU,
        "Break" => BREAK,
        _ => {
            let n: u32 = name.strip_prefix('F')?.parse().ok()?;
            if !(1..=35).contains(&n) {
                return None;
            }
            F1 + n - 1
        }
    };
    Some(keysym)
}
