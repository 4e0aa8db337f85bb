//! Configuration loading and defaults for fadelock.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::Corner;
use crate::fade::FadeSettings;
use crate::keysym;
use crate::lock::{GrabPolicy, LockSettings};

/// An `#rrggbb` colour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Color {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ColorError {
    #[error("Colour must look like #rrggbb, got {0:?}")]
    Format(String),
}

impl Color {
    pub const fn rgb(red: u8, green: u8, blue: u8) -> Self {
        Self { red, green, blue }
    }

    /// The colour widened to X11's 16-bit channels.
    pub fn to_rgb16(self) -> (u16, u16, u16) {
        let widen = |c: u8| u16::from(c) * 0x101;
        (widen(self.red), widen(self.green), widen(self.blue))
    }
}

impl FromStr for Color {
    type Err = ColorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ColorError::Format(s.to_string());
        let hex = s.strip_prefix('#').ok_or_else(invalid)?;
        if hex.len() != 6 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(invalid());
        }
        let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).map_err(|_| invalid());

        Ok(Self::rgb(channel(0)?, channel(2)?, channel(4)?))
    }
}

impl TryFrom<String> for Color {
    type Error = ColorError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Color> for String {
    fn from(color: Color) -> Self {
        color.to_string()
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02x}{:02x}{:02x}", self.red, self.green, self.blue)
    }
}

/// Colours of the lock screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Palette {
    /// Overlay window.
    pub background: Color,
    /// Cursor while locked.
    pub foreground: Color,
    /// Cursor after a failed attempt.
    pub failure: Color,
}

/// Main configuration for fadelock.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Seconds of inactivity before the fade starts (default: 180).
    pub idle_timeout_seconds: u64,

    /// Display sleep timeout while locked, in seconds (default: 10).
    pub prelock_sleep_seconds: u64,

    /// Length of the fade in milliseconds (default: 2000).
    pub fade_duration_ms: u64,

    /// Number of brightness steps in the fade (default: 1200).
    pub fade_steps: u32,

    /// How long the failure colour stays after a bad password (default: 500).
    pub fail_timeout_ms: u64,

    pub background: Color,
    pub foreground: Color,
    pub failure: Color,

    /// X11 keysym name of the lock hotkey (default: "Insert").
    pub lock_key: String,

    /// Shell command run after the fade completes and the session locks.
    pub post_fade_command: Option<String>,

    /// Keep typed text after a failed attempt instead of clearing it.
    pub keep_entry_on_failure: bool,

    /// Pointer resting in this corner prevents the fade.
    pub fade_veto_corner: Option<Corner>,

    /// Input grab attempts before giving up (default: 100).
    pub grab_attempts: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            idle_timeout_seconds: 180,
            prelock_sleep_seconds: 10,
            fade_duration_ms: 2000,
            fade_steps: 1200,
            fail_timeout_ms: 500,
            background: Color::rgb(0x00, 0x00, 0x00),
            foreground: Color::rgb(0x4f, 0xa0, 0x60),
            failure: Color::rgb(0xaa, 0x00, 0x00),
            lock_key: "Insert".to_string(),
            post_fade_command: None,
            keep_entry_on_failure: false,
            fade_veto_corner: None,
            grab_attempts: 100,
        }
    }
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Load configuration from the default path, or return defaults if not found.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(p) = path {
            return Self::load(p);
        }

        if let Some(default_path) = Self::default_path()
            && default_path.exists()
        {
            return Self::load(&default_path);
        }

        Ok(Self::default())
    }

    /// `$XDG_CONFIG_HOME/fadelock/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("fadelock").join("config.toml"))
    }

    /// Reject values the session cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.idle_timeout_seconds == 0 {
            anyhow::bail!("idle_timeout_seconds must be at least 1");
        }
        if self.fade_steps == 0 {
            anyhow::bail!("fade_steps must be at least 1");
        }
        if self.grab_attempts == 0 {
            anyhow::bail!("grab_attempts must be at least 1");
        }
        self.hotkey_keysym()?;
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }

    /// Keysym of the configured lock hotkey.
    pub fn hotkey_keysym(&self) -> Result<u32> {
        keysym::from_name(&self.lock_key)
            .with_context(|| format!("Unknown lock key: {:?}", self.lock_key))
    }

    pub fn palette(&self) -> Palette {
        Palette {
            background: self.background,
            foreground: self.foreground,
            failure: self.failure,
        }
    }

    pub fn fade_settings(&self) -> FadeSettings {
        FadeSettings {
            duration: Duration::from_millis(self.fade_duration_ms),
            steps: self.fade_steps,
            ..FadeSettings::default()
        }
    }

    pub fn lock_settings(&self) -> LockSettings {
        LockSettings {
            fail_timeout: Duration::from_millis(self.fail_timeout_ms),
            prelock_sleep: Duration::from_secs(self.prelock_sleep_seconds),
            keep_entry_on_failure: self.keep_entry_on_failure,
            grab: GrabPolicy {
                attempts: self.grab_attempts,
                ..GrabPolicy::default()
            },
        }
    }
}
