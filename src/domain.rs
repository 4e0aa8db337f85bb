//! Domain types shared by the idle, fade and lock state machines.

use std::fmt;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

/// Direction in which the idle counter must cross a watchpoint threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Fires once the counter is at or above the threshold (user went idle).
    Rising,
    /// Fires once the counter is at or below the threshold (activity resumed).
    Falling,
}

impl Direction {
    /// Check whether a counter value satisfies this direction's comparison.
    pub fn is_satisfied(self, value: IdleMillis, threshold: IdleMillis) -> bool {
        match self {
            Self::Rising => value >= threshold,
            Self::Falling => value <= threshold,
        }
    }
}

/// Idle counter reading or watchpoint threshold, in milliseconds.
///
/// Signed to match the 64-bit sync counter value space, so that a
/// "one below the current value" threshold is representable at zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct IdleMillis(i64);

impl IdleMillis {
    pub const ZERO: Self = Self(0);

    pub fn new(millis: i64) -> Self {
        Self(millis)
    }

    /// Convert a duration, saturating at `i64::MAX` milliseconds.
    pub fn from_duration(duration: Duration) -> Self {
        Self(i64::try_from(duration.as_millis()).unwrap_or(i64::MAX))
    }

    pub fn as_millis(self) -> i64 {
        self.0
    }

    /// The value one tick below this one.
    #[must_use]
    pub fn pred(self) -> Self {
        Self(self.0.saturating_sub(1))
    }
}

impl fmt::Display for IdleMillis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// Opaque handle identifying a registered watchpoint (backend-specific).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchHandle(u32);

impl WatchHandle {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }
}

/// Lock state of the user session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Unlocked,
    Locked,
    /// Locked, with the failure indication showing after a bad attempt.
    LockedAuthFail,
}

impl SessionState {
    pub fn is_locked(self) -> bool {
        !matches!(self, Self::Unlocked)
    }
}

/// Per-channel gamma ramp snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GammaRamp {
    pub red: Vec<u16>,
    pub green: Vec<u16>,
    pub blue: Vec<u16>,
}

impl GammaRamp {
    pub fn new(red: Vec<u16>, green: Vec<u16>, blue: Vec<u16>) -> Self {
        Self { red, green, blue }
    }

    /// Number of samples per channel.
    pub fn len(&self) -> usize {
        self.red.len()
    }

    pub fn is_empty(&self) -> bool {
        self.red.is_empty()
    }

    /// Every sample multiplied by `ratio` (clamped to `[0, 1]`).
    #[must_use]
    pub fn scaled(&self, ratio: f64) -> Self {
        let ratio = ratio.clamp(0.0, 1.0);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let scale = |samples: &[u16]| -> Vec<u16> {
            samples
                .iter()
                .map(|&s| (f64::from(s) * ratio) as u16)
                .collect()
        };

        Self {
            red: scale(&self.red),
            green: scale(&self.green),
            blue: scale(&self.blue),
        }
    }
}

/// A key press resolved by the display backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPress {
    /// Resolved keysym.
    pub keysym: u32,

    /// Text the key produces, empty for non-character keys.
    pub text: String,

    /// Whether this is the configured lock hotkey.
    pub hotkey: bool,
}

impl KeyPress {
    pub fn new(keysym: u32, text: impl Into<String>) -> Self {
        Self {
            keysym,
            text: text.into(),
            hotkey: false,
        }
    }

    pub fn hotkey(keysym: u32) -> Self {
        Self {
            keysym,
            text: String::new(),
            hotkey: true,
        }
    }
}

/// Screen corner used by the fade veto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Corner {
    TopLeft,
    TopRight,
    BottomLeft,
    BottomRight,
}

impl Corner {
    /// Distance from the screen edge (in pixels) still counted as the corner.
    pub const SLACK: i32 = 10;

    /// The corner a pointer position lies in, if any.
    pub fn locate(x: i32, y: i32, width: i32, height: i32) -> Option<Self> {
        let left = x < Self::SLACK;
        let right = x >= width - Self::SLACK;
        let top = y < Self::SLACK;
        let bottom = y >= height - Self::SLACK;

        match (left, right, top, bottom) {
            (true, _, true, _) => Some(Self::TopLeft),
            (_, true, true, _) => Some(Self::TopRight),
            (true, _, _, true) => Some(Self::BottomLeft),
            (_, true, _, true) => Some(Self::BottomRight),
            _ => None,
        }
    }
}

/// Event delivered by the display event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// An idle counter watchpoint fired with the given counter value.
    WatchFired {
        handle: WatchHandle,
        value: IdleMillis,
    },

    /// A key was pressed.
    Key(KeyPress),

    /// The pointer moved while grabbed.
    PointerMotion,

    /// Another invocation asked us to lock now.
    LockRequested,

    /// Another invocation asked us to quit.
    QuitRequested,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_comparison() {
        let threshold = IdleMillis::new(1000);
        assert!(Direction::Rising.is_satisfied(IdleMillis::new(1000), threshold));
        assert!(!Direction::Rising.is_satisfied(IdleMillis::new(999), threshold));
        assert!(Direction::Falling.is_satisfied(IdleMillis::new(1000), threshold));
        assert!(!Direction::Falling.is_satisfied(IdleMillis::new(1001), threshold));
    }

    #[test]
    fn test_idle_millis_pred_below_zero() {
        assert_eq!(IdleMillis::ZERO.pred(), IdleMillis::new(-1));
        assert_eq!(IdleMillis::new(i64::MIN).pred(), IdleMillis::new(i64::MIN));
    }

    #[test]
    fn test_idle_millis_from_duration() {
        assert_eq!(
            IdleMillis::from_duration(Duration::from_secs(180)),
            IdleMillis::new(180_000)
        );
        assert_eq!(
            IdleMillis::from_duration(Duration::MAX),
            IdleMillis::new(i64::MAX)
        );
    }

    #[test]
    fn test_ramp_scaling() {
        let ramp = GammaRamp::new(vec![0, 1000, 65535], vec![10, 20, 30], vec![7, 7, 7]);

        assert_eq!(ramp.scaled(1.0), ramp);
        assert_eq!(ramp.scaled(0.5).red, vec![0, 500, 32767]);
        assert_eq!(ramp.scaled(0.0).green, vec![0, 0, 0]);
        // Out-of-range ratios are clamped
        assert_eq!(ramp.scaled(2.0), ramp);
        assert_eq!(ramp.len(), 3);
    }

    #[test]
    fn test_session_state_locked() {
        assert!(!SessionState::Unlocked.is_locked());
        assert!(SessionState::Locked.is_locked());
        assert!(SessionState::LockedAuthFail.is_locked());
    }

    #[test]
    fn test_corner_locate() {
        assert_eq!(Corner::locate(0, 0, 1920, 1080), Some(Corner::TopLeft));
        assert_eq!(Corner::locate(1919, 3, 1920, 1080), Some(Corner::TopRight));
        assert_eq!(Corner::locate(2, 1079, 1920, 1080), Some(Corner::BottomLeft));
        assert_eq!(
            Corner::locate(1915, 1075, 1920, 1080),
            Some(Corner::BottomRight)
        );
        assert_eq!(Corner::locate(960, 540, 1920, 1080), None);
        assert_eq!(Corner::locate(0, 540, 1920, 1080), None);
    }
}
