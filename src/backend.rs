//! Display backends.
//!
//! The idle, fade and lock state machines only talk to the display through
//! the traits in this module, so the X11 implementation can be swapped for
//! the scripted fake in tests.

#[cfg(test)]
pub mod fake;
mod instance;
mod keymap;
mod x11;

use std::time::Duration;

use async_trait::async_trait;
pub use instance::{InstanceGuard, Request};
use thiserror::Error;
use tokio::time::Instant;
pub use x11::{SessionGuard, X11Backend, X11Events, X11Gamma, X11IdleCounter, X11Surface};

use crate::domain::{Corner, Direction, GammaRamp, IdleMillis, SessionEvent, WatchHandle};

/// Outcome of waiting on the event stream.
#[derive(Debug)]
pub enum WaitOutcome {
    /// The deadline elapsed with no event.
    TimedOut,
    /// An event arrived before the deadline.
    Delivered(SessionEvent),
    /// The event stream failed.
    Failed(BackendError),
}

/// Merged source of display events.
#[async_trait(?Send)]
pub trait EventSource {
    /// Wait for the next event, or until `deadline` passes.
    ///
    /// `None` blocks until an event arrives. An event that is already queued
    /// is delivered even when the deadline has passed.
    async fn wait(&mut self, deadline: Option<Instant>) -> WaitOutcome;
}

/// Monotonic idle-time counter with one-shot watchpoints.
pub trait IdleCounter {
    /// Current idle time.
    fn read(&self) -> Result<IdleMillis, BackendError>;

    /// Register a watchpoint for `direction`, replacing any existing one for
    /// that direction. Fires are delivered through the [`EventSource`].
    fn watch(
        &mut self,
        direction: Direction,
        threshold: IdleMillis,
    ) -> Result<WatchHandle, BackendError>;
}

/// Display brightness control.
pub trait GammaControl {
    fn get_ramp(&self) -> Result<GammaRamp, BackendError>;
    fn set_ramp(&mut self, ramp: &GammaRamp) -> Result<(), BackendError>;
}

/// Lock window, input grab and display power handling.
pub trait LockSurface {
    /// Map the full-screen overlay window.
    fn create_overlay(&mut self) -> Result<(), BackendError>;

    fn destroy_overlay(&mut self) -> Result<(), BackendError>;

    /// Make one attempt to grab keyboard and pointer.
    ///
    /// Returns [`BackendError::GrabDenied`] when the server refuses the grab
    /// for now; callers decide whether to retry.
    fn grab_input(&mut self) -> Result<(), BackendError>;

    fn release_input(&mut self) -> Result<(), BackendError>;

    /// Switch the failed-attempt indication on or off.
    fn show_failure(&mut self, failing: bool) -> Result<(), BackendError>;

    /// Put the display to sleep after `after` of inactivity (`None` disables).
    fn set_display_sleep(&mut self, after: Option<Duration>) -> Result<(), BackendError>;

    /// Screen corner the pointer currently rests in, if any.
    fn pointer_corner(&self) -> Result<Option<Corner>, BackendError>;
}

/// Errors that can occur talking to the display.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Cannot open display: {0}")]
    DisplayUnavailable(String),

    #[error("X server lacks the {0} extension")]
    MissingExtension(&'static str),

    #[error("No IDLETIME system counter (xorg-server 1.3 or newer is required)")]
    NoIdleCounter,

    #[error("Display connection lost: {0}")]
    ConnectionLost(String),

    #[error("Request failed: {0}")]
    Request(String),

    #[error("Input grab denied")]
    GrabDenied,

    #[error("Gamma ramp unavailable: {0}")]
    Gamma(String),
}

impl BackendError {
    /// Whether the idle counter itself is unusable.
    pub fn is_unsupported_counter(&self) -> bool {
        matches!(self, Self::MissingExtension(_) | Self::NoIdleCounter)
    }
}
