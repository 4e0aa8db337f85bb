//! Idle detection via idle-counter watchpoints.
//!
//! Two watchpoints alternate instead of a polling interval:
//! - a Rising one at the configured idle threshold ("idle reached"),
//! - a Falling one just below the value the Rising one fired at
//!   ("activity resumed").
//!
//! Each fire arms the other, so the next transition is seen at the
//! counter's own resolution with nothing polling in between.

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, trace};

use crate::backend::{BackendError, IdleCounter};
use crate::domain::{Direction, IdleMillis, WatchHandle};

/// A registered watchpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watchpoint {
    pub direction: Direction,
    pub threshold: IdleMillis,
    pub handle: WatchHandle,
}

/// What a watchpoint fire means for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmOutcome {
    /// The user has been idle for the configured time.
    IdleReached(IdleMillis),
    /// The user became active again after being idle.
    ActivityResumed,
    /// The fire belonged to a replaced watchpoint; nothing to do.
    Stale,
}

/// Errors from arming watchpoints.
#[derive(Error, Debug)]
pub enum AlarmError {
    /// The idle counter is unavailable; fatal at startup.
    #[error("Idle counter unsupported: {0}")]
    UnsupportedCounter(#[source] BackendError),

    #[error("Failed to arm idle watchpoint: {0}")]
    Backend(#[source] BackendError),
}

impl From<BackendError> for AlarmError {
    fn from(err: BackendError) -> Self {
        if err.is_unsupported_counter() {
            Self::UnsupportedCounter(err)
        } else {
            Self::Backend(err)
        }
    }
}

/// Keeps one Rising and one Falling watchpoint armed on the idle counter.
pub struct AlarmScheduler {
    counter: Box<dyn IdleCounter>,
    idle_threshold: IdleMillis,
    rising: Option<Watchpoint>,
    falling: Option<Watchpoint>,
}

impl AlarmScheduler {
    /// Create a scheduler that reports idle after `idle_timeout`.
    pub fn new(counter: Box<dyn IdleCounter>, idle_timeout: Duration) -> Self {
        Self {
            counter,
            idle_threshold: IdleMillis::from_duration(idle_timeout),
            rising: None,
            falling: None,
        }
    }

    /// Arm the initial watchpoint pair.
    ///
    /// Falling starts just below the current reading, so activity that
    /// happens before the first idle period is already bracketed.
    pub fn start(&mut self) -> Result<(), AlarmError> {
        self.arm(Direction::Rising, self.idle_threshold)?;
        let now = self.counter.read()?;
        self.arm(Direction::Falling, now.pred())?;
        debug!(
            "Idle watchpoints armed (idle after {}, counter at {})",
            self.idle_threshold, now
        );
        Ok(())
    }

    /// Replace the watchpoint for `direction`.
    pub fn arm(
        &mut self,
        direction: Direction,
        threshold: IdleMillis,
    ) -> Result<Watchpoint, AlarmError> {
        let handle = self.counter.watch(direction, threshold)?;
        let watchpoint = Watchpoint {
            direction,
            threshold,
            handle,
        };
        trace!("Armed {:?} watchpoint at {}", direction, threshold);

        match direction {
            Direction::Rising => self.rising = Some(watchpoint),
            Direction::Falling => self.falling = Some(watchpoint),
        }
        Ok(watchpoint)
    }

    /// Handle a watchpoint fire and arm its counterpart.
    pub fn on_fired(
        &mut self,
        handle: WatchHandle,
        value: IdleMillis,
    ) -> Result<AlarmOutcome, AlarmError> {
        match self.direction_of(handle) {
            Some(Direction::Rising) if Self::is_current(self.rising, value) => {
                self.arm(Direction::Falling, value.pred())?;
                debug!("Idle threshold reached at {}", value);
                Ok(AlarmOutcome::IdleReached(value))
            }
            Some(Direction::Falling) if Self::is_current(self.falling, value) => {
                self.arm(Direction::Rising, self.idle_threshold)?;
                debug!("Activity resumed (counter at {})", value);
                Ok(AlarmOutcome::ActivityResumed)
            }
            _ => {
                trace!("Ignoring stale watchpoint fire {:?} at {}", handle, value);
                Ok(AlarmOutcome::Stale)
            }
        }
    }

    /// Direction of the current watchpoint with this handle, if any.
    pub fn direction_of(&self, handle: WatchHandle) -> Option<Direction> {
        [self.rising, self.falling]
            .into_iter()
            .flatten()
            .find(|w| w.handle == handle)
            .map(|w| w.direction)
    }

    pub fn watchpoint(&self, direction: Direction) -> Option<Watchpoint> {
        match direction {
            Direction::Rising => self.rising,
            Direction::Falling => self.falling,
        }
    }

    pub fn idle_threshold(&self) -> IdleMillis {
        self.idle_threshold
    }

    fn is_current(watchpoint: Option<Watchpoint>, value: IdleMillis) -> bool {
        watchpoint.is_some_and(|w| w.direction.is_satisfied(value, w.threshold))
    }
}
