//! Scripted in-memory display used by the state machine tests.

use std::cell::{Ref, RefCell, RefMut};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{BackendError, EventSource, GammaControl, IdleCounter, LockSurface, WaitOutcome};
use crate::auth::Credential;
use crate::domain::{
    Corner, Direction, GammaRamp, IdleMillis, KeyPress, SessionEvent, WatchHandle,
};
use crate::keysym;

/// Handle the fake hands out for the Rising watchpoint.
pub const RISING: WatchHandle = WatchHandle::new(1);
/// Handle the fake hands out for the Falling watchpoint.
pub const FALLING: WatchHandle = WatchHandle::new(2);
/// Password matching [`credential`].
pub const PASSWORD: &str = "hunter2";

/// A registered watchpoint; `active` until it fires.
#[derive(Debug, Clone, Copy)]
pub struct Watch {
    pub handle: WatchHandle,
    pub threshold: IdleMillis,
    pub active: bool,
}

/// Observable state of the fake display.
#[derive(Debug, Default)]
pub struct FakeDisplay {
    pub idle: IdleMillis,
    pub counter_missing: bool,
    pub watches: HashMap<Direction, Watch>,
    pub watch_calls: Vec<(Direction, IdleMillis)>,

    pub baseline: GammaRamp,
    pub ramp: GammaRamp,
    pub ramp_writes: usize,
    /// Lowest value ever written for the brightest red sample.
    pub darkest: Option<u16>,
    pub gamma_missing: bool,

    pub overlay: bool,
    pub grabbed: bool,
    pub grab_denials: u32,
    pub grab_attempts: u32,
    pub locked_at: Option<Instant>,
    pub failure_log: Vec<(bool, Instant)>,
    pub display_sleep: Option<Duration>,
    pub pointer: Option<Corner>,

    /// Events to deliver, keyed by offset from the fake's creation.
    pub script: VecDeque<(Duration, SessionEvent)>,
}

/// Cloneable handle implementing every backend trait over one shared state.
#[derive(Clone)]
pub struct Fake {
    state: Rc<RefCell<FakeDisplay>>,
    start: Instant,
}

impl Fake {
    pub fn new() -> Self {
        let baseline = GammaRamp::new(
            vec![0, 16384, 32768, 65535],
            vec![0, 8000, 30000, 60000],
            vec![100, 200, 300, 400],
        );
        let display = FakeDisplay {
            ramp: baseline.clone(),
            baseline,
            ..FakeDisplay::default()
        };

        Self {
            state: Rc::new(RefCell::new(display)),
            start: Instant::now(),
        }
    }

    pub fn state(&self) -> Ref<'_, FakeDisplay> {
        self.state.borrow()
    }

    pub fn state_mut(&self) -> RefMut<'_, FakeDisplay> {
        self.state.borrow_mut()
    }

    pub fn start(&self) -> Instant {
        self.start
    }

    /// Schedule an event `offset` after the fake was created.
    pub fn at(&self, offset: Duration, event: SessionEvent) -> &Self {
        let mut state = self.state.borrow_mut();
        state.script.push_back((offset, event));
        state.script.make_contiguous().sort_by_key(|(at, _)| *at);
        self
    }

    /// Schedule typing `text` followed by Return, one key per millisecond.
    pub fn type_line(&self, offset: Duration, text: &str) -> &Self {
        let mut at = offset;
        for c in text.chars() {
            self.at(at, key(c));
            at += Duration::from_millis(1);
        }
        self.at(at, enter())
    }

    /// Move the idle counter to `value`, firing watchpoints it crosses.
    pub fn tick(&self, value: IdleMillis) -> Vec<SessionEvent> {
        let mut state = self.state.borrow_mut();
        state.idle = value;

        let mut fired = Vec::new();
        for direction in [Direction::Rising, Direction::Falling] {
            if let Some(watch) = state.watches.get_mut(&direction)
                && watch.active
                && direction.is_satisfied(value, watch.threshold)
            {
                watch.active = false;
                fired.push(SessionEvent::WatchFired {
                    handle: watch.handle,
                    value,
                });
            }
        }
        fired
    }
}

impl Default for Fake {
    fn default() -> Self {
        Self::new()
    }
}

/// A printable key press.
pub fn key(c: char) -> SessionEvent {
    SessionEvent::Key(KeyPress::new(u32::from(c), c.to_string()))
}

pub fn enter() -> SessionEvent {
    SessionEvent::Key(KeyPress::new(keysym::RETURN, ""))
}

pub fn idle_reached(millis: i64) -> SessionEvent {
    SessionEvent::WatchFired {
        handle: RISING,
        value: IdleMillis::new(millis),
    }
}

pub fn activity() -> SessionEvent {
    SessionEvent::WatchFired {
        handle: FALLING,
        value: IdleMillis::ZERO,
    }
}

/// Credential whose password is [`PASSWORD`].
pub fn credential() -> Credential {
    let hash = pwhash::sha512_crypt::hash_with("$6$rounds=1000$fadelock", PASSWORD)
        .expect("test hash");
    Credential::from_hash(hash).expect("usable test hash")
}

impl IdleCounter for Fake {
    fn read(&self) -> Result<IdleMillis, BackendError> {
        let state = self.state.borrow();
        if state.counter_missing {
            return Err(BackendError::NoIdleCounter);
        }
        Ok(state.idle)
    }

    fn watch(
        &mut self,
        direction: Direction,
        threshold: IdleMillis,
    ) -> Result<WatchHandle, BackendError> {
        let mut state = self.state.borrow_mut();
        if state.counter_missing {
            return Err(BackendError::NoIdleCounter);
        }

        let handle = match direction {
            Direction::Rising => RISING,
            Direction::Falling => FALLING,
        };
        state.watches.insert(
            direction,
            Watch {
                handle,
                threshold,
                active: true,
            },
        );
        state.watch_calls.push((direction, threshold));
        Ok(handle)
    }
}

impl GammaControl for Fake {
    fn get_ramp(&self) -> Result<GammaRamp, BackendError> {
        let state = self.state.borrow();
        if state.gamma_missing {
            return Err(BackendError::Gamma("no gamma in fake".to_string()));
        }
        Ok(state.ramp.clone())
    }

    fn set_ramp(&mut self, ramp: &GammaRamp) -> Result<(), BackendError> {
        let mut state = self.state.borrow_mut();
        let brightest = ramp.red.last().copied().unwrap_or_default();
        state.darkest = Some(state.darkest.map_or(brightest, |d| d.min(brightest)));
        state.ramp = ramp.clone();
        state.ramp_writes += 1;
        Ok(())
    }
}

impl LockSurface for Fake {
    fn create_overlay(&mut self) -> Result<(), BackendError> {
        self.state.borrow_mut().overlay = true;
        Ok(())
    }

    fn destroy_overlay(&mut self) -> Result<(), BackendError> {
        self.state.borrow_mut().overlay = false;
        Ok(())
    }

    fn grab_input(&mut self) -> Result<(), BackendError> {
        let mut state = self.state.borrow_mut();
        state.grab_attempts += 1;
        if state.grab_denials > 0 {
            state.grab_denials -= 1;
            return Err(BackendError::GrabDenied);
        }
        state.grabbed = true;
        state.locked_at = Some(Instant::now());
        Ok(())
    }

    fn release_input(&mut self) -> Result<(), BackendError> {
        self.state.borrow_mut().grabbed = false;
        Ok(())
    }

    fn show_failure(&mut self, failing: bool) -> Result<(), BackendError> {
        self.state
            .borrow_mut()
            .failure_log
            .push((failing, Instant::now()));
        Ok(())
    }

    fn set_display_sleep(&mut self, after: Option<Duration>) -> Result<(), BackendError> {
        self.state.borrow_mut().display_sleep = after;
        Ok(())
    }

    fn pointer_corner(&self) -> Result<Option<Corner>, BackendError> {
        Ok(self.state.borrow().pointer)
    }
}

#[async_trait(?Send)]
impl EventSource for Fake {
    async fn wait(&mut self, deadline: Option<Instant>) -> WaitOutcome {
        let next = self
            .state
            .borrow()
            .script
            .front()
            .map(|(offset, _)| self.start + *offset);

        match next {
            Some(at) if at <= Instant::now() || deadline.is_none_or(|d| at <= d) => {
                tokio::time::sleep_until(at).await;
                let event = self.state.borrow_mut().script.pop_front().map(|(_, e)| e);
                match event {
                    Some(event) => WaitOutcome::Delivered(event),
                    None => WaitOutcome::Failed(BackendError::ConnectionLost(
                        "script drained concurrently".to_string(),
                    )),
                }
            }
            _ => match deadline {
                Some(deadline) => {
                    tokio::time::sleep_until(deadline).await;
                    WaitOutcome::TimedOut
                }
                None => WaitOutcome::Failed(BackendError::ConnectionLost(
                    "script exhausted".to_string(),
                )),
            },
        }
    }
}
