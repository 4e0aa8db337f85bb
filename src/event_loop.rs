//! Single-threaded driver for the idle, fade and lock state machines.
//!
//! One loop waits for whichever comes first: a display event, the next fade
//! step, the failure-indication timeout or cancellation. Timers are plain
//! deadlines owned by the controllers, so superseding one is just replacing
//! it.

use std::collections::VecDeque;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::action::PostFadeAction;
use crate::alarm::{AlarmError, AlarmOutcome, AlarmScheduler};
use crate::backend::{BackendError, EventSource, WaitOutcome};
use crate::domain::{Corner, Direction, IdleMillis, SessionEvent, SessionState};
use crate::fade::{FadeController, FadeStep};
use crate::lock::{LockController, LockError};

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Another invocation asked us to quit.
    QuitRequested,
    /// The cancellation token fired (signal).
    Cancelled,
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Alarm(#[from] AlarmError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("Display event stream failed: {0}")]
    Events(#[source] BackendError),
}

/// The session context: every piece of state the loop mutates.
pub struct EventLoop<E: EventSource> {
    events: E,
    alarms: AlarmScheduler,
    fade: FadeController,
    lock: LockController,
    post_fade: Option<PostFadeAction>,
    veto_corner: Option<Corner>,
    /// Events held back while a fade runs, replayed once it ends.
    deferred: VecDeque<SessionEvent>,
    cancel: CancellationToken,
}

impl<E: EventSource> EventLoop<E> {
    pub fn new(
        events: E,
        alarms: AlarmScheduler,
        fade: FadeController,
        lock: LockController,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            events,
            alarms,
            fade,
            lock,
            post_fade: None,
            veto_corner: None,
            deferred: VecDeque::new(),
            cancel,
        }
    }

    #[must_use]
    pub fn with_post_fade(mut self, action: Option<PostFadeAction>) -> Self {
        self.post_fade = action;
        self
    }

    #[must_use]
    pub fn with_veto_corner(mut self, corner: Option<Corner>) -> Self {
        self.veto_corner = corner;
        self
    }

    pub fn session_state(&self) -> SessionState {
        self.lock.state()
    }

    pub fn is_fading(&self) -> bool {
        self.fade.is_active()
    }

    /// Arm the idle watchpoints and run until quit or cancellation.
    pub async fn run(&mut self, lock_on_start: bool) -> Result<ExitReason, SessionError> {
        self.alarms.start()?;
        if lock_on_start {
            self.lock.lock().await?;
        }
        info!(
            "Watching for {} of inactivity",
            self.alarms.idle_threshold()
        );

        loop {
            if !self.fade.is_active()
                && let Some(event) = self.deferred.pop_front()
            {
                trace!("Replaying deferred {}", redact(&event));
                if let Some(reason) = self.dispatch(event).await? {
                    return Ok(reason);
                }
                continue;
            }

            let deadline = self.next_deadline();
            let outcome = tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    debug!("Cancellation requested");
                    self.abort_fade();
                    return Ok(ExitReason::Cancelled);
                }
                outcome = self.events.wait(deadline) => outcome,
            };

            match outcome {
                WaitOutcome::TimedOut => self.on_deadline(Instant::now()).await?,
                WaitOutcome::Delivered(event) => {
                    if let Some(reason) = self.dispatch(event).await? {
                        return Ok(reason);
                    }
                }
                WaitOutcome::Failed(e) => {
                    self.abort_fade();
                    return Err(SessionError::Events(e));
                }
            }
        }
    }

    /// Soonest of the fade step and failure timeout deadlines.
    fn next_deadline(&self) -> Option<Instant> {
        match (self.fade.next_deadline(), self.lock.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    async fn on_deadline(&mut self, now: Instant) -> Result<(), SessionError> {
        if self.lock.next_deadline().is_some_and(|d| d <= now) {
            self.lock.on_fail_timeout(now);
        }

        if self.fade.next_deadline().is_some_and(|d| d <= now) {
            match self.fade.step(now) {
                Ok(FadeStep::Stepped) => {}
                Ok(FadeStep::Completed) => self.complete_fade().await?,
                Err(e) => {
                    warn!("Fade failed ({}), locking immediately", e);
                    self.lock.lock().await?;
                }
            }
        }
        Ok(())
    }

    async fn complete_fade(&mut self) -> Result<(), SessionError> {
        self.lock.lock().await?;

        if let Some(action) = &self.post_fade
            && let Err(e) = action.spawn()
        {
            warn!("Failed to run post-fade command: {}", e);
        }
        Ok(())
    }

    /// Route an event, aborting or deferring around a running fade.
    async fn dispatch(&mut self, event: SessionEvent) -> Result<Option<ExitReason>, SessionError> {
        if self.fade.is_active() {
            if self.aborts_fade(&event) {
                self.abort_fade();
            } else {
                trace!("Deferring {} until the fade ends", redact(&event));
                self.deferred.push_back(event);
                return Ok(None);
            }
        }
        self.handle(event).await
    }

    fn aborts_fade(&self, event: &SessionEvent) -> bool {
        match event {
            SessionEvent::WatchFired { handle, .. } => {
                self.alarms.direction_of(*handle) == Some(Direction::Falling)
            }
            SessionEvent::Key(key) => key.hotkey,
            SessionEvent::LockRequested | SessionEvent::QuitRequested => true,
            SessionEvent::PointerMotion => false,
        }
    }

    fn abort_fade(&mut self) {
        if let Err(e) = self.fade.abort() {
            warn!("Failed to restore gamma after fade: {}", e);
        }
    }

    async fn handle(&mut self, event: SessionEvent) -> Result<Option<ExitReason>, SessionError> {
        match event {
            SessionEvent::WatchFired { handle, value } => {
                match self.alarms.on_fired(handle, value)? {
                    AlarmOutcome::IdleReached(value) => self.on_idle_reached(value).await?,
                    AlarmOutcome::ActivityResumed | AlarmOutcome::Stale => {}
                }
            }
            SessionEvent::Key(key) if key.hotkey => {
                if !self.lock.state().is_locked() {
                    info!("Lock hotkey pressed");
                    self.lock.lock().await?;
                }
            }
            SessionEvent::Key(key) => {
                self.lock.on_key(&key, Instant::now())?;
            }
            SessionEvent::PointerMotion => trace!("Pointer motion"),
            SessionEvent::LockRequested => {
                info!("Lock requested");
                self.lock.lock().await?;
            }
            SessionEvent::QuitRequested if self.lock.state().is_locked() => {
                warn!("Ignoring quit request while locked");
            }
            SessionEvent::QuitRequested => {
                info!("Quit requested");
                return Ok(Some(ExitReason::QuitRequested));
            }
        }
        Ok(None)
    }

    async fn on_idle_reached(&mut self, value: IdleMillis) -> Result<(), SessionError> {
        if self.lock.state().is_locked() {
            trace!("Idle at {} while locked", value);
            return Ok(());
        }
        if self.fade.is_active() {
            return Ok(());
        }

        if let Some(veto) = self.veto_corner {
            match self.lock.surface().pointer_corner() {
                Ok(Some(corner)) if corner == veto => {
                    info!("Pointer in {:?} corner, not fading", corner);
                    return Ok(());
                }
                Ok(_) => {}
                Err(e) => warn!("Failed to query pointer position: {}", e),
            }
        }

        info!("Idle for {}, fading out", value);
        if let Err(e) = self.fade.begin(Instant::now()) {
            warn!("Cannot fade ({}), locking immediately", e);
            self.lock.lock().await?;
        }
        Ok(())
    }
}

/// Key text never reaches the logs.
fn redact(event: &SessionEvent) -> &'static str {
    match event {
        SessionEvent::WatchFired { .. } => "watchpoint fire",
        SessionEvent::Key(_) => "key press",
        SessionEvent::PointerMotion => "pointer motion",
        SessionEvent::LockRequested => "lock request",
        SessionEvent::QuitRequested => "quit request",
    }
}
