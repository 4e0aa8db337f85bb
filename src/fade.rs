//! Interruptible brightness fade played before locking.

use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::backend::{BackendError, GammaControl};
use crate::domain::GammaRamp;

/// Shape of the fade animation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FadeSettings {
    /// Total time from full brightness to the floor.
    pub duration: Duration,
    pub steps: u32,
    /// Ratio at which the fade counts as finished.
    pub floor: f64,
}

impl Default for FadeSettings {
    fn default() -> Self {
        Self {
            duration: Duration::from_millis(2000),
            steps: 1200,
            floor: 0.01,
        }
    }
}

impl FadeSettings {
    /// Time between two steps.
    pub fn interval(&self) -> Duration {
        self.duration / self.steps.max(1)
    }

    fn decrement(&self) -> f64 {
        1.0 / f64::from(self.steps.max(1))
    }
}

#[derive(Error, Debug)]
pub enum FadeError {
    #[error("Gamma control failed during fade: {0}")]
    Gamma(#[from] BackendError),
}

/// Result of advancing the fade by one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FadeStep {
    /// A dimmer ramp was applied; another step is due.
    Stepped,
    /// The floor was reached and the baseline restored.
    Completed,
}

#[derive(Debug)]
struct FadeSession {
    baseline: GammaRamp,
    ratio: f64,
    next_step: Instant,
}

/// Owns the display gamma ramp for the lifetime of the process.
///
/// The ramp captured when a fade begins is written back whenever that fade
/// ends, however it ends, including when the controller is dropped.
pub struct FadeController {
    gamma: Box<dyn GammaControl>,
    settings: FadeSettings,
    session: Option<FadeSession>,
}

impl FadeController {
    pub fn new(gamma: Box<dyn GammaControl>, settings: FadeSettings) -> Self {
        Self {
            gamma,
            settings,
            session: None,
        }
    }

    /// Capture the current ramp and schedule the first step at `now`.
    pub fn begin(&mut self, now: Instant) -> Result<(), FadeError> {
        if self.session.is_some() {
            return Ok(());
        }

        let baseline = self.gamma.get_ramp()?;
        debug!(
            "Fade started ({} samples, {} steps over {:?})",
            baseline.len(),
            self.settings.steps,
            self.settings.duration
        );
        self.session = Some(FadeSession {
            baseline,
            ratio: 1.0,
            next_step: now,
        });
        Ok(())
    }

    /// Apply the next step.
    ///
    /// Calling this with no fade running reports [`FadeStep::Completed`].
    pub fn step(&mut self, now: Instant) -> Result<FadeStep, FadeError> {
        let Some(session) = self.session.as_mut() else {
            return Ok(FadeStep::Completed);
        };

        if session.ratio <= self.settings.floor {
            self.finish()?;
            debug!("Fade completed");
            return Ok(FadeStep::Completed);
        }

        let ramp = session.baseline.scaled(session.ratio);
        if let Err(e) = self.gamma.set_ramp(&ramp) {
            // Leave the display as bright as we found it before bailing
            self.finish()?;
            return Err(e.into());
        }

        session.ratio -= self.settings.decrement();
        session.next_step += self.settings.interval();
        if session.next_step < now {
            trace!("Fade running behind by {:?}", now - session.next_step);
        }
        Ok(FadeStep::Stepped)
    }

    /// Stop a running fade and restore the baseline.
    ///
    /// Returns whether a fade was running.
    pub fn abort(&mut self) -> Result<bool, FadeError> {
        if self.session.is_none() {
            return Ok(false);
        }
        self.finish()?;
        debug!("Fade aborted");
        Ok(true)
    }

    /// When the next step is due, if fading.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.session.as_ref().map(|s| s.next_step)
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    /// Current brightness ratio, if fading.
    #[cfg(test)]
    pub fn ratio(&self) -> Option<f64> {
        self.session.as_ref().map(|s| s.ratio)
    }

    fn finish(&mut self) -> Result<(), FadeError> {
        if let Some(session) = self.session.take() {
            self.gamma.set_ramp(&session.baseline)?;
        }
        Ok(())
    }
}

impl Drop for FadeController {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            warn!("Failed to restore gamma ramp: {}", e);
        }
    }
}
