//! Lock state machine: overlay, input grab, password entry and failure timer.

use std::fmt;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::auth::Credential;
use crate::backend::{BackendError, LockSurface};
use crate::domain::{KeyPress, SessionState};
use crate::keysym::{self, KeyClass};

/// Maximum number of characters the entry buffer holds.
pub const ENTRY_CAPACITY: usize = 255;

/// Text typed at the lock prompt.
///
/// Never printed: the `Debug` output only shows the length.
#[derive(Default)]
pub struct EntryBuffer {
    text: String,
    chars: usize,
}

impl EntryBuffer {
    /// Append `text` if it fits entirely; returns whether it was added.
    pub fn push_str(&mut self, text: &str) -> bool {
        let count = text.chars().count();
        if self.chars + count > ENTRY_CAPACITY {
            return false;
        }
        self.text.push_str(text);
        self.chars += count;
        true
    }

    /// Remove the last character.
    pub fn pop(&mut self) -> bool {
        if self.text.pop().is_some() {
            self.chars -= 1;
            true
        } else {
            false
        }
    }

    pub fn clear(&mut self) {
        self.text.clear();
        self.chars = 0;
    }

    /// Length in characters.
    pub fn len(&self) -> usize {
        self.chars
    }

    pub fn is_empty(&self) -> bool {
        self.chars == 0
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }
}

impl fmt::Debug for EntryBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryBuffer")
            .field("len", &self.chars)
            .finish_non_exhaustive()
    }
}

/// Retry schedule for acquiring the input grab.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrabPolicy {
    pub attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for GrabPolicy {
    fn default() -> Self {
        Self {
            attempts: 100,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(20),
        }
    }
}

/// Timings and behaviour of the lock screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockSettings {
    /// How long the failure indication stays on after a bad attempt.
    pub fail_timeout: Duration,
    /// Display sleep timeout while locked.
    pub prelock_sleep: Duration,
    /// Keep typed text after a failed attempt instead of clearing it.
    pub keep_entry_on_failure: bool,
    pub grab: GrabPolicy,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            fail_timeout: Duration::from_millis(500),
            prelock_sleep: Duration::from_secs(10),
            keep_entry_on_failure: false,
            grab: GrabPolicy::default(),
        }
    }
}

#[derive(Error, Debug)]
pub enum LockError {
    #[error("Could not grab keyboard and pointer after {attempts} attempts")]
    GrabExhausted { attempts: u32 },

    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// What a key press did while locked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOutcome {
    /// The entry buffer changed (or was already in the requested state).
    Edited,
    /// The password verified and the session is unlocked.
    Unlocked,
    /// The password did not verify.
    Failed,
    /// The key has no effect in the current state.
    Ignored,
}

/// Owns the session lock state and everything that hangs off it.
pub struct LockController {
    surface: Box<dyn LockSurface>,
    credential: Credential,
    settings: LockSettings,
    state: SessionState,
    entry: EntryBuffer,
    fail_deadline: Option<Instant>,
}

impl LockController {
    pub fn new(
        surface: Box<dyn LockSurface>,
        credential: Credential,
        settings: LockSettings,
    ) -> Self {
        Self {
            surface,
            credential,
            settings,
            state: SessionState::Unlocked,
            entry: EntryBuffer::default(),
            fail_deadline: None,
        }
    }

    /// Lock the session: map the overlay, grab input, shorten display sleep.
    ///
    /// Locking an already locked session does nothing.
    pub async fn lock(&mut self) -> Result<(), LockError> {
        if self.state.is_locked() {
            trace!("Lock requested while already locked");
            return Ok(());
        }

        self.surface.create_overlay()?;
        if let Err(e) = self.grab_with_backoff().await {
            if let Err(cleanup) = self.surface.destroy_overlay() {
                warn!("Failed to remove overlay after grab failure: {}", cleanup);
            }
            return Err(e);
        }

        self.set_display_sleep(Some(self.settings.prelock_sleep));
        self.entry.clear();
        self.fail_deadline = None;
        self.state = SessionState::Locked;
        info!("Session locked");
        Ok(())
    }

    async fn grab_with_backoff(&mut self) -> Result<(), LockError> {
        let policy = self.settings.grab;
        let mut backoff = policy.initial_backoff;

        for attempt in 1..=policy.attempts {
            match self.surface.grab_input() {
                Ok(()) => {
                    if attempt > 1 {
                        debug!("Input grabbed after {} attempts", attempt);
                    }
                    return Ok(());
                }
                Err(BackendError::GrabDenied) => {
                    trace!("Grab attempt {} denied, retrying in {:?}", attempt, backoff);
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(policy.max_backoff);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(LockError::GrabExhausted {
            attempts: policy.attempts,
        })
    }

    /// Handle a key press at the lock prompt.
    pub fn on_key(&mut self, key: &KeyPress, now: Instant) -> Result<KeyOutcome, LockError> {
        if !self.state.is_locked() || key.hotkey {
            return Ok(KeyOutcome::Ignored);
        }

        let outcome = match keysym::classify(key.keysym) {
            KeyClass::Enter => self.submit(now)?,
            KeyClass::Escape => {
                self.entry.clear();
                KeyOutcome::Edited
            }
            KeyClass::Backspace => {
                self.entry.pop();
                KeyOutcome::Edited
            }
            KeyClass::Ignored => KeyOutcome::Ignored,
            KeyClass::Text => {
                let printable = key.text.chars().next().is_some_and(|c| !c.is_control());
                if !printable {
                    KeyOutcome::Ignored
                } else if self.entry.push_str(&key.text) {
                    KeyOutcome::Edited
                } else {
                    trace!("Entry buffer full, dropping input");
                    KeyOutcome::Ignored
                }
            }
        };
        Ok(outcome)
    }

    fn submit(&mut self, now: Instant) -> Result<KeyOutcome, LockError> {
        if self.credential.verify(self.entry.as_str()) {
            self.unlock()?;
            return Ok(KeyOutcome::Unlocked);
        }

        info!("Authentication failed");
        if self.state != SessionState::LockedAuthFail {
            self.show_failure(true);
        }
        self.state = SessionState::LockedAuthFail;
        self.fail_deadline = Some(now + self.settings.fail_timeout);
        if !self.settings.keep_entry_on_failure {
            self.entry.clear();
        }
        Ok(KeyOutcome::Failed)
    }

    fn unlock(&mut self) -> Result<(), LockError> {
        self.surface.release_input()?;
        self.surface.destroy_overlay()?;
        self.set_display_sleep(None);
        self.entry.clear();
        self.fail_deadline = None;
        self.state = SessionState::Unlocked;
        info!("Session unlocked");
        Ok(())
    }

    /// Clear the failure indication once its deadline has passed.
    pub fn on_fail_timeout(&mut self, now: Instant) {
        match self.fail_deadline {
            Some(deadline) if deadline <= now => {
                self.fail_deadline = None;
                if self.state == SessionState::LockedAuthFail {
                    self.show_failure(false);
                    self.state = SessionState::Locked;
                    debug!("Failure indication cleared");
                }
            }
            _ => {}
        }
    }

    /// When the failure indication is due to be cleared.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.fail_deadline
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn entry_len(&self) -> usize {
        self.entry.len()
    }

    pub fn surface(&self) -> &dyn LockSurface {
        self.surface.as_ref()
    }

    fn show_failure(&mut self, failing: bool) {
        if let Err(e) = self.surface.show_failure(failing) {
            warn!("Failed to update failure indication: {}", e);
        }
    }

    fn set_display_sleep(&mut self, after: Option<Duration>) {
        if let Err(e) = self.surface.set_display_sleep(after) {
            warn!("Failed to set display sleep timeout: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::{self, Fake, PASSWORD};

    fn controller(fake: &Fake, settings: LockSettings) -> LockController {
        LockController::new(Box::new(fake.clone()), fake::credential(), settings)
    }

    fn press(lock: &mut LockController, c: char) -> KeyOutcome {
        lock.on_key(&KeyPress::new(u32::from(c), c.to_string()), Instant::now())
            .unwrap()
    }

    fn type_text(lock: &mut LockController, text: &str) {
        for c in text.chars() {
            press(lock, c);
        }
    }

    fn enter(lock: &mut LockController, now: Instant) -> KeyOutcome {
        lock.on_key(&KeyPress::new(keysym::RETURN, ""), now).unwrap()
    }

    #[test]
    fn test_entry_buffer_capacity() {
        let mut entry = EntryBuffer::default();
        for _ in 0..ENTRY_CAPACITY {
            assert!(entry.push_str("é"));
        }
        assert!(!entry.push_str("a"));
        assert_eq!(entry.len(), ENTRY_CAPACITY);

        assert!(entry.pop());
        assert!(entry.push_str("a"));
        assert!(!entry.push_str("bc"));
    }

    #[test]
    fn test_entry_buffer_debug_hides_text() {
        let mut entry = EntryBuffer::default();
        entry.push_str("secret");
        let printed = format!("{entry:?}");
        assert!(!printed.contains("secret"));
        assert!(printed.contains('6'));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_sets_up_surface() {
        let fake = Fake::new();
        let mut lock = controller(&fake, LockSettings::default());

        lock.lock().await.unwrap();

        assert_eq!(lock.state(), SessionState::Locked);
        let state = fake.state();
        assert!(state.overlay);
        assert!(state.grabbed);
        assert_eq!(state.display_sleep, Some(Duration::from_secs(10)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_grab_retries_with_capped_backoff() {
        let fake = Fake::new();
        fake.state_mut().grab_denials = 8;
        let mut lock = controller(&fake, LockSettings::default());
        let start = Instant::now();

        lock.lock().await.unwrap();

        // 1 + 2 + 4 + 8 + 16 + 20 + 20 + 20
        assert_eq!(start.elapsed(), Duration::from_millis(91));
        assert_eq!(fake.state().grab_attempts, 9);
        assert!(lock.state().is_locked());
    }

    #[tokio::test(start_paused = true)]
    async fn test_grab_exhaustion_is_fatal() {
        let fake = Fake::new();
        fake.state_mut().grab_denials = u32::MAX;
        let settings = LockSettings {
            grab: GrabPolicy {
                attempts: 5,
                ..GrabPolicy::default()
            },
            ..LockSettings::default()
        };
        let mut lock = controller(&fake, settings);

        let err = lock.lock().await.unwrap_err();

        assert!(matches!(err, LockError::GrabExhausted { attempts: 5 }));
        assert_eq!(lock.state(), SessionState::Unlocked);
        assert!(!fake.state().overlay);
    }

    #[tokio::test(start_paused = true)]
    async fn test_correct_password_unlocks() {
        let fake = Fake::new();
        let mut lock = controller(&fake, LockSettings::default());
        lock.lock().await.unwrap();

        type_text(&mut lock, PASSWORD);
        assert_eq!(lock.entry_len(), PASSWORD.len());
        assert_eq!(enter(&mut lock, Instant::now()), KeyOutcome::Unlocked);

        assert_eq!(lock.state(), SessionState::Unlocked);
        assert_eq!(lock.entry_len(), 0);
        let state = fake.state();
        assert!(!state.grabbed);
        assert!(!state.overlay);
        assert_eq!(state.display_sleep, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrong_password_then_timeout() {
        let fake = Fake::new();
        let mut lock = controller(&fake, LockSettings::default());
        lock.lock().await.unwrap();
        let now = Instant::now();

        type_text(&mut lock, "wrongpass");
        assert_eq!(enter(&mut lock, now), KeyOutcome::Failed);

        assert_eq!(lock.state(), SessionState::LockedAuthFail);
        assert_eq!(lock.next_deadline(), Some(now + Duration::from_millis(500)));
        assert_eq!(lock.entry_len(), 0);

        // Not yet due
        lock.on_fail_timeout(now + Duration::from_millis(499));
        assert_eq!(lock.state(), SessionState::LockedAuthFail);

        press(&mut lock, 'x');
        lock.on_fail_timeout(now + Duration::from_millis(500));
        assert_eq!(lock.state(), SessionState::Locked);
        assert_eq!(lock.next_deadline(), None);
        // The timeout leaves typed text alone
        assert_eq!(lock.entry_len(), 1);

        let failures: Vec<bool> = fake.state().failure_log.iter().map(|(f, _)| *f).collect();
        assert_eq!(failures, vec![true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_while_failing_rearms_timeout() {
        let fake = Fake::new();
        let mut lock = controller(&fake, LockSettings::default());
        lock.lock().await.unwrap();
        let now = Instant::now();

        enter(&mut lock, now);
        let later = now + Duration::from_millis(300);
        enter(&mut lock, later);

        assert_eq!(
            lock.next_deadline(),
            Some(later + Duration::from_millis(500))
        );
        // Indication switched on once, not stacked
        assert_eq!(fake.state().failure_log.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_entry_on_failure() {
        let fake = Fake::new();
        let settings = LockSettings {
            keep_entry_on_failure: true,
            ..LockSettings::default()
        };
        let mut lock = controller(&fake, settings);
        lock.lock().await.unwrap();

        type_text(&mut lock, "hunter");
        assert_eq!(enter(&mut lock, Instant::now()), KeyOutcome::Failed);
        assert_eq!(lock.entry_len(), 6);

        // Completing the retained text now verifies
        press(&mut lock, '2');
        assert_eq!(enter(&mut lock, Instant::now()), KeyOutcome::Unlocked);
    }

    #[tokio::test(start_paused = true)]
    async fn test_editing_keys() {
        let fake = Fake::new();
        let mut lock = controller(&fake, LockSettings::default());
        lock.lock().await.unwrap();
        let now = Instant::now();

        type_text(&mut lock, "abc");
        lock.on_key(&KeyPress::new(keysym::BACKSPACE, "\u{8}"), now)
            .unwrap();
        assert_eq!(lock.entry_len(), 2);

        lock.on_key(&KeyPress::new(keysym::ESCAPE, "\u{1b}"), now)
            .unwrap();
        assert_eq!(lock.entry_len(), 0);

        // Backspace on an empty buffer is harmless
        lock.on_key(&KeyPress::new(keysym::BACKSPACE, ""), now)
            .unwrap();
        assert_eq!(lock.entry_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ignored_keys() {
        let fake = Fake::new();
        let mut lock = controller(&fake, LockSettings::default());
        lock.lock().await.unwrap();
        let now = Instant::now();

        let ignored = [
            KeyPress::new(keysym::F1, ""),
            KeyPress::new(0xffe1, ""),        // Shift_L
            KeyPress::new(0xff09, "\t"),      // Tab
            KeyPress::new(0xffb1, "1"),       // KP_1
            KeyPress::new(u32::from('a'), ""), // no text
            KeyPress::hotkey(keysym::INSERT),
        ];
        for key in &ignored {
            assert_eq!(lock.on_key(key, now).unwrap(), KeyOutcome::Ignored, "{key:?}");
        }
        assert_eq!(lock.entry_len(), 0);
    }

    #[test]
    fn test_keys_ignored_while_unlocked() {
        let fake = Fake::new();
        let mut lock = controller(&fake, LockSettings::default());

        assert_eq!(press(&mut lock, 'a'), KeyOutcome::Ignored);
        assert_eq!(enter(&mut lock, Instant::now()), KeyOutcome::Ignored);
        assert_eq!(lock.entry_len(), 0);
        assert_eq!(lock.state(), SessionState::Unlocked);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_twice_is_noop() {
        let fake = Fake::new();
        let mut lock = controller(&fake, LockSettings::default());
        lock.lock().await.unwrap();
        type_text(&mut lock, "abc");

        lock.lock().await.unwrap();

        assert_eq!(fake.state().grab_attempts, 1);
        assert_eq!(lock.entry_len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_never_exceeds_capacity() {
        let fake = Fake::new();
        let mut lock = controller(&fake, LockSettings::default());
        lock.lock().await.unwrap();

        for i in 0..1000u32 {
            let c = char::from_u32(u32::from('a') + i % 26).unwrap();
            press(&mut lock, c);
            assert!(lock.entry_len() <= ENTRY_CAPACITY);
        }
        assert_eq!(lock.entry_len(), ENTRY_CAPACITY);
    }
}
