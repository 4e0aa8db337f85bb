//! X11 backend: SYNC idle counter, XF86VidMode gamma, DPMS and the lock
//! window, all over one x11rb connection.

use std::env;
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::unix::AsyncFd;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use x11rb::connection::Connection;
use x11rb::errors::{ConnectError, ConnectionError, ReplyError, ReplyOrIdError};
use x11rb::protocol::Event;
use x11rb::protocol::dpms::ConnectionExt as _;
use x11rb::protocol::sync::{self, ConnectionExt as _};
use x11rb::protocol::xf86vidmode::ConnectionExt as _;
use x11rb::protocol::xproto::{
    self, Blanking, ChangeWindowAttributesAux, ConnectionExt as _, CreateWindowAux, EventMask,
    Exposures, GrabMode, GrabStatus, KeyButMask, ModMask, Property, Window, WindowClass,
};
use x11rb::rust_connection::RustConnection;

use super::instance::{self, InstanceGuard, Request};
use super::keymap::Keymap;
use super::{BackendError, EventSource, GammaControl, IdleCounter, LockSurface, WaitOutcome};
use crate::config::Palette;
use crate::domain::{
    Corner, Direction, GammaRamp, IdleMillis, KeyPress, SessionEvent, WatchHandle,
};
use crate::keysym;

x11rb::atom_manager! {
    pub Atoms: AtomsCookie {
        _FADELOCK_RUNNING,
        _FADELOCK_REQUEST,
    }
}

/// Glyph from the standard cursor font shown on the lock window (XC_top_left_arrow).
const CURSOR_GLYPH: u16 = 132;

impl From<ConnectError> for BackendError {
    fn from(err: ConnectError) -> Self {
        Self::DisplayUnavailable(err.to_string())
    }
}

impl From<ConnectionError> for BackendError {
    fn from(err: ConnectionError) -> Self {
        Self::ConnectionLost(err.to_string())
    }
}

impl From<ReplyError> for BackendError {
    fn from(err: ReplyError) -> Self {
        match err {
            ReplyError::ConnectionError(e) => e.into(),
            ReplyError::X11Error(e) => Self::Request(format!("{:?}", e.error_kind)),
        }
    }
}

impl From<ReplyOrIdError> for BackendError {
    fn from(err: ReplyOrIdError) -> Self {
        match err {
            ReplyOrIdError::ConnectionError(e) => e.into(),
            ReplyOrIdError::X11Error(e) => Self::Request(format!("{:?}", e.error_kind)),
            ReplyOrIdError::IdsExhausted => Self::Request("resource ids exhausted".to_string()),
        }
    }
}

/// Sync counter values are split into a signed high and unsigned low word.
#[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
fn to_int64(value: IdleMillis) -> sync::Int64 {
    let raw = value.as_millis();
    sync::Int64 {
        hi: (raw >> 32) as i32,
        lo: raw as u32,
    }
}

fn from_int64(value: sync::Int64) -> IdleMillis {
    IdleMillis::new((i64::from(value.hi) << 32) | i64::from(value.lo))
}

/// Open connection plus the screen facts every component needs.
pub struct X11Backend {
    conn: Rc<RustConnection>,
    screen_num: usize,
    root: Window,
    width: u16,
    height: u16,
    atoms: Atoms,
    keymap: Keymap,
}

impl X11Backend {
    /// Connect to `display`, or `$DISPLAY` when `None`.
    pub fn connect(display: Option<&str>) -> Result<Self, BackendError> {
        let (conn, screen_num) = RustConnection::connect(display)?;
        let screen = &conn.setup().roots[screen_num];
        let (root, width, height) = (screen.root, screen.width_in_pixels, screen.height_in_pixels);

        let atoms = Atoms::new(&conn)?.reply()?;
        let keymap = Keymap::load(&conn)?;
        info!(
            "Connected to X display (screen {}, {}x{})",
            screen_num, width, height
        );

        Ok(Self {
            conn: Rc::new(conn),
            screen_num,
            root,
            width,
            height,
            atoms,
            keymap,
        })
    }

    /// Environment relevant to reaching the display, for error reports.
    pub fn diagnostics() -> Vec<String> {
        ["DISPLAY", "XAUTHORITY"]
            .iter()
            .map(|var| match env::var(var) {
                Ok(v) => format!("{var}={v}"),
                Err(_) => format!("{var}: NOT SET"),
            })
            .collect()
    }

    pub fn idle_counter(&self) -> Result<X11IdleCounter, BackendError> {
        X11IdleCounter::new(Rc::clone(&self.conn))
    }

    pub fn gamma(&self) -> Result<X11Gamma, BackendError> {
        X11Gamma::new(Rc::clone(&self.conn), self.screen_num)
    }

    pub fn lock_surface(&self, palette: Palette) -> Result<X11Surface, BackendError> {
        X11Surface::new(self, palette)
    }

    /// Event stream translating server events for the state machines.
    pub fn event_source(&self, hotkey: u32) -> Result<X11Events, BackendError> {
        let fd = AsyncFd::new(ConnectionFd(self.conn.stream().as_raw_fd()))
            .map_err(|e| BackendError::ConnectionLost(e.to_string()))?;

        Ok(X11Events {
            conn: Rc::clone(&self.conn),
            fd,
            root: self.root,
            atoms: self.atoms,
            keymap: self.keymap.clone(),
            hotkey: self.keymap.keycode_for(hotkey),
        })
    }

    /// Take over screen blanking and register the global lock hotkey.
    pub fn prepare_session(
        &self,
        hotkey: u32,
        idle_timeout: Duration,
    ) -> Result<SessionGuard, BackendError> {
        let conn = &self.conn;

        conn.set_screen_saver(0, 0, Blanking::PREFERRED, Exposures::ALLOWED)?;

        let dpms = conn
            .dpms_get_version(1, 1)
            .ok()
            .and_then(|cookie| cookie.reply().ok())
            .is_some();
        if dpms {
            conn.dpms_set_timeouts(0, 0, 0)?;
        } else {
            warn!("DPMS unavailable; display power is left to the server");
        }

        let keycode = self.keymap.keycode_for(hotkey);
        match keycode {
            Some(keycode) => {
                conn.grab_key(
                    true,
                    self.root,
                    ModMask::ANY,
                    keycode,
                    GrabMode::ASYNC,
                    GrabMode::ASYNC,
                )?;
            }
            None => warn!("Lock key {:#x} is not on the keyboard", hotkey),
        }

        conn.change_window_attributes(
            self.root,
            &ChangeWindowAttributesAux::new().event_mask(EventMask::PROPERTY_CHANGE),
        )?;
        conn.flush()?;
        debug!("Screen saver disabled and lock key grabbed");

        Ok(SessionGuard {
            conn: Rc::clone(&self.conn),
            root: self.root,
            keycode,
            dpms,
            off_after: u16::try_from(idle_timeout.as_secs()).unwrap_or(u16::MAX),
        })
    }

    /// Pid of another live instance on this display.
    pub fn running_instance(&self) -> Result<Option<u32>, BackendError> {
        instance::running_pid(&self.conn, self.root, &self.atoms)
    }

    pub fn send_request(&self, request: Request) -> Result<(), BackendError> {
        instance::send_request(&self.conn, self.root, &self.atoms, request)
    }

    pub fn claim_instance(&self) -> Result<InstanceGuard, BackendError> {
        InstanceGuard::claim(Rc::clone(&self.conn), self.root, &self.atoms)
    }
}

/// Undoes [`X11Backend::prepare_session`] when dropped.
pub struct SessionGuard {
    conn: Rc<RustConnection>,
    root: Window,
    keycode: Option<u8>,
    dpms: bool,
    off_after: u16,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let restore = || -> Result<(), BackendError> {
            if let Some(keycode) = self.keycode {
                self.conn.ungrab_key(keycode, self.root, ModMask::ANY)?;
            }
            if self.dpms {
                // Leave the display to power down on its own after the idle time
                self.conn.dpms_set_timeouts(0, 0, self.off_after)?;
            }
            self.conn.flush()?;
            Ok(())
        };
        if let Err(e) = restore() {
            warn!("Failed to restore display settings: {}", e);
        }
    }
}

/// The server's `IDLETIME` system counter.
pub struct X11IdleCounter {
    conn: Rc<RustConnection>,
    counter: sync::Counter,
    rising: Option<sync::Alarm>,
    falling: Option<sync::Alarm>,
}

impl X11IdleCounter {
    fn new(conn: Rc<RustConnection>) -> Result<Self, BackendError> {
        let version = conn
            .sync_initialize(3, 1)
            .map_err(|_| BackendError::MissingExtension("SYNC"))?
            .reply()
            .map_err(|_| BackendError::MissingExtension("SYNC"))?;
        debug!(
            "SYNC extension {}.{}",
            version.major_version, version.minor_version
        );

        let counters = conn.sync_list_system_counters()?.reply()?.counters;
        let idle = counters
            .iter()
            .find(|c| c.name == b"IDLETIME")
            .ok_or(BackendError::NoIdleCounter)?;
        trace!(
            "IDLETIME counter {:#x} with resolution {}",
            idle.counter,
            from_int64(idle.resolution)
        );

        Ok(Self {
            counter: idle.counter,
            conn,
            rising: None,
            falling: None,
        })
    }
}

impl IdleCounter for X11IdleCounter {
    fn read(&self) -> Result<IdleMillis, BackendError> {
        let reply = self.conn.sync_query_counter(self.counter)?.reply()?;
        Ok(from_int64(reply.counter_value))
    }

    fn watch(
        &mut self,
        direction: Direction,
        threshold: IdleMillis,
    ) -> Result<WatchHandle, BackendError> {
        let test_type = match direction {
            Direction::Rising => sync::TESTTYPE::POSITIVE_COMPARISON,
            Direction::Falling => sync::TESTTYPE::NEGATIVE_COMPARISON,
        };
        let slot = match direction {
            Direction::Rising => &mut self.rising,
            Direction::Falling => &mut self.falling,
        };

        let alarm = if let Some(alarm) = *slot {
            let aux = sync::ChangeAlarmAux::new()
                .counter(self.counter)
                .value_type(sync::VALUETYPE::ABSOLUTE)
                .value(to_int64(threshold))
                .test_type(test_type)
                .delta(sync::Int64 { hi: 0, lo: 0 })
                .events(1);
            self.conn.sync_change_alarm(alarm, &aux)?;
            alarm
        } else {
            let alarm = self.conn.generate_id()?;
            let aux = sync::CreateAlarmAux::new()
                .counter(self.counter)
                .value_type(sync::VALUETYPE::ABSOLUTE)
                .value(to_int64(threshold))
                .test_type(test_type)
                .delta(sync::Int64 { hi: 0, lo: 0 })
                .events(1);
            self.conn.sync_create_alarm(alarm, &aux)?;
            *slot = Some(alarm);
            alarm
        };
        self.conn.flush()?;

        Ok(WatchHandle::new(alarm))
    }
}

impl Drop for X11IdleCounter {
    fn drop(&mut self) {
        for alarm in [self.rising, self.falling].into_iter().flatten() {
            let _ = self.conn.sync_destroy_alarm(alarm);
        }
        let _ = self.conn.flush();
    }
}

/// Gamma ramp of the screen's CRTC via XF86VidMode.
pub struct X11Gamma {
    conn: Rc<RustConnection>,
    screen: u16,
    size: u16,
}

impl X11Gamma {
    fn new(conn: Rc<RustConnection>, screen_num: usize) -> Result<Self, BackendError> {
        let screen = u16::try_from(screen_num)
            .map_err(|_| BackendError::Gamma(format!("screen {screen_num} out of range")))?;
        let size = conn
            .xf86vidmode_get_gamma_ramp_size(screen)
            .map_err(|_| BackendError::MissingExtension("XFree86-VidModeExtension"))?
            .reply()
            .map_err(|_| BackendError::MissingExtension("XFree86-VidModeExtension"))?
            .size;
        if size == 0 {
            return Err(BackendError::Gamma("server reports an empty ramp".to_string()));
        }

        Ok(Self { conn, screen, size })
    }
}

impl GammaControl for X11Gamma {
    fn get_ramp(&self) -> Result<GammaRamp, BackendError> {
        let reply = self
            .conn
            .xf86vidmode_get_gamma_ramp(self.screen, self.size)?
            .reply()?;
        Ok(GammaRamp::new(reply.red, reply.green, reply.blue))
    }

    fn set_ramp(&mut self, ramp: &GammaRamp) -> Result<(), BackendError> {
        if ramp.len() != usize::from(self.size) {
            return Err(BackendError::Gamma(format!(
                "ramp has {} samples, server expects {}",
                ramp.len(),
                self.size
            )));
        }
        self.conn.xf86vidmode_set_gamma_ramp(
            self.screen,
            self.size,
            &ramp.red,
            &ramp.green,
            &ramp.blue,
        )?;
        self.conn.flush()?;
        Ok(())
    }
}

/// Full-screen override-redirect window with a coloured cursor.
pub struct X11Surface {
    conn: Rc<RustConnection>,
    root: Window,
    width: u16,
    height: u16,
    palette: Palette,
    background_pixel: u32,
    cursor: xproto::Cursor,
    window: Option<Window>,
}

impl X11Surface {
    fn new(backend: &X11Backend, palette: Palette) -> Result<Self, BackendError> {
        let conn = Rc::clone(&backend.conn);
        let colormap = conn.setup().roots[backend.screen_num].default_colormap;

        let (r, g, b) = palette.background.to_rgb16();
        let background_pixel = conn.alloc_color(colormap, r, g, b)?.reply()?.pixel;

        let font = conn.generate_id()?;
        conn.open_font(font, b"cursor")?;
        let cursor = conn.generate_id()?;
        let (fr, fg, fb) = palette.foreground.to_rgb16();
        let (br, bg, bb) = palette.background.to_rgb16();
        conn.create_glyph_cursor(
            cursor,
            font,
            font,
            CURSOR_GLYPH,
            CURSOR_GLYPH + 1,
            fr,
            fg,
            fb,
            br,
            bg,
            bb,
        )?;
        conn.close_font(font)?;

        Ok(Self {
            conn,
            root: backend.root,
            width: backend.width,
            height: backend.height,
            palette,
            background_pixel,
            cursor,
            window: None,
        })
    }
}

impl LockSurface for X11Surface {
    fn create_overlay(&mut self) -> Result<(), BackendError> {
        if self.window.is_some() {
            return Ok(());
        }

        let window = self.conn.generate_id()?;
        let aux = CreateWindowAux::new()
            .background_pixel(self.background_pixel)
            .override_redirect(1)
            .event_mask(EventMask::KEY_PRESS | EventMask::POINTER_MOTION)
            .cursor(self.cursor);
        self.conn.create_window(
            x11rb::COPY_DEPTH_FROM_PARENT,
            window,
            self.root,
            0,
            0,
            self.width,
            self.height,
            0,
            WindowClass::INPUT_OUTPUT,
            x11rb::COPY_FROM_PARENT,
            &aux,
        )?;
        self.conn.map_window(window)?;
        self.conn.flush()?;
        self.window = Some(window);
        Ok(())
    }

    fn destroy_overlay(&mut self) -> Result<(), BackendError> {
        if let Some(window) = self.window.take() {
            self.conn.destroy_window(window)?;
            self.conn.flush()?;
        }
        Ok(())
    }

    fn grab_input(&mut self) -> Result<(), BackendError> {
        let window = self.window.unwrap_or(self.root);

        let keyboard = self
            .conn
            .grab_keyboard(
                true,
                window,
                x11rb::CURRENT_TIME,
                GrabMode::ASYNC,
                GrabMode::ASYNC,
            )?
            .reply()?;
        if keyboard.status != GrabStatus::SUCCESS {
            return Err(BackendError::GrabDenied);
        }

        let pointer = self
            .conn
            .grab_pointer(
                false,
                window,
                EventMask::POINTER_MOTION,
                GrabMode::ASYNC,
                GrabMode::ASYNC,
                x11rb::NONE,
                self.cursor,
                x11rb::CURRENT_TIME,
            )?
            .reply()?;
        if pointer.status != GrabStatus::SUCCESS {
            self.conn.ungrab_keyboard(x11rb::CURRENT_TIME)?;
            return Err(BackendError::GrabDenied);
        }
        Ok(())
    }

    fn release_input(&mut self) -> Result<(), BackendError> {
        self.conn.ungrab_pointer(x11rb::CURRENT_TIME)?;
        self.conn.ungrab_keyboard(x11rb::CURRENT_TIME)?;
        self.conn.flush()?;
        Ok(())
    }

    fn show_failure(&mut self, failing: bool) -> Result<(), BackendError> {
        let fore = if failing {
            self.palette.failure
        } else {
            self.palette.foreground
        };
        let (fr, fg, fb) = fore.to_rgb16();
        let (br, bg, bb) = self.palette.background.to_rgb16();
        self.conn
            .recolor_cursor(self.cursor, fr, fg, fb, br, bg, bb)?;
        self.conn.flush()?;
        Ok(())
    }

    fn set_display_sleep(&mut self, after: Option<Duration>) -> Result<(), BackendError> {
        let off = after.map_or(0, |d| u16::try_from(d.as_secs()).unwrap_or(u16::MAX));
        self.conn.dpms_set_timeouts(0, 0, off)?;
        self.conn.flush()?;
        Ok(())
    }

    fn pointer_corner(&self) -> Result<Option<Corner>, BackendError> {
        let reply = self.conn.query_pointer(self.root)?.reply()?;
        Ok(Corner::locate(
            i32::from(reply.root_x),
            i32::from(reply.root_y),
            i32::from(self.width),
            i32::from(self.height),
        ))
    }
}

impl Drop for X11Surface {
    fn drop(&mut self) {
        if let Err(e) = self.destroy_overlay() {
            warn!("Failed to remove lock window: {}", e);
        }
        let _ = self.conn.free_cursor(self.cursor);
        let _ = self.conn.flush();
    }
}

/// Keysym and text of a key press under the modifier `state`.
///
/// Control chords produce no text, so Ctrl+letter never reaches the entry.
fn resolve_key(keymap: &Keymap, keycode: u8, state: u16) -> KeyPress {
    let shift = state & u16::from(KeyButMask::SHIFT) != 0;
    let caps_lock = state & u16::from(KeyButMask::LOCK) != 0;
    let control = state & u16::from(KeyButMask::CONTROL) != 0;

    let sym = keymap.keysym(keycode, shift, caps_lock);
    let text = if control {
        String::new()
    } else {
        keysym::to_char(sym).map(String::from).unwrap_or_default()
    };
    KeyPress::new(sym, text)
}

/// Raw connection descriptor registered with the tokio reactor.
struct ConnectionFd(RawFd);

impl AsRawFd for ConnectionFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

/// Server events translated into [`SessionEvent`]s.
pub struct X11Events {
    conn: Rc<RustConnection>,
    fd: AsyncFd<ConnectionFd>,
    root: Window,
    atoms: Atoms,
    keymap: Keymap,
    hotkey: Option<u8>,
}

impl X11Events {
    /// Next already-received event worth reporting.
    fn next_queued(&mut self) -> Result<Option<SessionEvent>, BackendError> {
        while let Some(event) = self.conn.poll_for_event()? {
            if let Some(event) = self.translate(event)? {
                return Ok(Some(event));
            }
        }
        Ok(None)
    }

    fn translate(&self, event: Event) -> Result<Option<SessionEvent>, BackendError> {
        let translated = match event {
            Event::SyncAlarmNotify(notify) => Some(SessionEvent::WatchFired {
                handle: WatchHandle::new(notify.alarm),
                value: from_int64(notify.counter_value),
            }),
            Event::KeyPress(key) if Some(key.detail) == self.hotkey => {
                Some(SessionEvent::Key(KeyPress::hotkey(
                    self.keymap.keysym(key.detail, false, false),
                )))
            }
            Event::KeyPress(key) => Some(SessionEvent::Key(resolve_key(
                &self.keymap,
                key.detail,
                u16::from(key.state),
            ))),
            Event::MotionNotify(_) => Some(SessionEvent::PointerMotion),
            Event::PropertyNotify(notify)
                if notify.window == self.root
                    && notify.atom == self.atoms._FADELOCK_REQUEST
                    && notify.state == Property::NEW_VALUE =>
            {
                match instance::take_request(&self.conn, self.root, &self.atoms)? {
                    Some(Request::Lock) => Some(SessionEvent::LockRequested),
                    Some(Request::Quit) => Some(SessionEvent::QuitRequested),
                    None => None,
                }
            }
            Event::Error(e) => {
                warn!("X11 error: {:?}", e.error_kind);
                None
            }
            other => {
                trace!("Ignoring X11 event {:?}", other);
                None
            }
        };
        Ok(translated)
    }
}

#[async_trait(?Send)]
impl EventSource for X11Events {
    async fn wait(&mut self, deadline: Option<Instant>) -> WaitOutcome {
        loop {
            match self.next_queued() {
                Ok(Some(event)) => return WaitOutcome::Delivered(event),
                Ok(None) => {}
                Err(e) => return WaitOutcome::Failed(e),
            }
            if let Err(e) = self.conn.flush() {
                return WaitOutcome::Failed(e.into());
            }

            let readable = match deadline {
                Some(deadline) => {
                    match tokio::time::timeout_at(deadline, self.fd.readable()).await {
                        Ok(readable) => readable,
                        Err(_) => return WaitOutcome::TimedOut,
                    }
                }
                None => self.fd.readable().await,
            };
            match readable {
                Ok(mut guard) => guard.clear_ready(),
                Err(e) => return WaitOutcome::Failed(BackendError::ConnectionLost(e.to_string())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int64_conversion() {
        for millis in [0, 1, 180_000, i64::from(u32::MAX) + 5, -1, i64::MIN, i64::MAX] {
            let value = IdleMillis::new(millis);
            assert_eq!(from_int64(to_int64(value)), value, "{millis}");
        }
    }

    #[test]
    fn test_int64_layout() {
        assert_eq!(to_int64(IdleMillis::new(-1)), sync::Int64 { hi: -1, lo: u32::MAX });
        assert_eq!(
            to_int64(IdleMillis::new(0x1_0000_0002)),
            sync::Int64 { hi: 1, lo: 2 }
        );
        assert_eq!(
            from_int64(sync::Int64 { hi: 0, lo: 180_000 }),
            IdleMillis::new(180_000)
        );
    }

    fn keymap() -> Keymap {
        // keycode 38: a/A, keycode 36: Return
        let mut keysyms = vec![0; 2 * 40];
        keysyms[2 * (38 - 8)] = 0x61;
        keysyms[2 * (38 - 8) + 1] = 0x41;
        keysyms[2 * (36 - 8)] = keysym::RETURN;
        Keymap::from_parts(8, 2, keysyms)
    }

    #[test]
    fn test_key_text_follows_shift() {
        let map = keymap();
        assert_eq!(resolve_key(&map, 38, 0), KeyPress::new(0x61, "a"));
        let shifted = u16::from(KeyButMask::SHIFT);
        assert_eq!(resolve_key(&map, 38, shifted), KeyPress::new(0x41, "A"));
    }

    #[test]
    fn test_control_chords_produce_no_text() {
        let map = keymap();
        let control = u16::from(KeyButMask::CONTROL);

        let key = resolve_key(&map, 38, control);
        assert_eq!(key.keysym, 0x61);
        assert!(key.text.is_empty());

        let shifted = resolve_key(&map, 38, control | u16::from(KeyButMask::SHIFT));
        assert!(shifted.text.is_empty());

        // Ctrl+Return still submits: classification goes by keysym
        assert_eq!(resolve_key(&map, 36, control).keysym, keysym::RETURN);
    }

    #[test]
    fn test_diagnostics_cover_display_variables() {
        let diags = X11Backend::diagnostics();
        assert_eq!(diags.len(), 2);
        assert!(diags[0].starts_with("DISPLAY"));
        assert!(diags[1].starts_with("XAUTHORITY"));
    }
}
