//! fadelock - idle monitor and screen locker for X11 sessions.
//!
//! Fades the display out after a period of inactivity and locks the session
//! until the user's password is entered.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use fadelock::action::PostFadeAction;
use fadelock::alarm::AlarmScheduler;
use fadelock::auth::Credential;
use fadelock::backend::{Request, X11Backend};
use fadelock::config::{Color, Config};
use fadelock::event_loop::{EventLoop, ExitReason};
use fadelock::fade::FadeController;
use fadelock::lock::LockController;
use fadelock::{daemon, privilege};
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Idle monitor and screen locker for X11.
///
/// Fades the screen after a period of inactivity, then locks it until the
/// user's password is typed.
#[derive(Parser, Debug)]
#[command(name = "fadelock")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to config file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Lock now: tell the running instance, or lock as soon as we start.
    #[arg(long, conflicts_with = "quit")]
    lock: bool,

    /// Tell the running instance to exit (refused while it is locked).
    #[arg(long)]
    quit: bool,

    /// Fork into the background after startup.
    #[arg(short, long)]
    daemonize: bool,

    /// X display to use instead of $DISPLAY.
    #[arg(long)]
    display: Option<String>,

    /// Seconds of inactivity before the screen fades.
    #[arg(short = 't', long)]
    idle_seconds: Option<u64>,

    /// Lock window colour (#rrggbb).
    #[arg(long)]
    background: Option<Color>,

    /// Cursor colour while locked (#rrggbb).
    #[arg(long)]
    foreground: Option<Color>,

    /// Cursor colour after a wrong password (#rrggbb).
    #[arg(long)]
    failure: Option<Color>,

    /// Key that locks immediately (e.g. Insert, Pause, F12).
    #[arg(long)]
    lock_key: Option<String>,

    /// Shell command to run once the fade completes.
    #[arg(long)]
    post_fade_command: Option<String>,
}

impl Args {
    /// Command-line values win over the config file.
    fn apply(&self, config: &mut Config) {
        if let Some(seconds) = self.idle_seconds {
            config.idle_timeout_seconds = seconds;
        }
        if let Some(color) = self.background {
            config.background = color;
        }
        if let Some(color) = self.foreground {
            config.foreground = color;
        }
        if let Some(color) = self.failure {
            config.failure = color;
        }
        if let Some(key) = &self.lock_key {
            config.lock_key.clone_from(key);
        }
        if let Some(command) = &self.post_fade_command {
            config.post_fade_command = Some(command.clone());
        }
    }

    fn remote_request(&self) -> Option<Request> {
        if self.quit {
            Some(Request::Quit)
        } else if self.lock {
            Some(Request::Lock)
        } else {
            None
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level)?;

    info!("fadelock v{} starting", env!("CARGO_PKG_VERSION"));

    let mut config =
        Config::load_or_default(args.config.as_deref()).context("Failed to load configuration")?;
    args.apply(&mut config);
    config.validate().context("Invalid configuration")?;
    let hotkey = config.hotkey_keysym()?;

    // The hash may only be readable with the privileges given up right after
    let user = privilege::current_user().context("Failed to resolve the current user")?;
    let credential = privilege::lookup_credential(&user);
    privilege::drop_privileges(&user)?;

    let backend = match X11Backend::connect(args.display.as_deref()) {
        Ok(backend) => backend,
        Err(e) => {
            error!("Cannot connect to the X server.");
            for diag in X11Backend::diagnostics() {
                error!("  {}", diag);
            }
            return Err(e).context("X display not available");
        }
    };

    if let Some(pid) = backend.running_instance()? {
        let Some(request) = args.remote_request() else {
            anyhow::bail!("fadelock is already running (pid {pid})");
        };
        backend.send_request(request)?;
        info!("Sent {} request to pid {}", request.as_str(), pid);
        return Ok(());
    }
    if args.quit {
        anyhow::bail!("No running instance to quit");
    }

    let credential = credential.context("Cannot verify passwords")?;
    let session = backend
        .prepare_session(hotkey, config.idle_timeout())
        .context("Failed to take over screen blanking")?;

    if args.daemonize {
        daemon::daemonize().context("Failed to daemonize")?;
    }
    let instance = backend.claim_instance()?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start runtime")?;
    let reason = runtime.block_on(run_session(&backend, &config, credential, hotkey, args.lock))?;

    drop(session);
    drop(instance);
    info!("fadelock exiting ({:?})", reason);
    Ok(())
}

/// Initialize logging with the specified level.
fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(format!("fadelock={level}"))
        .or_else(|_| EnvFilter::try_new("info"))
        .context("Invalid log level")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    Ok(())
}

/// Build the state machines over the X11 backend and drive them.
async fn run_session(
    backend: &X11Backend,
    config: &Config,
    credential: Credential,
    hotkey: u32,
    lock_on_start: bool,
) -> Result<ExitReason> {
    let counter = backend
        .idle_counter()
        .context("Idle detection unavailable")?;
    let alarms = AlarmScheduler::new(Box::new(counter), config.idle_timeout());

    let gamma = backend.gamma().context("Gamma control unavailable")?;
    let fade = FadeController::new(Box::new(gamma), config.fade_settings());

    let surface = backend
        .lock_surface(config.palette())
        .context("Failed to prepare the lock window")?;
    let lock = LockController::new(Box::new(surface), credential, config.lock_settings());

    let events = backend.event_source(hotkey)?;
    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    let mut session = EventLoop::new(events, alarms, fade, lock, cancel)
        .with_post_fade(config.post_fade_command.clone().map(PostFadeAction::new))
        .with_veto_corner(config.fade_veto_corner);

    debug!("Session ready");
    let reason = session.run(lock_on_start).await?;
    Ok(reason)
}

/// Cancel the session on SIGTERM or SIGINT.
async fn cancel_on_signal(cancel: CancellationToken) {
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {}", e);
            return;
        }
    };

    tokio::select! {
        _ = terminate.recv() => info!("Received SIGTERM"),
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
    }
    cancel.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides_config() {
        let args = Args::parse_from([
            "fadelock",
            "-t",
            "60",
            "--foreground",
            "#00ff00",
            "--lock-key",
            "Pause",
            "--post-fade-command",
            "xset dpms force off",
        ]);
        let mut config = Config::default();
        args.apply(&mut config);

        assert_eq!(config.idle_timeout_seconds, 60);
        assert_eq!(config.foreground, Color::rgb(0, 0xff, 0));
        assert_eq!(config.background, Config::default().background);
        assert_eq!(config.lock_key, "Pause");
        assert_eq!(
            config.post_fade_command.as_deref(),
            Some("xset dpms force off")
        );
    }

    #[test]
    fn test_bad_colour_is_rejected() {
        assert!(Args::try_parse_from(["fadelock", "--failure", "red"]).is_err());
    }

    #[test]
    fn test_remote_requests() {
        let lock = Args::parse_from(["fadelock", "--lock"]);
        assert_eq!(lock.remote_request(), Some(Request::Lock));

        let quit = Args::parse_from(["fadelock", "--quit"]);
        assert_eq!(quit.remote_request(), Some(Request::Quit));

        assert_eq!(Args::parse_from(["fadelock"]).remote_request(), None);
        assert!(Args::try_parse_from(["fadelock", "--lock", "--quit"]).is_err());
    }
}
