//! Shell command run after a completed fade.

use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, info, warn};

/// A user-supplied `sh -c` command, e.g. to force the display off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostFadeAction {
    command: String,
}

impl PostFadeAction {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    /// Spawn the command without waiting for it.
    ///
    /// The exit status is logged by a background task on the current
    /// runtime. Returns the task so callers may await it.
    pub fn spawn(&self) -> std::io::Result<tokio::task::JoinHandle<Option<i32>>> {
        debug!("Running post-fade command: {}", self.command);

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(false)
            .spawn()?;

        let command = self.command.clone();
        Ok(tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => {
                    debug!("Post-fade command finished");
                    status.code()
                }
                Ok(status) => {
                    info!(
                        "Post-fade command {:?} exited with code {:?}",
                        command,
                        status.code()
                    );
                    status.code()
                }
                Err(e) => {
                    warn!("Failed to wait for post-fade command: {}", e);
                    None
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_spawn_reports_exit_code() {
        let ok = PostFadeAction::new("true").spawn().unwrap();
        assert_eq!(ok.await.unwrap(), Some(0));

        let failed = PostFadeAction::new("exit 3").spawn().unwrap();
        assert_eq!(failed.await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_spawn_runs_through_shell() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("faded");
        let action = PostFadeAction::new(format!("echo done > '{}'", marker.display()));

        action.spawn().unwrap().await.unwrap();

        let written = std::fs::read_to_string(&marker).unwrap();
        assert_eq!(written.trim(), "done");
    }
}
