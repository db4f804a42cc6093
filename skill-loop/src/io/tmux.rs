//! Terminal multiplexer adapter backing detached sessions.
//!
//! The session registry only needs a handful of operations from the
//! multiplexer, captured by the [`Multiplexer`] trait so tests can substitute
//! an in-memory fake. [`Tmux`] shells out to the `tmux` binary.

use std::io;
use std::path::Path;
use std::process::{Command, Output, Stdio};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

/// Selects a dedicated tmux server socket (`tmux -L`).
pub const SOCKET_ENV: &str = "SKILL_LOOP_TMUX_SOCKET";

/// Liveness of a named backing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaneState {
    /// No session with that name exists.
    Absent,
    /// The session exists and its pane process is running.
    Alive,
    /// The session is kept open by `remain-on-exit` but its process has died.
    Exited,
}

impl PaneState {
    pub fn is_present(self) -> bool {
        !matches!(self, PaneState::Absent)
    }
}

/// Operations the session registry needs from a terminal multiplexer.
pub trait Multiplexer {
    /// Fail with a user-facing message when the multiplexer is not installed.
    fn ensure_available(&self) -> Result<()>;
    fn state(&self, session: &str) -> Result<PaneState>;
    /// Start `shell_command` in a new detached session that keeps its pane
    /// after the command exits.
    fn launch(&self, session: &str, workdir: &Path, shell_command: &str) -> Result<()>;
    fn pane_pid(&self, session: &str) -> Result<u32>;
    fn kill(&self, session: &str) -> Result<()>;
    /// Attach the caller's terminal to `session` until the user detaches.
    fn attach(&self, session: &str) -> Result<()>;
}

/// `tmux` CLI wrapper, optionally on a dedicated server socket (`-L`).
#[derive(Debug, Clone, Default)]
pub struct Tmux {
    socket: Option<String>,
}

impl Tmux {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use the socket named by `SKILL_LOOP_TMUX_SOCKET`, if set.
    pub fn from_env() -> Self {
        match std::env::var(SOCKET_ENV) {
            Ok(socket) if !socket.is_empty() => Self::with_socket(socket),
            _ => Self::new(),
        }
    }

    pub fn with_socket(socket: impl Into<String>) -> Self {
        Self {
            socket: Some(socket.into()),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new("tmux");
        if let Some(socket) = &self.socket {
            cmd.arg("-L").arg(socket);
        }
        cmd
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        match self.command().args(args).stdin(Stdio::null()).output() {
            Ok(output) => Ok(output),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(anyhow!("tmux is required but not found on PATH"))
            }
            Err(err) => Err(err).with_context(|| format!("spawn tmux {}", args.join(" "))),
        }
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("tmux {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn has_session(&self, session: &str) -> Result<bool> {
        let output = self.run(&["has-session", "-t", session])?;
        match output.status.code() {
            Some(0) => Ok(true),
            // tmux exits 1 both for "no such session" and "no server running".
            Some(1) => Ok(false),
            code => Err(anyhow!(
                "tmux has-session exited with {code:?}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )),
        }
    }
}

impl Multiplexer for Tmux {
    fn ensure_available(&self) -> Result<()> {
        let output = self.run(&["-V"])?;
        debug!(version = %String::from_utf8_lossy(&output.stdout).trim(), "tmux available");
        Ok(())
    }

    fn state(&self, session: &str) -> Result<PaneState> {
        if !self.has_session(session)? {
            return Ok(PaneState::Absent);
        }
        let output = self.run(&["list-panes", "-s", "-t", session, "-F", "#{pane_dead}"])?;
        if !output.status.success() {
            // Raced with the session closing.
            return Ok(PaneState::Absent);
        }
        let listing = String::from_utf8_lossy(&output.stdout);
        if listing.lines().any(|line| line.trim() == "0") {
            Ok(PaneState::Alive)
        } else {
            Ok(PaneState::Exited)
        }
    }

    #[instrument(skip_all, fields(session = session))]
    fn launch(&self, session: &str, workdir: &Path, shell_command: &str) -> Result<()> {
        let workdir = workdir.to_string_lossy();
        self.run_checked(&[
            "new-session",
            "-d",
            "-s",
            session,
            "-c",
            &workdir,
            shell_command,
            ";",
            "set-option",
            "-t",
            session,
            "remain-on-exit",
            "on",
        ])
        .with_context(|| format!("start tmux session {session}"))?;
        debug!("tmux session launched");
        Ok(())
    }

    fn pane_pid(&self, session: &str) -> Result<u32> {
        let output = self.run_checked(&["list-panes", "-s", "-t", session, "-F", "#{pane_pid}"])?;
        let listing = String::from_utf8_lossy(&output.stdout);
        let first = listing
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .ok_or_else(|| anyhow!("empty pane pid for tmux session {session}"))?;
        first
            .parse()
            .with_context(|| format!("parse pane pid {first:?}"))
    }

    #[instrument(skip_all, fields(session = session))]
    fn kill(&self, session: &str) -> Result<()> {
        let output = self.run(&["kill-session", "-t", session])?;
        if !output.status.success() {
            if !self.has_session(session)? {
                return Ok(());
            }
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(stderr = %stderr.trim(), "tmux kill-session failed");
            return Err(anyhow!("tmux kill-session -t {session} failed: {}", stderr.trim()));
        }
        debug!("tmux session killed");
        Ok(())
    }

    fn attach(&self, session: &str) -> Result<()> {
        let status = self
            .command()
            .args(["attach-session", "-t", session])
            .status()
            .with_context(|| format!("spawn tmux attach-session -t {session}"))?;
        if !status.success() {
            return Err(anyhow!(
                "tmux attach-session -t {session} exited with {:?}",
                status.code()
            ));
        }
        Ok(())
    }
}
