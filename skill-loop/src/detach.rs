//! Detached run manager: background execution through the session registry.
//!
//! A detached run re-invokes this binary with the same `run` arguments plus
//! the internal `--child` marker inside a new session. The child runs the loop
//! controller in the foreground of that session; the parent returns the
//! session id immediately.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::{info, instrument, warn};

use crate::core::types::RoutingGraph;
use crate::io::session::{NewSession, SessionMetadata, SessionRegistry};
use crate::io::tmux::Multiplexer;

/// Label marking sessions that hold a detached loop run.
pub const RUN_LABEL: &str = "orchestrator";
/// Runtime recorded for detached loop runs.
pub const RUN_RUNTIME: &str = "skill-loop";
/// Internal flag telling `run` to execute the loop instead of detaching again.
pub const CHILD_FLAG: &str = "--child";

/// Arguments of one `skill-loop run` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    /// Absolute path of the routing configuration.
    pub config_path: PathBuf,
    pub max_iterations: Option<u32>,
    pub prompt: String,
    pub entrypoint: Option<String>,
}

/// `run` arguments for the re-invoked child, ending with [`CHILD_FLAG`].
pub fn child_args(request: &RunRequest) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        request.config_path.to_string_lossy().into_owned(),
    ];
    if let Some(max) = request.max_iterations.filter(|max| *max > 0) {
        args.push("--max-iterations".to_string());
        args.push(max.to_string());
    }
    if !request.prompt.is_empty() {
        args.push("--prompt".to_string());
        args.push(request.prompt.clone());
    }
    if let Some(entrypoint) = request.entrypoint.as_deref().filter(|e| !e.is_empty()) {
        args.push("--entrypoint".to_string());
        args.push(entrypoint.to_string());
    }
    args.push(CHILD_FLAG.to_string());
    args
}

/// Full command vector for the child: executable followed by [`child_args`].
pub fn child_command(exe: &Path, request: &RunRequest) -> Vec<String> {
    let mut command = vec![exe.to_string_lossy().into_owned()];
    command.extend(child_args(request));
    command
}

/// Register and start a detached run, returning its session.
///
/// A session that fails to start is removed again so it never shows up as a
/// phantom `Pending` run.
#[instrument(skip_all, fields(config = %request.config_path.display()))]
pub fn start_detached<M: Multiplexer>(
    registry: &SessionRegistry<M>,
    exe: &Path,
    working_dir: &Path,
    request: &RunRequest,
    graph: &RoutingGraph,
) -> Result<SessionMetadata> {
    if !exe.is_absolute() {
        return Err(anyhow!("executable path must be absolute, got {}", exe.display()));
    }
    let mut meta = registry.create(NewSession {
        working_dir: working_dir.to_path_buf(),
        label: RUN_LABEL.to_string(),
        runtime: RUN_RUNTIME.to_string(),
        command: child_command(exe, request),
        idle_timeout: graph.idle_timeout,
        max_restarts: graph.max_restarts,
    })?;

    if let Err(err) = registry.start(&mut meta) {
        let dir = meta.session_dir();
        if let Err(cleanup) = std::fs::remove_dir_all(&dir) {
            warn!(dir = %dir.display(), err = %cleanup, "failed to clean up unstarted session");
            return Err(err.context(format!(
                "start detached run (cleanup of {} failed: {cleanup})",
                dir.display()
            )));
        }
        return Err(err.context("start detached run"));
    }
    info!(id = %meta.id, "detached run started");
    Ok(meta)
}

/// Stream a run's backing session to the caller's terminal.
pub fn attach<M: Multiplexer>(registry: &SessionRegistry<M>, meta: &SessionMetadata) -> Result<()> {
    registry
        .attach(meta)
        .with_context(|| format!("attach to run {}", meta.id))
}
