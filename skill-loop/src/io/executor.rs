//! Skill executor: one agent invocation per step.
//!
//! The [`SkillExecutor`] trait decouples the loop controller from the actual
//! agent backend. [`AgentExecutor`] renders the prompt, builds the runtime's
//! command line, supervises the child for idle activity and restarts it on
//! idle timeouts. Tests use scripted executors that return predetermined
//! summaries without spawning processes.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::runtime::{CommandSpec, Runtime};
use crate::core::types::Route;
use crate::io::process::{self, CommandOutput, SuperviseOptions, Supervised};
use crate::io::prompt::render_skill_prompt;

/// Idle timeout applied when the graph does not set one.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(900);
/// Idle restarts allowed when the graph does not set a budget.
pub const DEFAULT_MAX_RESTARTS: u32 = 2;
/// Bytes of stderr kept in a failure message.
pub const STDERR_TAIL_BYTES: usize = 4000;
/// Exported by detached-session launch scripts; restarts are logged under it.
pub const SESSION_DIR_ENV: &str = "SKILL_LOOP_SESSION_DIR";
/// Restart log file name inside a session directory.
pub const RESTART_LOG_FILE: &str = "restarts.log";

/// Everything needed to run one skill.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub skill: String,
    pub runtime: Runtime,
    pub model: Option<String>,
    pub extra_args: Vec<String>,
    /// Summary of the previous step, or the seed prompt on the first step.
    pub previous_summary: String,
    /// Outgoing routes, used only for the prompt's status-marker block.
    pub routes: Vec<Route>,
}

/// The sole handoff between iterations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    /// Trimmed stdout of the successful attempt. Never empty.
    pub summary: String,
    /// Idle restarts consumed before success.
    pub restarts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionOptions {
    pub idle_timeout: Duration,
    pub max_restarts: u32,
}

impl ExecutionOptions {
    /// Apply defaults for unset values. A zero idle timeout means "unset".
    pub fn new(idle_timeout: Option<Duration>, max_restarts: Option<u32>) -> Self {
        let idle_timeout = idle_timeout
            .filter(|timeout| !timeout.is_zero())
            .unwrap_or(DEFAULT_IDLE_TIMEOUT);
        Self {
            idle_timeout,
            max_restarts: max_restarts.unwrap_or(DEFAULT_MAX_RESTARTS),
        }
    }
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self::new(None, None)
    }
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("skill {skill:?} produced no output for {timeout:?} ({attempts} attempt(s), restart budget exhausted)")]
    IdleTimeout {
        skill: String,
        timeout: Duration,
        attempts: u32,
    },
    #[error("failed to launch {program:?}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("{program} exited with {}{}", describe_code(.code), describe_tail(.stderr_tail))]
    Failed {
        program: String,
        code: Option<i32>,
        stderr_tail: String,
    },
    #[error("{program} produced no output")]
    EmptyOutput { program: String },
    #[error("render prompt")]
    Prompt(#[from] minijinja::Error),
    #[error("supervise agent process")]
    Supervision(#[source] io::Error),
}

impl ExecError {
    pub fn is_idle_timeout(&self) -> bool {
        matches!(self, ExecError::IdleTimeout { .. })
    }
}

fn describe_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("code {code}"),
        None => "no exit code (killed by signal)".to_string(),
    }
}

fn describe_tail(tail: &str) -> String {
    if tail.is_empty() {
        String::new()
    } else {
        format!(": {tail}")
    }
}

/// Abstraction over agent execution backends.
pub trait SkillExecutor {
    fn execute(
        &self,
        request: &ExecutionRequest,
        options: &ExecutionOptions,
    ) -> Result<ExecutionResult, ExecError>;
}

/// Outcome of a single attempt, before restart policy is applied.
#[derive(Debug)]
pub enum Attempt {
    Finished(String),
    IdleTimedOut,
}

/// Run `attempt` until it finishes, restarting after idle timeouts.
///
/// At most `options.max_restarts` restarts are made; `on_restart` is called
/// with the 1-based restart number before each one. Any error from `attempt`
/// is returned immediately.
pub fn run_with_restarts<A, R>(
    skill: &str,
    options: &ExecutionOptions,
    mut attempt: A,
    mut on_restart: R,
) -> Result<ExecutionResult, ExecError>
where
    A: FnMut() -> Result<Attempt, ExecError>,
    R: FnMut(u32),
{
    let mut restarts = 0u32;
    loop {
        match attempt()? {
            Attempt::Finished(summary) => return Ok(ExecutionResult { summary, restarts }),
            Attempt::IdleTimedOut if restarts < options.max_restarts => {
                restarts += 1;
                warn!(
                    skill,
                    restart = restarts,
                    max_restarts = options.max_restarts,
                    idle_timeout_secs = options.idle_timeout.as_secs(),
                    "skill idle past timeout, restarting"
                );
                on_restart(restarts);
            }
            Attempt::IdleTimedOut => {
                return Err(ExecError::IdleTimeout {
                    skill: skill.to_string(),
                    timeout: options.idle_timeout,
                    attempts: restarts + 1,
                });
            }
        }
    }
}

/// Trim raw stdout into a summary; whitespace-only output is an error.
pub fn extract_summary(program: &str, stdout: &[u8]) -> Result<String, ExecError> {
    let text = String::from_utf8_lossy(stdout);
    let summary = text.trim();
    if summary.is_empty() {
        return Err(ExecError::EmptyOutput {
            program: program.to_string(),
        });
    }
    Ok(summary.to_string())
}

/// Executor that spawns the configured agent CLI.
#[derive(Debug, Clone)]
pub struct AgentExecutor {
    poll_interval: Duration,
    passthrough: bool,
    restart_log: Option<PathBuf>,
}

impl AgentExecutor {
    pub fn new() -> Self {
        Self {
            poll_interval: process::POLL_INTERVAL,
            passthrough: true,
            restart_log: None,
        }
    }

    /// Pick up the restart log of the enclosing detached session, if any.
    pub fn from_env() -> Self {
        let restart_log = std::env::var_os(SESSION_DIR_ENV)
            .filter(|dir| !dir.is_empty())
            .map(|dir| PathBuf::from(dir).join(RESTART_LOG_FILE));
        Self {
            restart_log,
            ..Self::new()
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_passthrough(mut self, passthrough: bool) -> Self {
        self.passthrough = passthrough;
        self
    }

    pub fn with_restart_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.restart_log = Some(path.into());
        self
    }

    /// Run an already-built command line with the restart policy applied.
    #[instrument(skip_all, fields(skill = skill, program = %spec.program))]
    pub fn execute_spec(
        &self,
        skill: &str,
        spec: &CommandSpec,
        options: &ExecutionOptions,
    ) -> Result<ExecutionResult, ExecError> {
        run_with_restarts(
            skill,
            options,
            || self.attempt(spec, options),
            |restart| self.record_restart(skill, restart),
        )
    }

    fn attempt(
        &self,
        spec: &CommandSpec,
        options: &ExecutionOptions,
    ) -> Result<Attempt, ExecError> {
        info!(program = %spec.program, "starting agent");
        let child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ExecError::Launch {
                program: spec.program.clone(),
                source,
            })?;

        let supervise = SuperviseOptions {
            poll_interval: self.poll_interval,
            passthrough: self.passthrough,
            ..SuperviseOptions::new(options.idle_timeout)
        };
        match process::supervise(child, &supervise).map_err(ExecError::Supervision)? {
            Supervised::IdleTimedOut { .. } => Ok(Attempt::IdleTimedOut),
            Supervised::Exited(output) => finish(&spec.program, &output).map(Attempt::Finished),
        }
    }

    fn record_restart(&self, skill: &str, restart: u32) {
        let Some(path) = &self.restart_log else {
            return;
        };
        let line = format!("{} skill={skill} restart={restart}\n", Utc::now().to_rfc3339());
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut file| file.write_all(line.as_bytes()));
        if let Err(err) = result {
            warn!(path = %path.display(), err = %err, "failed to append restart log");
        }
    }
}

impl Default for AgentExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl SkillExecutor for AgentExecutor {
    #[instrument(skip_all, fields(skill = %request.skill, runtime = %request.runtime))]
    fn execute(
        &self,
        request: &ExecutionRequest,
        options: &ExecutionOptions,
    ) -> Result<ExecutionResult, ExecError> {
        let prompt =
            render_skill_prompt(&request.skill, &request.previous_summary, &request.routes)?;
        let spec = request
            .runtime
            .command(request.model.as_deref(), &request.extra_args, &prompt);
        debug!(args = spec.args.len(), "built agent command");
        self.execute_spec(&request.skill, &spec, options)
    }
}

fn finish(program: &str, output: &CommandOutput) -> Result<String, ExecError> {
    if !output.status.success() {
        warn!(exit_code = ?output.status.code(), "agent failed");
        return Err(ExecError::Failed {
            program: program.to_string(),
            code: output.status.code(),
            stderr_tail: process::tail_text(&output.stderr, STDERR_TAIL_BYTES),
        });
    }
    extract_summary(program, &output.stdout)
}
