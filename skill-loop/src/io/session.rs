//! Durable records of detached runs and their reconciliation.
//!
//! Every session owns a directory under `<repo>/.skill-loop/sessions/<id>/`
//! holding `session.json`, the generated `run.sh`, the tee'd stdout/stderr
//! logs, the exit-code file and the restart log. The on-disk metadata is
//! authoritative: [`SessionRegistry::reconcile`] derives the true status from
//! the exit-code file and the backing session's liveness alone, so any process
//! can observe a run started by another one.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::io::executor::{RESTART_LOG_FILE, SESSION_DIR_ENV};
use crate::io::tmux::{Multiplexer, PaneState};

pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 900;
pub const DEFAULT_MAX_RESTARTS: u32 = 2;

const METADATA_FILE: &str = "session.json";
const SCRIPT_FILE: &str = "run.sh";
const STDOUT_FILE: &str = "stdout.log";
const STDERR_FILE: &str = "stderr.log";
const EXIT_CODE_FILE: &str = "exit.code";
const BACKING_PREFIX: &str = "skill-loop-";

const DISAPPEARED: &str = "backing session disappeared before exit code was written";

static SESSION_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d{8}T\d{6}Z-[0-9a-f]{8}$").expect("valid session id regex")
});

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Created, backing session not started yet.
    Pending,
    Running,
    /// Alive but silent for longer than its idle timeout.
    Idle,
    Done,
    Failed,
    Stopped,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Running => "running",
            SessionStatus::Idle => "idle",
            SessionStatus::Done => "done",
            SessionStatus::Failed => "failed",
            SessionStatus::Stopped => "stopped",
        }
    }

    /// Terminal states never go back to `Running` through reconciliation.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Done | SessionStatus::Failed | SessionStatus::Stopped
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted record of one session (`session.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub id: String,
    /// Owner of the session, e.g. the detached run manager.
    pub label: String,
    pub runtime: String,
    pub repo_root: PathBuf,
    pub working_dir: PathBuf,
    pub command: Vec<String>,
    pub backing_session: String,
    pub script_path: PathBuf,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
    pub exit_code_path: PathBuf,
    pub restarts_path: PathBuf,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub last_output_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub idle_timeout_secs: u64,
    pub max_restarts: u32,
    #[serde(default)]
    pub restart_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl SessionMetadata {
    pub fn session_dir(&self) -> PathBuf {
        sessions_root(&self.repo_root).join(&self.id)
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.session_dir().join(METADATA_FILE)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Parameters for [`SessionRegistry::create`].
#[derive(Debug, Clone)]
pub struct NewSession {
    pub working_dir: PathBuf,
    pub label: String,
    pub runtime: String,
    pub command: Vec<String>,
    /// Zero or `None` selects [`DEFAULT_IDLE_TIMEOUT_SECS`].
    pub idle_timeout: Option<Duration>,
    pub max_restarts: Option<u32>,
}

/// Result of [`SessionRegistry::stop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    /// The run had already concluded; its status is kept.
    AlreadyFinished(SessionStatus),
}

/// Contents of a session's exit-code file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitRecord {
    /// Missing or empty: the run has not concluded.
    Missing,
    Code(i32),
    /// Present but unparsable.
    Corrupt(String),
}

/// `<repo_root>/.skill-loop/sessions`.
pub fn sessions_root(repo_root: &Path) -> PathBuf {
    repo_root.join(".skill-loop").join("sessions")
}

/// Reject anything that is not a generated session id before it reaches a path.
pub fn validate_session_id(id: &str) -> Result<()> {
    if SESSION_ID_RE.is_match(id) {
        Ok(())
    } else {
        Err(anyhow!(
            "invalid session id {id:?} (expected YYYYMMDDTHHMMSSZ-xxxxxxxx)"
        ))
    }
}

/// Timestamp plus 4 random bytes, e.g. `20260102T030405Z-1a2b3c4d`.
pub fn new_id(now: DateTime<Utc>) -> String {
    let suffix: [u8; 4] = rand::random();
    format!("{}-{}", now.format("%Y%m%dT%H%M%SZ"), hex::encode(suffix))
}

/// Quote `value` for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r#"'"'"'"#))
}

fn shell_path(path: &Path) -> String {
    shell_quote(&path.to_string_lossy())
}

/// Generate the launch script run inside the backing session.
///
/// The command's exit status is written to the exit-code file before the
/// script exits with it, so the result survives the backing session.
pub fn launch_script(meta: &SessionMetadata) -> String {
    let command_line = meta
        .command
        .iter()
        .map(|arg| shell_quote(arg))
        .collect::<Vec<_>>()
        .join(" ");
    let exit_path = shell_path(&meta.exit_code_path);
    [
        "#!/bin/bash".to_string(),
        "set +euo pipefail".to_string(),
        format!(
            "export {SESSION_DIR_ENV}={}",
            shell_path(&meta.session_dir())
        ),
        format!(
            "cd {} || {{ echo 1 > {exit_path}; exit 1; }}",
            shell_path(&meta.working_dir)
        ),
        format!(
            "{{ {command_line} 2> >(tee -a {} >&2); }} | tee -a {}",
            shell_path(&meta.stderr_path),
            shell_path(&meta.stdout_path)
        ),
        "code=${PIPESTATUS[0]}".to_string(),
        format!("echo \"$code\" > {exit_path}"),
        "exit \"$code\"".to_string(),
        String::new(),
    ]
    .join("\n")
}

/// Read a session's exit-code file.
pub fn read_exit_record(path: &Path) -> Result<ExitRecord> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(ExitRecord::Missing),
        Err(err) => {
            return Err(err).with_context(|| format!("read exit code {}", path.display()));
        }
    };
    let trimmed = contents.trim();
    if trimmed.is_empty() {
        return Ok(ExitRecord::Missing);
    }
    Ok(match trimmed.parse() {
        Ok(code) => ExitRecord::Code(code),
        Err(_) => ExitRecord::Corrupt(trimmed.to_string()),
    })
}

/// Number of idle restarts recorded in the restart log, if it exists.
fn read_restart_count(path: &Path) -> Option<u32> {
    let contents = fs::read_to_string(path).ok()?;
    let lines = contents.lines().filter(|line| !line.trim().is_empty()).count();
    Some(u32::try_from(lines).unwrap_or(u32::MAX))
}

fn latest_output(meta: &SessionMetadata) -> DateTime<Utc> {
    [&meta.stdout_path, &meta.stderr_path]
        .into_iter()
        .filter_map(|path| fs::metadata(path).and_then(|m| m.modified()).ok())
        .map(DateTime::<Utc>::from)
        .fold(meta.last_output_at, |latest, modified| latest.max(modified))
}

fn save(meta: &SessionMetadata) -> Result<()> {
    let path = meta.metadata_path();
    debug!(path = %path.display(), status = %meta.status, "writing session metadata");
    let mut buf = serde_json::to_string_pretty(meta)?;
    buf.push('\n');
    write_atomic(&path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("session metadata path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp session metadata {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .with_context(|| format!("replace session metadata {}", path.display()))?;
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => {
            Err(err).with_context(|| format!("remove {}", path.display()))
        }
        _ => Ok(()),
    }
}

/// Sessions of one repository, backed by a terminal multiplexer.
#[derive(Debug, Clone)]
pub struct SessionRegistry<M> {
    repo_root: PathBuf,
    mux: M,
}

impl<M: Multiplexer> SessionRegistry<M> {
    pub fn new(repo_root: impl Into<PathBuf>, mux: M) -> Self {
        Self {
            repo_root: repo_root.into(),
            mux,
        }
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    pub fn multiplexer(&self) -> &M {
        &self.mux
    }

    pub fn sessions_root(&self) -> PathBuf {
        sessions_root(&self.repo_root)
    }

    /// Allocate a session directory, write its launch script and persist it as
    /// `Pending`.
    #[instrument(skip_all, fields(label = %new.label))]
    pub fn create(&self, new: NewSession) -> Result<SessionMetadata> {
        if new.command.is_empty() {
            return Err(anyhow!("session command is required"));
        }
        let root = self.sessions_root();
        fs::create_dir_all(&root).with_context(|| format!("create {}", root.display()))?;

        let now = Utc::now();
        let id = new_id(now);
        let dir = root.join(&id);
        // create_dir (not _all) so an id collision fails instead of sharing a directory.
        fs::create_dir(&dir)
            .with_context(|| format!("create session directory {}", dir.display()))?;

        let idle_timeout_secs = new
            .idle_timeout
            .map(|timeout| timeout.as_secs())
            .filter(|secs| *secs > 0)
            .unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS);
        let meta = SessionMetadata {
            backing_session: format!("{BACKING_PREFIX}{id}"),
            script_path: dir.join(SCRIPT_FILE),
            stdout_path: dir.join(STDOUT_FILE),
            stderr_path: dir.join(STDERR_FILE),
            exit_code_path: dir.join(EXIT_CODE_FILE),
            restarts_path: dir.join(RESTART_LOG_FILE),
            id,
            label: new.label,
            runtime: new.runtime,
            repo_root: self.repo_root.clone(),
            working_dir: new.working_dir,
            command: new.command,
            status: SessionStatus::Pending,
            pid: None,
            started_at: now,
            last_output_at: now,
            ended_at: None,
            idle_timeout_secs,
            max_restarts: new.max_restarts.unwrap_or(DEFAULT_MAX_RESTARTS),
            restart_count: 0,
            last_error: None,
        };

        fs::write(&meta.script_path, launch_script(&meta))
            .with_context(|| format!("write launch script {}", meta.script_path.display()))?;
        save(&meta)?;
        info!(id = %meta.id, "session created");
        Ok(meta)
    }

    /// Launch the session's script in a new detached backing session.
    #[instrument(skip_all, fields(id = %meta.id))]
    pub fn start(&self, meta: &mut SessionMetadata) -> Result<()> {
        self.mux.ensure_available()?;
        let dir = meta.session_dir();
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        remove_if_exists(&meta.exit_code_path)?;

        if self.mux.state(&meta.backing_session)?.is_present() {
            warn!(session = %meta.backing_session, "killing stale backing session");
            self.mux.kill(&meta.backing_session)?;
        }

        let shell_command = format!("exec bash {}", shell_path(&meta.script_path));
        self.mux
            .launch(&meta.backing_session, &meta.working_dir, &shell_command)?;

        meta.pid = match self.mux.pane_pid(&meta.backing_session) {
            Ok(pid) => Some(pid),
            Err(err) => {
                warn!(err = %format!("{err:#}"), "could not read backing pane pid");
                None
            }
        };
        meta.status = SessionStatus::Running;
        meta.ended_at = None;
        meta.last_error = None;

        if let Err(err) = save(meta) {
            if let Err(kill_err) = self.mux.kill(&meta.backing_session) {
                return Err(err.context(format!(
                    "persist started session (rollback failed: {kill_err:#})"
                )));
            }
            return Err(err.context("persist started session"));
        }
        info!(session = %meta.backing_session, pid = ?meta.pid, "session started");
        Ok(())
    }

    /// Force-end the backing session and mark the session `Stopped`.
    ///
    /// A run that already concluded with an exit code is left untouched.
    #[instrument(skip_all, fields(id = %meta.id))]
    pub fn stop(&self, meta: &mut SessionMetadata) -> Result<StopOutcome> {
        if meta.status.is_terminal()
            && read_exit_record(&meta.exit_code_path)? != ExitRecord::Missing
        {
            debug!(status = %meta.status, "session already finished, not stopping");
            return Ok(StopOutcome::AlreadyFinished(meta.status));
        }
        self.mux
            .kill(&meta.backing_session)
            .with_context(|| format!("stop backing session {}", meta.backing_session))?;
        meta.status = SessionStatus::Stopped;
        meta.ended_at = Some(Utc::now());
        meta.last_error = None;
        save(meta)?;
        Ok(StopOutcome::Stopped)
    }

    pub fn attach(&self, meta: &SessionMetadata) -> Result<()> {
        self.mux.attach(&meta.backing_session)
    }

    /// Derive the session's true status from disk and multiplexer state.
    ///
    /// Idempotent. Returns whether the metadata changed (and was persisted).
    pub fn reconcile(&self, meta: &mut SessionMetadata) -> Result<bool> {
        self.reconcile_at(meta, Utc::now())
    }

    /// [`reconcile`](Self::reconcile) against an explicit clock.
    #[instrument(skip_all, fields(id = %meta.id, status = %meta.status))]
    pub fn reconcile_at(&self, meta: &mut SessionMetadata, now: DateTime<Utc>) -> Result<bool> {
        let before = meta.clone();
        meta.last_output_at = latest_output(meta);
        if let Some(count) = read_restart_count(&meta.restarts_path) {
            meta.restart_count = count;
        }

        // Liveness is sampled before the exit file so a run finishing in
        // between is seen as concluded rather than vanished.
        let state = self.mux.state(&meta.backing_session);
        match read_exit_record(&meta.exit_code_path)? {
            ExitRecord::Missing => self.reconcile_unfinished(meta, state?, now)?,
            record => {
                self.cleanup_finished(&meta.backing_session, state);
                match record {
                    ExitRecord::Code(0) => {
                        meta.status = SessionStatus::Done;
                        meta.last_error = None;
                    }
                    ExitRecord::Code(code) => {
                        meta.status = SessionStatus::Failed;
                        meta.last_error = Some(format!("agent exited with code {code}"));
                    }
                    ExitRecord::Corrupt(raw) => {
                        meta.status = SessionStatus::Failed;
                        meta.last_error = Some(format!("unreadable exit code {raw:?}"));
                    }
                    ExitRecord::Missing => {}
                }
                meta.ended_at.get_or_insert(now);
            }
        }

        let changed = *meta != before;
        if changed {
            debug!(from = %before.status, to = %meta.status, "session reconciled");
            save(meta)?;
        }
        Ok(changed)
    }

    /// Best-effort kill of a concluded run's lingering backing session.
    fn cleanup_finished(&self, session: &str, state: Result<PaneState>) {
        let cleanup = state.and_then(|state| {
            if state.is_present() {
                self.mux.kill(session)
            } else {
                Ok(())
            }
        });
        if let Err(err) = cleanup {
            warn!(
                session,
                err = %format!("{err:#}"),
                "could not clean up finished backing session"
            );
        }
    }

    fn reconcile_unfinished(
        &self,
        meta: &mut SessionMetadata,
        state: PaneState,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if meta.status.is_terminal() {
            return Ok(());
        }
        match state {
            PaneState::Alive => {
                let silent = now
                    .signed_duration_since(meta.last_output_at)
                    .to_std()
                    .unwrap_or_default();
                meta.status = if silent > meta.idle_timeout() {
                    SessionStatus::Idle
                } else {
                    SessionStatus::Running
                };
                meta.ended_at = None;
            }
            PaneState::Exited | PaneState::Absent => {
                if state == PaneState::Exited {
                    self.mux.kill(&meta.backing_session)?;
                }
                warn!(session = %meta.backing_session, "backing session gone without exit code");
                meta.status = SessionStatus::Failed;
                meta.last_error.get_or_insert_with(|| DISAPPEARED.to_string());
                meta.ended_at.get_or_insert(now);
            }
        }
        Ok(())
    }

    /// Load one session's metadata without reconciling it.
    pub fn load(&self, id: &str) -> Result<SessionMetadata> {
        validate_session_id(id)?;
        let path = self.sessions_root().join(id).join(METADATA_FILE);
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("read session metadata {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("parse session metadata {}", path.display()))
    }

    /// All readable sessions, newest first. Unreadable entries are skipped.
    pub fn list(&self) -> Result<Vec<SessionMetadata>> {
        let root = self.sessions_root();
        let entries = match fs::read_dir(&root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err).with_context(|| format!("read {}", root.display())),
        };

        let mut sessions = Vec::new();
        for entry in entries {
            let entry = entry.with_context(|| format!("read {}", root.display()))?;
            if !entry.file_type().is_ok_and(|kind| kind.is_dir()) {
                continue;
            }
            let name = entry.file_name();
            let Some(id) = name.to_str() else {
                continue;
            };
            match self.load(id) {
                Ok(meta) => sessions.push(meta),
                Err(err) => warn!(id, err = %format!("{err:#}"), "skipping unreadable session"),
            }
        }
        sessions.sort_by(|a, b| {
            b.started_at
                .cmp(&a.started_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(sessions)
    }

    /// Remove a session's artifacts, first killing a still-present backing
    /// session (best effort).
    #[instrument(skip_all, fields(id = id))]
    pub fn delete(&self, id: &str) -> Result<()> {
        validate_session_id(id)?;
        match self.load(id) {
            Ok(meta) => {
                let kill = self
                    .mux
                    .state(&meta.backing_session)
                    .and_then(|state| {
                        if state.is_present() {
                            self.mux.kill(&meta.backing_session)
                        } else {
                            Ok(())
                        }
                    });
                if let Err(err) = kill {
                    warn!(
                        err = %format!("{err:#}"),
                        "could not kill backing session before delete"
                    );
                }
            }
            Err(err) => debug!(err = %format!("{err:#}"), "deleting session without metadata"),
        }
        let dir = self.sessions_root().join(id);
        fs::remove_dir_all(&dir)
            .with_context(|| format!("delete session directory {}", dir.display()))?;
        info!("session deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn new_id_has_timestamp_and_hex_suffix() {
        let now = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let id = new_id(now);
        assert!(id.starts_with("20260102T030405Z-"), "{id}");
        validate_session_id(&id).expect("generated id is valid");
        assert_ne!(new_id(now), new_id(now));
    }

    #[test]
    fn rejects_path_like_ids() {
        for bad in ["", "..", "../x", "20260102T030405Z-ZZZZZZZZ", "20260102T030405Z-1a2b3c4d/.."] {
            assert!(validate_session_id(bad).is_err(), "{bad:?}");
        }
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r#"'it'"'"'s'"#);
    }

    #[test]
    fn exit_record_distinguishes_missing_empty_and_corrupt() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("exit.code");
        assert_eq!(read_exit_record(&path).expect("read"), ExitRecord::Missing);

        fs::write(&path, "  \n").expect("write");
        assert_eq!(read_exit_record(&path).expect("read"), ExitRecord::Missing);

        fs::write(&path, "0\n").expect("write");
        assert_eq!(read_exit_record(&path).expect("read"), ExitRecord::Code(0));

        fs::write(&path, "137\n").expect("write");
        assert_eq!(read_exit_record(&path).expect("read"), ExitRecord::Code(137));

        fs::write(&path, "garbage").expect("write");
        assert_eq!(
            read_exit_record(&path).expect("read"),
            ExitRecord::Corrupt("garbage".to_string())
        );
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&SessionStatus::Stopped).expect("serialize");
        assert_eq!(json, "\"stopped\"");
        assert!(SessionStatus::Failed.is_terminal());
        assert!(!SessionStatus::Idle.is_terminal());
        assert!(!SessionStatus::Pending.is_terminal());
    }

    #[test]
    fn restart_count_ignores_blank_lines() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(RESTART_LOG_FILE);
        assert_eq!(read_restart_count(&path), None);
        fs::write(&path, "a\n\nb\n").expect("write");
        assert_eq!(read_restart_count(&path), Some(2));
    }
}
