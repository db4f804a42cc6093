//! Helpers behind `skill-loop sessions`.
//!
//! Every read path reconciles the sessions it returns, so listings always show
//! status derived from disk and multiplexer state.

use std::fmt::Write as _;

use anyhow::{Context, Result, anyhow};
use chrono::SecondsFormat;
use tracing::warn;

use crate::detach::RUN_LABEL;
use crate::io::session::{SessionMetadata, SessionRegistry, SessionStatus};
use crate::io::tmux::Multiplexer;

/// Default page size of `sessions ls`.
pub const DEFAULT_LIST_LIMIT: usize = 20;

/// One page of run sessions.
#[derive(Debug, Clone)]
pub struct RunPage {
    pub sessions: Vec<SessionMetadata>,
    pub offset: usize,
    pub total: usize,
}

/// Reconciled run sessions, newest first. A `limit` of zero means no limit.
pub fn list_runs<M: Multiplexer>(
    registry: &SessionRegistry<M>,
    offset: usize,
    limit: usize,
) -> Result<RunPage> {
    let runs: Vec<_> = registry
        .list()?
        .into_iter()
        .filter(|meta| meta.label == RUN_LABEL)
        .collect();
    let total = runs.len();
    let take = if limit == 0 { usize::MAX } else { limit };

    let mut sessions: Vec<_> = runs.into_iter().skip(offset).take(take).collect();
    for meta in &mut sessions {
        if let Err(err) = registry.reconcile(meta) {
            warn!(id = %meta.id, err = %format!("{err:#}"), "failed to reconcile session");
        }
    }
    Ok(RunPage {
        sessions,
        offset,
        total,
    })
}

/// Load and reconcile one run session, rejecting sessions of other owners.
pub fn load_run<M: Multiplexer>(
    registry: &SessionRegistry<M>,
    id: &str,
) -> Result<SessionMetadata> {
    let mut meta = registry.load(id).with_context(|| {
        format!(
            "load session {id} (expected at {})",
            registry.sessions_root().join(id).join("session.json").display()
        )
    })?;
    if meta.label != RUN_LABEL {
        return Err(anyhow!("session {id} is not a run session"));
    }
    registry.reconcile(&mut meta)?;
    Ok(meta)
}

/// Render `ID STATUS STARTED LAST_OUTPUT` rows with aligned columns.
pub fn format_table(sessions: &[SessionMetadata]) -> String {
    let rows: Vec<[String; 4]> = sessions
        .iter()
        .map(|meta| {
            [
                meta.id.clone(),
                meta.status.to_string(),
                meta.started_at.to_rfc3339_opts(SecondsFormat::Secs, true),
                meta.last_output_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            ]
        })
        .collect();
    let header = ["ID", "STATUS", "STARTED", "LAST_OUTPUT"].map(str::to_string);

    let mut widths = header.clone().map(|cell| cell.len());
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }

    let mut out = String::new();
    for row in std::iter::once(&header).chain(&rows) {
        let mut line = String::new();
        for (i, (cell, width)) in row.iter().zip(widths).enumerate() {
            if i + 1 == row.len() {
                line.push_str(cell);
            } else {
                let _ = write!(line, "{cell:<width$}  ");
            }
        }
        out.push_str(line.trim_end());
        out.push('\n');
    }
    out
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PruneOptions {
    /// Report candidates without deleting.
    pub dry_run: bool,
    /// Also prune non-terminal sessions that are not running (pending, idle).
    pub all: bool,
}

#[derive(Debug, Clone, Default)]
pub struct PruneReport {
    /// Sessions deleted (or that would be, on a dry run).
    pub pruned: Vec<(String, SessionStatus)>,
    pub skipped_running: usize,
    pub skipped_non_terminal: usize,
    /// Sessions whose deletion failed, with the error.
    pub failures: Vec<(String, String)>,
}

/// Delete finished run sessions.
pub fn prune<M: Multiplexer>(
    registry: &SessionRegistry<M>,
    options: PruneOptions,
) -> Result<PruneReport> {
    let page = list_runs(registry, 0, 0)?;
    let mut report = PruneReport::default();

    for meta in page.sessions {
        if meta.status == SessionStatus::Running {
            report.skipped_running += 1;
            continue;
        }
        if !options.all && !meta.status.is_terminal() {
            report.skipped_non_terminal += 1;
            continue;
        }
        if options.dry_run {
            report.pruned.push((meta.id, meta.status));
            continue;
        }
        match registry.delete(&meta.id) {
            Ok(()) => report.pruned.push((meta.id, meta.status)),
            Err(err) => {
                warn!(id = %meta.id, err = %format!("{err:#}"), "failed to prune session");
                report.failures.push((meta.id, format!("{err:#}")));
            }
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::session::NewSession;
    use crate::test_support::FakeMultiplexer;
    use std::fs;
    use std::thread;
    use std::time::Duration;

    fn new_run(registry: &SessionRegistry<FakeMultiplexer>, label: &str) -> SessionMetadata {
        let mut meta = registry
            .create(NewSession {
                working_dir: registry.repo_root().to_path_buf(),
                label: label.to_string(),
                runtime: "skill-loop".to_string(),
                command: vec!["true".to_string()],
                idle_timeout: None,
                max_restarts: None,
            })
            .expect("create");
        registry.start(&mut meta).expect("start");
        meta
    }

    #[test]
    fn list_runs_filters_other_labels_and_paginates() {
        let temp = tempfile::tempdir().expect("tempdir");
        let registry = SessionRegistry::new(temp.path(), FakeMultiplexer::new());
        for _ in 0..3 {
            new_run(&registry, RUN_LABEL);
        }
        new_run(&registry, "other");

        let page = list_runs(&registry, 1, 1).expect("list");
        assert_eq!(page.total, 3);
        assert_eq!(page.sessions.len(), 1);

        let all = list_runs(&registry, 0, 0).expect("list");
        assert_eq!(all.sessions.len(), 3);
        assert!(all.sessions.iter().all(|meta| meta.label == RUN_LABEL));

        let past_end = list_runs(&registry, 10, 5).expect("list");
        assert!(past_end.sessions.is_empty());
    }

    #[test]
    fn load_run_rejects_foreign_sessions() {
        let temp = tempfile::tempdir().expect("tempdir");
        let registry = SessionRegistry::new(temp.path(), FakeMultiplexer::new());
        let other = new_run(&registry, "other");

        let err = load_run(&registry, &other.id).unwrap_err();
        assert!(err.to_string().contains("not a run session"));
    }

    #[test]
    fn prune_deletes_terminal_and_skips_running() {
        let temp = tempfile::tempdir().expect("tempdir");
        let registry = SessionRegistry::new(temp.path(), FakeMultiplexer::new());
        let done = new_run(&registry, RUN_LABEL);
        fs::write(&done.exit_code_path, "0\n").expect("exit code");
        let running = new_run(&registry, RUN_LABEL);

        let dry = prune(
            &registry,
            PruneOptions {
                dry_run: true,
                all: false,
            },
        )
        .expect("dry run");
        assert_eq!(dry.pruned, vec![(done.id.clone(), SessionStatus::Done)]);
        assert_eq!(dry.skipped_running, 1);
        assert!(done.session_dir().exists());

        let report = prune(&registry, PruneOptions::default()).expect("prune");
        assert_eq!(report.pruned.len(), 1);
        assert!(report.failures.is_empty());
        assert!(!done.session_dir().exists());
        assert!(running.session_dir().exists());
    }

    #[test]
    fn prune_all_includes_idle_sessions() {
        let temp = tempfile::tempdir().expect("tempdir");
        let registry = SessionRegistry::new(temp.path(), FakeMultiplexer::new());
        let mut idle = registry
            .create(NewSession {
                working_dir: temp.path().to_path_buf(),
                label: RUN_LABEL.to_string(),
                runtime: "skill-loop".to_string(),
                command: vec!["true".to_string()],
                idle_timeout: Some(Duration::from_secs(1)),
                max_restarts: None,
            })
            .expect("create");
        registry.start(&mut idle).expect("start");
        thread::sleep(Duration::from_millis(1200));

        let report = prune(&registry, PruneOptions::default()).expect("prune");
        assert!(report.pruned.is_empty());
        assert_eq!(report.skipped_non_terminal, 1);

        let report = prune(
            &registry,
            PruneOptions {
                dry_run: false,
                all: true,
            },
        )
        .expect("prune all");
        assert_eq!(report.pruned, vec![(idle.id.clone(), SessionStatus::Idle)]);
        assert!(!idle.session_dir().exists());
        assert_eq!(registry.multiplexer().kills(), vec![idle.backing_session]);
    }

    #[test]
    fn table_aligns_columns() {
        let temp = tempfile::tempdir().expect("tempdir");
        let registry = SessionRegistry::new(temp.path(), FakeMultiplexer::new());
        let meta = new_run(&registry, RUN_LABEL);

        let table = format_table(&[meta.clone()]);
        let mut lines = table.lines();
        let header = lines.next().expect("header");
        assert!(header.starts_with("ID"));
        assert!(header.contains("STATUS"));
        let row = lines.next().expect("row");
        assert!(row.starts_with(&meta.id));
        assert!(row.contains("running"));
        let status_col = header.find("STATUS").expect("status column");
        assert_eq!(&row[status_col..status_col + "running".len()], "running");
    }
}
