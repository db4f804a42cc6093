//! Git adapter used to locate the repository root.
//!
//! Session state lives under the repository root so that every subdirectory of
//! a checkout sees the same runs. Outside a repository (or without git on
//! `PATH`) the working directory itself is the root.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    /// Absolute path of the top-level directory of the enclosing work tree.
    #[instrument(skip_all)]
    pub fn show_toplevel(&self) -> Result<PathBuf> {
        let out = self.run_capture(&["rev-parse", "--show-toplevel"])?;
        let top = out.trim();
        if top.is_empty() {
            return Err(anyhow!("git rev-parse --show-toplevel returned nothing"));
        }
        debug!(toplevel = top, "resolved git toplevel");
        Ok(PathBuf::from(top))
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

/// Repository root for `cwd`, falling back to `cwd` outside git.
pub fn resolve_repo_root(cwd: &Path) -> PathBuf {
    match Git::new(cwd).show_toplevel() {
        Ok(root) => root,
        Err(err) => {
            debug!(err = %format!("{err:#}"), "not in a git work tree, using cwd");
            cwd.to_path_buf()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn git_available() -> bool {
        Command::new("git")
            .arg("--version")
            .output()
            .is_ok_and(|out| out.status.success())
    }

    #[test]
    fn falls_back_to_cwd_outside_repo() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = resolve_repo_root(temp.path());
        // A tempdir nested under some checkout would resolve to that checkout.
        if Git::new(temp.path()).show_toplevel().is_err() {
            assert_eq!(root, temp.path());
        }
    }

    #[test]
    fn resolves_toplevel_from_subdirectory() {
        if !git_available() {
            return;
        }
        let temp = tempfile::tempdir().expect("tempdir");
        let status = Command::new("git")
            .args(["init", "-q"])
            .current_dir(temp.path())
            .status()
            .expect("git init");
        assert!(status.success());
        let nested = temp.path().join("a/b");
        std::fs::create_dir_all(&nested).expect("mkdir");

        let root = resolve_repo_root(&nested);
        let expected = temp.path().canonicalize().expect("canonicalize");
        assert_eq!(root.canonicalize().expect("canonicalize"), expected);
    }
}
