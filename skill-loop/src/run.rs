//! `skill-loop run`: detach a loop run, or execute it in the foreground when
//! re-invoked as the detached child.

use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::types::{RouteTarget, RoutingGraph};
use crate::detach::{self, RunRequest};
use crate::io::config::{ConfigError, DEFAULT_CONFIG_FILE, load_graph};
use crate::io::executor::{AgentExecutor, SkillExecutor};
use crate::io::git::resolve_repo_root;
use crate::io::session::SessionRegistry;
use crate::io::tmux::Tmux;
use crate::looping::{LoopConfig, LoopError, LoopEvent, LoopOutcome, run_loop};

/// Parsed `run` arguments.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub config: Option<PathBuf>,
    pub max_iterations: Option<u32>,
    pub prompt: String,
    pub entrypoint: Option<String>,
    pub attach: bool,
    /// Internal marker: run the loop here instead of detaching.
    pub child: bool,
}

/// Absolute config path: the argument if given, else the default file in `cwd`.
pub fn resolve_config_path(arg: Option<&Path>, cwd: &Path) -> Result<PathBuf> {
    let path = match arg {
        Some(path) => cwd.join(path),
        None => {
            let default = cwd.join(DEFAULT_CONFIG_FILE);
            if !default.is_file() {
                return Err(ConfigError::Invalid(format!(
                    "no config file specified and {DEFAULT_CONFIG_FILE} not found in current directory"
                ))
                .into());
            }
            default
        }
    };
    Ok(path)
}

/// Progress text printed for a loop event.
pub fn describe_event(event: &LoopEvent) -> String {
    match event {
        LoopEvent::StepStarted { iteration, skill } => {
            format!("==> Running skill: {skill} (iteration {iteration})")
        }
        LoopEvent::StepFinished {
            summary,
            restarts,
            next,
            ..
        } => {
            let mut line = format!("    Summary: {summary}");
            if *restarts > 0 {
                line.push_str(&format!("\n    Restarts: {restarts}"));
            }
            if let RouteTarget::Skill(next) = next {
                line.push_str(&format!("\n    Next: {next}"));
            }
            line
        }
    }
}

/// Run the loop in this process, printing progress to stdout.
pub fn run_foreground<E: SkillExecutor>(
    graph: &RoutingGraph,
    executor: &E,
    request: &RunRequest,
) -> Result<LoopOutcome, LoopError> {
    let config = LoopConfig {
        entrypoint: request.entrypoint.clone(),
        max_iterations: request.max_iterations,
        prompt: request.prompt.clone(),
    };
    let outcome = run_loop(graph, executor, &config, |event| {
        println!("{}", describe_event(event));
    })?;
    println!("==> Loop finished.");
    Ok(outcome)
}

/// Entry point of the `run` command.
pub fn cmd_run(options: RunOptions) -> Result<()> {
    let cwd = env::current_dir().context("get working directory")?;
    let config_path = resolve_config_path(options.config.as_deref(), &cwd)?;
    let graph = load_graph(&config_path)?;
    debug!(config = %config_path.display(), skills = graph.skills.len(), "loaded routing graph");

    if let Some(unknown) = options
        .entrypoint
        .as_deref()
        .filter(|name| !name.is_empty() && !graph.contains(name))
    {
        return Err(LoopError::UnknownEntrypoint(unknown.to_string()).into());
    }

    let request = RunRequest {
        config_path,
        max_iterations: options.max_iterations,
        prompt: options.prompt,
        entrypoint: options.entrypoint,
    };

    if options.child {
        run_foreground(&graph, &AgentExecutor::from_env(), &request)?;
        return Ok(());
    }

    let registry = SessionRegistry::new(resolve_repo_root(&cwd), Tmux::from_env());
    let exe = env::current_exe().context("resolve executable path")?;
    let meta = detach::start_detached(&registry, &exe, &cwd, &request, &graph)?;

    println!("Started in background. run_id={}", meta.id);
    println!("Attach: skill-loop sessions attach {}", meta.id);

    if options.attach {
        detach::attach(&registry, &meta)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_config_is_made_absolute() {
        let cwd = Path::new("/work");
        let path = resolve_config_path(Some(Path::new("cfg/loop.toml")), cwd).expect("resolve");
        assert_eq!(path, PathBuf::from("/work/cfg/loop.toml"));

        let path = resolve_config_path(Some(Path::new("/abs/loop.toml")), cwd).expect("resolve");
        assert_eq!(path, PathBuf::from("/abs/loop.toml"));
    }

    #[test]
    fn default_config_must_exist() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = resolve_config_path(None, temp.path()).unwrap_err();
        assert!(err.to_string().contains("skill-loop.toml not found"));

        std::fs::write(temp.path().join(DEFAULT_CONFIG_FILE), "").expect("write");
        let path = resolve_config_path(None, temp.path()).expect("resolve");
        assert_eq!(path, temp.path().join(DEFAULT_CONFIG_FILE));
    }

    #[test]
    fn progress_lines() {
        let started = LoopEvent::StepStarted {
            iteration: 2,
            skill: "review".to_string(),
        };
        assert_eq!(
            describe_event(&started),
            "==> Running skill: review (iteration 2)"
        );

        let finished = LoopEvent::StepFinished {
            iteration: 2,
            skill: "review".to_string(),
            summary: "<REVIEW_OK>".to_string(),
            restarts: 0,
            next: RouteTarget::Done,
        };
        assert_eq!(describe_event(&finished), "    Summary: <REVIEW_OK>");

        let rerouted = LoopEvent::StepFinished {
            iteration: 3,
            skill: "review".to_string(),
            summary: "needs work".to_string(),
            restarts: 1,
            next: RouteTarget::Skill("impl".to_string()),
        };
        assert_eq!(
            describe_event(&rerouted),
            "    Summary: needs work\n    Restarts: 1\n    Next: impl"
        );
    }
}
