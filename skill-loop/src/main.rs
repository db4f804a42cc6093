//! `skill-loop`: chain coding-agent CLI invocations through a routing graph.
//!
//! `run` starts a detached loop in a tmux-backed session and returns its id;
//! `sessions` inspects, attaches to, stops and prunes those runs.

use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser, Subcommand};

use skill_loop::io::git::resolve_repo_root;
use skill_loop::io::session::{SessionRegistry, StopOutcome, validate_session_id};
use skill_loop::io::tmux::Tmux;
use skill_loop::run::{RunOptions, cmd_run};
use skill_loop::sessions::{self, DEFAULT_LIST_LIMIT, PruneOptions};
use skill_loop::{detach, exit_codes, logging};

#[derive(Parser)]
#[command(
    name = "skill-loop",
    version,
    about = "Orchestrate agent skills in a loop, routing on each skill's output"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a skill loop (detached by default).
    Run(RunArgs),
    /// Manage tmux-backed run sessions.
    #[command(subcommand)]
    Sessions(SessionsCommand),
    /// Print version information.
    Version,
}

#[derive(Args)]
struct RunArgs {
    /// Routing config (defaults to ./skill-loop.toml).
    config: Option<PathBuf>,
    /// Maximum number of loop iterations (overrides config; default 100).
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    max_iterations: Option<u32>,
    /// Initial prompt passed to the first skill.
    #[arg(short, long, default_value = "")]
    prompt: String,
    /// Skill to start from (overrides config default_entrypoint).
    #[arg(short, long)]
    entrypoint: Option<String>,
    /// Attach to the detached run session immediately.
    #[arg(long, conflicts_with = "child")]
    attach: bool,
    /// Run the loop in this process (used by detached sessions).
    #[arg(long, hide = true)]
    child: bool,
}

#[derive(Subcommand)]
enum SessionsCommand {
    /// List recorded run sessions in the current repository.
    Ls {
        /// Maximum number of sessions to display (0 for all).
        #[arg(short = 'n', long, default_value_t = DEFAULT_LIST_LIMIT)]
        limit: usize,
        /// Number of sessions to skip.
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// Attach to a run session.
    Attach { id: String },
    /// Stop a run session.
    Stop { id: String },
    /// Delete run sessions that are no longer active.
    ///
    /// By default only terminal sessions (done, failed, stopped) are removed.
    Prune {
        /// Print sessions that would be pruned without deleting.
        #[arg(long)]
        dry_run: bool,
        /// Also prune non-running non-terminal sessions (pending, idle).
        #[arg(long)]
        all: bool,
    },
}

fn main() {
    logging::init();
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = if err.use_stderr() {
                exit_codes::INVALID
            } else {
                exit_codes::OK
            };
            let _ = err.print();
            std::process::exit(code);
        }
    };
    if let Err(err) = run(cli) {
        eprintln!("Error: {err:#}");
        std::process::exit(exit_codes::for_error(&err));
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run(args) => cmd_run(RunOptions {
            config: args.config,
            max_iterations: args.max_iterations,
            prompt: args.prompt,
            entrypoint: args.entrypoint,
            attach: args.attach,
            child: args.child,
        }),
        Command::Sessions(command) => cmd_sessions(command),
        Command::Version => {
            println!("skill-loop {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn registry() -> Result<SessionRegistry<Tmux>> {
    let cwd = env::current_dir().context("get working directory")?;
    Ok(SessionRegistry::new(resolve_repo_root(&cwd), Tmux::from_env()))
}

fn cmd_sessions(command: SessionsCommand) -> Result<()> {
    let registry = registry()?;
    match command {
        SessionsCommand::Ls { limit, offset } => {
            let page = sessions::list_runs(&registry, offset, limit)?;
            if page.sessions.is_empty() {
                println!("No sessions found.");
                return Ok(());
            }
            print!("{}", sessions::format_table(&page.sessions));
            eprintln!(
                "\nShowing {}-{} of {} sessions",
                page.offset + 1,
                page.offset + page.sessions.len(),
                page.total
            );
            Ok(())
        }
        SessionsCommand::Attach { id } => {
            validate_session_id(&id)?;
            let meta = sessions::load_run(&registry, &id)?;
            detach::attach(&registry, &meta)
        }
        SessionsCommand::Stop { id } => {
            validate_session_id(&id)?;
            let mut meta = sessions::load_run(&registry, &id)?;
            match registry.stop(&mut meta)? {
                StopOutcome::Stopped => println!("Stopped {id}"),
                StopOutcome::AlreadyFinished(status) => {
                    println!("{id} already finished ({status})");
                }
            }
            Ok(())
        }
        SessionsCommand::Prune { dry_run, all } => {
            let report = sessions::prune(&registry, PruneOptions { dry_run, all })?;
            let verb = if dry_run { "would prune" } else { "pruned" };
            for (id, status) in &report.pruned {
                println!("{verb}: {id} ({status})");
            }
            for (id, err) in &report.failures {
                eprintln!("warn: failed to prune {id}: {err}");
            }
            eprintln!(
                "{}={} skipped_running={} skipped_non_terminal={}",
                if dry_run { "candidates" } else { "pruned" },
                report.pruned.len(),
                report.skipped_running,
                report.skipped_non_terminal
            );
            if report.failures.is_empty() {
                Ok(())
            } else {
                Err(anyhow!("failed to prune {} session(s)", report.failures.len()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_with_overrides() {
        let cli = Cli::parse_from([
            "skill-loop",
            "run",
            "loop.toml",
            "--max-iterations",
            "5",
            "-p",
            "seed",
            "-e",
            "review",
        ]);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.config, Some(PathBuf::from("loop.toml")));
        assert_eq!(args.max_iterations, Some(5));
        assert_eq!(args.prompt, "seed");
        assert_eq!(args.entrypoint.as_deref(), Some("review"));
        assert!(!args.attach);
        assert!(!args.child);
    }

    #[test]
    fn parse_hidden_child_flag() {
        let cli = Cli::parse_from(["skill-loop", "run", "--child"]);
        assert!(matches!(cli.command, Command::Run(RunArgs { child: true, .. })));
    }

    #[test]
    fn zero_max_iterations_is_rejected() {
        assert!(Cli::try_parse_from(["skill-loop", "run", "--max-iterations", "0"]).is_err());
    }

    #[test]
    fn parse_sessions_ls_defaults() {
        let cli = Cli::parse_from(["skill-loop", "sessions", "ls"]);
        assert!(matches!(
            cli.command,
            Command::Sessions(SessionsCommand::Ls {
                limit: 20,
                offset: 0
            })
        ));
    }

    #[test]
    fn parse_sessions_prune_flags() {
        let cli = Cli::parse_from(["skill-loop", "sessions", "prune", "--dry-run", "--all"]);
        assert!(matches!(
            cli.command,
            Command::Sessions(SessionsCommand::Prune {
                dry_run: true,
                all: true
            })
        ));
    }
}
