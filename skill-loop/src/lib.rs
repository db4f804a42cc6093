//! Skill loop engine.
//!
//! Chains invocations of external coding-agent CLIs: each skill's output is
//! routed by substring triggers to the next skill until a route reaches the
//! terminal marker. The architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (routing graph, route resolution,
//!   runtime command templates). No I/O.
//! - **[`io`]**: Side-effecting operations (config loading, process
//!   supervision, tmux, session persistence).
//!
//! Orchestration modules ([`looping`], [`detach`], [`run`], [`sessions`])
//! coordinate core logic with I/O to implement CLI commands.

pub mod core;
pub mod detach;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
pub mod run;
pub mod sessions;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
