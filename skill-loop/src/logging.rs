//! Diagnostics for skill-loop itself, kept apart from run output.
//!
//! Two channels reach the terminal:
//!
//! - stdout carries run progress (`==> Running skill: ...` and the step
//!   summaries) and the agents' passthrough output. A detached run's stdout is
//!   tee'd into the session's `stdout.log`.
//! - stderr carries these tracing events plus the agents' own stderr, which
//!   detached runs tee into `stderr.log`. Idle kills and restarts show up
//!   here at `warn`, so they land in the session log without extra setup.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber: `RUST_LOG` filter (default `warn`), compact
/// lines on stderr.
///
/// ```bash
/// RUST_LOG=skill_loop=debug skill-loop run --child
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let stderr = fmt::layer().with_writer(std::io::stderr).compact();
    tracing_subscriber::registry().with(filter).with(stderr).init();
}
