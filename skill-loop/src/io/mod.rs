//! I/O helpers for skill-loop commands.

pub mod config;
pub mod executor;
pub mod git;
pub mod process;
pub mod prompt;
pub mod session;
pub mod tmux;
