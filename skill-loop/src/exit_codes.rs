//! Stable exit codes for `skill-loop` commands.

use crate::io::config::ConfigError;
use crate::looping::LoopError;

/// Command succeeded; for `run`, a terminal route was reached.
pub const OK: i32 = 0;
/// A step, session or other operation failed.
pub const FAILED: i32 = 1;
/// The loop hit its iteration cap without reaching a terminal route.
pub const ITERATION_LIMIT: i32 = 2;
/// Invalid configuration or usage.
pub const INVALID: i32 = 3;

/// Exit code for an error returned by a command.
pub fn for_error(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if cause.is::<ConfigError>() {
            return INVALID;
        }
        if let Some(loop_err) = cause.downcast_ref::<LoopError>() {
            return match loop_err {
                LoopError::IterationBudgetExceeded { .. } => ITERATION_LIMIT,
                LoopError::UnknownEntrypoint(_) | LoopError::UnknownSkill { .. } => INVALID,
                LoopError::Step { .. } => FAILED,
            };
        }
    }
    FAILED
}
