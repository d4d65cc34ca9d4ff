//! Stable exit codes for `provision` commands.

use crate::core::failure::{FailureCause, StepFailure};

/// Command succeeded (every step ran and passed).
pub const OK: i32 = 0;
/// Invalid plan/config/state, refused re-run, or any other error.
pub const INVALID: i32 = 1;
/// A step (or the run budget) timed out.
pub const TIMED_OUT: i32 = 124;
/// A command could not be started.
pub const SPAWN_FAILED: i32 = 127;

/// Exit code reported for a failed run.
///
/// Propagates the failing command's own status when it is a usable non-zero
/// code; everything else collapses to [`INVALID`].
pub fn for_failure(failure: &StepFailure) -> i32 {
    match failure.cause {
        FailureCause::TimedOut => TIMED_OUT,
        FailureCause::Spawn => SPAWN_FAILED,
        FailureCause::ExitStatus | FailureCause::Rejected => match failure.exit_status {
            Some(code) if (1..=255).contains(&code) => code,
            _ => INVALID,
        },
    }
}
