//! Stable exit codes for anatprep CLI commands.

use crate::error::AnatprepError;

/// Command succeeded for every session and run it touched.
pub const OK: i32 = 0;
/// At least one session or run failed, or an unexpected error occurred.
pub const FAILED: i32 = 1;
/// A required tool location, credential or setting is missing.
pub const MISCONFIGURED: i32 = 2;
/// The subject, session or an expected input does not exist.
pub const NOT_FOUND: i32 = 3;
/// The brainmask loop refused the requested transition.
pub const STATE_TRANSITION: i32 = 4;

/// Map an error chain to the exit code of its first typed cause.
pub fn for_error(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if let Some(typed) = cause.downcast_ref::<AnatprepError>() {
            return match typed {
                AnatprepError::NotFound(_) => NOT_FOUND,
                AnatprepError::Misconfiguration(_) => MISCONFIGURED,
                AnatprepError::StateTransition(_) => STATE_TRANSITION,
                AnatprepError::ExternalToolFailure { .. } | AnatprepError::Locked { .. } => {
                    FAILED
                }
            };
        }
    }
    FAILED
}
