//! Error taxonomy shared by the resolver, the tracker and the steps.
//!
//! Orchestration code works in `anyhow::Result`; these variants are the
//! causes callers classify on (see [`crate::exit_codes::for_error`]).
//! An algorithmic abort of the sinus deriver is not an error:
//! it is reported through [`crate::core::sinus::SinusOutcome`].

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnatprepError {
    /// An expected subject, session or input artifact is missing.
    #[error("not found: {0}")]
    NotFound(String),

    /// A required external-tool location, credential or setting is absent.
    #[error("misconfiguration: {0}")]
    Misconfiguration(String),

    /// A delegated tool exited non-zero (or was killed by a signal).
    #[error("{tool} failed with exit code {}{}", display_code(.code), display_log(.log))]
    ExternalToolFailure {
        tool: String,
        code: Option<i32>,
        log: Option<PathBuf>,
    },

    /// The brainmask loop refused an advancement or status change.
    #[error("state transition refused: {0}")]
    StateTransition(String),

    /// Another process holds the session's iteration record.
    #[error(
        "iteration record is locked by another invocation{}: {} (remove it if stale)",
        display_holder(.holder),
        .path.display()
    )]
    Locked { path: PathBuf, holder: Option<u32> },
}

fn display_holder(holder: &Option<u32>) -> String {
    match holder {
        Some(pid) => format!(" (pid {pid})"),
        None => String::new(),
    }
}

fn display_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "none (terminated by signal)".to_string(),
    }
}

fn display_log(log: &Option<PathBuf>) -> String {
    match log {
        Some(path) => format!(" (see log: {})", path.display()),
        None => String::new(),
    }
}
