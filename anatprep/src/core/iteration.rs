//! Brainmask refinement loop state machine.
//!
//! One record per session tracks which pass of the fMRIPrep / manual-edit
//! loop the session is in. Timestamps are supplied by the caller so every
//! transition here is deterministic; persistence lives in
//! [`crate::io::tracker`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::AnatprepError;

/// Default upper bound on `current_iteration`.
pub const DEFAULT_MAX_ITERATIONS: u32 = 5;

/// Where the session currently sits in the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationStatus {
    /// fMRIPrep has not run for this iteration yet.
    Pending,
    Running,
    /// fMRIPrep finished; the user should inspect its brainmask.
    AwaitingReview,
    /// The user chose to refine the mask.
    AwaitingEdit,
    /// Accepted. Terminal.
    Finalized,
    /// The delegated pipeline exited non-zero.
    Failed,
}

impl IterationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            IterationStatus::Pending => "pending",
            IterationStatus::Running => "running",
            IterationStatus::AwaitingReview => "awaiting_review",
            IterationStatus::AwaitingEdit => "awaiting_edit",
            IterationStatus::Finalized => "finalized",
            IterationStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for IterationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One appended line of the audit trail. Never modified once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub iteration: u32,
    pub status: IterationStatus,
    #[serde(default)]
    pub note: String,
    pub timestamp: String,
}

/// Persisted record (`iteration_state.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationState {
    pub current_iteration: u32,
    pub status: IterationStatus,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    /// Cap applied by `advance`; configuration, not part of the record.
    #[serde(skip, default = "default_max_iterations")]
    pub max_iterations: u32,
}

fn default_max_iterations() -> u32 {
    DEFAULT_MAX_ITERATIONS
}

impl IterationState {
    /// Fresh record: iteration 1, pending, empty history.
    pub fn new(now: &str) -> Self {
        Self {
            current_iteration: 1,
            status: IterationStatus::Pending,
            created_at: now.to_string(),
            updated_at: now.to_string(),
            history: Vec::new(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn is_finalized(&self) -> bool {
        self.status == IterationStatus::Finalized
    }

    pub fn can_advance(&self) -> bool {
        self.current_iteration < self.max_iterations && !self.is_finalized()
    }

    /// Reject records with iteration numbers below 1.
    pub fn validate(&self) -> Result<(), String> {
        if self.current_iteration < 1 {
            return Err("current_iteration must be >= 1".to_string());
        }
        if let Some(entry) = self.history.iter().find(|entry| entry.iteration < 1) {
            return Err(format!(
                "history entry at {} has iteration 0",
                entry.timestamp
            ));
        }
        Ok(())
    }

    /// Overwrite the status and append one history entry.
    ///
    /// Leaving `Finalized` is rejected; use [`IterationState::reset`].
    pub fn set_status(
        &mut self,
        status: IterationStatus,
        note: &str,
        now: &str,
    ) -> Result<(), AnatprepError> {
        if self.is_finalized() && status != IterationStatus::Finalized {
            return Err(AnatprepError::StateTransition(format!(
                "iteration {} is finalized; cannot set status to {status} (reset to start over)",
                self.current_iteration
            )));
        }
        self.status = status;
        self.push_history(note, now);
        Ok(())
    }

    /// Move to the next iteration with status `Pending`.
    ///
    /// Returns the new iteration number. Fails without touching the record
    /// when finalized or already at the cap.
    pub fn advance(&mut self, now: &str) -> Result<u32, AnatprepError> {
        if self.is_finalized() {
            return Err(AnatprepError::StateTransition(format!(
                "cannot advance: iteration {} is finalized",
                self.current_iteration
            )));
        }
        if self.current_iteration >= self.max_iterations {
            return Err(AnatprepError::StateTransition(format!(
                "cannot advance: already at max iterations ({})",
                self.max_iterations
            )));
        }
        let from = self.current_iteration;
        self.current_iteration += 1;
        self.status = IterationStatus::Pending;
        self.push_history(&format!("advanced from iteration {from}"), now);
        Ok(self.current_iteration)
    }

    /// Accept the current iteration.
    pub fn finalize(&mut self, now: &str) -> Result<(), AnatprepError> {
        let note = format!("accepted iteration {}", self.current_iteration);
        self.set_status(IterationStatus::Finalized, &note, now)
    }

    /// Back to iteration 1 / pending. History is kept and the reset recorded.
    pub fn reset(&mut self, now: &str) {
        self.current_iteration = 1;
        self.status = IterationStatus::Pending;
        self.push_history(RESET_NOTE, now);
    }

    /// `Iteration N/MAX  status: S`
    pub fn summary(&self) -> String {
        format!(
            "Iteration {}/{}  status: {}",
            self.current_iteration, self.max_iterations, self.status
        )
    }

    fn push_history(&mut self, note: &str, now: &str) {
        self.updated_at = now.to_string();
        self.history.push(HistoryEntry {
            iteration: self.current_iteration,
            status: self.status,
            note: note.to_string(),
            timestamp: now.to_string(),
        });
    }
}

const RESET_NOTE: &str = "reset";

#[cfg(test)]
mod tests {
    use super::*;

    const T0: &str = "2026-01-01T10:00:00";
    const T1: &str = "2026-01-01T11:00:00";

    fn state() -> IterationState {
        IterationState::new(T0)
    }

    #[test]
    fn fresh_state_is_pending_iteration_one() {
        let state = state();
        assert_eq!(state.current_iteration, 1);
        assert_eq!(state.status, IterationStatus::Pending);
        assert!(state.history.is_empty());
        assert!(state.can_advance());
        assert_eq!(state.summary(), "Iteration 1/5  status: pending");
    }

    #[test]
    fn advance_stops_at_cap_and_leaves_state_unchanged() {
        let mut state = state();
        for expected in 2..=5 {
            assert_eq!(state.advance(T1).expect("advance"), expected);
        }
        assert!(!state.can_advance());
        let before = state.clone();
        let err = state.advance(T1).unwrap_err();
        assert!(matches!(err, AnatprepError::StateTransition(_)));
        assert_eq!(state, before);
        assert_eq!(state.current_iteration, 5);
    }

    #[test]
    fn finalize_is_terminal_regardless_of_prior_status() {
        for prior in [
            IterationStatus::Pending,
            IterationStatus::Running,
            IterationStatus::AwaitingReview,
            IterationStatus::AwaitingEdit,
            IterationStatus::Failed,
        ] {
            let mut state = state();
            state.set_status(prior, "", T0).expect("set");
            state.finalize(T1).expect("finalize");
            assert!(!state.can_advance());
            assert!(state.advance(T1).is_err());
            assert!(state.advance(T1).is_err());
            assert_eq!(state.current_iteration, 1);
        }
    }

    #[test]
    fn leaving_finalized_is_rejected_but_refinalizing_is_not() {
        let mut state = state();
        state.finalize(T0).expect("finalize");
        let err = state
            .set_status(IterationStatus::Running, "", T1)
            .unwrap_err();
        assert!(err.to_string().contains("finalized"));
        assert_eq!(state.history.len(), 1);
        state.finalize(T1).expect("finalize again");
        assert_eq!(state.history.len(), 2);
    }

    #[test]
    fn history_grows_by_one_per_mutation_and_never_rewrites() {
        let mut state = state();
        state
            .set_status(IterationStatus::Running, "fmriprep started", T0)
            .expect("set");
        let first = state.history[0].clone();
        state
            .set_status(IterationStatus::AwaitingReview, "", T1)
            .expect("set");
        assert_eq!(state.history.len(), 2);
        state.advance(T1).expect("advance");
        assert_eq!(state.history.len(), 3);
        assert_eq!(state.history[0], first);
        let last = state.history.last().expect("entry");
        assert_eq!(last.iteration, 2);
        assert_eq!(last.status, IterationStatus::Pending);
        assert_eq!(state.updated_at, T1);
        assert_eq!(state.created_at, T0);
    }

    #[test]
    fn reset_returns_to_start_and_records_it() {
        let mut state = state();
        state.advance(T0).expect("advance");
        state.finalize(T0).expect("finalize");
        state.reset(T1);
        assert_eq!(state.current_iteration, 1);
        assert_eq!(state.status, IterationStatus::Pending);
        assert_eq!(state.history.len(), 3);
        assert!(state.can_advance());
        assert!(state.validate().is_ok());
    }

    #[test]
    fn custom_cap_is_honoured() {
        let mut state = state().with_max_iterations(2);
        state.advance(T0).expect("advance");
        assert!(state.advance(T0).is_err());
        assert_eq!(state.summary(), "Iteration 2/2  status: pending");
    }

    #[test]
    fn record_serializes_snake_case_status_without_cap() {
        let mut state = state();
        state
            .set_status(IterationStatus::AwaitingReview, "", T0)
            .expect("set");
        let json = serde_json::to_value(&state).expect("json");
        assert_eq!(json["status"], "awaiting_review");
        assert_eq!(json["history"][0]["status"], "awaiting_review");
        assert!(json.get("max_iterations").is_none());

        let parsed: IterationState = serde_json::from_value(json).expect("parse");
        assert_eq!(parsed.max_iterations, DEFAULT_MAX_ITERATIONS);
        assert_eq!(parsed, state);
    }

    #[test]
    fn validate_rejects_zero_iteration() {
        let mut state = state();
        state.current_iteration = 0;
        assert!(state.validate().is_err());
    }
}
