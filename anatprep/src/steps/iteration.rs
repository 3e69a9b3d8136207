//! Brainmask-loop record operations exposed on the command line.

use anyhow::Result;
use tracing::info;

use crate::io::resolver::SessionResolver;
use crate::io::tracker::IterationTracker;
use crate::steps::{BatchReport, SessionTarget, StepContext, UnitOutcome, for_each_session};

/// Accept the current iteration of every target session.
pub fn run_finalize(ctx: &StepContext<'_>, target: &SessionTarget) -> Result<BatchReport> {
    for_each_session(ctx, target, "finalize", |session| {
        let mut tracker = open(ctx, session)?;
        if tracker.state().is_finalized() {
            info!(session = %session, "already finalized");
            return Ok(UnitOutcome::Skipped);
        }
        tracker.finalize()?;
        info!(session = %session, summary = %tracker.state().summary(), "finalized");
        Ok(UnitOutcome::Produced)
    })
}

/// Return every target session to iteration 1. `iter-N/` directories and
/// all other artifacts are left in place.
pub fn run_reset(ctx: &StepContext<'_>, target: &SessionTarget) -> Result<BatchReport> {
    for_each_session(ctx, target, "reset", |session| {
        let mut tracker = open(ctx, session)?;
        tracker.reset()?;
        info!(session = %session, summary = %tracker.state().summary(), "reset");
        Ok(UnitOutcome::Produced)
    })
}

fn open(ctx: &StepContext<'_>, session: &SessionResolver) -> Result<IterationTracker> {
    IterationTracker::open(&session.deriv_dir, ctx.config.iteration.max_iterations)
}
