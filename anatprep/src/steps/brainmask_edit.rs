//! Manual brainmask refinement between fMRIPrep iterations.
//!
//! The mask being edited lives in the current `iter-N/` directory as
//! `sub-X_ses-Y_desc-brain_mask.nii.gz`. It is taken from there when an
//! earlier edit left one, otherwise copied from the fMRIPrep outputs, or
//! converted from FreeSurfer's `brainmask.mgz`. After the viewer closes the
//! iteration advances and the edited mask is carried into `iter-(N+1)/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;

use crate::core::artifact::EntityName;
use crate::core::iteration::IterationStatus;
use crate::error::AnatprepError;
use crate::io::process::{ToolInvocation, require_tools, run_checked};
use crate::io::resolver::{SessionResolver, file_name};
use crate::io::tracker::IterationTracker;
use crate::steps::fmriprep::fmriprep_anat_dir;
use crate::steps::{
    BatchReport, SessionTarget, StepContext, UnitOutcome, ensure_produced, for_each_session,
    reference_t1w_queries,
};

pub fn run_brainmask_edit(ctx: &StepContext<'_>, target: &SessionTarget) -> Result<BatchReport> {
    require_tools(ctx.tools, &[("itksnap", "ITK-SNAP")])?;
    for_each_session(ctx, target, "brainmask-edit", |session| {
        edit_session(ctx, session)
    })
}

fn edit_session(ctx: &StepContext<'_>, session: &SessionResolver) -> Result<UnitOutcome> {
    let mut tracker =
        IterationTracker::open(&session.deriv_dir, ctx.config.iteration.max_iterations)?;
    let state = tracker.state();
    if state.is_finalized() {
        return Err(AnatprepError::StateTransition(format!(
            "brainmask loop of {session} is finalized (reset to start over)"
        ))
        .into());
    }
    if !state.can_advance() {
        return Err(AnatprepError::StateTransition(format!(
            "brainmask loop of {session} is at the last iteration ({}); finalize it or raise \
             iteration.max_iterations",
            state.max_iterations
        ))
        .into());
    }
    let iteration = state.current_iteration;
    info!(session = %session, summary = %state.summary(), "editing brainmask");

    let iter_dir = session.iter_dir(iteration)?;
    let mask = locate_brainmask(ctx, session, &iter_dir)?;
    let runs = session.list_runs()?;
    let background_run = runs.first().copied().unwrap_or(1);
    let t1w = session
        .find_first_derived(&reference_t1w_queries(), Some(background_run))
        .ok_or_else(|| {
            AnatprepError::NotFound(format!("T1w background image for {session}"))
        })?;

    info!(
        background = %file_name(&t1w),
        mask = %file_name(&mask),
        "opening ITK-SNAP; edit the mask, save (Ctrl+S) and close the viewer"
    );
    let invocation = ToolInvocation::new("itksnap")
        .arg("-g")
        .path_arg(&t1w)
        .arg("-s")
        .path_arg(&mask)
        .interactive();
    run_checked(ctx.tools, &invocation)?;

    tracker.set_status(IterationStatus::AwaitingEdit, "brainmask edited")?;
    let next = tracker.advance()?;
    let next_dir = session.iter_dir(next)?;
    let carried = next_dir.join(file_name(&mask));
    fs::copy(&mask, &carried)
        .with_context(|| format!("copy {} to {}", mask.display(), carried.display()))?;
    info!(
        iteration = next,
        mask = %carried.display(),
        "advanced; run `anatprep fmriprep` with the refined mask"
    );
    Ok(UnitOutcome::Produced)
}

/// The mask to edit, placed in `iter_dir`.
fn locate_brainmask(
    ctx: &StepContext<'_>,
    session: &SessionResolver,
    iter_dir: &Path,
) -> Result<PathBuf> {
    let target = iter_dir.join(session.descriptor("brain", "mask", None).file_name());
    if target.exists() {
        return Ok(target);
    }

    let anat_dirs = [
        fmriprep_anat_dir(ctx, session),
        ctx.layout
            .root
            .join("derivatives/fmriprep")
            .join(format!("sub-{}", session.subject))
            .join("anat"),
    ];
    if let Some(found) = anat_dirs.iter().find_map(|dir| find_native_brainmask(dir)) {
        info!(source = %found.display(), "using fMRIPrep brain mask");
        fs::copy(&found, &target)
            .with_context(|| format!("copy {} to {}", found.display(), target.display()))?;
        return Ok(target);
    }

    let mgz = ctx
        .layout
        .root
        .join("derivatives/freesurfer")
        .join(format!("sub-{}", session.subject))
        .join("mri/brainmask.mgz");
    if mgz.exists() {
        if !ctx.tools.is_available("mri_convert") {
            return Err(AnatprepError::Misconfiguration(
                "not found in PATH: 'mri_convert' (FreeSurfer), needed to convert brainmask.mgz"
                    .to_string(),
            )
            .into());
        }
        info!(source = %mgz.display(), "converting FreeSurfer brainmask.mgz");
        let invocation = ToolInvocation::new("mri_convert")
            .path_arg(&mgz)
            .path_arg(&target)
            .log_to(&session.log_path("brainmask_edit"));
        run_checked(ctx.tools, &invocation)?;
        ensure_produced(&target, "mri_convert")?;
        return Ok(target);
    }

    Err(AnatprepError::NotFound(format!(
        "brain mask for {session} in {} or the fMRIPrep/FreeSurfer outputs (run `anatprep fmriprep` first)",
        iter_dir.display()
    ))
    .into())
}

/// `*_desc-brain_mask.nii.gz` in native space (no `space` entity).
fn find_native_brainmask(dir: &Path) -> Option<PathBuf> {
    let mut matches: Vec<PathBuf> = fs::read_dir(dir)
        .ok()?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            let name = file_name(path);
            EntityName::parse(&name).is_some_and(|parsed| {
                parsed.is_nifti()
                    && parsed.suffix == "mask"
                    && parsed.entity("desc") == Some("brain")
                    && parsed.entity("space").is_none()
            })
        })
        .collect();
    matches.sort();
    matches.into_iter().next()
}
