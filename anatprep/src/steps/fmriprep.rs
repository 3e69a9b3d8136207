//! fMRIPrep + FreeSurfer in Docker, one brainmask-loop iteration per call.
//!
//! Masks in use are snapshotted into `iter-N/` first, the iteration is
//! marked `running`, and the container's exit decides between
//! `awaiting_review` and `failed`. An iteration that already awaits review
//! is skipped unless forced.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::core::artifact::DerivedQuery;
use crate::core::iteration::IterationStatus;
use crate::error::AnatprepError;
use crate::io::process::{ToolInvocation, require_tools};
use crate::io::resolver::{SessionResolver, file_name};
use crate::io::tracker::IterationTracker;
use crate::steps::{BatchReport, SessionTarget, StepContext, UnitOutcome, for_each_session};

/// Masks copied into the iteration directory before each run.
const SNAPSHOT_DESCS: [&str; 4] = ["spmmask", "bet", "sinusfinal", "sinusauto"];

pub fn run_fmriprep(ctx: &StepContext<'_>, target: &SessionTarget) -> Result<BatchReport> {
    let license = ctx.config.require_freesurfer_license()?.to_path_buf();
    require_tools(ctx.tools, &[("docker", "Docker")])?;
    for_each_session(ctx, target, "fmriprep", |session| {
        fmriprep_session(ctx, session, &license)
    })
}

fn fmriprep_session(
    ctx: &StepContext<'_>,
    session: &SessionResolver,
    license: &Path,
) -> Result<UnitOutcome> {
    let mut tracker =
        IterationTracker::open(&session.deriv_dir, ctx.config.iteration.max_iterations)?;
    if tracker.state().is_finalized() {
        info!(session = %session, "brainmask loop is finalized; nothing to run (reset to start over)");
        return Ok(UnitOutcome::Skipped);
    }
    if tracker.state().status == IterationStatus::AwaitingReview && !ctx.force {
        info!(
            session = %session,
            iteration = tracker.state().current_iteration,
            "iteration already awaits review; edit the brain mask or use --force to re-run"
        );
        return Ok(UnitOutcome::Skipped);
    }
    let iteration = tracker.state().current_iteration;
    info!(
        session = %session,
        iteration,
        image = %ctx.config.tools.fmriprep.docker_image,
        "running fMRIPrep"
    );

    let iter_dir = session.iter_dir(iteration)?;
    snapshot_masks(session, &iter_dir)?;

    let derivatives = ctx.layout.root.join("derivatives");
    let fmriprep_out = derivatives.join("fmriprep");
    let freesurfer_out = derivatives.join("freesurfer");
    for dir in [&fmriprep_out, &freesurfer_out] {
        fs::create_dir_all(dir).with_context(|| format!("create directory {}", dir.display()))?;
    }

    tracker.set_status(
        IterationStatus::Running,
        &format!("fMRIPrep iteration {iteration}"),
    )?;

    let invocation = docker_invocation(ctx, session, license, &fmriprep_out, &freesurfer_out);
    debug!(command = %invocation.command_line(), "docker command");
    let exit = ctx.tools.run(&invocation);
    match exit {
        Ok(exit) if exit.success() => {
            tracker.set_status(
                IterationStatus::AwaitingReview,
                &format!("iteration {iteration} complete"),
            )?;
            info!(
                session = %session,
                iteration,
                "fMRIPrep complete; inspect the results, then run `anatprep brainmask-edit` \
                 to refine the mask or `anatprep finalize` to accept it"
            );
            Ok(UnitOutcome::Produced)
        }
        Ok(exit) => {
            tracker.set_status(
                IterationStatus::Failed,
                &format!("fMRIPrep failed at iteration {iteration}"),
            )?;
            Err(AnatprepError::ExternalToolFailure {
                tool: "fmriprep".to_string(),
                code: exit.code,
                log: invocation.log_path.clone(),
            }
            .into())
        }
        Err(err) => {
            tracker.set_status(
                IterationStatus::Failed,
                &format!("fMRIPrep could not start at iteration {iteration}"),
            )?;
            Err(err)
        }
    }
}

/// Copy the session's current masks into `iter_dir`, keeping earlier copies.
fn snapshot_masks(session: &SessionResolver, iter_dir: &Path) -> Result<()> {
    for run in session.list_runs()? {
        for desc in SNAPSHOT_DESCS {
            let Some(src) =
                session.find_derived(&DerivedQuery::desc_suffix(desc, "mask"), Some(run), None)
            else {
                continue;
            };
            let dst = iter_dir.join(file_name(&src));
            if dst.exists() {
                continue;
            }
            fs::copy(&src, &dst)
                .with_context(|| format!("copy {} to {}", src.display(), dst.display()))?;
            debug!(file = %file_name(&src), dir = %iter_dir.display(), "snapshot");
        }
    }
    Ok(())
}

fn docker_invocation(
    ctx: &StepContext<'_>,
    session: &SessionResolver,
    license: &Path,
    fmriprep_out: &Path,
    freesurfer_out: &Path,
) -> ToolInvocation {
    let cfg = &ctx.config.tools.fmriprep;
    let mut invocation = ToolInvocation::new("docker").args(["run", "--rm"]);
    if let Some(user) = docker_user(ctx, session) {
        invocation = invocation.arg("--user").arg(user);
    }
    invocation
        .arg("--volume")
        .arg(mount(&ctx.layout.rawdata_dir, "/data", true))
        .arg("--volume")
        .arg(mount(fmriprep_out, "/out/fmriprep", false))
        .arg("--volume")
        .arg(mount(freesurfer_out, "/out/freesurfer", false))
        .arg("--volume")
        .arg(mount(license, "/opt/freesurfer/license.txt", true))
        .arg("--volume")
        .arg(mount(&session.deriv_dir, "/anatprep", true))
        .arg(cfg.docker_image.as_str())
        .args(["/data", "/out/fmriprep", "participant"])
        .args(["--participant-label", session.subject.as_str()])
        .args(["--output-spaces", "T1w", "fsnative"])
        .args(["--fs-subjects-dir", "/out/freesurfer"])
        .arg("--nthreads")
        .arg(cfg.n_threads.to_string())
        .arg("--mem-mb")
        .arg(cfg.mem_mb.to_string())
        .args(["--skip-bids-validation", "--anat-only"])
        .log_to(&session.log_path("fmriprep"))
}

fn mount(host: &Path, container: &str, read_only: bool) -> String {
    let suffix = if read_only { ":ro" } else { "" };
    format!("{}:{container}{suffix}", host.display())
}

/// `tools.docker_user`, else the owner of the session's derived directory
/// so container outputs stay writable.
fn docker_user(ctx: &StepContext<'_>, session: &SessionResolver) -> Option<String> {
    if let Some(user) = &ctx.config.tools.docker_user {
        return Some(user.clone());
    }
    owner_of(&session.deriv_dir)
}

#[cfg(unix)]
fn owner_of(path: &Path) -> Option<String> {
    use std::os::unix::fs::MetadataExt;
    let meta = fs::metadata(path).ok()?;
    Some(format!("{}:{}", meta.uid(), meta.gid()))
}

#[cfg(not(unix))]
fn owner_of(_path: &Path) -> Option<String> {
    None
}

/// Where fMRIPrep writes the anatomical outputs of a session.
pub fn fmriprep_anat_dir(ctx: &StepContext<'_>, session: &SessionResolver) -> PathBuf {
    ctx.layout
        .root
        .join("derivatives")
        .join("fmriprep")
        .join(format!("sub-{}", session.subject))
        .join(format!("ses-{}", session.session))
        .join("anat")
}
