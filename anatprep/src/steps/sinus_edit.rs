//! Manual sinus mask correction in ITK-SNAP.

use std::fs;

use anyhow::{Context, Result};
use ndarray::Array3;
use tracing::{info, warn};

use crate::core::artifact::DerivedQuery;
use crate::error::AnatprepError;
use crate::io::nifti_io::{read_volume, write_mask};
use crate::io::process::{ToolInvocation, require_tools, run_checked};
use crate::io::resolver::{SessionResolver, file_name};
use crate::steps::sinus_auto;
use crate::steps::{
    BatchReport, SessionTarget, StepContext, UnitOutcome, for_each_run, reference_t1w_queries,
};

pub const DESC: &str = "sinusfinal";

pub fn run_sinus_edit(ctx: &StepContext<'_>, target: &SessionTarget) -> Result<BatchReport> {
    require_tools(ctx.tools, &[("itksnap", "ITK-SNAP")])?;
    for_each_run(ctx, target, "sinus-edit", |session, run| {
        edit_run(ctx, session, run)
    })
}

fn edit_run(ctx: &StepContext<'_>, session: &SessionResolver, run: u32) -> Result<UnitOutcome> {
    let t1w = session
        .find_first_derived(&reference_t1w_queries(), Some(run))
        .ok_or_else(|| {
            AnatprepError::NotFound(format!(
                "T1w for {session} run-{run} (run `anatprep pymp2rage` first)"
            ))
        })?;
    let overlay = session.output_path(DESC, "mask", Some(run), None)?;

    if overlay.exists() && !ctx.force {
        info!(run, overlay = %file_name(&overlay), "continuing from existing final mask");
    } else if let Some(auto) = session.find_first_derived(
        &[
            DerivedQuery::desc_suffix(sinus_auto::DESC_DILATED, "mask"),
            DerivedQuery::desc_suffix(sinus_auto::DESC, "mask"),
        ],
        Some(run),
    ) {
        info!(run, seed = %file_name(&auto), "seeding final mask from the automatic mask");
        fs::copy(&auto, &overlay)
            .with_context(|| format!("copy {} to {}", auto.display(), overlay.display()))?;
    } else {
        warn!(run, "no automatic sinus mask (run `anatprep sinus-auto`); editing from an empty mask");
        let reference = read_volume(&t1w)?;
        write_mask(&overlay, &Array3::from_elem(reference.dim(), false), &reference.header)?;
    }

    info!(
        run,
        background = %file_name(&t1w),
        overlay = %file_name(&overlay),
        "opening ITK-SNAP; edit the mask, save (Ctrl+S) and close the viewer"
    );
    let invocation = ToolInvocation::new("itksnap")
        .arg("-g")
        .path_arg(&t1w)
        .arg("-s")
        .path_arg(&overlay)
        .interactive();
    run_checked(ctx.tools, &invocation)?;

    if overlay.exists() {
        info!(run, mask = %file_name(&overlay), "sinus mask saved");
        Ok(UnitOutcome::Produced)
    } else {
        Ok(UnitOutcome::Aborted(
            "no sinus mask file found after editing".to_string(),
        ))
    }
}
