//! CAT12 tissue segmentation of the denoised T1w, through the MATLAB
//! wrapper script. Outputs stay in `cat12/run-N/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::info;

use crate::core::artifact::DerivedQuery;
use crate::error::AnatprepError;
use crate::io::process::{ToolInvocation, require_tools, run_checked};
use crate::io::resolver::{SessionResolver, file_name};
use crate::steps::{BatchReport, SessionTarget, StepContext, UnitOutcome, for_each_run};

pub const CAT12_SCRIPT: &str = "cat12_batch.sh";

/// Name prefixes of the segmentation outputs that mark a run as done.
const OUTPUT_PREFIXES: [&str; 2] = ["mwp1", "p0"];

pub fn run_cat12(ctx: &StepContext<'_>, target: &SessionTarget) -> Result<BatchReport> {
    ctx.config.require_spm_path()?;
    let script = ctx.config.scripts_dir(&ctx.layout.root).join(CAT12_SCRIPT);
    if !script.is_file() {
        return Err(AnatprepError::Misconfiguration(format!(
            "CAT12 batch script not found: {} (set tools.scripts_dir)",
            script.display()
        ))
        .into());
    }
    require_tools(ctx.tools, &[("bash", "bash")])?;
    for_each_run(ctx, target, "cat12", |session, run| {
        cat12_run(ctx, session, run, &script)
    })
}

fn cat12_run(
    ctx: &StepContext<'_>,
    session: &SessionResolver,
    run: u32,
    script: &Path,
) -> Result<UnitOutcome> {
    let out_dir = cat12_dir(session, run);
    fs::create_dir_all(&out_dir)
        .with_context(|| format!("create directory {}", out_dir.display()))?;
    let existing = segmentation_outputs(&out_dir)?;
    if !existing.is_empty() {
        if !ctx.force {
            info!(run, files = existing.len(), "CAT12 outputs exist, skipping (use --force to recompute)");
            return Ok(UnitOutcome::Skipped);
        }
        info!(run, files = existing.len(), "CAT12 outputs exist, recomputing (--force)");
    }

    let denoised = session
        .find_derived(&DerivedQuery::desc_suffix("denoised", "T1w"), Some(run), None)
        .ok_or_else(|| {
            AnatprepError::NotFound(format!(
                "denoised T1w for {session} run-{run} (run `anatprep denoise` first)"
            ))
        })?;
    let spm_path = ctx.config.require_spm_path()?;
    info!(run, input = %file_name(&denoised), "running CAT12");
    let invocation = ToolInvocation::new("bash")
        .path_arg(script)
        .arg("-s")
        .path_arg(spm_path)
        .arg("-m")
        .arg(ctx.config.tools.matlab_cmd.as_str())
        .arg("-i")
        .path_arg(&denoised)
        .arg("-o")
        .path_arg(&out_dir)
        .arg("-l")
        .path_arg(&session.log_dir)
        .log_to(&session.log_path("cat12"));
    run_checked(ctx.tools, &invocation)?;

    let produced = segmentation_outputs(&out_dir)?;
    if produced.is_empty() {
        return Err(anyhow!(
            "CAT12 finished but produced no mwp1*/p0* files in {}",
            out_dir.display()
        ));
    }
    info!(run, files = produced.len(), dir = %out_dir.display(), "CAT12 done");
    Ok(UnitOutcome::Produced)
}

pub fn cat12_dir(session: &SessionResolver, run: u32) -> PathBuf {
    session.deriv_dir.join("cat12").join(format!("run-{run}"))
}

/// `mwp1*` and `p0*` files of a CAT12 output directory.
pub fn segmentation_outputs(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut outputs = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("read directory {}", dir.display()))? {
        let path = entry?.path();
        let name = file_name(&path);
        if OUTPUT_PREFIXES.iter().any(|prefix| name.starts_with(prefix)) {
            outputs.push(path);
        }
    }
    outputs.sort();
    Ok(outputs)
}
