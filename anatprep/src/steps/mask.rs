//! Brain mask from the second inversion, via FSL BET or SPM.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

use crate::error::AnatprepError;
use crate::io::process::{ToolInvocation, require_tools, run_checked};
use crate::io::resolver::{SessionResolver, file_name};
use crate::steps::{
    BatchReport, SessionTarget, StepContext, UnitOutcome, ensure_produced, for_each_run,
    locate_inv2,
};

/// SPM wrapper expected in the scripts directory.
pub const SPM_MASK_SCRIPT: &str = "spm_mask.sh";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskMethod {
    Bet,
    Spm,
}

impl MaskMethod {
    /// `desc` entity of the produced mask.
    pub fn desc(self) -> &'static str {
        match self {
            MaskMethod::Bet => "bet",
            MaskMethod::Spm => "spmmask",
        }
    }
}

pub fn run_mask(
    ctx: &StepContext<'_>,
    target: &SessionTarget,
    method: MaskMethod,
) -> Result<BatchReport> {
    match method {
        MaskMethod::Bet => require_tools(ctx.tools, &[("bet", "FSL")])?,
        MaskMethod::Spm => {
            ctx.config.require_spm_path()?;
            spm_script(ctx)?;
            require_tools(ctx.tools, &[("bash", "bash")])?;
        }
    }
    for_each_run(ctx, target, "mask", |session, run| {
        mask_run(ctx, session, run, method)
    })
}

fn mask_run(
    ctx: &StepContext<'_>,
    session: &SessionResolver,
    run: u32,
    method: MaskMethod,
) -> Result<UnitOutcome> {
    let output = session.output_path(method.desc(), "mask", Some(run), None)?;
    if !ctx.should_run(std::slice::from_ref(&output)) {
        return Ok(UnitOutcome::Skipped);
    }
    let inv2 = locate_inv2(session, run)?;
    info!(run, inv2 = %file_name(&inv2), method = method.desc(), "computing brain mask");
    match method {
        MaskMethod::Bet => bet(ctx, session, run, &inv2, &output)?,
        MaskMethod::Spm => spm(ctx, session, &inv2, &output)?,
    }
    Ok(UnitOutcome::Produced)
}

/// `bet <inv2> <prefix> -f F -g G -m`, then move `<prefix>_mask` into place.
fn bet(
    ctx: &StepContext<'_>,
    session: &SessionResolver,
    run: u32,
    inv2: &Path,
    output: &Path,
) -> Result<()> {
    let prefix = session.deriv_dir.join(format!("{}_run-{run}_bettmp", session.prefix()));
    let invocation = ToolInvocation::new("bet")
        .path_arg(inv2)
        .path_arg(&prefix)
        .arg("-f")
        .arg(ctx.config.bet.frac.to_string())
        .arg("-g")
        .arg(ctx.config.bet.grad.to_string())
        .arg("-m")
        .log_to(&session.log_path("mask"));
    run_checked(ctx.tools, &invocation)?;

    let produced = with_suffix(&prefix, "_mask.nii.gz");
    ensure_produced(&produced, "bet")?;
    fs::rename(&produced, output)
        .with_context(|| format!("move {} to {}", produced.display(), output.display()))?;
    let brain = with_suffix(&prefix, ".nii.gz");
    if brain.exists() {
        fs::remove_file(&brain).with_context(|| format!("remove {}", brain.display()))?;
    }
    ensure_produced(output, "bet")
}

/// `bash spm_mask.sh -s SPM -m MATLAB <inv2> <out>`.
fn spm(
    ctx: &StepContext<'_>,
    session: &SessionResolver,
    inv2: &Path,
    output: &Path,
) -> Result<()> {
    let spm_path = ctx.config.require_spm_path()?;
    let invocation = ToolInvocation::new("bash")
        .path_arg(&spm_script(ctx)?)
        .arg("-s")
        .path_arg(spm_path)
        .arg("-m")
        .arg(ctx.config.tools.matlab_cmd.as_str())
        .path_arg(inv2)
        .path_arg(output)
        .env("LOG_DIR", session.log_dir.display().to_string())
        .log_to(&session.log_path("mask"));
    run_checked(ctx.tools, &invocation)?;
    ensure_produced(output, "spm_mask.sh")
}

fn spm_script(ctx: &StepContext<'_>) -> Result<std::path::PathBuf> {
    let script = ctx.config.scripts_dir(&ctx.layout.root).join(SPM_MASK_SCRIPT);
    if !script.is_file() {
        return Err(AnatprepError::Misconfiguration(format!(
            "SPM mask script not found: {} (set tools.scripts_dir)",
            script.display()
        ))
        .into());
    }
    Ok(script)
}

fn with_suffix(prefix: &Path, suffix: &str) -> std::path::PathBuf {
    let mut name = prefix.as_os_str().to_owned();
    name.push(suffix);
    name.into()
}
