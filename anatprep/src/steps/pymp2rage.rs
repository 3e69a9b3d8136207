//! UNIT1 T1w and T1 map fitting from the four MP2RAGE channels.
//!
//! The fit itself is delegated to `tools.pymp2rage_cmd`. When a DREAM B1 map
//! exists for the run a second, B1-corrected fit is attempted; its failure
//! is logged and does not fail the run.

use std::path::PathBuf;

use anyhow::Result;
use tracing::{info, warn};

use crate::core::artifact::{Part, dream_b1map, mp2rage_part};
use crate::error::AnatprepError;
use crate::io::config::{Mp2rageParams, load_mp2rage_params};
use crate::io::process::{ToolInvocation, require_tools, run_checked};
use crate::io::resolver::{SessionResolver, SourceDir, file_name};
use crate::steps::{
    BatchReport, SessionTarget, StepContext, UnitOutcome, ensure_produced, for_each_run,
};

pub const DESC: &str = "pymp2rage";
pub const DESC_B1CORR: &str = "pymp2rageb1corr";

/// Raw inputs of one run's fit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mp2rageParts {
    pub inv1_mag: PathBuf,
    pub inv1_phase: PathBuf,
    pub inv2_mag: PathBuf,
    pub inv2_phase: PathBuf,
}

impl Mp2rageParts {
    pub fn locate(session: &SessionResolver, run: u32) -> Result<Self> {
        Ok(Self {
            inv1_mag: session.locate_source(&mp2rage_part(1, Part::Mag), Some(run))?,
            inv1_phase: session.locate_source(&mp2rage_part(1, Part::Phase), Some(run))?,
            inv2_mag: session.locate_source(&mp2rage_part(2, Part::Mag), Some(run))?,
            inv2_phase: session.locate_source(&mp2rage_part(2, Part::Phase), Some(run))?,
        })
    }
}

pub fn run_pymp2rage(ctx: &StepContext<'_>, target: &SessionTarget) -> Result<BatchReport> {
    let params = load_mp2rage_params(&ctx.layout.mp2rage_params_path).ok_or_else(|| {
        AnatprepError::Misconfiguration(format!(
            "{} not found or invalid; it is required for the MP2RAGE fit",
            ctx.layout.mp2rage_params_path.display()
        ))
    })?;
    require_tools(ctx.tools, &[(ctx.config.tools.pymp2rage_cmd.as_str(), "pymp2rage")])?;
    for_each_run(ctx, target, "pymp2rage", |session, run| {
        fit_run(ctx, session, run, &params)
    })
}

fn fit_run(
    ctx: &StepContext<'_>,
    session: &SessionResolver,
    run: u32,
    params: &Mp2rageParams,
) -> Result<UnitOutcome> {
    let t1w = session.output_path(DESC, "T1w", Some(run), None)?;
    let t1map = session.output_path(DESC, "T1map", Some(run), None)?;
    let mask = session.output_path(DESC, "mask", Some(run), None)?;
    let need_basic = ctx.should_run(&[t1w.clone(), t1map.clone(), mask.clone()]);

    let b1map = session.find_source(SourceDir::Fmap, &dream_b1map(), Some(run));
    let t1w_b1 = session.output_path(DESC_B1CORR, "T1w", Some(run), None)?;
    let t1map_b1 = session.output_path(DESC_B1CORR, "T1map", Some(run), None)?;
    let need_b1 = b1map.is_some() && ctx.should_run(&[t1w_b1.clone(), t1map_b1.clone()]);

    if !need_basic && !need_b1 {
        return Ok(UnitOutcome::Skipped);
    }

    let parts = Mp2rageParts::locate(session, run)?;
    info!(
        run,
        inv1_mag = %file_name(&parts.inv1_mag),
        inv2_mag = %file_name(&parts.inv2_mag),
        b1map = ?b1map.as_deref().map(file_name),
        "fitting MP2RAGE"
    );

    if need_basic {
        let invocation = fit_invocation(ctx, session, &parts, params)
            .arg("--out-t1w")
            .path_arg(&t1w)
            .arg("--out-t1map")
            .path_arg(&t1map)
            .arg("--out-mask")
            .path_arg(&mask);
        run_checked(ctx.tools, &invocation)?;
        for output in [&t1w, &t1map, &mask] {
            ensure_produced(output, "pymp2rage")?;
        }
    }

    if let Some(b1map) = b1map.filter(|_| need_b1) {
        let invocation = fit_invocation(ctx, session, &parts, params)
            .arg("--b1map")
            .path_arg(&b1map)
            .arg("--out-t1w")
            .path_arg(&t1w_b1)
            .arg("--out-t1map")
            .path_arg(&t1map_b1);
        let corrected = run_checked(ctx.tools, &invocation)
            .and_then(|()| ensure_produced(&t1w_b1, "pymp2rage"))
            .and_then(|()| ensure_produced(&t1map_b1, "pymp2rage"));
        if let Err(err) = corrected {
            warn!(run, err = %format!("{err:#}"), "B1 correction failed; uncorrected outputs are kept");
        }
    }
    Ok(UnitOutcome::Produced)
}

/// Inputs and sequence constants shared by both fits.
fn fit_invocation(
    ctx: &StepContext<'_>,
    session: &SessionResolver,
    parts: &Mp2rageParts,
    params: &Mp2rageParams,
) -> ToolInvocation {
    let shots: Vec<String> = params
        .number_shots
        .values()
        .iter()
        .map(|v| v.to_string())
        .collect();
    ToolInvocation::new(ctx.config.tools.pymp2rage_cmd.as_str())
        .arg("--inv1")
        .path_arg(&parts.inv1_mag)
        .arg("--inv1ph")
        .path_arg(&parts.inv1_phase)
        .arg("--inv2")
        .path_arg(&parts.inv2_mag)
        .arg("--inv2ph")
        .path_arg(&parts.inv2_phase)
        .arg("--mprage-tr")
        .arg(params.repetition_time_preparation.to_string())
        .arg("--flash-tr")
        .arg(params.repetition_time_excitation.to_string())
        .arg("--invtimes")
        .args(params.inversion_time.iter().map(|v| v.to_string()))
        .arg("--flipangles")
        .args(params.flip_angle.iter().map(|v| v.to_string()))
        .arg("--nzslices")
        .args(shots)
        .log_to(&session.log_path("pymp2rage"))
}
