//! In-process background removal of the fitted T1w.

use std::path::Path;

use anyhow::{Result, anyhow};
use tracing::info;

use crate::core::artifact::DerivedQuery;
use crate::core::denoise::remove_background;
use crate::error::AnatprepError;
use crate::io::nifti_io::{read_mask, read_volume, write_volume};
use crate::io::resolver::{SessionResolver, file_name};
use crate::steps::{
    BatchReport, SessionTarget, StepContext, UnitOutcome, for_each_run, locate_inv2,
};

/// Fitted input `desc` → denoised output `desc`.
const PAIRS: [(&str, &str); 2] = [
    ("pymp2rage", "denoised"),
    ("pymp2rageb1corr", "denoisedb1corr"),
];

pub fn run_denoise(ctx: &StepContext<'_>, target: &SessionTarget) -> Result<BatchReport> {
    for_each_run(ctx, target, "denoise", |session, run| {
        denoise_run(ctx, session, run)
    })
}

fn denoise_run(ctx: &StepContext<'_>, session: &SessionResolver, run: u32) -> Result<UnitOutcome> {
    let fitted = session
        .find_derived(&DerivedQuery::desc_suffix(PAIRS[0].0, "T1w"), Some(run), None)
        .ok_or_else(|| {
            AnatprepError::NotFound(format!(
                "pymp2rage T1w for {session} run-{run} (run `anatprep pymp2rage` first)"
            ))
        })?;
    let mask = session
        .find_first_derived(
            &[
                DerivedQuery::desc_suffix("spmmask", "mask"),
                DerivedQuery::desc_suffix("bet", "mask"),
            ],
            Some(run),
        )
        .ok_or_else(|| {
            AnatprepError::NotFound(format!(
                "brain mask for {session} run-{run} (run `anatprep mask` first)"
            ))
        })?;
    let inv2 = locate_inv2(session, run)?;

    let mut produced = false;
    for (input_desc, output_desc) in PAIRS {
        let input = if input_desc == PAIRS[0].0 {
            Some(fitted.clone())
        } else {
            session.find_derived(&DerivedQuery::desc_suffix(input_desc, "T1w"), Some(run), None)
        };
        let Some(input) = input else {
            continue;
        };
        let output = session.output_path(output_desc, "T1w", Some(run), None)?;
        if !ctx.should_run(std::slice::from_ref(&output)) {
            continue;
        }
        info!(
            run,
            t1w = %file_name(&input),
            mask = %file_name(&mask),
            inv2 = %file_name(&inv2),
            "removing background"
        );
        denoise_file(&input, &mask, &inv2, &output)?;
        info!(output = %file_name(&output), "wrote");
        produced = true;
    }
    Ok(if produced {
        UnitOutcome::Produced
    } else {
        UnitOutcome::Skipped
    })
}

/// Read the three volumes, apply the formula, write with the T1w header.
pub fn denoise_file(t1w: &Path, mask: &Path, inv2: &Path, output: &Path) -> Result<()> {
    let t1w = read_volume(t1w)?;
    let mask = read_mask(mask)?;
    let inv2 = read_volume(inv2)?;
    let denoised = remove_background(&t1w.data, &mask, &inv2.data).map_err(|msg| anyhow!(msg))?;
    write_volume(output, &denoised, &t1w.header)
}
