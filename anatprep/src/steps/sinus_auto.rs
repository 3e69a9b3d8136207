//! Automatic sinus exclusion mask.
//!
//! Picks the best available T1w, brings a FLAIR into its space when one
//! exists, runs the deriver in [`crate::core::sinus`] and optionally dilates
//! the result with MRtrix `maskfilter`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};
use tracing::{info, warn};

use crate::core::artifact::{ArtifactDescriptor, EntityName, flair};
use crate::core::sinus::{SinusInputs, SinusOutcome, derive_sinus_mask};
use crate::error::AnatprepError;
use crate::io::nifti_io::{read_mask, read_volume, write_mask};
use crate::io::process::{ToolInvocation, require_tools, run_checked};
use crate::io::resolver::{SessionResolver, SourceDir, file_name};
use crate::steps::{
    BatchReport, SessionTarget, StepContext, UnitOutcome, brain_mask_queries, ensure_produced,
    for_each_run, reference_t1w_queries,
};

pub const DESC: &str = "sinusauto";
pub const DESC_DILATED: &str = "sinusautodil";
/// Subdirectory holding registered images and their matrices.
const XFM_DIR: &str = "xfm";

pub fn run_sinus_auto(ctx: &StepContext<'_>, target: &SessionTarget) -> Result<BatchReport> {
    if ctx.config.sinus.dilate_npass > 0 {
        require_tools(ctx.tools, &[("maskfilter", "MRtrix3")])?;
    }
    for_each_run(ctx, target, "sinus-auto", |session, run| {
        sinus_run(ctx, session, run)
    })
}

fn sinus_run(ctx: &StepContext<'_>, session: &SessionResolver, run: u32) -> Result<UnitOutcome> {
    let output = session.output_path(DESC, "mask", Some(run), None)?;
    let dilated = session.output_path(DESC_DILATED, "mask", Some(run), None)?;
    let dilate = ctx.config.sinus.dilate_npass > 0;
    let mut targets = vec![output.clone()];
    if dilate {
        targets.push(dilated.clone());
    }
    if !ctx.should_run(&targets) {
        return Ok(UnitOutcome::Skipped);
    }

    let reference_path = session
        .find_first_derived(&reference_t1w_queries(), Some(run))
        .ok_or_else(|| {
            AnatprepError::NotFound(format!(
                "T1w for {session} run-{run} (run `anatprep pymp2rage` or `anatprep denoise` first)"
            ))
        })?;
    let mask_path = session.find_first_derived(&brain_mask_queries(), Some(run));
    if mask_path.is_none() {
        warn!(run, "no brain mask found; statistics use the whole ROI");
    }
    let registered = match session.find_sources(SourceDir::Anat, &flair(), None)?.first() {
        Some(flair_path) => Some(register_flair(
            ctx,
            session,
            run,
            flair_path,
            &reference_path,
        )?),
        None => {
            info!(run, "no FLAIR found; deriving from the T1w alone");
            None
        }
    };

    info!(
        run,
        reference = %file_name(&reference_path),
        brain_mask = ?mask_path.as_deref().map(file_name),
        secondary = ?registered.as_deref().map(file_name),
        "deriving sinus mask"
    );
    let reference = read_volume(&reference_path)?;
    let secondary = registered.as_deref().map(read_volume).transpose()?;
    let brain_mask = mask_path.as_deref().map(read_mask).transpose()?;
    let inputs = SinusInputs {
        reference: &reference.data,
        secondary: secondary.as_ref().map(|v| &v.data),
        brain_mask: brain_mask.as_ref(),
    };
    let (mask, report) = match derive_sinus_mask(inputs, &ctx.config.sinus.params)
        .map_err(|msg| anyhow!(msg))?
    {
        SinusOutcome::Mask { mask, report } => (mask, report),
        SinusOutcome::Aborted(reason) => {
            return Ok(UnitOutcome::Aborted(reason.describe().to_string()));
        }
    };
    info!(
        run,
        roi = report.roi_voxels,
        stats = report.stats_voxels,
        mean = report.mean,
        std = report.std,
        k = report.threshold_sd,
        threshold = report.threshold,
        candidates = report.candidates,
        secondary_cutoff = ?report.secondary_cutoff,
        after_secondary = report.after_secondary,
        after_brain_mask = report.after_brain_mask,
        component_filtered = report.component_filtered,
        voxels = report.final_voxels,
        "sinus mask derived"
    );
    if report.final_voxels == 0 {
        warn!(run, "sinus mask is empty; edit it manually with `anatprep sinus-edit`");
    }
    write_mask(&output, &mask, &reference.header)?;
    info!(output = %file_name(&output), "wrote");

    if dilate {
        let invocation = ToolInvocation::new("maskfilter")
            .path_arg(&output)
            .arg("dilate")
            .path_arg(&dilated)
            .arg("-npass")
            .arg(ctx.config.sinus.dilate_npass.to_string())
            .arg("-force")
            .log_to(&session.log_path("sinus_auto"));
        run_checked(ctx.tools, &invocation)?;
        ensure_produced(&dilated, "maskfilter")?;
    }
    Ok(UnitOutcome::Produced)
}

/// FLIRT the FLAIR onto `reference` (rigid, mutual information).
///
/// Image and matrix live under `xfm/`, named by run and by the reference's
/// `desc`, so every run and every reference gets its own registration. An
/// existing result is reused unless forced or older than the reference.
fn register_flair(
    ctx: &StepContext<'_>,
    session: &SessionResolver,
    run: u32,
    flair_path: &Path,
    reference: &Path,
) -> Result<PathBuf> {
    let descriptor = registration_descriptor(session, run, reference)?;
    let registered = session.artifact_path(&descriptor, Some(XFM_DIR))?;
    if !ctx.force && is_current(&registered, reference) {
        info!(run, file = %file_name(&registered), "using existing registered FLAIR");
        return Ok(registered);
    }
    if !ctx.tools.is_available("flirt") {
        return Err(AnatprepError::Misconfiguration(
            "not found in PATH: 'flirt' (FSL), needed to register the FLAIR".to_string(),
        )
        .into());
    }
    let matrix = session.artifact_path(&descriptor.with_extension(".mat"), Some(XFM_DIR))?;

    info!(
        run,
        flair = %file_name(flair_path),
        reference = %file_name(reference),
        "registering FLAIR to T1w"
    );
    let invocation = ToolInvocation::new("flirt")
        .arg("-in")
        .path_arg(flair_path)
        .arg("-ref")
        .path_arg(reference)
        .arg("-out")
        .path_arg(&registered)
        .arg("-omat")
        .path_arg(&matrix)
        .args(["-dof", "6", "-cost", "mutualinfo"])
        .args(["-searchrx", "-90", "90"])
        .args(["-searchry", "-90", "90"])
        .args(["-searchrz", "-90", "90"])
        .args(["-interp", "trilinear"])
        .log_to(&session.log_path("sinus_auto"));
    run_checked(ctx.tools, &invocation)?;
    ensure_produced(&registered, "flirt")?;
    Ok(registered)
}

/// `sub-X_ses-Y_run-N_desc-reg<refdesc>_FLAIR`: the FLAIR in the space of
/// run N's reference T1w.
pub fn registration_descriptor(
    session: &SessionResolver,
    run: u32,
    reference: &Path,
) -> Result<ArtifactDescriptor> {
    let file = file_name(reference);
    let reference_desc = EntityName::parse(&file)
        .and_then(|parsed| parsed.entity("desc").map(str::to_string))
        .ok_or_else(|| anyhow!("reference T1w {file} has no desc entity"))?;
    Ok(session.descriptor(&format!("reg{reference_desc}"), "FLAIR", Some(run)))
}

/// Whether `output` exists and is not older than `input`.
fn is_current(output: &Path, input: &Path) -> bool {
    let modified = |path: &Path| fs::metadata(path).and_then(|meta| meta.modified()).ok();
    match (modified(output), modified(input)) {
        (Some(out), Some(inp)) => out >= inp,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use ndarray::Array3;

    use super::*;
    use crate::core::artifact::DerivedQuery;
    use crate::io::nifti_io::count_mask_voxels;
    use crate::test_support::{
        ScriptedTool, ScriptedToolRunner, TEST_SHAPE, TestStudy, arg_after, filled,
        write_test_volume,
    };

    /// Flat background with a bright 2×8×2 bar at the top of the midline.
    fn reference() -> Array3<f32> {
        Array3::from_shape_fn(TEST_SHAPE, |(x, _, z)| {
            if (3..5).contains(&x) && z >= 6 { 200.0 } else { 10.0 }
        })
    }

    fn dilating_runner() -> ScriptedToolRunner {
        ScriptedToolRunner::new().on(
            "maskfilter",
            ScriptedTool::succeed().with_effect(|inv| {
                fs::copy(&inv.args[0], &inv.args[2])?;
                Ok(())
            }),
        )
    }

    fn study_with_t1w(data: &Array3<f32>) -> (TestStudy, SessionResolver) {
        let study = TestStudy::new().expect("study");
        study.add_mp2rage_run("01", "01", None).expect("run");
        let session = study.session("01", "01");
        let t1w = session
            .output_path("denoised", "T1w", Some(1), None)
            .expect("path");
        write_test_volume(&t1w, data).expect("t1w");
        (study, session)
    }

    #[test]
    fn derives_and_dilates_from_t1w_alone() {
        let (study, session) = study_with_t1w(&reference());
        let tools = dilating_runner();
        let ctx = StepContext::load(study.root(), &tools, false).expect("ctx");

        let report = run_sinus_auto(&ctx, &SessionTarget::new("01", None)).expect("sinus");
        assert_eq!(report.produced.len(), 1);
        let auto = session
            .find_derived(&DerivedQuery::desc_suffix(DESC, "mask"), Some(1), None)
            .expect("auto mask");
        assert_eq!(count_mask_voxels(&auto).expect("count"), 32);
        let dilated = session
            .find_derived(&DerivedQuery::desc_suffix(DESC_DILATED, "mask"), Some(1), None)
            .expect("dilated mask");
        assert_eq!(arg_after(&tools.calls_to("maskfilter")[0], "-npass"), Some("1"));
        assert!(dilated.exists());

        let again = run_sinus_auto(&ctx, &SessionTarget::new("01", None)).expect("sinus");
        assert_eq!(again.skipped.len(), 1);
    }

    #[test]
    fn all_zero_reference_aborts_without_output() {
        let (study, session) = study_with_t1w(&Array3::zeros(TEST_SHAPE));
        let tools = dilating_runner();
        let ctx = StepContext::load(study.root(), &tools, false).expect("ctx");

        let report = run_sinus_auto(&ctx, &SessionTarget::new("01", None)).expect("no error");
        assert_eq!(report.aborted.len(), 1);
        assert!(
            session
                .find_derived(&DerivedQuery::desc(DESC), Some(1), None)
                .is_none()
        );
        assert!(tools.calls().is_empty());
    }

    fn flirt_runner() -> ScriptedToolRunner {
        dilating_runner().on(
            "flirt",
            ScriptedTool::succeed().with_effect(|inv| {
                let out = Path::new(arg_after(inv, "-out").expect("-out"));
                write_test_volume(out, &filled(5.0))?;
                fs::write(arg_after(inv, "-omat").expect("-omat"), "1 0 0 0\n")?;
                Ok(())
            }),
        )
    }

    #[test]
    fn flair_is_registered_and_used() {
        let (study, session) = study_with_t1w(&reference());
        study
            .write_raw("01", "01", "anat", "sub-01_ses-01_FLAIR.nii.gz", &filled(5.0))
            .expect("flair");
        let tools = flirt_runner();
        let ctx = StepContext::load(study.root(), &tools, false).expect("ctx");

        run_sinus_auto(&ctx, &SessionTarget::new("01", None)).expect("sinus");
        let flirt = &tools.calls_to("flirt")[0];
        assert_eq!(arg_after(flirt, "-dof"), Some("6"));
        assert_eq!(arg_after(flirt, "-cost"), Some("mutualinfo"));
        let xfm = session.deriv_dir.join("xfm");
        assert!(xfm.join("sub-01_ses-01_run-1_desc-regdenoised_FLAIR.nii.gz").exists());
        assert!(xfm.join("sub-01_ses-01_run-1_desc-regdenoised_FLAIR.mat").exists());
    }

    #[test]
    fn each_run_registers_flair_to_its_own_reference() {
        let study = TestStudy::new().expect("study");
        study.add_mp2rage_run("01", "01", Some(1)).expect("run 1");
        study.add_mp2rage_run("01", "01", Some(2)).expect("run 2");
        let session = study.session("01", "01");
        for run in [1, 2] {
            let t1w = session
                .output_path("denoised", "T1w", Some(run), None)
                .expect("path");
            write_test_volume(&t1w, &reference()).expect("t1w");
        }
        study
            .write_raw("01", "01", "anat", "sub-01_ses-01_FLAIR.nii.gz", &filled(5.0))
            .expect("flair");
        let tools = flirt_runner();
        let ctx = StepContext::load(study.root(), &tools, false).expect("ctx");

        run_sinus_auto(&ctx, &SessionTarget::new("01", None)).expect("sinus");
        let calls = tools.calls_to("flirt");
        assert_eq!(calls.len(), 2);
        let refs: Vec<&str> = calls
            .iter()
            .map(|call| arg_after(call, "-ref").expect("-ref"))
            .collect();
        assert!(refs[0].ends_with("sub-01_ses-01_run-1_desc-denoised_T1w.nii.gz"));
        assert!(refs[1].ends_with("sub-01_ses-01_run-2_desc-denoised_T1w.nii.gz"));
        let outs: Vec<&str> = calls
            .iter()
            .map(|call| arg_after(call, "-out").expect("-out"))
            .collect();
        assert_ne!(outs[0], outs[1]);
    }

    #[test]
    fn new_reference_triggers_new_registration() {
        let (study, session) = study_with_t1w(&reference());
        study
            .write_raw("01", "01", "anat", "sub-01_ses-01_FLAIR.nii.gz", &filled(5.0))
            .expect("flair");
        let tools = flirt_runner();
        let ctx = StepContext::load(study.root(), &tools, false).expect("ctx");
        run_sinus_auto(&ctx, &SessionTarget::new("01", None)).expect("first");

        let b1corr = session
            .output_path("denoisedb1corr", "T1w", Some(1), None)
            .expect("path");
        write_test_volume(&b1corr, &reference()).expect("b1corr");
        for desc in [DESC, DESC_DILATED] {
            let path = session.output_path(desc, "mask", Some(1), None).expect("path");
            fs::remove_file(path).expect("remove");
        }
        run_sinus_auto(&ctx, &SessionTarget::new("01", None)).expect("second");

        let calls = tools.calls_to("flirt");
        assert_eq!(calls.len(), 2);
        assert!(
            arg_after(&calls[1], "-ref")
                .expect("-ref")
                .ends_with("desc-denoisedb1corr_T1w.nii.gz")
        );
    }

    #[test]
    fn current_registration_is_reused() {
        let (study, session) = study_with_t1w(&reference());
        study
            .write_raw("01", "01", "anat", "sub-01_ses-01_FLAIR.nii.gz", &filled(5.0))
            .expect("flair");
        let tools = flirt_runner();
        let ctx = StepContext::load(study.root(), &tools, false).expect("ctx");
        run_sinus_auto(&ctx, &SessionTarget::new("01", None)).expect("first");

        for desc in [DESC, DESC_DILATED] {
            let path = session.output_path(desc, "mask", Some(1), None).expect("path");
            fs::remove_file(path).expect("remove");
        }
        run_sinus_auto(&ctx, &SessionTarget::new("01", None)).expect("second");
        assert_eq!(tools.calls_to("flirt").len(), 1);
    }

    #[test]
    fn flair_without_flirt_fails_the_run() {
        let (study, session) = study_with_t1w(&reference());
        study
            .write_raw("01", "01", "anat", "sub-01_ses-01_FLAIR.nii.gz", &filled(5.0))
            .expect("flair");
        let tools = dilating_runner().without("flirt");
        let ctx = StepContext::load(study.root(), &tools, false).expect("ctx");

        let err = run_sinus_auto(&ctx, &SessionTarget::new("01", None)).expect_err("no flirt");
        assert!(matches!(
            err.downcast_ref::<AnatprepError>(),
            Some(AnatprepError::Misconfiguration(_))
        ));
    }

    #[test]
    fn registration_is_named_by_run_and_reference() {
        let study = TestStudy::new().expect("study");
        let session = study.session("01", "02");
        let descriptor = registration_descriptor(
            &session,
            3,
            Path::new("/x/sub-01_ses-02_run-3_desc-pymp2rageb1corr_T1w.nii.gz"),
        )
        .expect("descriptor");
        assert_eq!(
            descriptor.file_name(),
            "sub-01_ses-02_run-3_desc-regpymp2rageb1corr_FLAIR.nii.gz"
        );
    }
}
