//! Pipeline steps.
//!
//! Every step follows the same shape: check configuration and required
//! tools up front, resolve the target sessions, then work through each
//! session (and each MP2RAGE run where the step is per-run). Existing
//! outputs are kept unless `force` is set. A failure on one unit is logged
//! and recorded; the remaining units still run.

pub mod brainmask_edit;
pub mod cat12;
pub mod denoise;
pub mod fmriprep;
pub mod iteration;
pub mod mask;
pub mod pymp2rage;
pub mod sinus_auto;
pub mod sinus_edit;
pub mod status;

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};
use tracing::{debug, error, info, warn};

use crate::core::artifact::{DerivedQuery, Part, inv2_combined, mp2rage_part};
use crate::io::config::{AnatprepConfig, load_config};
use crate::io::process::ToolRunner;
use crate::io::resolver::{SessionResolver, StudyLayout, file_name};

/// Everything a step needs besides its target.
pub struct StepContext<'a> {
    pub layout: StudyLayout,
    pub config: AnatprepConfig,
    pub tools: &'a dyn ToolRunner,
    /// Recompute outputs that already exist.
    pub force: bool,
}

impl<'a> StepContext<'a> {
    /// Load `code/anatprep_config.toml` of `studydir`.
    pub fn load(studydir: &Path, tools: &'a dyn ToolRunner, force: bool) -> Result<Self> {
        let layout = StudyLayout::new(studydir);
        let config = load_config(&layout.config_path)?;
        Ok(Self {
            layout,
            config,
            tools,
            force,
        })
    }

    /// Sessions named by `target`, validated against the source tree.
    pub fn sessions(&self, target: &SessionTarget) -> Result<Vec<SessionResolver>> {
        self.layout
            .subject(&target.subject)
            .resolve_sessions(target.session.as_deref())
    }

    /// Whether `outputs` need (re)computing; logs the reason when not.
    pub fn should_run(&self, outputs: &[PathBuf]) -> bool {
        let existing: Vec<String> = outputs
            .iter()
            .filter(|path| path.exists())
            .map(|path| file_name(path))
            .collect();
        if existing.is_empty() {
            return true;
        }
        if self.force {
            info!(files = ?existing, "outputs exist, recomputing (--force)");
            return true;
        }
        if existing.len() == outputs.len() {
            info!(files = ?existing, "outputs exist, skipping (use --force to recompute)");
            return false;
        }
        debug!(files = ?existing, "some outputs exist, recomputing the rest");
        true
    }
}

/// Subject and optional pinned session from the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTarget {
    pub subject: String,
    pub session: Option<String>,
}

impl SessionTarget {
    pub fn new(subject: &str, session: Option<&str>) -> Self {
        Self {
            subject: subject.to_string(),
            session: session.map(str::to_string),
        }
    }
}

/// How one session or run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitOutcome {
    Produced,
    /// Outputs already present.
    Skipped,
    /// Nothing written (e.g. an empty statistics region).
    Aborted(String),
}

/// Per-unit results of one step invocation.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub step: String,
    pub produced: Vec<String>,
    pub skipped: Vec<String>,
    pub aborted: Vec<String>,
    pub failed: Vec<(String, anyhow::Error)>,
}

impl BatchReport {
    pub fn new(step: &str) -> Self {
        Self {
            step: step.to_string(),
            ..Self::default()
        }
    }

    pub fn record(&mut self, unit: impl fmt::Display, result: Result<UnitOutcome>) {
        let unit = unit.to_string();
        match result {
            Ok(UnitOutcome::Produced) => self.produced.push(unit),
            Ok(UnitOutcome::Skipped) => self.skipped.push(unit),
            Ok(UnitOutcome::Aborted(reason)) => {
                warn!(step = %self.step, unit = %unit, reason = %reason, "aborted without output");
                self.aborted.push(unit);
            }
            Err(err) => {
                error!(step = %self.step, unit = %unit, err = %format!("{err:#}"), "failed");
                self.failed.push((unit, err));
            }
        }
    }

    pub fn total(&self) -> usize {
        self.produced.len() + self.skipped.len() + self.aborted.len() + self.failed.len()
    }

    /// `Ok(self)` when nothing failed.
    ///
    /// A single failure is returned as-is (with the unit as context) so its
    /// error kind survives; several are summarised.
    pub fn finish(mut self) -> Result<Self> {
        info!(
            step = %self.step,
            produced = self.produced.len(),
            skipped = self.skipped.len(),
            aborted = self.aborted.len(),
            failed = self.failed.len(),
            "step finished"
        );
        match self.failed.len() {
            0 => Ok(self),
            1 => {
                let (unit, err) = self.failed.remove(0);
                Err(err.context(format!("{} failed for {unit}", self.step)))
            }
            n => {
                let units: Vec<&str> = self.failed.iter().map(|(unit, _)| unit.as_str()).collect();
                Err(anyhow!(
                    "{} failed for {n} of {} units: {}",
                    self.step,
                    self.total(),
                    units.join(", ")
                ))
            }
        }
    }
}

/// Run `unit` once per resolved session.
pub fn for_each_session(
    ctx: &StepContext<'_>,
    target: &SessionTarget,
    step: &str,
    mut unit: impl FnMut(&SessionResolver) -> Result<UnitOutcome>,
) -> Result<BatchReport> {
    let mut report = BatchReport::new(step);
    for session in ctx.sessions(target)? {
        info!(step, session = %session, "processing session");
        let result = session.ensure_dirs().and_then(|()| unit(&session));
        report.record(&session, result);
    }
    report.finish()
}

/// Run `unit` once per MP2RAGE run of every resolved session.
pub fn for_each_run(
    ctx: &StepContext<'_>,
    target: &SessionTarget,
    step: &str,
    mut unit: impl FnMut(&SessionResolver, u32) -> Result<UnitOutcome>,
) -> Result<BatchReport> {
    let mut report = BatchReport::new(step);
    for session in ctx.sessions(target)? {
        let runs = match session.ensure_dirs().and_then(|()| session.list_runs()) {
            Ok(runs) => runs,
            Err(err) => {
                report.record(&session, Err(err));
                continue;
            }
        };
        if runs.is_empty() {
            warn!(step, session = %session, "no MP2RAGE runs found");
            continue;
        }
        info!(step, session = %session, runs = ?runs, "processing session");
        for run in runs {
            let result = unit(&session, run);
            report.record(format!("{session} run-{run}"), result);
        }
    }
    report.finish()
}

/// Fail when a tool reported success but its output is missing.
pub(crate) fn ensure_produced(path: &Path, tool: &str) -> Result<()> {
    if path.exists() {
        info!(output = %file_name(path), "wrote");
        return Ok(());
    }
    Err(anyhow!(
        "{tool} finished but did not produce {}",
        path.display()
    ))
}

/// Combined INV2, falling back to the INV2 magnitude.
pub(crate) fn locate_inv2(session: &SessionResolver, run: u32) -> Result<PathBuf> {
    match session.locate_source(&inv2_combined(), Some(run)) {
        Ok(path) => Ok(path),
        Err(err) => {
            let fallback = session.locate_source(&mp2rage_part(2, Part::Mag), Some(run));
            match fallback {
                Ok(path) => {
                    warn!(run, file = %file_name(&path), "no combined INV2, using the INV2 magnitude");
                    Ok(path)
                }
                Err(_) => Err(err),
            }
        }
    }
}

/// Background T1w for viewers and the sinus deriver, by preference.
pub(crate) fn reference_t1w_queries() -> [DerivedQuery; 4] {
    [
        DerivedQuery::desc_suffix("denoisedb1corr", "T1w"),
        DerivedQuery::desc_suffix("pymp2rageb1corr", "T1w"),
        DerivedQuery::desc_suffix("denoised", "T1w"),
        DerivedQuery::desc_suffix("pymp2rage", "T1w"),
    ]
}

/// Brain masks produced by the `mask` step, by preference.
pub(crate) fn brain_mask_queries() -> [DerivedQuery; 2] {
    [
        DerivedQuery::desc_suffix("bet", "mask"),
        DerivedQuery::desc_suffix("spmmask", "mask"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AnatprepError;
    use crate::test_support::{ScriptedToolRunner, TestStudy};

    #[test]
    fn should_run_skips_only_when_every_output_exists() {
        let study = TestStudy::new().expect("study");
        let tools = ScriptedToolRunner::new();
        let mut ctx = StepContext::load(study.root(), &tools, false).expect("ctx");
        let a = study.root().join("a.nii.gz");
        let b = study.root().join("b.nii.gz");
        assert!(ctx.should_run(&[a.clone(), b.clone()]));

        std::fs::write(&a, b"").expect("write a");
        assert!(ctx.should_run(&[a.clone(), b.clone()]));

        std::fs::write(&b, b"").expect("write b");
        assert!(!ctx.should_run(&[a.clone(), b.clone()]));

        ctx.force = true;
        assert!(ctx.should_run(&[a, b]));
    }

    #[test]
    fn single_failure_keeps_its_error_kind() {
        let mut report = BatchReport::new("mask");
        report.record("sub-01 ses-01 run-1", Ok(UnitOutcome::Produced));
        report.record(
            "sub-01 ses-01 run-2",
            Err(AnatprepError::NotFound("inv2".to_string()).into()),
        );
        let err = report.finish().expect_err("one failure");
        assert!(matches!(
            err.downcast_ref::<AnatprepError>(),
            Some(AnatprepError::NotFound(_))
        ));
        assert!(format!("{err:#}").contains("run-2"));
    }

    #[test]
    fn several_failures_are_summarised() {
        let mut report = BatchReport::new("denoise");
        report.record("a", Err(anyhow!("one")));
        report.record("b", Err(anyhow!("two")));
        report.record("c", Ok(UnitOutcome::Skipped));
        let err = report.finish().expect_err("failures");
        assert_eq!(err.to_string(), "denoise failed for 2 of 3 units: a, b");
    }

    #[test]
    fn for_each_run_continues_past_failing_runs() {
        let study = TestStudy::new().expect("study");
        for run in [1, 2, 3] {
            study
                .touch_anat(
                    "01",
                    "01",
                    &format!("sub-01_ses-01_run-{run}_inv-1_part-mag_MP2RAGE.nii.gz"),
                )
                .expect("touch");
        }
        let tools = ScriptedToolRunner::new();
        let ctx = StepContext::load(study.root(), &tools, false).expect("ctx");
        let mut seen = Vec::new();
        let err = for_each_run(&ctx, &SessionTarget::new("01", None), "test", |_, run| {
            seen.push(run);
            if run == 2 {
                return Err(anyhow!("boom"));
            }
            Ok(UnitOutcome::Produced)
        })
        .expect_err("run-2 fails");
        assert_eq!(seen, vec![1, 2, 3]);
        assert!(format!("{err:#}").contains("boom"));
    }

    #[test]
    fn locate_inv2_falls_back_to_magnitude() {
        let study = TestStudy::new().expect("study");
        let mag = study
            .touch_anat("01", "01", "sub-01_ses-01_inv-2_part-mag_MP2RAGE.nii.gz")
            .expect("touch");
        let session = study.session("01", "01");
        assert_eq!(locate_inv2(&session, 1).expect("inv2"), mag);

        let combined = study
            .touch_anat("01", "01", "sub-01_ses-01_inv-2_MP2RAGE.nii.gz")
            .expect("touch");
        assert_eq!(locate_inv2(&session, 1).expect("inv2"), combined);
    }
}
