//! Study overview: structure checks, subjects and per-run progress.

use std::fmt::Write as _;

use anyhow::Result;

use crate::core::artifact::{DerivedQuery, unit1};
use crate::io::config::load_mp2rage_params;
use crate::io::resolver::{SessionResolver, SourceDir};
use crate::io::tracker::IterationTracker;
use crate::steps::StepContext;
use crate::steps::cat12::{cat12_dir, segmentation_outputs};

/// Per-run rows: label, `desc`, suffix.
const RUN_STEPS: [(&str, &str, &str); 8] = [
    ("BET mask", "bet", "mask"),
    ("SPM mask", "spmmask", "mask"),
    ("pymp2rage", "pymp2rage", "T1w"),
    ("pymp2rage B1", "pymp2rageb1corr", "T1w"),
    ("Denoised", "denoised", "T1w"),
    ("Denoised B1", "denoisedb1corr", "T1w"),
    ("Sinus auto", "sinusauto", "mask"),
    ("Sinus final", "sinusfinal", "mask"),
];

/// Render the status report. With a subject, shows per-session progress
/// (NotFound when the subject or session is absent); otherwise lists
/// subjects.
pub fn render_status(
    ctx: &StepContext<'_>,
    subject: Option<&str>,
    session: Option<&str>,
    verbose: bool,
) -> Result<String> {
    let layout = &ctx.layout;
    let mut out = String::new();
    writeln!(out, "anatprep status")?;
    writeln!(out, "{}", "=".repeat(70))?;
    writeln!(out, "Study directory : {}", layout.root.display())?;
    writeln!(out)?;

    let checks = [
        ("code/anatprep_config.toml", layout.config_path.exists()),
        (
            "code/mp2rage.json",
            load_mp2rage_params(&layout.mp2rage_params_path).is_some(),
        ),
        ("rawdata/", layout.rawdata_dir.is_dir()),
        ("derivatives/anatprep/", layout.derivatives_dir.is_dir()),
    ];
    writeln!(out, "Study structure:")?;
    for (name, ok) in checks {
        let mark = if ok { "OK" } else { "MISSING" };
        writeln!(out, "  [{mark:>7}]  {name}")?;
    }
    writeln!(out)?;

    if verbose {
        writeln!(out, "Configuration:")?;
        for line in toml::to_string_pretty(&ctx.config)?.lines() {
            writeln!(out, "  {line}")?;
        }
        writeln!(out)?;
    }

    if !layout.rawdata_dir.is_dir() {
        writeln!(out, "No rawdata/ directory found. Run the DICOM to BIDS conversion first.")?;
        return Ok(out);
    }

    let Some(subject) = subject else {
        let subjects = layout.list_subjects()?;
        writeln!(out, "Subjects found: {}", subjects.len())?;
        for sub in subjects {
            let sessions = layout.subject(&sub).list_sessions()?;
            writeln!(out, "  sub-{sub}  sessions: {}", sessions.join(", "))?;
        }
        return Ok(out);
    };

    for resolver in layout.subject(subject).resolve_sessions(session)? {
        writeln!(out, "--- sub-{} ses-{} ---", resolver.subject, resolver.session)?;
        session_status(ctx, &resolver, &mut out)?;
        writeln!(out)?;
    }
    Ok(out)
}

fn session_status(
    ctx: &StepContext<'_>,
    session: &SessionResolver,
    out: &mut String,
) -> Result<()> {
    let runs = session.list_runs()?;
    if runs.is_empty() {
        writeln!(out, "  MP2RAGE runs: none found")?;
    } else {
        let labels: Vec<String> = runs.iter().map(u32::to_string).collect();
        writeln!(out, "  MP2RAGE runs: {}", labels.join(", "))?;
    }
    if session.find_source(SourceDir::Anat, &unit1(), None).is_some() {
        writeln!(out, "  Scanner UNIT1: present")?;
    }

    for &run in &runs {
        writeln!(out, "  Run {run}:")?;
        for (label, desc, suffix) in RUN_STEPS {
            let done = session
                .find_derived(&DerivedQuery::desc_suffix(desc, suffix), Some(run), None)
                .is_some();
            writeln!(out, "    [{:>4}]  {label}", if done { "done" } else { "" })?;
        }
        let cat12_done = !segmentation_outputs(&cat12_dir(session, run))?.is_empty();
        writeln!(out, "    [{:>4}]  CAT12", if cat12_done { "done" } else { "" })?;
    }

    if session.state_path().exists() {
        let state = IterationTracker::peek(&session.deriv_dir, ctx.config.iteration.max_iterations)?;
        writeln!(out, "  Brainmask loop: {}", state.summary())?;
        if let Some(last) = state.history.last() {
            writeln!(out, "    last: {} {} ({})", last.timestamp, last.status, last.note)?;
        }
    } else {
        writeln!(out, "  Brainmask loop: not started")?;
    }
    Ok(())
}
