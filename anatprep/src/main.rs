//! anatprep command line.
//!
//! Each subcommand runs one pipeline step over a subject (all sessions, or
//! the one given with `--session`). Exit codes are listed in `exit_codes`.

use std::path::{Path, PathBuf};

use anatprep::error::AnatprepError;
use anatprep::exit_codes;
use anatprep::io::config::{AnatprepConfig, write_config};
use anatprep::io::process::SystemToolRunner;
use anatprep::io::study::resolve_studydir;
use anatprep::logging;
use anatprep::steps::mask::MaskMethod;
use anatprep::steps::{
    BatchReport, SessionTarget, StepContext, brainmask_edit, cat12, denoise, fmriprep, iteration,
    mask, pymp2rage, sinus_auto, sinus_edit, status,
};
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "anatprep",
    version,
    about = "Anatomical preprocessing orchestration for 7T MP2RAGE data"
)]
struct Cli {
    /// Debug-level diagnostics (overridden by RUST_LOG).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

/// Arguments shared by every per-session step.
#[derive(Args)]
struct StepArgs {
    /// Study root; detected from the working directory when omitted.
    #[arg(short = 's', long)]
    studydir: Option<PathBuf>,

    /// Subject label without the `sub-` prefix.
    #[arg(long, visible_alias = "sub")]
    subject: String,

    /// Session label without the `ses-` prefix; all sessions when omitted.
    #[arg(long, visible_alias = "ses")]
    session: Option<String>,

    /// Re-run even when every output already exists.
    #[arg(short, long)]
    force: bool,
}

#[derive(Args)]
#[group(multiple = false)]
struct MaskChoice {
    /// FSL BET on the INV2 image (default).
    #[arg(long)]
    bet: bool,

    /// SPM segmentation through the MATLAB wrapper script.
    #[arg(long)]
    spm: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Write the default code/anatprep_config.toml.
    Init {
        /// Study root; the working directory when omitted.
        #[arg(short = 's', long)]
        studydir: Option<PathBuf>,

        /// Overwrite an existing config file.
        #[arg(short, long)]
        force: bool,
    },
    /// Brain mask from the INV2 image.
    Mask {
        #[command(flatten)]
        step: StepArgs,
        #[command(flatten)]
        method: MaskChoice,
    },
    /// Fit the MP2RAGE T1w and T1 map (with B1 correction when a DREAM map exists).
    Pymp2rage(StepArgs),
    /// Suppress background noise in the pymp2rage T1w.
    Denoise(StepArgs),
    /// CAT12 segmentation of the denoised T1w.
    Cat12(StepArgs),
    /// Automatic sinus exclusion mask.
    SinusAuto(StepArgs),
    /// Correct the sinus mask in ITK-SNAP.
    SinusEdit(StepArgs),
    /// Run fMRIPrep for the current brainmask iteration.
    Fmriprep(StepArgs),
    /// Refine the fMRIPrep brain mask in ITK-SNAP and advance the iteration.
    BrainmaskEdit(StepArgs),
    /// Accept the current brainmask iteration.
    Finalize(StepArgs),
    /// Return the brainmask loop to iteration 1.
    Reset(StepArgs),
    /// Study overview, or per-session progress with --subject.
    Status {
        #[arg(short = 's', long)]
        studydir: Option<PathBuf>,
        #[arg(long, visible_alias = "sub")]
        subject: Option<String>,
        #[arg(long, visible_alias = "ses", requires = "subject")]
        session: Option<String>,
    },
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    if let Err(err) = run(cli) {
        eprintln!("error: {:#}", err);
        std::process::exit(exit_codes::for_error(&err));
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Init { studydir, force } => cmd_init(studydir.as_deref(), force),
        Command::Mask { step, method } => {
            let method = if method.spm {
                MaskMethod::Spm
            } else {
                MaskMethod::Bet
            };
            run_step(&step, |ctx, target| mask::run_mask(ctx, target, method))
        }
        Command::Pymp2rage(step) => run_step(&step, pymp2rage::run_pymp2rage),
        Command::Denoise(step) => run_step(&step, denoise::run_denoise),
        Command::Cat12(step) => run_step(&step, cat12::run_cat12),
        Command::SinusAuto(step) => run_step(&step, sinus_auto::run_sinus_auto),
        Command::SinusEdit(step) => run_step(&step, sinus_edit::run_sinus_edit),
        Command::Fmriprep(step) => run_step(&step, fmriprep::run_fmriprep),
        Command::BrainmaskEdit(step) => run_step(&step, brainmask_edit::run_brainmask_edit),
        Command::Finalize(step) => run_step(&step, iteration::run_finalize),
        Command::Reset(step) => run_step(&step, iteration::run_reset),
        Command::Status {
            studydir,
            subject,
            session,
        } => {
            let studydir = locate_studydir(studydir.as_deref())?;
            let ctx = StepContext::load(&studydir, &SystemToolRunner, false)?;
            let report = status::render_status(
                &ctx,
                subject.as_deref(),
                session.as_deref(),
                cli.verbose,
            )?;
            print!("{report}");
            Ok(())
        }
    }
}

fn run_step<F>(args: &StepArgs, step: F) -> Result<()>
where
    F: FnOnce(&StepContext<'_>, &SessionTarget) -> Result<BatchReport>,
{
    let studydir = locate_studydir(args.studydir.as_deref())?;
    let ctx = StepContext::load(&studydir, &SystemToolRunner, args.force)?;
    let target = SessionTarget::new(&args.subject, args.session.as_deref());
    step(&ctx, &target)?;
    Ok(())
}

fn locate_studydir(explicit: Option<&Path>) -> Result<PathBuf> {
    let cwd = std::env::current_dir().context("read current directory")?;
    resolve_studydir(explicit, &cwd)
}

fn cmd_init(studydir: Option<&Path>, force: bool) -> Result<()> {
    let root = match studydir {
        Some(path) => path.to_path_buf(),
        None => std::env::current_dir().context("read current directory")?,
    };
    let config_path = root.join("code").join("anatprep_config.toml");
    if config_path.exists() && !force {
        return Err(AnatprepError::Misconfiguration(format!(
            "{} already exists (use --force to overwrite)",
            config_path.display()
        ))
        .into());
    }
    write_config(&config_path, &AnatprepConfig::default())?;
    println!("{}", config_path.display());
    Ok(())
}
