//! Study configuration: `code/anatprep_config.toml` and `code/mp2rage.json`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::iteration::DEFAULT_MAX_ITERATIONS;
use crate::core::sinus::SinusParams;
use crate::error::AnatprepError;

/// anatprep settings (TOML).
///
/// Every field has a default so a missing file, or a file listing only tool
/// locations, is valid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AnatprepConfig {
    pub tools: ToolsConfig,
    pub bet: BetConfig,
    pub sinus: SinusConfig,
    pub iteration: IterationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ToolsConfig {
    /// SPM12 installation (with CAT12 under `toolbox/`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spm_path: Option<PathBuf>,
    pub matlab_cmd: String,
    /// Executable fitting UNIT1 / T1map from the four MP2RAGE inversions.
    pub pymp2rage_cmd: String,
    /// Directory holding `spm_mask.sh` and `cat12_batch.sh`.
    /// Defaults to `<studydir>/code/scripts`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scripts_dir: Option<PathBuf>,
    /// `UID:GID` passed to `docker run --user`; defaults to the caller's ids.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docker_user: Option<String>,
    pub fmriprep: FmriprepConfig,
    pub freesurfer: FreesurferConfig,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            spm_path: None,
            matlab_cmd: "matlab".to_string(),
            pymp2rage_cmd: "pymp2rage-fit".to_string(),
            scripts_dir: None,
            docker_user: None,
            fmriprep: FmriprepConfig::default(),
            freesurfer: FreesurferConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FmriprepConfig {
    pub docker_image: String,
    pub n_threads: u32,
    pub mem_mb: u32,
}

impl Default for FmriprepConfig {
    fn default() -> Self {
        Self {
            docker_image: "nipreps/fmriprep:latest".to_string(),
            n_threads: 8,
            mem_mb: 32_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct FreesurferConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub license: Option<PathBuf>,
}

/// FSL BET settings for brain masks from INV2 and for the FLAIR mask.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BetConfig {
    /// Fractional intensity threshold (`-f`).
    pub frac: f64,
    /// Vertical gradient (`-g`).
    pub grad: f64,
}

impl Default for BetConfig {
    fn default() -> Self {
        Self {
            frac: 0.3,
            grad: -0.1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SinusConfig {
    #[serde(flatten)]
    pub params: SinusParams,
    /// `maskfilter dilate -npass`; 0 disables the dilated output.
    pub dilate_npass: u32,
}

impl Default for SinusConfig {
    fn default() -> Self {
        Self {
            params: SinusParams::default(),
            dilate_npass: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IterationConfig {
    pub max_iterations: u32,
}

impl Default for IterationConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }
}

impl AnatprepConfig {
    pub fn validate(&self) -> Result<()> {
        if self.tools.matlab_cmd.trim().is_empty() {
            return Err(anyhow!("tools.matlab_cmd must be non-empty"));
        }
        if self.tools.pymp2rage_cmd.trim().is_empty() {
            return Err(anyhow!("tools.pymp2rage_cmd must be non-empty"));
        }
        if self.tools.fmriprep.docker_image.trim().is_empty() {
            return Err(anyhow!("tools.fmriprep.docker_image must be non-empty"));
        }
        if self.tools.fmriprep.n_threads == 0 {
            return Err(anyhow!("tools.fmriprep.n_threads must be > 0"));
        }
        if self.tools.fmriprep.mem_mb == 0 {
            return Err(anyhow!("tools.fmriprep.mem_mb must be > 0"));
        }
        if let Some(user) = &self.tools.docker_user {
            if user.split_once(':').is_none() {
                return Err(anyhow!("tools.docker_user must look like UID:GID, got '{user}'"));
            }
        }
        if !(self.bet.frac > 0.0 && self.bet.frac <= 1.0) {
            return Err(anyhow!("bet.frac must be in (0, 1], got {}", self.bet.frac));
        }
        if !(-1.0..=1.0).contains(&self.bet.grad) {
            return Err(anyhow!("bet.grad must be in [-1, 1], got {}", self.bet.grad));
        }
        self.sinus.params.validate().map_err(|msg| anyhow!(msg))?;
        if self.iteration.max_iterations == 0 {
            return Err(anyhow!("iteration.max_iterations must be > 0"));
        }
        Ok(())
    }

    /// SPM installation, or Misconfiguration naming the missing key.
    pub fn require_spm_path(&self) -> Result<&Path> {
        self.tools.spm_path.as_deref().ok_or_else(|| {
            AnatprepError::Misconfiguration(
                "tools.spm_path not set in code/anatprep_config.toml \
                 (add `[tools]` with `spm_path = \"/path/to/spm12\"`)"
                    .to_string(),
            )
            .into()
        })
    }

    pub fn require_freesurfer_license(&self) -> Result<&Path> {
        self.tools.freesurfer.license.as_deref().ok_or_else(|| {
            AnatprepError::Misconfiguration(
                "tools.freesurfer.license not set in code/anatprep_config.toml \
                 (add `[tools.freesurfer]` with `license = \"/path/to/license.txt\"`)"
                    .to_string(),
            )
            .into()
        })
    }

    /// Where the MATLAB wrapper scripts live for `studydir`.
    pub fn scripts_dir(&self, studydir: &Path) -> PathBuf {
        self.tools
            .scripts_dir
            .clone()
            .unwrap_or_else(|| studydir.join("code").join("scripts"))
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `AnatprepConfig::default()`.
pub fn load_config(path: &Path) -> Result<AnatprepConfig> {
    if !path.exists() {
        debug!(path = %path.display(), "no config file, using defaults");
        let cfg = AnatprepConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: AnatprepConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .map_err(|err| AnatprepError::Misconfiguration(format!("{}: {err}", path.display())))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &AnatprepConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

/// Either a single value or one per inversion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum OneOrPair {
    One(f64),
    Many(Vec<f64>),
}

impl OneOrPair {
    pub fn values(&self) -> Vec<f64> {
        match self {
            OneOrPair::One(v) => vec![*v],
            OneOrPair::Many(vs) => vs.clone(),
        }
    }
}

/// MP2RAGE sequence constants shared with the DICOM conversion
/// (`code/mp2rage.json`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct Mp2rageParams {
    pub repetition_time_excitation: f64,
    pub repetition_time_preparation: f64,
    pub inversion_time: [f64; 2],
    pub number_shots: OneOrPair,
    pub flip_angle: [f64; 2],
}

/// Load `mp2rage.json`; `None` when missing or invalid (logged).
pub fn load_mp2rage_params(path: &Path) -> Option<Mp2rageParams> {
    if !path.exists() {
        return None;
    }
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) => {
            warn!(path = %path.display(), err = %err, "cannot read MP2RAGE parameters");
            return None;
        }
    };
    match serde_json::from_str(&contents) {
        Ok(params) => Some(params),
        Err(err) => {
            warn!(path = %path.display(), err = %err, "invalid MP2RAGE parameters");
            None
        }
    }
}
