//! Artifact resolution over the study tree.
//!
//! Layout (all labels without their `sub-`/`ses-` prefixes in the API):
//!
//! ```text
//! <studydir>/
//!   rawdata/sub-X/ses-Y/anat/        source volumes (read-only)
//!   rawdata/sub-X/ses-Y/fmap/        field maps (read-only)
//!   derivatives/anatprep/sub-X/ses-Y/
//!     sub-X_ses-Y[_run-N]_desc-D_SUFFIX.nii.gz
//!     logs/  iter-N/  cat12/  xfm/
//! ```
//!
//! Lookups never read or modify file contents. Directory creation is
//! idempotent and nothing here deletes or overwrites.

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::core::artifact::{
    ArtifactDescriptor, DerivedQuery, EntityName, SourceQuery, is_label, run_discovery_query,
};
use crate::error::AnatprepError;

/// File name of the persisted brainmask-loop record.
pub const ITERATION_STATE_FILE: &str = "iteration_state.json";

/// Fixed paths of a study directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StudyLayout {
    pub root: PathBuf,
    pub rawdata_dir: PathBuf,
    pub derivatives_dir: PathBuf,
    pub code_dir: PathBuf,
    pub config_path: PathBuf,
    pub mp2rage_params_path: PathBuf,
}

impl StudyLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let code_dir = root.join("code");
        Self {
            rawdata_dir: root.join("rawdata"),
            derivatives_dir: root.join("derivatives").join("anatprep"),
            config_path: code_dir.join("anatprep_config.toml"),
            mp2rage_params_path: code_dir.join("mp2rage.json"),
            code_dir,
            root,
        }
    }

    pub fn subject(&self, subject: &str) -> SubjectResolver {
        SubjectResolver::new(self, subject)
    }

    /// Subject labels found as `rawdata/sub-*` directories, sorted.
    pub fn list_subjects(&self) -> Result<Vec<String>> {
        list_prefixed_dirs(&self.rawdata_dir, "sub-")
    }
}

/// Resolver pinned to one subject.
#[derive(Debug, Clone)]
pub struct SubjectResolver {
    layout: StudyLayout,
    pub subject: String,
    pub raw_dir: PathBuf,
}

impl SubjectResolver {
    fn new(layout: &StudyLayout, subject: &str) -> Self {
        let subject = subject.trim_start_matches("sub-").to_string();
        Self {
            raw_dir: layout.rawdata_dir.join(format!("sub-{subject}")),
            layout: layout.clone(),
            subject,
        }
    }

    /// Session labels found as `ses-*` subdirectories; empty if the subject
    /// directory is absent.
    pub fn list_sessions(&self) -> Result<Vec<String>> {
        list_prefixed_dirs(&self.raw_dir, "ses-")
    }

    pub fn session(&self, session: &str) -> SessionResolver {
        SessionResolver::new(&self.layout, &self.subject, session)
    }

    /// Check that the subject (and the pinned session, if any) exist.
    pub fn validate(&self, session: Option<&str>) -> Result<()> {
        if !is_label(&self.subject) {
            return Err(AnatprepError::Misconfiguration(format!(
                "subject label '{}' must be alphanumeric",
                self.subject
            ))
            .into());
        }
        if !self.raw_dir.is_dir() {
            return Err(AnatprepError::NotFound(format!(
                "subject directory {} (has the DICOM to BIDS conversion been run for sub-{}?)",
                self.raw_dir.display(),
                self.subject
            ))
            .into());
        }
        if let Some(session) = session {
            let resolver = self.session(session);
            if !resolver.raw_dir.is_dir() {
                return Err(AnatprepError::NotFound(format!(
                    "session directory {} (available sessions: {})",
                    resolver.raw_dir.display(),
                    self.list_sessions()?.join(", ")
                ))
                .into());
            }
        }
        Ok(())
    }

    /// The pinned session, or every session of the subject.
    ///
    /// NotFound when the subject has no sessions at all.
    pub fn resolve_sessions(&self, session: Option<&str>) -> Result<Vec<SessionResolver>> {
        self.validate(session)?;
        if let Some(session) = session {
            return Ok(vec![self.session(session)]);
        }
        let sessions = self.list_sessions()?;
        if sessions.is_empty() {
            return Err(AnatprepError::NotFound(format!(
                "no sessions found for sub-{} in {}",
                self.subject,
                self.raw_dir.display()
            ))
            .into());
        }
        Ok(sessions.iter().map(|ses| self.session(ses)).collect())
    }
}

/// Source directory of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceDir {
    Anat,
    Fmap,
}

/// Resolver pinned to one subject and session.
#[derive(Debug, Clone)]
pub struct SessionResolver {
    pub subject: String,
    pub session: String,
    pub raw_dir: PathBuf,
    pub anat_dir: PathBuf,
    pub fmap_dir: PathBuf,
    pub deriv_dir: PathBuf,
    pub log_dir: PathBuf,
}

impl SessionResolver {
    fn new(layout: &StudyLayout, subject: &str, session: &str) -> Self {
        let session = session.trim_start_matches("ses-").to_string();
        let raw_dir = layout
            .rawdata_dir
            .join(format!("sub-{subject}"))
            .join(format!("ses-{session}"));
        let deriv_dir = layout
            .derivatives_dir
            .join(format!("sub-{subject}"))
            .join(format!("ses-{session}"));
        Self {
            subject: subject.to_string(),
            anat_dir: raw_dir.join("anat"),
            fmap_dir: raw_dir.join("fmap"),
            log_dir: deriv_dir.join("logs"),
            session,
            raw_dir,
            deriv_dir,
        }
    }

    /// Run indices of the session's MP2RAGE acquisitions, sorted.
    ///
    /// Taken from the `run` entity of `inv-1_part-mag_MP2RAGE` files; files
    /// without the entity count as run 1. Empty when there are none.
    pub fn list_runs(&self) -> Result<Vec<u32>> {
        let query = run_discovery_query();
        let mut runs = BTreeSet::new();
        for (path, name) in scan_nifti(&self.anat_dir)? {
            if !query.matches(&name, None) {
                continue;
            }
            match name.run() {
                Some(run) => {
                    runs.insert(run);
                }
                None => warn!(file = %path.display(), "ignoring file with non-numeric run entity"),
            }
        }
        Ok(runs.into_iter().collect())
    }

    /// Every source file in `dir` matching `query` (and `run`), sorted by name.
    pub fn find_sources(
        &self,
        dir: SourceDir,
        query: &SourceQuery,
        run: Option<u32>,
    ) -> Result<Vec<PathBuf>> {
        let root = match dir {
            SourceDir::Anat => &self.anat_dir,
            SourceDir::Fmap => &self.fmap_dir,
        };
        Ok(scan_nifti(root)?
            .into_iter()
            .filter(|(_, name)| query.matches(name, run))
            .map(|(path, _)| path)
            .collect())
    }

    /// The first sorted match for `query` in `anat/`.
    ///
    /// NotFound when nothing matches. When several files match, the first
    /// sorted one is used and a warning names the rest.
    pub fn locate_source(&self, query: &SourceQuery, run: Option<u32>) -> Result<PathBuf> {
        self.locate_source_in(SourceDir::Anat, query, run)
    }

    pub fn locate_source_in(
        &self,
        dir: SourceDir,
        query: &SourceQuery,
        run: Option<u32>,
    ) -> Result<PathBuf> {
        let matches = self.find_sources(dir, query, run)?;
        let Some(first) = matches.first() else {
            let root = match dir {
                SourceDir::Anat => &self.anat_dir,
                SourceDir::Fmap => &self.fmap_dir,
            };
            return Err(AnatprepError::NotFound(format!(
                "no source file matching {query}{} in {}",
                run.map(|r| format!(" (run-{r})")).unwrap_or_default(),
                root.display()
            ))
            .into());
        };
        if matches.len() > 1 {
            warn!(
                query = %query,
                run = ?run,
                count = matches.len(),
                chosen = %file_name(first),
                "multiple source files match; using the first sorted match"
            );
        }
        Ok(first.clone())
    }

    /// Optional source input: the first sorted match, or `None`.
    pub fn find_source(
        &self,
        dir: SourceDir,
        query: &SourceQuery,
        run: Option<u32>,
    ) -> Option<PathBuf> {
        match self.find_sources(dir, query, run) {
            Ok(matches) => matches.into_iter().next(),
            Err(err) => {
                debug!(err = %err, "source scan failed");
                None
            }
        }
    }

    /// Descriptor for a derived artifact of this session.
    pub fn descriptor(&self, desc: &str, suffix: &str, run: Option<u32>) -> ArtifactDescriptor {
        ArtifactDescriptor::new(&self.subject, &self.session, desc, suffix).with_run(run)
    }

    /// Path of the artifact `sub-X_ses-Y[_run-N]_desc-D_SUFFIX.nii.gz`,
    /// optionally under `subdir`. Parent directories are created.
    pub fn output_path(
        &self,
        desc: &str,
        suffix: &str,
        run: Option<u32>,
        subdir: Option<&str>,
    ) -> Result<PathBuf> {
        self.artifact_path(&self.descriptor(desc, suffix, run), subdir)
    }

    /// Path of an arbitrary descriptor, optionally under `subdir`.
    pub fn artifact_path(
        &self,
        descriptor: &ArtifactDescriptor,
        subdir: Option<&str>,
    ) -> Result<PathBuf> {
        descriptor
            .validate()
            .map_err(AnatprepError::Misconfiguration)?;
        let base = match subdir {
            Some(subdir) => self.deriv_dir.join(subdir),
            None => self.deriv_dir.clone(),
        };
        create_dir(&base)?;
        Ok(base.join(descriptor.file_name()))
    }

    /// First sorted derived file matching `query` (and `run`), or `None`.
    ///
    /// Never fails: an unreadable or missing directory is "not found".
    pub fn find_derived(
        &self,
        query: &DerivedQuery,
        run: Option<u32>,
        subdir: Option<&str>,
    ) -> Option<PathBuf> {
        let root = match subdir {
            Some(subdir) => self.deriv_dir.join(subdir),
            None => self.deriv_dir.clone(),
        };
        match scan_nifti(&root) {
            Ok(entries) => entries
                .into_iter()
                .find(|(_, name)| query.matches(name, run))
                .map(|(path, _)| path),
            Err(err) => {
                debug!(dir = %root.display(), err = %err, "derived scan failed");
                None
            }
        }
    }

    /// Try each query in order; the first hit wins.
    pub fn find_first_derived(&self, queries: &[DerivedQuery], run: Option<u32>) -> Option<PathBuf> {
        queries
            .iter()
            .find_map(|query| self.find_derived(query, run, None))
    }

    /// `iter-N/` snapshot directory, created on demand.
    pub fn iter_dir(&self, iteration: u32) -> Result<PathBuf> {
        let dir = self.deriv_dir.join(format!("iter-{iteration}"));
        create_dir(&dir)?;
        Ok(dir)
    }

    /// Create the session's derived and log directories.
    pub fn ensure_dirs(&self) -> Result<()> {
        create_dir(&self.deriv_dir)?;
        create_dir(&self.log_dir)
    }

    /// Log file for a step's delegated tools.
    pub fn log_path(&self, step: &str) -> PathBuf {
        self.log_dir.join(format!("{step}.log"))
    }

    pub fn state_path(&self) -> PathBuf {
        self.deriv_dir.join(ITERATION_STATE_FILE)
    }

    /// `sub-X_ses-Y`, the prefix of every derived file name.
    pub fn prefix(&self) -> String {
        format!("sub-{}_ses-{}", self.subject, self.session)
    }
}

impl fmt::Display for SessionResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{} ses-{}", self.subject, self.session)
    }
}

/// Parsed `.nii.gz` entries of `dir`, sorted by file name. Missing
/// directories are empty.
fn scan_nifti(dir: &Path) -> Result<Vec<(PathBuf, EntityName)>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("read directory {}", dir.display()))? {
        let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(EntityName::parse)
        else {
            continue;
        };
        if name.is_nifti() {
            entries.push((path, name));
        }
    }
    entries.sort_by(|a, b| a.0.file_name().cmp(&b.0.file_name()));
    Ok(entries)
}

fn list_prefixed_dirs(dir: &Path, prefix: &str) -> Result<Vec<String>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut labels = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("read directory {}", dir.display()))? {
        let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
        if !entry.path().is_dir() {
            continue;
        }
        if let Some(label) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.strip_prefix(prefix))
        {
            labels.push(label.to_string());
        }
    }
    labels.sort();
    Ok(labels)
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

pub(crate) fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::artifact::{Part, flair, inv2_combined, mp2rage_part};

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, b"").expect("touch");
    }

    fn session(root: &Path) -> SessionResolver {
        StudyLayout::new(root).subject("01").session("MR1")
    }

    #[test]
    fn layout_paths_follow_bids_tree() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ses = session(temp.path());
        assert_eq!(ses.anat_dir, temp.path().join("rawdata/sub-01/ses-MR1/anat"));
        assert_eq!(
            ses.deriv_dir,
            temp.path().join("derivatives/anatprep/sub-01/ses-MR1")
        );
        assert_eq!(ses.log_path("mask"), ses.deriv_dir.join("logs/mask.log"));
        assert_eq!(ses.prefix(), "sub-01_ses-MR1");
    }

    #[test]
    fn prefixed_labels_are_normalised() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ses = StudyLayout::new(temp.path())
            .subject("sub-01")
            .session("ses-MR1");
        assert_eq!(ses.subject, "01");
        assert_eq!(ses.session, "MR1");
    }

    #[test]
    fn sessions_are_sorted_and_empty_for_missing_subject() {
        let temp = tempfile::tempdir().expect("tempdir");
        let layout = StudyLayout::new(temp.path());
        assert!(layout.subject("01").list_sessions().expect("list").is_empty());

        for ses in ["ses-MR2", "ses-MR1"] {
            fs::create_dir_all(temp.path().join("rawdata/sub-01").join(ses)).expect("mkdir");
        }
        touch(&temp.path().join("rawdata/sub-01/ses-notadir"));
        assert_eq!(
            layout.subject("01").list_sessions().expect("list"),
            vec!["MR1".to_string(), "MR2".to_string()]
        );
        assert_eq!(layout.list_subjects().expect("subjects"), vec!["01".to_string()]);
    }

    #[test]
    fn run_discovery_covers_tagged_untagged_and_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ses = session(temp.path());
        assert!(ses.list_runs().expect("runs").is_empty());

        touch(&ses.anat_dir.join("sub-01_ses-MR1_inv-1_part-mag_MP2RAGE.nii.gz"));
        assert_eq!(ses.list_runs().expect("runs"), vec![1]);

        fs::remove_dir_all(&ses.anat_dir).expect("clean");
        for run in [2, 1] {
            touch(&ses.anat_dir.join(format!(
                "sub-01_ses-MR1_run-{run}_inv-1_part-mag_MP2RAGE.nii.gz"
            )));
            touch(&ses.anat_dir.join(format!(
                "sub-01_ses-MR1_run-{run}_inv-2_part-mag_MP2RAGE.nii.gz"
            )));
        }
        touch(&ses.anat_dir.join("sub-01_ses-MR1_run-1_inv-1_part-mag_MP2RAGE.json"));
        assert_eq!(ses.list_runs().expect("runs"), vec![1, 2]);
    }

    #[test]
    fn locate_source_filters_by_run_and_reports_missing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ses = session(temp.path());
        for run in [1, 10] {
            touch(&ses.anat_dir.join(format!(
                "sub-01_ses-MR1_run-{run}_inv-2_part-mag_MP2RAGE.nii.gz"
            )));
        }
        let found = ses
            .locate_source(&mp2rage_part(2, Part::Mag), Some(1))
            .expect("locate");
        assert_eq!(
            file_name(&found),
            "sub-01_ses-MR1_run-1_inv-2_part-mag_MP2RAGE.nii.gz"
        );

        let err = ses.locate_source(&inv2_combined(), Some(1)).unwrap_err();
        let typed = err.downcast_ref::<AnatprepError>().expect("typed");
        assert!(matches!(typed, AnatprepError::NotFound(_)));
    }

    #[test]
    fn ambiguous_source_uses_first_sorted_match() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ses = session(temp.path());
        touch(&ses.anat_dir.join("sub-01_ses-MR1_acq-tra_FLAIR.nii.gz"));
        touch(&ses.anat_dir.join("sub-01_ses-MR1_acq-cor_FLAIR.nii.gz"));
        let found = ses.locate_source(&flair(), None).expect("locate");
        assert_eq!(file_name(&found), "sub-01_ses-MR1_acq-cor_FLAIR.nii.gz");
        assert_eq!(
            ses.find_sources(SourceDir::Anat, &flair(), None)
                .expect("find")
                .len(),
            2
        );
    }

    #[test]
    fn output_path_is_deterministic_and_creates_parents() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ses = session(temp.path());
        let first = ses
            .output_path("cat12", "T1w", Some(1), Some("cat12"))
            .expect("path");
        let second = ses
            .output_path("cat12", "T1w", Some(1), Some("cat12"))
            .expect("path");
        assert_eq!(first, second);
        assert_eq!(
            first,
            ses.deriv_dir
                .join("cat12/sub-01_ses-MR1_run-1_desc-cat12_T1w.nii.gz")
        );
        assert!(first.parent().expect("parent").is_dir());
        assert!(!first.exists());
    }

    #[test]
    fn output_path_rejects_unsafe_labels() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ses = session(temp.path());
        let err = ses.output_path("sinus_auto", "mask", None, None).unwrap_err();
        assert!(err.to_string().contains("desc"));
    }

    #[test]
    fn find_derived_matches_exact_desc_and_never_fails() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ses = session(temp.path());
        assert!(ses.find_derived(&DerivedQuery::desc("denoised"), Some(1), None).is_none());

        touch(&ses.deriv_dir.join("sub-01_ses-MR1_run-1_desc-denoisedb1corr_T1w.nii.gz"));
        assert!(ses.find_derived(&DerivedQuery::desc("denoised"), Some(1), None).is_none());

        touch(&ses.deriv_dir.join("sub-01_ses-MR1_run-1_desc-denoised_T1w.nii.gz"));
        let found = ses
            .find_first_derived(
                &[DerivedQuery::desc("pymp2rage"), DerivedQuery::desc("denoised")],
                Some(1),
            )
            .expect("found");
        assert_eq!(file_name(&found), "sub-01_ses-MR1_run-1_desc-denoised_T1w.nii.gz");
        assert!(ses.find_derived(&DerivedQuery::desc("denoised"), Some(2), None).is_none());
    }

    #[test]
    fn validate_reports_missing_subject_and_session() {
        let temp = tempfile::tempdir().expect("tempdir");
        let layout = StudyLayout::new(temp.path());
        let subject = layout.subject("01");
        let err = subject.validate(None).unwrap_err();
        assert!(err.to_string().contains("DICOM to BIDS"));

        fs::create_dir_all(temp.path().join("rawdata/sub-01/ses-MR1")).expect("mkdir");
        subject.validate(Some("MR1")).expect("valid");
        let err = subject.validate(Some("MR9")).unwrap_err();
        assert!(err.to_string().contains("available sessions: MR1"));
    }

    #[test]
    fn resolve_sessions_pins_or_expands() {
        let temp = tempfile::tempdir().expect("tempdir");
        let layout = StudyLayout::new(temp.path());
        fs::create_dir_all(temp.path().join("rawdata/sub-01")).expect("mkdir");
        let err = layout.subject("01").resolve_sessions(None).unwrap_err();
        assert!(err.to_string().contains("no sessions"));

        for ses in ["ses-1", "ses-2"] {
            fs::create_dir_all(temp.path().join("rawdata/sub-01").join(ses)).expect("mkdir");
        }
        let all = layout.subject("01").resolve_sessions(None).expect("all");
        assert_eq!(all.len(), 2);
        let pinned = layout.subject("01").resolve_sessions(Some("2")).expect("one");
        assert_eq!(pinned.len(), 1);
        assert_eq!(pinned[0].session, "2");
    }

    #[test]
    fn iter_dir_and_ensure_dirs_are_idempotent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ses = session(temp.path());
        ses.ensure_dirs().expect("dirs");
        ses.ensure_dirs().expect("dirs again");
        assert!(ses.log_dir.is_dir());
        let iter = ses.iter_dir(2).expect("iter");
        assert_eq!(iter, ses.deriv_dir.join("iter-2"));
        assert_eq!(ses.iter_dir(2).expect("iter again"), iter);
    }
}
