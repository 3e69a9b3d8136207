//! Typed artifact names for the source and derived trees.
//!
//! File identity is carried by BIDS-style `key-value` entities, a suffix and
//! an extension (`sub-01_ses-MR1_run-1_inv-2_part-mag_MP2RAGE.nii.gz`).
//! Lookups parse names and compare entities instead of matching substrings,
//! so `run-1` never matches `run-10` and `desc-denoised` never matches
//! `desc-denoisedb1corr`.

use std::fmt;

/// Extension of every volume the pipeline reads or writes.
pub const NIFTI_EXT: &str = ".nii.gz";

/// Run index assumed for files that carry no `run` entity.
pub const IMPLICIT_RUN: u32 = 1;

/// A parsed file name: ordered entities, a suffix and the full extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityName {
    pub entities: Vec<(String, String)>,
    pub suffix: String,
    pub extension: String,
}

impl EntityName {
    /// Parse `key-value_..._suffix.ext`.
    ///
    /// Returns `None` for names that do not follow the grammar (hidden files,
    /// tokens without a `-`, empty keys or values, a missing suffix).
    pub fn parse(file_name: &str) -> Option<Self> {
        if file_name.starts_with('.') {
            return None;
        }
        let (stem, extension) = match file_name.find('.') {
            Some(dot) => (&file_name[..dot], &file_name[dot..]),
            None => (file_name, ""),
        };
        let mut tokens: Vec<&str> = stem.split('_').collect();
        let suffix = tokens.pop()?;
        if suffix.is_empty() || suffix.contains('-') {
            return None;
        }
        let mut entities = Vec::with_capacity(tokens.len());
        for token in tokens {
            let (key, value) = token.split_once('-')?;
            if key.is_empty() || value.is_empty() {
                return None;
            }
            entities.push((key.to_string(), value.to_string()));
        }
        Some(Self {
            entities,
            suffix: suffix.to_string(),
            extension: extension.to_string(),
        })
    }

    /// Value of the first entity named `key`.
    pub fn entity(&self, key: &str) -> Option<&str> {
        self.entities
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Run index: the parsed `run` entity, or [`IMPLICIT_RUN`] when absent.
    ///
    /// `None` when the entity is present but not an integer.
    pub fn run(&self) -> Option<u32> {
        match self.entity("run") {
            Some(value) => value.parse().ok(),
            None => Some(IMPLICIT_RUN),
        }
    }

    pub fn is_nifti(&self) -> bool {
        self.extension == NIFTI_EXT
    }
}

/// Identity of one derived file.
///
/// The path of an artifact is a pure function of its descriptor; see
/// [`ArtifactDescriptor::file_name`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactDescriptor {
    /// Subject label without the `sub-` prefix.
    pub subject: String,
    /// Session label without the `ses-` prefix.
    pub session: String,
    pub run: Option<u32>,
    /// Stage tag of the producing step, rendered as the `desc` entity.
    pub desc: String,
    pub suffix: String,
    pub extension: String,
}

impl ArtifactDescriptor {
    pub fn new(subject: &str, session: &str, desc: &str, suffix: &str) -> Self {
        Self {
            subject: subject.to_string(),
            session: session.to_string(),
            run: None,
            desc: desc.to_string(),
            suffix: suffix.to_string(),
            extension: NIFTI_EXT.to_string(),
        }
    }

    pub fn with_run(mut self, run: Option<u32>) -> Self {
        self.run = run;
        self
    }

    pub fn with_extension(mut self, extension: &str) -> Self {
        self.extension = extension.to_string();
        self
    }

    /// `sub-{subject}_ses-{session}[_run-{run}]_desc-{desc}_{suffix}{ext}`.
    pub fn file_name(&self) -> String {
        let mut parts = vec![
            format!("sub-{}", self.subject),
            format!("ses-{}", self.session),
        ];
        if let Some(run) = self.run {
            parts.push(format!("run-{run}"));
        }
        parts.push(format!("desc-{}", self.desc));
        parts.push(self.suffix.clone());
        format!("{}{}", parts.join("_"), self.extension)
    }

    /// Check that every label is a BIDS label so that distinct descriptors
    /// can never render to the same file name.
    pub fn validate(&self) -> Result<(), String> {
        for (field, value) in [
            ("subject", &self.subject),
            ("session", &self.session),
            ("desc", &self.desc),
            ("suffix", &self.suffix),
        ] {
            if !is_label(value) {
                return Err(format!(
                    "artifact {field} '{value}' must be non-empty and alphanumeric"
                ));
            }
        }
        if !self.extension.starts_with('.') || self.extension[1..].contains('_') {
            return Err(format!(
                "artifact extension '{}' must start with '.'",
                self.extension
            ));
        }
        Ok(())
    }
}

impl fmt::Display for ArtifactDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_name())
    }
}

/// Alphanumeric, non-empty: the only characters allowed in a BIDS label.
pub fn is_label(value: &str) -> bool {
    !value.is_empty() && value.chars().all(|c| c.is_ascii_alphanumeric())
}

/// Constraint on a single entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityMatch {
    Equals(String),
    Absent,
}

/// Typed lookup of a file in the source tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceQuery {
    pub suffix: Option<String>,
    pub entities: Vec<(String, EntityMatch)>,
}

impl SourceQuery {
    /// Match any file with the given suffix.
    pub fn with_suffix(suffix: &str) -> Self {
        Self {
            suffix: Some(suffix.to_string()),
            entities: Vec::new(),
        }
    }

    /// Match any suffix; constrain by entities only.
    pub fn any_suffix() -> Self {
        Self {
            suffix: None,
            entities: Vec::new(),
        }
    }

    pub fn entity(mut self, key: &str, value: &str) -> Self {
        self.entities
            .push((key.to_string(), EntityMatch::Equals(value.to_string())));
        self
    }

    pub fn without(mut self, key: &str) -> Self {
        self.entities.push((key.to_string(), EntityMatch::Absent));
        self
    }

    /// True when `name` satisfies every constraint and, if `run` is given,
    /// carries that run index (an absent `run` entity counts as run 1).
    pub fn matches(&self, name: &EntityName, run: Option<u32>) -> bool {
        if let Some(suffix) = &self.suffix {
            if &name.suffix != suffix {
                return false;
            }
        }
        for (key, constraint) in &self.entities {
            let ok = match constraint {
                EntityMatch::Equals(value) => name.entity(key) == Some(value.as_str()),
                EntityMatch::Absent => name.entity(key).is_none(),
            };
            if !ok {
                return false;
            }
        }
        match run {
            Some(run) => name.run() == Some(run),
            None => true,
        }
    }
}

impl fmt::Display for SourceQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = self
            .entities
            .iter()
            .map(|(key, constraint)| match constraint {
                EntityMatch::Equals(value) => format!("{key}-{value}"),
                EntityMatch::Absent => format!("!{key}"),
            })
            .collect();
        parts.push(self.suffix.clone().unwrap_or_else(|| "*".to_string()));
        f.write_str(&parts.join("_"))
    }
}

/// Typed lookup of a derived artifact by stage tag (and optionally suffix).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedQuery {
    pub desc: String,
    pub suffix: Option<String>,
}

impl DerivedQuery {
    pub fn desc(desc: &str) -> Self {
        Self {
            desc: desc.to_string(),
            suffix: None,
        }
    }

    pub fn desc_suffix(desc: &str, suffix: &str) -> Self {
        Self {
            desc: desc.to_string(),
            suffix: Some(suffix.to_string()),
        }
    }

    pub fn matches(&self, name: &EntityName, run: Option<u32>) -> bool {
        if name.entity("desc") != Some(self.desc.as_str()) {
            return false;
        }
        if let Some(suffix) = &self.suffix {
            if &name.suffix != suffix {
                return false;
            }
        }
        match run {
            Some(run) => name.run() == Some(run),
            None => true,
        }
    }
}

impl fmt::Display for DerivedQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.suffix {
            Some(suffix) => write!(f, "desc-{}_{}", self.desc, suffix),
            None => write!(f, "desc-{}", self.desc),
        }
    }
}

/// Magnitude or phase channel of an MP2RAGE inversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Part {
    Mag,
    Phase,
}

impl Part {
    pub fn label(self) -> &'static str {
        match self {
            Part::Mag => "mag",
            Part::Phase => "phase",
        }
    }
}

/// One channel of one MP2RAGE inversion (`inv-N_part-P_MP2RAGE`).
pub fn mp2rage_part(inversion: u8, part: Part) -> SourceQuery {
    SourceQuery::with_suffix("MP2RAGE")
        .entity("inv", &inversion.to_string())
        .entity("part", part.label())
}

/// File whose presence defines the runs of a session.
pub fn run_discovery_query() -> SourceQuery {
    mp2rage_part(1, Part::Mag)
}

/// Combined second-inversion image (`inv-2_MP2RAGE` without a `part` entity).
pub fn inv2_combined() -> SourceQuery {
    SourceQuery::with_suffix("MP2RAGE")
        .entity("inv", "2")
        .without("part")
}

/// Scanner-reconstructed UNIT1 image (`acq-mp2rage`).
pub fn unit1() -> SourceQuery {
    SourceQuery::any_suffix().entity("acq", "mp2rage")
}

pub fn flair() -> SourceQuery {
    SourceQuery::with_suffix("FLAIR")
}

/// DREAM B1 map in the session's `fmap/` directory.
pub fn dream_b1map() -> SourceQuery {
    SourceQuery::with_suffix("TB1map").entity("acq", "dream")
}
