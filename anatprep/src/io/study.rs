//! Study directory discovery.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crate::error::AnatprepError;

/// How many directories (starting with the CWD) are inspected.
pub const MAX_SEARCH_DEPTH: usize = 4;

/// Files or directories whose presence marks a study root.
const MARKERS: [&str; 3] = ["code/anatprep_config.toml", "code/config.json", "rawdata"];

/// The explicit `--studydir`, or the nearest marked ancestor of `cwd`.
pub fn resolve_studydir(explicit: Option<&Path>, cwd: &Path) -> Result<PathBuf> {
    if let Some(path) = explicit {
        if !path.is_dir() {
            return Err(AnatprepError::NotFound(format!(
                "study directory {} does not exist",
                path.display()
            ))
            .into());
        }
        return path
            .canonicalize()
            .with_context(|| format!("resolve study directory {}", path.display()));
    }
    find_studydir(cwd).ok_or_else(|| {
        AnatprepError::NotFound(format!(
            "could not locate the study directory from {}; run inside the study tree or pass --studydir",
            cwd.display()
        ))
        .into()
    })
}

/// Walk up from `start` looking for a study marker.
pub fn find_studydir(start: &Path) -> Option<PathBuf> {
    let mut current = Some(start);
    for _ in 0..MAX_SEARCH_DEPTH {
        let dir = current?;
        if MARKERS.iter().any(|marker| dir.join(marker).exists()) {
            debug!(studydir = %dir.display(), "study directory detected");
            return Some(dir.to_path_buf());
        }
        current = dir.parent();
    }
    None
}
