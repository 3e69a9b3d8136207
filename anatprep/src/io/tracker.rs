//! Persisted brainmask-loop record for one session.
//!
//! An open [`IterationTracker`] holds `iteration_state.json.lock` for its
//! whole lifetime, so one invocation owns the record at a time. The lock
//! records the holder's pid; a lock whose holder has exited is reclaimed.
//! Every mutation is applied to a copy, written via temp file + rename, and
//! only then committed in memory: a failed transition or write leaves both
//! the file and the tracker unchanged.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::core::iteration::{IterationState, IterationStatus};
use crate::error::AnatprepError;
use crate::io::resolver::ITERATION_STATE_FILE;

/// Local wall-clock time, second precision (`2026-01-01T10:00:00`).
pub fn now_timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%dT%H:%M:%S").to_string()
}

/// Exclusive handle on a session's iteration record.
#[derive(Debug)]
pub struct IterationTracker {
    path: PathBuf,
    state: IterationState,
    _lock: LockFile,
}

impl IterationTracker {
    /// Lock and load the record in `deriv_dir`, or synthesize a fresh one.
    ///
    /// A synthesized record is not written until the first mutation.
    pub fn open(deriv_dir: &Path, max_iterations: u32) -> Result<Self> {
        fs::create_dir_all(deriv_dir)
            .with_context(|| format!("create directory {}", deriv_dir.display()))?;
        let path = deriv_dir.join(ITERATION_STATE_FILE);
        let lock = LockFile::acquire(&lock_path(&path))?;
        let state = load_or_default(&path, max_iterations)?;
        debug!(
            path = %path.display(),
            iteration = state.current_iteration,
            status = %state.status,
            "iteration record opened"
        );
        Ok(Self {
            path,
            state,
            _lock: lock,
        })
    }

    /// Read the record without locking; for status displays.
    pub fn peek(deriv_dir: &Path, max_iterations: u32) -> Result<IterationState> {
        load_or_default(&deriv_dir.join(ITERATION_STATE_FILE), max_iterations)
    }

    pub fn state(&self) -> &IterationState {
        &self.state
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn set_status(&mut self, status: IterationStatus, note: &str) -> Result<()> {
        self.mutate(|state, now| state.set_status(status, note, now))?;
        info!(iteration = self.state.current_iteration, status = %status, "iteration status updated");
        Ok(())
    }

    /// Move to the next iteration; returns its number.
    pub fn advance(&mut self) -> Result<u32> {
        let next = self.mutate(|state, now| state.advance(now))?;
        info!(iteration = next, "advanced to next iteration");
        Ok(next)
    }

    pub fn finalize(&mut self) -> Result<()> {
        self.mutate(|state, now| state.finalize(now))?;
        info!(iteration = self.state.current_iteration, "iteration finalized");
        Ok(())
    }

    /// Back to iteration 1. Artifact files are left alone.
    pub fn reset(&mut self) -> Result<()> {
        self.mutate(|state, now| {
            state.reset(now);
            Ok(())
        })?;
        warn!("iteration record reset to iteration 1 (existing iter-N directories are kept)");
        Ok(())
    }

    fn mutate<T>(
        &mut self,
        apply: impl FnOnce(&mut IterationState, &str) -> std::result::Result<T, AnatprepError>,
    ) -> Result<T> {
        let mut next = self.state.clone();
        let value = apply(&mut next, &now_timestamp())?;
        write_state(&self.path, &next)?;
        self.state = next;
        Ok(value)
    }
}

fn load_or_default(path: &Path, max_iterations: u32) -> Result<IterationState> {
    if !path.exists() {
        return Ok(IterationState::new(&now_timestamp()).with_max_iterations(max_iterations));
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("read iteration record {}", path.display()))?;
    let state: IterationState = serde_json::from_str(&contents)
        .with_context(|| format!("parse iteration record {}", path.display()))?;
    state
        .validate()
        .map_err(|msg| anyhow::anyhow!("invalid iteration record {}: {msg}", path.display()))?;
    Ok(state.with_max_iterations(max_iterations))
}

/// Atomically write the record (temp file + rename).
fn write_state(path: &Path, state: &IterationState) -> Result<()> {
    debug!(path = %path.display(), iteration = state.current_iteration, "writing iteration record");
    let mut buf = serde_json::to_string_pretty(state)?;
    buf.push('\n');
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp iteration record {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .with_context(|| format!("replace iteration record {}", path.display()))?;
    Ok(())
}

fn lock_path(state_path: &Path) -> PathBuf {
    state_path.with_extension("json.lock")
}

/// A file created with `create_new`, removed on drop.
#[derive(Debug)]
struct LockFile {
    path: PathBuf,
}

impl LockFile {
    /// Create `path` exclusively. A lock left by a process that no longer
    /// exists is removed once and creation retried.
    fn acquire(path: &Path) -> Result<Self> {
        if let Some(lock) = Self::create(path)? {
            return Ok(lock);
        }
        let holder = read_holder(path);
        match holder {
            Some(pid) if !process_alive(pid) => {
                warn!(path = %path.display(), pid, "removing stale lock of exited process");
                remove_stale(path)?;
            }
            _ => {
                return Err(AnatprepError::Locked {
                    path: path.to_path_buf(),
                    holder,
                }
                .into());
            }
        }
        Self::create(path)?.ok_or_else(|| {
            AnatprepError::Locked {
                path: path.to_path_buf(),
                holder: read_holder(path),
            }
            .into()
        })
    }

    /// `None` when the file already exists.
    fn create(path: &Path) -> Result<Option<Self>> {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                if let Err(err) = writeln!(file, "{}", std::process::id()) {
                    debug!(path = %path.display(), err = %err, "could not record pid in lock file");
                }
                Ok(Some(Self {
                    path: path.to_path_buf(),
                }))
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(None),
            Err(err) => Err(err).with_context(|| format!("create lock {}", path.display())),
        }
    }
}

/// PID written by the lock holder; `None` when empty or unreadable.
fn read_holder(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn remove_stale(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove stale lock {}", path.display())),
    }
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

// Without a cheap liveness check every recorded holder counts as alive.
#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    true
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), err = %err, "failed to remove lock file");
        }
    }
}
