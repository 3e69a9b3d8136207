//! Anatomical preprocessing orchestration for 7T MP2RAGE data.
//!
//! The crate drives a sequence of external neuroimaging tools over a BIDS
//! study tree and keeps the human-in-the-loop brainmask refinement resumable.
//! The architecture follows a strict split:
//!
//! - **[`core`]**: Pure, deterministic logic (artifact names, the iteration
//!   state machine, the sinus-mask deriver, background denoising). No I/O.
//! - **[`io`]**: Side-effecting operations (study tree resolution, NIfTI
//!   volumes, the persisted iteration record, configuration, processes).
//!
//! Orchestration modules under [`steps`] combine both to implement the CLI
//! subcommands.

pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod steps;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
