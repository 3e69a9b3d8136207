//! I/O helpers for anatprep commands.

pub mod config;
pub mod nifti_io;
pub mod process;
pub mod resolver;
pub mod study;
pub mod tracker;
