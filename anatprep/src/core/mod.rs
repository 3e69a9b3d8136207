//! Deterministic, pure logic shared by the anatprep steps.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! names, records and volumes and return deterministic outputs suitable for
//! tests.

pub mod artifact;
pub mod components;
pub mod denoise;
pub mod iteration;
pub mod sinus;
pub mod stats;
