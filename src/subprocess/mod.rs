//! Subprocess execution seam.
//!
//! RUN steps and plugin handlers go through [`ProcessRunner`] so tests can
//! substitute an in-memory runner. The tokio implementation enforces
//! timeouts (killing the child on expiry) and captures output with
//! explicit truncation markers.

pub mod error;
pub mod mock;
pub mod runner;

pub use error::ProcessError;
pub use mock::MockProcessRunner;
pub use runner::{ExitStatus, ProcessCommand, ProcessOutput, ProcessRunner, TokioProcessRunner};
