//! Custom error types for the beam shower.
//!
//! This module defines the primary error type, `ShowerError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the different kinds of errors that can occur while sequencing the microscope.
//!
//! ## Error Hierarchy
//!
//! `ShowerError` consolidates the following error sources:
//!
//! - **`Mode`**: The microscope is not in the imaging mode the procedure requires.
//!   Raised before any hardware is touched, so nothing needs to be undone.
//! - **`ControlCall`**: A call into the microscope control library failed. Wraps a
//!   [`ControlError`] naming the call. Once any mutation has been applied, this error
//!   always leads to a reset attempt.
//! - **`Config`**: Loading or validating the procedure configuration failed. Blocks start.
//! - **`InvalidState`**: An operation was requested from a state that does not allow it.
//! - **`NotAcknowledged`**: The operator declined the safety gate during preparation.
//! - **`Cancelled`**: A stop was requested while the procedure was still preparing.
//! - **`RestoreIncomplete`**: One or more restore steps failed. Every step is still
//!   attempted, and the individual failures are carried in the variant.
//! - **`Backup`**: Reading or writing the backup record failed.
//!
//! By using `#[from]`, `ShowerError` can be created from the underlying error types,
//! so the `?` operator works throughout the procedure.

use crate::config::ConfigError;
use crate::procedure::RunState;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type ShowerResult<T> = std::result::Result<T, ShowerError>;

/// Convenience alias for results of individual microscope control calls.
pub type ControlResult<T> = std::result::Result<T, ControlError>;

/// A failed call into the microscope control library.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("control call '{call}' failed: {message}")]
pub struct ControlError {
    /// Name of the control call, e.g. `set_beam_blank`.
    pub call: String,
    /// Message reported by the control library.
    pub message: String,
}

impl ControlError {
    /// Creates a new control error for the named call.
    pub fn new(call: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            call: call.into(),
            message: message.into(),
        }
    }
}

/// The error type for all beam shower operations.
#[derive(Error, Debug)]
pub enum ShowerError {
    /// `start` was called outside STEM mode.
    #[error("Microscope is in {actual} mode; the beam shower requires STEM mode")]
    Mode {
        /// Imaging mode the microscope reported.
        actual: String,
    },

    /// A microscope call failed.
    #[error(transparent)]
    ControlCall(#[from] ControlError),

    /// The run configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The operation is not allowed in the current run state.
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        /// Rejected operation, e.g. `"start"`.
        operation: &'static str,
        /// State the procedure was in.
        state: RunState,
    },

    /// The operator declined the safety prompt.
    #[error("Operator did not confirm: {0}")]
    NotAcknowledged(String),

    /// A stop arrived before preparation finished.
    #[error("Beam shower cancelled during preparation")]
    Cancelled,

    /// Restore ran every step but some of them failed.
    #[error("Restore finished with {} failed step(s)", .0.len())]
    RestoreIncomplete(Vec<ControlError>),

    /// The backup record could not be written or read.
    #[error("Backup record error: {0}")]
    Backup(String),
}

impl From<std::io::Error> for ShowerError {
    fn from(err: std::io::Error) -> Self {
        ShowerError::Backup(err.to_string())
    }
}
