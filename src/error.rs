//! Custom error types for the controller.
//!
//! This module defines the primary error type, `DaqError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the kinds of errors that can occur while driving the timing system, expanding scans
//! and writing datasets.
//!
//! ## Error Hierarchy
//!
//! - **`Configuration`**: missing motor resolver, unknown channel mnemonic, bad table link.
//!   Surfaced to the user; acquisition refuses to start; never retried.
//! - **`OutOfRange`** / **`NotANumber`**: a register write was refused before reaching
//!   the hardware.
//! - **`Transport`** / **`SequenceUploadFailed`**: the FPGA or a channel-access peer did
//!   not answer. Uploads are retried with exponential backoff before the latter is raised.
//! - **`ScanExpression`**: a scan-values or time string could not be parsed.
//! - **`Io`**: logfile, table or settings file failures.
//!
//! Cancellation is not represented here. Long operations report it through their
//! outcome enums instead.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Errors of the acquisition stack.
#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Configuration file error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Register '{register}': count {count} outside [{min}, {max}]")]
    OutOfRange {
        register: String,
        count: i64,
        min: i64,
        max: i64,
    },

    #[error("Register '{register}': computed count is not a number")]
    NotANumber { register: String },

    #[error("Unknown register '{0}'")]
    UnknownRegister(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Sequence upload failed after {attempts} attempts: {reason}")]
    SequenceUploadFailed { attempts: u32, reason: String },

    #[error("Cannot parse '{expression}': {reason}")]
    ScanExpression { expression: String, reason: String },

    #[error("Settings error: {0}")]
    Settings(String),

    #[error("Configuration table error: {0}")]
    Table(String),

    #[error("Dependency cycle through '{0}'")]
    DependencyCycle(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Snapshot encoding error: {0}")]
    Toml(#[from] toml::ser::Error),
}

impl DaqError {
    /// Whether the operation that produced this error may be retried or continued.
    ///
    /// Transport problems are transient; configuration and range problems will
    /// fail identically on every retry.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DaqError::Transport(_) | DaqError::Io(_))
    }

    /// Build a `ScanExpression` error.
    pub fn expression(expression: impl Into<String>, reason: impl Into<String>) -> Self {
        DaqError::ScanExpression {
            expression: expression.into(),
            reason: reason.into(),
        }
    }

    /// Wrap a hardware-level failure as a transport error.
    pub fn transport(err: impl std::fmt::Display) -> Self {
        DaqError::Transport(err.to_string())
    }
}
