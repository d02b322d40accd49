//! Error types for the maintenance run.
//!
//! Only `ConfigInvalid` is fatal to a run. Every other kind is caught at the
//! step boundary and folded into that step's `StepResult`.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MaintenanceError {
    #[error("Command timed out after {timeout_secs}s: {command}")]
    CommandTimeout { command: String, timeout_secs: u64 },

    #[error("Command not found: {program}")]
    CommandNotFound { program: String },

    #[error("Command failed with exit code {exit_code}: {command}")]
    CommandFailed { command: String, exit_code: i32 },

    #[error("Backend unreachable: {0}")]
    BackendUnreachable(String),

    #[error("GMP request rejected ({status}): {text}")]
    GmpRejected { status: u16, text: String },

    #[error("Free space critical: {available_gb:.2} GB available (minimum {min_gb} GB)")]
    ResourceThresholdCritical { available_gb: f64, min_gb: f64 },

    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("Mail delivery error: {0}")]
    Mail(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MaintenanceError {
    /// True for the only error kind that aborts a run before any step
    pub fn is_fatal(&self) -> bool {
        matches!(self, MaintenanceError::ConfigInvalid(_))
    }
}

pub type Result<T> = std::result::Result<T, MaintenanceError>;
