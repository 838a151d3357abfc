//! Error taxonomy for enforcement operations.
//!
//! Callers decide severity per variant: attribute failures degrade to a
//! warning, mount invariant violations stop the caller, a missing canonical
//! snapshot means "not installed yet".

use std::path::PathBuf;

use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, GuardError>;

#[derive(Debug, Error)]
pub enum GuardError {
    /// Canonical snapshot absent: the guard has not been set up.
    #[error("canonical snapshot missing at {0}")]
    ConfigMissing(PathBuf),

    /// The filesystem or kernel does not provide the immutability attribute.
    #[error("immutability attribute unsupported on {path}: {source}")]
    AttributeUnsupported {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Collapsing the overlay did not reach zero layers.
    #[error("{path} still has {layers} mount layer(s) after {attempts} unmount attempts")]
    MountStackInvariantViolation {
        path: PathBuf,
        layers: usize,
        attempts: u32,
    },

    /// A policy file no longer matches its recorded digest.
    #[error("integrity mismatch for {path}: expected {expected}, found {actual}")]
    IntegrityMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    /// Control state token was neither `ENABLED` nor `DISABLED`.
    #[error("malformed control state token: {0:?}")]
    ControlStateMalformed(String),

    #[error("a reason is required and must not be blank")]
    EmptyReason,

    /// Another maintenance window (unlock session or package transaction)
    /// owns the resource.
    #[error("maintenance already in progress: {0}")]
    MaintenanceBusy(String),

    /// Uninstall, or a setup re-run that would loosen enforcement, was
    /// attempted while the control state is ENABLED.
    #[error("protection is ENABLED; run `hostguard control disable` first")]
    StillEnabled,

    #[error("editor failed: {0}")]
    Editor(String),

    #[error("`{command}` failed: {detail}")]
    Command { command: String, detail: String },

    /// Failed to restore protections at the end of a maintenance window.
    #[error("failed to re-lock {path} after {attempts} attempts: {last_error}")]
    RelockFailed {
        path: PathBuf,
        attempts: u32,
        last_error: String,
    },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl GuardError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        GuardError::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error only degrades enforcement (logged, not fatal).
    pub fn is_best_effort(&self) -> bool {
        matches!(
            self,
            GuardError::AttributeUnsupported { .. } | GuardError::ControlStateMalformed(_)
        )
    }
}

impl From<config::ConfigError> for GuardError {
    fn from(err: config::ConfigError) -> Self {
        GuardError::Config(err.to_string())
    }
}
