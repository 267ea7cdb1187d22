use thiserror::Error;

use crate::lifecycle::{LifecycleState, LifecycleStep};
use crate::routine::Routine;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to read process memory at address {address:#x}: {message}")]
    MemoryReadFailed { address: usize, message: String },

    #[error("Failed to write process memory at address {address:#x}: {message}")]
    MemoryWriteFailed { address: usize, message: String },

    #[error("Invalid layout: {0}")]
    InvalidLayout(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Hook(#[from] HookError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Check if this error is a "file not found" error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }
}

/// Module or table location could not be determined.
///
/// Always fatal: every later address is derived from the values this
/// step produces.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    #[error("no loaded module contains address {address:#x}")]
    NotFound { address: usize },

    #[error("table displacement at {address:#x} is unreadable: {message}")]
    DisplacementUnreadable { address: usize, message: String },

    #[error("table base computed from {field:#x} overflows the address space")]
    Overflow { field: usize },

    #[error("signature for {routine} not found in module image")]
    SignatureNotFound { routine: Routine },

    #[error("no target registered for {routine}")]
    MissingTarget { routine: Routine },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HookError {
    #[error("target {target:#x} is already hooked")]
    AlreadyInstalled { target: usize },

    #[error("target {target:#x} cannot be patched: {reason}")]
    InvalidTarget { target: usize, reason: String },

    #[error("failed to change protection at {address:#x}: {message}")]
    MemoryProtection { address: usize, message: String },
}

impl HookError {
    pub(crate) fn invalid(target: usize, reason: impl Into<String>) -> Self {
        HookError::InvalidTarget {
            target,
            reason: reason.into(),
        }
    }
}

/// A startup step failed. The sequencer never reaches `Ready` after this.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error("module base discovery for '{module}' failed: {source}")]
    ModuleBase {
        module: String,
        #[source]
        source: ResolutionError,
    },

    #[error("{step} failed for {} routine(s), first: {}", failures.len(), first_failure(failures))]
    HookBatch {
        step: LifecycleStep,
        failures: Vec<(Routine, HookError)>,
    },

    #[error("{step} could not locate a routine: {source}")]
    Locate {
        step: LifecycleStep,
        #[source]
        source: ResolutionError,
    },

    #[error("indirect table resolution failed: {0}")]
    Table(#[source] ResolutionError),

    #[error("illegal lifecycle transition {from} -> {to}")]
    Transition {
        from: LifecycleState,
        to: LifecycleState,
    },
}

fn first_failure(failures: &[(Routine, HookError)]) -> String {
    failures
        .first()
        .map(|(routine, err)| format!("{routine}: {err}"))
        .unwrap_or_else(|| "none".to_string())
}
