//! Code redirection of host routines.
//!
//! [`HookEngine`] owns one [`HookRecord`] per patched target and enforces the
//! install-once rule. The actual instruction patching sits behind
//! [`CodePatcher`]; [`DetourPatcher`] is the in-process implementation.

#[cfg(all(unix, any(target_arch = "x86", target_arch = "x86_64")))]
mod detour;
#[cfg(test)]
pub mod mock;

#[cfg(all(unix, any(target_arch = "x86", target_arch = "x86_64")))]
pub use detour::DetourPatcher;

use std::collections::BTreeMap;

use serde::Serialize;
use strum::Display;
use tracing::{debug, warn};

use crate::error::HookError;

/// Backend that rewrites executable memory.
pub trait CodePatcher {
    /// Redirect `target` to `replacement`. Returns an entry point that runs
    /// the original behaviour of `target`, captured before any byte of
    /// `target` was written.
    fn redirect(&mut self, target: usize, replacement: usize) -> Result<usize, HookError>;

    fn is_executable(&self, address: usize) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
pub enum HookStatus {
    Pending,
    Installed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HookRecord {
    target: usize,
    replacement: usize,
    original: Option<usize>,
    status: HookStatus,
}

impl HookRecord {
    fn pending(target: usize, replacement: usize) -> Self {
        Self {
            target,
            replacement,
            original: None,
            status: HookStatus::Pending,
        }
    }

    pub fn target(&self) -> usize {
        self.target
    }

    pub fn replacement(&self) -> usize {
        self.replacement
    }

    /// Entry point for chaining to the original routine. Only set once the
    /// record is `Installed`.
    pub fn original(&self) -> Option<usize> {
        self.original
    }

    pub fn status(&self) -> HookStatus {
        self.status
    }
}

pub struct HookEngine<P> {
    patcher: P,
    records: BTreeMap<usize, HookRecord>,
}

impl<P: CodePatcher> HookEngine<P> {
    pub fn new(patcher: P) -> Self {
        Self {
            patcher,
            records: BTreeMap::new(),
        }
    }

    /// Redirect `target` to `replacement` and return the original entry point.
    ///
    /// The engine never calls the original itself; whether it runs is the
    /// replacement's decision.
    pub fn install(&mut self, target: usize, replacement: usize) -> Result<usize, HookError> {
        if let Some(existing) = self.records.get(&target) {
            return Err(match existing.status {
                HookStatus::Failed => HookError::invalid(target, "previous installation failed"),
                _ => HookError::AlreadyInstalled { target },
            });
        }

        if target == 0 {
            return Err(HookError::invalid(target, "null address"));
        }
        if replacement == 0 {
            return Err(HookError::invalid(target, "null replacement"));
        }
        if target == replacement {
            return Err(HookError::invalid(target, "replacement is the target itself"));
        }
        if !self.patcher.is_executable(target) {
            return Err(HookError::invalid(target, "not in executable memory"));
        }

        self.records
            .insert(target, HookRecord::pending(target, replacement));

        let result = self.patcher.redirect(target, replacement);
        let Some(record) = self.records.get_mut(&target) else {
            return Err(HookError::invalid(target, "record vanished during install"));
        };

        match result {
            Ok(original) => {
                record.original = Some(original);
                record.status = HookStatus::Installed;
                debug!(
                    "Hooked {:#x} -> {:#x} (original entry {:#x})",
                    target, replacement, original
                );
                Ok(original)
            }
            Err(e) => {
                record.status = HookStatus::Failed;
                warn!("Failed to hook {:#x}: {}", target, e);
                Err(e)
            }
        }
    }

    pub fn record(&self, target: usize) -> Option<&HookRecord> {
        self.records.get(&target)
    }

    pub fn records(&self) -> impl Iterator<Item = &HookRecord> {
        self.records.values()
    }

    pub fn installed_count(&self) -> usize {
        self.records
            .values()
            .filter(|r| r.status == HookStatus::Installed)
            .count()
    }

    pub fn patcher(&self) -> &P {
        &self.patcher
    }
}
