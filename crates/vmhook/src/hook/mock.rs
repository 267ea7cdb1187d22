//! Recording [`CodePatcher`] for tests.

use std::collections::{BTreeMap, HashSet};
use std::ops::Range;

use super::CodePatcher;
use crate::error::HookError;

/// Base of the fake trampolines handed out as original entry points.
pub const TRAMPOLINE_BASE: usize = 0x7F00_0000;

pub struct MockPatcher {
    executable: Range<usize>,
    failing: HashSet<usize>,
    redirects: BTreeMap<usize, usize>,
    trampolines: BTreeMap<usize, usize>,
}

impl MockPatcher {
    pub fn new(executable: Range<usize>) -> Self {
        Self {
            executable,
            failing: HashSet::new(),
            redirects: BTreeMap::new(),
            trampolines: BTreeMap::new(),
        }
    }

    pub fn failing_at(mut self, target: usize) -> Self {
        self.failing.insert(target);
        self
    }

    pub fn redirect_of(&self, target: usize) -> Option<usize> {
        self.redirects.get(&target).copied()
    }

    pub fn redirect_count(&self) -> usize {
        self.redirects.len()
    }

    /// Target whose trampoline is `original`.
    pub fn target_of_trampoline(&self, original: usize) -> Option<usize> {
        self.trampolines.get(&original).copied()
    }
}

impl CodePatcher for MockPatcher {
    fn redirect(&mut self, target: usize, replacement: usize) -> Result<usize, HookError> {
        if self.failing.contains(&target) {
            return Err(HookError::MemoryProtection {
                address: target,
                message: "mprotect refused".to_string(),
            });
        }
        let trampoline = TRAMPOLINE_BASE + self.trampolines.len() * 0x20;
        self.trampolines.insert(trampoline, target);
        self.redirects.insert(target, replacement);
        Ok(trampoline)
    }

    fn is_executable(&self, address: usize) -> bool {
        self.executable.contains(&address)
    }
}
