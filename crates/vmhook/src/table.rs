//! Redirection of entries in the host's indirect call table.
//!
//! The table is data the host already dispatches through, so a redirect is
//! a single pointer store; no instruction is touched.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::debug;

use crate::error::{Error, HookError};
use crate::memory::WriteMemory;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndirectTableEntry {
    table_base: usize,
    slot_offset: u64,
    original: usize,
    replacement: Option<usize>,
}

impl IndirectTableEntry {
    pub fn table_base(&self) -> usize {
        self.table_base
    }

    pub fn slot_offset(&self) -> u64 {
        self.slot_offset
    }

    /// Pointer that was in the slot before any swap.
    pub fn original(&self) -> usize {
        self.original
    }

    /// `None` for slots that were only captured.
    pub fn replacement(&self) -> Option<usize> {
        self.replacement
    }
}

pub struct TablePatcher<W> {
    memory: W,
    entries: BTreeMap<usize, IndirectTableEntry>,
}

impl<W: WriteMemory> TablePatcher<W> {
    pub fn new(memory: W) -> Self {
        Self {
            memory,
            entries: BTreeMap::new(),
        }
    }

    /// Swap the slot at `table_base + slot_offset` for `replacement` and
    /// return the pointer it held.
    pub fn patch_table_slot(
        &mut self,
        table_base: usize,
        slot_offset: u64,
        replacement: usize,
    ) -> Result<usize, HookError> {
        let slot = slot_address(table_base, slot_offset)?;
        if replacement == 0 {
            return Err(HookError::invalid(slot, "null replacement"));
        }

        if let Some(entry) = self.entries.get(&slot) {
            if entry.replacement.is_some() {
                return Err(HookError::AlreadyInstalled { target: slot });
            }
        }

        let current = self.read_slot(slot)?;
        if current == replacement {
            return Err(HookError::AlreadyInstalled { target: slot });
        }
        if let Some(captured) = self.entries.get(&slot) {
            if captured.original != current {
                return Err(HookError::invalid(slot, "slot changed since it was captured"));
            }
        }

        self.memory
            .write_ptr(slot, replacement)
            .map_err(|e| HookError::MemoryProtection {
                address: slot,
                message: e.to_string(),
            })?;

        debug!(
            "Table slot {:#x}+{:#x}: {:#x} -> {:#x}",
            table_base, slot_offset, current, replacement
        );
        self.entries.insert(
            slot,
            IndirectTableEntry {
                table_base,
                slot_offset,
                original: current,
                replacement: Some(replacement),
            },
        );
        Ok(current)
    }

    /// Record the slot's pointer without replacing it.
    pub fn capture_table_slot(&mut self, table_base: usize, slot_offset: u64) -> Result<usize, HookError> {
        let slot = slot_address(table_base, slot_offset)?;
        if let Some(entry) = self.entries.get(&slot) {
            return Ok(entry.original);
        }

        let current = self.read_slot(slot)?;
        debug!(
            "Table slot {:#x}+{:#x} captured: {:#x}",
            table_base, slot_offset, current
        );
        self.entries.insert(
            slot,
            IndirectTableEntry {
                table_base,
                slot_offset,
                original: current,
                replacement: None,
            },
        );
        Ok(current)
    }

    pub fn entry(&self, table_base: usize, slot_offset: u64) -> Option<&IndirectTableEntry> {
        slot_address(table_base, slot_offset)
            .ok()
            .and_then(|slot| self.entries.get(&slot))
    }

    pub fn entries(&self) -> impl Iterator<Item = &IndirectTableEntry> {
        self.entries.values()
    }

    pub fn memory(&self) -> &W {
        &self.memory
    }

    fn read_slot(&self, slot: usize) -> Result<usize, HookError> {
        let current = self.memory.read_ptr(slot).map_err(|e| match e {
            Error::MemoryReadFailed { message, .. } => HookError::invalid(slot, message),
            other => HookError::invalid(slot, other.to_string()),
        })?;
        if current == 0 {
            return Err(HookError::invalid(slot, "table slot is empty"));
        }
        Ok(current)
    }
}

fn slot_address(table_base: usize, slot_offset: u64) -> Result<usize, HookError> {
    if table_base == 0 {
        return Err(HookError::invalid(0, "table is not resolved"));
    }
    usize::try_from(slot_offset)
        .ok()
        .and_then(|o| table_base.checked_add(o))
        .ok_or_else(|| HookError::invalid(table_base, "slot offset overflows"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MockMemory, PTR_SIZE, ReadMemory};

    const TABLE: usize = 0x8000;

    fn patcher() -> TablePatcher<MockMemory> {
        let memory = MockMemory::builder()
            .data(TABLE, PTR_SIZE * 4)
            .ptr_at(TABLE, 0x1111)
            .ptr_at(TABLE + PTR_SIZE, 0x2222)
            .ptr_at(TABLE + PTR_SIZE * 2, 0x3333)
            .build();
        TablePatcher::new(memory)
    }

    #[test]
    fn test_patch_swaps_pointer() {
        let mut table = patcher();
        let original = table.patch_table_slot(TABLE, PTR_SIZE as u64, 0xAAAA).unwrap();

        assert_eq!(original, 0x2222);
        assert_eq!(table.memory().read_ptr(TABLE + PTR_SIZE).unwrap(), 0xAAAA);
        assert_eq!(table.memory().read_ptr(TABLE).unwrap(), 0x1111);

        let entry = table.entry(TABLE, PTR_SIZE as u64).unwrap();
        assert_eq!(entry.original(), 0x2222);
        assert_eq!(entry.replacement(), Some(0xAAAA));
    }

    #[test]
    fn test_patch_twice_is_rejected() {
        let mut table = patcher();
        table.patch_table_slot(TABLE, 0, 0xAAAA).unwrap();

        let err = table.patch_table_slot(TABLE, 0, 0xBBBB).unwrap_err();
        assert_eq!(err, HookError::AlreadyInstalled { target: TABLE });
        assert_eq!(table.memory().read_ptr(TABLE).unwrap(), 0xAAAA);
        assert_eq!(table.entry(TABLE, 0).unwrap().original(), 0x1111);
        assert_eq!(table.memory().writes().len(), 1);
    }

    #[test]
    fn test_capture_does_not_write() {
        let mut table = patcher();
        let original = table.capture_table_slot(TABLE, (PTR_SIZE * 2) as u64).unwrap();

        assert_eq!(original, 0x3333);
        assert!(table.memory().writes().is_empty());
        assert_eq!(table.entry(TABLE, (PTR_SIZE * 2) as u64).unwrap().replacement(), None);
    }

    #[test]
    fn test_capture_is_stable_after_host_rewrites() {
        let mut table = patcher();
        table.capture_table_slot(TABLE, 0).unwrap();
        table.memory().poke_ptr(TABLE, 0x9999);
        assert_eq!(table.capture_table_slot(TABLE, 0).unwrap(), 0x1111);
    }

    #[test]
    fn test_captured_slot_can_be_replaced() {
        let mut table = patcher();
        table.capture_table_slot(TABLE, 0).unwrap();
        assert_eq!(table.patch_table_slot(TABLE, 0, 0xAAAA).unwrap(), 0x1111);
    }

    #[test]
    fn test_empty_slot_means_unpopulated_table() {
        let mut table = patcher();
        let err = table
            .patch_table_slot(TABLE, (PTR_SIZE * 3) as u64, 0xAAAA)
            .unwrap_err();
        assert!(matches!(err, HookError::InvalidTarget { .. }));
        assert!(table.memory().writes().is_empty());
    }

    #[test]
    fn test_unresolved_or_unmapped_table() {
        let mut table = patcher();
        assert!(table.patch_table_slot(0, 0, 0xAAAA).is_err());
        assert!(table.capture_table_slot(0x20_0000, 0).is_err());
    }
}
