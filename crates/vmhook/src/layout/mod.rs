//! Where routines, the indirect call table and native structures live in
//! a particular host build.
//!
//! A layout is plain data, loaded from JSON, so a new server build only
//! needs a new layout file. [`HostLayout::template`] produces a skeleton with
//! every entry present and unset, which [`HostLayout::problems`] reports
//! until it is filled in.

mod signature;

pub use signature::{find_pattern, format_pattern, parse_pattern};

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;

use crate::error::{Error, Result};
use crate::memory::PTR_SIZE;
use crate::routine::{Routine, RoutineGroup};

/// Module name the lifecycle waits for by default.
pub const DEFAULT_TARGET_MODULE: &str = "qagame";

/// How to find one routine's entry point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RoutineTarget {
    /// Fixed address inside the (non position independent) host executable.
    Absolute { address: u64 },
    /// Offset from the target module's load base.
    ModuleOffset { offset: u64 },
    /// Offset from the anchor address delivered with the module notification.
    AnchorOffset { offset: u64 },
    /// First match of a wildcard byte pattern within the first `scan_len`
    /// bytes of the module image.
    Signature { pattern: String, scan_len: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotMode {
    /// Swap the slot for the replacement, keep the original for chaining.
    Replace,
    /// Only record the current pointer.
    Capture,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSlot {
    /// Byte offset of the slot from the table base.
    pub offset: u64,
    pub mode: SlotMode,
}

fn default_addend64() -> i64 {
    4
}

fn default_addend32() -> i64 {
    0xCEFF4
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableLayout {
    /// Routine the displacement field is measured from. The module anchor
    /// delivered with the notification when absent.
    #[serde(default)]
    pub known_routine: Option<Routine>,
    /// Offset of the 32-bit displacement field from `known_routine`.
    pub displacement_offset: u64,
    #[serde(default = "default_addend64")]
    pub addend64: i64,
    #[serde(default = "default_addend32")]
    pub addend32: i64,
    pub slots: BTreeMap<Routine, TableSlot>,
}

/// Field offsets of the host's native structures, read by the replacement
/// shims to build event snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostAbi {
    /// Absolute address of the `client_t *` array pointer.
    pub clients: u64,
    pub client_size: u64,
    pub client_state: u64,
    pub client_gentity: u64,
    /// Offset of the entity array from the target module base.
    pub entities: u64,
    pub gentity_size: u64,
    pub gentity_client: u64,
    pub gentity_activator: u64,
    pub gentity_owner_num: u64,
    pub gclient_client_num: u64,
    pub max_clients: u32,
}

impl HostAbi {
    fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        let required = [
            ("clients", self.clients),
            ("client_size", self.client_size),
            ("gentity_size", self.gentity_size),
            ("entities", self.entities),
        ];
        for (name, value) in required {
            if value == 0 {
                problems.push(format!("abi.{name} is unset"));
            }
        }
        if self.max_clients == 0 {
            problems.push("abi.max_clients is unset".to_string());
        }
        problems
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostLayout {
    pub version: String,
    #[serde(default = "default_target_module")]
    pub target_module: String,
    pub routines: BTreeMap<Routine, RoutineTarget>,
    pub table: TableLayout,
    #[serde(default)]
    pub abi: Option<HostAbi>,
}

fn default_target_module() -> String {
    DEFAULT_TARGET_MODULE.to_string()
}

impl HostLayout {
    /// Every routine and slot present with zero placeholders.
    pub fn template() -> Self {
        let routines = Routine::iter()
            .filter(|r| r.group() != RoutineGroup::Table)
            .map(|r| {
                let target = match r.group() {
                    RoutineGroup::Module => RoutineTarget::AnchorOffset { offset: 0 },
                    _ => RoutineTarget::Absolute { address: 0 },
                };
                (r, target)
            })
            .collect();

        let slots = Routine::in_group(RoutineGroup::Table)
            .map(|r| {
                let mode = match r {
                    Routine::GInitGame | Routine::GRunFrame => SlotMode::Replace,
                    _ => SlotMode::Capture,
                };
                (r, TableSlot { offset: 0, mode })
            })
            .collect();

        Self {
            version: "unknown".to_string(),
            target_module: default_target_module(),
            routines,
            table: TableLayout {
                known_routine: None,
                displacement_offset: 0,
                addend64: default_addend64(),
                addend32: default_addend32(),
                slots,
            },
            abi: Some(HostAbi::default()),
        }
    }

    pub fn target(&self, routine: Routine) -> Option<&RoutineTarget> {
        self.routines.get(&routine)
    }

    /// Human readable list of everything that prevents this layout from
    /// being used. Empty means usable.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.target_module.trim().is_empty() {
            problems.push("target_module is empty".to_string());
        }

        for routine in Routine::iter() {
            match routine.group() {
                RoutineGroup::Table => {
                    if self.routines.contains_key(&routine) {
                        problems.push(format!(
                            "{routine} lives in the call table and must only appear in table.slots"
                        ));
                    }
                    if !self.table.slots.contains_key(&routine) {
                        problems.push(format!("table slot for {routine} is missing"));
                    }
                }
                group => match self.routines.get(&routine) {
                    None => problems.push(format!("{routine} has no target")),
                    Some(target) => problems.extend(target_problems(routine, group, target)),
                },
            }
        }

        if let Some(known) = self.table.known_routine {
            if !matches!(known.group(), RoutineGroup::Bootstrap | RoutineGroup::Static) {
                problems.push(format!(
                    "table.known_routine {known} is not located before the table is resolved"
                ));
            }
        }

        let mut seen = HashSet::new();
        for (routine, slot) in &self.table.slots {
            if slot.offset as usize % PTR_SIZE != 0 {
                problems.push(format!(
                    "table slot for {routine} at {:#x} is not {PTR_SIZE}-byte aligned",
                    slot.offset
                ));
            }
            if !seen.insert(slot.offset) {
                problems.push(format!(
                    "table slot for {routine} reuses offset {:#x}",
                    slot.offset
                ));
            }
        }

        if let Some(abi) = &self.abi {
            problems.extend(abi.problems());
        }

        problems
    }

    /// Consume the layout, failing with the collected problems if any.
    pub fn validated(self) -> Result<Self> {
        let problems = self.problems();
        if problems.is_empty() {
            Ok(self)
        } else {
            Err(Error::InvalidLayout(problems.join("; ")))
        }
    }
}

fn target_problems(routine: Routine, group: RoutineGroup, target: &RoutineTarget) -> Vec<String> {
    let mut problems = Vec::new();
    match (group, target) {
        (RoutineGroup::Bootstrap | RoutineGroup::Static, RoutineTarget::Absolute { address }) => {
            if *address == 0 {
                problems.push(format!("{routine} address is unset"));
            }
        }
        (RoutineGroup::Bootstrap | RoutineGroup::Static, _) => {
            problems.push(format!(
                "{routine} lives in the host executable and needs an absolute address"
            ));
        }
        (_, RoutineTarget::Signature { pattern, scan_len }) => {
            if let Err(e) = parse_pattern(pattern) {
                problems.push(format!("{routine}: {e}"));
            }
            if *scan_len == 0 {
                problems.push(format!("{routine} signature has no scan length"));
            }
        }
        (_, RoutineTarget::Absolute { address: 0 }) => {
            problems.push(format!("{routine} address is unset"));
        }
        (_, RoutineTarget::ModuleOffset { offset: 0 } | RoutineTarget::AnchorOffset { offset: 0 }) => {
            problems.push(format!("{routine} offset is unset"));
        }
        _ => {}
    }
    problems
}

pub fn load_layout<P: AsRef<Path>>(path: P) -> Result<HostLayout> {
    let content = fs::read_to_string(&path)?;
    let data = serde_json::from_str(&content)?;
    Ok(data)
}

pub fn save_layout<P: AsRef<Path>>(path: P, layout: &HostLayout) -> Result<()> {
    let content = serde_json::to_string_pretty(layout)?;
    fs::write(path, content)?;
    Ok(())
}
