//! Address resolution: module base discovery and indirect table location.

#[cfg(unix)]
mod dl;
mod formula;

#[cfg(unix)]
pub use dl::DlModuleMap;
pub use formula::{BaseRelative, NativeFormula, RipRelative, TableFormula, native_formula};

use std::path::Path;

use tracing::{debug, info};

use crate::error::ResolutionError;
use crate::memory::ReadMemory;

/// Raw answer of a loaded-module query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    pub base: usize,
    pub path: String,
}

/// Source of loaded-module metadata for the current process.
pub trait ModuleMap {
    fn module_containing(&self, address: usize) -> Option<ModuleInfo>;
}

/// The discovered host module. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleHandle {
    base: usize,
    name: String,
    path: String,
}

impl ModuleHandle {
    pub fn new(base: usize, name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            base,
            name: name.into(),
            path: path.into(),
        }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Address of `offset` bytes into the module image.
    pub fn offset(&self, offset: u64) -> Option<usize> {
        usize::try_from(offset)
            .ok()
            .and_then(|o| self.base.checked_add(o))
    }
}

/// Symbolic module name from a loaded path: file name up to the first dot.
///
/// `/srv/ql/baseq3/qagamex64.so` → `qagamex64`
pub fn module_name_from_path(path: &str) -> String {
    let file = Path::new(path)
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_default();
    file.split('.').next().unwrap_or_default().to_string()
}

pub struct AddressResolver<M, F = NativeFormula> {
    modules: M,
    formula: F,
}

impl<M: ModuleMap> AddressResolver<M> {
    pub fn native(modules: M, addend64: i64, addend32: i64) -> Self {
        Self::new(modules, native_formula(addend64, addend32))
    }
}

impl<M: ModuleMap, F: TableFormula> AddressResolver<M, F> {
    pub fn new(modules: M, formula: F) -> Self {
        Self { modules, formula }
    }

    /// Find the module that contains `anchor_address`.
    pub fn resolve_module_base(&self, anchor_address: usize) -> Result<ModuleHandle, ResolutionError> {
        let found = self
            .modules
            .module_containing(anchor_address)
            .ok_or(ResolutionError::NotFound {
                address: anchor_address,
            })?;

        let handle = ModuleHandle::new(found.base, module_name_from_path(&found.path), found.path);
        info!(
            "Resolved module '{}' at base {:#x} (anchor {:#x})",
            handle.name(),
            handle.base(),
            anchor_address
        );
        Ok(handle)
    }

    /// Locate the indirect call table from the displacement stored
    /// `static_relative_offset` bytes past `known_routine_address`.
    pub fn resolve_table<R: ReadMemory>(
        &self,
        memory: &R,
        module: &ModuleHandle,
        known_routine_address: usize,
        static_relative_offset: u64,
    ) -> Result<usize, ResolutionError> {
        let field = usize::try_from(static_relative_offset)
            .ok()
            .and_then(|o| known_routine_address.checked_add(o))
            .ok_or(ResolutionError::Overflow {
                field: known_routine_address,
            })?;

        let displacement =
            memory
                .read_i32(field)
                .map_err(|e| ResolutionError::DisplacementUnreadable {
                    address: field,
                    message: e.to_string(),
                })?;

        let table = self
            .formula
            .compute_table_base(module, field, displacement)
            .ok_or(ResolutionError::Overflow { field })?;

        debug!(
            "Table displacement {:#x} at {:#x} -> table base {:#x}",
            displacement, field, table
        );
        Ok(table)
    }
}


#[cfg(test)]
mod tests {
    use super::mock::MockModuleMap;
    use super::*;
    use crate::memory::MockMemory;

    fn modules() -> MockModuleMap {
        MockModuleMap::default().with_module(0x7000_0000, 0x10_0000, "/srv/ql/baseq3/qagamex64.so")
    }

    #[test]
    fn test_module_name_from_path() {
        assert_eq!(module_name_from_path("/srv/ql/baseq3/qagamex64.so"), "qagamex64");
        assert_eq!(module_name_from_path("qagamei386.so"), "qagamei386");
        assert_eq!(module_name_from_path(""), "");
    }

    #[test]
    fn test_resolve_module_base() {
        let resolver = AddressResolver::new(modules(), RipRelative::default());
        let handle = resolver.resolve_module_base(0x7000_1234).unwrap();
        assert_eq!(handle.base(), 0x7000_0000);
        assert_eq!(handle.name(), "qagamex64");
        assert_eq!(handle.offset(0x10), Some(0x7000_0010));
    }

    #[test]
    fn test_resolve_module_base_outside_any_module() {
        let resolver = AddressResolver::new(modules(), RipRelative::default());
        let err = resolver.resolve_module_base(0x1234).unwrap_err();
        assert_eq!(err, ResolutionError::NotFound { address: 0x1234 });
    }

    #[test]
    fn test_resolve_table_rip_relative() {
        let memory = MockMemory::builder()
            .code(0x7000_1000, 0x100)
            .i32_at(0x7000_1003, 0x2000)
            .build();
        let resolver = AddressResolver::new(modules(), RipRelative::default());
        let module = resolver.resolve_module_base(0x7000_1000).unwrap();

        let table = resolver
            .resolve_table(&memory, &module, 0x7000_1000, 3)
            .unwrap();
        assert_eq!(table, 0x7000_1003 + 0x2000 + 4);
    }

    #[test]
    fn test_resolve_table_base_relative() {
        let memory = MockMemory::builder()
            .code(0x7000_1000, 0x100)
            .i32_at(0x7000_1011, 0x40)
            .build();
        let resolver = AddressResolver::new(modules(), BaseRelative::default());
        let module = resolver.resolve_module_base(0x7000_1000).unwrap();

        let table = resolver
            .resolve_table(&memory, &module, 0x7000_1000, 0x11)
            .unwrap();
        assert_eq!(table, 0x7000_0000 + 0xCEFF4 + 0x40);
    }

    #[test]
    fn test_resolve_table_unreadable_displacement() {
        let memory = MockMemory::builder().build();
        let resolver = AddressResolver::new(modules(), RipRelative::default());
        let module = ModuleHandle::new(0x7000_0000, "qagamex64", "");

        let err = resolver
            .resolve_table(&memory, &module, 0x7000_1000, 3)
            .unwrap_err();
        assert!(matches!(
            err,
            ResolutionError::DisplacementUnreadable { address: 0x7000_1003, .. }
        ));
    }
}
