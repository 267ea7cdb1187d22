//! Pointer-width dependent arithmetic locating the indirect call table.
//!
//! Position independent 64-bit code addresses data relative to the
//! instruction pointer, so the displacement is relative to the field that
//! stores it. 32-bit builds address it relative to the module's GOT, which
//! sits at a fixed distance from the module base. The two encodings are
//! indistinguishable from the displacement alone, hence the compile-time
//! selection of [`NativeFormula`].

use super::ModuleHandle;

pub trait TableFormula {
    /// Turn the signed displacement read at `field_address` into the table
    /// base. `None` if the result leaves the address space.
    fn compute_table_base(
        &self,
        module: &ModuleHandle,
        field_address: usize,
        displacement: i32,
    ) -> Option<usize>;
}

/// `table = displacement + field_address + addend`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RipRelative {
    pub addend: i64,
}

impl Default for RipRelative {
    fn default() -> Self {
        // Size of the displacement field itself: RIP points past it.
        Self { addend: 4 }
    }
}

impl TableFormula for RipRelative {
    fn compute_table_base(
        &self,
        _module: &ModuleHandle,
        field_address: usize,
        displacement: i32,
    ) -> Option<usize> {
        to_address(displacement as i128 + field_address as i128 + self.addend as i128)
    }
}

/// `table = displacement + addend + module base`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BaseRelative {
    pub addend: i64,
}

impl Default for BaseRelative {
    fn default() -> Self {
        Self { addend: 0xCEFF4 }
    }
}

impl TableFormula for BaseRelative {
    fn compute_table_base(
        &self,
        module: &ModuleHandle,
        _field_address: usize,
        displacement: i32,
    ) -> Option<usize> {
        to_address(displacement as i128 + self.addend as i128 + module.base() as i128)
    }
}

#[cfg(target_pointer_width = "64")]
pub type NativeFormula = RipRelative;

#[cfg(target_pointer_width = "32")]
pub type NativeFormula = BaseRelative;

/// Build the formula for this target from the per-width addends of a layout.
pub fn native_formula(addend64: i64, addend32: i64) -> NativeFormula {
    #[cfg(target_pointer_width = "64")]
    {
        let _ = addend32;
        RipRelative { addend: addend64 }
    }

    #[cfg(target_pointer_width = "32")]
    {
        let _ = addend64;
        BaseRelative { addend: addend32 }
    }
}

fn to_address(value: i128) -> Option<usize> {
    if value <= 0 {
        return None;
    }
    usize::try_from(value).ok()
}
