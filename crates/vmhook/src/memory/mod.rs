//! Access to the memory of the process the library is loaded into.
//!
//! Everything above this module talks to memory through [`ReadMemory`] and
//! [`WriteMemory`] so that address arithmetic and table patching can be
//! exercised against [`MockMemory`] in tests.

mod local;
#[cfg(test)]
pub mod mock;

pub use local::LocalMemory;

#[cfg(test)]
pub use mock::{MockMemory, MockMemoryBuilder};

use crate::error::{Error, Result};

/// Pointer width of the running build, in bytes.
pub const PTR_SIZE: usize = std::mem::size_of::<usize>();

pub trait ReadMemory {
    fn read_bytes(&self, address: usize, size: usize) -> Result<Vec<u8>>;

    /// Whether `address` lies in a mapped page with execute permission.
    fn is_executable(&self, address: usize) -> bool;

    fn read_i32(&self, address: usize) -> Result<i32> {
        let bytes = self.read_bytes(address, 4)?;
        let raw: [u8; 4] = bytes.as_slice().try_into().map_err(|_| Error::MemoryReadFailed {
            address,
            message: format!("short read of {} bytes", bytes.len()),
        })?;
        Ok(i32::from_le_bytes(raw))
    }

    fn read_ptr(&self, address: usize) -> Result<usize> {
        let bytes = self.read_bytes(address, PTR_SIZE)?;
        let raw: [u8; PTR_SIZE] =
            bytes.as_slice().try_into().map_err(|_| Error::MemoryReadFailed {
                address,
                message: format!("short read of {} bytes", bytes.len()),
            })?;
        Ok(usize::from_le_bytes(raw))
    }
}

pub trait WriteMemory: ReadMemory {
    /// Store one pointer-sized value. `address` must be pointer aligned so the
    /// store is a single untorn write.
    fn write_ptr(&self, address: usize, value: usize) -> Result<()>;
}

pub(crate) fn check_ptr_alignment(address: usize) -> Result<()> {
    if address % PTR_SIZE != 0 {
        return Err(Error::MemoryWriteFailed {
            address,
            message: format!("address is not {}-byte aligned", PTR_SIZE),
        });
    }
    Ok(())
}
