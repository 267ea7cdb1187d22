use std::sync::atomic::{AtomicUsize, Ordering};

use region::Protection;
use tracing::trace;

use super::{PTR_SIZE, ReadMemory, WriteMemory, check_ptr_alignment};
use crate::error::{Error, Result};

/// Memory of the current process, accessed through raw pointers.
///
/// Every access is preceded by a page query so that an unmapped address is
/// reported as an error instead of faulting the host.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalMemory;

impl LocalMemory {
    pub fn new() -> Self {
        Self
    }

    fn check_readable(&self, address: usize, size: usize) -> Result<()> {
        if address == 0 {
            return Err(Error::MemoryReadFailed {
                address,
                message: "null address".to_string(),
            });
        }

        let regions = region::query_range(address as *const u8, size).map_err(|e| {
            Error::MemoryReadFailed {
                address,
                message: e.to_string(),
            }
        })?;

        for region in regions {
            let region = region.map_err(|e| Error::MemoryReadFailed {
                address,
                message: e.to_string(),
            })?;
            if !region.is_readable() {
                return Err(Error::MemoryReadFailed {
                    address,
                    message: format!("page at {:#x} is not readable", region.as_ptr::<u8>() as usize),
                });
            }
        }
        Ok(())
    }
}

impl ReadMemory for LocalMemory {
    fn read_bytes(&self, address: usize, size: usize) -> Result<Vec<u8>> {
        self.check_readable(address, size)?;
        let mut buffer = vec![0u8; size];
        // SAFETY: the whole range was just reported as mapped and readable.
        unsafe {
            std::ptr::copy_nonoverlapping(address as *const u8, buffer.as_mut_ptr(), size);
        }
        Ok(buffer)
    }

    fn is_executable(&self, address: usize) -> bool {
        if address == 0 {
            return false;
        }
        region::query(address as *const u8)
            .map(|r| r.is_executable())
            .unwrap_or(false)
    }
}

impl WriteMemory for LocalMemory {
    fn write_ptr(&self, address: usize, value: usize) -> Result<()> {
        check_ptr_alignment(address)?;
        self.check_readable(address, PTR_SIZE)?;

        // SAFETY: the range is mapped; the guard restores the previous
        // protection when it goes out of scope.
        let _guard = unsafe {
            region::protect_with_handle(address as *const u8, PTR_SIZE, Protection::READ_WRITE)
        }
        .map_err(|e| Error::MemoryWriteFailed {
            address,
            message: e.to_string(),
        })?;

        // SAFETY: aligned, mapped and writable for the lifetime of `_guard`.
        let slot = unsafe { AtomicUsize::from_ptr(address as *mut usize) };
        slot.store(value, Ordering::SeqCst);
        trace!("Wrote {:#x} to {:#x}", value, address);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_own_memory() {
        let data: Box<[u8; 8]> = Box::new([1, 2, 3, 4, 5, 6, 7, 8]);
        let memory = LocalMemory::new();
        let bytes = memory.read_bytes(data.as_ptr() as usize, 8).unwrap();
        assert_eq!(bytes, vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(
            memory.read_i32(data.as_ptr() as usize).unwrap(),
            i32::from_le_bytes([1, 2, 3, 4])
        );
    }

    #[test]
    fn test_null_read_fails() {
        let memory = LocalMemory::new();
        assert!(memory.read_bytes(0, 4).is_err());
        assert!(!memory.is_executable(0));
    }

    #[test]
    fn test_write_ptr_into_table() {
        let mut table: Box<[usize; 4]> = Box::new([0x10, 0x20, 0x30, 0x40]);
        let memory = LocalMemory::new();
        let slot = table.as_mut_ptr() as usize + PTR_SIZE * 2;

        memory.write_ptr(slot, 0xDEAD).unwrap();

        assert_eq!(memory.read_ptr(slot).unwrap(), 0xDEAD);
        assert_eq!(table[2], 0xDEAD);
        assert_eq!(table[1], 0x20);
    }

    #[test]
    fn test_write_ptr_rejects_unaligned() {
        let mut table: Box<[usize; 2]> = Box::new([0, 0]);
        let memory = LocalMemory::new();
        assert!(memory.write_ptr(table.as_mut_ptr() as usize + 1, 1).is_err());
    }

    #[test]
    fn test_code_is_executable() {
        let memory = LocalMemory::new();
        let function = test_code_is_executable as *const () as usize;
        assert!(memory.is_executable(function));
    }
}
