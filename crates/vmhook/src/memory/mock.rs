//! In-memory stand-in for process memory used by unit tests.

use std::cell::RefCell;

use super::{PTR_SIZE, ReadMemory, WriteMemory, check_ptr_alignment};
use crate::error::{Error, Result};

struct Segment {
    base: usize,
    bytes: RefCell<Vec<u8>>,
    executable: bool,
}

impl Segment {
    fn contains(&self, address: usize, size: usize) -> bool {
        let len = self.bytes.borrow().len();
        address >= self.base && address.saturating_add(size) <= self.base + len
    }
}

/// Sparse set of memory segments. Reads outside every segment fail.
pub struct MockMemory {
    segments: Vec<Segment>,
    writes: RefCell<Vec<(usize, usize)>>,
}

impl MockMemory {
    pub fn builder() -> MockMemoryBuilder {
        MockMemoryBuilder::default()
    }

    fn segment(&self, address: usize, size: usize) -> Option<&Segment> {
        self.segments.iter().find(|s| s.contains(address, size))
    }

    /// Every `write_ptr` performed so far, in order.
    pub fn writes(&self) -> Vec<(usize, usize)> {
        self.writes.borrow().clone()
    }

    /// Overwrite bytes directly, bypassing write accounting. Simulates the
    /// host mutating its own memory.
    pub fn poke_ptr(&self, address: usize, value: usize) {
        let segment = self
            .segment(address, PTR_SIZE)
            .expect("poke outside mock segments");
        let offset = address - segment.base;
        segment.bytes.borrow_mut()[offset..offset + PTR_SIZE]
            .copy_from_slice(&value.to_le_bytes());
    }
}

impl ReadMemory for MockMemory {
    fn read_bytes(&self, address: usize, size: usize) -> Result<Vec<u8>> {
        let segment = self
            .segment(address, size)
            .ok_or_else(|| Error::MemoryReadFailed {
                address,
                message: "unmapped".to_string(),
            })?;
        let offset = address - segment.base;
        Ok(segment.bytes.borrow()[offset..offset + size].to_vec())
    }

    fn is_executable(&self, address: usize) -> bool {
        self.segment(address, 1).is_some_and(|s| s.executable)
    }
}

impl WriteMemory for MockMemory {
    fn write_ptr(&self, address: usize, value: usize) -> Result<()> {
        check_ptr_alignment(address)?;
        if self.segment(address, PTR_SIZE).is_none() {
            return Err(Error::MemoryWriteFailed {
                address,
                message: "unmapped".to_string(),
            });
        }
        self.poke_ptr(address, value);
        self.writes.borrow_mut().push((address, value));
        Ok(())
    }
}

#[derive(Default)]
pub struct MockMemoryBuilder {
    segments: Vec<Segment>,
}

impl MockMemoryBuilder {
    /// Readable, writable data segment of `len` zero bytes.
    pub fn data(mut self, base: usize, len: usize) -> Self {
        self.segments.push(Segment {
            base,
            bytes: RefCell::new(vec![0; len]),
            executable: false,
        });
        self
    }

    /// Executable segment filled with `int3`.
    pub fn code(mut self, base: usize, len: usize) -> Self {
        self.segments.push(Segment {
            base,
            bytes: RefCell::new(vec![0xCC; len]),
            executable: true,
        });
        self
    }

    /// Copy `bytes` into an already declared segment.
    pub fn bytes_at(self, address: usize, bytes: &[u8]) -> Self {
        let segment = self
            .segments
            .iter()
            .find(|s| s.contains(address, bytes.len()))
            .expect("bytes_at outside declared segments");
        let offset = address - segment.base;
        segment.bytes.borrow_mut()[offset..offset + bytes.len()].copy_from_slice(bytes);
        self
    }

    pub fn i32_at(self, address: usize, value: i32) -> Self {
        self.bytes_at(address, &value.to_le_bytes())
    }

    pub fn ptr_at(self, address: usize, value: usize) -> Self {
        self.bytes_at(address, &value.to_le_bytes())
    }

    pub fn build(self) -> MockMemory {
        MockMemory {
            segments: self.segments,
            writes: RefCell::new(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write_roundtrip_through_segments() {
        let memory = MockMemory::builder()
            .data(0x1000, 0x100)
            .i32_at(0x1010, -8)
            .build();

        assert_eq!(memory.read_i32(0x1010).unwrap(), -8);
        memory.write_ptr(0x1020, 0xABCD).unwrap();
        assert_eq!(memory.read_ptr(0x1020).unwrap(), 0xABCD);
        assert_eq!(memory.writes(), vec![(0x1020, 0xABCD)]);
    }

    #[test]
    fn test_unmapped_access_fails() {
        let memory = MockMemory::builder().data(0x1000, 0x10).build();
        assert!(memory.read_bytes(0x0FFF, 2).is_err());
        assert!(memory.read_bytes(0x100F, 2).is_err());
        assert!(memory.write_ptr(0x2000, 1).is_err());
    }

    #[test]
    fn test_executable_flag() {
        let memory = MockMemory::builder()
            .code(0x4000, 0x10)
            .data(0x5000, 0x10)
            .build();
        assert!(memory.is_executable(0x4008));
        assert!(!memory.is_executable(0x5008));
        assert!(!memory.is_executable(0x6000));
    }
}
