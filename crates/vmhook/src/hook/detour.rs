use std::ffi::c_void;

use iced_x86::{
    BlockEncoder, BlockEncoderOptions, Decoder, DecoderOptions, FlowControl, Instruction,
    InstructionBlock,
};
use region::Protection;
use tracing::trace;

use super::CodePatcher;
use crate::error::HookError;
use crate::memory::{LocalMemory, ReadMemory};

#[cfg(target_arch = "x86_64")]
const BITNESS: u32 = 64;
#[cfg(target_arch = "x86")]
const BITNESS: u32 = 32;

/// Bytes decoded at the target when looking for whole instructions to move.
const PROLOGUE_WINDOW: usize = 32;
const REL_JUMP_LEN: usize = 5;
/// Offset of the relocated prologue inside a detour page; the relay jump
/// to the replacement sits in front of it.
const TRAMPOLINE_OFFSET: usize = 16;
/// Step between placement hints when looking for a page near the target.
const NEAR_STEP: usize = 0x10_0000;
const NEAR_REACH: usize = 0x7FF0_0000;
const NOP: u8 = 0x90;

/// Patches routines of the current process with jump detours.
///
/// Every detour gets one page near its target holding a relay jump to the
/// replacement and a trampoline: the instructions overwritten at the target,
/// relocated with their branches and RIP-relative operands fixed up,
/// followed by a jump back into the target. The target itself only receives
/// a 5-byte relative jump to the relay. The trampoline is what
/// [`CodePatcher::redirect`] returns. Detours are never removed.
pub struct DetourPatcher {
    memory: LocalMemory,
    page_size: usize,
    pages: Vec<usize>,
}

impl DetourPatcher {
    /// # Safety
    ///
    /// Every `(target, replacement)` pair later passed to `redirect` must
    /// name routines with identical signatures and calling conventions, and
    /// no thread may be executing `target` while it is patched.
    pub unsafe fn new() -> Self {
        Self {
            memory: LocalMemory::new(),
            page_size: region::page::size(),
            pages: Vec::new(),
        }
    }

    /// Number of detour pages mapped so far.
    pub fn detour_count(&self) -> usize {
        self.pages.len()
    }

    fn read_prologue(&self, target: usize) -> Result<Vec<u8>, HookError> {
        if let Ok(code) = self.memory.read_bytes(target, PROLOGUE_WINDOW) {
            return Ok(code);
        }
        let to_page_end = self.page_size - target % self.page_size;
        self.memory
            .read_bytes(target, to_page_end.min(PROLOGUE_WINDOW))
            .map_err(|e| HookError::invalid(target, e.to_string()))
    }

    fn map_near(&self, target: usize) -> Result<usize, HookError> {
        if cfg!(target_arch = "x86") {
            return map_page(0, self.page_size)
                .ok_or_else(|| HookError::invalid(target, "cannot map a detour page"));
        }

        let mut distance = NEAR_STEP;
        while distance < NEAR_REACH {
            let hints = [target.checked_sub(distance), target.checked_add(distance)];
            for hint in hints.into_iter().flatten() {
                let hint = hint & !(self.page_size - 1);
                let Some(page) = map_page(hint, self.page_size) else {
                    continue;
                };
                if page.abs_diff(target) < NEAR_REACH {
                    return Ok(page);
                }
                unmap_page(page, self.page_size);
            }
            distance += NEAR_STEP;
        }
        Err(HookError::invalid(target, "no free page within jump range"))
    }

    /// Fill a freshly mapped detour page and make it executable.
    fn build_page(
        &self,
        page: usize,
        target: usize,
        replacement: usize,
        prologue: &[Instruction],
        stolen: usize,
    ) -> Result<(), HookError> {
        let relay = jump(page, replacement);
        let trampoline = page + TRAMPOLINE_OFFSET;

        let mut body = BlockEncoder::encode(
            BITNESS,
            InstructionBlock::new(prologue, trampoline as u64),
            BlockEncoderOptions::NONE,
        )
        .map_err(|e| HookError::invalid(target, format!("prologue cannot be relocated: {}", e)))?
        .code_buffer;
        body.extend(jump(trampoline + body.len(), target + stolen));

        if relay.len() > TRAMPOLINE_OFFSET || TRAMPOLINE_OFFSET + body.len() > self.page_size {
            return Err(HookError::invalid(target, "relocated prologue does not fit its page"));
        }

        // SAFETY: the page was mapped read-write by `map_page` and is not
        // yet reachable from any code.
        unsafe {
            std::ptr::copy_nonoverlapping(relay.as_ptr(), page as *mut u8, relay.len());
            std::ptr::copy_nonoverlapping(body.as_ptr(), trampoline as *mut u8, body.len());
            region::protect(page as *const u8, self.page_size, Protection::READ_EXECUTE)
        }
        .map_err(|e| HookError::MemoryProtection {
            address: page,
            message: e.to_string(),
        })
    }

    fn write_entry(&self, target: usize, patch: &[u8]) -> Result<(), HookError> {
        // SAFETY: the range was read as code above; the guard restores the
        // previous protection when it goes out of scope.
        let _guard = unsafe {
            region::protect_with_handle(
                target as *const u8,
                patch.len(),
                Protection::READ_WRITE_EXECUTE,
            )
        }
        .map_err(|e| HookError::MemoryProtection {
            address: target,
            message: e.to_string(),
        })?;

        // SAFETY: writable for the lifetime of `_guard`; the caller of
        // `DetourPatcher::new` guarantees nothing executes it meanwhile.
        unsafe { std::ptr::copy_nonoverlapping(patch.as_ptr(), target as *mut u8, patch.len()) };
        Ok(())
    }
}

impl CodePatcher for DetourPatcher {
    fn redirect(&mut self, target: usize, replacement: usize) -> Result<usize, HookError> {
        let code = self.read_prologue(target)?;
        let prologue = decode_prologue(&code, target, REL_JUMP_LEN)?;
        let stolen: usize = prologue.iter().map(Instruction::len).sum();

        let page = self.map_near(target)?;
        let mut entry = jump(target, page);
        if entry.len() != REL_JUMP_LEN {
            unmap_page(page, self.page_size);
            return Err(HookError::invalid(target, "detour page out of jump range"));
        }
        if let Err(e) = self.build_page(page, target, replacement, &prologue, stolen) {
            unmap_page(page, self.page_size);
            return Err(e);
        }

        entry.resize(stolen, NOP);
        self.write_entry(target, &entry)?;
        self.pages.push(page);

        let original = page + TRAMPOLINE_OFFSET;
        trace!(
            "Detour {:#x} -> {:#x} enabled ({} bytes moved), trampoline at {:#x}",
            target, replacement, stolen, original
        );
        Ok(original)
    }

    fn is_executable(&self, address: usize) -> bool {
        self.memory.is_executable(address)
    }
}

/// Whole instructions at the start of `code` covering at least `needed` bytes.
fn decode_prologue(code: &[u8], target: usize, needed: usize) -> Result<Vec<Instruction>, HookError> {
    let mut decoder = Decoder::with_ip(BITNESS, code, target as u64, DecoderOptions::NONE);
    let mut prologue = Vec::new();
    let mut covered = 0;

    while covered < needed {
        if !decoder.can_decode() {
            return Err(HookError::invalid(target, "prologue runs past readable code"));
        }
        let instruction = decoder.decode();
        if instruction.is_invalid() {
            return Err(HookError::invalid(
                target,
                format!("undecodable instruction at +{:#x}", covered),
            ));
        }
        covered += instruction.len();
        let leaves = matches!(
            instruction.flow_control(),
            FlowControl::Return
                | FlowControl::UnconditionalBranch
                | FlowControl::IndirectBranch
                | FlowControl::Interrupt
        );
        prologue.push(instruction);
        if leaves && covered < needed {
            return Err(HookError::invalid(
                target,
                format!("routine is {} bytes, {} needed for a jump", covered, needed),
            ));
        }
    }
    Ok(prologue)
}

/// `jmp rel32` when `to` is reachable from `from`, else `jmp [rip+0]`
/// followed by the absolute address.
fn jump(from: usize, to: usize) -> Vec<u8> {
    if let Some(rel) = rel32(from + REL_JUMP_LEN, to) {
        let mut code = vec![0xE9];
        code.extend_from_slice(&rel.to_le_bytes());
        return code;
    }
    let mut code = vec![0xFF, 0x25, 0, 0, 0, 0];
    code.extend_from_slice(&(to as u64).to_le_bytes());
    code
}

#[cfg(target_arch = "x86")]
fn rel32(next: usize, to: usize) -> Option<i32> {
    Some(to.wrapping_sub(next) as i32)
}

#[cfg(target_arch = "x86_64")]
fn rel32(next: usize, to: usize) -> Option<i32> {
    i32::try_from(to as i64 - next as i64).ok()
}

fn map_page(hint: usize, size: usize) -> Option<usize> {
    // SAFETY: anonymous private mapping; `hint` is only a placement hint.
    let page = unsafe {
        libc::mmap(
            hint as *mut c_void,
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    (page != libc::MAP_FAILED).then_some(page as usize)
}

fn unmap_page(page: usize, size: usize) {
    // SAFETY: `page` came from `map_page` and was never published.
    unsafe { libc::munmap(page as *mut c_void, size) };
}
