use std::ffi::CStr;

use super::{ModuleInfo, ModuleMap};

/// Loaded-module metadata from the dynamic linker (`dladdr`).
#[derive(Debug, Default, Clone, Copy)]
pub struct DlModuleMap;

impl ModuleMap for DlModuleMap {
    fn module_containing(&self, address: usize) -> Option<ModuleInfo> {
        if address == 0 {
            return None;
        }

        // SAFETY: dladdr only inspects the linker's bookkeeping; `info` is
        // plain old data that it fills in on success.
        let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
        let found = unsafe { libc::dladdr(address as *const libc::c_void, &mut info) };
        if found == 0 || info.dli_fbase.is_null() {
            return None;
        }

        let path = if info.dli_fname.is_null() {
            String::new()
        } else {
            // SAFETY: non-null names from dladdr are NUL-terminated and live
            // as long as the module stays loaded.
            unsafe { CStr::from_ptr(info.dli_fname) }
                .to_string_lossy()
                .into_owned()
        };

        Some(ModuleInfo {
            base: info.dli_fbase as usize,
            path,
        })
    }
}
