//! ELF loader hook
//!
//! The loader itself lives outside this subsystem; the boot crate
//! registers it here. The core only needs one capability: populate an
//! address space from a binary path and hand back the entry point. Until a
//! loader is registered a fixed-entry stub stands in, which is enough for
//! kernel-only bring-up.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::errors::*;
use crate::vm::AspaceId;

pub type ElfLoadFn = fn(path: &str, aspace: AspaceId) -> Result<u64, i64>;

/// Entry point the stub loader reports.
const STUB_ENTRY: u64 = 0x40_0000;

static LOADER: AtomicUsize = AtomicUsize::new(0);

/// Register the real loader. Later registrations replace earlier ones.
pub fn set_loader(f: ElfLoadFn) {
    LOADER.store(f as usize, Ordering::SeqCst);
}

/// Load `path` into `aspace`, returning the image entry point.
pub fn load(path: &str, aspace: AspaceId) -> Result<u64, i64> {
    if path.is_empty() {
        return Err(ERR_INVALID_ARGS);
    }
    let raw = LOADER.load(Ordering::SeqCst);
    if raw == 0 {
        crate::log_debug!("[ELF] no loader registered, stub entry for '{}'", path);
        return Ok(STUB_ENTRY);
    }
    let f: ElfLoadFn = unsafe { core::mem::transmute(raw) };
    f(path, aspace)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stub_loader_rejects_empty_path() {
        assert_eq!(load("", 1).unwrap_err(), ERR_INVALID_ARGS);
    }
}
