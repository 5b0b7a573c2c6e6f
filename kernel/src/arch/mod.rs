//! Architecture layer
//!
//! Everything the core needs from the hardware: register context save and
//! restore, the stack-switch primitive the exit path rides, FPU state, and
//! local interrupt control. The x86_64 backend is the real one; every entry
//! point has a portable fallback so the subsystem builds and unit-tests on
//! other hosts.

#[cfg(all(target_arch = "x86_64", not(test)))]
mod x86_64;
#[cfg(all(target_arch = "x86_64", not(test)))]
pub use x86_64::*;

#[cfg(any(not(target_arch = "x86_64"), test))]
mod portable;
#[cfg(any(not(target_arch = "x86_64"), test))]
pub use portable::*;

/// FXSAVE area. 512 bytes, 16-byte aligned as the instruction requires.
#[derive(Clone)]
#[repr(C, align(16))]
pub struct FpuArea(pub [u8; 512]);

impl FpuArea {
    pub const fn new() -> Self {
        FpuArea([0; 512])
    }
}
