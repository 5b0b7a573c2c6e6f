//! Portable fallbacks for non-x86_64 builds and hosted unit tests.
//!
//! The context and stack primitives keep all the bookkeeping but perform no
//! real register or stack switch; the interrupt flag is simulated so the
//! lock discipline stays observable.

use super::FpuArea;

#[derive(Clone)]
#[repr(C)]
pub struct ThreadContext {
    pub sp: u64,
    pub ip: u64,
    pub arg0: u64,
    pub arg1: u64,
    pub fpu: FpuArea,
}

impl ThreadContext {
    pub const fn new() -> Self {
        Self {
            sp: 0,
            ip: 0,
            arg0: 0,
            arg1: 0,
            fpu: FpuArea::new(),
        }
    }
}

pub fn prepare_kernel_stack(ctx: &mut ThreadContext, stack_top: u64, trampoline: u64, entry: u64, arg: u64) {
    ctx.sp = stack_top & !0xf;
    ctx.ip = trampoline;
    ctx.arg0 = entry;
    ctx.arg1 = arg;
}

pub unsafe fn switch_context(_from: *mut ThreadContext, _to: *const ThreadContext, _new_map: u64) {}

/// Calls the continuation on the current stack. Unlike the real primitive
/// this returns when the continuation does.
pub unsafe fn switch_stack_and_call(_stack_top: u64, func: extern "C" fn(usize), arg: usize) {
    func(arg);
}

pub unsafe fn fpu_save(_area: *mut FpuArea) {}

pub unsafe fn fpu_restore(_area: *const FpuArea) {}

pub unsafe fn enter_user_mode(_entry: u64, _user_sp: u64, _arg: u64) -> i32 {
    0
}

// Simulated local-interrupt flag. Per host thread under test so parallel
// tests do not fight over it; a single static otherwise.

#[cfg(test)]
std::thread_local! {
    static INT_ENABLED: core::cell::Cell<bool> = const { core::cell::Cell::new(true) };
}

#[cfg(test)]
fn int_flag() -> bool {
    INT_ENABLED.with(|f| f.get())
}

#[cfg(test)]
fn set_int_flag(v: bool) {
    INT_ENABLED.with(|f| f.set(v));
}

#[cfg(not(test))]
static INT_ENABLED: core::sync::atomic::AtomicBool = core::sync::atomic::AtomicBool::new(true);

#[cfg(not(test))]
fn int_flag() -> bool {
    INT_ENABLED.load(core::sync::atomic::Ordering::Relaxed)
}

#[cfg(not(test))]
fn set_int_flag(v: bool) {
    INT_ENABLED.store(v, core::sync::atomic::Ordering::Relaxed);
}

#[inline]
pub fn int_disable() -> bool {
    let enabled = int_flag();
    set_int_flag(false);
    enabled
}

#[inline]
pub fn int_restore(was_enabled: bool) {
    if was_enabled {
        set_int_flag(true);
    }
}

#[inline]
pub fn int_enable() {
    set_int_flag(true);
}

#[inline]
pub fn ints_enabled() -> bool {
    int_flag()
}

#[inline]
pub fn halt() {
    core::hint::spin_loop();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_disable_restore_nests() {
        assert!(ints_enabled());
        let outer = int_disable();
        assert!(outer);
        assert!(!ints_enabled());
        let inner = int_disable();
        assert!(!inner);
        int_restore(inner);
        assert!(!ints_enabled());
        int_restore(outer);
        assert!(ints_enabled());
    }
}
