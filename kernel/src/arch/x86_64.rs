//! x86_64 backend: context switch, stack switch, FPU, interrupt control.

use super::FpuArea;
use core::arch::{asm, naked_asm};
use x86_64::instructions::interrupts;

/// Saved CPU context for a thread. Only callee-saved registers plus the
/// stack and instruction pointers are kept; everything else is spilled by
/// the compiler around the switch call.
///
/// Field offsets are ABI for the assembly below, keep them in sync.
#[derive(Clone)]
#[repr(C)]
pub struct ThreadContext {
    pub rbx: u64, // 0x00
    pub rbp: u64, // 0x08
    pub r12: u64, // 0x10
    pub r13: u64, // 0x18
    pub r14: u64, // 0x20
    pub r15: u64, // 0x28
    pub rsp: u64, // 0x30
    pub rip: u64, // 0x38
    pub fpu: FpuArea,
}

impl ThreadContext {
    pub const fn new() -> Self {
        Self {
            rbx: 0,
            rbp: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rsp: 0,
            rip: 0,
            fpu: FpuArea::new(),
        }
    }
}

/// Conventional long-mode user selectors (RPL 3). The boot GDT lays user
/// code and data out at these slots.
const USER_CODE_SELECTOR: u64 = 0x1b;
const USER_DATA_SELECTOR: u64 = 0x23;

/// Prepare a freshly created thread's context so that the first dispatch
/// lands in `trampoline` with `entry` in R12 and `arg` in R13.
pub fn prepare_kernel_stack(ctx: &mut ThreadContext, stack_top: u64, trampoline: u64, entry: u64, arg: u64) {
    // Leave one dummy slot so RSP % 16 == 8 at trampoline entry, as after
    // a call.
    ctx.rsp = (stack_top & !0xf) - 8;
    ctx.rip = trampoline;
    ctx.r12 = entry;
    ctx.r13 = arg;
}

/// Switch from `from` to `to`, installing `new_map` as the active
/// translation map in the same primitive when it is non-zero. Interrupts
/// must be disabled; the incoming thread re-enables them.
#[inline]
pub unsafe fn switch_context(from: *mut ThreadContext, to: *const ThreadContext, new_map: u64) {
    switch_context_asm(from, to, new_map);
}

#[unsafe(naked)]
extern "C" fn switch_context_asm(_from: *mut ThreadContext, _to: *const ThreadContext, _new_map: u64) {
    naked_asm!(
        // RDI = from, RSI = to, RDX = new translation map (0 = keep)
        // Save callee-saved registers
        "mov [rdi + 0x00], rbx",
        "mov [rdi + 0x08], rbp",
        "mov [rdi + 0x10], r12",
        "mov [rdi + 0x18], r13",
        "mov [rdi + 0x20], r14",
        "mov [rdi + 0x28], r15",
        "mov [rdi + 0x30], rsp",
        // Save resume point as RIP
        "lea rax, [rip + 2f]",
        "mov [rdi + 0x38], rax",
        // Install the new address space, if any, before touching the new
        // stack so the stack switch and map switch are one unit.
        "test rdx, rdx",
        "jz 3f",
        "mov cr3, rdx",
        "3:",
        // Load new context
        "mov rbx, [rsi + 0x00]",
        "mov rbp, [rsi + 0x08]",
        "mov r12, [rsi + 0x10]",
        "mov r13, [rsi + 0x18]",
        "mov r14, [rsi + 0x20]",
        "mov r15, [rsi + 0x28]",
        "mov rsp, [rsi + 0x30]",
        "jmp [rsi + 0x38]",
        // Resume point for the saved context
        "2:",
        "ret",
    );
}

/// Move RSP to `stack_top` and call `func(arg)` there. Never actually
/// returns; the continuation must end in a dispatch that never switches
/// back. Typed non-diverging to match the portable fallback.
pub unsafe fn switch_stack_and_call(stack_top: u64, func: extern "C" fn(usize), arg: usize) {
    switch_stack_asm(stack_top & !0xf, func, arg);
}

#[unsafe(naked)]
extern "C" fn switch_stack_asm(_stack_top: u64, _func: extern "C" fn(usize), _arg: usize) {
    naked_asm!(
        // RDI = stack top, RSI = func, RDX = arg
        "mov rsp, rdi",
        "mov rdi, rdx",
        "call rsi",
        // The continuation never returns
        "ud2",
    );
}

/// FXSAVE the current FPU/SSE state into `area`.
pub unsafe fn fpu_save(area: *mut FpuArea) {
    asm!("fxsave64 [{}]", in(reg) area, options(nostack));
}

/// FXRSTOR the FPU/SSE state from `area`.
pub unsafe fn fpu_restore(area: *const FpuArea) {
    asm!("fxrstor64 [{}]", in(reg) area, options(nostack));
}

/// Drop to ring 3 at `entry` with the given user stack, passing `arg` in
/// RDI. Only returns if the process is torn down from under us, which the
/// caller treats as an exit.
pub unsafe fn enter_user_mode(entry: u64, user_sp: u64, arg: u64) -> i32 {
    asm!(
        "push {ss}",
        "push {sp}",
        "push 0x202", // RFLAGS: IF set
        "push {cs}",
        "push {ip}",
        "mov rdi, {arg}",
        "iretq",
        ss = in(reg) USER_DATA_SELECTOR,
        sp = in(reg) user_sp,
        cs = in(reg) USER_CODE_SELECTOR,
        ip = in(reg) entry,
        arg = in(reg) arg,
        options(noreturn),
    );
}

/// Disable local interrupts, returning whether they were enabled.
#[inline]
pub fn int_disable() -> bool {
    let enabled = interrupts::are_enabled();
    interrupts::disable();
    enabled
}

/// Restore the interrupt state saved by [`int_disable`].
#[inline]
pub fn int_restore(was_enabled: bool) {
    if was_enabled {
        interrupts::enable();
    }
}

#[inline]
pub fn int_enable() {
    interrupts::enable();
}

#[inline]
pub fn ints_enabled() -> bool {
    interrupts::are_enabled()
}

/// Idle the CPU until the next interrupt.
#[inline]
pub fn halt() {
    x86_64::instructions::hlt();
}
