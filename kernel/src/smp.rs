//! SMP support: per-CPU records and cross-CPU kicks
//!
//! Every CPU has a slot tracking its current thread, its idle thread, the
//! thread whose FPU state lives in its registers, and a pending-preemption
//! flag set by the quantum timer or a reschedule IPI.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::thread::Tid;

pub const MAX_CPUS: usize = 64;

/// Boot CPU id; the global tick clock and system-wide timer events live
/// there.
pub const BOOT_CPU: u32 = 0;

struct CpuData {
    current_thread: AtomicU64,
    idle_thread: AtomicU64,
    fpu_thread: AtomicU64,
    active_aspace: AtomicU64,
    preempted: AtomicBool,
}

impl CpuData {
    const fn new() -> Self {
        Self {
            current_thread: AtomicU64::new(0),
            idle_thread: AtomicU64::new(0),
            fpu_thread: AtomicU64::new(0),
            active_aspace: AtomicU64::new(crate::vm::KERNEL_ASPACE),
            preempted: AtomicBool::new(false),
        }
    }
}

static CPUS: [CpuData; MAX_CPUS] = {
    const INIT: CpuData = CpuData::new();
    [INIT; MAX_CPUS]
};

static NUM_CPUS: AtomicU32 = AtomicU32::new(1);

// The executing CPU's id. On real hardware each AP stores its id here via
// `enter_cpu` during bring-up before touching the scheduler; hosted builds
// stay on CPU 0.
static CURRENT_CPU: AtomicU32 = AtomicU32::new(0);

pub fn init(num_cpus: u32) {
    let n = num_cpus.clamp(1, MAX_CPUS as u32);
    NUM_CPUS.store(n, Ordering::SeqCst);
    crate::log!("[SMP] {} cpu(s)", n);
}

pub fn num_cpus() -> u32 {
    NUM_CPUS.load(Ordering::Relaxed)
}

pub fn current_cpu_id() -> u32 {
    CURRENT_CPU.load(Ordering::Relaxed)
}

/// Mark the executing CPU. Called once per CPU during bring-up.
pub fn enter_cpu(cpu: u32) {
    CURRENT_CPU.store(cpu, Ordering::SeqCst);
}

pub fn current_thread(cpu: u32) -> Tid {
    CPUS[cpu as usize].current_thread.load(Ordering::Relaxed)
}

pub fn set_current_thread(cpu: u32, tid: Tid) {
    CPUS[cpu as usize].current_thread.store(tid, Ordering::SeqCst);
}

pub fn idle_thread(cpu: u32) -> Tid {
    CPUS[cpu as usize].idle_thread.load(Ordering::Relaxed)
}

pub fn set_idle_thread(cpu: u32, tid: Tid) {
    CPUS[cpu as usize].idle_thread.store(tid, Ordering::SeqCst);
}

/// Thread whose FPU state is live in this CPU's registers, 0 if none.
pub fn fpu_thread(cpu: u32) -> Tid {
    CPUS[cpu as usize].fpu_thread.load(Ordering::Relaxed)
}

pub fn set_fpu_thread(cpu: u32, tid: Tid) {
    CPUS[cpu as usize].fpu_thread.store(tid, Ordering::SeqCst);
}

/// Address space whose translation map is live on this CPU.
pub fn active_aspace(cpu: u32) -> crate::vm::AspaceId {
    CPUS[cpu as usize].active_aspace.load(Ordering::Relaxed)
}

pub fn set_active_aspace(cpu: u32, aspace: crate::vm::AspaceId) {
    CPUS[cpu as usize].active_aspace.store(aspace, Ordering::SeqCst);
}

pub fn set_preempted(cpu: u32) {
    CPUS[cpu as usize].preempted.store(true, Ordering::SeqCst);
}

pub fn take_preempted(cpu: u32) -> bool {
    CPUS[cpu as usize].preempted.swap(false, Ordering::SeqCst)
}

/// Ask another CPU to run its dispatcher. On hardware this is an APIC IPI;
/// the portable path just raises the flag the target polls at interrupt
/// exit.
pub fn send_reschedule_ipi(target_cpu: u32) {
    if target_cpu == current_cpu_id() {
        return;
    }
    set_preempted(target_cpu);
    crate::log_debug!("[SMP] reschedule ipi -> cpu {}", target_cpu);
}

/// Broadcast a TLB shootdown for an address-space change. The portable
/// fallback only logs; hardware wires this to INVLPG IPIs.
pub fn broadcast_tlb_invalidate() {
    crate::log_debug!("[SMP] tlb shootdown broadcast");
}
