//! NexOS kernel: process & thread subsystem
//!
//! The core that turns a set of CPUs into a multi-programmed system: the
//! priority run-queue scheduler with preemption, the thread lifecycle
//! including self-teardown over the death-stack pool, the process
//! lifecycle with job-control groups, sessions and orphan detection, and
//! the two-lock interrupt discipline underneath it all.
//!
//! Built as a library the boot crate links against. Production builds are
//! freestanding; unit tests run hosted with the architecture layer
//! stubbed.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod elf;
pub mod errors;
#[cfg(not(test))]
pub mod heap;
pub mod ioctx;
pub mod klock;
pub mod logger;
pub mod pgroup;
pub mod process;
pub mod rng;
pub mod sched;
pub mod sem;
pub mod serial;
pub mod signals;
pub mod smp;
pub mod syscall;
pub mod thread;
pub mod timer;
pub mod usercopy;
pub mod vm;

use spin::Once;

static INIT: Once<()> = Once::new();

/// Bring the subsystem up, in dependency order. Idempotent; the boot
/// crate calls it once the heap exists.
pub fn init(num_cpus: u32) {
    INIT.call_once(|| {
        serial::init();
        smp::init(num_cpus);
        timer::init();
        vm::init();
        process::init();
        thread::init(num_cpus);
        crate::log!("[KERNEL] process & thread subsystem online");
    });
}

#[cfg(test)]
pub(crate) mod testing {
    //! Shared scaffolding for the unit tests: one-time subsystem init, a
    //! lock serializing tests that touch the global tables, and teardown
    //! helpers that retire threads and processes the way the real exit
    //! paths leave them.

    use std::sync::{Mutex, MutexGuard};

    use crate::process;
    use crate::sched;
    use crate::sem;
    use crate::thread::{QueueTag, ThreadState, Tid, THREAD_SYS};
    use crate::vm;

    static LOCK: Mutex<()> = Mutex::new(());

    /// Serialize a test against every other global-state test, bringing
    /// the subsystem up (single CPU) on first use.
    pub fn lock() -> MutexGuard<'static, ()> {
        crate::init(1);
        LOCK.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    /// Retire a thread the way a completed exit leaves it: unlinked from
    /// its process, resources freed, record pooled on the dead queue.
    pub fn destroy_thread(tid: Tid) {
        let info = {
            let sys = THREAD_SYS.lock();
            sys.threads.get(&tid).map(|t| {
                (
                    t.proc,
                    t.retcode_sem,
                    t.kstack_region,
                    t.user_stack,
                    t.aspace,
                )
            })
        };
        let Some((pid, retsem, kregion, ustack, aspace)) = info else {
            return;
        };
        {
            let mut sys = THREAD_SYS.lock();
            if sys
                .threads
                .get(&tid)
                .map(|t| matches!(t.queue, QueueTag::Run(_)))
                .unwrap_or(false)
            {
                sched::remove_from_run_queue(&mut sys, tid);
            }
        }
        if let Some(pid) = pid {
            process::detach_thread(pid, tid);
        }
        let _ = sem::delete(retsem);
        if kregion != 0 {
            let _ = vm::delete_region(vm::KERNEL_ASPACE, kregion);
        }
        if let Some((region, _)) = ustack {
            let _ = vm::delete_region(aspace, region);
        }
        let mut sys = THREAD_SYS.lock();
        if let Some(mut rec) = sys.threads.remove(&tid) {
            rec.state = ThreadState::FreeOnResched;
            rec.queue = QueueTag::Dead;
            sys.dead_queue.push_back(rec);
        }
    }

    /// Drop every pooled record, so a test can count pool traffic from
    /// zero.
    pub fn drain_dead_queue() {
        THREAD_SYS.lock().dead_queue.clear();
    }

    /// Emulate a process dying through its main thread's exit: detach the
    /// main thread (marking `Death`), retire all threads, run the final
    /// teardown.
    pub fn kill_process_for_test(pid: process::Pid) {
        if let Some(main) = process::main_thread(pid) {
            let was_main = process::detach_exiting_thread(pid, main);
            assert!(was_main, "main thread is the process");
            destroy_thread(main);
        }
        for tid in process::thread_list(pid) {
            destroy_thread(tid);
        }
        let _ = process::teardown_dead_process(pid);
    }

    /// Tear a test process down without the exit-path ceremony.
    pub fn destroy_process(pid: process::Pid) {
        for tid in process::thread_list(pid) {
            destroy_thread(tid);
        }
        if let Some(main) = process::main_thread(pid) {
            destroy_thread(main);
        }
        {
            let mut sys = process::PROC_SYS.lock();
            if let Some(p) = sys.procs.get_mut(&pid) {
                p.state = process::ProcState::Death;
            } else {
                return;
            }
        }
        let _ = process::teardown_dead_process(pid);
    }

    /// Swap a thread's address space, returning the old one (usercopy
    /// tests point the current thread at a scratch space).
    pub fn swap_thread_aspace(tid: Tid, aspace: vm::AspaceId) -> vm::AspaceId {
        let mut sys = THREAD_SYS.lock();
        let t = sys.threads.get_mut(&tid).expect("thread");
        core::mem::replace(&mut t.aspace, aspace)
    }
}
