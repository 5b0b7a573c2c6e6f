//! Run queues & dispatcher
//!
//! One FIFO per priority level over a single global queue set. Selection
//! scans the real-time band strictly, then the regular band with a
//! randomized skip that mixes near-equal priorities; idle threads are the
//! backstop and never sit on a queue.
//!
//! The dispatcher runs with the thread lock held and local interrupts
//! disabled, and keeps the lock across the context switch; the incoming
//! side releases it (either the tail of its own `resched` call or a new
//! thread's trampoline).

use crate::arch;
use crate::rng;
use crate::smp;
use crate::thread::{QueueTag, ThreadState, ThreadSys, Tid, THREAD_SYS};
use crate::thread::{IDLE_PRIORITY, LOWEST_PRIORITY, MAX_RT_PRIORITY, MIN_RT_PRIORITY, NUM_PRIORITIES};
use crate::timer;
use crate::vm;

/// Quantum armed before every dispatch.
pub const QUANTUM_MS: u64 = 10;

/// A regular-band level is taken immediately when a 15-bit draw exceeds
/// this, roughly five times out of eight.
const SKIP_THRESHOLD: u16 = 0x3000;

/// Tail-insert a ready thread on the queue of its priority.
pub(crate) fn enqueue_run_queue(sys: &mut ThreadSys, tid: Tid) {
    let t = sys.threads.get_mut(&tid).expect("enqueue of unknown thread");
    assert_eq!(t.queue, QueueTag::None, "thread {:#x} already queued", tid);
    debug_assert_eq!(t.state, ThreadState::Ready);
    let prio = t.priority.clamp(IDLE_PRIORITY, NUM_PRIORITIES - 1);
    t.queue = QueueTag::Run(prio);
    sys.run_queues[prio as usize].push_back(tid);
}

/// Head-remove from one level.
fn dequeue_level(sys: &mut ThreadSys, prio: i32) -> Option<Tid> {
    let tid = sys.run_queues[prio as usize].pop_front()?;
    let t = sys.threads.get_mut(&tid).expect("queued thread not in index");
    debug_assert_eq!(t.queue, QueueTag::Run(prio));
    t.queue = QueueTag::None;
    Some(tid)
}

/// Pull a thread out of the middle of its queue (priority change,
/// suspension of a ready thread).
pub(crate) fn remove_from_run_queue(sys: &mut ThreadSys, tid: Tid) {
    let t = sys.threads.get_mut(&tid).expect("remove of unknown thread");
    let prio = match t.queue {
        QueueTag::Run(p) => p,
        other => panic!("thread {:#x} not on a run queue ({:?})", tid, other),
    };
    t.queue = QueueTag::None;
    let q = &mut sys.run_queues[prio as usize];
    match q.iter().position(|&x| x == tid) {
        Some(i) => {
            q.remove(i);
        }
        None => panic!("run queue {} lost thread {:#x}", prio, tid),
    }
}

/// Wake helper shared by the signal and semaphore layers: make a thread
/// runnable whatever it was doing.
pub(crate) fn make_ready(sys: &mut ThreadSys, tid: Tid) {
    let t = match sys.threads.get_mut(&tid) {
        Some(t) => t,
        None => return,
    };
    match t.state {
        ThreadState::Suspended | ThreadState::Waiting | ThreadState::Birth => {
            t.state = ThreadState::Ready;
            t.next_state = ThreadState::Ready;
            enqueue_run_queue(sys, tid);
        }
        ThreadState::Running => {
            // Not yet through its block; cancel the pending state so its
            // in-flight dispatch keeps it runnable.
            t.next_state = ThreadState::Ready;
        }
        ThreadState::Ready | ThreadState::FreeOnResched => {}
    }
}

/// Selection algorithm. Called with the thread lock held.
pub(crate) fn select_next_thread(sys: &mut ThreadSys, cpu: u32) -> Tid {
    // Real-time band: strict priority, no mixing.
    for prio in (MIN_RT_PRIORITY..=MAX_RT_PRIORITY).rev() {
        if let Some(tid) = dequeue_level(sys, prio) {
            return tid;
        }
    }

    // Regular band: mostly-highest-first, with a randomized skip standing
    // in for aging. The first non-empty level seen is the fallback when
    // every level gets skipped.
    let mut fallback: Option<i32> = None;
    for prio in (LOWEST_PRIORITY..MIN_RT_PRIORITY).rev() {
        if sys.run_queues[prio as usize].is_empty() {
            continue;
        }
        if rng::next_u15() > SKIP_THRESHOLD {
            return dequeue_level(sys, prio).expect("non-empty level");
        }
        if fallback.is_none() {
            fallback = Some(prio);
        }
    }
    if let Some(prio) = fallback {
        return dequeue_level(sys, prio).expect("fallback level");
    }

    let idle = smp::idle_thread(cpu);
    if idle == 0 {
        panic!("dispatcher: no idle thread for cpu {}", cpu);
    }
    idle
}

/// The dispatcher. Settles the outgoing thread per its `next_state`,
/// selects the next runnable thread, arms the quantum and performs the
/// switch.
pub fn resched() {
    let ints = arch::int_disable();
    let sys = THREAD_SYS.lock_raw();
    resched_locked(sys);
    arch::int_restore(ints);
}

/// Dispatch with the thread lock already held and interrupts disabled.
/// Consumes the guard: when a switch happens the lock is held across it
/// and released on the incoming side.
pub(crate) fn resched_locked(mut sys: spin::MutexGuard<'static, ThreadSys>) {
    let cpu = smp::current_cpu_id();
    let old_tid = smp::current_thread(cpu);
    let idle_tid = smp::idle_thread(cpu);
    let now = timer::now_us();

    // Settle the outgoing thread's time bucket and place it per its
    // intended state.
    let mut dying = false;
    {
        let old = sys.threads.get_mut(&old_tid).expect("dispatcher: no current thread");
        let delta = now.saturating_sub(old.last_time_us);
        if old.in_kernel {
            old.kernel_time_us += delta;
        } else {
            old.user_time_us += delta;
        }
        old.last_time_us = now;
        old.cpu = None;
        match old.next_state {
            ThreadState::Ready => {
                old.state = ThreadState::Ready;
            }
            ThreadState::Waiting => {
                old.state = ThreadState::Waiting;
            }
            ThreadState::Suspended => {
                old.state = ThreadState::Suspended;
            }
            ThreadState::FreeOnResched => {
                old.state = ThreadState::FreeOnResched;
                dying = true;
            }
            s => panic!("dispatcher: bad next_state {:?}", s),
        }
        old.next_state = ThreadState::Ready;
    }
    if !dying && sys.threads[&old_tid].state == ThreadState::Ready && old_tid != idle_tid {
        enqueue_run_queue(&mut sys, old_tid);
    }

    // A dying thread's record moves to the dead queue; its id leaves the
    // index. Safe to take its context pointer below: the thread lock is
    // held until the switch is complete.
    let from: *mut arch::ThreadContext = if dying {
        if smp::fpu_thread(cpu) == old_tid {
            smp::set_fpu_thread(cpu, 0);
        }
        let mut rec = sys.threads.remove(&old_tid).expect("dying thread");
        rec.queue = QueueTag::Dead;
        rec.fpu_cpu = None;
        sys.dead_queue.push_back(rec);
        &mut sys.dead_queue.back_mut().unwrap().context
    } else {
        &mut sys.threads.get_mut(&old_tid).unwrap().context
    };

    let next_tid = select_next_thread(&mut sys, cpu);

    // Arm the quantum one-shot. If the timer already fired (we were
    // preempted) there is no pending event to cancel.
    let _ = smp::take_preempted(cpu);
    timer::set_quantum(cpu, QUANTUM_MS);

    fpu_switch(&mut sys, cpu, if dying { None } else { Some(old_tid) }, next_tid);

    let (to, new_aspace): (*const arch::ThreadContext, _) = {
        let next = sys.threads.get_mut(&next_tid).expect("selected thread not in index");
        next.state = ThreadState::Running;
        next.next_state = ThreadState::Ready;
        next.cpu = Some(cpu);
        next.last_time_us = now;
        (&next.context, next.aspace)
    };
    smp::set_current_thread(cpu, next_tid);

    if next_tid == old_tid {
        return; // guard drops, lock released
    }

    let new_map = if smp::active_aspace(cpu) != new_aspace {
        smp::set_active_aspace(cpu, new_aspace);
        vm::translation_map(new_aspace)
    } else {
        0
    };

    #[cfg(feature = "sched-trace-verbose")]
    crate::serial_println!("[SCHED] cpu{} {:#x} -> {:#x}", cpu, old_tid, next_tid);

    // Hold the lock across the switch; whoever resumes on this CPU
    // releases it (the tail below, or a new thread's trampoline).
    core::mem::forget(sys);
    unsafe {
        arch::switch_context(from, to, new_map);
        THREAD_SYS.unlock_raw();
    }
}

/// Lazy FPU handoff. The outgoing thread's state stays live in the
/// registers; it is spilled only when some other thread needs this CPU's
/// FPU.
fn fpu_switch(sys: &mut ThreadSys, cpu: u32, old_tid: Option<Tid>, next_tid: Tid) {
    if let Some(old_tid) = old_tid {
        if let Some(old) = sys.threads.get_mut(&old_tid) {
            if smp::fpu_thread(cpu) == old_tid {
                old.fpu_cpu = Some(cpu);
                old.fpu_saved = false;
            }
            // Unsaved state must still be owned by the CPU the record
            // points at.
            debug_assert!(
                old.fpu_saved
                    || old.fpu_cpu.is_none()
                    || smp::fpu_thread(old.fpu_cpu.unwrap()) == old_tid,
                "fpu state of {:#x} neither saved nor live",
                old_tid
            );
        }
    }

    let owner = smp::fpu_thread(cpu);
    if owner == next_tid {
        return;
    }
    if owner != 0 {
        if let Some(prev) = sys.threads.get_mut(&owner) {
            unsafe { arch::fpu_save(&mut prev.context.fpu) };
            prev.fpu_saved = true;
            prev.fpu_cpu = None;
        }
    }
    let next = match sys.threads.get_mut(&next_tid) {
        Some(t) => t,
        None => return,
    };
    if next.fpu_saved {
        unsafe { arch::fpu_restore(&next.context.fpu) };
    }
    next.fpu_cpu = Some(cpu);
    next.fpu_saved = false;
    smp::set_fpu_thread(cpu, next_tid);
}

/// Quantum-timer tick entry, called from the per-CPU timer interrupt.
/// Returns what the interrupt tail should do.
pub fn preempt_hook(cpu: u32) -> timer::IntDisposition {
    timer::tick(cpu)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use crate::thread::{self, DEFAULT_PRIORITY};

    extern "C" fn nop_entry(_arg: u64) -> i32 {
        0
    }

    fn spawn_ready(name: &str, prio: i32) -> Tid {
        let tid = thread::create_kernel_thread(name, nop_entry, 0).unwrap();
        thread::set_thread_priority(tid, prio).unwrap();
        thread::resume_thread(tid).unwrap();
        tid
    }

    fn unselect(tid: Tid) {
        // Put a selected thread back to rest so destroy can reap it.
        let mut sys = THREAD_SYS.lock();
        if let Some(t) = sys.threads.get_mut(&tid) {
            t.state = ThreadState::Suspended;
            t.next_state = ThreadState::Ready;
            t.cpu = None;
        }
    }

    #[test]
    fn test_dispatch_is_fifo_within_level() {
        let _g = testing::lock();
        let a = spawn_ready("t_fifo_a", 10);
        let b = spawn_ready("t_fifo_b", 10);
        let c = spawn_ready("t_fifo_c", 10);
        {
            let mut sys = THREAD_SYS.lock();
            // Single non-empty regular level: selection is FIFO whatever
            // the skip draw does, the fallback lands on the same level.
            let first = select_next_thread(&mut sys, 0);
            let second = select_next_thread(&mut sys, 0);
            let third = select_next_thread(&mut sys, 0);
            assert_eq!((first, second, third), (a, b, c));
        }
        for t in [a, b, c] {
            unselect(t);
            testing::destroy_thread(t);
        }
    }

    #[test]
    fn test_rt_band_preempts_regular() {
        let _g = testing::lock();
        let reg = spawn_ready("t_reg", 10);
        let rt = spawn_ready("t_rt", MAX_RT_PRIORITY);
        {
            let mut sys = THREAD_SYS.lock();
            let first = select_next_thread(&mut sys, 0);
            assert_eq!(first, rt, "rt thread must be picked before regular");
            let second = select_next_thread(&mut sys, 0);
            assert_eq!(second, reg);
        }
        for t in [reg, rt] {
            unselect(t);
            testing::destroy_thread(t);
        }
    }

    #[test]
    fn test_empty_queues_select_idle() {
        let _g = testing::lock();
        let mut sys = THREAD_SYS.lock();
        let idle = smp::idle_thread(0);
        assert_eq!(select_next_thread(&mut sys, 0), idle);
    }

    #[test]
    fn test_higher_regular_level_usually_wins() {
        let _g = testing::lock();
        rng::seed(12345);
        let hi = spawn_ready("t_hi", 20);
        let lo = spawn_ready("t_lo", 5);
        {
            let mut sys = THREAD_SYS.lock();
            let first = select_next_thread(&mut sys, 0);
            let second = select_next_thread(&mut sys, 0);
            // Whatever the draws did, both run and the set is exact.
            assert_eq!(
                [first, second].iter().copied().collect::<std::collections::BTreeSet<_>>(),
                [hi, lo].iter().copied().collect::<std::collections::BTreeSet<_>>()
            );
        }
        for t in [hi, lo] {
            unselect(t);
            testing::destroy_thread(t);
        }
    }

    #[test]
    fn test_resched_runs_ready_thread_and_requeues_current() {
        let _g = testing::lock();
        let cpu = smp::current_cpu_id();
        let idle = smp::idle_thread(cpu);
        let t = spawn_ready("t_dispatch", DEFAULT_PRIORITY);
        resched();
        // The portable switch is a no-op, but all bookkeeping happened:
        // the ready thread is now Running and current on this CPU.
        assert_eq!(smp::current_thread(cpu), t);
        {
            let sys = THREAD_SYS.lock();
            assert_eq!(sys.threads[&t].state, ThreadState::Running);
            assert_eq!(sys.threads[&t].cpu, Some(cpu));
            // The idle thread was outgoing and stays off the queues.
            assert_eq!(sys.threads[&idle].state, ThreadState::Ready);
            assert_eq!(sys.threads[&idle].queue, QueueTag::None);
        }
        // Switch back to idle: the running thread suspends itself.
        {
            let mut sys = THREAD_SYS.lock();
            sys.threads.get_mut(&t).unwrap().next_state = ThreadState::Suspended;
        }
        resched();
        assert_eq!(smp::current_thread(cpu), idle);
        {
            let sys = THREAD_SYS.lock();
            assert_eq!(sys.threads[&t].state, ThreadState::Suspended);
            assert_eq!(sys.threads[&idle].state, ThreadState::Running);
        }
        testing::destroy_thread(t);
    }

    #[test]
    fn test_resched_arms_quantum() {
        let _g = testing::lock();
        let cpu = smp::current_cpu_id();
        timer::cancel_quantum(cpu);
        resched();
        // Quantum armed: QUANTUM_MS ticks later the CPU is preempted.
        for _ in 0..QUANTUM_MS {
            timer::tick(cpu);
        }
        assert!(smp::take_preempted(cpu));
        timer::cancel_quantum(cpu);
    }

    #[test]
    fn test_dying_thread_moves_to_dead_queue() {
        let _g = testing::lock();
        let cpu = smp::current_cpu_id();
        let idle = smp::idle_thread(cpu);
        let t = spawn_ready("t_dying", DEFAULT_PRIORITY);
        resched();
        assert_eq!(smp::current_thread(cpu), t);
        {
            let mut sys = THREAD_SYS.lock();
            sys.threads.get_mut(&t).unwrap().next_state = ThreadState::FreeOnResched;
        }
        let dead_before = THREAD_SYS.lock().dead_queue.len();
        resched();
        assert_eq!(smp::current_thread(cpu), idle);
        {
            let sys = THREAD_SYS.lock();
            assert!(!sys.threads.contains_key(&t), "dying thread must leave the index");
            assert_eq!(sys.dead_queue.len(), dead_before + 1);
            let rec = sys.dead_queue.back().unwrap();
            assert_eq!(rec.state, ThreadState::FreeOnResched);
            assert_eq!(rec.queue, QueueTag::Dead);
        }
        // Leave the pooled record for reuse; detach its process link.
        crate::process::detach_thread(crate::process::KERNEL_PID, t);
    }

    #[test]
    fn test_time_accounting_is_monotonic() {
        let _g = testing::lock();
        let cpu = smp::current_cpu_id();
        let total = |sys: &ThreadSys| -> u64 {
            sys.threads.values().map(|t| t.user_time_us + t.kernel_time_us).sum()
        };
        let before = total(&THREAD_SYS.lock());
        for _ in 0..3 {
            timer::tick(smp::BOOT_CPU);
        }
        resched();
        let after = total(&THREAD_SYS.lock());
        assert!(after >= before);
        let _ = cpu;
    }
}
