//! Signals
//!
//! Thread-directed signals with per-thread pending/blocked masks and
//! actions. This layer is the single owner of stopped-vs-runnable state:
//! STOP and CONT are how suspension happens, KILLTHR is how threads die
//! from outside, and everything else funnels through `handle_signals` on
//! the way back to user mode.

use crate::errors::*;
use crate::process;
use crate::sched;
use crate::sem;
use crate::thread::{self, QueueTag, ThreadState, ThreadSys, Tid, THREAD_SYS};
use crate::timer;

/// Signal numbers.
pub mod sig {
    pub const SIGHUP: u32 = 1;
    pub const SIGINT: u32 = 2;
    pub const SIGQUIT: u32 = 3;
    pub const SIGILL: u32 = 4;
    pub const SIGTRAP: u32 = 5;
    pub const SIGABRT: u32 = 6;
    pub const SIGBUS: u32 = 7;
    pub const SIGFPE: u32 = 8;
    pub const SIGKILL: u32 = 9;
    pub const SIGUSR1: u32 = 10;
    pub const SIGSEGV: u32 = 11;
    pub const SIGUSR2: u32 = 12;
    pub const SIGPIPE: u32 = 13;
    pub const SIGALRM: u32 = 14;
    pub const SIGTERM: u32 = 15;
    pub const SIGSTKFLT: u32 = 16;
    pub const SIGCHLD: u32 = 17;
    pub const SIGCONT: u32 = 18;
    pub const SIGSTOP: u32 = 19;
    pub const SIGTSTP: u32 = 20;
    pub const SIGTTIN: u32 = 21;
    pub const SIGTTOU: u32 = 22;
    pub const SIGURG: u32 = 23;
    pub const SIGXCPU: u32 = 24;
    pub const SIGXFSZ: u32 = 25;
    pub const SIGVTALRM: u32 = 26;
    pub const SIGPROF: u32 = 27;
    pub const SIGWINCH: u32 = 28;
    pub const SIGIO: u32 = 29;
    pub const SIGPWR: u32 = 30;
    pub const SIGSYS: u32 = 31;
    /// Thread-directed kill; ends one thread, not the process.
    pub const SIGKILLTHR: u32 = 32;

    pub const SIG_COUNT: usize = 32;
}

/// Defer the dispatch; the caller reschedules once at the end of its
/// fan-out.
pub const SIG_FLAG_NO_RESCHED: u32 = 1;

pub const SIG_DFL: u64 = 0;
pub const SIG_IGN: u64 = 1;

/// sigprocmask `how` values.
pub const SIG_BLOCK: u32 = 0;
pub const SIG_UNBLOCK: u32 = 1;
pub const SIG_SETMASK: u32 = 2;

#[derive(Debug, Clone, Copy)]
pub struct SigAction {
    pub handler: u64,
    pub mask: u32,
    pub flags: u32,
}

impl SigAction {
    pub const DEFAULT: SigAction = SigAction {
        handler: SIG_DFL,
        mask: 0,
        flags: 0,
    };
}

#[inline]
fn sig_bit(signum: u32) -> u32 {
    1 << (signum - 1)
}

/// STOP, CONT, KILL and KILLTHR punch through the blocked mask.
const UNMASKABLE: u32 = (1 << (sig::SIGKILL - 1))
    | (1 << (sig::SIGSTOP - 1))
    | (1 << (sig::SIGCONT - 1))
    | (1 << (sig::SIGKILLTHR - 1));

fn valid_signal(signum: u32) -> bool {
    signum >= 1 && signum <= sig::SIG_COUNT as u32
}

/// Send a signal to a thread.
pub fn send_signal(tid: Tid, signum: u32, flags: u32) -> Result<(), i64> {
    if !valid_signal(signum) {
        return Err(ERR_INVALID_ARGS);
    }
    {
        let mut sys = THREAD_SYS.lock();
        send_signal_locked(&mut sys, tid, signum, flags)?;
    }
    if flags & SIG_FLAG_NO_RESCHED == 0 {
        sched::resched();
    }
    Ok(())
}

/// Deliver with the thread lock already held; fan-out paths batch many of
/// these under one guard and dispatch once afterwards.
pub(crate) fn send_signal_locked(sys: &mut ThreadSys, tid: Tid, signum: u32, _flags: u32) -> Result<(), i64> {
    if !valid_signal(signum) {
        return Err(ERR_INVALID_ARGS);
    }
    let t = sys.threads.get_mut(&tid).ok_or(ERR_INVALID_HANDLE)?;
    match signum {
        sig::SIGCONT => {
            t.sig_pending &= !sig_bit(sig::SIGSTOP);
            if t.state == ThreadState::Suspended {
                sched::make_ready(sys, tid);
            }
        }
        sig::SIGSTOP => {
            t.sig_pending &= !sig_bit(sig::SIGCONT);
            match t.state {
                ThreadState::Ready => {
                    // Pull it off its queue right here; a stopped thread
                    // must not be selectable.
                    if matches!(t.queue, QueueTag::Run(_)) {
                        sched::remove_from_run_queue(sys, tid);
                    }
                    let t = sys.threads.get_mut(&tid).unwrap();
                    t.state = ThreadState::Suspended;
                    t.next_state = ThreadState::Ready;
                }
                ThreadState::Birth => {
                    t.state = ThreadState::Suspended;
                }
                // Running and waiting threads stop at their next signal
                // check.
                _ => {
                    t.sig_pending |= sig_bit(signum);
                }
            }
        }
        sig::SIGKILL | sig::SIGKILLTHR => {
            t.sig_pending |= sig_bit(signum);
            match t.state {
                ThreadState::Suspended => sched::make_ready(sys, tid),
                ThreadState::Waiting => {
                    sem::interrupt_waiter_locked(sys, tid);
                }
                _ => {}
            }
        }
        _ => {
            t.sig_pending |= sig_bit(signum);
            if t.state == ThreadState::Waiting {
                sem::interrupt_waiter_locked(sys, tid);
            }
        }
    }
    Ok(())
}

/// Send a signal to a process: delivery goes to its main thread.
pub fn send_proc_signal(pid: process::Pid, signum: u32, flags: u32) -> Result<(), i64> {
    let main = process::main_thread(pid).ok_or(ERR_INVALID_HANDLE)?;
    send_signal(main, signum, flags)
}

/// Deliver pending signals to the current thread. Runs on the way out of
/// the kernel; may suspend here or never return at all.
pub fn handle_signals() {
    loop {
        let tid = thread::current_tid();
        let (signum, action) = {
            let mut sys = THREAD_SYS.lock();
            let t = match sys.threads.get_mut(&tid) {
                Some(t) => t,
                None => return,
            };
            let deliverable = t.sig_pending & !(t.sig_blocked & !UNMASKABLE);
            if deliverable == 0 {
                return;
            }
            let signum = deliverable.trailing_zeros() + 1;
            t.sig_pending &= !sig_bit(signum);
            (signum, t.sig_actions[(signum - 1) as usize])
        };

        match signum {
            sig::SIGKILLTHR => {
                thread::exit(-(signum as i32));
            }
            sig::SIGKILL => {
                default_terminate(signum);
            }
            sig::SIGSTOP => {
                park_current();
            }
            sig::SIGCONT => {}
            _ => match action.handler {
                SIG_IGN => {}
                SIG_DFL => match signum {
                    sig::SIGCHLD | sig::SIGURG | sig::SIGWINCH => {}
                    _ => default_terminate(signum),
                },
                handler => {
                    // User-frame delivery belongs to the trap glue; the
                    // core only keeps the bookkeeping straight.
                    crate::log_debug!(
                        "[SIGNAL] thread {:#x}: user handler {:#x} for signal {}",
                        tid,
                        handler,
                        signum
                    );
                }
            },
        }
    }
}

/// Default action for fatal signals: the whole process goes.
fn default_terminate(signum: u32) {
    let tid = thread::current_tid();
    let pid = {
        let sys = THREAD_SYS.lock();
        sys.threads.get(&tid).and_then(|t| t.proc)
    };
    if let Some(pid) = pid {
        if process::main_thread(pid) != Some(tid) {
            let _ = process::kill_process_nowait(pid);
        }
    }
    thread::exit(-(signum as i32));
}

/// Suspend the current thread until SIGCONT.
fn park_current() {
    let ints = crate::arch::int_disable();
    let mut sys = THREAD_SYS.lock_raw();
    let tid = thread::current_tid();
    if let Some(t) = sys.threads.get_mut(&tid) {
        t.next_state = ThreadState::Suspended;
    }
    sched::resched_locked(sys);
    crate::arch::int_restore(ints);
}

/// Install a signal action on a thread, returning the previous one.
/// KILL, STOP and KILLTHR cannot be rebound.
pub fn set_sigaction(tid: Tid, signum: u32, action: SigAction) -> Result<SigAction, i64> {
    if !valid_signal(signum) {
        return Err(ERR_INVALID_ARGS);
    }
    if matches!(signum, sig::SIGKILL | sig::SIGSTOP | sig::SIGKILLTHR) {
        return Err(ERR_INVALID_ARGS);
    }
    let mut sys = THREAD_SYS.lock();
    let t = sys.threads.get_mut(&tid).ok_or(ERR_INVALID_HANDLE)?;
    let old = t.sig_actions[(signum - 1) as usize];
    t.sig_actions[(signum - 1) as usize] = action;
    Ok(old)
}

/// Adjust the current thread's blocked mask. The unmaskable signals are
/// silently dropped from whatever the caller passes in.
pub fn set_sigmask(how: u32, mask: u32) -> Result<u32, i64> {
    let mask = mask & !UNMASKABLE;
    let tid = thread::current_tid();
    let mut sys = THREAD_SYS.lock();
    let t = sys.threads.get_mut(&tid).ok_or(ERR_INVALID_HANDLE)?;
    let old = t.sig_blocked;
    match how {
        SIG_BLOCK => t.sig_blocked |= mask,
        SIG_UNBLOCK => t.sig_blocked &= !mask,
        SIG_SETMASK => t.sig_blocked = mask,
        _ => return Err(ERR_INVALID_ARGS),
    }
    Ok(old)
}

/// Arm a SIGALRM for a thread, `ms` from now; 0 cancels a pending alarm.
pub fn alarm(tid: Tid, ms: u64) -> Result<(), i64> {
    {
        let sys = THREAD_SYS.lock();
        if !sys.threads.contains_key(&tid) {
            return Err(ERR_INVALID_HANDLE);
        }
    }
    if ms == 0 {
        timer::cancel_alarm(tid);
    } else {
        timer::set_alarm(tid, ms);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    extern "C" fn nop_entry(_arg: u64) -> i32 {
        0
    }

    #[test]
    fn test_send_validates_arguments() {
        let _g = testing::lock();
        assert_eq!(send_signal(1, 0, 0).unwrap_err(), ERR_INVALID_ARGS);
        assert_eq!(send_signal(1, 33, 0).unwrap_err(), ERR_INVALID_ARGS);
        assert_eq!(
            send_signal(0xdead_beef, sig::SIGHUP, SIG_FLAG_NO_RESCHED).unwrap_err(),
            ERR_INVALID_HANDLE
        );
    }

    #[test]
    fn test_cont_wakes_suspended_thread() {
        let _g = testing::lock();
        let tid = thread::create_kernel_thread("t_sig_cont", nop_entry, 0).unwrap();
        send_signal(tid, sig::SIGCONT, SIG_FLAG_NO_RESCHED).unwrap();
        {
            let sys = THREAD_SYS.lock();
            let t = &sys.threads[&tid];
            assert_eq!(t.state, ThreadState::Ready);
            assert!(matches!(t.queue, QueueTag::Run(_)));
        }
        testing::destroy_thread(tid);
    }

    #[test]
    fn test_stop_leaves_pending_on_waiting_thread() {
        let _g = testing::lock();
        let tid = thread::create_kernel_thread("t_sig_stopw", nop_entry, 0).unwrap();
        {
            let mut sys = THREAD_SYS.lock();
            sys.threads.get_mut(&tid).unwrap().state = ThreadState::Waiting;
        }
        send_signal(tid, sig::SIGSTOP, SIG_FLAG_NO_RESCHED).unwrap();
        {
            let sys = THREAD_SYS.lock();
            let t = &sys.threads[&tid];
            assert_eq!(t.state, ThreadState::Waiting);
            assert_ne!(t.sig_pending & super::sig_bit(sig::SIGSTOP), 0);
        }
        testing::destroy_thread(tid);
    }

    #[test]
    fn test_killthr_interrupts_interruptable_wait() {
        let _g = testing::lock();
        let tid = thread::create_kernel_thread("t_sig_kill", nop_entry, 0).unwrap();
        {
            let mut sys = THREAD_SYS.lock();
            let t = sys.threads.get_mut(&tid).unwrap();
            t.state = ThreadState::Waiting;
            t.sem_blocking = Some(0x5555);
            t.sem_interruptable = true;
        }
        send_signal(tid, sig::SIGKILLTHR, SIG_FLAG_NO_RESCHED).unwrap();
        {
            let sys = THREAD_SYS.lock();
            let t = &sys.threads[&tid];
            assert_eq!(t.state, ThreadState::Ready);
            assert_eq!(t.sem_errcode, ERR_INTERRUPTED);
            assert_ne!(t.sig_pending & super::sig_bit(sig::SIGKILLTHR), 0);
        }
        testing::destroy_thread(tid);
    }

    #[test]
    fn test_uninterruptable_wait_is_not_broken() {
        let _g = testing::lock();
        let tid = thread::create_kernel_thread("t_sig_nobreak", nop_entry, 0).unwrap();
        {
            let mut sys = THREAD_SYS.lock();
            let t = sys.threads.get_mut(&tid).unwrap();
            t.state = ThreadState::Waiting;
            t.sem_blocking = Some(0x5555);
            t.sem_interruptable = false;
        }
        send_signal(tid, sig::SIGTERM, SIG_FLAG_NO_RESCHED).unwrap();
        {
            let sys = THREAD_SYS.lock();
            assert_eq!(sys.threads[&tid].state, ThreadState::Waiting);
        }
        testing::destroy_thread(tid);
    }

    #[test]
    fn test_unmaskable_signals_cannot_be_blocked() {
        let _g = testing::lock();
        let old = set_sigmask(SIG_BLOCK, u32::MAX).unwrap();
        let now = set_sigmask(SIG_SETMASK, old).unwrap();
        assert_eq!(now & UNMASKABLE, 0);
    }

    #[test]
    fn test_sigaction_rejects_kill_stop() {
        let _g = testing::lock();
        let tid = thread::create_kernel_thread("t_sig_act", nop_entry, 0).unwrap();
        let act = SigAction {
            handler: 0x1234,
            mask: 0,
            flags: 0,
        };
        assert_eq!(set_sigaction(tid, sig::SIGKILL, act).unwrap_err(), ERR_INVALID_ARGS);
        assert_eq!(set_sigaction(tid, sig::SIGSTOP, act).unwrap_err(), ERR_INVALID_ARGS);
        let old = set_sigaction(tid, sig::SIGUSR1, act).unwrap();
        assert_eq!(old.handler, SIG_DFL);
        assert_eq!(set_sigaction(tid, sig::SIGUSR1, SigAction::DEFAULT).unwrap().handler, 0x1234);
        testing::destroy_thread(tid);
    }

    #[test]
    fn test_alarm_posts_sigalrm() {
        let _g = testing::lock();
        let tid = thread::create_kernel_thread("t_sig_alarm", nop_entry, 0).unwrap();
        alarm(tid, 1).unwrap();
        // Two boot-CPU ticks put us past the deadline.
        timer::tick(crate::smp::BOOT_CPU);
        timer::tick(crate::smp::BOOT_CPU);
        {
            let sys = THREAD_SYS.lock();
            assert_ne!(sys.threads[&tid].sig_pending & super::sig_bit(sig::SIGALRM), 0);
        }
        testing::destroy_thread(tid);
    }
}
