//! Counting semaphores
//!
//! Id-based semaphores with the four operations the rest of the kernel
//! leans on: acquire with timeout/interruptable flags, release with a
//! deferred-reschedule flag, and delete-with-retcode, which is how a
//! thread's exit code reaches its waiters.
//!
//! Lock order: the semaphore table lock may be held while taking the
//! thread lock, never the reverse. Waiter entries whose thread was
//! interrupted out of its wait go stale in place and are dropped lazily.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::string::String;
use alloc::vec::Vec;

use crate::arch;
use crate::errors::*;
use crate::klock::IrqSpinLock;
use crate::process::Pid;
use crate::sched;
use crate::thread::{self, ThreadState, Tid, THREAD_SYS};
use crate::timer;
use crate::smp;

pub type SemId = u64;

pub const SEM_FLAG_NO_RESCHED: u32 = 1;
pub const SEM_FLAG_TIMEOUT: u32 = 2;
pub const SEM_FLAG_INTERRUPTABLE: u32 = 4;

/// Hard cap on live semaphores; catches id leaks before they eat the heap.
const MAX_SEMS: usize = 64 * 1024;

struct Semaphore {
    name: String,
    count: i32,
    owner: Option<Pid>,
    waiters: VecDeque<(Tid, i32)>,
}

struct SemSys {
    table: BTreeMap<SemId, Semaphore>,
    next_id: SemId,
}

static SEMS: IrqSpinLock<SemSys> = IrqSpinLock::new(SemSys {
    table: BTreeMap::new(),
    next_id: 1,
});

/// Create a semaphore with an initial count.
pub fn create(count: i32, name: &str) -> Result<SemId, i64> {
    create_owned(count, name, None)
}

/// Create a semaphore owned by a process; owned semaphores are bulk-freed
/// when the process exits.
pub fn create_owned(count: i32, name: &str, owner: Option<Pid>) -> Result<SemId, i64> {
    if count < 0 {
        return Err(ERR_INVALID_ARGS);
    }
    let mut sems = SEMS.lock();
    if sems.table.len() >= MAX_SEMS {
        return Err(ERR_NO_MORE_SEMS);
    }
    let id = sems.next_id;
    sems.next_id += 1;
    sems.table.insert(
        id,
        Semaphore {
            name: String::from(name),
            count,
            owner,
            waiters: VecDeque::new(),
        },
    );
    Ok(id)
}

pub fn acquire(id: SemId, count: i32) -> Result<(), i64> {
    acquire_etc(id, count, 0, 0)
}

/// Acquire `count` units. Blocks until available; with `SEM_FLAG_TIMEOUT`
/// the wait is bounded by `timeout_ms`, with `SEM_FLAG_INTERRUPTABLE` a
/// signal ends it with `ERR_INTERRUPTED`.
pub fn acquire_etc(id: SemId, count: i32, flags: u32, timeout_ms: u64) -> Result<(), i64> {
    if count <= 0 {
        return Err(ERR_INVALID_ARGS);
    }

    let ints = arch::int_disable();
    let mut sems = SEMS.lock_raw();

    let sem = match sems.table.get_mut(&id) {
        Some(s) => s,
        None => {
            drop(sems);
            arch::int_restore(ints);
            return Err(ERR_INVALID_HANDLE);
        }
    };

    if sem.count >= count && sem.waiters.is_empty() {
        sem.count -= count;
        drop(sems);
        arch::int_restore(ints);
        return Ok(());
    }

    let cpu = smp::current_cpu_id();
    let tid = thread::current_tid();
    if tid == smp::idle_thread(cpu) {
        // The idle thread cannot park; a bounded wait degenerates to its
        // timeout.
        drop(sems);
        arch::int_restore(ints);
        return Err(if flags & SEM_FLAG_TIMEOUT != 0 {
            ERR_TIMED_OUT
        } else {
            ERR_NOT_ALLOWED
        });
    }

    sem.waiters.push_back((tid, count));
    let mut tsys = THREAD_SYS.lock_raw();
    {
        let t = tsys.threads.get_mut(&tid).expect("acquiring thread not in index");
        t.sem_blocking = Some(id);
        t.sem_interruptable = flags & SEM_FLAG_INTERRUPTABLE != 0;
        t.sem_errcode = NO_ERROR;
        t.next_state = ThreadState::Waiting;
    }
    drop(sems);
    if flags & SEM_FLAG_TIMEOUT != 0 {
        timer::set_sem_timeout(tid, timeout_ms);
    }
    sched::resched_locked(tsys);
    arch::int_restore(ints);

    // Woken: the waker left the verdict on our record.
    if flags & SEM_FLAG_TIMEOUT != 0 {
        timer::cancel_sem_timeout(tid);
    }
    let err = {
        let sys = THREAD_SYS.lock();
        sys.threads.get(&tid).map(|t| t.sem_errcode).unwrap_or(NO_ERROR)
    };
    if err == NO_ERROR {
        Ok(())
    } else {
        Err(err)
    }
}

pub fn release(id: SemId, count: i32) -> Result<(), i64> {
    release_etc(id, count, 0)
}

/// Release `count` units, granting FIFO waiters whose requests now fit.
/// With `SEM_FLAG_NO_RESCHED` the caller promises a dispatch of its own
/// later; multi-wakeup fan-outs use it to reschedule once.
pub fn release_etc(id: SemId, count: i32, flags: u32) -> Result<(), i64> {
    if count <= 0 {
        return Err(ERR_INVALID_ARGS);
    }
    let mut woke = false;
    {
        let ints = arch::int_disable();
        let mut sems = SEMS.lock_raw();
        let sem = match sems.table.get_mut(&id) {
            Some(s) => s,
            None => {
                drop(sems);
                arch::int_restore(ints);
                return Err(ERR_INVALID_HANDLE);
            }
        };
        sem.count += count;

        let mut tsys = THREAD_SYS.lock_raw();
        while let Some(&(wtid, need)) = sem.waiters.front() {
            let stale = tsys
                .threads
                .get(&wtid)
                .map(|t| t.sem_blocking != Some(id))
                .unwrap_or(true);
            if stale {
                sem.waiters.pop_front();
                continue;
            }
            if sem.count < need {
                break;
            }
            sem.count -= need;
            sem.waiters.pop_front();
            let t = tsys.threads.get_mut(&wtid).unwrap();
            t.sem_blocking = None;
            t.sem_errcode = NO_ERROR;
            sched::make_ready(&mut tsys, wtid);
            woke = true;
        }
        drop(tsys);
        drop(sems);
        arch::int_restore(ints);
    }
    if woke && flags & SEM_FLAG_NO_RESCHED == 0 {
        sched::resched();
    }
    Ok(())
}

pub fn delete(id: SemId) -> Result<(), i64> {
    delete_etc(id, 0)
}

/// Delete a semaphore. Waiters wake with `ERR_SEM_DELETED` and carry
/// `retcode` home on their record; `wait_on_thread` reads it as the exit
/// code. Wakeups are enqueued without an immediate dispatch.
pub fn delete_etc(id: SemId, retcode: i32) -> Result<(), i64> {
    let ints = arch::int_disable();
    let mut sems = SEMS.lock_raw();
    let sem = match sems.table.remove(&id) {
        Some(s) => s,
        None => {
            drop(sems);
            arch::int_restore(ints);
            return Err(ERR_INVALID_HANDLE);
        }
    };
    let mut tsys = THREAD_SYS.lock_raw();
    for (wtid, _) in sem.waiters {
        if let Some(t) = tsys.threads.get_mut(&wtid) {
            if t.sem_blocking == Some(id) {
                t.sem_blocking = None;
                t.sem_errcode = ERR_SEM_DELETED;
                t.sem_retcode = retcode;
                sched::make_ready(&mut tsys, wtid);
            }
        }
    }
    drop(tsys);
    drop(sems);
    arch::int_restore(ints);
    Ok(())
}

/// Bulk-release every semaphore a process owns, part of process teardown.
pub fn free_owned_by(pid: Pid) {
    let ids: Vec<SemId> = {
        let sems = SEMS.lock();
        sems.table
            .iter()
            .filter(|(_, s)| s.owner == Some(pid))
            .map(|(id, _)| *id)
            .collect()
    };
    for id in ids {
        let _ = delete_etc(id, 0);
    }
}

pub fn count(id: SemId) -> Result<i32, i64> {
    let sems = SEMS.lock();
    sems.table.get(&id).map(|s| s.count).ok_or(ERR_INVALID_HANDLE)
}

pub fn name(id: SemId) -> Result<String, i64> {
    let sems = SEMS.lock();
    sems.table.get(&id).map(|s| s.name.clone()).ok_or(ERR_INVALID_HANDLE)
}

/// Timeout event fired for a blocked thread: cancel its wait with
/// `ERR_TIMED_OUT`. The sem id comes off the thread record, revalidated
/// after the locks are re-taken in order.
pub(crate) fn timeout_waiter(tid: Tid) {
    let sem_id = {
        let sys = THREAD_SYS.lock();
        match sys.threads.get(&tid) {
            Some(t) => t.sem_blocking,
            None => None,
        }
    };
    let Some(sem_id) = sem_id else { return };

    let ints = arch::int_disable();
    let mut sems = SEMS.lock_raw();
    let mut tsys = THREAD_SYS.lock_raw();
    let still_blocked = tsys
        .threads
        .get(&tid)
        .map(|t| t.sem_blocking == Some(sem_id))
        .unwrap_or(false);
    if still_blocked {
        if let Some(sem) = sems.table.get_mut(&sem_id) {
            sem.waiters.retain(|&(w, _)| w != tid);
        }
        let t = tsys.threads.get_mut(&tid).unwrap();
        t.sem_blocking = None;
        t.sem_errcode = ERR_TIMED_OUT;
        sched::make_ready(&mut tsys, tid);
    }
    drop(tsys);
    drop(sems);
    arch::int_restore(ints);
}

/// Signal delivery found `tid` sleeping interruptably. Called with the
/// thread lock held, so the semaphore queue cannot be touched here; the
/// waiter entry goes stale and release/delete skip it.
pub(crate) fn interrupt_waiter_locked(tsys: &mut thread::ThreadSys, tid: Tid) -> bool {
    let t = match tsys.threads.get_mut(&tid) {
        Some(t) => t,
        None => return false,
    };
    if t.sem_blocking.is_none() || !t.sem_interruptable {
        return false;
    }
    t.sem_blocking = None;
    t.sem_errcode = ERR_INTERRUPTED;
    sched::make_ready(tsys, tid);
    true
}

#[cfg(test)]
pub(crate) fn push_waiter_for_test(id: SemId, tid: Tid) {
    let mut sems = SEMS.lock();
    sems.table.get_mut(&id).expect("sem").waiters.push_back((tid, 1));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn test_uncontended_acquire_release() {
        let _g = testing::lock();
        let id = create(2, "t_sem").unwrap();
        acquire(id, 2).unwrap();
        assert_eq!(count(id).unwrap(), 0);
        release_etc(id, 1, SEM_FLAG_NO_RESCHED).unwrap();
        assert_eq!(count(id).unwrap(), 1);
        delete(id).unwrap();
        assert_eq!(acquire(id, 1).unwrap_err(), ERR_INVALID_HANDLE);
    }

    #[test]
    fn test_acquire_rejects_bad_args() {
        let _g = testing::lock();
        let id = create(1, "t_args").unwrap();
        assert_eq!(acquire(id, 0).unwrap_err(), ERR_INVALID_ARGS);
        assert_eq!(acquire(id, -1).unwrap_err(), ERR_INVALID_ARGS);
        delete(id).unwrap();
    }

    #[test]
    fn test_release_grants_fifo_waiters() {
        let _g = testing::lock();
        extern "C" fn nop(_: u64) -> i32 {
            0
        }
        let id = create(0, "t_grant").unwrap();
        let w1 = thread::create_kernel_thread("t_sem_w1", nop, 0).unwrap();
        let w2 = thread::create_kernel_thread("t_sem_w2", nop, 0).unwrap();
        for w in [w1, w2] {
            let mut sys = THREAD_SYS.lock();
            let t = sys.threads.get_mut(&w).unwrap();
            t.state = ThreadState::Waiting;
            t.sem_blocking = Some(id);
        }
        push_waiter_for_test(id, w1);
        push_waiter_for_test(id, w2);

        // One unit: only the queue head is granted.
        release_etc(id, 1, SEM_FLAG_NO_RESCHED).unwrap();
        {
            let sys = THREAD_SYS.lock();
            assert_eq!(sys.threads[&w1].state, ThreadState::Ready);
            assert_eq!(sys.threads[&w1].sem_blocking, None);
            assert_eq!(sys.threads[&w2].state, ThreadState::Waiting);
        }
        assert_eq!(count(id).unwrap(), 0);

        release_etc(id, 1, SEM_FLAG_NO_RESCHED).unwrap();
        {
            let sys = THREAD_SYS.lock();
            assert_eq!(sys.threads[&w2].state, ThreadState::Ready);
        }
        delete(id).unwrap();
        for w in [w1, w2] {
            testing::destroy_thread(w);
        }
    }

    #[test]
    fn test_stale_waiter_entries_are_skipped() {
        let _g = testing::lock();
        extern "C" fn nop(_: u64) -> i32 {
            0
        }
        let id = create(0, "t_stale").unwrap();
        let w = thread::create_kernel_thread("t_sem_stale", nop, 0).unwrap();
        {
            let mut sys = THREAD_SYS.lock();
            let t = sys.threads.get_mut(&w).unwrap();
            t.state = ThreadState::Waiting;
            t.sem_blocking = Some(id);
            t.sem_interruptable = true;
        }
        push_waiter_for_test(id, w);
        // A signal interrupts the wait; the queue entry goes stale.
        {
            let mut sys = THREAD_SYS.lock();
            assert!(interrupt_waiter_locked(&mut sys, w));
            assert_eq!(sys.threads[&w].sem_errcode, ERR_INTERRUPTED);
            assert_eq!(sys.threads[&w].state, ThreadState::Ready);
        }
        // The release must skip the stale entry and keep its unit.
        release_etc(id, 1, SEM_FLAG_NO_RESCHED).unwrap();
        assert_eq!(count(id).unwrap(), 1);
        delete(id).unwrap();
        testing::destroy_thread(w);
    }

    #[test]
    fn test_delete_hands_retcode_to_waiters() {
        let _g = testing::lock();
        extern "C" fn nop(_: u64) -> i32 {
            0
        }
        let id = create(0, "t_retcode").unwrap();
        let w = thread::create_kernel_thread("t_sem_ret", nop, 0).unwrap();
        {
            let mut sys = THREAD_SYS.lock();
            let t = sys.threads.get_mut(&w).unwrap();
            t.state = ThreadState::Waiting;
            t.sem_blocking = Some(id);
        }
        push_waiter_for_test(id, w);
        delete_etc(id, 99).unwrap();
        {
            let sys = THREAD_SYS.lock();
            let t = &sys.threads[&w];
            assert_eq!(t.sem_errcode, ERR_SEM_DELETED);
            assert_eq!(t.sem_retcode, 99);
            assert_eq!(t.state, ThreadState::Ready);
        }
        testing::destroy_thread(w);
    }

    #[test]
    fn test_timeout_cancels_wait() {
        let _g = testing::lock();
        extern "C" fn nop(_: u64) -> i32 {
            0
        }
        let id = create(0, "t_timeout").unwrap();
        let w = thread::create_kernel_thread("t_sem_to", nop, 0).unwrap();
        {
            let mut sys = THREAD_SYS.lock();
            let t = sys.threads.get_mut(&w).unwrap();
            t.state = ThreadState::Waiting;
            t.sem_blocking = Some(id);
        }
        push_waiter_for_test(id, w);
        timeout_waiter(w);
        {
            let sys = THREAD_SYS.lock();
            assert_eq!(sys.threads[&w].sem_errcode, ERR_TIMED_OUT);
            assert_eq!(sys.threads[&w].state, ThreadState::Ready);
        }
        // Queue entry was removed eagerly by the timeout path.
        release_etc(id, 1, SEM_FLAG_NO_RESCHED).unwrap();
        assert_eq!(count(id).unwrap(), 1);
        delete(id).unwrap();
        testing::destroy_thread(w);
    }

    #[test]
    fn test_idle_thread_cannot_park() {
        let _g = testing::lock();
        let id = create(0, "t_idle_park").unwrap();
        assert_eq!(acquire_etc(id, 1, SEM_FLAG_TIMEOUT, 5).unwrap_err(), ERR_TIMED_OUT);
        assert_eq!(acquire(id, 1).unwrap_err(), ERR_NOT_ALLOWED);
        delete(id).unwrap();
    }

    #[test]
    fn test_owned_sems_are_bulk_freed() {
        let _g = testing::lock();
        let a = create_owned(0, "t_owned_a", Some(4242)).unwrap();
        let b = create_owned(0, "t_owned_b", Some(4242)).unwrap();
        let other = create_owned(0, "t_owned_c", Some(4243)).unwrap();
        free_owned_by(4242);
        assert_eq!(count(a).unwrap_err(), ERR_INVALID_HANDLE);
        assert_eq!(count(b).unwrap_err(), ERR_INVALID_HANDLE);
        assert_eq!(count(other).unwrap(), 0);
        delete(other).unwrap();
    }
}
