//! Process groups & sessions
//!
//! Job-control groupings: every process is in exactly one group and one
//! session, groups are wholly contained in sessions, and group ids are the
//! pid of their founder. The orphan test here drives the SIGHUP+SIGCONT
//! delivery the exit path owes abandoned groups.

use alloc::vec::Vec;

use crate::errors::*;
use crate::process::{self, Pid, ProcSys, PROC_SYS};
use crate::sched;
use crate::signals;
use crate::thread::THREAD_SYS;

pub struct ProcessGroup {
    pub pgid: Pid,
    pub members: Vec<Pid>,
}

impl ProcessGroup {
    pub fn new(pgid: Pid, founder: Pid) -> Self {
        let mut members = Vec::new();
        members.push(founder);
        Self { pgid, members }
    }
}

pub struct Session {
    pub sid: Pid,
    pub members: Vec<Pid>,
}

impl Session {
    pub fn new(sid: Pid, founder: Pid) -> Self {
        let mut members = Vec::new();
        members.push(founder);
        Self { sid, members }
    }
}

/// Drop a process from its group, discarding the node when it empties.
pub(crate) fn remove_group_member(sys: &mut ProcSys, pgid: Pid, pid: Pid) {
    let empty = match sys.pgroups.get_mut(&pgid) {
        Some(g) => {
            g.members.retain(|&m| m != pid);
            g.members.is_empty()
        }
        None => return,
    };
    if empty {
        sys.pgroups.remove(&pgid);
    }
}

pub(crate) fn remove_session_member(sys: &mut ProcSys, sid: Pid, pid: Pid) {
    let empty = match sys.sessions.get_mut(&sid) {
        Some(s) => {
            s.members.retain(|&m| m != pid);
            s.members.is_empty()
        }
        None => return,
    };
    if empty {
        sys.sessions.remove(&sid);
    }
}

/// The orphan test: a group stays connected while some member other than
/// `ignore` has a parent in `parent_pgid`.
pub(crate) fn connected(sys: &ProcSys, pgid: Pid, parent_pgid: Pid, ignore: Pid) -> bool {
    let group = match sys.pgroups.get(&pgid) {
        Some(g) => g,
        None => return false,
    };
    for &member in &group.members {
        if member == ignore {
            continue;
        }
        let parent = match sys.procs.get(&member) {
            Some(m) => m.parent,
            None => continue,
        };
        if let Some(p) = sys.procs.get(&parent) {
            if p.pgid == parent_pgid {
                return true;
            }
        }
    }
    false
}

/// Deliver a signal to every member's main thread, with the process lock
/// held and a single thread-lock pass. Rescheduling is the caller's.
pub(crate) fn signal_group_locked(sys: &mut ProcSys, pgid: Pid, signum: u32) {
    let mains: Vec<_> = match sys.pgroups.get(&pgid) {
        Some(g) => g
            .members
            .iter()
            .filter_map(|m| sys.procs.get(m).and_then(|p| p.main_thread))
            .collect(),
        None => return,
    };
    let mut tsys = THREAD_SYS.lock();
    for main in mains {
        let _ = signals::send_signal_locked(&mut tsys, main, signum, signals::SIG_FLAG_NO_RESCHED);
    }
}

/// Signal every process in a group. The sender reschedules at most once,
/// at the end.
pub fn send_signal_to_pgroup(pgid: Pid, signum: u32, flags: u32) -> Result<(), i64> {
    {
        let mut sys = PROC_SYS.lock();
        if !sys.pgroups.contains_key(&pgid) {
            return Err(ERR_NOT_FOUND);
        }
        signal_group_locked(&mut sys, pgid, signum);
    }
    if flags & signals::SIG_FLAG_NO_RESCHED == 0 {
        sched::resched();
    }
    Ok(())
}

/// Signal every process in a session.
pub fn send_signal_to_session(sid: Pid, signum: u32, flags: u32) -> Result<(), i64> {
    {
        let mut sys = PROC_SYS.lock();
        let mains: Vec<_> = match sys.sessions.get(&sid) {
            Some(s) => s
                .members
                .iter()
                .filter_map(|m| sys.procs.get(m).and_then(|p| p.main_thread))
                .collect(),
            None => return Err(ERR_NOT_FOUND),
        };
        let mut tsys = THREAD_SYS.lock();
        for main in mains {
            let _ = signals::send_signal_locked(&mut tsys, main, signum, signals::SIG_FLAG_NO_RESCHED);
        }
    }
    if flags & signals::SIG_FLAG_NO_RESCHED == 0 {
        sched::resched();
    }
    Ok(())
}

/// Move a process to a group. `pid` 0 means the caller, `pgid` 0 means
/// "a group named after the process". A group may only be founded by its
/// namesake; joining an existing group requires it to live in the same
/// session.
pub fn setpgid(pid: Pid, pgid: Pid) -> Result<Pid, i64> {
    let pid = if pid == 0 { process::current_pid() } else { pid };
    let pgid = if pgid == 0 { pid } else { pgid };

    loop {
        let mut sys = PROC_SYS.lock();
        let p = sys.procs.get(&pid).ok_or(ERR_INVALID_HANDLE)?;
        let (old_pgid, my_sid) = (p.pgid, p.sid);
        if old_pgid == pgid {
            return Ok(pgid);
        }

        if let Some(group) = sys.pgroups.get(&pgid) {
            // Joining an existing group: it must belong to our session.
            let same_session = group
                .members
                .iter()
                .any(|m| sys.procs.get(m).map(|mp| mp.sid == my_sid).unwrap_or(false));
            if !same_session {
                return Err(ERR_NOT_ALLOWED);
            }
            remove_group_member(&mut sys, old_pgid, pid);
            sys.pgroups.get_mut(&pgid).expect("group checked above").members.push(pid);
            sys.procs.get_mut(&pid).expect("checked above").pgid = pgid;
            return Ok(pgid);
        }

        if pgid != pid {
            return Err(ERR_NOT_FOUND);
        }

        // Found a new group. The node is built with the lock dropped
        // (allocation may block) and published only if nobody beat us to
        // it; otherwise ours is discarded and we retry the join.
        drop(sys);
        let node = ProcessGroup::new(pgid, pid);
        let mut sys = PROC_SYS.lock();
        if sys.pgroups.contains_key(&pgid) {
            continue;
        }
        let p = sys.procs.get_mut(&pid).ok_or(ERR_INVALID_HANDLE)?;
        let old_pgid = p.pgid;
        p.pgid = pgid;
        sys.pgroups.insert(pgid, node);
        remove_group_member(&mut sys, old_pgid, pid);
        return Ok(pgid);
    }
}

/// Group id of a process; 0 selects the caller.
pub fn getpgid(pid: Pid) -> Result<Pid, i64> {
    let pid = if pid == 0 { process::current_pid() } else { pid };
    let sys = PROC_SYS.lock();
    sys.procs.get(&pid).map(|p| p.pgid).ok_or(ERR_INVALID_HANDLE)
}

/// Session id of a process; 0 selects the caller.
pub fn getsid(pid: Pid) -> Result<Pid, i64> {
    let pid = if pid == 0 { process::current_pid() } else { pid };
    let sys = PROC_SYS.lock();
    sys.procs.get(&pid).map(|p| p.sid).ok_or(ERR_INVALID_HANDLE)
}

/// Start a new session led by the calling process, which also founds a
/// group of its own id. Calling it again in the same process is a no-op
/// returning the same sid; a mere group leader cannot steal a session.
pub fn setsid() -> Result<Pid, i64> {
    setsid_for(process::current_pid())
}

pub(crate) fn setsid_for(pid: Pid) -> Result<Pid, i64> {
    {
        let sys = PROC_SYS.lock();
        let p = sys.procs.get(&pid).ok_or(ERR_INVALID_HANDLE)?;
        if p.sid == pid {
            return Ok(pid); // already the session leader
        }
        if p.pgid == pid {
            return Err(ERR_NOT_ALLOWED);
        }
    }

    // Build both nodes outside the lock, publish under it.
    let group = ProcessGroup::new(pid, pid);
    let session = Session::new(pid, pid);
    let mut sys = PROC_SYS.lock();
    let p = sys.procs.get_mut(&pid).ok_or(ERR_INVALID_HANDLE)?;
    if p.sid == pid {
        return Ok(pid); // raced with ourselves through another thread
    }
    let (old_pgid, old_sid) = (p.pgid, p.sid);
    p.pgid = pid;
    p.sid = pid;
    remove_group_member(&mut sys, old_pgid, pid);
    remove_session_member(&mut sys, old_sid, pid);
    sys.pgroups.insert(pid, group);
    sys.sessions.insert(pid, session);
    Ok(pid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{PROC_FLAG_SUSPENDED, KERNEL_PID};
    use crate::signals::sig;
    use crate::testing;

    fn make_proc(creator: Pid, name: &str, flags: u32) -> Pid {
        process::create_process_etc(creator, name, "/boot/bin/true", &[], flags | PROC_FLAG_SUSPENDED).unwrap()
    }

    #[test]
    fn test_setpgid_getpgid_roundtrip() {
        let _g = testing::lock();
        let p = make_proc(KERNEL_PID, "t_pg_rt", 0);
        assert_eq!(getpgid(p).unwrap(), KERNEL_PID);
        assert_eq!(setpgid(p, p).unwrap(), p);
        assert_eq!(getpgid(p).unwrap(), p);
        {
            let sys = PROC_SYS.lock();
            assert!(sys.pgroups.get(&p).unwrap().members.contains(&p));
            assert!(!sys.pgroups.get(&KERNEL_PID).unwrap().members.contains(&p));
        }
        testing::destroy_process(p);
    }

    #[test]
    fn test_setpgid_zero_arguments_normalize() {
        let _g = testing::lock();
        // pid 0 is the caller (the kernel process in tests); pgid 0 is
        // the pid itself. The kernel process already leads its group.
        assert_eq!(setpgid(0, 0).unwrap(), KERNEL_PID);
    }

    #[test]
    fn test_setpgid_rejects_foreign_session_group() {
        let _g = testing::lock();
        let leader = make_proc(KERNEL_PID, "t_pg_sess", crate::process::PROC_FLAG_NEW_SESSION);
        let outsider = make_proc(KERNEL_PID, "t_pg_out", 0);
        assert_eq!(setpgid(outsider, leader).unwrap_err(), ERR_NOT_ALLOWED);
        assert_eq!(setpgid(outsider, 0xdead).unwrap_err(), ERR_NOT_FOUND);
        testing::destroy_process(leader);
        testing::destroy_process(outsider);
    }

    #[test]
    fn test_setsid_is_idempotent_per_process() {
        let _g = testing::lock();
        let p = make_proc(KERNEL_PID, "t_setsid", 0);
        let sid = setsid_for(p).unwrap();
        assert_eq!(sid, p);
        assert_eq!(getsid(p).unwrap(), p);
        assert_eq!(getpgid(p).unwrap(), p);
        // Second call: no-op, same sid.
        assert_eq!(setsid_for(p).unwrap(), sid);
        {
            let sys = PROC_SYS.lock();
            assert!(sys.sessions.get(&p).unwrap().members.contains(&p));
            assert!(!sys.sessions.get(&KERNEL_PID).unwrap().members.contains(&p));
        }
        testing::destroy_process(p);
    }

    #[test]
    fn test_group_leader_cannot_setsid() {
        let _g = testing::lock();
        let p = make_proc(KERNEL_PID, "t_leader", 0);
        setpgid(p, p).unwrap();
        assert_eq!(setsid_for(p).unwrap_err(), ERR_NOT_ALLOWED);
        testing::destroy_process(p);
    }

    #[test]
    fn test_connected_sees_outside_parent() {
        let _g = testing::lock();
        let a = make_proc(KERNEL_PID, "t_conn_a", 0);
        setpgid(a, a).unwrap();
        {
            // a's parent is the kernel process, whose group is its own:
            // connected relative to the kernel group, orphaned relative
            // to any other.
            let sys = PROC_SYS.lock();
            assert!(connected(&sys, a, KERNEL_PID, 0));
            assert!(!connected(&sys, a, 0x7777, 0));
            // Ignoring the only member disconnects it.
            assert!(!connected(&sys, a, KERNEL_PID, a));
        }
        testing::destroy_process(a);
    }

    #[test]
    fn test_group_signal_fans_out_to_main_threads() {
        let _g = testing::lock();
        let a = make_proc(KERNEL_PID, "t_fan_a", 0);
        let b = make_proc(KERNEL_PID, "t_fan_b", 0);
        setpgid(a, a).unwrap();
        setpgid(b, a).unwrap();
        send_signal_to_pgroup(a, sig::SIGUSR1, signals::SIG_FLAG_NO_RESCHED).unwrap();
        let mains: alloc::vec::Vec<_> = {
            let sys = PROC_SYS.lock();
            [a, b].iter().map(|pid| sys.procs[pid].main_thread.unwrap()).collect()
        };
        {
            let tsys = THREAD_SYS.lock();
            for main in mains {
                assert_ne!(
                    tsys.threads[&main].sig_pending & (1 << (sig::SIGUSR1 - 1)),
                    0,
                    "member thread {:#x} missed the fan-out",
                    main
                );
            }
        }
        assert_eq!(
            send_signal_to_pgroup(0xbeef, sig::SIGUSR1, signals::SIG_FLAG_NO_RESCHED).unwrap_err(),
            ERR_NOT_FOUND
        );
        testing::destroy_process(a);
        testing::destroy_process(b);
    }
}
