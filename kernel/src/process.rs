//! Process management
//!
//! Processes are address-space-and-resource containers around their
//! threads. The first thread into a process is its main thread and the two
//! share a fate: when the main thread exits the process goes with it.
//! Creation builds the container, links it into the family tree and the
//! job-control tables, then launches a kernel thread inside it that maps
//! the stack, loads the binary and drops to user mode.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::arch;
use crate::elf;
use crate::errors::*;
use crate::ioctx::{self, IoCtxId};
use crate::klock::IrqSpinLock;
use crate::pgroup::{self, ProcessGroup, Session};
use crate::sem;
use crate::signals::sig;
use crate::thread::{self, Tid};
use crate::vm::{self, AspaceId};

pub type Pid = u64;

/// The kernel process: its own parent, home of the idle threads and of
/// any kernel thread spawned without a target process.
pub const KERNEL_PID: Pid = 1;

pub const PROC_NAME_LEN: usize = 32;

/// Hold the new main thread instead of resuming it.
pub const PROC_FLAG_SUSPENDED: u32 = 1;
/// Found a new process group.
pub const PROC_FLAG_NEW_PGROUP: u32 = 2;
/// Found a new session (implies a new process group).
pub const PROC_FLAG_NEW_SESSION: u32 = 4;

const MAX_PROC_ARGS: usize = 64;
const MAX_ARG_LEN: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Birth,
    Normal,
    Death,
}

pub struct Process {
    pub pid: Pid,
    name: String,
    pub path: String,
    pub args: Vec<String>,
    pub parent: Pid,
    pub children: Vec<Pid>,
    pub threads: Vec<Tid>,
    pub main_thread: Option<Tid>,
    pub num_threads: u32,
    pub pgid: Pid,
    pub sid: Pid,
    pub state: ProcState,
    pub aspace: AspaceId,
    pub ioctx: IoCtxId,
}

impl Process {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Everything the global process lock guards: the process index, the
/// group and session tables, and all family links.
pub(crate) struct ProcSys {
    pub procs: BTreeMap<Pid, Process>,
    pub pgroups: BTreeMap<Pid, ProcessGroup>,
    pub sessions: BTreeMap<Pid, Session>,
}

pub(crate) static PROC_SYS: IrqSpinLock<ProcSys> = IrqSpinLock::new(ProcSys {
    procs: BTreeMap::new(),
    pgroups: BTreeMap::new(),
    sessions: BTreeMap::new(),
});

static NEXT_PID: AtomicU64 = AtomicU64::new(1);

fn bounded_name(name: &str) -> String {
    let end = name
        .char_indices()
        .take_while(|(i, c)| i + c.len_utf8() <= PROC_NAME_LEN)
        .map(|(i, c)| i + c.len_utf8())
        .last()
        .unwrap_or(0);
    String::from(&name[..end])
}

/// Create the kernel process. Runs before the thread subsystem so the
/// idle threads have a home.
pub fn init() {
    let pid = NEXT_PID.fetch_add(1, Ordering::SeqCst);
    assert_eq!(pid, KERNEL_PID);
    let ioctx = ioctx::create(None);
    let mut sys = PROC_SYS.lock();
    sys.procs.insert(
        pid,
        Process {
            pid,
            name: String::from("kernel"),
            path: String::new(),
            args: Vec::new(),
            parent: pid, // the kernel process is its own parent
            children: Vec::new(),
            threads: Vec::new(),
            main_thread: None,
            num_threads: 0,
            pgid: pid,
            sid: pid,
            state: ProcState::Normal,
            aspace: vm::KERNEL_ASPACE,
            ioctx,
        },
    );
    sys.pgroups.insert(pid, ProcessGroup::new(pid, pid));
    sys.sessions.insert(pid, Session::new(pid, pid));
    drop(sys);
    crate::log!("[PROC] kernel process ready (pid {})", pid);
}

pub fn current_pid() -> Pid {
    let tid = thread::current_tid();
    let sys = thread::THREAD_SYS.lock();
    sys.threads.get(&tid).and_then(|t| t.proc).unwrap_or(KERNEL_PID)
}

// ============================================================================
// Thread membership (called by the thread lifecycle)
// ============================================================================

/// Insert a thread into a process, designating it main if the process was
/// empty. Fails with `ERR_TASK_PROC_DELETED` when racing the process's
/// death.
pub(crate) fn attach_thread(pid: Pid, tid: Tid) -> Result<AspaceId, i64> {
    let mut sys = PROC_SYS.lock();
    let p = sys.procs.get_mut(&pid).ok_or(ERR_INVALID_HANDLE)?;
    if p.state == ProcState::Death {
        return Err(ERR_TASK_PROC_DELETED);
    }
    p.threads.push(tid);
    p.num_threads += 1;
    if p.main_thread.is_none() {
        p.main_thread = Some(tid);
    }
    Ok(p.aspace)
}

/// Undo an attach (creation unwind, or the exit continuation leaving the
/// kernel process).
pub(crate) fn detach_thread(pid: Pid, tid: Tid) {
    let mut sys = PROC_SYS.lock();
    if let Some(p) = sys.procs.get_mut(&pid) {
        if let Some(i) = p.threads.iter().position(|&t| t == tid) {
            p.threads.remove(i);
            p.num_threads = p.num_threads.saturating_sub(1);
        }
        if p.main_thread == Some(tid) && p.state != ProcState::Death {
            p.main_thread = None;
        }
    }
}

/// An exiting thread leaves its process. When it is the main thread the
/// process is marked `Death`, after which no thread may be inserted.
/// Returns whether it was the main thread.
pub(crate) fn detach_exiting_thread(pid: Pid, tid: Tid) -> bool {
    let mut sys = PROC_SYS.lock();
    let p = match sys.procs.get_mut(&pid) {
        Some(p) => p,
        None => return false,
    };
    if let Some(i) = p.threads.iter().position(|&t| t == tid) {
        p.threads.remove(i);
        p.num_threads = p.num_threads.saturating_sub(1);
    }
    if p.main_thread == Some(tid) {
        p.state = ProcState::Death;
        return true;
    }
    false
}

pub(crate) fn thread_list(pid: Pid) -> Vec<Tid> {
    let sys = PROC_SYS.lock();
    sys.procs.get(&pid).map(|p| p.threads.clone()).unwrap_or_default()
}

pub(crate) fn thread_count(pid: Pid) -> u32 {
    let sys = PROC_SYS.lock();
    sys.procs.get(&pid).map(|p| p.num_threads).unwrap_or(0)
}

pub fn main_thread(pid: Pid) -> Option<Tid> {
    let sys = PROC_SYS.lock();
    sys.procs.get(&pid).and_then(|p| p.main_thread)
}

// ============================================================================
// Creation
// ============================================================================

struct LaunchArgs {
    pid: Pid,
}

/// Create a process running `path`. The new main thread is resumed unless
/// `PROC_FLAG_SUSPENDED` asks otherwise.
pub fn create_process(name: &str, path: &str, args: &[&str], flags: u32) -> Result<Pid, i64> {
    create_process_etc(current_pid(), name, path, args, flags)
}

pub(crate) fn create_process_etc(
    creator: Pid,
    name: &str,
    path: &str,
    args: &[&str],
    flags: u32,
) -> Result<Pid, i64> {
    if name.is_empty() || path.is_empty() || args.len() > MAX_PROC_ARGS {
        return Err(ERR_INVALID_ARGS);
    }
    if args.iter().any(|a| a.len() > MAX_ARG_LEN) {
        return Err(ERR_INVALID_ARGS);
    }

    let pid = NEXT_PID.fetch_add(1, Ordering::SeqCst);
    let new_session = flags & PROC_FLAG_NEW_SESSION != 0;
    // A new session always begins a new group.
    let new_pgroup = new_session || flags & PROC_FLAG_NEW_PGROUP != 0;

    // Everything that allocates heavily or may block happens outside the
    // process lock: argument duplication, the I/O context, the address
    // space, and pre-built group/session nodes.
    let args: Vec<String> = args.iter().map(|a| String::from(*a)).collect();
    let parent_ioctx = {
        let sys = PROC_SYS.lock();
        sys.procs.get(&creator).map(|p| p.ioctx)
    };
    let ioctx = ioctx::create(parent_ioctx);
    let aspace = match vm::create_address_space(&format!("proc_{}", pid)) {
        Ok(a) => a,
        Err(e) => {
            ioctx::free(ioctx);
            return Err(e);
        }
    };
    let premade_group = new_pgroup.then(|| ProcessGroup::new(pid, pid));
    let premade_session = new_session.then(|| Session::new(pid, pid));

    {
        let mut sys = PROC_SYS.lock();
        let parent = match sys.procs.get_mut(&creator) {
            Some(p) => p,
            None => {
                drop(sys);
                ioctx::free(ioctx);
                let _ = vm::delete_address_space(aspace);
                return Err(ERR_INVALID_HANDLE);
            }
        };
        parent.children.push(pid);
        let inherited_sid = parent.sid;
        let inherited_pgid = parent.pgid;

        let sid = if new_session { pid } else { inherited_sid };
        let pgid = if new_pgroup { pid } else { inherited_pgid };

        sys.procs.insert(
            pid,
            Process {
                pid,
                name: bounded_name(name),
                path: String::from(path),
                args,
                parent: creator,
                children: Vec::new(),
                threads: Vec::new(),
                main_thread: None,
                num_threads: 0,
                pgid,
                sid,
                state: ProcState::Birth,
                aspace,
                ioctx,
            },
        );

        match premade_session {
            Some(node) => {
                sys.sessions.insert(pid, node);
            }
            None => sys.sessions.get_mut(&sid).expect("creator session").members.push(pid),
        }
        match premade_group {
            Some(node) => {
                sys.pgroups.insert(pid, node);
            }
            None => sys.pgroups.get_mut(&pgid).expect("creator pgroup").members.push(pid),
        }
    }

    // The launch thread runs in kernel mode inside the new process and
    // carries it the rest of the way to user space.
    let launch = Box::into_raw(Box::new(LaunchArgs { pid })) as u64;
    let main = match thread::create_kernel_thread_in_proc(pid, name, launch_entry, launch) {
        Ok(t) => t,
        Err(e) => {
            drop(unsafe { Box::from_raw(launch as *mut LaunchArgs) });
            unlink_birth_process(pid);
            return Err(e);
        }
    };

    if flags & PROC_FLAG_SUSPENDED == 0 {
        let _ = thread::resume_thread(main);
    }
    crate::log_debug!("[PROC] created process {} '{}' (parent {})", pid, name, creator);
    Ok(pid)
}

/// Creation failed after the record was published: pull it back out of
/// every index, in reverse order of insertion.
fn unlink_birth_process(pid: Pid) {
    let (aspace, ioctx) = {
        let mut sys = PROC_SYS.lock();
        let p = match sys.procs.remove(&pid) {
            Some(p) => p,
            None => return,
        };
        pgroup::remove_group_member(&mut sys, p.pgid, pid);
        pgroup::remove_session_member(&mut sys, p.sid, pid);
        if let Some(parent) = sys.procs.get_mut(&p.parent) {
            parent.children.retain(|&c| c != pid);
        }
        (p.aspace, p.ioctx)
    };
    let _ = vm::delete_address_space(aspace);
    ioctx::free(ioctx);
}

extern "C" fn launch_entry(arg: u64) -> i32 {
    let args = unsafe { Box::from_raw(arg as *mut LaunchArgs) };
    match launch(args.pid) {
        Ok(code) => code,
        Err(e) => {
            crate::log_warn!("[PROC] launch of {} failed: {}", args.pid, err_name(e));
            e as i32
        }
    }
}

/// Body of the launch thread: map the main stack, place the argument
/// vector on it, load the binary, flip to `Normal` and enter user mode.
fn launch(pid: Pid) -> Result<i32, i64> {
    let (aspace, path, args) = {
        let sys = PROC_SYS.lock();
        let p = sys.procs.get(&pid).ok_or(ERR_INVALID_HANDLE)?;
        (p.aspace, p.path.clone(), p.args.clone())
    };

    let (_region, stack_base) = thread::reserve_user_stack_in(aspace)?;
    let stack_top = stack_base + thread::USER_STACK_SIZE as u64;
    let args_base = write_proc_args(aspace, stack_top, &args)?;
    let sp = args_base & !0xf;

    let entry = elf::load(&path, aspace)?;

    {
        let mut sys = PROC_SYS.lock();
        let p = sys.procs.get_mut(&pid).ok_or(ERR_INVALID_HANDLE)?;
        p.state = ProcState::Normal;
    }

    let code = unsafe { arch::enter_user_mode(entry, sp, args_base) };
    Ok(code)
}

/// Lay the program-args record out at the top of the stack: the string
/// bytes, then an argv pointer table, then argc. Returns the address of
/// the record.
fn write_proc_args(aspace: AspaceId, stack_top: u64, args: &[String]) -> Result<u64, i64> {
    let mut cursor = stack_top;
    let mut ptrs: Vec<u64> = Vec::with_capacity(args.len());
    for a in args.iter().rev() {
        cursor -= a.len() as u64 + 1;
        vm::user_write(aspace, cursor, a.as_bytes())?;
        vm::user_write(aspace, cursor + a.len() as u64, &[0])?;
        ptrs.push(cursor);
    }
    ptrs.reverse();
    cursor &= !0x7;
    for &p in ptrs.iter().rev() {
        cursor -= 8;
        vm::user_write(aspace, cursor, &p.to_le_bytes())?;
    }
    cursor -= 8;
    vm::user_write(aspace, cursor, &(args.len() as u64).to_le_bytes())?;
    Ok(cursor)
}

// ============================================================================
// Kill / wait / info
// ============================================================================

/// Kill a process. Targets the main thread; the exit path tears down the
/// rest.
pub fn kill_process(pid: Pid) -> Result<(), i64> {
    if pid == KERNEL_PID {
        return Err(ERR_NOT_ALLOWED);
    }
    let main = main_thread(pid).ok_or(ERR_INVALID_HANDLE)?;
    thread::kill_thread(main)
}

pub fn kill_process_nowait(pid: Pid) -> Result<(), i64> {
    if pid == KERNEL_PID {
        return Err(ERR_NOT_ALLOWED);
    }
    let main = main_thread(pid).ok_or(ERR_INVALID_HANDLE)?;
    thread::kill_thread_nowait(main)
}

/// Wait for a process to exit: waiting on its main thread.
pub fn wait_on_process(pid: Pid) -> Result<i32, i64> {
    let main = main_thread(pid).ok_or(ERR_INVALID_HANDLE)?;
    thread::wait_on_thread(main)
}

#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub pid: Pid,
    pub name: String,
    pub state: ProcState,
    pub parent: Pid,
    pub pgid: Pid,
    pub sid: Pid,
    pub num_threads: u32,
}

fn info_of(p: &Process) -> ProcessInfo {
    ProcessInfo {
        pid: p.pid,
        name: p.name.clone(),
        state: p.state,
        parent: p.parent,
        pgid: p.pgid,
        sid: p.sid,
        num_threads: p.num_threads,
    }
}

pub fn get_process_info(pid: Pid) -> Result<ProcessInfo, i64> {
    let sys = PROC_SYS.lock();
    sys.procs.get(&pid).map(info_of).ok_or(ERR_INVALID_HANDLE)
}

/// Iterate the process table. `cookie` starts at 0 and advances past each
/// returned entry; the end of the table is `ERR_NO_MORE_HANDLES`.
pub fn get_next_process_info(cookie: &mut u64) -> Result<ProcessInfo, i64> {
    let sys = PROC_SYS.lock();
    match sys.procs.range(*cookie..).next() {
        Some((&pid, p)) => {
            *cookie = pid + 1;
            Ok(info_of(p))
        }
        None => Err(ERR_NO_MORE_HANDLES),
    }
}

// ============================================================================
// Death
// ============================================================================

/// Final process teardown, run by the exiting main thread once every
/// sibling is gone. Detects orphaned groups, reparents children, unlinks
/// the record everywhere and releases the owned resources. Returns the
/// parent to notify with SIGCHLD.
pub(crate) fn teardown_dead_process(pid: Pid) -> Option<Pid> {
    let mut hup_groups: Vec<Pid> = Vec::new();
    let (parent_pid, aspace, ioctx) = {
        let mut sys = PROC_SYS.lock();
        let p = sys.procs.get(&pid)?;
        assert_eq!(p.state, ProcState::Death, "teardown of live process {}", pid);
        let (my_pgid, my_sid, parent_pid) = (p.pgid, p.sid, p.parent);

        // Our own group may be orphaned by our departure, when the parent
        // lives in another group of the same session.
        let (parent_pgid, parent_sid) = sys
            .procs
            .get(&parent_pid)
            .map(|pp| (pp.pgid, pp.sid))
            .unwrap_or((my_pgid, my_sid));
        if my_pgid != parent_pgid
            && my_sid == parent_sid
            && !pgroup::connected(&sys, my_pgid, parent_pgid, pid)
        {
            hup_groups.push(my_pgid);
        }

        let p = sys.procs.remove(&pid).expect("checked above");

        // Reparent the children; each move can orphan the child's group
        // relative to ours.
        for child in p.children.iter().copied() {
            let child_pgid = match sys.procs.get_mut(&child) {
                Some(c) => {
                    c.parent = parent_pid;
                    c.pgid
                }
                None => continue,
            };
            if let Some(grandparent) = sys.procs.get_mut(&parent_pid) {
                grandparent.children.push(child);
            }
            if child_pgid != my_pgid && !pgroup::connected(&sys, child_pgid, my_pgid, child) {
                hup_groups.push(child_pgid);
            }
        }

        pgroup::remove_group_member(&mut sys, p.pgid, pid);
        pgroup::remove_session_member(&mut sys, p.sid, pid);
        if let Some(parent) = sys.procs.get_mut(&parent_pid) {
            parent.children.retain(|&c| c != pid);
        }

        // Job control: orphaned groups get SIGHUP then SIGCONT, one
        // reschedule deferred to the caller.
        for &g in &hup_groups {
            pgroup::signal_group_locked(&mut sys, g, sig::SIGHUP);
            pgroup::signal_group_locked(&mut sys, g, sig::SIGCONT);
        }

        (p.parent, p.aspace, p.ioctx)
    };

    let _ = vm::delete_address_space(aspace);
    ioctx::free(ioctx);
    sem::free_owned_by(pid);
    crate::log_debug!("[PROC] process {} torn down", pid);
    Some(parent_pid)
}
