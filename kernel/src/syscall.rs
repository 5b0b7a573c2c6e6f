//! System call interface
//!
//! The user-facing surface of the process and thread core. Every handler
//! validates and copies its pointer arguments through `usercopy` before
//! touching kernel state; dispatch brackets itself with the kernel
//! entry/exit accounting hooks.

use core::mem::size_of;

use crate::errors::*;
use crate::pgroup;
use crate::process;
use crate::signals;
use crate::thread;
use crate::usercopy;

/// Syscall numbers.
pub mod nr {
    pub const THREAD_CREATE: u64 = 1;
    pub const THREAD_EXIT: u64 = 2;
    pub const THREAD_WAIT: u64 = 3;
    pub const THREAD_SUSPEND: u64 = 4;
    pub const THREAD_RESUME: u64 = 5;
    pub const THREAD_KILL: u64 = 6;
    pub const THREAD_YIELD: u64 = 7;
    pub const THREAD_SNOOZE: u64 = 8;
    pub const THREAD_SET_PRIORITY: u64 = 9;
    pub const THREAD_GET_TID: u64 = 10;

    pub const PROC_CREATE: u64 = 20;
    pub const PROC_KILL: u64 = 21;
    pub const PROC_WAIT: u64 = 22;
    pub const PROC_GET_INFO: u64 = 23;
    pub const PROC_GET_NEXT_INFO: u64 = 24;
    pub const GET_PID: u64 = 25;
    pub const GET_PPID: u64 = 26;

    pub const SETPGID: u64 = 30;
    pub const GETPGID: u64 = 31;
    pub const SETSID: u64 = 32;
    pub const GETSID: u64 = 33;
    pub const SEND_SIGNAL: u64 = 34;
    pub const SEND_PGRP_SIGNAL: u64 = 35;
    pub const SET_ALARM: u64 = 36;
}

const MAX_NAME_COPY: usize = 256;
const MAX_PATH_COPY: usize = 1024;

/// Process info as it crosses the syscall boundary.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ProcessInfoAbi {
    pub pid: u64,
    pub parent: u64,
    pub pgid: u64,
    pub sid: u64,
    pub state: u32,
    pub num_threads: u32,
    pub name: [u8; process::PROC_NAME_LEN],
}

fn abi_of(info: &process::ProcessInfo) -> ProcessInfoAbi {
    let mut name = [0u8; process::PROC_NAME_LEN];
    let bytes = info.name.as_bytes();
    name[..bytes.len()].copy_from_slice(bytes);
    ProcessInfoAbi {
        pid: info.pid,
        parent: info.parent,
        pgid: info.pgid,
        sid: info.sid,
        state: match info.state {
            process::ProcState::Birth => 0,
            process::ProcState::Normal => 1,
            process::ProcState::Death => 2,
        },
        num_threads: info.num_threads,
        name,
    }
}

fn write_info(out_ptr: u64, info: &process::ProcessInfo) -> Result<(), i64> {
    let abi = abi_of(info);
    let bytes = unsafe {
        core::slice::from_raw_parts(&abi as *const ProcessInfoAbi as *const u8, size_of::<ProcessInfoAbi>())
    };
    usercopy::copy_to_user(out_ptr, bytes)
}

/// Syscall entry from the trap handler.
pub fn handle(num: u64, a1: u64, a2: u64, a3: u64, a4: u64) -> i64 {
    thread::atkernel_entry();
    let ret = handle_full(num, a1, a2, a3, a4);
    thread::atkernel_exit();
    ret
}

fn handle_full(num: u64, a1: u64, a2: u64, a3: u64, a4: u64) -> i64 {
    use nr::*;

    match num {
        THREAD_CREATE => sys_thread_create(a1, a2, a3, a4 as i32),
        THREAD_EXIT => thread::exit(a1 as i32),
        THREAD_WAIT => ret_val(thread::wait_on_thread(a1).map(|c| c as i64)),
        THREAD_SUSPEND => ret(thread::suspend_thread(a1)),
        THREAD_RESUME => ret(thread::resume_thread(a1)),
        THREAD_KILL => ret(thread::kill_thread(a1)),
        THREAD_YIELD => {
            thread::yield_now();
            NO_ERROR
        }
        THREAD_SNOOZE => ret(thread::snooze(a1)),
        THREAD_SET_PRIORITY => sys_set_priority(a1, a2 as i32),
        THREAD_GET_TID => thread::current_tid() as i64,

        PROC_CREATE => sys_proc_create(a1, a2, a3, a4 as u32),
        PROC_KILL => ret(process::kill_process(a1)),
        PROC_WAIT => ret_val(process::wait_on_process(a1).map(|c| c as i64)),
        PROC_GET_INFO => sys_proc_get_info(a1, a2),
        PROC_GET_NEXT_INFO => sys_proc_get_next_info(a1, a2),
        GET_PID => process::current_pid() as i64,
        GET_PPID => ret_val(
            process::get_process_info(process::current_pid()).map(|i| i.parent as i64),
        ),

        SETPGID => ret_val(pgroup::setpgid(a1, a2).map(|g| g as i64)),
        GETPGID => ret_val(pgroup::getpgid(a1).map(|g| g as i64)),
        SETSID => ret_val(pgroup::setsid().map(|s| s as i64)),
        GETSID => ret_val(pgroup::getsid(a1).map(|s| s as i64)),
        SEND_SIGNAL => ret(signals::send_signal(a1, a2 as u32, 0)),
        SEND_PGRP_SIGNAL => ret(pgroup::send_signal_to_pgroup(a1, a2 as u32, 0)),
        SET_ALARM => ret(signals::alarm(thread::current_tid(), a1)),

        _ => ERR_UNIMPLEMENTED,
    }
}

#[inline]
fn ret(r: Result<(), i64>) -> i64 {
    match r {
        Ok(()) => NO_ERROR,
        Err(e) => e,
    }
}

#[inline]
fn ret_val(r: Result<i64, i64>) -> i64 {
    match r {
        Ok(v) => v,
        Err(e) => e,
    }
}

fn sys_thread_create(name_ptr: u64, entry: u64, arg: u64, priority: i32) -> i64 {
    let name = match usercopy::copy_string_from_user(name_ptr, MAX_NAME_COPY) {
        Ok(n) => n,
        Err(e) => return e,
    };
    if !crate::vm::is_user_address(entry) {
        return ERR_INVALID_ARGS;
    }
    let priority = priority.clamp(thread::LOWEST_PRIORITY, thread::MAX_USER_PRIORITY);
    ret_val(
        thread::create_user_thread(process::current_pid(), &name, entry, arg, priority)
            .map(|t| t as i64),
    )
}

fn sys_set_priority(tid: u64, priority: i32) -> i64 {
    // User-settable priorities stop below the real-time band.
    let priority = priority.clamp(thread::LOWEST_PRIORITY, thread::MAX_USER_PRIORITY);
    ret(thread::set_thread_priority(tid, priority))
}

fn sys_proc_create(path_ptr: u64, argv_ptr: u64, argc: u64, flags: u32) -> i64 {
    let path = match usercopy::copy_string_from_user(path_ptr, MAX_PATH_COPY) {
        Ok(p) => p,
        Err(e) => return e,
    };
    if argc > 64 {
        return ERR_INVALID_ARGS;
    }
    let mut args: alloc::vec::Vec<alloc::string::String> = alloc::vec::Vec::new();
    for i in 0..argc {
        let slot = match usercopy::copy_u64_from_user(argv_ptr + i * 8) {
            Ok(s) => s,
            Err(e) => return e,
        };
        match usercopy::copy_string_from_user(slot, MAX_PATH_COPY) {
            Ok(a) => args.push(a),
            Err(e) => return e,
        }
    }
    let name = path.rsplit('/').next().unwrap_or(&path);
    let arg_refs: alloc::vec::Vec<&str> = args.iter().map(|s| s.as_str()).collect();
    ret_val(process::create_process(name, &path, &arg_refs, flags).map(|p| p as i64))
}

fn sys_proc_get_info(pid: u64, out_ptr: u64) -> i64 {
    if usercopy::validate_user_region(out_ptr, size_of::<ProcessInfoAbi>()).is_err() {
        return ERR_VM_BAD_USER_MEMORY;
    }
    match process::get_process_info(pid) {
        Ok(info) => ret(write_info(out_ptr, &info)),
        Err(e) => e,
    }
}

fn sys_proc_get_next_info(cookie_ptr: u64, out_ptr: u64) -> i64 {
    let mut cookie = match usercopy::copy_u64_from_user(cookie_ptr) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let info = match process::get_next_process_info(&mut cookie) {
        Ok(i) => i,
        Err(e) => return e,
    };
    if let Err(e) = write_info(out_ptr, &info) {
        return e;
    }
    ret(usercopy::copy_to_user(cookie_ptr, &cookie.to_le_bytes()))
}
