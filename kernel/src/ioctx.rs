//! Per-process I/O context
//!
//! Working directory and descriptor table, cloned from the parent at
//! process creation and freed with the process. The filesystem itself is a
//! separate subsystem; descriptors here are opaque handles into it.

use alloc::collections::BTreeMap;
use alloc::string::String;

use crate::klock::IrqSpinLock;

pub type IoCtxId = u64;

#[derive(Clone, Debug)]
pub struct FdEntry {
    pub vfs_fd: i32,
    pub flags: u32,
}

struct IoCtx {
    cwd: String,
    fds: BTreeMap<i32, FdEntry>,
    next_fd: i32,
}

struct IoCtxSys {
    table: BTreeMap<IoCtxId, IoCtx>,
    next_id: IoCtxId,
}

static IOCTX: IrqSpinLock<IoCtxSys> = IrqSpinLock::new(IoCtxSys {
    table: BTreeMap::new(),
    next_id: 1,
});

/// Create an I/O context, cloning cwd and descriptors from `parent` when
/// given. A fresh context gets `/` and stdio descriptors 0..2.
pub fn create(parent: Option<IoCtxId>) -> IoCtxId {
    let mut sys = IOCTX.lock();
    let ctx = match parent.and_then(|p| sys.table.get(&p)) {
        Some(p) => IoCtx {
            cwd: p.cwd.clone(),
            fds: p.fds.clone(),
            next_fd: p.next_fd,
        },
        None => {
            let mut fds = BTreeMap::new();
            for fd in 0..3 {
                fds.insert(fd, FdEntry { vfs_fd: fd, flags: 0 });
            }
            IoCtx {
                cwd: String::from("/"),
                fds,
                next_fd: 3,
            }
        }
    };
    let id = sys.next_id;
    sys.next_id += 1;
    sys.table.insert(id, ctx);
    id
}

pub fn free(id: IoCtxId) {
    IOCTX.lock().table.remove(&id);
}

pub fn cwd(id: IoCtxId) -> Option<String> {
    IOCTX.lock().table.get(&id).map(|c| c.cwd.clone())
}

pub fn set_cwd(id: IoCtxId, cwd: &str) -> bool {
    match IOCTX.lock().table.get_mut(&id) {
        Some(c) => {
            c.cwd = String::from(cwd);
            true
        }
        None => false,
    }
}
