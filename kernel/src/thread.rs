//! Thread management
//!
//! Thread records, the global thread index, and the full lifecycle:
//! creation into a suspended state, suspend/resume through the signal
//! layer, waiting for a retcode, and self-teardown over the shared
//! death-stack pool. The dispatcher itself lives in `sched`; it operates on
//! the state owned here.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::arch;
use crate::errors::*;
use crate::klock::IrqSpinLock;
use crate::process::{self, Pid};
use crate::sched;
use crate::sem::{self, SemId};
use crate::signals::{self, sig, SigAction};
use crate::smp;
use crate::timer;
use crate::vm::{self, AspaceId, RegionId, RegionPlacement, RegionWiring};

pub type Tid = u64;

/// Entry point signature for kernel threads.
pub type KernelEntry = extern "C" fn(u64) -> i32;

pub const THREAD_NAME_LEN: usize = 32;

// Priority bands. 0 is reserved for the per-CPU idle threads; the regular
// band runs up to MAX_USER_PRIORITY and the real-time band sits above it.
pub const NUM_PRIORITIES: i32 = 64;
pub const IDLE_PRIORITY: i32 = 0;
pub const LOWEST_PRIORITY: i32 = 1;
pub const LOW_PRIORITY: i32 = 8;
pub const DEFAULT_PRIORITY: i32 = 16;
pub const HIGH_PRIORITY: i32 = 24;
pub const MAX_USER_PRIORITY: i32 = 47;
pub const MIN_RT_PRIORITY: i32 = 48;
pub const MAX_RT_PRIORITY: i32 = NUM_PRIORITIES - 1;
pub const MAX_PRIORITY: i32 = MAX_RT_PRIORITY;

pub const KERNEL_STACK_SIZE: usize = 64 * 1024;

pub const USER_STACK_SIZE: usize = 256 * 1024;
const USER_STACK_REGION_TOP: u64 = 0x7000_0000_0000;
const USER_STACK_REGION_BOTTOM: u64 = 0x6000_0000_0000;

/// Poll interval while waiting for sibling threads to die during process
/// exit.
const EXIT_POLL_MS: u64 = 10;

/// Upper bound on death stacks regardless of CPU count.
const MAX_DEATH_STACKS: u32 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Birth,
    Ready,
    Running,
    Waiting,
    Suspended,
    FreeOnResched,
}

/// Which queue currently holds the record's id. Mirrors the membership the
/// run/dead queues track, so invariant checks need only the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueueTag {
    None,
    Run(i32),
    Dead,
}

pub struct Thread {
    pub tid: Tid,
    name: String,
    pub state: ThreadState,
    pub next_state: ThreadState,
    pub priority: i32,
    /// CPU currently executing this thread.
    pub cpu: Option<u32>,
    /// CPU that holds this thread's FPU state, if any.
    pub fpu_cpu: Option<u32>,
    /// Whether the FPU state is spilled into the record.
    pub fpu_saved: bool,
    pub kernel: bool,
    pub kstack_region: RegionId,
    pub kstack_top: u64,
    /// Region id and base address; user threads only.
    pub user_stack: Option<(RegionId, u64)>,
    pub proc: Option<Pid>,
    pub aspace: AspaceId,
    entry: u64,
    arg: u64,
    /// Deleted with the exit code at teardown; what `wait_on_thread`
    /// blocks on.
    pub retcode_sem: SemId,
    pub user_time_us: u64,
    pub kernel_time_us: u64,
    pub last_time_us: u64,
    /// Which time bucket is accruing.
    pub in_kernel: bool,
    pub sig_pending: u32,
    pub sig_blocked: u32,
    pub sig_actions: [SigAction; sig::SIG_COUNT],
    pub int_disable_level: u32,
    pub sem_blocking: Option<SemId>,
    pub sem_interruptable: bool,
    pub sem_errcode: i64,
    pub sem_retcode: i32,
    pub(crate) queue: QueueTag,
    pub context: arch::ThreadContext,
}

impl Thread {
    fn new() -> Self {
        Self {
            tid: 0,
            name: String::new(),
            state: ThreadState::Birth,
            next_state: ThreadState::Ready,
            priority: DEFAULT_PRIORITY,
            cpu: None,
            fpu_cpu: None,
            fpu_saved: false,
            kernel: true,
            kstack_region: 0,
            kstack_top: 0,
            user_stack: None,
            proc: None,
            aspace: vm::KERNEL_ASPACE,
            entry: 0,
            arg: 0,
            retcode_sem: 0,
            user_time_us: 0,
            kernel_time_us: 0,
            last_time_us: 0,
            in_kernel: true,
            sig_pending: 0,
            sig_blocked: 0,
            sig_actions: [SigAction::DEFAULT; sig::SIG_COUNT],
            int_disable_level: 0,
            sem_blocking: None,
            sem_interruptable: false,
            sem_errcode: NO_ERROR,
            sem_retcode: 0,
            queue: QueueTag::None,
            context: arch::ThreadContext::new(),
        }
    }

    /// Scrub a recycled record back to its freshly allocated shape.
    fn reset(&mut self) {
        *self = Thread::new();
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn set_name(&mut self, name: &str) {
        let end = name
            .char_indices()
            .take_while(|(i, c)| i + c.len_utf8() <= THREAD_NAME_LEN)
            .map(|(i, c)| i + c.len_utf8())
            .last()
            .unwrap_or(0);
        self.name = String::from(&name[..end]);
    }
}

/// Death-stack pool: a handful of pre-created wired kernel stacks an
/// exiting thread borrows to tear down its own. The bitmap is thread-lock
/// data; the gate semaphore bounds concurrent holders.
pub(crate) struct DeathStacks {
    pub bitmap: u32,
    pub count: u32,
    pub stacks: Vec<(RegionId, u64)>,
}

impl DeathStacks {
    const fn new() -> Self {
        Self {
            bitmap: 0,
            count: 0,
            stacks: Vec::new(),
        }
    }

    pub fn in_use(&self) -> u32 {
        self.bitmap.count_ones()
    }
}

/// Everything the global thread lock guards.
pub(crate) struct ThreadSys {
    pub threads: BTreeMap<Tid, Thread>,
    pub run_queues: [VecDeque<Tid>; NUM_PRIORITIES as usize],
    pub dead_queue: VecDeque<Thread>,
    pub death: DeathStacks,
}

impl ThreadSys {
    const fn new() -> Self {
        const EMPTY: VecDeque<Tid> = VecDeque::new();
        Self {
            threads: BTreeMap::new(),
            run_queues: [EMPTY; NUM_PRIORITIES as usize],
            dead_queue: VecDeque::new(),
            death: DeathStacks::new(),
        }
    }
}

pub(crate) static THREAD_SYS: IrqSpinLock<ThreadSys> = IrqSpinLock::new(ThreadSys::new());

static NEXT_TID: AtomicU64 = AtomicU64::new(1);

/// Gate semaphore bounding concurrent death-stack holders.
static DEATH_GATE: AtomicU64 = AtomicU64::new(0);

/// Never-released semaphore that `snooze` parks on with a timeout.
static SNOOZE_SEM: AtomicU64 = AtomicU64::new(0);

pub fn current_tid() -> Tid {
    smp::current_thread(smp::current_cpu_id())
}

/// Address space of the current thread, for usercopy.
pub fn current_aspace() -> AspaceId {
    let tid = current_tid();
    let sys = THREAD_SYS.lock();
    sys.threads.get(&tid).map(|t| t.aspace).unwrap_or(vm::KERNEL_ASPACE)
}

/// Bring up the thread subsystem: per-CPU idle threads, the death-stack
/// pool, and the snooze semaphore. The kernel process must already exist.
pub fn init(num_cpus: u32) {
    let snooze = sem::create(0, "snooze").expect("snooze sem");
    SNOOZE_SEM.store(snooze, Ordering::SeqCst);

    // Death stacks: one per CPU, capped.
    let count = num_cpus.min(MAX_DEATH_STACKS);
    let gate = sem::create(count as i32, "death stack gate").expect("death gate sem");
    DEATH_GATE.store(gate, Ordering::SeqCst);
    let mut stacks = Vec::with_capacity(count as usize);
    for i in 0..count {
        let (region, _) = vm::create_region(
            vm::KERNEL_ASPACE,
            &format!("death_stack_{}", i),
            KERNEL_STACK_SIZE,
            RegionWiring::Wired,
            RegionPlacement::Anywhere,
        )
        .expect("death stack region");
        let top = vm::region_backing_top(vm::KERNEL_ASPACE, region).expect("death stack top");
        stacks.push((region, top));
    }
    {
        let mut sys = THREAD_SYS.lock();
        sys.death = DeathStacks {
            bitmap: 0,
            count,
            stacks,
        };
    }

    // One idle thread per CPU. They are constructed around the CPU's own
    // execution, never pass through a run queue, and never exit.
    for cpu in 0..num_cpus {
        let tid = NEXT_TID.fetch_add(1, Ordering::SeqCst);
        let (kregion, _) = vm::create_region(
            vm::KERNEL_ASPACE,
            &format!("idle_kstack_{}", cpu),
            KERNEL_STACK_SIZE,
            RegionWiring::Wired,
            RegionPlacement::Anywhere,
        )
        .expect("idle kstack");
        let ktop = vm::region_backing_top(vm::KERNEL_ASPACE, kregion).expect("idle kstack top");

        let mut t = Thread::new();
        t.tid = tid;
        t.set_name(&format!("idle {}", cpu));
        t.priority = IDLE_PRIORITY;
        t.state = ThreadState::Running;
        t.cpu = Some(cpu);
        t.kstack_region = kregion;
        t.kstack_top = ktop;
        t.proc = Some(process::KERNEL_PID);
        t.last_time_us = timer::now_us();
        // Idle threads have no retcode waiters; a handle exists anyway so
        // every live thread looks the same.
        t.retcode_sem = sem::create(0, "idle retcode").expect("idle retcode sem");

        process::attach_thread(process::KERNEL_PID, tid).expect("attach idle");
        THREAD_SYS.lock().threads.insert(tid, t);
        smp::set_idle_thread(cpu, tid);
        smp::set_current_thread(cpu, tid);
    }

    crate::log!("[THREAD] thread subsystem ready ({} death stack(s))", count);
}

// ============================================================================
// Creation
// ============================================================================

/// Create a kernel thread in the kernel process. Like every new thread it
/// starts `Suspended`; resume it to run it.
pub fn create_kernel_thread(name: &str, entry: KernelEntry, arg: u64) -> Result<Tid, i64> {
    create_thread_etc(process::KERNEL_PID, name, entry as usize as u64, arg, DEFAULT_PRIORITY, true)
}

/// Create a kernel thread inside an arbitrary process (the process launch
/// path runs on one of these).
pub fn create_kernel_thread_in_proc(pid: Pid, name: &str, entry: KernelEntry, arg: u64) -> Result<Tid, i64> {
    create_thread_etc(pid, name, entry as usize as u64, arg, DEFAULT_PRIORITY, true)
}

/// Create a user thread. `entry` is a user-space address; the thread gets
/// a user stack carved from the stack region of its process's address
/// space.
pub fn create_user_thread(pid: Pid, name: &str, entry: u64, arg: u64, priority: i32) -> Result<Tid, i64> {
    create_thread_etc(pid, name, entry, arg, priority, false)
}

fn create_thread_etc(pid: Pid, name: &str, entry: u64, arg: u64, priority: i32, kernel: bool) -> Result<Tid, i64> {
    let priority = priority.clamp(LOWEST_PRIORITY, MAX_PRIORITY);
    let tid = NEXT_TID.fetch_add(1, Ordering::SeqCst);

    // Reuse a quiesced record from the dead queue when one is available.
    let mut rec = match THREAD_SYS.lock().dead_queue.pop_front() {
        Some(mut r) => {
            r.reset();
            r
        }
        None => Thread::new(),
    };
    rec.tid = tid;
    rec.set_name(name);
    rec.priority = priority;
    rec.kernel = kernel;
    rec.entry = entry;
    rec.arg = arg;
    rec.last_time_us = timer::now_us();

    rec.retcode_sem = sem::create(0, &format!("thread_{:#x} retcode", tid))?;
    let retsem = rec.retcode_sem;

    THREAD_SYS.lock().threads.insert(tid, rec);

    // Attach to the owning process; racing with the process entering
    // Death undoes the insert.
    let aspace = match process::attach_thread(pid, tid) {
        Ok(aspace) => aspace,
        Err(e) => {
            THREAD_SYS.lock().threads.remove(&tid);
            let _ = sem::delete(retsem);
            return Err(e);
        }
    };

    let unwind = |e: i64| -> i64 {
        process::detach_thread(pid, tid);
        THREAD_SYS.lock().threads.remove(&tid);
        let _ = sem::delete(retsem);
        e
    };

    let (kregion, _) = vm::create_region(
        vm::KERNEL_ASPACE,
        &format!("kstack_{:#x}", tid),
        KERNEL_STACK_SIZE,
        RegionWiring::Wired,
        RegionPlacement::Anywhere,
    )
    .map_err(&unwind)?;
    let ktop = match vm::region_backing_top(vm::KERNEL_ASPACE, kregion) {
        Ok(t) => t,
        Err(e) => {
            let _ = vm::delete_region(vm::KERNEL_ASPACE, kregion);
            return Err(unwind(e));
        }
    };

    let user_stack = if kernel {
        None
    } else {
        match reserve_user_stack(aspace, tid) {
            Ok(s) => Some(s),
            Err(e) => {
                let _ = vm::delete_region(vm::KERNEL_ASPACE, kregion);
                return Err(unwind(e));
            }
        }
    };

    let trampoline = if kernel {
        kernel_thread_trampoline as usize as u64
    } else {
        user_thread_trampoline as usize as u64
    };

    {
        let mut sys = THREAD_SYS.lock();
        let t = sys.threads.get_mut(&tid).expect("fresh thread vanished");
        t.proc = Some(pid);
        t.aspace = aspace;
        t.kstack_region = kregion;
        t.kstack_top = ktop;
        t.user_stack = user_stack;
        let (entry, arg) = (t.entry, t.arg);
        arch::prepare_kernel_stack(&mut t.context, ktop, trampoline, entry, arg);
        t.state = ThreadState::Suspended;
    }

    crate::log_debug!("[THREAD] created {} thread {:#x} '{}' in proc {}", if kernel { "kernel" } else { "user" }, tid, name, pid);
    Ok(tid)
}

/// Reserve a user stack at descending addresses inside the stack region
/// until a slot is free. Address-space exhaustion here is unrecoverable.
fn reserve_user_stack(aspace: AspaceId, tid: Tid) -> Result<(RegionId, u64), i64> {
    reserve_user_stack_named(aspace, &format!("ustack_{:#x}", tid))
}

/// Same reservation for a process's main stack, before its first user
/// thread exists.
pub(crate) fn reserve_user_stack_in(aspace: AspaceId) -> Result<(RegionId, u64), i64> {
    reserve_user_stack_named(aspace, "main stack")
}

fn reserve_user_stack_named(aspace: AspaceId, name: &str) -> Result<(RegionId, u64), i64> {
    let mut addr = USER_STACK_REGION_TOP - USER_STACK_SIZE as u64;
    while addr >= USER_STACK_REGION_BOTTOM {
        match vm::create_region(aspace, name, USER_STACK_SIZE, RegionWiring::Wired, RegionPlacement::Exact(addr)) {
            Ok((region, base)) => return Ok((region, base)),
            Err(ERR_VM_NO_VIRTUAL_SPACE) => addr -= USER_STACK_SIZE as u64,
            Err(e) => return Err(e),
        }
    }
    panic!("user stack region exhausted in aspace {}", aspace);
}

// ============================================================================
// Trampolines
// ============================================================================

/// Release the thread lock the dispatcher kept across the switch, then
/// open interrupts. First code every new thread runs.
extern "C" fn thread_startup() {
    unsafe { THREAD_SYS.unlock_raw() };
    arch::int_enable();
}

extern "C" fn thread_exit_entry(code: i32) -> ! {
    exit(code)
}

extern "C" fn user_thread_start(entry: u64, arg: u64) -> ! {
    let sp = {
        let sys = THREAD_SYS.lock();
        let t = sys.threads.get(&current_tid()).expect("current thread");
        let (_, base) = t.user_stack.expect("user thread without stack");
        base + USER_STACK_SIZE as u64
    };
    let code = unsafe { arch::enter_user_mode(entry, sp, arg) };
    exit(code)
}

#[cfg(all(target_arch = "x86_64", not(test)))]
#[unsafe(naked)]
extern "C" fn kernel_thread_trampoline() {
    // Dispatched with R12 = entry, R13 = arg (see prepare_kernel_stack).
    core::arch::naked_asm!(
        "call {startup}",
        "mov rdi, r13",
        "call r12",
        "mov edi, eax",
        "call {exit}",
        "ud2",
        startup = sym thread_startup,
        exit = sym thread_exit_entry,
    );
}

#[cfg(all(target_arch = "x86_64", not(test)))]
#[unsafe(naked)]
extern "C" fn user_thread_trampoline() {
    core::arch::naked_asm!(
        "call {startup}",
        "mov rdi, r12",
        "mov rsi, r13",
        "call {user_start}",
        "ud2",
        startup = sym thread_startup,
        user_start = sym user_thread_start,
    );
}

#[cfg(any(not(target_arch = "x86_64"), test))]
extern "C" fn kernel_thread_trampoline() {
    thread_startup();
    let (entry, arg) = {
        let sys = THREAD_SYS.lock();
        let t = sys.threads.get(&current_tid()).expect("current thread");
        (t.entry, t.arg)
    };
    let entry: KernelEntry = unsafe { core::mem::transmute(entry as usize) };
    thread_exit_entry(entry(arg));
}

#[cfg(any(not(target_arch = "x86_64"), test))]
extern "C" fn user_thread_trampoline() {
    thread_startup();
    let (entry, arg) = {
        let sys = THREAD_SYS.lock();
        let t = sys.threads.get(&current_tid()).expect("current thread");
        (t.entry, t.arg)
    };
    user_thread_start(entry, arg);
}

// ============================================================================
// Suspend / resume / wait / kill
// ============================================================================

/// Stop a thread. Funnels through the signal layer so stopped-vs-runnable
/// has a single owner.
pub fn suspend_thread(tid: Tid) -> Result<(), i64> {
    signals::send_signal(tid, sig::SIGSTOP, signals::SIG_FLAG_NO_RESCHED)
}

/// Make a suspended (or newly created) thread runnable.
pub fn resume_thread(tid: Tid) -> Result<(), i64> {
    signals::send_signal(tid, sig::SIGCONT, signals::SIG_FLAG_NO_RESCHED)
}

/// Wait for a thread to exit and collect its exit code. A deleted retcode
/// handle is the expected way to learn the code, so `ERR_SEM_DELETED` is
/// success here.
pub fn wait_on_thread(tid: Tid) -> Result<i32, i64> {
    let retsem = {
        let sys = THREAD_SYS.lock();
        sys.threads.get(&tid).ok_or(ERR_INVALID_HANDLE)?.retcode_sem
    };
    // A stopped thread that is the target of an in-flight kill must be
    // allowed to reach its exit path.
    let _ = signals::send_signal(tid, sig::SIGCONT, signals::SIG_FLAG_NO_RESCHED);

    match sem::acquire_etc(retsem, 1, sem::SEM_FLAG_INTERRUPTABLE, 0) {
        Ok(()) | Err(ERR_SEM_DELETED) => {
            let me = current_tid();
            let sys = THREAD_SYS.lock();
            Ok(sys.threads.get(&me).map(|t| t.sem_retcode).unwrap_or(0))
        }
        Err(e) => Err(e),
    }
}

/// Kill a thread and wait for it to be gone.
pub fn kill_thread(tid: Tid) -> Result<(), i64> {
    if tid == current_tid() {
        exit(-(sig::SIGKILLTHR as i32));
    }
    signals::send_signal(tid, sig::SIGKILLTHR, 0)?;
    match wait_on_thread(tid) {
        Ok(_) | Err(ERR_INVALID_HANDLE) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Kill without waiting.
pub fn kill_thread_nowait(tid: Tid) -> Result<(), i64> {
    signals::send_signal(tid, sig::SIGKILLTHR, 0)
}

/// Change a thread's priority. Ready threads are moved to the queue of
/// their new level; the change is effective at the next selection.
pub fn set_thread_priority(tid: Tid, priority: i32) -> Result<(), i64> {
    let priority = priority.clamp(LOWEST_PRIORITY, MAX_PRIORITY);
    let mut sys = THREAD_SYS.lock();
    if !sys.threads.contains_key(&tid) {
        return Err(ERR_INVALID_HANDLE);
    }
    let on_queue = matches!(sys.threads[&tid].queue, QueueTag::Run(_));
    if on_queue {
        sched::remove_from_run_queue(&mut sys, tid);
    }
    sys.threads.get_mut(&tid).unwrap().priority = priority;
    if on_queue {
        sched::enqueue_run_queue(&mut sys, tid);
    }
    Ok(())
}

/// Give up the CPU, staying runnable.
pub fn yield_now() {
    sched::resched();
}

/// Park the calling CPU in its idle thread. Each CPU's boot flow ends
/// here once bring-up is complete.
pub fn idle_loop() -> ! {
    loop {
        arch::halt();
    }
}

/// Sleep for at least `usecs` microseconds. Parks on a semaphore nobody
/// releases, so the timeout is the wakeup.
pub fn snooze(usecs: u64) -> Result<(), i64> {
    if usecs == 0 {
        yield_now();
        return Ok(());
    }
    let sem = SNOOZE_SEM.load(Ordering::SeqCst);
    let ms = usecs.div_ceil(1000).max(1);
    match sem::acquire_etc(sem, 1, sem::SEM_FLAG_TIMEOUT, ms) {
        Err(ERR_TIMED_OUT) | Ok(()) => Ok(()),
        Err(e) => Err(e),
    }
}

// ============================================================================
// Kernel entry/exit accounting
// ============================================================================

/// Trap-handler hook: user mode is entering the kernel.
pub fn atkernel_entry() {
    let tid = current_tid();
    let now = timer::now_us();
    let mut sys = THREAD_SYS.lock();
    if let Some(t) = sys.threads.get_mut(&tid) {
        t.user_time_us += now.saturating_sub(t.last_time_us);
        t.last_time_us = now;
        t.in_kernel = true;
    }
}

/// Trap-handler hook: the kernel is returning to user mode. Delivers
/// pending signals first, which may suspend or end the thread.
pub fn atkernel_exit() {
    signals::handle_signals();
    let tid = current_tid();
    let now = timer::now_us();
    let mut sys = THREAD_SYS.lock();
    if let Some(t) = sys.threads.get_mut(&tid) {
        t.kernel_time_us += now.saturating_sub(t.last_time_us);
        t.last_time_us = now;
        t.in_kernel = false;
    }
}

/// Interrupt-frame tail: act on the handler's disposition.
pub fn atinterrupt_exit(disposition: timer::IntDisposition) {
    if disposition == timer::IntDisposition::Reschedule {
        sched::resched();
    }
}

// ============================================================================
// Exit
// ============================================================================

struct ExitFrame {
    tid: Tid,
    old_kstack_region: RegionId,
    death_index: u32,
}

/// End the current thread, publishing `retcode` to waiters. If this is the
/// process's main thread the whole process is torn down with it.
pub fn exit(retcode: i32) -> ! {
    let tid = current_tid();
    let cpu = smp::current_cpu_id();

    // Expedite our own teardown.
    {
        let mut sys = THREAD_SYS.lock();
        if let Some(t) = sys.threads.get_mut(&tid) {
            if t.priority < HIGH_PRIORITY {
                t.priority = HIGH_PRIORITY;
            }
        }
    }

    timer::cancel_alarm(tid);
    timer::cancel_sem_timeout(tid);

    // The user stack goes first; we only need the kernel stack from here.
    let (pid, user_stack, retsem) = {
        let sys = THREAD_SYS.lock();
        let t = sys.threads.get(&tid).expect("exiting thread");
        (t.proc.expect("thread without process"), t.user_stack, t.retcode_sem)
    };
    if let Some((region, _)) = user_stack {
        let aspace = {
            let sys = THREAD_SYS.lock();
            sys.threads.get(&tid).map(|t| t.aspace).unwrap_or(vm::KERNEL_ASPACE)
        };
        let _ = vm::delete_region(aspace, region);
        let mut sys = THREAD_SYS.lock();
        if let Some(t) = sys.threads.get_mut(&tid) {
            t.user_stack = None;
        }
    }

    if pid != process::KERNEL_PID {
        // Move ourselves into the kernel process so the dying one can be
        // freed, and stand on the kernel address space.
        let was_main = process::detach_exiting_thread(pid, tid);
        {
            let mut sys = THREAD_SYS.lock();
            if let Some(t) = sys.threads.get_mut(&tid) {
                t.proc = Some(process::KERNEL_PID);
                t.aspace = vm::KERNEL_ASPACE;
            }
        }
        smp::set_active_aspace(cpu, vm::KERNEL_ASPACE);

        if was_main {
            // The process dies with us: kill the siblings and wait them
            // out. The 10 ms poll matches the documented interval.
            let siblings = process::thread_list(pid);
            {
                let mut sys = THREAD_SYS.lock();
                for s in siblings {
                    let _ = signals::send_signal_locked(&mut sys, s, sig::SIGKILLTHR, signals::SIG_FLAG_NO_RESCHED);
                }
            }
            while process::thread_count(pid) > 0 {
                let _ = snooze(EXIT_POLL_MS * 1000);
            }
            let parent = process::teardown_dead_process(pid);
            if let Some(parent) = parent {
                let _ = signals::send_proc_signal(parent, sig::SIGCHLD, signals::SIG_FLAG_NO_RESCHED);
            }
        }
    }

    // Publish the exit code to waiters.
    let _ = sem::delete_etc(retsem, retcode);

    // Borrow a death stack; the gate bounds concurrent holders so the
    // bitmap scan below always finds a free bit.
    let gate = DEATH_GATE.load(Ordering::SeqCst);
    sem::acquire(gate, 1).expect("death stack gate");
    let (death_index, death_top, old_kstack_region) = {
        let mut sys = THREAD_SYS.lock();
        let bit = (0..sys.death.count).find(|i| sys.death.bitmap & (1 << i) == 0);
        let bit = match bit {
            Some(b) => b,
            None => panic!("death stack bitmap full with gate held ({} in use)", sys.death.in_use()),
        };
        sys.death.bitmap |= 1 << bit;
        let (region, top) = sys.death.stacks[bit as usize];
        let t = sys.threads.get_mut(&tid).expect("exiting thread");
        let old_region = t.kstack_region;
        // Interrupts arriving after this point run on the death stack.
        t.kstack_region = region;
        t.kstack_top = top;
        (bit, top, old_region)
    };

    let frame = alloc::boxed::Box::into_raw(alloc::boxed::Box::new(ExitFrame {
        tid,
        old_kstack_region,
        death_index,
    }));

    let ints = arch::int_disable();
    unsafe {
        arch::switch_stack_and_call(death_top, exit_continuation, frame as usize);
    }
    // Only the portable stub comes back here.
    arch::int_restore(ints);
    panic!("thread {:#x} resumed after exit", tid);
}

/// Runs on the death stack: free the old kernel stack, unlink the record,
/// hand the death stack back, and dispatch away forever.
extern "C" fn exit_continuation(arg: usize) {
    let frame = unsafe { alloc::boxed::Box::from_raw(arg as *mut ExitFrame) };
    arch::int_enable();

    let _ = vm::delete_region(vm::KERNEL_ASPACE, frame.old_kstack_region);

    process::detach_thread(process::KERNEL_PID, frame.tid);

    let gate = DEATH_GATE.load(Ordering::SeqCst);
    {
        let mut sys = THREAD_SYS.lock();
        if let Some(t) = sys.threads.get_mut(&frame.tid) {
            t.next_state = ThreadState::FreeOnResched;
        }
        sys.death.bitmap &= !(1 << frame.death_index);
    }
    let _ = sem::release_etc(gate, 1, sem::SEM_FLAG_NO_RESCHED);

    // The dispatcher moves the record to the dead queue and never
    // switches back into it.
    sched::resched();
}

// ============================================================================
// Info
// ============================================================================

#[derive(Debug, Clone)]
pub struct ThreadInfo {
    pub tid: Tid,
    pub name: String,
    pub state: ThreadState,
    pub priority: i32,
    pub proc: Option<Pid>,
    pub user_time_us: u64,
    pub kernel_time_us: u64,
}

pub fn get_thread_info(tid: Tid) -> Result<ThreadInfo, i64> {
    let sys = THREAD_SYS.lock();
    let t = sys.threads.get(&tid).ok_or(ERR_INVALID_HANDLE)?;
    Ok(ThreadInfo {
        tid: t.tid,
        name: t.name.clone(),
        state: t.state,
        priority: t.priority,
        proc: t.proc,
        user_time_us: t.user_time_us,
        kernel_time_us: t.kernel_time_us,
    })
}
