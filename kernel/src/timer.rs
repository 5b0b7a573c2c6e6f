//! Timer service: tick clock, one-shot quantum events, thread alarms
//!
//! The scheduler arms a one-shot quantum event per CPU; semaphore waits
//! with timeouts and user alarms park events here too. `tick` runs from the
//! timer interrupt and reports whether the interrupt frame should fall into
//! the dispatcher on its way out.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::klock::IrqSpinLock;
use crate::sem;
use crate::signals;
use crate::smp;
use crate::thread::Tid;

/// What the interrupt tail should do, as returned by interrupt handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntDisposition {
    Reschedule,
    NoReschedule,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum EventKind {
    /// Quantum expiry for one CPU.
    Quantum { cpu: u32 },
    /// Per-thread alarm; delivers SIGALRM.
    Alarm { tid: Tid },
    /// Semaphore acquire timeout.
    SemTimeout { tid: Tid },
}

struct TimerEvent {
    deadline_ms: u64,
    kind: EventKind,
}

static UPTIME_MS: AtomicU64 = AtomicU64::new(0);

static EVENTS: IrqSpinLock<Vec<TimerEvent>> = IrqSpinLock::new(Vec::new());

pub fn init() {
    crate::log!("[TIMER] timer service ready");
}

/// Milliseconds since boot.
pub fn now_ms() -> u64 {
    UPTIME_MS.load(Ordering::Relaxed)
}

/// Microseconds since boot (tick-granular).
pub fn now_us() -> u64 {
    now_ms() * 1000
}

/// Timer interrupt body, one tick per millisecond. Only the boot CPU
/// advances the clock; every CPU collects its own due events. Events are
/// extracted under the lock and dispatched outside it, the handlers take
/// their own locks.
pub fn tick(cpu: u32) -> IntDisposition {
    if cpu == smp::BOOT_CPU {
        UPTIME_MS.fetch_add(1, Ordering::SeqCst);
    }
    let now = now_ms();

    let mut due: Vec<EventKind> = Vec::new();
    {
        let mut events = EVENTS.lock();
        let mut i = 0;
        while i < events.len() {
            let fires_here = match events[i].kind {
                EventKind::Quantum { cpu: c } => c == cpu,
                // System-wide events fire on the boot CPU
                _ => cpu == smp::BOOT_CPU,
            };
            if fires_here && events[i].deadline_ms <= now {
                due.push(events.swap_remove(i).kind);
            } else {
                i += 1;
            }
        }
    }

    let mut resched = false;
    for kind in due {
        match kind {
            EventKind::Quantum { cpu } => {
                smp::set_preempted(cpu);
                resched = true;
            }
            EventKind::Alarm { tid } => {
                let _ = signals::send_signal(tid, signals::sig::SIGALRM, signals::SIG_FLAG_NO_RESCHED);
                resched = true;
            }
            EventKind::SemTimeout { tid } => {
                sem::timeout_waiter(tid);
                resched = true;
            }
        }
    }

    if resched {
        IntDisposition::Reschedule
    } else {
        IntDisposition::NoReschedule
    }
}

fn set_event(kind: EventKind, delay_ms: u64) {
    let deadline_ms = now_ms() + delay_ms;
    let mut events = EVENTS.lock();
    events.retain(|e| e.kind != kind);
    events.push(TimerEvent { deadline_ms, kind });
}

fn cancel_event(kind: EventKind) {
    EVENTS.lock().retain(|e| e.kind != kind);
}

/// Arm the quantum one-shot for a CPU, replacing any pending one.
pub fn set_quantum(cpu: u32, delay_ms: u64) {
    set_event(EventKind::Quantum { cpu }, delay_ms);
}

pub fn cancel_quantum(cpu: u32) {
    cancel_event(EventKind::Quantum { cpu });
}

/// Arm (or re-arm) a thread's alarm.
pub fn set_alarm(tid: Tid, delay_ms: u64) {
    set_event(EventKind::Alarm { tid }, delay_ms);
}

pub fn cancel_alarm(tid: Tid) {
    cancel_event(EventKind::Alarm { tid });
}

pub(crate) fn set_sem_timeout(tid: Tid, delay_ms: u64) {
    set_event(EventKind::SemTimeout { tid }, delay_ms);
}

pub(crate) fn cancel_sem_timeout(tid: Tid) {
    cancel_event(EventKind::SemTimeout { tid });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_advances_on_boot_cpu_only() {
        let _g = crate::testing::lock();
        let before = now_ms();
        tick(1);
        assert_eq!(now_ms(), before);
        tick(smp::BOOT_CPU);
        assert!(now_ms() > before);
    }

    #[test]
    fn test_quantum_fires_on_owning_cpu() {
        let cpu = 9;
        set_quantum(cpu, 0);
        // Wrong CPU: the event stays armed.
        assert_eq!(tick(8), IntDisposition::NoReschedule);
        assert!(!smp::take_preempted(cpu));
        assert_eq!(tick(cpu), IntDisposition::Reschedule);
        assert!(smp::take_preempted(cpu));
    }

    #[test]
    fn test_rearm_replaces_pending_quantum() {
        let cpu = 11;
        set_quantum(cpu, 0);
        set_quantum(cpu, 1000);
        assert_eq!(tick(cpu), IntDisposition::NoReschedule);
        cancel_quantum(cpu);
    }

    #[test]
    fn test_cancel_quantum() {
        let cpu = 12;
        set_quantum(cpu, 0);
        cancel_quantum(cpu);
        assert_eq!(tick(cpu), IntDisposition::NoReschedule);
    }
}
