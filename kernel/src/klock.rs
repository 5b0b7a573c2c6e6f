//! Interrupt-safe spinlocks
//!
//! The two global subsystem locks (thread lock, process lock) are
//! [`IrqSpinLock`]s: a spinlock that disables local interrupts for as long
//! as the guard lives, restoring the previous state on drop. Holding one
//! and taking the other is only legal in the process-then-thread direction.

use core::ops::{Deref, DerefMut};

use crate::arch;

pub struct IrqSpinLock<T> {
    inner: spin::Mutex<T>,
}

pub struct IrqSpinGuard<'a, T> {
    guard: Option<spin::MutexGuard<'a, T>>,
    ints_were_enabled: bool,
}

impl<T> IrqSpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: spin::Mutex::new(value),
        }
    }

    /// Disable interrupts, then spin for the lock. Dropping the guard
    /// releases the lock and restores the saved interrupt state, in that
    /// order.
    pub fn lock(&self) -> IrqSpinGuard<'_, T> {
        let ints_were_enabled = arch::int_disable();
        IrqSpinGuard {
            guard: Some(self.inner.lock()),
            ints_were_enabled,
        }
    }

    /// Take the raw spinlock without touching the interrupt flag. For
    /// paths that manage interrupts themselves (the dispatcher keeps them
    /// disabled across the context switch).
    pub(crate) fn lock_raw(&self) -> spin::MutexGuard<'_, T> {
        self.inner.lock()
    }

    /// Release a lock whose guard was forgotten so it could be held across
    /// a context switch. The caller must own the lock.
    pub(crate) unsafe fn unlock_raw(&self) {
        self.inner.force_unlock();
    }
}

impl<T> Deref for IrqSpinGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.as_ref().unwrap()
    }
}

impl<T> DerefMut for IrqSpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.as_mut().unwrap()
    }
}

impl<T> Drop for IrqSpinGuard<'_, T> {
    fn drop(&mut self) {
        // Unlock before re-enabling interrupts so an interrupt handler can
        // never spin on a lock its own CPU holds.
        self.guard.take();
        arch::int_restore(self.ints_were_enabled);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_restores_interrupt_state() {
        let lock = IrqSpinLock::new(5u32);
        assert!(arch::ints_enabled());
        {
            let mut g = lock.lock();
            assert!(!arch::ints_enabled());
            *g += 1;
        }
        assert!(arch::ints_enabled());
        assert_eq!(*lock.lock(), 6);
    }

    #[test]
    fn test_nested_locks_keep_ints_disabled() {
        let a = IrqSpinLock::new(());
        let b = IrqSpinLock::new(());
        let ga = a.lock();
        {
            let _gb = b.lock();
            assert!(!arch::ints_enabled());
        }
        // Inner drop must not re-enable while the outer guard lives.
        assert!(!arch::ints_enabled());
        drop(ga);
        assert!(arch::ints_enabled());
    }
}
