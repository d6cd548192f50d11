//! Interrupt-masking critical sections.
//!
//! The kernel runs on one core, so "nobody else touches this" means "no
//! interrupt handler runs while we do". [`InterruptGuard`] captures that;
//! [`IrqMutex`] pairs it with a `spin::Mutex` so the data is also only
//! reachable through the guard.

use core::ops::{Deref, DerefMut};

use spin::{Mutex, MutexGuard};

use crate::arch;

/// Disables interrupts for its lifetime and restores the previous state on drop.
pub struct InterruptGuard {
    was_enabled: bool,
}

impl InterruptGuard {
    pub fn new() -> Self {
        let was_enabled = arch::interrupts_enabled();
        if was_enabled {
            arch::disable_interrupts();
        }
        Self { was_enabled }
    }

    pub fn was_enabled(&self) -> bool {
        self.was_enabled
    }
}

impl Default for InterruptGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        if self.was_enabled {
            arch::enable_interrupts();
        }
    }
}

/// Runs `f` with interrupts masked.
pub fn without_interrupts<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let _guard = InterruptGuard::new();
    f()
}

pub struct IrqMutex<T> {
    inner: Mutex<T>,
}

// Field order matters: the lock is released before interrupts come back.
pub struct IrqMutexGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    _irq: InterruptGuard,
}

impl<T> IrqMutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    pub fn lock(&self) -> IrqMutexGuard<'_, T> {
        let irq = InterruptGuard::new();
        IrqMutexGuard {
            guard: self.inner.lock(),
            _irq: irq,
        }
    }

    pub fn try_lock(&self) -> Option<IrqMutexGuard<'_, T>> {
        let irq = InterruptGuard::new();
        self.inner.try_lock().map(|guard| IrqMutexGuard { guard, _irq: irq })
    }
}

impl<T> Deref for IrqMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for IrqMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_restores_enabled_state() {
        arch::enable_interrupts();
        {
            let guard = InterruptGuard::new();
            assert!(guard.was_enabled());
            assert!(!arch::interrupts_enabled());
        }
        assert!(arch::interrupts_enabled());
    }

    #[test]
    fn test_nested_guards_keep_interrupts_off_until_outermost() {
        arch::enable_interrupts();
        let outer = InterruptGuard::new();
        {
            let inner = InterruptGuard::new();
            assert!(!inner.was_enabled());
        }
        assert!(!arch::interrupts_enabled());
        drop(outer);
        assert!(arch::interrupts_enabled());
    }

    #[test]
    fn test_guard_leaves_disabled_state_alone() {
        arch::disable_interrupts();
        without_interrupts(|| assert!(!arch::interrupts_enabled()));
        assert!(!arch::interrupts_enabled());
        arch::enable_interrupts();
    }

    #[test]
    fn test_irq_mutex_masks_while_held() {
        arch::enable_interrupts();
        let lock = IrqMutex::new(5u32);
        {
            let mut value = lock.lock();
            *value += 1;
            assert!(!arch::interrupts_enabled());
            assert!(lock.try_lock().is_none());
        }
        assert!(arch::interrupts_enabled());
        assert_eq!(*lock.lock(), 6);
    }
}
