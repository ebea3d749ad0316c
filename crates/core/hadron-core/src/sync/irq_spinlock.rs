//! Spinlock variant that also disables interrupts while held.
//!
//! For data touched from interrupt context on this single-CPU target
//! (Dynmem's descriptor table, the scheduler ready queues, per-buffer
//! locks) a plain [`super::SpinLock`] is not enough: an interrupt handler
//! running on the same core could try to re-acquire it and spin forever.
//! `IrqSpinLock` additionally masks IRQs for the duration of the critical
//! section and restores the prior mask on release, mirroring
//! `MTX_TYPE_SPIN` in the reference design.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// A spinlock that disables IRQs on this core while held.
pub struct IrqSpinLock<T> {
    locked: AtomicBool,
    name: &'static str,
    data: UnsafeCell<T>,
}

// SAFETY: see `SpinLock`'s identical reasoning; access is serialized by
// the atomic flag plus IRQ masking.
unsafe impl<T: Send> Send for IrqSpinLock<T> {}
unsafe impl<T: Send> Sync for IrqSpinLock<T> {}

impl<T> IrqSpinLock<T> {
    /// Creates a new unlocked `IrqSpinLock` wrapping `value`.
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            name: "<unnamed>",
            data: UnsafeCell::new(value),
        }
    }

    /// Creates a new unlocked `IrqSpinLock` with a diagnostic name.
    pub const fn named(name: &'static str, value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            name,
            data: UnsafeCell::new(value),
        }
    }

    /// Returns the lock's diagnostic name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Disables IRQs, then spins until the lock is acquired.
    pub fn lock(&self) -> IrqSpinLockGuard<'_, T> {
        let flags = save_flags_and_cli();
        loop {
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return IrqSpinLockGuard {
                    lock: self,
                    flags,
                    _not_send: core::marker::PhantomData,
                };
            }
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
    }

    /// Attempts to acquire the lock without blocking. Restores the IRQ
    /// mask immediately on failure rather than leaving it disabled.
    pub fn try_lock(&self) -> Option<IrqSpinLockGuard<'_, T>> {
        let flags = save_flags_and_cli();
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(IrqSpinLockGuard {
                lock: self,
                flags,
                _not_send: core::marker::PhantomData,
            })
        } else {
            restore_flags(flags);
            None
        }
    }
}

/// RAII guard that releases the [`IrqSpinLock`] and restores the prior
/// IRQ mask when dropped.
///
/// Deliberately `!Send`: the saved CPSR mask is only meaningful on the
/// core that captured it.
pub struct IrqSpinLockGuard<'a, T> {
    lock: &'a IrqSpinLock<T>,
    flags: Flags,
    // A raw pointer marker is !Send and !Sync, which keeps this guard
    // pinned to the core that captured `flags`.
    _not_send: core::marker::PhantomData<*mut ()>,
}

impl<T> Deref for IrqSpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard guarantees exclusive access while it exists.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for IrqSpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard guarantees exclusive access while it exists.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for IrqSpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
        restore_flags(self.flags);
    }
}

/// Saved CPSR interrupt-mask bits (ARMv6 `I`/`F` bits, bits 7 and 6).
#[derive(Clone, Copy)]
struct Flags(u32);

#[cfg(all(target_arch = "arm", target_os = "none"))]
fn save_flags_and_cli() -> Flags {
    use core::arch::asm;
    let cpsr: u32;
    // SAFETY: `mrs`/`cpsid` are privileged-mode-safe reads/writes of the
    // current program status register; no memory is touched.
    unsafe {
        asm!("mrs {0}, cpsr", out(reg) cpsr, options(nomem, nostack, preserves_flags));
        asm!("cpsid i", options(nomem, nostack));
    }
    Flags(cpsr)
}

#[cfg(all(target_arch = "arm", target_os = "none"))]
fn restore_flags(flags: Flags) {
    use core::arch::asm;
    // SAFETY: restores a CPSR value this core previously read from itself.
    unsafe {
        if flags.0 & (1 << 7) == 0 {
            asm!("cpsie i", options(nomem, nostack));
        }
    }
}

// Host fallback so `cargo test` can exercise the locking logic without an
// ARM target; there are no real interrupts to mask here.
#[cfg(not(all(target_arch = "arm", target_os = "none")))]
fn save_flags_and_cli() -> Flags {
    Flags(0)
}

#[cfg(not(all(target_arch = "arm", target_os = "none")))]
fn restore_flags(_flags: Flags) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_unlock() {
        let lock = IrqSpinLock::new(42);
        {
            let guard = lock.lock();
            assert_eq!(*guard, 42);
        }
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn try_lock_fails_when_held() {
        let lock = IrqSpinLock::new(1);
        let _guard = lock.lock();
        assert!(lock.try_lock().is_none());
    }

    #[test]
    fn mutate_through_guard() {
        let lock = IrqSpinLock::new(0);
        {
            let mut guard = lock.lock();
            *guard = 7;
        }
        assert_eq!(*lock.lock(), 7);
    }

    #[test]
    fn named_constructor_reports_name() {
        let lock = IrqSpinLock::named("dynmem_descriptor_lock", ());
        assert_eq!(lock.name(), "dynmem_descriptor_lock");
    }
}
