//! Synchronization primitives for the kernel.
//!
//! Two lock flavors cover this kernel's needs: short spinlocks with
//! interrupts disabled (`MTX_TYPE_SPIN`) for data touched from interrupt
//! context (Dynmem, scheduler ready queues, per-buffer locks, the VM
//! region list), and ticket/sleepable locks for larger structures
//! accessed only from thread context (the process table, sync lists).
//! [`SpinLock`] models the latter (usable from a blocking thread
//! context where interrupts remain enabled) and [`IrqSpinLock`] the
//! former.

mod irq_spinlock;
mod spinlock;

pub use irq_spinlock::{IrqSpinLock, IrqSpinLockGuard};
pub use spinlock::{SpinLock, SpinLockGuard};
