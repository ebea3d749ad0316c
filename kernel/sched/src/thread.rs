//! The thread descriptor and the bits describing its scheduling state.

use hadron_core::addr::VirtAddr;
use hadron_core::id::{Pid, Tid};
use hadron_mm::mmu::PageTableId;
use hadron_signal::SignalState;

/// Sentinel `wakeup_at` value meaning "not sleeping on a timer".
pub const TMNOVAL: u64 = u64::MAX;

/// A thread's run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Descriptor allocated but not yet made runnable.
    Init,
    /// On a ready queue, waiting for the dispatcher.
    Ready,
    /// Currently executing on a CPU.
    Exec,
    /// Waiting on some condition other than the ready queue (I/O,
    /// `sigwait`, a sleep timer, another thread).
    Blocked,
    /// Terminated; its slot can be reclaimed once its exit status has
    /// been collected.
    Dead,
}

/// Scheduling policy. FIFO threads always preempt OTHER threads and
/// run to voluntary block/yield; OTHER threads round-robin a fixed
/// timeslice among themselves whenever no FIFO thread is ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// Real-time, run-to-block, highest priority wins ties by queue order.
    Fifo,
    /// Time-shared, round-robin.
    Other,
}

bitflags::bitflags! {
    /// Thread flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ThreadFlags: u16 {
        /// Slot is occupied by a live descriptor.
        const IN_USE = 1 << 0;
        /// Detached: no other thread can `thread_wait` on it, so its
        /// slot is reclaimed immediately on death rather than held for
        /// a joiner.
        const DETACH = 1 << 1;
        /// Currently executing inside a syscall.
        const INSYS = 1 << 2;
        /// Currently executing an abort (fault) handler.
        const INABO = 1 << 3;
        /// A kernel worker thread, never delivered user signals.
        const KWORKER = 1 << 4;
        /// Kernel-internal thread (idle, reaper); excluded from
        /// user-visible thread enumeration.
        const INTERNAL = 1 << 5;
        /// A yield was requested; the dispatcher should not let this
        /// thread immediately re-acquire the CPU within the same tick.
        const YIELD = 1 << 6;
    }
}

/// A thread descriptor.
#[derive(Debug, Clone)]
pub struct ThreadInfo {
    /// This thread's unique identifier.
    pub tid: Tid,
    /// Owning process.
    pub owner: Pid,
    /// Run state.
    pub state: ThreadState,
    /// Flags.
    pub flags: ThreadFlags,
    /// Scheduling policy.
    pub policy: Policy,
    /// Scheduling priority; lower runs first among same-policy threads
    /// at equal queue position.
    pub priority: u8,
    /// The page table this thread runs under.
    pub mpt: PageTableId,
    /// Absolute tick this thread wakes at if blocked in `thread_sleep`,
    /// or [`TMNOVAL`] if not sleeping on a timer.
    pub wakeup_at: u64,
    /// Thread-local storage pointer in the owning process's user
    /// address space.
    pub tls: VirtAddr,
    /// Signal mask, pending set, and handler table.
    pub signals: SignalState,
}

impl ThreadInfo {
    /// Builds a new, not-yet-ready descriptor.
    #[must_use]
    pub fn new(tid: Tid, owner: Pid, policy: Policy, priority: u8, mpt: PageTableId) -> Self {
        Self {
            tid,
            owner,
            state: ThreadState::Init,
            flags: ThreadFlags::IN_USE,
            policy,
            priority,
            mpt,
            wakeup_at: TMNOVAL,
            tls: VirtAddr::new(0),
            signals: SignalState::new(),
        }
    }

    /// Returns whether this thread is sleeping on a timer.
    #[must_use]
    pub const fn is_sleeping(&self) -> bool {
        self.wakeup_at != TMNOVAL
    }
}
