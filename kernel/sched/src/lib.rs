//! Thread descriptors, the ready-queue dispatcher, and load-average
//! tracking.
//!
//! FIFO and OTHER share one global scheduler instance behind a single
//! lock, the same single-CPU, single-mutex discipline `hadron-mm`
//! uses for its allocators: every queue operation here takes the whole
//! scheduler state, so there is no separate per-queue locking to get
//! wrong.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

pub mod loadavg;
pub mod queue;
pub mod thread;

pub use queue::{
    current, dispatch, thread_alarm, thread_create, thread_die, thread_fork, thread_info, thread_ready, thread_reap,
    thread_release, thread_set_signals, thread_sleep, thread_tick, thread_wait, thread_yield, MAX_THREADS,
    OTHER_TIMESLICE,
};
pub use thread::{Policy, ThreadFlags, ThreadInfo, ThreadState, TMNOVAL};
