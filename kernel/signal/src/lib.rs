//! Per-thread signal state, dispatch at syscall/abort return, and the
//! fatal-fault-to-signal mapping.
//!
//! Delivery is split deliberately from its two callers: the syscall
//! exit path and the abort return path both resolve the next
//! deliverable signal with [`state::SignalState::take_deliverable`] and
//! then hand the result to [`trampoline::build_entry`] to compute the
//! register/stack values that land the faulting thread in its handler.
//! Actually copying the frame into user memory is the caller's job
//! (`hadron-proc`), since that requires a live address space this crate
//! has no access to.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

pub mod set;
pub mod signal;
pub mod state;
pub mod trampoline;

pub use set::SigSet;
pub use signal::{DefaultAction, Signal, NSIG};
pub use state::{Disposition, SignalState};
pub use trampoline::{build_entry, recover_nested_fault, SigInfo, TrapFrame};
