//! Builds the register and `siginfo_t` values for entering a user
//! signal handler, without touching any actual address space.
//!
//! Copying the saved frame onto the user stack, writing the `siginfo_t`
//! below it, and loading the resulting register set into the thread's
//! syscall-entry stack frame is `hadron-proc`'s job: it owns the live
//! page tables this crate has no access to. This module only computes
//! *what* those writes should be.

use hadron_core::addr::VirtAddr;
use hadron_core::errno::Errno;

use crate::signal::Signal;

/// Minimal POSIX `siginfo_t` analogue: signal number, an implementation
/// code (unused beyond identifying the source class), and the
/// faulting address for fault-derived signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SigInfo {
    /// The signal number being delivered.
    pub signo: i32,
    /// Source class: 0 for `kill`/`raise`-style delivery, 1 for a
    /// fault-derived signal.
    pub code: i32,
    /// Faulting address, meaningful only when `code == 1`.
    pub addr: u32,
}

impl SigInfo {
    /// Builds a `siginfo_t` for a signal raised by `kill`, not
    /// associated with any particular address.
    #[must_use]
    pub const fn from_kill(sig: Signal) -> Self {
        Self {
            signo: sig.number() as i32,
            code: 0,
            addr: 0,
        }
    }

    /// Builds a `siginfo_t` for a signal derived from a fault at `addr`.
    #[must_use]
    pub const fn from_fault(sig: Signal, addr: VirtAddr) -> Self {
        Self {
            signo: sig.number() as i32,
            code: 1,
            addr: addr.as_u32(),
        }
    }
}

/// The four register values the abort/syscall-exit path must install
/// into the thread's saved user frame to enter a signal handler: PC at
/// the handler, r0 the signal number, r1 the `siginfo_t` pointer, LR
/// the fixed user trampoline (`proc.usigret`) the handler returns
/// through to invoke the signal-return syscall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrapFrame {
    /// New program counter: the handler's entry point.
    pub pc: u32,
    /// New r0: the signal number.
    pub r0: u32,
    /// New r1: the address the `siginfo_t` was written to on the user stack.
    pub r1: u32,
    /// New link register: the user trampoline address.
    pub lr: u32,
}

/// Computes the register values to enter `handler` for `sig`, with the
/// `siginfo_t` already written by the caller at `siginfo_addr` and the
/// saved original frame already pushed below it. `trampoline` is the
/// process's `usigret` address.
#[must_use]
pub fn build_entry(sig: Signal, handler: VirtAddr, siginfo_addr: VirtAddr, trampoline: VirtAddr) -> TrapFrame {
    TrapFrame {
        pc: handler.as_u32(),
        r0: u32::from(sig.number()),
        r1: siginfo_addr.as_u32(),
        lr: trampoline.as_u32(),
    }
}

/// Recovers a thread's saved-frame stack after a second fault hits
/// while a handler built by [`build_entry`] is still running (the
/// fault that would otherwise corrupt or orphan the originally-saved
/// frame underneath the nested handler's own stack usage).
///
/// Stub: the reference source's own trampoline never recovers from
/// this case, and the distilled spec does not define which of the
/// competing saved frames should win (unwind to the outer handler,
/// the original faulting context, or neither). Per the design note on
/// stubbed operations, this is rejected outright rather than guessed
/// at; callers must treat a second fault during handler dispatch as
/// fatal.
///
/// # Errors
///
/// Always returns `Errno::NotSup`.
pub fn recover_nested_fault(_siginfo_addr: VirtAddr) -> Result<TrapFrame, Errno> {
    Err(Errno::NotSup)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_entry_places_signal_number_in_r0() {
        let frame = build_entry(
            Signal::Segv,
            VirtAddr::new(0x1000),
            VirtAddr::new(0x2000),
            VirtAddr::new(0x3000),
        );
        assert_eq!(frame.r0, u32::from(Signal::Segv.number()));
        assert_eq!(frame.pc, 0x1000);
        assert_eq!(frame.r1, 0x2000);
        assert_eq!(frame.lr, 0x3000);
    }

    #[test]
    fn siginfo_from_fault_carries_address() {
        let info = SigInfo::from_fault(Signal::Bus, VirtAddr::new(0xdead_0000));
        assert_eq!(info.code, 1);
        assert_eq!(info.addr, 0xdead_0000);
    }

    #[test]
    fn siginfo_from_kill_has_no_address() {
        let info = SigInfo::from_kill(Signal::Usr1);
        assert_eq!(info.code, 0);
        assert_eq!(info.addr, 0);
    }

    #[test]
    fn nested_fault_recovery_is_an_explicit_stub() {
        assert_eq!(recover_nested_fault(VirtAddr::new(0x2000)), Err(Errno::NotSup));
    }
}
