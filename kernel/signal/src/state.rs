//! Per-thread signal state: mask, pending set, handler table, and the
//! delivery decision made at syscall exit or abort return.

use hadron_core::errno::Errno;
use hadron_mm::mmu::FatalSignal;

use crate::set::SigSet;
use crate::signal::{DefaultAction, Signal, NSIG};

/// What a thread's handler table says to do with a given signal number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Take the signal's [`DefaultAction`].
    Default,
    /// Discard the signal silently.
    Ignore,
    /// Invoke a user handler at this address.
    Handler(u32),
}

/// What the syscall-exit/abort-return path should do once it asks for
/// the next deliverable signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Nothing is deliverable right now.
    None,
    /// Enter the user handler at this address for `sig`.
    Enter {
        /// The signal being delivered.
        sig: Signal,
        /// The handler's entry point.
        handler: u32,
    },
    /// `sig` has no handler (or was sent with the fatal flag); tear the
    /// process down. Never produced for a signal whose disposition is
    /// `Ignore`.
    Terminate(Signal),
    /// `sig`'s default action is to stop the process.
    Stop(Signal),
}

/// Per-thread signal bookkeeping.
#[derive(Debug, Clone, Copy)]
pub struct SignalState {
    mask: SigSet,
    pending: SigSet,
    handlers: [Disposition; NSIG],
    /// Result of a completed `sigwait`, consumed by the syscall that
    /// issued it. `None` while no wait has completed yet.
    sigwait_result: Option<Signal>,
    /// Set of signals a `sigwait` call is currently blocked on; `None`
    /// when the thread is not inside `sigwait`.
    sigwait_set: Option<SigSet>,
}

impl SignalState {
    /// A thread's signal state at creation: empty mask, nothing
    /// pending, every disposition at default.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            mask: SigSet::empty(),
            pending: SigSet::empty(),
            handlers: [Disposition::Default; NSIG],
            sigwait_result: None,
            sigwait_set: None,
        }
    }

    /// Returns the current signal mask.
    #[must_use]
    pub const fn mask(&self) -> SigSet {
        self.mask
    }

    /// Replaces the signal mask. `SIGKILL`/`SIGSTOP` can never be
    /// masked; callers must strip them before calling this, matching
    /// `sigprocmask`'s documented behavior of silently ignoring
    /// attempts to block them.
    pub fn set_mask(&mut self, mask: SigSet) {
        self.mask = mask;
    }

    /// Installs `disposition` for `sig`.
    ///
    /// # Errors
    ///
    /// Returns `Err(())` if `sig` is `SIGKILL` or `SIGSTOP`, whose
    /// disposition can never be changed.
    pub fn set_disposition(&mut self, sig: Signal, disposition: Disposition) -> Result<(), ()> {
        if sig.is_uncatchable() {
            return Err(());
        }
        self.handlers[sig.number() as usize] = disposition;
        Ok(())
    }

    /// Returns the disposition currently installed for `sig`.
    #[must_use]
    pub fn disposition(&self, sig: Signal) -> Disposition {
        self.handlers[sig.number() as usize]
    }

    /// Marks `sig` pending. `SIGKILL`/`SIGSTOP` are always pending in
    /// effect since they bypass masking, but this still records them so
    /// [`Self::take_deliverable`] sees them.
    pub fn raise(&mut self, sig: Signal) {
        self.pending.add(sig.number());
        if let Some(waiting) = self.sigwait_set {
            if waiting.contains(sig.number()) {
                self.pending.remove(sig.number());
                self.sigwait_result = Some(sig);
                self.sigwait_set = None;
            }
        }
    }

    /// Begins a `sigwait` on `set`: if a member of `set` is already
    /// pending it is consumed immediately and returned; otherwise the
    /// wait is recorded and the caller (the scheduler) should block the
    /// thread until [`Self::sigwait_result`] becomes non-`None`.
    pub fn begin_sigwait(&mut self, set: SigSet) -> Option<Signal> {
        if let Some(sig) = self.pending.intersection(set).lowest_unmasked(SigSet::empty()) {
            self.pending.remove(sig.number());
            return Some(sig);
        }
        self.sigwait_set = Some(set);
        None
    }

    /// Takes and clears the result of a completed `sigwait`.
    pub fn take_sigwait_result(&mut self) -> Option<Signal> {
        self.sigwait_result.take()
    }

    /// Resolves the next action the dispatcher should take for this
    /// thread, consuming the corresponding pending bit. `SIGKILL` and
    /// `SIGSTOP` are resolved regardless of the mask, since they cannot
    /// be blocked; every other signal is only considered if unmasked.
    pub fn take_deliverable(&mut self) -> Delivery {
        if self.pending.contains(Signal::Kill.number()) {
            self.pending.remove(Signal::Kill.number());
            return Delivery::Terminate(Signal::Kill);
        }
        if self.pending.contains(Signal::Stop.number()) {
            self.pending.remove(Signal::Stop.number());
            return Delivery::Stop(Signal::Stop);
        }
        let Some(sig) = self.pending.lowest_unmasked(self.mask) else {
            return Delivery::None;
        };
        self.pending.remove(sig.number());
        match self.disposition(sig) {
            Disposition::Ignore => Delivery::None,
            Disposition::Handler(handler) => Delivery::Enter { sig, handler },
            Disposition::Default => match sig.default_action() {
                DefaultAction::Ignore => Delivery::None,
                DefaultAction::Stop => Delivery::Stop(sig),
                DefaultAction::Terminate | DefaultAction::CoreDump => Delivery::Terminate(sig),
            },
        }
    }

    /// Derives the signal state a forked child starts with: the mask
    /// and handler table are inherited verbatim, but the pending set
    /// and any in-progress `sigwait` are cleared, since those describe
    /// the parent's own outstanding deliveries, not the child's (spec
    /// §4.7 step 8).
    #[must_use]
    pub fn fork_inherit(&self) -> Self {
        Self {
            mask: self.mask,
            pending: SigSet::empty(),
            handlers: self.handlers,
            sigwait_result: None,
            sigwait_set: None,
        }
    }

    /// `fcntl(F_SETFL, O_ASYNC)`-style registration: ask for `SIGIO`
    /// when a file descriptor this thread owns becomes I/O-ready.
    ///
    /// Stub: the reference source never finished `O_ASYNC`/`SIGIO`
    /// delivery (no per-fd owner-thread tracking, no readiness-change
    /// notification path), and the distilled spec does not define
    /// either. Per the design note on stubbed operations, this is
    /// rejected outright rather than guessed at.
    ///
    /// # Errors
    ///
    /// Always returns `Errno::NotSup`.
    pub fn enable_async_notify(&mut self) -> Result<(), Errno> {
        Err(Errno::NotSup)
    }
}

impl Default for SignalState {
    fn default() -> Self {
        Self::new()
    }
}

/// Maps a fatal fault classification from the MMU abstraction onto the
/// corresponding signal, with the "fatal" flag implied: fault-derived
/// signals always bypass a user handler and tear the process down
/// rather than entering `take_deliverable`'s masking/disposition path.
#[must_use]
pub fn signal_for_fault(fatal: FatalSignal) -> Signal {
    match fatal {
        FatalSignal::Segv => Signal::Segv,
        FatalSignal::Bus => Signal::Bus,
        FatalSignal::Ill => Signal::Ill,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_disposition_terminates() {
        let mut state = SignalState::new();
        state.raise(Signal::Term);
        assert_eq!(state.take_deliverable(), Delivery::Terminate(Signal::Term));
    }

    #[test]
    fn default_ignore_signal_produces_no_delivery() {
        let mut state = SignalState::new();
        state.raise(Signal::Chld);
        assert_eq!(state.take_deliverable(), Delivery::None);
    }

    #[test]
    fn installed_handler_is_entered() {
        let mut state = SignalState::new();
        state.set_disposition(Signal::Usr1, Disposition::Handler(0x8000)).unwrap();
        state.raise(Signal::Usr1);
        assert_eq!(
            state.take_deliverable(),
            Delivery::Enter {
                sig: Signal::Usr1,
                handler: 0x8000
            }
        );
    }

    #[test]
    fn masked_signal_stays_pending() {
        let mut state = SignalState::new();
        let mut mask = SigSet::empty();
        mask.add(Signal::Term.number());
        state.set_mask(mask);
        state.raise(Signal::Term);
        assert_eq!(state.take_deliverable(), Delivery::None);
    }

    #[test]
    fn kill_cannot_be_masked_or_rebound() {
        let mut state = SignalState::new();
        assert_eq!(state.set_disposition(Signal::Kill, Disposition::Ignore), Err(()));
        state.set_mask(SigSet::full());
        state.raise(Signal::Kill);
        assert_eq!(state.take_deliverable(), Delivery::Terminate(Signal::Kill));
    }

    #[test]
    fn stop_signal_produces_stop_delivery() {
        let mut state = SignalState::new();
        state.raise(Signal::Tstp);
        assert_eq!(state.take_deliverable(), Delivery::Stop(Signal::Tstp));
    }

    #[test]
    fn sigwait_consumes_already_pending_signal() {
        let mut state = SignalState::new();
        state.raise(Signal::Usr1);
        let mut set = SigSet::empty();
        set.add(Signal::Usr1.number());
        assert_eq!(state.begin_sigwait(set), Some(Signal::Usr1));
    }

    #[test]
    fn sigwait_blocks_then_resolves_on_raise() {
        let mut state = SignalState::new();
        let mut set = SigSet::empty();
        set.add(Signal::Usr2.number());
        assert_eq!(state.begin_sigwait(set), None);
        state.raise(Signal::Usr2);
        assert_eq!(state.take_sigwait_result(), Some(Signal::Usr2));
        // Consuming for sigwait means it is not also separately deliverable.
        assert_eq!(state.take_deliverable(), Delivery::None);
    }

    #[test]
    fn fault_mapping_matches_mmu_classification() {
        assert_eq!(signal_for_fault(FatalSignal::Segv), Signal::Segv);
        assert_eq!(signal_for_fault(FatalSignal::Bus), Signal::Bus);
        assert_eq!(signal_for_fault(FatalSignal::Ill), Signal::Ill);
    }

    #[test]
    fn async_notify_is_an_explicit_stub() {
        let mut state = SignalState::new();
        assert_eq!(state.enable_async_notify(), Err(Errno::NotSup));
    }

    #[test]
    fn fork_inherit_keeps_mask_and_handlers_but_clears_pending() {
        let mut parent = SignalState::new();
        let mut mask = SigSet::empty();
        mask.add(Signal::Usr1.number());
        parent.set_mask(mask);
        parent.set_disposition(Signal::Usr2, Disposition::Handler(0x1000)).unwrap();
        parent.raise(Signal::Usr2);

        let child = parent.fork_inherit();
        assert_eq!(child.mask(), mask);
        assert_eq!(child.disposition(Signal::Usr2), Disposition::Handler(0x1000));
        let mut child = child;
        assert_eq!(child.take_deliverable(), Delivery::None);
    }
}
