//! Signal numbers and their default (unhandled) dispositions.

/// One past the highest signal number this kernel defines. Signal 0 is
/// not a real signal (used by `kill(pid, 0)` as an existence probe at
/// the syscall layer, out of scope here).
pub const NSIG: usize = 32;

/// A signal number, using the conventional POSIX assignment for the
/// signals this kernel implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Signal {
    /// Hangup.
    Hup = 1,
    /// Interrupt (`Ctrl-C`).
    Int = 2,
    /// Quit, with core dump.
    Quit = 3,
    /// Illegal instruction.
    Ill = 4,
    /// Trace/breakpoint trap.
    Trap = 5,
    /// Abort.
    Abrt = 6,
    /// Bus error (bad alignment or external abort).
    Bus = 7,
    /// Floating point exception.
    Fpe = 8,
    /// Kill; cannot be caught, blocked, or ignored.
    Kill = 9,
    /// User-defined 1.
    Usr1 = 10,
    /// Invalid memory reference.
    Segv = 11,
    /// User-defined 2.
    Usr2 = 12,
    /// Broken pipe.
    Pipe = 13,
    /// Alarm clock.
    Alrm = 14,
    /// Termination.
    Term = 15,
    /// Child stopped or terminated.
    Chld = 17,
    /// Continue if stopped.
    Cont = 18,
    /// Stop; cannot be caught or ignored.
    Stop = 19,
    /// Keyboard stop.
    Tstp = 20,
    /// Background read from control terminal.
    Ttin = 21,
    /// Background write to control terminal.
    Ttou = 22,
    /// Kernel-internal wakeup signal used by `fs_queue` to notify the
    /// opposite end of a pipe or pty of a state change; never delivered
    /// to a user handler.
    SigKern = 31,
}

impl Signal {
    /// Builds a `Signal` from a raw number, if it names one this kernel
    /// defines.
    #[must_use]
    pub const fn from_u8(n: u8) -> Option<Self> {
        Some(match n {
            1 => Self::Hup,
            2 => Self::Int,
            3 => Self::Quit,
            4 => Self::Ill,
            5 => Self::Trap,
            6 => Self::Abrt,
            7 => Self::Bus,
            8 => Self::Fpe,
            9 => Self::Kill,
            10 => Self::Usr1,
            11 => Self::Segv,
            12 => Self::Usr2,
            13 => Self::Pipe,
            14 => Self::Alrm,
            15 => Self::Term,
            17 => Self::Chld,
            18 => Self::Cont,
            19 => Self::Stop,
            20 => Self::Tstp,
            21 => Self::Ttin,
            22 => Self::Ttou,
            31 => Self::SigKern,
            _ => return None,
        })
    }

    /// Returns the signal number.
    #[must_use]
    pub const fn number(self) -> u8 {
        self as u8
    }

    /// Returns whether this signal can never be caught, blocked, or
    /// ignored (`SIGKILL`, `SIGSTOP`).
    #[must_use]
    pub const fn is_uncatchable(self) -> bool {
        matches!(self, Self::Kill | Self::Stop)
    }

    /// The action taken when this signal arrives with no handler
    /// installed.
    #[must_use]
    pub const fn default_action(self) -> DefaultAction {
        match self {
            Self::Chld | Self::Cont => DefaultAction::Ignore,
            Self::Stop | Self::Tstp | Self::Ttin | Self::Ttou => DefaultAction::Stop,
            Self::Ill | Self::Trap | Self::Abrt | Self::Bus | Self::Fpe | Self::Segv | Self::Quit => {
                DefaultAction::CoreDump
            }
            Self::SigKern => DefaultAction::Ignore,
            _ => DefaultAction::Terminate,
        }
    }
}

/// What happens to a process when a signal with no installed handler
/// (or the `SIG_DFL` disposition) is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultAction {
    /// The process exits.
    Terminate,
    /// The process exits and (conceptually) dumps core; core dumps are
    /// out of scope, so this behaves like `Terminate` here.
    CoreDump,
    /// The signal has no effect.
    Ignore,
    /// The process (and typically its whole group) stops.
    Stop,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_through_number() {
        assert_eq!(Signal::from_u8(Signal::Segv.number()), Some(Signal::Segv));
    }

    #[test]
    fn unassigned_numbers_are_none() {
        assert_eq!(Signal::from_u8(16), None);
        assert_eq!(Signal::from_u8(0), None);
    }

    #[test]
    fn kill_and_stop_are_uncatchable() {
        assert!(Signal::Kill.is_uncatchable());
        assert!(Signal::Stop.is_uncatchable());
        assert!(!Signal::Term.is_uncatchable());
    }

    #[test]
    fn default_actions_match_posix_expectations() {
        assert_eq!(Signal::Chld.default_action(), DefaultAction::Ignore);
        assert_eq!(Signal::Stop.default_action(), DefaultAction::Stop);
        assert_eq!(Signal::Segv.default_action(), DefaultAction::CoreDump);
        assert_eq!(Signal::Term.default_action(), DefaultAction::Terminate);
    }
}
