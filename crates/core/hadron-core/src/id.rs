//! Type-safe identifiers for kernel resources.
//!
//! These newtypes prevent accidentally mixing a PID with a TID or a file
//! descriptor at compile time, the same discipline the reference
//! workspace applies to its own resource identifiers.

use core::fmt;

/// Process identifier. Assigned by a monotonic counter with wraparound
/// and an existence check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Pid(u32);

impl Pid {
    /// PID of the very first process created at boot.
    pub const INIT: Self = Self(1);

    /// Creates a new `Pid`.
    #[must_use]
    pub const fn new(val: u32) -> Self {
        Self(val)
    }

    /// Returns the raw `u32` value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Thread identifier, unique across the whole system (not just within a process).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Tid(u32);

impl Tid {
    /// Creates a new `Tid`.
    #[must_use]
    pub const fn new(val: u32) -> Self {
        Self(val)
    }

    /// Returns the raw `u32` value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// File descriptor number, scoped to one process's file table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Fd(u32);

impl Fd {
    /// Standard input.
    pub const STDIN: Self = Self(0);
    /// Standard output.
    pub const STDOUT: Self = Self(1);
    /// Standard error.
    pub const STDERR: Self = Self(2);

    /// Creates a new `Fd`.
    #[must_use]
    pub const fn new(val: u32) -> Self {
        Self(val)
    }

    /// Returns the raw `u32` value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the value as `usize` (convenience for indexing a file table).
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Fd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// User identifier, shared by real/effective/saved UID fields in a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Uid(u32);

impl Uid {
    /// The superuser.
    pub const ROOT: Self = Self(0);

    /// Creates a new `Uid`.
    #[must_use]
    pub const fn new(val: u32) -> Self {
        Self(val)
    }

    /// Returns the raw `u32` value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns whether this is the superuser.
    #[must_use]
    pub const fn is_root(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Group identifier, shared by real/effective/saved GID fields and the
/// supplementary-groups list in a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Gid(u32);

impl Gid {
    /// Creates a new `Gid`.
    #[must_use]
    pub const fn new(val: u32) -> Self {
        Self(val)
    }

    /// Returns the raw `u32` value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_roundtrip() {
        let pid = Pid::new(42);
        assert_eq!(pid.as_u32(), 42);
    }

    #[test]
    fn pid_display() {
        assert_eq!(format!("{}", Pid::INIT), "1");
    }

    #[test]
    fn pid_ordering() {
        assert!(Pid::new(1) < Pid::new(2));
    }

    #[test]
    fn tid_roundtrip() {
        let t = Tid::new(7);
        assert_eq!(t.as_u32(), 7);
    }

    #[test]
    fn fd_constants() {
        assert_eq!(Fd::STDIN.as_u32(), 0);
        assert_eq!(Fd::STDOUT.as_u32(), 1);
        assert_eq!(Fd::STDERR.as_u32(), 2);
    }

    #[test]
    fn fd_as_usize() {
        assert_eq!(Fd::new(5).as_usize(), 5);
    }

    #[test]
    fn uid_root_constant() {
        assert!(Uid::ROOT.is_root());
        assert!(!Uid::new(1000).is_root());
    }

    #[test]
    fn gid_roundtrip() {
        assert_eq!(Gid::new(100).as_u32(), 100);
    }
}
