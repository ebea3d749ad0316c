//! The kernel-wide error type.
//!
//! Every fallible operation in this workspace returns `Result<T, Errno>`
//! instead of raising an exception: the core never uses exceptions,
//! only explicit negative error values. Syscall dispatch (out of scope
//! here) is the only place that should translate an `Errno` into the
//! POSIX `-1` + thread-local-errno convention.

use core::fmt;

/// A kernel error code, shaped after POSIX errno values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Errno {
    /// Invalid argument: bad syscall struct, bad address range, misaligned request.
    Inval,
    /// Bad address: a user pointer did not resolve to a valid mapping.
    Fault,
    /// No such file or directory / no such entry.
    NoEnt,
    /// Not a directory.
    NotDir,
    /// Entry already exists.
    Exist,
    /// Name exceeds `NAME_MAX`.
    NameTooLong,
    /// Operation not permitted: credential check failed outright.
    Perm,
    /// Permission denied: access check failed.
    Access,
    /// Out of memory.
    NoMem,
    /// Resource temporarily unavailable; retry.
    Again,
    /// Too many open files for this process.
    MFile,
    /// Too many open files system-wide.
    NFile,
    /// I/O error.
    Io,
    /// Operation not supported on this object.
    NotSup,
    /// Function not implemented.
    NoSys,
    /// Structural corruption detected but the caller can still recover
    /// (e.g. by treating the structure as empty); not panic-worthy.
    NotRecoverable,
    /// No child processes.
    Child,
    /// No such process.
    Srch,
    /// Executable file has an unrecognized format: no registered loader
    /// claimed it (`ENOEXEC`, spec §6 "Loader registration").
    NoExec,
}

impl Errno {
    /// Returns the POSIX-style symbolic name, as would appear in `errno.h`.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Inval => "EINVAL",
            Self::Fault => "EFAULT",
            Self::NoEnt => "ENOENT",
            Self::NotDir => "ENOTDIR",
            Self::Exist => "EEXIST",
            Self::NameTooLong => "ENAMETOOLONG",
            Self::Perm => "EPERM",
            Self::Access => "EACCES",
            Self::NoMem => "ENOMEM",
            Self::Again => "EAGAIN",
            Self::MFile => "EMFILE",
            Self::NFile => "ENFILE",
            Self::Io => "EIO",
            Self::NotSup => "ENOTSUP",
            Self::NoSys => "ENOSYS",
            Self::NotRecoverable => "ENOTRECOVERABLE",
            Self::Child => "ECHILD",
            Self::Srch => "ESRCH",
            Self::NoExec => "ENOEXEC",
        }
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Convenience alias for the common `Result<T, Errno>` shape.
pub type KResult<T> = Result<T, Errno>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_match_posix() {
        assert_eq!(Errno::Inval.name(), "EINVAL");
        assert_eq!(Errno::NotRecoverable.name(), "ENOTRECOVERABLE");
    }

    #[test]
    fn display_uses_name() {
        assert_eq!(format!("{}", Errno::NoMem), "ENOMEM");
    }

    #[test]
    fn equality() {
        assert_eq!(Errno::Again, Errno::Again);
        assert_ne!(Errno::Again, Errno::Perm);
    }
}
