//! Privilege number constants, the index space into a [`crate::cred::PrivBitmap`].
//!
//! Each constant is a bit index, not a flag value; [`crate::cred::Cred::check`]
//! takes one of these directly. Numbers are stable for the life of a
//! booted kernel but are not part of any on-disk or wire format, so
//! renumbering between builds is harmless.

/// Read any vnode regardless of mode bits.
pub const PRIV_VFS_READ: usize = 0;
/// Write any vnode regardless of mode bits.
pub const PRIV_VFS_WRITE: usize = 1;
/// Execute any vnode regardless of mode bits.
pub const PRIV_VFS_EXEC: usize = 2;
/// Traverse any directory regardless of mode bits.
pub const PRIV_VFS_LOOKUP: usize = 3;
/// Stat any vnode regardless of mode bits.
pub const PRIV_VFS_STAT: usize = 4;
/// Bypass the filesystem's normal mount-point boundary.
pub const PRIV_VFS_ADMIN: usize = 5;
/// Change root beyond the caller's own chroot jail.
pub const PRIV_VFS_CHROOT: usize = 6;
/// Mount or unmount a filesystem.
pub const PRIV_VFS_MOUNT: usize = 7;

/// Grow this credential's own effective set from its bounding set.
pub const PRIV_SETEFF: usize = 8;
/// Grow this credential's own bounding set.
pub const PRIV_SETBND: usize = 9;
/// Clear capability bits from another credential.
pub const PRIV_CLRCAP: usize = 10;

/// Set another process's real UID.
pub const PRIV_CRED_SETUID: usize = 11;
/// Set another process's effective UID.
pub const PRIV_CRED_SETEUID: usize = 12;
/// Set another process's saved UID.
pub const PRIV_CRED_SETSUID: usize = 13;
/// Set another process's real GID.
pub const PRIV_CRED_SETGID: usize = 14;
/// Set another process's effective GID.
pub const PRIV_CRED_SETEGID: usize = 15;
/// Set another process's saved GID.
pub const PRIV_CRED_SETSGID: usize = 16;
/// Set another process's supplementary group list.
pub const PRIV_CRED_SETGROUPS: usize = 17;

/// Change a session's login name after it has been set once.
pub const PRIV_PROC_SETLOGIN: usize = 18;

/// Signal a process owned by a different credential.
pub const PRIV_SIGNAL_OTHER: usize = 19;

/// Write a sysctl node, in addition to the node's own `WRITE` flag.
pub const PRIV_SYSCTL_WRITE: usize = 20;

/// Set termios/line-discipline attributes on a tty not owned by the caller.
pub const PRIV_TTY_SETA: usize = 21;

/// One past the highest assigned privilege number; callers sizing a
/// bitmap should use [`crate::cred::PRIV_MENT`], not this directly.
pub const COUNT: usize = 22;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_are_dense_and_in_range() {
        let numbers = [
            PRIV_VFS_READ,
            PRIV_VFS_WRITE,
            PRIV_VFS_EXEC,
            PRIV_VFS_LOOKUP,
            PRIV_VFS_STAT,
            PRIV_VFS_ADMIN,
            PRIV_VFS_CHROOT,
            PRIV_VFS_MOUNT,
            PRIV_SETEFF,
            PRIV_SETBND,
            PRIV_CLRCAP,
            PRIV_CRED_SETUID,
            PRIV_CRED_SETEUID,
            PRIV_CRED_SETSUID,
            PRIV_CRED_SETGID,
            PRIV_CRED_SETEGID,
            PRIV_CRED_SETSGID,
            PRIV_CRED_SETGROUPS,
            PRIV_PROC_SETLOGIN,
            PRIV_SIGNAL_OTHER,
            PRIV_SYSCTL_WRITE,
            PRIV_TTY_SETA,
        ];
        for n in numbers {
            assert!(n < COUNT);
        }
    }
}
