//! The system-wide `securelevel`: a monotonically non-decreasing integer
//! that, once raised, additionally gates privileged operations beyond
//! what a credential's own capability sets allow (e.g. above level 0,
//! lowering the clock or rewriting immutable-flagged files is refused
//! even to root). Registered into the sysctl tree so userspace can read
//! it and, while still at a permissive level, raise it.

use core::sync::atomic::{AtomicI32, Ordering};

use hadron_syscall::sysctl::{self, NodeValue, SysctlFlags};

/// Permissive level: ordinary privilege checks are the only gate.
pub const PERMISSIVE: i32 = 0;
/// Highest level this kernel defines; callers must not raise it further.
pub const MAX: i32 = 2;

static LEVEL: AtomicI32 = AtomicI32::new(PERMISSIVE);

/// Registers `security.securelevel` (read/write) and
/// `security.suser_enabled` (read-only, always `true`) in the sysctl
/// tree. Called once at boot.
///
/// # Errors
///
/// Returns whatever [`sysctl::register`] returns if either node name is
/// already registered.
pub fn init() -> Result<(), hadron_core::errno::Errno> {
    sysctl::register(
        "security.securelevel",
        NodeValue::Int(PERMISSIVE),
        SysctlFlags::READ | SysctlFlags::WRITE,
    )?;
    sysctl::register(
        "security.suser_enabled",
        NodeValue::Bool(true),
        SysctlFlags::READ,
    )?;
    Ok(())
}

/// Returns the current securelevel.
#[must_use]
pub fn get() -> i32 {
    LEVEL.load(Ordering::Acquire)
}

/// Raises the securelevel to `new`.
///
/// # Errors
///
/// Returns `Err(())` if `new` is not strictly greater than the current
/// level, or exceeds [`MAX`]; the level can never be lowered or skipped
/// downward once set.
pub fn raise_to(new: i32) -> Result<(), ()> {
    if new > MAX {
        return Err(());
    }
    loop {
        let cur = LEVEL.load(Ordering::Acquire);
        if new <= cur {
            return Err(());
        }
        if LEVEL
            .compare_exchange(cur, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return Ok(());
        }
    }
}

/// Returns whether the current securelevel is at least `level`.
#[must_use]
pub fn at_least(level: i32) -> bool {
    get() >= level
}

#[cfg(test)]
mod tests {
    use super::*;
    static TEST_SERIAL: std::sync::Mutex<()> = std::sync::Mutex::new(());

    fn reset() {
        LEVEL.store(PERMISSIVE, Ordering::Release);
    }

    #[test]
    fn starts_permissive() {
        let _guard = TEST_SERIAL.lock().unwrap();
        reset();
        assert_eq!(get(), PERMISSIVE);
        assert!(at_least(PERMISSIVE));
    }

    #[test]
    fn raise_then_reject_lower_or_equal() {
        let _guard = TEST_SERIAL.lock().unwrap();
        reset();
        raise_to(1).unwrap();
        assert_eq!(get(), 1);
        assert_eq!(raise_to(1), Err(()));
        assert_eq!(raise_to(0), Err(()));
    }

    #[test]
    fn rejects_above_max() {
        let _guard = TEST_SERIAL.lock().unwrap();
        reset();
        assert_eq!(raise_to(MAX + 1), Err(()));
    }

    #[test]
    fn monotonic_raise_succeeds() {
        let _guard = TEST_SERIAL.lock().unwrap();
        reset();
        raise_to(1).unwrap();
        raise_to(2).unwrap();
        assert_eq!(get(), MAX);
    }
}
