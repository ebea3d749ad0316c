//! Pseudo-terminal pairs: a master and a slave endpoint, each wrapping
//! one direction of a pair of [`crate::fs_queue::Queue`]s (master-to-slave
//! and slave-to-master).
//!
//! Opening the multiplexer device allocates both queues and a pty
//! number; closing the master tears down both queues and the slave
//! device node, the same lifecycle asymmetry as the reference design
//! (the slave cannot outlive its master).

use hadron_core::errno::Errno;
use hadron_core::id::Tid;
use hadron_core::sync::IrqSpinLock;

use crate::fs_queue::{self, QFlags, QueueId};

/// Maximum number of simultaneously open pty pairs.
pub const MAX_PTYS: usize = 64;

/// One direction of a pty pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The controlling end opened via the multiplexer device.
    Master,
    /// The subordinate end a session attaches to as its controlling terminal.
    Slave,
}

struct Pty {
    /// master write / slave read
    to_slave: QueueId,
    /// slave write / master read
    to_master: QueueId,
}

struct Table {
    slots: [Option<Pty>; MAX_PTYS],
}

impl Table {
    const fn new() -> Self {
        Self { slots: [const { None }; MAX_PTYS] }
    }
}

static TABLE: IrqSpinLock<Table> = IrqSpinLock::named("PTY_TABLE", Table::new());

/// Opaque handle to a pty pair, also its number (as exposed in `/dev/pty<N>`-style naming).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtyId(pub u32);

/// Allocates a new pty pair, creating both backing queues.
///
/// # Errors
///
/// Returns `Errno::NoMem` if no pty slot or backing queue is available.
pub fn open() -> Result<PtyId, Errno> {
    let to_slave = fs_queue::create()?;
    let to_master = match fs_queue::create() {
        Ok(id) => id,
        Err(e) => {
            let _ = fs_queue::destroy(to_slave);
            return Err(e);
        }
    };

    let mut t = TABLE.lock();
    let idx = t.slots.iter().position(Option::is_none).ok_or(Errno::NoMem);
    let idx = match idx {
        Ok(idx) => idx,
        Err(e) => {
            drop(t);
            let _ = fs_queue::destroy(to_slave);
            let _ = fs_queue::destroy(to_master);
            return Err(e);
        }
    };
    t.slots[idx] = Some(Pty { to_slave, to_master });
    Ok(PtyId(idx as u32))
}

/// Tears down a pty pair and both of its queues. Any thread blocked on
/// either queue is woken with a spurious `EAGAIN` the next time it
/// scans for its handle.
///
/// # Errors
///
/// Returns `Errno::Inval` if `id` does not exist.
pub fn close(id: PtyId) -> Result<(), Errno> {
    let mut t = TABLE.lock();
    let slot = t.slots.get_mut(id.0 as usize).ok_or(Errno::Inval)?;
    let pty = slot.take().ok_or(Errno::Inval)?;
    drop(t);
    let _ = fs_queue::destroy(pty.to_slave);
    let _ = fs_queue::destroy(pty.to_master);
    Ok(())
}

fn queues(id: PtyId) -> Result<(QueueId, QueueId), Errno> {
    let t = TABLE.lock();
    let pty = t.slots.get(id.0 as usize).and_then(Option::as_ref).ok_or(Errno::Inval)?;
    Ok((pty.to_slave, pty.to_master))
}

/// Writes `buf` from `side`'s end.
///
/// # Errors
///
/// As [`fs_queue::write`].
pub fn write(id: PtyId, side: Side, flags: QFlags, buf: &[u8], waiter: Tid) -> Result<usize, Errno> {
    let (to_slave, to_master) = queues(id)?;
    let target = match side {
        Side::Master => to_slave,
        Side::Slave => to_master,
    };
    fs_queue::write(target, flags, buf, waiter)
}

/// Reads into `buf` from `side`'s end.
///
/// # Errors
///
/// As [`fs_queue::read`].
pub fn read(id: PtyId, side: Side, flags: QFlags, buf: &mut [u8], waiter: Tid) -> Result<usize, Errno> {
    let (to_slave, to_master) = queues(id)?;
    let source = match side {
        Side::Master => to_master,
        Side::Slave => to_slave,
    };
    fs_queue::read(source, flags, buf, waiter)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t1() -> Tid {
        Tid::new(1)
    }
    fn t2() -> Tid {
        Tid::new(2)
    }

    #[test]
    fn master_writes_slave_reads() {
        let id = open().unwrap();
        write(id, Side::Master, QFlags::empty(), b"login: ", t1()).unwrap();
        let mut buf = [0u8; 7];
        let n = read(id, Side::Slave, QFlags::empty(), &mut buf, t2()).unwrap();
        assert_eq!(&buf[..n], b"login: ");
        close(id).unwrap();
    }

    #[test]
    fn slave_writes_master_reads() {
        let id = open().unwrap();
        write(id, Side::Slave, QFlags::empty(), b"root\n", t2()).unwrap();
        let mut buf = [0u8; 5];
        let n = read(id, Side::Master, QFlags::empty(), &mut buf, t1()).unwrap();
        assert_eq!(&buf[..n], b"root\n");
        close(id).unwrap();
    }

    #[test]
    fn close_invalidates_handle() {
        let id = open().unwrap();
        close(id).unwrap();
        assert_eq!(write(id, Side::Master, QFlags::empty(), b"x", t1()), Err(Errno::Inval));
    }

    #[test]
    fn directions_are_independent() {
        let id = open().unwrap();
        write(id, Side::Master, QFlags::empty(), b"a", t1()).unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(read(id, Side::Master, QFlags::empty(), &mut buf, t1()), Err(Errno::Again));
        close(id).unwrap();
    }
}
