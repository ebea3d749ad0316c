//! Fixed-size packet queue backing pipes and ptys.
//!
//! A ring of fixed-capacity packets. `write` either keeps appending to
//! the most recently opened packet (streaming) or force-closes it and
//! opens a fresh one (`PACKET` flag). `read` either spans packet
//! boundaries (streaming) or stops at the end of the packet it started
//! reading from (`PACKET` flag). In `BLOCK` mode a writer against a
//! full ring, or a reader against an empty one, records itself as the
//! waiting end and the opposite end wakes it the next time it makes
//! progress — a per-endpoint notification standing in for the
//! reference design's kernel-signal-plus-published-pointer mechanism,
//! per the design note that the signal there is a mechanism choice,
//! not a contract.
//!
//! A zero-length write with `PACKET` set still opens and immediately
//! closes an empty packet rather than being a no-op: the reader sees
//! it as a framing marker (e.g. an explicit "end of message" with no
//! payload), matching the source's packet-mode framing behavior.
//!
//! `O_NONBLOCK` ([`QFlags::NONBLOCK`]) is a stub: both calls reject it
//! with `ENOTSUP` rather than guess at semantics the reference source
//! never finished either.

use hadron_core::errno::Errno;
use hadron_core::id::Tid;
use hadron_core::sync::IrqSpinLock;

/// Bytes per packet.
pub const PACKET_SIZE: usize = 128;
/// Number of packet slots in the ring.
pub const NUM_PACKETS: usize = 16;

bitflags::bitflags! {
    /// Per-call behavior flags for [`Queue::write`] and [`Queue::read`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct QFlags: u8 {
        /// Treat this call as packet-framed rather than a byte stream.
        const PACKET = 1 << 0;
        /// Block (record the calling thread as waiting) instead of
        /// returning `EAGAIN` when the call cannot make progress now.
        const BLOCK = 1 << 1;
        /// `O_NONBLOCK` carried through from the open-file descriptor
        /// this end was opened with. Stub: the reference source leaves
        /// `O_NONBLOCK` on pipes as a `TODO`, and distinguishing it from
        /// the already-implemented "absence of `BLOCK`" non-blocking
        /// default would require semantics (e.g. `EPIPE` vs `EAGAIN` on
        /// a closed far end) the distilled spec does not define. Per
        /// the design note on stubbed operations, [`Queue::write`] and
        /// [`Queue::read`] reject this flag with `ENOTSUP` rather than
        /// guessing.
        const NONBLOCK = 1 << 2;
    }
}

#[derive(Clone, Copy)]
struct Packet {
    data: [u8; PACKET_SIZE],
    len: usize,
    closed: bool,
}

impl Packet {
    const EMPTY: Self = Self {
        data: [0; PACKET_SIZE],
        len: 0,
        closed: false,
    };
}

/// A packet-queue instance. Each pipe or pty direction owns one.
pub struct Queue {
    packets: [Packet; NUM_PACKETS],
    /// Index of the packet currently being written (the "last write" cursor).
    write_idx: usize,
    /// Index of the packet currently being read (the "last read" cursor).
    read_idx: usize,
    /// Bytes already consumed from the packet at `read_idx`.
    read_offset: usize,
    /// Number of packets between `read_idx` and `write_idx` inclusive
    /// that hold data not yet fully consumed.
    occupied: usize,
    waiting_reader: Option<Tid>,
    waiting_writer: Option<Tid>,
}

impl Queue {
    /// An empty queue.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            packets: [Packet::EMPTY; NUM_PACKETS],
            write_idx: 0,
            read_idx: 0,
            read_offset: 0,
            occupied: 0,
            waiting_reader: None,
            waiting_writer: None,
        }
    }

    fn ring_full(&self) -> bool {
        self.occupied >= NUM_PACKETS && self.packets[self.write_idx].closed
    }

    fn has_open_packet(&self) -> bool {
        self.occupied > 0 && !self.packets[self.write_idx].closed
    }

    /// Appends `buf` to the queue.
    ///
    /// # Errors
    ///
    /// Returns `Errno::Again` if the ring is full: immediately in
    /// non-blocking mode, or after recording `waiter` as blocked in
    /// `BLOCK` mode (the caller is expected to retry once woken).
    pub fn write(&mut self, flags: QFlags, buf: &[u8], waiter: Tid) -> Result<usize, Errno> {
        if flags.contains(QFlags::NONBLOCK) {
            return Err(Errno::NotSup);
        }
        if buf.is_empty() && flags.contains(QFlags::PACKET) {
            return self.push_marker(waiter);
        }

        if !self.has_open_packet() {
            if self.ring_full() {
                return self.would_block_writer(flags, waiter);
            }
            self.open_next_packet();
        }

        let mut written = 0;
        let mut remaining = buf;
        while !remaining.is_empty() {
            let pkt = &mut self.packets[self.write_idx];
            let space = PACKET_SIZE - pkt.len;
            if space == 0 {
                pkt.closed = true;
                if self.ring_full() {
                    break;
                }
                self.open_next_packet();
                continue;
            }
            let take = remaining.len().min(space);
            let pkt = &mut self.packets[self.write_idx];
            pkt.data[pkt.len..pkt.len + take].copy_from_slice(&remaining[..take]);
            pkt.len += take;
            remaining = &remaining[take..];
            written += take;
        }

        if flags.contains(QFlags::PACKET) {
            self.packets[self.write_idx].closed = true;
        }

        self.wake_reader();

        if written == 0 && !buf.is_empty() {
            return self.would_block_writer(flags, waiter);
        }
        Ok(written)
    }

    fn push_marker(&mut self, waiter: Tid) -> Result<usize, Errno> {
        if self.ring_full() {
            return self.would_block_writer(QFlags::BLOCK, waiter);
        }
        if self.has_open_packet() {
            self.packets[self.write_idx].closed = true;
        }
        self.open_next_packet();
        self.packets[self.write_idx].closed = true;
        self.wake_reader();
        Ok(0)
    }

    fn open_next_packet(&mut self) {
        if self.occupied > 0 {
            self.write_idx = (self.write_idx + 1) % NUM_PACKETS;
        }
        self.packets[self.write_idx] = Packet::EMPTY;
        self.occupied += 1;
    }

    fn would_block_writer(&mut self, flags: QFlags, waiter: Tid) -> Result<usize, Errno> {
        if flags.contains(QFlags::BLOCK) {
            self.waiting_writer = Some(waiter);
            let _ = hadron_sched::thread_wait(waiter);
        }
        Err(Errno::Again)
    }

    fn would_block_reader(&mut self, flags: QFlags, waiter: Tid) -> Result<usize, Errno> {
        if flags.contains(QFlags::BLOCK) {
            self.waiting_reader = Some(waiter);
            let _ = hadron_sched::thread_wait(waiter);
        }
        Err(Errno::Again)
    }

    fn wake_reader(&mut self) {
        if let Some(tid) = self.waiting_reader.take() {
            let _ = hadron_sched::thread_release(tid);
        }
    }

    fn wake_writer(&mut self) {
        if let Some(tid) = self.waiting_writer.take() {
            let _ = hadron_sched::thread_release(tid);
        }
    }

    /// Reads up to `buf.len()` bytes into `buf`.
    ///
    /// # Errors
    ///
    /// Returns `Errno::Again` if the queue is empty: immediately in
    /// non-blocking mode, or after recording `waiter` as blocked in
    /// `BLOCK` mode.
    pub fn read(&mut self, flags: QFlags, buf: &mut [u8], waiter: Tid) -> Result<usize, Errno> {
        if flags.contains(QFlags::NONBLOCK) {
            return Err(Errno::NotSup);
        }
        if self.occupied == 0 {
            return self.would_block_reader(flags, waiter);
        }
        // A zero-length closed packet with nothing ever written is a
        // framing marker; consume it and report zero bytes read
        // without blocking, the mirror image of `push_marker`.
        if self.packets[self.read_idx].len == 0 && self.packets[self.read_idx].closed {
            self.advance_read_packet();
            self.wake_writer();
            return Ok(0);
        }

        let mut read = 0;
        loop {
            if read == buf.len() {
                break;
            }
            if self.occupied == 0 {
                break;
            }
            let pkt = self.packets[self.read_idx];
            if self.read_offset >= pkt.len {
                if !pkt.closed {
                    break;
                }
                self.advance_read_packet();
                if flags.contains(QFlags::PACKET) {
                    break;
                }
                continue;
            }
            let available = pkt.len - self.read_offset;
            let take = available.min(buf.len() - read);
            buf[read..read + take].copy_from_slice(&pkt.data[self.read_offset..self.read_offset + take]);
            self.read_offset += take;
            read += take;
            if flags.contains(QFlags::PACKET) && self.read_offset < pkt.len {
                break;
            }
        }

        self.wake_writer();

        if read == 0 {
            return self.would_block_reader(flags, waiter);
        }
        Ok(read)
    }

    fn advance_read_packet(&mut self) {
        self.read_idx = (self.read_idx + 1) % NUM_PACKETS;
        self.read_offset = 0;
        self.occupied -= 1;
    }
}

impl Default for Queue {
    fn default() -> Self {
        Self::new()
    }
}

/// A global table of named queues, the same `with`-guarded-singleton
/// convention as the rest of this workspace, for callers that want a
/// process-wide queue by handle rather than owning a `Queue` directly
/// (e.g. the pty multiplexer in [`crate::pty`]).
pub struct QueueTable {
    slots: [Option<Queue>; MAX_QUEUES],
}

const MAX_QUEUES: usize = 64;

/// Opaque handle to a queue in the global table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueId(pub u32);

impl QueueTable {
    const fn new() -> Self {
        Self {
            slots: [const { None }; MAX_QUEUES],
        }
    }
}

static TABLE: IrqSpinLock<QueueTable> = IrqSpinLock::named("FS_QUEUES", QueueTable::new());

/// Allocates a fresh queue and returns its handle.
///
/// # Errors
///
/// Returns `Errno::NoMem` if the table is full.
pub fn create() -> Result<QueueId, Errno> {
    let mut t = TABLE.lock();
    let idx = t.slots.iter().position(Option::is_none).ok_or(Errno::NoMem)?;
    t.slots[idx] = Some(Queue::new());
    Ok(QueueId(idx as u32))
}

/// Destroys a queue, waking both ends so neither is left blocked on a
/// queue that no longer exists.
///
/// # Errors
///
/// Returns `Errno::Inval` if `id` does not exist.
pub fn destroy(id: QueueId) -> Result<(), Errno> {
    let mut t = TABLE.lock();
    let slot = t.slots.get_mut(id.0 as usize).ok_or(Errno::Inval)?;
    let q = slot.as_mut().ok_or(Errno::Inval)?;
    q.wake_reader();
    q.wake_writer();
    *slot = None;
    Ok(())
}

/// Writes to the queue identified by `id`.
///
/// # Errors
///
/// Returns `Errno::Inval` if `id` does not exist, otherwise as
/// [`Queue::write`].
pub fn write(id: QueueId, flags: QFlags, buf: &[u8], waiter: Tid) -> Result<usize, Errno> {
    let mut t = TABLE.lock();
    let q = t.slots.get_mut(id.0 as usize).and_then(Option::as_mut).ok_or(Errno::Inval)?;
    q.write(flags, buf, waiter)
}

/// Reads from the queue identified by `id`.
///
/// # Errors
///
/// Returns `Errno::Inval` if `id` does not exist, otherwise as
/// [`Queue::read`].
pub fn read(id: QueueId, flags: QFlags, buf: &mut [u8], waiter: Tid) -> Result<usize, Errno> {
    let mut t = TABLE.lock();
    let q = t.slots.get_mut(id.0 as usize).and_then(Option::as_mut).ok_or(Errno::Inval)?;
    q.read(flags, buf, waiter)
}
