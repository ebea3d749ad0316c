//! Per-vnode block buffer cache.
//!
//! Bookkeeping lives in a `[Option<BufEntry>; MAX_BUFS]` side table
//! indexed by [`BufId`], the same stable-handle convention
//! `hadron_mm::vralloc` uses for its buffers. The reference design's
//! per-vnode splay tree becomes a linear scan over this flat table
//! keyed by `(vnode, blkno)`; at the bounded buffer-cache sizes this
//! kernel targets the asymptotic difference does not matter, and it
//! keeps every allocator in this workspace working off the same
//! side-table shape.
//!
//! Actual disk I/O is out of scope (§1 Non-goals): [`bread`] and
//! [`bwrite`]/[`bawrite`] take a caller-supplied closure that fills or
//! drains the buffer's bytes, standing in for a block device driver.

use hadron_core::errno::Errno;
use hadron_core::sync::IrqSpinLock;

/// Bytes per cached block. Fixed rather than per-buffer variable to
/// keep buffer storage inline in the side table.
pub const BLOCK_SIZE: usize = 4096;
const MAX_BUFS: usize = 128;

/// Identifies a vnode. Owned by the (out-of-scope) filesystem layer;
/// this cache only uses it as an opaque cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VnodeId(pub u32);

bitflags::bitflags! {
    /// Buffer status flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BufStatus: u8 {
        /// I/O has completed and `data` holds the block's contents.
        const DONE = 1 << 0;
        /// The last I/O on this buffer failed.
        const ERROR = 1 << 1;
        /// Exclusively claimed by one caller; no other caller may read
        /// or mutate `data` until [`brelse`] or a write completes.
        const BUSY = 1 << 2;
        /// Pinned; never reclaimed even once released.
        const LOCKED = 1 << 3;
        /// The in-flight write was issued asynchronously.
        const ASYNC = 1 << 4;
        /// Dirty; must be flushed before the buffer can be reclaimed.
        const DELWRI = 1 << 5;
    }
}

/// Opaque handle to a cached buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufId(u32);

struct BufEntry {
    vnode: VnodeId,
    blkno: u64,
    size: usize,
    data: [u8; BLOCK_SIZE],
    status: BufStatus,
    on_released_list: bool,
}

struct Cache {
    bufs: [Option<BufEntry>; MAX_BUFS],
    released: [Option<BufId>; MAX_BUFS],
}

impl Cache {
    const fn new() -> Self {
        Self {
            bufs: [const { None }; MAX_BUFS],
            released: [const { None }; MAX_BUFS],
        }
    }

    fn find(&self, vnode: VnodeId, blkno: u64) -> Option<BufId> {
        self.bufs.iter().enumerate().find_map(|(i, slot)| {
            slot.as_ref()
                .filter(|e| e.vnode == vnode && e.blkno == blkno)
                .map(|_| BufId(i as u32))
        })
    }

    fn entry(&self, id: BufId) -> Result<&BufEntry, Errno> {
        self.bufs.get(id.0 as usize).and_then(Option::as_ref).ok_or(Errno::Inval)
    }

    fn entry_mut(&mut self, id: BufId) -> Result<&mut BufEntry, Errno> {
        self.bufs.get_mut(id.0 as usize).and_then(Option::as_mut).ok_or(Errno::Inval)
    }

    fn push_released(&mut self, id: BufId) {
        if let Some(slot) = self.released.iter_mut().find(|s| s.is_none()) {
            *slot = Some(id);
            if let Ok(e) = self.entry_mut(id) {
                e.on_released_list = true;
            }
        }
    }
}

static CACHE: IrqSpinLock<Cache> = IrqSpinLock::named("BIO_CACHE", Cache::new());

fn with<R>(f: impl FnOnce(&mut Cache) -> R) -> R {
    f(&mut CACHE.lock())
}

/// Returns the existing buffer for `(vnode, blkno)`, or allocates a
/// fresh, not-yet-populated one, marking it `BUSY` either way so only
/// one caller at a time observes it mid-fill.
///
/// # Errors
///
/// Returns `Errno::Inval` if `size` exceeds [`BLOCK_SIZE`],
/// `Errno::NoMem` if the cache is full, `Errno::Again` if the matching
/// buffer is already `BUSY` in another caller.
pub fn getblk(vnode: VnodeId, blkno: u64, size: usize) -> Result<BufId, Errno> {
    if size > BLOCK_SIZE {
        return Err(Errno::Inval);
    }
    with(|c| {
        if let Some(id) = c.find(vnode, blkno) {
            let e = c.entry_mut(id)?;
            if e.status.contains(BufStatus::BUSY) {
                return Err(Errno::Again);
            }
            e.status |= BufStatus::BUSY;
            if e.on_released_list {
                e.on_released_list = false;
                if let Some(slot) = c.released.iter_mut().find(|s| *s == Some(id)) {
                    *slot = None;
                }
            }
            return Ok(id);
        }
        let idx = c.bufs.iter().position(Option::is_none).ok_or(Errno::NoMem)?;
        c.bufs[idx] = Some(BufEntry {
            vnode,
            blkno,
            size,
            data: [0; BLOCK_SIZE],
            status: BufStatus::BUSY,
            on_released_list: false,
        });
        Ok(BufId(idx as u32))
    })
}

/// Returns a buffer for `(vnode, blkno)` with valid contents, reading
/// it in via `fill` if not already cached and `DONE`.
///
/// # Errors
///
/// Propagates `getblk`'s errors, or whatever `fill` returns; on a
/// `fill` error the buffer is marked `ERROR` and released.
pub fn bread(
    vnode: VnodeId,
    blkno: u64,
    size: usize,
    fill: impl FnOnce(&mut [u8]) -> Result<(), Errno>,
) -> Result<BufId, Errno> {
    let id = getblk(vnode, blkno, size)?;
    let already_done = with(|c| Ok::<_, Errno>(c.entry(id)?.status.contains(BufStatus::DONE)))?;
    if already_done {
        return Ok(id);
    }
    let result = with(|c| {
        let e = c.entry_mut(id)?;
        Ok::<_, Errno>(&mut e.data[..size] as *mut [u8])
    });
    let buf_ptr = result?;
    // SAFETY: `buf_ptr` points at this buffer's own storage inside the
    // cache; no other caller can observe it while BUSY is set.
    let slice = unsafe { &mut *buf_ptr };
    match fill(slice) {
        Ok(()) => with(|c| {
            let e = c.entry_mut(id)?;
            e.status |= BufStatus::DONE;
            e.status.remove(BufStatus::ERROR);
            Ok(id)
        }),
        Err(e) => {
            with(|c| {
                if let Ok(entry) = c.entry_mut(id) {
                    entry.status |= BufStatus::ERROR;
                    entry.status.remove(BufStatus::BUSY);
                }
            });
            Err(e)
        }
    }
}

/// Synchronously writes `bp`'s contents via `drain`, then marks it
/// `DONE` and clears `DELWRI`/`ASYNC`.
///
/// # Errors
///
/// Returns `Errno::Inval` if `bp` does not exist, or whatever `drain`
/// returns.
pub fn bwrite(bp: BufId, drain: impl FnOnce(&[u8]) -> Result<(), Errno>) -> Result<(), Errno> {
    let (ptr, size) = with(|c| {
        let e = c.entry_mut(bp)?;
        Ok::<_, Errno>((e.data.as_ptr(), e.size))
    })?;
    // SAFETY: same single-writer-while-BUSY argument as in `bread`.
    let slice = unsafe { core::slice::from_raw_parts(ptr, size) };
    drain(slice)?;
    with(|c| {
        let e = c.entry_mut(bp)?;
        e.status |= BufStatus::DONE;
        e.status.remove(BufStatus::DELWRI | BufStatus::ASYNC);
        Ok(())
    })
}

/// Like [`bwrite`], but marks the write `ASYNC` first. There is no
/// separate async I/O queue in this workspace (no device driver is in
/// scope), so the write still completes synchronously; the flag exists
/// so callers and tests can distinguish the two call sites.
///
/// # Errors
///
/// Same as [`bwrite`].
pub fn bawrite(bp: BufId, drain: impl FnOnce(&[u8]) -> Result<(), Errno>) -> Result<(), Errno> {
    with(|c| {
        c.entry_mut(bp)?.status |= BufStatus::ASYNC;
        Ok::<_, Errno>(())
    })?;
    bwrite(bp, drain)
}

/// Marks `bp` dirty and defers the write to the reclaim scanner
/// ([`reclaim`]), clearing `BUSY` and moving it to the released list.
///
/// # Errors
///
/// Returns `Errno::Inval` if `bp` does not exist.
pub fn bdwrite(bp: BufId) -> Result<(), Errno> {
    with(|c| {
        let e = c.entry_mut(bp)?;
        e.status |= BufStatus::DELWRI;
        e.status.remove(BufStatus::BUSY);
        Ok::<_, Errno>(())
    })?;
    with(|c| c.push_released(bp));
    Ok(())
}

/// Clears `BUSY` and appends `bp` to the released list for reclaim.
///
/// # Errors
///
/// Returns `Errno::Inval` if `bp` does not exist.
pub fn brelse(bp: BufId) -> Result<(), Errno> {
    with(|c| {
        c.entry_mut(bp)?.status.remove(BufStatus::BUSY);
        Ok::<_, Errno>(())
    })?;
    with(|c| c.push_released(bp));
    Ok(())
}

/// Returns whether `bp` has completed I/O, or carries an I/O error.
///
/// # Errors
///
/// Returns `Errno::Inval` if `bp` does not exist, `Errno::Io` if the
/// buffer's last operation set `ERROR`.
pub fn biowait(bp: BufId) -> Result<(), Errno> {
    with(|c| {
        let e = c.entry(bp)?;
        if e.status.contains(BufStatus::ERROR) {
            return Err(Errno::Io);
        }
        if e.status.contains(BufStatus::DONE) {
            return Ok(());
        }
        Err(Errno::Again)
    })
}

/// Sets or clears `LOCKED` (pinned, never reclaimed).
///
/// # Errors
///
/// Returns `Errno::Inval` if `bp` does not exist.
pub fn set_locked(bp: BufId, locked: bool) -> Result<(), Errno> {
    with(|c| {
        let e = c.entry_mut(bp)?;
        if locked {
            e.status |= BufStatus::LOCKED;
        } else {
            e.status.remove(BufStatus::LOCKED);
        }
        Ok(())
    })
}

/// Walks the released list, flushing any `DELWRI` buffer via `flush`
/// and freeing its slot, skipping anything `LOCKED`. Returns the
/// number of buffers freed.
///
/// # Errors
///
/// Stops and returns the first error `flush` reports; buffers visited
/// before the failing one are still freed.
pub fn reclaim(mut flush: impl FnMut(VnodeId, u64, &[u8]) -> Result<(), Errno>) -> Result<usize, Errno> {
    with(|c| {
        let mut freed = 0;
        for slot_idx in 0..MAX_BUFS {
            let Some(id) = c.released[slot_idx] else { continue };
            let Ok(entry) = c.entry(id) else {
                c.released[slot_idx] = None;
                continue;
            };
            if entry.status.contains(BufStatus::LOCKED) {
                continue;
            }
            if entry.status.contains(BufStatus::DELWRI) {
                flush(entry.vnode, entry.blkno, &entry.data[..entry.size])?;
            }
            c.bufs[id.0 as usize] = None;
            c.released[slot_idx] = None;
            freed += 1;
        }
        Ok(freed)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    static TEST_SERIAL: std::sync::Mutex<()> = std::sync::Mutex::new(());

    fn reset() {
        *CACHE.lock() = Cache::new();
    }

    #[test]
    fn bread_fills_then_caches() {
        let _guard = TEST_SERIAL.lock().unwrap();
        reset();
        let vn = VnodeId(1);
        let mut fills = 0;
        let id = bread(vn, 0, 4, |buf| {
            fills += 1;
            buf.copy_from_slice(b"abcd");
            Ok(())
        })
        .unwrap();
        biowait(id).unwrap();
        // Second bread on the same block must not refill.
        let id2 = bread(vn, 0, 4, |_| {
            fills += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(id, id2);
        assert_eq!(fills, 1);
    }

    #[test]
    fn bwrite_then_biowait_reports_done() {
        let _guard = TEST_SERIAL.lock().unwrap();
        reset();
        let id = getblk(VnodeId(2), 5, 4).unwrap();
        bwrite(id, |_| Ok(())).unwrap();
        assert_eq!(biowait(id), Ok(()));
    }

    #[test]
    fn bdwrite_marks_delwri_and_releases_busy() {
        let _guard = TEST_SERIAL.lock().unwrap();
        reset();
        let id = getblk(VnodeId(3), 0, 4).unwrap();
        bdwrite(id).unwrap();
        // getblk can claim it again since BUSY was cleared.
        let id2 = getblk(VnodeId(3), 0, 4).unwrap();
        assert_eq!(id, id2);
    }

    #[test]
    fn reclaim_flushes_delwri_and_frees_slot() {
        let _guard = TEST_SERIAL.lock().unwrap();
        reset();
        let id = bread(VnodeId(4), 0, 4, |buf| {
            buf.copy_from_slice(b"xyzw");
            Ok(())
        })
        .unwrap();
        bdwrite(id).unwrap();
        let mut flushed = None;
        let freed = reclaim(|vn, blkno, data| {
            flushed = Some((vn, blkno, data.to_vec()));
            Ok(())
        })
        .unwrap();
        assert_eq!(freed, 1);
        assert_eq!(flushed.unwrap().2, b"xyzw");
        assert_eq!(getblk(VnodeId(4), 0, 4).unwrap().0, id.0);
    }

    #[test]
    fn locked_buffer_is_never_reclaimed() {
        let _guard = TEST_SERIAL.lock().unwrap();
        reset();
        let id = getblk(VnodeId(5), 0, 4).unwrap();
        set_locked(id, true).unwrap();
        bdwrite(id).unwrap();
        let freed = reclaim(|_, _, _| Ok(())).unwrap();
        assert_eq!(freed, 0);
    }

    #[test]
    fn busy_buffer_cannot_be_claimed_twice() {
        let _guard = TEST_SERIAL.lock().unwrap();
        reset();
        getblk(VnodeId(6), 0, 4).unwrap();
        assert_eq!(getblk(VnodeId(6), 0, 4), Err(Errno::Again));
    }
}
