//! Page-granular buffer allocator (vregions and `buf`s).
//!
//! A [`Vregion`] is a physically contiguous slab carved from [`dynmem`]
//! in 1 MB granules and subdivided into 4 KB slots tracked by a bitmap,
//! mirroring dynmem's own bitmap-plus-descriptor split one layer up.
//! [`geteblk`] returns a handle to a fresh buffer backed by a run of
//! free slots in an existing vregion, or a freshly appended one;
//! [`rref`]/[`rfree`] manage its lifetime and [`rclone`]/[`clone2vr`]
//! implement the deep-copy side of copy-on-write.
//!
//! Buffer bookkeeping lives in a side table indexed by [`BufId`], the
//! same convention [`crate::kmalloc`] uses for chunks: a handle is
//! stable across table compaction because freed slots become `None`
//! rather than shifting later entries down.

use crate::dynmem::{self, AccessPermission, CtrlBits};
use hadron_core::addr::{MB, PAGE_SIZE, PhysAddr};
use hadron_core::bitmap::Bitmap;
use hadron_core::errno::Errno;
use hadron_core::sync::IrqSpinLock;

/// Slots per 1 MB dynmem granule.
const SLOTS_PER_MB: u32 = MB / PAGE_SIZE;
/// Largest vregion this allocator will append in one `geteblk` miss.
const MAX_VREGION_MB: u32 = 8;
const MAX_VREGION_SLOTS: usize = (MAX_VREGION_MB * SLOTS_PER_MB) as usize;
const VR_BITMAP_WORDS: usize = MAX_VREGION_SLOTS.div_ceil(usize::BITS as usize);

const MAX_VREGIONS: usize = 16;
const MAX_BUFS: usize = 256;

/// Identifies the allocator type backing a [`Buf`], per the design
/// note calling for a tagged variant rather than a vtable. This module
/// only constructs `Vralloc`-tagged buffers; the other tags exist so a
/// caller layering its own buffer type over this one (the buffer cache,
/// pipe queues) can reuse the same enum for dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufOps {
    /// Backed by a run of slots in a vregion owned by this module.
    Vralloc,
    /// Backed by a device-mapped region owned elsewhere.
    DeviceMapped,
    /// Backed by a pipe/pty queue's storage, owned elsewhere.
    PipeQueue,
}

/// Opaque handle to a live buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufId(u32);

/// Read-only snapshot of a buffer's public fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufInfo {
    /// Physical address of the buffer's payload.
    pub phys_addr: PhysAddr,
    /// Caller-requested logical size in bytes.
    pub size: u32,
    /// Slot-rounded capacity in bytes (`size <= bufsize`).
    pub bufsize: u32,
    /// Copy-on-write flag.
    pub cow: bool,
    /// Allocator tag.
    pub ops: BufOps,
    /// Current reference count.
    pub refcount: u32,
}

struct Vregion {
    base: PhysAddr,
    mpages: u32,
    slots: u32,
    bitmap_words: [usize; VR_BITMAP_WORDS],
    used: u32,
}

impl Vregion {
    fn bitmap(&mut self) -> Bitmap<'_> {
        Bitmap::new(&mut self.bitmap_words, self.slots as usize)
    }
}

struct BufEntry {
    vregion: u16,
    slot_start: u32,
    slot_count: u32,
    size: u32,
    cow: bool,
    ops: BufOps,
    refcount: u32,
}

struct Vralloc {
    vregions: [Option<Vregion>; MAX_VREGIONS],
    bufs: [Option<BufEntry>; MAX_BUFS],
}

impl Vralloc {
    const fn new() -> Self {
        Self {
            vregions: [const { None }; MAX_VREGIONS],
            bufs: [const { None }; MAX_BUFS],
        }
    }

    fn free_vregion_slot(&self) -> Option<usize> {
        self.vregions.iter().position(Option::is_none)
    }

    fn free_buf_slot(&self) -> Option<usize> {
        self.bufs.iter().position(Option::is_none)
    }

    /// Finds the first vregion (lowest index) with a free run of
    /// `needed` contiguous slots.
    fn find_run(&mut self, needed: u32) -> Option<(usize, u32)> {
        for (i, slot) in self.vregions.iter_mut().enumerate() {
            if let Some(vr) = slot {
                if let Some(start) = vr.bitmap().find_run(needed as usize) {
                    return Some((i, start as u32));
                }
            }
        }
        None
    }

    fn append_vregion(&mut self, needed: u32) -> Result<usize, Errno> {
        let idx = self.free_vregion_slot().ok_or(Errno::NoMem)?;
        let mb = needed.div_ceil(SLOTS_PER_MB).max(1).min(MAX_VREGION_MB);
        if needed > mb * SLOTS_PER_MB {
            return Err(Errno::NoMem);
        }
        let base = dynmem::with(|d| {
            d.alloc_region(mb, AccessPermission::KernelRwUserRw, CtrlBits::empty())
        })
        .ok_or(Errno::NoMem)?;
        self.vregions[idx] = Some(Vregion {
            base,
            mpages: mb,
            slots: mb * SLOTS_PER_MB,
            bitmap_words: [0; VR_BITMAP_WORDS],
            used: 0,
        });
        Ok(idx)
    }

    fn payload_ptr(&self, vr_idx: usize, slot_start: u32) -> *mut u8 {
        let vr = self.vregions[vr_idx].as_ref().expect("vregion index must be live");
        dynmem::phys_ptr(vr.base + slot_start * PAGE_SIZE)
    }

    fn new_buf(
        &mut self,
        vr_idx: usize,
        slot_start: u32,
        slot_count: u32,
        size: u32,
    ) -> Result<BufId, Errno> {
        let buf_idx = self.free_buf_slot().ok_or(Errno::NoMem)?;
        self.bufs[buf_idx] = Some(BufEntry {
            vregion: vr_idx as u16,
            slot_start,
            slot_count,
            size,
            cow: false,
            ops: BufOps::Vralloc,
            refcount: 1,
        });
        Ok(BufId(buf_idx as u32))
    }

    fn entry(&self, id: BufId) -> Result<&BufEntry, Errno> {
        self.bufs
            .get(id.0 as usize)
            .and_then(Option::as_ref)
            .ok_or(Errno::Inval)
    }

    fn entry_mut(&mut self, id: BufId) -> Result<&mut BufEntry, Errno> {
        self.bufs
            .get_mut(id.0 as usize)
            .and_then(Option::as_mut)
            .ok_or(Errno::Inval)
    }

    fn info(&self, id: BufId) -> Result<BufInfo, Errno> {
        let e = self.entry(id)?;
        let vr = self.vregions[e.vregion as usize]
            .as_ref()
            .expect("buf references a live vregion");
        Ok(BufInfo {
            phys_addr: vr.base + e.slot_start * PAGE_SIZE,
            size: e.size,
            bufsize: e.slot_count * PAGE_SIZE,
            cow: e.cow,
            ops: e.ops,
            refcount: e.refcount,
        })
    }

    fn release_slots(&mut self, vr_idx: usize, slot_start: u32, slot_count: u32) {
        let multiple_vregions = self.vregions.iter().flatten().count() > 1;
        let vr = self.vregions[vr_idx].as_mut().expect("vregion index must be live");
        vr.bitmap().clear_range(slot_start as usize, slot_count as usize);
        vr.used -= slot_count;
        if vr.used == 0 && multiple_vregions {
            let base = vr.base;
            dynmem::with(|d| d.free_region(base)).expect("vregion's dynmem run must be live");
            self.vregions[vr_idx] = None;
        }
    }

    fn used_mb(&self) -> u32 {
        self.vregions
            .iter()
            .flatten()
            .map(|vr| (vr.used * PAGE_SIZE).div_ceil(MB))
            .sum()
    }

    fn reserved_mb(&self) -> u32 {
        self.vregions.iter().flatten().map(|vr| vr.mpages).sum()
    }
}

static VRALLOC: IrqSpinLock<Vralloc> = IrqSpinLock::named("VRALLOC", Vralloc::new());

fn with<R>(f: impl FnOnce(&mut Vralloc) -> R) -> R {
    f(&mut VRALLOC.lock())
}

/// Returns a fresh, zero-initialized, page-aligned buffer of at least
/// `size` bytes.
///
/// Searches existing vregions for a free run of `⌈size / 4 KB⌉` slots
/// before appending a new vregion sized to the request (rounded up to
/// whole megabytes).
///
/// # Errors
///
/// Returns `Errno::NoMem` if no vregion has room and dynmem, the
/// vregion table, or the buf table is exhausted.
pub fn geteblk(size: u32) -> Result<BufId, Errno> {
    if size == 0 {
        return Err(Errno::Inval);
    }
    let needed = size.div_ceil(PAGE_SIZE);
    with(|v| {
        let (vr_idx, slot_start) = match v.find_run(needed) {
            Some(found) => found,
            None => {
                let idx = v.append_vregion(needed)?;
                (idx, 0)
            }
        };
        let ptr = v.payload_ptr(vr_idx, slot_start);
        // SAFETY: the run just claimed is `needed` slots of freshly
        // allocated or previously-freed (and cleared on free) vregion
        // memory, each slot PAGE_SIZE bytes, owned exclusively by the
        // caller until this buffer's bitmap range is cleared again.
        unsafe { core::ptr::write_bytes(ptr, 0, (needed * PAGE_SIZE) as usize) };
        let vr = v.vregions[vr_idx].as_mut().expect("vregion index must be live");
        vr.bitmap().set_range(slot_start as usize, needed as usize);
        vr.used += needed;
        v.new_buf(vr_idx, slot_start, needed, size)
    })
}

/// Grows or shrinks `id`'s logical size.
///
/// Growing prefers in-place expansion into adjacent free slots of the
/// same vregion; failing that, a new buffer is allocated, the old
/// payload copied over, and the old slots released. Shrinking retains
/// the buffer's slots (a policy choice: returning a partial run costs
/// more than it saves).
///
/// # Errors
///
/// Returns `Errno::Inval` for an unknown `id`, `Errno::NoMem` on
/// allocation failure.
pub fn allocbuf(id: BufId, new_size: u32) -> Result<(), Errno> {
    if new_size == 0 {
        return Err(Errno::Inval);
    }
    let needed = new_size.div_ceil(PAGE_SIZE);
    let grown_in_place = with(|v| -> Result<bool, Errno> {
        let e = v.entry(id)?;
        if needed <= e.slot_count {
            v.entry_mut(id)?.size = new_size;
            return Ok(true);
        }
        let (vr_idx, slot_start, old_count) = (e.vregion as usize, e.slot_start, e.slot_count);
        let extra = needed - old_count;
        let vr = v.vregions[vr_idx].as_mut().expect("vregion index must be live");
        let can_extend = (slot_start + old_count + extra) <= vr.slots
            && (slot_start + old_count..slot_start + old_count + extra)
                .all(|s| !vr.bitmap().get(s as usize));
        if !can_extend {
            return Ok(false);
        }
        vr.bitmap().set_range((slot_start + old_count) as usize, extra as usize);
        vr.used += extra;
        let e = v.entry_mut(id)?;
        e.slot_count = needed;
        e.size = new_size;
        Ok(true)
    })?;
    if grown_in_place {
        return Ok(());
    }

    let old_info = with(|v| v.info(id))?;
    let new_id = geteblk(new_size)?;
    let new_info = with(|v| v.info(new_id))?;
    // SAFETY: `old_info`/`new_info` were just read back from live,
    // distinct buffers; the copy length is the smaller of the two
    // payloads, so it cannot run past either one.
    unsafe {
        core::ptr::copy_nonoverlapping(
            dynmem::phys_ptr(old_info.phys_addr),
            dynmem::phys_ptr(new_info.phys_addr),
            old_info.size.min(new_info.size) as usize,
        );
    }
    with(|v| {
        let old_fields = v.entry(id).expect("id validated above").clone_fields();
        v.release_slots(old_fields.vregion as usize, old_fields.slot_start, old_fields.slot_count);
        let new_fields = v.entry(new_id).expect("freshly allocated").clone_fields();
        *v.entry_mut(id).expect("id validated above") = new_fields;
        v.bufs[new_id.0 as usize] = None;
    });
    Ok(())
}

impl BufEntry {
    fn clone_fields(&self) -> Self {
        Self {
            vregion: self.vregion,
            slot_start: self.slot_start,
            slot_count: self.slot_count,
            size: self.size,
            cow: self.cow,
            ops: self.ops,
            refcount: self.refcount,
        }
    }
}

/// Takes an extra reference on `id`.
///
/// # Errors
///
/// Returns `Errno::Inval` for an unknown `id`.
pub fn rref(id: BufId) -> Result<(), Errno> {
    with(|v| {
        v.entry_mut(id)?.refcount += 1;
        Ok(())
    })
}

/// Drops a reference on `id`. On the last reference: clears the
/// vregion's bitmap range, decrements its used-slot count, and — if
/// that count reaches zero and more than one vregion exists — returns
/// the vregion's dynmem block.
///
/// # Errors
///
/// Returns `Errno::Inval` for an unknown `id`.
pub fn rfree(id: BufId) -> Result<(), Errno> {
    with(|v| {
        let e = v.entry_mut(id)?;
        e.refcount -= 1;
        if e.refcount > 0 {
            return Ok(());
        }
        let (vregion, slot_start, slot_count) = (e.vregion as usize, e.slot_start, e.slot_count);
        v.release_slots(vregion, slot_start, slot_count);
        v.bufs[id.0 as usize] = None;
        Ok(())
    })
}

/// Produces a logical copy of `id`: `new.bufsize == old.bufsize` and
/// identical region attributes except the COW flag, which is cleared.
/// Bytes are copied.
///
/// # Errors
///
/// Returns `Errno::Inval` for an unknown `id`, `Errno::NoMem` on
/// allocation failure.
pub fn rclone(id: BufId) -> Result<BufId, Errno> {
    let old = with(|v| v.info(id))?;
    let new_id = geteblk(old.bufsize)?;
    let new_info = with(|v| v.info(new_id))?;
    // SAFETY: both buffers are live and distinct; `old.bufsize` is
    // exactly what `geteblk` just reserved for `new_id`.
    unsafe {
        core::ptr::copy_nonoverlapping(
            dynmem::phys_ptr(old.phys_addr),
            dynmem::phys_ptr(new_info.phys_addr),
            old.bufsize as usize,
        );
    }
    with(|v| v.entry_mut(new_id).map(|e| e.cow = false))?;
    Ok(new_id)
}

/// A buffer that may or may not be vralloc-backed, generalizing
/// [`clone2vr`] over arbitrary sources.
pub enum CloneSource {
    /// An existing vralloc buffer; cloning delegates to [`rclone`].
    Vralloc(BufId),
    /// A caller-owned region outside vralloc; cloning allocates a new
    /// vregion-backed buffer and copies `len` bytes from `phys_addr`.
    Foreign {
        /// Physical address of the source bytes.
        phys_addr: PhysAddr,
        /// Length in bytes to copy.
        len: u32,
    },
}

/// Generalizes cloning to arbitrary buffers: a vralloc source delegates
/// to [`rclone`]; any other source allocates a new vregion-backed
/// buffer and copies.
///
/// # Errors
///
/// Returns `Errno::Inval`/`Errno::NoMem` as the underlying allocation
/// or lookup fails.
pub fn clone2vr(src: CloneSource) -> Result<BufId, Errno> {
    match src {
        CloneSource::Vralloc(id) => rclone(id),
        CloneSource::Foreign { phys_addr, len } => {
            let new_id = geteblk(len)?;
            let new_info = with(|v| v.info(new_id))?;
            // SAFETY: `len` bytes at `phys_addr` are the caller's
            // guarantee per this function's contract; `new_info`'s
            // payload was just sized to hold exactly `len` bytes.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    dynmem::phys_ptr(phys_addr),
                    dynmem::phys_ptr(new_info.phys_addr),
                    len as usize,
                );
            }
            Ok(new_id)
        }
    }
}

/// Returns a snapshot of `id`'s public fields.
///
/// # Errors
///
/// Returns `Errno::Inval` for an unknown `id`.
pub fn info(id: BufId) -> Result<BufInfo, Errno> {
    with(|v| v.info(id))
}

/// Marks `id`'s region copy-on-write (set on both sides of a fork
/// before the first write fault).
///
/// # Errors
///
/// Returns `Errno::Inval` for an unknown `id`.
pub fn set_cow(id: BufId, cow: bool) -> Result<(), Errno> {
    with(|v| {
        v.entry_mut(id)?.cow = cow;
        Ok(())
    })
}

/// `vm.vralloc.{reserved,used}` sysctl snapshot.
#[derive(Debug, Clone, Copy)]
pub struct VrallocStats {
    /// Total megabytes reserved across all vregions.
    pub reserved: u32,
    /// Megabytes currently in use.
    pub used: u32,
}

/// Returns current reserved/used megabyte counts.
#[must_use]
pub fn stats() -> VrallocStats {
    with(|v| VrallocStats {
        reserved: v.reserved_mb(),
        used: v.used_mb(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    static TEST_SERIAL: std::sync::Mutex<()> = std::sync::Mutex::new(());

    fn drain() {
        with(|v| {
            for slot in &mut v.bufs {
                *slot = None;
            }
            for slot in &mut v.vregions {
                if let Some(vr) = slot.take() {
                    dynmem::with(|d| d.free_region(vr.base)).unwrap();
                }
            }
        });
    }

    #[test]
    fn geteblk_returns_zeroed_buffer() {
        let _guard = TEST_SERIAL.lock().unwrap();
        drain();
        let id = geteblk(100).unwrap();
        let info = info(id).unwrap();
        assert_eq!(info.size, 100);
        assert_eq!(info.bufsize, PAGE_SIZE);
        assert_eq!(info.refcount, 1);
        let ptr = dynmem::phys_ptr(info.phys_addr);
        // SAFETY: a freshly allocated page-granular buffer.
        unsafe { assert_eq!(*ptr, 0) };
        rfree(id).unwrap();
    }

    #[test]
    fn rref_rfree_round_trip() {
        let _guard = TEST_SERIAL.lock().unwrap();
        drain();
        let id = geteblk(4096).unwrap();
        rref(id).unwrap();
        assert_eq!(info(id).unwrap().refcount, 2);
        rfree(id).unwrap();
        assert_eq!(info(id).unwrap().refcount, 1);
        rfree(id).unwrap();
        assert_eq!(info(id), Err(Errno::Inval));
    }

    #[test]
    fn vregion_returned_when_drained_and_not_sole_region() {
        let _guard = TEST_SERIAL.lock().unwrap();
        drain();
        let reserved_before = stats().reserved;
        let a = geteblk(PAGE_SIZE).unwrap();
        let b = geteblk(MAX_VREGION_MB * MB).unwrap();
        assert!(stats().reserved > reserved_before);
        rfree(b).unwrap();
        assert!(stats().reserved < MAX_VREGION_MB * MB + reserved_before + PAGE_SIZE);
        rfree(a).unwrap();
    }

    #[test]
    fn rclone_copies_bytes_and_clears_cow() {
        let _guard = TEST_SERIAL.lock().unwrap();
        drain();
        let id = geteblk(16).unwrap();
        set_cow(id, true).unwrap();
        let info_src = info(id).unwrap();
        // SAFETY: writing inside a buffer this test owns exclusively.
        unsafe { *dynmem::phys_ptr(info_src.phys_addr) = 0x7A };
        let cloned = rclone(id).unwrap();
        let info_dst = info(cloned).unwrap();
        assert_eq!(info_dst.bufsize, info_src.bufsize);
        assert!(!info_dst.cow);
        // SAFETY: reading inside a buffer this test owns exclusively.
        unsafe { assert_eq!(*dynmem::phys_ptr(info_dst.phys_addr), 0x7A) };
        rfree(id).unwrap();
        rfree(cloned).unwrap();
    }

    #[test]
    fn clone2vr_from_foreign_source_copies() {
        let _guard = TEST_SERIAL.lock().unwrap();
        drain();
        let src = geteblk(8).unwrap();
        let src_info = info(src).unwrap();
        // SAFETY: writing inside a buffer this test owns exclusively.
        unsafe { *dynmem::phys_ptr(src_info.phys_addr) = 0x55 };
        let out = clone2vr(CloneSource::Foreign {
            phys_addr: src_info.phys_addr,
            len: 8,
        })
        .unwrap();
        let out_info = info(out).unwrap();
        // SAFETY: reading inside a buffer this test owns exclusively.
        unsafe { assert_eq!(*dynmem::phys_ptr(out_info.phys_addr), 0x55) };
        rfree(src).unwrap();
        rfree(out).unwrap();
    }

    #[test]
    fn allocbuf_shrink_retains_slots() {
        let _guard = TEST_SERIAL.lock().unwrap();
        drain();
        let id = geteblk(4096).unwrap();
        let before = info(id).unwrap();
        allocbuf(id, 10).unwrap();
        let after = info(id).unwrap();
        assert_eq!(after.size, 10);
        assert_eq!(after.bufsize, before.bufsize);
        rfree(id).unwrap();
    }

    #[test]
    fn allocbuf_grow_in_place_within_vregion() {
        let _guard = TEST_SERIAL.lock().unwrap();
        drain();
        let id = geteblk(10).unwrap();
        allocbuf(id, PAGE_SIZE + 10).unwrap();
        let after = info(id).unwrap();
        assert_eq!(after.bufsize, 2 * PAGE_SIZE);
        assert_eq!(after.size, PAGE_SIZE + 10);
        rfree(id).unwrap();
    }
}
