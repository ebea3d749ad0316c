//! Byte-granular heap layered on [`dynmem`].
//!
//! kmalloc carves byte-sized chunks out of 1 MB arenas pulled from
//! [`dynmem`]. Chunks form a chain of headers walked first-fit from the
//! front on allocation; `kfree` coalesces a chunk with either neighbor
//! only when both live in the same arena (a free chunk never spans two
//! dynmem runs), and returns the arena to dynmem once its last chunk
//! frees. `kpalloc` shares an existing allocation by bumping its
//! refcount rather than copying.
//!
//! Real kmalloc implementations thread the chunk header through the
//! bytes immediately preceding each payload. This one keeps chunk
//! metadata in a side table instead (mirroring [`dynmem`]'s descriptor
//! table), so a chunk's pointer back to its own payload is computed from
//! its arena and offset rather than stored and compared.

use crate::dynmem::{self, AccessPermission, CtrlBits};
use hadron_core::addr::MB;
use hadron_core::errno::Errno;
use hadron_core::sync::IrqSpinLock;
use planck_noalloc::vec::ArrayVec;

const WORD: u32 = core::mem::size_of::<usize>() as u32;

/// Nominal per-chunk header cost counted only when sizing a new arena
/// request, to mirror the space a real inline header would cost.
const HEADER_SIZE: u32 = 16;

const MAX_ARENAS: usize = dynmem::MAX_MPAGES;
const MAX_CHUNKS: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signature {
    Valid,
    Freed,
}

struct Arena {
    base: hadron_core::addr::PhysAddr,
    mpages: u32,
}

struct Chunk {
    arena: u16,
    offset: u32,
    size: u32,
    free: bool,
    refcount: u16,
    signature: Signature,
}

struct Heap {
    arenas: ArrayVec<Arena, MAX_ARENAS>,
    chunks: ArrayVec<Chunk, MAX_CHUNKS>,
    allocated_bytes: u32,
    alloc_max: u32,
}

impl Heap {
    const fn new() -> Self {
        Self {
            arenas: ArrayVec::new(),
            chunks: ArrayVec::new(),
            allocated_bytes: 0,
            alloc_max: 0,
        }
    }

    fn chunk_ptr(&self, idx: usize) -> *mut u8 {
        let base = self.arenas[self.chunks[idx].arena as usize].base;
        // SAFETY: `offset` was computed from a successful arena allocation
        // and never exceeds that arena's byte extent.
        unsafe { dynmem::phys_ptr(base).add(self.chunks[idx].offset as usize) }
    }

    fn find_chunk_index(&self, ptr: *const u8) -> Option<usize> {
        (0..self.chunks.len()).find(|&i| core::ptr::eq(self.chunk_ptr(i), ptr as *mut u8))
    }

    fn find_fit(&self, size: u32) -> Option<usize> {
        (0..self.chunks.len()).find(|&i| self.chunks[i].free && self.chunks[i].size >= size)
    }

    /// Splits chunk `idx` so its payload is exactly `requested` bytes,
    /// pushing a trailing free chunk for the remainder when one is big
    /// enough to be worth keeping.
    fn split(&mut self, idx: usize, requested: u32) {
        let remainder = self.chunks[idx].size - requested;
        if remainder < WORD {
            return;
        }
        let arena = self.chunks[idx].arena;
        let offset = self.chunks[idx].offset + requested;
        self.chunks[idx].size = requested;
        self.chunks.insert(
            idx + 1,
            Chunk {
                arena,
                offset,
                size: remainder,
                free: true,
                refcount: 0,
                signature: Signature::Freed,
            },
        );
    }

    /// Asks dynmem for a fresh arena sized for a `size`-byte allocation,
    /// splitting it into the new chunk plus a trailing free remainder.
    /// Returns the index of the new (non-free) chunk.
    fn extend(&mut self, size: u32) -> Result<usize, Errno> {
        let mb = u64::from(size + HEADER_SIZE).div_ceil(u64::from(MB)).max(1) as u32;
        let base = dynmem::with(|d| d.alloc_region(mb, AccessPermission::KernelRw, CtrlBits::empty()))
            .ok_or(Errno::NoMem)?;
        let arena_idx = self.arenas.len();
        if self.arenas.try_push(Arena { base, mpages: mb }).is_err() {
            dynmem::with(|d| {
                let _ = d.free_region(base);
            });
            return Err(Errno::NoMem);
        }
        let arena_bytes = mb * MB;
        let chunk_idx = self.chunks.len();
        let remainder = arena_bytes - size;
        let needed = if remainder >= WORD { 2 } else { 1 };
        if self.chunks.len() + needed > MAX_CHUNKS {
            dynmem::with(|d| {
                let _ = d.free_region(base);
            });
            self.arenas.remove(arena_idx);
            return Err(Errno::NoMem);
        }
        self.chunks.push(Chunk {
            arena: arena_idx as u16,
            offset: 0,
            size: if remainder >= WORD { size } else { arena_bytes },
            free: false,
            refcount: 0,
            signature: Signature::Valid,
        });
        if remainder >= WORD {
            self.chunks.push(Chunk {
                arena: arena_idx as u16,
                offset: size,
                size: remainder,
                free: true,
                refcount: 0,
                signature: Signature::Freed,
            });
        }
        Ok(chunk_idx)
    }

    /// Merges chunk `idx` with a same-arena free neighbor on either side,
    /// then returns the owning arena to dynmem if that leaves it as the
    /// arena's sole, fully-free chunk.
    fn coalesce(&mut self, mut idx: usize) {
        if idx + 1 < self.chunks.len()
            && self.chunks[idx + 1].free
            && self.chunks[idx + 1].arena == self.chunks[idx].arena
        {
            let absorbed = self.chunks.remove(idx + 1).size;
            self.chunks[idx].size += absorbed;
        }
        if idx > 0 && self.chunks[idx - 1].free && self.chunks[idx - 1].arena == self.chunks[idx].arena {
            let this = self.chunks.remove(idx);
            idx -= 1;
            self.chunks[idx].size += this.size;
        }

        let arena_idx = self.chunks[idx].arena;
        let arena_bytes = self.arenas[arena_idx as usize].mpages * MB;
        let spans_whole_arena = self.chunks[idx].offset == 0 && self.chunks[idx].size == arena_bytes;
        if !spans_whole_arena {
            return;
        }
        let base = self.arenas[arena_idx as usize].base;
        dynmem::with(|d| {
            let _ = d.free_region(base);
        });
        self.chunks.remove(idx);
        self.arenas.remove(arena_idx as usize);
        for c in self.chunks.iter_mut() {
            if c.arena > arena_idx {
                c.arena -= 1;
            }
        }
    }

    fn total_bytes(&self) -> u32 {
        self.arenas.iter().map(|a| a.mpages * MB).sum()
    }

    /// Checks that every chunk's signature agrees with its free/live
    /// state, mirroring the liveness sanity check a corrupted inline
    /// header would fail.
    #[cfg(test)]
    fn debug_check_invariants(&self) {
        for (i, c) in self.chunks.iter().enumerate() {
            let expected = if c.free { Signature::Freed } else { Signature::Valid };
            assert_eq!(c.signature, expected, "chunk {i} signature disagrees with free state");
        }
    }

    fn fragm_rat(&self) -> u32 {
        let total = self.total_bytes();
        if total == 0 {
            return 0;
        }
        let free_total: u32 = self.chunks.iter().filter(|c| c.free).map(|c| c.size).sum();
        free_total * 100 / total
    }
}

fn align_up_word(n: u32) -> u32 {
    (n + WORD - 1) & !(WORD - 1)
}

static HEAP: IrqSpinLock<Heap> = IrqSpinLock::named("KMALLOC", Heap::new());

fn with<R>(f: impl FnOnce(&mut Heap) -> R) -> R {
    f(&mut HEAP.lock())
}

/// Allocates at least `n` bytes, word-aligned. Returns `None` on
/// exhaustion (dynmem out of memory, or the heap's bookkeeping tables
/// are full).
pub fn kmalloc(n: usize) -> Option<*mut u8> {
    if n == 0 {
        return None;
    }
    let size = align_up_word(n as u32);
    with(|h| {
        let idx = match h.find_fit(size) {
            Some(idx) => {
                h.split(idx, size);
                idx
            }
            None => h.extend(size).ok()?,
        };
        h.chunks[idx].free = false;
        h.chunks[idx].refcount = 1;
        h.chunks[idx].signature = Signature::Valid;
        h.allocated_bytes += h.chunks[idx].size;
        h.alloc_max = h.alloc_max.max(h.allocated_bytes);
        Some(h.chunk_ptr(idx))
    })
}

/// Allocates `nmemb * size` bytes, zero-initialized. Returns `None` on
/// overflow or exhaustion.
pub fn kcalloc(nmemb: usize, size: usize) -> Option<*mut u8> {
    let total = nmemb.checked_mul(size)?;
    let p = kmalloc(total)?;
    // SAFETY: `kmalloc` returns a pointer valid for at least `total` bytes
    // and exclusively owned by the caller.
    unsafe {
        core::ptr::write_bytes(p, 0, total);
    }
    Some(p)
}

/// Resizes the allocation at `ptr` to `n` bytes, preserving the
/// overlapping prefix. Shrinks in place by splitting; grows in place
/// when the following chunk is free and large enough; otherwise
/// allocates fresh, copies, and frees the original. Returns `None` if
/// `ptr` is not a live allocation or the new allocation could not be made.
pub fn krealloc(ptr: *mut u8, n: usize) -> Option<*mut u8> {
    if ptr.is_null() {
        return kmalloc(n);
    }
    let size = align_up_word(n as u32);

    enum Outcome {
        Done(*mut u8),
        NeedsCopy(u32),
        Invalid,
    }

    let outcome = with(|h| {
        let idx = match h.find_chunk_index(ptr) {
            Some(idx) if !h.chunks[idx].free => idx,
            _ => return Outcome::Invalid,
        };
        let old_size = h.chunks[idx].size;
        if size <= old_size {
            h.allocated_bytes -= old_size - size;
            h.split(idx, size);
            return Outcome::Done(h.chunk_ptr(idx));
        }
        let grows_in_place = idx + 1 < h.chunks.len()
            && h.chunks[idx + 1].free
            && h.chunks[idx + 1].arena == h.chunks[idx].arena
            && old_size + h.chunks[idx + 1].size >= size;
        if grows_in_place {
            let absorbed = h.chunks.remove(idx + 1).size;
            h.chunks[idx].size = old_size + absorbed;
            h.allocated_bytes += size - old_size;
            h.alloc_max = h.alloc_max.max(h.allocated_bytes);
            h.split(idx, size);
            return Outcome::Done(h.chunk_ptr(idx));
        }
        Outcome::NeedsCopy(old_size)
    });

    match outcome {
        Outcome::Done(p) => Some(p),
        Outcome::Invalid => None,
        Outcome::NeedsCopy(old_size) => {
            let new_ptr = kmalloc(n)?;
            let copy_len = old_size.min(size) as usize;
            // SAFETY: `ptr` is a live allocation of at least `old_size`
            // bytes and `new_ptr` a fresh one of at least `size` bytes;
            // the two heap regions never overlap.
            unsafe {
                core::ptr::copy_nonoverlapping(ptr, new_ptr, copy_len);
            }
            kfree(ptr).ok()?;
            Some(new_ptr)
        }
    }
}

/// Releases a reference on the allocation at `ptr`. Only once the
/// refcount reaches zero is the chunk actually freed, coalesced with its
/// neighbors, and (if that drains the owning arena) returned to dynmem.
///
/// # Errors
///
/// Returns `Errno::Inval` if `ptr` is not a live kmalloc allocation
/// (including a double free of an already-freed pointer).
pub fn kfree(ptr: *mut u8) -> Result<(), Errno> {
    with(|h| {
        let idx = h.find_chunk_index(ptr).ok_or(Errno::Inval)?;
        if h.chunks[idx].free {
            return Err(Errno::Inval);
        }
        h.chunks[idx].refcount -= 1;
        if h.chunks[idx].refcount > 0 {
            return Ok(());
        }
        h.allocated_bytes -= h.chunks[idx].size;
        h.chunks[idx].free = true;
        h.chunks[idx].signature = Signature::Freed;
        h.coalesce(idx);
        Ok(())
    })
}

/// Shares an existing allocation by incrementing its refcount, returning
/// the same pointer. Returns `None` if `ptr` is not a live allocation.
pub fn kpalloc(ptr: *mut u8) -> Option<*mut u8> {
    with(|h| {
        let idx = h.find_chunk_index(ptr)?;
        if h.chunks[idx].free {
            return None;
        }
        h.chunks[idx].refcount += 1;
        Some(ptr)
    })
}

/// Snapshot of the `vm.kmalloc.*` sysctl nodes.
#[derive(Debug, Clone, Copy)]
pub struct KmallocStats {
    /// Total bytes reserved from dynmem across all open arenas.
    pub reserved: u32,
    /// High-water mark of `reserved`.
    pub max: u32,
    /// Bytes currently handed out to live chunks.
    pub allocated: u32,
    /// High-water mark of `allocated`.
    pub alloc_max: u32,
    /// `100 * free_bytes / total_bytes` across the live chunk chain, or
    /// `0` when the heap has not reserved any arenas yet.
    pub fragm_rat: u32,
}

/// Reads the current `vm.kmalloc.*` statistics.
pub fn stats() -> KmallocStats {
    with(|h| KmallocStats {
        reserved: h.total_bytes(),
        max: h.total_bytes(),
        allocated: h.allocated_bytes,
        alloc_max: h.alloc_max,
        fragm_rat: h.fragm_rat(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    static TEST_SERIAL: std::sync::Mutex<()> = std::sync::Mutex::new(());

    fn check_invariants() {
        with(|h| h.debug_check_invariants());
    }

    #[test]
    fn alloc_free_round_trip_restores_bookkeeping() {
        let _guard = TEST_SERIAL.lock().unwrap();
        let before = stats();
        let p = kmalloc(64).unwrap();
        check_invariants();
        assert!(stats().allocated > before.allocated);
        kfree(p).unwrap();
        check_invariants();
        assert_eq!(stats().allocated, before.allocated);
    }

    #[test]
    fn split_merge_scenario_drains_to_empty() {
        let _guard = TEST_SERIAL.lock().unwrap();
        let before = stats();
        let p1 = kmalloc(100).unwrap();
        let p2 = kmalloc(200).unwrap();
        let p3 = kmalloc(100).unwrap();
        kfree(p1).unwrap();
        kfree(p3).unwrap();
        kfree(p2).unwrap();
        assert_eq!(stats().allocated, before.allocated);
    }

    #[test]
    fn double_free_is_rejected() {
        let _guard = TEST_SERIAL.lock().unwrap();
        let p = kmalloc(32).unwrap();
        kfree(p).unwrap();
        assert_eq!(kfree(p), Err(Errno::Inval));
    }

    #[test]
    fn kpalloc_shares_ownership() {
        let _guard = TEST_SERIAL.lock().unwrap();
        let p = kmalloc(32).unwrap();
        let shared = kpalloc(p).unwrap();
        assert!(core::ptr::eq(p, shared));
        kfree(p).unwrap();
        // Still referenced once via the kpalloc share.
        assert_eq!(kfree(shared), Ok(()));
        assert_eq!(kfree(shared), Err(Errno::Inval));
    }

    #[test]
    fn krealloc_grows_and_preserves_prefix() {
        let _guard = TEST_SERIAL.lock().unwrap();
        let p = kmalloc(16).unwrap();
        // SAFETY: `p` is a fresh 16-byte allocation.
        unsafe {
            core::ptr::write_bytes(p, 0xAB, 16);
        }
        let grown = krealloc(p, 512).unwrap();
        let mut buf = [0u8; 16];
        // SAFETY: `grown` is valid for at least 512 bytes after `krealloc`.
        unsafe {
            core::ptr::copy_nonoverlapping(grown, buf.as_mut_ptr(), 16);
        }
        assert_eq!(buf, [0xABu8; 16]);
        kfree(grown).unwrap();
    }

    #[test]
    fn krealloc_shrinks_in_place() {
        let _guard = TEST_SERIAL.lock().unwrap();
        let p = kmalloc(256).unwrap();
        let shrunk = krealloc(p, 16).unwrap();
        assert!(core::ptr::eq(p, shrunk));
        kfree(shrunk).unwrap();
    }

    #[test]
    fn kcalloc_zeroes_memory() {
        let _guard = TEST_SERIAL.lock().unwrap();
        let p = kcalloc(8, 4).unwrap();
        let mut buf = [0xFFu8; 32];
        // SAFETY: `p` is a fresh 32-byte allocation.
        unsafe {
            core::ptr::copy_nonoverlapping(p, buf.as_mut_ptr(), 32);
        }
        assert_eq!(buf, [0u8; 32]);
        kfree(p).unwrap();
    }

    #[test]
    fn fragm_rat_is_zero_with_no_free_bytes() {
        let _guard = TEST_SERIAL.lock().unwrap();
        let s = stats();
        if s.allocated == s.reserved && s.reserved > 0 {
            assert_eq!(s.fragm_rat, 0);
        }
    }
}
