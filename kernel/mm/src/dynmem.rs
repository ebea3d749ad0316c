//! 1 MB-granular physical region allocator.
//!
//! Dynmem is the lowest allocator in the kernel: [`kmalloc`](crate::kmalloc)
//! subdivides the megabytes it hands out into byte-granular chunks, and
//! [`vralloc`](crate::vralloc) subdivides them into 4 KB page slots.
//! Bookkeeping lives in two parallel tables indexed by megabyte-page
//! number: a descriptor per page (refcount, run-link flag, access class,
//! control bits) and a bitmap mirroring "allocated-or-reserved" for fast
//! contiguous-run search. All operations take the single process-wide
//! mutex.

use hadron_core::addr::{MB, PhysAddr};
use hadron_core::bitmap::Bitmap;
use hadron_core::cell::RacyCell;
use hadron_core::errno::Errno;
use hadron_core::sync::IrqSpinLock;

/// Number of 1 MB pages Dynmem tracks.
///
/// Bounds the simulated physical address space this allocator instance
/// manages. On real hardware this would be sized from the bootloader's
/// memory map at init; fixed here so the descriptor table and the
/// host-test backing store (see [`phys_ptr`]) can be plain statics.
pub const MAX_MPAGES: usize = 64;

const WORD_BITS: usize = usize::BITS as usize;
const BITMAP_WORDS: usize = MAX_MPAGES.div_ceil(WORD_BITS);

/// Run-membership marker for a contiguous multi-page allocation.
///
/// A run of contiguous allocated pages carries `Link` on every entry
/// except the last, which carries `End`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunLink {
    /// Not part of any allocated run.
    None,
    /// A non-terminal page of a multi-page run.
    Link,
    /// The terminal page of a run (single-page runs are also `End`).
    End,
}

/// Access-permission class applied to a dynmem run when mapped into the
/// master page table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AccessPermission {
    /// No access from any privilege level.
    NoAccess = 0,
    /// Kernel read/write, no user access.
    KernelRw = 1,
    /// Kernel read/write, user read-only.
    KernelRwUserRo = 2,
    /// Kernel and user read/write.
    KernelRwUserRw = 3,
    /// Kernel read-only, no user access.
    KernelRo = 4,
    /// Kernel and user read-only.
    KernelRoUserRo = 5,
}

impl AccessPermission {
    /// Downgrades a user-writable class to its read-only counterpart,
    /// leaving every other class unchanged. Used by `hadron-proc` to
    /// install the write-protected mapping a COW region needs before
    /// its first write fault (the region's own flags record the
    /// *logical* writability; this is what makes the hardware actually
    /// trap a write).
    #[must_use]
    pub const fn write_disabled(self) -> Self {
        match self {
            Self::KernelRwUserRw => Self::KernelRwUserRo,
            other => other,
        }
    }

    /// Inverse of [`Self::write_disabled`]: restores real write access
    /// once a COW fault has cloned the backing page.
    #[must_use]
    pub const fn write_enabled(self) -> Self {
        match self {
            Self::KernelRwUserRo => Self::KernelRwUserRw,
            other => other,
        }
    }
}

bitflags::bitflags! {
    /// Platform control bits carried alongside each dynmem page, named
    /// after the ARMv6 short-descriptor section attributes they
    /// eventually bind to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CtrlBits: u16 {
        /// Cacheable (ARMv6 `C` bit).
        const CACHEABLE = 1 << 0;
        /// Bufferable (ARMv6 `B` bit).
        const BUFFERABLE = 1 << 1;
        /// Execute-never (ARMv6 `XN` bit).
        const EXECUTE_NEVER = 1 << 2;
        /// Shared, multiprocessor only (ARMv6 `S` bit).
        const SHARED = 1 << 3;
    }
}

/// Per-page descriptor.
#[derive(Debug, Clone, Copy)]
pub struct PageDesc {
    /// Reference count. A free page has refcount 0.
    pub refcount: u16,
    /// Run-membership marker.
    pub link: RunLink,
    /// Access-permission class.
    pub ap: AccessPermission,
    /// Platform control bits.
    pub ctrl: CtrlBits,
}

impl PageDesc {
    const FREE: Self = Self {
        refcount: 0,
        link: RunLink::None,
        ap: AccessPermission::NoAccess,
        ctrl: CtrlBits::empty(),
    };

    fn is_free(self) -> bool {
        self.refcount == 0 && self.link == RunLink::None
    }
}

/// The 1 MB-granular physical region allocator.
pub struct Dynmem {
    descs: [PageDesc; MAX_MPAGES],
    bitmap_words: [usize; BITMAP_WORDS],
    free_count: usize,
    reserved_count: usize,
}

impl Dynmem {
    /// Creates an allocator with every page free.
    const fn new() -> Self {
        Self {
            descs: [PageDesc::FREE; MAX_MPAGES],
            bitmap_words: [0; BITMAP_WORDS],
            free_count: MAX_MPAGES,
            reserved_count: 0,
        }
    }

    fn bitmap(&mut self) -> Bitmap<'_> {
        Bitmap::new(&mut self.bitmap_words, MAX_MPAGES)
    }

    /// Permanently excludes `[start_mpage, start_mpage + count)` from the
    /// free pool. Used for boot-time reserved-area registration.
    ///
    /// Idempotent: pages already reserved or allocated are left alone.
    pub fn mark_reserved(&mut self, start_mpage: usize, count: usize) {
        for i in start_mpage..(start_mpage + count).min(MAX_MPAGES) {
            if self.descs[i].is_free() {
                self.descs[i] = PageDesc {
                    refcount: 1,
                    link: RunLink::End,
                    ap: AccessPermission::NoAccess,
                    ctrl: CtrlBits::empty(),
                };
                self.bitmap().set(i);
                self.free_count -= 1;
                self.reserved_count += 1;
            }
        }
    }

    /// Allocates `size_mb` contiguous megabytes at the lowest free
    /// address, or returns `None` on exhaustion.
    pub fn alloc_region(
        &mut self,
        size_mb: u32,
        ap: AccessPermission,
        ctrl: CtrlBits,
    ) -> Option<PhysAddr> {
        let count = size_mb as usize;
        if count == 0 {
            return None;
        }
        let start = self.bitmap().find_run(count)?;
        self.bitmap().set_range(start, count);
        for i in 0..count {
            self.descs[start + i] = PageDesc {
                refcount: 1,
                link: if i + 1 == count {
                    RunLink::End
                } else {
                    RunLink::Link
                },
                ap,
                ctrl,
            };
        }
        self.free_count -= count;
        Some(PhysAddr::new((start as u32) * MB))
    }

    fn run_len(&self, start: usize) -> Result<usize, Errno> {
        if start >= MAX_MPAGES || self.descs[start].is_free() {
            return Err(Errno::Inval);
        }
        let mut i = start;
        loop {
            match self.descs[i].link {
                RunLink::End => return Ok(i - start + 1),
                RunLink::Link => {
                    i += 1;
                    if i >= MAX_MPAGES {
                        return Err(Errno::NotRecoverable);
                    }
                }
                RunLink::None => return Err(Errno::NotRecoverable),
            }
        }
    }

    /// Takes an extra reference on the run starting at `addr`.
    pub fn ref_region(&mut self, addr: PhysAddr) -> Result<(), Errno> {
        let start = mpage_index(addr)?;
        if self.descs[start].is_free() {
            return Err(Errno::Inval);
        }
        self.descs[start].refcount += 1;
        Ok(())
    }

    /// Drops a reference on the run starting at `addr`, unmapping and
    /// clearing it once the count reaches zero.
    pub fn free_region(&mut self, addr: PhysAddr) -> Result<(), Errno> {
        let start = mpage_index(addr)?;
        let len = self.run_len(start)?;
        if self.descs[start].refcount == 0 {
            return Err(Errno::Inval);
        }
        self.descs[start].refcount -= 1;
        if self.descs[start].refcount == 0 {
            for i in start..start + len {
                self.descs[i] = PageDesc::FREE;
            }
            self.bitmap().clear_range(start, len);
            self.free_count += len;
        }
        Ok(())
    }

    /// Returns the access-permission class and execute-never bit for the
    /// run containing `addr`; used by user-memory access checks.
    pub fn acc(&self, addr: PhysAddr) -> Result<(AccessPermission, bool), Errno> {
        let start = mpage_index(addr)?;
        let d = self.descs[start];
        if d.is_free() {
            return Err(Errno::Inval);
        }
        Ok((d.ap, d.ctrl.contains(CtrlBits::EXECUTE_NEVER)))
    }

    /// Clones the run at `addr`: pins the source, allocates a fresh run
    /// of equal size and attributes, copies the bytes, then drops the
    /// pin. Pinning first means a concurrent free of the source cannot
    /// race with the copy.
    pub fn clone_region(&mut self, addr: PhysAddr) -> Result<PhysAddr, Errno> {
        let start = mpage_index(addr)?;
        let len = self.run_len(start)?;
        let PageDesc { ap, ctrl, .. } = self.descs[start];
        self.ref_region(addr)?;
        let new_addr = match self.alloc_region(len as u32, ap, ctrl) {
            Some(a) => a,
            None => {
                self.free_region(addr)?;
                return Err(Errno::NoMem);
            }
        };
        // SAFETY: both runs were just validated/allocated above and span
        // `len` contiguous megabytes each; neither overlaps the other.
        unsafe {
            core::ptr::copy_nonoverlapping(
                phys_ptr(addr),
                phys_ptr(new_addr),
                len * MB as usize,
            );
        }
        self.free_region(addr)?;
        Ok(new_addr)
    }

    /// Free megabytes remaining.
    pub fn free_mb(&self) -> usize {
        self.free_count
    }

    /// Total megabytes tracked.
    pub fn total_mb(&self) -> usize {
        MAX_MPAGES
    }

    /// Megabytes permanently excluded by [`mark_reserved`](Self::mark_reserved).
    pub fn reserved_mb(&self) -> usize {
        self.reserved_count
    }

    /// Number of reserved ranges currently tracked (for
    /// `vm.dynmem.nr_reserved`); approximated as a boolean count since
    /// ranges are not tracked individually, only their aggregate page count.
    pub fn nr_reserved(&self) -> usize {
        usize::from(self.reserved_count > 0)
    }
}

fn mpage_index(addr: PhysAddr) -> Result<usize, Errno> {
    if !addr.is_aligned(MB) {
        return Err(Errno::Inval);
    }
    let idx = addr.mpage() as usize;
    if idx >= MAX_MPAGES {
        return Err(Errno::Inval);
    }
    Ok(idx)
}

/// Simulated physical memory backing every megabyte Dynmem can hand out.
///
/// On real hardware, a dynmem run is identity-mapped physical RAM and no
/// such array exists in the kernel image. Modelling it as a
/// [`RacyCell`]-wrapped byte array lets this allocator, and `kmalloc`/
/// `vralloc` layered on top of it, be exercised with real byte reads and
/// writes under `cargo test` on the host.
static PHYS_MEM: RacyCell<[u8; MAX_MPAGES * MB as usize]> =
    RacyCell::new([0u8; MAX_MPAGES * MB as usize]);

/// Returns a raw pointer to the byte at `addr` within the simulated
/// physical address space.
///
/// # Safety
///
/// Callers must only dereference within a range they hold a valid
/// Dynmem reference for (an allocated, in-range run).
pub fn phys_ptr(addr: PhysAddr) -> *mut u8 {
    // SAFETY: `addr` is validated by every caller (mpage_index or a prior
    // successful alloc_region) to lie within `PHYS_MEM`'s bounds.
    unsafe { PHYS_MEM.get().cast::<u8>().add(addr.as_u32() as usize) }
}

static DYNMEM: IrqSpinLock<Dynmem> = IrqSpinLock::named("DYNMEM", Dynmem::new());

/// Executes `f` with exclusive access to the global Dynmem instance.
pub fn with<R>(f: impl FnOnce(&mut Dynmem) -> R) -> R {
    f(&mut DYNMEM.lock())
}
