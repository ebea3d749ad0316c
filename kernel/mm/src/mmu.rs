//! MMU-independent page-table and region abstraction, with fault
//! classification for data/prefetch abort entry.
//!
//! A [`PageTable`] is a tagged variant over the two ARMv6 short-descriptor
//! table classes rather than one struct with a runtime class tag (a
//! tagged variant over dynamic dispatch where one suffices): a
//! [`MasterTable`] (first-level, one 1 MB section per entry) or a
//! [`CoarseTable`] (second-level, one 4 KB page per entry, always owned by
//! exactly one master slot). [`map_region`]/[`unmap_region`] write and
//! clear entries for a [`Region`] against whichever table class it
//! targets; [`translate_vaddr`] walks a single table level (callers walk
//! master → coarse themselves when a slot is a [`MasterEntry::Coarse`]).
//!
//! Installing a table into hardware (`attach_pagetable`) and abort entry
//! (reading real fault-status registers) are genuinely ARM-specific;
//! those are cfg-gated the same way [`hadron_core::sync::IrqSpinLock`]
//! gates its CPSR access, with a no-op host fallback so the rest of this
//! module stays plain-data and host-testable.

use crate::dynmem::{AccessPermission, CtrlBits};
use hadron_core::addr::{MB, PAGE_SIZE, PhysAddr, VirtAddr};
use hadron_core::errno::Errno;
use hadron_core::id::{Pid, Tid};
use hadron_core::paging::PageTableClass;
use hadron_core::sync::IrqSpinLock;

/// Entries in a MASTER (first-level) table: one per 1 MB of address space.
pub const MASTER_ENTRIES: usize = 4096;
/// Entries in a COARSE (second-level) table: one per 4 KB page in its 1 MB.
pub const COARSE_ENTRIES: usize = 256;

/// Opaque identifier for a page table, assigned and resolved by whichever
/// crate owns table storage (the process address-space table, here out
/// of scope). Lets [`Region`] carry a back-pointer to its owning table
/// without a raw pointer or a dependency on that crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTableId(pub u32);

/// One first-level table slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterEntry {
    /// Unmapped; a translation fault on access.
    Fault,
    /// A 1 MB section mapped directly to a physical frame.
    Section {
        /// Physical frame backing this section.
        frame: PhysAddr,
        /// Access-permission class.
        ap: AccessPermission,
        /// Platform control bits.
        ctrl: CtrlBits,
    },
    /// Points at a second-level COARSE table covering this 1 MB.
    Coarse {
        /// Physical address of the COARSE table's own storage.
        table_phys: PhysAddr,
    },
}

/// One second-level table slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoarseEntry {
    /// Unmapped; a translation fault on access.
    Fault,
    /// A 4 KB page mapped to a physical frame.
    Page {
        /// Physical frame backing this page.
        frame: PhysAddr,
        /// Access-permission class.
        ap: AccessPermission,
        /// Platform control bits.
        ctrl: CtrlBits,
    },
}

/// A first-level (MASTER) page table.
pub struct MasterTable {
    /// Physical address of this table's own storage.
    pub table_phys: PhysAddr,
    /// Base virtual address this table covers (normally 0).
    pub virt_base: VirtAddr,
    /// ARMv6 protection domain this table is associated with.
    pub domain: u8,
    entries: [MasterEntry; MASTER_ENTRIES],
}

impl MasterTable {
    /// Creates a table with every entry set to `Fault`.
    #[must_use]
    pub const fn new(table_phys: PhysAddr, virt_base: VirtAddr, domain: u8) -> Self {
        Self {
            table_phys,
            virt_base,
            domain,
            entries: [MasterEntry::Fault; MASTER_ENTRIES],
        }
    }

    /// Zero-fills every entry back to `Fault`.
    pub fn init(&mut self) {
        self.entries = [MasterEntry::Fault; MASTER_ENTRIES];
        invalidate_caches();
    }

    /// Returns the entry at first-level index `l1`.
    ///
    /// # Panics
    ///
    /// Panics if `l1 >= MASTER_ENTRIES`.
    #[must_use]
    pub fn entry(&self, l1: usize) -> MasterEntry {
        self.entries[l1]
    }

    /// Points first-level slot `l1` at a coarse table.
    ///
    /// # Panics
    ///
    /// Panics if `l1 >= MASTER_ENTRIES`.
    pub fn set_coarse(&mut self, l1: usize, table_phys: PhysAddr) {
        self.entries[l1] = MasterEntry::Coarse { table_phys };
    }

    /// Clears first-level slot `l1` back to `Fault`.
    ///
    /// # Panics
    ///
    /// Panics if `l1 >= MASTER_ENTRIES`.
    pub fn clear(&mut self, l1: usize) {
        self.entries[l1] = MasterEntry::Fault;
    }
}

/// A second-level (COARSE) page table, always owned by one master slot.
pub struct CoarseTable {
    /// Physical address of this table's own storage.
    pub table_phys: PhysAddr,
    /// Base virtual address of the 1 MB section this table covers.
    pub virt_base: VirtAddr,
    /// The master table this coarse table is linked from.
    pub master: PageTableId,
    /// ARMv6 protection domain this table is associated with.
    pub domain: u8,
    entries: [CoarseEntry; COARSE_ENTRIES],
}

impl CoarseTable {
    /// Creates a table with every entry set to `Fault`.
    #[must_use]
    pub const fn new(table_phys: PhysAddr, virt_base: VirtAddr, master: PageTableId, domain: u8) -> Self {
        Self {
            table_phys,
            virt_base,
            master,
            domain,
            entries: [CoarseEntry::Fault; COARSE_ENTRIES],
        }
    }

    /// Zero-fills every entry back to `Fault`.
    pub fn init(&mut self) {
        self.entries = [CoarseEntry::Fault; COARSE_ENTRIES];
        invalidate_caches();
    }

    /// Returns the entry at second-level index `l2`.
    ///
    /// # Panics
    ///
    /// Panics if `l2 >= COARSE_ENTRIES`.
    #[must_use]
    pub fn entry(&self, l2: usize) -> CoarseEntry {
        self.entries[l2]
    }
}

/// Either table class, dispatched over at the call site instead of
/// through dynamic dispatch.
pub enum PageTable {
    /// First-level, 1 MB sections.
    Master(MasterTable),
    /// Second-level, 4 KB pages.
    Coarse(CoarseTable),
}

impl PageTable {
    /// Returns this table's class.
    #[must_use]
    pub const fn class(&self) -> PageTableClass {
        match self {
            Self::Master(_) => PageTableClass::Master,
            Self::Coarse(_) => PageTableClass::Coarse,
        }
    }

    /// Zero-fills every entry in this table.
    pub fn init(&mut self) {
        match self {
            Self::Master(m) => m.init(),
            Self::Coarse(c) => c.init(),
        }
    }
}

bitflags::bitflags! {
    /// Mapping-level semantics for a [`Region`], independent of the
    /// physical page's own dynmem access class.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RegionFlags: u8 {
        /// The mapping is currently writable (clear alongside `COW`
        /// until the COW fault handler clones the backing page).
        const WRITABLE = 1 << 0;
        /// Executable.
        const EXECUTABLE = 1 << 1;
        /// Copy-on-write: a write fault should clone the backing page
        /// rather than be treated as a permission violation.
        const COW = 1 << 2;
        /// Shared between address spaces (not copied on fork).
        const SHARED = 1 << 3;
    }
}

/// A contiguous range of virtual addresses with uniform permissions,
/// backed by one physical range and owned by one page table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    /// Base virtual address.
    pub virt_base: VirtAddr,
    /// Number of 4 KB pages (for a COARSE target) or 1 MB sections (for
    /// a MASTER target) this region covers.
    pub page_count: u32,
    /// Access-permission class applied to every entry.
    pub ap: AccessPermission,
    /// Platform control bits applied to every entry.
    pub ctrl: CtrlBits,
    /// Mapping-level flags (COW, shared, ...).
    pub flags: RegionFlags,
    /// Base physical address backing this region.
    pub phys_base: PhysAddr,
    /// The page table this region is mapped through.
    pub owner: PageTableId,
}

/// Writes PTEs for every page/section of `region` into `pt`, honoring
/// its access-permission class and control bits.
///
/// # Errors
///
/// Returns `Errno::Inval` if `region` is misaligned for `pt`'s class or
/// would index past the table's extent.
pub fn map_region(pt: &mut PageTable, region: &Region) -> Result<(), Errno> {
    match pt {
        PageTable::Master(m) => {
            if !region.virt_base.is_aligned(MB) || !region.phys_base.is_aligned(MB) {
                return Err(Errno::Inval);
            }
            let l1_start = region.virt_base.l1_index() as usize;
            let l1_end = l1_start + region.page_count as usize;
            if l1_end > MASTER_ENTRIES {
                return Err(Errno::Inval);
            }
            for (i, l1) in (l1_start..l1_end).enumerate() {
                m.entries[l1] = MasterEntry::Section {
                    frame: region.phys_base + (i as u32) * MB,
                    ap: region.ap,
                    ctrl: region.ctrl,
                };
            }
            Ok(())
        }
        PageTable::Coarse(c) => {
            let l2_start = region.virt_base.l2_index() as usize;
            let l2_end = l2_start + region.page_count as usize;
            if l2_end > COARSE_ENTRIES {
                return Err(Errno::Inval);
            }
            for (i, l2) in (l2_start..l2_end).enumerate() {
                c.entries[l2] = CoarseEntry::Page {
                    frame: region.phys_base + (i as u32) * PAGE_SIZE,
                    ap: region.ap,
                    ctrl: region.ctrl,
                };
            }
            Ok(())
        }
    }
}

/// Clears every PTE `region` occupies back to `Fault`.
///
/// # Errors
///
/// Returns `Errno::Inval` under the same conditions as [`map_region`].
pub fn unmap_region(pt: &mut PageTable, region: &Region) -> Result<(), Errno> {
    match pt {
        PageTable::Master(m) => {
            let l1_start = region.virt_base.l1_index() as usize;
            let l1_end = l1_start + region.page_count as usize;
            if l1_end > MASTER_ENTRIES {
                return Err(Errno::Inval);
            }
            for l1 in l1_start..l1_end {
                m.entries[l1] = MasterEntry::Fault;
            }
            Ok(())
        }
        PageTable::Coarse(c) => {
            let l2_start = region.virt_base.l2_index() as usize;
            let l2_end = l2_start + region.page_count as usize;
            if l2_end > COARSE_ENTRIES {
                return Err(Errno::Inval);
            }
            for l2 in l2_start..l2_end {
                c.entries[l2] = CoarseEntry::Fault;
            }
            Ok(())
        }
    }
}

/// Walks a single table level and returns the physical address `va`
/// resolves to, or `None` on a translation fault. Callers walk master
/// then coarse themselves when a first-level slot is `Coarse`.
#[must_use]
pub fn translate_vaddr(pt: &PageTable, va: VirtAddr) -> Option<PhysAddr> {
    match pt {
        PageTable::Master(m) => match m.entry(va.l1_index() as usize) {
            MasterEntry::Section { frame, .. } => Some(frame + (va.as_u32() % MB)),
            MasterEntry::Coarse { .. } | MasterEntry::Fault => None,
        },
        PageTable::Coarse(c) => match c.entry(va.l2_index() as usize) {
            CoarseEntry::Page { frame, .. } => Some(frame + (va.as_u32() % PAGE_SIZE)),
            CoarseEntry::Fault => None,
        },
    }
}

static CURRENT_MASTER: IrqSpinLock<Option<PhysAddr>> = IrqSpinLock::new(None);

/// Installs `m` as the active MASTER table on this core.
pub fn attach_pagetable(m: &MasterTable) {
    write_ttbr0(m.table_phys);
    *CURRENT_MASTER.lock() = Some(m.table_phys);
}

/// Detaches whatever MASTER table is currently active.
pub fn detach_pagetable() {
    write_ttbr0(PhysAddr::new(0));
    *CURRENT_MASTER.lock() = None;
}

/// Returns the physical address of the currently attached MASTER table.
#[must_use]
pub fn current_master() -> Option<PhysAddr> {
    *CURRENT_MASTER.lock()
}

#[cfg(all(target_arch = "arm", target_os = "none"))]
fn write_ttbr0(addr: PhysAddr) {
    use core::arch::asm;
    // SAFETY: writing TTBR0 only changes the active translation; the
    // caller guarantees `addr` is a fully-initialized MASTER table (or
    // zero, to detach) before any access through the new mapping.
    unsafe {
        asm!("mcr p15, 0, {0}, c2, c0, 0", in(reg) addr.as_u32(), options(nostack, preserves_flags));
    }
}

#[cfg(not(all(target_arch = "arm", target_os = "none")))]
fn write_ttbr0(_addr: PhysAddr) {}

#[cfg(all(target_arch = "arm", target_os = "none"))]
fn invalidate_caches() {
    use core::arch::asm;
    // SAFETY: a data synchronization barrier touches no memory itself.
    unsafe {
        asm!("mcr p15, 0, {0}, c7, c10, 4", in(reg) 0u32, options(nostack, preserves_flags));
    }
}

#[cfg(not(all(target_arch = "arm", target_os = "none")))]
fn invalidate_caches() {}

/// Reason the data/prefetch abort handler was entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultStatus {
    /// No mapping exists at all for the faulting level.
    Translation,
    /// A mapping exists but forbids the attempted access.
    Permission,
    /// Unaligned access to a region that requires alignment.
    Alignment,
    /// External abort (bus error) reported by the platform.
    External,
    /// Domain access fault.
    Domain,
}

/// Everything the abort entry point hands to fault dispatch.
#[derive(Debug, Clone, Copy)]
pub struct FaultDescriptor {
    /// Classified fault status.
    pub status: FaultStatus,
    /// Faulting virtual address.
    pub addr: VirtAddr,
    /// Saved program status register at the time of the fault.
    pub psr: u32,
    /// Saved program counter at the time of the fault.
    pub pc: u32,
    /// Owning process.
    pub owner: Pid,
    /// Faulting thread.
    pub thread: Tid,
    /// Whether the access was a write.
    pub write: bool,
    /// Whether the fault happened in kernel mode (vs. a user thread).
    pub kernel_mode: bool,
}

/// A fatal signal a user-mode fault classifies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalSignal {
    /// Invalid memory reference (`SIGSEGV`).
    Segv,
    /// Bus error, typically alignment or external abort (`SIGBUS`).
    Bus,
    /// Illegal instruction / access pattern the kernel will not recover (`SIGILL`).
    Ill,
}

/// What the abort handler should do once a fault is classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The faulting access can be satisfied by fixing up the mapping
    /// (a COW clone, or a demand fill of a valid-but-unmapped region);
    /// the caller retries the faulting instruction afterward.
    Recoverable,
    /// Deliver this signal to the owning (user-mode) thread.
    Fatal(FatalSignal),
    /// The fault occurred in kernel mode or in `init`; not recoverable.
    Panic,
}

/// Classifies a fault, given the region (if any) covering the faulting
/// address. Translation/permission faults over a COW or otherwise-valid
/// region are recoverable; everything else maps to a fatal signal for
/// user threads and a panic for kernel-mode faults.
#[must_use]
pub fn classify_fault(desc: &FaultDescriptor, region: Option<&Region>) -> FaultOutcome {
    let recoverable = match (desc.status, region) {
        (FaultStatus::Translation | FaultStatus::Permission, Some(r)) => {
            !desc.write || r.flags.contains(RegionFlags::COW) || r.flags.contains(RegionFlags::WRITABLE)
        }
        _ => false,
    };
    if recoverable {
        return FaultOutcome::Recoverable;
    }
    if desc.kernel_mode {
        return FaultOutcome::Panic;
    }
    FaultOutcome::Fatal(match desc.status {
        FaultStatus::Alignment | FaultStatus::External => FatalSignal::Bus,
        FaultStatus::Domain => FatalSignal::Ill,
        FaultStatus::Translation | FaultStatus::Permission => FatalSignal::Segv,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_region(owner: PageTableId) -> Region {
        Region {
            virt_base: VirtAddr::new(0x1000),
            page_count: 2,
            ap: AccessPermission::KernelRwUserRw,
            ctrl: CtrlBits::empty(),
            flags: RegionFlags::WRITABLE,
            phys_base: PhysAddr::new(0x2000),
            owner,
        }
    }

    #[test]
    fn coarse_map_then_translate() {
        let mut pt = PageTable::Coarse(CoarseTable::new(
            PhysAddr::new(0),
            VirtAddr::new(0),
            PageTableId(0),
            0,
        ));
        let region = test_region(PageTableId(0));
        map_region(&mut pt, &region).unwrap();
        let pa = translate_vaddr(&pt, VirtAddr::new(0x1010)).unwrap();
        assert_eq!(pa.as_u32(), 0x2010);
    }

    #[test]
    fn unmap_clears_translation() {
        let mut pt = PageTable::Coarse(CoarseTable::new(
            PhysAddr::new(0),
            VirtAddr::new(0),
            PageTableId(0),
            0,
        ));
        let region = test_region(PageTableId(0));
        map_region(&mut pt, &region).unwrap();
        unmap_region(&mut pt, &region).unwrap();
        assert!(translate_vaddr(&pt, VirtAddr::new(0x1000)).is_none());
    }

    #[test]
    fn master_section_map_and_translate() {
        let mut pt = PageTable::Master(MasterTable::new(PhysAddr::new(0), VirtAddr::new(0), 0));
        let region = Region {
            virt_base: VirtAddr::new(3 * MB),
            page_count: 1,
            ap: AccessPermission::KernelRw,
            ctrl: CtrlBits::empty(),
            flags: RegionFlags::WRITABLE,
            phys_base: PhysAddr::new(3 * MB),
            owner: PageTableId(0),
        };
        map_region(&mut pt, &region).unwrap();
        let pa = translate_vaddr(&pt, VirtAddr::new(3 * MB + 0x42)).unwrap();
        assert_eq!(pa.as_u32(), 3 * MB + 0x42);
    }

    #[test]
    fn misaligned_master_region_rejected() {
        let mut pt = PageTable::Master(MasterTable::new(PhysAddr::new(0), VirtAddr::new(0), 0));
        let region = Region {
            virt_base: VirtAddr::new(0x1234),
            page_count: 1,
            ap: AccessPermission::KernelRw,
            ctrl: CtrlBits::empty(),
            flags: RegionFlags::empty(),
            phys_base: PhysAddr::new(0x1234),
            owner: PageTableId(0),
        };
        assert_eq!(map_region(&mut pt, &region), Err(Errno::Inval));
    }

    #[test]
    fn init_resets_all_entries_to_fault() {
        let mut pt = PageTable::Coarse(CoarseTable::new(
            PhysAddr::new(0),
            VirtAddr::new(0),
            PageTableId(0),
            0,
        ));
        let region = test_region(PageTableId(0));
        map_region(&mut pt, &region).unwrap();
        pt.init();
        assert!(translate_vaddr(&pt, VirtAddr::new(0x1000)).is_none());
    }

    #[test]
    fn classify_write_to_cow_region_is_recoverable() {
        let desc = FaultDescriptor {
            status: FaultStatus::Permission,
            addr: VirtAddr::new(0x1000),
            psr: 0,
            pc: 0,
            owner: Pid::new(2),
            thread: Tid::new(2),
            write: true,
            kernel_mode: false,
        };
        let region = Region {
            flags: RegionFlags::COW,
            ..test_region(PageTableId(0))
        };
        assert_eq!(classify_fault(&desc, Some(&region)), FaultOutcome::Recoverable);
    }

    #[test]
    fn classify_write_to_readonly_region_is_segv() {
        let desc = FaultDescriptor {
            status: FaultStatus::Permission,
            addr: VirtAddr::new(0x1000),
            psr: 0,
            pc: 0,
            owner: Pid::new(2),
            thread: Tid::new(2),
            write: true,
            kernel_mode: false,
        };
        let region = Region {
            flags: RegionFlags::empty(),
            ..test_region(PageTableId(0))
        };
        assert_eq!(
            classify_fault(&desc, Some(&region)),
            FaultOutcome::Fatal(FatalSignal::Segv)
        );
    }

    #[test]
    fn classify_unmapped_access_in_kernel_mode_panics() {
        let desc = FaultDescriptor {
            status: FaultStatus::Translation,
            addr: VirtAddr::new(0x9000),
            psr: 0,
            pc: 0,
            owner: Pid::new(0),
            thread: Tid::new(0),
            write: false,
            kernel_mode: true,
        };
        assert_eq!(classify_fault(&desc, None), FaultOutcome::Panic);
    }

    #[test]
    fn attach_and_detach_track_current_master() {
        let pt = MasterTable::new(PhysAddr::new(MB), VirtAddr::new(0), 0);
        attach_pagetable(&pt);
        assert_eq!(current_master(), Some(PhysAddr::new(MB)));
        detach_pagetable();
        assert_eq!(current_master(), None);
    }
}
