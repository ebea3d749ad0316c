//! `proc_fork`: clones a process's address space, page tables, open
//! files, and credentials into a brand-new child.
//!
//! Region cloning never touches a `PageTable`'s raw entry array; it
//! goes through the same public surface any other caller would use
//! (`pagetable::alloc_master`/`alloc_coarse`, `mmu::map_region`,
//! `vralloc::rref`/`rclone`). The child's tables start zeroed and are
//! rebuilt one region at a time from the parent's `ProcRegion` table,
//! which is the only place that remembers what each mapping is *for*.

use hadron_core::addr::{PhysAddr, VirtAddr};
use hadron_core::errno::Errno;
use hadron_core::id::{Pid, Tid};
use hadron_mm::dynmem::{self, AccessPermission, CtrlBits};
use hadron_mm::mmu::{self, PageTable, PageTableId, Region, RegionFlags};
use hadron_mm::vralloc::{self, BufId};
use planck_noalloc::vec::ArrayVec;

use crate::proc_info::{self, Mm, ProcRegion, RegionKind, MAX_PTLIST, MAX_REGIONS};

/// Allocates one dynmem megabyte to hold a page table's own storage.
/// Table storage shares the same physical pool as everything else this
/// kernel hands out; nothing distinguishes it from any other
/// kernel-only allocation except that `hadron-proc`, not `hadron-mm`,
/// decides when to free it.
fn alloc_table_storage() -> Result<PhysAddr, Errno> {
    dynmem::with(|d| d.alloc_region(1, AccessPermission::KernelRw, CtrlBits::empty())).ok_or(Errno::NoMem)
}

fn free_table_storage(addr: PhysAddr) {
    let _ = dynmem::with(|d| d.free_region(addr));
}

/// Parent-to-child table id translations collected while cloning page
/// tables, so region cloning can re-target each `ProcRegion.region.owner`
/// without widening `PageTableId`'s own definition.
type TableMap = ArrayVec<(PageTableId, PageTableId), { MAX_PTLIST + 1 }>;

fn translate_owner(map: &TableMap, parent_owner: PageTableId) -> Result<PageTableId, Errno> {
    map.as_slice()
        .iter()
        .find(|(p, _)| *p == parent_owner)
        .map(|(_, c)| *c)
        .ok_or(Errno::NotRecoverable)
}

fn teardown_pagetables(ptlist: &[PageTableId], master: PageTableId) {
    for &coarse in ptlist {
        let _ = crate::pagetable::free(coarse);
    }
    let _ = crate::pagetable::free(master);
}

/// Allocates a fresh master table for the child and a fresh coarse
/// table for every entry in the parent's `ptlist`, recording the
/// parent→child id mapping. Tables are left zero-initialized; callers
/// populate them by remapping regions, not by copying PTEs, so a
/// partially built child can be torn down with nothing but
/// `pagetable::free` calls.
fn clone_pagetables(parent_mm: &Mm) -> Result<(Mm, TableMap), Errno> {
    let table_phys = alloc_table_storage()?;
    let child_master = match crate::pagetable::alloc_master(table_phys, VirtAddr::new(0), 0) {
        Ok(id) => id,
        Err(e) => {
            free_table_storage(table_phys);
            return Err(e);
        }
    };
    crate::pagetable::with_table(child_master, PageTable::init)?;

    let mut map: TableMap = ArrayVec::new();
    let _ = map.try_push((parent_mm.master, child_master));
    let mut child_mm = Mm::new(child_master);

    for &parent_coarse in parent_mm.ptlist.as_slice() {
        let (virt_base, domain) = match crate::pagetable::with_table(parent_coarse, |t| match t {
            PageTable::Coarse(c) => Ok((c.virt_base, c.domain)),
            PageTable::Master(_) => Err(Errno::NotRecoverable),
        }) {
            Ok(Ok(info)) => info,
            Ok(Err(e)) | Err(e) => {
                teardown_pagetables(child_mm.ptlist.as_slice(), child_master);
                return Err(e);
            }
        };
        let coarse_phys = match alloc_table_storage() {
            Ok(p) => p,
            Err(e) => {
                teardown_pagetables(child_mm.ptlist.as_slice(), child_master);
                return Err(e);
            }
        };
        let child_coarse = match crate::pagetable::alloc_coarse(coarse_phys, virt_base, child_master, domain) {
            Ok(id) => id,
            Err(e) => {
                free_table_storage(coarse_phys);
                teardown_pagetables(child_mm.ptlist.as_slice(), child_master);
                return Err(e);
            }
        };
        crate::pagetable::with_table(child_coarse, PageTable::init)?;
        if child_mm.ptlist.try_push(child_coarse).is_err() {
            teardown_pagetables(child_mm.ptlist.as_slice(), child_master);
            return Err(Errno::NoMem);
        }
        let _ = map.try_push((parent_coarse, child_coarse));
    }
    Ok((child_mm, map))
}

/// Slot/region pairs the parent's own stored `ProcRegion` table must be
/// rewritten with once a region is downgraded to COW, so the parent's
/// next write fault sees the write-disabled mapping instead of a stale
/// `WRITABLE` one (spec §4.7 step 6: "set the COW flag on the parent's
/// region").
type ParentCowUpdates = ArrayVec<(usize, Region), MAX_REGIONS>;

/// Clones every occupied region from the parent into the child per the
/// fork contract: code is ref-shared read-only, the stack is always
/// deep-cloned, and any other writable region becomes COW in both
/// address spaces unless it is already marked `SHARED`. Returns the
/// set of parent regions that were downgraded to COW, which the caller
/// must still persist into the parent's own process-table entry.
fn clone_regions(parent_mm: &Mm, child_mm: &mut Mm, table_map: &TableMap) -> Result<ParentCowUpdates, Errno> {
    let mut parent_cow_updates: ParentCowUpdates = ArrayVec::new();
    let slot_count = parent_mm.regions.as_slice().len();
    for slot in 0..slot_count {
        let Some(parent_region) = parent_mm.region(slot).copied() else {
            continue;
        };
        let child_owner = translate_owner(table_map, parent_region.region.owner)?;

        let (child_region, child_buf) = match parent_region.kind {
            RegionKind::Code => {
                if let Some(buf) = parent_region.buf {
                    vralloc::rref(buf)?;
                }
                (parent_region.region, parent_region.buf)
            }
            RegionKind::Stack => clone_deep(&parent_region)?,
            RegionKind::Heap | RegionKind::Other => {
                if parent_region.region.flags.contains(RegionFlags::SHARED) {
                    if let Some(buf) = parent_region.buf {
                        vralloc::rref(buf)?;
                    }
                    (parent_region.region, parent_region.buf)
                } else if parent_region.region.flags.contains(RegionFlags::WRITABLE) {
                    let (downgraded, buf) = install_cow(&parent_region)?;
                    let _ = parent_cow_updates.try_push((slot, downgraded));
                    (downgraded, buf)
                } else {
                    clone_deep(&parent_region)?
                }
            }
        };

        let mut region = child_region;
        region.owner = child_owner;
        crate::pagetable::with_table(child_owner, |t| mmu::map_region(t, &region))??;
        child_mm.regions.as_mut_slice()[slot] = Some(ProcRegion {
            region,
            buf: child_buf,
            kind: parent_region.kind,
        });
    }
    Ok(parent_cow_updates)
}

/// Installs the COW projection: the parent's own page table is
/// remapped write-disabled in place, and the child starts out an
/// identical read-only alias of the same buffer (a ref, not a clone).
/// Neither side copies bytes until the first write fault. Returns the
/// downgraded `Region`, flagged `COW` with write access removed, for
/// both the child's own `ProcRegion` and the caller to write back into
/// the parent's stored `ProcRegion` — this function only touches
/// hardware page-table entries, not the parent's process-table entry.
fn install_cow(parent_region: &ProcRegion) -> Result<(Region, Option<BufId>), Errno> {
    if let Some(buf) = parent_region.buf {
        vralloc::rref(buf)?;
    }
    let mut downgraded = parent_region.region;
    downgraded.ap = downgraded.ap.write_disabled();
    downgraded.flags.remove(RegionFlags::WRITABLE);
    downgraded.flags.insert(RegionFlags::COW);
    crate::pagetable::with_table(parent_region.region.owner, |t| mmu::map_region(t, &downgraded))??;
    Ok((downgraded, parent_region.buf))
}

/// Deep-clones a region's backing buffer (or raw physical range, for a
/// buffer-less region) into a brand-new allocation.
fn clone_deep(parent_region: &ProcRegion) -> Result<(Region, Option<BufId>), Errno> {
    let mut region = parent_region.region;
    let new_buf = match parent_region.buf {
        Some(buf) => {
            let cloned = vralloc::rclone(buf)?;
            region.phys_base = vralloc::info(cloned)?.phys_addr;
            Some(cloned)
        }
        None => {
            region.phys_base = dynmem::with(|d| d.clone_region(region.phys_base))?;
            None
        }
    };
    Ok((region, new_buf))
}

/// Clones `parent_pid`'s address space, file table, and credentials
/// into a brand-new child process, then forks its main thread.
///
/// # Errors
///
/// Returns `Errno::Srch` if `parent_pid` does not exist, `Errno::NoMem`
/// on any allocation failure along the way (table storage, process
/// slots, buffer clones). Partial state created before the failure is
/// torn down before returning.
pub fn proc_fork(parent_pid: Pid) -> Result<Pid, Errno> {
    let parent = proc_info::proc_info(parent_pid).ok_or(Errno::Srch)?;

    let (mut child_mm, table_map) = clone_pagetables(&parent.mm)?;
    let parent_cow_updates = match clone_regions(&parent.mm, &mut child_mm, &table_map) {
        Ok(updates) => updates,
        Err(e) => {
            teardown_pagetables(child_mm.ptlist.as_slice(), child_mm.master);
            return Err(e);
        }
    };
    child_mm.heap_brk = parent.mm.heap_brk;
    let child_master = child_mm.master;

    // `parent` above is a snapshot (`proc_info::proc_info` clones);
    // `install_cow` only remapped the parent's hardware page table, so
    // its stored `ProcRegion`s here still need the same downgrade
    // written back before any later write fault consults them.
    if !parent_cow_updates.as_slice().is_empty() {
        let persisted = proc_info::with_proc(parent_pid, |p| {
            for &(slot, region) in parent_cow_updates.as_slice() {
                if let Some(pr) = p.mm.regions.as_mut_slice().get_mut(slot).and_then(Option::as_mut) {
                    pr.region = region;
                }
            }
        });
        if persisted.is_err() {
            teardown_pagetables(child_mm.ptlist.as_slice(), child_master);
            return Err(Errno::NotRecoverable);
        }
    }

    let child_cred = parent.cred.fork_inherit();
    let child_pid = match proc_info::proc_create(Some(parent_pid), child_master, child_cred, Tid::new(0)) {
        Ok(pid) => pid,
        Err(e) => {
            teardown_pagetables(child_mm.ptlist.as_slice(), child_master);
            return Err(e);
        }
    };

    let child_signals = parent.signals.fork_inherit();
    let setup = proc_info::with_proc(child_pid, |child| {
        child.mm = child_mm;
        child.pgrp = parent.pgrp;
        child.rlim_nofile = parent.rlim_nofile;
        child.cwd = parent.cwd;
        child.root = parent.root;
        child.signals = child_signals;
        for (fd, file) in parent.files.iter() {
            let _ = child.files.set(fd, file);
        }
    });
    if setup.is_err() {
        let _ = proc_info::proc_exit(child_pid, -1);
        let _ = proc_info::proc_reap(child_pid);
        return Err(Errno::NotRecoverable);
    }

    let child_tid = match hadron_sched::thread_fork(parent.main_thread, child_pid, child_master) {
        Ok(tid) => tid,
        Err(e) => {
            let _ = proc_info::proc_exit(child_pid, -1);
            let _ = proc_info::proc_reap(child_pid);
            return Err(e);
        }
    };
    hadron_sched::thread_set_signals(child_tid, child_signals)?;
    proc_info::with_proc(child_pid, |child| child.main_thread = child_tid)?;
    hadron_sched::thread_ready(child_tid)?;

    Ok(child_pid)
}
