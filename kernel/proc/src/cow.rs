//! Copy-on-write fault resolution: the half of `mmu::classify_fault`'s
//! `Recoverable` outcome that actually fixes the mapping up before the
//! faulting instruction is retried.

use hadron_core::addr::VirtAddr;
use hadron_core::id::Pid;
use hadron_mm::dynmem;
use hadron_mm::mmu::{self, FatalSignal, Region, RegionFlags};
use hadron_mm::vralloc;

use crate::proc_info::{self, ProcRegion};

fn region_slot_for(regions: &[Option<ProcRegion>], addr: VirtAddr) -> Option<usize> {
    regions.iter().position(|r| {
        r.is_some_and(|r| {
            let base = r.region.virt_base.as_u32();
            let extent = base + r.region.page_count * hadron_core::addr::PAGE_SIZE;
            (base..extent).contains(&addr.as_u32())
        })
    })
}

/// Resolves a write fault at `addr` in `pid`'s address space.
///
/// Looks up the region covering `addr`; if it is not marked COW, the
/// fault is not ours to fix (the caller's classification was wrong, or
/// a second thread already raced this fault to completion and
/// upgraded the mapping, in which case there is nothing left to do).
/// Otherwise clones the backing page, remaps it writable, and drops
/// the shared reference.
///
/// # Errors
///
/// Returns `FatalSignal::Segv` if `pid` has no such process, no region
/// covers `addr`, or the clone/remap itself fails — all of which the
/// caller delivers to the faulting thread rather than retrying.
pub fn handle_write_fault(pid: Pid, addr: VirtAddr) -> Result<(), FatalSignal> {
    proc_info::with_proc(pid, |proc| resolve(proc, addr)).map_err(|_| FatalSignal::Segv)?
}

fn resolve(proc: &mut proc_info::ProcInfo, addr: VirtAddr) -> Result<(), FatalSignal> {
    let slot = region_slot_for(proc.mm.regions.as_slice(), addr).ok_or(FatalSignal::Segv)?;
    let parent_region = proc.mm.regions.as_slice()[slot].ok_or(FatalSignal::Segv)?;

    if !parent_region.region.flags.contains(RegionFlags::COW) {
        return Ok(());
    }

    let (region, buf) = clone_writable(&parent_region).map_err(|_| FatalSignal::Segv)?;
    crate::pagetable::with_table(region.owner, |t| mmu::map_region(t, &region))
        .map_err(|_| FatalSignal::Segv)?
        .map_err(|_| FatalSignal::Segv)?;

    if let Some(old_buf) = parent_region.buf {
        let _ = vralloc::rfree(old_buf);
    } else {
        let _ = dynmem::with(|d| d.free_region(parent_region.region.phys_base));
    }

    proc.mm.regions.as_mut_slice()[slot] = Some(ProcRegion {
        region,
        buf,
        kind: parent_region.kind,
    });
    Ok(())
}

fn clone_writable(parent_region: &ProcRegion) -> Result<(Region, Option<vralloc::BufId>), hadron_core::errno::Errno> {
    let mut region = parent_region.region;
    let buf = match parent_region.buf {
        Some(old_buf) => {
            let cloned = vralloc::rclone(old_buf)?;
            region.phys_base = vralloc::info(cloned)?.phys_addr;
            Some(cloned)
        }
        None => {
            region.phys_base = dynmem::with(|d| d.clone_region(region.phys_base))?;
            None
        }
    };
    region.ap = region.ap.write_enabled();
    region.flags.remove(RegionFlags::COW);
    region.flags.insert(RegionFlags::WRITABLE);
    Ok((region, buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hadron_core::addr::PAGE_SIZE;
    use hadron_core::id::{Gid, Uid};
    use hadron_mm::dynmem::{AccessPermission, CtrlBits};
    use hadron_mm::mmu::PageTable;
    use hadron_priv::cred::Cred;
    use hadron_sched::Policy;

    static TEST_SERIAL: std::sync::Mutex<()> = std::sync::Mutex::new(());

    fn build_cow_proc() -> (Pid, VirtAddr) {
        let table_phys = dynmem::with(|d| d.alloc_region(1, AccessPermission::KernelRw, CtrlBits::empty())).unwrap();
        let master = crate::pagetable::alloc_master(table_phys, VirtAddr::new(0), 0).unwrap();
        crate::pagetable::with_table(master, PageTable::init).unwrap();
        let coarse_phys = dynmem::with(|d| d.alloc_region(1, AccessPermission::KernelRw, CtrlBits::empty())).unwrap();
        let coarse = crate::pagetable::alloc_coarse(coarse_phys, VirtAddr::new(0), master, 0).unwrap();
        crate::pagetable::with_table(coarse, PageTable::init).unwrap();

        let buf = vralloc::geteblk(PAGE_SIZE).unwrap();
        vralloc::rref(buf).unwrap();
        let base = VirtAddr::new(0x2000);
        let mut region = Region {
            virt_base: base,
            page_count: 1,
            ap: AccessPermission::KernelRwUserRw,
            ctrl: CtrlBits::empty(),
            flags: RegionFlags::WRITABLE,
            phys_base: vralloc::info(buf).unwrap().phys_addr,
            owner: coarse,
        };
        region.ap = region.ap.write_disabled();
        region.flags.remove(RegionFlags::WRITABLE);
        region.flags.insert(RegionFlags::COW);
        crate::pagetable::with_table(coarse, |t| mmu::map_region(t, &region)).unwrap().unwrap();

        let cred = Cred::new_unprivileged(Uid::new(1000), Gid::new(1000));
        let tid = hadron_sched::thread_create(Pid::new(1), Policy::Other, 10, master).unwrap();
        let pid = proc_info::proc_create(None, master, cred, tid).unwrap();
        proc_info::with_proc(pid, |p| {
            p.mm.ptlist.try_push(coarse).unwrap();
            p.mm.regions.as_mut_slice()[proc_info::REGION_HEAP] = Some(ProcRegion {
                region,
                buf: Some(buf),
                kind: proc_info::RegionKind::Heap,
            });
        })
        .unwrap();
        (pid, base)
    }

    #[test]
    fn write_fault_clones_and_upgrades_to_writable() {
        let _guard = TEST_SERIAL.lock().unwrap();
        let (pid, addr) = build_cow_proc();
        let before = proc_info::proc_info(pid).unwrap();
        let before_region = before.mm.region(proc_info::REGION_HEAP).unwrap();
        assert!(before_region.region.flags.contains(RegionFlags::COW));

        handle_write_fault(pid, addr).unwrap();

        let after = proc_info::proc_info(pid).unwrap();
        let after_region = after.mm.region(proc_info::REGION_HEAP).unwrap();
        assert!(after_region.region.flags.contains(RegionFlags::WRITABLE));
        assert!(!after_region.region.flags.contains(RegionFlags::COW));
        assert_ne!(after_region.region.phys_base, before_region.region.phys_base);
    }

    #[test]
    fn write_fault_outside_any_region_is_fatal() {
        let _guard = TEST_SERIAL.lock().unwrap();
        let (pid, _) = build_cow_proc();
        assert_eq!(handle_write_fault(pid, VirtAddr::new(0xffff_0000)), Err(FatalSignal::Segv));
    }

    #[test]
    fn write_fault_on_already_writable_region_is_a_noop() {
        let _guard = TEST_SERIAL.lock().unwrap();
        let (pid, addr) = build_cow_proc();
        handle_write_fault(pid, addr).unwrap();
        let before = proc_info::proc_info(pid).unwrap().mm.region(proc_info::REGION_HEAP).unwrap().region.phys_base;
        handle_write_fault(pid, addr).unwrap();
        let after = proc_info::proc_info(pid).unwrap().mm.region(proc_info::REGION_HEAP).unwrap().region.phys_base;
        assert_eq!(before, after);
    }

    #[test]
    fn missing_process_is_fatal() {
        let _guard = TEST_SERIAL.lock().unwrap();
        assert_eq!(handle_write_fault(Pid::new(999_999), VirtAddr::new(0x1000)), Err(FatalSignal::Segv));
    }
}
