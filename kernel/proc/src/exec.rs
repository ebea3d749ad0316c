//! Executable loading: finds a registered format loader, rebuilds the
//! calling process's image, and starts a fresh main thread at the
//! loaded entry point.
//!
//! Loader dispatch is the one place in this crate that reaches for
//! `dyn Trait`: the set of executable formats is genuinely open and
//! grows by registration at boot, unlike every other enum-shaped
//! choice in this workspace.

use hadron_core::addr::VirtAddr;
use hadron_core::errno::Errno;
use hadron_core::id::{Fd, Pid, Tid};
use hadron_core::sync::IrqSpinLock;
use hadron_mm::dynmem::{self, AccessPermission, CtrlBits};
use hadron_mm::mmu::{self, PageTable, PageTableId, Region, RegionFlags};
use hadron_mm::vralloc;
use planck_noalloc::vec::ArrayVec;

use crate::proc_info::{self, ProcInfo, ProcRegion, RegionKind};

/// Opaque handle to the file being exec'd. The VFS layer that resolves
/// it to bytes is out of scope here; exec only threads it through to
/// whichever loader claims it.
pub type ExecFile = u32;

/// What a loader hands back once it has built the new image's CODE
/// and STACK regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadInfo {
    /// Entry point the new main thread starts executing at.
    pub entry: VirtAddr,
    /// Requested user stack size in bytes.
    pub stack_size: u32,
}

/// An executable-format loader, registered once at boot.
pub trait ExecLoader: Sync {
    /// A short name for diagnostics.
    fn name(&self) -> &'static str;

    /// Returns whether this loader recognizes `file`'s format.
    fn test(&self, file: ExecFile) -> bool;

    /// Builds `proc`'s CODE and STACK regions for `file` and returns
    /// the entry point and requested stack size. Called before exec
    /// tears down the caller's heap and environment, so a failure here
    /// leaves the caller's old image intact.
    ///
    /// # Errors
    ///
    /// Returns an `Errno` if the image cannot be loaded (truncated
    /// file, unsupported format detail, out of memory).
    fn load(&self, proc: &mut ProcInfo, file: ExecFile) -> Result<LoadInfo, Errno>;
}

const MAX_LOADERS: usize = 8;

static LOADERS: IrqSpinLock<ArrayVec<&'static dyn ExecLoader, MAX_LOADERS>> = IrqSpinLock::named("EXEC_LOADERS", ArrayVec::new());

/// Registers a loader, typically once at boot per compiled-in
/// executable format. Loaders are tried in registration order.
///
/// # Errors
///
/// Returns `Errno::NoMem` if the registry is full.
pub fn register(loader: &'static dyn ExecLoader) -> Result<(), Errno> {
    LOADERS.lock().try_push(loader).map_err(|_| Errno::NoMem)
}

fn find_loader(file: ExecFile) -> Option<&'static dyn ExecLoader> {
    LOADERS.lock().as_slice().iter().find(|l| l.test(file)).copied()
}

/// Offset, within a COARSE table's 1 MB window, of the page exec maps
/// the packed argv/envp environment into.
const ENV_PAGE_OFFSET: u32 = 0xff000;

fn free_heap_and_above(proc: &mut ProcInfo) {
    let slot_count = proc.mm.regions.as_slice().len();
    for slot in proc_info::REGION_HEAP..slot_count {
        let Some(region) = proc.mm.regions.as_slice()[slot] else {
            continue;
        };
        let _ = crate::pagetable::with_table(region.region.owner, |t| mmu::unmap_region(t, &region.region));
        if let Some(buf) = region.buf {
            let _ = vralloc::rfree(buf);
        } else {
            let _ = dynmem::with(|d| d.free_region(region.region.phys_base));
        }
        proc.mm.regions.as_mut_slice()[slot] = None;
    }
    proc.mm.heap_brk = 0;
}

fn map_environment(proc: &mut ProcInfo, bytes: &[u8]) -> Result<(), Errno> {
    let slot = proc.mm.free_region_slot().ok_or(Errno::NoMem)?;
    let coarse = *proc.mm.ptlist.as_slice().first().ok_or(Errno::NotRecoverable)?;
    let virt_base = crate::pagetable::with_table(coarse, |t| match t {
        PageTable::Coarse(c) => Ok(c.virt_base),
        PageTable::Master(_) => Err(Errno::NotRecoverable),
    })??;

    let buf = vralloc::geteblk(bytes.len() as u32)?;
    let info = vralloc::info(buf)?;
    // SAFETY: `buf` was just allocated to hold exactly `bytes.len()` bytes.
    unsafe {
        core::ptr::copy_nonoverlapping(bytes.as_ptr(), dynmem::phys_ptr(info.phys_addr), bytes.len());
    }

    let region = Region {
        virt_base: virt_base + ENV_PAGE_OFFSET,
        page_count: 1,
        ap: AccessPermission::KernelRwUserRo,
        ctrl: CtrlBits::empty(),
        flags: RegionFlags::empty(),
        phys_base: info.phys_addr,
        owner: coarse,
    };
    match crate::pagetable::with_table(coarse, |t| mmu::map_region(t, &region)) {
        Ok(Ok(())) => {}
        Ok(Err(e)) | Err(e) => {
            let _ = vralloc::rfree(buf);
            return Err(e);
        }
    }
    proc.mm.regions.as_mut_slice()[slot] = Some(ProcRegion {
        region,
        buf: Some(buf),
        kind: RegionKind::Other,
    });
    Ok(())
}

/// Packs a NUL-terminated-string array into one contiguous byte buffer,
/// the on-disk/in-memory shape the loaded process's environment region
/// carries (spec §6, "process exec environment").
#[must_use]
pub fn pack_strings(strings: &[&[u8]]) -> ArrayVec<u8, 4096> {
    let mut out = ArrayVec::new();
    for s in strings {
        for &b in *s {
            let _ = out.try_push(b);
        }
        let _ = out.try_push(0);
    }
    out
}

/// Replaces `pid`'s image with the executable `file` resolves to.
///
/// Frees the caller's heap-and-above regions, closes the executable fd
/// and every `CLOEXEC` descriptor, maps a fresh environment region
/// from `env_bytes` (already packed by [`pack_strings`]), and spawns a
/// new main thread. The old main thread is marked for death rather
/// than reaped outright, so a racing `wait` still observes it.
///
/// The returned [`LoadInfo`] is the caller's cue to build the new
/// thread's initial trap frame (entry PC, stack pointer, `argc`/
/// `argv`/`envp` registers) — work that belongs to the syscall-return
/// path, not here.
///
/// # Errors
///
/// Returns `Errno::NoExec` if no registered loader claims `file`, or
/// whatever the loader / region setup itself failed with. On error the
/// process is left as it was before the call.
pub fn exec(pid: Pid, file: ExecFile, exec_fd: Fd, env_bytes: &[u8]) -> Result<(Tid, LoadInfo), Errno> {
    let loader = find_loader(file).ok_or(Errno::NoExec)?;

    let (master, old_thread, load_info) = proc_info::with_proc(pid, |proc| -> Result<(PageTableId, Tid, LoadInfo), Errno> {
        let load_info = loader.load(proc, file)?;
        free_heap_and_above(proc);
        let _ = proc.files.close(exec_fd);
        proc.files.close_cloexec();
        map_environment(proc, env_bytes)?;
        Ok((proc.mm.master, proc.main_thread, load_info))
    })??;

    let new_thread = hadron_sched::thread_create(pid, hadron_sched::Policy::Other, 10, master)?;
    proc_info::with_proc(pid, |proc| proc.main_thread = new_thread)?;
    hadron_sched::thread_ready(new_thread)?;
    let _ = hadron_sched::thread_die(old_thread);

    Ok((new_thread, load_info))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hadron_core::addr::PAGE_SIZE;
    use hadron_core::id::{Gid, Uid};
    use hadron_mm::mmu::PageTable;
    use hadron_priv::cred::Cred;

    static TEST_SERIAL: std::sync::Mutex<()> = std::sync::Mutex::new(());

    struct StubLoader;

    impl ExecLoader for StubLoader {
        fn name(&self) -> &'static str {
            "stub"
        }

        fn test(&self, file: ExecFile) -> bool {
            file == 1
        }

        fn load(&self, proc: &mut ProcInfo, _file: ExecFile) -> Result<LoadInfo, Errno> {
            let coarse = *proc.mm.ptlist.as_slice().first().ok_or(Errno::NotRecoverable)?;
            let buf = vralloc::geteblk(PAGE_SIZE)?;
            let region = Region {
                virt_base: VirtAddr::new(0x0000),
                page_count: 1,
                ap: AccessPermission::KernelRwUserRo,
                ctrl: CtrlBits::empty(),
                flags: RegionFlags::EXECUTABLE,
                phys_base: vralloc::info(buf)?.phys_addr,
                owner: coarse,
            };
            crate::pagetable::with_table(coarse, |t| mmu::map_region(t, &region))??;
            proc.mm.regions.as_mut_slice()[proc_info::REGION_CODE] = Some(ProcRegion {
                region,
                buf: Some(buf),
                kind: RegionKind::Code,
            });
            Ok(LoadInfo {
                entry: VirtAddr::new(0x0000),
                stack_size: PAGE_SIZE,
            })
        }
    }

    fn build_proc_with_heap() -> Pid {
        let table_phys = dynmem::with(|d| d.alloc_region(1, AccessPermission::KernelRw, CtrlBits::empty())).unwrap();
        let master = crate::pagetable::alloc_master(table_phys, VirtAddr::new(0), 0).unwrap();
        crate::pagetable::with_table(master, PageTable::init).unwrap();
        let coarse_phys = dynmem::with(|d| d.alloc_region(1, AccessPermission::KernelRw, CtrlBits::empty())).unwrap();
        let coarse = crate::pagetable::alloc_coarse(coarse_phys, VirtAddr::new(0), master, 0).unwrap();
        crate::pagetable::with_table(coarse, PageTable::init).unwrap();

        let cred = Cred::new_unprivileged(Uid::new(1000), Gid::new(1000));
        let tid = hadron_sched::thread_create(Pid::new(1), hadron_sched::Policy::Other, 10, master).unwrap();
        let pid = proc_info::proc_create(None, master, cred, tid).unwrap();
        proc_info::with_proc(pid, |p| {
            p.mm.ptlist.try_push(coarse).unwrap();
            p.files
                .install(proc_info::OpenFile {
                    handle: 5,
                    cloexec: false,
                })
                .unwrap();
        })
        .unwrap();
        pid
    }

    #[test]
    fn exec_with_no_loader_fails_noexec() {
        let _guard = TEST_SERIAL.lock().unwrap();
        let pid = build_proc_with_heap();
        assert_eq!(exec(pid, 999, Fd::new(0), &[]), Err(Errno::NoExec));
    }

    #[test]
    fn exec_loads_image_and_spawns_new_main_thread() {
        let _guard = TEST_SERIAL.lock().unwrap();
        register(&StubLoader).ok();
        let pid = build_proc_with_heap();
        let before = proc_info::proc_info(pid).unwrap();
        let old_thread = before.main_thread;

        let env = pack_strings(&[b"PATH=/bin", b"HOME=/root"]);
        let (new_thread, load_info) = exec(pid, 1, Fd::new(0), env.as_slice()).unwrap();

        assert_ne!(new_thread, old_thread);
        assert_eq!(load_info.entry, VirtAddr::new(0x0000));
        let after = proc_info::proc_info(pid).unwrap();
        assert_eq!(after.main_thread, new_thread);
        assert!(after.mm.region(proc_info::REGION_CODE).is_some());
        assert!(after.files.get(Fd::new(0)).is_none());
    }

    #[test]
    fn pack_strings_nul_terminates_each_entry() {
        let packed = pack_strings(&[b"a", b"bb"]);
        assert_eq!(packed.as_slice(), b"a\0bb\0");
    }
}
