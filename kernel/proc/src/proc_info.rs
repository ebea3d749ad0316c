//! Process descriptors: the `mm` sub-struct (page tables, regions,
//! heap break), the file-descriptor table, and the global process
//! table indexed by PID.

use hadron_core::errno::Errno;
use hadron_core::id::{Fd, Pid, Tid};
use hadron_core::sync::IrqSpinLock;
use hadron_mm::mmu::{PageTableId, Region};
use hadron_priv::cred::Cred;
use hadron_signal::state::SignalState;
use planck_noalloc::vec::ArrayVec;

/// Maximum live processes tracked system-wide.
pub const MAX_PROCS: usize = 128;
/// Maximum second-level (COARSE) tables one process's `mm` tracks.
pub const MAX_PTLIST: usize = 64;
/// Maximum regions one process's address space carries at once.
pub const MAX_REGIONS: usize = 32;
/// Maximum open files one process's file table holds.
pub const MAX_FILES: usize = 64;

/// Reserved region-table slot for the executable's code/data.
pub const REGION_CODE: usize = 0;
/// Reserved region-table slot for the stack.
pub const REGION_STACK: usize = 1;
/// Reserved region-table slot for the heap.
pub const REGION_HEAP: usize = 2;

/// A region plus the buffer backing it and a tag for fork/exec policy,
/// generalizing `hadron_mm::mmu::Region` (which only knows its own
/// mapping attributes, not which vralloc buffer or cache-buffer backs
/// it) for process bookkeeping.
#[derive(Debug, Clone, Copy)]
pub struct ProcRegion {
    /// The mapping itself.
    pub region: Region,
    /// The vralloc buffer backing it, if any (a device-mapped or
    /// foreign-backed region may have none).
    pub buf: Option<hadron_mm::vralloc::BufId>,
    /// What this region is for.
    pub kind: RegionKind,
}

/// What a [`ProcRegion`] is for, governing fork/exec policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    /// The executable's code/rodata: read-only, shared (ref taken, not cloned) on fork.
    Code,
    /// The stack: always deep-cloned on fork.
    Stack,
    /// The heap: COW-or-clone like any other writable region.
    Heap,
    /// Anything else mapped by `mmap` or the loader (e.g. environment).
    Other,
}

/// The address-space half of a process descriptor.
pub struct Mm {
    /// This process's MASTER page table.
    pub master: PageTableId,
    /// Every COARSE table cloned or allocated under `master`.
    pub ptlist: ArrayVec<PageTableId, MAX_PTLIST>,
    /// Live regions; `REGION_CODE`/`REGION_STACK`/`REGION_HEAP` are
    /// reserved slots when occupied, matching the convention every
    /// region-table consumer in this workspace relies on.
    pub regions: ArrayVec<Option<ProcRegion>, MAX_REGIONS>,
    /// Current heap break, in bytes from the heap region's base.
    pub heap_brk: u32,
}

impl Mm {
    pub(crate) fn new(master: PageTableId) -> Self {
        let mut regions = ArrayVec::new();
        for _ in 0..MAX_REGIONS {
            let _ = regions.try_push(None);
        }
        Self {
            master,
            ptlist: ArrayVec::new(),
            regions,
            heap_brk: 0,
        }
    }

    /// Returns the region at a reserved slot, if occupied.
    #[must_use]
    pub fn region(&self, slot: usize) -> Option<&ProcRegion> {
        self.regions.as_slice().get(slot).and_then(Option::as_ref)
    }

    /// Finds the first free region slot beyond the three reserved ones.
    pub(crate) fn free_region_slot(&self) -> Option<usize> {
        self.regions.as_slice().iter().skip(REGION_HEAP + 1).position(Option::is_none).map(|i| i + REGION_HEAP + 1)
    }
}

impl Clone for Mm {
    // `ArrayVec` carries no `Clone` impl of its own (its storage is
    // `MaybeUninit`, so a blanket derive can't tell which slots are
    // live); both fields here hold `Copy` elements, so rebuilding by
    // copying each occupied slot is exact and cheap.
    fn clone(&self) -> Self {
        let mut ptlist = ArrayVec::new();
        for &id in self.ptlist.as_slice() {
            let _ = ptlist.try_push(id);
        }
        let mut regions = ArrayVec::new();
        for region in self.regions.as_slice() {
            let _ = regions.try_push(*region);
        }
        Self {
            master: self.master,
            ptlist,
            regions,
            heap_brk: self.heap_brk,
        }
    }
}

/// A process's open-file table. File objects themselves (vnode
/// references, offsets) live in the VFS layer, out of scope here; this
/// table only tracks which slots are occupied and their `CLOEXEC`
/// marking, the part `proc_fork`/`exec` need to reason about.
pub struct FileTable {
    slots: ArrayVec<Option<OpenFile>, MAX_FILES>,
}

impl Clone for FileTable {
    fn clone(&self) -> Self {
        let mut slots = ArrayVec::new();
        for slot in self.slots.as_slice() {
            let _ = slots.try_push(*slot);
        }
        Self { slots }
    }
}

/// One open-file table entry.
#[derive(Debug, Clone, Copy)]
pub struct OpenFile {
    /// Opaque handle into the VFS layer's own file-object table.
    pub handle: u32,
    /// Whether this descriptor closes across `exec`.
    pub cloexec: bool,
}

impl FileTable {
    fn new() -> Self {
        let mut slots = ArrayVec::new();
        for _ in 0..MAX_FILES {
            let _ = slots.try_push(None);
        }
        Self { slots }
    }

    /// Installs `file` at the lowest free descriptor.
    ///
    /// # Errors
    ///
    /// Returns `Errno::MFile` if the table is full.
    pub fn install(&mut self, file: OpenFile) -> Result<Fd, Errno> {
        let idx = self.slots.as_slice().iter().position(Option::is_none).ok_or(Errno::MFile)?;
        self.slots.as_mut_slice()[idx] = Some(file);
        Ok(Fd::new(idx as u32))
    }

    /// Returns the entry at `fd`, if open.
    #[must_use]
    pub fn get(&self, fd: Fd) -> Option<OpenFile> {
        self.slots.as_slice().get(fd.as_usize()).copied().flatten()
    }

    /// Installs `file` at the specific descriptor `fd`, overwriting
    /// whatever was there. Used by `proc_fork`, which must reproduce
    /// the parent's exact fd numbering rather than compact it (unlike
    /// [`Self::install`], which always picks the lowest free slot).
    ///
    /// # Errors
    ///
    /// Returns `Errno::MFile` if `fd` is beyond this table's capacity.
    pub fn set(&mut self, fd: Fd, file: OpenFile) -> Result<(), Errno> {
        let slot = self.slots.as_mut_slice().get_mut(fd.as_usize()).ok_or(Errno::MFile)?;
        *slot = Some(file);
        Ok(())
    }

    /// Closes `fd`.
    ///
    /// # Errors
    ///
    /// Returns `Errno::BadF` if `fd` is not open.
    pub fn close(&mut self, fd: Fd) -> Result<OpenFile, Errno> {
        let slot = self.slots.as_mut_slice().get_mut(fd.as_usize()).ok_or(Errno::BadF)?;
        slot.take().ok_or(Errno::BadF)
    }

    /// Closes every entry marked `CLOEXEC`, as `exec` does after a
    /// successful load.
    pub fn close_cloexec(&mut self) {
        for slot in self.slots.as_mut_slice() {
            if slot.is_some_and(|f| f.cloexec) {
                *slot = None;
            }
        }
    }

    /// Iterates live entries as `(fd, file)` pairs, for `proc_fork`'s
    /// copy-every-open-file step.
    pub fn iter(&self) -> impl Iterator<Item = (Fd, OpenFile)> + '_ {
        self.slots.as_slice().iter().enumerate().filter_map(|(i, s)| s.map(|f| (Fd::new(i as u32), f)))
    }
}

/// A process's lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    /// Created, not yet scheduled (child still being built by `proc_fork`).
    Init,
    /// Running (has at least one live thread).
    Running,
    /// Exited, exit status recorded, waiting for a parent `wait`.
    Zombie,
}

/// A process descriptor.
#[derive(Clone)]
pub struct ProcInfo {
    /// This process's PID.
    pub pid: Pid,
    /// Parent's PID. `None` only for the very first process.
    pub parent: Option<Pid>,
    /// Process group leader's PID (this process's own PID if it leads its own group).
    pub pgrp: Pid,
    /// Main thread, the one `thread_fork`/loader entry targets.
    pub main_thread: Tid,
    /// Address space.
    pub mm: Mm,
    /// Open-file table.
    pub files: FileTable,
    /// Credentials.
    pub cred: Cred,
    /// Per-thread signal state for the main thread (secondary threads
    /// carry their own copy in their `hadron_sched::ThreadInfo`).
    pub signals: SignalState,
    /// Soft file-descriptor limit; governs the child file table's size
    /// at fork.
    pub rlim_nofile: u32,
    /// Current working directory vnode, opaque to this crate.
    pub cwd: u32,
    /// Root vnode (chroot boundary), opaque to this crate.
    pub root: u32,
    /// Recorded exit status once `Zombie`.
    pub exit_status: Option<i32>,
    /// Lifecycle state.
    pub state: ProcState,
}

struct ProcTable {
    procs: [Option<ProcInfo>; MAX_PROCS],
    next_pid: u32,
}

impl ProcTable {
    const fn new() -> Self {
        Self {
            procs: [const { None }; MAX_PROCS],
            next_pid: 1,
        }
    }

    fn alloc_pid(&mut self) -> Pid {
        loop {
            let candidate = Pid::new(self.next_pid);
            self.next_pid = self.next_pid.wrapping_add(1).max(1);
            if !self.procs.iter().any(|p| p.as_ref().is_some_and(|p| p.pid == candidate)) {
                return candidate;
            }
        }
    }
}

static PROCS: IrqSpinLock<ProcTable> = IrqSpinLock::named("PROC_TABLE", ProcTable::new());

/// Runs `f` with exclusive access to the global process table.
fn with<R>(f: impl FnOnce(&mut ProcTable) -> R) -> R {
    f(&mut PROCS.lock())
}

/// Creates a brand-new process descriptor for `cred`/`master`, in
/// `Init` state, not yet inserted into any process group beyond its own.
///
/// # Errors
///
/// Returns `Errno::NoMem` if the process table is full.
pub fn proc_create(parent: Option<Pid>, master: PageTableId, cred: Cred, main_thread: Tid) -> Result<Pid, Errno> {
    with(|t| {
        let idx = t.procs.iter().position(Option::is_none).ok_or(Errno::NoMem)?;
        let pid = t.alloc_pid();
        t.procs[idx] = Some(ProcInfo {
            pid,
            parent,
            pgrp: pid,
            main_thread,
            mm: Mm::new(master),
            files: FileTable::new(),
            cred,
            signals: SignalState::new(),
            rlim_nofile: MAX_FILES as u32,
            cwd: 0,
            root: 0,
            exit_status: None,
            state: ProcState::Init,
        });
        Ok(pid)
    })
}

/// Runs `f` with a mutable reference to `pid`'s descriptor.
///
/// # Errors
///
/// Returns `Errno::Srch` if `pid` does not exist.
pub fn with_proc<R>(pid: Pid, f: impl FnOnce(&mut ProcInfo) -> R) -> Result<R, Errno> {
    with(|t| {
        let p = t.procs.iter_mut().find_map(|p| p.as_mut().filter(|p| p.pid == pid)).ok_or(Errno::Srch)?;
        Ok(f(p))
    })
}

/// Returns a clone of `pid`'s descriptor, if it exists.
#[must_use]
pub fn proc_info(pid: Pid) -> Option<ProcInfo> {
    with(|t| t.procs.iter().find_map(|p| p.as_ref().filter(|p| p.pid == pid)).cloned())
}

/// Marks `pid` exited with `status`, transitioning it to `Zombie`. The
/// slot itself is freed later by [`proc_reap`] once a parent observes it.
///
/// # Errors
///
/// Returns `Errno::Srch` if `pid` does not exist.
pub fn proc_exit(pid: Pid, status: i32) -> Result<(), Errno> {
    with_proc(pid, |p| {
        p.state = ProcState::Zombie;
        p.exit_status = Some(status);
    })
}

/// Frees `pid`'s slot after a parent has collected its exit status.
///
/// # Errors
///
/// Returns `Errno::Srch` if `pid` does not exist or is not `Zombie`.
pub fn proc_reap(pid: Pid) -> Result<i32, Errno> {
    with(|t| {
        let slot = t
            .procs
            .iter_mut()
            .find(|p| p.as_ref().is_some_and(|p| p.pid == pid && p.state == ProcState::Zombie))
            .ok_or(Errno::Srch)?;
        let status = slot.as_ref().expect("matched above").exit_status.expect("zombie always has a status");
        *slot = None;
        Ok(status)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use hadron_core::id::{Gid, Uid};
    static TEST_SERIAL: std::sync::Mutex<()> = std::sync::Mutex::new(());

    fn reset() {
        let mut t = PROCS.lock();
        *t = ProcTable::new();
    }

    #[test]
    fn create_then_lookup() {
        let _guard = TEST_SERIAL.lock().unwrap();
        reset();
        let cred = Cred::new_unprivileged(Uid::new(1000), Gid::new(1000));
        let pid = proc_create(None, PageTableId(0), cred, Tid::new(1)).unwrap();
        let info = proc_info(pid).unwrap();
        assert_eq!(info.state, ProcState::Init);
        assert_eq!(info.pgrp, pid);
    }

    #[test]
    fn exit_then_reap() {
        let _guard = TEST_SERIAL.lock().unwrap();
        reset();
        let cred = Cred::new_unprivileged(Uid::new(1000), Gid::new(1000));
        let pid = proc_create(None, PageTableId(0), cred, Tid::new(1)).unwrap();
        proc_exit(pid, 7).unwrap();
        assert_eq!(proc_info(pid).unwrap().state, ProcState::Zombie);
        assert_eq!(proc_reap(pid).unwrap(), 7);
        assert!(proc_info(pid).is_none());
    }

    #[test]
    fn file_table_install_and_close() {
        let mut ft = FileTable::new();
        let fd = ft
            .install(OpenFile {
                handle: 42,
                cloexec: true,
            })
            .unwrap();
        assert_eq!(ft.get(fd).unwrap().handle, 42);
        ft.close(fd).unwrap();
        assert!(ft.get(fd).is_none());
    }

    #[test]
    fn file_table_close_cloexec_only() {
        let mut ft = FileTable::new();
        let keep = ft
            .install(OpenFile {
                handle: 1,
                cloexec: false,
            })
            .unwrap();
        let drop_fd = ft
            .install(OpenFile {
                handle: 2,
                cloexec: true,
            })
            .unwrap();
        ft.close_cloexec();
        assert!(ft.get(keep).is_some());
        assert!(ft.get(drop_fd).is_none());
    }

    #[test]
    fn pids_are_not_reused_while_live() {
        let _guard = TEST_SERIAL.lock().unwrap();
        reset();
        let cred = Cred::new_unprivileged(Uid::new(1000), Gid::new(1000));
        let a = proc_create(None, PageTableId(0), cred.clone(), Tid::new(1)).unwrap();
        let b = proc_create(None, PageTableId(1), cred, Tid::new(2)).unwrap();
        assert_ne!(a, b);
    }
}
