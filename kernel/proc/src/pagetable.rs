//! Storage for the [`PageTable`]s `hadron_mm::mmu` operates on.
//!
//! `hadron-mm` defines the MASTER/COARSE table shapes and the mapping
//! operations over them but deliberately does not own table storage
//! (see [`hadron_mm::mmu::PageTableId`]'s doc comment): that is a
//! process-table concern. This module is the side table of live
//! `PageTable`s indexed by `PageTableId`, the same stable-handle
//! convention as every other allocator in this workspace.

use hadron_core::addr::{PhysAddr, VirtAddr};
use hadron_core::errno::Errno;
use hadron_core::sync::IrqSpinLock;
use hadron_mm::mmu::{CoarseTable, MasterTable, PageTable, PageTableId};

const MAX_TABLES: usize = 512;

struct Store {
    tables: [Option<PageTable>; MAX_TABLES],
}

impl Store {
    const fn new() -> Self {
        Self {
            tables: [const { None }; MAX_TABLES],
        }
    }
}

static STORE: IrqSpinLock<Store> = IrqSpinLock::named("PAGETABLE_STORE", Store::new());

fn with<R>(f: impl FnOnce(&mut Store) -> R) -> R {
    f(&mut STORE.lock())
}

/// Allocates a fresh MASTER table backed by physical storage at
/// `table_phys`, zero-filled.
///
/// # Errors
///
/// Returns `Errno::NoMem` if the table store is full.
pub fn alloc_master(table_phys: PhysAddr, virt_base: VirtAddr, domain: u8) -> Result<PageTableId, Errno> {
    with(|s| {
        let idx = s.tables.iter().position(Option::is_none).ok_or(Errno::NoMem)?;
        s.tables[idx] = Some(PageTable::Master(MasterTable::new(table_phys, virt_base, domain)));
        Ok(PageTableId(idx as u32))
    })
}

/// Allocates a fresh COARSE table linked from `master`.
///
/// # Errors
///
/// Returns `Errno::NoMem` if the table store is full.
pub fn alloc_coarse(
    table_phys: PhysAddr,
    virt_base: VirtAddr,
    master: PageTableId,
    domain: u8,
) -> Result<PageTableId, Errno> {
    with(|s| {
        let idx = s.tables.iter().position(Option::is_none).ok_or(Errno::NoMem)?;
        s.tables[idx] = Some(PageTable::Coarse(CoarseTable::new(table_phys, virt_base, master, domain)));
        Ok(PageTableId(idx as u32))
    })
}

/// Frees a table's slot. The caller is responsible for having already
/// unmapped and released any regions it held.
///
/// # Errors
///
/// Returns `Errno::Inval` if `id` does not exist.
pub fn free(id: PageTableId) -> Result<(), Errno> {
    with(|s| {
        let slot = s.tables.get_mut(id.0 as usize).ok_or(Errno::Inval)?;
        if slot.is_none() {
            return Err(Errno::Inval);
        }
        *slot = None;
        Ok(())
    })
}

/// Runs `f` with exclusive access to the table at `id`.
///
/// # Errors
///
/// Returns `Errno::Inval` if `id` does not exist.
pub fn with_table<R>(id: PageTableId, f: impl FnOnce(&mut PageTable) -> R) -> Result<R, Errno> {
    with(|s| {
        let t = s.tables.get_mut(id.0 as usize).and_then(Option::as_mut).ok_or(Errno::Inval)?;
        Ok(f(t))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    static TEST_SERIAL: std::sync::Mutex<()> = std::sync::Mutex::new(());

    #[test]
    fn alloc_free_master() {
        let _guard = TEST_SERIAL.lock().unwrap();
        let id = alloc_master(PhysAddr::new(0x1000), VirtAddr::new(0), 0).unwrap();
        with_table(id, |t| t.init()).unwrap();
        free(id).unwrap();
        assert_eq!(free(id), Err(Errno::Inval));
    }

    #[test]
    fn coarse_links_to_master() {
        let _guard = TEST_SERIAL.lock().unwrap();
        let master = alloc_master(PhysAddr::new(0x2000), VirtAddr::new(0), 0).unwrap();
        let coarse = alloc_coarse(PhysAddr::new(0x3000), VirtAddr::new(0), master, 0).unwrap();
        with_table(coarse, |t| match t {
            PageTable::Coarse(c) => assert_eq!(c.master, master),
            PageTable::Master(_) => panic!("expected coarse"),
        })
        .unwrap();
        free(coarse).unwrap();
        free(master).unwrap();
    }
}
