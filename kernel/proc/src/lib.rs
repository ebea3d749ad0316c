//! Process descriptors and the three orchestration paths that rebuild
//! them: fork, exec, and copy-on-write fault resolution.
//!
//! [`proc_info`] owns the process table itself (`mm`, file table,
//! credentials, signal state) behind one global lock. [`fork`],
//! [`exec`], and [`cow`] each drive that table through the lower
//! layers (`hadron-mm`'s `mmu`/`vralloc`/`dynmem`, `hadron-sched`,
//! `hadron-priv`) using nothing but `hadron-mm`'s own public API —
//! none of them reach into a page table's raw entry array. [`pagetable`]
//! is the side table that owns page tables' storage, since a `ProcInfo`
//! only ever holds `PageTableId`s.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

pub mod cow;
pub mod exec;
pub mod fork;
pub mod pagetable;
pub mod proc_info;

pub use cow::handle_write_fault;
pub use exec::{exec as exec_image, pack_strings, register as register_loader, ExecFile, ExecLoader, LoadInfo};
pub use fork::proc_fork;
pub use pagetable::{alloc_coarse, alloc_master, free as free_pagetable, with_table};
pub use proc_info::{
    proc_create, proc_exit, proc_info, proc_reap, with_proc, FileTable, Mm, OpenFile, ProcInfo, ProcRegion, ProcState, RegionKind,
};
