//! Hierarchical `kern.*`/`vm.*`/`security.*`/`hw.*`/`debug.test.*` tunable
//! and statistics tree.
//!
//! Nodes are registered into a fixed-capacity table at init time by an
//! explicit [`register`] call, replacing the source's linker-set
//! (`DATA_SET`) style self-registration with an explicit registry, per
//! the design note preferring that pattern wherever the source used
//! link-time sets.

use hadron_core::errno::Errno;
use hadron_core::sync::SpinLock;

const MAX_NODES: usize = 64;
/// Longest dotted node name this tree accepts, e.g. `vm.dynmem.nr_reserved`.
pub const NAME_MAX: usize = 31;

bitflags::bitflags! {
    /// Access flags checked against the caller's credentials and
    /// securelevel before a read or write proceeds.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SysctlFlags: u8 {
        /// Readable by any caller that passes the securelevel check.
        const READ = 1 << 0;
        /// Writable; additionally requires `PRIV_SYSCTL_WRITE`.
        const WRITE = 1 << 1;
    }
}

/// A node's current value and type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeValue {
    /// Signed integer.
    Int(i32),
    /// Unsigned integer.
    UInt(u32),
    /// Boolean.
    Bool(bool),
    /// A fixed-capacity string; unused bytes beyond `len` are not
    /// meaningful.
    Str {
        /// Raw bytes; only `[..len]` is valid.
        bytes: [u8; 32],
        /// Logical length.
        len: u8,
    },
    /// Opaque binary blob the owning subsystem interprets itself.
    Opaque,
    /// Computed on read/write by the owning subsystem rather than
    /// stored; `PROC` nodes carry no value here, only a handler tag
    /// the dispatcher resolves externally (a function pointer table
    /// in a `no_std` crate would need `'static` storage this crate
    /// does not assume callers have; the dispatcher looks the handler
    /// up by name instead).
    Proc,
}

/// One entry in the tree.
#[derive(Debug, Clone, Copy)]
struct Node {
    name: [u8; NAME_MAX],
    name_len: u8,
    value: NodeValue,
    flags: SysctlFlags,
}

fn name_bytes(name: &str) -> ([u8; NAME_MAX], u8) {
    let mut bytes = [0u8; NAME_MAX];
    let src = name.as_bytes();
    let len = src.len().min(NAME_MAX);
    bytes[..len].copy_from_slice(&src[..len]);
    (bytes, len as u8)
}

struct Tree {
    nodes: [Option<Node>; MAX_NODES],
}

impl Tree {
    const fn new() -> Self {
        Self {
            nodes: [const { None }; MAX_NODES],
        }
    }

    fn find(&self, name: &str) -> Option<usize> {
        let (bytes, len) = name_bytes(name);
        self.nodes.iter().position(|slot| {
            slot.is_some_and(|n| n.name_len == len && n.name[..len as usize] == bytes[..len as usize])
        })
    }
}

static TREE: SpinLock<Tree> = SpinLock::new(Tree::new());

/// Registers a new node at `name` with an initial value and access
/// flags. Called at init time for every kernel tunable and statistic;
/// never called from a syscall handler.
///
/// # Errors
///
/// Returns `Errno::Exist` if `name` is already registered,
/// `Errno::NameTooLong` if it exceeds [`NAME_MAX`], `Errno::NoMem` if
/// the table is full.
pub fn register(name: &str, value: NodeValue, flags: SysctlFlags) -> Result<(), Errno> {
    if name.len() > NAME_MAX {
        return Err(Errno::NameTooLong);
    }
    let mut tree = TREE.lock();
    if tree.find(name).is_some() {
        return Err(Errno::Exist);
    }
    let idx = tree
        .nodes
        .iter()
        .position(Option::is_none)
        .ok_or(Errno::NoMem)?;
    let (name, name_len) = name_bytes(name);
    tree.nodes[idx] = Some(Node {
        name,
        name_len,
        value,
        flags,
    });
    Ok(())
}

/// Reads `name`'s current value.
///
/// # Errors
///
/// Returns `Errno::NoEnt` if unregistered, `Errno::Access` if the node
/// lacks `READ`.
pub fn get(name: &str) -> Result<NodeValue, Errno> {
    let tree = TREE.lock();
    let idx = tree.find(name).ok_or(Errno::NoEnt)?;
    let node = tree.nodes[idx].expect("index from find is always occupied");
    if !node.flags.contains(SysctlFlags::READ) {
        return Err(Errno::Access);
    }
    Ok(node.value)
}

/// Overwrites `name`'s value. The caller is responsible for having
/// already checked credentials/securelevel against [`SysctlFlags::WRITE`]
/// and `PRIV_SYSCTL_WRITE`; this function only checks the node's own
/// `WRITE` flag and that the replacement value's type tag matches.
///
/// # Errors
///
/// Returns `Errno::NoEnt` if unregistered, `Errno::Access` if the node
/// lacks `WRITE`, `Errno::Inval` if `value`'s variant differs from the
/// node's current one.
pub fn set(name: &str, value: NodeValue) -> Result<(), Errno> {
    let mut tree = TREE.lock();
    let idx = tree.find(name).ok_or(Errno::NoEnt)?;
    let node = tree.nodes[idx].as_mut().expect("index from find is always occupied");
    if !node.flags.contains(SysctlFlags::WRITE) {
        return Err(Errno::Access);
    }
    if core::mem::discriminant(&node.value) != core::mem::discriminant(&value) {
        return Err(Errno::Inval);
    }
    node.value = value;
    Ok(())
}

/// Removes every registered node. Intended for test setup between
/// cases; never called outside `#[cfg(test)]`.
#[cfg(test)]
pub fn clear_all() {
    let mut tree = TREE.lock();
    tree.nodes = [const { None }; MAX_NODES];
}

#[cfg(test)]
mod tests {
    use super::*;
    static TEST_SERIAL: std::sync::Mutex<()> = std::sync::Mutex::new(());

    #[test]
    fn register_then_get() {
        let _guard = TEST_SERIAL.lock().unwrap();
        clear_all();
        register("kern.maxproc", NodeValue::UInt(256), SysctlFlags::READ).unwrap();
        assert_eq!(get("kern.maxproc"), Ok(NodeValue::UInt(256)));
    }

    #[test]
    fn duplicate_register_rejected() {
        let _guard = TEST_SERIAL.lock().unwrap();
        clear_all();
        register("vm.dynmem.free", NodeValue::UInt(64), SysctlFlags::READ).unwrap();
        assert_eq!(
            register("vm.dynmem.free", NodeValue::UInt(0), SysctlFlags::READ),
            Err(Errno::Exist)
        );
    }

    #[test]
    fn read_only_node_rejects_write() {
        let _guard = TEST_SERIAL.lock().unwrap();
        clear_all();
        register("security.securelevel", NodeValue::Int(0), SysctlFlags::READ).unwrap();
        assert_eq!(
            set("security.securelevel", NodeValue::Int(1)),
            Err(Errno::Access)
        );
    }

    #[test]
    fn writable_node_updates() {
        let _guard = TEST_SERIAL.lock().unwrap();
        clear_all();
        register(
            "security.securelevel",
            NodeValue::Int(0),
            SysctlFlags::READ | SysctlFlags::WRITE,
        )
        .unwrap();
        set("security.securelevel", NodeValue::Int(1)).unwrap();
        assert_eq!(get("security.securelevel"), Ok(NodeValue::Int(1)));
    }

    #[test]
    fn type_mismatch_on_set_rejected() {
        let _guard = TEST_SERIAL.lock().unwrap();
        clear_all();
        register("kern.nprocs", NodeValue::UInt(1), SysctlFlags::READ | SysctlFlags::WRITE).unwrap();
        assert_eq!(set("kern.nprocs", NodeValue::Bool(true)), Err(Errno::Inval));
    }

    #[test]
    fn unregistered_lookup_fails() {
        let _guard = TEST_SERIAL.lock().unwrap();
        clear_all();
        assert_eq!(get("hw.nonexistent"), Err(Errno::NoEnt));
    }
}
