//! Filesystem-adjacent kernel state that does not need a real block
//! device to be meaningful on its own: the buffer cache, the
//! directory-entry hashtable used by directory vnodes, and the packet
//! queues backing pipes and ptys.
//!
//! Layering: [`bio`] caches fixed-size blocks behind a vnode+block-number
//! key; [`dehtable`] indexes directory entries by name within one
//! directory's data; [`fs_queue`] is the byte/packet ring shared by
//! [`pty`] and ordinary pipes.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

pub mod bio;
pub mod dehtable;
pub mod fs_queue;
pub mod pty;

pub use bio::{BufId, BufStatus, VnodeId};
pub use dehtable::Dehtable;
pub use fs_queue::{QFlags, Queue, QueueId};
pub use pty::{PtyId, Side};
