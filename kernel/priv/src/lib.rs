//! Effective/bounding capability bitmaps, credential inheritance, and the
//! `securelevel` gate.
//!
//! A credential ([`cred::Cred`]) carries real/effective/saved UID and GID
//! plus a supplementary-group list and two capability bitmaps of
//! [`cred::PRIV_MENT`] bits each: an **effective** set consulted by
//! [`cred::Cred::check`] and a **bounding** set that caps what
//! [`cred::Cred::eff_set`] may ever grant. Fork inherits both maps then
//! intersects the child's effective set with its own bounding set
//! (§4.9); exec runs credential init before any loader capability
//! adjustment.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

pub mod cred;
pub mod list;
pub mod securelevel;
