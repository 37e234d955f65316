//! # dnsqp
//!
//! A qp-trie (quadbit popcount trie) keyed by DNS names, with concurrent
//! multi-reader / single-writer access via copy-on-write transactions.
//!
//! ## Features
//!
//! - **DNS-native keys**: names convert to keys whose lexicographic order is
//!   DNS canonical order; lookups are case-insensitive and absolute and
//!   relative names coexist without colliding.
//! - **Compact nodes**: 12-byte cells addressed by `(chunk, cell)` indices,
//!   bump-allocated from fixed-size chunks and defragmented by a compacting
//!   garbage collector.
//! - **Wait-free readers**: a committed version is one atomic pointer; query
//!   readers take no locks and no refcounts, protected by quiescent-state
//!   based reclamation ([`Qsbr`]).
//! - **Transactions**: light writes, heavy updates with rollback, and pinned
//!   [`snapshots`](QpMulti::snapshot) for long-lived readers.
//!
//! ## Example
//!
//! ```rust
//! use std::ffi::c_void;
//! use std::sync::Arc;
//! use dnsqp::{Name, Qp, QpKey, QpMethods};
//!
//! // Leaves point at caller-owned objects; this example just leaks names
//! // and skips reference counting.
//! struct Zones;
//!
//! impl QpMethods for Zones {
//!     fn attach(&self, _pval: *mut c_void, _ival: u32) {}
//!     fn detach(&self, _pval: *mut c_void, _ival: u32) {}
//!     fn leaf_key(&self, pval: *mut c_void, _ival: u32, key: &mut QpKey) {
//!         // SAFETY: every leaf in this trie points at a leaked Name.
//!         let name = unsafe { &*(pval as *const Name) };
//!         *key = QpKey::from_name(name);
//!     }
//! }
//!
//! let mut trie = Qp::new(Arc::new(Zones));
//! let name = Box::leak(Box::new(Name::from_text("www.example.").unwrap()));
//! trie.insert(name as *mut Name as *mut c_void, 0).unwrap();
//!
//! let lookup = Name::from_text("WWW.Example.").unwrap();
//! assert!(trie.get_by_name(&lookup).is_ok());
//! ```

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::all)]

pub mod name;

mod alloc;
mod gc;
mod key;
mod multi;
mod node;
mod qsbr;
mod trie;

pub use gc::{gc_time, GcMode, GcTime, MemUsage};
pub use key::{QpKey, QP_KEY_MAX};
pub use multi::{QpMulti, QpRead, QpSnap, QpTxn};
pub use name::{Name, NameError};
pub use qsbr::{Phase, Qsbr, QsbrThread};
pub use trie::{Qp, QpMethods};

use thiserror::Error;

/// Errors surfaced to callers. Everything else (allocation failure, a
/// corrupt node, a misused transaction) is an invariant violation and
/// panics, because recovery from those is ill-defined in a low-level
/// primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QpError {
    /// Insert found an equal key already present.
    #[error("an equal key is already present")]
    Exists,
    /// Lookup or delete found no leaf with the given key.
    #[error("key not found")]
    NotFound,
}

#[cfg(test)]
pub(crate) mod testing;

#[cfg(test)]
mod proptests;
