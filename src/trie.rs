//! The trie itself: insert, delete, and lookup with copy-on-write descent.
//!
//! A [`Qp`] is the single-writer view of one trie: the root ref, the chunk
//! directory and its usage metadata, the bump allocator state, and the
//! occupancy counters the garbage collector steers by. Standalone tries own
//! one directly; concurrent tries keep one as the writer half of a
//! [`QpMulti`](crate::QpMulti).
//!
//! Lookups never mutate. Modification descends twice: once read-only to find
//! the leaf sharing the longest prefix with the new key, and once with
//! copy-on-write, evacuating frozen twig vectors into the bump chunk along
//! the path so the final splice happens in mutable cells only.

use std::ffi::c_void;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use crate::alloc::{ChunkUsage, QpBase};
use crate::key::{QpKey, Shift};
use crate::node::{prefetch, Node, QpRef, Weight};
use crate::QpError;

/// The per-leaf method table supplied by the caller.
///
/// Leaves store an opaque pointer (`pval`, at least 4-byte aligned) and a
/// 32-bit integer (`ival`). The trie duplicates and destroys internal copies
/// of leaves as it rewrites paths, and tells the caller through
/// [`attach`](QpMethods::attach) / [`detach`](QpMethods::detach) so the
/// caller can refcount the object behind the pointer.
pub trait QpMethods: Send + Sync {
    /// A new internal reference to the leaf exists.
    fn attach(&self, pval: *mut c_void, ival: u32);

    /// An internal reference to the leaf is gone.
    fn detach(&self, pval: *mut c_void, ival: u32);

    /// Produce the canonical key for an existing leaf. Used during descent
    /// to compare a search key with the leaf it lands on.
    fn leaf_key(&self, pval: *mut c_void, ival: u32, key: &mut QpKey);

    /// Name of this trie in diagnostic logs.
    fn trie_name(&self) -> &str {
        "qp"
    }
}

/// Transaction mode, driving allocator behavior across open/commit.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum TxMode {
    None,
    Write,
    Update,
}

/// Single-writer trie state.
pub struct Qp {
    pub(crate) methods: Arc<dyn QpMethods>,
    pub(crate) base: Arc<QpBase>,
    pub(crate) usage: Vec<ChunkUsage>,
    /// Chunk currently bump-allocated from.
    pub(crate) bump: u32,
    /// Cells of the bump chunk below this index are frozen carryover from an
    /// earlier commit.
    pub(crate) fender: u32,
    pub(crate) root_ref: QpRef,
    pub(crate) leaf_count: u32,
    pub(crate) used_count: u32,
    pub(crate) free_count: u32,
    pub(crate) hold_count: u32,
    pub(crate) mode: TxMode,
    pub(crate) compact_all: bool,
}

impl Qp {
    /// Create an empty standalone trie.
    pub fn new(methods: Arc<dyn QpMethods>) -> Self {
        let mut qp = Qp::unallocated(methods);
        qp.alloc_reset();
        qp
    }

    /// Trie state with no bump chunk yet; the first transaction allocates
    /// one. Keeps a freshly created concurrent trie from wasting a chunk
    /// that the first `write` or `update` would immediately replace.
    pub(crate) fn unallocated(methods: Arc<dyn QpMethods>) -> Self {
        Qp {
            methods,
            base: Arc::new(QpBase::with_slots(0)),
            usage: Vec::new(),
            bump: 0,
            fender: 0,
            root_ref: QpRef::INVALID,
            leaf_count: 0,
            used_count: 0,
            free_count: 0,
            hold_count: 0,
            mode: TxMode::None,
            compact_all: false,
        }
    }

    /// Number of leaves in the trie.
    pub fn len(&self) -> usize {
        self.leaf_count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.leaf_count == 0
    }

    pub(crate) fn leaf_key(&self, n: Node) -> QpKey {
        let mut key = QpKey::default();
        self.methods.leaf_key(n.pval(), n.ival(), &mut key);
        key
    }

    pub(crate) fn read_view(&self) -> ReadView<'_> {
        ReadView {
            ptrs: self.base.ptrs(),
            root_ref: self.root_ref,
            methods: &*self.methods,
        }
    }

    /// Insert a leaf. Fails with [`QpError::Exists`] when a leaf with the
    /// same key is already present; the trie is unchanged in that case.
    pub fn insert(&mut self, pval: *mut c_void, ival: u32) -> Result<(), QpError> {
        let new_leaf = Node::leaf(pval, ival);
        let new_key = self.leaf_key(new_leaf);

        // first leaf in an empty trie
        if self.leaf_count == 0 {
            let r = self.alloc_twigs(1);
            self.set_node(r, new_leaf);
            self.attach_leaf(new_leaf);
            self.leaf_count = 1;
            self.root_ref = r;
            return Ok(());
        }

        // Find any leaf under the common prefix, without mutating. Taking
        // twig 0 when our shift is absent is fine: every leaf below this
        // branch agrees with the search key up to the branch's offset, and
        // indexing by an unset bit could run past the twig vector.
        let mut n = self.node(self.root_ref);
        while n.is_branch() {
            prefetch(self.ref_ptr(n.twigs_ref()));
            let bit = n.keybit(&new_key);
            let pos = if n.has_twig(bit) { n.twig_pos(bit) } else { 0 };
            n = self.node(n.twigs_ref().at(pos));
        }

        let old_key = self.leaf_key(n);
        let offset = match new_key.first_diff(&old_key) {
            None => return Err(QpError::Exists),
            Some(offset) => offset,
        };
        let new_bit = new_key.bit(offset);
        let old_bit = old_key.bit(offset);

        // redescend copy-on-write to the insertion point
        let mut r = self.make_root_mutable();
        loop {
            let n = self.node(r);
            if !n.is_branch() || offset < n.key_offset() {
                self.insert_new_branch(r, new_leaf, offset, new_bit, old_bit);
                return Ok(());
            }
            if offset == n.key_offset() {
                self.insert_grow_branch(r, n, new_leaf, new_bit);
                return Ok(());
            }
            self.make_twigs_mutable(r);
            let n = self.node(r);
            let bit = n.keybit(&new_key);
            assert!(n.has_twig(bit), "corrupt trie: prefix leaf disagrees");
            r = n.twigs_ref().at(n.twig_pos(bit));
        }
    }

    /// The key diverges before this node: replace the node with a fresh
    /// 2-twig branch holding the displaced subtree and the new leaf.
    fn insert_new_branch(
        &mut self,
        r: QpRef,
        new_leaf: Node,
        offset: usize,
        new_bit: Shift,
        old_bit: Shift,
    ) {
        let twigs = self.alloc_twigs(2);
        let old_node = self.node(r);
        let bitmap = 1u64 << new_bit | 1u64 << old_bit;
        self.set_node(r, Node::branch(Node::branch_index(bitmap, offset), twigs));
        self.set_node(twigs.at((old_bit > new_bit) as Weight), old_node);
        self.set_node(twigs.at((new_bit > old_bit) as Weight), new_leaf);
        self.attach_leaf(new_leaf);
        self.leaf_count += 1;
    }

    /// The key diverges exactly at this branch: widen it by one twig.
    fn insert_grow_branch(&mut self, r: QpRef, n: Node, new_leaf: Node, new_bit: Shift) {
        assert!(!n.has_twig(new_bit), "corrupt trie: diverging bit present");

        let old_size = n.twigs_size();
        let new_size = old_size + 1;
        let old_ref = n.twigs_ref();
        let new_ref = self.alloc_twigs(new_size);

        let widened = Node::branch(n.index() | 1u64 << new_bit, new_ref);
        self.set_node(r, widened);

        let pos = widened.twig_pos(new_bit);
        self.copy_twigs(new_ref, old_ref, pos);
        self.set_node(new_ref.at(pos), new_leaf);
        if pos < old_size {
            self.copy_twigs(new_ref.at(pos + 1), old_ref.at(pos), old_size - pos);
        }

        if self.squash_twigs(old_ref, old_size) {
            // old twigs destroyed, only the new leaf needs a reference
            self.attach_leaf(new_leaf);
        } else {
            // old twigs duplicated, reference every leaf in the copy
            self.attach_twigs(new_ref, new_size);
        }
        self.leaf_count += 1;
    }

    /// Delete the leaf whose key equals `key`.
    pub fn delete_by_key(&mut self, key: &QpKey) -> Result<(), QpError> {
        if !self.root_ref.is_valid() {
            return Err(QpError::NotFound);
        }

        let mut parent: Option<(QpRef, Shift)> = None;
        let mut r = self.make_root_mutable();
        loop {
            let n = self.node(r);
            if !n.is_branch() {
                break;
            }
            prefetch(self.ref_ptr(n.twigs_ref()));
            let bit = n.keybit(key);
            if !n.has_twig(bit) {
                return Err(QpError::NotFound);
            }
            self.make_twigs_mutable(r);
            let n = self.node(r);
            parent = Some((r, bit));
            r = n.twigs_ref().at(n.twig_pos(bit));
        }

        let leaf = self.node(r);
        if key.first_diff(&self.leaf_key(leaf)).is_some() {
            return Err(QpError::NotFound);
        }
        self.detach_leaf(leaf);
        self.leaf_count -= 1;

        // trie becomes empty
        if self.leaf_count == 0 {
            debug_assert!(parent.is_none());
            let root = self.root_ref;
            self.free_twigs(root, 1);
            self.root_ref = QpRef::INVALID;
            return Ok(());
        }

        let (pr, bit) = parent.expect("non-root leaf has a parent branch");
        let pn = self.node(pr);
        let size = pn.twigs_size();
        let pos = pn.twig_pos(bit);
        let twigs = pn.twigs_ref();

        if size == 2 {
            // collapse: the surviving twig replaces the parent branch
            let survivor = self.node(twigs.at(1 - pos));
            self.set_node(pr, survivor);
            self.squash_twigs(twigs, 2);
        } else {
            // shrink in place to avoid churning the bump chunk; the
            // compactor mops up the stale trailing cell's chunk later
            let narrowed = pn.index() & !(1u64 << bit);
            self.set_node(pr, Node::branch(narrowed, twigs));
            for i in pos..size - 1 {
                let next = self.node(twigs.at(i + 1));
                self.set_node(twigs.at(i), next);
            }
            self.squash_twigs(twigs.at(size - 1), 1);
        }
        Ok(())
    }

    /// Delete by name; convenience over [`delete_by_key`](Qp::delete_by_key).
    pub fn delete_by_name(&mut self, name: &crate::Name) -> Result<(), QpError> {
        self.delete_by_key(&QpKey::from_name(name))
    }

    /// Look up the leaf whose key equals `key`.
    pub fn get_by_key(&self, key: &QpKey) -> Result<(*mut c_void, u32), QpError> {
        self.read_view().get(key)
    }

    /// Look up by name.
    pub fn get_by_name(&self, name: &crate::Name) -> Result<(*mut c_void, u32), QpError> {
        self.get_by_key(&QpKey::from_name(name))
    }

    /// Check the occupancy counters against the per-chunk usage records.
    #[cfg(test)]
    pub(crate) fn check_counters(&self) {
        assert!(self.free_count <= self.used_count);
        assert!(self.hold_count <= self.free_count);
        let live = |f: fn(&ChunkUsage) -> u32| -> u32 {
            self.usage
                .iter()
                .filter(|u| u.exists && u.phase == 0)
                .map(f)
                .sum()
        };
        assert_eq!(live(|u| u.used), self.used_count);
        assert_eq!(live(|u| u.free), self.free_count);
    }

    /// Leaves in depth-first twig order, for order-sensitive tests.
    #[cfg(test)]
    pub(crate) fn leaves_in_order(&self) -> Vec<(*mut c_void, u32)> {
        fn walk(qp: &Qp, r: QpRef, out: &mut Vec<(*mut c_void, u32)>) {
            let n = qp.node(r);
            if n.is_branch() {
                for pos in 0..n.twigs_size() {
                    walk(qp, n.twigs_ref().at(pos), out);
                }
            } else {
                out.push((n.pval(), n.ival()));
            }
        }
        let mut out = Vec::new();
        if self.root_ref.is_valid() {
            walk(self, self.root_ref, &mut out);
        }
        out
    }
}

impl Drop for Qp {
    fn drop(&mut self) {
        self.destroy_guts();
    }
}

/// A read-only traversal context: directory pointers, a root, and the leaf
/// methods. Built from the writer, a published anchor, or a snapshot.
pub(crate) struct ReadView<'a> {
    pub(crate) ptrs: &'a [AtomicPtr<Node>],
    pub(crate) root_ref: QpRef,
    pub(crate) methods: &'a dyn QpMethods,
}

impl ReadView<'_> {
    #[inline]
    fn node_ptr(&self, r: QpRef) -> *const Node {
        let chunk = self.ptrs[r.chunk() as usize].load(Ordering::Relaxed);
        debug_assert!(!chunk.is_null());
        // SAFETY: refs reachable from this view's root point into chunks
        // that stay allocated for the life of the view.
        unsafe { chunk.add(r.cell() as usize) }
    }

    #[inline]
    fn node(&self, r: QpRef) -> Node {
        // SAFETY: see node_ptr; committed cells are never written.
        unsafe { *self.node_ptr(r) }
    }

    pub(crate) fn get(&self, key: &QpKey) -> Result<(*mut c_void, u32), QpError> {
        if !self.root_ref.is_valid() {
            return Err(QpError::NotFound);
        }
        let mut n = self.node(self.root_ref);
        while n.is_branch() {
            prefetch(self.node_ptr(n.twigs_ref()));
            let bit = n.keybit(key);
            if !n.has_twig(bit) {
                return Err(QpError::NotFound);
            }
            n = self.node(n.twigs_ref().at(n.twig_pos(bit)));
        }
        let mut found = QpKey::default();
        self.methods.leaf_key(n.pval(), n.ival(), &mut found);
        if key.first_diff(&found).is_some() {
            return Err(QpError::NotFound);
        }
        Ok((n.pval(), n.ival()))
    }
}
