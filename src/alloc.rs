//! Chunk-based bump allocation.
//!
//! Trie cells live in fixed-size chunks addressed through a chunk directory.
//! New twig vectors are bump-allocated from a single mutable "bump" chunk;
//! freeing only adjusts per-chunk counters, and fragmentation is repaired by
//! the compactor. The directory is shared with readers that captured it at
//! commit time, so it is refcounted (an [`Arc`]) and replaced rather than
//! resized whenever it is shared.
//!
//! Mutability is a property of a cell's position: cells in an `immutable`
//! chunk are frozen, and so are cells of the bump chunk below `fender`
//! (carryover sealed by an earlier commit). Everything else may be rewritten
//! in place by the writer.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use crate::node::{CellIx, Chunk, Node, QpRef, Weight, LEAF_TAG, QP_CHUNK_SIZE};
use crate::qsbr::Phase;
use crate::trie::Qp;

/// Directory growth: double, starting from two slots.
fn grown_slots(slots: usize) -> usize {
    (slots * 2).max(2)
}

/// The chunk directory: one pointer slot per chunk number.
///
/// Slots are atomics because the writer installs and clears pointers while
/// readers of earlier commits still traverse their own chunks through the
/// same directory object. Readers never follow a slot the writer touches
/// (their chunks are frozen until reclaimed), so relaxed ordering suffices;
/// publication order is carried by the anchor-pointer release store.
pub(crate) struct QpBase {
    ptr: Box<[AtomicPtr<Node>]>,
}

impl QpBase {
    pub(crate) fn with_slots(slots: usize) -> Self {
        QpBase {
            ptr: (0..slots).map(|_| AtomicPtr::new(ptr::null_mut())).collect(),
        }
    }

    pub(crate) fn ptrs(&self) -> &[AtomicPtr<Node>] {
        &self.ptr
    }

    #[inline]
    pub(crate) fn get(&self, chunk: Chunk) -> *mut Node {
        self.ptr[chunk as usize].load(Ordering::Relaxed)
    }

    pub(crate) fn set(&self, chunk: Chunk, p: *mut Node) {
        self.ptr[chunk as usize].store(p, Ordering::Relaxed);
    }

    /// A copy of this directory with room for `slots` chunks.
    fn cloned_with_slots(&self, slots: usize) -> Self {
        let grown = QpBase::with_slots(slots);
        for (i, slot) in self.ptr.iter().enumerate() {
            grown.ptr[i].store(slot.load(Ordering::Relaxed), Ordering::Relaxed);
        }
        grown
    }

    /// Extend in place; only sound while no reader shares the directory.
    fn grow_in_place(&mut self, slots: usize) {
        let mut grown: Vec<AtomicPtr<Node>> = std::mem::take(&mut self.ptr).into_vec();
        grown.resize_with(slots, || AtomicPtr::new(ptr::null_mut()));
        self.ptr = grown.into_boxed_slice();
    }
}

/// Per-chunk bookkeeping, parallel to the directory and private to the
/// writer.
#[derive(Clone, Copy, Default, Debug)]
pub(crate) struct ChunkUsage {
    /// High-water mark of allocated cells.
    pub(crate) used: CellIx,
    /// Cells freed below `used`.
    pub(crate) free: CellIx,
    /// Cells of raw storage backing the chunk (less than [`QP_CHUNK_SIZE`]
    /// after a commit shrank it).
    pub(crate) capacity: CellIx,
    /// Reclamation phase this chunk was queued under, 0 if none.
    pub(crate) phase: Phase,
    pub(crate) exists: bool,
    pub(crate) immutable: bool,
    /// Referenced by at least one extant snapshot.
    pub(crate) snapshot: bool,
    /// Mark bit for the snapshot mark-sweep.
    pub(crate) snapmark: bool,
    /// Reclamation fired while `snapshot` was set; free on the next sweep
    /// that clears it.
    pub(crate) snapfree: bool,
}

fn cells_layout(cells: CellIx) -> Layout {
    Layout::array::<Node>(cells as usize).expect("chunk layout")
}

fn chunk_get_raw() -> *mut Node {
    // SAFETY: the layout is non-zero sized.
    let p = unsafe { alloc_zeroed(cells_layout(QP_CHUNK_SIZE)) };
    assert!(!p.is_null(), "chunk allocation failed");
    p as *mut Node
}

/// # Safety
/// `p` must have been returned by [`chunk_get_raw`] or [`chunk_shrink_raw`]
/// with a matching `cells` count, and must not be used afterwards.
pub(crate) unsafe fn chunk_free_raw(p: *mut Node, cells: CellIx) {
    // SAFETY: per contract.
    unsafe { dealloc(p as *mut u8, cells_layout(cells)) }
}

/// Reallocate a chunk down to `new_cells`, returning the (possibly moved)
/// storage.
///
/// # Safety
/// Same contract as [`chunk_free_raw`], and no reader may hold pointers into
/// the chunk (it was allocated in the current transaction).
unsafe fn chunk_shrink_raw(p: *mut Node, old_cells: CellIx, new_cells: CellIx) -> *mut Node {
    debug_assert!(0 < new_cells && new_cells <= old_cells);
    // SAFETY: the new layout is non-zero sized; the copy stays within both
    // allocations; the old storage is released unused.
    unsafe {
        let fresh = alloc_zeroed(cells_layout(new_cells)) as *mut Node;
        assert!(!fresh.is_null(), "chunk reallocation failed");
        ptr::copy_nonoverlapping(p, fresh, new_cells as usize);
        chunk_free_raw(p, old_cells);
        fresh
    }
}

impl Qp {
    /// Is the cell at `r` frozen? Cells in immutable chunks are; so is the
    /// immutable prefix of the bump chunk below `fender`.
    #[inline]
    pub(crate) fn cells_immutable(&self, r: QpRef) -> bool {
        debug_assert!(r.is_valid());
        if r.chunk() == self.bump {
            r.cell() < self.fender
        } else {
            self.usage[r.chunk() as usize].immutable
        }
    }

    /// Raw pointer to the cell at `r`.
    #[inline]
    pub(crate) fn ref_ptr(&self, r: QpRef) -> *mut Node {
        debug_assert!(self.usage[r.chunk() as usize].exists);
        debug_assert!(r.cell() < self.usage[r.chunk() as usize].used);
        // SAFETY: existing chunks have live storage covering `used` cells.
        unsafe { self.base.get(r.chunk()).add(r.cell() as usize) }
    }

    #[inline]
    pub(crate) fn node(&self, r: QpRef) -> Node {
        // SAFETY: ref_ptr points into live chunk storage.
        unsafe { *self.ref_ptr(r) }
    }

    /// Overwrite the cell at `r`. The caller is responsible for only writing
    /// to mutable cells.
    #[inline]
    pub(crate) fn set_node(&mut self, r: QpRef, n: Node) {
        // SAFETY: ref_ptr points into live chunk storage owned by the writer.
        unsafe { *self.ref_ptr(r) = n }
    }

    pub(crate) fn copy_twigs(&mut self, dst: QpRef, src: QpRef, size: Weight) {
        if size == 0 {
            return;
        }
        // SAFETY: both ranges lie within live chunks, and freshly allocated
        // destination cells never overlap previously allocated sources.
        unsafe {
            ptr::copy_nonoverlapping(self.ref_ptr(src), self.ref_ptr(dst), size as usize);
        }
    }

    fn zero_twigs(&mut self, r: QpRef, size: Weight) {
        // SAFETY: the range lies within a live chunk.
        unsafe { ptr::write_bytes(self.ref_ptr(r), 0, size as usize) }
    }

    pub(crate) fn attach_leaf(&self, n: Node) {
        self.methods.attach(n.pval(), n.ival());
    }

    pub(crate) fn detach_leaf(&self, n: Node) {
        self.methods.detach(n.pval(), n.ival());
    }

    /// Bump the external refcount of every leaf in a twig vector, after a
    /// copy that could not destroy the original.
    pub(crate) fn attach_twigs(&self, twigs: QpRef, size: Weight) {
        for pos in 0..size {
            let n = self.node(twigs.at(pos));
            if n.tag() == LEAF_TAG {
                self.attach_leaf(n);
            }
        }
    }

    pub(crate) fn chunk_max(&self) -> Chunk {
        self.usage.len() as Chunk
    }

    /// Live occupancy of a chunk.
    #[inline]
    pub(crate) fn chunk_live(&self, chunk: Chunk) -> CellIx {
        let u = &self.usage[chunk as usize];
        u.used - u.free
    }

    /// Install fresh storage in a free directory slot and make it the bump
    /// chunk, allocating `size` cells from it.
    fn chunk_alloc(&mut self, chunk: Chunk, size: Weight) -> QpRef {
        assert!(self.base.get(chunk).is_null());
        assert_eq!(self.usage[chunk as usize].used, 0);
        assert_eq!(self.usage[chunk as usize].free, 0);

        self.base.set(chunk, chunk_get_raw());
        self.usage[chunk as usize] = ChunkUsage {
            used: size,
            capacity: QP_CHUNK_SIZE,
            exists: true,
            ..ChunkUsage::default()
        };
        self.used_count += size;
        self.bump = chunk;
        self.fender = 0;
        QpRef::new(chunk, 0)
    }

    /// Grow the chunk directory. The usage array is exclusive to the writer
    /// and extends in place; the directory is cloned when any reader still
    /// holds the current one.
    fn grow_chunk_arrays(&mut self) {
        let slots = grown_slots(self.usage.len());
        self.usage.resize(slots, ChunkUsage::default());
        match Arc::get_mut(&mut self.base) {
            Some(base) => base.grow_in_place(slots),
            None => {
                let fresh = self.base.cloned_with_slots(slots);
                self.base = Arc::new(fresh);
            }
        }
        tracing::trace!(slots, "qp grew chunk directory");
    }

    /// No space in the bump chunk: find a free slot for a fresh one.
    fn alloc_slow(&mut self, size: Weight) -> QpRef {
        for chunk in 0..self.chunk_max() {
            if !self.usage[chunk as usize].exists {
                return self.chunk_alloc(chunk, size);
            }
        }
        let chunk = self.chunk_max();
        self.grow_chunk_arrays();
        self.chunk_alloc(chunk, size)
    }

    /// Start allocating from a fresh bump chunk.
    pub(crate) fn alloc_reset(&mut self) {
        let _ = self.alloc_slow(0);
    }

    /// Allocate `size` fresh cells; the bump-allocator fast path.
    pub(crate) fn alloc_twigs(&mut self, size: Weight) -> QpRef {
        let chunk = self.bump;
        let cell = self.usage[chunk as usize].used;
        if cell + size <= QP_CHUNK_SIZE {
            self.usage[chunk as usize].used += size;
            self.used_count += size;
            QpRef::new(chunk, cell)
        } else {
            self.alloc_slow(size)
        }
    }

    /// Record that `size` cells at `twigs` are no longer used. Mutable cells
    /// are zeroed immediately so a later sweep of their chunk cannot detach
    /// leaves twice; immutable cells are left intact for concurrent readers
    /// and only counted, to be reclaimed after a grace period.
    ///
    /// Returns true when the cells were destroyed immediately. The caller is
    /// responsible for attaching or detaching any leaves as required.
    pub(crate) fn free_twigs(&mut self, twigs: QpRef, size: Weight) -> bool {
        let chunk = twigs.chunk() as usize;
        self.free_count += size;
        self.usage[chunk].free += size;
        assert!(self.free_count <= self.used_count);
        assert!(self.usage[chunk].free <= self.usage[chunk].used);

        if self.cells_immutable(twigs) {
            self.hold_count += size;
            debug_assert!(self.hold_count <= self.free_count);
            false
        } else {
            self.zero_twigs(twigs, size);
            true
        }
    }

    /// Move a branch's twigs into the bump chunk, for copy-on-write or
    /// compaction, and return the new vector's ref. The node itself is not
    /// rewritten here; the caller patches it once it is known to be mutable.
    pub(crate) fn evacuate(&mut self, n: Node) -> QpRef {
        let size = n.twigs_size();
        let old = n.twigs_ref();
        let fresh = self.alloc_twigs(size);
        self.copy_twigs(fresh, old, size);
        if !self.free_twigs(old, size) {
            // duplicated rather than destroyed
            self.attach_twigs(fresh, size);
        }
        fresh
    }

    /// A pseudo-branch holding the root cell as its only twig, so the root
    /// can go through the same evacuation path as any twig vector.
    pub(crate) fn movable_root(&self) -> Node {
        Node::branch(
            Node::branch_index(1 << crate::key::SHIFT_NOBYTE, 0),
            self.root_ref,
        )
    }

    /// Evacuate the root cell if it is frozen; returns its (possibly new)
    /// location.
    pub(crate) fn make_root_mutable(&mut self) -> QpRef {
        if self.cells_immutable(self.root_ref) {
            self.root_ref = self.evacuate(self.movable_root());
        }
        self.root_ref
    }

    /// Evacuate the twig vector of the branch at `r` if it is frozen. The
    /// branch cell itself must already be mutable.
    pub(crate) fn make_twigs_mutable(&mut self, r: QpRef) {
        let n = self.node(r);
        if self.cells_immutable(n.twigs_ref()) {
            let fresh = self.evacuate(n);
            self.set_node(r, Node::branch(n.index(), fresh));
        }
    }

    /// Give back the bump chunk's unused tail after an update commit. Only
    /// called when the bump chunk was allocated in this transaction, so no
    /// reader can hold pointers into it.
    pub(crate) fn shrink_bump(&mut self) {
        let chunk = self.bump;
        let u = &mut self.usage[chunk as usize];
        if u.used == 0 || u.used == u.capacity {
            return;
        }
        // SAFETY: the old pointer came from the chunk allocator with
        // `capacity` cells and is replaced in the directory below.
        let fresh = unsafe { chunk_shrink_raw(self.base.get(chunk), u.capacity, u.used) };
        u.capacity = u.used;
        self.base.set(chunk, fresh);
    }
}
