//! Garbage collection: compaction, chunk recycling, and deferred
//! reclamation.
//!
//! Freeing twigs only bumps counters, so deleted and copied-over cells
//! accumulate as garbage. The compactor walks the trie bottom-up and
//! evacuates twig vectors out of fragmented chunks into the bump chunk; the
//! recycler then frees mutable chunks that ended up empty. Empty immutable
//! chunks cannot be freed inline while readers may still be traversing them,
//! so they are stamped with a reclamation phase and handed to the QSBR
//! machinery by the transaction layer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use crate::alloc::{chunk_free_raw, ChunkUsage};
use crate::multi::SnapShared;
use crate::node::{
    reader_base, reader_valid, Chunk, Node, QpRef, Weight, LEAF_TAG, QP_CHUNK_SIZE,
};
use crate::qsbr::Phase;
use crate::trie::Qp;

/// A chunk below this live-cell count is worth evacuating.
pub(crate) const QP_MIN_USED: u32 = QP_CHUNK_SIZE / 4;

/// Free cells tolerated in the bump chunk before compaction abandons it for
/// a fresh one.
pub(crate) const QP_MAX_FREE: u32 = QP_CHUNK_SIZE / 4;

/// Floor for the auto-GC garbage threshold, so small tries are not
/// compacted incessantly.
const QP_MIN_SLACK: u32 = QP_CHUNK_SIZE / 4;

static COMPACT_TIME: AtomicU64 = AtomicU64::new(0);
static RECYCLE_TIME: AtomicU64 = AtomicU64::new(0);
static ROLLBACK_TIME: AtomicU64 = AtomicU64::new(0);

/// Cumulative nanoseconds spent in garbage collection, process-wide.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcTime {
    pub compact: u64,
    pub recycle: u64,
    pub rollback: u64,
}

/// Read the garbage collector's cumulative timers.
pub fn gc_time() -> GcTime {
    GcTime {
        compact: COMPACT_TIME.load(Ordering::Relaxed),
        recycle: RECYCLE_TIME.load(Ordering::Relaxed),
        rollback: ROLLBACK_TIME.load(Ordering::Relaxed),
    }
}

pub(crate) fn add_compact_time(ns: u64) {
    COMPACT_TIME.fetch_add(ns, Ordering::Relaxed);
}

pub(crate) fn add_recycle_time(ns: u64) {
    RECYCLE_TIME.fetch_add(ns, Ordering::Relaxed);
}

pub(crate) fn add_rollback_time(ns: u64) {
    ROLLBACK_TIME.fetch_add(ns, Ordering::Relaxed);
}

/// When to run the compactor.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum GcMode {
    /// Only if enough garbage has accumulated.
    Maybe,
    /// Unconditionally, evacuating every twig vector.
    All,
}

impl Qp {
    /// Garbage destroyed in this transaction has passed the threshold worth
    /// compacting for. Free space in chunks sealed by earlier commits
    /// (`hold_count`) is excluded: compaction cannot recover it until the
    /// readers are gone.
    pub(crate) fn autogc(&self) -> bool {
        self.free_count - self.hold_count > (self.used_count / 8).max(QP_MIN_SLACK)
    }

    /// Enough garbage overall that a maybe-compaction should go ahead.
    pub(crate) fn needgc(&self) -> bool {
        self.free_count > QP_CHUNK_SIZE
    }

    /// Free some twigs, and if they were destroyed immediately (so the
    /// garbage accounting moved), run the auto garbage collector.
    ///
    /// Callers satisfy `free_twigs`'s attach/detach requirement by having
    /// made the twigs mutable first.
    pub(crate) fn squash_twigs(&mut self, twigs: QpRef, size: Weight) -> bool {
        let destroyed = self.free_twigs(twigs, size);
        if destroyed && self.autogc() {
            self.run_compact();
            self.recycle();
            if self.autogc() {
                // recoverable, but the collector should not be this
                // ineffective twice in a row
                warn!(
                    trie = self.methods.trie_name(),
                    "compact/recycle recovered no space, scheduling a full compaction"
                );
                self.compact_all = true;
            }
        }
        destroyed
    }

    /// Compact the subtree under `parent`, copying bottom-up as needed, and
    /// return the (possibly moved) location of its twigs.
    ///
    /// Only the occupancy check introduces ref changes; they bubble up
    /// through the child-patching loop, which evacuates a frozen parent
    /// vector before patching it. If nothing below moved, the trie is left
    /// untouched.
    fn compact_recursive(&mut self, parent: Node) -> QpRef {
        let size = parent.twigs_size();
        let mut twigs = parent.twigs_ref();
        let chunk = twigs.chunk();
        if self.compact_all || (chunk != self.bump && self.chunk_live(chunk) < QP_MIN_USED) {
            twigs = self.evacuate(parent);
        }
        let mut immutable = self.cells_immutable(twigs);
        for pos in 0..size {
            let child = self.node(twigs.at(pos));
            if !child.is_branch() {
                continue;
            }
            let old_grandtwigs = child.twigs_ref();
            let new_grandtwigs = self.compact_recursive(child);
            if old_grandtwigs == new_grandtwigs {
                continue;
            }
            if immutable {
                twigs = self.evacuate(Node::branch(parent.index(), twigs));
                immutable = false;
            }
            let child = self.node(twigs.at(pos));
            self.set_node(twigs.at(pos), Node::branch(child.index(), new_grandtwigs));
        }
        twigs
    }

    pub(crate) fn run_compact(&mut self) {
        debug!(
            leaf = self.leaf_count,
            live = self.used_count - self.free_count,
            used = self.used_count,
            free = self.free_count,
            hold = self.hold_count,
            "qp compact start"
        );
        let start = Instant::now();

        if self.usage[self.bump as usize].free > QP_MAX_FREE {
            self.alloc_reset();
        }
        if self.leaf_count > 0 {
            let root = self.movable_root();
            self.root_ref = self.compact_recursive(root);
        }
        self.compact_all = false;

        add_compact_time(start.elapsed().as_nanos() as u64);
        debug!(
            leaf = self.leaf_count,
            live = self.used_count - self.free_count,
            used = self.used_count,
            free = self.free_count,
            hold = self.hold_count,
            "qp compact done"
        );
    }

    /// Compact the trie, then free any chunks that emptied out.
    pub fn compact(&mut self, mode: GcMode) {
        if mode == GcMode::Maybe && !self.needgc() {
            return;
        }
        if mode == GcMode::All {
            self.compact_all = true;
        }
        self.run_compact();
        self.recycle();
    }

    /// Remove an empty chunk's cells from the totals, unless that already
    /// happened when it was queued for deferred reclamation.
    fn chunk_discount(&mut self, chunk: Chunk) {
        let u = self.usage[chunk as usize];
        if u.phase == 0 {
            assert!(self.used_count >= u.used);
            assert!(self.free_count >= u.free);
            self.used_count -= u.used;
            self.free_count -= u.free;
        }
    }

    /// Free a chunk's storage. Any leaves still recorded in it are stale
    /// copies holding a reference, which is dropped here; reader anchors
    /// likewise drop their directory reference.
    pub(crate) fn chunk_free(&mut self, chunk: Chunk) {
        let used = self.usage[chunk as usize].used;
        let ptr = self.base.get(chunk);
        debug_assert!(!ptr.is_null());
        for cell in 0..used {
            // SAFETY: cells below the high-water mark are initialized and
            // the storage is still live.
            let n = unsafe { *ptr.add(cell as usize) };
            if n.tag() == LEAF_TAG && !n.pval().is_null() {
                self.detach_leaf(n);
            } else if cell + 1 < used && reader_valid(n) {
                // SAFETY: a valid anchor is followed by its pointer cell.
                let base = reader_base(unsafe { *ptr.add(cell as usize + 1) });
                // paired with the refcount the commit took
                // SAFETY: the anchor holds a leaked Arc reference.
                drop(unsafe { Arc::from_raw(base) });
            }
        }
        self.chunk_discount(chunk);
        // SAFETY: the pointer and capacity match this chunk's allocation,
        // and the directory slot is cleared so nothing dangles.
        unsafe { chunk_free_raw(ptr, self.usage[chunk as usize].capacity) };
        self.base.set(chunk, std::ptr::null_mut());
        self.usage[chunk as usize] = ChunkUsage::default();
    }

    /// Free every mutable, empty, non-bump chunk.
    pub(crate) fn recycle(&mut self) {
        let start = Instant::now();
        let mut freed = 0;

        for chunk in 0..self.chunk_max() {
            let u = self.usage[chunk as usize];
            if chunk != self.bump && u.exists && !u.immutable && self.chunk_live(chunk) == 0 {
                self.chunk_free(chunk);
                freed += 1;
            }
        }

        add_recycle_time(start.elapsed().as_nanos() as u64);
        if freed > 0 {
            debug!(
                freed,
                leaf = self.leaf_count,
                live = self.used_count - self.free_count,
                used = self.used_count,
                free = self.free_count,
                hold = self.hold_count,
                "qp recycle"
            );
        }
    }

    /// Stamp empty immutable chunks with `phase` so they can be freed once
    /// the matching grace period has elapsed. Their cells leave the totals
    /// now. Returns true when anything was stamped.
    pub(crate) fn defer_chunk_reclamation(&mut self, phase: Phase) -> bool {
        let mut deferred = 0;
        for chunk in 0..self.chunk_max() {
            let u = self.usage[chunk as usize];
            if chunk != self.bump
                && u.exists
                && u.immutable
                && u.phase == 0
                && self.chunk_live(chunk) == 0
            {
                self.chunk_discount(chunk);
                self.usage[chunk as usize].phase = phase;
                deferred += 1;
            }
        }
        if deferred > 0 {
            debug!(deferred, phase, "qp will reclaim chunks after grace period");
        }
        deferred > 0
    }

    /// Free chunks whose grace period has elapsed. Chunks pinned by a
    /// snapshot are flagged instead and freed by the mark-sweep when their
    /// last snapshot goes. Returns true when chunks of a later phase remain,
    /// so the caller re-arms for the next grace period.
    pub(crate) fn reclaim_chunks(&mut self, drained: Phase) -> bool {
        let start = Instant::now();
        let mut freed = 0;
        let mut more = false;

        for chunk in 0..self.chunk_max() {
            let u = self.usage[chunk as usize];
            if u.phase == 0 {
                continue;
            }
            if u.phase <= drained {
                if u.snapshot {
                    self.usage[chunk as usize].snapfree = true;
                } else {
                    self.chunk_free(chunk);
                    freed += 1;
                }
            } else {
                more = true;
            }
        }

        add_recycle_time(start.elapsed().as_nanos() as u64);
        if freed > 0 {
            debug!(
                freed,
                drained,
                leaf = self.leaf_count,
                live = self.used_count - self.free_count,
                used = self.used_count,
                free = self.free_count,
                hold = self.hold_count,
                "qp reclaim"
            );
        }
        more
    }

    /// Free every chunk still standing. Used by teardown paths; the counters
    /// must net out to zero afterwards.
    pub(crate) fn destroy_guts(&mut self) {
        if self.usage.is_empty() {
            return;
        }
        for chunk in 0..self.chunk_max() {
            if !self.base.get(chunk).is_null() {
                self.chunk_free(chunk);
            }
        }
        debug_assert_eq!(self.used_count, 0);
        debug_assert_eq!(self.free_count, 0);
    }

    /// Memory accounting for diagnostics and tests.
    pub fn mem_usage(&self) -> MemUsage {
        let mut chunk_count = 0;
        let mut cell_bytes = 0;
        for chunk in 0..self.chunk_max() {
            let u = self.usage[chunk as usize];
            if !self.base.get(chunk).is_null() {
                chunk_count += 1;
                cell_bytes += u.capacity as usize * std::mem::size_of::<Node>();
            }
        }
        let slot_bytes = self.usage.len()
            * (std::mem::size_of::<ChunkUsage>() + std::mem::size_of::<*mut Node>());
        MemUsage {
            leaves: self.leaf_count,
            live: self.used_count - self.free_count,
            used: self.used_count,
            free: self.free_count,
            hold: self.hold_count,
            node_size: std::mem::size_of::<Node>(),
            chunk_size: QP_CHUNK_SIZE,
            chunk_count,
            bytes: cell_bytes + slot_bytes,
            fragmented: self.needgc(),
        }
    }
}

/// Snapshot mark-sweep: recompute which chunks are pinned by the extant
/// snapshots, then free any chunk whose reclamation fired while it was
/// pinned and whose last snapshot is now gone.
pub(crate) fn marksweep_chunks(qp: &mut Qp, snapshots: &[Arc<SnapShared>]) {
    let start = Instant::now();
    let mut freed = 0;

    for snap in snapshots {
        for chunk in 0..snap.chunks().min(qp.chunk_max()) {
            if !snap.chunk_ptr(chunk).is_null() {
                qp.usage[chunk as usize].snapmark = true;
            }
        }
    }
    for chunk in 0..qp.chunk_max() {
        let u = &mut qp.usage[chunk as usize];
        u.snapshot = u.snapmark;
        u.snapmark = false;
        if u.snapfree && !u.snapshot {
            qp.chunk_free(chunk);
            freed += 1;
        }
    }

    add_recycle_time(start.elapsed().as_nanos() as u64);
    if freed > 0 {
        debug!(
            freed,
            leaf = qp.leaf_count,
            live = qp.used_count - qp.free_count,
            used = qp.used_count,
            free = qp.free_count,
            hold = qp.hold_count,
            "qp snapshot marksweep"
        );
    }
}

/// Snapshot of the allocator's occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemUsage {
    /// Leaves in the trie.
    pub leaves: u32,
    /// Cells in use and not freed.
    pub live: u32,
    /// Cells allocated, the high-water total.
    pub used: u32,
    /// Cells freed below the high-water marks.
    pub free: u32,
    /// Freed cells pinned in immutable chunks.
    pub hold: u32,
    /// Bytes per cell.
    pub node_size: usize,
    /// Cells per chunk.
    pub chunk_size: u32,
    /// Chunks with live storage.
    pub chunk_count: usize,
    /// Approximate bytes held, cells plus bookkeeping arrays.
    pub bytes: usize,
    /// Whether a maybe-compaction would run.
    pub fragmented: bool,
}
