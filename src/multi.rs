//! Concurrent tries: transactions, query readers, and snapshots.
//!
//! A [`QpMulti`] wraps one writer [`Qp`] behind a mutex and publishes
//! committed versions through a single atomic pointer. Readers come in two
//! kinds:
//!
//! - **Query readers** ([`QpRead`]) are free: one acquire load, no locks, no
//!   refcounts. They are safe because chunk memory they can observe is only
//!   reclaimed after a QSBR grace period.
//! - **Snapshots** ([`QpSnap`]) are explicit strong references that pin
//!   their chunks across any number of later commits, for long-lived jobs
//!   like zone transfers. They are accounted by a mark-sweep when destroyed.
//!
//! Write transactions are light: they keep bump-allocating where the last
//! one stopped. Update transactions are heavy: they can roll back, and their
//! commit compacts the trie and trims the bump chunk to size.

use std::ffi::c_void;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Instant;

use parking_lot::{Mutex, MutexGuard};
use tracing::debug;

use crate::alloc::{ChunkUsage, QpBase};
use crate::gc::{add_rollback_time, marksweep_chunks};
use crate::key::QpKey;
use crate::name::Name;
use crate::node::{
    reader_base, reader_nodes, reader_root, reader_valid, Chunk, Node, QpRef, READER_SIZE,
};
use crate::qsbr::{Phase, Qsbr, Reclaim};
use crate::trie::{Qp, QpMethods, ReadView, TxMode};
use crate::QpError;

/// A multi-version concurrent trie: one writer, many wait-free readers.
pub struct QpMulti {
    inner: Arc<MultiInner>,
}

pub(crate) struct MultiInner {
    methods: Arc<dyn QpMethods>,
    state: Mutex<WriterState>,
    /// The published anchor: two cells holding the committed root and chunk
    /// directory. Written with release by commit, read with acquire by
    /// readers, so a reader sees every write of the transaction it observes.
    reader: AtomicPtr<Node>,
    qsbr: Arc<Qsbr>,
}

struct WriterState {
    writer: Qp,
    rollback: Option<QpRollback>,
    /// Cells of the currently published anchor, freed on the next commit.
    reader_ref: QpRef,
    snapshots: Vec<Arc<SnapShared>>,
}

/// Everything the writer needs to forget a transaction: the whole allocator
/// state except the chunks themselves, which are shared with the live trie.
struct QpRollback {
    base: Arc<QpBase>,
    usage: Vec<ChunkUsage>,
    bump: u32,
    fender: u32,
    root_ref: QpRef,
    leaf_count: u32,
    used_count: u32,
    free_count: u32,
    hold_count: u32,
    mode: TxMode,
    compact_all: bool,
}

impl QpRollback {
    fn capture(qp: &Qp) -> Self {
        QpRollback {
            base: Arc::clone(&qp.base),
            usage: qp.usage.clone(),
            bump: qp.bump,
            fender: qp.fender,
            root_ref: qp.root_ref,
            leaf_count: qp.leaf_count,
            used_count: qp.used_count,
            free_count: qp.free_count,
            hold_count: qp.hold_count,
            mode: qp.mode,
            compact_all: qp.compact_all,
        }
    }

    /// Put the captured state back. Dropping the writer's current directory
    /// handle releases any directory grown during the transaction.
    fn restore(self, qp: &mut Qp) {
        qp.base = self.base;
        qp.usage = self.usage;
        qp.bump = self.bump;
        qp.fender = self.fender;
        qp.root_ref = self.root_ref;
        qp.leaf_count = self.leaf_count;
        qp.used_count = self.used_count;
        qp.free_count = self.free_count;
        qp.hold_count = self.hold_count;
        qp.mode = self.mode;
        qp.compact_all = self.compact_all;
    }
}

/// The chunk pointers a snapshot pinned, in directory shape.
pub(crate) struct SnapShared {
    ptrs: Box<[AtomicPtr<Node>]>,
    root_ref: QpRef,
}

impl SnapShared {
    pub(crate) fn chunks(&self) -> Chunk {
        self.ptrs.len() as Chunk
    }

    pub(crate) fn chunk_ptr(&self, chunk: Chunk) -> *mut Node {
        self.ptrs[chunk as usize].load(Ordering::Relaxed)
    }
}

impl QpMulti {
    /// Create an empty concurrent trie on the given reclamation clock.
    pub fn new(methods: Arc<dyn QpMethods>, qsbr: Arc<Qsbr>) -> Self {
        let mut writer = Qp::unallocated(Arc::clone(&methods));
        // no bump chunk yet: pretending the last transaction was an update
        // makes the first write allocate one, like an update would
        writer.mode = TxMode::Update;
        QpMulti {
            inner: Arc::new(MultiInner {
                methods,
                state: Mutex::new(WriterState {
                    writer,
                    rollback: None,
                    reader_ref: QpRef::INVALID,
                    snapshots: Vec::new(),
                }),
                reader: AtomicPtr::new(ptr::null_mut()),
                qsbr,
            }),
        }
    }

    /// Lock the writer and seal the current cells: every existing chunk
    /// becomes immutable, including the bump chunk, whose sealed prefix is
    /// tracked by `fender`. Space freed before this transaction stops
    /// counting toward the auto-GC threshold.
    fn transaction_open(&self) -> MutexGuard<'_, WriterState> {
        let mut g = self.inner.state.lock();
        let qp = &mut g.writer;
        for chunk in 0..qp.chunk_max() {
            if qp.usage[chunk as usize].exists {
                qp.usage[chunk as usize].immutable = true;
            }
        }
        qp.hold_count = qp.free_count;
        g
    }

    /// Open a light write transaction.
    ///
    /// In a run of write transactions the bump chunk keeps filling up, with
    /// `fender` marking where this transaction's mutable territory starts.
    pub fn write(&self) -> QpTxn<'_> {
        let mut g = self.transaction_open();
        let qp = &mut g.writer;
        if qp.mode == TxMode::Write {
            qp.fender = qp.usage[qp.bump as usize].used;
        } else {
            qp.alloc_reset();
        }
        qp.mode = TxMode::Write;
        QpTxn {
            multi: self,
            guard: Some(g),
        }
    }

    /// Open a heavy update transaction, which can roll back.
    ///
    /// The allocator starts on a fresh bump chunk so that rollback can
    /// simply discard every chunk allocated here; the captured state is
    /// everything else.
    pub fn update(&self) -> QpTxn<'_> {
        let mut g = self.transaction_open();
        g.writer.mode = TxMode::Update;
        let rollback = QpRollback::capture(&g.writer);
        assert!(g.rollback.is_none(), "nested transaction");
        g.rollback = Some(rollback);
        g.writer.alloc_reset();
        QpTxn {
            multi: self,
            guard: Some(g),
        }
    }

    /// Open a wait-free read-only view of the last committed version.
    ///
    /// The view takes no locks and no refcounts; the calling thread must be
    /// registered with the trie's [`Qsbr`] clock and report quiescence
    /// between uses, or reclamation stalls (unregistered threads are not
    /// waited for and must not query).
    pub fn query(&self) -> QpRead<'_> {
        let anchor = self.inner.reader.load(Ordering::Acquire);
        let (base, root_ref) = if anchor.is_null() {
            (ptr::null(), QpRef::INVALID)
        } else {
            // SAFETY: the anchor was published by a commit and its cells
            // stay immutable and allocated until a grace period passes.
            let (n0, n1) = unsafe { (*anchor, *anchor.add(1)) };
            assert!(reader_valid(n0), "corrupt reader anchor");
            (reader_base(n1), reader_root(n0))
        };
        QpRead {
            inner: &*self.inner,
            base,
            root_ref,
            tid: thread::current().id(),
        }
    }

    /// Pin a read-only view of the last committed version that survives
    /// any number of later commits, until dropped.
    pub fn snapshot(&self) -> QpSnap {
        let mut g = self.inner.state.lock();

        let anchor = self.inner.reader.load(Ordering::Acquire);
        let root_ref = if anchor.is_null() {
            QpRef::INVALID
        } else {
            // SAFETY: published anchors stay valid while the writer lock is
            // held; see query().
            reader_root(unsafe { *anchor })
        };

        // pin only chunks with live cells, so memory freed before the
        // snapshot does not linger on its account
        let qp = &mut g.writer;
        let ptrs: Box<[AtomicPtr<Node>]> = (0..qp.chunk_max())
            .map(|chunk| {
                if qp.usage[chunk as usize].exists && qp.chunk_live(chunk) > 0 {
                    qp.usage[chunk as usize].snapshot = true;
                    AtomicPtr::new(qp.base.get(chunk))
                } else {
                    AtomicPtr::new(ptr::null_mut())
                }
            })
            .collect();

        let shared = Arc::new(SnapShared { ptrs, root_ref });
        g.snapshots.push(Arc::clone(&shared));
        QpSnap {
            inner: Arc::clone(&self.inner),
            shared,
        }
    }

    /// Occupancy of the writer's allocator.
    pub fn mem_usage(&self) -> crate::MemUsage {
        self.inner.state.lock().writer.mem_usage()
    }
}

impl Reclaim for MultiInner {
    fn reclaim(&self, drained: Phase) -> bool {
        self.state.lock().writer.reclaim_chunks(drained)
    }
}

/// An open transaction. Dereferences to [`Qp`] for modification; consume it
/// with [`commit`](QpTxn::commit) or [`rollback`](QpTxn::rollback).
pub struct QpTxn<'a> {
    multi: &'a QpMulti,
    guard: Option<MutexGuard<'a, WriterState>>,
}

impl std::ops::Deref for QpTxn<'_> {
    type Target = Qp;

    fn deref(&self) -> &Qp {
        &self.guard.as_ref().expect("transaction open").writer
    }
}

impl std::ops::DerefMut for QpTxn<'_> {
    fn deref_mut(&mut self) -> &mut Qp {
        &mut self.guard.as_mut().expect("transaction open").writer
    }
}

impl QpTxn<'_> {
    /// Publish this transaction's version of the trie and release the
    /// writer.
    pub fn commit(mut self) {
        let mut g = self.guard.take().expect("transaction open");
        let inner = &self.multi.inner;
        let state = &mut *g;
        let qp = &mut state.writer;
        assert!(
            matches!(qp.mode, TxMode::Write | TxMode::Update),
            "commit without an open transaction"
        );

        if qp.mode == TxMode::Update {
            // drops the rollback copy: its directory handle and usage array
            let rollback = state.rollback.take();
            assert!(rollback.is_some(), "update transaction lost its rollback");
        }

        // the previously published anchor dies with this commit
        if state.reader_ref.is_valid() {
            assert!(qp.cells_immutable(state.reader_ref));
            qp.free_twigs(state.reader_ref, READER_SIZE);
        }

        if qp.mode == TxMode::Update {
            // minimize the committed footprint
            qp.run_compact();
            state.reader_ref = qp.alloc_twigs(READER_SIZE);
            qp.shrink_bump();
        } else {
            state.reader_ref = qp.alloc_twigs(READER_SIZE);
        }

        // anchor the new version; the directory reference is released when
        // the anchor's chunk is eventually swept
        let base = Arc::into_raw(Arc::clone(&qp.base));
        let [n0, n1] = reader_nodes(base, qp.root_ref);
        qp.set_node(state.reader_ref, n0);
        qp.set_node(state.reader_ref.at(1), n1);
        let anchor = qp.ref_ptr(state.reader_ref);

        inner.reader.store(anchor, Ordering::Release); // COMMIT

        if qp.mode == TxMode::Update || qp.needgc() {
            qp.recycle();
        }

        // the reclamation phase must be sampled after the store above
        let phase = inner.qsbr.phase();
        if qp.defer_chunk_reclamation(phase) {
            let work: Arc<dyn Reclaim> = Arc::clone(inner) as Arc<dyn Reclaim>;
            inner.qsbr.defer(work, phase);
        }
    }

    /// Throw away everything this transaction did. Only update transactions
    /// keep the state needed to do this.
    pub fn rollback(mut self) {
        let mut g = self.guard.take().expect("transaction open");
        let state = &mut *g;
        let qp = &mut state.writer;
        assert_eq!(
            qp.mode,
            TxMode::Update,
            "rollback of a non-update transaction"
        );

        let start = Instant::now();
        let mut freed = 0;
        for chunk in 0..qp.chunk_max() {
            if !qp.base.get(chunk).is_null() && !qp.usage[chunk as usize].immutable {
                // allocated during this transaction: drop it, detaching the
                // leaves that were attached by inserts and evacuations
                qp.chunk_free(chunk);
                freed += 1;
            }
        }
        let rollback = state.rollback.take().expect("update transaction has rollback state");
        rollback.restore(qp);

        add_rollback_time(start.elapsed().as_nanos() as u64);
        debug!(freed, "qp rollback");
    }
}

impl Drop for QpTxn<'_> {
    fn drop(&mut self) {
        if self.guard.is_some() && !thread::panicking() {
            panic!("transaction dropped without commit or rollback");
        }
    }
}

/// A wait-free read-only view for queries, valid on the opening thread
/// until its next quiescent state.
pub struct QpRead<'a> {
    inner: &'a MultiInner,
    base: *const QpBase,
    root_ref: QpRef,
    tid: ThreadId,
}

impl QpRead<'_> {
    fn view(&self) -> Option<ReadView<'_>> {
        debug_assert_eq!(self.tid, thread::current().id(), "reader crossed threads");
        if self.base.is_null() {
            return None;
        }
        // SAFETY: the directory published with the anchor stays allocated
        // until readers of this version have passed a quiescent state.
        let base = unsafe { &*self.base };
        Some(ReadView {
            ptrs: base.ptrs(),
            root_ref: self.root_ref,
            methods: &*self.inner.methods,
        })
    }

    pub fn get_by_key(&self, key: &QpKey) -> Result<(*mut c_void, u32), QpError> {
        match self.view() {
            Some(view) => view.get(key),
            None => Err(QpError::NotFound),
        }
    }

    pub fn get_by_name(&self, name: &Name) -> Result<(*mut c_void, u32), QpError> {
        self.get_by_key(&QpKey::from_name(name))
    }
}

/// A pinned read-only view that outlives later commits until dropped.
pub struct QpSnap {
    inner: Arc<MultiInner>,
    shared: Arc<SnapShared>,
}

impl QpSnap {
    fn view(&self) -> ReadView<'_> {
        ReadView {
            ptrs: &self.shared.ptrs,
            root_ref: self.shared.root_ref,
            methods: &*self.inner.methods,
        }
    }

    pub fn get_by_key(&self, key: &QpKey) -> Result<(*mut c_void, u32), QpError> {
        self.view().get(key)
    }

    pub fn get_by_name(&self, name: &Name) -> Result<(*mut c_void, u32), QpError> {
        self.get_by_key(&QpKey::from_name(name))
    }
}

impl Drop for QpSnap {
    fn drop(&mut self) {
        let mut g = self.inner.state.lock();
        let state = &mut *g;
        state
            .snapshots
            .retain(|s| !Arc::ptr_eq(s, &self.shared));
        // eagerly reclaim chunks this snapshot was the last to pin
        marksweep_chunks(&mut state.writer, &state.snapshots);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestLeaves;
    use crate::GcMode;

    fn key(text: &str) -> QpKey {
        QpKey::from_name(&Name::from_text(text).unwrap())
    }

    fn insert_all(txn: &mut QpTxn<'_>, leaves: &Arc<TestLeaves>, names: &[String]) {
        for name in names {
            let leaf = leaves.make_leaf(name);
            txn.insert(leaf.pval(), leaf.ival()).unwrap();
        }
    }

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("h{i:05}.zone.example")).collect()
    }

    #[test]
    fn test_commit_publishes_to_queries() {
        let leaves = TestLeaves::shared();
        let multi = QpMulti::new(leaves.clone(), Qsbr::new());

        // nothing committed yet
        assert_eq!(
            multi.query().get_by_key(&key("a.example")),
            Err(QpError::NotFound)
        );

        let mut txn = multi.write();
        let leaf = leaves.make_leaf("a.example");
        txn.insert(leaf.pval(), leaf.ival()).unwrap();
        // still invisible: not committed
        assert_eq!(
            multi.query().get_by_key(&key("a.example")),
            Err(QpError::NotFound)
        );
        txn.commit();

        assert!(multi.query().get_by_key(&key("a.example")).is_ok());
    }

    #[test]
    fn test_query_keeps_pre_transaction_version() {
        let leaves = TestLeaves::shared();
        let multi = QpMulti::new(leaves.clone(), Qsbr::new());
        let all = names(100);

        let mut txn = multi.write();
        insert_all(&mut txn, &leaves, &all);
        txn.commit();

        let before = multi.query();
        let mut txn = multi.update();
        for name in all.iter().take(50) {
            txn.delete_by_key(&key(name)).unwrap();
        }
        // the open view still sees every original key mid-transaction
        for name in &all {
            assert!(before.get_by_key(&key(name)).is_ok(), "{name}");
        }
        txn.commit();

        // it still does after the commit, until the reader is dropped
        for name in &all {
            assert!(before.get_by_key(&key(name)).is_ok(), "{name}");
        }
        drop(before);

        let after = multi.query();
        for (i, name) in all.iter().enumerate() {
            assert_eq!(after.get_by_key(&key(name)).is_ok(), i >= 50, "{name}");
        }
    }

    #[test]
    fn test_grace_period_reclaims_chunks() {
        let leaves = TestLeaves::shared();
        let qsbr = Qsbr::new();
        let reader = qsbr.register();
        let multi = QpMulti::new(leaves.clone(), qsbr.clone());
        let all = names(5000);

        let mut txn = multi.write();
        insert_all(&mut txn, &leaves, &all);
        txn.commit();
        reader.quiescent();
        let grown = multi.mem_usage();

        let mut txn = multi.update();
        for name in &all {
            txn.delete_by_key(&key(name)).unwrap();
        }
        txn.commit();

        // chunks emptied by the deletes are immutable and must survive
        // until the grace period has elapsed
        let held = multi.mem_usage();
        assert!(held.chunk_count > 1);

        reader.quiescent();
        let reclaimed = multi.mem_usage();
        assert!(
            reclaimed.chunk_count < grown.chunk_count,
            "chunks not reclaimed: {} -> {}",
            grown.chunk_count,
            reclaimed.chunk_count
        );
        assert_eq!(reclaimed.leaves, 0);
        drop(multi);
        leaves.assert_no_leaks();
    }

    #[test]
    fn test_rollback_restores_everything() {
        let leaves = TestLeaves::shared();
        let multi = QpMulti::new(leaves.clone(), Qsbr::new());
        let all = names(10_000);

        let mut txn = multi.write();
        insert_all(&mut txn, &leaves, &all);
        txn.commit();
        let before = multi.mem_usage();

        let mut txn = multi.update();
        for name in all.iter().take(5000) {
            txn.delete_by_key(&key(name)).unwrap();
        }
        txn.rollback();

        // identical to the state the update captured: opening the update
        // moved free space out of the auto-GC's reach (hold = free), and
        // everything else is byte-for-byte what it was
        let after = multi.mem_usage();
        assert_eq!(after.leaves, before.leaves);
        assert_eq!(after.live, before.live);
        assert_eq!(after.used, before.used);
        assert_eq!(after.free, before.free);
        assert_eq!(after.hold, before.free);
        assert_eq!(after.chunk_count, before.chunk_count);
        assert_eq!(after.bytes, before.bytes);
        for name in &all {
            assert!(multi.query().get_by_key(&key(name)).is_ok(), "{name}");
            assert_eq!(leaves.refcount(name), 1, "{name}");
        }
        drop(multi);
        leaves.assert_no_leaks();
    }

    #[test]
    fn test_rollback_of_first_transaction() {
        let leaves = TestLeaves::shared();
        let multi = QpMulti::new(leaves.clone(), Qsbr::new());

        let mut txn = multi.update();
        let leaf = leaves.make_leaf("gone.example");
        txn.insert(leaf.pval(), leaf.ival()).unwrap();
        txn.rollback();

        assert_eq!(
            multi.query().get_by_key(&key("gone.example")),
            Err(QpError::NotFound)
        );
        assert_eq!(leaves.refcount("gone.example"), 0);
        drop(multi);
        leaves.assert_no_leaks();
    }

    #[test]
    fn test_snapshot_pins_chunks_across_commits() {
        let leaves = TestLeaves::shared();
        let qsbr = Qsbr::new();
        let reader = qsbr.register();
        let multi = QpMulti::new(leaves.clone(), qsbr.clone());
        let all = names(5000);

        let mut txn = multi.write();
        insert_all(&mut txn, &leaves, &all);
        txn.commit();

        let snap = multi.snapshot();
        let pinned = multi.mem_usage();

        let mut txn = multi.update();
        for name in &all {
            txn.delete_by_key(&key(name)).unwrap();
        }
        txn.commit();
        reader.quiescent();

        // the snapshot still answers from the old version
        for name in &all {
            assert!(snap.get_by_key(&key(name)).is_ok(), "{name}");
        }
        // and its chunks are still allocated despite the grace period
        let held = multi.mem_usage();
        assert!(held.chunk_count >= pinned.chunk_count - 1);

        drop(snap);
        let swept = multi.mem_usage();
        assert!(
            swept.chunk_count < held.chunk_count,
            "mark-sweep freed nothing: {} -> {}",
            held.chunk_count,
            swept.chunk_count
        );
        drop(multi);
        leaves.assert_no_leaks();
    }

    #[test]
    fn test_snapshot_of_each_version_is_stable() {
        let leaves = TestLeaves::shared();
        let multi = QpMulti::new(leaves.clone(), Qsbr::new());

        let mut txn = multi.write();
        let leaf = leaves.make_leaf("v1.example");
        txn.insert(leaf.pval(), leaf.ival()).unwrap();
        txn.commit();
        let snap1 = multi.snapshot();

        let mut txn = multi.write();
        let leaf = leaves.make_leaf("v2.example");
        txn.insert(leaf.pval(), leaf.ival()).unwrap();
        txn.commit();
        let snap2 = multi.snapshot();

        assert!(snap1.get_by_key(&key("v1.example")).is_ok());
        assert_eq!(snap1.get_by_key(&key("v2.example")), Err(QpError::NotFound));
        assert!(snap2.get_by_key(&key("v1.example")).is_ok());
        assert!(snap2.get_by_key(&key("v2.example")).is_ok());
    }

    #[test]
    fn test_sequential_writes_share_bump_chunk() {
        let leaves = TestLeaves::shared();
        let multi = QpMulti::new(leaves.clone(), Qsbr::new());

        for batch in 0..20 {
            let mut txn = multi.write();
            for i in 0..20 {
                let leaf = leaves.make_leaf(&format!("w{batch}x{i}.example"));
                txn.insert(leaf.pval(), leaf.ival()).unwrap();
            }
            txn.commit();
        }
        let usage = multi.mem_usage();
        assert_eq!(usage.leaves, 400);
        // small write transactions must not burn a chunk each
        assert!(usage.chunk_count < 4, "chunks: {}", usage.chunk_count);
    }

    #[test]
    fn test_update_commit_trims_bump_chunk() {
        let leaves = TestLeaves::shared();
        let multi = QpMulti::new(leaves.clone(), Qsbr::new());
        let all = names(100);

        let mut txn = multi.update();
        insert_all(&mut txn, &leaves, &all);
        txn.commit();

        let usage = multi.mem_usage();
        // the bump chunk was reallocated down to its used cells
        assert!(usage.bytes < crate::node::QP_CHUNK_SIZE as usize * usage.node_size);
    }

    #[test]
    #[should_panic(expected = "rollback of a non-update transaction")]
    fn test_write_transactions_cannot_roll_back() {
        let leaves = TestLeaves::shared();
        let multi = QpMulti::new(leaves, Qsbr::new());
        multi.write().rollback();
    }

    #[test]
    fn test_destroy_with_pending_reclamation() {
        let leaves = TestLeaves::shared();
        let qsbr = Qsbr::new();
        let reader = qsbr.register();
        let multi = QpMulti::new(leaves.clone(), qsbr.clone());
        let all = names(3000);

        let mut txn = multi.write();
        insert_all(&mut txn, &leaves, &all);
        txn.commit();
        reader.quiescent();

        let mut txn = multi.update();
        for name in &all {
            txn.delete_by_key(&key(name)).unwrap();
        }
        txn.commit();

        // reclamation is pending; teardown is deferred until it drains
        drop(multi);
        reader.quiescent();
        drop(reader);
        leaves.assert_no_leaks();
    }

    #[test]
    fn test_concurrent_readers_see_committed_prefixes() {
        let leaves = TestLeaves::shared();
        let qsbr = Qsbr::new();
        let multi = Arc::new(QpMulti::new(leaves.clone(), qsbr.clone()));
        let all: Arc<Vec<String>> = Arc::new(names(2000));

        // pre-register every leaf so reader threads never mutate the registry
        for name in all.iter() {
            leaves.make_leaf(name);
        }

        let mut handles = Vec::new();
        for _ in 0..3 {
            let multi = Arc::clone(&multi);
            let all = Arc::clone(&all);
            let qsbr = Arc::clone(&qsbr);
            handles.push(thread::spawn(move || {
                let registration = qsbr.register();
                let mut last_seen = 0;
                while last_seen < all.len() {
                    let view = multi.query();
                    let mut visible = 0;
                    for name in all.iter() {
                        let k = QpKey::from_name(&Name::from_text(name).unwrap());
                        if view.get_by_key(&k).is_ok() {
                            visible += 1;
                        } else {
                            break;
                        }
                    }
                    // committed batches are only ever appended, so the
                    // visible set must be a prefix and must never shrink
                    for name in all.iter().take(visible) {
                        let k = QpKey::from_name(&Name::from_text(name).unwrap());
                        assert!(view.get_by_key(&k).is_ok(), "{name} vanished");
                    }
                    assert!(visible >= last_seen, "snapshot went backwards");
                    last_seen = visible;
                    drop(view);
                    registration.quiescent();
                }
            }));
        }

        for batch in all.chunks(100) {
            let mut txn = multi.write();
            for name in batch {
                let leaf = leaves.make_leaf(name);
                txn.insert(leaf.pval(), leaf.ival()).unwrap();
            }
            txn.commit();
        }

        for handle in handles {
            handle.join().unwrap();
        }
        drop(multi);
        qsbr.poll();
        leaves.assert_no_leaks();
    }

    #[test]
    fn test_writer_compact_inside_transaction() {
        let leaves = TestLeaves::shared();
        let multi = QpMulti::new(leaves.clone(), Qsbr::new());
        let all = names(2000);

        let mut txn = multi.write();
        insert_all(&mut txn, &leaves, &all);
        txn.commit();

        let mut txn = multi.update();
        for name in all.iter().take(1000) {
            txn.delete_by_key(&key(name)).unwrap();
        }
        txn.compact(GcMode::All);
        txn.commit();

        for (i, name) in all.iter().enumerate() {
            assert_eq!(
                multi.query().get_by_key(&key(name)).is_ok(),
                i >= 1000,
                "{name}"
            );
        }
    }
}
