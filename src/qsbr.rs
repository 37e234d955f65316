//! Quiescent-state-based reclamation.
//!
//! Query readers take no locks and no refcounts; the writer therefore never
//! knows when a reader is done with memory it has logically freed. QSBR
//! supplies the bound: reader threads register here and periodically report
//! a *quiescent state*, a moment at which they hold no trie references.
//! Work deferred under phase `p` is safe to run once every registered thread
//! has reported quiescence after `p` was activated.
//!
//! Phases are a monotonically increasing epoch. Deferring work under the
//! current phase advances the epoch, so only quiescent states observed
//! *after* the deferral count toward its grace period; a reader that was
//! quiescent a moment before the writer published could otherwise still pick
//! up the outgoing version.
//!
//! This plays the role epoch-based schemes like `crossbeam_epoch` play for
//! always-on lock-free structures, but driven explicitly by the host's
//! event loop: one `quiescent()` call per loop tick is enough.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

/// A reclamation phase. Phase 0 never occurs; it is free for "none" markers.
pub type Phase = u32;

/// Deferred reclamation work. Invoked after the grace period for `drained`
/// (and everything before it) has elapsed; returns true to be re-queued for
/// the next grace period.
pub(crate) trait Reclaim: Send + Sync {
    fn reclaim(&self, drained: Phase) -> bool;
}

struct QsbrInner {
    /// Last epoch at which each registered thread reported quiescence;
    /// `None` slots are unregistered.
    threads: Vec<Option<Phase>>,
    /// Pending work, all deferred under some phase below the current epoch.
    work: Vec<Arc<dyn Reclaim>>,
    /// Highest phase whose grace period has fully elapsed.
    drained: Phase,
}

/// The reclamation clock shared by tries and their reader threads.
pub struct Qsbr {
    epoch: AtomicU32,
    inner: Mutex<QsbrInner>,
}

impl Qsbr {
    pub fn new() -> Arc<Self> {
        Arc::new(Qsbr {
            epoch: AtomicU32::new(1),
            inner: Mutex::new(QsbrInner {
                threads: Vec::new(),
                work: Vec::new(),
                drained: 0,
            }),
        })
    }

    /// The current phase. Sampled by the writer *after* publishing, so the
    /// phase covers every reader that might have loaded the outgoing
    /// version.
    pub(crate) fn phase(&self) -> Phase {
        self.epoch.load(Ordering::Acquire)
    }

    /// Queue `work` to run once the grace period for `phase` has elapsed,
    /// and activate that phase: the epoch moves past it so that only
    /// subsequent quiescent states count.
    pub(crate) fn defer(&self, work: Arc<dyn Reclaim>, phase: Phase) {
        let mut inner = self.inner.lock();
        // single writer per trie, but several tries can share the clock
        let _ = self
            .epoch
            .compare_exchange(phase, phase + 1, Ordering::AcqRel, Ordering::Relaxed);
        inner.work.push(work);
        trace!(phase, "qsbr deferred reclamation work");
    }

    /// Register the calling thread as a reader. Reader threads that query
    /// tries on this clock must hold a registration and report quiescence,
    /// or grace periods will be computed without them.
    pub fn register(self: &Arc<Self>) -> QsbrThread {
        let mut inner = self.inner.lock();
        let epoch = self.epoch.load(Ordering::Acquire);
        let slot = match inner.threads.iter().position(Option::is_none) {
            Some(free) => {
                inner.threads[free] = Some(epoch);
                free
            }
            None => {
                inner.threads.push(Some(epoch));
                inner.threads.len() - 1
            }
        };
        QsbrThread {
            qsbr: Arc::clone(self),
            slot,
        }
    }

    /// Run any work whose grace period has elapsed, given the lowest epoch
    /// any registered thread has quiesced at.
    fn drain(&self, mut inner: parking_lot::MutexGuard<'_, QsbrInner>) {
        let floor = inner
            .threads
            .iter()
            .flatten()
            .copied()
            .min()
            .unwrap_or_else(|| self.epoch.load(Ordering::Acquire));
        let drained = floor.saturating_sub(1);
        if drained <= inner.drained || inner.work.is_empty() {
            return;
        }
        inner.drained = drained;
        let work = std::mem::take(&mut inner.work);
        drop(inner);

        trace!(drained, jobs = work.len(), "qsbr grace period elapsed");
        // callbacks take their own locks, so run them unlocked
        let rearm: Vec<Arc<dyn Reclaim>> =
            work.into_iter().filter(|w| w.reclaim(drained)).collect();
        if !rearm.is_empty() {
            self.inner.lock().work.extend(rearm);
        }
    }

    /// Drive the clock without a reader registration: recompute the grace
    /// floor from the registered threads (or the epoch itself when there are
    /// none) and run anything that has become safe. Useful for hosts with no
    /// standing reader threads.
    pub fn poll(&self) {
        self.drain(self.inner.lock());
    }
}

/// One reader thread's registration.
pub struct QsbrThread {
    qsbr: Arc<Qsbr>,
    slot: usize,
}

impl QsbrThread {
    /// Report a quiescent state: the calling thread holds no references
    /// into any trie on this clock.
    pub fn quiescent(&self) {
        let mut inner = self.qsbr.inner.lock();
        let epoch = self.qsbr.epoch.load(Ordering::Acquire);
        inner.threads[self.slot] = Some(epoch);
        self.qsbr.drain(inner);
    }
}

impl Drop for QsbrThread {
    fn drop(&mut self) {
        let mut inner = self.qsbr.inner.lock();
        inner.threads[self.slot] = None;
        self.qsbr.drain(inner);
    }
}
