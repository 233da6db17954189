//! Finalization registry.
//!
//! Tracks every object that declared a finalizer, independently of the mark
//! bit. An entry exists from constructor-time registration until its
//! finalizer has fully executed; entries are never deleted while
//! `Finalizing`. Registration and finalizer invocation run outside the
//! collection pause and synchronize through the registry lock; the marking
//! walk runs inside the pause with the world stopped.

use std::panic::{AssertUnwindSafe, catch_unwind};

use log::{debug, warn};
use object::{FinalizerFn, Header};
use parking_lot::{Condvar, Mutex};

/// Lifecycle of a finalizable object. Total order; states never regress
/// (resurrection leaves the state where it is, it does not rewind it).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FinalState {
    Reachable,
    Reclaimable,
    Finalizing,
    Finalized,
}

#[derive(Debug)]
pub struct FinalEntry {
    pub object: *mut Header,
    pub finalizer: FinalizerFn,
    pub state: FinalState,
}

// SAFETY: entry object pointers are only dereferenced during the pause or
// by the finalizer thread under the protocol in `Mutator::run_pending_finalizers`.
unsafe impl Send for FinalEntry {}

impl FinalEntry {
    /// Steps the lifecycle forward. Moving backward is a corruption of the
    /// finalization protocol and aborts.
    pub fn advance(&mut self, to: FinalState) {
        assert!(
            to > self.state,
            "finalizer state must never move backward ({:?} -> {:?})",
            self.state,
            to
        );
        self.state = to;
    }
}

#[derive(Debug, Default)]
struct Inner {
    entries: Vec<FinalEntry>,
    /// A collection produced reclaimable entries; the finalizer thread
    /// should wake up.
    work_pending: bool,
    shutdown: bool,
}

#[derive(Debug, Default)]
pub struct FinalizerRegistry {
    inner: Mutex<Inner>,
    wake: Condvar,
}

impl FinalizerRegistry {
    /// Registers a freshly constructed object whose class declares a
    /// finalizer. Called exactly once per such object.
    pub fn register(&self, object: *mut Header, finalizer: FinalizerFn) {
        let mut inner = self.inner.lock();
        inner.entries.push(FinalEntry {
            object,
            finalizer,
            state: FinalState::Reachable,
        });
        debug!("finalizer registered, {} entries", inner.entries.len());
    }

    pub fn entry_count(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Lifecycle state of the entry for `object`, if one exists.
    pub fn state_of(&self, object: *mut Header) -> Option<FinalState> {
        self.inner
            .lock()
            .entries
            .iter()
            .find(|e| e.object == object)
            .map(|e| e.state)
    }

    /// Runs `f` over all entries under the registry lock. Used by the
    /// marking walk and by tests; during a pause the lock is uncontended.
    pub(crate) fn with_entries<R>(
        &self,
        f: impl FnOnce(&mut Vec<FinalEntry>) -> R,
    ) -> R {
        f(&mut self.inner.lock().entries)
    }

    /// Picks the next `Reclaimable` entry and steps it to `Finalizing`,
    /// returning the object and its finalizer. The caller must pin the
    /// object as a root before any safepoint and report completion via
    /// [`FinalizerRegistry::finish_finalizing`].
    pub fn take_next_reclaimable(
        &self,
    ) -> Option<(*mut Header, FinalizerFn)> {
        let mut inner = self.inner.lock();
        let entry = inner
            .entries
            .iter_mut()
            .find(|e| e.state == FinalState::Reclaimable)?;
        entry.advance(FinalState::Finalizing);
        Some((entry.object, entry.finalizer))
    }

    /// Marks the single in-flight `Finalizing` entry as `Finalized`.
    pub fn finish_finalizing(&self) {
        let mut inner = self.inner.lock();
        let entry = inner
            .entries
            .iter_mut()
            .find(|e| e.state == FinalState::Finalizing)
            .expect("no finalizer invocation in flight");
        entry.advance(FinalState::Finalized);
    }

    /// Rewrites every entry's object pointer after compaction. `f` returns
    /// the relocated address of a surviving object, or `None` when the
    /// object is dead — which is only legal for `Finalized` entries; those
    /// are retired here. Called with the world stopped.
    pub(crate) fn update_objects(
        &self,
        mut f: impl FnMut(*mut Header) -> Option<*mut Header>,
    ) {
        let mut inner = self.inner.lock();
        inner.entries.retain_mut(|entry| match f(entry.object) {
            Some(new) => {
                entry.object = new;
                true
            }
            None => {
                assert!(
                    entry.state == FinalState::Finalized,
                    "non-finalized entry lost its object ({:?})",
                    entry.state
                );
                debug!("retiring finalized entry");
                false
            }
        });
    }

    // ── finalizer-thread handshake ─────────────────────────────────

    /// Wakes the dedicated finalizer thread after a cycle that produced
    /// reclaimable entries.
    pub fn notify(&self) {
        let mut inner = self.inner.lock();
        inner.work_pending = true;
        self.wake.notify_all();
    }

    /// Parks the finalizer thread until woken. Returns `false` once the
    /// registry is shutting down.
    pub fn wait_for_work(&self) -> bool {
        let mut inner = self.inner.lock();
        while !inner.work_pending && !inner.shutdown {
            self.wake.wait(&mut inner);
        }
        inner.work_pending = false;
        !inner.shutdown
    }

    pub fn shutdown(&self) {
        let mut inner = self.inner.lock();
        inner.shutdown = true;
        self.wake.notify_all();
    }
}

/// Invokes one finalizer at the registry boundary. A panic out of user
/// code is caught and logged; it neither aborts the VM nor stops the
/// remaining entries. Returns whether the finalizer completed normally.
pub fn run_finalizer(finalizer: FinalizerFn, object: *mut Header) -> bool {
    match catch_unwind(AssertUnwindSafe(|| finalizer(object))) {
        Ok(()) => true,
        Err(_) => {
            warn!("finalizer panicked; continuing with remaining entries");
            false
        }
    }
}
