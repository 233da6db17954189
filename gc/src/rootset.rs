//! Per-cycle root sets.
//!
//! A root set is gathered fresh for every collection from the suspended
//! threads' reported machine state plus the registered global slots, and
//! discarded after write-back. Slots snapshot the referenced value at
//! readout; marking reads the snapshots, compaction updates them, and
//! write-back pushes them through the original cells.

use log::debug;
use object::Header;
use parking_lot::Mutex;

use crate::threads::MutatorRegistry;

/// One root: the address of a reference cell, the value snapshotted from
/// it, and whether the compactor may rewrite it. Immutable slots (e.g. a
/// reference embedded in emitted code) are traced but never written.
#[derive(Debug)]
pub struct RootSlot {
    pub(crate) cell: *mut *mut Header,
    pub value: *mut Header,
    pub writable: bool,
}

/// Ordered, append-only collection of the cycle's roots. Never persisted
/// across cycles.
#[derive(Debug, Default)]
pub struct RootSet {
    pub(crate) slots: Vec<RootSlot>,
}

impl RootSet {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RootSlot> {
        self.slots.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut RootSlot> {
        self.slots.iter_mut()
    }
}

/// Global/static reference slots registered with the collector.
#[derive(Debug, Default)]
pub struct GlobalRoots {
    slots: Mutex<Vec<GlobalSlot>>,
}

#[derive(Debug)]
struct GlobalSlot {
    cell: *mut *mut Header,
    writable: bool,
}

// SAFETY: cells are only dereferenced while the world is stopped.
unsafe impl Send for GlobalSlot {}

impl GlobalRoots {
    /// Registers a global reference cell as a permanent root.
    ///
    /// # Safety
    /// `cell` must stay valid for the lifetime of the collector and must
    /// only be mutated by mutator threads between collections.
    pub unsafe fn register(&self, cell: *mut *mut Header, writable: bool) {
        self.slots.lock().push(GlobalSlot { cell, writable });
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }
}

/// Enumerates every root of the current cycle: for each suspended thread,
/// its reported registers then stack slots, followed by the global slots.
///
/// Must only be called while the world is stopped; the returned set holds
/// raw pointers into the threads' state vectors, which stay in place for
/// the duration of the pause.
pub fn read_roots(
    registry: &MutatorRegistry,
    globals: &GlobalRoots,
) -> RootSet {
    let mut roots = RootSet::default();

    for thread in registry.snapshot() {
        let mut guard = thread.state.lock();
        let state = &mut *guard;
        let before = roots.len();
        for cell in state.registers.iter_mut().chain(state.stack.iter_mut()) {
            roots.slots.push(RootSlot {
                cell: &mut cell.value,
                value: cell.value,
                writable: cell.writable,
            });
        }
        debug!(
            "thread {}: {} root slot(s)",
            thread.id,
            roots.len() - before
        );
    }

    for global in globals.slots.lock().iter() {
        roots.slots.push(RootSlot {
            cell: global.cell,
            // SAFETY: globals are quiescent while the world is stopped.
            value: unsafe { *global.cell },
            writable: global.writable,
        });
    }

    debug!("root set complete: {} slot(s)", roots.len());
    roots
}

/// Pushes the (possibly relocated) snapshots back into the original cells.
/// Must be called with the same set produced by [`read_roots`] in this
/// cycle. Immutable slots are verified untouched.
pub fn write_roots(roots: &RootSet) {
    for slot in roots.iter() {
        if slot.writable {
            // SAFETY: the owning thread is still suspended.
            unsafe { *slot.cell = slot.value };
        } else {
            // SAFETY: as above; read-only verification.
            let current = unsafe { *slot.cell };
            assert!(
                current == slot.value,
                "immutable root slot diverged from its snapshot"
            );
        }
    }
}
