//! Reachability marking.
//!
//! Worklist-driven tracing from the root set over the object model's edge
//! enumeration, followed by the finalization walk. Runs with the world
//! stopped; nothing here synchronizes.

use log::debug;
use object::{Header, object_size, visit_edges};

use crate::finalizer::{FinalState, FinalizerRegistry};
use crate::region::Region;
use crate::rootset::RootSet;

#[derive(Debug, Default)]
pub struct MarkOutcome {
    pub marked_objects: usize,
    pub marked_bytes: usize,
    /// A finalizable object became reclaimable; the finalizer thread must
    /// be woken once the cycle completes.
    pub notify_finalizer: bool,
}

struct Marker<'a> {
    region: &'a Region,
    /// Pending objects whose edges still need scanning. Bounds native
    /// stack usage independent of object-graph depth.
    worklist: Vec<*mut Header>,
    marked_objects: usize,
    marked_bytes: usize,
}

impl<'a> Marker<'a> {
    fn new(region: &'a Region) -> Self {
        Self {
            region,
            worklist: Vec::new(),
            marked_objects: 0,
            marked_bytes: 0,
        }
    }

    /// Marks `obj` if it is a non-null pointer into the collected region
    /// and not yet marked, queueing it for edge scanning when its class
    /// can hold references at all.
    fn mark_value(&mut self, obj: *mut Header) {
        if !self.region.contains(obj) {
            // Null, uncollectable, or foreign pointer: not ours to trace.
            return;
        }
        // SAFETY: in-region pointers address valid, live objects.
        let header = unsafe { &mut *obj };
        assert!(
            !header.is_uncollectable(),
            "uncollectable object inside the collected region"
        );
        if header.is_marked() {
            return;
        }
        header.mark();
        self.marked_objects += 1;
        // SAFETY: header valid, see above.
        self.marked_bytes += unsafe { object_size(obj) };
        if header.may_reference() {
            self.worklist.push(obj);
        }
    }

    fn drain(&mut self) {
        while let Some(obj) = self.worklist.pop() {
            let mut visitor = |cell: *mut *mut Header| {
                // SAFETY: enumerated cells lie inside a live object.
                let target = unsafe { *cell };
                self.mark_value(target);
            };
            // SAFETY: only valid marked objects enter the worklist.
            unsafe { visit_edges(obj, &mut visitor) };
        }
    }
}

/// Marks everything reachable from `roots`, then walks the finalization
/// registry: a still-`Reachable` entry whose object went unreached becomes
/// `Reclaimable` and is force-marked so the finalizer observes a fully
/// intact object; `Reclaimable`/`Finalizing` entries are kept alive the
/// same way until their finalizer has finished.
pub fn mark(
    roots: &RootSet,
    region: &Region,
    finals: &FinalizerRegistry,
) -> MarkOutcome {
    let mut marker = Marker::new(region);

    for slot in roots.iter() {
        marker.mark_value(slot.value);
    }
    marker.drain();
    debug!(
        "marked {} object(s), {} byte(s) from {} root(s)",
        marker.marked_objects,
        marker.marked_bytes,
        roots.len()
    );

    let mut notify_finalizer = false;
    finals.with_entries(|entries| {
        for entry in entries.iter_mut() {
            // SAFETY: entry pointers are kept current across collections.
            let marked = unsafe { (*entry.object).is_marked() };
            match (entry.state, marked) {
                (FinalState::Reachable, false) => {
                    // Newly unreachable: reclaimable from now on, but kept
                    // intact and unrelocated-consistent for its finalizer.
                    entry.advance(FinalState::Reclaimable);
                    marker.mark_value(entry.object);
                    marker.drain();
                    notify_finalizer = true;
                }
                (FinalState::Reachable, true) => {}
                (FinalState::Reclaimable, false)
                | (FinalState::Finalizing, false) => {
                    // Finalizer has not finished; the object must survive.
                    marker.mark_value(entry.object);
                    marker.drain();
                }
                (FinalState::Reclaimable, true)
                | (FinalState::Finalizing, true) => {
                    // Reached again before finalization ran. Accepted
                    // resurrection anomaly; the lifecycle does not rewind.
                }
                (FinalState::Finalized, _) => {
                    // Takes no part in marking; a dead finalized entry is
                    // retired after compaction.
                }
            }
        }
    });

    MarkOutcome {
        marked_objects: marker.marked_objects,
        marked_bytes: marker.marked_bytes,
        notify_finalizer,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rootset::RootSlot;
    use crate::system::OS_PAGE_SIZE;
    use object::{
        ClassDesc, FieldDesc, FieldKind, HEADER_SIZE, array_allocation_size,
        array_ref_cell, init_array, init_object, write_ref,
    };
    use std::ptr;

    fn node_class() -> &'static ClassDesc {
        ClassDesc::object(
            "Node",
            None,
            vec![FieldDesc::reference("next", HEADER_SIZE)],
        )
        .leak()
    }

    fn alloc_obj(region: &mut Region, class: &'static ClassDesc) -> *mut Header {
        let ptr = region.bump(class.instance_size).expect("heap space");
        // SAFETY: freshly bumped zeroed storage of instance size.
        unsafe { init_object(ptr.as_ptr(), class) }
    }

    fn alloc_array(
        region: &mut Region,
        class: &'static ClassDesc,
        len: usize,
    ) -> *mut Header {
        let size = array_allocation_size(class, len);
        let ptr = region.bump(size).expect("heap space");
        // SAFETY: freshly bumped zeroed storage of the full array size.
        unsafe { init_array(ptr.as_ptr(), class, len) }
    }

    fn root_of(value: *mut Header) -> RootSet {
        let mut rs = RootSet::default();
        rs.slots.push(RootSlot {
            cell: ptr::null_mut(),
            value,
            writable: true,
        });
        rs
    }

    #[test]
    fn marks_transitive_chain_and_skips_garbage() {
        let mut region = Region::new(OS_PAGE_SIZE).expect("region");
        let class = node_class();
        let a = alloc_obj(&mut region, class);
        let b = alloc_obj(&mut region, class);
        let dead = alloc_obj(&mut region, class);
        // SAFETY: `next` is the declared reference field.
        unsafe { write_ref(a, HEADER_SIZE, b) };

        let finals = FinalizerRegistry::default();
        let outcome = mark(&root_of(a), &region, &finals);

        assert_eq!(outcome.marked_objects, 2);
        assert_eq!(
            outcome.marked_bytes,
            2 * class.instance_size
        );
        // SAFETY: objects are live for the whole test.
        unsafe {
            assert!((*a).is_marked());
            assert!((*b).is_marked());
            assert!(!(*dead).is_marked());
        }
    }

    #[test]
    fn null_and_foreign_pointers_are_ignored() {
        let mut region = Region::new(OS_PAGE_SIZE).expect("region");
        let class = node_class();
        let a = alloc_obj(&mut region, class);
        let mut outside = 0u128; // lives on the Rust stack, not in the heap
        // SAFETY: writing declared fields.
        unsafe {
            write_ref(a, HEADER_SIZE, ptr::null_mut());
        }

        let finals = FinalizerRegistry::default();
        let mut roots = root_of(a);
        roots.slots.push(RootSlot {
            cell: ptr::null_mut(),
            value: &mut outside as *mut u128 as *mut Header,
            writable: true,
        });
        roots.slots.push(RootSlot {
            cell: ptr::null_mut(),
            value: ptr::null_mut(),
            writable: true,
        });

        let outcome = mark(&roots, &region, &finals);
        assert_eq!(outcome.marked_objects, 1);
    }

    #[test]
    fn reference_array_marks_populated_slots() {
        let mut region = Region::new(OS_PAGE_SIZE).expect("region");
        let arr_class =
            ClassDesc::array_of("[Object", FieldKind::Reference).leak();
        let node = node_class();

        let arr = alloc_array(&mut region, arr_class, 10);
        let x = alloc_obj(&mut region, node);
        let y = alloc_obj(&mut region, node);
        // SAFETY: indices in bounds of the 10-slot array.
        unsafe {
            *array_ref_cell(arr, 2) = x;
            *array_ref_cell(arr, 7) = y;
        }

        let finals = FinalizerRegistry::default();
        let outcome = mark(&root_of(arr), &region, &finals);
        assert_eq!(outcome.marked_objects, 3, "array plus two elements");
    }

    #[test]
    fn referencing_flag_short_circuits_body_scans() {
        let mut region = Region::new(OS_PAGE_SIZE).expect("region");
        let bytes = ClassDesc::array_of("[B", FieldKind::Byte).leak();
        let victim = alloc_obj(&mut region, node_class());

        let arr = alloc_array(&mut region, bytes, 64);
        // Plant a pointer-shaped bit pattern in the byte array. It must
        // never be followed.
        // SAFETY: writing inside the 64-byte payload.
        unsafe {
            *((arr as *mut u8).add(object::ARRAY_ELEMS_OFFSET)
                as *mut *mut Header) = victim;
        }

        let finals = FinalizerRegistry::default();
        let outcome = mark(&root_of(arr), &region, &finals);
        assert_eq!(outcome.marked_objects, 1);
        // SAFETY: victim is live for the whole test.
        unsafe { assert!(!(*victim).is_marked()) };
    }

    #[test]
    fn deep_chain_does_not_recurse() {
        // Deeper than any plausible native stack would tolerate under
        // recursive marking.
        let class = node_class();
        let count = 200_000usize;
        let mut region =
            Region::new(count * class.instance_size + OS_PAGE_SIZE)
                .expect("region");

        let head = alloc_obj(&mut region, class);
        let mut tail = head;
        for _ in 1..count {
            let next = alloc_obj(&mut region, class);
            // SAFETY: `next` field of a live node.
            unsafe { write_ref(tail, HEADER_SIZE, next) };
            tail = next;
        }

        let finals = FinalizerRegistry::default();
        let outcome = mark(&root_of(head), &region, &finals);
        assert_eq!(outcome.marked_objects, count);
    }

    fn noop_finalizer(_obj: *mut Header) {}

    #[test]
    fn unreached_finalizable_object_becomes_reclaimable_and_survives() {
        let mut region = Region::new(OS_PAGE_SIZE).expect("region");
        let class = node_class();
        let z = alloc_obj(&mut region, class);
        let kept = alloc_obj(&mut region, class);
        // Z holds a reference; the force-mark must keep the closure alive.
        // SAFETY: declared field.
        unsafe { write_ref(z, HEADER_SIZE, kept) };

        let finals = FinalizerRegistry::default();
        finals.register(z, noop_finalizer);

        let outcome = mark(&RootSet::default(), &region, &finals);
        assert!(outcome.notify_finalizer);
        assert_eq!(finals.state_of(z), Some(FinalState::Reclaimable));
        // SAFETY: live for the test.
        unsafe {
            assert!((*z).is_marked(), "reclaimable object is force-marked");
            assert!((*kept).is_marked(), "its closure survives with it");
        }
    }

    #[test]
    fn reachable_finalizable_object_is_left_alone() {
        let mut region = Region::new(OS_PAGE_SIZE).expect("region");
        let z = alloc_obj(&mut region, node_class());
        let finals = FinalizerRegistry::default();
        finals.register(z, noop_finalizer);

        let outcome = mark(&root_of(z), &region, &finals);
        assert!(!outcome.notify_finalizer);
        assert_eq!(finals.state_of(z), Some(FinalState::Reachable));
    }

    #[test]
    fn reclaimable_entry_stays_alive_until_finalized() {
        let mut region = Region::new(OS_PAGE_SIZE).expect("region");
        let z = alloc_obj(&mut region, node_class());
        let finals = FinalizerRegistry::default();
        finals.register(z, noop_finalizer);

        // First cycle: becomes reclaimable.
        let first = mark(&RootSet::default(), &region, &finals);
        assert!(first.notify_finalizer);
        // SAFETY: z stays valid.
        unsafe { (*z).clear_gc_state() };

        // Second cycle before the finalizer ran: no new notification, but
        // the object must be kept intact.
        let second = mark(&RootSet::default(), &region, &finals);
        assert!(!second.notify_finalizer);
        assert_eq!(finals.state_of(z), Some(FinalState::Reclaimable));
        // SAFETY: z stays valid.
        unsafe { assert!((*z).is_marked()) };
    }
}
