//! Sliding compaction.
//!
//! Three linear passes over the collected region, preserving the relative
//! address order of survivors: compute forwarding offsets, rewrite every
//! reference (object fields, root slots, finalizer entries), then move the
//! objects and reset the bump pointer. Runs with the world stopped.

use std::ptr;

use log::debug;
use object::{Header, object_size, visit_edges};

use crate::finalizer::FinalizerRegistry;
use crate::region::Region;
use crate::rootset::RootSet;

#[derive(Debug, Default)]
pub struct CompactOutcome {
    pub live_bytes: usize,
    pub reclaimed_bytes: usize,
    pub moved_objects: usize,
}

/// Walks the allocated objects of `region` in address order.
unsafe fn walk_objects(
    region: &Region,
    mut f: impl FnMut(*mut Header, usize),
) {
    let mut cursor = region.base();
    let top = region.top();
    while cursor < top {
        let obj = cursor as *mut Header;
        // SAFETY: [base, top) is a dense sequence of valid objects.
        let size = unsafe { object_size(obj) };
        f(obj, size);
        // SAFETY: size keeps the cursor inside [base, top].
        cursor = unsafe { cursor.add(size) };
    }
}

#[inline]
unsafe fn forwarded(obj: *mut Header, dst_base: *mut u8) -> *mut Header {
    // SAFETY: caller guarantees obj is marked with a valid offset.
    unsafe { dst_base.add((*obj).forward_offset() as usize) as *mut Header }
}

/// Relocates all marked objects of `src` to eliminate gaps, rewriting every
/// reference to match. With `dst` given, survivors slide into that fresh
/// region instead (heap growth between collections); the caller then swaps
/// regions. Root-set snapshots are updated in place; rewriting an immutable
/// root slot is a fatal internal error.
pub fn compact(
    roots: &mut RootSet,
    src: &mut Region,
    mut dst: Option<&mut Region>,
    finals: &FinalizerRegistry,
) -> CompactOutcome {
    let used_before = src.used();
    assert!(
        used_before <= u32::MAX as usize,
        "relocation offsets exceed the header encoding"
    );
    let dst_base = dst.as_ref().map(|d| d.base()).unwrap_or(src.base());

    // Pass 1: assign destination offsets in address order.
    let mut live_bytes = 0usize;
    let assign = |obj: *mut Header, size: usize| {
        // SAFETY: walk_objects hands out valid headers.
        let header = unsafe { &mut *obj };
        if header.is_marked() {
            header.set_forward(live_bytes as u32);
            live_bytes += size;
        }
    };
    // SAFETY: the region holds a dense object sequence below its top.
    unsafe { walk_objects(src, assign) };

    // Pass 2: rewrite references through the forwarding information while
    // every header is still at its old address.
    let rewrite = |obj: *mut Header, _size: usize| {
        // SAFETY: walk_objects hands out valid headers.
        if !unsafe { (*obj).is_marked() } {
            return;
        }
        let mut patch = |cell: *mut *mut Header| {
            // SAFETY: enumerated cells lie inside a live object.
            let target = unsafe { *cell };
            if src.contains(target) {
                // SAFETY: in-region targets of live objects are marked
                // and carry a forwarding offset.
                unsafe {
                    debug_assert!(
                        (*target).is_marked(),
                        "live object references unmarked storage"
                    );
                    *cell = forwarded(target, dst_base);
                }
            }
        };
        // SAFETY: obj is a valid live object.
        unsafe { visit_edges(obj, &mut patch) };
    };
    // SAFETY: as above.
    unsafe { walk_objects(src, rewrite) };

    for slot in roots.iter_mut() {
        if !src.contains(slot.value) {
            continue;
        }
        // SAFETY: in-region root snapshots point at marked objects.
        let new = unsafe { forwarded(slot.value, dst_base) };
        if new != slot.value {
            assert!(
                slot.writable,
                "relocation would rewrite an immutable root slot"
            );
            slot.value = new;
        }
    }

    finals.update_objects(|obj| {
        if !src.contains(obj) {
            Some(obj)
        } else {
            // SAFETY: in-region entry pointers address valid headers.
            unsafe {
                if (*obj).is_marked() {
                    Some(forwarded(obj, dst_base))
                } else {
                    None
                }
            }
        }
    });

    // Pass 3: slide the survivors. Destinations never overtake the cursor,
    // so ascending moves are safe; each relocated header sheds its cycle
    // state on arrival.
    let mut moved_objects = 0usize;
    let relocate = |obj: *mut Header, size: usize| {
        // SAFETY: sizes were read from the source header before any bytes
        // of this object move; destination storage is owned by dst_base's
        // region and already vacated.
        unsafe {
            if !(*obj).is_marked() {
                return;
            }
            let new = forwarded(obj, dst_base);
            if new != obj {
                ptr::copy(obj as *const u8, new as *mut u8, size);
                moved_objects += 1;
            }
            (*new).clear_gc_state();
        }
    };
    // SAFETY: as above.
    unsafe { walk_objects(src, relocate) };

    // SAFETY: survivors occupy exactly [dst_base, dst_base + live_bytes).
    unsafe {
        let new_top = dst_base.add(live_bytes);
        match dst.as_deref_mut() {
            Some(d) => d.reset_top(new_top),
            None => src.reset_top(new_top),
        }
    }

    let outcome = CompactOutcome {
        live_bytes,
        reclaimed_bytes: used_before - live_bytes,
        moved_objects,
    };
    debug!(
        "compaction: {} live byte(s), {} reclaimed, {} object(s) moved",
        outcome.live_bytes, outcome.reclaimed_bytes, outcome.moved_objects
    );
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mark::mark;
    use crate::rootset::RootSlot;
    use crate::system::OS_PAGE_SIZE;
    use object::{
        ClassDesc, FieldDesc, FieldKind, HEADER_SIZE, array_allocation_size,
        array_length, array_ref_cell, init_array, init_object, read_ref,
        write_ref,
    };

    fn node_class() -> &'static ClassDesc {
        ClassDesc::object(
            "Node",
            None,
            vec![
                FieldDesc::reference("next", HEADER_SIZE),
                FieldDesc::primitive("payload", HEADER_SIZE + 8, FieldKind::Long),
            ],
        )
        .leak()
    }

    fn alloc_obj(region: &mut Region, class: &'static ClassDesc) -> *mut Header {
        let ptr = region.bump(class.instance_size).expect("heap space");
        // SAFETY: fresh zeroed storage.
        unsafe { init_object(ptr.as_ptr(), class) }
    }

    fn set_payload(obj: *mut Header, value: u64) {
        // SAFETY: payload is a declared long field.
        unsafe {
            *((obj as *mut u8).add(HEADER_SIZE + 8) as *mut u64) = value;
        }
    }

    fn payload(obj: *mut Header) -> u64 {
        // SAFETY: see set_payload.
        unsafe { *((obj as *const u8).add(HEADER_SIZE + 8) as *const u64) }
    }

    fn root_set(values: &[(*mut Header, bool)]) -> RootSet {
        let mut rs = RootSet::default();
        for &(value, writable) in values {
            rs.slots.push(RootSlot {
                cell: std::ptr::null_mut(),
                value,
                writable,
            });
        }
        rs
    }

    #[test]
    fn unreachable_pair_is_fully_reclaimed() {
        // Scenario: X references Y, X is unreachable, Y only through X.
        let mut region = Region::new(OS_PAGE_SIZE).expect("region");
        let class = node_class();
        let x = alloc_obj(&mut region, class);
        let y = alloc_obj(&mut region, class);
        // SAFETY: declared field.
        unsafe { write_ref(x, HEADER_SIZE, y) };

        let finals = FinalizerRegistry::default();
        let mut roots = root_set(&[]);
        mark(&roots, &region, &finals);
        let outcome = compact(&mut roots, &mut region, None, &finals);

        assert_eq!(outcome.live_bytes, 0);
        assert_eq!(outcome.reclaimed_bytes, 2 * class.instance_size);
        assert_eq!(region.used(), 0, "both X and Y become reusable");

        // The very next allocation reuses the reclaimed bytes.
        let again = alloc_obj(&mut region, class);
        assert_eq!(again as usize, region.base() as usize);
    }

    #[test]
    fn survivors_slide_down_with_contents_intact() {
        let mut region = Region::new(OS_PAGE_SIZE).expect("region");
        let class = node_class();
        let garbage = alloc_obj(&mut region, class);
        let live = alloc_obj(&mut region, class);
        set_payload(live, 0xFEED_FACE);
        let _ = garbage;

        let finals = FinalizerRegistry::default();
        let mut roots = root_set(&[(live, true)]);
        mark(&roots, &region, &finals);
        let outcome = compact(&mut roots, &mut region, None, &finals);

        assert_eq!(outcome.moved_objects, 1);
        let relocated = roots.slots[0].value;
        assert_eq!(relocated as usize, region.base() as usize);
        assert_ne!(relocated, live, "object slid over the garbage gap");
        assert_eq!(payload(relocated), 0xFEED_FACE, "bytes are identical");
        // SAFETY: relocated is the live survivor.
        unsafe {
            assert!(!(*relocated).is_marked(), "cycle state cleared");
            assert!(!(*relocated).is_forwarded());
        }
    }

    #[test]
    fn array_slots_follow_their_elements() {
        // Scenario: array of 10 references, 3 populated, 7 null.
        let mut region = Region::new(OS_PAGE_SIZE).expect("region");
        let class = node_class();
        let arr_class =
            ClassDesc::array_of("[Object", FieldKind::Reference).leak();

        // Garbage in front so everything has to move.
        let _gap = alloc_obj(&mut region, class);
        let arr = {
            let size = array_allocation_size(arr_class, 10);
            let ptr = region.bump(size).expect("heap space");
            // SAFETY: fresh zeroed storage.
            unsafe { init_array(ptr.as_ptr(), arr_class, 10) }
        };
        let elems = [
            alloc_obj(&mut region, class),
            alloc_obj(&mut region, class),
            alloc_obj(&mut region, class),
        ];
        for (i, &e) in elems.iter().enumerate() {
            set_payload(e, 100 + i as u64);
            // SAFETY: slots 1, 4, 8 of a 10-slot array.
            unsafe { *array_ref_cell(arr, [1, 4, 8][i]) = e };
        }

        let finals = FinalizerRegistry::default();
        let mut roots = root_set(&[(arr, true)]);
        mark(&roots, &region, &finals);
        compact(&mut roots, &mut region, None, &finals);

        let arr = roots.slots[0].value;
        // SAFETY: relocated array is live.
        unsafe {
            assert_eq!(array_length(arr), 10);
            let mut populated = 0;
            for i in 0..10 {
                let e = *array_ref_cell(arr, i);
                if [1usize, 4, 8].contains(&i) {
                    assert!(!e.is_null());
                    assert!(region.contains(e));
                    populated += 1;
                } else {
                    assert!(e.is_null(), "null slots stay null");
                }
            }
            assert_eq!(populated, 3);
            assert_eq!(payload(*array_ref_cell(arr, 1)), 100);
            assert_eq!(payload(*array_ref_cell(arr, 4)), 101);
            assert_eq!(payload(*array_ref_cell(arr, 8)), 102);
        }
    }

    #[test]
    fn compaction_is_idempotent_without_mutation() {
        let mut region = Region::new(OS_PAGE_SIZE).expect("region");
        let class = node_class();
        let _garbage = alloc_obj(&mut region, class);
        let a = alloc_obj(&mut region, class);
        let b = alloc_obj(&mut region, class);
        // SAFETY: declared field.
        unsafe { write_ref(a, HEADER_SIZE, b) };

        let finals = FinalizerRegistry::default();
        let mut roots = root_set(&[(a, true)]);
        mark(&roots, &region, &finals);
        compact(&mut roots, &mut region, None, &finals);
        let first_a = roots.slots[0].value;
        let first_used = region.used();

        mark(&roots, &region, &finals);
        let second = compact(&mut roots, &mut region, None, &finals);

        assert_eq!(second.moved_objects, 0, "already packed");
        assert_eq!(roots.slots[0].value, first_a);
        assert_eq!(region.used(), first_used);
    }

    #[test]
    #[should_panic(expected = "immutable root slot")]
    fn moving_the_target_of_an_immutable_root_is_fatal() {
        let mut region = Region::new(OS_PAGE_SIZE).expect("region");
        let class = node_class();
        let _garbage = alloc_obj(&mut region, class);
        let pinned = alloc_obj(&mut region, class);

        let finals = FinalizerRegistry::default();
        let mut roots = root_set(&[(pinned, false)]);
        mark(&roots, &region, &finals);
        compact(&mut roots, &mut region, None, &finals);
    }

    #[test]
    fn immutable_root_is_fine_when_its_target_stays_put() {
        let mut region = Region::new(OS_PAGE_SIZE).expect("region");
        let class = node_class();
        let first = alloc_obj(&mut region, class);
        let _garbage = alloc_obj(&mut region, class);

        let finals = FinalizerRegistry::default();
        let mut roots = root_set(&[(first, false)]);
        mark(&roots, &region, &finals);
        compact(&mut roots, &mut region, None, &finals);
        assert_eq!(roots.slots[0].value, first);
    }

    #[test]
    fn growth_slides_survivors_into_the_new_region() {
        let mut region = Region::new(OS_PAGE_SIZE).expect("region");
        let class = node_class();
        let _garbage = alloc_obj(&mut region, class);
        let a = alloc_obj(&mut region, class);
        let b = alloc_obj(&mut region, class);
        set_payload(b, 7);
        // SAFETY: declared field.
        unsafe { write_ref(a, HEADER_SIZE, b) };

        let mut bigger = Region::new(4 * OS_PAGE_SIZE).expect("region");
        let finals = FinalizerRegistry::default();
        let mut roots = root_set(&[(a, true)]);
        mark(&roots, &region, &finals);
        let outcome =
            compact(&mut roots, &mut region, Some(&mut bigger), &finals);

        assert_eq!(outcome.live_bytes, 2 * class.instance_size);
        let new_a = roots.slots[0].value;
        assert!(bigger.contains(new_a));
        assert_eq!(bigger.used(), outcome.live_bytes);
        // SAFETY: relocated objects are live in the new region.
        unsafe {
            let new_b = read_ref(new_a, HEADER_SIZE);
            assert!(bigger.contains(new_b));
            assert_eq!(payload(new_b), 7);
        }
        drop(region);
    }

    fn noop_finalizer(_obj: *mut Header) {}

    #[test]
    fn finalizer_entries_track_relocated_objects() {
        let mut region = Region::new(OS_PAGE_SIZE).expect("region");
        let class = node_class();
        let _garbage = alloc_obj(&mut region, class);
        let z = alloc_obj(&mut region, class);

        let finals = FinalizerRegistry::default();
        finals.register(z, noop_finalizer);

        // Unreferenced: becomes reclaimable, force-marked, then relocated.
        let mut roots = root_set(&[]);
        mark(&roots, &region, &finals);
        compact(&mut roots, &mut region, None, &finals);

        let new_z = region.base() as *mut Header;
        assert_eq!(
            finals.state_of(new_z),
            Some(crate::finalizer::FinalState::Reclaimable),
            "entry follows the object to its new address"
        );
    }
}
