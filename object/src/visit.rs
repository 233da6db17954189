use crate::{ClassDesc, FieldKind, Header, HeaderFlags};

pub const HEADER_SIZE: usize = size_of::<Header>();
/// Reference arrays store their element count right after the header.
pub const ARRAY_LENGTH_OFFSET: usize = HEADER_SIZE;
pub const ARRAY_ELEMS_OFFSET: usize = HEADER_SIZE + size_of::<usize>();

/// All heap storage is handed out in 8-byte steps.
#[inline(always)]
pub const fn align_object_size(size: usize) -> usize {
    (size + 7) & !7
}

/// Bytes an array instance occupies, header and length word included.
pub fn array_allocation_size(class: &ClassDesc, length: usize) -> usize {
    let desc = class.array.expect("array allocation of a non-array class");
    align_object_size(ARRAY_ELEMS_OFFSET + length * desc.stride)
}

/// Writes a fresh header into zeroed storage for an ordinary instance.
///
/// # Safety
/// `ptr` must point to at least `class.instance_size` zeroed bytes.
pub unsafe fn init_object(ptr: *mut u8, class: &'static ClassDesc) -> *mut Header {
    debug_assert!(!class.is_array());
    let mut flags = HeaderFlags::empty();
    if class.has_reference_cells() {
        flags |= HeaderFlags::REFERENCING;
    }
    let obj = ptr as *mut Header;
    // SAFETY: caller provides writable storage of instance size.
    unsafe { obj.write(Header::new(class, flags)) };
    obj
}

/// Writes a fresh header and length word for an array instance.
///
/// # Safety
/// `ptr` must point to at least `array_allocation_size(class, length)`
/// zeroed bytes.
pub unsafe fn init_array(
    ptr: *mut u8,
    class: &'static ClassDesc,
    length: usize,
) -> *mut Header {
    let mut flags = HeaderFlags::empty();
    if class.has_reference_cells() {
        flags |= HeaderFlags::REFERENCING;
    }
    let obj = ptr as *mut Header;
    // SAFETY: caller provides writable storage of the full array size.
    unsafe {
        obj.write(Header::new(class, flags));
        (ptr.add(ARRAY_LENGTH_OFFSET) as *mut usize).write(length);
    }
    obj
}

/// # Safety
/// `obj` must be a live array instance.
#[inline]
pub unsafe fn array_length(obj: *const Header) -> usize {
    // SAFETY: arrays always carry their length word.
    unsafe { *((obj as *const u8).add(ARRAY_LENGTH_OFFSET) as *const usize) }
}

/// Total byte size of the object, as laid out by its class.
///
/// # Safety
/// `obj` must point at a valid header.
pub unsafe fn object_size(obj: *const Header) -> usize {
    // SAFETY: header is valid per contract.
    let class = unsafe { (*obj).class() };
    match class.array {
        // SAFETY: array classes always have a length word.
        Some(_) => array_allocation_size(class, unsafe { array_length(obj) }),
        None => class.instance_size,
    }
}

/// Invokes `visitor` with the address of every reference cell in `obj`:
/// each element of a reference array, or each declared non-static reference
/// field of the class and all its superclasses. The collector reads through
/// these cells while marking and rewrites through the same cells while
/// compacting.
///
/// # Safety
/// `obj` must be a valid, live heap object.
pub unsafe fn visit_edges(
    obj: *mut Header,
    visitor: &mut dyn FnMut(*mut *mut Header),
) {
    // SAFETY: header is valid per contract.
    let class = unsafe { (*obj).class() };
    let base = obj as *mut u8;

    if let Some(desc) = class.array {
        if desc.kind != FieldKind::Reference {
            return;
        }
        // SAFETY: arrays carry a length word, elements follow it.
        let length = unsafe { array_length(obj) };
        for i in 0..length {
            // SAFETY: i is within the allocated element range.
            let cell = unsafe {
                base.add(ARRAY_ELEMS_OFFSET + i * desc.stride)
                    as *mut *mut Header
            };
            visitor(cell);
        }
        return;
    }

    let mut current = Some(class);
    while let Some(class) = current {
        for field in &class.fields {
            if !field.is_traced() {
                continue;
            }
            // SAFETY: traced offsets lie inside instance_size.
            let cell =
                unsafe { base.add(field.offset) as *mut *mut Header };
            visitor(cell);
        }
        current = class.super_class;
    }
}

/// # Safety
/// `offset` must be a field offset inside the object.
#[inline]
pub unsafe fn read_ref(obj: *const Header, offset: usize) -> *mut Header {
    // SAFETY: per contract.
    unsafe { *((obj as *const u8).add(offset) as *const *mut Header) }
}

/// # Safety
/// `offset` must be a reference-field offset inside the object.
#[inline]
pub unsafe fn write_ref(obj: *mut Header, offset: usize, value: *mut Header) {
    // SAFETY: per contract.
    unsafe { *((obj as *mut u8).add(offset) as *mut *mut Header) = value };
}

/// # Safety
/// `obj` must be a reference array and `index` in bounds.
#[inline]
pub unsafe fn array_ref_cell(obj: *mut Header, index: usize) -> *mut *mut Header {
    // SAFETY: per contract.
    unsafe {
        (obj as *mut u8).add(ARRAY_ELEMS_OFFSET + index * size_of::<usize>())
            as *mut *mut Header
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FieldDesc;

    fn alloc_zeroed(size: usize) -> *mut u8 {
        let words = size.div_ceil(8);
        Box::leak(vec![0u64; words].into_boxed_slice()).as_mut_ptr()
            as *mut u8
    }

    #[test]
    fn object_size_of_plain_instance_is_class_size() {
        let class = ClassDesc::object(
            "Pair",
            None,
            vec![
                FieldDesc::reference("first", HEADER_SIZE),
                FieldDesc::reference("second", HEADER_SIZE + 8),
            ],
        )
        .leak();
        let storage = alloc_zeroed(class.instance_size);
        let obj = unsafe { init_object(storage, class) };
        assert_eq!(unsafe { object_size(obj) }, class.instance_size);
        assert!(unsafe { (*obj).may_reference() });
    }

    #[test]
    fn array_size_accounts_for_length_and_stride() {
        let class = ClassDesc::array_of("[Object", FieldKind::Reference).leak();
        let storage = alloc_zeroed(array_allocation_size(class, 5));
        let arr = unsafe { init_array(storage, class, 5) };
        assert_eq!(unsafe { array_length(arr) }, 5);
        assert_eq!(
            unsafe { object_size(arr) },
            ARRAY_ELEMS_OFFSET + 5 * 8
        );
    }

    #[test]
    fn visit_edges_walks_fields_including_superclass() {
        let base = ClassDesc::object(
            "Node",
            None,
            vec![FieldDesc::reference("next", HEADER_SIZE)],
        )
        .leak();
        let sub = ClassDesc::object(
            "TaggedNode",
            Some(base),
            vec![
                FieldDesc::primitive(
                    "tag",
                    base.instance_size,
                    FieldKind::Long,
                ),
                FieldDesc::reference("extra", base.instance_size + 8),
            ],
        )
        .leak();

        let storage = alloc_zeroed(sub.instance_size);
        let obj = unsafe { init_object(storage, sub) };

        let mut offsets = Vec::new();
        unsafe {
            visit_edges(obj, &mut |cell| {
                offsets.push(cell as usize - obj as usize);
            });
        }
        // Declaring class first, then the superclass chain.
        assert_eq!(offsets, vec![base.instance_size + 8, HEADER_SIZE]);
    }

    #[test]
    fn visit_edges_covers_every_array_slot() {
        let class = ClassDesc::array_of("[Object", FieldKind::Reference).leak();
        let storage = alloc_zeroed(array_allocation_size(class, 3));
        let arr = unsafe { init_array(storage, class, 3) };

        let mut count = 0;
        let mut visitor = |cell: *mut *mut Header| {
            // SAFETY: enumerated cells lie inside the array.
            assert!(unsafe { (*cell).is_null() }, "fresh slots start out null");
            count += 1;
        };
        unsafe { visit_edges(arr, &mut visitor) };
        assert_eq!(count, 3);
    }

    #[test]
    fn primitive_arrays_and_plain_data_have_no_edges() {
        let bytes = ClassDesc::array_of("[B", FieldKind::Byte).leak();
        let storage = alloc_zeroed(array_allocation_size(bytes, 16));
        let arr = unsafe { init_array(storage, bytes, 16) };
        assert!(!unsafe { (*arr).may_reference() });

        let mut visited = false;
        unsafe { visit_edges(arr, &mut |_| visited = true) };
        assert!(!visited, "byte arrays must not produce edges");
    }

    #[test]
    fn ref_accessors_round_trip() {
        let class = ClassDesc::object(
            "Holder",
            None,
            vec![FieldDesc::reference("value", HEADER_SIZE)],
        )
        .leak();
        let a = unsafe { init_object(alloc_zeroed(class.instance_size), class) };
        let b = unsafe { init_object(alloc_zeroed(class.instance_size), class) };

        unsafe { write_ref(a, HEADER_SIZE, b) };
        assert_eq!(unsafe { read_ref(a, HEADER_SIZE) }, b);
    }
}
