mod class;
mod header;
mod visit;

pub use class::{ArrayDesc, ClassDesc, FieldDesc, FieldKind, FinalizerFn};
pub use header::{Header, HeaderFlags};
pub use visit::{
    ARRAY_ELEMS_OFFSET, ARRAY_LENGTH_OFFSET, HEADER_SIZE,
    align_object_size, array_allocation_size, array_length, array_ref_cell,
    init_array, init_object, object_size, read_ref, visit_edges, write_ref,
};
