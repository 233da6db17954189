use crate::Header;

/// Cleanup hook a class may declare; invoked by the finalizer thread once
/// an instance has become otherwise unreachable.
pub type FinalizerFn = fn(*mut Header);

/// Declared type of a field or array element. Only `Reference` is
/// interesting to the collector; the primitive kinds exist so layout
/// descriptions read like the class files they come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Reference,
    Byte,
    Short,
    Int,
    Long,
    Float,
    Double,
}

impl FieldKind {
    #[inline]
    pub const fn size(self) -> usize {
        match self {
            FieldKind::Byte => 1,
            FieldKind::Short => 2,
            FieldKind::Int | FieldKind::Float => 4,
            FieldKind::Reference | FieldKind::Long | FieldKind::Double => 8,
        }
    }
}

/// A field declared by one class (not inherited). Offsets are byte offsets
/// from the start of the object, header included, as laid out by the class
/// loader. Static fields occupy no instance storage; they are kept in the
/// descriptor so tracing can filter them the same way the loader flags them.
#[derive(Debug, Clone)]
pub struct FieldDesc {
    pub name: &'static str,
    pub offset: usize,
    pub kind: FieldKind,
    pub is_static: bool,
}

impl FieldDesc {
    pub fn reference(name: &'static str, offset: usize) -> Self {
        Self { name, offset, kind: FieldKind::Reference, is_static: false }
    }

    pub fn primitive(name: &'static str, offset: usize, kind: FieldKind) -> Self {
        debug_assert!(kind != FieldKind::Reference);
        Self { name, offset, kind, is_static: false }
    }

    pub fn static_reference(name: &'static str) -> Self {
        Self { name, offset: 0, kind: FieldKind::Reference, is_static: true }
    }

    #[inline]
    pub fn is_traced(&self) -> bool {
        self.kind == FieldKind::Reference && !self.is_static
    }
}

/// Element layout of an array class.
#[derive(Debug, Clone, Copy)]
pub struct ArrayDesc {
    pub kind: FieldKind,
    pub stride: usize,
}

/// Class metadata as the collector sees it: enough to size an instance,
/// enumerate its reference cells, and find its finalizer. Descriptors are
/// produced by the class-loading subsystem and live for the whole VM run;
/// headers store raw pointers into them.
#[derive(Debug)]
pub struct ClassDesc {
    pub name: &'static str,
    pub super_class: Option<&'static ClassDesc>,
    pub fields: Vec<FieldDesc>,
    /// Instance byte size including the header, 8-byte aligned.
    /// For array classes this is the fixed prefix only.
    pub instance_size: usize,
    pub array: Option<ArrayDesc>,
    pub finalizer: Option<FinalizerFn>,
}

impl ClassDesc {
    pub fn object(
        name: &'static str,
        super_class: Option<&'static ClassDesc>,
        fields: Vec<FieldDesc>,
    ) -> Self {
        let mut size = super_class
            .map(|c| c.instance_size)
            .unwrap_or(crate::HEADER_SIZE);
        for f in &fields {
            if !f.is_static {
                size = size.max(f.offset + f.kind.size());
            }
        }
        Self {
            name,
            super_class,
            fields,
            instance_size: crate::align_object_size(size),
            array: None,
            finalizer: None,
        }
    }

    pub fn array_of(name: &'static str, elem: FieldKind) -> Self {
        Self {
            name,
            super_class: None,
            fields: Vec::new(),
            instance_size: crate::ARRAY_ELEMS_OFFSET,
            array: Some(ArrayDesc { kind: elem, stride: elem.size() }),
            finalizer: None,
        }
    }

    pub fn with_finalizer(mut self, finalizer: FinalizerFn) -> Self {
        self.finalizer = Some(finalizer);
        self
    }

    /// Hands the descriptor a VM lifetime. Class metadata is never unloaded.
    pub fn leak(self) -> &'static ClassDesc {
        Box::leak(Box::new(self))
    }

    #[inline]
    pub fn is_array(&self) -> bool {
        self.array.is_some()
    }

    /// Whether instances can hold heap references at all: a reference array,
    /// or any traced field declared anywhere in the hierarchy.
    pub fn has_reference_cells(&self) -> bool {
        if let Some(desc) = self.array {
            return desc.kind == FieldKind::Reference;
        }
        let mut current = Some(self);
        while let Some(class) = current {
            if class.fields.iter().any(FieldDesc::is_traced) {
                return true;
            }
            current = class.super_class;
        }
        false
    }
}
