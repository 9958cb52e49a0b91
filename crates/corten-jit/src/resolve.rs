//! Lazy-resolution interfaces between the compiler and the host runtime.
//!
//! The four resolvers are pure query functions: token in, plain-value
//! record out. They are free to block on metadata I/O or to trigger nested
//! compilations of other methods; the compiler only assumes they return a
//! final answer synchronously. A `None` aborts the compilation.

/// How a call's return value travels back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReturnKind {
    #[default]
    Void,
    /// EAX, sign-extended to RAX on the caller side.
    Int32,
    Int64,
    IntPtr,
    /// XMM0, bit pattern moved to a GPR slot on the eval stack.
    Float32,
    Float64,
    /// RAX (<= 8 bytes), RDX:RAX (9..=16), or a hidden buffer (> 16).
    Struct,
}

/// Inline expansions the resolver may request instead of a real call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Intrinsic {
    #[default]
    None,
    /// `Activator.CreateInstance<T>()`
    CreateInstance,
    /// `RuntimeHelpers.InitializeArray(array, fieldHandle)`
    InitializeArray,
    /// Delegate constructor `(object, fnptr)`.
    DelegateCtor,
    /// `Delegate.Invoke(...)`
    DelegateInvoke,
    MdArrayGet,
    MdArraySet,
    MdArrayAddress,
    MdArrayCtor,
    /// `Equals` on a primitive value type under a `constrained.` prefix;
    /// lowered to an inline MethodTable-and-value comparison.
    PrimitiveEquals,
}

/// Everything the compiler needs to lower a call to one method.
#[derive(Debug, Clone, Default)]
pub struct ResolvedMethod {
    /// Entry address; 0 while the target is still being compiled.
    pub native_code: usize,
    /// Address of the method's registry entry; its first word is the
    /// native-code forwarding slot used when `native_code` is 0.
    pub registry_entry: usize,
    pub method_token: u32,
    pub assembly_id: u32,

    /// Declared argument count, not counting `this`.
    pub arg_count: u16,
    pub has_this: bool,
    /// Float kind per declared argument: 0 = integer/pointer, 4, or 8.
    pub arg_float_kind: Vec<u8>,
    pub return_kind: ReturnKind,
    /// Struct size when `return_kind` is `Struct`.
    pub return_struct_size: u32,

    pub is_virtual: bool,
    pub vtable_slot: u32,
    /// MethodTable of the declaring type (vtable base, ctor allocation).
    pub declaring_method_table: usize,
    pub declaring_is_value_type: bool,
    pub declaring_type_size: u32,

    /// Non-zero for interface dispatch.
    pub interface_method_table: usize,
    pub interface_method_index: u32,

    pub intrinsic: Intrinsic,
    /// CreateInstance: MethodTable of T.
    pub intrinsic_method_table: usize,
    /// CreateInstance: native address of T's default ctor, 0 if none.
    pub intrinsic_ctor: usize,
    /// CreateInstance: whether T is a value type, and its size.
    pub intrinsic_type_is_value: bool,
    pub intrinsic_type_size: u32,
    /// Element size for the rank-N array Get/Set/Address intrinsics.
    pub element_size: u32,

    pub is_vararg: bool,
    /// MethodTable per variadic argument, for the TypedReference array.
    pub vararg_method_tables: Vec<usize>,
}

impl ResolvedMethod {
    /// Physical argument count: declared args plus `this` plus the hidden
    /// return buffer for large struct returns.
    pub fn physical_arg_count(&self) -> u16 {
        self.arg_count
            + self.has_this as u16
            + self.needs_return_buffer() as u16
            + self.vararg_method_tables.len() as u16
    }

    pub fn needs_return_buffer(&self) -> bool {
        self.return_kind == ReturnKind::Struct && self.return_struct_size > 16
    }
}

/// Field access description.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResolvedField {
    /// Byte offset within the object, after the MethodTable pointer.
    pub offset: u32,
    /// Access width: 1, 2, 4, or 8.
    pub size: u8,
    /// Sign-extend on load (i1/i2/i4 fields).
    pub signed: bool,
    pub is_static: bool,
    /// Absolute address of the static storage.
    pub static_address: usize,
    pub is_gc_ref: bool,
    /// The declaring type is a value type of this size.
    pub declaring_is_value_type: bool,
    pub declaring_size: u32,
    /// The field's own type is a value type (struct-typed field).
    pub field_is_value_type: bool,
    pub field_value_size: u32,
    /// For static-constructor triggering.
    pub declaring_token: u32,
    pub assembly_id: u32,
}

/// Type description for allocation, boxing, casts, and element access.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResolvedType {
    pub method_table: usize,
    pub is_value_type: bool,
    pub size: u32,
    /// MethodTable of the SZ-array type with this element type (`newarr`).
    pub array_method_table: usize,
    pub is_nullable: bool,
    pub nullable_value_offset: u32,
    pub nullable_inner_method_table: usize,
    pub nullable_inner_size: u32,
}

/// Pre-parsed StandAloneSig for `calli`.
#[derive(Debug, Clone, Default)]
pub struct ResolvedSignature {
    pub arg_count: u16,
    pub has_this: bool,
    pub arg_float_kind: Vec<u8>,
    pub return_kind: ReturnKind,
    pub return_struct_size: u32,
}

pub trait MethodResolver {
    fn resolve_method(&self, token: u32) -> Option<ResolvedMethod>;

    /// Resolve a StandAloneSig token for an indirect call.
    fn resolve_signature(&self, token: u32) -> Option<ResolvedSignature> {
        let _ = token;
        None
    }
}

pub trait TypeResolver {
    fn resolve_type(&self, token: u32) -> Option<ResolvedType>;
}

pub trait FieldResolver {
    fn resolve_field(&self, token: u32) -> Option<ResolvedField>;

    /// Address of a field's static data blob (`ldtoken` on RVA fields,
    /// consumed by `RuntimeHelpers.InitializeArray`). 0 when absent.
    fn static_data_address(&self, token: u32) -> usize {
        let _ = token;
        0
    }
}

pub trait StringResolver {
    /// Address of the interned string object for a user-string token.
    fn resolve_string(&self, token: u32) -> Option<usize>;
}

/// The four resolver callbacks bundled for a compilation.
#[derive(Clone, Copy)]
pub struct Resolvers<'a> {
    pub method: &'a dyn MethodResolver,
    pub ty: &'a dyn TypeResolver,
    pub field: &'a dyn FieldResolver,
    pub string: &'a dyn StringResolver,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_physical_arg_count() {
        let mut m = ResolvedMethod {
            arg_count: 2,
            has_this: true,
            ..Default::default()
        };
        assert_eq!(m.physical_arg_count(), 3);

        m.return_kind = ReturnKind::Struct;
        m.return_struct_size = 24;
        assert!(m.needs_return_buffer());
        assert_eq!(m.physical_arg_count(), 4);

        m.return_struct_size = 16;
        assert!(!m.needs_return_buffer());
    }
}
