//! Shared scaffolding for the end-to-end tests: canned resolvers, stub
//! runtime helpers, and a method-description builder.

#![allow(dead_code)]

use std::collections::HashMap;

use corten_jit::compile::MethodDesc;
use corten_jit::resolve::{
    FieldResolver, MethodResolver, ResolvedField, ResolvedMethod, ResolvedSignature, ResolvedType,
    Resolvers, StringResolver, TypeResolver,
};
use corten_jit::runtime::helpers::RuntimeHelpers;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Token-keyed test resolvers.
#[derive(Default)]
pub struct TestResolvers {
    pub methods: HashMap<u32, ResolvedMethod>,
    pub signatures: HashMap<u32, ResolvedSignature>,
    pub types: HashMap<u32, ResolvedType>,
    pub fields: HashMap<u32, ResolvedField>,
    pub static_data: HashMap<u32, usize>,
    pub strings: HashMap<u32, usize>,
}

impl TestResolvers {
    pub fn new() -> TestResolvers {
        TestResolvers::default()
    }

    pub fn resolvers(&self) -> Resolvers<'_> {
        Resolvers { method: self, ty: self, field: self, string: self }
    }
}

impl MethodResolver for TestResolvers {
    fn resolve_method(&self, token: u32) -> Option<ResolvedMethod> {
        self.methods.get(&token).cloned()
    }

    fn resolve_signature(&self, token: u32) -> Option<ResolvedSignature> {
        self.signatures.get(&token).cloned()
    }
}

impl TypeResolver for TestResolvers {
    fn resolve_type(&self, token: u32) -> Option<ResolvedType> {
        self.types.get(&token).copied()
    }
}

impl FieldResolver for TestResolvers {
    fn resolve_field(&self, token: u32) -> Option<ResolvedField> {
        self.fields.get(&token).copied()
    }

    fn static_data_address(&self, token: u32) -> usize {
        self.static_data.get(&token).copied().unwrap_or(0)
    }
}

impl StringResolver for TestResolvers {
    fn resolve_string(&self, token: u32) -> Option<usize> {
        self.strings.get(&token).copied()
    }
}

// ---- stub heap and runtime services ----

fn leak_zeroed(bytes: usize) -> usize {
    let block: Box<[u8]> = vec![0u8; bytes].into_boxed_slice();
    Box::leak(block).as_mut_ptr() as usize
}

unsafe extern "win64" fn stub_new_fast(method_table: usize) -> usize {
    let object = leak_zeroed(128);
    unsafe { *(object as *mut usize) = method_table };
    object
}

unsafe extern "win64" fn stub_new_array(method_table: usize, length: i64) -> usize {
    let component = unsafe { *(method_table as *const u16) }.max(1) as usize;
    let array = leak_zeroed(16 + component * length as usize);
    unsafe {
        *(array as *mut usize) = method_table;
        *((array + 8) as *mut i64) = length;
    }
    array
}

unsafe extern "win64" fn stub_new_md_array(method_table: usize, d0: i64, d1: i64, d2: i64) -> usize {
    let component = unsafe { *(method_table as *const u16) }.max(1) as usize;
    let count = (d0.max(1) * d1.max(1) * d2.max(1)) as usize;
    let array = leak_zeroed(16 + 24 + component * count);
    unsafe {
        *(array as *mut usize) = method_table;
        *((array + 16) as *mut i32) = d0 as i32;
        *((array + 20) as *mut i32) = d1 as i32;
        *((array + 24) as *mut i32) = d2 as i32;
    }
    array
}

unsafe extern "win64" fn stub_is_assignable_to(object_mt: usize, target_mt: usize) -> i32 {
    (object_mt == target_mt) as i32
}

unsafe extern "win64" fn stub_get_interface_method(_this: usize, _iface: usize, _index: u32) -> usize {
    0
}

unsafe extern "win64" fn stub_ensure_compiled(_token: u32, _assembly: u32) {}

unsafe extern "win64" fn stub_ensure_vtable_slot(_this: usize, _slot: u32) {}

unsafe extern "win64" fn stub_throw(_exception: usize) -> ! {
    std::process::abort()
}

unsafe extern "win64" fn stub_rethrow() -> ! {
    std::process::abort()
}

static HELPERS: RuntimeHelpers = RuntimeHelpers {
    new_fast: stub_new_fast,
    new_array: stub_new_array,
    new_md_array: stub_new_md_array,
    is_assignable_to: stub_is_assignable_to,
    get_interface_method: stub_get_interface_method,
    ensure_compiled: stub_ensure_compiled,
    ensure_vtable_slot: stub_ensure_vtable_slot,
    throw: stub_throw,
    rethrow: stub_rethrow,
};

pub fn helpers() -> &'static RuntimeHelpers {
    &HELPERS
}

// ---- method description builder ----

/// Owns the slices a [`MethodDesc`] borrows.
pub struct MethodSpec {
    pub il: Vec<u8>,
    pub arg_is_vt: Vec<bool>,
    pub arg_size: Vec<u16>,
    pub arg_float: Vec<u8>,
    pub local_is_vt: Vec<bool>,
    pub local_size: Vec<u16>,
    pub ret_vt: bool,
    pub ret_size: u16,
    pub ret_float: u8,
    pub gc_mask: u64,
    pub token: u32,
    pub assembly: u32,
}

impl MethodSpec {
    pub fn new(il: Vec<u8>) -> MethodSpec {
        MethodSpec {
            il,
            arg_is_vt: Vec::new(),
            arg_size: Vec::new(),
            arg_float: Vec::new(),
            local_is_vt: Vec::new(),
            local_size: Vec::new(),
            ret_vt: false,
            ret_size: 0,
            ret_float: 0,
            gc_mask: 0,
            token: 0,
            assembly: 0,
        }
    }

    pub fn arg_i32(mut self) -> Self {
        self.arg_is_vt.push(false);
        self.arg_size.push(4);
        self.arg_float.push(0);
        self
    }

    pub fn arg_ptr(mut self) -> Self {
        self.arg_is_vt.push(false);
        self.arg_size.push(8);
        self.arg_float.push(0);
        self
    }

    pub fn arg_f64(mut self) -> Self {
        self.arg_is_vt.push(false);
        self.arg_size.push(8);
        self.arg_float.push(8);
        self
    }

    pub fn locals_i32(mut self, count: usize) -> Self {
        for _ in 0..count {
            self.local_is_vt.push(false);
            self.local_size.push(4);
        }
        self
    }

    pub fn local_ptr(mut self) -> Self {
        self.local_is_vt.push(false);
        self.local_size.push(8);
        self
    }

    pub fn ret_i32(mut self) -> Self {
        self.ret_vt = false;
        self.ret_size = 4;
        self.ret_float = 0;
        self
    }

    pub fn ret_i64(mut self) -> Self {
        self.ret_size = 8;
        self
    }

    pub fn ret_f64(mut self) -> Self {
        self.ret_size = 8;
        self.ret_float = 8;
        self
    }

    pub fn gc_mask(mut self, mask: u64) -> Self {
        self.gc_mask = mask;
        self
    }

    pub fn token(mut self, token: u32) -> Self {
        self.token = token;
        self
    }

    pub fn desc(&self) -> MethodDesc<'_> {
        MethodDesc {
            il: &self.il,
            arg_count: self.arg_size.len() as u16,
            local_count: self.local_size.len() as u16,
            local_is_value_type: &self.local_is_vt,
            local_type_size: &self.local_size,
            arg_is_value_type: &self.arg_is_vt,
            arg_type_size: &self.arg_size,
            arg_float_kind: &self.arg_float,
            return_is_value_type: self.ret_vt,
            return_type_size: self.ret_size,
            return_float_kind: self.ret_float,
            gc_ref_mask: self.gc_mask,
            method_token: self.token,
            assembly_id: self.assembly,
        }
    }
}

/// A MethodTable stand-in with a component size and one vtable slot.
#[repr(C)]
pub struct FakeMethodTable {
    pub component_size: u16,
    pub pad: [u8; 22],
    pub vtable: [usize; 4],
}

impl FakeMethodTable {
    pub fn leak(component_size: u16) -> &'static mut FakeMethodTable {
        Box::leak(Box::new(FakeMethodTable {
            component_size,
            pad: [0; 22],
            vtable: [0; 4],
        }))
    }

    pub fn address(&self) -> usize {
        self as *const FakeMethodTable as usize
    }
}
