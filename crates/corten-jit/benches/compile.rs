//! Compile-latency benchmarks. Tier-0 lives or dies on how fast a method
//! body turns into runnable code, so the benchmark measures compilation,
//! not the emitted code.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use corten_jit::compile::{compile, MethodDesc};
use corten_jit::il::opcodes as op;
use corten_jit::resolve::{
    FieldResolver, MethodResolver, Resolvers, StringResolver, TypeResolver,
};
use corten_jit::runtime::helpers::RuntimeHelpers;

struct NoResolvers;

impl MethodResolver for NoResolvers {
    fn resolve_method(&self, _token: u32) -> Option<corten_jit::resolve::ResolvedMethod> {
        None
    }
}

impl TypeResolver for NoResolvers {
    fn resolve_type(&self, _token: u32) -> Option<corten_jit::resolve::ResolvedType> {
        None
    }
}

impl FieldResolver for NoResolvers {
    fn resolve_field(&self, _token: u32) -> Option<corten_jit::resolve::ResolvedField> {
        None
    }
}

impl StringResolver for NoResolvers {
    fn resolve_string(&self, _token: u32) -> Option<usize> {
        None
    }
}

unsafe extern "win64" fn unreachable_alloc(_a: usize) -> usize {
    unreachable!()
}

unsafe extern "win64" fn unreachable_alloc2(_a: usize, _b: i64) -> usize {
    unreachable!()
}

unsafe extern "win64" fn unreachable_alloc4(_a: usize, _b: i64, _c: i64, _d: i64) -> usize {
    unreachable!()
}

unsafe extern "win64" fn unreachable_cast(_a: usize, _b: usize) -> i32 {
    unreachable!()
}

unsafe extern "win64" fn unreachable_iface(_a: usize, _b: usize, _c: u32) -> usize {
    unreachable!()
}

unsafe extern "win64" fn noop_ensure(_a: u32, _b: u32) {}

unsafe extern "win64" fn noop_ensure_slot(_a: usize, _b: u32) {}

unsafe extern "win64" fn unreachable_throw(_a: usize) -> ! {
    unreachable!()
}

unsafe extern "win64" fn unreachable_rethrow() -> ! {
    unreachable!()
}

static HELPERS: RuntimeHelpers = RuntimeHelpers {
    new_fast: unreachable_alloc,
    new_array: unreachable_alloc2,
    new_md_array: unreachable_alloc4,
    is_assignable_to: unreachable_cast,
    get_interface_method: unreachable_iface,
    ensure_compiled: noop_ensure,
    ensure_vtable_slot: noop_ensure_slot,
    throw: unreachable_throw,
    rethrow: unreachable_rethrow,
};

/// sum = 0; for (i = 0; i < n; i++) sum += i; return sum;
fn counting_loop_il() -> Vec<u8> {
    vec![
        op::LDC_I4_0,       // 0
        op::STLOC_0,        // 1
        op::LDC_I4_0,       // 2
        op::STLOC_1,        // 3
        op::BR_S, 0x08,     // 4 -> 14
        op::LDLOC_0,        // 6
        op::LDLOC_1,        // 7
        op::ADD,            // 8
        op::STLOC_0,        // 9
        op::LDLOC_1,        // 10
        op::LDC_I4_1,       // 11
        op::ADD,            // 12
        op::STLOC_1,        // 13
        op::LDLOC_1,        // 14
        op::LDARG_0,        // 15
        op::BLT_S, 0xF4,    // 16 -> 6
        op::LDLOC_0,        // 18
        op::RET,            // 19
    ]
}

fn bench_compile(c: &mut Criterion) {
    let il = counting_loop_il();
    let local_is_vt = [false, false];
    let local_size = [4u16, 4];
    let arg_is_vt = [false];
    let arg_size = [4u16];
    let arg_float = [0u8];

    c.bench_function("compile_counting_loop", |b| {
        b.iter(|| {
            let desc = MethodDesc {
                il: black_box(il.as_slice()),
                arg_count: 1,
                local_count: 2,
                local_is_value_type: &local_is_vt,
                local_type_size: &local_size,
                arg_is_value_type: &arg_is_vt,
                arg_type_size: &arg_size,
                arg_float_kind: &arg_float,
                return_is_value_type: false,
                return_type_size: 4,
                return_float_kind: 0,
                gc_ref_mask: 0,
                method_token: 0,
                assembly_id: 0,
            };
            let resolvers = Resolvers {
                method: &NoResolvers,
                ty: &NoResolvers,
                field: &NoResolvers,
                string: &NoResolvers,
            };
            compile(&desc, resolvers, &HELPERS).expect("compilation failed")
        })
    });
}

criterion_group!(benches, bench_compile);
criterion_main!(benches);
