//! End-to-end: compile IL method bodies and execute the emitted x86-64
//! code through `extern "win64"` function pointers.

#![cfg(all(target_arch = "x86_64", unix))]

mod common;

use common::{helpers, init_logging, FakeMethodTable, MethodSpec, TestResolvers};
use corten_jit::compile::{compile, CompiledMethod};
use corten_jit::il::opcodes as op;
use corten_jit::resolve::{Intrinsic, ResolvedMethod, ResolvedType, ReturnKind};
use corten_jit::runtime::MethodRegistry;

fn compile_or_die(spec: &MethodSpec, resolvers: &TestResolvers) -> CompiledMethod {
    init_logging();
    compile(&spec.desc(), resolvers.resolvers(), helpers()).expect("compilation failed")
}

#[test]
fn test_sum_of_three_args() {
    let il = vec![op::LDARG_0, op::LDARG_1, op::ADD, op::LDARG_2, op::ADD, op::RET];
    let spec = MethodSpec::new(il).arg_i32().arg_i32().arg_i32().ret_i32();
    let resolvers = TestResolvers::new();
    let compiled = compile_or_die(&spec, &resolvers);

    // Prologue shape: push rbp; mov rbp, rsp; sub rsp, imm.
    let code = compiled.code_bytes();
    assert_eq!(code[0], 0x55);
    assert_eq!(&code[1..4], &[0x48, 0x89, 0xE5]);
    assert_eq!(code[4], 0x48);
    assert!(code[5] == 0x81 || code[5] == 0x83);
    assert!(compiled.stack_adjust >= 32);
    assert_eq!(compiled.safe_point_count(), 0);

    let f: unsafe extern "win64" fn(i32, i32, i32) -> i32 =
        unsafe { std::mem::transmute(compiled.entry()) };
    assert_eq!(unsafe { f(2, 3, 4) }, 9);
    assert_eq!(unsafe { f(-10, 5, 5) }, 0);
}

#[test]
fn test_signed_less_than_on_negative() {
    // ldc.i4.m1; ldc.i4.0; blt.s +2; ldc.i4.0; ret; ldc.i4.1; ret
    let il = vec![
        op::LDC_I4_M1,
        op::LDC_I4_0,
        op::BLT_S,
        0x02,
        op::LDC_I4_0,
        op::RET,
        op::LDC_I4_1,
        op::RET,
    ];
    let spec = MethodSpec::new(il).ret_i32();
    let resolvers = TestResolvers::new();
    let compiled = compile_or_die(&spec, &resolvers);
    let f: unsafe extern "win64" fn() -> i32 = unsafe { std::mem::transmute(compiled.entry()) };
    assert_eq!(unsafe { f() }, 1);
}

#[test]
fn test_unsigned_division() {
    // ldc.i4 0xFFFFFFFE; ldc.i4.2; div.un; ret
    let il = vec![op::LDC_I4, 0xFE, 0xFF, 0xFF, 0xFF, op::LDC_I4_2, op::DIV_UN, op::RET];
    let spec = MethodSpec::new(il).ret_i32();
    let resolvers = TestResolvers::new();
    let compiled = compile_or_die(&spec, &resolvers);
    let f: unsafe extern "win64" fn() -> i32 = unsafe { std::mem::transmute(compiled.entry()) };
    assert_eq!(unsafe { f() } as u32, 0x7FFF_FFFF);
}

#[test]
fn test_signed_division_and_remainder() {
    // ldarg.0; ldarg.1; div; ldarg.0; ldarg.1; rem; add; ret
    let il = vec![
        op::LDARG_0,
        op::LDARG_1,
        op::DIV,
        op::LDARG_0,
        op::LDARG_1,
        op::REM,
        op::ADD,
        op::RET,
    ];
    let spec = MethodSpec::new(il).arg_i32().arg_i32().ret_i32();
    let resolvers = TestResolvers::new();
    let compiled = compile_or_die(&spec, &resolvers);
    let f: unsafe extern "win64" fn(i32, i32) -> i32 = unsafe { std::mem::transmute(compiled.entry()) };
    assert_eq!(unsafe { f(17, 5) }, 3 + 2);
    assert_eq!(unsafe { f(-17, 5) }, -3 + -2);
}

#[test]
fn test_array_sum_loop() {
    const TOKEN_I32: u32 = 0x0100_0001;
    let element_mt = FakeMethodTable::leak(4);

    // int[] a = new int[3]; a[0]=10; a[1]=20; a[2]=30;
    // sum = 0; for (i = 0; i < 3; i++) sum += a[i]; return sum;
    let il = vec![
        op::LDC_I4_3,                         // 0
        op::NEWARR, 0x01, 0x00, 0x00, 0x01,   // 1
        op::STLOC_0,                          // 6
        op::LDLOC_0,                          // 7
        op::LDC_I4_0,                         // 8
        op::LDC_I4_S, 10,                     // 9
        op::STELEM_I4,                        // 11
        op::LDLOC_0,                          // 12
        op::LDC_I4_1,                         // 13
        op::LDC_I4_S, 20,                     // 14
        op::STELEM_I4,                        // 16
        op::LDLOC_0,                          // 17
        op::LDC_I4_2,                         // 18
        op::LDC_I4_S, 30,                     // 19
        op::STELEM_I4,                        // 21
        op::LDC_I4_0,                         // 22
        op::STLOC_2,                          // 23
        op::LDC_I4_0,                         // 24
        op::STLOC_1,                          // 25
        op::BR_S, 10,                         // 26 -> 38
        op::LDLOC_2,                          // 28
        op::LDLOC_0,                          // 29
        op::LDLOC_1,                          // 30
        op::LDELEM_I4,                        // 31
        op::ADD,                              // 32
        op::STLOC_2,                          // 33
        op::LDLOC_1,                          // 34
        op::LDC_I4_1,                         // 35
        op::ADD,                              // 36
        op::STLOC_1,                          // 37
        op::LDLOC_1,                          // 38
        op::LDC_I4_3,                         // 39
        op::BLT_S, 0xF2,                      // 40 -> 28 (-14)
        op::LDLOC_2,                          // 42
        op::RET,                              // 43
    ];
    let spec = MethodSpec::new(il).local_ptr().locals_i32(2).ret_i32();
    let mut resolvers = TestResolvers::new();
    resolvers.types.insert(
        TOKEN_I32,
        ResolvedType {
            method_table: element_mt.address(),
            is_value_type: true,
            size: 4,
            array_method_table: element_mt.address(),
            ..Default::default()
        },
    );
    let compiled = compile_or_die(&spec, &resolvers);
    // One allocation call, one safe point.
    assert_eq!(compiled.safe_point_count(), 1);
    let f: unsafe extern "win64" fn() -> i32 = unsafe { std::mem::transmute(compiled.entry()) };
    assert_eq!(unsafe { f() }, 60);
}

#[test]
fn test_direct_call_between_compiled_methods() {
    // Callee: (a, b) -> a * b
    let callee_il = vec![op::LDARG_0, op::LDARG_1, op::MUL, op::RET];
    let callee_spec = MethodSpec::new(callee_il).arg_i32().arg_i32().ret_i32();
    let resolvers = TestResolvers::new();
    let callee = compile_or_die(&callee_spec, &resolvers);

    const TOKEN_CALLEE: u32 = 0x0600_0002;
    let mut resolvers = TestResolvers::new();
    resolvers.methods.insert(
        TOKEN_CALLEE,
        ResolvedMethod {
            native_code: callee.entry() as usize,
            arg_count: 2,
            arg_float_kind: vec![0, 0],
            return_kind: ReturnKind::Int32,
            ..Default::default()
        },
    );

    // Caller: f(x) = callee(x, 7) + 1
    let caller_il = vec![
        op::LDARG_0,
        op::LDC_I4_7,
        op::CALL, 0x02, 0x00, 0x00, 0x06,
        op::LDC_I4_1,
        op::ADD,
        op::RET,
    ];
    let caller_spec = MethodSpec::new(caller_il).arg_i32().ret_i32();
    let caller = compile_or_die(&caller_spec, &resolvers);
    assert_eq!(caller.safe_point_count(), 1);

    let f: unsafe extern "win64" fn(i32) -> i32 = unsafe { std::mem::transmute(caller.entry()) };
    assert_eq!(unsafe { f(6) }, 43);
}

#[test]
fn test_call_through_registry_forwarding_slot() {
    const TOKEN: u32 = 0x0600_0077;
    const ASSEMBLY: u32 = 3;

    // Reserve the registry entry first so the caller compiles an
    // indirect call through the (still empty) forwarding slot.
    let entry = MethodRegistry::global().entry(ASSEMBLY, TOKEN);

    let mut resolvers = TestResolvers::new();
    resolvers.methods.insert(
        TOKEN,
        ResolvedMethod {
            native_code: 0,
            registry_entry: entry.address(),
            method_token: TOKEN,
            assembly_id: ASSEMBLY,
            arg_count: 1,
            arg_float_kind: vec![0],
            return_kind: ReturnKind::Int32,
            ..Default::default()
        },
    );
    let caller_il = vec![op::LDC_I4_8, op::CALL, 0x77, 0x00, 0x00, 0x06, op::RET];
    let caller_spec = MethodSpec::new(caller_il).ret_i32();
    let caller = compile_or_die(&caller_spec, &resolvers);

    // Now compile the callee; publishing fills the forwarding slot the
    // emitted code loads through.
    let callee_il = vec![op::LDARG_0, op::LDARG_0, op::ADD, op::RET];
    let callee_spec = MethodSpec::new(callee_il).arg_i32().ret_i32().token(TOKEN);
    let mut callee_spec = callee_spec;
    callee_spec.assembly = ASSEMBLY;
    let resolvers2 = TestResolvers::new();
    let _callee = compile_or_die(&callee_spec, &resolvers2);
    assert!(entry.is_compiled());

    let f: unsafe extern "win64" fn() -> i32 = unsafe { std::mem::transmute(caller.entry()) };
    assert_eq!(unsafe { f() }, 16);
}

#[test]
fn test_virtual_dispatch_two_type_hierarchy() {
    // Two leaf methods occupying vtable slot 0.
    let base_il = vec![op::LDC_I4_1, op::RET];
    let derived_il = vec![op::LDC_I4_2, op::RET];
    let empty = TestResolvers::new();
    let base_method = compile_or_die(&MethodSpec::new(base_il).arg_ptr().ret_i32(), &empty);
    let derived_method = compile_or_die(&MethodSpec::new(derived_il).arg_ptr().ret_i32(), &empty);

    let base_mt = FakeMethodTable::leak(0);
    base_mt.vtable[0] = base_method.entry() as usize;
    let derived_mt = FakeMethodTable::leak(0);
    derived_mt.vtable[0] = derived_method.entry() as usize;

    const TOKEN: u32 = 0x0600_0010;
    let mut resolvers = TestResolvers::new();
    resolvers.methods.insert(
        TOKEN,
        ResolvedMethod {
            native_code: base_method.entry() as usize,
            has_this: true,
            is_virtual: true,
            vtable_slot: 0,
            return_kind: ReturnKind::Int32,
            ..Default::default()
        },
    );

    // f(obj) => obj.Method()
    let il = vec![op::LDARG_0, op::CALLVIRT, 0x10, 0x00, 0x00, 0x06, op::RET];
    let spec = MethodSpec::new(il).arg_ptr().ret_i32();
    let compiled = compile_or_die(&spec, &resolvers);
    let f: unsafe extern "win64" fn(usize) -> i32 = unsafe { std::mem::transmute(compiled.entry()) };

    // Objects are a single MethodTable pointer.
    let base_obj = Box::leak(Box::new(base_mt.address()));
    let derived_obj = Box::leak(Box::new(derived_mt.address()));
    assert_eq!(unsafe { f(base_obj as *const usize as usize) }, 1);
    assert_eq!(unsafe { f(derived_obj as *const usize as usize) }, 2);
}

#[test]
fn test_float_arithmetic_and_args() {
    // f(a, b) = a * b + 0.5
    let il = vec![
        op::LDARG_0,
        op::LDARG_1,
        op::MUL,
        op::LDC_R8, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xE0, 0x3F,
        op::ADD,
        op::RET,
    ];
    let spec = MethodSpec::new(il).arg_f64().arg_f64().ret_f64();
    let resolvers = TestResolvers::new();
    let compiled = compile_or_die(&spec, &resolvers);
    let f: unsafe extern "win64" fn(f64, f64) -> f64 = unsafe { std::mem::transmute(compiled.entry()) };
    assert_eq!(unsafe { f(3.0, 2.0) }, 6.5);
    assert_eq!(unsafe { f(-1.5, 4.0) }, -5.5);
}

#[test]
fn test_float_int_conversions() {
    // f(x) = (int)((double)x / 2.0)
    let il = vec![
        op::LDARG_0,
        op::CONV_R8,
        op::LDC_R8, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x40,
        op::DIV,
        op::CONV_I4,
        op::RET,
    ];
    let spec = MethodSpec::new(il).arg_i32().ret_i32();
    let resolvers = TestResolvers::new();
    let compiled = compile_or_die(&spec, &resolvers);
    let f: unsafe extern "win64" fn(i32) -> i32 = unsafe { std::mem::transmute(compiled.entry()) };
    assert_eq!(unsafe { f(9) }, 4);
    assert_eq!(unsafe { f(-9) }, -4); // truncating conversion
}

#[test]
fn test_comparison_results() {
    // f(a, b) = (a < b) + (a == b) * 2 + (a > b) * 4, signed
    let il = vec![
        op::LDARG_0,
        op::LDARG_1,
        op::WIDE, op::wide::CLT,
        op::LDARG_0,
        op::LDARG_1,
        op::WIDE, op::wide::CEQ,
        op::LDC_I4_2,
        op::MUL,
        op::ADD,
        op::LDARG_0,
        op::LDARG_1,
        op::WIDE, op::wide::CGT,
        op::LDC_I4_4,
        op::MUL,
        op::ADD,
        op::RET,
    ];
    let spec = MethodSpec::new(il).arg_i32().arg_i32().ret_i32();
    let resolvers = TestResolvers::new();
    let compiled = compile_or_die(&spec, &resolvers);
    let f: unsafe extern "win64" fn(i32, i32) -> i32 = unsafe { std::mem::transmute(compiled.entry()) };
    assert_eq!(unsafe { f(-5, 3) }, 1);
    assert_eq!(unsafe { f(3, 3) }, 2);
    assert_eq!(unsafe { f(7, 3) }, 4);
}

#[test]
fn test_box_then_unbox_any() {
    const TOKEN: u32 = 0x0100_0009;
    let mt = FakeMethodTable::leak(0);
    let mut resolvers = TestResolvers::new();
    resolvers.types.insert(
        TOKEN,
        ResolvedType {
            method_table: mt.address(),
            is_value_type: true,
            size: 4,
            ..Default::default()
        },
    );
    // f(x) = unbox.any<int>(box<int>(x))
    let il = vec![
        op::LDARG_0,
        op::BOX, 0x09, 0x00, 0x00, 0x01,
        op::UNBOX_ANY, 0x09, 0x00, 0x00, 0x01,
        op::RET,
    ];
    let spec = MethodSpec::new(il).arg_i32().ret_i32();
    let compiled = compile_or_die(&spec, &resolvers);
    let f: unsafe extern "win64" fn(i32) -> i32 = unsafe { std::mem::transmute(compiled.entry()) };
    assert_eq!(unsafe { f(1234) }, 1234);
}

#[test]
fn test_instance_field_load() {
    const TOKEN: u32 = 0x0400_0001;
    let mut resolvers = TestResolvers::new();
    resolvers.fields.insert(
        TOKEN,
        corten_jit::resolve::ResolvedField {
            offset: 0,
            size: 4,
            signed: true,
            ..Default::default()
        },
    );
    // f(obj) = obj.field
    let il = vec![op::LDARG_0, op::LDFLD, 0x01, 0x00, 0x00, 0x04, op::RET];
    let spec = MethodSpec::new(il).arg_ptr().ret_i32();
    let compiled = compile_or_die(&spec, &resolvers);

    // Object: [method table][i32 field]
    #[repr(C)]
    struct Obj {
        mt: usize,
        field: i32,
    }
    let object = Obj { mt: 0, field: -77 };
    let f: unsafe extern "win64" fn(usize) -> i32 = unsafe { std::mem::transmute(compiled.entry()) };
    assert_eq!(unsafe { f(&object as *const Obj as usize) }, -77);
}

#[test]
fn test_self_recursive_tail_call() {
    const TOKEN: u32 = 0x0600_0042;
    let mut resolvers = TestResolvers::new();
    resolvers.methods.insert(
        TOKEN,
        ResolvedMethod {
            method_token: TOKEN,
            arg_count: 2,
            arg_float_kind: vec![0, 0],
            return_kind: ReturnKind::Int32,
            ..Default::default()
        },
    );
    // f(n, acc) = n == 0 ? acc : f(n - 1, acc + n), via tail. call
    let il = vec![
        op::LDARG_0,          // 0
        op::BRTRUE_S, 0x02,   // 1 -> 5
        op::LDARG_1,          // 3
        op::RET,              // 4
        op::LDARG_0,          // 5
        op::LDC_I4_1,         // 6
        op::SUB,              // 7
        op::LDARG_1,          // 8
        op::LDARG_0,          // 9
        op::ADD,              // 10
        op::WIDE, op::wide::TAIL, // 11
        op::CALL, 0x42, 0x00, 0x00, 0x06, // 13
        op::RET,              // 18
    ];
    let spec = MethodSpec::new(il).arg_i32().arg_i32().ret_i32().token(TOKEN);
    let compiled = compile_or_die(&spec, &resolvers);
    let f: unsafe extern "win64" fn(i32, i32) -> i32 = unsafe { std::mem::transmute(compiled.entry()) };
    assert_eq!(unsafe { f(5, 0) }, 15);
    assert_eq!(unsafe { f(0, 3) }, 3);
    // Deep enough that real recursion would need real stack; the tail
    // jump reuses one frame.
    assert_eq!(unsafe { f(1_000_000, 0) }, 1_784_293_664);
}

#[test]
fn test_gc_info_roots_and_safe_points() {
    const TOKEN_I32: u32 = 0x0100_0001;
    let element_mt = FakeMethodTable::leak(4);
    // local 0 holds the array: a GC root.
    let il = vec![
        op::LDC_I4_2,
        op::NEWARR, 0x01, 0x00, 0x00, 0x01,
        op::STLOC_0,
        op::LDLOC_0,
        op::LDLEN,
        op::CONV_I4,
        op::RET,
    ];
    let spec = MethodSpec::new(il).local_ptr().ret_i32().gc_mask(0b1);
    let mut resolvers = TestResolvers::new();
    resolvers.types.insert(
        TOKEN_I32,
        ResolvedType {
            method_table: element_mt.address(),
            is_value_type: true,
            size: 4,
            array_method_table: element_mt.address(),
            ..Default::default()
        },
    );
    let compiled = compile_or_die(&spec, &resolvers);

    let gc = compiled.gc_info();
    assert_eq!(gc.root_offsets(), &[-64]);
    assert_eq!(gc.safe_points().len(), 1);
    // The blob encodes both sets.
    let mut blob = vec![0u8; gc.encoded_len()];
    assert!(gc.encode_into(&mut blob).is_some());

    let f: unsafe extern "win64" fn() -> i32 = unsafe { std::mem::transmute(compiled.entry()) };
    assert_eq!(unsafe { f() }, 2);
}

#[test]
fn test_switch_dispatch() {
    // switch (x) { case 0: return 10; case 1: return 20; } return -1;
    let il = vec![
        op::LDARG_0,                          // 0
        op::SWITCH,                           // 1
        0x02, 0x00, 0x00, 0x00,               // count
        0x02, 0x00, 0x00, 0x00,               // -> 16
        0x05, 0x00, 0x00, 0x00,               // -> 19
        op::LDC_I4_M1,                        // 14
        op::RET,                              // 15
        op::LDC_I4_S, 10,                     // 16
        op::RET,                              // 18
        op::LDC_I4_S, 20,                     // 19
        op::RET,                              // 21
    ];
    let spec = MethodSpec::new(il).arg_i32().ret_i32();
    let resolvers = TestResolvers::new();
    let compiled = compile_or_die(&spec, &resolvers);
    let f: unsafe extern "win64" fn(i32) -> i32 = unsafe { std::mem::transmute(compiled.entry()) };
    assert_eq!(unsafe { f(0) }, 10);
    assert_eq!(unsafe { f(1) }, 20);
    assert_eq!(unsafe { f(9) }, -1);
}

#[test]
fn test_unsupported_opcode_fails_cleanly() {
    init_logging();
    let il = vec![0xC0, op::RET]; // 0xC0 is not a CIL opcode
    let spec = MethodSpec::new(il).ret_i32();
    let resolvers = TestResolvers::new();
    assert!(compile(&spec.desc(), resolvers.resolvers(), helpers()).is_none());
}

#[test]
fn test_stack_underflow_fails_cleanly() {
    init_logging();
    let il = vec![op::ADD, op::RET];
    let spec = MethodSpec::new(il).ret_i32();
    let resolvers = TestResolvers::new();
    assert!(compile(&spec.desc(), resolvers.resolvers(), helpers()).is_none());
}

#[test]
fn test_unresolved_token_fails_cleanly() {
    init_logging();
    let il = vec![op::LDC_I4_0, op::CALL, 0x01, 0x00, 0x00, 0x06, op::RET];
    let spec = MethodSpec::new(il).ret_i32();
    let resolvers = TestResolvers::new();
    assert!(compile(&spec.desc(), resolvers.resolvers(), helpers()).is_none());
}

#[test]
fn test_create_instance_intrinsic() {
    const TOKEN: u32 = 0x0600_0031;
    let mt = FakeMethodTable::leak(0);
    let mut resolvers = TestResolvers::new();
    resolvers.methods.insert(
        TOKEN,
        ResolvedMethod {
            intrinsic: Intrinsic::CreateInstance,
            intrinsic_method_table: mt.address(),
            return_kind: ReturnKind::IntPtr,
            ..Default::default()
        },
    );
    // f() = Activator.CreateInstance<T>() as pointer
    let il = vec![op::CALL, 0x31, 0x00, 0x00, 0x06, op::RET];
    let spec = MethodSpec::new(il).ret_i64();
    let compiled = compile_or_die(&spec, &resolvers);
    let f: unsafe extern "win64" fn() -> usize = unsafe { std::mem::transmute(compiled.entry()) };
    let object = unsafe { f() };
    assert_ne!(object, 0);
    // Freshly allocated object carries the MethodTable.
    assert_eq!(unsafe { *(object as *const usize) }, mt.address());
}
