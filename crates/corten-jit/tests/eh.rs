//! Funclet compilation: try/finally execution on the non-exceptional
//! path, funclet epilogue shapes, and EH-clause translation.

#![cfg(all(target_arch = "x86_64", unix))]

mod common;

use common::{helpers, init_logging, FakeMethodTable, MethodSpec, TestResolvers};
use corten_jit::compile::{compile_with_funclets, CompiledMethod};
use corten_jit::il::opcodes as op;
use corten_jit::il::{ClauseKind, ILExceptionClause};
use corten_jit::resolve::ResolvedType;

fn compile_eh(
    spec: &MethodSpec,
    resolvers: &TestResolvers,
    clauses: &[ILExceptionClause],
) -> CompiledMethod {
    init_logging();
    compile_with_funclets(&spec.desc(), resolvers.resolvers(), helpers(), clauses)
        .expect("compilation failed")
}

/// try { l0 = 1; leave done; } finally { l1 = 2; } done: return l0 + l1;
fn try_finally_il() -> (Vec<u8>, ILExceptionClause) {
    let il = vec![
        op::LDC_I4_1,       // 0
        op::STLOC_0,        // 1
        op::LEAVE_S, 0x03,  // 2 -> 7
        op::LDC_I4_2,       // 4
        op::STLOC_1,        // 5
        op::ENDFINALLY,     // 6
        op::LDLOC_0,        // 7
        op::LDLOC_1,        // 8
        op::ADD,            // 9
        op::RET,            // 10
    ];
    let clause = ILExceptionClause {
        kind: ClauseKind::Finally,
        try_start: 0,
        try_end: 4,
        handler_start: 4,
        handler_end: 7,
        class_token_or_filter: 0,
    };
    (il, clause)
}

#[test]
fn test_try_finally_with_leave() {
    let (il, clause) = try_finally_il();
    let spec = MethodSpec::new(il).locals_i32(2).ret_i32();
    let resolvers = TestResolvers::new();
    let compiled = compile_eh(&spec, &resolvers, &[clause]);

    assert_eq!(compiled.funclets.len(), 1);
    let funclet = &compiled.funclets[0];
    assert!(!funclet.is_filter_expression);
    assert_eq!(funclet.clause_index, 0);

    // Funclet prologue: push rbp; mov rbp, rdx.
    let code = compiled.code_bytes();
    let start = funclet.native_start as usize;
    assert_eq!(code[start], 0x55);
    assert_eq!(&code[start + 1..start + 4], &[0x48, 0x89, 0xD5]);
    // Finally epilogue: pop rbp; ret.
    let end = (funclet.native_start + funclet.native_size) as usize;
    assert_eq!(&code[end - 2..end], &[0x5D, 0xC3]);

    // The leave-to-finally call runs the funclet inline on the
    // non-exceptional path.
    let f: unsafe extern "win64" fn() -> i32 = unsafe { std::mem::transmute(compiled.entry()) };
    assert_eq!(unsafe { f() }, 3);

    // Clause translation carries native offsets.
    assert_eq!(compiled.eh_clauses.len(), 1);
    let eh = &compiled.eh_clauses[0];
    assert_eq!(eh.kind, ClauseKind::Finally);
    assert!(eh.try_start < eh.try_end);
    assert_eq!(eh.handler_start, funclet.native_start);
    assert_eq!(eh.handler_end, funclet.native_start + funclet.native_size);
    assert!(eh.leave_target >= eh.try_end);
    assert!(eh.leave_target < funclet.native_start);
}

#[test]
fn test_nested_leave_runs_both_finallys() {
    // try { try { l0 = 1; leave done; } finally { l1 += 2; } }
    // finally { l1 += 3; } done: return l0 + l1;
    let il = vec![
        op::LDC_I4_1,       // 0
        op::STLOC_0,        // 1
        op::LEAVE_S, 0x0B,  // 2 -> 15
        op::LDLOC_1,        // 4
        op::LDC_I4_2,       // 5
        op::ADD,            // 6
        op::STLOC_1,        // 7
        op::ENDFINALLY,     // 8
        op::NOP,            // 9  (outer try tail)
        op::LDLOC_1,        // 10
        op::LDC_I4_3,       // 11
        op::ADD,            // 12
        op::STLOC_1,        // 13
        op::ENDFINALLY,     // 14
        op::LDLOC_0,        // 15
        op::LDLOC_1,        // 16
        op::ADD,            // 17
        op::RET,            // 18
    ];
    let clauses = [
        ILExceptionClause {
            kind: ClauseKind::Finally,
            try_start: 0,
            try_end: 4,
            handler_start: 4,
            handler_end: 9,
            class_token_or_filter: 0,
        },
        ILExceptionClause {
            kind: ClauseKind::Finally,
            try_start: 0,
            try_end: 10,
            handler_start: 10,
            handler_end: 15,
            class_token_or_filter: 0,
        },
    ];
    let spec = MethodSpec::new(il).locals_i32(2).ret_i32();
    let resolvers = TestResolvers::new();
    let compiled = compile_eh(&spec, &resolvers, &clauses);
    assert_eq!(compiled.funclets.len(), 2);

    let f: unsafe extern "win64" fn() -> i32 = unsafe { std::mem::transmute(compiled.entry()) };
    assert_eq!(unsafe { f() }, 6);
}

#[test]
fn test_catch_funclet_shape() {
    const TOKEN_EXC: u32 = 0x0100_0042;
    let exc_mt = FakeMethodTable::leak(0);
    // try { l0 = 1; leave done; } catch (T) { pop; l0 = 2; leave done; }
    // done: return l0;
    let il = vec![
        op::LDC_I4_1,       // 0
        op::STLOC_0,        // 1
        op::LEAVE_S, 0x05,  // 2 -> 9
        op::POP,            // 4  (exception object)
        op::LDC_I4_2,       // 5
        op::STLOC_0,        // 6
        op::LEAVE_S, 0x00,  // 7 -> 9
        op::LDLOC_0,        // 9
        op::RET,            // 10
    ];
    let clause = ILExceptionClause {
        kind: ClauseKind::Exception,
        try_start: 0,
        try_end: 4,
        handler_start: 4,
        handler_end: 9,
        class_token_or_filter: TOKEN_EXC,
    };
    let spec = MethodSpec::new(il).locals_i32(1).ret_i32();
    let mut resolvers = TestResolvers::new();
    resolvers.types.insert(
        TOKEN_EXC,
        ResolvedType { method_table: exc_mt.address(), ..Default::default() },
    );
    let compiled = compile_eh(&spec, &resolvers, &[clause]);

    // Normal path never enters the handler.
    let f: unsafe extern "win64" fn() -> i32 = unsafe { std::mem::transmute(compiled.entry()) };
    assert_eq!(unsafe { f() }, 1);

    assert_eq!(compiled.funclets.len(), 1);
    let funclet = &compiled.funclets[0];
    let code = compiled.code_bytes();
    let end = (funclet.native_start + funclet.native_size) as usize;
    // Catch epilogue: add rsp, 8; ret — RBP stays the parent frame.
    assert_eq!(&code[end - 5..end], &[0x48, 0x83, 0xC4, 0x08, 0xC3]);

    let eh = &compiled.eh_clauses[0];
    assert_eq!(eh.catch_type_method_table, exc_mt.address());
    assert_eq!(eh.filter_native_or_class_token, TOKEN_EXC);
}

#[test]
fn test_filter_funclet_pair() {
    // try { leave done; }
    // filter { pop; ldc.i4.1; endfilter } { pop; leave done; }
    // done: return 7;
    let il = vec![
        op::LEAVE_S, 0x08,        // 0 -> 10
        op::POP,                  // 2  (filter expression begins)
        op::LDC_I4_1,             // 3
        op::WIDE, op::wide::ENDFILTER, // 4
        op::POP,                  // 6  (handler begins)
        op::LEAVE_S, 0x01,        // 7 -> 10
        op::NOP,                  // 9
        op::LDC_I4_7,             // 10
        op::RET,                  // 11
    ];
    let clause = ILExceptionClause {
        kind: ClauseKind::Filter,
        try_start: 0,
        try_end: 2,
        handler_start: 6,
        handler_end: 9,
        class_token_or_filter: 2, // filter expression IL offset
    };
    let spec = MethodSpec::new(il).ret_i32();
    let resolvers = TestResolvers::new();
    let compiled = compile_eh(&spec, &resolvers, &[clause]);

    let f: unsafe extern "win64" fn() -> i32 = unsafe { std::mem::transmute(compiled.entry()) };
    assert_eq!(unsafe { f() }, 7);

    // One filter-expression funclet plus its paired handler.
    assert_eq!(compiled.funclets.len(), 2);
    let filter = &compiled.funclets[0];
    let handler = &compiled.funclets[1];
    assert!(filter.is_filter_expression);
    assert!(!handler.is_filter_expression);
    assert_eq!(filter.clause_index, 0);
    assert_eq!(handler.clause_index, 0);

    let code = compiled.code_bytes();
    // Filter epilogue: the verdict pops into RAX, then pop rbp; ret.
    let filter_end = (filter.native_start + filter.native_size) as usize;
    assert_eq!(&code[filter_end - 3..filter_end], &[0x58, 0x5D, 0xC3]);

    let eh = &compiled.eh_clauses[0];
    assert_eq!(eh.filter_native_or_class_token, filter.native_start);
}

#[test]
fn test_throw_emits_trap_tail() {
    // throw always ends with int3 for debuggability.
    let il = vec![op::LDNULL, op::THROW];
    let spec = MethodSpec::new(il);
    let resolvers = TestResolvers::new();
    init_logging();
    let compiled =
        corten_jit::compile::compile(&spec.desc(), resolvers.resolvers(), helpers()).unwrap();
    let code = compiled.code_bytes();
    assert_eq!(code[code.len() - 1], 0xCC);
    // The throw-helper call is a safe point like any other call.
    assert_eq!(compiled.safe_point_count(), 1);
}
