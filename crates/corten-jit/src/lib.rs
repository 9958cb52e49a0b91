//! corten-jit: a baseline (tier-0) JIT compiler for ECMA-335 CIL.
//!
//! The compiler walks a method body's IL exactly once and emits x86-64
//! machine code that simulates the evaluation stack on the machine stack,
//! following the Microsoft x64 calling convention. Correctness and low
//! compile latency win over code quality; there is no IR, no register
//! allocation, and no second pass beyond branch patching and funclet
//! emission.
//!
//! Input is a pre-parsed method body (IL bytes, signature shape, optional
//! EH clauses) plus four resolver callbacks for method, type, field, and
//! string tokens. Output is an executable entry point with its unwind
//! numbers, EH clauses translated to native offsets, funclet records, and
//! GC info (root slots and safe points).
//!
//! Metadata parsing, heap allocation, garbage collection, exception
//! dispatch, and W^X management belong to the host; the seams are
//! [`resolve::Resolvers`] and [`runtime::RuntimeHelpers`].

pub mod codebuf;
pub mod compile;
pub mod emit;
pub mod error;
pub mod frame;
pub mod gcinfo;
pub mod il;
pub mod resolve;
pub mod runtime;
pub mod stack;

pub use compile::{
    compile, compile_with_funclets, CompiledMethod, FuncletRecord, JitExceptionClause, MethodDesc,
};
pub use error::CompileError;
pub use il::{ClauseKind, ILExceptionClause};
pub use resolve::{
    FieldResolver, Intrinsic, MethodResolver, ResolvedField, ResolvedMethod, ResolvedSignature,
    ResolvedType, Resolvers, ReturnKind, StringResolver, TypeResolver,
};
pub use runtime::{CctorRegistry, MethodRegistry, RuntimeHelpers};
