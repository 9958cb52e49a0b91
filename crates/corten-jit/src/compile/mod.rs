//! The method compiler: one instance per compilation.
//!
//! A single forward walk over the IL emits machine code opcode by opcode;
//! forward branches go through a patch table, handler regions are skipped
//! and compiled as funclets in a second pass. The instance owns every
//! table it uses and the code buffer it emits into; on success the buffer
//! moves into the returned [`CompiledMethod`].

mod arith;
mod calls;
mod dispatch;
mod funclets;
mod memory;
mod objects;

use log::{debug, warn};
use rustc_hash::FxHashMap;

use crate::codebuf::{buffer_capacity_for, CodeBuffer};
use crate::emit::regs::{self, Reg, Xmm};
use crate::emit::Emitter;
use crate::error::CompileError;
use crate::frame::{FrameLayout, SAVED_REGS};
use crate::gcinfo::GCInfoBuilder;
use crate::il::{ClauseKind, ILExceptionClause};
use crate::resolve::Resolvers;
use crate::runtime::helpers::RuntimeHelpers;
use crate::runtime::registry::MethodRegistry;
use crate::stack::{EvalStack, EvalStackEntry, StackKind};

use dispatch::Prefixes;

/// Capacity bounds; exceeding either is a compile error.
const MAX_LABELS: usize = 1 << 16;
const MAX_BRANCHES: usize = 1 << 13;

/// Everything the caller knows about one method body.
pub struct MethodDesc<'a> {
    /// Raw CIL of the method body, no header.
    pub il: &'a [u8],
    /// Declared arguments, including `this` for instance methods.
    pub arg_count: u16,
    pub local_count: u16,
    pub local_is_value_type: &'a [bool],
    pub local_type_size: &'a [u16],
    pub arg_is_value_type: &'a [bool],
    pub arg_type_size: &'a [u16],
    /// 0 = integer/pointer, 4 = float32, 8 = float64, per argument.
    pub arg_float_kind: &'a [u8],
    pub return_is_value_type: bool,
    pub return_type_size: u16,
    /// 0, 4, or 8 like `arg_float_kind`, for the return value.
    pub return_float_kind: u8,
    /// Bit `i`: local `i` is a GC root; bit `local_count + i`: arg `i` is.
    pub gc_ref_mask: u64,
    pub method_token: u32,
    pub assembly_id: u32,
}

/// An EH clause translated to native offsets.
#[derive(Debug, Clone, Copy)]
pub struct JitExceptionClause {
    pub kind: ClauseKind,
    pub try_start: u32,
    pub try_end: u32,
    pub handler_start: u32,
    pub handler_end: u32,
    /// Native offset the protected region continues at after `leave`.
    pub leave_target: u32,
    /// Native offset of the filter-expression funclet, or the catch class
    /// token when the clause is not a filter.
    pub filter_native_or_class_token: u32,
    /// Resolved MethodTable for a typed catch, 0 if unresolvable.
    pub catch_type_method_table: usize,
}

/// One emitted funclet.
#[derive(Debug, Clone, Copy)]
pub struct FuncletRecord {
    pub native_start: u32,
    pub native_size: u32,
    pub clause_index: u32,
    pub is_filter_expression: bool,
}

/// A successfully compiled method.
pub struct CompiledMethod {
    code: CodeBuffer,
    pub native_size: u32,
    pub prologue_size: u32,
    pub stack_adjust: u32,
    pub eh_clauses: Vec<JitExceptionClause>,
    pub funclets: Vec<FuncletRecord>,
    gc: GCInfoBuilder,
}

impl CompiledMethod {
    /// Entry pointer of the compiled body. Valid while `self` is alive.
    pub fn entry(&self) -> *const u8 {
        self.code.function_pointer()
    }

    pub fn funclet_entry(&self, record: &FuncletRecord) -> *const u8 {
        self.code.pointer_at(record.native_start as usize)
    }

    pub fn code_bytes(&self) -> &[u8] {
        self.code.code()
    }

    pub fn gc_info(&self) -> &GCInfoBuilder {
        &self.gc
    }

    pub fn safe_point_count(&self) -> usize {
        self.gc.safe_point_count()
    }
}

/// Where the compiler is currently emitting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EmitContext {
    MainBody,
    /// Handler funclet of the clause with this index.
    Handler(usize),
    /// Filter-expression funclet of the clause with this index.
    FilterExpression(usize),
}

struct PendingBranch {
    target_il: u32,
    patch_offset: usize,
}

pub struct MethodCompiler<'a> {
    desc: &'a MethodDesc<'a>,
    resolvers: Resolvers<'a>,
    helpers: &'a RuntimeHelpers,
    buf: CodeBuffer,
    frame: FrameLayout,
    stack: EvalStack,
    gc: GCInfoBuilder,

    /// IL offset -> native offset for the pass in progress.
    labels: FxHashMap<u32, u32>,
    /// Main-body labels, kept for EH translation after funclet passes.
    main_labels: FxHashMap<u32, u32>,
    /// Expected eval-stack contents at known branch targets.
    branch_stacks: FxHashMap<u32, Vec<EvalStackEntry>>,
    pending: Vec<PendingBranch>,

    prefixes: Prefixes,
    constrained_token: Option<u32>,
    /// Kind last stored to each local, refining the size-derived guess.
    local_kinds: Vec<StackKind>,

    clauses: Vec<ILExceptionClause>,
    /// IL leave target per clause, discovered while compiling `leave`s.
    leave_targets: Vec<Option<u32>>,
    /// (patch offset, clause index) for `call <finally>` displacements.
    finally_patches: Vec<(usize, usize)>,
    funclet_starts: Vec<u32>,
    filter_starts: Vec<u32>,
    funclets: Vec<FuncletRecord>,

    context: EmitContext,
    /// Catch funclets enter with the exception in RCX and no physical
    /// stack slot; the handler's first `pop` must become a no-op.
    pending_exception_pop: bool,
    prologue_size: u32,
    main_end_native: u32,
}

/// Compile a method body without exception handlers.
pub fn compile(
    desc: &MethodDesc<'_>,
    resolvers: Resolvers<'_>,
    helpers: &RuntimeHelpers,
) -> Option<CompiledMethod> {
    compile_inner(desc, resolvers, helpers, &[])
}

/// Compile a method body with try/catch/filter/finally clauses.
pub fn compile_with_funclets(
    desc: &MethodDesc<'_>,
    resolvers: Resolvers<'_>,
    helpers: &RuntimeHelpers,
    clauses: &[ILExceptionClause],
) -> Option<CompiledMethod> {
    compile_inner(desc, resolvers, helpers, clauses)
}

fn compile_inner(
    desc: &MethodDesc<'_>,
    resolvers: Resolvers<'_>,
    helpers: &RuntimeHelpers,
    clauses: &[ILExceptionClause],
) -> Option<CompiledMethod> {
    let compiler = match MethodCompiler::new(desc, resolvers, helpers, clauses) {
        Some(c) => c,
        None => {
            warn!(
                "method {:#010x}: failed to map a code buffer for {} IL bytes",
                desc.method_token,
                desc.il.len()
            );
            return None;
        }
    };
    match compiler.run() {
        Ok(compiled) => {
            debug!(
                "method {:#010x}: {} IL bytes -> {} native bytes, {} funclet(s), {} safe point(s)",
                desc.method_token,
                desc.il.len(),
                compiled.native_size,
                compiled.funclets.len(),
                compiled.safe_point_count()
            );
            if desc.method_token != 0 {
                MethodRegistry::global().publish(
                    desc.assembly_id,
                    desc.method_token,
                    compiled.entry() as usize,
                );
            }
            Some(compiled)
        }
        Err(err) => {
            warn!("method {:#010x}: compilation failed: {err}", desc.method_token);
            None
        }
    }
}

impl<'a> MethodCompiler<'a> {
    fn new(
        desc: &'a MethodDesc<'a>,
        resolvers: Resolvers<'a>,
        helpers: &'a RuntimeHelpers,
        clauses: &[ILExceptionClause],
    ) -> Option<MethodCompiler<'a>> {
        let buf = CodeBuffer::new(buffer_capacity_for(desc.il.len()))?;
        let frame = FrameLayout::new(
            desc.arg_count,
            desc.local_count,
            desc.return_is_value_type,
            desc.return_type_size as u32,
        );
        let local_kinds = (0..desc.local_count as usize)
            .map(|i| {
                if *desc.local_is_value_type.get(i).unwrap_or(&false) {
                    StackKind::ValueType
                } else if *desc.local_type_size.get(i).unwrap_or(&8) <= 4 {
                    StackKind::Int32
                } else {
                    StackKind::NativeInt
                }
            })
            .collect();
        Some(MethodCompiler {
            desc,
            resolvers,
            helpers,
            buf,
            frame,
            stack: EvalStack::new(),
            gc: GCInfoBuilder::new(),
            labels: FxHashMap::default(),
            main_labels: FxHashMap::default(),
            branch_stacks: FxHashMap::default(),
            pending: Vec::new(),
            prefixes: Prefixes::empty(),
            constrained_token: None,
            local_kinds,
            clauses: clauses.to_vec(),
            leave_targets: vec![None; clauses.len()],
            finally_patches: Vec::new(),
            funclet_starts: vec![0; clauses.len()],
            filter_starts: vec![0; clauses.len()],
            funclets: Vec::new(),
            context: EmitContext::MainBody,
            pending_exception_pop: false,
            prologue_size: 0,
            main_end_native: 0,
        })
    }

    fn run(mut self) -> Result<CompiledMethod, CompileError> {
        self.validate_clauses()?;
        self.gc.seed_roots(self.desc.gc_ref_mask, &self.frame);
        self.emit_prologue();
        self.walk(0, self.desc.il.len())?;
        self.resolve_pending_branches()?;
        self.main_end_native = self.buf.position() as u32;
        self.main_labels = std::mem::take(&mut self.labels);

        if !self.clauses.is_empty() {
            self.compile_funclets()?;
            self.patch_finally_calls();
        }
        self.buf.check_overflow()?;

        let eh_clauses = self.translate_clauses()?;
        let native_size = self.buf.position() as u32;
        Ok(CompiledMethod {
            native_size,
            prologue_size: self.prologue_size,
            stack_adjust: self.frame.stack_adjust,
            eh_clauses,
            funclets: self.funclets,
            gc: self.gc,
            code: self.buf,
        })
    }

    fn validate_clauses(&self) -> Result<(), CompileError> {
        let len = self.desc.il.len() as u32;
        for (i, c) in self.clauses.iter().enumerate() {
            let bad = c.try_start > c.try_end
                || c.handler_start > c.handler_end
                || c.try_end > len
                || c.handler_end > len
                || (c.kind == ClauseKind::Filter && c.class_token_or_filter > c.handler_start);
            if bad {
                return Err(CompileError::MalformedClause(i));
            }
        }
        Ok(())
    }

    #[inline]
    fn asm(&mut self) -> Emitter<'_> {
        Emitter::new(&mut self.buf)
    }

    // ---- prologue / epilogue ----

    fn emit_prologue(&mut self) {
        let frame = self.frame;
        let desc = self.desc;
        let mut asm = self.asm();
        asm.push_reg(regs::FP);
        asm.mov_rr(regs::FP, regs::SP);
        asm.sub_ri(regs::SP, frame.stack_adjust as i32);
        for (i, reg) in SAVED_REGS.iter().enumerate() {
            asm.store64(regs::FP, frame.saved_reg_offset(i), *reg);
        }

        // Home the register args. Float args arrive in XMM0..XMM3 per the
        // Win64 convention; everything else in RCX/RDX/R8/R9.
        let homed = frame.physical_arg_count().min(4);
        for phys in 0..homed {
            let slot = frame.arg_home_offset_physical(phys);
            let float_kind = if frame.ret_buf && phys == 0 {
                0
            } else {
                let il_arg = (phys - frame.ret_buf as u16) as usize;
                *desc.arg_float_kind.get(il_arg).unwrap_or(&0)
            };
            match float_kind {
                8 => asm.movsd_store(regs::FP, slot, regs::ARG_XMM[phys as usize]),
                4 => asm.movss_store(regs::FP, slot, regs::ARG_XMM[phys as usize]),
                _ => asm.store64(regs::FP, slot, regs::ARG_REGS[phys as usize]),
            }
        }

        // Zero the local slots: small value types read whole slots, and GC
        // root slots must be clean before the first safe point.
        let local_bytes = 64 * desc.local_count as i32;
        if local_bytes > 0 {
            asm.xor_rr32(regs::R0, regs::R0);
            let mut off = 8;
            while off <= local_bytes {
                asm.store64(regs::FP, -off, regs::R0);
                off += 8;
            }
        }
        self.prologue_size = self.buf.position() as u32;
    }

    fn emit_epilogue(&mut self) {
        let frame = self.frame;
        let mut asm = self.asm();
        for (i, reg) in SAVED_REGS.iter().enumerate() {
            asm.load64(*reg, regs::FP, frame.saved_reg_offset(i));
        }
        asm.mov_rr(regs::SP, regs::FP);
        asm.pop_reg(regs::FP);
        asm.ret();
    }

    // ---- labels and branches ----

    fn record_label(&mut self, il_offset: u32) -> Result<(), CompileError> {
        if self.labels.len() >= MAX_LABELS {
            return Err(CompileError::LabelOverflow(MAX_LABELS));
        }
        let native = self.buf.position() as u32;
        self.labels.entry(il_offset).or_insert(native);
        Ok(())
    }

    /// Register the eval-stack image a branch expects at its target.
    fn register_branch_target(&mut self, target_il: u32) {
        let snapshot = self.stack.snapshot();
        self.branch_stacks.entry(target_il).or_insert(snapshot);
    }

    /// Emit a branch to an IL target, patched now (backward) or later.
    fn emit_branch(&mut self, target_il: u32, cond: Option<crate::emit::Cond>) -> Result<(), CompileError> {
        self.register_branch_target(target_il);
        let patch = match cond {
            Some(c) => self.asm().jcc_placeholder(c),
            None => self.asm().jmp_placeholder(),
        };
        if let Some(&native) = self.labels.get(&target_il) {
            self.buf.patch_rel32_to(patch, native as usize);
        } else {
            if self.pending.len() >= MAX_BRANCHES {
                return Err(CompileError::BranchOverflow(MAX_BRANCHES));
            }
            self.pending.push(PendingBranch { target_il, patch_offset: patch });
        }
        Ok(())
    }

    fn resolve_pending_branches(&mut self) -> Result<(), CompileError> {
        for pending in std::mem::take(&mut self.pending) {
            match self.labels.get(&pending.target_il) {
                Some(&native) => self.buf.patch_rel32_to(pending.patch_offset, native as usize),
                None => {
                    return Err(CompileError::DanglingBranch { target: pending.target_il as usize })
                }
            }
        }
        Ok(())
    }

    fn main_label(&self, il_offset: u32) -> u32 {
        self.main_labels
            .get(&il_offset)
            .copied()
            .unwrap_or(self.main_end_native)
    }

    // ---- helper calls ----

    /// Alignment filler so RSP is 16-aligned at the next call, given
    /// `extra` bytes already committed below the tracked eval stack.
    fn call_pad(&self, extra: u32) -> i32 {
        let below = self.stack.total_bytes() + extra + 32;
        ((16 - below % 16) % 16) as i32
    }

    /// Call a host helper whose arguments are already in registers.
    /// Clobbers R0. Records the safe point.
    fn emit_helper_call(&mut self, addr: usize) {
        let pad = self.call_pad(0);
        let mut asm = self.asm();
        asm.sub_ri(regs::SP, 32 + pad);
        asm.mov_ri64(regs::R0, addr as u64);
        asm.call_reg(regs::R0);
        let after_call = asm.position();
        asm.add_ri(regs::SP, 32 + pad);
        self.gc.add_safe_point(after_call);
    }

    /// A conditional trap: skip the 2-byte `int vector` when `cond` holds.
    fn emit_trap_unless(&mut self, cond: crate::emit::Cond, vector: u8) {
        let mut asm = self.asm();
        asm.jcc_short_over(cond, 2);
        asm.int_imm(vector);
    }

    // ---- eval-stack kinds for args and locals ----

    fn arg_kind(&self, index: u16) -> StackKind {
        let i = index as usize;
        match self.desc.arg_float_kind.get(i) {
            Some(4) => StackKind::Float32,
            Some(8) => StackKind::Float64,
            _ => {
                if *self.desc.arg_is_value_type.get(i).unwrap_or(&false) {
                    StackKind::ValueType
                } else if *self.desc.arg_type_size.get(i).unwrap_or(&8) <= 4 {
                    StackKind::Int32
                } else {
                    StackKind::NativeInt
                }
            }
        }
    }

    fn stack_underflow(&self, il_offset: u32) -> CompileError {
        CompileError::StackUnderflow { offset: il_offset as usize }
    }

    /// Pop one entry into a register, or fail with a located error.
    fn pop_reg(&mut self, reg: Reg, il_offset: u32) -> Result<EvalStackEntry, CompileError> {
        self.stack
            .pop_to_reg(&mut self.buf, reg)
            .ok_or_else(|| self.stack_underflow(il_offset))
    }

    /// Move a float bit pattern from a GPR into an XMM register at the
    /// operand's width, promoting float32 to float64 when asked.
    fn gpr_to_xmm(&mut self, xmm: Xmm, gpr: Reg, kind: StackKind, promote: bool) {
        let mut asm = Emitter::new(&mut self.buf);
        if kind == StackKind::Float32 {
            asm.movd_xr(xmm, gpr);
            if promote {
                asm.cvtss2sd(xmm, xmm);
            }
        } else {
            asm.movq_xr(xmm, gpr);
        }
    }
}
