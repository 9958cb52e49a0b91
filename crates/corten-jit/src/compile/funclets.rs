//! Exception handling: funclet emission and the leave family.
//!
//! Handlers compile as separate functions entered by the EH runtime with
//! RDX = parent frame pointer (and RCX = exception object for catch and
//! filter-handler funclets). The main pass skips handler IL; this pass
//! walks each handler with fresh label, branch, and stack state.
//!
//! Epilogue shapes are part of the dispatch contract:
//! catch/filter-handler return with `add rsp, 8; ret` (keeping RBP = the
//! parent frame), finally/fault with `pop rbp; ret`, and a filter
//! expression loads its verdict into RAX before `pop rbp; ret`.

use crate::emit::regs;
use crate::error::CompileError;
use crate::il::ClauseKind;
use crate::stack::StackKind;

use super::{EmitContext, FuncletRecord, JitExceptionClause, MethodCompiler};

impl<'a> MethodCompiler<'a> {
    // ---- throw / rethrow ----

    pub(super) fn emit_throw(&mut self, il_offset: u32) -> Result<(), CompileError> {
        self.pop_reg(regs::R1, il_offset)?;
        self.emit_helper_call(self.helpers.throw_addr());
        self.asm().int3();
        Ok(())
    }

    pub(super) fn emit_rethrow(&mut self) {
        self.emit_helper_call(self.helpers.rethrow_addr());
        self.asm().int3();
    }

    // ---- leave / endfinally / endfilter ----

    pub(super) fn emit_leave(&mut self, il_offset: u32, target: u32) -> Result<(), CompileError> {
        // leave empties the evaluation stack.
        let tracked = self.stack.total_bytes();
        if tracked > 0 {
            self.asm().add_ri(regs::SP, tracked as i32);
            self.stack.clear();
        }

        match self.context {
            EmitContext::MainBody => {
                for i in 0..self.clauses.len() {
                    let clause = self.clauses[i];
                    if !clause.contains_try(il_offset) {
                        continue;
                    }
                    self.leave_targets[i] = Some(target);
                    if clause.kind == ClauseKind::Finally && !clause.contains_try(target) {
                        // Run the finally on the way out. The funclet is
                        // not emitted yet; the displacement is patched
                        // after the funclet pass.
                        let patch;
                        {
                            let mut asm = self.asm();
                            asm.sub_ri(regs::SP, 32);
                            asm.mov_rr(regs::R2, regs::FP);
                            patch = asm.call_placeholder();
                            asm.add_ri(regs::SP, 32);
                        }
                        self.gc.add_safe_point(patch + 4);
                        self.finally_patches.push((patch, i));
                    }
                }
                self.emit_branch(target, None)
            }
            EmitContext::Handler(i) => {
                // Return from the funclet, discarding its saved RBP so the
                // parent frame pointer stays live for the unwinder.
                self.leave_targets[i] = Some(target);
                let mut asm = self.asm();
                asm.add_ri(regs::SP, 8);
                asm.ret();
                Ok(())
            }
            EmitContext::FilterExpression(_) => {
                let mut asm = self.asm();
                asm.add_ri(regs::SP, 8);
                asm.ret();
                Ok(())
            }
        }
    }

    pub(super) fn emit_endfinally(&mut self) {
        self.stack.clear();
        let context = self.context;
        let mut asm = self.asm();
        match context {
            EmitContext::MainBody => asm.ret(),
            _ => {
                asm.pop_reg(regs::FP);
                asm.ret();
            }
        }
    }

    pub(super) fn emit_endfilter(&mut self, il_offset: u32) -> Result<(), CompileError> {
        // The int32 verdict returns in RAX.
        self.pop_reg(regs::R0, il_offset)?;
        self.stack.clear();
        let mut asm = self.asm();
        asm.pop_reg(regs::FP);
        asm.ret();
        Ok(())
    }

    // ---- the funclet pass ----

    fn begin_funclet(&mut self, context: EmitContext) -> u32 {
        self.context = context;
        self.stack.clear();
        self.labels.clear();
        self.branch_stacks.clear();
        self.pending.clear();
        self.pending_exception_pop = false;
        let start = self.buf.position() as u32;
        let mut asm = self.asm();
        asm.push_reg(regs::FP);
        asm.mov_rr(regs::FP, regs::R2);
        start
    }

    fn end_funclet(&mut self, clause_index: usize, start: u32, is_filter_expression: bool) {
        let end = self.buf.position() as u32;
        self.funclets.push(FuncletRecord {
            native_start: start,
            native_size: end - start,
            clause_index: clause_index as u32,
            is_filter_expression,
        });
    }

    pub(super) fn compile_funclets(&mut self) -> Result<(), CompileError> {
        for i in 0..self.clauses.len() {
            let clause = self.clauses[i];

            if clause.kind == ClauseKind::Filter {
                let start = self.begin_funclet(EmitContext::FilterExpression(i));
                // The exception arrives in RCX; expose it as a stack value
                // for the filter expression.
                self.stack.push_reg(&mut self.buf, regs::R1, StackKind::ObjectRef);
                self.walk(clause.filter_start() as usize, clause.handler_start as usize)?;
                self.resolve_pending_branches()?;
                self.end_funclet(i, start, true);
                self.filter_starts[i] = start;
            }

            let start = self.begin_funclet(EmitContext::Handler(i));
            if matches!(clause.kind, ClauseKind::Exception | ClauseKind::Filter) {
                self.pending_exception_pop = true;
            }
            self.walk(clause.handler_start as usize, clause.handler_end as usize)?;
            self.resolve_pending_branches()?;
            self.end_funclet(i, start, false);
            self.funclet_starts[i] = start;
        }
        self.context = EmitContext::MainBody;
        Ok(())
    }

    pub(super) fn patch_finally_calls(&mut self) {
        for (patch, clause_index) in std::mem::take(&mut self.finally_patches) {
            let target = self.funclet_starts[clause_index] as usize;
            self.buf.patch_rel32_to(patch, target);
        }
    }

    /// Rewrite the input clauses with native offsets from the label table
    /// and funclet records.
    pub(super) fn translate_clauses(&self) -> Result<Vec<JitExceptionClause>, CompileError> {
        let mut out = Vec::with_capacity(self.clauses.len());
        for (i, clause) in self.clauses.iter().enumerate() {
            let handler = self
                .funclets
                .iter()
                .find(|f| f.clause_index == i as u32 && !f.is_filter_expression)
                .ok_or(CompileError::MalformedClause(i))?;
            let catch_type_method_table = if clause.kind == ClauseKind::Exception {
                self.resolvers
                    .ty
                    .resolve_type(clause.class_token_or_filter)
                    .map(|t| t.method_table)
                    .unwrap_or(0)
            } else {
                0
            };
            out.push(JitExceptionClause {
                kind: clause.kind,
                try_start: self.main_label(clause.try_start),
                try_end: self.main_label(clause.try_end),
                handler_start: handler.native_start,
                handler_end: handler.native_start + handler.native_size,
                leave_target: self.leave_targets[i].map(|t| self.main_label(t)).unwrap_or(0),
                filter_native_or_class_token: if clause.kind == ClauseKind::Filter {
                    self.filter_starts[i]
                } else {
                    clause.class_token_or_filter
                },
                catch_type_method_table,
            });
        }
        Ok(out)
    }
}
