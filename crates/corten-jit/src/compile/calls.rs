//! Managed call lowering: direct, virtual, interface, delegate, calli,
//! varargs, tail calls, and the return paths of the current method.
//!
//! The Win64 shape is fixed: first four slots in RCX/RDX/R8/R9 (floats
//! duplicated into XMM0..XMM3), overflow slots at `[RSP+32]` up, 32 bytes
//! of shadow space under every call, RSP 16-aligned at the call. Large
//! struct returns insert a hidden buffer pointer at slot 0 and shift
//! everything right by one.

use crate::emit::regs::{self, Reg, ARG_REGS, ARG_XMM};
use crate::emit::Cond;
use crate::error::CompileError;
use crate::resolve::{Intrinsic, ResolvedMethod, ReturnKind};
use crate::runtime::object::{DELEGATE_FNPTR_OFFSET, DELEGATE_TARGET_OFFSET, MT_VTABLE_OFFSET};
use crate::stack::{copy_block, EvalStackEntry, StackKind};

use super::dispatch::Prefixes;
use super::MethodCompiler;

/// Callee-saved temporaries used to keep argument registers alive across
/// helper calls, indexed by argument slot.
const SAVED_ARG_TEMPS: [Reg; 4] = [regs::R7, regs::R8V, regs::R9V, regs::R10V];

/// Physical shape of one lowered call.
pub(super) struct CallShape {
    /// IL-stack operand count (`this` + declared + varargs).
    operands: usize,
    /// Register/stack slots: retbuf + this + declared.
    n_slots: usize,
    ret_buf: bool,
    ret_kind: ReturnKind,
    ret_size: u32,
    /// Float kind per slot (0/4/8); slot 0 is the retbuf when present.
    slot_float: Vec<u8>,
    vararg_mts: Vec<usize>,
}

impl CallShape {
    pub(super) fn from_method(rm: &ResolvedMethod) -> CallShape {
        let ret_buf = rm.needs_return_buffer();
        let n_slots = (rm.arg_count + rm.has_this as u16 + ret_buf as u16) as usize;
        let mut slot_float = vec![0u8; n_slots];
        let fixed = ret_buf as usize + rm.has_this as usize;
        for (i, &fk) in rm.arg_float_kind.iter().enumerate() {
            if fixed + i < n_slots {
                slot_float[fixed + i] = fk;
            }
        }
        CallShape {
            operands: rm.has_this as usize + rm.arg_count as usize + rm.vararg_method_tables.len(),
            n_slots,
            ret_buf,
            ret_kind: rm.return_kind,
            ret_size: rm.return_struct_size,
            slot_float,
            vararg_mts: rm.vararg_method_tables.clone(),
        }
    }

    /// Shape of a constructor call from `newobj`: the declared arguments
    /// come from the stack, `this` is synthesized, nothing returns.
    pub(super) fn for_ctor(rm: &ResolvedMethod) -> CallShape {
        let n_slots = rm.arg_count as usize + 1;
        let mut slot_float = vec![0u8; n_slots];
        for (i, &fk) in rm.arg_float_kind.iter().enumerate() {
            if 1 + i < n_slots {
                slot_float[1 + i] = fk;
            }
        }
        CallShape {
            operands: rm.arg_count as usize,
            n_slots,
            ret_buf: false,
            ret_kind: ReturnKind::Void,
            ret_size: 0,
            slot_float,
            vararg_mts: Vec::new(),
        }
    }
}

/// Where the `this` argument of a lowered call comes from.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(super) enum ThisSource {
    /// On the evaluation stack like every other operand.
    Operand,
    /// Synthesized address of a frame temporary (value-type `newobj`).
    FrameAddr(i32),
    /// Already materialized in a register (`newobj` of a reference type).
    Reg(Reg),
}

/// What the post-call cleanup and result push must do.
pub(super) struct StagedCall {
    /// Bytes to release right after the call.
    cleanup: i32,
    /// Tracker entries consumed by the call (popped after cleanup).
    tracked_pops: usize,
    /// Footprint of the struct-return entry left on the stack, 0 if none.
    result_bytes: u32,
}

impl<'a> MethodCompiler<'a> {
    pub(super) fn call_reg_with_safe_point(&mut self, reg: Reg) {
        let mut asm = self.asm();
        asm.call_reg(reg);
        let after = asm.position();
        drop(asm);
        self.gc.add_safe_point(after);
    }

    /// Duplicate a float bit pattern from an argument GPR into its XMM slot.
    fn dup_float_arg(&mut self, slot: usize, float_kind: u8) {
        let mut asm = self.asm();
        match float_kind {
            8 => asm.movq_xr(ARG_XMM[slot], ARG_REGS[slot]),
            4 => asm.movd_xr(ARG_XMM[slot], ARG_REGS[slot]),
            _ => {}
        }
    }

    /// Move argument values into ABI position and allocate the call frame.
    ///
    /// With a synthetic `this`, slot `retbuf + 0` is filled from
    /// `this_source` and the evaluation-stack operands cover only the
    /// declared arguments.
    pub(super) fn stage_call_args(
        &mut self,
        shape: &CallShape,
        this_source: ThisSource,
        il_offset: u32,
    ) -> Result<StagedCall, CompileError> {
        let m = shape.operands;
        let this_slot = shape.ret_buf as usize;
        let synthetic = this_source != ThisSource::Operand;
        let operand_of = move |slot: usize, ret_buf: bool| -> usize {
            slot - ret_buf as usize - (synthetic && slot > this_slot) as usize
        };
        if self.stack.depth() < m {
            return Err(self.stack_underflow(il_offset));
        }

        let ret_bytes = if shape.ret_buf {
            crate::stack::value_type_footprint(shape.ret_size)
        } else {
            0
        };
        let overflow = shape.n_slots.saturating_sub(4);
        let vararg_bytes = if shape.vararg_mts.is_empty() {
            0
        } else {
            (shape.vararg_mts.len() + 1) * 16
        };
        let call_frame = 32 + overflow as i32 * 8 + vararg_bytes as i32;

        let all_single = (0..m).all(|i| self.stack.peek(i).map(|e| e.byte_size) == Some(8));
        let fast = shape.n_slots <= 4 && vararg_bytes == 0 && all_single;

        if fast {
            // Pop straight into the argument registers, last operand first.
            for slot in (shape.ret_buf as usize..shape.n_slots).rev() {
                if synthetic && slot == this_slot {
                    continue;
                }
                self.pop_reg(ARG_REGS[slot], il_offset)?;
                self.dup_float_arg(slot, shape.slot_float[slot]);
            }
            match this_source {
                ThisSource::Operand => {}
                ThisSource::FrameAddr(offset) => self.asm().lea(ARG_REGS[this_slot], regs::FP, offset),
                ThisSource::Reg(reg) => self.asm().mov_rr(ARG_REGS[this_slot], reg),
            }
            let below = self.stack.total_bytes() as i32 + 32 + ret_bytes as i32;
            let pad = (16 - below % 16) % 16;
            let mut asm = self.asm();
            asm.sub_ri(regs::SP, 32 + pad + ret_bytes as i32);
            if shape.ret_buf {
                asm.lea(ARG_REGS[0], regs::SP, 32 + pad);
            }
            return Ok(StagedCall {
                cleanup: 32 + pad,
                tracked_pops: 0,
                result_bytes: ret_bytes,
            });
        }

        // General path: the operands stay on the evaluation stack through
        // the call; registers and overflow slots are loaded from them by
        // offset, large structs are passed by address into the same data.
        let total_s: u32 = (0..m).map(|i| self.stack.peek(i).map(|e| e.byte_size).unwrap_or(0)).sum();
        let offset_of = |stack: &crate::stack::EvalStack, operand: usize| -> i32 {
            // `operand` is in push order; peek indexes from the top.
            stack.peek_rsp_offset(m - 1 - operand)
        };

        // Phase 1: register slots whose value fits in one slot.
        for slot in 0..shape.n_slots.min(4) {
            if (shape.ret_buf && slot == 0) || (synthetic && slot == this_slot) {
                continue;
            }
            let operand = operand_of(slot, shape.ret_buf);
            let entry = *self.stack.peek(m - 1 - operand).unwrap();
            if entry.byte_size > 8 {
                continue; // address computed after the frame shifts
            }
            let src = offset_of(&self.stack, operand);
            self.asm().load64(ARG_REGS[slot], regs::SP, src);
            self.dup_float_arg(slot, shape.slot_float[slot]);
        }

        let below = self.stack.total_bytes() as i32 + call_frame + ret_bytes as i32;
        let pad = (16 - below % 16) % 16;
        let adjust = call_frame + pad + ret_bytes as i32;
        self.asm().sub_ri(regs::SP, adjust);

        // Phase 2: everything that needs the final RSP.
        for slot in 0..shape.n_slots {
            if shape.ret_buf && slot == 0 {
                self.asm().lea(ARG_REGS[0], regs::SP, call_frame + pad);
                continue;
            }
            if synthetic && slot == this_slot {
                match this_source {
                    ThisSource::FrameAddr(offset) => self.asm().lea(ARG_REGS[this_slot], regs::FP, offset),
                    ThisSource::Reg(reg) => self.asm().mov_rr(ARG_REGS[this_slot], reg),
                    ThisSource::Operand => {}
                }
                continue;
            }
            let operand = operand_of(slot, shape.ret_buf);
            let entry = *self.stack.peek(m - 1 - operand).unwrap();
            let src = adjust + offset_of(&self.stack, operand);
            if slot < 4 {
                if entry.byte_size > 8 {
                    self.asm().lea(ARG_REGS[slot], regs::SP, src);
                }
            } else {
                let dest = 32 + (slot as i32 - 4) * 8;
                let mut asm = self.asm();
                if entry.byte_size > 8 {
                    asm.lea(regs::R0, regs::SP, src);
                } else {
                    asm.load64(regs::R0, regs::SP, src);
                }
                asm.store64(regs::SP, dest, regs::R0);
            }
        }

        // Phase 3: the TypedReference array for the variadic tail.
        if !shape.vararg_mts.is_empty() {
            let base = 32 + overflow as i32 * 8;
            let first_vararg = m - shape.vararg_mts.len();
            let vararg_mts = shape.vararg_mts.clone();
            for (v, mt) in vararg_mts.iter().enumerate() {
                let src = adjust + offset_of(&self.stack, first_vararg + v);
                let mut asm = self.asm();
                asm.lea(regs::R0, regs::SP, src);
                asm.store64(regs::SP, base + v as i32 * 16, regs::R0);
                asm.mov_ri64(regs::R0, *mt as u64);
                asm.store64(regs::SP, base + v as i32 * 16 + 8, regs::R0);
            }
            let sentinel = base + vararg_mts.len() as i32 * 16;
            let mut asm = self.asm();
            asm.xor_rr32(regs::R0, regs::R0);
            asm.store64(regs::SP, sentinel, regs::R0);
            asm.store64(regs::SP, sentinel + 8, regs::R0);
        }

        Ok(StagedCall {
            // Releasing the frame also releases the consumed operands;
            // with a return buffer they ride along in its footprint.
            cleanup: if shape.ret_buf {
                call_frame + pad
            } else {
                call_frame + pad + total_s as i32
            },
            tracked_pops: m,
            result_bytes: if shape.ret_buf { ret_bytes + total_s } else { 0 },
        })
    }

    /// Post-call: release the frame, settle the tracker, push the result.
    pub(super) fn finish_call(&mut self, shape: &CallShape, staged: StagedCall, il_offset: u32) -> Result<(), CompileError> {
        if staged.cleanup != 0 {
            self.asm().add_ri(regs::SP, staged.cleanup);
        }
        for _ in 0..staged.tracked_pops {
            self.stack.pop().ok_or_else(|| self.stack_underflow(il_offset))?;
        }

        match shape.ret_kind {
            ReturnKind::Void => {}
            ReturnKind::Int32 => {
                // Preserve signed int32 semantics in the 64-bit slot.
                self.asm().movsxd(regs::R0, regs::R0);
                self.stack.push_reg_r0(&mut self.buf, StackKind::Int32);
            }
            ReturnKind::Int64 => self.stack.push_reg_r0(&mut self.buf, StackKind::Int64),
            ReturnKind::IntPtr => self.stack.push_reg_r0(&mut self.buf, StackKind::NativeInt),
            ReturnKind::Float32 => {
                self.asm().movd_rx(regs::R0, ARG_XMM[0]);
                self.stack.push_reg_r0(&mut self.buf, StackKind::Float32);
            }
            ReturnKind::Float64 => {
                self.asm().movq_rx(regs::R0, ARG_XMM[0]);
                self.stack.push_reg_r0(&mut self.buf, StackKind::Float64);
            }
            ReturnKind::Struct => {
                if shape.ret_buf {
                    self.stack.push(EvalStackEntry {
                        kind: StackKind::ValueType,
                        raw_size: shape.ret_size,
                        byte_size: staged.result_bytes,
                    });
                } else if shape.ret_size > 8 {
                    // RDX:RAX with RAX at the lower address.
                    let mut asm = self.asm();
                    asm.push_reg(regs::R2);
                    asm.push_reg(regs::R0);
                    drop(asm);
                    self.stack.push(EvalStackEntry {
                        kind: StackKind::ValueType,
                        raw_size: shape.ret_size,
                        byte_size: 16,
                    });
                } else {
                    self.asm().push_reg(regs::R0);
                    self.stack.push(EvalStackEntry::value_type(shape.ret_size));
                }
            }
        }
        Ok(())
    }

    /// Spill the live argument registers to callee-saved temporaries.
    fn save_arg_regs(&mut self, shape: &CallShape) {
        for slot in 0..shape.n_slots.min(4) {
            self.asm().mov_rr(SAVED_ARG_TEMPS[slot], ARG_REGS[slot]);
        }
    }

    /// Restore the argument registers (and their XMM duplicates).
    fn restore_arg_regs(&mut self, shape: &CallShape) {
        for slot in 0..shape.n_slots.min(4) {
            self.asm().mov_rr(ARG_REGS[slot], SAVED_ARG_TEMPS[slot]);
            self.dup_float_arg(slot, shape.slot_float[slot]);
        }
    }

    // ---- call / callvirt ----

    pub(super) fn emit_call(&mut self, token: u32, is_callvirt: bool, il_offset: u32) -> Result<(), CompileError> {
        let rm = self
            .resolvers
            .method
            .resolve_method(token)
            .ok_or(CompileError::MethodResolution { token })?;

        match rm.intrinsic {
            Intrinsic::None | Intrinsic::DelegateInvoke => {}
            _ => return self.emit_intrinsic_call(&rm, il_offset),
        }

        // tail. on a self-recursive static call becomes a jump to the top.
        if self.prefixes.contains(Prefixes::TAIL)
            && token == self.desc.method_token
            && !rm.has_this
            && rm.vararg_method_tables.is_empty()
        {
            return self.emit_self_tail_call(&rm, il_offset);
        }

        let mut constrained = None;
        if is_callvirt && self.prefixes.contains(Prefixes::CONSTRAINED) {
            if let Some(ct) = self.constrained_token {
                constrained = Some(self.resolve_type_token(ct)?);
            }
        }

        let shape = CallShape::from_method(&rm);

        if let Some(ct) = &constrained {
            if !ct.is_value_type {
                // The managed pointer holds a reference; dereference it in
                // place and dispatch normally.
                let this_off = self.stack.peek_rsp_offset(shape.operands - 1);
                let mut asm = self.asm();
                asm.load64(regs::R0, regs::SP, this_off);
                asm.load64(regs::R0, regs::R0, 0);
                asm.store64(regs::SP, this_off, regs::R0);
            } else if rm.intrinsic == Intrinsic::PrimitiveEquals {
                return self.emit_primitive_equals(ct, il_offset);
            } else {
                // Box the value in place; the boxed reference replaces the
                // managed pointer and normal vtable dispatch follows.
                let this_off = self.stack.peek_rsp_offset(shape.operands - 1);
                self.asm().mov_ri64(regs::R1, ct.method_table as u64);
                self.emit_helper_call(self.helpers.new_fast_addr());
                let mut asm = self.asm();
                asm.load64(regs::R1, regs::SP, this_off);
                asm.mov_rr(regs::R2, regs::R0);
                copy_block(&mut asm, regs::R2, 8, regs::R1, 0, ct.size.max(1));
                asm.store64(regs::SP, this_off, regs::R2);
            }
        }

        let staged = self.stage_call_args(&shape, ThisSource::Operand, il_offset)?;
        let this_slot = shape.ret_buf as usize;

        let use_virtual_dispatch =
            is_callvirt && rm.is_virtual && rm.interface_method_table == 0 && rm.intrinsic != Intrinsic::DelegateInvoke;

        if rm.intrinsic == Intrinsic::DelegateInvoke {
            self.emit_delegate_invoke(&shape, this_slot);
        } else if is_callvirt && rm.interface_method_table != 0 {
            // Interface dispatch resolves the concrete target at runtime.
            self.save_arg_regs(&shape);
            {
                let helper_addr = self.helpers.get_interface_method_addr() as u64;
                let mut asm = self.asm();
                asm.mov_rr(regs::R1, SAVED_ARG_TEMPS[this_slot]);
                asm.mov_ri64(regs::R2, rm.interface_method_table as u64);
                asm.mov_ri32(regs::R3, rm.interface_method_index as i32);
                asm.mov_ri64(regs::R0, helper_addr);
            }
            self.call_reg_with_safe_point(regs::R0);
            self.asm().mov_rr(regs::R6, regs::R0);
            self.restore_arg_regs(&shape);
            self.call_reg_with_safe_point(regs::R6);
        } else if use_virtual_dispatch {
            if rm.native_code == 0 {
                self.save_arg_regs(&shape);
                {
                    let helper_addr = self.helpers.ensure_vtable_slot_addr() as u64;
                    let mut asm = self.asm();
                    asm.mov_rr(regs::R1, SAVED_ARG_TEMPS[this_slot]);
                    asm.mov_ri32(regs::R2, rm.vtable_slot as i32);
                    asm.mov_ri64(regs::R0, helper_addr);
                }
                self.call_reg_with_safe_point(regs::R0);
                self.restore_arg_regs(&shape);
            }
            let mut asm = self.asm();
            asm.load64(regs::R0, ARG_REGS[this_slot], 0);
            asm.load64(
                regs::R0,
                regs::R0,
                MT_VTABLE_OFFSET + rm.vtable_slot as i32 * 8,
            );
            drop(asm);
            self.call_reg_with_safe_point(regs::R0);
        } else {
            self.emit_direct_target(&rm, &shape);
        }

        self.finish_call(&shape, staged, il_offset)
    }

    /// Direct call: straight to the code, or through the registry slot
    /// when the target is still compiling.
    pub(super) fn emit_direct_target(&mut self, rm: &ResolvedMethod, shape: &CallShape) {
        if rm.native_code != 0 {
            self.asm().mov_ri64(regs::R0, rm.native_code as u64);
            self.call_reg_with_safe_point(regs::R0);
            return;
        }
        // Lazy target: EnsureCompiled fills the registry slot, then the
        // call goes through it. The argument registers must survive the
        // helper, so they sit in callee-saved temporaries meanwhile.
        self.save_arg_regs(shape);
        {
            let helper_addr = self.helpers.ensure_compiled_addr() as u64;
            let mut asm = self.asm();
            asm.mov_ri32(regs::R1, rm.method_token as i32);
            asm.mov_ri32(regs::R2, rm.assembly_id as i32);
            asm.mov_ri64(regs::R0, helper_addr);
        }
        self.call_reg_with_safe_point(regs::R0);
        self.restore_arg_regs(shape);
        let mut asm = self.asm();
        asm.mov_ri64(regs::R0, rm.registry_entry as u64);
        asm.load64(regs::R0, regs::R0, crate::runtime::registry::NATIVE_CODE_OFFSET);
        drop(asm);
        self.call_reg_with_safe_point(regs::R0);
    }

    /// Delegate invoke: pick the static or instance convention at runtime.
    fn emit_delegate_invoke(&mut self, shape: &CallShape, this_slot: usize) {
        let instance_path;
        let done;
        {
            let mut asm = self.asm();
            asm.load64(regs::R5, ARG_REGS[this_slot], DELEGATE_TARGET_OFFSET);
            asm.load64(regs::R6, ARG_REGS[this_slot], DELEGATE_FNPTR_OFFSET);
            asm.test_rr(regs::R5, regs::R5);
            instance_path = asm.jcc_placeholder(Cond::Ne);
        }
        // Static target: the delegate slot vanishes, every argument
        // register shifts down one.
        {
            let max = shape.n_slots.min(4);
            let mut asm = self.asm();
            for slot in this_slot..max.saturating_sub(1) {
                asm.mov_rr(ARG_REGS[slot], ARG_REGS[slot + 1]);
            }
        }
        for slot in this_slot..shape.n_slots.min(4).saturating_sub(1) {
            self.dup_float_arg(slot, *shape.slot_float.get(slot + 1).unwrap_or(&0));
        }
        self.call_reg_with_safe_point(regs::R6);
        {
            let mut asm = self.asm();
            done = asm.jmp_placeholder();
        }
        self.buf.patch_rel32(instance_path);
        self.asm().mov_rr(ARG_REGS[this_slot], regs::R5);
        self.call_reg_with_safe_point(regs::R6);
        self.buf.patch_rel32(done);
    }

    /// Inline `Equals` for a primitive under `constrained.`: null and
    /// MethodTable checks on the argument, then a value compare.
    fn emit_primitive_equals(
        &mut self,
        ct: &crate::resolve::ResolvedType,
        il_offset: u32,
    ) -> Result<(), CompileError> {
        self.pop_reg(regs::R1, il_offset)?; // boxed argument
        self.pop_reg(regs::R0, il_offset)?; // managed pointer to this
        let not_equal_a;
        let not_equal_b;
        let done;
        {
            let mut asm = self.asm();
            asm.test_rr(regs::R1, regs::R1);
            not_equal_a = asm.jcc_placeholder(Cond::E);
            asm.load64(regs::R2, regs::R1, 0);
            asm.mov_ri64(regs::R3, ct.method_table as u64);
            asm.cmp_rr(regs::R2, regs::R3);
            not_equal_b = asm.jcc_placeholder(Cond::Ne);
            if ct.size <= 4 {
                asm.load32_zx(regs::R2, regs::R0, 0);
                asm.load32_zx(regs::R3, regs::R1, 8);
                asm.cmp_rr32(regs::R2, regs::R3);
            } else {
                asm.load64(regs::R2, regs::R0, 0);
                asm.load64(regs::R3, regs::R1, 8);
                asm.cmp_rr(regs::R2, regs::R3);
            }
            asm.setcc_zx(Cond::E, regs::R0);
            done = asm.jmp_placeholder();
        }
        self.buf.patch_rel32(not_equal_a);
        self.buf.patch_rel32(not_equal_b);
        self.asm().xor_rr32(regs::R0, regs::R0);
        self.buf.patch_rel32(done);
        self.stack.push_reg_r0(&mut self.buf, StackKind::Int32);
        Ok(())
    }

    /// Self-recursive `tail.` call: recycle the current frame.
    fn emit_self_tail_call(&mut self, rm: &ResolvedMethod, il_offset: u32) -> Result<(), CompileError> {
        let n = rm.arg_count as usize;
        for i in (0..n).rev() {
            self.pop_reg(regs::R0, il_offset)?;
            let offset = self.frame.arg_home_offset(i as u16);
            self.asm().store64(regs::FP, offset, regs::R0);
        }
        let entry = self.main_label_or_current(0);
        self.asm().jmp_to(entry as usize);
        // The mandatory `ret` that follows is dead code; give it the
        // return value the verifier's stack model expects.
        let phantom = match rm.return_kind {
            ReturnKind::Void => None,
            ReturnKind::Int32 => Some(StackKind::Int32),
            ReturnKind::Int64 => Some(StackKind::Int64),
            ReturnKind::IntPtr => Some(StackKind::NativeInt),
            ReturnKind::Float32 => Some(StackKind::Float32),
            ReturnKind::Float64 => Some(StackKind::Float64),
            ReturnKind::Struct => Some(StackKind::ValueType),
        };
        if let Some(kind) = phantom {
            if kind == StackKind::ValueType {
                self.stack.push(EvalStackEntry::value_type(rm.return_struct_size));
            } else {
                self.stack.push(EvalStackEntry::scalar(kind));
            }
        }
        Ok(())
    }

    fn main_label_or_current(&self, il_offset: u32) -> u32 {
        self.labels
            .get(&il_offset)
            .copied()
            .unwrap_or(self.prologue_size)
    }

    // ---- calli ----

    pub(super) fn emit_calli(&mut self, token: u32, il_offset: u32) -> Result<(), CompileError> {
        let sig = self
            .resolvers
            .method
            .resolve_signature(token)
            .ok_or(CompileError::MethodResolution { token })?;

        // The function pointer sits on top, above the arguments.
        self.pop_reg(regs::R5, il_offset)?;

        let ret_buf = sig.return_kind == ReturnKind::Struct && sig.return_struct_size > 16;
        let n_slots = (sig.arg_count + sig.has_this as u16 + ret_buf as u16) as usize;
        let mut slot_float = vec![0u8; n_slots];
        let fixed = ret_buf as usize + sig.has_this as usize;
        for (i, &fk) in sig.arg_float_kind.iter().enumerate() {
            if fixed + i < n_slots {
                slot_float[fixed + i] = fk;
            }
        }
        let shape = CallShape {
            operands: sig.has_this as usize + sig.arg_count as usize,
            n_slots,
            ret_buf,
            ret_kind: sig.return_kind,
            ret_size: sig.return_struct_size,
            slot_float,
            vararg_mts: Vec::new(),
        };

        let staged = self.stage_call_args(&shape, ThisSource::Operand, il_offset)?;
        self.call_reg_with_safe_point(regs::R5);
        self.finish_call(&shape, staged, il_offset)
    }

    // ---- jmp ----

    /// `jmp`: tear the frame down and transfer to a same-signature method,
    /// arguments reloaded from their home slots.
    pub(super) fn emit_jmp_method(&mut self, token: u32) -> Result<(), CompileError> {
        let rm = self
            .resolvers
            .method
            .resolve_method(token)
            .ok_or(CompileError::MethodResolution { token })?;
        let frame = self.frame;
        let homed = frame.physical_arg_count().min(4);
        {
            let mut asm = self.asm();
            for phys in 0..homed {
                asm.load64(ARG_REGS[phys as usize], regs::FP, frame.arg_home_offset_physical(phys));
            }
        }
        for phys in 0..homed {
            let il_arg = phys.checked_sub(frame.ret_buf as u16);
            let fk = il_arg
                .and_then(|i| self.desc.arg_float_kind.get(i as usize).copied())
                .unwrap_or(0);
            self.dup_float_arg(phys as usize, fk);
        }
        {
            let frame = self.frame;
            let mut asm = self.asm();
            for (i, reg) in crate::frame::SAVED_REGS.iter().enumerate() {
                asm.load64(*reg, regs::FP, frame.saved_reg_offset(i));
            }
            asm.mov_rr(regs::SP, regs::FP);
            asm.pop_reg(regs::FP);
            if rm.native_code != 0 {
                asm.mov_ri64(regs::R0, rm.native_code as u64);
            } else {
                asm.mov_ri64(regs::R0, rm.registry_entry as u64);
                asm.load64(regs::R0, regs::R0, crate::runtime::registry::NATIVE_CODE_OFFSET);
            }
            asm.jmp_reg(regs::R0);
        }
        self.stack.clear();
        Ok(())
    }

    // ---- ret ----

    pub(super) fn emit_ret(&mut self, il_offset: u32) -> Result<(), CompileError> {
        let desc = self.desc;
        if desc.return_is_value_type {
            let size = desc.return_type_size as u32;
            if self.frame.ret_buf {
                // Copy the result into the caller's buffer; the buffer
                // address is also the return value.
                let entry = *self.stack.peek(0).ok_or_else(|| self.stack_underflow(il_offset))?;
                let ret_buf_home_offset = self.frame.ret_buf_home_offset();
                self.asm().load64(regs::R1, regs::FP, ret_buf_home_offset);
                let mut asm = self.asm();
                copy_block(&mut asm, regs::R1, 0, regs::SP, 0, size);
                asm.add_ri(regs::SP, entry.byte_size as i32);
                asm.mov_rr(regs::R0, regs::R1);
                drop(asm);
                self.stack.pop();
            } else if size > 8 {
                // RDX:RAX, low half in RAX.
                let entry = *self.stack.peek(0).ok_or_else(|| self.stack_underflow(il_offset))?;
                let mut asm = self.asm();
                asm.load64(regs::R0, regs::SP, 0);
                asm.load64(regs::R2, regs::SP, 8);
                asm.add_ri(regs::SP, entry.byte_size as i32);
                drop(asm);
                self.stack.pop();
            } else {
                self.pop_reg(regs::R0, il_offset)?;
            }
        } else if desc.return_type_size != 0 || desc.return_float_kind != 0 {
            let entry = self.pop_reg(regs::R0, il_offset)?;
            match desc.return_float_kind {
                8 => self.gpr_to_xmm(ARG_XMM[0], regs::R0, StackKind::Float64, false),
                4 => self.gpr_to_xmm(ARG_XMM[0], regs::R0, StackKind::Float32, false),
                _ => {
                    let _ = entry;
                }
            }
        }
        self.emit_epilogue();
        // Anything tracked past a return is dead; branch targets restore
        // their own depth.
        self.stack.clear();
        Ok(())
    }
}
