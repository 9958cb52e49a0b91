//! Arithmetic, logic, shifts, conversions, and comparisons.
//!
//! Operands travel as raw 64-bit slots; float values are bit patterns that
//! get shuffled into XMM registers on use. Integer code uses the 32-bit
//! instruction forms when both operands are int32-kind so flags and signed
//! semantics match the CIL model, and promotes mixed operands to 64 bits.

use crate::emit::regs::{self, Xmm};
use crate::emit::Cond;
use crate::error::CompileError;
use crate::il::opcodes as op;
use crate::stack::{EvalStackEntry, StackKind};

use super::MethodCompiler;

/// Result kind for a non-float binary operation.
fn integer_result_kind(a: StackKind, b: StackKind) -> StackKind {
    if a.is_int32_like() && b.is_int32_like() {
        StackKind::Int32
    } else if a.is_pointer_like() || b.is_pointer_like() {
        StackKind::NativeInt
    } else {
        StackKind::Int64
    }
}

impl<'a> MethodCompiler<'a> {
    /// Pop the two operands of a binary op: `b` (top) into R1, `a` into R0.
    fn pop_binary(&mut self, il_offset: u32) -> Result<(EvalStackEntry, EvalStackEntry), CompileError> {
        let b = self.pop_reg(regs::R1, il_offset)?;
        let a = self.pop_reg(regs::R0, il_offset)?;
        Ok((a, b))
    }

    /// Sign-extend int32 operands so 64-bit forms see the right values.
    fn promote_signed(&mut self, a: StackKind, b: StackKind) {
        let mut asm = self.asm();
        if a == StackKind::Int32 {
            asm.movsxd(regs::R0, regs::R0);
        }
        if b == StackKind::Int32 {
            asm.movsxd(regs::R1, regs::R1);
        }
    }

    /// Zero-extend int32 operands for unsigned 64-bit arithmetic.
    fn promote_unsigned(&mut self, a: StackKind, b: StackKind) {
        let mut asm = self.asm();
        if a.is_int32_like() {
            asm.mov_rr32(regs::R0, regs::R0);
        }
        if b.is_int32_like() {
            asm.mov_rr32(regs::R1, regs::R1);
        }
    }

    pub(super) fn emit_binary_or_unary(&mut self, opcode: u8, il_offset: u32) -> Result<(), CompileError> {
        // neg / not are the only unaries in this range.
        if opcode == op::NEG || opcode == op::NOT {
            let entry = self.pop_reg(regs::R0, il_offset)?;
            if entry.kind.is_float() {
                // Flip the IEEE sign bit.
                let bit = if entry.kind == StackKind::Float32 { 31 } else { 63 };
                let mut asm = self.asm();
                asm.mov_ri64(regs::R1, 1u64 << bit);
                asm.xor_rr(regs::R0, regs::R1);
            } else if entry.kind.is_int32_like() {
                let mut asm = self.asm();
                if opcode == op::NEG {
                    asm.neg32(regs::R0);
                } else {
                    asm.not32(regs::R0);
                }
            } else {
                let mut asm = self.asm();
                if opcode == op::NEG {
                    asm.neg(regs::R0);
                } else {
                    asm.not(regs::R0);
                }
            }
            self.stack.push_reg_r0(&mut self.buf, entry.kind);
            return Ok(());
        }

        let (a, b) = self.pop_binary(il_offset)?;
        if a.kind.is_float() || b.kind.is_float() {
            return self.emit_float_binary(opcode, a.kind, b.kind);
        }

        let both32 = a.kind.is_int32_like() && b.kind.is_int32_like();
        let result = integer_result_kind(a.kind, b.kind);
        match opcode {
            op::ADD | op::SUB | op::MUL | op::AND | op::OR | op::XOR => {
                if !both32 {
                    self.promote_signed(a.kind, b.kind);
                }
                let mut asm = self.asm();
                match (opcode, both32) {
                    (op::ADD, true) => asm.add_rr32(regs::R0, regs::R1),
                    (op::ADD, false) => asm.add_rr(regs::R0, regs::R1),
                    (op::SUB, true) => asm.sub_rr32(regs::R0, regs::R1),
                    (op::SUB, false) => asm.sub_rr(regs::R0, regs::R1),
                    (op::MUL, true) => asm.imul_rr32(regs::R0, regs::R1),
                    (op::MUL, false) => asm.imul_rr(regs::R0, regs::R1),
                    (op::AND, true) => asm.and_rr32(regs::R0, regs::R1),
                    (op::AND, false) => asm.and_rr(regs::R0, regs::R1),
                    (op::OR, true) => asm.or_rr32(regs::R0, regs::R1),
                    (op::OR, false) => asm.or_rr(regs::R0, regs::R1),
                    (op::XOR, true) => asm.xor_rr32(regs::R0, regs::R1),
                    _ => asm.xor_rr(regs::R0, regs::R1),
                }
            }
            op::DIV | op::REM => {
                if !both32 {
                    self.promote_signed(a.kind, b.kind);
                }
                let mut asm = self.asm();
                if both32 {
                    asm.cdq();
                    asm.idiv32(regs::R1);
                } else {
                    asm.cqo();
                    asm.idiv(regs::R1);
                }
                if opcode == op::REM {
                    asm.mov_rr(regs::R0, regs::R2);
                }
            }
            op::DIV_UN | op::REM_UN => {
                // Zero-extend 32-bit operands so the 64-bit divide computes
                // the unsigned 32-bit result.
                self.promote_unsigned(a.kind, b.kind);
                let mut asm = self.asm();
                asm.zero_rdx();
                asm.div(regs::R1);
                if opcode == op::REM_UN {
                    asm.mov_rr(regs::R0, regs::R2);
                }
            }
            op::SHL | op::SHR | op::SHR_UN => {
                // Shift count is in CL already (R1 = RCX).
                let value32 = a.kind.is_int32_like();
                let mut asm = self.asm();
                match opcode {
                    op::SHL if value32 => asm.shl_cl32(regs::R0),
                    op::SHL => asm.shl_cl(regs::R0),
                    op::SHR if value32 => asm.sar_cl32(regs::R0),
                    op::SHR => asm.sar_cl(regs::R0),
                    _ => {
                        if value32 {
                            asm.mov_rr32(regs::R0, regs::R0);
                        }
                        asm.shr_cl(regs::R0);
                    }
                }
                self.stack.push_reg_r0(&mut self.buf, a.kind);
                return Ok(());
            }
            _ => {
                return Err(CompileError::UnsupportedOpcode { byte: opcode, offset: il_offset as usize })
            }
        }
        self.stack.push_reg_r0(&mut self.buf, result);
        Ok(())
    }

    fn emit_float_binary(&mut self, opcode: u8, a: StackKind, b: StackKind) -> Result<(), CompileError> {
        let single = a == StackKind::Float32 && b == StackKind::Float32 && opcode != op::REM;
        self.gpr_to_xmm(Xmm::Xmm0, regs::R0, a, !single);
        self.gpr_to_xmm(Xmm::Xmm1, regs::R1, b, !single);
        let mut asm = self.asm();
        match opcode {
            op::ADD if single => asm.addss(Xmm::Xmm0, Xmm::Xmm1),
            op::ADD => asm.addsd(Xmm::Xmm0, Xmm::Xmm1),
            op::SUB if single => asm.subss(Xmm::Xmm0, Xmm::Xmm1),
            op::SUB => asm.subsd(Xmm::Xmm0, Xmm::Xmm1),
            op::MUL if single => asm.mulss(Xmm::Xmm0, Xmm::Xmm1),
            op::MUL => asm.mulsd(Xmm::Xmm0, Xmm::Xmm1),
            op::DIV | op::DIV_UN if single => asm.divss(Xmm::Xmm0, Xmm::Xmm1),
            op::DIV | op::DIV_UN => asm.divsd(Xmm::Xmm0, Xmm::Xmm1),
            op::REM | op::REM_UN => {
                // a - trunc(a / b) * b, computed in double precision.
                asm.movsd_rr(Xmm::Xmm2, Xmm::Xmm0);
                asm.divsd(Xmm::Xmm2, Xmm::Xmm1);
                asm.cvttsd2si(regs::R0, Xmm::Xmm2, true);
                asm.cvtsi2sd(Xmm::Xmm2, regs::R0, true);
                asm.mulsd(Xmm::Xmm2, Xmm::Xmm1);
                asm.subsd(Xmm::Xmm0, Xmm::Xmm2);
            }
            _ => {}
        }
        let result_single = a == StackKind::Float32 && b == StackKind::Float32;
        if result_single && !single {
            asm.cvtsd2ss(Xmm::Xmm0, Xmm::Xmm0);
        }
        if result_single {
            asm.movd_rx(regs::R0, Xmm::Xmm0);
            self.stack.push_reg_r0(&mut self.buf, StackKind::Float32);
        } else {
            asm.movq_rx(regs::R0, Xmm::Xmm0);
            self.stack.push_reg_r0(&mut self.buf, StackKind::Float64);
        }
        Ok(())
    }

    pub(super) fn emit_overflow_arith(&mut self, opcode: u8, il_offset: u32) -> Result<(), CompileError> {
        let (a, b) = self.pop_binary(il_offset)?;
        let both32 = a.kind.is_int32_like() && b.kind.is_int32_like();
        let result = integer_result_kind(a.kind, b.kind);
        match opcode {
            op::ADD_OVF | op::SUB_OVF | op::MUL_OVF => {
                if !both32 {
                    self.promote_signed(a.kind, b.kind);
                }
                {
                    let mut asm = self.asm();
                    match (opcode, both32) {
                        (op::ADD_OVF, true) => asm.add_rr32(regs::R0, regs::R1),
                        (op::ADD_OVF, false) => asm.add_rr(regs::R0, regs::R1),
                        (op::SUB_OVF, true) => asm.sub_rr32(regs::R0, regs::R1),
                        (op::SUB_OVF, false) => asm.sub_rr(regs::R0, regs::R1),
                        (op::MUL_OVF, true) => asm.imul_rr32(regs::R0, regs::R1),
                        _ => asm.imul_rr(regs::R0, regs::R1),
                    }
                }
                self.emit_trap_unless(Cond::No, 4);
            }
            op::ADD_OVF_UN | op::SUB_OVF_UN => {
                self.promote_unsigned(a.kind, b.kind);
                {
                    let mut asm = self.asm();
                    if opcode == op::ADD_OVF_UN {
                        asm.add_rr(regs::R0, regs::R1);
                    } else {
                        asm.sub_rr(regs::R0, regs::R1);
                    }
                }
                // Unsigned overflow is a carry/borrow.
                self.emit_trap_unless(Cond::Ae, 4);
            }
            op::MUL_OVF_UN => {
                self.promote_unsigned(a.kind, b.kind);
                if both32 {
                    // Exact product fits in 64 bits; the high half must be 0.
                    let mut asm = self.asm();
                    asm.imul_rr(regs::R0, regs::R1);
                    asm.mov_rr(regs::R2, regs::R0);
                    asm.shr_imm(regs::R2, 32);
                    asm.test_rr(regs::R2, regs::R2);
                } else {
                    let mut asm = self.asm();
                    asm.mul(regs::R1);
                    asm.test_rr(regs::R2, regs::R2);
                }
                self.emit_trap_unless(Cond::E, 4);
            }
            _ => {
                return Err(CompileError::UnsupportedOpcode { byte: opcode, offset: il_offset as usize })
            }
        }
        self.stack.push_reg_r0(&mut self.buf, result);
        Ok(())
    }

    // ---- comparisons ----

    /// Pop and compare two operands; returns the condition to test, with
    /// signed orderings translated for `comis*` when the operands were
    /// floats.
    pub(super) fn emit_compare_operands(
        &mut self,
        cond: Cond,
        unsigned: bool,
        il_offset: u32,
    ) -> Result<Cond, CompileError> {
        let (a, b) = self.pop_binary(il_offset)?;
        if a.kind.is_float() || b.kind.is_float() {
            let single = a.kind == StackKind::Float32 && b.kind == StackKind::Float32;
            self.gpr_to_xmm(Xmm::Xmm0, regs::R0, a.kind, !single);
            self.gpr_to_xmm(Xmm::Xmm1, regs::R1, b.kind, !single);
            let mut asm = self.asm();
            if single {
                asm.comiss(Xmm::Xmm0, Xmm::Xmm1);
            } else {
                asm.comisd(Xmm::Xmm0, Xmm::Xmm1);
            }
            return Ok(cond.unsigned());
        }

        let both32 = a.kind.is_int32_like() && b.kind.is_int32_like();
        if both32 {
            self.asm().cmp_rr32(regs::R0, regs::R1);
        } else {
            if unsigned {
                self.promote_unsigned(a.kind, b.kind);
            } else {
                self.promote_signed(a.kind, b.kind);
            }
            self.asm().cmp_rr(regs::R0, regs::R1);
        }
        Ok(cond)
    }

    /// `ceq` / `cgt` / `clt` and friends: compare and push 0 or 1.
    pub(super) fn emit_compare(&mut self, cond: Cond, unsigned: bool, il_offset: u32) -> Result<(), CompileError> {
        let cond = self.emit_compare_operands(cond, unsigned, il_offset)?;
        self.asm().setcc_zx(cond, regs::R0);
        self.stack.push_reg_r0(&mut self.buf, StackKind::Int32);
        Ok(())
    }

    // ---- conversions ----

    /// Move the popped value (R0, kind per `entry`) into XMM0 as a double.
    fn operand_to_double(&mut self, kind: StackKind) {
        self.gpr_to_xmm(Xmm::Xmm0, regs::R0, kind, true);
    }

    pub(super) fn emit_conversion(&mut self, opcode: u8, il_offset: u32) -> Result<(), CompileError> {
        let entry = self.pop_reg(regs::R0, il_offset)?;
        let src = entry.kind;
        let src_float = src.is_float();
        match opcode {
            op::CONV_I4 | op::CONV_U4 => {
                if src_float {
                    self.operand_to_double(src);
                    self.asm().cvttsd2si(regs::R0, Xmm::Xmm0, false);
                } else {
                    self.asm().mov_rr32(regs::R0, regs::R0);
                }
                self.stack.push_reg_r0(&mut self.buf, StackKind::Int32);
            }
            op::CONV_I8 | op::CONV_I => {
                if src_float {
                    self.operand_to_double(src);
                    self.asm().cvttsd2si(regs::R0, Xmm::Xmm0, true);
                } else if src == StackKind::Int32 {
                    self.asm().movsxd(regs::R0, regs::R0);
                }
                let kind = if opcode == op::CONV_I { StackKind::NativeInt } else { StackKind::Int64 };
                self.stack.push_reg_r0(&mut self.buf, kind);
            }
            op::CONV_U8 | op::CONV_U => {
                if src_float {
                    self.operand_to_double(src);
                    self.asm().cvttsd2si(regs::R0, Xmm::Xmm0, true);
                } else if src.is_int32_like() {
                    self.asm().mov_rr32(regs::R0, regs::R0);
                }
                let kind = if opcode == op::CONV_U { StackKind::NativeInt } else { StackKind::Int64 };
                self.stack.push_reg_r0(&mut self.buf, kind);
            }
            op::CONV_I1 | op::CONV_U1 | op::CONV_I2 | op::CONV_U2 => {
                if src_float {
                    self.operand_to_double(src);
                    self.asm().cvttsd2si(regs::R0, Xmm::Xmm0, false);
                }
                let mut asm = self.asm();
                match opcode {
                    op::CONV_I1 => asm.movsx8(regs::R0, regs::R0),
                    op::CONV_U1 => asm.movzx8(regs::R0, regs::R0),
                    op::CONV_I2 => asm.movsx16(regs::R0, regs::R0),
                    _ => asm.movzx16(regs::R0, regs::R0),
                }
                self.stack.push_reg_r0(&mut self.buf, StackKind::Int32);
            }
            op::CONV_R4 => {
                let mut asm = self.asm();
                match src {
                    StackKind::Float32 => {}
                    StackKind::Float64 => {
                        asm.movq_xr(Xmm::Xmm0, regs::R0);
                        asm.cvtsd2ss(Xmm::Xmm0, Xmm::Xmm0);
                        asm.movd_rx(regs::R0, Xmm::Xmm0);
                    }
                    StackKind::Int32 => {
                        asm.cvtsi2ss(Xmm::Xmm0, regs::R0, false);
                        asm.movd_rx(regs::R0, Xmm::Xmm0);
                    }
                    _ => {
                        asm.cvtsi2ss(Xmm::Xmm0, regs::R0, true);
                        asm.movd_rx(regs::R0, Xmm::Xmm0);
                    }
                }
                self.stack.push_reg_r0(&mut self.buf, StackKind::Float32);
            }
            op::CONV_R8 => {
                let mut asm = self.asm();
                match src {
                    StackKind::Float64 => {}
                    StackKind::Float32 => {
                        asm.movd_xr(Xmm::Xmm0, regs::R0);
                        asm.cvtss2sd(Xmm::Xmm0, Xmm::Xmm0);
                        asm.movq_rx(regs::R0, Xmm::Xmm0);
                    }
                    StackKind::Int32 => {
                        asm.cvtsi2sd(Xmm::Xmm0, regs::R0, false);
                        asm.movq_rx(regs::R0, Xmm::Xmm0);
                    }
                    _ => {
                        asm.cvtsi2sd(Xmm::Xmm0, regs::R0, true);
                        asm.movq_rx(regs::R0, Xmm::Xmm0);
                    }
                }
                self.stack.push_reg_r0(&mut self.buf, StackKind::Float64);
            }
            op::CONV_R_UN => {
                if src_float {
                    self.operand_to_double(src);
                    self.asm().movq_rx(regs::R0, Xmm::Xmm0);
                } else if src.is_int32_like() {
                    let mut asm = self.asm();
                    asm.mov_rr32(regs::R0, regs::R0);
                    asm.cvtsi2sd(Xmm::Xmm0, regs::R0, true);
                    asm.movq_rx(regs::R0, Xmm::Xmm0);
                } else {
                    self.emit_u64_to_double();
                }
                self.stack.push_reg_r0(&mut self.buf, StackKind::Float64);
            }
            other => {
                return Err(CompileError::UnsupportedOpcode { byte: other, offset: il_offset as usize })
            }
        }
        Ok(())
    }

    /// Unsigned 64 -> double. When the sign bit is set, halve the value
    /// (keeping the low bit) before converting, then double the result.
    /// The result is rounded once; that behavior is fixed.
    fn emit_u64_to_double(&mut self) {
        let direct;
        let done;
        {
            let mut asm = self.asm();
            asm.test_rr(regs::R0, regs::R0);
            direct = asm.jcc_placeholder(Cond::Ns);
            asm.mov_rr(regs::R1, regs::R0);
            asm.and_ri(regs::R1, 1);
            asm.shr_imm(regs::R0, 1);
            asm.or_rr(regs::R0, regs::R1);
            asm.cvtsi2sd(Xmm::Xmm0, regs::R0, true);
            asm.addsd(Xmm::Xmm0, Xmm::Xmm0);
            done = asm.jmp_placeholder();
        }
        self.buf.patch_rel32(direct);
        self.asm().cvtsi2sd(Xmm::Xmm0, regs::R0, true);
        self.buf.patch_rel32(done);
        self.asm().movq_rx(regs::R0, Xmm::Xmm0);
    }

    pub(super) fn emit_checked_conversion(&mut self, opcode: u8, il_offset: u32) -> Result<(), CompileError> {
        let entry = self.pop_reg(regs::R0, il_offset)?;
        let src = entry.kind;
        if src.is_float() {
            self.operand_to_double(src);
            self.asm().cvttsd2si(regs::R0, Xmm::Xmm0, true);
        }

        // (min, max, unsigned source, narrowing, result kind)
        let src32 = src.is_int32_like();
        let (min, max, unsigned_src) = match opcode {
            op::CONV_OVF_I1 => (Some(-128i64), Some(127u64), false),
            op::CONV_OVF_U1 => (Some(0), Some(255), false),
            op::CONV_OVF_I2 => (Some(-32768), Some(32767), false),
            op::CONV_OVF_U2 => (Some(0), Some(65535), false),
            op::CONV_OVF_I4 => (Some(i32::MIN as i64), Some(i32::MAX as u64), false),
            op::CONV_OVF_U4 => (Some(0), Some(u32::MAX as u64), false),
            op::CONV_OVF_I8 | op::CONV_OVF_I => (None, None, false),
            op::CONV_OVF_U8 | op::CONV_OVF_U => (Some(0), None, false),
            op::CONV_OVF_I1_UN => (None, Some(127), true),
            op::CONV_OVF_U1_UN => (None, Some(255), true),
            op::CONV_OVF_I2_UN => (None, Some(32767), true),
            op::CONV_OVF_U2_UN => (None, Some(65535), true),
            op::CONV_OVF_I4_UN => (None, Some(i32::MAX as u64), true),
            op::CONV_OVF_U4_UN => (None, Some(u32::MAX as u64), true),
            op::CONV_OVF_I8_UN | op::CONV_OVF_I_UN => (None, Some(i64::MAX as u64), true),
            op::CONV_OVF_U8_UN | op::CONV_OVF_U_UN => (None, None, true),
            other => {
                return Err(CompileError::UnsupportedOpcode { byte: other, offset: il_offset as usize })
            }
        };

        // Widen the source so the checks run on the full value.
        if src32 && !src.is_float() {
            let mut asm = self.asm();
            if unsigned_src {
                asm.mov_rr32(regs::R0, regs::R0);
            } else {
                asm.movsxd(regs::R0, regs::R0);
            }
        }

        if let Some(max) = max {
            let skip_min_handled = unsigned_src;
            let mut asm = self.asm();
            asm.mov_ri64(regs::R1, max);
            asm.cmp_rr(regs::R0, regs::R1);
            drop(asm);
            self.emit_trap_unless(if skip_min_handled { Cond::Be } else { Cond::Le }, 4);
        }
        match min {
            Some(0) if !unsigned_src => {
                self.asm().test_rr(regs::R0, regs::R0);
                self.emit_trap_unless(Cond::Ns, 4);
            }
            Some(min) if min != 0 => {
                let mut asm = self.asm();
                asm.mov_ri64(regs::R1, min as u64);
                asm.cmp_rr(regs::R0, regs::R1);
                drop(asm);
                self.emit_trap_unless(Cond::Ge, 4);
            }
            _ => {}
        }

        // Narrow to the declared width and push.
        let kind = match opcode {
            op::CONV_OVF_I1 | op::CONV_OVF_I1_UN => {
                self.asm().movsx8(regs::R0, regs::R0);
                StackKind::Int32
            }
            op::CONV_OVF_U1 | op::CONV_OVF_U1_UN => {
                self.asm().movzx8(regs::R0, regs::R0);
                StackKind::Int32
            }
            op::CONV_OVF_I2 | op::CONV_OVF_I2_UN => {
                self.asm().movsx16(regs::R0, regs::R0);
                StackKind::Int32
            }
            op::CONV_OVF_U2 | op::CONV_OVF_U2_UN => {
                self.asm().movzx16(regs::R0, regs::R0);
                StackKind::Int32
            }
            op::CONV_OVF_I4 | op::CONV_OVF_I4_UN | op::CONV_OVF_U4 | op::CONV_OVF_U4_UN => {
                self.asm().mov_rr32(regs::R0, regs::R0);
                StackKind::Int32
            }
            op::CONV_OVF_I | op::CONV_OVF_U | op::CONV_OVF_I_UN | op::CONV_OVF_U_UN => StackKind::NativeInt,
            _ => StackKind::Int64,
        };
        self.stack.push_reg_r0(&mut self.buf, kind);
        Ok(())
    }

    /// Trap when the top-of-stack float's exponent field is all ones
    /// (infinity or NaN). Leaves the value in place.
    pub(super) fn emit_ckfinite(&mut self, il_offset: u32) -> Result<(), CompileError> {
        let top = *self.stack.peek(0).ok_or_else(|| self.stack_underflow(il_offset))?;
        let (shift, mask) = if top.kind == StackKind::Float32 { (23, 0xFF) } else { (52, 0x7FF) };
        let mut asm = self.asm();
        asm.load64(regs::R0, regs::SP, 0);
        asm.shr_imm(regs::R0, shift);
        asm.and_ri(regs::R0, mask);
        asm.cmp_ri(regs::R0, mask);
        drop(asm);
        self.emit_trap_unless(Cond::Ne, 4);
        Ok(())
    }
}
