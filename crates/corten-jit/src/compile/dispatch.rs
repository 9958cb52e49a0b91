//! The per-opcode dispatch loop.
//!
//! One forward pass per region: record a label at every opcode boundary,
//! restore the tracked stack at branch targets, read the opcode and its
//! inline operands, and hand off to the per-family emitters. Prefix
//! opcodes set sticky bits the next real instruction consumes.

use bitflags::bitflags;

use crate::emit::regs;
use crate::emit::Cond;
use crate::error::CompileError;
use crate::il::opcodes as op;
use crate::il::IlCursor;
use crate::stack::{EvalStackEntry, StackKind};

use super::{EmitContext, MethodCompiler};

bitflags! {
    /// Sticky IL prefixes, cleared after the following instruction.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Prefixes: u8 {
        const TAIL       = 1 << 0;
        const VOLATILE   = 1 << 1;
        const UNALIGNED  = 1 << 2;
        const READONLY   = 1 << 3;
        const NO_CHECK   = 1 << 4;
        const CONSTRAINED = 1 << 5;
    }
}

impl<'a> MethodCompiler<'a> {
    /// Compile the IL range `[start, end)` into the current context.
    pub(super) fn walk(&mut self, start: usize, end: usize) -> Result<(), CompileError> {
        let il = self.desc.il;
        let mut cur = IlCursor::new(il);
        cur.seek(start);

        while cur.offset() < end {
            let il_offset = cur.offset() as u32;

            if let Some(skip_to) = self.handler_skip(il_offset) {
                self.record_label(il_offset)?;
                cur.seek(skip_to as usize);
                continue;
            }

            self.record_label(il_offset)?;
            self.restore_at_branch_target(il_offset);

            let opcode = cur.read_u8()?;

            // A catch funclet's first `pop` discards the exception object
            // that only ever existed in RCX.
            if self.pending_exception_pop {
                if opcode == op::POP {
                    self.pending_exception_pop = false;
                    continue;
                }
                self.stack.push_reg(&mut self.buf, regs::R1, StackKind::ObjectRef);
                self.pending_exception_pop = false;
            }

            let was_prefix = self.dispatch(opcode, &mut cur, il_offset)?;
            if !was_prefix {
                self.prefixes = Prefixes::empty();
                self.constrained_token = None;
            }
        }
        Ok(())
    }

    /// When the walk reaches the start of a handler (or filter) region it
    /// does not own, skip to the end of that handler.
    fn handler_skip(&self, il_offset: u32) -> Option<u32> {
        let active = match self.context {
            EmitContext::MainBody => usize::MAX,
            EmitContext::Handler(i) | EmitContext::FilterExpression(i) => i,
        };
        for (i, clause) in self.clauses.iter().enumerate() {
            if i == active {
                continue;
            }
            let region_start = if clause.kind == crate::il::ClauseKind::Filter {
                clause.filter_start()
            } else {
                clause.handler_start
            };
            if il_offset == region_start {
                return Some(clause.handler_end);
            }
        }
        None
    }

    fn restore_at_branch_target(&mut self, il_offset: u32) {
        if let Some(snapshot) = self.branch_stacks.get(&il_offset) {
            if snapshot.len() != self.stack.depth()
                || snapshot.iter().map(|e| e.byte_size).sum::<u32>() != self.stack.total_bytes()
            {
                let snapshot = snapshot.clone();
                self.stack.restore(&snapshot);
            }
        }
    }

    /// Emit one opcode. Returns true when the opcode was a prefix whose
    /// sticky state must survive into the next instruction.
    fn dispatch(
        &mut self,
        opcode: u8,
        cur: &mut IlCursor<'_>,
        il_offset: u32,
    ) -> Result<bool, CompileError> {
        match opcode {
            op::NOP => {}
            op::BREAK => self.asm().int3(),

            // ---- constants ----
            op::LDC_I4_M1..=op::LDC_I4_8 => {
                let value = opcode as i32 - op::LDC_I4_0 as i32;
                self.emit_ldc_i4(value);
            }
            op::LDC_I4_S => {
                let value = cur.read_i8()? as i32;
                self.emit_ldc_i4(value);
            }
            op::LDC_I4 => {
                let value = cur.read_i32()?;
                self.emit_ldc_i4(value);
            }
            op::LDC_I8 => {
                let value = cur.read_u64()?;
                self.asm().mov_ri64(regs::R0, value);
                self.stack.push_reg_r0(&mut self.buf, StackKind::Int64);
            }
            op::LDC_R4 => {
                let bits = cur.read_f32_bits()?;
                self.asm().mov_ri32(regs::R0, bits as i32);
                self.stack.push_reg_r0(&mut self.buf, StackKind::Float32);
            }
            op::LDC_R8 => {
                let bits = cur.read_f64_bits()?;
                self.asm().mov_ri64(regs::R0, bits);
                self.stack.push_reg_r0(&mut self.buf, StackKind::Float64);
            }
            op::LDNULL => {
                self.asm().xor_rr32(regs::R0, regs::R0);
                self.stack.push_reg_r0(&mut self.buf, StackKind::ObjectRef);
            }
            op::LDSTR => {
                let token = cur.read_u32()?;
                let address = self
                    .resolvers
                    .string
                    .resolve_string(token)
                    .ok_or(CompileError::StringResolution { token })?;
                self.asm().mov_ri64(regs::R0, address as u64);
                self.stack.push_reg_r0(&mut self.buf, StackKind::ObjectRef);
            }

            // ---- arguments and locals ----
            op::LDARG_0..=op::LDARG_3 => self.emit_ldarg((opcode - op::LDARG_0) as u16)?,
            op::LDARG_S => {
                let index = cur.read_u8()? as u16;
                self.emit_ldarg(index)?;
            }
            op::LDARGA_S => {
                let index = cur.read_u8()? as u16;
                self.emit_ldarga(index)?;
            }
            op::STARG_S => {
                let index = cur.read_u8()? as u16;
                self.emit_starg(index, il_offset)?;
            }
            op::LDLOC_0..=op::LDLOC_3 => self.emit_ldloc((opcode - op::LDLOC_0) as u16)?,
            op::STLOC_0..=op::STLOC_3 => {
                self.emit_stloc((opcode - op::STLOC_0) as u16, il_offset)?
            }
            op::LDLOC_S => {
                let index = cur.read_u8()? as u16;
                self.emit_ldloc(index)?;
            }
            op::LDLOCA_S => {
                let index = cur.read_u8()? as u16;
                self.emit_ldloca(index)?;
            }
            op::STLOC_S => {
                let index = cur.read_u8()? as u16;
                self.emit_stloc(index, il_offset)?;
            }

            // ---- stack shuffling ----
            op::DUP => self.emit_dup(il_offset)?,
            op::POP => {
                self.stack
                    .pop_discard(&mut self.buf)
                    .ok_or_else(|| self.stack_underflow(il_offset))?;
            }

            // ---- branches ----
            op::BR_S => {
                let target = cur.read_target_s()?;
                self.emit_branch(target, None)?;
            }
            op::BR => {
                let target = cur.read_target()?;
                self.emit_branch(target, None)?;
            }
            op::BRFALSE_S | op::BRTRUE_S => {
                let target = cur.read_target_s()?;
                self.emit_branch_truthiness(target, opcode == op::BRTRUE_S, il_offset)?;
            }
            op::BRFALSE | op::BRTRUE => {
                let target = cur.read_target()?;
                self.emit_branch_truthiness(target, opcode == op::BRTRUE, il_offset)?;
            }
            op::BEQ_S..=op::BLT_UN_S => {
                let target = cur.read_target_s()?;
                let (cond, unsigned) = compare_branch_condition(opcode - op::BEQ_S);
                self.emit_branch_compare(target, cond, unsigned, il_offset)?;
            }
            op::BEQ..=op::BLT_UN => {
                let target = cur.read_target()?;
                let (cond, unsigned) = compare_branch_condition(opcode - op::BEQ);
                self.emit_branch_compare(target, cond, unsigned, il_offset)?;
            }
            op::SWITCH => {
                let count = cur.read_u32()? as usize;
                let mut deltas = Vec::with_capacity(count);
                for _ in 0..count {
                    deltas.push(cur.read_i32()?);
                }
                let base = cur.offset() as i64;
                self.pop_reg(regs::R0, il_offset)?;
                for (i, delta) in deltas.into_iter().enumerate() {
                    let target = (base + delta as i64) as u32;
                    self.asm().cmp_ri32(regs::R0, i as i32);
                    self.emit_branch(target, Some(Cond::E))?;
                }
            }

            op::RET => self.emit_ret(il_offset)?,

            // ---- arithmetic, logic, conversions, comparisons ----
            op::ADD..=op::NOT => self.emit_binary_or_unary(opcode, il_offset)?,
            op::ADD_OVF..=op::SUB_OVF_UN => self.emit_overflow_arith(opcode, il_offset)?,
            op::CONV_I1
            | op::CONV_I2
            | op::CONV_I4
            | op::CONV_I8
            | op::CONV_R4
            | op::CONV_R8
            | op::CONV_U4
            | op::CONV_U8
            | op::CONV_R_UN
            | op::CONV_U2
            | op::CONV_U1
            | op::CONV_I
            | op::CONV_U => self.emit_conversion(opcode, il_offset)?,
            op::CONV_OVF_I1_UN..=op::CONV_OVF_U_UN
            | op::CONV_OVF_I1..=op::CONV_OVF_U8
            | op::CONV_OVF_I
            | op::CONV_OVF_U => self.emit_checked_conversion(opcode, il_offset)?,
            op::CKFINITE => self.emit_ckfinite(il_offset)?,

            // ---- indirect loads and stores ----
            op::LDIND_I1..=op::LDIND_REF => self.emit_ldind(opcode, il_offset)?,
            op::STIND_REF..=op::STIND_R8 | op::STIND_I => self.emit_stind(opcode, il_offset)?,

            // ---- object model ----
            op::LDOBJ | op::STOBJ | op::CPOBJ => self.emit_obj_copy(opcode, cur, il_offset)?,
            op::LDFLD | op::LDFLDA | op::STFLD => self.emit_field(opcode, cur, il_offset)?,
            op::LDSFLD | op::LDSFLDA | op::STSFLD => self.emit_static_field(opcode, cur, il_offset)?,
            op::LDLEN => self.emit_ldlen(il_offset)?,
            op::LDELEMA => {
                let token = cur.read_u32()?;
                self.emit_ldelema(token, il_offset)?;
            }
            op::LDELEM_I1..=op::LDELEM_REF => self.emit_ldelem_fixed(opcode, il_offset)?,
            op::STELEM_I..=op::STELEM_REF => self.emit_stelem_fixed(opcode, il_offset)?,
            op::LDELEM => {
                let token = cur.read_u32()?;
                self.emit_ldelem_token(token, il_offset)?;
            }
            op::STELEM => {
                let token = cur.read_u32()?;
                self.emit_stelem_token(token, il_offset)?;
            }

            op::NEWOBJ => {
                let token = cur.read_u32()?;
                self.emit_newobj(token, il_offset)?;
            }
            op::NEWARR => {
                let token = cur.read_u32()?;
                self.emit_newarr(token, il_offset)?;
            }
            op::BOX => {
                let token = cur.read_u32()?;
                self.emit_box(token, il_offset)?;
            }
            op::UNBOX => {
                let token = cur.read_u32()?;
                self.emit_unbox(token, il_offset)?;
            }
            op::UNBOX_ANY => {
                let token = cur.read_u32()?;
                self.emit_unbox_any(token, il_offset)?;
            }
            op::CASTCLASS | op::ISINST => {
                let token = cur.read_u32()?;
                self.emit_type_test(token, opcode == op::ISINST, il_offset)?;
            }
            op::LDTOKEN => {
                let token = cur.read_u32()?;
                self.emit_ldtoken(token)?;
            }
            op::MKREFANY => {
                let token = cur.read_u32()?;
                self.emit_mkrefany(token, il_offset)?;
            }
            op::REFANYVAL => {
                let _token = cur.read_u32()?;
                self.emit_refanyval(il_offset)?;
            }

            // ---- calls ----
            op::CALL | op::CALLVIRT => {
                let token = cur.read_u32()?;
                self.emit_call(token, opcode == op::CALLVIRT, il_offset)?;
            }
            op::CALLI => {
                let token = cur.read_u32()?;
                self.emit_calli(token, il_offset)?;
            }
            op::JMP => {
                let token = cur.read_u32()?;
                self.emit_jmp_method(token)?;
            }

            // ---- exception handling ----
            op::THROW => self.emit_throw(il_offset)?,
            op::LEAVE => {
                let target = cur.read_target()?;
                self.emit_leave(il_offset, target)?;
            }
            op::LEAVE_S => {
                let target = cur.read_target_s()?;
                self.emit_leave(il_offset, target)?;
            }
            op::ENDFINALLY => self.emit_endfinally(),

            op::WIDE => {
                let wide = cur.read_u8()?;
                return self.dispatch_wide(wide, cur, il_offset);
            }

            other => {
                return Err(CompileError::UnsupportedOpcode { byte: other, offset: il_offset as usize })
            }
        }
        Ok(false)
    }

    fn dispatch_wide(
        &mut self,
        opcode: u8,
        cur: &mut IlCursor<'_>,
        il_offset: u32,
    ) -> Result<bool, CompileError> {
        use op::wide;
        match opcode {
            wide::ARGLIST => {
                let offset = self.frame.arglist_offset();
                self.asm().lea(regs::R0, regs::FP, offset);
                self.stack.push_reg_r0(&mut self.buf, StackKind::NativeInt);
            }
            wide::CEQ => self.emit_compare(Cond::E, false, il_offset)?,
            wide::CGT => self.emit_compare(Cond::G, false, il_offset)?,
            wide::CGT_UN => self.emit_compare(Cond::A, true, il_offset)?,
            wide::CLT => self.emit_compare(Cond::L, false, il_offset)?,
            wide::CLT_UN => self.emit_compare(Cond::B, true, il_offset)?,
            wide::LDFTN => {
                let token = cur.read_u32()?;
                self.emit_ldftn(token)?;
            }
            wide::LDVIRTFTN => {
                let token = cur.read_u32()?;
                self.emit_ldvirtftn(token, il_offset)?;
            }
            wide::LDARG => {
                let index = cur.read_u16()?;
                self.emit_ldarg(index)?;
            }
            wide::LDARGA => {
                let index = cur.read_u16()?;
                self.emit_ldarga(index)?;
            }
            wide::STARG => {
                let index = cur.read_u16()?;
                self.emit_starg(index, il_offset)?;
            }
            wide::LDLOC => {
                let index = cur.read_u16()?;
                self.emit_ldloc(index)?;
            }
            wide::LDLOCA => {
                let index = cur.read_u16()?;
                self.emit_ldloca(index)?;
            }
            wide::STLOC => {
                let index = cur.read_u16()?;
                self.emit_stloc(index, il_offset)?;
            }
            wide::LOCALLOC => self.emit_localloc(il_offset)?,
            wide::ENDFILTER => self.emit_endfilter(il_offset)?,
            wide::UNALIGNED => {
                let _alignment = cur.read_u8()?;
                self.prefixes |= Prefixes::UNALIGNED;
                return Ok(true);
            }
            wide::VOLATILE => {
                self.prefixes |= Prefixes::VOLATILE;
                return Ok(true);
            }
            wide::TAIL => {
                self.prefixes |= Prefixes::TAIL;
                return Ok(true);
            }
            wide::INITOBJ => {
                let token = cur.read_u32()?;
                self.emit_initobj(token, il_offset)?;
            }
            wide::CONSTRAINED => {
                let token = cur.read_u32()?;
                self.prefixes |= Prefixes::CONSTRAINED;
                self.constrained_token = Some(token);
                return Ok(true);
            }
            wide::CPBLK => self.emit_cpblk(il_offset)?,
            wide::INITBLK => self.emit_initblk(il_offset)?,
            wide::NO => {
                let _checks = cur.read_u8()?;
                self.prefixes |= Prefixes::NO_CHECK;
                return Ok(true);
            }
            wide::RETHROW => self.emit_rethrow(),
            wide::SIZEOF => {
                let token = cur.read_u32()?;
                self.emit_sizeof(token)?;
            }
            wide::REFANYTYPE => self.emit_refanytype(il_offset)?,
            wide::READONLY => {
                self.prefixes |= Prefixes::READONLY;
                return Ok(true);
            }
            other => {
                return Err(CompileError::UnsupportedWideOpcode {
                    byte: other,
                    offset: il_offset as usize,
                })
            }
        }
        Ok(false)
    }

    // ---- constants, args, locals ----

    fn emit_ldc_i4(&mut self, value: i32) {
        let mut asm = self.asm();
        if value == 0 {
            asm.xor_rr32(regs::R0, regs::R0);
        } else {
            asm.mov_ri32(regs::R0, value);
        }
        self.stack.push_reg_r0(&mut self.buf, StackKind::Int32);
    }

    fn check_arg(&self, index: u16) -> Result<(), CompileError> {
        if index >= self.desc.arg_count {
            return Err(CompileError::ArgOutOfRange {
                index: index as usize,
                count: self.desc.arg_count as usize,
            });
        }
        Ok(())
    }

    fn check_local(&self, index: u16) -> Result<(), CompileError> {
        if index >= self.desc.local_count {
            return Err(CompileError::LocalOutOfRange {
                index: index as usize,
                count: self.desc.local_count as usize,
            });
        }
        Ok(())
    }

    fn emit_ldarg(&mut self, index: u16) -> Result<(), CompileError> {
        self.check_arg(index)?;
        let offset = self.frame.arg_home_offset(index);
        let kind = self.arg_kind(index);
        if kind == StackKind::ValueType {
            let size = self.desc.arg_type_size[index as usize] as u32;
            if size > 8 {
                // Large structs arrive by reference.
                self.asm().load64(regs::R1, regs::FP, offset);
                self.stack.push_value_from(&mut self.buf, regs::R1, 0, size);
            } else {
                self.asm().load64(regs::R0, regs::FP, offset);
                self.asm().push_reg(regs::R0);
                self.stack.push(EvalStackEntry::value_type(size));
            }
        } else {
            self.asm().load64(regs::R0, regs::FP, offset);
            self.stack.push_reg_r0(&mut self.buf, kind);
        }
        Ok(())
    }

    fn emit_ldarga(&mut self, index: u16) -> Result<(), CompileError> {
        self.check_arg(index)?;
        let offset = self.frame.arg_home_offset(index);
        self.asm().lea(regs::R0, regs::FP, offset);
        self.stack.push_reg_r0(&mut self.buf, StackKind::ManagedPtr);
        Ok(())
    }

    fn emit_starg(&mut self, index: u16, il_offset: u32) -> Result<(), CompileError> {
        self.check_arg(index)?;
        let offset = self.frame.arg_home_offset(index);
        let top = *self.stack.peek(0).ok_or_else(|| self.stack_underflow(il_offset))?;
        if top.byte_size > 8 {
            self.asm().load64(regs::R1, regs::FP, offset);
            self.stack
                .pop_value_to(&mut self.buf, regs::R1, 0)
                .ok_or_else(|| self.stack_underflow(il_offset))?;
        } else {
            self.pop_reg(regs::R0, il_offset)?;
            self.asm().store64(regs::FP, offset, regs::R0);
        }
        Ok(())
    }

    fn emit_ldloc(&mut self, index: u16) -> Result<(), CompileError> {
        self.check_local(index)?;
        let offset = self.frame.local_offset(index);
        let kind = self.local_kinds[index as usize];
        if kind == StackKind::ValueType {
            let size = self.desc.local_type_size[index as usize] as u32;
            if size > 8 {
                self.stack.push_value_from(&mut self.buf, regs::FP, offset, size);
            } else {
                self.asm().load64(regs::R0, regs::FP, offset);
                self.asm().push_reg(regs::R0);
                self.stack.push(EvalStackEntry::value_type(size));
            }
        } else {
            self.asm().load64(regs::R0, regs::FP, offset);
            self.stack.push_reg_r0(&mut self.buf, kind);
        }
        Ok(())
    }

    fn emit_ldloca(&mut self, index: u16) -> Result<(), CompileError> {
        self.check_local(index)?;
        let offset = self.frame.local_offset(index);
        self.asm().lea(regs::R0, regs::FP, offset);
        self.stack.push_reg_r0(&mut self.buf, StackKind::ManagedPtr);
        Ok(())
    }

    fn emit_stloc(&mut self, index: u16, il_offset: u32) -> Result<(), CompileError> {
        self.check_local(index)?;
        let offset = self.frame.local_offset(index);
        let top = *self.stack.peek(0).ok_or_else(|| self.stack_underflow(il_offset))?;
        if top.byte_size > 8 {
            self.stack
                .pop_value_to(&mut self.buf, regs::FP, offset)
                .ok_or_else(|| self.stack_underflow(il_offset))?;
            self.local_kinds[index as usize] = StackKind::ValueType;
        } else {
            let entry = self.pop_reg(regs::R0, il_offset)?;
            self.asm().store64(regs::FP, offset, regs::R0);
            self.local_kinds[index as usize] = entry.kind;
        }
        Ok(())
    }

    fn emit_dup(&mut self, il_offset: u32) -> Result<(), CompileError> {
        let top = *self.stack.peek(0).ok_or_else(|| self.stack_underflow(il_offset))?;
        if top.byte_size > 8 {
            // The source moves up by the copy's footprint once it is pushed.
            let foot = crate::stack::value_type_footprint(top.raw_size) as i32;
            self.stack
                .push_value_from(&mut self.buf, regs::SP, foot, top.raw_size);
        } else {
            self.asm().load64(regs::R0, regs::SP, 0);
            self.asm().push_reg(regs::R0);
            self.stack.push(top);
        }
        Ok(())
    }

    // ---- truthiness and comparison branches ----

    fn emit_branch_truthiness(
        &mut self,
        target: u32,
        branch_if_true: bool,
        il_offset: u32,
    ) -> Result<(), CompileError> {
        let entry = self.pop_reg(regs::R0, il_offset)?;
        if entry.kind.is_int32_like() {
            self.asm().test_rr32(regs::R0, regs::R0);
        } else {
            self.asm().test_rr(regs::R0, regs::R0);
        }
        let cond = if branch_if_true { Cond::Ne } else { Cond::E };
        self.emit_branch(target, Some(cond))
    }

    fn emit_branch_compare(
        &mut self,
        target: u32,
        cond: Cond,
        unsigned: bool,
        il_offset: u32,
    ) -> Result<(), CompileError> {
        let cond = self.emit_compare_operands(cond, unsigned, il_offset)?;
        self.emit_branch(target, Some(cond))
    }

    // ---- localloc ----

    fn emit_localloc(&mut self, il_offset: u32) -> Result<(), CompileError> {
        self.pop_reg(regs::R1, il_offset)?;
        let mut asm = self.asm();
        asm.add_ri(regs::R1, 15);
        asm.and_ri(regs::R1, -16);
        asm.sub_rr(regs::SP, regs::R1);
        asm.mov_rr(regs::R0, regs::SP);
        self.stack.push_reg_r0(&mut self.buf, StackKind::UnmanagedPtr);
        Ok(())
    }
}

/// Map a `beq..blt.un` opcode offset to its condition and signedness.
fn compare_branch_condition(index: u8) -> (Cond, bool) {
    match index {
        0 => (Cond::E, false),  // beq
        1 => (Cond::Ge, false), // bge
        2 => (Cond::G, false),  // bgt
        3 => (Cond::Le, false), // ble
        4 => (Cond::L, false),  // blt
        5 => (Cond::Ne, true),  // bne.un
        6 => (Cond::Ae, true),  // bge.un
        7 => (Cond::A, true),   // bgt.un
        8 => (Cond::Be, true),  // ble.un
        _ => (Cond::B, true),   // blt.un
    }
}
