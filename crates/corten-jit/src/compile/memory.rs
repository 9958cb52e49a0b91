//! Field, static, array, and indirect memory access.
//!
//! Array accesses assume SZ-array layout: MethodTable pointer, int64
//! length, then elements at offset 16. The bounds check is mandatory and
//! traps with `int 5`, which the host surfaces as the range exception.

use crate::emit::regs::{self, Reg, Xmm};
use crate::emit::Cond;
use crate::error::CompileError;
use crate::frame::TEMP_AREA;
use crate::il::opcodes as op;
use crate::il::IlCursor;
use crate::resolve::{ResolvedField, ResolvedType};
use crate::runtime::cctor::CctorRegistry;
use crate::runtime::object::{ARRAY_DATA_OFFSET, ARRAY_LENGTH_OFFSET, BOXED_VALUE_OFFSET};
use crate::stack::{copy_block, zero_block, EvalStackEntry, StackKind};

use super::MethodCompiler;

impl<'a> MethodCompiler<'a> {
    fn resolve_field_token(&self, token: u32) -> Result<ResolvedField, CompileError> {
        self.resolvers
            .field
            .resolve_field(token)
            .ok_or(CompileError::FieldResolution { token })
    }

    pub(super) fn resolve_type_token(&self, token: u32) -> Result<ResolvedType, CompileError> {
        self.resolvers
            .ty
            .resolve_type(token)
            .ok_or(CompileError::TypeResolution { token })
    }

    /// Natural-width load of `[base + disp]` into R0, returning the kind.
    fn load_scalar(&mut self, base: Reg, disp: i32, size: u8, signed: bool, gc_ref: bool) -> StackKind {
        let mut asm = self.asm();
        match (size, signed) {
            (1, true) => asm.load8_sx(regs::R0, base, disp),
            (1, false) => asm.load8_zx(regs::R0, base, disp),
            (2, true) => asm.load16_sx(regs::R0, base, disp),
            (2, false) => asm.load16_zx(regs::R0, base, disp),
            (4, _) => asm.load32_zx(regs::R0, base, disp),
            _ => asm.load64(regs::R0, base, disp),
        }
        if gc_ref {
            StackKind::ObjectRef
        } else if size <= 4 {
            StackKind::Int32
        } else {
            StackKind::Int64
        }
    }

    /// Store R0 to `[base + disp]`, `size` bytes, shifting out stored
    /// chunks so odd sizes stay within the field.
    fn store_reg_value(&mut self, base: Reg, disp: i32, size: u32) {
        let mut asm = self.asm();
        match size {
            1 => asm.store8(base, disp, regs::R0),
            2 => asm.store16(base, disp, regs::R0),
            4 => asm.store32(base, disp, regs::R0),
            8 => asm.store64(base, disp, regs::R0),
            _ => {
                let mut off = 0i32;
                let mut left = size;
                while left >= 4 {
                    asm.store32(base, disp + off, regs::R0);
                    asm.shr_imm(regs::R0, 32);
                    off += 4;
                    left -= 4;
                }
                if left >= 2 {
                    asm.store16(base, disp + off, regs::R0);
                    asm.shr_imm(regs::R0, 16);
                    off += 2;
                    left -= 2;
                }
                if left >= 1 {
                    asm.store8(base, disp + off, regs::R0);
                }
            }
        }
    }

    // ---- indirect loads and stores ----

    pub(super) fn emit_ldind(&mut self, opcode: u8, il_offset: u32) -> Result<(), CompileError> {
        self.pop_reg(regs::R1, il_offset)?;
        let mut asm = self.asm();
        let kind = match opcode {
            op::LDIND_I1 => {
                asm.load8_sx(regs::R0, regs::R1, 0);
                StackKind::Int32
            }
            op::LDIND_U1 => {
                asm.load8_zx(regs::R0, regs::R1, 0);
                StackKind::Int32
            }
            op::LDIND_I2 => {
                asm.load16_sx(regs::R0, regs::R1, 0);
                StackKind::Int32
            }
            op::LDIND_U2 => {
                asm.load16_zx(regs::R0, regs::R1, 0);
                StackKind::Int32
            }
            op::LDIND_I4 | op::LDIND_U4 => {
                asm.load32_zx(regs::R0, regs::R1, 0);
                StackKind::Int32
            }
            op::LDIND_I8 => {
                asm.load64(regs::R0, regs::R1, 0);
                StackKind::Int64
            }
            op::LDIND_I => {
                asm.load64(regs::R0, regs::R1, 0);
                StackKind::NativeInt
            }
            op::LDIND_R4 => {
                asm.movss_load(Xmm::Xmm0, regs::R1, 0);
                asm.movd_rx(regs::R0, Xmm::Xmm0);
                StackKind::Float32
            }
            op::LDIND_R8 => {
                asm.movsd_load(Xmm::Xmm0, regs::R1, 0);
                asm.movq_rx(regs::R0, Xmm::Xmm0);
                StackKind::Float64
            }
            _ => {
                asm.load64(regs::R0, regs::R1, 0);
                StackKind::ObjectRef
            }
        };
        self.stack.push_reg_r0(&mut self.buf, kind);
        Ok(())
    }

    pub(super) fn emit_stind(&mut self, opcode: u8, il_offset: u32) -> Result<(), CompileError> {
        self.pop_reg(regs::R0, il_offset)?;
        self.pop_reg(regs::R1, il_offset)?;
        let mut asm = self.asm();
        match opcode {
            op::STIND_I1 => asm.store8(regs::R1, 0, regs::R0),
            op::STIND_I2 => asm.store16(regs::R1, 0, regs::R0),
            op::STIND_I4 | op::STIND_R4 => asm.store32(regs::R1, 0, regs::R0),
            _ => asm.store64(regs::R1, 0, regs::R0),
        }
        Ok(())
    }

    // ---- instance fields ----

    pub(super) fn emit_field(
        &mut self,
        opcode: u8,
        cur: &mut IlCursor<'_>,
        il_offset: u32,
    ) -> Result<(), CompileError> {
        let token = cur.read_u32()?;
        let field = self.resolve_field_token(token)?;
        // A reference-typed container hides its MethodTable word before
        // the first field; a managed pointer to a struct does not.
        let disp = if field.declaring_is_value_type {
            field.offset as i32
        } else {
            BOXED_VALUE_OFFSET + field.offset as i32
        };

        match opcode {
            op::LDFLDA => {
                self.pop_reg(regs::R0, il_offset)?;
                self.asm().add_ri(regs::R0, disp);
                self.stack.push_reg_r0(&mut self.buf, StackKind::ManagedPtr);
            }
            op::LDFLD => self.emit_ldfld(&field, disp, il_offset)?,
            _ => self.emit_stfld(&field, disp, il_offset)?,
        }
        Ok(())
    }

    fn emit_ldfld(&mut self, field: &ResolvedField, disp: i32, il_offset: u32) -> Result<(), CompileError> {
        let container = *self.stack.peek(0).ok_or_else(|| self.stack_underflow(il_offset))?;

        if container.kind == StackKind::ValueType {
            if container.byte_size > 8 {
                // Multi-slot struct on the stack: read in place, then free
                // the slot before pushing the result.
                if field.field_is_value_type && field.field_value_size > 8 {
                    let size = field.field_value_size;
                    if size > TEMP_AREA as u32 {
                        return Err(CompileError::TempOverflow(size));
                    }
                    let temp = self.frame.temp_offset();
                    let mut asm = self.asm();
                    copy_block(&mut asm, regs::FP, temp, regs::SP, field.offset as i32, size);
                    drop(asm);
                    self.stack
                        .pop_discard(&mut self.buf)
                        .ok_or_else(|| self.stack_underflow(il_offset))?;
                    self.stack.push_value_from(&mut self.buf, regs::FP, temp, size);
                } else {
                    let kind = self.load_scalar(
                        regs::SP,
                        field.offset as i32,
                        field.size,
                        field.signed,
                        field.is_gc_ref,
                    );
                    let byte_size = container.byte_size;
                    self.stack.pop();
                    self.asm().add_ri(regs::SP, byte_size as i32);
                    self.stack.push_reg_r0(&mut self.buf, kind);
                }
                return Ok(());
            }

            // Small struct held by value: shift and mask in a register.
            self.pop_reg(regs::R0, il_offset)?;
            let mut asm = self.asm();
            if field.offset > 0 {
                asm.shr_imm(regs::R0, (field.offset * 8) as u8);
            }
            match (field.size, field.signed) {
                (1, true) => asm.movsx8(regs::R0, regs::R0),
                (1, false) => asm.movzx8(regs::R0, regs::R0),
                (2, true) => asm.movsx16(regs::R0, regs::R0),
                (2, false) => asm.movzx16(regs::R0, regs::R0),
                (4, _) => asm.mov_rr32(regs::R0, regs::R0),
                _ => {}
            }
            let kind = if field.is_gc_ref {
                StackKind::ObjectRef
            } else if field.size <= 4 {
                StackKind::Int32
            } else {
                StackKind::Int64
            };
            self.stack.push_reg_r0(&mut self.buf, kind);
            return Ok(());
        }

        // Container is a pointer: dereference at the field displacement.
        self.pop_reg(regs::R1, il_offset)?;
        if field.field_is_value_type && field.field_value_size > 8 {
            self.asm().add_ri(regs::R1, disp);
            self.stack
                .push_value_from(&mut self.buf, regs::R1, 0, field.field_value_size);
        } else {
            let kind = self.load_scalar(regs::R1, disp, field.size, field.signed, field.is_gc_ref);
            self.stack.push_reg_r0(&mut self.buf, kind);
        }
        Ok(())
    }

    fn emit_stfld(&mut self, field: &ResolvedField, disp: i32, il_offset: u32) -> Result<(), CompileError> {
        let value = *self.stack.peek(0).ok_or_else(|| self.stack_underflow(il_offset))?;
        if value.byte_size > 8 {
            // Struct value on top, container pointer beneath it.
            let container_off = self.stack.peek_rsp_offset(1);
            self.asm().load64(regs::R1, regs::SP, container_off);
            self.stack
                .pop_value_to(&mut self.buf, regs::R1, disp)
                .ok_or_else(|| self.stack_underflow(il_offset))?;
            self.stack
                .pop_discard(&mut self.buf)
                .ok_or_else(|| self.stack_underflow(il_offset))?;
        } else {
            self.pop_reg(regs::R0, il_offset)?;
            self.pop_reg(regs::R1, il_offset)?;
            let size = if field.field_is_value_type && field.field_value_size != 0 {
                field.field_value_size
            } else {
                field.size as u32
            };
            self.store_reg_value(regs::R1, disp, size);
        }
        Ok(())
    }

    // ---- static fields ----

    /// Trigger the declaring type's cctor if its context is registered and
    /// still pending: load the context word, and when non-zero, null it
    /// and call through it.
    fn emit_cctor_trigger(&mut self, field: &ResolvedField) {
        let Some(context) = CctorRegistry::global().context_address(field.assembly_id, field.declaring_token)
        else {
            return;
        };
        let skip;
        {
            let mut asm = self.asm();
            asm.mov_ri64(regs::R0, context as u64);
            asm.load64(regs::R1, regs::R0, 0);
            asm.test_rr(regs::R1, regs::R1);
            skip = asm.jcc_placeholder(Cond::E);
            asm.xor_rr32(regs::R2, regs::R2);
            asm.store64(regs::R0, 0, regs::R2);
        }
        let pad = self.call_pad(0);
        let mut asm = self.asm();
        asm.sub_ri(regs::SP, 32 + pad);
        asm.call_reg(regs::R1);
        let after_call = asm.position();
        asm.add_ri(regs::SP, 32 + pad);
        drop(asm);
        self.gc.add_safe_point(after_call);
        self.buf.patch_rel32(skip);
    }

    pub(super) fn emit_static_field(
        &mut self,
        opcode: u8,
        cur: &mut IlCursor<'_>,
        il_offset: u32,
    ) -> Result<(), CompileError> {
        let token = cur.read_u32()?;
        let field = self.resolve_field_token(token)?;
        self.emit_cctor_trigger(&field);

        match opcode {
            op::LDSFLDA => {
                self.asm().mov_ri64(regs::R0, field.static_address as u64);
                self.stack.push_reg_r0(&mut self.buf, StackKind::ManagedPtr);
            }
            op::LDSFLD => {
                if field.field_is_value_type && field.field_value_size > 8 {
                    self.asm().mov_ri64(regs::R1, field.static_address as u64);
                    self.stack
                        .push_value_from(&mut self.buf, regs::R1, 0, field.field_value_size);
                } else {
                    self.asm().mov_ri64(regs::R1, field.static_address as u64);
                    let kind = self.load_scalar(regs::R1, 0, field.size, field.signed, field.is_gc_ref);
                    self.stack.push_reg_r0(&mut self.buf, kind);
                }
            }
            _ => {
                let value = *self.stack.peek(0).ok_or_else(|| self.stack_underflow(il_offset))?;
                if value.byte_size > 8 {
                    self.asm().mov_ri64(regs::R1, field.static_address as u64);
                    self.stack
                        .pop_value_to(&mut self.buf, regs::R1, 0)
                        .ok_or_else(|| self.stack_underflow(il_offset))?;
                } else {
                    self.pop_reg(regs::R0, il_offset)?;
                    self.asm().mov_ri64(regs::R1, field.static_address as u64);
                    self.store_reg_value(regs::R1, 0, field.size as u32);
                }
            }
        }
        Ok(())
    }

    // ---- arrays ----

    pub(super) fn emit_ldlen(&mut self, il_offset: u32) -> Result<(), CompileError> {
        self.pop_reg(regs::R0, il_offset)?;
        self.asm().load64(regs::R0, regs::R0, ARRAY_LENGTH_OFFSET);
        self.stack.push_reg_r0(&mut self.buf, StackKind::NativeInt);
        Ok(())
    }

    /// Bounds-check R1 against the array in R0 and turn R1 into the
    /// element's byte offset. Traps with `int 5` when out of range.
    fn emit_index_to_offset(&mut self, index_kind: StackKind, elem_size: u32) {
        {
            let mut asm = self.asm();
            if index_kind.is_int32_like() {
                asm.mov_rr32(regs::R1, regs::R1);
            }
            asm.load64(regs::R2, regs::R0, ARRAY_LENGTH_OFFSET);
            asm.cmp_rr(regs::R1, regs::R2);
        }
        self.emit_trap_unless(Cond::B, 5);
        let mut asm = self.asm();
        if elem_size.is_power_of_two() {
            if elem_size > 1 {
                asm.shl_imm(regs::R1, elem_size.trailing_zeros() as u8);
            }
        } else {
            asm.imul_ri(regs::R1, regs::R1, elem_size as i32);
        }
    }

    /// Pop index and array, leaving array in R0 and the scaled, checked
    /// element offset in R1.
    fn pop_array_and_index(&mut self, elem_size: u32, il_offset: u32) -> Result<(), CompileError> {
        let index = self.pop_reg(regs::R1, il_offset)?;
        self.pop_reg(regs::R0, il_offset)?;
        self.emit_index_to_offset(index.kind, elem_size);
        Ok(())
    }

    pub(super) fn emit_ldelema(&mut self, token: u32, il_offset: u32) -> Result<(), CompileError> {
        let ty = self.resolve_type_token(token)?;
        let elem_size = if ty.is_value_type { ty.size.max(1) } else { 8 };
        self.pop_array_and_index(elem_size, il_offset)?;
        let mut asm = self.asm();
        asm.add_rr(regs::R0, regs::R1);
        asm.add_ri(regs::R0, ARRAY_DATA_OFFSET);
        self.stack.push_reg_r0(&mut self.buf, StackKind::ManagedPtr);
        Ok(())
    }

    pub(super) fn emit_ldelem_fixed(&mut self, opcode: u8, il_offset: u32) -> Result<(), CompileError> {
        let (elem_size, signed, kind) = match opcode {
            op::LDELEM_I1 => (1, true, StackKind::Int32),
            op::LDELEM_U1 => (1, false, StackKind::Int32),
            op::LDELEM_I2 => (2, true, StackKind::Int32),
            op::LDELEM_U2 => (2, false, StackKind::Int32),
            op::LDELEM_I4 | op::LDELEM_U4 => (4, false, StackKind::Int32),
            op::LDELEM_I8 => (8, false, StackKind::Int64),
            op::LDELEM_I => (8, false, StackKind::NativeInt),
            op::LDELEM_R4 => (4, false, StackKind::Float32),
            op::LDELEM_R8 => (8, false, StackKind::Float64),
            _ => (8, false, StackKind::ObjectRef),
        };
        self.pop_array_and_index(elem_size, il_offset)?;
        {
            let mut asm = self.asm();
            asm.add_rr(regs::R0, regs::R1);
        }
        match kind {
            StackKind::Float32 => {
                let mut asm = self.asm();
                asm.movss_load(Xmm::Xmm0, regs::R0, ARRAY_DATA_OFFSET);
                asm.movd_rx(regs::R0, Xmm::Xmm0);
            }
            StackKind::Float64 => {
                let mut asm = self.asm();
                asm.movsd_load(Xmm::Xmm0, regs::R0, ARRAY_DATA_OFFSET);
                asm.movq_rx(regs::R0, Xmm::Xmm0);
            }
            _ => {
                self.load_scalar(regs::R0, ARRAY_DATA_OFFSET, elem_size as u8, signed, false);
            }
        }
        self.stack.push_reg_r0(&mut self.buf, kind);
        Ok(())
    }

    pub(super) fn emit_stelem_fixed(&mut self, opcode: u8, il_offset: u32) -> Result<(), CompileError> {
        let elem_size: u32 = match opcode {
            op::STELEM_I1 => 1,
            op::STELEM_I2 => 2,
            op::STELEM_I4 | op::STELEM_R4 => 4,
            _ => 8,
        };
        let value = self.pop_reg(regs::R3, il_offset)?;
        let index = self.pop_reg(regs::R1, il_offset)?;
        self.pop_reg(regs::R0, il_offset)?;
        self.emit_index_to_offset(index.kind, elem_size);
        let mut asm = self.asm();
        asm.add_rr(regs::R0, regs::R1);
        match opcode {
            op::STELEM_I1 => asm.store8(regs::R0, ARRAY_DATA_OFFSET, regs::R3),
            op::STELEM_I2 => asm.store16(regs::R0, ARRAY_DATA_OFFSET, regs::R3),
            op::STELEM_R4 => {
                if value.kind == StackKind::Float64 {
                    asm.movq_xr(Xmm::Xmm0, regs::R3);
                    asm.cvtsd2ss(Xmm::Xmm0, Xmm::Xmm0);
                } else {
                    asm.movd_xr(Xmm::Xmm0, regs::R3);
                }
                asm.movss_store(regs::R0, ARRAY_DATA_OFFSET, Xmm::Xmm0);
            }
            op::STELEM_I4 => asm.store32(regs::R0, ARRAY_DATA_OFFSET, regs::R3),
            op::STELEM_R8 => {
                asm.movq_xr(Xmm::Xmm0, regs::R3);
                asm.movsd_store(regs::R0, ARRAY_DATA_OFFSET, Xmm::Xmm0);
            }
            _ => asm.store64(regs::R0, ARRAY_DATA_OFFSET, regs::R3),
        }
        Ok(())
    }

    pub(super) fn emit_ldelem_token(&mut self, token: u32, il_offset: u32) -> Result<(), CompileError> {
        let ty = self.resolve_type_token(token)?;
        if !ty.is_value_type {
            return self.emit_ldelem_fixed(op::LDELEM_REF, il_offset);
        }
        let size = ty.size.max(1);
        self.pop_array_and_index(size, il_offset)?;
        {
            let mut asm = self.asm();
            asm.add_rr(regs::R0, regs::R1);
            asm.add_ri(regs::R0, ARRAY_DATA_OFFSET);
        }
        if size > 8 {
            self.asm().mov_rr(regs::R1, regs::R0);
            self.stack.push_value_from(&mut self.buf, regs::R1, 0, size);
        } else {
            match size {
                1 | 2 | 4 | 8 => {
                    self.load_scalar(regs::R0, 0, size as u8, false, false);
                    self.asm().push_reg(regs::R0);
                    self.stack.push(EvalStackEntry::value_type(size));
                }
                _ => {
                    self.asm().mov_rr(regs::R1, regs::R0);
                    self.stack.push_value_from(&mut self.buf, regs::R1, 0, size);
                }
            }
        }
        Ok(())
    }

    pub(super) fn emit_stelem_token(&mut self, token: u32, il_offset: u32) -> Result<(), CompileError> {
        let ty = self.resolve_type_token(token)?;
        if !ty.is_value_type {
            return self.emit_stelem_fixed(op::STELEM_REF, il_offset);
        }
        let size = ty.size.max(1);
        let value = *self.stack.peek(0).ok_or_else(|| self.stack_underflow(il_offset))?;
        if value.byte_size > 8 {
            // Value on top; index and array live beneath it.
            let foot = value.byte_size as i32;
            let index_kind = self
                .stack
                .peek(1)
                .map(|e| e.kind)
                .unwrap_or(StackKind::Int32);
            {
                let mut asm = self.asm();
                asm.load64(regs::R0, regs::SP, foot + 8);
                asm.load64(regs::R1, regs::SP, foot);
            }
            self.emit_index_to_offset(index_kind, size);
            {
                let mut asm = self.asm();
                asm.add_rr(regs::R0, regs::R1);
                asm.add_ri(regs::R0, ARRAY_DATA_OFFSET);
                // The copy runs through R0; park the address in R3.
                asm.mov_rr(regs::R3, regs::R0);
            }
            self.stack
                .pop_value_to(&mut self.buf, regs::R3, 0)
                .ok_or_else(|| self.stack_underflow(il_offset))?;
            // Discard index and array.
            self.stack.pop();
            self.stack.pop();
            self.asm().add_ri(regs::SP, 16);
        } else {
            self.pop_reg(regs::R3, il_offset)?;
            let index = self.pop_reg(regs::R1, il_offset)?;
            self.pop_reg(regs::R0, il_offset)?;
            self.emit_index_to_offset(index.kind, size);
            // store_reg_value consumes R0, so move the address aside.
            {
                let mut asm = self.asm();
                asm.add_rr(regs::R0, regs::R1);
                asm.mov_rr(regs::R2, regs::R0);
                asm.mov_rr(regs::R0, regs::R3);
            }
            self.store_reg_value(regs::R2, ARRAY_DATA_OFFSET, size);
        }
        Ok(())
    }

    // ---- typed object copies ----

    pub(super) fn emit_obj_copy(
        &mut self,
        opcode: u8,
        cur: &mut IlCursor<'_>,
        il_offset: u32,
    ) -> Result<(), CompileError> {
        let token = cur.read_u32()?;
        let ty = self.resolve_type_token(token)?;
        let size = if ty.is_value_type { ty.size.max(1) } else { 8 };

        match opcode {
            op::LDOBJ => {
                self.pop_reg(regs::R1, il_offset)?;
                if !ty.is_value_type {
                    self.asm().load64(regs::R0, regs::R1, 0);
                    self.stack.push_reg_r0(&mut self.buf, StackKind::ObjectRef);
                } else if matches!(size, 1 | 2 | 4 | 8) {
                    self.load_scalar(regs::R1, 0, size as u8, false, false);
                    self.asm().push_reg(regs::R0);
                    self.stack.push(EvalStackEntry::value_type(size));
                } else {
                    self.stack.push_value_from(&mut self.buf, regs::R1, 0, size);
                }
            }
            op::STOBJ => {
                let value = *self.stack.peek(0).ok_or_else(|| self.stack_underflow(il_offset))?;
                if value.byte_size > 8 {
                    let dest_off = self.stack.peek_rsp_offset(1);
                    self.asm().load64(regs::R1, regs::SP, dest_off);
                    self.stack
                        .pop_value_to(&mut self.buf, regs::R1, 0)
                        .ok_or_else(|| self.stack_underflow(il_offset))?;
                    self.stack
                        .pop_discard(&mut self.buf)
                        .ok_or_else(|| self.stack_underflow(il_offset))?;
                } else {
                    self.pop_reg(regs::R0, il_offset)?;
                    self.pop_reg(regs::R1, il_offset)?;
                    self.store_reg_value(regs::R1, 0, size);
                }
            }
            _ => {
                // cpobj: [dest, src] with src on top.
                self.pop_reg(regs::R1, il_offset)?;
                self.pop_reg(regs::R2, il_offset)?;
                let mut asm = self.asm();
                copy_block(&mut asm, regs::R2, 0, regs::R1, 0, size);
            }
        }
        Ok(())
    }

    pub(super) fn emit_initobj(&mut self, token: u32, il_offset: u32) -> Result<(), CompileError> {
        let ty = self.resolve_type_token(token)?;
        let size = if ty.is_value_type { ty.size.max(1) } else { 8 };
        self.pop_reg(regs::R1, il_offset)?;
        let mut asm = self.asm();
        zero_block(&mut asm, regs::R1, 0, size);
        Ok(())
    }

    // ---- block operations ----

    pub(super) fn emit_cpblk(&mut self, il_offset: u32) -> Result<(), CompileError> {
        // [dest, src, size] with size on top. rep movsb wants RDI/RSI/RCX;
        // RSI and RDI are callee-saved, so preserve them around the copy.
        self.pop_reg(regs::R1, il_offset)?;
        self.pop_reg(regs::R2, il_offset)?;
        self.pop_reg(regs::R3, il_offset)?;
        let mut asm = self.asm();
        asm.push_reg(Reg::Rsi);
        asm.push_reg(Reg::Rdi);
        asm.mov_rr(Reg::Rsi, regs::R2);
        asm.mov_rr(Reg::Rdi, regs::R3);
        asm.rep_movsb();
        asm.pop_reg(Reg::Rdi);
        asm.pop_reg(Reg::Rsi);
        Ok(())
    }

    pub(super) fn emit_initblk(&mut self, il_offset: u32) -> Result<(), CompileError> {
        // [addr, value, size] with size on top.
        self.pop_reg(regs::R1, il_offset)?;
        self.pop_reg(regs::R0, il_offset)?;
        self.pop_reg(regs::R2, il_offset)?;
        let mut asm = self.asm();
        asm.push_reg(Reg::Rdi);
        asm.mov_rr(Reg::Rdi, regs::R2);
        asm.rep_stosb();
        asm.pop_reg(Reg::Rdi);
        Ok(())
    }
}
