//! Allocation, boxing, type tests, token loads, and intrinsics.
//!
//! Heap allocation always goes through the host's `RhpNewFast` /
//! `RhpNewArray` helpers; the compiler never touches the heap itself.
//! Failed casts surface as `int3`, which the host rewrites into the
//! invalid-cast exception.

use crate::emit::regs::{self, Xmm};
use crate::emit::Cond;
use crate::error::CompileError;
use crate::frame::TEMP_AREA;
use crate::resolve::{Intrinsic, ResolvedMethod, ResolvedType, ReturnKind};
use crate::runtime::object::{
    md_array_data_offset, ARRAY_DATA_OFFSET, ARRAY_LENGTH_OFFSET, BOXED_VALUE_OFFSET,
    DELEGATE_FNPTR_OFFSET, DELEGATE_TARGET_OFFSET, MD_ARRAY_BOUNDS_OFFSET,
    MT_COMPONENT_SIZE_OFFSET, MT_VTABLE_OFFSET,
};
use crate::stack::{copy_block, zero_block, EvalStackEntry, StackKind};

use super::calls::{CallShape, ThisSource};
use super::MethodCompiler;

impl<'a> MethodCompiler<'a> {
    fn resolve_method_token(&self, token: u32) -> Result<ResolvedMethod, CompileError> {
        self.resolvers
            .method
            .resolve_method(token)
            .ok_or(CompileError::MethodResolution { token })
    }

    // ---- newobj ----

    pub(super) fn emit_newobj(&mut self, token: u32, il_offset: u32) -> Result<(), CompileError> {
        let rm = self.resolve_method_token(token)?;

        match rm.intrinsic {
            Intrinsic::DelegateCtor => return self.emit_delegate_ctor(&rm, il_offset),
            Intrinsic::MdArrayCtor => return self.emit_md_array_ctor(&rm, il_offset),
            _ => {}
        }

        if rm.declaring_is_value_type {
            // Zero a frame temporary, run the ctor against its address,
            // then push the initialized value.
            let size = rm.declaring_type_size.max(1);
            if size > TEMP_AREA as u32 {
                return Err(CompileError::TempOverflow(size));
            }
            let temp = self.frame.temp_offset();
            {
                let mut asm = self.asm();
                zero_block(&mut asm, regs::FP, temp, size);
            }
            let shape = CallShape::for_ctor(&rm);
            let staged = self.stage_call_args(&shape, ThisSource::FrameAddr(temp), il_offset)?;
            self.emit_direct_target(&rm, &shape);
            self.finish_call(&shape, staged, il_offset)?;
            self.stack.push_value_from(&mut self.buf, regs::FP, temp, size);
            return Ok(());
        }

        // Reference type: allocate, then construct. The fresh object rides
        // in a callee-saved register across the ctor call.
        self.asm().mov_ri64(regs::R1, rm.declaring_method_table as u64);
        self.emit_helper_call(self.helpers.new_fast_addr());
        self.asm().mov_rr(regs::R7, regs::R0);

        let shape = CallShape::for_ctor(&rm);
        let staged = self.stage_call_args(&shape, ThisSource::Reg(regs::R7), il_offset)?;
        self.emit_direct_target(&rm, &shape);
        self.finish_call(&shape, staged, il_offset)?;

        self.asm().mov_rr(regs::R0, regs::R7);
        self.stack.push_reg_r0(&mut self.buf, StackKind::ObjectRef);
        Ok(())
    }

    fn emit_delegate_ctor(&mut self, rm: &ResolvedMethod, il_offset: u32) -> Result<(), CompileError> {
        // Operands: [target, fnptr] with the function pointer on top.
        self.asm().mov_ri64(regs::R1, rm.declaring_method_table as u64);
        self.emit_helper_call(self.helpers.new_fast_addr());
        self.asm().mov_rr(regs::R7, regs::R0);
        self.pop_reg(regs::R0, il_offset)?;
        self.asm().store64(regs::R7, DELEGATE_FNPTR_OFFSET, regs::R0);
        self.pop_reg(regs::R0, il_offset)?;
        self.asm().store64(regs::R7, DELEGATE_TARGET_OFFSET, regs::R0);
        self.asm().mov_rr(regs::R0, regs::R7);
        self.stack.push_reg_r0(&mut self.buf, StackKind::ObjectRef);
        Ok(())
    }

    fn emit_md_array_ctor(&mut self, rm: &ResolvedMethod, il_offset: u32) -> Result<(), CompileError> {
        let rank = rm.arg_count.min(3) as usize;
        // Dimensions were pushed first-to-last; pop into RDX/R8/R9.
        let dim_regs = [regs::R2, regs::R3, regs::R4];
        for i in (0..rank).rev() {
            self.pop_reg(dim_regs[i], il_offset)?;
        }
        for reg in dim_regs.iter().skip(rank) {
            self.asm().xor_rr32(*reg, *reg);
        }
        self.asm().mov_ri64(regs::R1, rm.declaring_method_table as u64);
        self.emit_helper_call(self.helpers.new_md_array_addr());
        self.stack.push_reg_r0(&mut self.buf, StackKind::ObjectRef);
        Ok(())
    }

    // ---- newarr ----

    pub(super) fn emit_newarr(&mut self, token: u32, il_offset: u32) -> Result<(), CompileError> {
        let ty = self.resolve_type_token(token)?;
        let count = self.pop_reg(regs::R2, il_offset)?;
        if count.kind.is_int32_like() {
            self.asm().movsxd(regs::R2, regs::R2);
        }
        self.asm().mov_ri64(regs::R1, ty.array_method_table as u64);
        self.emit_helper_call(self.helpers.new_array_addr());
        self.stack.push_reg_r0(&mut self.buf, StackKind::ObjectRef);
        Ok(())
    }

    // ---- boxing ----

    pub(super) fn emit_box(&mut self, token: u32, il_offset: u32) -> Result<(), CompileError> {
        let ty = self.resolve_type_token(token)?;
        if !ty.is_value_type {
            return Ok(()); // boxing a reference is the identity
        }
        if ty.is_nullable {
            return self.emit_box_nullable(&ty, il_offset);
        }
        let entry = *self.stack.peek(0).ok_or_else(|| self.stack_underflow(il_offset))?;
        self.asm().mov_ri64(regs::R1, ty.method_table as u64);
        self.emit_helper_call(self.helpers.new_fast_addr());
        {
            let mut asm = self.asm();
            asm.mov_rr(regs::R2, regs::R0);
            copy_block(&mut asm, regs::R2, BOXED_VALUE_OFFSET, regs::SP, 0, ty.size.max(1));
            asm.add_ri(regs::SP, entry.byte_size as i32);
            asm.mov_rr(regs::R0, regs::R2);
        }
        self.stack.pop();
        self.stack.push_reg_r0(&mut self.buf, StackKind::ObjectRef);
        Ok(())
    }

    /// `box` of `Nullable<T>`: null when HasValue is clear, otherwise a
    /// box of the inner value under T's MethodTable.
    fn emit_box_nullable(&mut self, ty: &ResolvedType, il_offset: u32) -> Result<(), CompileError> {
        let entry = *self.stack.peek(0).ok_or_else(|| self.stack_underflow(il_offset))?;
        let has_value;
        let done;
        {
            let mut asm = self.asm();
            asm.load8_zx(regs::R0, regs::SP, 0);
            asm.test_rr32(regs::R0, regs::R0);
            has_value = asm.jcc_placeholder(Cond::Ne);
            asm.xor_rr32(regs::R0, regs::R0);
            done = asm.jmp_placeholder();
        }
        self.buf.patch_rel32(has_value);
        self.asm().mov_ri64(regs::R1, ty.nullable_inner_method_table as u64);
        self.emit_helper_call(self.helpers.new_fast_addr());
        {
            let mut asm = self.asm();
            asm.mov_rr(regs::R5, regs::R0);
            copy_block(
                &mut asm,
                regs::R5,
                BOXED_VALUE_OFFSET,
                regs::SP,
                ty.nullable_value_offset as i32,
                ty.nullable_inner_size.max(1),
            );
            asm.mov_rr(regs::R0, regs::R5);
        }
        self.buf.patch_rel32(done);
        self.asm().add_ri(regs::SP, entry.byte_size as i32);
        self.stack.pop();
        self.stack.push_reg_r0(&mut self.buf, StackKind::ObjectRef);
        Ok(())
    }

    pub(super) fn emit_unbox(&mut self, _token: u32, il_offset: u32) -> Result<(), CompileError> {
        self.pop_reg(regs::R0, il_offset)?;
        self.asm().add_ri(regs::R0, BOXED_VALUE_OFFSET);
        self.stack.push_reg_r0(&mut self.buf, StackKind::ManagedPtr);
        Ok(())
    }

    pub(super) fn emit_unbox_any(&mut self, token: u32, il_offset: u32) -> Result<(), CompileError> {
        let ty = self.resolve_type_token(token)?;
        if !ty.is_value_type {
            return self.emit_type_test(token, false, il_offset);
        }
        if ty.is_nullable {
            // Build a fresh Nullable<T> on the stack from the boxed T (or
            // a zeroed one from null).
            self.pop_reg(regs::R1, il_offset)?;
            let size = ty.size.max(1);
            let entry = EvalStackEntry::value_type(size);
            self.asm().sub_ri(regs::SP, entry.byte_size as i32);
            let null_case;
            let done;
            {
                let mut asm = self.asm();
                asm.test_rr(regs::R1, regs::R1);
                null_case = asm.jcc_placeholder(Cond::E);
                asm.mov_ri32(regs::R0, 1);
                asm.store8(regs::SP, 0, regs::R0);
                copy_block(
                    &mut asm,
                    regs::SP,
                    ty.nullable_value_offset as i32,
                    regs::R1,
                    BOXED_VALUE_OFFSET,
                    ty.nullable_inner_size.max(1),
                );
                done = asm.jmp_placeholder();
            }
            self.buf.patch_rel32(null_case);
            {
                let mut asm = self.asm();
                zero_block(&mut asm, regs::SP, 0, size);
            }
            self.buf.patch_rel32(done);
            self.stack.push(entry);
            return Ok(());
        }
        self.pop_reg(regs::R1, il_offset)?;
        let size = ty.size.max(1);
        if matches!(size, 1 | 2 | 4 | 8) {
            let mut asm = self.asm();
            match size {
                1 => asm.load8_zx(regs::R0, regs::R1, BOXED_VALUE_OFFSET),
                2 => asm.load16_zx(regs::R0, regs::R1, BOXED_VALUE_OFFSET),
                4 => asm.load32_zx(regs::R0, regs::R1, BOXED_VALUE_OFFSET),
                _ => asm.load64(regs::R0, regs::R1, BOXED_VALUE_OFFSET),
            }
            asm.push_reg(regs::R0);
            drop(asm);
            self.stack.push(EvalStackEntry::value_type(size));
        } else {
            self.asm().add_ri(regs::R1, BOXED_VALUE_OFFSET);
            self.stack.push_value_from(&mut self.buf, regs::R1, 0, size);
        }
        Ok(())
    }

    // ---- type tests ----

    /// `castclass` (trap on failure) and `isinst` (null on failure). The
    /// object stays on the stack; null always passes.
    pub(super) fn emit_type_test(&mut self, token: u32, is_isinst: bool, il_offset: u32) -> Result<(), CompileError> {
        let ty = self.resolve_type_token(token)?;
        if self.stack.peek(0).is_none() {
            return Err(self.stack_underflow(il_offset));
        }
        let null_pass;
        {
            let mut asm = self.asm();
            asm.load64(regs::R1, regs::SP, 0);
            asm.test_rr(regs::R1, regs::R1);
            null_pass = asm.jcc_placeholder(Cond::E);
            asm.load64(regs::R1, regs::R1, 0);
            asm.mov_ri64(regs::R2, ty.method_table as u64);
        }
        self.emit_helper_call(self.helpers.is_assignable_to_addr());
        let ok;
        {
            let mut asm = self.asm();
            asm.test_rr32(regs::R0, regs::R0);
            ok = asm.jcc_placeholder(Cond::Ne);
        }
        if is_isinst {
            let mut asm = self.asm();
            asm.xor_rr32(regs::R0, regs::R0);
            asm.store64(regs::SP, 0, regs::R0);
        } else {
            self.asm().int3();
        }
        self.buf.patch_rel32(ok);
        self.buf.patch_rel32(null_pass);
        Ok(())
    }

    // ---- tokens and function pointers ----

    /// `ldtoken`: a MethodTable for type tokens, the static-data address
    /// for RVA field tokens, otherwise the composite
    /// `(assembly_id << 32) | token` handle.
    pub(super) fn emit_ldtoken(&mut self, token: u32) -> Result<(), CompileError> {
        let table = token >> 24;
        let value: u64 = match table {
            0x01 | 0x02 | 0x1B => {
                let ty = self.resolve_type_token(token)?;
                ty.method_table as u64
            }
            0x04 => {
                let data = self.resolvers.field.static_data_address(token);
                if data != 0 {
                    data as u64
                } else {
                    (self.desc.assembly_id as u64) << 32 | token as u64
                }
            }
            _ => (self.desc.assembly_id as u64) << 32 | token as u64,
        };
        self.asm().mov_ri64(regs::R0, value);
        self.stack.push_reg_r0(&mut self.buf, StackKind::NativeInt);
        Ok(())
    }

    pub(super) fn emit_ldftn(&mut self, token: u32) -> Result<(), CompileError> {
        let rm = self.resolve_method_token(token)?;
        let mut asm = self.asm();
        if rm.native_code != 0 {
            asm.mov_ri64(regs::R0, rm.native_code as u64);
        } else {
            // The registry slot is populated by the time any delegate made
            // from this pointer can be invoked.
            asm.mov_ri64(regs::R0, rm.registry_entry as u64);
            asm.load64(regs::R0, regs::R0, crate::runtime::registry::NATIVE_CODE_OFFSET);
        }
        drop(asm);
        self.stack.push_reg_r0(&mut self.buf, StackKind::NativeInt);
        Ok(())
    }

    pub(super) fn emit_ldvirtftn(&mut self, token: u32, il_offset: u32) -> Result<(), CompileError> {
        let rm = self.resolve_method_token(token)?;
        self.pop_reg(regs::R1, il_offset)?;
        let mut asm = self.asm();
        asm.load64(regs::R0, regs::R1, 0);
        asm.load64(regs::R0, regs::R0, MT_VTABLE_OFFSET + rm.vtable_slot as i32 * 8);
        drop(asm);
        self.stack.push_reg_r0(&mut self.buf, StackKind::NativeInt);
        Ok(())
    }

    pub(super) fn emit_sizeof(&mut self, token: u32) -> Result<(), CompileError> {
        let ty = self.resolve_type_token(token)?;
        let size = if ty.is_value_type { ty.size.max(1) } else { 8 };
        self.asm().mov_ri32(regs::R0, size as i32);
        self.stack.push_reg_r0(&mut self.buf, StackKind::Int32);
        Ok(())
    }

    // ---- TypedReference ----

    pub(super) fn emit_mkrefany(&mut self, token: u32, il_offset: u32) -> Result<(), CompileError> {
        let ty = self.resolve_type_token(token)?;
        self.pop_reg(regs::R0, il_offset)?;
        let mut asm = self.asm();
        asm.sub_ri(regs::SP, 16);
        asm.store64(regs::SP, 0, regs::R0);
        asm.mov_ri64(regs::R1, ty.method_table as u64);
        asm.store64(regs::SP, 8, regs::R1);
        drop(asm);
        self.stack.push(EvalStackEntry::value_type(16));
        Ok(())
    }

    pub(super) fn emit_refanyval(&mut self, il_offset: u32) -> Result<(), CompileError> {
        let entry = *self.stack.peek(0).ok_or_else(|| self.stack_underflow(il_offset))?;
        let mut asm = self.asm();
        asm.load64(regs::R0, regs::SP, 0);
        asm.add_ri(regs::SP, entry.byte_size as i32);
        drop(asm);
        self.stack.pop();
        self.stack.push_reg_r0(&mut self.buf, StackKind::ManagedPtr);
        Ok(())
    }

    pub(super) fn emit_refanytype(&mut self, il_offset: u32) -> Result<(), CompileError> {
        let entry = *self.stack.peek(0).ok_or_else(|| self.stack_underflow(il_offset))?;
        let mut asm = self.asm();
        asm.load64(regs::R0, regs::SP, 8);
        asm.add_ri(regs::SP, entry.byte_size as i32);
        drop(asm);
        self.stack.pop();
        self.stack.push_reg_r0(&mut self.buf, StackKind::NativeInt);
        Ok(())
    }

    // ---- intrinsic call bodies ----

    pub(super) fn emit_intrinsic_call(&mut self, rm: &ResolvedMethod, il_offset: u32) -> Result<(), CompileError> {
        match rm.intrinsic {
            Intrinsic::CreateInstance => self.emit_create_instance(rm, il_offset),
            Intrinsic::InitializeArray => self.emit_initialize_array(il_offset),
            Intrinsic::MdArrayGet => self.emit_md_array_access(rm, MdAccess::Get, il_offset),
            Intrinsic::MdArraySet => self.emit_md_array_access(rm, MdAccess::Set, il_offset),
            Intrinsic::MdArrayAddress => self.emit_md_array_access(rm, MdAccess::Address, il_offset),
            Intrinsic::MdArrayCtor => self.emit_md_array_ctor(rm, il_offset),
            _ => Err(CompileError::MethodResolution { token: rm.method_token }),
        }
    }

    fn emit_create_instance(&mut self, rm: &ResolvedMethod, il_offset: u32) -> Result<(), CompileError> {
        if rm.intrinsic_type_is_value {
            let size = rm.intrinsic_type_size.max(1);
            if size > TEMP_AREA as u32 {
                return Err(CompileError::TempOverflow(size));
            }
            let temp = self.frame.temp_offset();
            {
                let mut asm = self.asm();
                zero_block(&mut asm, regs::FP, temp, size);
            }
            if rm.intrinsic_ctor != 0 {
                self.asm().lea(regs::R1, regs::FP, temp);
                self.emit_helper_call(rm.intrinsic_ctor);
            }
            self.stack.push_value_from(&mut self.buf, regs::FP, temp, size);
            let _ = il_offset;
            return Ok(());
        }
        self.asm().mov_ri64(regs::R1, rm.intrinsic_method_table as u64);
        self.emit_helper_call(self.helpers.new_fast_addr());
        self.asm().mov_rr(regs::R7, regs::R0);
        if rm.intrinsic_ctor != 0 {
            self.asm().mov_rr(regs::R1, regs::R7);
            self.emit_helper_call(rm.intrinsic_ctor);
        }
        self.asm().mov_rr(regs::R0, regs::R7);
        self.stack.push_reg_r0(&mut self.buf, StackKind::ObjectRef);
        Ok(())
    }

    /// `RuntimeHelpers.InitializeArray(array, fieldHandle)`: bulk-copy the
    /// RVA blob into the array data.
    fn emit_initialize_array(&mut self, il_offset: u32) -> Result<(), CompileError> {
        self.pop_reg(regs::R5, il_offset)?; // static data address
        self.pop_reg(regs::R2, il_offset)?; // array
        let mut asm = self.asm();
        asm.load64(regs::R1, regs::R2, ARRAY_LENGTH_OFFSET);
        asm.load64(regs::R0, regs::R2, 0);
        asm.load16_zx(regs::R0, regs::R0, MT_COMPONENT_SIZE_OFFSET);
        asm.imul_rr(regs::R1, regs::R0);
        asm.push_reg(crate::emit::Reg::Rsi);
        asm.push_reg(crate::emit::Reg::Rdi);
        asm.mov_rr(crate::emit::Reg::Rsi, regs::R5);
        asm.lea(crate::emit::Reg::Rdi, regs::R2, ARRAY_DATA_OFFSET);
        asm.rep_movsb();
        asm.pop_reg(crate::emit::Reg::Rdi);
        asm.pop_reg(crate::emit::Reg::Rsi);
        Ok(())
    }

    /// Inline rank-2 and rank-3 array element access.
    fn emit_md_array_access(&mut self, rm: &ResolvedMethod, access: MdAccess, il_offset: u32) -> Result<(), CompileError> {
        let rank = match access {
            MdAccess::Set => rm.arg_count.saturating_sub(1),
            _ => rm.arg_count,
        }
        .min(3) as u32;
        let elem_size = rm.element_size.max(1);

        if access == MdAccess::Set {
            self.pop_reg(regs::R5, il_offset)?;
        }
        // Indexes in push order i, j, (k); array beneath them.
        let index_regs = [regs::R1, regs::R3, regs::R4];
        for i in (0..rank as usize).rev() {
            let entry = self.pop_reg(index_regs[i], il_offset)?;
            if entry.kind.is_int32_like() {
                self.asm().mov_rr32(index_regs[i], index_regs[i]);
            }
        }
        self.pop_reg(regs::R0, il_offset)?;

        // Linear index: rank 2 is i*dim1 + j, rank 3 is (i*dim1 + j)*dim2 + k.
        {
            let mut asm = self.asm();
            asm.load32_zx(regs::R2, regs::R0, MD_ARRAY_BOUNDS_OFFSET + 4);
            asm.imul_rr(regs::R1, regs::R2);
            asm.add_rr(regs::R1, regs::R3);
            if rank == 3 {
                asm.load32_zx(regs::R2, regs::R0, MD_ARRAY_BOUNDS_OFFSET + 8);
                asm.imul_rr(regs::R1, regs::R2);
                asm.add_rr(regs::R1, regs::R4);
            }
            if elem_size.is_power_of_two() {
                if elem_size > 1 {
                    asm.shl_imm(regs::R1, elem_size.trailing_zeros() as u8);
                }
            } else {
                asm.imul_ri(regs::R1, regs::R1, elem_size as i32);
            }
            asm.add_rr(regs::R0, regs::R1);
        }
        let data = md_array_data_offset(rank);

        match access {
            MdAccess::Address => {
                self.asm().add_ri(regs::R0, data);
                self.stack.push_reg_r0(&mut self.buf, StackKind::ManagedPtr);
            }
            MdAccess::Get => {
                let mut asm = self.asm();
                let kind = match rm.return_kind {
                    ReturnKind::Float32 => {
                        asm.movss_load(Xmm::Xmm0, regs::R0, data);
                        asm.movd_rx(regs::R0, Xmm::Xmm0);
                        StackKind::Float32
                    }
                    ReturnKind::Float64 => {
                        asm.movsd_load(Xmm::Xmm0, regs::R0, data);
                        asm.movq_rx(regs::R0, Xmm::Xmm0);
                        StackKind::Float64
                    }
                    _ => {
                        match elem_size {
                            1 => asm.load8_zx(regs::R0, regs::R0, data),
                            2 => asm.load16_zx(regs::R0, regs::R0, data),
                            4 => asm.load32_zx(regs::R0, regs::R0, data),
                            _ => asm.load64(regs::R0, regs::R0, data),
                        }
                        if matches!(rm.return_kind, ReturnKind::Int64 | ReturnKind::IntPtr) {
                            StackKind::Int64
                        } else {
                            StackKind::Int32
                        }
                    }
                };
                drop(asm);
                self.stack.push_reg_r0(&mut self.buf, kind);
            }
            MdAccess::Set => {
                let mut asm = self.asm();
                asm.mov_rr(regs::R2, regs::R0);
                asm.mov_rr(regs::R0, regs::R5);
                drop(asm);
                self.store_md_value(data, elem_size);
            }
        }
        Ok(())
    }

    fn store_md_value(&mut self, disp: i32, size: u32) {
        let mut asm = self.asm();
        match size {
            1 => asm.store8(regs::R2, disp, regs::R0),
            2 => asm.store16(regs::R2, disp, regs::R0),
            4 => asm.store32(regs::R2, disp, regs::R0),
            _ => asm.store64(regs::R2, disp, regs::R0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MdAccess {
    Get,
    Set,
    Address,
}
