//! Low-level x86-64 instruction emitter.
//!
//! A thin assembler over [`CodeBuffer`]: every method appends the encoding
//! of exactly one instruction (or one fixed idiom). There is no layout
//! pass; conditional branches always use the 0x0F two-byte rel32 forms so
//! forward references can be patched without re-measuring.
//!
//! Memory operands are `[base + disp]` only. RSP/R12 bases get their SIB
//! byte, RBP/R13 bases always carry a displacement, and disp8 is chosen
//! whenever the displacement fits.

pub mod regs;

pub use regs::{Cond, Reg, Xmm};

use crate::codebuf::CodeBuffer;

/// Assembler handle borrowed from a code buffer.
pub struct Emitter<'a> {
    pub buf: &'a mut CodeBuffer,
}

impl<'a> Emitter<'a> {
    pub fn new(buf: &'a mut CodeBuffer) -> Emitter<'a> {
        Emitter { buf }
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.buf.position()
    }

    // ---- encoding helpers ----

    #[inline]
    fn rex(&mut self, w: bool, reg: u8, rm: u8) {
        let rex = 0x40u8
            | (w as u8) << 3
            | ((reg >> 3) & 1) << 2
            | ((rm >> 3) & 1);
        self.buf.emit_u8(rex);
    }

    /// REX only when a mandatory bit is set.
    #[inline]
    fn rex_opt(&mut self, reg: u8, rm: u8) {
        if reg >= 8 || rm >= 8 {
            self.rex(false, reg, rm);
        }
    }

    #[inline]
    fn modrm_reg(&mut self, reg: u8, rm: u8) {
        self.buf.emit_u8(0xC0 | (reg & 7) << 3 | (rm & 7));
    }

    /// ModRM (+SIB, +disp) for a `[base + disp]` operand.
    fn modrm_mem(&mut self, reg: u8, base: Reg, disp: i32) {
        let rm = base.low3();
        let needs_sib = rm == 4; // RSP / R12
        let mode = if disp == 0 && rm != 5 {
            0u8 // RBP / R13 cannot encode mod=00 without disp
        } else if (-128..=127).contains(&disp) {
            1
        } else {
            2
        };
        self.buf.emit_u8(mode << 6 | (reg & 7) << 3 | rm);
        if needs_sib {
            self.buf.emit_u8(0x24);
        }
        match mode {
            1 => self.buf.emit_u8(disp as i8 as u8),
            2 => self.buf.emit_i32(disp),
            _ => {}
        }
    }

    // ---- push / pop ----

    pub fn push_reg(&mut self, reg: Reg) {
        if reg.is_extended() {
            self.buf.emit_u8(0x41);
        }
        self.buf.emit_u8(0x50 + reg.low3());
    }

    pub fn pop_reg(&mut self, reg: Reg) {
        if reg.is_extended() {
            self.buf.emit_u8(0x41);
        }
        self.buf.emit_u8(0x58 + reg.low3());
    }

    // ---- moves ----

    /// `mov dst, src` (64-bit)
    pub fn mov_rr(&mut self, dst: Reg, src: Reg) {
        self.rex(true, src.number(), dst.number());
        self.buf.emit_u8(0x89);
        self.modrm_reg(src.number(), dst.number());
    }

    /// `mov dst32, src32` — also the canonical zero-extend-32 idiom.
    pub fn mov_rr32(&mut self, dst: Reg, src: Reg) {
        self.rex_opt(src.number(), dst.number());
        self.buf.emit_u8(0x89);
        self.modrm_reg(src.number(), dst.number());
    }

    /// `mov dst, [base + disp]` (64-bit)
    pub fn load64(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.rex(true, dst.number(), base.number());
        self.buf.emit_u8(0x8B);
        self.modrm_mem(dst.number(), base, disp);
    }

    /// `mov dst32, [base + disp]` — zero-extends into the full register.
    pub fn load32_zx(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.rex_opt(dst.number(), base.number());
        self.buf.emit_u8(0x8B);
        self.modrm_mem(dst.number(), base, disp);
    }

    /// `movsxd dst, dword [base + disp]`
    pub fn load32_sx(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.rex(true, dst.number(), base.number());
        self.buf.emit_u8(0x63);
        self.modrm_mem(dst.number(), base, disp);
    }

    /// `movzx dst, word [base + disp]`
    pub fn load16_zx(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.rex(true, dst.number(), base.number());
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xB7);
        self.modrm_mem(dst.number(), base, disp);
    }

    /// `movsx dst, word [base + disp]`
    pub fn load16_sx(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.rex(true, dst.number(), base.number());
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xBF);
        self.modrm_mem(dst.number(), base, disp);
    }

    /// `movzx dst, byte [base + disp]`
    pub fn load8_zx(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.rex(true, dst.number(), base.number());
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xB6);
        self.modrm_mem(dst.number(), base, disp);
    }

    /// `movsx dst, byte [base + disp]`
    pub fn load8_sx(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.rex(true, dst.number(), base.number());
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xBE);
        self.modrm_mem(dst.number(), base, disp);
    }

    /// `mov [base + disp], src` (64-bit)
    pub fn store64(&mut self, base: Reg, disp: i32, src: Reg) {
        self.rex(true, src.number(), base.number());
        self.buf.emit_u8(0x89);
        self.modrm_mem(src.number(), base, disp);
    }

    /// `mov [base + disp], src32`
    pub fn store32(&mut self, base: Reg, disp: i32, src: Reg) {
        self.rex_opt(src.number(), base.number());
        self.buf.emit_u8(0x89);
        self.modrm_mem(src.number(), base, disp);
    }

    /// `mov [base + disp], src16`
    pub fn store16(&mut self, base: Reg, disp: i32, src: Reg) {
        self.buf.emit_u8(0x66);
        self.rex_opt(src.number(), base.number());
        self.buf.emit_u8(0x89);
        self.modrm_mem(src.number(), base, disp);
    }

    /// `mov [base + disp], src8`
    pub fn store8(&mut self, base: Reg, disp: i32, src: Reg) {
        // Unconditional REX so RSI/RDI-class sources encode their low byte.
        self.rex(false, src.number(), base.number());
        self.buf.emit_u8(0x88);
        self.modrm_mem(src.number(), base, disp);
    }

    /// `mov dst, imm64`
    pub fn mov_ri64(&mut self, dst: Reg, imm: u64) {
        self.rex(true, 0, dst.number());
        self.buf.emit_u8(0xB8 + dst.low3());
        self.buf.emit_u64(imm);
    }

    /// `mov dst32, imm32` — zero-extends.
    pub fn mov_ri32(&mut self, dst: Reg, imm: i32) {
        self.rex_opt(0, dst.number());
        self.buf.emit_u8(0xB8 + dst.low3());
        self.buf.emit_i32(imm);
    }

    /// `lea dst, [base + disp]`
    pub fn lea(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.rex(true, dst.number(), base.number());
        self.buf.emit_u8(0x8D);
        self.modrm_mem(dst.number(), base, disp);
    }

    /// `movsxd dst, src32`
    pub fn movsxd(&mut self, dst: Reg, src: Reg) {
        self.rex(true, dst.number(), src.number());
        self.buf.emit_u8(0x63);
        self.modrm_reg(dst.number(), src.number());
    }

    /// `movzx dst, src8`
    pub fn movzx8(&mut self, dst: Reg, src: Reg) {
        self.rex(true, dst.number(), src.number());
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xB6);
        self.modrm_reg(dst.number(), src.number());
    }

    /// `movsx dst, src8`
    pub fn movsx8(&mut self, dst: Reg, src: Reg) {
        self.rex(true, dst.number(), src.number());
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xBE);
        self.modrm_reg(dst.number(), src.number());
    }

    /// `movzx dst, src16`
    pub fn movzx16(&mut self, dst: Reg, src: Reg) {
        self.rex(true, dst.number(), src.number());
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xB7);
        self.modrm_reg(dst.number(), src.number());
    }

    /// `movsx dst, src16`
    pub fn movsx16(&mut self, dst: Reg, src: Reg) {
        self.rex(true, dst.number(), src.number());
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xBF);
        self.modrm_reg(dst.number(), src.number());
    }

    // ---- integer ALU ----

    fn alu_rr(&mut self, opcode: u8, w: bool, dst: Reg, src: Reg) {
        if w {
            self.rex(true, src.number(), dst.number());
        } else {
            self.rex_opt(src.number(), dst.number());
        }
        self.buf.emit_u8(opcode);
        self.modrm_reg(src.number(), dst.number());
    }

    pub fn add_rr(&mut self, dst: Reg, src: Reg) {
        self.alu_rr(0x01, true, dst, src);
    }

    pub fn add_rr32(&mut self, dst: Reg, src: Reg) {
        self.alu_rr(0x01, false, dst, src);
    }

    pub fn sub_rr(&mut self, dst: Reg, src: Reg) {
        self.alu_rr(0x29, true, dst, src);
    }

    pub fn sub_rr32(&mut self, dst: Reg, src: Reg) {
        self.alu_rr(0x29, false, dst, src);
    }

    pub fn and_rr(&mut self, dst: Reg, src: Reg) {
        self.alu_rr(0x21, true, dst, src);
    }

    pub fn and_rr32(&mut self, dst: Reg, src: Reg) {
        self.alu_rr(0x21, false, dst, src);
    }

    pub fn or_rr(&mut self, dst: Reg, src: Reg) {
        self.alu_rr(0x09, true, dst, src);
    }

    pub fn or_rr32(&mut self, dst: Reg, src: Reg) {
        self.alu_rr(0x09, false, dst, src);
    }

    pub fn xor_rr(&mut self, dst: Reg, src: Reg) {
        self.alu_rr(0x31, true, dst, src);
    }

    pub fn xor_rr32(&mut self, dst: Reg, src: Reg) {
        self.alu_rr(0x31, false, dst, src);
    }

    pub fn cmp_rr(&mut self, a: Reg, b: Reg) {
        self.alu_rr(0x39, true, a, b);
    }

    pub fn cmp_rr32(&mut self, a: Reg, b: Reg) {
        self.alu_rr(0x39, false, a, b);
    }

    pub fn test_rr(&mut self, a: Reg, b: Reg) {
        // 85 /r: TEST r/m64, r64
        self.rex(true, b.number(), a.number());
        self.buf.emit_u8(0x85);
        self.modrm_reg(b.number(), a.number());
    }

    pub fn test_rr32(&mut self, a: Reg, b: Reg) {
        self.rex_opt(b.number(), a.number());
        self.buf.emit_u8(0x85);
        self.modrm_reg(b.number(), a.number());
    }

    /// Group-1 immediate form (`add/or/and/sub/xor/cmp r, imm`).
    fn alu_ri(&mut self, ext: u8, w: bool, reg: Reg, imm: i32) {
        if w {
            self.rex(true, 0, reg.number());
        } else {
            self.rex_opt(0, reg.number());
        }
        if (-128..=127).contains(&imm) {
            self.buf.emit_u8(0x83);
            self.modrm_reg(ext, reg.number());
            self.buf.emit_u8(imm as i8 as u8);
        } else {
            self.buf.emit_u8(0x81);
            self.modrm_reg(ext, reg.number());
            self.buf.emit_i32(imm);
        }
    }

    pub fn add_ri(&mut self, reg: Reg, imm: i32) {
        self.alu_ri(0, true, reg, imm);
    }

    pub fn sub_ri(&mut self, reg: Reg, imm: i32) {
        self.alu_ri(5, true, reg, imm);
    }

    pub fn and_ri(&mut self, reg: Reg, imm: i32) {
        self.alu_ri(4, true, reg, imm);
    }

    pub fn or_ri(&mut self, reg: Reg, imm: i32) {
        self.alu_ri(1, true, reg, imm);
    }

    pub fn cmp_ri(&mut self, reg: Reg, imm: i32) {
        self.alu_ri(7, true, reg, imm);
    }

    pub fn cmp_ri32(&mut self, reg: Reg, imm: i32) {
        self.alu_ri(7, false, reg, imm);
    }

    /// `cmp qword [base + disp], imm32`
    pub fn cmp_mi(&mut self, base: Reg, disp: i32, imm: i32) {
        self.rex(true, 7, base.number());
        self.buf.emit_u8(0x81);
        self.modrm_mem(7, base, disp);
        self.buf.emit_i32(imm);
    }

    pub fn imul_rr(&mut self, dst: Reg, src: Reg) {
        self.rex(true, dst.number(), src.number());
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xAF);
        self.modrm_reg(dst.number(), src.number());
    }

    pub fn imul_rr32(&mut self, dst: Reg, src: Reg) {
        self.rex_opt(dst.number(), src.number());
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0xAF);
        self.modrm_reg(dst.number(), src.number());
    }

    /// `imul dst, src, imm32`
    pub fn imul_ri(&mut self, dst: Reg, src: Reg, imm: i32) {
        self.rex(true, dst.number(), src.number());
        self.buf.emit_u8(0x69);
        self.modrm_reg(dst.number(), src.number());
        self.buf.emit_i32(imm);
    }

    fn unary(&mut self, ext: u8, w: bool, reg: Reg) {
        if w {
            self.rex(true, 0, reg.number());
        } else {
            self.rex_opt(0, reg.number());
        }
        self.buf.emit_u8(0xF7);
        self.modrm_reg(ext, reg.number());
    }

    pub fn neg(&mut self, reg: Reg) {
        self.unary(3, true, reg);
    }

    pub fn neg32(&mut self, reg: Reg) {
        self.unary(3, false, reg);
    }

    pub fn not(&mut self, reg: Reg) {
        self.unary(2, true, reg);
    }

    pub fn not32(&mut self, reg: Reg) {
        self.unary(2, false, reg);
    }

    /// `mul reg` — unsigned RDX:RAX = RAX * reg.
    pub fn mul(&mut self, reg: Reg) {
        self.unary(4, true, reg);
    }

    pub fn div(&mut self, reg: Reg) {
        self.unary(6, true, reg);
    }

    pub fn div32(&mut self, reg: Reg) {
        self.unary(6, false, reg);
    }

    pub fn idiv(&mut self, reg: Reg) {
        self.unary(7, true, reg);
    }

    pub fn idiv32(&mut self, reg: Reg) {
        self.unary(7, false, reg);
    }

    /// Sign-extend RAX into RDX:RAX.
    pub fn cqo(&mut self) {
        self.buf.emit_u8(0x48);
        self.buf.emit_u8(0x99);
    }

    /// Sign-extend EAX into EDX:EAX.
    pub fn cdq(&mut self) {
        self.buf.emit_u8(0x99);
    }

    /// Zero RDX (divisor setup for unsigned division).
    pub fn zero_rdx(&mut self) {
        self.xor_rr32(Reg::Rdx, Reg::Rdx);
    }

    fn shift_cl(&mut self, ext: u8, w: bool, reg: Reg) {
        if w {
            self.rex(true, 0, reg.number());
        } else {
            self.rex_opt(0, reg.number());
        }
        self.buf.emit_u8(0xD3);
        self.modrm_reg(ext, reg.number());
    }

    fn shift_imm(&mut self, ext: u8, w: bool, reg: Reg, imm: u8) {
        if w {
            self.rex(true, 0, reg.number());
        } else {
            self.rex_opt(0, reg.number());
        }
        self.buf.emit_u8(0xC1);
        self.modrm_reg(ext, reg.number());
        self.buf.emit_u8(imm);
    }

    pub fn shl_cl(&mut self, reg: Reg) {
        self.shift_cl(4, true, reg);
    }

    pub fn shl_cl32(&mut self, reg: Reg) {
        self.shift_cl(4, false, reg);
    }

    pub fn shr_cl(&mut self, reg: Reg) {
        self.shift_cl(5, true, reg);
    }

    pub fn shr_cl32(&mut self, reg: Reg) {
        self.shift_cl(5, false, reg);
    }

    pub fn sar_cl(&mut self, reg: Reg) {
        self.shift_cl(7, true, reg);
    }

    pub fn sar_cl32(&mut self, reg: Reg) {
        self.shift_cl(7, false, reg);
    }

    pub fn shl_imm(&mut self, reg: Reg, imm: u8) {
        self.shift_imm(4, true, reg, imm);
    }

    pub fn shr_imm(&mut self, reg: Reg, imm: u8) {
        self.shift_imm(5, true, reg, imm);
    }

    pub fn sar_imm(&mut self, reg: Reg, imm: u8) {
        self.shift_imm(7, true, reg, imm);
    }

    /// `setcc dst8` followed by zero-extension to 64 bits.
    pub fn setcc_zx(&mut self, cond: Cond, dst: Reg) {
        self.rex(false, 0, dst.number());
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x90 + cond as u8);
        self.modrm_reg(0, dst.number());
        self.movzx8(dst, dst);
    }

    // ---- SSE scalar ----

    fn sse_op(&mut self, prefix: u8, opcode: u8, reg: u8, rm: u8) {
        self.buf.emit_u8(prefix);
        self.rex_opt(reg, rm);
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(opcode);
        self.modrm_reg(reg, rm);
    }

    fn sse_mem(&mut self, prefix: u8, opcode: u8, reg: u8, base: Reg, disp: i32) {
        self.buf.emit_u8(prefix);
        self.rex_opt(reg, base.number());
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(opcode);
        self.modrm_mem(reg, base, disp);
    }

    pub fn movss_load(&mut self, dst: Xmm, base: Reg, disp: i32) {
        self.sse_mem(0xF3, 0x10, dst.number(), base, disp);
    }

    pub fn movss_store(&mut self, base: Reg, disp: i32, src: Xmm) {
        self.sse_mem(0xF3, 0x11, src.number(), base, disp);
    }

    pub fn movsd_load(&mut self, dst: Xmm, base: Reg, disp: i32) {
        self.sse_mem(0xF2, 0x10, dst.number(), base, disp);
    }

    /// `movsd xmm, xmm`
    pub fn movsd_rr(&mut self, dst: Xmm, src: Xmm) {
        self.sse_op(0xF2, 0x10, dst.number(), src.number());
    }

    pub fn movsd_store(&mut self, base: Reg, disp: i32, src: Xmm) {
        self.sse_mem(0xF2, 0x11, src.number(), base, disp);
    }

    /// `movq xmm, r64`
    pub fn movq_xr(&mut self, dst: Xmm, src: Reg) {
        self.buf.emit_u8(0x66);
        self.rex(true, dst.number(), src.number());
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x6E);
        self.modrm_reg(dst.number(), src.number());
    }

    /// `movq r64, xmm`
    pub fn movq_rx(&mut self, dst: Reg, src: Xmm) {
        self.buf.emit_u8(0x66);
        self.rex(true, src.number(), dst.number());
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x7E);
        self.modrm_reg(src.number(), dst.number());
    }

    /// `movd xmm, r32`
    pub fn movd_xr(&mut self, dst: Xmm, src: Reg) {
        self.buf.emit_u8(0x66);
        self.rex_opt(dst.number(), src.number());
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x6E);
        self.modrm_reg(dst.number(), src.number());
    }

    /// `movd r32, xmm` — zero-extends into the full register.
    pub fn movd_rx(&mut self, dst: Reg, src: Xmm) {
        self.buf.emit_u8(0x66);
        self.rex_opt(src.number(), dst.number());
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x7E);
        self.modrm_reg(src.number(), dst.number());
    }

    pub fn addss(&mut self, dst: Xmm, src: Xmm) {
        self.sse_op(0xF3, 0x58, dst.number(), src.number());
    }

    pub fn addsd(&mut self, dst: Xmm, src: Xmm) {
        self.sse_op(0xF2, 0x58, dst.number(), src.number());
    }

    pub fn subss(&mut self, dst: Xmm, src: Xmm) {
        self.sse_op(0xF3, 0x5C, dst.number(), src.number());
    }

    pub fn subsd(&mut self, dst: Xmm, src: Xmm) {
        self.sse_op(0xF2, 0x5C, dst.number(), src.number());
    }

    pub fn mulss(&mut self, dst: Xmm, src: Xmm) {
        self.sse_op(0xF3, 0x59, dst.number(), src.number());
    }

    pub fn mulsd(&mut self, dst: Xmm, src: Xmm) {
        self.sse_op(0xF2, 0x59, dst.number(), src.number());
    }

    pub fn divss(&mut self, dst: Xmm, src: Xmm) {
        self.sse_op(0xF3, 0x5E, dst.number(), src.number());
    }

    pub fn divsd(&mut self, dst: Xmm, src: Xmm) {
        self.sse_op(0xF2, 0x5E, dst.number(), src.number());
    }

    fn cvt(&mut self, prefix: u8, opcode: u8, w: bool, reg: u8, rm: u8) {
        self.buf.emit_u8(prefix);
        if w {
            self.rex(true, reg, rm);
        } else {
            self.rex_opt(reg, rm);
        }
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(opcode);
        self.modrm_reg(reg, rm);
    }

    /// `cvtsi2ss xmm, r32/r64`
    pub fn cvtsi2ss(&mut self, dst: Xmm, src: Reg, from64: bool) {
        self.cvt(0xF3, 0x2A, from64, dst.number(), src.number());
    }

    /// `cvtsi2sd xmm, r32/r64`
    pub fn cvtsi2sd(&mut self, dst: Xmm, src: Reg, from64: bool) {
        self.cvt(0xF2, 0x2A, from64, dst.number(), src.number());
    }

    /// `cvttss2si r32/r64, xmm` (truncating)
    pub fn cvttss2si(&mut self, dst: Reg, src: Xmm, to64: bool) {
        self.cvt(0xF3, 0x2C, to64, dst.number(), src.number());
    }

    /// `cvttsd2si r32/r64, xmm` (truncating)
    pub fn cvttsd2si(&mut self, dst: Reg, src: Xmm, to64: bool) {
        self.cvt(0xF2, 0x2C, to64, dst.number(), src.number());
    }

    pub fn cvtss2sd(&mut self, dst: Xmm, src: Xmm) {
        self.sse_op(0xF3, 0x5A, dst.number(), src.number());
    }

    pub fn cvtsd2ss(&mut self, dst: Xmm, src: Xmm) {
        self.sse_op(0xF2, 0x5A, dst.number(), src.number());
    }

    pub fn comiss(&mut self, a: Xmm, b: Xmm) {
        self.rex_opt(a.number(), b.number());
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x2F);
        self.modrm_reg(a.number(), b.number());
    }

    pub fn comisd(&mut self, a: Xmm, b: Xmm) {
        self.sse_op(0x66, 0x2F, a.number(), b.number());
    }

    // ---- control flow ----

    /// `jmp rel32` with a placeholder displacement; returns the patch offset.
    pub fn jmp_placeholder(&mut self) -> usize {
        self.buf.emit_u8(0xE9);
        let patch = self.buf.position();
        self.buf.emit_i32(0);
        patch
    }

    /// `jcc rel32` (two-byte form) with a placeholder; returns the patch offset.
    pub fn jcc_placeholder(&mut self, cond: Cond) -> usize {
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x80 + cond as u8);
        let patch = self.buf.position();
        self.buf.emit_i32(0);
        patch
    }

    /// `jmp` to an already-emitted native offset.
    pub fn jmp_to(&mut self, target: usize) {
        self.buf.emit_u8(0xE9);
        let rel = target as i64 - (self.buf.position() as i64 + 4);
        self.buf.emit_i32(rel as i32);
    }

    /// `jcc` forward over a fixed number of bytes (trap skip idiom).
    pub fn jcc_short_over(&mut self, cond: Cond, bytes: i32) {
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x80 + cond as u8);
        self.buf.emit_i32(bytes);
    }

    pub fn call_reg(&mut self, reg: Reg) {
        if reg.is_extended() {
            self.buf.emit_u8(0x41);
        }
        self.buf.emit_u8(0xFF);
        self.modrm_reg(2, reg.number());
    }

    /// `call qword [base + disp]`
    pub fn call_mem(&mut self, base: Reg, disp: i32) {
        self.rex_opt(0, base.number());
        self.buf.emit_u8(0xFF);
        self.modrm_mem(2, base, disp);
    }

    /// `call rel32` with a placeholder displacement; returns the patch offset.
    pub fn call_placeholder(&mut self) -> usize {
        self.buf.emit_u8(0xE8);
        let patch = self.buf.position();
        self.buf.emit_i32(0);
        patch
    }

    pub fn jmp_reg(&mut self, reg: Reg) {
        if reg.is_extended() {
            self.buf.emit_u8(0x41);
        }
        self.buf.emit_u8(0xFF);
        self.modrm_reg(4, reg.number());
    }

    pub fn ret(&mut self) {
        self.buf.emit_u8(0xC3);
    }

    pub fn int3(&mut self) {
        self.buf.emit_u8(0xCC);
    }

    /// `int imm8` — software trap the host translates to a managed exception.
    pub fn int_imm(&mut self, vector: u8) {
        self.buf.emit_u8(0xCD);
        self.buf.emit_u8(vector);
    }

    // ---- string ops ----

    /// `rep movsb` — RCX bytes from [RSI] to [RDI].
    pub fn rep_movsb(&mut self) {
        self.buf.emit_u8(0xF3);
        self.buf.emit_u8(0xA4);
    }

    /// `rep stosb` — AL into RCX bytes at [RDI].
    pub fn rep_stosb(&mut self) {
        self.buf.emit_u8(0xF3);
        self.buf.emit_u8(0xAA);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codebuf::CodeBuffer;

    fn emitted(f: impl FnOnce(&mut Emitter<'_>)) -> Vec<u8> {
        let mut buf = CodeBuffer::new(256).unwrap();
        let mut asm = Emitter::new(&mut buf);
        f(&mut asm);
        buf.code().to_vec()
    }

    #[test]
    fn test_mov_rr() {
        assert_eq!(emitted(|a| a.mov_rr(Reg::Rax, Reg::Rcx)), [0x48, 0x89, 0xC8]);
        assert_eq!(emitted(|a| a.mov_rr(Reg::R8, Reg::Rax)), [0x49, 0x89, 0xC0]);
    }

    #[test]
    fn test_frame_moves() {
        // mov [rbp-8], rax
        assert_eq!(
            emitted(|a| a.store64(Reg::Rbp, -8, Reg::Rax)),
            [0x48, 0x89, 0x45, 0xF8]
        );
        // mov rax, [rbp+16]
        assert_eq!(
            emitted(|a| a.load64(Reg::Rax, Reg::Rbp, 16)),
            [0x48, 0x8B, 0x45, 0x10]
        );
        // rsp base forces a SIB byte: mov rax, [rsp]
        assert_eq!(
            emitted(|a| a.load64(Reg::Rax, Reg::Rsp, 0)),
            [0x48, 0x8B, 0x04, 0x24]
        );
    }

    #[test]
    fn test_disp32_form() {
        // mov rax, [rbp - 0x100]
        assert_eq!(
            emitted(|a| a.load64(Reg::Rax, Reg::Rbp, -0x100)),
            [0x48, 0x8B, 0x85, 0x00, 0xFF, 0xFF, 0xFF]
        );
    }

    #[test]
    fn test_alu() {
        assert_eq!(emitted(|a| a.add_rr(Reg::Rax, Reg::Rdx)), [0x48, 0x01, 0xD0]);
        assert_eq!(emitted(|a| a.add_rr32(Reg::Rax, Reg::Rdx)), [0x01, 0xD0]);
        assert_eq!(emitted(|a| a.sub_ri(Reg::Rsp, 32)), [0x48, 0x83, 0xEC, 0x20]);
        assert_eq!(
            emitted(|a| a.sub_ri(Reg::Rsp, 0x1000)),
            [0x48, 0x81, 0xEC, 0x00, 0x10, 0x00, 0x00]
        );
        assert_eq!(emitted(|a| a.idiv(Reg::Rcx)), [0x48, 0xF7, 0xF9]);
        assert_eq!(emitted(|a| a.cqo()), [0x48, 0x99]);
        assert_eq!(emitted(|a| a.test_rr(Reg::Rax, Reg::Rax)), [0x48, 0x85, 0xC0]);
    }

    #[test]
    fn test_shifts() {
        assert_eq!(emitted(|a| a.shl_cl(Reg::Rax)), [0x48, 0xD3, 0xE0]);
        assert_eq!(emitted(|a| a.sar_imm(Reg::Rax, 63)), [0x48, 0xC1, 0xF8, 0x3F]);
    }

    #[test]
    fn test_sse() {
        // movsd xmm0, [rsp]
        assert_eq!(
            emitted(|a| a.movsd_load(Xmm::Xmm0, Reg::Rsp, 0)),
            [0xF2, 0x0F, 0x10, 0x04, 0x24]
        );
        assert_eq!(
            emitted(|a| a.movq_xr(Xmm::Xmm0, Reg::Rax)),
            [0x66, 0x48, 0x0F, 0x6E, 0xC0]
        );
        assert_eq!(
            emitted(|a| a.movq_rx(Reg::Rax, Xmm::Xmm0)),
            [0x66, 0x48, 0x0F, 0x7E, 0xC0]
        );
        assert_eq!(
            emitted(|a| a.addsd(Xmm::Xmm0, Xmm::Xmm1)),
            [0xF2, 0x0F, 0x58, 0xC1]
        );
        assert_eq!(
            emitted(|a| a.cvttsd2si(Reg::Rax, Xmm::Xmm0, true)),
            [0xF2, 0x48, 0x0F, 0x2C, 0xC0]
        );
        assert_eq!(
            emitted(|a| a.comisd(Xmm::Xmm0, Xmm::Xmm1)),
            [0x66, 0x0F, 0x2F, 0xC1]
        );
    }

    #[test]
    fn test_branches() {
        let code = emitted(|a| {
            let p = a.jcc_placeholder(Cond::E);
            assert_eq!(p, 2);
        });
        assert_eq!(code, [0x0F, 0x84, 0x00, 0x00, 0x00, 0x00]);

        assert_eq!(emitted(|a| a.call_reg(Reg::Rax)), [0xFF, 0xD0]);
        assert_eq!(emitted(|a| a.call_reg(Reg::R10)), [0x41, 0xFF, 0xD2]);
        assert_eq!(emitted(|a| a.jmp_reg(Reg::Rax)), [0xFF, 0xE0]);
        assert_eq!(emitted(|a| a.int_imm(4)), [0xCD, 0x04]);
    }

    #[test]
    fn test_push_pop() {
        assert_eq!(emitted(|a| a.push_reg(Reg::Rbp)), [0x55]);
        assert_eq!(emitted(|a| a.push_reg(Reg::R12)), [0x41, 0x54]);
        assert_eq!(emitted(|a| a.pop_reg(Reg::Rbp)), [0x5D]);
    }

    #[test]
    fn test_setcc() {
        // setl al; movzx rax, al
        assert_eq!(
            emitted(|a| a.setcc_zx(Cond::L, Reg::Rax)),
            [0x40, 0x0F, 0x9C, 0xC0, 0x48, 0x0F, 0xB6, 0xC0]
        );
    }

    #[test]
    fn test_mov_imm() {
        assert_eq!(
            emitted(|a| a.mov_ri64(Reg::Rax, 0x1122334455667788)),
            [0x48, 0xB8, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
        );
        assert_eq!(
            emitted(|a| a.mov_ri32(Reg::Rax, 7)),
            [0xB8, 0x07, 0x00, 0x00, 0x00]
        );
    }
}
