//! Typed model of the CIL evaluation stack.
//!
//! The compiler simulates the IL operand stack and keeps its physical image
//! on the machine stack: every tracked entry corresponds to `byte_size`
//! bytes that RSP has been grown past the frame's fixed area. The tracker
//! never emits code by itself except through the paired helpers below, so
//! the invariant "tracked bytes == RSP growth" holds at every IL boundary.
//!
//! A value type is ONE logical entry whatever its size; `byte_size` carries
//! the physical footprint (8-aligned up to 8 bytes, 16-aligned above that,
//! matching the return-buffer convention).

use crate::codebuf::CodeBuffer;
use crate::emit::regs::{self, Reg};
use crate::emit::Emitter;

/// Semantic kind of one evaluation-stack slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackKind {
    Unknown,
    Int32,
    Int64,
    NativeInt,
    Float32,
    Float64,
    ObjectRef,
    ManagedPtr,
    UnmanagedPtr,
    ValueType,
}

impl StackKind {
    /// Whether 32-bit instruction forms apply to a pair of operands.
    pub fn is_int32_like(self) -> bool {
        matches!(self, StackKind::Int32 | StackKind::Unknown)
    }

    pub fn is_float(self) -> bool {
        matches!(self, StackKind::Float32 | StackKind::Float64)
    }

    pub fn is_pointer_like(self) -> bool {
        matches!(
            self,
            StackKind::NativeInt | StackKind::ObjectRef | StackKind::ManagedPtr | StackKind::UnmanagedPtr
        )
    }
}

/// One tracked evaluation-stack entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvalStackEntry {
    pub kind: StackKind,
    /// Semantic width in bytes (4 for Int32, declared size for value types).
    pub raw_size: u32,
    /// Physical bytes on the machine stack; >= raw_size, multiple of 8.
    pub byte_size: u32,
}

impl EvalStackEntry {
    /// A single-slot scalar entry of the given kind.
    pub fn scalar(kind: StackKind) -> EvalStackEntry {
        let raw_size = match kind {
            StackKind::Int32 | StackKind::Float32 => 4,
            _ => 8,
        };
        EvalStackEntry { kind, raw_size, byte_size: 8 }
    }

    /// A value-type entry of the given declared size.
    pub fn value_type(size: u32) -> EvalStackEntry {
        EvalStackEntry {
            kind: StackKind::ValueType,
            raw_size: size,
            byte_size: value_type_footprint(size),
        }
    }
}

/// Physical bytes a value type of `size` occupies on the evaluation stack.
pub fn value_type_footprint(size: u32) -> u32 {
    if size <= 8 {
        8
    } else {
        (size + 15) & !15
    }
}

/// The evaluation-stack tracker.
#[derive(Default)]
pub struct EvalStack {
    entries: Vec<EvalStackEntry>,
    total_bytes: u32,
}

impl EvalStack {
    pub fn new() -> EvalStack {
        EvalStack { entries: Vec::new(), total_bytes: 0 }
    }

    pub fn depth(&self) -> usize {
        self.entries.len()
    }

    /// Total physical bytes the stack occupies below the fixed frame area.
    pub fn total_bytes(&self) -> u32 {
        self.total_bytes
    }

    /// Track a pushed entry. Emits nothing.
    pub fn push(&mut self, entry: EvalStackEntry) {
        self.total_bytes += entry.byte_size;
        self.entries.push(entry);
    }

    /// Untrack the top entry. Emits nothing.
    pub fn pop(&mut self) -> Option<EvalStackEntry> {
        let entry = self.entries.pop()?;
        self.total_bytes -= entry.byte_size;
        Some(entry)
    }

    /// The `n`-th entry from the top (0 is the top).
    pub fn peek(&self, n: usize) -> Option<&EvalStackEntry> {
        self.entries.iter().rev().nth(n)
    }

    /// Physical offset from RSP to the start of the `n`-th entry from the top.
    pub fn peek_rsp_offset(&self, n: usize) -> i32 {
        self.entries
            .iter()
            .rev()
            .take(n)
            .map(|e| e.byte_size as i32)
            .sum()
    }

    /// Snapshot for branch-target bookkeeping.
    pub fn snapshot(&self) -> Vec<EvalStackEntry> {
        self.entries.clone()
    }

    /// Restore a snapshot (used at branch targets after dead fall-through).
    pub fn restore(&mut self, snapshot: &[EvalStackEntry]) {
        self.entries.clear();
        self.entries.extend_from_slice(snapshot);
        self.total_bytes = snapshot.iter().map(|e| e.byte_size).sum();
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.total_bytes = 0;
    }

    // ---- paired code-emitting helpers ----

    /// `push reg` and track a scalar entry of `kind`.
    pub fn push_reg(&mut self, buf: &mut CodeBuffer, reg: Reg, kind: StackKind) {
        Emitter::new(buf).push_reg(reg);
        self.push(EvalStackEntry::scalar(kind));
    }

    /// `push rax` and track a scalar entry of `kind`.
    pub fn push_reg_r0(&mut self, buf: &mut CodeBuffer, kind: StackKind) {
        self.push_reg(buf, regs::R0, kind);
    }

    /// `pop reg` and untrack the top entry, which must be single-slot.
    pub fn pop_to_reg(&mut self, buf: &mut CodeBuffer, reg: Reg) -> Option<EvalStackEntry> {
        let entry = self.pop()?;
        debug_assert_eq!(entry.byte_size, 8, "multi-slot entry popped into a register");
        Emitter::new(buf).pop_reg(reg);
        Some(entry)
    }

    /// `pop rax` and untrack the top entry.
    pub fn pop_to_r0(&mut self, buf: &mut CodeBuffer) -> Option<EvalStackEntry> {
        self.pop_to_reg(buf, regs::R0)
    }

    /// Discard the top entry, releasing its physical bytes.
    pub fn pop_discard(&mut self, buf: &mut CodeBuffer) -> Option<EvalStackEntry> {
        let entry = self.pop()?;
        Emitter::new(buf).add_ri(regs::SP, entry.byte_size as i32);
        Some(entry)
    }

    /// Grow the stack by one value-type entry of `size` declared bytes and
    /// copy the value from `[src_reg + src_disp]`. Clobbers R0.
    pub fn push_value_from(
        &mut self,
        buf: &mut CodeBuffer,
        src_reg: Reg,
        src_disp: i32,
        size: u32,
    ) {
        debug_assert!(src_reg != regs::R0, "copy scratch would clobber the source base");
        let entry = EvalStackEntry::value_type(size);
        let mut asm = Emitter::new(buf);
        asm.sub_ri(regs::SP, entry.byte_size as i32);
        copy_block(&mut asm, regs::SP, 0, src_reg, src_disp, size);
        self.push(entry);
    }

    /// Copy the top value-type entry to `[dst_reg + dst_disp]` and discard
    /// it. Clobbers R0.
    pub fn pop_value_to(
        &mut self,
        buf: &mut CodeBuffer,
        dst_reg: Reg,
        dst_disp: i32,
    ) -> Option<EvalStackEntry> {
        debug_assert!(dst_reg != regs::R0, "copy scratch would clobber the destination base");
        let entry = self.pop()?;
        let mut asm = Emitter::new(buf);
        copy_block(&mut asm, dst_reg, dst_disp, regs::SP, 0, entry.raw_size);
        asm.add_ri(regs::SP, entry.byte_size as i32);
        Some(entry)
    }
}

/// Copy `size` bytes between two memory operands, 8 bytes at a time with
/// 4/2/1-byte tails, through R0. The operands must not overlap.
pub fn copy_block(
    asm: &mut Emitter<'_>,
    dst_reg: Reg,
    dst_disp: i32,
    src_reg: Reg,
    src_disp: i32,
    size: u32,
) {
    let mut off: i32 = 0;
    let mut left = size;
    while left >= 8 {
        asm.load64(regs::R0, src_reg, src_disp + off);
        asm.store64(dst_reg, dst_disp + off, regs::R0);
        off += 8;
        left -= 8;
    }
    if left >= 4 {
        asm.load32_zx(regs::R0, src_reg, src_disp + off);
        asm.store32(dst_reg, dst_disp + off, regs::R0);
        off += 4;
        left -= 4;
    }
    if left >= 2 {
        asm.load16_zx(regs::R0, src_reg, src_disp + off);
        asm.store16(dst_reg, dst_disp + off, regs::R0);
        off += 2;
        left -= 2;
    }
    if left >= 1 {
        asm.load8_zx(regs::R0, src_reg, src_disp + off);
        asm.store8(dst_reg, dst_disp + off, regs::R0);
    }
}

/// Zero `size` bytes at `[dst_reg + dst_disp]` through R0.
pub fn zero_block(asm: &mut Emitter<'_>, dst_reg: Reg, dst_disp: i32, size: u32) {
    asm.xor_rr32(regs::R0, regs::R0);
    let mut off: i32 = 0;
    let mut left = size;
    while left >= 8 {
        asm.store64(dst_reg, dst_disp + off, regs::R0);
        off += 8;
        left -= 8;
    }
    if left >= 4 {
        asm.store32(dst_reg, dst_disp + off, regs::R0);
        off += 4;
        left -= 4;
    }
    if left >= 2 {
        asm.store16(dst_reg, dst_disp + off, regs::R0);
        off += 2;
        left -= 2;
    }
    if left >= 1 {
        asm.store8(dst_reg, dst_disp + off, regs::R0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_sizes() {
        let e = EvalStackEntry::scalar(StackKind::Int32);
        assert_eq!((e.raw_size, e.byte_size), (4, 8));
        let e = EvalStackEntry::scalar(StackKind::Float64);
        assert_eq!((e.raw_size, e.byte_size), (8, 8));
    }

    #[test]
    fn test_value_type_footprint() {
        assert_eq!(value_type_footprint(1), 8);
        assert_eq!(value_type_footprint(8), 8);
        assert_eq!(value_type_footprint(9), 16);
        assert_eq!(value_type_footprint(16), 16);
        assert_eq!(value_type_footprint(24), 32);
    }

    #[test]
    fn test_rsp_offsets() {
        let mut stack = EvalStack::new();
        stack.push(EvalStackEntry::scalar(StackKind::Int32));
        stack.push(EvalStackEntry::value_type(24));
        stack.push(EvalStackEntry::scalar(StackKind::Int64));
        assert_eq!(stack.total_bytes(), 8 + 32 + 8);
        assert_eq!(stack.peek_rsp_offset(0), 0);
        assert_eq!(stack.peek_rsp_offset(1), 8);
        assert_eq!(stack.peek_rsp_offset(2), 40);
        assert_eq!(stack.peek(1).unwrap().kind, StackKind::ValueType);
    }

    #[test]
    fn test_snapshot_restore() {
        let mut stack = EvalStack::new();
        stack.push(EvalStackEntry::scalar(StackKind::Int32));
        let snap = stack.snapshot();
        stack.push(EvalStackEntry::scalar(StackKind::ObjectRef));
        stack.restore(&snap);
        assert_eq!(stack.depth(), 1);
        assert_eq!(stack.total_bytes(), 8);
    }

    #[test]
    fn test_paired_push_pop_track_bytes() {
        let mut buf = crate::codebuf::CodeBuffer::new(64).unwrap();
        let mut stack = EvalStack::new();
        stack.push_reg_r0(&mut buf, StackKind::Int32);
        assert_eq!(stack.total_bytes(), 8);
        assert_eq!(buf.code(), &[0x50]); // push rax
        let e = stack.pop_to_r0(&mut buf).unwrap();
        assert_eq!(e.kind, StackKind::Int32);
        assert_eq!(stack.total_bytes(), 0);
        assert_eq!(buf.code(), &[0x50, 0x58]); // push rax; pop rax
    }
}
