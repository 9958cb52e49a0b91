//! Register conventions for the baseline JIT on x86-64.
//!
//! The managed calling convention is Microsoft x64: integer arguments in
//! RCX, RDX, R8, R9 (floats in XMM0..XMM3), 32 bytes of shadow space below
//! every call, return in RAX / XMM0.

/// General-purpose register, numbered by hardware encoding.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg {
    #[inline]
    pub fn number(self) -> u8 {
        self as u8
    }

    /// True for R8..R15 (encodings that need a REX extension bit).
    #[inline]
    pub fn is_extended(self) -> bool {
        self.number() >= 8
    }

    #[inline]
    pub fn low3(self) -> u8 {
        self.number() & 7
    }
}

/// SSE register.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Xmm {
    Xmm0 = 0,
    Xmm1 = 1,
    Xmm2 = 2,
    Xmm3 = 3,
    Xmm4 = 4,
    Xmm5 = 5,
}

impl Xmm {
    #[inline]
    pub fn number(self) -> u8 {
        self as u8
    }

    #[inline]
    pub fn low3(self) -> u8 {
        self.number() & 7
    }
}

/// Condition codes, numbered by the `Jcc`/`SETcc` encoding nibble.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    O = 0x0,
    No = 0x1,
    B = 0x2,
    Ae = 0x3,
    E = 0x4,
    Ne = 0x5,
    Be = 0x6,
    A = 0x7,
    S = 0x8,
    Ns = 0x9,
    P = 0xA,
    Np = 0xB,
    L = 0xC,
    Ge = 0xD,
    Le = 0xE,
    G = 0xF,
}

impl Cond {
    /// The inverse condition (E <-> NE, L <-> GE, ...).
    pub fn negate(self) -> Cond {
        match self {
            Cond::O => Cond::No,
            Cond::No => Cond::O,
            Cond::B => Cond::Ae,
            Cond::Ae => Cond::B,
            Cond::E => Cond::Ne,
            Cond::Ne => Cond::E,
            Cond::Be => Cond::A,
            Cond::A => Cond::Be,
            Cond::S => Cond::Ns,
            Cond::Ns => Cond::S,
            Cond::P => Cond::Np,
            Cond::Np => Cond::P,
            Cond::L => Cond::Ge,
            Cond::Ge => Cond::L,
            Cond::Le => Cond::G,
            Cond::G => Cond::Le,
        }
    }

    /// Map a signed ordering condition to its unsigned counterpart.
    ///
    /// `comiss`/`comisd` report through CF/ZF, so float compares reuse the
    /// below/above family even for semantically signed orderings.
    pub fn unsigned(self) -> Cond {
        match self {
            Cond::L => Cond::B,
            Cond::Ge => Cond::Ae,
            Cond::Le => Cond::Be,
            Cond::G => Cond::A,
            other => other,
        }
    }
}

/// Fixed virtual-to-physical mapping used throughout the compiler.
///
/// R0 doubles as the return register, R1..R4 are the Win64 argument
/// registers, R5/R6 are caller-saved scratch that survives no call, and
/// R7..R11 are callee-saved temporaries for values that must live across
/// helper calls.
pub const R0: Reg = Reg::Rax;
pub const R1: Reg = Reg::Rcx;
pub const R2: Reg = Reg::Rdx;
pub const R3: Reg = Reg::R8;
pub const R4: Reg = Reg::R9;
pub const R5: Reg = Reg::R10;
pub const R6: Reg = Reg::R11;
pub const R7: Reg = Reg::Rbx;
pub const R8V: Reg = Reg::R12;
pub const R9V: Reg = Reg::R13;
pub const R10V: Reg = Reg::R14;
pub const R11V: Reg = Reg::R15;
pub const SP: Reg = Reg::Rsp;
pub const FP: Reg = Reg::Rbp;

/// Win64 integer argument registers, in order.
pub const ARG_REGS: [Reg; 4] = [R1, R2, R3, R4];

/// Win64 float argument registers, in order.
pub const ARG_XMM: [Xmm; 4] = [Xmm::Xmm0, Xmm::Xmm1, Xmm::Xmm2, Xmm::Xmm3];
