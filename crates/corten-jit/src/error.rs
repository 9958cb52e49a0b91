//! Compilation errors.
//!
//! Every fatal condition a method compilation can hit. The public entry
//! points map these to a `None` result after logging; nothing partial is
//! ever handed out.

/// Error during method compilation
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("Unsupported opcode {byte:#04x} at IL offset {offset}")]
    UnsupportedOpcode { byte: u8, offset: usize },

    #[error("Unsupported 0xFE-prefixed opcode {byte:#04x} at IL offset {offset}")]
    UnsupportedWideOpcode { byte: u8, offset: usize },

    #[error("Operand read past end of IL stream at offset {0}")]
    OperandOverrun(usize),

    #[error("Evaluation stack underflow at IL offset {offset}")]
    StackUnderflow { offset: usize },

    #[error("Method token {token:#010x} failed to resolve")]
    MethodResolution { token: u32 },

    #[error("Type token {token:#010x} failed to resolve")]
    TypeResolution { token: u32 },

    #[error("Field token {token:#010x} failed to resolve")]
    FieldResolution { token: u32 },

    #[error("String token {token:#010x} failed to resolve")]
    StringResolution { token: u32 },

    #[error("Label table capacity exceeded ({0} entries)")]
    LabelOverflow(usize),

    #[error("Branch patch table capacity exceeded ({0} entries)")]
    BranchOverflow(usize),

    #[error("Code buffer overflow (capacity {0} bytes)")]
    CodeOverflow(usize),

    #[error("Branch to IL offset {target} which was never emitted")]
    DanglingBranch { target: usize },

    #[error("Exception clause {0} lies outside the IL stream")]
    MalformedClause(usize),

    #[error("Local index {index} out of range ({count} locals)")]
    LocalOutOfRange { index: usize, count: usize },

    #[error("Argument index {index} out of range ({count} arguments)")]
    ArgOutOfRange { index: usize, count: usize },

    #[error("Value-type temporary of {0} bytes exceeds the frame temp area")]
    TempOverflow(u32),
}
