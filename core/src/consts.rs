//! Crate-wide constants: encoding geometry, register-bank layout and the
//! textual tags used by the operand syntax.

/// Size in bytes of one code word. Instructions are encoded as sequences of
/// 32-bit words.
pub const WORD_SIZE: usize = 4;

/// Number of register classes (char, int, real, point, obj).
pub const NUM_REG_CLASSES: usize = 5;

/// Maximum number of register/pointer arguments an instruction can carry.
pub const MAX_INSTR_ARGS: usize = 2;

/// Maximum nesting depth of `call` before execution is aborted. This is not
/// a strategic restriction, just a guard against runaway recursion taking
/// the host process down with it.
pub const MAX_CALL_DEPTH: usize = 1024;

/// Magic number written in front of every data-segment item, so the segment
/// can be walked and dumped without external bookkeeping.
pub const DATA_ITEM_SIGNATURE: u32 = 0x0BDA_7A0C;

/// The prefix that indicates a global slot in the operand syntax, e.g.
/// `gri2` or `gvi2`.
pub const GLOBAL_TAG: &str = "g";
/// The tag for register (positive) slots, e.g. `ri2`.
pub const REG_TAG: &str = "r";
/// The tag for variable (negative) slots, e.g. `vi2`.
pub const VAR_TAG: &str = "v";
/// The base register of pointer operands, e.g. `i[ro0+8]`.
pub const PTR_BASE: &str = "ro0";
