//! The opcode catalogue. This table is the single source of truth about
//! every instruction the VM understands: its mnemonic, how many encoded
//! operands it takes, the register class its payload travels in, whether an
//! immediate payload follows the operands, and how the disassembler should
//! render it. Ids are dense, starting at 1; 0 never names an instruction.
//!
//! Mnemonics are not unique: `mov` covers one opcode per register class,
//! the way the operand syntax distinguishes them (`mov ri1, ri2` vs
//! `mov rr1, rr2`).

use crate::registers::RegClass;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Every instruction of the VM, with its encoding id.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive,
)]
#[repr(u8)]
pub enum Op {
    /// Record the current source line for diagnostics
    Line = 1,
    /// Invoke an installed procedure by call number
    Call,
    // Frame prologue: allocate local slots, one instruction per class
    NewC,
    NewI,
    NewR,
    NewP,
    NewO,
    // Moves within one register class
    MovC,
    MovI,
    MovR,
    MovP,
    MovO,
    /// `mov` of a real literal carried as an immediate payload
    MovRImm,
    /// `mov` of a point literal carried as an immediate payload
    MovPImm,
    // Bitwise on int
    BNot,
    BAnd,
    BXor,
    BOr,
    Shl,
    Shr,
    // Increment/decrement
    IncI,
    IncR,
    DecI,
    DecR,
    // Exponentiation
    PowI,
    PowR,
    // Arithmetic
    AddI,
    AddR,
    AddP,
    SubI,
    SubR,
    SubP,
    MulI,
    MulR,
    DivI,
    DivR,
    RemI,
    NegI,
    NegR,
    NegP,
    /// Scale a point by the real scratch register
    PMulR,
    /// Divide a point by the real scratch register
    PDivR,
    // Comparisons, producing int 0/1
    EqI,
    EqR,
    EqP,
    NeI,
    NeR,
    NeP,
    LtI,
    LtR,
    LeI,
    LeR,
    GtI,
    GtR,
    GeI,
    GeR,
    // Logical on int
    LNot,
    LAnd,
    LOr,
    // Coercions; results land in the scratch slot of the result class
    RealC,
    RealI,
    IntgR,
    PointI,
    PointR,
    ProjX,
    ProjY,
    PPtrX,
    PPtrY,
    /// Return from the current procedure
    Ret,
    // Heap management
    Malloc,
    MFree,
    MCopy,
    Link,
    Unlink,
    // Address-of for pointer operands; result lands in the obj scratch
    LeaC,
    LeaI,
    LeaR,
    LeaP,
    LeaO,
    // Object stack
    Push,
    Pop,
    // Control flow: relative displacement in words
    Jmp,
    Jc,
}

/// How the disassembler renders an instruction's operands.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DisasmShape {
    /// Plain operand rendering
    Args,
    /// `call` with an immediate operand also prints the installed name
    Call,
    /// Jumps with an immediate operand print the absolute target offset
    Jump,
}

/// The descriptor of one opcode.
#[derive(Copy, Clone, Debug)]
pub struct OpDesc {
    pub op: Op,
    /// Mnemonic; shared between class variants of the same operation
    pub name: &'static str,
    /// Number of encoded operand slots (0..=2), excluding any payload
    pub num_args: usize,
    /// Register class of the payload values, `None` for `ret`
    pub class: Option<RegClass>,
    /// Does an immediate payload follow the operands?
    pub has_data: bool,
    pub disasm: DisasmShape,
}

const fn desc(
    op: Op,
    name: &'static str,
    num_args: usize,
    class: Option<RegClass>,
    has_data: bool,
    disasm: DisasmShape,
) -> OpDesc {
    OpDesc {
        op,
        name,
        num_args,
        class,
        has_data,
        disasm,
    }
}

use DisasmShape::{Args, Call as DCall, Jump};
use RegClass::{Char, Int, Obj, Point, Real};

/// The catalogue, ordered by opcode id.
pub static OPCODES: [OpDesc; 83] = [
    desc(Op::Line, "line", 1, Some(Int), false, Args),
    desc(Op::Call, "call", 1, Some(Int), false, DCall),
    desc(Op::NewC, "newc", 2, Some(Int), false, Args),
    desc(Op::NewI, "newi", 2, Some(Int), false, Args),
    desc(Op::NewR, "newr", 2, Some(Int), false, Args),
    desc(Op::NewP, "newp", 2, Some(Int), false, Args),
    desc(Op::NewO, "newo", 2, Some(Int), false, Args),
    desc(Op::MovC, "mov", 2, Some(Char), false, Args),
    desc(Op::MovI, "mov", 2, Some(Int), false, Args),
    desc(Op::MovR, "mov", 2, Some(Real), false, Args),
    desc(Op::MovP, "mov", 2, Some(Point), false, Args),
    desc(Op::MovO, "mov", 2, Some(Obj), false, Args),
    desc(Op::MovRImm, "mov", 1, Some(Real), true, Args),
    desc(Op::MovPImm, "mov", 1, Some(Point), true, Args),
    desc(Op::BNot, "bnot", 1, Some(Int), false, Args),
    desc(Op::BAnd, "band", 2, Some(Int), false, Args),
    desc(Op::BXor, "bxor", 2, Some(Int), false, Args),
    desc(Op::BOr, "bor", 2, Some(Int), false, Args),
    desc(Op::Shl, "shl", 2, Some(Int), false, Args),
    desc(Op::Shr, "shr", 2, Some(Int), false, Args),
    desc(Op::IncI, "inc", 1, Some(Int), false, Args),
    desc(Op::IncR, "inc", 1, Some(Real), false, Args),
    desc(Op::DecI, "dec", 1, Some(Int), false, Args),
    desc(Op::DecR, "dec", 1, Some(Real), false, Args),
    desc(Op::PowI, "pow", 2, Some(Int), false, Args),
    desc(Op::PowR, "pow", 2, Some(Real), false, Args),
    desc(Op::AddI, "add", 2, Some(Int), false, Args),
    desc(Op::AddR, "add", 2, Some(Real), false, Args),
    desc(Op::AddP, "add", 2, Some(Point), false, Args),
    desc(Op::SubI, "sub", 2, Some(Int), false, Args),
    desc(Op::SubR, "sub", 2, Some(Real), false, Args),
    desc(Op::SubP, "sub", 2, Some(Point), false, Args),
    desc(Op::MulI, "mul", 2, Some(Int), false, Args),
    desc(Op::MulR, "mul", 2, Some(Real), false, Args),
    desc(Op::DivI, "div", 2, Some(Int), false, Args),
    desc(Op::DivR, "div", 2, Some(Real), false, Args),
    desc(Op::RemI, "rem", 2, Some(Int), false, Args),
    desc(Op::NegI, "neg", 1, Some(Int), false, Args),
    desc(Op::NegR, "neg", 1, Some(Real), false, Args),
    desc(Op::NegP, "neg", 1, Some(Point), false, Args),
    desc(Op::PMulR, "pmulr", 1, Some(Point), false, Args),
    desc(Op::PDivR, "pdivr", 1, Some(Point), false, Args),
    desc(Op::EqI, "eq?", 2, Some(Int), false, Args),
    desc(Op::EqR, "eq?", 2, Some(Real), false, Args),
    desc(Op::EqP, "eq?", 2, Some(Point), false, Args),
    desc(Op::NeI, "ne?", 2, Some(Int), false, Args),
    desc(Op::NeR, "ne?", 2, Some(Real), false, Args),
    desc(Op::NeP, "ne?", 2, Some(Point), false, Args),
    desc(Op::LtI, "lt?", 2, Some(Int), false, Args),
    desc(Op::LtR, "lt?", 2, Some(Real), false, Args),
    desc(Op::LeI, "le?", 2, Some(Int), false, Args),
    desc(Op::LeR, "le?", 2, Some(Real), false, Args),
    desc(Op::GtI, "gt?", 2, Some(Int), false, Args),
    desc(Op::GtR, "gt?", 2, Some(Real), false, Args),
    desc(Op::GeI, "ge?", 2, Some(Int), false, Args),
    desc(Op::GeR, "ge?", 2, Some(Real), false, Args),
    desc(Op::LNot, "lnot", 1, Some(Int), false, Args),
    desc(Op::LAnd, "land", 2, Some(Int), false, Args),
    desc(Op::LOr, "lor", 2, Some(Int), false, Args),
    desc(Op::RealC, "real", 1, Some(Char), false, Args),
    desc(Op::RealI, "real", 1, Some(Int), false, Args),
    desc(Op::IntgR, "intg", 1, Some(Real), false, Args),
    desc(Op::PointI, "point", 2, Some(Int), false, Args),
    desc(Op::PointR, "point", 2, Some(Real), false, Args),
    desc(Op::ProjX, "projx", 1, Some(Point), false, Args),
    desc(Op::ProjY, "projy", 1, Some(Point), false, Args),
    desc(Op::PPtrX, "pptrx", 1, Some(Point), false, Args),
    desc(Op::PPtrY, "pptry", 1, Some(Point), false, Args),
    desc(Op::Ret, "ret", 0, None, false, Args),
    desc(Op::Malloc, "malloc", 2, Some(Int), false, Args),
    desc(Op::MFree, "mfree", 1, Some(Obj), false, Args),
    desc(Op::MCopy, "mcopy", 2, Some(Obj), false, Args),
    desc(Op::Link, "link", 1, Some(Obj), false, Args),
    desc(Op::Unlink, "unlink", 1, Some(Obj), false, Args),
    desc(Op::LeaC, "lea", 1, Some(Char), false, Args),
    desc(Op::LeaI, "lea", 1, Some(Int), false, Args),
    desc(Op::LeaR, "lea", 1, Some(Real), false, Args),
    desc(Op::LeaP, "lea", 1, Some(Point), false, Args),
    desc(Op::LeaO, "lea", 2, Some(Obj), false, Args),
    desc(Op::Push, "push", 1, Some(Obj), false, Args),
    desc(Op::Pop, "pop", 1, Some(Obj), false, Args),
    desc(Op::Jmp, "jmp", 1, Some(Int), false, Jump),
    desc(Op::Jc, "jc", 1, Some(Int), false, Jump),
];

impl Op {
    /// Look up this opcode's catalogue entry.
    pub fn desc(self) -> &'static OpDesc {
        &OPCODES[(u8::from(self) - 1) as usize]
    }

    pub fn name(self) -> &'static str {
        self.desc().name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::TryFrom;

    #[test]
    fn test_catalogue_ids_are_dense() {
        for (i, desc) in OPCODES.iter().enumerate() {
            assert_eq!(
                u8::from(desc.op) as usize,
                i + 1,
                "catalogue out of order at `{}`",
                desc.name
            );
        }
        // 0 and out-of-range ids never decode
        assert!(Op::try_from(0u8).is_err());
        assert!(Op::try_from(OPCODES.len() as u8 + 1).is_err());
    }

    #[test]
    fn test_desc_lookup() {
        assert_eq!(Op::AddI.desc().name, "add");
        assert_eq!(Op::AddI.desc().num_args, 2);
        assert_eq!(Op::AddI.desc().class, Some(RegClass::Int));
        assert_eq!(Op::Ret.desc().num_args, 0);
        assert_eq!(Op::Ret.desc().class, None);
        assert!(Op::MovRImm.desc().has_data);
        assert_eq!(Op::Jc.desc().disasm, DisasmShape::Jump);
        assert_eq!(Op::Call.desc().disasm, DisasmShape::Call);
    }
}
