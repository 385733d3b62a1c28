//! Core implementation of the Box virtual machine: the type system of the
//! language, the register/variable allocator the front end drives, the
//! dual-format instruction codec, the symbol/linker and procedure tables
//! that resolve forward references, and the register-based execution loop.
//! An assembly-listing front end ties them together so programs can be
//! written, linked, disassembled and executed end to end.
//!
//! ```
//! use boxvm::{assemble_listing, RegClass, RegCounts, Value, Vm};
//!
//! let mut vm = Vm::new();
//!
//! // Give the program a few global int registers to work with
//! let mut counts = RegCounts::default();
//! counts.num_reg[RegClass::Int.index()] = 2;
//! vm.globals_alloc(&counts);
//!
//! // Assemble, link and run
//! let main = assemble_listing(
//!     &mut vm,
//!     "mov gri1, 40
//!      add gri1, 2",
//! )
//! .unwrap();
//! vm.execute(main).unwrap();
//! assert_eq!(vm.global_get(RegClass::Int, 1).unwrap(), Value::Int(42));
//! ```

#![deny(clippy::all)]

pub mod assemble;
mod consts;
pub mod error;
pub mod instr;
mod machine;
pub mod opcode;
pub mod parse;
mod pool;
mod proc;
mod registers;
mod symbol;
pub mod typesys;
mod util;

pub use assemble::{assemble_listing, assemble_listing_as};
pub use consts::{MAX_CALL_DEPTH, NUM_REG_CLASSES, WORD_SIZE};
pub use instr::{ArgMode, Format, Instr, Word};
pub use machine::{ExecStats, ObjVal, Point, Value, Vm};
pub use opcode::{Op, OpDesc, OPCODES};
pub use pool::Pool;
pub use proc::{CallNum, HostFn, ProcBody, ProcId};
pub use registers::{RegAlloc, RegClass, RegCounts};
pub use symbol::{LabelId, RefStatus, SymId, SymKind, SymTable};
pub use typesys::{Cmp, ProcKind, ResolveSet, Type, TypeSystem};
pub use util::Span;
