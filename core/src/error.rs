//! All error-related types for the core.
//!
//! The severity model is: warnings are emitted through [crate::debug] and
//! never affect control flow; recoverable failures are the `Result` errors
//! defined here, and the caller decides whether to keep going; violations of
//! internal invariants panic (the non-returning "fatal handler"). Anything a
//! user program or a misbehaving front end can trigger must be an error, not
//! a panic.

use crate::{
    registers::RegClass,
    util::{self, Span},
};
use serde::Serialize;
use std::fmt::{self, Debug, Display, Formatter};
use thiserror::Error;

/// An error from the slot-reusing allocation pool.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Error, Serialize)]
pub enum PoolError {
    /// Tried to release (or read) a slot that is not occupied
    #[error("slot {0} is not occupied")]
    NotOccupied(usize),
}

/// An error raised while building or querying the type system. Type names
/// are rendered eagerly so the error is self-contained.
#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize)]
pub enum TypeError {
    /// Tried to name a type that already carries a name
    #[error("type `{type_name}` has already been given the name `{existing}`")]
    NameAlreadySet { type_name: String, existing: String },
    /// A subtype was registered twice with structurally different targets
    #[error("cannot redefine subtype `{0}`")]
    SubtypeRedefinition(String),
    /// Two members of the same structure share a name
    #[error("structure `{structure}` already has a member named `{member}`")]
    DuplicateMember { structure: String, member: String },
    /// Asked for the element type of something that isn't an array
    #[error("cannot extract an element of the non-array type `{0}`")]
    NotAnArray(String),
    /// Asked to walk the members of a type that has none
    #[error("type `{0}` is not a structure, species or enum")]
    NotMembered(String),
    /// A comparison that was required to succeed didn't
    #[error("type `{right}` is not compatible with `{left}`")]
    Incompatible { left: String, right: String },
}

/// An error from the register/variable allocator.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Error, Serialize)]
pub enum RegError {
    /// Released a register slot that was never occupied
    #[error("{class} register {index} is not occupied")]
    RegNotOccupied { class: RegClass, index: u32 },
    /// Released a variable slot that was never occupied
    #[error("{class} variable {index} is not occupied")]
    VarNotOccupied { class: RegClass, index: u32 },
}

/// An error from the instruction codec, on either the writing or the
/// reading side.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Error, Serialize)]
pub enum CodeError {
    /// The reader hit an opcode id outside the catalogue. The disassembler
    /// recovers by skipping one word.
    #[error("unknown opcode id {0}")]
    UnknownOpcode(u32),
    /// A short encoding was forced but an operand does not fit 8 signed bits
    #[error("operand {0} does not fit the short instruction format")]
    ShortOperandOverflow(i32),
    /// A short encoding was forced but the total length overflows the
    /// 3-bit length field of the short header
    #[error("instruction of {0} words does not fit the short format")]
    ShortLengthOverflow(usize),
    /// An immediate operand was requested for an opcode whose payload class
    /// cannot be carried in an argument word
    #[error("immediate operands are only legal for char and int opcodes")]
    BadImmediate,
    /// The code region ended in the middle of an instruction
    #[error("truncated instruction at word {0}")]
    Truncated(usize),
}

/// An error from the symbol/procedure table: naming, definition, reference
/// resolution, labels and installation.
#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize)]
pub enum LinkError {
    /// Two symbols may not share a name
    #[error("another symbol already has the name `{0}`")]
    DuplicateName(String),
    /// A symbol may be named at most once
    #[error("symbol `{0}` has already been given a name")]
    AlreadyNamed(String),
    /// A symbol may be defined at most once
    #[error("double definition of the symbol `{0}`")]
    Redefinition(String),
    /// `sym_ref_check` found references that were never resolved
    #[error("unresolved reference to the symbol `{0}`")]
    Unresolved(String),
    /// A symbol with plain (non-code) references has no resolver attached
    #[error("cannot resolve the symbol `{0}`: no resolver is attached")]
    NoResolver(String),
    /// A label was used from a procedure it does not belong to
    #[error("label refers to code outside the current target procedure")]
    ForeignLabel,
    /// A label with pending references cannot be destroyed
    #[error("cannot destroy a label with unresolved references")]
    LabelInUse,
    /// The call number does not name an installed procedure
    #[error("no procedure is installed under call number {0}")]
    BadCallNumber(u32),
    /// `define` targeted a slot that was not reserved with
    /// `install_undefined`
    #[error("call slot {0} cannot be defined")]
    NotUndefined(u32),
    /// Code emission failed while generating a reference
    #[error(transparent)]
    Code(#[from] CodeError),
}

/// An error raised by the VM while executing bytecode. Execution stops at
/// the first error.
#[derive(Clone, Debug, PartialEq, Error, Serialize)]
pub enum ExecError {
    /// `call` targeted a call number with no installed procedure behind it
    #[error("call to the undefined procedure {0}")]
    UndefinedProcedure(u32),
    /// Integer division or remainder by zero
    #[error("division by zero (line {line})")]
    DivideByZero { line: i64 },
    /// Too many nested `call`s
    #[error("maximum call depth exceeded")]
    CallDepthExceeded,
    /// An operand referenced a register outside the allocated window
    #[error("reference to unallocated {class} register {index}")]
    UnallocatedRegister { class: RegClass, index: i32 },
    /// A `new*` prologue instruction ran twice in the same frame
    #[error("{class} registers of this frame are already allocated")]
    AlreadyAllocated { class: RegClass },
    /// An object operation went through an empty object register
    #[error("use of an empty object register (line {line})")]
    NullObject { line: i64 },
    /// An object access fell outside the object it points into
    #[error("object access out of bounds: offset {offset}, length {length}")]
    ObjectBounds { offset: i64, length: usize },
    /// A handle referenced a heap block that is no longer alive
    #[error("dangling object handle {0}")]
    DanglingObject(usize),
    /// `pop` ran against an empty value stack
    #[error("pop from an empty stack")]
    EmptyStack,
    /// A jump left the code region of the executing procedure
    #[error("jump target out of range")]
    JumpOutOfRange,
    /// An address was taken of something that has no address (a register
    /// operand where memory was required)
    #[error("operand has no address")]
    NotAddressable,
    /// A host procedure reported a failure
    #[error("host procedure `{name}` failed: {message}")]
    Host { name: String, message: String },
    /// The code itself could not be decoded
    #[error(transparent)]
    Code(#[from] CodeError),
}

/// A trait for any error that originates in listing source code. These rely
/// on having the source present in order to display themselves.
pub trait SourceError: 'static + Send + Sync + Debug + Serialize {
    /// A simple type label for this error, e.g. `"syntax"`.
    fn type_label(&self) -> &'static str;

    /// Format this error into a simple message. `spanned_src` is the slice
    /// of the source code that corresponds to this error's [Span]. This
    /// needs to be provided by the caller in order to create a proper error
    /// message.
    fn fmt_msg(&self, f: &mut Formatter<'_>, spanned_src: &str) -> fmt::Result;
}

/// An error that occurs while parsing or assembling a listing. The error
/// will be due to a flaw in the listing, not an internal bug; internal bugs
/// always cause a panic.
#[derive(Clone, Debug, Serialize)]
pub enum AsmError {
    /// Failed to parse the listing because of a syntax error. `expected` is
    /// the name of the type of element that was expected where the error
    /// occurred.
    Syntax { expected: &'static str },
    /// The mnemonic does not name any opcode, or names one whose operand
    /// shape does not match the operands given
    UnknownInstruction,
    /// Wrong number of operands for the instruction
    WrongOperandCount { expected: usize },
    /// An immediate operand is not legal in this position
    BadImmediate,
    /// Defined the same label more than once
    DuplicateLabel { original: Span },
    /// Jumped to a label that was never defined in the listing
    UndefinedLabel,
    /// A directive (`%proc`, `%install`, ...) was malformed or misplaced
    BadDirective,
    /// The assembler backend reported a failure (rendered eagerly)
    Backend { message: String },
}

impl SourceError for AsmError {
    fn type_label(&self) -> &'static str {
        match self {
            Self::Syntax { .. } => "Syntax",
            _ => "Assembly",
        }
    }

    fn fmt_msg(&self, f: &mut Formatter<'_>, spanned_src: &str) -> fmt::Result {
        match self {
            // the source span for syntax errors is just the remaining
            // source, so not very helpful
            Self::Syntax { expected } => write!(f, "Expected {}", expected),
            Self::UnknownInstruction => {
                write!(f, "Unknown instruction `{}`", spanned_src)
            }
            Self::WrongOperandCount { expected } => write!(
                f,
                "Wrong number of operands for `{}`, expected {}",
                spanned_src, expected
            ),
            Self::BadImmediate => write!(
                f,
                "Immediate operand `{}` is not legal here",
                spanned_src
            ),
            Self::DuplicateLabel { original } => write!(
                f,
                "Duplicate declaration of label `{}`, originally defined on \
                 line {}",
                spanned_src, original.start_line,
            ),
            Self::UndefinedLabel => {
                write!(f, "Jump to undefined label `{}`", spanned_src)
            }
            Self::BadDirective => {
                write!(f, "Malformed directive `{}`", spanned_src)
            }
            Self::Backend { message } => {
                write!(f, "`{}`: {}", spanned_src, message)
            }
        }
    }
}

/// A wrapper around a [SourceError], that holds some extra data:
/// - The [Span] of the source code that caused the error
/// - The offending chunk of source code itself
///
/// This type on its own can be formatted, without any external data.
#[derive(Clone, Debug, Error, Serialize)]
pub struct SourceErrorWrapper<E: SourceError> {
    error: E,
    span: Span,
    spanned_source: String,
}

impl<E: SourceError> SourceErrorWrapper<E> {
    pub fn new(error: E, span: Span, src: &str) -> Self {
        Self {
            error,
            span,
            spanned_source: span.get_source_slice(src).into(),
        }
    }

    pub fn span(&self) -> Span {
        self.span
    }
}

impl<E: SourceError> Display for SourceErrorWrapper<E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} error at {}:{}: ",
            self.error.type_label(),
            self.span.start_line,
            self.span.start_col,
        )?;
        self.error.fmt_msg(f, &self.spanned_source)?;
        Ok(())
    }
}

/// A wrapper around a collection of errors. This holds the errors as well as
/// the source code, and can be used to render associated source code with
/// each error.
#[derive(Clone, Debug, Error, Serialize)]
pub struct WithSource<E: SourceError> {
    errors: Vec<SourceErrorWrapper<E>>,
    #[serde(skip)]
    source_code: String,
}

impl<E: SourceError> WithSource<E> {
    /// Wrap a collection of errors with its source code.
    pub(crate) fn new(
        errors: impl IntoIterator<Item = SourceErrorWrapper<E>>,
        source: String,
    ) -> Self {
        Self {
            errors: errors.into_iter().collect(),
            source_code: source,
        }
    }

    /// Get a reference to the errors wrapped by this type.
    pub fn errors(&self) -> &[SourceErrorWrapper<E>] {
        &self.errors
    }
}

impl<E: SourceError> Display for WithSource<E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        // Write each error, separated by a newline
        for (i, error) in self.errors.iter().enumerate() {
            // Prefix with a newline for all errors but the first
            if i > 0 {
                writeln!(f)?;
            }

            write!(f, "{}", error)?;
            if f.alternate() {
                util::fmt_src_highlights(f, &error.span, &self.source_code)?;
            }
        }
        Ok(())
    }
}
