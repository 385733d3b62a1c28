//! The instruction codec: writing and reading single VM instructions in
//! their dual short/long encoding, plus the operand text rendering the
//! disassembler builds on.
//!
//! The encoding unit is a 32-bit word. The short form packs the whole
//! instruction into one header word (operands as signed bytes); the long
//! form spends a second header word on the opcode and a full word per
//! operand. Either form may be followed by an immediate payload, packed
//! little-endian and zero-padded to word alignment:
//!
//! ```text
//! short  w0: [a2: 8][a1: 8][opcode: 8][len: 3][modes: 4][0]
//! long   w0: [len: 27][modes: 4][1]   w1: opcode
//!        w2..: one word per operand, then payload words
//! ```
//!
//! `len` counts words including the header, so the reader can always skip
//! an instruction it cannot interpret.

use crate::{
    consts::{GLOBAL_TAG, PTR_BASE, REG_TAG, VAR_TAG, WORD_SIZE},
    error::CodeError,
    opcode::Op,
    registers::RegClass,
};
use byteorder::{ByteOrder, LittleEndian};
use serde::Serialize;
use std::convert::TryFrom;

/// One unit of encoded code.
pub type Word = u32;

/// Maximum instruction length (in words) representable in the short form's
/// 3-bit length field.
pub const SHORT_MAX_WORDS: usize = 7;

/// The addressing mode of one operand, two bits in the header nibble.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum ArgMode {
    /// A global register (negative numbers are global variables)
    GlobalReg = 0,
    /// A local register (negative numbers are local variables)
    LocalReg = 1,
    /// Memory at `ro0 + displacement`
    Ptr = 2,
    /// An immediate value in the operand word itself; only meaningful when
    /// the opcode's payload class is char or int
    Imm = 3,
}

impl ArgMode {
    fn from_bits(bits: u32) -> Self {
        match bits & 0x3 {
            0 => ArgMode::GlobalReg,
            1 => ArgMode::LocalReg,
            2 => ArgMode::Ptr,
            _ => ArgMode::Imm,
        }
    }
}

/// The encoding format of an instruction.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub enum Format {
    /// Let the writer pick the smallest encoding that fits
    Undecided,
    Short,
    Long,
}

impl Default for Format {
    fn default() -> Self {
        Format::Undecided
    }
}

/// One instruction, in builder form: what the writer consumes and the
/// reader produces. Payload bytes must be word-aligned (the typed
/// constructors guarantee it).
#[derive(Clone, Debug, PartialEq)]
pub struct Instr {
    pub op: Op,
    pub format: Format,
    pub num_args: usize,
    pub arg_modes: [ArgMode; 2],
    pub args: [i32; 2],
    /// Immediate payload, little-endian
    pub data: Vec<u8>,
}

impl Instr {
    pub fn new(op: Op) -> Self {
        Self {
            op,
            format: Format::Undecided,
            num_args: 0,
            arg_modes: [ArgMode::GlobalReg; 2],
            args: [0; 2],
            data: Vec::new(),
        }
    }

    /// Append an operand.
    pub fn arg(mut self, mode: ArgMode, value: i32) -> Self {
        assert!(self.num_args < 2, "an instruction takes at most 2 operands");
        self.arg_modes[self.num_args] = mode;
        self.args[self.num_args] = value;
        self.num_args += 1;
        self
    }

    /// Attach a real immediate payload.
    pub fn real(mut self, value: f64) -> Self {
        let mut bytes = [0u8; 8];
        LittleEndian::write_f64(&mut bytes, value);
        self.data = bytes.to_vec();
        self
    }

    /// Attach a point immediate payload.
    pub fn point(mut self, x: f64, y: f64) -> Self {
        let mut bytes = [0u8; 16];
        LittleEndian::write_f64(&mut bytes[..8], x);
        LittleEndian::write_f64(&mut bytes[8..], y);
        self.data = bytes.to_vec();
        self
    }

    /// Request a specific encoding format.
    pub fn format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    /// Read the payload back as a real.
    pub fn data_real(&self) -> Option<f64> {
        if self.data.len() == 8 {
            Some(LittleEndian::read_f64(&self.data))
        } else {
            None
        }
    }

    /// Read the payload back as a point.
    pub fn data_point(&self) -> Option<(f64, f64)> {
        if self.data.len() == 16 {
            Some((
                LittleEndian::read_f64(&self.data[..8]),
                LittleEndian::read_f64(&self.data[8..]),
            ))
        } else {
            None
        }
    }

    /// Number of payload words once padded to word alignment.
    fn data_words(&self) -> usize {
        (self.data.len() + WORD_SIZE - 1) / WORD_SIZE
    }

    /// Encoded size in words, for a given resolved format.
    fn encoded_words(&self, short: bool) -> usize {
        if short {
            1 + self.data_words()
        } else {
            2 + self.num_args + self.data_words()
        }
    }

    /// Encode this instruction onto the end of `code`. Returns the number
    /// of words written. With `Format::Undecided` the smallest encoding
    /// that fits is chosen (unless `force_long` is set); an operand that
    /// overflows the short operand byte silently promotes the instruction
    /// to long form. Explicitly requesting a short encoding that does not
    /// fit is an error.
    pub fn write(
        &self,
        code: &mut Vec<Word>,
        force_long: bool,
    ) -> Result<usize, CodeError> {
        let desc = self.op.desc();
        assert_eq!(
            self.num_args, desc.num_args,
            "operand count mismatch for `{}`",
            desc.name
        );
        for i in 0..self.num_args {
            if self.arg_modes[i] == ArgMode::Imm
                && !matches!(
                    desc.class,
                    Some(RegClass::Char) | Some(RegClass::Int)
                )
            {
                return Err(CodeError::BadImmediate);
            }
        }

        let args = &self.args[..self.num_args];
        let fits_short = args.iter().all(|&a| (-128..=127).contains(&a));
        let short = match self.format {
            Format::Long => false,
            Format::Short => {
                if let Some(&arg) =
                    args.iter().find(|&&a| !(-128..=127).contains(&a))
                {
                    return Err(CodeError::ShortOperandOverflow(arg));
                }
                let words = self.encoded_words(true);
                if words > SHORT_MAX_WORDS {
                    return Err(CodeError::ShortLengthOverflow(words));
                }
                true
            }
            Format::Undecided => {
                !force_long
                    && fits_short
                    && self.data.is_empty()
                    && self.encoded_words(true) <= SHORT_MAX_WORDS
            }
        };

        let nibble = (self.arg_modes[0] as u32) | ((self.arg_modes[1] as u32) << 2);
        let words = self.encoded_words(short);
        if short {
            let mut w = (u32::from(u8::from(self.op)) << 3
                | (words as u32 & 0x7))
                << 4
                | (nibble & 0xf);
            w <<= 1; // format bit 0: short
            w |= ((self.args[0] as u32) & 0xff) << 16;
            w |= ((self.args[1] as u32) & 0xff) << 24;
            code.push(w);
        } else {
            let mut w = ((words as u32) & 0x07ff_ffff) << 4 | (nibble & 0xf);
            w = w << 1 | 1; // format bit 0: long
            code.push(w);
            code.push(u32::from(u8::from(self.op)));
            for &arg in args {
                code.push(arg as u32);
            }
        }
        for chunk in self.data.chunks(WORD_SIZE) {
            let mut padded = [0u8; WORD_SIZE];
            padded[..chunk.len()].copy_from_slice(chunk);
            code.push(LittleEndian::read_u32(&padded));
        }
        Ok(words)
    }
}

/// The result of decoding one instruction.
#[derive(Clone, Debug, PartialEq)]
pub struct Decoded {
    pub instr: Instr,
    /// Total size in words, header included. On a decode error the caller
    /// should skip one word and retry.
    pub words: usize,
}

/// Decode the instruction starting at word `pos` of `code`. This is the
/// exact inverse of [Instr::write]: short-form operand bytes are recovered
/// with an explicit signed conversion rather than relying on the platform's
/// integer semantics.
pub fn read(code: &[Word], pos: usize) -> Result<Decoded, CodeError> {
    let w0 = *code.get(pos).ok_or(CodeError::Truncated(pos))?;
    let is_long = w0 & 1 == 1;
    let rest = w0 >> 1;
    let nibble = rest & 0xf;

    let (op_id, words, mut next) = if is_long {
        let words = (rest >> 4) as usize;
        let op_word = *code.get(pos + 1).ok_or(CodeError::Truncated(pos + 1))?;
        (op_word, words, pos + 2)
    } else {
        let words = ((rest >> 4) & 0x7) as usize;
        ((rest >> 7) & 0xff, words, pos + 1)
    };

    let op = u8::try_from(op_id)
        .ok()
        .and_then(|id| Op::try_from(id).ok())
        .ok_or(CodeError::UnknownOpcode(op_id))?;
    let desc = op.desc();

    if words == 0 || pos + words > code.len() {
        return Err(CodeError::Truncated(pos));
    }

    let arg_modes = [
        ArgMode::from_bits(nibble),
        ArgMode::from_bits(nibble >> 2),
    ];
    let mut args = [0i32; 2];
    if is_long {
        for arg in args.iter_mut().take(desc.num_args) {
            let word = *code.get(next).ok_or(CodeError::Truncated(next))?;
            *arg = word as i32;
            next += 1;
        }
    } else {
        // Operand bytes are signed even though we read them unsigned
        if desc.num_args >= 1 {
            args[0] = ((w0 >> 16) & 0xff) as u8 as i8 as i32;
        }
        if desc.num_args >= 2 {
            args[1] = ((w0 >> 24) & 0xff) as u8 as i8 as i32;
        }
    }

    let header_words = if is_long { 2 + desc.num_args } else { 1 };
    if words < header_words {
        return Err(CodeError::Truncated(pos));
    }
    let mut data = Vec::with_capacity((words - header_words) * WORD_SIZE);
    for i in next..pos + words {
        let mut bytes = [0u8; WORD_SIZE];
        LittleEndian::write_u32(&mut bytes, code[i]);
        data.extend_from_slice(&bytes);
    }

    Ok(Decoded {
        instr: Instr {
            op,
            format: if is_long { Format::Long } else { Format::Short },
            num_args: desc.num_args,
            arg_modes,
            args,
            data,
        },
        words,
    })
}

/// Render one operand in the disassembly syntax: `grT<n>`/`gvT<n>` for
/// globals, `rT<n>`/`vT<n>` for locals, `T[ro0+k]` for pointers and a bare
/// literal for immediates.
pub fn format_operand(
    mode: ArgMode,
    value: i32,
    class: Option<RegClass>,
) -> String {
    let tag = class.map(RegClass::tag).unwrap_or('?');
    match mode {
        ArgMode::GlobalReg => {
            if value < 0 {
                format!("{}{}{}{}", GLOBAL_TAG, VAR_TAG, tag, -i64::from(value))
            } else {
                format!("{}{}{}{}", GLOBAL_TAG, REG_TAG, tag, value)
            }
        }
        ArgMode::LocalReg => {
            if value < 0 {
                format!("{}{}{}", VAR_TAG, tag, -i64::from(value))
            } else {
                format!("{}{}{}", REG_TAG, tag, value)
            }
        }
        ArgMode::Ptr => {
            if value < 0 {
                format!("{}[{}-{}]", tag, PTR_BASE, -i64::from(value))
            } else if value == 0 {
                format!("{}[{}]", tag, PTR_BASE)
            } else {
                format!("{}[{}+{}]", tag, PTR_BASE, value)
            }
        }
        ArgMode::Imm => match class {
            // Char immediates live in the operand byte unsigned
            Some(RegClass::Char) => format!("{}", value as u8),
            _ => format!("{}", value),
        },
    }
}

/// Render an immediate payload in the disassembly syntax. Reals are
/// rendered with `{:?}` so they always keep a decimal point and re-parse
/// as reals.
pub fn format_data(instr: &Instr) -> Option<String> {
    match instr.op.desc().class {
        Some(RegClass::Real) => instr.data_real().map(|r| format!("{:?}", r)),
        Some(RegClass::Point) => instr
            .data_point()
            .map(|(x, y)| format!("({:?}, {:?})", x, y)),
        _ => None,
    }
}
