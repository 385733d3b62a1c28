//! Parser for assembly listings: the textual form of instructions the
//! disassembler prints and the CLI consumes. A listing is line oriented;
//! each line carries an optional label declaration, an optional instruction
//! (mnemonic plus comma-separated operands) and an optional `;` comment.
//! `%proc <name>` starts a new procedure section. Lines produced by the
//! disassembler, with their leading byte-position column, re-parse as-is.

use crate::{
    error::{AsmError, SourceErrorWrapper, WithSource},
    registers::RegClass,
    util::{RawSpan, Span},
};
use nom::{
    branch::alt,
    bytes::complete::{tag, take_while, take_while1},
    character::complete::{
        alpha1, char, digit1, not_line_ending, one_of, space0, space1,
    },
    combinator::{map, map_res, opt, peek, recognize},
    error::VerboseError,
    multi::separated_list1,
    sequence::{delimited, pair, preceded, terminated, tuple},
    IResult, Offset, Slice,
};

type ParseResult<'a, T> = IResult<RawSpan<'a>, T, VerboseError<RawSpan<'a>>>;

/// An AST node paired with the span of source it was parsed from.
#[derive(Clone, Debug, PartialEq)]
pub struct Node<T>(pub T, pub Span);

impl<T> Node<T> {
    pub fn value(&self) -> &T {
        &self.0
    }

    pub fn span(&self) -> Span {
        self.1
    }
}

/// One operand, as written.
#[derive(Clone, Debug, PartialEq)]
pub enum Operand {
    /// A register or variable slot, e.g. `ri2`, `gvr3`. Variables carry a
    /// negative index.
    Slot {
        global: bool,
        class: RegClass,
        index: i32,
    },
    /// A pointer operand, e.g. `i[ro0+8]`
    Pointer { class: RegClass, disp: i32 },
    /// An integer literal
    Int(i64),
    /// A real literal (always written with a decimal point)
    Real(f64),
    /// A point literal, e.g. `(1.5, 2.0)`
    Point(f64, f64),
    /// A bare identifier: a label or procedure name
    Name(String),
}

/// One statement of a listing.
#[derive(Clone, Debug, PartialEq)]
pub enum Statement {
    /// A label declaration, `name:`
    Label(String),
    /// Start of a new procedure section, `%proc name`
    Proc(String),
    /// An instruction
    Instr(InstrStmt),
}

/// A parsed instruction line.
#[derive(Clone, Debug, PartialEq)]
pub struct InstrStmt {
    pub mnemonic: Node<String>,
    pub operands: Vec<Node<Operand>>,
}

/// A parsed listing.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct Listing {
    pub statements: Vec<Node<Statement>>,
}

/// A trait for parsing one AST node out of the input. Implementations do
/// not consume surrounding whitespace.
trait Parse<'a>: Sized {
    fn parse(input: RawSpan<'a>) -> ParseResult<'a, Self>;

    /// Parse the node and capture the span of source it covered.
    fn parse_node(input: RawSpan<'a>) -> ParseResult<'a, Node<Self>> {
        let (i, value) = Self::parse(input)?;
        let index = input.offset(&i);
        let raw_span = input.slice(..index);
        Ok((i, Node(value, Span::from_raw_span(&raw_span))))
    }
}

/// Identifier: labels and procedure names.
fn identifier(input: RawSpan<'_>) -> ParseResult<'_, RawSpan<'_>> {
    take_while1(|c: char| c.is_alphanumeric() || c == '_')(input)
}

/// Mnemonics additionally allow the trailing `?` of the comparison ops.
fn mnemonic(input: RawSpan<'_>) -> ParseResult<'_, RawSpan<'_>> {
    recognize(pair(
        alpha1,
        take_while(|c: char| c.is_alphanumeric() || c == '?'),
    ))(input)
}

/// A numeric literal; the decimal point decides int vs real.
enum Num {
    Int(i64),
    Real(f64),
}

impl Num {
    fn as_real(&self) -> f64 {
        match self {
            Num::Int(value) => *value as f64,
            Num::Real(value) => *value,
        }
    }
}

fn number(input: RawSpan<'_>) -> ParseResult<'_, Num> {
    map_res(
        recognize(tuple((
            opt(char('-')),
            digit1,
            opt(pair(char('.'), digit1)),
        ))),
        |s: RawSpan<'_>| {
            let frag: &str = s.fragment();
            if frag.contains('.') {
                frag.parse::<f64>().map(Num::Real).map_err(drop)
            } else {
                frag.parse::<i64>().map(Num::Int).map_err(drop)
            }
        },
    )(input)
}

/// Classify a bare word as a slot reference or a plain name. Slots look
/// like `[g](r|v)<class><digits>`.
fn classify_word(word: &str) -> Operand {
    fn slot_of(word: &str) -> Option<Operand> {
        let (global, rest) = match word.strip_prefix('g') {
            Some(rest) => (true, rest),
            None => (false, word),
        };
        let mut chars = rest.chars();
        let var = match chars.next()? {
            'r' => false,
            'v' => true,
            _ => return None,
        };
        let class = match chars.next()? {
            'c' => RegClass::Char,
            'i' => RegClass::Int,
            'r' => RegClass::Real,
            'p' => RegClass::Point,
            'o' => RegClass::Obj,
            _ => return None,
        };
        let digits = chars.as_str();
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let index: i32 = digits.parse().ok()?;
        Some(Operand::Slot {
            global,
            class,
            index: if var { -index } else { index },
        })
    }

    slot_of(word).unwrap_or_else(|| Operand::Name(word.to_owned()))
}

/// `c[ro0+8]`, `i[ro0]`, `r[ro0-4]`
fn pointer(input: RawSpan<'_>) -> ParseResult<'_, Operand> {
    let (i, class_ch) = one_of("cirpo")(input)?;
    let (i, _) = char('[')(i)?;
    let (i, _) = delimited(space0, tag("ro0"), space0)(i)?;
    let (i, disp) = opt(tuple((one_of("+-"), space0, digit1)))(i)?;
    let (i, _) = preceded(space0, char(']'))(i)?;

    let class = match class_ch {
        'c' => RegClass::Char,
        'i' => RegClass::Int,
        'r' => RegClass::Real,
        'p' => RegClass::Point,
        _ => RegClass::Obj,
    };
    let disp = match disp {
        None => 0,
        Some((sign, _, digits)) => {
            let magnitude: i32 = digits.fragment().parse().unwrap_or(0);
            if sign == '-' {
                -magnitude
            } else {
                magnitude
            }
        }
    };
    Ok((i, Operand::Pointer { class, disp }))
}

/// `(1.5, 2.0)`
fn point_literal(input: RawSpan<'_>) -> ParseResult<'_, Operand> {
    map(
        tuple((
            char('('),
            delimited(space0, number, space0),
            char(','),
            delimited(space0, number, space0),
            char(')'),
        )),
        |(_, x, _, y, _)| Operand::Point(x.as_real(), y.as_real()),
    )(input)
}

/// The decoration the disassembler puts after `call` operands, e.g.
/// `2('print')`. Parsed and discarded.
fn call_name_suffix(input: RawSpan<'_>) -> ParseResult<'_, ()> {
    map(
        tuple((
            char('('),
            char('\''),
            take_while(|c: char| c != '\''),
            char('\''),
            char(')'),
        )),
        drop,
    )(input)
}

impl<'a> Parse<'a> for Operand {
    fn parse(input: RawSpan<'a>) -> ParseResult<'a, Self> {
        alt((
            point_literal,
            pointer,
            map(pair(number, opt(call_name_suffix)), |(num, _)| match num {
                Num::Int(value) => Operand::Int(value),
                Num::Real(value) => Operand::Real(value),
            }),
            map(identifier, |word: RawSpan<'_>| {
                classify_word(word.fragment())
            }),
        ))(input)
    }
}

impl<'a> Parse<'a> for Statement {
    fn parse(input: RawSpan<'a>) -> ParseResult<'a, Self> {
        alt((directive, label_decl, instruction))(input)
    }
}

/// `%proc name`
fn directive(input: RawSpan<'_>) -> ParseResult<'_, Statement> {
    map_res(
        preceded(
            char('%'),
            pair(identifier, preceded(space1, identifier)),
        ),
        |(keyword, name): (RawSpan<'_>, RawSpan<'_>)| {
            match *keyword.fragment() {
                "proc" => Ok(Statement::Proc((*name.fragment()).to_owned())),
                _ => Err(()),
            }
        },
    )(input)
}

/// `name:`
fn label_decl(input: RawSpan<'_>) -> ParseResult<'_, Statement> {
    map(
        terminated(identifier, char(':')),
        |name: RawSpan<'_>| Statement::Label((*name.fragment()).to_owned()),
    )(input)
}

fn instruction(input: RawSpan<'_>) -> ParseResult<'_, Statement> {
    let (i, name) = mnemonic(input)?;
    let mnemonic_node = {
        let index = input.offset(&i);
        let raw_span = input.slice(..index);
        Node(
            (*name.fragment()).to_owned(),
            Span::from_raw_span(&raw_span),
        )
    };
    let (i, operands) = opt(preceded(
        space1,
        separated_list1(
            delimited(space0, char(','), space0),
            Operand::parse_node,
        ),
    ))(i)?;
    Ok((
        i,
        Statement::Instr(InstrStmt {
            mnemonic: mnemonic_node,
            operands: operands.unwrap_or_default(),
        }),
    ))
}

/// `; comment until end of line`
fn comment(input: RawSpan<'_>) -> ParseResult<'_, ()> {
    map(pair(char(';'), not_line_ending), drop)(input)
}

/// A line ending, or the end of the input.
fn eol_or_eof(input: RawSpan<'_>) -> ParseResult<'_, ()> {
    if input.fragment().is_empty() {
        return Ok((input, ()));
    }
    map(nom::character::complete::line_ending, drop)(input)
}

/// The byte-position column the disassembler prints in front of each line.
fn position_prefix(input: RawSpan<'_>) -> ParseResult<'_, ()> {
    map(
        tuple((digit1, space1, peek(nom::character::complete::anychar))),
        drop,
    )(input)
}

/// One listing line: whitespace, optional position column, optional label,
/// optional instruction, optional comment.
fn line(input: RawSpan<'_>) -> ParseResult<'_, Vec<Node<Statement>>> {
    let (i, _) = space0(input)?;
    let (i, _) = opt(position_prefix)(i)?;
    let mut statements = Vec::new();
    let (i, label) = opt(Statement::parse_node)(i)?;
    let mut i = i;
    if let Some(node) = label {
        // A label may share its line with an instruction
        let is_label = matches!(node.value(), Statement::Label(_));
        statements.push(node);
        if is_label {
            let (rest, _) = space0(i)?;
            let (rest, instr) = opt(instruction_node)(rest)?;
            if let Some(node) = instr {
                statements.push(node);
            }
            i = rest;
        }
    }
    let (i, _) = space0(i)?;
    let (i, _) = opt(comment)(i)?;
    let (i, _) = eol_or_eof(i)?;
    Ok((i, statements))
}

fn instruction_node(
    input: RawSpan<'_>,
) -> ParseResult<'_, Node<Statement>> {
    let (i, value) = instruction(input)?;
    let index = input.offset(&i);
    let raw_span = input.slice(..index);
    Ok((i, Node(value, Span::from_raw_span(&raw_span))))
}

fn listing(mut input: RawSpan<'_>) -> ParseResult<'_, Listing> {
    let mut statements = Vec::new();
    while !input.fragment().is_empty() {
        let (rest, mut line_statements) = line(input)?;
        statements.append(&mut line_statements);
        // `line` always consumes at least the line ending when input
        // remains, so this loop makes progress
        debug_assert_ne!(rest.location_offset(), input.location_offset());
        input = rest;
    }
    Ok((input, Listing { statements }))
}

/// Parse a complete listing. On failure the syntax error points at the
/// line where parsing stopped.
pub fn parse_listing(src: &str) -> Result<Listing, WithSource<AsmError>> {
    match listing(RawSpan::new(src)) {
        Ok((_, parsed)) => Ok(parsed),
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => {
            let span = e
                .errors
                .first()
                .map(|(at, _)| {
                    let frag: &str = at.fragment();
                    let length =
                        frag.find('\n').unwrap_or_else(|| frag.len());
                    Span {
                        offset: at.location_offset(),
                        length,
                        start_line: at.location_line(),
                        start_col: at.get_column(),
                    }
                })
                .unwrap_or_default();
            Err(WithSource::new(
                vec![SourceErrorWrapper::new(
                    AsmError::Syntax {
                        expected: "statement",
                    },
                    span,
                    src,
                )],
                src.to_owned(),
            ))
        }
        Err(nom::Err::Incomplete(_)) => {
            unreachable!("parsers are complete")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(src: &str) -> Vec<Statement> {
        parse_listing(src)
            .unwrap()
            .statements
            .into_iter()
            .map(|node| node.0)
            .collect()
    }

    fn instr(statement: &Statement) -> &InstrStmt {
        match statement {
            Statement::Instr(instr) => instr,
            other => panic!("expected instruction, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_simple_program() {
        let statements = parse("mov ri1, 5\nadd ri1, gri2\nret\n");
        assert_eq!(statements.len(), 3);

        let mov = instr(&statements[0]);
        assert_eq!(mov.mnemonic.value(), "mov");
        assert_eq!(
            mov.operands[0].value(),
            &Operand::Slot {
                global: false,
                class: RegClass::Int,
                index: 1
            }
        );
        assert_eq!(mov.operands[1].value(), &Operand::Int(5));

        let add = instr(&statements[1]);
        assert_eq!(
            add.operands[1].value(),
            &Operand::Slot {
                global: true,
                class: RegClass::Int,
                index: 2
            }
        );

        let ret = instr(&statements[2]);
        assert_eq!(ret.mnemonic.value(), "ret");
        assert!(ret.operands.is_empty());
    }

    #[test]
    fn test_parse_slots_and_variables() {
        let statements = parse("mov vr2, gvr3\n");
        let mov = instr(&statements[0]);
        assert_eq!(
            mov.operands[0].value(),
            &Operand::Slot {
                global: false,
                class: RegClass::Real,
                index: -2
            }
        );
        assert_eq!(
            mov.operands[1].value(),
            &Operand::Slot {
                global: true,
                class: RegClass::Real,
                index: -3
            }
        );
    }

    #[test]
    fn test_parse_pointer_operands() {
        let statements =
            parse("mov ri1, i[ro0+8]\nmov c[ro0], 65\nmov rr1, r[ro0 - 4]\n");
        assert_eq!(
            instr(&statements[0]).operands[1].value(),
            &Operand::Pointer {
                class: RegClass::Int,
                disp: 8
            }
        );
        assert_eq!(
            instr(&statements[1]).operands[0].value(),
            &Operand::Pointer {
                class: RegClass::Char,
                disp: 0
            }
        );
        assert_eq!(
            instr(&statements[2]).operands[1].value(),
            &Operand::Pointer {
                class: RegClass::Real,
                disp: -4
            }
        );
    }

    #[test]
    fn test_parse_literals() {
        let statements =
            parse("mov rr1, 3.25\nmov rp1, (1.5, -2.0)\nmov ri1, -7\n");
        assert_eq!(
            instr(&statements[0]).operands[1].value(),
            &Operand::Real(3.25)
        );
        assert_eq!(
            instr(&statements[1]).operands[1].value(),
            &Operand::Point(1.5, -2.0)
        );
        assert_eq!(
            instr(&statements[2]).operands[1].value(),
            &Operand::Int(-7)
        );
    }

    #[test]
    fn test_parse_labels_and_jumps() {
        let statements = parse("loop: dec gri1\n  jc loop ; again\nret\n");
        assert_eq!(statements[0], Statement::Label("loop".to_owned()));
        let dec = instr(&statements[1]);
        assert_eq!(dec.mnemonic.value(), "dec");
        let jc = instr(&statements[2]);
        assert_eq!(
            jc.operands[0].value(),
            &Operand::Name("loop".to_owned())
        );
    }

    #[test]
    fn test_parse_question_mark_mnemonics() {
        let statements = parse("eq? ri1, ri2\n");
        assert_eq!(instr(&statements[0]).mnemonic.value(), "eq?");
    }

    #[test]
    fn test_parse_directive_and_comments() {
        let statements = parse(
            "; a program\n%proc helper\nret\n\n; trailing comment\n",
        );
        assert_eq!(statements[0], Statement::Proc("helper".to_owned()));
        assert_eq!(statements.len(), 2);
    }

    #[test]
    fn test_parse_disassembler_output_shape() {
        // Lines with a leading byte-position column re-parse
        let statements = parse("0\tmov ri0, 5\n4\tcall 1('print')\n");
        assert_eq!(instr(&statements[0]).mnemonic.value(), "mov");
        let call = instr(&statements[1]);
        assert_eq!(call.operands[0].value(), &Operand::Int(1));
    }

    #[test]
    fn test_parse_error_has_location() {
        let error = parse_listing("mov ri1, 5\nmov ri1, [oops\n")
            .unwrap_err();
        let message = format!("{}", error);
        assert!(message.contains("Syntax error"));
        assert!(message.contains("2:"));
    }

    #[test]
    fn test_spans_point_at_source() {
        let src = "mov ri1, 5\n";
        let listing = parse_listing(src).unwrap();
        let node = &listing.statements[0];
        assert_eq!(node.span().get_source_slice(src), "mov ri1, 5");
    }
}
