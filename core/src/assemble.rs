//! Lowers a parsed listing into installed procedures: resolves mnemonics
//! against the opcode catalogue, converts operands, runs labels and named
//! calls through the linker, and installs each `%proc` section under its
//! name. This driver stands in for the language front end: it exercises the
//! same codec and symbol-table paths a compiler would.

use crate::{
    error::{AsmError, SourceErrorWrapper, WithSource},
    instr::{ArgMode, Instr},
    machine::Vm,
    opcode::{OpDesc, OPCODES},
    parse::{self, InstrStmt, Node, Operand, Statement},
    proc::{CallNum, ProcId},
    registers::RegClass,
    symbol::{LabelId, SymKind},
    util::Span,
};
use std::collections::HashMap;
use std::convert::TryFrom;

/// One label of the section being assembled.
struct LabelEntry {
    id: LabelId,
    /// Where the label was declared, once it has been
    defined_at: Option<Span>,
    /// Where the label was first mentioned (for error reporting)
    first_use: Span,
}

/// Assembly state for one `%proc` section.
struct Section {
    name: String,
    proc: ProcId,
    labels: HashMap<String, LabelEntry>,
}

/// Assemble a listing into the VM: every section becomes an installed
/// procedure, named calls are linked through the symbol table, and all
/// references are resolved. Returns the call number of the first section
/// (`main` unless the listing opens with `%proc`).
pub fn assemble_listing(
    vm: &mut Vm,
    source: &str,
) -> Result<CallNum, WithSource<AsmError>> {
    assemble_listing_as(vm, source, "main")
}

/// Like [assemble_listing], but statements before the first `%proc` go
/// into a section named `entry` instead of `main`. Used for auto-included
/// setup listings, whose entry must not collide with the program's.
pub fn assemble_listing_as(
    vm: &mut Vm,
    source: &str,
    entry: &str,
) -> Result<CallNum, WithSource<AsmError>> {
    let listing = parse::parse_listing(source)?;

    let mut errors: Vec<(AsmError, Span)> = Vec::new();
    let mut section: Option<Section> = None;
    let mut first_call: Option<CallNum> = None;

    for statement in &listing.statements {
        let span = statement.span();
        match statement.value() {
            Statement::Proc(name) => {
                if let Some(done) = section.take() {
                    let call = finish_section(vm, done, &mut errors);
                    first_call.get_or_insert(call);
                }
                section = Some(begin_section(vm, name));
            }
            Statement::Label(name) => {
                let current = section
                    .get_or_insert_with(|| begin_section(vm, entry));
                define_label(vm, current, name, span, &mut errors);
            }
            Statement::Instr(instr) => {
                let current = section
                    .get_or_insert_with(|| begin_section(vm, entry));
                if let Err(error) = encode_instr(vm, current, instr, span) {
                    errors.push(error);
                }
            }
        }
    }
    let done = section
        .take()
        .unwrap_or_else(|| begin_section(vm, entry));
    let call = finish_section(vm, done, &mut errors);
    first_call.get_or_insert(call);

    if let Err(error) = vm.sym_resolve_all() {
        errors.push((
            AsmError::Backend {
                message: error.to_string(),
            },
            Span::default(),
        ));
    }

    if errors.is_empty() {
        Ok(first_call.unwrap())
    } else {
        let errors: Vec<_> = errors
            .into_iter()
            .map(|(error, span)| {
                SourceErrorWrapper::new(error, span, source)
            })
            .collect();
        Err(WithSource::new(errors, source.to_owned()))
    }
}

fn begin_section(vm: &mut Vm, name: &str) -> Section {
    let proc = vm.procs_mut().code_new();
    vm.procs_mut().target_set(proc).expect("fresh procedure");
    Section {
        name: name.to_owned(),
        proc,
        labels: HashMap::new(),
    }
}

/// Close a section: report dangling labels, terminate the code, install it
/// and bind its name in the symbol table.
fn finish_section(
    vm: &mut Vm,
    section: Section,
    errors: &mut Vec<(AsmError, Span)>,
) -> CallNum {
    for entry in section.labels.values() {
        if entry.defined_at.is_none() {
            errors.push((AsmError::UndefinedLabel, entry.first_use));
        }
    }

    // Every procedure ends with an explicit return
    vm.procs_mut().target_set(section.proc).expect("section");
    if vm.assemble(Instr::new(crate::opcode::Op::Ret)).is_err() {
        // The target cannot reject a plain ret; recorded for completeness
    }
    let call =
        vm.procs_mut()
            .install_code(section.proc, &section.name, "assembled");

    // Bind the section name so `call <name>` resolves to this procedure
    let bind = match vm.syms().lookup(&section.name) {
        Some(sym) if vm.syms().kind(sym) == SymKind::Call => {
            vm.sym_def_call(sym, call)
        }
        Some(_) => Err(crate::error::LinkError::DuplicateName(
            section.name.clone(),
        )),
        None => {
            let sym = vm.sym_new_call();
            let named = vm.syms_mut().name_set(sym, &section.name);
            named.and_then(|_| vm.sym_def_call(sym, call))
        }
    };
    if let Err(error) = bind {
        errors.push((
            AsmError::Backend {
                message: error.to_string(),
            },
            Span::default(),
        ));
    }
    call
}

fn define_label(
    vm: &mut Vm,
    section: &mut Section,
    name: &str,
    span: Span,
    errors: &mut Vec<(AsmError, Span)>,
) {
    match section.labels.get_mut(name) {
        Some(entry) => match entry.defined_at {
            Some(original) => {
                errors.push((AsmError::DuplicateLabel { original }, span));
            }
            None => {
                entry.defined_at = Some(span);
                let id = entry.id;
                if let Err(error) = vm.label_define_here(id) {
                    errors.push((
                        AsmError::Backend {
                            message: error.to_string(),
                        },
                        span,
                    ));
                }
            }
        },
        None => {
            let id = vm.label_new_here();
            section.labels.insert(
                name.to_owned(),
                LabelEntry {
                    id,
                    defined_at: Some(span),
                    first_use: span,
                },
            );
        }
    }
}

/// Get (or lazily create) the label an instruction mentions.
fn label_for(
    vm: &mut Vm,
    section: &mut Section,
    name: &str,
    span: Span,
) -> LabelId {
    match section.labels.get(name) {
        Some(entry) => entry.id,
        None => {
            let id = vm.label_new_undef();
            section.labels.insert(
                name.to_owned(),
                LabelEntry {
                    id,
                    defined_at: None,
                    first_use: span,
                },
            );
            id
        }
    }
}

type EncodeError = (AsmError, Span);

fn backend(span: Span, error: impl ToString) -> EncodeError {
    (
        AsmError::Backend {
            message: error.to_string(),
        },
        span,
    )
}

fn encode_instr(
    vm: &mut Vm,
    section: &mut Section,
    stmt: &InstrStmt,
    span: Span,
) -> Result<(), EncodeError> {
    let mnemonic = stmt.mnemonic.value().as_str();

    // Jumps to a named label go through the label machinery
    if (mnemonic == "jmp" || mnemonic == "jc") && stmt.operands.len() == 1 {
        if let Operand::Name(name) = stmt.operands[0].value() {
            let label =
                label_for(vm, section, name, stmt.operands[0].span());
            return vm
                .label_jump(label, mnemonic == "jc")
                .map_err(|error| backend(span, error));
        }
    }

    // A call by name goes through the linker, so the procedure may be
    // defined later in the listing (or not at all yet)
    if mnemonic == "call" && stmt.operands.len() == 1 {
        if let Operand::Name(name) = stmt.operands[0].value() {
            let sym = match vm.syms().lookup(name) {
                Some(sym) if vm.syms().kind(sym) == SymKind::Call => sym,
                Some(_) => {
                    return Err(backend(
                        stmt.operands[0].span(),
                        format!("`{}` does not name a procedure", name),
                    ));
                }
                None => {
                    let sym = vm.sym_new_call();
                    vm.syms_mut()
                        .name_set(sym, name)
                        .map_err(|error| backend(span, error))?;
                    sym
                }
            };
            return vm
                .sym_call_ref(sym)
                .map_err(|error| backend(span, error));
        }
    }

    let desc = select_opcode(mnemonic, &stmt.operands)
        .ok_or((AsmError::UnknownInstruction, stmt.mnemonic.span()))?;

    let mut instr = Instr::new(desc.op);
    for operand in stmt.operands.iter().take(desc.num_args) {
        let (mode, value) = convert_operand(desc, operand)?;
        instr = instr.arg(mode, value);
    }
    if desc.has_data {
        let payload = stmt
            .operands
            .last()
            .expect("payload operand checked by selection");
        instr = match (desc.class, payload.value()) {
            (Some(RegClass::Real), Operand::Real(value)) => {
                instr.real(*value)
            }
            (Some(RegClass::Real), Operand::Int(value)) => {
                instr.real(*value as f64)
            }
            (Some(RegClass::Point), Operand::Point(x, y)) => {
                instr.point(*x, *y)
            }
            _ => return Err((AsmError::BadImmediate, payload.span())),
        };
    }

    vm.assemble(instr).map_err(|error| backend(span, error))?;
    Ok(())
}

/// Pick the catalogue entry matching a mnemonic and its operand shapes.
fn select_opcode(
    mnemonic: &str,
    operands: &[Node<Operand>],
) -> Option<&'static OpDesc> {
    let class_hint = operands.iter().find_map(|op| match op.value() {
        Operand::Slot { class, .. } | Operand::Pointer { class, .. } => {
            Some(*class)
        }
        _ => None,
    });
    let literal_hint = operands.iter().find_map(|op| match op.value() {
        Operand::Real(_) => Some(RegClass::Real),
        Operand::Point(_, _) => Some(RegClass::Point),
        _ => None,
    });
    // A trailing literal picks the payload-carrying variant of a mnemonic
    let payload_wanted = matches!(
        operands.last().map(Node::value),
        Some(Operand::Real(_))
            | Some(Operand::Point(_, _))
            | Some(Operand::Int(_))
    );

    let candidates: Vec<&'static OpDesc> = OPCODES
        .iter()
        .filter(|desc| desc.name == mnemonic)
        .filter(|desc| desc.num_args + desc.has_data as usize == operands.len())
        .collect();
    match candidates.len() {
        0 => None,
        1 => Some(candidates[0]),
        _ => {
            let class = class_hint.or(literal_hint)?;
            let matching: Vec<_> = candidates
                .into_iter()
                .filter(|desc| desc.class == Some(class))
                .collect();
            match matching.len() {
                1 => Some(matching[0]),
                0 => None,
                _ => matching
                    .into_iter()
                    .find(|desc| desc.has_data == payload_wanted),
            }
        }
    }
}

/// Convert one operand into its addressing mode and encoded value.
fn convert_operand(
    desc: &OpDesc,
    operand: &Node<Operand>,
) -> Result<(ArgMode, i32), EncodeError> {
    let span = operand.span();
    match operand.value() {
        Operand::Slot {
            global,
            class,
            index,
        } => {
            if desc.class != Some(*class) {
                return Err((AsmError::UnknownInstruction, span));
            }
            let mode = if *global {
                ArgMode::GlobalReg
            } else {
                ArgMode::LocalReg
            };
            Ok((mode, *index))
        }
        Operand::Pointer { class, disp } => {
            if desc.class != Some(*class) {
                return Err((AsmError::UnknownInstruction, span));
            }
            Ok((ArgMode::Ptr, *disp))
        }
        Operand::Int(value) => {
            if !matches!(
                desc.class,
                Some(RegClass::Char) | Some(RegClass::Int)
            ) {
                return Err((AsmError::BadImmediate, span));
            }
            let value = i32::try_from(*value).map_err(|_| {
                backend(span, "immediate does not fit 32 bits")
            })?;
            Ok((ArgMode::Imm, value))
        }
        Operand::Real(_) | Operand::Point(_, _) | Operand::Name(_) => {
            Err((AsmError::BadImmediate, span))
        }
    }
}
