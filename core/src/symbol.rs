//! The symbol table: the linker of the VM. Front ends reference procedures,
//! jump targets and prologue sizes before they are known; every such
//! reference is recorded against a symbol and patched once the symbol is
//! defined.
//!
//! Definition and reference payloads live inline in one growable byte
//! arena, addressed by offsets (pointers into it would be invalidated by
//! growth). References to one symbol form a linked chain rooted at the
//! symbol. A *code reference* is the special case where the reference is
//! itself a span of emitted code: a generator callback emits provisional
//! code immediately (so downstream offsets stay put) and re-emits the final
//! code into the scratch procedure at resolution time, when the patcher
//! splices it over the reserved span. Generators emit in long form so the
//! reserved and final spans always have the same size.

use crate::{
    consts::NUM_REG_CLASSES,
    error::LinkError,
    instr::{ArgMode, Format, Instr},
    machine::Vm,
    opcode::Op,
    pool::Pool,
    proc::{CallNum, ProcId},
    registers::RegCounts,
};
use byteorder::{ByteOrder, LittleEndian};
use serde::Serialize;
use std::collections::HashMap;

/// Identifier of a symbol; 1-based, 0 is never issued.
pub type SymId = u32;

/// What a symbol stands for.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub enum SymKind {
    /// Definition is a call number
    Call,
    /// Definition is (owning procedure, target position)
    CondJump,
    /// Definition is the per-class variable/register counts of a procedure
    ProcHeader,
    /// A generic named position
    Label,
}

/// Resolution status requested when attaching a reference.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RefStatus {
    /// Resolved now if the symbol is already defined
    Auto,
    Resolved,
    Unresolved,
}

/// A resolver for plain (non-code) references. Receives the definition and
/// reference payloads by copy; the arena may grow while it runs.
pub type SymResolver = fn(
    vm: &mut Vm,
    sym: SymId,
    defined: bool,
    def: &[u8],
    reference: &[u8],
) -> Result<(), LinkError>;

/// A code generator for code references. Called once at reference time
/// (`defined` reflecting the state then) and again at resolution time with
/// the actual definition; both runs must emit the same number of words.
pub type CodeGen = fn(
    vm: &mut Vm,
    sym: SymId,
    defined: bool,
    def: &[u8],
) -> Result<(), LinkError>;

#[derive(Clone, Debug)]
struct Sym {
    kind: SymKind,
    name: Option<String>,
    defined: bool,
    def_addr: usize,
    def_size: usize,
    first_ref: Option<u32>,
    resolver: Option<SymResolver>,
}

/// The span a code reference reserved inside a procedure.
#[derive(Copy, Clone)]
struct CodeRef {
    proc: ProcId,
    pos: usize,
    words: usize,
    gen: CodeGen,
}

struct SymRef {
    sym: SymId,
    next: Option<u32>,
    ref_addr: usize,
    ref_size: usize,
    resolved: bool,
    code: Option<CodeRef>,
}

/// The symbol table, embedded in the VM.
#[derive(Default)]
pub struct SymTable {
    syms: Vec<Sym>,
    refs: Vec<SymRef>,
    /// Shared arena for definition and reference payloads
    data: Vec<u8>,
    names: HashMap<String, SymId>,
}

impl SymTable {
    /// Allocate a symbol with a zeroed definition area of `def_size` bytes.
    pub fn sym_new(&mut self, kind: SymKind, def_size: usize) -> SymId {
        let def_addr = self.data.len();
        self.data.resize(def_addr + def_size, 0);
        self.syms.push(Sym {
            kind,
            name: None,
            defined: false,
            def_addr,
            def_size,
            first_ref: None,
            resolver: None,
        });
        self.syms.len() as SymId
    }

    fn sym(&self, sym: SymId) -> &Sym {
        &self.syms[(sym - 1) as usize]
    }

    fn sym_mut(&mut self, sym: SymId) -> &mut Sym {
        &mut self.syms[(sym - 1) as usize]
    }

    /// Number of symbols allocated so far.
    pub fn count(&self) -> usize {
        self.syms.len()
    }

    pub fn kind(&self, sym: SymId) -> SymKind {
        self.sym(sym).kind
    }

    pub fn is_defined(&self, sym: SymId) -> bool {
        self.sym(sym).defined
    }

    /// Attach a unique name to a symbol.
    pub fn name_set(
        &mut self,
        sym: SymId,
        name: &str,
    ) -> Result<(), LinkError> {
        if self.sym(sym).name.is_some() {
            return Err(LinkError::AlreadyNamed(self.display_name(sym)));
        }
        if self.names.contains_key(name) {
            return Err(LinkError::DuplicateName(name.to_owned()));
        }
        self.names.insert(name.to_owned(), sym);
        self.sym_mut(sym).name = Some(name.to_owned());
        Ok(())
    }

    pub fn name_get(&self, sym: SymId) -> Option<&str> {
        self.sym(sym).name.as_deref()
    }

    /// Find a symbol by name.
    pub fn lookup(&self, name: &str) -> Option<SymId> {
        self.names.get(name).copied()
    }

    /// A human-readable handle for error messages.
    pub fn display_name(&self, sym: SymId) -> String {
        match self.name_get(sym) {
            Some(name) => name.to_owned(),
            None => format!("#{}", sym),
        }
    }

    /// Write the definition payload of a symbol. A symbol can be defined
    /// only once.
    pub fn sym_def(&mut self, sym: SymId, def: &[u8]) -> Result<(), LinkError> {
        if self.sym(sym).defined {
            return Err(LinkError::Redefinition(self.display_name(sym)));
        }
        let (addr, size) = {
            let s = self.sym(sym);
            (s.def_addr, s.def_size)
        };
        assert_eq!(def.len(), size, "definition payload size mismatch");
        self.data[addr..addr + size].copy_from_slice(def);
        self.sym_mut(sym).defined = true;
        Ok(())
    }

    /// A copy of the definition payload.
    pub fn def_bytes(&self, sym: SymId) -> Vec<u8> {
        let s = self.sym(sym);
        self.data[s.def_addr..s.def_addr + s.def_size].to_vec()
    }

    /// Attach a plain reference with its payload. `resolver`, when given,
    /// becomes the symbol's resolver. With [RefStatus::Auto] the reference
    /// is born resolved iff the symbol is already defined.
    pub fn sym_ref(
        &mut self,
        sym: SymId,
        resolver: Option<SymResolver>,
        reference: &[u8],
        status: RefStatus,
    ) {
        let resolved = match status {
            RefStatus::Resolved => true,
            RefStatus::Unresolved => false,
            RefStatus::Auto => self.sym(sym).defined,
        };
        if resolver.is_some() {
            self.sym_mut(sym).resolver = resolver;
        }
        let ref_addr = self.data.len();
        self.data.extend_from_slice(reference);
        self.push_ref(SymRef {
            sym,
            next: self.sym(sym).first_ref,
            ref_addr,
            ref_size: reference.len(),
            resolved,
            code: None,
        });
    }

    fn push_ref(&mut self, sym_ref: SymRef) {
        let sym = sym_ref.sym;
        self.refs.push(sym_ref);
        self.sym_mut(sym).first_ref = Some(self.refs.len() as u32);
    }

    /// True iff every reference in the table is resolved.
    pub fn ref_check(&self) -> bool {
        self.refs.iter().all(|r| r.resolved)
    }

    /// One error per unresolved reference, for reporting.
    pub fn ref_report(&self) -> Vec<LinkError> {
        self.refs
            .iter()
            .filter(|r| !r.resolved)
            .map(|r| LinkError::Unresolved(self.display_name(r.sym)))
            .collect()
    }
}

impl Vm {
    /// Resolve one symbol: walk its reference chain and patch every
    /// reference that is still unresolved. Undefined symbols are silently
    /// skipped (they may be defined and resolved later).
    pub fn sym_resolve(&mut self, sym: SymId) -> Result<(), LinkError> {
        if !self.syms.is_defined(sym) {
            return Ok(());
        }
        let def = self.syms.def_bytes(sym);
        let mut next = self.syms.sym(sym).first_ref;
        while let Some(ref_num) = next {
            let index = (ref_num - 1) as usize;
            let (resolved, ref_addr, ref_size, code, chain) = {
                let r = &self.syms.refs[index];
                assert_eq!(r.sym, sym, "bad reference in the chain");
                (r.resolved, r.ref_addr, r.ref_size, r.code, r.next)
            };
            if !resolved {
                match code {
                    Some(code_ref) => {
                        self.resolve_code_ref(sym, code_ref, &def)?;
                    }
                    None => {
                        let resolver = self.syms.sym(sym).resolver.ok_or_else(
                            || {
                                LinkError::NoResolver(
                                    self.syms.display_name(sym),
                                )
                            },
                        )?;
                        let reference = self.syms.data
                            [ref_addr..ref_addr + ref_size]
                            .to_vec();
                        resolver(self, sym, true, &def, &reference)?;
                    }
                }
                self.syms.refs[index].resolved = true;
            }
            next = chain;
        }
        Ok(())
    }

    /// Resolve every symbol. Idempotent: a second run finds nothing left
    /// to patch.
    pub fn sym_resolve_all(&mut self) -> Result<(), LinkError> {
        for sym in 1..=self.syms.count() as SymId {
            self.sym_resolve(sym)?;
        }
        Ok(())
    }

    /// Emit code that references `sym` before its definition is known.
    /// `gen` is run right now to emit the provisional span into the current
    /// target procedure; the span is recorded and `gen` runs again, against
    /// the real definition, when the symbol is resolved.
    pub fn sym_code_ref(
        &mut self,
        sym: SymId,
        gen: CodeGen,
    ) -> Result<(), LinkError> {
        let proc = self.procs.target_get();
        let pos = self.procs.position();
        let defined = self.syms.is_defined(sym);
        let def = self.syms.def_bytes(sym);
        gen(self, sym, defined, &def)?;
        assert_eq!(
            self.procs.target_get(),
            proc,
            "code generators must not change the target procedure"
        );
        let words = self.procs.position() - pos;
        self.syms.push_ref(SymRef {
            sym,
            next: self.syms.sym(sym).first_ref,
            ref_addr: self.syms.data.len(),
            ref_size: 0,
            resolved: defined,
            code: Some(CodeRef {
                proc,
                pos,
                words,
                gen,
            }),
        });
        Ok(())
    }

    /// Re-run a code reference's generator against the actual definition
    /// and splice the result over the reserved span.
    fn resolve_code_ref(
        &mut self,
        sym: SymId,
        code_ref: CodeRef,
        def: &[u8],
    ) -> Result<(), LinkError> {
        let CodeRef {
            proc,
            pos,
            words,
            gen,
        } = code_ref;
        self.patch_code(proc, pos, words, |vm| gen(vm, sym, true, def))
    }

    /// Assemble `build`'s output into the scratch procedure, check it
    /// matches the reserved size, and splice it over `words` words at
    /// `pos` of `proc`. A size mismatch means a generator emitted
    /// different code on its two runs, which the force-long discipline
    /// rules out; it is fatal.
    pub(crate) fn patch_code<F>(
        &mut self,
        proc: ProcId,
        pos: usize,
        words: usize,
        build: F,
    ) -> Result<(), LinkError>
    where
        F: FnOnce(&mut Vm) -> Result<(), LinkError>,
    {
        let saved = self.procs.target_get();
        let scratch = self.procs.scratch();
        self.procs.clear(scratch);
        self.procs.target_restore(scratch);
        let result = build(self);
        self.procs.target_restore(saved);
        result?;

        let replacement = self.procs.proc(scratch).code().to_vec();
        assert_eq!(
            replacement.len(),
            words,
            "resolved reference does not match its reserved span"
        );
        let code = self.procs.proc_mut(proc).code_mut();
        code[pos..pos + words].copy_from_slice(&replacement);
        Ok(())
    }

    // ----- call symbols ----------------------------------------------------

    /// Create a symbol standing for a procedure call number.
    pub fn sym_new_call(&mut self) -> SymId {
        self.syms.sym_new(SymKind::Call, 4)
    }

    /// Define a call symbol with its installed call number.
    pub fn sym_def_call(
        &mut self,
        sym: SymId,
        call_num: CallNum,
    ) -> Result<(), LinkError> {
        let mut def = [0u8; 4];
        LittleEndian::write_u32(&mut def, call_num);
        self.syms.sym_def(sym, &def)
    }

    /// Emit `call <num>` against a possibly still-undefined call symbol.
    pub fn sym_call_ref(&mut self, sym: SymId) -> Result<(), LinkError> {
        self.sym_code_ref(sym, gen_call)
    }

    // ----- conditional jump symbols ----------------------------------------

    /// Create a symbol standing for a conditional-jump target.
    pub fn sym_new_cond_jump(&mut self) -> SymId {
        self.syms.sym_new(SymKind::CondJump, 8)
    }

    /// Define a conditional-jump symbol with its owning procedure and
    /// target position.
    pub fn sym_def_cond_jump(
        &mut self,
        sym: SymId,
        proc: ProcId,
        position: i32,
    ) -> Result<(), LinkError> {
        let mut def = [0u8; 8];
        LittleEndian::write_u32(&mut def, proc as u32);
        LittleEndian::write_i32(&mut def[4..], position);
        self.syms.sym_def(sym, &def)
    }

    /// Emit `jc <position>` against a possibly still-undefined target.
    pub fn sym_cond_jump_ref(&mut self, sym: SymId) -> Result<(), LinkError> {
        self.sym_code_ref(sym, gen_cond_jump)
    }

    // ----- procedure header symbols ----------------------------------------

    /// Reserve the prologue of the current procedure: creates a header
    /// symbol and immediately emits the five `new*` instructions with
    /// placeholder counts. Define the symbol once the register allocator
    /// knows the totals, then resolve.
    pub fn sym_proc_head(&mut self) -> Result<SymId, LinkError> {
        let sym = self
            .syms
            .sym_new(SymKind::ProcHeader, 2 * 4 * NUM_REG_CLASSES);
        self.sym_code_ref(sym, gen_proc_head)?;
        Ok(sym)
    }

    /// Define a procedure-header symbol with the allocator's counts.
    pub fn sym_def_proc_head(
        &mut self,
        sym: SymId,
        counts: &RegCounts,
    ) -> Result<(), LinkError> {
        let mut def = [0u8; 2 * 4 * NUM_REG_CLASSES];
        for i in 0..NUM_REG_CLASSES {
            LittleEndian::write_u32(&mut def[i * 4..], counts.num_var[i]);
            LittleEndian::write_u32(
                &mut def[(NUM_REG_CLASSES + i) * 4..],
                counts.num_reg[i],
            );
        }
        self.syms.sym_def(sym, &def)
    }

    // ----- external libraries ----------------------------------------------

    /// Resolve undefined call symbols against external libraries. This
    /// build carries no platform loader, so this is a warning-only stub:
    /// it reports every symbol it would have tried to bind.
    pub fn sym_resolve_clibs(&mut self, libs: &[String]) {
        let mut pending: Vec<String> = Vec::new();
        for sym in 1..=self.syms.count() as SymId {
            if self.syms.kind(sym) == SymKind::Call
                && !self.syms.is_defined(sym)
            {
                if let Some(name) = self.syms.name_get(sym) {
                    pending.push(name.to_owned());
                }
            }
        }
        for lib in libs {
            self.warn(format!(
                "cannot load library `{}`: built without dynamic loading \
                 (undefined calls: {})",
                lib,
                if pending.is_empty() {
                    "none".to_owned()
                } else {
                    pending.join(", ")
                }
            ));
        }
    }
}

/// Generator for call references: `call <num>`, long form so the encoding
/// size is independent of the final number.
fn gen_call(
    vm: &mut Vm,
    _sym: SymId,
    defined: bool,
    def: &[u8],
) -> Result<(), LinkError> {
    let call_num = if defined { LittleEndian::read_u32(def) } else { 0 };
    vm.assemble(
        Instr::new(Op::Call)
            .arg(ArgMode::Imm, call_num as i32)
            .format(Format::Long),
    )?;
    Ok(())
}

/// Generator for conditional-jump references: `jc <position>`, long form.
fn gen_cond_jump(
    vm: &mut Vm,
    _sym: SymId,
    defined: bool,
    def: &[u8],
) -> Result<(), LinkError> {
    let position = if defined {
        LittleEndian::read_i32(&def[4..])
    } else {
        0
    };
    vm.assemble(
        Instr::new(Op::Jc)
            .arg(ArgMode::Imm, position)
            .format(Format::Long),
    )?;
    Ok(())
}

/// Generator for procedure headers: one `new*` per register class, in
/// canonical class order, each with immediate (variables, registers)
/// counts, long form.
fn gen_proc_head(
    vm: &mut Vm,
    _sym: SymId,
    _defined: bool,
    def: &[u8],
) -> Result<(), LinkError> {
    static NEW_OPS: [Op; NUM_REG_CLASSES] =
        [Op::NewC, Op::NewI, Op::NewR, Op::NewP, Op::NewO];
    for (i, op) in NEW_OPS.iter().enumerate() {
        let num_var = LittleEndian::read_u32(&def[i * 4..]);
        let num_reg =
            LittleEndian::read_u32(&def[(NUM_REG_CLASSES + i) * 4..]);
        vm.assemble(
            Instr::new(*op)
                .arg(ArgMode::Imm, num_var as i32)
                .arg(ArgMode::Imm, num_reg as i32)
                .format(Format::Long),
        )?;
    }
    Ok(())
}

// ----- labels ---------------------------------------------------------------

/// Identifier of a label.
pub type LabelId = usize;

#[derive(Clone, Debug)]
struct Label {
    proc: ProcId,
    /// Word position in the owning procedure; `None` until defined
    pos: Option<usize>,
    first_ref: Option<usize>,
}

#[derive(Clone, Debug)]
struct JumpRef {
    /// Word position of the provisional jump instruction
    pos: usize,
    conditional: bool,
    next: Option<usize>,
}

/// Labels and the jump references waiting on them, embedded in the VM.
#[derive(Debug, Default)]
pub struct LabelTable {
    labels: Pool<Label>,
    refs: Pool<JumpRef>,
}

impl Vm {
    /// Create a label at a known position of a procedure, or an undefined
    /// one (`pos: None`) to be placed later.
    pub fn label_new(&mut self, proc: ProcId, pos: Option<usize>) -> LabelId {
        self.labels.labels.occupy(Label {
            proc,
            pos,
            first_ref: None,
        })
    }

    /// Create a label at the current position of the target procedure.
    pub fn label_new_here(&mut self) -> LabelId {
        let proc = self.procs.target_get();
        let pos = self.procs.position();
        self.label_new(proc, Some(pos))
    }

    /// Create an undefined label owned by the target procedure.
    pub fn label_new_undef(&mut self) -> LabelId {
        let proc = self.procs.target_get();
        self.label_new(proc, None)
    }

    /// Emit a (possibly conditional) jump to a label. A defined label gets
    /// a concrete relative displacement; an undefined one gets a
    /// provisional long-form jump that is rewritten by
    /// [Self::label_define].
    pub fn label_jump(
        &mut self,
        label: LabelId,
        conditional: bool,
    ) -> Result<(), LinkError> {
        let op = if conditional { Op::Jc } else { Op::Jmp };
        let here = self.procs.position();
        let (proc, pos) = {
            let l = self.labels.labels.get(label).expect("dangling label");
            (l.proc, l.pos)
        };
        if proc != self.procs.target_get() {
            return Err(LinkError::ForeignLabel);
        }

        match pos {
            Some(pos) => {
                let displacement = pos as i64 - here as i64;
                self.assemble(
                    Instr::new(op).arg(ArgMode::Imm, displacement as i32),
                )?;
            }
            None => {
                // Reserve the worst-case encoding, then remember to patch
                self.assemble(
                    Instr::new(op)
                        .arg(ArgMode::Imm, 0)
                        .format(Format::Long),
                )?;
                let head = {
                    let l = self.labels.labels.get(label).unwrap();
                    l.first_ref
                };
                let ref_id = self.labels.refs.occupy(JumpRef {
                    pos: here,
                    conditional,
                    next: head,
                });
                self.labels.labels.get_mut(label).unwrap().first_ref =
                    Some(ref_id);
            }
        }
        Ok(())
    }

    /// Place an undefined label at `pos` and rewrite every jump recorded
    /// against it with the now-known displacement.
    pub fn label_define(
        &mut self,
        label: LabelId,
        pos: usize,
    ) -> Result<(), LinkError> {
        let (proc, old_pos, mut next) = {
            let l = self.labels.labels.get(label).expect("dangling label");
            (l.proc, l.pos, l.first_ref)
        };
        assert!(old_pos.is_none(), "label defined twice");
        {
            let l = self.labels.labels.get_mut(label).unwrap();
            l.pos = Some(pos);
            l.first_ref = None;
        }

        while let Some(ref_id) = next {
            let jump = self
                .labels
                .refs
                .release(ref_id)
                .expect("dangling jump reference");
            let op = if jump.conditional { Op::Jc } else { Op::Jmp };
            let displacement = pos as i64 - jump.pos as i64;
            // The provisional jump was emitted long; re-emit long so the
            // splice is size-stable
            self.patch_code(proc, jump.pos, 3, |vm| {
                vm.assemble(
                    Instr::new(op)
                        .arg(ArgMode::Imm, displacement as i32)
                        .format(Format::Long),
                )?;
                Ok(())
            })?;
            next = jump.next;
        }
        Ok(())
    }

    /// Place an undefined label at the current position of the target
    /// procedure.
    pub fn label_define_here(
        &mut self,
        label: LabelId,
    ) -> Result<(), LinkError> {
        let pos = self.procs.position();
        self.label_define(label, pos)
    }

    /// Drop a label. It must not have pending references.
    pub fn label_destroy(&mut self, label: LabelId) -> Result<(), LinkError> {
        let pending = self
            .labels
            .labels
            .get(label)
            .expect("dangling label")
            .first_ref
            .is_some();
        if pending {
            return Err(LinkError::LabelInUse);
        }
        self.labels.labels.release(label).unwrap();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        instr,
        registers::{RegAlloc, RegClass},
    };

    /// A VM with a fresh target procedure selected.
    fn vm_with_target() -> (Vm, ProcId) {
        let mut vm = Vm::new();
        let proc = vm.procs_mut().code_new();
        vm.procs_mut().target_set(proc).unwrap();
        (vm, proc)
    }

    fn decode_all(code: &[u32]) -> Vec<Instr> {
        let mut out = Vec::new();
        let mut pos = 0;
        while pos < code.len() {
            let decoded = instr::read(code, pos).unwrap();
            pos += decoded.words;
            out.push(decoded.instr);
        }
        out
    }

    #[test]
    fn test_forward_call_patch() {
        let (mut vm, proc) = vm_with_target();
        let sym = vm.sym_new_call();
        vm.sym_call_ref(sym).unwrap();
        // The provisional span decodes as `call 0`
        let instrs = decode_all(vm.procs().proc(proc).code());
        assert_eq!(instrs.len(), 1);
        assert_eq!(instrs[0].op, Op::Call);
        assert_eq!(instrs[0].args[0], 0);
        assert!(!vm.syms().ref_check());

        vm.sym_def_call(sym, 42).unwrap();
        vm.sym_resolve(sym).unwrap();
        // The reserved region now decodes as `call 42`
        let instrs = decode_all(vm.procs().proc(proc).code());
        assert_eq!(instrs.len(), 1);
        assert_eq!(instrs[0].op, Op::Call);
        assert_eq!(instrs[0].args[0], 42);
        assert!(vm.syms().ref_check());
    }

    #[test]
    fn test_call_ref_after_definition_needs_no_patch() {
        let (mut vm, proc) = vm_with_target();
        let sym = vm.sym_new_call();
        vm.sym_def_call(sym, 7).unwrap();
        vm.sym_call_ref(sym).unwrap();
        let instrs = decode_all(vm.procs().proc(proc).code());
        assert_eq!(instrs[0].args[0], 7);
        // Born resolved, nothing pending
        assert!(vm.syms().ref_check());
    }

    #[test]
    fn test_patch_does_not_move_following_code() {
        let (mut vm, proc) = vm_with_target();
        let sym = vm.sym_new_call();
        vm.sym_call_ref(sym).unwrap();
        // Code emitted after the reference must stay put
        vm.assemble(Instr::new(Op::Ret)).unwrap();
        let before = vm.procs().proc(proc).code().len();

        vm.sym_def_call(sym, 5).unwrap();
        vm.sym_resolve_all().unwrap();
        let code = vm.procs().proc(proc).code();
        assert_eq!(code.len(), before);
        let instrs = decode_all(code);
        assert_eq!(instrs[0].args[0], 5);
        assert_eq!(instrs[1].op, Op::Ret);
    }

    #[test]
    fn test_proc_head_fixup() {
        let (mut vm, proc) = vm_with_target();
        // Reserve the prologue before compiling the body
        let head = vm.sym_proc_head().unwrap();

        // "Compile" a body that uses 3 int registers and 2 int variables
        let mut ra = RegAlloc::new();
        ra.reg_occupy(RegClass::Int);
        ra.reg_occupy(RegClass::Int);
        ra.reg_occupy(RegClass::Int);
        ra.var_occupy(RegClass::Int, 1);
        ra.var_occupy(RegClass::Int, 1);

        vm.sym_def_proc_head(head, &ra.counts()).unwrap();
        vm.sym_resolve(head).unwrap();

        // Five `new*` instructions in canonical class order; only the int
        // one carries nonzero counts
        let instrs = decode_all(vm.procs().proc(proc).code());
        let expected = [
            (Op::NewC, 0, 0),
            (Op::NewI, 2, 3),
            (Op::NewR, 0, 0),
            (Op::NewP, 0, 0),
            (Op::NewO, 0, 0),
        ];
        assert_eq!(instrs.len(), expected.len());
        for (instr, (op, num_var, num_reg)) in
            instrs.iter().zip(expected.iter())
        {
            assert_eq!(instr.op, *op);
            assert_eq!(instr.args, [*num_var, *num_reg]);
        }
    }

    #[test]
    fn test_cond_jump_symbol() {
        let (mut vm, proc) = vm_with_target();
        let sym = vm.sym_new_cond_jump();
        vm.sym_cond_jump_ref(sym).unwrap();
        vm.sym_def_cond_jump(sym, proc, 12).unwrap();
        vm.sym_resolve_all().unwrap();
        let instrs = decode_all(vm.procs().proc(proc).code());
        assert_eq!(instrs[0].op, Op::Jc);
        assert_eq!(instrs[0].args[0], 12);
    }

    #[test]
    fn test_resolve_all_is_idempotent() {
        let (mut vm, proc) = vm_with_target();
        let sym = vm.sym_new_call();
        vm.sym_call_ref(sym).unwrap();
        vm.sym_def_call(sym, 3).unwrap();
        vm.sym_resolve_all().unwrap();
        let snapshot = vm.procs().proc(proc).code().to_vec();

        // A second pass resolves no additional references and changes no
        // code
        vm.sym_resolve_all().unwrap();
        assert_eq!(vm.procs().proc(proc).code(), &snapshot[..]);
        assert!(vm.syms().ref_check());
    }

    #[test]
    fn test_resolve_without_definition_is_deferred() {
        let (mut vm, _proc) = vm_with_target();
        let sym = vm.sym_new_call();
        vm.sym_call_ref(sym).unwrap();
        // Resolving an undefined symbol silently leaves it pending
        vm.sym_resolve(sym).unwrap();
        assert!(!vm.syms().ref_check());
        assert_eq!(vm.syms().ref_report().len(), 1);
    }

    #[test]
    fn test_symbol_names_are_unique() {
        let mut vm = Vm::new();
        let a = vm.sym_new_call();
        let b = vm.sym_new_call();
        vm.syms_mut().name_set(a, "print").unwrap();
        assert_eq!(
            vm.syms_mut().name_set(b, "print"),
            Err(LinkError::DuplicateName("print".to_owned()))
        );
        assert_eq!(
            vm.syms_mut().name_set(a, "other"),
            Err(LinkError::AlreadyNamed("print".to_owned()))
        );
        assert_eq!(vm.syms().lookup("print"), Some(a));
    }

    #[test]
    fn test_double_definition_fails() {
        let mut vm = Vm::new();
        let sym = vm.sym_new_call();
        vm.sym_def_call(sym, 1).unwrap();
        assert!(matches!(
            vm.sym_def_call(sym, 2),
            Err(LinkError::Redefinition(_))
        ));
    }

    #[test]
    fn test_label_backward_jump() {
        let (mut vm, proc) = vm_with_target();
        vm.assemble(Instr::new(Op::Ret)).unwrap();
        let label = vm.label_new_here();
        vm.assemble(Instr::new(Op::Ret)).unwrap();
        // Jump from position 2 back to position 1
        vm.label_jump(label, false).unwrap();

        let instrs = decode_all(vm.procs().proc(proc).code());
        assert_eq!(instrs[2].op, Op::Jmp);
        assert_eq!(instrs[2].args[0], -1);
    }

    #[test]
    fn test_label_forward_jump_is_patched() {
        let (mut vm, proc) = vm_with_target();
        let label = vm.label_new_undef();
        vm.label_jump(label, true).unwrap(); // at 0, 3 words long
        vm.label_jump(label, false).unwrap(); // at 3, 3 words long
        vm.assemble(Instr::new(Op::Ret)).unwrap(); // at 6
        vm.label_define_here(label).unwrap(); // position 7

        let instrs = decode_all(vm.procs().proc(proc).code());
        assert_eq!(instrs[0].op, Op::Jc);
        // Displacement equals target minus jump position
        assert_eq!(instrs[0].args[0], 7);
        assert_eq!(instrs[1].op, Op::Jmp);
        assert_eq!(instrs[1].args[0], 4);
    }

    #[test]
    fn test_label_from_foreign_procedure() {
        let (mut vm, _proc) = vm_with_target();
        let label = vm.label_new_here();
        let other = vm.procs_mut().code_new();
        vm.procs_mut().target_set(other).unwrap();
        assert_eq!(vm.label_jump(label, false), Err(LinkError::ForeignLabel));
    }

    #[test]
    fn test_label_destroy() {
        let (mut vm, _proc) = vm_with_target();
        let pending = vm.label_new_undef();
        vm.label_jump(pending, false).unwrap();
        assert_eq!(vm.label_destroy(pending), Err(LinkError::LabelInUse));
        vm.label_define_here(pending).unwrap();
        vm.label_destroy(pending).unwrap();
    }

    #[test]
    fn test_clib_stub_warns() {
        let (mut vm, _proc) = vm_with_target();
        let sym = vm.sym_new_call();
        vm.syms_mut().name_set(sym, "cos").unwrap();
        vm.sym_resolve_clibs(&["m".to_owned()]);
        assert_eq!(vm.warnings().len(), 1);
        assert!(vm.warnings()[0].contains("cos"));
    }
}
