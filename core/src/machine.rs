//! The virtual machine: global register banks, the data segment, the
//! reference-counted heap, and the fetch-decode-execute loop that runs
//! installed procedures.
//!
//! Every `call` builds a fresh frame whose local register banks start as a
//! single scratch slot (index 0) per class; the `new*` prologue
//! instructions size the real banks. Object values are `(block, offset)`
//! handles into the VM-owned heap rather than raw addresses; pointer-mode
//! operands add their displacement to the handle in local object register
//! 0. Several instructions follow the scratch conventions of the
//! instruction set: coercions leave their result in slot 0 of the result
//! class, `malloc` and `lea` leave the produced handle in `ro0`, `mcopy`
//! takes its length from `ri0`, and `jc` tests `ri0`.

use crate::{
    consts::{DATA_ITEM_SIGNATURE, MAX_CALL_DEPTH, WORD_SIZE},
    debug,
    error::{CodeError, ExecError, LinkError},
    instr::{self, ArgMode, Instr, Word},
    opcode::{DisasmShape, Op},
    proc::{CallNum, ProcBody, ProcTable},
    registers::{RegClass, RegCounts},
    symbol::{LabelTable, SymTable},
    typesys::Type,
};
use byteorder::{ByteOrder, LittleEndian};
use serde::Serialize;
use std::collections::HashMap;
use std::io;
use std::rc::Rc;

/// The heap block that backs the data segment; created with the VM, always
/// alive, addressed by global object register 0.
const DATA_BLOCK: usize = 1;

/// Bytes of the `(signature, type, size)` record in front of every data
/// segment item.
const DATA_HEADER: usize = 12;

/// A two-component point value.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

/// An object value: a handle to a heap block plus a byte offset into it.
/// Block 0 is the null handle.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ObjVal {
    pub block: usize,
    pub offset: i64,
}

impl ObjVal {
    pub fn is_null(self) -> bool {
        self.block == 0
    }

    fn displaced(self, displacement: i64) -> Self {
        Self {
            block: self.block,
            offset: self.offset + displacement,
        }
    }
}

/// A dynamically typed register value, used at the API boundary (global
/// inspection, CLI output).
#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
pub enum Value {
    Char(u8),
    Int(i64),
    Real(f64),
    Point(Point),
    Obj(ObjVal),
}

/// One class's register window: slots `min..=max` where negative slots are
/// variables, positive are registers and 0 is the scratch slot.
#[derive(Clone, Debug)]
struct RegWindow<T> {
    items: Vec<T>,
    min: i64,
}

impl<T: Copy + Default> RegWindow<T> {
    /// The default window: just the scratch slot.
    fn scratch() -> Self {
        Self {
            items: vec![T::default()],
            min: 0,
        }
    }

    fn alloc(num_var: i64, num_reg: i64) -> Self {
        Self {
            items: vec![T::default(); (num_var + num_reg + 1) as usize],
            min: -num_var,
        }
    }

    fn position(&self, index: i64) -> Option<usize> {
        let pos = index - self.min;
        if pos < 0 {
            None
        } else {
            Some(pos as usize)
        }
    }

    fn get(&self, index: i64) -> Option<T> {
        self.items.get(self.position(index)?).copied()
    }

    fn set(&mut self, index: i64, value: T) -> Option<()> {
        let pos = self.position(index)?;
        let slot = self.items.get_mut(pos)?;
        *slot = value;
        Some(())
    }
}

/// The five register banks of one scope (a frame or the global arena).
#[derive(Clone, Debug)]
struct Banks {
    chars: RegWindow<u8>,
    ints: RegWindow<i64>,
    reals: RegWindow<f64>,
    points: RegWindow<Point>,
    objs: RegWindow<ObjVal>,
}

impl Banks {
    fn scratch() -> Self {
        Self {
            chars: RegWindow::scratch(),
            ints: RegWindow::scratch(),
            reals: RegWindow::scratch(),
            points: RegWindow::scratch(),
            objs: RegWindow::scratch(),
        }
    }
}

/// The execution state of one procedure call.
#[derive(Clone, Debug)]
struct Frame {
    banks: Banks,
    /// Which classes the `new*` prologue has already sized
    allocated: [bool; 5],
    /// Source line recorded by the `line` instruction
    line: i64,
}

impl Frame {
    fn new() -> Self {
        Self {
            banks: Banks::scratch(),
            allocated: [false; 5],
            line: 0,
        }
    }
}

/// One reference-counted heap block. The `(type, refcount)` pair is the
/// header the allocator attaches to every object.
#[derive(Clone, Debug)]
struct Block {
    type_id: i32,
    refs: i64,
    data: Vec<u8>,
}

/// Execution statistics.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize)]
pub struct ExecStats {
    /// Instructions executed since the VM was created
    pub cycles: u64,
}

/// What an executed instruction asks the loop to do next.
enum Flow {
    Next,
    Relative(i64),
    Ret,
}

/// The virtual machine. Also the hub the front-end-facing subsystems hang
/// off: the procedure tables, the symbol/linker table and the label store
/// (their operations live in the `proc` and `symbol` modules).
pub struct Vm {
    pub(crate) procs: ProcTable,
    pub(crate) syms: SymTable,
    pub(crate) labels: LabelTable,
    globals: Banks,
    heap: crate::pool::Pool<Block>,
    /// `(object type, lifecycle sentinel) -> call number`
    methods: HashMap<(Type, Type), CallNum>,
    /// The object stack driven by `push`/`pop`
    stack: Vec<ObjVal>,
    stats: ExecStats,
    call_depth: usize,
    /// Assemble everything in long form
    force_long: bool,
    /// Disassembler: show hex code words next to the listing
    hexcode: bool,
    warnings: Vec<String>,
}

impl Vm {
    pub fn new() -> Self {
        let mut heap = crate::pool::Pool::new();
        let data_block = heap.occupy(Block {
            type_id: Type::NONE.raw(),
            refs: 1,
            data: Vec::new(),
        });
        assert_eq!(data_block, DATA_BLOCK);

        let mut globals = Banks::scratch();
        // The data segment is reachable from global object register 0
        globals
            .objs
            .set(
                0,
                ObjVal {
                    block: DATA_BLOCK,
                    offset: 0,
                },
            )
            .unwrap();

        Self {
            procs: ProcTable::new(),
            syms: SymTable::default(),
            labels: LabelTable::default(),
            globals,
            heap,
            methods: HashMap::new(),
            stack: Vec::new(),
            stats: ExecStats::default(),
            call_depth: 0,
            force_long: false,
            hexcode: false,
            warnings: Vec::new(),
        }
    }

    // ----- component access ------------------------------------------------

    pub fn procs(&self) -> &ProcTable {
        &self.procs
    }

    pub fn procs_mut(&mut self) -> &mut ProcTable {
        &mut self.procs
    }

    pub fn syms(&self) -> &SymTable {
        &self.syms
    }

    pub fn syms_mut(&mut self) -> &mut SymTable {
        &mut self.syms
    }

    pub fn stats(&self) -> ExecStats {
        self.stats
    }

    /// Warnings accumulated since creation. Warnings never affect control
    /// flow.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub(crate) fn warn(&mut self, message: String) {
        debug!(println!("warning: {}", message));
        self.warnings.push(message);
    }

    // ----- assembling ------------------------------------------------------

    /// Control the assembler: `force_long` makes every subsequent
    /// instruction take the long encoding (used while emitting code that
    /// will be patched later).
    pub fn asm_settings(&mut self, force_long: bool) -> bool {
        let previous = self.force_long;
        self.force_long = force_long;
        previous
    }

    /// Control the disassembler: `hexcode` adds a column with the raw code
    /// words.
    pub fn dasm_settings(&mut self, hexcode: bool) {
        self.hexcode = hexcode;
    }

    /// Encode one instruction at the end of the target procedure. Honors
    /// the target's inhibit flag and records errors against it.
    pub fn assemble(&mut self, instr: Instr) -> Result<usize, CodeError> {
        if self.procs.target().inhibit {
            return Ok(0);
        }
        let force_long = self.force_long;
        let target = self.procs.target_mut();
        match instr.write(target.code_mut(), force_long) {
            Ok(words) => Ok(words),
            Err(error) => {
                target.error = true;
                Err(error)
            }
        }
    }

    // ----- globals ---------------------------------------------------------

    /// Size the global register banks. Existing global values are
    /// discarded; global object register 0 keeps addressing the data
    /// segment. Conventionally, object globals 1..=3 are the current-box
    /// and argument slots of the language runtime.
    pub fn globals_alloc(&mut self, counts: &RegCounts) {
        let window = |class: RegClass| {
            (
                counts.num_var[class.index()] as i64,
                counts.num_reg[class.index()] as i64,
            )
        };
        let (nv, nr) = window(RegClass::Char);
        self.globals.chars = RegWindow::alloc(nv, nr);
        let (nv, nr) = window(RegClass::Int);
        self.globals.ints = RegWindow::alloc(nv, nr);
        let (nv, nr) = window(RegClass::Real);
        self.globals.reals = RegWindow::alloc(nv, nr);
        let (nv, nr) = window(RegClass::Point);
        self.globals.points = RegWindow::alloc(nv, nr);
        let (nv, nr) = window(RegClass::Obj);
        self.globals.objs = RegWindow::alloc(nv, nr);
        self.globals
            .objs
            .set(
                0,
                ObjVal {
                    block: DATA_BLOCK,
                    offset: 0,
                },
            )
            .unwrap();
    }

    /// Read one global register.
    pub fn global_get(
        &self,
        class: RegClass,
        index: i64,
    ) -> Result<Value, ExecError> {
        let missing = || ExecError::UnallocatedRegister {
            class,
            index: index as i32,
        };
        Ok(match class {
            RegClass::Char => {
                Value::Char(self.globals.chars.get(index).ok_or_else(missing)?)
            }
            RegClass::Int => {
                Value::Int(self.globals.ints.get(index).ok_or_else(missing)?)
            }
            RegClass::Real => {
                Value::Real(self.globals.reals.get(index).ok_or_else(missing)?)
            }
            RegClass::Point => Value::Point(
                self.globals.points.get(index).ok_or_else(missing)?,
            ),
            RegClass::Obj => {
                Value::Obj(self.globals.objs.get(index).ok_or_else(missing)?)
            }
        })
    }

    /// Write one global register. The value must match the class.
    pub fn global_set(
        &mut self,
        class: RegClass,
        index: i64,
        value: Value,
    ) -> Result<(), ExecError> {
        let stored = match (class, value) {
            (RegClass::Char, Value::Char(v)) => {
                self.globals.chars.set(index, v)
            }
            (RegClass::Int, Value::Int(v)) => self.globals.ints.set(index, v),
            (RegClass::Real, Value::Real(v)) => {
                self.globals.reals.set(index, v)
            }
            (RegClass::Point, Value::Point(v)) => {
                self.globals.points.set(index, v)
            }
            (RegClass::Obj, Value::Obj(v)) => self.globals.objs.set(index, v),
            _ => panic!("value class mismatch in global_set"),
        };
        stored.ok_or(ExecError::UnallocatedRegister {
            class,
            index: index as i32,
        })
    }

    // ----- data segment ----------------------------------------------------

    /// Append an item to the data segment and return the byte offset of
    /// its payload (usable as a pointer displacement from global object
    /// register 0). Every item is preceded by a `(signature, type, size)`
    /// record so the segment is self-describing.
    pub fn data_add(&mut self, type_id: Type, bytes: &[u8]) -> usize {
        let segment = &mut self
            .heap
            .get_mut(DATA_BLOCK)
            .expect("data segment missing")
            .data;
        let mut header = [0u8; DATA_HEADER];
        LittleEndian::write_u32(&mut header, DATA_ITEM_SIGNATURE);
        LittleEndian::write_i32(&mut header[4..], type_id.raw());
        LittleEndian::write_u32(&mut header[8..], bytes.len() as u32);
        segment.extend_from_slice(&header);
        let offset = segment.len();
        segment.extend_from_slice(bytes);
        offset
    }

    /// Walk the data segment headers and print one line per item.
    pub fn data_dump<W: io::Write>(&self, out: &mut W) -> io::Result<()> {
        let segment = &self.heap.get(DATA_BLOCK).expect("data segment").data;
        let mut pos = 0;
        while pos + DATA_HEADER <= segment.len() {
            let signature = LittleEndian::read_u32(&segment[pos..]);
            if signature != DATA_ITEM_SIGNATURE {
                writeln!(out, "{}\tcorrupt item header", pos)?;
                return Ok(());
            }
            let type_id = LittleEndian::read_i32(&segment[pos + 4..]);
            let size = LittleEndian::read_u32(&segment[pos + 8..]) as usize;
            writeln!(
                out,
                "{}\ttype={} size={}",
                pos + DATA_HEADER,
                type_id,
                size
            )?;
            pos += DATA_HEADER + size;
        }
        Ok(())
    }

    // ----- allocator methods -----------------------------------------------

    /// Register the procedure the allocator calls when a lifecycle event
    /// (`when` is one of the OPEN/CLOSE/PAUSE/DESTROY sentinels) hits an
    /// object of type `type_id`.
    pub fn method_set(&mut self, type_id: Type, when: Type, call: CallNum) {
        self.methods.insert((type_id, when), call);
    }

    pub fn method_get(&self, type_id: Type, when: Type) -> Option<CallNum> {
        self.methods.get(&(type_id, when)).copied()
    }

    // ----- link checking ---------------------------------------------------

    /// All outstanding link problems: unresolved symbol references and
    /// reserved call numbers that were never defined.
    pub fn link_check(&self) -> Vec<LinkError> {
        let mut problems = self.syms.ref_report();
        for call in self.procs.undefined_calls() {
            let name = self
                .procs
                .installed(call)
                .ok()
                .and_then(|p| p.name.clone())
                .unwrap_or_else(|| format!("#{}", call));
            problems.push(LinkError::Unresolved(name));
        }
        problems
    }

    // ----- execution -------------------------------------------------------

    /// Execute the installed procedure with the given call number.
    pub fn execute(&mut self, call_num: CallNum) -> Result<(), ExecError> {
        let body = match self.procs.installed(call_num) {
            Ok(installed) => installed.body.clone(),
            Err(_) => return Err(ExecError::UndefinedProcedure(call_num)),
        };
        match body {
            ProcBody::Undefined => Err(ExecError::UndefinedProcedure(call_num)),
            ProcBody::Host(host) => host(self),
            ProcBody::VmCode(code) => self.exec_code(&code),
        }
    }

    fn exec_code(&mut self, code: &Rc<[Word]>) -> Result<(), ExecError> {
        if self.call_depth >= MAX_CALL_DEPTH {
            return Err(ExecError::CallDepthExceeded);
        }
        self.call_depth += 1;
        let mut frame = Frame::new();
        let result = self.run(&mut frame, code);
        self.call_depth -= 1;
        result
    }

    fn run(&mut self, frame: &mut Frame, code: &[Word]) -> Result<(), ExecError> {
        let mut pos: usize = 0;
        while pos < code.len() {
            let decoded = instr::read(code, pos)?;
            self.stats.cycles += 1;
            debug!(println!(
                "exec {:?} at word {}",
                decoded.instr.op, pos
            ));
            let next = match self.exec_instr(frame, &decoded.instr)? {
                Flow::Next => pos as i64 + decoded.words as i64,
                Flow::Relative(displacement) => pos as i64 + displacement,
                Flow::Ret => return Ok(()),
            };
            if next < 0 || next as usize > code.len() {
                return Err(ExecError::JumpOutOfRange);
            }
            pos = next as usize;
        }
        // Falling off the end behaves like `ret`
        Ok(())
    }

    // ----- operand access --------------------------------------------------

    /// Resolve a pointer-mode operand into (block, start) for an access of
    /// `len` bytes, bounds-checked.
    fn mem_loc(
        &self,
        frame: &Frame,
        displacement: i64,
        len: usize,
    ) -> Result<(usize, usize), ExecError> {
        let base = frame.banks.objs.get(0).expect("missing obj scratch");
        self.obj_loc(frame, base.displaced(displacement), len)
    }

    /// Bounds-check an object handle for an access of `len` bytes.
    fn obj_loc(
        &self,
        frame: &Frame,
        obj: ObjVal,
        len: usize,
    ) -> Result<(usize, usize), ExecError> {
        if obj.is_null() {
            return Err(ExecError::NullObject { line: frame.line });
        }
        let block = self
            .heap
            .get(obj.block)
            .map_err(|_| ExecError::DanglingObject(obj.block))?;
        if obj.offset < 0 || obj.offset as usize + len > block.data.len() {
            return Err(ExecError::ObjectBounds {
                offset: obj.offset,
                length: block.data.len(),
            });
        }
        Ok((obj.block, obj.offset as usize))
    }

    fn mem_read(
        &self,
        frame: &Frame,
        displacement: i64,
        len: usize,
    ) -> Result<&[u8], ExecError> {
        let (block, start) = self.mem_loc(frame, displacement, len)?;
        Ok(&self.heap.get(block).unwrap().data[start..start + len])
    }

    fn mem_write(
        &mut self,
        frame: &Frame,
        displacement: i64,
        bytes: &[u8],
    ) -> Result<(), ExecError> {
        let (block, start) = self.mem_loc(frame, displacement, bytes.len())?;
        self.heap.get_mut(block).unwrap().data[start..start + bytes.len()]
            .copy_from_slice(bytes);
        Ok(())
    }

    fn unallocated(class: RegClass, index: i32) -> ExecError {
        ExecError::UnallocatedRegister { class, index }
    }

    fn get_char(
        &self,
        frame: &Frame,
        mode: ArgMode,
        v: i32,
    ) -> Result<u8, ExecError> {
        match mode {
            ArgMode::GlobalReg => self
                .globals
                .chars
                .get(v as i64)
                .ok_or_else(|| Self::unallocated(RegClass::Char, v)),
            ArgMode::LocalReg => frame
                .banks
                .chars
                .get(v as i64)
                .ok_or_else(|| Self::unallocated(RegClass::Char, v)),
            ArgMode::Ptr => Ok(self.mem_read(frame, v as i64, 1)?[0]),
            ArgMode::Imm => Ok(v as u8),
        }
    }

    fn set_char(
        &mut self,
        frame: &mut Frame,
        mode: ArgMode,
        v: i32,
        value: u8,
    ) -> Result<(), ExecError> {
        match mode {
            ArgMode::GlobalReg => self
                .globals
                .chars
                .set(v as i64, value)
                .ok_or_else(|| Self::unallocated(RegClass::Char, v)),
            ArgMode::LocalReg => frame
                .banks
                .chars
                .set(v as i64, value)
                .ok_or_else(|| Self::unallocated(RegClass::Char, v)),
            ArgMode::Ptr => self.mem_write(frame, v as i64, &[value]),
            ArgMode::Imm => Err(ExecError::NotAddressable),
        }
    }

    fn get_int(
        &self,
        frame: &Frame,
        mode: ArgMode,
        v: i32,
    ) -> Result<i64, ExecError> {
        match mode {
            ArgMode::GlobalReg => self
                .globals
                .ints
                .get(v as i64)
                .ok_or_else(|| Self::unallocated(RegClass::Int, v)),
            ArgMode::LocalReg => frame
                .banks
                .ints
                .get(v as i64)
                .ok_or_else(|| Self::unallocated(RegClass::Int, v)),
            ArgMode::Ptr => {
                Ok(LittleEndian::read_i64(self.mem_read(frame, v as i64, 8)?))
            }
            ArgMode::Imm => Ok(v as i64),
        }
    }

    fn set_int(
        &mut self,
        frame: &mut Frame,
        mode: ArgMode,
        v: i32,
        value: i64,
    ) -> Result<(), ExecError> {
        match mode {
            ArgMode::GlobalReg => self
                .globals
                .ints
                .set(v as i64, value)
                .ok_or_else(|| Self::unallocated(RegClass::Int, v)),
            ArgMode::LocalReg => frame
                .banks
                .ints
                .set(v as i64, value)
                .ok_or_else(|| Self::unallocated(RegClass::Int, v)),
            ArgMode::Ptr => {
                let mut bytes = [0u8; 8];
                LittleEndian::write_i64(&mut bytes, value);
                self.mem_write(frame, v as i64, &bytes)
            }
            ArgMode::Imm => Err(ExecError::NotAddressable),
        }
    }

    fn get_real(
        &self,
        frame: &Frame,
        mode: ArgMode,
        v: i32,
    ) -> Result<f64, ExecError> {
        match mode {
            ArgMode::GlobalReg => self
                .globals
                .reals
                .get(v as i64)
                .ok_or_else(|| Self::unallocated(RegClass::Real, v)),
            ArgMode::LocalReg => frame
                .banks
                .reals
                .get(v as i64)
                .ok_or_else(|| Self::unallocated(RegClass::Real, v)),
            ArgMode::Ptr => {
                Ok(LittleEndian::read_f64(self.mem_read(frame, v as i64, 8)?))
            }
            ArgMode::Imm => Err(ExecError::Code(CodeError::BadImmediate)),
        }
    }

    fn set_real(
        &mut self,
        frame: &mut Frame,
        mode: ArgMode,
        v: i32,
        value: f64,
    ) -> Result<(), ExecError> {
        match mode {
            ArgMode::GlobalReg => self
                .globals
                .reals
                .set(v as i64, value)
                .ok_or_else(|| Self::unallocated(RegClass::Real, v)),
            ArgMode::LocalReg => frame
                .banks
                .reals
                .set(v as i64, value)
                .ok_or_else(|| Self::unallocated(RegClass::Real, v)),
            ArgMode::Ptr => {
                let mut bytes = [0u8; 8];
                LittleEndian::write_f64(&mut bytes, value);
                self.mem_write(frame, v as i64, &bytes)
            }
            ArgMode::Imm => Err(ExecError::NotAddressable),
        }
    }

    fn get_point(
        &self,
        frame: &Frame,
        mode: ArgMode,
        v: i32,
    ) -> Result<Point, ExecError> {
        match mode {
            ArgMode::GlobalReg => self
                .globals
                .points
                .get(v as i64)
                .ok_or_else(|| Self::unallocated(RegClass::Point, v)),
            ArgMode::LocalReg => frame
                .banks
                .points
                .get(v as i64)
                .ok_or_else(|| Self::unallocated(RegClass::Point, v)),
            ArgMode::Ptr => {
                let bytes = self.mem_read(frame, v as i64, 16)?;
                Ok(Point {
                    x: LittleEndian::read_f64(&bytes[..8]),
                    y: LittleEndian::read_f64(&bytes[8..]),
                })
            }
            ArgMode::Imm => Err(ExecError::Code(CodeError::BadImmediate)),
        }
    }

    fn set_point(
        &mut self,
        frame: &mut Frame,
        mode: ArgMode,
        v: i32,
        value: Point,
    ) -> Result<(), ExecError> {
        match mode {
            ArgMode::GlobalReg => self
                .globals
                .points
                .set(v as i64, value)
                .ok_or_else(|| Self::unallocated(RegClass::Point, v)),
            ArgMode::LocalReg => frame
                .banks
                .points
                .set(v as i64, value)
                .ok_or_else(|| Self::unallocated(RegClass::Point, v)),
            ArgMode::Ptr => {
                let mut bytes = [0u8; 16];
                LittleEndian::write_f64(&mut bytes[..8], value.x);
                LittleEndian::write_f64(&mut bytes[8..], value.y);
                self.mem_write(frame, v as i64, &bytes)
            }
            ArgMode::Imm => Err(ExecError::NotAddressable),
        }
    }

    fn get_obj(
        &self,
        frame: &Frame,
        mode: ArgMode,
        v: i32,
    ) -> Result<ObjVal, ExecError> {
        match mode {
            ArgMode::GlobalReg => self
                .globals
                .objs
                .get(v as i64)
                .ok_or_else(|| Self::unallocated(RegClass::Obj, v)),
            ArgMode::LocalReg => frame
                .banks
                .objs
                .get(v as i64)
                .ok_or_else(|| Self::unallocated(RegClass::Obj, v)),
            ArgMode::Ptr => {
                let bytes = self.mem_read(frame, v as i64, 8)?;
                let packed = LittleEndian::read_u64(bytes);
                Ok(ObjVal {
                    block: (packed >> 32) as usize,
                    offset: i64::from(packed as u32 as i32),
                })
            }
            ArgMode::Imm => Err(ExecError::Code(CodeError::BadImmediate)),
        }
    }

    fn set_obj(
        &mut self,
        frame: &mut Frame,
        mode: ArgMode,
        v: i32,
        value: ObjVal,
    ) -> Result<(), ExecError> {
        match mode {
            ArgMode::GlobalReg => self
                .globals
                .objs
                .set(v as i64, value)
                .ok_or_else(|| Self::unallocated(RegClass::Obj, v)),
            ArgMode::LocalReg => frame
                .banks
                .objs
                .set(v as i64, value)
                .ok_or_else(|| Self::unallocated(RegClass::Obj, v)),
            ArgMode::Ptr => {
                let packed = ((value.block as u64) << 32)
                    | u64::from(value.offset as i32 as u32);
                let mut bytes = [0u8; 8];
                LittleEndian::write_u64(&mut bytes, packed);
                self.mem_write(frame, v as i64, &bytes)
            }
            ArgMode::Imm => Err(ExecError::NotAddressable),
        }
    }

    /// The address of a pointer-mode operand, for `lea` and the point
    /// component pointers. Register operands have no address.
    fn addr_of(
        &self,
        frame: &Frame,
        mode: ArgMode,
        v: i32,
        extra: i64,
    ) -> Result<ObjVal, ExecError> {
        if mode != ArgMode::Ptr {
            return Err(ExecError::NotAddressable);
        }
        let base = frame.banks.objs.get(0).expect("missing obj scratch");
        Ok(base.displaced(v as i64 + extra))
    }

    // ----- the dispatcher --------------------------------------------------

    #[allow(clippy::cognitive_complexity)]
    fn exec_instr(
        &mut self,
        frame: &mut Frame,
        instr: &Instr,
    ) -> Result<Flow, ExecError> {
        let (m1, m2) = (instr.arg_modes[0], instr.arg_modes[1]);
        let (a1, a2) = (instr.args[0], instr.args[1]);

        match instr.op {
            Op::Line => {
                frame.line = self.get_int(frame, m1, a1)?;
            }
            Op::Call => {
                let call_num = self.get_int(frame, m1, a1)?;
                self.execute(call_num as CallNum)?;
            }

            Op::NewC | Op::NewI | Op::NewR | Op::NewP | Op::NewO => {
                let class = match instr.op {
                    Op::NewC => RegClass::Char,
                    Op::NewI => RegClass::Int,
                    Op::NewR => RegClass::Real,
                    Op::NewP => RegClass::Point,
                    _ => RegClass::Obj,
                };
                if frame.allocated[class.index()] {
                    return Err(ExecError::AlreadyAllocated { class });
                }
                let num_var = self.get_int(frame, m1, a1)?.max(0);
                let num_reg = self.get_int(frame, m2, a2)?.max(0);
                match class {
                    RegClass::Char => {
                        frame.banks.chars = RegWindow::alloc(num_var, num_reg)
                    }
                    RegClass::Int => {
                        frame.banks.ints = RegWindow::alloc(num_var, num_reg)
                    }
                    RegClass::Real => {
                        frame.banks.reals = RegWindow::alloc(num_var, num_reg)
                    }
                    RegClass::Point => {
                        frame.banks.points = RegWindow::alloc(num_var, num_reg)
                    }
                    RegClass::Obj => {
                        frame.banks.objs = RegWindow::alloc(num_var, num_reg)
                    }
                }
                frame.allocated[class.index()] = true;
            }

            Op::MovC => {
                let value = self.get_char(frame, m2, a2)?;
                self.set_char(frame, m1, a1, value)?;
            }
            Op::MovI => {
                let value = self.get_int(frame, m2, a2)?;
                self.set_int(frame, m1, a1, value)?;
            }
            Op::MovR => {
                let value = self.get_real(frame, m2, a2)?;
                self.set_real(frame, m1, a1, value)?;
            }
            Op::MovP => {
                let value = self.get_point(frame, m2, a2)?;
                self.set_point(frame, m1, a1, value)?;
            }
            Op::MovO => {
                let value = self.get_obj(frame, m2, a2)?;
                self.set_obj(frame, m1, a1, value)?;
            }
            Op::MovRImm => {
                let value = instr
                    .data_real()
                    .ok_or(ExecError::Code(CodeError::BadImmediate))?;
                self.set_real(frame, m1, a1, value)?;
            }
            Op::MovPImm => {
                let (x, y) = instr
                    .data_point()
                    .ok_or(ExecError::Code(CodeError::BadImmediate))?;
                self.set_point(frame, m1, a1, Point { x, y })?;
            }

            Op::BNot => {
                let value = self.get_int(frame, m1, a1)?;
                self.set_int(frame, m1, a1, !value)?;
            }
            Op::BAnd | Op::BXor | Op::BOr | Op::Shl | Op::Shr => {
                let lhs = self.get_int(frame, m1, a1)?;
                let rhs = self.get_int(frame, m2, a2)?;
                let value = match instr.op {
                    Op::BAnd => lhs & rhs,
                    Op::BXor => lhs ^ rhs,
                    Op::BOr => lhs | rhs,
                    Op::Shl => lhs.wrapping_shl(rhs as u32),
                    _ => lhs.wrapping_shr(rhs as u32),
                };
                self.set_int(frame, m1, a1, value)?;
            }

            Op::IncI | Op::DecI => {
                let delta = if instr.op == Op::IncI { 1 } else { -1 };
                let value = self.get_int(frame, m1, a1)?.wrapping_add(delta);
                self.set_int(frame, m1, a1, value)?;
            }
            Op::IncR | Op::DecR => {
                let delta = if instr.op == Op::IncR { 1.0 } else { -1.0 };
                let value = self.get_real(frame, m1, a1)? + delta;
                self.set_real(frame, m1, a1, value)?;
            }

            Op::PowI => {
                let base = self.get_int(frame, m1, a1)?;
                let exp = self.get_int(frame, m2, a2)?;
                let value = if exp <= 0 {
                    1
                } else {
                    let mut acc: i64 = 1;
                    for _ in 0..exp {
                        acc = acc.wrapping_mul(base);
                    }
                    acc
                };
                self.set_int(frame, m1, a1, value)?;
            }
            Op::PowR => {
                let base = self.get_real(frame, m1, a1)?;
                let exp = self.get_real(frame, m2, a2)?;
                self.set_real(frame, m1, a1, base.powf(exp))?;
            }

            Op::AddI | Op::SubI | Op::MulI => {
                let lhs = self.get_int(frame, m1, a1)?;
                let rhs = self.get_int(frame, m2, a2)?;
                let value = match instr.op {
                    Op::AddI => lhs.wrapping_add(rhs),
                    Op::SubI => lhs.wrapping_sub(rhs),
                    _ => lhs.wrapping_mul(rhs),
                };
                self.set_int(frame, m1, a1, value)?;
            }
            Op::DivI | Op::RemI => {
                let lhs = self.get_int(frame, m1, a1)?;
                let rhs = self.get_int(frame, m2, a2)?;
                if rhs == 0 {
                    return Err(ExecError::DivideByZero { line: frame.line });
                }
                let value = if instr.op == Op::DivI {
                    lhs.wrapping_div(rhs)
                } else {
                    lhs.wrapping_rem(rhs)
                };
                self.set_int(frame, m1, a1, value)?;
            }
            Op::AddR | Op::SubR | Op::MulR | Op::DivR => {
                let lhs = self.get_real(frame, m1, a1)?;
                let rhs = self.get_real(frame, m2, a2)?;
                let value = match instr.op {
                    Op::AddR => lhs + rhs,
                    Op::SubR => lhs - rhs,
                    Op::MulR => lhs * rhs,
                    _ => lhs / rhs,
                };
                self.set_real(frame, m1, a1, value)?;
            }
            Op::AddP | Op::SubP => {
                let lhs = self.get_point(frame, m1, a1)?;
                let rhs = self.get_point(frame, m2, a2)?;
                let value = if instr.op == Op::AddP {
                    Point {
                        x: lhs.x + rhs.x,
                        y: lhs.y + rhs.y,
                    }
                } else {
                    Point {
                        x: lhs.x - rhs.x,
                        y: lhs.y - rhs.y,
                    }
                };
                self.set_point(frame, m1, a1, value)?;
            }

            Op::NegI => {
                let value = self.get_int(frame, m1, a1)?;
                self.set_int(frame, m1, a1, value.wrapping_neg())?;
            }
            Op::NegR => {
                let value = self.get_real(frame, m1, a1)?;
                self.set_real(frame, m1, a1, -value)?;
            }
            Op::NegP => {
                let value = self.get_point(frame, m1, a1)?;
                self.set_point(
                    frame,
                    m1,
                    a1,
                    Point {
                        x: -value.x,
                        y: -value.y,
                    },
                )?;
            }
            Op::PMulR | Op::PDivR => {
                let point = self.get_point(frame, m1, a1)?;
                let factor =
                    frame.banks.reals.get(0).expect("missing real scratch");
                let value = if instr.op == Op::PMulR {
                    Point {
                        x: point.x * factor,
                        y: point.y * factor,
                    }
                } else {
                    Point {
                        x: point.x / factor,
                        y: point.y / factor,
                    }
                };
                self.set_point(frame, m1, a1, value)?;
            }

            // Int comparisons write their result over the first operand
            Op::EqI | Op::NeI | Op::LtI | Op::LeI | Op::GtI | Op::GeI => {
                let lhs = self.get_int(frame, m1, a1)?;
                let rhs = self.get_int(frame, m2, a2)?;
                let value = match instr.op {
                    Op::EqI => lhs == rhs,
                    Op::NeI => lhs != rhs,
                    Op::LtI => lhs < rhs,
                    Op::LeI => lhs <= rhs,
                    Op::GtI => lhs > rhs,
                    _ => lhs >= rhs,
                };
                self.set_int(frame, m1, a1, value as i64)?;
            }
            // Real and point comparisons leave their result in `ri0`
            Op::EqR | Op::NeR | Op::LtR | Op::LeR | Op::GtR | Op::GeR => {
                let lhs = self.get_real(frame, m1, a1)?;
                let rhs = self.get_real(frame, m2, a2)?;
                let value = match instr.op {
                    Op::EqR => lhs == rhs,
                    Op::NeR => lhs != rhs,
                    Op::LtR => lhs < rhs,
                    Op::LeR => lhs <= rhs,
                    Op::GtR => lhs > rhs,
                    _ => lhs >= rhs,
                };
                frame.banks.ints.set(0, value as i64);
            }
            Op::EqP | Op::NeP => {
                let lhs = self.get_point(frame, m1, a1)?;
                let rhs = self.get_point(frame, m2, a2)?;
                let value = if instr.op == Op::EqP {
                    lhs == rhs
                } else {
                    lhs != rhs
                };
                frame.banks.ints.set(0, value as i64);
            }

            Op::LNot => {
                let value = self.get_int(frame, m1, a1)?;
                self.set_int(frame, m1, a1, (value == 0) as i64)?;
            }
            Op::LAnd | Op::LOr => {
                let lhs = self.get_int(frame, m1, a1)?;
                let rhs = self.get_int(frame, m2, a2)?;
                let value = if instr.op == Op::LAnd {
                    lhs != 0 && rhs != 0
                } else {
                    lhs != 0 || rhs != 0
                };
                self.set_int(frame, m1, a1, value as i64)?;
            }

            // Coercions land in the scratch slot of the result class
            Op::RealC => {
                let value = self.get_char(frame, m1, a1)?;
                frame.banks.reals.set(0, f64::from(value));
            }
            Op::RealI => {
                let value = self.get_int(frame, m1, a1)?;
                frame.banks.reals.set(0, value as f64);
            }
            Op::IntgR => {
                let value = self.get_real(frame, m1, a1)?;
                frame.banks.ints.set(0, value as i64);
            }
            Op::PointI => {
                let x = self.get_int(frame, m1, a1)?;
                let y = self.get_int(frame, m2, a2)?;
                frame.banks.points.set(
                    0,
                    Point {
                        x: x as f64,
                        y: y as f64,
                    },
                );
            }
            Op::PointR => {
                let x = self.get_real(frame, m1, a1)?;
                let y = self.get_real(frame, m2, a2)?;
                frame.banks.points.set(0, Point { x, y });
            }
            Op::ProjX | Op::ProjY => {
                let value = self.get_point(frame, m1, a1)?;
                let component = if instr.op == Op::ProjX {
                    value.x
                } else {
                    value.y
                };
                frame.banks.reals.set(0, component);
            }
            Op::PPtrX | Op::PPtrY => {
                let extra = if instr.op == Op::PPtrX { 0 } else { 8 };
                let addr = self.addr_of(frame, m1, a1, extra)?;
                frame.banks.objs.set(0, addr);
            }

            Op::Ret => return Ok(Flow::Ret),

            Op::Malloc => {
                let size = self.get_int(frame, m1, a1)?.max(0) as usize;
                let type_id = self.get_int(frame, m2, a2)?;
                let block = self.heap.occupy(Block {
                    type_id: type_id as i32,
                    refs: 1,
                    data: vec![0; size],
                });
                frame.banks.objs.set(0, ObjVal { block, offset: 0 });
            }
            Op::MFree => {
                let obj = self.get_obj(frame, m1, a1)?;
                self.heap
                    .release(obj.block)
                    .map_err(|_| ExecError::DanglingObject(obj.block))?;
            }
            Op::MCopy => {
                let dest = self.get_obj(frame, m1, a1)?;
                let src = self.get_obj(frame, m2, a2)?;
                let len = frame
                    .banks
                    .ints
                    .get(0)
                    .expect("missing int scratch")
                    .max(0) as usize;
                let (src_block, src_start) = self.obj_loc(frame, src, len)?;
                let (dest_block, dest_start) = self.obj_loc(frame, dest, len)?;
                let bytes = self.heap.get(src_block).unwrap().data
                    [src_start..src_start + len]
                    .to_vec();
                self.heap.get_mut(dest_block).unwrap().data
                    [dest_start..dest_start + len]
                    .copy_from_slice(&bytes);
            }
            Op::Link => {
                let obj = self.get_obj(frame, m1, a1)?;
                self.heap
                    .get_mut(obj.block)
                    .map_err(|_| ExecError::DanglingObject(obj.block))?
                    .refs += 1;
            }
            Op::Unlink => {
                let obj = self.get_obj(frame, m1, a1)?;
                self.unlink(obj)?;
            }

            Op::LeaC | Op::LeaI | Op::LeaR | Op::LeaP => {
                let addr = self.addr_of(frame, m1, a1, 0)?;
                frame.banks.objs.set(0, addr);
            }
            Op::LeaO => {
                let addr = self.addr_of(frame, m2, a2, 0)?;
                self.set_obj(frame, m1, a1, addr)?;
            }

            Op::Push => {
                let obj = self.get_obj(frame, m1, a1)?;
                self.stack.push(obj);
            }
            Op::Pop => {
                let obj = self.stack.pop().ok_or(ExecError::EmptyStack)?;
                self.set_obj(frame, m1, a1, obj)?;
            }

            Op::Jmp => {
                let displacement = self.get_int(frame, m1, a1)?;
                return Ok(Flow::Relative(displacement));
            }
            Op::Jc => {
                let displacement = self.get_int(frame, m1, a1)?;
                let condition =
                    frame.banks.ints.get(0).expect("missing int scratch");
                if condition != 0 {
                    return Ok(Flow::Relative(displacement));
                }
            }
        }
        Ok(Flow::Next)
    }

    /// Drop one reference to an object. At zero the destructor method
    /// registered for the object's type runs (with the object in global
    /// object register 1, the current-box convention) and the block is
    /// freed.
    fn unlink(&mut self, obj: ObjVal) -> Result<(), ExecError> {
        let (refs, type_id) = {
            let block = self
                .heap
                .get_mut(obj.block)
                .map_err(|_| ExecError::DanglingObject(obj.block))?;
            block.refs -= 1;
            (block.refs, block.type_id)
        };
        if refs > 0 {
            return Ok(());
        }
        if let Some(call) =
            self.method_get(Type::from_raw(type_id), Type::DESTROY)
        {
            let whole = ObjVal {
                block: obj.block,
                offset: 0,
            };
            self.globals.objs.set(1, whole);
            self.execute(call)?;
        }
        self.heap
            .release(obj.block)
            .map_err(|_| ExecError::DanglingObject(obj.block))?;
        Ok(())
    }

    // ----- disassembling ---------------------------------------------------

    /// Disassemble a code region: one line per instruction with its byte
    /// position, optionally the raw code words, the mnemonic and the
    /// rendered operands. Undecodable words are reported and skipped one
    /// word at a time.
    pub fn disassemble<W: io::Write>(
        &self,
        code: &[Word],
        out: &mut W,
    ) -> io::Result<()> {
        let mut pos = 0;
        while pos < code.len() {
            match instr::read(code, pos) {
                Err(_) => {
                    writeln!(
                        out,
                        "{}\t{:08x}\tError!",
                        pos * WORD_SIZE,
                        code[pos]
                    )?;
                    pos += 1;
                }
                Ok(decoded) => {
                    write!(out, "{}\t", pos * WORD_SIZE)?;
                    if self.hexcode {
                        write!(out, "{:08x}\t", code[pos])?;
                    }
                    write!(out, "{}", decoded.instr.op.name())?;
                    let operands = self.render_operands(&decoded.instr, pos);
                    if !operands.is_empty() {
                        write!(out, " {}", operands.join(", "))?;
                    }
                    writeln!(out)?;
                    if self.hexcode {
                        for word in &code[pos + 1..pos + decoded.words] {
                            writeln!(out, "\t{:08x}", word)?;
                        }
                    }
                    pos += decoded.words;
                }
            }
        }
        Ok(())
    }

    /// Render the operand list of one decoded instruction, applying the
    /// special `call` and jump printers.
    fn render_operands(&self, instr: &Instr, pos: usize) -> Vec<String> {
        let desc = instr.op.desc();
        let mut operands = Vec::new();
        for i in 0..instr.num_args {
            let mode = instr.arg_modes[i];
            let value = instr.args[i];
            let rendered = match (desc.disasm, mode) {
                (DisasmShape::Call, ArgMode::Imm) => {
                    let call_num = value as u32;
                    match self
                        .procs
                        .installed(call_num)
                        .ok()
                        .and_then(|p| p.name.as_deref())
                    {
                        Some(name) => format!("{}('{}')", value, name),
                        None => format!("{}", value),
                    }
                }
                (DisasmShape::Jump, ArgMode::Imm) => {
                    // Print the absolute byte target, not the displacement
                    let target = (pos as i64 + i64::from(value))
                        * WORD_SIZE as i64;
                    format!("{}", target)
                }
                _ => instr::format_operand(mode, value, desc.class),
            };
            operands.push(rendered);
        }
        if let Some(payload) = instr::format_data(instr) {
            operands.push(payload);
        }
        operands
    }

    /// Disassemble one installed procedure, with its metadata banner.
    pub fn disassemble_installed<W: io::Write>(
        &self,
        call_num: CallNum,
        out: &mut W,
    ) -> io::Result<()> {
        let installed = match self.procs.installed(call_num) {
            Ok(installed) => installed,
            Err(_) => {
                writeln!(out, "procedure {} is not installed", call_num)?;
                return Ok(());
            }
        };
        writeln!(out, "----------------------------------------")?;
        writeln!(out, "Procedure number: {}", call_num)?;
        writeln!(
            out,
            "Name: {}",
            installed
                .name
                .as_deref()
                .map(|n| format!("'{}'", n))
                .unwrap_or_else(|| "(undefined)".to_owned())
        )?;
        writeln!(
            out,
            "Description: {}",
            installed
                .desc
                .as_deref()
                .map(|d| format!("'{}'", d))
                .unwrap_or_else(|| "(undefined)".to_owned())
        )?;
        match &installed.body {
            ProcBody::VmCode(code) => {
                writeln!(out, "Type: VM code")?;
                let code = Rc::clone(code);
                self.disassemble(&code, out)?;
            }
            ProcBody::Host(_) => writeln!(out, "Type: host function")?,
            ProcBody::Undefined => writeln!(out, "Type: undefined")?,
        }
        Ok(())
    }

    /// Disassemble the whole installed table.
    pub fn disassemble_all<W: io::Write>(
        &self,
        out: &mut W,
    ) -> io::Result<()> {
        for call_num in 1..=self.procs.installed_count() as CallNum {
            self.disassemble_installed(call_num, out)?;
        }
        Ok(())
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Set up a VM with global int/real/obj registers and a fresh target
    /// procedure.
    fn vm_for_exec() -> Vm {
        let mut vm = Vm::new();
        let mut counts = RegCounts::default();
        counts.num_reg = [2, 4, 2, 2, 4];
        counts.num_var = [0, 2, 0, 0, 0];
        vm.globals_alloc(&counts);
        let proc = vm.procs_mut().code_new();
        vm.procs_mut().target_set(proc).unwrap();
        vm
    }

    fn emit(vm: &mut Vm, instr: Instr) {
        vm.assemble(instr).unwrap();
    }

    /// Install the current target procedure and return its call number.
    fn install(vm: &mut Vm, name: &str) -> CallNum {
        let target = vm.procs().target_get();
        vm.procs_mut().install_code(target, name, "test procedure")
    }

    fn global_int(vm: &Vm, index: i64) -> i64 {
        match vm.global_get(RegClass::Int, index).unwrap() {
            Value::Int(value) => value,
            other => panic!("unexpected value {:?}", other),
        }
    }

    #[test]
    fn test_arithmetic_on_globals() {
        let mut vm = vm_for_exec();
        emit(
            &mut vm,
            Instr::new(Op::MovI)
                .arg(ArgMode::GlobalReg, 1)
                .arg(ArgMode::Imm, 21),
        );
        emit(
            &mut vm,
            Instr::new(Op::MovI)
                .arg(ArgMode::GlobalReg, 2)
                .arg(ArgMode::Imm, 2),
        );
        emit(
            &mut vm,
            Instr::new(Op::MulI)
                .arg(ArgMode::GlobalReg, 1)
                .arg(ArgMode::GlobalReg, 2),
        );
        emit(&mut vm, Instr::new(Op::Ret));
        let call = install(&mut vm, "main");
        vm.execute(call).unwrap();
        assert_eq!(global_int(&vm, 1), 42);
        assert!(vm.stats().cycles >= 4);
    }

    #[test]
    fn test_local_frame_prologue() {
        let mut vm = vm_for_exec();
        // newI 1, 2 sizes the int bank; vi1 and ri2 become usable
        emit(
            &mut vm,
            Instr::new(Op::NewI)
                .arg(ArgMode::Imm, 1)
                .arg(ArgMode::Imm, 2),
        );
        emit(
            &mut vm,
            Instr::new(Op::MovI)
                .arg(ArgMode::LocalReg, -1)
                .arg(ArgMode::Imm, 30),
        );
        emit(
            &mut vm,
            Instr::new(Op::MovI)
                .arg(ArgMode::LocalReg, 2)
                .arg(ArgMode::Imm, 12),
        );
        emit(
            &mut vm,
            Instr::new(Op::AddI)
                .arg(ArgMode::LocalReg, -1)
                .arg(ArgMode::LocalReg, 2),
        );
        emit(
            &mut vm,
            Instr::new(Op::MovI)
                .arg(ArgMode::GlobalReg, 1)
                .arg(ArgMode::LocalReg, -1),
        );
        emit(&mut vm, Instr::new(Op::Ret));
        let call = install(&mut vm, "locals");
        vm.execute(call).unwrap();
        assert_eq!(global_int(&vm, 1), 42);
    }

    #[test]
    fn test_unallocated_local_is_an_error() {
        let mut vm = vm_for_exec();
        emit(
            &mut vm,
            Instr::new(Op::MovI)
                .arg(ArgMode::LocalReg, 3)
                .arg(ArgMode::Imm, 1),
        );
        let call = install(&mut vm, "bad");
        assert!(matches!(
            vm.execute(call),
            Err(ExecError::UnallocatedRegister {
                class: RegClass::Int,
                index: 3
            })
        ));
    }

    #[test]
    fn test_division_by_zero() {
        let mut vm = vm_for_exec();
        emit(
            &mut vm,
            Instr::new(Op::Line).arg(ArgMode::Imm, 12),
        );
        emit(
            &mut vm,
            Instr::new(Op::MovI)
                .arg(ArgMode::GlobalReg, 1)
                .arg(ArgMode::Imm, 5),
        );
        emit(
            &mut vm,
            Instr::new(Op::DivI)
                .arg(ArgMode::GlobalReg, 1)
                .arg(ArgMode::Imm, 0),
        );
        let call = install(&mut vm, "divzero");
        assert_eq!(
            vm.execute(call),
            Err(ExecError::DivideByZero { line: 12 })
        );
    }

    #[test]
    fn test_conditional_loop() {
        let mut vm = vm_for_exec();
        // gri1 = 0; gri2 = 5; do { gri1 += 3; gri2 -= 1; ri0 = gri2 } while
        // ri0 != 0
        emit(
            &mut vm,
            Instr::new(Op::MovI)
                .arg(ArgMode::GlobalReg, 1)
                .arg(ArgMode::Imm, 0),
        );
        emit(
            &mut vm,
            Instr::new(Op::MovI)
                .arg(ArgMode::GlobalReg, 2)
                .arg(ArgMode::Imm, 5),
        );
        let top = vm.label_new_here();
        emit(
            &mut vm,
            Instr::new(Op::AddI)
                .arg(ArgMode::GlobalReg, 1)
                .arg(ArgMode::Imm, 3),
        );
        emit(
            &mut vm,
            Instr::new(Op::DecI).arg(ArgMode::GlobalReg, 2),
        );
        emit(
            &mut vm,
            Instr::new(Op::MovI)
                .arg(ArgMode::LocalReg, 0)
                .arg(ArgMode::GlobalReg, 2),
        );
        vm.label_jump(top, true).unwrap();
        emit(&mut vm, Instr::new(Op::Ret));

        let call = install(&mut vm, "loop");
        vm.execute(call).unwrap();
        assert_eq!(global_int(&vm, 1), 15);
        assert_eq!(global_int(&vm, 2), 0);
    }

    #[test]
    fn test_call_host_procedure() {
        fn set_flag(vm: &mut Vm) -> Result<(), ExecError> {
            vm.global_set(RegClass::Int, 3, Value::Int(99))
        }

        let mut vm = vm_for_exec();
        let host = vm.procs_mut().install_host(set_flag, "set_flag", "");
        emit(
            &mut vm,
            Instr::new(Op::Call).arg(ArgMode::Imm, host as i32),
        );
        emit(&mut vm, Instr::new(Op::Ret));
        let call = install(&mut vm, "calls_host");
        vm.execute(call).unwrap();
        assert_eq!(global_int(&vm, 3), 99);
    }

    #[test]
    fn test_call_undefined_procedure() {
        let mut vm = vm_for_exec();
        emit(&mut vm, Instr::new(Op::Call).arg(ArgMode::Imm, 77));
        let call = install(&mut vm, "broken");
        assert_eq!(
            vm.execute(call),
            Err(ExecError::UndefinedProcedure(77))
        );

        let reserved = vm.procs_mut().install_undefined("later");
        assert_eq!(
            vm.execute(reserved),
            Err(ExecError::UndefinedProcedure(reserved))
        );
    }

    #[test]
    fn test_heap_roundtrip_through_pointers() {
        let mut vm = vm_for_exec();
        // malloc 16 bytes of type 0; stash the handle in gro1; write 7
        // through a pointer and read it back into gri1
        emit(
            &mut vm,
            Instr::new(Op::Malloc)
                .arg(ArgMode::Imm, 16)
                .arg(ArgMode::Imm, 0),
        );
        emit(
            &mut vm,
            Instr::new(Op::MovO)
                .arg(ArgMode::GlobalReg, 1)
                .arg(ArgMode::LocalReg, 0),
        );
        emit(
            &mut vm,
            Instr::new(Op::MovI)
                .arg(ArgMode::Ptr, 8)
                .arg(ArgMode::Imm, 7),
        );
        emit(
            &mut vm,
            Instr::new(Op::MovI)
                .arg(ArgMode::GlobalReg, 1)
                .arg(ArgMode::Ptr, 8),
        );
        emit(&mut vm, Instr::new(Op::Ret));
        let call = install(&mut vm, "heap");
        vm.execute(call).unwrap();
        assert_eq!(global_int(&vm, 1), 7);

        // The block survives the frame; the handle is in gro1
        match vm.global_get(RegClass::Obj, 1).unwrap() {
            Value::Obj(obj) => assert!(vm.heap.contains(obj.block)),
            other => panic!("unexpected value {:?}", other),
        }
    }

    #[test]
    fn test_unlink_runs_destructor_and_frees() {
        fn destructor(vm: &mut Vm) -> Result<(), ExecError> {
            vm.global_set(RegClass::Int, 4, Value::Int(1))
        }

        let mut vm = vm_for_exec();
        let dtor = vm.procs_mut().install_host(destructor, "destroy", "");
        vm.method_set(Type::from_raw(300), Type::DESTROY, dtor);

        // malloc with type 300, link once, then unlink twice
        emit(
            &mut vm,
            Instr::new(Op::Malloc)
                .arg(ArgMode::Imm, 8)
                .arg(ArgMode::Imm, 300),
        );
        emit(
            &mut vm,
            Instr::new(Op::MovO)
                .arg(ArgMode::GlobalReg, 2)
                .arg(ArgMode::LocalReg, 0),
        );
        emit(
            &mut vm,
            Instr::new(Op::Link).arg(ArgMode::LocalReg, 0),
        );
        emit(
            &mut vm,
            Instr::new(Op::Unlink).arg(ArgMode::LocalReg, 0),
        );
        emit(&mut vm, Instr::new(Op::Ret));
        let call = install(&mut vm, "alloc");
        vm.execute(call).unwrap();

        // One reference left, the destructor has not run yet
        let obj = match vm.global_get(RegClass::Obj, 2).unwrap() {
            Value::Obj(obj) => obj,
            other => panic!("unexpected value {:?}", other),
        };
        assert!(vm.heap.contains(obj.block));
        assert_eq!(global_int(&vm, 4), 0);

        // Drop the last reference from a second procedure
        let target = vm.procs_mut().code_new();
        vm.procs_mut().target_set(target).unwrap();
        emit(
            &mut vm,
            Instr::new(Op::Unlink).arg(ArgMode::GlobalReg, 2),
        );
        emit(&mut vm, Instr::new(Op::Ret));
        let drop_call = install(&mut vm, "drop");
        vm.execute(drop_call).unwrap();
        assert_eq!(global_int(&vm, 4), 1);
        assert!(!vm.heap.contains(obj.block));
    }

    #[test]
    fn test_push_pop_and_lea() {
        let mut vm = vm_for_exec();
        emit(
            &mut vm,
            Instr::new(Op::Malloc)
                .arg(ArgMode::Imm, 24)
                .arg(ArgMode::Imm, 0),
        );
        // Push the fresh handle, pop it into gro2
        emit(&mut vm, Instr::new(Op::Push).arg(ArgMode::LocalReg, 0));
        emit(&mut vm, Instr::new(Op::Pop).arg(ArgMode::GlobalReg, 2));
        // lea gro3, i[ro0+16]: interior pointer
        emit(
            &mut vm,
            Instr::new(Op::LeaO)
                .arg(ArgMode::GlobalReg, 3)
                .arg(ArgMode::Ptr, 16),
        );
        emit(&mut vm, Instr::new(Op::Ret));
        let call = install(&mut vm, "stack");
        vm.execute(call).unwrap();

        let base = match vm.global_get(RegClass::Obj, 2).unwrap() {
            Value::Obj(obj) => obj,
            other => panic!("unexpected value {:?}", other),
        };
        let interior = match vm.global_get(RegClass::Obj, 3).unwrap() {
            Value::Obj(obj) => obj,
            other => panic!("unexpected value {:?}", other),
        };
        assert_eq!(interior.block, base.block);
        assert_eq!(interior.offset, base.offset + 16);
    }

    #[test]
    fn test_pop_from_empty_stack() {
        let mut vm = vm_for_exec();
        emit(&mut vm, Instr::new(Op::Pop).arg(ArgMode::GlobalReg, 2));
        let call = install(&mut vm, "underflow");
        assert_eq!(vm.execute(call), Err(ExecError::EmptyStack));
    }

    #[test]
    fn test_data_segment_access() {
        let mut vm = vm_for_exec();
        let mut payload = [0u8; 8];
        LittleEndian::write_i64(&mut payload, 1234);
        let offset = vm.data_add(Type::INT, &payload);

        // mov ro0, gro0; mov gri1, i[ro0+offset]
        emit(
            &mut vm,
            Instr::new(Op::MovO)
                .arg(ArgMode::LocalReg, 0)
                .arg(ArgMode::GlobalReg, 0),
        );
        emit(
            &mut vm,
            Instr::new(Op::MovI)
                .arg(ArgMode::GlobalReg, 1)
                .arg(ArgMode::Ptr, offset as i32),
        );
        emit(&mut vm, Instr::new(Op::Ret));
        let call = install(&mut vm, "data");
        vm.execute(call).unwrap();
        assert_eq!(global_int(&vm, 1), 1234);

        let mut dump = Vec::new();
        vm.data_dump(&mut dump).unwrap();
        let dump = String::from_utf8(dump).unwrap();
        assert!(dump.contains("size=8"));
    }

    #[test]
    fn test_coercion_scratch_conventions() {
        let mut vm = vm_for_exec();
        // real gri1 -> rr0; intg rr0 -> ri0; mov gri2, ri0
        emit(
            &mut vm,
            Instr::new(Op::MovI)
                .arg(ArgMode::GlobalReg, 1)
                .arg(ArgMode::Imm, 9),
        );
        emit(
            &mut vm,
            Instr::new(Op::RealI).arg(ArgMode::GlobalReg, 1),
        );
        emit(
            &mut vm,
            Instr::new(Op::IntgR).arg(ArgMode::LocalReg, 0),
        );
        emit(
            &mut vm,
            Instr::new(Op::MovI)
                .arg(ArgMode::GlobalReg, 2)
                .arg(ArgMode::LocalReg, 0),
        );
        emit(&mut vm, Instr::new(Op::Ret));
        let call = install(&mut vm, "coerce");
        vm.execute(call).unwrap();
        assert_eq!(global_int(&vm, 2), 9);
    }

    #[test]
    fn test_real_immediate_payload() {
        let mut vm = vm_for_exec();
        emit(
            &mut vm,
            Instr::new(Op::MovRImm)
                .arg(ArgMode::GlobalReg, 1)
                .real(2.5),
        );
        emit(&mut vm, Instr::new(Op::Ret));
        let call = install(&mut vm, "realimm");
        vm.execute(call).unwrap();
        assert_eq!(
            vm.global_get(RegClass::Real, 1).unwrap(),
            Value::Real(2.5)
        );
    }

    #[test]
    fn test_disassemble_listing() {
        let mut vm = vm_for_exec();
        fn nop(_vm: &mut Vm) -> Result<(), ExecError> {
            Ok(())
        }
        let host = vm.procs_mut().install_host(nop, "print", "");
        emit(
            &mut vm,
            Instr::new(Op::MovI)
                .arg(ArgMode::LocalReg, 0)
                .arg(ArgMode::Imm, 5),
        );
        emit(
            &mut vm,
            Instr::new(Op::Call).arg(ArgMode::Imm, host as i32),
        );
        emit(&mut vm, Instr::new(Op::Jmp).arg(ArgMode::Imm, -2));
        emit(&mut vm, Instr::new(Op::Ret));

        let target = vm.procs().target_get();
        let code = vm.procs().proc(target).code().to_vec();
        let mut listing = Vec::new();
        vm.disassemble(&code, &mut listing).unwrap();
        let listing = String::from_utf8(listing).unwrap();

        assert!(listing.contains("mov ri0, 5"));
        // The call operand carries the installed name
        assert!(listing.contains("call 1('print')"));
        // The jump prints its absolute byte target: (2 - 2) * 4 = 0
        assert!(listing.contains("jmp 0"));
        assert!(listing.contains("ret"));
    }

    #[test]
    fn test_infinite_recursion_is_caught() {
        let mut vm = vm_for_exec();
        let reserved = vm.procs_mut().install_undefined("self");
        emit(
            &mut vm,
            Instr::new(Op::Call).arg(ArgMode::Imm, reserved as i32),
        );
        let target = vm.procs().target_get();
        vm.procs_mut().define_code(reserved, target).unwrap();
        assert_eq!(
            vm.execute(reserved),
            Err(ExecError::CallDepthExceeded)
        );
    }
}
