//! The procedure tables: a slot-reusing pool of procedures under
//! construction (each a growable code buffer the codec writes into) and the
//! dense table of installed procedures the `call` instruction indexes by
//! call number.
//!
//! One construction-pool procedure is reserved as the *scratch* procedure:
//! reference resolvers assemble replacement code there and splice it back
//! into place, so offsets in the real buffers never move.

use crate::{
    error::{ExecError, LinkError, PoolError},
    instr::Word,
    machine::Vm,
    pool::Pool,
};
use std::rc::Rc;

/// Identifier of a procedure under construction (a pool index).
pub type ProcId = usize;

/// Index into the installed-procedure table; the integer operand of the
/// `call` instruction. 1-based.
pub type CallNum = u32;

/// A host function installed as a procedure.
pub type HostFn = fn(&mut Vm) -> Result<(), ExecError>;

/// A procedure under construction: status flags plus the code buffer the
/// codec appends to.
#[derive(Clone, Debug, Default)]
pub struct Proc {
    /// An emission error has been recorded against this procedure
    pub error: bool,
    /// Suppress further emission (set by front ends after an error)
    pub inhibit: bool,
    code: Vec<Word>,
}

impl Proc {
    pub fn code(&self) -> &[Word] {
        &self.code
    }

    pub(crate) fn code_mut(&mut self) -> &mut Vec<Word> {
        &mut self.code
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }
}

/// What an installed call number dispatches to.
#[derive(Clone)]
pub enum ProcBody {
    /// Bytecode, frozen at install time. Shared so the VM can execute it
    /// without borrowing the table.
    VmCode(Rc<[Word]>),
    /// A host function
    Host(HostFn),
    /// Reserved, to be supplied later via `define_*`
    Undefined,
}

impl std::fmt::Debug for ProcBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcBody::VmCode(code) => {
                write!(f, "VmCode({} words)", code.len())
            }
            ProcBody::Host(_) => write!(f, "Host(..)"),
            ProcBody::Undefined => write!(f, "Undefined"),
        }
    }
}

/// An installed procedure: the body plus the metadata the disassembler and
/// the `call` operand printer show.
#[derive(Clone, Debug)]
pub struct Installed {
    pub body: ProcBody,
    pub name: Option<String>,
    pub desc: Option<String>,
}

/// The two procedure tables, embedded in the VM.
#[derive(Debug)]
pub struct ProcTable {
    pool: Pool<Proc>,
    installed: Vec<Installed>,
    target: ProcId,
    scratch: ProcId,
}

impl ProcTable {
    pub(crate) fn new() -> Self {
        let mut pool = Pool::new();
        let scratch = pool.occupy(Proc::default());
        Self {
            pool,
            installed: Vec::new(),
            // No target until the VM selects one
            target: 0,
            scratch,
        }
    }

    /// Create a fresh procedure in the construction pool.
    pub fn code_new(&mut self) -> ProcId {
        self.pool.occupy(Proc::default())
    }

    /// Destroy a construction-pool procedure, discarding its buffer.
    pub fn code_destroy(&mut self, id: ProcId) -> Result<(), PoolError> {
        assert_ne!(id, self.scratch, "cannot destroy the scratch procedure");
        if self.target == id {
            self.target = 0;
        }
        self.pool.release(id).map(drop)
    }

    /// Select the procedure that receives codec output.
    pub fn target_set(&mut self, id: ProcId) -> Result<(), PoolError> {
        // Validate before switching
        self.pool.get(id)?;
        self.target = id;
        Ok(())
    }

    /// The current write target.
    pub fn target_get(&self) -> ProcId {
        self.target
    }

    /// Restore a previously-saved write target without validating it
    /// against the pool, since a saved value may be the sentinel `0`
    /// meaning "no target selected".
    pub(crate) fn target_restore(&mut self, id: ProcId) {
        self.target = id;
    }

    /// The reserved scratch procedure.
    pub fn scratch(&self) -> ProcId {
        self.scratch
    }

    pub(crate) fn proc(&self, id: ProcId) -> &Proc {
        self.pool
            .get(id)
            .unwrap_or_else(|_| panic!("dangling procedure id {}", id))
    }

    pub(crate) fn proc_mut(&mut self, id: ProcId) -> &mut Proc {
        self.pool
            .get_mut(id)
            .unwrap_or_else(|_| panic!("dangling procedure id {}", id))
    }

    /// The target procedure. Panics if no target was ever selected, which
    /// is a sequencing bug in the caller.
    pub fn target(&self) -> &Proc {
        assert_ne!(self.target, 0, "no target procedure selected");
        self.proc(self.target)
    }

    pub(crate) fn target_mut(&mut self) -> &mut Proc {
        assert_ne!(self.target, 0, "no target procedure selected");
        self.proc_mut(self.target)
    }

    /// Current write position (in words) inside the target procedure.
    pub fn position(&self) -> usize {
        self.target().len()
    }

    /// Remove all code from a construction-pool procedure.
    pub fn clear(&mut self, id: ProcId) {
        self.proc_mut(id).code.clear();
    }

    /// Freeze a construction-pool procedure into the installed table and
    /// return its call number. The construction slot stays alive but
    /// empty, ready for reuse.
    pub fn install_code(
        &mut self,
        id: ProcId,
        name: &str,
        desc: &str,
    ) -> CallNum {
        let code = std::mem::take(&mut self.proc_mut(id).code);
        self.push_installed(Installed {
            body: ProcBody::VmCode(code.into()),
            name: Some(name.to_owned()),
            desc: Some(desc.to_owned()),
        })
    }

    /// Install a host function under a fresh call number.
    pub fn install_host(
        &mut self,
        host: HostFn,
        name: &str,
        desc: &str,
    ) -> CallNum {
        self.push_installed(Installed {
            body: ProcBody::Host(host),
            name: Some(name.to_owned()),
            desc: Some(desc.to_owned()),
        })
    }

    /// Reserve a call number whose body will be supplied later.
    pub fn install_undefined(&mut self, name: &str) -> CallNum {
        self.push_installed(Installed {
            body: ProcBody::Undefined,
            name: Some(name.to_owned()),
            desc: None,
        })
    }

    fn push_installed(&mut self, installed: Installed) -> CallNum {
        self.installed.push(installed);
        self.installed.len() as CallNum
    }

    /// Supply the bytecode body of a call number reserved with
    /// [Self::install_undefined].
    pub fn define_code(
        &mut self,
        call_num: CallNum,
        id: ProcId,
    ) -> Result<(), LinkError> {
        let code = std::mem::take(&mut self.proc_mut(id).code);
        self.define(call_num, ProcBody::VmCode(code.into()))
    }

    /// Supply a host-function body for a reserved call number.
    pub fn define_host(
        &mut self,
        call_num: CallNum,
        host: HostFn,
    ) -> Result<(), LinkError> {
        self.define(call_num, ProcBody::Host(host))
    }

    fn define(
        &mut self,
        call_num: CallNum,
        body: ProcBody,
    ) -> Result<(), LinkError> {
        let slot = self
            .installed
            .get_mut(call_num.wrapping_sub(1) as usize)
            .ok_or(LinkError::BadCallNumber(call_num))?;
        match slot.body {
            ProcBody::Undefined => {
                slot.body = body;
                Ok(())
            }
            _ => Err(LinkError::NotUndefined(call_num)),
        }
    }

    /// Look up an installed procedure by call number.
    pub fn installed(&self, call_num: CallNum) -> Result<&Installed, LinkError> {
        self.installed
            .get(call_num.wrapping_sub(1) as usize)
            .ok_or(LinkError::BadCallNumber(call_num))
    }

    /// Number of installed procedures; also the highest valid call number.
    pub fn installed_count(&self) -> usize {
        self.installed.len()
    }

    /// Call numbers that were reserved but never defined. Used by the link
    /// check before execution.
    pub fn undefined_calls(&self) -> Vec<CallNum> {
        self.installed
            .iter()
            .enumerate()
            .filter_map(|(i, p)| match p.body {
                ProcBody::Undefined => Some((i + 1) as CallNum),
                _ => None,
            })
            .collect()
    }
}
