//! Occupation tracking for the registers and variables a front end uses
//! while emitting code. Two arenas are kept: a stack of per-scope frames
//! (pushed and popped together with the scope stack of the language) and a
//! global arena for globals. Within a frame every register class is tracked
//! independently.
//!
//! Registers are compiler-chosen temporaries and live in plain slot-reusing
//! pools. Variables are assignment targets and are trickier: a variable
//! released in a deep scope must not leak its index to an outer scope, so
//! their free lists are gated by the scope level recorded at occupation
//! time. Slot 0 of every class is never issued; the VM reserves it as a
//! scratch slot.

use crate::{consts::NUM_REG_CLASSES, error::RegError, pool::Pool};
use serde::Serialize;
use std::fmt::{self, Display, Formatter};

/// The register classes of the VM. Every register bank, every occupation
/// table and every opcode payload is keyed by one of these.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum RegClass {
    Char,
    Int,
    Real,
    Point,
    Obj,
}

impl RegClass {
    /// All classes, in canonical order. The order matters: procedure
    /// prologues emit one `new*` instruction per class in this order.
    pub const ALL: [RegClass; NUM_REG_CLASSES] = [
        RegClass::Char,
        RegClass::Int,
        RegClass::Real,
        RegClass::Point,
        RegClass::Obj,
    ];

    /// Position of this class in [Self::ALL].
    pub fn index(self) -> usize {
        match self {
            RegClass::Char => 0,
            RegClass::Int => 1,
            RegClass::Real => 2,
            RegClass::Point => 3,
            RegClass::Obj => 4,
        }
    }

    /// Inverse of [Self::index].
    pub fn from_index(index: usize) -> Option<Self> {
        RegClass::ALL.get(index).copied()
    }

    /// The single-character tag used by the operand syntax (`ri2`, `vp1`).
    pub fn tag(self) -> char {
        match self {
            RegClass::Char => 'c',
            RegClass::Int => 'i',
            RegClass::Real => 'r',
            RegClass::Point => 'p',
            RegClass::Obj => 'o',
        }
    }

    /// Byte size of one slot of this class, as stored in objects and the
    /// data segment.
    pub fn size(self) -> usize {
        match self {
            RegClass::Char => 1,
            RegClass::Int => 8,
            RegClass::Real => 8,
            RegClass::Point => 16,
            RegClass::Obj => 8,
        }
    }
}

impl Display for RegClass {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            RegClass::Char => "char",
            RegClass::Int => "int",
            RegClass::Real => "real",
            RegClass::Point => "point",
            RegClass::Obj => "obj",
        };
        write!(f, "{}", name)
    }
}

/// One entry of a variable table. Vacant entries thread the level-gated
/// free list.
#[derive(Copy, Clone, Debug)]
struct VarItem {
    /// Scope level recorded at the last occupation
    level: u32,
    state: VarState,
}

#[derive(Copy, Clone, Debug)]
enum VarState {
    Occupied,
    Free { next: Option<usize> },
}

/// The occupation table for the variables of one register class. Unlike the
/// plain pool, reuse is gated: a free slot is only reissued to requests at
/// the same or a deeper scope level than the one it was occupied at.
#[derive(Clone, Debug, Default)]
struct VarTable {
    items: Vec<VarItem>,
    free_head: Option<usize>,
    /// Highest index ever issued
    max: u32,
}

impl VarTable {
    /// Issue a variable number for the given scope level. Walks the free
    /// list for a slot whose recorded level does not exceed `level`; if
    /// none qualifies a fresh slot is created.
    fn occupy(&mut self, level: u32) -> u32 {
        let mut prev: Option<usize> = None;
        let mut cur = self.free_head;
        while let Some(pos) = cur {
            let (item_level, next) = match self.items[pos] {
                VarItem {
                    level,
                    state: VarState::Free { next },
                } => (level, next),
                // The free list only ever links free items
                _ => panic!("occupied variable on free list"),
            };
            if item_level <= level {
                match prev {
                    None => self.free_head = next,
                    Some(p) => {
                        self.items[p].state = VarState::Free { next };
                    }
                }
                self.items[pos] = VarItem {
                    level,
                    state: VarState::Occupied,
                };
                return (pos + 1) as u32;
            }
            prev = cur;
            cur = next;
        }

        // Nothing on the free list qualifies at this level
        self.items.push(VarItem {
            level,
            state: VarState::Occupied,
        });
        let index = self.items.len() as u32;
        self.max = self.max.max(index);
        index
    }

    /// Return a variable number to the free list. The slot keeps the level
    /// of its last occupation, which is what gates future reuse.
    fn release(&mut self, index: u32) -> Result<(), u32> {
        let pos = match index {
            0 => return Err(index),
            i if (i as usize) > self.items.len() => return Err(index),
            i => (i - 1) as usize,
        };
        match self.items[pos].state {
            VarState::Occupied => {
                self.items[pos].state = VarState::Free {
                    next: self.free_head,
                };
                self.free_head = Some(pos);
                Ok(())
            }
            VarState::Free { .. } => Err(index),
        }
    }

    fn num(&self) -> u32 {
        self.max
    }
}

/// Occupation state for one scope frame: a register pool and a variable
/// table per class.
#[derive(Clone, Debug, Default)]
struct RegFrame {
    regs: [Pool<()>; NUM_REG_CLASSES],
    vars: [VarTable; NUM_REG_CLASSES],
}

/// Per-class counts of variables and registers ever used by a frame. This
/// is what the procedure-header fixup feeds to the `new*` prologue.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RegCounts {
    pub num_var: [u32; NUM_REG_CLASSES],
    pub num_reg: [u32; NUM_REG_CLASSES],
}

/// The register/variable allocator: a stack of scope frames plus the global
/// arena.
#[derive(Clone, Debug)]
pub struct RegAlloc {
    frames: Vec<RegFrame>,
    gvars: [VarTable; NUM_REG_CLASSES],
}

impl RegAlloc {
    /// Create an allocator with one (outermost) frame already pushed.
    pub fn new() -> Self {
        Self {
            frames: vec![RegFrame::default()],
            gvars: Default::default(),
        }
    }

    /// Push a fresh frame. Paired with [Self::frame_pop] around each
    /// procedure the front end compiles.
    pub fn frame_push(&mut self) {
        self.frames.push(RegFrame::default());
    }

    /// Pop the top frame, discarding its occupation state.
    pub fn frame_pop(&mut self) {
        self.frames.pop();
        // An unbalanced pop is a front-end bug, not a user error
        assert!(!self.frames.is_empty(), "popped the outermost frame");
    }

    /// Current frame-stack depth.
    pub fn frame_depth(&self) -> usize {
        self.frames.len()
    }

    fn frame(&self) -> &RegFrame {
        self.frames.last().unwrap()
    }

    fn frame_mut(&mut self) -> &mut RegFrame {
        self.frames.last_mut().unwrap()
    }

    /// Occupy a register of the given class in the top frame. The returned
    /// number is always >= 1.
    pub fn reg_occupy(&mut self, class: RegClass) -> u32 {
        self.frame_mut().regs[class.index()].occupy(()) as u32
    }

    /// Release a register previously returned by [Self::reg_occupy].
    pub fn reg_release(
        &mut self,
        class: RegClass,
        index: u32,
    ) -> Result<(), RegError> {
        self.frame_mut().regs[class.index()]
            .release(index as usize)
            .map_err(|_| RegError::RegNotOccupied { class, index })
    }

    /// Highest register number issued so far in the top frame.
    pub fn reg_num(&self, class: RegClass) -> u32 {
        self.frame().regs[class.index()].max_index() as u32
    }

    /// Occupy a variable of the given class at the given scope level in the
    /// top frame. The returned number is always >= 1; callers render it as
    /// a negative slot index in operands.
    pub fn var_occupy(&mut self, class: RegClass, level: u32) -> u32 {
        self.frame_mut().vars[class.index()].occupy(level)
    }

    /// Release a variable previously returned by [Self::var_occupy]. Reuse
    /// of the released number stays gated by the level it was occupied at.
    pub fn var_release(
        &mut self,
        class: RegClass,
        index: u32,
    ) -> Result<(), RegError> {
        self.frame_mut().vars[class.index()]
            .release(index)
            .map_err(|index| RegError::VarNotOccupied { class, index })
    }

    /// Highest variable number issued so far in the top frame.
    pub fn var_num(&self, class: RegClass) -> u32 {
        self.frame().vars[class.index()].num()
    }

    /// Occupy a global variable. Globals live outside the frame stack and
    /// behave like frame variables at level 0.
    pub fn gvar_occupy(&mut self, class: RegClass) -> u32 {
        self.gvars[class.index()].occupy(0)
    }

    /// Release a global variable.
    pub fn gvar_release(
        &mut self,
        class: RegClass,
        index: u32,
    ) -> Result<(), RegError> {
        self.gvars[class.index()]
            .release(index)
            .map_err(|index| RegError::VarNotOccupied { class, index })
    }

    /// Highest global variable number issued so far.
    pub fn gvar_num(&self, class: RegClass) -> u32 {
        self.gvars[class.index()].num()
    }

    /// Snapshot the per-class counts of the top frame, for the procedure
    /// prologue fixup.
    pub fn counts(&self) -> RegCounts {
        let mut counts = RegCounts::default();
        for class in RegClass::ALL.iter() {
            counts.num_var[class.index()] = self.var_num(*class);
            counts.num_reg[class.index()] = self.reg_num(*class);
        }
        counts
    }
}

impl Default for RegAlloc {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reg_lifo_reuse() {
        let mut ra = RegAlloc::new();
        assert_eq!(ra.reg_occupy(RegClass::Int), 1);
        assert_eq!(ra.reg_occupy(RegClass::Int), 2);
        assert_eq!(ra.reg_occupy(RegClass::Int), 3);
        // Classes are independent
        assert_eq!(ra.reg_occupy(RegClass::Real), 1);

        ra.reg_release(RegClass::Int, 2).unwrap();
        assert_eq!(ra.reg_occupy(RegClass::Int), 2);
        assert_eq!(ra.reg_num(RegClass::Int), 3);
    }

    #[test]
    fn test_reg_release_errors() {
        let mut ra = RegAlloc::new();
        ra.reg_occupy(RegClass::Obj);
        assert_eq!(
            ra.reg_release(RegClass::Obj, 5),
            Err(RegError::RegNotOccupied {
                class: RegClass::Obj,
                index: 5
            })
        );
        ra.reg_release(RegClass::Obj, 1).unwrap();
        assert!(ra.reg_release(RegClass::Obj, 1).is_err());
    }

    #[test]
    fn test_var_level_gate() {
        let mut ra = RegAlloc::new();
        let v = ra.var_occupy(RegClass::Int, 3);
        assert_eq!(v, 1);
        ra.var_release(RegClass::Int, v).unwrap();

        // An outer scope must not see the released number...
        assert_eq!(ra.var_occupy(RegClass::Int, 2), 2);
        // ...but the same or a deeper scope may
        assert_eq!(ra.var_occupy(RegClass::Int, 3), 1);
        assert_eq!(ra.var_occupy(RegClass::Int, 4), 3);
        ra.var_release(RegClass::Int, 1).unwrap();
        assert_eq!(ra.var_occupy(RegClass::Int, 5), 1);
    }

    #[test]
    fn test_var_num_counts_peak() {
        let mut ra = RegAlloc::new();
        let a = ra.var_occupy(RegClass::Real, 1);
        let b = ra.var_occupy(RegClass::Real, 1);
        ra.var_release(RegClass::Real, a).unwrap();
        ra.var_release(RegClass::Real, b).unwrap();
        assert_eq!(ra.var_num(RegClass::Real), 2);
        assert_eq!(ra.reg_num(RegClass::Real), 0);
    }

    #[test]
    fn test_frames_are_independent() {
        let mut ra = RegAlloc::new();
        ra.reg_occupy(RegClass::Int);
        ra.reg_occupy(RegClass::Int);

        ra.frame_push();
        assert_eq!(ra.reg_num(RegClass::Int), 0);
        assert_eq!(ra.reg_occupy(RegClass::Int), 1);
        ra.frame_pop();

        assert_eq!(ra.reg_num(RegClass::Int), 2);
        assert_eq!(ra.reg_occupy(RegClass::Int), 3);
    }

    #[test]
    fn test_gvar_arena() {
        let mut ra = RegAlloc::new();
        assert_eq!(ra.gvar_occupy(RegClass::Obj), 1);
        assert_eq!(ra.gvar_occupy(RegClass::Obj), 2);
        ra.gvar_release(RegClass::Obj, 1).unwrap();
        assert_eq!(ra.gvar_occupy(RegClass::Obj), 1);
        assert_eq!(ra.gvar_num(RegClass::Obj), 2);
        // Frame churn doesn't touch the global arena
        ra.frame_push();
        assert_eq!(ra.gvar_num(RegClass::Obj), 2);
        ra.frame_pop();
    }

    #[test]
    fn test_counts_snapshot() {
        let mut ra = RegAlloc::new();
        ra.reg_occupy(RegClass::Int);
        ra.reg_occupy(RegClass::Int);
        ra.reg_occupy(RegClass::Int);
        ra.var_occupy(RegClass::Int, 1);
        ra.var_occupy(RegClass::Int, 1);
        let counts = ra.counts();
        assert_eq!(counts.num_reg[RegClass::Int.index()], 3);
        assert_eq!(counts.num_var[RegClass::Int.index()], 2);
        assert_eq!(counts.num_reg[RegClass::Char.index()], 0);
    }
}
